//! Real-space electric field of the permanent multipoles.
//!
//! Produces two accumulated fields per site: the d-masked field that seeds
//! the induced dipoles, and the p-masked field behind the energy-conjugate
//! (CR) dipole set. Each pair contributes the Ewald-screened field minus the
//! portion already excluded by Thole damping and covalent masking.

use nalgebra::{Matrix3, Vector3};
use tracing::instrument;

use crate::core::models::multipole::{dipole, quadrupole_third, MultipoleTensor, T000};
use crate::engine::parallel::{self, merge_vec};

use super::{PairTensors, RealSpaceContext};

pub(crate) struct FieldAccum {
    pub field: Vec<Vector3<f64>>,
    pub field_cr: Vec<Vector3<f64>>,
}

impl FieldAccum {
    fn zeros(n: usize) -> Self {
        Self {
            field: vec![Vector3::zeros(); n],
            field_cr: vec![Vector3::zeros(); n],
        }
    }

    fn merge(self, other: Self) -> Self {
        Self {
            field: merge_vec(self.field, other.field),
            field_cr: merge_vec(self.field_cr, other.field_cr),
        }
    }
}

pub(crate) struct Site {
    pub c: f64,
    pub d: Vector3<f64>,
    /// Traceless quadrupole with the one-third convention folded in.
    pub q: Matrix3<f64>,
}

pub(crate) fn site(m: &MultipoleTensor) -> Site {
    Site {
        c: m[T000],
        d: dipole(m),
        q: quadrupole_third(m),
    }
}

/// Field pair (at i due to k, at k due to i) for one kernel triple.
fn pair_fields(
    si: &Site,
    sk: &Site,
    rvec: &Vector3<f64>,
    b1: f64,
    b2: f64,
    b3: f64,
) -> (Vector3<f64>, Vector3<f64>) {
    let qir = si.q * rvec;
    let qkr = sk.q * rvec;
    let dir = si.d.dot(rvec);
    let dkr = sk.d.dot(rvec);
    let qirr = qir.dot(rvec);
    let qkrr = qkr.dot(rvec);
    let at_i = -rvec * (b1 * sk.c - b2 * dkr + b3 * qkrr) - b1 * sk.d + 2.0 * b2 * qkr;
    let at_k = rvec * (b1 * si.c + b2 * dir + b3 * qirr) - b1 * si.d - 2.0 * b2 * qir;
    (at_i, at_k)
}

#[instrument(skip_all, name = "permanent_field_region")]
pub(crate) fn run(ctx: &RealSpaceContext) -> FieldAccum {
    let n = ctx.n_atoms();
    parallel::region(
        n,
        |range| {
            let mut acc = FieldAccum::zeros(n);
            let mut maskd = vec![1.0; n];
            let mut maskp = vec![1.0; n];
            asymmetric_unit(ctx, range.clone(), &mut acc, &mut maskd, &mut maskp);
            symmetry_mates(ctx, range, &mut acc);
            acc
        },
        FieldAccum::merge,
    )
    .unwrap_or_else(|| FieldAccum::zeros(n))
}

fn asymmetric_unit(
    ctx: &RealSpaceContext,
    range: std::ops::Range<usize>,
    acc: &mut FieldAccum,
    maskd: &mut [f64],
    maskp: &mut [f64],
) {
    let topology = ctx.system.topology();
    let crystal = ctx.system.crystal();
    let atoms = ctx.system.atoms();
    let coords = &ctx.coordinates[0];
    let mpoles = &ctx.global_mpole[0];
    let p = ctx.params;

    for i in range {
        if !ctx.use_flags[i] {
            continue;
        }
        // Temporary polarization masks around atom i.
        for &k in topology.n14(i) {
            if topology.ip11(i).contains(&k) {
                maskp[k] = 0.5;
            }
        }
        for &k in topology.n13(i) {
            maskp[k] = p.polar_13_scale;
        }
        for &k in topology.n12(i) {
            maskp[k] = p.polar_12_scale;
        }
        for &k in topology.ip11(i) {
            maskd[k] = p.direct_11_scale;
        }

        let si = site(&mpoles[i]);
        let (pdi, pti) = (atoms[i].pdamp, atoms[i].thole);

        for &k in ctx.neighbor_lists.neighbors(0, i) {
            if !ctx.use_flags[k] {
                continue;
            }
            let mut rvec = coords[k] - coords[i];
            let r2 = crystal.image(&mut rvec);
            if r2 > ctx.ewald.off2 {
                continue;
            }
            let sk = site(&mpoles[k]);
            let t = PairTensors::new(
                &rvec,
                r2,
                ctx.ewald,
                pdi * atoms[k].pdamp,
                pti.min(atoms[k].thole),
                false,
            );
            let (fim, fkm) = pair_fields(&si, &sk, &rvec, t.bn[1], t.bn[2], t.bn[3]);

            let (rr3, rr5, rr7) = (t.rr[1], t.rr[2], t.rr[3]);
            let drr3 = (1.0 - t.scale3 * maskd[k]) * rr3;
            let drr5 = (1.0 - t.scale5 * maskd[k]) * rr5;
            let drr7 = (1.0 - t.scale7 * maskd[k]) * rr7;
            let (fid, fkd) = pair_fields(&si, &sk, &rvec, drr3, drr5, drr7);
            let prr3 = (1.0 - t.scale3 * maskp[k]) * rr3;
            let prr5 = (1.0 - t.scale5 * maskp[k]) * rr5;
            let prr7 = (1.0 - t.scale7 * maskp[k]) * rr7;
            let (fip, fkp) = pair_fields(&si, &sk, &rvec, prr3, prr5, prr7);

            acc.field[i] += fim - fid;
            acc.field[k] += fkm - fkd;
            acc.field_cr[i] += fim - fip;
            acc.field_cr[k] += fkm - fkp;
        }

        // Restore the masks before yielding atom i.
        for &k in topology.n14(i) {
            maskp[k] = 1.0;
        }
        for &k in topology.n13(i) {
            maskp[k] = 1.0;
        }
        for &k in topology.n12(i) {
            maskp[k] = 1.0;
        }
        for &k in topology.ip11(i) {
            maskd[k] = 1.0;
        }
    }
}

fn symmetry_mates(ctx: &RealSpaceContext, range: std::ops::Range<usize>, acc: &mut FieldAccum) {
    let crystal = ctx.system.crystal();
    let atoms = ctx.system.atoms();
    let base = &ctx.coordinates[0];

    for s in 1..ctx.n_symm {
        let coords = &ctx.coordinates[s];
        let mpoles = &ctx.global_mpole[s];
        for i in range.clone() {
            if !ctx.use_flags[i] {
                continue;
            }
            let si = site(&ctx.global_mpole[0][i]);
            let (pdi, pti) = (atoms[i].pdamp, atoms[i].thole);
            for &k in ctx.neighbor_lists.neighbors(s, i) {
                if !ctx.use_flags[k] {
                    continue;
                }
                let mut rvec = coords[k] - base[i];
                let r2 = crystal.image(&mut rvec);
                if r2 > ctx.ewald.off2 {
                    continue;
                }
                let self_scale = if i == k { 0.5 } else { 1.0 };
                let sk = site(&mpoles[k]);
                let t = PairTensors::new(
                    &rvec,
                    r2,
                    ctx.ewald,
                    pdi * atoms[k].pdamp,
                    pti.min(atoms[k].thole),
                    false,
                );
                let (fim, fkm) = pair_fields(&si, &sk, &rvec, t.bn[1], t.bn[2], t.bn[3]);
                let drr3 = (1.0 - t.scale3) * t.rr[1];
                let drr5 = (1.0 - t.scale5) * t.rr[2];
                let drr7 = (1.0 - t.scale7) * t.rr[3];
                let (fid, fkd) = pair_fields(&si, &sk, &rvec, drr3, drr5, drr7);

                let fi = self_scale * (fim - fid);
                acc.field[i] += fi;
                acc.field_cr[i] += fi;
                let fk = crystal.apply_inverse_sym_rot(s, &(self_scale * (fkm - fkd)));
                acc.field[k] += fk;
                acc.field_cr[k] += fk;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::models::atom::Atom;
    use crate::core::models::crystal::Crystal;
    use crate::core::models::multipole::{T001, T100};
    use crate::core::models::system::{MolecularSystem, NeighborLists};
    use crate::engine::config::EwaldParameters;
    use approx::assert_relative_eq;

    fn two_site_context(
        m0: MultipoleTensor,
        m1: MultipoleTensor,
        separation: f64,
    ) -> (MolecularSystem, NeighborLists, Vec<Vec<Vector3<f64>>>, Vec<Vec<MultipoleTensor>>) {
        let atoms = vec![
            Atom::new(Vector3::zeros(), 0),
            Atom::new(Vector3::new(separation, 0.0, 0.0), 1),
        ];
        let system = MolecularSystem::new(atoms, Crystal::aperiodic(), &[]);
        let lists = NeighborLists::all_pairs(2, 1);
        let coords = vec![vec![Vector3::zeros(), Vector3::new(separation, 0.0, 0.0)]];
        let mpoles = vec![vec![m0, m1]];
        (system, lists, coords, mpoles)
    }

    #[test]
    fn point_charge_field_follows_coulomb_law() {
        let mut m1 = [0.0; 10];
        m1[T000] = 1.0;
        let (system, lists, coords, mpoles) = two_site_context([0.0; 10], m1, 4.0);
        let params = crate::core::forcefield::params::ElectrostaticsParams::default();
        let ewald = EwaldParameters::new(20.0, 0.0);
        let ctx = RealSpaceContext {
            system: &system,
            neighbor_lists: &lists,
            coordinates: &coords,
            global_mpole: &mpoles,
            use_flags: &[true, true],
            ewald: &ewald,
            params: &params,
            n_symm: 1,
        };
        let acc = run(&ctx);
        // Field at the origin from a unit charge 4 Å down +x points toward -x.
        assert_relative_eq!(acc.field[0].x, -1.0 / 16.0, epsilon = 1e-12);
        assert_relative_eq!(acc.field[0].y, 0.0, epsilon = 1e-14);
        // Field at the charge from the (empty) origin site is zero.
        assert_relative_eq!(acc.field[1].norm(), 0.0, epsilon = 1e-14);
    }

    #[test]
    fn dipole_field_on_axis_matches_closed_form() {
        let mut m1 = [0.0; 10];
        m1[T100] = 0.3;
        let (system, lists, coords, mpoles) = two_site_context([0.0; 10], m1, 3.0);
        let params = crate::core::forcefield::params::ElectrostaticsParams::default();
        let ewald = EwaldParameters::new(20.0, 0.0);
        let ctx = RealSpaceContext {
            system: &system,
            neighbor_lists: &lists,
            coordinates: &coords,
            global_mpole: &mpoles,
            use_flags: &[true, true],
            ewald: &ewald,
            params: &params,
            n_symm: 1,
        };
        let acc = run(&ctx);
        // On-axis dipole field: E = 2 m / r³ along the dipole direction.
        assert_relative_eq!(acc.field[0].x, 2.0 * 0.3 / 27.0, epsilon = 1e-12);
        assert_relative_eq!(acc.field[0].z, 0.0, epsilon = 1e-14);
    }

    #[test]
    fn masked_fields_differ_only_when_masks_differ() {
        let mut m0 = [0.0; 10];
        m0[T001] = 0.2;
        let mut m1 = [0.0; 10];
        m1[T000] = -0.5;
        let (system, lists, coords, mpoles) = two_site_context(m0, m1, 2.5);
        let params = crate::core::forcefield::params::ElectrostaticsParams::default();
        let ewald = EwaldParameters::new(20.0, 0.0);
        let ctx = RealSpaceContext {
            system: &system,
            neighbor_lists: &lists,
            coordinates: &coords,
            global_mpole: &mpoles,
            use_flags: &[true, true],
            ewald: &ewald,
            params: &params,
            n_symm: 1,
        };
        let acc = run(&ctx);
        // Unbonded atoms carry no covalent masks, so both sets agree.
        assert_relative_eq!((acc.field[0] - acc.field_cr[0]).norm(), 0.0, epsilon = 1e-14);
        assert_relative_eq!((acc.field[1] - acc.field_cr[1]).norm(), 0.0, epsilon = 1e-14);
    }
}
