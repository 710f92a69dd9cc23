//! Real-space field produced by the current induced dipoles.
//!
//! Dipole-only analogue of the permanent field kernel, evaluated once per
//! SCF iteration for both induced dipole sets. Thole damping applies through
//! fifth order; covalent masks do not apply to mutual induction.

use nalgebra::Vector3;

use crate::engine::parallel::{self, merge_vec};

use super::{PairTensors, RealSpaceContext};

pub(crate) struct MutualFieldAccum {
    pub field: Vec<Vector3<f64>>,
    pub field_cr: Vec<Vector3<f64>>,
}

impl MutualFieldAccum {
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

/// Field at the target of a dipole `u` a displacement `rvec` away, screened
/// minus Thole-excluded.
#[inline]
fn dipole_field(
    u: &Vector3<f64>,
    rvec: &Vector3<f64>,
    bn1: f64,
    bn2: f64,
    rr3: f64,
    rr5: f64,
) -> Vector3<f64> {
    let ur = u.dot(rvec);
    let screened = -bn1 * u + bn2 * ur * rvec;
    let excluded = -rr3 * u + rr5 * ur * rvec;
    screened - excluded
}

pub(crate) fn run(
    ctx: &RealSpaceContext,
    induced: &[Vec<Vector3<f64>>],
    induced_cr: &[Vec<Vector3<f64>>],
) -> MutualFieldAccum {
    let n = ctx.n_atoms();
    parallel::region(
        n,
        |range| {
            let mut acc = MutualFieldAccum::zeros(n);
            chunk(ctx, induced, induced_cr, range, &mut acc);
            acc
        },
        MutualFieldAccum::merge,
    )
    .unwrap_or_else(|| MutualFieldAccum::zeros(n))
}

fn chunk(
    ctx: &RealSpaceContext,
    induced: &[Vec<Vector3<f64>>],
    induced_cr: &[Vec<Vector3<f64>>],
    range: std::ops::Range<usize>,
    acc: &mut MutualFieldAccum,
) {
    let crystal = ctx.system.crystal();
    let atoms = ctx.system.atoms();
    let base = &ctx.coordinates[0];
    let (ind0, inp0) = (&induced[0], &induced_cr[0]);

    for s in 0..ctx.n_symm {
        let coords = &ctx.coordinates[s];
        let (inds, inps) = (&induced[s], &induced_cr[s]);
        for i in range.clone() {
            if !ctx.use_flags[i] {
                continue;
            }
            let (ui, pi) = (ind0[i], inp0[i]);
            let (pdi, pti) = (atoms[i].pdamp, atoms[i].thole);
            let mut fi = Vector3::zeros();
            let mut fi_cr = Vector3::zeros();
            for &k in ctx.neighbor_lists.neighbors(s, i) {
                if !ctx.use_flags[k] {
                    continue;
                }
                let mut rvec = coords[k] - base[i];
                let r2 = crystal.image(&mut rvec);
                if r2 > ctx.ewald.off2 {
                    continue;
                }
                let self_scale = if s > 0 && i == k { 0.5 } else { 1.0 };
                let t = PairTensors::new(
                    &rvec,
                    r2,
                    ctx.ewald,
                    pdi * atoms[k].pdamp,
                    pti.min(atoms[k].thole),
                    false,
                );
                let (bn1, bn2) = (t.bn[1], t.bn[2]);
                let rr3 = (1.0 - t.scale3) * t.rr[1];
                let rr5 = (1.0 - t.scale5) * t.rr[2];

                let (uk, pk) = (inds[k], inps[k]);
                fi += self_scale * dipole_field(&uk, &rvec, bn1, bn2, rr3, rr5);
                fi_cr += self_scale * dipole_field(&pk, &rvec, bn1, bn2, rr3, rr5);

                // Reverse contribution at the neighbor, rotated back into the
                // asymmetric unit for symmetry mates.
                let fk = self_scale * dipole_field(&ui, &rvec, bn1, bn2, rr3, rr5);
                let fk_cr = self_scale * dipole_field(&pi, &rvec, bn1, bn2, rr3, rr5);
                if s == 0 {
                    acc.field[k] += fk;
                    acc.field_cr[k] += fk_cr;
                } else {
                    acc.field[k] += crystal.apply_inverse_sym_rot(s, &fk);
                    acc.field_cr[k] += crystal.apply_inverse_sym_rot(s, &fk_cr);
                }
            }
            acc.field[i] += fi;
            acc.field_cr[i] += fi_cr;
        }
    }
}
