//! Real-space pair energies, forces, and torques.
//!
//! The permanent-permanent contraction runs through the gl0..gl8 scalar
//! products; permanent-induced and induced-induced contributions run through
//! the gli/glip family with both induced dipole sets entering at half
//! weight. Every screened term has a rational-distance counterpart that
//! subtracts whatever covalent masking and Thole damping already excluded.
//! Symmetry-mate forces and torques are accumulated image-local and mapped
//! back through the inverse symmetry rotation at reduction time.

use nalgebra::Vector3;
use tracing::instrument;

use crate::core::constants::ELECTRIC;
use crate::core::forcefield::params::Polarization;
use crate::core::models::multipole::antisym_axial;
use crate::engine::config::EvaluationConfig;
use crate::engine::lambda::LambdaState;
use crate::engine::parallel::{self, merge_vec};

use super::permanent_field::{site, Site};
use super::torque::project;
use super::{PairTensors, RealSpaceContext};

pub(crate) struct EnergyInputs<'a> {
    pub ctx: &'a RealSpaceContext<'a>,
    pub induced: &'a [Vec<Vector3<f64>>],
    pub induced_cr: &'a [Vec<Vector3<f64>>],
    pub config: &'a EvaluationConfig,
    pub lambda: Option<&'a LambdaState>,
    pub polarization: Polarization,
}

pub(crate) struct EnergyAccum {
    pub permanent_energy: f64,
    pub induced_energy: f64,
    pub interactions: usize,
    pub grad: Vec<Vector3<f64>>,
    pub torque: Vec<Vector3<f64>>,
    pub lambda_grad: Vec<Vector3<f64>>,
    pub lambda_torque: Vec<Vector3<f64>>,
    pub dudl: f64,
    pub d2udl2: f64,
}

impl EnergyAccum {
    fn zeros(n: usize) -> Self {
        Self {
            permanent_energy: 0.0,
            induced_energy: 0.0,
            interactions: 0,
            grad: vec![Vector3::zeros(); n],
            torque: vec![Vector3::zeros(); n],
            lambda_grad: vec![Vector3::zeros(); n],
            lambda_torque: vec![Vector3::zeros(); n],
            dudl: 0.0,
            d2udl2: 0.0,
        }
    }

    fn merge(mut self, other: Self) -> Self {
        self.permanent_energy += other.permanent_energy;
        self.induced_energy += other.induced_energy;
        self.interactions += other.interactions;
        self.grad = merge_vec(self.grad, other.grad);
        self.torque = merge_vec(self.torque, other.torque);
        self.lambda_grad = merge_vec(self.lambda_grad, other.lambda_grad);
        self.lambda_torque = merge_vec(self.lambda_torque, other.lambda_torque);
        self.dudl += other.dudl;
        self.d2udl2 += other.d2udl2;
        self
    }
}

#[instrument(skip_all, name = "real_space_energy_region")]
pub(crate) fn run(inputs: &EnergyInputs) -> EnergyAccum {
    let n = inputs.ctx.n_atoms();
    parallel::region(n, |range| chunk(inputs, range), EnergyAccum::merge)
        .unwrap_or_else(|| EnergyAccum::zeros(n))
}

fn chunk(inputs: &EnergyInputs, range: std::ops::Range<usize>) -> EnergyAccum {
    let ctx = inputs.ctx;
    let n = ctx.n_atoms();
    let cfg = inputs.config;
    let topology = ctx.system.topology();
    let crystal = ctx.system.crystal();
    let atoms = ctx.system.atoms();
    let p = ctx.params;
    let base = &ctx.coordinates[0];

    let mut acc = EnergyAccum::zeros(n);
    let mut maskm = vec![1.0; n];
    let mut maskp = vec![1.0; n];
    let mut maskd = vec![1.0; n];

    for s in 0..ctx.n_symm {
        let coords = &ctx.coordinates[s];
        let mpoles = &ctx.global_mpole[s];
        let (inds, inps) = (&inputs.induced[s], &inputs.induced_cr[s]);

        // Symmetry-mate accumulators, reduced after the chunk.
        let mut grad_k = vec![Vector3::zeros(); n];
        let mut torque_k = vec![Vector3::zeros(); n];
        let mut lambda_grad_k = vec![Vector3::zeros(); n];
        let mut lambda_torque_k = vec![Vector3::zeros(); n];

        for i in range.clone() {
            if !ctx.use_flags[i] {
                continue;
            }
            if s == 0 {
                set_masks(topology, p, i, &mut maskm, &mut maskp, &mut maskd);
            }
            let si = site(&ctx.global_mpole[0][i]);
            let ui = inputs.induced[0][i];
            let pi = inputs.induced_cr[0][i];
            let (pdi, pti) = (atoms[i].pdamp, atoms[i].thole);
            let soft_row = inputs
                .lambda
                .map(|l| if l.is_soft[i] { &l.soft_core[1] } else { &l.soft_core[0] });

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
                let soft = soft_row.map(|row| row[k]).unwrap_or(false);
                let (beta, l2) = if soft && cfg.do_permanent_real_space {
                    (
                        inputs.lambda.map(|l| l.l_alpha).unwrap_or(0.0),
                        cfg.permanent_scale,
                    )
                } else {
                    (0.0, 1.0)
                };

                let sk = site(&mpoles[k]);
                let pdamp = pdi * atoms[k].pdamp;
                let pgamma = pti.min(atoms[k].thole);
                let t = PairTensors::new(&rvec, r2 + beta, ctx.ewald, pdamp, pgamma, true);
                let (scale_m, scale_p, scale_d) = if s == 0 {
                    (maskm[k], maskp[k], maskd[k])
                } else {
                    (1.0, 1.0, 1.0)
                };

                if cfg.do_permanent_real_space {
                    let pair = PermanentPair {
                        t: &t,
                        si: &si,
                        sk: &sk,
                        rvec: &rvec,
                        scale: scale_m,
                        self_scale,
                        l2,
                        soft,
                    };
                    let e = permanent_pair(
                        &pair,
                        cfg,
                        inputs.lambda.filter(|_| soft),
                        i,
                        k,
                        &mut acc,
                        &mut grad_k,
                        &mut torque_k,
                        &mut lambda_grad_k,
                        &mut lambda_torque_k,
                    );
                    acc.permanent_energy += e;
                    acc.interactions += 1;
                }

                if inputs.polarization != Polarization::None && cfg.do_polarization {
                    // Polarization never sees the soft-core buffer.
                    let t_pol = if soft && cfg.do_permanent_real_space {
                        PairTensors::new(&rvec, r2, ctx.ewald, pdamp, pgamma, true)
                    } else {
                        t
                    };
                    let pair = PolarizationPair {
                        t: &t_pol,
                        si: &si,
                        sk: &sk,
                        rvec: &rvec,
                        ui: &ui,
                        pi: &pi,
                        uk: &inds[k],
                        pk: &inps[k],
                        scale_d,
                        scale_p,
                        self_scale,
                        direct: inputs.polarization == Polarization::Direct,
                    };
                    let e = polarization_pair(
                        &pair,
                        cfg,
                        inputs.lambda,
                        i,
                        k,
                        &mut acc,
                        &mut grad_k,
                        &mut torque_k,
                        &mut lambda_grad_k,
                        &mut lambda_torque_k,
                    );
                    acc.induced_energy += e;
                }
            }
            if s == 0 {
                reset_masks(topology, i, &mut maskm, &mut maskp, &mut maskd);
            }
        }

        // Resolve symmetry-mate torques into forces using the image
        // geometry, rotate back into the asymmetric unit, and fold in.
        if cfg.gradient {
            reduce_mates(ctx, s, coords, &mut grad_k, &torque_k, &mut acc.grad);
        }
        if inputs.lambda.is_some() {
            reduce_mates(
                ctx,
                s,
                coords,
                &mut lambda_grad_k,
                &lambda_torque_k,
                &mut acc.lambda_grad,
            );
        }
    }

    // Convert electrostatic units to kcal/mol once per chunk.
    acc.permanent_energy *= ELECTRIC;
    acc.induced_energy *= ELECTRIC;
    acc.dudl *= ELECTRIC;
    acc.d2udl2 *= ELECTRIC;
    for buf in [
        &mut acc.grad,
        &mut acc.torque,
        &mut acc.lambda_grad,
        &mut acc.lambda_torque,
    ] {
        buf.iter_mut().for_each(|v| *v *= ELECTRIC);
    }
    acc
}

fn reduce_mates(
    ctx: &RealSpaceContext,
    s: usize,
    coords: &[Vector3<f64>],
    grad_k: &mut [Vector3<f64>],
    torque_k: &[Vector3<f64>],
    into: &mut [Vector3<f64>],
) {
    let crystal = ctx.system.crystal();
    for (k, tq) in torque_k.iter().enumerate() {
        if tq.norm_squared() == 0.0 {
            continue;
        }
        let atom = ctx.system.atom(k);
        project(k, atom, coords, tq, &mut |j, f| grad_k[j] += f);
    }
    if s == 0 {
        for (dst, g) in into.iter_mut().zip(grad_k.iter()) {
            *dst += *g;
        }
    } else {
        for (dst, g) in into.iter_mut().zip(grad_k.iter()) {
            *dst += crystal.apply_inverse_sym_rot(s, g);
        }
    }
}

fn set_masks(
    topology: &crate::core::models::topology::Topology,
    p: &crate::core::forcefield::params::ElectrostaticsParams,
    i: usize,
    maskm: &mut [f64],
    maskp: &mut [f64],
    maskd: &mut [f64],
) {
    for &k in topology.n15(i) {
        maskm[k] = p.mpole_15_scale;
    }
    for &k in topology.n14(i) {
        maskm[k] = p.mpole_14_scale;
        if topology.ip11(i).contains(&k) {
            maskp[k] = 0.5;
        }
    }
    for &k in topology.n13(i) {
        maskm[k] = p.mpole_13_scale;
        maskp[k] = p.polar_13_scale;
    }
    for &k in topology.n12(i) {
        maskm[k] = p.mpole_12_scale;
        maskp[k] = p.polar_12_scale;
    }
    for &k in topology.ip11(i) {
        maskd[k] = p.direct_11_scale;
    }
}

fn reset_masks(
    topology: &crate::core::models::topology::Topology,
    i: usize,
    maskm: &mut [f64],
    maskp: &mut [f64],
    maskd: &mut [f64],
) {
    for &k in topology.n15(i) {
        maskm[k] = 1.0;
    }
    for &k in topology.n14(i) {
        maskm[k] = 1.0;
        maskp[k] = 1.0;
    }
    for &k in topology.n13(i) {
        maskm[k] = 1.0;
        maskp[k] = 1.0;
    }
    for &k in topology.n12(i) {
        maskm[k] = 1.0;
        maskp[k] = 1.0;
    }
    for &k in topology.ip11(i) {
        maskd[k] = 1.0;
    }
}

struct PermanentPair<'a> {
    t: &'a PairTensors,
    si: &'a Site,
    sk: &'a Site,
    rvec: &'a Vector3<f64>,
    scale: f64,
    self_scale: f64,
    l2: f64,
    soft: bool,
}

#[allow(clippy::too_many_arguments)]
fn permanent_pair(
    pair: &PermanentPair,
    cfg: &EvaluationConfig,
    lambda: Option<&LambdaState>,
    i: usize,
    k: usize,
    acc: &mut EnergyAccum,
    grad_k: &mut [Vector3<f64>],
    torque_k: &mut [Vector3<f64>],
    lambda_grad_k: &mut [Vector3<f64>],
    lambda_torque_k: &mut [Vector3<f64>],
) -> f64 {
    let (si, sk, r) = (pair.si, pair.sk, pair.rvec);
    let t = pair.t;
    let bn = &t.bn;
    let rr = &t.rr;

    let dixdk = si.d.cross(&sk.d);
    let dixr = si.d.cross(r);
    let dkxr = sk.d.cross(r);
    let qir = si.q * r;
    let qkr = sk.q * r;
    let qiqkr = si.q * qkr;
    let qkqir = sk.q * qir;
    let qixqk = antisym_axial(&(si.q * sk.q));
    let rxqir = r.cross(&qir);
    let rxqkr = r.cross(&qkr);
    let rxqikr = r.cross(&qiqkr);
    let rxqkir = r.cross(&qkqir);
    let qkrxqir = qkr.cross(&qir);
    let qidk = si.q * sk.d;
    let qkdi = sk.q * si.d;
    let dixqkr = si.d.cross(&qkr);
    let dkxqir = sk.d.cross(&qir);
    let rxqidk = r.cross(&qidk);
    let rxqkdi = r.cross(&qkdi);

    let sc2 = si.d.dot(&sk.d);
    let sc3 = si.d.dot(r);
    let sc4 = sk.d.dot(r);
    let sc5 = qir.dot(r);
    let sc6 = qkr.dot(r);
    let sc7 = qir.dot(&sk.d);
    let sc8 = qkr.dot(&si.d);
    let sc9 = qir.dot(&qkr);
    let sc10 = (si.q * sk.q).trace();

    let gl0 = si.c * sk.c;
    let gl1 = sk.c * sc3 - si.c * sc4;
    let gl2 = si.c * sc6 + sk.c * sc5 - sc3 * sc4;
    let gl3 = sc3 * sc6 - sc4 * sc5;
    let gl4 = sc5 * sc6;
    let gl5 = -4.0 * sc9;
    let gl6 = sc2;
    let gl7 = 2.0 * (sc7 - sc8);
    let gl8 = 2.0 * sc10;

    let scale1 = 1.0 - pair.scale;
    let ereal = gl0 * bn[0]
        + (gl1 + gl6) * bn[1]
        + (gl2 + gl7 + gl8) * bn[2]
        + (gl3 + gl5) * bn[3]
        + gl4 * bn[4];
    let efix = scale1
        * (gl0 * rr[0]
            + (gl1 + gl6) * rr[1]
            + (gl2 + gl7 + gl8) * rr[2]
            + (gl3 + gl5) * rr[3]
            + gl4 * rr[4]);
    let e = pair.self_scale * pair.l2 * (ereal - efix);

    let lambda_active = lambda.is_some() && pair.soft;
    if !(cfg.gradient || lambda_active) {
        return e;
    }

    if cfg.gradient {
        let gf1 = bn[1] * gl0
            + bn[2] * (gl1 + gl6)
            + bn[3] * (gl2 + gl7 + gl8)
            + bn[4] * (gl3 + gl5)
            + bn[5] * gl4;
        let gf2 = -sk.c * bn[1] + sc4 * bn[2] - sc6 * bn[3];
        let gf3 = si.c * bn[1] + sc3 * bn[2] + sc5 * bn[3];
        let gf4 = 2.0 * bn[2];
        let gf5 = 2.0 * (-sk.c * bn[2] + sc4 * bn[3] - sc6 * bn[4]);
        let gf6 = 2.0 * (-si.c * bn[2] - sc3 * bn[3] - sc5 * bn[4]);
        let gf7 = 4.0 * bn[3];

        let mut ftm2 = gf1 * r
            + gf2 * si.d
            + gf3 * sk.d
            + gf4 * (qkdi - qidk)
            + gf5 * qir
            + gf6 * qkr
            + gf7 * (qiqkr + qkqir);
        let mut ttm2 = -bn[1] * dixdk
            + gf2 * dixr
            + gf4 * (dixqkr + dkxqir + rxqidk - 2.0 * qixqk)
            - gf5 * rxqir
            - gf7 * (rxqikr + qkrxqir);
        let mut ttm3 = bn[1] * dixdk + gf3 * dkxr
            - gf4 * (dixqkr + dkxqir + rxqkdi - 2.0 * qixqk)
            - gf6 * rxqkr
            - gf7 * (rxqkir - qkrxqir);

        if scale1 != 0.0 {
            let gfr1 = rr[1] * gl0
                + rr[2] * (gl1 + gl6)
                + rr[3] * (gl2 + gl7 + gl8)
                + rr[4] * (gl3 + gl5)
                + rr[5] * gl4;
            let gfr2 = -sk.c * rr[1] + sc4 * rr[2] - sc6 * rr[3];
            let gfr3 = si.c * rr[1] + sc3 * rr[2] + sc5 * rr[3];
            let gfr4 = 2.0 * rr[2];
            let gfr5 = 2.0 * (-sk.c * rr[2] + sc4 * rr[3] - sc6 * rr[4]);
            let gfr6 = 2.0 * (-si.c * rr[2] - sc3 * rr[3] - sc5 * rr[4]);
            let gfr7 = 4.0 * rr[3];

            let ftm2r = gfr1 * r
                + gfr2 * si.d
                + gfr3 * sk.d
                + gfr4 * (qkdi - qidk)
                + gfr5 * qir
                + gfr6 * qkr
                + gfr7 * (qiqkr + qkqir);
            let ttm2r = -rr[1] * dixdk
                + gfr2 * dixr
                + gfr4 * (dixqkr + dkxqir + rxqidk - 2.0 * qixqk)
                - gfr5 * rxqir
                - gfr7 * (rxqikr + qkrxqir);
            let ttm3r = rr[1] * dixdk + gfr3 * dkxr
                - gfr4 * (dixqkr + dkxqir + rxqkdi - 2.0 * qixqk)
                - gfr6 * rxqkr
                - gfr7 * (rxqkir - qkrxqir);
            ftm2 -= scale1 * ftm2r;
            ttm2 -= scale1 * ttm2r;
            ttm3 -= scale1 * ttm3r;
        }

        let w = pair.self_scale * pair.l2;
        acc.grad[i] += w * ftm2;
        acc.torque[i] += w * ttm2;
        grad_k[k] -= w * ftm2;
        torque_k[k] += w * ttm3;

        if let Some(l) = lambda.filter(|_| pair.soft) {
            let lw = pair.self_scale * cfg.dedl_sign * l.dl_pow_perm;
            acc.lambda_grad[i] += lw * ftm2;
            acc.lambda_torque[i] += lw * ttm2;
            lambda_grad_k[k] -= lw * ftm2;
            lambda_torque_k[k] += lw * ttm3;
        }
    }

    if let Some(l) = lambda.filter(|_| pair.soft) {
        let d_real = gl0 * bn[1]
            + (gl1 + gl6) * bn[2]
            + (gl2 + gl7 + gl8) * bn[3]
            + (gl3 + gl5) * bn[4]
            + gl4 * bn[5];
        let d2_real = gl0 * bn[2]
            + (gl1 + gl6) * bn[3]
            + (gl2 + gl7 + gl8) * bn[4]
            + (gl3 + gl5) * bn[5]
            + gl4 * bn[6];

        acc.dudl += pair.self_scale
            * cfg.dedl_sign
            * (l.dl_pow_perm * ereal + l.l_pow_perm * l.dl_alpha * d_real);
        acc.d2udl2 += pair.self_scale
            * cfg.dedl_sign
            * (l.d2l_pow_perm * ereal
                + 2.0 * l.dl_pow_perm * l.dl_alpha * d_real
                + l.l_pow_perm * l.d2l_alpha * d_real
                + l.l_pow_perm * l.dl_alpha * l.dl_alpha * d2_real);

        // Gradient of the dR/dlambda term.
        let gf1 = bn[2] * gl0
            + bn[3] * (gl1 + gl6)
            + bn[4] * (gl2 + gl7 + gl8)
            + bn[5] * (gl3 + gl5)
            + bn[6] * gl4;
        let gf2 = -sk.c * bn[2] + sc4 * bn[3] - sc6 * bn[4];
        let gf3 = si.c * bn[2] + sc3 * bn[3] + sc5 * bn[4];
        let gf4 = 2.0 * bn[3];
        let gf5 = 2.0 * (-sk.c * bn[3] + sc4 * bn[4] - sc6 * bn[5]);
        let gf6 = 2.0 * (-si.c * bn[3] - sc3 * bn[4] - sc5 * bn[5]);
        let gf7 = 4.0 * bn[4];

        let ftm2 = gf1 * r
            + gf2 * si.d
            + gf3 * sk.d
            + gf4 * (qkdi - qidk)
            + gf5 * qir
            + gf6 * qkr
            + gf7 * (qiqkr + qkqir);
        let ttm2 = -bn[2] * dixdk
            + gf2 * dixr
            + gf4 * (dixqkr + dkxqir + rxqidk - 2.0 * qixqk)
            - gf5 * rxqir
            - gf7 * (rxqikr + qkrxqir);
        let ttm3 = bn[2] * dixdk + gf3 * dkxr
            - gf4 * (dixqkr + dkxqir + rxqkdi - 2.0 * qixqk)
            - gf6 * rxqkr
            - gf7 * (rxqkir - qkrxqir);

        let lw = pair.self_scale * cfg.dedl_sign * l.l_pow_perm * l.dl_alpha;
        acc.lambda_grad[i] += lw * ftm2;
        acc.lambda_torque[i] += lw * ttm2;
        lambda_grad_k[k] -= lw * ftm2;
        lambda_torque_k[k] += lw * ttm3;
    }

    e
}

struct PolarizationPair<'a> {
    t: &'a PairTensors,
    si: &'a Site,
    sk: &'a Site,
    rvec: &'a Vector3<f64>,
    ui: &'a Vector3<f64>,
    pi: &'a Vector3<f64>,
    uk: &'a Vector3<f64>,
    pk: &'a Vector3<f64>,
    scale_d: f64,
    scale_p: f64,
    self_scale: f64,
    direct: bool,
}

#[allow(clippy::too_many_arguments)]
fn polarization_pair(
    pair: &PolarizationPair,
    cfg: &EvaluationConfig,
    lambda: Option<&LambdaState>,
    i: usize,
    k: usize,
    acc: &mut EnergyAccum,
    grad_k: &mut [Vector3<f64>],
    torque_k: &mut [Vector3<f64>],
    lambda_grad_k: &mut [Vector3<f64>],
    lambda_torque_k: &mut [Vector3<f64>],
) -> f64 {
    let (si, sk, r) = (pair.si, pair.sk, pair.rvec);
    let (ui, pi, uk, pk) = (pair.ui, pair.pi, pair.uk, pair.pk);
    let t = pair.t;
    let bn = &t.bn;
    let rr = &t.rr;
    let (rr3, rr5, rr7, rr9) = (rr[1], rr[2], rr[3], rr[4]);

    let dsc3 = 1.0 - t.scale3 * pair.scale_d;
    let dsc5 = 1.0 - t.scale5 * pair.scale_d;
    let dsc7 = 1.0 - t.scale7 * pair.scale_d;
    let psc3 = 1.0 - t.scale3 * pair.scale_p;
    let psc5 = 1.0 - t.scale5 * pair.scale_p;
    let psc7 = 1.0 - t.scale7 * pair.scale_p;
    let usc3 = 1.0 - t.scale3;
    let usc5 = 1.0 - t.scale5;

    let dixuk = si.d.cross(uk);
    let dkxui = sk.d.cross(ui);
    let dixukp = si.d.cross(pk);
    let dkxuip = sk.d.cross(pi);
    let dixr = si.d.cross(r);
    let dkxr = sk.d.cross(r);
    let qir = si.q * r;
    let qkr = sk.q * r;
    let rxqir = r.cross(&qir);
    let rxqkr = r.cross(&qkr);
    let qiuk = si.q * uk;
    let qkui = sk.q * ui;
    let qiukp = si.q * pk;
    let qkuip = sk.q * pi;
    let uixqkr = ui.cross(&qkr);
    let ukxqir = uk.cross(&qir);
    let uixqkrp = pi.cross(&qkr);
    let ukxqirp = pk.cross(&qir);
    let rxqiuk = r.cross(&qiuk);
    let rxqkui = r.cross(&qkui);
    let rxqiukp = r.cross(&qiukp);
    let rxqkuip = r.cross(&qkuip);

    let sc3 = si.d.dot(r);
    let sc4 = sk.d.dot(r);
    let sc5 = qir.dot(r);
    let sc6 = qkr.dot(r);

    let sci1 = ui.dot(&sk.d) + si.d.dot(uk);
    let sci3 = ui.dot(r);
    let sci4 = uk.dot(r);
    let sci7 = qir.dot(uk);
    let sci8 = qkr.dot(ui);
    let scip1 = pi.dot(&sk.d) + si.d.dot(pk);
    let scip2 = ui.dot(pk) + pi.dot(uk);
    let scip3 = pi.dot(r);
    let scip4 = pk.dot(r);
    let scip7 = qir.dot(pk);
    let scip8 = qkr.dot(pi);

    let gli1 = sk.c * sci3 - si.c * sci4;
    let gli2 = -sc3 * sci4 - sci3 * sc4;
    let gli3 = sci3 * sc6 - sci4 * sc5;
    let gli6 = sci1;
    let gli7 = 2.0 * (sci7 - sci8);
    let glip1 = sk.c * scip3 - si.c * scip4;
    let glip2 = -sc3 * scip4 - scip3 * sc4;
    let glip3 = scip3 * sc6 - scip4 * sc5;
    let glip6 = scip1;
    let glip7 = 2.0 * (scip7 - scip8);

    let ereal = (gli1 + gli6) * bn[1] + (gli2 + gli7) * bn[2] + gli3 * bn[3];
    let efix = (gli1 + gli6) * rr3 * psc3 + (gli2 + gli7) * rr5 * psc5 + gli3 * rr7 * psc7;
    let e = pair.self_scale * 0.5 * (ereal - efix);

    if !(cfg.gradient || lambda.is_some()) {
        return cfg.polarization_scale * e;
    }

    let dorli = psc3 != 0.0 || dsc3 != 0.0 || usc3 != 0.0;

    let gfi1 = 0.5 * bn[2] * (gli1 + glip1 + gli6 + glip6)
        + 0.5 * bn[2] * scip2
        + 0.5 * bn[3] * (gli2 + glip2 + gli7 + glip7)
        - 0.5 * bn[3] * (sci3 * scip4 + scip3 * sci4)
        + 0.5 * bn[4] * (gli3 + glip3);
    let gfi2 = -sk.c * bn[1] + sc4 * bn[2] - sc6 * bn[3];
    let gfi3 = si.c * bn[1] + sc3 * bn[2] + sc5 * bn[3];
    let gfi4 = 2.0 * bn[2];
    let gfi5 = bn[3] * (sci4 + scip4);
    let gfi6 = -bn[3] * (sci3 + scip3);

    let mut ftm2i = gfi1 * r
        + 0.5
            * (gfi2 * (ui + pi)
                + bn[2] * (sci4 * pi + scip4 * ui)
                + gfi3 * (uk + pk)
                + bn[2] * (sci3 * pk + scip3 * uk)
                + (sci4 + scip4) * bn[2] * si.d
                + (sci3 + scip3) * bn[2] * sk.d
                + gfi4 * (qkui + qkuip - qiuk - qiukp))
        + gfi5 * qir
        + gfi6 * qkr;

    let gti2 = 0.5 * bn[2] * (sci4 + scip4);
    let gti3 = 0.5 * bn[2] * (sci3 + scip3);
    let gti4 = gfi4;
    let gti5 = gfi5;
    let gti6 = gfi6;

    let mut ttm2i = -0.5 * bn[1] * (dixuk + dixukp) + gti2 * dixr - gti5 * rxqir
        + 0.5 * gti4 * (ukxqir + rxqiuk + ukxqirp + rxqiukp);
    let mut ttm3i = -0.5 * bn[1] * (dkxui + dkxuip) + gti3 * dkxr
        - gti6 * rxqkr
        - 0.5 * gti4 * (uixqkr + rxqkui + uixqkrp + rxqkuip);

    if dorli {
        let gfri1 = 0.5 * rr5 * ((gli1 + gli6) * psc3 + (glip1 + glip6) * dsc3 + scip2 * usc3)
            + 0.5
                * rr7
                * ((gli7 + gli2) * psc5 + (glip7 + glip2) * dsc5
                    - (sci3 * scip4 + scip3 * sci4) * usc5)
            + 0.5 * rr9 * (gli3 * psc7 + glip3 * dsc7);
        let gfri4 = 2.0 * rr5;
        let gfri5 = rr7 * (sci4 * psc7 + scip4 * dsc7);
        let gfri6 = -rr7 * (sci3 * psc7 + scip3 * dsc7);

        let ftm2ri = gfri1 * r
            + 0.5
                * (-rr3 * sk.c * (ui * psc3 + pi * dsc3) + rr5 * sc4 * (ui * psc5 + pi * dsc5)
                    - rr7 * sc6 * (ui * psc7 + pi * dsc7))
            + 0.5
                * (rr3 * si.c * (uk * psc3 + pk * dsc3)
                    + rr5 * sc3 * (uk * psc5 + pk * dsc5)
                    + rr7 * sc5 * (uk * psc7 + pk * dsc7))
            + 0.5 * rr5 * usc5 * (sci4 * pi + scip4 * ui + sci3 * pk + scip3 * uk)
            + 0.5 * rr5 * (sci4 * psc5 + scip4 * dsc5) * si.d
            + 0.5 * rr5 * (sci3 * psc5 + scip3 * dsc5) * sk.d
            + 0.5 * gfri4 * ((qkui - qiuk) * psc5 + (qkuip - qiukp) * dsc5)
            + gfri5 * qir
            + gfri6 * qkr;

        let gtri2 = 0.5 * rr5 * (sci4 * psc5 + scip4 * dsc5);
        let gtri3 = 0.5 * rr5 * (sci3 * psc5 + scip3 * dsc5);
        let gtri4 = gfri4;
        let gtri5 = gfri5;
        let gtri6 = gfri6;
        let ttm2ri = -0.5 * rr3 * (dixuk * psc3 + dixukp * dsc3) + gtri2 * dixr - gtri5 * rxqir
            + 0.5 * gtri4 * ((ukxqir + rxqiuk) * psc5 + (ukxqirp + rxqiukp) * dsc5);
        let ttm3ri = -0.5 * rr3 * (dkxui * psc3 + dkxuip * dsc3) + gtri3 * dkxr
            - gtri6 * rxqkr
            - 0.5 * gtri4 * ((uixqkr + rxqkui) * psc5 + (uixqkrp + rxqkuip) * dsc5);

        ftm2i -= ftm2ri;
        ttm2i -= ttm2ri;
        ttm3i -= ttm3ri;
    }

    // Partially excluded interactions pick up a Thole-gradient correction.
    let temp3 = 0.5 * rr3 * ((gli1 + gli6) * pair.scale_p + (glip1 + glip6) * pair.scale_d);
    let temp5 = 0.5 * rr5 * ((gli2 + gli7) * pair.scale_p + (glip2 + glip7) * pair.scale_d);
    let temp7 = 0.5 * rr7 * (gli3 * pair.scale_p + glip3 * pair.scale_d);
    let fridmp = temp3 * t.ddsc3 + temp5 * t.ddsc5 + temp7 * t.ddsc7;
    let findmp = (0.5 * rr3 * scip2) * t.ddsc3
        - (0.5 * rr5 * (sci3 * scip4 + scip3 * sci4)) * t.ddsc5;
    ftm2i -= fridmp + findmp;

    if pair.direct {
        // Remove the mutual-coupling force that direct polarization never
        // pays for.
        let gfd = 0.5 * (bn[2] * scip2 - bn[3] * (scip3 * sci4 + sci3 * scip4));
        let gfdr = 0.5 * (rr5 * scip2 * usc3 - rr7 * (scip3 * sci4 + sci3 * scip4) * usc5);
        let cross = sci4 * pi + scip4 * ui + sci3 * pk + scip3 * uk;
        ftm2i -= gfd * r + 0.5 * bn[2] * cross;
        let fdir = gfdr * r + 0.5 * usc5 * rr5 * cross;
        ftm2i += fdir + findmp;
    }

    let w = cfg.polarization_scale * pair.self_scale;
    if cfg.gradient {
        acc.grad[i] += w * ftm2i;
        acc.torque[i] += w * ttm2i;
        grad_k[k] -= w * ftm2i;
        torque_k[k] += w * ttm3i;
    }
    if let Some(l) = lambda {
        acc.dudl += cfg.dedl_sign * l.dl_pow_pol * e;
        acc.d2udl2 += cfg.dedl_sign * l.d2l_pow_pol * e;
        let lw = cfg.dedl_sign * l.dl_pow_pol * pair.self_scale;
        acc.lambda_grad[i] += lw * ftm2i;
        acc.lambda_torque[i] += lw * ttm2i;
        lambda_grad_k[k] -= lw * ftm2i;
        lambda_torque_k[k] += lw * ttm3i;
    }

    cfg.polarization_scale * e
}
