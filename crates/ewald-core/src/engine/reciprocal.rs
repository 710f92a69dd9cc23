//! Reciprocal-space collaborators and phi-tensor energy assembly.
//!
//! The FFT-based B-spline convolution lives behind [`ReciprocalSpace`]; the
//! engine only consumes the potential tensors it produces. The assembly
//! functions here turn those tensors, together with the Ewald self terms,
//! into energies, gradients, and torques.

use nalgebra::{Matrix3, Vector3};
use thiserror::Error;

use crate::core::constants::{ELECTRIC, ONE_THIRD, SQRT_PI};
use crate::core::models::multipole::{
    MultipoleTensor, PhiTensor, T000, T001, T002, T003, T010, T011, T012, T020, T021, T030, T100,
    T101, T102, T110, T111, T120, T200, T201, T210, T300,
};
use crate::engine::config::{EvaluationConfig, EwaldParameters};
use crate::engine::lambda::LambdaState;

#[derive(Debug, Error)]
#[error("{0}")]
pub struct ReciprocalError(pub String);

/// The B-spline reciprocal-space convolution collaborator.
///
/// Implementations spread multipoles and induced dipoles onto an FFT grid,
/// convolve with the Ewald Green's function, and probe the resulting
/// potential back at the atom sites as Cartesian and fractional phi tensors.
pub trait ReciprocalSpace: Send {
    fn compute_bsplines(&mut self) -> Result<(), ReciprocalError>;

    /// Spreads the permanent multipoles of every symmetry image.
    fn spline_permanent_multipoles(
        &mut self,
        global_mpole: &[Vec<MultipoleTensor>],
        use_flags: &[bool],
    ) -> Result<(), ReciprocalError>;

    fn permanent_multipole_convolution(&mut self) -> Result<(), ReciprocalError>;

    /// Probes the permanent reciprocal potential at each site.
    fn compute_permanent_phi(&mut self, cart_phi: &mut [PhiTensor]) -> Result<(), ReciprocalError>;

    fn spline_induced_dipoles(
        &mut self,
        induced: &[Vec<Vector3<f64>>],
        induced_cr: &[Vec<Vector3<f64>>],
        use_flags: &[bool],
    ) -> Result<(), ReciprocalError>;

    fn induced_dipole_convolution(&mut self) -> Result<(), ReciprocalError>;

    fn compute_induced_phi(
        &mut self,
        cart_phi: &mut [PhiTensor],
        cart_phi_cr: &mut [PhiTensor],
    ) -> Result<(), ReciprocalError>;

    /// Refreshes the fractional induced dipoles without a new convolution.
    fn cart_to_frac_induced_dipoles(
        &mut self,
        induced: &[Vec<Vector3<f64>>],
        induced_cr: &[Vec<Vector3<f64>>],
    );

    fn frac_multipoles(&self) -> &[MultipoleTensor];
    fn frac_multipole_phi(&self) -> &[PhiTensor];
    fn frac_induced_dipoles(&self) -> &[Vector3<f64>];
    fn frac_induced_dipoles_cr(&self) -> &[Vector3<f64>];
    fn frac_induced_dipole_phi(&self) -> &[PhiTensor];
    fn frac_induced_dipole_cr_phi(&self) -> &[PhiTensor];
    fn grid_dimensions(&self) -> (usize, usize, usize);
}

/// Optional implicit-solvent reaction field collaborator.
pub trait ReactionField: Send {
    fn compute_born_radii(&mut self);
    /// Reaction field of the permanent multipoles at every site.
    fn compute_permanent_field(&mut self) -> &[Vector3<f64>];
    /// Reaction fields of the two induced dipole sets.
    fn compute_induced_field(
        &mut self,
        induced: &[Vector3<f64>],
        induced_cr: &[Vector3<f64>],
    ) -> (&[Vector3<f64>], &[Vector3<f64>]);
}

/// Ewald self-energy of the permanent multipoles. Rotation-invariant, so it
/// contracts the local-frame tensors.
pub(crate) fn permanent_self_energy(
    local_mpole: &[MultipoleTensor],
    use_flags: &[bool],
    ewald: &EwaldParameters,
) -> f64 {
    let term = 2.0 * ewald.aewald * ewald.aewald;
    let fterm = -ELECTRIC * ewald.aewald / SQRT_PI;
    let mut e = 0.0;
    for (m, _) in local_mpole
        .iter()
        .zip(use_flags)
        .filter(|(_, used)| **used)
    {
        let cii = m[T000] * m[T000];
        let dii = m[T100] * m[T100] + m[T010] * m[T010] + m[T001] * m[T001];
        let qii = m[T200] * m[T200]
            + m[T020] * m[T020]
            + m[T002] * m[T002]
            + 2.0 * (m[T110] * m[T110] + m[T101] * m[T101] + m[T011] * m[T011]);
        e += fterm * (cii + term * (dii / 3.0 + 2.0 * term * qii / 45.0));
    }
    e
}

/// Contraction of a fractional multipole with the x/y/z-shifted components
/// of a fractional phi tensor.
fn frac_gradient(fm: &MultipoleTensor, fphi: &PhiTensor) -> Vector3<f64> {
    let gx = fm[T000] * fphi[T100]
        + fm[T100] * fphi[T200]
        + fm[T010] * fphi[T110]
        + fm[T001] * fphi[T101]
        + fm[T200] * fphi[T300]
        + fm[T020] * fphi[T120]
        + fm[T002] * fphi[T102]
        + fm[T110] * fphi[T210]
        + fm[T101] * fphi[T201]
        + fm[T011] * fphi[T111];
    let gy = fm[T000] * fphi[T010]
        + fm[T100] * fphi[T110]
        + fm[T010] * fphi[T020]
        + fm[T001] * fphi[T011]
        + fm[T200] * fphi[T210]
        + fm[T020] * fphi[T030]
        + fm[T002] * fphi[T012]
        + fm[T110] * fphi[T120]
        + fm[T101] * fphi[T111]
        + fm[T011] * fphi[T021];
    let gz = fm[T000] * fphi[T001]
        + fm[T100] * fphi[T101]
        + fm[T010] * fphi[T011]
        + fm[T001] * fphi[T002]
        + fm[T200] * fphi[T201]
        + fm[T020] * fphi[T021]
        + fm[T002] * fphi[T003]
        + fm[T110] * fphi[T111]
        + fm[T101] * fphi[T102]
        + fm[T011] * fphi[T012];
    Vector3::new(gx, gy, gz)
}

/// Torque of a multipole in the potential described by a phi tensor.
fn phi_torque(m: &MultipoleTensor, phi: &PhiTensor) -> Vector3<f64> {
    let mut tq = Vector3::new(
        -m[T010] * phi[T001] + m[T001] * phi[T010],
        -m[T001] * phi[T100] + m[T100] * phi[T001],
        -m[T100] * phi[T010] + m[T010] * phi[T100],
    );
    tq.x -= 2.0 * ONE_THIRD
        * (m[T110] * phi[T101] + m[T020] * phi[T011] + m[T011] * phi[T002]
            - m[T101] * phi[T110]
            - m[T011] * phi[T020]
            - m[T002] * phi[T011]);
    tq.y -= 2.0 * ONE_THIRD
        * (m[T101] * phi[T200] + m[T011] * phi[T110] + m[T002] * phi[T101]
            - m[T200] * phi[T101]
            - m[T110] * phi[T011]
            - m[T101] * phi[T002]);
    tq.z -= 2.0 * ONE_THIRD
        * (m[T200] * phi[T110] + m[T110] * phi[T020] + m[T101] * phi[T011]
            - m[T110] * phi[T200]
            - m[T020] * phi[T110]
            - m[T011] * phi[T101]);
    tq
}

/// Contraction of a multipole with a phi tensor, with the one-third
/// quadrupole convention.
fn phi_energy(m: &MultipoleTensor, phi: &PhiTensor) -> f64 {
    m[T000] * phi[T000]
        + m[T100] * phi[T100]
        + m[T010] * phi[T010]
        + m[T001] * phi[T001]
        + ONE_THIRD
            * (m[T200] * phi[T200]
                + m[T020] * phi[T020]
                + m[T002] * phi[T002]
                + 2.0 * (m[T110] * phi[T110] + m[T101] * phi[T101] + m[T011] * phi[T011]))
}

pub(crate) struct RecipOutputs<'a> {
    pub grad: &'a mut [Vector3<f64>],
    pub torque: &'a mut [Vector3<f64>],
    pub lambda_grad: &'a mut [Vector3<f64>],
    pub lambda_torque: &'a mut [Vector3<f64>],
    pub dudl: &'a mut f64,
    pub d2udl2: &'a mut f64,
}

#[allow(clippy::too_many_arguments)]
pub(crate) fn permanent_reciprocal_energy(
    mpole: &[MultipoleTensor],
    cart_phi: &[PhiTensor],
    frac_mpole: &[MultipoleTensor],
    frac_phi: &[PhiTensor],
    grid: (usize, usize, usize),
    recip_matrix: &Matrix3<f64>,
    use_flags: &[bool],
    cfg: &EvaluationConfig,
    lambda: Option<&LambdaState>,
    out: &mut RecipOutputs,
) -> f64 {
    let dims = Vector3::new(grid.0 as f64, grid.1 as f64, grid.2 as f64);
    let mut erecip = 0.0;
    let mut dudl = 0.0;
    let mut d2udl2 = 0.0;
    for i in 0..mpole.len() {
        if !use_flags[i] {
            continue;
        }
        let e = phi_energy(&mpole[i], &cart_phi[i]);
        erecip += e;
        if cfg.gradient || lambda.is_some() {
            let g = frac_gradient(&frac_mpole[i], &frac_phi[i]).component_mul(&dims);
            let df = recip_matrix * g;
            let tq = phi_torque(&mpole[i], &cart_phi[i]);
            if cfg.gradient {
                out.grad[i] += cfg.permanent_scale * ELECTRIC * df;
                out.torque[i] += cfg.permanent_scale * ELECTRIC * tq;
            }
            if let Some(l) = lambda {
                dudl += cfg.dedl_sign * l.dl_pow_perm * e;
                d2udl2 += cfg.dedl_sign * l.d2l_pow_perm * e;
                out.lambda_grad[i] += cfg.dedl_sign * l.dl_pow_perm * ELECTRIC * df;
                out.lambda_torque[i] += cfg.dedl_sign * l.dl_pow_perm * ELECTRIC * tq;
            }
        }
    }
    *out.dudl += 0.5 * dudl * ELECTRIC;
    *out.d2udl2 += 0.5 * d2udl2 * ELECTRIC;
    cfg.permanent_scale * 0.5 * ELECTRIC * erecip
}

/// Self-energy of the induced dipoles against the permanent dipoles, with
/// the accompanying torque.
#[allow(clippy::too_many_arguments)]
pub(crate) fn induced_self_energy(
    mpole: &[MultipoleTensor],
    induced: &[Vector3<f64>],
    induced_cr: &[Vector3<f64>],
    use_flags: &[bool],
    ewald: &EwaldParameters,
    cfg: &EvaluationConfig,
    lambda: Option<&LambdaState>,
    out: &mut RecipOutputs,
) -> f64 {
    let a = ewald.aewald;
    let term = -2.0 / 3.0 * ELECTRIC * a * a * a / SQRT_PI;
    let mut e = 0.0;
    for i in 0..mpole.len() {
        if !use_flags[i] {
            continue;
        }
        let d = Vector3::new(mpole[i][T100], mpole[i][T010], mpole[i][T001]);
        e += term * induced[i].dot(&d);
    }
    if let Some(l) = lambda {
        *out.dudl += cfg.dedl_sign * l.dl_pow_pol * e;
        *out.d2udl2 += cfg.dedl_sign * l.d2l_pow_pol * e;
    }
    if cfg.gradient {
        let fterm = -2.0 * term;
        for i in 0..mpole.len() {
            if !use_flags[i] {
                continue;
            }
            let d = Vector3::new(mpole[i][T100], mpole[i][T010], mpole[i][T001]);
            let u = 0.5 * (induced[i] + induced_cr[i]);
            let tq = fterm * d.cross(&u);
            out.torque[i] += cfg.polarization_scale * tq;
            if let Some(l) = lambda {
                out.lambda_torque[i] += cfg.dedl_sign * l.dl_pow_pol * tq;
            }
        }
    }
    cfg.polarization_scale * e
}

pub(crate) struct InducedRecipInputs<'a> {
    pub mpole: &'a [MultipoleTensor],
    pub frac_mpole: &'a [MultipoleTensor],
    pub frac_mpole_phi: &'a [PhiTensor],
    pub frac_induced: &'a [Vector3<f64>],
    pub frac_induced_cr: &'a [Vector3<f64>],
    pub cart_phi: &'a [PhiTensor],
    pub cart_phi_cr: &'a [PhiTensor],
    pub frac_phi: &'a [PhiTensor],
    pub frac_phi_cr: &'a [PhiTensor],
    pub grid: (usize, usize, usize),
    pub recip_matrix: Matrix3<f64>,
    pub mutual: bool,
}

/// Energy of the permanent multipoles in the induced reciprocal potential,
/// with gradient contractions split between the induced and permanent phis.
pub(crate) fn induced_reciprocal_energy(
    inputs: &InducedRecipInputs,
    use_flags: &[bool],
    cfg: &EvaluationConfig,
    lambda: Option<&LambdaState>,
    out: &mut RecipOutputs,
) -> f64 {
    let dims = Vector3::new(
        inputs.grid.0 as f64,
        inputs.grid.1 as f64,
        inputs.grid.2 as f64,
    );
    let mut e_total = 0.0;
    for i in 0..inputs.mpole.len() {
        if !use_flags[i] {
            continue;
        }
        let find = inputs.frac_induced[i];
        let fphi = &inputs.frac_mpole_phi[i];
        e_total += find.x * fphi[T100] + find.y * fphi[T010] + find.z * fphi[T001];

        if cfg.gradient {
            let finp = inputs.frac_induced_cr[i];
            let fiphi = &inputs.frac_phi[i];
            let fipphi = &inputs.frac_phi_cr[i];
            let ins = find + finp;

            let mut g = Vector3::new(
                ins.x * fphi[T200] + ins.y * fphi[T110] + ins.z * fphi[T101],
                ins.x * fphi[T110] + ins.y * fphi[T020] + ins.z * fphi[T011],
                ins.x * fphi[T101] + ins.y * fphi[T011] + ins.z * fphi[T002],
            );
            if inputs.mutual {
                g.x += find.x * fipphi[T200]
                    + finp.x * fiphi[T200]
                    + find.y * fipphi[T110]
                    + finp.y * fiphi[T110]
                    + find.z * fipphi[T101]
                    + finp.z * fiphi[T101];
                g.y += find.x * fipphi[T110]
                    + finp.x * fiphi[T110]
                    + find.y * fipphi[T020]
                    + finp.y * fiphi[T020]
                    + find.z * fipphi[T011]
                    + finp.z * fiphi[T011];
                g.z += find.x * fipphi[T101]
                    + finp.x * fiphi[T101]
                    + find.y * fipphi[T011]
                    + finp.y * fiphi[T011]
                    + find.z * fipphi[T002]
                    + finp.z * fiphi[T002];
            }
            let mut sfphi = [0.0; 20];
            for t in 0..20 {
                sfphi[t] = fiphi[t] + fipphi[t];
            }
            g += frac_gradient(&inputs.frac_mpole[i], &sfphi);
            let df = 0.5 * ELECTRIC * (inputs.recip_matrix * g.component_mul(&dims));

            let mut sphi = [0.0; 20];
            for t in 0..20 {
                sphi[t] = 0.5 * (inputs.cart_phi[i][t] + inputs.cart_phi_cr[i][t]);
            }
            let tq = ELECTRIC * phi_torque(&inputs.mpole[i], &sphi);

            out.grad[i] += cfg.polarization_scale * df;
            out.torque[i] += cfg.polarization_scale * tq;
            if let Some(l) = lambda {
                out.lambda_grad[i] += cfg.dedl_sign * l.dl_pow_pol * df;
                out.lambda_torque[i] += cfg.dedl_sign * l.dl_pow_pol * tq;
            }
        }
    }
    let e = 0.5 * ELECTRIC * e_total;
    if let Some(l) = lambda {
        *out.dudl += cfg.dedl_sign * l.dl_pow_pol * e;
        *out.d2udl2 += cfg.dedl_sign * l.d2l_pow_pol * e;
    }
    cfg.polarization_scale * e
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn outputs(
        n: usize,
    ) -> (
        Vec<Vector3<f64>>,
        Vec<Vector3<f64>>,
        Vec<Vector3<f64>>,
        Vec<Vector3<f64>>,
        f64,
        f64,
    ) {
        (
            vec![Vector3::zeros(); n],
            vec![Vector3::zeros(); n],
            vec![Vector3::zeros(); n],
            vec![Vector3::zeros(); n],
            0.0,
            0.0,
        )
    }

    #[test]
    fn self_energy_of_unit_charge_matches_closed_form() {
        let mut m = [0.0; 10];
        m[T000] = 1.0;
        let ewald = EwaldParameters::new(9.0, 0.54);
        let e = permanent_self_energy(&[m], &[true], &ewald);
        assert_relative_eq!(e, -ELECTRIC * 0.54 / SQRT_PI, epsilon = 1e-10);
    }

    #[test]
    fn self_energy_skips_unused_sites() {
        let mut m = [0.0; 10];
        m[T000] = 1.0;
        let ewald = EwaldParameters::new(9.0, 0.54);
        assert_eq!(permanent_self_energy(&[m], &[false], &ewald), 0.0);
    }

    #[test]
    fn reciprocal_energy_of_charge_in_uniform_potential() {
        let mut m = [0.0; 10];
        m[T000] = 2.0;
        let mut phi = [0.0; 20];
        phi[T000] = 3.0;
        let cfg = EvaluationConfig::default();
        let (mut g, mut t, mut lg, mut lt, mut dudl, mut d2) = outputs(1);
        let mut out = RecipOutputs {
            grad: &mut g,
            torque: &mut t,
            lambda_grad: &mut lg,
            lambda_torque: &mut lt,
            dudl: &mut dudl,
            d2udl2: &mut d2,
        };
        let e = permanent_reciprocal_energy(
            &[m],
            &[phi],
            &[m],
            &[phi],
            (1, 1, 1),
            &Matrix3::identity(),
            &[true],
            &cfg,
            None,
            &mut out,
        );
        assert_relative_eq!(e, 0.5 * ELECTRIC * 6.0, epsilon = 1e-12);
    }

    #[test]
    fn reciprocal_gradient_of_charge_follows_fractional_phi() {
        let mut m = [0.0; 10];
        m[T000] = 1.5;
        let mut fphi = [0.0; 20];
        fphi[T100] = 0.25;
        let cfg = EvaluationConfig {
            gradient: true,
            ..Default::default()
        };
        let (mut g, mut t, mut lg, mut lt, mut dudl, mut d2) = outputs(1);
        let mut out = RecipOutputs {
            grad: &mut g,
            torque: &mut t,
            lambda_grad: &mut lg,
            lambda_torque: &mut lt,
            dudl: &mut dudl,
            d2udl2: &mut d2,
        };
        let _ = permanent_reciprocal_energy(
            &[m],
            &[[0.0; 20]],
            &[m],
            &[fphi],
            (8, 1, 1),
            &Matrix3::identity(),
            &[true],
            &cfg,
            None,
            &mut out,
        );
        // Charge x d(phi)/dx, scaled by the grid dimension.
        assert_relative_eq!(g[0].x, ELECTRIC * 1.5 * 0.25 * 8.0, epsilon = 1e-12);
        assert_relative_eq!(g[0].y, 0.0);
    }

    #[test]
    fn dipole_torque_in_uniform_field_is_d_cross_e() {
        let mut m = [0.0; 10];
        m[T100] = 0.4;
        let mut phi = [0.0; 20];
        // Potential gradient along y means a field along -y.
        phi[T010] = 1.3;
        let tq = phi_torque(&m, &phi);
        let d = Vector3::new(0.4, 0.0, 0.0);
        let e_field = Vector3::new(0.0, -1.3, 0.0);
        let expected = d.cross(&e_field);
        assert_relative_eq!((tq - expected).norm(), 0.0, epsilon = 1e-14);
    }

    #[test]
    fn induced_self_energy_couples_induced_to_permanent_dipole() {
        let mut m = [0.0; 10];
        m[T001] = 0.2;
        let induced = vec![Vector3::new(0.0, 0.0, 0.05)];
        let ewald = EwaldParameters::new(9.0, 0.5);
        let cfg = EvaluationConfig::default();
        let (mut g, mut t, mut lg, mut lt, mut dudl, mut d2) = outputs(1);
        let mut out = RecipOutputs {
            grad: &mut g,
            torque: &mut t,
            lambda_grad: &mut lg,
            lambda_torque: &mut lt,
            dudl: &mut dudl,
            d2udl2: &mut d2,
        };
        let e = induced_self_energy(
            &[m],
            &induced,
            &induced,
            &[true],
            &ewald,
            &cfg,
            None,
            &mut out,
        );
        let expected = -2.0 / 3.0 * ELECTRIC * 0.5_f64.powi(3) / SQRT_PI * 0.2 * 0.05;
        assert_relative_eq!(e, expected, epsilon = 1e-12);
    }
}
