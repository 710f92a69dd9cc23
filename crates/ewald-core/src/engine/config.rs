//! Ewald parameters and per-call evaluation switches.

use statrs::function::erf::erfc;

use crate::core::constants::SQRT_PI;

/// Ewald splitting constants derived from the cutoff and coefficient.
///
/// The recursion seeds `an0..an5` generate the damped `bn` kernels
/// `bn(k+1) = ((2k+1)·bn(k) + an(k)·exp(−α²r²)) / r²`. With `aewald == 0`
/// every `an` vanishes and the kernels degenerate to the plain rational
/// distances, which turns off reciprocal space entirely.
#[derive(Debug, Clone, Copy)]
pub struct EwaldParameters {
    pub aewald: f64,
    pub off: f64,
    pub off2: f64,
    pub an0: f64,
    pub an1: f64,
    pub an2: f64,
    pub an3: f64,
    pub an4: f64,
    pub an5: f64,
    /// Self-field prefactor 4α³/(3√π).
    pub aewald3: f64,
}

impl EwaldParameters {
    pub fn new(off: f64, aewald: f64) -> Self {
        let alsq2 = 2.0 * aewald * aewald;
        let (an0, an1, an2, an3, an4, an5) = if aewald > 0.0 {
            let pi_ewald = 1.0 / (SQRT_PI * aewald);
            let an0 = alsq2 * pi_ewald;
            let an1 = alsq2 * an0;
            let an2 = alsq2 * an1;
            let an3 = alsq2 * an2;
            let an4 = alsq2 * an3;
            (an0, an1, an2, an3, an4, alsq2 * an4)
        } else {
            (0.0, 0.0, 0.0, 0.0, 0.0, 0.0)
        };
        Self {
            aewald,
            off,
            off2: off * off,
            an0,
            an1,
            an2,
            an3,
            an4,
            an5,
            aewald3: 4.0 / 3.0 * aewald.powi(3) / SQRT_PI,
        }
    }
}

/// Finds the Ewald coefficient for which `erfc(α·cutoff)/cutoff` first drops
/// below the requested precision, by doubling then binary search.
pub fn ewald_coefficient(cutoff: f64, precision: f64) -> f64 {
    let eps = if precision < 1.0e-1 { precision } else { 1.0e-8 };

    let mut x = 0.5;
    let mut i = 0;
    while erfc(x * cutoff) / cutoff >= eps {
        x *= 2.0;
        i += 1;
    }

    let mut xlo = 0.0;
    let mut xhi = x;
    for _ in 0..(i + 60) {
        x = 0.5 * (xlo + xhi);
        if erfc(x * cutoff) / cutoff >= eps {
            xlo = x;
        } else {
            xhi = x;
        }
    }
    x
}

/// Finds the smallest cutoff at which a given coefficient reaches the
/// requested real-space precision, capped at `max_cutoff`.
pub fn ewald_cutoff(coeff: f64, max_cutoff: f64, eps: f64) -> f64 {
    if erfc(coeff * max_cutoff) / max_cutoff > eps {
        return max_cutoff;
    }
    let mut xlo = 0.0;
    let mut xhi = max_cutoff;
    let mut cutoff = 0.0;
    for _ in 0..100 {
        cutoff = 0.5 * (xlo + xhi);
        if erfc(coeff * cutoff) / cutoff >= eps {
            xlo = cutoff;
        } else {
            xhi = cutoff;
        }
    }
    cutoff
}

/// Per-call toggles threaded down the evaluation call tree.
///
/// The alchemical path evaluates the energy in up to three legs that differ
/// only in these switches; a plain energy call uses `Default`.
#[derive(Debug, Clone, Copy)]
pub struct EvaluationConfig {
    pub gradient: bool,
    /// Include symmetry mates in the real-space sums. Independent of the
    /// Ewald coefficient: disabling symmetry with `aewald > 0` restricts
    /// both sums to the asymmetric unit.
    pub use_symmetry: bool,
    pub do_permanent_real_space: bool,
    pub do_polarization: bool,
    pub permanent_scale: f64,
    pub polarization_scale: f64,
    /// Sign applied to lambda-derivative accumulation on this leg.
    pub dedl_sign: f64,
}

impl Default for EvaluationConfig {
    fn default() -> Self {
        Self {
            gradient: false,
            use_symmetry: true,
            do_permanent_real_space: true,
            do_polarization: true,
            permanent_scale: 1.0,
            polarization_scale: 1.0,
            dedl_sign: 1.0,
        }
    }
}
