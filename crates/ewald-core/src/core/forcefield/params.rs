//! Electrostatics parameters read from the force field.
//!
//! Field names and defaults mirror the force-field keywords of the AMOEBA
//! family (`polar-sor`, `mpole-14-scale`, `ewald-cutoff`, ...). Out-of-range
//! values recover silently to a safe default, with a warning.

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Polarization handling mode.
///
/// `Direct` induced dipoles respond only to permanent multipoles; `Mutual`
/// converges the self-consistent field to the `polar_eps` tolerance; `None`
/// disables induced dipoles entirely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Polarization {
    #[default]
    Mutual,
    Direct,
    None,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ElectrostaticsParams {
    pub polarization: Polarization,
    /// Successive over-relaxation parameter for the SCF.
    pub polar_sor: f64,
    /// SCF convergence tolerance in RMS Debye.
    pub polar_eps: f64,
    /// SCF iteration ceiling.
    pub scf_max_iterations: usize,

    pub mpole_12_scale: f64,
    pub mpole_13_scale: f64,
    pub mpole_14_scale: f64,
    pub mpole_15_scale: f64,
    pub direct_11_scale: f64,
    pub polar_12_scale: f64,
    pub polar_13_scale: f64,

    /// Real-space cutoff in Å; `None` selects 7 Å periodic, 100 Å aperiodic.
    pub ewald_cutoff: Option<f64>,
    /// Ewald coefficient in Å⁻¹; `None` derives it from the precision.
    pub ewald_alpha: Option<f64>,
    pub ewald_precision: f64,

    pub lambda_term: bool,
    pub permanent_lambda_alpha: f64,
    pub permanent_lambda_exponent: f64,
    pub polarization_lambda_exponent: f64,
    pub polarization_lambda_start: f64,
    pub polarization_lambda_end: f64,

    /// Threads reserved for the real-space section when the real and
    /// reciprocal sections run concurrently; `None` runs them sequentially
    /// on the full pool.
    pub real_space_threads: Option<usize>,
}

impl Default for ElectrostaticsParams {
    fn default() -> Self {
        Self {
            polarization: Polarization::Mutual,
            polar_sor: 0.70,
            polar_eps: 1e-6,
            scf_max_iterations: 1000,
            mpole_12_scale: 0.0,
            mpole_13_scale: 0.0,
            mpole_14_scale: 0.4,
            mpole_15_scale: 0.8,
            direct_11_scale: 0.0,
            polar_12_scale: 0.0,
            polar_13_scale: 0.0,
            ewald_cutoff: None,
            ewald_alpha: None,
            ewald_precision: 1e-8,
            lambda_term: false,
            permanent_lambda_alpha: 1.0,
            permanent_lambda_exponent: 1.0,
            polarization_lambda_exponent: 2.0,
            polarization_lambda_start: 0.5,
            polarization_lambda_end: 1.0,
            real_space_threads: None,
        }
    }
}

impl ElectrostaticsParams {
    /// Clamps out-of-range lambda-path parameters to their safe values.
    pub fn validated(mut self) -> Self {
        if !(0.0..=2.0).contains(&self.permanent_lambda_alpha) {
            warn!(
                value = self.permanent_lambda_alpha,
                "permanent lambda alpha outside [0, 2]; using 1.0"
            );
            self.permanent_lambda_alpha = 1.0;
        }
        if self.permanent_lambda_exponent < 1.0 {
            warn!(
                value = self.permanent_lambda_exponent,
                "permanent lambda exponent below 1; using 2.0"
            );
            self.permanent_lambda_exponent = 2.0;
        }
        if self.polarization_lambda_exponent < 1.0 {
            warn!(
                value = self.polarization_lambda_exponent,
                "polarization lambda exponent below 1; using 2.0"
            );
            self.polarization_lambda_exponent = 2.0;
        }
        if !(0.0..=0.9).contains(&self.polarization_lambda_start) {
            warn!(
                value = self.polarization_lambda_start,
                "polarization lambda start outside [0, 0.9]; using 0.5"
            );
            self.polarization_lambda_start = 0.5;
        }
        let start = self.polarization_lambda_start;
        let end = self.polarization_lambda_end;
        if end < start || end > 1.0 || end - start < 0.3 {
            warn!(start, end, "bad polarization lambda window; ending at 1.0");
            self.polarization_lambda_end = 1.0;
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_amoeba_masking_rules() {
        let p = ElectrostaticsParams::default();
        assert_eq!(p.mpole_14_scale, 0.4);
        assert_eq!(p.mpole_15_scale, 0.8);
        assert_eq!(p.polar_12_scale, 0.0);
        assert_eq!(p.direct_11_scale, 0.0);
        assert_eq!(p.polar_sor, 0.70);
    }

    #[test]
    fn validation_clamps_low_permanent_exponent_to_two() {
        let p = ElectrostaticsParams {
            permanent_lambda_exponent: 0.5,
            ..Default::default()
        }
        .validated();
        assert_eq!(p.permanent_lambda_exponent, 2.0);
    }

    #[test]
    fn validation_keeps_parsed_default_exponent_of_one() {
        let p = ElectrostaticsParams::default().validated();
        assert_eq!(p.permanent_lambda_exponent, 1.0);
    }

    #[test]
    fn validation_repairs_narrow_polarization_window() {
        let p = ElectrostaticsParams {
            polarization_lambda_start: 0.5,
            polarization_lambda_end: 0.6,
            ..Default::default()
        }
        .validated();
        assert_eq!(p.polarization_lambda_end, 1.0);
    }
}
