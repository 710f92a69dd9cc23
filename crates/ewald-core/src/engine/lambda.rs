//! Alchemical scaling state.
//!
//! A scalar lambda in [0, 1] drives the permanent and polarization energies
//! through smoothstep powers, and softens the pair distance for soft atoms
//! through the buffer `l_alpha = alpha * (1 - lambda)^2`. Polarization turns
//! on over a window of the lambda path, with chain-rule factors from the
//! window rescaling folded into the derivatives.

use tracing::warn;

use crate::core::forcefield::params::ElectrostaticsParams;
use crate::core::models::atom::Atom;

#[derive(Debug, Clone)]
pub struct LambdaState {
    pub lambda: f64,

    /// Soft-core distance buffer and its lambda derivatives.
    pub l_alpha: f64,
    pub dl_alpha: f64,
    pub d2l_alpha: f64,

    /// lambda^permanent_exponent and derivatives.
    pub l_pow_perm: f64,
    pub dl_pow_perm: f64,
    pub d2l_pow_perm: f64,

    /// Window-rescaled polarization power and derivatives.
    pub l_pow_pol: f64,
    pub dl_pow_pol: f64,
    pub d2l_pow_pol: f64,

    pub is_soft: Vec<bool>,
    /// Soft-core pair selection: row 0 applies when the outer atom is hard,
    /// row 1 when it is soft.
    pub soft_core: [Vec<bool>; 2],
}

impl LambdaState {
    pub fn new(n_atoms: usize) -> Self {
        Self {
            lambda: 1.0,
            l_alpha: 0.0,
            dl_alpha: 0.0,
            d2l_alpha: 0.0,
            l_pow_perm: 1.0,
            dl_pow_perm: 0.0,
            d2l_pow_perm: 0.0,
            l_pow_pol: 1.0,
            dl_pow_pol: 0.0,
            d2l_pow_pol: 0.0,
            is_soft: vec![false; n_atoms],
            soft_core: [vec![false; n_atoms], vec![false; n_atoms]],
        }
    }

    pub fn set_lambda(&mut self, lambda: f64, params: &ElectrostaticsParams, atoms: &[Atom]) {
        self.lambda = lambda;

        // The buffered distance is f = sqrt(r² + l_alpha); the kernels
        // contract with dl_alpha = -d(l_alpha)/dlambda / 2.
        self.l_alpha = params.permanent_lambda_alpha * (1.0 - lambda) * (1.0 - lambda);
        self.dl_alpha = params.permanent_lambda_alpha * (1.0 - lambda);
        self.d2l_alpha = -params.permanent_lambda_alpha;

        let exp_perm = params.permanent_lambda_exponent;
        self.l_pow_perm = lambda.powf(exp_perm);
        self.dl_pow_perm = exp_perm * lambda.powf(exp_perm - 1.0);
        self.d2l_pow_perm = if exp_perm >= 2.0 {
            exp_perm * (exp_perm - 1.0) * lambda.powf(exp_perm - 2.0)
        } else {
            0.0
        };

        let start = params.polarization_lambda_start;
        let end = params.polarization_lambda_end;
        if lambda < start {
            self.l_pow_pol = 0.0;
            self.dl_pow_pol = 0.0;
            self.d2l_pow_pol = 0.0;
        } else if lambda <= end {
            let window_scale = 1.0 / (end - start);
            let pol_lambda = window_scale * (lambda - start);
            let exp_pol = params.polarization_lambda_exponent;
            self.l_pow_pol = pol_lambda.powf(exp_pol);
            self.dl_pow_pol = exp_pol * pol_lambda.powf(exp_pol - 1.0) * window_scale;
            self.d2l_pow_pol = if exp_pol >= 2.0 {
                exp_pol * (exp_pol - 1.0) * pol_lambda.powf(exp_pol - 2.0)
                    * window_scale
                    * window_scale
            } else {
                0.0
            };
        } else {
            self.l_pow_pol = 1.0;
            self.dl_pow_pol = 0.0;
            self.d2l_pow_pol = 0.0;
        }

        let mut any_soft = false;
        for (i, atom) in atoms.iter().enumerate() {
            self.is_soft[i] = atom.apply_lambda;
            if self.is_soft[i] {
                any_soft = true;
                self.soft_core[0][i] = true;
                self.soft_core[1][i] = true;
            } else {
                self.soft_core[0][i] = false;
                self.soft_core[1][i] = true;
            }
        }
        if !any_soft {
            warn!("no atoms are selected for soft core electrostatics");
        }
    }
}
