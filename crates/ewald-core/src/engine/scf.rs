//! Self-consistent field iteration for the induced dipoles.
//!
//! The direct dipoles (polarizability times the permanent field, including
//! Ewald self, reciprocal, and optional reaction-field contributions) seed a
//! successive over-relaxation fixed point. Each iteration evaluates the
//! field of the current induced dipoles in real and reciprocal space, forms
//! the new dipoles, and applies the damped update; convergence is measured
//! as the RMS change in Debye over both dipole sets.

use std::sync::atomic::{AtomicBool, Ordering};

use nalgebra::Vector3;
use tracing::{debug, instrument, warn};

use crate::core::constants::DEBYE;
use crate::core::forcefield::params::Polarization;
use crate::core::models::multipole::{PhiTensor, T001, T010, T100};
use crate::engine::error::EngineError;
use crate::engine::parallel::sections;
use crate::engine::reciprocal::{ReactionField, ReciprocalSpace};

use super::tasks::induced_field;
use super::tasks::initialization::expand_induced_dipoles;
use super::tasks::RealSpaceContext;

pub(crate) struct ScfBuffers<'a> {
    pub field: &'a mut [Vector3<f64>],
    pub field_cr: &'a mut [Vector3<f64>],
    pub cart_mpole_phi: &'a [PhiTensor],
    pub induced: &'a mut Vec<Vec<Vector3<f64>>>,
    pub induced_cr: &'a mut Vec<Vec<Vector3<f64>>>,
    pub direct: &'a mut [Vector3<f64>],
    pub direct_cr: &'a mut [Vector3<f64>],
    pub cart_dipole_phi: &'a mut [PhiTensor],
    pub cart_dipole_phi_cr: &'a mut [PhiTensor],
}

#[instrument(skip_all, name = "self_consistent_field")]
#[allow(clippy::too_many_arguments)]
pub(crate) fn converge(
    ctx: &RealSpaceContext,
    polarization: Polarization,
    concurrent: bool,
    mut recip: Option<&mut (dyn ReciprocalSpace + 'static)>,
    mut reaction: Option<&mut (dyn ReactionField + 'static)>,
    buffers: &mut ScfBuffers,
    terminate: &AtomicBool,
) -> Result<usize, EngineError> {
    let n = ctx.n_atoms();
    let crystal = ctx.system.crystal();
    let atoms = ctx.system.atoms();
    let ewald = ctx.ewald;

    // Fold the Ewald self term and the reciprocal field into the direct
    // field.
    if ewald.aewald > 0.0 && recip.is_some() {
        for i in 0..n {
            let m = &ctx.global_mpole[0][i];
            let phi = &buffers.cart_mpole_phi[i];
            let f = Vector3::new(
                ewald.aewald3 * m[T100] - phi[T100],
                ewald.aewald3 * m[T010] - phi[T010],
                ewald.aewald3 * m[T001] - phi[T001],
            );
            buffers.field[i] += f;
            buffers.field_cr[i] += f;
        }
    }
    if let Some(rf) = reaction.as_deref_mut() {
        let gk = rf.compute_permanent_field();
        for i in 0..n {
            buffers.field[i] += gk[i];
            buffers.field_cr[i] += gk[i];
        }
    }

    // Direct dipoles seed the iteration.
    for i in 0..n {
        let alpha = atoms[i].polarizability;
        buffers.induced[0][i] = alpha * buffers.field[i];
        buffers.direct[i] = buffers.induced[0][i];
        buffers.induced_cr[0][i] = alpha * buffers.field_cr[i];
        buffers.direct_cr[i] = buffers.induced_cr[0][i];
    }
    expand_induced_dipoles(crystal, buffers.induced);
    expand_induced_dipoles(crystal, buffers.induced_cr);

    if polarization != Polarization::Mutual {
        return Ok(0);
    }

    let sor = ctx.params.polar_sor;
    let poleps = ctx.params.polar_eps;
    let max_iterations = ctx.params.scf_max_iterations;
    let mut eps_old = 100.0;
    let mut iterations = 0;

    loop {
        iterations += 1;

        if let Some(r) = recip.as_deref_mut() {
            if ewald.aewald > 0.0 {
                r.spline_induced_dipoles(buffers.induced, buffers.induced_cr, ctx.use_flags)?;
            }
        }
        let (mut mutual, recip_result) = sections(
            concurrent,
            || induced_field::run(ctx, buffers.induced, buffers.induced_cr),
            || -> Result<(), EngineError> {
                if let Some(r) = recip.as_deref_mut() {
                    if ewald.aewald > 0.0 {
                        r.induced_dipole_convolution()?;
                    }
                }
                Ok(())
            },
        );
        recip_result?;

        if let Some(r) = recip.as_deref_mut() {
            if ewald.aewald > 0.0 {
                r.compute_induced_phi(buffers.cart_dipole_phi, buffers.cart_dipole_phi_cr)?;
                for i in 0..n {
                    let phi = &buffers.cart_dipole_phi[i];
                    let phi_cr = &buffers.cart_dipole_phi_cr[i];
                    mutual.field[i] += ewald.aewald3 * buffers.induced[0][i]
                        - Vector3::new(phi[T100], phi[T010], phi[T001]);
                    mutual.field_cr[i] += ewald.aewald3 * buffers.induced_cr[0][i]
                        - Vector3::new(phi_cr[T100], phi_cr[T010], phi_cr[T001]);
                }
            }
        }
        if let Some(rf) = reaction.as_deref_mut() {
            let (gk, gk_cr) = rf.compute_induced_field(&buffers.induced[0], &buffers.induced_cr[0]);
            for i in 0..n {
                mutual.field[i] += gk[i];
                mutual.field_cr[i] += gk_cr[i];
            }
        }

        // SOR update against the direct seed.
        let mut eps = 0.0;
        let mut eps_cr = 0.0;
        for i in 0..n {
            let alpha = atoms[i].polarizability;

            let previous = buffers.induced[0][i];
            let fresh = buffers.direct[i] + alpha * mutual.field[i];
            let delta = sor * (fresh - previous);
            buffers.induced[0][i] = previous + delta;
            eps += delta.norm_squared();

            let previous = buffers.induced_cr[0][i];
            let fresh = buffers.direct_cr[i] + alpha * mutual.field_cr[i];
            let delta = sor * (fresh - previous);
            buffers.induced_cr[0][i] = previous + delta;
            eps_cr += delta.norm_squared();
        }
        expand_induced_dipoles(crystal, buffers.induced);
        expand_induced_dipoles(crystal, buffers.induced_cr);

        let eps = DEBYE * (eps.max(eps_cr) / n as f64).sqrt();
        debug!(iteration = iterations, rms_debye = eps, "SCF");

        if eps < poleps {
            return Ok(iterations);
        }
        if eps > eps_old {
            return Err(EngineError::ScfDivergence {
                eps,
                previous: eps_old,
            });
        }
        if iterations >= max_iterations {
            return Err(EngineError::ScfMaxIterations {
                iterations: max_iterations,
            });
        }
        if terminate.load(Ordering::Relaxed) {
            warn!(
                iteration = iterations,
                rms_debye = eps,
                "termination requested; returning best-effort induced dipoles"
            );
            return Ok(iterations);
        }
        eps_old = eps;
    }
}
