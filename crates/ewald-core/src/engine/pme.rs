//! The Particle Mesh Ewald engine.
//!
//! Constructed once per simulation from the electrostatics parameters, the
//! molecular system, and real-space neighbor lists; evaluated many times.
//! Each energy call expands coordinates to every symmetry image, rotates the
//! permanent multipoles into the global frame, converges the induced
//! dipoles, assembles self, reciprocal, and real-space contributions, and
//! finally projects multipole torques onto the frame-defining atoms.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use nalgebra::Vector3;
use tracing::{debug, info};

use crate::core::forcefield::params::{ElectrostaticsParams, Polarization};
use crate::core::models::multipole::{FrameDefinition, MultipoleTensor, PhiTensor};
use crate::core::models::system::{MolecularSystem, NeighborLists};
use crate::engine::config::{ewald_coefficient, EvaluationConfig, EwaldParameters};
use crate::engine::error::EngineError;
use crate::engine::lambda::LambdaState;
use crate::engine::parallel::{self, merge_vec, sections};
use crate::engine::reciprocal::{
    induced_reciprocal_energy, induced_self_energy, permanent_reciprocal_energy,
    permanent_self_energy, InducedRecipInputs, ReactionField, RecipOutputs, ReciprocalSpace,
};
use crate::engine::scf::{self, ScfBuffers};
use crate::engine::tasks::real_space_energy::{self, EnergyInputs};
use crate::engine::tasks::{
    initialization, permanent_field, rotate_multipoles, torque, RealSpaceContext,
};

/// Result of one energy evaluation.
#[derive(Debug, Clone, Copy, Default)]
pub struct EnergySummary {
    /// Permanent multipole energy (self + reciprocal + real space), kcal/mol.
    pub permanent: f64,
    /// Polarization energy (self + reciprocal + real space), kcal/mol.
    pub polarization: f64,
    /// Number of real-space pair interactions plus self interactions.
    pub interactions: usize,
    /// SCF iterations of the last converged leg (0 for direct polarization).
    pub scf_iterations: usize,
}

impl EnergySummary {
    pub fn total(&self) -> f64 {
        self.permanent + self.polarization
    }
}

pub struct ParticleMeshEwald {
    system: MolecularSystem,
    neighbor_lists: NeighborLists,
    params: ElectrostaticsParams,
    polarization: Polarization,
    ewald: EwaldParameters,
    n_symm: usize,
    lambda_term: bool,
    concurrent_sections: bool,

    recip: Option<Box<dyn ReciprocalSpace>>,
    reaction_field: Option<Box<dyn ReactionField>>,
    lambda: Option<LambdaState>,
    terminate: Arc<AtomicBool>,

    /// Local-frame multipoles, extracted once.
    local_mpole: Vec<MultipoleTensor>,

    // Per-call scratch, sized at construction.
    coordinates: Vec<Vec<Vector3<f64>>>,
    global_mpole: Vec<Vec<MultipoleTensor>>,
    induced: Vec<Vec<Vector3<f64>>>,
    induced_cr: Vec<Vec<Vector3<f64>>>,
    direct: Vec<Vector3<f64>>,
    direct_cr: Vec<Vector3<f64>>,
    field: Vec<Vector3<f64>>,
    field_cr: Vec<Vector3<f64>>,
    cart_mpole_phi: Vec<PhiTensor>,
    cart_dipole_phi: Vec<PhiTensor>,
    cart_dipole_phi_cr: Vec<PhiTensor>,
    grad: Vec<Vector3<f64>>,
    torque: Vec<Vector3<f64>>,
    lambda_grad: Vec<Vector3<f64>>,
    lambda_torque: Vec<Vector3<f64>>,
    use_flags: Vec<bool>,

    multipole_energy: f64,
    polarization_energy: f64,
    interactions: usize,
    dudl: f64,
    d2udl2: f64,
}

impl ParticleMeshEwald {
    pub fn new(
        params: ElectrostaticsParams,
        system: MolecularSystem,
        neighbor_lists: NeighborLists,
    ) -> Result<Self, EngineError> {
        let n = system.num_atoms();
        if n < 1 {
            return Err(EngineError::Configuration(
                "the system holds no atoms".into(),
            ));
        }
        for (i, atom) in system.atoms().iter().enumerate() {
            let required = match atom.frame {
                FrameDefinition::None => 0,
                FrameDefinition::ZThenX | FrameDefinition::Bisector => 2,
                FrameDefinition::ZThenBisector | FrameDefinition::Threefold => 3,
            };
            if atom.axis_atoms.len() < required {
                return Err(EngineError::Configuration(format!(
                    "atom {i} needs {required} axis atoms for its multipole frame, found {}",
                    atom.axis_atoms.len()
                )));
            }
            if atom.axis_atoms.iter().any(|&a| a >= n) {
                return Err(EngineError::Configuration(format!(
                    "atom {i} references an axis atom outside the system"
                )));
            }
            if atom.polarizability < 0.0 {
                return Err(EngineError::Configuration(format!(
                    "atom {i} carries a negative polarizability"
                )));
            }
        }

        let params = params.validated();
        let crystal = system.crystal();
        let off = params
            .ewald_cutoff
            .unwrap_or(if crystal.is_aperiodic() { 100.0 } else { 7.0 });
        let aewald = params.ewald_alpha.unwrap_or_else(|| {
            if crystal.is_aperiodic() {
                0.0
            } else {
                ewald_coefficient(off, params.ewald_precision)
            }
        });
        let ewald = EwaldParameters::new(off, aewald);
        let n_symm = crystal.num_sym_ops();
        let polarization = params.polarization;
        let lambda_term = params.lambda_term;
        let concurrent_sections = params.real_space_threads.is_some();

        info!(
            polarization = ?polarization,
            cutoff = off,
            ewald_coefficient = aewald,
            symmetry_operators = n_symm,
            "electrostatics engine initialized"
        );
        if polarization == Polarization::Mutual {
            debug!(
                scf_tolerance = params.polar_eps,
                sor = params.polar_sor,
                "mutual polarization enabled"
            );
        }

        let local_mpole = system.atoms().iter().map(|a| a.multipole).collect();
        let lambda = lambda_term.then(|| LambdaState::new(n));

        Ok(Self {
            neighbor_lists,
            polarization,
            ewald,
            n_symm,
            lambda_term,
            concurrent_sections,
            recip: None,
            reaction_field: None,
            lambda,
            terminate: Arc::new(AtomicBool::new(false)),
            local_mpole,
            coordinates: vec![vec![Vector3::zeros(); n]; n_symm],
            global_mpole: vec![vec![[0.0; 10]; n]; n_symm],
            induced: vec![vec![Vector3::zeros(); n]; n_symm],
            induced_cr: vec![vec![Vector3::zeros(); n]; n_symm],
            direct: vec![Vector3::zeros(); n],
            direct_cr: vec![Vector3::zeros(); n],
            field: vec![Vector3::zeros(); n],
            field_cr: vec![Vector3::zeros(); n],
            cart_mpole_phi: vec![[0.0; 20]; n],
            cart_dipole_phi: vec![[0.0; 20]; n],
            cart_dipole_phi_cr: vec![[0.0; 20]; n],
            grad: vec![Vector3::zeros(); n],
            torque: vec![Vector3::zeros(); n],
            lambda_grad: vec![Vector3::zeros(); n],
            lambda_torque: vec![Vector3::zeros(); n],
            use_flags: vec![true; n],
            multipole_energy: 0.0,
            polarization_energy: 0.0,
            interactions: 0,
            dudl: 0.0,
            d2udl2: 0.0,
            params,
            system,
        })
    }

    /// Attaches the reciprocal-space convolution collaborator.
    pub fn with_reciprocal(mut self, recip: Box<dyn ReciprocalSpace>) -> Self {
        self.recip = Some(recip);
        self
    }

    /// Attaches an implicit-solvent reaction field collaborator.
    pub fn with_reaction_field(mut self, reaction: Box<dyn ReactionField>) -> Self {
        self.reaction_field = Some(reaction);
        self
    }

    /// Cooperative cancellation: setting the flag ends the SCF after the
    /// current iteration with a best-effort result.
    pub fn termination_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.terminate)
    }

    pub fn set_lambda(&mut self, lambda: f64) -> Result<(), EngineError> {
        if !(0.0..=1.0).contains(&lambda) {
            return Err(EngineError::Configuration(format!(
                "lambda {lambda} outside [0, 1]"
            )));
        }
        let state = self.lambda.as_mut().ok_or_else(|| {
            EngineError::Configuration("lambda scaling was not enabled at construction".into())
        })?;
        state.set_lambda(lambda, &self.params, self.system.atoms());
        Ok(())
    }

    pub fn system(&self) -> &MolecularSystem {
        &self.system
    }

    pub fn system_mut(&mut self) -> &mut MolecularSystem {
        &mut self.system
    }

    pub fn gradient(&self) -> &[Vector3<f64>] {
        &self.grad
    }

    pub fn lambda_gradient(&self) -> &[Vector3<f64>] {
        &self.lambda_grad
    }

    pub fn induced_dipoles(&self) -> &[Vector3<f64>] {
        &self.induced[0]
    }

    pub fn dedl(&self) -> f64 {
        self.dudl
    }

    pub fn d2edl2(&self) -> f64 {
        self.d2udl2
    }

    /// Computes the total electrostatic energy, optionally with gradients.
    pub fn energy(&mut self, gradient: bool) -> Result<EnergySummary, EngineError> {
        let n = self.system.num_atoms();
        self.multipole_energy = 0.0;
        self.polarization_energy = 0.0;
        self.interactions = 0;
        self.dudl = 0.0;
        self.d2udl2 = 0.0;
        self.use_flags.iter_mut().for_each(|u| *u = true);

        initialization::expand_coordinates(&self.system, &mut self.coordinates);
        for buffer in [
            &mut self.grad,
            &mut self.torque,
            &mut self.lambda_grad,
            &mut self.lambda_torque,
            &mut self.direct,
            &mut self.direct_cr,
            &mut self.field,
            &mut self.field_cr,
        ] {
            initialization::clear(buffer);
        }
        for image in self.induced.iter_mut().chain(self.induced_cr.iter_mut()) {
            initialization::clear(image);
        }
        for phi in self
            .cart_mpole_phi
            .iter_mut()
            .chain(self.cart_dipole_phi.iter_mut())
            .chain(self.cart_dipole_phi_cr.iter_mut())
        {
            *phi = [0.0; 20];
        }

        rotate_multipoles::run(
            self.system.atoms(),
            &self.coordinates,
            &mut self.global_mpole,
        );

        let mut scf_iterations = 0;
        if !self.lambda_term {
            let cfg = EvaluationConfig {
                gradient,
                ..Default::default()
            };
            scf_iterations = self.compute_energy(&cfg)?;
        } else {
            let (lambda_value, l_pow_perm, l_pow_pol) = {
                let l = self.lambda.as_ref().ok_or_else(|| {
                    EngineError::Internal("lambda term enabled without lambda state".into())
                })?;
                (l.lambda, l.l_pow_perm, l.l_pow_pol)
            };
            let pol_start = self.params.polarization_lambda_start;
            let pol_end = self.params.polarization_lambda_end;

            // Leg 1: the whole system under periodic boundary conditions.
            let mut cfg = EvaluationConfig {
                gradient,
                permanent_scale: l_pow_perm,
                ..Default::default()
            };
            if lambda_value < pol_start {
                cfg.do_polarization = false;
            } else if lambda_value <= pol_end {
                cfg.polarization_scale = l_pow_pol;
            }
            scf_iterations = self.compute_energy(&cfg)?;

            // Leg 2: the environment without the soft atoms; permanent real
            // space is excluded, reciprocal space scaled by the complement.
            for (u, atom) in self.use_flags.iter_mut().zip(self.system.atoms()) {
                *u = !atom.apply_lambda;
            }
            let mut cfg = EvaluationConfig {
                gradient,
                do_permanent_real_space: false,
                permanent_scale: 1.0 - l_pow_perm,
                dedl_sign: -1.0,
                ..Default::default()
            };
            if lambda_value <= pol_end {
                cfg.polarization_scale = 1.0 - l_pow_pol;
            } else {
                cfg.do_polarization = false;
            }
            self.compute_energy(&cfg)?;

            // Leg 3: the soft atoms alone in vacuum; no reciprocal space and
            // no symmetry mates.
            for (u, atom) in self.use_flags.iter_mut().zip(self.system.atoms()) {
                *u = atom.apply_lambda;
            }
            let saved_ewald = self.ewald;
            self.ewald = EwaldParameters::new(12.0, 0.0);
            cfg.do_permanent_real_space = true;
            cfg.use_symmetry = false;
            let result = self.compute_energy(&cfg);
            self.ewald = saved_ewald;
            result?;
        }

        if gradient || self.lambda_term {
            self.reduce_torques(gradient);
        }

        Ok(EnergySummary {
            permanent: self.multipole_energy,
            polarization: self.polarization_energy,
            interactions: self.interactions,
            scf_iterations,
        })
    }

    /// One evaluation leg: permanent field, SCF, and energy assembly under
    /// the switches in `cfg`.
    fn compute_energy(&mut self, cfg: &EvaluationConfig) -> Result<usize, EngineError> {
        let n = self.system.num_atoms();
        let ewald = self.ewald;
        let reciprocal_active = ewald.aewald > 0.0 && self.recip.is_some();
        let concurrent = self.concurrent_sections;

        let ctx = RealSpaceContext {
            system: &self.system,
            neighbor_lists: &self.neighbor_lists,
            coordinates: &self.coordinates,
            global_mpole: &self.global_mpole,
            use_flags: &self.use_flags,
            ewald: &ewald,
            params: &self.params,
            n_symm: if cfg.use_symmetry { self.n_symm } else { 1 },
        };

        // Permanent multipole field: the real-space pair sum and the
        // reciprocal convolution run as sibling sections.
        let recip = &mut self.recip;
        if reciprocal_active {
            if let Some(r) = recip.as_deref_mut() {
                r.compute_bsplines()?;
                r.spline_permanent_multipoles(&self.global_mpole, &self.use_flags)?;
            }
        }
        let (field_accum, recip_result) = sections(
            concurrent,
            || permanent_field::run(&ctx),
            || -> Result<(), EngineError> {
                if reciprocal_active {
                    if let Some(r) = recip.as_deref_mut() {
                        r.permanent_multipole_convolution()?;
                    }
                }
                Ok(())
            },
        );
        recip_result?;
        self.field.copy_from_slice(&field_accum.field);
        self.field_cr.copy_from_slice(&field_accum.field_cr);
        if reciprocal_active {
            if let Some(r) = self.recip.as_deref_mut() {
                r.compute_permanent_phi(&mut self.cart_mpole_phi)?;
            }
        }
        if let Some(rf) = self.reaction_field.as_deref_mut() {
            rf.compute_born_radii();
        }

        // Induced dipoles.
        let mut scf_iterations = 0;
        let mut eselfi = 0.0;
        let mut erecipi = 0.0;
        let do_polarization = self.polarization != Polarization::None && cfg.do_polarization;
        if do_polarization {
            {
                let mut buffers = ScfBuffers {
                    field: &mut self.field,
                    field_cr: &mut self.field_cr,
                    cart_mpole_phi: &self.cart_mpole_phi,
                    induced: &mut self.induced,
                    induced_cr: &mut self.induced_cr,
                    direct: &mut self.direct,
                    direct_cr: &mut self.direct_cr,
                    cart_dipole_phi: &mut self.cart_dipole_phi,
                    cart_dipole_phi_cr: &mut self.cart_dipole_phi_cr,
                };
                scf_iterations = scf::converge(
                    &ctx,
                    self.polarization,
                    concurrent,
                    self.recip.as_deref_mut().filter(|_| reciprocal_active),
                    self.reaction_field.as_deref_mut(),
                    &mut buffers,
                    &self.terminate,
                )?;
            }

            if reciprocal_active {
                let mut out = RecipOutputs {
                    grad: &mut self.grad,
                    torque: &mut self.torque,
                    lambda_grad: &mut self.lambda_grad,
                    lambda_torque: &mut self.lambda_torque,
                    dudl: &mut self.dudl,
                    d2udl2: &mut self.d2udl2,
                };
                eselfi = induced_self_energy(
                    &self.global_mpole[0],
                    &self.induced[0],
                    &self.induced_cr[0],
                    &self.use_flags,
                    &ewald,
                    cfg,
                    self.lambda.as_ref(),
                    &mut out,
                );

                // The induced reciprocal energy needs fresh induced phis in
                // direct mode; mutual mode reuses the final SCF convolution.
                if cfg.gradient && self.polarization == Polarization::Direct {
                    if let Some(r) = self.recip.as_deref_mut() {
                        r.spline_induced_dipoles(
                            &self.induced,
                            &self.induced_cr,
                            &self.use_flags,
                        )?;
                        r.induced_dipole_convolution()?;
                        r.compute_induced_phi(
                            &mut self.cart_dipole_phi,
                            &mut self.cart_dipole_phi_cr,
                        )?;
                    }
                } else if let Some(r) = self.recip.as_deref_mut() {
                    r.cart_to_frac_induced_dipoles(&self.induced, &self.induced_cr);
                }
                if let Some(r) = self.recip.as_deref() {
                    let inputs = InducedRecipInputs {
                        mpole: &self.global_mpole[0],
                        frac_mpole: r.frac_multipoles(),
                        frac_mpole_phi: r.frac_multipole_phi(),
                        frac_induced: r.frac_induced_dipoles(),
                        frac_induced_cr: r.frac_induced_dipoles_cr(),
                        cart_phi: &self.cart_dipole_phi,
                        cart_phi_cr: &self.cart_dipole_phi_cr,
                        frac_phi: r.frac_induced_dipole_phi(),
                        frac_phi_cr: r.frac_induced_dipole_cr_phi(),
                        grid: r.grid_dimensions(),
                        recip_matrix: self.system.crystal().reciprocal(),
                        mutual: self.polarization == Polarization::Mutual,
                    };
                    let mut out = RecipOutputs {
                        grad: &mut self.grad,
                        torque: &mut self.torque,
                        lambda_grad: &mut self.lambda_grad,
                        lambda_torque: &mut self.lambda_torque,
                        dudl: &mut self.dudl,
                        d2udl2: &mut self.d2udl2,
                    };
                    erecipi = induced_reciprocal_energy(
                        &inputs,
                        &self.use_flags,
                        cfg,
                        self.lambda.as_ref(),
                        &mut out,
                    );
                }
            }
        }

        // Permanent self and reciprocal energies.
        let mut eself = 0.0;
        let mut erecip = 0.0;
        if reciprocal_active {
            let raw = permanent_self_energy(&self.local_mpole, &self.use_flags, &ewald);
            if let Some(l) = self.lambda.as_ref() {
                self.dudl += cfg.dedl_sign * l.dl_pow_perm * raw;
                self.d2udl2 += cfg.dedl_sign * l.d2l_pow_perm * raw;
            }
            eself = cfg.permanent_scale * raw;
            self.interactions += n;

            if let Some(r) = self.recip.as_deref() {
                let mut out = RecipOutputs {
                    grad: &mut self.grad,
                    torque: &mut self.torque,
                    lambda_grad: &mut self.lambda_grad,
                    lambda_torque: &mut self.lambda_torque,
                    dudl: &mut self.dudl,
                    d2udl2: &mut self.d2udl2,
                };
                erecip = permanent_reciprocal_energy(
                    &self.global_mpole[0],
                    &self.cart_mpole_phi,
                    r.frac_multipoles(),
                    r.frac_multipole_phi(),
                    r.grid_dimensions(),
                    &self.system.crystal().reciprocal(),
                    &self.use_flags,
                    cfg,
                    self.lambda.as_ref(),
                    &mut out,
                );
            }
        }

        // Real-space pair energy, force, and torque.
        let ctx = RealSpaceContext {
            system: &self.system,
            neighbor_lists: &self.neighbor_lists,
            coordinates: &self.coordinates,
            global_mpole: &self.global_mpole,
            use_flags: &self.use_flags,
            ewald: &ewald,
            params: &self.params,
            n_symm: if cfg.use_symmetry { self.n_symm } else { 1 },
        };
        let inputs = EnergyInputs {
            ctx: &ctx,
            induced: &self.induced,
            induced_cr: &self.induced_cr,
            config: cfg,
            lambda: self.lambda.as_ref(),
            polarization: self.polarization,
        };
        let accum = real_space_energy::run(&inputs);
        let ereal = accum.permanent_energy;
        let ereali = accum.induced_energy;
        self.interactions += accum.interactions;
        for (dst, src) in self.grad.iter_mut().zip(&accum.grad) {
            *dst += *src;
        }
        for (dst, src) in self.torque.iter_mut().zip(&accum.torque) {
            *dst += *src;
        }
        for (dst, src) in self.lambda_grad.iter_mut().zip(&accum.lambda_grad) {
            *dst += *src;
        }
        for (dst, src) in self.lambda_torque.iter_mut().zip(&accum.lambda_torque) {
            *dst += *src;
        }
        self.dudl += accum.dudl;
        self.d2udl2 += accum.d2udl2;

        self.multipole_energy += eself + erecip + ereal;
        self.polarization_energy += eselfi + erecipi + ereali;
        debug!(
            self_energy = eself,
            reciprocal = erecip,
            real_space = ereal,
            polarization_self = eselfi,
            polarization_reciprocal = erecipi,
            polarization_real_space = ereali,
            "energy components"
        );
        Ok(scf_iterations)
    }

    /// Final reduce region: convert accumulated torques into forces on the
    /// frame-defining atoms.
    fn reduce_torques(&mut self, gradient: bool) {
        let n = self.system.num_atoms();
        let atoms = self.system.atoms();
        let coords = &self.coordinates[0];

        if gradient {
            let torques = &self.torque;
            let add = parallel::region(
                n,
                |range| {
                    let mut local = vec![Vector3::zeros(); n];
                    for i in range {
                        torque::project(i, &atoms[i], coords, &torques[i], &mut |j, f| {
                            local[j] += f
                        });
                    }
                    local
                },
                merge_vec,
            );
            if let Some(add) = add {
                for (g, a) in self.grad.iter_mut().zip(add) {
                    *g += a;
                }
            }
        }
        if self.lambda_term {
            let torques = &self.lambda_torque;
            let add = parallel::region(
                n,
                |range| {
                    let mut local = vec![Vector3::zeros(); n];
                    for i in range {
                        torque::project(i, &atoms[i], coords, &torques[i], &mut |j, f| {
                            local[j] += f
                        });
                    }
                    local
                },
                merge_vec,
            );
            if let Some(add) = add {
                for (g, a) in self.lambda_grad.iter_mut().zip(add) {
                    *g += a;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::constants::{ELECTRIC, SQRT_PI};
    use crate::core::models::atom::Atom;
    use crate::core::models::crystal::Crystal;
    use crate::core::models::multipole::{T000, T001, T002, T020, T100, T101, T200};
    use crate::engine::reciprocal::ReciprocalError;
    use approx::assert_relative_eq;
    use std::sync::atomic::Ordering;

    fn charge_atom(position: Vector3<f64>, charge: f64) -> Atom {
        let mut atom = Atom::new(position, 0);
        atom.multipole[T000] = charge;
        atom
    }

    fn charge_system(charges: &[(Vector3<f64>, f64)]) -> MolecularSystem {
        let atoms = charges
            .iter()
            .map(|&(p, q)| charge_atom(p, q))
            .collect::<Vec<_>>();
        MolecularSystem::new(atoms, Crystal::aperiodic(), &[])
    }

    fn charge_engine(
        charges: &[(Vector3<f64>, f64)],
        params: ElectrostaticsParams,
    ) -> ParticleMeshEwald {
        let system = charge_system(charges);
        let lists = NeighborLists::all_pairs(system.num_atoms(), 1);
        ParticleMeshEwald::new(params, system, lists).unwrap()
    }

    /// AMOEBA-flavored water: bisector-frame oxygen, z-then-x hydrogens,
    /// whole molecule one polarization group.
    fn water_atoms(origin: Vector3<f64>, flip_z: f64) -> Vec<Atom> {
        let dz = 0.5858 * flip_z;
        let o_pos = origin;
        let h1_pos = origin + Vector3::new(0.7572, 0.0, dz);
        let h2_pos = origin + Vector3::new(-0.7572, 0.0, dz);

        let mut o = Atom::new(o_pos, 0);
        o.multipole[T000] = -0.51966;
        o.multipole[T001] = 0.07556;
        o.multipole[T200] = 0.354;
        o.multipole[T020] = -0.390;
        o.multipole[T002] = 0.036;
        o.frame = FrameDefinition::Bisector;
        o = o.with_polarize(0.837, 0.39, vec![1]);

        let mut h = Atom::new(h1_pos, 1);
        h.multipole[T000] = 0.25983;
        h.multipole[T100] = -0.0204;
        h.multipole[T001] = -0.0308;
        h.multipole[T200] = -0.0103;
        h.multipole[T020] = -0.0300;
        h.multipole[T002] = 0.0403;
        h.multipole[T101] = -0.0006;
        h.frame = FrameDefinition::ZThenX;
        let h1 = h.clone().with_polarize(0.496, 0.39, vec![0]);
        let mut h2 = h.with_polarize(0.496, 0.39, vec![0]);
        h2.position = h2_pos;
        vec![o, h1, h2]
    }

    fn water_dimer() -> MolecularSystem {
        let mut atoms = water_atoms(Vector3::zeros(), 1.0);
        atoms.extend(water_atoms(Vector3::new(2.98, 0.0, 0.0), -1.0));
        // Axis atoms per molecule.
        for base in [0, 3] {
            atoms[base].axis_atoms = vec![base + 1, base + 2];
            atoms[base + 1].axis_atoms = vec![base, base + 2];
            atoms[base + 2].axis_atoms = vec![base, base + 1];
        }
        let bonds = [(0, 1), (0, 2), (3, 4), (3, 5)];
        MolecularSystem::new(atoms, Crystal::aperiodic(), &bonds)
    }

    fn dimer_engine(polarization: Polarization) -> ParticleMeshEwald {
        let params = ElectrostaticsParams {
            polarization,
            ..Default::default()
        };
        let system = water_dimer();
        let lists = NeighborLists::all_pairs(system.num_atoms(), 1);
        ParticleMeshEwald::new(params, system, lists).unwrap()
    }

    #[test]
    fn two_point_charges_recover_coulomb_law() {
        let params = ElectrostaticsParams {
            polarization: Polarization::None,
            ..Default::default()
        };
        let mut engine = charge_engine(
            &[
                (Vector3::zeros(), 1.0),
                (Vector3::new(5.0, 0.0, 0.0), -1.0),
            ],
            params,
        );
        let summary = engine.energy(true).unwrap();
        assert_relative_eq!(summary.permanent, -ELECTRIC / 5.0, epsilon = 1e-10);
        assert_relative_eq!(summary.polarization, 0.0);
        assert_eq!(summary.interactions, 1);

        // Attraction pulls the charges together; equal and opposite.
        let g = engine.gradient();
        assert_relative_eq!(g[0].x, -ELECTRIC / 25.0, epsilon = 1e-10);
        assert_relative_eq!(g[1].x, ELECTRIC / 25.0, epsilon = 1e-10);
        assert_relative_eq!((g[0] + g[1]).norm(), 0.0, epsilon = 1e-12);
    }

    #[test]
    fn rejects_empty_system() {
        let system = MolecularSystem::new(Vec::new(), Crystal::aperiodic(), &[]);
        let lists = NeighborLists::all_pairs(0, 1);
        let result = ParticleMeshEwald::new(ElectrostaticsParams::default(), system, lists);
        assert!(matches!(result, Err(EngineError::Configuration(_))));
    }

    #[test]
    fn rejects_frame_without_axis_atoms() {
        let mut atom = charge_atom(Vector3::zeros(), 1.0);
        atom.frame = FrameDefinition::ZThenX;
        let system = MolecularSystem::new(vec![atom], Crystal::aperiodic(), &[]);
        let lists = NeighborLists::all_pairs(1, 1);
        let result = ParticleMeshEwald::new(ElectrostaticsParams::default(), system, lists);
        assert!(matches!(result, Err(EngineError::Configuration(_))));
    }

    #[test]
    fn water_dimer_obeys_newtons_third_law() {
        let mut engine = dimer_engine(Polarization::Mutual);
        let summary = engine.energy(true).unwrap();
        assert!(summary.total().is_finite());
        let mut net = Vector3::zeros();
        for g in engine.gradient() {
            net += *g;
        }
        assert_relative_eq!(net.norm(), 0.0, epsilon = 1e-7);
    }

    #[test]
    fn water_dimer_scf_converges_quickly() {
        let mut engine = dimer_engine(Polarization::Mutual);
        let summary = engine.energy(false).unwrap();
        assert!(summary.scf_iterations > 0);
        assert!(summary.scf_iterations <= 20);
        assert!(summary.polarization.is_finite());
        assert!(summary.polarization != 0.0);
    }

    #[test]
    fn energy_is_translation_invariant() {
        let mut engine = dimer_engine(Polarization::Mutual);
        let reference = engine.energy(true).unwrap();
        let reference_grad = engine.gradient().to_vec();

        let shift = Vector3::new(11.3, -7.9, 3.4);
        let moved: Vec<_> = engine
            .system()
            .atoms()
            .iter()
            .map(|a| a.position + shift)
            .collect();
        engine.system_mut().set_positions(&moved);
        let translated = engine.energy(true).unwrap();

        assert_relative_eq!(reference.total(), translated.total(), epsilon = 1e-8);
        for (a, b) in reference_grad.iter().zip(engine.gradient()) {
            assert_relative_eq!((a - b).norm(), 0.0, epsilon = 1e-8);
        }
    }

    #[test]
    fn energy_is_rotation_invariant_and_forces_co_rotate() {
        let mut engine = dimer_engine(Polarization::Direct);
        let reference = engine.energy(true).unwrap();
        let reference_grad = engine.gradient().to_vec();

        let rot = nalgebra::Rotation3::from_euler_angles(0.7, -0.3, 1.9);
        let rotated: Vec<_> = engine
            .system()
            .atoms()
            .iter()
            .map(|a| rot * a.position)
            .collect();
        engine.system_mut().set_positions(&rotated);
        let after = engine.energy(true).unwrap();

        assert_relative_eq!(reference.total(), after.total(), epsilon = 1e-8);
        for (g0, g1) in reference_grad.iter().zip(engine.gradient()) {
            assert_relative_eq!((rot * *g0 - *g1).norm(), 0.0, epsilon = 1e-7);
        }
    }

    #[test]
    fn forces_match_finite_differences() {
        let mut engine = dimer_engine(Polarization::Direct);
        engine.energy(true).unwrap();
        let grad = engine.gradient().to_vec();

        let h = 1e-5;
        let base: Vec<_> = engine.system().atoms().iter().map(|a| a.position).collect();
        // Probe a representative set of degrees of freedom: the second
        // oxygen and one hydrogen of each molecule.
        for (atom, axis) in [(3, 0), (3, 2), (1, 0), (5, 0)] {
            let mut plus = base.clone();
            plus[atom][axis] += h;
            engine.system_mut().set_positions(&plus);
            let up = engine.energy(false).unwrap().total();

            let mut minus = base.clone();
            minus[atom][axis] -= h;
            engine.system_mut().set_positions(&minus);
            let down = engine.energy(false).unwrap().total();

            let numeric = (up - down) / (2.0 * h);
            assert_relative_eq!(grad[atom][axis], numeric, epsilon = 1e-5, max_relative = 1e-5);
        }
    }

    #[test]
    fn pair_energy_is_symmetric_under_label_swap() {
        let mut forward = dimer_engine(Polarization::Mutual);
        let e_forward = forward.energy(false).unwrap();

        // Rebuild with the two molecules listed in the opposite order.
        let mut atoms = water_atoms(Vector3::new(2.98, 0.0, 0.0), -1.0);
        atoms.extend(water_atoms(Vector3::zeros(), 1.0));
        for base in [0, 3] {
            atoms[base].axis_atoms = vec![base + 1, base + 2];
            atoms[base + 1].axis_atoms = vec![base, base + 2];
            atoms[base + 2].axis_atoms = vec![base, base + 1];
        }
        let bonds = [(0, 1), (0, 2), (3, 4), (3, 5)];
        let system = MolecularSystem::new(atoms, Crystal::aperiodic(), &bonds);
        let lists = NeighborLists::all_pairs(6, 1);
        let params = ElectrostaticsParams {
            polarization: Polarization::Mutual,
            ..Default::default()
        };
        let mut swapped = ParticleMeshEwald::new(params, system, lists).unwrap();
        let e_swapped = swapped.energy(false).unwrap();

        assert_relative_eq!(e_forward.total(), e_swapped.total(), epsilon = 1e-9);
    }

    #[test]
    fn scf_reaches_the_analytic_fixed_point_for_a_two_site_chain() {
        // Two polarizable charges on the x axis; the coupled linear system
        // has a closed-form solution when Thole damping has died off.
        let r = 4.0;
        let (q1, q2) = (1.0, -1.0);
        let alpha = 1.0;
        let a1 = charge_atom(Vector3::zeros(), q1).with_polarize(alpha, 0.39, vec![]);
        let a2 = charge_atom(Vector3::new(r, 0.0, 0.0), q2).with_polarize(alpha, 0.39, vec![]);
        let system = MolecularSystem::new(vec![a1, a2], Crystal::aperiodic(), &[]);
        let lists = NeighborLists::all_pairs(2, 1);
        let params = ElectrostaticsParams {
            polarization: Polarization::Mutual,
            ..Default::default()
        };
        let mut engine = ParticleMeshEwald::new(params, system, lists).unwrap();
        let summary = engine.energy(false).unwrap();
        assert!(summary.scf_iterations <= 20);

        // mu1 = a(E1 + t mu2), mu2 = a(E2 + t mu1) with t = 2/r^3.
        let e1 = -q2 / (r * r);
        let e2 = q1 / (r * r);
        let t = 2.0 / (r * r * r);
        let mu1 = (alpha * e1 + alpha * alpha * t * e2) / (1.0 - alpha * alpha * t * t);
        let mu2 = (alpha * e2 + alpha * alpha * t * e1) / (1.0 - alpha * alpha * t * t);

        let induced = engine.induced_dipoles();
        assert_relative_eq!(induced[0].x, mu1, epsilon = 1e-6);
        assert_relative_eq!(induced[1].x, mu2, epsilon = 1e-6);
        assert_relative_eq!(induced[0].y, 0.0, epsilon = 1e-12);
    }

    #[test]
    fn termination_flag_stops_scf_after_one_iteration() {
        let mut engine = dimer_engine(Polarization::Mutual);
        engine.termination_flag().store(true, Ordering::Relaxed);
        let summary = engine.energy(false).unwrap();
        assert_eq!(summary.scf_iterations, 1);
        assert!(summary.total().is_finite());
    }

    /// Scripted reciprocal-space double: produces no potential, but lets the
    /// self-energy and trait plumbing run.
    struct SilentReciprocal {
        frac_mpole: Vec<MultipoleTensor>,
        frac_phi: Vec<PhiTensor>,
        frac_ind: Vec<Vector3<f64>>,
    }

    impl SilentReciprocal {
        fn new(n: usize) -> Self {
            Self {
                frac_mpole: vec![[0.0; 10]; n],
                frac_phi: vec![[0.0; 20]; n],
                frac_ind: vec![Vector3::zeros(); n],
            }
        }
    }

    impl ReciprocalSpace for SilentReciprocal {
        fn compute_bsplines(&mut self) -> Result<(), ReciprocalError> {
            Ok(())
        }
        fn spline_permanent_multipoles(
            &mut self,
            _: &[Vec<MultipoleTensor>],
            _: &[bool],
        ) -> Result<(), ReciprocalError> {
            Ok(())
        }
        fn permanent_multipole_convolution(&mut self) -> Result<(), ReciprocalError> {
            Ok(())
        }
        fn compute_permanent_phi(
            &mut self,
            cart_phi: &mut [PhiTensor],
        ) -> Result<(), ReciprocalError> {
            cart_phi.iter_mut().for_each(|p| *p = [0.0; 20]);
            Ok(())
        }
        fn spline_induced_dipoles(
            &mut self,
            _: &[Vec<Vector3<f64>>],
            _: &[Vec<Vector3<f64>>],
            _: &[bool],
        ) -> Result<(), ReciprocalError> {
            Ok(())
        }
        fn induced_dipole_convolution(&mut self) -> Result<(), ReciprocalError> {
            Ok(())
        }
        fn compute_induced_phi(
            &mut self,
            phi: &mut [PhiTensor],
            phi_cr: &mut [PhiTensor],
        ) -> Result<(), ReciprocalError> {
            phi.iter_mut().for_each(|p| *p = [0.0; 20]);
            phi_cr.iter_mut().for_each(|p| *p = [0.0; 20]);
            Ok(())
        }
        fn cart_to_frac_induced_dipoles(
            &mut self,
            _: &[Vec<Vector3<f64>>],
            _: &[Vec<Vector3<f64>>],
        ) {
        }
        fn frac_multipoles(&self) -> &[MultipoleTensor] {
            &self.frac_mpole
        }
        fn frac_multipole_phi(&self) -> &[PhiTensor] {
            &self.frac_phi
        }
        fn frac_induced_dipoles(&self) -> &[Vector3<f64>] {
            &self.frac_ind
        }
        fn frac_induced_dipoles_cr(&self) -> &[Vector3<f64>] {
            &self.frac_ind
        }
        fn frac_induced_dipole_phi(&self) -> &[PhiTensor] {
            &self.frac_phi
        }
        fn frac_induced_dipole_cr_phi(&self) -> &[PhiTensor] {
            &self.frac_phi
        }
        fn grid_dimensions(&self) -> (usize, usize, usize) {
            (24, 24, 24)
        }
    }

    #[test]
    fn single_ion_self_energy_matches_closed_form() {
        let alpha = 0.54;
        let params = ElectrostaticsParams {
            polarization: Polarization::None,
            ewald_cutoff: Some(9.0),
            ewald_alpha: Some(alpha),
            ..Default::default()
        };
        let atoms = vec![charge_atom(Vector3::new(10.0, 10.0, 10.0), 1.0)];
        let system = MolecularSystem::new(atoms, Crystal::cubic(20.0), &[]);
        let lists = NeighborLists::all_pairs(1, 1);
        let mut engine = ParticleMeshEwald::new(params, system, lists)
            .unwrap()
            .with_reciprocal(Box::new(SilentReciprocal::new(1)));
        let summary = engine.energy(false).unwrap();
        // Real space has no pairs and the scripted reciprocal potential is
        // zero, leaving only the self term.
        assert_relative_eq!(
            summary.permanent,
            -ELECTRIC * alpha / SQRT_PI,
            epsilon = 1e-10
        );
        assert_eq!(summary.interactions, 1);
    }

    fn lambda_test_charges() -> Vec<(Vector3<f64>, f64, bool)> {
        vec![
            (Vector3::new(0.0, 0.0, 0.0), 0.6, false),
            (Vector3::new(3.5, 0.0, 0.0), -0.6, false),
            (Vector3::new(0.7, 2.9, 0.0), 0.4, true),
            (Vector3::new(2.6, 3.1, 0.0), -0.4, true),
        ]
    }

    fn lambda_engine(permanent_lambda_alpha: f64) -> ParticleMeshEwald {
        let atoms: Vec<_> = lambda_test_charges()
            .into_iter()
            .map(|(p, q, soft)| {
                let mut a = charge_atom(p, q);
                a.apply_lambda = soft;
                a
            })
            .collect();
        let system = MolecularSystem::new(atoms, Crystal::aperiodic(), &[]);
        let lists = NeighborLists::all_pairs(4, 1);
        let params = ElectrostaticsParams {
            polarization: Polarization::None,
            lambda_term: true,
            permanent_lambda_alpha,
            ..Default::default()
        };
        ParticleMeshEwald::new(params, system, lists).unwrap()
    }

    #[test]
    fn lambda_one_recovers_full_electrostatics() {
        let mut scaled = lambda_engine(1.0);
        scaled.set_lambda(1.0).unwrap();
        let at_one = scaled.energy(false).unwrap().total();

        let atoms: Vec<_> = lambda_test_charges()
            .into_iter()
            .map(|(p, q, _)| (p, q))
            .collect();
        let params = ElectrostaticsParams {
            polarization: Polarization::None,
            ..Default::default()
        };
        let mut full = charge_engine(&atoms, params);
        let reference = full.energy(false).unwrap().total();
        assert_relative_eq!(at_one, reference, epsilon = 1e-9);
    }

    #[test]
    fn lambda_zero_decouples_the_soft_atoms() {
        // Without the soft-core buffer the vacuum leg is exact Coulomb, so
        // the endpoint decomposes into the two isolated subsystems.
        let mut scaled = lambda_engine(0.0);
        scaled.set_lambda(0.0).unwrap();
        let at_zero = scaled.energy(false).unwrap().total();

        let params = ElectrostaticsParams {
            polarization: Polarization::None,
            ..Default::default()
        };
        let hard: Vec<_> = lambda_test_charges()
            .into_iter()
            .filter(|&(_, _, soft)| !soft)
            .map(|(p, q, _)| (p, q))
            .collect();
        let soft: Vec<_> = lambda_test_charges()
            .into_iter()
            .filter(|&(_, _, soft)| soft)
            .map(|(p, q, _)| (p, q))
            .collect();
        let mut env = charge_engine(&hard, params.clone());
        let mut ligand = charge_engine(&soft, params);
        let expected = env.energy(false).unwrap().total() + ligand.energy(false).unwrap().total();
        assert_relative_eq!(at_zero, expected, epsilon = 1e-9);
    }

    #[test]
    fn lambda_derivative_matches_finite_differences() {
        let mut engine = lambda_engine(1.0);
        engine.set_lambda(0.7).unwrap();
        engine.energy(false).unwrap();
        let analytic = engine.dedl();

        let h = 1e-4;
        engine.set_lambda(0.7 + h).unwrap();
        let up = engine.energy(false).unwrap().total();
        engine.set_lambda(0.7 - h).unwrap();
        let down = engine.energy(false).unwrap().total();
        let numeric = (up - down) / (2.0 * h);
        assert_relative_eq!(analytic, numeric, epsilon = 1e-3, max_relative = 1e-3);
    }

    #[test]
    fn lambda_outside_unit_interval_is_rejected() {
        let mut engine = lambda_engine(1.0);
        assert!(matches!(
            engine.set_lambda(1.5),
            Err(EngineError::Configuration(_))
        ));
    }
}
