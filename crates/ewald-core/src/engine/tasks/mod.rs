//! Data-parallel engine tasks.
//!
//! Each submodule is one parallel region of the energy evaluation. They share
//! the damped interaction tensors computed here: the Ewald-screened `bn`
//! kernels, the rational-distance `rr` kernels used to subtract masked
//! interactions, and the Thole polarization damping scales.

pub mod induced_field;
pub mod initialization;
pub mod permanent_field;
pub mod real_space_energy;
pub mod rotate_multipoles;
pub mod torque;

use nalgebra::Vector3;
use statrs::function::erf::erfc;

use crate::core::forcefield::params::ElectrostaticsParams;
use crate::core::models::multipole::MultipoleTensor;
use crate::core::models::system::{MolecularSystem, NeighborLists};
use crate::engine::config::EwaldParameters;

/// Borrowed inputs shared by the real-space pair kernels.
pub(crate) struct RealSpaceContext<'a> {
    pub system: &'a MolecularSystem,
    pub neighbor_lists: &'a NeighborLists,
    /// Coordinates per symmetry image.
    pub coordinates: &'a [Vec<Vector3<f64>>],
    /// Global-frame multipoles per symmetry image.
    pub global_mpole: &'a [Vec<MultipoleTensor>],
    pub use_flags: &'a [bool],
    pub ewald: &'a EwaldParameters,
    pub params: &'a ElectrostaticsParams,
    /// Number of symmetry images included in the sums (1 disables symmetry).
    pub n_symm: usize,
}

impl RealSpaceContext<'_> {
    pub fn n_atoms(&self) -> usize {
        self.system.num_atoms()
    }
}

/// Damped interaction kernels for one pair at (possibly softened) distance.
pub(crate) struct PairTensors {
    /// Ewald-screened kernels bn0..bn6.
    pub bn: [f64; 7],
    /// Rational kernels 1/r, 1/r³, 3/r⁵, 15/r⁷, ... (odd orders).
    pub rr: [f64; 7],
    pub scale3: f64,
    pub scale5: f64,
    pub scale7: f64,
    /// Gradients of the Thole scales, used by the polarization force.
    pub ddsc3: Vector3<f64>,
    pub ddsc5: Vector3<f64>,
    pub ddsc7: Vector3<f64>,
}

impl PairTensors {
    /// `r2` may include the soft-core buffer; `rvec` is the raw image vector.
    pub fn new(
        rvec: &Vector3<f64>,
        r2: f64,
        ewald: &EwaldParameters,
        pdamp: f64,
        pgamma: f64,
        thole_gradient: bool,
    ) -> Self {
        let r = r2.sqrt();
        let ralpha = ewald.aewald * r;
        let exp2a = (-ralpha * ralpha).exp();
        let rr1 = 1.0 / r;
        let rr2 = rr1 * rr1;

        let bn0 = erfc(ralpha) * rr1;
        let bn1 = (bn0 + ewald.an0 * exp2a) * rr2;
        let bn2 = (3.0 * bn1 + ewald.an1 * exp2a) * rr2;
        let bn3 = (5.0 * bn2 + ewald.an2 * exp2a) * rr2;
        let bn4 = (7.0 * bn3 + ewald.an3 * exp2a) * rr2;
        let bn5 = (9.0 * bn4 + ewald.an4 * exp2a) * rr2;
        let bn6 = (11.0 * bn5 + ewald.an5 * exp2a) * rr2;

        let rr3 = rr1 * rr2;
        let rr5 = 3.0 * rr3 * rr2;
        let rr7 = 5.0 * rr5 * rr2;
        let rr9 = 7.0 * rr7 * rr2;
        let rr11 = 9.0 * rr9 * rr2;
        let rr13 = 11.0 * rr11 * rr2;

        let mut tensors = Self {
            bn: [bn0, bn1, bn2, bn3, bn4, bn5, bn6],
            rr: [rr1, rr3, rr5, rr7, rr9, rr11, rr13],
            scale3: 1.0,
            scale5: 1.0,
            scale7: 1.0,
            ddsc3: Vector3::zeros(),
            ddsc5: Vector3::zeros(),
            ddsc7: Vector3::zeros(),
        };

        if pdamp != 0.0 {
            let rdamp = r / pdamp;
            let damp = -pgamma * rdamp * rdamp * rdamp;
            if damp > -50.0 {
                let expdamp = damp.exp();
                tensors.scale3 = 1.0 - expdamp;
                tensors.scale5 = 1.0 - expdamp * (1.0 - damp);
                tensors.scale7 = 1.0 - expdamp * (1.0 - damp + 0.6 * damp * damp);
                if thole_gradient {
                    let temp3 = -3.0 * damp * expdamp / r2;
                    tensors.ddsc3 = temp3 * rvec;
                    tensors.ddsc5 = -damp * tensors.ddsc3;
                    tensors.ddsc7 = (-0.2 - 0.6 * damp) * tensors.ddsc5;
                }
            }
        }
        tensors
    }
}
