//! Per-call scratch reset and coordinate expansion.

use nalgebra::Vector3;

#[cfg(feature = "parallel")]
use rayon::prelude::*;

use crate::core::models::crystal::Crystal;
use crate::core::models::system::MolecularSystem;

/// Copies the asymmetric-unit coordinates out of the system and applies each
/// symmetry operator to produce the image coordinates.
pub(crate) fn expand_coordinates(
    system: &MolecularSystem,
    coordinates: &mut [Vec<Vector3<f64>>],
) {
    let crystal = system.crystal();
    for (x, atom) in coordinates[0].iter_mut().zip(system.atoms()) {
        *x = atom.position;
    }
    let (first, images) = coordinates.split_at_mut(1);
    let base = &first[0];
    for (s, image) in images.iter_mut().enumerate() {
        apply_op(crystal, s + 1, base, image);
    }
}

fn apply_op(crystal: &Crystal, s: usize, base: &[Vector3<f64>], out: &mut [Vector3<f64>]) {
    #[cfg(feature = "parallel")]
    out.par_iter_mut()
        .zip(base.par_iter())
        .for_each(|(o, b)| *o = crystal.apply_sym_op(s, b));
    #[cfg(not(feature = "parallel"))]
    for (o, b) in out.iter_mut().zip(base.iter()) {
        *o = crystal.apply_sym_op(s, b);
    }
}

/// Expands the asymmetric-unit induced dipoles to every symmetry image by
/// applying the rotation part of each operator.
pub(crate) fn expand_induced_dipoles(crystal: &Crystal, dipoles: &mut [Vec<Vector3<f64>>]) {
    let (first, images) = dipoles.split_at_mut(1);
    let base = &first[0];
    for (s, image) in images.iter_mut().enumerate() {
        let op = s + 1;
        #[cfg(feature = "parallel")]
        image
            .par_iter_mut()
            .zip(base.par_iter())
            .for_each(|(o, b)| *o = crystal.apply_sym_rot(op, b));
        #[cfg(not(feature = "parallel"))]
        for (o, b) in image.iter_mut().zip(base.iter()) {
            *o = crystal.apply_sym_rot(op, b);
        }
    }
}

/// Zeros a per-atom vector buffer.
pub(crate) fn clear(buffer: &mut [Vector3<f64>]) {
    buffer.iter_mut().for_each(|v| *v = Vector3::zeros());
}
