//! Multipole tensor conventions.
//!
//! Permanent multipoles are packed into length-10 arrays indexed by the
//! monomial-power constants below: the charge, the three dipole components,
//! and the six unique entries of the symmetric traceless quadrupole.
//! Electrostatic potential tensors ("phi tensors") extend the same indexing
//! to third derivatives, giving 20 components.
//!
//! Energy and field contractions fold a factor of one third into the
//! quadrupole terms; the packed tensors store the bare traceless quadrupole.

use nalgebra::{Matrix3, Vector3};

use crate::core::constants::ONE_THIRD;

/// Number of components of a packed multipole through quadrupole order.
pub const MPOLE_LEN: usize = 10;
/// Number of components of a potential tensor through third derivatives.
pub const PHI_LEN: usize = 20;

/// A permanent multipole packed as {c, dx, dy, dz, Qxx, Qyy, Qzz, Qxy, Qxz, Qyz}.
pub type MultipoleTensor = [f64; MPOLE_LEN];
/// A truncated Taylor expansion of the potential at a site.
pub type PhiTensor = [f64; PHI_LEN];

pub const T000: usize = 0;
pub const T100: usize = 1;
pub const T010: usize = 2;
pub const T001: usize = 3;
pub const T200: usize = 4;
pub const T020: usize = 5;
pub const T002: usize = 6;
pub const T110: usize = 7;
pub const T101: usize = 8;
pub const T011: usize = 9;
pub const T300: usize = 10;
pub const T030: usize = 11;
pub const T003: usize = 12;
pub const T210: usize = 13;
pub const T201: usize = 14;
pub const T120: usize = 15;
pub const T021: usize = 16;
pub const T102: usize = 17;
pub const T012: usize = 18;
pub const T111: usize = 19;

/// Rule for constructing the local orthonormal frame of a multipole site
/// from its axis atoms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FrameDefinition {
    /// z toward the first axis atom, x toward the second (orthogonalized).
    #[default]
    ZThenX,
    /// z along the bisector of the two axis atoms.
    Bisector,
    /// z toward the first axis atom, x toward the bisector of the other two.
    ZThenBisector,
    /// z along the average of three unit vectors to the axis atoms.
    Threefold,
    /// Fewer than two axis atoms; only the charge survives rotation.
    None,
}

/// Dipole part of a packed multipole.
#[inline]
pub fn dipole(m: &MultipoleTensor) -> Vector3<f64> {
    Vector3::new(m[T100], m[T010], m[T001])
}

/// Quadrupole part of a packed multipole as a symmetric matrix, with the
/// one-third contraction convention already applied.
#[inline]
pub fn quadrupole_third(m: &MultipoleTensor) -> Matrix3<f64> {
    Matrix3::new(
        m[T200] * ONE_THIRD,
        m[T110] * ONE_THIRD,
        m[T101] * ONE_THIRD,
        m[T110] * ONE_THIRD,
        m[T020] * ONE_THIRD,
        m[T011] * ONE_THIRD,
        m[T101] * ONE_THIRD,
        m[T011] * ONE_THIRD,
        m[T002] * ONE_THIRD,
    )
}

/// The axial vector of the antisymmetric part of a matrix, ordered so that
/// `antisym_axial(a * b)` reproduces the quadrupole-quadrupole torque
/// coupling Q_i × Q_k.
#[inline]
pub fn antisym_axial(m: &Matrix3<f64>) -> Vector3<f64> {
    Vector3::new(
        m[(1, 2)] - m[(2, 1)],
        m[(2, 0)] - m[(0, 2)],
        m[(0, 1)] - m[(1, 0)],
    )
}
