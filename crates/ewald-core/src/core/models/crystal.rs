//! Unit cell, space-group symmetry, and minimum-image geometry.

use nalgebra::{Matrix3, Vector3};

/// A space-group symmetry operator in Cartesian form.
#[derive(Debug, Clone)]
pub struct SymOp {
    /// Rotation part (orthogonal).
    pub rot: Matrix3<f64>,
    /// Translation part in Å.
    pub tr: Vector3<f64>,
}

impl SymOp {
    pub fn identity() -> Self {
        Self {
            rot: Matrix3::identity(),
            tr: Vector3::zeros(),
        }
    }
}

/// The unit cell and its symmetry.
///
/// Exposes the geometric primitives the engine relies on: the minimum-image
/// convention, symmetry-operator application, and the reciprocal matrix used
/// to map fractional gradients back to Cartesian space. An aperiodic system
/// is the degenerate case with a single identity operator and no imaging.
#[derive(Debug, Clone)]
pub struct Crystal {
    /// Lattice vectors as matrix columns (a | b | c).
    cell: Matrix3<f64>,
    /// Fractionalization matrix, the inverse of `cell`.
    to_frac: Matrix3<f64>,
    sym_ops: Vec<SymOp>,
    aperiodic: bool,
}

impl Crystal {
    /// A periodic crystal from its lattice matrix (columns a, b, c) and
    /// symmetry operators. The identity operator is implied and must be the
    /// first entry of `sym_ops` if more are supplied; an empty list gets the
    /// identity alone.
    pub fn periodic(cell: Matrix3<f64>, sym_ops: Vec<SymOp>) -> Option<Self> {
        let to_frac = cell.try_inverse()?;
        let sym_ops = if sym_ops.is_empty() {
            vec![SymOp::identity()]
        } else {
            sym_ops
        };
        Some(Self {
            cell,
            to_frac,
            sym_ops,
            aperiodic: false,
        })
    }

    /// A cubic cell of the given edge with P1 symmetry.
    pub fn cubic(edge: f64) -> Self {
        Self {
            cell: Matrix3::from_diagonal_element(edge),
            to_frac: Matrix3::from_diagonal_element(1.0 / edge),
            sym_ops: vec![SymOp::identity()],
            aperiodic: false,
        }
    }

    /// The degenerate single-image case used for isolated systems.
    pub fn aperiodic() -> Self {
        Self {
            cell: Matrix3::identity(),
            to_frac: Matrix3::identity(),
            sym_ops: vec![SymOp::identity()],
            aperiodic: true,
        }
    }

    pub fn is_aperiodic(&self) -> bool {
        self.aperiodic
    }

    pub fn num_sym_ops(&self) -> usize {
        self.sym_ops.len()
    }

    pub fn sym_op(&self, i: usize) -> &SymOp {
        &self.sym_ops[i]
    }

    /// Maps a displacement vector to its minimum image and returns the
    /// squared length.
    pub fn image(&self, v: &mut Vector3<f64>) -> f64 {
        if !self.aperiodic {
            let mut frac = self.to_frac * *v;
            for f in frac.iter_mut() {
                *f -= f.round();
            }
            *v = self.cell * frac;
        }
        v.norm_squared()
    }

    /// Applies a symmetry operator to a position.
    pub fn apply_sym_op(&self, i: usize, v: &Vector3<f64>) -> Vector3<f64> {
        let op = &self.sym_ops[i];
        op.rot * v + op.tr
    }

    /// Applies only the rotation part of a symmetry operator, for vectors
    /// such as dipoles that do not translate.
    pub fn apply_sym_rot(&self, i: usize, v: &Vector3<f64>) -> Vector3<f64> {
        self.sym_ops[i].rot * v
    }

    /// Applies the inverse (transpose) rotation, mapping a symmetry-mate
    /// vector back into the asymmetric unit frame.
    pub fn apply_inverse_sym_rot(&self, i: usize, v: &Vector3<f64>) -> Vector3<f64> {
        self.sym_ops[i].rot.transpose() * v
    }

    /// The matrix mapping grid-scaled fractional gradients to Cartesian
    /// gradients (the transpose of the fractionalization matrix).
    pub fn reciprocal(&self) -> Matrix3<f64> {
        self.to_frac.transpose()
    }

    /// Unit cell volume in Å³.
    pub fn volume(&self) -> f64 {
        self.cell.determinant().abs()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn minimum_image_wraps_across_cubic_cell() {
        let crystal = Crystal::cubic(10.0);
        let mut v = Vector3::new(9.0, 0.0, 0.0);
        let r2 = crystal.image(&mut v);
        assert_relative_eq!(v.x, -1.0, epsilon = 1e-12);
        assert_relative_eq!(r2, 1.0, epsilon = 1e-12);
    }

    #[test]
    fn minimum_image_is_identity_inside_half_cell() {
        let crystal = Crystal::cubic(20.0);
        let mut v = Vector3::new(3.0, -4.0, 5.0);
        let r2 = crystal.image(&mut v);
        assert_relative_eq!(r2, 50.0, epsilon = 1e-12);
        assert_relative_eq!(v.y, -4.0, epsilon = 1e-12);
    }

    #[test]
    fn aperiodic_image_leaves_vector_untouched() {
        let crystal = Crystal::aperiodic();
        let mut v = Vector3::new(100.0, 200.0, -300.0);
        let r2 = crystal.image(&mut v);
        assert_relative_eq!(r2, v.norm_squared());
        assert_relative_eq!(v.x, 100.0);
    }

    #[test]
    fn inverse_rotation_undoes_rotation() {
        let rot = nalgebra::Rotation3::from_euler_angles(0.3, -0.8, 1.2);
        let op = SymOp {
            rot: *rot.matrix(),
            tr: Vector3::new(1.0, 2.0, 3.0),
        };
        let crystal = Crystal::periodic(Matrix3::from_diagonal_element(15.0), vec![
            SymOp::identity(),
            op,
        ])
        .unwrap();
        let v = Vector3::new(0.3, 0.7, -0.2);
        let w = crystal.apply_sym_rot(1, &v);
        let back = crystal.apply_inverse_sym_rot(1, &w);
        assert_relative_eq!((back - v).norm(), 0.0, epsilon = 1e-12);
    }

    #[test]
    fn reciprocal_is_transpose_inverse_of_cell() {
        let cell = Matrix3::new(10.0, 1.0, 0.0, 0.0, 12.0, 0.5, 0.0, 0.0, 9.0);
        let crystal = Crystal::periodic(cell, Vec::new()).unwrap();
        let product = crystal.reciprocal().transpose() * cell;
        assert_relative_eq!((product - Matrix3::identity()).norm(), 0.0, epsilon = 1e-12);
    }
}
