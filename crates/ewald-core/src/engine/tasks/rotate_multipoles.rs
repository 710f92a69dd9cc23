//! Rotation of local-frame permanent multipoles into the global frame.

use nalgebra::{Matrix3, Vector3};

#[cfg(feature = "parallel")]
use rayon::prelude::*;

use crate::core::models::atom::Atom;
use crate::core::models::multipole::{
    FrameDefinition, MultipoleTensor, T000, T001, T002, T010, T011, T020, T100, T101, T110, T200,
};
use crate::core::utils::geometry::{perpendicular_unit, unit_toward};

/// Rotates every atom's local multipole into the global frame of each
/// symmetry image. Frames are rebuilt from the image coordinates, so mirror
/// images get mirrored frames and the chirality check applies per image.
pub(crate) fn run(
    atoms: &[Atom],
    coordinates: &[Vec<Vector3<f64>>],
    global_mpole: &mut [Vec<MultipoleTensor>],
) {
    for (image, out) in coordinates.iter().zip(global_mpole.iter_mut()) {
        rotate_image(atoms, image, out);
    }
}

fn rotate_image(atoms: &[Atom], coords: &[Vector3<f64>], out: &mut [MultipoleTensor]) {
    #[cfg(feature = "parallel")]
    out.par_iter_mut()
        .enumerate()
        .for_each(|(i, m)| *m = rotate_site(&atoms[i], i, coords));
    #[cfg(not(feature = "parallel"))]
    for (i, m) in out.iter_mut().enumerate() {
        *m = rotate_site(&atoms[i], i, coords);
    }
}

fn rotate_site(atom: &Atom, i: usize, coords: &[Vector3<f64>]) -> MultipoleTensor {
    let local = &atom.multipole;
    if atom.frame == FrameDefinition::None || atom.axis_atoms.len() < 2 {
        // Only the charge survives; an ion has no orientation.
        let mut m = [0.0; 10];
        m[T000] = local[T000];
        return m;
    }

    let rot = rotation_matrix(atom.frame, &atom.axis_atoms, &coords[i], coords);

    let mut dipole = Vector3::new(local[T100], local[T010], local[T001]);
    let mut quad = Matrix3::new(
        local[T200], local[T110], local[T101], local[T110], local[T020], local[T011], local[T101],
        local[T011], local[T002],
    );

    if atom.frame == FrameDefinition::ZThenX && atom.axis_atoms.len() == 3 {
        // Chirality check: a negative signed volume of the tetrahedron spanned
        // by the site and its three reference atoms flips the local y axis.
        let rd = coords[i] - coords[atom.axis_atoms[2]];
        let rz = coords[atom.axis_atoms[0]] - coords[atom.axis_atoms[2]];
        let rx = coords[atom.axis_atoms[1]] - coords[atom.axis_atoms[2]];
        if rd.dot(&rz.cross(&rx)) < 0.0 {
            dipole.y = -dipole.y;
            quad[(0, 1)] = -quad[(0, 1)];
            quad[(1, 0)] = -quad[(1, 0)];
            quad[(1, 2)] = -quad[(1, 2)];
            quad[(2, 1)] = -quad[(2, 1)];
        }
    }

    let d = rot * dipole;
    let q = rot * quad * rot.transpose();

    let mut m = [0.0; 10];
    m[T000] = local[T000];
    m[T100] = d.x;
    m[T010] = d.y;
    m[T001] = d.z;
    m[T200] = q[(0, 0)];
    m[T020] = q[(1, 1)];
    m[T002] = q[(2, 2)];
    m[T110] = q[(0, 1)];
    m[T101] = q[(0, 2)];
    m[T011] = q[(1, 2)];
    m
}

/// Builds the right-handed local frame; columns are the x, y, z axes.
pub(crate) fn rotation_matrix(
    frame: FrameDefinition,
    axis: &[usize],
    origin: &Vector3<f64>,
    coords: &[Vector3<f64>],
) -> Matrix3<f64> {
    let (z, x) = match frame {
        FrameDefinition::Bisector => {
            let u = unit_toward(origin, &coords[axis[0]]);
            let v = unit_toward(origin, &coords[axis[1]]);
            let z = (u + v).normalize();
            (z, perpendicular_unit(&v, &z))
        }
        FrameDefinition::ZThenBisector => {
            let z = unit_toward(origin, &coords[axis[0]]);
            let u = unit_toward(origin, &coords[axis[1]]);
            let v = unit_toward(origin, &coords[axis[2]]);
            let bisector = (u + v).normalize();
            (z, perpendicular_unit(&bisector, &z))
        }
        FrameDefinition::Threefold => {
            let u = unit_toward(origin, &coords[axis[0]]);
            let v = unit_toward(origin, &coords[axis[1]]);
            let w = unit_toward(origin, &coords[axis[2]]);
            let z = (u + v + w).normalize();
            (z, perpendicular_unit(&u, &z))
        }
        // ZThenX and any future two-site frame.
        _ => {
            let z = unit_toward(origin, &coords[axis[0]]);
            let toward_x = coords[axis[1]] - origin;
            (z, perpendicular_unit(&toward_x, &z))
        }
    };
    let y = z.cross(&x);
    Matrix3::from_columns(&[x, y, z])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::models::multipole::MPOLE_LEN;
    use approx::assert_relative_eq;

    fn water_like() -> (Vec<Atom>, Vec<Vector3<f64>>) {
        // Oxygen at origin, hydrogens in the xz plane.
        let coords = vec![
            Vector3::new(0.0, 0.0, 0.0),
            Vector3::new(0.7586, 0.0, 0.5043),
            Vector3::new(-0.7586, 0.0, 0.5043),
        ];
        let mut o = Atom::new(coords[0], 0);
        o.frame = FrameDefinition::Bisector;
        o.axis_atoms = vec![1, 2];
        let mut m = [0.0; MPOLE_LEN];
        m[T000] = -0.51966;
        m[T001] = 0.14279;
        m[T200] = 0.37928;
        m[T020] = -0.41809;
        m[T002] = 0.03881;
        o.multipole = m;
        let mut h1 = Atom::new(coords[1], 1);
        h1.frame = FrameDefinition::ZThenX;
        h1.axis_atoms = vec![0, 2];
        let mut h2 = Atom::new(coords[2], 1);
        h2.frame = FrameDefinition::ZThenX;
        h2.axis_atoms = vec![0, 1];
        (vec![o, h1, h2], coords)
    }

    #[test]
    fn rotation_matrix_is_orthonormal_with_unit_determinant() {
        let (atoms, coords) = water_like();
        for atom in &atoms {
            let rot = rotation_matrix(atom.frame, &atom.axis_atoms, &atom.position, &coords);
            let gram = rot.transpose() * rot;
            assert_relative_eq!((gram - Matrix3::identity()).norm(), 0.0, epsilon = 1e-12);
            assert_relative_eq!(rot.determinant(), 1.0, epsilon = 1e-12);
        }
    }

    #[test]
    fn rotated_quadrupole_stays_traceless() {
        let (atoms, coords) = water_like();
        let mut out = vec![[0.0; MPOLE_LEN]; 3];
        rotate_image(&atoms, &coords, &mut out);
        let trace = out[0][T200] + out[0][T020] + out[0][T002];
        assert_relative_eq!(trace, 0.0, epsilon = 1e-10);
    }

    #[test]
    fn charge_is_invariant_under_rotation() {
        let (atoms, coords) = water_like();
        let mut out = vec![[0.0; MPOLE_LEN]; 3];
        rotate_image(&atoms, &coords, &mut out);
        assert_relative_eq!(out[0][T000], -0.51966);
    }

    #[test]
    fn frameless_site_keeps_only_its_charge() {
        let mut ion = Atom::new(Vector3::zeros(), 7);
        ion.multipole[T000] = 1.0;
        ion.multipole[T100] = 0.5;
        ion.multipole[T200] = 0.2;
        ion.multipole[T020] = -0.1;
        ion.multipole[T002] = -0.1;
        let coords = vec![Vector3::zeros()];
        let m = rotate_site(&ion, 0, &coords);
        assert_relative_eq!(m[T000], 1.0);
        assert_relative_eq!(m[T100], 0.0);
        assert_relative_eq!(m[T200], 0.0);
    }

    #[test]
    fn bisector_frame_points_z_along_the_bisector() {
        let (atoms, coords) = water_like();
        let rot = rotation_matrix(
            atoms[0].frame,
            &atoms[0].axis_atoms,
            &atoms[0].position,
            &coords,
        );
        let z = rot.column(2);
        assert_relative_eq!(z[0], 0.0, epsilon = 1e-12);
        assert_relative_eq!(z[1], 0.0, epsilon = 1e-12);
        assert_relative_eq!(z[2], 1.0, epsilon = 1e-12);
    }

    #[test]
    fn chirality_flip_negates_the_y_dipole() {
        // A chiral site with three reference atoms, evaluated in its mirror
        // image; the global dipoles must be mirror images of each other.
        let coords = vec![
            Vector3::new(0.0, 0.0, 0.0),
            Vector3::new(0.0, 0.0, 1.5),
            Vector3::new(1.4, 0.0, -0.4),
            Vector3::new(-0.6, 1.2, -0.5),
        ];
        let mirrored: Vec<_> = coords
            .iter()
            .map(|c| Vector3::new(c.x, -c.y, c.z))
            .collect();

        let mut site = Atom::new(coords[0], 0);
        site.frame = FrameDefinition::ZThenX;
        site.axis_atoms = vec![1, 2, 3];
        site.multipole[T100] = 0.10;
        site.multipole[T010] = 0.25;
        site.multipole[T001] = -0.05;

        let m = rotate_site(&site, 0, &coords);
        let m_mirror = rotate_site(&site, 0, &mirrored);
        // The mirrored frame reproduces the mirrored dipole.
        assert_relative_eq!(m[T100], m_mirror[T100], epsilon = 1e-12);
        assert_relative_eq!(m[T010], -m_mirror[T010], epsilon = 1e-12);
        assert_relative_eq!(m[T001], m_mirror[T001], epsilon = 1e-12);
    }
}
