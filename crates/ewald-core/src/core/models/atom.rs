use nalgebra::Vector3;

use super::multipole::{FrameDefinition, MultipoleTensor, MPOLE_LEN};

/// A multipole site.
///
/// Carries everything the engine needs about one atom: its coordinates, its
/// permanent multipole in the local frame together with the frame definition
/// and axis atoms, and its polarization parameters. Covalent topology and
/// polarization-group membership live in [`super::topology::Topology`].
#[derive(Debug, Clone)]
pub struct Atom {
    /// Cartesian position in Å.
    pub position: Vector3<f64>,
    /// Force-field atom type key.
    pub type_id: usize,
    /// Permanent multipole in the local frame.
    pub multipole: MultipoleTensor,
    /// Local frame construction rule.
    pub frame: FrameDefinition,
    /// Indices of the frame-defining atoms (0 to 3 entries).
    pub axis_atoms: Vec<usize>,
    /// Isotropic dipole polarizability in Å³.
    pub polarizability: f64,
    /// Thole damping parameter.
    pub thole: f64,
    /// Polarizability damping width, typically polarizability^(1/6).
    pub pdamp: f64,
    /// Atom type keys of covalent neighbors belonging to the same
    /// polarization group.
    pub group_types: Vec<usize>,
    /// Participates in the alchemical (soft-core) pathway.
    pub apply_lambda: bool,
}

impl Atom {
    pub fn new(position: Vector3<f64>, type_id: usize) -> Self {
        Self {
            position,
            type_id,
            multipole: [0.0; MPOLE_LEN],
            frame: FrameDefinition::None,
            axis_atoms: Vec::new(),
            polarizability: 0.0,
            thole: 0.0,
            pdamp: 0.0,
            group_types: Vec::new(),
            apply_lambda: false,
        }
    }

    pub fn with_multipole(
        mut self,
        multipole: MultipoleTensor,
        frame: FrameDefinition,
        axis_atoms: Vec<usize>,
    ) -> Self {
        self.multipole = multipole;
        self.frame = frame;
        self.axis_atoms = axis_atoms;
        self
    }

    pub fn with_polarize(mut self, polarizability: f64, thole: f64, group_types: Vec<usize>) -> Self {
        self.polarizability = polarizability;
        self.thole = thole;
        // The damping width pairs as (pdamp_i * pdamp_k)^... in the Thole
        // factor; zero width disables damping entirely.
        self.pdamp = if polarizability > 0.0 {
            polarizability.powf(1.0 / 6.0)
        } else {
            0.0
        };
        self.group_types = group_types;
        self
    }
}
