use super::atom::Atom;
use super::crystal::Crystal;
use super::topology::Topology;

/// The read-only description of a simulated system: atoms with their
/// multipole and polarization parameters, the crystal, and the covalent
/// topology derived from the bond list.
#[derive(Debug, Clone)]
pub struct MolecularSystem {
    atoms: Vec<Atom>,
    crystal: Crystal,
    topology: Topology,
}

impl MolecularSystem {
    pub fn new(atoms: Vec<Atom>, crystal: Crystal, bonds: &[(usize, usize)]) -> Self {
        let topology = Topology::new(atoms.len(), bonds, &atoms);
        Self {
            atoms,
            crystal,
            topology,
        }
    }

    pub fn atoms(&self) -> &[Atom] {
        &self.atoms
    }

    pub fn atom(&self, i: usize) -> &Atom {
        &self.atoms[i]
    }

    pub fn num_atoms(&self) -> usize {
        self.atoms.len()
    }

    pub fn crystal(&self) -> &Crystal {
        &self.crystal
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    /// Moves every atom; used by drivers between energy evaluations.
    pub fn set_positions(&mut self, positions: &[nalgebra::Vector3<f64>]) {
        for (atom, p) in self.atoms.iter_mut().zip(positions) {
            atom.position = *p;
        }
    }
}

/// Real-space neighbor lists indexed `[symmetry image][atom]`, each entry an
/// ordered list of neighbor atom indices.
///
/// Construction is external; the asymmetric-unit lists (image 0) hold each
/// pair once (`k > i`), while symmetry-image lists may contain every atom
/// including `i` itself.
#[derive(Debug, Clone)]
pub struct NeighborLists(pub Vec<Vec<Vec<usize>>>);

impl NeighborLists {
    /// Dense all-pairs lists, adequate for small systems and tests.
    pub fn all_pairs(n_atoms: usize, n_symm: usize) -> Self {
        let mut lists = Vec::with_capacity(n_symm);
        // Image 0 stores each pair once.
        lists.push((0..n_atoms).map(|i| ((i + 1)..n_atoms).collect()).collect());
        for _ in 1..n_symm {
            lists.push((0..n_atoms).map(|_| (0..n_atoms).collect()).collect());
        }
        Self(lists)
    }

    pub fn neighbors(&self, symm: usize, atom: usize) -> &[usize] {
        &self.0[symm][atom]
    }
}
