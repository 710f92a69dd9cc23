/// Coulomb constant converting electrostatic units to kcal/mol.
///
/// This is the value of 1/(4πε₀) in kcal·Å/(mol·e²), the unit system used by
/// polarizable multipole force fields: lengths in Å, charges in electrons,
/// energies in kcal/mol.
pub const ELECTRIC: f64 = 332.063713;

/// Conversion from electron-Å dipoles to Debye.
///
/// Used to express the SCF convergence criterion in Debye.
pub const DEBYE: f64 = 4.80321;

/// One third, folded into the traceless quadrupole contraction convention.
pub const ONE_THIRD: f64 = 1.0 / 3.0;

/// The square root of π.
pub const SQRT_PI: f64 = 1.772_453_850_905_516;
