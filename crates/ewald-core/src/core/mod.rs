pub mod constants;
pub mod forcefield;
pub mod models;
pub mod utils;
