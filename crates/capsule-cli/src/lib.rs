//! Runtime and command-line front end for lowered Capsule units.

pub mod config;
pub mod eval;
pub mod singleton;
