//! Helpers shared by the `vcumod` tests and example programs.
pub mod framegen;
