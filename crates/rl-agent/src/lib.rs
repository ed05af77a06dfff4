//! Revline agent: library half of the headless diagnostic binary.
//!
//! Re-exports the modules so integration tests can drive the same
//! bring-up and reporting paths as `main`.

pub mod config;
pub mod reporter;
pub mod startup;
