//! Core domain types and errors shared across the crate.

pub mod errors;
pub mod types;

pub use errors::{EventError, TableError};
pub use types::{Msr, PmuName, PreciseLevel};
