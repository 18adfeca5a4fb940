//! Event tables: declarative artifacts, descriptors, uncore discovery.

pub mod artifact;
pub mod descriptor;
pub mod table;
pub mod uncore;

pub use descriptor::{EventDescriptor, MsrWrite, UncoreEventDescriptor};
pub use table::EventTable;
