//! Structured error types for nperf
//!
//! Using thiserror for automatic Display implementation and error chaining.
//!
//! Only conditions a caller must react to are errors. Recoverable conditions
//! (a malformed table row, a qualifier the kernel does not expose, an
//! ambiguous bare name on a hybrid system) are diagnostics emitted through
//! `log` and never abort a batch.

use super::types::Msr;
use thiserror::Error;

/// Per-event resolution failures. These drop the one event from a batch;
/// sibling events still resolve. `RegisterConflict` is the exception and
/// aborts the run.
#[derive(Error, Debug)]
pub enum EventError {
    #[error("Event '{0}' not found in any loaded event list")]
    NotFound(String),

    #[error("Uncore unit '{unit}' for event '{event}' does not exist on this system")]
    UnknownUncoreUnit { event: String, unit: String },

    #[error("Qualifier '{0}' has no raw-encoding representation (legacy perf cannot express it)")]
    LegacyQualifier(String),

    #[error("Event '{0}' requires the dynamic perf syntax, which this perf does not support")]
    NeedsDynamicSyntax(String),

    #[error("{msr} already programmed with 0x{previous:x}, event requests 0x{requested:x}")]
    RegisterConflict { msr: Msr, previous: u64, requested: u64 },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Event list loading failures. Fatal for the run unless the on-demand
/// download rescues the lookup.
#[derive(Error, Debug)]
pub enum TableError {
    #[error("No event list for CPU '{cpu}' (looked in {cache}, download failed or found nothing)")]
    NotFound { cpu: String, cache: String },

    #[error("Cannot identify CPU: {0}")]
    Cpu(String),

    #[error("Failed to download event list: {0}")]
    Download(String),

    #[error("Failed to parse event list {path}: {source}")]
    Parse { path: String, source: serde_json::Error },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
