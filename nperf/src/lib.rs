//! # nperf - Symbolic event names for perf
//!
//! Wraps the Linux `perf` tool and translates Intel symbolic event names
//! (`mem_load_retired.l3_miss:pp`) into whatever encoding the installed
//! perf understands: raw `rXXXX:flags` on old versions, dynamic
//! `pmu/event=...,umask=.../` syntax on new ones. Event tables are loaded
//! per CPU model from cached JSON artifacts, uncore events are expanded
//! across box instances, and offcore response events are synthesized from
//! the request/response matrix.

pub mod capability;
pub mod cli;
pub mod domain;
pub mod events;
pub mod format;
pub mod msr;
pub mod qualifiers;
pub mod resolve;
pub mod rewrite;
pub mod session;
pub mod workaround;
