//! Domain types providing compile-time safety and self-documentation
//!
//! These newtype wrappers prevent common bugs like passing a raw MSR number
//! where a PMU name is expected, and make function signatures more expressive.

use std::fmt;

/// Model specific register number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Msr(pub u32);

impl fmt::Display for Msr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MSR 0x{:x}", self.0)
    }
}

/// Name of a kernel PMU device as exposed under
/// `/sys/bus/event_source/devices` (e.g. `cpu`, `cpu_core`, `uncore_cbox_1`).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PmuName(String);

impl PmuName {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        assert!(!name.is_empty(), "PMU name cannot be empty");
        Self(name)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PmuName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for PmuName {
    fn from(s: &str) -> Self {
        PmuName::new(s)
    }
}

/// Hardware-assisted sampling precision an event supports.
///
/// Ordered so that `max()` picks the more capable level when merging.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum PreciseLevel {
    #[default]
    None,
    Single,
    Multi,
}

impl PreciseLevel {
    /// Highest number of `p` modifiers the event supports.
    pub fn ceiling(self) -> u8 {
        match self {
            PreciseLevel::None => 0,
            PreciseLevel::Single => 1,
            PreciseLevel::Multi => 2,
        }
    }

    /// Parse the PEBS column of an event list row.
    pub fn from_pebs(pebs: u32) -> Self {
        match pebs {
            0 => PreciseLevel::None,
            1 => PreciseLevel::Single,
            _ => PreciseLevel::Multi,
        }
    }
}
