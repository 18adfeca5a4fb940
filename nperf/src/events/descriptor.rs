//! Event descriptors and the raw PERFEVTSEL bit layout.

use crate::domain::{Msr, PreciseLevel};
use crate::qualifiers::QualifierSet;

/// Bit layout of the architectural PERFEVTSEL encoding as perf's raw
/// `rXXXX` syntax consumes it.
pub mod bits {
    pub const EVENT_MASK: u64 = 0xff;
    pub const UMASK_SHIFT: u32 = 8;
    pub const UMASK_MASK: u64 = 0xff << UMASK_SHIFT;
    pub const EDGE: u64 = 1 << 18;
    pub const ANY: u64 = 1 << 21;
    pub const INV: u64 = 1 << 23;
    pub const CMASK_SHIFT: u32 = 24;
    pub const CMASK_MASK: u64 = 0xff << CMASK_SHIFT;
    /// Bits perf accepts in a raw encoding.
    pub const EVMASK: u64 = 0xffff_ffff;
}

/// A pending auxiliary-register write an event needs before counting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MsrWrite {
    pub msr: Msr,
    pub value: u64,
}

/// One named core event from the declarative event list.
///
/// Owned by its [`super::table::EventTable`]; resolution clones it when a
/// request supplies qualifiers beyond the intrinsic set, so table originals
/// are never mutated.
#[derive(Debug, Clone)]
pub struct EventDescriptor {
    /// Canonical lower-case name (`mem_load_retired.l3_miss`).
    pub name: String,
    /// Merged raw encoding (event select, umask, modifier bits).
    pub val: u64,
    pub desc: String,
    /// Qualifiers the event itself declares (e.g. `p` for `_ps` variants).
    pub intrinsic: QualifierSet,
    /// Dynamic perf attributes carried instead of an MSR write
    /// (`offcore_rsp`, `ldlat`) when the kernel exposes them.
    pub dyn_attrs: Vec<(&'static str, u64)>,
    /// Auxiliary register the fallback coordinator must program.
    pub msr: Option<MsrWrite>,
    /// Default overflow / sample-after value.
    pub overflow: Option<String>,
    pub errata: Option<String>,
    pub precise: PreciseLevel,
    /// Fixed-purpose counters keep a perf symbolic name for legacy output
    /// (`instructions`, `cycles`, `ref-cycles`).
    pub fixed_alias: Option<&'static str>,
}

impl EventDescriptor {
    /// Raw value with a merged qualifier set folded into the modifier bits.
    pub fn merged_value(&self, quals: &QualifierSet) -> u64 {
        let mut val = self.val;
        if quals.edge {
            val |= bits::EDGE;
        }
        if quals.invert {
            val |= bits::INV;
        }
        if quals.any_thread {
            val |= bits::ANY;
        }
        if let Some(cmask) = quals.cmask {
            val = (val & !bits::CMASK_MASK) | (u64::from(cmask) << bits::CMASK_SHIFT);
        }
        val & bits::EVMASK
    }

    pub fn event_select(&self) -> u64 {
        self.val & bits::EVENT_MASK
    }

    pub fn umask(&self) -> u64 {
        (self.val & bits::UMASK_MASK) >> bits::UMASK_SHIFT
    }

    /// Label attached via `name=` so perf output maps back to this event.
    pub fn label(&self) -> String {
        self.name.replace('.', "_")
    }
}

/// One uncore event row. The owning box kind is a logical unit (`CBO`,
/// `iMC`); whether it exists on the running system is only decided at
/// resolution time.
#[derive(Debug, Clone)]
pub struct UncoreEventDescriptor {
    pub name: String,
    /// Box kind as declared by the artifact, before aliasing.
    pub unit: String,
    pub code: u64,
    pub umask: u64,
    pub cmask: u64,
    pub edge: bool,
    pub invert: bool,
    pub desc: String,
}

/// Fold punctuation out of a name for best-effort matching.
pub fn fold_name(name: &str) -> String {
    name.chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_lowercase())
        .collect()
}
