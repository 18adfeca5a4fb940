//! Uncore box discovery and instance expansion.
//!
//! An uncore event names a logical box kind (`CBO`, `iMC`, ...). The kernel
//! exposes each discovered unit as `uncore_<box>` when there is a single
//! instance, or as a densely numbered `uncore_<box>_0`, `uncore_<box>_1`,
//! ... series. One logical request expands into one descriptor per
//! instance.

use crate::domain::{EventError, PmuName};
use crate::events::descriptor::UncoreEventDescriptor;
use crate::session::Session;

/// Artifact box kinds whose perf device name differs from a plain
/// lower-casing.
const BOX_ALIASES: &[(&str, &str)] = &[("cbo", "cbox"), ("qpi_ll", "qpi"), ("sbo", "sbox")];

/// perf device base name for a declared box kind.
pub fn box_device_name(unit: &str) -> String {
    let lower = unit.to_lowercase();
    for (from, to) in BOX_ALIASES {
        if lower == *from {
            return (*to).to_string();
        }
    }
    lower
}

/// Discover the PMU instances for an uncore event's box kind.
///
/// Returns one PMU name per instance; `first_only` suppresses expansion
/// beyond instance 0. A box kind with no device at all is a per-event
/// failure naming the missing unit; sibling requests are unaffected.
pub fn expand(
    session: &mut Session,
    event: &UncoreEventDescriptor,
    first_only: bool,
) -> Result<Vec<PmuName>, EventError> {
    let base = format!("uncore_{}", box_device_name(&event.unit));

    if session.path_exists(&session.sysfs_root.join(&base)) {
        return Ok(vec![PmuName::new(base)]);
    }

    let mut instances = Vec::new();
    for index in 0.. {
        let name = format!("{base}_{index}");
        if !session.path_exists(&session.sysfs_root.join(&name)) {
            break;
        }
        instances.push(PmuName::new(name));
        if first_only {
            break;
        }
    }
    if instances.is_empty() {
        return Err(EventError::UnknownUncoreUnit {
            event: event.name.clone(),
            unit: event.unit.clone(),
        });
    }
    Ok(instances)
}
