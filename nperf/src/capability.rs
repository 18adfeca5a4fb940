//! Capability Probe
//!
//! Determines once per process what the installed perf binary and the
//! running kernel can express: raw-only (legacy) versus dynamic
//! `pmu/attr=val/` syntax, labeled events, the dynamic offcore/ldlat
//! attributes, and hybrid (performance/efficiency core) PMU naming.

use std::process::Command;

use log::{debug, warn};
use regex::Regex;

use crate::session::Session;

/// perf gained the dynamic event syntax and `name=` labels in 3.4.
const DYNAMIC_SYNTAX_MINOR: u32 = 4;

/// Immutable snapshot of profiler and kernel capabilities, memoized for the
/// process lifetime inside the [`Session`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapabilitySnapshot {
    pub version: (u32, u32),
    /// Legacy/raw-only: emit `rXXXX` and program MSRs directly.
    pub direct: bool,
    /// perf accepts `name=` labels on dynamic events.
    pub has_name: bool,
    /// Kernel exposes `offcore_rsp` as a dynamic attribute.
    pub offcore: bool,
    /// Kernel exposes `ldlat` as a dynamic attribute.
    pub ldlat: bool,
    /// System differentiates `cpu_core` / `cpu_atom` PMUs.
    pub hybrid: bool,
}

impl CapabilitySnapshot {
    /// Safe assumption when the profiler cannot be queried: raw encodings
    /// work everywhere, nothing newer is available.
    pub fn fallback() -> Self {
        CapabilitySnapshot {
            version: (0, 0),
            direct: true,
            has_name: false,
            offcore: false,
            ldlat: false,
            hybrid: false,
        }
    }
}

/// Query `perf --version` once and inspect the PMU device list.
///
/// Fails soft: an unlaunchable profiler yields the fallback snapshot rather
/// than aborting, so raw encodings still work.
pub fn probe(session: &mut Session) -> CapabilitySnapshot {
    let version = match query_version(&session.perf) {
        Some(v) => v,
        None => {
            warn!("cannot run '{} --version', assuming raw-only perf", session.perf);
            let mut snap = CapabilitySnapshot::fallback();
            snap.hybrid = session.path_exists(&session.sysfs_root.join("cpu_core"));
            return snap;
        }
    };

    // Any major beyond 3 is newer than everything we distinguish.
    let minor = if version.0 > 3 { 100 } else { version.1 };
    let forced_direct = std::env::var_os("DIRECT_MSR").is_some();
    let direct = forced_direct || minor < DYNAMIC_SYNTAX_MINOR;
    let has_name = minor >= DYNAMIC_SYNTAX_MINOR;

    let core_pmu = if session.path_exists(&session.sysfs_root.join("cpu_core")) {
        "cpu_core"
    } else {
        "cpu"
    };
    let hybrid = core_pmu == "cpu_core";

    let snap = CapabilitySnapshot {
        version,
        direct,
        has_name,
        offcore: !direct && session.pmu_has_format(core_pmu, "offcore_rsp"),
        ldlat: !direct && session.pmu_has_format(core_pmu, "ldlat"),
        hybrid,
    };
    debug!("capability snapshot: {snap:?}");
    snap
}

fn query_version(perf: &str) -> Option<(u32, u32)> {
    let output = Command::new(perf).arg("--version").output().ok()?;
    let stdout = String::from_utf8_lossy(&output.stdout);
    parse_version(&stdout)
}

/// Parse `"<tool> version MAJOR.MINOR..."`.
fn parse_version(line: &str) -> Option<(u32, u32)> {
    let re = Regex::new(r"version (\d+)\.(\d+)").ok()?;
    let caps = re.captures(line)?;
    Some((caps[1].parse().ok()?, caps[2].parse().ok()?))
}
