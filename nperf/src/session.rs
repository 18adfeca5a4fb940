//! Process-wide session state.
//!
//! All mutable process-wide state lives here instead of in module globals:
//! the capability snapshot, the file-existence cache, the per-PMU format
//! attribute cache, the warn-once set, the MSR write ledger and the errata
//! workaround state. Tests construct sessions over temp directories and get
//! fresh caches for free.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use log::warn;

use crate::capability::{self, CapabilitySnapshot};
use crate::events::artifact;
use crate::msr::MsrLedger;
use crate::workaround::Workaround;

pub const SYSFS_DEVICES: &str = "/sys/bus/event_source/devices";
pub const MSR_DEV_ROOT: &str = "/dev/cpu";

#[derive(Debug)]
pub struct Session {
    /// Profiler binary (`PERF` env override, default `perf`).
    pub perf: String,
    /// PMU device directory, normally [`SYSFS_DEVICES`].
    pub sysfs_root: PathBuf,
    /// msr device directory, normally [`MSR_DEV_ROOT`].
    pub msr_dev_root: PathBuf,
    /// Event list cache directory.
    pub cache_dir: PathBuf,
    pub capability: CapabilitySnapshot,
    pub msr: MsrLedger,
    pub workaround: Workaround,
    file_exists: HashMap<PathBuf, bool>,
    attr_exists: HashMap<(String, String), bool>,
    warned: HashSet<String>,
}

impl Session {
    /// Session over the real system: probes perf and sysfs once.
    pub fn new() -> Session {
        let mut session = Session::with_roots(
            std::env::var("PERF").unwrap_or_else(|_| "perf".to_string()),
            PathBuf::from(SYSFS_DEVICES),
            PathBuf::from(MSR_DEV_ROOT),
            artifact::default_cache_dir(),
            CapabilitySnapshot::fallback(),
        );
        session.capability = capability::probe(&mut session);
        session
    }

    /// Session with injected roots and snapshot; used by tests and by
    /// callers that force raw mode.
    pub fn with_roots(
        perf: String,
        sysfs_root: PathBuf,
        msr_dev_root: PathBuf,
        cache_dir: PathBuf,
        capability: CapabilitySnapshot,
    ) -> Session {
        let workaround = Workaround::new(msr_dev_root.clone());
        Session {
            perf,
            sysfs_root,
            msr_dev_root,
            cache_dir,
            capability,
            msr: MsrLedger::default(),
            workaround,
            file_exists: HashMap::new(),
            attr_exists: HashMap::new(),
            warned: HashSet::new(),
        }
    }

    /// Cached file-existence check. The cache lives for the whole run;
    /// sysfs and the artifact cache do not change underneath us.
    pub fn path_exists(&mut self, path: &Path) -> bool {
        if let Some(&hit) = self.file_exists.get(path) {
            return hit;
        }
        let exists = path.exists();
        self.file_exists.insert(path.to_path_buf(), exists);
        exists
    }

    /// Does `pmu` expose `attr` under its sysfs `format/` directory?
    /// Cached per (PMU, attribute) pair.
    pub fn pmu_has_format(&mut self, pmu: &str, attr: &str) -> bool {
        let key = (pmu.to_string(), attr.to_string());
        if let Some(&hit) = self.attr_exists.get(&key) {
            return hit;
        }
        let path = self.sysfs_root.join(pmu).join("format").join(attr);
        let exists = self.path_exists(&path);
        self.attr_exists.insert(key, exists);
        exists
    }

    /// Emit a warning once per distinct key per run.
    pub fn warn_once(&mut self, key: &str, message: &str) {
        if self.warned.insert(key.to_string()) {
            warn!("{message}");
        }
    }

    /// Core-type PMUs to load event tables for, in deterministic resolution
    /// order (`cpu_core` wins ambiguous bare names on hybrid systems).
    pub fn core_pmus(&self) -> Vec<&'static str> {
        if self.capability.hybrid {
            vec!["cpu_core", "cpu_atom"]
        } else {
            vec!["cpu"]
        }
    }
}
