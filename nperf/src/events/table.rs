//! Event table construction from the declarative artifacts.
//!
//! A table is built once per CPU identifier (and per core-type PMU on
//! hybrid systems). Malformed rows are skipped with a diagnostic; a broken
//! row must never block use of the rest of the table.

use std::collections::HashMap;
use std::io::Write;

use log::{debug, warn};

use crate::domain::{Msr, PmuName, PreciseLevel, TableError};
use crate::events::artifact::{self, CoreEventRow, MatrixRow, UncoreEventRow};
use crate::events::descriptor::{
    bits, fold_name, EventDescriptor, MsrWrite, UncoreEventDescriptor,
};
use crate::qualifiers::QualifierSet;
use crate::session::Session;

/// Offcore response configuration registers: expressible as a dynamic
/// `offcore_rsp` attribute when the kernel allows, an MSR write otherwise.
const OFFCORE_MSRS: [u32; 2] = [0x1a6, 0x1a7];
/// Load latency threshold register, dynamic `ldlat` attribute when allowed.
const LDLAT_MSR: u32 = 0x3f6;

/// CPU identifier of the part whose load-latency events need the errata
/// workaround (Sandy Bridge EP).
const WORKAROUND_CPU: &str = "GenuineIntel-6-2D";

/// Base encoding for synthesized offcore events when the table carries no
/// hand-written OFFCORE_RESPONSE row: event 0xb7, umask 0x01, MSR 0x1a6.
const OFFCORE_BASE_VAL: u64 = 0x01b7;
const OFFCORE_BASE_NAME: &str = "offcore_response";

#[derive(Debug)]
pub struct EventTable {
    pub pmu: PmuName,
    pub cpu: String,
    /// Events on this CPU need the platform errata workaround check.
    pub workaround_cpu: bool,
    events: HashMap<String, EventDescriptor>,
    by_val: HashMap<u64, String>,
    folded: HashMap<String, String>,
    uncore: HashMap<String, UncoreEventDescriptor>,
    /// Emitted perf string -> the label the caller asked for, so later
    /// profiler output can be mapped back.
    emitted: HashMap<String, String>,
}

impl EventTable {
    /// Load the table for `cpu` under `pmu`, merging the optional offcore
    /// matrix and uncore artifacts.
    pub fn load(session: &mut Session, cpu: &str, pmu: PmuName) -> Result<EventTable, TableError> {
        let kind = if pmu.as_str() == "cpu_atom" { "atom" } else { "core" };
        let core_path = artifact::locate_core(session, cpu, kind)?;
        let rows: Vec<CoreEventRow> = artifact::load_rows(&core_path)?;

        let mut table = EventTable::empty(cpu, pmu);
        let offcore_dynamic = session.capability.offcore;
        let ldlat_dynamic = session.capability.ldlat;
        for row in rows {
            table.add_core_row(&row, offcore_dynamic, ldlat_dynamic);
        }
        debug!("loaded {} events from {}", table.events.len(), core_path.display());

        if let Some(path) = artifact::locate(session, "OFFCORE", cpu, "matrix") {
            let rows: Vec<MatrixRow> = artifact::load_rows(&path)?;
            table.synthesize_offcore(&rows, offcore_dynamic);
        }
        if let Some(path) = artifact::locate(session, "UNCORE", cpu, "uncore") {
            let rows: Vec<UncoreEventRow> = artifact::load_rows(&path)?;
            table.add_uncore_rows(rows);
        }
        Ok(table)
    }

    pub fn empty(cpu: &str, pmu: PmuName) -> EventTable {
        EventTable {
            pmu,
            cpu: cpu.to_string(),
            workaround_cpu: cpu == WORKAROUND_CPU,
            events: HashMap::new(),
            by_val: HashMap::new(),
            folded: HashMap::new(),
            uncore: HashMap::new(),
            emitted: HashMap::new(),
        }
    }

    /// Parse one core row into a descriptor. Absent or unparsable required
    /// hex fields skip the row with a diagnostic, never fail the load.
    pub fn add_core_row(&mut self, row: &CoreEventRow, offcore_dynamic: bool, ldlat_dynamic: bool) {
        let name = row.name.trim().to_lowercase();
        if name.is_empty() {
            warn!("skipping event row without a name");
            return;
        }
        let (Some(code), Some(umask)) = (
            row.code.as_deref().and_then(artifact::parse_hex),
            row.umask.as_deref().and_then(artifact::parse_hex),
        ) else {
            warn!("skipping event '{name}': missing or invalid event code / umask");
            return;
        };

        let hex = |field: &Option<String>| field.as_deref().and_then(artifact::parse_hex);
        let mut val = code | (umask << bits::UMASK_SHIFT);
        if hex(&row.edge).unwrap_or(0) != 0 {
            val |= bits::EDGE;
        }
        if hex(&row.any_thread).unwrap_or(0) != 0 {
            val |= bits::ANY;
        }
        if hex(&row.invert).unwrap_or(0) != 0 {
            val |= bits::INV;
        }
        val |= hex(&row.cmask).unwrap_or(0) << bits::CMASK_SHIFT;
        val &= bits::EVMASK;

        let mut desc = row.desc.clone().unwrap_or_default().trim().to_string();
        let pebs = row.pebs.as_deref().and_then(|p| p.trim().parse::<u32>().ok()).unwrap_or(0);
        let precise = PreciseLevel::from_pebs(pebs);
        let mut intrinsic = QualifierSet::default();
        if pebs > 0 {
            if name.ends_with("_ps") {
                // The _ps variant is the precise event itself.
                intrinsic.precise = precise.ceiling();
                desc.push_str(" (Uses PEBS)");
            } else {
                desc = desc.replace("(Precise Event)", "");
                desc.push_str(" (Supports PEBS)");
            }
        }

        let mut dyn_attrs = Vec::new();
        let mut msr = None;
        if let (Some(index), Some(value)) =
            (hex(&row.msr_index), row.msr_value.as_deref().and_then(artifact::parse_hex))
        {
            let index = index as u32;
            if OFFCORE_MSRS.contains(&index) && offcore_dynamic {
                dyn_attrs.push(("offcore_rsp", value));
            } else if index == LDLAT_MSR && ldlat_dynamic {
                dyn_attrs.push(("ldlat", value));
            } else if index != 0 {
                msr = Some(MsrWrite { msr: Msr(index), value });
            }
        }

        let descriptor = EventDescriptor {
            name: name.clone(),
            val,
            desc,
            intrinsic,
            dyn_attrs,
            msr,
            overflow: row.sample_after.clone().filter(|s| !s.is_empty()),
            errata: row.errata.clone().filter(|e| !e.is_empty() && e != "null"),
            precise,
            fixed_alias: fixed_counter_alias(row.counter.as_deref()),
        };
        self.insert(descriptor);
    }

    fn insert(&mut self, descriptor: EventDescriptor) {
        self.folded.insert(fold_name(&descriptor.name), descriptor.name.clone());
        // First writer wins in the reverse map; later identical encodings
        // are deliberate aliases (e.g. fixed counters).
        self.by_val.entry(descriptor.val).or_insert_with(|| descriptor.name.clone());
        self.events.insert(descriptor.name.clone(), descriptor);
    }

    /// Cross request reasons with response reasons into derived
    /// `offcore_response.<req>.<resp>` events. Hand-specified rows of the
    /// same name are never overwritten.
    pub fn synthesize_offcore(&mut self, rows: &[MatrixRow], offcore_dynamic: bool) {
        let reason = |kind: &str| -> Vec<(String, u64)> {
            rows.iter()
                .filter(|r| r.kind.eq_ignore_ascii_case(kind))
                .filter_map(|r| {
                    let bit = r.offset.trim().parse::<u64>().ok()?;
                    Some((r.name.trim().to_lowercase(), bit))
                })
                .collect()
        };
        let requests = reason("request");
        let responses = reason("response");

        let base = self.events.get(OFFCORE_BASE_NAME).cloned();
        let base_val = base.as_ref().map_or(OFFCORE_BASE_VAL, |b| b.val);
        let base_msr = base
            .as_ref()
            .and_then(|b| b.msr.map(|m| m.msr))
            .unwrap_or(Msr(OFFCORE_MSRS[0]));

        let mut synthesized = 0;
        for (req_name, req_bit) in &requests {
            for (resp_name, resp_bit) in &responses {
                let name = format!("{OFFCORE_BASE_NAME}.{req_name}.{resp_name}");
                if self.events.contains_key(&name) {
                    continue;
                }
                let value = (1 << req_bit) | ((1u64 << resp_bit) << 16);
                let (dyn_attrs, msr) = if offcore_dynamic {
                    (vec![("offcore_rsp", value)], None)
                } else {
                    (Vec::new(), Some(MsrWrite { msr: base_msr, value }))
                };
                self.insert(EventDescriptor {
                    name,
                    val: base_val,
                    desc: format!("Offcore response: {req_name} x {resp_name}"),
                    intrinsic: QualifierSet::default(),
                    dyn_attrs,
                    msr,
                    overflow: None,
                    errata: None,
                    precise: PreciseLevel::None,
                    fixed_alias: None,
                });
                synthesized += 1;
            }
        }
        debug!(
            "synthesized {synthesized} offcore events ({} requests x {} responses)",
            requests.len(),
            responses.len()
        );
    }

    pub fn add_uncore_rows(&mut self, rows: Vec<UncoreEventRow>) {
        for row in rows {
            let name = row.name.trim().to_lowercase();
            let (Some(code), Some(umask)) = (
                row.code.as_deref().and_then(artifact::parse_hex),
                row.umask.as_deref().and_then(artifact::parse_hex),
            ) else {
                warn!("skipping uncore event '{name}': missing or invalid code / umask");
                continue;
            };
            let hex = |field: &Option<String>| field.as_deref().and_then(artifact::parse_hex);
            self.uncore.insert(
                name.clone(),
                UncoreEventDescriptor {
                    name,
                    unit: row.unit.trim().to_string(),
                    code,
                    umask,
                    cmask: hex(&row.cmask).unwrap_or(0),
                    edge: hex(&row.edge).unwrap_or(0) != 0,
                    invert: hex(&row.invert).unwrap_or(0) != 0,
                    desc: row.desc.unwrap_or_default(),
                },
            );
        }
    }

    pub fn get(&self, name: &str) -> Option<&EventDescriptor> {
        self.events.get(name)
    }

    /// Best-effort lookup with punctuation folded out of the name.
    pub fn get_folded(&self, name: &str) -> Option<&EventDescriptor> {
        self.events.get(self.folded.get(&fold_name(name))?)
    }

    pub fn get_by_val(&self, val: u64) -> Option<&EventDescriptor> {
        self.events.get(self.by_val.get(&val)?)
    }

    pub fn get_uncore(&self, name: &str) -> Option<&UncoreEventDescriptor> {
        self.uncore.get(name)
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Remember what was emitted for a resolved request so profiler output
    /// can be translated back to symbolic names.
    pub fn record_emitted(&mut self, perf_string: &str, label: &str) {
        self.emitted.entry(perf_string.to_string()).or_insert_with(|| label.to_string());
    }

    pub fn label_for_emitted(&self, perf_string: &str) -> Option<&str> {
        self.emitted.get(perf_string).map(String::as_str)
    }

    /// Symbolic name for a raw encoding seen in profiler output.
    pub fn label_for_raw(&self, val: u64) -> Option<&str> {
        self.get_by_val(val).map(|e| e.name.as_str())
    }

    /// Append the event listing to `w` (the `list` subcommand supplement).
    pub fn dump_events(&self, w: &mut impl Write) -> std::io::Result<()> {
        let mut names: Vec<&String> = self.events.keys().collect();
        names.sort();
        for name in names {
            writeln!(w, "  {:<42}  [{}]", name, self.events[name.as_str()].desc)?;
        }
        Ok(())
    }
}

fn fixed_counter_alias(counter: Option<&str>) -> Option<&'static str> {
    let counter = counter?.trim();
    match counter {
        "32" => Some("instructions"),
        "33" => Some("cycles"),
        "34" => Some("ref-cycles"),
        _ => {
            let lower = counter.to_lowercase();
            let n = lower.strip_prefix("fixed counter ")?;
            match n {
                "1" => Some("instructions"),
                "2" => Some("cycles"),
                "3" => Some("ref-cycles"),
                _ => None,
            }
        }
    }
}
