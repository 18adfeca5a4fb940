//! Resolution Engine: symbolic request -> fully encoded descriptor(s).
//!
//! Lookup runs through an explicit ordered list of strategies so the
//! fallback order is an enumerable, testable contract rather than an
//! implicit chain of branches. Resolution never mutates the table: when a
//! request supplies qualifiers beyond the intrinsic set, the result holds a
//! private clone of the descriptor.

use log::debug;

use crate::domain::{EventError, PmuName};
use crate::events::descriptor::{EventDescriptor, UncoreEventDescriptor};
use crate::events::{table::EventTable, uncore};
use crate::qualifiers::{self, QualifierSet};
use crate::session::Session;

/// Uncore qualifier restricting a request to the first box instance.
const FIRST_INSTANCE_QUALIFIER: &str = "one";

/// A resolved core event, ready for the output formatter.
#[derive(Debug, Clone)]
pub struct ResolvedRequest {
    pub descriptor: EventDescriptor,
    /// PMU to emit under in dynamic syntax.
    pub pmu: PmuName,
    /// Intrinsic qualifiers merged with the caller's.
    pub qualifiers: QualifierSet,
    /// Base name exactly as the caller requested it (lower-cased).
    pub label: String,
}

/// A resolved uncore event bound to one discovered box instance.
#[derive(Debug, Clone)]
pub struct UncoreResolved {
    pub descriptor: UncoreEventDescriptor,
    pub pmu: PmuName,
}

#[derive(Debug)]
pub enum Resolution {
    Core(ResolvedRequest),
    Uncore(Vec<UncoreResolved>),
}

/// A strategy hit: the matched descriptor plus any precision the strategy
/// itself implies (the `_ps` alias adds one `p`).
pub struct LookupHit<'a> {
    pub descriptor: &'a EventDescriptor,
    pub extra_precise: u8,
}

type Strategy = for<'a> fn(&'a EventTable, &str) -> Option<LookupHit<'a>>;

/// The fixed lookup order. Changing this order changes which event a
/// best-effort request resolves to, so it is part of the contract.
pub const STRATEGIES: &[(&str, Strategy)] = &[
    ("exact", lookup_exact),
    ("folded", lookup_folded),
    ("precise-suffix", lookup_precise_suffix),
    ("index-suffix", lookup_index_suffix),
    ("offcore-zero", lookup_offcore_zero),
    ("raw-code", lookup_raw_code),
];

fn lookup_exact<'a>(table: &'a EventTable, name: &str) -> Option<LookupHit<'a>> {
    table.get(name).map(|descriptor| LookupHit { descriptor, extra_precise: 0 })
}

fn lookup_folded<'a>(table: &'a EventTable, name: &str) -> Option<LookupHit<'a>> {
    table.get_folded(name).map(|descriptor| LookupHit { descriptor, extra_precise: 0 })
}

/// `foo_ps` names the precise variant of `foo`.
fn lookup_precise_suffix<'a>(table: &'a EventTable, name: &str) -> Option<LookupHit<'a>> {
    let base = name.strip_suffix("_ps")?;
    table.get(base).map(|descriptor| LookupHit { descriptor, extra_precise: 1 })
}

/// Some lists append a counter index (`_0`, `_1`) the kernel doesn't care
/// about.
fn lookup_index_suffix<'a>(table: &'a EventTable, name: &str) -> Option<LookupHit<'a>> {
    let base = name.strip_suffix("_0").or_else(|| name.strip_suffix("_1"))?;
    table.get(base).map(|descriptor| LookupHit { descriptor, extra_precise: 0 })
}

/// Offcore events are sometimes only listed with an explicit `_0` register
/// index.
fn lookup_offcore_zero<'a>(table: &'a EventTable, name: &str) -> Option<LookupHit<'a>> {
    if !name.starts_with("offcore") {
        return None;
    }
    table.get(&format!("{name}_0")).map(|descriptor| LookupHit { descriptor, extra_precise: 0 })
}

/// `rXXXX` reverse lookup against the raw-value index.
fn lookup_raw_code<'a>(table: &'a EventTable, name: &str) -> Option<LookupHit<'a>> {
    let hex = name.strip_prefix('r')?;
    if hex.is_empty() || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    let val = u64::from_str_radix(hex, 16).ok()?;
    table.get_by_val(val).map(|descriptor| LookupHit { descriptor, extra_precise: 0 })
}

fn lookup<'a>(table: &'a EventTable, name: &str) -> Option<LookupHit<'a>> {
    for (strategy_name, strategy) in STRATEGIES {
        if let Some(hit) = strategy(table, name) {
            debug!("'{name}' resolved by {strategy_name} strategy to '{}'", hit.descriptor.name);
            return Some(hit);
        }
    }
    None
}

/// Resolve one request string against the loaded tables.
///
/// Per-event failures return `Err` and must not abort sibling requests;
/// recoverable oddities (leftover qualifier tokens, ambiguous bare names on
/// hybrid systems) are diagnostics only.
pub fn resolve(
    session: &mut Session,
    tables: &[EventTable],
    request: &str,
) -> Result<Resolution, EventError> {
    // Only the base name is case-folded: qualifier letters are
    // case-significant (`P` vs `p`, `H`, `G`).
    let (base, tail) = qualifiers::split_request(request);
    let base = base.to_lowercase();
    let base = base.as_str();
    let mut parsed = qualifiers::parse_tail(tail);

    let first_only = parsed.leftover.iter().any(|t| t == FIRST_INSTANCE_QUALIFIER);
    parsed.leftover.retain(|t| t != FIRST_INSTANCE_QUALIFIER);
    for token in &parsed.leftover {
        session.warn_once(
            &format!("qualifier:{token}"),
            &format!("unsupported qualifier '{token}' in '{request}', ignored"),
        );
    }

    // Uncore events live in their own namespace and expand per box instance.
    if let Some(uncore_event) = tables.iter().find_map(|t| t.get_uncore(base)) {
        if session.capability.direct {
            return Err(EventError::NeedsDynamicSyntax(base.to_string()));
        }
        let descriptor = uncore_event.clone();
        let pmus = uncore::expand(session, &descriptor, first_only)?;
        return Ok(Resolution::Uncore(
            pmus.into_iter()
                .map(|pmu| UncoreResolved { descriptor: descriptor.clone(), pmu })
                .collect(),
        ));
    }

    let mut hits: Vec<(&EventTable, LookupHit<'_>)> = Vec::new();
    for table in tables {
        if let Some(hit) = lookup(table, base) {
            hits.push((table, hit));
        }
    }
    if hits.len() > 1 {
        let pmus: Vec<&str> = hits.iter().map(|(t, _)| t.pmu.as_str()).collect();
        session.warn_once(
            &format!("ambiguous:{base}"),
            &format!("'{base}' exists on {}; using {}", pmus.join(" and "), pmus[0]),
        );
    }
    let (table, hit) = hits.into_iter().next().ok_or_else(|| {
        EventError::NotFound(base.to_string())
    })?;

    let mut qualifiers = hit.descriptor.intrinsic.merge(&parsed.set);
    qualifiers.precise = qualifiers.precise.max(hit.extra_precise);

    Ok(Resolution::Core(ResolvedRequest {
        descriptor: hit.descriptor.clone(),
        pmu: table.pmu.clone(),
        qualifiers,
        label: base.to_string(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::CapabilitySnapshot;
    use crate::events::artifact::CoreEventRow;
    use std::path::PathBuf;

    fn session() -> Session {
        Session::with_roots(
            "perf".to_string(),
            PathBuf::from("/nonexistent"),
            PathBuf::from("/nonexistent"),
            PathBuf::from("/nonexistent"),
            CapabilitySnapshot::fallback(),
        )
    }

    fn table_with(rows: &[(&str, &str, &str)]) -> EventTable {
        let mut t = EventTable::empty("GenuineIntel-6-2A", PmuName::new("cpu"));
        for (name, code, umask) in rows {
            let row = CoreEventRow {
                name: (*name).to_string(),
                code: Some((*code).to_string()),
                umask: Some((*umask).to_string()),
                ..CoreEventRow::default()
            };
            t.add_core_row(&row, false, false);
        }
        t
    }

    fn resolve_core(session: &mut Session, tables: &[EventTable], req: &str) -> ResolvedRequest {
        match resolve(session, tables, req).unwrap() {
            Resolution::Core(r) => r,
            Resolution::Uncore(_) => panic!("expected core resolution"),
        }
    }

    #[test]
    fn test_exact_lookup() {
        let tables = vec![table_with(&[("INST_RETIRED.ANY_P", "0xc0", "0x00")])];
        let mut s = session();
        let r = resolve_core(&mut s, &tables, "INST_RETIRED.ANY_P");
        assert_eq!(r.descriptor.name, "inst_retired.any_p");
        assert_eq!(r.pmu.as_str(), "cpu");
    }

    #[test]
    fn test_strategy_order_is_declared() {
        let names: Vec<&str> = STRATEGIES.iter().map(|(n, _)| *n).collect();
        assert_eq!(
            names,
            vec!["exact", "folded", "precise-suffix", "index-suffix", "offcore-zero", "raw-code"]
        );
    }

    #[test]
    fn test_ps_suffix_adds_precision() {
        let tables = vec![table_with(&[("MEM_UOPS_RETIRED.ALL_LOADS", "0xd0", "0x81")])];
        let mut s = session();
        let r = resolve_core(&mut s, &tables, "mem_uops_retired.all_loads_ps");
        assert_eq!(r.descriptor.name, "mem_uops_retired.all_loads");
        assert_eq!(r.qualifiers.precise, 1);
    }

    #[test]
    fn test_index_suffix_stripped() {
        let tables = vec![table_with(&[("DTLB_MISSES.ANY", "0x49", "0x01")])];
        let mut s = session();
        let r = resolve_core(&mut s, &tables, "dtlb_misses.any_1");
        assert_eq!(r.descriptor.name, "dtlb_misses.any");
    }

    #[test]
    fn test_offcore_zero_suffix() {
        let tables = vec![table_with(&[("OFFCORE_RESPONSE.ANY_DATA_0", "0xb7", "0x01")])];
        let mut s = session();
        let r = resolve_core(&mut s, &tables, "offcore_response.any_data");
        assert_eq!(r.descriptor.name, "offcore_response.any_data_0");
    }

    #[test]
    fn test_raw_code_reverse_lookup() {
        let tables = vec![table_with(&[("BR_MISP_RETIRED.ALL", "0xc5", "0x00")])];
        let mut s = session();
        let r = resolve_core(&mut s, &tables, "r00c5");
        assert_eq!(r.descriptor.name, "br_misp_retired.all");
    }

    #[test]
    fn test_not_found() {
        let tables = vec![table_with(&[("A.B", "0x01", "0x01")])];
        let mut s = session();
        let err = resolve(&mut s, &tables, "no.such.event").unwrap_err();
        assert!(matches!(err, EventError::NotFound(_)));
    }

    #[test]
    fn test_qualifier_merge_produces_clone() {
        let tables = vec![table_with(&[("CPU_CLK.THREAD", "0x3c", "0x00")])];
        let mut s = session();
        let r = resolve_core(&mut s, &tables, "cpu_clk.thread:pp:k");
        assert_eq!(r.qualifiers.precise, 2);
        assert!(r.qualifiers.letters.contains(&'k'));
        // The table original is untouched.
        assert!(tables[0].get("cpu_clk.thread").unwrap().intrinsic.is_empty());
    }

    #[test]
    fn test_leftover_token_does_not_block_resolution() {
        let tables = vec![table_with(&[("CPU_CLK.THREAD", "0x3c", "0x00")])];
        let mut s = session();
        let r = resolve_core(&mut s, &tables, "cpu_clk.thread:bogus");
        assert_eq!(r.descriptor.name, "cpu_clk.thread");
    }

    #[test]
    fn test_uppercase_qualifiers_survive_name_folding() {
        let tables = vec![table_with(&[("MEM_LOAD_RETIRED.L3_MISS", "0xd1", "0x20")])];
        let mut s = session();
        // Base name is case-folded, the tail is not: `P` must stay
        // max-precision, not degrade to a single `p`.
        let r = resolve_core(&mut s, &tables, "MEM_LOAD_RETIRED.L3_MISS:P");
        assert!(r.qualifiers.max_precise);
        assert_eq!(r.qualifiers.precise, 0);
    }

    #[test]
    fn test_mode_letter_case_is_preserved() {
        let tables = vec![table_with(&[("CPU_CLK.THREAD", "0x3c", "0x00")])];
        let mut s = session();
        let r = resolve_core(&mut s, &tables, "CPU_CLK.THREAD:H:G");
        assert!(r.qualifiers.letters.contains(&'H'));
        assert!(r.qualifiers.letters.contains(&'G'));
        assert!(!r.qualifiers.letters.contains(&'h'));
    }

    #[test]
    fn test_ambiguous_bare_name_picks_first_table() {
        let mut core = EventTable::empty("GenuineIntel-6-97", PmuName::new("cpu_core"));
        let mut atom = EventTable::empty("GenuineIntel-6-97", PmuName::new("cpu_atom"));
        let row = CoreEventRow {
            name: "CPU_CLK.THREAD".to_string(),
            code: Some("0x3c".to_string()),
            umask: Some("0x00".to_string()),
            ..CoreEventRow::default()
        };
        core.add_core_row(&row, false, false);
        atom.add_core_row(&row, false, false);
        let tables = vec![core, atom];
        let mut s = session();
        let r = resolve_core(&mut s, &tables, "cpu_clk.thread");
        assert_eq!(r.pmu.as_str(), "cpu_core");
    }
}
