//! End-to-end resolution and formatting through the public API: JSON rows
//! in, perf event strings out.

use std::path::{Path, PathBuf};

use tempfile::TempDir;

use nperf::capability::CapabilitySnapshot;
use nperf::domain::PmuName;
use nperf::events::artifact::{self, CoreEventRow, MatrixRow, UncoreEventRow};
use nperf::events::EventTable;
use nperf::format::{self, Mode};
use nperf::qualifiers::parse_tail;
use nperf::resolve::{self, Resolution};
use nperf::session::Session;

fn dynamic_snapshot() -> CapabilitySnapshot {
    CapabilitySnapshot {
        version: (6, 8),
        direct: false,
        has_name: true,
        offcore: true,
        ldlat: true,
        hybrid: false,
    }
}

fn session_over(sysfs: &Path, snapshot: CapabilitySnapshot) -> Session {
    Session::with_roots(
        "perf".to_string(),
        sysfs.to_path_buf(),
        PathBuf::from("/nonexistent"),
        PathBuf::from("/nonexistent"),
        snapshot,
    )
}

fn sysfs_with_formats(attrs: &[&str]) -> TempDir {
    let dir = TempDir::new().unwrap();
    let format = dir.path().join("cpu").join("format");
    std::fs::create_dir_all(&format).unwrap();
    for attr in attrs {
        std::fs::write(format.join(attr), "config:0-7\n").unwrap();
    }
    dir
}

fn table_from_json(json: &str) -> EventTable {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("events.json");
    std::fs::write(&path, json).unwrap();
    let rows: Vec<CoreEventRow> = artifact::load_rows(&path).unwrap();
    let mut table = EventTable::empty("GenuineIntel-6-2A", PmuName::new("cpu"));
    for row in &rows {
        table.add_core_row(row, true, true);
    }
    table
}

const L3_MISS_JSON: &str = r#"[{
    "EventName": "MEM_LOAD_RETIRED.L3_MISS",
    "EventCode": "0xD1", "UMask": "0x20", "PEBS": "2",
    "SampleAfterValue": "50021",
    "BriefDescription": "Retired load instructions missed L3"
}]"#;

#[test]
fn test_scenario_dynamic_syntax() {
    let sysfs = sysfs_with_formats(&["edge", "cmask", "inv", "any"]);
    let mut session = session_over(sysfs.path(), dynamic_snapshot());
    let tables = vec![table_from_json(L3_MISS_JSON)];

    let Resolution::Core(resolved) =
        resolve::resolve(&mut session, &tables, "MEM_LOAD_RETIRED.L3_MISS:pp").unwrap()
    else {
        panic!("expected core resolution");
    };
    let out = format::format_resolved(&mut session, &resolved, Mode::Dynamic).unwrap();
    assert_eq!(out, "cpu/event=0xd1,umask=0x20,name=mem_load_retired_l3_miss/pp");
}

#[test]
fn test_scenario_legacy_syntax() {
    let sysfs = TempDir::new().unwrap();
    let mut snapshot = dynamic_snapshot();
    snapshot.direct = true;
    snapshot.has_name = false;
    let mut session = session_over(sysfs.path(), snapshot);
    let tables = vec![table_from_json(L3_MISS_JSON)];

    let Resolution::Core(resolved) =
        resolve::resolve(&mut session, &tables, "mem_load_retired.l3_miss:pp").unwrap()
    else {
        panic!("expected core resolution");
    };
    let out = format::format_resolved(&mut session, &resolved, Mode::Legacy).unwrap();
    assert_eq!(out, "r20d1:pp");
}

#[test]
fn test_max_precise_collapses_to_event_ceiling() {
    let sysfs = sysfs_with_formats(&["edge", "cmask"]);
    let mut session = session_over(sysfs.path(), dynamic_snapshot());
    let tables = vec![table_from_json(L3_MISS_JSON)];

    let Resolution::Core(resolved) =
        resolve::resolve(&mut session, &tables, "mem_load_retired.l3_miss:P").unwrap()
    else {
        panic!("expected core resolution");
    };
    let out = format::format_resolved(&mut session, &resolved, Mode::Dynamic).unwrap();
    assert!(out.ends_with("/pp"), "PEBS=2 event should collapse P to pp: {out}");
}

#[test]
fn test_qualifier_merge_is_idempotent_and_commutative() {
    let a = parse_tail("pp:k:c2").set;
    let b = parse_tail("e:u").set;
    assert_eq!(a.merge(&a), a);
    let ab = a.merge(&b);
    let ba = b.merge(&a);
    assert_eq!(ab.letters, ba.letters);
    assert_eq!(ab.precise, ba.precise);
    assert_eq!(ab.cmask, ba.cmask);
}

#[test]
fn test_offcore_synthesis_preserves_explicit_rows() {
    let mut table = table_from_json(
        r#"[{"EventName": "OFFCORE_RESPONSE.DMND_DATA_RD.LLC_HIT",
             "EventCode": "0xB7", "UMask": "0x01",
             "MSRIndex": "0x1a6", "MSRValue": "0x10001",
             "BriefDescription": "hand-written row"}]"#,
    );
    let matrix = vec![
        MatrixRow {
            kind: "request".to_string(),
            name: "DMND_DATA_RD".to_string(),
            offset: "0".to_string(),
            desc: None,
        },
        MatrixRow {
            kind: "response".to_string(),
            name: "LLC_HIT".to_string(),
            offset: "2".to_string(),
            desc: None,
        },
        MatrixRow {
            kind: "response".to_string(),
            name: "LLC_MISS".to_string(),
            offset: "4".to_string(),
            desc: None,
        },
    ];
    table.synthesize_offcore(&matrix, true);

    // Hand-written row survives untouched.
    let explicit = table.get("offcore_response.dmnd_data_rd.llc_hit").unwrap();
    assert_eq!(explicit.dyn_attrs, vec![("offcore_rsp", 0x10001)]);
    // The other cross-product member is synthesized: (1<<0) | (1<<4)<<16.
    let derived = table.get("offcore_response.dmnd_data_rd.llc_miss").unwrap();
    assert_eq!(derived.dyn_attrs, vec![("offcore_rsp", 0x0010_0001)]);
}

#[test]
fn test_uncore_expands_across_instances() {
    let sysfs = TempDir::new().unwrap();
    for i in 0..4 {
        std::fs::create_dir_all(sysfs.path().join(format!("uncore_cbox_{i}"))).unwrap();
    }
    let mut session = session_over(sysfs.path(), dynamic_snapshot());

    let mut table = EventTable::empty("GenuineIntel-6-2D", PmuName::new("cpu"));
    table.add_uncore_rows(vec![UncoreEventRow {
        unit: "CBO".to_string(),
        name: "LLC_LOOKUP.ANY".to_string(),
        code: Some("0x34".to_string()),
        umask: Some("0x11".to_string()),
        cmask: None,
        edge: None,
        invert: None,
        desc: None,
    }]);
    let tables = vec![table];

    let Resolution::Uncore(instances) =
        resolve::resolve(&mut session, &tables, "llc_lookup.any").unwrap()
    else {
        panic!("expected uncore resolution");
    };
    assert_eq!(instances.len(), 4);
    let out = format::format_uncore(&mut session, &instances[0]);
    assert!(out.starts_with("uncore_cbox_0/event=0x34,umask=0x11"), "{out}");

    // The "one" qualifier restricts to the first instance.
    let Resolution::Uncore(first) =
        resolve::resolve(&mut session, &tables, "llc_lookup.any:one").unwrap()
    else {
        panic!("expected uncore resolution");
    };
    assert_eq!(first.len(), 1);
    assert_eq!(first[0].pmu.as_str(), "uncore_cbox_0");
}
