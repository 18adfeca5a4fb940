//! Output Formatter: render resolved requests in the syntax the installed
//! perf understands.
//!
//! Legacy mode emits the merged raw encoding (`rXXXX:flags`). Dynamic mode
//! emits `pmu/attr=val,...,name=label/flags`; every attribute is checked
//! against the PMU's sysfs `format/` directory first and dropped with a
//! once-per-name warning when the running kernel does not expose it, so
//! over-specified modifiers degrade gracefully instead of blocking the
//! measurement.

use crate::capability::CapabilitySnapshot;
use crate::domain::EventError;
use crate::events::descriptor::bits;
use crate::resolve::{ResolvedRequest, UncoreResolved};
use crate::session::Session;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Legacy,
    Dynamic,
}

/// Mode selection is automatic from the snapshot unless the caller forces
/// raw output.
pub fn select_mode(capability: &CapabilitySnapshot, force_raw: bool) -> Mode {
    if force_raw || capability.direct {
        Mode::Legacy
    } else {
        Mode::Dynamic
    }
}

pub fn format_resolved(
    session: &mut Session,
    request: &ResolvedRequest,
    mode: Mode,
) -> Result<String, EventError> {
    match mode {
        Mode::Legacy => format_legacy(request),
        Mode::Dynamic => Ok(format_dynamic(session, request)),
    }
}

fn format_legacy(request: &ResolvedRequest) -> Result<String, EventError> {
    // Named attributes have no bit-level representation in a raw encoding.
    if let Some(name) = request.qualifiers.valued.keys().next() {
        return Err(EventError::LegacyQualifier(name.clone()));
    }
    if let Some((name, _)) = request.descriptor.dyn_attrs.first() {
        return Err(EventError::LegacyQualifier((*name).to_string()));
    }
    let val = request.descriptor.merged_value(&request.qualifiers);
    let base = request
        .descriptor
        .fixed_alias
        .map_or_else(|| format!("r{val:x}"), ToString::to_string);
    let mods = request.qualifiers.modifier_string(request.descriptor.precise);
    if mods.is_empty() {
        Ok(base)
    } else {
        Ok(format!("{base}:{mods}"))
    }
}

fn format_dynamic(session: &mut Session, request: &ResolvedRequest) -> String {
    let descriptor = &request.descriptor;
    let pmu = request.pmu.as_str();
    let val = descriptor.merged_value(&request.qualifiers);

    let mut attrs = vec![
        format!("event=0x{:x}", val & bits::EVENT_MASK),
        format!("umask=0x{:x}", (val & bits::UMASK_MASK) >> bits::UMASK_SHIFT),
    ];
    let mut push_checked = |session: &mut Session, attr: &str, rendered: String| {
        if session.pmu_has_format(pmu, attr) {
            attrs.push(rendered);
        } else {
            session.warn_once(
                &format!("attr:{attr}"),
                &format!("kernel does not expose '{attr}' on {pmu}, qualifier dropped"),
            );
        }
    };

    let cmask = (val & bits::CMASK_MASK) >> bits::CMASK_SHIFT;
    if cmask != 0 {
        push_checked(session, "cmask", format!("cmask=0x{cmask:x}"));
    }
    if val & bits::EDGE != 0 {
        push_checked(session, "edge", "edge=1".to_string());
    }
    if val & bits::INV != 0 {
        push_checked(session, "inv", "inv=1".to_string());
    }
    if val & bits::ANY != 0 {
        push_checked(session, "any", "any=1".to_string());
    }
    for (attr, value) in &descriptor.dyn_attrs {
        push_checked(session, attr, format!("{attr}=0x{value:x}"));
    }
    for (attr, value) in &request.qualifiers.valued {
        push_checked(session, attr, format!("{attr}={value}"));
    }
    if session.capability.has_name {
        attrs.push(format!("name={}", request.label.replace('.', "_")));
    }

    let mods = request.qualifiers.modifier_string(descriptor.precise);
    format!("{pmu}/{}/{mods}", attrs.join(","))
}

/// Dynamic-syntax string for one uncore box instance.
pub fn format_uncore(session: &mut Session, resolved: &UncoreResolved) -> String {
    let descriptor = &resolved.descriptor;
    let pmu = resolved.pmu.as_str();
    let mut attrs = vec![
        format!("event=0x{:x}", descriptor.code),
        format!("umask=0x{:x}", descriptor.umask),
    ];
    let mut push_checked = |session: &mut Session, attr: &str, rendered: String| {
        if session.pmu_has_format(pmu, attr) {
            attrs.push(rendered);
        } else {
            session.warn_once(
                &format!("attr:{attr}"),
                &format!("kernel does not expose '{attr}' on {pmu}, qualifier dropped"),
            );
        }
    };
    if descriptor.cmask != 0 {
        push_checked(session, "cmask", format!("cmask=0x{:x}", descriptor.cmask));
    }
    if descriptor.edge {
        push_checked(session, "edge", "edge=1".to_string());
    }
    if descriptor.invert {
        push_checked(session, "inv", "inv=1".to_string());
    }
    if session.capability.has_name {
        attrs.push(format!("name={}", descriptor.name.replace('.', "_")));
    }
    format!("{pmu}/{}/", attrs.join(","))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{PmuName, PreciseLevel};
    use crate::events::descriptor::EventDescriptor;
    use crate::qualifiers::{parse_tail, QualifierSet};
    use std::path::{Path, PathBuf};
    use tempfile::TempDir;

    fn dynamic_session(sysfs: &Path) -> Session {
        let snapshot = CapabilitySnapshot {
            version: (6, 8),
            direct: false,
            has_name: true,
            offcore: true,
            ldlat: true,
            hybrid: false,
        };
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

    fn request(val: u64, quals: QualifierSet, precise: PreciseLevel) -> ResolvedRequest {
        ResolvedRequest {
            descriptor: EventDescriptor {
                name: "mem_load_retired.l3_miss".to_string(),
                val,
                desc: String::new(),
                intrinsic: QualifierSet::default(),
                dyn_attrs: Vec::new(),
                msr: None,
                overflow: None,
                errata: None,
                precise,
                fixed_alias: None,
            },
            pmu: PmuName::new("cpu"),
            qualifiers: quals,
            label: "mem_load_retired.l3_miss".to_string(),
        }
    }

    #[test]
    fn test_legacy_plain() {
        let sysfs = TempDir::new().unwrap();
        let mut s = dynamic_session(sysfs.path());
        let r = request(0x20d1, QualifierSet::default(), PreciseLevel::None);
        assert_eq!(format_resolved(&mut s, &r, Mode::Legacy).unwrap(), "r20d1");
    }

    #[test]
    fn test_legacy_with_modifiers() {
        let sysfs = TempDir::new().unwrap();
        let mut s = dynamic_session(sysfs.path());
        let r = request(0x20d1, parse_tail("pp").set, PreciseLevel::Multi);
        assert_eq!(format_resolved(&mut s, &r, Mode::Legacy).unwrap(), "r20d1:pp");
    }

    #[test]
    fn test_legacy_never_emits_dynamic_syntax() {
        let sysfs = sysfs_with_formats(&["edge", "cmask"]);
        let mut s = dynamic_session(sysfs.path());
        let r = request(0x20d1, parse_tail("e:c1:k").set, PreciseLevel::None);
        let out = format_resolved(&mut s, &r, Mode::Legacy).unwrap();
        assert!(!out.contains('/'), "legacy output must not use pmu syntax: {out}");
        assert!(out.starts_with('r'));
        assert!(out.ends_with(":k"));
    }

    #[test]
    fn test_legacy_valued_qualifier_is_error() {
        let sysfs = TempDir::new().unwrap();
        let mut s = dynamic_session(sysfs.path());
        let r = request(0x01cd, parse_tail("ldlat=64").set, PreciseLevel::None);
        let err = format_resolved(&mut s, &r, Mode::Legacy).unwrap_err();
        assert!(matches!(err, EventError::LegacyQualifier(_)));
    }

    #[test]
    fn test_dynamic_scenario() {
        let sysfs = sysfs_with_formats(&["edge", "cmask", "inv", "any"]);
        let mut s = dynamic_session(sysfs.path());
        let r = request(0x20d1, parse_tail("pp").set, PreciseLevel::Multi);
        let out = format_resolved(&mut s, &r, Mode::Dynamic).unwrap();
        assert_eq!(out, "cpu/event=0xd1,umask=0x20,name=mem_load_retired_l3_miss/pp");
    }

    #[test]
    fn test_dynamic_never_emits_raw() {
        let sysfs = sysfs_with_formats(&["edge", "cmask"]);
        let mut s = dynamic_session(sysfs.path());
        let r = request(0x20d1, QualifierSet::default(), PreciseLevel::None);
        let out = format_resolved(&mut s, &r, Mode::Dynamic).unwrap();
        assert!(out.starts_with("cpu/"));
        assert!(!out.starts_with('r'));
    }

    #[test]
    fn test_dynamic_unsupported_attr_dropped() {
        // Kernel without cmask support: the qualifier is dropped, the rest
        // of the event still formats.
        let sysfs = sysfs_with_formats(&["edge"]);
        let mut s = dynamic_session(sysfs.path());
        let r = request(0x20d1, parse_tail("c2:e").set, PreciseLevel::None);
        let out = format_resolved(&mut s, &r, Mode::Dynamic).unwrap();
        assert!(!out.contains("cmask"));
        assert!(out.contains("edge=1"));
    }

    #[test]
    fn test_dynamic_cmask_qualifier() {
        let sysfs = sysfs_with_formats(&["cmask"]);
        let mut s = dynamic_session(sysfs.path());
        let r = request(0x003c, parse_tail("c2").set, PreciseLevel::None);
        let out = format_resolved(&mut s, &r, Mode::Dynamic).unwrap();
        assert!(out.contains("cmask=0x2"));
    }

    #[test]
    fn test_legacy_roundtrip_bits() {
        let sysfs = TempDir::new().unwrap();
        let mut s = dynamic_session(sysfs.path());
        let r = request(0x0153_01b7, QualifierSet::default(), PreciseLevel::None);
        let out = format_resolved(&mut s, &r, Mode::Legacy).unwrap();
        let parsed = u64::from_str_radix(out.strip_prefix('r').unwrap(), 16).unwrap();
        assert_eq!(parsed, 0x0153_01b7 & bits::EVMASK);
    }
}
