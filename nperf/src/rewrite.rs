//! Command Rewriter: translate a whole `-e` event list.
//!
//! Splits on top-level commas (the bodies of `pmu/.../` terms are opaque),
//! preserves `{`/`}` multiplexing-group markers verbatim, resolves and
//! formats each symbolic token, and passes already-raw tokens through
//! untouched apart from recovering their label and overflow default.
//! Per-event failures drop that one event with a diagnostic; a register
//! conflict is the only fatal outcome.

use log::warn;

use crate::domain::EventError;
use crate::events::EventTable;
use crate::format::{self, Mode};
use crate::qualifiers;
use crate::resolve::{self, Resolution, ResolvedRequest};
use crate::session::Session;

#[derive(Debug)]
pub struct Rewritten {
    /// Comma-joined perf event list.
    pub events: String,
    /// First resolved event's default overflow value, for `-c default`.
    pub overflow: Option<String>,
}

/// Rewrite one `-e` argument.
pub fn rewrite_events(
    session: &mut Session,
    tables: &mut [EventTable],
    spec: &str,
    dry_run: bool,
) -> Result<Rewritten, EventError> {
    let mode = format::select_mode(&session.capability, false);
    let mut out: Vec<String> = Vec::new();
    let mut overflow: Option<String> = None;

    for raw_token in split_top_level(spec) {
        let (open, token, close) = strip_groups(&raw_token);

        // Already in pmu/.../ syntax: resolve an inner symbolic name if one
        // is present, otherwise pass through untouched.
        if token.contains('/') {
            match rewrite_pmu_term(session, tables, token) {
                Some(rewritten) => out.push(format!("{open}{rewritten}{close}")),
                None => out.push(raw_token.clone()),
            }
            continue;
        }

        // Raw hex: recover label and overflow only, never re-encode.
        if let Some(val) = parse_raw_token(token) {
            if let Some(table) = tables.iter_mut().find(|t| t.get_by_val(val).is_some()) {
                if let Some(descriptor) = table.get_by_val(val) {
                    let label = descriptor.name.clone();
                    let default = descriptor.overflow.clone();
                    overflow = overflow.or(default);
                    table.record_emitted(token, &label);
                }
            }
            out.push(raw_token.clone());
            continue;
        }

        match resolve::resolve(session, tables, token) {
            Ok(Resolution::Core(resolved)) => {
                let formatted = match format::format_resolved(session, &resolved, mode) {
                    Ok(f) => f,
                    Err(e @ EventError::LegacyQualifier(_)) => {
                        warn!("dropping '{token}': {e}");
                        continue;
                    }
                    Err(e) => return Err(e),
                };
                apply_side_effects(session, tables, &resolved, dry_run)?;
                overflow = overflow.or_else(|| resolved.descriptor.overflow.clone());
                record(tables, &resolved, &formatted);
                out.push(format!("{open}{formatted}{close}"));
            }
            Ok(Resolution::Uncore(instances)) => {
                let formatted: Vec<String> = instances
                    .iter()
                    .map(|instance| format::format_uncore(session, instance))
                    .collect();
                out.push(format!("{open}{}{close}", formatted.join(",")));
            }
            Err(e @ EventError::RegisterConflict { .. }) => return Err(e),
            Err(e) => {
                // Per-event failure: drop this event, keep the siblings.
                warn!("dropping '{token}': {e}");
            }
        }
    }

    Ok(Rewritten { events: out.join(","), overflow })
}

/// Program the auxiliary register and toggle the errata workaround for a
/// resolved event, honoring the one-writer-per-register invariant.
fn apply_side_effects(
    session: &mut Session,
    tables: &[EventTable],
    resolved: &ResolvedRequest,
    dry_run: bool,
) -> Result<(), EventError> {
    if let Some(write) = resolved.descriptor.msr {
        let dev_root = session.msr_dev_root.clone();
        session.msr.checked_write(&dev_root, write.msr, write.value, dry_run)?;
    }
    let workaround_cpu =
        tables.iter().any(|t| t.pmu == resolved.pmu && t.workaround_cpu);
    if workaround_cpu {
        session.workaround.apply(resolved.descriptor.val & 0xffff, dry_run);
    }
    Ok(())
}

fn record(tables: &mut [EventTable], resolved: &ResolvedRequest, formatted: &str) {
    let mods = resolved.qualifiers.modifier_string(resolved.descriptor.precise);
    let label = if mods.is_empty() {
        resolved.label.clone()
    } else {
        format!("{}:{mods}", resolved.label)
    };
    if let Some(table) = tables.iter_mut().find(|t| t.pmu == resolved.pmu) {
        table.record_emitted(formatted, &label);
    }
}

/// Rewrite `pmu/NAME[,attrs]/flags` when NAME is a symbolic event.
fn rewrite_pmu_term(
    session: &mut Session,
    tables: &[EventTable],
    token: &str,
) -> Option<String> {
    // A legacy-only perf cannot parse dynamic syntax at all; leave the
    // term for perf to reject rather than emit more of it.
    if session.capability.direct {
        return None;
    }
    let first_slash = token.find('/')?;
    let last_slash = token.rfind('/')?;
    if first_slash == last_slash {
        return None;
    }
    let pmu = &token[..first_slash];
    let body = &token[first_slash + 1..last_slash];
    let flags = &token[last_slash + 1..];
    if pmu.is_empty() || !pmu.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return None;
    }

    let (name, rest) = match body.find(',') {
        Some(pos) => (&body[..pos], &body[pos + 1..]),
        None => (body, ""),
    };
    let resolved = match resolve::resolve(session, tables, &name.to_lowercase()) {
        Ok(Resolution::Core(r)) => r,
        _ => return None,
    };
    let mut merged = resolved;
    merged.pmu = pmu.into();
    let extra = qualifiers::parse_tail(rest).set.merge(&qualifiers::parse_tail(flags).set);
    merged.qualifiers = merged.qualifiers.merge(&extra);
    format::format_resolved(session, &merged, Mode::Dynamic).ok()
}

/// `rXXXX` with at least four hex digits, like perf's raw event syntax.
fn parse_raw_token(token: &str) -> Option<u64> {
    let hex = token.strip_prefix('r')?;
    if hex.len() < 4 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    u64::from_str_radix(hex, 16).ok()
}

/// Split on commas outside `pmu/.../` bodies. Braces stay attached to
/// their tokens.
fn split_top_level(spec: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_body = false;
    for c in spec.chars() {
        match c {
            '/' => {
                in_body = !in_body;
                current.push(c);
            }
            ',' if !in_body => {
                tokens.push(std::mem::take(&mut current));
            }
            _ => current.push(c),
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
}

/// Translate raw encodings and dynamic-syntax terms in profiler output back
/// to the symbolic names the caller typed. Used to post-process `stat` and
/// `report` output from perf versions without `name=` label support.
pub fn translate_output_line(tables: &[EventTable], line: &str) -> String {
    let (Ok(raw_re), Ok(dyn_re)) = (
        regex::Regex::new(r"[rR]aw 0x([0-9a-f]{4,})|\br([0-9a-f]{4,})\b"),
        regex::Regex::new(r"[a-z][a-z0-9_]*/[^/]*/\S*"),
    ) else {
        return line.to_string();
    };
    let line = raw_re.replace_all(line, |caps: &regex::Captures<'_>| {
        let hex = caps.get(1).or_else(|| caps.get(2)).map_or("", |m| m.as_str());
        let val = u64::from_str_radix(hex, 16).unwrap_or(0);
        tables
            .iter()
            .find_map(|t| t.label_for_raw(val))
            .map_or_else(|| caps[0].to_string(), ToString::to_string)
    });
    dyn_re
        .replace_all(&line, |caps: &regex::Captures<'_>| {
            tables
                .iter()
                .find_map(|t| t.label_for_emitted(&caps[0]))
                .map_or_else(|| caps[0].to_string(), ToString::to_string)
        })
        .into_owned()
}

/// Peel grouping markers off a token, to be reattached verbatim.
fn strip_groups(token: &str) -> (&'static str, &str, &'static str) {
    let (open, token) = match token.strip_prefix('{') {
        Some(rest) => ("{", rest),
        None => ("", token),
    };
    let (token, close) = match token.strip_suffix('}') {
        Some(rest) => (rest, "}"),
        None => (token, ""),
    };
    (open, token, close)
}
