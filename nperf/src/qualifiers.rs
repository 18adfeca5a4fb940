//! Qualifier grammars and the merge algorithm.
//!
//! A request like `MEM_LOAD_RETIRED.L3_MISS:pp:k` carries a qualifier tail
//! after the first colon. Two grammars apply, tried in a fixed order that is
//! preserved for compatibility with the perf wrapper this replaces:
//!
//! 1. valued qualifiers: `name=NUMBER` (hex or decimal) and the `cN` counter
//!    mask shorthand;
//! 2. flag qualifiers: precision (`p`/`pp`/`ppp`/`P`), encoding bits
//!    (`e`, `i`, `amt1`/`any`) and execution-mode letters (`u`, `k`, `h`,
//!    `H`, `G`);
//! 3. any single leftover letter is passed through to perf verbatim.
//!
//! Anything longer that matches neither grammar is reported back to the
//! caller, never silently dropped.

use std::collections::{BTreeMap, BTreeSet};

use crate::domain::PreciseLevel;

/// Execution-mode and pass-through letters perf understands directly.
const MODE_LETTERS: &[char] = &['u', 'k', 'h', 'H', 'G'];

/// A merged, order-independent set of qualifiers.
///
/// Merging is idempotent and commutative across distinct qualifier names;
/// the ordered containers keep formatting deterministic.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QualifierSet {
    /// Number of explicit `p` modifiers (0..=3).
    pub precise: u8,
    /// `P` was given: collapse to the event's own precision ceiling.
    pub max_precise: bool,
    pub edge: bool,
    pub invert: bool,
    pub any_thread: bool,
    pub cmask: Option<u8>,
    /// Pass-through perf modifier letters.
    pub letters: BTreeSet<char>,
    /// Named attributes (`ldlat=64`, `offcore_rsp=0x10001`, ...).
    pub valued: BTreeMap<String, u64>,
}

impl QualifierSet {
    pub fn is_empty(&self) -> bool {
        *self == QualifierSet::default()
    }

    /// Merge `other` on top of `self`. Caller-supplied qualifiers are passed
    /// as `other` so they widen or override intrinsic ones.
    #[must_use]
    pub fn merge(&self, other: &QualifierSet) -> QualifierSet {
        let mut m = self.clone();
        m.precise = m.precise.max(other.precise);
        m.max_precise |= other.max_precise;
        m.edge |= other.edge;
        m.invert |= other.invert;
        m.any_thread |= other.any_thread;
        if other.cmask.is_some() {
            m.cmask = other.cmask;
        }
        m.letters.extend(other.letters.iter().copied());
        for (name, value) in &other.valued {
            m.valued.insert(name.clone(), *value);
        }
        m
    }

    /// Effective precision for an event supporting `level`: `P` collapses to
    /// the event's ceiling instead of exceeding what it supports.
    pub fn effective_precise(&self, level: PreciseLevel) -> u8 {
        if self.max_precise {
            self.precise.max(level.ceiling())
        } else {
            self.precise
        }
    }

    /// perf modifier suffix (`ppk`, `u`, ...) for an event at `level`.
    pub fn modifier_string(&self, level: PreciseLevel) -> String {
        let mut s = String::new();
        for _ in 0..self.effective_precise(level) {
            s.push('p');
        }
        for l in &self.letters {
            s.push(*l);
        }
        s
    }
}

/// Outcome of scanning a qualifier tail.
#[derive(Debug, Default)]
pub struct ParsedQualifiers {
    pub set: QualifierSet,
    /// Tokens that matched neither grammar, verbatim.
    pub leftover: Vec<String>,
}

/// Split a request into base name and qualifier tail at the first colon.
pub fn split_request(request: &str) -> (&str, &str) {
    match request.find(':') {
        Some(pos) => (&request[..pos], &request[pos + 1..]),
        None => (request, ""),
    }
}

/// Scan a qualifier tail. Trial order (valued, then flags, then single
/// leftover letters) is part of the compatibility contract.
pub fn parse_tail(tail: &str) -> ParsedQualifiers {
    let mut out = ParsedQualifiers::default();
    let mut rest = tail;

    while !rest.is_empty() {
        if let Some(stripped) = rest.strip_prefix(':') {
            rest = stripped;
            continue;
        }
        if let Some(n) = match_valued(rest, &mut out.set) {
            rest = &rest[n..];
            continue;
        }
        if let Some(n) = match_flag(rest, &mut out.set) {
            rest = &rest[n..];
            continue;
        }
        // Unrecognized: consume up to the next separator.
        let end = rest.find(':').unwrap_or(rest.len());
        let token = &rest[..end];
        let mut chars = token.chars();
        match (chars.next(), chars.next()) {
            (Some(c), None) if c.is_ascii_alphabetic() => {
                // single leftover character: short perf flag letter
                out.set.letters.insert(c);
            }
            _ => out.leftover.push(token.to_string()),
        }
        rest = &rest[end..];
    }
    out
}

/// Grammar (1): `name=NUMBER` and the `cN` shorthand.
fn match_valued(s: &str, set: &mut QualifierSet) -> Option<usize> {
    // name=NUMBER
    let ident_len = s.chars().take_while(|c| c.is_ascii_alphanumeric() || *c == '_').count();
    if ident_len > 0 && s[ident_len..].starts_with('=') {
        let (value, value_len) = parse_number(&s[ident_len + 1..])?;
        let name = &s[..ident_len];
        if name == "cmask" {
            // An 8-bit field; out-of-range values are rejected so the token
            // surfaces as a leftover, not silently truncated.
            set.cmask = Some(u8::try_from(value).ok()?);
        } else {
            set.valued.insert(name.to_string(), value);
        }
        return Some(ident_len + 1 + value_len);
    }
    // cN counter-mask shorthand
    if let Some(digits) = s.strip_prefix('c') {
        let n = digits.chars().take_while(char::is_ascii_digit).count();
        if n > 0 {
            set.cmask = Some(digits[..n].parse().ok()?);
            return Some(1 + n);
        }
    }
    None
}

/// Grammar (2): flag tokens, longest match first.
fn match_flag(s: &str, set: &mut QualifierSet) -> Option<usize> {
    for (token, len) in [("amt1", 4), ("any", 3)] {
        if s.starts_with(token) {
            set.any_thread = true;
            return Some(len);
        }
    }
    for (token, count) in [("ppp", 3u8), ("pp", 2), ("p", 1)] {
        if s.starts_with(token) {
            set.precise = set.precise.max(count);
            return Some(token.len());
        }
    }
    let c = s.chars().next()?;
    match c {
        'P' => set.max_precise = true,
        'e' => set.edge = true,
        'i' => set.invert = true,
        _ if MODE_LETTERS.contains(&c) => {
            set.letters.insert(c);
        }
        _ => return None,
    }
    Some(1)
}

fn parse_number(s: &str) -> Option<(u64, usize)> {
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        let n = hex.chars().take_while(char::is_ascii_hexdigit).count();
        if n == 0 {
            return None;
        }
        Some((u64::from_str_radix(&hex[..n], 16).ok()?, 2 + n))
    } else {
        let n = s.chars().take_while(char::is_ascii_digit).count();
        if n == 0 {
            return None;
        }
        Some((s[..n].parse().ok()?, n))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_request() {
        assert_eq!(split_request("inst_retired.any:pp"), ("inst_retired.any", "pp"));
        assert_eq!(split_request("cycles"), ("cycles", ""));
    }

    #[test]
    fn test_parse_flags_and_letters() {
        let parsed = parse_tail("ppk");
        assert_eq!(parsed.set.precise, 2);
        assert!(parsed.set.letters.contains(&'k'));
        assert!(parsed.leftover.is_empty());
    }

    #[test]
    fn test_parse_valued() {
        let parsed = parse_tail("ldlat=64:cmask=3");
        assert_eq!(parsed.set.valued.get("ldlat"), Some(&64));
        assert_eq!(parsed.set.cmask, Some(3));
    }

    #[test]
    fn test_cmask_shorthand() {
        let parsed = parse_tail("c2");
        assert_eq!(parsed.set.cmask, Some(2));
    }

    #[test]
    fn test_cmask_out_of_range_rejected() {
        let parsed = parse_tail("cmask=0x1ff");
        assert_eq!(parsed.set.cmask, None);
        assert_eq!(parsed.leftover, vec!["cmask=0x1ff".to_string()]);
    }

    #[test]
    fn test_hex_value() {
        let parsed = parse_tail("offcore_rsp=0x10001");
        assert_eq!(parsed.set.valued.get("offcore_rsp"), Some(&0x10001));
    }

    #[test]
    fn test_leftover_token_reported() {
        let parsed = parse_tail("pp:bogustoken");
        assert_eq!(parsed.set.precise, 2);
        assert_eq!(parsed.leftover, vec!["bogustoken".to_string()]);
    }

    #[test]
    fn test_single_leftover_letter_passes_through() {
        let parsed = parse_tail("S");
        assert!(parsed.set.letters.contains(&'S'));
        assert!(parsed.leftover.is_empty());
    }

    #[test]
    fn test_merge_idempotent() {
        let a = parse_tail("pp:u").set;
        assert_eq!(a.merge(&a), a);
    }

    #[test]
    fn test_merge_commutative() {
        let a = parse_tail("u:cmask=1").set;
        let b = parse_tail("k:e").set;
        assert_eq!(a.merge(&b), b.merge(&a));
    }

    #[test]
    fn test_precision_collapse() {
        let set = parse_tail("P").set;
        assert_eq!(set.effective_precise(crate::domain::PreciseLevel::Multi), 2);
        assert_eq!(set.effective_precise(crate::domain::PreciseLevel::Single), 1);
        assert_eq!(set.effective_precise(crate::domain::PreciseLevel::None), 0);
    }

    #[test]
    fn test_precision_absorbs_lower() {
        let a = parse_tail("p").set;
        let b = parse_tail("ppp").set;
        assert_eq!(a.merge(&b).precise, 3);
    }

    #[test]
    fn test_caller_overrides_intrinsic_value() {
        let intrinsic = parse_tail("ldlat=4").set;
        let caller = parse_tail("ldlat=128").set;
        assert_eq!(intrinsic.merge(&caller).valued.get("ldlat"), Some(&128));
    }

    #[test]
    fn test_amt1_any_thread() {
        assert!(parse_tail("amt1").set.any_thread);
        assert!(parse_tail("any").set.any_thread);
    }
}
