//! Declarative event-list artifacts: serde models, the on-disk cache and
//! the on-demand download.
//!
//! Artifacts are JSON arrays of rows. Three kinds exist per CPU model:
//! the core event list, the offcore request/response matrix and the uncore
//! event list. They live in a cache directory (`$XDG_CACHE_HOME/pmu-events`)
//! keyed by the CPU identifier string, and are fetched from the event
//! server on a cache miss. `EVENTMAP`, `OFFCORE` and `UNCORE` override the
//! respective artifact with a literal path or a pattern resolved against
//! the cache.

use std::io::Read;
use std::path::{Path, PathBuf};

use log::{info, warn};
use serde::Deserialize;

use crate::domain::TableError;
use crate::session::Session;

const URL_BASE: &str = "https://download.01.org/perfmon";
const MAPFILE: &str = "mapfile.csv";
const NUM_TRIES: u32 = 3;

/// One row of the core event list.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CoreEventRow {
    #[serde(rename = "EventName", default)]
    pub name: String,
    #[serde(rename = "EventCode")]
    pub code: Option<String>,
    #[serde(rename = "UMask")]
    pub umask: Option<String>,
    #[serde(rename = "CounterMask")]
    pub cmask: Option<String>,
    #[serde(rename = "Invert")]
    pub invert: Option<String>,
    #[serde(rename = "AnyThread")]
    pub any_thread: Option<String>,
    #[serde(rename = "EdgeDetect")]
    pub edge: Option<String>,
    #[serde(rename = "MSRIndex")]
    pub msr_index: Option<String>,
    #[serde(rename = "MSRValue")]
    pub msr_value: Option<String>,
    #[serde(rename = "SampleAfterValue")]
    pub sample_after: Option<String>,
    #[serde(rename = "PEBS")]
    pub pebs: Option<String>,
    #[serde(rename = "Errata")]
    pub errata: Option<String>,
    #[serde(rename = "Counter")]
    pub counter: Option<String>,
    #[serde(rename = "BriefDescription")]
    pub desc: Option<String>,
}

/// One row of the offcore matrix: a request or response reason.
#[derive(Debug, Clone, Deserialize)]
pub struct MatrixRow {
    #[serde(rename = "Type")]
    pub kind: String,
    #[serde(rename = "Name")]
    pub name: String,
    /// Bit position within the request (low) or response (high) half.
    #[serde(rename = "Offset")]
    pub offset: String,
    #[serde(rename = "Description", default)]
    pub desc: Option<String>,
}

/// One row of the uncore event list.
#[derive(Debug, Clone, Deserialize)]
pub struct UncoreEventRow {
    #[serde(rename = "Unit")]
    pub unit: String,
    #[serde(rename = "EventName", default)]
    pub name: String,
    #[serde(rename = "EventCode")]
    pub code: Option<String>,
    #[serde(rename = "UMask")]
    pub umask: Option<String>,
    #[serde(rename = "CounterMask")]
    pub cmask: Option<String>,
    #[serde(rename = "EdgeDetect")]
    pub edge: Option<String>,
    #[serde(rename = "Invert")]
    pub invert: Option<String>,
    #[serde(rename = "BriefDescription")]
    pub desc: Option<String>,
}

/// Parse a hex field of a row (`"0x1A6"`, possibly a comma list of which
/// only the first entry counts).
pub fn parse_hex(field: &str) -> Option<u64> {
    let first = field.split(',').next()?.trim();
    let digits = first.strip_prefix("0x").or_else(|| first.strip_prefix("0X")).unwrap_or(first);
    if digits.is_empty() {
        return None;
    }
    u64::from_str_radix(digits, 16).ok()
}

pub fn load_rows<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Vec<T>, TableError> {
    let data = std::fs::read_to_string(path)?;
    serde_json::from_str(&data)
        .map_err(|source| TableError::Parse { path: path.display().to_string(), source })
}

/// `GenuineIntel-<family>-<model hex>` identifier for the running CPU.
pub fn cpu_string() -> Result<String, TableError> {
    cpu_string_from(Path::new("/proc/cpuinfo"))
}

pub fn cpu_string_from(path: &Path) -> Result<String, TableError> {
    let cpuinfo = std::fs::read_to_string(path)
        .map_err(|e| TableError::Cpu(format!("cannot read {}: {e}", path.display())))?;
    let mut vendor = None;
    let mut family = None;
    let mut model = None;
    for line in cpuinfo.lines() {
        let mut parts = line.splitn(2, ':');
        let key = parts.next().unwrap_or("").trim();
        let value = parts.next().unwrap_or("").trim();
        match key {
            "vendor_id" => vendor = Some(value.to_string()),
            "cpu family" => family = value.parse::<u32>().ok(),
            "model" => model = value.parse::<u32>().ok(),
            _ => {}
        }
        if vendor.is_some() && family.is_some() && model.is_some() {
            break;
        }
    }
    match (vendor, family, model) {
        (Some(v), Some(f), Some(m)) => Ok(format!("{v}-{f}-{m:X}")),
        _ => Err(TableError::Cpu("missing vendor/family/model in cpuinfo".to_string())),
    }
}

/// `$XDG_CACHE_HOME/pmu-events`, falling back to `~/.cache/pmu-events`.
pub fn default_cache_dir() -> PathBuf {
    let base = std::env::var_os("XDG_CACHE_HOME").map_or_else(
        || {
            let home = std::env::var_os("HOME").unwrap_or_default();
            PathBuf::from(home).join(".cache")
        },
        PathBuf::from,
    );
    base.join("pmu-events")
}

/// Minimal glob match supporting `*`, `?` and `[...]` classes, enough for
/// the CPU identifier patterns the mapfile and the env overrides use.
pub fn glob_match(pattern: &str, name: &str) -> bool {
    fn inner(pat: &[u8], name: &[u8]) -> bool {
        match pat.split_first() {
            None => name.is_empty(),
            Some((b'*', rest)) => {
                (0..=name.len()).any(|skip| inner(rest, &name[skip..]))
            }
            Some((b'?', rest)) => {
                !name.is_empty() && inner(rest, &name[1..])
            }
            Some((b'[', rest)) => {
                let Some(close) = rest.iter().position(|&c| c == b']') else {
                    return false;
                };
                let (class, after) = (&rest[..close], &rest[close + 1..]);
                let Some((&first, tail)) = name.split_first() else {
                    return false;
                };
                class_matches(class, first) && inner(after, tail)
            }
            Some((&c, rest)) => {
                name.first() == Some(&c) && inner(rest, &name[1..])
            }
        }
    }
    fn class_matches(class: &[u8], c: u8) -> bool {
        let (negated, class) = match class.split_first() {
            Some((b'!' | b'^', rest)) => (true, rest),
            _ => (false, class),
        };
        let mut hit = false;
        let mut i = 0;
        while i < class.len() {
            if i + 2 < class.len() && class[i + 1] == b'-' {
                if class[i] <= c && c <= class[i + 2] {
                    hit = true;
                }
                i += 3;
            } else {
                if class[i] == c {
                    hit = true;
                }
                i += 1;
            }
        }
        hit != negated
    }
    inner(pattern.as_bytes(), name.as_bytes())
}

/// Resolve a literal path or a glob pattern against the cache directory.
fn find_cached(cache_dir: &Path, pattern: &str) -> Option<PathBuf> {
    let literal = Path::new(pattern);
    if literal.is_file() {
        return Some(literal.to_path_buf());
    }
    let mut matches: Vec<PathBuf> = std::fs::read_dir(cache_dir)
        .ok()?
        .flatten()
        .filter(|e| glob_match(pattern, &e.file_name().to_string_lossy()))
        .map(|e| e.path())
        .collect();
    matches.sort();
    matches.into_iter().next()
}

/// Locate an artifact of `kind` for `cpu`: env override first (literal path
/// or cache pattern), then the cache by exact name, then by pattern.
pub fn locate(session: &mut Session, env_var: &str, cpu: &str, kind: &str) -> Option<PathBuf> {
    if let Ok(over) = std::env::var(env_var) {
        return find_cached(&session.cache_dir, &over);
    }
    let exact = session.cache_dir.join(format!("{cpu}-{kind}.json"));
    if session.path_exists(&exact) {
        return Some(exact);
    }
    find_cached(&session.cache_dir, &format!("{cpu}-{kind}.json"))
}

/// Locate the core event list, downloading it on a cache miss.
pub fn locate_core(session: &mut Session, cpu: &str, kind: &str) -> Result<PathBuf, TableError> {
    if let Some(path) = locate(session, "EVENTMAP", cpu, kind) {
        return Ok(path);
    }
    match download(&session.cache_dir, cpu) {
        Ok(0) => {}
        Ok(n) => info!("downloaded {n} event list(s) for {cpu}"),
        Err(e) => warn!("{e}"),
    }
    // Bypass the (stale) existence cache after a download.
    find_cached(&session.cache_dir, &format!("{cpu}-{kind}.json")).ok_or_else(|| {
        TableError::NotFound { cpu: cpu.to_string(), cache: session.cache_dir.display().to_string() }
    })
}

/// Download every artifact whose mapfile row matches `cpu`. Returns how many
/// files were fetched.
pub fn download(cache_dir: &Path, cpu: &str) -> Result<usize, TableError> {
    std::fs::create_dir_all(cache_dir)?;
    let mapfile = fetch(&format!("{URL_BASE}/{MAPFILE}"))?;
    std::fs::write(cache_dir.join(MAPFILE), &mapfile)?;

    let entries = mapfile_entries(&String::from_utf8_lossy(&mapfile), cpu);
    for (name, file) in &entries {
        let data = fetch(&format!("{URL_BASE}{name}"))?;
        std::fs::write(cache_dir.join(file), data)?;
        info!("downloaded {file}");
    }
    Ok(entries.len())
}

/// Mapfile rows matching `cpu`: (remote file name, cache file name). Cache
/// files are keyed by the requested CPU string, not the row's glob pattern,
/// so the lookup that triggered the download can find them.
fn mapfile_entries(mapfile: &str, cpu: &str) -> Vec<(String, String)> {
    let mut entries = Vec::new();
    for line in mapfile.lines() {
        let fields: Vec<&str> = line.trim_end().split(',').collect();
        if fields.len() < 4 {
            if !line.trim().is_empty() {
                warn!("cannot parse mapfile row: {line}");
            }
            continue;
        }
        let (pattern, _version, name, kind) = (fields[0], fields[1], fields[2], fields[3]);
        if kind.starts_with("EventType") || !glob_match(pattern, cpu) {
            continue;
        }
        entries.push((name.to_string(), format!("{cpu}-{kind}.json")));
    }
    entries
}

fn fetch(url: &str) -> Result<Vec<u8>, TableError> {
    let client = reqwest::blocking::Client::new();
    let mut last_err = String::new();
    for _ in 0..NUM_TRIES {
        match client.get(url).send().and_then(reqwest::blocking::Response::error_for_status) {
            Ok(mut resp) => {
                let mut body = Vec::new();
                if let Err(e) = resp.read_to_end(&mut body) {
                    last_err = e.to_string();
                    continue;
                }
                return Ok(body);
            }
            Err(e) => last_err = e.to_string(),
        }
    }
    Err(TableError::Download(format!("{url}: {last_err}")))
}
