//! # nperf - Main Entry Point
//!
//! Thin driver around the library: parse the command line, build a
//! [`Session`], load the event tables for this CPU, rewrite every `-e`
//! event list, then hand the rewritten command line to perf. Output from
//! perf versions without `name=` label support is translated back to the
//! symbolic names the caller typed.

use std::io::Write;
use std::process::{Command, Stdio};

use anyhow::{bail, Context, Result};
use clap::Parser;
use log::warn;

use nperf::cli::Args;
use nperf::domain::PmuName;
use nperf::events::{artifact, EventTable};
use nperf::rewrite::{self, Rewritten};
use nperf::session::Session;

// Exit codes
const EXIT_SUCCESS: i32 = 0;
const EXIT_ERROR: i32 = 1;
const EXIT_USAGE: i32 = 2;
const EXIT_NOPERM: i32 = 77;

fn main() {
    env_logger::init();
    std::process::exit(match run() {
        Ok(code) => code,
        Err(e) => {
            let code = exit_code_for(&e);
            eprintln!("error: {e:#}");
            code
        }
    });
}

fn exit_code_for(err: &anyhow::Error) -> i32 {
    let msg = err.to_string().to_lowercase();
    if msg.contains("permission denied") || msg.contains("requires root") {
        EXIT_NOPERM
    } else if msg.contains("specify the -e events") {
        EXIT_USAGE
    } else {
        EXIT_ERROR
    }
}

fn run() -> Result<i32> {
    let args = Args::parse();

    let mut session = Session::new();
    if args.raw {
        session.capability.direct = true;
        session.capability.has_name = false;
        session.capability.offcore = false;
        session.capability.ldlat = false;
    }

    let cpu = artifact::cpu_string().context("cannot identify CPU model")?;
    let mut tables = load_tables(&mut session, &cpu)?;

    let perf_args = rewrite_command_line(&mut session, &mut tables, &args)?;

    if args.print {
        println!("{} {}", session.perf, shell_join(&perf_args));
        return Ok(EXIT_SUCCESS);
    }

    let subcommand = perf_args.first().map(String::as_str).unwrap_or("");
    if subcommand == "list" {
        return run_list(&session, &tables, &perf_args);
    }

    // Old perf cannot label events, so stat/report output shows raw
    // encodings; capture it and map them back to symbolic names.
    let translate =
        !session.capability.has_name && matches!(subcommand, "stat" | "report");
    if translate {
        run_translated(&session, &tables, &perf_args)
    } else {
        run_passthrough(&session, &perf_args)
    }
}

/// Load one event table per core-type PMU. A missing table for one PMU of
/// a hybrid pair is survivable; no table at all is not.
fn load_tables(session: &mut Session, cpu: &str) -> Result<Vec<EventTable>> {
    let pmus = session.core_pmus();
    let mut tables = Vec::with_capacity(pmus.len());
    for pmu in pmus {
        match EventTable::load(session, cpu, PmuName::new(pmu)) {
            Ok(table) => tables.push(table),
            Err(e) => warn!("no event table for {pmu}: {e}"),
        }
    }
    if tables.is_empty() {
        bail!("no event table available for {cpu}");
    }
    Ok(tables)
}

/// Walk the perf argument list, rewriting every `-e`/`--event` list and
/// substituting `-c default` with the first rewritten event's recommended
/// overflow value. Everything else passes through verbatim.
fn rewrite_command_line(
    session: &mut Session,
    tables: &mut [EventTable],
    args: &Args,
) -> Result<Vec<String>> {
    let mut out = Vec::with_capacity(args.perf_args.len());
    let mut overflow: Option<String> = None;
    let mut iter = args.perf_args.iter().peekable();

    while let Some(arg) = iter.next() {
        if arg == "-e" || arg == "--event" {
            let Some(spec) = iter.next() else {
                out.push(arg.clone());
                continue;
            };
            let rewritten = rewrite_events(session, tables, spec, args.print)?;
            out.push(arg.clone());
            out.push(rewritten.events);
            if rewritten.overflow.is_some() {
                overflow = rewritten.overflow;
            }
        } else if let Some(spec) = arg.strip_prefix("-e").filter(|s| !s.is_empty()) {
            let rewritten = rewrite_events(session, tables, spec, args.print)?;
            out.push(format!("-e{}", rewritten.events));
            if rewritten.overflow.is_some() {
                overflow = rewritten.overflow;
            }
        } else if arg == "-c" && iter.peek().map(|s| s.as_str()) == Some("default") {
            iter.next();
            let Some(ref period) = overflow else {
                bail!("Specify the -e events before -c default or event has no overflow field");
            };
            out.push("-c".to_string());
            out.push(period.clone());
        } else {
            out.push(arg.clone());
        }
    }
    Ok(out)
}

fn rewrite_events(
    session: &mut Session,
    tables: &mut [EventTable],
    spec: &str,
    dry_run: bool,
) -> Result<Rewritten> {
    let rewritten = rewrite::rewrite_events(session, tables, spec, dry_run)
        .with_context(|| format!("cannot rewrite event list '{spec}'"))?;
    if rewritten.events.is_empty() {
        bail!("no usable event in '{spec}'");
    }
    Ok(rewritten)
}

/// `perf list` passthrough, followed by the symbolic events this CPU's
/// tables add on top of perf's generic ones.
fn run_list(session: &Session, tables: &[EventTable], perf_args: &[String]) -> Result<i32> {
    let status = Command::new(&session.perf)
        .args(perf_args)
        .status()
        .with_context(|| format!("cannot run {}", session.perf))?;
    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    for table in tables {
        writeln!(out, "\n{} events for {}:", table.pmu, table.cpu)?;
        table.dump_events(&mut out)?;
    }
    Ok(status.code().unwrap_or(EXIT_ERROR))
}

/// Run perf capturing its output, then map raw encodings and dynamic-syntax
/// terms back to the names the caller typed.
fn run_translated(session: &Session, tables: &[EventTable], perf_args: &[String]) -> Result<i32> {
    let output = Command::new(&session.perf)
        .args(perf_args)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .with_context(|| format!("cannot run {}", session.perf))?;

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    for line in String::from_utf8_lossy(&output.stdout).lines() {
        writeln!(out, "{}", rewrite::translate_output_line(tables, line))?;
    }
    let stderr = std::io::stderr();
    let mut err = stderr.lock();
    for line in String::from_utf8_lossy(&output.stderr).lines() {
        writeln!(err, "{}", rewrite::translate_output_line(tables, line))?;
    }
    Ok(output.status.code().unwrap_or(EXIT_ERROR))
}

fn run_passthrough(session: &Session, perf_args: &[String]) -> Result<i32> {
    let status = Command::new(&session.perf)
        .args(perf_args)
        .status()
        .with_context(|| format!("cannot run {}", session.perf))?;
    Ok(status.code().unwrap_or(EXIT_ERROR))
}

/// Join arguments the way a shell would need them typed, so `--print`
/// output can be pasted back into a terminal.
fn shell_join(args: &[String]) -> String {
    args.iter()
        .map(|arg| shell_quote(arg))
        .collect::<Vec<_>>()
        .join(" ")
}

fn shell_quote(arg: &str) -> String {
    let safe = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:,{}".contains(c));
    if safe {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}
