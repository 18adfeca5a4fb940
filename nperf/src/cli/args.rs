//! CLI argument definitions

use clap::Parser;

#[derive(Parser)]
#[command(
    name = "nperf",
    about = "perf wrapper that resolves Intel symbolic event names",
    after_help = "\
EXAMPLES:
    nperf stat -e inst_retired.any,br_misp_retired.all ./workload
    nperf record -e mem_load_retired.l3_miss:pp -c default ./workload
    nperf --print stat -e offcore_response.dmnd_data_rd.llc_hit true
    nperf list

ENVIRONMENT:
    PERF        perf binary to wrap (default: perf)
    EVENTMAP    core event list override (path or cache pattern)
    OFFCORE     offcore matrix override
    UNCORE      uncore event list override
    DIRECT_MSR  force raw encodings and direct MSR programming"
)]
pub struct Args {
    /// Print the rewritten perf command line instead of executing it
    #[arg(long)]
    pub print: bool,

    /// Force raw rXXXX encodings even when perf supports the dynamic syntax
    #[arg(long)]
    pub raw: bool,

    /// Arguments passed through to perf; -e/--event lists are rewritten
    #[arg(
        value_name = "PERF_ARGS",
        trailing_var_arg = true,
        allow_hyphen_values = true
    )]
    pub perf_args: Vec<String>,
}
