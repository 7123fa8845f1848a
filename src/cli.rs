//! # Command-Line Interface
//!
//! Thin argument surface for the fuzzer binary: which plugin to load,
//! which target to drive, and a handful of per-run overrides. Everything
//! else comes from `FUZZER_*` environment settings; the HTTP control
//! plane (out of tree) owns the richer session management surface.

use clap::Parser;
use std::path::PathBuf;

/// Protofuzz - a stateful network protocol fuzzing engine
///
/// Loads a declarative protocol plugin, creates one fuzzing session
/// against the given target, and runs it until the iteration cap is
/// reached or the process is interrupted.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Path to the protocol plugin bundle (JSON)
    #[arg(short, long)]
    pub plugin: PathBuf,

    /// Target host to fuzz
    #[arg(long, default_value = "127.0.0.1")]
    pub host: String,

    /// Target port to fuzz
    #[arg(long)]
    pub port: u16,

    /// Stop after this many iterations (unbounded when omitted)
    #[arg(short, long)]
    pub iterations: Option<u64>,

    /// Per-test timeout in milliseconds
    #[arg(long, default_value_t = 5000)]
    pub timeout_ms: u64,

    /// Upper bound on test cases per second
    #[arg(long)]
    pub rate_limit: Option<u32>,

    /// Mutation mode: byte_level, structure_aware, or hybrid
    #[arg(long)]
    pub mutation_mode: Option<String>,

    /// Stateful fuzzing mode: breadth_first, depth_first, targeted, random
    #[arg(long)]
    pub fuzzing_mode: Option<String>,

    /// Target state for the `targeted` fuzzing mode
    #[arg(long)]
    pub target_state: Option<String>,

    /// Exercise termination paths near reset boundaries
    #[arg(long)]
    pub termination_fuzzing: bool,

    /// Detailed log destination: a file path, or "stderr"
    #[arg(long)]
    pub log_file: Option<String>,

    /// Increase logging verbosity (-v: debug, -vv: trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}
