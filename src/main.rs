//! # Protofuzz - Main Entry Point
//!
//! The binary wires the owned services together and drives one session:
//!
//! 1. **Initialize logging**: colorized stdout plus a rolling log file
//! 2. **Load settings**: `FUZZER_*` environment variables and CLI flags
//! 3. **Open stores**: the session and execution-history databases
//! 4. **Load the plugin**: a declarative JSON bundle, validated up front
//! 5. **Run**: create a session, start it, wait for completion or Ctrl-C
//! 6. **Report**: final totals and coverage to stdout
//!
//! The richer control plane (HTTP API, UI) lives outside this crate and
//! talks to the same [`SessionManager`] surface.

use anyhow::{Context, Result};
use clap::Parser;
use protofuzz::session::{FuzzingMode, SessionConfig, SessionStatus};
use protofuzz::{HistoryStore, PluginBundle, SessionManager, Settings};
use tracing::{error, info};

mod cli;
mod logging;

use cli::Args;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let settings = Settings::from_env();

    // The guard must outlive the program for the non-blocking file writer.
    let guard = logging::init(args.verbose, args.log_file.as_deref(), &settings.log_dir);

    info!("protofuzz {} starting", protofuzz::VERSION);

    let session_store = protofuzz::session::store::SessionStore::open(
        &settings.log_dir.join("sessions.db"),
    )?;
    let history = HistoryStore::open(&settings.log_dir.join("history.db"))?;
    let manager = SessionManager::new(settings.clone(), session_store, history);

    let paused = manager.startup().await?;
    if paused > 0 {
        info!("paused {paused} sessions orphaned by a previous run");
    }

    let bundle = PluginBundle::from_file(&args.plugin)
        .with_context(|| format!("loading plugin {}", args.plugin.display()))?;
    let transport = bundle.transport;
    let protocol = bundle.name.clone();
    manager.register_plugin(bundle);

    let mut config = SessionConfig::new(&protocol, &args.host, args.port, transport);
    config.timeout_ms = args.timeout_ms;
    config.max_iterations = args.iterations;
    config.rate_limit_per_second = args.rate_limit;
    config.mutation_mode = args.mutation_mode.clone();
    config.target_state = args.target_state.clone();
    config.enable_termination_fuzzing = args.termination_fuzzing;
    if let Some(mode) = args.fuzzing_mode.as_deref() {
        config.fuzzing_mode = match mode {
            "breadth_first" => FuzzingMode::BreadthFirst,
            "depth_first" => FuzzingMode::DepthFirst,
            "targeted" => FuzzingMode::Targeted,
            _ => FuzzingMode::Random,
        };
    }

    let session = manager.create_session(config).await?;
    let session_id = session.id.clone();
    info!("session {session_id} fuzzing {protocol} at {}:{}", args.host, args.port);

    if let Err(err) = manager.start_session(&session_id).await {
        error!("failed to start session: {err}");
        return Err(err.into());
    }

    // Run until the session completes on its own or the operator stops it.
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupt received, stopping session");
                let _ = manager.stop_session(&session_id).await;
                break;
            }
            _ = tokio::time::sleep(std::time::Duration::from_millis(500)) => {
                let session = manager.get_session(&session_id).await?;
                if session.status != SessionStatus::Running {
                    if manager.stop_session(&session_id).await.is_ok() {
                        info!("session left running state, cleaned up");
                    }
                    break;
                }
            }
        }
    }

    let stats = manager.session_stats(&session_id).await?;
    info!("final stats: {}", serde_json::to_string_pretty(&stats)?);

    manager.shutdown().await;
    drop(guard);
    Ok(())
}
