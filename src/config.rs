//! # Configuration
//!
//! Environment-driven settings for the fuzzer core. Every knob can be set
//! through a `FUZZER_`-prefixed environment variable (e.g.
//! `FUZZER_MAX_CONCURRENT_SESSIONS=4`); unset variables fall back to the
//! defaults below. The binary's CLI overrides a handful of them per run.
//!
//! The library never reads the environment on its own: `Settings` is built
//! once at startup and handed to the services that need it.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;

/// Core fuzzer settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    // Paths
    pub plugins_dir: PathBuf,
    pub corpus_dir: PathBuf,
    pub crash_dir: PathBuf,
    pub log_dir: PathBuf,

    // Fuzzing engine
    pub max_concurrent_tests: usize,
    pub max_concurrent_sessions: usize,
    /// Default per-test timeout when the session does not override it.
    pub default_timeout_ms: u64,
    /// Cap on bytes read per response.
    pub max_response_bytes: usize,
    pub tcp_buffer_size: usize,

    // Mutation strategy
    pub mutation_mode: String,
    /// Percentage routed to structure-aware mutation in hybrid mode (0-100).
    pub structure_aware_weight: u32,
    /// Fall back to byte-level mutation when a seed fails to parse.
    pub fallback_on_parse_error: bool,

    // Agent settings
    pub agent_heartbeat_interval: u64,
    pub agent_timeout_sec: u64,
    pub agent_queue_size: usize,

    // Stateful fuzzing
    pub stateful_reset_interval_bfs: u64,
    pub stateful_reset_interval_dfs: u64,
    pub stateful_reset_interval_targeted: u64,
    pub stateful_reset_interval_random: u64,
    /// Iterations before a reset boundary inside which termination tests
    /// are injected.
    pub termination_test_window: u64,
    pub termination_test_interval: u64,

    // Persistence
    pub checkpoint_frequency: u64,

    // Connection management
    pub max_reconnects: u32,
    pub reconnect_backoff_ms: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            plugins_dir: PathBuf::from("plugins"),
            corpus_dir: PathBuf::from("corpus"),
            crash_dir: PathBuf::from("crashes"),
            log_dir: PathBuf::from("logs"),
            max_concurrent_tests: 10,
            max_concurrent_sessions: 8,
            default_timeout_ms: 5_000,
            max_response_bytes: 1024 * 1024,
            tcp_buffer_size: 8192,
            mutation_mode: "hybrid".to_string(),
            structure_aware_weight: 70,
            fallback_on_parse_error: true,
            agent_heartbeat_interval: 30,
            agent_timeout_sec: 60,
            agent_queue_size: 1024,
            stateful_reset_interval_bfs: 25,
            stateful_reset_interval_dfs: 50,
            stateful_reset_interval_targeted: 75,
            stateful_reset_interval_random: 100,
            termination_test_window: 2,
            termination_test_interval: 50,
            checkpoint_frequency: 100,
            max_reconnects: 5,
            reconnect_backoff_ms: 500,
        }
    }
}

impl Settings {
    /// Build settings from `FUZZER_*` environment variables, falling back
    /// to defaults for anything unset or unparseable.
    pub fn from_env() -> Self {
        let mut s = Self::default();

        if let Some(v) = env_var("PLUGINS_DIR") {
            s.plugins_dir = PathBuf::from(v);
        }
        if let Some(v) = env_var("CORPUS_DIR") {
            s.corpus_dir = PathBuf::from(v);
        }
        if let Some(v) = env_var("CRASH_DIR") {
            s.crash_dir = PathBuf::from(v);
        }
        if let Some(v) = env_var("LOG_DIR") {
            s.log_dir = PathBuf::from(v);
        }

        read_into(&mut s.max_concurrent_tests, "MAX_CONCURRENT_TESTS");
        read_into(&mut s.max_concurrent_sessions, "MAX_CONCURRENT_SESSIONS");
        read_into(&mut s.default_timeout_ms, "DEFAULT_TIMEOUT_MS");
        read_into(&mut s.max_response_bytes, "MAX_RESPONSE_BYTES");
        read_into(&mut s.tcp_buffer_size, "TCP_BUFFER_SIZE");

        if let Some(v) = env_var("MUTATION_MODE") {
            s.mutation_mode = v;
        }
        read_into(&mut s.structure_aware_weight, "STRUCTURE_AWARE_WEIGHT");
        read_into(&mut s.fallback_on_parse_error, "FALLBACK_ON_PARSE_ERROR");

        read_into(&mut s.agent_heartbeat_interval, "AGENT_HEARTBEAT_INTERVAL");
        read_into(&mut s.agent_timeout_sec, "AGENT_TIMEOUT_SEC");
        read_into(&mut s.agent_queue_size, "AGENT_QUEUE_SIZE");

        read_into(&mut s.stateful_reset_interval_bfs, "STATEFUL_RESET_INTERVAL_BFS");
        read_into(&mut s.stateful_reset_interval_dfs, "STATEFUL_RESET_INTERVAL_DFS");
        read_into(
            &mut s.stateful_reset_interval_targeted,
            "STATEFUL_RESET_INTERVAL_TARGETED",
        );
        read_into(
            &mut s.stateful_reset_interval_random,
            "STATEFUL_RESET_INTERVAL_RANDOM",
        );
        read_into(&mut s.termination_test_window, "TERMINATION_TEST_WINDOW");
        read_into(&mut s.termination_test_interval, "TERMINATION_TEST_INTERVAL");

        read_into(&mut s.checkpoint_frequency, "CHECKPOINT_FREQUENCY");
        read_into(&mut s.max_reconnects, "MAX_RECONNECTS");
        read_into(&mut s.reconnect_backoff_ms, "RECONNECT_BACKOFF_MS");

        s
    }

    /// Reset interval for a fuzzing mode when the session does not override.
    pub fn reset_interval_for_mode(&self, mode: &str) -> u64 {
        match mode {
            "breadth_first" => self.stateful_reset_interval_bfs,
            "depth_first" => self.stateful_reset_interval_dfs,
            "targeted" => self.stateful_reset_interval_targeted,
            _ => self.stateful_reset_interval_random,
        }
    }
}

const ENV_PREFIX: &str = "FUZZER_";

fn env_var(name: &str) -> Option<String> {
    std::env::var(format!("{ENV_PREFIX}{name}")).ok()
}

fn read_into<T: FromStr>(slot: &mut T, name: &str) {
    if let Some(raw) = env_var(name) {
        if let Ok(parsed) = raw.parse::<T>() {
            *slot = parsed;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let s = Settings::default();
        assert_eq!(s.mutation_mode, "hybrid");
        assert_eq!(s.structure_aware_weight, 70);
        assert!(s.fallback_on_parse_error);
        assert!(s.stateful_reset_interval_bfs < s.stateful_reset_interval_dfs);
        assert!(s.stateful_reset_interval_dfs < s.stateful_reset_interval_targeted);
        assert!(s.stateful_reset_interval_targeted <= s.stateful_reset_interval_random);
    }

    #[test]
    fn mode_reset_intervals() {
        let s = Settings::default();
        assert_eq!(s.reset_interval_for_mode("breadth_first"), 25);
        assert_eq!(s.reset_interval_for_mode("random"), 100);
        assert_eq!(s.reset_interval_for_mode("anything-else"), 100);
    }
}
