//! # Fuzzing Sessions
//!
//! A session is the unit of a fuzzing campaign: one protocol, one target,
//! one configuration, and the accumulated state/stats/coverage of the run.
//! Sessions are persisted as a JSON blob with a few indexed scalar columns
//! (see [`store`]) and must survive process restarts: a session found
//! `running` on disk at startup is flipped to `paused` with an explanatory
//! error, since its tasks did not survive the restart.

pub mod context;
pub mod store;

use crate::plugin::{ConnectionMode, TransportKind};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use uuid::Uuid;

/// Lifecycle status of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Idle,
    Running,
    Paused,
    Completed,
    Failed,
}

impl SessionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionStatus::Idle => "idle",
            SessionStatus::Running => "running",
            SessionStatus::Paused => "paused",
            SessionStatus::Completed => "completed",
            SessionStatus::Failed => "failed",
        }
    }
}

/// Classification of one test case's outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestCaseResult {
    Pass,
    Crash,
    Hang,
    ResourceExhaustion,
    LogicalFailure,
    Anomaly,
}

impl TestCaseResult {
    pub fn as_str(self) -> &'static str {
        match self {
            TestCaseResult::Pass => "pass",
            TestCaseResult::Crash => "crash",
            TestCaseResult::Hang => "hang",
            TestCaseResult::ResourceExhaustion => "resource_exhaustion",
            TestCaseResult::LogicalFailure => "logical_failure",
            TestCaseResult::Anomaly => "anomaly",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pass" => Some(TestCaseResult::Pass),
            "crash" => Some(TestCaseResult::Crash),
            "hang" => Some(TestCaseResult::Hang),
            "resource_exhaustion" => Some(TestCaseResult::ResourceExhaustion),
            "logical_failure" => Some(TestCaseResult::LogicalFailure),
            "anomaly" => Some(TestCaseResult::Anomaly),
            _ => None,
        }
    }
}

/// Seed-selection policy for stateful fuzzing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FuzzingMode {
    BreadthFirst,
    DepthFirst,
    Targeted,
    #[default]
    Random,
}

impl FuzzingMode {
    pub fn as_str(self) -> &'static str {
        match self {
            FuzzingMode::BreadthFirst => "breadth_first",
            FuzzingMode::DepthFirst => "depth_first",
            FuzzingMode::Targeted => "targeted",
            FuzzingMode::Random => "random",
        }
    }
}

/// Where test cases execute: in-process or on a remote agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    #[default]
    Core,
    Agent,
}

/// Static configuration of a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Plugin name this session fuzzes.
    pub protocol: String,
    pub target_host: String,
    pub target_port: u16,
    pub transport: TransportKind,
    /// Per-test timeout.
    pub timeout_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limit_per_second: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_iterations: Option<u64>,

    /// Mutation overrides; unset values fall back to global settings.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mutation_mode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub structure_aware_weight: Option<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub enabled_mutators: Vec<String>,

    #[serde(default)]
    pub fuzzing_mode: FuzzingMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_state: Option<String>,
    /// Session override for the stateful reset interval.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reset_interval: Option<u64>,
    #[serde(default)]
    pub enable_termination_fuzzing: bool,

    #[serde(default)]
    pub execution_mode: ExecutionMode,
    /// Overrides the plugin's connection mode when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_mode: Option<ConnectionMode>,
}

impl SessionConfig {
    /// Minimal config for a protocol and target; everything else defaulted.
    pub fn new(protocol: &str, target_host: &str, target_port: u16, transport: TransportKind) -> Self {
        Self {
            protocol: protocol.to_string(),
            target_host: target_host.to_string(),
            target_port,
            transport,
            timeout_ms: 5_000,
            rate_limit_per_second: None,
            max_iterations: None,
            mutation_mode: None,
            structure_aware_weight: None,
            enabled_mutators: Vec::new(),
            fuzzing_mode: FuzzingMode::default(),
            target_state: None,
            reset_interval: None,
            enable_termination_fuzzing: false,
            execution_mode: ExecutionMode::default(),
            connection_mode: None,
        }
    }

    pub fn target_addr(&self) -> String {
        format!("{}:{}", self.target_host, self.target_port)
    }
}

/// Totals by result kind plus reset and per-field mutation counters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionStats {
    pub total_tests: u64,
    pub passes: u64,
    pub crashes: u64,
    pub hangs: u64,
    pub resource_exhaustion: u64,
    pub logical_failures: u64,
    pub anomalies: u64,
    pub session_resets: u64,
    pub tests_since_last_reset: u64,
    pub termination_tests: u64,
    #[serde(default)]
    pub field_mutation_counts: BTreeMap<String, u64>,
}

impl SessionStats {
    pub fn record(&mut self, result: TestCaseResult) {
        self.total_tests += 1;
        match result {
            TestCaseResult::Pass => self.passes += 1,
            TestCaseResult::Crash => self.crashes += 1,
            TestCaseResult::Hang => self.hangs += 1,
            TestCaseResult::ResourceExhaustion => self.resource_exhaustion += 1,
            TestCaseResult::LogicalFailure => self.logical_failures += 1,
            TestCaseResult::Anomaly => self.anomalies += 1,
        }
    }
}

/// State machine coverage mirrored from the tracker.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionCoverage {
    #[serde(default)]
    pub state_coverage: BTreeMap<String, u64>,
    #[serde(default)]
    pub transition_coverage: BTreeMap<String, u64>,
    /// Final coverage stats, captured when the session stops.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<serde_json::Value>,
}

/// One fuzzing campaign.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub config: SessionConfig,

    pub status: SessionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Current protocol state for stateful sessions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_state: Option<String>,
    /// Stage currently executing, for orchestrated sessions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_stage: Option<String>,
    #[serde(default)]
    pub termination_reset_pending: bool,

    #[serde(default)]
    pub iterations: u64,
    #[serde(default)]
    pub stats: SessionStats,
    #[serde(default)]
    pub coverage: SessionCoverage,

    pub connection_mode: ConnectionMode,
    #[serde(default)]
    pub reconnect_count: u32,
    #[serde(default)]
    pub heartbeats_sent: u64,
    #[serde(default)]
    pub heartbeat_acks: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_snapshot: Option<serde_json::Value>,

    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stopped_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    pub fn new(config: SessionConfig, connection_mode: ConnectionMode) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            config,
            status: SessionStatus::Idle,
            error_message: None,
            current_state: None,
            current_stage: None,
            termination_reset_pending: false,
            iterations: 0,
            stats: SessionStats::default(),
            coverage: SessionCoverage::default(),
            connection_mode,
            reconnect_count: 0,
            heartbeats_sent: 0,
            heartbeat_acks: 0,
            context_snapshot: None,
            created_at: now,
            started_at: None,
            stopped_at: None,
            updated_at: now,
        }
    }

    /// Append to the error message rather than replacing it, so teardown
    /// problems do not mask the original failure.
    pub fn append_error(&mut self, message: &str) {
        match &mut self.error_message {
            Some(existing) => {
                existing.push_str("; ");
                existing.push_str(message);
            }
            None => self.error_message = Some(message.to_string()),
        }
        self.touch();
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Runtime in seconds, from start to stop (or now while running).
    pub fn runtime_seconds(&self) -> i64 {
        match (self.started_at, self.stopped_at) {
            (Some(start), Some(stop)) => (stop - start).num_seconds(),
            (Some(start), None) => (Utc::now() - start).num_seconds(),
            _ => 0,
        }
    }
}

/// Shared handle to a live session. Lock sections must stay short and
/// never span an await.
pub type SessionHandle = Arc<parking_lot::RwLock<Session>>;

/// A generated test case, before and after execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestCase {
    pub id: String,
    pub session_id: String,
    pub payload: Vec<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed_index: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mutation_strategy: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mutators_applied: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<TestCaseResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

impl TestCase {
    pub fn new(session_id: &str, payload: Vec<u8>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            payload,
            seed_index: None,
            mutation_strategy: None,
            mutators_applied: Vec::new(),
            result: None,
            duration_ms: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_sessions_are_idle() {
        let config = SessionConfig::new("simple_tcp", "127.0.0.1", 9999, TransportKind::Tcp);
        let session = Session::new(config, ConnectionMode::Session);
        assert_eq!(session.status, SessionStatus::Idle);
        assert!(session.started_at.is_none());
        assert_eq!(session.stats.total_tests, 0);
    }

    #[test]
    fn stats_record_by_kind() {
        let mut stats = SessionStats::default();
        stats.record(TestCaseResult::Pass);
        stats.record(TestCaseResult::Crash);
        stats.record(TestCaseResult::Hang);
        stats.record(TestCaseResult::Pass);
        assert_eq!(stats.total_tests, 4);
        assert_eq!(stats.passes, 2);
        assert_eq!(stats.crashes, 1);
        assert_eq!(stats.hangs, 1);
    }

    #[test]
    fn append_error_accumulates() {
        let config = SessionConfig::new("p", "h", 1, TransportKind::Tcp);
        let mut session = Session::new(config, ConnectionMode::Session);
        session.append_error("bootstrap failed");
        session.append_error("teardown failed");
        assert_eq!(
            session.error_message.as_deref(),
            Some("bootstrap failed; teardown failed")
        );
    }

    #[test]
    fn session_json_round_trip() {
        let config = SessionConfig::new("p", "h", 1, TransportKind::Udp);
        let mut session = Session::new(config, ConnectionMode::PerTest);
        session.stats.record(TestCaseResult::LogicalFailure);
        session.coverage.state_coverage.insert("INIT".into(), 3);

        let raw = serde_json::to_string(&session).unwrap();
        let parsed: Session = serde_json::from_str(&raw).unwrap();
        assert_eq!(parsed.id, session.id);
        assert_eq!(parsed.stats.logical_failures, 1);
        assert_eq!(parsed.coverage.state_coverage["INIT"], 3);
        assert_eq!(parsed.config.transport, TransportKind::Udp);
    }

    #[test]
    fn result_string_round_trip() {
        for result in [
            TestCaseResult::Pass,
            TestCaseResult::Crash,
            TestCaseResult::Hang,
            TestCaseResult::ResourceExhaustion,
            TestCaseResult::LogicalFailure,
            TestCaseResult::Anomaly,
        ] {
            assert_eq!(TestCaseResult::parse(result.as_str()), Some(result));
        }
        assert_eq!(TestCaseResult::parse("bogus"), None);
    }
}
