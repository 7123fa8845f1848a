//! # Error Taxonomy
//!
//! Structured error types for every subsystem. Each enum covers one failure
//! domain so callers can classify at the boundary where the error is raised:
//! transport errors become test-case verdicts inside the fuzzing loop,
//! bootstrap errors decide retryability inside the stage runner, and codec
//! errors abort only the operation that produced them.
//!
//! The top-level [`FuzzerError`] exists for API surfaces that need to carry
//! any of them; internal code paths use the specific enums directly.

use thiserror::Error;

/// Protocol codec failures (parse / serialize / context resolution).
#[derive(Debug, Clone, Error)]
pub enum CodecError {
    /// Failed to parse a message according to the data model.
    #[error("failed to parse field '{field}' at offset {offset}: {reason}")]
    Parse {
        field: String,
        offset: usize,
        reason: String,
    },

    /// Failed to serialize a field dictionary to binary form.
    #[error("failed to serialize field '{field}': {reason}")]
    Serialization { field: String, reason: String },

    /// A `from_context` field referenced a key that is not in the store.
    #[error("context key '{key}' not found. Available keys: {}", .available.join(", "))]
    ContextKeyNotFound {
        key: String,
        available: Vec<String>,
    },
}

/// Network transport failures. The fuzzing loop maps these onto verdicts:
/// refused and send/receive failures classify as `crash`, timeouts as `hang`.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection refused by {addr}")]
    ConnectionRefused { addr: String },

    #[error("connection to {addr} timed out after {timeout_ms}ms")]
    ConnectionTimeout { addr: String, timeout_ms: u64 },

    #[error("send failed: {0}")]
    Send(String),

    #[error("receive failed: {0}")]
    Receive(String),

    #[error("timed out waiting for response after {timeout_ms}ms")]
    ReceiveTimeout { timeout_ms: u64 },

    /// Reconnect limit exceeded; the session cannot continue.
    #[error("connection aborted after {reconnects} reconnect attempts (max {max})")]
    ConnectionAbort { reconnects: u32, max: u32 },

    #[error("transport error: {0}")]
    Other(String),
}

impl TransportError {
    /// True for errors that classify the test case as a hang rather than
    /// a crash.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            TransportError::ConnectionTimeout { .. } | TransportError::ReceiveTimeout { .. }
        )
    }
}

/// Bootstrap stage failures. Validation mismatches are never retried;
/// everything else retries up to the stage's `max_attempts`.
#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("bootstrap stage '{stage}' failed (attempt {attempt}): {reason}")]
    Failed {
        stage: String,
        attempt: u32,
        reason: String,
    },

    #[error(
        "bootstrap stage '{stage}' response validation failed: \
         field '{field}' expected {expected}, got {actual}"
    )]
    Validation {
        stage: String,
        field: String,
        expected: String,
        actual: String,
    },
}

impl BootstrapError {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, BootstrapError::Validation { .. })
    }

    pub fn stage(&self) -> &str {
        match self {
            BootstrapError::Failed { stage, .. } => stage,
            BootstrapError::Validation { stage, .. } => stage,
        }
    }
}

/// Session lifecycle failures.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session {0} not found")]
    NotFound(String),

    #[error("invalid session state: {message} (current: {current})")]
    State { message: String, current: String },

    #[error("session initialization failed: {0}")]
    Initialization(String),

    #[error("concurrent session limit reached ({limit}); running sessions: {}", .running.join(", "))]
    ConcurrencyLimit { limit: usize, running: Vec<String> },
}

/// Plugin loading and validation failures.
#[derive(Debug, Error)]
pub enum PluginError {
    #[error("failed to load plugin: {0}")]
    Load(String),

    #[error("plugin validation failed at {path}: {reason}")]
    Validation { path: String, reason: String },
}

/// Raised by the heartbeat scheduler when failures exceed the configured
/// threshold and the action is `abort`.
#[derive(Debug, Error)]
#[error("heartbeat failed {failures} consecutive times, aborting")]
pub struct HeartbeatAbortError {
    pub failures: u32,
}

/// Replay failures are fatal for the replay batch but never for the session.
#[derive(Debug, Error)]
pub enum ReplayError {
    #[error("no execution history found for session {0}")]
    NoHistory(String),

    #[error("replay bootstrap failed: {0}")]
    Bootstrap(String),

    #[error("replay failed: {0}")]
    Other(String),
}

/// Remote-agent coordination failures.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("agent {0} is not registered")]
    NotRegistered(String),

    #[error("agent work queue for {target} is full (capacity {capacity})")]
    QueueFull { target: String, capacity: usize },
}

/// Resource exhaustion and internal invariant violations.
#[derive(Debug, Error)]
pub enum ResourceError {
    #[error("memory limit exceeded: {0}")]
    Memory(String),

    #[error("queue full: {0}")]
    QueueFull(String),

    #[error("rate limit exceeded: {0}")]
    RateLimit(String),
}

/// Umbrella error for API surfaces that can surface any subsystem failure.
#[derive(Debug, Error)]
pub enum FuzzerError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Bootstrap(#[from] BootstrapError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Plugin(#[from] PluginError),

    #[error(transparent)]
    Heartbeat(#[from] HeartbeatAbortError),

    #[error(transparent)]
    Replay(#[from] ReplayError),

    #[error(transparent)]
    Agent(#[from] AgentError),

    #[error(transparent)]
    Resource(#[from] ResourceError),

    /// A bug in the fuzzer itself. Logged and the session marked failed.
    #[error("invariant violated: {0}")]
    InvariantViolation(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bootstrap_validation_is_not_retryable() {
        let err = BootstrapError::Validation {
            stage: "auth".into(),
            field: "status".into(),
            expected: "0".into(),
            actual: "1".into(),
        };
        assert!(!err.is_retryable());

        let err = BootstrapError::Failed {
            stage: "auth".into(),
            attempt: 1,
            reason: "connection reset".into(),
        };
        assert!(err.is_retryable());
    }

    #[test]
    fn timeout_errors_classify_as_hang() {
        assert!(TransportError::ReceiveTimeout { timeout_ms: 500 }.is_timeout());
        assert!(!TransportError::Send("broken pipe".into()).is_timeout());
    }

    #[test]
    fn context_key_error_lists_available_keys() {
        let err = CodecError::ContextKeyNotFound {
            key: "auth_token".into(),
            available: vec!["nonce".into(), "session_id".into()],
        };
        let msg = err.to_string();
        assert!(msg.contains("auth_token"));
        assert!(msg.contains("nonce, session_id"));
    }
}
