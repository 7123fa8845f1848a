//! # Stage Runner
//!
//! Executes the orchestrated protocol stack: bootstrap stages before
//! fuzzing (authentication handshakes, subscriptions) and teardown stages
//! at session stop. Each bootstrap stage serializes its request against
//! the current context, sends it, validates the response against the
//! stage's `expect` map, and exports response fields into the context for
//! later stages and `from_context` serialization.
//!
//! Validation mismatches are never retried; transport and parse failures
//! retry up to the stage's `max_attempts` with `backoff_ms` between
//! attempts. Teardown errors are collected, never fatal.

use crate::codec::{FieldMap, FieldValue, ProtocolCodec};
use crate::engine::planner::value_matches;
use crate::error::BootstrapError;
use crate::history::{HistoryStore, RecordInput};
use crate::plugin::{
    apply_transforms, ConnectionMode, RetryPolicy, Stage, StageRole, TransportKind,
};
use crate::session::context::{ContextHandle, ContextValue};
use crate::session::TestCaseResult;
use crate::transport::manager::{ConnectOptions, ConnectionManager};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Lifecycle state of one stage, exposed to the control plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageState {
    Pending,
    Active,
    Complete,
    Failed,
}

impl StageState {
    pub fn as_str(self) -> &'static str {
        match self {
            StageState::Pending => "pending",
            StageState::Active => "active",
            StageState::Complete => "complete",
            StageState::Failed => "failed",
        }
    }
}

/// Status of one stage across the session's lifetime.
#[derive(Debug, Clone)]
pub struct StageStatus {
    pub name: String,
    pub role: StageRole,
    pub state: StageState,
    pub attempts: u32,
    pub error: Option<String>,
    pub exports_captured: Vec<String>,
    pub exports_missing: Vec<String>,
}

/// Runs bootstrap and teardown stages for one session.
pub struct StageRunner {
    session_id: String,
    protocol: String,
    stages: Vec<Stage>,
    manager: Arc<ConnectionManager>,
    options: ConnectOptions,
    connection_mode: ConnectionMode,
    statuses: parking_lot::Mutex<Vec<StageStatus>>,
    history: Option<Arc<HistoryStore>>,
    /// Route exchanges over the session's registered replay transport,
    /// for bootstrap runs owned by the replay executor.
    use_replay_transport: bool,
}

impl StageRunner {
    pub fn new(
        session_id: &str,
        protocol: &str,
        stages: Vec<Stage>,
        manager: Arc<ConnectionManager>,
        options: ConnectOptions,
        connection_mode: ConnectionMode,
        history: Option<Arc<HistoryStore>>,
    ) -> Self {
        let statuses = stages
            .iter()
            .map(|s| StageStatus {
                name: s.name.clone(),
                role: s.role,
                state: StageState::Pending,
                attempts: 0,
                error: None,
                exports_captured: Vec::new(),
                exports_missing: Vec::new(),
            })
            .collect();
        Self {
            session_id: session_id.to_string(),
            protocol: protocol.to_string(),
            stages,
            manager,
            options,
            connection_mode,
            statuses: parking_lot::Mutex::new(statuses),
            history,
            use_replay_transport: false,
        }
    }

    /// Replay-owned variant: exchanges go over the replay transport
    /// registered with the connection manager.
    pub fn with_replay_transport(mut self) -> Self {
        self.use_replay_transport = true;
        self
    }

    pub fn statuses(&self) -> Vec<StageStatus> {
        self.statuses.lock().clone()
    }

    pub fn stage_status(&self, name: &str) -> Option<StageStatus> {
        self.statuses.lock().iter().find(|s| s.name == name).cloned()
    }

    pub fn fuzz_target_stage(&self) -> Option<&Stage> {
        self.stages.iter().find(|s| s.role == StageRole::FuzzTarget)
    }

    /// Run all bootstrap stages in declared order, then mark the context
    /// bootstrap-complete.
    pub async fn run_bootstrap(&self, context: &ContextHandle) -> Result<(), BootstrapError> {
        for stage in self.stages.iter().filter(|s| s.role == StageRole::Bootstrap) {
            self.run_stage_with_retry(stage, context).await?;
        }
        context.lock().set_bootstrap_complete(true);
        info!(session_id = %self.session_id, "bootstrap complete");
        Ok(())
    }

    /// Re-run a single stage on demand (control plane; session must not be
    /// running).
    pub async fn rerun_stage(
        &self,
        name: &str,
        context: &ContextHandle,
    ) -> Result<(), BootstrapError> {
        let stage = self
            .stages
            .iter()
            .find(|s| s.name == name)
            .ok_or_else(|| BootstrapError::Failed {
                stage: name.to_string(),
                attempt: 0,
                reason: "unknown stage".into(),
            })?;
        self.run_stage_with_retry(stage, context).await
    }

    /// Run all teardown stages; failures are collected, never raised.
    pub async fn run_teardown(&self, context: &ContextHandle) -> Vec<String> {
        let mut errors = Vec::new();
        for stage in self.stages.iter().filter(|s| s.role == StageRole::Teardown) {
            if let Err(err) = self.run_stage_with_retry(stage, context).await {
                warn!(stage = %stage.name, error = %err, "teardown stage failed");
                errors.push(format!("teardown '{}': {err}", stage.name));
            }
        }
        errors
    }

    /// Reset bootstrap stage statuses, e.g. before a re-bootstrap after
    /// reconnect.
    pub fn reset_bootstrap_statuses(&self) {
        let mut statuses = self.statuses.lock();
        for status in statuses.iter_mut() {
            if status.role == StageRole::Bootstrap {
                status.state = StageState::Pending;
                status.attempts = 0;
                status.error = None;
                status.exports_captured.clear();
                status.exports_missing.clear();
            }
        }
    }

    async fn run_stage_with_retry(
        &self,
        stage: &Stage,
        context: &ContextHandle,
    ) -> Result<(), BootstrapError> {
        let retry = stage.retry.clone().unwrap_or_else(RetryPolicy::default);
        self.set_state(&stage.name, StageState::Active, None);

        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.execute_attempt(stage, context, attempt).await {
                Ok(()) => {
                    self.set_state(&stage.name, StageState::Complete, None);
                    return Ok(());
                }
                Err(err) if err.is_retryable() && attempt < retry.max_attempts => {
                    warn!(
                        stage = %stage.name,
                        attempt,
                        error = %err,
                        "stage attempt failed, retrying"
                    );
                    self.bump_attempts(&stage.name, attempt);
                    tokio::time::sleep(Duration::from_millis(retry.backoff_ms)).await;
                }
                Err(err) => {
                    self.set_state(&stage.name, StageState::Failed, Some(err.to_string()));
                    self.bump_attempts(&stage.name, attempt);
                    return Err(err);
                }
            }
        }
    }

    async fn execute_attempt(
        &self,
        stage: &Stage,
        context: &ContextHandle,
        attempt: u32,
    ) -> Result<(), BootstrapError> {
        let failed = |reason: String| BootstrapError::Failed {
            stage: stage.name.clone(),
            attempt,
            reason,
        };

        // Serialize against a snapshot so no lock is held across I/O.
        let codec = ProtocolCodec::new(stage.data_model.clone());
        let payload = {
            let snapshot = context.lock().deep_copy();
            codec
                .serialize(&FieldMap::new(), Some(&snapshot))
                .map_err(|e| failed(e.to_string()))?
        };

        let sent_at = Utc::now();
        let response = self
            .exchange(stage, &payload)
            .await
            .map_err(|e| failed(e.to_string()))?;
        let responded_at = Utc::now();
        debug!(
            stage = %stage.name,
            sent = payload.len(),
            received = response.len(),
            "stage exchange complete"
        );

        let parsed = match &stage.response_model {
            Some(model) => {
                let response_codec = ProtocolCodec::new(model.clone());
                Some(
                    response_codec
                        .parse(&response)
                        .map_err(|e| failed(format!("response parse: {e}")))?,
                )
            }
            None => None,
        };

        if let Some(parsed) = &parsed {
            self.validate_expectations(stage, parsed)?;
            self.apply_exports(stage, parsed, context);
        }

        self.record_execution(stage, payload, response, parsed, context, sent_at, responded_at)
            .await;
        Ok(())
    }

    async fn exchange(
        &self,
        stage: &Stage,
        payload: &[u8],
    ) -> Result<Vec<u8>, crate::error::TransportError> {
        if self.use_replay_transport {
            if let Some(transport) = self.manager.replay_transport(&self.session_id).await {
                return transport.send_and_receive(payload, None).await;
            }
            return Err(crate::error::TransportError::Other(
                "no replay transport registered for session".into(),
            ));
        }

        let managed_mode = matches!(
            self.connection_mode,
            ConnectionMode::Session | ConnectionMode::PerStage
        );
        if managed_mode && self.options.transport == TransportKind::Tcp {
            let transport = self
                .manager
                .get_transport(
                    &self.session_id,
                    self.connection_mode,
                    Some(&stage.name),
                    &self.options,
                )
                .await?;
            return transport.send_and_receive(payload, None).await;
        }

        crate::transport::exchange(
            self.options.transport,
            &self.options.host,
            self.options.port,
            payload,
            &crate::transport::ExchangeConfig {
                timeout_ms: self.options.timeout_ms,
                max_response_bytes: self.options.max_response_bytes,
                buffer_size: self.options.buffer_size,
            },
        )
        .await
    }

    /// Compare parsed response fields against the stage's `expect` map.
    /// A list expectation means any-of. Mismatches are not retryable.
    fn validate_expectations(
        &self,
        stage: &Stage,
        parsed: &FieldMap,
    ) -> Result<(), BootstrapError> {
        for (field, expected) in &stage.expect {
            let actual = parsed.get(field);
            let ok = match (actual, expected) {
                (Some(actual), serde_json::Value::Array(options)) => {
                    options.iter().any(|o| value_matches(o, actual))
                }
                (Some(actual), other) => value_matches(other, actual),
                (None, _) => false,
            };
            if !ok {
                return Err(BootstrapError::Validation {
                    stage: stage.name.clone(),
                    field: field.clone(),
                    expected: expected.to_string(),
                    actual: actual
                        .map(|v| format!("{:?}", v))
                        .unwrap_or_else(|| "<missing>".into()),
                });
            }
        }
        Ok(())
    }

    /// Store exported response fields into the context. Missing fields are
    /// recorded on the stage status but do not fail the stage.
    fn apply_exports(&self, stage: &Stage, parsed: &FieldMap, context: &ContextHandle) {
        let mut captured = Vec::new();
        let mut missing = Vec::new();

        for (field_path, spec) in &stage.exports {
            match lookup_field(parsed, field_path) {
                Some(value) => {
                    let exported = export_value(value, spec.transforms());
                    context.lock().set(spec.context_key(), exported);
                    captured.push(spec.context_key().to_string());
                    debug!(
                        stage = %stage.name,
                        field = %field_path,
                        key = %spec.context_key(),
                        "response field exported"
                    );
                }
                None => {
                    warn!(
                        stage = %stage.name,
                        field = %field_path,
                        "export field missing from response"
                    );
                    missing.push(field_path.clone());
                }
            }
        }

        let mut statuses = self.statuses.lock();
        if let Some(status) = statuses.iter_mut().find(|s| s.name == stage.name) {
            status.exports_captured = captured;
            status.exports_missing = missing;
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn record_execution(
        &self,
        stage: &Stage,
        payload: Vec<u8>,
        response: Vec<u8>,
        parsed: Option<FieldMap>,
        context: &ContextHandle,
        sent_at: chrono::DateTime<Utc>,
        responded_at: chrono::DateTime<Utc>,
    ) {
        let Some(history) = &self.history else { return };
        let parsed_fields = parsed.map(|fields| {
            serde_json::Value::Object(
                fields
                    .iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect(),
            )
        });
        // Snapshot taken immediately after exports, so the record shows the
        // context the next stage will see.
        let context_snapshot = context.lock().snapshot();

        history
            .record_bootstrap(RecordInput {
                session_id: self.session_id.clone(),
                protocol: self.protocol.clone(),
                payload,
                response: Some(response),
                timestamp_sent: Some(sent_at),
                timestamp_response: Some(responded_at),
                duration_ms: Some(
                    (responded_at - sent_at).num_milliseconds().max(0) as u64
                ),
                result: Some(TestCaseResult::Pass),
                stage_name: Some(stage.name.clone()),
                context_snapshot: Some(context_snapshot),
                parsed_fields,
                ..Default::default()
            })
            .await;
    }

    fn set_state(&self, name: &str, state: StageState, error: Option<String>) {
        let mut statuses = self.statuses.lock();
        if let Some(status) = statuses.iter_mut().find(|s| s.name == name) {
            status.state = state;
            status.error = error;
        }
    }

    fn bump_attempts(&self, name: &str, attempts: u32) {
        let mut statuses = self.statuses.lock();
        if let Some(status) = statuses.iter_mut().find(|s| s.name == name) {
            status.attempts = attempts;
        }
    }
}

/// Field lookup with dotted-path tolerance: the full path is tried first,
/// then its first segment.
fn lookup_field<'a>(parsed: &'a FieldMap, path: &str) -> Option<&'a FieldValue> {
    if let Some(value) = parsed.get(path) {
        return Some(value);
    }
    let first = path.split('.').next()?;
    parsed.get(first)
}

/// Convert an exported field value, applying any output transforms to
/// integer values.
fn export_value(value: &FieldValue, transforms: &[crate::plugin::TransformOp]) -> ContextValue {
    if !transforms.is_empty() {
        if let Some(input) = value.as_u64() {
            return ContextValue::Uint(apply_transforms(transforms, input));
        }
    }
    match value {
        FieldValue::Uint(v) => ContextValue::Uint(*v),
        FieldValue::Int(v) => ContextValue::Int(*v),
        FieldValue::Bytes(b) => ContextValue::Bytes(b.clone()),
        FieldValue::Str(s) => ContextValue::Str(s.clone()),
    }
}
