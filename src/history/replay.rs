//! # Replay Executor
//!
//! Re-executes a session's recorded history against a live target. The
//! executor owns a dedicated replay transport and never borrows a
//! session's live connection. The transport is registered with the
//! connection manager so replay-time bootstrap shares the same TCP
//! session, then unregistered and closed in a guaranteed cleanup step.
//!
//! ## Modes
//!
//! - **fresh**: re-run bootstrap on the replay connection (refreshing
//!   tokens), then re-serialize each execution from its recorded parsed
//!   fields against the fresh context; stored bytes are the fallback.
//! - **stored**: restore the context from the first execution's snapshot
//!   and send the stored bytes verbatim.
//! - **skip**: stored bytes without any context reconstruction, for
//!   ad-hoc reproduction.

use super::{ExecutionRecord, HistoryStore};
use crate::codec::{FieldMap, FieldValue, ProtocolCodec};
use crate::engine::stage_runner::StageRunner;
use crate::error::ReplayError;
use crate::plugin::PluginBundle;
use crate::session::context::{new_context_handle, ContextStore};
use crate::transport::managed::ManagedTransport;
use crate::transport::manager::{ConnectOptions, ConnectionManager};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// How a replay rebuilds session context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayMode {
    Fresh,
    Stored,
    Skip,
}

impl ReplayMode {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "fresh" => Some(ReplayMode::Fresh),
            "stored" => Some(ReplayMode::Stored),
            "skip" => Some(ReplayMode::Skip),
            _ => None,
        }
    }
}

/// Outcome of one replayed send.
#[derive(Debug, Clone)]
pub struct ReplayResult {
    pub sequence_number: i64,
    /// success | timeout | error
    pub status: String,
    /// First 100 bytes of the response, hex encoded.
    pub response_preview: Option<String>,
    pub error: Option<String>,
    pub duration_ms: u64,
    /// True when the received bytes equal the historical response.
    pub matched_original: bool,
}

/// Batch outcome plus accumulated warnings about incomplete history.
#[derive(Debug, Clone, Default)]
pub struct ReplayReport {
    pub results: Vec<ReplayResult>,
    pub warnings: Vec<String>,
}

/// Parameters for one replay batch.
#[derive(Debug, Clone)]
pub struct ReplayRequest {
    pub session_id: String,
    pub target_sequence: i64,
    pub mode: ReplayMode,
    pub delay_ms: u64,
    pub stop_on_error: bool,
}

/// Re-executes recorded sessions over a dedicated transport.
pub struct ReplayExecutor {
    history: Arc<HistoryStore>,
    manager: Arc<ConnectionManager>,
}

impl ReplayExecutor {
    pub fn new(history: Arc<HistoryStore>, manager: Arc<ConnectionManager>) -> Self {
        Self { history, manager }
    }

    /// Replay executions `1..=target_sequence`.
    pub async fn replay_up_to(
        &self,
        request: &ReplayRequest,
        plugin: &PluginBundle,
        options: &ConnectOptions,
    ) -> Result<ReplayReport, ReplayError> {
        let records = self
            .history
            .list_for_replay(&request.session_id, request.target_sequence)
            .await
            .map_err(|e| ReplayError::Other(e.to_string()))?;

        // Bootstrap/teardown rows carry negative sequences; only fuzz
        // executions are replayed.
        let fuzz: Vec<ExecutionRecord> = records
            .into_iter()
            .filter(|r| r.sequence_number >= 1)
            .collect();
        if fuzz.is_empty() {
            return Err(ReplayError::NoHistory(request.session_id.clone()));
        }

        let mut report = ReplayReport::default();
        if fuzz[0].sequence_number != 1 {
            report.warnings.push(format!(
                "history does not start at sequence 1 (first available: {})",
                fuzz[0].sequence_number
            ));
        }
        if (fuzz.len() as i64) < request.target_sequence {
            report.warnings.push(format!(
                "only {} of {} requested executions are available",
                fuzz.len(),
                request.target_sequence
            ));
        }

        let transport = Arc::new(ManagedTransport::new(
            &options.host,
            options.port,
            options.timeout_ms,
            options.max_response_bytes,
            options.buffer_size,
        ));
        transport
            .connect()
            .await
            .map_err(|e| ReplayError::Other(e.to_string()))?;
        self.manager
            .register_replay_transport(&request.session_id, transport.clone())
            .await;

        // The transport is owned here: whatever happens during the run, it
        // is unregistered and closed before returning.
        let outcome = self
            .run_replay(request, plugin, options, &fuzz, &transport, &mut report)
            .await;

        self.manager
            .unregister_replay_transport(&request.session_id)
            .await;
        transport.close().await;

        outcome.map(|()| report)
    }

    async fn run_replay(
        &self,
        request: &ReplayRequest,
        plugin: &PluginBundle,
        options: &ConnectOptions,
        records: &[ExecutionRecord],
        transport: &Arc<ManagedTransport>,
        report: &mut ReplayReport,
    ) -> Result<(), ReplayError> {
        let mut context = match request.mode {
            ReplayMode::Fresh => {
                self.run_fresh_bootstrap(request, plugin, options).await?
            }
            ReplayMode::Stored => match &records[0].context_snapshot {
                Some(snapshot) => ContextStore::restore(snapshot),
                None => {
                    report.warnings.push(
                        "first execution has no context snapshot; replaying with empty context"
                            .into(),
                    );
                    ContextStore::new()
                }
            },
            ReplayMode::Skip => ContextStore::new(),
        };

        let codec = ProtocolCodec::new(plugin.effective_data_model().clone());

        for record in records {
            let payload = match request.mode {
                ReplayMode::Fresh => self.rebuild_payload(&codec, record, &mut context),
                _ => record.payload.clone(),
            };

            let started = Instant::now();
            let result = transport.send_and_receive(&payload, None).await;
            let duration_ms = started.elapsed().as_millis() as u64;

            let replayed = match result {
                Ok(response) => {
                    let matched = record.response.as_deref() == Some(response.as_slice());
                    ReplayResult {
                        sequence_number: record.sequence_number,
                        status: "success".into(),
                        response_preview: Some(hex::encode(
                            &response[..response.len().min(100)],
                        )),
                        error: None,
                        duration_ms,
                        matched_original: matched,
                    }
                }
                Err(err) if err.is_timeout() => ReplayResult {
                    sequence_number: record.sequence_number,
                    status: "timeout".into(),
                    response_preview: None,
                    error: Some(err.to_string()),
                    duration_ms,
                    matched_original: false,
                },
                Err(err) => ReplayResult {
                    sequence_number: record.sequence_number,
                    status: "error".into(),
                    response_preview: None,
                    error: Some(err.to_string()),
                    duration_ms,
                    matched_original: false,
                },
            };

            let failed = replayed.status != "success";
            report.results.push(replayed);
            if failed && request.stop_on_error {
                info!(
                    sequence = record.sequence_number,
                    "stopping replay on first failure"
                );
                break;
            }

            if request.delay_ms > 0 {
                tokio::time::sleep(Duration::from_millis(request.delay_ms)).await;
            }
        }

        Ok(())
    }

    /// Ad-hoc reproduction of specific sequence numbers: stored bytes only,
    /// no context reconstruction, over a transport owned for the batch.
    pub async fn replay_sequences(
        &self,
        session_id: &str,
        sequence_numbers: &[i64],
        delay_ms: u64,
        stop_on_error: bool,
        options: &ConnectOptions,
    ) -> Result<ReplayReport, ReplayError> {
        let mut report = ReplayReport::default();
        let mut records = Vec::new();
        for sequence in sequence_numbers {
            match self
                .history
                .find_by_sequence(session_id, *sequence)
                .await
                .map_err(|e| ReplayError::Other(e.to_string()))?
            {
                Some(record) => records.push(record),
                None => report
                    .warnings
                    .push(format!("sequence {sequence} not found in history")),
            }
        }
        if records.is_empty() {
            return Err(ReplayError::NoHistory(session_id.to_string()));
        }

        let transport = Arc::new(ManagedTransport::new(
            &options.host,
            options.port,
            options.timeout_ms,
            options.max_response_bytes,
            options.buffer_size,
        ));
        transport
            .connect()
            .await
            .map_err(|e| ReplayError::Other(e.to_string()))?;

        for record in &records {
            let started = Instant::now();
            let result = transport.send_and_receive(&record.payload, None).await;
            let duration_ms = started.elapsed().as_millis() as u64;
            let replayed = match result {
                Ok(response) => ReplayResult {
                    sequence_number: record.sequence_number,
                    status: "success".into(),
                    response_preview: Some(hex::encode(&response[..response.len().min(100)])),
                    error: None,
                    duration_ms,
                    matched_original: record.response.as_deref() == Some(response.as_slice()),
                },
                Err(err) if err.is_timeout() => ReplayResult {
                    sequence_number: record.sequence_number,
                    status: "timeout".into(),
                    response_preview: None,
                    error: Some(err.to_string()),
                    duration_ms,
                    matched_original: false,
                },
                Err(err) => ReplayResult {
                    sequence_number: record.sequence_number,
                    status: "error".into(),
                    response_preview: None,
                    error: Some(err.to_string()),
                    duration_ms,
                    matched_original: false,
                },
            };
            let failed = replayed.status != "success";
            report.results.push(replayed);
            if failed && stop_on_error {
                break;
            }
            if delay_ms > 0 {
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            }
        }

        transport.close().await;
        Ok(report)
    }

    /// Fresh mode: re-run the plugin's bootstrap stages against the replay
    /// transport (the manager resolves the registered replay key).
    async fn run_fresh_bootstrap(
        &self,
        request: &ReplayRequest,
        plugin: &PluginBundle,
        options: &ConnectOptions,
    ) -> Result<ContextStore, ReplayError> {
        if plugin.bootstrap_stages().is_empty() {
            return Ok(ContextStore::new());
        }
        let runner = StageRunner::new(
            &request.session_id,
            &plugin.name,
            plugin.protocol_stack.clone().unwrap_or_default(),
            self.manager.clone(),
            options.clone(),
            plugin.connection_mode(),
            Some(self.history.clone()),
        )
        .with_replay_transport();
        let handle = new_context_handle();
        runner
            .run_bootstrap(&handle)
            .await
            .map_err(|e| ReplayError::Bootstrap(e.to_string()))?;
        let context = handle.lock().deep_copy();
        Ok(context)
    }

    /// Rebuild a payload from recorded parsed fields against the current
    /// context; stored bytes are the fallback when fields are missing or
    /// serialization fails.
    fn rebuild_payload(
        &self,
        codec: &ProtocolCodec,
        record: &ExecutionRecord,
        context: &mut ContextStore,
    ) -> Vec<u8> {
        let Some(parsed) = &record.parsed_fields else {
            return record.payload.clone();
        };
        let Some(map) = parsed.as_object() else {
            return record.payload.clone();
        };

        let mut fields = FieldMap::new();
        for (name, value) in map {
            if let Some(field_value) = FieldValue::from_json(value) {
                fields.insert(name.clone(), field_value);
            }
        }
        // Drop context-sourced fields so fresh values flow in.
        for block in &codec.model().blocks {
            if block.from_context.is_some() {
                fields.remove(&block.name);
            }
        }

        match codec.serialize(&fields, Some(context)) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(
                    sequence = record.sequence_number,
                    error = %err,
                    "re-serialization failed, using stored bytes"
                );
                record.payload.clone()
            }
        }
    }
}
