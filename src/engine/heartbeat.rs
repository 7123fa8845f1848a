//! # Heartbeat Scheduler
//!
//! One background task per session keeps the target's session alive while
//! the fuzz loop works. Each tick sleeps the configured interval plus
//! random jitter (100 ms floor), builds the keepalive message against the
//! current context, and sends it through the managed transport: whose
//! send mutex guarantees the heartbeat never interleaves with fuzz
//! traffic on the wire.
//!
//! Consecutive failures up to `max_failures` trigger the configured
//! action: `warn` leaves the status failed, `reconnect` replaces the
//! connection (optionally notifying the orchestrator to re-run
//! bootstrap), and `abort` terminates the heartbeat task.

use crate::codec::{FieldMap, FieldValue, ProtocolCodec};
use crate::error::HeartbeatAbortError;
use crate::plugin::{ConnectionMode, DataModel, HeartbeatAction, HeartbeatConfig, HeartbeatMessage};
use crate::session::context::{ContextHandle, ContextValue};
use crate::session::SessionHandle;
use crate::transport::manager::{ConnectOptions, ConnectionManager};
use chrono::{DateTime, Utc};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

const DEFAULT_INTERVAL_MS: u64 = 30_000;
const MIN_WAIT_MS: u64 = 100;

/// Events the scheduler surfaces to the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatEvent {
    /// A reconnect succeeded and the plugin wants bootstrap re-run.
    RebootstrapNeeded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Running,
    Failed,
    Stopped,
}

#[derive(Debug, Clone)]
struct HeartbeatState {
    phase: Phase,
    interval_ms: u64,
    last_sent: Option<DateTime<Utc>>,
    last_ack: Option<DateTime<Utc>>,
    total_sent: u64,
    total_acks: u64,
    failures: u32,
}

/// Everything the heartbeat task needs, owned for the task's lifetime.
pub struct HeartbeatParams {
    pub session_id: String,
    pub config: HeartbeatConfig,
    /// Model used to render field-map heartbeat messages.
    pub data_model: DataModel,
    pub context: ContextHandle,
    pub manager: Arc<ConnectionManager>,
    pub options: ConnectOptions,
    pub connection_mode: ConnectionMode,
    /// Stage key for per-stage connection lookup.
    pub stage_name: Option<String>,
    pub session: SessionHandle,
    pub max_reconnects: u32,
    pub events: Option<mpsc::UnboundedSender<HeartbeatEvent>>,
}

/// Running heartbeat task plus its status window.
pub struct HeartbeatHandle {
    stop_tx: watch::Sender<bool>,
    task: tokio::task::JoinHandle<()>,
    state: Arc<parking_lot::Mutex<HeartbeatState>>,
    enabled: bool,
}

impl HeartbeatHandle {
    /// Status for the control plane.
    pub fn status(&self) -> serde_json::Value {
        let state = self.state.lock().clone();
        serde_json::json!({
            "enabled": self.enabled,
            "status": match state.phase {
                Phase::Running => "running",
                Phase::Failed => "failed",
                Phase::Stopped => "stopped",
            },
            "interval_ms": state.interval_ms,
            "last_sent": state.last_sent.map(|t| t.to_rfc3339()),
            "last_ack": state.last_ack.map(|t| t.to_rfc3339()),
            "total_sent": state.total_sent,
            "total_acks": state.total_acks,
            "failures": state.failures,
        })
    }

    pub fn reset_failures(&self) {
        let mut state = self.state.lock();
        state.failures = 0;
        if state.phase == Phase::Failed {
            state.phase = Phase::Running;
        }
    }

    /// Signal the stop flag and wait for the task. Cancellation is fast:
    /// the loop selects on the stop signal during its sleep.
    pub async fn stop(self) {
        let _ = self.stop_tx.send(true);
        let _ = self.task.await;
        debug!("heartbeat task stopped");
    }
}

/// Spawn the heartbeat task for a session.
pub fn spawn(params: HeartbeatParams) -> HeartbeatHandle {
    let (stop_tx, stop_rx) = watch::channel(false);
    let state = Arc::new(parking_lot::Mutex::new(HeartbeatState {
        phase: Phase::Running,
        interval_ms: params.config.interval_ms.unwrap_or(DEFAULT_INTERVAL_MS),
        last_sent: None,
        last_ack: None,
        total_sent: 0,
        total_acks: 0,
        failures: 0,
    }));
    let enabled = params.config.enabled;

    let task_state = state.clone();
    let task = tokio::spawn(heartbeat_loop(params, stop_rx, task_state));

    HeartbeatHandle {
        stop_tx,
        task,
        state,
        enabled,
    }
}

async fn heartbeat_loop(
    params: HeartbeatParams,
    mut stop_rx: watch::Receiver<bool>,
    state: Arc<parking_lot::Mutex<HeartbeatState>>,
) {
    let codec = ProtocolCodec::new(params.data_model.clone());
    info!(session_id = %params.session_id, "heartbeat started");

    loop {
        let interval_ms = resolve_interval(&params.config, &params.context);
        let wait_ms = jittered_wait(interval_ms, params.config.jitter_ms);
        state.lock().interval_ms = interval_ms;

        tokio::select! {
            changed = stop_rx.changed() => {
                if changed.is_err() || *stop_rx.borrow() {
                    break;
                }
            }
            _ = tokio::time::sleep(Duration::from_millis(wait_ms)) => {}
        }
        if *stop_rx.borrow() {
            break;
        }

        let payload = match build_message(&params.config, &codec, &params.context) {
            Ok(payload) => payload,
            Err(reason) => {
                warn!(session_id = %params.session_id, reason, "heartbeat build failed");
                if !handle_failure(&params, &state).await {
                    break;
                }
                continue;
            }
        };

        match send_heartbeat(&params, &payload).await {
            Ok(acked) => {
                let mut s = state.lock();
                s.phase = Phase::Running;
                s.failures = 0;
                s.total_sent += 1;
                s.last_sent = Some(Utc::now());
                if acked {
                    s.total_acks += 1;
                    s.last_ack = Some(Utc::now());
                }
                drop(s);
                let mut session = params.session.write();
                session.heartbeats_sent += 1;
                if acked {
                    session.heartbeat_acks += 1;
                }
            }
            Err(reason) => {
                debug!(session_id = %params.session_id, reason, "heartbeat failed");
                {
                    let mut s = state.lock();
                    s.total_sent += 1;
                    s.last_sent = Some(Utc::now());
                }
                if !handle_failure(&params, &state).await {
                    break;
                }
            }
        }
    }

    let mut s = state.lock();
    if s.phase != Phase::Failed {
        s.phase = Phase::Stopped;
    }
    info!(session_id = %params.session_id, "heartbeat loop exited");
}

/// Interval resolution: context key first, then the literal, then the
/// 30 s default.
fn resolve_interval(config: &HeartbeatConfig, context: &ContextHandle) -> u64 {
    if let Some(key) = &config.interval_from_context {
        let from_ctx = {
            let ctx = context.lock();
            match ctx.get(key) {
                Some(ContextValue::Uint(v)) => Some(*v),
                Some(ContextValue::Int(v)) if *v > 0 => Some(*v as u64),
                _ => None,
            }
        };
        if let Some(interval) = from_ctx {
            return interval;
        }
    }
    config.interval_ms.unwrap_or(DEFAULT_INTERVAL_MS)
}

fn jittered_wait(interval_ms: u64, jitter_ms: u64) -> u64 {
    if jitter_ms == 0 {
        return interval_ms.max(MIN_WAIT_MS);
    }
    let jitter = rand::thread_rng().gen_range(-(jitter_ms as i64)..=jitter_ms as i64);
    ((interval_ms as i64) + jitter).max(MIN_WAIT_MS as i64) as u64
}

/// Render the heartbeat payload: raw hex, a declared field map, or the
/// data model's defaults: all against the current context.
fn build_message(
    config: &HeartbeatConfig,
    codec: &ProtocolCodec,
    context: &ContextHandle,
) -> Result<Vec<u8>, String> {
    let snapshot = context.lock().deep_copy();
    match &config.message {
        Some(HeartbeatMessage::Raw { hex }) => {
            hex::decode(hex).map_err(|e| format!("bad heartbeat hex: {e}"))
        }
        Some(HeartbeatMessage::Fields { fields }) => {
            let mut map = FieldMap::new();
            for (name, value) in fields {
                if let Some(field_value) = FieldValue::from_json(value) {
                    map.insert(name.clone(), field_value);
                }
            }
            codec
                .serialize(&map, Some(&snapshot))
                .map_err(|e| e.to_string())
        }
        None => codec
            .serialize(&FieldMap::new(), Some(&snapshot))
            .map_err(|e| e.to_string()),
    }
}

/// Send via the session's managed transport. Returns whether the reply
/// validated (always true when no response is expected).
async fn send_heartbeat(params: &HeartbeatParams, payload: &[u8]) -> Result<bool, String> {
    let transport = params
        .manager
        .lookup(
            &params.session_id,
            params.connection_mode,
            params.stage_name.as_deref(),
        )
        .await
        .ok_or_else(|| "no managed transport for session".to_string())?;

    if params.config.expect_response {
        let response = transport
            .send_and_receive(payload, params.config.response_timeout_ms)
            .await
            .map_err(|e| e.to_string())?;
        if response.is_empty() {
            return Err("empty heartbeat response".into());
        }
        if let Some(expected_hex) = &params.config.expected_response {
            let expected =
                hex::decode(expected_hex).map_err(|e| format!("bad expected_response hex: {e}"))?;
            if !response.starts_with(&expected) {
                return Err("heartbeat response prefix mismatch".into());
            }
        }
        Ok(true)
    } else {
        transport.send(payload).await.map_err(|e| e.to_string())?;
        Ok(false)
    }
}

/// Bump the failure count; once it reaches the threshold, run the
/// configured action. Returns false when the loop should terminate.
async fn handle_failure(
    params: &HeartbeatParams,
    state: &Arc<parking_lot::Mutex<HeartbeatState>>,
) -> bool {
    let failures = {
        let mut s = state.lock();
        s.failures += 1;
        s.failures
    };
    let on_timeout = &params.config.on_timeout;
    warn!(
        session_id = %params.session_id,
        failures,
        max_failures = on_timeout.max_failures,
        action = ?on_timeout.action,
        "heartbeat failure"
    );
    if failures < on_timeout.max_failures {
        return true;
    }

    match on_timeout.action {
        HeartbeatAction::Warn => {
            state.lock().phase = Phase::Failed;
            true
        }
        HeartbeatAction::Reconnect => {
            let current = params.session.read().reconnect_count;
            let outcome = params
                .manager
                .reconnect(
                    &params.session_id,
                    params.connection_mode,
                    params.stage_name.as_deref(),
                    &params.options,
                    current,
                    params.max_reconnects,
                    on_timeout.rebootstrap,
                )
                .await;
            match outcome {
                Ok(rebootstrap) => {
                    params.session.write().reconnect_count += 1;
                    if rebootstrap {
                        if let Some(events) = &params.events {
                            let _ = events.send(HeartbeatEvent::RebootstrapNeeded);
                        }
                    }
                    let mut s = state.lock();
                    s.failures = 0;
                    s.phase = Phase::Running;
                    true
                }
                Err(err) => {
                    error!(
                        session_id = %params.session_id,
                        error = %err,
                        "heartbeat reconnect failed"
                    );
                    state.lock().phase = Phase::Failed;
                    false
                }
            }
        }
        HeartbeatAction::Abort => {
            let err = HeartbeatAbortError { failures };
            error!(session_id = %params.session_id, error = %err, "heartbeat aborting");
            state.lock().phase = Phase::Failed;
            false
        }
    }
}
