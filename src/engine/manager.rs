//! # Session Manager
//!
//! The owned service the control plane talks to: session lifecycle
//! (create/start/stop/delete), orchestration surfaces (context, stages,
//! connection, heartbeat, replay), and the agent endpoints. Everything is
//! created at program start and passed by handle, with no global
//! mutable state.
//!
//! Start wiring, in order: load the plugin, flip the session to running,
//! run bootstrap stages, start the heartbeat, then spawn the fuzzing
//! loop. Stop reverses it under a bounded grace: signal the loop, await
//! it, stop the heartbeat, run teardown best-effort, close transports,
//! flush history, checkpoint.

use crate::config::Settings;
use crate::engine::agent::{AgentDispatcher, AgentInfo, AgentResult, AgentWorkItem};
use crate::engine::crash::CrashReporter;
use crate::engine::fuzz_loop::{FuzzLoopParams, FuzzingLoop};
use crate::engine::heartbeat::{self, HeartbeatEvent, HeartbeatHandle, HeartbeatParams};
use crate::engine::stage_runner::StageRunner;
use crate::error::{SessionError, TransportError};
use crate::history::replay::{ReplayExecutor, ReplayReport, ReplayRequest};
use crate::history::HistoryStore;
use crate::plugin::{PluginBundle, TransportKind};
use crate::session::context::{new_context_handle, ContextHandle, ContextStore, ContextValue};
use crate::session::store::SessionStore;
use crate::session::{Session, SessionConfig, SessionHandle, SessionStatus, TestCaseResult};
use crate::transport::manager::{ConnectOptions, ConnectionManager};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

/// Grace period for the fuzz task to notice the stop signal.
const STOP_GRACE_MS: u64 = 10_000;

struct RunningSession {
    handle: SessionHandle,
    context: ContextHandle,
    stop_tx: watch::Sender<bool>,
    task: tokio::task::JoinHandle<()>,
    stage_runner: Option<Arc<StageRunner>>,
    heartbeat: Option<HeartbeatHandle>,
    rebootstrap_task: Option<tokio::task::JoinHandle<()>>,
    reached_running: bool,
}

/// Owned orchestrator for every session in the process.
pub struct SessionManager {
    settings: Settings,
    plugins: parking_lot::RwLock<HashMap<String, Arc<PluginBundle>>>,
    store: SessionStore,
    history: Arc<HistoryStore>,
    connections: Arc<ConnectionManager>,
    dispatcher: Arc<AgentDispatcher>,
    crash_reporter: Arc<CrashReporter>,
    running: tokio::sync::Mutex<HashMap<String, RunningSession>>,
}

impl SessionManager {
    pub fn new(settings: Settings, store: SessionStore, history: Arc<HistoryStore>) -> Self {
        let connections = Arc::new(ConnectionManager::new(settings.reconnect_backoff_ms));
        let dispatcher = Arc::new(AgentDispatcher::new(
            settings.agent_queue_size,
            settings.agent_timeout_sec,
        ));
        let crash_reporter = Arc::new(CrashReporter::new(&settings.crash_dir));
        Self {
            settings,
            plugins: parking_lot::RwLock::new(HashMap::new()),
            store,
            history,
            connections,
            dispatcher,
            crash_reporter,
            running: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Startup sweep: sessions persisted as running did not survive the
    /// restart and are paused with an explanatory error.
    pub async fn startup(&self) -> anyhow::Result<usize> {
        Ok(self.store.pause_orphaned_running().await?)
    }

    /// Register a loaded plugin. A reload replaces the bundle; cached
    /// state belongs to sessions, which pick it up on their next start.
    pub fn register_plugin(&self, bundle: PluginBundle) {
        info!(plugin = %bundle.name, "plugin registered");
        self.plugins
            .write()
            .insert(bundle.name.clone(), Arc::new(bundle));
    }

    pub fn plugin(&self, name: &str) -> Result<Arc<PluginBundle>, SessionError> {
        self.plugins
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| SessionError::Initialization(format!("unknown protocol '{name}'")))
    }

    pub fn plugin_names(&self) -> Vec<String> {
        self.plugins.read().keys().cloned().collect()
    }

    pub fn agent_dispatcher(&self) -> Arc<AgentDispatcher> {
        self.dispatcher.clone()
    }

    // ------------------------------------------------------------------
    // Session lifecycle
    // ------------------------------------------------------------------

    pub async fn create_session(&self, config: SessionConfig) -> Result<Session, SessionError> {
        let plugin = self.plugin(&config.protocol)?;
        if config.transport != plugin.transport {
            return Err(SessionError::Initialization(format!(
                "session transport {} does not match plugin transport {}",
                config.transport, plugin.transport
            )));
        }
        let connection_mode = config.connection_mode.unwrap_or(plugin.connection_mode());
        let session = Session::new(config, connection_mode);
        self.store
            .save(session.clone())
            .await
            .map_err(|e| SessionError::Initialization(e.to_string()))?;
        info!(session_id = %session.id, protocol = %session.config.protocol, "session created");
        Ok(session)
    }

    /// Start a session: bootstrap, heartbeat, then the fuzzing loop.
    pub async fn start_session(&self, id: &str) -> Result<(), SessionError> {
        let mut running = self.running.lock().await;
        if running.contains_key(id) {
            return Err(SessionError::State {
                message: "session is already running".into(),
                current: "running".into(),
            });
        }
        if running.len() >= self.settings.max_concurrent_sessions {
            return Err(SessionError::ConcurrencyLimit {
                limit: self.settings.max_concurrent_sessions,
                running: running.keys().cloned().collect(),
            });
        }

        let mut session = self
            .store
            .load(id)
            .await
            .map_err(|e| SessionError::Initialization(e.to_string()))?
            .ok_or_else(|| SessionError::NotFound(id.to_string()))?;
        if session.status == SessionStatus::Running {
            return Err(SessionError::State {
                message: "session is already running".into(),
                current: session.status.as_str().into(),
            });
        }
        let plugin = self.plugin(&session.config.protocol)?;

        session.status = SessionStatus::Running;
        session.started_at = Some(Utc::now());
        session.stopped_at = None;
        session.error_message = None;
        session.touch();

        let handle: SessionHandle = Arc::new(parking_lot::RwLock::new(session.clone()));
        let context = match &session.context_snapshot {
            Some(snapshot) => Arc::new(parking_lot::Mutex::new(ContextStore::restore(snapshot))),
            None => new_context_handle(),
        };
        let options = self.connect_options(&session.config);

        // Bootstrap stages run before the loop; a failure fails the start
        // and teardown does not run.
        let stage_runner = if plugin.protocol_stack.is_some() {
            let runner = Arc::new(StageRunner::new(
                id,
                &plugin.name,
                plugin.protocol_stack.clone().unwrap_or_default(),
                self.connections.clone(),
                options.clone(),
                session.connection_mode,
                Some(self.history.clone()),
            ));
            if let Err(err) = runner.run_bootstrap(&context).await {
                let message = format!("bootstrap failed: {err}");
                error!(session_id = %id, error = %err, "session start aborted");
                session.status = SessionStatus::Failed;
                session.error_message = Some(message.clone());
                let _ = self.store.save(session).await;
                self.connections.close_session(id).await;
                return Err(SessionError::Initialization(message));
            }
            Some(runner)
        } else {
            None
        };

        // Persist the running state (with the post-bootstrap context).
        {
            let mut live = handle.write();
            live.context_snapshot = Some(context.lock().snapshot());
            live.current_stage = plugin.fuzz_target_stage().map(|s| s.name.clone());
        }
        let _ = self.store.save(handle.read().clone()).await;

        let (heartbeat, rebootstrap_task) =
            self.spawn_heartbeat(&plugin, &handle, &context, &options, stage_runner.clone());

        let (stop_tx, stop_rx) = watch::channel(false);
        let loop_params = FuzzLoopParams {
            settings: self.settings.clone(),
            plugin: plugin.clone(),
            session: handle.clone(),
            context: context.clone(),
            manager: self.connections.clone(),
            history: self.history.clone(),
            store: self.store.clone(),
            crash_reporter: self.crash_reporter.clone(),
            agent: Some(self.dispatcher.clone()),
            stop: stop_rx,
        };
        let fuzz_loop = match FuzzingLoop::initialize(loop_params) {
            Ok(fuzz_loop) => fuzz_loop,
            Err(err) => {
                let message = err.to_string();
                {
                    let mut live = handle.write();
                    live.status = SessionStatus::Failed;
                    live.error_message = Some(message.clone());
                }
                let _ = self.store.save(handle.read().clone()).await;
                if let Some(heartbeat) = heartbeat {
                    heartbeat.stop().await;
                }
                if let Some(task) = rebootstrap_task {
                    task.abort();
                }
                self.connections.close_session(id).await;
                return Err(err);
            }
        };
        let task = tokio::spawn(fuzz_loop.run());

        running.insert(
            id.to_string(),
            RunningSession {
                handle,
                context,
                stop_tx,
                task,
                stage_runner,
                heartbeat,
                rebootstrap_task,
                reached_running: true,
            },
        );
        info!(session_id = %id, "session started");
        Ok(())
    }

    fn spawn_heartbeat(
        &self,
        plugin: &Arc<PluginBundle>,
        handle: &SessionHandle,
        context: &ContextHandle,
        options: &ConnectOptions,
        stage_runner: Option<Arc<StageRunner>>,
    ) -> (Option<HeartbeatHandle>, Option<tokio::task::JoinHandle<()>>) {
        let Some(config) = plugin.heartbeat.clone().filter(|h| h.enabled) else {
            return (None, None);
        };
        let (events_tx, mut events_rx) = mpsc::unbounded_channel::<HeartbeatEvent>();
        let (session_id, connection_mode) = {
            let live = handle.read();
            (live.id.clone(), live.connection_mode)
        };

        let heartbeat = heartbeat::spawn(HeartbeatParams {
            session_id: session_id.clone(),
            config,
            data_model: plugin.effective_data_model().clone(),
            context: context.clone(),
            manager: self.connections.clone(),
            options: options.clone(),
            connection_mode,
            stage_name: plugin.fuzz_target_stage().map(|s| s.name.clone()),
            session: handle.clone(),
            max_reconnects: self.settings.max_reconnects,
            events: Some(events_tx),
        });

        // Rebootstrap requests from the heartbeat re-run bootstrap on the
        // fresh connection with a cleared context.
        let rebootstrap_task = stage_runner.map(|runner| {
            let context = context.clone();
            tokio::spawn(async move {
                while let Some(HeartbeatEvent::RebootstrapNeeded) = events_rx.recv().await {
                    info!(session_id = %session_id, "re-running bootstrap after reconnect");
                    runner.reset_bootstrap_statuses();
                    context.lock().clear();
                    if let Err(err) = runner.run_bootstrap(&context).await {
                        error!(
                            session_id = %session_id,
                            error = %err,
                            "re-bootstrap failed"
                        );
                    }
                }
            })
        });

        (Some(heartbeat), rebootstrap_task)
    }

    /// Stop a running session: cancel the loop, await it, stop the
    /// heartbeat, run teardown best-effort, close transports, flush
    /// history, checkpoint.
    pub async fn stop_session(&self, id: &str) -> Result<(), SessionError> {
        let entry = self.running.lock().await.remove(id);
        let Some(entry) = entry else {
            return Err(SessionError::State {
                message: "session is not running".into(),
                current: "stopped".into(),
            });
        };

        {
            let mut live = entry.handle.write();
            if live.status == SessionStatus::Running {
                live.status = SessionStatus::Completed;
            }
            live.stopped_at = Some(Utc::now());
            live.touch();
        }
        let _ = entry.stop_tx.send(true);

        let abort = entry.task.abort_handle();
        if tokio::time::timeout(Duration::from_millis(STOP_GRACE_MS), entry.task)
            .await
            .is_err()
        {
            warn!(session_id = %id, "fuzz task exceeded stop grace, aborting");
            abort.abort();
        }

        if let Some(heartbeat) = entry.heartbeat {
            heartbeat.stop().await;
        }
        if let Some(task) = entry.rebootstrap_task {
            task.abort();
        }

        if entry.reached_running {
            if let Some(runner) = &entry.stage_runner {
                for err in runner.run_teardown(&entry.context).await {
                    entry.handle.write().append_error(&err);
                }
            }
        }

        self.connections.close_session(id).await;
        self.dispatcher.clear_session(id);
        self.history.flush(5_000).await;

        {
            let mut live = entry.handle.write();
            live.context_snapshot = Some(entry.context.lock().snapshot());
        }
        let _ = self.store.save(entry.handle.read().clone()).await;
        info!(session_id = %id, "session stopped");
        Ok(())
    }

    pub async fn delete_session(&self, id: &str) -> Result<bool, SessionError> {
        if self.running.lock().await.contains_key(id) {
            self.stop_session(id).await?;
        }
        self.history.reset_session(id).await;
        self.dispatcher.clear_session(id);
        self.store
            .delete(id)
            .await
            .map_err(|e| SessionError::Initialization(e.to_string()))
    }

    pub async fn get_session(&self, id: &str) -> Result<Session, SessionError> {
        if let Some(entry) = self.running.lock().await.get(id) {
            return Ok(entry.handle.read().clone());
        }
        self.store
            .load(id)
            .await
            .map_err(|e| SessionError::Initialization(e.to_string()))?
            .ok_or_else(|| SessionError::NotFound(id.to_string()))
    }

    pub async fn list_sessions(&self) -> Result<Vec<Session>, SessionError> {
        let mut sessions = self
            .store
            .list()
            .await
            .map_err(|e| SessionError::Initialization(e.to_string()))?;
        // Live handles are fresher than their last checkpoint.
        let running = self.running.lock().await;
        for session in sessions.iter_mut() {
            if let Some(entry) = running.get(&session.id) {
                *session = entry.handle.read().clone();
            }
        }
        Ok(sessions)
    }

    /// Runtime, totals, and coverage for the stats endpoint.
    pub async fn session_stats(&self, id: &str) -> Result<serde_json::Value, SessionError> {
        let session = self.get_session(id).await?;
        let total_recorded = self.history.total_count(id).await.unwrap_or(0);
        let runtime_seconds = session.runtime_seconds();
        Ok(serde_json::json!({
            "session_id": session.id,
            "status": session.status.as_str(),
            "runtime_seconds": runtime_seconds,
            "iterations": session.iterations,
            "recorded_executions": total_recorded,
            "totals": {
                "tests": session.stats.total_tests,
                "passes": session.stats.passes,
                "crashes": session.stats.crashes,
                "hangs": session.stats.hangs,
                "resource_exhaustion": session.stats.resource_exhaustion,
                "logical_failures": session.stats.logical_failures,
                "anomalies": session.stats.anomalies,
            },
            "resets": session.stats.session_resets,
            "termination_tests": session.stats.termination_tests,
            "field_mutation_counts": session.stats.field_mutation_counts,
            "current_state": session.current_state,
            "state_coverage": session.coverage.state_coverage,
            "transition_coverage": session.coverage.transition_coverage,
            "reconnects": session.reconnect_count,
            "heartbeats_sent": session.heartbeats_sent,
            "heartbeat_acks": session.heartbeat_acks,
        }))
    }

    // ------------------------------------------------------------------
    // Orchestration surfaces
    // ------------------------------------------------------------------

    pub async fn context_snapshot(&self, id: &str) -> Result<serde_json::Value, SessionError> {
        if let Some(entry) = self.running.lock().await.get(id) {
            return Ok(entry.context.lock().snapshot());
        }
        let session = self.get_session(id).await?;
        session
            .context_snapshot
            .ok_or_else(|| SessionError::State {
                message: "session has no context".into(),
                current: session.status.as_str().into(),
            })
    }

    pub async fn context_set(
        &self,
        id: &str,
        key: &str,
        value: ContextValue,
    ) -> Result<(), SessionError> {
        let running = self.running.lock().await;
        let entry = running.get(id).ok_or_else(|| SessionError::State {
            message: "context can only be edited while running".into(),
            current: "stopped".into(),
        })?;
        entry.context.lock().set(key, value);
        Ok(())
    }

    pub async fn context_delete(&self, id: &str, key: &str) -> Result<bool, SessionError> {
        let running = self.running.lock().await;
        let entry = running.get(id).ok_or_else(|| SessionError::State {
            message: "context can only be edited while running".into(),
            current: "stopped".into(),
        })?;
        let deleted = entry.context.lock().delete(key);
        Ok(deleted)
    }

    /// Stage statuses for a running session.
    pub async fn stage_statuses(&self, id: &str) -> Result<serde_json::Value, SessionError> {
        let running = self.running.lock().await;
        let entry = running.get(id).ok_or_else(|| SessionError::NotFound(id.to_string()))?;
        let statuses = entry
            .stage_runner
            .as_ref()
            .map(|r| r.statuses())
            .unwrap_or_default();
        Ok(serde_json::Value::Array(
            statuses
                .iter()
                .map(|s| {
                    serde_json::json!({
                        "name": s.name,
                        "role": s.role,
                        "state": s.state.as_str(),
                        "attempts": s.attempts,
                        "error": s.error,
                        "exports_captured": s.exports_captured,
                        "exports_missing": s.exports_missing,
                    })
                })
                .collect(),
        ))
    }

    /// Re-run one stage on demand. Refused while the session is running.
    pub async fn rerun_stage(&self, id: &str, stage: &str) -> Result<(), SessionError> {
        if self.running.lock().await.contains_key(id) {
            return Err(SessionError::State {
                message: "stages cannot be re-run while the session is running".into(),
                current: "running".into(),
            });
        }
        let mut session = self.get_session(id).await?;
        let plugin = self.plugin(&session.config.protocol)?;
        let runner = StageRunner::new(
            id,
            &plugin.name,
            plugin.protocol_stack.clone().unwrap_or_default(),
            self.connections.clone(),
            self.connect_options(&session.config),
            session.connection_mode,
            Some(self.history.clone()),
        );
        let context = match &session.context_snapshot {
            Some(snapshot) => Arc::new(parking_lot::Mutex::new(ContextStore::restore(snapshot))),
            None => new_context_handle(),
        };
        runner
            .rerun_stage(stage, &context)
            .await
            .map_err(|e| SessionError::Initialization(e.to_string()))?;
        session.context_snapshot = Some(context.lock().snapshot());
        session.touch();
        self.connections.close_session(id).await;
        self.store
            .save(session)
            .await
            .map_err(|e| SessionError::Initialization(e.to_string()))?;
        Ok(())
    }

    pub async fn connection_status(&self, id: &str) -> Result<serde_json::Value, SessionError> {
        let session = self.get_session(id).await?;
        let stats = self
            .connections
            .transport_stats(id, session.connection_mode, session.current_stage.as_deref())
            .await;
        Ok(serde_json::json!({
            "session_id": id,
            "connection_mode": session.connection_mode.as_str(),
            "reconnect_count": session.reconnect_count,
            "transport": stats,
        }))
    }

    /// Manual reconnect, optionally re-running bootstrap on success.
    pub async fn reconnect(&self, id: &str, rebootstrap: bool) -> Result<(), SessionError> {
        let running = self.running.lock().await;
        let entry = running.get(id).ok_or_else(|| SessionError::State {
            message: "reconnect requires a running session".into(),
            current: "stopped".into(),
        })?;
        let (config, connection_mode, current) = {
            let live = entry.handle.read();
            (live.config.clone(), live.connection_mode, live.reconnect_count)
        };
        let stage = entry.handle.read().current_stage.clone();
        let options = self.connect_options(&config);
        let wants_rebootstrap = self
            .connections
            .reconnect(
                id,
                connection_mode,
                stage.as_deref(),
                &options,
                current,
                self.settings.max_reconnects,
                rebootstrap,
            )
            .await
            .map_err(|e| match e {
                TransportError::ConnectionAbort { .. } => SessionError::State {
                    message: e.to_string(),
                    current: "running".into(),
                },
                other => SessionError::Initialization(other.to_string()),
            })?;
        entry.handle.write().reconnect_count += 1;

        if wants_rebootstrap {
            if let Some(runner) = &entry.stage_runner {
                runner.reset_bootstrap_statuses();
                entry.context.lock().clear();
                runner
                    .run_bootstrap(&entry.context)
                    .await
                    .map_err(|e| SessionError::Initialization(e.to_string()))?;
            }
        }
        Ok(())
    }

    pub async fn heartbeat_status(&self, id: &str) -> Result<serde_json::Value, SessionError> {
        let running = self.running.lock().await;
        let entry = running.get(id).ok_or_else(|| SessionError::NotFound(id.to_string()))?;
        Ok(entry
            .heartbeat
            .as_ref()
            .map(|h| h.status())
            .unwrap_or_else(|| serde_json::json!({"enabled": false})))
    }

    pub async fn heartbeat_reset(&self, id: &str) -> Result<(), SessionError> {
        let running = self.running.lock().await;
        let entry = running.get(id).ok_or_else(|| SessionError::NotFound(id.to_string()))?;
        if let Some(heartbeat) = &entry.heartbeat {
            heartbeat.reset_failures();
        }
        Ok(())
    }

    /// Orchestrated replay against the recorded history.
    pub async fn replay(
        &self,
        request: &ReplayRequest,
    ) -> Result<ReplayReport, crate::error::ReplayError> {
        let session = self
            .get_session(&request.session_id)
            .await
            .map_err(|e| crate::error::ReplayError::Other(e.to_string()))?;
        let plugin = self
            .plugin(&session.config.protocol)
            .map_err(|e| crate::error::ReplayError::Other(e.to_string()))?;
        let executor = ReplayExecutor::new(self.history.clone(), self.connections.clone());
        executor
            .replay_up_to(request, &plugin, &self.connect_options(&session.config))
            .await
    }

    /// Reproduce specific recorded executions by sequence number.
    pub async fn replay_sequences(
        &self,
        session_id: &str,
        sequence_numbers: &[i64],
        delay_ms: u64,
        stop_on_error: bool,
    ) -> Result<ReplayReport, crate::error::ReplayError> {
        let session = self
            .get_session(session_id)
            .await
            .map_err(|e| crate::error::ReplayError::Other(e.to_string()))?;
        let executor = ReplayExecutor::new(self.history.clone(), self.connections.clone());
        executor
            .replay_sequences(
                session_id,
                sequence_numbers,
                delay_ms,
                stop_on_error,
                &self.connect_options(&session.config),
            )
            .await
    }

    pub fn history(&self) -> Arc<HistoryStore> {
        self.history.clone()
    }

    // ------------------------------------------------------------------
    // Agent endpoints
    // ------------------------------------------------------------------

    pub fn agent_register(
        &self,
        agent_id: &str,
        host: &str,
        port: u16,
        transport: TransportKind,
    ) -> AgentInfo {
        self.dispatcher.register_agent(agent_id, host, port, transport)
    }

    pub fn agent_heartbeat(
        &self,
        agent_id: &str,
        metrics: serde_json::Value,
    ) -> Result<(), crate::error::AgentError> {
        self.dispatcher.agent_heartbeat(agent_id, metrics)
    }

    pub fn agent_next_case(
        &self,
        host: &str,
        port: u16,
        transport: TransportKind,
    ) -> Option<AgentWorkItem> {
        self.dispatcher.next_case(host, port, transport)
    }

    /// Record an agent's asynchronous verdict: write the execution record
    /// and update session totals. Unknown test ids are dropped.
    pub async fn agent_submit_result(&self, result: AgentResult) -> bool {
        let Some(correlated) = self.dispatcher.submit_result(&result) else {
            warn!(test_case_id = %result.test_case_id, "result for unknown test dropped");
            return false;
        };

        let record = self
            .history
            .record(crate::history::RecordInput {
                session_id: correlated.session_id.clone(),
                protocol: correlated.protocol.clone(),
                test_case_id: Some(result.test_case_id.clone()),
                payload: correlated.payload.clone(),
                response: result.response.clone(),
                timestamp_sent: Some(correlated.enqueued_at),
                timestamp_response: Some(Utc::now()),
                duration_ms: Some(result.execution_time_ms),
                result: Some(result.result),
                ..Default::default()
            })
            .await;

        if result.result == TestCaseResult::Crash {
            let _ = self
                .crash_reporter
                .report(
                    &correlated.session_id,
                    record.sequence_number,
                    &correlated.payload,
                    Some("agent"),
                    &[],
                )
                .await;
        }

        if let Some(entry) = self.running.lock().await.get(&correlated.session_id) {
            entry.handle.write().stats.record(result.result);
        } else if let Ok(Some(mut session)) = self.store.load(&correlated.session_id).await {
            session.stats.record(result.result);
            let _ = self.store.save(session).await;
        }
        true
    }

    /// Stop every running session; used at process shutdown.
    pub async fn shutdown(&self) {
        let ids: Vec<String> = self.running.lock().await.keys().cloned().collect();
        for id in ids {
            if let Err(err) = self.stop_session(&id).await {
                warn!(session_id = %id, error = %err, "shutdown stop failed");
            }
        }
        self.connections.close_all().await;
        self.history.flush(5_000).await;
    }

    fn connect_options(&self, config: &SessionConfig) -> ConnectOptions {
        ConnectOptions {
            host: config.target_host.clone(),
            port: config.target_port,
            transport: config.transport,
            timeout_ms: config.timeout_ms,
            max_response_bytes: self.settings.max_response_bytes,
            buffer_size: self.settings.tcp_buffer_size,
        }
    }
}
