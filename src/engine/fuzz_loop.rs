//! # Fuzzing Loop
//!
//! The central iteration driver for one session. Every iteration drains a
//! planned follow-up or mutates a seed, enforces the seed's message type
//! so mutators cannot silently change a message's semantic class, injects
//! context values and field behaviors, executes against the target,
//! records the execution, and feeds the outcome back into the state
//! navigator and response planner.
//!
//! The loop is cooperative: it observes a stop signal and the session's
//! status every iteration, checkpoints on a fixed cadence, honors the
//! configured rate limit, and yields ~1 ms when unlimited so the runtime
//! stays responsive.

use crate::config::Settings;
use crate::engine::agent::{AgentDispatcher, AgentWorkItem};
use crate::engine::behavior::{BehaviorProcessor, BehaviorState};
use crate::engine::crash::CrashReporter;
use crate::engine::executor::{ExecutionTarget, TestExecutor};
use crate::engine::planner::ResponsePlanner;
use crate::error::SessionError;
use crate::codec::ProtocolCodec;
use crate::history::{HistoryStore, RecordInput};
use crate::mutation::{MutationEngine, MutationMode};
use crate::plugin::PluginBundle;
use crate::session::context::ContextHandle;
use crate::session::store::SessionStore;
use crate::session::{ExecutionMode, SessionHandle, SessionStatus, TestCaseResult};
use crate::state::{NavigatorConfig, StateNavigator, StateTracker};
use crate::transport::manager::{ConnectOptions, ConnectionManager};
use chrono::Utc;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Wiring for one session's loop.
pub struct FuzzLoopParams {
    pub settings: Settings,
    pub plugin: Arc<PluginBundle>,
    pub session: SessionHandle,
    pub context: ContextHandle,
    pub manager: Arc<ConnectionManager>,
    pub history: Arc<HistoryStore>,
    pub store: SessionStore,
    pub crash_reporter: Arc<CrashReporter>,
    pub agent: Option<Arc<AgentDispatcher>>,
    pub stop: watch::Receiver<bool>,
}

/// One session's running fuzz loop.
pub struct FuzzingLoop {
    params: FuzzLoopParams,
    session_id: String,
    seeds: Vec<Vec<u8>>,
    engine: MutationEngine,
    codec: ProtocolCodec,
    navigator: Option<StateNavigator>,
    behaviors: BehaviorProcessor,
    behavior_state: BehaviorState,
    planner: Option<ResponsePlanner>,
    followups: VecDeque<Vec<u8>>,
    executor: TestExecutor,
    target: ExecutionTarget,
    refused_reported: bool,
}

impl FuzzingLoop {
    /// Resolve models, seeds, mutators, and the navigator. Fails the
    /// session when no seeds are available.
    pub fn initialize(params: FuzzLoopParams) -> Result<Self, SessionError> {
        let plugin = params.plugin.clone();
        let model = plugin.effective_data_model().clone();
        let (session_id, config, connection_mode, resumed_state, resumed_coverage) = {
            let session = params.session.read();
            (
                session.id.clone(),
                session.config.clone(),
                session.connection_mode,
                session.current_state.clone(),
                session.coverage.clone(),
            )
        };

        // Seed corpus: the fuzz-target model's seeds, falling back to the
        // plugin's top-level seeds.
        let mut seeds = model
            .decoded_seeds()
            .map_err(|e| SessionError::Initialization(e.to_string()))?;
        if seeds.is_empty() {
            seeds = plugin
                .data_model
                .decoded_seeds()
                .map_err(|e| SessionError::Initialization(e.to_string()))?;
        }
        if seeds.is_empty() {
            return Err(SessionError::Initialization(format!(
                "no seeds available for protocol '{}'",
                plugin.name
            )));
        }

        let mode = MutationMode::parse(
            config
                .mutation_mode
                .as_deref()
                .unwrap_or(&params.settings.mutation_mode),
        );
        let weight = config
            .structure_aware_weight
            .unwrap_or(params.settings.structure_aware_weight);
        let engine = MutationEngine::new(
            seeds.clone(),
            &config.enabled_mutators,
            Some(model.clone()),
            mode,
            weight,
            params.settings.fallback_on_parse_error,
        );

        let navigator = plugin.state_model.as_ref().map(|state_model| {
            let mut tracker = StateTracker::new(
                state_model.clone(),
                model.clone(),
                plugin.effective_response_model().cloned(),
            );
            // Resume position and coverage from a persisted session.
            if let Some(state) = &resumed_state {
                tracker.restore(
                    state,
                    &resumed_coverage.state_coverage,
                    &resumed_coverage.transition_coverage,
                );
            }
            let reset_interval = config.reset_interval.unwrap_or_else(|| {
                params
                    .settings
                    .reset_interval_for_mode(config.fuzzing_mode.as_str())
            });
            StateNavigator::new(
                tracker,
                NavigatorConfig {
                    mode: config.fuzzing_mode,
                    target_state: config.target_state.clone(),
                    reset_interval,
                    termination_enabled: config.enable_termination_fuzzing,
                    termination_window: params.settings.termination_test_window,
                    termination_interval: params.settings.termination_test_interval,
                },
            )
        });

        let behaviors = BehaviorProcessor::new(&model);
        let behavior_state = behaviors.initial_state();

        let planner = if plugin.response_handlers.is_empty() {
            None
        } else {
            Some(ResponsePlanner::new(
                model.clone(),
                plugin.effective_response_model().cloned(),
                plugin.response_handlers.clone(),
            ))
        };

        let response_check = plugin
            .response_check()
            .map_err(|e| SessionError::Initialization(e.to_string()))?;
        let executor = TestExecutor::new(params.manager.clone(), response_check);

        let target = ExecutionTarget {
            session_id: session_id.clone(),
            options: ConnectOptions {
                host: config.target_host.clone(),
                port: config.target_port,
                transport: config.transport,
                timeout_ms: config.timeout_ms,
                max_response_bytes: params.settings.max_response_bytes,
                buffer_size: params.settings.tcp_buffer_size,
            },
            connection_mode,
            stage_name: plugin.fuzz_target_stage().map(|s| s.name.clone()),
            orchestrated: plugin.protocol_stack.is_some(),
        };

        info!(
            session_id = %session_id,
            seeds = seeds.len(),
            stateful = navigator.is_some(),
            orchestrated = target.orchestrated,
            "fuzzing loop initialized"
        );

        Ok(Self {
            params,
            session_id,
            seeds,
            engine,
            codec: ProtocolCodec::new(model),
            navigator,
            behaviors,
            behavior_state,
            planner,
            followups: VecDeque::new(),
            executor,
            target,
            refused_reported: false,
        })
    }

    /// Drive iterations until the session leaves `running` or the stop
    /// signal fires.
    pub async fn run(mut self) {
        let checkpoint_frequency = self.params.settings.checkpoint_frequency.max(1);
        let mut last_send = Instant::now() - Duration::from_secs(1);

        loop {
            if *self.params.stop.borrow() {
                break;
            }
            let (status, iteration, config) = {
                let session = self.params.session.read();
                (session.status, session.iterations, session.config.clone())
            };
            if status != SessionStatus::Running {
                break;
            }

            let termination_due = self
                .navigator
                .as_mut()
                .map(|nav| nav.should_inject_termination(iteration))
                .unwrap_or(false);

            // Planned follow-ups go first, unless a termination test is due.
            let (payload, from_followup) = match (termination_due, self.followups.pop_front()) {
                (false, Some(followup)) => (followup, true),
                (_, maybe) => {
                    if let Some(queued) = maybe {
                        // A termination test preempted it; keep it queued.
                        self.followups.push_front(queued);
                    }
                    (self.generate_payload(iteration, termination_due), false)
                }
            };

            let payload = self.prepare_payload(payload);
            self.count_field_mutation(from_followup);

            // Rate limiting ahead of the send keeps heartbeat and target
            // pacing intact even when responses return instantly.
            self.enforce_rate_limit(&config.rate_limit_per_second, &mut last_send)
                .await;

            if config.execution_mode == ExecutionMode::Agent {
                self.dispatch_to_agent(&config, payload).await;
            } else {
                self.execute_and_record(payload, from_followup, iteration)
                    .await;
            }

            let completed = {
                let mut session = self.params.session.write();
                session.iterations += 1;
                session.touch();
                session.iterations
            };

            if completed % checkpoint_frequency == 0 {
                self.checkpoint().await;
            }

            if let Some(max) = config.max_iterations {
                if completed >= max {
                    info!(session_id = %self.session_id, max, "iteration cap reached");
                    let mut session = self.params.session.write();
                    session.status = SessionStatus::Completed;
                    session.stopped_at = Some(Utc::now());
                    break;
                }
            }
        }

        self.finalize().await;
    }

    fn generate_payload(&mut self, iteration: u64, termination_due: bool) -> Vec<u8> {
        let seed_index = self.choose_seed(iteration, termination_due);
        let seed = self.seeds[seed_index].clone();
        let mutated = self.engine.generate(&seed);
        self.enforce_message_type(&seed, mutated)
    }

    fn choose_seed(&mut self, iteration: u64, termination_due: bool) -> usize {
        if let Some(nav) = &mut self.navigator {
            let choice = if termination_due {
                nav.select_termination_seed(&self.seeds)
            } else {
                nav.select_seed_for_mode(&self.seeds)
            };
            if let Some(index) = choice {
                return index;
            }
            debug!("navigator produced no seed, falling back to round-robin");
        }
        (iteration as usize) % self.seeds.len()
    }

    /// Re-impose the seed's command value on the mutated payload so the
    /// mutation cannot silently change the message's semantic class.
    fn enforce_message_type(&self, seed: &[u8], mutated: Vec<u8>) -> Vec<u8> {
        let Some(nav) = &self.navigator else {
            return mutated;
        };
        let Some(field) = nav.tracker().message_type_field() else {
            return mutated;
        };
        let Ok(seed_fields) = self.codec.parse(seed) else {
            return mutated;
        };
        let Some(command) = seed_fields.get(field).cloned() else {
            return mutated;
        };
        let Ok(mut fields) = self.codec.parse(&mutated) else {
            return mutated;
        };
        fields.insert(field.to_string(), command);
        match self.codec.serialize(&fields, None) {
            Ok(fixed) => fixed,
            Err(_) => mutated,
        }
    }

    /// Context injection plus behavior processing.
    fn prepare_payload(&mut self, payload: Vec<u8>) -> Vec<u8> {
        let payload = if self.target.orchestrated {
            self.inject_context(payload)
        } else {
            payload
        };
        if self.behaviors.has_behaviors() {
            self.behaviors.apply(&payload, &mut self.behavior_state)
        } else {
            payload
        }
    }

    /// Refresh `from_context` fields with current context values by
    /// stripping them from the parsed map and re-serializing.
    fn inject_context(&self, payload: Vec<u8>) -> Vec<u8> {
        let has_context_fields = self
            .codec
            .model()
            .blocks
            .iter()
            .any(|b| b.from_context.is_some());
        if !has_context_fields {
            return payload;
        }
        let Ok(mut fields) = self.codec.parse(&payload) else {
            return payload;
        };
        for block in &self.codec.model().blocks {
            if block.from_context.is_some() {
                fields.remove(&block.name);
            }
        }
        let snapshot = self.params.context.lock().deep_copy();
        match self.codec.serialize(&fields, Some(&snapshot)) {
            Ok(injected) => injected,
            Err(err) => {
                debug!(error = %err, "context injection failed, sending as-is");
                payload
            }
        }
    }

    fn count_field_mutation(&self, from_followup: bool) {
        if from_followup {
            return;
        }
        if let Some(field) = &self.engine.last_metadata().field {
            let mut session = self.params.session.write();
            *session
                .stats
                .field_mutation_counts
                .entry(field.clone())
                .or_insert(0) += 1;
        }
    }

    async fn execute_and_record(&mut self, payload: Vec<u8>, from_followup: bool, iteration: u64) {
        let state_at_send = self
            .navigator
            .as_ref()
            .map(|nav| nav.current_state().to_string());
        let message_type = self
            .navigator
            .as_ref()
            .and_then(|nav| nav.tracker().identify_message_type(&payload));

        let sent_at = Utc::now();
        let outcome = self.executor.execute(&self.target, &payload).await;

        // The first refused connection stores targeted guidance on the
        // session; later ones just count.
        if let Some(error) = &outcome.error {
            if outcome.result == TestCaseResult::Crash
                && error.contains("Connection refused")
                && !self.refused_reported
            {
                self.refused_reported = true;
                self.params.session.write().append_error(error);
            }
        }

        let meta = self.engine.last_metadata().clone();
        let (strategy, mutators) = if from_followup {
            (Some("response_handler".to_string()), Vec::new())
        } else {
            (meta.strategy.clone(), meta.mutators.clone())
        };

        let context_snapshot = if self.target.orchestrated {
            Some(self.params.context.lock().snapshot())
        } else {
            None
        };
        let parsed_fields = self.codec.parse(&payload).ok().map(|fields| {
            serde_json::Value::Object(
                fields
                    .iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect(),
            )
        });

        let record = self
            .params
            .history
            .record(RecordInput {
                session_id: self.session_id.clone(),
                protocol: self.params.plugin.name.clone(),
                payload: payload.clone(),
                response: outcome.response.clone(),
                timestamp_sent: Some(sent_at),
                timestamp_response: outcome.response.as_ref().map(|_| Utc::now()),
                duration_ms: Some(outcome.duration_ms),
                result: Some(outcome.result),
                message_type,
                state_at_send,
                mutation_strategy: strategy.clone(),
                mutators_applied: mutators.clone(),
                stage_name: self.target.stage_name.clone(),
                context_snapshot,
                parsed_fields,
                connection_sequence: outcome.connection_sequence,
                ..Default::default()
            })
            .await;

        // Non-pass verdicts surface on the operator stream, colored by the
        // result field.
        if outcome.result != TestCaseResult::Pass {
            info!(
                session_id = %self.session_id,
                sequence = record.sequence_number,
                result = outcome.result.as_str(),
                "finding recorded"
            );
        }

        // Matching responses can enqueue follow-ups for the next iteration.
        if let Some(planner) = &self.planner {
            for followup in planner.plan(outcome.response.as_deref()) {
                debug!(handler = %followup.handler, "follow-up queued");
                self.followups.push_back(followup.payload);
            }
        }

        {
            let mut session = self.params.session.write();
            session.stats.record(outcome.result);
            session.stats.tests_since_last_reset += 1;
        }

        self.update_navigator(&payload, &outcome.response, outcome.result, iteration + 1);

        if outcome.result == TestCaseResult::Crash {
            let crash = self
                .params
                .crash_reporter
                .report(
                    &self.session_id,
                    record.sequence_number,
                    &payload,
                    strategy.as_deref(),
                    &mutators,
                )
                .await;
            if let Err(err) = crash {
                error!(error = %err, "failed to persist crash reproducer");
            }
        }
    }

    fn update_navigator(
        &mut self,
        payload: &[u8],
        response: &Option<Vec<u8>>,
        result: TestCaseResult,
        completed: u64,
    ) {
        let Some(nav) = &mut self.navigator else { return };
        let update = nav.update_after_execution(payload, response.as_deref(), result, completed);

        let mut session = self.params.session.write();
        session.current_state = Some(update.current_state);
        session.termination_reset_pending = update.termination_reset_pending;
        session.coverage.state_coverage = nav.tracker().state_coverage().clone();
        session.coverage.transition_coverage = nav.tracker().transition_coverage().clone();
        session.stats.termination_tests = nav.termination_tests();
        if update.reset_performed {
            session.stats.session_resets += 1;
            session.stats.tests_since_last_reset = 0;
        }
    }

    /// Agent mode: package the payload as a work item and move on. The
    /// result returns asynchronously and is correlated by test-case id.
    async fn dispatch_to_agent(&mut self, config: &crate::session::SessionConfig, payload: Vec<u8>) {
        let Some(dispatcher) = &self.params.agent else {
            warn!("agent execution requested but no dispatcher is wired");
            return;
        };
        let item = AgentWorkItem {
            session_id: self.session_id.clone(),
            test_case_id: uuid::Uuid::new_v4().to_string(),
            protocol: self.params.plugin.name.clone(),
            target_host: config.target_host.clone(),
            target_port: config.target_port,
            transport: config.transport,
            data: payload,
            timeout_ms: config.timeout_ms,
        };
        if let Err(err) = dispatcher.enqueue(item) {
            warn!(error = %err, "agent queue rejected work item");
            self.params
                .session
                .write()
                .stats
                .record(TestCaseResult::ResourceExhaustion);
        }
    }

    async fn enforce_rate_limit(&self, rate: &Option<u32>, last_send: &mut Instant) {
        match rate {
            Some(rate) if *rate > 0 => {
                let min_gap = Duration::from_micros(1_000_000 / *rate as u64);
                let elapsed = last_send.elapsed();
                if elapsed < min_gap {
                    tokio::time::sleep(min_gap - elapsed).await;
                }
                *last_send = Instant::now();
            }
            _ => {
                // Cooperative yield so an unlimited loop cannot starve the
                // runtime.
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        }
    }

    async fn checkpoint(&self) {
        let snapshot = {
            let mut session = self.params.session.write();
            if self.target.orchestrated {
                session.context_snapshot = Some(self.params.context.lock().snapshot());
            }
            session.clone()
        };
        if let Err(err) = self.params.store.save(snapshot).await {
            error!(error = %err, "session checkpoint failed");
        }
    }

    /// Shutdown path: final coverage snapshot, pending agent work cleared,
    /// history flushed, session checkpointed.
    async fn finalize(&mut self) {
        if let Some(nav) = &self.navigator {
            let stats = nav.tracker().coverage_stats();
            self.params.session.write().coverage.snapshot = Some(stats);
        }
        if let Some(dispatcher) = &self.params.agent {
            dispatcher.clear_session(&self.session_id);
        }
        self.params.history.flush(5_000).await;
        self.checkpoint().await;
        info!(session_id = %self.session_id, "fuzzing loop finished");
    }
}
