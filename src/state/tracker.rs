//! # Stateful Tracker
//!
//! Follows the protocol's declared state machine across a fuzzing session:
//! identifies what message type a payload encodes, matches it against the
//! transitions valid in the current state, moves the state on successful
//! sends, and keeps per-state visit and per-transition counters for
//! coverage reporting.

use crate::codec::ProtocolCodec;
use crate::plugin::{DataModel, StateModel, StateTransition};
use crate::session::TestCaseResult;
use chrono::{DateTime, Utc};
use rand::seq::SliceRandom;
use rand::Rng;
use std::collections::{BTreeMap, VecDeque};
use tracing::{debug, info, warn};

/// Ring size for the transition diagnostics history.
const HISTORY_LIMIT: usize = 256;

/// Probability of following the first-declared (happy path) transition
/// when several are valid.
const DEFAULT_PROGRESSION_WEIGHT: f64 = 0.8;

/// One attempted transition, kept for diagnostics.
#[derive(Debug, Clone)]
pub struct TransitionRecord {
    pub from: String,
    pub to: Option<String>,
    pub message_type: String,
    pub result: String,
    pub success: bool,
    pub at: DateTime<Utc>,
}

/// State machine tracker for one session.
pub struct StateTracker {
    state_model: StateModel,
    codec: ProtocolCodec,
    response_codec: Option<ProtocolCodec>,
    current_state: String,
    state_visits: BTreeMap<String, u64>,
    transition_counts: BTreeMap<String, u64>,
    history: VecDeque<TransitionRecord>,
    /// Block carrying the message type, and its value -> name map.
    message_type_field: Option<String>,
    type_to_command: BTreeMap<String, u64>,
    progression_weight: f64,
}

impl StateTracker {
    pub fn new(
        state_model: StateModel,
        data_model: DataModel,
        response_model: Option<DataModel>,
    ) -> Self {
        let (message_type_field, type_to_command) = build_type_mapping(&data_model);
        let mut state_visits: BTreeMap<String, u64> = state_model
            .states
            .iter()
            .map(|s| (s.clone(), 0))
            .collect();
        let initial = state_model.initial_state.clone();
        *state_visits.entry(initial.clone()).or_insert(0) += 1;

        info!(
            initial_state = %initial,
            states = state_model.states.len(),
            transitions = state_model.transitions.len(),
            "stateful tracker created"
        );

        Self {
            state_model,
            codec: ProtocolCodec::new(data_model),
            response_codec: response_model.map(ProtocolCodec::new),
            current_state: initial,
            state_visits,
            transition_counts: BTreeMap::new(),
            history: VecDeque::new(),
            message_type_field,
            type_to_command,
            progression_weight: DEFAULT_PROGRESSION_WEIGHT,
        }
    }

    pub fn current_state(&self) -> &str {
        &self.current_state
    }

    pub fn state_model(&self) -> &StateModel {
        &self.state_model
    }

    /// Transitions that can be taken from the current state.
    pub fn valid_transitions(&self) -> Vec<&StateTransition> {
        self.state_model
            .transitions_from(&self.current_state)
            .collect()
    }

    /// Pick a transition: the happy path (first declared) most of the
    /// time, any valid one otherwise.
    pub fn select_transition(&self) -> Option<&StateTransition> {
        let valid = self.valid_transitions();
        if valid.is_empty() {
            warn!(state = %self.current_state, "no valid transitions");
            return None;
        }
        if valid.len() == 1 {
            return Some(valid[0]);
        }
        let mut rng = rand::thread_rng();
        if rng.gen_bool(self.progression_weight) {
            Some(valid[0])
        } else {
            valid.choose(&mut rng).copied()
        }
    }

    /// Message type to send for the current state, or None in a terminal
    /// state.
    pub fn message_type_for_state(&self) -> Option<String> {
        self.select_transition()?.message_type.clone()
    }

    /// Decode a payload's message type via the declared command field.
    pub fn identify_message_type(&self, payload: &[u8]) -> Option<String> {
        let field = self.message_type_field.as_ref()?;
        let fields = self.codec.parse(payload).ok()?;
        let value = fields.get(field)?.as_u64()?;
        self.type_to_command
            .iter()
            .find(|(_, v)| **v == value)
            .map(|(name, _)| name.clone())
    }

    /// Numeric command value for a message type name.
    pub fn command_for_type(&self, message_type: &str) -> Option<u64> {
        self.type_to_command.get(message_type).copied()
    }

    /// Name of the block that carries the message type.
    pub fn message_type_field(&self) -> Option<&str> {
        self.message_type_field.as_deref()
    }

    /// Index of the first seed whose command field decodes to the given
    /// message type.
    pub fn find_seed_for_message_type(&self, message_type: &str, seeds: &[Vec<u8>]) -> Option<usize> {
        let command = self.command_for_type(message_type)?;
        let field = self.message_type_field.as_ref()?;
        for (i, seed) in seeds.iter().enumerate() {
            if let Ok(fields) = self.codec.parse(seed) {
                if fields.get(field).and_then(|v| v.as_u64()) == Some(command) {
                    return Some(i);
                }
            }
        }
        warn!(message_type, "no seed found for message type");
        None
    }

    /// Advance the state machine after an execution. Transitions fire only
    /// on a pass whose response (when an expectation is declared and
    /// identifiable) matches the expected message type.
    pub fn update_state(
        &mut self,
        sent: &[u8],
        response: Option<&[u8]>,
        result: TestCaseResult,
    ) {
        let Some(message_type) = self.identify_message_type(sent) else {
            debug!("cannot identify sent message type");
            return;
        };

        let Some(transition) = self
            .state_model
            .transitions
            .iter()
            .find(|t| {
                t.from == self.current_state
                    && t.message_type.as_deref() == Some(message_type.as_str())
            })
            .cloned()
        else {
            debug!(
                state = %self.current_state,
                message_type,
                "message has no transition from current state"
            );
            return;
        };

        let mut record = TransitionRecord {
            from: self.current_state.clone(),
            to: None,
            message_type: message_type.clone(),
            result: result.as_str().to_string(),
            success: false,
            at: Utc::now(),
        };

        if result == TestCaseResult::Pass {
            let response_matches = match (&transition.expected_response, response) {
                (Some(expected), Some(raw)) => self.response_matches(raw, expected),
                _ => true,
            };
            if response_matches {
                let old = std::mem::replace(&mut self.current_state, transition.to.clone());
                *self
                    .state_visits
                    .entry(self.current_state.clone())
                    .or_insert(0) += 1;
                *self
                    .transition_counts
                    .entry(format!("{old}->{}", self.current_state))
                    .or_insert(0) += 1;
                record.to = Some(self.current_state.clone());
                record.success = true;
                info!(
                    from = %old,
                    to = %self.current_state,
                    message_type,
                    "state transition"
                );
            } else {
                warn!(
                    state = %self.current_state,
                    message_type,
                    expected = ?transition.expected_response,
                    "unexpected response type, staying in state"
                );
            }
        }

        self.history.push_back(record);
        if self.history.len() > HISTORY_LIMIT {
            self.history.pop_front();
        }
    }

    fn response_matches(&self, response: &[u8], expected: &str) -> bool {
        match self.identify_response_type(response) {
            // Unidentifiable responses are accepted; only a positively
            // identified mismatch blocks the transition.
            None => true,
            Some(actual) => actual == expected,
        }
    }

    fn identify_response_type(&self, response: &[u8]) -> Option<String> {
        let codec = self.response_codec.as_ref()?;
        let fields = codec.parse(response).ok()?;
        for name in ["message_type", "command", "type", "msg_type"] {
            if let Some(value) = fields.get(name).and_then(|v| v.as_u64()) {
                if let Some(found) = self
                    .type_to_command
                    .iter()
                    .find(|(_, v)| **v == value)
                    .map(|(n, _)| n.clone())
                {
                    return Some(found);
                }
            }
        }
        None
    }

    /// True when the reset interval elapsed or the machine is stuck in a
    /// state with no valid transitions.
    pub fn should_reset(&self, iteration: u64, reset_interval: u64) -> bool {
        if reset_interval > 0 && iteration > 0 && iteration % reset_interval == 0 {
            return true;
        }
        self.valid_transitions().is_empty()
    }

    pub fn reset(&mut self) {
        let old = std::mem::replace(
            &mut self.current_state,
            self.state_model.initial_state.clone(),
        );
        *self
            .state_visits
            .entry(self.current_state.clone())
            .or_insert(0) += 1;
        info!(from = %old, to = %self.current_state, "state reset");
    }

    /// Restore position and counters when resuming a persisted session.
    pub fn restore(
        &mut self,
        current_state: &str,
        state_visits: &BTreeMap<String, u64>,
        transition_counts: &BTreeMap<String, u64>,
    ) {
        if self.state_model.states.iter().any(|s| s == current_state) {
            self.current_state = current_state.to_string();
        }
        for (k, v) in state_visits {
            self.state_visits.insert(k.clone(), *v);
        }
        self.transition_counts = transition_counts.clone();
    }

    pub fn state_coverage(&self) -> &BTreeMap<String, u64> {
        &self.state_visits
    }

    pub fn transition_coverage(&self) -> &BTreeMap<String, u64> {
        &self.transition_counts
    }

    /// States with no outgoing transitions.
    pub fn termination_states(&self) -> Vec<&str> {
        self.state_model.terminal_states()
    }

    /// Transitions whose destination is a terminal state.
    pub fn transitions_to_termination(&self) -> Vec<&StateTransition> {
        let terminal = self.termination_states();
        self.state_model
            .transitions
            .iter()
            .filter(|t| terminal.contains(&t.to.as_str()))
            .collect()
    }

    pub fn history(&self) -> &VecDeque<TransitionRecord> {
        &self.history
    }

    /// Aggregate coverage statistics for the session snapshot.
    pub fn coverage_stats(&self) -> serde_json::Value {
        let total_states = self.state_model.states.len();
        let visited = self.state_visits.values().filter(|c| **c > 0).count();
        let total_transitions = self.state_model.transitions.len();
        let taken = self.transition_counts.len();
        serde_json::json!({
            "current_state": self.current_state,
            "state_coverage": self.state_visits,
            "transition_coverage": self.transition_counts,
            "states_visited": visited,
            "states_total": total_states,
            "state_coverage_pct": percentage(visited, total_states),
            "transitions_taken": taken,
            "transitions_total": total_transitions,
            "transition_coverage_pct": percentage(taken, total_transitions),
        })
    }
}

fn percentage(part: usize, whole: usize) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64 * 100.0
    }
}

/// Find the block carrying the message type: a `command` or `message_type`
/// block with declared values, else the first enum-bearing block.
fn build_type_mapping(model: &DataModel) -> (Option<String>, BTreeMap<String, u64>) {
    let mut fallback: Option<&crate::plugin::Block> = None;
    for block in &model.blocks {
        let Some(values) = &block.values else { continue };
        if values.is_empty() {
            continue;
        }
        if block.name == "command" || block.name == "message_type" {
            fallback = Some(block);
            break;
        }
        if fallback.is_none() {
            fallback = Some(block);
        }
    }

    match fallback {
        Some(block) => {
            let mapping: BTreeMap<String, u64> = block
                .values
                .as_ref()
                .map(|values| values.iter().map(|(v, n)| (n.clone(), *v)).collect())
                .unwrap_or_default();
            debug!(field = %block.name, ?mapping, "message type mapping built");
            (Some(block.name.clone()), mapping)
        }
        None => (None, BTreeMap::new()),
    }
}
