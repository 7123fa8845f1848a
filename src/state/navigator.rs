//! # State Navigator
//!
//! Policy layer above the [`StateTracker`]: decides which seed to send
//! next given the fuzzing mode, injects termination tests so cleanup paths
//! get fuzzed too, and manages the periodic reset back to the initial
//! state.
//!
//! ## Modes
//!
//! - `breadth_first`: among valid transitions, drive toward the
//!   least-visited destination state
//! - `depth_first`: always take the first valid transition
//! - `targeted`: BFS the shortest path toward `target_state`, then behave
//!   like depth-first once there
//! - `random`: the tracker's default weighted selection

use super::tracker::StateTracker;
use crate::session::{FuzzingMode, TestCaseResult};
use std::collections::{HashSet, VecDeque};
use tracing::{debug, info};

/// Resolved navigation parameters for one session.
#[derive(Debug, Clone)]
pub struct NavigatorConfig {
    pub mode: FuzzingMode,
    pub target_state: Option<String>,
    /// Iterations between resets to the initial state.
    pub reset_interval: u64,
    pub termination_enabled: bool,
    /// Iterations before a reset boundary inside which termination tests
    /// are injected.
    pub termination_window: u64,
    pub termination_interval: u64,
}

/// Result of the post-execution update.
#[derive(Debug, Clone)]
pub struct NavigatorUpdate {
    pub current_state: String,
    pub reset_performed: bool,
    pub termination_reset_pending: bool,
}

/// Mode-driven seed selection over a state tracker.
pub struct StateNavigator {
    tracker: StateTracker,
    config: NavigatorConfig,
    termination_reset_pending: bool,
    termination_tests: u64,
}

impl StateNavigator {
    pub fn new(tracker: StateTracker, config: NavigatorConfig) -> Self {
        Self {
            tracker,
            config,
            termination_reset_pending: false,
            termination_tests: 0,
        }
    }

    pub fn tracker(&self) -> &StateTracker {
        &self.tracker
    }

    pub fn tracker_mut(&mut self) -> &mut StateTracker {
        &mut self.tracker
    }

    pub fn current_state(&self) -> &str {
        self.tracker.current_state()
    }

    pub fn termination_tests(&self) -> u64 {
        self.termination_tests
    }

    pub fn termination_reset_pending(&self) -> bool {
        self.termination_reset_pending
    }

    /// Whether this iteration should drive toward a terminal state instead
    /// of fuzzing forward. Sets the pending flag as a side effect.
    pub fn should_inject_termination(&mut self, iteration: u64) -> bool {
        if !self.config.termination_enabled {
            return false;
        }
        if self.termination_reset_pending {
            return true;
        }
        if self.tracker.transitions_to_termination().is_empty() {
            return false;
        }

        let reset_interval = self.config.reset_interval;
        let tests_until_reset = if reset_interval > 0 {
            reset_interval - (iteration % reset_interval)
        } else {
            u64::MAX
        };
        if tests_until_reset <= self.config.termination_window {
            self.termination_reset_pending = true;
            return true;
        }

        // Also fire periodically, scaled down for short reset intervals.
        let periodic = if reset_interval > 0 {
            self.config
                .termination_interval
                .min((reset_interval / 2).max(10))
        } else {
            self.config.termination_interval
        };
        if periodic > 0 && iteration > 0 && iteration % periodic == 0 {
            self.termination_reset_pending = true;
            return true;
        }

        false
    }

    /// Seed index driving toward a terminal state: a direct termination
    /// transition from the current state when one exists, else a step
    /// toward some state that has one.
    pub fn select_termination_seed(&mut self, seeds: &[Vec<u8>]) -> Option<usize> {
        let transitions: Vec<(String, Option<String>, String)> = self
            .tracker
            .transitions_to_termination()
            .iter()
            .map(|t| (t.from.clone(), t.message_type.clone(), t.to.clone()))
            .collect();
        if transitions.is_empty() {
            return None;
        }
        let current = self.tracker.current_state().to_string();

        for (from, message_type, to) in &transitions {
            if from != &current {
                continue;
            }
            let Some(message_type) = message_type else { continue };
            if let Some(idx) = self.tracker.find_seed_for_message_type(message_type, seeds) {
                info!(
                    current_state = %current,
                    message_type,
                    target_state = %to,
                    "termination test selected"
                );
                self.termination_tests += 1;
                return Some(idx);
            }
        }

        // No direct path: navigate toward an intermediate state that can
        // reach termination.
        for (from, _, _) in &transitions {
            if from == &current {
                continue;
            }
            if let Some(step) = self.find_path_to_state(from) {
                if let Some(idx) = self.tracker.find_seed_for_message_type(&step, seeds) {
                    debug!(
                        current_state = %current,
                        intermediate_target = %from,
                        "navigating toward termination"
                    );
                    return Some(idx);
                }
            }
        }

        None
    }

    /// Mode-specific seed selection. None means the caller should fall
    /// back to round-robin.
    pub fn select_seed_for_mode(&self, seeds: &[Vec<u8>]) -> Option<usize> {
        match self.config.mode {
            FuzzingMode::BreadthFirst => self.select_breadth_first(seeds),
            FuzzingMode::DepthFirst => self.select_depth_first(seeds),
            FuzzingMode::Targeted => self.select_targeted(seeds),
            FuzzingMode::Random => {
                let message_type = self.tracker.message_type_for_state()?;
                self.tracker.find_seed_for_message_type(&message_type, seeds)
            }
        }
    }

    fn select_breadth_first(&self, seeds: &[Vec<u8>]) -> Option<usize> {
        let valid = self.tracker.valid_transitions();
        let coverage = self.tracker.state_coverage();
        let best = valid
            .iter()
            .min_by_key(|t| coverage.get(&t.to).copied().unwrap_or(0))?;
        let message_type = best.message_type.clone()?;
        self.tracker.find_seed_for_message_type(&message_type, seeds)
    }

    fn select_depth_first(&self, seeds: &[Vec<u8>]) -> Option<usize> {
        let first = self.tracker.valid_transitions().into_iter().next()?;
        let message_type = first.message_type.clone()?;
        self.tracker.find_seed_for_message_type(&message_type, seeds)
    }

    fn select_targeted(&self, seeds: &[Vec<u8>]) -> Option<usize> {
        let target = self.config.target_state.as_deref()?;
        if self.tracker.current_state() != target {
            let step = self.find_path_to_state(target)?;
            return self.tracker.find_seed_for_message_type(&step, seeds);
        }
        self.select_depth_first(seeds)
    }

    /// BFS over the transition graph: the message type of the first step
    /// on the shortest path to `target`.
    pub fn find_path_to_state(&self, target: &str) -> Option<String> {
        let current = self.tracker.current_state();
        if current == target {
            return self.tracker.message_type_for_state();
        }

        let transitions = &self.tracker.state_model().transitions;
        let mut queue: VecDeque<(String, Option<String>)> = VecDeque::new();
        let mut visited: HashSet<String> = HashSet::new();
        queue.push_back((current.to_string(), None));
        visited.insert(current.to_string());

        while let Some((state, first_step)) = queue.pop_front() {
            for t in transitions.iter().filter(|t| t.from == state) {
                if visited.contains(&t.to) {
                    continue;
                }
                let step = first_step.clone().or_else(|| t.message_type.clone());
                if t.to == target {
                    return step;
                }
                visited.insert(t.to.clone());
                queue.push_back((t.to.clone(), step));
            }
        }
        None
    }

    /// Post-execution bookkeeping: advance the tracker, then apply
    /// termination and periodic reset policy.
    pub fn update_after_execution(
        &mut self,
        sent: &[u8],
        response: Option<&[u8]>,
        result: TestCaseResult,
        iteration: u64,
    ) -> NavigatorUpdate {
        self.tracker.update_state(sent, response, result);

        let mut reset_performed = false;

        if self.termination_reset_pending {
            let at_terminal = self
                .tracker
                .termination_states()
                .contains(&self.tracker.current_state());
            if at_terminal {
                info!(
                    state = %self.tracker.current_state(),
                    iteration,
                    "termination state reached, resetting"
                );
                self.termination_reset_pending = false;
                self.tracker.reset();
                reset_performed = true;
            }
        }

        if !reset_performed
            && self
                .tracker
                .should_reset(iteration, self.config.reset_interval)
        {
            if self.termination_reset_pending {
                // Hold the periodic reset until the termination test lands.
                debug!(iteration, "reset deferred for pending termination test");
            } else {
                debug!(iteration, "periodic state reset");
                self.tracker.reset();
                reset_performed = true;
            }
        }

        NavigatorUpdate {
            current_state: self.tracker.current_state().to_string(),
            reset_performed,
            termination_reset_pending: self.termination_reset_pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::{Block, BlockType, DataModel, SizeOf, StateModel, StateTransition};

    fn data_model() -> DataModel {
        let mut magic = Block::new("magic", BlockType::Bytes);
        magic.size = Some(4);
        magic.mutable = false;
        let mut length = Block::new("length", BlockType::Uint32);
        length.is_size_field = true;
        length.size_of = Some(SizeOf::One("payload".into()));
        let mut command = Block::new("command", BlockType::Uint8);
        command.values = Some(
            [
                (1u64, "AUTH".to_string()),
                (2, "DATA".to_string()),
                (3, "QUIT".to_string()),
            ]
            .into_iter()
            .collect(),
        );
        let mut payload = Block::new("payload", BlockType::Bytes);
        payload.max_size = Some(1024);
        DataModel {
            name: None,
            description: None,
            blocks: vec![magic, length, command, payload],
            seeds: Vec::new(),
        }
    }

    fn state_model() -> StateModel {
        StateModel {
            initial_state: "INIT".into(),
            states: vec!["INIT".into(), "READY".into(), "CLOSED".into()],
            transitions: vec![
                StateTransition {
                    from: "INIT".into(),
                    to: "READY".into(),
                    message_type: Some("AUTH".into()),
                    expected_response: None,
                    trigger: None,
                },
                StateTransition {
                    from: "READY".into(),
                    to: "READY".into(),
                    message_type: Some("DATA".into()),
                    expected_response: None,
                    trigger: None,
                },
                StateTransition {
                    from: "READY".into(),
                    to: "CLOSED".into(),
                    message_type: Some("QUIT".into()),
                    expected_response: None,
                    trigger: None,
                },
            ],
        }
    }

    fn seeds() -> Vec<Vec<u8>> {
        vec![
            b"STCP\x00\x00\x00\x05\x01HELLO".to_vec(), // AUTH
            b"STCP\x00\x00\x00\x04\x02TEST".to_vec(),  // DATA
            b"STCP\x00\x00\x00\x00\x03".to_vec(),      // QUIT
        ]
    }

    fn navigator(mode: FuzzingMode, termination: bool, reset_interval: u64) -> StateNavigator {
        let tracker = StateTracker::new(state_model(), data_model(), None);
        StateNavigator::new(
            tracker,
            NavigatorConfig {
                mode,
                target_state: None,
                reset_interval,
                termination_enabled: termination,
                termination_window: 2,
                termination_interval: 50,
            },
        )
    }

    #[test]
    fn depth_first_takes_first_transition() {
        let nav = navigator(FuzzingMode::DepthFirst, false, 100);
        assert_eq!(nav.select_seed_for_mode(&seeds()), Some(0)); // AUTH from INIT
    }

    #[test]
    fn breadth_first_prefers_least_visited() {
        let mut nav = navigator(FuzzingMode::BreadthFirst, false, 100);
        nav.tracker_mut()
            .update_state(&seeds()[0], None, TestCaseResult::Pass);
        assert_eq!(nav.current_state(), "READY");
        // READY has one visit, CLOSED has zero: prefer QUIT toward CLOSED.
        assert_eq!(nav.select_seed_for_mode(&seeds()), Some(2));
    }

    #[test]
    fn targeted_walks_shortest_path() {
        let tracker = StateTracker::new(state_model(), data_model(), None);
        let nav = StateNavigator::new(
            tracker,
            NavigatorConfig {
                mode: FuzzingMode::Targeted,
                target_state: Some("CLOSED".into()),
                reset_interval: 100,
                termination_enabled: false,
                termination_window: 2,
                termination_interval: 50,
            },
        );
        // From INIT the first step toward CLOSED is AUTH.
        assert_eq!(nav.select_seed_for_mode(&seeds()), Some(0));
        assert_eq!(nav.find_path_to_state("CLOSED").as_deref(), Some("AUTH"));
    }

    #[test]
    fn termination_injection_near_reset_boundary() {
        // Reset interval 10, window 2: at iteration 9 a termination test is
        // due, and after reaching CLOSED the navigator resets to INIT.
        let mut nav = navigator(FuzzingMode::Random, true, 10);
        nav.tracker_mut()
            .update_state(&seeds()[0], None, TestCaseResult::Pass);
        assert_eq!(nav.current_state(), "READY");

        assert!(!nav.should_inject_termination(5));
        assert!(nav.should_inject_termination(9));
        assert!(nav.termination_reset_pending());

        let idx = nav.select_termination_seed(&seeds()).unwrap();
        assert_eq!(idx, 2); // QUIT

        let update = nav.update_after_execution(&seeds()[2], None, TestCaseResult::Pass, 9);
        assert!(update.reset_performed);
        assert!(!update.termination_reset_pending);
        assert_eq!(update.current_state, "INIT");
        assert_eq!(nav.termination_tests(), 1);
    }

    #[test]
    fn termination_navigates_via_intermediate_state() {
        let mut nav = navigator(FuzzingMode::Random, true, 10);
        // From INIT there is no direct termination transition; the QUIT
        // edge starts at READY, so the navigator steps toward READY first.
        assert_eq!(nav.current_state(), "INIT");
        let idx = nav.select_termination_seed(&seeds()).unwrap();
        assert_eq!(idx, 0); // AUTH moves toward READY
    }

    #[test]
    fn periodic_reset_fires_on_interval() {
        let mut nav = navigator(FuzzingMode::Random, false, 5);
        nav.tracker_mut()
            .update_state(&seeds()[0], None, TestCaseResult::Pass);
        let update = nav.update_after_execution(&seeds()[1], None, TestCaseResult::Pass, 5);
        assert!(update.reset_performed);
        assert_eq!(update.current_state, "INIT");
    }

    #[test]
    fn terminal_state_forces_reset_regardless_of_interval() {
        let mut nav = navigator(FuzzingMode::Random, false, 1000);
        nav.tracker_mut()
            .update_state(&seeds()[0], None, TestCaseResult::Pass);
        let update = nav.update_after_execution(&seeds()[2], None, TestCaseResult::Pass, 3);
        assert!(update.reset_performed);
        assert_eq!(update.current_state, "INIT");
    }
}
