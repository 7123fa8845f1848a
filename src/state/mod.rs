//! State-machine-aware fuzzing: the [`tracker`] follows the declared
//! protocol state machine and the [`navigator`] layers seed-selection
//! policy (breadth-first, depth-first, targeted, termination fuzzing) on
//! top of it.

pub mod navigator;
pub mod tracker;

pub use navigator::{NavigatorConfig, StateNavigator};
pub use tracker::StateTracker;
