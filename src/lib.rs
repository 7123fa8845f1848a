//! # Protofuzz
//!
//! A stateful network protocol fuzzing engine. Protocols are described by
//! declarative plugin bundles (data models with bit-level fields,
//! auto-computed lengths and checksums, state machines, orchestrated
//! bootstrap stages) and driven over TCP or UDP with grammar-aware
//! mutation, persistent-connection management, heartbeats, and a durable
//! execution history that supports byte-exact replay.

pub mod codec;
pub mod config;
pub mod engine;
pub mod error;
pub mod history;
pub mod mutation;
pub mod plugin;
pub mod session;
pub mod state;
pub mod transport;

pub use codec::{FieldMap, FieldValue, ProtocolCodec};
pub use config::Settings;
pub use engine::SessionManager;
pub use error::FuzzerError;
pub use history::HistoryStore;
pub use mutation::MutationEngine;
pub use plugin::PluginBundle;
pub use session::{Session, SessionConfig, SessionStatus, TestCaseResult};

/// The current version of the fuzzer core.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration values
pub mod defaults {
    /// Default per-test timeout in milliseconds.
    pub const TIMEOUT_MS: u64 = 5_000;

    /// Default response size cap in bytes.
    pub const MAX_RESPONSE_BYTES: usize = 1024 * 1024;

    /// Default structure-aware share of hybrid mutation, in percent.
    pub const STRUCTURE_AWARE_WEIGHT: u32 = 70;

    /// Default checkpoint cadence in iterations.
    pub const CHECKPOINT_FREQUENCY: u64 = 100;

    /// Default in-memory execution cache size.
    pub const EXECUTION_CACHE_SIZE: usize = 100;
}
