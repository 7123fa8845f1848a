//! # Protocol Plugin Bundles
//!
//! A plugin is a declarative, versioned document describing one protocol:
//! the request data model, an optional response model, an optional state
//! machine, declarative response handlers, an orchestrated protocol stack,
//! and connection/heartbeat behavior. Bundles are loaded from JSON, fully
//! validated up front, and immutable afterwards. There is no runtime
//! reflection; anything dynamic (like response validation) is a named check
//! resolved from a registry at load time.
//!
//! ## Serialized form
//!
//! Embedded byte values (block defaults, seeds, heartbeat payloads) are
//! base64 strings in the document and are re-hydrated during load.

use crate::codec::FieldValue;
use crate::error::PluginError;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Wire transport for a protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Tcp,
    Udp,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportKind::Tcp => write!(f, "tcp"),
            TransportKind::Udp => write!(f, "udp"),
        }
    }
}

/// Field types supported by the data model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlockType {
    Bytes,
    String,
    Bits,
    Uint8,
    Uint16,
    Uint32,
    Uint64,
    Int8,
    Int16,
    Int32,
    Int64,
}

impl BlockType {
    pub fn is_integer(self) -> bool {
        !matches!(self, BlockType::Bytes | BlockType::String | BlockType::Bits)
    }

    pub fn is_signed(self) -> bool {
        matches!(
            self,
            BlockType::Int8 | BlockType::Int16 | BlockType::Int32 | BlockType::Int64
        )
    }

    /// Width in bytes for integer types.
    pub fn int_width(self) -> Option<usize> {
        match self {
            BlockType::Uint8 | BlockType::Int8 => Some(1),
            BlockType::Uint16 | BlockType::Int16 => Some(2),
            BlockType::Uint32 | BlockType::Int32 => Some(4),
            BlockType::Uint64 | BlockType::Int64 => Some(8),
            _ => None,
        }
    }

    /// Width in bits for integer types.
    pub fn int_bits(self) -> Option<u32> {
        self.int_width().map(|w| w as u32 * 8)
    }
}

/// Integer byte order; also controls multi-byte bit-field assembly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Endian {
    #[default]
    Big,
    Little,
}

/// Which end of a byte holds the first bit of a `bits` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BitOrder {
    #[default]
    Msb,
    Lsb,
}

/// Unit in which a size field counts its targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SizeUnit {
    #[default]
    Bytes,
    Bits,
    /// 32-bit words, rounded up.
    Words,
}

/// Checksum algorithms supported by the serializer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChecksumAlgorithm {
    Crc32,
    Adler32,
    /// 32-bit byte sum.
    Sum,
    Sum8,
    Sum16,
    Xor,
}

/// Range of the message a checksum covers. The checksum field's own bytes
/// are always excluded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ChecksumOver {
    Range(ChecksumRange),
    Fields(Vec<String>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChecksumRange {
    All,
    Before,
    After,
}

/// One or more block names referenced by a size field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SizeOf {
    One(String),
    Many(Vec<String>),
}

impl SizeOf {
    pub fn targets(&self) -> &[String] {
        match self {
            SizeOf::One(name) => std::slice::from_ref(name),
            SizeOf::Many(names) => names,
        }
    }
}

/// One step of a value transform pipeline. Applied to integer values in
/// declaration order before encoding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum TransformOp {
    Add { value: u64 },
    Sub { value: u64 },
    Xor { value: u64 },
    And { value: u64 },
    Or { value: u64 },
    Shl { bits: u32 },
    Shr { bits: u32 },
    /// Bitwise NOT within the given width.
    Invert { width: u32 },
    Modulo { value: u64 },
}

impl TransformOp {
    pub fn apply(&self, input: u64) -> u64 {
        match *self {
            TransformOp::Add { value } => input.wrapping_add(value),
            TransformOp::Sub { value } => input.wrapping_sub(value),
            TransformOp::Xor { value } => input ^ value,
            TransformOp::And { value } => input & value,
            TransformOp::Or { value } => input | value,
            TransformOp::Shl { bits } => input.wrapping_shl(bits),
            TransformOp::Shr { bits } => input.wrapping_shr(bits),
            TransformOp::Invert { width } => {
                let mask = if width >= 64 {
                    u64::MAX
                } else {
                    (1u64 << width) - 1
                };
                (!input) & mask
            }
            TransformOp::Modulo { value } => {
                if value == 0 {
                    input
                } else {
                    input % value
                }
            }
        }
    }
}

/// Apply a transform pipeline in order.
pub fn apply_transforms(ops: &[TransformOp], input: u64) -> u64 {
    ops.iter().fold(input, |acc, op| op.apply(acc))
}

/// Dynamic value source for a block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Generator {
    UnixTimestamp,
    /// Monotonic counter, per codec instance.
    Sequence,
    RandomBytes(usize),
}

impl Serialize for Generator {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let tag = match self {
            Generator::UnixTimestamp => "unix_timestamp".to_string(),
            Generator::Sequence => "sequence".to_string(),
            Generator::RandomBytes(n) => format!("random_bytes:{n}"),
        };
        serializer.serialize_str(&tag)
    }
}

impl<'de> Deserialize<'de> for Generator {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let tag = String::deserialize(deserializer)?;
        if tag == "unix_timestamp" {
            return Ok(Generator::UnixTimestamp);
        }
        if tag == "sequence" {
            return Ok(Generator::Sequence);
        }
        if let Some(count) = tag.strip_prefix("random_bytes:") {
            let count: usize = count
                .parse()
                .map_err(|_| serde::de::Error::custom(format!("bad random_bytes count in '{tag}'")))?;
            return Ok(Generator::RandomBytes(count));
        }
        Err(serde::de::Error::custom(format!("unknown generator '{tag}'")))
    }
}

/// Side-effect-bearing field update applied by the runtime between sends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "operation", rename_all = "snake_case")]
pub enum BlockBehavior {
    /// Write a counter into the field, then advance it by `step`, wrapping
    /// at `wrap` (defaults to the field's natural modulus).
    Increment {
        #[serde(default)]
        initial: u64,
        #[serde(default = "default_step")]
        step: u64,
        #[serde(default)]
        wrap: Option<u64>,
    },
    /// Add a constant to whatever the field currently holds.
    AddConstant { value: u64 },
}

fn default_step() -> u64 {
    1
}

/// One field of a data model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Block {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: BlockType,

    /// Fixed byte count, or bit count for `bits` blocks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<usize>,
    /// Upper bound for variable-length bytes/string blocks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_size: Option<usize>,
    /// Literal default. Bytes defaults are base64 strings in the document.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<serde_json::Value>,

    #[serde(default)]
    pub endian: Endian,
    #[serde(default)]
    pub bit_order: BitOrder,

    /// Enum of known values for this field.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub values: Option<BTreeMap<u64, String>>,
    #[serde(default = "default_true")]
    pub mutable: bool,

    #[serde(default)]
    pub is_size_field: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_of: Option<SizeOf>,
    #[serde(default)]
    pub size_unit: SizeUnit,

    #[serde(default)]
    pub is_checksum: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum_algorithm: Option<ChecksumAlgorithm>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum_over: Option<ChecksumOver>,

    /// Resolve the value from the session context at serialization time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_context: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub transform: Vec<TransformOp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generate: Option<Generator>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub behavior: Option<BlockBehavior>,

    /// String encoding; only utf-8 is decoded strictly, anything else falls
    /// back to lossy decoding.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encoding: Option<String>,
}

fn default_true() -> bool {
    true
}

impl Block {
    /// Minimal block of a given type, for tests and programmatic models.
    pub fn new(name: &str, kind: BlockType) -> Self {
        Self {
            name: name.to_string(),
            kind,
            size: None,
            max_size: None,
            default: None,
            endian: Endian::default(),
            bit_order: BitOrder::default(),
            values: None,
            mutable: true,
            is_size_field: false,
            size_of: None,
            size_unit: SizeUnit::default(),
            is_checksum: false,
            checksum_algorithm: None,
            checksum_over: None,
            from_context: None,
            transform: Vec::new(),
            generate: None,
            behavior: None,
            encoding: None,
        }
    }

    /// True when the serializer must compute a checksum for this block.
    pub fn has_checksum(&self) -> bool {
        self.is_checksum || self.checksum_algorithm.is_some()
    }

    /// Re-hydrate the declared default into a typed field value.
    ///
    /// Bytes defaults are base64 strings in the serialized form; integers
    /// and bit fields accept JSON numbers; strings accept JSON strings.
    pub fn resolved_default(&self) -> Result<Option<FieldValue>, PluginError> {
        let Some(raw) = &self.default else {
            return Ok(None);
        };
        let err = |reason: String| PluginError::Validation {
            path: format!("blocks.{}.default", self.name),
            reason,
        };
        let value = match self.kind {
            BlockType::Bytes => match raw {
                serde_json::Value::String(s) => {
                    let decoded = base64::engine::general_purpose::STANDARD
                        .decode(s)
                        .map_err(|e| err(format!("invalid base64: {e}")))?;
                    FieldValue::Bytes(decoded)
                }
                serde_json::Value::Array(items) => {
                    let mut out = Vec::with_capacity(items.len());
                    for item in items {
                        let n = item
                            .as_u64()
                            .filter(|n| *n <= 255)
                            .ok_or_else(|| err("byte array entries must be 0-255".into()))?;
                        out.push(n as u8);
                    }
                    FieldValue::Bytes(out)
                }
                other => return Err(err(format!("expected base64 string, got {other}"))),
            },
            BlockType::String => match raw {
                serde_json::Value::String(s) => FieldValue::Str(s.clone()),
                other => return Err(err(format!("expected string, got {other}"))),
            },
            _ => {
                if let Some(u) = raw.as_u64() {
                    FieldValue::Uint(u)
                } else if let Some(i) = raw.as_i64() {
                    FieldValue::Int(i)
                } else {
                    return Err(err(format!("expected integer, got {raw}")));
                }
            }
        };
        Ok(Some(value))
    }
}

/// Ordered sequence of blocks plus an optional embedded seed corpus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataModel {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub blocks: Vec<Block>,
    /// Base64-encoded seed messages.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub seeds: Vec<String>,
}

impl DataModel {
    pub fn block(&self, name: &str) -> Option<&Block> {
        self.blocks.iter().find(|b| b.name == name)
    }

    /// The size field that specifies exactly this block's length, if any.
    pub fn length_field_for(&self, target: &str) -> Option<&Block> {
        self.blocks.iter().find(|b| {
            b.is_size_field
                && b.size_of
                    .as_ref()
                    .map(|s| s.targets().len() == 1 && s.targets()[0] == target)
                    .unwrap_or(false)
        })
    }

    /// Decode the embedded seed corpus.
    pub fn decoded_seeds(&self) -> Result<Vec<Vec<u8>>, PluginError> {
        self.seeds
            .iter()
            .enumerate()
            .map(|(i, s)| {
                base64::engine::general_purpose::STANDARD
                    .decode(s)
                    .map_err(|e| PluginError::Validation {
                        path: format!("seeds[{i}]"),
                        reason: format!("invalid base64: {e}"),
                    })
            })
            .collect()
    }
}

/// One edge of the protocol state machine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateTransition {
    pub from: String,
    pub to: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_response: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger: Option<String>,
}

/// Declared protocol state machine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateModel {
    pub initial_state: String,
    pub states: Vec<String>,
    pub transitions: Vec<StateTransition>,
}

impl StateModel {
    pub fn transitions_from<'a>(&'a self, state: &'a str) -> impl Iterator<Item = &'a StateTransition> {
        self.transitions.iter().filter(move |t| t.from == state)
    }

    /// States with no outgoing transitions.
    pub fn terminal_states(&self) -> Vec<&str> {
        self.states
            .iter()
            .filter(|s| !self.transitions.iter().any(|t| &t.from == *s))
            .map(|s| s.as_str())
            .collect()
    }
}

/// Declarative follow-up rule evaluated against parsed responses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseHandler {
    pub name: String,
    /// Response field -> expected literal (or list, meaning any-of).
    /// An empty match always fires.
    #[serde(default, rename = "match")]
    pub match_fields: BTreeMap<String, serde_json::Value>,
    /// Request field -> value spec ({"copy_from_response": f},
    /// {"literal": v}, or a plain scalar).
    #[serde(default)]
    pub set_fields: BTreeMap<String, serde_json::Value>,
}

/// Role of a protocol stack stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageRole {
    Bootstrap,
    FuzzTarget,
    Teardown,
}

/// Export instruction: store a response field under a context key,
/// optionally through a transform pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ExportSpec {
    Key(String),
    Full {
        context_key: String,
        #[serde(default)]
        transform: Vec<TransformOp>,
    },
}

impl ExportSpec {
    pub fn context_key(&self) -> &str {
        match self {
            ExportSpec::Key(k) => k,
            ExportSpec::Full { context_key, .. } => context_key,
        }
    }

    pub fn transforms(&self) -> &[TransformOp] {
        match self {
            ExportSpec::Key(_) => &[],
            ExportSpec::Full { transform, .. } => transform,
        }
    }
}

/// Retry policy for bootstrap stages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_ms() -> u64 {
    250
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_ms: default_backoff_ms(),
        }
    }
}

/// One stage of the orchestrated protocol stack.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stage {
    pub name: String,
    pub role: StageRole,
    pub data_model: DataModel,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_model: Option<DataModel>,
    /// Response field -> expected value map; a list means any-of.
    #[serde(default)]
    pub expect: BTreeMap<String, serde_json::Value>,
    /// Response field (dotted path allowed) -> export spec.
    #[serde(default)]
    pub exports: BTreeMap<String, ExportSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
}

/// How transports are shared across a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionMode {
    /// One persistent connection per session.
    #[default]
    Session,
    /// One persistent connection per (session, stage).
    PerStage,
    /// A fresh connection per call, closed by the caller.
    PerTest,
}

impl ConnectionMode {
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionMode::Session => "session",
            ConnectionMode::PerStage => "per_stage",
            ConnectionMode::PerTest => "per_test",
        }
    }
}

/// Connection management block of a plugin.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectionConfig {
    #[serde(default)]
    pub mode: ConnectionMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_reconnects: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reconnect_backoff_ms: Option<u64>,
}

/// Heartbeat payload: either raw hex bytes or a field map rendered through
/// the heartbeat data model (the request model by default).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HeartbeatMessage {
    Raw { hex: String },
    Fields { fields: BTreeMap<String, serde_json::Value> },
}

/// Action taken when heartbeat failures reach the threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HeartbeatAction {
    #[default]
    Warn,
    Reconnect,
    Abort,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatOnTimeout {
    #[serde(default = "default_max_failures")]
    pub max_failures: u32,
    #[serde(default)]
    pub action: HeartbeatAction,
    /// Re-run bootstrap after a reconnect triggered by heartbeat failure.
    #[serde(default)]
    pub rebootstrap: bool,
}

fn default_max_failures() -> u32 {
    3
}

impl Default for HeartbeatOnTimeout {
    fn default() -> Self {
        Self {
            max_failures: default_max_failures(),
            action: HeartbeatAction::default(),
            rebootstrap: false,
        }
    }
}

/// Heartbeat block of a plugin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval_ms: Option<u64>,
    /// Resolve the interval from this context key instead of the literal.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval_from_context: Option<String>,
    #[serde(default)]
    pub jitter_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<HeartbeatMessage>,
    #[serde(default)]
    pub expect_response: bool,
    /// Hex prefix the reply must start with, when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_response: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_timeout_ms: Option<u64>,
    #[serde(default)]
    pub on_timeout: HeartbeatOnTimeout,
}

/// Named response check resolved from the registry at load time.
///
/// Registry entries:
/// - `non_empty`: reply must contain at least one byte
/// - `min_len:N`: reply must be at least N bytes
/// - `prefix:HEX`: reply must start with the given hex bytes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseCheck {
    NonEmpty,
    MinLen(usize),
    Prefix(Vec<u8>),
}

impl ResponseCheck {
    pub fn parse(tag: &str) -> Result<Self, PluginError> {
        if tag == "non_empty" {
            return Ok(ResponseCheck::NonEmpty);
        }
        if let Some(n) = tag.strip_prefix("min_len:") {
            let n = n.parse().map_err(|_| PluginError::Validation {
                path: "validate_response".into(),
                reason: format!("bad min_len in '{tag}'"),
            })?;
            return Ok(ResponseCheck::MinLen(n));
        }
        if let Some(h) = tag.strip_prefix("prefix:") {
            let bytes = hex::decode(h).map_err(|e| PluginError::Validation {
                path: "validate_response".into(),
                reason: format!("bad hex prefix in '{tag}': {e}"),
            })?;
            return Ok(ResponseCheck::Prefix(bytes));
        }
        Err(PluginError::Validation {
            path: "validate_response".into(),
            reason: format!("unknown response check '{tag}'"),
        })
    }

    pub fn matches(&self, response: &[u8]) -> bool {
        match self {
            ResponseCheck::NonEmpty => !response.is_empty(),
            ResponseCheck::MinLen(n) => response.len() >= *n,
            ResponseCheck::Prefix(p) => response.starts_with(p),
        }
    }
}

/// A fully loaded, validated protocol plugin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginBundle {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub transport: TransportKind,
    pub data_model: DataModel,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_model: Option<DataModel>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_model: Option<StateModel>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub response_handlers: Vec<ResponseHandler>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol_stack: Option<Vec<Stage>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection: Option<ConnectionConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heartbeat: Option<HeartbeatConfig>,
    /// Named check from the response-check registry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validate_response: Option<String>,
}

impl PluginBundle {
    /// Parse a bundle from JSON and validate it.
    pub fn from_json(raw: &str) -> Result<Self, PluginError> {
        let bundle: PluginBundle =
            serde_json::from_str(raw).map_err(|e| PluginError::Load(e.to_string()))?;
        bundle.validate()?;
        Ok(bundle)
    }

    /// Load a bundle from a JSON file on disk.
    pub fn from_file(path: &Path) -> Result<Self, PluginError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| PluginError::Load(format!("{}: {e}", path.display())))?;
        Self::from_json(&raw)
    }

    /// The connection mode in effect for this plugin.
    pub fn connection_mode(&self) -> ConnectionMode {
        self.connection.as_ref().map(|c| c.mode).unwrap_or_default()
    }

    /// The stage whose data model is mutated and driven by the fuzz loop.
    /// Validation guarantees exactly one exists when a stack is declared.
    pub fn fuzz_target_stage(&self) -> Option<&Stage> {
        self.protocol_stack
            .as_ref()?
            .iter()
            .find(|s| s.role == StageRole::FuzzTarget)
    }

    pub fn bootstrap_stages(&self) -> Vec<&Stage> {
        self.protocol_stack
            .as_ref()
            .map(|stack| stack.iter().filter(|s| s.role == StageRole::Bootstrap).collect())
            .unwrap_or_default()
    }

    pub fn teardown_stages(&self) -> Vec<&Stage> {
        self.protocol_stack
            .as_ref()
            .map(|stack| stack.iter().filter(|s| s.role == StageRole::Teardown).collect())
            .unwrap_or_default()
    }

    /// The data model the fuzz loop mutates: the fuzz-target stage's model
    /// when a stack is declared, else the plugin's top-level model.
    pub fn effective_data_model(&self) -> &DataModel {
        self.fuzz_target_stage()
            .map(|s| &s.data_model)
            .unwrap_or(&self.data_model)
    }

    /// The response model paired with the effective data model.
    pub fn effective_response_model(&self) -> Option<&DataModel> {
        if let Some(stage) = self.fuzz_target_stage() {
            if stage.response_model.is_some() {
                return stage.response_model.as_ref();
            }
        }
        self.response_model.as_ref()
    }

    /// Resolve the named response check, if one is declared.
    pub fn response_check(&self) -> Result<Option<ResponseCheck>, PluginError> {
        self.validate_response
            .as_deref()
            .map(ResponseCheck::parse)
            .transpose()
    }

    /// Structural validation of the whole bundle.
    pub fn validate(&self) -> Result<(), PluginError> {
        validate_data_model(&self.data_model, "data_model")?;
        if let Some(model) = &self.response_model {
            validate_data_model(model, "response_model")?;
        }

        if let Some(state_model) = &self.state_model {
            validate_state_model(state_model)?;
        }

        if let Some(stack) = &self.protocol_stack {
            let fuzz_targets = stack
                .iter()
                .filter(|s| s.role == StageRole::FuzzTarget)
                .count();
            if fuzz_targets != 1 {
                return Err(PluginError::Validation {
                    path: "protocol_stack".into(),
                    reason: format!("expected exactly one fuzz_target stage, found {fuzz_targets}"),
                });
            }
            let mut seen = std::collections::HashSet::new();
            for stage in stack {
                if !seen.insert(stage.name.as_str()) {
                    return Err(PluginError::Validation {
                        path: format!("protocol_stack.{}", stage.name),
                        reason: "duplicate stage name".into(),
                    });
                }
                validate_data_model(&stage.data_model, &format!("protocol_stack.{}.data_model", stage.name))?;
                if let Some(model) = &stage.response_model {
                    validate_data_model(model, &format!("protocol_stack.{}.response_model", stage.name))?;
                }
            }
        }

        if self.transport == TransportKind::Udp && self.connection_mode() != ConnectionMode::PerTest
        {
            if self.protocol_stack.is_some() || self.heartbeat.as_ref().map(|h| h.enabled).unwrap_or(false) {
                return Err(PluginError::Validation {
                    path: "connection.mode".into(),
                    reason: "UDP does not support persistent connections".into(),
                });
            }
        }

        // Resolve the named check now so a bad name fails the load, not the run.
        self.response_check()?;

        Ok(())
    }
}

fn validate_data_model(model: &DataModel, path: &str) -> Result<(), PluginError> {
    if model.blocks.is_empty() {
        return Err(PluginError::Validation {
            path: path.into(),
            reason: "data model has no blocks".into(),
        });
    }

    let mut names = std::collections::HashSet::new();
    for block in &model.blocks {
        if !names.insert(block.name.as_str()) {
            return Err(PluginError::Validation {
                path: format!("{path}.{}", block.name),
                reason: "duplicate block name".into(),
            });
        }
        // Surface bad defaults at load time.
        block.resolved_default()?;

        if block.kind == BlockType::Bits && block.size.is_none() {
            return Err(PluginError::Validation {
                path: format!("{path}.{}", block.name),
                reason: "bits blocks require an explicit size".into(),
            });
        }
        if let Some(size) = block.size {
            if block.kind == BlockType::Bits && (size == 0 || size > 64) {
                return Err(PluginError::Validation {
                    path: format!("{path}.{}", block.name),
                    reason: format!("bit field size {size} out of range 1-64"),
                });
            }
        }
        if block.is_size_field && block.size_of.is_none() {
            return Err(PluginError::Validation {
                path: format!("{path}.{}", block.name),
                reason: "is_size_field requires size_of".into(),
            });
        }
        if block.has_checksum() && !block.kind.is_integer() {
            return Err(PluginError::Validation {
                path: format!("{path}.{}", block.name),
                reason: "checksum blocks must be integer typed".into(),
            });
        }
    }

    // size_of targets must exist and the reference graph must be acyclic.
    for block in &model.blocks {
        if let Some(size_of) = &block.size_of {
            for target in size_of.targets() {
                if !names.contains(target.as_str()) {
                    return Err(PluginError::Validation {
                        path: format!("{path}.{}.size_of", block.name),
                        reason: format!("unknown target block '{target}'"),
                    });
                }
            }
        }
    }
    check_size_of_cycles(model, path)?;

    // Everything except the last block must have a bounded parse.
    for (i, block) in model.blocks.iter().enumerate() {
        let last = i == model.blocks.len() - 1;
        let bounded = match block.kind {
            BlockType::Bytes | BlockType::String => {
                block.size.is_some()
                    || block.max_size.is_some()
                    || model.length_field_for(&block.name).is_some()
            }
            _ => true,
        };
        if !bounded && !last {
            return Err(PluginError::Validation {
                path: format!("{path}.{}", block.name),
                reason: "unbounded block must be the last block of its model".into(),
            });
        }
    }

    Ok(())
}

fn check_size_of_cycles(model: &DataModel, path: &str) -> Result<(), PluginError> {
    // DFS over size_of references from each size field.
    for block in &model.blocks {
        let Some(size_of) = &block.size_of else { continue };
        let mut stack: Vec<&str> = size_of.targets().iter().map(|s| s.as_str()).collect();
        let mut visited = std::collections::HashSet::new();
        while let Some(name) = stack.pop() {
            if name == block.name {
                return Err(PluginError::Validation {
                    path: format!("{path}.{}.size_of", block.name),
                    reason: "size_of reference cycle".into(),
                });
            }
            if !visited.insert(name.to_string()) {
                continue;
            }
            if let Some(next) = model.block(name).and_then(|b| b.size_of.as_ref()) {
                stack.extend(next.targets().iter().map(|s| s.as_str()));
            }
        }
    }
    Ok(())
}

fn validate_state_model(model: &StateModel) -> Result<(), PluginError> {
    let states: std::collections::HashSet<_> = model.states.iter().map(|s| s.as_str()).collect();
    if !states.contains(model.initial_state.as_str()) {
        return Err(PluginError::Validation {
            path: "state_model.initial_state".into(),
            reason: format!("initial state '{}' not in states", model.initial_state),
        });
    }
    for (i, t) in model.transitions.iter().enumerate() {
        for (end, name) in [("from", &t.from), ("to", &t.to)] {
            if !states.contains(name.as_str()) {
                return Err(PluginError::Validation {
                    path: format!("state_model.transitions[{i}].{end}"),
                    reason: format!("unknown state '{name}'"),
                });
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::Engine as _;

    fn simple_bundle_json() -> String {
        serde_json::json!({
            "name": "simple_tcp",
            "transport": "tcp",
            "data_model": {
                "name": "SimpleTCP",
                "blocks": [
                    {"name": "magic", "type": "bytes", "size": 4,
                     "default": base64::engine::general_purpose::STANDARD.encode("STCP"),
                     "mutable": false},
                    {"name": "length", "type": "uint32", "endian": "big",
                     "is_size_field": true, "size_of": "payload"},
                    {"name": "command", "type": "uint8",
                     "values": {"1": "AUTH", "2": "DATA", "3": "QUIT"}},
                    {"name": "payload", "type": "bytes", "max_size": 1024}
                ],
                "seeds": [
                    base64::engine::general_purpose::STANDARD.encode(b"STCP\x00\x00\x00\x05\x01HELLO")
                ]
            },
            "state_model": {
                "initial_state": "INIT",
                "states": ["INIT", "READY", "CLOSED"],
                "transitions": [
                    {"from": "INIT", "to": "READY", "message_type": "AUTH"},
                    {"from": "READY", "to": "READY", "message_type": "DATA"},
                    {"from": "READY", "to": "CLOSED", "message_type": "QUIT"}
                ]
            }
        })
        .to_string()
    }

    #[test]
    fn loads_and_validates_simple_bundle() {
        let bundle = PluginBundle::from_json(&simple_bundle_json()).unwrap();
        assert_eq!(bundle.name, "simple_tcp");
        assert_eq!(bundle.transport, TransportKind::Tcp);
        assert_eq!(bundle.data_model.blocks.len(), 4);

        let seeds = bundle.data_model.decoded_seeds().unwrap();
        assert_eq!(seeds[0], b"STCP\x00\x00\x00\x05\x01HELLO");

        let default = bundle.data_model.blocks[0].resolved_default().unwrap();
        assert_eq!(default, Some(FieldValue::Bytes(b"STCP".to_vec())));

        let values = bundle.data_model.blocks[2].values.as_ref().unwrap();
        assert_eq!(values.get(&1).map(String::as_str), Some("AUTH"));
    }

    #[test]
    fn terminal_states_have_no_outgoing_transitions() {
        let bundle = PluginBundle::from_json(&simple_bundle_json()).unwrap();
        let model = bundle.state_model.unwrap();
        assert_eq!(model.terminal_states(), vec!["CLOSED"]);
    }

    #[test]
    fn rejects_duplicate_block_names() {
        let raw = serde_json::json!({
            "name": "dup",
            "transport": "tcp",
            "data_model": {
                "blocks": [
                    {"name": "a", "type": "uint8"},
                    {"name": "a", "type": "uint8"}
                ]
            }
        })
        .to_string();
        let err = PluginBundle::from_json(&raw).unwrap_err();
        assert!(err.to_string().contains("duplicate block name"));
    }

    #[test]
    fn rejects_unbounded_block_in_the_middle() {
        let raw = serde_json::json!({
            "name": "bad",
            "transport": "tcp",
            "data_model": {
                "blocks": [
                    {"name": "body", "type": "bytes"},
                    {"name": "tail", "type": "uint8"}
                ]
            }
        })
        .to_string();
        let err = PluginBundle::from_json(&raw).unwrap_err();
        assert!(err.to_string().contains("unbounded block"));
    }

    #[test]
    fn rejects_udp_with_protocol_stack() {
        let raw = serde_json::json!({
            "name": "udp_stack",
            "transport": "udp",
            "data_model": {"blocks": [{"name": "a", "type": "uint8"}]},
            "protocol_stack": [
                {"name": "fuzz", "role": "fuzz_target",
                 "data_model": {"blocks": [{"name": "a", "type": "uint8"}]}}
            ]
        })
        .to_string();
        assert!(PluginBundle::from_json(&raw).is_err());
    }

    #[test]
    fn rejects_size_of_cycle() {
        let raw = serde_json::json!({
            "name": "cycle",
            "transport": "tcp",
            "data_model": {
                "blocks": [
                    {"name": "a", "type": "uint16", "is_size_field": true, "size_of": "b"},
                    {"name": "b", "type": "uint16", "is_size_field": true, "size_of": "a"}
                ]
            }
        })
        .to_string();
        let err = PluginBundle::from_json(&raw).unwrap_err();
        assert!(err.to_string().contains("cycle"));
    }

    #[test]
    fn generator_tags_round_trip() {
        for (tag, expected) in [
            ("\"unix_timestamp\"", Generator::UnixTimestamp),
            ("\"sequence\"", Generator::Sequence),
            ("\"random_bytes:16\"", Generator::RandomBytes(16)),
        ] {
            let parsed: Generator = serde_json::from_str(tag).unwrap();
            assert_eq!(parsed, expected);
            assert_eq!(serde_json::to_string(&parsed).unwrap(), tag);
        }
        assert!(serde_json::from_str::<Generator>("\"bogus\"").is_err());
    }

    #[test]
    fn response_check_registry() {
        assert!(ResponseCheck::parse("non_empty").unwrap().matches(b"x"));
        assert!(!ResponseCheck::parse("non_empty").unwrap().matches(b""));
        assert!(ResponseCheck::parse("min_len:4").unwrap().matches(b"abcd"));
        assert!(!ResponseCheck::parse("min_len:4").unwrap().matches(b"abc"));
        let prefix = ResponseCheck::parse("prefix:53544350").unwrap();
        assert!(prefix.matches(b"STCP rest"));
        assert!(!prefix.matches(b"nope"));
        assert!(ResponseCheck::parse("bogus").is_err());
    }

    #[test]
    fn transform_pipeline_applies_in_order() {
        let ops = vec![
            TransformOp::Add { value: 1 },
            TransformOp::Shl { bits: 4 },
            TransformOp::And { value: 0xFF },
        ];
        assert_eq!(apply_transforms(&ops, 0x12), ((0x12 + 1) << 4) & 0xFF);
        assert_eq!(TransformOp::Invert { width: 8 }.apply(0x0F), 0xF0);
        assert_eq!(TransformOp::Modulo { value: 10 }.apply(42), 2);
    }
}
