//! # Protocol Codec
//!
//! Bidirectional conversion between binary messages and field maps, driven
//! by a declarative [`DataModel`](crate::plugin::DataModel). The serializer
//! automatically fixes dependent fields: size fields are recomputed from
//! their targets and checksum fields are written back over the finished
//! buffer in a final pass.
//!
//! ## Serialization passes
//!
//! 1. Build the effective field dictionary. For each block, an explicit
//!    value wins; otherwise the declared `default`, then `from_context`
//!    resolution (with the block's transform pipeline applied), then a
//!    `generate` source, then the type's zero value.
//! 2. Recompute every `is_size_field` block from the measured lengths of
//!    its `size_of` targets in the configured unit.
//! 3. Emit all blocks in order through the bit cursor.
//! 4. Compute each checksum over its configured range and write it back at
//!    the recorded offset.
//!
//! The codec holds no state beyond the monotonic counter backing the
//! `sequence` generator, so one instance can serve parsing and
//! serialization for a whole session.

pub mod bits;
pub mod checksum;

use crate::error::CodecError;
use crate::plugin::{
    Block, BlockType, ChecksumOver, ChecksumRange, DataModel, Endian, Generator, SizeUnit,
    apply_transforms,
};
use crate::session::context::{ContextStore, ContextValue};
use bits::{BitReader, BitWriter};
use rand::RngCore;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

/// A single decoded field value.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Uint(u64),
    Int(i64),
    Bytes(Vec<u8>),
    Str(String),
}

impl FieldValue {
    /// The zero value for a block type.
    pub fn type_zero(kind: BlockType) -> Self {
        match kind {
            BlockType::Bytes => FieldValue::Bytes(Vec::new()),
            BlockType::String => FieldValue::Str(String::new()),
            _ if kind.is_signed() => FieldValue::Int(0),
            _ => FieldValue::Uint(0),
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            FieldValue::Uint(v) => Some(*v),
            FieldValue::Int(v) => Some(*v as u64),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            FieldValue::Uint(v) => Some(*v as i64),
            FieldValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            FieldValue::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// Lossless JSON form, matching the context snapshot convention:
    /// bytes become `{"_type": "bytes", "value": hex}`.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            FieldValue::Uint(v) => serde_json::json!(v),
            FieldValue::Int(v) => serde_json::json!(v),
            FieldValue::Str(s) => serde_json::json!(s),
            FieldValue::Bytes(b) => serde_json::json!({
                "_type": "bytes",
                "value": hex::encode(b),
            }),
        }
    }

    /// Invert [`to_json`](Self::to_json).
    pub fn from_json(value: &serde_json::Value) -> Option<Self> {
        match value {
            serde_json::Value::Number(n) => {
                if let Some(u) = n.as_u64() {
                    Some(FieldValue::Uint(u))
                } else {
                    n.as_i64().map(FieldValue::Int)
                }
            }
            serde_json::Value::String(s) => Some(FieldValue::Str(s.clone())),
            serde_json::Value::Object(map) => {
                if map.get("_type").and_then(|t| t.as_str()) == Some("bytes") {
                    let raw = map.get("value")?.as_str()?;
                    hex::decode(raw).ok().map(FieldValue::Bytes)
                } else {
                    None
                }
            }
            _ => None,
        }
    }
}

impl From<&ContextValue> for Option<FieldValue> {
    fn from(value: &ContextValue) -> Self {
        match value {
            ContextValue::Uint(v) => Some(FieldValue::Uint(*v)),
            ContextValue::Int(v) => Some(FieldValue::Int(*v)),
            ContextValue::Bytes(b) => Some(FieldValue::Bytes(b.clone())),
            ContextValue::Str(s) => Some(FieldValue::Str(s.clone())),
            ContextValue::Timestamp(ts) => Some(FieldValue::Uint(ts.timestamp().max(0) as u64)),
            _ => None,
        }
    }
}

/// Decoded message: block name -> value. Iteration order comes from the
/// data model, not the map.
pub type FieldMap = HashMap<String, FieldValue>;

/// Bidirectional parser/serializer for one data model.
pub struct ProtocolCodec {
    model: DataModel,
    /// Backing counter for the `sequence` generator.
    sequence: AtomicU64,
}

impl ProtocolCodec {
    pub fn new(model: DataModel) -> Self {
        Self {
            model,
            sequence: AtomicU64::new(1),
        }
    }

    pub fn model(&self) -> &DataModel {
        &self.model
    }

    /// Parse binary data into a field map, processing blocks in declared
    /// order.
    pub fn parse(&self, data: &[u8]) -> Result<FieldMap, CodecError> {
        let mut fields = FieldMap::new();
        let mut reader = BitReader::new(data);

        for block in &self.model.blocks {
            let offset = reader.byte_pos();
            let parse_err = |reason: String| CodecError::Parse {
                field: block.name.clone(),
                offset,
                reason,
            };

            let value = match block.kind {
                BlockType::Bits => {
                    let size = block.size.unwrap_or(8);
                    let v = reader
                        .read_bits(size, block.bit_order, block.endian)
                        .map_err(parse_err)?;
                    FieldValue::Uint(v)
                }
                BlockType::Bytes => {
                    let len = self.bytes_parse_len(block, &fields, reader.remaining_bytes());
                    let raw = reader.read_bytes(len).map_err(parse_err)?;
                    FieldValue::Bytes(raw.to_vec())
                }
                BlockType::String => {
                    let len = self.bytes_parse_len(block, &fields, reader.remaining_bytes());
                    let raw = reader.read_bytes(len).map_err(parse_err)?;
                    FieldValue::Str(decode_string(raw, block))
                }
                kind => {
                    let width = kind.int_width().expect("integer kind");
                    let raw = reader.read_bytes(width).map_err(parse_err)?;
                    decode_integer(raw, kind, block.endian)
                }
            };

            fields.insert(block.name.clone(), value);
        }

        Ok(fields)
    }

    /// Byte count a variable-length block consumes at parse time.
    fn bytes_parse_len(&self, block: &Block, parsed: &FieldMap, remaining: usize) -> usize {
        if let Some(size) = block.size {
            return size;
        }
        // A sibling length field that targets exactly this block decides
        // the length, capped at max_size and the available data.
        if let Some(length_field) = self.model.length_field_for(&block.name) {
            if let Some(declared) = parsed.get(&length_field.name).and_then(|v| v.as_u64()) {
                let mut len = declared as usize;
                if let Some(max) = block.max_size {
                    len = len.min(max);
                }
                return len.min(remaining);
            }
        }
        match block.max_size {
            Some(max) => max.min(remaining),
            None => remaining,
        }
    }

    /// Serialize a field map to binary form, auto-fixing size and checksum
    /// fields. `ctx` backs `from_context` resolution.
    pub fn serialize(
        &self,
        fields: &FieldMap,
        ctx: Option<&ContextStore>,
    ) -> Result<Vec<u8>, CodecError> {
        let effective = self.effective_fields(fields, ctx)?;
        self.emit(&effective)
    }

    /// Pass 1 and 2: fill absent fields and recompute size fields.
    fn effective_fields(
        &self,
        fields: &FieldMap,
        ctx: Option<&ContextStore>,
    ) -> Result<FieldMap, CodecError> {
        let mut effective = FieldMap::new();

        for block in &self.model.blocks {
            let value = if let Some(explicit) = fields.get(&block.name) {
                explicit.clone()
            } else {
                self.fill_value(block, ctx)?
            };
            effective.insert(block.name.clone(), value);
        }

        // Size fields are always recomputed from their targets.
        for block in &self.model.blocks {
            if !block.is_size_field {
                continue;
            }
            let Some(size_of) = &block.size_of else { continue };
            let mut total_bits = 0usize;
            for target in size_of.targets() {
                let target_block = self.model.block(target).ok_or_else(|| {
                    CodecError::Serialization {
                        field: block.name.clone(),
                        reason: format!("size_of target '{target}' not in model"),
                    }
                })?;
                total_bits += measured_bits(target_block, effective.get(target));
            }
            let measured = match block.size_unit {
                SizeUnit::Bits => total_bits as u64,
                SizeUnit::Bytes => total_bits.div_ceil(8) as u64,
                SizeUnit::Words => total_bits.div_ceil(32) as u64,
            };
            effective.insert(block.name.clone(), FieldValue::Uint(measured));
        }

        Ok(effective)
    }

    /// Fill order for an absent field: default, from_context, generate,
    /// type zero.
    fn fill_value(&self, block: &Block, ctx: Option<&ContextStore>) -> Result<FieldValue, CodecError> {
        if let Some(default) = block
            .resolved_default()
            .map_err(|e| CodecError::Serialization {
                field: block.name.clone(),
                reason: e.to_string(),
            })?
        {
            return Ok(default);
        }

        if let Some(key) = &block.from_context {
            let found = ctx.and_then(|c| c.get(key));
            let Some(raw) = found else {
                return Err(CodecError::ContextKeyNotFound {
                    key: key.clone(),
                    available: ctx.map(|c| c.keys()).unwrap_or_default(),
                });
            };
            let value: Option<FieldValue> = raw.into();
            let mut value = value.ok_or_else(|| CodecError::Serialization {
                field: block.name.clone(),
                reason: format!("context value for '{key}' cannot back a {:?} field", block.kind),
            })?;
            if !block.transform.is_empty() {
                let Some(input) = value.as_u64() else {
                    return Err(CodecError::Serialization {
                        field: block.name.clone(),
                        reason: "transform pipeline requires an integer value".into(),
                    });
                };
                value = FieldValue::Uint(apply_transforms(&block.transform, input));
            }
            return Ok(value);
        }

        if let Some(generator) = &block.generate {
            return Ok(self.generate_value(block, generator));
        }

        Ok(FieldValue::type_zero(block.kind))
    }

    fn generate_value(&self, block: &Block, generator: &Generator) -> FieldValue {
        match generator {
            Generator::UnixTimestamp => {
                FieldValue::Uint(chrono::Utc::now().timestamp().max(0) as u64)
            }
            Generator::Sequence => FieldValue::Uint(self.sequence.fetch_add(1, Ordering::Relaxed)),
            Generator::RandomBytes(count) => {
                let mut buf = vec![0u8; *count];
                rand::thread_rng().fill_bytes(&mut buf);
                match block.kind {
                    BlockType::Bytes => FieldValue::Bytes(buf),
                    _ => {
                        // Integer target: fold the random bytes into a value.
                        let mut v = 0u64;
                        for b in buf.iter().take(8) {
                            v = (v << 8) | *b as u64;
                        }
                        FieldValue::Uint(v)
                    }
                }
            }
        }
    }

    /// Pass 3 and 4: emit all blocks, then write checksums back.
    fn emit(&self, effective: &FieldMap) -> Result<Vec<u8>, CodecError> {
        let mut writer = BitWriter::new();
        // Byte spans of aligned fields, for checksum ranges.
        let mut spans: HashMap<&str, (usize, usize)> = HashMap::new();

        for block in &self.model.blocks {
            let value = effective
                .get(&block.name)
                .expect("effective map covers every block");
            let ser_err = |reason: String| CodecError::Serialization {
                field: block.name.clone(),
                reason,
            };

            match block.kind {
                BlockType::Bits => {
                    let size = block.size.unwrap_or(8);
                    let raw = value
                        .as_u64()
                        .ok_or_else(|| ser_err("expected integer for bits field".into()))?;
                    writer.write_bits(raw, size, block.bit_order, block.endian);
                }
                BlockType::Bytes | BlockType::String => {
                    let encoded = match value {
                        FieldValue::Bytes(b) => b.clone(),
                        FieldValue::Str(s) => s.as_bytes().to_vec(),
                        _ => return Err(ser_err("expected bytes or string".into())),
                    };
                    let shaped = shape_bytes(encoded, block);
                    writer.align_to_byte();
                    let offset = writer.byte_len();
                    spans.insert(block.name.as_str(), (offset, shaped.len()));
                    writer.write_bytes(&shaped);
                }
                kind => {
                    let width = kind.int_width().expect("integer kind");
                    let raw = value
                        .as_u64()
                        .ok_or_else(|| ser_err("expected integer value".into()))?;
                    writer.align_to_byte();
                    let offset = writer.byte_len();
                    spans.insert(block.name.as_str(), (offset, width));
                    writer.write_bytes(&encode_integer(raw, width, block.endian));
                }
            }
        }

        let mut out = writer.into_bytes();

        for block in &self.model.blocks {
            if !block.has_checksum() {
                continue;
            }
            self.write_checksum(block, &mut out, &spans)?;
        }

        Ok(out)
    }

    fn write_checksum(
        &self,
        block: &Block,
        out: &mut [u8],
        spans: &HashMap<&str, (usize, usize)>,
    ) -> Result<(), CodecError> {
        let ser_err = |reason: String| CodecError::Serialization {
            field: block.name.clone(),
            reason,
        };
        let (offset, width) = *spans
            .get(block.name.as_str())
            .ok_or_else(|| ser_err("checksum field has no byte span".into()))?;

        let data: Vec<u8> = match &block.checksum_over {
            None | Some(ChecksumOver::Range(ChecksumRange::All)) => {
                let mut d = out[..offset].to_vec();
                d.extend_from_slice(&out[offset + width..]);
                d
            }
            Some(ChecksumOver::Range(ChecksumRange::Before)) => out[..offset].to_vec(),
            Some(ChecksumOver::Range(ChecksumRange::After)) => out[offset + width..].to_vec(),
            Some(ChecksumOver::Fields(names)) => {
                let mut d = Vec::new();
                for name in names {
                    let (o, l) = *spans.get(name.as_str()).ok_or_else(|| {
                        ser_err(format!("checksum_over field '{name}' has no byte span"))
                    })?;
                    d.extend_from_slice(&out[o..o + l]);
                }
                d
            }
        };

        let algorithm = block
            .checksum_algorithm
            .unwrap_or(crate::plugin::ChecksumAlgorithm::Crc32);
        let value = checksum::compute(algorithm, &data);
        let masked = mask_to_width(value, width);
        out[offset..offset + width].copy_from_slice(&encode_integer(masked, width, block.endian));

        debug!(
            field = %block.name,
            algorithm = ?algorithm,
            value = format!("{masked:#x}"),
            offset,
            "checksum computed"
        );
        Ok(())
    }

    /// Deep-cloned defaults for every block, for planners and default
    /// message construction.
    pub fn build_default_fields(&self) -> FieldMap {
        let mut fields = FieldMap::new();
        for block in &self.model.blocks {
            let value = block
                .resolved_default()
                .ok()
                .flatten()
                .unwrap_or_else(|| FieldValue::type_zero(block.kind));
            fields.insert(block.name.clone(), value);
        }
        fields
    }
}

fn decode_string(raw: &[u8], block: &Block) -> String {
    let strict = match block.encoding.as_deref() {
        None | Some("utf-8") | Some("utf8") => std::str::from_utf8(raw).ok().map(str::to_string),
        _ => None,
    };
    strict.unwrap_or_else(|| String::from_utf8_lossy(raw).into_owned())
}

fn decode_integer(raw: &[u8], kind: BlockType, endian: Endian) -> FieldValue {
    let mut value = 0u64;
    match endian {
        Endian::Big => {
            for b in raw {
                value = (value << 8) | *b as u64;
            }
        }
        Endian::Little => {
            for b in raw.iter().rev() {
                value = (value << 8) | *b as u64;
            }
        }
    }
    if kind.is_signed() {
        let signed = match raw.len() {
            1 => value as u8 as i8 as i64,
            2 => value as u16 as i16 as i64,
            4 => value as u32 as i32 as i64,
            _ => value as i64,
        };
        FieldValue::Int(signed)
    } else {
        FieldValue::Uint(value)
    }
}

fn encode_integer(value: u64, width: usize, endian: Endian) -> Vec<u8> {
    let masked = mask_to_width(value, width);
    match endian {
        Endian::Big => masked.to_be_bytes()[8 - width..].to_vec(),
        Endian::Little => masked.to_le_bytes()[..width].to_vec(),
    }
}

fn mask_to_width(value: u64, width: usize) -> u64 {
    if width >= 8 {
        value
    } else {
        value & ((1u64 << (width * 8)) - 1)
    }
}

/// Pad or truncate a bytes value to its block's declared bounds.
fn shape_bytes(mut encoded: Vec<u8>, block: &Block) -> Vec<u8> {
    if let Some(size) = block.size {
        if encoded.len() < size {
            encoded.resize(size, 0);
        } else {
            encoded.truncate(size);
        }
    } else if let Some(max) = block.max_size {
        if encoded.len() > max {
            encoded.truncate(max);
        }
    }
    encoded
}

/// Serialized bit length of a block given its effective value, for size
/// field computation.
fn measured_bits(block: &Block, value: Option<&FieldValue>) -> usize {
    match block.kind {
        BlockType::Bits => block.size.unwrap_or(8),
        BlockType::Bytes | BlockType::String => {
            if let Some(size) = block.size {
                return size * 8;
            }
            let len = match value {
                Some(FieldValue::Bytes(b)) => b.len(),
                Some(FieldValue::Str(s)) => s.len(),
                _ => 0,
            };
            let capped = block.max_size.map(|m| len.min(m)).unwrap_or(len);
            capped * 8
        }
        kind => kind.int_width().unwrap_or(1) * 8,
    }
}
