//! # Structure-Aware Mutation
//!
//! Mutates one field of a parsed message and re-serializes it, so length
//! and checksum fields are re-fixed and the message stays grammatically
//! valid. One mutator with per-type strategy methods, rather than a class
//! per field type: the strategy adapts to the block's metadata.

use crate::codec::{FieldMap, FieldValue, ProtocolCodec};
use crate::error::CodecError;
use crate::plugin::{Block, BlockType, DataModel};
use rand::seq::SliceRandom;
use rand::Rng;
use tracing::debug;

/// Strategy names and selection weights.
pub const STRATEGY_WEIGHTS: &[(&str, u32)] = &[
    ("boundary_values", 25),
    ("arithmetic", 20),
    ("interesting_values", 20),
    ("bit_flip_field", 15),
    ("expand_field", 8),
    ("shrink_field", 7),
    ("repeat_pattern", 5),
];

/// Outcome of one structure-aware mutation.
pub struct StructureMutation {
    pub data: Vec<u8>,
    pub strategy: &'static str,
    pub field: String,
}

/// Grammar-aware mutator for one data model.
pub struct StructureAwareMutator {
    codec: ProtocolCodec,
}

impl StructureAwareMutator {
    pub fn new(model: DataModel) -> Self {
        Self {
            codec: ProtocolCodec::new(model),
        }
    }

    /// Parse the seed, mutate one mutable field, serialize back. Parse
    /// failures bubble up so the engine can fall back to byte level.
    pub fn mutate<R: Rng + ?Sized>(
        &self,
        seed: &[u8],
        rng: &mut R,
    ) -> Result<StructureMutation, CodecError> {
        let mut fields = self.codec.parse(seed)?;

        let mutable: Vec<&Block> = self
            .codec
            .model()
            .blocks
            .iter()
            .filter(|b| b.mutable)
            .collect();
        let Some(block) = mutable.choose(rng).copied() else {
            debug!("no mutable fields in model");
            return Ok(StructureMutation {
                data: seed.to_vec(),
                strategy: "noop",
                field: String::new(),
            });
        };

        let strategy = pick_strategy(rng);
        let original = fields
            .get(&block.name)
            .cloned()
            .unwrap_or_else(|| FieldValue::type_zero(block.kind));
        let mutated = apply_strategy(strategy, &original, block, rng);
        fields.insert(block.name.clone(), mutated);

        let data = self.serialize_fixed(&fields)?;
        Ok(StructureMutation {
            data,
            strategy,
            field: block.name.clone(),
        })
    }

    fn serialize_fixed(&self, fields: &FieldMap) -> Result<Vec<u8>, CodecError> {
        self.codec.serialize(fields, None)
    }
}

fn pick_strategy<R: Rng + ?Sized>(rng: &mut R) -> &'static str {
    let total: u32 = STRATEGY_WEIGHTS.iter().map(|(_, w)| w).sum();
    let mut draw = rng.gen_range(0..total);
    for (name, weight) in STRATEGY_WEIGHTS {
        if draw < *weight {
            return name;
        }
        draw -= weight;
    }
    STRATEGY_WEIGHTS[0].0
}

fn apply_strategy<R: Rng + ?Sized>(
    strategy: &str,
    value: &FieldValue,
    block: &Block,
    rng: &mut R,
) -> FieldValue {
    match strategy {
        "boundary_values" => boundary_values(value, block, rng),
        "arithmetic" => arithmetic(value, block, rng),
        "bit_flip_field" => bit_flip_field(value, block, rng),
        "interesting_values" => interesting_values(value, block, rng),
        "expand_field" => expand_field(value, block, rng),
        "shrink_field" => shrink_field(value, block, rng),
        "repeat_pattern" => repeat_pattern(value, block, rng),
        _ => value.clone(),
    }
}

fn bit_field_max(block: &Block) -> u64 {
    let bits = block.size.unwrap_or(8).min(64);
    if bits >= 64 {
        u64::MAX
    } else {
        (1u64 << bits) - 1
    }
}

fn boundary_values<R: Rng + ?Sized>(value: &FieldValue, block: &Block, rng: &mut R) -> FieldValue {
    match block.kind {
        BlockType::Bits => {
            let max = bit_field_max(block);
            let candidates = [0, 1, max / 2, max.saturating_sub(1), max];
            FieldValue::Uint(*candidates.choose(rng).unwrap())
        }
        BlockType::Uint8 => pick_uint(rng, &[0, 1, 127, 128, 254, 255]),
        BlockType::Uint16 => pick_uint(rng, &[0, 1, 255, 256, 32767, 32768, 65534, 65535]),
        BlockType::Uint32 => pick_uint(
            rng,
            &[0, 1, 65535, 65536, 0x7FFF_FFFF, 0xFFFF_FFFE, 0xFFFF_FFFF],
        ),
        BlockType::Uint64 => pick_uint(
            rng,
            &[
                0,
                1,
                0xFFFF_FFFF,
                0x1_0000_0000,
                0x7FFF_FFFF_FFFF_FFFF,
                u64::MAX,
            ],
        ),
        BlockType::Int8 => pick_int(rng, &[-128, -1, 0, 1, 126, 127]),
        BlockType::Int16 => pick_int(rng, &[-32768, -1, 0, 1, 32766, 32767]),
        BlockType::Int32 => pick_int(rng, &[-2147483648, -1, 0, 1, 2147483646, 2147483647]),
        BlockType::Int64 => pick_int(rng, &[i64::MIN, -1, 0, 1, i64::MAX - 1, i64::MAX]),
        BlockType::Bytes | BlockType::String => {
            let max_size = block.max_size.unwrap_or(1024);
            let choices: [Vec<u8>; 6] = [
                Vec::new(),
                vec![0x00],
                vec![0xFF],
                vec![0x00; max_size],
                vec![0xFF; max_size],
                vec![b'A'; max_size.saturating_sub(1)],
            ];
            as_block_value(choices.choose(rng).unwrap().clone(), block)
        }
    }
}

fn arithmetic<R: Rng + ?Sized>(value: &FieldValue, block: &Block, rng: &mut R) -> FieldValue {
    match block.kind {
        BlockType::Bits => {
            let max = bit_field_max(block);
            let current = value.as_u64().unwrap_or(0);
            let step = rng.gen_range(1..=5);
            let choices = [
                current.wrapping_add(1),
                current.wrapping_sub(1),
                current.wrapping_add(step),
                current.wrapping_sub(step),
                current ^ 1,
            ];
            FieldValue::Uint(choices.choose(rng).unwrap() & max)
        }
        kind if kind.is_integer() => {
            let deltas: [i64; 8] = [-256, -128, -16, -1, 1, 16, 128, 256];
            let delta = *deltas.choose(rng).unwrap();
            if kind.is_signed() {
                let current = value.as_i64().unwrap_or(0);
                let wrapped = wrap_signed(current.wrapping_add(delta), kind);
                FieldValue::Int(wrapped)
            } else {
                let current = value.as_u64().unwrap_or(0);
                let mask = uint_mask(kind);
                FieldValue::Uint(current.wrapping_add(delta as u64) & mask)
            }
        }
        _ => value.clone(),
    }
}

fn bit_flip_field<R: Rng + ?Sized>(value: &FieldValue, block: &Block, rng: &mut R) -> FieldValue {
    match block.kind {
        BlockType::Bits => {
            let bits = block.size.unwrap_or(8).min(64);
            let current = value.as_u64().unwrap_or(0);
            let bit = rng.gen_range(0..bits);
            FieldValue::Uint((current ^ (1u64 << bit)) & bit_field_max(block))
        }
        kind if kind.is_integer() => {
            let bits = kind.int_bits().unwrap_or(8);
            let bit = rng.gen_range(0..bits);
            if kind.is_signed() {
                let current = value.as_i64().unwrap_or(0);
                FieldValue::Int(wrap_signed(current ^ (1i64 << bit), kind))
            } else {
                let current = value.as_u64().unwrap_or(0);
                FieldValue::Uint((current ^ (1u64 << bit)) & uint_mask(kind))
            }
        }
        BlockType::Bytes | BlockType::String => {
            let mut raw = raw_bytes(value);
            if raw.is_empty() {
                return value.clone();
            }
            let pos = rng.gen_range(0..raw.len());
            raw[pos] ^= 1 << rng.gen_range(0..8);
            as_block_value(raw, block)
        }
        _ => unreachable!(),
    }
}

fn interesting_values<R: Rng + ?Sized>(value: &FieldValue, block: &Block, rng: &mut R) -> FieldValue {
    // Known enum values first: usually one of them, sometimes an adjacent
    // value to probe the boundary of the handler table.
    if let Some(values) = &block.values {
        let known: Vec<u64> = values.keys().copied().collect();
        if !known.is_empty() {
            let base = *known.choose(rng).unwrap();
            let picked = if rng.gen_bool(0.7) {
                base
            } else if rng.gen_bool(0.5) {
                base.wrapping_add(1)
            } else {
                base.wrapping_sub(1)
            };
            return FieldValue::Uint(picked & uint_mask_or_bits(block));
        }
    }

    match block.kind {
        BlockType::Bits => {
            let max = bit_field_max(block);
            let bits = block.size.unwrap_or(8).min(64);
            let mut interesting = vec![0u64, 1, max, 1u64 << (bits - 1)];
            for i in 0..bits {
                interesting.push(1u64 << i);
            }
            interesting.retain(|v| *v <= max);
            FieldValue::Uint(*interesting.choose(rng).unwrap())
        }
        BlockType::Uint8 => pick_uint(rng, &[0, 1, 0x7F, 0x80, 0xFF]),
        BlockType::Uint16 => pick_uint(rng, &[0, 1, 0xFF, 0x100, 0x7FFF, 0x8000, 0xFFFF]),
        BlockType::Uint32 | BlockType::Uint64 => pick_uint(
            rng,
            &[0, 1, 0xFFFF, 0x10000, 0x7FFF_FFFF, 0x8000_0000, 0xFFFF_FFFF],
        ),
        BlockType::Bytes | BlockType::String => {
            let patterns: [&[u8]; 6] = [
                b"\x00\x00\x00\x00",
                b"\xFF\xFF\xFF\xFF",
                b"\xDE\xAD\xBE\xEF",
                b"%s%s%n",
                b"../../../etc/passwd",
                b"' OR 1=1--",
            ];
            as_block_value(patterns.choose(rng).unwrap().to_vec(), block)
        }
        _ => value.clone(),
    }
}

fn expand_field<R: Rng + ?Sized>(value: &FieldValue, block: &Block, rng: &mut R) -> FieldValue {
    if !matches!(block.kind, BlockType::Bytes | BlockType::String) {
        return value.clone();
    }
    let raw = raw_bytes(value);
    let max_size = block.max_size.unwrap_or(1024);
    let current = raw.len();
    let factor = rng.gen_range(15..=30) as f64 / 10.0;
    let target = ((current as f64 * factor) as usize).min(max_size);
    if target <= current {
        return value.clone();
    }
    let pattern: Vec<u8> = if raw.is_empty() { vec![b'A'] } else { raw };
    let mut out = Vec::with_capacity(target);
    while out.len() < target {
        out.extend_from_slice(&pattern);
    }
    out.truncate(target);
    as_block_value(out, block)
}

fn shrink_field<R: Rng + ?Sized>(value: &FieldValue, block: &Block, rng: &mut R) -> FieldValue {
    if !matches!(block.kind, BlockType::Bytes | BlockType::String) {
        return value.clone();
    }
    let raw = raw_bytes(value);
    if raw.len() <= 1 {
        return value.clone();
    }
    let keep = rng.gen_range(10..=50) as f64 / 100.0;
    let target = (raw.len() as f64 * keep) as usize;
    as_block_value(raw[..target].to_vec(), block)
}

fn repeat_pattern<R: Rng + ?Sized>(value: &FieldValue, block: &Block, rng: &mut R) -> FieldValue {
    if !matches!(block.kind, BlockType::Bytes | BlockType::String) {
        return value.clone();
    }
    let patterns: [&[u8]; 6] = [b"\x00", b"\xFF", b"A", b"%s", b"\x90", b"\xCC"];
    let pattern = patterns.choose(rng).unwrap();
    let max_size = block.max_size.unwrap_or(1024);
    let size = rng.gen_range(1..=max_size.max(1));
    let mut out = Vec::with_capacity(size);
    while out.len() < size {
        out.extend_from_slice(pattern);
    }
    out.truncate(size);
    as_block_value(out, block)
}

fn pick_uint<R: Rng + ?Sized>(rng: &mut R, candidates: &[u64]) -> FieldValue {
    FieldValue::Uint(*candidates.choose(rng).unwrap())
}

fn pick_int<R: Rng + ?Sized>(rng: &mut R, candidates: &[i64]) -> FieldValue {
    FieldValue::Int(*candidates.choose(rng).unwrap())
}

fn uint_mask(kind: BlockType) -> u64 {
    match kind.int_bits() {
        Some(64) | None => u64::MAX,
        Some(bits) => (1u64 << bits) - 1,
    }
}

fn uint_mask_or_bits(block: &Block) -> u64 {
    if block.kind == BlockType::Bits {
        bit_field_max(block)
    } else {
        uint_mask(block.kind)
    }
}

/// Wrap an i64 into the two's-complement range of the type.
fn wrap_signed(value: i64, kind: BlockType) -> i64 {
    match kind {
        BlockType::Int8 => value as i8 as i64,
        BlockType::Int16 => value as i16 as i64,
        BlockType::Int32 => value as i32 as i64,
        _ => value,
    }
}

fn raw_bytes(value: &FieldValue) -> Vec<u8> {
    match value {
        FieldValue::Bytes(b) => b.clone(),
        FieldValue::Str(s) => s.as_bytes().to_vec(),
        _ => Vec::new(),
    }
}

/// Shape a raw byte result to the block's declared type.
fn as_block_value(raw: Vec<u8>, block: &Block) -> FieldValue {
    match block.kind {
        BlockType::String => FieldValue::Str(String::from_utf8_lossy(&raw).into_owned()),
        _ => FieldValue::Bytes(raw),
    }
}
