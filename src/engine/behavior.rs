//! # Field Behaviors
//!
//! Declarative side-effect-bearing field updates applied between sends:
//! an incrementing counter stamped into a header field, or a constant
//! added to whatever the field holds. Behaviors are compiled into a flat
//! plan of (offset, width) patches once per data model; blocks after a
//! dynamically sized block cannot be tracked by offset and are skipped.

use crate::plugin::{Block, BlockBehavior, BlockType, DataModel, Endian};
use std::collections::HashMap;
use tracing::warn;

/// Counter state per incrementing field, owned by the session.
pub type BehaviorState = HashMap<String, u64>;

#[derive(Debug, Clone)]
struct CompiledBehavior {
    name: String,
    offset: usize,
    width: usize,
    endian: Endian,
    behavior: BlockBehavior,
}

/// Applies the behaviors declared on a data model's blocks.
pub struct BehaviorProcessor {
    plan: Vec<CompiledBehavior>,
}

impl BehaviorProcessor {
    pub fn new(model: &DataModel) -> Self {
        let mut plan = Vec::new();
        let mut offset = 0usize;
        for block in &model.blocks {
            let width = static_width(block);
            if let Some(behavior) = &block.behavior {
                match width {
                    Some(width) => plan.push(CompiledBehavior {
                        name: block.name.clone(),
                        offset,
                        width,
                        endian: block.endian,
                        behavior: behavior.clone(),
                    }),
                    None => {
                        warn!(block = %block.name, "behavior on dynamic block skipped");
                    }
                }
            }
            match width {
                Some(w) => offset += w,
                // Offsets beyond a dynamic block are unknowable.
                None => break,
            }
        }
        Self { plan }
    }

    pub fn has_behaviors(&self) -> bool {
        !self.plan.is_empty()
    }

    /// Fresh counter state for a session.
    pub fn initial_state(&self) -> BehaviorState {
        self.plan
            .iter()
            .filter_map(|c| match &c.behavior {
                BlockBehavior::Increment { initial, .. } => Some((c.name.clone(), *initial)),
                BlockBehavior::AddConstant { .. } => None,
            })
            .collect()
    }

    /// Patch the payload in place according to the plan, advancing counters.
    pub fn apply(&self, data: &[u8], state: &mut BehaviorState) -> Vec<u8> {
        if self.plan.is_empty() {
            return data.to_vec();
        }
        let mut out = data.to_vec();
        for compiled in &self.plan {
            let end = compiled.offset + compiled.width;
            if end > out.len() {
                warn!(
                    field = %compiled.name,
                    needed = end,
                    available = out.len(),
                    "behavior target out of bounds"
                );
                continue;
            }
            let natural_wrap = wrap_modulus(compiled.width);
            match &compiled.behavior {
                BlockBehavior::Increment { initial, step, wrap } => {
                    let wrap = wrap.unwrap_or(natural_wrap);
                    let current = *state.get(&compiled.name).unwrap_or(initial);
                    write_value(&mut out[compiled.offset..end], current, compiled.endian);
                    let mut next = current.wrapping_add(*step);
                    if wrap > 0 {
                        next %= wrap;
                    }
                    state.insert(compiled.name.clone(), next);
                }
                BlockBehavior::AddConstant { value } => {
                    let raw = read_value(&out[compiled.offset..end], compiled.endian);
                    let updated = raw.wrapping_add(*value) % natural_wrap.max(1);
                    write_value(&mut out[compiled.offset..end], updated, compiled.endian);
                }
            }
        }
        out
    }
}

/// Modulus of a field's natural width; u64 fields saturate to u64::MAX.
fn wrap_modulus(width: usize) -> u64 {
    if width >= 8 {
        u64::MAX
    } else {
        1u64 << (width * 8)
    }
}

fn static_width(block: &Block) -> Option<usize> {
    match block.kind {
        BlockType::Bytes | BlockType::String => block.size,
        BlockType::Bits => None,
        kind => kind.int_width(),
    }
}

fn read_value(raw: &[u8], endian: Endian) -> u64 {
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
    value
}

fn write_value(slot: &mut [u8], value: u64, endian: Endian) {
    let width = slot.len();
    match endian {
        Endian::Big => slot.copy_from_slice(&value.to_be_bytes()[8 - width..]),
        Endian::Little => slot.copy_from_slice(&value.to_le_bytes()[..width]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn model_with_counter() -> DataModel {
        let mut magic = Block::new("magic", BlockType::Bytes);
        magic.size = Some(2);
        let mut seq = Block::new("seq", BlockType::Uint16);
        seq.behavior = Some(BlockBehavior::Increment {
            initial: 5,
            step: 1,
            wrap: Some(7),
        });
        let mut payload = Block::new("payload", BlockType::Bytes);
        payload.max_size = Some(64);
        DataModel {
            name: None,
            description: None,
            blocks: vec![magic, seq, payload],
            seeds: Vec::new(),
        }
    }

    #[test]
    fn increment_stamps_and_wraps() {
        let processor = BehaviorProcessor::new(&model_with_counter());
        assert!(processor.has_behaviors());
        let mut state = processor.initial_state();

        let base = b"MG\x00\x00DATA".to_vec();
        let first = processor.apply(&base, &mut state);
        assert_eq!(first[2..4].to_vec(), vec![0x00, 0x05]);
        let second = processor.apply(&base, &mut state);
        assert_eq!(second[2..4].to_vec(), vec![0x00, 0x06]);
        // wrap=7: 6+1 wraps to 0.
        let third = processor.apply(&base, &mut state);
        assert_eq!(third[2..4].to_vec(), vec![0x00, 0x00]);
    }

    #[test]
    fn add_constant_patches_in_place() {
        let mut field = Block::new("count", BlockType::Uint8);
        field.behavior = Some(BlockBehavior::AddConstant { value: 0x10 });
        let model = DataModel {
            name: None,
            description: None,
            blocks: vec![field],
            seeds: Vec::new(),
        };
        let processor = BehaviorProcessor::new(&model);
        let mut state = BehaviorState::new();
        assert_eq!(processor.apply(&[0x05], &mut state), vec![0x15]);
        assert_eq!(processor.apply(&[0xFF], &mut state), vec![0x0F]);
    }

    #[test]
    fn behaviors_after_dynamic_blocks_are_skipped() {
        let mut payload = Block::new("payload", BlockType::Bytes);
        payload.max_size = Some(64);
        let mut tail = Block::new("tail", BlockType::Uint8);
        tail.behavior = Some(BlockBehavior::AddConstant { value: 1 });
        let model = DataModel {
            name: None,
            description: None,
            blocks: vec![payload, tail],
            seeds: Vec::new(),
        };
        let processor = BehaviorProcessor::new(&model);
        assert!(!processor.has_behaviors());
    }

    #[test]
    fn short_payload_is_left_alone() {
        let processor = BehaviorProcessor::new(&model_with_counter());
        let mut state = processor.initial_state();
        assert_eq!(processor.apply(&[0x01], &mut state), vec![0x01]);
    }
}
