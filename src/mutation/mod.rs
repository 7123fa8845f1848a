//! # Mutation Engine
//!
//! Orchestrates mutation strategies across three modes:
//!
//! - `byte_level`: weighted random choice among the raw-byte mutators
//! - `structure_aware`: parse, mutate one field, re-serialize
//! - `hybrid`: a 0-99 draw each iteration routes to structure-aware when
//!   below `structure_aware_weight` (default 70), else byte level
//!
//! The engine reports metadata for the last mutation (strategy tag, the
//! mutators applied, and for structure-aware mutations the field name) so
//! the loop can attribute results and keep per-field counters.

pub mod byte_level;
pub mod structure;

use crate::plugin::DataModel;
use rand::Rng;
use structure::StructureAwareMutator;
use tracing::{debug, warn};

/// Mutation mode for a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationMode {
    ByteLevel,
    StructureAware,
    Hybrid,
}

impl MutationMode {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "byte_level" => MutationMode::ByteLevel,
            "structure_aware" => MutationMode::StructureAware,
            "hybrid" => MutationMode::Hybrid,
            other => {
                warn!(mode = other, "unknown mutation mode, using hybrid");
                MutationMode::Hybrid
            }
        }
    }
}

/// Metadata about the most recent mutation.
#[derive(Debug, Clone, Default)]
pub struct MutationMeta {
    pub strategy: Option<String>,
    pub mutators: Vec<String>,
    /// Mutated field name, for structure-aware mutations.
    pub field: Option<String>,
}

/// Per-session mutation engine.
pub struct MutationEngine {
    corpus: Vec<Vec<u8>>,
    enabled: Vec<&'static str>,
    mode: MutationMode,
    structure_weight: u32,
    fallback_on_parse_error: bool,
    structure: Option<StructureAwareMutator>,
    last_meta: MutationMeta,
}

impl MutationEngine {
    pub fn new(
        corpus: Vec<Vec<u8>>,
        enabled_mutators: &[String],
        data_model: Option<DataModel>,
        mode: MutationMode,
        structure_weight: u32,
        fallback_on_parse_error: bool,
    ) -> Self {
        let structure = match (&data_model, mode) {
            (Some(model), MutationMode::StructureAware | MutationMode::Hybrid) => {
                debug!(weight = structure_weight, "structure-aware mutation enabled");
                Some(StructureAwareMutator::new(model.clone()))
            }
            _ => None,
        };
        Self {
            corpus,
            enabled: normalize_enabled(enabled_mutators),
            mode,
            structure_weight: structure_weight.min(100),
            fallback_on_parse_error,
            structure,
            last_meta: MutationMeta::default(),
        }
    }

    /// All byte-level mutator names that can be enabled per session.
    pub fn available_mutators() -> Vec<&'static str> {
        byte_level::MUTATOR_WEIGHTS.iter().map(|(n, _)| *n).collect()
    }

    pub fn last_metadata(&self) -> &MutationMeta {
        &self.last_meta
    }

    /// Generate one test case from a seed.
    pub fn generate(&mut self, seed: &[u8]) -> Vec<u8> {
        let mut rng = rand::thread_rng();

        let use_structure = match self.mode {
            MutationMode::StructureAware => self.structure.is_some(),
            MutationMode::Hybrid => {
                self.structure.is_some() && rng.gen_range(0..100) < self.structure_weight
            }
            MutationMode::ByteLevel => false,
        };

        if use_structure {
            let mutator = self.structure.as_ref().expect("checked above");
            match mutator.mutate(seed, &mut rng) {
                Ok(mutation) => {
                    self.last_meta = MutationMeta {
                        strategy: Some("structure_aware".into()),
                        mutators: vec![mutation.strategy.to_string()],
                        field: if mutation.field.is_empty() {
                            None
                        } else {
                            Some(mutation.field)
                        },
                    };
                    return mutation.data;
                }
                Err(err) => {
                    debug!(error = %err, "structure mutation failed");
                    if !self.fallback_on_parse_error {
                        self.last_meta = MutationMeta {
                            strategy: Some("structure_aware".into()),
                            mutators: vec!["parse_error".into()],
                            field: None,
                        };
                        return seed.to_vec();
                    }
                    // Fall through to byte level.
                }
            }
        }

        let name = self.pick_byte_mutator(&mut rng);
        let data = byte_level::apply(name, seed, &self.corpus, &mut rng);
        self.last_meta = MutationMeta {
            strategy: Some("byte_level".into()),
            mutators: vec![name.to_string()],
            field: None,
        };
        data
    }

    fn pick_byte_mutator<R: Rng + ?Sized>(&self, rng: &mut R) -> &'static str {
        let weights: Vec<(&'static str, u32)> = self
            .enabled
            .iter()
            .map(|name| {
                let weight = byte_level::MUTATOR_WEIGHTS
                    .iter()
                    .find(|(n, _)| n == name)
                    .map(|(_, w)| *w)
                    .unwrap_or(1);
                (*name, weight)
            })
            .collect();
        let total: u32 = weights.iter().map(|(_, w)| w).sum();
        let mut draw = rng.gen_range(0..total.max(1));
        for (name, weight) in &weights {
            if draw < *weight {
                return name;
            }
            draw -= weight;
        }
        weights[0].0
    }

    pub fn enabled_mutators(&self) -> &[&'static str] {
        &self.enabled
    }
}

/// Filter the requested mutator names against the available set; an empty
/// or entirely-unknown request falls back to the full set.
fn normalize_enabled(requested: &[String]) -> Vec<&'static str> {
    let available = MutationEngine::available_mutators();
    if requested.is_empty() {
        return available;
    }
    let normalized: Vec<&'static str> = available
        .iter()
        .filter(|name| requested.iter().any(|r| r == *name))
        .copied()
        .collect();
    if normalized.is_empty() {
        warn!(?requested, "no requested mutators are available, using all");
        return available;
    }
    normalized
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::{Block, BlockType, SizeOf};

    fn model() -> DataModel {
        let mut length = Block::new("length", BlockType::Uint16);
        length.is_size_field = true;
        length.size_of = Some(SizeOf::One("payload".into()));
        let mut payload = Block::new("payload", BlockType::Bytes);
        payload.max_size = Some(64);
        DataModel {
            name: None,
            description: None,
            blocks: vec![length, payload],
            seeds: Vec::new(),
        }
    }

    #[test]
    fn empty_mutator_list_defaults_to_full_set() {
        assert_eq!(normalize_enabled(&[]), MutationEngine::available_mutators());
        assert_eq!(
            normalize_enabled(&["bogus".to_string()]),
            MutationEngine::available_mutators()
        );
        assert_eq!(
            normalize_enabled(&["havoc".to_string(), "bitflip".to_string()]),
            vec!["bitflip", "havoc"]
        );
    }

    #[test]
    fn byte_level_mode_reports_metadata() {
        let seeds = vec![b"AAAAAAAA".to_vec(), b"BBBBBBBB".to_vec()];
        let mut engine = MutationEngine::new(
            seeds,
            &[],
            None,
            MutationMode::ByteLevel,
            70,
            true,
        );
        let out = engine.generate(b"AAAAAAAA");
        assert!(!out.is_empty() || engine.last_metadata().strategy.is_some());
        let meta = engine.last_metadata();
        assert_eq!(meta.strategy.as_deref(), Some("byte_level"));
        assert_eq!(meta.mutators.len(), 1);
        assert!(meta.field.is_none());
    }

    #[test]
    fn structure_mode_reports_field() {
        let seed = {
            // length=4, payload="TEST"
            let mut m = vec![0x00, 0x04];
            m.extend_from_slice(b"TEST");
            m
        };
        let mut engine = MutationEngine::new(
            vec![seed.clone()],
            &[],
            Some(model()),
            MutationMode::StructureAware,
            70,
            true,
        );
        engine.generate(&seed);
        let meta = engine.last_metadata();
        assert_eq!(meta.strategy.as_deref(), Some("structure_aware"));
        assert!(meta.field.is_some());
    }

    #[test]
    fn hybrid_mode_uses_both_strategies() {
        let seed = vec![0x00, 0x04, b'T', b'E', b'S', b'T'];
        let mut engine = MutationEngine::new(
            vec![seed.clone(), vec![0x00, 0x00]],
            &[],
            Some(model()),
            MutationMode::Hybrid,
            50,
            true,
        );
        let mut strategies = std::collections::HashSet::new();
        for _ in 0..300 {
            engine.generate(&seed);
            if let Some(s) = &engine.last_metadata().strategy {
                strategies.insert(s.clone());
            }
        }
        assert!(strategies.contains("structure_aware"));
        assert!(strategies.contains("byte_level"));
    }
}
