//! # Byte-Level Mutators
//!
//! Grammar-blind mutators operating on raw bytes. Each is weighted at
//! selection time; the weights favor cheap bit/byte noise over the heavier
//! havoc and splice strategies.

use rand::seq::SliceRandom;
use rand::Rng;

/// Mutator names and selection weights.
pub const MUTATOR_WEIGHTS: &[(&str, u32)] = &[
    ("bitflip", 20),
    ("byteflip", 20),
    ("arithmetic", 15),
    ("interesting", 20),
    ("havoc", 15),
    ("splice", 10),
];

pub const INTERESTING_8: &[u8] = &[0, 1, 127, 128, 255];
pub const INTERESTING_16: &[u16] = &[0, 1, 255, 256, 32767, 32768, 65535];
pub const INTERESTING_32: &[u32] = &[
    0,
    1,
    65535,
    65536,
    0x7FFF_FFFF,
    0x8000_0000,
    0xFFFF_FFFF,
];

const ARITHMETIC_DELTAS: &[i64] = &[-128, -64, -32, -16, -8, -1, 1, 8, 16, 32, 64, 128];

/// Growth ceiling for havoc inserts/duplicates.
const HAVOC_MAX_LEN: usize = 4096;

/// Apply the named mutator. Unknown names return the input unchanged.
pub fn apply<R: Rng + ?Sized>(
    name: &str,
    data: &[u8],
    corpus: &[Vec<u8>],
    rng: &mut R,
) -> Vec<u8> {
    match name {
        "bitflip" => bitflip(data, rng),
        "byteflip" => byteflip(data, rng),
        "arithmetic" => arithmetic(data, rng),
        "interesting" => interesting(data, rng),
        "havoc" => havoc(data, rng),
        "splice" => splice(data, corpus, rng),
        _ => data.to_vec(),
    }
}

/// Flip ~1% of bits at random positions (at least one).
pub fn bitflip<R: Rng + ?Sized>(data: &[u8], rng: &mut R) -> Vec<u8> {
    let mut out = data.to_vec();
    if out.is_empty() {
        return out;
    }
    let num_bits = out.len() * 8;
    let flips = (num_bits / 100).max(1);
    for _ in 0..flips {
        let bit = rng.gen_range(0..num_bits);
        out[bit / 8] ^= 1 << (bit % 8);
    }
    out
}

/// Replace ~5% of bytes with uniform random values (at least one).
pub fn byteflip<R: Rng + ?Sized>(data: &[u8], rng: &mut R) -> Vec<u8> {
    let mut out = data.to_vec();
    if out.is_empty() {
        return out;
    }
    let flips = (out.len() * 5 / 100).max(1);
    for _ in 0..flips {
        let pos = rng.gen_range(0..out.len());
        out[pos] = rng.gen();
    }
    out
}

/// Add a small delta to a big-endian u32 at a 4-byte-aligned offset,
/// wrapping mod 2^32.
pub fn arithmetic<R: Rng + ?Sized>(data: &[u8], rng: &mut R) -> Vec<u8> {
    let mut out = data.to_vec();
    if out.len() < 4 {
        return out;
    }
    let slots = out.len() / 4;
    let pos = rng.gen_range(0..slots) * 4;
    let value = u32::from_be_bytes([out[pos], out[pos + 1], out[pos + 2], out[pos + 3]]);
    let delta = *ARITHMETIC_DELTAS.choose(rng).unwrap();
    let mutated = (value as i64).wrapping_add(delta) as u32;
    out[pos..pos + 4].copy_from_slice(&mutated.to_be_bytes());
    out
}

/// Write a boundary value at a random offset: a 32-bit one with p=0.5 when
/// it fits, else 16-bit, else 8-bit.
pub fn interesting<R: Rng + ?Sized>(data: &[u8], rng: &mut R) -> Vec<u8> {
    let mut out = data.to_vec();
    if out.len() < 2 {
        return out;
    }
    let pos = rng.gen_range(0..=out.len() - 2);
    if pos + 4 <= out.len() && rng.gen_bool(0.5) {
        let value = *INTERESTING_32.choose(rng).unwrap();
        out[pos..pos + 4].copy_from_slice(&value.to_be_bytes());
    } else if pos + 2 <= out.len() {
        let value = *INTERESTING_16.choose(rng).unwrap();
        out[pos..pos + 2].copy_from_slice(&value.to_be_bytes());
    } else {
        out[pos] = *INTERESTING_8.choose(rng).unwrap();
    }
    out
}

/// 2-10 random heavy operations: insert, delete, duplicate, shuffle.
/// Growth is bounded so repeated havoc cannot balloon memory.
pub fn havoc<R: Rng + ?Sized>(data: &[u8], rng: &mut R) -> Vec<u8> {
    let mut out = data.to_vec();
    if out.is_empty() {
        return out;
    }
    let ops = rng.gen_range(2..=10);
    for _ in 0..ops {
        match rng.gen_range(0..4) {
            0 if out.len() < HAVOC_MAX_LEN => {
                let pos = rng.gen_range(0..=out.len());
                let count = rng.gen_range(1..=16);
                let chunk: Vec<u8> = (0..count).map(|_| rng.gen()).collect();
                let _ = out.splice(pos..pos, chunk);
            }
            1 if out.len() > 4 => {
                let pos = rng.gen_range(0..=out.len() - 2);
                let count = rng.gen_range(1..=16.min(out.len() - pos));
                out.drain(pos..pos + count);
            }
            2 if out.len() > 4 && out.len() < HAVOC_MAX_LEN => {
                let start = rng.gen_range(0..=out.len() - 2);
                let end = rng.gen_range(start + 1..=(start + 32).min(out.len()));
                let chunk: Vec<u8> = out[start..end].to_vec();
                let pos = rng.gen_range(0..=out.len());
                let _ = out.splice(pos..pos, chunk);
            }
            3 if out.len() > 8 => {
                let start = rng.gen_range(0..=out.len() - 4);
                let end = rng.gen_range(start + 4..=(start + 32).min(out.len()));
                out[start..end].shuffle(rng);
            }
            _ => {}
        }
    }
    out
}

/// Concatenate a prefix of this seed with a suffix of a different one.
/// A no-op when the corpus has fewer than two seeds.
pub fn splice<R: Rng + ?Sized>(data: &[u8], corpus: &[Vec<u8>], rng: &mut R) -> Vec<u8> {
    if corpus.len() < 2 {
        return data.to_vec();
    }
    let alternatives: Vec<&Vec<u8>> = corpus.iter().filter(|s| s.as_slice() != data).collect();
    let Some(other) = alternatives.choose(rng) else {
        return data.to_vec();
    };
    let split1 = rng.gen_range(0..=data.len());
    let split2 = rng.gen_range(0..=other.len());
    let mut out = data[..split1].to_vec();
    out.extend_from_slice(&other[split2..]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn rng() -> StdRng {
        StdRng::seed_from_u64(0x5eed)
    }

    #[test]
    fn bitflip_changes_at_least_one_bit() {
        let mut rng = rng();
        let data = vec![0u8; 32];
        let out = bitflip(&data, &mut rng);
        assert_eq!(out.len(), data.len());
        assert_ne!(out, data);
    }

    #[test]
    fn byteflip_preserves_length() {
        let mut rng = rng();
        let data = vec![0xAAu8; 100];
        let out = byteflip(&data, &mut rng);
        assert_eq!(out.len(), 100);
    }

    #[test]
    fn arithmetic_touches_an_aligned_word() {
        let mut rng = rng();
        let data = vec![0u8; 16];
        let out = arithmetic(&data, &mut rng);
        assert_eq!(out.len(), 16);
        let changed: Vec<usize> = (0..16).filter(|i| out[*i] != 0).collect();
        assert!(!changed.is_empty());
        // All changed bytes fall inside one aligned 4-byte word.
        let word = changed[0] / 4;
        assert!(changed.iter().all(|i| i / 4 == word));
    }

    #[test]
    fn short_inputs_pass_through() {
        let mut rng = rng();
        assert_eq!(arithmetic(&[1, 2, 3], &mut rng), vec![1, 2, 3]);
        assert_eq!(interesting(&[7], &mut rng), vec![7]);
        assert!(bitflip(&[], &mut rng).is_empty());
    }

    #[test]
    fn havoc_is_bounded() {
        let mut rng = rng();
        let mut data = vec![0u8; 64];
        for _ in 0..200 {
            data = havoc(&data, &mut rng);
            assert!(data.len() <= HAVOC_MAX_LEN + 16 + 32);
        }
    }

    #[test]
    fn splice_requires_two_seeds() {
        let mut rng = rng();
        let corpus = vec![vec![1, 2, 3]];
        assert_eq!(splice(&[1, 2, 3], &corpus, &mut rng), vec![1, 2, 3]);

        let corpus = vec![vec![1, 2, 3], vec![9, 9, 9, 9]];
        let out = splice(&[1, 2, 3], &corpus, &mut rng);
        assert!(out.len() <= 7);
    }

    #[test]
    fn unknown_mutator_is_identity() {
        let mut rng = rng();
        assert_eq!(apply("bogus", &[1, 2], &[], &mut rng), vec![1, 2]);
    }
}
