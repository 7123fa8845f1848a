//! Checksum algorithms for auto-computed checksum fields.

use crate::plugin::ChecksumAlgorithm;

/// Compute a checksum over `data`. The result is the full-width value;
/// the serializer masks it to the checksum field's width.
pub fn compute(algorithm: ChecksumAlgorithm, data: &[u8]) -> u64 {
    match algorithm {
        ChecksumAlgorithm::Crc32 => crc32fast::hash(data) as u64,
        ChecksumAlgorithm::Adler32 => {
            let mut hasher = adler::Adler32::new();
            hasher.write_slice(data);
            hasher.checksum() as u64
        }
        ChecksumAlgorithm::Sum => {
            data.iter().fold(0u32, |acc, b| acc.wrapping_add(*b as u32)) as u64
        }
        ChecksumAlgorithm::Sum8 => {
            (data.iter().fold(0u32, |acc, b| acc.wrapping_add(*b as u32)) & 0xFF) as u64
        }
        ChecksumAlgorithm::Sum16 => {
            (data.iter().fold(0u32, |acc, b| acc.wrapping_add(*b as u32)) & 0xFFFF) as u64
        }
        ChecksumAlgorithm::Xor => data.iter().fold(0u8, |acc, b| acc ^ b) as u64,
    }
}
