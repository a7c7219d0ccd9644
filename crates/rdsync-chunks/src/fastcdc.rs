//! FastCDC content-defined chunking
//!
//! Boundaries depend on content, not position, so inserting bytes near the
//! start of a file only disturbs the chunks around the edit. That is what
//! lets a seed signature and a source signature share most of their hashes.
//!
//! Chunk hashing runs on the rayon pool once the boundaries are known.

use rayon::prelude::*;
use rdsync_core::config::SignatureConfig;
use rdsync_core::{RdsyncError, RdsyncResult};

/// Bounds enforced by `fastcdc::v2020`; it panics outside them.
const MIN_SIZE_RANGE: (u32, u32) = (64, 1_048_576);
const AVG_SIZE_RANGE: (u32, u32) = (256, 4_194_304);
const MAX_SIZE_RANGE: (u32, u32) = (1024, 16_777_216);

/// A single content-defined chunk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// Byte offset within the content
    pub offset: u64,
    /// Chunk length in bytes
    pub length: u64,
    /// BLAKE3 hash of this chunk's data
    pub hash: crate::blake3::Hash,
}

/// Chunk size configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkSizes {
    pub min_size: u32,
    pub avg_size: u32,
    pub max_size: u32,
}

impl Default for ChunkSizes {
    fn default() -> Self {
        SignatureConfig::default().into()
    }
}

impl From<SignatureConfig> for ChunkSizes {
    fn from(cfg: SignatureConfig) -> Self {
        ChunkSizes {
            min_size: cfg.min_chunk,
            avg_size: cfg.avg_chunk,
            max_size: cfg.max_chunk,
        }
    }
}

impl ChunkSizes {
    /// Reject sizes FastCDC would refuse.
    pub fn validate(&self) -> RdsyncResult<()> {
        let in_range = |v: u32, (lo, hi): (u32, u32)| v >= lo && v <= hi;

        if !in_range(self.min_size, MIN_SIZE_RANGE)
            || !in_range(self.avg_size, AVG_SIZE_RANGE)
            || !in_range(self.max_size, MAX_SIZE_RANGE)
        {
            return Err(RdsyncError::Signature(format!(
                "chunk sizes out of range: min={} avg={} max={}",
                self.min_size, self.avg_size, self.max_size
            )));
        }
        if self.min_size > self.avg_size || self.avg_size > self.max_size {
            return Err(RdsyncError::Signature(format!(
                "chunk sizes must satisfy min <= avg <= max (got {}/{}/{})",
                self.min_size, self.avg_size, self.max_size
            )));
        }
        Ok(())
    }
}

/// Split `data` into content-defined chunks using FastCDC.
///
/// Empty data yields no chunks. Sizes must already be validated.
pub fn chunk_data(data: &[u8], sizes: ChunkSizes) -> Vec<Chunk> {
    if data.is_empty() {
        return vec![];
    }

    let bounds: Vec<(usize, usize)> =
        fastcdc::v2020::FastCDC::new(data, sizes.min_size, sizes.avg_size, sizes.max_size)
            .map(|c| (c.offset, c.length))
            .collect();

    bounds
        .par_iter()
        .map(|&(offset, length)| Chunk {
            offset: offset as u64,
            length: length as u64,
            hash: crate::blake3::hash_bytes(&data[offset..offset + length]),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn empty_data_yields_no_chunks() {
        assert!(chunk_data(&[], ChunkSizes::default()).is_empty());
    }

    #[test]
    fn default_sizes_come_from_signature_config() {
        let sizes = ChunkSizes::default();
        assert_eq!(sizes.min_size, 512);
        assert_eq!(sizes.avg_size, 2048);
        assert_eq!(sizes.max_size, 8192);
        sizes.validate().unwrap();
    }

    #[test]
    fn out_of_range_sizes_are_rejected() {
        let tiny = ChunkSizes {
            min_size: 16,
            avg_size: 32,
            max_size: 64,
        };
        assert!(matches!(tiny.validate(), Err(RdsyncError::Signature(_))));

        let inverted = ChunkSizes {
            min_size: 4096,
            avg_size: 2048,
            max_size: 8192,
        };
        assert!(matches!(inverted.validate(), Err(RdsyncError::Signature(_))));
    }

    #[test]
    fn chunk_offsets_are_contiguous() {
        let data: Vec<u8> = (0u8..=255).cycle().take(128 * 1024).collect();
        let chunks = chunk_data(&data, ChunkSizes::default());

        let mut expected_offset = 0u64;
        for chunk in &chunks {
            assert_eq!(chunk.offset, expected_offset, "chunks must be contiguous");
            assert!(chunk.length <= 8192);
            expected_offset += chunk.length;
        }
        assert_eq!(expected_offset as usize, data.len());
    }

    #[test]
    fn prefix_insert_keeps_later_chunks() {
        let body: Vec<u8> = (0u32..64 * 1024)
            .map(|i| (i.wrapping_mul(2_654_435_761) >> 13) as u8)
            .collect();
        let mut edited = b"Coconut is Stupid".to_vec();
        edited.extend_from_slice(&body);

        let before = chunk_data(&body, ChunkSizes::default());
        let after = chunk_data(&edited, ChunkSizes::default());

        let shared = after
            .iter()
            .filter(|c| before.iter().any(|b| b.hash == c.hash))
            .count();
        assert!(shared * 2 >= before.len(), "most chunks must survive a prefix insert");
    }

    proptest! {
        #[test]
        fn chunking_is_deterministic(data in proptest::collection::vec(any::<u8>(), 0..=32768)) {
            let c1 = chunk_data(&data, ChunkSizes::default());
            let c2 = chunk_data(&data, ChunkSizes::default());
            prop_assert_eq!(c1, c2);
        }

        #[test]
        fn chunks_cover_full_input(data in proptest::collection::vec(any::<u8>(), 1..=65536)) {
            let chunks = chunk_data(&data, ChunkSizes::default());
            let total: u64 = chunks.iter().map(|c| c.length).sum();
            prop_assert_eq!(total as usize, data.len());
        }
    }
}
