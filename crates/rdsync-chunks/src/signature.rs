//! Signature artifacts
//!
//! A signature is an 8-byte magic followed by one fixed 48-byte record per
//! content-defined chunk:
//!
//! ```text
//! offset: u64 LE | length: u64 LE | blake3: [u8; 32]
//! ```
//!
//! Records are written in offset order, so a reader can process the stream
//! a buffer at a time without seeing the whole artifact.

use std::sync::Arc;

use rdsync_core::{RdsyncError, RdsyncResult, SignatureInfo};
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::debug;

use crate::fastcdc::{chunk_data, ChunkSizes};
use crate::repository::SignatureRepository;

pub const SIGNATURE_MAGIC: &[u8; 8] = b"RDSIG\0\0\x01";
pub const RECORD_LEN: usize = 48;

/// One chunk of a signature
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignatureEntry {
    pub offset: u64,
    pub length: u64,
    pub hash: [u8; 32],
}

impl SignatureEntry {
    pub fn encode_into(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.offset.to_le_bytes());
        out.extend_from_slice(&self.length.to_le_bytes());
        out.extend_from_slice(&self.hash);
    }

    /// Decode exactly one record; `None` when `buf` is not `RECORD_LEN` long.
    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() != RECORD_LEN {
            return None;
        }
        let offset = u64::from_le_bytes(buf[0..8].try_into().ok()?);
        let length = u64::from_le_bytes(buf[8..16].try_into().ok()?);
        let hash: [u8; 32] = buf[16..48].try_into().ok()?;
        Some(SignatureEntry {
            offset,
            length,
            hash,
        })
    }
}

/// An in-memory signature
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Signature {
    pub entries: Vec<SignatureEntry>,
}

impl Signature {
    /// Chunk `data` and hash every chunk.
    pub fn compute(data: &[u8], sizes: ChunkSizes) -> Self {
        let entries = chunk_data(data, sizes)
            .into_iter()
            .map(|c| SignatureEntry {
                offset: c.offset,
                length: c.length,
                hash: *c.hash.as_bytes(),
            })
            .collect();
        Signature { entries }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(SIGNATURE_MAGIC.len() + self.entries.len() * RECORD_LEN);
        out.extend_from_slice(SIGNATURE_MAGIC);
        for entry in &self.entries {
            entry.encode_into(&mut out);
        }
        out
    }

    pub fn from_bytes(buf: &[u8]) -> RdsyncResult<Self> {
        let body = buf
            .strip_prefix(SIGNATURE_MAGIC.as_slice())
            .ok_or_else(|| RdsyncError::Signature("bad signature magic".into()))?;
        if body.len() % RECORD_LEN != 0 {
            return Err(RdsyncError::Signature(format!(
                "signature body of {} bytes is not a whole number of records",
                body.len()
            )));
        }
        let entries = body
            .chunks_exact(RECORD_LEN)
            .filter_map(SignatureEntry::decode)
            .collect();
        Ok(Signature { entries })
    }

    /// Total content length described by this signature
    pub fn content_length(&self) -> u64 {
        self.entries.last().map_or(0, |e| e.offset.saturating_add(e.length))
    }
}

/// Computes signatures of content streams and stores them in a repository.
pub struct SignatureProvider {
    sizes: ChunkSizes,
}

impl SignatureProvider {
    pub fn new(sizes: ChunkSizes) -> RdsyncResult<Self> {
        sizes.validate()?;
        Ok(SignatureProvider { sizes })
    }

    pub fn sizes(&self) -> ChunkSizes {
        self.sizes
    }

    /// Read `content` to its end and return the encoded signature.
    ///
    /// Chunking and hashing run on the blocking pool so large files do not
    /// stall other tasks on the runtime.
    pub async fn compute<R>(&self, content: &mut R) -> RdsyncResult<Vec<u8>>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let mut data = Vec::new();
        content
            .read_to_end(&mut data)
            .await
            .map_err(|e| RdsyncError::Signature(format!("content stream is unreadable: {e}")))?;

        let sizes = self.sizes;
        let signature = tokio::task::spawn_blocking(move || Signature::compute(&data, sizes))
            .await
            .map_err(|e| RdsyncError::Signature(format!("signature task failed: {e}")))?;

        Ok(signature.to_bytes())
    }

    /// Compute the signature of `content` and store it under `name`.
    pub async fn generate<R>(
        &self,
        name: &str,
        content: &mut R,
        repository: &Arc<dyn SignatureRepository>,
    ) -> RdsyncResult<SignatureInfo>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let bytes = self.compute(content).await?;
        let info = repository.store(name, bytes).await?;
        debug!(signature = %info.name, length = info.length, "signature generated");
        Ok(info)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::MemorySignatureRepository;

    fn sample(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i.wrapping_mul(31) ^ (i >> 5)) as u8).collect()
    }

    #[test]
    fn encoded_length_is_magic_plus_records() {
        let sig = Signature::compute(&sample(50_000), ChunkSizes::default());
        let bytes = sig.to_bytes();
        assert_eq!(bytes.len(), 8 + sig.entries.len() * RECORD_LEN);
        assert_eq!(Signature::from_bytes(&bytes).unwrap(), sig);
        assert_eq!(sig.content_length(), 50_000);
    }

    #[test]
    fn empty_content_has_header_only() {
        let bytes = Signature::compute(&[], ChunkSizes::default()).to_bytes();
        assert_eq!(bytes, SIGNATURE_MAGIC.to_vec());
    }

    #[test]
    fn rejects_bad_magic_and_torn_records() {
        assert!(matches!(
            Signature::from_bytes(b"NOTASIG!"),
            Err(RdsyncError::Signature(_))
        ));

        let mut torn = Signature::compute(&sample(10_000), ChunkSizes::default()).to_bytes();
        torn.truncate(torn.len() - 5);
        assert!(matches!(Signature::from_bytes(&torn), Err(RdsyncError::Signature(_))));
    }

    #[test]
    fn provider_rejects_invalid_sizes() {
        let bad = ChunkSizes {
            min_size: 1,
            avg_size: 2,
            max_size: 3,
        };
        assert!(SignatureProvider::new(bad).is_err());
    }

    #[tokio::test]
    async fn provider_stores_signature_in_repository() {
        let repo: Arc<dyn SignatureRepository> = Arc::new(MemorySignatureRepository::new());
        let provider = SignatureProvider::new(ChunkSizes::default()).unwrap();
        let data = sample(20_000);

        let info = provider
            .generate("test.bin.sig", &mut data.as_slice(), &repo)
            .await
            .unwrap();

        assert_eq!(info.name, "test.bin.sig");
        let mut stored = Vec::new();
        repo.content_for_reading("test.bin.sig")
            .await
            .unwrap()
            .read_to_end(&mut stored)
            .await
            .unwrap();
        assert_eq!(stored.len() as u64, info.length);
        assert_eq!(Signature::from_bytes(&stored).unwrap().content_length(), 20_000);
    }
}
