//! Need-list generation
//!
//! Drives a [`Comparator`] over a seed and a source signature read from
//! signature repositories, and collects the ordered plan describing how to
//! rebuild the source file on a destination that holds the seed.

use std::sync::Arc;

use rdsync_core::config::SyncConfig;
use rdsync_core::{Need, NeedType, RdsyncError, RdsyncResult, SignatureInfo};
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, trace};

use crate::comparator::{Comparator, InputBuffer, NeedBuffer};
use crate::repository::SignatureRepository;

/// Buffer sizing for one generator
#[derive(Debug, Clone, Copy)]
pub struct NeedListOptions {
    pub input_buffer_size: usize,
    pub comparator_buffer_size: usize,
    pub need_batch_size: usize,
}

impl Default for NeedListOptions {
    fn default() -> Self {
        SyncConfig::default().into()
    }
}

impl From<SyncConfig> for NeedListOptions {
    fn from(cfg: SyncConfig) -> Self {
        NeedListOptions {
            input_buffer_size: cfg.input_buffer_size,
            comparator_buffer_size: cfg.comparator_buffer_size,
            need_batch_size: cfg.need_batch_size,
        }
    }
}

/// Working memory for one `create_need_list` call. Owned by the call's
/// scope and released when it ends, on every exit path.
struct ScratchBuffers {
    input: InputBuffer,
    output: NeedBuffer,
}

impl ScratchBuffers {
    fn new(options: &NeedListOptions) -> Self {
        ScratchBuffers {
            input: InputBuffer::with_capacity(options.input_buffer_size),
            output: NeedBuffer::with_capacity(options.need_batch_size),
        }
    }
}

impl Drop for ScratchBuffers {
    fn drop(&mut self) {
        trace!(
            input_capacity = self.input.capacity(),
            need_capacity = self.output.capacity(),
            "released need-list scratch buffers"
        );
    }
}

pub struct NeedListGenerator {
    seed_repository: Arc<dyn SignatureRepository>,
    source_repository: Arc<dyn SignatureRepository>,
    options: NeedListOptions,
}

impl NeedListGenerator {
    pub fn new(
        seed_repository: Arc<dyn SignatureRepository>,
        source_repository: Arc<dyn SignatureRepository>,
        options: NeedListOptions,
    ) -> Self {
        NeedListGenerator {
            seed_repository,
            source_repository,
            options,
        }
    }

    /// Compare the named signatures and return the reconstruction plan.
    ///
    /// Fails with `Signature` if the seed cannot be indexed, and with
    /// `DeltaComputation` if either signature cannot be read or the source
    /// signature is malformed. No partial plan is ever returned.
    pub async fn create_need_list(
        &self,
        seed: &SignatureInfo,
        source: &SignatureInfo,
    ) -> RdsyncResult<Vec<Need>> {
        let seed_bytes = self.read_seed(seed).await?;
        let mut comparator =
            Comparator::from_seed_signature(&seed_bytes, self.options.comparator_buffer_size)
                .map_err(|e| RdsyncError::Signature(format!("cannot create comparator: {e}")))?;
        drop(seed_bytes);

        let mut source_stream = self
            .source_repository
            .content_for_reading(&source.name)
            .await
            .map_err(|e| RdsyncError::delta("cannot open the source signature", e))?;

        let mut scratch = ScratchBuffers::new(&self.options);
        let mut needs = Vec::new();
        let mut eof_input = false;
        let mut eof_output = false;

        while !eof_output {
            if scratch.input.is_drained() && !eof_input {
                let read = fill_buffer(&mut source_stream, scratch.input.spare_mut())
                    .await
                    .map_err(|e| RdsyncError::delta("failed to read the source signature", e))?;
                scratch.input.reset(read);
                eof_input = read < scratch.input.capacity();
            }

            scratch.output.clear();
            eof_output = comparator
                .process(eof_input, &mut scratch.input, &mut scratch.output)
                .map_err(|e| RdsyncError::delta("failed to process the signature block", e))?;
            needs.extend_from_slice(scratch.output.as_slice());
        }

        debug!(
            seed = %seed.name,
            source = %source.name,
            needs = needs.len(),
            "need list created"
        );
        Ok(needs)
    }

    async fn read_seed(&self, seed: &SignatureInfo) -> RdsyncResult<Vec<u8>> {
        let mut stream = self
            .seed_repository
            .content_for_reading(&seed.name)
            .await
            .map_err(|e| RdsyncError::delta("cannot open the seed signature", e))?;

        // One byte past the limit is enough to tell the comparator it is too big.
        let limit = self.options.comparator_buffer_size as u64 + 1;
        let mut buf = Vec::new();
        (&mut stream)
            .take(limit)
            .read_to_end(&mut buf)
            .await
            .map_err(|e| RdsyncError::delta("failed to read the seed signature", e))?;
        Ok(buf)
    }
}

/// Read until `buf` is full or the stream ends.
async fn fill_buffer<R>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// Rebuild a file from `seed` and `source` following `needs`.
///
/// Needs must be contiguous from offset zero.
pub fn apply_needs(seed: &[u8], source: &[u8], needs: &[Need]) -> RdsyncResult<Vec<u8>> {
    let capacity = needs.last().map_or(0, |n| n.file_offset.saturating_add(n.block_length));
    let mut out = Vec::with_capacity(usize::try_from(capacity).unwrap_or(0).min(source.len() + seed.len()));

    for need in needs {
        if need.file_offset != out.len() as u64 {
            return Err(RdsyncError::DeltaComputation {
                message: format!(
                    "need at offset {} does not follow offset {}",
                    need.file_offset,
                    out.len()
                ),
                source: None,
            });
        }
        let (from, start) = match need.block_type {
            NeedType::FromSeed => (seed, need.seed_offset),
            NeedType::FromSource => (source, need.file_offset),
        };
        let start = usize::try_from(start).unwrap_or(usize::MAX);
        let end = usize::try_from(need.block_length)
            .ok()
            .and_then(|length| start.checked_add(length))
            .ok_or_else(|| RdsyncError::DeltaComputation {
                message: format!("{} block at {start} overflows", need.block_type),
                source: None,
            })?;
        let block = from
            .get(start..end)
            .ok_or_else(|| RdsyncError::DeltaComputation {
                message: format!("{} block {start}..{end} is out of range", need.block_type),
                source: None,
            })?;
        out.extend_from_slice(block);
    }

    Ok(out)
}
