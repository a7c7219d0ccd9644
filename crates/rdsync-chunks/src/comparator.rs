//! Incremental signature comparison
//!
//! The seed signature (what the destination already has) is indexed up
//! front. The source signature is then fed through [`Comparator::process`]
//! a buffer at a time; each call consumes as much input as it can, writes
//! at most one batch of [`Need`]s, and reports whether the plan is complete.
//!
//! Records may straddle input buffers. Adjacent needs of the same kind are
//! merged, so a plan for an unchanged file is a single `FromSeed` block.

use std::collections::HashMap;

use rdsync_core::Need;
use rdsync_core::NeedType;
use thiserror::Error;

use crate::signature::{Signature, SignatureEntry, RECORD_LEN, SIGNATURE_MAGIC};

#[derive(Debug, Error)]
pub enum ComparatorError {
    #[error("seed signature is {size} bytes, above the {limit} byte comparator limit")]
    SeedTooLarge { size: usize, limit: usize },

    #[error("malformed seed signature: {0}")]
    BadSeed(String),

    #[error("source signature header is invalid")]
    BadMagic,

    #[error("source signature ends inside a record")]
    TruncatedRecord,

    #[error("source record at offset {found} does not follow offset {expected}")]
    NonContiguous { expected: u64, found: u64 },

    #[error("source record at offset {0} has zero length")]
    EmptyRecord(u64),

    #[error("source record at offset {0} ends past the largest addressable offset")]
    OffsetOverflow(u64),
}

/// Source signature bytes read so far; `data[used..size]` is unconsumed.
#[derive(Debug)]
pub struct InputBuffer {
    data: Vec<u8>,
    pub size: usize,
    pub used: usize,
}

impl InputBuffer {
    pub fn with_capacity(capacity: usize) -> Self {
        InputBuffer {
            data: vec![0u8; capacity.max(1)],
            size: 0,
            used: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn is_drained(&self) -> bool {
        self.used >= self.size
    }

    /// Whole backing array, for refilling.
    pub fn spare_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Mark the first `size` bytes as fresh input.
    pub fn reset(&mut self, size: usize) {
        self.size = size.min(self.data.len());
        self.used = 0;
    }

    fn pending(&self) -> &[u8] {
        &self.data[self.used..self.size]
    }
}

/// Fixed-capacity batch of needs written by one comparator step.
#[derive(Debug)]
pub struct NeedBuffer {
    needs: Vec<Need>,
    capacity: usize,
}

impl NeedBuffer {
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        NeedBuffer {
            needs: Vec::with_capacity(capacity),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_full(&self) -> bool {
        self.needs.len() >= self.capacity
    }

    pub fn clear(&mut self) {
        self.needs.clear();
    }

    pub fn as_slice(&self) -> &[Need] {
        &self.needs
    }

    fn push(&mut self, need: Need) {
        debug_assert!(!self.is_full());
        self.needs.push(need);
    }
}

#[derive(Debug)]
pub struct Comparator {
    seed_index: HashMap<[u8; 32], (u64, u64)>,
    header: Vec<u8>,
    record: Vec<u8>,
    pending: Option<Need>,
    next_offset: u64,
}

impl Comparator {
    /// Index a seed signature. An empty seed means the destination has
    /// nothing to reuse.
    pub fn from_seed_signature(seed: &[u8], limit: usize) -> Result<Self, ComparatorError> {
        if seed.len() > limit {
            return Err(ComparatorError::SeedTooLarge {
                size: seed.len(),
                limit,
            });
        }

        let mut seed_index = HashMap::new();
        if !seed.is_empty() {
            let signature =
                Signature::from_bytes(seed).map_err(|e| ComparatorError::BadSeed(e.to_string()))?;
            for entry in signature.entries {
                if entry.offset.checked_add(entry.length).is_none() {
                    return Err(ComparatorError::BadSeed(format!(
                        "block at offset {} with length {} overflows",
                        entry.offset, entry.length
                    )));
                }
                seed_index
                    .entry(entry.hash)
                    .or_insert((entry.offset, entry.length));
            }
        }

        Ok(Comparator {
            seed_index,
            header: Vec::with_capacity(SIGNATURE_MAGIC.len()),
            record: Vec::with_capacity(RECORD_LEN),
            pending: None,
            next_offset: 0,
        })
    }

    /// Number of distinct seed blocks available for reuse
    pub fn seed_blocks(&self) -> usize {
        self.seed_index.len()
    }

    /// Consume input and emit needs.
    ///
    /// Returns `Ok(true)` once `eof_input` is set, every input byte has been
    /// consumed and the final need has been written. Returns `Ok(false)`
    /// when the caller must refill `input` or drain `output` first.
    pub fn process(
        &mut self,
        eof_input: bool,
        input: &mut InputBuffer,
        output: &mut NeedBuffer,
    ) -> Result<bool, ComparatorError> {
        self.consume_header(input)?;

        while self.header_done() && !output.is_full() && !input.is_drained() {
            let want = RECORD_LEN - self.record.len();
            let take = want.min(input.size - input.used);
            self.record.extend_from_slice(&input.pending()[..take]);
            input.used += take;

            if self.record.len() == RECORD_LEN {
                let entry =
                    SignatureEntry::decode(&self.record).ok_or(ComparatorError::TruncatedRecord)?;
                self.record.clear();
                self.emit(entry, output)?;
            }
        }

        if !(eof_input && input.is_drained()) {
            return Ok(false);
        }

        if !self.record.is_empty() || (!self.header.is_empty() && !self.header_done()) {
            return Err(ComparatorError::TruncatedRecord);
        }
        if let Some(last) = self.pending {
            if output.is_full() {
                return Ok(false);
            }
            output.push(last);
            self.pending = None;
        }
        Ok(true)
    }

    fn header_done(&self) -> bool {
        self.header.len() == SIGNATURE_MAGIC.len()
    }

    fn consume_header(&mut self, input: &mut InputBuffer) -> Result<(), ComparatorError> {
        if self.header_done() {
            return Ok(());
        }
        let want = SIGNATURE_MAGIC.len() - self.header.len();
        let take = want.min(input.size - input.used);
        self.header.extend_from_slice(&input.pending()[..take]);
        input.used += take;

        if self.header_done() && self.header.as_slice() != SIGNATURE_MAGIC.as_slice() {
            return Err(ComparatorError::BadMagic);
        }
        Ok(())
    }

    fn emit(&mut self, entry: SignatureEntry, output: &mut NeedBuffer) -> Result<(), ComparatorError> {
        if entry.offset != self.next_offset {
            return Err(ComparatorError::NonContiguous {
                expected: self.next_offset,
                found: entry.offset,
            });
        }
        if entry.length == 0 {
            return Err(ComparatorError::EmptyRecord(entry.offset));
        }
        self.next_offset = self
            .next_offset
            .checked_add(entry.length)
            .ok_or(ComparatorError::OffsetOverflow(entry.offset))?;

        let need = match self.seed_index.get(&entry.hash) {
            Some(&(seed_offset, length)) if length == entry.length => {
                Need::from_seed(entry.offset, seed_offset, entry.length)
            }
            _ => Need::from_source(entry.offset, entry.length),
        };

        match self.pending.as_mut() {
            Some(prev) if extends(prev, &need) => prev.block_length += need.block_length,
            _ => {
                if let Some(prev) = self.pending.replace(need) {
                    output.push(prev);
                }
            }
        }
        Ok(())
    }
}

fn extends(prev: &Need, next: &Need) -> bool {
    if prev.block_type != next.block_type
        || prev.file_offset.checked_add(prev.block_length) != Some(next.file_offset)
    {
        return false;
    }
    match prev.block_type {
        NeedType::FromSeed => prev.seed_offset.checked_add(prev.block_length) == Some(next.seed_offset),
        NeedType::FromSource => true,
    }
}
