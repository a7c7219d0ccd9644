//! rdsync-chunks: signatures and delta planning
//!
//! # Overview
//! - `blake3`: content hashing (chunk identity, file ETags)
//! - `fastcdc`: content-defined chunking, stable boundaries under inserts
//! - `signature`: signature artifact format and the signature provider
//! - `repository`: named signature storage
//! - `comparator`: incremental seed/source signature comparison
//! - `need_list`: drives the comparator into an ordered reconstruction plan

pub mod blake3;
pub mod comparator;
pub mod fastcdc;
pub mod need_list;
pub mod repository;
pub mod signature;

pub use blake3::{hash_bytes, hash_from_hex, hash_reader, hash_to_hex, Hash};
pub use comparator::{Comparator, ComparatorError, InputBuffer, NeedBuffer};
pub use fastcdc::{chunk_data, Chunk, ChunkSizes};
pub use need_list::{apply_needs, NeedListGenerator, NeedListOptions};
pub use repository::{MemorySignatureRepository, SignatureRepository};
pub use signature::{Signature, SignatureEntry, SignatureProvider};
