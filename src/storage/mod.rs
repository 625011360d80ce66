//! Core abstractions and implementation for indexed storage.
//!
//! This module contains the paged storage layer and the B+ tree built on top
//! of it. Data flows downward on writes (tree → cache → pager → file) and
//! upward on reads.
//!
//! # Overview
//!
//! The layer is built leaves-first:
//!
//! - [`Position`](position::Position) and [`Page`](page::Page): an opaque file
//!   offset and the fixed-size byte buffer that is the unit of disk I/O.
//! - [`allocator`]: strategies handing out and reclaiming page-aligned
//!   positions, plus the inner-region allocator for sub-page byte ranges.
//! - [`PageCache`](cache::PageCache): a write-behind LRU over positions and
//!   pages; dirty pages are synced on eviction, never before.
//! - [`Pager`](pager::Pager): owns the backing file, the cache and the
//!   allocators; everything above it speaks positions, not offsets.
//! - [`Node`](node::Node): one page interpreted as a B+ tree node, with a
//!   binary codec and page-size-derived fanout.
//! - [`Btree`](btree::Btree): the ordered index itself.
//! - [`IndirectionVector`](indvec::IndirectionVector): stable-ish slot IDs
//!   over variable-sized payloads stored in page-packed inner regions.
//!
//! # Durability
//!
//! The engine is single-writer and cooperative. The durability boundary is an
//! explicit `save`: headers are rewritten, allocator state is serialized, and
//! the cache is flushed in LRU order. Nothing is journaled; callers recover
//! from a failed mutation by reloading the last saved state.

pub mod allocator;
pub mod btree;
pub mod cache;
pub mod indvec;
pub mod node;
pub mod page;
pub mod pager;
pub mod position;

use std::io;

use bincode::config::{Configuration, Fixint, LittleEndian};
use thiserror::Error;

pub use btree::{Btree, InsertOutcome, RemoveOutcome};
pub use indvec::{IndirectionVector, SlotId, SlotTree};
pub use node::{Key, Value};
pub use position::Position;

/// Serializer configuration shared by every on-disk structure: little-endian,
/// fixed-width integers.
pub type CodecConfig = Configuration<LittleEndian, Fixint>;

pub(crate) fn codec_config() -> CodecConfig {
    bincode::config::standard().with_fixed_int_encoding()
}

/// List of possible errors that can be surfaced by the storage module.
///
/// Every failure is reported to the direct caller; nothing is retried and no
/// partial mutation is rolled back.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("read failed: {cause}")]
    BadRead { cause: ReadError },

    #[error("write failed: {cause}")]
    BadWrite { cause: WriteError },

    #[error("allocation failed: {cause}")]
    BadAlloc { cause: AllocError },

    #[error("indirection vector inconsistent: {reason}")]
    BadIndVector { reason: String },

    #[error("header mismatch: {cause}")]
    HeaderMismatch { cause: HeaderError },

    #[error("no such entry")]
    NoSuchEntry,
}

#[derive(Debug, Error)]
pub enum ReadError {
    #[error("io; {0}")]
    Io(#[from] io::Error),
    #[error("decode; {0}")]
    Decode(#[from] bincode::error::DecodeError),
    #[error("access past end of page")]
    OutOfPage,
    #[error("no slot with id {0}")]
    MissingSlot(u64),
    #[error("malformed coded stream")]
    Malformed,
}

#[derive(Debug, Error)]
pub enum WriteError {
    #[error("io; {0}")]
    Io(#[from] io::Error),
    #[error("encode; {0}")]
    Encode(#[from] bincode::error::EncodeError),
    #[error("serialized node exceeds one page")]
    NodeOverflow,
    #[error("name longer than 255 bytes")]
    NameTooLong,
}

#[derive(Debug, Error)]
pub enum AllocError {
    #[error("free is unsupported by the stack allocator")]
    FreeUnsupported,
    #[error("page space exhausted")]
    Exhausted,
    #[error("inner request of {0} bytes exceeds page capacity")]
    Oversized(u32),
}

#[derive(Debug, Error)]
pub enum HeaderError {
    #[error("bad magic {found:#010x}, expected {expected:#010x}")]
    BadMagic { found: u32, expected: u32 },
    #[error("page size {found}, expected {expected}")]
    PageSize { found: u32, expected: u32 },
}

impl From<ReadError> for StorageError {
    fn from(cause: ReadError) -> Self {
        StorageError::BadRead { cause }
    }
}

impl From<WriteError> for StorageError {
    fn from(cause: WriteError) -> Self {
        StorageError::BadWrite { cause }
    }
}

impl From<AllocError> for StorageError {
    fn from(cause: AllocError) -> Self {
        StorageError::BadAlloc { cause }
    }
}

impl From<HeaderError> for StorageError {
    fn from(cause: HeaderError) -> Self {
        StorageError::HeaderMismatch { cause }
    }
}
