//! An embedded key-value indexing engine built on a paged B+ tree.
//!
//! The engine stores ordered key-value pairs in fixed-size pages behind a
//! write-behind LRU cache, with a pluggable page allocator and an optional
//! Huffman codec used both on stored values and as a standalone file-bundle
//! utility. It is a single-process, single-writer design whose durability
//! boundary is an explicit `save` call.
//!
//! # Example
//!
//! ```no_run
//! use floe::{Btree, OpenMode, TreeOptions};
//!
//! let mut tree: Btree<i32, i32> =
//!     Btree::open("floe.db", OpenMode::Bare, TreeOptions::default()).unwrap();
//! tree.insert(42, 4200).unwrap();
//! assert_eq!(tree.get(&42).unwrap(), Some(4200));
//! tree.save().unwrap();
//! ```

pub mod compression;
pub mod config;
pub mod storage;

pub use compression::{Compressor, Decompressor, compress_bytes, decompress_bytes};
pub use config::{AllocatorKind, EvictionKind, OpenMode, TreeOptions};
pub use storage::{
    Btree, IndirectionVector, InsertOutcome, Position, RemoveOutcome, SlotId, SlotTree,
    StorageError,
};
