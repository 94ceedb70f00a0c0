//! Storage core for HDF5 files.
//!
//! This crate provides the layers underneath datasets and groups:
//!
//! - a hash-slot metadata cache with protect/unprotect access
//!   ([`metadata_cache`]),
//! - the version 1 B-link tree engine, generic over node classes
//!   ([`btree_v1`]), with two classes on top: v1 groups
//!   ([`symbol_table`], [`group_v1`]) and the chunk index
//!   ([`chunk_index`]),
//! - the raw data chunk cache and filter pipeline ([`chunk_cache`],
//!   [`filters`]) and hyperslab I/O on chunked datasets ([`chunked_io`]).
//!
//! Everything runs on one thread against a [`BlockStore`], either in memory
//! or backed by a file.

pub mod block_store;
pub mod btree_v1;
pub mod chunk_cache;
pub mod chunk_index;
pub mod chunked_io;
pub(crate) mod codec;
pub mod config;
pub mod error;
pub mod file;
pub mod filters;
pub mod group_v1;
pub mod local_heap;
pub mod metadata_cache;
pub mod symbol_table;

pub use block_store::{AllocKind, BlockStore, FileStore, MemoryStore};
pub use btree_v1::{NodeClass, TreeShape};
pub use chunk_cache::{ChunkHandle, ChunkStorage, RawChunkCache, RdccStats};
pub use chunk_index::{ChunkInfo, ChunkKey, ChunkLayout};
pub use chunked_io::ChunkedDataset;
pub use config::{FileConfig, RdccConfig, SplitRatios};
pub use error::{FormatError, Result};
pub use file::{FileContext, Hdf5File};
pub use filters::{FilterDescription, FilterPipeline};
pub use group_v1::{Group, GroupEntry};
pub use local_heap::LocalHeap;
pub use metadata_cache::{CacheClass, CacheClassId, CacheStats, CacheThing, MetadataCache, Protected};
pub use symbol_table::SymbolTableEntry;
