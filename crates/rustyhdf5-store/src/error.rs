//! Error types for the metadata cache, B-tree engine and chunk storage.

use crate::metadata_cache::CacheClassId;

/// Result alias used throughout the crate.
pub type Result<T> = core::result::Result<T, FormatError>;

/// Errors raised by the storage core.
///
/// Most errors bubble straight up to the caller; the wrapping variants
/// (`CantLoad`, `CantFlush`, `CantSplit`, `CantInsert`) record which
/// structural step failed and keep the underlying cause as their source.
#[derive(Debug, thiserror::Error)]
pub enum FormatError {
    /// I/O error from the underlying file.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Unexpected end of data while decoding a block.
    #[error("unexpected EOF: need {expected} bytes, have {available}")]
    UnexpectedEof {
        /// Number of bytes expected.
        expected: usize,
        /// Number of bytes actually available.
        available: usize,
    },

    /// A read or write touched bytes past the end of allocated space.
    #[error("address range {addr:#x}+{size} is beyond end of allocated space {eoa:#x}")]
    AddressOutOfRange {
        /// Start of the access.
        addr: u64,
        /// Length of the access.
        size: u64,
        /// Current end-of-address.
        eoa: u64,
    },

    /// The block store could not satisfy an allocation.
    #[error("unable to allocate {size} bytes of file space")]
    AllocationFailed {
        /// Requested size in bytes.
        size: u64,
    },

    /// An address maps to a cached object of a different class.
    #[error("cache corruption at {addr:#x}: expected {expected}, found {found}")]
    CacheCorruption {
        /// Address that was looked up.
        addr: u64,
        /// Class the caller asked for.
        expected: CacheClassId,
        /// Class actually cached at that address.
        found: CacheClassId,
    },

    /// A cache class failed to load an object.
    #[error("unable to load {class} object at {addr:#x}")]
    CantLoad {
        /// Class of the object.
        class: CacheClassId,
        /// Address of the object.
        addr: u64,
        /// Underlying cause.
        #[source]
        source: Box<FormatError>,
    },

    /// A cache class failed to write an object back.
    #[error("unable to flush {class} object at {addr:#x}")]
    CantFlush {
        /// Class of the object.
        class: CacheClassId,
        /// Address of the object.
        addr: u64,
        /// Underlying cause.
        #[source]
        source: Box<FormatError>,
    },

    /// An address is already checked out of the cache.
    #[error("{class} object at {addr:#x} is already protected")]
    AlreadyProtected {
        /// Class of the object.
        class: CacheClassId,
        /// Address of the object.
        addr: u64,
    },

    /// A full flush/destroy was requested while objects are still protected.
    #[error("{0} cached object(s) are still protected")]
    ProtectedObjectsRemain(usize),

    /// B-tree search exhausted without a match.
    #[error("B-tree key not found")]
    KeyNotFound,

    /// Splitting a B-tree node failed.
    #[error("unable to split B-tree node at {addr:#x}")]
    CantSplit {
        /// Address of the node being split.
        addr: u64,
        /// Underlying cause.
        #[source]
        source: Box<FormatError>,
    },

    /// Inserting into a B-tree failed.
    #[error("unable to insert into B-tree rooted at {addr:#x}")]
    CantInsert {
        /// Root address of the tree.
        addr: u64,
        /// Underlying cause.
        #[source]
        source: Box<FormatError>,
    },

    /// A B-tree failed a structural check.
    #[error("B-tree structure violated: {0}")]
    InvalidTree(String),

    /// Invalid B-tree node signature (expected "TREE").
    #[error("invalid B-tree node signature")]
    InvalidBTreeSignature,

    /// B-tree node belongs to a different node class.
    #[error("invalid B-tree node type: expected {expected}, found {found}")]
    InvalidNodeType {
        /// Node type of the class used to decode.
        expected: u8,
        /// Node type stored on disk.
        found: u8,
    },

    /// Invalid symbol table node signature (expected "SNOD").
    #[error("invalid symbol table node signature")]
    InvalidSymbolTableNodeSignature,

    /// Unsupported symbol table node version.
    #[error("invalid symbol table node version: {0}")]
    InvalidSymbolTableNodeVersion(u8),

    /// Invalid local heap signature (expected "HEAP").
    #[error("invalid local heap signature")]
    InvalidLocalHeapSignature,

    /// Unsupported local heap version.
    #[error("invalid local heap version: {0}")]
    InvalidLocalHeapVersion(u8),

    /// Offset does not point at a name inside the local heap.
    #[error("invalid local heap offset {0}")]
    InvalidHeapOffset(u64),

    /// A name is already present in a symbol table.
    #[error("name already exists in symbol table: {0}")]
    DuplicateName(String),

    /// Filter id not known to this implementation.
    #[error("unsupported filter id {0}")]
    UnsupportedFilter(u16),

    /// Generic filter failure.
    #[error("filter error: {0}")]
    FilterError(String),

    /// Compression step failed.
    #[error("compression error: {0}")]
    CompressionError(String),

    /// Decompression step failed.
    #[error("decompression error: {0}")]
    DecompressionError(String),

    /// Fletcher-32 checksum mismatch.
    #[error("checksum mismatch: expected {expected:#010x}, computed {computed:#010x}")]
    ChecksumMismatch {
        /// The checksum stored with the data.
        expected: u32,
        /// The checksum we computed.
        computed: u32,
    },

    /// A chunk decoded to an unexpected number of bytes.
    #[error("chunk size mismatch: expected {expected} bytes, got {actual}")]
    ChunkSizeMismatch {
        /// Uncompressed chunk size.
        expected: usize,
        /// Bytes produced by the pipeline.
        actual: usize,
    },

    /// A chunk was locked twice.
    #[error("chunk at {offset:?} is already locked")]
    ChunkLocked {
        /// Chunk offset.
        offset: Vec<u64>,
    },

    /// Configuration value out of range.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Caller passed inconsistent arguments.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl FormatError {
    pub(crate) fn cant_load(class: CacheClassId, addr: u64, source: FormatError) -> Self {
        FormatError::CantLoad {
            class,
            addr,
            source: Box::new(source),
        }
    }

    pub(crate) fn cant_flush(class: CacheClassId, addr: u64, source: FormatError) -> Self {
        FormatError::CantFlush {
            class,
            addr,
            source: Box::new(source),
        }
    }

    /// Returns `true` when this error (or any wrapped cause) is `KeyNotFound`.
    pub fn is_not_found(&self) -> bool {
        match self {
            FormatError::KeyNotFound => true,
            FormatError::CantLoad { source, .. }
            | FormatError::CantFlush { source, .. }
            | FormatError::CantSplit { source, .. }
            | FormatError::CantInsert { source, .. } => source.is_not_found(),
            _ => false,
        }
    }

    /// The innermost cause behind any wrapping variants.
    pub fn root_cause(&self) -> &FormatError {
        match self {
            FormatError::CantLoad { source, .. }
            | FormatError::CantFlush { source, .. }
            | FormatError::CantSplit { source, .. }
            | FormatError::CantInsert { source, .. } => source.root_cause(),
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_messages() {
        let e = FormatError::UnexpectedEof {
            expected: 16,
            available: 4,
        };
        assert_eq!(e.to_string(), "unexpected EOF: need 16 bytes, have 4");
        assert_eq!(
            FormatError::ProtectedObjectsRemain(2).to_string(),
            "2 cached object(s) are still protected"
        );
    }

    #[test]
    fn not_found_through_wrappers() {
        let e = FormatError::CantInsert {
            addr: 0x40,
            source: Box::new(FormatError::KeyNotFound),
        };
        assert!(e.is_not_found());
        assert!(!FormatError::InvalidBTreeSignature.is_not_found());
    }

    #[test]
    fn root_cause_unwraps_nesting() {
        let e = FormatError::CantInsert {
            addr: 0,
            source: Box::new(FormatError::CantSplit {
                addr: 8,
                source: Box::new(FormatError::DuplicateName("a".into())),
            }),
        };
        assert!(matches!(e.root_cause(), FormatError::DuplicateName(n) if n == "a"));
    }

    #[test]
    fn source_chain() {
        use std::error::Error;
        let e = FormatError::cant_load(
            CacheClassId::BTREE,
            0x80,
            FormatError::InvalidBTreeSignature,
        );
        let src = e.source().map(|s| s.to_string());
        assert_eq!(src.as_deref(), Some("invalid B-tree node signature"));
    }
}
