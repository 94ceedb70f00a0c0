//! File access and creation properties for the storage core.
//!
//! Properties are plain structs with `Default` values and consuming builder
//! setters. They are validated once when a file context is created.

use crate::error::{FormatError, Result};

/// Default number of metadata cache slots.
pub const DEFAULT_CACHE_SLOTS: usize = 10330;

/// Default minimum degree of group (symbol table) B-trees.
pub const DEFAULT_GROUP_BTREE_K: usize = 16;

/// Default minimum degree of chunk index B-trees.
pub const DEFAULT_CHUNK_BTREE_K: usize = 32;

/// Default symbol table node half-capacity.
pub const DEFAULT_SYM_LEAF_K: usize = 4;

/// Default number of raw data chunk cache slots.
pub const DEFAULT_RDCC_NSLOTS: usize = 521;

/// Default raw data chunk cache budget: 1 MiB.
pub const DEFAULT_RDCC_NBYTES: usize = 1024 * 1024;

/// Default preemption weight for fully read/written chunks.
pub const DEFAULT_RDCC_W0: f64 = 0.75;

/// Fraction of a full node's children kept in the left half of a split.
///
/// The ratio used depends on where the splitting node sits on its level:
/// `left` for the left-most node, `right` for the right-most node and
/// `middle` for everything else.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SplitRatios {
    pub left: f64,
    pub middle: f64,
    pub right: f64,
}

impl Default for SplitRatios {
    fn default() -> Self {
        Self {
            left: 0.1,
            middle: 0.5,
            right: 0.9,
        }
    }
}

impl SplitRatios {
    /// Even split everywhere.
    pub fn even() -> Self {
        Self {
            left: 0.5,
            middle: 0.5,
            right: 0.5,
        }
    }

    fn validate(&self) -> Result<()> {
        for (name, v) in [("left", self.left), ("middle", self.middle), ("right", self.right)] {
            if !(0.0..=1.0).contains(&v) {
                return Err(FormatError::InvalidConfig(format!(
                    "split ratio {name} must be in [0, 1], got {v}"
                )));
            }
        }
        Ok(())
    }
}

/// Raw data chunk cache properties.
#[derive(Debug, Clone, PartialEq)]
pub struct RdccConfig {
    /// Number of hash slots (0 disables the cache).
    pub nslots: usize,
    /// Maximum bytes of decompressed chunk data (0 disables the cache).
    pub nbytes: usize,
    /// Share of the LRU list examined by the "fully accessed" preemption
    /// policy before the last-resort policy starts.
    pub w0: f64,
}

impl Default for RdccConfig {
    fn default() -> Self {
        Self {
            nslots: DEFAULT_RDCC_NSLOTS,
            nbytes: DEFAULT_RDCC_NBYTES,
            w0: DEFAULT_RDCC_W0,
        }
    }
}

impl RdccConfig {
    /// Create default chunk cache properties.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the number of hash slots.
    pub fn slots(mut self, nslots: usize) -> Self {
        self.nslots = nslots;
        self
    }

    /// Set the byte budget.
    pub fn bytes(mut self, nbytes: usize) -> Self {
        self.nbytes = nbytes;
        self
    }

    /// Set the preemption weight.
    pub fn w0(mut self, w0: f64) -> Self {
        self.w0 = w0;
        self
    }

    /// A cache that never holds anything.
    pub fn disabled() -> Self {
        Self {
            nslots: 0,
            nbytes: 0,
            w0: DEFAULT_RDCC_W0,
        }
    }

    /// Whether chunks can be cached at all.
    pub fn enabled(&self) -> bool {
        self.nslots > 0 && self.nbytes > 0
    }

    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.w0) {
            return Err(FormatError::InvalidConfig(format!(
                "rdcc w0 must be in [0, 1], got {}",
                self.w0
            )));
        }
        Ok(())
    }
}

/// Properties fixed for the lifetime of an open file.
#[derive(Debug, Clone, PartialEq)]
pub struct FileConfig {
    /// Number of metadata cache slots.
    pub cache_slots: usize,
    /// Minimum degree of group B-trees.
    pub group_btree_k: usize,
    /// Minimum degree of chunk index B-trees.
    pub chunk_btree_k: usize,
    /// Half-capacity of symbol table nodes.
    pub sym_leaf_k: usize,
    /// B-tree split ratios.
    pub split_ratios: SplitRatios,
    /// Raw data chunk cache properties.
    pub rdcc: RdccConfig,
}

impl Default for FileConfig {
    fn default() -> Self {
        Self {
            cache_slots: DEFAULT_CACHE_SLOTS,
            group_btree_k: DEFAULT_GROUP_BTREE_K,
            chunk_btree_k: DEFAULT_CHUNK_BTREE_K,
            sym_leaf_k: DEFAULT_SYM_LEAF_K,
            split_ratios: SplitRatios::default(),
            rdcc: RdccConfig::default(),
        }
    }
}

impl FileConfig {
    /// Create default file properties.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the number of metadata cache slots.
    pub fn cache_slots(mut self, nslots: usize) -> Self {
        self.cache_slots = nslots;
        self
    }

    /// Set the group B-tree minimum degree.
    pub fn group_btree_k(mut self, k: usize) -> Self {
        self.group_btree_k = k;
        self
    }

    /// Set the chunk index B-tree minimum degree.
    pub fn chunk_btree_k(mut self, k: usize) -> Self {
        self.chunk_btree_k = k;
        self
    }

    /// Set the symbol table node half-capacity.
    pub fn sym_leaf_k(mut self, k: usize) -> Self {
        self.sym_leaf_k = k;
        self
    }

    /// Set the B-tree split ratios.
    pub fn split_ratios(mut self, ratios: SplitRatios) -> Self {
        self.split_ratios = ratios;
        self
    }

    /// Set the raw data chunk cache properties.
    pub fn rdcc(mut self, rdcc: RdccConfig) -> Self {
        self.rdcc = rdcc;
        self
    }

    /// Check every value is in range.
    pub fn validate(&self) -> Result<()> {
        if self.cache_slots == 0 {
            return Err(FormatError::InvalidConfig(
                "metadata cache needs at least one slot".into(),
            ));
        }
        // Entries-used is stored as a u16 on disk.
        for (name, k) in [
            ("group_btree_k", self.group_btree_k),
            ("chunk_btree_k", self.chunk_btree_k),
            ("sym_leaf_k", self.sym_leaf_k),
        ] {
            if k == 0 || 2 * k > u16::MAX as usize {
                return Err(FormatError::InvalidConfig(format!(
                    "{name} must be in [1, {}], got {k}",
                    u16::MAX / 2
                )));
            }
        }
        self.split_ratios.validate()?;
        self.rdcc.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let cfg = FileConfig::new();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.cache_slots, 10330);
        assert_eq!(cfg.rdcc.nslots, 521);
        assert_eq!(cfg.split_ratios, SplitRatios::default());
    }

    #[test]
    fn builder_chain() {
        let cfg = FileConfig::new()
            .cache_slots(7)
            .chunk_btree_k(2)
            .rdcc(RdccConfig::new().bytes(4096).slots(13).w0(0.5));
        assert_eq!(cfg.cache_slots, 7);
        assert_eq!(cfg.chunk_btree_k, 2);
        assert_eq!(cfg.rdcc.nbytes, 4096);
        assert_eq!(cfg.rdcc.nslots, 13);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn rejects_out_of_range() {
        assert!(FileConfig::new().cache_slots(0).validate().is_err());
        assert!(FileConfig::new().group_btree_k(0).validate().is_err());
        assert!(FileConfig::new().chunk_btree_k(40_000).validate().is_err());
        let bad = SplitRatios {
            left: -0.1,
            ..SplitRatios::default()
        };
        assert!(FileConfig::new().split_ratios(bad).validate().is_err());
        assert!(FileConfig::new()
            .rdcc(RdccConfig::new().w0(1.5))
            .validate()
            .is_err());
    }

    #[test]
    fn disabled_rdcc() {
        assert!(!RdccConfig::disabled().enabled());
        assert!(RdccConfig::default().enabled());
    }
}
