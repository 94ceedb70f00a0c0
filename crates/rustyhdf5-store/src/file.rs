//! Open-file state: block store, metadata cache and properties.
//!
//! [`FileContext`] keeps the block store and the metadata cache side by
//! side so a protected object can be modified while the context is handed
//! on to nested tree operations. [`Hdf5File`] adds the raw data chunk
//! cache on top.

use std::fmt;
use std::path::Path;

use tracing::debug;

use crate::block_store::{AllocKind, BlockStore, FileStore, MemoryStore};
use crate::chunk_cache::RawChunkCache;
use crate::config::FileConfig;
use crate::error::Result;
use crate::metadata_cache::{CacheClass, CacheClassId, CacheThing, MetadataCache, Protected};

/// Block store plus metadata cache for one open file.
pub struct FileContext {
    store: Box<dyn BlockStore>,
    cache: MetadataCache,
    config: FileConfig,
}

impl fmt::Debug for FileContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileContext")
            .field("eoa", &self.store.eoa())
            .field("cache", &self.cache)
            .field("config", &self.config)
            .finish()
    }
}

impl FileContext {
    /// Wrap a store. The configuration is validated first.
    pub fn new(store: Box<dyn BlockStore>, config: FileConfig) -> Result<Self> {
        config.validate()?;
        let cache = MetadataCache::new(config.cache_slots)?;
        Ok(Self {
            store,
            cache,
            config,
        })
    }

    /// A context over a fresh in-memory image.
    pub fn memory(config: FileConfig) -> Result<Self> {
        Self::new(Box::new(MemoryStore::new()), config)
    }

    pub fn config(&self) -> &FileConfig {
        &self.config
    }

    pub fn cache(&self) -> &MetadataCache {
        &self.cache
    }

    pub fn store(&self) -> &dyn BlockStore {
        &*self.store
    }

    pub fn store_mut(&mut self) -> &mut dyn BlockStore {
        &mut *self.store
    }

    // --- block store ---

    pub fn alloc(&mut self, kind: AllocKind, size: u64) -> Result<u64> {
        self.store.alloc(kind, size)
    }

    pub fn free(&mut self, kind: AllocKind, addr: u64, size: u64) -> Result<()> {
        self.store.free(kind, addr, size)
    }

    pub fn realloc(&mut self, kind: AllocKind, addr: u64, old_size: u64, new_size: u64) -> Result<u64> {
        self.store.realloc(kind, addr, old_size, new_size)
    }

    pub fn read(&mut self, addr: u64, buf: &mut [u8]) -> Result<()> {
        self.store.read(addr, buf)
    }

    pub fn write(&mut self, addr: u64, data: &[u8]) -> Result<()> {
        self.store.write(addr, data)
    }

    // --- metadata cache ---

    pub fn find<C: CacheClass>(&mut self, class: &C, addr: u64) -> Result<&C::Thing> {
        self.cache.find(&mut *self.store, class, addr)
    }

    pub fn protect<C: CacheClass>(&mut self, class: &C, addr: u64) -> Result<Protected<C::Thing>> {
        self.cache.protect(&mut *self.store, class, addr)
    }

    pub fn unprotect<T: CacheThing>(&mut self, thing: Protected<T>) -> Result<()> {
        self.cache.unprotect(&mut *self.store, thing)
    }

    pub fn discard<T: CacheThing>(&mut self, thing: Protected<T>) {
        self.cache.discard(thing)
    }

    pub fn insert<T: CacheThing>(&mut self, class: CacheClassId, addr: u64, thing: T) -> Result<()> {
        self.cache.insert(&mut *self.store, class, addr, thing)
    }

    pub fn rename(&mut self, class: CacheClassId, old_addr: u64, new_addr: u64) -> Result<()> {
        self.cache.rename(&mut *self.store, class, old_addr, new_addr)
    }

    /// Flush one object, or every object of a class, or everything.
    pub fn flush_objects(
        &mut self,
        class: Option<CacheClassId>,
        addr: Option<u64>,
        destroy: bool,
    ) -> Result<()> {
        self.cache.flush(&mut *self.store, class, addr, destroy)
    }

    /// Flush every cached object, dropping them when `destroy` is set.
    pub fn flush_cache(&mut self, destroy: bool) -> Result<()> {
        self.cache.flush(&mut *self.store, None, None, destroy)
    }

    /// Tear down the metadata cache and flush the block store.
    pub fn close(mut self) -> Result<Box<dyn BlockStore>> {
        self.cache.dest(&mut *self.store)?;
        self.store.flush()?;
        Ok(self.store)
    }
}

/// An open file: the metadata context plus the raw data chunk cache.
#[derive(Debug)]
pub struct Hdf5File {
    ctx: FileContext,
    rdcc: RawChunkCache,
}

impl Hdf5File {
    pub fn new(store: Box<dyn BlockStore>, config: FileConfig) -> Result<Self> {
        let rdcc = RawChunkCache::new(&config.rdcc)?;
        let ctx = FileContext::new(store, config)?;
        Ok(Self { ctx, rdcc })
    }

    /// A file over a fresh in-memory image.
    pub fn create_memory(config: FileConfig) -> Result<Self> {
        Self::new(Box::new(MemoryStore::new()), config)
    }

    /// Create (or truncate) a file on disk.
    pub fn create<P: AsRef<Path>>(path: P, config: FileConfig) -> Result<Self> {
        let path = path.as_ref();
        debug!(path = %path.display(), "creating file");
        Self::new(Box::new(FileStore::create(path)?), config)
    }

    /// Open an existing file on disk.
    pub fn open<P: AsRef<Path>>(path: P, config: FileConfig) -> Result<Self> {
        let path = path.as_ref();
        debug!(path = %path.display(), "opening file");
        Self::new(Box::new(FileStore::open(path)?), config)
    }

    pub fn context(&self) -> &FileContext {
        &self.ctx
    }

    pub fn context_mut(&mut self) -> &mut FileContext {
        &mut self.ctx
    }

    pub fn rdcc(&self) -> &RawChunkCache {
        &self.rdcc
    }

    /// Both halves at once, for raw data I/O that touches the chunk index.
    pub fn parts_mut(&mut self) -> (&mut FileContext, &mut RawChunkCache) {
        (&mut self.ctx, &mut self.rdcc)
    }

    /// Write back dirty chunks, then dirty metadata. Both caches keep their
    /// contents.
    pub fn flush(&mut self) -> Result<()> {
        self.rdcc.flush(&mut self.ctx, false)?;
        self.ctx.flush_cache(false)?;
        self.ctx.store_mut().flush()
    }

    /// Empty both caches and hand back the store.
    pub fn close(mut self) -> Result<Box<dyn BlockStore>> {
        self.rdcc.dest(&mut self.ctx)?;
        self.ctx.cache().log_stats();
        self.ctx.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RdccConfig;

    #[test]
    fn rejects_bad_config() {
        let config = FileConfig::new().rdcc(RdccConfig::new().w0(1.5));
        assert!(Hdf5File::create_memory(config).is_err());
        assert!(FileContext::memory(FileConfig::new().chunk_btree_k(0)).is_err());
    }

    #[test]
    fn close_returns_store() {
        let mut file = Hdf5File::create_memory(FileConfig::new()).unwrap();
        let addr = file.context_mut().alloc(AllocKind::RawData, 16).unwrap();
        file.context_mut().write(addr, &[7; 16]).unwrap();
        file.flush().unwrap();
        let mut store = file.close().unwrap();
        assert_eq!(store.eoa(), addr + 16);
        let mut buf = [0u8; 16];
        store.read(addr, &mut buf).unwrap();
        assert_eq!(buf, [7; 16]);
    }
}
