//! Raw data chunk cache (rdcc).
//!
//! Decompressed chunks are kept in a fixed table of hash slots, one entry
//! per slot, threaded on an LRU list whose head is the least recently used
//! entry. The cache is independent of the metadata cache: a miss looks the
//! chunk up in its dataset's chunk index and reads it through the filter
//! pipeline, and a dirty entry is written back through the pipeline and the
//! index before it leaves the cache.
//!
//! Callers [`lock`](RawChunkCache::lock) a chunk, touch its bytes through
//! the returned [`ChunkHandle`], then [`unlock`](RawChunkCache::unlock) it.
//! Locked entries are never evicted. Chunks that cannot be cached (the
//! cache is disabled, the chunk exceeds the byte budget, or its slot is
//! held by another locked chunk) live in the handle itself and are written
//! straight back on a dirty unlock.

use std::rc::Rc;

use tracing::{debug, info, trace, warn};

use crate::chunk_index::{self, ChunkInfo, ChunkKey, ChunkLayout};
use crate::config::RdccConfig;
use crate::error::{FormatError, Result};
use crate::file::FileContext;
use crate::filters::FilterPipeline;

// ---------------------------------------------------------------------------
// Per-dataset chunk storage
// ---------------------------------------------------------------------------

/// Everything needed to move one dataset's chunks between memory and the
/// file.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkStorage {
    pub layout: ChunkLayout,
    pub pipeline: FilterPipeline,
    /// Fill value for one element; empty means zero fill.
    pub fill: Vec<u8>,
}

impl ChunkStorage {
    pub fn new(layout: ChunkLayout, pipeline: FilterPipeline, fill: Vec<u8>) -> Result<Self> {
        ChunkLayout::check_dims(&layout.dims)?;
        pipeline.validate()?;
        if !fill.is_empty() && fill.len() != layout.elem_size() {
            return Err(FormatError::InvalidArgument(format!(
                "fill value is {} bytes, element size is {}",
                fill.len(),
                layout.elem_size()
            )));
        }
        Ok(Self {
            layout,
            pipeline,
            fill,
        })
    }

    /// Fill `buf` with the fill pattern.
    pub fn fill_chunk(&self, buf: &mut [u8]) {
        if self.fill.is_empty() {
            buf.fill(0);
            return;
        }
        for elem in buf.chunks_mut(self.fill.len()) {
            elem.copy_from_slice(&self.fill[..elem.len()]);
        }
    }

    /// Read a stored chunk and undo its filters.
    pub fn read_chunk(&self, ctx: &mut FileContext, info: &ChunkInfo) -> Result<Vec<u8>> {
        let mut raw = vec![0u8; info.chunk_size as usize];
        ctx.read(info.address, &mut raw)?;
        let data = if self.pipeline.is_empty() {
            raw
        } else {
            self.pipeline
                .apply_reverse(&raw, info.filter_mask, self.layout.elem_size())?
        };
        let expected = self.layout.chunk_bytes();
        if data.len() != expected {
            return Err(FormatError::ChunkSizeMismatch {
                expected,
                actual: data.len(),
            });
        }
        Ok(data)
    }

    /// Filter a chunk, record it in the index and write it.
    ///
    /// `data` is left untouched; the pipeline works on its own copy.
    pub fn write_chunk(&self, ctx: &mut FileContext, offsets: &[u64], data: &[u8]) -> Result<ChunkInfo> {
        let (encoded, filter_mask) = if self.pipeline.is_empty() {
            (None, 0)
        } else {
            let (bytes, mask) = self.pipeline.apply_forward(data, self.layout.elem_size())?;
            (Some(bytes), mask)
        };
        let bytes = encoded.as_deref().unwrap_or(data);
        let nbytes = u32::try_from(bytes.len()).map_err(|_| {
            FormatError::InvalidArgument(format!("encoded chunk of {} bytes", bytes.len()))
        })?;
        let key = ChunkKey::new(offsets.to_vec(), nbytes, filter_mask);
        let address = chunk_index::insert_chunk(ctx, &self.layout, &key)?;
        ctx.write(address, bytes)?;
        trace!(?offsets, address, nbytes, filter_mask, "chunk written");
        Ok(ChunkInfo {
            chunk_size: nbytes,
            filter_mask,
            offsets: offsets.to_vec(),
            address,
        })
    }
}

// ---------------------------------------------------------------------------
// Entries and handles
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct RdccEntry {
    storage: Rc<ChunkStorage>,
    offsets: Vec<u64>,
    chunk_size: usize,
    /// Bytes not yet read / written since the entry was loaded.
    rd_count: usize,
    wr_count: usize,
    locked: bool,
    dirty: bool,
    data: Vec<u8>,
}

impl RdccEntry {
    fn matches(&self, index_addr: u64, offsets: &[u64]) -> bool {
        self.storage.layout.index_addr == index_addr && self.offsets == offsets
    }

    /// Completely read and/or completely written, but not partially
    /// either.
    fn fully_accessed(&self) -> bool {
        let (rd, wr, n) = (self.rd_count, self.wr_count, self.chunk_size);
        (rd == 0 && wr == 0) || (rd == 0 && wr == n) || (rd == n && wr == 0)
    }
}

/// LRU neighbours of a slot.
#[derive(Debug, Clone, Copy, Default)]
struct Link {
    prev: Option<usize>,
    next: Option<usize>,
}

/// A locked chunk.
#[must_use = "locked chunks must be returned with unlock"]
#[derive(Debug)]
pub struct ChunkHandle {
    slot: Option<usize>,
    storage: Rc<ChunkStorage>,
    offsets: Vec<u64>,
    /// Chunk bytes for uncached chunks; empty when cached.
    data: Vec<u8>,
}

impl ChunkHandle {
    pub fn is_cached(&self) -> bool {
        self.slot.is_some()
    }

    /// Chunk offsets, element size dimension included.
    pub fn offsets(&self) -> &[u64] {
        &self.offsets
    }
}

/// Counters reported by [`RawChunkCache::stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RdccStats {
    /// Locks satisfied from the cache, plus relaxed locks.
    pub hits: u64,
    /// Locks that read the chunk from the file.
    pub misses: u64,
    /// Locks that initialized a chunk absent from the file.
    pub inits: u64,
    /// Dirty chunks written back.
    pub flushes: u64,
    /// Bytes of chunk data currently cached.
    pub nbytes: usize,
    /// Entries currently cached.
    pub nused: usize,
}

// ---------------------------------------------------------------------------
// RawChunkCache
// ---------------------------------------------------------------------------

/// The per-file raw data chunk cache.
#[derive(Debug)]
pub struct RawChunkCache {
    slots: Vec<Option<RdccEntry>>,
    links: Vec<Link>,
    head: Option<usize>,
    tail: Option<usize>,
    max_bytes: usize,
    w0: f64,
    nbytes: usize,
    nused: usize,
    stats: RdccStats,
}

impl RawChunkCache {
    pub fn new(config: &RdccConfig) -> Result<Self> {
        config.validate()?;
        let nslots = config.nslots;
        Ok(Self {
            slots: (0..nslots).map(|_| None).collect(),
            links: vec![Link::default(); nslots],
            head: None,
            tail: None,
            max_bytes: config.nbytes,
            w0: config.w0,
            nbytes: 0,
            nused: 0,
            stats: RdccStats::default(),
        })
    }

    pub fn nslots(&self) -> usize {
        self.slots.len()
    }

    /// Byte budget; larger chunks are never cached.
    pub fn max_bytes(&self) -> usize {
        self.max_bytes
    }

    pub fn stats(&self) -> RdccStats {
        RdccStats {
            nbytes: self.nbytes,
            nused: self.nused,
            ..self.stats
        }
    }

    pub fn log_stats(&self) {
        let s = self.stats();
        let lookups = s.hits + s.misses + s.inits;
        let ratio = if lookups == 0 {
            0.0
        } else {
            100.0 * s.hits as f64 / lookups as f64
        };
        info!(
            hits = s.hits,
            misses = s.misses,
            inits = s.inits,
            flushes = s.flushes,
            nbytes = s.nbytes,
            nused = s.nused,
            hit_ratio = ratio,
            "raw data chunk cache statistics"
        );
    }

    /// Whether the chunk is cached right now.
    pub fn contains(&self, layout: &ChunkLayout, offsets: &[u64]) -> bool {
        let Ok(offsets) = layout.full_offsets(offsets) else {
            return false;
        };
        self.hash(layout.index_addr, &offsets)
            .and_then(|i| self.slots[i].as_ref())
            .is_some_and(|e| e.matches(layout.index_addr, &offsets))
    }

    /// Whether a cached copy of the chunk has unwritten changes.
    pub fn is_dirty(&self, layout: &ChunkLayout, offsets: &[u64]) -> bool {
        let Ok(offsets) = layout.full_offsets(offsets) else {
            return false;
        };
        self.hash(layout.index_addr, &offsets)
            .and_then(|i| self.slots[i].as_ref())
            .is_some_and(|e| e.matches(layout.index_addr, &offsets) && e.dirty)
    }

    fn hash(&self, index_addr: u64, offsets: &[u64]) -> Option<usize> {
        if self.slots.is_empty() {
            return None;
        }
        let h = offsets
            .iter()
            .fold(index_addr, |h, &off| (h << 1) ^ off);
        Some((h % self.slots.len() as u64) as usize)
    }

    // --- LRU list ---

    fn link(&mut self, a: Option<usize>, b: Option<usize>) {
        match a {
            Some(a) => self.links[a].next = b,
            None => self.head = b,
        }
        match b {
            Some(b) => self.links[b].prev = a,
            None => self.tail = a,
        }
    }

    fn unlink(&mut self, i: usize) {
        let Link { prev, next } = self.links[i];
        self.link(prev, next);
        self.links[i] = Link::default();
    }

    fn append(&mut self, i: usize) {
        self.link(self.tail, Some(i));
        self.link(Some(i), None);
    }

    /// Move an entry one step toward the fresh end.
    fn promote(&mut self, i: usize) {
        let Some(j) = self.links[i].next else {
            return;
        };
        let prev = self.links[i].prev;
        let after = self.links[j].next;
        self.link(prev, Some(j));
        self.link(Some(j), Some(i));
        self.link(Some(i), after);
    }

    fn lru_order(&self) -> Vec<usize> {
        let mut order = Vec::with_capacity(self.nused);
        let mut cur = self.head;
        while let Some(i) = cur {
            order.push(i);
            cur = self.links[i].next;
        }
        order
    }

    // --- lock / unlock ---

    /// Lock the chunk at `offsets` of `storage`'s dataset.
    ///
    /// With `relax` the caller promises to overwrite the whole chunk, so a
    /// chunk missing from the cache is not read from the file.
    pub fn lock(
        &mut self,
        ctx: &mut FileContext,
        storage: &Rc<ChunkStorage>,
        offsets: &[u64],
        relax: bool,
    ) -> Result<ChunkHandle> {
        let layout = &storage.layout;
        let offsets = layout.full_offsets(offsets)?;
        let chunk_size = layout.chunk_bytes();
        let idx = self.hash(layout.index_addr, &offsets);

        if let Some(i) = idx {
            if let Some(ent) = self.slots[i].as_mut() {
                if ent.matches(layout.index_addr, &offsets) {
                    if ent.locked {
                        return Err(FormatError::ChunkLocked { offset: offsets });
                    }
                    ent.locked = true;
                    self.stats.hits += 1;
                    trace!(slot = i, ?offsets, "rdcc hit");
                    return Ok(ChunkHandle {
                        slot: Some(i),
                        storage: Rc::clone(storage),
                        offsets,
                        data: Vec::new(),
                    });
                }
            }
        }

        let data = if relax {
            self.stats.hits += 1;
            vec![0u8; chunk_size]
        } else {
            match chunk_index::lookup(ctx, layout, &offsets)? {
                Some(info) => {
                    let data = storage.read_chunk(ctx, &info)?;
                    self.stats.misses += 1;
                    data
                }
                None => {
                    let mut data = vec![0u8; chunk_size];
                    storage.fill_chunk(&mut data);
                    self.stats.inits += 1;
                    data
                }
            }
        };

        let cacheable = match idx {
            Some(i) => {
                chunk_size <= self.max_bytes
                    && !self.slots[i].as_ref().is_some_and(|e| e.locked)
            }
            None => false,
        };
        let Some(i) = idx.filter(|_| cacheable) else {
            trace!(?offsets, chunk_size, "chunk bypasses rdcc");
            return Ok(ChunkHandle {
                slot: None,
                storage: Rc::clone(storage),
                offsets,
                data,
            });
        };

        if self.slots[i].is_some() {
            self.preempt(ctx, i)?;
        }
        self.prune(ctx, chunk_size)?;

        self.slots[i] = Some(RdccEntry {
            storage: Rc::clone(storage),
            offsets: offsets.clone(),
            chunk_size,
            rd_count: chunk_size,
            wr_count: chunk_size,
            locked: true,
            dirty: false,
            data,
        });
        self.append(i);
        self.nbytes += chunk_size;
        self.nused += 1;
        trace!(slot = i, ?offsets, nbytes = self.nbytes, "chunk cached");
        Ok(ChunkHandle {
            slot: Some(i),
            storage: Rc::clone(storage),
            offsets,
            data: Vec::new(),
        })
    }

    fn locked_entry(&self, handle: &ChunkHandle) -> Result<usize> {
        let i = handle.slot.ok_or_else(|| {
            FormatError::InvalidArgument("chunk handle is not cached".into())
        })?;
        match &self.slots[i] {
            Some(e) if e.locked && e.matches(handle.storage.layout.index_addr, &handle.offsets) => Ok(i),
            _ => Err(FormatError::InvalidArgument(format!(
                "no locked chunk at {:?} in slot {i}",
                handle.offsets
            ))),
        }
    }

    /// The bytes of a locked chunk.
    pub fn chunk<'a>(&'a self, handle: &'a ChunkHandle) -> Result<&'a [u8]> {
        if handle.slot.is_none() {
            return Ok(&handle.data);
        }
        let i = self.locked_entry(handle)?;
        match &self.slots[i] {
            Some(e) => Ok(&e.data),
            None => Err(FormatError::InvalidArgument("empty chunk slot".into())),
        }
    }

    /// Mutable bytes of a locked chunk.
    pub fn chunk_mut<'a>(&'a mut self, handle: &'a mut ChunkHandle) -> Result<&'a mut [u8]> {
        if handle.slot.is_none() {
            return Ok(&mut handle.data);
        }
        let i = self.locked_entry(handle)?;
        match &mut self.slots[i] {
            Some(e) => Ok(&mut e.data),
            None => Err(FormatError::InvalidArgument("empty chunk slot".into())),
        }
    }

    /// Release a locked chunk. `naccessed` bytes were read, or written when
    /// `dirty` is set. An uncached dirty chunk is written immediately.
    pub fn unlock(
        &mut self,
        ctx: &mut FileContext,
        handle: ChunkHandle,
        dirty: bool,
        naccessed: usize,
    ) -> Result<()> {
        if handle.slot.is_none() {
            if dirty {
                handle.storage.write_chunk(ctx, &handle.offsets, &handle.data)?;
                self.stats.flushes += 1;
            }
            return Ok(());
        }
        let i = self.locked_entry(&handle)?;
        if let Some(ent) = self.slots[i].as_mut() {
            if dirty {
                ent.dirty = true;
                ent.wr_count -= ent.wr_count.min(naccessed);
            } else {
                ent.rd_count -= ent.rd_count.min(naccessed);
            }
            ent.locked = false;
        }
        self.promote(i);
        Ok(())
    }

    // --- write-back and eviction ---

    /// Write an entry back if dirty. The entry keeps its data.
    fn flush_entry(&mut self, ctx: &mut FileContext, i: usize) -> Result<()> {
        let Some(ent) = self.slots[i].as_mut() else {
            return Ok(());
        };
        if !ent.dirty {
            return Ok(());
        }
        ent.storage.write_chunk(ctx, &ent.offsets, &ent.data)?;
        ent.dirty = false;
        self.stats.flushes += 1;
        Ok(())
    }

    /// Flush and drop an entry. The entry leaves the cache even when the
    /// write fails.
    fn preempt(&mut self, ctx: &mut FileContext, i: usize) -> Result<()> {
        let res = self.flush_entry(ctx, i);
        if let Err(e) = &res {
            warn!(slot = i, error = %e, "dropping chunk that failed to flush");
        }
        self.unlink(i);
        if let Some(ent) = self.slots[i].take() {
            self.nbytes -= ent.chunk_size;
            self.nused -= 1;
            trace!(slot = i, offsets = ?ent.offsets, "chunk preempted");
        }
        res
    }

    /// Evict entries until `size` more bytes fit in the budget.
    ///
    /// Two cursors walk the LRU list from the head. The first only takes
    /// entries that were completely read or written; the second, which
    /// starts once the first has covered `w0` of the list, takes any
    /// unlocked entry.
    fn prune(&mut self, ctx: &mut FileContext, size: usize) -> Result<()> {
        let budget = self.max_bytes;
        let mut w0 = (self.nused as f64 * self.w0) as i64;
        let mut p: [Option<usize>; 2] = [self.head, None];
        let mut first_err = None;

        while (p[0].is_some() || p[1].is_some()) && self.nbytes + size > budget {
            if w0 == 0 {
                p[1] = self.head;
            }
            let mut n = p.map(|c| c.and_then(|i| self.links[i].next));

            for method in 0..2 {
                if self.nbytes + size <= budget {
                    break;
                }
                let Some(cur) = p[method] else {
                    continue;
                };
                let evict = match &self.slots[cur] {
                    Some(e) => !e.locked && (method == 1 || e.fully_accessed()),
                    None => false,
                };
                if !evict {
                    continue;
                }
                for j in 0..2 {
                    if p[j] == Some(cur) {
                        p[j] = None;
                    }
                    if n[j] == Some(cur) {
                        n[j] = self.links[cur].next;
                    }
                }
                if let Err(e) = self.preempt(ctx, cur) {
                    first_err.get_or_insert(e);
                }
            }
            p = n;
            w0 -= 1;
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Drop the cached copy of one chunk, writing it first if dirty.
    pub fn preempt_chunk(&mut self, ctx: &mut FileContext, layout: &ChunkLayout, offsets: &[u64]) -> Result<()> {
        let offsets = layout.full_offsets(offsets)?;
        let Some(i) = self.hash(layout.index_addr, &offsets) else {
            return Ok(());
        };
        match &self.slots[i] {
            Some(e) if e.matches(layout.index_addr, &offsets) => {
                if e.locked {
                    return Err(FormatError::ChunkLocked { offset: offsets });
                }
                self.preempt(ctx, i)
            }
            _ => Ok(()),
        }
    }

    /// Write back every dirty entry. With `preempt` the entries are also
    /// dropped; locked entries stay and are reported.
    pub fn flush(&mut self, ctx: &mut FileContext, preempt: bool) -> Result<()> {
        let mut first_err = None;
        let mut nerrors = 0usize;
        for i in self.lru_order() {
            let res = if !preempt {
                self.flush_entry(ctx, i)
            } else if let Some(e) = self.slots[i].as_ref().filter(|e| e.locked) {
                Err(FormatError::ChunkLocked {
                    offset: e.offsets.clone(),
                })
            } else {
                self.preempt(ctx, i)
            };
            if let Err(e) = res {
                nerrors += 1;
                first_err.get_or_insert(e);
            }
        }
        debug!(preempt, nused = self.nused, nbytes = self.nbytes, nerrors, "rdcc flushed");
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Flush and empty the cache.
    pub fn dest(&mut self, ctx: &mut FileContext) -> Result<()> {
        self.flush(ctx, true)?;
        self.log_stats();
        Ok(())
    }
}
