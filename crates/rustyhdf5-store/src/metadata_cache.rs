//! Hash-addressed metadata object cache.
//!
//! The [`MetadataCache`] maps `(class, file address)` to one in-memory
//! object per slot. Slots are chosen by hashing the address, so two live
//! objects that hash to the same slot evict each other: the previous
//! occupant is flushed (if dirty) and dropped before the new one moves in.
//!
//! Objects are checked out with [`MetadataCache::protect`], which moves the
//! object out of its slot into a [`Protected`] guard. While protected the
//! object is invisible to every other cache call, so nested B-tree work that
//! happens to hash to the same slot cannot observe or clobber it. The guard
//! is handed back with [`MetadataCache::unprotect`] (or
//! [`MetadataCache::discard`] when the object was deleted from the file).
//!
//! Flush failures during eviction propagate to the caller and can leave the
//! cache inconsistent: the old occupant stays in its slot (still dirty) and
//! the incoming object is dropped.

use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::ops::{Deref, DerefMut};

use tracing::{debug, info, trace, warn};

use crate::block_store::BlockStore;
use crate::error::{FormatError, Result};

/// Identifies the class of a cached object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CacheClassId(pub u8);

impl CacheClassId {
    /// B-tree nodes.
    pub const BTREE: Self = Self(0);
    /// Symbol table nodes.
    pub const SNODE: Self = Self(1);
}

impl fmt::Display for CacheClassId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::BTREE => f.write_str("B-tree node"),
            Self::SNODE => f.write_str("symbol table node"),
            Self(id) => write!(f, "class {id}"),
        }
    }
}

/// Object-safe access to `Any` for cached objects.
pub trait AsAny: Any {
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
    fn into_any(self: Box<Self>) -> Box<dyn Any>;
}

impl<T: Any> AsAny for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any> {
        self
    }
}

/// An in-memory object that can live in the cache.
pub trait CacheThing: AsAny + fmt::Debug {
    /// Write the object to `addr` if it is dirty, then mark it clean.
    fn flush(&mut self, store: &mut dyn BlockStore, addr: u64) -> Result<()>;

    /// Whether the in-memory copy differs from the file.
    fn is_dirty(&self) -> bool;
}

/// Loader for one class of cached object.
pub trait CacheClass {
    type Thing: CacheThing;

    fn id(&self) -> CacheClassId;

    /// Read and decode the object stored at `addr`.
    fn load(&self, store: &mut dyn BlockStore, addr: u64) -> Result<Self::Thing>;
}

/// Per-class counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Lookups satisfied from a slot.
    pub hits: u64,
    /// Lookups that had to load from the file.
    pub misses: u64,
    /// Fresh objects installed with `insert`.
    pub inits: u64,
    /// Dirty objects written back.
    pub flushes: u64,
}

struct Slot {
    class: CacheClassId,
    addr: u64,
    thing: Box<dyn CacheThing>,
}

fn downcast_ref<T: 'static>(thing: &dyn CacheThing) -> Option<&T> {
    thing.as_any().downcast_ref()
}

/// Warns when a protected object is dropped without being handed back.
struct ReturnGuard {
    class: CacheClassId,
    addr: u64,
    armed: bool,
}

impl Drop for ReturnGuard {
    fn drop(&mut self) {
        if self.armed {
            warn!(
                class = %self.class,
                addr = self.addr,
                "protected object dropped without unprotect; it stays counted as protected"
            );
        }
    }
}

/// Exclusive ownership of an object checked out of the cache.
#[must_use = "protected objects must be returned with unprotect or discard"]
pub struct Protected<T: CacheThing> {
    thing: Box<T>,
    guard: ReturnGuard,
}

impl<T: CacheThing> Protected<T> {
    /// File address the object was protected at.
    pub fn addr(&self) -> u64 {
        self.guard.addr
    }

    pub fn class(&self) -> CacheClassId {
        self.guard.class
    }

    fn into_parts(self) -> (CacheClassId, u64, Box<T>) {
        let Protected { thing, mut guard } = self;
        guard.armed = false;
        (guard.class, guard.addr, thing)
    }
}

impl<T: CacheThing> Deref for Protected<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.thing
    }
}

impl<T: CacheThing> DerefMut for Protected<T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.thing
    }
}

impl<T: CacheThing> fmt::Debug for Protected<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Protected")
            .field("class", &self.guard.class)
            .field("addr", &self.guard.addr)
            .field("thing", &self.thing)
            .finish()
    }
}

/// Fixed-size slot cache for metadata objects.
pub struct MetadataCache {
    slots: Vec<Option<Slot>>,
    protected: HashMap<u64, CacheClassId>,
    stats: BTreeMap<CacheClassId, CacheStats>,
}

impl fmt::Debug for MetadataCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetadataCache")
            .field("nslots", &self.slots.len())
            .field("occupied", &self.occupied())
            .field("nprotected", &self.protected.len())
            .finish()
    }
}

impl MetadataCache {
    /// Create a cache with `nslots` slots (at least one).
    pub fn new(nslots: usize) -> Result<Self> {
        if nslots == 0 {
            return Err(FormatError::InvalidConfig(
                "metadata cache needs at least one slot".into(),
            ));
        }
        let mut slots = Vec::with_capacity(nslots);
        slots.resize_with(nslots, || None);
        Ok(Self {
            slots,
            protected: HashMap::new(),
            stats: BTreeMap::new(),
        })
    }

    pub fn nslots(&self) -> usize {
        self.slots.len()
    }

    /// Number of objects currently checked out.
    pub fn nprotected(&self) -> usize {
        self.protected.len()
    }

    /// Number of occupied slots.
    pub fn occupied(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn stats(&self) -> &BTreeMap<CacheClassId, CacheStats> {
        &self.stats
    }

    /// Counters for one class (zero when the class was never used).
    pub fn class_stats(&self, class: CacheClassId) -> CacheStats {
        self.stats.get(&class).copied().unwrap_or_default()
    }

    /// Report the counters through `tracing`.
    pub fn log_stats(&self) {
        for (class, s) in &self.stats {
            let lookups = s.hits + s.misses;
            let ratio = if lookups == 0 {
                0.0
            } else {
                100.0 * s.hits as f64 / lookups as f64
            };
            info!(
                %class,
                hits = s.hits,
                misses = s.misses,
                inits = s.inits,
                flushes = s.flushes,
                hit_ratio = ratio,
                "metadata cache statistics"
            );
        }
    }

    /// Whether `(class, addr)` sits in a slot right now. Never loads.
    pub fn contains(&self, class: CacheClassId, addr: u64) -> bool {
        matches!(&self.slots[self.hash(addr)], Some(s) if s.class == class && s.addr == addr)
    }

    /// Whether `addr` is currently checked out.
    pub fn is_protected(&self, addr: u64) -> bool {
        self.protected.contains_key(&addr)
    }

    fn hash(&self, addr: u64) -> usize {
        ((addr >> 3) % self.slots.len() as u64) as usize
    }

    fn stats_mut(&mut self, class: CacheClassId) -> &mut CacheStats {
        self.stats.entry(class).or_default()
    }

    fn check_unprotected(&self, class: CacheClassId, addr: u64) -> Result<()> {
        match self.protected.get(&addr) {
            Some(_) => Err(FormatError::AlreadyProtected { class, addr }),
            None => Ok(()),
        }
    }

    /// Flush and drop whatever occupies slot `idx`.
    ///
    /// On flush failure the occupant stays where it is.
    fn evict(&mut self, store: &mut dyn BlockStore, idx: usize) -> Result<()> {
        let Some(slot) = self.slots[idx].as_mut() else {
            return Ok(());
        };
        let (class, addr) = (slot.class, slot.addr);
        if slot.thing.is_dirty() {
            if let Err(e) = slot.thing.flush(store, addr) {
                warn!(%class, addr, error = %e, "eviction flush failed");
                return Err(FormatError::cant_flush(class, addr, e));
            }
            self.stats_mut(class).flushes += 1;
        }
        debug!(%class, addr, slot = idx, "evict");
        self.slots[idx] = None;
        Ok(())
    }

    /// Put `thing` into slot `idx`, evicting the previous occupant first.
    fn install(
        &mut self,
        store: &mut dyn BlockStore,
        idx: usize,
        class: CacheClassId,
        addr: u64,
        thing: Box<dyn CacheThing>,
    ) -> Result<()> {
        if let Err(e) = self.evict(store, idx) {
            warn!(%class, addr, "dropping incoming object after failed eviction");
            return Err(e);
        }
        self.slots[idx] = Some(Slot { class, addr, thing });
        Ok(())
    }

    /// Look up an object, loading it on a miss.
    ///
    /// The returned reference lives until the next call on the cache.
    pub fn find<'a, C: CacheClass>(
        &'a mut self,
        store: &mut dyn BlockStore,
        class: &C,
        addr: u64,
    ) -> Result<&'a C::Thing> {
        let id = class.id();
        self.check_unprotected(id, addr)?;
        let idx = self.hash(addr);

        let hit = match &self.slots[idx] {
            Some(s) if s.addr == addr && s.class != id => {
                return Err(FormatError::CacheCorruption {
                    addr,
                    expected: id,
                    found: s.class,
                });
            }
            Some(s) => s.addr == addr,
            None => false,
        };

        if hit {
            trace!(class = %id, addr, "cache hit");
            self.stats_mut(id).hits += 1;
        } else {
            trace!(class = %id, addr, "cache miss");
            // Load before evicting so a failed load keeps the occupant.
            let thing = class
                .load(store, addr)
                .map_err(|e| FormatError::cant_load(id, addr, e))?;
            self.install(store, idx, id, addr, Box::new(thing))?;
            self.stats_mut(id).misses += 1;
        }

        self.slots[idx]
            .as_ref()
            .and_then(|s| downcast_ref::<C::Thing>(&*s.thing))
            .ok_or(FormatError::CacheCorruption {
                addr,
                expected: id,
                found: id,
            })
    }

    /// Check an object out of the cache for exclusive modification.
    pub fn protect<C: CacheClass>(
        &mut self,
        store: &mut dyn BlockStore,
        class: &C,
        addr: u64,
    ) -> Result<Protected<C::Thing>> {
        let id = class.id();
        self.check_unprotected(id, addr)?;
        let idx = self.hash(addr);

        let thing: Box<C::Thing> = match &self.slots[idx] {
            Some(s) if s.addr == addr => {
                if s.class != id || downcast_ref::<C::Thing>(&*s.thing).is_none() {
                    return Err(FormatError::CacheCorruption {
                        addr,
                        expected: id,
                        found: s.class,
                    });
                }
                let Some(slot) = self.slots[idx].take() else {
                    return Err(FormatError::KeyNotFound);
                };
                trace!(class = %id, addr, "protect hit");
                self.stats_mut(id).hits += 1;
                slot.thing
                    .into_any()
                    .downcast::<C::Thing>()
                    .map_err(|_| FormatError::CacheCorruption {
                        addr,
                        expected: id,
                        found: id,
                    })?
            }
            _ => {
                trace!(class = %id, addr, "protect miss");
                let thing = class
                    .load(store, addr)
                    .map_err(|e| FormatError::cant_load(id, addr, e))?;
                self.stats_mut(id).misses += 1;
                Box::new(thing)
            }
        };

        self.protected.insert(addr, id);
        Ok(Protected {
            thing,
            guard: ReturnGuard {
                class: id,
                addr,
                armed: true,
            },
        })
    }

    /// Return a protected object to its slot.
    ///
    /// The protected count drops even when evicting the slot's current
    /// occupant fails; in that case the returned object is lost.
    pub fn unprotect<T: CacheThing>(
        &mut self,
        store: &mut dyn BlockStore,
        guard: Protected<T>,
    ) -> Result<()> {
        let (class, addr, thing) = guard.into_parts();
        self.protected.remove(&addr);
        let idx = self.hash(addr);
        if self.slots[idx].is_some() {
            debug!(%class, addr, slot = idx, "slot reused while protected");
        }
        self.install(store, idx, class, addr, thing)
    }

    /// Release a protected object whose file space was freed. Nothing is
    /// flushed.
    pub fn discard<T: CacheThing>(&mut self, guard: Protected<T>) {
        let (class, addr, _thing) = guard.into_parts();
        debug!(%class, addr, "discard");
        self.protected.remove(&addr);
    }

    /// Install a newly created object that has not been written yet.
    pub fn insert<T: CacheThing>(
        &mut self,
        store: &mut dyn BlockStore,
        class: CacheClassId,
        addr: u64,
        thing: T,
    ) -> Result<()> {
        self.check_unprotected(class, addr)?;
        let idx = self.hash(addr);
        self.install(store, idx, class, addr, Box::new(thing))?;
        self.stats_mut(class).inits += 1;
        Ok(())
    }

    /// Move a cached object to a new file address.
    ///
    /// A no-op when the object is not in the cache.
    pub fn rename(
        &mut self,
        store: &mut dyn BlockStore,
        class: CacheClassId,
        old_addr: u64,
        new_addr: u64,
    ) -> Result<()> {
        self.check_unprotected(class, new_addr)?;
        let old_idx = self.hash(old_addr);
        let new_idx = self.hash(new_addr);
        if !self.contains(class, old_addr) {
            return Ok(());
        }
        debug!(%class, old_addr, new_addr, "rename");
        if old_idx == new_idx {
            if let Some(slot) = self.slots[old_idx].as_mut() {
                slot.addr = new_addr;
            }
            return Ok(());
        }
        self.evict(store, new_idx)?;
        if let Some(mut slot) = self.slots[old_idx].take() {
            slot.addr = new_addr;
            self.slots[new_idx] = Some(slot);
        }
        Ok(())
    }

    /// Flush cached objects, optionally dropping them.
    ///
    /// With `addr == None` every occupied slot whose class passes `class`
    /// is flushed in ascending address order. A full destroy still flushes
    /// and drops everything it can reach, then fails with
    /// `ProtectedObjectsRemain` if objects are checked out. Nothing is
    /// rolled back.
    pub fn flush(
        &mut self,
        store: &mut dyn BlockStore,
        class: Option<CacheClassId>,
        addr: Option<u64>,
        destroy: bool,
    ) -> Result<()> {
        let wanted = |s: &Slot| class.map_or(true, |c| c == s.class);
        let mut order: Vec<usize> = match addr {
            Some(addr) => {
                let idx = self.hash(addr);
                match &self.slots[idx] {
                    Some(s) if s.addr == addr && wanted(s) => vec![idx],
                    _ => Vec::new(),
                }
            }
            None => self
                .slots
                .iter()
                .enumerate()
                .filter(|(_, s)| s.as_ref().is_some_and(wanted))
                .map(|(i, _)| i)
                .collect(),
        };
        let slots = &self.slots;
        order.sort_by_key(|&i| slots[i].as_ref().map_or(u64::MAX, |s| s.addr));

        for idx in order {
            if destroy {
                self.evict(store, idx)?;
                continue;
            }
            let Some(slot) = self.slots[idx].as_mut() else {
                continue;
            };
            if slot.thing.is_dirty() {
                let (c, a) = (slot.class, slot.addr);
                slot.thing
                    .flush(store, a)
                    .map_err(|e| FormatError::cant_flush(c, a, e))?;
                self.stats_mut(c).flushes += 1;
            }
        }

        if destroy && addr.is_none() && class.is_none() && !self.protected.is_empty() {
            return Err(FormatError::ProtectedObjectsRemain(self.protected.len()));
        }
        Ok(())
    }

    /// Flush and drop every object. Fails while objects are protected.
    pub fn dest(&mut self, store: &mut dyn BlockStore) -> Result<()> {
        self.flush(store, None, None, true)
    }
}
