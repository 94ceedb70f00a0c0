//! Addressed block storage underneath the caches.
//!
//! A [`BlockStore`] hands out file addresses, and reads and writes bytes at
//! them. Two backends are provided: [`MemoryStore`] keeps the whole image
//! in a `Vec<u8>`, [`FileStore`] goes through a `std::fs::File`. Both share
//! the same [`FreeSpace`] tracker for allocation.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use tracing::trace;

use crate::error::{FormatError, Result};

/// Kind of file memory being allocated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AllocKind {
    /// Superblock and other fixed metadata.
    Super,
    /// B-tree nodes.
    BTree,
    /// Symbol table nodes.
    SymbolNode,
    /// Local heap headers and data segments.
    LocalHeap,
    /// Raw chunk data.
    RawData,
}

/// Returns `true` when `[a_addr, a_addr + a_size)` and `[b_addr, b_addr + b_size)`
/// share at least one byte.
pub fn overlaps(a_addr: u64, a_size: u64, b_addr: u64, b_size: u64) -> bool {
    if a_size == 0 || b_size == 0 {
        return false;
    }
    let a_end = a_addr.saturating_add(a_size);
    let b_end = b_addr.saturating_add(b_size);
    a_addr < b_end && b_addr < a_end
}

/// Byte-addressable storage with allocation.
pub trait BlockStore {
    /// Allocate `size` bytes and return the start address.
    fn alloc(&mut self, kind: AllocKind, size: u64) -> Result<u64>;

    /// Return a block to the free pool.
    fn free(&mut self, kind: AllocKind, addr: u64, size: u64) -> Result<()>;

    /// Resize a block, moving its contents when it cannot grow in place.
    fn realloc(&mut self, kind: AllocKind, addr: u64, old_size: u64, new_size: u64) -> Result<u64> {
        if new_size <= old_size {
            if new_size < old_size {
                self.free(kind, addr + new_size, old_size - new_size)?;
            }
            return Ok(addr);
        }
        let new_addr = self.alloc(kind, new_size)?;
        let mut buf = vec![0u8; old_size as usize];
        self.read(addr, &mut buf)?;
        self.write(new_addr, &buf)?;
        self.free(kind, addr, old_size)?;
        Ok(new_addr)
    }

    /// Read `buf.len()` bytes starting at `addr`.
    fn read(&mut self, addr: u64, buf: &mut [u8]) -> Result<()>;

    /// Write `data` starting at `addr`.
    fn write(&mut self, addr: u64, data: &[u8]) -> Result<()>;

    /// Current end of allocated address space.
    fn eoa(&self) -> u64;

    /// Push buffered writes to durable storage.
    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Free-list allocator shared by the store backends.
///
/// Freed blocks are merged with their neighbours; allocation is first-fit
/// over the free list and falls back to extending the end of address
/// space. Freeing the block that ends at EOA shrinks EOA instead.
#[derive(Debug, Clone, Default)]
pub struct FreeSpace {
    eoa: u64,
    limit: Option<u64>,
    free: BTreeMap<u64, u64>,
}

impl FreeSpace {
    /// Start allocating at `eoa`.
    pub fn new(eoa: u64) -> Self {
        Self {
            eoa,
            limit: None,
            free: BTreeMap::new(),
        }
    }

    /// Refuse to grow EOA past `limit`.
    pub fn with_limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn eoa(&self) -> u64 {
        self.eoa
    }

    /// Total bytes sitting on the free list.
    pub fn free_bytes(&self) -> u64 {
        self.free.values().sum()
    }

    pub fn alloc(&mut self, size: u64) -> Result<u64> {
        if size == 0 {
            return Err(FormatError::InvalidArgument(
                "zero-sized allocation".into(),
            ));
        }
        let hit = self
            .free
            .iter()
            .find(|(_, &len)| len >= size)
            .map(|(&addr, &len)| (addr, len));
        if let Some((addr, len)) = hit {
            self.free.remove(&addr);
            if len > size {
                self.free.insert(addr + size, len - size);
            }
            return Ok(addr);
        }
        let addr = self.eoa;
        let end = addr
            .checked_add(size)
            .ok_or(FormatError::AllocationFailed { size })?;
        if self.limit.is_some_and(|limit| end > limit) {
            return Err(FormatError::AllocationFailed { size });
        }
        self.eoa = end;
        Ok(addr)
    }

    pub fn free(&mut self, addr: u64, size: u64) -> Result<()> {
        if size == 0 {
            return Ok(());
        }
        let end = addr
            .checked_add(size)
            .filter(|&end| end <= self.eoa)
            .ok_or(FormatError::AddressOutOfRange {
                addr,
                size,
                eoa: self.eoa,
            })?;
        let mut start = addr;
        let mut len = size;

        if let Some((&prev, &prev_len)) = self.free.range(..addr).next_back() {
            if prev + prev_len > addr {
                return Err(FormatError::InvalidArgument(format!(
                    "double free of {addr:#x}+{size}"
                )));
            }
            if prev + prev_len == addr {
                self.free.remove(&prev);
                start = prev;
                len += prev_len;
            }
        }
        if let Some((&next, &next_len)) = self.free.range(addr..).next() {
            if next < end {
                return Err(FormatError::InvalidArgument(format!(
                    "double free of {addr:#x}+{size}"
                )));
            }
            if next == end {
                self.free.remove(&next);
                len += next_len;
            }
        }

        if start + len == self.eoa {
            self.eoa = start;
        } else {
            self.free.insert(start, len);
        }
        Ok(())
    }

    /// Try to grow a block in place; returns `true` on success.
    pub fn extend(&mut self, addr: u64, old_size: u64, new_size: u64) -> bool {
        let end = addr + old_size;
        let extra = new_size - old_size;
        if end == self.eoa {
            let new_end = addr + new_size;
            if self.limit.is_some_and(|limit| new_end > limit) {
                return false;
            }
            self.eoa = new_end;
            return true;
        }
        match self.free.get(&end).copied() {
            Some(len) if len >= extra => {
                self.free.remove(&end);
                if len > extra {
                    self.free.insert(end + extra, len - extra);
                }
                true
            }
            _ => false,
        }
    }
}

/// In-memory block store backed by a byte vector.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    data: Vec<u8>,
    space: FreeSpace,
}

impl MemoryStore {
    /// An empty image.
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap an existing image; allocation starts at its end.
    pub fn from_bytes(data: Vec<u8>) -> Self {
        let eoa = data.len() as u64;
        Self {
            data,
            space: FreeSpace::new(eoa),
        }
    }

    /// An empty image that refuses to grow past `limit` bytes.
    pub fn with_limit(limit: u64) -> Self {
        Self {
            data: Vec::new(),
            space: FreeSpace::new(0).with_limit(limit),
        }
    }

    /// The image up to EOA.
    pub fn as_bytes(&self) -> &[u8] {
        &self.data[..(self.space.eoa() as usize).min(self.data.len())]
    }

    pub fn into_bytes(mut self) -> Vec<u8> {
        self.data.resize(self.space.eoa() as usize, 0);
        self.data
    }

    pub fn free_space(&self) -> &FreeSpace {
        &self.space
    }

    fn check_range(&self, addr: u64, size: usize) -> Result<()> {
        let eoa = self.space.eoa();
        match addr.checked_add(size as u64) {
            Some(end) if end <= eoa => Ok(()),
            _ => Err(FormatError::AddressOutOfRange {
                addr,
                size: size as u64,
                eoa,
            }),
        }
    }
}

impl BlockStore for MemoryStore {
    fn alloc(&mut self, kind: AllocKind, size: u64) -> Result<u64> {
        let addr = self.space.alloc(size)?;
        trace!(?kind, addr, size, "alloc");
        Ok(addr)
    }

    fn free(&mut self, kind: AllocKind, addr: u64, size: u64) -> Result<()> {
        trace!(?kind, addr, size, "free");
        self.space.free(addr, size)
    }

    fn realloc(&mut self, kind: AllocKind, addr: u64, old_size: u64, new_size: u64) -> Result<u64> {
        if new_size > old_size && self.space.extend(addr, old_size, new_size) {
            return Ok(addr);
        }
        if new_size <= old_size {
            if new_size < old_size {
                self.free(kind, addr + new_size, old_size - new_size)?;
            }
            return Ok(addr);
        }
        let new_addr = self.alloc(kind, new_size)?;
        let mut buf = vec![0u8; old_size as usize];
        self.read(addr, &mut buf)?;
        self.write(new_addr, &buf)?;
        self.free(kind, addr, old_size)?;
        Ok(new_addr)
    }

    fn read(&mut self, addr: u64, buf: &mut [u8]) -> Result<()> {
        self.check_range(addr, buf.len())?;
        let start = addr as usize;
        let end = start + buf.len();
        // Allocated but never written bytes read as zero.
        let avail = self.data.len().min(end);
        if start < avail {
            buf[..avail - start].copy_from_slice(&self.data[start..avail]);
            buf[avail - start..].fill(0);
        } else {
            buf.fill(0);
        }
        Ok(())
    }

    fn write(&mut self, addr: u64, data: &[u8]) -> Result<()> {
        self.check_range(addr, data.len())?;
        let start = addr as usize;
        let end = start + data.len();
        if self.data.len() < end {
            self.data.resize(end, 0);
        }
        self.data[start..end].copy_from_slice(data);
        Ok(())
    }

    fn eoa(&self) -> u64 {
        self.space.eoa()
    }
}

/// Block store backed by a file on disk.
#[derive(Debug)]
pub struct FileStore {
    file: File,
    space: FreeSpace,
}

impl FileStore {
    /// Create (or truncate) a file.
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        Ok(Self {
            file,
            space: FreeSpace::new(0),
        })
    }

    /// Open an existing file; allocation continues at its current length.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let eoa = file.metadata()?.len();
        Ok(Self {
            file,
            space: FreeSpace::new(eoa),
        })
    }

    fn check_range(&self, addr: u64, size: usize) -> Result<()> {
        let eoa = self.space.eoa();
        match addr.checked_add(size as u64) {
            Some(end) if end <= eoa => Ok(()),
            _ => Err(FormatError::AddressOutOfRange {
                addr,
                size: size as u64,
                eoa,
            }),
        }
    }
}

impl BlockStore for FileStore {
    fn alloc(&mut self, kind: AllocKind, size: u64) -> Result<u64> {
        let addr = self.space.alloc(size)?;
        trace!(?kind, addr, size, "alloc");
        Ok(addr)
    }

    fn free(&mut self, kind: AllocKind, addr: u64, size: u64) -> Result<()> {
        trace!(?kind, addr, size, "free");
        self.space.free(addr, size)
    }

    fn realloc(&mut self, kind: AllocKind, addr: u64, old_size: u64, new_size: u64) -> Result<u64> {
        if new_size > old_size && self.space.extend(addr, old_size, new_size) {
            return Ok(addr);
        }
        if new_size <= old_size {
            if new_size < old_size {
                self.free(kind, addr + new_size, old_size - new_size)?;
            }
            return Ok(addr);
        }
        let new_addr = self.alloc(kind, new_size)?;
        let mut buf = vec![0u8; old_size as usize];
        self.read(addr, &mut buf)?;
        self.write(new_addr, &buf)?;
        self.free(kind, addr, old_size)?;
        Ok(new_addr)
    }

    fn read(&mut self, addr: u64, buf: &mut [u8]) -> Result<()> {
        self.check_range(addr, buf.len())?;
        let len = self.file.metadata()?.len();
        let end = addr + buf.len() as u64;
        let avail = end.min(len).saturating_sub(addr) as usize;
        if avail > 0 {
            self.file.seek(SeekFrom::Start(addr))?;
            self.file.read_exact(&mut buf[..avail])?;
        }
        buf[avail..].fill(0);
        Ok(())
    }

    fn write(&mut self, addr: u64, data: &[u8]) -> Result<()> {
        self.check_range(addr, data.len())?;
        self.file.seek(SeekFrom::Start(addr))?;
        self.file.write_all(data)?;
        Ok(())
    }

    fn eoa(&self) -> u64 {
        self.space.eoa()
    }

    fn flush(&mut self) -> Result<()> {
        let len = self.file.metadata()?.len();
        if len < self.space.eoa() {
            self.file.set_len(self.space.eoa())?;
        }
        self.file.flush()?;
        self.file.sync_data()?;
        Ok(())
    }
}
