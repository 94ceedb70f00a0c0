//! Local heap holding the names of a group's members.
//!
//! Version 0 layout: a 32-byte `"HEAP"` header (data segment size,
//! free-list head offset, data segment address) pointing at a separately
//! allocated data segment. Names are stored NUL-terminated and padded to a
//! multiple of 8 bytes, never smaller than one free-list record, so any
//! freed name can be threaded onto the free list. Offset 0 always holds
//! the empty string.
//!
//! The whole data segment is kept in memory; [`LocalHeap::flush`] writes
//! it back, moving it when it has grown.

use tracing::{debug, trace};

use crate::block_store::AllocKind;
use crate::codec::{read_u64, write_u64, SIZEOF_SIZE};
use crate::error::{FormatError, Result};
use crate::file::FileContext;

/// Header signature.
pub const HEAP_SIGNATURE: [u8; 4] = *b"HEAP";

/// Encoded header size.
pub const HEAP_HEADER_SIZE: usize = 8 + 2 * SIZEOF_SIZE + 8;

/// Size of one free-list record (next offset + block size).
const FREE_RECORD_SIZE: u64 = 2 * SIZEOF_SIZE as u64;

/// Free-list terminator.
const FREE_NULL: u64 = 1;

fn align8(n: u64) -> u64 {
    (n + 7) & !7
}

/// Bytes reserved for a name of `len` bytes.
fn block_size(len: usize) -> u64 {
    align8(len as u64 + 1).max(FREE_RECORD_SIZE)
}

/// A local heap loaded into memory.
#[derive(Debug, Clone)]
pub struct LocalHeap {
    addr: u64,
    data_addr: u64,
    disk_size: u64,
    data: Vec<u8>,
    /// Free blocks as `(offset, size)`, sorted by offset.
    free: Vec<(u64, u64)>,
    dirty: bool,
}

impl LocalHeap {
    /// Allocate a new heap with room for at least `size_hint` bytes.
    pub fn create(ctx: &mut FileContext, size_hint: usize) -> Result<Self> {
        let size = align8(size_hint as u64).max(2 * FREE_RECORD_SIZE);
        let addr = ctx.alloc(AllocKind::LocalHeap, HEAP_HEADER_SIZE as u64)?;
        let data_addr = ctx.alloc(AllocKind::LocalHeap, size)?;
        let reserved = block_size(0);
        let heap = Self {
            addr,
            data_addr,
            disk_size: size,
            data: vec![0u8; size as usize],
            free: vec![(reserved, size - reserved)],
            dirty: true,
        };
        debug!(addr, data_addr, size, "created local heap");
        Ok(heap)
    }

    /// Load the heap whose header is at `addr`.
    pub fn open(ctx: &mut FileContext, addr: u64) -> Result<Self> {
        let mut header = [0u8; HEAP_HEADER_SIZE];
        ctx.read(addr, &mut header)?;
        if header[0..4] != HEAP_SIGNATURE {
            return Err(FormatError::InvalidLocalHeapSignature);
        }
        if header[4] != 0 {
            return Err(FormatError::InvalidLocalHeapVersion(header[4]));
        }
        let size = read_u64(&header, 8)?;
        let mut next = read_u64(&header, 16)?;
        let data_addr = read_u64(&header, 24)?;

        let mut data = vec![0u8; size as usize];
        ctx.read(data_addr, &mut data)?;

        let mut free = Vec::new();
        while next != FREE_NULL {
            // A well-formed list cannot have more records than 16-byte blocks.
            if free.len() as u64 > size / FREE_RECORD_SIZE
                || next + FREE_RECORD_SIZE > size
            {
                return Err(FormatError::InvalidHeapOffset(next));
            }
            let pos = next as usize;
            let following = read_u64(&data, pos)?;
            let len = read_u64(&data, pos + SIZEOF_SIZE)?;
            if len < FREE_RECORD_SIZE || next + len > size {
                return Err(FormatError::InvalidHeapOffset(next));
            }
            free.push((next, len));
            next = following;
        }
        free.sort_unstable();

        Ok(Self {
            addr,
            data_addr,
            disk_size: size,
            data,
            free,
            dirty: false,
        })
    }

    /// Address of the heap header.
    pub fn addr(&self) -> u64 {
        self.addr
    }

    /// Current size of the data segment.
    pub fn data_size(&self) -> usize {
        self.data.len()
    }

    /// Bytes available on the free list.
    pub fn free_bytes(&self) -> u64 {
        self.free.iter().map(|&(_, len)| len).sum()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// The NUL-terminated string starting at `offset`.
    pub fn name_at(&self, offset: u64) -> Result<&str> {
        let start = usize::try_from(offset)
            .ok()
            .filter(|&s| s < self.data.len())
            .ok_or(FormatError::InvalidHeapOffset(offset))?;
        let len = self.data[start..]
            .iter()
            .position(|&b| b == 0)
            .ok_or(FormatError::InvalidHeapOffset(offset))?;
        std::str::from_utf8(&self.data[start..start + len])
            .map_err(|_| FormatError::InvalidHeapOffset(offset))
    }

    /// Store `name` and return its offset.
    pub fn insert(&mut self, name: &str) -> Result<u64> {
        if name.as_bytes().contains(&0) {
            return Err(FormatError::InvalidArgument(format!(
                "name {name:?} contains a NUL byte"
            )));
        }
        let need = block_size(name.len());
        let offset = match self.take_free(need) {
            Some(offset) => offset,
            None => self.grow(need),
        };
        let start = offset as usize;
        let end = start + need as usize;
        self.data[start..end].fill(0);
        self.data[start..start + name.len()].copy_from_slice(name.as_bytes());
        self.dirty = true;
        trace!(heap = self.addr, offset, name, "heap insert");
        Ok(offset)
    }

    /// Release the name stored at `offset`.
    pub fn remove(&mut self, offset: u64) -> Result<()> {
        if offset == 0 {
            return Err(FormatError::InvalidHeapOffset(0));
        }
        let len = self.name_at(offset)?.len();
        let size = block_size(len);
        if offset + size > self.data.len() as u64 {
            return Err(FormatError::InvalidHeapOffset(offset));
        }
        let pos = self.free.partition_point(|&(o, _)| o < offset);
        let overlaps_prev = pos > 0 && {
            let (o, l) = self.free[pos - 1];
            o + l > offset
        };
        let overlaps_next = self.free.get(pos).is_some_and(|&(o, _)| o < offset + size);
        if overlaps_prev || overlaps_next {
            return Err(FormatError::InvalidHeapOffset(offset));
        }

        let start = offset as usize;
        self.data[start..start + size as usize].fill(0);
        self.free.insert(pos, (offset, size));
        self.merge_free(pos);
        self.dirty = true;
        trace!(heap = self.addr, offset, size, "heap remove");
        Ok(())
    }

    /// Merge the free block at `pos` with its neighbours.
    fn merge_free(&mut self, pos: usize) {
        if pos + 1 < self.free.len() {
            let (o, l) = self.free[pos];
            let (next, next_len) = self.free[pos + 1];
            if o + l == next {
                self.free[pos].1 = l + next_len;
                self.free.remove(pos + 1);
            }
        }
        if pos > 0 {
            let (prev, prev_len) = self.free[pos - 1];
            let (o, l) = self.free[pos];
            if prev + prev_len == o {
                self.free[pos - 1].1 = prev_len + l;
                self.free.remove(pos);
            }
        }
    }

    /// First fit; a remainder is kept only when it can hold a free record.
    fn take_free(&mut self, need: u64) -> Option<u64> {
        let pos = self
            .free
            .iter()
            .position(|&(_, len)| len == need || len >= need + FREE_RECORD_SIZE)?;
        let (offset, len) = self.free[pos];
        if len == need {
            self.free.remove(pos);
        } else {
            self.free[pos] = (offset + need, len - need);
        }
        Some(offset)
    }

    /// Grow the data segment (at least doubling it) and place a `need`
    /// byte block at the old end, reusing a trailing free block.
    fn grow(&mut self, need: u64) -> u64 {
        let old = self.data.len() as u64;
        let (start, have) = match self.free.last() {
            Some(&(o, l)) if o + l == old => {
                self.free.pop();
                (o, l)
            }
            _ => (old, 0),
        };
        let mut extra = need.saturating_sub(have).max(old);
        let rest = have + extra - need;
        if rest > 0 && rest < FREE_RECORD_SIZE {
            extra += FREE_RECORD_SIZE;
        }
        self.data.resize((old + extra) as usize, 0);
        let len = have + extra;
        if len > need {
            self.free.push((start + need, len - need));
        }
        debug!(heap = self.addr, old, new_size = old + extra, "grew local heap");
        start
    }

    /// Write the header and data segment, moving the segment when it grew.
    pub fn flush(&mut self, ctx: &mut FileContext) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }
        let size = self.data.len() as u64;
        if size != self.disk_size {
            self.data_addr = ctx.realloc(AllocKind::LocalHeap, self.data_addr, self.disk_size, size)?;
            self.disk_size = size;
        }

        let mut image = self.data.clone();
        let mut head = FREE_NULL;
        for &(offset, len) in self.free.iter().rev() {
            write_u64(&mut image, offset as usize, head);
            write_u64(&mut image, offset as usize + SIZEOF_SIZE, len);
            head = offset;
        }
        ctx.write(self.data_addr, &image)?;

        let mut header = [0u8; HEAP_HEADER_SIZE];
        header[0..4].copy_from_slice(&HEAP_SIGNATURE);
        write_u64(&mut header, 8, size);
        write_u64(&mut header, 16, head);
        write_u64(&mut header, 24, self.data_addr);
        ctx.write(self.addr, &header)?;
        self.dirty = false;
        Ok(())
    }
}
