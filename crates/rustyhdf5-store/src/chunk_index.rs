//! Chunk index: a v1 B-tree (node type 1) mapping chunk offsets to the
//! file storage of each chunk.
//!
//! Keys carry the chunk's stored size, its filter mask and its offset in
//! dataset space. Offsets have `rank + 1` entries; the extra trailing
//! dimension is the element size and its offset is always 0. Leaf children
//! are the addresses of the raw chunk data, not tree nodes.

use std::cmp::Ordering;
use std::fmt::Write as _;
use std::ops::ControlFlow;

use tracing::{debug, trace};

use crate::block_store::AllocKind;
use crate::btree_v1::{self, EdgeKeys, Ins, LeafInsert, NodeClass, TreeShape};
use crate::codec::{ensure_len, read_u32, read_u64, write_u32, write_u64};
use crate::error::{FormatError, Result};
use crate::file::FileContext;

/// B-tree node type of chunk indexes.
pub const CHUNK_NODE_TYPE: u8 = 1;

/// One chunk index key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct ChunkKey {
    /// Stored (filtered) size of the chunk in bytes.
    pub nbytes: u32,
    /// Bitmask of filters that were NOT applied.
    pub filter_mask: u32,
    /// Chunk offset in dataset space, element size dimension included.
    pub offsets: Vec<u64>,
}

impl ChunkKey {
    pub fn new(offsets: Vec<u64>, nbytes: u32, filter_mask: u32) -> Self {
        Self {
            nbytes,
            filter_mask,
            offsets,
        }
    }
}

/// Location metadata for a single chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkInfo {
    /// Size of chunk data in the file (after filtering).
    pub chunk_size: u32,
    /// Bitmask of filters that were NOT applied (0 = all applied).
    pub filter_mask: u32,
    /// N-dimensional offset of this chunk in dataset space.
    pub offsets: Vec<u64>,
    /// File address of the chunk data.
    pub address: u64,
}

/// Where a dataset's chunk index lives and how big its chunks are.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkLayout {
    /// Root of the chunk B-tree.
    pub index_addr: u64,
    /// Chunk dimensions with the element size appended.
    pub dims: Vec<u64>,
}

impl ChunkLayout {
    /// Check chunk dimensions (element size last) for use in a layout.
    pub fn check_dims(dims: &[u64]) -> Result<()> {
        if dims.len() < 2 {
            return Err(FormatError::InvalidArgument(
                "chunk dims need at least one dimension plus the element size".into(),
            ));
        }
        if dims.contains(&0) {
            return Err(FormatError::InvalidArgument(format!(
                "zero chunk dimension in {dims:?}"
            )));
        }
        let bytes = dims
            .iter()
            .try_fold(1u64, |acc, &d| acc.checked_mul(d))
            .filter(|&b| b <= u32::MAX as u64);
        if bytes.is_none() {
            return Err(FormatError::InvalidArgument(format!(
                "chunk of {dims:?} exceeds 4 GiB"
            )));
        }
        Ok(())
    }

    /// Number of key offsets, `rank + 1`.
    pub fn ndims(&self) -> usize {
        self.dims.len()
    }

    pub fn rank(&self) -> usize {
        self.dims.len() - 1
    }

    pub fn elem_size(&self) -> usize {
        self.dims[self.rank()] as usize
    }

    /// Uncompressed bytes in one chunk.
    pub fn chunk_bytes(&self) -> usize {
        self.dims.iter().product::<u64>() as usize
    }

    /// Accept `rank` or `rank + 1` offsets; returns `rank + 1`. Offsets must
    /// be multiples of the chunk dimensions, and the chunk must end inside
    /// the `u64` address space.
    pub fn full_offsets(&self, offsets: &[u64]) -> Result<Vec<u64>> {
        let mut full = offsets.to_vec();
        if full.len() == self.rank() {
            full.push(0);
        }
        if full.len() != self.ndims() {
            return Err(FormatError::InvalidArgument(format!(
                "chunk offset {offsets:?} has wrong rank for dims {:?}",
                self.dims
            )));
        }
        if full.iter().zip(&self.dims).any(|(o, d)| o % d != 0) {
            return Err(FormatError::InvalidArgument(format!(
                "chunk offset {offsets:?} is not aligned to dims {:?}",
                self.dims
            )));
        }
        if full.iter().zip(&self.dims).any(|(o, d)| o.checked_add(*d).is_none()) {
            return Err(FormatError::InvalidArgument(format!(
                "chunk at {offsets:?} ends past the largest offset"
            )));
        }
        Ok(full)
    }

    fn class(&self, ctx: &FileContext) -> ChunkNodeClass {
        ChunkNodeClass::new(self.dims.clone(), ctx.config().chunk_btree_k)
    }
}

/// Per-operation data for the chunk tree.
#[derive(Debug, Default)]
pub struct ChunkUdata {
    /// Key being searched for or inserted. Lookups fill in size and mask.
    pub key: ChunkKey,
    /// Address of the chunk found or allocated.
    pub addr: Option<u64>,
    /// Chunks collected by iteration.
    pub listing: Vec<ChunkInfo>,
}

impl ChunkUdata {
    fn for_key(key: ChunkKey) -> Self {
        Self {
            key,
            ..Self::default()
        }
    }
}

/// Node class of chunk B-trees.
#[derive(Debug, Clone)]
pub struct ChunkNodeClass {
    dims: Vec<u64>,
    k: usize,
}

impl ChunkNodeClass {
    pub fn new(dims: Vec<u64>, k: usize) -> Self {
        Self { dims, k }
    }

    fn ndims(&self) -> usize {
        self.dims.len()
    }

    /// Whether the chunks at `a` and `b` share no element.
    fn disjoint(&self, a: &[u64], b: &[u64]) -> bool {
        a.iter()
            .zip(b)
            .zip(&self.dims)
            .any(|((&a, &b), &d)| a.saturating_add(d) <= b || b.saturating_add(d) <= a)
    }
}

impl NodeClass for ChunkNodeClass {
    type Key = ChunkKey;
    type Udata = ChunkUdata;

    fn node_type(&self) -> u8 {
        CHUNK_NODE_TYPE
    }

    fn k(&self) -> usize {
        self.k
    }

    fn sizeof_rkey(&self) -> usize {
        8 + 8 * self.ndims()
    }

    fn cmp2(&self, left: &ChunkKey, right: &ChunkKey) -> Result<Ordering> {
        Ok(left.offsets.cmp(&right.offsets))
    }

    fn cmp3(&self, left: &ChunkKey, udata: &ChunkUdata, right: &ChunkKey) -> Result<Ordering> {
        let offsets = &udata.key.offsets;
        if *offsets < left.offsets {
            Ok(Ordering::Less)
        } else if *offsets >= right.offsets {
            Ok(Ordering::Greater)
        } else {
            Ok(Ordering::Equal)
        }
    }

    fn new_leaf(
        &self,
        ctx: &mut FileContext,
        op: Ins,
        left: &mut ChunkKey,
        udata: &mut ChunkUdata,
        right: &mut ChunkKey,
    ) -> Result<u64> {
        let addr = ctx.alloc(AllocKind::RawData, udata.key.nbytes as u64)?;
        udata.addr = Some(addr);
        *left = udata.key.clone();
        // The right key may already exist; otherwise it is a zero-size
        // chunk just past this one.
        if op != Ins::Left {
            *right = ChunkKey {
                nbytes: 0,
                filter_mask: 0,
                offsets: udata
                    .key
                    .offsets
                    .iter()
                    .zip(&self.dims)
                    .map(|(o, d)| o + d)
                    .collect(),
            };
        }
        trace!(addr, offsets = ?udata.key.offsets, ?op, "new chunk");
        Ok(addr)
    }

    fn leaf_found(
        &self,
        _ctx: &mut FileContext,
        addr: u64,
        left: &ChunkKey,
        udata: &mut ChunkUdata,
    ) -> Result<bool> {
        if udata.key.offsets != left.offsets {
            return Ok(false);
        }
        udata.addr = Some(addr);
        udata.key.nbytes = left.nbytes;
        udata.key.filter_mask = left.filter_mask;
        Ok(true)
    }

    fn leaf_insert(
        &self,
        ctx: &mut FileContext,
        addr: u64,
        keys: &mut EdgeKeys<'_, ChunkKey>,
        md: &mut ChunkKey,
        udata: &mut ChunkUdata,
    ) -> Result<LeafInsert> {
        let left = &mut *keys.left;
        if udata.key.offsets == left.offsets && left.nbytes > 0 {
            if left.nbytes != udata.key.nbytes {
                let new_addr = ctx.realloc(
                    AllocKind::RawData,
                    addr,
                    left.nbytes as u64,
                    udata.key.nbytes as u64,
                )?;
                debug!(
                    old = addr,
                    new = new_addr,
                    from = left.nbytes,
                    to = udata.key.nbytes,
                    "chunk storage resized"
                );
                left.nbytes = udata.key.nbytes;
                left.filter_mask = udata.key.filter_mask;
                keys.left_changed = true;
                udata.addr = Some(new_addr);
                return Ok(LeafInsert::change(new_addr));
            }
            if left.filter_mask != udata.key.filter_mask {
                left.filter_mask = udata.key.filter_mask;
                keys.left_changed = true;
            }
            udata.addr = Some(addr);
            return Ok(LeafInsert::noop());
        }

        if !self.disjoint(&left.offsets, &udata.key.offsets) {
            return Err(FormatError::InvalidArgument(format!(
                "chunk at {:?} overlaps chunk at {:?}",
                udata.key.offsets, left.offsets
            )));
        }
        *md = udata.key.clone();
        let new_addr = ctx.alloc(AllocKind::RawData, udata.key.nbytes as u64)?;
        udata.addr = Some(new_addr);
        Ok(LeafInsert::right(new_addr))
    }

    fn leaf_remove(
        &self,
        ctx: &mut FileContext,
        addr: u64,
        keys: &mut EdgeKeys<'_, ChunkKey>,
        udata: &mut ChunkUdata,
    ) -> Result<Ins> {
        if keys.left.offsets != udata.key.offsets {
            return Err(FormatError::KeyNotFound);
        }
        ctx.free(AllocKind::RawData, addr, keys.left.nbytes as u64)?;
        udata.addr = Some(addr);
        udata.key.nbytes = keys.left.nbytes;
        udata.key.filter_mask = keys.left.filter_mask;
        keys.left_changed = false;
        keys.right_changed = false;
        Ok(Ins::Remove)
    }

    fn iterate_leaf(
        &self,
        _ctx: &mut FileContext,
        addr: u64,
        left: &ChunkKey,
        _right: &ChunkKey,
        udata: &mut ChunkUdata,
    ) -> Result<ControlFlow<()>> {
        udata.listing.push(ChunkInfo {
            chunk_size: left.nbytes,
            filter_mask: left.filter_mask,
            offsets: left.offsets.clone(),
            address: addr,
        });
        Ok(ControlFlow::Continue(()))
    }

    fn follow_min(&self) -> bool {
        false
    }

    fn follow_max(&self) -> bool {
        false
    }

    fn encode_key(&self, key: &ChunkKey, buf: &mut [u8]) -> Result<()> {
        ensure_len(buf, 0, self.sizeof_rkey())?;
        if key.offsets.len() != self.ndims() && key.nbytes != 0 {
            return Err(FormatError::InvalidArgument(format!(
                "key has {} offsets, expected {}",
                key.offsets.len(),
                self.ndims()
            )));
        }
        write_u32(buf, 0, key.nbytes);
        write_u32(buf, 4, key.filter_mask);
        for i in 0..self.ndims() {
            write_u64(buf, 8 + 8 * i, key.offsets.get(i).copied().unwrap_or(0));
        }
        Ok(())
    }

    fn decode_key(&self, buf: &[u8]) -> Result<ChunkKey> {
        let offsets = (0..self.ndims())
            .map(|i| read_u64(buf, 8 + 8 * i))
            .collect::<Result<Vec<_>>>()?;
        Ok(ChunkKey {
            nbytes: read_u32(buf, 0)?,
            filter_mask: read_u32(buf, 4)?,
            offsets,
        })
    }
}

/// Create an empty chunk index for chunks of `dims` (element size last).
pub fn create_index(ctx: &mut FileContext, dims: Vec<u64>) -> Result<ChunkLayout> {
    ChunkLayout::check_dims(&dims)?;
    let mut layout = ChunkLayout {
        index_addr: 0,
        dims,
    };
    layout.index_addr = btree_v1::create(ctx, &layout.class(ctx))?;
    debug!(addr = layout.index_addr, dims = ?layout.dims, "created chunk index");
    Ok(layout)
}

/// The chunk stored at `offsets`, if any.
pub fn lookup(ctx: &mut FileContext, layout: &ChunkLayout, offsets: &[u64]) -> Result<Option<ChunkInfo>> {
    let offsets = layout.full_offsets(offsets)?;
    let class = layout.class(ctx);
    let mut udata = ChunkUdata::for_key(ChunkKey::new(offsets, 0, 0));
    match btree_v1::find(ctx, &class, layout.index_addr, &mut udata) {
        Ok(()) => Ok(udata.addr.map(|address| ChunkInfo {
            chunk_size: udata.key.nbytes,
            filter_mask: udata.key.filter_mask,
            offsets: udata.key.offsets,
            address,
        })),
        Err(e) if e.is_not_found() => Ok(None),
        Err(e) => Err(e),
    }
}

/// Record a chunk of `key.nbytes` stored bytes and return the address its
/// data must be written to. Existing storage is reused, or reallocated
/// when the size changed.
pub fn insert_chunk(ctx: &mut FileContext, layout: &ChunkLayout, key: &ChunkKey) -> Result<u64> {
    if key.nbytes == 0 {
        return Err(FormatError::InvalidArgument("zero-size chunk".into()));
    }
    let offsets = layout.full_offsets(&key.offsets)?;
    let class = layout.class(ctx);
    let mut udata = ChunkUdata::for_key(ChunkKey::new(offsets, key.nbytes, key.filter_mask));
    btree_v1::insert(ctx, &class, layout.index_addr, &mut udata)?;
    udata.addr.ok_or_else(|| {
        FormatError::InvalidTree(format!("insert of chunk {:?} produced no address", key.offsets))
    })
}

/// Drop the chunk at `offsets` from the index and free its storage.
pub fn remove_chunk(ctx: &mut FileContext, layout: &ChunkLayout, offsets: &[u64]) -> Result<ChunkInfo> {
    let offsets = layout.full_offsets(offsets)?;
    let class = layout.class(ctx);
    let mut udata = ChunkUdata::for_key(ChunkKey::new(offsets, 0, 0));
    btree_v1::remove(ctx, &class, layout.index_addr, &mut udata)?;
    Ok(ChunkInfo {
        chunk_size: udata.key.nbytes,
        filter_mask: udata.key.filter_mask,
        offsets: udata.key.offsets,
        address: udata.addr.unwrap_or_default(),
    })
}

/// Every chunk in ascending offset order.
pub fn chunks(ctx: &mut FileContext, layout: &ChunkLayout) -> Result<Vec<ChunkInfo>> {
    let class = layout.class(ctx);
    let mut udata = ChunkUdata::default();
    btree_v1::iterate(ctx, &class, layout.index_addr, &mut udata)?;
    Ok(udata.listing)
}

pub fn validate(ctx: &mut FileContext, layout: &ChunkLayout) -> Result<TreeShape> {
    btree_v1::validate(ctx, &layout.class(ctx), layout.index_addr)
}

/// One line per chunk, for debugging.
pub fn dump(ctx: &mut FileContext, layout: &ChunkLayout) -> Result<String> {
    let mut out = String::new();
    let all = chunks(ctx, layout)?;
    let _ = writeln!(
        out,
        "chunk index at {:#x}, dims {:?}, {} chunks",
        layout.index_addr,
        layout.dims,
        all.len()
    );
    for (i, c) in all.iter().enumerate() {
        let _ = writeln!(
            out,
            "  {i:4}: offset {:?} size {} mask {:#x} addr {:#x}",
            &c.offsets[..layout.rank()],
            c.chunk_size,
            c.filter_mask,
            c.address
        );
    }
    Ok(out)
}
