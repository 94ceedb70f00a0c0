//! Symbol table nodes and the group B-tree node class.
//!
//! A group's members are kept in symbol table nodes (`"SNOD"`), each holding
//! up to `2 * sym_leaf_k` entries sorted by name. The group B-tree (node
//! type 0) indexes those nodes: its keys are local heap offsets of names,
//! and child `i` holds the names in `(key[i], key[i + 1]]`.

use std::cell::RefCell;
use std::cmp::Ordering;
use std::fmt;
use std::ops::ControlFlow;
use std::rc::Rc;

use tracing::{debug, trace};

use crate::block_store::{AllocKind, BlockStore};
use crate::btree_v1::{EdgeKeys, Ins, LeafInsert, NodeClass};
use crate::codec::{read_u16, read_u32, read_u64, write_u16, write_u32, write_u64};
use crate::error::{FormatError, Result};
use crate::file::FileContext;
use crate::local_heap::LocalHeap;
use crate::metadata_cache::{CacheClass, CacheClassId, CacheThing};

/// Symbol table node signature.
pub const SNOD_SIGNATURE: [u8; 4] = *b"SNOD";

/// Symbol table node version.
pub const SNOD_VERSION: u8 = 1;

/// Encoded size of one symbol table entry.
pub const ENTRY_SIZE: usize = 8 + 8 + 4 + 4 + 16;

/// B-tree node type of group trees.
pub const GROUP_NODE_TYPE: u8 = 0;

/// A single entry in a symbol table node.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SymbolTableEntry {
    /// Byte offset of the link name in the local heap.
    pub name_offset: u64,
    /// Address of the child object's header.
    pub object_header_address: u64,
    /// Cache type: 0=none, 1=group, 2=symbolic link.
    pub cache_type: u32,
    /// 16-byte scratch pad (cached data).
    pub scratch_pad: [u8; 16],
}

impl SymbolTableEntry {
    /// An entry pointing at an object header.
    pub fn new(object_header_address: u64) -> Self {
        Self {
            object_header_address,
            ..Self::default()
        }
    }

    fn encode(&self, buf: &mut [u8]) {
        write_u64(buf, 0, self.name_offset);
        write_u64(buf, 8, self.object_header_address);
        write_u32(buf, 16, self.cache_type);
        buf[24..40].copy_from_slice(&self.scratch_pad);
    }

    fn decode(buf: &[u8]) -> Result<Self> {
        let mut scratch_pad = [0u8; 16];
        crate::codec::ensure_len(buf, 24, 16)?;
        scratch_pad.copy_from_slice(&buf[24..40]);
        Ok(Self {
            name_offset: read_u64(buf, 0)?,
            object_header_address: read_u64(buf, 8)?,
            cache_type: read_u32(buf, 16)?,
            scratch_pad,
        })
    }
}

/// Encoded size of a symbol table node.
pub fn snod_size(sym_leaf_k: usize) -> usize {
    8 + 2 * sym_leaf_k * ENTRY_SIZE
}

/// A symbol table node.
#[derive(Debug, Clone)]
pub struct SymbolNode {
    sym_leaf_k: usize,
    dirty: bool,
    pub entries: Vec<SymbolTableEntry>,
}

impl SymbolNode {
    /// An empty, dirty node.
    pub fn new(sym_leaf_k: usize) -> Self {
        Self {
            sym_leaf_k,
            dirty: true,
            entries: Vec::with_capacity(2 * sym_leaf_k),
        }
    }

    pub fn is_full(&self) -> bool {
        self.entries.len() >= 2 * self.sym_leaf_k
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    pub fn decode(sym_leaf_k: usize, buf: &[u8]) -> Result<Self> {
        crate::codec::ensure_len(buf, 0, snod_size(sym_leaf_k))?;
        if buf[0..4] != SNOD_SIGNATURE {
            return Err(FormatError::InvalidSymbolTableNodeSignature);
        }
        if buf[4] != SNOD_VERSION {
            return Err(FormatError::InvalidSymbolTableNodeVersion(buf[4]));
        }
        let nsyms = read_u16(buf, 6)? as usize;
        if nsyms > 2 * sym_leaf_k {
            return Err(FormatError::InvalidArgument(format!(
                "symbol node holds {nsyms} entries, capacity is {}",
                2 * sym_leaf_k
            )));
        }
        let entries = (0..nsyms)
            .map(|i| {
                let pos = 8 + i * ENTRY_SIZE;
                SymbolTableEntry::decode(&buf[pos..pos + ENTRY_SIZE])
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            sym_leaf_k,
            dirty: false,
            entries,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0u8; snod_size(self.sym_leaf_k)];
        buf[0..4].copy_from_slice(&SNOD_SIGNATURE);
        buf[4] = SNOD_VERSION;
        write_u16(&mut buf, 6, self.entries.len() as u16);
        for (i, entry) in self.entries.iter().enumerate() {
            let pos = 8 + i * ENTRY_SIZE;
            entry.encode(&mut buf[pos..pos + ENTRY_SIZE]);
        }
        buf
    }
}

impl CacheThing for SymbolNode {
    fn flush(&mut self, store: &mut dyn BlockStore, addr: u64) -> Result<()> {
        if self.dirty {
            store.write(addr, &self.encode())?;
            self.dirty = false;
        }
        Ok(())
    }

    fn is_dirty(&self) -> bool {
        self.dirty
    }
}

/// Cache loader for symbol table nodes.
#[derive(Debug, Clone, Copy)]
pub struct SnodLoader {
    pub sym_leaf_k: usize,
}

impl CacheClass for SnodLoader {
    type Thing = SymbolNode;

    fn id(&self) -> CacheClassId {
        CacheClassId::SNODE
    }

    fn load(&self, store: &mut dyn BlockStore, addr: u64) -> Result<SymbolNode> {
        let mut buf = vec![0u8; snod_size(self.sym_leaf_k)];
        store.read(addr, &mut buf)?;
        SymbolNode::decode(self.sym_leaf_k, &buf)
    }
}

/// Per-operation data for the group tree.
#[derive(Debug, Default)]
pub struct GroupUdata {
    /// Name being inserted, looked up or removed.
    pub name: String,
    /// Entry to insert, or the entry found by a lookup.
    pub entry: SymbolTableEntry,
    /// Members collected by iteration, in name order.
    pub listing: Vec<(String, SymbolTableEntry)>,
}

impl GroupUdata {
    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            ..Self::default()
        }
    }
}

/// Node class of group B-trees.
#[derive(Clone)]
pub struct GroupNodeClass {
    heap: Rc<RefCell<LocalHeap>>,
    k: usize,
    sym_leaf_k: usize,
}

impl fmt::Debug for GroupNodeClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GroupNodeClass")
            .field("heap", &self.heap.borrow().addr())
            .field("k", &self.k)
            .field("sym_leaf_k", &self.sym_leaf_k)
            .finish()
    }
}

impl GroupNodeClass {
    pub fn new(heap: Rc<RefCell<LocalHeap>>, k: usize, sym_leaf_k: usize) -> Self {
        Self {
            heap,
            k,
            sym_leaf_k,
        }
    }

    pub fn heap(&self) -> &Rc<RefCell<LocalHeap>> {
        &self.heap
    }

    fn snod(&self) -> SnodLoader {
        SnodLoader {
            sym_leaf_k: self.sym_leaf_k,
        }
    }

    fn cmp_name(&self, name: &str, offset: u64) -> Result<Ordering> {
        Ok(name.cmp(self.heap.borrow().name_at(offset)?))
    }

    /// Binary search a node's entries: `Ok(idx)` on a match, `Err(idx)`
    /// with the insertion point otherwise.
    fn search(&self, entries: &[SymbolTableEntry], name: &str) -> Result<std::result::Result<usize, usize>> {
        let (mut lo, mut hi) = (0, entries.len());
        while lo < hi {
            let mid = (lo + hi) / 2;
            match self.cmp_name(name, entries[mid].name_offset)? {
                Ordering::Equal => return Ok(Ok(mid)),
                Ordering::Less => hi = mid,
                Ordering::Greater => lo = mid + 1,
            }
        }
        Ok(Err(lo))
    }

    fn create_snod(&self, ctx: &mut FileContext) -> Result<u64> {
        let addr = ctx.alloc(AllocKind::SymbolNode, snod_size(self.sym_leaf_k) as u64)?;
        ctx.insert(CacheClassId::SNODE, addr, SymbolNode::new(self.sym_leaf_k))?;
        Ok(addr)
    }

    /// The insertion proper, with `node` protected by the caller.
    fn insert_into(
        &self,
        ctx: &mut FileContext,
        node: &mut SymbolNode,
        keys: &mut EdgeKeys<'_, u64>,
        md: &mut u64,
        udata: &mut GroupUdata,
    ) -> Result<LeafInsert> {
        let mut idx = match self.search(&node.entries, &udata.name)? {
            Ok(_) => return Err(FormatError::DuplicateName(udata.name.clone())),
            Err(idx) => idx,
        };
        let offset = self.heap.borrow_mut().insert(&udata.name)?;
        let entry = SymbolTableEntry {
            name_offset: offset,
            ..udata.entry.clone()
        };
        udata.entry.name_offset = offset;
        let k = self.sym_leaf_k;

        if !node.is_full() {
            if idx == node.entries.len() {
                *keys.right = offset;
                keys.right_changed = true;
            }
            node.entries.insert(idx, entry);
            node.mark_dirty();
            return Ok(LeafInsert::noop());
        }

        // Full: move the upper half to a new node on the right.
        let new_addr = self.create_snod(ctx)?;
        let mut right = ctx.protect(&self.snod(), new_addr)?;
        right.entries = node.entries.split_off(k);
        right.mark_dirty();
        node.mark_dirty();
        *md = node.entries[k - 1].name_offset;

        if idx <= k {
            if idx == k {
                *md = offset;
            }
            node.entries.insert(idx, entry);
        } else {
            idx -= k;
            if idx == k {
                *keys.right = offset;
                keys.right_changed = true;
            }
            right.entries.insert(idx, entry);
        }
        debug!(left = ?node.entries.len(), right = right.entries.len(), new_addr, "split symbol node");
        ctx.unprotect(right)?;
        Ok(LeafInsert::right(new_addr))
    }

    /// Returns `None` when the node emptied and must be deleted.
    fn remove_from(
        &self,
        node: &mut SymbolNode,
        keys: &mut EdgeKeys<'_, u64>,
        udata: &mut GroupUdata,
    ) -> Result<Option<Ins>> {
        let idx = match self.search(&node.entries, &udata.name)? {
            Ok(idx) => idx,
            Err(_) => return Err(FormatError::KeyNotFound),
        };
        let removed = node.entries.remove(idx);
        self.heap.borrow_mut().remove(removed.name_offset)?;
        udata.entry = removed;
        node.mark_dirty();

        if node.entries.is_empty() {
            *keys.right = *keys.left;
            keys.right_changed = true;
            return Ok(None);
        }
        if idx == node.entries.len() {
            *keys.right = node.entries[idx - 1].name_offset;
            keys.right_changed = true;
        }
        Ok(Some(Ins::Noop))
    }
}

impl NodeClass for GroupNodeClass {
    type Key = u64;
    type Udata = GroupUdata;

    fn node_type(&self) -> u8 {
        GROUP_NODE_TYPE
    }

    fn k(&self) -> usize {
        self.k
    }

    fn sizeof_rkey(&self) -> usize {
        8
    }

    fn cmp2(&self, left: &u64, right: &u64) -> Result<Ordering> {
        let heap = self.heap.borrow();
        Ok(heap.name_at(*left)?.cmp(heap.name_at(*right)?))
    }

    fn cmp3(&self, left: &u64, udata: &GroupUdata, right: &u64) -> Result<Ordering> {
        if self.cmp_name(&udata.name, *left)? != Ordering::Greater {
            return Ok(Ordering::Less);
        }
        if self.cmp_name(&udata.name, *right)? == Ordering::Greater {
            return Ok(Ordering::Greater);
        }
        Ok(Ordering::Equal)
    }

    fn new_leaf(
        &self,
        ctx: &mut FileContext,
        _op: Ins,
        left: &mut u64,
        _udata: &mut GroupUdata,
        right: &mut u64,
    ) -> Result<u64> {
        let addr = self.create_snod(ctx)?;
        // Offset 0 is the empty string, which sorts before every name.
        *left = 0;
        *right = 0;
        trace!(addr, "new symbol node");
        Ok(addr)
    }

    fn leaf_found(
        &self,
        ctx: &mut FileContext,
        addr: u64,
        _left: &u64,
        udata: &mut GroupUdata,
    ) -> Result<bool> {
        let node = ctx.find(&self.snod(), addr)?;
        match self.search(&node.entries, &udata.name)? {
            Ok(idx) => {
                udata.entry = node.entries[idx].clone();
                Ok(true)
            }
            Err(_) => Ok(false),
        }
    }

    fn leaf_insert(
        &self,
        ctx: &mut FileContext,
        addr: u64,
        keys: &mut EdgeKeys<'_, u64>,
        md: &mut u64,
        udata: &mut GroupUdata,
    ) -> Result<LeafInsert> {
        let mut node = ctx.protect(&self.snod(), addr)?;
        let res = self.insert_into(ctx, &mut node, keys, md, udata);
        let returned = ctx.unprotect(node);
        let out = res?;
        returned?;
        Ok(out)
    }

    fn leaf_remove(
        &self,
        ctx: &mut FileContext,
        addr: u64,
        keys: &mut EdgeKeys<'_, u64>,
        udata: &mut GroupUdata,
    ) -> Result<Ins> {
        let mut node = ctx.protect(&self.snod(), addr)?;
        match self.remove_from(&mut node, keys, udata) {
            Ok(Some(op)) => {
                ctx.unprotect(node)?;
                Ok(op)
            }
            Ok(None) => {
                ctx.discard(node);
                ctx.free(AllocKind::SymbolNode, addr, snod_size(self.sym_leaf_k) as u64)?;
                debug!(addr, "freed empty symbol node");
                Ok(Ins::Remove)
            }
            Err(e) => ctx.unprotect(node).and(Err(e)),
        }
    }

    fn iterate_leaf(
        &self,
        ctx: &mut FileContext,
        addr: u64,
        _left: &u64,
        _right: &u64,
        udata: &mut GroupUdata,
    ) -> Result<ControlFlow<()>> {
        let entries = ctx.find(&self.snod(), addr)?.entries.clone();
        let heap = self.heap.borrow();
        for entry in entries {
            let name = heap.name_at(entry.name_offset)?.to_owned();
            udata.listing.push((name, entry));
        }
        Ok(ControlFlow::Continue(()))
    }

    fn follow_min(&self) -> bool {
        true
    }

    fn follow_max(&self) -> bool {
        true
    }

    fn encode_key(&self, key: &u64, buf: &mut [u8]) -> Result<()> {
        write_u64(buf, 0, *key);
        Ok(())
    }

    fn decode_key(&self, buf: &[u8]) -> Result<u64> {
        read_u64(buf, 0)
    }
}
