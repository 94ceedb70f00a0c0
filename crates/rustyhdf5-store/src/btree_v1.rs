//! Version 1 B-link trees.
//!
//! One engine serves every tree in the file. What a key means, how leaves
//! are created and what a leaf child points at is supplied by a
//! [`NodeClass`]: the group trees in [`crate::symbol_table`] and the chunk
//! index in [`crate::chunk_index`] are both classes plugged into the
//! functions here.
//!
//! Nodes hold between 1 and `2K` children and `nchildren + 1` keys. Child
//! `i` covers the key range `[keys[i], keys[i + 1])` as judged by the
//! class's `cmp3`. Nodes on the same level are linked through their
//! `left`/`right` sibling addresses, which lets [`iterate`] walk the leaves
//! without going back through the root.
//!
//! Every node lives in the metadata cache. A node being modified is
//! protected for the duration of the change and handed back afterwards,
//! including on error paths.
//!
//! On disk a node is:
//!
//! ```text
//! "TREE" | type u8 | level u8 | entries u16 | left addr | right addr
//! key[0] child[0] key[1] child[1] ... key[2K-1] child[2K-1] key[2K]
//! ```
//!
//! with unused key and child slots zero-filled.

use std::cmp::Ordering;
use std::fmt;
use std::ops::ControlFlow;

use tracing::{debug, trace};

use crate::block_store::{AllocKind, BlockStore};
use crate::codec::{read_addr, read_u16, read_u64, write_addr, write_u16, write_u64, SIZEOF_ADDR};
use crate::error::{FormatError, Result};
use crate::file::FileContext;
use crate::metadata_cache::{CacheClass, CacheClassId, CacheThing, Protected};

/// Node signature.
pub const BTREE_SIGNATURE: [u8; 4] = *b"TREE";

/// Size of the fixed node header.
pub const NODE_HEADER_SIZE: usize = 4 + 1 + 1 + 2 + 2 * SIZEOF_ADDR;

/// Insertion outcome passed between tree levels and leaf callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ins {
    /// Nothing changed in the parent.
    Noop,
    /// A new child goes to the left of the current one.
    Left,
    /// A new child goes to the right of the current one.
    Right,
    /// The current child moved to a new address.
    Change,
    /// The first child of an empty tree.
    First,
    /// The current child is gone and must be removed from the parent.
    Remove,
}

/// Result of a leaf insertion callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeafInsert {
    pub op: Ins,
    /// New child address for `Left`, `Right` and `Change`.
    pub new_child: Option<u64>,
}

impl LeafInsert {
    pub fn noop() -> Self {
        Self {
            op: Ins::Noop,
            new_child: None,
        }
    }

    pub fn change(addr: u64) -> Self {
        Self {
            op: Ins::Change,
            new_child: Some(addr),
        }
    }

    pub fn left(addr: u64) -> Self {
        Self {
            op: Ins::Left,
            new_child: Some(addr),
        }
    }

    pub fn right(addr: u64) -> Self {
        Self {
            op: Ins::Right,
            new_child: Some(addr),
        }
    }
}

/// The two keys bounding a child, with flags recording whether the callee
/// changed them.
#[derive(Debug)]
pub struct EdgeKeys<'a, K> {
    pub left: &'a mut K,
    pub left_changed: bool,
    pub right: &'a mut K,
    pub right_changed: bool,
}

impl<'a, K> EdgeKeys<'a, K> {
    pub fn new(left: &'a mut K, right: &'a mut K) -> Self {
        Self {
            left,
            left_changed: false,
            right,
            right_changed: false,
        }
    }
}

/// Behaviour that parameterizes the tree engine for one kind of tree.
///
/// `cmp3` decides where the search key in `udata` falls relative to the
/// range `[left, right)` of a child: `Less` when it is left of the range,
/// `Greater` when it is at or past `right`, `Equal` when it is inside.
/// `cmp2` orders two stored keys and is only used for structural checks.
pub trait NodeClass: Clone + fmt::Debug + 'static {
    /// In-memory key.
    type Key: Clone + Default + fmt::Debug + 'static;
    /// Per-operation user data: the search key and any results.
    type Udata;

    /// Node type byte stored in every node of this class.
    fn node_type(&self) -> u8;

    /// Minimum degree; nodes hold at most `2 * k()` children.
    fn k(&self) -> usize;

    /// Encoded size of one key.
    fn sizeof_rkey(&self) -> usize;

    fn cmp2(&self, left: &Self::Key, right: &Self::Key) -> Result<Ordering>;

    fn cmp3(&self, left: &Self::Key, udata: &Self::Udata, right: &Self::Key) -> Result<Ordering>;

    /// Create a new leaf child for `udata` and return its address.
    ///
    /// `op` says whether the child becomes the first, left-most or
    /// right-most child; the callback fills in the keys it owns.
    fn new_leaf(
        &self,
        ctx: &mut FileContext,
        op: Ins,
        left: &mut Self::Key,
        udata: &mut Self::Udata,
        right: &mut Self::Key,
    ) -> Result<u64>;

    /// Look `udata` up in the leaf child at `addr`. Returns `false` when
    /// the child does not hold it.
    fn leaf_found(
        &self,
        ctx: &mut FileContext,
        addr: u64,
        left: &Self::Key,
        udata: &mut Self::Udata,
    ) -> Result<bool>;

    /// Insert `udata` into the leaf child at `addr`.
    ///
    /// For `Left`/`Right` results `md` receives the key shared between the
    /// existing child and the new one.
    fn leaf_insert(
        &self,
        ctx: &mut FileContext,
        addr: u64,
        keys: &mut EdgeKeys<'_, Self::Key>,
        md: &mut Self::Key,
        udata: &mut Self::Udata,
    ) -> Result<LeafInsert>;

    /// Remove `udata` from the leaf child at `addr`.
    ///
    /// The default leaves the child object alone and only drops the tree's
    /// reference to it.
    fn leaf_remove(
        &self,
        ctx: &mut FileContext,
        addr: u64,
        keys: &mut EdgeKeys<'_, Self::Key>,
        udata: &mut Self::Udata,
    ) -> Result<Ins> {
        let _ = (ctx, addr, udata);
        keys.left_changed = false;
        keys.right_changed = false;
        Ok(Ins::Remove)
    }

    /// Visit one leaf child during [`iterate`].
    fn iterate_leaf(
        &self,
        ctx: &mut FileContext,
        addr: u64,
        left: &Self::Key,
        right: &Self::Key,
        udata: &mut Self::Udata,
    ) -> Result<ControlFlow<()>>;

    /// Whether keys below the tree's minimum are handed to the left-most
    /// leaf instead of getting a new leaf of their own.
    fn follow_min(&self) -> bool;

    /// Same as [`NodeClass::follow_min`] for keys past the maximum.
    fn follow_max(&self) -> bool;

    fn encode_key(&self, key: &Self::Key, buf: &mut [u8]) -> Result<()>;

    fn decode_key(&self, buf: &[u8]) -> Result<Self::Key>;
}

/// Encoded size of one node of `class`.
pub fn node_size<C: NodeClass>(class: &C) -> usize {
    let two_k = 2 * class.k();
    NODE_HEADER_SIZE + two_k * (class.sizeof_rkey() + SIZEOF_ADDR) + class.sizeof_rkey()
}

/// One B-tree node.
#[derive(Debug, Clone)]
pub struct BTreeNode<C: NodeClass> {
    class: C,
    dirty: bool,
    /// 0 for leaves.
    pub level: u8,
    /// Left sibling on the same level.
    pub left: Option<u64>,
    /// Right sibling on the same level.
    pub right: Option<u64>,
    /// `nchildren + 1` keys.
    pub keys: Vec<C::Key>,
    pub children: Vec<u64>,
}

impl<C: NodeClass> BTreeNode<C> {
    /// An empty, dirty node.
    pub fn new(class: C, level: u8) -> Self {
        Self {
            class,
            dirty: true,
            level,
            left: None,
            right: None,
            keys: vec![C::Key::default()],
            children: Vec::new(),
        }
    }

    pub fn nchildren(&self) -> usize {
        self.children.len()
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    /// Decode a node read from the file.
    pub fn decode(class: C, buf: &[u8]) -> Result<Self> {
        let size = node_size(&class);
        crate::codec::ensure_len(buf, 0, size)?;
        if buf[0..4] != BTREE_SIGNATURE {
            return Err(FormatError::InvalidBTreeSignature);
        }
        if buf[4] != class.node_type() {
            return Err(FormatError::InvalidNodeType {
                expected: class.node_type(),
                found: buf[4],
            });
        }
        let level = buf[5];
        let nchildren = read_u16(buf, 6)? as usize;
        if nchildren > 2 * class.k() {
            return Err(FormatError::InvalidTree(format!(
                "node holds {nchildren} children, capacity is {}",
                2 * class.k()
            )));
        }
        let left = read_addr(buf, 8)?;
        let right = read_addr(buf, 16)?;

        let rkey = class.sizeof_rkey();
        let mut keys = Vec::with_capacity(nchildren + 1);
        let mut children = Vec::with_capacity(nchildren);
        let mut pos = NODE_HEADER_SIZE;
        for _ in 0..nchildren {
            keys.push(class.decode_key(&buf[pos..pos + rkey])?);
            pos += rkey;
            children.push(read_u64(buf, pos)?);
            pos += SIZEOF_ADDR;
        }
        keys.push(class.decode_key(&buf[pos..pos + rkey])?);

        Ok(Self {
            class,
            dirty: false,
            level,
            left,
            right,
            keys,
            children,
        })
    }

    /// Encode the node into a zero-filled buffer of [`node_size`] bytes.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let rkey = self.class.sizeof_rkey();
        let mut buf = vec![0u8; node_size(&self.class)];
        buf[0..4].copy_from_slice(&BTREE_SIGNATURE);
        buf[4] = self.class.node_type();
        buf[5] = self.level;
        write_u16(&mut buf, 6, self.nchildren() as u16);
        write_addr(&mut buf, 8, self.left);
        write_addr(&mut buf, 16, self.right);

        let mut pos = NODE_HEADER_SIZE;
        for (key, &child) in self.keys.iter().zip(&self.children) {
            self.class.encode_key(key, &mut buf[pos..pos + rkey])?;
            pos += rkey;
            write_u64(&mut buf, pos, child);
            pos += SIZEOF_ADDR;
        }
        if let Some(last) = self.keys.get(self.nchildren()) {
            self.class.encode_key(last, &mut buf[pos..pos + rkey])?;
        }
        Ok(buf)
    }

    /// Splice a new child in at `idx`. `md` becomes the new child's left
    /// key for `Right` anchors and its right key for `Left` anchors.
    fn insert_child(&mut self, idx: usize, child: u64, anchor: Ins, md: C::Key) {
        if anchor == Ins::Right {
            self.keys.insert(idx, md);
        } else {
            self.keys.insert(idx + 1, md);
        }
        self.children.insert(idx, child);
        self.dirty = true;
    }
}

impl<C: NodeClass> CacheThing for BTreeNode<C> {
    fn flush(&mut self, store: &mut dyn BlockStore, addr: u64) -> Result<()> {
        if self.dirty {
            let buf = self.encode()?;
            store.write(addr, &buf)?;
            self.dirty = false;
        }
        Ok(())
    }

    fn is_dirty(&self) -> bool {
        self.dirty
    }
}

/// Cache loader for nodes of one class.
struct NodeLoader<'a, C>(&'a C);

impl<C: NodeClass> CacheClass for NodeLoader<'_, C> {
    type Thing = BTreeNode<C>;

    fn id(&self) -> CacheClassId {
        CacheClassId::BTREE
    }

    fn load(&self, store: &mut dyn BlockStore, addr: u64) -> Result<BTreeNode<C>> {
        let mut buf = vec![0u8; node_size(self.0)];
        store.read(addr, &mut buf)?;
        BTreeNode::decode(self.0.clone(), &buf)
    }
}

/// Mutable references to the two keys around child `idx`.
fn key_pair<K>(keys: &mut [K], idx: usize) -> (&mut K, &mut K) {
    let (lo, hi) = keys.split_at_mut(idx + 1);
    (&mut lo[idx], &mut hi[0])
}

/// Binary search for the child whose range holds `udata`.
///
/// Returns the last probed index and comparison; `initial` is reported
/// for an empty node.
fn search<C: NodeClass>(
    class: &C,
    node: &BTreeNode<C>,
    udata: &C::Udata,
    initial: Ordering,
) -> Result<(usize, Ordering)> {
    let (mut lo, mut hi) = (0, node.nchildren());
    let mut idx = 0;
    let mut cmp = initial;
    while lo < hi && cmp != Ordering::Equal {
        idx = (lo + hi) / 2;
        cmp = class.cmp3(&node.keys[idx], udata, &node.keys[idx + 1])?;
        if cmp == Ordering::Less {
            hi = idx;
        } else {
            lo = idx + 1;
        }
    }
    Ok((idx, cmp))
}

/// Hand a protected node back to the cache, keeping the first error.
fn release<C: NodeClass, R>(
    ctx: &mut FileContext,
    node: Protected<BTreeNode<C>>,
    res: Result<R>,
) -> Result<R> {
    let returned = ctx.unprotect(node);
    let out = res?;
    returned?;
    Ok(out)
}

fn create_node<C: NodeClass>(ctx: &mut FileContext, class: &C, level: u8) -> Result<u64> {
    let addr = ctx.alloc(AllocKind::BTree, node_size(class) as u64)?;
    ctx.insert(CacheClassId::BTREE, addr, BTreeNode::new(class.clone(), level))?;
    trace!(addr, level, "created B-tree node");
    Ok(addr)
}

/// Create an empty tree and return the address of its root.
pub fn create<C: NodeClass>(ctx: &mut FileContext, class: &C) -> Result<u64> {
    create_node(ctx, class, 0)
}

/// Search the tree for `udata`; the class's `leaf_found` fills in the
/// result.
pub fn find<C: NodeClass>(
    ctx: &mut FileContext,
    class: &C,
    addr: u64,
    udata: &mut C::Udata,
) -> Result<()> {
    let (level, child, left) = {
        let node = ctx.find(&NodeLoader(class), addr)?;
        let (idx, cmp) = search(class, node, udata, Ordering::Greater)?;
        if cmp != Ordering::Equal {
            return Err(FormatError::KeyNotFound);
        }
        (node.level, node.children[idx], node.keys[idx].clone())
    };
    trace!(addr, level, child, "find");
    if level > 0 {
        find(ctx, class, child, udata)
    } else if class.leaf_found(ctx, child, &left, udata)? {
        Ok(())
    } else {
        Err(FormatError::KeyNotFound)
    }
}

/// Split `old` (stored at `old_addr`) in two.
///
/// The upper part of the children moves to a new right sibling, which is
/// returned still protected. `idx` is where the caller will insert the
/// new child; both halves keep at least one child.
fn split<C: NodeClass>(
    ctx: &mut FileContext,
    class: &C,
    old: &mut BTreeNode<C>,
    old_addr: u64,
    idx: usize,
) -> Result<Protected<BTreeNode<C>>> {
    let two_k = 2 * class.k();
    let ratios = ctx.config().split_ratios;
    let ratio = if old.right.is_none() {
        ratios.right
    } else if old.left.is_none() {
        ratios.left
    } else {
        ratios.middle
    };
    let nleft = ((two_k as f64 * ratio) as usize).clamp(1, two_k - 1);

    let new_addr = create_node(ctx, class, old.level)?;
    let mut twin = ctx.protect(&NodeLoader(class), new_addr)?;
    twin.children = old.children.split_off(nleft);
    twin.keys = old.keys[nleft..].to_vec();
    old.keys.truncate(nleft + 1);
    twin.left = Some(old_addr);
    twin.right = old.right;
    twin.mark_dirty();
    old.mark_dirty();

    if let Some(right) = old.right {
        let relinked = ctx
            .protect(&NodeLoader(class), right)
            .and_then(|mut sibling| {
                sibling.left = Some(new_addr);
                sibling.mark_dirty();
                ctx.unprotect(sibling)
            });
        if let Err(e) = relinked {
            return ctx.unprotect(twin).and(Err(e));
        }
    }
    old.right = Some(new_addr);

    debug!(
        old_addr,
        new_addr,
        level = old.level,
        nleft,
        nright = twin.nchildren(),
        insert_at = idx,
        "split B-tree node"
    );
    Ok(twin)
}

/// Insert `udata` into the tree rooted at `addr`.
///
/// The root never moves: when it splits, its contents are relocated to a
/// new address and a new root one level higher is built in its place.
pub fn insert<C: NodeClass>(
    ctx: &mut FileContext,
    class: &C,
    addr: u64,
    udata: &mut C::Udata,
) -> Result<()> {
    insert_root(ctx, class, addr, udata).map_err(|e| match e {
        e @ FormatError::CantInsert { .. } => e,
        e => FormatError::CantInsert {
            addr,
            source: Box::new(e),
        },
    })
}

fn insert_root<C: NodeClass>(
    ctx: &mut FileContext,
    class: &C,
    addr: u64,
    udata: &mut C::Udata,
) -> Result<()> {
    let loader = NodeLoader(class);
    let mut lt_key = C::Key::default();
    let mut rt_key = C::Key::default();
    let mut edges = EdgeKeys::new(&mut lt_key, &mut rt_key);
    let Some((md_key, child)) = insert_helper(ctx, class, addr, &mut edges, udata)? else {
        return Ok(());
    };
    let (lt_changed, rt_changed) = (edges.left_changed, edges.right_changed);

    let level = {
        let root = ctx.find(&loader, addr)?;
        if !lt_changed {
            lt_key = root.keys[0].clone();
        }
        root.level
    };
    {
        let twin = ctx.find(&loader, child)?;
        if !rt_changed {
            rt_key = twin.keys[twin.nchildren()].clone();
        }
    }
    let new_level = level
        .checked_add(1)
        .ok_or_else(|| FormatError::InvalidTree("tree depth exceeds 255 levels".into()))?;

    // Move the old root's contents to a fresh address.
    let old_root = ctx.alloc(AllocKind::BTree, node_size(class) as u64)?;
    ctx.find(&loader, addr)?;
    ctx.rename(CacheClassId::BTREE, addr, old_root)?;
    let mut moved = ctx.protect(&loader, old_root)?;
    moved.mark_dirty();
    ctx.unprotect(moved)?;

    let mut twin = ctx.protect(&loader, child)?;
    twin.left = Some(old_root);
    twin.mark_dirty();
    ctx.unprotect(twin)?;

    let mut root = BTreeNode::new(class.clone(), new_level);
    root.children = vec![old_root, child];
    root.keys = vec![lt_key, md_key, rt_key];
    ctx.insert(CacheClassId::BTREE, addr, root)?;
    debug!(addr, old_root, level = new_level, "root split");
    Ok(())
}

/// Insert below the node at `addr`. Returns the shared key and address of
/// a new right sibling when the node split.
fn insert_helper<C: NodeClass>(
    ctx: &mut FileContext,
    class: &C,
    addr: u64,
    edges: &mut EdgeKeys<'_, C::Key>,
    udata: &mut C::Udata,
) -> Result<Option<(C::Key, u64)>> {
    let mut node = ctx.protect(&NodeLoader(class), addr)?;
    let mut twin = None;
    let res = insert_into_node(ctx, class, addr, &mut node, &mut twin, edges, udata);
    let split = match twin {
        Some(twin) => {
            let md = twin.keys[0].clone();
            let twin_addr = twin.addr();
            ctx.unprotect(twin).map(|()| Some((md, twin_addr)))
        }
        None => Ok(None),
    };
    release(ctx, node, res)?;
    split
}

/// Outcome of the work done for one child of a node.
struct ChildOutcome<K> {
    op: Ins,
    new_child: Option<u64>,
    md: K,
    lt_changed: bool,
    rt_changed: bool,
}

/// Insert into child `idx`: recurse for internal nodes, call the class for
/// leaves.
fn insert_into_child<C: NodeClass>(
    ctx: &mut FileContext,
    class: &C,
    node: &mut BTreeNode<C>,
    idx: usize,
    udata: &mut C::Udata,
) -> Result<ChildOutcome<C::Key>> {
    let level = node.level;
    let child = node.children[idx];
    let (lo, hi) = key_pair(&mut node.keys, idx);
    let mut sub = EdgeKeys::new(lo, hi);
    let mut md = C::Key::default();
    let (op, new_child) = if level > 0 {
        match insert_helper(ctx, class, child, &mut sub, udata)? {
            Some((key, twin)) => {
                md = key;
                (Ins::Right, Some(twin))
            }
            None => (Ins::Noop, None),
        }
    } else {
        let r = class.leaf_insert(ctx, child, &mut sub, &mut md, udata)?;
        (r.op, r.new_child)
    };
    Ok(ChildOutcome {
        op,
        new_child,
        md,
        lt_changed: sub.left_changed,
        rt_changed: sub.right_changed,
    })
}

fn insert_into_node<C: NodeClass>(
    ctx: &mut FileContext,
    class: &C,
    addr: u64,
    node: &mut BTreeNode<C>,
    twin: &mut Option<Protected<BTreeNode<C>>>,
    edges: &mut EdgeKeys<'_, C::Key>,
    udata: &mut C::Udata,
) -> Result<()> {
    let n = node.nchildren();
    let (mut idx, cmp) = search(class, node, udata, Ordering::Less)?;
    trace!(addr, level = node.level, nchildren = n, idx, ?cmp, "insert");
    let at_min = cmp == Ordering::Less && idx == 0;
    let at_max = cmp == Ordering::Greater && idx + 1 >= n;

    let outcome = if n == 0 {
        // First child of an empty tree.
        node.keys.truncate(1);
        node.keys.push(C::Key::default());
        let (lo, hi) = key_pair(&mut node.keys, 0);
        let child = class.new_leaf(ctx, Ins::First, lo, udata, hi)?;
        node.children.push(child);
        node.mark_dirty();
        idx = 0;
        if class.follow_min() {
            insert_into_child(ctx, class, node, 0, udata)?
        } else {
            ChildOutcome {
                op: Ins::Noop,
                new_child: None,
                md: C::Key::default(),
                lt_changed: false,
                rt_changed: false,
            }
        }
    } else if at_min && (node.level > 0 || class.follow_min()) {
        idx = 0;
        insert_into_child(ctx, class, node, 0, udata)?
    } else if at_min {
        // New left-most leaf.
        idx = 0;
        let mut md = node.keys[0].clone();
        let child = class.new_leaf(ctx, Ins::Left, &mut node.keys[0], udata, &mut md)?;
        ChildOutcome {
            op: Ins::Left,
            new_child: Some(child),
            md,
            lt_changed: true,
            rt_changed: false,
        }
    } else if at_max && (node.level > 0 || class.follow_max()) {
        idx = n - 1;
        insert_into_child(ctx, class, node, idx, udata)?
    } else if at_max {
        // New right-most leaf.
        idx = n - 1;
        let mut md = node.keys[n].clone();
        let child = class.new_leaf(ctx, Ins::Right, &mut md, udata, &mut node.keys[n])?;
        ChildOutcome {
            op: Ins::Right,
            new_child: Some(child),
            md,
            lt_changed: false,
            rt_changed: true,
        }
    } else if cmp != Ordering::Equal {
        return Err(FormatError::KeyNotFound);
    } else {
        insert_into_child(ctx, class, node, idx, udata)?
    };

    if outcome.lt_changed {
        node.mark_dirty();
        if idx == 0 {
            *edges.left = node.keys[0].clone();
            edges.left_changed = true;
        }
    }
    if outcome.rt_changed {
        node.mark_dirty();
        if idx + 1 == node.nchildren() {
            *edges.right = node.keys[idx + 1].clone();
            edges.right_changed = true;
        }
    }

    match outcome.op {
        Ins::Noop => Ok(()),
        Ins::Change => {
            let child = outcome.new_child.ok_or_else(|| {
                FormatError::InvalidArgument("leaf reported a change without an address".into())
            })?;
            node.children[idx] = child;
            node.mark_dirty();
            Ok(())
        }
        Ins::Left | Ins::Right => {
            let child = outcome.new_child.ok_or_else(|| {
                FormatError::InvalidArgument("leaf reported a new child without an address".into())
            })?;
            if outcome.op == Ins::Right {
                idx += 1;
            }
            if node.nchildren() == 2 * class.k() {
                let new_twin = split(ctx, class, node, addr, idx).map_err(|e| {
                    FormatError::CantSplit {
                        addr,
                        source: Box::new(e),
                    }
                })?;
                let nleft = node.nchildren();
                let twin = twin.insert(new_twin);
                if idx <= nleft {
                    node.insert_child(idx, child, outcome.op, outcome.md);
                } else {
                    twin.insert_child(idx - nleft, child, outcome.op, outcome.md);
                }
            } else {
                node.insert_child(idx, child, outcome.op, outcome.md);
            }
            Ok(())
        }
        op @ (Ins::First | Ins::Remove) => Err(FormatError::InvalidArgument(format!(
            "unexpected {op:?} from leaf insert"
        ))),
    }
}

/// Remove `udata` from the tree rooted at `addr`.
///
/// Nodes are never merged; a node is freed only once its last child is
/// gone. An emptied root stays in place and drops back to level 0.
pub fn remove<C: NodeClass>(
    ctx: &mut FileContext,
    class: &C,
    addr: u64,
    udata: &mut C::Udata,
) -> Result<()> {
    let mut lt_key = C::Key::default();
    let mut rt_key = C::Key::default();
    let mut edges = EdgeKeys::new(&mut lt_key, &mut rt_key);
    remove_helper(ctx, class, addr, 0, &mut edges, udata)?;

    let mut root = ctx.protect(&NodeLoader(class), addr)?;
    if root.nchildren() == 0 && root.level != 0 {
        debug!(addr, "tree emptied; root reset to level 0");
        root.level = 0;
        root.mark_dirty();
    }
    ctx.unprotect(root)
}

fn remove_helper<C: NodeClass>(
    ctx: &mut FileContext,
    class: &C,
    addr: u64,
    depth: usize,
    edges: &mut EdgeKeys<'_, C::Key>,
    udata: &mut C::Udata,
) -> Result<Ins> {
    let mut node = ctx.protect(&NodeLoader(class), addr)?;
    match remove_from_node(ctx, class, addr, depth, &mut node, edges, udata) {
        Ok(Some(op)) => {
            ctx.unprotect(node)?;
            Ok(op)
        }
        Ok(None) => {
            ctx.discard(node);
            Ok(Ins::Remove)
        }
        Err(e) => ctx.unprotect(node).and(Err(e)),
    }
}

/// Returns `None` when the node itself was freed.
fn remove_from_node<C: NodeClass>(
    ctx: &mut FileContext,
    class: &C,
    addr: u64,
    depth: usize,
    node: &mut BTreeNode<C>,
    edges: &mut EdgeKeys<'_, C::Key>,
    udata: &mut C::Udata,
) -> Result<Option<Ins>> {
    let n = node.nchildren();
    let (idx, cmp) = search(class, node, udata, Ordering::Greater)?;
    if cmp != Ordering::Equal {
        return Err(FormatError::KeyNotFound);
    }
    trace!(addr, level = node.level, idx, "remove");

    let level = node.level;
    let child = node.children[idx];
    let (lo, hi) = key_pair(&mut node.keys, idx);
    let mut sub = EdgeKeys::new(lo, hi);
    let op = if level > 0 {
        remove_helper(ctx, class, child, depth + 1, &mut sub, udata)?
    } else {
        class.leaf_remove(ctx, child, &mut sub, udata)?
    };
    let (lt_changed, rt_changed) = (sub.left_changed, sub.right_changed);

    if lt_changed {
        node.mark_dirty();
        if idx == 0 {
            *edges.left = node.keys[0].clone();
            edges.left_changed = true;
            sync_left_sibling(ctx, class, node.left, &node.keys[0])?;
        }
    }
    if rt_changed {
        node.mark_dirty();
        if idx + 1 == n {
            *edges.right = node.keys[idx + 1].clone();
            edges.right_changed = true;
            sync_right_sibling(ctx, class, node)?;
        }
    }

    if op != Ins::Remove {
        return Ok(Some(Ins::Noop));
    }

    node.mark_dirty();
    if n == 1 {
        let upper = node.keys[1].clone();
        node.children.clear();
        node.keys.truncate(1);
        if depth == 0 {
            return Ok(Some(Ins::Remove));
        }
        if let Some(left) = node.left {
            // The left sibling takes over this node's key range.
            let mut sibling = ctx.protect(&NodeLoader(class), left)?;
            sibling.right = node.right;
            if let Some(last) = sibling.keys.last_mut() {
                *last = upper;
            }
            sibling.mark_dirty();
            ctx.unprotect(sibling)?;
        }
        if let Some(right) = node.right {
            let mut sibling = ctx.protect(&NodeLoader(class), right)?;
            sibling.left = node.left;
            sibling.mark_dirty();
            ctx.unprotect(sibling)?;
        }
        node.left = None;
        node.right = None;
        ctx.free(AllocKind::BTree, addr, node_size(class) as u64)?;
        debug!(addr, level, "freed empty B-tree node");
        return Ok(None);
    }

    if idx == 0 {
        node.keys.remove(0);
        node.children.remove(0);
        *edges.left = node.keys[0].clone();
        edges.left_changed = true;
        sync_left_sibling(ctx, class, node.left, &node.keys[0])?;
    } else if idx + 1 == n {
        node.children.pop();
        node.keys.pop();
        *edges.right = node.keys[n - 1].clone();
        edges.right_changed = true;
    } else {
        node.keys.remove(idx);
        node.children.remove(idx);
    }
    Ok(Some(Ins::Noop))
}

/// Copy a node's last key into its right sibling's first key after a leaf
/// moved its right key, so the sibling never keeps a key the leaf class
/// has already released.
fn sync_right_sibling<C: NodeClass>(
    ctx: &mut FileContext,
    class: &C,
    node: &BTreeNode<C>,
) -> Result<()> {
    let (Some(right), Some(last)) = (node.right, node.keys.last()) else {
        return Ok(());
    };
    let mut sibling = ctx.protect(&NodeLoader(class), right)?;
    if let Some(first) = sibling.keys.first_mut() {
        *first = last.clone();
        sibling.mark_dirty();
    }
    ctx.unprotect(sibling)
}

/// Stretch the left sibling's last key up to `key` after this node's first
/// key moved right, so no key range is left without a node.
fn sync_left_sibling<C: NodeClass>(
    ctx: &mut FileContext,
    class: &C,
    left: Option<u64>,
    key: &C::Key,
) -> Result<()> {
    let Some(left) = left else {
        return Ok(());
    };
    let mut sibling = ctx.protect(&NodeLoader(class), left)?;
    if let Some(last) = sibling.keys.last_mut() {
        *last = key.clone();
        sibling.mark_dirty();
    }
    ctx.unprotect(sibling)
}

/// Visit every leaf child in key order.
///
/// Node contents are copied out of the cache before the callback runs.
/// Returns `true` when the callback stopped the walk early.
pub fn iterate<C: NodeClass>(
    ctx: &mut FileContext,
    class: &C,
    addr: u64,
    udata: &mut C::Udata,
) -> Result<bool> {
    let loader = NodeLoader(class);
    let mut leftmost = addr;
    loop {
        let node = ctx.find(&loader, leftmost)?;
        match node.children.first() {
            Some(&child) if node.level > 0 => leftmost = child,
            _ => break,
        }
    }

    let mut next = Some(leftmost);
    while let Some(cur) = next {
        let (keys, children, right) = {
            let node = ctx.find(&loader, cur)?;
            (node.keys.clone(), node.children.clone(), node.right)
        };
        for (i, &child) in children.iter().enumerate() {
            if class
                .iterate_leaf(ctx, child, &keys[i], &keys[i + 1], udata)?
                .is_break()
            {
                return Ok(true);
            }
        }
        next = right;
    }
    Ok(false)
}

/// Summary produced by [`validate`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TreeShape {
    /// Number of levels, 1 for a lone root.
    pub depth: usize,
    /// Node count per level, root first.
    pub nodes_per_level: Vec<usize>,
    /// Children referenced by the leaf level.
    pub leaf_children: usize,
    /// Whether every pair of adjacent siblings shares its boundary key.
    /// Holds after inserts; removals may leave gaps.
    pub shared_boundaries: bool,
}

fn corrupt(msg: String) -> FormatError {
    FormatError::InvalidTree(msg)
}

/// Walk the whole tree and check its structure.
///
/// Levels must step down by one, sibling links must chain every node of a
/// level in order, keys must be non-decreasing within nodes, across
/// siblings and between parents and children.
pub fn validate<C: NodeClass>(ctx: &mut FileContext, class: &C, addr: u64) -> Result<TreeShape> {
    let loader = NodeLoader(class);
    let two_k = 2 * class.k();
    let root = ctx.find(&loader, addr)?.clone();
    if root.left.is_some() || root.right.is_some() {
        return Err(corrupt(format!("root {addr:#x} has siblings")));
    }

    let mut shape = TreeShape {
        shared_boundaries: true,
        ..TreeShape::default()
    };
    let mut expected = root.level;
    let mut nodes = vec![(addr, root)];
    loop {
        shape.nodes_per_level.push(nodes.len());
        for (i, (a, node)) in nodes.iter().enumerate() {
            if node.level != expected {
                return Err(corrupt(format!(
                    "node {a:#x} has level {}, expected {expected}",
                    node.level
                )));
            }
            if node.nchildren() > two_k || node.keys.len() != node.nchildren() + 1 {
                return Err(corrupt(format!(
                    "node {a:#x} holds {} children and {} keys",
                    node.nchildren(),
                    node.keys.len()
                )));
            }
            if node.nchildren() == 0 && (*a != addr || node.level != 0) {
                return Err(corrupt(format!("non-root node {a:#x} is empty")));
            }
            for w in node.keys.windows(2) {
                if class.cmp2(&w[0], &w[1])? == Ordering::Greater {
                    return Err(corrupt(format!("keys out of order in node {a:#x}")));
                }
            }

            let prev = i.checked_sub(1).map(|p| &nodes[p]);
            if node.left != prev.map(|(pa, _)| *pa) {
                return Err(corrupt(format!("bad left sibling link in node {a:#x}")));
            }
            if let Some((pa, p)) = prev {
                if p.right != Some(*a) {
                    return Err(corrupt(format!("bad right sibling link in node {pa:#x}")));
                }
                if let (Some(last), Some(first)) = (p.keys.last(), node.keys.first()) {
                    match class.cmp2(last, first)? {
                        Ordering::Greater => {
                            return Err(corrupt(format!(
                                "siblings {pa:#x} and {a:#x} overlap"
                            )));
                        }
                        Ordering::Less => shape.shared_boundaries = false,
                        Ordering::Equal => {}
                    }
                }
            }
        }
        if let Some((a, last)) = nodes.last() {
            if last.right.is_some() {
                return Err(corrupt(format!("last node {a:#x} has a right sibling")));
            }
        }

        if expected == 0 {
            shape.leaf_children = nodes.iter().map(|(_, n)| n.nchildren()).sum();
            break;
        }

        let mut below = Vec::new();
        for (a, node) in &nodes {
            for (j, &child_addr) in node.children.iter().enumerate() {
                let child = ctx.find(&loader, child_addr)?.clone();
                let first_ok = match child.keys.first() {
                    Some(first) => class.cmp2(&node.keys[j], first)? != Ordering::Greater,
                    None => false,
                };
                let last_ok = match child.keys.last() {
                    Some(last) => class.cmp2(last, &node.keys[j + 1])? != Ordering::Greater,
                    None => false,
                };
                if !first_ok || !last_ok {
                    return Err(corrupt(format!(
                        "child {child_addr:#x} keys escape parent {a:#x} range"
                    )));
                }
                below.push((child_addr, child));
            }
        }
        nodes = below;
        expected -= 1;
    }
    shape.depth = shape.nodes_per_level.len();
    Ok(shape)
}

/// Number of levels in the tree.
pub fn depth<C: NodeClass>(ctx: &mut FileContext, class: &C, addr: u64) -> Result<usize> {
    Ok(ctx.find(&NodeLoader(class), addr)?.level as usize + 1)
}

/// Number of nodes in the tree, root included.
pub fn node_count<C: NodeClass>(ctx: &mut FileContext, class: &C, addr: u64) -> Result<usize> {
    Ok(validate(ctx, class, addr)?.nodes_per_level.iter().sum())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FileConfig, SplitRatios};

    /// Integer keys; every leaf child is an 8-byte record holding a value.
    #[derive(Debug, Clone)]
    struct IntClass {
        k: usize,
    }

    #[derive(Debug, Default)]
    struct IntUdata {
        key: u64,
        value: u64,
        found: Option<u64>,
        visited: Vec<(u64, u64)>,
        stop_after: Option<usize>,
    }

    impl IntUdata {
        fn key(key: u64) -> Self {
            Self {
                key,
                value: key * 10,
                ..Self::default()
            }
        }
    }

    fn new_record(ctx: &mut FileContext, value: u64) -> Result<u64> {
        let addr = ctx.alloc(AllocKind::RawData, 8)?;
        ctx.write(addr, &value.to_le_bytes())?;
        Ok(addr)
    }

    impl NodeClass for IntClass {
        type Key = u64;
        type Udata = IntUdata;

        fn node_type(&self) -> u8 {
            9
        }
        fn k(&self) -> usize {
            self.k
        }
        fn sizeof_rkey(&self) -> usize {
            8
        }
        fn cmp2(&self, left: &u64, right: &u64) -> Result<Ordering> {
            Ok(left.cmp(right))
        }
        fn cmp3(&self, left: &u64, udata: &IntUdata, right: &u64) -> Result<Ordering> {
            Ok(if udata.key < *left {
                Ordering::Less
            } else if udata.key >= *right {
                Ordering::Greater
            } else {
                Ordering::Equal
            })
        }
        fn new_leaf(
            &self,
            ctx: &mut FileContext,
            op: Ins,
            left: &mut u64,
            udata: &mut IntUdata,
            right: &mut u64,
        ) -> Result<u64> {
            let addr = new_record(ctx, udata.value)?;
            *left = udata.key;
            if op != Ins::Left {
                *right = udata.key + 1;
            }
            Ok(addr)
        }
        fn leaf_found(
            &self,
            ctx: &mut FileContext,
            addr: u64,
            left: &u64,
            udata: &mut IntUdata,
        ) -> Result<bool> {
            if *left != udata.key {
                return Ok(false);
            }
            let mut buf = [0u8; 8];
            ctx.read(addr, &mut buf)?;
            udata.found = Some(u64::from_le_bytes(buf));
            Ok(true)
        }
        fn leaf_insert(
            &self,
            ctx: &mut FileContext,
            addr: u64,
            keys: &mut EdgeKeys<'_, u64>,
            md: &mut u64,
            udata: &mut IntUdata,
        ) -> Result<LeafInsert> {
            if *keys.left == udata.key {
                ctx.write(addr, &udata.value.to_le_bytes())?;
                return Ok(LeafInsert::noop());
            }
            *md = udata.key;
            Ok(LeafInsert::right(new_record(ctx, udata.value)?))
        }
        fn leaf_remove(
            &self,
            ctx: &mut FileContext,
            addr: u64,
            keys: &mut EdgeKeys<'_, u64>,
            udata: &mut IntUdata,
        ) -> Result<Ins> {
            if *keys.left != udata.key {
                return Err(FormatError::KeyNotFound);
            }
            ctx.free(AllocKind::RawData, addr, 8)?;
            Ok(Ins::Remove)
        }
        fn iterate_leaf(
            &self,
            ctx: &mut FileContext,
            addr: u64,
            left: &u64,
            _right: &u64,
            udata: &mut IntUdata,
        ) -> Result<ControlFlow<()>> {
            let mut buf = [0u8; 8];
            ctx.read(addr, &mut buf)?;
            udata.visited.push((*left, u64::from_le_bytes(buf)));
            Ok(match udata.stop_after {
                Some(n) if udata.visited.len() >= n => ControlFlow::Break(()),
                _ => ControlFlow::Continue(()),
            })
        }
        fn follow_min(&self) -> bool {
            false
        }
        fn follow_max(&self) -> bool {
            false
        }
        fn encode_key(&self, key: &u64, buf: &mut [u8]) -> Result<()> {
            write_u64(buf, 0, *key);
            Ok(())
        }
        fn decode_key(&self, buf: &[u8]) -> Result<u64> {
            read_u64(buf, 0)
        }
    }

    fn context(slots: usize) -> FileContext {
        FileContext::memory(FileConfig::new().cache_slots(slots)).unwrap()
    }

    fn insert_all(ctx: &mut FileContext, class: &IntClass, root: u64, keys: &[u64]) {
        for &k in keys {
            insert(ctx, class, root, &mut IntUdata::key(k)).unwrap();
        }
    }

    fn lookup(ctx: &mut FileContext, class: &IntClass, root: u64, key: u64) -> Result<u64> {
        let mut udata = IntUdata::key(key);
        find(ctx, class, root, &mut udata)?;
        Ok(udata.found.unwrap_or(u64::MAX))
    }

    fn visit(ctx: &mut FileContext, class: &IntClass, root: u64) -> Vec<u64> {
        let mut udata = IntUdata::default();
        iterate(ctx, class, root, &mut udata).unwrap();
        udata.visited.into_iter().map(|(k, _)| k).collect()
    }

    #[test]
    fn node_codec_round_trip() {
        let class = IntClass { k: 2 };
        let mut node = BTreeNode::new(class.clone(), 1);
        node.left = Some(0x100);
        node.children = vec![0x10, 0x20];
        node.keys = vec![1, 5, 9];
        let buf = node.encode().unwrap();
        assert_eq!(buf.len(), node_size(&class));
        assert_eq!(&buf[0..4], b"TREE");
        assert_eq!(buf[4], 9);
        assert_eq!(buf[5], 1);
        // Undefined right sibling is all ones.
        assert_eq!(&buf[16..24], &[0xFF; 8]);

        let back = BTreeNode::decode(class, &buf).unwrap();
        assert_eq!(back.level, 1);
        assert_eq!(back.left, Some(0x100));
        assert_eq!(back.right, None);
        assert_eq!(back.keys, vec![1, 5, 9]);
        assert_eq!(back.children, vec![0x10, 0x20]);
        assert!(!back.is_dirty());
    }

    #[test]
    fn decode_rejects_bad_headers() {
        let class = IntClass { k: 2 };
        let mut buf = BTreeNode::new(class.clone(), 0).encode().unwrap();
        buf[4] = 1;
        assert!(matches!(
            BTreeNode::decode(class.clone(), &buf),
            Err(FormatError::InvalidNodeType {
                expected: 9,
                found: 1
            })
        ));
        buf[0] = b'X';
        assert!(matches!(
            BTreeNode::decode(class.clone(), &buf),
            Err(FormatError::InvalidBTreeSignature)
        ));
        assert!(matches!(
            BTreeNode::decode(class, &buf[..10]),
            Err(FormatError::UnexpectedEof { .. })
        ));
    }

    #[test]
    fn empty_tree() {
        let mut ctx = context(64);
        let class = IntClass { k: 2 };
        let root = create(&mut ctx, &class).unwrap();
        assert!(lookup(&mut ctx, &class, root, 3).unwrap_err().is_not_found());
        assert!(visit(&mut ctx, &class, root).is_empty());
        let shape = validate(&mut ctx, &class, root).unwrap();
        assert_eq!(shape.depth, 1);
        assert_eq!(shape.leaf_children, 0);
    }

    #[test]
    fn sequential_inserts_split_root() {
        let mut ctx = context(64);
        let class = IntClass { k: 2 };
        let root = create(&mut ctx, &class).unwrap();
        insert_all(&mut ctx, &class, root, &[0, 1, 2, 3, 4]);

        assert_eq!(depth(&mut ctx, &class, root).unwrap(), 2);
        assert_eq!(visit(&mut ctx, &class, root), vec![0, 1, 2, 3, 4]);
        assert_eq!(lookup(&mut ctx, &class, root, 2).unwrap(), 20);

        let shape = validate(&mut ctx, &class, root).unwrap();
        assert_eq!(shape.nodes_per_level, vec![1, 2]);
        assert!(shape.shared_boundaries);

        // The right-most split keeps 3 of 4 children on the left.
        let (left, right) = {
            let r = ctx.find(&NodeLoader(&class), root).unwrap();
            assert_eq!(r.keys, vec![0, 3, 5]);
            (r.children[0], r.children[1])
        };
        let l = ctx.find(&NodeLoader(&class), left).unwrap().clone();
        assert_eq!(l.keys, vec![0, 1, 2, 3]);
        assert_eq!(l.right, Some(right));
        let r = ctx.find(&NodeLoader(&class), right).unwrap().clone();
        assert_eq!(r.keys, vec![3, 4, 5]);
        assert_eq!(r.left, Some(left));
    }

    #[test]
    fn many_inserts_any_order() {
        let mut ctx = context(7);
        let class = IntClass { k: 2 };
        let root = create(&mut ctx, &class).unwrap();
        let keys: Vec<u64> = (0..200).map(|i| (i * 37) % 200).collect();
        insert_all(&mut ctx, &class, root, &keys);

        assert_eq!(visit(&mut ctx, &class, root), (0..200).collect::<Vec<_>>());
        for k in 0..200 {
            assert_eq!(lookup(&mut ctx, &class, root, k).unwrap(), k * 10);
        }
        assert!(lookup(&mut ctx, &class, root, 500).unwrap_err().is_not_found());
        let shape = validate(&mut ctx, &class, root).unwrap();
        assert_eq!(shape.leaf_children, 200);
        assert!(shape.depth >= 3);
        assert!(shape.shared_boundaries);
    }

    #[test]
    fn descending_inserts_grow_left() {
        let mut ctx = context(31);
        let class = IntClass { k: 2 };
        let root = create(&mut ctx, &class).unwrap();
        let keys: Vec<u64> = (0..40).rev().collect();
        insert_all(&mut ctx, &class, root, &keys);
        assert_eq!(visit(&mut ctx, &class, root), (0..40).collect::<Vec<_>>());
        validate(&mut ctx, &class, root).unwrap();
    }

    #[test]
    fn even_split_ratios() {
        let mut ctx =
            FileContext::memory(FileConfig::new().split_ratios(SplitRatios::even())).unwrap();
        let class = IntClass { k: 3 };
        let root = create(&mut ctx, &class).unwrap();
        insert_all(&mut ctx, &class, root, &(0..7).collect::<Vec<_>>());
        let shape = validate(&mut ctx, &class, root).unwrap();
        assert_eq!(shape.nodes_per_level, vec![1, 2]);
        let r = ctx.find(&NodeLoader(&class), root).unwrap().clone();
        let l = ctx.find(&NodeLoader(&class), r.children[0]).unwrap();
        assert_eq!(l.nchildren(), 3);
    }

    #[test]
    fn reinsert_updates_in_place() {
        let mut ctx = context(64);
        let class = IntClass { k: 2 };
        let root = create(&mut ctx, &class).unwrap();
        insert_all(&mut ctx, &class, root, &[1, 2, 3]);
        let mut udata = IntUdata::key(2);
        udata.value = 777;
        insert(&mut ctx, &class, root, &mut udata).unwrap();
        assert_eq!(lookup(&mut ctx, &class, root, 2).unwrap(), 777);
        assert_eq!(visit(&mut ctx, &class, root), vec![1, 2, 3]);
    }

    #[test]
    fn remove_cases() {
        let mut ctx = context(64);
        let class = IntClass { k: 2 };
        let root = create(&mut ctx, &class).unwrap();
        insert_all(&mut ctx, &class, root, &(0..10).collect::<Vec<_>>());

        // Interior, left-most and right-most children.
        for k in [5, 0, 9] {
            remove(&mut ctx, &class, root, &mut IntUdata::key(k)).unwrap();
            assert!(lookup(&mut ctx, &class, root, k).unwrap_err().is_not_found());
        }
        assert_eq!(visit(&mut ctx, &class, root), vec![1, 2, 3, 4, 6, 7, 8]);
        validate(&mut ctx, &class, root).unwrap();

        let err = remove(&mut ctx, &class, root, &mut IntUdata::key(42)).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn remove_everything_frees_nodes() {
        let mut ctx = context(64);
        let class = IntClass { k: 2 };
        let root = create(&mut ctx, &class).unwrap();
        let keys: Vec<u64> = (0..30).collect();
        insert_all(&mut ctx, &class, root, &keys);
        assert!(depth(&mut ctx, &class, root).unwrap() > 1);

        for &k in &keys {
            remove(&mut ctx, &class, root, &mut IntUdata::key(k)).unwrap();
            let shape = validate(&mut ctx, &class, root).unwrap();
            assert_eq!(shape.leaf_children, (29 - k) as usize);
        }
        assert_eq!(depth(&mut ctx, &class, root).unwrap(), 1);
        assert_eq!(node_count(&mut ctx, &class, root).unwrap(), 1);
        assert!(visit(&mut ctx, &class, root).is_empty());
        assert_eq!(ctx.cache().nprotected(), 0);

        // The emptied tree accepts new keys again.
        insert_all(&mut ctx, &class, root, &[7, 3]);
        assert_eq!(visit(&mut ctx, &class, root), vec![3, 7]);
    }

    #[test]
    fn reinsert_into_emptied_ranges() {
        let mut ctx = context(64);
        let class = IntClass { k: 2 };
        let root = create(&mut ctx, &class).unwrap();
        let keys: Vec<u64> = (0..40).collect();
        insert_all(&mut ctx, &class, root, &keys);

        let gone: Vec<u64> = keys.iter().copied().filter(|k| k % 3 != 1).collect();
        for &k in &gone {
            remove(&mut ctx, &class, root, &mut IntUdata::key(k)).unwrap();
            validate(&mut ctx, &class, root).unwrap();
        }
        for &k in gone.iter().rev() {
            insert(&mut ctx, &class, root, &mut IntUdata::key(k)).unwrap();
        }
        validate(&mut ctx, &class, root).unwrap();
        for &k in &keys {
            assert_eq!(lookup(&mut ctx, &class, root, k).unwrap(), k * 10);
        }
        let visited: Vec<u64> = visit(&mut ctx, &class, root);
        assert_eq!(visited, keys);
    }

    #[test]
    fn iterate_stops_early() {
        let mut ctx = context(64);
        let class = IntClass { k: 2 };
        let root = create(&mut ctx, &class).unwrap();
        insert_all(&mut ctx, &class, root, &(0..12).collect::<Vec<_>>());
        let mut udata = IntUdata {
            stop_after: Some(5),
            ..IntUdata::default()
        };
        assert!(iterate(&mut ctx, &class, root, &mut udata).unwrap());
        assert_eq!(udata.visited.len(), 5);
        assert_eq!(udata.visited[4], (4, 40));
    }

    #[test]
    fn survives_flush_and_reload() {
        let mut ctx = context(3);
        let class = IntClass { k: 2 };
        let root = create(&mut ctx, &class).unwrap();
        insert_all(&mut ctx, &class, root, &(0..50).collect::<Vec<_>>());
        ctx.flush_cache(true).unwrap();
        assert_eq!(ctx.cache().occupied(), 0);
        assert_eq!(visit(&mut ctx, &class, root), (0..50).collect::<Vec<_>>());
        assert_eq!(lookup(&mut ctx, &class, root, 33).unwrap(), 330);
        assert_eq!(ctx.cache().nprotected(), 0);
    }

    #[test]
    fn wrong_class_is_rejected() {
        let mut ctx = context(64);
        let class = IntClass { k: 2 };
        let root = create(&mut ctx, &class).unwrap();
        ctx.flush_cache(true).unwrap();
        let other = IntClass { k: 3 };
        // Node size differs, so the decode fails on the short read or type.
        assert!(lookup(&mut ctx, &other, root, 1).is_err());
    }
}
