//! V1 groups: a group B-tree of symbol table nodes over a local heap.

use std::cell::RefCell;
use std::rc::Rc;

use tracing::debug;

use crate::btree_v1::{self, TreeShape};
use crate::error::{FormatError, Result};
use crate::file::FileContext;
use crate::local_heap::LocalHeap;
use crate::symbol_table::{GroupNodeClass, GroupUdata, SymbolTableEntry};

/// A resolved group entry (child name + object header address).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupEntry {
    /// Name of the child object.
    pub name: String,
    /// Address of the child's object header.
    pub object_header_address: u64,
    /// Cache type from the symbol table entry.
    pub cache_type: u32,
}

/// An open v1 group.
///
/// The heap is written back by [`Group::flush`]; B-tree and symbol nodes
/// go through the metadata cache.
#[derive(Debug)]
pub struct Group {
    class: GroupNodeClass,
    btree_addr: u64,
}

impl Group {
    /// Create an empty group with a heap of at least `heap_size_hint`
    /// bytes.
    pub fn create(ctx: &mut FileContext, heap_size_hint: usize) -> Result<Self> {
        let heap = LocalHeap::create(ctx, heap_size_hint)?;
        let class = Self::class_for(ctx, heap);
        let btree_addr = btree_v1::create(ctx, &class)?;
        debug!(btree_addr, heap = class.heap().borrow().addr(), "created group");
        Ok(Self { class, btree_addr })
    }

    /// Open a group from its B-tree and heap addresses.
    pub fn open(ctx: &mut FileContext, btree_addr: u64, heap_addr: u64) -> Result<Self> {
        let heap = LocalHeap::open(ctx, heap_addr)?;
        let class = Self::class_for(ctx, heap);
        Ok(Self { class, btree_addr })
    }

    fn class_for(ctx: &FileContext, heap: LocalHeap) -> GroupNodeClass {
        let config = ctx.config();
        GroupNodeClass::new(
            Rc::new(RefCell::new(heap)),
            config.group_btree_k,
            config.sym_leaf_k,
        )
    }

    pub fn btree_addr(&self) -> u64 {
        self.btree_addr
    }

    pub fn heap_addr(&self) -> u64 {
        self.class.heap().borrow().addr()
    }

    /// Add a link. The entry's name offset is assigned here.
    pub fn insert(&self, ctx: &mut FileContext, name: &str, entry: SymbolTableEntry) -> Result<()> {
        if name.is_empty() || name.contains('\0') {
            return Err(FormatError::InvalidArgument(format!(
                "invalid link name {name:?}"
            )));
        }
        let mut udata = GroupUdata {
            name: name.to_owned(),
            entry,
            ..GroupUdata::default()
        };
        btree_v1::insert(ctx, &self.class, self.btree_addr, &mut udata)
    }

    /// The entry stored under `name`, or `KeyNotFound`.
    pub fn lookup(&self, ctx: &mut FileContext, name: &str) -> Result<SymbolTableEntry> {
        let mut udata = GroupUdata::named(name);
        btree_v1::find(ctx, &self.class, self.btree_addr, &mut udata)?;
        Ok(udata.entry)
    }

    pub fn contains(&self, ctx: &mut FileContext, name: &str) -> Result<bool> {
        match self.lookup(ctx, name) {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Remove a link and return its entry.
    pub fn remove(&self, ctx: &mut FileContext, name: &str) -> Result<SymbolTableEntry> {
        let mut udata = GroupUdata::named(name);
        btree_v1::remove(ctx, &self.class, self.btree_addr, &mut udata)?;
        Ok(udata.entry)
    }

    /// Every member, sorted by name.
    pub fn entries(&self, ctx: &mut FileContext) -> Result<Vec<GroupEntry>> {
        let mut udata = GroupUdata::default();
        btree_v1::iterate(ctx, &self.class, self.btree_addr, &mut udata)?;
        Ok(udata
            .listing
            .into_iter()
            .map(|(name, entry)| GroupEntry {
                name,
                object_header_address: entry.object_header_address,
                cache_type: entry.cache_type,
            })
            .collect())
    }

    pub fn names(&self, ctx: &mut FileContext) -> Result<Vec<String>> {
        Ok(self.entries(ctx)?.into_iter().map(|e| e.name).collect())
    }

    pub fn validate(&self, ctx: &mut FileContext) -> Result<TreeShape> {
        btree_v1::validate(ctx, &self.class, self.btree_addr)
    }

    /// Write the heap back. Tree nodes are flushed with the cache.
    pub fn flush(&self, ctx: &mut FileContext) -> Result<()> {
        self.class.heap().borrow_mut().flush(ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FileConfig;

    fn context() -> FileContext {
        FileContext::memory(FileConfig::new().group_btree_k(2).sym_leaf_k(2).cache_slots(31))
            .unwrap()
    }

    fn name(i: usize) -> String {
        format!("member_{i:03}")
    }

    #[test]
    fn empty_group() {
        let mut ctx = context();
        let group = Group::create(&mut ctx, 32).unwrap();
        assert!(group.names(&mut ctx).unwrap().is_empty());
        let err = group.lookup(&mut ctx, "missing").unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn insert_lookup_sorted_listing() {
        let mut ctx = context();
        let group = Group::create(&mut ctx, 32).unwrap();
        // Scrambled order forces symbol node and B-tree splits.
        let order: Vec<usize> = (0..40).map(|i| (i * 17) % 40).collect();
        for &i in &order {
            group
                .insert(&mut ctx, &name(i), SymbolTableEntry::new(0x1000 + i as u64))
                .unwrap();
        }
        for i in 0..40 {
            let entry = group.lookup(&mut ctx, &name(i)).unwrap();
            assert_eq!(entry.object_header_address, 0x1000 + i as u64);
        }
        let names = group.names(&mut ctx).unwrap();
        let expected: Vec<String> = (0..40).map(name).collect();
        assert_eq!(names, expected);

        let shape = group.validate(&mut ctx).unwrap();
        assert!(shape.depth >= 2);
        assert!(shape.shared_boundaries);
    }

    #[test]
    fn duplicates_and_bad_names_rejected() {
        let mut ctx = context();
        let group = Group::create(&mut ctx, 32).unwrap();
        group.insert(&mut ctx, "a", SymbolTableEntry::new(1)).unwrap();
        let err = group.insert(&mut ctx, "a", SymbolTableEntry::new(2)).unwrap_err();
        assert!(matches!(err.root_cause(), FormatError::DuplicateName(n) if n == "a"));
        assert!(group.insert(&mut ctx, "", SymbolTableEntry::new(3)).is_err());
        assert_eq!(group.lookup(&mut ctx, "a").unwrap().object_header_address, 1);
    }

    #[test]
    fn remove_members() {
        let mut ctx = context();
        let group = Group::create(&mut ctx, 32).unwrap();
        for i in 0..20 {
            group.insert(&mut ctx, &name(i), SymbolTableEntry::new(i as u64)).unwrap();
        }
        for i in (0..20).filter(|i| i % 3 == 0) {
            let removed = group.remove(&mut ctx, &name(i)).unwrap();
            assert_eq!(removed.object_header_address, i as u64);
        }
        for i in 0..20 {
            assert_eq!(group.contains(&mut ctx, &name(i)).unwrap(), i % 3 != 0);
        }
        assert!(group.remove(&mut ctx, &name(0)).unwrap_err().is_not_found());

        for i in (0..20).filter(|i| i % 3 != 0) {
            group.remove(&mut ctx, &name(i)).unwrap();
        }
        assert!(group.names(&mut ctx).unwrap().is_empty());
        group.insert(&mut ctx, "again", SymbolTableEntry::new(7)).unwrap();
        assert_eq!(group.names(&mut ctx).unwrap(), vec!["again".to_string()]);
    }

    #[test]
    fn reopen_after_flush() {
        let mut ctx = context();
        let group = Group::create(&mut ctx, 16).unwrap();
        for i in 0..12 {
            group.insert(&mut ctx, &name(i), SymbolTableEntry::new(i as u64)).unwrap();
        }
        group.flush(&mut ctx).unwrap();
        ctx.flush_cache(true).unwrap();

        let reopened = Group::open(&mut ctx, group.btree_addr(), group.heap_addr()).unwrap();
        let entries = reopened.entries(&mut ctx).unwrap();
        assert_eq!(entries.len(), 12);
        assert_eq!(entries[5].name, name(5));
        assert_eq!(entries[5].object_header_address, 5);
    }
}
