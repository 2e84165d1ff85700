//! Indexed string attributes.
//!
//! A [`FieldSearchKey`] is a string attribute whose records are also kept in
//! a [`FieldSearchIndex`] - a shared b-tree over every record type that
//! declares a key in that index. The index orders entries by key content
//! (then by record address, which makes every entry unique while keeping
//! duplicate keys adjacent), so one lookup finds all records with a given
//! name regardless of their type.

use std::sync::{Arc, OnceLock};

use super::rel;
use crate::{
    graph::{Graph, GraphError},
    heap::{
        ptr::{Ptr, Void},
        store::Storage,
    },
    index::BTree,
    log::Tag,
};

/// a shared b-tree of search keys, rooted in one of the heap's named index
/// root slots. created once at startup via
/// [`crate::schema::SchemaRegistry::create_index`].
#[derive(Clone)]
pub struct FieldSearchIndex(Arc<IndexInner>);

struct IndexInner {
    name: Arc<str>,
    slot: u32,
    /// every key field feeding this index must sit at the same offset in
    /// its record so the tree can read keys without knowing record types.
    key_offset: OnceLock<u32>,
}

impl FieldSearchIndex {
    pub(crate) fn new(name: &str, slot: u32) -> Self {
        Self(Arc::new(IndexInner {
            name: name.into(),
            slot,
            key_offset: OnceLock::new(),
        }))
    }

    pub fn name(&self) -> &str {
        &self.0.name
    }

    pub(crate) fn bind_key(&self, owner: &str, field: &str, offset: u32) {
        if self.0.key_offset.set(offset).is_err() {
            let existing = *self.0.key_offset.get().expect("observed as already bound");
            assert_eq!(
                existing, offset,
                "search key {owner}.{field} sits at offset {offset}, but index {} \
                 already holds keys at offset {existing}; every key field feeding \
                 one index must share an offset",
                self.0.name,
            );
        }
    }

    pub(crate) fn btree(&self) -> BTree {
        let key_offset = *self.0.key_offset.get().unwrap_or_else(|| {
            panic!(
                "search index {} used before any key field was bound to it",
                self.0.name
            )
        });
        BTree::new(self.0.slot, key_offset)
    }

    /// every record whose key equals `key`, in address order within the
    /// duplicate run.
    pub fn find_all<S: Storage>(
        &self,
        g: &mut Graph<S>,
        key: &str,
    ) -> Result<Vec<Ptr<Void>>, GraphError<S::Error>> {
        self.btree().find_all(g, key)
    }
}

/// an interned string attribute that is also an entry in a shared
/// [`FieldSearchIndex`].
#[derive(Clone)]
pub struct FieldSearchKey(Arc<KeyInner>);

struct KeyInner {
    offset: u32,
    index: FieldSearchIndex,
    put_tag: Tag,
    remove_tag: Tag,
    destruct_tag: Tag,
}

impl FieldSearchKey {
    pub(crate) fn new(
        owner: &Arc<str>,
        name: &str,
        offset: u32,
        index: FieldSearchIndex,
    ) -> Self {
        index.bind_key(owner, name, offset);
        Self(Arc::new(KeyInner {
            offset,
            index,
            put_tag: Tag::new(format!("put {owner}.{name}")),
            remove_tag: Tag::new(format!("unindex {owner}.{name}")),
            destruct_tag: Tag::new(format!("destruct {owner}.{name}")),
        }))
    }

    pub fn index(&self) -> &FieldSearchIndex {
        &self.0.index
    }

    pub fn get<S: Storage>(
        &self,
        g: &mut Graph<S>,
        at: Ptr<Void>,
    ) -> Result<String, GraphError<S::Error>> {
        let stored = g.heap.get_ptr(rel(at, self.0.offset))?;
        if stored.is_null() {
            Ok(String::new())
        } else {
            Ok(g.heap.get_string(stored)?)
        }
    }

    /// true while the record at `at` has an entry in the index.
    pub fn is_in_index<S: Storage>(
        &self,
        g: &mut Graph<S>,
        at: Ptr<Void>,
    ) -> Result<bool, GraphError<S::Error>> {
        Ok(!g.heap.get_ptr(rel(at, self.0.offset))?.is_null())
    }

    /// store `key` and (re-)index the record under it. storing the current
    /// key is a no-op; storing a different key removes the old entry first
    /// so the record appears in the index exactly once.
    pub fn put<S: Storage>(
        &self,
        g: &mut Graph<S>,
        at: Ptr<Void>,
        key: &str,
    ) -> Result<(), GraphError<S::Error>> {
        let old = g.heap.get_ptr(rel(at, self.0.offset))?;
        if !old.is_null() && g.heap.string_eq(old, key)? {
            return Ok(());
        }
        g.log.start(&self.0.put_tag, at.addr);
        let res = self.put_inner(g, at, old, key);
        g.log.end();
        res
    }

    fn put_inner<S: Storage>(
        &self,
        g: &mut Graph<S>,
        at: Ptr<Void>,
        old: Ptr<Void>,
        key: &str,
    ) -> Result<(), GraphError<S::Error>> {
        let tree = self.0.index.btree();
        if !old.is_null() {
            // the tree compares by stored key content, so the entry must go
            // before the string does
            tree.delete(g, at)?;
            g.heap.free_string(old)?;
            g.heap.put_ptr(rel(at, self.0.offset), Ptr::null())?;
        }
        let interned = g.heap.new_string(key)?;
        g.heap.put_ptr(rel(at, self.0.offset), interned)?;
        tree.insert(g, at)?;
        Ok(())
    }

    /// drop the record's index entry and key string, as if the key had
    /// never been stored. idempotent.
    pub fn remove_from_index<S: Storage>(
        &self,
        g: &mut Graph<S>,
        at: Ptr<Void>,
    ) -> Result<(), GraphError<S::Error>> {
        let old = g.heap.get_ptr(rel(at, self.0.offset))?;
        if old.is_null() {
            return Ok(());
        }
        g.log.start(&self.0.remove_tag, at.addr);
        let res = self.remove_inner(g, at, old);
        g.log.end();
        res
    }

    fn remove_inner<S: Storage>(
        &self,
        g: &mut Graph<S>,
        at: Ptr<Void>,
        old: Ptr<Void>,
    ) -> Result<(), GraphError<S::Error>> {
        self.0.index.btree().delete(g, at)?;
        g.heap.free_string(old)?;
        g.heap.put_ptr(rel(at, self.0.offset), Ptr::null())?;
        Ok(())
    }

    /// invoked by the deletion scheduler. the entry leaves the tree before
    /// the key string is freed, so the tree never compares freed memory.
    pub fn destruct<S: Storage>(
        &self,
        g: &mut Graph<S>,
        at: Ptr<Void>,
    ) -> Result<(), GraphError<S::Error>> {
        let old = g.heap.get_ptr(rel(at, self.0.offset))?;
        if old.is_null() {
            return Ok(());
        }
        g.log.start(&self.0.destruct_tag, at.addr);
        let res = self.remove_inner(g, at, old);
        g.log.end();
        res
    }
}
