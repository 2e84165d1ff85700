//! The "many" side of a bidirectional relationship: a variable-length list
//! of referrer addresses, stored as a single growable block on the heap.
//!
//! Block layout: `capacity: u32, count: u32, entries: [u64; capacity]`.
//! The record's field itself is one pointer to the block (null while the
//! list is empty). Removal swap-compacts: the last entry moves into the
//! freed slot, and the moved record's stored backpointer index is patched
//! through the bound forward field so its entry stays findable.

use std::sync::{Arc, OnceLock};

use super::{many_to_one::FieldManyToOne, rel};
use crate::{
    graph::{Graph, GraphError},
    heap::{
        ptr::{Ptr, Void},
        store::Storage,
    },
    log::Tag,
};

/// entries the first block allocation holds.
const INITIAL_CAPACITY: u32 = 4;

const CAPACITY_OFFSET: u64 = 0;
const COUNT_OFFSET: u64 = 4;
const ENTRIES_OFFSET: u64 = 8;

fn entry_at(block: Ptr<Void>, index: u32) -> Ptr<Void> {
    block.offset(ENTRIES_OFFSET + index as u64 * 8)
}

fn block_size(capacity: u32) -> u64 {
    ENTRIES_OFFSET + capacity as u64 * 8
}

/// backpointer list field. bound to exactly one [`FieldManyToOne`] at
/// schema-build time; binding to a second forward field is a schema error.
#[derive(Clone)]
pub struct FieldOneToMany(Arc<OneToManyInner>);

struct OneToManyInner {
    owner: Arc<str>,
    name: Arc<str>,
    offset: u32,
    forward: OnceLock<FieldManyToOne>,
    destruct_tag: Tag,
}

impl FieldOneToMany {
    pub(crate) fn new(owner: &Arc<str>, name: &str, offset: u32) -> Self {
        Self(Arc::new(OneToManyInner {
            owner: owner.clone(),
            name: name.into(),
            offset,
            forward: OnceLock::new(),
            destruct_tag: Tag::new(format!("destruct {owner}.{name}")),
        }))
    }

    pub(crate) fn qualified_name(&self) -> String {
        format!("{}.{}", self.0.owner, self.0.name)
    }

    /// bind this backpointer field to its forward field. binding the same
    /// pair twice is idempotent; binding to a different field is a fatal
    /// schema error.
    pub(crate) fn bind(&self, forward: FieldManyToOne) {
        let candidate = forward.clone();
        if self.0.forward.set(forward).is_err() {
            let existing = self.0.forward.get().expect("observed as already bound");
            assert!(
                existing.is_same_field(&candidate),
                "backpointer field {} is already bound to forward field {} (attempted rebind to {})",
                self.qualified_name(),
                existing.qualified_name(),
                candidate.qualified_name(),
            );
        }
    }

    fn forward(&self) -> &FieldManyToOne {
        self.0.forward.get().unwrap_or_else(|| {
            panic!(
                "backpointer field {} used before a forward field was bound",
                self.qualified_name()
            )
        })
    }

    /// every referrer currently pointing at the record at `at`.
    pub fn get<S: Storage>(
        &self,
        g: &mut Graph<S>,
        at: Ptr<Void>,
    ) -> Result<Vec<Ptr<Void>>, GraphError<S::Error>> {
        let block = g.heap.get_ptr(rel(at, self.0.offset))?;
        if block.is_null() {
            return Ok(vec![]);
        }
        let count = g.heap.get_u32(block.offset(COUNT_OFFSET))?;
        let mut out = Vec::with_capacity(count as usize);
        for i in 0..count {
            out.push(Ptr::with(g.heap.get_u64(entry_at(block, i))?));
        }
        Ok(out)
    }

    pub fn size<S: Storage>(
        &self,
        g: &mut Graph<S>,
        at: Ptr<Void>,
    ) -> Result<u32, GraphError<S::Error>> {
        let block = g.heap.get_ptr(rel(at, self.0.offset))?;
        if block.is_null() {
            return Ok(0);
        }
        Ok(g.heap.get_u32(block.offset(COUNT_OFFSET))?)
    }

    pub fn is_empty<S: Storage>(
        &self,
        g: &mut Graph<S>,
        at: Ptr<Void>,
    ) -> Result<bool, GraphError<S::Error>> {
        Ok(self.size(g, at)? == 0)
    }

    /// append `referrer` to the list of the record at `at`, growing the
    /// block if needed. returns the index the entry landed at.
    pub(crate) fn add<S: Storage>(
        &self,
        g: &mut Graph<S>,
        at: Ptr<Void>,
        referrer: Ptr<Void>,
    ) -> Result<u32, GraphError<S::Error>> {
        let slot = rel(at, self.0.offset);
        let head = g.heap.get_ptr(slot)?;
        if head.is_null() {
            let block = g.heap.alloc(block_size(INITIAL_CAPACITY))?;
            g.heap.put_u32(block.offset(CAPACITY_OFFSET), INITIAL_CAPACITY)?;
            g.heap.put_u32(block.offset(COUNT_OFFSET), 1)?;
            g.heap.put_u64(entry_at(block, 0), referrer.addr)?;
            g.heap.put_ptr(slot, block)?;
            return Ok(0);
        }
        let capacity = g.heap.get_u32(head.offset(CAPACITY_OFFSET))?;
        let count = g.heap.get_u32(head.offset(COUNT_OFFSET))?;
        let head = if count == capacity {
            // full: double into a fresh block and retire the old one
            let grown = capacity * 2;
            let block = g.heap.alloc(block_size(grown))?;
            g.heap.put_u32(block.offset(CAPACITY_OFFSET), grown)?;
            g.heap.put_u32(block.offset(COUNT_OFFSET), count)?;
            for i in 0..count {
                let entry = g.heap.get_u64(entry_at(head, i))?;
                g.heap.put_u64(entry_at(block, i), entry)?;
            }
            g.heap.free(head)?;
            g.heap.put_ptr(slot, block)?;
            block
        } else {
            head
        };
        g.heap.put_u64(entry_at(head, count), referrer.addr)?;
        g.heap.put_u32(head.offset(COUNT_OFFSET), count + 1)?;
        Ok(count)
    }

    /// remove the entry at `index` by swapping the last entry into its
    /// place. the moved record's stored backpointer index is patched so the
    /// forward/backward invariant holds afterwards.
    pub(crate) fn remove<S: Storage>(
        &self,
        g: &mut Graph<S>,
        at: Ptr<Void>,
        index: u32,
    ) -> Result<(), GraphError<S::Error>> {
        let slot = rel(at, self.0.offset);
        let head = g.heap.get_ptr(slot)?;
        if head.is_null() {
            return Err(GraphError::Corrupt(
                g.describe_problem()
                    .field(&self.0.owner, &self.0.name)
                    .addr("record", at)
                    .build("backpointer list missing during detach"),
            ));
        }
        let count = g.heap.get_u32(head.offset(COUNT_OFFSET))?;
        if index >= count {
            return Err(GraphError::Corrupt(
                g.describe_problem()
                    .field(&self.0.owner, &self.0.name)
                    .addr("record", at)
                    .build(&format!(
                        "backpointer index {index} out of range (list holds {count})"
                    )),
            ));
        }
        let last = count - 1;
        if index != last {
            let moved = Ptr::with(g.heap.get_u64(entry_at(head, last))?);
            g.heap.put_u64(entry_at(head, index), moved.addr)?;
            self.forward().adjust_index(g, moved, index)?;
        }
        g.heap.put_u64(entry_at(head, last), 0)?;
        g.heap.put_u32(head.offset(COUNT_OFFSET), last)?;
        if last == 0 {
            g.heap.free(head)?;
            g.heap.put_ptr(slot, Ptr::null())?;
        }
        Ok(())
    }

    /// clear every referrer's forward field (without re-detaching through
    /// this list) and release the block. invoked by the deletion scheduler
    /// while the record at `at` is being reaped.
    pub fn destruct<S: Storage>(
        &self,
        g: &mut Graph<S>,
        at: Ptr<Void>,
    ) -> Result<(), GraphError<S::Error>> {
        g.log.start(&self.0.destruct_tag, at.addr);
        let res = self.destruct_inner(g, at);
        g.log.end();
        res
    }

    fn destruct_inner<S: Storage>(
        &self,
        g: &mut Graph<S>,
        at: Ptr<Void>,
    ) -> Result<(), GraphError<S::Error>> {
        let slot = rel(at, self.0.offset);
        let head = g.heap.get_ptr(slot)?;
        if head.is_null() {
            return Ok(());
        }
        let count = g.heap.get_u32(head.offset(COUNT_OFFSET))?;
        for i in 0..count {
            let referrer = Ptr::with(g.heap.get_u64(entry_at(head, i))?);
            self.forward().cleared_by_back_pointer(g, referrer)?;
        }
        g.heap.free(head)?;
        g.heap.put_ptr(slot, Ptr::null())?;
        Ok(())
    }
}
