//! The "one" side of a bidirectional relationship: a pointer to the target
//! record plus the index of this record's entry in the target's backpointer
//! list.
//!
//! Field layout (12 bytes): `target: u64, back_index: u32`. The stored index
//! makes detaching O(1) - the target's list swap-removes this entry without
//! scanning.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use super::{one_to_many::FieldOneToMany, rel};
use crate::{
    graph::{Graph, GraphError},
    heap::{
        ptr::{Ptr, Void},
        store::Storage,
    },
    log::Tag,
};

const TARGET_OFFSET: u32 = 0;
const INDEX_OFFSET: u32 = 8;

/// forward pointer of a relationship pair. writing through it keeps the
/// paired [`FieldOneToMany`] list on the target in sync, and clearing the
/// last reference to a refcount-deleted record schedules that record.
#[derive(Clone)]
pub struct FieldManyToOne(Arc<ManyToOneInner>);

struct ManyToOneInner {
    owner: Arc<str>,
    name: Arc<str>,
    offset: u32,
    back: FieldOneToMany,
    /// true when the target is this record's owner: clearing the pointer
    /// (other than during the owner's own destruction) orphans the record,
    /// which schedules it for deletion.
    points_to_owner: bool,
    permits_null: AtomicBool,
    put_tag: Tag,
    destruct_tag: Tag,
}

impl FieldManyToOne {
    pub(crate) fn new(
        owner: &Arc<str>,
        name: &str,
        offset: u32,
        back: FieldOneToMany,
        points_to_owner: bool,
    ) -> Self {
        let field = Self(Arc::new(ManyToOneInner {
            owner: owner.clone(),
            name: name.into(),
            offset,
            back,
            points_to_owner,
            permits_null: AtomicBool::new(true),
            put_tag: Tag::new(format!("put {owner}.{name}")),
            destruct_tag: Tag::new(format!("destruct {owner}.{name}")),
        }));
        field.0.back.bind(field.clone());
        field
    }

    pub(crate) fn is_same_field(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    pub(crate) fn qualified_name(&self) -> String {
        format!("{}.{}", self.0.owner, self.0.name)
    }

    /// `permit_null(false)` declares the field non-nullable: a stored zero
    /// address then reads as corruption and writing null panics. fields
    /// start out nullable (records are born zeroed). returns `&self` for
    /// chaining off the schema builder.
    pub fn permit_null(&self, permit: bool) -> &Self {
        self.0.permits_null.store(permit, Ordering::Relaxed);
        self
    }

    /// the current target. a null target on a field that does not permit
    /// null is reported as corruption, not as an absent value.
    pub fn get<S: Storage>(
        &self,
        g: &mut Graph<S>,
        at: Ptr<Void>,
    ) -> Result<Ptr<Void>, GraphError<S::Error>> {
        let target = g.heap.get_ptr(rel(at, self.0.offset + TARGET_OFFSET))?;
        if target.is_null() && !self.0.permits_null.load(Ordering::Relaxed) {
            return Err(GraphError::Corrupt(
                g.describe_problem()
                    .field(&self.0.owner, &self.0.name)
                    .addr("record", at)
                    .build("null target in a field that does not permit null"),
            ));
        }
        Ok(target)
    }

    /// like [`Self::get`] but a null target is always an ordinary `None`.
    pub fn get_opt<S: Storage>(
        &self,
        g: &mut Graph<S>,
        at: Ptr<Void>,
    ) -> Result<Option<Ptr<Void>>, GraphError<S::Error>> {
        let target = g.heap.get_ptr(rel(at, self.0.offset + TARGET_OFFSET))?;
        Ok(if target.is_null() { None } else { Some(target) })
    }

    /// point the record at `at` at `target`, detaching from the previous
    /// target first. storing the current target is a no-op. storing null
    /// detaches without re-attaching; on an owner field that orphans the
    /// record and schedules it for deletion.
    pub fn put<S: Storage>(
        &self,
        g: &mut Graph<S>,
        at: Ptr<Void>,
        target: Ptr<Void>,
    ) -> Result<(), GraphError<S::Error>> {
        assert!(
            !target.is_null() || self.0.permits_null.load(Ordering::Relaxed),
            "storing null in field {} which does not permit null",
            self.qualified_name(),
        );
        let old = g.heap.get_ptr(rel(at, self.0.offset + TARGET_OFFSET))?;
        if old == target {
            return Ok(());
        }
        g.log.start(&self.0.put_tag, at.addr);
        let res = self.put_inner(g, at, old, target, true);
        g.log.end();
        res
    }

    fn put_inner<S: Storage>(
        &self,
        g: &mut Graph<S>,
        at: Ptr<Void>,
        old: Ptr<Void>,
        target: Ptr<Void>,
        owner_trigger: bool,
    ) -> Result<(), GraphError<S::Error>> {
        if !old.is_null() {
            let index = g.heap.get_u32(rel(at, self.0.offset + INDEX_OFFSET))?;
            self.0.back.remove(g, old, index)?;
            g.maybe_schedule_refcounted(old)?;
        }
        g.heap.put_ptr(rel(at, self.0.offset + TARGET_OFFSET), target)?;
        if target.is_null() {
            g.heap.put_u32(rel(at, self.0.offset + INDEX_OFFSET), 0)?;
            if self.0.points_to_owner && owner_trigger {
                g.schedule_deletion(at);
            }
        } else {
            let index = self.0.back.add(g, target, at)?;
            g.heap.put_u32(rel(at, self.0.offset + INDEX_OFFSET), index)?;
        }
        Ok(())
    }

    /// detach from the target without the orphan-scheduling that an
    /// explicit null store performs. invoked by the deletion scheduler
    /// while the record at `at` is being reaped.
    pub fn destruct<S: Storage>(
        &self,
        g: &mut Graph<S>,
        at: Ptr<Void>,
    ) -> Result<(), GraphError<S::Error>> {
        let old = g.heap.get_ptr(rel(at, self.0.offset + TARGET_OFFSET))?;
        if old.is_null() {
            return Ok(());
        }
        g.log.start(&self.0.destruct_tag, at.addr);
        let res = self.put_inner(g, at, old, Ptr::null(), false);
        g.log.end();
        res
    }

    /// zero this field because the target's backpointer list is being torn
    /// down; the list entry is already gone, so no detach happens here. an
    /// owned record losing its owner this way is scheduled for deletion.
    pub(crate) fn cleared_by_back_pointer<S: Storage>(
        &self,
        g: &mut Graph<S>,
        at: Ptr<Void>,
    ) -> Result<(), GraphError<S::Error>> {
        g.heap
            .put_ptr(rel(at, self.0.offset + TARGET_OFFSET), Ptr::null())?;
        g.heap.put_u32(rel(at, self.0.offset + INDEX_OFFSET), 0)?;
        if self.0.points_to_owner {
            g.schedule_deletion(at);
        }
        Ok(())
    }

    /// the record at `at` was moved to `index` in its target's backpointer
    /// list (swap-remove compaction); keep the stored index in sync.
    pub(crate) fn adjust_index<S: Storage>(
        &self,
        g: &mut Graph<S>,
        at: Ptr<Void>,
        index: u32,
    ) -> Result<(), GraphError<S::Error>> {
        Ok(g.heap.put_u32(rel(at, self.0.offset + INDEX_OFFSET), index)?)
    }
}
