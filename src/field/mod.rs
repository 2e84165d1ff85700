//! Typed field descriptors.
//!
//! A field descriptor is an offset into a record's fixed layout plus the
//! logic to read and write that attribute through the heap. Descriptors are
//! created by the [`crate::schema::StructDef`] builder at startup and are
//! cheap to clone (everything interesting lives behind an `Arc`).
//!
//! Mutating operations bracket themselves with the modification log; none
//! of them lock, suspend, or block - callers provide the single-writer
//! discipline.

pub mod many_to_one;
pub mod one_to_many;
pub mod search;
pub mod string;
#[cfg(test)]
mod test;

use std::sync::Arc;

use crate::{
    graph::{Graph, GraphError},
    heap::{
        ptr::{Ptr, Void},
        store::Storage,
    },
    log::Tag,
};

/// address of a field inside the record starting at `at`.
pub(crate) fn rel(at: Ptr<Void>, offset: u32) -> Ptr<Void> {
    at.offset(offset as u64)
}

/// a plain 32-bit integer attribute.
#[derive(Clone)]
pub struct FieldInt {
    offset: u32,
    put_tag: Tag,
}

impl FieldInt {
    pub(crate) fn new(owner: &Arc<str>, name: &str, offset: u32) -> Self {
        Self {
            offset,
            put_tag: Tag::new(format!("put {owner}.{name}")),
        }
    }

    pub fn get<S: Storage>(
        &self,
        g: &mut Graph<S>,
        at: Ptr<Void>,
    ) -> Result<u32, GraphError<S::Error>> {
        Ok(g.heap.get_u32(rel(at, self.offset))?)
    }

    pub fn put<S: Storage>(
        &self,
        g: &mut Graph<S>,
        at: Ptr<Void>,
        value: u32,
    ) -> Result<(), GraphError<S::Error>> {
        g.log.start(&self.put_tag, at.addr);
        let res = g.heap.put_u32(rel(at, self.offset), value);
        g.log.end();
        Ok(res?)
    }
}

/// a raw record-pointer attribute. no backpointer maintenance - use the
/// relationship pair when the target needs to know about its referrers.
#[derive(Clone)]
pub struct FieldPointer {
    offset: u32,
    put_tag: Tag,
}

impl FieldPointer {
    pub(crate) fn new(owner: &Arc<str>, name: &str, offset: u32) -> Self {
        Self {
            offset,
            put_tag: Tag::new(format!("put {owner}.{name}")),
        }
    }

    pub fn get<S: Storage>(
        &self,
        g: &mut Graph<S>,
        at: Ptr<Void>,
    ) -> Result<Ptr<Void>, GraphError<S::Error>> {
        Ok(g.heap.get_ptr(rel(at, self.offset))?)
    }

    pub fn put<S: Storage>(
        &self,
        g: &mut Graph<S>,
        at: Ptr<Void>,
        value: Ptr<Void>,
    ) -> Result<(), GraphError<S::Error>> {
        g.log.start(&self.put_tag, at.addr);
        let res = g.heap.put_ptr(rel(at, self.offset), value);
        g.log.end();
        Ok(res?)
    }
}
