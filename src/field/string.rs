//! Interned record strings.

use std::sync::Arc;

use super::rel;
use crate::{
    graph::{Graph, GraphError},
    heap::{
        ptr::{Ptr, Void},
        store::Storage,
    },
    log::Tag,
};

/// result of reading a string attribute. a zero stored pointer reads as the
/// shared [`HeapString::Empty`] representation, which is distinct from an
/// interned empty string that happens to be stored.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HeapString {
    Empty,
    Interned(String),
}

impl HeapString {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Empty => "",
            Self::Interned(s) => s,
        }
    }
}

/// an attribute holding a pointer to an interned, length-prefixed string.
#[derive(Clone)]
pub struct FieldString(Arc<StrInner>);

struct StrInner {
    offset: u32,
    put_tag: Tag,
    destruct_tag: Tag,
}

impl FieldString {
    pub(crate) fn new(owner: &Arc<str>, name: &str, offset: u32) -> Self {
        Self(Arc::new(StrInner {
            offset,
            put_tag: Tag::new(format!("put {owner}.{name}")),
            destruct_tag: Tag::new(format!("destruct {owner}.{name}")),
        }))
    }

    pub(crate) fn offset(&self) -> u32 {
        self.0.offset
    }

    pub fn get<S: Storage>(
        &self,
        g: &mut Graph<S>,
        at: Ptr<Void>,
    ) -> Result<HeapString, GraphError<S::Error>> {
        let stored = g.heap.get_ptr(rel(at, self.0.offset))?;
        if stored.is_null() {
            Ok(HeapString::Empty)
        } else {
            Ok(HeapString::Interned(g.heap.get_string(stored)?))
        }
    }

    /// store `value`, comparing against the current content first: storing
    /// a string equal to what is already there is a no-op (no reallocation,
    /// no write).
    pub fn put<S: Storage>(
        &self,
        g: &mut Graph<S>,
        at: Ptr<Void>,
        value: &str,
    ) -> Result<(), GraphError<S::Error>> {
        let old = g.heap.get_ptr(rel(at, self.0.offset))?;
        if old.is_null() && value.is_empty() {
            return Ok(());
        }
        if !old.is_null() && g.heap.string_eq(old, value)? {
            return Ok(());
        }
        g.log.start(&self.0.put_tag, at.addr);
        let res = self.replace(g, at, old, value);
        g.log.end();
        res
    }

    fn replace<S: Storage>(
        &self,
        g: &mut Graph<S>,
        at: Ptr<Void>,
        old: Ptr<Void>,
        value: &str,
    ) -> Result<(), GraphError<S::Error>> {
        if !old.is_null() {
            g.heap.free_string(old)?;
        }
        let new = if value.is_empty() {
            Ptr::null()
        } else {
            g.heap.new_string(value)?
        };
        g.heap.put_ptr(rel(at, self.0.offset), new)?;
        Ok(())
    }

    /// free the interned string and zero the pointer. invoked by the
    /// deletion scheduler.
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
        let old = g.heap.get_ptr(rel(at, self.0.offset))?;
        self.replace(g, at, old, "")
    }
}
