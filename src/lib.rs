//! # Tangle
//!
//! A persistent, address-based object-graph store. Records are fixed-layout
//! byte ranges in a growable heap, addressed by 64-bit offsets (address 0
//! means "no value"). Typed field descriptors give structured access to a
//! record's attributes, and the relationship pair
//! ([`FieldManyToOne`]/[`FieldOneToMany`]) keeps bidirectional links
//! consistent automatically: storing a forward pointer inserts the record
//! into the target's backpointer list, clearing it removes the entry again,
//! and clearing an owner pointer schedules the whole record for deletion.
//!
//! Layering, leaf to root:
//! - [`heap`]: the byte heap itself - chunk allocator with size-keyed free
//!   lists, interned strings, pluggable [`heap::store::Storage`] backing
//!   (in-memory or a memory-mapped file)
//! - [`log`]: diagnostic trace of recent field mutations
//! - [`schema`]: startup-time struct definitions and the type-tag registry
//! - [`field`]: typed field descriptors bound to byte offsets
//! - [`index`]: shared B-tree search index over record addresses
//! - [`graph`]: the top-level handle, including the deferred-deletion
//!   work list that cascades `destruct()` across a record's fields
//!
//! There is no internal locking: callers are expected to wrap groups of
//! mutating calls in an external single-writer/multiple-reader discipline.
//! Deletion never happens inline during a pointer update; affected records
//! are queued and reaped by [`graph::Graph::process_deletions`] after the
//! mutation batch.

#[macro_use]
extern crate tracing;

pub mod field;
pub mod graph;
pub mod heap;
pub mod index;
pub mod log;
pub mod schema;

pub use field::{
    many_to_one::FieldManyToOne, one_to_many::FieldOneToMany, search::FieldSearchIndex,
    search::FieldSearchKey, string::FieldString, string::HeapString, FieldInt, FieldPointer,
};
pub use graph::{Graph, GraphError, Problem};
pub use heap::ptr::{Ptr, Void};
pub use schema::{DeletionSemantics, SchemaRegistry, StructDef, TypeId};
