//! Record layouts, built once at startup.
//!
//! A [`StructDef`] accumulates field descriptors, assigning each its offset
//! in the record's fixed layout; [`StructDef::done`] freezes it. Node types
//! (layouts with a [`TypeId`]) are then handed to the [`SchemaRegistry`],
//! which is what lets the deletion scheduler look at a bare address, read
//! the type tag out of the record header, and find the fields it must tear
//! down.
//!
//! Schema mistakes are programmer errors, not data errors: everything in
//! this module panics instead of returning `Result`.

use std::sync::Arc;

use crate::{
    field::{
        many_to_one::FieldManyToOne,
        one_to_many::FieldOneToMany,
        search::{FieldSearchIndex, FieldSearchKey},
        string::FieldString,
        FieldInt, FieldPointer,
    },
    graph::{Graph, GraphError},
    heap::{
        ptr::{Ptr, Void},
        store::Storage,
        tuning::INDEX_ROOTS,
    },
};

/// on-heap tag identifying a node's type, stored in the record header.
/// zero is reserved (a zeroed record is recognizably not a node).
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct TypeId(pub u16);

/// every record of a node type starts with this header: the u16 type tag
/// followed by two reserved bytes.
pub const NODE_HEADER_SIZE: u32 = 4;

/// how records of a type leave the graph.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DeletionSemantics {
    /// deleted only when explicitly scheduled (or orphaned from an owner).
    Explicit,
    /// deleted automatically once the last backpointer list empties.
    Refcounted,
}

/// one field a record must tear down when it is deleted, in declaration
/// order.
pub(crate) enum DestructableField {
    String(FieldString),
    SearchKey(FieldSearchKey),
    ManyToOne(FieldManyToOne),
    OneToMany(FieldOneToMany),
}

impl DestructableField {
    pub(crate) fn destruct<S: Storage>(
        &self,
        g: &mut Graph<S>,
        at: Ptr<Void>,
    ) -> Result<(), GraphError<S::Error>> {
        match self {
            Self::String(f) => f.destruct(g, at),
            Self::SearchKey(f) => f.destruct(g, at),
            Self::ManyToOne(f) => f.destruct(g, at),
            Self::OneToMany(f) => f.destruct(g, at),
        }
    }
}

/// builder for one record layout. field offsets are assigned in declaration
/// order; [`Self::done`] freezes the layout and fixes the record size.
pub struct StructDef {
    name: Arc<str>,
    type_id: Option<TypeId>,
    size: u32,
    frozen: bool,
    has_search_key: bool,
    pub(crate) destructable: Vec<DestructableField>,
    pub(crate) back_fields: Vec<FieldOneToMany>,
}

impl StructDef {
    /// a plain layout with no type tag. records of such layouts cannot be
    /// scheduled for deletion (the scheduler would have no way to find
    /// their fields).
    pub fn new(name: impl Into<Arc<str>>) -> Self {
        Self {
            name: name.into(),
            type_id: None,
            size: 0,
            frozen: false,
            has_search_key: false,
            destructable: vec![],
            back_fields: vec![],
        }
    }

    /// a node layout: records carry `type_id` in their header, and the
    /// registry can dispatch on it.
    pub fn new_node(name: impl Into<Arc<str>>, type_id: TypeId) -> Self {
        assert!(type_id.0 != 0, "type tag 0 is reserved");
        let mut def = Self::new(name);
        def.type_id = Some(type_id);
        def.size = NODE_HEADER_SIZE;
        def
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn type_id(&self) -> Option<TypeId> {
        self.type_id
    }

    /// record size in bytes. only meaningful once frozen.
    pub fn size(&self) -> u32 {
        assert!(self.frozen, "layout {} is not finished", self.name);
        self.size
    }

    fn claim(&mut self, bytes: u32) -> u32 {
        assert!(
            !self.frozen,
            "layout {} is already finished; fields must be declared before done()",
            self.name
        );
        let offset = self.size;
        self.size += bytes;
        offset
    }

    pub fn add_int(&mut self, name: &str) -> FieldInt {
        let offset = self.claim(4);
        FieldInt::new(&self.name, name, offset)
    }

    pub fn add_pointer(&mut self, name: &str) -> FieldPointer {
        let offset = self.claim(8);
        FieldPointer::new(&self.name, name, offset)
    }

    pub fn add_string(&mut self, name: &str) -> FieldString {
        let offset = self.claim(8);
        let field = FieldString::new(&self.name, name, offset);
        self.destructable
            .push(DestructableField::String(field.clone()));
        field
    }

    /// a string attribute also entered in `index`. at most one per layout -
    /// an index requires all of its keys at one offset, so a second key in
    /// the same layout could never feed the same index.
    pub fn add_search_key(&mut self, name: &str, index: &FieldSearchIndex) -> FieldSearchKey {
        assert!(
            !self.has_search_key,
            "layout {} already declares a search key",
            self.name
        );
        self.has_search_key = true;
        let offset = self.claim(8);
        let field = FieldSearchKey::new(&self.name, name, offset, index.clone());
        self.destructable
            .push(DestructableField::SearchKey(field.clone()));
        field
    }

    /// the "many" side of a relationship. pass the returned field to
    /// [`Self::add_many_to_one`] on the referring layout to complete the
    /// pair.
    pub fn add_one_to_many(&mut self, name: &str) -> FieldOneToMany {
        let offset = self.claim(8);
        let field = FieldOneToMany::new(&self.name, name, offset);
        self.destructable
            .push(DestructableField::OneToMany(field.clone()));
        self.back_fields.push(field.clone());
        field
    }

    /// the "one" side of a relationship, paired with `back` on the target
    /// layout.
    pub fn add_many_to_one(&mut self, name: &str, back: &FieldOneToMany) -> FieldManyToOne {
        self.add_many_to_one_inner(name, back, false)
    }

    /// like [`Self::add_many_to_one`], but the target is the record's
    /// owner: clearing the field (or tearing down the owner) orphans the
    /// record and schedules it for deletion. requires a node layout, since
    /// the scheduler dispatches on the record's type tag.
    pub fn add_owner_many_to_one(&mut self, name: &str, back: &FieldOneToMany) -> FieldManyToOne {
        assert!(
            self.type_id.is_some(),
            "layout {} declares an owner field but has no type tag for the \
             deletion scheduler to dispatch on",
            self.name
        );
        self.add_many_to_one_inner(name, back, true)
    }

    fn add_many_to_one_inner(
        &mut self,
        name: &str,
        back: &FieldOneToMany,
        points_to_owner: bool,
    ) -> FieldManyToOne {
        let offset = self.claim(12);
        let field = FieldManyToOne::new(&self.name, name, offset, back.clone(), points_to_owner);
        self.destructable
            .push(DestructableField::ManyToOne(field.clone()));
        field
    }

    /// freeze the layout. any later field declaration panics.
    pub fn done(mut self) -> Self {
        self.frozen = true;
        self
    }
}

/// a frozen node layout plus its deletion semantics.
pub struct NodeType {
    pub(crate) def: StructDef,
    pub(crate) deletion: DeletionSemantics,
}

impl NodeType {
    pub fn def(&self) -> &StructDef {
        &self.def
    }

    pub fn deletion(&self) -> DeletionSemantics {
        self.deletion
    }
}

/// all node types and search indexes of a graph, built at startup and then
/// immutable.
pub struct SchemaRegistry {
    types: Vec<Option<Arc<NodeType>>>,
    next_index_slot: u32,
}

impl Default for SchemaRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self {
            types: vec![],
            next_index_slot: 0,
        }
    }

    /// register a finished node layout under its type tag.
    pub fn register(&mut self, def: StructDef, deletion: DeletionSemantics) -> Arc<NodeType> {
        assert!(def.frozen, "layout {} is not finished", def.name);
        let tag = def
            .type_id
            .unwrap_or_else(|| panic!("layout {} has no type tag", def.name))
            .0 as usize;
        if self.types.len() <= tag {
            self.types.resize(tag + 1, None);
        }
        assert!(
            self.types[tag].is_none(),
            "type tag {tag} registered twice (second layout: {})",
            def.name
        );
        let node = Arc::new(NodeType { def, deletion });
        self.types[tag] = Some(node.clone());
        node
    }

    /// allocate one of the heap's named index root slots for a new search
    /// index.
    pub fn create_index(&mut self, name: &str) -> FieldSearchIndex {
        assert!(
            (self.next_index_slot as usize) < INDEX_ROOTS,
            "all {INDEX_ROOTS} index root slots are in use"
        );
        let slot = self.next_index_slot;
        self.next_index_slot += 1;
        FieldSearchIndex::new(name, slot)
    }

    pub fn get(&self, tag: u16) -> Option<Arc<NodeType>> {
        self.types.get(tag as usize).cloned().flatten()
    }
}
