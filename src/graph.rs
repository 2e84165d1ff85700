//! The object graph: typed records on the heap, plus the deferred deletion
//! scheduler that keeps relationship invariants intact while subgraphs are
//! torn down.
//!
//! Single-writer by construction: every operation takes `&mut self` and
//! nothing here locks or suspends. Callers that want concurrency put their
//! own lock around the whole graph.

use std::{
    collections::{HashSet, VecDeque},
    error::Error,
    fmt,
    sync::Arc,
};

use crate::{
    heap::{
        error::HeapError,
        ptr::{Ptr, Void},
        store::Storage,
        Heap,
    },
    log::{ModificationLog, Tag},
    schema::{DeletionSemantics, NodeType, SchemaRegistry, TypeId},
};

#[derive(Debug, thiserror::Error)]
pub enum GraphError<E: Error + 'static> {
    #[error(transparent)]
    Heap(#[from] HeapError<E>),
    /// on-heap data contradicts a schema invariant. programmer misuse of the
    /// schema API panics instead; this variant is for damage in the data.
    #[error("graph corruption detected: {0}")]
    Corrupt(Problem),
}

/// description of one corruption finding: what was wrong, where, and what
/// the graph had been doing shortly before.
#[derive(Debug)]
pub struct Problem {
    message: String,
    field: Option<String>,
    addresses: Vec<(String, u64)>,
    recent: Vec<String>,
}

impl fmt::Display for Problem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)?;
        if let Some(field) = &self.field {
            write!(f, " [field {field}]")?;
        }
        for (label, addr) in &self.addresses {
            write!(f, " [{label} @ {addr:#x}]")?;
        }
        if !self.recent.is_empty() {
            write!(f, " (recent mutations: {})", self.recent.join(", "))?;
        }
        Ok(())
    }
}

/// accumulates context for a [`Problem`]. obtained from
/// [`Graph::describe_problem`], which snapshots the modification log tail.
pub struct ProblemBuilder {
    field: Option<String>,
    addresses: Vec<(String, u64)>,
    recent: Vec<String>,
}

impl ProblemBuilder {
    pub fn field(mut self, owner: &str, name: &str) -> Self {
        self.field = Some(format!("{owner}.{name}"));
        self
    }

    pub fn addr(mut self, label: &str, at: Ptr<Void>) -> Self {
        self.addresses.push((label.into(), at.addr));
        self
    }

    pub fn build(self, message: &str) -> Problem {
        error!("corruption: {message}");
        Problem {
            message: message.into(),
            field: self.field,
            addresses: self.addresses,
            recent: self.recent,
        }
    }
}

/// a typed object graph over one backing store.
pub struct Graph<S: Storage> {
    pub(crate) heap: Heap<S>,
    pub(crate) log: ModificationLog,
    registry: Arc<SchemaRegistry>,
    /// deletion worklist. an address stays in `pending_set` from the moment
    /// it is scheduled until its chunk is freed, so re-scheduling a record
    /// mid-destruction (reference cycles do this) is a no-op.
    pending: VecDeque<u64>,
    pending_set: HashSet<u64>,
    create_tag: Tag,
}

impl<S: Storage> Graph<S> {
    #[instrument(skip(store, registry))]
    pub fn new(
        store: S,
        init_overwrite: bool,
        registry: Arc<SchemaRegistry>,
    ) -> Result<Self, GraphError<S::Error>> {
        Ok(Self {
            heap: Heap::new(store, init_overwrite)?,
            log: ModificationLog::new(),
            registry,
            pending: VecDeque::new(),
            pending_set: HashSet::new(),
            create_tag: Tag::new("create node"),
        })
    }

    pub fn registry(&self) -> &Arc<SchemaRegistry> {
        &self.registry
    }

    /// allocate a zeroed record of the given node type and stamp its type
    /// tag. panics if the tag was never registered - that is a schema bug,
    /// not a data problem.
    pub fn create_node(&mut self, tag: TypeId) -> Result<Ptr<Void>, GraphError<S::Error>> {
        let node_type = self
            .registry
            .get(tag.0)
            .unwrap_or_else(|| panic!("node type tag {} was never registered", tag.0));
        let size = node_type.def().size();
        let at = self.heap.alloc(size as u64)?;
        self.log.start(&self.create_tag, at.addr);
        let res = self.heap.put_u16(at, tag.0);
        self.log.end();
        res?;
        debug!("created {} node @ {:#X}", node_type.def().name(), at.addr);
        Ok(at)
    }

    /// resolve the node type of the record at `at` from its header tag. an
    /// unregistered tag in the data is corruption.
    pub fn node_type(&mut self, at: Ptr<Void>) -> Result<Arc<NodeType>, GraphError<S::Error>> {
        let tag = self.heap.get_u16(at)?;
        self.registry.get(tag).ok_or_else(|| {
            GraphError::Corrupt(
                self.describe_problem()
                    .addr("record", at)
                    .build(&format!("record carries unregistered type tag {tag}")),
            )
        })
    }

    /// queue the record at `at` for deletion. idempotent; the actual
    /// teardown happens in [`Self::process_deletions`].
    pub fn schedule_deletion(&mut self, at: Ptr<Void>) {
        if self.pending_set.insert(at.addr) {
            trace!("scheduled {:#X} for deletion", at.addr);
            self.pending.push_back(at.addr);
        }
    }

    /// true while records are queued for deletion.
    pub fn has_pending_deletions(&self) -> bool {
        !self.pending.is_empty()
    }

    /// drain the deletion worklist, tearing down each queued record's
    /// fields (which may queue further records - ownership cascades travel
    /// through the worklist, not the call stack) and freeing its chunk.
    /// returns the number of records reaped.
    #[instrument(skip(self))]
    pub fn process_deletions(&mut self) -> Result<usize, GraphError<S::Error>> {
        let mut reaped = 0;
        while let Some(addr) = self.pending.pop_front() {
            let at = Ptr::<Void>::with(addr);
            let node_type = self.node_type(at)?;
            for field in &node_type.def().destructable {
                field.destruct(self, at)?;
            }
            self.heap.free(at)?;
            // only now may the address be scheduled again (for a future
            // record that happens to land on it)
            self.pending_set.remove(&addr);
            reaped += 1;
        }
        if reaped > 0 {
            debug!("reaped {reaped} records");
        }
        Ok(reaped)
    }

    /// true while any backpointer list of the record at `at` is non-empty.
    pub fn has_references(
        &mut self,
        at: Ptr<Void>,
        node_type: &NodeType,
    ) -> Result<bool, GraphError<S::Error>> {
        for back in node_type.def().back_fields.clone() {
            if !back.is_empty(self, at)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// a refcount-deleted record just lost a reference; queue it if that
    /// was the last one. records of explicit-deletion types (and records
    /// whose tag is not registered, such as embedded structs) are left
    /// alone.
    pub(crate) fn maybe_schedule_refcounted(
        &mut self,
        at: Ptr<Void>,
    ) -> Result<(), GraphError<S::Error>> {
        if self.pending_set.contains(&at.addr) {
            return Ok(());
        }
        let tag = self.heap.get_u16(at)?;
        let Some(node_type) = self.registry.get(tag) else {
            return Ok(());
        };
        if node_type.deletion() == DeletionSemantics::Refcounted
            && !self.has_references(at, &node_type)?
        {
            self.schedule_deletion(at);
        }
        Ok(())
    }

    /// start a corruption report, snapshotting the recent-mutation tail.
    pub fn describe_problem(&mut self) -> ProblemBuilder {
        ProblemBuilder {
            field: None,
            addresses: vec![],
            recent: self.log.recent().map(|e| e.to_string()).collect(),
        }
    }

    pub fn infodump(&mut self) -> Result<(), GraphError<S::Error>> {
        Ok(self.heap.infodump()?)
    }

    pub fn sync(&mut self) -> Result<(), GraphError<S::Error>> {
        Ok(self.heap.sync()?)
    }

    pub fn close(self) -> Result<(), GraphError<S::Error>> {
        Ok(self.heap.close()?)
    }
}
