//! Diagnostic trace of recent field mutations.
//!
//! Every mutating field operation brackets itself with
//! [`ModificationLog::start`]/[`ModificationLog::end`]. The log has no
//! control-flow or synchronization role whatsoever - it exists so that a
//! corruption report ([`crate::graph::Problem`]) can say what the graph was
//! doing shortly before the damage was noticed.

use std::{collections::VecDeque, fmt, sync::Arc};

mod tuning {
    /// number of entries retained. old entries fall off the back.
    pub const LOG_CAPACITY: usize = 64;
}

/// a cheap, clonable label for one kind of mutation, created once per field
/// at schema-build time.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Tag(Arc<str>);

impl Tag {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into().into())
    }

    pub fn name(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Debug)]
pub struct Entry {
    pub tag: Tag,
    pub address: u64,
}

impl fmt::Display for Entry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} @ {:#x}", self.tag, self.address)
    }
}

/// bounded ring of tagged mutations.
pub struct ModificationLog {
    entries: VecDeque<Entry>,
    depth: usize,
}

impl Default for ModificationLog {
    fn default() -> Self {
        Self::new()
    }
}

impl ModificationLog {
    pub fn new() -> Self {
        Self {
            entries: VecDeque::with_capacity(tuning::LOG_CAPACITY),
            depth: 0,
        }
    }

    /// record the start of a mutation. nested mutations (a put that detaches
    /// a backpointer, say) are recorded too; `depth` only tracks nesting.
    pub fn start(&mut self, tag: &Tag, address: u64) {
        trace!(depth = self.depth, "{tag} @ {address:#x}");
        if self.entries.len() == tuning::LOG_CAPACITY {
            self.entries.pop_front();
        }
        self.entries.push_back(Entry {
            tag: tag.clone(),
            address,
        });
        self.depth += 1;
    }

    pub fn end(&mut self) {
        self.depth = self.depth.saturating_sub(1);
    }

    /// the retained tail of the log, oldest first.
    pub fn recent(&self) -> impl Iterator<Item = &Entry> {
        self.entries.iter()
    }
}
