//! On-heap b-tree backing the search indexes.
//!
//! Keys are record addresses; ordering reads the record's search-key string
//! through the heap and falls back to the address itself on ties. That makes
//! every entry unique (so delete is unambiguous) while keeping records with
//! equal keys adjacent, which is what lets [`BTree::find_all`] collect a
//! duplicate run with one pruned descent.
//!
//! Fixed-degree nodes, preemptive splitting on the way down for insert, and
//! the usual borrow/merge rebalancing for delete.

use std::cmp::Ordering;

use static_assertions::const_assert_eq;
use zerocopy::{AsBytes, FromBytes, FromZeroes};

use crate::{
    graph::{Graph, GraphError},
    heap::{
        ptr::{Ptr, Void},
        store::Storage,
    },
};

mod tuning {
    /// minimum b-tree degree `t`: nodes hold `t-1 ..= 2t-1` keys.
    pub const MIN_DEGREE: usize = 8;
}

const MAX_KEYS: usize = 2 * tuning::MIN_DEGREE - 1;
const MAX_CHILDREN: usize = 2 * tuning::MIN_DEGREE;
const MIN_KEYS: usize = tuning::MIN_DEGREE - 1;

/// one tree node as it sits on the heap.
#[derive(Clone, Copy, FromZeroes, FromBytes, AsBytes)]
#[repr(C)]
struct Node {
    count: u16,
    leaf: u16,
    _pad: u32,
    keys: [Ptr<Void>; MAX_KEYS],
    children: [Ptr<Node>; MAX_CHILDREN],
}

const NODE_SIZE: u64 = std::mem::size_of::<Node>() as u64;
const_assert_eq!(std::mem::size_of::<Node>(), 256);

impl Node {
    fn is_leaf(&self) -> bool {
        self.leaf != 0
    }

    fn len(&self) -> usize {
        self.count as usize
    }
}

/// handle to one index root slot. stateless - every operation reads the
/// root pointer out of the heap header, so handles are free to construct.
pub struct BTree {
    slot: u32,
    /// offset of the search-key string pointer inside every indexed record.
    key_offset: u32,
}

impl BTree {
    pub(crate) fn new(slot: u32, key_offset: u32) -> Self {
        Self { slot, key_offset }
    }

    fn key_of<S: Storage>(
        &self,
        g: &mut Graph<S>,
        record: Ptr<Void>,
    ) -> Result<String, GraphError<S::Error>> {
        let stored = g.heap.get_ptr(record.offset(self.key_offset as u64))?;
        if stored.is_null() {
            Ok(String::new())
        } else {
            Ok(g.heap.get_string(stored)?)
        }
    }

    /// full entry order: key content, then record address.
    fn cmp_records<S: Storage>(
        &self,
        g: &mut Graph<S>,
        a: Ptr<Void>,
        b: Ptr<Void>,
    ) -> Result<Ordering, GraphError<S::Error>> {
        if a == b {
            return Ok(Ordering::Equal);
        }
        let ka = self.key_of(g, a)?;
        let kb = self.key_of(g, b)?;
        Ok(ka.cmp(&kb).then(a.addr.cmp(&b.addr)))
    }

    fn read_node<S: Storage>(
        &self,
        g: &mut Graph<S>,
        at: Ptr<Node>,
    ) -> Result<Node, GraphError<S::Error>> {
        Ok(g.heap.read(at)?)
    }

    fn write_node<S: Storage>(
        &self,
        g: &mut Graph<S>,
        at: Ptr<Node>,
        node: &Node,
    ) -> Result<(), GraphError<S::Error>> {
        Ok(g.heap.write(at, node)?)
    }

    fn alloc_node<S: Storage>(
        &self,
        g: &mut Graph<S>,
        leaf: bool,
    ) -> Result<Ptr<Node>, GraphError<S::Error>> {
        // fresh chunks come back zeroed; only the leaf flag needs setting
        let at = g.heap.alloc(NODE_SIZE)?.cast::<Node>();
        if leaf {
            let mut node = Node::new_zeroed();
            node.leaf = 1;
            self.write_node(g, at, &node)?;
        }
        Ok(at)
    }

    fn root<S: Storage>(&self, g: &mut Graph<S>) -> Result<Ptr<Node>, GraphError<S::Error>> {
        Ok(g.heap.index_root(self.slot as usize)?.cast::<Node>())
    }

    fn set_root<S: Storage>(
        &self,
        g: &mut Graph<S>,
        to: Ptr<Node>,
    ) -> Result<(), GraphError<S::Error>> {
        Ok(g.heap.set_index_root(self.slot as usize, to.cast::<Void>())?)
    }

    // -- insert --

    pub fn insert<S: Storage>(
        &self,
        g: &mut Graph<S>,
        record: Ptr<Void>,
    ) -> Result<(), GraphError<S::Error>> {
        let root_ptr = self.root(g)?;
        if root_ptr.is_null() {
            let root_ptr = self.alloc_node(g, true)?;
            let mut root = self.read_node(g, root_ptr)?;
            root.keys[0] = record;
            root.count = 1;
            self.write_node(g, root_ptr, &root)?;
            return self.set_root(g, root_ptr);
        }
        let root = self.read_node(g, root_ptr)?;
        let root_ptr = if root.len() == MAX_KEYS {
            // grow upward: new root with the old one as its only child
            let new_root_ptr = self.alloc_node(g, false)?;
            let mut new_root = Node::new_zeroed();
            new_root.children[0] = root_ptr;
            self.write_node(g, new_root_ptr, &new_root)?;
            self.split_child(g, new_root_ptr, 0)?;
            self.set_root(g, new_root_ptr)?;
            new_root_ptr
        } else {
            root_ptr
        };
        self.insert_nonfull(g, root_ptr, record)
    }

    /// split the full `child_idx`-th child of the (non-full) node at `at`,
    /// hoisting the median key into `at`.
    fn split_child<S: Storage>(
        &self,
        g: &mut Graph<S>,
        at: Ptr<Node>,
        child_idx: usize,
    ) -> Result<(), GraphError<S::Error>> {
        let mut parent = self.read_node(g, at)?;
        let left_ptr = parent.children[child_idx];
        let mut left = self.read_node(g, left_ptr)?;
        debug_assert_eq!(left.len(), MAX_KEYS);

        let right_ptr = self.alloc_node(g, left.is_leaf())?;
        let mut right = self.read_node(g, right_ptr)?;

        // upper t-1 keys (and t children) move to the new right sibling
        let t = tuning::MIN_DEGREE;
        for i in 0..t - 1 {
            right.keys[i] = left.keys[i + t];
            left.keys[i + t] = Ptr::null();
        }
        if !left.is_leaf() {
            for i in 0..t {
                right.children[i] = left.children[i + t];
                left.children[i + t] = Ptr::null();
            }
        }
        right.count = (t - 1) as u16;
        let median = left.keys[t - 1];
        left.keys[t - 1] = Ptr::null();
        left.count = (t - 1) as u16;

        for i in (child_idx..parent.len()).rev() {
            parent.keys[i + 1] = parent.keys[i];
        }
        for i in (child_idx + 1..=parent.len()).rev() {
            parent.children[i + 1] = parent.children[i];
        }
        parent.keys[child_idx] = median;
        parent.children[child_idx + 1] = right_ptr;
        parent.count += 1;

        self.write_node(g, left_ptr, &left)?;
        self.write_node(g, right_ptr, &right)?;
        self.write_node(g, at, &parent)
    }

    fn insert_nonfull<S: Storage>(
        &self,
        g: &mut Graph<S>,
        mut at: Ptr<Node>,
        record: Ptr<Void>,
    ) -> Result<(), GraphError<S::Error>> {
        loop {
            let mut node = self.read_node(g, at)?;
            let mut i = node.len();
            if node.is_leaf() {
                while i > 0 && self.cmp_records(g, record, node.keys[i - 1])? == Ordering::Less {
                    node.keys[i] = node.keys[i - 1];
                    i -= 1;
                }
                node.keys[i] = record;
                node.count += 1;
                return self.write_node(g, at, &node);
            }
            while i > 0 && self.cmp_records(g, record, node.keys[i - 1])? == Ordering::Less {
                i -= 1;
            }
            let child = self.read_node(g, node.children[i])?;
            if child.len() == MAX_KEYS {
                self.split_child(g, at, i)?;
                let node = self.read_node(g, at)?;
                if self.cmp_records(g, record, node.keys[i])? == Ordering::Greater {
                    i += 1;
                }
                at = node.children[i];
            } else {
                at = node.children[i];
            }
        }
    }

    // -- delete --

    pub fn delete<S: Storage>(
        &self,
        g: &mut Graph<S>,
        record: Ptr<Void>,
    ) -> Result<(), GraphError<S::Error>> {
        let root_ptr = self.root(g)?;
        if root_ptr.is_null() {
            return Err(self.not_found(g, record));
        }
        self.delete_from(g, root_ptr, record)?;
        // shrink the tree if the root emptied out
        let root = self.read_node(g, root_ptr)?;
        if root.len() == 0 {
            let new_root = if root.is_leaf() {
                Ptr::null()
            } else {
                root.children[0]
            };
            g.heap.free(root_ptr.cast::<Void>())?;
            self.set_root(g, new_root)?;
        }
        Ok(())
    }

    fn not_found<S: Storage>(&self, g: &mut Graph<S>, record: Ptr<Void>) -> GraphError<S::Error> {
        GraphError::Corrupt(
            g.describe_problem()
                .addr("record", record)
                .build(&format!(
                    "record missing from search index {} during unindex",
                    self.slot
                )),
        )
    }

    fn delete_from<S: Storage>(
        &self,
        g: &mut Graph<S>,
        at: Ptr<Node>,
        record: Ptr<Void>,
    ) -> Result<(), GraphError<S::Error>> {
        let node = self.read_node(g, at)?;
        let mut i = 0;
        while i < node.len() && self.cmp_records(g, record, node.keys[i])? == Ordering::Greater {
            i += 1;
        }
        let found = i < node.len() && node.keys[i] == record;

        if found && node.is_leaf() {
            let mut node = node;
            for j in i..node.len() - 1 {
                node.keys[j] = node.keys[j + 1];
            }
            node.keys[node.len() - 1] = Ptr::null();
            node.count -= 1;
            return self.write_node(g, at, &node);
        }

        if found {
            // internal hit: replace with the in-order neighbor from
            // whichever side can afford to lose a key, else merge and
            // recurse into the combined child
            let left_ptr = node.children[i];
            let right_ptr = node.children[i + 1];
            let left = self.read_node(g, left_ptr)?;
            if left.len() > MIN_KEYS {
                let pred = self.extreme(g, left_ptr, false)?;
                let mut node = node;
                node.keys[i] = pred;
                self.write_node(g, at, &node)?;
                return self.delete_from(g, left_ptr, pred);
            }
            let right = self.read_node(g, right_ptr)?;
            if right.len() > MIN_KEYS {
                let succ = self.extreme(g, right_ptr, true)?;
                let mut node = node;
                node.keys[i] = succ;
                self.write_node(g, at, &node)?;
                return self.delete_from(g, right_ptr, succ);
            }
            self.merge_children(g, at, i)?;
            let node = self.read_node(g, at)?;
            return self.delete_from(g, node.children[i], record);
        }

        if node.is_leaf() {
            return Err(self.not_found(g, record));
        }

        // descend, topping up the child first if it sits at the minimum
        let child_ptr = node.children[i];
        let child = self.read_node(g, child_ptr)?;
        if child.len() == MIN_KEYS {
            self.fill_child(g, at, i)?;
            // filling may have merged the child away; re-resolve the path
            let node = self.read_node(g, at)?;
            let mut i = 0;
            while i < node.len()
                && self.cmp_records(g, record, node.keys[i])? == Ordering::Greater
            {
                i += 1;
            }
            if i < node.len() && node.keys[i] == record {
                return self.delete_from(g, at, record);
            }
            return self.delete_from(g, node.children[i], record);
        }
        self.delete_from(g, child_ptr, record)
    }

    /// smallest (`min = true`) or largest key in the subtree rooted at `at`.
    fn extreme<S: Storage>(
        &self,
        g: &mut Graph<S>,
        mut at: Ptr<Node>,
        min: bool,
    ) -> Result<Ptr<Void>, GraphError<S::Error>> {
        loop {
            let node = self.read_node(g, at)?;
            if node.is_leaf() {
                return Ok(if min {
                    node.keys[0]
                } else {
                    node.keys[node.len() - 1]
                });
            }
            at = if min {
                node.children[0]
            } else {
                node.children[node.len()]
            };
        }
    }

    /// bring the `child_idx`-th child of `at` above the minimum key count,
    /// borrowing from a sibling or merging with one.
    fn fill_child<S: Storage>(
        &self,
        g: &mut Graph<S>,
        at: Ptr<Node>,
        child_idx: usize,
    ) -> Result<(), GraphError<S::Error>> {
        let node = self.read_node(g, at)?;
        if child_idx > 0 {
            let left = self.read_node(g, node.children[child_idx - 1])?;
            if left.len() > MIN_KEYS {
                return self.borrow_from_left(g, at, child_idx);
            }
        }
        if child_idx < node.len() {
            let right = self.read_node(g, node.children[child_idx + 1])?;
            if right.len() > MIN_KEYS {
                return self.borrow_from_right(g, at, child_idx);
            }
        }
        if child_idx < node.len() {
            self.merge_children(g, at, child_idx)
        } else {
            self.merge_children(g, at, child_idx - 1)
        }
    }

    /// rotate a key through the parent from the left sibling.
    fn borrow_from_left<S: Storage>(
        &self,
        g: &mut Graph<S>,
        at: Ptr<Node>,
        child_idx: usize,
    ) -> Result<(), GraphError<S::Error>> {
        let mut parent = self.read_node(g, at)?;
        let child_ptr = parent.children[child_idx];
        let left_ptr = parent.children[child_idx - 1];
        let mut child = self.read_node(g, child_ptr)?;
        let mut left = self.read_node(g, left_ptr)?;

        for j in (0..child.len()).rev() {
            child.keys[j + 1] = child.keys[j];
        }
        if !child.is_leaf() {
            for j in (0..=child.len()).rev() {
                child.children[j + 1] = child.children[j];
            }
            child.children[0] = left.children[left.len()];
            left.children[left.len()] = Ptr::null();
        }
        child.keys[0] = parent.keys[child_idx - 1];
        parent.keys[child_idx - 1] = left.keys[left.len() - 1];
        left.keys[left.len() - 1] = Ptr::null();
        child.count += 1;
        left.count -= 1;

        self.write_node(g, left_ptr, &left)?;
        self.write_node(g, child_ptr, &child)?;
        self.write_node(g, at, &parent)
    }

    /// rotate a key through the parent from the right sibling.
    fn borrow_from_right<S: Storage>(
        &self,
        g: &mut Graph<S>,
        at: Ptr<Node>,
        child_idx: usize,
    ) -> Result<(), GraphError<S::Error>> {
        let mut parent = self.read_node(g, at)?;
        let child_ptr = parent.children[child_idx];
        let right_ptr = parent.children[child_idx + 1];
        let mut child = self.read_node(g, child_ptr)?;
        let mut right = self.read_node(g, right_ptr)?;

        child.keys[child.len()] = parent.keys[child_idx];
        parent.keys[child_idx] = right.keys[0];
        if !child.is_leaf() {
            child.children[child.len() + 1] = right.children[0];
        }
        for j in 0..right.len() - 1 {
            right.keys[j] = right.keys[j + 1];
        }
        right.keys[right.len() - 1] = Ptr::null();
        if !right.is_leaf() {
            for j in 0..right.len() {
                right.children[j] = right.children[j + 1];
            }
            right.children[right.len()] = Ptr::null();
        }
        child.count += 1;
        right.count -= 1;

        self.write_node(g, right_ptr, &right)?;
        self.write_node(g, child_ptr, &child)?;
        self.write_node(g, at, &parent)
    }

    /// merge the `child_idx`-th child, the separating key, and the next
    /// sibling into one node, freeing the sibling.
    fn merge_children<S: Storage>(
        &self,
        g: &mut Graph<S>,
        at: Ptr<Node>,
        child_idx: usize,
    ) -> Result<(), GraphError<S::Error>> {
        let mut parent = self.read_node(g, at)?;
        let left_ptr = parent.children[child_idx];
        let right_ptr = parent.children[child_idx + 1];
        let mut left = self.read_node(g, left_ptr)?;
        let right = self.read_node(g, right_ptr)?;
        debug_assert!(left.len() + right.len() + 1 <= MAX_KEYS);

        left.keys[left.len()] = parent.keys[child_idx];
        for j in 0..right.len() {
            left.keys[left.len() + 1 + j] = right.keys[j];
        }
        if !left.is_leaf() {
            for j in 0..=right.len() {
                left.children[left.len() + 1 + j] = right.children[j];
            }
        }
        left.count += 1 + right.count;

        for j in child_idx..parent.len() - 1 {
            parent.keys[j] = parent.keys[j + 1];
        }
        parent.keys[parent.len() - 1] = Ptr::null();
        for j in child_idx + 1..parent.len() {
            parent.children[j] = parent.children[j + 1];
        }
        parent.children[parent.len()] = Ptr::null();
        parent.count -= 1;

        self.write_node(g, left_ptr, &left)?;
        self.write_node(g, at, &parent)?;
        g.heap.free(right_ptr.cast::<Void>())?;
        Ok(())
    }

    // -- lookup --

    /// every record whose key equals `key`, in address order.
    pub fn find_all<S: Storage>(
        &self,
        g: &mut Graph<S>,
        key: &str,
    ) -> Result<Vec<Ptr<Void>>, GraphError<S::Error>> {
        let root = self.root(g)?;
        let mut out = vec![];
        if !root.is_null() {
            self.collect(g, root, key, &mut out)?;
        }
        Ok(out)
    }

    fn collect<S: Storage>(
        &self,
        g: &mut Graph<S>,
        at: Ptr<Node>,
        key: &str,
        out: &mut Vec<Ptr<Void>>,
    ) -> Result<(), GraphError<S::Error>> {
        let node = self.read_node(g, at)?;
        let mut i = 0;
        // skip everything strictly below the key, then walk the equal run
        // (and the subtrees interleaved with it) in order
        while i < node.len() && self.key_of(g, node.keys[i])?.as_str() < key {
            i += 1;
        }
        loop {
            if !node.is_leaf() {
                self.collect(g, node.children[i], key, out)?;
            }
            if i == node.len() {
                break;
            }
            if self.key_of(g, node.keys[i])? == key {
                out.push(node.keys[i]);
            } else {
                break;
            }
            i += 1;
        }
        Ok(())
    }
}
