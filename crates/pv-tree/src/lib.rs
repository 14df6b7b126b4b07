#![forbid(unsafe_code)]
//! Copy-on-write persistent search tree mapping `PageId` to ref-counted
//! pages.
//!
//! Nodes live in a [`NodeStore`] arena keyed by [`NodeId`] and carry an
//! explicit reference count: the number of branch entries and version roots
//! pointing at the node, across all versions. Insertion and removal never
//! mutate a node owned by another version; the path from root to the changed
//! leaf is cloned, tagged with the writing version, and re-linked, so every
//! other version's view stays untouched. A write therefore allocates
//! O(log_F n) nodes for fan-out F.
//!
//! Reference-count protocol:
//! - cloning a branch retains each child node once (a new parent now
//!   references them); cloning a leaf retains each entry's page once;
//! - a freshly created node (clone, split sibling, new root) starts with one
//!   reference, owned by whoever installs it;
//! - superseded and removed leaf entries are handed back to the caller, who
//!   releases their page counts — the tree never decides page lifetime.

use pv_error::{Result, StoreError};
use pv_page::SharedPage;
use pv_types::{NodeId, PageId, VersionId};
use std::collections::HashMap;
use tracing::trace;

/// Maximum entries per node; a node holding more than this splits.
pub const FANOUT: usize = 32;

/// One page reference held by a leaf, tagged with the version that wrote it.
#[derive(Debug, Clone)]
pub struct LeafEntry {
    pub page: SharedPage,
    pub owner: VersionId,
}

/// Keyed slot of a leaf node. Slots are kept sorted by key.
#[derive(Debug, Clone)]
pub struct LeafSlot {
    pub key: PageId,
    pub entry: LeafEntry,
}

/// Routing entry of a branch node: the max key of the child subtree and the
/// child's arena id. Entries are kept sorted by `max_key`.
#[derive(Debug, Clone, Copy)]
pub struct BranchEntry {
    pub max_key: PageId,
    pub child: NodeId,
}

#[derive(Debug, Clone)]
pub enum NodeKind {
    Branch(Vec<BranchEntry>),
    Leaf(Vec<LeafSlot>),
}

/// Immutable-unless-owned tree node.
///
/// A node created while version `owner` was writing may be mutated
/// destructively by that version only; every other writer clones it first.
#[derive(Debug)]
pub struct TreeNode {
    pub id: NodeId,
    pub owner: VersionId,
    refs: i64,
    pub kind: NodeKind,
}

impl TreeNode {
    /// Build a leaf node with a zero reference count; the installer retains.
    #[must_use]
    pub fn new_leaf(id: NodeId, owner: VersionId, slots: Vec<LeafSlot>) -> Self {
        Self {
            id,
            owner,
            refs: 0,
            kind: NodeKind::Leaf(slots),
        }
    }

    /// Build a branch node with a zero reference count.
    #[must_use]
    pub fn new_branch(id: NodeId, owner: VersionId, entries: Vec<BranchEntry>) -> Self {
        Self {
            id,
            owner,
            refs: 0,
            kind: NodeKind::Branch(entries),
        }
    }

    #[must_use]
    pub fn ref_count(&self) -> i64 {
        self.refs
    }

    #[must_use]
    pub fn is_leaf(&self) -> bool {
        matches!(self.kind, NodeKind::Leaf(_))
    }

    fn max_key(&self) -> Option<PageId> {
        match &self.kind {
            NodeKind::Leaf(slots) => slots.last().map(|s| s.key),
            NodeKind::Branch(entries) => entries.last().map(|e| e.max_key),
        }
    }
}

/// Result of [`NodeStore::assign`].
#[derive(Debug)]
pub struct AssignOutcome {
    /// Root after the write; differs from the input root when the path was
    /// cloned or the root split. The old root has already been released.
    pub root: NodeId,
    /// Entry previously stored under the key, if any. The caller releases
    /// its page count.
    pub replaced: Option<LeafEntry>,
}

/// Forward cursor over leaf entries in ascending key order, produced by
/// [`NodeStore::locate`].
///
/// The stack tracks the descent path; each frame holds the next position
/// to visit within that node.
#[derive(Debug)]
pub struct Cursor<'a> {
    store: &'a NodeStore,
    stack: Vec<(NodeId, usize)>,
}

impl<'a> Iterator for Cursor<'a> {
    type Item = (PageId, &'a LeafEntry);

    fn next(&mut self) -> Option<Self::Item> {
        let store = self.store;
        loop {
            let (id, idx) = *self.stack.last()?;
            match &store.get(id)?.kind {
                NodeKind::Leaf(slots) => {
                    if idx < slots.len() {
                        if let Some(top) = self.stack.last_mut() {
                            top.1 += 1;
                        }
                        let slot = &slots[idx];
                        return Some((slot.key, &slot.entry));
                    }
                    self.stack.pop();
                }
                NodeKind::Branch(entries) => {
                    if idx < entries.len() {
                        if let Some(top) = self.stack.last_mut() {
                            top.1 += 1;
                        }
                        self.stack.push((entries[idx].child, 0));
                    } else {
                        self.stack.pop();
                    }
                }
            }
        }
    }
}

/// Result of [`NodeStore::remove`].
#[derive(Debug)]
pub struct RemoveOutcome {
    /// Root after the removal (see [`AssignOutcome::root`]).
    pub root: NodeId,
    /// The removed entry, if the key was present. The caller releases its
    /// page count.
    pub removed: Option<LeafEntry>,
}

struct AssignStep {
    node: NodeId,
    replaced: Option<LeafEntry>,
    split: Option<NodeId>,
}

struct RemoveStep {
    node: NodeId,
    empty: bool,
    removed: LeafEntry,
}

/// Arena of tree nodes shared by every version of the store.
#[derive(Debug, Default)]
pub struct NodeStore {
    nodes: HashMap<NodeId, TreeNode>,
}

impl NodeStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    #[must_use]
    pub fn get(&self, id: NodeId) -> Option<&TreeNode> {
        self.nodes.get(&id)
    }

    /// Node lookup that treats absence as an error.
    pub fn node(&self, id: NodeId) -> Result<&TreeNode> {
        self.nodes
            .get(&id)
            .ok_or(StoreError::NodeNotFound { node: id.0 })
    }

    /// Insert a node built elsewhere (image reconstruction). Duplicate ids
    /// are an integrity violation.
    pub fn insert(&mut self, node: TreeNode) -> Result<()> {
        let id = node.id;
        if self.nodes.insert(id, node).is_some() {
            return Err(StoreError::IntegrityViolation {
                detail: format!("tree node {id} registered twice"),
            });
        }
        Ok(())
    }

    /// Increment a node's reference count. Returns false if the id is
    /// unknown.
    pub fn retain_node(&mut self, id: NodeId) -> bool {
        if let Some(node) = self.nodes.get_mut(&id) {
            node.refs += 1;
            true
        } else {
            false
        }
    }

    /// Decrement a node's reference count, freeing it (and cascading into
    /// its subtree) when the count reaches zero. Entries of freed leaves are
    /// pushed onto `released` for the caller to release page counts.
    ///
    /// Nodes still referenced by ancestor versions keep a positive count and
    /// survive untouched.
    pub fn release_node(&mut self, id: NodeId, released: &mut Vec<LeafEntry>) {
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            let freed = match self.nodes.get_mut(&current) {
                Some(node) => {
                    node.refs -= 1;
                    node.refs <= 0
                }
                None => {
                    tracing::error!(node = %current, "release of unknown tree node");
                    false
                }
            };
            if !freed {
                continue;
            }
            if let Some(node) = self.nodes.remove(&current) {
                trace!(node = %current, owner = %node.owner, "freeing tree node");
                match node.kind {
                    NodeKind::Leaf(slots) => {
                        released.extend(slots.into_iter().map(|s| s.entry));
                    }
                    NodeKind::Branch(entries) => {
                        stack.extend(entries.iter().map(|e| e.child));
                    }
                }
            }
        }
    }

    /// Release a whole tree rooted at `root` (post-order teardown of every
    /// node whose count drops to zero).
    pub fn release_tree(&mut self, root: NodeId, released: &mut Vec<LeafEntry>) {
        self.release_node(root, released);
    }

    /// Create an empty tree owned by `owner`; the returned root carries one
    /// reference for the caller.
    pub fn new_tree(&mut self, id: NodeId, owner: VersionId) -> Result<NodeId> {
        let mut leaf = TreeNode::new_leaf(id, owner, Vec::new());
        leaf.refs = 1;
        self.insert(leaf)?;
        Ok(id)
    }

    /// Pure read: locate the entry stored under `key`, following shared
    /// structure. Safe to run concurrently with writers on other versions.
    #[must_use]
    pub fn find(&self, root: NodeId, key: PageId) -> Option<&LeafEntry> {
        let mut id = root;
        loop {
            match &self.nodes.get(&id)?.kind {
                NodeKind::Leaf(slots) => {
                    let pos = slots.partition_point(|s| s.key < key);
                    return (pos < slots.len() && slots[pos].key == key)
                        .then(|| &slots[pos].entry);
                }
                NodeKind::Branch(entries) => {
                    let pos = entries.partition_point(|e| e.max_key < key);
                    if pos == entries.len() {
                        return None;
                    }
                    id = entries[pos].child;
                }
            }
        }
    }

    /// Position a cursor at the first entry whose key is `>= key`; the
    /// cursor then yields entries in ascending key order to the end of the
    /// tree. Like [`NodeStore::find`], a pure read over shared structure.
    pub fn locate(&self, root: NodeId, key: PageId) -> Result<Cursor<'_>> {
        let mut stack = Vec::new();
        let mut id = root;
        loop {
            match &self.node(id)?.kind {
                NodeKind::Leaf(slots) => {
                    let pos = slots.partition_point(|s| s.key < key);
                    stack.push((id, pos));
                    return Ok(Cursor { store: self, stack });
                }
                NodeKind::Branch(entries) => {
                    let pos = entries.partition_point(|e| e.max_key < key);
                    if pos == entries.len() {
                        // Key beyond this subtree; the cursor starts
                        // exhausted below an already-consumed frame.
                        stack.push((id, pos));
                        return Ok(Cursor { store: self, stack });
                    }
                    // Frames store the position after the descent, so the
                    // cursor resumes at the next sibling subtree.
                    stack.push((id, pos + 1));
                    id = entries[pos].child;
                }
            }
        }
    }

    /// Insert or replace the entry under `key` on behalf of `writer`.
    ///
    /// Nodes not owned by `writer` are cloned along the path; the old root
    /// is released internally when the path clones, so the caller only swaps
    /// its root pointer to the returned one. `released` collects entries of
    /// any node freed along the way.
    pub fn assign(
        &mut self,
        root: NodeId,
        writer: VersionId,
        key: PageId,
        entry: LeafEntry,
        next_id: &mut dyn FnMut() -> NodeId,
        released: &mut Vec<LeafEntry>,
    ) -> Result<AssignOutcome> {
        let step = self.assign_rec(root, writer, key, entry, next_id, released)?;
        let mut new_root = step.node;

        if let Some(right) = step.split {
            // Root split: a fresh branch takes over the caller's reference
            // to the left node and the creator reference of the right one.
            let left_max = self.subtree_max_key(step.node)?;
            let right_max = self.subtree_max_key(right)?;
            let root_id = next_id();
            let mut branch = TreeNode::new_branch(
                root_id,
                writer,
                vec![
                    BranchEntry {
                        max_key: left_max,
                        child: step.node,
                    },
                    BranchEntry {
                        max_key: right_max,
                        child: right,
                    },
                ],
            );
            branch.refs = 1;
            self.insert(branch)?;
            new_root = root_id;
        }

        if step.node != root {
            self.release_node(root, released);
        }

        Ok(AssignOutcome {
            root: new_root,
            replaced: step.replaced,
        })
    }

    /// Remove the entry under `key` on behalf of `writer`. A missing key is
    /// not an error; `removed` is `None` and the tree is untouched.
    pub fn remove(
        &mut self,
        root: NodeId,
        writer: VersionId,
        key: PageId,
        next_id: &mut dyn FnMut() -> NodeId,
        released: &mut Vec<LeafEntry>,
    ) -> Result<RemoveOutcome> {
        if self.find(root, key).is_none() {
            return Ok(RemoveOutcome {
                root,
                removed: None,
            });
        }

        let step = self.remove_rec(root, writer, key, next_id, released)?;
        if step.node != root {
            self.release_node(root, released);
        }

        let root_after = if step.empty {
            // The tree became empty; replace the hollow root with a fresh
            // empty leaf owned by the writer.
            self.release_node(step.node, released);
            self.new_tree(next_id(), writer)?
        } else {
            step.node
        };

        Ok(RemoveOutcome {
            root: root_after,
            removed: Some(step.removed),
        })
    }

    // ── Internals ───────────────────────────────────────────────────────────

    /// Return `id` if the node is already owned by `writer`, otherwise clone
    /// it (retaining children or entry pages) and return the clone's id.
    /// A clone starts with one reference for its installer.
    fn make_writable(
        &mut self,
        id: NodeId,
        writer: VersionId,
        next_id: &mut dyn FnMut() -> NodeId,
    ) -> Result<NodeId> {
        let node = self.node(id)?;
        if node.owner == writer {
            return Ok(id);
        }

        let kind = node.kind.clone();
        let clone_id = next_id();
        trace!(node = %id, clone = %clone_id, writer = %writer, "cow clone");

        match &kind {
            NodeKind::Leaf(slots) => {
                for slot in slots {
                    slot.entry.page.retain();
                }
            }
            NodeKind::Branch(entries) => {
                let children: Vec<NodeId> = entries.iter().map(|e| e.child).collect();
                for child in children {
                    self.retain_node(child);
                }
            }
        }

        self.insert(TreeNode {
            id: clone_id,
            owner: writer,
            refs: 1,
            kind,
        })?;
        Ok(clone_id)
    }

    fn subtree_max_key(&self, id: NodeId) -> Result<PageId> {
        self.node(id)?
            .max_key()
            .ok_or_else(|| StoreError::IntegrityViolation {
                detail: format!("tree node {id} is empty and has no max key"),
            })
    }

    fn assign_rec(
        &mut self,
        id: NodeId,
        writer: VersionId,
        key: PageId,
        entry: LeafEntry,
        next_id: &mut dyn FnMut() -> NodeId,
        released: &mut Vec<LeafEntry>,
    ) -> Result<AssignStep> {
        let wid = self.make_writable(id, writer, next_id)?;

        if self.node(wid)?.is_leaf() {
            return self.assign_leaf(wid, key, entry, writer, next_id);
        }

        // Route: first child whose max key covers the search key, or the
        // rightmost child when the key exceeds every separator.
        let (child, idx) = {
            let NodeKind::Branch(entries) = &self.node(wid)?.kind else {
                return Err(StoreError::IntegrityViolation {
                    detail: format!("tree node {wid} changed kind during descent"),
                });
            };
            let pos = entries
                .partition_point(|e| e.max_key < key)
                .min(entries.len().saturating_sub(1));
            (entries[pos].child, pos)
        };

        let step = self.assign_rec(child, writer, key, entry, next_id, released)?;

        let new_max = self.subtree_max_key(step.node)?;
        let right_info = match step.split {
            Some(right) => Some((right, self.subtree_max_key(right)?)),
            None => None,
        };

        let split = {
            let Some(node) = self.nodes.get_mut(&wid) else {
                return Err(StoreError::NodeNotFound { node: wid.0 });
            };
            let NodeKind::Branch(entries) = &mut node.kind else {
                return Err(StoreError::IntegrityViolation {
                    detail: format!("tree node {wid} changed kind during descent"),
                });
            };
            entries[idx].child = step.node;
            entries[idx].max_key = new_max;
            if let Some((right, right_max)) = right_info {
                entries.insert(
                    idx + 1,
                    BranchEntry {
                        max_key: right_max,
                        child: right,
                    },
                );
            }
            if entries.len() > FANOUT {
                let right_entries = entries.split_off(entries.len() / 2);
                Some(right_entries)
            } else {
                None
            }
        };

        if step.node != child {
            self.release_node(child, released);
        }

        let split = match split {
            Some(right_entries) => {
                // Children move into the sibling; their references transfer.
                let right_id = next_id();
                let mut right = TreeNode::new_branch(right_id, writer, right_entries);
                right.refs = 1;
                self.insert(right)?;
                Some(right_id)
            }
            None => None,
        };

        Ok(AssignStep {
            node: wid,
            replaced: step.replaced,
            split,
        })
    }

    fn assign_leaf(
        &mut self,
        wid: NodeId,
        key: PageId,
        entry: LeafEntry,
        writer: VersionId,
        next_id: &mut dyn FnMut() -> NodeId,
    ) -> Result<AssignStep> {
        let (replaced, split_slots) = {
            let Some(node) = self.nodes.get_mut(&wid) else {
                return Err(StoreError::NodeNotFound { node: wid.0 });
            };
            let NodeKind::Leaf(slots) = &mut node.kind else {
                return Err(StoreError::IntegrityViolation {
                    detail: format!("tree node {wid} changed kind during descent"),
                });
            };
            let pos = slots.partition_point(|s| s.key < key);
            let replaced = if pos < slots.len() && slots[pos].key == key {
                Some(std::mem::replace(&mut slots[pos].entry, entry))
            } else {
                slots.insert(pos, LeafSlot { key, entry });
                None
            };
            let split_slots = if slots.len() > FANOUT {
                Some(slots.split_off(slots.len() / 2))
            } else {
                None
            };
            (replaced, split_slots)
        };

        let split = match split_slots {
            Some(right_slots) => {
                let right_id = next_id();
                let mut right = TreeNode::new_leaf(right_id, writer, right_slots);
                right.refs = 1;
                self.insert(right)?;
                Some(right_id)
            }
            None => None,
        };

        Ok(AssignStep {
            node: wid,
            replaced,
            split,
        })
    }

    fn remove_rec(
        &mut self,
        id: NodeId,
        writer: VersionId,
        key: PageId,
        next_id: &mut dyn FnMut() -> NodeId,
        released: &mut Vec<LeafEntry>,
    ) -> Result<RemoveStep> {
        let wid = self.make_writable(id, writer, next_id)?;

        if self.node(wid)?.is_leaf() {
            let Some(node) = self.nodes.get_mut(&wid) else {
                return Err(StoreError::NodeNotFound { node: wid.0 });
            };
            let NodeKind::Leaf(slots) = &mut node.kind else {
                return Err(StoreError::IntegrityViolation {
                    detail: format!("tree node {wid} changed kind during descent"),
                });
            };
            let pos = slots.partition_point(|s| s.key < key);
            if pos >= slots.len() || slots[pos].key != key {
                return Err(StoreError::IntegrityViolation {
                    detail: format!("key {key} vanished during removal descent"),
                });
            }
            let removed = slots.remove(pos).entry;
            let empty = slots.is_empty();
            return Ok(RemoveStep {
                node: wid,
                empty,
                removed,
            });
        }

        let (child, idx) = {
            let NodeKind::Branch(entries) = &self.node(wid)?.kind else {
                return Err(StoreError::IntegrityViolation {
                    detail: format!("tree node {wid} changed kind during descent"),
                });
            };
            let pos = entries.partition_point(|e| e.max_key < key);
            if pos == entries.len() {
                return Err(StoreError::IntegrityViolation {
                    detail: format!("key {key} vanished during removal descent"),
                });
            }
            (entries[pos].child, pos)
        };

        let step = self.remove_rec(child, writer, key, next_id, released)?;

        if step.node != child {
            let Some(node) = self.nodes.get_mut(&wid) else {
                return Err(StoreError::NodeNotFound { node: wid.0 });
            };
            let NodeKind::Branch(entries) = &mut node.kind else {
                return Err(StoreError::IntegrityViolation {
                    detail: format!("tree node {wid} changed kind during descent"),
                });
            };
            entries[idx].child = step.node;
            self.release_node(child, released);
        }

        let empty = if step.empty {
            self.release_node(step.node, released);
            let Some(node) = self.nodes.get_mut(&wid) else {
                return Err(StoreError::NodeNotFound { node: wid.0 });
            };
            let NodeKind::Branch(entries) = &mut node.kind else {
                return Err(StoreError::IntegrityViolation {
                    detail: format!("tree node {wid} changed kind during descent"),
                });
            };
            entries.remove(idx);
            entries.is_empty()
        } else {
            let new_max = self.subtree_max_key(step.node)?;
            let Some(node) = self.nodes.get_mut(&wid) else {
                return Err(StoreError::NodeNotFound { node: wid.0 });
            };
            let NodeKind::Branch(entries) = &mut node.kind else {
                return Err(StoreError::IntegrityViolation {
                    detail: format!("tree node {wid} changed kind during descent"),
                });
            };
            entries[idx].max_key = new_max;
            false
        };

        Ok(RemoveStep {
            node: wid,
            empty,
            removed: step.removed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pv_page::Page;
    use pv_types::{CtrTypeTag, PageTypeTag};

    const CTR: CtrTypeTag = CtrTypeTag(1);
    const PT: PageTypeTag = PageTypeTag(1);

    fn entry(page_id: u128, owner: VersionId, fill: u8) -> LeafEntry {
        let mut page = Page::zeroed(PageId(page_id), CTR, PT, 8);
        page.set_bytes(vec![fill; 8]);
        LeafEntry {
            page: SharedPage::new(page),
            owner,
        }
    }

    struct Ids(u128);

    impl Ids {
        fn next(&mut self) -> NodeId {
            self.0 += 1;
            NodeId(self.0)
        }
    }

    #[test]
    fn insert_and_find_single_version() {
        let mut store = NodeStore::new();
        let mut ids = Ids(1000);
        let v1 = VersionId(1);
        let mut root = store.new_tree(ids.next(), v1).expect("new tree");
        let mut released = Vec::new();

        for key in [5_u128, 1, 9, 3] {
            let outcome = store
                .assign(
                    root,
                    v1,
                    PageId(key),
                    entry(key, v1, key as u8),
                    &mut || ids.next(),
                    &mut released,
                )
                .expect("assign");
            assert!(outcome.replaced.is_none());
            root = outcome.root;
        }

        assert!(released.is_empty());
        for key in [1_u128, 3, 5, 9] {
            let found = store.find(root, PageId(key)).expect("present");
            assert_eq!(found.page.id(), PageId(key));
            assert_eq!(found.owner, v1);
        }
        assert!(store.find(root, PageId(7)).is_none());
    }

    #[test]
    fn splits_preserve_all_keys() {
        let mut store = NodeStore::new();
        let mut ids = Ids(1000);
        let v1 = VersionId(1);
        let mut root = store.new_tree(ids.next(), v1).expect("new tree");
        let mut released = Vec::new();

        let count = FANOUT * FANOUT / 2;
        for key in 1..=count as u128 {
            let outcome = store
                .assign(
                    root,
                    v1,
                    PageId(key),
                    entry(key, v1, 0),
                    &mut || ids.next(),
                    &mut released,
                )
                .expect("assign");
            root = outcome.root;
        }

        assert!(!store.node(root).expect("root").is_leaf());
        for key in 1..=count as u128 {
            assert!(store.find(root, PageId(key)).is_some(), "missing {key}");
        }
        assert!(store.find(root, PageId(count as u128 + 1)).is_none());
    }

    #[test]
    fn cow_write_leaves_other_version_untouched() {
        let mut store = NodeStore::new();
        let mut ids = Ids(1000);
        let (v1, v2) = (VersionId(1), VersionId(2));
        let mut root1 = store.new_tree(ids.next(), v1).expect("new tree");
        let mut released = Vec::new();

        for key in [10_u128, 20] {
            root1 = store
                .assign(
                    root1,
                    v1,
                    PageId(key),
                    entry(key, v1, 1),
                    &mut || ids.next(),
                    &mut released,
                )
                .expect("assign")
                .root;
        }

        // Fork: v2 shares v1's root by reference.
        store.retain_node(root1);
        let outcome = store
            .assign(
                root1,
                v2,
                PageId(20),
                entry(20, v2, 2),
                &mut || ids.next(),
                &mut released,
            )
            .expect("assign v2");
        let root2 = outcome.root;
        let replaced = outcome.replaced.expect("old entry returned");
        replaced.page.release();

        assert_ne!(root1, root2, "path must clone");

        let old = store.find(root1, PageId(20)).expect("v1 view intact");
        let new = store.find(root2, PageId(20)).expect("v2 view updated");
        assert_eq!(old.owner, v1);
        assert_eq!(new.owner, v2);
        assert_eq!(old.page.read().bytes(), &[1; 8]);
        assert_eq!(new.page.read().bytes(), &[2; 8]);
        assert!(!old.page.same_page(&new.page));
    }

    #[test]
    fn cow_clone_retains_untouched_sibling_pages() {
        let mut store = NodeStore::new();
        let mut ids = Ids(1000);
        let (v1, v2) = (VersionId(1), VersionId(2));
        let mut root1 = store.new_tree(ids.next(), v1).expect("new tree");
        let mut released = Vec::new();

        root1 = store
            .assign(
                root1,
                v1,
                PageId(10),
                entry(10, v1, 1),
                &mut || ids.next(),
                &mut released,
            )
            .expect("assign")
            .root;
        root1 = store
            .assign(
                root1,
                v1,
                PageId(20),
                entry(20, v1, 1),
                &mut || ids.next(),
                &mut released,
            )
            .expect("assign")
            .root;

        let untouched = store
            .find(root1, PageId(10))
            .expect("present")
            .page
            .clone();
        assert_eq!(untouched.ref_count(), 1);

        store.retain_node(root1);
        let outcome = store
            .assign(
                root1,
                v2,
                PageId(20),
                entry(20, v2, 2),
                &mut || ids.next(),
                &mut released,
            )
            .expect("assign v2");
        if let Some(old) = outcome.replaced {
            old.page.release();
        }

        // Both versions' leaves now reference page 10: one entry each.
        assert_eq!(untouched.ref_count(), 2);
        let via_v2 = store.find(outcome.root, PageId(10)).expect("shared");
        assert!(via_v2.page.same_page(&untouched));
    }

    #[test]
    fn locate_scans_forward_in_key_order() {
        let mut store = NodeStore::new();
        let mut ids = Ids(1000);
        let v1 = VersionId(1);
        let mut root = store.new_tree(ids.next(), v1).expect("new tree");
        let mut released = Vec::new();

        // Odd keys only, enough of them to force a multi-level tree.
        let count = (FANOUT * 3) as u128;
        for key in (1..=count * 2).step_by(2) {
            root = store
                .assign(
                    root,
                    v1,
                    PageId(key),
                    entry(key, v1, 0),
                    &mut || ids.next(),
                    &mut released,
                )
                .expect("assign")
                .root;
        }

        // From the very start: every key, in order.
        let all: Vec<u128> = store
            .locate(root, PageId(0))
            .expect("locate")
            .map(|(k, _)| k.0)
            .collect();
        let expected: Vec<u128> = (1..=count * 2).step_by(2).collect();
        assert_eq!(all, expected);

        // An absent key positions at the next larger one.
        let mut cursor = store.locate(root, PageId(8)).expect("locate");
        let (key, found) = cursor.next().expect("positioned");
        assert_eq!(key, PageId(9));
        assert_eq!(found.page.id(), PageId(9));
        assert_eq!(cursor.next().expect("step").0, PageId(11));

        // Past the last key: nothing to yield.
        let mut past = store.locate(root, PageId(count * 2 + 1)).expect("locate");
        assert!(past.next().is_none());
    }

    #[test]
    fn remove_missing_key_is_noop() {
        let mut store = NodeStore::new();
        let mut ids = Ids(1000);
        let v1 = VersionId(1);
        let root = store.new_tree(ids.next(), v1).expect("new tree");
        let mut released = Vec::new();

        let outcome = store
            .remove(root, v1, PageId(42), &mut || ids.next(), &mut released)
            .expect("remove");
        assert!(outcome.removed.is_none());
        assert_eq!(outcome.root, root);
        assert!(released.is_empty());
    }

    #[test]
    fn remove_last_key_yields_empty_but_valid_tree() {
        let mut store = NodeStore::new();
        let mut ids = Ids(1000);
        let v1 = VersionId(1);
        let mut root = store.new_tree(ids.next(), v1).expect("new tree");
        let mut released = Vec::new();

        root = store
            .assign(
                root,
                v1,
                PageId(7),
                entry(7, v1, 3),
                &mut || ids.next(),
                &mut released,
            )
            .expect("assign")
            .root;

        let outcome = store
            .remove(root, v1, PageId(7), &mut || ids.next(), &mut released)
            .expect("remove");
        let removed = outcome.removed.expect("entry came back");
        assert_eq!(removed.page.release(), 0);

        assert!(store.find(outcome.root, PageId(7)).is_none());
        // Further writes to the empty tree still work.
        let again = store
            .assign(
                outcome.root,
                v1,
                PageId(8),
                entry(8, v1, 4),
                &mut || ids.next(),
                &mut released,
            )
            .expect("assign after empty");
        assert!(store.find(again.root, PageId(8)).is_some());
    }

    #[test]
    fn release_tree_frees_only_unshared_nodes() {
        let mut store = NodeStore::new();
        let mut ids = Ids(1000);
        let (v1, v2) = (VersionId(1), VersionId(2));
        let mut root1 = store.new_tree(ids.next(), v1).expect("new tree");
        let mut released = Vec::new();

        for key in [1_u128, 2, 3] {
            root1 = store
                .assign(
                    root1,
                    v1,
                    PageId(key),
                    entry(key, v1, 1),
                    &mut || ids.next(),
                    &mut released,
                )
                .expect("assign")
                .root;
        }
        let nodes_before_fork = store.len();

        store.retain_node(root1);
        let outcome = store
            .assign(
                root1,
                v2,
                PageId(2),
                entry(2, v2, 2),
                &mut || ids.next(),
                &mut released,
            )
            .expect("assign v2");
        if let Some(old) = outcome.replaced {
            old.page.release();
        }
        let root2 = outcome.root;

        // Tear down v2's tree: its clones go away, v1's nodes survive.
        let mut torn = Vec::new();
        store.release_tree(root2, &mut torn);
        for e in torn {
            e.page.release();
        }
        assert_eq!(store.len(), nodes_before_fork);
        for key in [1_u128, 2, 3] {
            let found = store.find(root1, PageId(key)).expect("v1 intact");
            assert_eq!(found.page.ref_count(), 1, "share fully unwound");
            assert_eq!(found.page.read().bytes(), &[1; 8]);
        }
    }
}
