//! Shared allocator state: the version graph, the node arena, and the
//! active-write latch. Everything here is reached through one
//! [`parking_lot::Mutex`], so none of it synchronizes on its own.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use pv_error::{Result, StoreError};
use pv_page::PageTypeRegistry;
use pv_tree::{LeafEntry, NodeStore};
use pv_types::{NodeId, PageId, SnapshotStatus, VersionId};
use tracing::{debug, error};

/// Generate a non-zero random id. Zero is the wire sentinel for "none".
pub(crate) fn fresh_id() -> u128 {
    loop {
        let id: u128 = rand::random();
        if id != 0 {
            return id;
        }
    }
}

/// One vertex of the version graph.
#[derive(Debug)]
pub(crate) struct HistoryNode {
    pub version: VersionId,
    pub parent: Option<VersionId>,
    pub children: Vec<VersionId>,
    pub status: SnapshotStatus,
    /// Root of this version's page tree; `None` once the data was freed.
    pub root: Option<NodeId>,
    /// Default container root, addressed by the empty name.
    pub root_page: Option<PageId>,
    pub metadata: String,
    /// Live snapshot handles bound to this vertex.
    pub ext_refs: i64,
}

/// Allocator state behind the store-wide mutex.
pub(crate) struct AllocatorState {
    pub history: HashMap<VersionId, HistoryNode>,
    pub history_root: VersionId,
    pub master: VersionId,
    pub named: HashMap<String, VersionId>,
    pub nodes: NodeStore,
    /// Number of versions currently in `Active` status. `store` waits on
    /// the condvar until this reaches zero.
    pub active_writes: u64,
}

/// The allocator and every snapshot handle share one of these.
pub(crate) struct StoreShared {
    pub state: Mutex<AllocatorState>,
    pub idle: Condvar,
    /// Immutable after construction, so it lives outside the mutex.
    pub registry: PageTypeRegistry,
}

impl AllocatorState {
    pub fn node(&self, version: VersionId) -> Result<&HistoryNode> {
        self.history
            .get(&version)
            .ok_or(StoreError::VersionNotFound { version: version.0 })
    }

    pub fn node_mut(&mut self, version: VersionId) -> Result<&mut HistoryNode> {
        self.history
            .get_mut(&version)
            .ok_or(StoreError::VersionNotFound { version: version.0 })
    }

    /// Whether a name pointer (master or a named branch) targets `version`.
    pub fn is_name_target(&self, version: VersionId) -> bool {
        self.master == version || self.named.values().any(|v| *v == version)
    }

    /// Drop every page reference collected from a freed tree region. Only
    /// called on paths that cannot report errors, so a count underflow is
    /// logged instead of returned.
    pub fn release_collected(released: Vec<LeafEntry>) {
        for entry in released {
            let count = entry.page.release();
            if count < 0 {
                error!(page = %entry.page.id(), count, "page reference count went negative");
            }
        }
    }

    /// Release the version's page tree and clear its root. Idempotent.
    pub fn free_version_data(&mut self, version: VersionId) {
        let Some(node) = self.history.get_mut(&version) else {
            return;
        };
        let Some(root) = node.root.take() else {
            return;
        };
        let mut released = Vec::new();
        self.nodes.release_tree(root, &mut released);
        Self::release_collected(released);
        debug!(version = %version, "freed version data");
    }

    /// Free the version's data and unlink the vertex from the graph. The
    /// vertex must have no children.
    pub fn remove_version(&mut self, version: VersionId) {
        self.free_version_data(version);
        let parent = self.history.get(&version).and_then(|n| n.parent);
        if let Some(parent) = parent
            && let Some(parent_node) = self.history.get_mut(&parent)
        {
            parent_node.children.retain(|c| *c != version);
        }
        self.history.remove(&version);
        debug!(version = %version, "removed version vertex");
    }

    /// Repoint master and any named branch targeting `version` at its
    /// nearest committed ancestor (the history root as a last resort).
    pub fn adjust_name_targets(&mut self, version: VersionId) {
        if !self.is_name_target(version) {
            return;
        }
        let mut target = self.history_root;
        let mut cursor = self.history.get(&version).and_then(|n| n.parent);
        while let Some(v) = cursor {
            match self.history.get(&v) {
                Some(n) if n.status == SnapshotStatus::Committed => {
                    target = v;
                    break;
                }
                Some(n) => cursor = n.parent,
                None => break,
            }
        }
        if self.master == version {
            self.master = target;
        }
        for v in self.named.values_mut() {
            if *v == version {
                *v = target;
            }
        }
        debug!(from = %version, to = %target, "repointed name targets");
    }

    /// Excise every terminal vertex: dropped with no children, or already
    /// stripped of data, provided no handle and no name pointer holds it.
    /// A single-child vertex is spliced so its child keeps the lineage.
    pub fn pack(&mut self) {
        self.pack_from(self.history_root);
    }

    fn pack_from(&mut self, version: VersionId) {
        let children = match self.history.get(&version) {
            Some(node) => node.children.clone(),
            None => return,
        };
        for child in children {
            self.pack_from(child);
        }
        if version == self.history_root {
            return;
        }
        let Some(node) = self.history.get(&version) else {
            return;
        };
        if node.ext_refs > 0 || self.is_name_target(version) {
            return;
        }
        let terminal = (node.status == SnapshotStatus::Dropped && node.children.is_empty())
            || node.root.is_none();
        if !terminal {
            return;
        }
        match node.children.len() {
            0 => self.remove_version(version),
            1 => self.splice_version(version),
            _ => {}
        }
    }

    /// Replace `version` with its only child in the parent's child list.
    fn splice_version(&mut self, version: VersionId) {
        let (parent, child) = match self.history.get(&version) {
            Some(node) => match (node.parent, node.children.first().copied()) {
                (Some(p), Some(c)) => (p, c),
                _ => return,
            },
            None => return,
        };
        self.free_version_data(version);
        if let Some(parent_node) = self.history.get_mut(&parent) {
            for slot in &mut parent_node.children {
                if *slot == version {
                    *slot = child;
                }
            }
        }
        if let Some(child_node) = self.history.get_mut(&child) {
            child_node.parent = Some(parent);
        }
        self.history.remove(&version);
        debug!(version = %version, child = %child, "spliced version out of the graph");
    }

    /// Human-readable dump of the version graph and name pointers.
    pub fn describe(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "master: {}", self.master);
        let mut names: Vec<_> = self.named.iter().collect();
        names.sort_by(|a, b| a.0.cmp(b.0));
        for (name, version) in names {
            let _ = writeln!(out, "branch {name:?}: {version}");
        }
        self.describe_from(self.history_root, 0, &mut out);
        out
    }

    fn describe_from(&self, version: VersionId, depth: usize, out: &mut String) {
        let Some(node) = self.history.get(&version) else {
            let _ = writeln!(out, "{:indent$}{version} <missing>", "", indent = depth * 2);
            return;
        };
        let data = if node.root.is_some() { "data" } else { "no data" };
        let _ = writeln!(
            out,
            "{:indent$}{version} [{}] {data} refs={} meta={:?}",
            "",
            node.status,
            node.ext_refs,
            node.metadata,
            indent = depth * 2,
        );
        for child in &node.children {
            self.describe_from(*child, depth + 1, out);
        }
    }
}

impl StoreShared {
    /// Open a snapshot handle on `version`. Only committed vertices and
    /// data-locked vertices with no other handle may be opened this way;
    /// active and dropped vertices are rejected.
    pub fn open(self: &Arc<Self>, version: VersionId, op: &'static str) -> Result<crate::snapshot::Snapshot> {
        let mut state = self.state.lock();
        let node = state.node_mut(version)?;
        let allowed = match node.status {
            SnapshotStatus::Committed => true,
            SnapshotStatus::DataLocked => node.ext_refs == 0,
            SnapshotStatus::Active | SnapshotStatus::Dropped => false,
        };
        if !allowed {
            return Err(StoreError::InvalidState {
                op,
                detail: format!("version {version} is {}", node.status),
            });
        }
        node.ext_refs += 1;
        drop(state);
        Ok(crate::snapshot::Snapshot::bind(Arc::clone(self), version))
    }
}
