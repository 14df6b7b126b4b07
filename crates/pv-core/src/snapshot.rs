//! Snapshot handles and the page access protocol.
//!
//! A [`Snapshot`] binds one version-graph vertex. Reads follow shared tree
//! structure; the first update of a page under an active snapshot copies it
//! (same id, fresh storage) so sibling versions never observe the write.
//! Every handle keeps a private page cache so repeated access to a page
//! returns the same [`SharedPage`] without re-walking the tree.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use pv_error::{Result, StoreError};
use pv_page::{Page, SharedPage};
use pv_tree::LeafEntry;
use pv_types::{CtrTypeTag, NodeId, PageId, PageTypeTag, SnapshotStatus, VersionId};
use tracing::{debug, error, trace};

use crate::directory::{self, DIRECTORY_PAGE_ID};
use crate::state::{AllocatorState, StoreShared, fresh_id};

/// Cache classification of a page inside one snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageState {
    /// Loaded through shared structure; the storage belongs to an ancestor.
    Read,
    /// Created or copied by this snapshot; writes go straight through.
    Update,
    /// Marked for removal; the tree entry goes away when the page is
    /// released from the cache or the snapshot commits.
    PendingDelete,
}

#[derive(Clone)]
struct CachedPage {
    page: SharedPage,
    state: PageState,
}

/// Handle on one version of the store.
///
/// The handle is `Send + Sync`; the embedded cache is for `&self`
/// ergonomics, not for sharing a handle across writers.
pub struct Snapshot {
    shared: Arc<StoreShared>,
    version: VersionId,
    cache: Mutex<HashMap<PageId, CachedPage>>,
}

impl std::fmt::Debug for Snapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Snapshot")
            .field("version", &self.version)
            .finish_non_exhaustive()
    }
}

impl Snapshot {
    pub(crate) fn bind(shared: Arc<StoreShared>, version: VersionId) -> Self {
        Self {
            shared,
            version,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Version id of the bound vertex.
    #[must_use]
    pub fn version(&self) -> VersionId {
        self.version
    }

    /// Current lifecycle status of the bound vertex.
    pub fn status(&self) -> Result<SnapshotStatus> {
        let state = self.shared.state.lock();
        Ok(state.node(self.version)?.status)
    }

    pub fn metadata(&self) -> Result<String> {
        let state = self.shared.state.lock();
        Ok(state.node(self.version)?.metadata.clone())
    }

    /// Attach operator metadata to the bound vertex. Requires a writable
    /// snapshot; the text is persisted with the version graph.
    pub fn set_metadata(&self, metadata: impl Into<String>) -> Result<()> {
        let mut state = self.shared.state.lock();
        self.check_writable(&state, "set_metadata")?;
        state.node_mut(self.version)?.metadata = metadata.into();
        Ok(())
    }

    /// Cache classification of `page`, if the snapshot has touched it.
    #[must_use]
    pub fn page_state(&self, page: PageId) -> Option<PageState> {
        self.cache.lock().get(&page).map(|c| c.state)
    }

    /// One-line summary of the bound vertex.
    pub fn describe(&self) -> Result<String> {
        let state = self.shared.state.lock();
        let node = state.node(self.version)?;
        Ok(format!(
            "{} [{}] parent={} children={} refs={}",
            node.version,
            node.status,
            node.parent.map_or_else(|| "none".to_owned(), |p| p.to_string()),
            node.children.len(),
            node.ext_refs,
        ))
    }

    /// Draw an unused page id without creating a page.
    #[must_use]
    pub fn new_page_id(&self) -> PageId {
        PageId(fresh_id())
    }

    // ── Page access ─────────────────────────────────────────────────────────

    /// Load the page for reading. The returned handle shares storage with
    /// whichever version owns the page; do not write through it.
    pub fn get_page(&self, id: PageId) -> Result<SharedPage> {
        let mut cache = self.cache.lock();
        if let Some(cached) = cache.get(&id) {
            if cached.state == PageState::PendingDelete {
                return Err(StoreError::PageNotFound { page: id.0 });
            }
            return Ok(cached.page.clone());
        }

        let state = self.shared.state.lock();
        let root = Self::tree_root(&state, self.version)?;
        let entry = state
            .nodes
            .find(root, id)
            .ok_or(StoreError::PageNotFound { page: id.0 })?;
        let page_state = if entry.owner == self.version {
            PageState::Update
        } else {
            PageState::Read
        };
        let page = entry.page.clone();
        drop(state);

        trace!(version = %self.version, page = %id, state = ?page_state, "page loaded");
        cache.insert(id, CachedPage { page: page.clone(), state: page_state });
        Ok(page)
    }

    /// Load the page for writing. If the page belongs to an ancestor
    /// version it is copied first (same id, fresh storage) and the copy is
    /// installed in this version's tree; the shared original is released.
    pub fn get_page_for_update(&self, id: PageId) -> Result<SharedPage> {
        let mut cache = self.cache.lock();
        if let Some(cached) = cache.get(&id) {
            match cached.state {
                PageState::Update => return Ok(cached.page.clone()),
                PageState::PendingDelete => {
                    return Err(StoreError::PageNotFound { page: id.0 });
                }
                PageState::Read => {}
            }
        }

        let mut state = self.shared.state.lock();
        self.check_active(&state, "get_page_for_update")?;
        let root = Self::tree_root(&state, self.version)?;
        let entry = state
            .nodes
            .find(root, id)
            .cloned()
            .ok_or(StoreError::PageNotFound { page: id.0 })?;

        let page = if entry.owner == self.version {
            entry.page
        } else {
            let copy = SharedPage::new(entry.page.read().duplicate_as(id));
            self.assign_entry(&mut state, id, copy.clone(), self.version)?;
            trace!(version = %self.version, page = %id, "copied page for update");
            copy
        };
        drop(state);

        cache.insert(id, CachedPage { page: page.clone(), state: PageState::Update });
        Ok(page)
    }

    /// Create a zero-filled page of `size` bytes under a fresh id.
    pub fn create_page(
        &self,
        size: u32,
        ctr_type: CtrTypeTag,
        page_type: PageTypeTag,
    ) -> Result<SharedPage> {
        let mut cache = self.cache.lock();
        let mut state = self.shared.state.lock();
        self.check_active(&state, "create_page")?;
        let root = Self::tree_root(&state, self.version)?;

        let mut id = PageId(fresh_id());
        while id == DIRECTORY_PAGE_ID || state.nodes.find(root, id).is_some() {
            id = PageId(fresh_id());
        }

        let page = SharedPage::new(Page::zeroed(id, ctr_type, page_type, size));
        self.assign_entry(&mut state, id, page.clone(), self.version)?;
        drop(state);

        debug!(version = %self.version, page = %id, size, "created page");
        cache.insert(id, CachedPage { page: page.clone(), state: PageState::Update });
        Ok(page)
    }

    /// Copy an existing page's bytes under a new id owned by this version.
    /// `target` must be unused; `None` draws a fresh id.
    pub fn clone_page(&self, source: PageId, target: Option<PageId>) -> Result<SharedPage> {
        let mut cache = self.cache.lock();
        if cache.get(&source).is_some_and(|c| c.state == PageState::PendingDelete) {
            return Err(StoreError::PageNotFound { page: source.0 });
        }

        let mut state = self.shared.state.lock();
        self.check_active(&state, "clone_page")?;
        let root = Self::tree_root(&state, self.version)?;
        let entry = state
            .nodes
            .find(root, source)
            .cloned()
            .ok_or(StoreError::PageNotFound { page: source.0 })?;

        let id = match target {
            Some(id) => {
                if id == DIRECTORY_PAGE_ID || state.nodes.find(root, id).is_some() {
                    return Err(StoreError::InvalidState {
                        op: "clone_page",
                        detail: format!("target page {id} already exists"),
                    });
                }
                id
            }
            None => {
                let mut id = PageId(fresh_id());
                while id == DIRECTORY_PAGE_ID || state.nodes.find(root, id).is_some() {
                    id = PageId(fresh_id());
                }
                id
            }
        };

        let page = SharedPage::new(entry.page.read().duplicate_as(id));
        self.assign_entry(&mut state, id, page.clone(), self.version)?;
        drop(state);

        debug!(version = %self.version, source = %source, page = %id, "cloned page");
        cache.insert(id, CachedPage { page: page.clone(), state: PageState::Update });
        Ok(page)
    }

    /// Resize the page buffer through its registered payload operations.
    /// Copies the page into this version first if it is shared.
    pub fn resize_page(&self, id: PageId, new_size: u32) -> Result<()> {
        let handle = self.get_page_for_update(id)?;
        let (ctr_type, page_type) = {
            let guard = handle.read();
            (guard.ctr_type(), guard.page_type())
        };
        let ops = Arc::clone(self.shared.registry.lookup(ctr_type, page_type)?);
        ops.resize(&mut handle.write(), new_size)
    }

    /// Mark the page for deletion. A cached page is removed from the tree
    /// when it leaves the cache (release or commit); an uncached page is
    /// removed immediately.
    pub fn remove_page(&self, id: PageId) -> Result<()> {
        let mut cache = self.cache.lock();
        if let Some(cached) = cache.get_mut(&id) {
            if cached.state == PageState::PendingDelete {
                return Err(StoreError::PageNotFound { page: id.0 });
            }
            cached.state = PageState::PendingDelete;
            return Ok(());
        }

        let mut state = self.shared.state.lock();
        self.check_active(&state, "remove_page")?;
        self.remove_now(&mut state, id)
    }

    /// Evict the page from this snapshot's cache, completing a pending
    /// deletion if one was marked. Unknown ids are a no-op.
    pub fn release_page(&self, id: PageId) -> Result<()> {
        let mut cache = self.cache.lock();
        let Some(cached) = cache.remove(&id) else {
            return Ok(());
        };
        if cached.state == PageState::PendingDelete {
            let mut state = self.shared.state.lock();
            self.check_writable(&state, "release_page")?;
            self.remove_now(&mut state, id)?;
        }
        Ok(())
    }

    // ── Container roots ─────────────────────────────────────────────────────

    /// Root page of the container registered under `name`. The empty name
    /// addresses the version's default root.
    pub fn root(&self, name: &str) -> Result<PageId> {
        let state = self.shared.state.lock();
        if name.is_empty() {
            return state
                .node(self.version)?
                .root_page
                .ok_or_else(|| StoreError::RootNotFound { name: String::new() });
        }
        self.directory_read(&state)?
            .get(name)
            .copied()
            .ok_or_else(|| StoreError::RootNotFound { name: name.to_owned() })
    }

    pub fn has_root(&self, name: &str) -> Result<bool> {
        match self.root(name) {
            Ok(_) => Ok(true),
            Err(StoreError::RootNotFound { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Register (or with `None`, unregister) a container root under `name`.
    pub fn set_root(&self, name: &str, root: Option<PageId>) -> Result<()> {
        let mut state = self.shared.state.lock();
        self.check_active(&state, "set_root")?;
        if name.is_empty() {
            state.node_mut(self.version)?.root_page = root;
            return Ok(());
        }
        let mut map = self.directory_read(&state)?;
        match root {
            Some(root) => {
                map.insert(name.to_owned(), root);
            }
            None => {
                map.remove(name);
            }
        }
        self.directory_write(&mut state, &map)
    }

    /// Names of all registered container roots, sorted.
    pub fn root_names(&self) -> Result<Vec<String>> {
        let state = self.shared.state.lock();
        Ok(self.directory_read(&state)?.into_keys().collect())
    }

    // ── Lifecycle ───────────────────────────────────────────────────────────

    /// Seal the snapshot. Pending deletions are applied first; afterwards
    /// the version is immutable and visible to `branch` and `find`.
    pub fn commit(&self) -> Result<()> {
        let mut cache = self.cache.lock();
        let mut state = self.shared.state.lock();
        let status = state.node(self.version)?.status;
        if !matches!(status, SnapshotStatus::Active | SnapshotStatus::DataLocked) {
            return Err(StoreError::InvalidState {
                op: "commit",
                detail: format!("snapshot {} is {status}", self.version),
            });
        }

        let pending: Vec<PageId> = cache
            .iter()
            .filter(|(_, c)| c.state == PageState::PendingDelete)
            .map(|(id, _)| *id)
            .collect();
        for id in pending {
            self.remove_now(&mut state, id)?;
        }
        cache.clear();

        state.node_mut(self.version)?.status = SnapshotStatus::Committed;
        if status == SnapshotStatus::Active {
            state.active_writes = state.active_writes.saturating_sub(1);
        }
        drop(state);
        drop(cache);
        self.shared.idle.notify_all();
        debug!(version = %self.version, "committed snapshot");
        Ok(())
    }

    /// Drop the version. Its data is freed once the last handle goes away;
    /// the vertex itself stays until `pack` excises it. The history root
    /// cannot be dropped.
    pub fn discard(&self) -> Result<()> {
        let mut cache = self.cache.lock();
        let mut state = self.shared.state.lock();
        let node = state.node(self.version)?;
        if node.parent.is_none() {
            return Err(StoreError::InvalidState {
                op: "discard",
                detail: "the history root cannot be dropped".to_owned(),
            });
        }
        let status = node.status;
        if !matches!(status, SnapshotStatus::Active | SnapshotStatus::DataLocked) {
            return Err(StoreError::InvalidState {
                op: "discard",
                detail: format!("snapshot {} is {status}", self.version),
            });
        }

        state.node_mut(self.version)?.status = SnapshotStatus::Dropped;
        if status == SnapshotStatus::Active {
            state.active_writes = state.active_writes.saturating_sub(1);
        }
        state.adjust_name_targets(self.version);
        cache.clear();
        drop(state);
        drop(cache);
        self.shared.idle.notify_all();
        debug!(version = %self.version, "dropped snapshot");
        Ok(())
    }

    /// Freeze the snapshot for import: no further page creation or updates
    /// through the normal write path, but `import_container_from` and
    /// `copy_container_from` still apply. Commit ends the state as usual.
    pub fn lock_data_for_import(&self) -> Result<()> {
        let mut state = self.shared.state.lock();
        let node = state.node_mut(self.version)?;
        if node.status != SnapshotStatus::Active {
            return Err(StoreError::InvalidState {
                op: "lock_data_for_import",
                detail: format!("snapshot {} is {}", self.version, node.status),
            });
        }
        node.status = SnapshotStatus::DataLocked;
        state.active_writes = state.active_writes.saturating_sub(1);
        drop(state);
        self.shared.idle.notify_all();
        debug!(version = %self.version, "data-locked snapshot");
        Ok(())
    }

    /// Open a writable child of this snapshot. The child starts with the
    /// parent's tree root (shared, retained); no page data is copied.
    pub fn branch(&self) -> Result<Snapshot> {
        let cache_empty = self.cache.lock().is_empty();
        let mut state = self.shared.state.lock();
        let node = state.node(self.version)?;
        match node.status {
            SnapshotStatus::Committed => {}
            SnapshotStatus::DataLocked if cache_empty => {}
            status => {
                return Err(StoreError::InvalidState {
                    op: "branch",
                    detail: format!("snapshot {} is {status}", self.version),
                });
            }
        }
        let parent_root = node.root.ok_or_else(|| StoreError::InvalidState {
            op: "branch",
            detail: format!("version {} has no data", self.version),
        })?;
        let root_page = node.root_page;

        let child = VersionId(fresh_id());
        if !state.nodes.retain_node(parent_root) {
            return Err(StoreError::NodeNotFound { node: parent_root.0 });
        }
        state.history.insert(
            child,
            crate::state::HistoryNode {
                version: child,
                parent: Some(self.version),
                children: Vec::new(),
                status: SnapshotStatus::Active,
                root: Some(parent_root),
                root_page,
                metadata: String::new(),
                ext_refs: 1,
            },
        );
        state.node_mut(self.version)?.children.push(child);
        state.active_writes += 1;
        drop(state);

        debug!(parent = %self.version, version = %child, "branched snapshot");
        Ok(Snapshot::bind(Arc::clone(&self.shared), child))
    }

    /// Open a handle on the parent version, subject to the same status
    /// rules as `Allocator::find`.
    pub fn parent(&self) -> Result<Snapshot> {
        let parent = {
            let state = self.shared.state.lock();
            state
                .node(self.version)?
                .parent
                .ok_or_else(|| StoreError::InvalidState {
                    op: "parent",
                    detail: "the history root has no parent".to_owned(),
                })?
        };
        self.shared.open(parent, "parent")
    }

    // ── Container transfer ──────────────────────────────────────────────────

    /// Share the container registered under `name` in `source` into this
    /// snapshot. Pages are not copied; each one's reference count grows by
    /// the new share. Both snapshots must belong to the same store.
    pub fn import_container_from(&self, source: &Snapshot, name: &str) -> Result<()> {
        if !Arc::ptr_eq(&self.shared, &source.shared) {
            return Err(StoreError::Unsupported {
                detail: "import_container_from requires snapshots of the same store; \
                         use copy_container_from across stores"
                    .to_owned(),
            });
        }
        if self.version == source.version {
            return Err(StoreError::InvalidState {
                op: "import_container_from",
                detail: "cannot import a container from the same snapshot".to_owned(),
            });
        }

        let mut cache = self.cache.lock();
        let mut state = self.shared.state.lock();
        self.check_writable(&state, "import_container_from")?;
        Self::check_transfer_source(&state, source.version)?;

        let container_root = source.root_in(&state, name)?;
        let source_root = Self::tree_root(&state, source.version)?;

        // Collect the whole page set before installing anything, so a
        // dangling child id fails the import with the destination tree
        // untouched.
        let mut visited = HashSet::new();
        let mut entries = Vec::new();
        let mut queue = VecDeque::from([container_root]);
        while let Some(id) = queue.pop_front() {
            if !visited.insert(id) {
                continue;
            }
            let entry = state
                .nodes
                .find(source_root, id)
                .cloned()
                .ok_or(StoreError::PageNotFound { page: id.0 })?;
            queue.extend(self.page_children(&entry.page)?);
            entries.push((id, entry));
        }

        // Entries keep their original writer tag; an imported page is
        // shared with the source, so the first update here must copy.
        for (id, entry) in entries {
            entry.page.retain();
            let owner = entry.owner;
            let replaced = self.assign_entry(&mut state, id, entry.page, owner)?;
            if replaced == Some(0) {
                return Err(StoreError::IntegrityViolation {
                    detail: format!(
                        "import of page {id} released the last reference to the replaced page"
                    ),
                });
            }
        }

        self.register_transferred_root(&mut state, name, container_root)?;
        drop(state);
        for id in &visited {
            cache.remove(id);
        }
        debug!(
            version = %self.version,
            source = %source.version,
            name,
            pages = visited.len(),
            "imported container",
        );
        Ok(())
    }

    /// Copy the container registered under `name` in `source` into this
    /// snapshot. Every page is duplicated under its original id; the
    /// source may belong to a different store.
    pub fn copy_container_from(&self, source: &Snapshot, name: &str) -> Result<()> {
        // Phase 1: collect the page graph under the source store's lock.
        let (container_root, pages) = {
            let state = source.shared.state.lock();
            Self::check_transfer_source(&state, source.version)?;
            let container_root = source.root_in(&state, name)?;
            let source_root = Self::tree_root(&state, source.version)?;

            let mut collected = Vec::new();
            let mut visited = HashSet::new();
            let mut queue = VecDeque::from([container_root]);
            while let Some(id) = queue.pop_front() {
                if !visited.insert(id) {
                    continue;
                }
                let entry = state
                    .nodes
                    .find(source_root, id)
                    .ok_or(StoreError::PageNotFound { page: id.0 })?;
                let page = entry.page.read().duplicate_as(id);
                queue.extend(source.page_children(&entry.page)?);
                collected.push((id, page));
            }
            (container_root, collected)
        };

        // Phase 2: install the copies under our own lock. With the source
        // lock released first, two stores copying from each other cannot
        // deadlock.
        let mut cache = self.cache.lock();
        let mut state = self.shared.state.lock();
        self.check_writable(&state, "copy_container_from")?;
        let count = pages.len();
        for (id, page) in pages {
            let replaced = self.assign_entry(&mut state, id, SharedPage::new(page), self.version)?;
            if replaced == Some(0) {
                return Err(StoreError::IntegrityViolation {
                    detail: format!(
                        "copy of page {id} released the last reference to the replaced page"
                    ),
                });
            }
            cache.remove(&id);
        }
        self.register_transferred_root(&mut state, name, container_root)?;
        drop(state);
        debug!(
            version = %self.version,
            source = %source.version,
            name,
            pages = count,
            "copied container",
        );
        Ok(())
    }

    // ── Internals ───────────────────────────────────────────────────────────

    /// Normal page writes require `Active`; a data-locked snapshot only
    /// accepts container transfers.
    fn check_active(&self, state: &AllocatorState, op: &'static str) -> Result<()> {
        let node = state.node(self.version)?;
        match node.status {
            SnapshotStatus::Active => Ok(()),
            status => Err(StoreError::InvalidState {
                op,
                detail: format!("snapshot {} is {status}", self.version),
            }),
        }
    }

    fn check_writable(&self, state: &AllocatorState, op: &'static str) -> Result<()> {
        let node = state.node(self.version)?;
        match node.status {
            SnapshotStatus::Active | SnapshotStatus::DataLocked => Ok(()),
            status => Err(StoreError::InvalidState {
                op,
                detail: format!("snapshot {} is {status}", self.version),
            }),
        }
    }

    /// A container may be transferred out of a committed version or a
    /// dropped one whose data has not been freed yet.
    fn check_transfer_source(state: &AllocatorState, version: VersionId) -> Result<()> {
        let node = state.node(version)?;
        let ok = match node.status {
            SnapshotStatus::Committed | SnapshotStatus::DataLocked => true,
            SnapshotStatus::Dropped => node.root.is_some(),
            SnapshotStatus::Active => false,
        };
        if ok {
            Ok(())
        } else {
            Err(StoreError::InvalidState {
                op: "container transfer",
                detail: format!("source snapshot {version} is {}", node.status),
            })
        }
    }

    fn tree_root(state: &AllocatorState, version: VersionId) -> Result<NodeId> {
        state
            .node(version)?
            .root
            .ok_or_else(|| StoreError::InvalidState {
                op: "page access",
                detail: format!("version {version} has no data"),
            })
    }

    /// Install `page` under `key` in this version's tree, tagged with
    /// `owner` as the writing version. Pages this snapshot wrote carry its
    /// own version; entries shared in from another version keep their
    /// original tag so a later update still takes the copy path. Returns
    /// the replaced page's reference count after release, if a page was
    /// replaced.
    fn assign_entry(
        &self,
        state: &mut AllocatorState,
        key: PageId,
        page: SharedPage,
        owner: VersionId,
    ) -> Result<Option<i64>> {
        let root = Self::tree_root(state, self.version)?;
        let mut released = Vec::new();
        let outcome = state.nodes.assign(
            root,
            self.version,
            key,
            LeafEntry { page, owner },
            &mut || NodeId(fresh_id()),
            &mut released,
        )?;
        state.node_mut(self.version)?.root = Some(outcome.root);
        AllocatorState::release_collected(released);
        Ok(outcome.replaced.map(|old| {
            let count = old.page.release();
            if count < 0 {
                error!(page = %old.page.id(), count, "page reference count went negative");
            }
            count
        }))
    }

    /// Remove `key` from this version's tree, releasing the removed page.
    fn remove_now(&self, state: &mut AllocatorState, id: PageId) -> Result<()> {
        let root = Self::tree_root(state, self.version)?;
        let mut released = Vec::new();
        let outcome = state.nodes.remove(
            root,
            self.version,
            id,
            &mut || NodeId(fresh_id()),
            &mut released,
        )?;
        state.node_mut(self.version)?.root = Some(outcome.root);
        AllocatorState::release_collected(released);
        let removed = outcome
            .removed
            .ok_or(StoreError::PageNotFound { page: id.0 })?;
        let count = removed.page.release();
        if count < 0 {
            error!(page = %removed.page.id(), count, "page reference count went negative");
        }
        trace!(version = %self.version, page = %id, "removed page");
        Ok(())
    }

    fn directory_read(&self, state: &AllocatorState) -> Result<BTreeMap<String, PageId>> {
        self.directory_of(state, self.version)
    }

    fn directory_of(
        &self,
        state: &AllocatorState,
        version: VersionId,
    ) -> Result<BTreeMap<String, PageId>> {
        let Some(root) = state.node(version)?.root else {
            return Ok(BTreeMap::new());
        };
        match state.nodes.find(root, DIRECTORY_PAGE_ID) {
            Some(entry) => directory::decode(entry.page.read().bytes())
                .map_err(|e| StoreError::Parse(e.to_string())),
            None => Ok(BTreeMap::new()),
        }
    }

    fn directory_write(
        &self,
        state: &mut AllocatorState,
        map: &BTreeMap<String, PageId>,
    ) -> Result<()> {
        let bytes = directory::encode(map)?;
        let root = Self::tree_root(state, self.version)?;
        let owned = state
            .nodes
            .find(root, DIRECTORY_PAGE_ID)
            .filter(|e| e.owner == self.version)
            .map(|e| e.page.clone());
        if let Some(page) = owned {
            page.write().set_bytes(bytes);
            return Ok(());
        }
        let page = Page::from_bytes(
            DIRECTORY_PAGE_ID,
            directory::DIRECTORY_CTR_TYPE,
            directory::DIRECTORY_PAGE_TYPE,
            bytes,
        );
        self.assign_entry(state, DIRECTORY_PAGE_ID, SharedPage::new(page), self.version)?;
        Ok(())
    }

    /// Resolve a container root inside an already-locked state, for the
    /// source side of a transfer.
    fn root_in(&self, state: &AllocatorState, name: &str) -> Result<PageId> {
        if name.is_empty() {
            return state
                .node(self.version)?
                .root_page
                .ok_or_else(|| StoreError::RootNotFound { name: String::new() });
        }
        self.directory_of(state, self.version)?
            .get(name)
            .copied()
            .ok_or_else(|| StoreError::RootNotFound { name: name.to_owned() })
    }

    fn register_transferred_root(
        &self,
        state: &mut AllocatorState,
        name: &str,
        root: PageId,
    ) -> Result<()> {
        if name.is_empty() {
            state.node_mut(self.version)?.root_page = Some(root);
            return Ok(());
        }
        let mut map = self.directory_read(state)?;
        map.insert(name.to_owned(), root);
        self.directory_write(state, &map)
    }

    /// Page ids referenced by `page`, per its registered operations.
    fn page_children(&self, page: &SharedPage) -> Result<Vec<PageId>> {
        let guard = page.read();
        let ops = self
            .shared
            .registry
            .lookup(guard.ctr_type(), guard.page_type())?;
        ops.child_ids(&guard)
    }
}

impl Drop for Snapshot {
    /// Apply pending deletions, release the vertex reference, and clean up
    /// whatever the final status calls for. Errors are logged; a drop path
    /// cannot report them.
    fn drop(&mut self) {
        let mut cache = self.cache.lock();
        let pending: Vec<PageId> = cache
            .iter()
            .filter(|(_, c)| c.state == PageState::PendingDelete)
            .map(|(id, _)| *id)
            .collect();
        cache.clear();

        let mut state = self.shared.state.lock();
        if state
            .node(self.version)
            .is_ok_and(|n| matches!(n.status, SnapshotStatus::Active | SnapshotStatus::DataLocked))
        {
            for id in pending {
                if let Err(e) = self.remove_now(&mut state, id) {
                    error!(version = %self.version, page = %id, error = %e, "pending delete failed during teardown");
                }
            }
        }

        let Ok(node) = state.node_mut(self.version) else {
            return;
        };
        node.ext_refs -= 1;
        if node.ext_refs > 0 {
            return;
        }
        let status = node.status;

        let mut notify = false;
        match status {
            SnapshotStatus::Active if self.version == state.history_root => {
                // The initial write was abandoned. The root vertex must
                // survive, so it reverts to an empty committed version.
                state.free_version_data(self.version);
                let fresh = state.nodes.new_tree(NodeId(fresh_id()), self.version);
                match fresh {
                    Ok(root) => {
                        if let Ok(node) = state.node_mut(self.version) {
                            node.root = Some(root);
                            node.root_page = None;
                            node.status = SnapshotStatus::Committed;
                        }
                    }
                    Err(e) => error!(version = %self.version, error = %e, "failed to reset abandoned root"),
                }
                state.active_writes = state.active_writes.saturating_sub(1);
                notify = true;
            }
            SnapshotStatus::Active => {
                debug!(version = %self.version, "abandoned active snapshot");
                state.adjust_name_targets(self.version);
                state.remove_version(self.version);
                state.active_writes = state.active_writes.saturating_sub(1);
                notify = true;
            }
            SnapshotStatus::Dropped => {
                state.free_version_data(self.version);
            }
            SnapshotStatus::Committed | SnapshotStatus::DataLocked => {}
        }
        drop(state);
        drop(cache);
        if notify {
            self.shared.idle.notify_all();
        }
    }
}
