//! Store allocator: owns the version graph and hands out snapshots.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use pv_error::{Result, StoreError};
use pv_page::PageTypeRegistry;
use pv_tree::NodeStore;
use pv_types::{NodeId, SnapshotStatus, VersionId};
use tracing::debug;

use crate::directory;
use crate::persist;
use crate::snapshot::Snapshot;
use crate::state::{AllocatorState, HistoryNode, StoreShared, fresh_id};

/// The store. Thread-safe; clones of the handle are cheap and share state.
///
/// A new store starts with a single active root snapshot, returned from
/// [`Allocator::create`] alongside the allocator so the initial content can
/// be written and committed.
#[derive(Clone)]
pub struct Allocator {
    shared: Arc<StoreShared>,
}

impl Allocator {
    /// Create an empty store. The directory page type is registered into
    /// `registry` automatically.
    pub fn create(mut registry: PageTypeRegistry) -> Result<(Self, Snapshot)> {
        directory::register(&mut registry);

        let root_version = VersionId(fresh_id());
        let mut nodes = NodeStore::new();
        let root_node = nodes.new_tree(NodeId(fresh_id()), root_version)?;

        let mut state = AllocatorState {
            history: std::collections::HashMap::new(),
            history_root: root_version,
            master: root_version,
            named: std::collections::HashMap::new(),
            nodes,
            active_writes: 1,
        };
        state.history.insert(
            root_version,
            HistoryNode {
                version: root_version,
                parent: None,
                children: Vec::new(),
                status: SnapshotStatus::Active,
                root: Some(root_node),
                root_page: None,
                metadata: String::new(),
                ext_refs: 1,
            },
        );

        let shared = Arc::new(StoreShared {
            state: Mutex::new(state),
            idle: Condvar::new(),
            registry,
        });
        debug!(version = %root_version, "created store");
        let snapshot = Snapshot::bind(Arc::clone(&shared), root_version);
        Ok((Self { shared }, snapshot))
    }

    /// Open a handle on the version the master pointer targets.
    pub fn master(&self) -> Result<Snapshot> {
        let version = self.shared.state.lock().master;
        self.shared.open(version, "master")
    }

    /// Open a handle on a version by id. Active and dropped versions are
    /// rejected; a data-locked version may be opened while no other handle
    /// holds it.
    pub fn find(&self, version: VersionId) -> Result<Snapshot> {
        self.shared.open(version, "find")
    }

    /// Open a handle on the version a named branch targets.
    pub fn find_branch(&self, name: &str) -> Result<Snapshot> {
        let version = {
            let state = self.shared.state.lock();
            state
                .named
                .get(name)
                .copied()
                .ok_or_else(|| StoreError::BranchNotFound {
                    name: name.to_owned(),
                })?
        };
        self.shared.open(version, "find_branch")
    }

    /// Point master at a committed version.
    pub fn set_master(&self, version: VersionId) -> Result<()> {
        let mut state = self.shared.state.lock();
        Self::check_name_target(&state, version, "set_master")?;
        state.master = version;
        debug!(version = %version, "moved master");
        Ok(())
    }

    /// Point a named branch at a committed version, creating the name if
    /// needed.
    pub fn set_branch(&self, name: &str, version: VersionId) -> Result<()> {
        let mut state = self.shared.state.lock();
        Self::check_name_target(&state, version, "set_branch")?;
        state.named.insert(name.to_owned(), version);
        debug!(name, version = %version, "moved branch");
        Ok(())
    }

    /// Delete a named branch pointer. The targeted version is unaffected.
    pub fn remove_branch(&self, name: &str) -> Result<()> {
        let mut state = self.shared.state.lock();
        state
            .named
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| StoreError::BranchNotFound {
                name: name.to_owned(),
            })
    }

    /// Names of all branch pointers, sorted.
    #[must_use]
    pub fn branch_names(&self) -> Vec<String> {
        let state = self.shared.state.lock();
        let mut names: Vec<String> = state.named.keys().cloned().collect();
        names.sort();
        names
    }

    /// Excise terminal versions from the graph: dropped leaves and
    /// data-less interior vertices with no handle and no name pointer.
    /// Single-child vertices are spliced so lineage survives.
    pub fn pack(&self) -> Result<()> {
        self.shared.state.lock().pack();
        Ok(())
    }

    /// Human-readable dump of the version graph.
    #[must_use]
    pub fn describe(&self) -> String {
        self.shared.state.lock().describe()
    }

    /// Serialize the store. Blocks until no snapshot is in `Active` status,
    /// packs the graph, then writes the image. Returns the record count.
    ///
    /// Holding an uncommitted snapshot handle on the calling thread
    /// deadlocks this call by construction; commit or discard first.
    pub fn store<W: Write>(&self, out: &mut W) -> Result<u64> {
        let mut state = self.shared.state.lock();
        while state.active_writes > 0 {
            self.shared.idle.wait(&mut state);
        }
        state.pack();
        persist::write_store(&state, &self.shared.registry, out)
    }

    /// Deserialize a store image. The registry must cover every page type
    /// in the image; the directory page type is registered automatically.
    pub fn load<R: Read>(input: &mut R, mut registry: PageTypeRegistry) -> Result<Self> {
        directory::register(&mut registry);
        let state = persist::read_store(input, &registry)?;
        Ok(Self {
            shared: Arc::new(StoreShared {
                state: Mutex::new(state),
                idle: Condvar::new(),
                registry,
            }),
        })
    }

    /// [`store`](Self::store) into a freshly created file.
    pub fn store_to_file<P: AsRef<Path>>(&self, path: P) -> Result<u64> {
        let mut out = BufWriter::new(File::create(path)?);
        let records = self.store(&mut out)?;
        out.into_inner().map_err(|e| StoreError::Io(e.into_error()))?.sync_all()?;
        Ok(records)
    }

    /// [`load`](Self::load) from a file.
    pub fn load_from_file<P: AsRef<Path>>(path: P, registry: PageTypeRegistry) -> Result<Self> {
        let mut input = BufReader::new(File::open(path)?);
        Self::load(&mut input, registry)
    }

    fn check_name_target(
        state: &AllocatorState,
        version: VersionId,
        op: &'static str,
    ) -> Result<()> {
        let node = state.node(version)?;
        match node.status {
            SnapshotStatus::Committed | SnapshotStatus::DataLocked => Ok(()),
            status => Err(StoreError::InvalidState {
                op,
                detail: format!("version {version} is {status}"),
            }),
        }
    }
}

impl std::fmt::Debug for Allocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("Allocator")
            .field("versions", &state.history.len())
            .field("master", &state.master)
            .finish()
    }
}
