//! Store image serialization.
//!
//! The image is a 14-byte header followed by tagged records and a trailing
//! checksum record, all integers little-endian. The writer emits one
//! HISTORY_NODE per graph vertex and walks each version's tree with a
//! written-set, so shared subtrees and shared pages appear exactly once.
//! The reader decodes in two passes: pass 1 flattens the records into maps
//! and rejects duplicates, pass 2 re-links everything by id, rebuilds the
//! reference counts from actual references, and verifies each page's
//! rebuilt count against the stored one. Any failure aborts the load.

use std::collections::{HashMap, HashSet};
use std::io::{Read, Write};

use pv_error::{Result, StoreError};
use pv_page::{PageTypeRegistry, SharedPage};
use pv_tree::{BranchEntry, LeafEntry, LeafSlot, NodeStore, TreeNode};
use pv_types::{
    ENDIAN_LITTLE, FORMAT_V1, HEADER_SIZE, NodeId, PageId, STORE_SIGNATURE, SnapshotStatus,
    VersionId, ensure_slice, read_le_i64, read_le_u16, read_le_u32, read_le_u64, read_le_u128,
};
use tracing::debug;

use crate::state::{AllocatorState, HistoryNode};

const TAG_METADATA: u8 = 0;
const TAG_HISTORY_NODE: u8 = 1;
const TAG_BRANCH_NODE: u8 = 2;
const TAG_LEAF_NODE: u8 = 3;
const TAG_DATA_PAGE: u8 = 4;
const TAG_CHECKSUM: u8 = 5;

// ── Writer ──────────────────────────────────────────────────────────────────

struct ImageWriter<'a> {
    out: &'a mut dyn Write,
    records: u64,
}

impl ImageWriter<'_> {
    fn u8(&mut self, v: u8) -> Result<()> {
        self.out.write_all(&[v])?;
        Ok(())
    }

    fn u16(&mut self, v: u16) -> Result<()> {
        self.out.write_all(&v.to_le_bytes())?;
        Ok(())
    }

    fn u32(&mut self, v: u32) -> Result<()> {
        self.out.write_all(&v.to_le_bytes())?;
        Ok(())
    }

    fn u64(&mut self, v: u64) -> Result<()> {
        self.out.write_all(&v.to_le_bytes())?;
        Ok(())
    }

    fn i64(&mut self, v: i64) -> Result<()> {
        self.out.write_all(&v.to_le_bytes())?;
        Ok(())
    }

    fn u128(&mut self, v: u128) -> Result<()> {
        self.out.write_all(&v.to_le_bytes())?;
        Ok(())
    }

    fn text(&mut self, s: &str) -> Result<()> {
        let len = u16::try_from(s.len()).map_err(|_| StoreError::Unsupported {
            detail: format!("string of {} bytes exceeds the record limit", s.len()),
        })?;
        self.u16(len)?;
        self.out.write_all(s.as_bytes())?;
        Ok(())
    }

    fn tag(&mut self, tag: u8) -> Result<()> {
        self.records += 1;
        self.u8(tag)
    }
}

/// Serialize the whole store state. Returns the number of records written
/// (excluding the checksum record itself).
pub(crate) fn write_store(
    state: &AllocatorState,
    registry: &PageTypeRegistry,
    out: &mut dyn Write,
) -> Result<u64> {
    let mut w = ImageWriter { out, records: 0 };
    w.out.write_all(&STORE_SIGNATURE)?;
    w.u8(ENDIAN_LITTLE)?;
    w.u8(FORMAT_V1)?;

    // METADATA: name pointers, branches in name order for a stable image.
    w.tag(TAG_METADATA)?;
    w.u128(state.master.0)?;
    w.u128(state.history_root.0)?;
    let mut names: Vec<_> = state.named.iter().collect();
    names.sort_by(|a, b| a.0.cmp(b.0));
    w.u32(u32::try_from(names.len()).map_err(|_| StoreError::Unsupported {
        detail: "too many named branches".to_owned(),
    })?)?;
    for (name, version) in names {
        w.text(name)?;
        w.u128(version.0)?;
    }

    let mut written_nodes = HashSet::new();
    let mut written_pages: HashSet<u64> = HashSet::new();

    // Preorder over the version tree; the reader does not rely on order.
    let mut stack = vec![state.history_root];
    while let Some(version) = stack.pop() {
        let node = state.node(version)?;
        write_history_node(&mut w, node)?;
        if let Some(root) = node.root {
            write_tree(
                &mut w,
                state,
                registry,
                root,
                &mut written_nodes,
                &mut written_pages,
            )?;
        }
        stack.extend(node.children.iter().rev());
    }

    let records = w.records;
    w.tag(TAG_CHECKSUM)?;
    w.u64(records)?;
    w.out.flush()?;
    debug!(records, "wrote store image");
    Ok(records)
}

fn write_history_node(w: &mut ImageWriter<'_>, node: &HistoryNode) -> Result<()> {
    w.tag(TAG_HISTORY_NODE)?;
    w.u8(node.status.as_byte())?;
    w.u128(node.version.0)?;
    w.u128(node.root.map_or(0, |n| n.0))?;
    w.u128(node.root_page.map_or(0, |p| p.0))?;
    w.u128(node.parent.map_or(0, |p| p.0))?;
    w.text(&node.metadata)?;
    w.u32(u32::try_from(node.children.len()).map_err(|_| StoreError::Unsupported {
        detail: "too many children on a version vertex".to_owned(),
    })?)?;
    for child in &node.children {
        w.u128(child.0)?;
    }
    Ok(())
}

fn write_tree(
    w: &mut ImageWriter<'_>,
    state: &AllocatorState,
    registry: &PageTypeRegistry,
    root: NodeId,
    written_nodes: &mut HashSet<NodeId>,
    written_pages: &mut HashSet<u64>,
) -> Result<()> {
    let mut stack = vec![root];
    while let Some(id) = stack.pop() {
        if !written_nodes.insert(id) {
            continue;
        }
        let node = state.nodes.node(id)?;
        match &node.kind {
            pv_tree::NodeKind::Branch(entries) => {
                w.tag(TAG_BRANCH_NODE)?;
                w.u128(id.0)?;
                w.u128(node.owner.0)?;
                w.u32(entry_count(entries.len())?)?;
                for entry in entries {
                    w.u128(entry.max_key.0)?;
                    w.u128(entry.child.0)?;
                    stack.push(entry.child);
                }
            }
            pv_tree::NodeKind::Leaf(slots) => {
                w.tag(TAG_LEAF_NODE)?;
                w.u128(id.0)?;
                w.u128(node.owner.0)?;
                w.u32(entry_count(slots.len())?)?;
                for slot in slots {
                    w.u128(slot.key.0)?;
                    w.u64(slot.entry.page.serial())?;
                    w.u128(slot.entry.owner.0)?;
                }
                for slot in slots {
                    if written_pages.insert(slot.entry.page.serial()) {
                        write_data_page(w, registry, &slot.entry.page)?;
                    }
                }
            }
        }
    }
    Ok(())
}

fn entry_count(len: usize) -> Result<u32> {
    u32::try_from(len).map_err(|_| StoreError::Unsupported {
        detail: "tree node entry count exceeds the record limit".to_owned(),
    })
}

fn write_data_page(
    w: &mut ImageWriter<'_>,
    registry: &PageTypeRegistry,
    page: &SharedPage,
) -> Result<()> {
    let guard = page.read();
    let ops = registry.lookup(guard.ctr_type(), guard.page_type())?;
    let payload = ops.serialize(&guard)?;
    w.tag(TAG_DATA_PAGE)?;
    w.u64(page.serial())?;
    w.u128(guard.id().0)?;
    w.i64(page.ref_count())?;
    w.u32(u32::try_from(payload.len()).map_err(|_| StoreError::Unsupported {
        detail: format!("serialized page {} exceeds the record limit", guard.id()),
    })?)?;
    w.u32(guard.size())?;
    w.u64(guard.ctr_type().0)?;
    w.u64(guard.page_type().0)?;
    w.out.write_all(&payload)?;
    Ok(())
}

// ── Reader ──────────────────────────────────────────────────────────────────

struct RawHistory {
    status: SnapshotStatus,
    version: VersionId,
    root: Option<NodeId>,
    root_page: Option<PageId>,
    parent: Option<VersionId>,
    metadata: String,
    children: Vec<VersionId>,
}

struct RawBranch {
    owner: VersionId,
    entries: Vec<BranchEntry>,
}

struct RawLeaf {
    owner: VersionId,
    /// Per entry: tree key (page id), storage serial, entry owner.
    entries: Vec<(PageId, u64, VersionId)>,
}

struct RawPage {
    stored_refs: i64,
    page: SharedPage,
}

#[derive(Default)]
struct RawImage {
    master: Option<(VersionId, VersionId)>,
    named: Vec<(String, VersionId)>,
    history: Vec<RawHistory>,
    branches: HashMap<NodeId, RawBranch>,
    leaves: HashMap<NodeId, RawLeaf>,
    /// Keyed by storage serial, not page id; copy-on-write siblings share
    /// a page id across distinct storage copies.
    pages: HashMap<u64, RawPage>,
}

struct Cursor<'a> {
    data: &'a [u8],
    offset: usize,
}

impl Cursor<'_> {
    fn parse<T>(&mut self, len: usize, r: impl FnOnce(&[u8], usize) -> std::result::Result<T, pv_types::ParseError>) -> Result<T> {
        let v = r(self.data, self.offset).map_err(|e| StoreError::Parse(e.to_string()))?;
        self.offset += len;
        Ok(v)
    }

    fn u8(&mut self) -> Result<u8> {
        let b = ensure_slice(self.data, self.offset, 1)
            .map_err(|e| StoreError::Parse(e.to_string()))?[0];
        self.offset += 1;
        Ok(b)
    }

    fn u16(&mut self) -> Result<u16> {
        self.parse(2, read_le_u16)
    }

    fn u32(&mut self) -> Result<u32> {
        self.parse(4, read_le_u32)
    }

    fn u64(&mut self) -> Result<u64> {
        self.parse(8, read_le_u64)
    }

    fn i64(&mut self) -> Result<i64> {
        self.parse(8, read_le_i64)
    }

    fn u128(&mut self) -> Result<u128> {
        self.parse(16, read_le_u128)
    }

    fn bytes(&mut self, len: usize) -> Result<&[u8]> {
        let slice = ensure_slice(self.data, self.offset, len)
            .map_err(|e| StoreError::Parse(e.to_string()))?;
        self.offset += len;
        Ok(slice)
    }

    fn text(&mut self) -> Result<String> {
        let len = self.u16()? as usize;
        let raw = self.bytes(len)?;
        String::from_utf8(raw.to_vec())
            .map_err(|_| StoreError::Parse("record string is not valid UTF-8".to_owned()))
    }

    fn optional_u128(&mut self) -> Result<Option<u128>> {
        let v = self.u128()?;
        Ok((v != 0).then_some(v))
    }
}

/// Deserialize a store image into allocator state. The registry must know
/// every page type present in the image.
pub(crate) fn read_store(
    input: &mut dyn Read,
    registry: &PageTypeRegistry,
) -> Result<AllocatorState> {
    let mut data = Vec::new();
    input.read_to_end(&mut data)?;

    if data.len() < HEADER_SIZE {
        return Err(StoreError::Unsupported {
            detail: "stream is shorter than the store header".to_owned(),
        });
    }
    if data[..STORE_SIGNATURE.len()] != STORE_SIGNATURE {
        return Err(StoreError::Unsupported {
            detail: "stream does not carry the store signature".to_owned(),
        });
    }
    if data[STORE_SIGNATURE.len()] != ENDIAN_LITTLE {
        return Err(StoreError::Unsupported {
            detail: format!("unsupported endianness marker {}", data[STORE_SIGNATURE.len()]),
        });
    }
    if data[STORE_SIGNATURE.len() + 1] != FORMAT_V1 {
        return Err(StoreError::Unsupported {
            detail: format!(
                "unsupported format version {}",
                data[STORE_SIGNATURE.len() + 1]
            ),
        });
    }

    let raw = read_records(&data[HEADER_SIZE..], registry)?;
    link_image(raw)
}

/// Pass 1: flatten the record stream, rejecting duplicate ids and a bad
/// checksum.
fn read_records(data: &[u8], registry: &PageTypeRegistry) -> Result<RawImage> {
    let mut cursor = Cursor { data, offset: 0 };
    let mut raw = RawImage::default();
    let mut records: u64 = 0;
    let mut seen_versions = HashSet::new();

    loop {
        let tag = cursor.u8()?;
        match tag {
            TAG_METADATA => {
                records += 1;
                if raw.master.is_some() {
                    return Err(StoreError::IntegrityViolation {
                        detail: "duplicate metadata record".to_owned(),
                    });
                }
                let master = VersionId(cursor.u128()?);
                let root = VersionId(cursor.u128()?);
                let count = cursor.u32()?;
                for _ in 0..count {
                    let name = cursor.text()?;
                    let version = VersionId(cursor.u128()?);
                    raw.named.push((name, version));
                }
                raw.master = Some((master, root));
            }
            TAG_HISTORY_NODE => {
                records += 1;
                let status = SnapshotStatus::from_byte(cursor.u8()?)
                    .map_err(|e| StoreError::Parse(e.to_string()))?;
                let version = VersionId(cursor.u128()?);
                let root = cursor.optional_u128()?.map(NodeId);
                let root_page = cursor.optional_u128()?.map(PageId);
                let parent = cursor.optional_u128()?.map(VersionId);
                let metadata = cursor.text()?;
                let count = cursor.u32()?;
                let mut children = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    children.push(VersionId(cursor.u128()?));
                }
                if !seen_versions.insert(version) {
                    return Err(StoreError::IntegrityViolation {
                        detail: format!("duplicate history node {version}"),
                    });
                }
                raw.history.push(RawHistory {
                    status,
                    version,
                    root,
                    root_page,
                    parent,
                    metadata,
                    children,
                });
            }
            TAG_BRANCH_NODE => {
                records += 1;
                let id = NodeId(cursor.u128()?);
                let owner = VersionId(cursor.u128()?);
                let count = cursor.u32()?;
                let mut entries = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    let max_key = PageId(cursor.u128()?);
                    let child = NodeId(cursor.u128()?);
                    entries.push(BranchEntry { max_key, child });
                }
                if raw.leaves.contains_key(&id) || raw.branches.insert(id, RawBranch { owner, entries }).is_some() {
                    return Err(StoreError::IntegrityViolation {
                        detail: format!("duplicate tree node {id}"),
                    });
                }
            }
            TAG_LEAF_NODE => {
                records += 1;
                let id = NodeId(cursor.u128()?);
                let owner = VersionId(cursor.u128()?);
                let count = cursor.u32()?;
                let mut entries = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    let page = PageId(cursor.u128()?);
                    let storage = cursor.u64()?;
                    let entry_owner = VersionId(cursor.u128()?);
                    entries.push((page, storage, entry_owner));
                }
                if raw.branches.contains_key(&id) || raw.leaves.insert(id, RawLeaf { owner, entries }).is_some() {
                    return Err(StoreError::IntegrityViolation {
                        detail: format!("duplicate tree node {id}"),
                    });
                }
            }
            TAG_DATA_PAGE => {
                records += 1;
                let storage = cursor.u64()?;
                let id = PageId(cursor.u128()?);
                let stored_refs = cursor.i64()?;
                let payload_len = cursor.u32()? as usize;
                let page_size = cursor.u32()?;
                let ctr_type = pv_types::CtrTypeTag(cursor.u64()?);
                let page_type = pv_types::PageTypeTag(cursor.u64()?);
                let payload = cursor.bytes(payload_len)?;
                let ops = registry.lookup(ctr_type, page_type)?;
                let page = ops.deserialize(id, ctr_type, page_type, page_size, payload)?;
                if raw
                    .pages
                    .insert(
                        storage,
                        RawPage {
                            stored_refs,
                            page: SharedPage::unreferenced(page),
                        },
                    )
                    .is_some()
                {
                    return Err(StoreError::IntegrityViolation {
                        detail: format!("duplicate data page record for storage {storage}"),
                    });
                }
            }
            TAG_CHECKSUM => {
                let expected = cursor.u64()?;
                if expected != records {
                    return Err(StoreError::IntegrityViolation {
                        detail: format!(
                            "checksum mismatch: image says {expected} records, read {records}"
                        ),
                    });
                }
                if cursor.offset != data.len() {
                    return Err(StoreError::IntegrityViolation {
                        detail: format!(
                            "{} trailing bytes after the checksum record",
                            data.len() - cursor.offset
                        ),
                    });
                }
                return Ok(raw);
            }
            other => {
                return Err(StoreError::Parse(format!("unknown record tag {other}")));
            }
        }
    }
}

/// Pass 2: relink by id and rebuild reference counts.
fn link_image(raw: RawImage) -> Result<AllocatorState> {
    let Some((master, history_root)) = raw.master else {
        return Err(StoreError::IntegrityViolation {
            detail: "image has no metadata record".to_owned(),
        });
    };

    let mut nodes = NodeStore::new();

    // Leaves first: each entry re-retains its storage copy.
    for (id, leaf) in &raw.leaves {
        let mut slots = Vec::with_capacity(leaf.entries.len());
        let mut last_key = None;
        for (key, storage, entry_owner) in &leaf.entries {
            if last_key.is_some_and(|k: PageId| k >= *key) {
                return Err(StoreError::IntegrityViolation {
                    detail: format!("leaf node {id} keys are not strictly ascending"),
                });
            }
            last_key = Some(*key);
            let page = raw
                .pages
                .get(storage)
                .ok_or(StoreError::PageNotFound { page: key.0 })?;
            if page.page.id() != *key {
                return Err(StoreError::IntegrityViolation {
                    detail: format!(
                        "leaf node {id} links key {key} to a page with id {}",
                        page.page.id()
                    ),
                });
            }
            page.page.retain();
            slots.push(LeafSlot {
                key: *key,
                entry: LeafEntry {
                    page: page.page.clone(),
                    owner: *entry_owner,
                },
            });
        }
        nodes.insert(TreeNode::new_leaf(*id, leaf.owner, slots))?;
    }
    for (id, branch) in &raw.branches {
        nodes.insert(TreeNode::new_branch(*id, branch.owner, branch.entries.clone()))?;
    }

    // Each branch entry and each version root contributes one node
    // reference.
    for branch in raw.branches.values() {
        for entry in &branch.entries {
            if !nodes.retain_node(entry.child) {
                return Err(StoreError::NodeNotFound { node: entry.child.0 });
            }
        }
    }

    let mut history = HashMap::new();
    for raw_node in &raw.history {
        if let Some(root) = raw_node.root
            && !nodes.retain_node(root)
        {
            return Err(StoreError::NodeNotFound { node: root.0 });
        }
        history.insert(
            raw_node.version,
            HistoryNode {
                version: raw_node.version,
                parent: raw_node.parent,
                children: raw_node.children.clone(),
                status: raw_node.status,
                root: raw_node.root,
                root_page: raw_node.root_page,
                metadata: raw_node.metadata.clone(),
                ext_refs: 0,
            },
        );
    }

    // Graph consistency: parents, children, and name pointers all resolve,
    // and the child lists agree with the parent pointers.
    for raw_node in &raw.history {
        if let Some(parent) = raw_node.parent
            && !history.contains_key(&parent)
        {
            return Err(StoreError::VersionNotFound { version: parent.0 });
        }
        for child in &raw_node.children {
            let child_node: &HistoryNode = history
                .get(child)
                .ok_or(StoreError::VersionNotFound { version: child.0 })?;
            if child_node.parent != Some(raw_node.version) {
                return Err(StoreError::IntegrityViolation {
                    detail: format!(
                        "version {child} is listed as a child of {} but points at a different parent",
                        raw_node.version
                    ),
                });
            }
        }
    }
    for version in [master, history_root] {
        if !history.contains_key(&version) {
            return Err(StoreError::VersionNotFound { version: version.0 });
        }
    }
    let mut named = HashMap::new();
    for (name, version) in raw.named {
        if !history.contains_key(&version) {
            return Err(StoreError::VersionNotFound { version: version.0 });
        }
        named.insert(name, version);
    }

    // Every tree node must be reachable; an unreferenced node means the
    // image carries garbage.
    for id in raw.branches.keys().chain(raw.leaves.keys()) {
        if nodes.node(*id)?.ref_count() < 1 {
            return Err(StoreError::IntegrityViolation {
                detail: format!("tree node {id} is not referenced by any root or branch"),
            });
        }
    }

    // Rebuilt page counts must match the stored ones.
    for page in raw.pages.values() {
        let rebuilt = page.page.ref_count();
        if rebuilt != page.stored_refs {
            return Err(StoreError::IntegrityViolation {
                detail: format!(
                    "page {} reference count mismatch: image says {}, rebuilt {rebuilt}",
                    page.page.id(),
                    page.stored_refs
                ),
            });
        }
        if rebuilt == 0 {
            return Err(StoreError::IntegrityViolation {
                detail: format!("page {} is not referenced by any version", page.page.id()),
            });
        }
    }

    let active_writes = history
        .values()
        .filter(|n| n.status == SnapshotStatus::Active)
        .count() as u64;

    debug!(
        versions = history.len(),
        pages = raw.pages.len(),
        "loaded store image"
    );
    Ok(AllocatorState {
        history,
        history_root,
        master,
        named,
        nodes,
        active_writes,
    })
}
