#![forbid(unsafe_code)]
//! Pages and page ownership.
//!
//! A [`Page`] is an opaque, fixed-identity, typed byte blob. The store never
//! interprets page bytes itself; per-type payload operations are resolved
//! through a [`PageTypeRegistry`] passed explicitly into the store (no
//! process-wide state).
//!
//! [`SharedPage`] is the ownership seam. It carries two independent counts:
//! the `Arc` strong count (memory reclamation only) and an explicit logical
//! reference count equal to the number of persistent-tree leaf entries that
//! point at the page across all versions. Only leaf-entry creation and
//! removal paths call [`SharedPage::retain`]/[`SharedPage::release`];
//! handle clones never touch the logical count.

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use pv_error::{Result, StoreError};
use pv_types::{CtrTypeTag, PageId, PageTypeTag};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

/// Opaque binary page.
///
/// Identity (`id`) is stable for the page's lifetime. Content may be
/// replaced wholesale (copy-on-write clone) but is never mutated in place
/// while shared between versions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page {
    id: PageId,
    ctr_type: CtrTypeTag,
    page_type: PageTypeTag,
    bytes: Vec<u8>,
}

impl Page {
    /// Create a zero-filled page of `size` bytes.
    #[must_use]
    pub fn zeroed(id: PageId, ctr_type: CtrTypeTag, page_type: PageTypeTag, size: u32) -> Self {
        Self {
            id,
            ctr_type,
            page_type,
            bytes: vec![0_u8; size as usize],
        }
    }

    /// Create a page around existing payload bytes.
    #[must_use]
    pub fn from_bytes(
        id: PageId,
        ctr_type: CtrTypeTag,
        page_type: PageTypeTag,
        bytes: Vec<u8>,
    ) -> Self {
        Self {
            id,
            ctr_type,
            page_type,
            bytes,
        }
    }

    /// Duplicate this page's content under a different identity.
    #[must_use]
    pub fn duplicate_as(&self, id: PageId) -> Self {
        Self {
            id,
            ctr_type: self.ctr_type,
            page_type: self.page_type,
            bytes: self.bytes.clone(),
        }
    }

    #[must_use]
    pub fn id(&self) -> PageId {
        self.id
    }

    #[must_use]
    pub fn ctr_type(&self) -> CtrTypeTag {
        self.ctr_type
    }

    #[must_use]
    pub fn page_type(&self) -> PageTypeTag {
        self.page_type
    }

    /// Page buffer size in bytes.
    #[must_use]
    pub fn size(&self) -> u32 {
        u32::try_from(self.bytes.len()).unwrap_or(u32::MAX)
    }

    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn bytes_mut(&mut self) -> &mut Vec<u8> {
        &mut self.bytes
    }

    /// Replace the whole payload.
    pub fn set_bytes(&mut self, bytes: Vec<u8>) {
        self.bytes = bytes;
    }
}

#[derive(Debug)]
struct PageCell {
    id: PageId,
    /// Process-unique identity of this storage copy. Distinct copies of a
    /// page share its `id` but never its serial; the store image writer
    /// deduplicates by serial.
    serial: u64,
    refs: AtomicI64,
    page: RwLock<Page>,
}

static NEXT_SERIAL: AtomicU64 = AtomicU64::new(1);

/// Ref-counted ownership handle around a [`Page`].
///
/// Cloning a `SharedPage` copies the handle only. The logical count changes
/// exclusively through [`retain`](Self::retain)/[`release`](Self::release),
/// invoked at the tree-leaf boundary; it reaches zero exactly when no live
/// leaf entry anywhere in the version graph references the page.
#[derive(Debug, Clone)]
pub struct SharedPage {
    cell: Arc<PageCell>,
}

impl SharedPage {
    /// Wrap a page with a logical count of one (the creating leaf entry).
    #[must_use]
    pub fn new(page: Page) -> Self {
        Self::with_count(page, 1)
    }

    /// Wrap a page with a logical count of zero. Used while reconstructing
    /// a store image, before leaf entries are re-linked.
    #[must_use]
    pub fn unreferenced(page: Page) -> Self {
        Self::with_count(page, 0)
    }

    fn with_count(page: Page, count: i64) -> Self {
        Self {
            cell: Arc::new(PageCell {
                id: page.id(),
                serial: NEXT_SERIAL.fetch_add(1, Ordering::Relaxed),
                refs: AtomicI64::new(count),
                page: RwLock::new(page),
            }),
        }
    }

    #[must_use]
    pub fn id(&self) -> PageId {
        self.cell.id
    }

    /// Process-unique identity of this storage copy. Differs between two
    /// copies of the same page; stable across handle clones.
    #[must_use]
    pub fn serial(&self) -> u64 {
        self.cell.serial
    }

    /// Current logical reference count.
    #[must_use]
    pub fn ref_count(&self) -> i64 {
        self.cell.refs.load(Ordering::Acquire)
    }

    /// Increment the logical count; returns the new value.
    pub fn retain(&self) -> i64 {
        self.cell.refs.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Decrement the logical count; returns the new value. A return of zero
    /// means no leaf entry references the page any more; a negative return
    /// is an invariant violation on the caller's side.
    pub fn release(&self) -> i64 {
        self.cell.refs.fetch_sub(1, Ordering::AcqRel) - 1
    }

    /// Shared read access to the page content.
    pub fn read(&self) -> RwLockReadGuard<'_, Page> {
        self.cell.page.read()
    }

    /// Exclusive write access to the page content. Callers must hold an
    /// `Update`-state handle; mutating a `Read`-state page corrupts sibling
    /// versions.
    pub fn write(&self) -> RwLockWriteGuard<'_, Page> {
        self.cell.page.write()
    }

    /// Whether two handles refer to the same underlying page object.
    #[must_use]
    pub fn same_page(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.cell, &other.cell)
    }
}

/// Payload operations for one `(ctr_type, page_type)` tag pair.
///
/// The store treats payload bytes as opaque; these callbacks are the only
/// place payload structure is known.
pub trait PageOps: Send + Sync {
    /// Encode the page payload for the store image.
    fn serialize(&self, page: &Page) -> Result<Vec<u8>>;

    /// Decode a payload from the store image back into a page.
    fn deserialize(
        &self,
        id: PageId,
        ctr_type: CtrTypeTag,
        page_type: PageTypeTag,
        page_size: u32,
        bytes: &[u8],
    ) -> Result<Page>;

    /// Resize the page buffer in place.
    fn resize(&self, page: &mut Page, new_size: u32) -> Result<()>;

    /// Ids of the pages this page references, used to walk a container's
    /// page graph during import/copy. Leaf payloads return an empty list.
    fn child_ids(&self, page: &Page) -> Result<Vec<PageId>>;
}

impl std::fmt::Debug for dyn PageOps {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("dyn PageOps")
    }
}

/// Identity payload operations: the payload is the raw buffer, references
/// nothing, and resizes by zero-fill or truncation.
#[derive(Debug, Default, Clone, Copy)]
pub struct RawPageOps;

impl PageOps for RawPageOps {
    fn serialize(&self, page: &Page) -> Result<Vec<u8>> {
        Ok(page.bytes().to_vec())
    }

    fn deserialize(
        &self,
        id: PageId,
        ctr_type: CtrTypeTag,
        page_type: PageTypeTag,
        page_size: u32,
        bytes: &[u8],
    ) -> Result<Page> {
        if bytes.len() != page_size as usize {
            return Err(StoreError::IntegrityViolation {
                detail: format!(
                    "raw page {id}: payload length {} does not match page size {page_size}",
                    bytes.len()
                ),
            });
        }
        Ok(Page::from_bytes(id, ctr_type, page_type, bytes.to_vec()))
    }

    fn resize(&self, page: &mut Page, new_size: u32) -> Result<()> {
        page.bytes_mut().resize(new_size as usize, 0);
        Ok(())
    }

    fn child_ids(&self, _page: &Page) -> Result<Vec<PageId>> {
        Ok(Vec::new())
    }
}

/// Registry resolving `(ctr_type, page_type)` to payload operations.
///
/// Constructed by the embedding application and handed to the store once;
/// resolution failures surface as [`StoreError::Unsupported`].
#[derive(Default)]
pub struct PageTypeRegistry {
    ops: HashMap<(CtrTypeTag, PageTypeTag), Arc<dyn PageOps>>,
}

impl PageTypeRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register operations for a tag pair, replacing any previous entry.
    pub fn register(
        &mut self,
        ctr_type: CtrTypeTag,
        page_type: PageTypeTag,
        ops: Arc<dyn PageOps>,
    ) {
        self.ops.insert((ctr_type, page_type), ops);
    }

    pub fn lookup(&self, ctr_type: CtrTypeTag, page_type: PageTypeTag) -> Result<&Arc<dyn PageOps>> {
        self.ops
            .get(&(ctr_type, page_type))
            .ok_or_else(|| StoreError::Unsupported {
                detail: format!(
                    "no page operations registered for ctr_type={:#x} page_type={:#x}",
                    ctr_type.0, page_type.0
                ),
            })
    }

    #[must_use]
    pub fn contains(&self, ctr_type: CtrTypeTag, page_type: PageTypeTag) -> bool {
        self.ops.contains_key(&(ctr_type, page_type))
    }
}

impl std::fmt::Debug for PageTypeRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageTypeRegistry")
            .field("registered", &self.ops.len())
            .finish()
    }
}
