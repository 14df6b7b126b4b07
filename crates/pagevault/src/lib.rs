#![forbid(unsafe_code)]
//! Branchable copy-on-write page store.
//!
//! `pagevault` keeps typed binary pages in a git-like graph of versions.
//! A snapshot is a consistent view of every page at one version; branching
//! a committed snapshot is O(1) because versions share unchanged pages
//! through a persistent tree, and the first write to a shared page copies
//! it into the writing version. The whole store round-trips through a
//! self-describing binary image.
//!
//! ```no_run
//! use pagevault::{Allocator, CtrTypeTag, PageTypeRegistry, PageTypeTag, RawPageOps};
//! use std::sync::Arc;
//!
//! # fn main() -> pagevault::Result<()> {
//! let mut registry = PageTypeRegistry::new();
//! registry.register(CtrTypeTag(1), PageTypeTag(1), Arc::new(RawPageOps));
//!
//! let (store, snapshot) = Allocator::create(registry)?;
//! let page = snapshot.create_page(4096, CtrTypeTag(1), PageTypeTag(1))?;
//! snapshot.set_root("main", Some(page.id()))?;
//! snapshot.commit()?;
//!
//! let branch = snapshot.branch()?;
//! branch.get_page_for_update(page.id())?.write().bytes_mut()[0] = 1;
//! branch.commit()?;
//! store.set_master(branch.version())?;
//! # Ok(())
//! # }
//! ```

pub use pv_core::{
    Allocator, DIRECTORY_CTR_TYPE, DIRECTORY_PAGE_ID, DIRECTORY_PAGE_TYPE, DirectoryPageOps,
    PageState, Snapshot,
};
pub use pv_error::{ErrorKind, Result, StoreError};
pub use pv_page::{Page, PageOps, PageTypeRegistry, RawPageOps, SharedPage};
pub use pv_types::{CtrTypeTag, PageId, PageTypeTag, SnapshotStatus, VersionId};
