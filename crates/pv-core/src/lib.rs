#![forbid(unsafe_code)]
//! Core of the copy-on-write page store.
//!
//! An [`Allocator`] owns a graph of versions; each version maps page ids to
//! ref-counted page storage through a persistent copy-on-write tree, so
//! branching a snapshot is O(1) and committed versions share every page
//! they did not rewrite. [`Snapshot`] handles drive the page access
//! protocol; the whole store serializes into a self-describing binary
//! image and loads back with full integrity verification.
//!
//! The crate deliberately knows nothing about page payloads. Applications
//! register [`pv_page::PageOps`] per type tag pair and the store calls back
//! at the three points where payload structure matters: serialization,
//! resizing, and the child-page walk behind container import.

mod allocator;
mod directory;
mod persist;
mod snapshot;
mod state;

pub use allocator::Allocator;
pub use directory::{
    DIRECTORY_CTR_TYPE, DIRECTORY_PAGE_ID, DIRECTORY_PAGE_TYPE, DirectoryPageOps,
};
pub use snapshot::{PageState, Snapshot};
