#![forbid(unsafe_code)]
//! Error types for PageVault.
//!
//! # Error Taxonomy
//!
//! PageVault uses a two-layer error model:
//!
//! | Layer | Type | Crate | Purpose |
//! |-------|------|-------|---------|
//! | Decoding | `ParseError` | `pv-types` | Byte-level violations found while decoding a store image |
//! | Runtime | `StoreError` | `pv-error` (this crate) | User-facing errors for the allocator/snapshot API |
//!
//! `pv-error` is intentionally independent of `pv-types` (no cyclic deps);
//! identifier payloads are carried as raw `u128` values and the
//! `ParseError` → `StoreError` conversion happens at the `pv-core` boundary.
//!
//! Every variant classifies into exactly one [`ErrorKind`] via
//! [`StoreError::kind`]. The mapping is exhaustive (no wildcard arms) so
//! adding a variant is a compile error until it is classified:
//!
//! | Variant | Kind |
//! |---------|------|
//! | `Io` | `Io` |
//! | `PageNotFound` / `VersionNotFound` / `BranchNotFound` / `RootNotFound` / `NodeNotFound` | `NotFound` |
//! | `InvalidState` | `InvalidState` |
//! | `IntegrityViolation` / `Parse` | `IntegrityViolation` |
//! | `Unsupported` | `Unsupported` |
//!
//! All string payloads are owned (`String`) so errors can cross thread
//! boundaries without lifetime entanglement. Failures are surfaced
//! synchronously to the caller; nothing is retried or swallowed internally.
//! Drop paths never construct these errors — an inconsistency discovered
//! during teardown is a programming-error-level invariant violation and is
//! logged, not returned.

use thiserror::Error;

/// Unified error type for all PageVault operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Operating system I/O error (wraps `std::io::Error`), surfaced from
    /// store/load streams only.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// No page with the given id is reachable from the snapshot.
    #[error("page not found: {page:032x}")]
    PageNotFound { page: u128 },

    /// No version-graph vertex carries the given id.
    #[error("version not found: {version:032x}")]
    VersionNotFound { version: u128 },

    /// No named branch pointer with the given name.
    #[error("branch not found: {name}")]
    BranchNotFound { name: String },

    /// The snapshot's directory has no root registered under the name.
    #[error("container root not found: {name:?}")]
    RootNotFound { name: String },

    /// A tree node referenced by id is absent (only possible while loading
    /// a store image or walking a foreign snapshot).
    #[error("tree node not found: {node:032x}")]
    NodeNotFound { node: u128 },

    /// The operation is not permitted for the current snapshot status
    /// (commit of a non-active snapshot, branch from an active one, drop of
    /// the history root, update on a committed snapshot, ...).
    #[error("operation {op} not permitted: {detail}")]
    InvalidState { op: &'static str, detail: String },

    /// A structural invariant does not hold: checksum mismatch, unexpected
    /// reference count, duplicate id registered during load.
    #[error("integrity violation: {detail}")]
    IntegrityViolation { detail: String },

    /// Signature mismatch or a page type tag with no registered operations.
    #[error("unsupported: {detail}")]
    Unsupported { detail: String },

    /// Decode-layer error surfaced to the user. Carries the string
    /// representation of a `ParseError` from `pv-types`.
    #[error("parse error: {0}")]
    Parse(String),
}

/// Coarse classification of a [`StoreError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NotFound,
    InvalidState,
    IntegrityViolation,
    Unsupported,
    Io,
}

impl StoreError {
    /// Classify this error. Exhaustive — every variant has an explicit arm.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Io(_) => ErrorKind::Io,
            Self::PageNotFound { .. }
            | Self::VersionNotFound { .. }
            | Self::BranchNotFound { .. }
            | Self::RootNotFound { .. }
            | Self::NodeNotFound { .. } => ErrorKind::NotFound,
            Self::InvalidState { .. } => ErrorKind::InvalidState,
            Self::IntegrityViolation { .. } | Self::Parse(_) => ErrorKind::IntegrityViolation,
            Self::Unsupported { .. } => ErrorKind::Unsupported,
        }
    }
}

/// Result alias using `StoreError`.
pub type Result<T> = std::result::Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_mapping_covers_all_variants() {
        let cases: Vec<(StoreError, ErrorKind)> = vec![
            (StoreError::Io(std::io::Error::other("test")), ErrorKind::Io),
            (StoreError::PageNotFound { page: 1 }, ErrorKind::NotFound),
            (
                StoreError::VersionNotFound { version: 2 },
                ErrorKind::NotFound,
            ),
            (
                StoreError::BranchNotFound {
                    name: "main".into(),
                },
                ErrorKind::NotFound,
            ),
            (
                StoreError::RootNotFound { name: "ctr".into() },
                ErrorKind::NotFound,
            ),
            (StoreError::NodeNotFound { node: 3 }, ErrorKind::NotFound),
            (
                StoreError::InvalidState {
                    op: "commit",
                    detail: "snapshot is DROPPED".into(),
                },
                ErrorKind::InvalidState,
            ),
            (
                StoreError::IntegrityViolation {
                    detail: "record count mismatch".into(),
                },
                ErrorKind::IntegrityViolation,
            ),
            (
                StoreError::Parse("insufficient data".into()),
                ErrorKind::IntegrityViolation,
            ),
            (
                StoreError::Unsupported {
                    detail: "bad signature".into(),
                },
                ErrorKind::Unsupported,
            ),
        ];

        for (error, expected) in &cases {
            assert_eq!(error.kind(), *expected, "wrong kind for {error:?}");
        }
    }

    #[test]
    fn display_formatting() {
        let err = StoreError::PageNotFound { page: 0xAB };
        assert_eq!(
            err.to_string(),
            "page not found: 000000000000000000000000000000ab"
        );

        let err = StoreError::InvalidState {
            op: "branch",
            detail: "snapshot is ACTIVE".into(),
        };
        assert_eq!(
            err.to_string(),
            "operation branch not permitted: snapshot is ACTIVE"
        );

        let err = StoreError::BranchNotFound {
            name: "release".into(),
        };
        assert_eq!(err.to_string(), "branch not found: release");
    }
}
