#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// 12-byte signature at the start of every serialized store image.
pub const STORE_SIGNATURE: [u8; 12] = *b"MEMORIA\0\0\0\0\0";

/// Endianness marker following the signature. Little-endian is the only
/// supported encoding.
pub const ENDIAN_LITTLE: u8 = 0;

/// Stream format revision following the endianness byte.
pub const FORMAT_V1: u8 = 0;

/// Total header size: signature + endianness byte + format byte.
pub const HEADER_SIZE: usize = 14;

/// Stable identity of a page. Identity survives copy-on-write cloning of the
/// page's storage; content may be replaced wholesale but never mutated in
/// place while shared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PageId(pub u128);

impl PageId {
    /// Sentinel meaning "no page" in the serialized stream.
    pub const NONE: Self = Self(0);
}

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

/// Identity of one vertex of the version graph (one snapshot).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct VersionId(pub u128);

impl VersionId {
    /// Sentinel meaning "no version" in the serialized stream.
    pub const NONE: Self = Self(0);
}

impl fmt::Display for VersionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

/// Identity of one persistent-tree node (branch or leaf).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(pub u128);

impl NodeId {
    /// Sentinel meaning "no node" in the serialized stream.
    pub const NONE: Self = Self(0);
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

/// Container-kind tag of a page payload. The core never interprets payload
/// bytes; this tag (with [`PageTypeTag`]) selects the registered payload
/// operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CtrTypeTag(pub u64);

/// Page-kind tag within a container kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PageTypeTag(pub u64);

/// Lifecycle state of a version-graph vertex.
///
/// Legal transitions: `Active → Committed`, `Active → DataLocked`,
/// `{Active, DataLocked} → Dropped`. `Committed` is terminal and is the only
/// state a new branch may be forked from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SnapshotStatus {
    /// Freshly created, mutable through exactly one logical writer.
    Active,
    /// Immutable; a valid branch point and serialization subject.
    Committed,
    /// Marked for deletion; the vertex stays in the graph until it has no
    /// children and no external references.
    Dropped,
    /// Mutation frozen except for container import.
    DataLocked,
}

impl SnapshotStatus {
    #[must_use]
    pub fn as_byte(self) -> u8 {
        match self {
            Self::Active => 0,
            Self::Committed => 1,
            Self::Dropped => 2,
            Self::DataLocked => 3,
        }
    }

    pub fn from_byte(value: u8) -> Result<Self, ParseError> {
        match value {
            0 => Ok(Self::Active),
            1 => Ok(Self::Committed),
            2 => Ok(Self::Dropped),
            3 => Ok(Self::DataLocked),
            _ => Err(ParseError::InvalidField {
                field: "status",
                reason: "unknown snapshot status byte",
            }),
        }
    }
}

impl fmt::Display for SnapshotStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Active => "ACTIVE",
            Self::Committed => "COMMITTED",
            Self::Dropped => "DROPPED",
            Self::DataLocked => "DATA_LOCKED",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("insufficient data: need {needed} bytes at offset {offset}, got {actual}")]
    InsufficientData {
        needed: usize,
        offset: usize,
        actual: usize,
    },
    #[error("invalid signature")]
    InvalidSignature,
    #[error("invalid field: {field} ({reason})")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
    #[error("integer conversion failed: {field}")]
    IntegerConversion { field: &'static str },
}

#[inline]
pub fn ensure_slice(data: &[u8], offset: usize, len: usize) -> Result<&[u8], ParseError> {
    let Some(end) = offset.checked_add(len) else {
        return Err(ParseError::InvalidField {
            field: "offset",
            reason: "overflow",
        });
    };

    if end > data.len() {
        return Err(ParseError::InsufficientData {
            needed: len,
            offset,
            actual: data.len().saturating_sub(offset),
        });
    }

    Ok(&data[offset..end])
}

#[inline]
pub fn read_le_u16(data: &[u8], offset: usize) -> Result<u16, ParseError> {
    let bytes = ensure_slice(data, offset, 2)?;
    Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
}

#[inline]
pub fn read_le_u32(data: &[u8], offset: usize) -> Result<u32, ParseError> {
    let bytes = ensure_slice(data, offset, 4)?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

#[inline]
pub fn read_le_u64(data: &[u8], offset: usize) -> Result<u64, ParseError> {
    let bytes = read_fixed::<8>(data, offset)?;
    Ok(u64::from_le_bytes(bytes))
}

#[inline]
pub fn read_le_u128(data: &[u8], offset: usize) -> Result<u128, ParseError> {
    let bytes = read_fixed::<16>(data, offset)?;
    Ok(u128::from_le_bytes(bytes))
}

#[inline]
pub fn read_le_i64(data: &[u8], offset: usize) -> Result<i64, ParseError> {
    let bytes = read_fixed::<8>(data, offset)?;
    Ok(i64::from_le_bytes(bytes))
}

#[inline]
pub fn read_fixed<const N: usize>(data: &[u8], offset: usize) -> Result<[u8; N], ParseError> {
    let bytes = ensure_slice(data, offset, N)?;
    let mut out = [0_u8; N];
    out.copy_from_slice(bytes);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_bytes_round_trip() {
        for status in [
            SnapshotStatus::Active,
            SnapshotStatus::Committed,
            SnapshotStatus::Dropped,
            SnapshotStatus::DataLocked,
        ] {
            assert_eq!(SnapshotStatus::from_byte(status.as_byte()), Ok(status));
        }
        assert!(SnapshotStatus::from_byte(9).is_err());
    }

    #[test]
    fn read_helpers_report_truncation() {
        let data = [1_u8, 2, 3];
        let err = read_le_u32(&data, 0).expect_err("3 bytes cannot hold u32");
        assert_eq!(
            err,
            ParseError::InsufficientData {
                needed: 4,
                offset: 0,
                actual: 3,
            }
        );

        assert_eq!(read_le_u16(&data, 1), Ok(u16::from_le_bytes([2, 3])));
    }

    #[test]
    fn ids_format_as_padded_hex() {
        assert_eq!(format!("{}", PageId(0xAB)).len(), 32);
        assert!(format!("{}", VersionId(0xAB)).starts_with("000"));
    }

    #[test]
    fn signature_is_twelve_bytes() {
        assert_eq!(STORE_SIGNATURE.len(), 12);
        assert_eq!(&STORE_SIGNATURE[..8], b"MEMORIA\0");
        assert_eq!(HEADER_SIZE, STORE_SIGNATURE.len() + 2);
    }
}
