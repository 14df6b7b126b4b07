//! Container-root directory page.
//!
//! Each version stores its named container roots in an ordinary data page
//! under the reserved id [`DIRECTORY_PAGE_ID`], so directory updates ride
//! the same copy-on-write and persistence paths as any other page. The
//! empty name never reaches the directory; it is served straight from the
//! version vertex.

use std::collections::BTreeMap;

use pv_error::StoreError;
use pv_page::{Page, PageOps, PageTypeRegistry, RawPageOps};
use pv_types::{
    CtrTypeTag, PageId, PageTypeTag, ParseError, read_le_u16, read_le_u32, read_le_u128,
};

/// Reserved page id of the per-version directory.
pub const DIRECTORY_PAGE_ID: PageId = PageId(1);

/// Container type tag of the directory page.
pub const DIRECTORY_CTR_TYPE: CtrTypeTag = CtrTypeTag(0x10);

/// Page type tag of the directory page.
pub const DIRECTORY_PAGE_TYPE: PageTypeTag = PageTypeTag(0x10);

/// Encode a directory map. Entries are written in key order, so equal maps
/// produce identical bytes. Counts and name lengths that do not fit their
/// wire fields are refused rather than truncated.
pub(crate) fn encode(map: &BTreeMap<String, PageId>) -> pv_error::Result<Vec<u8>> {
    let count = u32::try_from(map.len()).map_err(|_| StoreError::Unsupported {
        detail: format!("directory of {} entries exceeds the record limit", map.len()),
    })?;
    let mut out = Vec::new();
    out.extend_from_slice(&count.to_le_bytes());
    for (name, root) in map {
        let len = u16::try_from(name.len()).map_err(|_| StoreError::Unsupported {
            detail: format!(
                "container name of {} bytes exceeds the record limit",
                name.len()
            ),
        })?;
        out.extend_from_slice(&len.to_le_bytes());
        out.extend_from_slice(name.as_bytes());
        out.extend_from_slice(&root.0.to_le_bytes());
    }
    Ok(out)
}

pub(crate) fn decode(bytes: &[u8]) -> Result<BTreeMap<String, PageId>, ParseError> {
    let mut map = BTreeMap::new();
    if bytes.is_empty() {
        return Ok(map);
    }
    let count = read_le_u32(bytes, 0)?;
    let mut offset = 4;
    for _ in 0..count {
        let len = read_le_u16(bytes, offset)? as usize;
        offset += 2;
        let raw = pv_types::ensure_slice(bytes, offset, len)?;
        let name = String::from_utf8(raw.to_vec()).map_err(|_| ParseError::InvalidField {
            field: "directory entry name",
            reason: "not valid UTF-8",
        })?;
        offset += len;
        let root = PageId(read_le_u128(bytes, offset)?);
        offset += 16;
        map.insert(name, root);
    }
    Ok(map)
}

/// Payload operations for the directory page: raw bytes on the wire, and
/// the registered container roots as children so import and copy walks
/// carry whole directories across stores.
#[derive(Debug, Default, Clone, Copy)]
pub struct DirectoryPageOps;

impl PageOps for DirectoryPageOps {
    fn serialize(&self, page: &Page) -> pv_error::Result<Vec<u8>> {
        RawPageOps.serialize(page)
    }

    fn deserialize(
        &self,
        id: PageId,
        ctr_type: CtrTypeTag,
        page_type: PageTypeTag,
        page_size: u32,
        bytes: &[u8],
    ) -> pv_error::Result<Page> {
        RawPageOps.deserialize(id, ctr_type, page_type, page_size, bytes)
    }

    fn resize(&self, page: &mut Page, new_size: u32) -> pv_error::Result<()> {
        RawPageOps.resize(page, new_size)
    }

    fn child_ids(&self, page: &Page) -> pv_error::Result<Vec<PageId>> {
        let map = decode(page.bytes())
            .map_err(|e| pv_error::StoreError::Parse(e.to_string()))?;
        Ok(map.into_values().collect())
    }
}

/// Register the directory page type. Called once per store construction.
pub(crate) fn register(registry: &mut PageTypeRegistry) {
    registry.register(
        DIRECTORY_CTR_TYPE,
        DIRECTORY_PAGE_TYPE,
        std::sync::Arc::new(DirectoryPageOps),
    );
}
