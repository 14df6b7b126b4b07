//! End-to-end store scenarios through the public API.

use std::sync::Arc;

use pagevault::{
    Allocator, CtrTypeTag, Page, PageId, PageOps, PageTypeRegistry, PageTypeTag, RawPageOps,
    SharedPage, StoreError,
};

const RAW_CTR: CtrTypeTag = CtrTypeTag(1);
const RAW_PT: PageTypeTag = PageTypeTag(1);
const INDEX_CTR: CtrTypeTag = CtrTypeTag(2);
const INDEX_PT: PageTypeTag = PageTypeTag(2);

/// Index page payload: `count: u32` followed by `count` child page ids.
/// Lets the store walk a two-level container during import and copy.
#[derive(Debug, Default, Clone, Copy)]
struct IndexPageOps;

impl PageOps for IndexPageOps {
    fn serialize(&self, page: &Page) -> pagevault::Result<Vec<u8>> {
        RawPageOps.serialize(page)
    }

    fn deserialize(
        &self,
        id: PageId,
        ctr_type: CtrTypeTag,
        page_type: PageTypeTag,
        page_size: u32,
        bytes: &[u8],
    ) -> pagevault::Result<Page> {
        RawPageOps.deserialize(id, ctr_type, page_type, page_size, bytes)
    }

    fn resize(&self, page: &mut Page, new_size: u32) -> pagevault::Result<()> {
        RawPageOps.resize(page, new_size)
    }

    fn child_ids(&self, page: &Page) -> pagevault::Result<Vec<PageId>> {
        let bytes = page.bytes();
        let count = u32::from_le_bytes(bytes[..4].try_into().map_err(|_| {
            StoreError::IntegrityViolation {
                detail: "index page shorter than its header".to_owned(),
            }
        })?) as usize;
        let mut children = Vec::with_capacity(count);
        for i in 0..count {
            let start = 4 + i * 16;
            let raw: [u8; 16] =
                bytes
                    .get(start..start + 16)
                    .and_then(|s| s.try_into().ok())
                    .ok_or_else(|| StoreError::IntegrityViolation {
                        detail: "index page truncated".to_owned(),
                    })?;
            children.push(PageId(u128::from_le_bytes(raw)));
        }
        Ok(children)
    }
}

fn registry() -> PageTypeRegistry {
    let mut registry = PageTypeRegistry::new();
    registry.register(RAW_CTR, RAW_PT, Arc::new(RawPageOps));
    registry.register(INDEX_CTR, INDEX_PT, Arc::new(IndexPageOps));
    registry
}

fn set_index(page: &SharedPage, children: &[PageId]) {
    let mut bytes = Vec::with_capacity(4 + children.len() * 16);
    bytes.extend_from_slice(&(u32::try_from(children.len()).unwrap()).to_le_bytes());
    for child in children {
        bytes.extend_from_slice(&child.0.to_le_bytes());
    }
    page.write().set_bytes(bytes);
}

#[test]
fn diverging_branches_stay_isolated() {
    let (alloc, base) = Allocator::create(registry()).unwrap();
    let page = base.create_page(8, RAW_CTR, RAW_PT).unwrap();
    let id = page.id();
    base.commit().unwrap();

    let mut versions = Vec::new();
    for value in 1..=3_u8 {
        let branch = base.branch().unwrap();
        branch.get_page_for_update(id).unwrap().write().bytes_mut()[0] = value;
        versions.push(branch.version());
        branch.commit().unwrap();
    }

    assert_eq!(base.get_page(id).unwrap().read().bytes()[0], 0);
    for (i, version) in versions.iter().enumerate() {
        let snap = alloc.find(*version).unwrap();
        assert_eq!(snap.get_page(id).unwrap().read().bytes()[0], i as u8 + 1);
    }
    // Each branch installed its own copy; the original keeps its single
    // base reference.
    assert_eq!(page.ref_count(), 1);
}

#[test]
fn import_walks_the_container_graph() {
    let (_alloc, s0) = Allocator::create(registry()).unwrap();
    let leaf_a = s0.create_page(8, RAW_CTR, RAW_PT).unwrap();
    let leaf_b = s0.create_page(8, RAW_CTR, RAW_PT).unwrap();
    let index = s0.create_page(4, INDEX_CTR, INDEX_PT).unwrap();
    set_index(&index, &[leaf_a.id(), leaf_b.id()]);
    s0.set_root("tree", Some(index.id())).unwrap();
    s0.commit().unwrap();

    let s1 = s0.branch().unwrap();
    s1.import_container_from(&s0, "tree").unwrap();
    s1.commit().unwrap();

    // Every page of the container is shared, not copied.
    for page in [&index, &leaf_a, &leaf_b] {
        let through_branch = s1.get_page(page.id()).unwrap();
        assert!(through_branch.same_page(page));
        assert_eq!(page.ref_count(), 2);
    }
    assert_eq!(s1.root("tree").unwrap(), index.id());
}

#[test]
fn failed_import_leaves_the_destination_untouched() {
    let (_alloc, s0) = Allocator::create(registry()).unwrap();
    s0.commit().unwrap();

    // A container whose index references a page that does not exist.
    let s1 = s0.branch().unwrap();
    let leaf = s1.create_page(8, RAW_CTR, RAW_PT).unwrap();
    let index = s1.create_page(4, INDEX_CTR, INDEX_PT).unwrap();
    set_index(&index, &[leaf.id(), PageId(0xdead_beef)]);
    s1.set_root("tree", Some(index.id())).unwrap();
    s1.commit().unwrap();

    let s2 = s0.branch().unwrap();
    let err = s2.import_container_from(&s1, "tree").unwrap_err();
    assert!(matches!(err, StoreError::PageNotFound { .. }));

    // Nothing was installed: no root, no pages, no stray references.
    assert!(!s2.has_root("tree").unwrap());
    assert!(matches!(
        s2.get_page(index.id()),
        Err(StoreError::PageNotFound { .. })
    ));
    assert!(matches!(
        s2.get_page(leaf.id()),
        Err(StoreError::PageNotFound { .. })
    ));
    assert_eq!(index.ref_count(), 1);
    assert_eq!(leaf.ref_count(), 1);
    s2.commit().unwrap();
}

#[test]
fn copy_carries_a_container_to_another_store() {
    let (_alloc_a, sa) = Allocator::create(registry()).unwrap();
    let leaf = sa.create_page(8, RAW_CTR, RAW_PT).unwrap();
    leaf.write().bytes_mut()[0] = 0xab;
    let index = sa.create_page(4, INDEX_CTR, INDEX_PT).unwrap();
    set_index(&index, &[leaf.id()]);
    sa.set_root("tree", Some(index.id())).unwrap();
    sa.commit().unwrap();

    let (_alloc_b, sb) = Allocator::create(registry()).unwrap();
    sb.copy_container_from(&sa, "tree").unwrap();
    sb.commit().unwrap();

    let copied_leaf = sb.get_page(leaf.id()).unwrap();
    assert!(!copied_leaf.same_page(&leaf));
    assert_eq!(copied_leaf.read().bytes()[0], 0xab);
    assert_eq!(leaf.ref_count(), 1);
    assert_eq!(sb.root("tree").unwrap(), index.id());
}

#[test]
fn large_store_survives_a_file_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("vault.img");

    let (alloc, s0) = Allocator::create(registry()).unwrap();
    let mut ids = Vec::new();
    for i in 0..200_u32 {
        let page = s0.create_page(16, RAW_CTR, RAW_PT).unwrap();
        page.write().bytes_mut()[..4].copy_from_slice(&i.to_le_bytes());
        ids.push(page.id());
    }
    let v0 = s0.version();
    s0.commit().unwrap();

    // Rewrite every fourth page in a branch.
    let s1 = s0.branch().unwrap();
    for (i, id) in ids.iter().enumerate().filter(|(i, _)| i % 4 == 0) {
        let page = s1.get_page_for_update(*id).unwrap();
        page.write().bytes_mut()[4] = i as u8;
    }
    let v1 = s1.version();
    s1.commit().unwrap();
    alloc.set_master(v1).unwrap();
    drop(s0);
    drop(s1);

    alloc.store_to_file(&path).unwrap();
    let loaded = Allocator::load_from_file(&path, registry()).unwrap();

    let old = loaded.find(v0).unwrap();
    let new = loaded.master().unwrap();
    assert_eq!(new.version(), v1);
    for (i, id) in ids.iter().enumerate() {
        let original = old.get_page(*id).unwrap();
        assert_eq!(
            u32::from_le_bytes(original.read().bytes()[..4].try_into().unwrap()),
            i as u32
        );
        assert_eq!(original.read().bytes()[4], 0);
        let current = new.get_page(*id).unwrap();
        let expected = if i % 4 == 0 { i as u8 } else { 0 };
        assert_eq!(current.read().bytes()[4], expected);
    }
}

#[test]
fn a_loaded_store_keeps_branching() {
    let (alloc, s0) = Allocator::create(registry()).unwrap();
    let page = s0.create_page(8, RAW_CTR, RAW_PT).unwrap();
    let id = page.id();
    s0.set_root("", Some(id)).unwrap();
    s0.commit().unwrap();
    drop(s0);

    let mut image = Vec::new();
    alloc.store(&mut image).unwrap();
    let loaded = Allocator::load(&mut image.as_slice(), registry()).unwrap();

    let base = loaded.master().unwrap();
    let branch = base.branch().unwrap();
    branch.get_page_for_update(id).unwrap().write().bytes_mut()[0] = 9;
    let v = branch.version();
    branch.commit().unwrap();
    loaded.set_master(v).unwrap();

    assert_eq!(base.get_page(id).unwrap().read().bytes()[0], 0);
    assert_eq!(
        loaded.master().unwrap().get_page(id).unwrap().read().bytes()[0],
        9
    );
    // Serializing the evolved store works too.
    drop(base);
    let mut second = Vec::new();
    assert!(loaded.store(&mut second).unwrap() > 0);
}

#[test]
fn parallel_branches_commit_independently() {
    let (alloc, base) = Allocator::create(registry()).unwrap();
    let page = base.create_page(8, RAW_CTR, RAW_PT).unwrap();
    let id = page.id();
    base.commit().unwrap();
    let base = Arc::new(base);

    let workers: Vec<_> = (1..=4_u8)
        .map(|value| {
            let base = Arc::clone(&base);
            std::thread::spawn(move || {
                let branch = base.branch().unwrap();
                branch.get_page_for_update(id).unwrap().write().bytes_mut()[0] = value;
                let version = branch.version();
                branch.commit().unwrap();
                (version, value)
            })
        })
        .collect();

    for worker in workers {
        let (version, value) = worker.join().unwrap();
        let snap = alloc.find(version).unwrap();
        assert_eq!(snap.get_page(id).unwrap().read().bytes()[0], value);
    }
    assert_eq!(base.get_page(id).unwrap().read().bytes()[0], 0);
}
