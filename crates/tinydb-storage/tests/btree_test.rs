//! End-to-end B+Tree scenarios over a real disk-backed buffer pool:
//! small-fanout splits, underflow repair by redistribution and merge,
//! duplicate keys, and crash-consistency after a full flush and reopen.

use std::collections::BTreeMap;
use std::sync::Arc;
use tempfile::tempdir;
use tinydb_buffer::{BufferPoolConfig, BufferPoolManager, DiskManager, DiskManagerConfig};
use tinydb_common::{Column, PageHeader, PageId, PageType, Rid, Schema, TypeId, Value};
use tinydb_storage::{BPlusTree, GenericComparator, GenericKey, InternalPage, LeafPage, Tuple};
use tinydb_wal::{LogManager, LogManagerConfig};

const W: usize = 8;

struct Fixture {
    bpm: Arc<BufferPoolManager>,
    log: Option<Arc<LogManager>>,
    _dir: tempfile::TempDir,
}

fn fixture(pool_size: usize, with_log: bool) -> Fixture {
    let dir = tempdir().unwrap();
    let disk = Arc::new(
        DiskManager::new(DiskManagerConfig {
            db_path: dir.path().join("tinydb.db"),
            fsync_enabled: false,
        })
        .unwrap(),
    );
    let log = if with_log {
        Some(Arc::new(
            LogManager::new(LogManagerConfig {
                log_path: dir.path().join("tinydb.wal"),
                fsync_enabled: false,
            })
            .unwrap(),
        ))
    } else {
        None
    };
    let bpm = Arc::new(BufferPoolManager::new(
        BufferPoolConfig { pool_size },
        disk,
        log.clone(),
    ));
    Fixture {
        bpm,
        log,
        _dir: dir,
    }
}

fn key_schema() -> Arc<Schema> {
    Arc::new(Schema::new(vec![Column::new("k", TypeId::BigInt)]))
}

fn comparator() -> GenericComparator<W> {
    GenericComparator::new(key_schema()).unwrap()
}

fn make_tree(
    fx: &Fixture,
    leaf_max: u32,
    internal_max: u32,
    allow_duplicates: bool,
) -> BPlusTree<W> {
    BPlusTree::new(
        "idx_test",
        Arc::clone(&fx.bpm),
        fx.log.clone(),
        comparator(),
        leaf_max,
        internal_max,
        allow_duplicates,
    )
    .unwrap()
}

fn key(v: i64) -> GenericKey<W> {
    let schema = key_schema();
    let tuple = Tuple::from_values(&[Value::BigInt(Some(v))], &schema).unwrap();
    GenericKey::from_tuple(&tuple).unwrap()
}

fn key_value(k: &GenericKey<W>) -> i64 {
    let raw = k.as_bytes();
    i64::from_le_bytes([
        raw[0], raw[1], raw[2], raw[3], raw[4], raw[5], raw[6], raw[7],
    ])
}

fn rid(v: u32) -> Rid {
    Rid::new(PageId(v), v)
}

fn scan(tree: &BPlusTree<W>, v: i64) -> Vec<Rid> {
    let mut out = Vec::new();
    tree.scan(&key(v), &mut out).unwrap();
    out
}

/// Keys of a leaf page, decoded.
fn leaf_keys(bpm: &BufferPoolManager, page_id: PageId) -> Vec<i64> {
    let pin = bpm.fetch_page(page_id, true).unwrap().unwrap();
    let latch = pin.latch_read();
    let leaf = LeafPage::<_, W>::new(latch.as_slice());
    (0..leaf.size()).map(|i| key_value(&leaf.key_at(i))).collect()
}

/// Recursively verifies balance, occupancy, parent links, and separator
/// ordering; appends leaf pages in tree order.
fn verify_subtree(
    bpm: &BufferPoolManager,
    page_id: PageId,
    expected_parent: PageId,
    depth: usize,
    leaves: &mut Vec<(PageId, usize)>,
) {
    let pin = bpm.fetch_page(page_id, true).unwrap().unwrap();
    let latch = pin.latch_read();
    let data = latch.as_slice();

    assert_eq!(
        PageHeader::parent_of(data),
        expected_parent,
        "{} has a stale parent link",
        page_id
    );

    let size = PageHeader::size_of(data) as usize;
    let max = PageHeader::max_size_of(data) as usize;
    let min = (max + 1) / 2;
    let is_root = !expected_parent.is_valid();

    match PageHeader::page_type_of(data).unwrap() {
        PageType::Leaf => {
            if !is_root {
                assert!(
                    size >= min && size <= max,
                    "{} occupancy {} outside [{}, {}]",
                    page_id,
                    size,
                    min,
                    max
                );
            }
            let leaf = LeafPage::<_, W>::new(data);
            for i in 1..size {
                assert!(
                    key_value(&leaf.key_at(i - 1)) <= key_value(&leaf.key_at(i)),
                    "{} keys out of order",
                    page_id
                );
            }
            leaves.push((page_id, depth));
        }
        PageType::Internal => {
            if is_root {
                assert!(size >= 2, "internal root with {} children", size);
            } else {
                assert!(
                    size >= min && size <= max,
                    "{} occupancy {} outside [{}, {}]",
                    page_id,
                    size,
                    min,
                    max
                );
            }
            let node = InternalPage::<_, W>::new(data);
            for i in 2..size {
                assert!(
                    key_value(&node.key_at(i - 1)) <= key_value(&node.key_at(i)),
                    "{} separators out of order",
                    page_id
                );
            }
            let children: Vec<PageId> = (0..size).map(|i| node.child_at(i)).collect();
            drop(latch);
            drop(pin);
            for child in children {
                verify_subtree(bpm, child, page_id, depth + 1, leaves);
            }
        }
        PageType::Invalid => panic!("{} has no page type", page_id),
    }
}

/// Checks the five structural invariants: order, balance, occupancy,
/// parent links, and the leaf chain.
fn verify_tree(bpm: &BufferPoolManager, tree: &BPlusTree<W>) {
    let root = tree.root_page_id();
    if !root.is_valid() {
        return;
    }

    let mut leaves = Vec::new();
    verify_subtree(bpm, root, tinydb_common::INVALID_PAGE_ID, 0, &mut leaves);

    // Balance: every root-to-leaf path has the same length.
    let depth = leaves[0].1;
    assert!(
        leaves.iter().all(|&(_, d)| d == depth),
        "leaves at unequal depths"
    );

    // The next-pointer chain visits the leaves in tree order, and the
    // concatenated keys ascend.
    let mut all_keys = Vec::new();
    for (idx, &(page_id, _)) in leaves.iter().enumerate() {
        let pin = bpm.fetch_page(page_id, true).unwrap().unwrap();
        let latch = pin.latch_read();
        let leaf = LeafPage::<_, W>::new(latch.as_slice());
        let next = leaf.next_page_id();
        if idx + 1 < leaves.len() {
            assert_eq!(next, leaves[idx + 1].0, "leaf chain broken at {}", page_id);
        } else {
            assert!(!next.is_valid(), "last leaf {} has a successor", page_id);
        }
        for i in 0..leaf.size() {
            all_keys.push(key_value(&leaf.key_at(i)));
        }
    }
    for pair in all_keys.windows(2) {
        assert!(pair[0] <= pair[1], "global key order violated");
    }
}

/// Builds the E1 state: leaf_max = 3, internal_max = 3, keys 1..=4.
fn build_e1(fx: &Fixture) -> BPlusTree<W> {
    let tree = make_tree(fx, 3, 3, false);
    for v in 1..=4i64 {
        assert!(tree.insert(&key(v), rid(v as u32)).unwrap());
    }
    tree
}

#[test]
fn test_e1_small_leaf_split() {
    let fx = fixture(32, false);
    let tree = build_e1(&fx);

    let root = tree.root_page_id();
    let pin = fx.bpm.fetch_page(root, true).unwrap().unwrap();
    let latch = pin.latch_read();
    assert_eq!(
        PageHeader::page_type_of(latch.as_slice()).unwrap(),
        PageType::Internal
    );
    let node = InternalPage::<_, W>::new(latch.as_slice());
    assert_eq!(node.size(), 2);
    assert_eq!(key_value(&node.key_at(1)), 3);

    let left = node.child_at(0);
    let right = node.child_at(1);
    drop(latch);
    drop(pin);

    assert_eq!(leaf_keys(&fx.bpm, left), vec![1, 2]);
    assert_eq!(leaf_keys(&fx.bpm, right), vec![3, 4]);

    // Leaf chain runs left to right.
    let pin = fx.bpm.fetch_page(left, true).unwrap().unwrap();
    let latch = pin.latch_read();
    let leaf = LeafPage::<_, W>::new(latch.as_slice());
    assert_eq!(leaf.next_page_id(), right);
    drop(latch);
    drop(pin);

    verify_tree(&fx.bpm, &tree);
}

#[test]
fn test_e2_delete_underflow_redistributes() {
    let fx = fixture(32, false);
    let tree = build_e1(&fx);

    // Right leaf grows to {3,4,5}.
    assert!(tree.insert(&key(5), rid(5)).unwrap());
    // Deleting 1 underflows the left leaf; it borrows 3 from the right.
    assert!(tree.delete(&key(1), rid(1)).unwrap());

    let root = tree.root_page_id();
    let pin = fx.bpm.fetch_page(root, true).unwrap().unwrap();
    let latch = pin.latch_read();
    let node = InternalPage::<_, W>::new(latch.as_slice());
    assert_eq!(node.size(), 2);
    assert_eq!(key_value(&node.key_at(1)), 4);
    let left = node.child_at(0);
    let right = node.child_at(1);
    drop(latch);
    drop(pin);

    assert_eq!(leaf_keys(&fx.bpm, left), vec![2, 3]);
    assert_eq!(leaf_keys(&fx.bpm, right), vec![4, 5]);
    verify_tree(&fx.bpm, &tree);
}

#[test]
fn test_e3_delete_underflow_merges_to_root_leaf() {
    let fx = fixture(32, false);
    let tree = build_e1(&fx);

    assert!(tree.delete(&key(1), rid(1)).unwrap());
    assert!(tree.delete(&key(2), rid(2)).unwrap());

    // The tree collapsed to a single leaf root of height 1.
    let root = tree.root_page_id();
    let pin = fx.bpm.fetch_page(root, true).unwrap().unwrap();
    let latch = pin.latch_read();
    assert_eq!(
        PageHeader::page_type_of(latch.as_slice()).unwrap(),
        PageType::Leaf
    );
    drop(latch);
    drop(pin);

    assert_eq!(leaf_keys(&fx.bpm, root), vec![3, 4]);
    verify_tree(&fx.bpm, &tree);
}

#[test]
fn test_e4_duplicate_keys() {
    let fx = fixture(32, false);
    let tree = make_tree(&fx, BPlusTree::<W>::default_leaf_max_size(), 4, true);

    let a = Rid::new(PageId(10), 1);
    let b = Rid::new(PageId(20), 2);
    let c = Rid::new(PageId(30), 3);

    assert!(tree.insert(&key(5), a).unwrap());
    assert!(tree.insert(&key(5), b).unwrap());
    assert!(tree.insert(&key(5), c).unwrap());

    assert_eq!(scan(&tree, 5), vec![a, b, c]);

    assert!(tree.delete(&key(5), b).unwrap());
    assert_eq!(scan(&tree, 5), vec![a, c]);
    verify_tree(&fx.bpm, &tree);
}

#[test]
fn test_duplicates_across_leaf_splits() {
    let fx = fixture(64, false);
    let tree = make_tree(&fx, 3, 3, true);

    // Enough duplicates to split leaves repeatedly.
    let mut expected = Vec::new();
    for i in 0..12u32 {
        let r = Rid::new(PageId(100 + i), i);
        assert!(tree.insert(&key(7), r).unwrap());
        expected.push(r);
    }
    assert_eq!(scan(&tree, 7), expected);
    verify_tree(&fx.bpm, &tree);

    // Delete from the middle of the run; order of the rest persists.
    assert!(tree.delete(&key(7), expected[5]).unwrap());
    expected.remove(5);
    assert_eq!(scan(&tree, 7), expected);
}

#[test]
fn test_sequential_and_reverse_workload() {
    let fx = fixture(64, false);
    let tree = make_tree(&fx, 4, 4, false);

    for v in 1..=100i64 {
        assert!(tree.insert(&key(v), rid(v as u32)).unwrap());
    }
    verify_tree(&fx.bpm, &tree);

    for v in (1..=100i64).rev() {
        assert_eq!(scan(&tree, v), vec![rid(v as u32)]);
    }

    // Delete odd keys; even keys survive.
    for v in (1..=100i64).filter(|v| v % 2 == 1) {
        assert!(tree.delete(&key(v), rid(v as u32)).unwrap());
    }
    verify_tree(&fx.bpm, &tree);
    for v in 1..=100i64 {
        let expected = if v % 2 == 0 { vec![rid(v as u32)] } else { vec![] };
        assert_eq!(scan(&tree, v), expected);
    }
}

#[test]
fn test_randomized_against_model() {
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    let fx = fixture(128, false);
    let tree = make_tree(&fx, 4, 4, false);
    let mut model: BTreeMap<i64, Rid> = BTreeMap::new();
    let mut rng = StdRng::seed_from_u64(0xB7EE);

    for step in 0..600 {
        let v = rng.gen_range(0..200i64);
        if rng.gen_bool(0.6) {
            let r = rid(v as u32);
            let inserted = tree.insert(&key(v), r).unwrap();
            assert_eq!(inserted, !model.contains_key(&v), "step {}", step);
            model.entry(v).or_insert(r);
        } else {
            let r = rid(v as u32);
            let deleted = tree.delete(&key(v), r).unwrap();
            assert_eq!(deleted, model.remove(&v).is_some(), "step {}", step);
        }
    }

    verify_tree(&fx.bpm, &tree);
    for v in 0..200i64 {
        let expected: Vec<Rid> = model.get(&v).copied().into_iter().collect();
        assert_eq!(scan(&tree, v), expected, "key {}", v);
    }
    assert!(fx.bpm.check_pin_count());
}

#[test]
fn test_modifications_stamp_lsns() {
    let fx = fixture(32, true);
    let tree = make_tree(&fx, 3, 3, false);

    for v in 1..=6i64 {
        tree.insert(&key(v), rid(v as u32)).unwrap();
    }

    let log = fx.log.as_ref().unwrap();
    let root = tree.root_page_id();
    let pin = fx.bpm.fetch_page(root, true).unwrap().unwrap();
    let latch = pin.latch_read();
    let lsn = PageHeader::lsn_of(latch.as_slice());
    assert!(lsn > 0, "modified page carries no LSN");
    assert!(tinydb_wal::Lsn(lsn) < log.next_lsn());
}

#[test]
fn test_e6_reopen_preserves_invariants() {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("tinydb.db");
    let wal_path = dir.path().join("tinydb.wal");
    let root;

    {
        let disk = Arc::new(
            DiskManager::new(DiskManagerConfig {
                db_path: db_path.clone(),
                fsync_enabled: false,
            })
            .unwrap(),
        );
        let log = Arc::new(
            LogManager::new(LogManagerConfig {
                log_path: wal_path.clone(),
                fsync_enabled: false,
            })
            .unwrap(),
        );
        let bpm = Arc::new(BufferPoolManager::new(
            BufferPoolConfig { pool_size: 64 },
            Arc::clone(&disk),
            Some(Arc::clone(&log)),
        ));
        let tree = BPlusTree::<W>::new(
            "idx_persist",
            Arc::clone(&bpm),
            Some(log),
            comparator(),
            4,
            4,
            false,
        )
        .unwrap();

        for v in 1..=60i64 {
            assert!(tree.insert(&key(v), rid(v as u32)).unwrap());
        }
        root = tree.root_page_id();
        bpm.flush_all_pages().unwrap();
    }

    // A fresh buffer pool over the same file sees the same tree.
    let disk = Arc::new(
        DiskManager::new(DiskManagerConfig {
            db_path,
            fsync_enabled: false,
        })
        .unwrap(),
    );
    let bpm = Arc::new(BufferPoolManager::new(
        BufferPoolConfig { pool_size: 64 },
        disk,
        None,
    ));
    let tree = BPlusTree::<W>::open(
        "idx_persist",
        Arc::clone(&bpm),
        None,
        comparator(),
        4,
        4,
        false,
        root,
    )
    .unwrap();

    verify_tree(&bpm, &tree);
    for v in 1..=60i64 {
        assert_eq!(scan(&tree, v), vec![rid(v as u32)]);
    }
    assert_eq!(scan(&tree, 61), vec![]);
}
