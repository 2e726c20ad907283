use std::sync::Arc;
use std::thread;

use anyhow::Result;
use rand::seq::SliceRandom;
use rand::thread_rng;
use rookdb::common::types::{PageId, Rid, INVALID_PAGE_ID};
use rookdb::index::btree::page::{BTreeInternalPage, BTreeLeafPage, BTreePage};
use rookdb::index::btree::{BTreeError, BTreeIndex};
use rookdb::storage::buffer::BufferPoolManager;

mod common;
use common::create_test_buffer_pool;

fn rid_for(key: i64) -> Rid {
    Rid::new(0, key as u32)
}

/// Number of levels from the root down to the leaves.
fn tree_depth(pool: &BufferPoolManager, root_id: PageId) -> usize {
    let mut depth = 1;
    let mut page_id = root_id;
    loop {
        let page = pool.fetch_page(page_id).unwrap();
        let next = {
            let guard = page.read();
            let node = BTreePage::view(&guard.data[..]);
            if node.is_leaf() {
                None
            } else {
                let internal = BTreeInternalPage::<_, i64>::view(&guard.data[..]);
                Some(internal.value_at(0))
            }
        };
        pool.unpin_page(page_id, false).unwrap();
        match next {
            Some(child) => {
                page_id = child;
                depth += 1;
            }
            None => return depth,
        }
    }
}

/// Walk the whole tree checking the structural invariants: sizes within
/// bounds, keys strictly ascending, parent pointers correct, and all
/// leaves at the same depth. Returns (depth, key count).
fn validate_subtree(
    pool: &BufferPoolManager,
    page_id: PageId,
    expected_parent: PageId,
) -> (usize, usize) {
    let page = pool.fetch_page(page_id).unwrap();
    let result = {
        let guard = page.read();
        let node = BTreePage::view(&guard.data[..]);
        assert_eq!(node.page_id(), page_id, "page id field mismatch");
        assert_eq!(
            node.parent_page_id(),
            expected_parent,
            "parent pointer wrong on page {}",
            page_id
        );
        assert!(
            node.size() >= node.min_size(),
            "page {} underflow: {} < {}",
            page_id,
            node.size(),
            node.min_size()
        );
        assert!(
            node.size() <= node.max_size(),
            "page {} overflow: {} > {}",
            page_id,
            node.size(),
            node.max_size()
        );

        if node.is_leaf() {
            let leaf = BTreeLeafPage::<_, i64>::view(&guard.data[..]);
            for i in 1..leaf.size() {
                assert!(leaf.key_at(i - 1) < leaf.key_at(i), "leaf keys out of order");
            }
            (1, leaf.size())
        } else {
            let internal = BTreeInternalPage::<_, i64>::view(&guard.data[..]);
            for i in 2..internal.size() {
                assert!(
                    internal.key_at(i - 1) < internal.key_at(i),
                    "internal keys out of order"
                );
            }
            let mut depth = 0;
            let mut count = 0;
            for i in 0..internal.size() {
                let (child_depth, child_count) =
                    validate_subtree(pool, internal.value_at(i), page_id);
                if i == 0 {
                    depth = child_depth;
                } else {
                    assert_eq!(depth, child_depth, "leaves at uneven depth");
                }
                count += child_count;
            }
            (depth + 1, count)
        }
    };
    pool.unpin_page(page_id, false).unwrap();
    result
}

fn validate_tree(pool: &BufferPoolManager, tree: &BTreeIndex<i64>, expected_keys: usize) {
    if tree.is_empty() {
        assert_eq!(expected_keys, 0);
        return;
    }
    let (_, count) = validate_subtree(pool, tree.root_page_id(), INVALID_PAGE_ID);
    assert_eq!(count, expected_keys, "key count mismatch");
}

#[test]
fn test_insert_and_find() -> Result<()> {
    let (buffer_pool, _temp_file) = create_test_buffer_pool(32)?;
    let tree = BTreeIndex::<i64>::new("test_insert_find", buffer_pool.clone())?;

    let test_data = [(5i64, 1001u32), (3, 1002), (8, 1003), (2, 1004), (7, 1005)];
    for &(key, slot) in &test_data {
        tree.insert(key, Rid::new(0, slot), None)?;
    }

    for &(key, slot) in &test_data {
        let results = tree.get_value(&key, None)?;
        assert_eq!(results, vec![Rid::new(0, slot)]);
    }

    assert!(tree.get_value(&100, None)?.is_empty());
    Ok(())
}

#[test]
fn test_duplicate_key_rejected() -> Result<()> {
    let (buffer_pool, _temp_file) = create_test_buffer_pool(32)?;
    let tree = BTreeIndex::<i64>::new("test_duplicates", buffer_pool.clone())?;

    tree.insert(42, rid_for(42), None)?;
    match tree.insert(42, Rid::new(9, 9), None) {
        Err(BTreeError::DuplicateKey) => {}
        other => panic!("expected DuplicateKey, got {:?}", other),
    }

    // The original mapping is untouched
    assert_eq!(tree.get_value(&42, None)?, vec![rid_for(42)]);
    Ok(())
}

#[test]
fn test_round_trip_and_idempotent_remove() -> Result<()> {
    let (buffer_pool, _temp_file) = create_test_buffer_pool(32)?;
    let tree = BTreeIndex::<i64>::new("test_round_trip", buffer_pool.clone())?;

    tree.insert(7, rid_for(7), None)?;
    assert_eq!(tree.get_value(&7, None)?, vec![rid_for(7)]);

    tree.remove(&7, None)?;
    assert!(tree.get_value(&7, None)?.is_empty());

    // Removing again is a silent no-op
    tree.remove(&7, None)?;
    assert!(tree.get_value(&7, None)?.is_empty());
    Ok(())
}

#[test]
fn test_split_propagation() -> Result<()> {
    let (buffer_pool, _temp_file) = create_test_buffer_pool(10)?;
    let tree = BTreeIndex::<i64>::with_max_sizes("test_splits", buffer_pool.clone(), 4, 4)?;

    for key in 1..=16i64 {
        tree.insert(key, rid_for(key), None)?;
    }
    for key in 1..=16i64 {
        assert_eq!(tree.get_value(&key, None)?, vec![rid_for(key)]);
    }

    assert_eq!(tree_depth(&buffer_pool, tree.root_page_id()), 3);
    validate_tree(&buffer_pool, &tree, 16);

    tree.remove(&8, None)?;
    assert!(tree.get_value(&8, None)?.is_empty());

    let keys: Vec<i64> = tree.iter()?.map(|(key, _)| key).collect();
    let expected: Vec<i64> = (1..=7).chain(9..=16).collect();
    assert_eq!(keys, expected);
    validate_tree(&buffer_pool, &tree, 15);
    Ok(())
}

#[test]
fn test_leaf_chain_yields_sorted_keys() -> Result<()> {
    let (buffer_pool, _temp_file) = create_test_buffer_pool(64)?;
    let tree = BTreeIndex::<i64>::with_max_sizes("test_chain", buffer_pool.clone(), 4, 4)?;

    let mut keys: Vec<i64> = (1..=100).collect();
    keys.shuffle(&mut thread_rng());
    for &key in &keys {
        tree.insert(key, rid_for(key), None)?;
    }

    let scanned: Vec<i64> = tree.iter()?.map(|(key, _)| key).collect();
    let expected: Vec<i64> = (1..=100).collect();
    assert_eq!(scanned, expected);

    let values: Vec<Rid> = tree.iter()?.map(|(_, rid)| rid).collect();
    assert_eq!(values[0], rid_for(1));
    assert_eq!(values[99], rid_for(100));
    Ok(())
}

#[test]
fn test_iter_from_positions_at_lower_bound() -> Result<()> {
    let (buffer_pool, _temp_file) = create_test_buffer_pool(64)?;
    let tree = BTreeIndex::<i64>::with_max_sizes("test_iter_from", buffer_pool.clone(), 4, 4)?;

    for key in (2..=60i64).step_by(2) {
        tree.insert(key, rid_for(key), None)?;
    }

    // Exact hit
    let keys: Vec<i64> = tree.iter_from(&40)?.map(|(key, _)| key).collect();
    let expected: Vec<i64> = (40..=60).step_by(2).collect();
    assert_eq!(keys, expected);

    // Between keys: starts at the next larger one
    let keys: Vec<i64> = tree.iter_from(&41)?.map(|(key, _)| key).collect();
    let expected: Vec<i64> = (42..=60).step_by(2).collect();
    assert_eq!(keys, expected);

    // Past the end
    assert_eq!(tree.iter_from(&61)?.count(), 0);
    Ok(())
}

#[test]
fn test_random_workload_keeps_invariants() -> Result<()> {
    let (buffer_pool, _temp_file) = create_test_buffer_pool(64)?;
    let tree = BTreeIndex::<i64>::with_max_sizes("test_random", buffer_pool.clone(), 4, 4)?;

    let mut keys: Vec<i64> = (1..=200).collect();
    keys.shuffle(&mut thread_rng());
    for &key in &keys {
        tree.insert(key, rid_for(key), None)?;
    }
    validate_tree(&buffer_pool, &tree, 200);

    let mut to_remove: Vec<i64> = (1..=200).filter(|key| key % 2 == 0).collect();
    to_remove.shuffle(&mut thread_rng());
    for &key in &to_remove {
        tree.remove(&key, None)?;
    }
    validate_tree(&buffer_pool, &tree, 100);

    for key in 1..=200i64 {
        let found = tree.get_value(&key, None)?;
        if key % 2 == 0 {
            assert!(found.is_empty(), "key {} should be gone", key);
        } else {
            assert_eq!(found, vec![rid_for(key)], "key {} should remain", key);
        }
    }

    let scanned: Vec<i64> = tree.iter()?.map(|(key, _)| key).collect();
    let expected: Vec<i64> = (1..=200).filter(|key| key % 2 == 1).collect();
    assert_eq!(scanned, expected);
    Ok(())
}

#[test]
fn test_remove_everything_then_reuse() -> Result<()> {
    let (buffer_pool, _temp_file) = create_test_buffer_pool(32)?;
    let tree = BTreeIndex::<i64>::with_max_sizes("test_drain", buffer_pool.clone(), 4, 4)?;

    for key in 1..=32i64 {
        tree.insert(key, rid_for(key), None)?;
    }
    for key in 1..=32i64 {
        tree.remove(&key, None)?;
    }

    assert!(tree.is_empty());
    assert!(tree.get_value(&5, None)?.is_empty());
    assert_eq!(tree.iter()?.count(), 0);

    // The emptied tree accepts inserts again
    for key in 1..=8i64 {
        tree.insert(key, rid_for(key), None)?;
    }
    validate_tree(&buffer_pool, &tree, 8);
    let scanned: Vec<i64> = tree.iter()?.map(|(key, _)| key).collect();
    assert_eq!(scanned, (1..=8).collect::<Vec<i64>>());
    Ok(())
}

#[test]
fn test_root_recovered_from_header_page() -> Result<()> {
    let (buffer_pool, _temp_file) = create_test_buffer_pool(32)?;

    {
        let tree = BTreeIndex::<i64>::with_max_sizes("orders_pk", buffer_pool.clone(), 4, 4)?;
        for key in 1..=50i64 {
            tree.insert(key, rid_for(key), None)?;
        }
    }

    // A new handle under the same name picks up the persisted root
    let reopened = BTreeIndex::<i64>::with_max_sizes("orders_pk", buffer_pool.clone(), 4, 4)?;
    assert!(!reopened.is_empty());
    for key in 1..=50i64 {
        assert_eq!(reopened.get_value(&key, None)?, vec![rid_for(key)]);
    }
    assert_eq!(reopened.iter()?.count(), 50);
    Ok(())
}

#[test]
fn test_concurrent_inserts() -> Result<()> {
    let (buffer_pool, _temp_file) = create_test_buffer_pool(128)?;
    let tree = Arc::new(BTreeIndex::<i64>::with_max_sizes(
        "test_concurrent",
        buffer_pool.clone(),
        4,
        4,
    )?);

    thread::scope(|scope| {
        for worker in 0..4i64 {
            let tree = tree.clone();
            scope.spawn(move || {
                for i in 0..50i64 {
                    let key = worker * 1000 + i;
                    tree.insert(key, rid_for(key), None).unwrap();
                }
            });
        }
    });

    validate_tree(&buffer_pool, &tree, 200);
    for worker in 0..4i64 {
        for i in 0..50i64 {
            let key = worker * 1000 + i;
            assert_eq!(tree.get_value(&key, None)?, vec![rid_for(key)]);
        }
    }

    let scanned: Vec<i64> = tree.iter()?.map(|(key, _)| key).collect();
    let mut expected: Vec<i64> = (0..4i64)
        .flat_map(|worker| (0..50i64).map(move |i| worker * 1000 + i))
        .collect();
    expected.sort_unstable();
    assert_eq!(scanned, expected);
    Ok(())
}

#[test]
fn test_concurrent_readers_and_writers() -> Result<()> {
    let (buffer_pool, _temp_file) = create_test_buffer_pool(128)?;
    let tree = Arc::new(BTreeIndex::<i64>::with_max_sizes(
        "test_mixed",
        buffer_pool.clone(),
        4,
        4,
    )?);

    for key in 0..100i64 {
        tree.insert(key, rid_for(key), None)?;
    }

    thread::scope(|scope| {
        for worker in 0..2i64 {
            let tree = tree.clone();
            scope.spawn(move || {
                for i in 0..50i64 {
                    let key = 1000 + worker * 1000 + i;
                    tree.insert(key, rid_for(key), None).unwrap();
                }
            });
        }
        for _ in 0..2 {
            let tree = tree.clone();
            scope.spawn(move || {
                for round in 0..5 {
                    for key in 0..100i64 {
                        let found = tree.get_value(&key, None).unwrap();
                        assert_eq!(found, vec![rid_for(key)], "round {}", round);
                    }
                }
            });
        }
    });

    validate_tree(&buffer_pool, &tree, 200);
    Ok(())
}
