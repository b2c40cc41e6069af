mod common;

use rand::seq::SliceRandom;
use strata::btree::{BTreeIndex, ENTRIES_PER_LEAF};
use strata::Error;
use tempfile::tempdir;

#[test]
fn ascending_inserts_survive_close_and_reopen() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("index.db");
    let salt = common::salt();

    let index = BTreeIndex::open(&path).unwrap();
    for key in 0..1000 {
        index.insert(key, key % salt).unwrap();
    }
    for key in 0..1000 {
        assert_eq!(index.find(key).unwrap().value, key % salt);
    }
    index.close().unwrap();

    let index = BTreeIndex::open(&path).unwrap();
    for key in 0..1000 {
        assert_eq!(index.find(key).unwrap().value, key % salt);
    }
    index.close().unwrap();
}

#[test]
fn duplicate_keys_are_rejected_before_and_after_reopen() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("index.db");

    let index = BTreeIndex::open(&path).unwrap();
    for key in 0..1000 {
        index.insert(key, key).unwrap();
    }
    for key in 0..1000 {
        assert!(matches!(
            index.insert(key, key),
            Err(Error::DuplicateKey(k)) if k == key
        ));
    }
    index.close().unwrap();

    let index = BTreeIndex::open(&path).unwrap();
    for key in 0..1000 {
        assert!(matches!(index.insert(key, key), Err(Error::DuplicateKey(_))));
    }
    index.close().unwrap();
}

#[test]
fn filling_one_leaf_forces_a_root_split() {
    let dir = tempdir().unwrap();
    let index = BTreeIndex::open(dir.path().join("index.db")).unwrap();
    for key in 0..=ENTRIES_PER_LEAF {
        index.insert(key, key * 2).unwrap();
    }
    // More than one page means the root split into children.
    assert!(index.pager().num_pages() > 1);
    let entries = index.select().unwrap();
    assert_eq!(entries.len() as i64, ENTRIES_PER_LEAF + 1);
    for (i, entry) in entries.iter().enumerate() {
        assert_eq!(entry.key, i as i64);
        assert_eq!(entry.value, i as i64 * 2);
    }
}

#[test]
fn update_requires_an_existing_key() {
    let dir = tempdir().unwrap();
    let index = BTreeIndex::open(dir.path().join("index.db")).unwrap();
    assert!(matches!(index.update(4, 1), Err(Error::NotFound(4))));
    index.insert(4, 1).unwrap();
    index.update(4, 9).unwrap();
    assert_eq!(index.find(4).unwrap().value, 9);
}

#[test]
fn deleted_keys_are_gone() {
    let dir = tempdir().unwrap();
    let index = BTreeIndex::open(dir.path().join("index.db")).unwrap();
    for key in 0..500 {
        index.insert(key, key).unwrap();
    }
    for key in (0..500).step_by(2) {
        index.delete(key).unwrap();
    }
    // Deleting a missing key is a quiet no-op.
    index.delete(0).unwrap();
    for key in 0..500 {
        let found = index.find(key);
        if key % 2 == 0 {
            assert!(matches!(found, Err(Error::NotFound(_))));
        } else {
            assert_eq!(found.unwrap().value, key);
        }
    }
}

#[test]
fn select_is_sorted_after_shuffled_inserts() {
    let dir = tempdir().unwrap();
    let index = BTreeIndex::open(dir.path().join("index.db")).unwrap();
    let salt = common::salt();
    let mut keys: Vec<i64> = (0..2000).collect();
    keys.shuffle(&mut rand::thread_rng());
    for &key in &keys {
        index.insert(key, key % salt).unwrap();
    }
    let entries = index.select().unwrap();
    assert_eq!(entries.len(), 2000);
    for (i, entry) in entries.iter().enumerate() {
        assert_eq!(entry.key, i as i64);
        assert_eq!(entry.value, entry.key % salt);
    }
}

#[test]
fn select_on_an_empty_index_is_empty() {
    let dir = tempdir().unwrap();
    let index = BTreeIndex::open(dir.path().join("index.db")).unwrap();
    assert!(index.select().unwrap().is_empty());
}

#[test]
fn select_range_checks_bounds_and_spans_leaves() {
    let dir = tempdir().unwrap();
    let index = BTreeIndex::open(dir.path().join("index.db")).unwrap();
    for key in 0..1000 {
        index.insert(key, key + 1).unwrap();
    }
    assert!(matches!(index.select_range(5, 5), Err(Error::InvalidRange)));
    assert!(matches!(index.select_range(6, 5), Err(Error::InvalidRange)));

    let entries = index.select_range(100, 400).unwrap();
    assert_eq!(entries.len(), 300);
    assert_eq!(entries.first().unwrap().key, 100);
    assert_eq!(entries.last().unwrap().key, 399);

    // Ranges past the end of the index are just empty.
    assert!(index.select_range(5000, 6000).unwrap().is_empty());
}

#[test]
fn cursor_skips_keys_deleted_at_the_range_start() {
    let dir = tempdir().unwrap();
    let index = BTreeIndex::open(dir.path().join("index.db")).unwrap();
    for key in 0..100 {
        index.insert(key, key).unwrap();
    }
    index.delete(10).unwrap();
    let entries = index.select_range(10, 13).unwrap();
    let keys: Vec<i64> = entries.iter().map(|e| e.key).collect();
    assert_eq!(keys, vec![11, 12]);
}
