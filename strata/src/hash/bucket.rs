//! On-page layout of extendible-hash buckets: a padded-varint local depth,
//! a padded-varint key count, then fixed-width entry slots.

use crate::entry::{read_varint, write_varint, Entry, ENTRY_SIZE, MAX_VARINT};
use crate::page::PageBuf;
use crate::{Error, Result, PAGE_SIZE};

const DEPTH_OFFSET: usize = 0;
const DEPTH_SIZE: usize = MAX_VARINT;
const NUM_KEYS_OFFSET: usize = DEPTH_OFFSET + DEPTH_SIZE;
const NUM_KEYS_SIZE: usize = MAX_VARINT;
const BUCKET_HEADER_SIZE: usize = DEPTH_SIZE + NUM_KEYS_SIZE;

/// Number of entries a bucket holds before it must split.
pub const MAX_BUCKET_SIZE: i64 = ((PAGE_SIZE - BUCKET_HEADER_SIZE) / ENTRY_SIZE) as i64;

impl PageBuf {
    /// Resets the page to an empty bucket with the given local depth.
    pub(crate) fn bucket_init(&mut self, depth: i64) {
        self.0.fill(0);
        self.bucket_set_local_depth(depth);
    }

    pub(crate) fn bucket_local_depth(&self) -> i64 {
        read_varint(&self.0[DEPTH_OFFSET..DEPTH_OFFSET + DEPTH_SIZE])
    }

    pub(crate) fn bucket_set_local_depth(&mut self, depth: i64) {
        write_varint(&mut self.0[DEPTH_OFFSET..DEPTH_OFFSET + DEPTH_SIZE], depth);
    }

    pub(crate) fn bucket_num_keys(&self) -> i64 {
        read_varint(&self.0[NUM_KEYS_OFFSET..NUM_KEYS_OFFSET + NUM_KEYS_SIZE])
    }

    pub(crate) fn bucket_set_num_keys(&mut self, num_keys: i64) {
        write_varint(
            &mut self.0[NUM_KEYS_OFFSET..NUM_KEYS_OFFSET + NUM_KEYS_SIZE],
            num_keys,
        );
    }

    fn bucket_entry_pos(slot: i64) -> usize {
        BUCKET_HEADER_SIZE + slot as usize * ENTRY_SIZE
    }

    pub(crate) fn bucket_entry(&self, slot: i64) -> Entry {
        Entry::decode(&self.0[Self::bucket_entry_pos(slot)..])
    }

    pub(crate) fn bucket_set_entry(&mut self, slot: i64, entry: Entry) {
        let pos = Self::bucket_entry_pos(slot);
        entry.encode(&mut self.0[pos..pos + ENTRY_SIZE]);
    }

    /// First entry with the given key in scan order, if any.
    pub(crate) fn bucket_find(&self, key: i64) -> Option<Entry> {
        (0..self.bucket_num_keys())
            .map(|slot| self.bucket_entry(slot))
            .find(|entry| entry.key == key)
    }

    /// Appends an entry (duplicate keys are permitted) and reports whether
    /// the bucket now needs to split.
    pub(crate) fn bucket_insert(&mut self, key: i64, value: i64) -> bool {
        let num_keys = self.bucket_num_keys();
        self.bucket_set_entry(num_keys, Entry::new(key, value));
        self.bucket_set_num_keys(num_keys + 1);
        num_keys + 1 >= MAX_BUCKET_SIZE
    }

    /// Replaces the value of the first entry with the given key.
    pub(crate) fn bucket_update(&mut self, key: i64, value: i64) -> Result<()> {
        let num_keys = self.bucket_num_keys();
        for slot in 0..num_keys {
            if self.bucket_entry(slot).key == key {
                self.bucket_set_entry(slot, Entry::new(key, value));
                return Ok(());
            }
        }
        Err(Error::NotFound(key))
    }

    /// Removes the first entry with the given key, shifting the rest left.
    /// Buckets are never coalesced.
    pub(crate) fn bucket_delete(&mut self, key: i64) -> Result<()> {
        let num_keys = self.bucket_num_keys();
        let Some(slot) = (0..num_keys).find(|&slot| self.bucket_entry(slot).key == key) else {
            return Err(Error::NotFound(key));
        };
        for i in slot..num_keys - 1 {
            let entry = self.bucket_entry(i + 1);
            self.bucket_set_entry(i, entry);
        }
        self.bucket_set_num_keys(num_keys - 1);
        Ok(())
    }

    pub(crate) fn bucket_select(&self) -> Vec<Entry> {
        (0..self.bucket_num_keys())
            .map(|slot| self.bucket_entry(slot))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bucket() -> PageBuf {
        let mut buf = PageBuf([0; PAGE_SIZE]);
        buf.bucket_init(3);
        buf
    }

    #[test]
    fn insert_reports_overflow_at_capacity() {
        let mut buf = bucket();
        for i in 0..MAX_BUCKET_SIZE - 1 {
            assert!(!buf.bucket_insert(i, i));
        }
        assert!(buf.bucket_insert(MAX_BUCKET_SIZE - 1, 0));
        assert_eq!(buf.bucket_num_keys(), MAX_BUCKET_SIZE);
    }

    #[test]
    fn duplicate_keys_are_permitted_and_find_returns_first() {
        let mut buf = bucket();
        buf.bucket_insert(7, 1);
        buf.bucket_insert(7, 2);
        assert_eq!(buf.bucket_find(7), Some(Entry::new(7, 1)));
    }

    #[test]
    fn delete_shifts_entries_left() {
        let mut buf = bucket();
        buf.bucket_insert(1, 10);
        buf.bucket_insert(2, 20);
        buf.bucket_insert(3, 30);
        buf.bucket_delete(2).unwrap();
        assert_eq!(buf.bucket_num_keys(), 2);
        assert_eq!(buf.bucket_entry(1), Entry::new(3, 30));
        assert!(matches!(buf.bucket_delete(2), Err(Error::NotFound(2))));
    }
}
