//! Paged extendible-hash index.
//!
//! A directory of `2^G` bucket references (G = global depth) maps hashed
//! keys to bucket pages; each bucket carries its own local depth. Inserting
//! into a full bucket splits it, doubling the directory when the bucket's
//! local depth has caught up with the global depth. The directory persists
//! in a companion `.meta` file; bucket pages live in the main file.

mod bucket;

use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;
use xxhash_rust::xxh64::xxh64;

use crate::entry::{read_varint, write_varint, Entry, MAX_VARINT};
use crate::page::PageBuf;
use crate::pager::Pager;
use crate::{Error, PageNum, Result, PAGE_SIZE};

pub use bucket::MAX_BUCKET_SIZE;

/// The directory index a key hashes to at the given depth: the 64-bit
/// non-cryptographic hash of the key's varint encoding, taken as absolute
/// value, modulo `2^depth`.
pub fn bucket_index(key: i64, depth: i64) -> i64 {
    let mut buf = [0u8; MAX_VARINT];
    write_varint(&mut buf, key);
    let hash = xxh64(&buf, 0) as i64;
    // i64::MIN has no absolute value; it lands on 0 for power-of-two moduli.
    let hash = hash.checked_abs().unwrap_or(0);
    hash % (1i64 << depth)
}

struct Directory {
    global_depth: i64,
    buckets: Vec<PageNum>,
}

/// An index backed by an extendible hash table.
pub struct HashIndex {
    pager: Arc<Pager>,
    directory: RwLock<Directory>,
}

impl HashIndex {
    /// Opens the index stored at `path`. A fresh file is initialized with
    /// global depth 2 and four empty buckets; an existing file's directory
    /// is read back from its `.meta` companion.
    pub fn open(path: impl AsRef<std::path::Path>) -> Result<HashIndex> {
        let pager = Arc::new(Pager::new(path)?);
        let directory = if pager.num_pages() == 0 {
            Self::init_directory(&pager)?
        } else {
            Self::read_meta(&pager)?
        };
        Ok(HashIndex {
            pager,
            directory: RwLock::new(directory),
        })
    }

    fn init_directory(pager: &Pager) -> Result<Directory> {
        let global_depth = 2;
        let mut buckets = Vec::with_capacity(1 << global_depth);
        for _ in 0..(1i64 << global_depth) {
            let page = pager.get_new_page()?;
            page.write().bucket_init(global_depth);
            buckets.push(page.page_num());
            pager.put_page(&page)?;
        }
        Ok(Directory {
            global_depth,
            buckets,
        })
    }

    /// The pager backing this index.
    pub fn pager(&self) -> &Arc<Pager> {
        &self.pager
    }

    /// The table's current global depth.
    pub fn global_depth(&self) -> i64 {
        self.directory.read().global_depth
    }

    /// Returns the first entry stored under `key` in scan order.
    pub fn find(&self, key: i64) -> Result<Entry> {
        let dir = self.directory.read();
        let index = bucket_index(key, dir.global_depth);
        let Some(&bucket_pn) = dir.buckets.get(index as usize) else {
            return Err(Error::NotFound(key));
        };
        let page = self.pager.get_page(bucket_pn)?;
        let guard = page.read();
        drop(dir);
        let result = guard.bucket_find(key).ok_or(Error::NotFound(key));
        drop(guard);
        self.pager.put_page(&page)?;
        result
    }

    /// Inserts a key/value pair, splitting the target bucket (and possibly
    /// extending the directory) on overflow. Duplicate keys are permitted.
    pub fn insert(&self, key: i64, value: i64) -> Result<()> {
        let mut dir = self.directory.write();
        let index = bucket_index(key, dir.global_depth);
        let bucket_pn = dir.buckets[index as usize];
        let page = self.pager.get_page(bucket_pn)?;
        let mut guard = page.write();
        let result = if guard.bucket_insert(key, value) {
            self.split(&mut dir, &mut guard, index)
        } else {
            Ok(())
        };
        drop(guard);
        self.pager.put_page(&page)?;
        result
    }

    /// Splits an overflowing bucket: bumps its local depth, redistributes
    /// its entries against the new depth and re-points every directory slot
    /// congruent to the new index. Recurses while either side still
    /// overflows, which a skewed hash can force.
    fn split(&self, dir: &mut Directory, bucket: &mut PageBuf, hash: i64) -> Result<()> {
        let local_depth = bucket.bucket_local_depth();
        let old_hash = hash % (1 << local_depth);
        let new_hash = old_hash + (1 << local_depth);
        if local_depth == dir.global_depth {
            dir.global_depth += 1;
            let doubled = dir.buckets.clone();
            dir.buckets.extend(doubled);
        }
        let local_depth = local_depth + 1;
        bucket.bucket_set_local_depth(local_depth);
        debug!(old_hash, new_hash, local_depth, "splitting hash bucket");

        let new_page = self.pager.get_new_page()?;
        let mut new_guard = new_page.write();
        new_guard.bucket_init(local_depth);

        let entries: Vec<Entry> = (0..bucket.bucket_num_keys())
            .map(|slot| bucket.bucket_entry(slot))
            .collect();
        let (mut old_count, mut new_count) = (0, 0);
        for entry in entries {
            if bucket_index(entry.key, local_depth) == new_hash {
                new_guard.bucket_set_entry(new_count, entry);
                new_count += 1;
            } else {
                bucket.bucket_set_entry(old_count, entry);
                old_count += 1;
            }
        }
        bucket.bucket_set_num_keys(old_count);
        new_guard.bucket_set_num_keys(new_count);

        let stride = 1i64 << local_depth;
        let mut slot = new_hash;
        while slot < (1 << dir.global_depth) {
            dir.buckets[slot as usize] = new_page.page_num();
            slot += stride;
        }

        let result = if old_count >= MAX_BUCKET_SIZE {
            self.split(dir, bucket, old_hash)
        } else if new_count >= MAX_BUCKET_SIZE {
            self.split(dir, &mut new_guard, new_hash)
        } else {
            Ok(())
        };
        drop(new_guard);
        self.pager.put_page(&new_page)?;
        result
    }

    /// Replaces the value of the first entry with `key`.
    pub fn update(&self, key: i64, value: i64) -> Result<()> {
        let dir = self.directory.read();
        let index = bucket_index(key, dir.global_depth);
        let bucket_pn = dir.buckets[index as usize];
        let page = self.pager.get_page(bucket_pn)?;
        let mut guard = page.write();
        drop(dir);
        let result = guard.bucket_update(key, value);
        drop(guard);
        self.pager.put_page(&page)?;
        result
    }

    /// Removes the first entry with `key`. Buckets are never coalesced.
    pub fn delete(&self, key: i64) -> Result<()> {
        let dir = self.directory.read();
        let index = bucket_index(key, dir.global_depth);
        let bucket_pn = dir.buckets[index as usize];
        let page = self.pager.get_page(bucket_pn)?;
        let mut guard = page.write();
        drop(dir);
        let result = guard.bucket_delete(key);
        drop(guard);
        self.pager.put_page(&page)?;
        result
    }

    /// All entries, by scanning every bucket page in page-number order.
    /// The directory is deliberately not consulted, so even orphaned
    /// buckets show up.
    pub fn select(&self) -> Result<Vec<Entry>> {
        let _dir = self.directory.read();
        let mut entries = Vec::new();
        for page_num in 0..self.pager.num_pages() {
            let page = self.pager.get_page(page_num)?;
            let guard = page.read();
            entries.extend(guard.bucket_select());
            drop(guard);
            self.pager.put_page(&page)?;
        }
        Ok(entries)
    }

    /// Persists the directory to the `.meta` companion file and closes the
    /// backing pager.
    pub fn close(&self) -> Result<()> {
        self.write_meta()?;
        self.pager.close()
    }

    fn meta_path(pager: &Pager) -> PathBuf {
        let mut path = pager.file_path().as_os_str().to_os_string();
        path.push(".meta");
        PathBuf::from(path)
    }

    fn write_meta(&self) -> Result<()> {
        let dir = self.directory.read();
        let meta_path = Self::meta_path(&self.pager);
        // A stale meta from an earlier close would otherwise shadow page 0.
        if meta_path.exists() {
            std::fs::remove_file(&meta_path)?;
        }
        let meta_pager = Pager::new(&meta_path)?;
        let mut page = meta_pager.get_new_page()?;
        let mut guard = page.write();
        write_varint(&mut guard.0[..MAX_VARINT], dir.global_depth);
        let mut offset = MAX_VARINT;
        for &bucket_pn in &dir.buckets {
            if offset + MAX_VARINT > PAGE_SIZE {
                drop(guard);
                meta_pager.put_page(&page)?;
                page = meta_pager.get_new_page()?;
                guard = page.write();
                offset = 0;
            }
            write_varint(&mut guard.0[offset..offset + MAX_VARINT], bucket_pn);
            offset += MAX_VARINT;
        }
        drop(guard);
        meta_pager.put_page(&page)?;
        meta_pager.close()
    }

    fn read_meta(pager: &Pager) -> Result<Directory> {
        let meta_pager = Pager::new(Self::meta_path(pager))?;
        let mut page = meta_pager.get_page(0)?;
        let mut guard = page.read();
        let global_depth = read_varint(&guard.0[..MAX_VARINT]);
        let count = 1i64 << global_depth;
        let mut buckets = Vec::with_capacity(count as usize);
        let mut offset = MAX_VARINT;
        let mut meta_pn = 0;
        for _ in 0..count {
            if offset + MAX_VARINT > PAGE_SIZE {
                drop(guard);
                meta_pager.put_page(&page)?;
                meta_pn += 1;
                page = meta_pager.get_page(meta_pn)?;
                guard = page.read();
                offset = 0;
            }
            buckets.push(read_varint(&guard.0[offset..offset + MAX_VARINT]));
            offset += MAX_VARINT;
        }
        drop(guard);
        meta_pager.put_page(&page)?;
        meta_pager.close()?;
        Ok(Directory {
            global_depth,
            buckets,
        })
    }
}
