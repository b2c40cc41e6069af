//! Paged B+Tree index with hand-over-hand locking.
//!
//! The root always occupies page 0; a root split copies the old root onto a
//! fresh page and re-initializes page 0 in place. A per-index "super node"
//! lock is taken ahead of the root lock so a root split cannot be observed
//! half-done.

mod cursor;
mod node;

use std::sync::Arc;

use parking_lot::lock_api::ArcRwLockWriteGuard;
use parking_lot::{RawRwLock, RwLock};

use crate::entry::Entry;
use crate::page::{Page, PageBuf, PageWriteGuard};
use crate::pager::Pager;
use crate::{Error, PageNum, Result, NO_PAGE};

pub use cursor::BTreeCursor;
pub use node::{ENTRIES_PER_LEAF, KEYS_PER_INTERNAL};

use node::NodeKind;

/// The root node's page number, invariant across splits.
pub const ROOT_PN: PageNum = 0;

/// Split information propagated towards the root after an insert.
#[derive(Debug, Clone, Copy)]
struct SplitInfo {
    /// The separator key pushed up to the parent.
    key: i64,
    left_pn: PageNum,
    right_pn: PageNum,
}

/// An index backed by a paged B+Tree.
pub struct BTreeIndex {
    pager: Arc<Pager>,
    root_pn: PageNum,
    super_node: Arc<RwLock<()>>,
}

/// Tracks the chain of write locks (and pins) held while descending for an
/// insert. Ancestors are released as soon as the current node is known not
/// to split, per the crabbing protocol.
struct WriteDescent<'a> {
    pager: &'a Pager,
    super_guard: Option<ArcRwLockWriteGuard<RawRwLock, ()>>,
    stack: Vec<(Arc<Page>, PageWriteGuard)>,
}

impl WriteDescent<'_> {
    /// Drops every guard above the current node, oldest first, along with
    /// the super-node guard, and releases those pages' pins.
    fn release_ancestors(&mut self) -> Result<()> {
        self.super_guard = None;
        while self.stack.len() > 1 {
            let (page, guard) = self.stack.remove(0);
            drop(guard);
            self.pager.put_page(&page)?;
        }
        Ok(())
    }

    /// Drops the guard and pin of the current (deepest) node.
    fn pop(&mut self) -> Result<()> {
        if let Some((page, guard)) = self.stack.pop() {
            drop(guard);
            self.pager.put_page(&page)?;
        }
        Ok(())
    }

    /// Drops every remaining guard and pin.
    fn finish(&mut self) -> Result<()> {
        self.super_guard = None;
        while let Some((page, guard)) = self.stack.pop() {
            drop(guard);
            self.pager.put_page(&page)?;
        }
        Ok(())
    }
}

impl BTreeIndex {
    /// Opens the index stored in the file at `path`, initializing an empty
    /// leaf root when the file is new.
    pub fn open(path: impl AsRef<std::path::Path>) -> Result<BTreeIndex> {
        let pager = Arc::new(Pager::new(path)?);
        if pager.num_pages() == 0 {
            let root = pager.get_new_page()?;
            {
                let mut buf = root.write();
                buf.init_node(NodeKind::Leaf);
                buf.leaf_set_right_sibling(NO_PAGE);
            }
            pager.put_page(&root)?;
        }
        Ok(BTreeIndex {
            pager,
            root_pn: ROOT_PN,
            super_node: Arc::new(RwLock::new(())),
        })
    }

    /// The pager backing this index.
    pub fn pager(&self) -> &Arc<Pager> {
        &self.pager
    }

    /// Flushes all changes to disk and closes the backing file.
    pub fn close(&self) -> Result<()> {
        self.pager.close()
    }

    /// Returns the entry stored under `key`.
    pub fn find(&self, key: i64) -> Result<Entry> {
        let super_guard = self.super_node.read_arc();
        let mut page = self.pager.get_page(self.root_pn)?;
        let mut guard = page.read();
        drop(super_guard);
        loop {
            match guard.node_kind() {
                NodeKind::Leaf => {
                    let slot = guard.leaf_search(key);
                    let result = if slot < guard.num_keys() && guard.leaf_key_at(slot) == key {
                        Ok(guard.leaf_entry(slot))
                    } else {
                        Err(Error::NotFound(key))
                    };
                    drop(guard);
                    self.pager.put_page(&page)?;
                    return result;
                }
                NodeKind::Internal => {
                    let child_pn = guard.internal_child_at(guard.internal_search(key));
                    let child = match self.pager.get_page(child_pn) {
                        Ok(child) => child,
                        Err(err) => {
                            drop(guard);
                            self.pager.put_page(&page)?;
                            return Err(err);
                        }
                    };
                    // Lock-crabbing: the child's lock is taken before the
                    // parent's is released.
                    let child_guard = child.read();
                    drop(guard);
                    self.pager.put_page(&page)?;
                    page = child;
                    guard = child_guard;
                }
            }
        }
    }

    /// Inserts a new entry, rejecting duplicate keys.
    pub fn insert(&self, key: i64, value: i64) -> Result<()> {
        self.insert_impl(key, value, false)
    }

    /// Replaces the value of an existing entry.
    pub fn update(&self, key: i64, value: i64) -> Result<()> {
        self.insert_impl(key, value, true)
    }

    fn insert_impl(&self, key: i64, value: i64, update: bool) -> Result<()> {
        let mut descent = WriteDescent {
            pager: &self.pager,
            super_guard: Some(self.super_node.write_arc()),
            stack: Vec::new(),
        };
        let result = (|| {
            let root = self.pager.get_page(self.root_pn)?;
            let guard = root.write();
            descent.stack.push((root, guard));
            self.insert_descend(&mut descent, key, value, update)
        })();
        let cleanup = descent.finish();
        result?;
        cleanup
    }

    fn insert_descend(
        &self,
        descent: &mut WriteDescent<'_>,
        key: i64,
        value: i64,
        update: bool,
    ) -> Result<()> {
        // Walk down to the leaf, releasing ancestors whenever the current
        // node cannot split on this insert.
        loop {
            let (kind, can_split, child_pn) = {
                let guard = &descent.stack.last().expect("descent stack is never empty").1;
                match guard.node_kind() {
                    NodeKind::Leaf => (NodeKind::Leaf, false, NO_PAGE),
                    NodeKind::Internal => (
                        NodeKind::Internal,
                        guard.internal_can_split(),
                        guard.internal_child_at(guard.internal_search(key)),
                    ),
                }
            };
            if kind == NodeKind::Leaf {
                break;
            }
            if !can_split {
                descent.release_ancestors()?;
            }
            let child = self.pager.get_page(child_pn)?;
            let child_guard = child.write();
            descent.stack.push((child, child_guard));
        }

        if !descent.stack.last().unwrap().1.leaf_can_split() {
            descent.release_ancestors()?;
        }

        // Leaf-level insert (or update).
        let (slot, num_keys, duplicate, leaf_pn) = {
            let (page, guard) = descent.stack.last().unwrap();
            let slot = guard.leaf_search(key);
            let num_keys = guard.num_keys();
            let duplicate = slot < num_keys && guard.leaf_key_at(slot) == key;
            (slot, num_keys, duplicate, page.page_num())
        };
        if duplicate {
            descent.release_ancestors()?;
            if update {
                let guard = &mut descent.stack.last_mut().unwrap().1;
                guard.leaf_set_entry(slot, Entry::new(key, value));
                return Ok(());
            }
            return Err(Error::DuplicateKey(key));
        }
        if update {
            descent.release_ancestors()?;
            return Err(Error::NotFound(key));
        }
        let mut pending = {
            let guard = &mut descent.stack.last_mut().unwrap().1;
            for i in (slot..num_keys).rev() {
                let entry = guard.leaf_entry(i);
                guard.leaf_set_entry(i + 1, entry);
            }
            guard.leaf_set_entry(slot, Entry::new(key, value));
            guard.set_num_keys(num_keys + 1);
            if num_keys + 1 >= ENTRIES_PER_LEAF {
                Some(self.split_leaf(guard, leaf_pn)?)
            } else {
                None
            }
        };

        // Propagate splits back up the stack.
        while let Some(split) = pending {
            if descent.stack.len() == 1 {
                // The node that split is the root itself.
                let (_, guard) = descent.stack.last_mut().unwrap();
                self.split_root(guard, split)?;
                pending = None;
            } else {
                descent.pop()?;
                let (page, guard) = descent.stack.last_mut().unwrap();
                let parent_pn = page.page_num();
                pending = self.insert_split(guard, parent_pn, split)?;
            }
        }
        Ok(())
    }

    /// Moves the upper half of a full leaf onto a fresh page, threading the
    /// new node into the right-sibling chain.
    fn split_leaf(&self, left: &mut PageBuf, left_pn: PageNum) -> Result<SplitInfo> {
        let new_page = self.pager.get_new_page()?;
        {
            let mut right = new_page.write();
            right.init_node(NodeKind::Leaf);
            let old_sibling = left.leaf_set_right_sibling(new_page.page_num());
            right.leaf_set_right_sibling(old_sibling);

            let num_keys = left.num_keys();
            let midpoint = num_keys / 2;
            let mut moved = 0;
            for i in midpoint..num_keys {
                right.leaf_set_entry(moved, left.leaf_entry(i));
                moved += 1;
            }
            right.set_num_keys(moved);
            left.set_num_keys(midpoint);
        }
        let split = SplitInfo {
            key: new_page.read().leaf_key_at(0),
            left_pn,
            right_pn: new_page.page_num(),
        };
        self.pager.put_page(&new_page)?;
        Ok(split)
    }

    /// Inserts a child split's separator into an internal node, splitting
    /// the node itself when it overflows.
    fn insert_split(
        &self,
        parent: &mut PageBuf,
        parent_pn: PageNum,
        split: SplitInfo,
    ) -> Result<Option<SplitInfo>> {
        let slot = parent.internal_search(split.key);
        let num_keys = parent.num_keys();
        for i in (slot..num_keys).rev() {
            let key = parent.internal_key_at(i);
            parent.internal_set_key_at(i + 1, key);
        }
        for i in ((slot + 1)..=num_keys).rev() {
            let child = parent.internal_child_at(i);
            parent.internal_set_child_at(i + 1, child);
        }
        parent.internal_set_key_at(slot, split.key);
        parent.internal_set_child_at(slot + 1, split.right_pn);
        parent.set_num_keys(num_keys + 1);
        if num_keys + 1 >= KEYS_PER_INTERNAL {
            return self.split_internal(parent, parent_pn).map(Some);
        }
        Ok(None)
    }

    /// Moves the right half of a full internal node onto a fresh page,
    /// pushing the middle key up as the separator.
    fn split_internal(&self, left: &mut PageBuf, left_pn: PageNum) -> Result<SplitInfo> {
        let new_page = self.pager.get_new_page()?;
        let middle_key;
        {
            let mut right = new_page.write();
            right.init_node(NodeKind::Internal);
            let num_keys = left.num_keys();
            let midpoint = (num_keys - 1) / 2;
            let mut moved = 0;
            for i in (midpoint + 1)..num_keys {
                right.internal_set_child_at(moved, left.internal_child_at(i));
                right.internal_set_key_at(moved, left.internal_key_at(i));
                moved += 1;
            }
            right.internal_set_child_at(moved, left.internal_child_at(num_keys));
            right.set_num_keys(moved);
            middle_key = left.internal_key_at(midpoint);
            left.set_num_keys(midpoint);
        }
        let split = SplitInfo {
            key: middle_key,
            left_pn,
            right_pn: new_page.page_num(),
        };
        self.pager.put_page(&new_page)?;
        Ok(split)
    }

    /// Handles a split that surfaced at the root: copies the root's current
    /// contents onto a fresh page and re-initializes page 0 as an internal
    /// node over the two halves, preserving the root page number.
    fn split_root(&self, root: &mut PageBuf, split: SplitInfo) -> Result<()> {
        debug_assert_eq!(split.left_pn, self.root_pn);
        let copy_page = self.pager.get_new_page()?;
        copy_page.write().0.copy_from_slice(&root.0);
        self.pager.put_page(&copy_page)?;

        root.init_node(NodeKind::Internal);
        root.internal_set_key_at(0, split.key);
        root.internal_set_child_at(0, copy_page.page_num());
        root.internal_set_child_at(1, split.right_pn);
        root.set_num_keys(1);
        Ok(())
    }

    /// Removes the entry with `key` if present. No merging or
    /// redistribution happens on underflow; the key count just decreases.
    pub fn delete(&self, key: i64) -> Result<()> {
        let super_guard = self.super_node.write_arc();
        let mut page = self.pager.get_page(self.root_pn)?;
        let mut guard = page.write();
        drop(super_guard);
        loop {
            match guard.node_kind() {
                NodeKind::Leaf => {
                    let slot = guard.leaf_search(key);
                    let num_keys = guard.num_keys();
                    if slot < num_keys && guard.leaf_key_at(slot) == key {
                        for i in slot..num_keys - 1 {
                            let entry = guard.leaf_entry(i + 1);
                            guard.leaf_set_entry(i, entry);
                        }
                        guard.set_num_keys(num_keys - 1);
                    }
                    drop(guard);
                    self.pager.put_page(&page)?;
                    return Ok(());
                }
                NodeKind::Internal => {
                    let child_pn = guard.internal_child_at(guard.internal_search(key));
                    let child = match self.pager.get_page(child_pn) {
                        Ok(child) => child,
                        Err(err) => {
                            drop(guard);
                            self.pager.put_page(&page)?;
                            return Err(err);
                        }
                    };
                    // Deletes never restructure, so the parent lock can go
                    // as soon as the child's is held.
                    let child_guard = child.write();
                    drop(guard);
                    self.pager.put_page(&page)?;
                    page = child;
                    guard = child_guard;
                }
            }
        }
    }

    /// All entries, in key order.
    pub fn select(&self) -> Result<Vec<Entry>> {
        let Some(mut cursor) = self.cursor_at_start()? else {
            return Ok(Vec::new());
        };
        let mut entries = Vec::new();
        loop {
            entries.push(cursor.entry());
            if cursor.next() {
                break;
            }
        }
        Ok(entries)
    }

    /// Entries with keys in `[start, end)`. Errors when `start >= end`.
    pub fn select_range(&self, start: i64, end: i64) -> Result<Vec<Entry>> {
        if start >= end {
            return Err(Error::InvalidRange);
        }
        let Some(mut cursor) = self.cursor_at(start)? else {
            return Ok(Vec::new());
        };
        let mut entries = Vec::new();
        loop {
            let entry = cursor.entry();
            if entry.key >= end {
                break;
            }
            entries.push(entry);
            if cursor.next() {
                break;
            }
        }
        Ok(entries)
    }
}
