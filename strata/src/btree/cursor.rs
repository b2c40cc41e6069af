//! In-order iteration over a B+Tree's leaf entries.

use std::sync::Arc;

use tracing::trace;

use super::node::NodeKind;
use super::BTreeIndex;
use crate::entry::Entry;
use crate::page::{Page, PageReadGuard};
use crate::Result;

/// A cursor over the entries of a B+Tree, in key order.
///
/// The cursor keeps a read lock on the leaf it is positioned in; stepping
/// onto the next leaf takes the sibling's lock before the current one is
/// released, so a scan observes leaves in tree order. A live cursor always
/// points at a valid entry.
pub struct BTreeCursor<'a> {
    index: &'a BTreeIndex,
    page: Arc<Page>,
    guard: Option<PageReadGuard>,
    slot: i64,
}

impl BTreeIndex {
    /// Returns a cursor on the first entry of the index, or `None` when the
    /// index holds no entries.
    pub fn cursor_at_start(&self) -> Result<Option<BTreeCursor<'_>>> {
        let super_guard = self.super_node.read_arc();
        let mut page = self.pager().get_page(self.root_pn)?;
        let mut guard = page.read();
        drop(super_guard);
        // Descend the left spine.
        while guard.node_kind() == NodeKind::Internal {
            let child_pn = guard.internal_child_at(0);
            let child = match self.pager().get_page(child_pn) {
                Ok(child) => child,
                Err(err) => {
                    drop(guard);
                    self.pager().put_page(&page)?;
                    return Err(err);
                }
            };
            let child_guard = child.read();
            drop(guard);
            self.pager().put_page(&page)?;
            page = child;
            guard = child_guard;
        }
        let empty = guard.num_keys() == 0;
        let mut cursor = BTreeCursor {
            index: self,
            page,
            guard: Some(guard),
            slot: 0,
        };
        // The leftmost leaf can be empty after deletes; skip ahead so the
        // cursor starts on a real entry.
        if empty && cursor.next() {
            return Ok(None);
        }
        Ok(Some(cursor))
    }

    /// Returns a cursor on the first entry with key `>= key`, or `None`
    /// when no such entry exists.
    pub fn cursor_at(&self, key: i64) -> Result<Option<BTreeCursor<'_>>> {
        let super_guard = self.super_node.read_arc();
        let mut page = self.pager().get_page(self.root_pn)?;
        let mut guard = page.read();
        drop(super_guard);
        while guard.node_kind() == NodeKind::Internal {
            let child_pn = guard.internal_child_at(guard.internal_search(key));
            let child = match self.pager().get_page(child_pn) {
                Ok(child) => child,
                Err(err) => {
                    drop(guard);
                    self.pager().put_page(&page)?;
                    return Err(err);
                }
            };
            let child_guard = child.read();
            drop(guard);
            self.pager().put_page(&page)?;
            page = child;
            guard = child_guard;
        }
        let slot = guard.leaf_search(key);
        let past_end = slot >= guard.num_keys();
        let mut cursor = BTreeCursor {
            index: self,
            page,
            guard: Some(guard),
            slot,
        };
        // The slot can sit past the last entry if the key was deleted or
        // never existed; advance to the next real entry.
        if past_end && cursor.next() {
            return Ok(None);
        }
        Ok(Some(cursor))
    }
}

impl BTreeCursor<'_> {
    /// The entry the cursor points at.
    pub fn entry(&self) -> Entry {
        self.guard
            .as_ref()
            .expect("live cursor holds its leaf lock")
            .leaf_entry(self.slot)
    }

    /// Advances to the next entry. Returns `true` at the end of the index,
    /// leaving the cursor position unchanged.
    pub fn next(&mut self) -> bool {
        let guard = self.guard.as_ref().expect("live cursor holds its leaf lock");
        if self.slot + 1 >= guard.num_keys() {
            let next_pn = guard.leaf_right_sibling();
            if next_pn < 0 {
                return true;
            }
            let Ok(next_page) = self.index.pager().get_page(next_pn) else {
                return true;
            };
            // Take the sibling's lock before releasing the current leaf's.
            let next_guard = next_page.read();
            drop(self.guard.take());
            if let Err(err) = self.index.pager().put_page(&self.page) {
                trace!(%err, "failed to release leaf during cursor step");
            }
            self.page = next_page;
            self.guard = Some(next_guard);
            self.slot = 0;
            // Skip over leaves emptied by deletes.
            if self.guard.as_ref().unwrap().num_keys() == 0 {
                return self.next();
            }
            return false;
        }
        self.slot += 1;
        false
    }
}

impl Drop for BTreeCursor<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        if let Err(err) = self.index.pager().put_page(&self.page) {
            trace!(%err, "failed to release leaf on cursor drop");
        }
    }
}
