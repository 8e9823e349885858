//! B+Tree index over the buffer pool, with latch-crabbing concurrency.
//!
//! Write operations descend holding write latches and release every
//! ancestor latch as soon as the current child is *safe* (it cannot
//! split or underflow from this operation). Reads couple latches: the
//! child's read latch is taken before the parent's is dropped. The
//! buffer pool mutex is never held across a latch acquisition, and a
//! page is always pinned while latched, so an evictable frame can have
//! no latch holders.

use crate::btree::context::{IndexContext, LatchedPage, RootLatch};
use crate::btree::key::{GenericComparator, GenericKey};
use crate::btree::page::{internal_capacity, leaf_capacity, InternalPage, LeafPage};
use bytes::{BufMut, BytesMut};
use parking_lot::{RwLock, RwLockWriteGuard};
use std::cmp::Ordering;
use std::sync::Arc;
use tinydb_buffer::{BufferPoolManager, PinnedPage};
use tinydb_common::{
    PageHeader, PageId, PageType, Result, Rid, TinyDbError, INVALID_PAGE_ID,
};
use tinydb_wal::{LogManager, LogRecord, LogRecordType, Lsn, INVALID_TXN_ID};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteOp {
    Insert,
    Delete,
}

enum DeleteOutcome {
    Done(bool),
    /// The duplicate run reaches into earlier leaves; retry front to back.
    RetryLeftmost,
}

/// B+Tree mapping fixed-width keys to RIDs.
pub struct BPlusTree<const N: usize> {
    index_name: String,
    bpm: Arc<BufferPoolManager>,
    log: Option<Arc<LogManager>>,
    comparator: GenericComparator<N>,
    root_page_id: RwLock<PageId>,
    leaf_max_size: u32,
    internal_max_size: u32,
    allow_duplicates: bool,
}

impl<const N: usize> BPlusTree<N> {
    /// Creates an empty tree.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        index_name: impl Into<String>,
        bpm: Arc<BufferPoolManager>,
        log: Option<Arc<LogManager>>,
        comparator: GenericComparator<N>,
        leaf_max_size: u32,
        internal_max_size: u32,
        allow_duplicates: bool,
    ) -> Result<Self> {
        if leaf_max_size < 2 || (leaf_max_size + 1) as usize > leaf_capacity(N) {
            return Err(TinyDbError::OutOfRange(format!(
                "leaf max size {} outside [2, {}]",
                leaf_max_size,
                leaf_capacity(N) - 1
            )));
        }
        if internal_max_size < 3 || (internal_max_size + 1) as usize > internal_capacity(N) {
            return Err(TinyDbError::OutOfRange(format!(
                "internal max size {} outside [3, {}]",
                internal_max_size,
                internal_capacity(N) - 1
            )));
        }
        Ok(Self {
            index_name: index_name.into(),
            bpm,
            log,
            comparator,
            root_page_id: RwLock::new(INVALID_PAGE_ID),
            leaf_max_size,
            internal_max_size,
            allow_duplicates,
        })
    }

    /// Reattaches to a tree persisted in the database file.
    #[allow(clippy::too_many_arguments)]
    pub fn open(
        index_name: impl Into<String>,
        bpm: Arc<BufferPoolManager>,
        log: Option<Arc<LogManager>>,
        comparator: GenericComparator<N>,
        leaf_max_size: u32,
        internal_max_size: u32,
        allow_duplicates: bool,
        root_page_id: PageId,
    ) -> Result<Self> {
        let tree = Self::new(
            index_name,
            bpm,
            log,
            comparator,
            leaf_max_size,
            internal_max_size,
            allow_duplicates,
        )?;
        *tree.root_page_id.write() = root_page_id;
        Ok(tree)
    }

    /// Largest leaf occupancy that still leaves room for the transient
    /// overflow entry a split consumes.
    pub fn default_leaf_max_size() -> u32 {
        (leaf_capacity(N) - 1) as u32
    }

    pub fn default_internal_max_size() -> u32 {
        (internal_capacity(N) - 1) as u32
    }

    pub fn index_name(&self) -> &str {
        &self.index_name
    }

    pub fn root_page_id(&self) -> PageId {
        *self.root_page_id.read()
    }

    pub fn is_empty(&self) -> bool {
        !self.root_page_id().is_valid()
    }

    // ------------------------------------------------------------------
    // Insert
    // ------------------------------------------------------------------

    /// Inserts `(key, rid)`. Returns false when the key already exists
    /// in a unique tree.
    pub fn insert(&self, key: &GenericKey<N>, rid: Rid) -> Result<bool> {
        let mut ctx = IndexContext::new();
        let root_guard = self.root_page_id.write();
        if !root_guard.is_valid() {
            return self.start_new_tree(root_guard, key, rid);
        }
        let root_pid = *root_guard;
        ctx.root = Some(RootLatch::Write(root_guard));
        self.latch_path(&mut ctx, root_pid, key, WriteOp::Insert, false)?;

        let result = self.insert_into_leaf(&mut ctx, key, rid);
        self.finish(ctx);
        result
    }

    fn start_new_tree(
        &self,
        mut root_guard: RwLockWriteGuard<'_, PageId>,
        key: &GenericKey<N>,
        rid: Rid,
    ) -> Result<bool> {
        let lsn = self.log_mutation(LogRecordType::IndexInsert, key, rid)?;
        let pin = self.allocate()?;
        let page_id = pin.page_id();
        {
            let mut latch = pin.latch_write();
            let mut leaf = LeafPage::<_, N>::new(latch.as_mut_slice());
            leaf.init(page_id, self.leaf_max_size);
            leaf.insert_at(0, key, rid)?;
            if let Some(lsn) = lsn {
                leaf.set_lsn(lsn.0);
            }
        }
        pin.mark_dirty();
        *root_guard = page_id;
        Ok(true)
    }

    fn insert_into_leaf<'a>(
        &'a self,
        ctx: &mut IndexContext<'a>,
        key: &GenericKey<N>,
        rid: Rid,
    ) -> Result<bool> {
        let (pos, will_split) = {
            let top = ctx.top()?;
            let leaf = LeafPage::<_, N>::new(top.data());
            // Stable insertion: a duplicate goes after its equals.
            let pos = leaf.upper_bound(key, &self.comparator)?;
            if !self.allow_duplicates
                && pos > 0
                && self.comparator.compare(&leaf.key_at(pos - 1), key)? == Ordering::Equal
            {
                return Ok(false);
            }
            (pos, leaf.size() >= leaf.max_size())
        };

        let lsn = self.log_mutation(LogRecordType::IndexInsert, key, rid)?;

        // Reserve every page the split cascade could need up front, so
        // pool exhaustion surfaces before the first structural change.
        let mut spare: Vec<PinnedPage<'a>> = Vec::new();
        if will_split {
            let needed = ctx.pages.len() + 1;
            for _ in 0..needed {
                match self.bpm.new_page()? {
                    Some(pin) => spare.push(pin),
                    None => {
                        for pin in spare.drain(..) {
                            let page_id = pin.page_id();
                            drop(pin);
                            self.bpm.delete_page(page_id);
                        }
                        return Err(TinyDbError::OutOfMemory(format!(
                            "buffer pool exhausted splitting index {}",
                            self.index_name
                        )));
                    }
                }
            }
        }

        {
            let top = ctx.top_mut()?;
            let data = top.data_mut()?;
            let mut leaf = LeafPage::<_, N>::new(data);
            leaf.insert_at(pos, key, rid)?;
            if let Some(lsn) = lsn {
                leaf.set_lsn(lsn.0);
            }
            top.mark_dirty();
        }

        if will_split {
            self.split_cascade(ctx, &mut spare, lsn)?;
            // Unused reservations go back to the disk manager.
            for pin in spare.drain(..) {
                let page_id = pin.page_id();
                drop(pin);
                ctx.deleted.push(page_id);
            }
        }
        Ok(true)
    }

    /// Splits the overflowing page at the top of the crab path and
    /// pushes separators upward until a parent absorbs the insert.
    fn split_cascade<'a>(
        &'a self,
        ctx: &mut IndexContext<'a>,
        spare: &mut Vec<PinnedPage<'a>>,
        lsn: Option<Lsn>,
    ) -> Result<()> {
        let mut level = ctx.pages.len() - 1;
        loop {
            let (separator, right_pid) = self.split_node(ctx, level, spare, lsn)?;
            if level == 0 {
                return self.install_new_root(ctx, &separator, right_pid, spare, lsn);
            }

            let parent_overflows = {
                let child_pid = ctx.pages[level].page_id();
                let parent = &mut ctx.pages[level - 1];
                let overflow;
                {
                    let data = parent.data_mut()?;
                    let mut node = InternalPage::<_, N>::new(data);
                    let child_slot = node.child_index(child_pid)?;
                    node.insert_at(child_slot + 1, &separator, right_pid)?;
                    if let Some(lsn) = lsn {
                        node.set_lsn(lsn.0);
                    }
                    overflow = node.size() > node.max_size();
                }
                parent.mark_dirty();
                overflow
            };
            if !parent_overflows {
                return Ok(());
            }
            level -= 1;
        }
    }

    /// Splits `ctx.pages[level]`, moving its upper half into a reserved
    /// page. Returns the separator to push up and the new page's id.
    fn split_node<'a>(
        &'a self,
        ctx: &mut IndexContext<'a>,
        level: usize,
        spare: &mut Vec<PinnedPage<'a>>,
        lsn: Option<Lsn>,
    ) -> Result<(GenericKey<N>, PageId)> {
        let right_pin = spare.pop().ok_or_else(|| {
            TinyDbError::LogicError("split without a reserved page".to_string())
        })?;
        let right_pid = right_pin.page_id();
        let mut right_latch = right_pin.latch_write();

        let node = &mut ctx.pages[level];
        let page_type = PageHeader::page_type_of(node.data())?;
        let separator;
        let mut moved_children = Vec::new();
        {
            let data = node.data_mut()?;
            match page_type {
                PageType::Leaf => {
                    let mut left = LeafPage::<_, N>::new(data);
                    let mut right = LeafPage::<_, N>::new(right_latch.as_mut_slice());
                    right.init(right_pid, self.leaf_max_size);
                    right.set_parent(left.parent());
                    left.move_upper_half_to(&mut right);
                    right.set_next_page_id(left.next_page_id());
                    left.set_next_page_id(right_pid);
                    separator = right.key_at(0);
                    if let Some(lsn) = lsn {
                        left.set_lsn(lsn.0);
                        right.set_lsn(lsn.0);
                    }
                }
                PageType::Internal => {
                    let mut left = InternalPage::<_, N>::new(data);
                    let mut right = InternalPage::<_, N>::new(right_latch.as_mut_slice());
                    right.init(right_pid, self.internal_max_size);
                    right.set_parent(left.parent());
                    separator = left.move_upper_half_to(&mut right);
                    for idx in 0..right.size() {
                        moved_children.push(right.child_at(idx));
                    }
                    if let Some(lsn) = lsn {
                        left.set_lsn(lsn.0);
                        right.set_lsn(lsn.0);
                    }
                }
                PageType::Invalid => {
                    return Err(TinyDbError::Unreachable(
                        "split of an uninitialized page".to_string(),
                    ));
                }
            }
        }
        node.mark_dirty();
        right_pin.mark_dirty();
        drop(right_latch);
        drop(right_pin);

        for child in moved_children {
            self.update_parent(ctx, child, right_pid, lsn)?;
        }
        Ok((separator, right_pid))
    }

    fn install_new_root<'a>(
        &'a self,
        ctx: &mut IndexContext<'a>,
        separator: &GenericKey<N>,
        right_pid: PageId,
        spare: &mut Vec<PinnedPage<'a>>,
        lsn: Option<Lsn>,
    ) -> Result<()> {
        let root_pin = spare.pop().ok_or_else(|| {
            TinyDbError::LogicError("root split without a reserved page".to_string())
        })?;
        let new_root_pid = root_pin.page_id();
        let old_root_pid = ctx.pages[0].page_id();
        {
            let mut latch = root_pin.latch_write();
            let mut root = InternalPage::<_, N>::new(latch.as_mut_slice());
            root.init(new_root_pid, self.internal_max_size);
            root.populate_new_root(old_root_pid, separator, right_pid);
            if let Some(lsn) = lsn {
                root.set_lsn(lsn.0);
            }
        }
        root_pin.mark_dirty();
        drop(root_pin);

        self.update_parent(ctx, old_root_pid, new_root_pid, lsn)?;
        self.update_parent(ctx, right_pid, new_root_pid, lsn)?;
        ctx.set_root(new_root_pid)
    }

    // ------------------------------------------------------------------
    // Delete
    // ------------------------------------------------------------------

    /// Removes `(key, rid)`; both must match, so duplicates delete
    /// precisely. Returns false when no such entry exists.
    pub fn delete(&self, key: &GenericKey<N>, rid: Rid) -> Result<bool> {
        match self.delete_primary(key, rid)? {
            DeleteOutcome::Done(removed) => Ok(removed),
            DeleteOutcome::RetryLeftmost => self.delete_from_run(key, rid),
        }
    }

    fn delete_primary(&self, key: &GenericKey<N>, rid: Rid) -> Result<DeleteOutcome> {
        let mut ctx = IndexContext::new();
        let root_guard = self.root_page_id.write();
        if !root_guard.is_valid() {
            return Ok(DeleteOutcome::Done(false));
        }
        let root_pid = *root_guard;
        ctx.root = Some(RootLatch::Write(root_guard));
        self.latch_path(&mut ctx, root_pid, key, WriteOp::Delete, false)?;

        let pos = {
            let top = ctx.top()?;
            let leaf = LeafPage::<_, N>::new(top.data());
            self.find_in_leaf(&leaf, key, rid)?
        };

        let Some(pos) = pos else {
            let run_continues_left = self.allow_duplicates && {
                let top = ctx.top()?;
                let leaf = LeafPage::<_, N>::new(top.data());
                leaf.size() > 0
                    && !leaf.is_root()
                    && self.comparator.compare(&leaf.key_at(0), key)? == Ordering::Equal
            };
            return if run_continues_left {
                drop(ctx);
                Ok(DeleteOutcome::RetryLeftmost)
            } else {
                Ok(DeleteOutcome::Done(false))
            };
        };

        let lsn = self.log_mutation(LogRecordType::IndexDelete, key, rid)?;
        let level = ctx.pages.len() - 1;
        let result = self.remove_from_leaf(&mut ctx, level, pos, lsn);
        self.finish(ctx);
        result.map(|_| DeleteOutcome::Done(true))
    }

    /// Fallback for duplicate runs spanning leaves: descend to the run's
    /// first leaf and walk it front to back under coupled write latches.
    fn delete_from_run(&self, key: &GenericKey<N>, rid: Rid) -> Result<bool> {
        let mut ctx = IndexContext::new();
        let root_guard = self.root_page_id.write();
        if !root_guard.is_valid() {
            return Ok(false);
        }
        let root_pid = *root_guard;
        ctx.root = Some(RootLatch::Write(root_guard));
        self.latch_path(&mut ctx, root_pid, key, WriteOp::Delete, true)?;
        let reached = ctx.pages.len() - 1;

        let found = loop {
            let (found, next) = {
                let top = ctx.top()?;
                let leaf = LeafPage::<_, N>::new(top.data());
                let found = self.find_in_leaf(&leaf, key, rid)?;
                let next = leaf.next_page_id();
                let past = leaf.size() > 0
                    && self.comparator.compare(&leaf.key_at(leaf.size() - 1), key)?
                        == Ordering::Greater;
                (found, if past { INVALID_PAGE_ID } else { next })
            };
            if found.is_some() {
                break found.map(|pos| (ctx.pages.len() - 1, pos));
            }
            if !next.is_valid() {
                break None;
            }
            let pin = self.fetch(next)?;
            let latch = pin.latch_write();
            ctx.pages.push(LatchedPage::write(latch, pin));
        };

        let result = match found {
            None => Ok(false),
            Some((ctx_idx, pos)) => {
                let lsn = self.log_mutation(LogRecordType::IndexDelete, key, rid)?;
                if ctx_idx == reached {
                    self.remove_from_leaf(&mut ctx, ctx_idx, pos, lsn)?;
                } else {
                    self.remove_from_chained_leaf(&mut ctx, ctx_idx, pos, lsn)?;
                }
                Ok(true)
            }
        };
        self.finish(ctx);
        result
    }

    /// Scans a leaf's equal-key run for the exact `(key, rid)` entry.
    fn find_in_leaf<T: AsRef<[u8]>>(
        &self,
        leaf: &LeafPage<T, N>,
        key: &GenericKey<N>,
        rid: Rid,
    ) -> Result<Option<usize>> {
        let mut idx = leaf.lower_bound(key, &self.comparator)?;
        while idx < leaf.size() {
            match self.comparator.compare(&leaf.key_at(idx), key)? {
                Ordering::Equal => {
                    if leaf.rid_at(idx) == rid {
                        return Ok(Some(idx));
                    }
                    idx += 1;
                }
                _ => break,
            }
        }
        Ok(None)
    }

    fn remove_from_leaf<'a>(
        &'a self,
        ctx: &mut IndexContext<'a>,
        level: usize,
        pos: usize,
        lsn: Option<Lsn>,
    ) -> Result<()> {
        let is_root;
        let size;
        let underflow;
        {
            let node = &mut ctx.pages[level];
            {
                let data = node.data_mut()?;
                let mut leaf = LeafPage::<_, N>::new(data);
                leaf.remove_at(pos);
                if let Some(lsn) = lsn {
                    leaf.set_lsn(lsn.0);
                }
                is_root = leaf.is_root();
                size = leaf.size();
                underflow = size < leaf.min_size();
            }
            node.mark_dirty();
        }

        if is_root {
            // An emptied leaf root empties the tree.
            if size == 0 {
                let page_id = ctx.pages[level].page_id();
                ctx.set_root(INVALID_PAGE_ID)?;
                ctx.deleted.push(page_id);
            }
            return Ok(());
        }
        if underflow {
            self.handle_underflow(ctx, level, lsn)?;
        }
        Ok(())
    }

    /// Removal from a leaf reached by chain-walking a duplicate run.
    /// Its parent is not latched, so underflow is repaired by borrowing
    /// from the preceding run leaf, which shares the separator key.
    fn remove_from_chained_leaf<'a>(
        &'a self,
        ctx: &mut IndexContext<'a>,
        ctx_idx: usize,
        pos: usize,
        lsn: Option<Lsn>,
    ) -> Result<()> {
        let (before, after) = ctx.pages.split_at_mut(ctx_idx);
        let prev_entry = &mut before[ctx_idx - 1];
        let cur_entry = &mut after[0];

        let underflow;
        {
            let data = cur_entry.data_mut()?;
            let mut leaf = LeafPage::<_, N>::new(data);
            leaf.remove_at(pos);
            if let Some(lsn) = lsn {
                leaf.set_lsn(lsn.0);
            }
            underflow = leaf.size() < leaf.min_size();
        }
        cur_entry.mark_dirty();
        if !underflow {
            return Ok(());
        }

        let can_borrow = {
            let prev = LeafPage::<_, N>::new(prev_entry.data());
            prev.size() > prev.min_size()
        };
        if can_borrow {
            let prev_data = prev_entry.data_mut()?;
            let cur_data = cur_entry.data_mut()?;
            let mut prev = LeafPage::<_, N>::new(prev_data);
            let mut cur = LeafPage::<_, N>::new(cur_data);
            // Both boundary keys equal the run key, so the parent
            // separator stays valid without being touched.
            prev.move_last_to_front_of(&mut cur)?;
            if let Some(lsn) = lsn {
                prev.set_lsn(lsn.0);
                cur.set_lsn(lsn.0);
            }
            prev_entry.mark_dirty();
            cur_entry.mark_dirty();
        } else {
            log::warn!(
                "index {}: leaf {} in a duplicate run left under-occupied",
                self.index_name,
                cur_entry.page_id()
            );
        }
        Ok(())
    }

    /// Rebalances `ctx.pages[level]` after it dropped below its
    /// occupancy floor: redistribute with the adjacent sibling when the
    /// combined size exceeds one page, merge otherwise, propagating the
    /// underflow toward the root.
    fn handle_underflow<'a>(
        &'a self,
        ctx: &mut IndexContext<'a>,
        mut level: usize,
        lsn: Option<Lsn>,
    ) -> Result<()> {
        loop {
            if level == 0 {
                return self.adjust_root(ctx, lsn);
            }

            let node_pid = ctx.pages[level].page_id();
            let (sibling_pid, sibling_is_left, separator_slot) = {
                let parent = InternalPage::<_, N>::new(ctx.pages[level - 1].data());
                let node_slot = parent.child_index(node_pid)?;
                if node_slot > 0 {
                    (parent.child_at(node_slot - 1), true, node_slot)
                } else {
                    (parent.child_at(node_slot + 1), false, node_slot + 1)
                }
            };

            let sibling_pin = self.fetch(sibling_pid)?;
            let mut sibling_latch = sibling_pin.latch_write();

            let node_size = PageHeader::size_of(ctx.pages[level].data()) as usize;
            let max = PageHeader::max_size_of(ctx.pages[level].data()) as usize;
            let sibling_size = PageHeader::size_of(sibling_latch.as_slice()) as usize;
            let page_type = PageHeader::page_type_of(ctx.pages[level].data())?;

            if node_size + sibling_size > max {
                self.redistribute(
                    ctx,
                    level,
                    sibling_latch.as_mut_slice(),
                    sibling_is_left,
                    separator_slot,
                    page_type,
                    lsn,
                )?;
                sibling_pin.mark_dirty();
                return Ok(());
            }

            self.merge(
                ctx,
                level,
                sibling_latch.as_mut_slice(),
                sibling_is_left,
                separator_slot,
                page_type,
                lsn,
            )?;
            sibling_pin.mark_dirty();
            drop(sibling_latch);
            drop(sibling_pin);

            let parent_idx = level - 1;
            let (parent_is_root, parent_size, parent_underflow) = {
                let parent = InternalPage::<_, N>::new(ctx.pages[parent_idx].data());
                (
                    parent.is_root(),
                    parent.size(),
                    parent.size() < parent.min_size(),
                )
            };
            if parent_is_root {
                if parent_size == 1 {
                    return self.adjust_root(ctx, lsn);
                }
                return Ok(());
            }
            if !parent_underflow {
                return Ok(());
            }
            level = parent_idx;
        }
    }

    /// Moves one entry between the node and its sibling and refreshes
    /// the separator between them.
    #[allow(clippy::too_many_arguments)]
    fn redistribute<'a>(
        &'a self,
        ctx: &mut IndexContext<'a>,
        level: usize,
        sibling_data: &mut [u8],
        sibling_is_left: bool,
        separator_slot: usize,
        page_type: PageType,
        lsn: Option<Lsn>,
    ) -> Result<()> {
        let node_pid = ctx.pages[level].page_id();
        let (new_separator, moved_child) = {
            let (before, after) = ctx.pages.split_at_mut(level);
            let parent_entry = &before[level - 1];
            let node_entry = &mut after[0];
            let node_data = node_entry.data_mut()?;

            let out = match page_type {
                PageType::Leaf => {
                    let mut node = LeafPage::<_, N>::new(node_data);
                    let mut sibling = LeafPage::<_, N>::new(sibling_data);
                    if sibling_is_left {
                        sibling.move_last_to_front_of(&mut node)?;
                        if let Some(lsn) = lsn {
                            node.set_lsn(lsn.0);
                            sibling.set_lsn(lsn.0);
                        }
                        (node.key_at(0), None)
                    } else {
                        sibling.move_first_to_end_of(&mut node)?;
                        if let Some(lsn) = lsn {
                            node.set_lsn(lsn.0);
                            sibling.set_lsn(lsn.0);
                        }
                        (sibling.key_at(0), None)
                    }
                }
                PageType::Internal => {
                    let parent = InternalPage::<_, N>::new(parent_entry.data());
                    let old_separator = parent.key_at(separator_slot);
                    let mut node = InternalPage::<_, N>::new(node_data);
                    let mut sibling = InternalPage::<_, N>::new(sibling_data);
                    if sibling_is_left {
                        // The separator rotates down in front of the
                        // node; the sibling's last child moves over.
                        let moved = sibling.child_at(sibling.size() - 1);
                        let new_separator = sibling.key_at(sibling.size() - 1);
                        node.set_key_at(0, &old_separator);
                        node.insert_at(0, &GenericKey::zeroed(), moved)?;
                        sibling.remove_at(sibling.size() - 1);
                        if let Some(lsn) = lsn {
                            node.set_lsn(lsn.0);
                            sibling.set_lsn(lsn.0);
                        }
                        (new_separator, Some(moved))
                    } else {
                        let moved = sibling.child_at(0);
                        let new_separator = sibling.key_at(1);
                        node.insert_at(node.size(), &old_separator, moved)?;
                        sibling.remove_at(0);
                        sibling.set_key_at(0, &GenericKey::zeroed());
                        if let Some(lsn) = lsn {
                            node.set_lsn(lsn.0);
                            sibling.set_lsn(lsn.0);
                        }
                        (new_separator, Some(moved))
                    }
                }
                PageType::Invalid => {
                    return Err(TinyDbError::Unreachable(
                        "redistribute over an uninitialized page".to_string(),
                    ));
                }
            };
            node_entry.mark_dirty();
            out
        };

        {
            let parent = &mut ctx.pages[level - 1];
            {
                let data = parent.data_mut()?;
                let mut view = InternalPage::<_, N>::new(data);
                view.set_key_at(separator_slot, &new_separator);
                if let Some(lsn) = lsn {
                    view.set_lsn(lsn.0);
                }
            }
            parent.mark_dirty();
        }

        if let Some(child) = moved_child {
            self.update_parent(ctx, child, node_pid, lsn)?;
        }
        Ok(())
    }

    /// Merges the right page of the (node, sibling) pair into the left
    /// one, removes the separator from the parent, and frees the right
    /// page.
    #[allow(clippy::too_many_arguments)]
    fn merge<'a>(
        &'a self,
        ctx: &mut IndexContext<'a>,
        level: usize,
        sibling_data: &mut [u8],
        sibling_is_left: bool,
        separator_slot: usize,
        page_type: PageType,
        lsn: Option<Lsn>,
    ) -> Result<()> {
        let node_pid = ctx.pages[level].page_id();
        let sibling_pid = PageHeader::page_id_of(sibling_data);
        let survivor_pid = if sibling_is_left { sibling_pid } else { node_pid };
        let freed_pid = if sibling_is_left { node_pid } else { sibling_pid };

        let moved_children = {
            let (before, after) = ctx.pages.split_at_mut(level);
            let parent_entry = &before[level - 1];
            let node_entry = &mut after[0];
            let node_data = node_entry.data_mut()?;

            let moved = match page_type {
                PageType::Leaf => {
                    let mut node = LeafPage::<_, N>::new(node_data);
                    let mut sibling = LeafPage::<_, N>::new(sibling_data);
                    if sibling_is_left {
                        node.move_all_to(&mut sibling);
                        sibling.set_next_page_id(node.next_page_id());
                    } else {
                        sibling.move_all_to(&mut node);
                        node.set_next_page_id(sibling.next_page_id());
                    }
                    if let Some(lsn) = lsn {
                        node.set_lsn(lsn.0);
                        sibling.set_lsn(lsn.0);
                    }
                    Vec::new()
                }
                PageType::Internal => {
                    let parent = InternalPage::<_, N>::new(parent_entry.data());
                    let separator = parent.key_at(separator_slot);
                    let mut node = InternalPage::<_, N>::new(node_data);
                    let mut sibling = InternalPage::<_, N>::new(sibling_data);
                    let mut moved = Vec::new();
                    if sibling_is_left {
                        for idx in 0..node.size() {
                            moved.push(node.child_at(idx));
                        }
                        node.move_all_to(&mut sibling, &separator)?;
                    } else {
                        for idx in 0..sibling.size() {
                            moved.push(sibling.child_at(idx));
                        }
                        sibling.move_all_to(&mut node, &separator)?;
                    }
                    if let Some(lsn) = lsn {
                        node.set_lsn(lsn.0);
                        sibling.set_lsn(lsn.0);
                    }
                    moved
                }
                PageType::Invalid => {
                    return Err(TinyDbError::Unreachable(
                        "merge over an uninitialized page".to_string(),
                    ));
                }
            };
            node_entry.mark_dirty();
            moved
        };

        {
            let parent = &mut ctx.pages[level - 1];
            {
                let data = parent.data_mut()?;
                let mut view = InternalPage::<_, N>::new(data);
                view.remove_at(separator_slot);
                if let Some(lsn) = lsn {
                    view.set_lsn(lsn.0);
                }
            }
            parent.mark_dirty();
        }

        ctx.deleted.push(freed_pid);
        for child in moved_children {
            self.update_parent(ctx, child, survivor_pid, lsn)?;
        }
        Ok(())
    }

    /// Shrinks the tree when the root ends up degenerate: an internal
    /// root with a sole child promotes that child; an emptied leaf root
    /// empties the tree.
    fn adjust_root<'a>(&'a self, ctx: &mut IndexContext<'a>, lsn: Option<Lsn>) -> Result<()> {
        let root_pid = ctx.pages[0].page_id();
        let (page_type, size) = {
            let data = ctx.pages[0].data();
            (
                PageHeader::page_type_of(data)?,
                PageHeader::size_of(data) as usize,
            )
        };
        match page_type {
            PageType::Internal if size == 1 => {
                let child = InternalPage::<_, N>::new(ctx.pages[0].data()).child_at(0);
                self.update_parent(ctx, child, INVALID_PAGE_ID, lsn)?;
                ctx.set_root(child)?;
                ctx.deleted.push(root_pid);
            }
            PageType::Leaf if size == 0 => {
                ctx.set_root(INVALID_PAGE_ID)?;
                ctx.deleted.push(root_pid);
            }
            _ => {}
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Scan
    // ------------------------------------------------------------------

    /// Appends every RID stored under `key`, in insertion order.
    pub fn scan(&self, key: &GenericKey<N>, results: &mut Vec<Rid>) -> Result<()> {
        let mut ctx = IndexContext::new();
        let root_guard = self.root_page_id.read();
        if !root_guard.is_valid() {
            return Ok(());
        }
        let root_pid = *root_guard;
        ctx.root = Some(RootLatch::Read(root_guard));

        let mut page_id = root_pid;
        loop {
            let pin = self.fetch(page_id)?;
            let latch = pin.latch_read();
            ctx.pages.push(LatchedPage::read(latch, pin));
            ctx.release_ancestors();

            let top = ctx.top()?;
            match PageHeader::page_type_of(top.data())? {
                PageType::Leaf => break,
                PageType::Internal => {
                    let node = InternalPage::<_, N>::new(top.data());
                    page_id = node.lookup_leftmost(key, &self.comparator)?;
                }
                PageType::Invalid => {
                    return Err(TinyDbError::Unreachable(format!(
                        "{} has no page type",
                        top.page_id()
                    )));
                }
            }
        }

        // The run may continue over the leaf chain; couple into the next
        // leaf before releasing the current one.
        loop {
            let (past_run, next) = {
                let top = ctx.top()?;
                let leaf = LeafPage::<_, N>::new(top.data());
                let mut idx = leaf.lower_bound(key, &self.comparator)?;
                let mut past = false;
                while idx < leaf.size() {
                    match self.comparator.compare(&leaf.key_at(idx), key)? {
                        Ordering::Equal => results.push(leaf.rid_at(idx)),
                        Ordering::Greater => {
                            past = true;
                            break;
                        }
                        Ordering::Less => {}
                    }
                    idx += 1;
                }
                (past, leaf.next_page_id())
            };
            if past_run || !next.is_valid() {
                return Ok(());
            }
            let pin = self.fetch(next)?;
            let latch = pin.latch_read();
            ctx.pages.push(LatchedPage::read(latch, pin));
            ctx.release_ancestors();
        }
    }

    // ------------------------------------------------------------------
    // Shared plumbing
    // ------------------------------------------------------------------

    /// Descends to the leaf for `key` under write latches, releasing
    /// ancestors whenever the newly latched child is safe for `op`.
    fn latch_path<'a>(
        &'a self,
        ctx: &mut IndexContext<'a>,
        root_pid: PageId,
        key: &GenericKey<N>,
        op: WriteOp,
        leftmost: bool,
    ) -> Result<()> {
        let mut page_id = root_pid;
        loop {
            let pin = self.fetch(page_id)?;
            let latch = pin.latch_write();
            let entry = LatchedPage::write(latch, pin);
            let safe = self.is_safe(entry.data(), op)?;
            ctx.pages.push(entry);
            if safe {
                ctx.release_ancestors();
            }

            let top = ctx.top()?;
            match PageHeader::page_type_of(top.data())? {
                PageType::Leaf => return Ok(()),
                PageType::Internal => {
                    let node = InternalPage::<_, N>::new(top.data());
                    page_id = if leftmost {
                        node.lookup_leftmost(key, &self.comparator)?
                    } else {
                        node.lookup(key, &self.comparator)?
                    };
                }
                PageType::Invalid => {
                    return Err(TinyDbError::Unreachable(format!(
                        "{} has no page type",
                        top.page_id()
                    )));
                }
            }
        }
    }

    /// A child is safe when the in-flight operation cannot cascade a
    /// structural change past it.
    fn is_safe(&self, data: &[u8], op: WriteOp) -> Result<bool> {
        let size = PageHeader::size_of(data) as usize;
        let max = PageHeader::max_size_of(data) as usize;
        let is_root = !PageHeader::parent_of(data).is_valid();
        let page_type = PageHeader::page_type_of(data)?;
        Ok(match op {
            WriteOp::Insert => size < max,
            WriteOp::Delete => {
                if is_root {
                    match page_type {
                        PageType::Leaf => size > 1,
                        PageType::Internal => size > 2,
                        PageType::Invalid => false,
                    }
                } else {
                    size > (max + 1) / 2
                }
            }
        })
    }

    /// Updates a child's parent pointer, writing through the held latch
    /// when the child is on the crab path.
    fn update_parent<'a>(
        &'a self,
        ctx: &mut IndexContext<'a>,
        child: PageId,
        parent: PageId,
        lsn: Option<Lsn>,
    ) -> Result<()> {
        for entry in ctx.pages.iter_mut() {
            if entry.page_id() == child {
                let data = entry.data_mut()?;
                PageHeader::set_parent(data, parent);
                if let Some(lsn) = lsn {
                    PageHeader::set_lsn(data, lsn.0);
                }
                entry.mark_dirty();
                return Ok(());
            }
        }
        let pin = self.fetch(child)?;
        {
            let mut latch = pin.latch_write();
            PageHeader::set_parent(latch.as_mut_slice(), parent);
            if let Some(lsn) = lsn {
                PageHeader::set_lsn(latch.as_mut_slice(), lsn.0);
            }
        }
        pin.mark_dirty();
        Ok(())
    }

    fn fetch(&self, page_id: PageId) -> Result<PinnedPage<'_>> {
        self.bpm.fetch_page(page_id, false)?.ok_or_else(|| {
            TinyDbError::OutOfMemory(format!("no frame available for {}", page_id))
        })
    }

    fn allocate(&self) -> Result<PinnedPage<'_>> {
        self.bpm.new_page()?.ok_or_else(|| {
            TinyDbError::OutOfMemory(format!(
                "buffer pool exhausted growing index {}",
                self.index_name
            ))
        })
    }

    /// Releases every latch and pin, then hands deallocated pages to
    /// the buffer pool.
    fn finish(&self, mut ctx: IndexContext<'_>) {
        let deleted = ctx.take_deleted();
        drop(ctx);
        for page_id in deleted {
            self.bpm.delete_page(page_id);
        }
    }

    /// Appends a WAL record for a mutation; its LSN is stamped into
    /// every page the mutation dirties.
    fn log_mutation(
        &self,
        record_type: LogRecordType,
        key: &GenericKey<N>,
        rid: Rid,
    ) -> Result<Option<Lsn>> {
        let Some(log) = &self.log else {
            return Ok(None);
        };
        let mut payload = BytesMut::with_capacity(N + Rid::SIZE);
        payload.put_slice(key.as_bytes());
        payload.put_slice(&rid.to_bytes());
        let mut record = LogRecord::new(record_type, INVALID_TXN_ID, payload.freeze());
        Ok(Some(log.append(&mut record)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use tinydb_buffer::{BufferPoolConfig, DiskManager, DiskManagerConfig};
    use tinydb_common::{Column, Schema, TypeId, Value};

    const W: usize = 8;

    fn test_tree(
        pool_size: usize,
        leaf_max: u32,
        internal_max: u32,
        allow_duplicates: bool,
    ) -> (BPlusTree<W>, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let disk = Arc::new(
            DiskManager::new(DiskManagerConfig {
                db_path: dir.path().join("index.db"),
                fsync_enabled: false,
            })
            .unwrap(),
        );
        let bpm = Arc::new(BufferPoolManager::new(
            BufferPoolConfig { pool_size },
            disk,
            None,
        ));
        let schema = Arc::new(Schema::new(vec![Column::new("k", TypeId::BigInt)]));
        let comparator = GenericComparator::new(schema).unwrap();
        let tree = BPlusTree::new(
            "test_index",
            bpm,
            None,
            comparator,
            leaf_max,
            internal_max,
            allow_duplicates,
        )
        .unwrap();
        (tree, dir)
    }

    fn key(v: i64) -> GenericKey<W> {
        let schema = Schema::new(vec![Column::new("k", TypeId::BigInt)]);
        let tuple =
            crate::tuple::Tuple::from_values(&[Value::BigInt(Some(v))], &schema).unwrap();
        GenericKey::from_tuple(&tuple).unwrap()
    }

    fn rid(v: u32) -> Rid {
        Rid::new(PageId(v), v)
    }

    fn scan_one(tree: &BPlusTree<W>, v: i64) -> Vec<Rid> {
        let mut out = Vec::new();
        tree.scan(&key(v), &mut out).unwrap();
        out
    }

    #[test]
    fn test_empty_tree() {
        let (tree, _dir) = test_tree(16, 3, 3, false);
        assert!(tree.is_empty());
        assert_eq!(scan_one(&tree, 1), vec![]);
        assert!(!tree.delete(&key(1), rid(1)).unwrap());
    }

    #[test]
    fn test_single_leaf_insert_scan() {
        let (tree, _dir) = test_tree(16, 3, 3, false);

        assert!(tree.insert(&key(2), rid(2)).unwrap());
        assert!(tree.insert(&key(1), rid(1)).unwrap());
        assert!(!tree.is_empty());

        assert_eq!(scan_one(&tree, 1), vec![rid(1)]);
        assert_eq!(scan_one(&tree, 2), vec![rid(2)]);
        assert_eq!(scan_one(&tree, 3), vec![]);
    }

    #[test]
    fn test_unique_rejects_duplicate() {
        let (tree, _dir) = test_tree(16, 3, 3, false);

        assert!(tree.insert(&key(5), rid(1)).unwrap());
        assert!(!tree.insert(&key(5), rid(2)).unwrap());
        assert_eq!(scan_one(&tree, 5), vec![rid(1)]);
    }

    #[test]
    fn test_split_and_lookup() {
        let (tree, _dir) = test_tree(16, 3, 3, false);

        for v in 1..=10i64 {
            assert!(tree.insert(&key(v), rid(v as u32)).unwrap());
        }
        for v in 1..=10i64 {
            assert_eq!(scan_one(&tree, v), vec![rid(v as u32)]);
        }
    }

    #[test]
    fn test_delete_until_empty() {
        let (tree, _dir) = test_tree(16, 3, 3, false);

        for v in 1..=8i64 {
            tree.insert(&key(v), rid(v as u32)).unwrap();
        }
        for v in 1..=8i64 {
            assert!(tree.delete(&key(v), rid(v as u32)).unwrap());
            assert_eq!(scan_one(&tree, v), vec![]);
        }
        assert!(tree.is_empty());

        // Everything the tree allocated went back to the pool.
        assert!(tree.bpm.check_pin_count());
    }

    #[test]
    fn test_delete_requires_matching_rid() {
        let (tree, _dir) = test_tree(16, 3, 3, false);

        tree.insert(&key(1), rid(1)).unwrap();
        assert!(!tree.delete(&key(1), rid(99)).unwrap());
        assert_eq!(scan_one(&tree, 1), vec![rid(1)]);
    }

    #[test]
    fn test_duplicates_scan_in_insertion_order() {
        let (tree, _dir) = test_tree(16, 4, 3, true);

        tree.insert(&key(5), rid(1)).unwrap();
        tree.insert(&key(5), rid(2)).unwrap();
        tree.insert(&key(5), rid(3)).unwrap();

        assert_eq!(scan_one(&tree, 5), vec![rid(1), rid(2), rid(3)]);
    }

    #[test]
    fn test_reverse_insertion() {
        let (tree, _dir) = test_tree(16, 3, 3, false);

        for v in (1..=20i64).rev() {
            tree.insert(&key(v), rid(v as u32)).unwrap();
        }
        for v in 1..=20i64 {
            assert_eq!(scan_one(&tree, v), vec![rid(v as u32)]);
        }
    }

    #[test]
    fn test_pool_exhaustion_surfaces_out_of_memory() {
        // Two frames cannot hold a crab path plus split reservations.
        let (tree, _dir) = test_tree(2, 3, 3, false);

        let mut saw_oom = false;
        for v in 1..=16i64 {
            match tree.insert(&key(v), rid(v as u32)) {
                Ok(_) => {}
                Err(TinyDbError::OutOfMemory(_)) => {
                    saw_oom = true;
                    break;
                }
                Err(other) => panic!("unexpected error: {}", other),
            }
        }
        assert!(saw_oom);
        // All latches and pins were released on the error path.
        assert!(tree.bpm.check_pin_count());
    }
}
