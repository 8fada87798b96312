//! Insert: optimistic descent, leaf insert, split and split propagation

use super::context::{OpContext, SplitKey, TreeOp};
use super::discipline::{KeyBound, SplitPlan, interior_tuple, parse_interior, union_all};
use super::frame::{self, NodeFrame, SpaceStatus};
use super::TreeIndex;
use crate::buffer::PageWriteGuard;
use std::cmp::Ordering as KeyOrdering;
use std::sync::atomic::Ordering;
use strata_common::{Error, PageId, Result, Tuple};
use tracing::{debug, warn};

/// Where an image lands in a page that has to split
#[derive(Clone, Copy, Debug)]
enum Placement {
    Insert(usize),
    Replace(usize),
}

/// Outcome of enlarging an interior entry
enum Enlarged {
    Done,
    /// The page changed since it was read
    Stale,
    /// The wider entry did not fit and the page split
    Split,
}

impl TreeIndex {
    /// Insert a tuple
    pub fn insert(&self, ctx: &mut OpContext, tuple: &Tuple) -> Result<()> {
        self.discipline.validate(tuple)?;
        let image = tuple.encode();
        self.check_tuple_size(image.len())?;
        let key = self.discipline.leaf_bound(tuple)?;
        ctx.reset(TreeOp::Insert);
        self.repair_splits()?;

        self.inflight_inserts.fetch_add(1, Ordering::AcqRel);
        let result = self.insert_tuple(ctx, tuple, &image, &key);
        self.inflight_inserts.fetch_sub(1, Ordering::AcqRel);
        result
    }

    fn insert_tuple(
        &self,
        ctx: &mut OpContext,
        tuple: &Tuple,
        image: &[u8],
        key: &KeyBound,
    ) -> Result<()> {
        let leaf = self.find_leaf(ctx, key)?;
        if self.discipline.is_unique() {
            self.check_unique(&leaf, tuple)?;
        }
        ctx.path.pop();
        self.insert_into_page(ctx, leaf, image, key)?;
        self.entries.fetch_add(1, Ordering::AcqRel);
        // The tuple is in place and reachable through right links even if
        // the parent update has to wait for a repair
        if let Err(e) = self.propagate_splits(ctx) {
            warn!(file = %self.file, error = %e, "parent update deferred");
        }
        Ok(())
    }

    fn check_unique(&self, leaf: &PageWriteGuard, tuple: &Tuple) -> Result<()> {
        let frame = NodeFrame::new(&leaf[..]);
        for slot in 0..frame.tuple_count() {
            if self.discipline.compare_keys(&frame.tuple(slot)?, tuple) == KeyOrdering::Equal {
                return Err(Error::DuplicateKey(tuple.to_string()));
            }
        }
        Ok(())
    }

    /// Descend to the leaf that should receive `key` and return it
    /// write-latched, enlarging interior bounds on the way
    fn find_leaf(&self, ctx: &mut OpContext, key: &KeyBound) -> Result<PageWriteGuard> {
        let mut page_id = PageId::ROOT;
        let mut parent_lsn = 0;
        loop {
            let read = self.pin_read(page_id)?;
            let node = NodeFrame::new(&read[..]);

            if node.is_leaf() {
                drop(read);
                let leaf = self.cache.pin_write(self.file, page_id)?;
                let node = NodeFrame::new(&leaf[..]);
                if !node.is_leaf() {
                    // The root split while unlatched
                    continue;
                }
                if self.moved_right(page_id, &node, parent_lsn) {
                    drop(leaf);
                    (page_id, parent_lsn) = self.retry_parent(ctx)?;
                    continue;
                }
                let lsn = node.lsn();
                ctx.path.push(page_id, lsn, None);
                return Ok(leaf);
            }

            if self.moved_right(page_id, &node, parent_lsn) {
                drop(read);
                (page_id, parent_lsn) = self.retry_parent(ctx)?;
                continue;
            }

            let lsn = node.lsn();
            let children = self.children(&node)?;
            if children.is_empty() {
                return Err(Error::corruption(format!("interior page {page_id} is empty")));
            }
            let bounds: Vec<KeyBound> = children.iter().map(|(bound, _)| bound.clone()).collect();
            let slot = self.discipline.choose_child(&bounds, key);
            let (child_bound, child) = &children[slot];
            let child = *child;
            let needs_enlarging = !self.discipline.covers(child_bound, key);
            drop(read);

            ctx.path.push(page_id, lsn, None);
            if needs_enlarging {
                match self.enlarge(ctx, page_id, lsn, slot, child, key)? {
                    Enlarged::Done => {}
                    Enlarged::Stale => {
                        // The page changed between the latches; choose again
                        ctx.path.pop();
                        self.stats.descent_retries.fetch_add(1, Ordering::Relaxed);
                        continue;
                    }
                    Enlarged::Split => {
                        ctx.path.pop();
                        self.propagate_splits(ctx)?;
                        ctx.path.clear();
                        (page_id, parent_lsn) = (PageId::ROOT, 0);
                        continue;
                    }
                }
            }
            page_id = child;
            parent_lsn = lsn;
        }
    }

    /// Step back to the parent after detecting a concurrent split
    fn retry_parent(&self, ctx: &mut OpContext) -> Result<(PageId, u64)> {
        self.stats.descent_retries.fetch_add(1, Ordering::Relaxed);
        ctx.retries += 1;
        if ctx.retries > self.options.max_descent_retries {
            return Err(Error::RetriesExhausted {
                attempts: ctx.retries,
            });
        }
        self.repair_splits()?;
        std::thread::yield_now();
        let parent = ctx
            .path
            .pop()
            .ok_or_else(|| Error::internal("split detected below an empty path"))?;
        let grandparent_lsn = ctx.path.last().map_or(0, |entry| entry.lsn);
        Ok((parent.page, grandparent_lsn))
    }

    /// Enlarge the bound of the entry at `slot` to cover `key`, splitting
    /// the page if the wider entry no longer fits
    fn enlarge(
        &self,
        ctx: &mut OpContext,
        page: PageId,
        lsn: u64,
        slot: usize,
        child: PageId,
        key: &KeyBound,
    ) -> Result<Enlarged> {
        let mut guard = self.cache.pin_write(self.file, page)?;
        let (current, pointer) = {
            let node = NodeFrame::new(&guard[..]);
            if node.lsn() != lsn {
                return Ok(Enlarged::Stale);
            }
            parse_interior(node.tuple(slot)?, self.bound_width())?
        };
        if pointer != child {
            return Err(Error::corruption(format!(
                "slot {slot} of page {page} moved without an LSN change"
            )));
        }
        if self.discipline.covers(&current, key) {
            return Ok(Enlarged::Done);
        }
        let image = interior_tuple(&self.discipline.union(&current, key), child).encode();
        if NodeFrame::new(&mut guard[..]).replace(slot, &image)? {
            return Ok(Enlarged::Done);
        }
        ctx.split = None;
        self.split_page(ctx, guard, &image, Placement::Replace(slot))?;
        Ok(Enlarged::Split)
    }

    /// Insert an image into a write-latched page, splitting it if full.
    /// On a non-root split the pending parent update is left in `ctx`.
    pub(super) fn insert_into_page(
        &self,
        ctx: &mut OpContext,
        mut page: PageWriteGuard,
        image: &[u8],
        bound: &KeyBound,
    ) -> Result<()> {
        ctx.split = None;
        let (status, slot) = {
            let node = NodeFrame::new(&page[..]);
            (
                node.has_space(image.len(), self.options.max_entries_per_page)?,
                self.insert_position(&node, image, bound)?,
            )
        };
        if status == SpaceStatus::Insufficient {
            return self.split_page(ctx, page, image, Placement::Insert(slot));
        }
        let mut node = NodeFrame::new(&mut page[..]);
        if status == SpaceStatus::SufficientAfterCompaction {
            node.compact()?;
        }
        node.insert_at(slot, image)?;
        node.set_lsn(self.generation.next());
        Ok(())
    }

    /// Slot a new image belongs at: sorted position for ordered keys,
    /// the end otherwise
    fn insert_position<B: AsRef<[u8]>>(
        &self,
        node: &NodeFrame<B>,
        image: &[u8],
        bound: &KeyBound,
    ) -> Result<usize> {
        let count = node.tuple_count();
        if !self.discipline.is_ordered() {
            return Ok(count);
        }
        let incoming = if node.is_leaf() {
            Some(Tuple::decode(image)?)
        } else {
            None
        };
        let (mut lo, mut hi) = (0, count);
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            let existing = node.tuple(mid)?;
            let goes_after = match &incoming {
                Some(tuple) => self.discipline.bulk_order(&existing, tuple) != KeyOrdering::Greater,
                None => self.entry_bound(node.level(), existing)?.low <= bound.low,
            };
            if goes_after {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        Ok(lo)
    }

    fn split_page(
        &self,
        ctx: &mut OpContext,
        mut page: PageWriteGuard,
        image: &[u8],
        placement: Placement,
    ) -> Result<()> {
        let page_id = page.page_id();
        let (level, old_nsn, old_right, old_follows, mut images) = {
            let node = NodeFrame::new(&page[..]);
            (
                node.level(),
                node.nsn(),
                node.right_sibling(),
                node.follows_right(),
                node.images()?,
            )
        };
        match placement {
            Placement::Insert(slot) => images.insert(slot, image.to_vec()),
            Placement::Replace(slot) => {
                *images
                    .get_mut(slot)
                    .ok_or_else(|| Error::internal(format!("replace slot {slot} beyond page")))? =
                    image.to_vec();
            }
        }
        let bounds = images
            .iter()
            .map(|img| self.entry_bound(level, Tuple::decode(img)?))
            .collect::<Result<Vec<_>>>()?;

        let plan = self.discipline.split_plan(&bounds);
        let split_at = self.fit_split(&plan, &images)?;
        let (left_half, right_half) = plan.order.split_at(split_at);
        let discipline = self.discipline.as_ref();
        let left_bound = union_all(discipline, left_half.iter().map(|&i| &bounds[i]))
            .ok_or_else(|| Error::internal("split produced an empty left page"))?;
        let right_bound = union_all(discipline, right_half.iter().map(|&i| &bounds[i]))
            .ok_or_else(|| Error::internal("split produced an empty right page"))?;

        let stamp = self.generation.next();
        let mut right = self.cache.new_page(self.file)?;
        let right_id = right.page_id();
        {
            let mut node = NodeFrame::new(&mut right[..]);
            node.init(level);
            for &i in right_half {
                node.append(&images[i])?;
            }
            node.set_lsn(stamp);
            node.set_nsn(old_nsn);
            node.set_right_sibling(old_right);
            node.set_follows_right(old_follows);
        }

        if page_id == PageId::ROOT {
            // Move the left half out of the root so the root keeps its id
            let mut left = self.cache.new_page(self.file)?;
            let left_id = left.page_id();
            {
                let mut node = NodeFrame::new(&mut left[..]);
                node.init(level);
                for &i in left_half {
                    node.append(&images[i])?;
                }
                node.set_lsn(stamp);
                node.set_nsn(stamp);
                node.set_right_sibling(Some(right_id));
            }
            let mut root = NodeFrame::new(&mut page[..]);
            root.init(level + 1);
            root.append(&interior_tuple(&left_bound, left_id).encode())?;
            root.append(&interior_tuple(&right_bound, right_id).encode())?;
            root.set_lsn(stamp);
            root.set_nsn(stamp);
            self.stats.root_splits.fetch_add(1, Ordering::Relaxed);
            debug!(file = %self.file, height = level + 2, "root split");
            return Ok(());
        }

        let mut node = NodeFrame::new(&mut page[..]);
        node.init(level);
        for &i in left_half {
            node.append(&images[i])?;
        }
        node.set_lsn(stamp);
        node.set_nsn(stamp);
        node.set_right_sibling(Some(right_id));
        node.set_follows_right(true);
        self.stats.splits.fetch_add(1, Ordering::Relaxed);

        ctx.split = Some(SplitKey {
            left: page_id,
            right: right_id,
            right_bound,
            level,
        });
        Ok(())
    }

    /// Split point closest to the planned one (or to the byte midpoint for
    /// ordered keys) at which both halves fit a page
    fn fit_split(&self, plan: &SplitPlan, images: &[Vec<u8>]) -> Result<usize> {
        let capacity = frame::capacity(self.cache.page_size());
        let max_entries = self.options.max_entries_per_page.unwrap_or(usize::MAX);
        let sizes: Vec<usize> = plan
            .order
            .iter()
            .map(|&i| frame::footprint(images[i].len()))
            .collect();
        let n = sizes.len();
        let total: usize = sizes.iter().sum();
        let mut prefix = vec![0; n + 1];
        for (i, size) in sizes.iter().enumerate() {
            prefix[i + 1] = prefix[i] + size;
        }
        let fits = |k: usize| {
            k > 0
                && k < n
                && prefix[k] <= capacity
                && total - prefix[k] <= capacity
                && k <= max_entries
                && n - k <= max_entries
        };

        let preferred = if self.discipline.is_ordered() {
            (1..n).find(|&k| prefix[k] * 2 >= total).unwrap_or(n / 2)
        } else {
            plan.split_at
        };
        for delta in 0..n {
            for k in [preferred.saturating_sub(delta), preferred + delta] {
                if fits(k) {
                    return Ok(k);
                }
            }
        }
        Err(Error::internal(format!(
            "no distribution of {n} entries fits two pages"
        )))
    }

    /// Post pending splits to their parents, level by level. A split that
    /// cannot be posted is queued for [`Self::repair_splits`].
    pub(super) fn propagate_splits(&self, ctx: &mut OpContext) -> Result<()> {
        while let Some(split) = ctx.split.take() {
            if let Err(e) = self.post_split(ctx, &split) {
                self.defer_split(split);
                // A parent that split before the failure is pending too
                if let Some(parent_split) = ctx.split.take() {
                    self.defer_split(parent_split);
                }
                return Err(e);
            }
        }
        Ok(())
    }

    fn post_split(&self, ctx: &mut OpContext, split: &SplitKey) -> Result<()> {
        let (mut parent, slot) = self.locate_parent(ctx, split.left, split.level)?;
        if self.inflight_inserts.load(Ordering::Acquire) <= 1 {
            self.tighten_child_bound(&mut parent, slot, split.left)?;
        }
        ctx.path.pop();
        let image = interior_tuple(&split.right_bound, split.right).encode();
        self.insert_into_page(ctx, parent, &image, &split.right_bound)?;
        self.clear_follow_right(split.left, split.right)
    }

    fn defer_split(&self, split: SplitKey) {
        debug!(file = %self.file, left = %split.left, right = %split.right, "split queued for repair");
        self.pending_splits.lock().push(split);
    }

    /// Finish the parent updates of splits that failed to post. Each split
    /// is taken by one thread; a failure queues it again.
    pub(super) fn repair_splits(&self) -> Result<()> {
        let pending = std::mem::take(&mut *self.pending_splits.lock());
        if pending.is_empty() {
            return Ok(());
        }
        let mut ctx = OpContext::new();
        let mut splits = pending.into_iter();
        while let Some(split) = splits.next() {
            if let Err(e) = self.repair_split(&mut ctx, split) {
                self.pending_splits.lock().extend(splits);
                return Err(e);
            }
            self.stats.deferred_splits.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    fn repair_split(&self, ctx: &mut OpContext, split: SplitKey) -> Result<()> {
        ctx.reset(TreeOp::Insert);
        // The entry may have been posted before a later step failed
        let posted = match self.find_parent(ctx, split.right, split.level) {
            Ok(posted) => posted,
            Err(e) => {
                self.defer_split(split);
                return Err(e);
            }
        };
        if posted {
            if let Err(e) = self.clear_follow_right(split.left, split.right) {
                self.defer_split(split);
                return Err(e);
            }
            return Ok(());
        }
        ctx.path.clear();
        ctx.split = Some(split);
        self.propagate_splits(ctx)
    }

    /// Clear the pending-split flag on the page whose right link points at
    /// the newly posted `right`
    fn clear_follow_right(&self, left: PageId, right: PageId) -> Result<()> {
        let mut page = left;
        loop {
            let mut guard = self.cache.pin_write(self.file, page)?;
            let next = NodeFrame::new(&guard[..]).right_sibling();
            match next {
                Some(next) if next == right => {
                    NodeFrame::new(&mut guard[..]).set_follows_right(false);
                    return Ok(());
                }
                Some(next) => page = next,
                None => return Ok(()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_util::*;
    use super::super::{OpContext, OrderedDiscipline, SearchPredicate, TreeIndex, TreeOptions};
    use super::*;
    use rand::seq::SliceRandom;
    use std::sync::Arc;
    use strata_common::Field;

    fn keys(tree: &TreeIndex) -> Vec<i64> {
        let mut keys: Vec<i64> = tree
            .scan(&SearchPredicate::All)
            .unwrap()
            .iter()
            .map(|t| t.field(0).and_then(Field::as_i64).unwrap())
            .collect();
        keys.sort_unstable();
        keys
    }

    #[test]
    fn test_insert_then_search_sees_key() {
        let tree = ordered_tree(Some(8));
        let mut ctx = OpContext::new();
        let mut values: Vec<i64> = (0..500).collect();
        values.shuffle(&mut rand::thread_rng());
        for (n, k) in values.iter().enumerate() {
            tree.insert(&mut ctx, &Tuple::ints(&[*k, k * 10])).unwrap();
            let found = tree.scan(&SearchPredicate::point(vec![Field::Int(*k)])).unwrap();
            assert_eq!(found, vec![Tuple::ints(&[*k, k * 10])]);
            if n % 97 == 0 {
                tree.check_structure().unwrap();
            }
        }
        assert_eq!(keys(&tree), (0..500).collect::<Vec<_>>());
        assert_eq!(tree.entry_count(), 500);
        let shape = tree.check_structure().unwrap();
        assert_eq!(shape.entries, 500);
        assert!(shape.height >= 3);
    }

    #[test]
    fn test_leaf_split_stamps() {
        let tree = ordered_tree(Some(4));
        let mut ctx = OpContext::new();
        for k in 0..5 {
            tree.insert(&mut ctx, &Tuple::ints(&[k])).unwrap();
        }
        // The root split once; its two children share the split stamp
        assert_eq!(tree.stats().root_splits.load(Ordering::Relaxed), 1);
        {
            let root_guard = tree.pin_read(PageId::ROOT).unwrap();
            let root = NodeFrame::new(&root_guard[..]);
            assert_eq!(root.level(), 1);
            assert_eq!(root.tuple_count(), 2);
            let stamp = root.nsn();

            let children = tree.children(&root).unwrap();
            let left_guard = tree.pin_read(children[0].1).unwrap();
            let left = NodeFrame::new(&left_guard[..]);
            assert_eq!(left.nsn(), stamp);
            assert_eq!(left.right_sibling(), Some(children[1].1));
            assert!(!left.follows_right());
        }

        for k in 5..8 {
            tree.insert(&mut ctx, &Tuple::ints(&[k])).unwrap();
        }
        assert_eq!(tree.stats().splits.load(Ordering::Relaxed), 1);
        tree.check_structure().unwrap();
    }

    #[test]
    fn test_nonroot_split_stamps_old_page() {
        let tree = ordered_tree(Some(4));
        let mut ctx = OpContext::new();
        for k in 0..8 {
            tree.insert(&mut ctx, &Tuple::ints(&[k])).unwrap();
        }
        let root = tree.pin_read(PageId::ROOT).unwrap();
        let root = NodeFrame::new(&root[..]);
        let children = tree.children(&root).unwrap();
        assert_eq!(children.len(), 3);

        // The page that split carries the newest NSN and links right
        let middle = tree.pin_read(children[1].1).unwrap();
        let middle = NodeFrame::new(&middle[..]);
        let right = tree.pin_read(children[2].1).unwrap();
        let right = NodeFrame::new(&right[..]);
        assert!(middle.nsn() > right.nsn());
        assert_eq!(middle.right_sibling(), Some(children[2].1));
        assert!(!middle.follows_right());
        assert!(middle.lsn() <= tree.generation().current());
    }

    #[test]
    fn test_failed_parent_update_is_repaired() {
        let tree = ordered_tree(Some(4));
        let mut ctx = OpContext::new();
        for k in 0..8 {
            tree.insert(&mut ctx, &Tuple::ints(&[k])).unwrap();
        }

        // Fill the rightmost leaf until it splits, then post the split
        // through a recorded parent that cannot be pinned
        let mut k = 100;
        let split = loop {
            let tuple = Tuple::ints(&[k]);
            k += 1;
            ctx.reset(TreeOp::Insert);
            let key = tree.discipline().leaf_bound(&tuple).unwrap();
            let leaf = tree.find_leaf(&mut ctx, &key).unwrap();
            ctx.path.pop();
            tree.insert_into_page(&mut ctx, leaf, &tuple.encode(), &key).unwrap();
            tree.entries.fetch_add(1, Ordering::AcqRel);
            if let Some(split) = ctx.split.clone() {
                ctx.path.clear();
                ctx.path.push(PageId::new(999), 0, None);
                let err = tree.propagate_splits(&mut ctx).unwrap_err();
                assert!(matches!(err, Error::PageNotFound { .. }));
                break split;
            }
        };
        assert_eq!(tree.pending_splits.lock().len(), 1);
        {
            let guard = tree.pin_read(split.left).unwrap();
            assert!(NodeFrame::new(&guard[..]).follows_right());
        }
        // The right link keeps the moved tuples reachable
        let expected: Vec<i64> = (0..8).chain(100..k).collect();
        assert_eq!(keys(&tree), expected);

        // The next operation posts the split before descending
        tree.insert(&mut ctx, &Tuple::ints(&[k])).unwrap();
        assert!(tree.pending_splits.lock().is_empty());
        assert_eq!(tree.stats().deferred_splits.load(Ordering::Relaxed), 1);
        {
            let guard = tree.pin_read(split.left).unwrap();
            assert!(!NodeFrame::new(&guard[..]).follows_right());
        }
        let shape = tree.check_structure().unwrap();
        assert_eq!(shape.entries, expected.len() + 1);
        assert_eq!(tree.entry_count(), u64::try_from(shape.entries).unwrap());
    }

    #[test]
    fn test_descent_retries_are_bounded() {
        let options = TreeOptions {
            max_entries_per_page: Some(4),
            max_descent_retries: 8,
            ..TreeOptions::default()
        };
        let tree = tree_with_options(Arc::new(OrderedDiscipline::new(1, false)), 4096, options);
        let mut ctx = OpContext::new();
        for k in 0..8 {
            tree.insert(&mut ctx, &Tuple::ints(&[k])).unwrap();
        }
        let leftmost = {
            let root = tree.pin_read(PageId::ROOT).unwrap();
            tree.children(&NodeFrame::new(&root[..])).unwrap()[0].1
        };

        // A split flag nobody will ever clear
        {
            let mut guard = tree.cache.pin_write(tree.file, leftmost).unwrap();
            NodeFrame::new(&mut guard[..]).set_follows_right(true);
        }
        let err = tree.insert(&mut ctx, &Tuple::ints(&[-1])).unwrap_err();
        assert!(matches!(err, Error::RetriesExhausted { attempts: 9 }));
        assert_eq!(tree.stats().descent_retries.load(Ordering::Relaxed), 9);
        assert_eq!(tree.entry_count(), 8);

        {
            let mut guard = tree.cache.pin_write(tree.file, leftmost).unwrap();
            NodeFrame::new(&mut guard[..]).set_follows_right(false);
        }
        tree.insert(&mut ctx, &Tuple::ints(&[-1])).unwrap();
        assert_eq!(keys(&tree), (-1..8).collect::<Vec<_>>());
    }

    #[test]
    fn test_unique_ordered_rejects_duplicates() {
        let tree = memory_tree(Arc::new(OrderedDiscipline::new(1, true)), 4096, Some(4));
        let mut ctx = OpContext::new();
        for k in 0..20 {
            tree.insert(&mut ctx, &Tuple::ints(&[k, 0])).unwrap();
        }
        let err = tree.insert(&mut ctx, &Tuple::ints(&[7, 1])).unwrap_err();
        assert!(matches!(err, Error::DuplicateKey(_)));
        assert_eq!(tree.entry_count(), 20);
    }

    #[test]
    fn test_oversized_tuple_rejected() {
        let tree = memory_tree(Arc::new(OrderedDiscipline::new(1, false)), 512, None);
        let mut ctx = OpContext::new();
        let tuple = Tuple::new(vec![Field::Int(1), Field::Bytes(vec![0; 400])]);
        let err = tree.insert(&mut ctx, &tuple).unwrap_err();
        assert!(matches!(err, Error::TupleTooLarge { .. }));
        assert_eq!(tree.page_count().unwrap(), 1);
    }

    #[test]
    fn test_spatial_insert_and_window_query() {
        let tree = spatial_tree(Some(6));
        let mut ctx = OpContext::new();
        for i in 0..20 {
            for j in 0..20 {
                let (x, y) = (f64::from(i), f64::from(j));
                tree.insert(&mut ctx, &Tuple::rect(&[x, y], &[x + 0.5, y + 0.5], i64::from(i * 20 + j)))
                    .unwrap();
            }
        }
        tree.check_structure().unwrap();
        let hits = tree
            .scan(&SearchPredicate::rect(&[4.9, 4.9], &[7.1, 6.1]))
            .unwrap();
        // x in {5, 6, 7}, y in {5, 6}
        assert_eq!(hits.len(), 6);
        assert_eq!(tree.scan(&SearchPredicate::All).unwrap().len(), 400);
    }

    #[test]
    fn test_root_split_invalidates_pending_parent_update() {
        // Two contexts interleaved by hand: B descends, A grows the tree
        // by a level, then B splits its leaf and must rediscover the parent.
        let tree = ordered_tree(Some(4));
        let mut setup = OpContext::new();
        for k in [0, 10, 20, 30, 40, 50, 60, 70] {
            tree.insert(&mut setup, &Tuple::ints(&[k])).unwrap();
        }
        assert_eq!(tree.height().unwrap(), 2);

        let mut ctx_b = OpContext::new();
        ctx_b.reset(TreeOp::Insert);
        let key_b = tree.discipline().leaf_bound(&Tuple::ints(&[1])).unwrap();
        let leaf_b = tree.find_leaf(&mut ctx_b, &key_b).unwrap();
        let leaf_b_id = leaf_b.page_id();
        drop(leaf_b);
        assert_eq!(ctx_b.path.get(0).unwrap().page, PageId::ROOT);

        let mut ctx_a = OpContext::new();
        let mut k = 71;
        while tree.height().unwrap() == 2 {
            tree.insert(&mut ctx_a, &Tuple::ints(&[k])).unwrap();
            k += 1;
        }
        let rescans_before = tree.stats().full_rescans.load(Ordering::Relaxed);

        // Fill B's leaf so the next insert splits it
        for extra in [2, 3, 4, 5] {
            let leaf = tree.cache.pin_write(tree.file, leaf_b_id).unwrap();
            if NodeFrame::new(&leaf[..]).tuple_count() >= 4 {
                break;
            }
            drop(leaf);
            tree.insert(&mut ctx_a, &Tuple::ints(&[extra])).unwrap();
        }

        let tuple = Tuple::ints(&[1]);
        let leaf_b = tree.cache.pin_write(tree.file, leaf_b_id).unwrap();
        ctx_b.path.pop();
        tree.insert_into_page(&mut ctx_b, leaf_b, &tuple.encode(), &key_b).unwrap();
        assert!(ctx_b.split.is_some());
        tree.propagate_splits(&mut ctx_b).unwrap();

        assert!(tree.stats().full_rescans.load(Ordering::Relaxed) > rescans_before);
        tree.check_structure().unwrap();
        let found = tree.scan(&SearchPredicate::point(vec![Field::Int(1)])).unwrap();
        assert_eq!(found, vec![tuple]);
    }
}
