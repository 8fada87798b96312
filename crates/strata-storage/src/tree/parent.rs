//! Re-locating the parent of a page after the descent path went stale

use super::TreeIndex;
use super::context::OpContext;
use super::discipline::{interior_tuple, parse_interior};
use super::frame::NodeFrame;
use crate::buffer::PageWriteGuard;
use std::collections::HashSet;
use std::sync::atomic::Ordering;
use strata_common::{Error, PageId, Result};
use tracing::debug;

impl TreeIndex {
    /// Write-latch the parent of `child` and return it together with the
    /// slot of the entry pointing at the child.
    ///
    /// The last path entry is tried first. If its LSN moved on, the entry
    /// may have migrated to a right sibling; if the sibling chain does not
    /// hold it either (the root split in between), the path is rebuilt by a
    /// breadth-first rescan from the root.
    pub(super) fn locate_parent(
        &self,
        ctx: &mut OpContext,
        child: PageId,
        child_level: u8,
    ) -> Result<(PageWriteGuard, usize)> {
        let field = self.child_field();
        let parent_level = child_level + 1;
        for _ in 0..self.options.max_structural_retries {
            let Some(recorded) = ctx.path.last() else {
                self.rescan(ctx, child, child_level)?;
                continue;
            };

            let mut guard = self.cache.pin_write(self.file, recorded.page)?;
            let (lsn, slot) = {
                let node = NodeFrame::new(&guard[..]);
                (node.lsn(), node.find_child_slot(child, field)?)
            };
            if lsn == recorded.lsn
                && let Some(slot) = slot
            {
                return Ok((guard, slot));
            }

            self.stats.sibling_walks.fetch_add(1, Ordering::Relaxed);
            loop {
                let (level, slot, right) = {
                    let node = NodeFrame::new(&guard[..]);
                    (
                        node.level(),
                        node.find_child_slot(child, field)?,
                        node.right_sibling(),
                    )
                };
                if level == parent_level
                    && let Some(slot) = slot
                {
                    return Ok((guard, slot));
                }
                match right {
                    Some(next) if level == parent_level => {
                        drop(guard);
                        guard = self.cache.pin_write(self.file, next)?;
                    }
                    _ => break,
                }
            }
            drop(guard);
            self.rescan(ctx, child, child_level)?;
        }
        Err(Error::RetriesExhausted {
            attempts: self.options.max_structural_retries,
        })
    }

    fn rescan(&self, ctx: &mut OpContext, child: PageId, child_level: u8) -> Result<()> {
        self.stats.full_rescans.fetch_add(1, Ordering::Relaxed);
        debug!(file = %self.file, %child, level = child_level, "parent moved, rescanning from root");
        self.find_path(ctx, child, child_level)
    }

    /// Breadth-first search for the parent of `child`, leaving the path
    /// from the root to it in `ctx.path`
    fn find_path(&self, ctx: &mut OpContext, child: PageId, child_level: u8) -> Result<()> {
        if self.find_parent(ctx, child, child_level)? {
            return Ok(());
        }
        Err(Error::internal(format!(
            "page {child} is unreachable from the root of {}",
            self.file
        )))
    }

    /// Like [`Self::find_path`], but reports a child no interior entry
    /// points at yet (its split is reachable only through a right link)
    pub(super) fn find_parent(
        &self,
        ctx: &mut OpContext,
        child: PageId,
        child_level: u8,
    ) -> Result<bool> {
        let parent_level = child_level + 1;
        let field = self.child_field();
        ctx.path.clear();
        ctx.traverse.clear();
        ctx.traverse.push(PageId::ROOT, 0, None);

        let mut visited = HashSet::new();
        let mut current = 0;
        while let Some(entry) = ctx.traverse.get(current) {
            current += 1;
            if !visited.insert(entry.page) {
                continue;
            }
            let guard = self.pin_read(entry.page)?;
            let node = NodeFrame::new(&guard[..]);
            let index = current - 1;
            ctx.traverse.set_lsn(index, node.lsn());

            let parent_lsn = entry
                .parent
                .and_then(|p| ctx.traverse.get(p))
                .map_or(0, |p| p.lsn);
            if self.moved_right(entry.page, &node, parent_lsn)
                && let Some(right) = node.right_sibling()
            {
                ctx.traverse.push(right, 0, entry.parent);
            }

            if node.level() == parent_level {
                if node.find_child_slot(child, field)?.is_some() {
                    drop(guard);
                    self.fill_path(ctx, index);
                    return Ok(true);
                }
            } else if node.level() > parent_level {
                for (_, grandchild) in self.children(&node)? {
                    ctx.traverse.push(grandchild, 0, Some(index));
                }
            }
        }
        Ok(false)
    }

    /// Rebuild `ctx.path` from a traverse-list entry back to the root
    pub(super) fn fill_path(&self, ctx: &mut OpContext, index: usize) {
        let mut chain = Vec::new();
        let mut next = Some(index);
        while let Some(i) = next {
            let Some(entry) = ctx.traverse.get(i) else {
                break;
            };
            chain.push(entry);
            next = entry.parent;
        }
        ctx.path.clear();
        for entry in chain.into_iter().rev() {
            ctx.path.push(entry.page, entry.lsn, None);
        }
    }

    /// Recompute the bound of the entry at `slot` from the child's current
    /// contents. Returns whether the entry changed; a tighter entry that
    /// does not fit the page leaves the old, covering one in place.
    pub(super) fn tighten_child_bound(
        &self,
        parent: &mut PageWriteGuard,
        slot: usize,
        child: PageId,
    ) -> Result<bool> {
        let current = {
            let node = NodeFrame::new(&parent[..]);
            parse_interior(node.tuple(slot)?, self.bound_width())?.0
        };
        let tight = {
            let guard = self.pin_read(child)?;
            self.node_bound(&NodeFrame::new(&guard[..]))?
        };
        let Some(tight) = tight else {
            // Empty children keep their last bound
            return Ok(false);
        };
        if tight == current {
            return Ok(false);
        }
        let mut node = NodeFrame::new(&mut parent[..]);
        if !node.replace(slot, &interior_tuple(&tight, child).encode())? {
            return Ok(false);
        }
        node.set_lsn(self.generation.next());
        Ok(true)
    }
}
