//! Delete an exact tuple and tighten the bounds above it

use super::TreeIndex;
use super::context::{OpContext, TreeOp};
use super::discipline::KeyBound;
use super::frame::NodeFrame;
use crate::buffer::PageWriteGuard;
use std::collections::HashSet;
use std::sync::atomic::Ordering;
use strata_common::{Error, PageId, Result, Tuple};

fn find_image<B: AsRef<[u8]>>(node: &NodeFrame<B>, image: &[u8]) -> Result<Option<usize>> {
    for slot in 0..node.tuple_count() {
        if node.tuple_bytes(slot)? == image {
            return Ok(Some(slot));
        }
    }
    Ok(None)
}

impl TreeIndex {
    /// Remove one tuple equal to `tuple`; [`Error::KeyNotFound`] if absent
    pub fn delete(&self, ctx: &mut OpContext, tuple: &Tuple) -> Result<()> {
        self.discipline.validate(tuple)?;
        let key = self.discipline.leaf_bound(tuple)?;
        ctx.reset(TreeOp::Delete);
        self.repair_splits()?;

        let Some((mut leaf, slot)) = self.find_tuple_to_delete(ctx, tuple, &key)? else {
            return Err(Error::KeyNotFound(tuple.to_string()));
        };
        let leaf_id = leaf.page_id();
        let defined_bound = {
            let mut node = NodeFrame::new(&mut leaf[..]);
            node.delete(slot)?;
            node.set_lsn(self.generation.next());
            self.node_bound(&node)?
                .is_some_and(|rest| !self.discipline.covers(&rest, &key))
        };
        self.entries.fetch_sub(1, Ordering::AcqRel);
        // Ancestors are only latched after the leaf is released
        drop(leaf);
        ctx.path.pop();

        if leaf_id != PageId::ROOT && defined_bound {
            self.shrink_ancestors(ctx, leaf_id, 0)?;
        }
        Ok(())
    }

    /// Depth-first search over every subtree whose bound covers the key.
    /// Returns the write-latched leaf and slot, with `ctx.path` leading to
    /// the leaf.
    fn find_tuple_to_delete(
        &self,
        ctx: &mut OpContext,
        tuple: &Tuple,
        key: &KeyBound,
    ) -> Result<Option<(PageWriteGuard, usize)>> {
        let image = tuple.encode();
        ctx.traverse.clear();
        let root = ctx.traverse.push(PageId::ROOT, 0, None);
        let mut stack = vec![(root, 0u64)];
        let mut visited = HashSet::new();

        while let Some((index, parent_lsn)) = stack.pop() {
            let Some(entry) = ctx.traverse.get(index) else {
                continue;
            };
            if !visited.insert(entry.page) {
                continue;
            }
            let guard = self.pin_read(entry.page)?;
            let node = NodeFrame::new(&guard[..]);
            let lsn = node.lsn();
            ctx.traverse.set_lsn(index, lsn);

            if self.moved_right(entry.page, &node, parent_lsn)
                && let Some(right) = node.right_sibling()
            {
                let sibling = ctx.traverse.push(right, 0, entry.parent);
                stack.push((sibling, parent_lsn));
            }

            if !node.is_leaf() {
                for (bound, child) in self.children(&node)?.into_iter().rev() {
                    if self.discipline.covers(&bound, key) {
                        let next = ctx.traverse.push(child, 0, Some(index));
                        stack.push((next, lsn));
                    }
                }
                continue;
            }

            if find_image(&node, &image)?.is_none() {
                continue;
            }
            drop(guard);
            let leaf = self.cache.pin_write(self.file, entry.page)?;
            let found = {
                let node = NodeFrame::new(&leaf[..]);
                if node.is_leaf() {
                    find_image(&node, &image)?.map(|slot| (slot, node.lsn()))
                } else {
                    None
                }
            };
            match found {
                Some((slot, lsn)) => {
                    ctx.traverse.set_lsn(index, lsn);
                    self.fill_path(ctx, index);
                    return Ok(Some((leaf, slot)));
                }
                None => {
                    // Moved or removed between the latches: look again
                    drop(leaf);
                    visited.remove(&entry.page);
                    stack.push((index, parent_lsn));
                    ctx.retries += 1;
                    if ctx.retries > self.options.max_structural_retries {
                        return Err(Error::RetriesExhausted {
                            attempts: ctx.retries,
                        });
                    }
                }
            }
        }
        Ok(None)
    }

    /// Tighten parent entries bottom-up while each level's bound shrinks
    fn shrink_ancestors(
        &self,
        ctx: &mut OpContext,
        mut child: PageId,
        mut child_level: u8,
    ) -> Result<()> {
        while !ctx.path.is_empty() {
            let (mut parent, slot) = self.locate_parent(ctx, child, child_level)?;
            // An insert in flight may rely on the wider bound
            if self.inflight_inserts.load(Ordering::Acquire) > 0 {
                return Ok(());
            }
            if !self.tighten_child_bound(&mut parent, slot, child)? {
                return Ok(());
            }
            let parent_id = parent.page_id();
            let parent_level = NodeFrame::new(&parent[..]).level();
            drop(parent);
            ctx.path.pop();
            if parent_id == PageId::ROOT {
                break;
            }
            child = parent_id;
            child_level = parent_level;
        }
        Ok(())
    }
}
