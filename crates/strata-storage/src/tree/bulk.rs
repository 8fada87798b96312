//! Bottom-up bulk loading of an empty tree
//!
//! Tuples arrive in the discipline's bulk order and are packed into pages
//! left to right up to the fill factor; each finished page adds one entry
//! to the level above. The topmost node is written into the root page so
//! the root keeps page id 0. Bulk-built pages carry no sibling links and
//! zero LSN/NSN: nothing traverses them before loading ends.

use super::TreeIndex;
use super::discipline::{KeyBound, interior_tuple, union_all};
use super::frame::{self, NodeFrame};
use std::cmp::Ordering as KeyOrdering;
use std::sync::atomic::Ordering;
use strata_common::{Error, PageId, Result, Tuple};
use tracing::debug;

#[derive(Debug, Default)]
struct LevelBuffer {
    images: Vec<Vec<u8>>,
    bounds: Vec<KeyBound>,
    used: usize,
    pages_written: usize,
}

/// Loads sorted tuples into an empty tree
#[derive(Debug)]
pub struct TreeBulkLoader {
    levels: Vec<LevelBuffer>,
    last: Option<Tuple>,
    count: u64,
    budget: usize,
    capacity: usize,
    max_entries: usize,
}

impl TreeBulkLoader {
    pub fn new(tree: &TreeIndex) -> Result<Self> {
        if tree.page_count()? != 1 || tree.entry_count() != 0 {
            return Err(Error::storage(format!(
                "bulk loading requires an empty tree, {} is not",
                tree.file()
            )));
        }
        let capacity = frame::capacity(tree.cache.page_size());
        #[allow(
            clippy::cast_possible_truncation,
            clippy::cast_sign_loss,
            clippy::cast_precision_loss
        )]
        let budget = (capacity as f64 * tree.options.bulk_fill_factor.clamp(0.1, 1.0)) as usize;
        Ok(Self {
            levels: vec![LevelBuffer::default()],
            last: None,
            count: 0,
            budget,
            capacity,
            max_entries: tree.options.max_entries_per_page.unwrap_or(usize::MAX),
        })
    }

    /// Tuples added so far
    #[must_use]
    pub const fn count(&self) -> u64 {
        self.count
    }

    /// Append the next tuple; it must not sort before the previous one
    pub fn add(&mut self, tree: &TreeIndex, tuple: Tuple) -> Result<()> {
        let discipline = tree.discipline();
        discipline.validate(&tuple)?;
        let image = tuple.encode();
        tree.check_tuple_size(image.len())?;

        if discipline.is_ordered()
            && let Some(last) = &self.last
        {
            match discipline.bulk_order(last, &tuple) {
                KeyOrdering::Greater => {
                    return Err(Error::invalid_tuple(format!(
                        "bulk input out of order: {tuple} after {last}"
                    )));
                }
                _ if discipline.is_unique()
                    && discipline.compare_keys(last, &tuple) == KeyOrdering::Equal =>
                {
                    return Err(Error::DuplicateKey(tuple.to_string()));
                }
                _ => {}
            }
        }

        let bound = discipline.leaf_bound(&tuple)?;
        self.push(tree, 0, image, bound)?;
        self.count += 1;
        if discipline.is_ordered() {
            self.last = Some(tuple);
        }
        Ok(())
    }

    fn push(&mut self, tree: &TreeIndex, level: usize, image: Vec<u8>, bound: KeyBound) -> Result<()> {
        if self.levels.len() <= level {
            self.levels.push(LevelBuffer::default());
        }
        let size = frame::footprint(image.len());
        let buffer = &self.levels[level];
        let over_budget = buffer.used + size > self.budget && buffer.images.len() >= 2;
        let over_capacity = buffer.used + size > self.capacity;
        if !buffer.images.is_empty()
            && (over_budget || over_capacity || buffer.images.len() >= self.max_entries)
        {
            self.flush_level(tree, level)?;
        }
        let buffer = &mut self.levels[level];
        buffer.used += size;
        buffer.images.push(image);
        buffer.bounds.push(bound);
        Ok(())
    }

    /// Write the buffered entries of `level` to a fresh page and post its
    /// entry to the level above
    fn flush_level(&mut self, tree: &TreeIndex, level: usize) -> Result<()> {
        let buffer = std::mem::take(&mut self.levels[level]);
        let bound = union_all(tree.discipline(), buffer.bounds.iter())
            .ok_or_else(|| Error::internal("flushing an empty bulk level"))?;

        let mut page = tree.cache.new_page(tree.file)?;
        let page_id = page.page_id();
        write_node(&mut page[..], level, &buffer.images)?;
        drop(page);

        self.levels[level].pages_written = buffer.pages_written + 1;
        self.push(tree, level + 1, interior_tuple(&bound, page_id).encode(), bound)
    }

    /// Finish the lower levels and install the top node as the root
    pub fn end(mut self, tree: &TreeIndex) -> Result<()> {
        let mut level = 0;
        loop {
            let is_top = self.levels.len() == level + 1 && self.levels[level].pages_written == 0;
            if is_top {
                let mut root = tree.cache.pin_write(tree.file, PageId::ROOT)?;
                write_node(&mut root[..], level, &self.levels[level].images)?;
                break;
            }
            if !self.levels[level].images.is_empty() {
                self.flush_level(tree, level)?;
            }
            level += 1;
        }
        tree.entries.store(self.count, Ordering::Release);
        debug!(file = %tree.file(), entries = self.count, height = level + 1, "bulk load complete");
        Ok(())
    }
}

fn write_node(buf: &mut [u8], level: usize, images: &[Vec<u8>]) -> Result<()> {
    let level = u8::try_from(level).map_err(|_| Error::internal("bulk tree too tall"))?;
    let mut node = NodeFrame::new(buf);
    node.init(level);
    for image in images {
        node.append(image)?;
    }
    Ok(())
}

impl TreeIndex {
    /// Start bulk loading this (empty) tree
    pub fn bulk_loader(&self) -> Result<TreeBulkLoader> {
        TreeBulkLoader::new(self)
    }
}
