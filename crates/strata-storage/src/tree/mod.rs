//! Concurrent paged tree
//!
//! One engine serves R-tree and B-tree-like indexes; the difference lives
//! in the [`KeyDiscipline`]. Concurrency follows a link-based protocol:
//!
//! ```text
//!            root (page 0, never moves)
//!           /                          \
//!      interior  ---- right link ---->  interior
//!      /     \                          /      \
//!   leaf ---> leaf ----------------> leaf ---> leaf
//! ```
//!
//! - every modification stamps the page LSN with the next value of a
//!   generation counter shared by all trees of an index;
//! - a split stamps the old page's NSN with the same value and links the
//!   new right sibling; a traversal that read the parent before the split
//!   sees `parent_lsn < nsn` and recovers through the right link;
//! - latches are taken one page at a time during descents and only ever
//!   waited for top-down, so the protocol cannot deadlock.

mod bulk;
mod context;
mod delete;
pub mod discipline;
pub mod frame;
mod insert;
mod parent;
mod search;

pub use bulk::TreeBulkLoader;
pub use context::{OpContext, TreeOp};
pub use discipline::{
    KeyBound, KeyDiscipline, OrderedDiscipline, SearchPredicate, SpatialDiscipline, SplitPlan,
    discipline_for,
};
pub use search::{TreeCursor, TreeSearch};

use crate::buffer::{BufferCache, PageReadGuard};
use context::SplitKey;
use discipline::{parse_interior, union_all};
use frame::NodeFrame;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use strata_common::{Error, FileId, PageId, Result, Tuple};

/// Source of LSN and NSN stamps; strictly increasing across threads
#[derive(Debug, Default)]
pub struct GenerationCounter(AtomicU64);

impl GenerationCounter {
    #[must_use]
    pub const fn new(start: u64) -> Self {
        Self(AtomicU64::new(start))
    }

    /// Draw the next stamp
    pub fn next(&self) -> u64 {
        self.0.fetch_add(1, Ordering::AcqRel) + 1
    }

    #[must_use]
    pub fn current(&self) -> u64 {
        self.0.load(Ordering::Acquire)
    }
}

/// Structural statistics of one tree
#[derive(Debug, Default)]
pub struct TreeStats {
    /// Non-root page splits
    pub splits: AtomicU64,
    /// Root splits (each grows the tree by one level)
    pub root_splits: AtomicU64,
    /// Parent updates that had to walk right siblings
    pub sibling_walks: AtomicU64,
    /// Parent updates that fell back to a breadth-first rescan
    pub full_rescans: AtomicU64,
    /// Descents that retried a parent's child choice after a split
    pub descent_retries: AtomicU64,
    /// Splits whose parent update failed and was completed later
    pub deferred_splits: AtomicU64,
}

/// Tuning knobs of one tree
#[derive(Clone, Debug)]
pub struct TreeOptions {
    /// Optional cap on entries per page
    pub max_entries_per_page: Option<usize>,
    /// Bound on parent re-location attempts
    pub max_structural_retries: usize,
    /// Bound on step-backs of one descent that keeps meeting a split not
    /// yet posted to its parent
    pub max_descent_retries: usize,
    /// Page fill fraction used by the bulk loader
    pub bulk_fill_factor: f64,
}

impl Default for TreeOptions {
    fn default() -> Self {
        Self {
            max_entries_per_page: None,
            max_structural_retries: 64,
            max_descent_retries: 1 << 18,
            bulk_fill_factor: 1.0,
        }
    }
}

/// Shape reported by [`TreeIndex::check_structure`]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TreeShape {
    pub height: usize,
    pub leaf_pages: usize,
    pub interior_pages: usize,
    pub entries: usize,
}

/// A tree stored in one page file of the buffer cache
pub struct TreeIndex {
    cache: Arc<BufferCache>,
    file: FileId,
    discipline: Arc<dyn KeyDiscipline>,
    generation: Arc<GenerationCounter>,
    options: TreeOptions,
    stats: TreeStats,
    entries: AtomicU64,
    /// Inserts between descent and completion; parent bounds are only
    /// tightened when no insert may have enlarged them
    inflight_inserts: AtomicUsize,
    /// Splits reachable only through a right link because posting them to
    /// the parent failed
    pending_splits: Mutex<Vec<SplitKey>>,
}

impl TreeIndex {
    /// Create an empty tree in an empty page file
    pub fn create(
        cache: Arc<BufferCache>,
        file: FileId,
        discipline: Arc<dyn KeyDiscipline>,
        generation: Arc<GenerationCounter>,
        options: TreeOptions,
    ) -> Result<Self> {
        if cache.page_count(file)? != 0 {
            return Err(Error::storage(format!("{file} already holds pages")));
        }
        let tree = Self::assemble(cache, file, discipline, generation, options, 0);
        tree.init_root()?;
        Ok(tree)
    }

    /// Attach to a tree previously written to `file`
    pub fn open(
        cache: Arc<BufferCache>,
        file: FileId,
        discipline: Arc<dyn KeyDiscipline>,
        generation: Arc<GenerationCounter>,
        options: TreeOptions,
        entries: u64,
    ) -> Result<Self> {
        if cache.page_count(file)? == 0 {
            return Err(Error::corruption(format!("{file} has no root page")));
        }
        Ok(Self::assemble(cache, file, discipline, generation, options, entries))
    }

    fn assemble(
        cache: Arc<BufferCache>,
        file: FileId,
        discipline: Arc<dyn KeyDiscipline>,
        generation: Arc<GenerationCounter>,
        options: TreeOptions,
        entries: u64,
    ) -> Self {
        Self {
            cache,
            file,
            discipline,
            generation,
            options,
            stats: TreeStats::default(),
            entries: AtomicU64::new(entries),
            inflight_inserts: AtomicUsize::new(0),
            pending_splits: Mutex::new(Vec::new()),
        }
    }

    fn init_root(&self) -> Result<()> {
        let mut root = self.cache.new_page(self.file)?;
        if root.page_id() != PageId::ROOT {
            return Err(Error::internal(format!(
                "root allocated at {} instead of {}",
                root.page_id(),
                PageId::ROOT
            )));
        }
        NodeFrame::new(&mut root[..]).init(0);
        Ok(())
    }

    /// Discard every page and start over with an empty root. The caller
    /// guarantees no operation is running on the tree.
    pub fn reset(&self) -> Result<()> {
        self.cache.reset_file(self.file)?;
        self.entries.store(0, Ordering::Release);
        self.pending_splits.lock().clear();
        self.init_root()
    }

    #[must_use]
    pub const fn file(&self) -> FileId {
        self.file
    }

    pub(crate) const fn cache(&self) -> &Arc<BufferCache> {
        &self.cache
    }

    #[must_use]
    pub fn discipline(&self) -> &dyn KeyDiscipline {
        self.discipline.as_ref()
    }

    #[must_use]
    pub const fn stats(&self) -> &TreeStats {
        &self.stats
    }

    #[must_use]
    pub fn generation(&self) -> &GenerationCounter {
        &self.generation
    }

    /// Live tuples in the tree
    #[must_use]
    pub fn entry_count(&self) -> u64 {
        self.entries.load(Ordering::Acquire)
    }

    pub fn page_count(&self) -> Result<u32> {
        self.cache.page_count(self.file)
    }

    /// Levels from the root down to the leaves
    pub fn height(&self) -> Result<usize> {
        let root = self.cache.pin_read(self.file, PageId::ROOT)?;
        Ok(usize::from(NodeFrame::new(&root[..]).level()) + 1)
    }

    fn bound_width(&self) -> usize {
        self.discipline.bound_width()
    }

    fn max_tuple_size(&self) -> usize {
        frame::max_tuple_size(self.cache.page_size())
    }

    fn check_tuple_size(&self, len: usize) -> Result<()> {
        let max = self.max_tuple_size();
        if len > max {
            return Err(Error::TupleTooLarge { size: len, max });
        }
        Ok(())
    }

    /// Bound of an entry on a page of `level`
    fn entry_bound(&self, level: u8, tuple: Tuple) -> Result<KeyBound> {
        if level == 0 {
            self.discipline.leaf_bound(&tuple)
        } else {
            parse_interior(tuple, self.bound_width()).map(|(bound, _)| bound)
        }
    }

    fn entry_bounds<B: AsRef<[u8]>>(&self, frame: &NodeFrame<B>) -> Result<Vec<KeyBound>> {
        let level = frame.level();
        (0..frame.tuple_count())
            .map(|slot| self.entry_bound(level, frame.tuple(slot)?))
            .collect()
    }

    fn children<B: AsRef<[u8]>>(&self, frame: &NodeFrame<B>) -> Result<Vec<(KeyBound, PageId)>> {
        (0..frame.tuple_count())
            .map(|slot| parse_interior(frame.tuple(slot)?, self.bound_width()))
            .collect()
    }

    /// Union of a page's entries
    fn node_bound<B: AsRef<[u8]>>(&self, frame: &NodeFrame<B>) -> Result<Option<KeyBound>> {
        let bounds = self.entry_bounds(frame)?;
        Ok(union_all(self.discipline.as_ref(), bounds.iter()))
    }

    fn child_field(&self) -> usize {
        2 * self.bound_width()
    }

    /// Whether a page reached from a parent read at `parent_lsn` may have
    /// lost entries to a right sibling the parent snapshot does not show
    fn moved_right<B: AsRef<[u8]>>(&self, page: PageId, frame: &NodeFrame<B>, parent_lsn: u64) -> bool {
        page != PageId::ROOT && (parent_lsn < frame.nsn() || frame.follows_right())
    }

    fn pin_read(&self, page: PageId) -> Result<PageReadGuard> {
        self.cache.pin_read(self.file, page)
    }

    /// Walk the whole tree and verify that every interior entry covers the
    /// contents of its child. Intended for quiescent trees.
    pub fn check_structure(&self) -> Result<TreeShape> {
        let mut shape = TreeShape::default();
        let root_level = {
            let root = self.pin_read(PageId::ROOT)?;
            NodeFrame::new(&root[..]).level()
        };
        shape.height = usize::from(root_level) + 1;

        let mut stack = vec![(PageId::ROOT, root_level, None::<KeyBound>)];
        while let Some((page, expected_level, parent_bound)) = stack.pop() {
            let guard = self.pin_read(page)?;
            let frame = NodeFrame::new(&guard[..]);
            if frame.level() != expected_level {
                return Err(Error::corruption(format!(
                    "page {page} at level {} where {expected_level} was expected",
                    frame.level()
                )));
            }
            if let (Some(parent_bound), Some(bound)) = (&parent_bound, self.node_bound(&frame)?)
                && !self.discipline.covers(parent_bound, &bound)
            {
                return Err(Error::corruption(format!(
                    "parent entry of page {page} does not cover its contents"
                )));
            }
            if frame.is_leaf() {
                shape.leaf_pages += 1;
                shape.entries += frame.tuple_count();
            } else {
                shape.interior_pages += 1;
                for (bound, child) in self.children(&frame)? {
                    stack.push((child, expected_level - 1, Some(bound)));
                }
            }
        }
        Ok(shape)
    }
}

impl std::fmt::Debug for TreeIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TreeIndex")
            .field("file", &self.file)
            .field("discipline", &self.discipline)
            .field("entries", &self.entry_count())
            .finish_non_exhaustive()
    }
}
