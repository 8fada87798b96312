//! Latch-coupled search
//!
//! A cursor holds at most one page latch, and only while it copies the
//! matching entries of that page out. Pages whose NSN is newer than the
//! parent snapshot they were reached from are followed to the right.

use super::TreeIndex;
use super::discipline::SearchPredicate;
use super::frame::NodeFrame;
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::Ordering;
use strata_common::{PageId, Result, Tuple};

/// Resumable position of a search in one tree
#[derive(Debug)]
pub struct TreeCursor {
    predicate: SearchPredicate,
    /// Pages still to visit, with the LSN of the parent they came from
    stack: Vec<(PageId, u64)>,
    visited: HashSet<PageId>,
    buffer: VecDeque<Tuple>,
}

impl TreeCursor {
    #[must_use]
    pub fn new(predicate: SearchPredicate) -> Self {
        Self {
            predicate,
            stack: vec![(PageId::ROOT, 0)],
            visited: HashSet::new(),
            buffer: VecDeque::new(),
        }
    }

    pub const fn predicate(&self) -> &SearchPredicate {
        &self.predicate
    }

    /// Next matching tuple, or `None` once the tree is exhausted
    pub fn next(&mut self, tree: &TreeIndex) -> Result<Option<Tuple>> {
        loop {
            if let Some(tuple) = self.buffer.pop_front() {
                return Ok(Some(tuple));
            }
            let Some((page, parent_lsn)) = self.stack.pop() else {
                return Ok(None);
            };
            if self.visited.insert(page) {
                self.visit(tree, page, parent_lsn)?;
            }
        }
    }

    fn visit(&mut self, tree: &TreeIndex, page: PageId, parent_lsn: u64) -> Result<()> {
        let guard = tree.pin_read(page)?;
        let node = NodeFrame::new(&guard[..]);
        if tree.moved_right(page, &node, parent_lsn)
            && let Some(right) = node.right_sibling()
        {
            tree.stats.sibling_walks.fetch_add(1, Ordering::Relaxed);
            self.stack.push((right, parent_lsn));
        }

        let discipline = tree.discipline();
        if node.is_leaf() {
            for slot in 0..node.tuple_count() {
                let tuple = node.tuple(slot)?;
                if matches!(self.predicate, SearchPredicate::All)
                    || self.predicate.admits(discipline, &discipline.leaf_bound(&tuple)?)
                {
                    self.buffer.push_back(tuple);
                }
            }
            return Ok(());
        }

        let lsn = node.lsn();
        // Reversed so the leftmost child is visited first
        for (bound, child) in tree.children(&node)?.into_iter().rev() {
            if self.predicate.admits(discipline, &bound) {
                self.stack.push((child, lsn));
            }
        }
        Ok(())
    }
}

/// Iterator over the matches of one predicate
#[derive(Debug)]
pub struct TreeSearch<'a> {
    tree: &'a TreeIndex,
    cursor: TreeCursor,
    done: bool,
}

impl Iterator for TreeSearch<'_> {
    type Item = Result<Tuple>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.cursor.next(self.tree) {
            Ok(Some(tuple)) => Some(Ok(tuple)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

impl TreeIndex {
    /// Lazily search the tree
    #[must_use]
    pub fn search(&self, predicate: SearchPredicate) -> TreeSearch<'_> {
        TreeSearch {
            tree: self,
            cursor: TreeCursor::new(predicate),
            done: false,
        }
    }

    /// Collect every match of `predicate`
    pub fn scan(&self, predicate: &SearchPredicate) -> Result<Vec<Tuple>> {
        self.search(predicate.clone()).collect()
    }

    /// Whether a tuple equal to `tuple` is stored
    pub fn contains(&self, tuple: &Tuple) -> Result<bool> {
        let predicate = SearchPredicate::Intersects(self.discipline.leaf_bound(tuple)?);
        for found in self.search(predicate) {
            if found? == *tuple {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::super::OpContext;
    use super::super::test_util::*;
    use super::*;
    use strata_common::Field;

    #[test]
    fn test_empty_tree_search() {
        let tree = spatial_tree(None);
        assert_eq!(tree.search(SearchPredicate::All).count(), 0);
    }

    #[test]
    fn test_range_search() {
        let tree = ordered_tree(Some(5));
        let mut ctx = OpContext::new();
        for k in (0..300).rev() {
            tree.insert(&mut ctx, &Tuple::ints(&[k % 100, k])).unwrap();
        }
        let hits = tree
            .scan(&SearchPredicate::range(vec![Field::Int(10)], vec![Field::Int(12)]))
            .unwrap();
        assert_eq!(hits.len(), 9);
        assert!(hits.iter().all(|t| (10..=12).contains(&t.field(0).unwrap().as_i64().unwrap())));
    }

    #[test]
    fn test_contains_matches_whole_tuple() {
        let tree = ordered_tree(Some(4));
        let mut ctx = OpContext::new();
        for k in 0..60 {
            tree.insert(&mut ctx, &Tuple::ints(&[k % 20, k])).unwrap();
        }
        assert!(tree.contains(&Tuple::ints(&[5, 45])).unwrap());
        assert!(!tree.contains(&Tuple::ints(&[5, 46])).unwrap());
        assert!(!tree.contains(&Tuple::ints(&[99, 99])).unwrap());
    }

    #[test]
    fn test_cursor_sees_entries_moved_by_split() {
        let tree = ordered_tree(Some(4));
        let mut ctx = OpContext::new();
        for k in 0..40 {
            tree.insert(&mut ctx, &Tuple::ints(&[k])).unwrap();
        }

        // Read the root, then split pages underneath the open cursor
        let mut cursor = TreeCursor::new(SearchPredicate::All);
        let first = cursor.next(&tree).unwrap().unwrap();
        for k in 40..200 {
            tree.insert(&mut ctx, &Tuple::ints(&[k])).unwrap();
        }
        let mut seen = vec![first];
        while let Some(tuple) = cursor.next(&tree).unwrap() {
            seen.push(tuple);
        }
        let mut keys: Vec<i64> = seen.iter().map(|t| t.field(0).unwrap().as_i64().unwrap()).collect();
        keys.sort_unstable();
        let before = keys.len();
        keys.dedup();
        assert_eq!(keys.len(), before, "no tuple is returned twice");
        // Everything present when the search started is found
        assert!((0..40).all(|k| keys.binary_search(&k).is_ok()));
    }
}
