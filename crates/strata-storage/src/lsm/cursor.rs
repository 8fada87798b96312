//! Search cursor over all components of an index

use super::component::LsmComponent;
use super::harness::ReadSnapshot;
use super::tracker::OperationTracker;
use crate::tree::{SearchPredicate, TreeCursor};
use std::collections::HashSet;
use std::sync::Arc;
use strata_common::{OpType, Result, Tuple};

/// Streams the visible tuples matching a predicate, newest component first.
///
/// The cursor keeps every component of its snapshot entered as a reader
/// until it is dropped, so flushes and merges that complete in the
/// meantime do not change what it returns. A tuple is skipped when a newer
/// component already produced it or holds a tombstone for it.
pub struct LsmCursor {
    snapshot: ReadSnapshot,
    predicate: SearchPredicate,
    position: usize,
    current: Option<TreeCursor>,
    /// Tuples returned from components that older ones may repeat
    seen: HashSet<Tuple>,
    tracker: Arc<dyn OperationTracker>,
    done: bool,
}

impl LsmCursor {
    pub(crate) fn new(
        snapshot: ReadSnapshot,
        predicate: SearchPredicate,
        tracker: Arc<dyn OperationTracker>,
    ) -> Self {
        Self {
            snapshot,
            predicate,
            position: 0,
            current: None,
            seen: HashSet::new(),
            tracker,
            done: false,
        }
    }

    #[must_use]
    pub const fn predicate(&self) -> &SearchPredicate {
        &self.predicate
    }

    /// Components the cursor reads
    #[must_use]
    pub fn component_count(&self) -> usize {
        self.snapshot.components().len()
    }

    /// Next visible match, or `None` when every component is exhausted
    pub fn next_tuple(&mut self) -> Result<Option<Tuple>> {
        let components = self.snapshot.components();
        while let Some(component) = components.get(self.position) {
            let cursor = self
                .current
                .get_or_insert_with(|| TreeCursor::new(self.predicate.clone()));
            let Some(tuple) = cursor.next(component.tree())? else {
                self.position += 1;
                self.current = None;
                continue;
            };
            if self.seen.contains(&tuple) || deleted_by(&components[..self.position], &tuple)? {
                continue;
            }
            if self.position + 1 < components.len() {
                self.seen.insert(tuple.clone());
            }
            return Ok(Some(tuple));
        }
        Ok(None)
    }
}

fn deleted_by(newer: &[Arc<LsmComponent>], tuple: &Tuple) -> Result<bool> {
    for component in newer {
        if component.is_deleted(tuple)? {
            return Ok(true);
        }
    }
    Ok(false)
}

impl Iterator for LsmCursor {
    type Item = Result<Tuple>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.next_tuple() {
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

impl Drop for LsmCursor {
    fn drop(&mut self) {
        self.tracker.after_operation(OpType::Search, false);
    }
}

impl std::fmt::Debug for LsmCursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LsmCursor")
            .field("predicate", &self.predicate)
            .field("position", &self.position)
            .field("components", &self.component_count())
            .finish_non_exhaustive()
    }
}
