//! Per-thread handle for operating on an index

use super::cursor::LsmCursor;
use super::harness::LsmHarness;
use crate::tree::{OpContext, SearchPredicate};
use std::sync::Arc;
use strata_common::{ComponentId, OpType, Result, Tuple};

/// Accessor of one LSM index. Owns the operation context of the tree
/// protocol, so it is meant for a single thread; open one per thread.
#[derive(Debug)]
pub struct LsmAccessor {
    harness: Arc<LsmHarness>,
    ctx: OpContext,
}

impl LsmAccessor {
    pub(crate) fn new(harness: Arc<LsmHarness>) -> Self {
        Self {
            harness,
            ctx: OpContext::new(),
        }
    }

    /// Insert into the mutable component.
    ///
    /// Fails with `DuplicateKey` when the tuple (or, for unique indexes, its
    /// key) is already visible.
    pub fn insert(&mut self, tuple: &Tuple) -> Result<()> {
        self.harness.insert(&mut self.ctx, tuple)
    }

    /// Delete a visible tuple, leaving a tombstone when an older component
    /// still holds it. Fails with `KeyNotFound` otherwise.
    pub fn delete(&mut self, tuple: &Tuple) -> Result<()> {
        self.harness.delete(&mut self.ctx, tuple)
    }

    /// Open a cursor over every component
    pub fn search(&self, predicate: SearchPredicate) -> Result<LsmCursor> {
        let tracker = Arc::clone(self.harness.tracker());
        tracker.before_operation(OpType::Search);
        match self.harness.read_snapshot() {
            Ok(snapshot) => Ok(LsmCursor::new(snapshot, predicate, tracker)),
            Err(e) => {
                tracker.after_operation(OpType::Search, false);
                Err(e)
            }
        }
    }

    /// Collect every visible match
    pub fn scan(&self, predicate: SearchPredicate) -> Result<Vec<Tuple>> {
        self.search(predicate)?.collect()
    }

    /// Merge the components chosen by the merge policy
    pub fn merge(&self) -> Result<Option<ComponentId>> {
        self.harness.merge()
    }

    /// Flush every memory component holding data; returns how many
    pub fn flush(&self) -> Result<usize> {
        self.harness.flush()
    }
}
