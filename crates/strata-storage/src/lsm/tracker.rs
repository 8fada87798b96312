//! Operation tracking and background task triggers

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use strata_common::OpType;

/// Work an operation asks the index to run after it completes
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BackgroundTask {
    Flush,
    Merge,
}

impl fmt::Display for BackgroundTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Flush => f.write_str("flush"),
            Self::Merge => f.write_str("merge"),
        }
    }
}

/// Hooks wrapped around every index operation
pub trait OperationTracker: Send + Sync + fmt::Debug {
    /// Called before the operation enters a component
    fn before_operation(&self, op: OpType);

    /// Called once the operation has left its component. `mutable_full`
    /// reports the flush policy's verdict on the mutable component.
    fn after_operation(&self, op: OpType, mutable_full: bool) -> Vec<BackgroundTask>;

    /// Called when a background task finished, whatever its outcome;
    /// returns follow-up work
    fn complete_operation(&self, task: BackgroundTask, success: bool) -> Vec<BackgroundTask>;

    /// Operations of kind `op` currently running
    fn active(&self, op: OpType) -> usize;
}

/// Default tracker: requests a flush when the mutable component fills up
/// and none is pending, and a merge after every successful flush
#[derive(Debug, Default)]
pub struct PolicyOperationTracker {
    active: [AtomicUsize; 5],
    flush_pending: AtomicBool,
    merge_pending: AtomicBool,
}

impl PolicyOperationTracker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Request a task unless one of the same kind is already pending
    fn request(&self, task: BackgroundTask) -> Option<BackgroundTask> {
        let pending = match task {
            BackgroundTask::Flush => &self.flush_pending,
            BackgroundTask::Merge => &self.merge_pending,
        };
        (!pending.swap(true, Ordering::AcqRel)).then_some(task)
    }

    pub fn is_pending(&self, task: BackgroundTask) -> bool {
        match task {
            BackgroundTask::Flush => self.flush_pending.load(Ordering::Acquire),
            BackgroundTask::Merge => self.merge_pending.load(Ordering::Acquire),
        }
    }
}

impl OperationTracker for PolicyOperationTracker {
    fn before_operation(&self, op: OpType) {
        self.active[op.index()].fetch_add(1, Ordering::AcqRel);
    }

    fn after_operation(&self, op: OpType, mutable_full: bool) -> Vec<BackgroundTask> {
        let _ = self.active[op.index()].fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
            n.checked_sub(1)
        });
        if op.is_writer() && mutable_full {
            return self.request(BackgroundTask::Flush).into_iter().collect();
        }
        Vec::new()
    }

    fn complete_operation(&self, task: BackgroundTask, success: bool) -> Vec<BackgroundTask> {
        match task {
            BackgroundTask::Flush => {
                self.flush_pending.store(false, Ordering::Release);
                if success {
                    return self.request(BackgroundTask::Merge).into_iter().collect();
                }
            }
            BackgroundTask::Merge => self.merge_pending.store(false, Ordering::Release),
        }
        Vec::new()
    }

    fn active(&self, op: OpType) -> usize {
        self.active[op.index()].load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flush_requested_once_while_pending() {
        let tracker = PolicyOperationTracker::new();
        tracker.before_operation(OpType::Modification);
        assert_eq!(tracker.active(OpType::Modification), 1);
        assert_eq!(
            tracker.after_operation(OpType::Modification, true),
            vec![BackgroundTask::Flush]
        );
        assert_eq!(tracker.active(OpType::Modification), 0);

        tracker.before_operation(OpType::Modification);
        assert!(tracker.after_operation(OpType::Modification, true).is_empty());
        assert!(tracker.is_pending(BackgroundTask::Flush));
    }

    #[test]
    fn test_searches_never_trigger_work() {
        let tracker = PolicyOperationTracker::new();
        tracker.before_operation(OpType::Search);
        assert!(tracker.after_operation(OpType::Search, true).is_empty());
    }

    #[test]
    fn test_merge_follows_successful_flush() {
        let tracker = PolicyOperationTracker::new();
        tracker.before_operation(OpType::Modification);
        tracker.after_operation(OpType::Modification, true);

        assert!(tracker.complete_operation(BackgroundTask::Flush, false).is_empty());
        assert!(!tracker.is_pending(BackgroundTask::Flush));

        tracker.before_operation(OpType::ForceModification);
        tracker.after_operation(OpType::ForceModification, true);
        assert_eq!(
            tracker.complete_operation(BackgroundTask::Flush, true),
            vec![BackgroundTask::Merge]
        );
        assert!(tracker.is_pending(BackgroundTask::Merge));
        assert!(tracker.complete_operation(BackgroundTask::Merge, true).is_empty());
        assert!(!tracker.is_pending(BackgroundTask::Merge));
    }
}
