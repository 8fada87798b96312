//! Flush and merge policies

use std::fmt;
use std::ops::Range;
use strata_common::{ComponentId, FlushPolicyConfig, MergePolicyConfig};

/// Size of one component as seen by the policies
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ComponentStats {
    /// Pages of the tree and the deleted-keys tree together
    pub pages: u64,
    pub entries: u64,
    pub tombstones: u64,
}

/// Fullness predicate of the mutable component
pub trait FlushPolicy: Send + Sync + fmt::Debug {
    fn is_full(&self, stats: &ComponentStats) -> bool;
}

/// Full once the component's trees occupy `max_pages`
#[derive(Debug)]
pub struct PageBudgetPolicy {
    pub max_pages: u64,
}

impl FlushPolicy for PageBudgetPolicy {
    fn is_full(&self, stats: &ComponentStats) -> bool {
        stats.pages >= self.max_pages
    }
}

/// Full once entries plus tombstones reach `max_entries`
#[derive(Debug)]
pub struct EntryBudgetPolicy {
    pub max_entries: u64,
}

impl FlushPolicy for EntryBudgetPolicy {
    fn is_full(&self, stats: &ComponentStats) -> bool {
        stats.entries + stats.tombstones >= self.max_entries
    }
}

/// Never full; flushes run only when requested
#[derive(Debug)]
pub struct ManualFlushPolicy;

impl FlushPolicy for ManualFlushPolicy {
    fn is_full(&self, _stats: &ComponentStats) -> bool {
        false
    }
}

#[must_use]
pub fn flush_policy_from_config(config: &FlushPolicyConfig) -> Box<dyn FlushPolicy> {
    match config {
        FlushPolicyConfig::PageBudget { max_pages } => Box::new(PageBudgetPolicy {
            max_pages: *max_pages as u64,
        }),
        FlushPolicyConfig::EntryBudget { max_entries } => Box::new(EntryBudgetPolicy {
            max_entries: *max_entries,
        }),
        FlushPolicyConfig::Manual => Box::new(ManualFlushPolicy),
    }
}

/// A disk component offered to a merge policy
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MergeCandidate {
    pub id: ComponentId,
    pub stats: ComponentStats,
}

/// Picks a contiguous run of disk components to merge
pub trait MergePolicy: Send + Sync + fmt::Debug {
    /// `components` are ordered newest first; the result indexes into it
    fn select_merge_candidates(&self, components: &[MergeCandidate]) -> Option<Range<usize>>;
}

/// Never merges on its own
#[derive(Debug)]
pub struct NoMergePolicy;

impl MergePolicy for NoMergePolicy {
    fn select_merge_candidates(&self, _components: &[MergeCandidate]) -> Option<Range<usize>> {
        None
    }
}

/// Merge everything once `max_components` disk components exist
#[derive(Debug)]
pub struct ConstantMergePolicy {
    pub max_components: usize,
}

impl MergePolicy for ConstantMergePolicy {
    fn select_merge_candidates(&self, components: &[MergeCandidate]) -> Option<Range<usize>> {
        (components.len() >= self.max_components.max(2)).then_some(0..components.len())
    }
}

/// Merge the newest components whose combined size stays under
/// `max_mergable_pages`, once more than `max_tolerance_count` of them pile up
#[derive(Debug)]
pub struct PrefixMergePolicy {
    pub max_mergable_pages: u64,
    pub max_tolerance_count: usize,
}

impl MergePolicy for PrefixMergePolicy {
    fn select_merge_candidates(&self, components: &[MergeCandidate]) -> Option<Range<usize>> {
        let mut total = 0;
        let mut run = 0;
        for candidate in components {
            if total + candidate.stats.pages > self.max_mergable_pages {
                break;
            }
            total += candidate.stats.pages;
            run += 1;
        }
        (run > self.max_tolerance_count && run >= 2).then_some(0..run)
    }
}

#[must_use]
pub fn merge_policy_from_config(config: &MergePolicyConfig) -> Box<dyn MergePolicy> {
    match config {
        MergePolicyConfig::None => Box::new(NoMergePolicy),
        MergePolicyConfig::Constant { max_components } => Box::new(ConstantMergePolicy {
            max_components: *max_components,
        }),
        MergePolicyConfig::Prefix {
            max_mergable_pages,
            max_tolerance_count,
        } => Box::new(PrefixMergePolicy {
            max_mergable_pages: *max_mergable_pages as u64,
            max_tolerance_count: *max_tolerance_count,
        }),
    }
}
