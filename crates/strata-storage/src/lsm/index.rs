//! LSM index: the public entry point

use super::accessor::LsmAccessor;
use super::component::{ComponentKind, LsmComponent};
use super::harness::{IndexHooks, LsmHarness};
use super::state::ComponentState;
use crate::tree::TreeBulkLoader;
use std::cmp::Ordering as KeyOrdering;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use strata_common::{ComponentId, Error, IndexConfig, Result, Tuple};
use tracing::{error, warn};

/// Description of one component
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ComponentInfo {
    pub id: ComponentId,
    pub kind: ComponentKind,
    pub state: ComponentState,
    pub entries: u64,
    pub tombstones: u64,
    pub pages: u64,
}

/// Index statistics
#[derive(Clone, Debug)]
pub struct IndexStats {
    pub memory_components: usize,
    pub disk_components: usize,
    /// Entries over all components, shadowed ones included
    pub entries: u64,
    pub tombstones: u64,
    pub flushes: u64,
    pub failed_flushes: u64,
    pub merges: u64,
    pub failed_merges: u64,
    pub rotations: u64,
    pub write_retries: u64,
    /// Last LSN handed out
    pub generation: u64,
    pub cache_hit_ratio: f64,
}

/// An LSM secondary index
#[derive(Debug)]
pub struct LsmIndex {
    harness: Arc<LsmHarness>,
}

impl LsmIndex {
    /// Open (or create) the index described by `config`
    pub fn open(config: IndexConfig) -> Result<Self> {
        let hooks = IndexHooks::from_config(&config);
        Self::open_with(config, hooks)
    }

    /// Open with a custom tracker or custom policies
    pub fn open_with(config: IndexConfig, hooks: IndexHooks) -> Result<Self> {
        Ok(Self {
            harness: LsmHarness::open(config, hooks)?,
        })
    }

    #[must_use]
    pub fn config(&self) -> &IndexConfig {
        self.harness.config()
    }

    /// New accessor; open one per thread
    #[must_use]
    pub fn accessor(&self) -> LsmAccessor {
        LsmAccessor::new(Arc::clone(&self.harness))
    }

    /// Loader for the initial population of an empty index
    pub fn bulk_loader(&self) -> Result<LsmBulkLoader> {
        let component = self.harness.create_bulk_component()?;
        let loader = component.tree().bulk_loader()?;
        Ok(LsmBulkLoader {
            harness: Arc::clone(&self.harness),
            component: Some(component),
            loader: Some(loader),
            last: None,
        })
    }

    /// Flush every memory component holding data; returns how many
    pub fn flush(&self) -> Result<usize> {
        self.harness.flush()
    }

    /// Merge the components chosen by the merge policy
    pub fn merge(&self) -> Result<Option<ComponentId>> {
        self.harness.merge()
    }

    /// Merge every disk component into one
    pub fn force_merge(&self) -> Result<Option<ComponentId>> {
        self.harness.force_merge()
    }

    /// Components in list order, newest first
    pub fn components(&self) -> Vec<ComponentInfo> {
        self.harness
            .list()
            .iter()
            .map(|entry| {
                let component = &entry.component;
                ComponentInfo {
                    id: component.id(),
                    kind: component.kind(),
                    state: component.state(),
                    entries: component.tree().entry_count(),
                    tombstones: component.deleted().entry_count(),
                    pages: component.stats().map_or(0, |stats| stats.pages),
                }
            })
            .collect()
    }

    pub fn stats(&self) -> IndexStats {
        let components = self.components();
        let counters = self.harness.stats();
        let memory_components = components
            .iter()
            .filter(|c| c.kind == ComponentKind::Memory)
            .count();
        IndexStats {
            memory_components,
            disk_components: components.len() - memory_components,
            entries: components.iter().map(|c| c.entries).sum(),
            tombstones: components.iter().map(|c| c.tombstones).sum(),
            flushes: counters.flushes.load(Ordering::Relaxed),
            failed_flushes: counters.failed_flushes.load(Ordering::Relaxed),
            merges: counters.merges.load(Ordering::Relaxed),
            failed_merges: counters.failed_merges.load(Ordering::Relaxed),
            rotations: counters.rotations.load(Ordering::Relaxed),
            write_retries: counters.write_retries.load(Ordering::Relaxed),
            generation: self.harness.generation(),
            cache_hit_ratio: self.harness.cache().stats().hit_ratio(),
        }
    }

    /// Stop background work and flush memory components to disk.
    /// Operations issued afterwards fail with `ShutDown`.
    pub fn shutdown(&self) -> Result<()> {
        self.harness.shutdown()
    }
}

impl Drop for LsmIndex {
    fn drop(&mut self) {
        if let Err(e) = self.harness.shutdown() {
            error!(index = %self.harness.config().name, error = %e, "failed to shut down index");
        }
    }
}

/// Builds a disk component from sorted input and installs it into an
/// empty index. Dropping the loader without calling [`end`](Self::end)
/// discards what was loaded.
#[derive(Debug)]
pub struct LsmBulkLoader {
    harness: Arc<LsmHarness>,
    component: Option<LsmComponent>,
    loader: Option<TreeBulkLoader>,
    last: Option<Tuple>,
}

impl LsmBulkLoader {
    pub fn add(&mut self, tuple: Tuple) -> Result<()> {
        let (Some(component), Some(loader)) = (&self.component, &mut self.loader) else {
            return Err(Error::internal("bulk loader already finished"));
        };
        let discipline = self.harness.discipline();
        discipline.validate(&tuple)?;
        if discipline.is_unique()
            && let Some(last) = &self.last
            && discipline.compare_keys(last, &tuple) == KeyOrdering::Equal
        {
            return Err(Error::DuplicateKey(tuple.to_string()));
        }
        let remember = discipline.is_unique().then(|| tuple.clone());
        loader.add(component.tree(), tuple)?;
        self.last = remember;
        Ok(())
    }

    /// Tuples added so far
    #[must_use]
    pub fn count(&self) -> u64 {
        self.loader.as_ref().map_or(0, TreeBulkLoader::count)
    }

    /// Finish loading and make the component visible
    pub fn end(mut self) -> Result<ComponentId> {
        let (Some(component), Some(loader)) = (self.component.take(), self.loader.take()) else {
            return Err(Error::internal("bulk loader already finished"));
        };
        let finished = loader
            .end(component.tree())
            .and_then(|()| component.persist());
        let component = Arc::new(component);
        if let Err(e) = finished.and_then(|()| self.harness.install_bulk(Arc::clone(&component))) {
            if let Err(cleanup) = component.destroy() {
                warn!(component = %component.id(), error = %cleanup, "failed to remove bulk component");
            }
            return Err(e);
        }
        Ok(component.id())
    }
}

impl Drop for LsmBulkLoader {
    fn drop(&mut self) {
        if let Some(component) = self.component.take()
            && let Err(e) = component.destroy()
        {
            warn!(component = %component.id(), error = %e, "failed to remove abandoned bulk component");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::SearchPredicate;
    use std::collections::BTreeSet;
    use std::path::Path;
    use strata_common::{Field, FlushPolicyConfig, MemoryConfig, MergePolicyConfig};
    use tempfile::tempdir;

    fn config(dir: &Path) -> IndexConfig {
        IndexConfig {
            page_size: 1024,
            memory: MemoryConfig {
                component_count: 2,
                flush_policy: FlushPolicyConfig::Manual,
            },
            merge_policy: MergePolicyConfig::None,
            max_entries_per_page: Some(8),
            ..IndexConfig::ordered("test", dir, 1)
        }
    }

    fn keys(tuples: &[Tuple]) -> BTreeSet<i64> {
        tuples
            .iter()
            .map(|t| t.field(0).and_then(Field::as_i64).unwrap())
            .collect()
    }

    fn insert_all(accessor: &mut LsmAccessor, range: std::ops::Range<i64>) {
        for k in range {
            accessor.insert(&Tuple::ints(&[k])).unwrap();
        }
    }

    #[test]
    fn test_insert_search_delete() {
        let dir = tempdir().unwrap();
        let index = LsmIndex::open(config(dir.path())).unwrap();
        let mut accessor = index.accessor();
        insert_all(&mut accessor, 0..100);

        let hits = accessor
            .scan(SearchPredicate::range(vec![Field::Int(10)], vec![Field::Int(19)]))
            .unwrap();
        assert_eq!(keys(&hits), (10..20).collect());

        accessor.delete(&Tuple::ints(&[15])).unwrap();
        assert!(accessor.delete(&Tuple::ints(&[15])).unwrap_err().is_not_found());
        assert!(accessor.delete(&Tuple::ints(&[500])).unwrap_err().is_not_found());
        let all = accessor.scan(SearchPredicate::All).unwrap();
        assert_eq!(all.len(), 99);
        assert!(!keys(&all).contains(&15));
        // Deleting from the mutable component leaves no tombstone
        assert_eq!(index.stats().tombstones, 0);
    }

    #[test]
    fn test_duplicate_tuples_rejected() {
        let dir = tempdir().unwrap();
        let index = LsmIndex::open(config(dir.path())).unwrap();
        let mut accessor = index.accessor();
        accessor.insert(&Tuple::ints(&[1, 2])).unwrap();
        accessor.insert(&Tuple::ints(&[1, 3])).unwrap();
        index.flush().unwrap();
        let err = accessor.insert(&Tuple::ints(&[1, 2])).unwrap_err();
        assert!(matches!(err, Error::DuplicateKey(_)));
    }

    #[test]
    fn test_unique_index_checks_every_component() {
        let dir = tempdir().unwrap();
        let mut config = config(dir.path());
        config.key = strata_common::KeyConfig::Ordered {
            key_fields: 1,
            unique: true,
        };
        let index = LsmIndex::open(config).unwrap();
        let mut accessor = index.accessor();
        accessor.insert(&Tuple::ints(&[1, 10])).unwrap();
        index.flush().unwrap();

        let err = accessor.insert(&Tuple::ints(&[1, 11])).unwrap_err();
        assert!(matches!(err, Error::DuplicateKey(_)));

        accessor.delete(&Tuple::ints(&[1, 10])).unwrap();
        accessor.insert(&Tuple::ints(&[1, 11])).unwrap();
        let hits = accessor.scan(SearchPredicate::point(vec![Field::Int(1)])).unwrap();
        assert_eq!(hits, vec![Tuple::ints(&[1, 11])]);
    }

    #[test]
    fn test_flush_moves_data_to_disk() {
        let dir = tempdir().unwrap();
        let index = LsmIndex::open(config(dir.path())).unwrap();
        let mut accessor = index.accessor();
        insert_all(&mut accessor, 0..300);

        assert_eq!(index.flush().unwrap(), 1);
        assert_eq!(index.flush().unwrap(), 0, "nothing left to flush");
        let components = index.components();
        assert_eq!(components.len(), 2);
        assert_eq!(components[0].kind, ComponentKind::Memory);
        assert_eq!(components[0].entries, 0);
        assert_eq!(components[1].kind, ComponentKind::Disk);
        assert_eq!(components[1].entries, 300);
        assert_eq!(components[1].state, ComponentState::ReadableUnwritable);

        assert_eq!(keys(&accessor.scan(SearchPredicate::All).unwrap()), (0..300).collect());
        let (tree, deleted) = super::super::component_paths(&index.config().index_dir(), components[1].id);
        assert!(tree.exists() && deleted.exists());
    }

    #[test]
    fn test_tombstones_hide_older_components() {
        let dir = tempdir().unwrap();
        let index = LsmIndex::open(config(dir.path())).unwrap();
        let mut accessor = index.accessor();
        insert_all(&mut accessor, 0..50);
        index.flush().unwrap();

        accessor.delete(&Tuple::ints(&[7])).unwrap();
        assert_eq!(index.components()[0].tombstones, 1);
        assert!(!keys(&accessor.scan(SearchPredicate::All).unwrap()).contains(&7));

        // Re-inserting cancels the tombstone instead of adding a copy
        accessor.insert(&Tuple::ints(&[7])).unwrap();
        assert_eq!(index.components()[0].tombstones, 0);
        assert_eq!(index.components()[0].entries, 0);
        let hits = accessor.scan(SearchPredicate::point(vec![Field::Int(7)])).unwrap();
        assert_eq!(hits.len(), 1);

        // Tombstones survive a flush and keep hiding the older component
        accessor.delete(&Tuple::ints(&[8])).unwrap();
        index.flush().unwrap();
        let all = keys(&accessor.scan(SearchPredicate::All).unwrap());
        assert_eq!(all.len(), 49);
        assert!(!all.contains(&8));
    }

    #[test]
    fn test_merge_with_tombstones() {
        let dir = tempdir().unwrap();
        let index = LsmIndex::open(config(dir.path())).unwrap();
        let mut accessor = index.accessor();
        let t = |k: i64, payload: i64| Tuple::ints(&[k, payload]);

        // Three components with overlapping key ranges
        for k in 0..100 {
            accessor.insert(&t(k, 1)).unwrap();
        }
        index.flush().unwrap();
        for k in 50..150 {
            accessor.insert(&t(k, 2)).unwrap();
        }
        accessor.delete(&t(10, 1)).unwrap();
        index.flush().unwrap();
        for k in 100..200 {
            accessor.insert(&t(k, 3)).unwrap();
        }
        accessor.delete(&t(60, 1)).unwrap();
        accessor.insert(&t(10, 1)).unwrap();
        index.flush().unwrap();
        assert_eq!(index.stats().disk_components, 3);

        let before: BTreeSet<Tuple> = accessor.scan(SearchPredicate::All).unwrap().into_iter().collect();
        let merged = index.force_merge().unwrap().unwrap();

        let components = index.components();
        assert_eq!(components.len(), 2);
        assert_eq!(components[1].id, merged);
        assert_eq!(components[1].tombstones, 0, "merging the oldest component drops tombstones");
        assert_eq!(components[1].entries, 299);

        let after = accessor.scan(SearchPredicate::All).unwrap();
        assert_eq!(after.len(), 299, "every tuple exactly once");
        assert!(!after.contains(&t(60, 1)));
        assert!(after.contains(&t(10, 1)));
        assert_eq!(after.into_iter().collect::<BTreeSet<_>>(), before);
    }

    #[test]
    fn test_partial_merge_keeps_tombstones() {
        let dir = tempdir().unwrap();
        let mut config = config(dir.path());
        config.merge_policy = MergePolicyConfig::Prefix {
            max_mergable_pages: 100,
            max_tolerance_count: 1,
        };
        let index = LsmIndex::open(config).unwrap();
        let mut accessor = index.accessor();
        // A large, old component the prefix policy leaves alone
        insert_all(&mut accessor, 0..3000);
        index.flush().unwrap();
        accessor.delete(&Tuple::ints(&[5])).unwrap();
        insert_all(&mut accessor, 3000..3010);
        index.flush().unwrap();
        insert_all(&mut accessor, 3010..3020);
        index.flush().unwrap();

        let sizes: Vec<u64> = index.components().iter().map(|c| c.pages).collect();
        assert!(sizes[3] > sizes[1] + sizes[2]);
        index.merge().unwrap().unwrap();

        let components = index.components();
        assert_eq!(components.len(), 3);
        assert_eq!(components[1].tombstones, 1);
        let all = keys(&accessor.scan(SearchPredicate::All).unwrap());
        assert_eq!(all.len(), 3019);
        assert!(!all.contains(&5));
    }

    #[test]
    fn test_search_unaffected_by_flush_and_merge() {
        let dir = tempdir().unwrap();
        let index = LsmIndex::open(config(dir.path())).unwrap();
        let mut accessor = index.accessor();
        insert_all(&mut accessor, 0..50);
        index.flush().unwrap();
        insert_all(&mut accessor, 50..100);
        index.flush().unwrap();
        insert_all(&mut accessor, 100..150);
        let old_disks: Vec<ComponentId> = index.components()[1..].iter().map(|c| c.id).collect();

        let mut cursor = accessor.search(SearchPredicate::All).unwrap();
        let mut seen = vec![cursor.next().unwrap().unwrap()];

        index.flush().unwrap();
        index.force_merge().unwrap().unwrap();
        assert_eq!(index.stats().disk_components, 1);

        for tuple in &mut cursor {
            seen.push(tuple.unwrap());
        }
        assert_eq!(seen.len(), 150);
        assert_eq!(keys(&seen), (0..150).collect());

        // Merged inputs are destroyed once the cursor lets go of them
        let dir = index.config().index_dir();
        let (tree, _) = super::super::component_paths(&dir, old_disks[0]);
        assert!(tree.exists());
        drop(cursor);
        for id in old_disks {
            let (tree, deleted) = super::super::component_paths(&dir, id);
            assert!(!tree.exists() && !deleted.exists());
        }
    }

    #[test]
    fn test_policy_driven_flush_and_merge() {
        let dir = tempdir().unwrap();
        let mut config = config(dir.path());
        config.memory.flush_policy = FlushPolicyConfig::EntryBudget { max_entries: 50 };
        config.merge_policy = MergePolicyConfig::Constant { max_components: 3 };
        let index = LsmIndex::open(config).unwrap();
        let mut accessor = index.accessor();
        insert_all(&mut accessor, 0..500);

        let stats = index.stats();
        assert!(stats.flushes >= 9, "{stats:?}");
        assert!(stats.merges >= 1, "{stats:?}");
        assert!(stats.disk_components < 3, "{stats:?}");
        assert!(stats.rotations >= 9);
        assert_eq!(keys(&accessor.scan(SearchPredicate::All).unwrap()), (0..500).collect());
    }

    #[test]
    fn test_reopen_restores_disk_components() {
        let dir = tempdir().unwrap();
        {
            let index = LsmIndex::open(config(dir.path())).unwrap();
            let mut accessor = index.accessor();
            insert_all(&mut accessor, 0..200);
            index.flush().unwrap();
            accessor.delete(&Tuple::ints(&[3])).unwrap();
            insert_all(&mut accessor, 200..250);
            index.shutdown().unwrap();
            assert!(matches!(accessor.insert(&Tuple::ints(&[999])), Err(Error::ShutDown)));
        }

        let index = LsmIndex::open(config(dir.path())).unwrap();
        assert_eq!(index.stats().disk_components, 2);
        let accessor = index.accessor();
        let all = keys(&accessor.scan(SearchPredicate::All).unwrap());
        assert_eq!(all.len(), 249);
        assert!(!all.contains(&3));
    }

    #[test]
    fn test_open_removes_orphaned_files() {
        let dir = tempdir().unwrap();
        let config = config(dir.path());
        std::fs::create_dir_all(config.index_dir()).unwrap();
        let orphan = config.index_dir().join("c000042.tree");
        let temp = config.index_dir().join("MANIFEST.tmp");
        std::fs::write(&orphan, b"partial").unwrap();
        std::fs::write(&temp, b"partial").unwrap();

        let _index = LsmIndex::open(config).unwrap();
        assert!(!orphan.exists());
        assert!(!temp.exists());
    }

    #[test]
    fn test_failed_flush_leaves_sources_intact() {
        let dir = tempdir().unwrap();
        let index = LsmIndex::open(config(dir.path())).unwrap();
        let mut accessor = index.accessor();
        insert_all(&mut accessor, 0..100);

        let index_dir = index.config().index_dir();
        std::fs::remove_dir_all(&index_dir).unwrap();
        assert!(index.flush().is_err());

        let stats = index.stats();
        assert_eq!(stats.failed_flushes, 1);
        assert_eq!(stats.disk_components, 0);
        // Below the flush threshold the frozen component reverts to writable,
        // but writers only ever enter the head of the list
        let frozen = &index.components()[1];
        assert_eq!(frozen.state, ComponentState::ReadableWritable);
        assert_eq!(frozen.entries, 100);
        assert_eq!(keys(&accessor.scan(SearchPredicate::All).unwrap()), (0..100).collect());

        // Writes keep going to the new mutable component; the next flush retries
        insert_all(&mut accessor, 100..110);
        assert_eq!(index.components()[0].entries, 10);
        assert_eq!(index.components()[1].entries, 100);
        std::fs::create_dir_all(&index_dir).unwrap();
        assert_eq!(index.flush().unwrap(), 2);
        assert_eq!(index.stats().disk_components, 2);
        assert_eq!(keys(&accessor.scan(SearchPredicate::All).unwrap()), (0..110).collect());
    }

    #[test]
    fn test_bulk_loader() {
        let dir = tempdir().unwrap();
        let index = LsmIndex::open(config(dir.path())).unwrap();
        let mut loader = index.bulk_loader().unwrap();
        for k in 0..1000 {
            loader.add(Tuple::ints(&[k])).unwrap();
        }
        assert_eq!(loader.count(), 1000);
        let id = loader.end().unwrap();

        let components = index.components();
        assert_eq!(components.len(), 2);
        assert_eq!(components[1].id, id);
        assert_eq!(components[1].entries, 1000);
        let accessor = index.accessor();
        assert_eq!(accessor.scan(SearchPredicate::All).unwrap().len(), 1000);

        assert!(index.bulk_loader().is_err(), "index is no longer empty");
    }

    #[test]
    fn test_bulk_loader_rejects_bad_input() {
        let dir = tempdir().unwrap();
        let mut config = config(dir.path());
        config.key = strata_common::KeyConfig::Ordered {
            key_fields: 1,
            unique: true,
        };
        let index = LsmIndex::open(config).unwrap();

        let mut loader = index.bulk_loader().unwrap();
        loader.add(Tuple::ints(&[1, 1])).unwrap();
        assert!(matches!(loader.add(Tuple::ints(&[1, 2])), Err(Error::DuplicateKey(_))));
        assert!(loader.add(Tuple::ints(&[0, 1])).is_err());
        drop(loader);

        // The abandoned component left nothing behind
        assert_eq!(index.components().len(), 1);
        let files = std::fs::read_dir(index.config().index_dir())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().extension().is_some_and(|ext| ext == "tree"))
            .count();
        assert_eq!(files, 0);
    }

    #[test]
    fn test_spatial_index() {
        let dir = tempdir().unwrap();
        let config = IndexConfig {
            page_size: 1024,
            memory: MemoryConfig {
                component_count: 1,
                flush_policy: FlushPolicyConfig::Manual,
            },
            merge_policy: MergePolicyConfig::None,
            ..IndexConfig::spatial("shapes", dir.path(), 2)
        };
        let index = LsmIndex::open(config).unwrap();
        let mut accessor = index.accessor();
        for i in 0..20 {
            for j in 0..20 {
                let (x, y) = (f64::from(i), f64::from(j));
                accessor
                    .insert(&Tuple::rect(&[x, y], &[x + 0.5, y + 0.5], i64::from(i * 20 + j)))
                    .unwrap();
            }
            if i == 9 {
                index.flush().unwrap();
            }
        }
        accessor
            .delete(&Tuple::rect(&[3.0, 3.0], &[3.5, 3.5], 63))
            .unwrap();

        let window = SearchPredicate::rect(&[2.75, 2.75], &[4.25, 4.25]);
        // 2x2 cells intersect the window, minus the deleted one
        assert_eq!(accessor.scan(window.clone()).unwrap().len(), 3);
        index.force_merge().unwrap();
        assert_eq!(accessor.scan(window).unwrap().len(), 3);
        assert_eq!(accessor.scan(SearchPredicate::All).unwrap().len(), 399);
    }
}
