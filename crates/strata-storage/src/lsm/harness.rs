//! Component list management: write routing, rotation, flush and merge
//!
//! The list is an immutable snapshot replaced wholesale under the list
//! lock. Its head is the one mutable memory component; memory components
//! waiting for their flush follow, then disk components, newest first.
//!
//! ```text
//!   [ M3 (mutable) | M2 (frozen) | D7 | D5 | D2 ]
//!          ^ writers    flush: M2 -> D8 in place
//!                                 merge: D7,D5 -> D9 in place
//! ```

use super::component::{ComponentKind, LsmComponent, TreeFactory, component_paths};
use super::manifest::{MANIFEST_FILE, Manifest, ManifestEntry};
use super::policy::{FlushPolicy, MergeCandidate, MergePolicy};
use super::scheduler::Scheduler;
use super::state::ComponentState;
use super::tracker::{BackgroundTask, OperationTracker};
use crate::buffer::BufferCache;
use crate::tree::{GenerationCounter, OpContext, SearchPredicate, TreeOptions, discipline_for};
use parking_lot::{Mutex, RwLock};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use strata_common::{ComponentId, Error, IndexConfig, KeyConfig, OpType, Result, Tuple};
use tracing::{debug, error, info, warn};

/// A list entry: the component and the incarnation it was installed with
#[derive(Clone, Debug)]
pub(crate) struct ComponentRef {
    pub component: Arc<LsmComponent>,
    pub incarnation: u64,
}

impl ComponentRef {
    fn new(component: Arc<LsmComponent>) -> Self {
        Self {
            incarnation: component.incarnation(),
            component,
        }
    }

    fn is(&self, other: &Arc<LsmComponent>) -> bool {
        Arc::ptr_eq(&self.component, other)
    }
}

/// Components entered as a reader; left again on drop
#[derive(Debug, Default)]
pub(crate) struct ReadSnapshot {
    components: Vec<Arc<LsmComponent>>,
}

impl ReadSnapshot {
    /// Entered components, newest first
    pub fn components(&self) -> &[Arc<LsmComponent>] {
        &self.components
    }
}

impl Drop for ReadSnapshot {
    fn drop(&mut self) {
        for component in self.components.drain(..) {
            if let Err(e) = component.exit(OpType::Search, true, false) {
                warn!(component = %component.id(), error = %e, "failed to retire component after its last reader");
            }
        }
    }
}

/// Counters of the harness
#[derive(Debug, Default)]
pub struct HarnessStats {
    pub flushes: AtomicU64,
    pub failed_flushes: AtomicU64,
    pub merges: AtomicU64,
    pub failed_merges: AtomicU64,
    /// Mutable components installed at the head
    pub rotations: AtomicU64,
    /// Writes re-routed after finding the head unavailable
    pub write_retries: AtomicU64,
}

/// Pluggable decisions of an index
#[derive(Debug)]
pub struct IndexHooks {
    pub tracker: Arc<dyn OperationTracker>,
    pub flush_policy: Box<dyn FlushPolicy>,
    pub merge_policy: Box<dyn MergePolicy>,
}

impl IndexHooks {
    /// Default tracker plus the policies named in `config`
    #[must_use]
    pub fn from_config(config: &IndexConfig) -> Self {
        Self {
            tracker: Arc::new(super::tracker::PolicyOperationTracker::new()),
            flush_policy: super::policy::flush_policy_from_config(&config.memory.flush_policy),
            merge_policy: super::policy::merge_policy_from_config(&config.merge_policy),
        }
    }
}

pub(crate) struct LsmHarness {
    config: IndexConfig,
    dir: PathBuf,
    factory: TreeFactory,
    /// The list lock
    components: RwLock<Arc<Vec<ComponentRef>>>,
    /// Every memory component ever created; recycled ones are reused
    memory_pool: Mutex<Vec<Arc<LsmComponent>>>,
    next_id: AtomicU64,
    hooks: IndexHooks,
    flush_lock: Mutex<()>,
    merge_lock: Mutex<()>,
    scheduler: Mutex<Option<Scheduler>>,
    shut_down: AtomicBool,
    stats: HarnessStats,
}

impl LsmHarness {
    /// Open the index described by `config`, reloading its disk components
    pub fn open(config: IndexConfig, hooks: IndexHooks) -> Result<Arc<Self>> {
        config.validate()?;
        let dir = config.index_dir();
        std::fs::create_dir_all(&dir)
            .map_err(|e| Error::storage(format!("failed to create {}: {e}", dir.display())))?;

        let factory = TreeFactory {
            cache: Arc::new(BufferCache::new(config.page_size, config.cache.capacity_pages)),
            discipline: discipline_for(&config.key),
            relaxed: discipline_for(&relaxed_key(&config.key)),
            generation: Arc::new(GenerationCounter::default()),
            options: TreeOptions {
                max_entries_per_page: config.max_entries_per_page,
                max_structural_retries: config.max_structural_retries,
                max_descent_retries: config.max_descent_retries,
                bulk_fill_factor: config.bulk_fill_factor,
            },
        };

        let manifest = Manifest::load(&dir)?.unwrap_or_default();
        let disks = manifest
            .components
            .iter()
            .map(|entry| {
                LsmComponent::open_disk(entry.id, &dir, entry.entries, entry.tombstones, &factory)
                    .map(Arc::new)
            })
            .collect::<Result<Vec<_>>>()?;
        remove_orphans(&dir, &manifest);

        let next_id = AtomicU64::new(manifest.next_component_id.max(1));
        let pool = (0..config.memory.component_count)
            .map(|_| {
                let id = ComponentId::new(next_id.fetch_add(1, Ordering::AcqRel));
                LsmComponent::memory(id, &factory).map(Arc::new)
            })
            .collect::<Result<Vec<_>>>()?;

        let mutable = pool
            .first()
            .cloned()
            .ok_or_else(|| Error::configuration("at least one memory component is required"))?;
        let mut list = Vec::with_capacity(disks.len() + 1);
        list.push(ComponentRef::new(mutable));
        list.extend(disks.into_iter().map(ComponentRef::new));

        info!(
            index = %config.name,
            dir = %dir.display(),
            disk_components = list.len() - 1,
            "opened LSM index"
        );
        let background_io = config.background_io;
        let harness = Arc::new(Self {
            config,
            dir,
            factory,
            components: RwLock::new(Arc::new(list)),
            memory_pool: Mutex::new(pool),
            next_id,
            hooks,
            flush_lock: Mutex::new(()),
            merge_lock: Mutex::new(()),
            scheduler: Mutex::new(None),
            shut_down: AtomicBool::new(false),
            stats: HarnessStats::default(),
        });
        if background_io {
            let scheduler = Scheduler::start(Arc::downgrade(&harness), &harness.config.name)?;
            *harness.scheduler.lock() = Some(scheduler);
        }
        Ok(harness)
    }

    pub const fn config(&self) -> &IndexConfig {
        &self.config
    }

    pub const fn stats(&self) -> &HarnessStats {
        &self.stats
    }

    pub fn cache(&self) -> &BufferCache {
        &self.factory.cache
    }

    pub fn generation(&self) -> u64 {
        self.factory.generation.current()
    }

    pub fn tracker(&self) -> &Arc<dyn OperationTracker> {
        &self.hooks.tracker
    }

    /// Current component list
    pub fn list(&self) -> Arc<Vec<ComponentRef>> {
        Arc::clone(&self.components.read())
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    fn check_open(&self) -> Result<()> {
        if self.is_shut_down() {
            return Err(Error::ShutDown);
        }
        Ok(())
    }

    fn retry_budget(&self) -> usize {
        self.config.max_structural_retries
    }

    fn allocate_id(&self) -> ComponentId {
        ComponentId::new(self.next_id.fetch_add(1, Ordering::AcqRel))
    }

    fn is_full(&self, component: &LsmComponent) -> bool {
        component
            .stats()
            .is_ok_and(|stats| self.hooks.flush_policy.is_full(&stats))
    }

    /// Enter every listed component as a reader. A component that became
    /// unreadable between the snapshot and the entry means the list moved
    /// on; the snapshot is retaken.
    pub fn read_snapshot(&self) -> Result<ReadSnapshot> {
        let attempts = self.retry_budget();
        for _ in 0..attempts {
            let list = self.list();
            let mut snapshot = ReadSnapshot {
                components: Vec::with_capacity(list.len()),
            };
            let mut complete = true;
            for entry in list.iter() {
                match entry.component.enter(OpType::Search, Some(entry.incarnation)) {
                    Ok(()) => snapshot.components.push(Arc::clone(&entry.component)),
                    Err(e) if e.is_component_unavailable() => {
                        complete = false;
                        break;
                    }
                    Err(e) => return Err(e),
                }
            }
            if complete {
                return Ok(snapshot);
            }
        }
        Err(Error::RetriesExhausted { attempts })
    }

    /// Whether `tuple` is visible in `components` (newest first): the first
    /// component holding it or a tombstone for it decides
    pub fn tuple_visible(components: &[Arc<LsmComponent>], tuple: &Tuple) -> Result<bool> {
        for component in components {
            if component.contains(tuple)? {
                return Ok(true);
            }
            if component.is_deleted(tuple)? {
                return Ok(false);
            }
        }
        Ok(false)
    }

    /// Whether any visible tuple shares `tuple`'s key
    fn key_visible(&self, components: &[Arc<LsmComponent>], tuple: &Tuple) -> Result<bool> {
        let discipline = &self.factory.discipline;
        let predicate = SearchPredicate::Intersects(discipline.leaf_bound(tuple)?);
        for component in components {
            for candidate in component.tree().search(predicate.clone()) {
                let candidate = candidate?;
                if discipline.compare_keys(&candidate, tuple).is_eq()
                    && Self::tuple_visible(components, &candidate)?
                {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    /// Enter the mutable component as a writer together with a read snapshot
    /// whose head is that component. An unavailable head is replaced and the
    /// write re-routed.
    fn enter_for_write(&self, op: OpType) -> Result<(ComponentRef, ReadSnapshot)> {
        let attempts = self.retry_budget();
        for _ in 0..attempts {
            self.check_open()?;
            let head = self.head()?;
            match head.component.enter(op, Some(head.incarnation)) {
                Ok(()) => {}
                Err(e) if e.is_component_unavailable() => {
                    self.stats.write_retries.fetch_add(1, Ordering::Relaxed);
                    self.rotate(&head)?;
                    continue;
                }
                Err(e) => return Err(e),
            }
            let snapshot = match self.read_snapshot() {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    head.component.exit(op, false, false)?;
                    return Err(e);
                }
            };
            if snapshot
                .components()
                .first()
                .is_some_and(|newest| head.is(newest))
            {
                return Ok((head, snapshot));
            }
            // Rotated underneath us
            drop(snapshot);
            head.component.exit(op, false, false)?;
            self.stats.write_retries.fetch_add(1, Ordering::Relaxed);
        }
        Err(Error::RetriesExhausted { attempts })
    }

    fn head(&self) -> Result<ComponentRef> {
        self.components
            .read()
            .first()
            .cloned()
            .ok_or_else(|| Error::internal("component list without a mutable component"))
    }

    /// Run a modification against the mutable component, then let the
    /// tracker decide on follow-up work
    fn modify(
        &self,
        op: OpType,
        apply: impl FnOnce(&LsmComponent, &[Arc<LsmComponent>]) -> Result<()>,
    ) -> Result<()> {
        self.hooks.tracker.before_operation(op);
        let mut full = false;
        let result = self.enter_for_write(op).and_then(|(head, snapshot)| {
            let outcome = apply(&head.component, snapshot.components());
            drop(snapshot);
            full = self.is_full(&head.component);
            head.component.exit(op, outcome.is_ok(), full)?;
            outcome
        });
        let tasks = self.hooks.tracker.after_operation(op, full);
        self.dispatch(tasks);
        result
    }

    pub fn insert(&self, ctx: &mut OpContext, tuple: &Tuple) -> Result<()> {
        self.factory.discipline.validate(tuple)?;
        self.modify(OpType::Modification, |head, visible| {
            let duplicate = if self.factory.discipline.is_unique() {
                self.key_visible(visible, tuple)?
            } else {
                Self::tuple_visible(visible, tuple)?
            };
            if duplicate {
                return Err(Error::DuplicateKey(tuple.to_string()));
            }
            if head.is_deleted(tuple)? {
                // The older copy becomes visible again
                return head.deleted().delete(ctx, tuple);
            }
            head.tree().insert(ctx, tuple)
        })
    }

    pub fn delete(&self, ctx: &mut OpContext, tuple: &Tuple) -> Result<()> {
        self.factory.discipline.validate(tuple)?;
        self.modify(OpType::ForceModification, |head, visible| {
            let older = &visible[1..];
            let in_head = head.contains(tuple)?;
            if in_head {
                head.tree().delete(ctx, tuple)?;
            }
            let hidden_older = !head.is_deleted(tuple)? && Self::tuple_visible(older, tuple)?;
            if hidden_older {
                head.deleted().insert(ctx, tuple)?;
            }
            if in_head || hidden_older {
                Ok(())
            } else {
                Err(Error::KeyNotFound(tuple.to_string()))
            }
        })
    }

    /// Install a fresh mutable component if `stale` still heads the list
    /// but no longer admits writers
    fn rotate(&self, stale: &ComponentRef) -> Result<()> {
        let mut list = self.components.write();
        let Some(head) = list.first() else {
            return Err(Error::internal("component list without a mutable component"));
        };
        if !head.is(&stale.component) || head.component.state() == ComponentState::ReadableWritable {
            return Ok(());
        }
        let fresh = self.take_memory_component(&list)?;
        let mut next = Vec::with_capacity(list.len() + 1);
        next.push(ComponentRef::new(Arc::clone(&fresh)));
        next.extend(list.iter().cloned());
        *list = Arc::new(next);
        self.stats.rotations.fetch_add(1, Ordering::Relaxed);
        debug!(
            index = %self.config.name,
            mutable = %fresh.id(),
            frozen = %stale.component.id(),
            "installed new mutable component"
        );
        Ok(())
    }

    /// A recycled memory component not in `list`, or a new one
    fn take_memory_component(&self, list: &[ComponentRef]) -> Result<Arc<LsmComponent>> {
        let mut pool = self.memory_pool.lock();
        let reusable = pool.iter().find(|candidate| {
            candidate.state() == ComponentState::ReadableWritable
                && !list.iter().any(|entry| entry.is(candidate))
        });
        if let Some(component) = reusable {
            return Ok(Arc::clone(component));
        }
        let component = Arc::new(LsmComponent::memory(self.allocate_id(), &self.factory)?);
        pool.push(Arc::clone(&component));
        debug!(index = %self.config.name, pool = pool.len(), "memory component pool grown");
        Ok(component)
    }

    /// Hand tasks to the background worker, or run them here
    pub fn dispatch(&self, tasks: Vec<BackgroundTask>) {
        for task in tasks {
            let scheduled = self
                .scheduler
                .lock()
                .as_ref()
                .is_some_and(|scheduler| scheduler.schedule(task));
            if !scheduled {
                self.run_task(task);
            }
        }
    }

    /// Run one background task and report it to the tracker
    pub fn run_task(&self, task: BackgroundTask) {
        let result = if self.is_shut_down() {
            Err(Error::ShutDown)
        } else {
            match task {
                BackgroundTask::Flush => self.flush_memory(false).map(|_| ()),
                BackgroundTask::Merge => self.merge().map(|_| ()),
            }
        };
        match &result {
            Err(Error::ShutDown) => debug!(%task, "task dropped during shutdown"),
            Err(e) => error!(index = %self.config.name, %task, error = %e, "background task failed"),
            Ok(()) => {}
        }
        let follow_up = self.hooks.tracker.complete_operation(task, result.is_ok());
        self.dispatch(follow_up);
    }

    /// Flush every memory component holding data, including the mutable one
    pub fn flush(&self) -> Result<usize> {
        self.check_open()?;
        self.flush_memory(true)
    }

    /// Flush frozen memory components oldest first, plus the mutable one
    /// when `include_mutable` is set or it stopped admitting writers.
    /// Returns the number of components flushed.
    fn flush_memory(&self, include_mutable: bool) -> Result<usize> {
        let _flush = self.flush_lock.lock();
        let list = self.list();
        let mut targets: Vec<ComponentRef> = list
            .iter()
            .filter(|entry| entry.component.kind() == ComponentKind::Memory)
            .cloned()
            .collect();
        if let Some(head) = targets.first() {
            let flush_head = head.component.state() != ComponentState::ReadableWritable
                || (include_mutable && !is_empty(&head.component));
            if !flush_head {
                targets.remove(0);
            }
        }

        let mut flushed = 0;
        for target in targets.iter().rev() {
            self.flush_component(target)?;
            flushed += 1;
        }
        Ok(flushed)
    }

    fn flush_component(&self, target: &ComponentRef) -> Result<()> {
        let memory = &target.component;
        memory.enter(OpType::Flush, Some(target.incarnation))?;
        self.hooks.tracker.before_operation(OpType::Flush);

        let outcome = self.rotate(target).and_then(|()| {
            let disk = self.build_flushed(memory)?;
            if let Err(e) = self.install(std::slice::from_ref(target), disk.as_ref()) {
                if let Some(disk) = &disk {
                    discard(disk);
                }
                return Err(e);
            }
            Ok(disk)
        });
        self.hooks.tracker.after_operation(OpType::Flush, false);

        match outcome {
            Ok(disk) => {
                self.stats.flushes.fetch_add(1, Ordering::Relaxed);
                match &disk {
                    Some(disk) => info!(
                        index = %self.config.name,
                        memory = %memory.id(),
                        disk = %disk.id(),
                        entries = disk.tree().entry_count(),
                        tombstones = disk.deleted().entry_count(),
                        "flushed memory component"
                    ),
                    None => debug!(memory = %memory.id(), "dropped empty memory component"),
                }
                if let Err(e) = memory.exit(OpType::Flush, true, true) {
                    warn!(component = %memory.id(), error = %e, "failed to reset flushed component");
                }
                Ok(())
            }
            Err(e) => {
                self.stats.failed_flushes.fetch_add(1, Ordering::Relaxed);
                warn!(index = %self.config.name, component = %memory.id(), error = %e, "flush failed");
                if let Err(exit) = memory.exit(OpType::Flush, false, self.is_full(memory)) {
                    warn!(component = %memory.id(), error = %exit, "failed to leave component after flush");
                }
                Err(e)
            }
        }
    }

    /// Write a memory component out as a disk component; `None` if empty
    fn build_flushed(&self, memory: &LsmComponent) -> Result<Option<Arc<LsmComponent>>> {
        if is_empty(memory) {
            return Ok(None);
        }
        let entries = memory.tree().scan(&SearchPredicate::All)?;
        let tombstones = memory.deleted().scan(&SearchPredicate::All)?;
        self.build_disk(entries, tombstones).map(Some)
    }

    /// Sort and bulk-load a new disk component
    fn build_disk(&self, mut entries: Vec<Tuple>, mut tombstones: Vec<Tuple>) -> Result<Arc<LsmComponent>> {
        let order = &self.factory.relaxed;
        for tuples in [&mut entries, &mut tombstones] {
            tuples.sort_by(|a, b| order.bulk_order(a, b));
            tuples.dedup();
        }

        let component = LsmComponent::create_disk(self.allocate_id(), &self.dir, &self.factory)?;
        let loaded = load_tree(component.tree(), entries)
            .and_then(|()| load_tree(component.deleted(), tombstones))
            .and_then(|()| component.persist());
        if let Err(e) = loaded {
            discard(&component);
            return Err(e);
        }
        Ok(Arc::new(component))
    }

    /// Replace the contiguous run `sources` with `replacement` (or drop it),
    /// persisting the manifest before the new list becomes visible
    fn install(&self, sources: &[ComponentRef], replacement: Option<&Arc<LsmComponent>>) -> Result<()> {
        let mut list = self.components.write();
        let first = sources
            .first()
            .ok_or_else(|| Error::internal("installing over an empty run"))?;
        let start = list
            .iter()
            .position(|entry| entry.is(&first.component))
            .ok_or_else(|| Error::internal(format!("component {} left the list", first.component.id())))?;
        let end = start + sources.len();
        let contiguous = start > 0
            && list.get(start..end).is_some_and(|run| {
                run.iter().zip(sources).all(|(entry, source)| entry.is(&source.component))
            });
        if !contiguous {
            return Err(Error::internal("sources are not a contiguous run of the component list"));
        }

        let mut next: Vec<ComponentRef> = Vec::with_capacity(list.len());
        next.extend_from_slice(&list[..start]);
        next.extend(replacement.map(|c| ComponentRef::new(Arc::clone(c))));
        next.extend_from_slice(&list[end..]);
        if replacement.is_some() || sources.iter().any(|s| s.component.kind() == ComponentKind::Disk) {
            self.write_manifest(&next)?;
        }
        *list = Arc::new(next);
        Ok(())
    }

    fn write_manifest(&self, list: &[ComponentRef]) -> Result<()> {
        Manifest {
            next_component_id: self.next_id.load(Ordering::Acquire),
            components: list
                .iter()
                .filter(|entry| entry.component.kind() == ComponentKind::Disk)
                .map(|entry| ManifestEntry {
                    id: entry.component.id(),
                    entries: entry.component.tree().entry_count(),
                    tombstones: entry.component.deleted().entry_count(),
                })
                .collect(),
        }
        .store(&self.dir)
    }

    /// Merge the run chosen by the merge policy
    pub fn merge(&self) -> Result<Option<ComponentId>> {
        self.check_open()?;
        let _merge = self.merge_lock.lock();
        let disks = disk_components(&self.list());
        let candidates = disks
            .iter()
            .map(|entry| {
                entry.component.stats().map(|stats| MergeCandidate {
                    id: entry.component.id(),
                    stats,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        let Some(range) = self.hooks.merge_policy.select_merge_candidates(&candidates) else {
            return Ok(None);
        };
        if range.len() < 2 || range.end > disks.len() {
            return Ok(None);
        }
        let includes_oldest = range.end == disks.len();
        self.merge_run(&disks[range], includes_oldest).map(Some)
    }

    /// Merge every disk component into one, dropping all tombstones
    pub fn force_merge(&self) -> Result<Option<ComponentId>> {
        self.check_open()?;
        let _merge = self.merge_lock.lock();
        let disks = disk_components(&self.list());
        let worthwhile = disks.len() >= 2
            || disks
                .first()
                .is_some_and(|only| only.component.deleted().entry_count() > 0);
        if !worthwhile {
            return Ok(None);
        }
        self.merge_run(&disks, true).map(Some)
    }

    fn merge_run(&self, inputs: &[ComponentRef], includes_oldest: bool) -> Result<ComponentId> {
        let mut entered = Vec::with_capacity(inputs.len());
        for input in inputs {
            if let Err(e) = input.component.enter(OpType::Merge, Some(input.incarnation)) {
                leave_merge(&entered, false);
                return Err(e);
            }
            entered.push(Arc::clone(&input.component));
        }
        self.hooks.tracker.before_operation(OpType::Merge);

        let outcome = self.build_merged(&entered, includes_oldest).and_then(|output| {
            match self.install(inputs, Some(&output)) {
                Ok(()) => Ok(output),
                Err(e) => {
                    discard(&output);
                    Err(e)
                }
            }
        });
        self.hooks.tracker.after_operation(OpType::Merge, false);

        match outcome {
            Ok(output) => {
                self.stats.merges.fetch_add(1, Ordering::Relaxed);
                info!(
                    index = %self.config.name,
                    inputs = ?entered.iter().map(|c| c.id()).collect::<Vec<_>>(),
                    output = %output.id(),
                    entries = output.tree().entry_count(),
                    tombstones = output.deleted().entry_count(),
                    "merged disk components"
                );
                leave_merge(&entered, true);
                Ok(output.id())
            }
            Err(e) => {
                self.stats.failed_merges.fetch_add(1, Ordering::Relaxed);
                warn!(index = %self.config.name, error = %e, "merge failed");
                leave_merge(&entered, false);
                Err(e)
            }
        }
    }

    /// Combine `inputs` (newest first). An entry shadowed by a newer input's
    /// entry or tombstone is dropped; tombstones survive unless the run
    /// reaches the oldest component.
    fn build_merged(&self, inputs: &[Arc<LsmComponent>], includes_oldest: bool) -> Result<Arc<LsmComponent>> {
        let mut entries = Vec::new();
        let mut tombstones = Vec::new();
        for (i, component) in inputs.iter().enumerate() {
            let newer = &inputs[..i];
            for tuple in component.tree().search(SearchPredicate::All) {
                let tuple = tuple?;
                if !shadowed(newer, &tuple)? {
                    entries.push(tuple);
                }
            }
            if !includes_oldest {
                tombstones.extend(component.deleted().scan(&SearchPredicate::All)?);
            }
        }
        self.build_disk(entries, tombstones)
    }

    /// Empty disk component for the index bulk loader
    pub fn create_bulk_component(&self) -> Result<LsmComponent> {
        self.check_open()?;
        self.ensure_empty()?;
        LsmComponent::create_disk(self.allocate_id(), &self.dir, &self.factory)
    }

    /// Unique-key discipline used to validate bulk input
    pub fn discipline(&self) -> &dyn crate::tree::KeyDiscipline {
        self.factory.discipline.as_ref()
    }

    /// Append a bulk-loaded component to an empty index
    pub fn install_bulk(&self, component: Arc<LsmComponent>) -> Result<()> {
        let mut list = self.components.write();
        if list.len() != 1 || list.first().is_none_or(|head| !is_empty(&head.component)) {
            return Err(Error::storage("bulk loading requires an empty index"));
        }
        let mut next = list.as_ref().clone();
        next.push(ComponentRef::new(Arc::clone(&component)));
        self.write_manifest(&next)?;
        *list = Arc::new(next);
        info!(
            index = %self.config.name,
            component = %component.id(),
            entries = component.tree().entry_count(),
            "installed bulk-loaded component"
        );
        Ok(())
    }

    fn ensure_empty(&self) -> Result<()> {
        let list = self.list();
        if list.len() != 1 || list.first().is_none_or(|head| !is_empty(&head.component)) {
            return Err(Error::storage("bulk loading requires an empty index"));
        }
        Ok(())
    }

    /// Stop background work and flush every memory component
    pub fn shutdown(&self) -> Result<()> {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let scheduler = self.scheduler.lock().take();
        if let Some(scheduler) = scheduler {
            scheduler.shutdown();
        }
        let flushed = self.flush_memory(true)?;
        info!(index = %self.config.name, flushed, "LSM index shut down");
        Ok(())
    }
}

impl std::fmt::Debug for LsmHarness {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LsmHarness")
            .field("index", &self.config.name)
            .field("components", &self.list().len())
            .finish_non_exhaustive()
    }
}

/// Key configuration without uniqueness, for tombstones and disk trees
fn relaxed_key(key: &KeyConfig) -> KeyConfig {
    match key {
        KeyConfig::Ordered { key_fields, .. } => KeyConfig::Ordered {
            key_fields: *key_fields,
            unique: false,
        },
        spatial @ KeyConfig::Spatial { .. } => spatial.clone(),
    }
}

fn is_empty(component: &LsmComponent) -> bool {
    component.tree().entry_count() == 0 && component.deleted().entry_count() == 0
}

fn disk_components(list: &[ComponentRef]) -> Vec<ComponentRef> {
    list.iter()
        .filter(|entry| entry.component.kind() == ComponentKind::Disk)
        .cloned()
        .collect()
}

/// Whether a newer component holds `tuple` or a tombstone for it
fn shadowed(newer: &[Arc<LsmComponent>], tuple: &Tuple) -> Result<bool> {
    for component in newer {
        if component.contains(tuple)? || component.is_deleted(tuple)? {
            return Ok(true);
        }
    }
    Ok(false)
}

fn load_tree(tree: &crate::tree::TreeIndex, tuples: Vec<Tuple>) -> Result<()> {
    let mut loader = tree.bulk_loader()?;
    for tuple in tuples {
        loader.add(tree, tuple)?;
    }
    loader.end(tree)
}

/// Remove a component that never made it into the list
fn discard(component: &LsmComponent) {
    if let Err(e) = component.destroy() {
        warn!(component = %component.id(), error = %e, "failed to remove abandoned component");
    }
}

fn leave_merge(components: &[Arc<LsmComponent>], success: bool) {
    for component in components {
        if let Err(e) = component.exit(OpType::Merge, success, false) {
            warn!(component = %component.id(), error = %e, "failed to leave merged component");
        }
    }
}

/// Delete component files the manifest does not reference
fn remove_orphans(dir: &Path, manifest: &Manifest) {
    let Ok(listing) = std::fs::read_dir(dir) else {
        return;
    };
    let live: Vec<PathBuf> = manifest
        .components
        .iter()
        .flat_map(|entry| {
            let (tree, deleted) = component_paths(dir, entry.id);
            [tree, deleted]
        })
        .collect();
    for path in listing.filter_map(|entry| entry.ok().map(|e| e.path())) {
        let name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
        let is_component = path
            .extension()
            .is_some_and(|ext| ext == "tree" || ext == "deleted")
            && name.starts_with('c');
        let is_temp = name == format!("{MANIFEST_FILE}.tmp");
        if (is_component && !live.contains(&path)) || is_temp {
            match std::fs::remove_file(&path) {
                Ok(()) => warn!(path = %path.display(), "removed orphaned file"),
                Err(e) => warn!(path = %path.display(), error = %e, "failed to remove orphaned file"),
            }
        }
    }
}
