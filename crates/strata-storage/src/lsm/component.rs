//! LSM components: a tree, its deleted-keys tree and a lifecycle gate

use super::policy::ComponentStats;
use super::state::{ComponentGate, ComponentState};
use crate::buffer::BufferCache;
use crate::tree::{GenerationCounter, KeyDiscipline, TreeIndex, TreeOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use strata_common::{ComponentId, OpType, Result, Tuple};
use tracing::{debug, warn};

/// Where a component's pages live
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ComponentKind {
    /// Memory-resident; mutable until frozen, recycled after its flush
    Memory,
    /// Immutable, file-backed; destroyed after it is merged away
    Disk,
}

/// Everything needed to build the trees of a component
#[derive(Clone, Debug)]
pub(crate) struct TreeFactory {
    pub cache: Arc<BufferCache>,
    pub discipline: Arc<dyn KeyDiscipline>,
    /// Discipline without uniqueness, for tombstones and disk trees
    pub relaxed: Arc<dyn KeyDiscipline>,
    pub generation: Arc<GenerationCounter>,
    pub options: TreeOptions,
}

impl TreeFactory {
    fn create(&self, file: strata_common::FileId, discipline: &Arc<dyn KeyDiscipline>) -> Result<TreeIndex> {
        TreeIndex::create(
            Arc::clone(&self.cache),
            file,
            Arc::clone(discipline),
            Arc::clone(&self.generation),
            self.options.clone(),
        )
    }

    fn open(&self, file: strata_common::FileId, entries: u64) -> Result<TreeIndex> {
        TreeIndex::open(
            Arc::clone(&self.cache),
            file,
            Arc::clone(&self.relaxed),
            Arc::clone(&self.generation),
            self.options.clone(),
            entries,
        )
    }
}

/// Paths of a disk component's two page files
#[must_use]
pub fn component_paths(dir: &Path, id: ComponentId) -> (PathBuf, PathBuf) {
    (
        dir.join(format!("{id}.tree")),
        dir.join(format!("{id}.deleted")),
    )
}

/// One generation of an index
pub struct LsmComponent {
    id: ComponentId,
    kind: ComponentKind,
    tree: TreeIndex,
    deleted: TreeIndex,
    gate: ComponentGate,
}

impl LsmComponent {
    /// Fresh, writable memory component
    pub(crate) fn memory(id: ComponentId, factory: &TreeFactory) -> Result<Self> {
        let tree = factory.create(factory.cache.create_memory_file(), &factory.discipline)?;
        let deleted = factory.create(factory.cache.create_memory_file(), &factory.relaxed)?;
        Ok(Self {
            id,
            kind: ComponentKind::Memory,
            tree,
            deleted,
            gate: ComponentGate::new(ComponentState::ReadableWritable),
        })
    }

    /// Empty disk component with newly created files, to be bulk loaded
    pub(crate) fn create_disk(id: ComponentId, dir: &Path, factory: &TreeFactory) -> Result<Self> {
        let (tree_path, deleted_path) = component_paths(dir, id);
        let tree_file = factory.cache.create_file(&tree_path)?;
        let deleted_file = match factory.cache.create_file(&deleted_path) {
            Ok(file) => file,
            Err(e) => {
                if let Err(cleanup) = factory.cache.drop_file(tree_file, true) {
                    warn!(component = %id, error = %cleanup, "failed to remove partial component");
                }
                return Err(e);
            }
        };
        let component = Self::disk_with(
            id,
            factory.create(tree_file, &factory.relaxed),
            factory.create(deleted_file, &factory.relaxed),
        );
        if component.is_err() {
            for file in [tree_file, deleted_file] {
                if let Err(cleanup) = factory.cache.drop_file(file, true) {
                    warn!(component = %id, error = %cleanup, "failed to remove partial component");
                }
            }
        }
        component
    }

    /// Disk component written by an earlier run
    pub(crate) fn open_disk(
        id: ComponentId,
        dir: &Path,
        entries: u64,
        tombstones: u64,
        factory: &TreeFactory,
    ) -> Result<Self> {
        let (tree_path, deleted_path) = component_paths(dir, id);
        let tree_file = factory.cache.open_file(&tree_path)?;
        let deleted_file = factory.cache.open_file(&deleted_path)?;
        Self::disk_with(
            id,
            factory.open(tree_file, entries),
            factory.open(deleted_file, tombstones),
        )
    }

    fn disk_with(id: ComponentId, tree: Result<TreeIndex>, deleted: Result<TreeIndex>) -> Result<Self> {
        Ok(Self {
            id,
            kind: ComponentKind::Disk,
            tree: tree?,
            deleted: deleted?,
            gate: ComponentGate::new(ComponentState::ReadableUnwritable),
        })
    }

    #[must_use]
    pub const fn id(&self) -> ComponentId {
        self.id
    }

    #[must_use]
    pub const fn kind(&self) -> ComponentKind {
        self.kind
    }

    #[must_use]
    pub const fn tree(&self) -> &TreeIndex {
        &self.tree
    }

    /// Tombstones: tuples deleted from older components
    #[must_use]
    pub const fn deleted(&self) -> &TreeIndex {
        &self.deleted
    }

    pub fn state(&self) -> ComponentState {
        self.gate.state()
    }

    pub(crate) fn incarnation(&self) -> u64 {
        self.gate.incarnation()
    }

    pub fn stats(&self) -> Result<ComponentStats> {
        Ok(ComponentStats {
            pages: u64::from(self.tree.page_count()?) + u64::from(self.deleted.page_count()?),
            entries: self.tree.entry_count(),
            tombstones: self.deleted.entry_count(),
        })
    }

    /// Whether the tree holds a tuple equal to `tuple`
    pub fn contains(&self, tuple: &Tuple) -> Result<bool> {
        self.tree.contains(tuple)
    }

    /// Whether a tombstone for `tuple` is recorded here
    pub fn is_deleted(&self, tuple: &Tuple) -> Result<bool> {
        self.deleted.contains(tuple)
    }

    pub(crate) fn enter(&self, op: OpType, incarnation: Option<u64>) -> Result<()> {
        self.gate.enter(self.id, op, incarnation)
    }

    /// Leave after `op`; retires the component if the state machine says so
    pub(crate) fn exit(&self, op: OpType, success: bool, full: bool) -> Result<ComponentState> {
        let recyclable = self.kind == ComponentKind::Memory;
        self.gate.exit(op, success, full, recyclable, || self.retire())
    }

    fn retire(&self) -> Result<()> {
        match self.kind {
            ComponentKind::Memory => {
                self.tree.reset()?;
                self.deleted.reset()?;
                debug!(component = %self.id, "memory component reset for reuse");
                Ok(())
            }
            ComponentKind::Disk => self.destroy(),
        }
    }

    /// Drop the component's pages and delete its files
    pub(crate) fn destroy(&self) -> Result<()> {
        let cache = self.tree.cache();
        let delete = self.kind == ComponentKind::Disk;
        let tree = cache.drop_file(self.tree.file(), delete);
        let deleted = cache.drop_file(self.deleted.file(), delete);
        debug!(component = %self.id, "component destroyed");
        tree.and(deleted)
    }

    /// Write a disk component's pages back and sync its files
    pub(crate) fn persist(&self) -> Result<()> {
        let cache = self.tree.cache();
        cache.flush_file(self.tree.file())?;
        cache.flush_file(self.deleted.file())
    }
}

impl std::fmt::Debug for LsmComponent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LsmComponent")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("state", &self.state())
            .field("entries", &self.tree.entry_count())
            .field("tombstones", &self.deleted.entry_count())
            .finish()
    }
}
