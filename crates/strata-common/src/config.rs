//! Configuration types for Strata
//!
//! An [`IndexConfig`] describes one LSM secondary index: its key
//! discipline, page geometry, memory budget and the flush and merge
//! policies that drive its component lifecycle.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Smallest page the node layout can hold a useful number of tuples in
pub const MIN_PAGE_SIZE: usize = 256;
/// Largest page addressable by the slot directory
pub const MAX_PAGE_SIZE: usize = 1 << 20;

/// Root configuration of one LSM index
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IndexConfig {
    /// Index name; disk components live in `data_dir/name`
    pub name: String,
    /// Directory holding every index of this process
    pub data_dir: PathBuf,
    /// Page size in bytes
    pub page_size: usize,
    /// Key discipline
    pub key: KeyConfig,
    /// Memory component configuration
    pub memory: MemoryConfig,
    /// Merge policy for disk components
    pub merge_policy: MergePolicyConfig,
    /// Buffer cache configuration
    pub cache: CacheConfig,
    /// Optional cap on entries per page, applied on top of the byte budget
    pub max_entries_per_page: Option<usize>,
    /// Fraction of a page filled by the bulk loader
    pub bulk_fill_factor: f64,
    /// Run flushes and merges on a background thread
    pub background_io: bool,
    /// Bound on parent re-location attempts during split propagation
    pub max_structural_retries: usize,
    /// Bound on the times one descent steps back to a parent while a
    /// concurrent split is being posted
    pub max_descent_retries: usize,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            name: "index".to_string(),
            data_dir: PathBuf::from("/var/lib/strata"),
            page_size: 4096,
            key: KeyConfig::default(),
            memory: MemoryConfig::default(),
            merge_policy: MergePolicyConfig::default(),
            cache: CacheConfig::default(),
            max_entries_per_page: None,
            bulk_fill_factor: 1.0,
            background_io: false,
            max_structural_retries: 64,
            max_descent_retries: 1 << 18,
        }
    }
}

impl IndexConfig {
    /// Spatial index over `dimensions`-dimensional boxes
    pub fn spatial(name: impl Into<String>, data_dir: impl Into<PathBuf>, dimensions: usize) -> Self {
        Self {
            name: name.into(),
            data_dir: data_dir.into(),
            key: KeyConfig::Spatial { dimensions },
            ..Self::default()
        }
    }

    /// Ordered index keyed on the first `key_fields` fields
    pub fn ordered(name: impl Into<String>, data_dir: impl Into<PathBuf>, key_fields: usize) -> Self {
        Self {
            name: name.into(),
            data_dir: data_dir.into(),
            key: KeyConfig::Ordered {
                key_fields,
                unique: false,
            },
            ..Self::default()
        }
    }

    /// Directory holding this index's component files
    #[must_use]
    pub fn index_dir(&self) -> PathBuf {
        self.data_dir.join(&self.name)
    }

    /// Check the configuration for values the storage layer cannot honour
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() || self.name.contains(['/', '\\']) {
            return Err(Error::configuration(format!(
                "invalid index name {:?}",
                self.name
            )));
        }
        if !(MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&self.page_size) {
            return Err(Error::configuration(format!(
                "page size {} outside {}..={}",
                self.page_size, MIN_PAGE_SIZE, MAX_PAGE_SIZE
            )));
        }
        self.key.validate()?;
        if self.max_entries_per_page.is_some_and(|n| n < 3) {
            return Err(Error::configuration(
                "max_entries_per_page must be at least 3",
            ));
        }
        if !(self.bulk_fill_factor > 0.0 && self.bulk_fill_factor <= 1.0) {
            return Err(Error::configuration(format!(
                "bulk fill factor {} outside (0, 1]",
                self.bulk_fill_factor
            )));
        }
        if self.memory.component_count == 0 {
            return Err(Error::configuration("at least one memory component is required"));
        }
        if self.max_structural_retries == 0 {
            return Err(Error::configuration("max_structural_retries must be positive"));
        }
        if self.max_descent_retries == 0 {
            return Err(Error::configuration("max_descent_retries must be positive"));
        }
        self.memory.flush_policy.validate()?;
        self.merge_policy.validate()
    }
}

/// Key discipline of an index
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyConfig {
    /// R-tree keyed on a box: `dimensions` minimum coordinates followed by
    /// `dimensions` maximum coordinates
    Spatial { dimensions: usize },
    /// B-tree-like index keyed on the first `key_fields` fields
    Ordered { key_fields: usize, unique: bool },
}

impl Default for KeyConfig {
    fn default() -> Self {
        Self::Ordered {
            key_fields: 1,
            unique: false,
        }
    }
}

impl KeyConfig {
    /// Whether the index rejects a second tuple with an equal key
    #[must_use]
    pub const fn is_unique(&self) -> bool {
        matches!(self, Self::Ordered { unique: true, .. })
    }

    fn validate(&self) -> Result<()> {
        match self {
            Self::Spatial { dimensions } if *dimensions == 0 || *dimensions > 8 => Err(
                Error::configuration(format!("spatial dimensions {dimensions} outside 1..=8")),
            ),
            Self::Ordered { key_fields, .. } if *key_fields == 0 => {
                Err(Error::configuration("ordered index needs at least one key field"))
            }
            _ => Ok(()),
        }
    }
}

/// Memory component configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// Memory components created up front; the pool grows when every
    /// component is still held by readers
    pub component_count: usize,
    /// When the mutable component counts as full
    pub flush_policy: FlushPolicyConfig,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            component_count: 2,
            flush_policy: FlushPolicyConfig::default(),
        }
    }
}

/// Fullness predicate of the mutable component
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FlushPolicyConfig {
    /// Full once the component's trees occupy this many pages
    PageBudget { max_pages: usize },
    /// Full once the component holds this many entries and tombstones
    EntryBudget { max_entries: u64 },
    /// Never full; flushes happen only on request
    Manual,
}

impl Default for FlushPolicyConfig {
    fn default() -> Self {
        Self::PageBudget { max_pages: 1024 }
    }
}

impl FlushPolicyConfig {
    fn validate(&self) -> Result<()> {
        match self {
            Self::PageBudget { max_pages: 0 } => {
                Err(Error::configuration("flush page budget must be positive"))
            }
            Self::EntryBudget { max_entries: 0 } => {
                Err(Error::configuration("flush entry budget must be positive"))
            }
            _ => Ok(()),
        }
    }
}

/// Merge policy for disk components
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MergePolicyConfig {
    /// Never merge automatically
    None,
    /// Merge every disk component once `max_components` exist
    Constant { max_components: usize },
    /// Merge the newest run of small components once more than
    /// `max_tolerance_count` of them exist
    Prefix {
        max_mergable_pages: usize,
        max_tolerance_count: usize,
    },
}

impl Default for MergePolicyConfig {
    fn default() -> Self {
        Self::Prefix {
            max_mergable_pages: 8192,
            max_tolerance_count: 5,
        }
    }
}

impl MergePolicyConfig {
    fn validate(&self) -> Result<()> {
        match self {
            Self::Constant { max_components } if *max_components < 2 => Err(
                Error::configuration("constant merge policy needs at least two components"),
            ),
            Self::Prefix {
                max_mergable_pages: 0,
                ..
            } => Err(Error::configuration("prefix merge page limit must be positive")),
            _ => Ok(()),
        }
    }
}

/// Buffer cache configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Resident disk pages before clean, unpinned pages are evicted.
    /// Memory component pages are never evicted.
    pub capacity_pages: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity_pages: 16384,
        }
    }
}
