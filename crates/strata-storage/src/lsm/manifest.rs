//! Persistent list of disk components
//!
//! ```text
//! +-------+---------+----------+--------+------------------+
//! | magic | version | checksum | length | bincode body ... |
//! |  u32  |   u32   |  crc32c  |  u32   |                  |
//! +-------+---------+----------+--------+------------------+
//! ```
//!
//! The manifest is rewritten through a temporary file and a rename, so a
//! crash leaves either the old or the new list.

use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use strata_common::{ComponentId, Error, Result};

pub const MANIFEST_FILE: &str = "MANIFEST";

/// Fixed-size manifest header
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ManifestHeader {
    pub magic: u32,
    pub version: u32,
    pub checksum: u32,
    pub length: u32,
}

impl ManifestHeader {
    pub const MAGIC: u32 = 0x5354_4D46; // "STMF"
    pub const VERSION: u32 = 1;
    pub const SIZE: usize = 16;

    pub fn to_bytes(self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..4].copy_from_slice(&self.magic.to_le_bytes());
        buf[4..8].copy_from_slice(&self.version.to_le_bytes());
        buf[8..12].copy_from_slice(&self.checksum.to_le_bytes());
        buf[12..16].copy_from_slice(&self.length.to_le_bytes());
        buf
    }

    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        if data.len() < Self::SIZE {
            return None;
        }
        let magic = u32::from_le_bytes(data[0..4].try_into().ok()?);
        if magic != Self::MAGIC {
            return None;
        }
        Some(Self {
            magic,
            version: u32::from_le_bytes(data[4..8].try_into().ok()?),
            checksum: u32::from_le_bytes(data[8..12].try_into().ok()?),
            length: u32::from_le_bytes(data[12..16].try_into().ok()?),
        })
    }
}

/// One disk component as recorded in the manifest
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub id: ComponentId,
    pub entries: u64,
    pub tombstones: u64,
}

/// Disk components of an index, newest first
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub next_component_id: u64,
    pub components: Vec<ManifestEntry>,
}

impl Manifest {
    #[must_use]
    pub fn path(dir: &Path) -> PathBuf {
        dir.join(MANIFEST_FILE)
    }

    /// Read the manifest in `dir`; `None` for a fresh index
    pub fn load(dir: &Path) -> Result<Option<Self>> {
        let path = Self::path(dir);
        if !path.exists() {
            return Ok(None);
        }
        let mut data = Vec::new();
        File::open(&path)?.read_to_end(&mut data)?;

        let header = ManifestHeader::from_bytes(&data)
            .ok_or_else(|| Error::corruption(format!("invalid manifest header in {}", path.display())))?;
        if header.version != ManifestHeader::VERSION {
            return Err(Error::corruption(format!(
                "unsupported manifest version {}",
                header.version
            )));
        }
        let body = data
            .get(ManifestHeader::SIZE..ManifestHeader::SIZE + header.length as usize)
            .ok_or_else(|| Error::corruption("truncated manifest"))?;
        if crc32c::crc32c(body) != header.checksum {
            return Err(Error::corruption("manifest checksum mismatch"));
        }
        bincode::deserialize(body)
            .map(Some)
            .map_err(|e| Error::Serialization(format!("failed to decode manifest: {e}")))
    }

    /// Atomically replace the manifest in `dir`
    pub fn store(&self, dir: &Path) -> Result<()> {
        let body = bincode::serialize(self)
            .map_err(|e| Error::Serialization(format!("failed to encode manifest: {e}")))?;
        let header = ManifestHeader {
            magic: ManifestHeader::MAGIC,
            version: ManifestHeader::VERSION,
            checksum: crc32c::crc32c(&body),
            length: u32::try_from(body.len())
                .map_err(|_| Error::internal("manifest larger than 4 GiB"))?,
        };

        let path = Self::path(dir);
        let temp_path = dir.join(format!("{MANIFEST_FILE}.tmp"));
        {
            let file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&temp_path)?;
            let mut writer = BufWriter::new(file);
            writer.write_all(&header.to_bytes())?;
            writer.write_all(&body)?;
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        std::fs::rename(&temp_path, &path)?;
        File::open(dir)?.sync_all()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample() -> Manifest {
        Manifest {
            next_component_id: 9,
            components: vec![
                ManifestEntry {
                    id: ComponentId::new(8),
                    entries: 120,
                    tombstones: 3,
                },
                ManifestEntry {
                    id: ComponentId::new(4),
                    entries: 4000,
                    tombstones: 0,
                },
            ],
        }
    }

    #[test]
    fn test_header_roundtrip() {
        let header = ManifestHeader {
            magic: ManifestHeader::MAGIC,
            version: ManifestHeader::VERSION,
            checksum: 0xDEAD_BEEF,
            length: 42,
        };
        assert_eq!(ManifestHeader::from_bytes(&header.to_bytes()), Some(header));
        assert_eq!(ManifestHeader::from_bytes(&[0u8; 16]), None);
    }

    #[test]
    fn test_store_and_load() {
        let dir = tempdir().unwrap();
        assert_eq!(Manifest::load(dir.path()).unwrap(), None);

        sample().store(dir.path()).unwrap();
        assert_eq!(Manifest::load(dir.path()).unwrap(), Some(sample()));
        assert!(!dir.path().join("MANIFEST.tmp").exists());

        let mut next = sample();
        next.components.remove(0);
        next.store(dir.path()).unwrap();
        assert_eq!(Manifest::load(dir.path()).unwrap(), Some(next));
    }

    #[test]
    fn test_detects_corruption() {
        let dir = tempdir().unwrap();
        sample().store(dir.path()).unwrap();
        let path = Manifest::path(dir.path());
        let mut bytes = std::fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        std::fs::write(&path, bytes).unwrap();
        assert!(matches!(Manifest::load(dir.path()), Err(Error::Corruption(_))));
    }
}
