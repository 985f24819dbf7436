//! Backing-store collaborator interface
//!
//! The core is agnostic to what actually holds the bytes — flat files,
//! battery-backed NVRAM, a relational store. It only requires the
//! primitives below: named byte regions with offset reads/writes, a meta
//! region per block for the persisted manifest, a durable flush, and
//! maintenance hooks (verify, defragment).
//!
//! `MemoryMedium` is the reference implementation: RAM-only, suitable for
//! tests and for deployments where a higher tier handles persistence.

use hashbrown::HashMap;
use parking_lot::RwLock;

use crate::error::{NvError, NvResult};

/// Durable storage primitives the block layer builds on.
///
/// Write ordering contract: a block's commit path writes data bytes, then
/// calls [`flush`](Self::flush); implementations must guarantee that once
/// `flush` returns, those bytes survive power loss.
pub trait StorageMedium: Send + Sync {
    /// Create a named region of `len` zeroed data bytes with the given meta.
    fn create(&self, name: &str, meta: &[u8], len: usize) -> NvResult<()>;

    /// Remove a region and its meta entirely.
    fn remove(&self, name: &str) -> NvResult<()>;

    /// Change a region's data length: grow zero-fills, shrink truncates.
    fn resize(&self, name: &str, len: usize) -> NvResult<()>;

    /// Read `len` bytes at `offset`.
    fn read(&self, name: &str, offset: usize, len: usize) -> NvResult<Vec<u8>>;

    /// Overwrite bytes at `offset`. The write must stay inside the region.
    fn write(&self, name: &str, offset: usize, bytes: &[u8]) -> NvResult<()>;

    /// Make every prior write to the region durable before returning.
    fn flush(&self, name: &str) -> NvResult<()>;

    /// Read the region's meta bytes (the persisted block manifest).
    fn read_meta(&self, name: &str) -> NvResult<Vec<u8>>;

    /// Replace the region's meta bytes.
    fn write_meta(&self, name: &str, meta: &[u8]) -> NvResult<()>;

    /// Names of every stored region.
    fn list(&self) -> NvResult<Vec<String>>;

    /// Structural integrity check. Quick mode inspects headers/checksums
    /// cheaply; full mode re-validates every stored byte. Corruption is
    /// reported as `Ok(false)`, not as an error.
    fn verify(&self, full: bool) -> NvResult<bool>;

    /// Reclaim space left behind by shrunk or removed regions. Must not
    /// change any region's logical contents.
    fn defragment(&self) -> NvResult<()>;
}

struct MemoryRegion {
    meta: Vec<u8>,
    data: Vec<u8>,
}

/// RAM-backed medium. Contents live as long as the medium value itself, so
/// reopening a manager over the same `Arc<MemoryMedium>` sees prior state.
#[derive(Default)]
pub struct MemoryMedium {
    regions: RwLock<HashMap<String, MemoryRegion>>,
}

impl MemoryMedium {
    pub fn new() -> Self {
        Self {
            regions: RwLock::new(HashMap::new()),
        }
    }

    pub fn region_count(&self) -> usize {
        self.regions.read().len()
    }
}

impl StorageMedium for MemoryMedium {
    fn create(&self, name: &str, meta: &[u8], len: usize) -> NvResult<()> {
        let mut regions = self.regions.write();
        if regions.contains_key(name) {
            return Err(NvError::DuplicateBlock {
                name: name.to_string(),
            });
        }
        regions.insert(
            name.to_string(),
            MemoryRegion {
                meta: meta.to_vec(),
                data: vec![0u8; len],
            },
        );
        Ok(())
    }

    fn remove(&self, name: &str) -> NvResult<()> {
        self.regions
            .write()
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| NvError::BlockNotFound {
                name: name.to_string(),
            })
    }

    fn resize(&self, name: &str, len: usize) -> NvResult<()> {
        let mut regions = self.regions.write();
        let region = regions.get_mut(name).ok_or_else(|| NvError::BlockNotFound {
            name: name.to_string(),
        })?;
        region.data.resize(len, 0);
        Ok(())
    }

    fn read(&self, name: &str, offset: usize, len: usize) -> NvResult<Vec<u8>> {
        let regions = self.regions.read();
        let region = regions.get(name).ok_or_else(|| NvError::BlockNotFound {
            name: name.to_string(),
        })?;
        let end = offset.checked_add(len).filter(|&e| e <= region.data.len());
        match end {
            Some(end) => Ok(region.data[offset..end].to_vec()),
            None => Err(NvError::OutOfBounds {
                block: name.to_string(),
                offset,
                len,
                data_len: region.data.len(),
            }),
        }
    }

    fn write(&self, name: &str, offset: usize, bytes: &[u8]) -> NvResult<()> {
        let mut regions = self.regions.write();
        let region = regions.get_mut(name).ok_or_else(|| NvError::BlockNotFound {
            name: name.to_string(),
        })?;
        let end = offset
            .checked_add(bytes.len())
            .filter(|&e| e <= region.data.len());
        match end {
            Some(end) => {
                region.data[offset..end].copy_from_slice(bytes);
                Ok(())
            }
            None => Err(NvError::OutOfBounds {
                block: name.to_string(),
                offset,
                len: bytes.len(),
                data_len: region.data.len(),
            }),
        }
    }

    fn flush(&self, _name: &str) -> NvResult<()> {
        // RAM is the medium; nothing further to sync
        Ok(())
    }

    fn read_meta(&self, name: &str) -> NvResult<Vec<u8>> {
        let regions = self.regions.read();
        regions
            .get(name)
            .map(|r| r.meta.clone())
            .ok_or_else(|| NvError::BlockNotFound {
                name: name.to_string(),
            })
    }

    fn write_meta(&self, name: &str, meta: &[u8]) -> NvResult<()> {
        let mut regions = self.regions.write();
        let region = regions.get_mut(name).ok_or_else(|| NvError::BlockNotFound {
            name: name.to_string(),
        })?;
        region.meta = meta.to_vec();
        Ok(())
    }

    fn list(&self) -> NvResult<Vec<String>> {
        Ok(self.regions.read().keys().cloned().collect())
    }

    fn verify(&self, _full: bool) -> NvResult<bool> {
        Ok(true)
    }

    fn defragment(&self) -> NvResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_read_write() {
        let medium = MemoryMedium::new();
        medium.create("b", b"meta", 8).unwrap();

        assert_eq!(medium.read("b", 0, 8).unwrap(), vec![0u8; 8]);
        medium.write("b", 2, &[0xAA, 0xBB]).unwrap();
        assert_eq!(medium.read("b", 2, 2).unwrap(), vec![0xAA, 0xBB]);
        assert_eq!(medium.read_meta("b").unwrap(), b"meta");
    }

    #[test]
    fn test_duplicate_create_rejected() {
        let medium = MemoryMedium::new();
        medium.create("b", &[], 4).unwrap();
        assert!(matches!(
            medium.create("b", &[], 4),
            Err(NvError::DuplicateBlock { .. })
        ));
    }

    #[test]
    fn test_out_of_bounds() {
        let medium = MemoryMedium::new();
        medium.create("b", &[], 4).unwrap();

        assert!(matches!(
            medium.read("b", 2, 4),
            Err(NvError::OutOfBounds { .. })
        ));
        assert!(matches!(
            medium.write("b", 4, &[1]),
            Err(NvError::OutOfBounds { .. })
        ));
    }

    #[test]
    fn test_resize() {
        let medium = MemoryMedium::new();
        medium.create("b", &[], 4).unwrap();
        medium.write("b", 0, &[1, 2, 3, 4]).unwrap();

        medium.resize("b", 6).unwrap();
        assert_eq!(medium.read("b", 0, 6).unwrap(), vec![1, 2, 3, 4, 0, 0]);

        medium.resize("b", 2).unwrap();
        assert_eq!(medium.read("b", 0, 2).unwrap(), vec![1, 2]);
    }

    #[test]
    fn test_remove_and_missing() {
        let medium = MemoryMedium::new();
        medium.create("b", &[], 4).unwrap();
        medium.remove("b").unwrap();

        assert!(matches!(medium.remove("b"), Err(NvError::BlockNotFound { .. })));
        assert!(matches!(medium.read("b", 0, 1), Err(NvError::BlockNotFound { .. })));
    }
}
