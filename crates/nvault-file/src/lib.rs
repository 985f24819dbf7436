//! NVault File — file-backed storage medium for NVault
//!
//! Implements the core's `StorageMedium` trait over per-block container
//! files: a magic header, the persisted block manifest in a checksummed
//! meta region, a CRC32C page table over the data, and platform durable
//! sync on the commit path. Reshaping operations (create, growth, meta
//! changes, defragmentation) go through temp-file + atomic rename, so a
//! crash never exposes a torn container.
//!
//! ```no_run
//! use std::sync::Arc;
//! use nvault_core::{Config, StorageManager};
//! use nvault_file::FileMedium;
//!
//! let medium = Arc::new(FileMedium::new("/var/lib/nvault")?);
//! let manager = StorageManager::open(medium, Config::default())?;
//! # Ok::<(), nvault_core::NvError>(())
//! ```

pub mod files;
pub mod sync;

// Re-export key types for convenience
pub use files::FileMedium;
pub use sync::durable_sync;
