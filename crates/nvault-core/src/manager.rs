//! Storage manager — the façade the rest of the platform talks to
//!
//! Owns the block registry and the format registry, hands out block
//! accessors, scopes transactions, and implements the persistence-level
//! policy: bulk clears by level with clearing/cleared notifications around
//! them, integrity verification, and medium defragmentation.
//!
//! All methods take `&self`; the registries sit behind RwLocks and every
//! block carries its own writer lock, so independent threads operate on
//! independent blocks without contending here.

use std::sync::Arc;

use hashbrown::HashMap;
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::block::{decode_manifest, encode_manifest, PersistenceLevel, PersistentBlock};
use crate::config::Config;
use crate::error::{NvError, NvResult};
use crate::events::{EventHub, StorageEvent};
use crate::format::BlockFormat;
use crate::medium::StorageMedium;
use crate::transaction::{ScopedTransaction, Transaction, TransactionContext};

/// Top-level façade over one storage medium.
pub struct StorageManager {
    medium: Arc<dyn StorageMedium>,
    config: Config,
    /// Registered block shapes, keyed by format name
    formats: RwLock<HashMap<String, Arc<BlockFormat>>>,
    /// Live blocks, keyed by block name
    blocks: RwLock<HashMap<String, Arc<PersistentBlock>>>,
    events: Arc<EventHub>,
}

impl StorageManager {
    /// Open a store over the given medium, reloading every block the
    /// medium already holds from its persisted manifest.
    pub fn open(medium: Arc<dyn StorageMedium>, config: Config) -> NvResult<Self> {
        config
            .validate()
            .map_err(|reason| NvError::InvalidConfig { reason })?;

        let events = Arc::new(EventHub::new());
        let mut blocks = HashMap::new();

        let mut names = medium.list()?;
        names.sort();
        for name in names {
            let meta = medium.read_meta(&name)?;
            let (level, count, format) = decode_manifest(&name, &meta)?;
            let format = Arc::new(format);

            let len = count * format.element_size();
            let bytes = medium.read(&name, 0, len)?;

            let block = Arc::new(PersistentBlock::new(
                name.clone(),
                Arc::clone(&format),
                level,
                count,
                bytes,
                Arc::clone(&medium),
                Arc::clone(&events),
                config.sync_writes,
            ));
            blocks.insert(name, block);
        }

        if !blocks.is_empty() {
            info!(blocks = blocks.len(), "reloaded persisted blocks");
        }

        let manager = Self {
            medium,
            config,
            formats: RwLock::new(HashMap::new()),
            blocks: RwLock::new(blocks),
            events,
        };

        if manager.config.verify_on_open && !manager.verify_integrity(false)? {
            warn!("integrity verification failed while opening the store");
        }

        Ok(manager)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Register a subscriber for storage events.
    pub fn subscribe<F>(&self, sink: F)
    where
        F: Fn(&StorageEvent) + Send + Sync + 'static,
    {
        self.events.subscribe(sink);
    }

    /// Register (or replace) a block shape. The layout is finalized here if
    /// the author has not done so already.
    pub fn register_format(&self, mut format: BlockFormat) {
        format.finalize_layout();
        let name = format.name().to_string();
        self.formats.write().insert(name, Arc::new(format));
    }

    /// Create a block whose shape was registered under the block's name.
    pub fn create_block(
        &self,
        level: PersistenceLevel,
        name: &str,
        count: usize,
    ) -> NvResult<Arc<PersistentBlock>> {
        let format = self
            .formats
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| NvError::InvalidSchema {
                format: name.to_string(),
                reason: "no registered format for this block name".to_string(),
            })?;
        self.create_with_format(level, name, count, format)
    }

    /// Create a block from an explicitly supplied shape — for data-driven
    /// layouts that exist nowhere in the static registry.
    pub fn create_dynamic_block(
        &self,
        level: PersistenceLevel,
        name: &str,
        count: usize,
        mut format: BlockFormat,
    ) -> NvResult<Arc<PersistentBlock>> {
        format.finalize_layout();
        self.create_with_format(level, name, count, Arc::new(format))
    }

    fn create_with_format(
        &self,
        level: PersistenceLevel,
        name: &str,
        count: usize,
        format: Arc<BlockFormat>,
    ) -> NvResult<Arc<PersistentBlock>> {
        if count == 0 {
            return Err(NvError::BlockSizeOutOfRange {
                name: name.to_string(),
                count,
            });
        }

        let len = count * format.element_size();
        if len > self.config.max_block_bytes {
            return Err(NvError::OversizedBlock {
                name: name.to_string(),
                requested_bytes: len,
                limit_bytes: self.config.max_block_bytes,
            });
        }

        let mut blocks = self.blocks.write();
        if blocks.contains_key(name) {
            return Err(NvError::DuplicateBlock {
                name: name.to_string(),
            });
        }

        let manifest = encode_manifest(&format, level, count)?;
        self.medium.create(name, &manifest, len)?;
        if self.config.sync_writes {
            self.medium.flush(name)?;
        }

        let block = Arc::new(PersistentBlock::new(
            name.to_string(),
            format,
            level,
            count,
            vec![0u8; len],
            Arc::clone(&self.medium),
            Arc::clone(&self.events),
            self.config.sync_writes,
        ));
        blocks.insert(name.to_string(), Arc::clone(&block));

        debug!(block = name, count, bytes = len, "created block");
        Ok(block)
    }

    pub fn block_exists(&self, name: &str) -> bool {
        self.blocks.read().contains_key(name)
    }

    pub fn get_block(&self, name: &str) -> NvResult<Arc<PersistentBlock>> {
        self.blocks
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| NvError::BlockNotFound {
                name: name.to_string(),
            })
    }

    /// Re-dimension a block's array. Existing elements survive; new ones
    /// read as zero values.
    pub fn resize_block(&self, name: &str, count: usize) -> NvResult<()> {
        self.get_block(name)?.resize(count)
    }

    /// Reclassify a block for future level clears.
    pub fn update_persistence_level(
        &self,
        name: &str,
        level: PersistenceLevel,
    ) -> NvResult<()> {
        self.get_block(name)?.set_level(level)
    }

    /// Destroy every block at exactly this level. Collaborators get the
    /// clearing notification before the first byte is touched and the
    /// cleared notification after the last block is gone.
    pub fn clear(&self, level: PersistenceLevel) -> NvResult<()> {
        self.events.emit(&StorageEvent::Clearing(level));

        let removed = {
            let mut blocks = self.blocks.write();
            let names: Vec<String> = blocks
                .values()
                .filter(|b| b.level() == level)
                .map(|b| b.name().to_string())
                .collect();

            for name in &names {
                self.medium.remove(name)?;
                blocks.remove(name);
            }
            names.len()
        };

        info!(?level, removed, "cleared persistence level");
        self.events.emit(&StorageEvent::Cleared(level));
        Ok(())
    }

    /// Check stored data for corruption. Quick mode inspects structure and
    /// checksums cheaply; full mode re-validates every stored byte.
    /// Corruption reports `Ok(false)` and fires the integrity event — the
    /// caller decides whether to recover or lock the machine up.
    pub fn verify_integrity(&self, full: bool) -> NvResult<bool> {
        let ok = self.medium.verify(full)?;
        if !ok {
            warn!(full, "storage integrity verification failed");
            self.events.emit(&StorageEvent::IntegrityCheckFailed {
                detail: if full {
                    "full byte verification failed".to_string()
                } else {
                    "structural verification failed".to_string()
                },
            });
        }
        Ok(ok)
    }

    /// Reclaim medium space left by shrunk or removed blocks. Logical
    /// contents, offsets and names are untouched.
    pub fn defragment(&self) -> NvResult<()> {
        debug!("defragmenting storage medium");
        self.medium.defragment()
    }

    /// Start a free-standing transaction on this store.
    pub fn transaction(&self) -> Transaction {
        Transaction::new(Arc::clone(&self.events))
    }

    /// Open a scope on the caller's transaction context: joins the ambient
    /// transaction if one is active, otherwise creates it and becomes the
    /// outermost scope.
    pub fn scoped<'c>(&self, ctx: &'c mut TransactionContext) -> ScopedTransaction<'c> {
        ScopedTransaction::enter(ctx, Arc::clone(&self.events))
    }

    pub fn block_count(&self) -> usize {
        self.blocks.read().len()
    }
}

impl std::fmt::Debug for StorageManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageManager")
            .field("blocks", &self.block_count())
            .field("formats", &self.formats.read().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::medium::MemoryMedium;
    use crate::schema::FieldSchema;
    use crate::value::{FieldKind, FieldValue};
    use parking_lot::Mutex;

    fn meter_format() -> BlockFormat {
        let mut format = BlockFormat::new("meter1");
        format
            .push_field(FieldSchema::new("count", FieldKind::Int32).at_offset(0))
            .unwrap();
        format.push_field(FieldSchema::text("label", 8)).unwrap();
        format
    }

    fn open_manager() -> (StorageManager, Arc<MemoryMedium>) {
        let medium = Arc::new(MemoryMedium::new());
        let manager = StorageManager::open(
            Arc::clone(&medium) as Arc<dyn StorageMedium>,
            Config::default(),
        )
        .unwrap();
        (manager, medium)
    }

    #[test]
    fn test_create_and_get() {
        let (manager, _) = open_manager();
        manager.register_format(meter_format());

        let block = manager
            .create_block(PersistenceLevel::Critical, "meter1", 1)
            .unwrap();
        assert!(manager.block_exists("meter1"));
        assert_eq!(manager.get_block("meter1").unwrap().name(), block.name());
    }

    #[test]
    fn test_create_duplicate_rejected() {
        let (manager, _) = open_manager();
        manager.register_format(meter_format());
        manager.create_block(PersistenceLevel::Static, "meter1", 1).unwrap();

        assert!(matches!(
            manager.create_block(PersistenceLevel::Static, "meter1", 1),
            Err(NvError::DuplicateBlock { .. })
        ));
    }

    #[test]
    fn test_create_requires_registered_format() {
        let (manager, _) = open_manager();
        assert!(matches!(
            manager.create_block(PersistenceLevel::Static, "unheard_of", 1),
            Err(NvError::InvalidSchema { .. })
        ));
    }

    #[test]
    fn test_create_zero_count_rejected() {
        let (manager, _) = open_manager();
        manager.register_format(meter_format());
        assert!(matches!(
            manager.create_block(PersistenceLevel::Static, "meter1", 0),
            Err(NvError::BlockSizeOutOfRange { .. })
        ));
    }

    #[test]
    fn test_create_oversized_rejected() {
        let medium = Arc::new(MemoryMedium::new());
        let mut config = Config::default();
        config.max_block_bytes = 64;
        let manager =
            StorageManager::open(medium as Arc<dyn StorageMedium>, config).unwrap();
        manager.register_format(meter_format());

        assert!(matches!(
            manager.create_block(PersistenceLevel::Static, "meter1", 100),
            Err(NvError::OversizedBlock { .. })
        ));
    }

    #[test]
    fn test_get_missing_block() {
        let (manager, _) = open_manager();
        assert!(matches!(
            manager.get_block("nope"),
            Err(NvError::BlockNotFound { .. })
        ));
        assert!(!manager.block_exists("nope"));
    }

    #[test]
    fn test_dynamic_block_needs_no_registry() {
        let (manager, _) = open_manager();
        let mut format = BlockFormat::new("download_record");
        format.push_field(FieldSchema::new("size", FieldKind::UInt32)).unwrap();

        let block = manager
            .create_dynamic_block(PersistenceLevel::Transient, "dl_0", 4, format)
            .unwrap();
        assert_eq!(block.count(), 4);
    }

    #[test]
    fn test_clear_is_level_scoped_and_fires_events() {
        let (manager, medium) = open_manager();
        manager.register_format(meter_format());

        let mut keeper_format = BlockFormat::new("keeper");
        keeper_format.push_field(FieldSchema::new("v", FieldKind::Int32)).unwrap();

        manager.create_block(PersistenceLevel::Critical, "meter1", 1).unwrap();
        manager
            .create_dynamic_block(PersistenceLevel::Static, "ident", 1, keeper_format.clone())
            .unwrap();
        manager
            .create_dynamic_block(PersistenceLevel::Transient, "scratch", 1, keeper_format)
            .unwrap();

        let static_block = manager.get_block("ident").unwrap();
        static_block.write(0, "v", &FieldValue::Int32(77)).unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        manager.subscribe(move |e| sink.lock().push(e.clone()));

        manager.clear(PersistenceLevel::Critical).unwrap();

        assert!(!manager.block_exists("meter1"));
        assert!(manager.block_exists("ident"));
        assert!(manager.block_exists("scratch"));
        assert_eq!(static_block.read(0, "v").unwrap(), FieldValue::Int32(77));
        assert_eq!(medium.region_count(), 2);

        assert_eq!(
            *seen.lock(),
            vec![
                StorageEvent::Clearing(PersistenceLevel::Critical),
                StorageEvent::Cleared(PersistenceLevel::Critical),
            ]
        );
    }

    #[test]
    fn test_update_level_changes_clear_scope() {
        let (manager, _) = open_manager();
        manager.register_format(meter_format());
        manager.create_block(PersistenceLevel::Critical, "meter1", 1).unwrap();

        manager
            .update_persistence_level("meter1", PersistenceLevel::Static)
            .unwrap();
        manager.clear(PersistenceLevel::Critical).unwrap();
        assert!(manager.block_exists("meter1"));

        manager.clear(PersistenceLevel::Static).unwrap();
        assert!(!manager.block_exists("meter1"));
    }

    #[test]
    fn test_resize_via_manager() {
        let (manager, _) = open_manager();
        manager.register_format(meter_format());
        manager.create_block(PersistenceLevel::Critical, "meter1", 1).unwrap();

        manager.resize_block("meter1", 3).unwrap();
        assert_eq!(manager.get_block("meter1").unwrap().count(), 3);

        assert!(matches!(
            manager.resize_block("ghost", 3),
            Err(NvError::BlockNotFound { .. })
        ));
    }

    #[test]
    fn test_reopen_restores_blocks() {
        let medium = Arc::new(MemoryMedium::new());
        {
            let manager = StorageManager::open(
                Arc::clone(&medium) as Arc<dyn StorageMedium>,
                Config::default(),
            )
            .unwrap();
            manager.register_format(meter_format());
            let block = manager
                .create_block(PersistenceLevel::Critical, "meter1", 2)
                .unwrap();
            block.write(0, "count", &FieldValue::Int32(5)).unwrap();
            block.write(1, "label", &FieldValue::Text("abc".into())).unwrap();
        }

        // A fresh manager over the same medium sees everything back
        let manager = StorageManager::open(
            Arc::clone(&medium) as Arc<dyn StorageMedium>,
            Config::default(),
        )
        .unwrap();

        let block = manager.get_block("meter1").unwrap();
        assert_eq!(block.level(), PersistenceLevel::Critical);
        assert_eq!(block.count(), 2);
        assert_eq!(block.read(0, "count").unwrap(), FieldValue::Int32(5));
        assert_eq!(block.read(1, "label").unwrap(), FieldValue::Text("abc".into()));
    }

    #[test]
    fn test_invalid_config_rejected() {
        let medium = Arc::new(MemoryMedium::new());
        let mut config = Config::default();
        config.max_block_bytes = 1;

        assert!(matches!(
            StorageManager::open(medium as Arc<dyn StorageMedium>, config),
            Err(NvError::InvalidConfig { .. })
        ));
    }

    #[test]
    fn test_verify_integrity_failure_fires_event() {
        /// Medium whose verification always reports corruption.
        struct TaintedMedium(MemoryMedium);

        impl StorageMedium for TaintedMedium {
            fn create(&self, name: &str, meta: &[u8], len: usize) -> NvResult<()> {
                self.0.create(name, meta, len)
            }
            fn remove(&self, name: &str) -> NvResult<()> {
                self.0.remove(name)
            }
            fn resize(&self, name: &str, len: usize) -> NvResult<()> {
                self.0.resize(name, len)
            }
            fn read(&self, name: &str, offset: usize, len: usize) -> NvResult<Vec<u8>> {
                self.0.read(name, offset, len)
            }
            fn write(&self, name: &str, offset: usize, bytes: &[u8]) -> NvResult<()> {
                self.0.write(name, offset, bytes)
            }
            fn flush(&self, name: &str) -> NvResult<()> {
                self.0.flush(name)
            }
            fn read_meta(&self, name: &str) -> NvResult<Vec<u8>> {
                self.0.read_meta(name)
            }
            fn write_meta(&self, name: &str, meta: &[u8]) -> NvResult<()> {
                self.0.write_meta(name, meta)
            }
            fn list(&self) -> NvResult<Vec<String>> {
                self.0.list()
            }
            fn verify(&self, _full: bool) -> NvResult<bool> {
                Ok(false)
            }
            fn defragment(&self) -> NvResult<()> {
                self.0.defragment()
            }
        }

        let medium: Arc<dyn StorageMedium> = Arc::new(TaintedMedium(MemoryMedium::new()));
        let manager = StorageManager::open(medium, Config::default()).unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        manager.subscribe(move |e| sink.lock().push(e.clone()));

        assert!(!manager.verify_integrity(true).unwrap());
        assert!(matches!(
            seen.lock().as_slice(),
            [StorageEvent::IntegrityCheckFailed { .. }]
        ));
    }

    #[test]
    fn test_scoped_transaction_through_manager() {
        let (manager, _) = open_manager();
        manager.register_format(meter_format());
        let block = manager
            .create_block(PersistenceLevel::Critical, "meter1", 1)
            .unwrap();

        let mut ctx = TransactionContext::new();
        let mut scope = manager.scoped(&mut ctx);
        scope.write(&block, 0, "count", FieldValue::Int32(3)).unwrap();
        scope.complete().unwrap();

        assert_eq!(block.read(0, "count").unwrap(), FieldValue::Int32(3));
    }
}
