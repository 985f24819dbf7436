//! Persistent blocks — the durable accessor over one named byte region
//!
//! A `PersistentBlock` binds a finalized [`BlockFormat`] to a region of the
//! backing medium and keeps the committed bytes in RAM for lock-cheap
//! reads. Writers lock the block, stage field writes in a shadow buffer,
//! and commit with medium-first ordering:
//!
//! 1. staged bytes are written to the medium and flushed durably,
//! 2. only then is the in-RAM committed state updated.
//!
//! Readers take the state read lock and never observe shadow data, so a
//! crash or rollback between the two steps leaves every reader on the old
//! committed values while recovery replays the medium.

use std::sync::Arc;

use hashbrown::HashMap;
use parking_lot::{Mutex, MutexGuard, RwLock};

use crate::error::{NvError, NvResult};
use crate::events::EventHub;
use crate::format::BlockFormat;
use crate::medium::StorageMedium;
use crate::schema::FieldSchema;
use crate::value::FieldValue;

/// Retention classification. Ordinal-stable: the value is persisted in
/// block manifests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PersistenceLevel {
    /// Rarely cleared — machine identity, configuration
    Static = 0,
    /// Cleared on major lifecycle events — meters, game state
    Critical = 1,
    /// Cleared routinely — session scratch data
    Transient = 2,
}

impl PersistenceLevel {
    pub fn from_raw(raw: u8) -> Option<PersistenceLevel> {
        match raw {
            0 => Some(PersistenceLevel::Static),
            1 => Some(PersistenceLevel::Critical),
            2 => Some(PersistenceLevel::Transient),
            _ => None,
        }
    }
}

/// Manifest layout version written at the front of every meta region.
const MANIFEST_VERSION: u16 = 1;

/// Fixed portion of a manifest, before the format name bytes.
const MANIFEST_HEADER_LEN: usize = 15;

/// Serialize a block's shape and placement into its persisted manifest:
///
/// ```text
/// [0..2]   manifest version  u16 LE
/// [2]      persistence level
/// [3]      reserved
/// [4..8]   element count     u32 LE
/// [8..12]  element size      u32 LE
/// [12..14] format version    u16 LE
/// [14]     format name len
/// [..]     format name       UTF-8
/// [..+2]   field count       u16 LE
/// [..]     field records
/// ```
pub(crate) fn encode_manifest(
    format: &BlockFormat,
    level: PersistenceLevel,
    count: usize,
) -> NvResult<Vec<u8>> {
    let name = format.name().as_bytes();
    if name.len() > 255 {
        return Err(NvError::InvalidSchema {
            format: format.name().to_string(),
            reason: format!("format name is {} bytes, limit is 255", name.len()),
        });
    }

    let mut manifest = Vec::new();
    manifest.extend_from_slice(&MANIFEST_VERSION.to_le_bytes());
    manifest.push(level as u8);
    manifest.push(0);
    manifest.extend_from_slice(&(count as u32).to_le_bytes());
    manifest.extend_from_slice(&(format.element_size() as u32).to_le_bytes());
    manifest.extend_from_slice(&format.version().to_le_bytes());
    manifest.push(name.len() as u8);
    manifest.extend_from_slice(name);
    manifest.extend_from_slice(&(format.field_count() as u16).to_le_bytes());
    for field in format.fields() {
        manifest.extend_from_slice(&field.to_record()?);
    }
    Ok(manifest)
}

/// Parse a persisted manifest back into level, element count and a rebuilt
/// (finalized) format. Stored offsets are authoritative; nothing re-packs.
pub(crate) fn decode_manifest(
    block: &str,
    bytes: &[u8],
) -> NvResult<(PersistenceLevel, usize, BlockFormat)> {
    let corrupt = |offset: usize, reason: String| NvError::CorruptManifest {
        block: block.to_string(),
        offset,
        reason,
    };

    if bytes.len() < MANIFEST_HEADER_LEN {
        return Err(corrupt(0, format!(
            "manifest too short: {} bytes, need at least {}",
            bytes.len(),
            MANIFEST_HEADER_LEN
        )));
    }

    let manifest_version = u16::from_le_bytes([bytes[0], bytes[1]]);
    if manifest_version != MANIFEST_VERSION {
        return Err(corrupt(0, format!("unsupported manifest version {}", manifest_version)));
    }

    let level = PersistenceLevel::from_raw(bytes[2])
        .ok_or_else(|| corrupt(2, format!("unknown persistence level {}", bytes[2])))?;
    let count = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]) as usize;
    let element_size = u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]) as usize;
    let format_version = u16::from_le_bytes([bytes[12], bytes[13]]);
    let name_len = bytes[14] as usize;

    let name_end = MANIFEST_HEADER_LEN + name_len;
    if bytes.len() < name_end + 2 {
        return Err(corrupt(MANIFEST_HEADER_LEN, "manifest truncated in format name".into()));
    }
    let format_name = std::str::from_utf8(&bytes[MANIFEST_HEADER_LEN..name_end])
        .map_err(|e| corrupt(MANIFEST_HEADER_LEN, format!("format name is not UTF-8: {}", e)))?
        .to_string();

    let field_count = u16::from_le_bytes([bytes[name_end], bytes[name_end + 1]]) as usize;
    let mut at = name_end + 2;

    let mut format = BlockFormat::new(format_name)
        .with_version(format_version)
        .with_element_size(element_size);
    for _ in 0..field_count {
        let (field, used) = FieldSchema::from_record(&bytes[at..]).map_err(|e| match e {
            NvError::CorruptManifest { offset, reason, .. } => corrupt(at + offset, reason),
            other => other,
        })?;
        format.push_field(field)?;
        at += used;
    }
    format.finalize_layout();

    Ok((level, count, format))
}

struct BlockState {
    count: usize,
    bytes: Vec<u8>,
}

/// A named, leveled, durable array of typed records.
pub struct PersistentBlock {
    name: String,
    format: Arc<BlockFormat>,
    level: Mutex<PersistenceLevel>,
    /// Committed bytes — the only state readers ever see
    state: RwLock<BlockState>,
    /// Writer exclusion; held for the lifetime of a [`BlockUpdate`]
    update: Mutex<()>,
    medium: Arc<dyn StorageMedium>,
    events: Arc<EventHub>,
    sync_writes: bool,
}

impl PersistentBlock {
    pub(crate) fn new(
        name: String,
        format: Arc<BlockFormat>,
        level: PersistenceLevel,
        count: usize,
        bytes: Vec<u8>,
        medium: Arc<dyn StorageMedium>,
        events: Arc<EventHub>,
        sync_writes: bool,
    ) -> Self {
        debug_assert_eq!(bytes.len(), count * format.element_size());
        Self {
            name,
            format,
            level: Mutex::new(level),
            state: RwLock::new(BlockState { count, bytes }),
            update: Mutex::new(()),
            medium,
            events,
            sync_writes,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn level(&self) -> PersistenceLevel {
        *self.level.lock()
    }

    pub fn format(&self) -> &Arc<BlockFormat> {
        &self.format
    }

    /// Current array dimension.
    pub fn count(&self) -> usize {
        self.state.read().count
    }

    pub fn element_size(&self) -> usize {
        self.format.element_size()
    }

    pub(crate) fn events(&self) -> &Arc<EventHub> {
        &self.events
    }

    /// Read a field's last committed value.
    pub fn read(&self, index: usize, field_name: &str) -> NvResult<FieldValue> {
        let state = self.state.read();
        self.check_index(index, state.count)?;
        let field = self.require_field(field_name)?;

        let range = self.field_range(index, field);
        self.format.convert(field_name, &state.bytes[range])
    }

    /// Write one field and commit it immediately. Blocks until the update
    /// lock is free.
    pub fn write(&self, index: usize, field_name: &str, value: &FieldValue) -> NvResult<()> {
        let mut update = self.start_update(true)?;
        update.set(index, field_name, value)?;
        update.commit()
    }

    /// Begin an update cycle. With `wait_for_lock` the call blocks until
    /// the per-block writer lock is free; without it, a held lock fails
    /// immediately with [`NvError::UpdateLockHeld`].
    pub fn start_update(&self, wait_for_lock: bool) -> NvResult<BlockUpdate<'_>> {
        let guard = if wait_for_lock {
            self.update.lock()
        } else {
            self.update.try_lock().ok_or_else(|| NvError::UpdateLockHeld {
                block: self.name.clone(),
            })?
        };

        Ok(BlockUpdate {
            block: self,
            _guard: guard,
            shadow: HashMap::new(),
            undo: Vec::new(),
        })
    }

    /// Re-dimension the array. Grow zero-fills new elements; shrink
    /// truncates trailing ones. Existing element data is preserved.
    pub(crate) fn resize(&self, count: usize) -> NvResult<()> {
        if count == 0 {
            return Err(NvError::BlockSizeOutOfRange {
                name: self.name.clone(),
                count,
            });
        }

        let _guard = self.update.lock();
        let new_len = count * self.format.element_size();

        self.medium.resize(&self.name, new_len)?;
        self.write_manifest_locked(count)?;
        if self.sync_writes {
            self.medium.flush(&self.name)?;
        }

        let mut state = self.state.write();
        state.bytes.resize(new_len, 0);
        state.count = count;
        Ok(())
    }

    /// Reclassify the block for future level clears. Data is untouched.
    pub(crate) fn set_level(&self, level: PersistenceLevel) -> NvResult<()> {
        let _guard = self.update.lock();
        *self.level.lock() = level;
        let count = self.state.read().count;
        self.write_manifest_locked(count)
    }

    fn write_manifest_locked(&self, count: usize) -> NvResult<()> {
        let manifest = encode_manifest(&self.format, *self.level.lock(), count)?;
        self.medium.write_meta(&self.name, &manifest)
    }

    fn check_index(&self, index: usize, count: usize) -> NvResult<()> {
        if index < count {
            Ok(())
        } else {
            Err(NvError::IndexOutOfRange {
                block: self.name.clone(),
                index,
                count,
            })
        }
    }

    fn require_field(&self, name: &str) -> NvResult<&FieldSchema> {
        self.format.field(name).ok_or_else(|| NvError::FieldNotFound {
            format: self.format.name().to_string(),
            field: name.to_string(),
        })
    }

    /// Byte range a field occupies within the committed buffer. Unbounded
    /// fields run from their offset to the element boundary.
    fn field_range(&self, index: usize, field: &FieldSchema) -> std::ops::Range<usize> {
        let element_size = self.format.element_size();
        let start = index * element_size + field.offset() as usize;
        let element_end = (index + 1) * element_size;
        let end = if field.size() <= 0 {
            element_end
        } else {
            (start + field.length_bytes()).min(element_end)
        };
        start..end.max(start)
    }
}

impl std::fmt::Debug for PersistentBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistentBlock")
            .field("name", &self.name)
            .field("level", &self.level())
            .field("count", &self.count())
            .field("element_size", &self.element_size())
            .finish()
    }
}

/// An in-progress update cycle holding the block's writer lock.
///
/// Writes stage into a shadow buffer; [`get`](Self::get) reads through the
/// shadow, while every other reader keeps seeing committed state. Dropping
/// the guard without committing is a rollback.
pub struct BlockUpdate<'a> {
    block: &'a PersistentBlock,
    _guard: MutexGuard<'a, ()>,
    /// (element index, field index) -> staged bytes, already clamped
    shadow: HashMap<(usize, usize), Vec<u8>>,
    /// Absolute offset -> prior committed bytes, for failed-commit undo
    undo: Vec<(usize, Vec<u8>)>,
}

impl<'a> BlockUpdate<'a> {
    pub fn block_name(&self) -> &str {
        self.block.name()
    }

    /// Read a field: the staged value if written this cycle, otherwise the
    /// last committed value.
    pub fn get(&self, index: usize, field_name: &str) -> NvResult<FieldValue> {
        let state = self.block.state.read();
        self.block.check_index(index, state.count)?;
        let field_index = self
            .block
            .format
            .index_of(field_name)
            .ok_or_else(|| NvError::FieldNotFound {
                format: self.block.format.name().to_string(),
                field: field_name.to_string(),
            })?;

        if let Some(staged) = self.shadow.get(&(index, field_index)) {
            return self.block.format.convert(field_name, staged);
        }

        let field = self.block.format.field_at(field_index);
        let range = self.block.field_range(index, field);
        self.block.format.convert(field_name, &state.bytes[range])
    }

    /// Stage a field write. Nothing is visible or durable until commit.
    pub fn set(&mut self, index: usize, field_name: &str, value: &FieldValue) -> NvResult<()> {
        let count = self.block.state.read().count;
        self.block.check_index(index, count)?;
        let field_index = self
            .block
            .format
            .index_of(field_name)
            .ok_or_else(|| NvError::FieldNotFound {
                format: self.block.format.name().to_string(),
                field: field_name.to_string(),
            })?;

        let mut bytes = self.block.format.convert_to(field_name, value)?;

        // Unbounded encodings own the element tail: clamp at the boundary
        // and zero-fill the rest so a shorter rewrite leaves no residue
        let field = self.block.format.field_at(field_index);
        let range = self.block.field_range(index, field);
        bytes.truncate(range.end - range.start);
        if field.size() <= 0 {
            bytes.resize(range.end - range.start, 0);
        }

        self.shadow.insert((index, field_index), bytes);
        Ok(())
    }

    /// Publish every staged write: durable medium bytes first, then the
    /// in-RAM committed state. On failure the medium is restored from the
    /// undo log and nothing becomes visible.
    pub fn commit(mut self) -> NvResult<()> {
        match self.prepare() {
            Ok(()) => {
                self.publish();
                Ok(())
            }
            Err(e) => {
                self.undo_prepare();
                Err(e)
            }
        }
    }

    /// Discard every staged write and release the lock.
    pub fn rollback(self) {
        // Dropping the guard is the whole of it
    }

    /// Number of staged field writes.
    pub fn staged_len(&self) -> usize {
        self.shadow.len()
    }

    /// Phase one: write staged bytes to the medium, durably, recording the
    /// prior bytes for undo. Committed RAM state is untouched.
    pub(crate) fn prepare(&mut self) -> NvResult<()> {
        let state = self.block.state.read();

        // Deterministic write order regardless of hash iteration
        let mut keys: Vec<(usize, usize)> = self.shadow.keys().copied().collect();
        keys.sort_unstable();

        for key in keys {
            let staged = &self.shadow[&key];
            let field = self.block.format.field_at(key.1);
            let start = key.0 * self.block.format.element_size() + field.offset() as usize;

            let old = state.bytes[start..start + staged.len()].to_vec();
            self.block.medium.write(self.block.name(), start, staged)?;
            self.undo.push((start, old));
        }
        drop(state);

        if self.block.sync_writes {
            self.block.medium.flush(self.block.name())?;
        }
        Ok(())
    }

    /// Phase two: fold the staged bytes into committed RAM state. Infallible.
    pub(crate) fn publish(self) {
        let mut state = self.block.state.write();
        for ((index, field_index), staged) in &self.shadow {
            let field = self.block.format.field_at(*field_index);
            let start = index * self.block.format.element_size() + field.offset() as usize;
            state.bytes[start..start + staged.len()].copy_from_slice(staged);
        }
    }

    /// Best-effort restoration of the medium after a failed prepare.
    pub(crate) fn undo_prepare(&mut self) {
        for (offset, old) in self.undo.drain(..).rev() {
            if let Err(e) = self.block.medium.write(self.block.name(), offset, &old) {
                tracing::warn!(
                    block = self.block.name(),
                    offset,
                    error = %e,
                    "failed to restore bytes while undoing a commit"
                );
            }
        }
        if self.block.sync_writes {
            let _ = self.block.medium.flush(self.block.name());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::medium::{MemoryMedium, StorageMedium};
    use crate::value::FieldKind;

    fn meter_format() -> Arc<BlockFormat> {
        let mut format = BlockFormat::new("meter");
        format
            .push_field(FieldSchema::new("count", FieldKind::Int32).at_offset(0))
            .unwrap();
        format.push_field(FieldSchema::text("label", 8)).unwrap();
        format.finalize_layout();
        Arc::new(format)
    }

    fn test_block(count: usize) -> (Arc<PersistentBlock>, Arc<MemoryMedium>) {
        let format = meter_format();
        let medium = Arc::new(MemoryMedium::new());
        let len = count * format.element_size();
        medium.create("meter1", &[], len).unwrap();

        let block = Arc::new(PersistentBlock::new(
            "meter1".to_string(),
            format,
            PersistenceLevel::Critical,
            count,
            vec![0u8; len],
            Arc::clone(&medium) as Arc<dyn StorageMedium>,
            Arc::new(EventHub::new()),
            true,
        ));
        (block, medium)
    }

    #[test]
    fn test_fresh_block_reads_zero_values() {
        let (block, _) = test_block(1);
        assert_eq!(block.read(0, "count").unwrap(), FieldValue::Int32(0));
        assert_eq!(block.read(0, "label").unwrap(), FieldValue::Text(String::new()));
    }

    #[test]
    fn test_write_and_read_back() {
        let (block, _) = test_block(1);
        block.write(0, "count", &FieldValue::Int32(5)).unwrap();
        block.write(0, "label", &FieldValue::Text("abc".into())).unwrap();

        assert_eq!(block.read(0, "count").unwrap(), FieldValue::Int32(5));
        assert_eq!(block.read(0, "label").unwrap(), FieldValue::Text("abc".into()));
    }

    #[test]
    fn test_commit_writes_medium_before_ram() {
        let (block, medium) = test_block(1);
        block.write(0, "count", &FieldValue::Int32(0x01020304)).unwrap();

        // The medium holds the committed little-endian bytes
        let stored = medium.read("meter1", 0, 4).unwrap();
        assert_eq!(stored, vec![0x04, 0x03, 0x02, 0x01]);
    }

    #[test]
    fn test_shadow_invisible_until_commit() {
        let (block, _) = test_block(1);

        let mut update = block.start_update(true).unwrap();
        update.set(0, "count", &FieldValue::Int32(42)).unwrap();

        // The updater sees its own staged value; committed state does not
        assert_eq!(update.get(0, "count").unwrap(), FieldValue::Int32(42));
        assert_eq!(block.read(0, "count").unwrap(), FieldValue::Int32(0));

        update.commit().unwrap();
        assert_eq!(block.read(0, "count").unwrap(), FieldValue::Int32(42));
    }

    #[test]
    fn test_rollback_discards_staged_writes() {
        let (block, medium) = test_block(1);

        let mut update = block.start_update(true).unwrap();
        update.set(0, "count", &FieldValue::Int32(99)).unwrap();
        update.rollback();

        assert_eq!(block.read(0, "count").unwrap(), FieldValue::Int32(0));
        assert_eq!(medium.read("meter1", 0, 4).unwrap(), vec![0u8; 4]);
    }

    #[test]
    fn test_drop_without_commit_is_rollback() {
        let (block, _) = test_block(1);
        {
            let mut update = block.start_update(true).unwrap();
            update.set(0, "count", &FieldValue::Int32(7)).unwrap();
        }
        assert_eq!(block.read(0, "count").unwrap(), FieldValue::Int32(0));

        // And the lock is free again
        block.start_update(false).unwrap();
    }

    #[test]
    fn test_nonblocking_start_update_fails_while_locked() {
        let (block, _) = test_block(1);
        let _held = block.start_update(true).unwrap();

        match block.start_update(false) {
            Err(NvError::UpdateLockHeld { block }) => assert_eq!(block, "meter1"),
            other => panic!("expected UpdateLockHeld, got {:?}", other.map(|_| ())),
        };
    }

    #[test]
    fn test_elements_are_independent() {
        let (block, _) = test_block(3);
        block.write(1, "count", &FieldValue::Int32(11)).unwrap();
        block.write(2, "label", &FieldValue::Text("two".into())).unwrap();

        assert_eq!(block.read(0, "count").unwrap(), FieldValue::Int32(0));
        assert_eq!(block.read(1, "count").unwrap(), FieldValue::Int32(11));
        assert_eq!(block.read(1, "label").unwrap(), FieldValue::Text(String::new()));
        assert_eq!(block.read(2, "label").unwrap(), FieldValue::Text("two".into()));
    }

    #[test]
    fn test_index_out_of_range() {
        let (block, _) = test_block(2);
        assert!(matches!(
            block.read(2, "count"),
            Err(NvError::IndexOutOfRange { index: 2, count: 2, .. })
        ));
        assert!(matches!(
            block.write(5, "count", &FieldValue::Int32(1)),
            Err(NvError::IndexOutOfRange { .. })
        ));
    }

    #[test]
    fn test_unknown_field() {
        let (block, _) = test_block(1);
        assert!(matches!(
            block.read(0, "missing"),
            Err(NvError::FieldNotFound { .. })
        ));
    }

    #[test]
    fn test_resize_preserves_and_zero_fills() {
        let (block, _) = test_block(1);
        block.write(0, "count", &FieldValue::Int32(5)).unwrap();
        block.write(0, "label", &FieldValue::Text("abc".into())).unwrap();

        block.resize(2).unwrap();
        assert_eq!(block.count(), 2);
        assert_eq!(block.read(0, "count").unwrap(), FieldValue::Int32(5));
        assert_eq!(block.read(0, "label").unwrap(), FieldValue::Text("abc".into()));
        assert_eq!(block.read(1, "count").unwrap(), FieldValue::Int32(0));
        assert_eq!(block.read(1, "label").unwrap(), FieldValue::Text(String::new()));

        block.resize(1).unwrap();
        assert_eq!(block.count(), 1);
        assert!(block.read(1, "count").is_err());
    }

    #[test]
    fn test_manifest_roundtrip() {
        let format = meter_format();
        let manifest = encode_manifest(&format, PersistenceLevel::Critical, 3).unwrap();

        let (level, count, rebuilt) = decode_manifest("meter1", &manifest).unwrap();
        assert_eq!(level, PersistenceLevel::Critical);
        assert_eq!(count, 3);
        assert_eq!(rebuilt.name(), "meter");
        assert_eq!(rebuilt.element_size(), format.element_size());
        assert_eq!(
            rebuilt.field("label").unwrap().offset(),
            format.field("label").unwrap().offset()
        );
    }

    #[test]
    fn test_manifest_rejects_garbage() {
        assert!(matches!(
            decode_manifest("b", &[1, 2, 3]),
            Err(NvError::CorruptManifest { .. })
        ));

        let format = meter_format();
        let mut manifest = encode_manifest(&format, PersistenceLevel::Static, 1).unwrap();
        manifest[2] = 9; // nonsense level
        assert!(matches!(
            decode_manifest("b", &manifest),
            Err(NvError::CorruptManifest { .. })
        ));
    }
}
