//! Field schema — the description of one block field
//!
//! A `FieldSchema` carries a field's kind, per-element byte size, array
//! count, byte offset and name. Offsets are assigned once by the block
//! format's layout engine and never move afterwards, because stored data
//! is addressed by them.
//!
//! Schemas persist as a fixed binary record so a block's shape can be
//! rebuilt from the medium without the declaring code:
//!
//! ```text
//! [0]     kind      (enum ordinal)
//! [1]     size      (0xFF = unbounded, 0 = kind default)
//! [2..4]  count     u16 LE
//! [4..6]  offset    u16 LE
//! [6]     name_len
//! [7..]   name      UTF-8
//! ```

use crate::error::{NvError, NvResult};
use crate::value::FieldKind;

/// Fixed portion of a field record, before the name bytes.
pub const RECORD_HEADER_LEN: usize = 7;

/// Sentinel size byte for unbounded fields.
const SIZE_UNBOUNDED: u8 = 0xFF;

/// One field of a block format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldSchema {
    name: String,
    kind: FieldKind,
    /// Bytes per element; -1 for unbounded (consumer-supplied length)
    size: i16,
    /// 0 = scalar, >0 = homogeneous array of `count` elements
    count: u16,
    /// Byte offset within one block element
    offset: u16,
    /// True until an explicit offset is assigned by the schema author
    default_offset: bool,
}

impl FieldSchema {
    /// Declare a scalar field with the kind's standard size.
    pub fn new(name: impl Into<String>, kind: FieldKind) -> Self {
        Self {
            name: name.into(),
            kind,
            size: kind.default_size(),
            count: 0,
            offset: 0,
            default_offset: true,
        }
    }

    /// Declare a homogeneous array field of `count` elements.
    pub fn array(name: impl Into<String>, kind: FieldKind, count: u16) -> Self {
        let mut field = Self::new(name, kind);
        field.count = count;
        field
    }

    /// Declare a fixed-budget text field.
    pub fn text(name: impl Into<String>, size: u16) -> Self {
        let mut field = Self::new(name, FieldKind::Text);
        field.size = size as i16;
        field
    }

    /// Override the per-element byte size.
    pub fn with_size(mut self, size: i16) -> Self {
        self.size = size;
        self
    }

    /// Pin this field at an explicit byte offset. Pinned fields are left
    /// untouched by layout finalization; auto-placed fields pack around
    /// them.
    pub fn at_offset(mut self, offset: u16) -> Self {
        self.offset = offset;
        self.default_offset = false;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> FieldKind {
        self.kind
    }

    /// Bytes per element; -1 means unbounded.
    pub fn size(&self) -> i16 {
        self.size
    }

    pub fn count(&self) -> u16 {
        self.count
    }

    pub fn offset(&self) -> u16 {
        self.offset
    }

    /// True while the field still awaits auto-placement.
    pub fn has_default_offset(&self) -> bool {
        self.default_offset
    }

    /// Total bytes this field occupies in one block element. Unbounded
    /// fields report zero; they own whatever tail the element leaves them.
    pub fn length_bytes(&self) -> usize {
        let size = self.size.max(0) as usize;
        if self.count == 0 {
            size
        } else {
            size * self.count as usize
        }
    }

    pub(crate) fn assign_offset(&mut self, offset: u16) {
        self.offset = offset;
    }

    pub(crate) fn apply_default_size(&mut self) {
        if self.size == 0 {
            self.size = self.kind.default_size();
        }
    }

    /// Serialize to the fixed binary record.
    pub fn to_record(&self) -> NvResult<Vec<u8>> {
        if self.name.len() > 255 {
            return Err(NvError::InvalidSchema {
                format: self.name.clone(),
                reason: format!("field name is {} bytes, limit is 255", self.name.len()),
            });
        }

        let size_byte = if self.size < 0 {
            SIZE_UNBOUNDED
        } else if self.size == self.kind.default_size() {
            // The kind default round-trips as zero and is re-derived on load,
            // which keeps budgets above one byte (Text's 1024) representable
            0
        } else if self.size <= 254 {
            self.size as u8
        } else {
            return Err(NvError::InvalidSchema {
                format: self.name.clone(),
                reason: format!("explicit size {} does not fit the one-byte record field", self.size),
            });
        };

        let mut record = Vec::with_capacity(RECORD_HEADER_LEN + self.name.len());
        record.push(self.kind as u8);
        record.push(size_byte);
        record.extend_from_slice(&self.count.to_le_bytes());
        record.extend_from_slice(&self.offset.to_le_bytes());
        record.push(self.name.len() as u8);
        record.extend_from_slice(self.name.as_bytes());
        Ok(record)
    }

    /// Parse one record from the front of `bytes`. Returns the field and the
    /// number of bytes consumed. Loaded fields carry their stored offset as
    /// explicit, so a persisted layout never re-packs.
    pub fn from_record(bytes: &[u8]) -> NvResult<(FieldSchema, usize)> {
        if bytes.len() < RECORD_HEADER_LEN {
            return Err(record_error(0, format!(
                "record too short: {} bytes, need at least {}",
                bytes.len(),
                RECORD_HEADER_LEN
            )));
        }

        let kind = FieldKind::from_raw(bytes[0])
            .ok_or_else(|| record_error(0, format!("unknown field kind {}", bytes[0])))?;

        let size = match bytes[1] {
            SIZE_UNBOUNDED => -1,
            0 => kind.default_size(),
            n => n as i16,
        };

        let count = u16::from_le_bytes([bytes[2], bytes[3]]);
        let offset = u16::from_le_bytes([bytes[4], bytes[5]]);
        let name_len = bytes[6] as usize;

        let consumed = RECORD_HEADER_LEN + name_len;
        if bytes.len() < consumed {
            return Err(record_error(RECORD_HEADER_LEN, format!(
                "record needs {} name bytes, only {} available",
                name_len,
                bytes.len() - RECORD_HEADER_LEN
            )));
        }

        let name = std::str::from_utf8(&bytes[RECORD_HEADER_LEN..consumed])
            .map_err(|e| record_error(RECORD_HEADER_LEN, format!("field name is not UTF-8: {}", e)))?
            .to_string();

        Ok((
            FieldSchema {
                name,
                kind,
                size,
                count,
                offset,
                default_offset: false,
            },
            consumed,
        ))
    }
}

/// Record parse failure; the manifest parser rewraps with block context.
fn record_error(offset: usize, reason: String) -> NvError {
    NvError::CorruptManifest {
        block: String::new(),
        offset,
        reason,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_roundtrip_explicit_size() {
        let field = FieldSchema::text("label", 8).at_offset(4);
        let record = field.to_record().unwrap();

        let (parsed, consumed) = FieldSchema::from_record(&record).unwrap();
        assert_eq!(consumed, record.len());
        assert_eq!(parsed.name(), "label");
        assert_eq!(parsed.kind(), FieldKind::Text);
        assert_eq!(parsed.size(), 8);
        assert_eq!(parsed.offset(), 4);
        assert!(!parsed.has_default_offset());
    }

    #[test]
    fn test_record_default_size_roundtrips_via_zero() {
        let field = FieldSchema::new("note", FieldKind::Text).at_offset(0);
        let record = field.to_record().unwrap();
        assert_eq!(record[1], 0, "kind-default sizes persist as zero");

        let (parsed, _) = FieldSchema::from_record(&record).unwrap();
        assert_eq!(parsed.size(), 1024);
    }

    #[test]
    fn test_record_unbounded_sentinel() {
        let field = FieldSchema::new("tail", FieldKind::UnboundedText).at_offset(16);
        let record = field.to_record().unwrap();
        assert_eq!(record[1], 0xFF);

        let (parsed, _) = FieldSchema::from_record(&record).unwrap();
        assert_eq!(parsed.size(), -1);
    }

    #[test]
    fn test_record_array_field() {
        let field = FieldSchema::array("credits", FieldKind::Int64, 12).at_offset(32);
        let record = field.to_record().unwrap();

        let (parsed, _) = FieldSchema::from_record(&record).unwrap();
        assert_eq!(parsed.count(), 12);
        assert_eq!(parsed.length_bytes(), 96);
    }

    #[test]
    fn test_record_rejects_unrepresentable_size() {
        let field = FieldSchema::text("big", 300);
        assert!(matches!(
            field.to_record(),
            Err(NvError::InvalidSchema { .. })
        ));
    }

    #[test]
    fn test_record_parse_truncated() {
        let field = FieldSchema::new("counter", FieldKind::Int32).at_offset(0);
        let record = field.to_record().unwrap();

        assert!(FieldSchema::from_record(&record[..3]).is_err());
        assert!(FieldSchema::from_record(&record[..record.len() - 1]).is_err());
    }

    #[test]
    fn test_record_parse_unknown_kind() {
        let field = FieldSchema::new("counter", FieldKind::Int32).at_offset(0);
        let mut record = field.to_record().unwrap();
        record[0] = 0xEE;

        assert!(matches!(
            FieldSchema::from_record(&record),
            Err(NvError::CorruptManifest { .. })
        ));
    }

    #[test]
    fn test_record_sequence_parse() {
        let a = FieldSchema::new("a", FieldKind::Int16).at_offset(0);
        let b = FieldSchema::text("b", 32).at_offset(2);

        let mut buf = a.to_record().unwrap();
        buf.extend_from_slice(&b.to_record().unwrap());

        let (first, used) = FieldSchema::from_record(&buf).unwrap();
        let (second, _) = FieldSchema::from_record(&buf[used..]).unwrap();
        assert_eq!(first.name(), "a");
        assert_eq!(second.name(), "b");
    }

    #[test]
    fn test_length_bytes() {
        assert_eq!(FieldSchema::new("x", FieldKind::Int32).length_bytes(), 4);
        assert_eq!(FieldSchema::array("x", FieldKind::Int32, 3).length_bytes(), 12);
        assert_eq!(FieldSchema::new("x", FieldKind::UnboundedText).length_bytes(), 0);
    }
}
