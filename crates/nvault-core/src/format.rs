//! Block format — ordered field list plus the layout engine
//!
//! A `BlockFormat` describes one block shape: its fields, their assigned
//! byte offsets, and the resulting element size. Formats are built
//! field-by-field, finalized exactly once, then shared read-only across
//! every block of that shape.
//!
//! Layout finalization packs auto-placed fields around explicitly-pinned
//! ones. The packing order is part of the on-medium contract: stored data
//! from older builds is addressed by these offsets, so the algorithm below
//! must stay byte-for-byte stable, tie-breaks included.

use hashbrown::HashMap;

use crate::codec;
use crate::error::{NvError, NvResult};
use crate::schema::FieldSchema;
use crate::value::{FieldKind, FieldValue};

/// One block shape: named fields with a finalized byte layout.
#[derive(Debug, Clone)]
pub struct BlockFormat {
    name: String,
    version: u16,
    fields: Vec<FieldSchema>,
    index: HashMap<String, usize>,
    element_size: usize,
    /// Floor for the element size; gives unbounded tail fields their room
    min_element_size: usize,
    finalized: bool,
}

impl BlockFormat {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: 1,
            fields: Vec::new(),
            index: HashMap::new(),
            element_size: 0,
            min_element_size: 0,
            finalized: false,
        }
    }

    /// Set the schema version recorded in persisted manifests.
    pub fn with_version(mut self, version: u16) -> Self {
        self.version = version;
        self
    }

    /// Reserve at least this many bytes per element, regardless of what the
    /// fields add up to. This is how an unbounded tail field gets capacity.
    pub fn with_element_size(mut self, size: usize) -> Self {
        self.min_element_size = size;
        self
    }

    /// Rebuild a format from fields loaded out of a persisted manifest.
    /// Loaded fields carry explicit offsets, so finalization preserves the
    /// stored layout exactly.
    pub fn from_fields(
        name: impl Into<String>,
        version: u16,
        fields: Vec<FieldSchema>,
    ) -> NvResult<Self> {
        let mut format = Self::new(name);
        format.version = version;
        for field in fields {
            format.push_field(field)?;
        }
        format.finalize_layout();
        Ok(format)
    }

    /// Add a field. Fails once the layout is finalized — call
    /// [`reopen_layout`](Self::reopen_layout) first, which forces a full
    /// re-run of the algorithm since offsets are interdependent.
    pub fn push_field(&mut self, field: FieldSchema) -> NvResult<()> {
        if self.finalized {
            return Err(NvError::InvalidSchema {
                format: self.name.clone(),
                reason: format!(
                    "cannot add field '{}' to a finalized layout; reopen it first",
                    field.name()
                ),
            });
        }
        if field.kind() == FieldKind::Unused {
            return Err(NvError::InvalidSchema {
                format: self.name.clone(),
                reason: format!("field '{}' declared with the Unused kind", field.name()),
            });
        }
        if field.name().is_empty() || field.name().len() > 255 {
            return Err(NvError::InvalidSchema {
                format: self.name.clone(),
                reason: format!("field name '{}' must be 1..=255 bytes", field.name()),
            });
        }
        if self.index.contains_key(field.name()) {
            return Err(NvError::InvalidSchema {
                format: self.name.clone(),
                reason: format!("duplicate field name '{}'", field.name()),
            });
        }

        self.index.insert(field.name().to_string(), self.fields.len());
        self.fields.push(field);
        Ok(())
    }

    /// Allow fields to be added again. The next finalize re-runs the whole
    /// algorithm; auto-placed fields may move, pinned ones never do.
    pub fn reopen_layout(&mut self) {
        self.finalized = false;
    }

    /// Assign offsets to every auto-placed field. Idempotent: a second call
    /// on a finalized layout changes nothing.
    ///
    /// Pinned fields keep their declared offsets (legacy/protocol-mandated
    /// positions). Auto-placed fields fill the gaps before each pinned
    /// field — candidates sorted ascending by length and tried from the
    /// largest that still fits, because the list is scanned from its end —
    /// and whatever remains is appended after the last pinned field in
    /// declaration order.
    pub fn finalize_layout(&mut self) {
        if self.finalized {
            return;
        }

        for field in &mut self.fields {
            field.apply_default_size();
        }

        let mut placed: Vec<usize> = Vec::new();
        let mut unplaced: Vec<usize> = Vec::new();
        for (i, field) in self.fields.iter().enumerate() {
            if field.has_default_offset() {
                unplaced.push(i);
            } else {
                placed.push(i);
            }
        }

        placed.sort_by_key(|&i| self.fields[i].offset());
        // Stable sort: equal lengths keep declaration order
        unplaced.sort_by_key(|&i| self.fields[i].length_bytes());

        let mut cursor: usize = 0;
        for &p in &placed {
            let mut available = (self.fields[p].offset() as usize).saturating_sub(cursor);

            // Scan the unplaced list from its end so the largest field that
            // still fits the gap is placed first. Zero-length (unbounded)
            // fields never fill a gap; they belong at the tail.
            let mut i = unplaced.len();
            while i > 0 {
                i -= 1;
                let len = self.fields[unplaced[i]].length_bytes();
                if len > 0 && len <= available {
                    self.fields[unplaced[i]].assign_offset(cursor as u16);
                    cursor += len;
                    available -= len;
                    unplaced.remove(i);
                }
            }

            cursor = self.fields[p].offset() as usize + self.fields[p].length_bytes();
        }

        // Whatever did not fit a gap is appended in declaration order
        unplaced.sort_unstable();
        for &u in &unplaced {
            self.fields[u].assign_offset(cursor as u16);
            cursor += self.fields[u].length_bytes();
        }

        self.element_size = self
            .fields
            .iter()
            .map(|f| f.offset() as usize + f.length_bytes())
            .max()
            .unwrap_or(0)
            .max(self.min_element_size);
        self.finalized = true;
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> u16 {
        self.version
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    /// Bytes one array element occupies under the finalized layout.
    pub fn element_size(&self) -> usize {
        self.element_size
    }

    pub fn field_count(&self) -> usize {
        self.fields.len()
    }

    pub fn fields(&self) -> &[FieldSchema] {
        &self.fields
    }

    /// O(1) lookup by field name.
    pub fn field(&self, name: &str) -> Option<&FieldSchema> {
        self.index.get(name).map(|&i| &self.fields[i])
    }

    pub fn kind_of(&self, name: &str) -> Option<FieldKind> {
        self.field(name).map(FieldSchema::kind)
    }

    pub(crate) fn index_of(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    pub(crate) fn field_at(&self, index: usize) -> &FieldSchema {
        &self.fields[index]
    }

    fn require_finalized(&self) -> NvResult<()> {
        if self.finalized {
            Ok(())
        } else {
            Err(NvError::LayoutNotFinalized {
                format: self.name.clone(),
            })
        }
    }

    fn require_field(&self, name: &str) -> NvResult<&FieldSchema> {
        self.field(name).ok_or_else(|| NvError::FieldNotFound {
            format: self.name.clone(),
            field: name.to_string(),
        })
    }

    /// Decode the stored bytes of a field into a typed value. Array fields
    /// yield a homogeneous [`FieldValue::Array`].
    pub fn convert(&self, field_name: &str, bytes: &[u8]) -> NvResult<FieldValue> {
        self.require_finalized()?;
        let field = self.require_field(field_name)?;

        if field.count() == 0 {
            Ok(codec::decode(field.kind(), bytes))
        } else {
            Ok(FieldValue::Array(codec::decode_array(
                field.kind(),
                field.size().max(0) as usize,
                field.count() as usize,
                bytes,
            )))
        }
    }

    /// Encode a typed value into exactly the field's byte budget —
    /// truncated or zero-padded as needed. Unbounded fields (`size <= 0`)
    /// come back exactly as encoded, unclamped.
    pub fn convert_to(&self, field_name: &str, value: &FieldValue) -> NvResult<Vec<u8>> {
        self.require_finalized()?;
        let field = self.require_field(field_name)?;

        if field.count() == 0 {
            if matches!(value, FieldValue::Array(_)) {
                return Err(NvError::TypeMismatch {
                    field: field.name().to_string(),
                    expected: field.kind(),
                });
            }
            check_kind(field, value)?;
            let mut bytes = codec::encode(value);
            if field.size() > 0 {
                bytes.resize(field.size() as usize, 0);
            }
            Ok(bytes)
        } else {
            let items = match value {
                FieldValue::Array(items) => items,
                _ => {
                    return Err(NvError::TypeMismatch {
                        field: field.name().to_string(),
                        expected: field.kind(),
                    })
                }
            };

            let size = field.size().max(0) as usize;
            let mut bytes = Vec::with_capacity(field.length_bytes());
            for item in items.iter().take(field.count() as usize) {
                check_kind(field, item)?;
                let mut chunk = codec::encode(item);
                chunk.resize(size, 0);
                bytes.extend_from_slice(&chunk);
            }
            bytes.resize(field.length_bytes(), 0);
            Ok(bytes)
        }
    }
}

/// A value satisfies a field when the kinds line up; the two text kinds are
/// interchangeable on the value side.
fn check_kind(field: &FieldSchema, value: &FieldValue) -> NvResult<()> {
    let ok = match (field.kind(), value) {
        (FieldKind::Text | FieldKind::UnboundedText, FieldValue::Text(_)) => true,
        (kind, value) => value.kind() == Some(kind),
    };

    if ok {
        Ok(())
    } else {
        Err(NvError::TypeMismatch {
            field: field.name().to_string(),
            expected: field.kind(),
        })
    }
}
