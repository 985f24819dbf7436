//! Field kinds and typed field values
//!
//! `FieldKind` is the persisted type tag for a block field. Its ordinals are
//! written into schema records on disk and MUST never be renumbered.
//!
//! `FieldValue` is the in-memory representation: one variant per kind, so
//! every conversion is an exhaustive match instead of a runtime cast.

/// Persisted field type tag.
///
/// Ordinal-stable: these discriminants appear in stored schema records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FieldKind {
    /// Placeholder for retired fields; carries no data
    Unused = 0,
    Int32 = 1,
    Int16 = 2,
    Byte = 3,
    Int64 = 4,
    /// Fixed-budget UTF-8 string (default budget 1024 bytes)
    Text = 5,
    Bool = 6,
    /// UTC instant, microseconds since the Unix epoch, signed 64-bit
    Timestamp = 7,
    UInt16 = 8,
    UInt32 = 9,
    UInt64 = 10,
    Uuid = 11,
    /// Elapsed time as a double of total milliseconds
    Duration = 12,
    /// UTF-8 string with consumer-supplied length (no fixed budget)
    UnboundedText = 13,
    Float32 = 14,
    Float64 = 15,
}

impl FieldKind {
    /// Parse a persisted ordinal back into a kind.
    pub fn from_raw(raw: u8) -> Option<FieldKind> {
        match raw {
            0 => Some(FieldKind::Unused),
            1 => Some(FieldKind::Int32),
            2 => Some(FieldKind::Int16),
            3 => Some(FieldKind::Byte),
            4 => Some(FieldKind::Int64),
            5 => Some(FieldKind::Text),
            6 => Some(FieldKind::Bool),
            7 => Some(FieldKind::Timestamp),
            8 => Some(FieldKind::UInt16),
            9 => Some(FieldKind::UInt32),
            10 => Some(FieldKind::UInt64),
            11 => Some(FieldKind::Uuid),
            12 => Some(FieldKind::Duration),
            13 => Some(FieldKind::UnboundedText),
            14 => Some(FieldKind::Float32),
            15 => Some(FieldKind::Float64),
            _ => None,
        }
    }

    /// Default per-kind byte size. Text gets the 1024-byte budget,
    /// UnboundedText has no fixed size (-1), Unused carries nothing.
    pub fn default_size(self) -> i16 {
        match self {
            FieldKind::Unused => 0,
            FieldKind::Int32 => 4,
            FieldKind::Int16 => 2,
            FieldKind::Byte => 1,
            FieldKind::Int64 => 8,
            FieldKind::Text => 1024,
            FieldKind::Bool => 1,
            FieldKind::Timestamp => 8,
            FieldKind::UInt16 => 2,
            FieldKind::UInt32 => 4,
            FieldKind::UInt64 => 8,
            FieldKind::Uuid => 16,
            FieldKind::Duration => 8,
            FieldKind::UnboundedText => -1,
            FieldKind::Float32 => 4,
            FieldKind::Float64 => 8,
        }
    }
}

/// A typed field value.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Int32(i32),
    Int16(i16),
    Byte(u8),
    Int64(i64),
    Text(String),
    Bool(bool),
    /// UTC microseconds since the Unix epoch
    Timestamp(i64),
    UInt16(u16),
    UInt32(u32),
    UInt64(u64),
    Uuid([u8; 16]),
    /// Total milliseconds
    Duration(f64),
    Float32(f32),
    Float64(f64),
    /// Homogeneous array field (`count > 0` in the schema)
    Array(Vec<FieldValue>),
}

impl FieldValue {
    /// The kind this value satisfies. Array values report the kind of
    /// their first element; an empty array has no kind.
    pub fn kind(&self) -> Option<FieldKind> {
        match self {
            FieldValue::Int32(_) => Some(FieldKind::Int32),
            FieldValue::Int16(_) => Some(FieldKind::Int16),
            FieldValue::Byte(_) => Some(FieldKind::Byte),
            FieldValue::Int64(_) => Some(FieldKind::Int64),
            FieldValue::Text(_) => Some(FieldKind::Text),
            FieldValue::Bool(_) => Some(FieldKind::Bool),
            FieldValue::Timestamp(_) => Some(FieldKind::Timestamp),
            FieldValue::UInt16(_) => Some(FieldKind::UInt16),
            FieldValue::UInt32(_) => Some(FieldKind::UInt32),
            FieldValue::UInt64(_) => Some(FieldKind::UInt64),
            FieldValue::Uuid(_) => Some(FieldKind::Uuid),
            FieldValue::Duration(_) => Some(FieldKind::Duration),
            FieldValue::Float32(_) => Some(FieldKind::Float32),
            FieldValue::Float64(_) => Some(FieldKind::Float64),
            FieldValue::Array(items) => items.first().and_then(FieldValue::kind),
        }
    }

    pub fn as_i32(&self) -> Option<i32> {
        match self {
            FieldValue::Int32(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            FieldValue::Int64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            FieldValue::Text(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            FieldValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FieldValue::Float64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[FieldValue]> {
        match self {
            FieldValue::Array(items) => Some(items.as_slice()),
            _ => None,
        }
    }
}
