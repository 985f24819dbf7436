//! Binary field codec
//!
//! Pure conversions between `FieldValue` and the little-endian byte
//! representation stored inside a block. Decoding is total: a slice shorter
//! than the kind's native width is treated as if the missing high-order
//! bytes were zero, so data written by an older, narrower schema reads back
//! correctly under a wider one. A longer slice uses only its first bytes.
//!
//! Truncation/padding of the *encoded* side to a field's byte budget is the
//! block format's job (`BlockFormat::convert_to`), not the codec's.

use crate::value::{FieldKind, FieldValue};

/// Copy up to N bytes into a zeroed buffer. Little-endian, so missing
/// trailing bytes are missing high-order bytes.
fn fixed<const N: usize>(bytes: &[u8]) -> [u8; N] {
    let mut buf = [0u8; N];
    let take = bytes.len().min(N);
    buf[..take].copy_from_slice(&bytes[..take]);
    buf
}

/// Decode one scalar value of the given kind from a byte slice.
pub fn decode(kind: FieldKind, bytes: &[u8]) -> FieldValue {
    match kind {
        // Schema construction rejects Unused fields; nothing is ever stored
        FieldKind::Unused => FieldValue::Byte(0),

        FieldKind::Int32 => FieldValue::Int32(i32::from_le_bytes(fixed::<4>(bytes))),
        FieldKind::Int16 => FieldValue::Int16(i16::from_le_bytes(fixed::<2>(bytes))),
        FieldKind::Byte => FieldValue::Byte(fixed::<1>(bytes)[0]),
        FieldKind::Int64 => FieldValue::Int64(i64::from_le_bytes(fixed::<8>(bytes))),
        FieldKind::UInt16 => FieldValue::UInt16(u16::from_le_bytes(fixed::<2>(bytes))),
        FieldKind::UInt32 => FieldValue::UInt32(u32::from_le_bytes(fixed::<4>(bytes))),
        FieldKind::UInt64 => FieldValue::UInt64(u64::from_le_bytes(fixed::<8>(bytes))),
        FieldKind::Float32 => FieldValue::Float32(f32::from_le_bytes(fixed::<4>(bytes))),
        FieldKind::Float64 => FieldValue::Float64(f64::from_le_bytes(fixed::<8>(bytes))),

        // Empty input is an unwritten field, which reads as false
        FieldKind::Bool => FieldValue::Bool(!bytes.is_empty() && bytes[0] != 0),

        // UTC microseconds since the Unix epoch
        FieldKind::Timestamp => FieldValue::Timestamp(i64::from_le_bytes(fixed::<8>(bytes))),

        // Total milliseconds
        FieldKind::Duration => FieldValue::Duration(f64::from_le_bytes(fixed::<8>(bytes))),

        // Anything that is not exactly 16 bytes reads as the zero uuid
        FieldKind::Uuid => {
            if bytes.len() == 16 {
                let mut id = [0u8; 16];
                id.copy_from_slice(bytes);
                FieldValue::Uuid(id)
            } else {
                FieldValue::Uuid([0u8; 16])
            }
        }

        FieldKind::Text | FieldKind::UnboundedText => {
            let text = String::from_utf8_lossy(bytes);
            FieldValue::Text(text.trim_end_matches('\0').to_string())
        }
    }
}

/// Encode a value to its little-endian byte representation.
///
/// The result is unclamped: a Text value yields exactly its UTF-8 bytes,
/// and an Array value yields its elements' encodings concatenated in order.
pub fn encode(value: &FieldValue) -> Vec<u8> {
    match value {
        FieldValue::Int32(v) => v.to_le_bytes().to_vec(),
        FieldValue::Int16(v) => v.to_le_bytes().to_vec(),
        FieldValue::Byte(v) => vec![*v],
        FieldValue::Int64(v) => v.to_le_bytes().to_vec(),
        FieldValue::Text(s) => s.as_bytes().to_vec(),
        FieldValue::Bool(b) => vec![u8::from(*b)],
        FieldValue::Timestamp(v) => v.to_le_bytes().to_vec(),
        FieldValue::UInt16(v) => v.to_le_bytes().to_vec(),
        FieldValue::UInt32(v) => v.to_le_bytes().to_vec(),
        FieldValue::UInt64(v) => v.to_le_bytes().to_vec(),
        FieldValue::Uuid(id) => id.to_vec(),
        FieldValue::Duration(v) => v.to_le_bytes().to_vec(),
        FieldValue::Float32(v) => v.to_le_bytes().to_vec(),
        FieldValue::Float64(v) => v.to_le_bytes().to_vec(),
        FieldValue::Array(items) => {
            let mut out = Vec::new();
            for item in items {
                out.extend_from_slice(&encode(item));
            }
            out
        }
    }
}

/// Decode a homogeneous array field: `count` elements of `size` bytes each.
///
/// Missing trailing bytes are treated as zero-filled, per the same
/// forward-compatibility rule as scalar decoding.
pub fn decode_array(kind: FieldKind, size: usize, count: usize, bytes: &[u8]) -> Vec<FieldValue> {
    let mut items = Vec::with_capacity(count);
    for i in 0..count {
        let start = (i * size).min(bytes.len());
        let end = ((i + 1) * size).min(bytes.len());
        items.push(decode(kind, &bytes[start..end]));
    }
    items
}
