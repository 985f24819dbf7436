//! Error types for NVault operations
//!
//! All NVault errors are represented by the NvError enum, which provides
//! detailed context for debugging and recovery.

use std::error::Error;
use std::fmt;
use std::path::PathBuf;

use crate::value::FieldKind;

/// NVault error types with detailed context
#[derive(Debug, Clone)]
pub enum NvError {
    /// I/O operation failed in the backing medium
    Io {
        /// The file path where the error occurred, if the medium has one
        path: Option<PathBuf>,
        /// The underlying I/O error kind
        kind: std::io::ErrorKind,
        /// Human-readable description
        message: String,
    },

    /// No block with this name exists in the store
    BlockNotFound {
        /// The requested block name
        name: String,
    },

    /// A block with this name already exists
    DuplicateBlock {
        /// The conflicting block name
        name: String,
    },

    /// The bound block format has no field with this name
    FieldNotFound {
        /// Name of the format that was searched
        format: String,
        /// The missing field name
        field: String,
    },

    /// A field conversion was attempted before the layout was finalized
    LayoutNotFinalized {
        /// Name of the unfinalized format
        format: String,
    },

    /// The schema itself is malformed (author-time contract violation)
    InvalidSchema {
        /// Name of the offending format
        format: String,
        /// What is wrong with it
        reason: String,
    },

    /// A value of the wrong kind was supplied for a field
    TypeMismatch {
        /// The field being written
        field: String,
        /// The kind the field's schema expects
        expected: FieldKind,
    },

    /// An element index is outside the block's array dimension
    IndexOutOfRange {
        /// The block being accessed
        block: String,
        /// The requested element index
        index: usize,
        /// The block's element count
        count: usize,
    },

    /// A block was created or resized with a zero element count
    BlockSizeOutOfRange {
        /// The block being sized
        name: String,
        /// The rejected element count
        count: usize,
    },

    /// Block allocation would exceed the configured size limit
    OversizedBlock {
        /// The block being allocated
        name: String,
        /// Requested allocation in bytes
        requested_bytes: usize,
        /// Configured limit in bytes
        limit_bytes: usize,
    },

    /// The supplied configuration failed validation
    InvalidConfig {
        /// What is wrong with it
        reason: String,
    },

    /// The block's update lock is held elsewhere (non-blocking acquire)
    UpdateLockHeld {
        /// The contended block
        block: String,
    },

    /// A persisted block manifest cannot be parsed
    CorruptManifest {
        /// The block whose manifest is damaged
        block: String,
        /// Byte offset where parsing failed
        offset: usize,
        /// Description of the damage
        reason: String,
    },

    /// A container file is structurally damaged
    CorruptContainer {
        /// Path to the damaged container
        path: PathBuf,
        /// Byte offset where the damage was detected
        offset: u64,
        /// Description of the damage
        reason: String,
    },

    /// A medium read or write fell outside the block's data region
    OutOfBounds {
        /// The block being accessed
        block: String,
        /// Requested byte offset
        offset: usize,
        /// Requested length
        len: usize,
        /// The block's data length
        data_len: usize,
    },
}

impl fmt::Display for NvError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NvError::Io { path, kind, message } => {
                if let Some(path) = path {
                    write!(f, "I/O error in {}: {} ({})", path.display(), message, kind)
                } else {
                    write!(f, "I/O error: {} ({})", message, kind)
                }
            }

            NvError::BlockNotFound { name } => {
                write!(f, "Block '{}' not found", name)
            }

            NvError::DuplicateBlock { name } => {
                write!(f, "Block '{}' already exists", name)
            }

            NvError::FieldNotFound { format, field } => {
                write!(f, "Format '{}' has no field '{}'", format, field)
            }

            NvError::LayoutNotFinalized { format } => {
                write!(f, "Layout of format '{}' is not finalized", format)
            }

            NvError::InvalidSchema { format, reason } => {
                write!(f, "Invalid schema for format '{}': {}", format, reason)
            }

            NvError::TypeMismatch { field, expected } => {
                write!(f, "Field '{}' expects a {:?} value", field, expected)
            }

            NvError::IndexOutOfRange { block, index, count } => {
                write!(f, "Index {} out of range for block '{}' with {} elements",
                       index, block, count)
            }

            NvError::BlockSizeOutOfRange { name, count } => {
                write!(f, "Block '{}' cannot have {} elements", name, count)
            }

            NvError::OversizedBlock { name, requested_bytes, limit_bytes } => {
                write!(f, "Block '{}' too large: {} bytes exceeds limit of {} bytes",
                       name, requested_bytes, limit_bytes)
            }

            NvError::InvalidConfig { reason } => {
                write!(f, "Invalid configuration: {}", reason)
            }

            NvError::UpdateLockHeld { block } => {
                write!(f, "Update lock for block '{}' is held elsewhere", block)
            }

            NvError::CorruptManifest { block, offset, reason } => {
                write!(f, "Corrupt manifest for block '{}' at offset {}: {}",
                       block, offset, reason)
            }

            NvError::CorruptContainer { path, offset, reason } => {
                write!(f, "Corrupt container {} at offset {}: {}",
                       path.display(), offset, reason)
            }

            NvError::OutOfBounds { block, offset, len, data_len } => {
                write!(f, "Access to block '{}' at {}..{} exceeds data length {}",
                       block, offset, offset + len, data_len)
            }
        }
    }
}

impl Error for NvError {}

/// Convert std::io::Error to NvError::Io
impl From<std::io::Error> for NvError {
    fn from(err: std::io::Error) -> Self {
        NvError::Io {
            path: None,
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// Result type alias for NVault operations
pub type NvResult<T> = Result<T, NvError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = NvError::FieldNotFound {
            format: "meters".to_string(),
            field: "coin_in".to_string(),
        };

        let display = format!("{}", err);
        assert!(display.contains("meters"));
        assert!(display.contains("coin_in"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let nv_err: NvError = io_err.into();

        match nv_err {
            NvError::Io { kind, .. } => assert_eq!(kind, std::io::ErrorKind::NotFound),
            _ => panic!("Expected Io error"),
        }
    }

    #[test]
    fn test_index_out_of_range_display() {
        let err = NvError::IndexOutOfRange {
            block: "meter1".to_string(),
            index: 4,
            count: 2,
        };
        let display = format!("{}", err);
        assert!(display.contains("meter1"));
        assert!(display.contains('4'));
        assert!(display.contains('2'));
    }
}
