//! Error taxonomy shared by every engine layer.
//!
//! # Severity
//! Every [`PxError`] maps onto one of three tiers via [`PxError::severity`]:
//!   - `Fatal`: a contract violation inside the engine, such as a cache
//!     write crossing a block boundary. The operation is aborted.
//!   - `Error`: I/O, range, structural and corruption failures. The
//!     operation is aborted and the document stays usable.
//!   - `Warning`: non-fatal findings. These are never returned as `Err`;
//!     they are logged and collected as [`Warning`] values.

use std::fmt;
use std::io;

use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Severity {
    Fatal,
    Error,
    Warning,
}

#[derive(Error, Debug)]
pub enum PxError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("Invalid header: {0}")]
    InvalidHeader(String),
    #[error("Record number {recno} out of range (document has {count} records)")]
    RecordOutOfRange { recno: i64, count: u32 },
    #[error("Field '{field}': {reason}")]
    Field { field: String, reason: String },
    #[error("Value for field '{field}' is too long ({len} > {max} bytes)")]
    ValueTooLong { field: String, len: usize, max: usize },
    #[error("Corrupt data: {0}")]
    Corrupt(String),
    #[error("Index mismatch: {0}")]
    IndexMismatch(String),
    #[error("Blob store: {0}")]
    Blob(String),
    #[error("Access of {len} bytes at offset {offset} crosses the end of block {block} ({block_size} bytes)")]
    BlockBoundary { block: u32, offset: usize, len: usize, block_size: usize },
    #[error("Document is read-only")]
    ReadOnly,
    #[error("Unsupported: {0}")]
    Unsupported(String),
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

impl PxError {
    pub fn severity(&self) -> Severity {
        match self {
            PxError::BlockBoundary { .. } => Severity::Fatal,
            _                             => Severity::Error,
        }
    }

    pub(crate) fn field(field: &str, reason: impl Into<String>) -> Self {
        PxError::Field { field: field.to_owned(), reason: reason.into() }
    }
}

pub type Result<T> = std::result::Result<T, PxError>;

/// A non-fatal finding surfaced to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Warning {
    pub message: String,
}

impl Warning {
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into() }
    }

    /// Log through `tracing` and hand the warning back for collection.
    pub(crate) fn emit(message: impl Into<String>) -> Self {
        let w = Self::new(message);
        tracing::warn!("{}", w.message);
        w
    }
}

impl fmt::Display for Warning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_tiers() {
        let e = PxError::BlockBoundary { block: 3, offset: 2040, len: 20, block_size: 2048 };
        assert_eq!(e.severity(), Severity::Fatal);
        assert_eq!(PxError::ReadOnly.severity(), Severity::Error);
        let io = PxError::from(io::Error::new(io::ErrorKind::UnexpectedEof, "short"));
        assert_eq!(io.severity(), Severity::Error);
    }

    #[test]
    fn out_of_range_message_names_record() {
        let e = PxError::RecordOutOfRange { recno: 7, count: 3 };
        assert!(e.to_string().contains('7'));
        assert!(e.to_string().contains('3'));
    }
}
