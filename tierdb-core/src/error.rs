//! # Error Handling
//!
//! Error types shared by the page arena and the transaction layer.
//!
//! ## Design Principles
//!
//! 1. **Actionable**: Every error should guide the caller toward resolution
//! 2. **Contextual**: Errors include relevant context (addresses, node ids, rows)
//! 3. **Restartable**: MVCC aborts are distinguishable from real failures
//! 4. **Loud**: Inconsistencies that garbage collection must prevent are never silent

use std::fmt;

use thiserror::Error;

/// Result type alias for TierDB operations
pub type Result<T> = std::result::Result<T, Error>;

/// Why a transaction gave up. The caller is expected to restart it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AbortReason {
    /// Another writer holds or took the splice point this transaction needed.
    WriteConflict,
    /// A later reader already observed the version this transaction wanted to supersede.
    ReadTimestamp,
    /// The version read earlier is no longer the one a write would supersede.
    LostUpdate,
    /// A read-only access no longer resolves to the version that was read.
    ReadValidation,
    /// An undecided version stood in the way and waiting is disabled.
    PendingVersion,
    /// The commit logger refused the write set.
    LoggerRefused,
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            AbortReason::WriteConflict => "write-write conflict",
            AbortReason::ReadTimestamp => "version already read by a later transaction",
            AbortReason::LostUpdate => "read version was superseded before commit",
            AbortReason::ReadValidation => "read set validation failed",
            AbortReason::PendingVersion => "pending version encountered",
            AbortReason::LoggerRefused => "commit logger refused the write set",
        };
        f.write_str(text)
    }
}

/// Primary error type for TierDB
#[derive(Error, Debug)]
pub enum Error {
    // Arena Errors
    #[error("Resource exhausted: {resource}")]
    ResourceExhausted { resource: String },

    #[error("Address {addr:#x} was taken before it could be bound")]
    AddressRace { addr: usize },

    #[error("Alignment violation: {what} {value:#x} is not a multiple of {alignment}")]
    Alignment {
        what: &'static str,
        value: usize,
        alignment: usize,
    },

    #[error("Invalid handle: {message}")]
    InvalidHandle { message: String },

    #[error("Invalid argument: {message}")]
    InvalidArgument { message: String },

    // Transaction Errors
    #[error("Transaction aborted: {reason}")]
    Conflict { reason: AbortReason },

    #[error("Transaction aborted: commit slot {slot_index} of thread {thread_id} was reused or never committed")]
    StaleSlot { thread_id: u16, slot_index: u16 },

    #[error("Row {row_id} (column family {cf_id}) of table {table} has no visible version")]
    RowNotFound {
        table: String,
        cf_id: u16,
        row_id: u64,
    },

    #[error("Fatal inconsistency: {details}")]
    FatalInconsistency { details: String },

    // System Errors
    #[error("IO error: {message}")]
    Io {
        message: String,
        source: std::io::Error,
    },

    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl Error {
    /// Shorthand for a conflict abort.
    pub fn conflict(reason: AbortReason) -> Self {
        Error::Conflict { reason }
    }

    /// Check if error is recoverable
    pub fn is_recoverable(&self) -> bool {
        match self {
            Error::Io { .. } => false,
            Error::FatalInconsistency { .. } => false,
            Error::Internal { .. } => false,
            _ => true,
        }
    }

    /// True when the whole transaction must be restarted.
    pub fn is_abort(&self) -> bool {
        matches!(self, Error::Conflict { .. } | Error::StaleSlot { .. })
    }

    /// Get error code for monitoring
    pub fn error_code(&self) -> &'static str {
        match self {
            Error::ResourceExhausted { .. } => "RESOURCE_EXHAUSTED",
            Error::AddressRace { .. } => "ADDRESS_RACE",
            Error::Alignment { .. } => "ALIGNMENT_VIOLATION",
            Error::InvalidHandle { .. } => "INVALID_HANDLE",
            Error::InvalidArgument { .. } => "INVALID_ARGUMENT",
            Error::Conflict { .. } => "CONFLICT_ABORT",
            Error::StaleSlot { .. } => "STALE_SLOT_ABORT",
            Error::RowNotFound { .. } => "ROW_NOT_FOUND",
            Error::FatalInconsistency { .. } => "FATAL_INCONSISTENCY",
            Error::Io { .. } => "IO_ERROR",
            Error::Configuration { .. } => "CONFIG_ERROR",
            Error::Internal { .. } => "INTERNAL_ERROR",
        }
    }
}

// Conversion from std::io::Error
impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io {
            message: err.to_string(),
            source: err,
        }
    }
}

/// Extension trait for attaching a description to I/O failures
pub trait IoResultExt<T> {
    fn io_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;
}

impl<T> IoResultExt<T> for std::io::Result<T> {
    fn io_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| Error::Io {
            message: format!("{}: {}", f(), e),
            source: e,
        })
    }
}
