//! Commit logging hook.
//!
//! The logger runs at the durability point: after every write is installed and
//! every read validated, while the commit slot is `Committing`. Refusing the write
//! set aborts the transaction.

use tierdb_core::Timestamp;

/// One row image in a committing write set
#[derive(Debug, Clone, Copy)]
pub struct LoggedWrite<'a> {
    pub table: &'a str,
    pub cf_id: u16,
    pub row_id: u64,
    pub data: &'a [u8],
    pub deleted: bool,
}

pub trait CommitLogger: Send + Sync {
    /// Persist the write set of the transaction committing at `ts`.
    fn log(&self, ts: Timestamp, writes: &[LoggedWrite<'_>]) -> bool;
}

/// Accepts every write set without persisting anything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullLogger;

impl CommitLogger for NullLogger {
    fn log(&self, _ts: Timestamp, _writes: &[LoggedWrite<'_>]) -> bool {
        true
    }
}
