//! Row versions and row heads.
//!
//! A row's versions form a newest-first singly linked chain hanging off its
//! [`RowHead`]. Links are `crossbeam_epoch::Atomic` pointers so writers can splice with
//! a single compare-and-swap and unlinked versions are retired through the epoch
//! collector.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};

use crossbeam_epoch::Atomic;

use tierdb_core::{Generation, SlotIndex, ThreadId, Timestamp};

/// Identity of the transaction that wrote a version
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WriterStamp {
    pub thread_id: ThreadId,
    pub slot_index: SlotIndex,
    pub generation: Generation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum VersionStatus {
    Pending = 0,
    Committed = 1,
    Aborted = 2,
    Deleted = 3,
}

impl VersionStatus {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => VersionStatus::Committed,
            2 => VersionStatus::Aborted,
            3 => VersionStatus::Deleted,
            _ => VersionStatus::Pending,
        }
    }
}

pub struct RowVersion {
    pub(crate) older: Atomic<RowVersion>,
    write_ts: Timestamp,
    /// Highest timestamp of a committed reader of this version
    read_ts: AtomicU64,
    status: AtomicU8,
    /// Set by garbage collection once every live and future reader sees this
    /// version; from then on its writer slot is no longer consulted.
    frozen: AtomicBool,
    stamp: WriterStamp,
    pub(crate) data: Vec<u8>,
}

impl RowVersion {
    pub fn new(stamp: WriterStamp, write_ts: Timestamp, data: Vec<u8>) -> Self {
        Self {
            older: Atomic::null(),
            write_ts,
            read_ts: AtomicU64::new(write_ts.get()),
            status: AtomicU8::new(VersionStatus::Pending as u8),
            frozen: AtomicBool::new(false),
            stamp,
            data,
        }
    }

    pub fn write_ts(&self) -> Timestamp {
        self.write_ts
    }

    pub fn read_ts(&self) -> Timestamp {
        Timestamp::new(self.read_ts.load(Ordering::Acquire))
    }

    /// Raise the read high-water mark to at least `ts`.
    pub fn raise_read_ts(&self, ts: Timestamp) {
        self.read_ts.fetch_max(ts.get(), Ordering::AcqRel);
    }

    pub fn status(&self) -> VersionStatus {
        VersionStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    pub(crate) fn set_status(&self, status: VersionStatus) {
        self.status.store(status as u8, Ordering::Release);
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen.load(Ordering::Acquire)
    }

    pub(crate) fn freeze(&self) {
        self.frozen.store(true, Ordering::Release);
    }

    pub fn stamp(&self) -> WriterStamp {
        self.stamp
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }
}

impl std::fmt::Debug for RowVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RowVersion")
            .field("write_ts", &self.write_ts)
            .field("read_ts", &self.read_ts())
            .field("status", &self.status())
            .field("frozen", &self.is_frozen())
            .field("stamp", &self.stamp)
            .field("len", &self.data.len())
            .finish()
    }
}

/// Fixed anchor of one row's version chain
#[derive(Debug, Default)]
pub struct RowHead {
    pub(crate) older: Atomic<RowVersion>,
}

impl RowHead {
    pub fn new() -> Self {
        Self::default()
    }
}
