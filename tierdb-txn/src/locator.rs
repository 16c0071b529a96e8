//! # Version Locator
//!
//! Walks a row's chain newest-first and finds the version a transaction at `ts`
//! should see. The writer's commit slot decides first; the version's own write
//! timestamp and status only break ties for versions the slot already admitted.
//!
//! ```text
//!   head ──> v(wts 40) ──> v(wts 30) ──> v(wts 12) ──> v(wts 7) ──> ∅
//!             future        in flight     committed
//!                                         ▲
//!                             reader ts=35 stops here
//! ```
//!
//! Versions frozen by garbage collection skip the slot check; their write
//! timestamp already lies below every live transaction.
//!
//! `newer` tracks the link a writer would splice into. It only moves past versions
//! whose write timestamp is above `ts`, which keeps the chain ordered by write
//! timestamp after every splice. `below` is what the walk saw behind that link; a
//! writer's compare-and-swap expects exactly that pointer.

use crossbeam_epoch::{Atomic, Guard, Shared};
use crossbeam_utils::Backoff;
use std::sync::atomic::Ordering;

use tierdb_core::{AbortReason, Error, Metrics, Timestamp};
use tracing::error;

use crate::slot::{CommitSlotState, SlotRegistry};
use crate::version::{RowHead, RowVersion, VersionStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessIntent {
    Read,
    Write,
    ReadWrite,
    /// Commit-time recheck of a read-only access. Never skips pending versions.
    Validate,
    /// Garbage collection: like `Read`, but a tombstone is returned as the visible version
    Collect,
}

impl AccessIntent {
    pub fn from_hints(read_hint: bool, write_hint: bool) -> Self {
        match (read_hint, write_hint) {
            (true, true) => AccessIntent::ReadWrite,
            (false, true) => AccessIntent::Write,
            _ => AccessIntent::Read,
        }
    }

    pub fn writes(self) -> bool {
        matches!(self, AccessIntent::Write | AccessIntent::ReadWrite)
    }

    /// Whether an earlier, still running writer must be waited out instead of skipped.
    fn blocks_on_in_flight(self) -> bool {
        matches!(self, AccessIntent::ReadWrite | AccessIntent::Validate)
    }
}

/// A visible version and the link directly above the splice point
pub struct Located<'g> {
    pub newer: &'g Atomic<RowVersion>,
    /// Value of `newer` as the walk observed it
    pub below: Shared<'g, RowVersion>,
    pub version: Shared<'g, RowVersion>,
}

/// Why no version was returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocateMiss {
    /// The chain holds nothing committed before `ts`
    NotFound,
    /// The visible version is a tombstone
    Deleted,
    /// An undecided version blocked the walk in no-wait mode
    Pending,
    /// A later reader already saw the version a write would supersede
    ReadTimestamp,
    /// Only versions of reused slots remained; collection should have kept one
    Exhausted,
}

impl LocateMiss {
    pub fn into_error(self, table: &str, cf_id: u16, row_id: u64, metrics: &Metrics) -> Error {
        match self {
            LocateMiss::NotFound | LocateMiss::Deleted => Error::RowNotFound {
                table: table.to_string(),
                cf_id,
                row_id,
            },
            LocateMiss::Pending => Error::conflict(AbortReason::PendingVersion),
            LocateMiss::ReadTimestamp => Error::conflict(AbortReason::ReadTimestamp),
            LocateMiss::Exhausted => {
                metrics.record_fatal();
                error!(table, cf_id, row_id, "Version chain exhausted below the collection horizon");
                Error::FatalInconsistency {
                    details: format!(
                        "row {} (column family {}) of table {} has no version visible to any live transaction",
                        row_id, cf_id, table
                    ),
                }
            }
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Skipped {
    Nothing,
    Unborn,
    Stale,
}

pub struct VersionLocator<'a> {
    registry: &'a SlotRegistry,
    no_wait_for_pending: bool,
    skip_pending: bool,
}

impl<'a> VersionLocator<'a> {
    pub fn new(registry: &'a SlotRegistry, no_wait_for_pending: bool, skip_pending: bool) -> Self {
        Self {
            registry,
            no_wait_for_pending,
            skip_pending,
        }
    }

    pub fn locate<'g>(
        &self,
        head: &'g RowHead,
        ts: Timestamp,
        intent: AccessIntent,
        guard: &'g Guard,
    ) -> Result<Located<'g>, LocateMiss> {
        let mut newer: &'g Atomic<RowVersion> = &head.older;
        let mut cur = newer.load(Ordering::Acquire, guard);
        let mut below = cur;
        let mut skipped = Skipped::Nothing;
        let backoff = Backoff::new();

        loop {
            // SAFETY: versions reachable from a head are retired only through the
            // epoch collector, and `guard` pins the current epoch.
            let rv = match unsafe { cur.as_ref() } {
                Some(rv) => rv,
                None => {
                    return Err(match skipped {
                        Skipped::Stale => LocateMiss::Exhausted,
                        _ => LocateMiss::NotFound,
                    })
                }
            };

            let admitted = if rv.is_frozen() {
                true
            } else {
                let stamp = rv.stamp();
                let view = self
                    .registry
                    .slot(stamp.thread_id, stamp.slot_index)
                    .ok_or(LocateMiss::Exhausted)?
                    .observe();

                if view.generation != stamp.generation {
                    skipped = Skipped::Stale;
                    false
                } else if view.state != CommitSlotState::Committed {
                    if intent.blocks_on_in_flight()
                        && view.state.is_in_flight()
                        && rv.write_ts() < ts
                    {
                        if self.no_wait_for_pending {
                            return Err(LocateMiss::Pending);
                        }
                        backoff.snooze();
                        continue;
                    }
                    skipped = Skipped::Unborn;
                    false
                } else if view.commit_ts >= ts {
                    skipped = Skipped::Unborn;
                    false
                } else {
                    true
                }
            };

            if admitted {
                if rv.write_ts() < ts {
                    let status = if self.no_wait_for_pending {
                        rv.status()
                    } else {
                        wait_for_pending(rv)
                    };
                    match status {
                        VersionStatus::Committed => break,
                        VersionStatus::Deleted if intent == AccessIntent::Collect => break,
                        VersionStatus::Deleted => return Err(LocateMiss::Deleted),
                        VersionStatus::Pending => {
                            if !self.skip_pending || intent == AccessIntent::Validate {
                                return Err(LocateMiss::Pending);
                            }
                            skipped = Skipped::Unborn;
                        }
                        VersionStatus::Aborted => skipped = Skipped::Unborn,
                    }
                }
            }

            cur = rv.older.load(Ordering::Acquire, guard);
            if rv.write_ts() > ts {
                newer = &rv.older;
                below = cur;
            }
            backoff.reset();
        }

        // SAFETY: `cur` was just dereferenced under the same guard.
        let rv = unsafe { cur.deref() };
        if intent.writes() && rv.read_ts() > ts {
            return Err(LocateMiss::ReadTimestamp);
        }
        Ok(Located {
            newer,
            below,
            version: cur,
        })
    }
}

fn wait_for_pending(rv: &RowVersion) -> VersionStatus {
    let backoff = Backoff::new();
    loop {
        let status = rv.status();
        if status != VersionStatus::Pending {
            return status;
        }
        backoff.snooze();
    }
}
