//! # Deferred Version Installer
//!
//! Publishes a transaction's write set at commit time.
//!
//! Existing rows are spliced with one compare-and-swap on the link above the
//! version the writer supersedes:
//!
//! ```text
//!   before:  newer ──> pred ──> ...
//!   CAS:     newer ──> write ──> pred ──> ...
//! ```
//!
//! A lost CAS is retried while the version that won still predates this
//! transaction; otherwise the transaction aborts. Once linked, neither the
//! predecessor nor any earlier version the walk stepped over may carry a read
//! mark above this transaction's timestamp. Brand-new rows hang their single
//! version directly under the empty row head.

use std::mem;
use std::sync::atomic::{fence, Ordering};
use std::sync::Arc;

use crossbeam_epoch::{Guard, Owned, Shared};
use tracing::debug;

use tierdb_core::{AbortReason, Error, Metrics, Result, Timestamp};

use crate::access::{AccessItem, RowAccessState, WriteVersion};
use crate::locator::{AccessIntent, LocateMiss, Located, VersionLocator};
use crate::slot::SlotRegistry;
use crate::version::{RowVersion, VersionStatus};

/// Outcome of one splice attempt
#[derive(Debug)]
enum Splice {
    Linked,
    Lost(Owned<RowVersion>),
}

pub(crate) struct DeferredVersionInstaller<'a> {
    locator: &'a VersionLocator<'a>,
    registry: &'a SlotRegistry,
    metrics: &'a Metrics,
    ts: Timestamp,
}

impl<'a> DeferredVersionInstaller<'a> {
    pub fn new(
        locator: &'a VersionLocator<'a>,
        registry: &'a SlotRegistry,
        metrics: &'a Metrics,
        ts: Timestamp,
    ) -> Self {
        Self {
            locator,
            registry,
            metrics,
            ts,
        }
    }

    /// Raise the read high-water mark of every version this transaction read.
    pub fn raise_read_timestamps(&self, items: &[AccessItem], rset: &[usize]) {
        for &i in rset {
            if let Some(rv) = items[i].read_version() {
                rv.raise_read_ts(self.ts);
            }
        }
        // Raised marks must be visible to writers before validation reads the chains.
        fence(Ordering::SeqCst);
    }

    pub fn install_versions(
        &self,
        items: &mut [AccessItem],
        wset: &[usize],
        guard: &Guard,
    ) -> Result<()> {
        for &i in wset {
            self.install_one(&mut items[i], guard)?;
        }
        Ok(())
    }

    fn install_one(&self, item: &mut AccessItem, guard: &Guard) -> Result<()> {
        let table = Arc::clone(&item.table);
        let head = table.head(item.cf_id, item.row_id)?;
        let mut owned = match mem::replace(&mut item.write, WriteVersion::None) {
            WriteVersion::Unlinked(owned) => owned,
            other => {
                item.write = other;
                return Ok(());
            }
        };
        let intent = if item.state.has_read() {
            AccessIntent::ReadWrite
        } else {
            AccessIntent::Write
        };

        loop {
            let located = match self.locator.locate(head, self.ts, intent, guard) {
                Ok(located) => located,
                Err(miss) => {
                    item.write = WriteVersion::Unlinked(owned);
                    return Err(miss.into_error(table.name(), item.cf_id, item.row_id, self.metrics));
                }
            };
            match self.splice(item, located, owned, guard)? {
                Splice::Linked => return Ok(()),
                Splice::Lost(back) => owned = back,
            }
        }
    }

    /// One compare-and-swap attempt at the located splice point.
    ///
    /// On error the version is handed back to `item` unlinked. `Lost` means a
    /// version older than this transaction took the link first; locate again.
    fn splice<'g>(
        &self,
        item: &mut AccessItem,
        located: Located<'g>,
        owned: Owned<RowVersion>,
        guard: &'g Guard,
    ) -> Result<Splice> {
        if item.state.has_read() && located.version.as_raw() != item.read_rv {
            item.write = WriteVersion::Unlinked(owned);
            return Err(self.superseded_read(item));
        }

        // Anything linked at the splice point since the walk fails the CAS below.
        let expected = located.below;
        owned.older.store(expected, Ordering::Relaxed);
        match located.newer.compare_exchange(
            expected,
            owned,
            Ordering::AcqRel,
            Ordering::Acquire,
            guard,
        ) {
            Ok(linked) => {
                item.write = WriteVersion::Linked(linked.as_raw());
                self.metrics.record_version_linked();
                self.check_covered_reads(located.below, located.version, guard)?;
                Ok(Splice::Linked)
            }
            Err(failed) => {
                self.metrics.record_cas_retry();
                // SAFETY: `guard` keeps every version reachable from the head alive.
                let winner = unsafe { failed.current.as_ref() };
                if winner.map_or(false, |w| w.write_ts() > self.ts) {
                    debug!(
                        table = item.table.name(),
                        row_id = item.row_id,
                        ts = self.ts.get(),
                        "Lost splice race to a later writer"
                    );
                    item.write = WriteVersion::Unlinked(failed.new);
                    return Err(Error::conflict(AbortReason::WriteConflict));
                }
                Ok(Splice::Lost(failed.new))
            }
        }
    }

    /// After linking: no version the new one now shadows may have been read past `ts`.
    ///
    /// The walk covers the predecessor and every earlier-stamped version the locator
    /// stepped over to reach it, since those may have committed since.
    fn check_covered_reads<'g>(
        &self,
        from: Shared<'g, RowVersion>,
        pred: Shared<'g, RowVersion>,
        guard: &'g Guard,
    ) -> Result<()> {
        // Pairs with the fence readers issue between raising read timestamps and validating.
        fence(Ordering::SeqCst);
        let mut cur = from;
        // SAFETY: `guard` keeps every version reachable from the head alive.
        while let Some(rv) = unsafe { cur.as_ref() } {
            if rv.write_ts() < self.ts && rv.read_ts() > self.ts {
                return Err(Error::conflict(AbortReason::ReadTimestamp));
            }
            if cur == pred {
                break;
            }
            cur = rv.older.load(Ordering::Acquire, guard);
        }
        Ok(())
    }

    /// Abort reason when the version read earlier is no longer the splice predecessor.
    fn superseded_read(&self, item: &AccessItem) -> Error {
        if let Some(rv) = item.read_version() {
            let stamp = rv.stamp();
            let still_visible = rv.is_frozen()
                || self
                    .registry
                    .slot(stamp.thread_id, stamp.slot_index)
                    .map(|slot| slot.observe().is_visible_to(stamp.generation, self.ts))
                    .unwrap_or(false);
            if !still_visible {
                return Error::StaleSlot {
                    thread_id: stamp.thread_id,
                    slot_index: stamp.slot_index,
                };
            }
        }
        Error::conflict(AbortReason::LostUpdate)
    }

    /// Publish brand-new rows under their empty heads.
    pub fn install_rows(
        &self,
        items: &mut [AccessItem],
        iset: &[usize],
        guard: &Guard,
    ) -> Result<()> {
        for &i in iset {
            let item = &mut items[i];
            if item.state != RowAccessState::New {
                continue;
            }
            let table = Arc::clone(&item.table);
            let head = table.head(item.cf_id, item.row_id)?;
            let owned = match mem::replace(&mut item.write, WriteVersion::None) {
                WriteVersion::Unlinked(owned) => owned,
                other => {
                    item.write = other;
                    continue;
                }
            };

            owned.set_status(VersionStatus::Committed);
            match head.older.compare_exchange(
                Shared::null(),
                owned,
                Ordering::AcqRel,
                Ordering::Acquire,
                guard,
            ) {
                Ok(linked) => {
                    item.write = WriteVersion::Linked(linked.as_raw());
                    self.metrics.record_version_linked();
                }
                Err(failed) => {
                    failed.new.set_status(VersionStatus::Pending);
                    item.write = WriteVersion::Unlinked(failed.new);
                    return Err(Error::conflict(AbortReason::WriteConflict));
                }
            }
        }
        Ok(())
    }

    /// Recheck read-only accesses: each must still resolve to the version read.
    pub fn validate_reads(&self, items: &[AccessItem], rset: &[usize], guard: &Guard) -> Result<()> {
        for &i in rset {
            let item = &items[i];
            if item.state != RowAccessState::Read {
                continue;
            }
            let head = item.table.head(item.cf_id, item.row_id)?;
            match self.locator.locate(head, self.ts, AccessIntent::Validate, guard) {
                Ok(located) if located.version.as_raw() == item.read_rv => {}
                Ok(_) | Err(LocateMiss::NotFound) | Err(LocateMiss::Deleted) => {
                    return Err(Error::conflict(AbortReason::ReadValidation));
                }
                Err(miss) => {
                    return Err(miss.into_error(item.table.name(), item.cf_id, item.row_id, self.metrics));
                }
            }
        }
        Ok(())
    }
}
