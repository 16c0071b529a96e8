//! # Transactions
//!
//! A transaction peeks rows at its timestamp, stages new versions privately and
//! publishes them at commit. Row accesses move through a small state machine:
//!
//! ```text
//!   peek ──> Peek ──read──> Read ──write──> ReadWrite ──delete──> ReadDelete
//!             │                   └─────────delete──────────────> ReadDelete
//!             ├──write──> Write ──delete──> Delete
//!             └──delete─> Delete
//!   new  ──> New ──delete──> Invalid
//! ```
//!
//! Commit order:
//!
//! 1. raise the read timestamp of every version read
//! 2. splice staged versions of existing rows
//! 3. hang new rows under their empty heads
//! 4. re-validate read-only accesses
//! 5. `Committing`, then hand the write set to the commit logger
//! 6. stamp version statuses, then mark the slot `Committed` at the transaction timestamp
//!
//! Any failure moves the slot to `Aborted`, which hides every version already spliced.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use crossbeam_epoch::{self as epoch, Guard, Owned, Shared};
use tracing::debug;

use tierdb_core::metrics::Timer;
use tierdb_core::{AbortReason, Error, Generation, Result, SlotIndex, Timestamp};

use crate::access::{AccessBucketIndex, AccessItem, AccessKey, RowAccessState, WriteVersion};
use crate::context::{Context, Database};
use crate::installer::DeferredVersionInstaller;
use crate::locator::AccessIntent;
use crate::logger::LoggedWrite;
use crate::slot::CommitSlot;
use crate::table::Table;
use crate::version::{RowVersion, VersionStatus, WriterStamp};

/// Handle to one row access inside a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RowHandle(usize);

pub struct Transaction<'c> {
    ctx: &'c mut Context,
    guard: Guard,
    ts: Timestamp,
    slot_index: SlotIndex,
    generation: Generation,
    accesses: Vec<AccessItem>,
    /// Accesses that read, in access order
    rset: Vec<usize>,
    /// Accesses that stage a version of an existing row
    wset: Vec<usize>,
    /// Accesses that create a row
    iset: Vec<usize>,
    /// Accesses whose row id this transaction allocated
    allocated: Vec<usize>,
    buckets: AccessBucketIndex,
    finished: bool,
}

impl<'c> Transaction<'c> {
    pub(crate) fn new(
        ctx: &'c mut Context,
        ts: Timestamp,
        slot_index: SlotIndex,
        generation: Generation,
    ) -> Self {
        let config = ctx.db().config();
        let buckets =
            AccessBucketIndex::new(config.access_bucket_root_count, config.access_bucket_size);
        debug!(thread_id = ctx.thread_id(), ts = ts.get(), slot_index, generation, "Begin");
        Self {
            guard: epoch::pin(),
            ctx,
            ts,
            slot_index,
            generation,
            accesses: Vec::new(),
            rset: Vec::new(),
            wset: Vec::new(),
            iset: Vec::new(),
            allocated: Vec::new(),
            buckets,
            finished: false,
        }
    }

    pub fn ts(&self) -> Timestamp {
        self.ts
    }

    pub fn slot_index(&self) -> SlotIndex {
        self.slot_index
    }

    pub fn generation(&self) -> Generation {
        self.generation
    }

    pub fn access_count(&self) -> usize {
        self.accesses.len()
    }

    fn stamp(&self) -> WriterStamp {
        WriterStamp {
            thread_id: self.ctx.thread_id(),
            slot_index: self.slot_index,
            generation: self.generation,
        }
    }

    fn item(&self, h: RowHandle) -> Result<&AccessItem> {
        self.accesses.get(h.0).ok_or_else(|| Error::InvalidHandle {
            message: format!("row handle {} is not part of transaction {}", h.0, self.ts),
        })
    }

    fn item_mut(&mut self, h: RowHandle) -> Result<&mut AccessItem> {
        let ts = self.ts;
        self.accesses.get_mut(h.0).ok_or_else(|| Error::InvalidHandle {
            message: format!("row handle {} is not part of transaction {}", h.0, ts),
        })
    }

    fn push_access(&mut self, item: AccessItem) -> Result<RowHandle> {
        let limit = self.ctx.db().config().max_accesses_per_txn;
        if self.accesses.len() >= limit {
            return Err(Error::ResourceExhausted {
                resource: format!("row accesses of transaction {} (limit {})", self.ts, limit),
            });
        }
        let index = self.accesses.len();
        self.buckets.insert(item.key(), index);
        self.accesses.push(item);
        Ok(RowHandle(index))
    }

    /// Create a row. Column family 0 allocates the row id when `row_id` is `None`;
    /// other column families attach to an existing id.
    pub fn new_row(
        &mut self,
        table: &Arc<Table>,
        cf_id: u16,
        row_id: Option<u64>,
        check_dup: bool,
        data: Vec<u8>,
    ) -> Result<RowHandle> {
        let (row_id, allocated) = match row_id {
            Some(row_id) => (row_id, false),
            None if cf_id == 0 => {
                let row_id = table.allocate_row().ok_or_else(|| Error::ResourceExhausted {
                    resource: format!("row ids of table {}", table.name()),
                })?;
                (row_id, true)
            }
            None => {
                return Err(Error::InvalidArgument {
                    message: format!("column family {} needs an existing row id", cf_id),
                })
            }
        };
        let release = |table: &Table| {
            if allocated {
                table.deallocate_row(row_id);
            }
        };

        if let Err(e) = table.head(cf_id, row_id) {
            release(table);
            return Err(e);
        }
        let key = AccessKey {
            table_id: table.id(),
            cf_id,
            row_id,
        };
        if check_dup && self.buckets.find(&key).is_some() {
            release(table);
            return Err(Error::InvalidArgument {
                message: format!("row {} of table {} already accessed", row_id, table.name()),
            });
        }

        let version = RowVersion::new(self.stamp(), self.ts, data);
        let item = AccessItem {
            state: RowAccessState::New,
            table: Arc::clone(table),
            cf_id,
            row_id,
            read_rv: std::ptr::null(),
            write: WriteVersion::Unlinked(Owned::new(version)),
        };
        let h = match self.push_access(item) {
            Ok(h) => h,
            Err(e) => {
                release(table);
                return Err(e);
            }
        };
        self.iset.push(h.0);
        if allocated {
            self.allocated.push(h.0);
        }
        Ok(h)
    }

    /// Locate the version of a row visible to this transaction.
    ///
    /// The hints choose the locate intent; a write hint rejects rows a later reader
    /// already saw. With `check_dup`, a row accessed before returns its existing handle.
    pub fn peek_row(
        &mut self,
        table: &Arc<Table>,
        cf_id: u16,
        row_id: u64,
        check_dup: bool,
        read_hint: bool,
        write_hint: bool,
    ) -> Result<RowHandle> {
        let key = AccessKey {
            table_id: table.id(),
            cf_id,
            row_id,
        };
        if check_dup {
            if let Some(index) = self.buckets.find(&key) {
                return Ok(RowHandle(index));
            }
        }

        let db = Arc::clone(self.ctx.db());
        let head = table.head(cf_id, row_id)?;
        let locator = db.locator();
        let intent = AccessIntent::from_hints(read_hint, write_hint);
        let read_rv = locator
            .locate(head, self.ts, intent, &self.guard)
            .map(|located| located.version.as_raw())
            .map_err(|miss| miss.into_error(table.name(), cf_id, row_id, db.metrics()))?;

        self.push_access(AccessItem {
            state: RowAccessState::Peek,
            table: Arc::clone(table),
            cf_id,
            row_id,
            read_rv,
            write: WriteVersion::None,
        })
    }

    /// Add a peeked row to the read set and return its contents.
    pub fn read_row(&mut self, h: RowHandle) -> Result<&[u8]> {
        let item = self.item_mut(h)?;
        match item.state {
            RowAccessState::Peek => {
                item.state = RowAccessState::Read;
                self.rset.push(h.0);
            }
            RowAccessState::Read | RowAccessState::ReadWrite | RowAccessState::New => {}
            state => return Err(invalid_transition("read", state)),
        }
        self.data(h)
    }

    /// Stage a new image of the row.
    pub fn write_row(&mut self, h: RowHandle, data: Vec<u8>) -> Result<()> {
        let stamp = self.stamp();
        let ts = self.ts;
        let item = self.item_mut(h)?;
        let staged = match item.state {
            RowAccessState::Peek => RowAccessState::Write,
            RowAccessState::Read => RowAccessState::ReadWrite,
            RowAccessState::Write | RowAccessState::ReadWrite | RowAccessState::New => {
                if let WriteVersion::Unlinked(owned) = &mut item.write {
                    owned.data = data;
                }
                return Ok(());
            }
            state => return Err(invalid_transition("write", state)),
        };
        item.state = staged;
        item.write = WriteVersion::Unlinked(Owned::new(RowVersion::new(stamp, ts, data)));
        self.wset.push(h.0);
        Ok(())
    }

    /// Stage a tombstone. Deleting a row created by this transaction cancels it.
    pub fn delete_row(&mut self, h: RowHandle) -> Result<()> {
        let stamp = self.stamp();
        let ts = self.ts;
        let item = self.item_mut(h)?;
        let (next, fresh_version) = match item.state {
            RowAccessState::Peek => (RowAccessState::Delete, true),
            RowAccessState::Read => (RowAccessState::ReadDelete, true),
            RowAccessState::Write => (RowAccessState::Delete, false),
            RowAccessState::ReadWrite => (RowAccessState::ReadDelete, false),
            RowAccessState::New => {
                item.state = RowAccessState::Invalid;
                item.write = WriteVersion::None;
                return Ok(());
            }
            state => return Err(invalid_transition("delete", state)),
        };
        item.state = next;
        if fresh_version {
            item.write = WriteVersion::Unlinked(Owned::new(RowVersion::new(stamp, ts, Vec::new())));
            self.wset.push(h.0);
        } else if let WriteVersion::Unlinked(owned) = &mut item.write {
            owned.data.clear();
        }
        Ok(())
    }

    /// Current contents of the row as this transaction sees it.
    pub fn data(&self, h: RowHandle) -> Result<&[u8]> {
        let item = self.item(h)?;
        if let Some(rv) = item.write.version() {
            return Ok(rv.data());
        }
        match item.state {
            RowAccessState::Invalid => Err(invalid_transition("read", item.state)),
            _ => item
                .read_version()
                .map(RowVersion::data)
                .ok_or_else(|| Error::Internal {
                    message: format!("access {} has no version", h.0),
                }),
        }
    }

    /// Mutable access to a staged row image.
    pub fn data_mut(&mut self, h: RowHandle) -> Result<&mut Vec<u8>> {
        let item = self.item_mut(h)?;
        let state = item.state;
        match &mut item.write {
            WriteVersion::Unlinked(owned) => Ok(&mut owned.data),
            _ => Err(invalid_transition("modify", state)),
        }
    }

    pub fn row_id(&self, h: RowHandle) -> Result<u64> {
        Ok(self.item(h)?.row_id)
    }

    pub fn state(&self, h: RowHandle) -> Result<RowAccessState> {
        Ok(self.item(h)?.state)
    }

    /// Commit at the transaction timestamp. Any error leaves the transaction aborted;
    /// abort errors mean the caller should run it again.
    pub fn commit(mut self) -> Result<Timestamp> {
        let timer = Timer::new("txn_commit");
        let db = Arc::clone(self.ctx.db());
        match self.try_commit(&db) {
            Ok(()) => {
                self.finish(&db);
                db.metrics().record_commit();
                timer.stop();
                Ok(self.ts)
            }
            Err(e) => {
                debug!(
                    ts = self.ts.get(),
                    code = e.error_code(),
                    error = %e,
                    "Commit failed"
                );
                self.rollback(&db);
                Err(e)
            }
        }
    }

    pub fn abort(mut self) {
        let db = Arc::clone(self.ctx.db());
        self.rollback(&db);
    }

    fn slot<'d>(&self, db: &'d Database) -> Result<&'d CommitSlot> {
        db.registry()
            .slot(self.ctx.thread_id(), self.slot_index)
            .ok_or_else(|| Error::Internal {
                message: format!(
                    "commit slot {} of thread {} does not exist",
                    self.slot_index,
                    self.ctx.thread_id()
                ),
            })
    }

    fn try_commit(&mut self, db: &Database) -> Result<()> {
        let locator = db.locator();
        let installer = DeferredVersionInstaller::new(&locator, db.registry(), db.metrics(), self.ts);

        installer.raise_read_timestamps(&self.accesses, &self.rset);
        installer.install_versions(&mut self.accesses, &self.wset, &self.guard)?;
        installer.install_rows(&mut self.accesses, &self.iset, &self.guard)?;
        installer.validate_reads(&self.accesses, &self.rset, &self.guard)?;

        let slot = self.slot(db)?;
        slot.begin_commit();

        let writes: Vec<LoggedWrite<'_>> = self
            .wset
            .iter()
            .chain(self.iset.iter())
            .filter_map(|&i| {
                let item = &self.accesses[i];
                item.write.version().map(|rv| LoggedWrite {
                    table: item.table.name(),
                    cf_id: item.cf_id,
                    row_id: item.row_id,
                    data: rv.data(),
                    deleted: item.state.is_delete(),
                })
            })
            .collect();
        if !db.logger().log(self.ts, &writes) {
            return Err(Error::conflict(AbortReason::LoggerRefused));
        }
        drop(writes);

        for &i in &self.wset {
            let item = &self.accesses[i];
            if let Some(rv) = item.write.version() {
                rv.set_status(if item.state.is_delete() {
                    VersionStatus::Deleted
                } else {
                    VersionStatus::Committed
                });
            }
        }
        slot.commit(self.ts);

        for &i in &self.allocated {
            let item = &self.accesses[i];
            if item.state == RowAccessState::Invalid {
                item.table.deallocate_row(item.row_id);
            }
        }
        Ok(())
    }

    fn rollback(&mut self, db: &Database) {
        if self.finished {
            return;
        }
        if let Ok(slot) = self.slot(db) {
            slot.abort();
        }

        for item in &mut self.accesses {
            match std::mem::replace(&mut item.write, WriteVersion::None) {
                WriteVersion::Linked(ptr) => {
                    // SAFETY: linked versions outlive the pinned guard.
                    let rv = unsafe { &*ptr };
                    rv.set_status(VersionStatus::Aborted);
                    if item.state == RowAccessState::New {
                        unlink_new_row(item, ptr, &self.guard);
                    }
                }
                WriteVersion::Unlinked(owned) => drop(owned),
                WriteVersion::None => {}
            }
        }
        for &i in &self.allocated {
            let item = &self.accesses[i];
            item.table.deallocate_row(item.row_id);
        }

        self.finish(db);
        db.metrics().record_abort();
    }

    fn finish(&mut self, db: &Database) {
        db.finish_timestamp(self.ctx.thread_id());
        self.finished = true;
    }
}

/// Detach a new row's only version from its head so the row id can be reused.
fn unlink_new_row(item: &AccessItem, ptr: *const RowVersion, guard: &Guard) {
    let Ok(head) = item.table.head(item.cf_id, item.row_id) else {
        return;
    };
    let expected = Shared::from(ptr);
    if head
        .older
        .compare_exchange(expected, Shared::null(), Ordering::AcqRel, Ordering::Acquire, guard)
        .is_ok()
    {
        // SAFETY: unreachable from the head now; concurrent walkers hold older epochs.
        unsafe { guard.defer_destroy(expected) };
    }
}

fn invalid_transition(op: &str, state: RowAccessState) -> Error {
    Error::InvalidArgument {
        message: format!("cannot {} a row in state {:?}", op, state),
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if !self.finished {
            let db = Arc::clone(self.ctx.db());
            self.rollback(&db);
        }
    }
}

impl std::fmt::Debug for Transaction<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("thread_id", &self.ctx.thread_id())
            .field("ts", &self.ts)
            .field("slot_index", &self.slot_index)
            .field("generation", &self.generation)
            .field("accesses", &self.accesses.len())
            .field("finished", &self.finished)
            .finish()
    }
}
