//! # Database and Worker Contexts
//!
//! The [`Database`] owns the global clock, every context's commit slot table, the
//! tables and the commit logger. Each worker thread claims one [`Context`] and
//! runs its transactions through it, one at a time.
//!
//! ```text
//! ┌───────────────────────────── Database ─────────────────────────────┐
//! │  clock ─ tables ─ logger                                           │
//! │  SlotRegistry: [ ctx0 slots ][ ctx1 slots ] ... [ ctxN slots ]     │
//! │  active ts:    [   ts 41    ][    idle    ] ... [   ts 44    ]     │
//! └────────────────────────────────────────────────────────────────────┘
//!         ▲ claim                                  ▲ claim
//!     Context(0) ──begin──> Transaction        Context(N)
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_epoch::{self as epoch, Guard, Shared};
use crossbeam_utils::CachePadded;
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use tierdb_core::{Error, Metrics, Result, ThreadId, Timestamp, TxnConfig};

use crate::locator::{AccessIntent, LocateMiss, VersionLocator};
use crate::logger::{CommitLogger, NullLogger};
use crate::slot::SlotRegistry;
use crate::table::{Table, TableId};
use crate::transaction::Transaction;
use crate::version::{RowHead, VersionStatus};

const IDLE: u64 = u64::MAX;

pub struct Database {
    config: TxnConfig,
    clock: AtomicU64,
    registry: SlotRegistry,
    active_ts: Box<[CachePadded<AtomicU64>]>,
    claimed: Box<[AtomicBool]>,
    tables: RwLock<HashMap<String, Arc<Table>>>,
    next_table_id: AtomicU64,
    logger: Arc<dyn CommitLogger>,
    metrics: Metrics,
}

impl Database {
    pub fn new(config: TxnConfig) -> Result<Arc<Self>> {
        Self::with_logger(config, Arc::new(NullLogger), Metrics::new())
    }

    pub fn with_logger(
        config: TxnConfig,
        logger: Arc<dyn CommitLogger>,
        metrics: Metrics,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let threads = config.max_threads as usize;
        info!(
            threads,
            slots_per_thread = config.commit_slots_per_thread,
            no_wait = config.no_wait_for_pending,
            "Opening transaction layer"
        );
        Ok(Arc::new(Self {
            registry: SlotRegistry::new(threads, config.commit_slots_per_thread),
            active_ts: (0..threads).map(|_| CachePadded::new(AtomicU64::new(IDLE))).collect(),
            claimed: (0..threads).map(|_| AtomicBool::new(false)).collect(),
            clock: AtomicU64::new(0),
            tables: RwLock::new(HashMap::new()),
            next_table_id: AtomicU64::new(0),
            logger,
            metrics,
            config,
        }))
    }

    pub fn config(&self) -> &TxnConfig {
        &self.config
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    pub fn registry(&self) -> &SlotRegistry {
        &self.registry
    }

    pub(crate) fn logger(&self) -> &dyn CommitLogger {
        self.logger.as_ref()
    }

    pub(crate) fn locator(&self) -> VersionLocator<'_> {
        VersionLocator::new(
            &self.registry,
            self.config.no_wait_for_pending,
            self.config.skip_pending,
        )
    }

    pub fn create_table(&self, name: &str, num_cf: u16, row_capacity: u64) -> Result<Arc<Table>> {
        if num_cf == 0 {
            return Err(Error::InvalidArgument {
                message: format!("table {} needs at least one column family", name),
            });
        }
        let mut tables = self.tables.write();
        if tables.contains_key(name) {
            return Err(Error::InvalidArgument {
                message: format!("table {} already exists", name),
            });
        }
        let id = self.next_table_id.fetch_add(1, Ordering::Relaxed) as TableId;
        let table = Arc::new(Table::new(id, name, num_cf, row_capacity));
        tables.insert(name.to_string(), Arc::clone(&table));
        debug!(table = name, id, num_cf, row_capacity, "Created table");
        Ok(table)
    }

    pub fn table(&self, name: &str) -> Option<Arc<Table>> {
        self.tables.read().get(name).cloned()
    }

    /// Claim the worker context `thread_id` for the calling thread.
    pub fn context(self: &Arc<Self>, thread_id: ThreadId) -> Result<Context> {
        let flag = self.claimed.get(thread_id as usize).ok_or_else(|| Error::InvalidArgument {
            message: format!(
                "thread id {} out of range (max_threads = {})",
                thread_id, self.config.max_threads
            ),
        })?;
        if flag
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(Error::InvalidArgument {
                message: format!("context {} is already in use", thread_id),
            });
        }
        Ok(Context {
            db: Arc::clone(self),
            thread_id,
        })
    }

    /// Latest timestamp handed out
    pub fn now(&self) -> Timestamp {
        Timestamp::new(self.clock.load(Ordering::SeqCst))
    }

    /// Oldest timestamp any running transaction may still read at.
    pub fn min_active_ts(&self) -> Timestamp {
        let mut min = self.clock.load(Ordering::SeqCst) + 1;
        for active in self.active_ts.iter() {
            min = min.min(active.load(Ordering::SeqCst));
        }
        Timestamp::new(min)
    }

    /// Publish a lower bound for the coming timestamp before taking it, so a
    /// concurrent collection never computes a horizon above it.
    pub(crate) fn start_timestamp(&self, thread_id: ThreadId) -> Timestamp {
        let active = &self.active_ts[thread_id as usize];
        active.store(self.clock.load(Ordering::SeqCst) + 1, Ordering::SeqCst);
        let ts = self.clock.fetch_add(1, Ordering::SeqCst) + 1;
        active.store(ts, Ordering::SeqCst);
        Timestamp::new(ts)
    }

    pub(crate) fn finish_timestamp(&self, thread_id: ThreadId) {
        self.active_ts[thread_id as usize].store(IDLE, Ordering::SeqCst);
    }

    /// Cut every row's chain below its newest version visible at the oldest active
    /// timestamp and freeze that version, so it stays visible after its writer's
    /// commit slot is reused. Returns the number of versions retired.
    ///
    /// A tombstone at the top of its chain is unlinked as well; once every column
    /// family of a row is empty that way, the row id goes back to the table.
    ///
    /// Run at least once per `commit_slots_per_thread` transactions of a context.
    pub fn collect_garbage(&self, table: &Table) -> usize {
        let horizon = self.min_active_ts();
        let locator = self.locator();
        let guard = epoch::pin();
        let mut reclaimed = 0;
        let mut released = 0;

        for row_id in 0..table.row_capacity() {
            let mut dropped_tombstone = false;
            for cf_id in 0..table.num_column_families() {
                let Ok(head) = table.head(cf_id, row_id) else {
                    continue;
                };
                let (count, dropped) = collect_chain(&locator, table, cf_id, row_id, head, horizon, &guard);
                reclaimed += count;
                dropped_tombstone |= dropped;
            }
            if dropped_tombstone && table.is_row_empty(row_id, &guard) {
                table.deallocate_row(row_id);
                released += 1;
            }
        }

        guard.flush();
        self.metrics.record_versions_reclaimed(reclaimed as u64);
        debug!(
            table = table.name(),
            horizon = horizon.get(),
            reclaimed,
            released,
            "Collected garbage"
        );
        reclaimed
    }
}

/// Trim one chain at `horizon`. Returns the versions retired and whether the
/// chain's top tombstone was among them.
fn collect_chain(
    locator: &VersionLocator<'_>,
    table: &Table,
    cf_id: u16,
    row_id: u64,
    head: &RowHead,
    horizon: Timestamp,
    guard: &Guard,
) -> (usize, bool) {
    let located = match locator.locate(head, horizon, AccessIntent::Collect, guard) {
        Ok(located) => located,
        Err(LocateMiss::Exhausted) => {
            warn!(table = table.name(), cf_id, row_id, "Row already lost its visible version");
            return (0, false);
        }
        Err(_) => return (0, false),
    };
    // SAFETY: located under `guard`.
    let keep = unsafe { located.version.deref() };

    let on_top = std::ptr::eq(located.newer, &head.older) && located.below == located.version;
    let dropped = keep.status() == VersionStatus::Deleted
        && on_top
        && head
            .older
            .compare_exchange(
                located.version,
                Shared::null(),
                Ordering::AcqRel,
                Ordering::Acquire,
                guard,
            )
            .is_ok();

    let mut cur = if dropped {
        located.version
    } else {
        keep.freeze();
        keep.older.swap(Shared::null(), Ordering::AcqRel, guard)
    };
    let mut reclaimed = 0;
    while let Some(rv) = unsafe { cur.as_ref() } {
        let next = rv.older.load(Ordering::Acquire, guard);
        // SAFETY: the tail is unreachable from the head now; readers that were
        // already inside it hold older epochs.
        unsafe { guard.defer_destroy(cur) };
        reclaimed += 1;
        cur = next;
    }
    (reclaimed, dropped)
}

/// A worker's exclusive handle on its commit slot table.
pub struct Context {
    db: Arc<Database>,
    thread_id: ThreadId,
}

impl Context {
    pub fn thread_id(&self) -> ThreadId {
        self.thread_id
    }

    pub fn db(&self) -> &Arc<Database> {
        &self.db
    }

    /// Start a transaction. Fails with `ResourceExhausted` while every commit slot of
    /// this context is held by an unfinished transaction.
    pub fn begin(&mut self) -> Result<Transaction<'_>> {
        let ts = self.db.start_timestamp(self.thread_id);
        let claimed = self
            .db
            .registry
            .table(self.thread_id)
            .and_then(|slots| slots.allocate_slot(ts));
        match claimed {
            Some((slot_index, generation)) => {
                Ok(Transaction::new(self, ts, slot_index, generation))
            }
            None => {
                self.db.finish_timestamp(self.thread_id);
                Err(Error::ResourceExhausted {
                    resource: format!("commit slots of context {}", self.thread_id),
                })
            }
        }
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        self.db.finish_timestamp(self.thread_id);
        self.db.claimed[self.thread_id as usize].store(false, Ordering::Release);
    }
}
