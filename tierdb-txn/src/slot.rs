//! # Commit Slots
//!
//! A commit slot is the indirect visibility flag for every version one transaction
//! writes. Versions record `(thread_id, slot_index, generation)`; a reader resolves
//! that triple through the [`SlotRegistry`] and trusts the slot only while its
//! generation still matches.
//!
//! ```text
//!            claim (generation + 1)
//!   Vacant ───────────────────────────┐
//!                                     ▼
//!   Committed / Aborted ──claim──> Active ──> Committing ──> Committed
//!            ▲                        │
//!            └──────── abort ─────────┴──────────(abort)──> Aborted
//! ```
//!
//! Only the owning context mutates its slots. Remote readers take a consistent
//! snapshot with [`CommitSlot::observe`], retrying while a claim is in progress.

use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};

use crossbeam_utils::CachePadded;

use tierdb_core::{Generation, SlotIndex, ThreadId, Timestamp};

/// Lifecycle of a commit slot within one generation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CommitSlotState {
    /// Never claimed
    Vacant = 0,
    Active = 1,
    Committing = 2,
    Committed = 3,
    Aborted = 4,
}

impl CommitSlotState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => CommitSlotState::Active,
            2 => CommitSlotState::Committing,
            3 => CommitSlotState::Committed,
            4 => CommitSlotState::Aborted,
            _ => CommitSlotState::Vacant,
        }
    }

    /// The transaction owning this generation has not finished.
    pub fn is_in_flight(self) -> bool {
        matches!(self, CommitSlotState::Active | CommitSlotState::Committing)
    }
}

/// Consistent snapshot of one slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotView {
    pub generation: Generation,
    pub state: CommitSlotState,
    pub start_ts: Timestamp,
    pub commit_ts: Timestamp,
}

impl SlotView {
    /// Visibility of a version written under `generation` to a reader at `reader_ts`.
    pub fn is_visible_to(&self, generation: Generation, reader_ts: Timestamp) -> bool {
        self.generation == generation
            && self.state == CommitSlotState::Committed
            && self.commit_ts < reader_ts
    }
}

#[derive(Debug)]
pub struct CommitSlot {
    generation: AtomicU64,
    start_ts: AtomicU64,
    commit_ts: AtomicU64,
    state: AtomicU8,
}

impl Default for CommitSlot {
    fn default() -> Self {
        Self {
            generation: AtomicU64::new(0),
            start_ts: AtomicU64::new(0),
            commit_ts: AtomicU64::new(0),
            state: AtomicU8::new(CommitSlotState::Vacant as u8),
        }
    }
}

impl CommitSlot {
    pub fn state(&self) -> CommitSlotState {
        CommitSlotState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn generation(&self) -> Generation {
        self.generation.load(Ordering::Acquire)
    }

    /// Snapshot generation, state and timestamps as of a single generation.
    pub fn observe(&self) -> SlotView {
        loop {
            let before = self.generation.load(Ordering::Acquire);
            let state = CommitSlotState::from_u8(self.state.load(Ordering::Acquire));
            let start_ts = Timestamp::new(self.start_ts.load(Ordering::Acquire));
            let commit_ts = Timestamp::new(self.commit_ts.load(Ordering::Acquire));
            let after = self.generation.load(Ordering::Acquire);
            if before == after {
                return SlotView {
                    generation: before,
                    state,
                    start_ts,
                    commit_ts,
                };
            }
            std::hint::spin_loop();
        }
    }

    /// Start a new generation for a transaction beginning at `start_ts`.
    fn claim(&self, start_ts: Timestamp) -> Generation {
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        self.start_ts.store(start_ts.get(), Ordering::Release);
        self.commit_ts.store(Timestamp::MAX.get(), Ordering::Release);
        self.state.store(CommitSlotState::Active as u8, Ordering::Release);
        generation
    }

    pub(crate) fn begin_commit(&self) {
        self.state.store(CommitSlotState::Committing as u8, Ordering::Release);
    }

    pub(crate) fn commit(&self, commit_ts: Timestamp) {
        self.commit_ts.store(commit_ts.get(), Ordering::Release);
        self.state.store(CommitSlotState::Committed as u8, Ordering::Release);
    }

    pub(crate) fn abort(&self) {
        self.state.store(CommitSlotState::Aborted as u8, Ordering::Release);
    }
}

/// Fixed array of slots owned by one context.
pub struct CommitSlotTable {
    slots: Box<[CachePadded<CommitSlot>]>,
    cursor: AtomicUsize,
}

impl CommitSlotTable {
    pub fn new(capacity: usize) -> Self {
        let slots = (0..capacity)
            .map(|_| CachePadded::new(CommitSlot::default()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            slots,
            cursor: AtomicUsize::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn get_slot(&self, index: SlotIndex) -> Option<&CommitSlot> {
        self.slots.get(index as usize).map(|s| &**s)
    }

    /// Claim the next slot not held by a running transaction.
    ///
    /// Slots are handed out round-robin so a finished generation survives as long as
    /// possible. Returns `None` when every slot is in flight; the caller backs off.
    pub fn allocate_slot(&self, start_ts: Timestamp) -> Option<(SlotIndex, Generation)> {
        let capacity = self.slots.len();
        let start = self.cursor.load(Ordering::Relaxed);
        for step in 0..capacity {
            let index = (start + step) % capacity;
            let slot = &self.slots[index];
            if slot.state().is_in_flight() {
                continue;
            }
            let generation = slot.claim(start_ts);
            self.cursor.store((index + 1) % capacity, Ordering::Relaxed);
            return Some((index as SlotIndex, generation));
        }
        None
    }
}

/// Every context's slot table, addressable by thread id.
pub struct SlotRegistry {
    tables: Vec<CommitSlotTable>,
}

impl SlotRegistry {
    pub fn new(num_threads: usize, slots_per_thread: usize) -> Self {
        Self {
            tables: (0..num_threads)
                .map(|_| CommitSlotTable::new(slots_per_thread))
                .collect(),
        }
    }

    pub fn table(&self, thread_id: ThreadId) -> Option<&CommitSlotTable> {
        self.tables.get(thread_id as usize)
    }

    pub fn slot(&self, thread_id: ThreadId, index: SlotIndex) -> Option<&CommitSlot> {
        self.table(thread_id).and_then(|t| t.get_slot(index))
    }

    pub fn num_threads(&self) -> usize {
        self.tables.len()
    }
}
