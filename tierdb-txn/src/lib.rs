//! # TierDB Transactions
//!
//! Optimistic multi-version concurrency control whose visibility rule lives in
//! per-context commit slots instead of in the versions themselves.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        Read Path                             │
//! │                                                              │
//! │  peek_row ──> VersionLocator ──> writer's CommitSlot         │
//! │                    │              (generation, state, c_ts)  │
//! │                    ▼                                         │
//! │           newest version with c_ts < ts                      │
//! └──────────────────────────────────────────────────────────────┘
//!
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        Commit Path                           │
//! │                                                              │
//! │  raise read ts ──> DeferredVersionInstaller (CAS splice)     │
//! │        │                                                     │
//! │        ▼                                                     │
//! │  validate reads ──> Committing ──> CommitLogger ──> Committed│
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! A version written under `(thread, slot, generation)` is visible to a reader at
//! `r` only while that slot still carries `generation`, is `Committed`, and its
//! commit timestamp is strictly below `r`.

pub mod access;
pub mod context;
mod installer;
pub mod locator;
pub mod logger;
pub mod slot;
pub mod table;
pub mod transaction;
pub mod version;

pub use access::{AccessBucketIndex, AccessKey, RowAccessState};
pub use context::{Context, Database};
pub use locator::{AccessIntent, LocateMiss, Located, VersionLocator};
pub use logger::{CommitLogger, LoggedWrite, NullLogger};
pub use slot::{CommitSlot, CommitSlotState, CommitSlotTable, SlotRegistry, SlotView};
pub use table::{Table, TableId};
pub use transaction::{RowHandle, Transaction};
pub use version::{RowHead, RowVersion, VersionStatus, WriterStamp};
