//! # TierDB Storage
//!
//! Far-memory page arena: physical pages on the CXL tier, logical allocations over
//! them, and the virtual-address bindings that expose them to the process.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Allocation Path                        │
//! │                                                             │
//! │  malloc_contiguous ──> alloc(node) ──> find_free_address    │
//! │                                             │               │
//! │                                             ▼               │
//! │                          map (MAP_FIXED, per-page file)     │
//! │                                             │               │
//! │                                             ▼               │
//! │                         schedule_release (deferred)         │
//! └─────────────────────────────────────────────────────────────┘
//!
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       Release Path                          │
//! │                                                             │
//! │  free_contiguous ──> unmap ──> refcount 0 + pending         │
//! │                                    │                        │
//! │                                    ▼                        │
//! │                          pages back to node pool            │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod arena;

pub use arena::{ArenaStats, EntryId, EntryInfo, MappingInfo, PageArena, PageInfo, PAGE_SIZE};
