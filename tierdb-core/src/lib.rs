//! # TierDB Core
//!
//! This crate provides the fundamental building blocks for TierDB:
//! - Identifier and timestamp types
//! - Error types
//! - Configuration
//! - Metrics
//! - Common utilities
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────┐
//! │                   tierdb-core                   │
//! ├─────────────────────────────────────────────────┤
//! │  • types    - Timestamps and identifiers       │
//! │  • error    - Error handling and abort reasons │
//! │  • config   - Arena and transaction settings   │
//! │  • metrics  - Arena and commit counters        │
//! │  • utils    - Common utilities                 │
//! └─────────────────────────────────────────────────┘
//!          ▲                          ▲
//!          │                          │
//!   tierdb-storage               tierdb-txn
//!   (page arena)          (commit-slot MVCC)
//! ```

pub mod config;
pub mod error;
pub mod metrics;
pub mod types;
pub mod utils;

// Re-export commonly used types
pub use config::{ArenaConfig, Config, TxnConfig};
pub use error::{AbortReason, Error, IoResultExt, Result};
pub use metrics::{Metrics, MetricsSnapshot};
pub use types::{Generation, NodeId, SlotIndex, ThreadId, Timestamp};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
