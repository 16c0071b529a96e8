//! Per-transaction access records and the bucket index that deduplicates them.

use std::sync::Arc;

use crossbeam_epoch::Owned;

use crate::table::{Table, TableId};
use crate::version::RowVersion;

/// What a transaction has done to one row so far
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RowAccessState {
    /// A new row that was deleted again before commit
    Invalid,
    Peek,
    Read,
    Write,
    ReadWrite,
    Delete,
    ReadDelete,
    New,
}

impl RowAccessState {
    pub fn has_read(self) -> bool {
        matches!(
            self,
            RowAccessState::Read | RowAccessState::ReadWrite | RowAccessState::ReadDelete
        )
    }

    pub fn has_write(self) -> bool {
        matches!(
            self,
            RowAccessState::Write
                | RowAccessState::ReadWrite
                | RowAccessState::Delete
                | RowAccessState::ReadDelete
        )
    }

    pub fn is_delete(self) -> bool {
        matches!(self, RowAccessState::Delete | RowAccessState::ReadDelete)
    }
}

/// The version a transaction will publish for a row.
pub(crate) enum WriteVersion {
    None,
    /// Still private to the transaction
    Unlinked(Owned<RowVersion>),
    /// Spliced into the chain, now owned by it
    Linked(*const RowVersion),
}

impl WriteVersion {
    pub fn version(&self) -> Option<&RowVersion> {
        match self {
            WriteVersion::None => None,
            WriteVersion::Unlinked(owned) => Some(&**owned),
            // SAFETY: linked versions are only reclaimed after every pinned
            // transaction, including the one holding this record, has unpinned.
            WriteVersion::Linked(ptr) => Some(unsafe { &**ptr }),
        }
    }
}

pub(crate) struct AccessItem {
    pub state: RowAccessState,
    pub table: Arc<Table>,
    pub cf_id: u16,
    pub row_id: u64,
    /// Version seen by peek; null for new rows
    pub read_rv: *const RowVersion,
    pub write: WriteVersion,
}

impl AccessItem {
    pub fn key(&self) -> AccessKey {
        AccessKey {
            table_id: self.table.id(),
            cf_id: self.cf_id,
            row_id: self.row_id,
        }
    }

    pub fn read_version(&self) -> Option<&RowVersion> {
        // SAFETY: see `WriteVersion::version`.
        unsafe { self.read_rv.as_ref() }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AccessKey {
    pub table_id: TableId,
    pub cf_id: u16,
    pub row_id: u64,
}

struct AccessBucket {
    slots: Vec<(AccessKey, usize)>,
    next: Option<usize>,
}

impl AccessBucket {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: Vec::with_capacity(capacity),
            next: None,
        }
    }
}

/// Open-chained hash index from row identity to access record index.
///
/// The first `root_count` buckets are chain roots; a full bucket links to an
/// overflow bucket appended at the end.
pub struct AccessBucketIndex {
    buckets: Vec<AccessBucket>,
    root_count: usize,
    bucket_size: usize,
}

impl AccessBucketIndex {
    pub fn new(root_count: usize, bucket_size: usize) -> Self {
        let root_count = root_count.max(1);
        let bucket_size = bucket_size.max(1);
        Self {
            buckets: (0..root_count)
                .map(|_| AccessBucket::with_capacity(bucket_size))
                .collect(),
            root_count,
            bucket_size,
        }
    }

    fn root(&self, key: &AccessKey) -> usize {
        ((key.table_id as u64).wrapping_add(key.row_id) % self.root_count as u64) as usize
    }

    pub fn find(&self, key: &AccessKey) -> Option<usize> {
        let mut bucket = Some(self.root(key));
        while let Some(id) = bucket {
            let b = &self.buckets[id];
            if let Some((_, index)) = b.slots.iter().find(|(k, _)| k == key) {
                return Some(*index);
            }
            bucket = b.next;
        }
        None
    }

    pub fn insert(&mut self, key: AccessKey, index: usize) {
        let mut id = self.root(&key);
        while let Some(next) = self.buckets[id].next {
            id = next;
        }
        if self.buckets[id].slots.len() == self.bucket_size {
            let overflow = self.buckets.len();
            self.buckets.push(AccessBucket::with_capacity(self.bucket_size));
            self.buckets[id].next = Some(overflow);
            id = overflow;
        }
        self.buckets[id].slots.push((key, index));
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    pub fn clear(&mut self) {
        self.buckets.truncate(self.root_count);
        for bucket in &mut self.buckets {
            bucket.slots.clear();
            bucket.next = None;
        }
    }
}
