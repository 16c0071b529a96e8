//! Row storage: per column family arrays of row heads plus row id allocation.

use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_epoch::{self as epoch, Guard, Shared};
use parking_lot::Mutex;

use tierdb_core::{Error, Result};

use crate::version::RowHead;

pub type TableId = u32;

pub struct Table {
    id: TableId,
    name: String,
    heads: Vec<Box<[RowHead]>>,
    row_capacity: u64,
    next_row: AtomicU64,
    free_rows: Mutex<Vec<u64>>,
}

impl Table {
    pub(crate) fn new(id: TableId, name: &str, num_cf: u16, row_capacity: u64) -> Self {
        let heads = (0..num_cf)
            .map(|_| (0..row_capacity).map(|_| RowHead::new()).collect())
            .collect();
        Self {
            id,
            name: name.to_string(),
            heads,
            row_capacity,
            next_row: AtomicU64::new(0),
            free_rows: Mutex::new(Vec::new()),
        }
    }

    pub fn id(&self) -> TableId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn num_column_families(&self) -> u16 {
        self.heads.len() as u16
    }

    pub fn row_capacity(&self) -> u64 {
        self.row_capacity
    }

    /// Row ids handed out so far (including freed ones)
    pub fn row_count(&self) -> u64 {
        self.next_row.load(Ordering::Acquire).min(self.row_capacity)
    }

    pub fn head(&self, cf_id: u16, row_id: u64) -> Result<&RowHead> {
        self.heads
            .get(cf_id as usize)
            .and_then(|cf| cf.get(row_id as usize))
            .ok_or_else(|| Error::InvalidHandle {
                message: format!(
                    "row {} (column family {}) is outside table {}",
                    row_id, cf_id, self.name
                ),
            })
    }

    pub(crate) fn allocate_row(&self) -> Option<u64> {
        if let Some(row_id) = self.free_rows.lock().pop() {
            return Some(row_id);
        }
        self.next_row
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |next| {
                (next < self.row_capacity).then_some(next + 1)
            })
            .ok()
    }

    pub(crate) fn deallocate_row(&self, row_id: u64) {
        self.free_rows.lock().push(row_id);
    }

    /// True when no column family holds a version for `row_id`.
    pub(crate) fn is_row_empty(&self, row_id: u64, guard: &Guard) -> bool {
        self.heads.iter().all(|cf| {
            cf.get(row_id as usize)
                .map_or(true, |head| head.older.load(Ordering::Acquire, guard).is_null())
        })
    }
}

impl Drop for Table {
    fn drop(&mut self) {
        // SAFETY: `&mut self` means no transaction can still reach these chains.
        unsafe {
            let guard = epoch::unprotected();
            for cf in &self.heads {
                for head in cf.iter() {
                    let mut cur = head.older.swap(Shared::null(), Ordering::Relaxed, guard);
                    while !cur.is_null() {
                        let owned = cur.into_owned();
                        cur = owned.older.load(Ordering::Relaxed, guard);
                        drop(owned);
                    }
                }
            }
        }
    }
}

impl std::fmt::Debug for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Table")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("column_families", &self.heads.len())
            .field("row_capacity", &self.row_capacity)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_row_allocation_reuses_freed_ids() {
        let table = Table::new(1, "t", 1, 2);
        assert_eq!(table.allocate_row(), Some(0));
        assert_eq!(table.allocate_row(), Some(1));
        assert_eq!(table.allocate_row(), None);

        table.deallocate_row(0);
        assert_eq!(table.allocate_row(), Some(0));
        assert_eq!(table.row_count(), 2);
    }

    #[test]
    fn test_head_bounds() {
        let table = Table::new(1, "t", 2, 4);
        assert!(table.head(1, 3).is_ok());
        assert_eq!(table.head(2, 0).unwrap_err().error_code(), "INVALID_HANDLE");
        assert_eq!(table.head(0, 4).unwrap_err().error_code(), "INVALID_HANDLE");
    }
}
