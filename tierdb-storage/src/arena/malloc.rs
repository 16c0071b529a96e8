//! Allocation helpers that combine alloc, address discovery and map.
//!
//! The returned pointer owns a mapping; the underlying entry is already scheduled
//! for release, so freeing the pointer is enough to return the pages.

use crossbeam_utils::Backoff;
use tracing::debug;

use tierdb_core::utils::align_up;
use tierdb_core::{Error, NodeId, Result};

use super::types::{EntryId, PAGE_SIZE};
use super::{vm, PageArena};

impl PageArena {
    /// Allocate `size` bytes on `node` and map them at a fresh address.
    pub fn malloc_contiguous(&self, size: usize, node: NodeId) -> Result<usize> {
        let size = align_up(size, PAGE_SIZE);
        let entry = self.alloc(size, node)?;

        match self.bind_with_retry(size, |addr| self.map(entry, addr, 0, size)) {
            Ok(addr) => {
                // A striped region abandoned at this address no longer owns it.
                self.lock().stripes.remove(&addr);
                self.schedule_release(entry)?;
                Ok(addr)
            }
            Err(e) => {
                self.schedule_release(entry)?;
                Err(e)
            }
        }
    }

    /// Try every node in order until one can hold `size` bytes.
    pub fn malloc_contiguous_any(&self, size: usize) -> Result<usize> {
        for node in 0..self.num_nodes {
            match self.malloc_contiguous(size, node) {
                Ok(addr) => return Ok(addr),
                Err(Error::ResourceExhausted { .. }) => continue,
                Err(e) => return Err(e),
            }
        }
        Err(Error::ResourceExhausted {
            resource: format!("{} bytes on any of {} nodes", size, self.num_nodes),
        })
    }

    pub fn free_contiguous(&self, addr: usize) -> Result<()> {
        if self.lock().stripes.contains_key(&addr) {
            return Err(Error::InvalidArgument {
                message: format!("{:#x} is a striped region; free it with free_striped", addr),
            });
        }
        self.unmap(addr)
    }

    /// Allocate one page per node round-robin and map them as one contiguous range.
    pub fn malloc_striped(&self, size: usize) -> Result<usize> {
        let size = align_up(size, PAGE_SIZE);
        let num_pages = size / PAGE_SIZE;
        if num_pages == 0 {
            return Err(Error::InvalidArgument {
                message: "cannot allocate zero bytes".to_string(),
            });
        }

        let mut entries: Vec<EntryId> = Vec::with_capacity(num_pages);
        for page_index in 0..num_pages {
            match self.alloc(PAGE_SIZE, page_index % self.num_nodes) {
                Ok(entry) => entries.push(entry),
                Err(e) => {
                    self.release_all(&entries);
                    return Err(e);
                }
            }
        }

        let bound = self.bind_with_retry(size, |base| {
            for (i, &entry) in entries.iter().enumerate() {
                if let Err(e) = self.map(entry, base + i * PAGE_SIZE, 0, PAGE_SIZE) {
                    for j in 0..i {
                        self.unmap(base + j * PAGE_SIZE)?;
                    }
                    return Err(e);
                }
            }
            Ok(())
        });
        self.release_all(&entries);

        let base = bound?;
        self.lock().stripes.insert(base, num_pages);
        Ok(base)
    }

    /// Unmap every page of a region returned by `malloc_striped`.
    ///
    /// Every page must still be mapped; otherwise nothing is unmapped and the
    /// region stays registered.
    pub fn free_striped(&self, addr: usize) -> Result<()> {
        let num_pages = {
            let state = self.lock();
            let num_pages = *state.stripes.get(&addr).ok_or_else(|| Error::InvalidHandle {
                message: format!("no striped region at {:#x}", addr),
            })?;
            if let Some(i) = (0..num_pages).find(|i| !state.has_mapping_at(addr + i * PAGE_SIZE)) {
                return Err(Error::InvalidHandle {
                    message: format!("page {} of striped region {:#x} is no longer mapped", i, addr),
                });
            }
            num_pages
        };
        for i in 0..num_pages {
            self.unmap(addr + i * PAGE_SIZE)?;
        }
        self.lock().stripes.remove(&addr);
        Ok(())
    }

    fn release_all(&self, entries: &[EntryId]) {
        for &entry in entries {
            if let Err(e) = self.schedule_release(entry) {
                tracing::warn!(entry = entry.index(), error = %e, "Failed to release entry");
            }
        }
    }

    /// Find a free range and bind it with `bind`, looking again whenever the range
    /// is taken first. Gives up after `max_address_retries` attempts.
    fn bind_with_retry<F>(&self, size: usize, mut bind: F) -> Result<usize>
    where
        F: FnMut(usize) -> Result<()>,
    {
        let backoff = Backoff::new();
        let mut last_addr = 0;

        for attempt in 0..self.max_address_retries {
            let addr = vm::reserve_address(size, PAGE_SIZE)?;
            match bind(addr) {
                Ok(()) => return Ok(addr),
                Err(Error::AddressRace { addr }) => {
                    self.metrics.record_address_retry();
                    debug!(attempt, addr = %format!("{:#x}", addr), "Address taken, retrying");
                    last_addr = addr;
                    backoff.snooze();
                }
                Err(e) => return Err(e),
            }
        }
        Err(Error::AddressRace { addr: last_addr })
    }
}
