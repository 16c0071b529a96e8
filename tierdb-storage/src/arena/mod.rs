//! # Page Arena - Far-Memory Allocation
//!
//! The arena hands out memory from a secondary (CXL / far-NUMA) tier in fixed 2 MiB
//! pages. Every page is backed by its own file on the device mount, so the same
//! physical memory can be bound at any virtual address by mapping the file again.
//!
//! ## Module Structure
//!
//! - `types.rs` - Page, Entry, Mapping records and introspection types
//! - `file.rs` - Page file naming, creation and cleanup
//! - `vm.rs` - Address discovery and fixed-address mapping
//! - `topology.rs` - CXL node detection
//! - `malloc.rs` - Contiguous and striped allocation helpers
//!
//! ## Arena Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        PageArena                            │
//! ├─────────────────────────────────────────────────────────────┤
//! │                                                             │
//! │   Pages (file-backed)    Entries (alloc)    Mappings (map)  │
//! │  ┌──────────────────┐   ┌──────────────┐   ┌─────────────┐  │
//! │  │ 0  node0  in_use │◄──│ e0: [0, 2]   │◄──│ 0x7f..000   │  │
//! │  │ 1  node1         │   │   refcount 1 │   │   e0, 2 pg  │  │
//! │  │ 2  node0  in_use │   ├──────────────┤   └─────────────┘  │
//! │  │ 3  node1  in_use │◄──│ e1: [3]      │                    │
//! │  └──────────────────┘   │   refcount 0 │                    │
//! │                         └──────────────┘                    │
//! │                                                             │
//! │  alloc ──> map ──> schedule_release ──> unmap ──> reclaim   │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Deferred Release
//!
//! `schedule_release` marks an entry pending removal. Its pages return to the free
//! pool the moment its refcount (the number of live mappings) reaches zero, which
//! may be immediately or at the last `unmap`.
//!
//! All metadata lives behind one mutex; alloc, map, unmap and release are atomic
//! with respect to each other.

macro_rules! arena_event {
    ($verbose:expr, $($arg:tt)+) => {
        if $verbose {
            tracing::info!($($arg)+)
        } else {
            tracing::debug!($($arg)+)
        }
    };
}

mod file;
mod malloc;
mod topology;
mod types;
mod vm;

pub use types::{ArenaStats, EntryId, EntryInfo, MappingInfo, PageInfo, PAGE_SIZE};

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use parking_lot::{Mutex, MutexGuard};
use tracing::{info, warn};

use tierdb_core::utils::{align_up, format_bytes, is_aligned};
use tierdb_core::{ArenaConfig, Error, Metrics, NodeId, Result};

use types::{Entry, Mapping, Page};

/// File-backed page allocator for the far-memory tier
pub struct PageArena {
    state: Mutex<ArenaState>,
    device_path: PathBuf,
    filename_prefix: String,
    num_nodes: usize,
    verbose: bool,
    max_address_retries: u32,
    metrics: Metrics,
}

struct ArenaState {
    pages: Vec<Page>,
    entries: Vec<Entry>,
    mappings: Vec<Option<Mapping>>,
    /// Base address -> page count of regions built by `malloc_striped`
    stripes: HashMap<usize, usize>,
}

impl ArenaState {
    fn entry(&self, id: EntryId) -> Result<&Entry> {
        match self.entries.get(id.0) {
            Some(entry) if !entry.is_vacant() => Ok(entry),
            _ => Err(Error::InvalidHandle {
                message: format!("{} is not a live allocation", id),
            }),
        }
    }

    fn entry_mut(&mut self, id: EntryId) -> Result<&mut Entry> {
        match self.entries.get_mut(id.0) {
            Some(entry) if !entry.is_vacant() => Ok(entry),
            _ => Err(Error::InvalidHandle {
                message: format!("{} is not a live allocation", id),
            }),
        }
    }

    fn vacant_entry(&mut self) -> usize {
        match self.entries.iter().position(Entry::is_vacant) {
            Some(id) => id,
            None => {
                self.entries.push(Entry::default());
                self.entries.len() - 1
            }
        }
    }

    fn vacant_mapping(&mut self) -> usize {
        match self.mappings.iter().position(Option::is_none) {
            Some(id) => id,
            None => {
                self.mappings.push(None);
                self.mappings.len() - 1
            }
        }
    }

    fn has_mapping_at(&self, addr: usize) -> bool {
        self.mappings.iter().flatten().any(|m| m.addr == addr)
    }

    fn overlaps_mapping(&self, addr: usize, len: usize) -> bool {
        self.mappings.iter().flatten().any(|m| {
            let m_end = m.addr + m.num_pages * PAGE_SIZE;
            addr < m_end && m.addr < addr + len
        })
    }

    /// Reclaim the entry if it is pending removal and unmapped. Returns true on reclaim.
    fn check_release(&mut self, entry_id: usize) -> bool {
        let entry = &mut self.entries[entry_id];
        if entry.refcount != 0 || !entry.to_remove {
            return false;
        }
        for &page_id in &entry.page_ids {
            self.pages[page_id].in_use = false;
        }
        entry.clear();
        true
    }

    fn available(&self, node: NodeId) -> usize {
        self.pages.iter().filter(|p| p.is_free_on(node)).count()
    }

    fn used_bytes(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| !e.is_vacant() && e.refcount > 0)
            .map(|e| e.num_pages * PAGE_SIZE)
            .sum()
    }
}

impl PageArena {
    /// Create the page files and build the arena.
    pub fn new(config: &ArenaConfig) -> Result<Self> {
        Self::with_metrics(config, Metrics::new())
    }

    pub fn with_metrics(config: &ArenaConfig, metrics: Metrics) -> Result<Self> {
        config.validate()?;

        let num_nodes = config
            .num_nodes
            .unwrap_or_else(|| topology::detect_nodes(Path::new(topology::CXL_DEVICES_DIR)));

        if config.clean_files_on_init {
            file::clean_files(&config.device_path, &config.filename_prefix)?;
        }

        let mut pages = Vec::with_capacity(config.num_pages_to_init);
        for page_id in 0..config.num_pages_to_init {
            let file_id = page_id;
            let path = file::page_path(&config.device_path, &config.filename_prefix, file_id);
            let home = file::create_page_file(&path)?;
            if config.verbose && page_id % 1000 == 0 {
                info!(page_id, total = config.num_pages_to_init, "Creating arena pages");
            }
            pages.push(Page {
                file_id,
                home: Some(home),
                node: page_id % num_nodes,
                in_use: false,
                reserved: false,
            });
        }

        for node in 0..num_nodes {
            let to_free = ArenaConfig::per_node(&config.num_pages_to_free, node);
            for page in pages
                .iter_mut()
                .filter(|p| p.node == node && p.is_live())
                .take(to_free)
            {
                page.home = None;
                file::remove_page_file(&file::page_path(
                    &config.device_path,
                    &config.filename_prefix,
                    page.file_id,
                ));
            }

            let to_reserve = ArenaConfig::per_node(&config.num_pages_to_reserve, node);
            for page in pages
                .iter_mut()
                .filter(|p| p.node == node && p.is_live())
                .take(to_reserve)
            {
                page.reserved = true;
            }
        }

        let live = pages.iter().filter(|p| p.is_live()).count();
        info!(
            device = ?config.device_path,
            pages = live,
            nodes = num_nodes,
            capacity = %format_bytes((live * PAGE_SIZE) as u64),
            "Page arena initialized"
        );

        Ok(Self {
            state: Mutex::new(ArenaState {
                pages,
                entries: Vec::new(),
                mappings: Vec::new(),
                stripes: HashMap::new(),
            }),
            device_path: config.device_path.clone(),
            filename_prefix: config.filename_prefix.clone(),
            num_nodes,
            verbose: config.verbose,
            max_address_retries: config.max_address_retries,
            metrics,
        })
    }

    fn lock(&self) -> MutexGuard<'_, ArenaState> {
        self.state.lock()
    }

    fn page_path(&self, file_id: usize) -> PathBuf {
        file::page_path(&self.device_path, &self.filename_prefix, file_id)
    }

    fn check_node(&self, node: NodeId) -> Result<()> {
        if node >= self.num_nodes {
            return Err(Error::InvalidArgument {
                message: format!("node {} out of range (arena has {} nodes)", node, self.num_nodes),
            });
        }
        Ok(())
    }

    pub fn num_nodes(&self) -> usize {
        self.num_nodes
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Claim `ceil(length / PAGE_SIZE)` free pages on `node` as one entry.
    ///
    /// Either every page is claimed or nothing changes.
    pub fn alloc(&self, length: usize, node: NodeId) -> Result<EntryId> {
        if length == 0 {
            return Err(Error::InvalidArgument {
                message: "cannot allocate zero bytes".to_string(),
            });
        }
        self.check_node(node)?;
        let num_pages = align_up(length, PAGE_SIZE) / PAGE_SIZE;

        let mut state = self.lock();
        let candidates: Vec<usize> = state
            .pages
            .iter()
            .enumerate()
            .filter(|(_, p)| p.is_free_on(node))
            .map(|(id, _)| id)
            .take(num_pages)
            .collect();

        if candidates.len() < num_pages {
            let available = candidates.len();
            drop(state);
            self.metrics.record_alloc_failure();
            warn!(node, requested_pages = num_pages, available, "Insufficient arena pages");
            return Err(Error::ResourceExhausted {
                resource: format!(
                    "{} pages on node {} ({} available)",
                    num_pages, node, available
                ),
            });
        }

        for &page_id in &candidates {
            state.pages[page_id].in_use = true;
        }
        let entry_id = state.vacant_entry();
        state.entries[entry_id] = Entry {
            length: num_pages * PAGE_SIZE,
            num_pages,
            refcount: 0,
            to_remove: false,
            page_ids: candidates,
        };
        drop(state);

        self.metrics.record_alloc(num_pages as u64);
        arena_event!(self.verbose, entry = entry_id, num_pages, node, "Allocated entry");
        Ok(EntryId(entry_id))
    }

    /// Mark the entry for removal; its pages are reclaimed once it has no mappings.
    pub fn schedule_release(&self, entry: EntryId) -> Result<()> {
        let mut state = self.lock();
        state.entry_mut(entry)?.to_remove = true;
        let reclaimed = state.check_release(entry.0);
        drop(state);

        if reclaimed {
            self.metrics.record_reclaim();
            arena_event!(self.verbose, entry = entry.0, "Reclaimed entry");
        }
        Ok(())
    }

    /// Bind pages of `entry` starting at byte `offset` to the fixed address `addr`.
    pub fn map(&self, entry: EntryId, addr: usize, offset: usize, length: usize) -> Result<()> {
        if !is_aligned(addr, PAGE_SIZE) {
            return Err(Error::Alignment {
                what: "address",
                value: addr,
                alignment: PAGE_SIZE,
            });
        }
        if !is_aligned(offset, PAGE_SIZE) {
            return Err(Error::Alignment {
                what: "offset",
                value: offset,
                alignment: PAGE_SIZE,
            });
        }
        if length == 0 {
            return Err(Error::InvalidArgument {
                message: "cannot map zero bytes".to_string(),
            });
        }

        let mut state = self.lock();
        let target = state.entry(entry)?;
        let end = offset.checked_add(length).ok_or_else(|| Error::InvalidArgument {
            message: format!("range {:#x}+{:#x} overflows the address space", offset, length),
        })?;
        if end > target.length {
            return Err(Error::InvalidArgument {
                message: format!(
                    "range {:#x}+{:#x} exceeds {} of {} bytes",
                    offset, length, entry, target.length
                ),
            });
        }

        let page_offset = offset / PAGE_SIZE;
        let num_pages = align_up(length, PAGE_SIZE) / PAGE_SIZE;
        if state.overlaps_mapping(addr, num_pages * PAGE_SIZE) {
            return Err(Error::AddressRace { addr });
        }

        let file_ids: Vec<usize> = target.page_ids[page_offset..page_offset + num_pages]
            .iter()
            .map(|&page_id| state.pages[page_id].file_id)
            .collect();

        for (i, &file_id) in file_ids.iter().enumerate() {
            let page_addr = addr + i * PAGE_SIZE;
            let bound = file::open_page_file(&self.page_path(file_id))
                .and_then(|f| vm::map_page_fixed(&f, page_addr));
            if let Err(e) = bound {
                vm::unmap_range(addr, i * PAGE_SIZE);
                warn!(entry = entry.0, addr = %format!("{:#x}", page_addr), error = %e, "Mapping failed");
                return Err(e);
            }
        }

        state.entry_mut(entry)?.refcount += 1;
        let mapping_id = state.vacant_mapping();
        state.mappings[mapping_id] = Some(Mapping {
            entry_id: entry.0,
            addr,
            length,
            page_offset,
            num_pages,
        });
        drop(state);

        self.metrics.record_map();
        arena_event!(
            self.verbose,
            mapping = mapping_id,
            entry = entry.0,
            page_offset,
            num_pages,
            addr = %format!("{:#x}", addr),
            "Created mapping"
        );
        Ok(())
    }

    /// Remove the mapping that starts at `addr` and run deferred release on its entry.
    pub fn unmap(&self, addr: usize) -> Result<()> {
        let mut state = self.lock();
        let mapping_id = state
            .mappings
            .iter()
            .position(|m| matches!(m, Some(m) if m.addr == addr))
            .ok_or_else(|| Error::InvalidHandle {
                message: format!("no mapping at {:#x}", addr),
            })?;

        let mapping = state.mappings[mapping_id].take().ok_or_else(|| Error::Internal {
            message: format!("mapping {} vanished under the lock", mapping_id),
        })?;
        vm::unmap_range(mapping.addr, mapping.num_pages * PAGE_SIZE);

        let entry = &mut state.entries[mapping.entry_id];
        entry.refcount = entry.refcount.saturating_sub(1);
        let reclaimed = state.check_release(mapping.entry_id);
        drop(state);

        self.metrics.record_unmap();
        arena_event!(self.verbose, mapping = mapping_id, addr = %format!("{:#x}", addr), "Removed mapping");
        if reclaimed {
            self.metrics.record_reclaim();
            arena_event!(self.verbose, entry = mapping.entry_id, "Reclaimed entry");
        }
        Ok(())
    }

    /// Page-aligned virtual range of at least `size` bytes that is unmapped right now.
    ///
    /// Another thread may take the range before it is bound; `map` then fails with
    /// `Error::AddressRace` and the caller should look again.
    pub fn find_free_address(&self, size: usize) -> Result<usize> {
        vm::reserve_address(align_up(size, PAGE_SIZE), PAGE_SIZE)
    }

    pub fn stats(&self) -> ArenaStats {
        let state = self.lock();
        ArenaStats {
            num_nodes: self.num_nodes,
            total_pages: state.pages.iter().filter(|p| p.is_live()).count(),
            pages_in_use: state.pages.iter().filter(|p| p.in_use).count(),
            pages_reserved: state.pages.iter().filter(|p| p.is_live() && p.reserved).count(),
            live_entries: state.entries.iter().filter(|e| !e.is_vacant()).count(),
            live_mappings: state.mappings.iter().flatten().count(),
            used_bytes: state.used_bytes(),
        }
    }

    /// Free, unreserved pages on `node`
    pub fn available(&self, node: NodeId) -> usize {
        self.lock().available(node)
    }

    pub fn used_bytes(&self) -> usize {
        self.lock().used_bytes()
    }

    pub fn page_info(&self) -> Vec<PageInfo> {
        let state = self.lock();
        state
            .pages
            .iter()
            .enumerate()
            .filter(|(_, p)| p.is_live())
            .map(|(page_id, p)| PageInfo {
                page_id,
                file_id: p.file_id,
                node: p.node,
                in_use: p.in_use,
                reserved: p.reserved,
            })
            .collect()
    }

    pub fn entry_info(&self, entry: EntryId) -> Result<EntryInfo> {
        let state = self.lock();
        let e = state.entry(entry)?;
        Ok(EntryInfo {
            entry_id: entry,
            length: e.length,
            num_pages: e.num_pages,
            refcount: e.refcount,
            pending_removal: e.to_remove,
            page_ids: e.page_ids.clone(),
        })
    }

    pub fn mapping_info(&self) -> Vec<MappingInfo> {
        self.lock().mappings.iter().flatten().map(MappingInfo::from).collect()
    }

    /// Run `f` over the page's own shared mapping of its backing file.
    pub fn with_page<R>(&self, page_id: usize, f: impl FnOnce(&mut [u8]) -> R) -> Result<R> {
        let mut state = self.lock();
        match state.pages.get_mut(page_id).and_then(|p| p.home.as_mut()) {
            Some(home) => Ok(f(&mut home[..])),
            None => Err(Error::InvalidHandle {
                message: format!("page {} is not part of the arena", page_id),
            }),
        }
    }

    /// Check the refcount and page ownership invariants.
    pub fn verify(&self) -> Result<()> {
        let state = self.lock();
        let mut owners = vec![0usize; state.pages.len()];

        for (id, entry) in state.entries.iter().enumerate() {
            if entry.is_vacant() {
                if entry.refcount != 0 || entry.num_pages != 0 {
                    return Err(Error::Internal {
                        message: format!("vacant entry {} carries state", id),
                    });
                }
                continue;
            }
            if entry.page_ids.len() != entry.num_pages {
                return Err(Error::Internal {
                    message: format!(
                        "entry {} lists {} pages but claims {}",
                        id,
                        entry.page_ids.len(),
                        entry.num_pages
                    ),
                });
            }
            let live_mappings = state
                .mappings
                .iter()
                .flatten()
                .filter(|m| m.entry_id == id)
                .count();
            if entry.refcount != live_mappings {
                return Err(Error::Internal {
                    message: format!(
                        "entry {} refcount {} but {} live mappings",
                        id, entry.refcount, live_mappings
                    ),
                });
            }
            for &page_id in &entry.page_ids {
                owners[page_id] += 1;
            }
        }

        for (page_id, page) in state.pages.iter().enumerate() {
            let owned = owners[page_id];
            if owned > 1 || page.in_use != (owned == 1) {
                return Err(Error::Internal {
                    message: format!(
                        "page {} in_use={} but owned by {} entries",
                        page_id, page.in_use, owned
                    ),
                });
            }
        }
        Ok(())
    }
}

impl Drop for PageArena {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        for mapping in state.mappings.iter_mut().filter_map(Option::take) {
            vm::unmap_range(mapping.addr, mapping.num_pages * PAGE_SIZE);
        }
    }
}
