use std::fmt;

use memmap2::MmapMut;
use serde::{Deserialize, Serialize};

use tierdb_core::NodeId;

/// Size of one arena page and of its backing file
pub const PAGE_SIZE: usize = 2 * 1024 * 1024;

/// Handle of a logical allocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntryId(pub(crate) usize);

impl EntryId {
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "entry#{}", self.0)
    }
}

/// One file-backed page.
///
/// `home` keeps the file mapped for the arena's lifetime; a page whose home is gone
/// was handed back at init and never participates in allocation.
pub(crate) struct Page {
    pub file_id: usize,
    pub home: Option<MmapMut>,
    pub node: NodeId,
    pub in_use: bool,
    pub reserved: bool,
}

impl Page {
    pub fn is_live(&self) -> bool {
        self.home.is_some()
    }

    pub fn is_free_on(&self, node: NodeId) -> bool {
        self.is_live() && !self.in_use && !self.reserved && self.node == node
    }
}

/// Logical allocation. An empty `page_ids` marks a vacant slot.
#[derive(Debug, Default)]
pub(crate) struct Entry {
    pub length: usize,
    pub num_pages: usize,
    pub refcount: usize,
    pub to_remove: bool,
    pub page_ids: Vec<usize>,
}

impl Entry {
    pub fn is_vacant(&self) -> bool {
        self.page_ids.is_empty()
    }

    pub fn clear(&mut self) {
        *self = Entry::default();
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct Mapping {
    pub entry_id: usize,
    pub addr: usize,
    pub length: usize,
    pub page_offset: usize,
    pub num_pages: usize,
}

/// Arena-wide counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArenaStats {
    pub num_nodes: usize,
    pub total_pages: usize,
    pub pages_in_use: usize,
    pub pages_reserved: usize,
    pub live_entries: usize,
    pub live_mappings: usize,
    /// Bytes of entries that currently have at least one mapping
    pub used_bytes: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageInfo {
    pub page_id: usize,
    pub file_id: usize,
    pub node: NodeId,
    pub in_use: bool,
    pub reserved: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryInfo {
    pub entry_id: EntryId,
    pub length: usize,
    pub num_pages: usize,
    pub refcount: usize,
    pub pending_removal: bool,
    pub page_ids: Vec<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappingInfo {
    pub entry_id: EntryId,
    pub addr: usize,
    pub length: usize,
    pub page_offset: usize,
    pub num_pages: usize,
}

impl From<&Mapping> for MappingInfo {
    fn from(m: &Mapping) -> Self {
        Self {
            entry_id: EntryId(m.entry_id),
            addr: m.addr,
            length: m.length,
            page_offset: m.page_offset,
            num_pages: m.num_pages,
        }
    }
}
