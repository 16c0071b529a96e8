//! # Page Arena Tests
//!
//! This test suite verifies:
//! - All-or-nothing allocation per node
//! - Map / unmap bookkeeping and deferred release
//! - Contiguous and striped helpers
//! - Shared file-backed content across bindings
//! - Refcount and page ownership invariants under concurrency

use std::sync::Arc;
use std::thread;

use tempfile::TempDir;

use tierdb_core::{ArenaConfig, Metrics};
use tierdb_storage::{PageArena, PAGE_SIZE};

fn config(dir: &TempDir, pages: usize, nodes: usize) -> ArenaConfig {
    ArenaConfig {
        device_path: dir.path().to_path_buf(),
        num_pages_to_init: pages,
        num_nodes: Some(nodes),
        ..Default::default()
    }
}

fn create_arena(pages: usize, nodes: usize) -> (TempDir, PageArena) {
    let dir = TempDir::new().unwrap();
    let arena = PageArena::new(&config(&dir, pages, nodes)).unwrap();
    (dir, arena)
}

unsafe fn write_at(addr: usize, bytes: &[u8]) {
    std::ptr::copy_nonoverlapping(bytes.as_ptr(), addr as *mut u8, bytes.len());
}

unsafe fn read_at(addr: usize, len: usize) -> Vec<u8> {
    std::slice::from_raw_parts(addr as *const u8, len).to_vec()
}

#[test]
fn test_four_page_node_scenario() {
    let (_dir, arena) = create_arena(4, 1);

    for _ in 0..3 {
        arena.alloc(PAGE_SIZE, 0).unwrap();
    }
    let err = arena.alloc(2 * PAGE_SIZE, 0).unwrap_err();
    assert_eq!(err.error_code(), "RESOURCE_EXHAUSTED");

    let stats = arena.stats();
    assert_eq!(stats.pages_in_use, 3);
    assert_eq!(arena.available(0), 1);
    assert_eq!(arena.metrics().snapshot().alloc_failures, 1);
    arena.verify().unwrap();
}

#[test]
fn test_exhaustion_leaves_state_unchanged() {
    let (_dir, arena) = create_arena(6, 2);
    let e = arena.alloc(PAGE_SIZE, 1).unwrap();
    let addr = arena.find_free_address(PAGE_SIZE).unwrap();
    arena.map(e, addr, 0, PAGE_SIZE).unwrap();

    let stats = arena.stats();
    let pages = arena.page_info();
    let mappings = arena.mapping_info();

    assert!(arena.alloc(3 * PAGE_SIZE, 1).is_err());
    assert!(arena.alloc(4 * PAGE_SIZE, 0).is_err());

    assert_eq!(arena.stats(), stats);
    assert_eq!(arena.page_info(), pages);
    assert_eq!(arena.mapping_info(), mappings);
    arena.unmap(addr).unwrap();
}

#[test]
fn test_alloc_rounds_up_and_stays_on_node() {
    let (_dir, arena) = create_arena(8, 2);
    let e = arena.alloc(PAGE_SIZE + 1, 1).unwrap();
    let info = arena.entry_info(e).unwrap();
    assert_eq!(info.num_pages, 2);
    assert_eq!(info.length, 2 * PAGE_SIZE);

    let pages = arena.page_info();
    for page_id in &info.page_ids {
        let page = pages.iter().find(|p| p.page_id == *page_id).unwrap();
        assert_eq!(page.node, 1);
        assert!(page.in_use);
    }
    assert_eq!(arena.available(1), 2);
    assert_eq!(arena.available(0), 4);
}

#[test]
fn test_map_unmap_round_trip() {
    let (_dir, arena) = create_arena(4, 1);
    let e = arena.alloc(2 * PAGE_SIZE, 0).unwrap();
    let before = arena.entry_info(e).unwrap().refcount;

    let addr = arena.find_free_address(2 * PAGE_SIZE).unwrap();
    arena.map(e, addr, 0, 2 * PAGE_SIZE).unwrap();
    assert_eq!(arena.entry_info(e).unwrap().refcount, before + 1);
    assert_eq!(arena.used_bytes(), 2 * PAGE_SIZE);
    arena.verify().unwrap();

    arena.unmap(addr).unwrap();
    assert_eq!(arena.entry_info(e).unwrap().refcount, before);
    assert!(arena.mapping_info().is_empty());
    assert_eq!(arena.used_bytes(), 0);

    // The range is free again: a fixed mapping at the same address succeeds.
    arena.map(e, addr, 0, 2 * PAGE_SIZE).unwrap();
    arena.unmap(addr).unwrap();
    arena.verify().unwrap();
}

#[test]
fn test_map_with_offset() {
    let (_dir, arena) = create_arena(3, 1);
    let e = arena.alloc(3 * PAGE_SIZE, 0).unwrap();
    let addr = arena.find_free_address(PAGE_SIZE).unwrap();
    arena.map(e, addr, 2 * PAGE_SIZE, PAGE_SIZE).unwrap();

    let mapping = &arena.mapping_info()[0];
    assert_eq!(mapping.page_offset, 2);
    assert_eq!(mapping.num_pages, 1);

    let err = arena.map(e, addr + 4 * PAGE_SIZE, 2 * PAGE_SIZE, 2 * PAGE_SIZE).unwrap_err();
    assert_eq!(err.error_code(), "INVALID_ARGUMENT");
    arena.unmap(addr).unwrap();
}

#[test]
fn test_alignment_rejected_before_mapping() {
    let (_dir, arena) = create_arena(2, 1);
    let e = arena.alloc(PAGE_SIZE, 0).unwrap();
    let addr = arena.find_free_address(PAGE_SIZE).unwrap();

    let err = arena.map(e, addr + 4096, 0, PAGE_SIZE).unwrap_err();
    assert_eq!(err.error_code(), "ALIGNMENT_VIOLATION");
    let err = arena.map(e, addr, 4096, PAGE_SIZE).unwrap_err();
    assert_eq!(err.error_code(), "ALIGNMENT_VIOLATION");

    assert!(arena.mapping_info().is_empty());
    assert_eq!(arena.entry_info(e).unwrap().refcount, 0);
}

#[test]
fn test_overlapping_mapping_is_a_race() {
    let (_dir, arena) = create_arena(2, 1);
    let a = arena.alloc(PAGE_SIZE, 0).unwrap();
    let b = arena.alloc(PAGE_SIZE, 0).unwrap();
    let addr = arena.find_free_address(PAGE_SIZE).unwrap();

    arena.map(a, addr, 0, PAGE_SIZE).unwrap();
    let err = arena.map(b, addr, 0, PAGE_SIZE).unwrap_err();
    assert_eq!(err.error_code(), "ADDRESS_RACE");
    assert_eq!(arena.entry_info(b).unwrap().refcount, 0);
    arena.unmap(addr).unwrap();
}

#[test]
fn test_failed_map_unwinds_partial_progress() {
    let dir = TempDir::new().unwrap();
    let cfg = config(&dir, 2, 1);
    let arena = PageArena::new(&cfg).unwrap();
    let e = arena.alloc(2 * PAGE_SIZE, 0).unwrap();

    let second = arena.entry_info(e).unwrap().page_ids[1];
    let file_id = arena.page_info()[second].file_id;
    std::fs::remove_file(dir.path().join(format!("{}{}", cfg.filename_prefix, file_id))).unwrap();

    let addr = arena.find_free_address(2 * PAGE_SIZE).unwrap();
    let err = arena.map(e, addr, 0, 2 * PAGE_SIZE).unwrap_err();
    assert_eq!(err.error_code(), "IO_ERROR");
    assert_eq!(arena.entry_info(e).unwrap().refcount, 0);
    assert!(arena.mapping_info().is_empty());

    // The first page was unmapped again, so the address is still free.
    arena.schedule_release(e).unwrap();
    let other = arena.alloc(PAGE_SIZE, 0).unwrap();
    let first_page = arena.entry_info(other).unwrap().page_ids[0];
    assert_ne!(first_page, second);
    arena.map(other, addr, 0, PAGE_SIZE).unwrap();
    arena.unmap(addr).unwrap();
}

#[test]
fn test_deferred_release() {
    let (_dir, arena) = create_arena(2, 1);
    let e = arena.alloc(PAGE_SIZE, 0).unwrap();
    let addr = arena.find_free_address(PAGE_SIZE).unwrap();
    arena.map(e, addr, 0, PAGE_SIZE).unwrap();

    arena.schedule_release(e).unwrap();
    let info = arena.entry_info(e).unwrap();
    assert!(info.pending_removal);
    assert_eq!(arena.available(0), 1);

    arena.unmap(addr).unwrap();
    assert!(arena.entry_info(e).is_err());
    assert_eq!(arena.available(0), 2);
    assert_eq!(arena.metrics().snapshot().entries_reclaimed, 1);
    arena.verify().unwrap();
}

#[test]
fn test_release_without_mapping_is_immediate() {
    let (_dir, arena) = create_arena(1, 1);
    let e = arena.alloc(PAGE_SIZE, 0).unwrap();
    assert_eq!(arena.available(0), 0);
    arena.schedule_release(e).unwrap();
    assert_eq!(arena.available(0), 1);
}

#[test]
fn test_content_shared_through_page_file() {
    let (_dir, arena) = create_arena(2, 1);
    let e = arena.alloc(PAGE_SIZE, 0).unwrap();
    let first = arena.find_free_address(PAGE_SIZE).unwrap();
    arena.map(e, first, 0, PAGE_SIZE).unwrap();
    let second = arena.find_free_address(PAGE_SIZE).unwrap();
    arena.map(e, second, 0, PAGE_SIZE).unwrap();
    assert_eq!(arena.entry_info(e).unwrap().refcount, 2);

    unsafe { write_at(first + 128, b"far memory") };
    assert_eq!(unsafe { read_at(second + 128, 10) }, b"far memory");

    let page_id = arena.entry_info(e).unwrap().page_ids[0];
    let seen = arena.with_page(page_id, |bytes| bytes[128..138].to_vec()).unwrap();
    assert_eq!(seen, b"far memory");

    arena.unmap(first).unwrap();
    arena.unmap(second).unwrap();
}

#[test]
fn test_malloc_contiguous_and_free() {
    let (_dir, arena) = create_arena(4, 2);
    let addr = arena.malloc_contiguous(PAGE_SIZE + 10, 1).unwrap();
    assert_eq!(addr % PAGE_SIZE, 0);

    unsafe { write_at(addr + PAGE_SIZE, b"second page") };
    assert_eq!(unsafe { read_at(addr + PAGE_SIZE, 11) }, b"second page");

    let mapping = &arena.mapping_info()[0];
    assert_eq!(mapping.num_pages, 2);
    assert!(arena.entry_info(mapping.entry_id).unwrap().pending_removal);
    assert_eq!(arena.available(1), 0);

    arena.free_contiguous(addr).unwrap();
    assert_eq!(arena.available(1), 2);
    assert_eq!(arena.stats().live_entries, 0);
    arena.verify().unwrap();
}

#[test]
fn test_malloc_contiguous_any_falls_through_nodes() {
    let (_dir, arena) = create_arena(4, 2);
    let a = arena.malloc_contiguous(2 * PAGE_SIZE, 0).unwrap();
    let b = arena.malloc_contiguous_any(PAGE_SIZE).unwrap();

    let b_mapping = arena
        .mapping_info()
        .into_iter()
        .find(|m| m.addr == b)
        .unwrap();
    let page_id = arena.entry_info(b_mapping.entry_id).unwrap().page_ids[0];
    assert_eq!(arena.page_info()[page_id].node, 1);

    let c = arena.malloc_contiguous_any(PAGE_SIZE).unwrap();
    let err = arena.malloc_contiguous_any(PAGE_SIZE).unwrap_err();
    assert_eq!(err.error_code(), "RESOURCE_EXHAUSTED");

    for addr in [a, b, c] {
        arena.free_contiguous(addr).unwrap();
    }
    arena.verify().unwrap();
}

#[test]
fn test_malloc_striped_across_nodes() {
    let (_dir, arena) = create_arena(6, 3);
    let base = arena.malloc_striped(3 * PAGE_SIZE).unwrap();

    let mut mappings = arena.mapping_info();
    mappings.sort_by_key(|m| m.addr);
    assert_eq!(mappings.len(), 3);

    let pages = arena.page_info();
    let mut nodes = Vec::new();
    for (i, m) in mappings.iter().enumerate() {
        assert_eq!(m.addr, base + i * PAGE_SIZE);
        let page_id = arena.entry_info(m.entry_id).unwrap().page_ids[0];
        nodes.push(pages[page_id].node);
    }
    assert_eq!(nodes, vec![0, 1, 2]);

    unsafe { write_at(base + 2 * PAGE_SIZE, b"stripe") };
    assert_eq!(unsafe { read_at(base + 2 * PAGE_SIZE, 6) }, b"stripe");

    arena.free_striped(base).unwrap();
    assert!(arena.mapping_info().is_empty());
    assert_eq!(arena.stats().pages_in_use, 0);
    assert_eq!(arena.free_striped(base).unwrap_err().error_code(), "INVALID_HANDLE");
    arena.verify().unwrap();
}

#[test]
fn test_striped_region_freed_only_as_a_whole() {
    let (_dir, arena) = create_arena(4, 2);
    let base = arena.malloc_striped(2 * PAGE_SIZE).unwrap();

    let err = arena.free_contiguous(base).unwrap_err();
    assert_eq!(err.error_code(), "INVALID_ARGUMENT");
    assert_eq!(arena.mapping_info().len(), 2);

    // A page unbound behind the region's back leaves the rest untouched.
    arena.unmap(base + PAGE_SIZE).unwrap();
    assert_eq!(arena.free_striped(base).unwrap_err().error_code(), "INVALID_HANDLE");
    assert_eq!(arena.mapping_info().len(), 1);
    assert_eq!(arena.free_contiguous(base).unwrap_err().error_code(), "INVALID_ARGUMENT");

    arena.unmap(base).unwrap();
    assert_eq!(arena.stats().pages_in_use, 0);
    arena.verify().unwrap();

    let again = arena.malloc_striped(2 * PAGE_SIZE).unwrap();
    arena.free_striped(again).unwrap();
    assert!(arena.mapping_info().is_empty());
    arena.verify().unwrap();
}

#[test]
fn test_malloc_striped_failure_releases_everything() {
    let (_dir, arena) = create_arena(3, 3);
    let err = arena.malloc_striped(4 * PAGE_SIZE).unwrap_err();
    assert_eq!(err.error_code(), "RESOURCE_EXHAUSTED");
    assert_eq!(arena.stats().pages_in_use, 0);
    assert_eq!(arena.stats().live_entries, 0);
}

#[test]
fn test_per_node_free_and_reserve() {
    let dir = TempDir::new().unwrap();
    let cfg = ArenaConfig {
        num_pages_to_free: vec![1, 0],
        num_pages_to_reserve: vec![0, 2],
        ..config(&dir, 8, 2)
    };
    let arena = PageArena::new(&cfg).unwrap();

    let stats = arena.stats();
    assert_eq!(stats.total_pages, 7);
    assert_eq!(stats.pages_reserved, 2);
    assert_eq!(arena.available(0), 3);
    assert_eq!(arena.available(1), 2);
    assert!(!dir.path().join(format!("{}0", cfg.filename_prefix)).exists());

    assert!(arena.alloc(3 * PAGE_SIZE, 1).is_err());
    arena.alloc(2 * PAGE_SIZE, 1).unwrap();
}

#[test]
fn test_clean_files_on_init() {
    let dir = TempDir::new().unwrap();
    let stale = dir.path().join("tierdb_cxl_99");
    std::fs::write(&stale, b"stale").unwrap();

    let cfg = ArenaConfig {
        clean_files_on_init: true,
        ..config(&dir, 2, 1)
    };
    let arena = PageArena::new(&cfg).unwrap();
    assert!(!stale.exists());
    assert_eq!(arena.stats().total_pages, 2);
}

#[test]
fn test_concurrent_malloc_free() {
    let dir = TempDir::new().unwrap();
    let metrics = Metrics::new();
    let arena = Arc::new(PageArena::with_metrics(&config(&dir, 16, 2), metrics.clone()).unwrap());

    let handles: Vec<_> = (0..4)
        .map(|t| {
            let arena = Arc::clone(&arena);
            thread::spawn(move || {
                for i in 0..50 {
                    let node = (t + i) % 2;
                    if let Ok(addr) = arena.malloc_contiguous(PAGE_SIZE, node) {
                        unsafe { write_at(addr, &[t as u8; 8]) };
                        assert_eq!(unsafe { read_at(addr, 8) }, vec![t as u8; 8]);
                        arena.free_contiguous(addr).unwrap();
                    }
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }

    arena.verify().unwrap();
    let stats = arena.stats();
    assert_eq!(stats.pages_in_use, 0);
    assert_eq!(stats.live_mappings, 0);
    let snap = metrics.snapshot();
    assert_eq!(snap.mappings_created, snap.mappings_removed);
}
