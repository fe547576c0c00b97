//! Runs with `ProfilingAlloc` as this test binary's global allocator. Keep it
//! to a single test so no other test thread allocates at the site we watch.

use std::{alloc::System, hint::black_box};

use lhl_heapprof::{alloc::profiling, trace::StackHash, ProfilingAlloc};

#[global_allocator]
static GLOBAL: ProfilingAlloc<System> = ProfilingAlloc::new(System);

const WATCHED_SIZE: usize = 3 * 1024 * 1024 + 7;

#[inline(never)]
fn allocate_watched() -> Vec<u8> {
    black_box(Vec::with_capacity(WATCHED_SIZE))
}

/// Site holding at least `size` bytes
fn find_site(size: usize) -> (StackHash, usize) {
    profiling::ledger()
        .unwrap()
        .snapshot()
        .into_iter()
        .map(|(trace, bytes)| (trace.hash(), bytes))
        .find(|&(_, bytes)| bytes >= size)
        .expect("the watched allocation was not recorded")
}

fn live_at(hash: StackHash) -> usize {
    profiling::ledger()
        .unwrap()
        .snapshot()
        .into_iter()
        .find(|(trace, _)| trace.hash() == hash)
        .map(|(_, bytes)| bytes)
        .unwrap_or(0)
}

#[test]
fn hooked_allocations_reach_the_ledger() {
    assert!(profiling::ledger().is_none());
    let ledger = profiling::install().unwrap();
    assert!(std::ptr::eq(ledger, profiling::install().unwrap()));

    let mut buf = allocate_watched();
    let (site, before) = find_site(WATCHED_SIZE);
    let live = ledger.live_entry_count();
    assert!(live > 0);

    // A realloc the allocator refuses leaves the block with its first site
    assert!(buf.try_reserve_exact(1 << 62).is_err());
    assert_eq!(live_at(site), before);
    assert_eq!(ledger.live_entry_count(), live);

    drop(buf);
    assert_eq!(live_at(site), before - WATCHED_SIZE);

    // Growing a vec goes through realloc, the bytes must follow the new block
    let mut grown: Vec<u64> = Vec::with_capacity(1);
    grown.extend(0..100_000u64);
    let report = profiling::report().unwrap();
    assert!(report.total_live_bytes() >= 100_000 * 8);
    drop(grown);

    let mut text = Vec::new();
    report.write_text(&mut text).unwrap();
    assert!(!text.is_empty());
    assert!(ledger.is_enabled());
}
