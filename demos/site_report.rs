//! Profile a small program that leaks on purpose, then print where its live
//! memory came from.
//!
//! ```sh
//! RUST_LOG=debug cargo run --example site_report -- report.json
//! ```

use std::{collections::BTreeMap, env, hint::black_box};

use dlmalloc::GlobalDlmalloc;
use lhl_heapprof::{alloc::profiling, ProfilingAlloc};

#[global_allocator]
static GLOBAL: ProfilingAlloc<GlobalDlmalloc> = ProfilingAlloc::new(GlobalDlmalloc);

#[inline(never)]
fn fill_cache(cache: &mut BTreeMap<u32, String>, n: u32) {
    for i in 0..n {
        cache.insert(i, format!("entry number {i}"));
    }
}

#[inline(never)]
fn scratch_buffers(rounds: usize) -> usize {
    let mut total = 0;
    for round in 0..rounds {
        let buf = black_box(vec![round as u8; 4096]);
        total += buf.len();
    }
    total
}

#[inline(never)]
fn leak_big_block() -> &'static mut [u64] {
    Box::leak(vec![0u64; 1 << 16].into_boxed_slice())
}

fn main() {
    env_logger::init();
    let ledger = profiling::install().expect("could not start the heap profiler");

    let mut cache = BTreeMap::new();
    fill_cache(&mut cache, 10_000);
    let scratch = scratch_buffers(1_000);
    let leaked = leak_big_block();
    log::debug!("scratch bytes churned: {scratch}, leaked block: {} words", leaked.len());

    let report = profiling::report().expect("installed above");
    let stdout = std::io::stdout();
    report
        .write_text(&mut stdout.lock())
        .expect("could not write report");

    if let Some(path) = env::args().nth(1) {
        report.write_to_file(&path).expect("could not write json report");
        println!("\njson report written to {path}");
    }

    drop(cache);
    println!("\nafter dropping the cache:\n{}", ledger.stats());
}
