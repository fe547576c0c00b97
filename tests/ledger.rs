use hashbrown::HashMap;
use lhl_heapprof::{AllocationLedger, FixedTypeHashTable, StackTrace};
use rand::{rngs::StdRng, Rng, SeedableRng};

fn init_logging() {
    _ = env_logger::builder().is_test(true).try_init();
}

fn total_live_bytes(ledger: &AllocationLedger) -> usize {
    ledger.snapshot().iter().map(|(_, bytes)| bytes).sum()
}

fn traces(count: usize) -> Vec<StackTrace> {
    (1..=count)
        .map(|site| StackTrace::from_frames(&[0x4000 + site, 0x9000 + site * 7]))
        .collect()
}

#[test]
fn random_interleaving_conserves_live_bytes() {
    init_logging();
    let mut rng = StdRng::seed_from_u64(7);
    let ledger = AllocationLedger::new().unwrap();
    let traces = traces(40);
    let mut live: HashMap<usize, usize> = HashMap::new();
    let mut next_address = 0x10usize;

    for _ in 0..100_000 {
        if live.is_empty() || rng.gen_bool(0.5) {
            let size = rng.gen_range(1..4096);
            let trace = &traces[rng.gen_range(0..traces.len())];
            ledger.record_alloc(next_address, size, trace);
            live.insert(next_address, size);
            next_address += 16;
        } else {
            let address = *live.keys().next().unwrap();
            live.remove(&address);
            ledger.record_free(address, &StackTrace::empty());
        }
    }

    assert_eq!(total_live_bytes(&ledger), live.values().sum::<usize>());
    assert_eq!(ledger.live_entry_count(), live.len());
    assert!(ledger.site_count() <= traces.len());
    assert!(ledger.is_enabled());
}

#[test]
fn concurrent_threads_conserve_live_bytes() {
    init_logging();
    const THREADS: usize = 8;
    const OPS: usize = 20_000;

    let ledger = AllocationLedger::new().unwrap();
    let traces = traces(16);

    let kept: usize = crossbeam::scope(|s| {
        let handles: Vec<_> = (0..THREADS)
            .map(|thread| {
                let ledger = &ledger;
                let traces = &traces;
                s.spawn(move |_| {
                    let mut rng = StdRng::seed_from_u64(thread as u64);
                    // Disjoint address ranges per thread
                    let base = (thread + 1) << 32;
                    let mut live = Vec::new();
                    for i in 0..OPS {
                        if live.is_empty() || rng.gen_bool(0.6) {
                            let address = base + i * 16;
                            let size = rng.gen_range(1..512);
                            ledger.record_alloc(address, size, &traces[i % traces.len()]);
                            live.push((address, size));
                        } else {
                            let at = rng.gen_range(0..live.len());
                            let (address, _) = live.swap_remove(at);
                            ledger.record_free(address, &traces[0]);
                        }
                    }
                    live.iter().map(|(_, size)| size).sum::<usize>()
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).sum()
    })
    .unwrap();

    assert_eq!(total_live_bytes(&ledger), kept);
}

#[test]
fn frees_from_other_threads_hit_the_allocating_site() {
    let ledger = AllocationLedger::new().unwrap();
    let trace = StackTrace::from_frames(&[0xabc]);
    for i in 1..=1000usize {
        ledger.record_alloc(i * 8, 8, &trace);
    }
    crossbeam::scope(|s| {
        for chunk in 0..4usize {
            let ledger = &ledger;
            s.spawn(move |_| {
                for i in (chunk * 250 + 1)..=(chunk * 250 + 250) {
                    ledger.record_free(i * 8, &StackTrace::empty());
                }
            });
        }
    })
    .unwrap();
    assert_eq!(ledger.snapshot(), vec![(trace, 0)]);
    assert_eq!(ledger.live_entry_count(), 0);
}

/// A stable working set under constant churn must keep rebuilding in place
/// rather than growing, and must never pass the load limit.
#[test]
fn tombstones_stay_bounded_under_churn() {
    init_logging();
    let mut rng = StdRng::seed_from_u64(99);
    let mut table = FixedTypeHashTable::<u64, u64>::new(0, u64::MAX).unwrap();
    let mut live: Vec<u64> = (1..=400).collect();
    for &key in &live {
        table.insert(key, key).unwrap();
    }
    let settled_capacity = table.capacity();
    let mut next_key = 1_000u64;

    for _ in 0..200_000 {
        let at = rng.gen_range(0..live.len());
        let old = live.swap_remove(at);
        assert_eq!(table.remove(&old), Some(old));
        table.insert(next_key, next_key).unwrap();
        live.push(next_key);
        next_key += 1;

        let cap = table.capacity();
        assert!(table.used() <= cap - cap / 8);
    }

    assert_eq!(table.len(), live.len());
    assert!(table.capacity() <= settled_capacity * 2, "{table:?}");
    for key in live {
        assert_eq!(table.find(&key), Some(&key));
    }
}
