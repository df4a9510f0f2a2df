//! Multi-threaded chunk cache suite: reservation races, capacity bounds,
//! and byte fidelity under contention.

use silt_chunkcache::{ChunkCache, ChunkCacheConfig, ChunkQuery, Lookup};
use silt_types::{HashSize, ObjectId};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Barrier};

const CHUNK: u64 = 4096;
const OBJECT_SIZE: u64 = 1 << 24;

fn cache(capacity: u64) -> Arc<ChunkCache> {
    let cfg = ChunkCacheConfig::dram(capacity, HashSize::new(256).expect("hashsize"), CHUNK);
    Arc::new(ChunkCache::new(cfg).expect("cache"))
}

/// Deterministic per-chunk fill byte so readers can verify what they got.
fn fill_byte(offset: u64) -> u8 {
    (offset / CHUNK) as u8
}

fn query(name: &str, id: u32, offset: u64) -> ChunkQuery<'_> {
    ChunkQuery {
        name,
        object_id: ObjectId(id),
        object_size: OBJECT_SIZE,
        offset,
    }
}

#[test]
fn racing_reservations_yield_exactly_one() {
    let cache = cache(1 << 22);
    let num_threads = 8_usize;

    for round in 0_u64..32 {
        let offset = round * CHUNK;
        let barrier = Arc::new(Barrier::new(num_threads));
        let reservations = Arc::new(AtomicU64::new(0));
        let hits = Arc::new(AtomicU64::new(0));

        let handles: Vec<_> = (0..num_threads)
            .map(|_| {
                let cache = Arc::clone(&cache);
                let barrier = Arc::clone(&barrier);
                let reservations = Arc::clone(&reservations);
                let hits = Arc::clone(&hits);
                std::thread::spawn(move || {
                    barrier.wait();
                    let mut buf = vec![0_u8; 64];
                    match cache.lookup_or_reserve(&query("obj", 9, offset), &mut buf) {
                        Lookup::Miss(Some(r)) => {
                            reservations.fetch_add(1, Ordering::Relaxed);
                            cache
                                .publish(&r, &vec![fill_byte(offset); r.size() as usize])
                                .expect("publish");
                        }
                        Lookup::Miss(None) => {}
                        Lookup::Hit => {
                            hits.fetch_add(1, Ordering::Relaxed);
                            assert_eq!(buf, vec![fill_byte(offset); 64]);
                        }
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().expect("thread panicked");
        }

        assert_eq!(
            reservations.load(Ordering::Relaxed),
            1,
            "round {round}: exactly one racing caller may win the reservation"
        );
    }
}

#[test]
fn bytes_used_never_exceeds_capacity() {
    let capacity = 16 * CHUNK;
    let cache = cache(capacity);
    let num_threads = 8_usize;
    let barrier = Arc::new(Barrier::new(num_threads));

    let handles: Vec<_> = (0..num_threads)
        .map(|t| {
            let cache = Arc::clone(&cache);
            let barrier = Arc::clone(&barrier);
            std::thread::spawn(move || {
                barrier.wait();
                for i in 0_u64..64 {
                    let offset = (t as u64 * 64 + i) * CHUNK;
                    let mut buf = vec![0_u8; 64];
                    match cache.lookup_or_reserve(&query("obj", 1, offset), &mut buf) {
                        Lookup::Miss(Some(r)) => {
                            cache
                                .publish(&r, &vec![fill_byte(offset); r.size() as usize])
                                .expect("publish");
                        }
                        Lookup::Miss(None) | Lookup::Hit => {}
                    }
                    assert!(
                        cache.stats().bytes_used <= capacity,
                        "bytes_used must stay within capacity"
                    );
                }
            })
        })
        .collect();
    for h in handles {
        h.join().expect("thread panicked");
    }

    assert!(cache.stats().bytes_used <= capacity);
}

#[test]
fn published_bytes_are_exact_under_contention() {
    let cache = cache(1 << 22);
    let num_threads = 8_usize;
    let chunks = 32_u64;
    let barrier = Arc::new(Barrier::new(num_threads));

    let handles: Vec<_> = (0..num_threads)
        .map(|t| {
            let cache = Arc::clone(&cache);
            let barrier = Arc::clone(&barrier);
            std::thread::spawn(move || {
                barrier.wait();
                // Every thread walks all chunks in a different order.
                for i in 0_u64..chunks {
                    let offset = ((i * 7 + t as u64 * 11) % chunks) * CHUNK;
                    let mut buf = vec![0_u8; 256];
                    match cache.lookup_or_reserve(&query("obj", 2, offset + 128), &mut buf) {
                        Lookup::Hit => {
                            assert_eq!(
                                buf,
                                vec![fill_byte(offset); 256],
                                "hit bytes must match what was published"
                            );
                        }
                        Lookup::Miss(Some(r)) => {
                            cache
                                .publish(&r, &vec![fill_byte(offset); r.size() as usize])
                                .expect("publish");
                        }
                        Lookup::Miss(None) => {}
                    }
                }
            })
        })
        .collect();
    for h in handles {
        h.join().expect("thread panicked");
    }
}

#[test]
fn invalidation_hides_range_until_republished() {
    let cache = cache(1 << 22);

    let mut buf = vec![0_u8; 64];
    let r = match cache.lookup_or_reserve(&query("obj", 3, 0), &mut buf) {
        Lookup::Miss(Some(r)) => r,
        other => panic!("expected reservation, got {other:?}"),
    };
    cache
        .publish(&r, &vec![0x77; r.size() as usize])
        .expect("publish");

    cache.invalidate("obj", ObjectId(3), 0, CHUNK);

    for probe_offset in [0_u64, 100, 4000] {
        let mut probe = vec![0_u8; 64];
        match cache.lookup_or_reserve(&query("obj", 3, probe_offset), &mut probe) {
            Lookup::Miss(_) => {}
            Lookup::Hit => panic!("offset {probe_offset} must miss after invalidation"),
        }
    }
}

#[test]
fn distinct_objects_do_not_interfere() {
    let cache = cache(1 << 22);
    let num_threads = 6_usize;
    let barrier = Arc::new(Barrier::new(num_threads));

    let handles: Vec<_> = (0..num_threads)
        .map(|t| {
            let cache = Arc::clone(&cache);
            let barrier = Arc::clone(&barrier);
            std::thread::spawn(move || {
                barrier.wait();
                let id = ObjectId(t as u32);
                let name = format!("object-{t}");
                let byte = 0x10 + t as u8;
                for i in 0_u64..16 {
                    let offset = i * CHUNK;
                    let mut buf = vec![0_u8; 64];
                    match cache.lookup_or_reserve(&query(&name, id.0, offset), &mut buf) {
                        Lookup::Miss(Some(r)) => {
                            cache
                                .publish(&r, &vec![byte; r.size() as usize])
                                .expect("publish");
                        }
                        Lookup::Hit => assert_eq!(buf, vec![byte; 64]),
                        Lookup::Miss(None) => {}
                    }
                }
                // Re-read everything we cached.
                for i in 0_u64..16 {
                    let mut buf = vec![0_u8; 64];
                    if let Lookup::Hit =
                        cache.lookup_or_reserve(&query(&name, id.0, i * CHUNK), &mut buf)
                    {
                        assert_eq!(buf, vec![byte; 64]);
                    }
                }
            })
        })
        .collect();
    for h in handles {
        h.join().expect("thread panicked");
    }
}
