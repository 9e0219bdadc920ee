use rand::{thread_rng, Rng};
use snowdrift::SyncMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

#[test]
fn disjoint_writers_do_not_interfere() {
    const THREADS: usize = 4;
    const PER_THREAD: usize = 1_000;

    let map = Arc::new(SyncMap::<usize, usize>::new());

    let handles: Vec<_> = (0..THREADS)
        .map(|t| {
            let map = Arc::clone(&map);
            thread::spawn(move || {
                let guard = map.guard();
                for i in (t * PER_THREAD)..((t + 1) * PER_THREAD) {
                    map.store(i, i * 2, &guard);
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }

    let guard = map.guard();
    for i in 0..(THREADS * PER_THREAD) {
        assert_eq!(map.load(&i, &guard), Some(&(i * 2)));
    }
    assert_eq!(map.iter(&guard).count(), THREADS * PER_THREAD);
}

#[test]
fn load_or_store_has_exactly_one_winner_per_key() {
    const THREADS: usize = 8;
    const KEYS: usize = 128;

    let map = Arc::new(SyncMap::<usize, usize>::new());
    let winners: Arc<Vec<AtomicUsize>> =
        Arc::new((0..KEYS).map(|_| AtomicUsize::new(0)).collect());

    let handles: Vec<_> = (0..THREADS)
        .map(|t| {
            let map = Arc::clone(&map);
            let winners = Arc::clone(&winners);
            thread::spawn(move || {
                for key in 0..KEYS {
                    let guard = map.guard();
                    let (actual, loaded) = map.load_or_store(key, t, &guard);
                    if !loaded {
                        assert_eq!(actual, &t);
                        winners[key].fetch_add(1, Ordering::Relaxed);
                    }
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }

    for key in 0..KEYS {
        assert_eq!(winners[key].load(Ordering::Relaxed), 1, "key {}", key);
    }

    // every thread that lost must have seen the winner's value
    let guard = map.guard();
    for key in 0..KEYS {
        let v = *map.load(&key, &guard).unwrap();
        assert!(v < THREADS);
    }
}

#[test]
fn readers_see_old_value_absence_or_new_value() {
    const KEYS: usize = 8;
    const ROUNDS: usize = 2_000;

    let map = Arc::new(SyncMap::<usize, usize>::new());
    let done = Arc::new(AtomicUsize::new(0));

    let writer = {
        let map = Arc::clone(&map);
        let done = Arc::clone(&done);
        thread::spawn(move || {
            for _ in 0..ROUNDS {
                let guard = map.guard();
                for key in 0..KEYS {
                    map.store(key, key + 100, &guard);
                }
                for key in 0..KEYS {
                    map.delete(&key, &guard);
                }
            }
            done.store(1, Ordering::Release);
        })
    };

    let readers: Vec<_> = (0..4)
        .map(|_| {
            let map = Arc::clone(&map);
            let done = Arc::clone(&done);
            thread::spawn(move || {
                while done.load(Ordering::Acquire) == 0 {
                    let guard = map.guard();
                    for key in 0..KEYS {
                        if let Some(v) = map.load(&key, &guard) {
                            // a key is either absent or holds the one value
                            // ever written for it, never anything torn
                            assert_eq!(*v, key + 100);
                        }
                    }
                }
            })
        })
        .collect();

    writer.join().unwrap();
    for reader in readers {
        reader.join().unwrap();
    }
}

#[test]
fn clear_racing_stores_leaves_a_consistent_map() {
    let map = Arc::new(SyncMap::<usize, usize>::new());

    let mut handles = Vec::new();
    for i in 0..8 {
        let map = Arc::clone(&map);
        handles.push(thread::spawn(move || {
            map.store(i, i * 10, &map.guard());
        }));
    }
    for _ in 0..4 {
        let map = Arc::clone(&map);
        handles.push(thread::spawn(move || {
            map.clear(&map.guard());
        }));
    }
    for i in 0..8 {
        let map = Arc::clone(&map);
        handles.push(thread::spawn(move || {
            let guard = map.guard();
            if let Some(v) = map.load(&i, &guard) {
                assert_eq!(*v, i * 10);
            }
        }));
    }

    for handle in handles {
        handle.join().unwrap();
    }

    // whatever survived the races, a final clear must leave nothing
    let guard = map.guard();
    map.clear(&guard);
    let mut leftovers = 0;
    map.range(
        |_, _| {
            leftovers += 1;
            true
        },
        &guard,
    );
    assert_eq!(leftovers, 0);
}

#[test]
fn promotion_under_concurrent_readers() {
    const KEYS: usize = 512;

    let map = Arc::new(SyncMap::<usize, usize>::new());
    let done = Arc::new(AtomicUsize::new(0));

    let writer = {
        let map = Arc::clone(&map);
        let done = Arc::clone(&done);
        thread::spawn(move || {
            let guard = map.guard();
            for key in 0..KEYS {
                map.store(key, key, &guard);
            }
            done.store(1, Ordering::Release);
        })
    };

    // these lookups keep missing, which drives promotions while the writer
    // keeps re-amending the view with new keys
    let prober = {
        let map = Arc::clone(&map);
        let done = Arc::clone(&done);
        thread::spawn(move || {
            while done.load(Ordering::Acquire) == 0 {
                let guard = map.guard();
                for key in KEYS..KEYS + 64 {
                    assert!(map.load(&key, &guard).is_none());
                }
            }
        })
    };

    writer.join().unwrap();
    prober.join().unwrap();

    let guard = map.guard();
    for key in 0..KEYS {
        assert_eq!(map.load(&key, &guard), Some(&key));
    }
}

#[test]
fn mixed_random_operations() {
    const THREADS: usize = 4;
    const OPS: usize = 10_000;
    const KEY_SPACE: usize = 256;

    let map = Arc::new(SyncMap::<usize, usize>::new());

    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let map = Arc::clone(&map);
            thread::spawn(move || {
                let mut rng = thread_rng();
                for _ in 0..OPS {
                    let key = rng.gen_range(0..KEY_SPACE);
                    let guard = map.guard();
                    match rng.gen_range(0..6) {
                        0 => {
                            if let Some(v) = map.load(&key, &guard) {
                                assert_eq!(*v % KEY_SPACE, key);
                            }
                        }
                        1 => map.store(key, key + KEY_SPACE, &guard),
                        2 => {
                            map.delete(&key, &guard);
                        }
                        3 => {
                            let (v, _) = map.load_or_store(key, key, &guard);
                            assert_eq!(*v % KEY_SPACE, key);
                        }
                        4 => {
                            map.compare_and_swap(&key, &key, key + KEY_SPACE, &guard);
                        }
                        _ => {
                            map.compare_and_delete(&key, &(key + KEY_SPACE), &guard);
                        }
                    }
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }

    // every surviving value must still belong to its key
    let guard = map.guard();
    map.range(
        |key, value| {
            assert_eq!(*value % KEY_SPACE, *key);
            true
        },
        &guard,
    );
}
