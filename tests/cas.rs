use snowdrift::SyncMap;
use std::sync::Arc;
use std::thread;

#[test]
fn cas_on_empty_map() {
    let map = SyncMap::<usize, usize>::new();
    let guard = map.guard();

    assert!(!map.compare_and_swap(&1, &0, 0, &guard));
    assert!(!map.compare_and_delete(&1, &0, &guard));
}

#[test]
fn cas_swaps_only_on_match() {
    let map = SyncMap::<usize, usize>::new();
    let guard = map.guard();

    map.store(1, 0, &guard);
    assert!(map.compare_and_swap(&1, &0, 5, &guard));
    assert_eq!(map.load(&1, &guard), Some(&5));

    // stale expectation
    assert!(!map.compare_and_swap(&1, &0, 9, &guard));
    assert_eq!(map.load(&1, &guard), Some(&5));
}

#[test]
fn cad_deletes_only_on_match() {
    let map = SyncMap::<usize, usize>::new();
    let guard = map.guard();

    map.store(1, 5, &guard);
    assert!(!map.compare_and_delete(&1, &4, &guard));
    assert_eq!(map.load(&1, &guard), Some(&5));

    assert!(map.compare_and_delete(&1, &5, &guard));
    assert_eq!(map.load(&1, &guard), None);
    assert!(!map.compare_and_delete(&1, &5, &guard));
}

#[test]
fn cas_after_delete_and_reinsert() {
    let map = SyncMap::<usize, usize>::new();
    let guard = map.guard();

    map.store(1, 5, &guard);
    map.delete(&1, &guard);
    // a deleted key never compares equal
    assert!(!map.compare_and_swap(&1, &5, 6, &guard));

    map.store(1, 7, &guard);
    assert!(map.compare_and_swap(&1, &7, 8, &guard));
    assert_eq!(map.load(&1, &guard), Some(&8));
}

#[test]
fn cas_increment_ladder() {
    const THREADS: usize = 4;
    const PER_THREAD: usize = 1_000;

    let map = Arc::new(SyncMap::<&'static str, usize>::new());
    map.store("counter", 0, &map.guard());

    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let map = Arc::clone(&map);
            thread::spawn(move || {
                for _ in 0..PER_THREAD {
                    loop {
                        let guard = map.guard();
                        let current = *map.load("counter", &guard).unwrap();
                        if map.compare_and_swap("counter", &current, current + 1, &guard) {
                            break;
                        }
                    }
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }

    let guard = map.guard();
    assert_eq!(map.load("counter", &guard), Some(&(THREADS * PER_THREAD)));
}

#[test]
fn cad_racing_a_store_never_strands_the_old_value() {
    // Either the delete wins and the store re-inserts, or the store wins
    // and the delete fails on the changed value. The key must end up
    // holding the stored value in both interleavings.
    for _ in 0..200 {
        let map = Arc::new(SyncMap::<usize, usize>::new());
        map.store(1, 1, &map.guard());

        let deleter = {
            let map = Arc::clone(&map);
            thread::spawn(move || map.compare_and_delete(&1, &1, &map.guard()))
        };
        let storer = {
            let map = Arc::clone(&map);
            thread::spawn(move || map.store(1, 2, &map.guard()))
        };

        let _deleted = deleter.join().unwrap();
        storer.join().unwrap();

        let guard = map.guard();
        assert_eq!(map.load(&1, &guard), Some(&2));
    }
}

#[test]
fn readers_never_see_intermediate_cas_state() {
    let map = Arc::new(SyncMap::<usize, usize>::new());
    map.store(1, 100, &map.guard());

    let writer = {
        let map = Arc::clone(&map);
        thread::spawn(move || {
            let mut current = 100;
            while current < 200 {
                let guard = map.guard();
                assert!(map.compare_and_swap(&1, &current, current + 1, &guard));
                current += 1;
            }
        })
    };
    let reader = {
        let map = Arc::clone(&map);
        thread::spawn(move || {
            for _ in 0..10_000 {
                let guard = map.guard();
                let v = *map.load(&1, &guard).unwrap();
                assert!((100..=200).contains(&v));
            }
        })
    };

    writer.join().unwrap();
    reader.join().unwrap();

    let guard = map.guard();
    assert_eq!(map.load(&1, &guard), Some(&200));
}
