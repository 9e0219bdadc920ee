use crate::map::{slot_entry, SyncMap};
use crossbeam_epoch::Guard;
use std::borrow::Borrow;
use std::hash::{BuildHasher, Hash};

// ===
// compare-and-swap and compare-and-delete need to look at the stored values,
// so this whole surface only exists when V can be compared.
// ===

impl<K, V, S> SyncMap<K, V, S>
where
    K: Hash + Eq,
    V: 'static + Sync + Send + PartialEq,
    S: BuildHasher,
{
    /// Stores `new` for `key` if the current value equals `old`. Returns
    /// true if the swap happened.
    ///
    /// An absent key never compares equal, even when `old` is a default
    /// value.
    ///
    /// # Examples
    ///
    /// ```
    /// use snowdrift::SyncMap;
    ///
    /// let map = SyncMap::new();
    /// let guard = map.guard();
    /// assert!(!map.compare_and_swap(&1, &0, 5, &guard));
    ///
    /// map.store(1, 0, &guard);
    /// assert!(map.compare_and_swap(&1, &0, 5, &guard));
    /// assert_eq!(map.load(&1, &guard), Some(&5));
    /// assert!(!map.compare_and_swap(&1, &0, 9, &guard));
    /// ```
    pub fn compare_and_swap<Q>(&self, key: &Q, old: &V, new: V, guard: &Guard) -> bool
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        self.check_guard(guard);
        let read = self.read_view(guard);
        if let Some(slot) = read.m.get(key) {
            // An expunged entry is an absent key, and failing is already
            // the right answer; no fallthrough to the slow path is needed.
            return slot_entry(slot, guard).try_compare_and_swap(
                old,
                new,
                self.expunged(),
                guard,
            );
        }
        if !read.amended {
            return false;
        }

        let mut state = self.dirty.lock();
        let read = self.read_view(guard);
        if let Some(slot) = read.m.get(key) {
            slot_entry(slot, guard).try_compare_and_swap(old, new, self.expunged(), guard)
        } else if let Some(slot) = state.map.as_ref().and_then(|dirty| dirty.get(key)) {
            let swapped =
                slot_entry(slot, guard).try_compare_and_swap(old, new, self.expunged(), guard);
            // The lock was needed to reach the entry, but the key set did
            // not change; count a miss so the steady state is restored
            // eventually.
            self.miss_locked(&mut state, guard);
            swapped
        } else {
            false
        }
    }

    /// Deletes the entry for `key` if its value equals `old`. Returns true
    /// if the entry was deleted.
    ///
    /// An absent key never compares equal, even when `old` is a default
    /// value.
    ///
    /// # Examples
    ///
    /// ```
    /// use snowdrift::SyncMap;
    ///
    /// let map = SyncMap::new();
    /// let guard = map.guard();
    /// map.store(1, "a", &guard);
    ///
    /// assert!(!map.compare_and_delete(&1, &"b", &guard));
    /// assert!(map.compare_and_delete(&1, &"a", &guard));
    /// assert_eq!(map.load(&1, &guard), None);
    /// ```
    pub fn compare_and_delete<Q>(&self, key: &Q, old: &V, guard: &Guard) -> bool
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        self.check_guard(guard);
        let read = self.read_view(guard);
        let mut entry = read.m.get(key).map(|slot| slot_entry(slot, guard));
        if entry.is_none() && read.amended {
            let mut state = self.dirty.lock();
            let read = self.read_view(guard);
            entry = read.m.get(key).map(|slot| slot_entry(slot, guard));
            if entry.is_none() && read.amended {
                // The key stays in the dirty map: the compare part may
                // still fail, and a deleted entry is expunged at the next
                // rebuild anyway. Record a miss either way.
                entry = state
                    .map
                    .as_ref()
                    .and_then(|dirty| dirty.get(key))
                    .map(|slot| slot_entry(slot, guard));
                self.miss_locked(&mut state, guard);
            }
        }
        match entry {
            Some(entry) => entry.try_compare_and_delete(old, self.expunged(), guard),
            None => false,
        }
    }
}
