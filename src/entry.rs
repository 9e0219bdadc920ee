use crossbeam_epoch::{Atomic, Guard, Owned, Shared};
use std::sync::atomic::Ordering;

/// A per-key cell holding the key's current value pointer.
///
/// The pointer takes one of exactly three meanings:
///
///  * null: the key has been deleted, but the entry is still reachable from
///    a view. A later store may revive it in place, without the lock.
///  * the map's expunged sentinel: the entry was deleted and then left out
///    of the dirty map when that map was last rebuilt. It must be re-adopted
///    into the dirty map (under the lock) before it may hold a value again.
///  * anything else: a live, heap-allocated value.
///
/// All transitions are atomic pointer operations. The value behind a live
/// pointer is never mutated in place; updates always swap the pointer.
pub(crate) struct Entry<V> {
    p: Atomic<V>,
}

/// Outcome of [`Entry::try_load_or_store`].
pub(crate) enum LoadOrStore<'g, V> {
    /// The entry already held a value.
    Loaded(&'g V),
    /// The entry was revived with the given value.
    Stored(&'g V),
    /// The entry is expunged; the value is handed back for the slow path.
    Expunged(V),
}

impl<V> Entry<V> {
    /// Creates an entry around an already-allocated value pointer.
    pub(crate) fn new(p: Shared<'_, V>) -> Self {
        Entry { p: Atomic::from(p) }
    }

    /// Returns the entry's value, or `None` if it is deleted or expunged.
    pub(crate) fn load<'g>(&self, expunged: Shared<'g, V>, guard: &'g Guard) -> Option<&'g V> {
        let p = self.p.load(Ordering::Acquire, guard);
        if p.is_null() || p == expunged {
            return None;
        }
        // safety: a live value pointer is only freed through a deferral,
        // which cannot run before `guard` is dropped
        Some(unsafe { p.deref() })
    }

    /// Swaps in `new` unless the entry is expunged.
    ///
    /// On success returns the previous pointer, which may be null; the
    /// caller owns retiring a non-null previous value. On failure the
    /// caller still owns `new` and must take the slow path.
    pub(crate) fn try_swap<'g>(
        &self,
        new: Shared<'g, V>,
        expunged: Shared<'g, V>,
        guard: &'g Guard,
    ) -> Result<Shared<'g, V>, ()> {
        let mut p = self.p.load(Ordering::Acquire, guard);
        loop {
            if p == expunged {
                return Err(());
            }
            match self
                .p
                .compare_exchange(p, new, Ordering::AcqRel, Ordering::Acquire, guard)
            {
                Ok(_) => return Ok(p),
                Err(e) => p = e.current,
            }
        }
    }

    /// Unconditionally swaps in `new` and returns the previous pointer.
    ///
    /// Only sound while the map's lock is held and the entry is known not
    /// to be expunged.
    pub(crate) fn swap_locked<'g>(&self, new: Shared<'g, V>, guard: &'g Guard) -> Shared<'g, V> {
        self.p.swap(new, Ordering::AcqRel, guard)
    }

    /// Loads the current value, or revives the entry with `value` if it is
    /// deleted. The allocation for `value` is only paid once the first load
    /// shows the entry is actually deleted.
    pub(crate) fn try_load_or_store<'g>(
        &self,
        value: V,
        expunged: Shared<'g, V>,
        guard: &'g Guard,
    ) -> LoadOrStore<'g, V> {
        let mut p = self.p.load(Ordering::Acquire, guard);
        if p == expunged {
            return LoadOrStore::Expunged(value);
        }
        if !p.is_null() {
            // safety: live pointer under our guard, see `load`
            return LoadOrStore::Loaded(unsafe { p.deref() });
        }

        let new = Owned::new(value).into_shared(guard);
        loop {
            match self.p.compare_exchange(
                Shared::null(),
                new,
                Ordering::AcqRel,
                Ordering::Acquire,
                guard,
            ) {
                // safety: just allocated, now published, bound to the guard
                Ok(_) => return LoadOrStore::Stored(unsafe { new.deref() }),
                Err(e) => p = e.current,
            }
            if p == expunged {
                // safety: `new` was never published, so we still own it
                return LoadOrStore::Expunged(*unsafe { new.into_owned() }.into_box());
            }
            if !p.is_null() {
                // safety: `new` was never published; `p` is guard-protected
                drop(unsafe { new.into_owned() });
                return LoadOrStore::Loaded(unsafe { p.deref() });
            }
        }
    }

    /// Deletes the entry's value, returning the previous pointer if there
    /// was one. The caller owns retiring the returned value.
    pub(crate) fn delete<'g>(
        &self,
        expunged: Shared<'g, V>,
        guard: &'g Guard,
    ) -> Option<Shared<'g, V>> {
        let mut p = self.p.load(Ordering::Acquire, guard);
        loop {
            if p.is_null() || p == expunged {
                return None;
            }
            match self.p.compare_exchange(
                p,
                Shared::null(),
                Ordering::AcqRel,
                Ordering::Acquire,
                guard,
            ) {
                Ok(_) => return Some(p),
                Err(e) => p = e.current,
            }
        }
    }

    /// Clears the expunged mark, turning the entry back into a plain
    /// deleted entry. Returns true if the entry was expunged, in which case
    /// the caller must re-insert it into the dirty map before releasing the
    /// lock.
    pub(crate) fn unexpunge_locked(&self, expunged: Shared<'_, V>, guard: &Guard) -> bool {
        self.p
            .compare_exchange(
                expunged,
                Shared::null(),
                Ordering::AcqRel,
                Ordering::Acquire,
                guard,
            )
            .is_ok()
    }

    /// Marks a deleted entry as expunged so that the dirty map being built
    /// can leave it out. Returns true if the entry ends up expunged, false
    /// if it holds a value and must be carried over.
    pub(crate) fn try_expunge_locked(&self, expunged: Shared<'_, V>, guard: &Guard) -> bool {
        let mut p = self.p.load(Ordering::Acquire, guard);
        while p.is_null() {
            match self.p.compare_exchange(
                Shared::null(),
                expunged,
                Ordering::AcqRel,
                Ordering::Acquire,
                guard,
            ) {
                Ok(_) => return true,
                Err(e) => p = e.current,
            }
        }
        p == expunged
    }

    /// True if the entry is currently expunged. Stable while the map's lock
    /// is held, since only lock holders clear the mark.
    pub(crate) fn is_expunged(&self, expunged: Shared<'_, V>, guard: &Guard) -> bool {
        self.p.load(Ordering::Relaxed, guard) == expunged
    }

    /// Frees `entry` and whatever value it still holds.
    ///
    /// # Safety
    ///
    /// `entry` must have left every view, and no guard that could still
    /// reach it may be live. The value pointer is read here, not earlier,
    /// because writers holding an old view may replace it right up until
    /// their guards drop.
    pub(crate) unsafe fn finalize(entry: *mut Self, expunged: usize) {
        let entry = Box::from_raw(entry);
        let p = entry.p.load(Ordering::Relaxed, crossbeam_epoch::unprotected());
        if !p.is_null() && p.as_raw() as usize != expunged {
            drop(p.into_owned());
        }
    }
}

// compare-and-swap support. These need to look at the pointee, so they are
// only available when values can be compared.
impl<V> Entry<V>
where
    V: PartialEq,
{
    /// Swaps in `new` if the current value equals `old` and the entry is
    /// neither deleted nor expunged. The allocation for `new` is only paid
    /// once the first equality check passes, so the common stale-`old`
    /// failure allocates nothing.
    pub(crate) fn try_compare_and_swap(
        &self,
        old: &V,
        new: V,
        expunged: Shared<'_, V>,
        guard: &Guard,
    ) -> bool {
        let mut p = self.p.load(Ordering::Acquire, guard);
        // safety: a non-null, non-expunged pointer is live under our guard
        if p.is_null() || p == expunged || unsafe { p.deref() } != old {
            return false;
        }
        let new = Owned::new(new).into_shared(guard);
        loop {
            match self
                .p
                .compare_exchange(p, new, Ordering::AcqRel, Ordering::Acquire, guard)
            {
                Ok(_) => {
                    // safety: `p` left the entry through the swap; readers
                    // that still see it hold guards
                    unsafe { guard.defer_destroy(p) };
                    return true;
                }
                Err(e) => p = e.current,
            }
            // safety: as above for `p`; `new` was never published
            if p.is_null() || p == expunged || unsafe { p.deref() } != old {
                drop(unsafe { new.into_owned() });
                return false;
            }
        }
    }

    /// Deletes the entry's value if it equals `old`.
    pub(crate) fn try_compare_and_delete(
        &self,
        old: &V,
        expunged: Shared<'_, V>,
        guard: &Guard,
    ) -> bool {
        let mut p = self.p.load(Ordering::Acquire, guard);
        loop {
            // safety: a non-null, non-expunged pointer is live under our guard
            if p.is_null() || p == expunged || unsafe { p.deref() } != old {
                return false;
            }
            match self.p.compare_exchange(
                p,
                Shared::null(),
                Ordering::AcqRel,
                Ordering::Acquire,
                guard,
            ) {
                Ok(_) => {
                    // safety: unlinked by the swap, see above
                    unsafe { guard.defer_destroy(p) };
                    return true;
                }
                Err(e) => p = e.current,
            }
        }
    }
}

/// Allocates a map's expunged sentinel.
///
/// `Option<V>` is never zero-sized, so the allocation is a real heap address
/// distinct from every live value allocation, including when `V` itself is
/// zero-sized. The address is aligned for `V` and never dereferenced.
pub(crate) fn alloc_expunged<V>() -> usize {
    Box::into_raw(Box::new(Option::<V>::None)) as usize
}

/// Frees a sentinel produced by [`alloc_expunged`].
///
/// # Safety
///
/// `raw` must come from `alloc_expunged::<V>` and must not be freed twice.
/// Pending deferred destructors only ever compare the address, so they may
/// outlive it.
pub(crate) unsafe fn free_expunged<V>(raw: usize) {
    drop(Box::from_raw(raw as *mut Option<V>));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_epoch as epoch;

    struct Sentinel(usize);

    impl Sentinel {
        fn new() -> Self {
            Sentinel(alloc_expunged::<usize>())
        }

        fn shared(&self) -> Shared<'_, usize> {
            Shared::from(self.0 as *const usize)
        }
    }

    impl Drop for Sentinel {
        fn drop(&mut self) {
            // safety: allocated by `alloc_expunged` in `new`, freed once
            unsafe { free_expunged::<usize>(self.0) }
        }
    }

    fn live_entry(value: usize, guard: &Guard) -> Entry<usize> {
        Entry::new(Owned::new(value).into_shared(guard))
    }

    fn discard(entry: &Entry<usize>, sentinel: &Sentinel, guard: &Guard) {
        if let Some(p) = entry.delete(sentinel.shared(), guard) {
            // safety: unlinked by `delete`, freed after the guard
            unsafe { guard.defer_destroy(p) };
        }
    }

    #[test]
    fn load_live_value() {
        let sentinel = Sentinel::new();
        let guard = &epoch::pin();
        let entry = live_entry(7, guard);
        assert_eq!(entry.load(sentinel.shared(), guard), Some(&7));
        discard(&entry, &sentinel, guard);
    }

    #[test]
    fn delete_then_load_none() {
        let sentinel = Sentinel::new();
        let guard = &epoch::pin();
        let entry = live_entry(7, guard);
        discard(&entry, &sentinel, guard);
        assert_eq!(entry.load(sentinel.shared(), guard), None);
        assert_eq!(entry.delete(sentinel.shared(), guard), None);
    }

    #[test]
    fn try_swap_replaces_and_returns_old() {
        let sentinel = Sentinel::new();
        let guard = &epoch::pin();
        let entry = live_entry(1, guard);

        let new = Owned::new(2usize).into_shared(guard);
        let old = entry
            .try_swap(new, sentinel.shared(), guard)
            .expect("entry is not expunged");
        assert_eq!(unsafe { old.deref() }, &1);
        unsafe { guard.defer_destroy(old) };

        assert_eq!(entry.load(sentinel.shared(), guard), Some(&2));
        discard(&entry, &sentinel, guard);
    }

    #[test]
    fn try_swap_revives_deleted_entry() {
        let sentinel = Sentinel::new();
        let guard = &epoch::pin();
        let entry = live_entry(1, guard);
        discard(&entry, &sentinel, guard);

        let new = Owned::new(2usize).into_shared(guard);
        let old = entry
            .try_swap(new, sentinel.shared(), guard)
            .expect("deleted entries accept stores");
        assert!(old.is_null());
        assert_eq!(entry.load(sentinel.shared(), guard), Some(&2));
        discard(&entry, &sentinel, guard);
    }

    #[test]
    fn try_swap_refuses_expunged() {
        let sentinel = Sentinel::new();
        let guard = &epoch::pin();
        let entry = live_entry(1, guard);
        discard(&entry, &sentinel, guard);
        assert!(entry.try_expunge_locked(sentinel.shared(), guard));

        let new = Owned::new(2usize).into_shared(guard);
        assert!(entry.try_swap(new, sentinel.shared(), guard).is_err());
        // the caller keeps ownership of a refused value
        drop(unsafe { new.into_owned() });
    }

    #[test]
    fn expunge_only_applies_to_deleted_entries() {
        let sentinel = Sentinel::new();
        let guard = &epoch::pin();
        let entry = live_entry(1, guard);
        assert!(!entry.try_expunge_locked(sentinel.shared(), guard));
        assert!(!entry.is_expunged(sentinel.shared(), guard));

        discard(&entry, &sentinel, guard);
        assert!(entry.try_expunge_locked(sentinel.shared(), guard));
        assert!(entry.is_expunged(sentinel.shared(), guard));
        // idempotent once expunged
        assert!(entry.try_expunge_locked(sentinel.shared(), guard));
    }

    #[test]
    fn unexpunge_returns_entry_to_deleted() {
        let sentinel = Sentinel::new();
        let guard = &epoch::pin();
        let entry = live_entry(1, guard);
        discard(&entry, &sentinel, guard);
        entry.try_expunge_locked(sentinel.shared(), guard);

        assert!(entry.unexpunge_locked(sentinel.shared(), guard));
        assert!(!entry.is_expunged(sentinel.shared(), guard));
        // a second call sees a plain deleted entry
        assert!(!entry.unexpunge_locked(sentinel.shared(), guard));
        assert_eq!(entry.load(sentinel.shared(), guard), None);
    }

    #[test]
    fn compare_and_swap_checks_the_pointee() {
        let sentinel = Sentinel::new();
        let guard = &epoch::pin();
        let entry = live_entry(1, guard);

        assert!(!entry.try_compare_and_swap(&9, 2, sentinel.shared(), guard));
        assert_eq!(entry.load(sentinel.shared(), guard), Some(&1));

        assert!(entry.try_compare_and_swap(&1, 2, sentinel.shared(), guard));
        assert_eq!(entry.load(sentinel.shared(), guard), Some(&2));

        discard(&entry, &sentinel, guard);
        // absent and expunged entries never compare equal to anything
        assert!(!entry.try_compare_and_swap(&2, 3, sentinel.shared(), guard));
        entry.try_expunge_locked(sentinel.shared(), guard);
        assert!(!entry.try_compare_and_swap(&2, 3, sentinel.shared(), guard));
    }

    #[test]
    fn compare_and_delete_checks_the_pointee() {
        let sentinel = Sentinel::new();
        let guard = &epoch::pin();
        let entry = live_entry(1, guard);

        assert!(!entry.try_compare_and_delete(&9, sentinel.shared(), guard));
        assert_eq!(entry.load(sentinel.shared(), guard), Some(&1));

        assert!(entry.try_compare_and_delete(&1, sentinel.shared(), guard));
        assert_eq!(entry.load(sentinel.shared(), guard), None);
        assert!(!entry.try_compare_and_delete(&1, sentinel.shared(), guard));
    }

    #[test]
    fn try_load_or_store_states() {
        let sentinel = Sentinel::new();
        let guard = &epoch::pin();
        let entry = live_entry(1, guard);

        match entry.try_load_or_store(9, sentinel.shared(), guard) {
            LoadOrStore::Loaded(v) => assert_eq!(v, &1),
            _ => panic!("live entry must report Loaded"),
        }

        discard(&entry, &sentinel, guard);
        match entry.try_load_or_store(9, sentinel.shared(), guard) {
            LoadOrStore::Stored(v) => assert_eq!(v, &9),
            _ => panic!("deleted entry must report Stored"),
        }
        assert_eq!(entry.load(sentinel.shared(), guard), Some(&9));

        discard(&entry, &sentinel, guard);
        entry.try_expunge_locked(sentinel.shared(), guard);
        match entry.try_load_or_store(3, sentinel.shared(), guard) {
            LoadOrStore::Expunged(v) => assert_eq!(v, 3),
            _ => panic!("expunged entry must hand the value back"),
        }
    }
}
