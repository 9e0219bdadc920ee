use crate::entry::{self, Entry, LoadOrStore};
use crate::iter::{Iter, Keys, Values};
use crossbeam_epoch::{self as epoch, Atomic, Guard, Owned, Shared};
use parking_lot::Mutex;
use std::borrow::Borrow;
use std::collections::HashMap;
use std::fmt::{self, Debug, Formatter};
use std::hash::{BuildHasher, Hash};
use std::sync::atomic::Ordering;

/// An immutable snapshot of the map, published through an atomic pointer.
///
/// `amended` is true when the dirty map holds keys that `m` does not. The
/// slot table maps keys to shared entries; slots are never touched after
/// the view is published, all mutation goes through the entries themselves.
pub(crate) struct ReadView<K, V, S> {
    pub(crate) m: HashMap<K, Atomic<Entry<V>>, S>,
    pub(crate) amended: bool,
}

impl<K, V, S> ReadView<K, V, S>
where
    S: BuildHasher,
{
    fn empty(hash_builder: S) -> Self {
        ReadView {
            m: HashMap::with_hasher(hash_builder),
            amended: false,
        }
    }
}

/// Slow-path state, guarded by the map's one mutex.
pub(crate) struct DirtyState<K, V, S> {
    /// All live entries, while a dirty phase is active. `None` means the
    /// published read view is complete.
    pub(crate) map: Option<HashMap<K, Atomic<Entry<V>>, S>>,
    /// Slow-path lookups since the last promotion.
    pub(crate) misses: usize,
}

/// Loads the entry out of a slot.
///
/// Slots never change after insertion into a view or the dirty map;
/// publication of the containing table is what synchronises the entry's
/// contents, so a relaxed load suffices here.
pub(crate) fn slot_entry<'g, V>(slot: &Atomic<Entry<V>>, guard: &'g Guard) -> &'g Entry<V> {
    // safety: entries are only retired once they have left every view, and
    // never before outstanding guards are dropped
    unsafe { slot.load(Ordering::Relaxed, guard).deref() }
}

/// A concurrent map optimized for read-mostly key sets.
///
/// The map keeps two internal tables: a lock-free *read view* that handles
/// loads, stores, and deletes of existing keys without any locking, and a
/// mutex-guarded *dirty* table that picks up new keys. Once the slow path
/// has been taken about as often as the dirty table has entries, the dirty
/// table is promoted wholesale into a fresh read view and reads become
/// lock-free again. The design follows the two-view scheme of Go's
/// `sync.Map`.
///
/// This pays off when keys are written once and read many times (caches),
/// or when disjoint sets of keys are worked on by disjoint threads. Under
/// heavy write sharing a sharded map will beat it; under read-mostly load
/// it beats a mutex around a plain `HashMap` by never taking the lock on
/// the hot path.
///
/// Operations take a [`Guard`](crate::Guard) so that references to values
/// can outlive the calls that produced them. Obtain one from
/// [`SyncMap::guard`], or use [`SyncMap::pin`] for an API that keeps the
/// guard for you. All guards used with a map must come from the collector
/// the map was built with; mixing collectors panics.
///
/// # Examples
///
/// ```
/// use snowdrift::SyncMap;
///
/// let map = SyncMap::new();
/// let guard = map.guard();
/// map.store(92, "ninety-two", &guard);
/// assert_eq!(map.load(&92, &guard), Some(&"ninety-two"));
///
/// map.delete(&92, &guard);
/// assert_eq!(map.load(&92, &guard), None);
/// ```
pub struct SyncMap<K, V, S = crate::DefaultHashBuilder> {
    /// The currently published read view. Never null; replaced only while
    /// the mutex is held, and retired through the collector.
    pub(crate) read: Atomic<ReadView<K, V, S>>,

    /// Dirty table and miss accounting. The mutex also serialises every
    /// view publication: amending, promotion, and clearing.
    pub(crate) dirty: Mutex<DirtyState<K, V, S>>,

    /// Address of this map's expunged sentinel. Only ever compared against,
    /// never dereferenced.
    expunged: usize,

    /// Collector that all guards used with this map must belong to. A guard
    /// from a foreign collector could let the collector free a value while
    /// the foreign guard still hands out references to it.
    collector: epoch::Collector,

    build_hasher: S,
}

impl<K, V> SyncMap<K, V, crate::DefaultHashBuilder> {
    /// Creates an empty map.
    ///
    /// # Examples
    ///
    /// ```
    /// use snowdrift::SyncMap;
    /// let map: SyncMap<&str, i32> = SyncMap::new();
    /// ```
    pub fn new() -> Self {
        Self::default()
    }
}

impl<K, V, S> Default for SyncMap<K, V, S>
where
    S: BuildHasher + Clone + Default,
{
    fn default() -> Self {
        Self::with_hasher(S::default())
    }
}

impl<K, V, S> SyncMap<K, V, S>
where
    S: BuildHasher + Clone,
{
    /// Creates an empty map which will use `hash_builder` to hash keys.
    ///
    /// Warning: `hash_builder` is normally randomly generated, which makes
    /// the underlying tables resistant to attacks that cause many
    /// collisions. Setting it manually can expose a DoS attack vector.
    ///
    /// # Examples
    ///
    /// ```
    /// use snowdrift::{DefaultHashBuilder, SyncMap};
    ///
    /// let map = SyncMap::with_hasher(DefaultHashBuilder::default());
    /// map.pin().store(1, 2);
    /// ```
    pub fn with_hasher(hash_builder: S) -> Self {
        Self {
            read: Atomic::new(ReadView::empty(hash_builder.clone())),
            dirty: Mutex::new(DirtyState {
                map: None,
                misses: 0,
            }),
            expunged: entry::alloc_expunged::<V>(),
            collector: epoch::default_collector().clone(),
            build_hasher: hash_builder,
        }
    }
}

impl<K, V, S> SyncMap<K, V, S> {
    /// Pins a [`Guard`](crate::Guard) for use with this map.
    ///
    /// Keep in mind that for as long as you hold onto this guard, you are
    /// preventing the collection of garbage generated by the map.
    pub fn guard(&self) -> epoch::Guard {
        self.collector.register().pin()
    }

    #[inline]
    pub(crate) fn check_guard(&self, guard: &Guard) {
        // guard.collector() is `None` for unprotected guards
        if let Some(c) = guard.collector() {
            assert_eq!(c, &self.collector);
        }
    }

    /// The expunged sentinel as a comparable pointer.
    #[inline]
    pub(crate) fn expunged(&self) -> Shared<'_, V> {
        Shared::from(self.expunged as *const V)
    }

    pub(crate) fn read_view<'g>(&self, guard: &'g Guard) -> &'g ReadView<K, V, S> {
        let read = self.read.load(Ordering::Acquire, guard);
        // safety: `read` is never null, and a published view is only
        // retired through the collector after being replaced
        unsafe { read.deref() }
    }

    /// Retires a value pointer that a successful swap or delete has just
    /// unlinked, and hands back a reference valid until the guard drops.
    fn retire_value<'g>(&self, old: Shared<'g, V>, guard: &'g Guard) -> Option<&'g V> {
        if old.is_null() {
            return None;
        }
        // safety: `old` left its entry through an atomic swap, so no later
        // operation can observe it; readers that already did hold guards
        unsafe {
            guard.defer_destroy(old);
            Some(old.deref())
        }
    }

    /// Schedules an entry for destruction once no guard can reach it.
    ///
    /// # Safety
    ///
    /// `entry` must no longer be reachable from the published read view or
    /// the dirty map.
    pub(crate) unsafe fn retire_entry(&self, entry: Shared<'_, Entry<V>>, guard: &Guard) {
        let entry = entry.as_raw() as usize;
        let expunged = self.expunged;
        guard.defer_unchecked(move || Entry::<V>::finalize(entry as *mut Entry<V>, expunged));
    }
}

impl<K, V, S> SyncMap<K, V, S>
where
    K: Hash + Eq,
    S: BuildHasher,
{
    /// Returns the value stored for `key`, if any.
    ///
    /// The key may be any borrowed form of the map's key type, but `Hash`
    /// and `Eq` on the borrowed form must match those for the key type.
    ///
    /// # Examples
    ///
    /// ```
    /// use snowdrift::SyncMap;
    ///
    /// let map = SyncMap::new();
    /// let guard = map.guard();
    /// map.store(1, "a", &guard);
    /// assert_eq!(map.load(&1, &guard), Some(&"a"));
    /// assert_eq!(map.load(&2, &guard), None);
    /// ```
    pub fn load<'g, Q>(&'g self, key: &Q, guard: &'g Guard) -> Option<&'g V>
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        self.check_guard(guard);
        let read = self.read_view(guard);
        let mut entry = read.m.get(key).map(|slot| slot_entry(slot, guard));
        if entry.is_none() && read.amended {
            let mut state = self.dirty.lock();
            // Re-check under the lock: a concurrent promotion may have
            // moved the key into a fresh read view while we blocked.
            let read = self.read_view(guard);
            entry = read.m.get(key).map(|slot| slot_entry(slot, guard));
            if entry.is_none() && read.amended {
                entry = state
                    .map
                    .as_ref()
                    .and_then(|dirty| dirty.get(key))
                    .map(|slot| slot_entry(slot, guard));
                // The key takes the slow path whether or not it was found;
                // count it toward the next promotion.
                self.miss_locked(&mut state, guard);
            }
        }
        entry?.load(self.expunged(), guard)
    }

    /// Tests if `key` is present in the map.
    pub fn contains_key<Q>(&self, key: &Q, guard: &Guard) -> bool
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        self.load(key, guard).is_some()
    }

    /// Deletes the value stored for `key`, returning it if the key was
    /// present.
    ///
    /// # Examples
    ///
    /// ```
    /// use snowdrift::SyncMap;
    ///
    /// let map = SyncMap::new();
    /// let guard = map.guard();
    /// map.store(1, "a", &guard);
    /// assert_eq!(map.load_and_delete(&1, &guard), Some(&"a"));
    /// assert_eq!(map.load_and_delete(&1, &guard), None);
    /// ```
    pub fn load_and_delete<'g, Q>(&'g self, key: &Q, guard: &'g Guard) -> Option<&'g V>
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
                if let Some(slot) = state.map.as_mut().and_then(|dirty| dirty.remove(key)) {
                    let shared = slot.load(Ordering::Relaxed, guard);
                    // safety: the key was in neither read view, and we just
                    // took it out of the dirty map
                    unsafe {
                        self.retire_entry(shared, guard);
                        entry = Some(shared.deref());
                    }
                }
                self.miss_locked(&mut state, guard);
            }
        }
        let old = entry?.delete(self.expunged(), guard)?;
        self.retire_value(old, guard)
    }

    /// Deletes the value stored for `key`.
    pub fn delete<Q>(&self, key: &Q, guard: &Guard)
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        self.load_and_delete(key, guard);
    }

    /// Calls `f` for each key and value in the map, stopping early if `f`
    /// returns false.
    ///
    /// No snapshot is taken: `f` observes each entry's state at some point
    /// during the call, and concurrent mutations may or may not be visible.
    /// No key is yielded more than once. `f` must not re-enter the map with
    /// operations that need the internal lock.
    ///
    /// # Examples
    ///
    /// ```
    /// use snowdrift::SyncMap;
    ///
    /// let map = SyncMap::new();
    /// let guard = map.guard();
    /// map.store(1, 10, &guard);
    /// map.store(2, 20, &guard);
    ///
    /// let mut sum = 0;
    /// map.range(|_k, v| { sum += *v; true }, &guard);
    /// assert_eq!(sum, 30);
    /// ```
    pub fn range<F>(&self, mut f: F, guard: &Guard)
    where
        F: FnMut(&K, &V) -> bool,
    {
        self.check_guard(guard);
        let read = self.snapshot_view(guard);
        for (key, slot) in &read.m {
            let entry = slot_entry(slot, guard);
            if let Some(value) = entry.load(self.expunged(), guard) {
                if !f(key, value) {
                    break;
                }
            }
        }
    }

    /// An iterator visiting all key-value pairs in arbitrary order.
    ///
    /// The iterator element type is `(&'g K, &'g V)`. Like
    /// [`SyncMap::range`], this observes a weak snapshot.
    pub fn iter<'g>(&'g self, guard: &'g Guard) -> Iter<'g, K, V> {
        self.check_guard(guard);
        let read = self.snapshot_view(guard);
        Iter {
            entries: read.m.iter(),
            expunged: self.expunged(),
            guard,
        }
    }

    /// An iterator visiting all keys in arbitrary order.
    ///
    /// The iterator element type is `&'g K`.
    pub fn keys<'g>(&'g self, guard: &'g Guard) -> Keys<'g, K, V> {
        Keys {
            iter: self.iter(guard),
        }
    }

    /// An iterator visiting all values in arbitrary order.
    ///
    /// The iterator element type is `&'g V`.
    pub fn values<'g>(&'g self, guard: &'g Guard) -> Values<'g, K, V> {
        Values {
            iter: self.iter(guard),
        }
    }

    /// Returns a read view that contains every key currently in the map,
    /// promoting the dirty map first if the published view is amended.
    /// Promoting up front bounds iteration to one lock acquisition instead
    /// of one per key missing from the read view.
    fn snapshot_view<'g>(&self, guard: &'g Guard) -> &'g ReadView<K, V, S> {
        let read = self.read_view(guard);
        if !read.amended {
            return read;
        }
        let mut state = self.dirty.lock();
        let read = self.read_view(guard);
        if read.amended {
            self.promote_locked(&mut state, guard);
            return self.read_view(guard);
        }
        read
    }

    /// Records a slow-path lookup, and promotes the dirty map once the slow
    /// path has been taken as often as the dirty map has entries: past that
    /// point the one-time copy is cheaper than continued locking.
    pub(crate) fn miss_locked(&self, state: &mut DirtyState<K, V, S>, guard: &Guard) {
        state.misses += 1;
        if state.misses < state.map.as_ref().map_or(0, |dirty| dirty.len()) {
            return;
        }
        self.promote_locked(state, guard);
    }

    /// Publishes the dirty map as the new read view.
    fn promote_locked(&self, state: &mut DirtyState<K, V, S>, guard: &Guard) {
        if let Some(dirty) = state.map.take() {
            let old = self.read.swap(
                Owned::new(ReadView {
                    m: dirty,
                    amended: false,
                }),
                Ordering::AcqRel,
                guard,
            );
            // safety: the old view has been replaced. Entries it shares
            // with the new view stay alive; its expunged entries are in
            // neither the new view nor the dirty map, so they go too.
            unsafe {
                let old_view = old.deref();
                for slot in old_view.m.values() {
                    let shared = slot.load(Ordering::Relaxed, guard);
                    if shared.deref().is_expunged(self.expunged(), guard) {
                        self.retire_entry(shared, guard);
                    }
                }
                guard.defer_destroy(old);
            }
        }
        state.misses = 0;
    }
}

impl<K, V, S> SyncMap<K, V, S>
where
    K: Hash + Eq,
    S: BuildHasher + Clone,
{
    /// Deletes all entries, leaving the map empty.
    ///
    /// Clearing an already-empty map is a no-op and does not allocate.
    ///
    /// # Examples
    ///
    /// ```
    /// use snowdrift::SyncMap;
    ///
    /// let map = SyncMap::new();
    /// let guard = map.guard();
    /// map.store(1, "a", &guard);
    /// map.clear(&guard);
    /// assert_eq!(map.load(&1, &guard), None);
    /// ```
    pub fn clear(&self, guard: &Guard) {
        self.check_guard(guard);
        let read = self.read_view(guard);
        if read.m.is_empty() && !read.amended {
            // Avoid publishing (and allocating) a new view when the map is
            // already clear.
            return;
        }

        let mut state = self.dirty.lock();
        let read = self.read_view(guard);
        if !read.m.is_empty() || read.amended {
            let old = self.read.swap(
                Owned::new(ReadView::empty(self.build_hasher.clone())),
                Ordering::AcqRel,
                guard,
            );
            // safety: every entry leaves both views here exactly once: the
            // dirty map holds all live entries, and the expunged entries of
            // the old read view are the remainder.
            unsafe {
                let old_view = old.deref();
                match state.map.as_mut() {
                    Some(dirty) => {
                        for slot in old_view.m.values() {
                            let shared = slot.load(Ordering::Relaxed, guard);
                            if shared.deref().is_expunged(self.expunged(), guard) {
                                self.retire_entry(shared, guard);
                            }
                        }
                        for (_, slot) in dirty.drain() {
                            self.retire_entry(slot.load(Ordering::Relaxed, guard), guard);
                        }
                    }
                    None => {
                        for slot in old_view.m.values() {
                            self.retire_entry(slot.load(Ordering::Relaxed, guard), guard);
                        }
                    }
                }
                guard.defer_destroy(old);
            }
        }
        // Don't let a freshly cleared dirty map count toward promotion.
        state.misses = 0;
    }
}

// ===
// the following methods can insert keys and values, whose destruction may be
// deferred past any lifetime the inserting thread controls. hence the
// 'static + Send + Sync bounds.
// ===

impl<K, V, S> SyncMap<K, V, S>
where
    K: 'static + Sync + Send + Clone + Hash + Eq,
    V: 'static + Sync + Send,
    S: BuildHasher + Clone,
{
    /// Stores `value` for `key`, replacing any existing value.
    ///
    /// # Examples
    ///
    /// ```
    /// use snowdrift::SyncMap;
    ///
    /// let map = SyncMap::new();
    /// let guard = map.guard();
    /// map.store("poneyland", 3, &guard);
    /// assert_eq!(map.load("poneyland", &guard), Some(&3));
    /// ```
    pub fn store(&self, key: K, value: V, guard: &Guard) {
        self.swap(key, value, guard);
    }

    /// Stores `value` for `key` and returns the value it replaced, if any.
    ///
    /// # Examples
    ///
    /// ```
    /// use snowdrift::SyncMap;
    ///
    /// let map = SyncMap::new();
    /// let guard = map.guard();
    /// assert_eq!(map.swap(1, "a", &guard), None);
    /// assert_eq!(map.swap(1, "b", &guard), Some(&"a"));
    /// ```
    pub fn swap<'g>(&'g self, key: K, value: V, guard: &'g Guard) -> Option<&'g V> {
        self.check_guard(guard);
        let new = Owned::new(value).into_shared(guard);
        let read = self.read_view(guard);
        if let Some(slot) = read.m.get(&key) {
            // Fast path: the key is in the read view and not expunged.
            if let Ok(old) = slot_entry(slot, guard).try_swap(new, self.expunged(), guard) {
                return self.retire_value(old, guard);
            }
        }

        let mut state = self.dirty.lock();
        let read = self.read_view(guard);
        let previous = if let Some(slot) = read.m.get(&key) {
            let entry = slot_entry(slot, guard);
            if entry.unexpunge_locked(self.expunged(), guard) {
                // The entry was left out of the dirty map when it was last
                // rebuilt; re-adopt it before it may hold a value again.
                match state.map.as_mut() {
                    Some(dirty) => dirty.insert(key, slot.clone()),
                    None => unreachable!("an expunged entry implies a dirty map"),
                };
            }
            entry.swap_locked(new, guard)
        } else if let Some(slot) = state.map.as_ref().and_then(|dirty| dirty.get(&key)) {
            slot_entry(slot, guard).swap_locked(new, guard)
        } else {
            if !read.amended {
                self.amend_locked(&mut state, read, guard);
            }
            match state.map.as_mut() {
                Some(dirty) => dirty.insert(key, Atomic::new(Entry::new(new))),
                None => unreachable!("amend_locked materialises the dirty map"),
            };
            Shared::null()
        };
        drop(state);
        self.retire_value(previous, guard)
    }

    /// Returns the value stored for `key` if present; otherwise stores
    /// `value` and returns it. The boolean is true if the value was loaded
    /// rather than stored.
    ///
    /// # Examples
    ///
    /// ```
    /// use snowdrift::SyncMap;
    ///
    /// let map = SyncMap::new();
    /// let guard = map.guard();
    /// assert_eq!(map.load_or_store(1, "a", &guard), (&"a", false));
    /// assert_eq!(map.load_or_store(1, "b", &guard), (&"a", true));
    /// ```
    pub fn load_or_store<'g>(&'g self, key: K, value: V, guard: &'g Guard) -> (&'g V, bool) {
        self.check_guard(guard);
        let read = self.read_view(guard);
        let value = if let Some(slot) = read.m.get(&key) {
            match slot_entry(slot, guard).try_load_or_store(value, self.expunged(), guard) {
                LoadOrStore::Loaded(actual) => return (actual, true),
                LoadOrStore::Stored(actual) => return (actual, false),
                LoadOrStore::Expunged(value) => value,
            }
        } else {
            value
        };

        let mut state = self.dirty.lock();
        let read = self.read_view(guard);
        if let Some(slot) = read.m.get(&key) {
            let entry = slot_entry(slot, guard);
            if entry.unexpunge_locked(self.expunged(), guard) {
                match state.map.as_mut() {
                    Some(dirty) => dirty.insert(key, slot.clone()),
                    None => unreachable!("an expunged entry implies a dirty map"),
                };
            }
            match entry.try_load_or_store(value, self.expunged(), guard) {
                LoadOrStore::Loaded(actual) => (actual, true),
                LoadOrStore::Stored(actual) => (actual, false),
                LoadOrStore::Expunged(_) => {
                    unreachable!("entries are not expunged while the lock is held")
                }
            }
        } else if let Some(slot) = state.map.as_ref().and_then(|dirty| dirty.get(&key)) {
            let entry = slot_entry(slot, guard);
            let result = match entry.try_load_or_store(value, self.expunged(), guard) {
                LoadOrStore::Loaded(actual) => (actual, true),
                LoadOrStore::Stored(actual) => (actual, false),
                LoadOrStore::Expunged(_) => {
                    unreachable!("entries are not expunged while the lock is held")
                }
            };
            self.miss_locked(&mut state, guard);
            result
        } else {
            if !read.amended {
                self.amend_locked(&mut state, read, guard);
            }
            let p = Owned::new(value).into_shared(guard);
            match state.map.as_mut() {
                Some(dirty) => dirty.insert(key, Atomic::new(Entry::new(p))),
                None => unreachable!("amend_locked materialises the dirty map"),
            };
            // safety: just allocated, bound to the guard
            (unsafe { p.deref() }, false)
        }
    }

    /// Materialises the dirty map and republishes the read view with
    /// `amended` set. The caller must hold the mutex and have observed
    /// `!read.amended`.
    fn amend_locked(
        &self,
        state: &mut DirtyState<K, V, S>,
        read: &ReadView<K, V, S>,
        guard: &Guard,
    ) {
        self.dirty_locked(state, guard);
        let amended = ReadView {
            m: read.m.clone(),
            amended: true,
        };
        let old = self.read.swap(Owned::new(amended), Ordering::AcqRel, guard);
        // safety: replaced view, reachable only through live guards
        unsafe { guard.defer_destroy(old) };
    }

    /// Builds the dirty map from the read view's live entries. Deleted
    /// entries are expunged instead of copied, so the dirty map never has
    /// to carry keys the map no longer contains.
    fn dirty_locked(&self, state: &mut DirtyState<K, V, S>, guard: &Guard) {
        if state.map.is_some() {
            return;
        }
        let read = self.read_view(guard);
        let mut dirty = HashMap::with_capacity_and_hasher(read.m.len(), self.build_hasher.clone());
        for (key, slot) in &read.m {
            let entry = slot_entry(slot, guard);
            if !entry.try_expunge_locked(self.expunged(), guard) {
                dirty.insert(key.clone(), slot.clone());
            }
        }
        state.map = Some(dirty);
    }
}

impl<K, V, S> Drop for SyncMap<K, V, S> {
    fn drop(&mut self) {
        // safety: we have &mut self, so no outstanding guard can reach into
        // the map. Deferred destructors from earlier operations only touch
        // memory that has already left both views, which is exactly what we
        // skip here: the dirty map holds all live entries, and the expunged
        // entries of the read view are the remainder.
        let guard = unsafe { epoch::unprotected() };
        let expunged = self.expunged;
        let read = self.read.swap(Shared::null(), Ordering::Relaxed, guard);
        let state = self.dirty.get_mut();
        unsafe {
            let read = read.into_owned();
            match state.map.take() {
                Some(dirty) => {
                    for slot in read.m.values() {
                        let shared = slot.load(Ordering::Relaxed, guard);
                        if shared
                            .deref()
                            .is_expunged(Shared::from(expunged as *const V), guard)
                        {
                            Entry::finalize(shared.as_raw() as *mut Entry<V>, expunged);
                        }
                    }
                    for (_, slot) in dirty {
                        let shared = slot.load(Ordering::Relaxed, guard);
                        Entry::finalize(shared.as_raw() as *mut Entry<V>, expunged);
                    }
                }
                None => {
                    for slot in read.m.values() {
                        let shared = slot.load(Ordering::Relaxed, guard);
                        Entry::finalize(shared.as_raw() as *mut Entry<V>, expunged);
                    }
                }
            }
            entry::free_expunged::<V>(expunged);
        }
    }
}

impl<K, V, S> Debug for SyncMap<K, V, S>
where
    K: Debug + Hash + Eq,
    V: Debug,
    S: BuildHasher,
{
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let guard = self.guard();
        f.debug_map().entries(self.iter(&guard)).finish()
    }
}

impl<K, V, S> SyncMap<K, V, S>
where
    K: Hash + Eq,
    V: PartialEq,
    S: BuildHasher,
{
    pub(crate) fn guarded_eq(&self, other: &Self, our_guard: &Guard, their_guard: &Guard) -> bool {
        self.iter(our_guard)
            .all(|(key, value)| other.load(key, their_guard) == Some(value))
            && other
                .iter(their_guard)
                .all(|(key, value)| self.load(key, our_guard) == Some(value))
    }
}

impl<K, V, S> PartialEq for SyncMap<K, V, S>
where
    K: Hash + Eq,
    V: PartialEq,
    S: BuildHasher,
{
    fn eq(&self, other: &Self) -> bool {
        if std::ptr::eq(self, other) {
            return true;
        }
        let ours = self.guard();
        let theirs = other.guard();
        self.guarded_eq(other, &ours, &theirs)
    }
}

impl<K, V, S> Eq for SyncMap<K, V, S>
where
    K: Hash + Eq,
    V: Eq,
    S: BuildHasher,
{
}

impl<K, V, S> Clone for SyncMap<K, V, S>
where
    K: 'static + Sync + Send + Clone + Hash + Eq,
    V: 'static + Sync + Send + Clone,
    S: BuildHasher + Clone,
{
    fn clone(&self) -> Self {
        let cloned = Self::with_hasher(self.build_hasher.clone());
        {
            let guard = self.guard();
            for (key, value) in self.iter(&guard) {
                cloned.store(key.clone(), value.clone(), &guard);
            }
        }
        cloned
    }
}

impl<K, V, S> Extend<(K, V)> for &SyncMap<K, V, S>
where
    K: 'static + Sync + Send + Clone + Hash + Eq,
    V: 'static + Sync + Send,
    S: BuildHasher + Clone,
{
    fn extend<T: IntoIterator<Item = (K, V)>>(&mut self, iter: T) {
        let guard = self.guard();
        for (key, value) in iter {
            self.store(key, value, &guard);
        }
    }
}

impl<'a, K, V, S> Extend<(&'a K, &'a V)> for &SyncMap<K, V, S>
where
    K: 'static + Sync + Send + Copy + Hash + Eq,
    V: 'static + Sync + Send + Copy,
    S: BuildHasher + Clone,
{
    fn extend<T: IntoIterator<Item = (&'a K, &'a V)>>(&mut self, iter: T) {
        self.extend(iter.into_iter().map(|(&key, &value)| (key, value)));
    }
}

impl<K, V, S> FromIterator<(K, V)> for SyncMap<K, V, S>
where
    K: 'static + Sync + Send + Clone + Hash + Eq,
    V: 'static + Sync + Send,
    S: BuildHasher + Clone + Default,
{
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        let map = Self::with_hasher(S::default());
        // safety: we own `map`, so nothing is concurrent yet and replaced
        // values can be dropped eagerly
        let guard = unsafe { epoch::unprotected() };
        for (key, value) in iter {
            map.store(key, value, guard);
        }
        map
    }
}

impl<'a, K, V, S> FromIterator<(&'a K, &'a V)> for SyncMap<K, V, S>
where
    K: 'static + Sync + Send + Copy + Hash + Eq,
    V: 'static + Sync + Send + Copy,
    S: BuildHasher + Clone + Default,
{
    fn from_iter<T: IntoIterator<Item = (&'a K, &'a V)>>(iter: T) -> Self {
        Self::from_iter(iter.into_iter().map(|(&key, &value)| (key, value)))
    }
}
