use crate::iter::{Iter, Keys, Values};
use crate::SyncMap;
use crossbeam_epoch::Guard;
use std::borrow::Borrow;
use std::fmt::{self, Debug, Formatter};
use std::hash::{BuildHasher, Hash};
use std::ops::Deref;

/// A reference to a [`SyncMap`] with a guard attached, constructed with
/// [`SyncMap::pin`] or [`SyncMap::with_guard`]. It exposes the whole map
/// surface without threading a guard through every call.
pub struct SyncMapRef<'map, K, V, S = crate::DefaultHashBuilder> {
    pub(crate) map: &'map SyncMap<K, V, S>,
    guard: GuardRef<'map>,
}

enum GuardRef<'g> {
    Owned(Guard),
    Ref(&'g Guard),
}

impl Deref for GuardRef<'_> {
    type Target = Guard;

    #[inline]
    fn deref(&self) -> &Guard {
        match *self {
            GuardRef::Owned(ref guard) | GuardRef::Ref(&ref guard) => guard,
        }
    }
}

impl<K, V, S> SyncMap<K, V, S> {
    /// Gets a reference to this map with the current thread pinned.
    ///
    /// Keep in mind that for as long as you hold onto this reference, you
    /// are preventing the collection of garbage generated by the map.
    pub fn pin(&self) -> SyncMapRef<'_, K, V, S> {
        SyncMapRef {
            guard: GuardRef::Owned(self.guard()),
            map: self,
        }
    }

    /// Gets a reference to this map with the given guard attached.
    pub fn with_guard<'g>(&'g self, guard: &'g Guard) -> SyncMapRef<'g, K, V, S> {
        SyncMapRef {
            map: self,
            guard: GuardRef::Ref(guard),
        }
    }
}

impl<K, V, S> SyncMapRef<'_, K, V, S>
where
    K: Hash + Eq,
    S: BuildHasher,
{
    /// Returns the value stored for `key`, if any.
    ///
    /// See also [`SyncMap::load`].
    pub fn load<Q>(&self, key: &Q) -> Option<&V>
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        self.map.load(key, &self.guard)
    }

    /// Tests if `key` is present in the map.
    pub fn contains_key<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        self.map.contains_key(key, &self.guard)
    }

    /// Deletes the value stored for `key`, returning it if the key was
    /// present.
    ///
    /// See also [`SyncMap::load_and_delete`].
    pub fn load_and_delete<Q>(&self, key: &Q) -> Option<&V>
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        self.map.load_and_delete(key, &self.guard)
    }

    /// Deletes the value stored for `key`.
    pub fn delete<Q>(&self, key: &Q)
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        self.map.delete(key, &self.guard)
    }

    /// Calls `f` for each key and value in the map, stopping early if `f`
    /// returns false.
    ///
    /// See also [`SyncMap::range`].
    pub fn range<F>(&self, f: F)
    where
        F: FnMut(&K, &V) -> bool,
    {
        self.map.range(f, &self.guard)
    }

    /// An iterator visiting all key-value pairs in arbitrary order.
    pub fn iter(&self) -> Iter<'_, K, V> {
        self.map.iter(&self.guard)
    }

    /// An iterator visiting all keys in arbitrary order.
    pub fn keys(&self) -> Keys<'_, K, V> {
        self.map.keys(&self.guard)
    }

    /// An iterator visiting all values in arbitrary order.
    pub fn values(&self) -> Values<'_, K, V> {
        self.map.values(&self.guard)
    }
}

impl<K, V, S> SyncMapRef<'_, K, V, S>
where
    K: Hash + Eq,
    S: BuildHasher + Clone,
{
    /// Deletes all entries, leaving the map empty.
    ///
    /// See also [`SyncMap::clear`].
    pub fn clear(&self) {
        self.map.clear(&self.guard)
    }
}

impl<K, V, S> SyncMapRef<'_, K, V, S>
where
    K: 'static + Sync + Send + Clone + Hash + Eq,
    V: 'static + Sync + Send,
    S: BuildHasher + Clone,
{
    /// Stores `value` for `key`, replacing any existing value.
    ///
    /// See also [`SyncMap::store`].
    pub fn store(&self, key: K, value: V) {
        self.map.store(key, value, &self.guard)
    }

    /// Stores `value` for `key` and returns the value it replaced, if any.
    ///
    /// See also [`SyncMap::swap`].
    pub fn swap(&self, key: K, value: V) -> Option<&V> {
        self.map.swap(key, value, &self.guard)
    }

    /// Returns the value stored for `key` if present; otherwise stores
    /// `value` and returns it. The boolean is true if the value was loaded
    /// rather than stored.
    ///
    /// See also [`SyncMap::load_or_store`].
    pub fn load_or_store(&self, key: K, value: V) -> (&V, bool) {
        self.map.load_or_store(key, value, &self.guard)
    }
}

impl<K, V, S> SyncMapRef<'_, K, V, S>
where
    K: Hash + Eq,
    V: 'static + Sync + Send + PartialEq,
    S: BuildHasher,
{
    /// Stores `new` for `key` if the current value equals `old`.
    ///
    /// See also [`SyncMap::compare_and_swap`].
    pub fn compare_and_swap<Q>(&self, key: &Q, old: &V, new: V) -> bool
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        self.map.compare_and_swap(key, old, new, &self.guard)
    }

    /// Deletes the entry for `key` if its value equals `old`.
    ///
    /// See also [`SyncMap::compare_and_delete`].
    pub fn compare_and_delete<Q>(&self, key: &Q, old: &V) -> bool
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        self.map.compare_and_delete(key, old, &self.guard)
    }
}

impl<'g, K, V, S> IntoIterator for &'g SyncMapRef<'_, K, V, S>
where
    K: Hash + Eq,
    S: BuildHasher,
{
    type IntoIter = Iter<'g, K, V>;
    type Item = (&'g K, &'g V);

    fn into_iter(self) -> Self::IntoIter {
        self.map.iter(&self.guard)
    }
}

impl<K, V, S> Debug for SyncMapRef<'_, K, V, S>
where
    K: Debug + Hash + Eq,
    V: Debug,
    S: BuildHasher,
{
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.iter()).finish()
    }
}

impl<K, V, S> PartialEq for SyncMapRef<'_, K, V, S>
where
    K: Hash + Eq,
    V: PartialEq,
    S: BuildHasher,
{
    fn eq(&self, other: &Self) -> bool {
        self.map.guarded_eq(other.map, &self.guard, &other.guard)
    }
}

impl<K, V, S> PartialEq<SyncMap<K, V, S>> for SyncMapRef<'_, K, V, S>
where
    K: Hash + Eq,
    V: PartialEq,
    S: BuildHasher,
{
    fn eq(&self, other: &SyncMap<K, V, S>) -> bool {
        self.map.guarded_eq(other, &self.guard, &other.guard())
    }
}

impl<K, V, S> PartialEq<SyncMapRef<'_, K, V, S>> for SyncMap<K, V, S>
where
    K: Hash + Eq,
    V: PartialEq,
    S: BuildHasher,
{
    fn eq(&self, other: &SyncMapRef<'_, K, V, S>) -> bool {
        self.guarded_eq(other.map, &self.guard(), &other.guard)
    }
}

impl<K, V, S> Eq for SyncMapRef<'_, K, V, S>
where
    K: Hash + Eq,
    V: Eq,
    S: BuildHasher,
{
}
