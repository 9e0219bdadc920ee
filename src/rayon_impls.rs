use crate::{SyncMap, SyncMapRef};
use rayon::iter::{FromParallelIterator, IntoParallelIterator, ParallelExtend, ParallelIterator};
use std::hash::{BuildHasher, Hash};

impl<K, V, S> FromParallelIterator<(K, V)> for SyncMap<K, V, S>
where
    K: 'static + Clone + Hash + Eq + Send + Sync,
    V: 'static + Send + Sync,
    S: BuildHasher + Clone + Default + Send + Sync,
{
    fn from_par_iter<I>(par_iter: I) -> Self
    where
        I: IntoParallelIterator<Item = (K, V)>,
    {
        let mut map = SyncMap::with_hasher(S::default());
        map.par_extend(par_iter);
        map
    }
}

impl<K, V, S> ParallelExtend<(K, V)> for SyncMap<K, V, S>
where
    K: 'static + Clone + Hash + Eq + Send + Sync,
    V: 'static + Send + Sync,
    S: BuildHasher + Clone + Send + Sync,
{
    fn par_extend<I>(&mut self, par_iter: I)
    where
        I: IntoParallelIterator<Item = (K, V)>,
    {
        (&*self).par_extend(par_iter);
    }
}

impl<K, V, S> ParallelExtend<(K, V)> for &SyncMap<K, V, S>
where
    K: 'static + Clone + Hash + Eq + Send + Sync,
    V: 'static + Send + Sync,
    S: BuildHasher + Clone + Send + Sync,
{
    fn par_extend<I>(&mut self, par_iter: I)
    where
        I: IntoParallelIterator<Item = (K, V)>,
    {
        par_iter.into_par_iter().for_each_init(
            || self.guard(),
            |guard, (key, value)| {
                self.store(key, value, guard);
            },
        );
    }
}

impl<'map, K, V, S> ParallelExtend<(K, V)> for SyncMapRef<'map, K, V, S>
where
    K: 'static + Clone + Hash + Eq + Send + Sync,
    V: 'static + Send + Sync,
    S: BuildHasher + Clone + Send + Sync,
{
    fn par_extend<I>(&mut self, par_iter: I)
    where
        I: IntoParallelIterator<Item = (K, V)>,
    {
        self.map.par_extend(par_iter);
    }
}
