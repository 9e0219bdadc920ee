use crate::entry::Entry;
use crate::map::slot_entry;
use crossbeam_epoch::{Atomic, Guard, Shared};
use std::collections::hash_map;

/// An iterator over a map's entries.
///
/// See [`SyncMap::iter`](crate::SyncMap::iter) for details.
#[derive(Debug)]
pub struct Iter<'g, K, V> {
    pub(crate) entries: hash_map::Iter<'g, K, Atomic<Entry<V>>>,
    pub(crate) expunged: Shared<'g, V>,
    pub(crate) guard: &'g Guard,
}

impl<'g, K, V> Iterator for Iter<'g, K, V> {
    type Item = (&'g K, &'g V);
    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let (key, slot) = self.entries.next()?;
            // deleted and expunged entries are skipped, not yielded as gaps
            if let Some(value) = slot_entry(slot, self.guard).load(self.expunged, self.guard) {
                return Some((key, value));
            }
        }
    }
}

/// An iterator over a map's keys.
///
/// See [`SyncMap::keys`](crate::SyncMap::keys) for details.
#[derive(Debug)]
pub struct Keys<'g, K, V> {
    pub(crate) iter: Iter<'g, K, V>,
}

impl<'g, K, V> Iterator for Keys<'g, K, V> {
    type Item = &'g K;
    fn next(&mut self) -> Option<Self::Item> {
        self.iter.next().map(|(key, _)| key)
    }
}

/// An iterator over a map's values.
///
/// See [`SyncMap::values`](crate::SyncMap::values) for details.
#[derive(Debug)]
pub struct Values<'g, K, V> {
    pub(crate) iter: Iter<'g, K, V>,
}

impl<'g, K, V> Iterator for Values<'g, K, V> {
    type Item = &'g V;
    fn next(&mut self) -> Option<Self::Item> {
        self.iter.next().map(|(_, value)| value)
    }
}
