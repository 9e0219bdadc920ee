//! A concurrent map optimized for read-mostly workloads, modeled on the
//! two-view design of Go's `sync.Map`.
//!
//! The central type is [`SyncMap`]. It maintains an immutable, atomically
//! published *read view* next to a mutex-guarded *dirty* table. Loads,
//! stores, and deletes of keys that have made it into the read view never
//! take the lock: they operate on per-key entries through atomic pointer
//! operations. Keys that are new since the last publication live in the
//! dirty table, and lookups that have to fall through to it are counted;
//! once falling through has cost as much as a full copy would, the dirty
//! table is promoted wholesale into a fresh read view.
//!
//! # When to use it
//!
//! This layout wins in two situations:
//!
//!  1. a key set that is written once and then read many times, as in
//!     caches that only grow, and
//!  2. disjoint key sets read and written by disjoint threads.
//!
//! In both cases the steady state serves every operation lock-free, where a
//! `Mutex<HashMap>` would serialise all threads. Conversely, workloads that
//! keep writing to a shared, churning key set spend their time under the
//! internal lock and are better served by a sharded map.
//!
//! # A note on `Guard` and memory use
//!
//! `SyncMap` hands out references to the values it stores, while other
//! threads may concurrently delete those values. Reclamation is therefore
//! deferred, using epoch-based garbage collection from [`crossbeam-epoch`]:
//! operations take a [`Guard`], and everything a thread observed stays
//! allocated at least until its guard is dropped. Guards come from
//! [`SyncMap::guard`], and [`SyncMap::pin`] packages a guard and the map
//! into one handle. Holding a guard for a long time holds back garbage
//! collection, so pin close to where you work.
//!
//! All guards used with a given map must come from the collector the map
//! was created with; operations panic on a guard from another collector,
//! since honoring it could let values be freed while still referenced.
//!
//! [`crossbeam-epoch`]: https://docs.rs/crossbeam-epoch
//!
//! # Examples
//!
//! ```
//! use snowdrift::SyncMap;
//!
//! let book_reviews = SyncMap::new();
//! let guard = book_reviews.guard();
//!
//! book_reviews.store("Adventures of Huckleberry Finn", "My favorite book.", &guard);
//! book_reviews.store("Grimms' Fairy Tales", "Masterpiece.", &guard);
//! book_reviews.store("The Adventures of Sherlock Holmes", "Eye lyked it alot.", &guard);
//!
//! if !book_reviews.contains_key("Les Misérables", &guard) {
//!     println!(
//!         "We've got {} reviews, but Les Misérables ain't one.",
//!         book_reviews.iter(&guard).count()
//!     );
//! }
//!
//! book_reviews.delete("The Adventures of Sherlock Holmes", &guard);
//!
//! for (book, review) in book_reviews.iter(&guard) {
//!     println!("{}: \"{}\"", book, review);
//! }
//! ```
//!
//! Values can be updated conditionally when they are comparable:
//!
//! ```
//! use snowdrift::SyncMap;
//!
//! let sequencer = SyncMap::new();
//! let guard = sequencer.guard();
//! sequencer.store("stream-1", 0u64, &guard);
//!
//! // only one writer per observed value wins
//! assert!(sequencer.compare_and_swap("stream-1", &0, 1, &guard));
//! assert!(!sequencer.compare_and_swap("stream-1", &0, 1, &guard));
//! ```
//!
//! # Crate features
//!
//!  * `serde`: serialization for [`SyncMap`] and [`SyncMapRef`].
//!  * `rayon`: `FromParallelIterator` and `ParallelExtend` for [`SyncMap`].
#![deny(missing_docs, missing_debug_implementations, unreachable_pub)]
#![warn(rust_2018_idioms)]

mod cas;
mod entry;
mod iter;
mod map;
mod map_ref;

#[cfg(feature = "rayon")]
mod rayon_impls;
#[cfg(feature = "serde")]
mod serde_impls;

pub use crate::iter::{Iter, Keys, Values};
pub use crate::map::SyncMap;
pub use crate::map_ref::SyncMapRef;

/// Re-export of [`crossbeam-epoch`](https://docs.rs/crossbeam-epoch) so
/// guards can be pinned without a direct dependency on it.
pub use crossbeam_epoch as epoch;

/// The garbage-collection guard that scopes references handed out by a
/// [`SyncMap`].
pub use crossbeam_epoch::Guard;

/// The default [`BuildHasher`](std::hash::BuildHasher) for [`SyncMap`].
pub type DefaultHashBuilder = ahash::RandomState;
