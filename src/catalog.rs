//! Catalog: thread-safe checkout/checkin over a counted index.
//!
//! All bookkeeping sits behind one mutex. Load and evict callbacks run with
//! that mutex released, so a loader may check other keys out of the same
//! catalog. While a callback runs its key is marked in flight; requests for
//! that key block on a condvar until the mark is cleared and then look at
//! the map again.

use crate::counted::{CountedIndex, Release};
use crate::handle::Handle;
use crate::in_flight::InFlight;
use crate::key::CatalogKey;
use core::hash::BuildHasher;
use log::{debug, trace, warn};
use std::collections::hash_map::RandomState;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;
use thiserror::Error;

/// Materializes the resource for a key, or `None` when it does not exist.
/// Receives the catalog it is registered with for derived resources.
pub type LoadFn<K, R, S> = dyn Fn(&Catalog<K, R, S>, &K) -> Option<R> + Send + Sync;

/// Releases a resource whose last checkout was returned.
pub type EvictFn<K, R> = dyn Fn(&K, R) + Send + Sync;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CheckoutError {
    /// The loader reported that nothing exists for this key.
    #[error("no resource for key {key}")]
    NotFound { key: String },
    /// Serving the request would wait on a load or eviction that is itself
    /// waiting on this request.
    #[error("load cycle through key {key}")]
    Cycle { key: String },
}

struct Entry<K, R> {
    key: K,
    resource: R,
}

struct State<K, R, S> {
    entries: CountedIndex<String, Entry<K, R>, S>,
    in_flight: InFlight,
}

struct Shared<K, R, S>
where
    S: BuildHasher,
{
    state: Mutex<State<K, R, S>>,
    settled: Condvar,
    load: Box<LoadFn<K, R, S>>,
    evict: Box<EvictFn<K, R>>,
}

impl<K, R, S> Shared<K, R, S>
where
    S: BuildHasher,
{
    // Mutations under the lock never panic half-way, so a poisoned lock
    // still guards consistent state.
    fn lock(&self) -> MutexGuard<'_, State<K, R, S>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn wait<'a>(&self, guard: MutexGuard<'a, State<K, R, S>>) -> MutexGuard<'a, State<K, R, S>> {
        self.settled
            .wait(guard)
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl<K, R, S> Drop for Shared<K, R, S>
where
    S: BuildHasher,
{
    fn drop(&mut self) {
        let state = self
            .state
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner);
        for (id, entry, uses) in state.entries.drain() {
            warn!("catalog dropped with {uses} outstanding checkout(s) of {id}");
            (self.evict)(&entry.key, entry.resource);
        }
    }
}

/// Marks a key in flight for the duration of a callback.
///
/// Dropping the guard clears the mark and wakes waiters, including when
/// the callback unwinds.
struct Pending<'a, K, R, S>
where
    S: BuildHasher,
{
    shared: &'a Shared<K, R, S>,
    id: String,
    armed: bool,
}

impl<'a, K, R, S> Pending<'a, K, R, S>
where
    S: BuildHasher,
{
    fn begin(
        shared: &'a Shared<K, R, S>,
        mut state: MutexGuard<'a, State<K, R, S>>,
        id: String,
    ) -> Self {
        state.in_flight.begin(id.clone(), thread::current().id());
        drop(state);
        Self {
            shared,
            id,
            armed: true,
        }
    }

    /// Clear the mark and hand back the lock so the caller can publish its
    /// result before anyone else looks at the key.
    fn settle(mut self) -> MutexGuard<'a, State<K, R, S>> {
        self.armed = false;
        self.clear()
    }

    fn clear(&self) -> MutexGuard<'a, State<K, R, S>> {
        let mut state = self.shared.lock();
        state.in_flight.finish(&self.id);
        self.shared.settled.notify_all();
        state
    }
}

impl<'a, K, R, S> Drop for Pending<'a, K, R, S>
where
    S: BuildHasher,
{
    fn drop(&mut self) {
        if self.armed {
            let _state = self.clear();
        }
    }
}

/// Reference-counted resource catalog.
///
/// Cloning a `Catalog` yields another owner of the same catalog. When the
/// last owner (including every outstanding [`Handle`]) goes away, entries
/// that were never checked back in are evicted and reported as leaks.
pub struct Catalog<K, R, S = RandomState>
where
    S: BuildHasher,
{
    shared: Arc<Shared<K, R, S>>,
}

impl<K, R, S> Clone for Catalog<K, R, S>
where
    S: BuildHasher,
{
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<K, R> Catalog<K, R>
where
    K: CatalogKey,
    R: Clone,
{
    pub fn new<L, E>(load: L, evict: E) -> Self
    where
        L: Fn(&Catalog<K, R>, &K) -> Option<R> + Send + Sync + 'static,
        E: Fn(&K, R) + Send + Sync + 'static,
    {
        Self::with_hasher(RandomState::new(), load, evict)
    }
}

impl<K, R, S> Catalog<K, R, S>
where
    K: CatalogKey,
    R: Clone,
    S: BuildHasher,
{
    pub fn with_hasher<L, E>(hasher: S, load: L, evict: E) -> Self
    where
        L: Fn(&Catalog<K, R, S>, &K) -> Option<R> + Send + Sync + 'static,
        E: Fn(&K, R) + Send + Sync + 'static,
    {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    entries: CountedIndex::with_hasher(hasher),
                    in_flight: InFlight::new(),
                }),
                settled: Condvar::new(),
                load: Box::new(load),
                evict: Box::new(evict),
            }),
        }
    }

    /// Check `key` out, loading it on first use.
    ///
    /// Blocks while another thread is loading or evicting the same key.
    /// Every successful checkout must be matched by one [`checkin`].
    ///
    /// [`checkin`]: Catalog::checkin
    pub fn checkout(&self, key: &K) -> Result<R, CheckoutError> {
        let id = key.encode();
        let me = thread::current().id();
        let mut state = self.shared.lock();
        loop {
            if let Some(entry) = state.entries.acquire(id.as_str()) {
                trace!("checkout hit {id}");
                return Ok(entry.resource.clone());
            }
            let Some(owner) = state.in_flight.owner(&id) else {
                break;
            };
            if owner == me || state.in_flight.closes_cycle(&id, me) {
                warn!("refusing checkout of {id}: it would wait on itself");
                return Err(CheckoutError::Cycle { key: id });
            }
            state.in_flight.wait_on(me, &id);
            state = self.shared.wait(state);
            state.in_flight.stop_waiting(me);
        }

        let pending = Pending::begin(&self.shared, state, id.clone());
        debug!("loading {id}");
        let loaded = (self.shared.load)(self, key);
        let mut state = pending.settle();
        match loaded {
            Some(resource) => {
                state
                    .entries
                    .insert(
                        id,
                        Entry {
                            key: key.clone(),
                            resource: resource.clone(),
                        },
                    )
                    .expect("in-flight mark keeps the key absent while loading");
                Ok(resource)
            }
            None => {
                debug!("nothing loaded for {id}");
                Err(CheckoutError::NotFound { key: id })
            }
        }
    }

    /// Return one checkout of `key`.
    ///
    /// Evicts the resource when this was the last checkout. Returns false
    /// when nothing is checked out under `key`.
    pub fn checkin(&self, key: &K) -> bool {
        let id = key.encode();
        let mut state = self.shared.lock();
        let released = state.entries.release(id.as_str());
        match released {
            Release::Missing => {
                debug!("checkin of {id} which is not checked out");
                false
            }
            Release::Live(uses) => {
                trace!("checkin {id}, {uses} left");
                true
            }
            Release::Removed { value: entry, .. } => {
                // Unlinking and marking happen under one lock so a new
                // checkout of this key waits for the eviction to finish.
                let pending = Pending::begin(&self.shared, state, id);
                debug!("evicting {}", pending.id);
                (self.shared.evict)(&entry.key, entry.resource);
                drop(pending);
                true
            }
        }
    }

    /// Check `key` out and wrap it in a [`Handle`] that checks it back in
    /// when freed or dropped.
    pub fn acquire(&self, key: K) -> Result<Handle<K, R, S>, CheckoutError> {
        let resource = self.checkout(&key)?;
        Ok(Handle::new(self.clone(), key, resource))
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.shared.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.lock().entries.is_empty()
    }

    pub fn contains(&self, key: &K) -> bool {
        self.shared.lock().entries.contains_key(key.encode().as_str())
    }

    /// Outstanding checkouts of `key`; `None` when it has no entry.
    pub fn uses(&self, key: &K) -> Option<usize> {
        self.shared.lock().entries.uses(key.encode().as_str())
    }

    /// Encoded key and use count of every live entry, sorted by key.
    pub fn outstanding(&self) -> Vec<(String, usize)> {
        let state = self.shared.lock();
        let mut out: Vec<_> = state
            .entries
            .iter()
            .map(|(id, _, uses)| (id.clone(), uses))
            .collect();
        out.sort();
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting() -> (Catalog<String, Arc<String>>, Arc<AtomicUsize>, Arc<AtomicUsize>) {
        let loads = Arc::new(AtomicUsize::new(0));
        let evicts = Arc::new(AtomicUsize::new(0));
        let (l, e) = (loads.clone(), evicts.clone());
        let cat = Catalog::new(
            move |_: &Catalog<String, Arc<String>>, key: &String| {
                l.fetch_add(1, Ordering::SeqCst);
                Some(Arc::new(key.to_uppercase()))
            },
            move |_: &String, _: Arc<String>| {
                e.fetch_add(1, Ordering::SeqCst);
            },
        );
        (cat, loads, evicts)
    }

    #[test]
    fn hit_reuses_loaded_resource() {
        let (cat, loads, _) = counting();
        let k = "a".to_string();
        let a = cat.checkout(&k).unwrap();
        let b = cat.checkout(&k).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(*a, "A");
        assert_eq!(loads.load(Ordering::SeqCst), 1);
        assert_eq!(cat.uses(&k), Some(2));
        assert!(cat.checkin(&k));
        assert!(cat.checkin(&k));
    }

    #[test]
    fn last_checkin_evicts_and_unlinks() {
        let (cat, loads, evicts) = counting();
        let k = "a".to_string();
        cat.checkout(&k).unwrap();
        assert!(cat.checkin(&k));
        assert_eq!(evicts.load(Ordering::SeqCst), 1);
        assert!(!cat.contains(&k));
        assert!(cat.is_empty());

        cat.checkout(&k).unwrap();
        assert_eq!(loads.load(Ordering::SeqCst), 2);
        assert!(cat.checkin(&k));
    }

    #[test]
    fn unknown_checkin_is_reported() {
        let (cat, _, evicts) = counting();
        assert!(!cat.checkin(&"ghost".to_string()));
        assert_eq!(evicts.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn self_referencing_loader_is_refused() {
        let seen = Arc::new(Mutex::new(None));
        let seen2 = seen.clone();
        let cat: Catalog<String, u32> = Catalog::new(
            move |cat: &Catalog<String, u32>, key: &String| {
                *seen2.lock().unwrap() = Some(cat.checkout(key));
                None
            },
            |_: &String, _: u32| {},
        );
        let k = "loop".to_string();
        assert_eq!(
            cat.checkout(&k),
            Err(CheckoutError::NotFound { key: k.clone() })
        );
        assert_eq!(
            seen.lock().unwrap().clone(),
            Some(Err(CheckoutError::Cycle { key: k.clone() }))
        );
        assert!(cat.is_empty());
    }

    #[test]
    fn leftover_entries_are_evicted_on_drop() {
        let (cat, _, evicts) = counting();
        cat.checkout(&"x".to_string()).unwrap();
        cat.checkout(&"y".to_string()).unwrap();
        cat.checkout(&"y".to_string()).unwrap();
        assert_eq!(
            cat.outstanding(),
            vec![("x".to_string(), 1), ("y".to_string(), 2)]
        );
        drop(cat);
        assert_eq!(evicts.load(Ordering::SeqCst), 2);
    }
}
