//! Counted: per-entry use counts atop [`Index`].
//!
//! Every entry starts life with one use. `acquire` adds a use to an existing
//! entry, `release` takes one away and unlinks the entry in the same call
//! when the count reaches zero, so a live entry never has a zero count.

use crate::index::{DuplicateKey, Index, Slot};
use core::borrow::Borrow;
use core::hash::{BuildHasher, Hash};
use std::collections::hash_map::RandomState;

/// Number of outstanding checkouts of one entry.
#[derive(Debug)]
pub struct UseCount(usize);

impl UseCount {
    fn one() -> Self {
        UseCount(1)
    }

    pub fn get(&self) -> usize {
        self.0
    }

    fn increment(&mut self) {
        // Same policy as `Rc`: overflowing the count aborts.
        self.0 = match self.0.checked_add(1) {
            Some(n) => n,
            None => std::process::abort(),
        };
    }

    /// Returns true when this was the last use.
    fn decrement(&mut self) -> bool {
        assert!(self.0 > 0, "UseCount underflow");
        self.0 -= 1;
        self.0 == 0
    }
}

#[derive(Debug)]
struct Counted<V> {
    uses: UseCount,
    value: V,
}

/// Outcome of returning one use of an entry.
#[derive(Debug, PartialEq, Eq)]
pub enum Release<K, V> {
    /// No entry under that key.
    Missing,
    /// The entry is still in use by this many checkouts.
    Live(usize),
    /// That was the last use; the entry has been unlinked.
    Removed { key: K, value: V },
}

pub struct CountedIndex<K, V, S = RandomState> {
    inner: Index<K, Counted<V>, S>,
}

impl<K, V> CountedIndex<K, V>
where
    K: Eq + Hash,
{
    pub fn new() -> Self {
        Self {
            inner: Index::new(),
        }
    }
}

impl<K, V> Default for CountedIndex<K, V>
where
    K: Eq + Hash,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V, S> CountedIndex<K, V, S>
where
    K: Eq + Hash,
    S: BuildHasher,
{
    pub fn with_hasher(hasher: S) -> Self {
        Self {
            inner: Index::with_hasher(hasher),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn contains_key<Q>(&self, q: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        self.inner.contains_key(q)
    }

    /// Current use count of the entry under `q`, if any.
    pub fn uses<Q>(&self, q: &Q) -> Option<usize>
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        let slot = self.inner.find(q)?;
        self.inner.value(slot).map(|c| c.uses.get())
    }

    /// Insert a new entry holding a single use.
    pub fn insert(&mut self, key: K, value: V) -> Result<Slot, DuplicateKey> {
        self.inner.insert(
            key,
            Counted {
                uses: UseCount::one(),
                value,
            },
        )
    }

    /// Add one use to the entry under `q` and borrow its value.
    pub fn acquire<Q>(&mut self, q: &Q) -> Option<&V>
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        let slot = self.inner.find(q)?;
        let counted = self.inner.value_mut(slot)?;
        counted.uses.increment();
        Some(&counted.value)
    }

    /// Take one use away from the entry under `q`; unlink it at zero.
    pub fn release<Q>(&mut self, q: &Q) -> Release<K, V>
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        let Some(slot) = self.inner.find(q) else {
            return Release::Missing;
        };
        let counted = self
            .inner
            .value_mut(slot)
            .expect("slot returned by find must be live");
        if !counted.uses.decrement() {
            return Release::Live(counted.uses.get());
        }
        let (key, counted) = self
            .inner
            .remove(slot)
            .expect("entry must exist when its count reaches zero");
        Release::Removed {
            key,
            value: counted.value,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&K, &V, usize)> {
        self.inner
            .iter()
            .map(|(_, k, c)| (k, &c.value, c.uses.get()))
    }

    /// Unlink every entry regardless of its count.
    pub fn drain(&mut self) -> impl Iterator<Item = (K, V, usize)> + '_ {
        self.inner.drain().map(|(k, c)| (k, c.value, c.uses.get()))
    }
}
