//! Index: structural layer mapping keys to stable slots.
//!
//! Entries live in a `SlotMap` so a `Slot` stays valid (and generation
//! checked) across unrelated insertions and removals. A hashbrown
//! `HashTable` indexes the slots by a hash computed once at insertion;
//! rehashing reuses the stored hash and never calls `K: Hash` again.

use core::borrow::Borrow;
use core::hash::{BuildHasher, Hash};
use hashbrown::hash_table;
use hashbrown::HashTable;
use slotmap::{DefaultKey, SlotMap};
use std::collections::hash_map::RandomState;

/// Generational handle to an entry of an [`Index`].
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct Slot(DefaultKey);

#[derive(Debug)]
struct Entry<K, V> {
    key: K,
    value: V,
    hash: u64,
}

/// Insertion was refused because the key is already present.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DuplicateKey;

pub struct Index<K, V, S = RandomState> {
    hasher: S,
    table: HashTable<DefaultKey>,
    slots: SlotMap<DefaultKey, Entry<K, V>>,
}

impl<K, V> Index<K, V>
where
    K: Eq + Hash,
{
    pub fn new() -> Self {
        Self::with_hasher(Default::default())
    }
}

impl<K, V> Default for Index<K, V>
where
    K: Eq + Hash,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V, S> Index<K, V, S>
where
    K: Eq + Hash,
    S: BuildHasher,
{
    pub fn with_hasher(hasher: S) -> Self {
        Self {
            hasher,
            table: HashTable::new(),
            slots: SlotMap::with_key(),
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn find<Q>(&self, q: &Q) -> Option<Slot>
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        let hash = self.hasher.hash_one(q);
        self.table
            .find(hash, |&k| {
                self.slots
                    .get(k)
                    .map(|e| e.key.borrow() == q)
                    .unwrap_or(false)
            })
            .map(|&k| Slot(k))
    }

    pub fn contains_key<Q>(&self, q: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        self.find(q).is_some()
    }

    pub fn insert(&mut self, key: K, value: V) -> Result<Slot, DuplicateKey> {
        let hash = self.hasher.hash_one(&key);
        let slots = &mut self.slots;
        match self.table.entry(
            hash,
            |&k| slots.get(k).map(|e| e.key == key).unwrap_or(false),
            |&k| slots.get(k).map(|e| e.hash).unwrap_or(0),
        ) {
            hash_table::Entry::Occupied(_) => Err(DuplicateKey),
            hash_table::Entry::Vacant(v) => {
                let k = slots.insert(Entry { key, value, hash });
                v.insert(k);
                Ok(Slot(k))
            }
        }
    }

    /// Unlink and return the entry behind `slot`; `None` if it is stale.
    pub fn remove(&mut self, slot: Slot) -> Option<(K, V)> {
        let entry = self.slots.remove(slot.0)?;
        if let Ok(found) = self.table.find_entry(entry.hash, |&k| k == slot.0) {
            found.remove();
        }
        Some((entry.key, entry.value))
    }

    pub fn value(&self, slot: Slot) -> Option<&V> {
        self.slots.get(slot.0).map(|e| &e.value)
    }

    pub fn value_mut(&mut self, slot: Slot) -> Option<&mut V> {
        self.slots.get_mut(slot.0).map(|e| &mut e.value)
    }

    pub fn iter(&self) -> impl Iterator<Item = (Slot, &K, &V)> {
        self.slots.iter().map(|(k, e)| (Slot(k), &e.key, &e.value))
    }

    /// Remove every entry, yielding owned pairs.
    pub fn drain(&mut self) -> impl Iterator<Item = (K, V)> + '_ {
        self.table.clear();
        self.slots.drain().map(|(_, e)| (e.key, e.value))
    }
}
