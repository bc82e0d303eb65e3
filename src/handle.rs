//! Consumer-facing wrapper around one checkout.

use crate::catalog::{Catalog, CheckoutError};
use crate::key::CatalogKey;
use core::fmt;
use core::hash::BuildHasher;
use log::warn;
use std::collections::hash_map::RandomState;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// One checkout of a catalog entry.
///
/// `free` (or dropping the handle) checks the key back in. The checkin is
/// issued exactly once no matter how many threads race to free the same
/// handle; afterwards the handle no longer yields the resource.
pub struct Handle<K, R, S = RandomState>
where
    K: CatalogKey,
    R: Clone,
    S: BuildHasher,
{
    catalog: Catalog<K, R, S>,
    key: K,
    // `None` once checked back in.
    resource: Mutex<Option<R>>,
}

impl<K, R, S> Handle<K, R, S>
where
    K: CatalogKey,
    R: Clone,
    S: BuildHasher,
{
    pub(crate) fn new(catalog: Catalog<K, R, S>, key: K, resource: R) -> Self {
        Self {
            catalog,
            key,
            resource: Mutex::new(Some(resource)),
        }
    }

    fn slot(&self) -> MutexGuard<'_, Option<R>> {
        self.resource.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn key(&self) -> &K {
        &self.key
    }

    pub fn catalog(&self) -> &Catalog<K, R, S> {
        &self.catalog
    }

    /// The checked-out resource, or `None` after `free`.
    pub fn get(&self) -> Option<R> {
        self.slot().clone()
    }

    /// Borrow the resource for the duration of `f`.
    pub fn with<T>(&self, f: impl FnOnce(&R) -> T) -> Option<T> {
        self.slot().as_ref().map(f)
    }

    pub fn is_live(&self) -> bool {
        self.slot().is_some()
    }

    /// Check the resource back in. Returns true for the call that actually
    /// did so; repeated or concurrent calls return false.
    pub fn free(&self) -> bool {
        let Some(resource) = self.slot().take() else {
            return false;
        };
        // Release our copy before the catalog may evict its own.
        drop(resource);
        if !self.catalog.checkin(&self.key) {
            warn!("{} was not checked out when its handle was freed", self.key.encode());
        }
        true
    }

    /// Check the same key out again, yielding an independent handle.
    pub fn try_clone(&self) -> Result<Self, CheckoutError> {
        self.catalog.acquire(self.key.clone())
    }
}

impl<K, R, S> Drop for Handle<K, R, S>
where
    K: CatalogKey,
    R: Clone,
    S: BuildHasher,
{
    fn drop(&mut self) {
        self.free();
    }
}

impl<K, R, S> fmt::Debug for Handle<K, R, S>
where
    K: CatalogKey,
    R: Clone,
    S: BuildHasher,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle")
            .field("key", &self.key.encode())
            .field("live", &self.is_live())
            .finish()
    }
}
