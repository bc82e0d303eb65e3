//! rc-catalog: a thread-safe, reference-counted resource catalog.
//!
//! Resources that are expensive to create (decoded images, most notably)
//! are looked up by a key, created on the first checkout, shared by every
//! later checkout of an equal key, and destroyed as soon as the last user
//! checks them back in.
//!
//! Internal Design:
//!
//! Summary
//! - Layers, each with a small contract:
//!   - Index<K, V, S>: structural map returning stable generational slots;
//!     hashes are computed once on insert and reused when rehashing.
//!   - CountedIndex<K, V, S>: adds a per-entry use count on top of Index;
//!     an entry exists iff its count is at least one and is unlinked by
//!     the release that takes the count to zero.
//!   - Catalog<K, R, S>: the public checkout/checkin protocol with
//!     caller-supplied load and evict callbacks.
//!   - Handle<K, R, S>: one checkout owned by a consumer; frees exactly
//!     once.
//!
//! Concurrency
//! - The counted index and the in-flight table live behind one mutex.
//!   Deciding between "reuse" and "load" happens under that mutex, so
//!   concurrent checkouts of one key load it once.
//! - Load and evict callbacks run with the mutex released. While one runs,
//!   its key is marked in flight and other requests for the key wait on a
//!   condvar. A loader can therefore check other keys out of the same
//!   catalog (derived resources).
//! - The last checkin unlinks the entry and marks it in flight within one
//!   critical section; a new checkout of the key waits for the eviction to
//!   finish before loading a fresh copy.
//!
//! Cycles
//! - A request that would wait on a key its own thread is loading or
//!   evicting, or on a chain of threads that ends up waiting on it, fails
//!   with `CheckoutError::Cycle` instead of blocking forever.
//!
//! Failure semantics
//! - A loader returning `None` yields `CheckoutError::NotFound`; nothing is
//!   cached and the next checkout calls the loader again.
//! - Checking in a key that is not checked out returns false.
//! - Eviction is infallible from the catalog's point of view.
//! - A panicking callback clears its in-flight mark on unwind.
//!
//! Lifetime
//! - There is no global catalog. Construct one, clone it to share it, and
//!   hand it to the code that needs it. Handles keep their catalog alive.
//!   Dropping the last owner evicts any entries that were never checked in
//!   and logs them as leaks.
//!
//! Overflow semantics
//! - Use-count overflow aborts the process, matching `Rc`.

mod catalog;
mod counted;
mod handle;
pub mod images;
mod in_flight;
mod index;
mod key;

// Public surface
pub use catalog::{Catalog, CheckoutError, EvictFn, LoadFn};
pub use handle::Handle;
pub use images::{Image, ImageError, ImageKey, ImageLabel, Images, Pixels, Size};
pub use key::{encode_json, CatalogKey, KeyError};
