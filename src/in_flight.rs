//! In-flight callback tracking.
//!
//! While a load or evict callback runs for a key, the catalog lock is
//! released and the key is recorded here together with the thread running
//! the callback. Other requests for that key wait until the record goes
//! away. A request that would wait on itself, directly or through a chain
//! of other waiting threads, is a cycle and must be refused instead.

use hashbrown::HashMap;
use std::thread::ThreadId;

#[derive(Debug, Default)]
pub struct InFlight {
    // encoded key -> thread running its callback
    owners: HashMap<String, ThreadId>,
    // thread -> encoded key it is blocked on
    waiting: HashMap<ThreadId, String>,
}

impl InFlight {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn owner(&self, id: &str) -> Option<ThreadId> {
        self.owners.get(id).copied()
    }

    /// Record that `thread` started a callback for `id`.
    pub fn begin(&mut self, id: String, thread: ThreadId) {
        let prev = self.owners.insert(id, thread);
        debug_assert!(prev.is_none(), "key already in flight");
    }

    pub fn finish(&mut self, id: &str) {
        self.owners.remove(id);
    }

    pub fn wait_on(&mut self, thread: ThreadId, id: &str) {
        self.waiting.insert(thread, id.to_owned());
    }

    pub fn stop_waiting(&mut self, thread: ThreadId) {
        self.waiting.remove(&thread);
    }

    /// Whether blocking `thread` on `id` would close a wait cycle.
    ///
    /// Follows owner(id) -> key that owner waits on -> its owner ... and
    /// reports a cycle when the chain arrives back at `thread`.
    pub fn closes_cycle(&self, id: &str, thread: ThreadId) -> bool {
        let mut current = id;
        // A chain longer than the number of owners revisits a thread.
        for _ in 0..=self.owners.len() {
            let Some(owner) = self.owners.get(current) else {
                return false;
            };
            if *owner == thread {
                return true;
            }
            match self.waiting.get(owner) {
                Some(next) => current = next.as_str(),
                None => return false,
            }
        }
        false
    }
}
