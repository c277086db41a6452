//! In-flight copy registry
//!
//! Serializes copy operations on overlapping cluster ranges. A caller that
//! finds an overlapping request parks on that request's wait queue and
//! re-checks the whole registry when woken, because another request may
//! have been registered in the meantime.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;

#[derive(Debug)]
struct InFlightRequest {
    id: u64,
    start: u64,
    end: u64,
    waiters: Arc<Notify>,
}

impl InFlightRequest {
    fn overlaps(&self, start: u64, end: u64) -> bool {
        end > self.start && start < self.end
    }
}

#[derive(Debug, Default)]
struct Registry {
    next_id: u64,
    requests: Vec<InFlightRequest>,
}

/// Registry of cluster ranges currently being copied
#[derive(Debug, Default)]
pub struct RangeLock {
    inner: Mutex<Registry>,
}

/// Registration of an in-flight range; released on drop
#[derive(Debug)]
#[must_use = "the range is released as soon as the guard is dropped"]
pub struct InFlightGuard<'a> {
    lock: &'a RangeLock,
    id: u64,
    start: u64,
    end: u64,
}

impl<'a> InFlightGuard<'a> {
    /// First cluster of the range
    pub fn start(&self) -> u64 {
        self.start
    }

    /// One past the last cluster of the range
    pub fn end(&self) -> u64 {
        self.end
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.lock.end(self.id);
    }
}

impl RangeLock {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Suspend until no registered range intersects `[start, end)`.
    ///
    /// This is only a snapshot: a new overlapping request may register right
    /// after it returns. Use [`RangeLock::lock`] to wait and register in one
    /// step.
    pub async fn wait_for_overlap(&self, start: u64, end: u64) {
        loop {
            let waiters: Arc<Notify>;
            let notified;
            {
                let registry = self.registry();
                match Self::find_overlap(&registry, start, end) {
                    Some(found) => waiters = found,
                    None => return,
                }
                // Created under the registry lock so the wake from `end`
                // cannot slip in between the check and the wait.
                notified = waiters.notified();
            }
            notified.await;
        }
    }

    /// Wait for `[start, end)` to be free of in-flight requests, then
    /// register it.
    ///
    /// The final overlap check and the registration happen under the same
    /// registry lock, so two callers can never both pass the check.
    pub async fn lock(&self, start: u64, end: u64) -> InFlightGuard<'_> {
        loop {
            let waiters: Arc<Notify>;
            let notified;
            {
                let mut registry = self.registry();
                match Self::find_overlap(&registry, start, end) {
                    Some(found) => waiters = found,
                    None => return self.begin(&mut registry, start, end),
                }
                notified = waiters.notified();
            }
            notified.await;
        }
    }

    /// Number of registered requests
    pub fn in_flight(&self) -> usize {
        self.registry().requests.len()
    }

    /// True when nothing is registered
    pub fn is_empty(&self) -> bool {
        self.in_flight() == 0
    }

    fn find_overlap(registry: &Registry, start: u64, end: u64) -> Option<Arc<Notify>> {
        registry
            .requests
            .iter()
            .find(|r| r.overlaps(start, end))
            .map(|r| Arc::clone(&r.waiters))
    }

    fn begin(&self, registry: &mut Registry, start: u64, end: u64) -> InFlightGuard<'_> {
        let id = registry.next_id;
        registry.next_id += 1;
        registry.requests.push(InFlightRequest {
            id,
            start,
            end,
            waiters: Arc::new(Notify::new()),
        });

        InFlightGuard {
            lock: self,
            id,
            start,
            end,
        }
    }

    fn end(&self, id: u64) {
        let request = {
            let mut registry = self.registry();
            registry
                .requests
                .iter()
                .position(|r| r.id == id)
                .map(|pos| registry.requests.swap_remove(pos))
        };

        if let Some(request) = request {
            request.waiters.notify_waiters();
        }
    }
}
