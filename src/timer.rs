//! Timer service (spec.md §4.8): one-shot, cancellable delayed callbacks.
//!
//! Built directly on the `tokio::time` driver rather than the bus's
//! `sockets_polled` tick: a delay can be much finer than the reactor's
//! tick period, and `tokio::time::sleep` already gives monotonic,
//! min-heap-backed expiry ordering for free.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

static NEXT_TIMER_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TimerHandle(u64);

struct Cancelled(AtomicBool);

/// Schedules `callback` to run once after `delay`. The returned
/// [`TimerHandle`] can be passed to [`TimerService::cancel`] at any point
/// before it fires; cancelling after it has already fired is a no-op.
pub struct TimerService;

impl TimerService {
    pub fn schedule<F>(delay: Duration, callback: F) -> TimerHandle
    where
        F: FnOnce() + Send + 'static,
    {
        let id = NEXT_TIMER_ID.fetch_add(1, Ordering::Relaxed);
        let cancelled = Arc::new(Cancelled(AtomicBool::new(false)));
        CANCEL_REGISTRY.insert(id, cancelled.clone());

        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let already_cancelled = cancelled.0.load(Ordering::SeqCst);
            CANCEL_REGISTRY.remove(id);
            if !already_cancelled {
                callback();
            }
        });

        TimerHandle(id)
    }

    /// Cancels a pending timer. Returns whether it was still pending.
    pub fn cancel(handle: TimerHandle) -> bool {
        match CANCEL_REGISTRY.get(handle.0) {
            Some(flag) => {
                flag.0.store(true, Ordering::SeqCst);
                true
            }
            None => false,
        }
    }
}

/// Tiny process-global registry mapping timer ids to their cancellation
/// flag, so `cancel` doesn't need the caller to hold onto a join handle.
struct CancelRegistry {
    inner: dashmap::DashMap<u64, Arc<Cancelled>>,
}

impl CancelRegistry {
    fn insert(&self, id: u64, flag: Arc<Cancelled>) {
        self.inner.insert(id, flag);
    }

    fn remove(&self, id: u64) {
        self.inner.remove(&id);
    }

    fn get(&self, id: u64) -> Option<Arc<Cancelled>> {
        self.inner.get(&id).map(|entry| entry.value().clone())
    }
}

static CANCEL_REGISTRY: once_cell::sync::Lazy<CancelRegistry> =
    once_cell::sync::Lazy::new(|| CancelRegistry {
        inner: dashmap::DashMap::new(),
    });
