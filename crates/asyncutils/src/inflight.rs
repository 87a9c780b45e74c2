//! Per-channel in-flight message counters.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Notified whenever a counter crosses between zero and non-zero.
///
/// Notifications may be observed out of order under contention; observers
/// should re-read the counters they care about rather than trusting `count`.
pub trait InFlightObserver: Send + Sync {
    fn transitioned(&self, name: &str, count: usize);
}

struct Inner {
    name: String,
    count: AtomicUsize,
    observer: Option<Arc<dyn InFlightObserver>>,
}

/// Shared counter of messages that have been queued but not yet handled.
#[derive(Clone)]
pub struct InFlight {
    inner: Arc<Inner>,
}

impl InFlight {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_observer_opt(name, None)
    }

    pub fn with_observer(name: impl Into<String>, observer: Arc<dyn InFlightObserver>) -> Self {
        Self::with_observer_opt(name, Some(observer))
    }

    fn with_observer_opt(name: impl Into<String>, observer: Option<Arc<dyn InFlightObserver>>) -> Self {
        let inner = Inner { name: name.into(), count: AtomicUsize::new(0), observer };
        Self { inner: Arc::new(inner) }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn count(&self) -> usize {
        self.inner.count.load(Ordering::Acquire)
    }

    pub fn increment(&self) {
        let count = self.inner.count.fetch_add(1, Ordering::AcqRel) + 1;
        if count == 1 {
            self.notify(count);
        }
    }

    /// Saturates at zero; an unbalanced decrement is a bug but must not wrap.
    pub fn decrement(&self) {
        let previous = self
            .inner
            .count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| Some(c.saturating_sub(1)))
            .unwrap_or(0);
        if previous == 1 {
            self.notify(0);
        }
    }

    fn notify(&self, count: usize) {
        if let Some(observer) = &self.inner.observer {
            observer.transitioned(&self.inner.name, count);
        }
    }
}

impl fmt::Debug for InFlight {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InFlight").field("name", &self.inner.name).field("count", &self.count()).finish()
    }
}
