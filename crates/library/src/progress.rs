//! Whether a scan is running, derived from the in-flight counters of every
//! scan-related pipeline.
//!
//! Pipelines hand work to each other with short gaps where every counter is
//! zero, so "done" is only reported once the total has stayed at zero for a
//! debounce window.

use folio_asyncutils::{InFlight, InFlightObserver, debounced};
use futures::StreamExt;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Fired when a scan has settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanCompleted {
    pub elapsed: Duration,
}

struct State {
    channels: Mutex<Vec<InFlight>>,
    /// Set while a scan is running. Also serializes the start/settle transitions.
    started: Mutex<Option<Instant>>,
    progress: watch::Sender<bool>,
    completions: broadcast::Sender<ScanCompleted>,
}

impl State {
    fn total(&self) -> usize {
        let channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        channels.iter().map(InFlight::count).sum()
    }

    fn mark_busy(&self) {
        let mut started = self.started.lock().unwrap_or_else(|e| e.into_inner());
        if started.is_none() {
            *started = Some(Instant::now());
            self.progress.send_replace(true);
            tracing::info!("Scan started");
        }
    }

    /// Runs once the total has been zero for a full debounce window. Anything
    /// queued in the meantime turns this into a no-op.
    fn settle(&self) {
        let mut started = self.started.lock().unwrap_or_else(|e| e.into_inner());
        if self.total() > 0 {
            return;
        }
        let Some(since) = started.take() else {
            return;
        };
        self.progress.send_replace(false);
        let elapsed = since.elapsed();
        tracing::info!(elapsed = ?elapsed, "Scan completed");
        // Nobody listening is fine.
        _ = self.completions.send(ScanCompleted { elapsed });
    }
}

struct Observer {
    state: Weak<State>,
    idle: mpsc::UnboundedSender<((), ())>,
}

impl InFlightObserver for Observer {
    fn transitioned(&self, name: &str, count: usize) {
        let Some(state) = self.state.upgrade() else {
            return;
        };
        tracing::trace!(channel = name, count, "In-flight transition");
        // `count` may already be stale; only the direction matters.
        match count {
            0 => {
                _ = self.idle.send(((), ()));
            },
            _ => state.mark_busy(),
        }
    }
}

pub struct ScanProgressTracker {
    state: Arc<State>,
    observer: Arc<Observer>,
    settler: JoinHandle<()>,
}

impl ScanProgressTracker {
    /// Must be called from within a Tokio runtime.
    pub fn new(window: Duration, max_delay: Duration) -> Self {
        let state = Arc::new(State {
            channels: Mutex::new(Vec::new()),
            started: Mutex::new(None),
            progress: watch::Sender::new(false),
            completions: broadcast::channel(16).0,
        });
        let (idle, rx) = mpsc::unbounded_channel();
        let observer = Arc::new(Observer { state: Arc::downgrade(&state), idle });
        let weak = Arc::downgrade(&state);
        let settler = tokio::spawn(async move {
            let mut settled = std::pin::pin!(debounced(rx, window, max_delay));
            while settled.next().await.is_some() {
                let Some(state) = weak.upgrade() else {
                    break;
                };
                state.settle();
            }
        });
        Self { state, observer, settler }
    }

    /// A counter for a new channel, included in the total from now on.
    pub fn track(&self, name: impl Into<String>) -> InFlight {
        let observer: Arc<dyn InFlightObserver> = self.observer.clone();
        let in_flight = InFlight::with_observer(name, observer);
        self.state.channels.lock().unwrap_or_else(|e| e.into_inner()).push(in_flight.clone());
        in_flight
    }

    pub fn is_scanning(&self) -> bool {
        *self.state.progress.borrow()
    }

    /// Messages queued or being handled across every tracked channel.
    pub fn in_flight(&self) -> usize {
        self.state.total()
    }

    pub fn progress(&self) -> watch::Receiver<bool> {
        self.state.progress.subscribe()
    }

    pub fn completions(&self) -> broadcast::Receiver<ScanCompleted> {
        self.state.completions.subscribe()
    }
}

impl Drop for ScanProgressTracker {
    fn drop(&mut self) {
        self.settler.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker() -> ScanProgressTracker {
        ScanProgressTracker::new(Duration::from_secs(5), Duration::from_secs(30))
    }

    #[tokio::test(start_paused = true)]
    async fn test_gap_between_stages_is_not_completion() {
        let tracker = tracker();
        let mut completions = tracker.completions();
        let scan = tracker.track("scan");
        let persist = tracker.track("persist");

        scan.increment();
        assert!(tracker.is_scanning());
        scan.decrement();
        tokio::time::sleep(Duration::from_secs(2)).await;
        persist.increment();
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(tracker.is_scanning());
        assert!(completions.try_recv().is_err());

        persist.decrement();
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(!tracker.is_scanning());
        let completed = completions.try_recv().unwrap();
        assert!(completed.elapsed >= Duration::from_secs(12));
    }

    #[tokio::test(start_paused = true)]
    async fn test_total_spans_channels() {
        let tracker = tracker();
        let mut progress = tracker.progress();
        let scan = tracker.track("scan");
        let metadata = tracker.track("metadata-add");
        scan.increment();
        metadata.increment();
        scan.decrement();
        assert_eq!(tracker.in_flight(), 1);
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(*progress.borrow_and_update());

        metadata.decrement();
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(progress.has_changed().unwrap());
        assert!(!*progress.borrow_and_update());
    }

    #[tokio::test(start_paused = true)]
    async fn test_untracked_counters_do_not_count() {
        let tracker = tracker();
        let other = InFlight::new("root-changes");
        other.increment();
        assert!(!tracker.is_scanning());
        assert_eq!(tracker.in_flight(), 0);
    }
}
