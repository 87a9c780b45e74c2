//! Keyed debouncing with a hard upper bound on delivery delay.
//!
//! Every key owns its own timer. A new event for a pending key pushes the
//! timer out by another `window`, but never beyond `first_seen + max_delay`,
//! so a key that keeps churning is still delivered eventually.

use async_stream::stream;
use futures::Stream;
use std::collections::HashMap;
use std::hash::Hash;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::Instant;

struct Pending<V> {
    value: V,
    first_seen: Instant,
    deadline: Instant,
}

/// Pure debounce state machine.
///
/// Time is always passed in by the caller, which keeps this type trivially
/// testable; [`debounced`] is the driver that feeds it from a channel.
pub struct Debounce<K, V> {
    window: Duration,
    max_delay: Duration,
    pending: HashMap<K, Pending<V>>,
}

impl<K: Eq + Hash, V> Debounce<K, V> {
    pub fn new(window: Duration, max_delay: Duration) -> Self {
        Self {
            window,
            // A maximum shorter than the window would make the window meaningless.
            max_delay: max_delay.max(window),
            pending: HashMap::new(),
        }
    }

    /// Record an event. The most recent value for a key wins.
    pub fn push(&mut self, key: K, value: V, now: Instant) {
        match self.pending.get_mut(&key) {
            Some(pending) => {
                pending.value = value;
                pending.deadline = (now + self.window).min(pending.first_seen + self.max_delay);
            },
            None => {
                let pending = Pending { value, first_seen: now, deadline: now + self.window };
                self.pending.insert(key, pending);
            },
        }
    }

    /// Earliest instant at which some key settles.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.values().map(|p| p.deadline).min()
    }

    /// Remove and return every key whose window has settled, in the order
    /// their windows settled.
    pub fn drain_due(&mut self, now: Instant) -> Vec<(K, V)> {
        let due: Vec<_> = self.pending.extract_if(|_, p| p.deadline <= now).collect();
        Self::in_settle_order(due)
    }

    /// Flush everything regardless of deadlines (used when the source closes).
    pub fn drain_all(&mut self) -> Vec<(K, V)> {
        let all: Vec<_> = self.pending.drain().collect();
        Self::in_settle_order(all)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    fn in_settle_order(mut settled: Vec<(K, Pending<V>)>) -> Vec<(K, V)> {
        settled.sort_by_key(|(_, p)| p.deadline);
        settled.into_iter().map(|(k, p)| (k, p.value)).collect()
    }
}

enum Step<K, V> {
    Received(K, V),
    Due,
    Closed,
}

/// Coalesce a channel of raw `(key, value)` events into settled events.
///
/// The stream ends once the sender side is dropped, after flushing whatever
/// was still pending.
pub fn debounced<K, V>(
    mut rx: UnboundedReceiver<(K, V)>,
    window: Duration,
    max_delay: Duration,
) -> impl Stream<Item = (K, V)>
where
    K: Eq + Hash + Send + 'static,
    V: Send + 'static,
{
    stream! {
        let mut debounce = Debounce::new(window, max_delay);
        loop {
            let next = debounce.next_deadline();
            let timer = async move {
                match next {
                    Some(deadline) => tokio::time::sleep_until(deadline).await,
                    None => std::future::pending::<()>().await,
                }
            };
            // Yielding from inside `select!` does not survive the stream macro.
            let step = tokio::select! {
                received = rx.recv() => match received {
                    Some((key, value)) => Step::Received(key, value),
                    None => Step::Closed,
                },
                () = timer => Step::Due,
            };
            match step {
                Step::Received(key, value) => debounce.push(key, value, Instant::now()),
                Step::Due => {
                    for settled in debounce.drain_due(Instant::now()) {
                        yield settled;
                    }
                },
                Step::Closed => {
                    for settled in debounce.drain_all() {
                        yield settled;
                    }
                    break;
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use tokio::sync::mpsc::unbounded_channel;

    const WINDOW: Duration = Duration::from_secs(1);
    const MAX: Duration = Duration::from_secs(30);

    #[test]
    fn test_burst_on_same_key_coalesces() {
        let start = Instant::now();
        let mut debounce = Debounce::new(WINDOW, MAX);
        debounce.push("a.mp3", 1, start);
        debounce.push("a.mp3", 2, start + Duration::from_millis(200));
        assert!(debounce.drain_due(start + Duration::from_millis(1100)).is_empty());
        let settled = debounce.drain_due(start + Duration::from_millis(1200));
        assert_eq!(settled, vec![("a.mp3", 2)]);
        assert!(debounce.is_empty());
    }

    #[test]
    fn test_distinct_keys_are_not_coalesced() {
        let start = Instant::now();
        let mut debounce = Debounce::new(WINDOW, MAX);
        debounce.push("a", (), start);
        debounce.push("b", (), start);
        assert_eq!(debounce.len(), 2);
        assert_eq!(debounce.drain_due(start + WINDOW).len(), 2);
    }

    #[test]
    fn test_max_delay_forces_delivery_under_churn() {
        let start = Instant::now();
        let mut debounce = Debounce::new(WINDOW, Duration::from_secs(3));
        // An event every 500ms would starve a plain debounce forever.
        for i in 0..10u64 {
            let now = start + Duration::from_millis(500 * i);
            let due = debounce.drain_due(now);
            if i < 6 {
                assert!(due.is_empty(), "delivered too early at step {i}");
            } else if i == 6 {
                assert_eq!(due.len(), 1, "should be force-fired at the maximum delay");
            }
            debounce.push("busy", i, now);
        }
    }

    #[test]
    fn test_settle_order_follows_deadlines_not_arrival() {
        let start = Instant::now();
        let mut debounce = Debounce::new(WINDOW, MAX);
        debounce.push("first", (), start);
        debounce.push("second", (), start + Duration::from_millis(100));
        // "first" keeps getting touched, so "second" settles earlier.
        debounce.push("first", (), start + Duration::from_millis(600));
        let settled = debounce.drain_due(start + Duration::from_secs(2));
        let keys: Vec<_> = settled.into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["second", "first"]);
    }

    #[test]
    fn test_max_delay_never_shorter_than_window() {
        let start = Instant::now();
        let mut debounce = Debounce::new(WINDOW, Duration::from_millis(10));
        debounce.push("k", (), start);
        assert_eq!(debounce.next_deadline(), Some(start + WINDOW));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stream_delivers_single_event_per_burst() {
        let (tx, rx) = unbounded_channel();
        let mut stream = Box::pin(debounced(rx, WINDOW, MAX));
        tx.send(("/music/a.mp3", "changed")).unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        tx.send(("/music/a.mp3", "changed")).unwrap();
        let first = stream.next().await;
        assert_eq!(first, Some(("/music/a.mp3", "changed")));
        drop(tx);
        assert_eq!(stream.next().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stream_flushes_pending_on_close() {
        let (tx, rx) = unbounded_channel();
        let mut stream = Box::pin(debounced(rx, Duration::from_secs(3600), Duration::from_secs(3600)));
        tx.send((1, ())).unwrap();
        drop(tx);
        assert_eq!(stream.next().await, Some((1, ())));
        assert_eq!(stream.next().await, None);
    }
}
