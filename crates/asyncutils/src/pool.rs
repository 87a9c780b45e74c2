//! Typed message channels and the worker pools that drain them.
//!
//! Every background pipeline has the same shape: producers push messages onto
//! a [`Channel`], `N` workers pull from it and hand each message to a
//! [`Handler`]. A failing (or panicking) handler is logged and the worker
//! moves on to the next message.

use crate::inflight::InFlight;
use async_trait::async_trait;
use futures::FutureExt;
use std::fmt::Debug;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

/// Anything that can be queued for background processing.
pub trait Message: Send + 'static {
    /// Correlation identifier used in logs. Not used for deduplication.
    fn identifier(&self) -> String;
}

#[async_trait]
pub trait Handler<M: Message>: Send + Sync + 'static {
    type Error: Debug + Send;

    /// Handle a single message. Implementations open their own unit of work;
    /// nothing is shared between two invocations.
    async fn handle(&self, message: M) -> Result<(), Self::Error>;
}

/// An unbounded multi-consumer channel paired with its in-flight counter.
pub struct Channel<M> {
    tx: async_channel::Sender<M>,
    rx: async_channel::Receiver<M>,
    in_flight: InFlight,
}

impl<M: Message> Channel<M> {
    pub fn new(in_flight: InFlight) -> Self {
        let (tx, rx) = async_channel::unbounded();
        Self { tx, rx, in_flight }
    }

    pub fn name(&self) -> &str {
        self.in_flight.name()
    }

    pub fn sender(&self) -> ChannelSender<M> {
        ChannelSender { tx: self.tx.clone(), in_flight: self.in_flight.clone() }
    }

    pub fn in_flight(&self) -> &InFlight {
        &self.in_flight
    }

    /// Stop accepting new messages. Workers still drain what is queued.
    pub fn close(&self) {
        self.tx.close();
    }
}

/// Producer handle for a [`Channel`].
pub struct ChannelSender<M> {
    tx: async_channel::Sender<M>,
    in_flight: InFlight,
}

impl<M> Clone for ChannelSender<M> {
    fn clone(&self) -> Self {
        Self { tx: self.tx.clone(), in_flight: self.in_flight.clone() }
    }
}

impl<M: Message> ChannelSender<M> {
    /// Queue a message. Returns `false` if the channel has been closed.
    ///
    /// The in-flight counter is raised before the message becomes visible to
    /// workers so that the count can never be observed dipping to zero while
    /// the message is in the queue.
    pub fn enqueue(&self, message: M) -> bool {
        self.in_flight.increment();
        match self.tx.try_send(message) {
            Ok(()) => true,
            Err(err) => {
                self.in_flight.decrement();
                tracing::debug!(channel = self.in_flight.name(), id = %err.into_inner().identifier(), "Channel closed; dropping message");
                false
            },
        }
    }
}

/// A set of consumer loops draining one channel.
pub struct WorkerPool {
    name: String,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `workers` consumer loops (at least one) on the current runtime.
    ///
    /// Pipelines whose messages must apply in arrival order pin `workers` to 1.
    pub fn spawn<M, H>(channel: &Channel<M>, workers: usize, handler: Arc<H>, cancel: CancellationToken) -> Self
    where
        M: Message,
        H: Handler<M>,
    {
        let name = channel.name().to_string();
        let workers = (0..workers.max(1))
            .map(|index| {
                let rx = channel.rx.clone();
                let in_flight = channel.in_flight.clone();
                let handler = Arc::clone(&handler);
                let cancel = cancel.clone();
                tokio::spawn(worker_loop(index, rx, in_flight, handler, cancel))
            })
            .collect();
        Self { name, workers }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Wait for every worker to exit. Workers exit once cancelled (after
    /// finishing the message they are handling) or once the channel is closed
    /// and drained.
    pub async fn join(self) {
        for worker in self.workers {
            if let Err(err) = worker.await {
                tracing::error!(pool = %self.name, error = %err, "Worker task terminated abnormally");
            }
        }
    }
}

async fn worker_loop<M, H>(
    index: usize,
    rx: async_channel::Receiver<M>,
    in_flight: InFlight,
    handler: Arc<H>,
    cancel: CancellationToken,
) where
    M: Message,
    H: Handler<M>,
{
    tracing::trace!(pool = in_flight.name(), worker = index, "Worker started");
    loop {
        let message = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            received = rx.recv() => match received {
                Ok(message) => message,
                // Closed and drained.
                Err(_) => break,
            },
        };
        dispatch(&*handler, &in_flight, message).await;
        while !cancel.is_cancelled() {
            let Ok(message) = rx.try_recv() else { break };
            dispatch(&*handler, &in_flight, message).await;
        }
    }
    tracing::trace!(pool = in_flight.name(), worker = index, "Worker stopped");
}

async fn dispatch<M, H>(handler: &H, in_flight: &InFlight, message: M)
where
    M: Message,
    H: Handler<M>,
{
    let id = message.identifier();
    let span = tracing::debug_span!("message", pool = in_flight.name(), id = %id);
    let outcome = AssertUnwindSafe(handler.handle(message)).catch_unwind().instrument(span).await;
    match outcome {
        Ok(Ok(())) => {},
        Ok(Err(err)) => tracing::warn!(pool = in_flight.name(), id = %id, error = ?err, "Message handler failed"),
        Err(_) => tracing::error!(pool = in_flight.name(), id = %id, "Message handler panicked"),
    }
    in_flight.decrement();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    struct Job(u32);
    impl Message for Job {
        fn identifier(&self) -> String {
            format!("job-{}", self.0)
        }
    }

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<u32>>,
    }

    #[async_trait]
    impl Handler<Job> for Recorder {
        type Error = String;
        async fn handle(&self, message: Job) -> Result<(), String> {
            if message.0 == 2 {
                return Err("two is a bad number".to_string());
            }
            if message.0 == 3 {
                panic!("three is worse");
            }
            self.seen.lock().unwrap().push(message.0);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_failing_messages_do_not_stop_the_pool() {
        let channel = Channel::new(InFlight::new("jobs"));
        let handler = Arc::new(Recorder::default());
        let pool = WorkerPool::spawn(&channel, 1, handler.clone(), CancellationToken::new());
        let sender = channel.sender();
        for i in 1..=5 {
            assert!(sender.enqueue(Job(i)));
        }
        channel.close();
        pool.join().await;
        assert_eq!(*handler.seen.lock().unwrap(), vec![1, 4, 5]);
        assert_eq!(channel.in_flight().count(), 0);
    }

    #[tokio::test]
    async fn test_single_worker_preserves_order() {
        let channel = Channel::new(InFlight::new("ordered"));
        let handler = Arc::new(Recorder::default());
        let sender = channel.sender();
        for i in [9, 8, 7, 6] {
            sender.enqueue(Job(i));
        }
        let pool = WorkerPool::spawn(&channel, 1, handler.clone(), CancellationToken::new());
        channel.close();
        pool.join().await;
        assert_eq!(*handler.seen.lock().unwrap(), vec![9, 8, 7, 6]);
    }

    #[tokio::test]
    async fn test_cancellation_stops_idle_workers() {
        let channel: Channel<Job> = Channel::new(InFlight::new("idle"));
        let cancel = CancellationToken::new();
        let pool = WorkerPool::spawn(&channel, 4, Arc::new(Recorder::default()), cancel.clone());
        assert_eq!(pool.len(), 4);
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), pool.join()).await.unwrap();
    }

    #[tokio::test]
    async fn test_enqueue_after_close_is_rejected() {
        let channel: Channel<Job> = Channel::new(InFlight::new("closed"));
        channel.close();
        assert!(!channel.sender().enqueue(Job(1)));
        assert_eq!(channel.in_flight().count(), 0);
    }
}
