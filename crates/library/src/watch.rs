//! Native filesystem watching of configured roots.
//!
//! Watch events are only a hint. Each settled event turns into scan requests,
//! and the hash comparison during reconciliation decides what actually
//! changed, so dropped or duplicated events are harmless.

use crate::error::{ErrorKind, Result};
use derive_more::Display;
use exn::ResultExt;
use folio_asyncutils::{ChannelSender, Message, debounced};
use futures::{Stream, StreamExt};
use notify::event::ModifyKind;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// The logical change a raw watch event is folded into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum ChangeKind {
    #[display("created")]
    Created,
    #[display("changed")]
    Changed,
    #[display("deleted")]
    Deleted,
    #[display("renamed")]
    Renamed,
    /// The watch itself failed or overflowed; the whole root needs a rescan.
    #[display("error")]
    Error,
}

impl ChangeKind {
    /// `None` for events that never change what a folder contains.
    pub fn classify(kind: &EventKind) -> Option<Self> {
        match kind {
            EventKind::Create(_) => Some(Self::Created),
            EventKind::Remove(_) => Some(Self::Deleted),
            EventKind::Modify(ModifyKind::Name(_)) => Some(Self::Renamed),
            EventKind::Modify(_) | EventKind::Any | EventKind::Other => Some(Self::Changed),
            EventKind::Access(_) => None,
        }
    }
}

/// A settled change below one root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RootChange {
    pub root: PathBuf,
    pub path: PathBuf,
    pub kind: ChangeKind,
}

impl Message for RootChange {
    fn identifier(&self) -> String {
        format!("{}:{}", self.kind, self.path.display())
    }
}

type RawKey = (PathBuf, ChangeKind);

/// The part of the watcher that runs inside the notify callback.
struct EventRouter {
    root: PathBuf,
    raw: mpsc::UnboundedSender<(RawKey, ())>,
    sink: ChannelSender<RootChange>,
}

impl EventRouter {
    fn route(&self, result: notify::Result<Event>) {
        let event = match result {
            Ok(event) => event,
            Err(err) => {
                tracing::warn!(root = %self.root.display(), error = %err, "Watch error; rescanning root");
                self.escalate();
                return;
            },
        };
        if event.need_rescan() {
            tracing::warn!(root = %self.root.display(), "Watcher dropped events; rescanning root");
            self.escalate();
            return;
        }
        let Some(kind) = ChangeKind::classify(&event.kind) else {
            return;
        };
        for path in event.paths {
            // Only fails once the forwarding task is gone, which means we are shutting down.
            _ = self.raw.send(((path, kind), ()));
        }
    }

    /// Errors skip the debounce; there is nothing to coalesce them with.
    fn escalate(&self) {
        self.sink.enqueue(RootChange { root: self.root.clone(), path: self.root.clone(), kind: ChangeKind::Error });
    }
}

async fn forward(
    root: PathBuf,
    settled: impl Stream<Item = (RawKey, ())>,
    sink: ChannelSender<RootChange>,
    cancel: CancellationToken,
) {
    let mut settled = std::pin::pin!(settled);
    loop {
        let next = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            next = settled.next() => next,
        };
        let Some(((path, kind), ())) = next else {
            break;
        };
        tracing::trace!(root = %root.display(), path = %path.display(), %kind, "Settled watch event");
        sink.enqueue(RootChange { root: root.clone(), path, kind });
    }
}

/// Route raw events through a debounce keyed by `(path, kind)` into `sink`.
fn spawn_router(
    root: &Path,
    sink: ChannelSender<RootChange>,
    window: Duration,
    max_delay: Duration,
    cancel: CancellationToken,
) -> EventRouter {
    let (raw, rx) = mpsc::unbounded_channel();
    tokio::spawn(forward(root.to_path_buf(), debounced(rx, window, max_delay), sink.clone(), cancel));
    EventRouter { root: root.to_path_buf(), raw, sink }
}

/// Non-recursive watch on one configured root.
///
/// Only the root's immediate children are observed. Deeper changes are found
/// by recursive scans comparing folder hashes.
pub struct ChangeWatcher {
    root: PathBuf,
    watcher: Option<RecommendedWatcher>,
    cancel: CancellationToken,
}

impl ChangeWatcher {
    /// Start watching. Must be called from within a Tokio runtime.
    pub fn new(
        root: impl Into<PathBuf>,
        sink: ChannelSender<RootChange>,
        window: Duration,
        max_delay: Duration,
    ) -> Result<Self> {
        let root = root.into();
        let cancel = CancellationToken::new();
        let router = spawn_router(&root, sink, window, max_delay, cancel.clone());
        let watcher = notify::recommended_watcher(move |result| router.route(result))
            .and_then(|mut watcher| watcher.watch(&root, RecursiveMode::NonRecursive).map(|()| watcher));
        let watcher = match watcher {
            Ok(watcher) => watcher,
            Err(err) => {
                cancel.cancel();
                return Err(err).or_raise(|| ErrorKind::Watch(root.clone()));
            },
        };
        tracing::info!(root = %root.display(), "Watching root");
        Ok(Self { root, watcher: Some(watcher), cancel })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Stop watching. Events still waiting out their debounce are dropped.
    pub fn dispose(&mut self) {
        if let Some(mut watcher) = self.watcher.take() {
            if let Err(err) = watcher.unwatch(&self.root) {
                tracing::debug!(root = %self.root.display(), error = %err, "Failed to unwatch root");
            }
            // Dropping the watcher drops the callback, which closes the raw channel.
            drop(watcher);
            tracing::debug!(root = %self.root.display(), "Stopped watching root");
        }
        self.cancel.cancel();
    }
}

impl Drop for ChangeWatcher {
    fn drop(&mut self) {
        self.dispose();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use folio_asyncutils::{Channel, InFlight};
    use notify::event::{CreateKind, Flag, RemoveKind};
    use rstest::rstest;

    fn router(channel: &Channel<RootChange>, cancel: &CancellationToken) -> EventRouter {
        let (window, max_delay) = (Duration::from_secs(1), Duration::from_secs(30));
        spawn_router(Path::new("/srv/music"), channel.sender(), window, max_delay, cancel.clone())
    }

    fn event(kind: EventKind, path: &str) -> notify::Result<Event> {
        Ok(Event::new(kind).add_path(PathBuf::from(path)))
    }

    #[rstest]
    #[case(EventKind::Create(CreateKind::File), Some(ChangeKind::Created))]
    #[case(EventKind::Remove(RemoveKind::Folder), Some(ChangeKind::Deleted))]
    #[case(EventKind::Modify(ModifyKind::Name(notify::event::RenameMode::Any)), Some(ChangeKind::Renamed))]
    #[case(EventKind::Modify(ModifyKind::Any), Some(ChangeKind::Changed))]
    #[case(EventKind::Access(notify::event::AccessKind::Any), None)]
    fn test_classify(#[case] kind: EventKind, #[case] expected: Option<ChangeKind>) {
        assert_eq!(ChangeKind::classify(&kind), expected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_on_one_path_is_coalesced() {
        let channel = Channel::new(InFlight::new("root-changes"));
        let cancel = CancellationToken::new();
        let router = router(&channel, &cancel);
        router.route(event(EventKind::Modify(ModifyKind::Any), "/srv/music/Artist"));
        tokio::time::sleep(Duration::from_millis(200)).await;
        router.route(event(EventKind::Modify(ModifyKind::Any), "/srv/music/Artist"));
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(channel.in_flight().count(), 0);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(channel.in_flight().count(), 1);
        cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_distinct_kinds_are_not_coalesced() {
        let channel = Channel::new(InFlight::new("root-changes"));
        let cancel = CancellationToken::new();
        let router = router(&channel, &cancel);
        router.route(event(EventKind::Create(CreateKind::Folder), "/srv/music/New"));
        router.route(event(EventKind::Remove(RemoveKind::Folder), "/srv/music/New"));
        router.route(event(EventKind::Access(notify::event::AccessKind::Any), "/srv/music/Other"));
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(channel.in_flight().count(), 2);
        cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_rescan_flag_escalates_immediately() {
        let channel = Channel::new(InFlight::new("root-changes"));
        let cancel = CancellationToken::new();
        let router = router(&channel, &cancel);
        router.route(Ok(Event::new(EventKind::Other).set_flag(Flag::Rescan)));
        assert_eq!(channel.in_flight().count(), 1);
        router.route(Err(notify::Error::generic("queue overflow")));
        assert_eq!(channel.in_flight().count(), 2);
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_watch_and_dispose() {
        let temp_dir = tempfile::tempdir().unwrap();
        let channel = Channel::new(InFlight::new("root-changes"));
        let mut watcher =
            ChangeWatcher::new(temp_dir.path(), channel.sender(), Duration::from_millis(10), Duration::from_secs(1))
                .unwrap();
        assert_eq!(watcher.root(), temp_dir.path());
        watcher.dispose();
        // Disposing twice is harmless.
        watcher.dispose();
    }

    #[tokio::test]
    async fn test_missing_root_cannot_be_watched() {
        let temp_dir = tempfile::tempdir().unwrap();
        let channel = Channel::new(InFlight::new("root-changes"));
        let err = ChangeWatcher::new(
            temp_dir.path().join("gone"),
            channel.sender(),
            Duration::from_millis(10),
            Duration::from_secs(1),
        )
        .map(|_| ())
        .unwrap_err();
        assert!(matches!(&*err, ErrorKind::Watch(_)));
    }
}
