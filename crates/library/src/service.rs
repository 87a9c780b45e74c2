//! Wiring of the cache, the index, the watchers and the pipelines.

use crate::error::{ErrorKind, Result};
use crate::external::{MetadataService, NotificationSink};
use crate::pipeline::{
    MetadataAddHandler, MetadataAddRequest, MetadataQueues, MetadataRemoveHandler, MetadataRemoveRequest,
    PersistHandler, PersistRequest, RootChangeHandler, ScanHandler, ScanRequest,
};
use crate::progress::{ScanCompleted, ScanProgressTracker};
use crate::sync::PersistenceSynchronizer;
use crate::watch::{ChangeWatcher, RootChange};
use exn::ResultExt;
use folio_asyncutils::{Channel, ChannelSender, InFlight, WorkerPool};
use folio_cache::{CacheSubscription, FolderCacheStore};
use folio_config::Config;
use folio_database::Repository;
use folio_storage::{LocalNodeFactory, RootSet};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Settled root changes must apply in order.
const ROOT_CHANGE_WORKERS: usize = 1;

/// External collaborators the service reports to.
#[derive(Clone)]
pub struct Collaborators {
    pub notifications: Arc<dyn NotificationSink>,
    pub metadata: Arc<dyn MetadataService>,
}

struct Channels {
    scan: Channel<ScanRequest>,
    persist: Channel<PersistRequest>,
    metadata_add: Channel<MetadataAddRequest>,
    metadata_remove: Channel<MetadataRemoveRequest>,
    root_changes: Channel<RootChange>,
}

impl Channels {
    fn new(progress: &ScanProgressTracker) -> Self {
        Self {
            scan: Channel::new(progress.track("scan")),
            persist: Channel::new(progress.track("persist")),
            metadata_add: Channel::new(progress.track("metadata-add")),
            metadata_remove: Channel::new(progress.track("metadata-remove")),
            root_changes: Channel::new(InFlight::new("root-changes")),
        }
    }

    fn close(&self) {
        self.root_changes.close();
        self.scan.close();
        self.persist.close();
        self.metadata_add.close();
        self.metadata_remove.close();
    }
}

/// The running library: folder cache, node index and background pipelines.
pub struct LibraryService {
    roots: RootSet,
    cache: Arc<FolderCacheStore>,
    progress: ScanProgressTracker,
    channels: Channels,
    scan: ChannelSender<ScanRequest>,
    pools: Vec<WorkerPool>,
    watchers: Vec<ChangeWatcher>,
    forwarder: JoinHandle<()>,
    cancel: CancellationToken,
}

impl LibraryService {
    /// Build everything and start the worker pools. Watchers are only started
    /// when `watch_roots` is set. Must be called from within a Tokio runtime.
    pub fn start(
        config: &Config,
        repository: Repository,
        collaborators: Collaborators,
        watch_roots: bool,
    ) -> Result<Self> {
        let mut roots = RootSet::new(config.roots.iter().map(|r| (r.path.clone(), r.hidden)))
            .or_raise(|| ErrorKind::Storage)?;
        if let Some(cache_dir) = &config.cache_dir {
            roots = roots.with_cache_dir(cache_dir.clone()).or_raise(|| ErrorKind::Storage)?;
        }
        let factory = Arc::new(LocalNodeFactory::new(roots.clone()));
        let cache = Arc::new(FolderCacheStore::new(factory, &config.folder_cache));
        let progress = ScanProgressTracker::new(config.progress.window(), config.progress.max_delay());
        let channels = Channels::new(&progress);
        let cancel = CancellationToken::new();

        let metadata =
            MetadataQueues { add: channels.metadata_add.sender(), remove: channels.metadata_remove.sender() };
        let sync = Arc::new(PersistenceSynchronizer::new(repository, Arc::clone(&cache), metadata, &config.sync));

        let scan_handler = ScanHandler {
            sync: Arc::clone(&sync),
            scan: channels.scan.sender(),
            persist: channels.persist.sender(),
        };
        let persist_handler = PersistHandler { sync, cancel: cancel.child_token() };
        let root_change_handler = RootChangeHandler { cache: Arc::clone(&cache), scan: channels.scan.sender() };
        let workers = &config.workers;
        let pools = vec![
            WorkerPool::spawn(
                &channels.root_changes,
                ROOT_CHANGE_WORKERS,
                Arc::new(root_change_handler),
                cancel.child_token(),
            ),
            WorkerPool::spawn(&channels.scan, workers.scan, Arc::new(scan_handler), cancel.child_token()),
            WorkerPool::spawn(&channels.persist, workers.persist, Arc::new(persist_handler), cancel.child_token()),
            WorkerPool::spawn(
                &channels.metadata_add,
                workers.metadata,
                Arc::new(MetadataAddHandler { service: Arc::clone(&collaborators.metadata) }),
                cancel.child_token(),
            ),
            WorkerPool::spawn(
                &channels.metadata_remove,
                workers.metadata,
                Arc::new(MetadataRemoveHandler { service: Arc::clone(&collaborators.metadata) }),
                cancel.child_token(),
            ),
        ];

        let forwarder = tokio::spawn(forward_notifications(
            cache.subscribe(),
            Arc::clone(&collaborators.notifications),
            cancel.child_token(),
        ));

        let mut watchers = Vec::new();
        if watch_roots {
            for root in roots.roots() {
                let sink = channels.root_changes.sender();
                let (window, max_delay) = (config.watch.window(), config.watch.max_delay());
                match ChangeWatcher::new(root.path.to_path_buf(), sink, window, max_delay) {
                    Ok(watcher) => watchers.push(watcher),
                    // The other roots are still worth watching.
                    Err(err) => tracing::error!(root = %root.path.display(), error = ?err, "Failed to watch root"),
                }
            }
        }

        tracing::info!(roots = roots.roots().len(), watchers = watchers.len(), "Library service started");
        let scan = channels.scan.sender();
        Ok(Self { roots, cache, progress, channels, scan, pools, watchers, forwarder, cancel })
    }

    pub fn cache(&self) -> &Arc<FolderCacheStore> {
        &self.cache
    }

    /// Queue a dirty check of `path`. Returns `false` once shutting down.
    pub fn request_scan(&self, path: impl Into<PathBuf>, recursive: bool) -> bool {
        self.scan.enqueue(ScanRequest { path: path.into(), recursive })
    }

    /// Queue a recursive scan of every configured root.
    pub fn scan_all(&self) {
        for root in self.roots.roots() {
            self.request_scan(root.path.to_path_buf(), true);
        }
    }

    pub fn is_scanning(&self) -> bool {
        self.progress.is_scanning()
    }

    pub fn progress(&self) -> watch::Receiver<bool> {
        self.progress.progress()
    }

    pub fn completions(&self) -> broadcast::Receiver<ScanCompleted> {
        self.progress.completions()
    }

    /// Stop watching, stop accepting work and wait for the messages being
    /// handled to finish. Queued messages are dropped.
    pub async fn shutdown(mut self) {
        tracing::info!("Shutting down library service");
        for watcher in &mut self.watchers {
            watcher.dispose();
        }
        self.channels.close();
        self.cancel.cancel();
        for pool in self.pools.drain(..) {
            pool.join().await;
        }
        if let Err(err) = (&mut self.forwarder).await {
            tracing::error!(error = %err, "Notification forwarder terminated abnormally");
        }
    }
}

impl Drop for LibraryService {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Relay cache events to the notification sink until cancelled.
async fn forward_notifications(
    mut events: CacheSubscription,
    sink: Arc<dyn NotificationSink>,
    cancel: CancellationToken,
) {
    loop {
        let result = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            event = events.added.recv() => match event {
                Ok(event) => sink.node_added(&event).await,
                Err(err) => lagged_or_closed(err),
            },
            event = events.updated.recv() => match event {
                Ok(event) => sink.node_updated(&event).await,
                Err(err) => lagged_or_closed(err),
            },
            event = events.removed.recv() => match event {
                Ok(event) => sink.node_removed(&event).await,
                Err(err) => lagged_or_closed(err),
            },
        };
        if let Err(err) = result {
            tracing::warn!(error = ?err, "Notification sink failed");
        }
    }
}

fn lagged_or_closed(err: broadcast::error::RecvError) -> Result<()> {
    match err {
        broadcast::error::RecvError::Lagged(skipped) => {
            tracing::warn!(skipped, "Notification forwarder fell behind; events dropped");
            Ok(())
        },
        // The store keeps its senders for as long as it lives.
        broadcast::error::RecvError::Closed => Ok(()),
    }
}
