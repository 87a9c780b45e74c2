//! Messages flowing between the background pipelines, and their handlers.
//!
//! ```text
//! RootChange ──▶ ScanRequest ──▶ PersistRequest ──▶ MetadataAddRequest
//!                    │  ▲                       └─▶ MetadataRemoveRequest
//!                    └──┘ (recursive)
//! ```

use crate::error::{Error, Result};
use crate::external::MetadataService;
use crate::sync::{Changes, PersistenceSynchronizer};
use crate::watch::{ChangeKind, RootChange};
use async_trait::async_trait;
use folio_asyncutils::{ChannelSender, Handler, Message};
use folio_cache::FolderCacheStore;
use folio_database::NodeId;
use folio_storage::NodePath;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Check a folder for changes, optionally descending into its subfolders.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanRequest {
    pub path: PathBuf,
    pub recursive: bool,
}

impl Message for ScanRequest {
    fn identifier(&self) -> String {
        format!("scan:{}", self.path.display())
    }
}

/// Reconcile a folder that was found to be dirty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistRequest {
    pub path: PathBuf,
}

impl Message for PersistRequest {
    fn identifier(&self) -> String {
        format!("persist:{}", self.path.display())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataAddRequest {
    pub node_ids: Vec<NodeId>,
}

impl Message for MetadataAddRequest {
    fn identifier(&self) -> String {
        format!("metadata-add:{}", self.node_ids.len())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataRemoveRequest {
    pub paths: Vec<NodePath>,
}

impl Message for MetadataRemoveRequest {
    fn identifier(&self) -> String {
        format!("metadata-remove:{}", self.paths.len())
    }
}

/// Producer side of both metadata pipelines.
#[derive(Clone)]
pub struct MetadataQueues {
    pub add: ChannelSender<MetadataAddRequest>,
    pub remove: ChannelSender<MetadataRemoveRequest>,
}

impl MetadataQueues {
    /// One message per pipeline, and none for an empty list.
    pub fn publish(&self, changes: Changes) {
        if !changes.updated.is_empty() {
            self.add.enqueue(MetadataAddRequest { node_ids: changes.updated });
        }
        if !changes.removed.is_empty() {
            self.remove.enqueue(MetadataRemoveRequest { paths: changes.removed });
        }
    }
}

pub struct ScanHandler {
    pub sync: Arc<PersistenceSynchronizer>,
    pub scan: ChannelSender<ScanRequest>,
    pub persist: ChannelSender<PersistRequest>,
}

#[async_trait]
impl Handler<ScanRequest> for ScanHandler {
    type Error = Error;

    async fn handle(&self, request: ScanRequest) -> Result<()> {
        let (diff, snapshot) = self.sync.diff(&request.path).await?;
        if diff.is_dirty() {
            tracing::debug!(path = %request.path.display(), "Folder is dirty");
            self.persist.enqueue(PersistRequest { path: request.path.clone() });
        }
        if request.recursive {
            for folder in snapshot.subfolders() {
                self.scan.enqueue(ScanRequest { path: folder.path.absolute_path(), recursive: true });
            }
        }
        Ok(())
    }
}

pub struct PersistHandler {
    pub sync: Arc<PersistenceSynchronizer>,
    pub cancel: CancellationToken,
}

#[async_trait]
impl Handler<PersistRequest> for PersistHandler {
    type Error = Error;

    async fn handle(&self, request: PersistRequest) -> Result<()> {
        self.sync.reconcile(&request.path, &self.cancel).await.map(|_| ())
    }
}

pub struct MetadataAddHandler {
    pub service: Arc<dyn MetadataService>,
}

#[async_trait]
impl Handler<MetadataAddRequest> for MetadataAddHandler {
    type Error = Error;

    async fn handle(&self, request: MetadataAddRequest) -> Result<()> {
        self.service.update_media_metadata(&request.node_ids).await
    }
}

pub struct MetadataRemoveHandler {
    pub service: Arc<dyn MetadataService>,
}

#[async_trait]
impl Handler<MetadataRemoveRequest> for MetadataRemoveHandler {
    type Error = Error;

    async fn handle(&self, request: MetadataRemoveRequest) -> Result<()> {
        self.service.remove_media_metadata(&request.paths).await
    }
}

/// Turns settled watch events into scan requests. Runs on a single worker so
/// changes apply in the order they settled.
pub struct RootChangeHandler {
    pub cache: Arc<FolderCacheStore>,
    pub scan: ChannelSender<ScanRequest>,
}

#[async_trait]
impl Handler<RootChange> for RootChangeHandler {
    type Error = Error;

    async fn handle(&self, change: RootChange) -> Result<()> {
        let rescan_root = |recursive| ScanRequest { path: change.root.clone(), recursive };
        match change.kind {
            ChangeKind::Error => {
                self.cache.invalidate(&change.root);
                self.scan.enqueue(rescan_root(true));
            },
            ChangeKind::Deleted => {
                self.cache.invalidate(&change.path);
                self.scan.enqueue(rescan_root(false));
            },
            ChangeKind::Created | ChangeKind::Changed | ChangeKind::Renamed => {
                self.cache.invalidate(&change.path);
                self.scan.enqueue(rescan_root(false));
                // A rename reports both names; only the one still on disk is a folder.
                let is_dir = tokio::fs::metadata(&change.path).await.is_ok_and(|m| m.is_dir());
                if is_dir && change.path != change.root {
                    self.scan.enqueue(ScanRequest { path: change.path.clone(), recursive: true });
                }
            },
        }
        Ok(())
    }
}
