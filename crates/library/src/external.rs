//! Collaborators living outside the core: whoever pushes change notifications
//! to connected clients, and whoever extracts media metadata.
//!
//! Both are best-effort. A failing implementation is logged by the caller and
//! never stops a pipeline.

use crate::error::Result;
use async_trait::async_trait;
use folio_cache::{ItemAdded, ItemRemoved, ItemUpdated};
use folio_database::NodeId;
use folio_storage::NodePath;

/// Receives the cache's change events.
///
/// Events carry the whole node plus its parent, so a consumer can recompute
/// the position of the node under whatever sort mode each of its clients uses.
#[async_trait]
pub trait NotificationSink: Send + Sync + 'static {
    async fn node_added(&self, event: &ItemAdded) -> Result<()>;
    async fn node_updated(&self, event: &ItemUpdated) -> Result<()>;
    async fn node_removed(&self, event: &ItemRemoved) -> Result<()>;
}

#[async_trait]
pub trait MetadataService: Send + Sync + 'static {
    /// (Re)read media metadata for files that were inserted or changed.
    async fn update_media_metadata(&self, node_ids: &[NodeId]) -> Result<()>;
    /// Forget metadata for nodes that no longer exist.
    async fn remove_media_metadata(&self, paths: &[NodePath]) -> Result<()>;
}

/// Logs every event at `debug` and does nothing else.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingNotificationSink;

#[async_trait]
impl NotificationSink for LoggingNotificationSink {
    async fn node_added(&self, event: &ItemAdded) -> Result<()> {
        tracing::debug!(path = %event.node.path(), "Node added");
        Ok(())
    }

    async fn node_updated(&self, event: &ItemUpdated) -> Result<()> {
        match event.is_rename() {
            true => tracing::debug!(path = %event.node.path(), old_path = %event.old_path, "Node renamed"),
            false => tracing::debug!(path = %event.node.path(), "Node updated"),
        }
        Ok(())
    }

    async fn node_removed(&self, event: &ItemRemoved) -> Result<()> {
        tracing::debug!(path = %event.node.path(), "Node removed");
        Ok(())
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingMetadataService;

#[async_trait]
impl MetadataService for LoggingMetadataService {
    async fn update_media_metadata(&self, node_ids: &[NodeId]) -> Result<()> {
        tracing::debug!(count = node_ids.len(), "Media metadata update requested");
        Ok(())
    }

    async fn remove_media_metadata(&self, paths: &[NodePath]) -> Result<()> {
        tracing::debug!(count = paths.len(), "Media metadata removal requested");
        Ok(())
    }
}
