use crate::error::{ErrorKind, Result};
use crate::models::{NewNode, NodeId, NodeRecord, NodeState, RootId, RootRecord};
use crate::queries;
use exn::ResultExt;
use folio_storage::{FolderHeader, NodePath};
use sqlx::{Sqlite, Transaction};
use std::fmt;
use std::path::Path;

type SavedCallback = Box<dyn FnOnce() + Send + 'static>;

/// One transaction against the node index.
///
/// Nothing is visible to other connections until [`save_changes`] commits.
/// Dropping a unit without saving rolls everything back and discards the
/// callbacks registered with [`on_saved`].
///
/// [`save_changes`]: Self::save_changes
/// [`on_saved`]: Self::on_saved
pub struct UnitOfWork {
    tx: Transaction<'static, Sqlite>,
    on_saved: Vec<SavedCallback>,
}

impl fmt::Debug for UnitOfWork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnitOfWork").field("on_saved", &self.on_saved.len()).finish_non_exhaustive()
    }
}

impl UnitOfWork {
    pub(crate) fn new(tx: Transaction<'static, Sqlite>) -> Self {
        Self { tx, on_saved: Vec::new() }
    }

    /// Run `callback` once the transaction has committed. Callbacks run in
    /// registration order, and never if the unit is rolled back.
    pub fn on_saved(&mut self, callback: impl FnOnce() + Send + 'static) {
        self.on_saved.push(Box::new(callback));
    }

    /// Commit, then fire the saved callbacks.
    pub async fn save_changes(self) -> Result<()> {
        self.tx.commit().await.or_raise(|| ErrorKind::Database)?;
        for callback in self.on_saved {
            callback();
        }
        Ok(())
    }

    pub async fn rollback(self) -> Result<()> {
        self.tx.rollback().await.or_raise(|| ErrorKind::Database)
    }

    // =========================================================================
    // Roots
    // =========================================================================

    /// Create the root record for a root child, or refresh its hidden flag.
    pub async fn ensure_root(&mut self, root_child: &NodePath, hidden: bool) -> Result<RootRecord> {
        queries::upsert_root(&mut *self.tx, root_child, hidden).await
    }

    pub async fn find_root(&mut self, root_child: &NodePath) -> Result<Option<RootRecord>> {
        queries::select_root(&mut *self.tx, root_child).await
    }

    pub async fn root_or_raise(&mut self, root_child: &NodePath) -> Result<RootRecord> {
        match self.find_root(root_child).await? {
            Some(root) => Ok(root),
            None => exn::bail!(ErrorKind::RootNotFound(root_child.to_string())),
        }
    }

    pub async fn list_roots(&mut self, root_path: &Path) -> Result<Vec<RootRecord>> {
        queries::list_roots(&mut *self.tx, root_path).await
    }

    /// Delete a root record and, by cascade, every node beneath it.
    pub async fn delete_root(&mut self, id: RootId) -> Result<bool> {
        queries::delete_root(&mut *self.tx, id).await
    }

    pub async fn set_root_directory_hash(&mut self, root_path: &Path, hash: &str) -> Result<()> {
        queries::upsert_root_directory_hash(&mut *self.tx, root_path, hash).await
    }

    // =========================================================================
    // Nodes
    // =========================================================================

    pub async fn folder_header(&mut self, path: &NodePath) -> Result<Option<FolderHeader>> {
        queries::folder_header(&mut *self.tx, path).await
    }

    pub async fn get_node(&mut self, path: &NodePath) -> Result<Option<NodeRecord>> {
        queries::select_node(&mut *self.tx, path).await
    }

    pub async fn children(&mut self, parent: NodeId) -> Result<Vec<NodeRecord>> {
        queries::select_children(&mut *self.tx, parent).await
    }

    pub async fn insert_nodes(&mut self, nodes: Vec<NewNode>) -> Result<Vec<NodeRecord>> {
        let mut records = Vec::with_capacity(nodes.len());
        for node in nodes {
            records.push(queries::insert_node(&mut *self.tx, node).await?);
        }
        Ok(records)
    }

    pub async fn update_node(&mut self, id: NodeId, state: &NodeState) -> Result<()> {
        queries::update_node(&mut *self.tx, id, state).await
    }

    /// Delete nodes and their descendants. Returns the number of rows named
    /// in `ids` that existed.
    pub async fn delete_nodes(&mut self, ids: &[NodeId]) -> Result<u64> {
        queries::delete_nodes(&mut *self.tx, ids).await
    }

    pub async fn set_folder_hash(&mut self, id: NodeId, hash: &str) -> Result<()> {
        queries::update_folder_hash(&mut *self.tx, id, hash).await
    }

    pub async fn node_ids_for_paths(&mut self, paths: &[NodePath]) -> Result<Vec<NodeId>> {
        queries::node_ids_for_paths(&mut *self.tx, paths).await
    }
}
