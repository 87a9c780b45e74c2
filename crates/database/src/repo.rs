//! Read access to the node index, plus the entry point for writes.

use crate::Database;
use crate::error::{ErrorKind, Result};
use crate::models::{NodeId, NodeRecord, RootRecord};
use crate::queries;
use crate::unit::UnitOfWork;
use exn::ResultExt;
use folio_storage::{FolderHeader, NodePath};
use sqlx::SqlitePool;
use sqlx::pool::PoolConnection;
use std::path::Path;

/// Repository over roots, nodes and root directory hashes.
///
/// Reads go straight to the pool. Writes always go through a
/// [`UnitOfWork`] obtained from [`begin`](Self::begin), which is one
/// transaction: all or nothing.
///
/// > **Note:** an in-memory database has a single connection. Do not read
/// > through the repository while holding an open unit of work; use the
/// > unit's own read methods instead.
#[derive(Debug, Clone)]
pub struct Repository {
    pool: SqlitePool,
}
impl From<&Database> for Repository {
    fn from(db: &Database) -> Self {
        Self { pool: db.pool().clone() }
    }
}
impl Repository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    async fn connection(&self) -> Result<PoolConnection<sqlx::Sqlite>> {
        self.pool.acquire().await.or_raise(|| ErrorKind::Database)
    }

    /// Start a transaction.
    pub async fn begin(&self) -> Result<UnitOfWork> {
        let tx = self.pool.begin().await.or_raise(|| ErrorKind::Database)?;
        Ok(UnitOfWork::new(tx))
    }

    // =========================================================================
    // Roots
    // =========================================================================

    pub async fn find_root(&self, root_child: &NodePath) -> Result<Option<RootRecord>> {
        queries::select_root(&mut *self.connection().await?, root_child).await
    }

    /// Like [`find_root`](Self::find_root), but a missing root is an error.
    pub async fn root_or_raise(&self, root_child: &NodePath) -> Result<RootRecord> {
        match self.find_root(root_child).await? {
            Some(root) => Ok(root),
            None => exn::bail!(ErrorKind::RootNotFound(root_child.to_string())),
        }
    }

    /// All root children recorded under a configured root.
    pub async fn list_roots(&self, root_path: &Path) -> Result<Vec<RootRecord>> {
        queries::list_roots(&mut *self.connection().await?, root_path).await
    }

    // =========================================================================
    // Nodes
    // =========================================================================

    /// Persisted header of a folder (or configured root directory), if it has
    /// been reconciled at least once.
    pub async fn folder_header(&self, path: &NodePath) -> Result<Option<FolderHeader>> {
        queries::folder_header(&mut *self.connection().await?, path).await
    }

    pub async fn get_node(&self, path: &NodePath) -> Result<Option<NodeRecord>> {
        queries::select_node(&mut *self.connection().await?, path).await
    }

    pub async fn children(&self, parent: NodeId) -> Result<Vec<NodeRecord>> {
        queries::select_children(&mut *self.connection().await?, parent).await
    }

    /// Ids of the nodes at `paths`. Unknown paths are skipped.
    pub async fn node_ids_for_paths(&self, paths: &[NodePath]) -> Result<Vec<NodeId>> {
        queries::node_ids_for_paths(&mut *self.connection().await?, paths).await
    }
}
