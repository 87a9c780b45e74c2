//! Statements shared by [`Repository`](crate::Repository) reads and
//! [`UnitOfWork`](crate::UnitOfWork) writes. Everything takes a bare
//! connection so the same code runs against the pool or inside a transaction.

use crate::error::{ErrorKind, Result};
use crate::models::{NewNode, NodeId, NodeRecord, NodeRow, NodeState, RootId, RootRecord, RootRow, path_str};
use exn::{OptionExt, ResultExt};
use folio_storage::{FolderHeader, NodePath};
use sqlx::{QueryBuilder, Sqlite, SqliteConnection};
use std::path::Path;

/// SQLite's default limit on bound parameters is 999 (older builds), 32766
/// (newer). Stay well under either.
const MAX_BIND_PARAMETERS: usize = 500;

fn relative_str(path: &NodePath) -> Result<&str> {
    path.relative_str().ok_or_raise(|| ErrorKind::InvalidData("path is not valid UTF-8"))
}

fn size_column(size: u64) -> Result<i64> {
    i64::try_from(size).or_raise(|| ErrorKind::InvalidData("node size"))
}

pub(crate) async fn select_root(conn: &mut SqliteConnection, root_child: &NodePath) -> Result<Option<RootRecord>> {
    let row: Option<RootRow> = sqlx::query_as(include_str!("../queries/select_root.sql"))
        .bind(path_str(root_child.root_path())?)
        .bind(relative_str(root_child)?)
        .fetch_optional(&mut *conn)
        .await
        .or_raise(|| ErrorKind::Database)?;
    row.map(RootRecord::try_from).transpose()
}

pub(crate) async fn list_roots(conn: &mut SqliteConnection, root_path: &Path) -> Result<Vec<RootRecord>> {
    let rows: Vec<RootRow> = sqlx::query_as(include_str!("../queries/list_roots.sql"))
        .bind(path_str(root_path)?)
        .fetch_all(&mut *conn)
        .await
        .or_raise(|| ErrorKind::Database)?;
    rows.into_iter().map(RootRecord::try_from).collect()
}

pub(crate) async fn upsert_root(conn: &mut SqliteConnection, root_child: &NodePath, hidden: bool) -> Result<RootRecord> {
    let row: RootRow = sqlx::query_as(include_str!("../queries/upsert_root.sql"))
        .bind(path_str(root_child.root_path())?)
        .bind(relative_str(root_child)?)
        .bind(hidden)
        .fetch_one(&mut *conn)
        .await
        .or_raise(|| ErrorKind::Database)?;
    RootRecord::try_from(row)
}

pub(crate) async fn delete_root(conn: &mut SqliteConnection, id: RootId) -> Result<bool> {
    let result = sqlx::query(include_str!("../queries/delete_root.sql"))
        .bind(id.0)
        .execute(&mut *conn)
        .await
        .or_raise(|| ErrorKind::Database)?;
    Ok(result.rows_affected() > 0)
}

pub(crate) async fn select_root_directory_hash(conn: &mut SqliteConnection, root_path: &Path) -> Result<Option<String>> {
    let hash: Option<Option<String>> = sqlx::query_scalar(include_str!("../queries/select_root_directory_hash.sql"))
        .bind(path_str(root_path)?)
        .fetch_optional(&mut *conn)
        .await
        .or_raise(|| ErrorKind::Database)?;
    Ok(hash.flatten())
}

pub(crate) async fn upsert_root_directory_hash(conn: &mut SqliteConnection, root_path: &Path, hash: &str) -> Result<()> {
    sqlx::query(include_str!("../queries/upsert_root_directory_hash.sql"))
        .bind(path_str(root_path)?)
        .bind(hash)
        .execute(&mut *conn)
        .await
        .or_raise(|| ErrorKind::Database)?;
    Ok(())
}

pub(crate) async fn select_node(conn: &mut SqliteConnection, path: &NodePath) -> Result<Option<NodeRecord>> {
    let row: Option<NodeRow> = sqlx::query_as(include_str!("../queries/select_node.sql"))
        .bind(path_str(path.root_path())?)
        .bind(relative_str(path)?)
        .fetch_optional(&mut *conn)
        .await
        .or_raise(|| ErrorKind::Database)?;
    row.map(NodeRecord::try_from).transpose()
}

pub(crate) async fn select_children(conn: &mut SqliteConnection, parent: NodeId) -> Result<Vec<NodeRecord>> {
    let rows: Vec<NodeRow> = sqlx::query_as(include_str!("../queries/select_children.sql"))
        .bind(parent.0)
        .fetch_all(&mut *conn)
        .await
        .or_raise(|| ErrorKind::Database)?;
    rows.into_iter().map(NodeRecord::try_from).collect()
}

/// Root directories keep their hash in `root_directories`; everything else
/// keeps it on the folder's own node row.
pub(crate) async fn folder_header(conn: &mut SqliteConnection, path: &NodePath) -> Result<Option<FolderHeader>> {
    if path.is_root() {
        let hash = select_root_directory_hash(conn, path.root_path()).await?;
        return Ok(hash.map(|hash| FolderHeader::new(path.clone(), hash)));
    }
    Ok(select_node(conn, path).await?.and_then(|record| record.header()))
}

pub(crate) async fn insert_node(conn: &mut SqliteConnection, node: NewNode) -> Result<NodeRecord> {
    let id: i64 = sqlx::query_scalar(include_str!("../queries/insert_node.sql"))
        .bind(node.root_id.0)
        .bind(node.parent_id.map(|id| id.0))
        .bind(relative_str(&node.path)?)
        .bind(node.kind.to_string())
        .bind(Option::<String>::None)
        .bind(node.state.exists)
        .bind(size_column(node.state.size)?)
        .bind(node.state.modified_ticks)
        .bind(node.state.created_ticks)
        .fetch_one(&mut *conn)
        .await
        .or_raise(|| ErrorKind::Database)?;
    Ok(node.into_record(NodeId(id)))
}

pub(crate) async fn update_node(conn: &mut SqliteConnection, id: NodeId, state: &NodeState) -> Result<()> {
    let result = sqlx::query(include_str!("../queries/update_node.sql"))
        .bind(state.exists)
        .bind(size_column(state.size)?)
        .bind(state.modified_ticks)
        .bind(state.created_ticks)
        .bind(id.0)
        .execute(&mut *conn)
        .await
        .or_raise(|| ErrorKind::Database)?;
    if result.rows_affected() == 0 {
        exn::bail!(ErrorKind::NodeNotFound(id.to_string()));
    }
    Ok(())
}

pub(crate) async fn update_folder_hash(conn: &mut SqliteConnection, id: NodeId, hash: &str) -> Result<()> {
    let result = sqlx::query(include_str!("../queries/update_folder_hash.sql"))
        .bind(hash)
        .bind(id.0)
        .execute(&mut *conn)
        .await
        .or_raise(|| ErrorKind::Database)?;
    if result.rows_affected() == 0 {
        exn::bail!(ErrorKind::NodeNotFound(id.to_string()));
    }
    Ok(())
}

/// Descendants go with their ancestors through `ON DELETE CASCADE`.
pub(crate) async fn delete_nodes(conn: &mut SqliteConnection, ids: &[NodeId]) -> Result<u64> {
    let mut deleted = 0;
    for chunk in ids.chunks(MAX_BIND_PARAMETERS) {
        let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new("DELETE FROM nodes WHERE id IN (");
        let mut separated = builder.separated(", ");
        for id in chunk {
            separated.push_bind(id.0);
        }
        separated.push_unseparated(")");
        let result = builder.build().execute(&mut *conn).await.or_raise(|| ErrorKind::Database)?;
        deleted += result.rows_affected();
    }
    Ok(deleted)
}

pub(crate) async fn node_ids_for_paths(conn: &mut SqliteConnection, paths: &[NodePath]) -> Result<Vec<NodeId>> {
    let mut ids = Vec::with_capacity(paths.len());
    for path in paths {
        if let Some(record) = select_node(conn, path).await? {
            ids.push(record.id);
        }
    }
    Ok(ids)
}
