//! SQLite index of library roots, folders and files.
//!
//! The index mirrors the filesystem below each configured root so that the
//! rest of the application can answer "what changed?" cheaply. It is never the
//! source of truth: deleting the database file only means the next scan
//! rebuilds it.
//!
//! # Layout
//! - **root_directories**: the child hash of each configured root directory.
//! - **roots**: one row per root child (immediate subdirectory of a
//!   configured root). Deleting a root cascades to all nodes beneath it.
//! - **nodes**: every file and folder below a root child, linked to its parent
//!   folder. Folder rows carry the hash of their immediate children, written
//!   last in the unit of work that reconciles the folder.

mod db;
pub mod error;
mod models;
mod queries;
mod repo;
mod unit;

pub use crate::db::Database;
pub use crate::models::{NewNode, NodeId, NodeKind, NodeRecord, NodeState, RootId, RootRecord};
pub use crate::repo::Repository;
pub use crate::unit::UnitOfWork;
