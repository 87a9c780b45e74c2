//! Filesystem model shared by the folder cache and the synchronizer.
//!
//! - [`NodePath`] locates a node as `(root, relative path)`; [`RootSet`]
//!   resolves absolute paths onto the configured roots.
//! - [`NodeFactory`] builds [`FileNode`]s, [`FolderNode`]s and
//!   [`FolderSnapshot`]s; [`LocalNodeFactory`] does so from the local disk.
//! - [`HashBuilder`] fingerprints a folder's immediate children and
//!   [`FolderDiff`] decides whether a folder needs reconciling.

pub mod error;
mod factory;
mod hash;
mod header;
mod node;
mod node_path;
mod path;
mod roots;

pub use crate::factory::{FactoryHandle, LocalNodeFactory, NodeFactory};
pub use crate::hash::{HashBuilder, HashEntry, ticks};
pub use crate::header::{FolderDiff, FolderHeader};
pub use crate::node::{FileNode, FolderNode, FolderSnapshot, Node, SortMode};
pub use crate::node_path::NodePath;
pub use crate::path::normalize as normalize_relative;
pub use crate::roots::{Root, RootSet};
