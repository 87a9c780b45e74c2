//! Building nodes from the filesystem.
//!
//! The folder cache never touches the filesystem itself; it goes through a
//! [`NodeFactory`]. [`LocalNodeFactory`] is the real implementation, reading
//! metadata via `tokio::fs`.

use crate::error::{ErrorKind, Result};
use crate::node::{FileNode, FolderNode, FolderSnapshot, Node};
use crate::node_path::NodePath;
use crate::roots::RootSet;
use async_stream::stream;
use async_trait::async_trait;
use futures::{Stream, TryStreamExt};
use std::fs::Metadata;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use time::OffsetDateTime;
use tokio::fs;

type NodeStream<'a> = Pin<Box<dyn Stream<Item = Result<Node>> + Send + 'a>>;

pub type FactoryHandle = Arc<dyn NodeFactory>;

#[async_trait]
pub trait NodeFactory: Send + Sync {
    fn roots(&self) -> &RootSet;

    /// Build the node for a folder.
    ///
    /// Returns [`OutsideRoots`](ErrorKind::OutsideRoots) if the path cannot
    /// be resolved. A resolvable folder that is not on disk is returned with
    /// `exists == false` rather than as an error.
    async fn create_folder_node(&self, absolute: &Path) -> Result<FolderNode>;

    /// Build the node for a file inside `parent`. Missing files are returned
    /// with `exists == false`.
    async fn create_file_node(&self, absolute: &Path, parent: &FolderNode) -> Result<FileNode>;

    /// Stream the immediate children of a folder. A folder that vanished
    /// yields nothing.
    fn children<'a>(&'a self, folder: &'a FolderNode) -> NodeStream<'a>;

    async fn list_children(&self, folder: &FolderNode) -> Result<Vec<Node>> {
        self.children(folder).try_collect().await
    }

    /// Folder node plus its children.
    async fn create_folder_snapshot(&self, absolute: &Path) -> Result<FolderSnapshot> {
        let node = self.create_folder_node(absolute).await?;
        let children = match node.exists {
            true => self.list_children(&node).await?,
            false => Vec::new(),
        };
        Ok(FolderSnapshot::new(node, children))
    }
}

enum ChildEntry {
    Node(Node),
    Skip,
}

/// Node factory over the local filesystem.
#[derive(Debug, Clone)]
pub struct LocalNodeFactory {
    roots: RootSet,
}

impl LocalNodeFactory {
    pub fn new(roots: RootSet) -> Self {
        Self { roots }
    }

    fn created(metadata: &Metadata) -> Option<OffsetDateTime> {
        // Not every filesystem records birth time.
        metadata.created().ok().map(OffsetDateTime::from)
    }

    fn modified(metadata: &Metadata, path: &Path) -> Result<OffsetDateTime> {
        let modified = metadata.modified().map_err(|e| ErrorKind::io(e, path))?;
        Ok(OffsetDateTime::from(modified))
    }

    fn folder_from(path: NodePath, metadata: &Metadata) -> Result<FolderNode> {
        let absolute = path.absolute_path();
        Ok(FolderNode {
            modified: Self::modified(metadata, &absolute)?,
            created: Self::created(metadata),
            exists: true,
            path,
        })
    }

    fn file_from(path: NodePath, metadata: &Metadata) -> Result<FileNode> {
        let absolute = path.absolute_path();
        Ok(FileNode {
            size: metadata.len(),
            modified: Self::modified(metadata, &absolute)?,
            created: Self::created(metadata),
            exists: true,
            path,
        })
    }

    async fn child_entry(parent: &FolderNode, absolute: PathBuf) -> Result<ChildEntry> {
        // `fs::metadata` follows symlinks; a dangling link surfaces as NotFound.
        let metadata = match fs::metadata(&absolute).await {
            Ok(metadata) => metadata,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                tracing::trace!(path = %absolute.display(), "Skipping dangling entry");
                return Ok(ChildEntry::Skip);
            },
            Err(err) => exn::bail!(ErrorKind::io(err, absolute)),
        };
        let Some(name) = absolute.file_name() else {
            return Ok(ChildEntry::Skip);
        };
        let path = parent.path.join(name)?;
        if metadata.is_dir() {
            return Ok(ChildEntry::Node(Node::Folder(Self::folder_from(path, &metadata)?)));
        }
        if metadata.is_file() {
            return Ok(ChildEntry::Node(Node::File(Self::file_from(path, &metadata)?)));
        }
        tracing::trace!(path = %absolute.display(), "Skipping special file");
        Ok(ChildEntry::Skip)
    }
}

#[async_trait]
impl NodeFactory for LocalNodeFactory {
    fn roots(&self) -> &RootSet {
        &self.roots
    }

    async fn create_folder_node(&self, absolute: &Path) -> Result<FolderNode> {
        let path = self.roots.resolve(absolute)?;
        match fs::metadata(absolute).await {
            Ok(metadata) if metadata.is_dir() => Self::folder_from(path, &metadata),
            Ok(_) => exn::bail!(ErrorKind::WrongNodeType(absolute.to_path_buf())),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(FolderNode::missing(path)),
            Err(err) => exn::bail!(ErrorKind::io(err, absolute)),
        }
    }

    async fn create_file_node(&self, absolute: &Path, parent: &FolderNode) -> Result<FileNode> {
        let Some(name) = absolute.file_name() else {
            exn::bail!(ErrorKind::InvalidPath(absolute.to_path_buf()));
        };
        if absolute.parent() != Some(parent.path.absolute_path().as_path()) {
            exn::bail!(ErrorKind::InvalidPath(absolute.to_path_buf()));
        }
        let path = parent.path.join(name)?;
        match fs::metadata(absolute).await {
            Ok(metadata) if metadata.is_file() => Self::file_from(path, &metadata),
            Ok(_) => exn::bail!(ErrorKind::WrongNodeType(absolute.to_path_buf())),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(FileNode {
                path,
                size: 0,
                modified: OffsetDateTime::UNIX_EPOCH,
                created: None,
                exists: false,
            }),
            Err(err) => exn::bail!(ErrorKind::io(err, absolute)),
        }
    }

    fn children<'a>(&'a self, folder: &'a FolderNode) -> NodeStream<'a> {
        let absolute = folder.path.absolute_path();
        Box::pin(stream! {
            let mut entries = match fs::read_dir(&absolute).await {
                Ok(entries) => entries,
                // Vanished between building the node and listing it.
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => return,
                Err(err) => {
                    yield Err(exn::Exn::from(ErrorKind::io(err, absolute)));
                    return;
                }
            };
            loop {
                let entry = match entries.next_entry().await {
                    Ok(Some(entry)) => entry,
                    Ok(None) => break,
                    Err(err) => {
                        yield Err(exn::Exn::from(ErrorKind::io(err, &absolute)));
                        break;
                    }
                };
                match Self::child_entry(folder, entry.path()).await {
                    Ok(ChildEntry::Node(node)) => yield Ok(node),
                    Ok(ChildEntry::Skip) => {},
                    Err(err) => yield Err(err),
                }
            }
        })
    }
}
