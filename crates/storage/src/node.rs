//! File and folder nodes, and folder snapshots.

use crate::hash::HashBuilder;
use crate::header::FolderHeader;
use crate::node_path::NodePath;
use std::borrow::Cow;
use std::cmp::Ordering;
use std::ffi::OsStr;
use time::OffsetDateTime;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileNode {
    pub path: NodePath,
    pub size: u64,
    pub modified: OffsetDateTime,
    pub created: Option<OffsetDateTime>,
    pub exists: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FolderNode {
    pub path: NodePath,
    pub modified: OffsetDateTime,
    pub created: Option<OffsetDateTime>,
    pub exists: bool,
}

impl FolderNode {
    /// Placeholder for a folder that is not on disk.
    pub fn missing(path: NodePath) -> Self {
        Self { path, modified: OffsetDateTime::UNIX_EPOCH, created: None, exists: false }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    File(FileNode),
    Folder(FolderNode),
}

impl Node {
    pub fn path(&self) -> &NodePath {
        match self {
            Node::File(file) => &file.path,
            Node::Folder(folder) => &folder.path,
        }
    }

    /// Display name. Names that are not UTF-8 are converted lossily, so
    /// never use this to tell children apart.
    pub fn name(&self) -> Cow<'_, str> {
        self.os_name().to_string_lossy()
    }

    pub fn os_name(&self) -> &OsStr {
        let path = self.path();
        path.relative_path().file_name().or_else(|| path.root_path().file_name()).unwrap_or_default()
    }

    pub fn is_folder(&self) -> bool {
        matches!(self, Node::Folder(_))
    }

    pub fn modified(&self) -> OffsetDateTime {
        match self {
            Node::File(file) => file.modified,
            Node::Folder(folder) => folder.modified,
        }
    }

    pub fn created(&self) -> Option<OffsetDateTime> {
        match self {
            Node::File(file) => file.created,
            Node::Folder(folder) => folder.created,
        }
    }

    /// Folders report zero.
    pub fn size(&self) -> u64 {
        match self {
            Node::File(file) => file.size,
            Node::Folder(_) => 0,
        }
    }

    pub fn exists(&self) -> bool {
        match self {
            Node::File(file) => file.exists,
            Node::Folder(folder) => folder.exists,
        }
    }

    /// Whether the parent of this node is a configured root.
    pub fn belongs_to_root(&self) -> bool {
        self.path().parent().is_some_and(|p| p.is_root())
    }

    /// Whether the parent of this node is a root child.
    pub fn belongs_to_root_child(&self) -> bool {
        self.path().parent().is_some_and(|p| p.is_root_child())
    }

    pub fn as_file(&self) -> Option<&FileNode> {
        match self {
            Node::File(file) => Some(file),
            Node::Folder(_) => None,
        }
    }
}

/// Presentation order of a folder's children. Folders always come first.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SortMode {
    #[default]
    Name,
    NameDescending,
    Modified,
    ModifiedDescending,
    Size,
}

impl SortMode {
    pub fn compare(self, a: &Node, b: &Node) -> Ordering {
        let by_kind = b.is_folder().cmp(&a.is_folder());
        let by_name = || {
            let folded = a.name().to_lowercase().cmp(&b.name().to_lowercase());
            folded.then_with(|| a.os_name().cmp(b.os_name()))
        };
        by_kind.then_with(|| match self {
            SortMode::Name => by_name(),
            SortMode::NameDescending => by_name().reverse(),
            SortMode::Modified => a.modified().cmp(&b.modified()).then_with(by_name),
            SortMode::ModifiedDescending => b.modified().cmp(&a.modified()).then_with(by_name),
            SortMode::Size => b.size().cmp(&a.size()).then_with(by_name),
        })
    }
}

/// A folder and its immediate children, as enumerated at one point in time.
///
/// Children are kept in enumeration order; sorting is a read-time concern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FolderSnapshot {
    pub node: FolderNode,
    pub children: Vec<Node>,
}

impl FolderSnapshot {
    pub fn new(node: FolderNode, children: Vec<Node>) -> Self {
        Self { node, children }
    }

    pub fn exists(&self) -> bool {
        self.node.exists
    }

    pub fn sorted(&self, mode: SortMode) -> Vec<&Node> {
        let mut children: Vec<&Node> = self.children.iter().collect();
        children.sort_by(|a, b| mode.compare(a, b));
        children
    }

    /// Position a node would take among this folder's children under `mode`.
    pub fn sort_index(&self, node: &Node, mode: SortMode) -> usize {
        self.children.iter().filter(|c| c.path() != node.path() && mode.compare(c, node) == Ordering::Less).count()
    }

    pub fn child(&self, name: impl AsRef<OsStr>) -> Option<&Node> {
        self.children.iter().find(|c| c.os_name() == name.as_ref())
    }

    pub fn subfolders(&self) -> impl Iterator<Item = &FolderNode> {
        self.children.iter().filter_map(|c| match c {
            Node::Folder(folder) => Some(folder),
            Node::File(_) => None,
        })
    }

    /// Header computed from the current child list.
    pub fn header(&self) -> FolderHeader {
        let mut builder = HashBuilder::new();
        for child in &self.children {
            builder.add_child(&child.path().absolute_path(), child.is_folder(), child.modified());
        }
        FolderHeader::new(self.node.path.clone(), builder.compute_hash())
    }
}
