use crate::error::{Error, ErrorKind};
use crate::models::RootId;
use derive_more::Display;
use exn::ResultExt;
use folio_storage::{FolderHeader, Node, NodePath, ticks};
use std::path::PathBuf;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Display)]
pub struct NodeId(pub i64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum NodeKind {
    #[display("file")]
    File,
    #[display("folder")]
    Folder,
}
impl FromStr for NodeKind {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "file" => Ok(Self::File),
            "folder" => Ok(Self::Folder),
            _ => exn::bail!(ErrorKind::InvalidData("node kind")),
        }
    }
}
impl From<&Node> for NodeKind {
    fn from(node: &Node) -> Self {
        match node {
            Node::File(_) => Self::File,
            Node::Folder(_) => Self::Folder,
        }
    }
}

/// The mutable columns of a node, as last observed on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeState {
    pub exists: bool,
    pub size: u64,
    pub modified_ticks: i64,
    pub created_ticks: Option<i64>,
}
impl From<&Node> for NodeState {
    fn from(node: &Node) -> Self {
        Self {
            exists: node.exists(),
            size: node.size(),
            modified_ticks: ticks(node.modified()),
            created_ticks: node.created().map(ticks),
        }
    }
}

/// A persisted file or folder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeRecord {
    pub id: NodeId,
    pub root_id: RootId,
    /// `None` for root children, which hang off the root record instead.
    pub parent_id: Option<NodeId>,
    pub path: NodePath,
    pub kind: NodeKind,
    /// Folders only. `None` until the folder has been reconciled once.
    pub hash: Option<String>,
    pub state: NodeState,
}

impl NodeRecord {
    pub fn is_folder(&self) -> bool {
        self.kind == NodeKind::Folder
    }

    pub fn name(&self) -> &str {
        self.path.file_name().unwrap_or_default()
    }

    /// Persisted header, if this is a folder that has been hashed.
    pub fn header(&self) -> Option<FolderHeader> {
        match (self.kind, &self.hash) {
            (NodeKind::Folder, Some(hash)) => Some(FolderHeader::new(self.path.clone(), hash.clone())),
            _ => None,
        }
    }
}

/// A node about to be inserted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewNode {
    pub root_id: RootId,
    pub parent_id: Option<NodeId>,
    pub path: NodePath,
    pub kind: NodeKind,
    pub state: NodeState,
}

impl NewNode {
    pub fn from_node(root_id: RootId, parent_id: Option<NodeId>, node: &Node) -> Self {
        Self { root_id, parent_id, path: node.path().clone(), kind: NodeKind::from(node), state: NodeState::from(node) }
    }

    pub(crate) fn into_record(self, id: NodeId) -> NodeRecord {
        NodeRecord {
            id,
            root_id: self.root_id,
            parent_id: self.parent_id,
            path: self.path,
            kind: self.kind,
            hash: None,
            state: self.state,
        }
    }
}

#[derive(sqlx::FromRow)]
pub(crate) struct NodeRow {
    id: i64,
    root_id: i64,
    parent_id: Option<i64>,
    relative_path: String,
    kind: String,
    hash: Option<String>,
    exists: bool,
    size: i64,
    modified_ticks: i64,
    creation_time_utc: Option<i64>,
    root_path: String,
}
impl TryFrom<NodeRow> for NodeRecord {
    type Error = Error;
    fn try_from(row: NodeRow) -> Result<Self, Self::Error> {
        let path = NodePath::new(PathBuf::from(row.root_path), row.relative_path)
            .or_raise(|| ErrorKind::InvalidData("node path"))?;
        Ok(Self {
            id: NodeId(row.id),
            root_id: RootId(row.root_id),
            parent_id: row.parent_id.map(NodeId),
            path,
            kind: row.kind.parse()?,
            hash: row.hash,
            state: NodeState {
                exists: row.exists,
                size: u64::try_from(row.size).or_raise(|| ErrorKind::InvalidData("node size"))?,
                modified_ticks: row.modified_ticks,
                created_ticks: row.creation_time_utc,
            },
        })
    }
}
