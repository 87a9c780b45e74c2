use crate::error::Result;
use crate::path::normalize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Location of a node: a configured root plus a path relative to it.
///
/// Two node paths are equal iff both components match exactly. The relative
/// component is normalized on construction and nowhere else.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodePath {
    root: Arc<Path>,
    relative: PathBuf,
}

impl NodePath {
    /// The root directory itself.
    pub fn root(root: impl Into<Arc<Path>>) -> Self {
        Self { root: root.into(), relative: PathBuf::new() }
    }

    /// Build from a root and a relative path, normalizing the latter.
    pub fn new(root: impl Into<Arc<Path>>, relative: impl AsRef<Path>) -> Result<Self> {
        Ok(Self { root: root.into(), relative: normalize(relative)? })
    }

    pub fn root_path(&self) -> &Path {
        &self.root
    }

    pub fn relative_path(&self) -> &Path {
        &self.relative
    }

    pub fn absolute_path(&self) -> PathBuf {
        match self.is_root() {
            true => self.root.to_path_buf(),
            false => self.root.join(&self.relative),
        }
    }

    /// Last component; the root's own directory name for the root.
    pub fn file_name(&self) -> Option<&str> {
        match self.is_root() {
            true => self.root.file_name()?.to_str(),
            false => self.relative.file_name()?.to_str(),
        }
    }

    pub fn extension(&self) -> Option<&str> {
        match self.is_root() {
            true => None,
            false => self.relative.extension()?.to_str(),
        }
    }

    pub fn parent(&self) -> Option<NodePath> {
        if self.is_root() {
            return None;
        }
        let relative = self.relative.parent().map(Path::to_path_buf).unwrap_or_default();
        Some(Self { root: Arc::clone(&self.root), relative })
    }

    pub fn is_root(&self) -> bool {
        self.relative.as_os_str().is_empty()
    }

    pub fn is_root_child(&self) -> bool {
        self.relative.components().count() == 1
    }

    /// The root child this node lives under (itself, for a root child).
    pub fn root_child(&self) -> Option<NodePath> {
        let first = self.relative.components().next()?;
        Some(Self { root: Arc::clone(&self.root), relative: PathBuf::from(first.as_os_str()) })
    }

    /// Child of this node. `name` must be a single normal component.
    pub fn join(&self, name: impl AsRef<Path>) -> Result<NodePath> {
        Self::new(Arc::clone(&self.root), self.relative.join(name))
    }

    /// Relative path as UTF-8, the form persisted in the database.
    pub fn relative_str(&self) -> Option<&str> {
        self.relative.to_str()
    }
}

impl fmt::Display for NodePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.absolute_path().display())
    }
}
