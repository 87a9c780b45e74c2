//! Resolution of absolute paths onto configured roots.

use crate::error::{ErrorKind, Result};
use crate::node_path::NodePath;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Root {
    pub path: Arc<Path>,
    pub hidden: bool,
}

/// The fixed set of configured roots, plus the optional cache directory.
///
/// The cache directory resolves like any other root so the folder cache can
/// serve it, but it is never reported by [`roots`](Self::roots) and therefore
/// never watched or persisted.
#[derive(Debug, Clone, Default)]
pub struct RootSet {
    roots: Vec<Root>,
    cache_dir: Option<Arc<Path>>,
}

impl RootSet {
    pub fn new(roots: impl IntoIterator<Item = (PathBuf, bool)>) -> Result<Self> {
        let mut resolved = Vec::new();
        for (path, hidden) in roots {
            if !path.is_absolute() {
                exn::bail!(ErrorKind::InvalidPath(path));
            }
            resolved.push(Root { path: Arc::from(path), hidden });
        }
        Ok(Self { roots: resolved, cache_dir: None })
    }

    pub fn with_cache_dir(mut self, cache_dir: impl Into<PathBuf>) -> Result<Self> {
        let cache_dir = cache_dir.into();
        if !cache_dir.is_absolute() {
            exn::bail!(ErrorKind::InvalidPath(cache_dir));
        }
        self.cache_dir = Some(Arc::from(cache_dir));
        Ok(self)
    }

    pub fn roots(&self) -> &[Root] {
        &self.roots
    }

    pub fn get(&self, root_path: &Path) -> Option<&Root> {
        self.roots.iter().find(|r| &*r.path == root_path)
    }

    pub fn is_hidden(&self, path: &NodePath) -> bool {
        self.get(path.root_path()).is_some_and(|r| r.hidden)
    }

    /// Resolve an absolute path to the node path of the root containing it.
    ///
    /// The most specific root wins, so a cache directory nested inside a root
    /// still resolves against the cache directory.
    pub fn resolve(&self, absolute: impl AsRef<Path>) -> Result<NodePath> {
        let absolute = absolute.as_ref();
        if !absolute.is_absolute() {
            exn::bail!(ErrorKind::InvalidPath(absolute.to_path_buf()));
        }
        let candidate = self
            .roots
            .iter()
            .map(|r| &r.path)
            .chain(self.cache_dir.iter())
            .filter(|root| absolute.starts_with(root))
            .max_by_key(|root| root.components().count());
        match candidate {
            Some(root) => {
                // `starts_with` is component-based, so stripping cannot fail.
                let relative = absolute.strip_prefix(root).unwrap_or(Path::new(""));
                NodePath::new(Arc::clone(root), relative)
            },
            None => exn::bail!(ErrorKind::OutsideRoots(absolute.to_path_buf())),
        }
    }
}
