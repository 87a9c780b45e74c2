//! Path-keyed cache of folder snapshots.

use crate::error::{ErrorKind, Result};
use crate::events::{CacheSubscription, EventSinks, diff};
use crate::segmented::{EvictionError, SegmentedCache};
use folio_config::FolderCacheConfig;
use folio_storage::{FactoryHandle, FileNode, FolderSnapshot, Node, NodePath};
use futures::FutureExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

/// One cached folder.
///
/// The snapshot is swapped wholesale on refresh; readers holding an older
/// `Arc<FolderSnapshot>` keep a consistent view.
#[derive(Debug)]
pub struct CachedFolder {
    snapshot: RwLock<Arc<FolderSnapshot>>,
    sinks: Mutex<Option<EventSinks>>,
}

impl CachedFolder {
    fn new(snapshot: FolderSnapshot, sinks: EventSinks) -> Self {
        Self { snapshot: RwLock::new(Arc::new(snapshot)), sinks: Mutex::new(Some(sinks)) }
    }

    pub fn snapshot(&self) -> Arc<FolderSnapshot> {
        Arc::clone(&self.snapshot.read().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn path(&self) -> NodePath {
        self.snapshot().node.path.clone()
    }

    /// Whether the folder has left the cache and can no longer emit events.
    pub fn is_disposed(&self) -> bool {
        self.sinks.lock().unwrap_or_else(PoisonError::into_inner).is_none()
    }

    /// Replace the snapshot and emit the difference. Returns the number of
    /// changes found.
    fn apply(&self, fresh: FolderSnapshot) -> usize {
        let fresh = Arc::new(fresh);
        let old = {
            let mut guard = self.snapshot.write().unwrap_or_else(PoisonError::into_inner);
            std::mem::replace(&mut *guard, Arc::clone(&fresh))
        };
        let changes = diff(&old, &fresh);
        let count = changes.len();
        if let Some(sinks) = &*self.sinks.lock().unwrap_or_else(PoisonError::into_inner) {
            for change in changes {
                sinks.emit(change);
            }
        }
        count
    }

    /// Detach from the event streams.
    fn dispose(&self) {
        self.sinks.lock().unwrap_or_else(PoisonError::into_inner).take();
    }
}

/// Bounded cache of folder snapshots shared by request handling and the
/// background pipelines.
///
/// Keys are absolute paths, normalized through the root set so that
/// `/music/a/../b` and `/music/b` share an entry.
pub struct FolderCacheStore {
    factory: FactoryHandle,
    cache: SegmentedCache<PathBuf, Arc<CachedFolder>, ErrorKind>,
    sinks: EventSinks,
}

impl FolderCacheStore {
    pub fn new(factory: FactoryHandle, config: &FolderCacheConfig) -> Self {
        let cache = SegmentedCache::new(config.max_directories)
            .with_compaction_batch(config.compaction_batch())
            .with_admission(|folder: &Arc<CachedFolder>| folder.snapshot().exists())
            .with_eviction_callback(|path: PathBuf, folder: Arc<CachedFolder>| {
                async move {
                    folder.dispose();
                    tracing::trace!(path = %path.display(), "Evicted folder from cache");
                    Ok::<(), EvictionError>(())
                }
                .boxed()
            });
        Self { factory, cache, sinks: EventSinks::new() }
    }

    pub fn factory(&self) -> &FactoryHandle {
        &self.factory
    }

    pub fn subscribe(&self) -> CacheSubscription {
        self.sinks.subscribe()
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    fn resolve(&self, absolute: &Path) -> Result<NodePath> {
        self.factory.roots().resolve(absolute).map_err(|err| exn::Exn::from(ErrorKind::from_storage(&err, absolute)))
    }

    /// The cached folder at `absolute`, building it on first access.
    ///
    /// Concurrent callers for the same folder share one build. A folder that
    /// does not exist is returned (with `exists == false`) but not kept.
    pub async fn get_or_add(&self, absolute: &Path) -> Result<Arc<CachedFolder>> {
        let key = self.resolve(absolute)?.absolute_path();
        let factory = Arc::clone(&self.factory);
        let sinks = self.sinks.clone();
        let path = key.clone();
        let folder = self
            .cache
            .get_or_add(key.clone(), move || async move {
                let snapshot = factory.create_folder_snapshot(&path).await.map_err(|err| {
                    tracing::debug!(path = %path.display(), error = ?err, "Failed to build folder snapshot");
                    ErrorKind::from_storage(&err, &path)
                })?;
                Ok(Arc::new(CachedFolder::new(snapshot, sinks)))
            })
            .await
            .map_err(exn::Exn::from)?;
        if !folder.snapshot().exists() {
            folder.dispose();
        }
        Ok(folder)
    }

    /// The cached folder, if any, without counting as an access.
    pub fn peek(&self, absolute: &Path) -> Option<Arc<CachedFolder>> {
        let key = self.resolve(absolute).ok()?.absolute_path();
        self.cache.peek(&key)
    }

    /// Drop the cached folder so that the next access rebuilds it.
    pub fn invalidate(&self, absolute: &Path) -> bool {
        match self.resolve(absolute) {
            Ok(path) => self.evict(&path.absolute_path()),
            Err(_) => false,
        }
    }

    fn evict(&self, key: &PathBuf) -> bool {
        match self.cache.remove(key) {
            Some(folder) => {
                folder.dispose();
                true
            },
            None => false,
        }
    }

    /// Re-read a folder from disk.
    ///
    /// A folder that is cached has its snapshot replaced and the differences
    /// emitted as events; a folder that has disappeared also leaves the
    /// cache. Folders that are not cached are read but not added, so a
    /// background scan over the whole tree does not churn the cache.
    pub async fn refresh(&self, absolute: &Path) -> Result<Arc<FolderSnapshot>> {
        let path = self.resolve(absolute)?;
        let key = path.absolute_path();
        let fresh = self
            .factory
            .create_folder_snapshot(&key)
            .await
            .map_err(|err| exn::Exn::from(ErrorKind::from_storage(&err, &key)))?;
        let Some(folder) = self.cache.peek(&key) else {
            return Ok(Arc::new(fresh));
        };
        let exists = fresh.exists();
        let changes = folder.apply(fresh);
        if changes > 0 {
            tracing::debug!(path = %key.display(), changes, "Refreshed cached folder");
        }
        // Only the folder refreshed here; a rebuilt entry may have replaced it.
        if !exists && self.cache.remove_if(&key, |cached| Arc::ptr_eq(cached, &folder)).is_some() {
            folder.dispose();
        }
        Ok(folder.snapshot())
    }

    /// Look up a file through its (cached) parent folder.
    ///
    /// If the cached child list does not know the file, the filesystem is
    /// probed directly: the cache may simply be behind.
    pub async fn get_file(&self, absolute: &Path) -> Result<FileNode> {
        let not_found = || exn::Exn::from(ErrorKind::NotFound(absolute.to_path_buf()));
        let (Some(parent), Some(name)) = (absolute.parent(), absolute.file_name()) else {
            return Err(not_found());
        };
        let folder = self.get_or_add(parent).await?;
        let snapshot = folder.snapshot();
        if !snapshot.exists() {
            return Err(not_found());
        }
        match snapshot.child(name) {
            Some(Node::File(file)) => return Ok(file.clone()),
            Some(Node::Folder(_)) => exn::bail!(ErrorKind::WrongNodeType(absolute.to_path_buf())),
            None => {},
        }
        tracing::warn!(path = %absolute.display(), "File missing from cached folder; probing filesystem");
        let file = self
            .factory
            .create_file_node(absolute, &snapshot.node)
            .await
            .map_err(|err| exn::Exn::from(ErrorKind::from_storage(&err, absolute)))?;
        match file.exists {
            true => Ok(file),
            false => Err(not_found()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use folio_storage::{LocalNodeFactory, RootSet};
    use std::time::Duration;
    use tokio::sync::broadcast::error::TryRecvError;

    fn store(root: &Path, max_directories: usize) -> FolderCacheStore {
        let factory = LocalNodeFactory::new(RootSet::new([(root.to_path_buf(), false)]).unwrap());
        let config = FolderCacheConfig { max_directories, compaction_batch: None };
        FolderCacheStore::new(Arc::new(factory), &config)
    }

    fn library() -> tempfile::TempDir {
        let temp_dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(temp_dir.path().join("Artist/Album")).unwrap();
        std::fs::write(temp_dir.path().join("Artist/Album/a.mp3"), b"aaaa").unwrap();
        std::fs::write(temp_dir.path().join("Artist/Album/b.mp3"), b"bb").unwrap();
        temp_dir
    }

    #[tokio::test]
    async fn test_second_lookup_is_served_from_cache() {
        let library = library();
        let store = store(library.path(), 16);
        let album = library.path().join("Artist/Album");
        let first = store.get_or_add(&album).await.unwrap();
        let second = store.get_or_add(&library.path().join("Artist/./Album")).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.snapshot().children.len(), 2);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_missing_folder_is_not_kept() {
        let library = library();
        let store = store(library.path(), 16);
        let folder = store.get_or_add(&library.path().join("Nobody")).await.unwrap();
        assert!(!folder.snapshot().exists());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_missing_folder_at_capacity_keeps_cached_folders() {
        let library = library();
        let store = store(library.path(), 2);
        let artist = store.get_or_add(&library.path().join("Artist")).await.unwrap();
        let album = store.get_or_add(&library.path().join("Artist/Album")).await.unwrap();
        let missing = store.get_or_add(&library.path().join("Nobody")).await.unwrap();
        assert!(missing.is_disposed());
        assert_eq!(store.len(), 2);
        assert!(Arc::ptr_eq(&store.peek(&library.path().join("Artist")).unwrap(), &artist));
        assert!(Arc::ptr_eq(&store.peek(&library.path().join("Artist/Album")).unwrap(), &album));
        assert!(!artist.is_disposed());
    }

    #[tokio::test]
    async fn test_missing_folder_lookup_leaves_recreated_entry() {
        let library = library();
        let store = store(library.path(), 16);
        let late = library.path().join("Late");
        assert!(!store.get_or_add(&late).await.unwrap().snapshot().exists());
        std::fs::create_dir(&late).unwrap();
        let created = store.get_or_add(&late).await.unwrap();
        assert!(created.snapshot().exists());
        assert!(Arc::ptr_eq(&store.peek(&late).unwrap(), &created));
        assert!(!created.is_disposed());
    }

    #[tokio::test]
    async fn test_outside_roots_is_not_found() {
        let library = library();
        let elsewhere = tempfile::tempdir().unwrap();
        let err = store(library.path(), 16).get_or_add(elsewhere.path()).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_invalidate_forces_rebuild() {
        let library = library();
        let store = store(library.path(), 16);
        let album = library.path().join("Artist/Album");
        let first = store.get_or_add(&album).await.unwrap();
        assert!(store.invalidate(&album));
        assert!(first.is_disposed());
        let second = store.get_or_add(&album).await.unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn test_refresh_emits_changes() {
        let library = library();
        let store = store(library.path(), 16);
        let album = library.path().join("Artist/Album");
        store.get_or_add(&album).await.unwrap();
        let mut events = store.subscribe();
        std::fs::rename(album.join("a.mp3"), album.join("c.mp3")).unwrap();
        std::fs::remove_file(album.join("b.mp3")).unwrap();
        std::fs::write(album.join("d.mp3"), b"ddddddd").unwrap();
        let snapshot = store.refresh(&album).await.unwrap();
        assert_eq!(snapshot.children.len(), 2);

        let renamed = events.updated.try_recv().unwrap();
        assert!(renamed.is_rename());
        assert_eq!(renamed.old_path.file_name(), Some("a.mp3"));
        assert_eq!(renamed.node.name(), "c.mp3");
        assert_eq!(events.removed.try_recv().unwrap().node.name(), "b.mp3");
        assert_eq!(events.added.try_recv().unwrap().node.name(), "d.mp3");
        assert!(matches!(events.added.try_recv(), Err(TryRecvError::Empty)));
    }

    #[tokio::test]
    async fn test_refresh_of_uncached_folder_does_not_populate() {
        let library = library();
        let store = store(library.path(), 16);
        let snapshot = store.refresh(&library.path().join("Artist")).await.unwrap();
        assert_eq!(snapshot.children.len(), 1);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_refresh_of_vanished_folder_evicts() {
        let library = library();
        let store = store(library.path(), 16);
        let album = library.path().join("Artist/Album");
        let folder = store.get_or_add(&album).await.unwrap();
        let mut events = store.subscribe();
        std::fs::remove_dir_all(&album).unwrap();
        let snapshot = store.refresh(&album).await.unwrap();
        assert!(!snapshot.exists());
        assert!(store.is_empty());
        assert!(folder.is_disposed());
        // Both children were reported gone before the folder left the cache.
        assert!(events.removed.try_recv().is_ok());
        assert!(events.removed.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_get_file_probes_when_cache_is_behind() {
        let library = library();
        let store = store(library.path(), 16);
        let album = library.path().join("Artist/Album");
        assert_eq!(store.get_file(&album.join("a.mp3")).await.unwrap().size, 4);
        std::fs::write(album.join("late.mp3"), b"late").unwrap();
        let late = store.get_file(&album.join("late.mp3")).await.unwrap();
        assert!(late.exists);
        let err = store.get_file(&album.join("never.mp3")).await.unwrap_err();
        assert!(err.is_not_found());
        let err = store.get_file(&library.path().join("Artist/Album")).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::WrongNodeType(_)));
    }

    #[tokio::test]
    async fn test_capacity_pressure_disposes_evicted_folders() {
        let library = library();
        let store = store(library.path(), 1);
        let artist = store.get_or_add(&library.path().join("Artist")).await.unwrap();
        store.get_or_add(&library.path().join("Artist/Album")).await.unwrap();
        assert_eq!(store.len(), 1);
        tokio::time::timeout(Duration::from_secs(5), async {
            while !artist.is_disposed() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
    }
}
