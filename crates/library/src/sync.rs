//! Reconciliation of one folder between the filesystem and the node index.
//!
//! A folder is only written when its hash differs from the one recorded in
//! the index. The hash goes in last, inside the same transaction as the
//! children, so an interrupted reconciliation always leaves the folder dirty.

use crate::error::{ErrorKind, Result};
use crate::pipeline::MetadataQueues;
use exn::{OptionExt, ResultExt};
use folio_asyncutils::WriteLocks;
use folio_cache::FolderCacheStore;
use folio_config::SyncConfig;
use folio_database::{NewNode, NodeId, NodeKind, NodeRecord, NodeState, Repository, RootRecord, UnitOfWork};
use folio_storage::{FolderDiff, FolderHeader, FolderNode, FolderSnapshot, Node, NodePath, RootSet};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Outcome of reconciling one folder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reconciled {
    /// The folder as the filesystem reports it now.
    pub header: FolderHeader,
    pub dirty: bool,
    /// `false` when the folder was clean, or when the write lock timed out.
    pub persisted: bool,
}

/// What a reconciliation changed, reported to the metadata pipelines after commit.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Changes {
    /// Files that were inserted or whose state changed.
    pub updated: Vec<NodeId>,
    /// Files and folders that were deleted.
    pub removed: Vec<NodePath>,
}

impl Changes {
    fn is_empty(&self) -> bool {
        self.updated.is_empty() && self.removed.is_empty()
    }
}

pub struct PersistenceSynchronizer {
    repository: Repository,
    cache: Arc<FolderCacheStore>,
    locks: WriteLocks<PathBuf>,
    batch_size: usize,
    metadata: MetadataQueues,
}

impl PersistenceSynchronizer {
    pub fn new(
        repository: Repository,
        cache: Arc<FolderCacheStore>,
        metadata: MetadataQueues,
        config: &SyncConfig,
    ) -> Self {
        Self {
            repository,
            cache,
            locks: WriteLocks::new(config.write_lock_timeout()),
            batch_size: config.batch_size.max(1),
            metadata,
        }
    }

    fn roots(&self) -> &RootSet {
        self.cache.factory().roots()
    }

    /// Resolve a path below a configured root. The cache directory resolves
    /// too, but is never indexed.
    fn resolve(&self, absolute: &Path) -> Result<NodePath> {
        let path = self.roots().resolve(absolute).or_raise(|| ErrorKind::OutsideRoots(absolute.to_path_buf()))?;
        if self.roots().get(path.root_path()).is_none() {
            exn::bail!(ErrorKind::OutsideRoots(absolute.to_path_buf()));
        }
        Ok(path)
    }

    /// Compare a folder on disk with the index without writing anything.
    ///
    /// The returned snapshot is the one the comparison was made against.
    pub async fn diff(&self, absolute: &Path) -> Result<(FolderDiff, Arc<FolderSnapshot>)> {
        let path = self.resolve(absolute)?;
        let database = self.repository.folder_header(&path).await.or_raise(|| ErrorKind::Database)?;
        let snapshot = self.cache.refresh(absolute).await.or_raise(|| ErrorKind::Cache)?;
        Ok((FolderDiff::new(snapshot.header(), database), snapshot))
    }

    /// Bring the index in line with one folder's immediate children.
    pub async fn reconcile(&self, absolute: &Path, cancel: &CancellationToken) -> Result<Reconciled> {
        let (diff, _) = self.diff(absolute).await?;
        if !diff.is_dirty() {
            tracing::trace!(path = %absolute.display(), "Folder is clean");
            return Ok(Reconciled { header: diff.file_system, dirty: false, persisted: false });
        }

        let key = diff.file_system.path.absolute_path();
        let Some(_guard) = self.locks.acquire(&key).await else {
            tracing::warn!(path = %key.display(), "Timed out waiting for write lock; skipping folder");
            return Ok(Reconciled { header: diff.file_system, dirty: true, persisted: false });
        };

        // Another writer may have reconciled the folder while we waited.
        let (diff, snapshot) = self.diff(absolute).await?;
        let header = diff.file_system.clone();
        if !diff.is_dirty() {
            tracing::trace!(path = %key.display(), "Folder was reconciled while waiting for the write lock");
            return Ok(Reconciled { header, dirty: false, persisted: false });
        }
        if diff.database.is_none() && !snapshot.exists() && !self.is_recorded(&header.path).await? {
            tracing::trace!(path = %key.display(), "Folder is neither on disk nor indexed");
            return Ok(Reconciled { header, dirty: false, persisted: false });
        }

        let mut uow = self.repository.begin().await.or_raise(|| ErrorKind::Database)?;
        let changes = match header.path.is_root() {
            true => {
                let changes = self.reconcile_root(&mut uow, &snapshot, cancel).await?;
                uow.set_root_directory_hash(header.path.root_path(), &header.hash)
                    .await
                    .or_raise(|| ErrorKind::Database)?;
                changes
            },
            false => {
                let (folder_id, changes) = self.reconcile_folder(&mut uow, &snapshot, cancel).await?;
                uow.set_folder_hash(folder_id, &header.hash).await.or_raise(|| ErrorKind::Database)?;
                changes
            },
        };

        let (updated, removed) = (changes.updated.len(), changes.removed.len());
        if !changes.is_empty() {
            let metadata = self.metadata.clone();
            uow.on_saved(move || metadata.publish(changes));
        }
        uow.save_changes().await.or_raise(|| ErrorKind::Database)?;
        tracing::info!(path = %key.display(), hash = %header.hash, updated, removed, "Reconciled folder");
        Ok(Reconciled { header, dirty: true, persisted: true })
    }

    /// Whether the index has any record of a folder, hashed or not.
    async fn is_recorded(&self, path: &NodePath) -> Result<bool> {
        if path.is_root() {
            return Ok(false);
        }
        let node = self.repository.get_node(path).await.or_raise(|| ErrorKind::Database)?;
        Ok(node.is_some())
    }

    /// Match the root records of a configured root against its subfolders.
    async fn reconcile_root(
        &self,
        uow: &mut UnitOfWork,
        snapshot: &FolderSnapshot,
        cancel: &CancellationToken,
    ) -> Result<Changes> {
        let root_path = snapshot.node.path.root_path();
        let hidden = self.roots().get(root_path).is_some_and(|r| r.hidden);
        let mut recorded: HashMap<NodePath, RootRecord> = uow
            .list_roots(root_path)
            .await
            .or_raise(|| ErrorKind::Database)?
            .into_iter()
            .map(|r| (r.path.clone(), r))
            .collect();

        let subfolders: Vec<&FolderNode> = snapshot.subfolders().collect();
        for chunk in subfolders.chunks(self.batch_size) {
            if cancel.is_cancelled() {
                exn::bail!(ErrorKind::Cancelled);
            }
            for folder in chunk {
                recorded.remove(&folder.path);
                let root = uow.ensure_root(&folder.path, hidden).await.or_raise(|| ErrorKind::Database)?;
                self.upsert_folder(uow, &root, None, folder).await?;
            }
        }

        let mut changes = Changes::default();
        for (path, root) in recorded {
            tracing::debug!(path = %path, "Root child vanished");
            uow.delete_root(root.id).await.or_raise(|| ErrorKind::Database)?;
            changes.removed.push(path);
        }
        Ok(changes)
    }

    /// Make sure a folder row exists and reflects `folder`, replacing a file
    /// row of the same name.
    async fn upsert_folder(
        &self,
        uow: &mut UnitOfWork,
        root: &RootRecord,
        parent_id: Option<NodeId>,
        folder: &FolderNode,
    ) -> Result<NodeRecord> {
        let node = Node::Folder(folder.clone());
        let state = NodeState::from(&node);
        let existing = uow.get_node(&folder.path).await.or_raise(|| ErrorKind::Database)?;
        match existing {
            Some(record) if record.is_folder() => {
                if record.state != state {
                    uow.update_node(record.id, &state).await.or_raise(|| ErrorKind::Database)?;
                }
                Ok(NodeRecord { state, ..record })
            },
            existing => {
                if let Some(stale) = existing {
                    uow.delete_nodes(&[stale.id]).await.or_raise(|| ErrorKind::Database)?;
                }
                let inserted = uow
                    .insert_nodes(vec![NewNode::from_node(root.id, parent_id, &node)])
                    .await
                    .or_raise(|| ErrorKind::Database)?;
                inserted.into_iter().next().ok_or_raise(|| ErrorKind::Database)
            },
        }
    }

    /// The row of a folder below a root child, creating it (and any missing
    /// ancestors) if needed.
    async fn ensure_folder(&self, uow: &mut UnitOfWork, folder: &FolderNode) -> Result<NodeRecord> {
        let path = &folder.path;
        let root_child = path.root_child().ok_or_raise(|| ErrorKind::OutsideRoots(path.absolute_path()))?;
        let root = uow.ensure_root(&root_child, self.roots().is_hidden(path)).await.or_raise(|| ErrorKind::Database)?;

        let mut lineage: Vec<NodePath> =
            std::iter::successors(Some(path.clone()), NodePath::parent).take_while(|p| !p.is_root()).collect();
        lineage.reverse();

        let mut parent_id = None;
        let mut current = None;
        for ancestor in lineage {
            let record = match uow.get_node(&ancestor).await.or_raise(|| ErrorKind::Database)? {
                Some(record) if record.is_folder() && &ancestor != path => record,
                _ => {
                    let node = match &ancestor == path {
                        true => folder.clone(),
                        false => self
                            .cache
                            .factory()
                            .create_folder_node(&ancestor.absolute_path())
                            .await
                            .or_raise(|| ErrorKind::Storage)?,
                    };
                    self.upsert_folder(uow, &root, parent_id, &node).await?
                },
            };
            parent_id = Some(record.id);
            current = Some(record);
        }
        current.ok_or_raise(|| ErrorKind::OutsideRoots(path.absolute_path()))
    }

    /// Match a folder's rows against its children on disk, in chunks.
    async fn reconcile_folder(
        &self,
        uow: &mut UnitOfWork,
        snapshot: &FolderSnapshot,
        cancel: &CancellationToken,
    ) -> Result<(NodeId, Changes)> {
        let folder = self.ensure_folder(uow, &snapshot.node).await?;
        let mut recorded: HashMap<NodePath, NodeRecord> = uow
            .children(folder.id)
            .await
            .or_raise(|| ErrorKind::Database)?
            .into_iter()
            .map(|r| (r.path.clone(), r))
            .collect();

        let mut changes = Changes::default();
        for chunk in snapshot.children.chunks(self.batch_size) {
            if cancel.is_cancelled() {
                exn::bail!(ErrorKind::Cancelled);
            }
            let mut inserts = Vec::new();
            for child in chunk {
                let kind = NodeKind::from(child);
                match recorded.remove(child.path()) {
                    Some(record) if record.kind == kind => {
                        let state = NodeState::from(child);
                        if record.state != state {
                            uow.update_node(record.id, &state).await.or_raise(|| ErrorKind::Database)?;
                            if kind == NodeKind::File {
                                changes.updated.push(record.id);
                            }
                        }
                    },
                    Some(record) => {
                        // File replaced by a folder or the other way round.
                        uow.delete_nodes(&[record.id]).await.or_raise(|| ErrorKind::Database)?;
                        changes.removed.push(record.path);
                        inserts.push(NewNode::from_node(folder.root_id, Some(folder.id), child));
                    },
                    None => inserts.push(NewNode::from_node(folder.root_id, Some(folder.id), child)),
                }
            }
            if inserts.is_empty() {
                continue;
            }
            let inserted = uow.insert_nodes(inserts).await.or_raise(|| ErrorKind::Database)?;
            changes.updated.extend(inserted.into_iter().filter(|r| !r.is_folder()).map(|r| r.id));
        }

        if !recorded.is_empty() {
            let ids: Vec<NodeId> = recorded.values().map(|r| r.id).collect();
            let deleted = uow.delete_nodes(&ids).await.or_raise(|| ErrorKind::Database)?;
            tracing::debug!(path = %snapshot.node.path, deleted, "Deleted vanished children");
            changes.removed.extend(recorded.into_keys());
        }
        Ok((folder.id, changes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use folio_asyncutils::{Channel, InFlight};
    use folio_config::FolderCacheConfig;
    use folio_database::Database;
    use folio_storage::LocalNodeFactory;
    use std::fs::File;
    use std::time::{Duration, SystemTime};
    use tempfile::TempDir;

    struct Fixture {
        library: TempDir,
        repository: Repository,
        sync: PersistenceSynchronizer,
        add: Channel<crate::pipeline::MetadataAddRequest>,
        remove: Channel<crate::pipeline::MetadataRemoveRequest>,
    }

    impl Fixture {
        async fn new() -> Self {
            let library = tempfile::tempdir().unwrap();
            let roots = RootSet::new([(library.path().to_path_buf(), false)]).unwrap();
            let cache = Arc::new(FolderCacheStore::new(
                Arc::new(LocalNodeFactory::new(roots)),
                &FolderCacheConfig::default(),
            ));
            let repository = Repository::from(&Database::connect_in_memory().await.unwrap());
            let add = Channel::new(InFlight::new("metadata-add"));
            let remove = Channel::new(InFlight::new("metadata-remove"));
            let metadata = MetadataQueues { add: add.sender(), remove: remove.sender() };
            let config = SyncConfig { batch_size: 1, ..SyncConfig::default() };
            let sync = PersistenceSynchronizer::new(repository.clone(), cache, metadata, &config);
            Self { library, repository, sync, add, remove }
        }

        fn path(&self, relative: &str) -> PathBuf {
            self.library.path().join(relative)
        }

        fn node_path(&self, relative: &str) -> NodePath {
            NodePath::new(self.library.path(), relative).unwrap()
        }

        fn write(&self, relative: &str, seconds: u64) {
            let path = self.path(relative);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            let file = File::create(&path).unwrap();
            file.set_modified(SystemTime::UNIX_EPOCH + Duration::from_secs(seconds)).unwrap();
        }

        async fn reconcile(&self, relative: &str) -> Reconciled {
            self.sync.reconcile(&self.path(relative), &CancellationToken::new()).await.unwrap()
        }

        async fn child_names(&self, relative: &str) -> Vec<String> {
            let folder = self.repository.get_node(&self.node_path(relative)).await.unwrap().unwrap();
            let mut names: Vec<String> =
                self.repository.children(folder.id).await.unwrap().iter().map(|r| r.name().to_string()).collect();
            names.sort();
            names
        }
    }

    #[tokio::test]
    async fn test_touched_file_is_updated_in_place() {
        let fixture = Fixture::new().await;
        fixture.write("Artist/Album/a.mp3", 100);
        fixture.write("Artist/Album/b.mp3", 100);

        let first = fixture.reconcile("Artist/Album").await;
        assert!(first.dirty && first.persisted);
        let before = fixture.repository.get_node(&fixture.node_path("Artist/Album/a.mp3")).await.unwrap().unwrap();

        fixture.write("Artist/Album/a.mp3", 200);
        let second = fixture.reconcile("Artist/Album").await;
        assert!(second.dirty && second.persisted);
        assert_ne!(first.header.hash, second.header.hash);

        let after = fixture.repository.get_node(&fixture.node_path("Artist/Album/a.mp3")).await.unwrap().unwrap();
        assert_eq!(after.id, before.id);
        assert_ne!(after.state.modified_ticks, before.state.modified_ticks);
        assert_eq!(fixture.child_names("Artist/Album").await, vec!["a.mp3", "b.mp3"]);
        // One batch for the two inserts, one for the update.
        assert_eq!(fixture.add.in_flight().count(), 2);
        assert_eq!(fixture.remove.in_flight().count(), 0);
    }

    #[tokio::test]
    async fn test_clean_folder_short_circuits() {
        let fixture = Fixture::new().await;
        fixture.write("Artist/Album/a.mp3", 100);
        let first = fixture.reconcile("Artist/Album").await;
        let second = fixture.reconcile("Artist/Album").await;
        assert!(!second.dirty && !second.persisted);
        assert_eq!(second.header, first.header);
        assert_eq!(fixture.add.in_flight().count(), 1);
    }

    #[tokio::test]
    async fn test_removed_children_are_deleted() {
        let fixture = Fixture::new().await;
        fixture.write("Artist/Album/a.mp3", 100);
        fixture.write("Artist/Album/b.mp3", 100);
        fixture.write("Artist/Album/c.mp3", 100);
        fixture.reconcile("Artist/Album").await;

        std::fs::remove_file(fixture.path("Artist/Album/b.mp3")).unwrap();
        std::fs::remove_file(fixture.path("Artist/Album/c.mp3")).unwrap();
        let reconciled = fixture.reconcile("Artist/Album").await;

        assert_eq!(fixture.child_names("Artist/Album").await, vec!["a.mp3"]);
        let header = fixture.repository.folder_header(&fixture.node_path("Artist/Album")).await.unwrap();
        assert_eq!(header, Some(reconciled.header));
        assert_eq!(fixture.remove.in_flight().count(), 1);
    }

    #[tokio::test]
    async fn test_missing_ancestors_are_created() {
        let fixture = Fixture::new().await;
        fixture.write("Artist/Album/Disc 1/a.mp3", 100);
        fixture.reconcile("Artist/Album/Disc 1").await;

        let album = fixture.repository.get_node(&fixture.node_path("Artist/Album")).await.unwrap().unwrap();
        let disc = fixture.repository.get_node(&fixture.node_path("Artist/Album/Disc 1")).await.unwrap().unwrap();
        assert_eq!(disc.parent_id, Some(album.id));
        assert!(fixture.repository.find_root(&fixture.node_path("Artist")).await.unwrap().is_some());
        // Ancestors are recorded but not yet hashed.
        assert_eq!(fixture.repository.folder_header(&fixture.node_path("Artist/Album")).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_vanished_folder_reconciles_to_empty() {
        let fixture = Fixture::new().await;
        fixture.write("Artist/Album/a.mp3", 100);
        fixture.reconcile("Artist/Album").await;

        std::fs::remove_dir_all(fixture.path("Artist/Album")).unwrap();
        let reconciled = fixture.reconcile("Artist/Album").await;
        assert!(reconciled.persisted);
        assert_eq!(reconciled.header.hash, folio_storage::HashBuilder::new().compute_hash());
        assert!(fixture.child_names("Artist/Album").await.is_empty());
        let album = fixture.repository.get_node(&fixture.node_path("Artist/Album")).await.unwrap().unwrap();
        assert!(!album.state.exists);
    }

    #[tokio::test]
    async fn test_unknown_missing_folder_writes_nothing() {
        let fixture = Fixture::new().await;
        std::fs::create_dir_all(fixture.path("Artist")).unwrap();
        fixture.reconcile("").await;

        let ghost = fixture.reconcile("Ghost").await;
        assert!(!ghost.dirty && !ghost.persisted);
        let deep = fixture.reconcile("Nobody/Album").await;
        assert!(!deep.persisted);

        assert!(!fixture.reconcile("").await.dirty);
        let roots = fixture.repository.list_roots(fixture.library.path()).await.unwrap();
        assert_eq!(roots.iter().map(|r| r.path.clone()).collect::<Vec<_>>(), vec![fixture.node_path("Artist")]);
        assert!(fixture.repository.get_node(&fixture.node_path("Ghost")).await.unwrap().is_none());
        assert!(fixture.repository.get_node(&fixture.node_path("Nobody")).await.unwrap().is_none());
        assert_eq!(fixture.add.in_flight().count(), 0);
        assert_eq!(fixture.remove.in_flight().count(), 0);
    }

    #[tokio::test]
    async fn test_waiting_writer_sees_the_folder_already_reconciled() {
        let fixture = Fixture::new().await;
        fixture.write("Artist/Album/a.mp3", 100);
        let album = fixture.path("Artist/Album");
        let cancel = CancellationToken::new();
        let (first, second) =
            tokio::join!(fixture.sync.reconcile(&album, &cancel), fixture.sync.reconcile(&album, &cancel));
        let (first, second) = (first.unwrap(), second.unwrap());
        assert_eq!(first.header, second.header);
        assert_eq!([first.persisted, second.persisted].iter().filter(|p| **p).count(), 1);
        assert_eq!(fixture.child_names("Artist/Album").await, vec!["a.mp3"]);
        assert_eq!(fixture.add.in_flight().count(), 1);
    }

    #[tokio::test]
    async fn test_root_tracks_root_children() {
        let fixture = Fixture::new().await;
        std::fs::create_dir_all(fixture.path("Artist")).unwrap();
        std::fs::create_dir_all(fixture.path("Other")).unwrap();
        fixture.write("loose.mp3", 100);
        fixture.reconcile("").await;
        assert_eq!(fixture.repository.list_roots(fixture.library.path()).await.unwrap().len(), 2);
        assert!(!fixture.reconcile("").await.dirty);

        std::fs::remove_dir(fixture.path("Other")).unwrap();
        let reconciled = fixture.reconcile("").await;
        assert!(reconciled.persisted);
        let roots = fixture.repository.list_roots(fixture.library.path()).await.unwrap();
        assert_eq!(roots.iter().map(|r| r.path.clone()).collect::<Vec<_>>(), vec![fixture.node_path("Artist")]);
        assert!(fixture.repository.get_node(&fixture.node_path("Other")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_kind_change_replaces_row() {
        let fixture = Fixture::new().await;
        fixture.write("Artist/x", 100);
        fixture.reconcile("Artist").await;
        std::fs::remove_file(fixture.path("Artist/x")).unwrap();
        std::fs::create_dir(fixture.path("Artist/x")).unwrap();
        fixture.reconcile("Artist").await;
        let record = fixture.repository.get_node(&fixture.node_path("Artist/x")).await.unwrap().unwrap();
        assert!(record.is_folder());
    }

    #[tokio::test]
    async fn test_cancelled_reconcile_writes_nothing() {
        let fixture = Fixture::new().await;
        fixture.write("Artist/Album/a.mp3", 100);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = fixture.sync.reconcile(&fixture.path("Artist/Album"), &cancel).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::Cancelled));
        assert!(fixture.repository.get_node(&fixture.node_path("Artist/Album")).await.unwrap().is_none());
        assert_eq!(fixture.add.in_flight().count(), 0);
    }

    #[tokio::test]
    async fn test_paths_outside_roots_are_rejected() {
        let fixture = Fixture::new().await;
        let elsewhere = tempfile::tempdir().unwrap();
        let err = fixture.sync.reconcile(elsewhere.path(), &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::OutsideRoots(_)));
    }
}
