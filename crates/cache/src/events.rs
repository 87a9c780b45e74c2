//! Change events emitted when a cached folder is refreshed.

use folio_storage::{FolderSnapshot, Node, NodePath};
use std::collections::{BTreeMap, HashMap};
use std::ffi::OsStr;
use time::OffsetDateTime;
use tokio::sync::broadcast;

const EVENT_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemAdded {
    pub parent: NodePath,
    pub node: Node,
}

/// A child changed in place, or was renamed (`old_path != node.path()`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemUpdated {
    pub parent: NodePath,
    pub node: Node,
    pub old_path: NodePath,
}

impl ItemUpdated {
    pub fn is_rename(&self) -> bool {
        &self.old_path != self.node.path()
    }
}

/// Carries the node as it was last seen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemRemoved {
    pub parent: NodePath,
    pub node: Node,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Change {
    Added(ItemAdded),
    Updated(ItemUpdated),
    Removed(ItemRemoved),
}

/// Receivers for the three event streams.
#[derive(Debug)]
pub struct CacheSubscription {
    pub added: broadcast::Receiver<ItemAdded>,
    pub updated: broadcast::Receiver<ItemUpdated>,
    pub removed: broadcast::Receiver<ItemRemoved>,
}

/// Senders for the three event streams. Every cached folder holds a clone
/// until it is disposed.
#[derive(Debug, Clone)]
pub(crate) struct EventSinks {
    added: broadcast::Sender<ItemAdded>,
    updated: broadcast::Sender<ItemUpdated>,
    removed: broadcast::Sender<ItemRemoved>,
}

impl EventSinks {
    pub(crate) fn new() -> Self {
        Self {
            added: broadcast::channel(EVENT_CAPACITY).0,
            updated: broadcast::channel(EVENT_CAPACITY).0,
            removed: broadcast::channel(EVENT_CAPACITY).0,
        }
    }

    pub(crate) fn subscribe(&self) -> CacheSubscription {
        CacheSubscription {
            added: self.added.subscribe(),
            updated: self.updated.subscribe(),
            removed: self.removed.subscribe(),
        }
    }

    pub(crate) fn emit(&self, change: Change) {
        // Sending only fails when nobody is subscribed.
        match change {
            Change::Added(event) => {
                _ = self.added.send(event);
            },
            Change::Updated(event) => {
                _ = self.updated.send(event);
            },
            Change::Removed(event) => {
                _ = self.removed.send(event);
            },
        }
    }
}

/// What identifies a renamed child: same kind, size and last write time.
type Signature = (bool, u64, OffsetDateTime);

fn signature(node: &Node) -> Signature {
    (node.is_folder(), node.size(), node.modified())
}

fn same_state(a: &Node, b: &Node) -> bool {
    a.exists() == b.exists() && signature(a) == signature(b) && a.created() == b.created()
}

/// Compare two snapshots of the same folder.
///
/// Children are matched by their raw file name. A removed child and an added child whose
/// signatures match each other and nothing else in the diff are reported as
/// one rename.
pub fn diff(old: &FolderSnapshot, new: &FolderSnapshot) -> Vec<Change> {
    let parent = new.node.path.clone();
    let old_children: BTreeMap<&OsStr, &Node> = old.children.iter().map(|c| (c.os_name(), c)).collect();
    let new_children: BTreeMap<&OsStr, &Node> = new.children.iter().map(|c| (c.os_name(), c)).collect();

    let mut changes = Vec::new();
    let mut removed: Vec<&Node> = Vec::new();
    let mut added: Vec<&Node> = Vec::new();
    for (name, before) in &old_children {
        match new_children.get(name) {
            None => removed.push(*before),
            Some(after) if before.is_folder() != after.is_folder() => {
                removed.push(*before);
                added.push(*after);
            },
            Some(after) if !same_state(before, after) => changes.push(Change::Updated(ItemUpdated {
                parent: parent.clone(),
                node: (*after).clone(),
                old_path: before.path().clone(),
            })),
            Some(_) => {},
        }
    }
    added.extend(new_children.iter().filter(|(name, _)| !old_children.contains_key(*name)).map(|(_, node)| *node));

    let mut removed_by_signature: HashMap<Signature, Vec<&Node>> = HashMap::new();
    for node in &removed {
        removed_by_signature.entry(signature(node)).or_default().push(*node);
    }
    let mut added_by_signature: HashMap<Signature, Vec<&Node>> = HashMap::new();
    for node in &added {
        added_by_signature.entry(signature(node)).or_default().push(*node);
    }
    let mut renamed: Vec<(&Node, &Node)> = Vec::new();
    for (sig, candidates) in &removed_by_signature {
        if let ([before], Some([after])) = (candidates.as_slice(), added_by_signature.get(sig).map(Vec::as_slice)) {
            renamed.push((*before, *after));
        }
    }
    renamed.sort_by(|a, b| a.1.path().cmp(b.1.path()));

    for (before, after) in &renamed {
        changes.push(Change::Updated(ItemUpdated {
            parent: parent.clone(),
            node: (*after).clone(),
            old_path: before.path().clone(),
        }));
    }
    let is_renamed_from = |node: &Node| renamed.iter().any(|(before, _)| before.path() == node.path());
    let is_renamed_to = |node: &Node| renamed.iter().any(|(_, after)| after.path() == node.path());
    for node in removed.into_iter().filter(|n| !is_renamed_from(*n)) {
        changes.push(Change::Removed(ItemRemoved { parent: parent.clone(), node: node.clone() }));
    }
    for node in added.into_iter().filter(|n| !is_renamed_to(*n)) {
        changes.push(Change::Added(ItemAdded { parent: parent.clone(), node: node.clone() }));
    }
    changes
}

#[cfg(test)]
mod tests {
    use super::*;
    use folio_storage::{FileNode, FolderNode};
    use std::path::Path;

    fn path(relative: &str) -> NodePath {
        NodePath::new(Path::new("/srv/music"), relative).unwrap()
    }

    fn at(seconds: i64) -> OffsetDateTime {
        OffsetDateTime::UNIX_EPOCH + time::Duration::seconds(seconds)
    }

    fn file(name: &str, size: u64, modified: i64) -> Node {
        Node::File(FileNode { path: path(&format!("Album/{name}")), size, modified: at(modified), created: None, exists: true })
    }

    fn folder(name: &str) -> Node {
        Node::Folder(FolderNode { path: path(&format!("Album/{name}")), modified: at(1), created: None, exists: true })
    }

    fn snapshot(children: Vec<Node>) -> FolderSnapshot {
        FolderSnapshot::new(FolderNode { path: path("Album"), modified: at(1), created: None, exists: true }, children)
    }

    #[test]
    fn test_unchanged_folder_has_no_changes() {
        let old = snapshot(vec![file("a.mp3", 1, 100), folder("Disc 2")]);
        assert!(diff(&old, &old.clone()).is_empty());
    }

    #[test]
    fn test_added_updated_removed() {
        let old = snapshot(vec![file("a.mp3", 1, 100), file("b.mp3", 2, 100)]);
        let new = snapshot(vec![file("a.mp3", 1, 200), file("c.mp3", 3, 300)]);
        let changes = diff(&old, &new);
        assert_eq!(changes.len(), 3);
        assert!(changes.iter().any(|c| matches!(c, Change::Updated(u) if u.node.name() == "a.mp3" && !u.is_rename())));
        assert!(changes.iter().any(|c| matches!(c, Change::Removed(r) if r.node.name() == "b.mp3")));
        assert!(changes.iter().any(|c| matches!(c, Change::Added(a) if a.node.name() == "c.mp3")));
    }

    #[test]
    fn test_rename_is_one_update_with_old_path() {
        let old = snapshot(vec![file("a.mp3", 5, 100), file("keep.mp3", 1, 1)]);
        let new = snapshot(vec![file("z.mp3", 5, 100), file("keep.mp3", 1, 1)]);
        let changes = diff(&old, &new);
        assert_eq!(changes.len(), 1);
        let Change::Updated(update) = &changes[0] else { panic!("expected an update, got {changes:?}") };
        assert!(update.is_rename());
        assert_eq!(update.old_path, path("Album/a.mp3"));
        assert_eq!(update.node.path(), &path("Album/z.mp3"));
    }

    #[test]
    fn test_ambiguous_renames_stay_add_and_remove() {
        let old = snapshot(vec![file("a.mp3", 5, 100), file("b.mp3", 5, 100)]);
        let new = snapshot(vec![file("c.mp3", 5, 100), file("d.mp3", 5, 100)]);
        let changes = diff(&old, &new);
        assert_eq!(changes.iter().filter(|c| matches!(c, Change::Removed(_))).count(), 2);
        assert_eq!(changes.iter().filter(|c| matches!(c, Change::Added(_))).count(), 2);
    }

    #[cfg(unix)]
    #[test]
    fn test_non_utf8_names_are_not_merged() {
        use std::os::unix::ffi::OsStrExt;
        let child = |bytes: &[u8], modified: i64| {
            let relative = Path::new("Album").join(OsStr::from_bytes(bytes));
            let path = NodePath::new(Path::new("/srv/music"), relative).unwrap();
            Node::File(FileNode { path, size: 1, modified: at(modified), created: None, exists: true })
        };
        let old = snapshot(vec![child(b"a\xff.mp3", 100), child(b"a\xfe.mp3", 100)]);
        let new = snapshot(vec![child(b"a\xff.mp3", 100), child(b"a\xfe.mp3", 200)]);
        let changes = diff(&old, &new);
        assert_eq!(changes.len(), 1);
        let Change::Updated(update) = &changes[0] else { panic!("expected an update, got {changes:?}") };
        assert_eq!(update.node.os_name(), OsStr::from_bytes(b"a\xfe.mp3"));
        assert!(!update.is_rename());
    }

    #[test]
    fn test_kind_change_is_remove_and_add() {
        let old = snapshot(vec![file("x", 0, 1)]);
        let new = snapshot(vec![folder("x")]);
        let changes = diff(&old, &new);
        assert!(matches!(&changes[..], [Change::Removed(_), Change::Added(_)]));
    }
}
