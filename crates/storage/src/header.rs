use crate::node_path::NodePath;

/// A folder's identity plus the fingerprint of its immediate children.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FolderHeader {
    pub path: NodePath,
    pub hash: String,
}

impl FolderHeader {
    pub fn new(path: NodePath, hash: impl Into<String>) -> Self {
        Self { path, hash: hash.into() }
    }
}

/// What the filesystem looks like now versus what the database last recorded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FolderDiff {
    pub file_system: FolderHeader,
    pub database: Option<FolderHeader>,
}

impl FolderDiff {
    pub fn new(file_system: FolderHeader, database: Option<FolderHeader>) -> Self {
        Self { file_system, database }
    }

    /// The single predicate deciding whether a folder needs reconciliation.
    pub fn is_dirty(&self) -> bool {
        self.database.as_ref() != Some(&self.file_system)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::path::Path;

    fn header(relative: &str, hash: &str) -> FolderHeader {
        FolderHeader::new(NodePath::new(Path::new("/srv/music"), relative).unwrap(), hash)
    }

    #[test]
    fn test_dirty_without_database_header() {
        assert!(FolderDiff::new(header("Album", "abc"), None).is_dirty());
    }

    #[rstest]
    #[case::identical("Album", "abc", false)]
    #[case::hash_changed("Album", "abd", true)]
    #[case::other_folder("Other", "abc", true)]
    fn test_clean_iff_path_and_hash_match(#[case] relative: &str, #[case] hash: &str, #[case] dirty: bool) {
        assert_eq!(FolderDiff::new(header("Album", "abc"), Some(header(relative, hash))).is_dirty(), dirty);
    }
}
