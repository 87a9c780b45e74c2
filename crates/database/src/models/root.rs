use crate::error::{Error, ErrorKind};
use derive_more::Display;
use exn::ResultExt;
use folio_storage::NodePath;
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Display)]
pub struct RootId(pub i64);

/// A root child: the immediate child directory of a configured root that
/// every node below it belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RootRecord {
    pub id: RootId,
    pub path: NodePath,
    pub hidden: bool,
}

#[derive(sqlx::FromRow)]
pub(crate) struct RootRow {
    id: i64,
    root_path: String,
    relative_path: String,
    hidden: bool,
}
impl TryFrom<RootRow> for RootRecord {
    type Error = Error;
    fn try_from(row: RootRow) -> Result<Self, Self::Error> {
        let path = NodePath::new(PathBuf::from(row.root_path), row.relative_path)
            .or_raise(|| ErrorKind::InvalidData("root path"))?;
        Ok(Self { id: RootId(row.id), path, hidden: row.hidden })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn test_row_to_model() {
        let row = RootRow {
            id: 7,
            root_path: "/srv/music".to_string(),
            relative_path: "Artist".to_string(),
            hidden: true,
        };
        let record = RootRecord::try_from(row).unwrap();
        assert_eq!(record.id, RootId(7));
        assert_eq!(record.path.absolute_path(), Path::new("/srv/music/Artist"));
        assert!(record.path.is_root_child());
        assert!(record.hidden);
    }

    #[test]
    fn test_escaping_row_is_invalid() {
        let row = RootRow { id: 1, root_path: "/srv/music".to_string(), relative_path: "../etc".to_string(), hidden: false };
        assert!(RootRecord::try_from(row).is_err());
    }
}
