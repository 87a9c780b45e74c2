mod node;
mod root;

pub(crate) use self::node::NodeRow;
pub use self::node::{NewNode, NodeId, NodeKind, NodeRecord, NodeState};
pub(crate) use self::root::RootRow;
pub use self::root::{RootId, RootRecord};

use crate::error::{ErrorKind, Result};
use exn::OptionExt;
use std::path::Path;

pub(crate) fn path_str(path: &Path) -> Result<&str> {
    path.to_str().ok_or_raise(|| ErrorKind::InvalidData("path is not valid UTF-8"))
}
