//! Relative path normalization.
//!
//! Every [`NodePath`](crate::NodePath) stores its relative component in this
//! normalized form, which is what makes structural equality meaningful.

use std::path::{Component, Path, PathBuf};

use crate::error::{ErrorKind, Result};

/// Normalizes a path relative to a root.
///
/// `.` and empty components are dropped, `..` is resolved lexically and must
/// never climb above the root. The empty path is valid and denotes the root
/// itself.
///
/// > **Note:** This does **not** touch the filesystem, so symlinks are not
/// > resolved. Null bytes are explicitly rejected.
///
/// # Examples
///
/// ```
/// use std::path::Path;
/// use folio_storage::normalize_relative;
/// assert_eq!(normalize_relative("Music/./Album//").unwrap(), Path::new("Music/Album"));
/// assert_eq!(normalize_relative("Music/Album/..").unwrap(), Path::new("Music"));
/// assert_eq!(normalize_relative("").unwrap(), Path::new(""));
/// assert!(normalize_relative("../etc").is_err());
/// ```
pub fn normalize(path: impl AsRef<Path>) -> Result<PathBuf> {
    let path = path.as_ref();
    let mut components = Vec::new();
    for component in path.components() {
        match component {
            Component::Normal(segment) => {
                // Null bytes survive Path::components() on Unix but truncate
                // in every C-based syscall.
                if segment.as_encoded_bytes().contains(&0) {
                    exn::bail!(ErrorKind::InvalidPath(path.to_path_buf()));
                }
                components.push(segment);
            },
            Component::CurDir | Component::RootDir => {},
            Component::Prefix(_) => exn::bail!(ErrorKind::InvalidPath(path.to_path_buf())),
            Component::ParentDir => {
                if components.pop().is_none() {
                    exn::bail!(ErrorKind::InvalidPath(path.to_path_buf()));
                }
            },
        }
    }
    Ok(components.into_iter().collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("Music/a.mp3", "Music/a.mp3")]
    #[case("a//b//c", "a/b/c")]
    #[case("a/./b/./c", "a/b/c")]
    #[case("a/b/..", "a")]
    #[case("Music///", "Music")]
    #[case("", "")]
    #[case(".", "")]
    fn test_normalizes(#[case] input: &str, #[case] expected: &str) {
        assert_eq!(normalize(input).unwrap(), Path::new(expected));
    }

    #[rstest]
    #[case("..")]
    #[case("../etc/passwd")]
    #[case("a/../../b")]
    #[case("a\0b")]
    fn test_rejects(#[case] input: &str) {
        assert!(normalize(input).is_err());
    }
}
