//! Path validation and security utilities.
//!
//! Every path handed to this crate by a client is turned into a
//! [`StoragePath`] first. A `StoragePath` is always relative to the storage
//! root and can never escape it.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::ffi::OsStr;
use std::fmt;
use std::path::{Component, Path, PathBuf};

use crate::error::{ErrorKind, Result};

/// A normalized, root-confined path inside the storage tree.
///
/// The empty string, `"."` and `"/"` all resolve to the root. Leading slashes
/// refer to the *storage* root, never the host root.
///
/// # Examples
///
/// ```
/// use burrow_storage::StoragePath;
///
/// let path = StoragePath::parse("wrong/../still-wrong/.././correct//./file.txt/").unwrap();
/// assert_eq!(path.to_string(), "/correct/file.txt");
/// assert!(StoragePath::parse("").unwrap().is_root());
/// assert!(StoragePath::parse("/").unwrap().is_root());
/// // Never leaves the storage root
/// assert!(StoragePath::parse("../etc/passwd").is_err());
/// assert!(StoragePath::parse("a/../../b").is_err());
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StoragePath(PathBuf);

impl StoragePath {
    /// The storage root itself.
    pub fn root() -> Self {
        Self(PathBuf::new())
    }

    /// Resolve an arbitrary, externally supplied string.
    ///
    /// > **Note:** This does **not** normalize backslashes, non-UTF8 bytes, or
    /// >           platform-specific weirdness. Null bytes are explicitly rejected.
    pub fn parse(user: impl AsRef<Path>) -> Result<Self> {
        let user = user.as_ref();
        // Use Rust's built-in path component parser for robust handling. Means we
        // don't have to deal with non-UTF8, or the maniacs on Unix that use
        // backslashes in their filenames.
        let mut components = Vec::new();
        for component in user.components() {
            match component {
                Component::Normal(s) => {
                    // Null bytes pass through Path::components() on Unix but cause
                    // truncation in C-based syscalls; reject them explicitly.
                    if s.as_encoded_bytes().contains(&0) {
                        exn::bail!(ErrorKind::invalid(format!("path contains a null byte: {}", user.display())));
                    }
                    components.push(s)
                },
                Component::CurDir | Component::RootDir => {},
                Component::Prefix(_) => {
                    exn::bail!(ErrorKind::invalid(format!("path has a platform prefix: {}", user.display())))
                },
                Component::ParentDir => {
                    if components.pop().is_none() {
                        exn::bail!(ErrorKind::invalid(format!("path escapes storage root: {}", user.display())));
                    }
                },
            }
        }
        Ok(Self(components.into_iter().collect()))
    }

    pub fn is_root(&self) -> bool {
        self.0.as_os_str().is_empty()
    }

    /// Relative form, suitable for joining onto a root directory.
    pub fn as_path(&self) -> &Path {
        &self.0
    }

    /// Final component, or `None` for the root.
    pub fn file_name(&self) -> Option<&str> {
        self.0.file_name().and_then(|name| name.to_str())
    }

    /// Containing directory, or `None` for the root.
    pub fn parent(&self) -> Option<StoragePath> {
        match self.is_root() {
            true => None,
            false => Some(Self(self.0.parent().map(Path::to_path_buf).unwrap_or_default())),
        }
    }

    /// Every containing directory, nearest first, ending with the root.
    pub fn ancestors(&self) -> impl Iterator<Item = StoragePath> + '_ {
        std::iter::successors(self.parent(), StoragePath::parent)
    }

    /// Append a single, validated path component.
    pub fn join(&self, name: &str) -> Result<StoragePath> {
        validate_name(name)?;
        Ok(Self(self.0.join(name)))
    }

    /// Append a name read back from the filesystem itself, which is always a
    /// single normal component.
    pub(crate) fn child(&self, name: &OsStr) -> StoragePath {
        Self(self.0.join(name))
    }

    /// `true` if `other` is this path or lies beneath it.
    pub fn contains(&self, other: &StoragePath) -> bool {
        other.0.starts_with(&self.0)
    }

    /// Absolute location of this path beneath `root`.
    pub fn to_absolute(&self, root: &Path) -> PathBuf {
        root.join(&self.0)
    }
}

/// Validates a bare file or folder name, such as the target of a rename or
/// the name of an uploaded file.
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name.trim().is_empty() {
        exn::bail!(ErrorKind::invalid("name is empty"));
    }
    if name == "." || name == ".." || name.contains(['/', '\\', '\0']) {
        exn::bail!(ErrorKind::invalid(format!("invalid name: {name}")));
    }
    Ok(())
}

impl fmt::Display for StoragePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("/")?;
        let mut first = true;
        for component in self.0.components() {
            if !first {
                f.write_str("/")?;
            }
            write!(f, "{}", component.as_os_str().to_string_lossy())?;
            first = false;
        }
        Ok(())
    }
}

impl Serialize for StoragePath {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}
impl<'de> Deserialize<'de> for StoragePath {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse(raw).map_err(|e| serde::de::Error::custom(&*e))
    }
}
impl From<&StoragePath> for PathBuf {
    /// Root-anchored form, used in error messages so that the host location
    /// of the storage root is never leaked to clients.
    fn from(path: &StoragePath) -> Self {
        PathBuf::from(path.to_string())
    }
}
impl AsRef<Path> for StoragePath {
    fn as_ref(&self) -> &Path {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("a/b/c/file.txt", "/a/b/c/file.txt")]
    #[case("/a/b", "/a/b")]
    #[case("a//b//c", "/a/b/c")]
    #[case("a/./b/./c", "/a/b/c")]
    #[case("a/b/..", "/a")]
    #[case("a/b/c/", "/a/b/c")]
    #[case("Fandom1///", "/Fandom1")]
    #[case("", "/")]
    #[case(".", "/")]
    #[case("./.", "/")]
    #[case("//", "/")]
    fn test_normalization(#[case] input: &str, #[case] expected: &str) {
        assert_eq!(StoragePath::parse(input).unwrap().to_string(), expected);
    }

    #[rstest]
    #[case("../etc/passwd")]
    #[case("a/../../b")]
    #[case("..")]
    #[case("/../..")]
    #[case("a\0b")]
    fn test_rejected(#[case] input: &str) {
        let err = StoragePath::parse(input).unwrap_err();
        assert!(matches!(&*err, ErrorKind::InvalidArgument(_)));
    }

    #[test]
    fn test_root_is_confined() {
        let root = Path::new("/srv/upload");
        let path = StoragePath::parse("/etc/passwd").unwrap();
        assert_eq!(path.to_absolute(root), PathBuf::from("/srv/upload/etc/passwd"));
        assert_eq!(StoragePath::root().to_absolute(root), PathBuf::from("/srv/upload"));
    }

    #[test]
    fn test_parent_and_ancestors() {
        let path = StoragePath::parse("a/b/c.txt").unwrap();
        assert_eq!(path.parent().unwrap().to_string(), "/a/b");
        assert_eq!(path.file_name(), Some("c.txt"));
        let ancestors: Vec<_> = path.ancestors().map(|p| p.to_string()).collect();
        assert_eq!(ancestors, vec!["/a/b", "/a", "/"]);
        assert!(StoragePath::root().parent().is_none());
        assert_eq!(StoragePath::root().ancestors().count(), 0);
    }

    #[test]
    fn test_join() {
        let dir = StoragePath::parse("a").unwrap();
        assert_eq!(dir.join("b.txt").unwrap().to_string(), "/a/b.txt");
        assert!(dir.join("../b").is_err());
        assert!(dir.join("x/y").is_err());
        assert!(dir.join("").is_err());
        assert!(dir.join("..").is_err());
    }

    #[test]
    fn test_contains() {
        let a = StoragePath::parse("a").unwrap();
        assert!(a.contains(&StoragePath::parse("a/b").unwrap()));
        assert!(a.contains(&a));
        assert!(!a.contains(&StoragePath::parse("ab").unwrap()));
        assert!(StoragePath::root().contains(&a));
    }

    #[test]
    fn test_serde_uses_canonical_string() {
        let path = StoragePath::parse("a/b").unwrap();
        assert_eq!(serde_json::to_string(&path).unwrap(), r#""/a/b""#);
        let back: StoragePath = serde_json::from_str(r#""a/./b""#).unwrap();
        assert_eq!(back, path);
        assert!(serde_json::from_str::<StoragePath>(r#""../x""#).is_err());
    }
}
