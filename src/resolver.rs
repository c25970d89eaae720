//! Virtual path → physical path composition.
//!
//! The physical location of a virtual path is the literal concatenation of
//! the configured base path and the mount-relative path the kernel hands us.
//! No normalization, symlink resolution, or `..` filtering is performed;
//! callers able to inject crafted parent segments can therefore reach outside
//! the base directory. That mirrors the permissive mapping this filesystem
//! has always exposed and is a documented trust assumption, not a bug.

use std::ffi::{OsStr, OsString};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

use thiserror::Error;

/// Upper bound on a composed physical path, matching the platform limit the
/// kernel enforces on the backing filesystem.
pub const MAX_PATH_LEN: usize = libc::PATH_MAX as usize;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ResolveError {
    #[error("resolved path exceeds PATH_MAX ({MAX_PATH_LEN} bytes)")]
    PathTooLong,
}

impl From<ResolveError> for std::io::Error {
    fn from(_: ResolveError) -> Self {
        std::io::Error::from_raw_os_error(libc::ENAMETOOLONG)
    }
}

/// Maps mount-relative paths to absolute paths under a fixed base directory.
#[derive(Debug, Clone)]
pub struct PathResolver {
    base: OsString,
}

impl PathResolver {
    pub fn new(base_path: &Path) -> Self {
        Self {
            base: base_path.as_os_str().to_os_string(),
        }
    }

    /// Compose the physical path for `virtual_path` (which the kernel always
    /// supplies with a leading `/`, `/` itself meaning the mount root).
    pub fn resolve(&self, virtual_path: &OsStr) -> Result<PathBuf, ResolveError> {
        if self.base.as_bytes().len() + virtual_path.as_bytes().len() > MAX_PATH_LEN {
            return Err(ResolveError::PathTooLong);
        }
        let mut full = self.base.clone();
        full.push(virtual_path);
        Ok(PathBuf::from(full))
    }
}

/// Compose a child virtual path from its parent and name, the same way the
/// kernel spells paths on the wire (`/` parent does not get doubled).
pub fn join_name(parent: &OsStr, name: &OsStr) -> OsString {
    let mut path = parent.to_os_string();
    if parent.as_bytes() != b"/" {
        path.push("/");
    } else if path.is_empty() {
        path.push("/");
    }
    path.push(name);
    path
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn concatenates_literally() {
        let resolver = PathResolver::new(Path::new("/srv/data"));
        let physical = resolver.resolve(OsStr::new("/a/b")).unwrap();
        assert_eq!(physical, PathBuf::from("/srv/data/a/b"));
    }

    #[test]
    fn root_maps_to_base_plus_slash() {
        let resolver = PathResolver::new(Path::new("/srv/data"));
        let physical = resolver.resolve(OsStr::new("/")).unwrap();
        assert_eq!(physical, PathBuf::from("/srv/data/"));
    }

    #[test]
    fn parent_segments_are_not_filtered() {
        let resolver = PathResolver::new(Path::new("/srv/data"));
        let physical = resolver.resolve(OsStr::new("/../escape")).unwrap();
        assert_eq!(physical, PathBuf::from("/srv/data/../escape"));
    }

    #[test]
    fn over_long_path_is_rejected() {
        let resolver = PathResolver::new(Path::new("/srv/data"));
        let long = format!("/{}", "x".repeat(MAX_PATH_LEN));
        assert_eq!(
            resolver.resolve(OsStr::new(&long)),
            Err(ResolveError::PathTooLong)
        );
    }

    #[test]
    fn exact_limit_is_allowed() {
        let base = Path::new("/b");
        let resolver = PathResolver::new(base);
        let long = format!("/{}", "x".repeat(MAX_PATH_LEN - 3));
        assert!(resolver.resolve(OsStr::new(&long)).is_ok());
    }

    #[test]
    fn join_name_handles_root_parent() {
        assert_eq!(join_name(OsStr::new("/"), OsStr::new("f")), OsString::from("/f"));
        assert_eq!(
            join_name(OsStr::new("/a"), OsStr::new("b")),
            OsString::from("/a/b")
        );
    }
}
