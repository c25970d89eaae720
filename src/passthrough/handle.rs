//! Open-handle bookkeeping.
//!
//! Every successful open/create/opendir moves a typed [`OpenHandle`] into the
//! table and hands the caller the `u64` key the kernel will quote back on
//! subsequent handle operations. Release removes and consumes the handle,
//! which closes the underlying descriptor; a key that is unknown (never
//! opened, or already released) answers `EBADF`.

use std::collections::HashMap;
use std::ffi::OsString;
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use rfuse3::FileType;

use super::attr::file_kind;

/// One entry captured from the backing directory stream.
#[derive(Debug, Clone)]
pub struct DirEntrySnapshot {
    pub name: OsString,
    pub kind: FileType,
}

/// An open directory stream: the entries the backing directory held when the
/// stream was opened, served in order across readdir calls.
#[derive(Debug)]
pub struct DirStream {
    physical: PathBuf,
    entries: Vec<DirEntrySnapshot>,
}

impl DirStream {
    pub fn open(physical: &Path) -> io::Result<Self> {
        let mut entries = Vec::new();
        for entry in std::fs::read_dir(physical)? {
            let entry = entry?;
            let kind = entry
                .file_type()
                .map(file_kind)
                .unwrap_or(FileType::RegularFile);
            entries.push(DirEntrySnapshot {
                name: entry.file_name(),
                kind,
            });
        }
        Ok(Self {
            physical: physical.to_path_buf(),
            entries,
        })
    }

    pub fn physical(&self) -> &Path {
        &self.physical
    }

    pub fn entries(&self) -> &[DirEntrySnapshot] {
        &self.entries
    }
}

/// The live binding between one open virtual file or directory and its
/// underlying OS resource.
#[derive(Debug)]
pub enum OpenHandle {
    File(File),
    Dir(DirStream),
}

impl OpenHandle {
    /// The open regular file behind this handle, or `EBADF` when the handle
    /// is a directory stream.
    pub fn as_file(&self) -> io::Result<&File> {
        match self {
            OpenHandle::File(file) => Ok(file),
            OpenHandle::Dir(_) => Err(io::Error::from_raw_os_error(libc::EBADF)),
        }
    }

    /// The open directory stream behind this handle, or `EBADF`.
    pub fn as_dir(&self) -> io::Result<&DirStream> {
        match self {
            OpenHandle::Dir(dir) => Ok(dir),
            OpenHandle::File(_) => Err(io::Error::from_raw_os_error(libc::EBADF)),
        }
    }
}

/// Maps kernel-visible `fh` values to open handles.
///
/// The map guard is held only for lookup/insert/remove; handles are
/// `Arc`-shared so positional I/O on one handle never blocks operations on
/// another, and a release racing an in-flight read only closes the
/// descriptor once the last user drops its reference.
#[derive(Debug, Default)]
pub struct HandleTable {
    next_fh: AtomicU64,
    handles: RwLock<HashMap<u64, Arc<OpenHandle>>>,
}

impl HandleTable {
    pub fn new() -> Self {
        Self {
            // fh 0 is left unused; some FUSE paths treat it as "no handle".
            next_fh: AtomicU64::new(1),
            handles: RwLock::new(HashMap::new()),
        }
    }

    pub fn insert(&self, handle: OpenHandle) -> u64 {
        let fh = self.next_fh.fetch_add(1, Ordering::SeqCst);
        self.handles.write().unwrap().insert(fh, Arc::new(handle));
        fh
    }

    pub fn get(&self, fh: u64) -> Option<Arc<OpenHandle>> {
        self.handles.read().unwrap().get(&fh).cloned()
    }

    pub fn remove(&self, fh: u64) -> Option<Arc<OpenHandle>> {
        self.handles.write().unwrap().remove(&fh)
    }

    pub fn is_empty(&self) -> bool {
        self.handles.read().unwrap().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_get_remove_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        std::fs::write(&path, b"x").unwrap();

        let table = HandleTable::new();
        let fh = table.insert(OpenHandle::File(File::open(&path).unwrap()));
        assert!(fh > 0);
        assert!(table.get(fh).is_some());

        assert!(table.remove(fh).is_some());
        assert!(table.get(fh).is_none());
        assert!(table.remove(fh).is_none());
        assert!(table.is_empty());
    }

    #[test]
    fn fh_values_are_unique() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        std::fs::write(&path, b"x").unwrap();

        let table = HandleTable::new();
        let a = table.insert(OpenHandle::File(File::open(&path).unwrap()));
        let b = table.insert(OpenHandle::File(File::open(&path).unwrap()));
        assert_ne!(a, b);
    }

    #[test]
    fn dir_stream_snapshots_entries() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a"), b"").unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();

        let stream = DirStream::open(dir.path()).unwrap();
        assert_eq!(stream.entries().len(), 2);
        let sub = stream
            .entries()
            .iter()
            .find(|e| e.name == OsString::from("sub"))
            .unwrap();
        assert_eq!(sub.kind, FileType::Directory);
    }

    #[test]
    fn handle_type_mismatch_is_ebadf() {
        let dir = tempfile::tempdir().unwrap();
        let stream = DirStream::open(dir.path()).unwrap();
        let handle = OpenHandle::Dir(stream);
        let err = handle.as_file().unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::EBADF));
    }
}
