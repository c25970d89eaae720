//! The passthrough dispatcher.
//!
//! Implements the rfuse3 path-based operation table with one stanza per
//! filesystem call: resolve the virtual path under the configured base
//! directory, invoke the host primitive with the caller's arguments
//! unchanged, and report the host's errno verbatim on failure. The epoch
//! shift touches exactly three observable outputs (the atime/mtime/ctime of
//! attribute replies) and two inputs (the atime/mtime of a set-times call);
//! no other metadata, and never file content.

mod attr;
mod handle;

pub use handle::{DirEntrySnapshot, DirStream, HandleTable, OpenHandle};

use std::ffi::{CString, OsStr, OsString};
use std::fs::File;
use std::io;
use std::num::NonZeroU32;
use std::os::fd::{AsRawFd, FromRawFd};
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::os::unix::fs::{FileExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::stream::{self, Stream};
use nix::sys::stat::{Mode, SFlag};
use nix::sys::statvfs::statvfs;
use nix::unistd::{AccessFlags, access};
use rfuse3::path::PathFilesystem;
use rfuse3::path::reply::{
    DirectoryEntry, DirectoryEntryPlus, FileAttr, ReplyAttr, ReplyCreated, ReplyData,
    ReplyDirectory, ReplyDirectoryPlus, ReplyEntry, ReplyInit, ReplyOpen, ReplyStatFs, ReplyWrite,
    ReplyXAttr,
};
use rfuse3::raw::Request;
use rfuse3::raw::reply::ReplyLock;
use rfuse3::{Errno, FileType, Result as FuseResult, SetAttr, Timestamp};

use crate::config::MountConfig;
use crate::epoch::EpochShift;
use crate::resolver::{PathResolver, join_name};

/// Attribute/entry validity handed to the kernel, matching the conservative
/// one-second window the rest of the rfuse3 filesystems in this family use.
const TTL: Duration = Duration::from_secs(1);

/// FUSE spells "lock to end of file" as an end offset of `i64::MAX`.
const LOCK_OFFSET_MAX: u64 = i64::MAX as u64;

/// Convert a host error into the errno reported to the kernel, leaving a
/// trace line behind. The error identity is preserved, never remapped.
fn host_err(op: &'static str, err: io::Error) -> Errno {
    warn!(
        "{op}: errno={} ({err})",
        err.raw_os_error().unwrap_or(libc::EIO)
    );
    err.into()
}

fn nix_err(err: nix::Error) -> io::Error {
    io::Error::from_raw_os_error(err as i32)
}

fn cpath(path: &Path) -> io::Result<CString> {
    CString::new(path.as_os_str().as_bytes())
        .map_err(|_| io::Error::from_raw_os_error(libc::EINVAL))
}

fn cname(name: &OsStr) -> io::Result<CString> {
    CString::new(name.as_bytes()).map_err(|_| io::Error::from_raw_os_error(libc::EINVAL))
}

/// The passthrough filesystem: a mounted view of `base_path` whose
/// timestamps are presented in the configured epoch.
pub struct EpochShiftFs {
    config: MountConfig,
    resolver: PathResolver,
    shift: EpochShift,
    handles: HandleTable,
}

impl EpochShiftFs {
    pub fn new(config: MountConfig) -> Self {
        let resolver = PathResolver::new(&config.base_path);
        let shift = EpochShift::new(config.epoch_year);
        info!(
            "epochshift-fs: base_path={:?} epoch_year={} offset_secs={}",
            config.base_path,
            config.epoch_year,
            shift.offset_secs()
        );
        Self {
            config,
            resolver,
            shift,
            handles: HandleTable::new(),
        }
    }

    pub fn config(&self) -> &MountConfig {
        &self.config
    }

    pub fn shift(&self) -> &EpochShift {
        &self.shift
    }

    fn resolve(&self, path: &OsStr) -> io::Result<PathBuf> {
        Ok(self.resolver.resolve(path)?)
    }

    fn resolve_child(&self, parent: &OsStr, name: &OsStr) -> io::Result<PathBuf> {
        self.resolve(&join_name(parent, name))
    }

    /// lstat the physical path and present the attributes in shifted time.
    fn stat_presented(&self, physical: &Path) -> io::Result<FileAttr> {
        let meta = std::fs::symlink_metadata(physical)?;
        Ok(attr::presented_attr(&meta, &self.shift))
    }

    /// fstat an open handle and present the attributes in shifted time.
    fn stat_handle_presented(&self, file: &File) -> io::Result<FileAttr> {
        let meta = file.metadata()?;
        Ok(attr::presented_attr(&meta, &self.shift))
    }

    fn entry_reply(&self, physical: &Path) -> io::Result<ReplyEntry> {
        let attr = self.stat_presented(physical)?;
        Ok(ReplyEntry { ttl: TTL, attr })
    }

    fn handle(&self, fh: u64) -> io::Result<Arc<OpenHandle>> {
        self.handles
            .get(fh)
            .ok_or_else(|| io::Error::from_raw_os_error(libc::EBADF))
    }

    /// Open the physical file with the caller's flags forwarded verbatim,
    /// plus the creation mode when the kernel asked for O_CREAT semantics.
    fn open_physical(physical: &Path, flags: i32, mode: Option<u32>) -> io::Result<File> {
        let path = cpath(physical)?;
        let fd = unsafe {
            match mode {
                Some(mode) => libc::open(path.as_ptr(), flags, mode as libc::c_uint),
                None => libc::open(path.as_ptr(), flags),
            }
        };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(unsafe { File::from_raw_fd(fd) })
    }

    /// Store caller-supplied (presented) timestamps on the physical file,
    /// converting each back to on-disk time first. A missing component is
    /// left untouched (UTIME_OMIT).
    fn set_times_presented(
        &self,
        physical: Option<&Path>,
        file: Option<&File>,
        atime: Option<Timestamp>,
        mtime: Option<Timestamp>,
    ) -> io::Result<()> {
        let to_timespec = |ts: Option<Timestamp>| match ts {
            Some(ts) => {
                let stored = self.shift.store_timestamp(ts);
                libc::timespec {
                    tv_sec: stored.sec as libc::time_t,
                    tv_nsec: stored.nsec as libc::c_long,
                }
            }
            None => libc::timespec {
                tv_sec: 0,
                tv_nsec: libc::UTIME_OMIT,
            },
        };
        let times = [to_timespec(atime), to_timespec(mtime)];
        let rc = match (physical, file) {
            (Some(physical), _) => {
                let path = cpath(physical)?;
                unsafe { libc::utimensat(libc::AT_FDCWD, path.as_ptr(), times.as_ptr(), 0) }
            }
            (None, Some(file)) => unsafe { libc::futimens(file.as_raw_fd(), times.as_ptr()) },
            (None, None) => return Err(io::Error::from_raw_os_error(libc::EINVAL)),
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

impl PathFilesystem for EpochShiftFs {
    type DirEntryStream<'a>
        = Pin<Box<dyn Stream<Item = FuseResult<DirectoryEntry>> + Send + 'a>>
    where
        Self: 'a;

    type DirEntryPlusStream<'a>
        = Pin<Box<dyn Stream<Item = FuseResult<DirectoryEntryPlus>> + Send + 'a>>
    where
        Self: 'a;

    async fn init(&self, _req: Request) -> FuseResult<ReplyInit> {
        debug!("init");
        let max_write = NonZeroU32::new(1024 * 1024).unwrap();
        Ok(ReplyInit { max_write })
    }

    async fn destroy(&self, _req: Request) {
        debug!("destroy");
    }

    async fn lookup(&self, _req: Request, parent: &OsStr, name: &OsStr) -> FuseResult<ReplyEntry> {
        debug!("lookup: parent={:?} name={:?}", parent, name);
        let physical = self
            .resolve_child(parent, name)
            .map_err(|e| host_err("lookup", e))?;
        // A miss here is ordinary traffic, not worth a warning.
        self.entry_reply(&physical).map_err(Errno::from)
    }

    async fn getattr(
        &self,
        _req: Request,
        path: Option<&OsStr>,
        fh: Option<u64>,
        _flags: u32,
    ) -> FuseResult<ReplyAttr> {
        debug!("getattr: path={:?} fh={:?}", path, fh);
        let attr = match fh.and_then(|fh| self.handles.get(fh)) {
            Some(handle) => match handle.as_ref() {
                OpenHandle::File(file) => {
                    self.stat_handle_presented(file).map_err(Errno::from)?
                }
                OpenHandle::Dir(dir) => {
                    self.stat_presented(dir.physical()).map_err(Errno::from)?
                }
            },
            None => {
                let path = path.ok_or_else(|| Errno::from(libc::EINVAL))?;
                let physical = self.resolve(path).map_err(|e| host_err("getattr", e))?;
                self.stat_presented(&physical).map_err(Errno::from)?
            }
        };
        Ok(ReplyAttr { ttl: TTL, attr })
    }

    async fn setattr(
        &self,
        _req: Request,
        path: Option<&OsStr>,
        fh: Option<u64>,
        set_attr: SetAttr,
    ) -> FuseResult<ReplyAttr> {
        debug!("setattr: path={:?} fh={:?} {:?}", path, fh, set_attr);
        let physical = match path {
            Some(path) => Some(self.resolve(path).map_err(|e| host_err("setattr", e))?),
            None => None,
        };
        let handle = fh.and_then(|fh| self.handles.get(fh));
        let file = match handle.as_deref() {
            Some(OpenHandle::File(file)) => Some(file),
            _ => None,
        };

        if let Some(mode) = set_attr.mode {
            let perm = std::fs::Permissions::from_mode(mode);
            match (physical.as_deref(), file) {
                (Some(physical), _) => std::fs::set_permissions(physical, perm)
                    .map_err(|e| host_err("setattr(chmod)", e))?,
                (None, Some(file)) => file
                    .set_permissions(perm)
                    .map_err(|e| host_err("setattr(chmod)", e))?,
                (None, None) => return Err(libc::EINVAL.into()),
            }
        }

        if set_attr.uid.is_some() || set_attr.gid.is_some() {
            match (physical.as_deref(), file) {
                (Some(physical), _) => {
                    std::os::unix::fs::chown(physical, set_attr.uid, set_attr.gid)
                        .map_err(|e| host_err("setattr(chown)", e))?
                }
                (None, Some(file)) => std::os::unix::fs::fchown(file, set_attr.uid, set_attr.gid)
                    .map_err(|e| host_err("setattr(chown)", e))?,
                (None, None) => return Err(libc::EINVAL.into()),
            }
        }

        if let Some(size) = set_attr.size {
            match (file, physical.as_deref()) {
                (Some(file), _) => file
                    .set_len(size)
                    .map_err(|e| host_err("setattr(truncate)", e))?,
                (None, Some(physical)) => {
                    nix::unistd::truncate(physical, size as libc::off_t)
                        .map_err(nix_err)
                        .map_err(|e| host_err("setattr(truncate)", e))?
                }
                (None, None) => return Err(libc::EINVAL.into()),
            }
        }

        if set_attr.atime.is_some() || set_attr.mtime.is_some() {
            self.set_times_presented(physical.as_deref(), file, set_attr.atime, set_attr.mtime)
                .map_err(|e| host_err("setattr(utimens)", e))?;
        }

        let attr = match (file, physical.as_deref()) {
            (Some(file), _) => self.stat_handle_presented(file).map_err(Errno::from)?,
            (None, Some(physical)) => self.stat_presented(physical).map_err(Errno::from)?,
            (None, None) => return Err(libc::EINVAL.into()),
        };
        Ok(ReplyAttr { ttl: TTL, attr })
    }

    async fn readlink(&self, _req: Request, path: &OsStr) -> FuseResult<ReplyData> {
        debug!("readlink: path={:?}", path);
        let physical = self.resolve(path).map_err(|e| host_err("readlink", e))?;
        let target = std::fs::read_link(&physical).map_err(|e| host_err("readlink", e))?;
        Ok(ReplyData {
            data: Bytes::from(target.into_os_string().into_vec()),
        })
    }

    async fn symlink(
        &self,
        _req: Request,
        parent: &OsStr,
        name: &OsStr,
        link_path: &OsStr,
    ) -> FuseResult<ReplyEntry> {
        debug!(
            "symlink: parent={:?} name={:?} target={:?}",
            parent, name, link_path
        );
        let physical = self
            .resolve_child(parent, name)
            .map_err(|e| host_err("symlink", e))?;
        std::os::unix::fs::symlink(link_path, &physical).map_err(|e| host_err("symlink", e))?;
        self.entry_reply(&physical).map_err(Errno::from)
    }

    async fn mknod(
        &self,
        _req: Request,
        parent: &OsStr,
        name: &OsStr,
        mode: u32,
        rdev: u32,
    ) -> FuseResult<ReplyEntry> {
        debug!("mknod: parent={:?} name={:?} mode={:#o}", parent, name, mode);
        let physical = self
            .resolve_child(parent, name)
            .map_err(|e| host_err("mknod", e))?;
        nix::sys::stat::mknod(
            &physical,
            SFlag::from_bits_truncate(mode & libc::S_IFMT),
            Mode::from_bits_truncate(mode & 0o7777),
            rdev as libc::dev_t,
        )
        .map_err(nix_err)
        .map_err(|e| host_err("mknod", e))?;
        self.entry_reply(&physical).map_err(Errno::from)
    }

    async fn mkdir(
        &self,
        _req: Request,
        parent: &OsStr,
        name: &OsStr,
        mode: u32,
        _umask: u32,
    ) -> FuseResult<ReplyEntry> {
        debug!("mkdir: parent={:?} name={:?} mode={:#o}", parent, name, mode);
        let physical = self
            .resolve_child(parent, name)
            .map_err(|e| host_err("mkdir", e))?;
        nix::unistd::mkdir(&physical, Mode::from_bits_truncate(mode))
            .map_err(nix_err)
            .map_err(|e| host_err("mkdir", e))?;
        self.entry_reply(&physical).map_err(Errno::from)
    }

    async fn unlink(&self, _req: Request, parent: &OsStr, name: &OsStr) -> FuseResult<()> {
        debug!("unlink: parent={:?} name={:?}", parent, name);
        let physical = self
            .resolve_child(parent, name)
            .map_err(|e| host_err("unlink", e))?;
        std::fs::remove_file(&physical).map_err(|e| host_err("unlink", e))
    }

    async fn rmdir(&self, _req: Request, parent: &OsStr, name: &OsStr) -> FuseResult<()> {
        debug!("rmdir: parent={:?} name={:?}", parent, name);
        let physical = self
            .resolve_child(parent, name)
            .map_err(|e| host_err("rmdir", e))?;
        std::fs::remove_dir(&physical).map_err(|e| host_err("rmdir", e))
    }

    async fn rename(
        &self,
        _req: Request,
        origin_parent: &OsStr,
        origin_name: &OsStr,
        parent: &OsStr,
        name: &OsStr,
    ) -> FuseResult<()> {
        debug!(
            "rename: from={:?}/{:?} to={:?}/{:?}",
            origin_parent, origin_name, parent, name
        );
        let old_physical = self
            .resolve_child(origin_parent, origin_name)
            .map_err(|e| host_err("rename", e))?;
        let new_physical = self
            .resolve_child(parent, name)
            .map_err(|e| host_err("rename", e))?;
        std::fs::rename(&old_physical, &new_physical).map_err(|e| host_err("rename", e))
    }

    async fn link(
        &self,
        _req: Request,
        path: &OsStr,
        new_parent: &OsStr,
        new_name: &OsStr,
    ) -> FuseResult<ReplyEntry> {
        debug!(
            "link: path={:?} new_parent={:?} new_name={:?}",
            path, new_parent, new_name
        );
        let old_physical = self.resolve(path).map_err(|e| host_err("link", e))?;
        let new_physical = self
            .resolve_child(new_parent, new_name)
            .map_err(|e| host_err("link", e))?;
        std::fs::hard_link(&old_physical, &new_physical).map_err(|e| host_err("link", e))?;
        self.entry_reply(&new_physical).map_err(Errno::from)
    }

    async fn open(&self, _req: Request, path: &OsStr, flags: u32) -> FuseResult<ReplyOpen> {
        debug!("open: path={:?} flags={:#x}", path, flags);
        let physical = self.resolve(path).map_err(|e| host_err("open", e))?;
        let file = Self::open_physical(&physical, flags as i32, None)
            .map_err(|e| host_err("open", e))?;
        let fh = self.handles.insert(OpenHandle::File(file));
        debug!("open: path={:?} fh={}", path, fh);
        Ok(ReplyOpen { fh, flags: 0 })
    }

    async fn create(
        &self,
        _req: Request,
        parent: &OsStr,
        name: &OsStr,
        mode: u32,
        flags: u32,
    ) -> FuseResult<ReplyCreated> {
        debug!(
            "create: parent={:?} name={:?} mode={:#o} flags={:#x}",
            parent, name, mode, flags
        );
        let physical = self
            .resolve_child(parent, name)
            .map_err(|e| host_err("create", e))?;
        let file = Self::open_physical(&physical, flags as i32 | libc::O_CREAT, Some(mode))
            .map_err(|e| host_err("create", e))?;
        let attr = self.stat_handle_presented(&file).map_err(Errno::from)?;
        let fh = self.handles.insert(OpenHandle::File(file));
        debug!("create: parent={:?} name={:?} fh={}", parent, name, fh);
        Ok(ReplyCreated {
            ttl: TTL,
            attr,
            generation: 0,
            fh,
            flags: 0,
        })
    }

    async fn read(
        &self,
        _req: Request,
        path: Option<&OsStr>,
        fh: u64,
        offset: u64,
        size: u32,
    ) -> FuseResult<ReplyData> {
        debug!(
            "read: path={:?} fh={} offset={} size={}",
            path, fh, offset, size
        );
        let handle = self.handle(fh).map_err(|e| host_err("read", e))?;
        let file = handle.as_file().map_err(|e| host_err("read", e))?;
        let mut buf = vec![0u8; size as usize];
        let n = file
            .read_at(&mut buf, offset)
            .map_err(|e| host_err("read", e))?;
        buf.truncate(n);
        Ok(ReplyData {
            data: Bytes::from(buf),
        })
    }

    async fn write(
        &self,
        _req: Request,
        path: Option<&OsStr>,
        fh: u64,
        offset: u64,
        data: &[u8],
        _flags: u32,
    ) -> FuseResult<ReplyWrite> {
        debug!(
            "write: path={:?} fh={} offset={} len={}",
            path,
            fh,
            offset,
            data.len()
        );
        let handle = self.handle(fh).map_err(|e| host_err("write", e))?;
        let file = handle.as_file().map_err(|e| host_err("write", e))?;
        let written = file
            .write_at(data, offset)
            .map_err(|e| host_err("write", e))?;
        Ok(ReplyWrite {
            written: written as u32,
        })
    }

    async fn statfs(&self, _req: Request, path: &OsStr) -> FuseResult<ReplyStatFs> {
        debug!("statfs: path={:?}", path);
        let physical = self.resolve(path).map_err(|e| host_err("statfs", e))?;
        let stat = statvfs(&physical)
            .map_err(nix_err)
            .map_err(|e| host_err("statfs", e))?;
        Ok(ReplyStatFs {
            blocks: stat.blocks() as u64,
            bfree: stat.blocks_free() as u64,
            bavail: stat.blocks_available() as u64,
            files: stat.files() as u64,
            ffree: stat.files_free() as u64,
            bsize: stat.block_size() as u32,
            namelen: stat.name_max() as u32,
            frsize: stat.fragment_size() as u32,
        })
    }

    async fn release(
        &self,
        _req: Request,
        path: Option<&OsStr>,
        fh: u64,
        _flags: u32,
        _lock_owner: u64,
        _flush: bool,
    ) -> FuseResult<()> {
        debug!("release: path={:?} fh={}", path, fh);
        match self.handles.remove(fh) {
            // Dropping the handle closes the descriptor.
            Some(_) => Ok(()),
            None => Err(libc::EBADF.into()),
        }
    }

    async fn fsync(
        &self,
        _req: Request,
        path: Option<&OsStr>,
        fh: u64,
        datasync: bool,
    ) -> FuseResult<()> {
        debug!("fsync: path={:?} fh={} datasync={}", path, fh, datasync);
        let handle = self.handle(fh).map_err(|e| host_err("fsync", e))?;
        let file = handle.as_file().map_err(|e| host_err("fsync", e))?;
        if datasync {
            file.sync_data().map_err(|e| host_err("fsync", e))
        } else {
            file.sync_all().map_err(|e| host_err("fsync", e))
        }
    }

    async fn flush(
        &self,
        _req: Request,
        path: Option<&OsStr>,
        fh: u64,
        _lock_owner: u64,
    ) -> FuseResult<()> {
        debug!("flush: path={:?} fh={}", path, fh);
        let handle = self.handle(fh).map_err(|e| host_err("flush", e))?;
        let file = handle.as_file().map_err(|e| host_err("flush", e))?;
        file.sync_all().map_err(|e| host_err("flush", e))
    }

    async fn access(&self, _req: Request, path: &OsStr, mask: u32) -> FuseResult<()> {
        debug!("access: path={:?} mask={:#o}", path, mask);
        let physical = self.resolve(path).map_err(|e| host_err("access", e))?;
        access(&physical, AccessFlags::from_bits_truncate(mask as i32))
            .map_err(nix_err)
            .map_err(|e| host_err("access", e))
    }

    async fn setxattr(
        &self,
        _req: Request,
        path: &OsStr,
        name: &OsStr,
        value: &[u8],
        flags: u32,
        _position: u32,
    ) -> FuseResult<()> {
        debug!(
            "setxattr: path={:?} name={:?} len={} flags={}",
            path,
            name,
            value.len(),
            flags
        );
        let physical = self.resolve(path).map_err(|e| host_err("setxattr", e))?;
        let physical = cpath(&physical).map_err(|e| host_err("setxattr", e))?;
        let name = cname(name).map_err(|e| host_err("setxattr", e))?;
        let rc = unsafe {
            libc::lsetxattr(
                physical.as_ptr(),
                name.as_ptr(),
                value.as_ptr() as *const libc::c_void,
                value.len(),
                flags as libc::c_int,
            )
        };
        if rc < 0 {
            return Err(host_err("setxattr", io::Error::last_os_error()));
        }
        Ok(())
    }

    async fn getxattr(
        &self,
        _req: Request,
        path: &OsStr,
        name: &OsStr,
        size: u32,
    ) -> FuseResult<ReplyXAttr> {
        debug!("getxattr: path={:?} name={:?} size={}", path, name, size);
        let physical = self.resolve(path).map_err(|e| host_err("getxattr", e))?;
        let physical = cpath(&physical).map_err(|e| host_err("getxattr", e))?;
        let name = cname(name).map_err(|e| host_err("getxattr", e))?;
        if size == 0 {
            let len = unsafe {
                libc::lgetxattr(physical.as_ptr(), name.as_ptr(), std::ptr::null_mut(), 0)
            };
            if len < 0 {
                return Err(host_err("getxattr", io::Error::last_os_error()));
            }
            Ok(ReplyXAttr::Size(len as u32))
        } else {
            let mut buf = vec![0u8; size as usize];
            let len = unsafe {
                libc::lgetxattr(
                    physical.as_ptr(),
                    name.as_ptr(),
                    buf.as_mut_ptr() as *mut libc::c_void,
                    buf.len(),
                )
            };
            if len < 0 {
                return Err(host_err("getxattr", io::Error::last_os_error()));
            }
            buf.truncate(len as usize);
            Ok(ReplyXAttr::Data(Bytes::from(buf)))
        }
    }

    async fn listxattr(&self, _req: Request, path: &OsStr, size: u32) -> FuseResult<ReplyXAttr> {
        debug!("listxattr: path={:?} size={}", path, size);
        let physical = self.resolve(path).map_err(|e| host_err("listxattr", e))?;
        let physical = cpath(&physical).map_err(|e| host_err("listxattr", e))?;
        if size == 0 {
            let len = unsafe { libc::llistxattr(physical.as_ptr(), std::ptr::null_mut(), 0) };
            if len < 0 {
                return Err(host_err("listxattr", io::Error::last_os_error()));
            }
            Ok(ReplyXAttr::Size(len as u32))
        } else {
            let mut buf = vec![0u8; size as usize];
            let len = unsafe {
                libc::llistxattr(
                    physical.as_ptr(),
                    buf.as_mut_ptr() as *mut libc::c_char,
                    buf.len(),
                )
            };
            if len < 0 {
                return Err(host_err("listxattr", io::Error::last_os_error()));
            }
            buf.truncate(len as usize);
            Ok(ReplyXAttr::Data(Bytes::from(buf)))
        }
    }

    async fn removexattr(&self, _req: Request, path: &OsStr, name: &OsStr) -> FuseResult<()> {
        debug!("removexattr: path={:?} name={:?}", path, name);
        let physical = self.resolve(path).map_err(|e| host_err("removexattr", e))?;
        let physical = cpath(&physical).map_err(|e| host_err("removexattr", e))?;
        let name = cname(name).map_err(|e| host_err("removexattr", e))?;
        let rc = unsafe { libc::lremovexattr(physical.as_ptr(), name.as_ptr()) };
        if rc < 0 {
            return Err(host_err("removexattr", io::Error::last_os_error()));
        }
        Ok(())
    }

    async fn fallocate(
        &self,
        _req: Request,
        path: Option<&OsStr>,
        fh: u64,
        offset: u64,
        length: u64,
        mode: u32,
    ) -> FuseResult<()> {
        debug!(
            "fallocate: path={:?} fh={} offset={} length={} mode={}",
            path, fh, offset, length, mode
        );
        let handle = self.handle(fh).map_err(|e| host_err("fallocate", e))?;
        let file = handle.as_file().map_err(|e| host_err("fallocate", e))?;
        let rc = unsafe {
            libc::fallocate(
                file.as_raw_fd(),
                mode as libc::c_int,
                offset as libc::off_t,
                length as libc::off_t,
            )
        };
        if rc < 0 {
            return Err(host_err("fallocate", io::Error::last_os_error()));
        }
        Ok(())
    }

    async fn getlk(
        &self,
        _req: Request,
        path: Option<&OsStr>,
        fh: u64,
        _lock_owner: u64,
        start: u64,
        end: u64,
        r#type: u32,
        pid: u32,
    ) -> FuseResult<ReplyLock> {
        debug!(
            "getlk: path={:?} fh={} start={} end={} type={}",
            path, fh, start, end, r#type
        );
        let handle = self.handle(fh).map_err(|e| host_err("getlk", e))?;
        let file = handle.as_file().map_err(|e| host_err("getlk", e))?;
        let mut fl: libc::flock = unsafe { std::mem::zeroed() };
        fl.l_type = r#type as libc::c_short;
        fl.l_whence = libc::SEEK_SET as libc::c_short;
        fl.l_start = start as libc::off_t;
        fl.l_len = lock_len(start, end);
        fl.l_pid = pid as libc::pid_t;
        let rc = unsafe { libc::fcntl(file.as_raw_fd(), libc::F_GETLK, &mut fl) };
        if rc < 0 {
            return Err(host_err("getlk", io::Error::last_os_error()));
        }
        Ok(ReplyLock {
            start: fl.l_start as u64,
            end: lock_end(fl.l_start as i64, fl.l_len as i64),
            r#type: fl.l_type as u32,
            pid: fl.l_pid as u32,
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn setlk(
        &self,
        _req: Request,
        path: Option<&OsStr>,
        fh: u64,
        _lock_owner: u64,
        start: u64,
        end: u64,
        r#type: u32,
        pid: u32,
        block: bool,
    ) -> FuseResult<()> {
        debug!(
            "setlk: path={:?} fh={} start={} end={} type={} block={}",
            path, fh, start, end, r#type, block
        );
        let handle = self.handle(fh).map_err(|e| host_err("setlk", e))?;
        let file = handle.as_file().map_err(|e| host_err("setlk", e))?;
        let mut fl: libc::flock = unsafe { std::mem::zeroed() };
        fl.l_type = r#type as libc::c_short;
        fl.l_whence = libc::SEEK_SET as libc::c_short;
        fl.l_start = start as libc::off_t;
        fl.l_len = lock_len(start, end);
        fl.l_pid = pid as libc::pid_t;
        let cmd = if block { libc::F_SETLKW } else { libc::F_SETLK };
        let rc = unsafe { libc::fcntl(file.as_raw_fd(), cmd, &fl) };
        if rc < 0 {
            return Err(host_err("setlk", io::Error::last_os_error()));
        }
        Ok(())
    }

    async fn opendir(&self, _req: Request, path: &OsStr, flags: u32) -> FuseResult<ReplyOpen> {
        debug!("opendir: path={:?} flags={:#x}", path, flags);
        let physical = self.resolve(path).map_err(|e| host_err("opendir", e))?;
        let stream = DirStream::open(&physical).map_err(|e| host_err("opendir", e))?;
        let fh = self.handles.insert(OpenHandle::Dir(stream));
        Ok(ReplyOpen { fh, flags: 0 })
    }

    async fn readdir<'a>(
        &'a self,
        _req: Request,
        path: &'a OsStr,
        fh: u64,
        offset: i64,
    ) -> FuseResult<ReplyDirectory<Self::DirEntryStream<'a>>> {
        debug!("readdir: path={:?} fh={} offset={}", path, fh, offset);
        let handle = self.handle(fh).map_err(|e| host_err("readdir", e))?;
        let dir = handle.as_dir().map_err(|e| host_err("readdir", e))?;

        let mut all: Vec<DirectoryEntry> = Vec::with_capacity(dir.entries().len() + 2);
        all.push(DirectoryEntry {
            kind: FileType::Directory,
            name: OsString::from("."),
            offset: 1,
        });
        all.push(DirectoryEntry {
            kind: FileType::Directory,
            name: OsString::from(".."),
            offset: 2,
        });
        for (i, entry) in dir.entries().iter().enumerate() {
            all.push(DirectoryEntry {
                kind: entry.kind,
                name: entry.name.clone(),
                offset: (i as i64) + 3,
            });
        }

        let start = if offset <= 0 { 0 } else { offset as usize };
        let slice = if start >= all.len() {
            Vec::new()
        } else {
            all[start..].to_vec()
        };
        let entries: Self::DirEntryStream<'a> = Box::pin(stream::iter(slice.into_iter().map(Ok)));
        Ok(ReplyDirectory { entries })
    }

    async fn readdirplus<'a>(
        &'a self,
        _req: Request,
        parent: &'a OsStr,
        fh: u64,
        offset: u64,
        _lock_owner: u64,
    ) -> FuseResult<ReplyDirectoryPlus<Self::DirEntryPlusStream<'a>>> {
        debug!("readdirplus: parent={:?} fh={} offset={}", parent, fh, offset);
        let handle = self.handle(fh).map_err(|e| host_err("readdirplus", e))?;
        let dir = handle.as_dir().map_err(|e| host_err("readdirplus", e))?;

        let self_attr = self.stat_presented(dir.physical()).map_err(Errno::from)?;
        let parent_physical = dir.physical().parent().unwrap_or_else(|| dir.physical());
        let parent_attr = match self.stat_presented(parent_physical) {
            Ok(attr) => attr,
            Err(_) => self_attr.clone(),
        };

        let mut all: Vec<DirectoryEntryPlus> = Vec::with_capacity(dir.entries().len() + 2);
        all.push(DirectoryEntryPlus {
            kind: FileType::Directory,
            name: OsString::from("."),
            offset: 1,
            attr: self_attr,
            entry_ttl: TTL,
            attr_ttl: TTL,
        });
        all.push(DirectoryEntryPlus {
            kind: FileType::Directory,
            name: OsString::from(".."),
            offset: 2,
            attr: parent_attr,
            entry_ttl: TTL,
            attr_ttl: TTL,
        });
        for (i, entry) in dir.entries().iter().enumerate() {
            // Entries that vanished since the stream was opened are skipped,
            // mirroring what a host readdir would no longer return.
            let Ok(attr) = self.stat_presented(&dir.physical().join(&entry.name)) else {
                continue;
            };
            all.push(DirectoryEntryPlus {
                kind: entry.kind,
                name: entry.name.clone(),
                offset: (i as i64) + 3,
                attr,
                entry_ttl: TTL,
                attr_ttl: TTL,
            });
        }

        let start = if offset == 0 { 0 } else { offset as usize };
        let slice = if start >= all.len() {
            Vec::new()
        } else {
            all[start..].to_vec()
        };
        let entries: Self::DirEntryPlusStream<'a> =
            Box::pin(stream::iter(slice.into_iter().map(Ok)));
        Ok(ReplyDirectoryPlus { entries })
    }

    async fn releasedir(&self, _req: Request, path: &OsStr, fh: u64, _flags: u32) -> FuseResult<()> {
        debug!("releasedir: path={:?} fh={}", path, fh);
        match self.handles.remove(fh) {
            Some(_) => Ok(()),
            None => Err(libc::EBADF.into()),
        }
    }

    // Deliberately not supported; directory syncs have never been part of
    // this filesystem's contract.
    async fn fsyncdir(
        &self,
        _req: Request,
        path: &OsStr,
        fh: u64,
        _datasync: bool,
    ) -> FuseResult<()> {
        debug!("fsyncdir: path={:?} fh={}", path, fh);
        Err(libc::ENOSYS.into())
    }
}

fn lock_len(start: u64, end: u64) -> libc::off_t {
    if end >= LOCK_OFFSET_MAX {
        0
    } else {
        end.saturating_sub(start) as libc::off_t + 1
    }
}

fn lock_end(start: i64, len: i64) -> u64 {
    if len == 0 {
        LOCK_OFFSET_MAX
    } else {
        (start + len - 1) as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MountConfig;
    use std::os::unix::fs::MetadataExt;
    use tempfile::TempDir;

    const Y2000_OFFSET: i64 = 946_684_800;

    fn shifted_fs(epoch_year: i32) -> (TempDir, EpochShiftFs) {
        let dir = tempfile::tempdir().unwrap();
        let config = MountConfig::new(dir.path().to_path_buf(), epoch_year).unwrap();
        (dir, EpochShiftFs::new(config))
    }

    #[test]
    fn reported_attributes_are_shifted() {
        let (dir, fs) = shifted_fs(2000);
        let physical = dir.path().join("file");
        std::fs::write(&physical, b"data").unwrap();

        let resolved = fs.resolve(OsStr::new("/file")).unwrap();
        assert_eq!(resolved, physical);

        let meta = std::fs::symlink_metadata(&physical).unwrap();
        let attr = fs.stat_presented(&resolved).unwrap();
        assert_eq!(attr.mtime.sec, meta.mtime() + Y2000_OFFSET);
        assert_eq!(attr.atime.sec, meta.atime() + Y2000_OFFSET);
        assert_eq!(attr.ctime.sec, meta.ctime() + Y2000_OFFSET);
        assert_eq!(attr.size, 4);
    }

    #[test]
    fn stored_times_are_unshifted() {
        let (dir, fs) = shifted_fs(2000);
        let physical = dir.path().join("file");
        std::fs::write(&physical, b"data").unwrap();

        // The caller sets a time in the presented epoch...
        let presented = 1_000_000_000i64;
        fs.set_times_presented(
            Some(&physical),
            None,
            Some(Timestamp::new(presented, 0)),
            Some(Timestamp::new(presented, 0)),
        )
        .unwrap();

        // ...and the disk records the unshifted instant.
        let meta = std::fs::symlink_metadata(&physical).unwrap();
        assert_eq!(meta.mtime(), presented - Y2000_OFFSET);
        assert_eq!(meta.atime(), presented - Y2000_OFFSET);

        // Reading it back through the mount shows the caller's time again.
        let attr = fs.stat_presented(&physical).unwrap();
        assert_eq!(attr.mtime.sec, presented);
    }

    #[test]
    fn partial_time_update_leaves_other_untouched() {
        let (dir, fs) = shifted_fs(2000);
        let physical = dir.path().join("file");
        std::fs::write(&physical, b"data").unwrap();
        let before = std::fs::symlink_metadata(&physical).unwrap().atime();

        fs.set_times_presented(
            Some(&physical),
            None,
            None,
            Some(Timestamp::new(Y2000_OFFSET + 42, 0)),
        )
        .unwrap();

        let meta = std::fs::symlink_metadata(&physical).unwrap();
        assert_eq!(meta.mtime(), 42);
        assert_eq!(meta.atime(), before);
    }

    #[test]
    fn default_epoch_presents_identity() {
        let (dir, fs) = shifted_fs(0);
        let physical = dir.path().join("file");
        std::fs::write(&physical, b"data").unwrap();

        let meta = std::fs::symlink_metadata(&physical).unwrap();
        let attr = fs.stat_presented(&physical).unwrap();
        assert_eq!(attr.mtime.sec, meta.mtime());
    }

    #[test]
    fn handle_lifecycle_does_not_leak() {
        let (dir, fs) = shifted_fs(2000);
        let physical = dir.path().join("file");
        std::fs::write(&physical, b"0123456789").unwrap();

        let file =
            EpochShiftFs::open_physical(&physical, libc::O_RDWR, None).unwrap();
        let fh = fs.handles.insert(OpenHandle::File(file));

        let handle = fs.handle(fh).unwrap();
        let file = handle.as_file().unwrap();
        let mut buf = [0u8; 4];
        file.read_at(&mut buf, 2).unwrap();
        assert_eq!(&buf, b"2345");
        file.write_at(b"xx", 8).unwrap();
        drop(handle);

        assert!(fs.handles.remove(fh).is_some());
        assert!(fs.handles.is_empty());
        assert!(fs.handle(fh).is_err());
        assert_eq!(std::fs::read(&physical).unwrap(), b"01234567xx");
    }

    #[test]
    fn host_errors_pass_through_unchanged() {
        let (dir, fs) = shifted_fs(2000);
        let resolved = fs.resolve(OsStr::new("/missing")).unwrap();

        let through_layer =
            EpochShiftFs::open_physical(&resolved, libc::O_RDONLY, None).unwrap_err();
        let direct = File::open(dir.path().join("missing")).unwrap_err();
        assert_eq!(through_layer.raw_os_error(), direct.raw_os_error());
        assert_eq!(through_layer.raw_os_error(), Some(libc::ENOENT));
    }

    #[test]
    fn over_long_virtual_path_is_name_too_long() {
        let (_dir, fs) = shifted_fs(2000);
        let long = format!("/{}", "x".repeat(crate::resolver::MAX_PATH_LEN));
        let err = fs.resolve(OsStr::new(&long)).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::ENAMETOOLONG));
    }

    #[test]
    fn lock_range_conversion() {
        // A whole-file lock request uses the FUSE end-of-file sentinel.
        assert_eq!(lock_len(0, LOCK_OFFSET_MAX), 0);
        assert_eq!(lock_len(10, 19), 10);
        assert_eq!(lock_end(0, 0), LOCK_OFFSET_MAX);
        assert_eq!(lock_end(10, 10), 19);
    }
}

#[cfg(all(test, target_os = "linux"))]
mod mount_tests {
    use super::*;
    use crate::config::MountConfig;
    use crate::mount::mount_unprivileged;
    use std::io::Write;
    use std::os::unix::fs::MetadataExt;
    use std::time::Duration as StdDuration;

    // Real-mount smoke test, gated like the other FUSE suites in this
    // family: set EPOCHSHIFT_FUSE_TEST=1 to enable (needs fusermount3).
    #[tokio::test]
    async fn smoke_mount_and_basic_ops() {
        if std::env::var("EPOCHSHIFT_FUSE_TEST").ok().as_deref() != Some("1") {
            eprintln!("skip fuse mount test: set EPOCHSHIFT_FUSE_TEST=1 to enable");
            return;
        }

        const Y2000_OFFSET: i64 = 946_684_800;

        let base = tempfile::tempdir().expect("tmp base");
        let mnt = tempfile::tempdir().expect("tmp mount");
        let config = MountConfig::new(base.path().to_path_buf(), 2000).unwrap();
        let fs = EpochShiftFs::new(config);

        let handle = match mount_unprivileged(fs, mnt.path()).await {
            Ok(h) => h,
            Err(e) => {
                eprintln!("skip fuse test: mount failed: {e}");
                return;
            }
        };
        tokio::time::sleep(StdDuration::from_millis(1000)).await;

        let dir = mnt.path().join("a");
        std::fs::create_dir(&dir).expect("mkdir");
        let file_path = dir.join("hello.txt");
        {
            let mut f = std::fs::File::create(&file_path).expect("create file");
            f.write_all(b"abc").expect("write");
            f.flush().expect("flush");
        }
        assert_eq!(std::fs::read(&file_path).expect("read back"), b"abc");

        let names: Vec<_> = std::fs::read_dir(&dir)
            .expect("readdir")
            .filter_map(|e| e.ok())
            .map(|e| e.file_name())
            .collect();
        assert!(names.iter().any(|n| n.to_string_lossy() == "hello.txt"));

        // The mounted view runs half a century ahead of the disk.
        let mounted_mtime = std::fs::metadata(&file_path).expect("stat").mtime();
        let physical_mtime = std::fs::metadata(base.path().join("a/hello.txt"))
            .expect("stat physical")
            .mtime();
        assert_eq!(mounted_mtime, physical_mtime + Y2000_OFFSET);

        std::fs::remove_file(&file_path).expect("unlink");

        if let Err(e) = handle.unmount().await {
            eprintln!("unmount error: {e}");
        }
    }
}
