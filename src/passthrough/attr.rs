//! Conversion from backing-store metadata to FUSE attributes.
//!
//! The three timestamps are the only fields that change on their way out:
//! they are run through the epoch shift. Everything else is forwarded as the
//! backing filesystem reported it.

use std::fs::Metadata;
use std::os::unix::fs::{FileTypeExt, MetadataExt};

use rfuse3::FileType;
use rfuse3::path::reply::FileAttr;

use crate::epoch::EpochShift;

pub fn file_kind(file_type: std::fs::FileType) -> FileType {
    if file_type.is_dir() {
        FileType::Directory
    } else if file_type.is_symlink() {
        FileType::Symlink
    } else if file_type.is_block_device() {
        FileType::BlockDevice
    } else if file_type.is_char_device() {
        FileType::CharDevice
    } else if file_type.is_fifo() {
        FileType::NamedPipe
    } else if file_type.is_socket() {
        FileType::Socket
    } else {
        FileType::RegularFile
    }
}

/// Build the attribute reply for `meta`, presenting atime/mtime/ctime in the
/// shifted epoch.
pub fn presented_attr(meta: &Metadata, shift: &EpochShift) -> FileAttr {
    FileAttr {
        size: meta.size(),
        blocks: meta.blocks(),
        atime: shift.present_timestamp(meta.atime(), meta.atime_nsec() as u32),
        mtime: shift.present_timestamp(meta.mtime(), meta.mtime_nsec() as u32),
        ctime: shift.present_timestamp(meta.ctime(), meta.ctime_nsec() as u32),
        kind: file_kind(meta.file_type()),
        perm: (meta.mode() & 0o7777) as u16,
        nlink: meta.nlink() as u32,
        uid: meta.uid(),
        gid: meta.gid(),
        rdev: meta.rdev() as u32,
        blksize: meta.blksize() as u32,
    }
}
