//! Mount helpers for starting the FUSE session.
//!
//! Thin wrappers over the rfuse3 path session. Only supported on Unix-like
//! systems; on Linux the unprivileged path (fusermount3) is preferred so the
//! mount works without CAP_SYS_ADMIN.

use std::path::Path;

use rfuse3::MountOptions;
use rfuse3::path::Session;
use rfuse3::raw::MountHandle;

use crate::passthrough::EpochShiftFs;

fn default_mount_options() -> MountOptions {
    let uid = unsafe { libc::getuid() };
    let gid = unsafe { libc::getgid() };

    let mut options = MountOptions::default();
    // Keep options minimal; no allow_other so unprivileged mounts work out
    // of the box.
    options.fs_name("epochshift-fs").uid(uid).gid(gid);
    options
}

/// Mount with privileges (requires the mount capability).
pub async fn mount(fs: EpochShiftFs, mountpoint: impl AsRef<Path>) -> std::io::Result<MountHandle> {
    Session::new(default_mount_options())
        .mount(fs, mountpoint)
        .await
}

/// Mount via fusermount3 without privileges.
#[cfg(target_os = "linux")]
pub async fn mount_unprivileged(
    fs: EpochShiftFs,
    mountpoint: impl AsRef<Path>,
) -> std::io::Result<MountHandle> {
    Session::new(default_mount_options())
        .mount_with_unprivileged(fs, mountpoint)
        .await
}

/// Fallback stub for non-Linux targets.
#[cfg(not(target_os = "linux"))]
pub async fn mount_unprivileged(
    _fs: EpochShiftFs,
    _mountpoint: impl AsRef<Path>,
) -> std::io::Result<MountHandle> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "unprivileged FUSE mount is only supported on Linux in this build",
    ))
}
