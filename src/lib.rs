//! Passthrough FUSE filesystem with a shifted epoch.
//!
//! The mounted tree is backed one-to-one by a directory on the host
//! filesystem. Every operation is forwarded to the backing directory
//! unchanged, with a single transformation: file timestamps (atime, mtime,
//! ctime) are presented as if they were measured from a configurable epoch
//! year instead of 1970, and timestamps written through the mount are
//! converted back before they reach the disk.
//!
//! Main components:
//! - `config`: the immutable mount configuration (base path + epoch year).
//! - `epoch`: the bidirectional timestamp transform.
//! - `resolver`: virtual path → physical path composition.
//! - `passthrough`: the `PathFilesystem` implementation and its open-handle
//!   table.
//! - `mount`: thin wrappers over the rfuse3 path session for mounting.

#[macro_use]
extern crate log;

pub mod config;
pub mod epoch;
pub mod mount;
pub mod passthrough;
pub mod resolver;
