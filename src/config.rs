//! Immutable mount configuration.
//!
//! Built once at process start from the parsed command line and shared
//! read-only with every operation handler for the lifetime of the mount.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("base path {0:?} is not an absolute path")]
    BasePathNotAbsolute(PathBuf),
    #[error("base path {0:?} is not an accessible directory")]
    BasePathNotADirectory(PathBuf),
}

/// Configuration fixed for the lifetime of a mount.
#[derive(Debug, Clone)]
pub struct MountConfig {
    /// Absolute directory under which all virtual paths are stored.
    pub base_path: PathBuf,
    /// Calendar year presented as the timestamp epoch.
    pub epoch_year: i32,
}

impl MountConfig {
    /// Validate and freeze the configuration. An `epoch_year` of zero selects
    /// the default epoch (the local calendar year of Unix time zero).
    pub fn new(base_path: PathBuf, epoch_year: i32) -> Result<Self, ConfigError> {
        if !base_path.is_absolute() {
            return Err(ConfigError::BasePathNotAbsolute(base_path));
        }
        if !base_path.is_dir() {
            return Err(ConfigError::BasePathNotADirectory(base_path));
        }
        let epoch_year = if epoch_year == 0 {
            default_epoch_year()
        } else {
            epoch_year
        };
        Ok(Self {
            base_path,
            epoch_year,
        })
    }
}

/// The local calendar year containing Unix time zero. For UTC and every zone
/// east of it this is 1970, which makes the default epoch shift zero.
pub fn default_epoch_year() -> i32 {
    let t: libc::time_t = 0;
    let mut tm: libc::tm = unsafe { std::mem::zeroed() };
    unsafe {
        libc::tzset();
        libc::localtime_r(&t, &mut tm);
    }
    tm.tm_year + 1900
}
