use std::path::{Path, PathBuf};

use clap::Parser;
use log::info;
use tokio::signal;

use epochshift_fs::config::MountConfig;
use epochshift_fs::mount;
use epochshift_fs::passthrough::EpochShiftFs;

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Passthrough filesystem presenting timestamps in a shifted epoch"
)]
struct Args {
    /// Directory where the mounted tree is physically stored
    #[arg(long, env = "EPOCHSHIFT_BASE_PATH")]
    base_path: PathBuf,

    /// Calendar year presented as the timestamp epoch (0 = local year of
    /// Unix time zero, i.e. no shift)
    #[arg(long, env = "EPOCHSHIFT_EPOCH_YEAR", default_value_t = 0)]
    epoch_year: i32,

    /// Append the diagnostic trace to this file instead of stderr
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Use a privileged mount instead of fusermount3 (default false)
    #[arg(long, default_value_t = false)]
    privileged: bool,

    /// Path to mount point
    mountpoint: PathBuf,
}

fn init_logging(log_file: Option<&Path>) {
    let mut builder = env_logger::Builder::from_default_env();
    if let Some(path) = log_file {
        match std::fs::OpenOptions::new().create(true).append(true).open(path) {
            Ok(file) => {
                builder.target(env_logger::Target::Pipe(Box::new(file)));
            }
            // The trace is best-effort; a broken sink must not stop the mount.
            Err(err) => {
                eprintln!("epochshift-fs: cannot open log file {path:?}: {err}; using stderr")
            }
        }
    }
    builder.init();
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    init_logging(args.log_file.as_deref());

    let config = match MountConfig::new(args.base_path, args.epoch_year) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("epochshift-fs: {err}");
            std::process::exit(1);
        }
    };
    info!(
        "mounting {:?} at {:?} (epoch year {})",
        config.base_path, args.mountpoint, config.epoch_year
    );
    let fs = EpochShiftFs::new(config);

    let mut mount_handle = if args.privileged {
        mount::mount(fs, &args.mountpoint)
            .await
            .expect("mount failed")
    } else {
        mount::mount_unprivileged(fs, &args.mountpoint)
            .await
            .expect("unprivileged mount failed")
    };

    let handle = &mut mount_handle;
    tokio::select! {
        res = handle => res.unwrap(),
        _ = signal::ctrl_c() => {
            mount_handle.unmount().await.unwrap();
        }
    }
}
