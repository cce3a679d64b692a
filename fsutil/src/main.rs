//! fsutil command line
//!
//! Thin wrapper over the library for inspecting and operating on a node's
//! block devices by hand. Results are printed to stdout, logs go to stderr.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use tracing::{Level, info};
use tracing_subscriber::FmtSubscriber;

use fsutil::platform::{self, BackendKind};
use fsutil::{FormatContext, SysPaths};

#[derive(ValueEnum, Debug, Clone, Copy)]
enum Backend {
    Host,
    Mock,
}

impl From<Backend> for BackendKind {
    fn from(b: Backend) -> Self {
        match b {
            Backend::Host => BackendKind::Host,
            Backend::Mock => BackendKind::Mock,
        }
    }
}

/// CLI arguments for fsutil
#[derive(Parser, Debug)]
#[command(name = "fsutil")]
#[command(about = "Block device, mount and rescan utility for storage nodes")]
struct Args {
    /// Prefix for sysfs, procfs and /dev lookups (e.g. /noderoot)
    #[arg(long, env = "FSUTIL_SYS_ROOT")]
    sys_root: Option<PathBuf>,

    /// Re-reads of the mount table before giving up on a stable snapshot
    #[arg(long, default_value_t = fsutil::config::DEFAULT_MOUNTINFO_RETRIES)]
    mountinfo_retries: usize,

    #[arg(long, value_enum, default_value = "host")]
    backend: Backend,

    /// Print results as JSON
    #[arg(long)]
    json: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List mounts
    Mounts,
    /// List mounts of one device
    DevMounts { device: String },
    /// Resolve a volume WWN to its device
    Wwn { wwn: String },
    /// Resolve an iSCSI portal IP and LUN to devices
    Iplun { ip: String, lun: u32 },
    /// Rescan SCSI hosts, optionally restricted to target IQNs/WWNs
    Rescan {
        #[arg(long, default_value = "")]
        lun: String,
        targets: Vec<String>,
    },
    /// Issue a LIP on every FC host
    Lip,
    /// List local FC port WWNs
    FcWwns,
    /// Delete a SCSI block device
    Remove { device: String },
    /// List /sys/block devices backing a volume WWN
    Sysblock { wwn: String },
    /// Find the NVMe controller of a device
    NvmeController { device: String },
    /// Report mpath/PowerPath/native devices and mount point for a device
    MountInfo { device: String },
    /// Report the filesystem on a device
    DiskFormat { disk: String },
    /// Mount a device, formatting it first if blank
    FormatMount {
        source: String,
        target: String,
        #[arg(long, default_value = "")]
        fs_type: String,
        #[arg(short = 'o', long = "option")]
        options: Vec<String>,
        #[arg(long)]
        no_discard: bool,
    },
    /// Unmount a path
    Unmount { target: String },
    /// Grow a mounted filesystem to its device size
    ResizeFs {
        mountpoint: String,
        #[arg(long, default_value = "")]
        device: String,
        #[arg(long, default_value = "")]
        ppath: String,
        #[arg(long, default_value = "")]
        mpath: String,
        #[arg(long, default_value = "")]
        fs_type: String,
    },
    /// Resize a multipath map
    ResizeMultipath { device: String },
    /// Run multipath with the given flags
    Multipath {
        /// Seconds before multipath is killed
        #[arg(long, default_value_t = 30)]
        timeout: u64,
        #[arg(long)]
        chroot: Option<String>,
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
    /// Filesystem usage of a path
    FsInfo { path: String },
}

fn emit<T: Serialize + std::fmt::Debug>(json: bool, value: &T) -> Result<(), serde_json::Error> {
    if json {
        println!("{}", serde_json::to_string_pretty(value)?);
    } else {
        println!("{value:#?}");
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let level = match args.log_level.as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let mut paths = match &args.sys_root {
        Some(root) => SysPaths::rooted(root),
        None => SysPaths::default(),
    };
    paths.mountinfo_retries = args.mountinfo_retries;

    info!(
        sys_root = ?args.sys_root,
        backend = ?args.backend,
        command = ?args.command,
        "Starting fsutil"
    );

    let fs = platform::select(args.backend.into(), paths);
    let json = args.json;

    match args.command {
        Command::Mounts => emit(json, &fs.get_mounts().await?)?,
        Command::DevMounts { device } => emit(json, &fs.get_dev_mounts(&device).await?)?,
        Command::Wwn { wwn } => emit(json, &fs.wwn_to_device_path(&wwn).await?)?,
        Command::Iplun { ip, lun } => {
            emit(json, &fs.target_ip_lun_to_device_path(&ip, lun).await?)?
        }
        Command::Rescan { lun, targets } => fs.rescan_scsi_host(&targets, &lun).await?,
        Command::Lip => fs.issue_lip_to_all_fc_hosts().await?,
        Command::FcWwns => emit(json, &fs.get_fc_host_port_wwns().await?)?,
        Command::Remove { device } => fs.remove_block_device(&device).await?,
        Command::Sysblock { wwn } => {
            emit(json, &fs.get_sys_block_devices_for_volume_wwn(&wwn).await?)?
        }
        Command::NvmeController { device } => {
            emit(json, &fs.get_nvme_controller(&device).await?)?
        }
        Command::MountInfo { device } => {
            emit(json, &fs.get_mount_info_from_device(&device).await?)?
        }
        Command::DiskFormat { disk } => emit(json, &fs.get_disk_format(&disk).await?)?,
        Command::FormatMount {
            source,
            target,
            fs_type,
            options,
            no_discard,
        } => {
            let ctx = FormatContext {
                no_discard,
                request_id: None,
            };
            fs.format_and_mount(&ctx, &source, &target, &fs_type, &options)
                .await?
        }
        Command::Unmount { target } => fs.unmount(&target).await?,
        Command::ResizeFs {
            mountpoint,
            device,
            ppath,
            mpath,
            fs_type,
        } => {
            fs.resize_fs(&mountpoint, &device, &ppath, &mpath, &fs_type)
                .await?
        }
        Command::ResizeMultipath { device } => fs.resize_multipath(&device).await?,
        Command::Multipath {
            timeout,
            chroot,
            args,
        } => {
            let out = fs
                .multipath_command(Duration::from_secs(timeout), chroot.as_deref(), &args)
                .await?;
            print!("{}", String::from_utf8_lossy(&out));
        }
        Command::FsInfo { path } => emit(json, &fs.fs_info(&path).await?)?,
    }

    Ok(())
}
