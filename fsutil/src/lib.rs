//! Host filesystem and block device utilities for storage drivers
//!
//! Discovers, mounts, formats, resizes and rescans block devices on Linux
//! nodes. The kernel interfaces involved are `/proc/self/mountinfo`,
//! `/sys/block`, the SCSI, FC and iSCSI classes under `/sys/class`, and the
//! udev links in `/dev/disk`; `lsblk`, `mount`, `mkfs.*`, `multipath`,
//! `resize2fs` and `xfs_growfs` are driven as external tools.
//!
//! This library provides:
//! - [`Fs`], the host implementation, configured with [`SysPaths`]
//! - [`FsBackend`], the interface drivers code against
//! - [`MockFs`], an in-memory backend for tests

pub mod backend;
pub mod config;
pub mod error;
pub mod exec;
mod fs;
pub mod format;
pub mod lsblk;
pub mod mock;
pub mod mount;
pub mod multipath;
pub mod platform;
pub mod rescan;
pub mod resize;
pub mod resolver;
pub mod stats;
pub mod validate;

pub use backend::FsBackend;
pub use config::SysPaths;
pub use error::{FsError, Result};
pub use format::FormatContext;
pub use fs::Fs;
pub use lsblk::DeviceMountInfo;
pub use mock::MockFs;
pub use mount::MountRecord;
pub use rescan::TargetDevice;
pub use stats::FsStats;
