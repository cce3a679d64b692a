//! Host paths consulted by the library.
//!
//! Every sysfs, procfs and udev location is carried in [`SysPaths`] and
//! handed to [`crate::Fs`] at construction, so nothing reads a hard-coded
//! root directly. Tests (and containerised callers that see the host under
//! `/noderoot`) rebase the whole set with [`SysPaths::rooted`].

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Number of times `/proc/self/mountinfo` is re-read while looking for two
/// identical consecutive snapshots.
pub const DEFAULT_MOUNTINFO_RETRIES: usize = 30;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SysPaths {
    /// Kernel mount table (`/proc/self/mountinfo`)
    pub proc_mountinfo: PathBuf,
    /// Block device directory (`/sys/block`)
    pub sys_block: PathBuf,
    /// SCSI hosts (`/sys/class/scsi_host`)
    pub scsi_host: PathBuf,
    /// Local Fibre Channel HBAs (`/sys/class/fc_host`)
    pub fc_host: PathBuf,
    /// Array-side Fibre Channel ports (`/sys/class/fc_remote_ports`)
    pub fc_remote_ports: PathBuf,
    /// iSCSI sessions (`/sys/class/iscsi_session`)
    pub iscsi_session: PathBuf,
    /// udev by-id links (`/dev/disk/by-id`)
    pub dev_disk_by_id: PathBuf,
    /// udev by-path links (`/dev/disk/by-path`)
    pub dev_disk_by_path: PathBuf,
    pub multipath_bin: PathBuf,
    pub chroot_bin: PathBuf,
    /// PowerPath inquiry tool
    pub pp_inq_bin: PathBuf,
    pub mountinfo_retries: usize,
}

impl Default for SysPaths {
    fn default() -> Self {
        Self {
            proc_mountinfo: PathBuf::from("/proc/self/mountinfo"),
            sys_block: PathBuf::from("/sys/block"),
            scsi_host: PathBuf::from("/sys/class/scsi_host"),
            fc_host: PathBuf::from("/sys/class/fc_host"),
            fc_remote_ports: PathBuf::from("/sys/class/fc_remote_ports"),
            iscsi_session: PathBuf::from("/sys/class/iscsi_session"),
            dev_disk_by_id: PathBuf::from("/dev/disk/by-id"),
            dev_disk_by_path: PathBuf::from("/dev/disk/by-path"),
            multipath_bin: PathBuf::from("/usr/sbin/multipath"),
            chroot_bin: PathBuf::from("/usr/sbin/chroot"),
            pp_inq_bin: PathBuf::from("/noderoot/sbin/pp_inq"),
            mountinfo_retries: DEFAULT_MOUNTINFO_RETRIES,
        }
    }
}

impl SysPaths {
    /// Rebase every sysfs, procfs and `/dev` root beneath `root`.
    ///
    /// Tool binaries keep their absolute locations.
    pub fn rooted(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref();
        let defaults = Self::default();
        Self {
            proc_mountinfo: rebase(root, &defaults.proc_mountinfo),
            sys_block: rebase(root, &defaults.sys_block),
            scsi_host: rebase(root, &defaults.scsi_host),
            fc_host: rebase(root, &defaults.fc_host),
            fc_remote_ports: rebase(root, &defaults.fc_remote_ports),
            iscsi_session: rebase(root, &defaults.iscsi_session),
            dev_disk_by_id: rebase(root, &defaults.dev_disk_by_id),
            dev_disk_by_path: rebase(root, &defaults.dev_disk_by_path),
            ..defaults
        }
    }
}

fn rebase(root: &Path, path: &Path) -> PathBuf {
    root.join(path.strip_prefix("/").unwrap_or(path))
}
