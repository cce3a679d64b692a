//! Online growth of filesystems and multipath maps after a volume expand.

use tracing::info;

use crate::Fs;
use crate::error::{FsError, Result};
use crate::exec::{CommandRunner, run_checked};
use crate::validate::{clean_path, validate_path};

fn checked_path(path: &str) -> Result<String> {
    let cleaned = clean_path(path).to_string_lossy().into_owned();
    validate_path(&cleaned)?;
    Ok(cleaned)
}

impl<R: CommandRunner> Fs<R> {
    /// Grow the filesystem on a volume to fill its device.
    ///
    /// ext3/ext4 grow through the device, xfs through its mount point. A
    /// PowerPath pseudo device has its partition table re-read first; a
    /// multipath map redirects both device and mount point to
    /// `/dev/mapper/<map>`.
    pub fn resize_fs(
        &self,
        mountpoint: &str,
        device_path: &str,
        ppath_device: &str,
        mpath_device: &str,
        fs_type: &str,
    ) -> Result<()> {
        let mut device_path = device_path.to_string();
        let mut mountpoint = mountpoint.to_string();

        if !ppath_device.is_empty() {
            device_path = format!("/dev/{}", ppath_device);
            self.reread_partition_table(&device_path)?;
        }
        if !mpath_device.is_empty() {
            device_path = format!("/dev/mapper/{}", mpath_device);
            mountpoint = device_path.clone();
        }

        match fs_type {
            "ext4" | "ext3" => {
                let device = checked_path(&device_path)?;
                run_checked(&self.runner, "resize2fs", &[device])?;
                info!(device = %device_path, fs_type = %fs_type, "Filesystem resized");
            }
            "xfs" => {
                let target = checked_path(&mountpoint)?;
                run_checked(&self.runner, "xfs_growfs", &["-d".to_string(), target])?;
                info!(mountpoint = %mountpoint, "Filesystem resized");
            }
            other => return Err(FsError::UnsupportedResize(other.to_string())),
        }
        Ok(())
    }

    /// Have `multipathd` pick up the new size of the paths under a map.
    pub fn resize_multipath(&self, device_name: &str) -> Result<()> {
        let path = checked_path(device_name)?;
        let args = vec!["resize".to_string(), "map".to_string(), path];
        run_checked(&self.runner, "multipathd", &args)?;
        info!(device = %device_name, "Multipath map resized");
        Ok(())
    }

    fn reread_partition_table(&self, device_path: &str) -> Result<()> {
        let path = checked_path(device_path)?;
        run_checked(&self.runner, "blockdev", &["--rereadpt".to_string(), path])?;
        Ok(())
    }

    /// Filesystem type mounted at `mountpoint`.
    pub fn find_fs_type(&self, mountpoint: &str) -> Result<String> {
        let path = checked_path(mountpoint)?;
        let args = vec!["-n".to_string(), "-o".to_string(), "FSTYPE".to_string(), path];
        let output = run_checked(&self.runner, "findmnt", &args)?;
        Ok(output.stdout_str().trim().to_string())
    }
}
