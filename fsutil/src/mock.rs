//! In-memory [`FsBackend`] for exercising callers without a host.
//!
//! All data lives in a [`MockState`] that tests seed and inspect through
//! [`MockFs::state`]. Each operation can be made to fail by setting the
//! matching flag in [`InducedErrors`].

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::backend::FsBackend;
use crate::error::{FsError, Result};
use crate::format::FormatContext;
use crate::lsblk::DeviceMountInfo;
use crate::mount::MountRecord;
use crate::stats::FsStats;

/// Per-operation failure switches.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InducedErrors {
    pub get_mounts: bool,
    pub dev_mounts: bool,
    pub mount: bool,
    pub bind_mount: bool,
    pub unmount: bool,
    pub format: bool,
    pub format_and_mount: bool,
    pub get_disk_format: bool,
    pub wwn_to_device_path: bool,
    pub target_ip_lun_to_device: bool,
    pub remove_block_device: bool,
    pub multipath_command: bool,
    pub fc_host_wwns: bool,
    pub rescan: bool,
    pub issue_lip: bool,
    pub sys_block_devices: bool,
    pub mount_info_from_device: bool,
    pub device_rescan: bool,
    pub resize_multipath: bool,
    pub find_fs_type: bool,
    pub resize_fs: bool,
    pub mpath_name_from_device: bool,
    pub fs_info: bool,
    pub nvme_controller: bool,
}

#[derive(Debug, Clone, Default)]
pub struct MockState {
    pub mounts: Vec<MountRecord>,
    /// Port WWNs of the local FC adapters
    pub fc_host_wwns: Vec<String>,
    /// Volume WWN to `/dev` path
    pub wwn_to_device: HashMap<String, String>,
    /// Prefix of the link reported by `wwn_to_device_path`
    pub wwn_path: String,
    /// Keyed `ip-<ip>:-lun-<lun>`
    pub target_ip_lun_to_device: HashMap<String, String>,
    /// Returned by `get_mount_info_from_device`; a canned multipath volume
    /// when unset
    pub mount_info: Option<DeviceMountInfo>,
    pub nvme_controllers: HashMap<String, String>,
    /// NVMe namespaces that exist
    pub nvme_devices: HashSet<String>,
    /// Forces the result of `get_disk_format`
    pub disk_format: Option<String>,
    /// LUN argument of every rescan, in call order
    pub rescans: Vec<String>,
    pub induced: InducedErrors,
}

#[derive(Debug, Default)]
pub struct MockFs {
    state: Mutex<MockState>,
}

impl MockFs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_state(state: MockState) -> Self {
        Self {
            state: Mutex::new(state),
        }
    }

    pub fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn induce(&self, set: impl FnOnce(&mut InducedErrors)) {
        set(&mut self.state().induced);
    }

    fn add_mount(&self, source: &str, target: &str, fs_type: &str, options: &[String]) {
        let mut state = self.state();
        let mut record = MountRecord {
            device: resolve_device(source),
            path: target.to_string(),
            source: String::new(),
            fs_type: fs_type.to_string(),
            opts: options.to_vec(),
        };
        // Mounting an existing mount point is a bind of that mount
        if let Some(parent) = state.mounts.iter().find(|m| m.path == source) {
            record.source = parent.device.clone();
            record.device = "devtmpfs".to_string();
        }
        debug!(device = %record.device, path = %record.path, "Mock mount");
        state.mounts.push(record);
    }
}

/// Symlink target of `path` when it resolves, else `path` itself.
fn resolve_device(path: &str) -> String {
    fs::canonicalize(path)
        .map(|p| p.display().to_string())
        .unwrap_or_else(|_| path.to_string())
}

fn canned_mount_info() -> DeviceMountInfo {
    DeviceMountInfo {
        device_names: vec!["sda".into(), "sdb".into()],
        mpath_name: "mpathb".into(),
        ppath_name: String::new(),
        mount_point: "/noderoot/var/lib/kubelet/pods/abc-123/volumes/k8.io/pmax-0123/mount".into(),
    }
}

#[async_trait]
impl FsBackend for MockFs {
    async fn get_mounts(&self) -> Result<Vec<MountRecord>> {
        let state = self.state();
        if state.induced.get_mounts {
            return Err(FsError::Induced("getMounts"));
        }
        Ok(state.mounts.clone())
    }

    async fn get_dev_mounts(&self, device: &str) -> Result<Vec<MountRecord>> {
        let state = self.state();
        if state.induced.dev_mounts {
            return Err(FsError::Induced("dev mount"));
        }
        Ok(state
            .mounts
            .iter()
            .filter(|m| m.device == device)
            .cloned()
            .collect())
    }

    async fn mount(
        &self,
        source: &str,
        target: &str,
        fs_type: &str,
        options: &[String],
    ) -> Result<()> {
        if self.state().induced.mount {
            return Err(FsError::Induced("mount"));
        }
        self.add_mount(source, target, fs_type, options);
        Ok(())
    }

    async fn bind_mount(&self, source: &str, target: &str, options: &[String]) -> Result<()> {
        if self.state().induced.bind_mount {
            return Err(FsError::Induced("bindMount"));
        }
        let mut options = options.to_vec();
        options.push("bind".to_string());
        self.mount(source, target, "", &options).await
    }

    async fn unmount(&self, target: &str) -> Result<()> {
        let mut state = self.state();
        if state.induced.unmount {
            return Err(FsError::Induced("unmount"));
        }
        state.mounts.retain(|m| m.path != target);
        Ok(())
    }

    async fn format_and_mount(
        &self,
        _ctx: &FormatContext,
        source: &str,
        target: &str,
        fs_type: &str,
        options: &[String],
    ) -> Result<()> {
        if self.state().induced.format_and_mount {
            return Err(FsError::Induced("formatAndMount"));
        }
        self.add_mount(source, target, fs_type, options);
        Ok(())
    }

    async fn format(
        &self,
        _ctx: &FormatContext,
        source: &str,
        _target: &str,
        fs_type: &str,
        _options: &[String],
    ) -> Result<()> {
        let mut state = self.state();
        if state.induced.format {
            return Err(FsError::Induced("format"));
        }
        for mount in state.mounts.iter_mut().filter(|m| m.device == source) {
            mount.fs_type = fs_type.to_string();
        }
        Ok(())
    }

    async fn get_disk_format(&self, disk: &str) -> Result<String> {
        let state = self.state();
        if state.induced.get_disk_format {
            return Err(FsError::Induced("getDiskFormat"));
        }
        if let Some(forced) = &state.disk_format {
            return Ok(forced.clone());
        }
        Ok(state
            .mounts
            .iter()
            .find(|m| m.device == disk)
            .map(|m| m.fs_type.clone())
            .unwrap_or_default())
    }

    async fn get_mount_info_from_device(&self, _dev_id: &str) -> Result<DeviceMountInfo> {
        let state = self.state();
        if state.induced.mount_info_from_device {
            return Err(FsError::Induced("getMountInfoFromDevice"));
        }
        Ok(state.mount_info.clone().unwrap_or_else(canned_mount_info))
    }

    async fn get_mpath_name_from_device(&self, _device: &str) -> Result<String> {
        if self.state().induced.mpath_name_from_device {
            return Err(FsError::Induced("getMpathNameFromDevice"));
        }
        Ok("mpatha".to_string())
    }

    async fn resize_fs(
        &self,
        _mountpoint: &str,
        _device_path: &str,
        _ppath_device: &str,
        _mpath_device: &str,
        _fs_type: &str,
    ) -> Result<()> {
        if self.state().induced.resize_fs {
            return Err(FsError::Induced("resizeFS"));
        }
        Ok(())
    }

    async fn find_fs_type(&self, _mountpoint: &str) -> Result<String> {
        if self.state().induced.find_fs_type {
            return Err(FsError::Induced("findFSType"));
        }
        Ok("xfs".to_string())
    }

    async fn resize_multipath(&self, _device_name: &str) -> Result<()> {
        if self.state().induced.resize_multipath {
            return Err(FsError::Induced("resizeMultipath"));
        }
        Ok(())
    }

    async fn device_rescan(&self, _device_path: &str) -> Result<()> {
        if self.state().induced.device_rescan {
            return Err(FsError::Induced("deviceRescan"));
        }
        Ok(())
    }

    async fn validate_device(&self, _source: &str) -> Result<String> {
        Err(FsError::NotImplemented)
    }

    async fn wwn_to_device_path(&self, wwn: &str) -> Result<(String, String)> {
        let state = self.state();
        if state.induced.wwn_to_device_path {
            return Err(FsError::Induced("wwnToDevicePath"));
        }
        let device = state.wwn_to_device.get(wwn).cloned().unwrap_or_default();
        Ok((format!("{}{}", state.wwn_path, wwn), device))
    }

    async fn target_ip_lun_to_device_path(
        &self,
        target_ip: &str,
        lun: u32,
    ) -> Result<BTreeMap<String, String>> {
        let state = self.state();
        if state.induced.target_ip_lun_to_device {
            return Err(FsError::Induced("targetIPLUNToDevicePath"));
        }
        let key = format!("ip-{}:-lun-{}", target_ip, lun);
        let mut result = BTreeMap::new();
        if let Some(path) = state.target_ip_lun_to_device.get(&key) {
            result.insert(key, path.clone());
        }
        Ok(result)
    }

    async fn rescan_scsi_host(&self, _targets: &[String], lun: &str) -> Result<()> {
        let mut state = self.state();
        if state.induced.rescan {
            return Err(FsError::Induced("rescan"));
        }
        state.rescans.push(lun.to_string());
        Ok(())
    }

    async fn remove_block_device(&self, block_device_path: &str) -> Result<()> {
        let mut state = self.state();
        if state.induced.remove_block_device {
            return Err(FsError::Induced("removeBlockDevice"));
        }
        state.wwn_to_device.retain(|_, dev| dev != block_device_path);
        Ok(())
    }

    async fn multipath_command(
        &self,
        _timeout: Duration,
        _chroot: Option<&str>,
        _args: &[String],
    ) -> Result<Vec<u8>> {
        let mut state = self.state();
        if state.induced.multipath_command {
            return Err(FsError::Induced("multipath command"));
        }
        // A flush forgets every path device
        state.wwn_to_device.clear();
        Ok(Vec::new())
    }

    async fn get_fc_host_port_wwns(&self) -> Result<Vec<String>> {
        let state = self.state();
        if state.induced.fc_host_wwns {
            return Err(FsError::Induced("getFCHostPortWWNs"));
        }
        Ok(state.fc_host_wwns.clone())
    }

    async fn issue_lip_to_all_fc_hosts(&self) -> Result<()> {
        if self.state().induced.issue_lip {
            return Err(FsError::Induced("issueLIP"));
        }
        Ok(())
    }

    async fn get_sys_block_devices_for_volume_wwn(&self, wwn: &str) -> Result<Vec<String>> {
        let state = self.state();
        if state.induced.sys_block_devices {
            return Err(FsError::Induced("getSysBlockDevicesForVolumeWWN"));
        }
        Ok(state
            .wwn_to_device
            .get(wwn)
            .and_then(|dev| dev.rsplit('/').next())
            .map(|name| vec![name.to_string()])
            .unwrap_or_default())
    }

    async fn get_nvme_controller(&self, device: &str) -> Result<String> {
        let state = self.state();
        if state.induced.nvme_controller {
            return Err(FsError::Induced("getNVMeController"));
        }
        if !state.nvme_devices.contains(device) {
            return Err(FsError::DeviceDoesNotExist(device.to_string()));
        }
        state
            .nvme_controllers
            .get(device)
            .cloned()
            .ok_or_else(|| FsError::ControllerNotFound(device.to_string()))
    }

    async fn fs_info(&self, _path: &str) -> Result<FsStats> {
        if self.state().induced.fs_info {
            return Err(FsError::Induced("filesystemInfo"));
        }
        Ok(FsStats {
            available: 1000,
            capacity: 2000,
            used: 1000,
            inodes: 4,
            inodes_free: 2,
            inodes_used: 2,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_mount_and_unmount_track_state() {
        let mock = MockFs::new();
        mock.mount("/dev/sdb", "/mnt/staging", "xfs", &opts(&["rw"]))
            .await
            .unwrap();
        mock.bind_mount("/mnt/staging", "/mnt/pod", &opts(&["ro"]))
            .await
            .unwrap();

        let mounts = mock.get_mounts().await.unwrap();
        assert_eq!(mounts.len(), 2);
        assert_eq!(mounts[1].device, "devtmpfs");
        assert_eq!(mounts[1].source, "/dev/sdb");
        assert_eq!(mounts[1].opts, vec!["ro", "bind"]);

        assert_eq!(mock.get_dev_mounts("/dev/sdb").await.unwrap().len(), 1);

        mock.unmount("/mnt/pod").await.unwrap();
        assert_eq!(mock.get_mounts().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_induced_errors() {
        let mock = MockFs::new();
        mock.induce(|e| {
            e.mount = true;
            e.rescan = true;
        });
        let err = mock
            .mount("/dev/sdb", "/mnt", "ext4", &[])
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "mount induced error");
        assert!(mock.rescan_scsi_host(&[], "1").await.is_err());
        assert!(mock.state().rescans.is_empty());
    }

    #[tokio::test]
    async fn test_wwn_maps_and_multipath_flush() {
        let mut state = MockState {
            wwn_path: "/dev/disk/by-id/wwn-0x".into(),
            ..Default::default()
        };
        state
            .wwn_to_device
            .insert("600009700bcbb70e".into(), "/dev/sdx".into());
        let mock = MockFs::with_state(state);

        let (link, dev) = mock.wwn_to_device_path("600009700bcbb70e").await.unwrap();
        assert_eq!(link, "/dev/disk/by-id/wwn-0x600009700bcbb70e");
        assert_eq!(dev, "/dev/sdx");
        assert_eq!(
            mock.get_sys_block_devices_for_volume_wwn("600009700bcbb70e")
                .await
                .unwrap(),
            vec!["sdx"]
        );

        mock.multipath_command(Duration::from_secs(1), None, &opts(&["-F"]))
            .await
            .unwrap();
        assert!(mock.state().wwn_to_device.is_empty());
    }

    #[tokio::test]
    async fn test_nvme_controller_lookup() {
        let mock = MockFs::new();
        {
            let mut state = mock.state();
            state.nvme_devices.insert("nvme0n1".into());
            state.nvme_devices.insert("nvme1n1".into());
            state
                .nvme_controllers
                .insert("nvme0n1".into(), "nvme0".into());
        }
        assert_eq!(mock.get_nvme_controller("nvme0n1").await.unwrap(), "nvme0");
        assert!(matches!(
            mock.get_nvme_controller("nvme1n1").await,
            Err(FsError::ControllerNotFound(_))
        ));
        assert!(matches!(
            mock.get_nvme_controller("nvme9n1").await,
            Err(FsError::DeviceDoesNotExist(_))
        ));
    }

    #[tokio::test]
    async fn test_disk_format_override() {
        let mock = MockFs::new();
        assert_eq!(mock.get_disk_format("/dev/sdb").await.unwrap(), "");
        mock.state().disk_format = Some("ext4".into());
        assert_eq!(mock.get_disk_format("/dev/sdb").await.unwrap(), "ext4");
    }
}
