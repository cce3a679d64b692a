//! Capability interface shared by the host implementation ([`crate::Fs`])
//! and the in-memory [`crate::mock::MockFs`].
//!
//! Storage drivers depend on `dyn FsBackend` so node code can be exercised
//! without touching sysfs or spawning tools.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;

use crate::Fs;
use crate::error::Result;
use crate::exec::CommandRunner;
use crate::format::FormatContext;
use crate::lsblk::DeviceMountInfo;
use crate::mount::MountRecord;
use crate::stats::FsStats;

#[async_trait]
pub trait FsBackend: Send + Sync {
    async fn get_mounts(&self) -> Result<Vec<MountRecord>>;

    async fn get_dev_mounts(&self, device: &str) -> Result<Vec<MountRecord>>;

    async fn mount(&self, source: &str, target: &str, fs_type: &str, options: &[String])
    -> Result<()>;

    async fn bind_mount(&self, source: &str, target: &str, options: &[String]) -> Result<()>;

    async fn unmount(&self, target: &str) -> Result<()>;

    async fn format_and_mount(
        &self,
        ctx: &FormatContext,
        source: &str,
        target: &str,
        fs_type: &str,
        options: &[String],
    ) -> Result<()>;

    async fn format(
        &self,
        ctx: &FormatContext,
        source: &str,
        target: &str,
        fs_type: &str,
        options: &[String],
    ) -> Result<()>;

    async fn get_disk_format(&self, disk: &str) -> Result<String>;

    async fn get_mount_info_from_device(&self, dev_id: &str) -> Result<DeviceMountInfo>;

    async fn get_mpath_name_from_device(&self, device: &str) -> Result<String>;

    async fn resize_fs(
        &self,
        mountpoint: &str,
        device_path: &str,
        ppath_device: &str,
        mpath_device: &str,
        fs_type: &str,
    ) -> Result<()>;

    async fn find_fs_type(&self, mountpoint: &str) -> Result<String>;

    async fn resize_multipath(&self, device_name: &str) -> Result<()>;

    async fn device_rescan(&self, device_path: &str) -> Result<()>;

    async fn validate_device(&self, source: &str) -> Result<String>;

    /// Returns `(by-id link, /dev path)`.
    async fn wwn_to_device_path(&self, wwn: &str) -> Result<(String, String)>;

    async fn target_ip_lun_to_device_path(
        &self,
        target_ip: &str,
        lun: u32,
    ) -> Result<BTreeMap<String, String>>;

    async fn rescan_scsi_host(&self, targets: &[String], lun: &str) -> Result<()>;

    async fn remove_block_device(&self, block_device_path: &str) -> Result<()>;

    async fn multipath_command(
        &self,
        timeout: Duration,
        chroot: Option<&str>,
        args: &[String],
    ) -> Result<Vec<u8>>;

    async fn get_fc_host_port_wwns(&self) -> Result<Vec<String>>;

    async fn issue_lip_to_all_fc_hosts(&self) -> Result<()>;

    async fn get_sys_block_devices_for_volume_wwn(&self, wwn: &str) -> Result<Vec<String>>;

    async fn get_nvme_controller(&self, device: &str) -> Result<String>;

    async fn fs_info(&self, path: &str) -> Result<FsStats>;
}

#[async_trait]
impl<R: CommandRunner + 'static> FsBackend for Fs<R> {
    async fn get_mounts(&self) -> Result<Vec<MountRecord>> {
        Fs::get_mounts(self)
    }

    async fn get_dev_mounts(&self, device: &str) -> Result<Vec<MountRecord>> {
        Fs::get_dev_mounts(self, device)
    }

    async fn mount(
        &self,
        source: &str,
        target: &str,
        fs_type: &str,
        options: &[String],
    ) -> Result<()> {
        Fs::mount(self, source, target, fs_type, options)
    }

    async fn bind_mount(&self, source: &str, target: &str, options: &[String]) -> Result<()> {
        Fs::bind_mount(self, source, target, options)
    }

    async fn unmount(&self, target: &str) -> Result<()> {
        Fs::unmount(self, target)
    }

    async fn format_and_mount(
        &self,
        ctx: &FormatContext,
        source: &str,
        target: &str,
        fs_type: &str,
        options: &[String],
    ) -> Result<()> {
        Fs::format_and_mount(self, ctx, source, target, fs_type, options)
    }

    async fn format(
        &self,
        ctx: &FormatContext,
        source: &str,
        target: &str,
        fs_type: &str,
        options: &[String],
    ) -> Result<()> {
        Fs::format(self, ctx, source, target, fs_type, options)
    }

    async fn get_disk_format(&self, disk: &str) -> Result<String> {
        Fs::get_disk_format(self, disk)
    }

    async fn get_mount_info_from_device(&self, dev_id: &str) -> Result<DeviceMountInfo> {
        Fs::get_mount_info_from_device(self, dev_id)
    }

    async fn get_mpath_name_from_device(&self, device: &str) -> Result<String> {
        Fs::get_mpath_name_from_device(self, device)
    }

    async fn resize_fs(
        &self,
        mountpoint: &str,
        device_path: &str,
        ppath_device: &str,
        mpath_device: &str,
        fs_type: &str,
    ) -> Result<()> {
        Fs::resize_fs(self, mountpoint, device_path, ppath_device, mpath_device, fs_type)
    }

    async fn find_fs_type(&self, mountpoint: &str) -> Result<String> {
        Fs::find_fs_type(self, mountpoint)
    }

    async fn resize_multipath(&self, device_name: &str) -> Result<()> {
        Fs::resize_multipath(self, device_name)
    }

    async fn device_rescan(&self, device_path: &str) -> Result<()> {
        Fs::device_rescan(self, device_path)
    }

    async fn validate_device(&self, source: &str) -> Result<String> {
        Fs::validate_device(self, source)
    }

    async fn wwn_to_device_path(&self, wwn: &str) -> Result<(String, String)> {
        Fs::wwn_to_device_path(self, wwn)
    }

    async fn target_ip_lun_to_device_path(
        &self,
        target_ip: &str,
        lun: u32,
    ) -> Result<BTreeMap<String, String>> {
        Fs::target_ip_lun_to_device_path(self, target_ip, lun)
    }

    async fn rescan_scsi_host(&self, targets: &[String], lun: &str) -> Result<()> {
        Fs::rescan_scsi_host(self, targets, lun)
    }

    async fn remove_block_device(&self, block_device_path: &str) -> Result<()> {
        Fs::remove_block_device(self, block_device_path)
    }

    async fn multipath_command(
        &self,
        timeout: Duration,
        chroot: Option<&str>,
        args: &[String],
    ) -> Result<Vec<u8>> {
        Fs::multipath_command(self, timeout, chroot, args).await
    }

    async fn get_fc_host_port_wwns(&self) -> Result<Vec<String>> {
        Fs::get_fc_host_port_wwns(self)
    }

    async fn issue_lip_to_all_fc_hosts(&self) -> Result<()> {
        Fs::issue_lip_to_all_fc_hosts(self)
    }

    async fn get_sys_block_devices_for_volume_wwn(&self, wwn: &str) -> Result<Vec<String>> {
        Fs::get_sys_block_devices_for_volume_wwn(self, wwn)
    }

    async fn get_nvme_controller(&self, device: &str) -> Result<String> {
        Fs::get_nvme_controller(self, device)
    }

    async fn fs_info(&self, path: &str) -> Result<FsStats> {
        Fs::fs_info(self, path)
    }
}
