//! SCSI, Fibre Channel and block device rescan and teardown through sysfs.
//!
//! Every operation here is a single pass over sysfs with no retained state,
//! so repeating one is harmless. Multi-host sweeps are best effort: a failing
//! host is logged and skipped.

use std::fs::{self, DirEntry, OpenOptions};
use std::io::{self, Write};
use std::path::Path;

use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::Fs;
use crate::error::{FsError, Result};
use crate::exec::CommandRunner;

/// Rescan wildcard for channel, target or LUN.
pub const WILDCARD: &str = "-";

const ISCSI_TARGET_PREFIX: &str = "iqn.";
const FC_TARGET_PREFIX: &str = "0x50";

/// A `(host, channel, target)` triple to rescan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TargetDevice {
    /// SCSI host directory name, e.g. `host3`
    pub host: String,
    pub channel: String,
    pub target: String,
}

/// LUNs arrive in hex; the scan file wants decimal. Anything that is not a
/// non-negative 32-bit signed value rescans every LUN.
pub fn normalize_lun(lun: &str) -> String {
    if lun.is_empty() {
        return WILDCARD.to_string();
    }
    match i32::from_str_radix(lun, 16) {
        Ok(value) if value >= 0 => value.to_string(),
        Ok(value) => {
            warn!(lun = %lun, value, "Negative LUN, rescanning all LUNs");
            WILDCARD.to_string()
        }
        Err(e) => {
            warn!(lun = %lun, error = %e, "Invalid hex LUN, rescanning all LUNs");
            WILDCARD.to_string()
        }
    }
}

/// Entries of `dir`, sorted by name.
fn sorted_entries(dir: &Path) -> io::Result<Vec<DirEntry>> {
    let mut entries: Vec<DirEntry> = fs::read_dir(dir)?.flatten().collect();
    entries.sort_by_key(|e| e.file_name());
    Ok(entries)
}

fn entry_name(entry: &DirEntry) -> String {
    entry.file_name().to_string_lossy().into_owned()
}

/// Write `value` to an existing sysfs attribute.
pub(crate) fn write_sysfs(path: &Path, value: &str) -> io::Result<()> {
    let mut file = OpenOptions::new().append(true).open(path)?;
    file.write_all(value.as_bytes())
}

impl<R: CommandRunner> Fs<R> {
    /// Hosts behind which the given array FC ports are visible.
    ///
    /// Remote ports are named `rport-<host>:<bus>-<n>`, so the host is
    /// recovered from the port directory name. FC targets always rescan every
    /// channel and target.
    pub fn fc_target_hosts<S: AsRef<str>>(&self, port_wwns: &[S]) -> Result<Vec<TargetDevice>> {
        let dir = &self.paths.fc_remote_ports;
        let entries = match sorted_entries(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                info!(path = %dir.display(), "No Fibre Channel remote ports");
                return Ok(Vec::new());
            }
            Err(e) => {
                error!(path = %dir.display(), error = %e, "Cannot read directory");
                return Err(FsError::SysfsRead {
                    path: dir.display().to_string(),
                    source: e,
                });
            }
        };

        let wanted: Vec<String> = port_wwns.iter().map(|w| w.as_ref().to_lowercase()).collect();
        let mut devices: Vec<TargetDevice> = Vec::new();
        for entry in entries {
            let name = entry_name(&entry);
            if !name.starts_with("rport-") {
                continue;
            }
            let Ok(port_name) = fs::read_to_string(entry.path().join("port_name")) else {
                continue;
            };
            if !wanted.contains(&port_name.trim().to_lowercase()) {
                continue;
            }

            let host = name.replacen("rport-", "host", 1);
            let host = host.split(':').next().unwrap_or(&host).to_string();
            if devices.iter().any(|d| d.host == host) {
                continue;
            }
            debug!(rport = %name, host = %host, "Matched FC target port");
            devices.push(TargetDevice {
                host,
                channel: WILDCARD.to_string(),
                target: WILDCARD.to_string(),
            });
        }
        Ok(devices)
    }

    /// Host, channel and target of every iSCSI session logged in to one of
    /// `iqns`.
    pub fn iscsi_target_hosts<S: AsRef<str>>(&self, iqns: &[S]) -> Result<Vec<TargetDevice>> {
        let dir = &self.paths.iscsi_session;
        let sessions = match sorted_entries(dir) {
            Ok(sessions) => sessions,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                info!(path = %dir.display(), "No iSCSI sessions");
                return Ok(Vec::new());
            }
            Err(e) => {
                error!(path = %dir.display(), error = %e, "Cannot read directory");
                return Err(FsError::SysfsRead {
                    path: dir.display().to_string(),
                    source: e,
                });
            }
        };

        let mut devices: Vec<TargetDevice> = Vec::new();
        for session in sessions {
            let name = entry_name(&session);
            if !name.starts_with("session") {
                continue;
            }
            let Ok(target_name) = fs::read_to_string(session.path().join("targetname")) else {
                continue;
            };
            let target_name = target_name.trim();
            if !iqns.iter().any(|iqn| iqn.as_ref() == target_name) {
                continue;
            }
            debug!(session = %name, target = %target_name, "Matched iSCSI session");

            let device_dir = session.path().join("device");
            let entries = match sorted_entries(&device_dir) {
                Ok(entries) => entries,
                Err(e) => {
                    error!(path = %device_dir.display(), error = %e, "Cannot read directory");
                    continue;
                }
            };

            // device/target<host>:<channel>:<target>
            if let Some(target_dir) = entries
                .iter()
                .map(entry_name)
                .find(|n| n.starts_with("target"))
            {
                let parts: Vec<&str> = target_dir["target".len()..].split(':').collect();
                if parts.len() >= 3 {
                    let device = TargetDevice {
                        host: format!("host{}", parts[0]),
                        channel: parts[1].to_string(),
                        target: parts[2].to_string(),
                    };
                    if !devices.contains(&device) {
                        devices.push(device);
                    }
                }
            }
        }
        Ok(devices)
    }

    /// Ask the SCSI layer to rescan for `lun` (hex, empty for all).
    ///
    /// Targets starting with `iqn.` are iSCSI and `0x50` are FC port WWNs.
    /// When at least one target resolves to a host only those hosts are
    /// rescanned; otherwise every SCSI host is swept.
    pub fn rescan_scsi_host<S: AsRef<str>>(&self, targets: &[S], lun: &str) -> Result<()> {
        self.rescan_scsi_host_with(targets, lun, |_, _| {})
    }

    /// [`Fs::rescan_scsi_host`], reporting each scan file written and its
    /// outcome to `observe`.
    pub fn rescan_scsi_host_with<S, F>(&self, targets: &[S], lun: &str, mut observe: F) -> Result<()>
    where
        S: AsRef<str>,
        F: FnMut(&Path, &io::Result<()>),
    {
        let lun = normalize_lun(lun);

        let mut iqns = Vec::new();
        let mut port_wwns = Vec::new();
        for target in targets {
            let target = target.as_ref();
            if target.starts_with(ISCSI_TARGET_PREFIX) {
                iqns.push(target);
            } else if target.starts_with(FC_TARGET_PREFIX) {
                port_wwns.push(target);
            } else {
                warn!(target = %target, "Ignoring target of unknown type");
            }
        }

        let mut devices = Vec::new();
        if !port_wwns.is_empty() {
            devices.extend(self.fc_target_hosts(&port_wwns)?);
        }
        if !iqns.is_empty() {
            devices.extend(self.iscsi_target_hosts(&iqns)?);
        }

        if !devices.is_empty() {
            for device in &devices {
                let scan = self.paths.scsi_host.join(&device.host).join("scan");
                let value = format!("{} {} {}", device.channel, device.target, lun);
                info!(file = %scan.display(), value = %value, "Rescanning SCSI host");
                let result = write_sysfs(&scan, &value);
                if let Err(e) = &result {
                    error!(file = %scan.display(), error = %e, "Failed to write rescan file");
                }
                observe(&scan, &result);
            }
            return Ok(());
        }

        let hosts_dir = &self.paths.scsi_host;
        let hosts = sorted_entries(hosts_dir).map_err(|e| {
            error!(path = %hosts_dir.display(), error = %e, "Cannot read directory");
            FsError::SysfsRead {
                path: hosts_dir.display().to_string(),
                source: e,
            }
        })?;

        let value = format!("{} {} {}", WILDCARD, WILDCARD, lun);
        for host in hosts {
            if !entry_name(&host).starts_with("host") {
                continue;
            }
            let scan = host.path().join("scan");
            info!(file = %scan.display(), value = %value, "Rescanning SCSI host");
            let result = write_sysfs(&scan, &value);
            if let Err(e) = &result {
                error!(file = %scan.display(), error = %e, "Failed to write rescan file");
            }
            observe(&scan, &result);
        }
        Ok(())
    }

    /// Issue a loop initialization on every local FC port.
    ///
    /// All hosts are attempted; the last failure, if any, is returned.
    pub fn issue_lip_to_all_fc_hosts(&self) -> Result<()> {
        self.issue_lip_to_all_fc_hosts_with(|_, _| {})
    }

    pub fn issue_lip_to_all_fc_hosts_with<F>(&self, mut observe: F) -> Result<()>
    where
        F: FnMut(&Path, &io::Result<()>),
    {
        let dir = &self.paths.fc_host;
        let hosts = match sorted_entries(dir) {
            Ok(hosts) => hosts,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                info!(path = %dir.display(), "No Fibre Channel hosts");
                return Ok(());
            }
            Err(e) => {
                return Err(FsError::SysfsRead {
                    path: dir.display().to_string(),
                    source: e,
                });
            }
        };

        let mut last_error = None;
        for host in hosts {
            if !entry_name(&host).starts_with("host") {
                continue;
            }
            let lip = host.path().join("issue_lip");
            info!(file = %lip.display(), "Issuing LIP");
            let result = write_sysfs(&lip, "1");
            observe(&lip, &result);
            if let Err(e) = result {
                error!(file = %lip.display(), error = %e, "Failed to issue LIP");
                last_error = Some(FsError::SysfsWrite {
                    path: lip.display().to_string(),
                    source: e,
                });
            }
        }

        match last_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// WWNs of the local FC ports, as reported in `port_name`.
    pub fn get_fc_host_port_wwns(&self) -> Result<Vec<String>> {
        let dir = &self.paths.fc_host;
        let hosts = match sorted_entries(dir) {
            Ok(hosts) => hosts,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(FsError::SysfsRead {
                    path: dir.display().to_string(),
                    source: e,
                });
            }
        };

        let mut wwns = Vec::new();
        for host in hosts {
            if !entry_name(&host).starts_with("host") {
                continue;
            }
            if let Ok(port_name) = fs::read_to_string(host.path().join("port_name")) {
                wwns.push(port_name.trim().to_string());
            }
        }
        Ok(wwns)
    }

    /// Detach a SCSI block device from the kernel.
    ///
    /// Refuses when the device is `blocked`: deleting a blocked device can
    /// hang the writer indefinitely.
    pub fn remove_block_device(&self, block_device_path: &str) -> Result<()> {
        let name = device_name(block_device_path)?;
        let device_dir = self.paths.sys_block.join(name).join("device");

        let state_path = device_dir.join("state");
        let state = fs::read_to_string(&state_path).map_err(|e| {
            error!(path = %state_path.display(), error = %e, "Cannot read device state");
            FsError::SysfsRead {
                path: state_path.display().to_string(),
                source: e,
            }
        })?;
        if state.trim() == "blocked" {
            warn!(device = %name, "Device is blocked, not deleting");
            return Err(FsError::DeviceBlocked(name.to_string()));
        }

        let delete_path = device_dir.join("delete");
        info!(path = %delete_path.display(), "Deleting block device");
        write_sysfs(&delete_path, "1").map_err(|e| {
            error!(path = %delete_path.display(), error = %e, "Could not write to device delete path");
            FsError::SysfsWrite {
                path: delete_path.display().to_string(),
                source: e,
            }
        })
    }

    /// Make the kernel re-read the size of a block device.
    pub fn device_rescan(&self, device_path: &str) -> Result<()> {
        let name = device_name(device_path)?;
        let rescan_path = self.paths.sys_block.join(name).join("device").join("rescan");
        info!(path = %rescan_path.display(), "Rescanning block device");
        write_sysfs(&rescan_path, "1").map_err(|e| FsError::SysfsWrite {
            path: rescan_path.display().to_string(),
            source: e,
        })
    }
}

fn device_name(path: &str) -> Result<&str> {
    path.rsplit('/')
        .next()
        .filter(|name| !name.is_empty())
        .ok_or_else(|| FsError::InvalidDevice(path.to_string()))
}
