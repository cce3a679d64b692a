//! Mapping of protocol identifiers (WWN, iSCSI portal + LUN, NVMe namespace)
//! to OS block devices through the udev `/dev/disk` links and `/sys/block`.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Component, Path};

use tracing::{debug, info, warn};

use crate::Fs;
use crate::error::{FsError, Result};
use crate::exec::CommandRunner;

// PowerStore arrays: WWN starts with "68ccf09..."
const POWERSTORE_OUI: &str = "8ccf09";
// PowerMax arrays: WWN starts with "60000970..."
const POWERMAX_OUI: &str = "000097";

/// Does an NVMe NGUID name the same volume as a SCSI WWN?
///
/// Arrays fill the NGUID by reordering bytes of the SCSI WWN, each vendor in
/// its own way, so the comparison is keyed on the vendor OUI carried in the
/// WWN. Unknown vendors never match.
pub fn wwn_matches(nguid: &str, wwn: &str) -> bool {
    let wwn = wwn.to_lowercase();
    let wwn = wwn.strip_prefix("naa.").unwrap_or(&wwn);
    let nguid = nguid.trim().to_lowercase();
    let nguid = nguid.strip_prefix("eui.").unwrap_or(&nguid);

    if wwn.len() < 32 || !wwn.is_ascii() {
        return false;
    }

    match &wwn[1..7] {
        POWERSTORE_OUI => nguid.contains(&wwn[10..26]) && nguid.contains(&wwn[26..32]),
        POWERMAX_OUI => {
            let mut prefix = String::with_capacity(22);
            prefix.push_str(&wwn[16..32]);
            prefix.push_str(&wwn[1..7]);
            nguid.starts_with(&prefix)
        }
        _ => false,
    }
}

/// `/dev/<last component of link target>`
fn dev_path_from_link(target: &Path) -> Option<String> {
    target
        .file_name()
        .map(|name| format!("/dev/{}", name.to_string_lossy()))
}

impl<R: CommandRunner> Fs<R> {
    /// Resolve a volume WWN to its device through `/dev/disk/by-id`.
    ///
    /// Candidates are tried in order: device-mapper multipath, NVMe EUI,
    /// plain SCSI WWN. Returns the link that resolved and the `/dev` path it
    /// points to.
    pub fn wwn_to_device_path(&self, wwn: &str) -> Result<(String, String)> {
        let candidates = [
            format!("dm-uuid-mpath-3{}", wwn),
            format!("nvme-eui.{}", wwn),
            format!("wwn-0x{}", wwn),
        ];

        for name in &candidates {
            let link = self.paths.dev_disk_by_id.join(name);
            match fs::read_link(&link) {
                Ok(target) => {
                    if let Some(dev) = dev_path_from_link(&target) {
                        info!(link = %link.display(), device = %dev, "Resolved WWN");
                        return Ok((link.display().to_string(), dev));
                    }
                }
                Err(e) if is_missing_link(&e) => {
                    debug!(link = %link.display(), "Disk path not found");
                }
                Err(e) => {
                    warn!(link = %link.display(), error = %e, "Failed to read disk path");
                    return Err(FsError::SysfsRead {
                        path: link.display().to_string(),
                        source: e,
                    });
                }
            }
        }

        Err(FsError::NotFound(format!("device for WWN {}", wwn)))
    }

    /// Find `/dev/disk/by-path` links for a LUN behind an iSCSI portal.
    ///
    /// Both the decimal (`-lun-5`) and the 64-bit hex (`-lun-0x0005000000000000`)
    /// LUN encodings are matched. No match yields an empty map.
    pub fn target_ip_lun_to_device_path(
        &self,
        target_ip: &str,
        lun: u32,
    ) -> Result<BTreeMap<String, String>> {
        let prefix = format!("ip-{}:", target_ip);
        let decimal_suffix = format!("-lun-{}", lun);
        let hex_suffix = format!("-lun-0x{:04x}000000000000", lun);

        let by_path = &self.paths.dev_disk_by_path;
        let entries = fs::read_dir(by_path).map_err(|e| FsError::SysfsRead {
            path: by_path.display().to_string(),
            source: e,
        })?;

        let mut devices = BTreeMap::new();
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            if !name.starts_with(&prefix) {
                continue;
            }
            if !name.ends_with(&decimal_suffix) && !name.ends_with(&hex_suffix) {
                continue;
            }

            let link = entry.path();
            match fs::read_link(&link) {
                Ok(target) => {
                    if let Some(dev) = dev_path_from_link(&target) {
                        info!(link = %link.display(), device = %dev, "Found portal LUN device");
                        devices.insert(link.display().to_string(), dev);
                    }
                }
                Err(e) => {
                    warn!(link = %link.display(), error = %e, "Failed to read by-path link");
                }
            }
        }
        Ok(devices)
    }

    /// Names of `/sys/block` entries whose WWID identifies `wwn`.
    ///
    /// SCSI disks are compared on `device/wwid` with any `naa.` prefix
    /// removed; NVMe namespaces read `wwid` and go through [`wwn_matches`].
    pub fn get_sys_block_devices_for_volume_wwn(&self, wwn: &str) -> Result<Vec<String>> {
        let sys_block = &self.paths.sys_block;
        let entries = fs::read_dir(sys_block).map_err(|e| FsError::SysfsRead {
            path: sys_block.display().to_string(),
            source: e,
        })?;

        let wanted = wwn.strip_prefix("naa.").unwrap_or(wwn);
        let mut devices = Vec::new();
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            let nvme = name.starts_with("nvme");
            let wwid_path = if nvme {
                entry.path().join("wwid")
            } else {
                entry.path().join("device").join("wwid")
            };

            let wwid = match fs::read_to_string(&wwid_path) {
                Ok(content) => content.trim().to_string(),
                Err(e) => {
                    debug!(path = %wwid_path.display(), error = %e, "No WWID");
                    continue;
                }
            };

            let matched = if nvme {
                wwn_matches(&wwid, wwn)
            } else {
                wwid.strip_prefix("naa.").unwrap_or(&wwid) == wanted
            };
            if matched {
                info!(device = %name, wwn = %wwn, "Found block device for volume");
                devices.push(name);
            }
        }
        Ok(devices)
    }

    /// Controller of a fabric-attached NVMe namespace.
    ///
    /// The `/sys/block/<device>` link is resolved and searched for a `ctl`
    /// component; without one the namespace is not fabric attached and the
    /// result is empty.
    pub fn get_nvme_controller(&self, device: &str) -> Result<String> {
        let link = self.paths.sys_block.join(device);
        if let Err(e) = fs::symlink_metadata(&link) {
            if e.kind() == io::ErrorKind::NotFound {
                return Err(FsError::DeviceDoesNotExist(device.to_string()));
            }
            return Err(FsError::SysfsRead {
                path: link.display().to_string(),
                source: e,
            });
        }

        let resolved = fs::canonicalize(&link).map_err(|e| FsError::SysfsRead {
            path: link.display().to_string(),
            source: e,
        })?;

        let components: Vec<String> = resolved
            .components()
            .filter_map(|c| match c {
                Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
                _ => None,
            })
            .collect();

        if !components.iter().any(|c| c == "ctl") {
            debug!(device = %device, path = %resolved.display(), "Not a fabrics namespace");
            return Ok(String::new());
        }

        if let Some(index) = components.iter().rposition(|c| c == device)
            && index > 0
            && components[index - 1].starts_with("nvme")
        {
            let controller = components[index - 1].clone();
            info!(device = %device, controller = %controller, "Found NVMe controller");
            return Ok(controller);
        }

        Err(FsError::ControllerNotFound(device.to_string()))
    }

    /// Resolve `source` through any symlinks and require a device node.
    pub fn validate_device(&self, source: &str) -> Result<String> {
        use std::os::unix::fs::FileTypeExt;

        fs::symlink_metadata(source)?;
        let resolved = fs::canonicalize(source)?;
        let file_type = fs::metadata(&resolved)?.file_type();
        if !file_type.is_block_device() && !file_type.is_char_device() {
            return Err(FsError::InvalidDevice(resolved.display().to_string()));
        }
        Ok(resolved.display().to_string())
    }
}

fn is_missing_link(e: &io::Error) -> bool {
    // EINVAL: the path exists but is not a symlink
    matches!(e.kind(), io::ErrorKind::NotFound | io::ErrorKind::InvalidInput)
}
