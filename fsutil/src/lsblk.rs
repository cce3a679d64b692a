//! `lsblk -P` scraping.
//!
//! `lsblk -P` prints one device per line as space separated `KEY="VALUE"`
//! pairs, parents before children. The column set differs between
//! util-linux releases (`MOUNTPOINT` became `MOUNTPOINTS` in 2.37), and only
//! releases newer than 2.30 accept `-x MODE`, so the version is probed before
//! the device tree is listed.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::Fs;
use crate::error::{FsError, Result};
use crate::exec::{CommandRunner, run_checked};
use crate::validate::{clean_path, validate_path};

static PAIR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"([A-Z][A-Z0-9:_-]*)="([^"]*)""#).expect("lsblk pair pattern"));

static VERSION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"linux (\d+)\.(\d+)").expect("lsblk version pattern"));

/// Last util-linux release without `lsblk -x`.
const LSBLK_OLD_VERSION: (u32, u32) = (2, 30);

/// One `lsblk -P` line.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LsblkRow {
    pub name: String,
    /// `TYPE` column: disk, part, mpath, lvm, ...
    pub kind: String,
    pub mountpoint: String,
    /// The raw line, used for pattern matching against device ids
    pub line: String,
}

/// How a mounted volume is assembled from block devices.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DeviceMountInfo {
    /// Underlying SCSI or NVMe path devices (`sdb`, `nvme0n1`, ...)
    pub device_names: Vec<String>,
    /// Device-mapper multipath name when the volume is multipathed
    pub mpath_name: String,
    /// PowerPath pseudo device (`emcpowerX`) when PowerPath owns the volume
    pub ppath_name: String,
    pub mount_point: String,
}

pub fn parse_lsblk_pairs(output: &str) -> Vec<LsblkRow> {
    let mut rows = Vec::new();
    for line in output.lines() {
        if line.trim().is_empty() {
            continue;
        }
        let mut row = LsblkRow {
            line: line.to_string(),
            ..Default::default()
        };
        for caps in PAIR_RE.captures_iter(line) {
            let value = caps[2].to_string();
            match &caps[1] {
                "NAME" => row.name = value,
                "TYPE" => row.kind = value,
                "MOUNTPOINT" | "MOUNTPOINTS" => row.mountpoint = value,
                _ => {}
            }
        }
        rows.push(row);
    }
    rows
}

/// True when `lsblk -V` reports a release newer than 2.30.
pub fn parse_lsblk_version(output: &str) -> Result<bool> {
    let caps = VERSION_RE
        .captures(output)
        .ok_or_else(|| FsError::Parse(format!("lsblk version from {:?}", output.trim())))?;
    let major: u32 = caps[1]
        .parse()
        .map_err(|_| FsError::Parse(format!("lsblk major version {}", &caps[1])))?;
    let minor: u32 = caps[2]
        .parse()
        .map_err(|_| FsError::Parse(format!("lsblk minor version {}", &caps[2])))?;
    Ok((major, minor) > LSBLK_OLD_VERSION)
}

/// Every row matching `id`, each preceded by the row above it when that
/// row does not match. For a multipath map this yields the path device
/// followed by the map.
fn rows_with_parent<'a>(rows: &'a [LsblkRow], id: &str) -> Vec<&'a LsblkRow> {
    let mut out = Vec::new();
    for (i, row) in rows.iter().enumerate() {
        if !row.line.contains(id) {
            continue;
        }
        if i > 0 && !rows[i - 1].line.contains(id) {
            out.push(&rows[i - 1]);
        }
        out.push(row);
    }
    out
}

/// Every row matching `id` plus the row directly below it.
fn rows_with_child<'a>(rows: &'a [LsblkRow], id: &str) -> Vec<&'a LsblkRow> {
    let mut out = Vec::new();
    let mut remaining = 0;
    for row in rows {
        if row.line.contains(id) {
            remaining = 2;
        }
        if remaining > 0 {
            out.push(row);
            remaining -= 1;
        }
    }
    out
}

fn ancestor_pattern(prefix: &str, id: &str) -> Result<Regex> {
    Regex::new(&format!("{}.+{}", prefix, regex::escape(id)))
        .map_err(|e| FsError::Parse(format!("device id {}: {}", id, e)))
}

impl<R: CommandRunner> Fs<R> {
    pub fn is_lsblk_new(&self) -> Result<bool> {
        let output = run_checked(&self.runner, "lsblk", &["-V".to_string()])?;
        parse_lsblk_version(&output.stdout_str())
    }

    fn lsblk_rows(&self, sorted: bool) -> Result<Vec<LsblkRow>> {
        let args: Vec<String> = if sorted {
            vec!["-Px".into(), "MODE".into()]
        } else {
            vec!["-P".into()]
        };
        let output = run_checked(&self.runner, "lsblk", &args)?;
        Ok(parse_lsblk_pairs(&output.stdout_str()))
    }

    /// Describe the block device stack behind `dev_id`.
    ///
    /// A PowerPath pseudo device is looked for first, then a multipath map,
    /// and finally `dev_id` is treated as a standalone device.
    pub fn get_mount_info_from_device(&self, dev_id: &str) -> Result<DeviceMountInfo> {
        validate_path(&clean_path(dev_id).to_string_lossy())?;
        let lsblk_new = self.is_lsblk_new()?;
        let rows = self.lsblk_rows(false)?;

        let ppath_re = ancestor_pattern("emcpower", dev_id)?;
        let mut selected: Vec<LsblkRow> = rows
            .iter()
            .filter(|r| ppath_re.is_match(&r.line))
            .cloned()
            .collect();

        if selected.is_empty() {
            info!(device = %dev_id, "No PowerPath device, checking multipath");
            let mpath_re = ancestor_pattern("mpath", dev_id)?;
            selected = if rows.iter().any(|r| mpath_re.is_match(&r.line)) {
                let tree = self.lsblk_rows(lsblk_new)?;
                rows_with_parent(&tree, dev_id).into_iter().cloned().collect()
            } else {
                rows.iter().filter(|r| r.line.contains(dev_id)).cloned().collect()
            };
        }

        if selected.is_empty() {
            return Err(FsError::DeviceNotFound);
        }
        debug!(device = %dev_id, rows = selected.len(), "Selected lsblk rows");

        let mut info = DeviceMountInfo {
            mount_point: selected
                .iter()
                .find(|r| !r.mountpoint.is_empty())
                .map(|r| r.mountpoint.clone())
                .unwrap_or_default(),
            ..Default::default()
        };

        for prefix in ["sd", "nvme"] {
            for row in selected.iter().filter(|r| r.name.starts_with(prefix)) {
                if !info.device_names.contains(&row.name) {
                    info.device_names.push(row.name.clone());
                }
            }
        }

        if let Some(ppath) = selected.iter().find(|r| r.name.starts_with("emcpower")) {
            info!(device = %dev_id, ppath = %ppath.name, "Found PowerPath device");
            info.ppath_name = ppath.name.clone();
            info.device_names = self.native_devices_from_ppath(&ppath.name)?;
        } else if let Some(mpath) = selected.iter().find(|r| r.name.starts_with("mpath")) {
            info.mpath_name = mpath.name.clone();
        } else if let Some(mapper) = selected.iter().find(|r| r.kind == "mpath") {
            // Maps named by WWID, e.g. /dev/mapper/3600601...
            info.mpath_name = mapper.name.clone();
        }

        Ok(info)
    }

    /// Name of the multipath map sitting directly on top of `device`, or an
    /// empty string when there is none.
    pub fn get_mpath_name_from_device(&self, device: &str) -> Result<String> {
        validate_path(&clean_path(device).to_string_lossy())?;
        let lsblk_new = self.is_lsblk_new()?;
        let rows = self.lsblk_rows(lsblk_new)?;

        Ok(rows_with_child(&rows, device)
            .into_iter()
            .find(|r| r.kind == "mpath")
            .map(|r| r.name.clone())
            .unwrap_or_default())
    }

    /// Path devices behind a PowerPath pseudo device, found through the
    /// volume WWN reported by `pp_inq`.
    fn native_devices_from_ppath(&self, ppath: &str) -> Result<Vec<String>> {
        let program = self.paths.pp_inq_bin.display().to_string();
        let args = vec!["-wwn".to_string(), "-dev".to_string(), format!("/dev/{}", ppath)];
        let output = run_checked(&self.runner, &program, &args)?;

        // DEVICE           :VEND    :PROD            :WWN
        // /dev/emcpowerg   :EMC     :SYMMETRIX       :60000970000120000549533030354435
        let stdout = output.stdout_str();
        let wwn = stdout
            .lines()
            .filter(|line| line.contains("emcpower"))
            .find_map(|line| line.split_whitespace().nth(3))
            .map(|token| token.replacen(':', "", 1))
            .ok_or_else(|| FsError::Parse(format!("pp_inq output for {}", ppath)))?;

        debug!(ppath = %ppath, wwn = %wwn, "PowerPath volume WWN");
        self.get_sys_block_devices_for_volume_wwn(&wwn)
    }
}
