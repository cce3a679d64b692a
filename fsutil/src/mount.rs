//! Mount table reading.
//!
//! Linux hosts parse `/proc/self/mountinfo`, whose line layout is documented
//! in the kernel's `Documentation/filesystems/proc.rst`:
//!
//! ```text
//! 36 35 98:0 /mnt1 /mnt2 rw,noatime master:1 - ext3 /dev/root rw,errors=continue
//! (1)(2)(3)   (4)   (5)      (6)      (7)   (8) (9)   (10)         (11)
//! ```
//!
//! macOS hosts parse the output of the `mount` command instead.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::Fs;
use crate::error::{FsError, Result};
use crate::exec::CommandRunner;
use crate::validate::clean_path;

static PSEUDO_FS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(?:devtmpfs|fuse\..*|nfs\d?)$").expect("pseudo fs pattern")
});

static DARWIN_MOUNT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(.+) on (.+) \((.+)\)$").expect("mount output pattern"));

/// One row of the mount table.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MountRecord {
    /// Backing device or pseudo-device name
    pub device: String,
    /// Absolute mount point
    pub path: String,
    /// Root source, resolved through the first mount of the same device for
    /// bind mounts
    pub source: String,
    #[serde(rename = "type")]
    pub fs_type: String,
    /// Mount options in table order, duplicates kept
    pub opts: Vec<String>,
}

/// A raw, tokenised `mountinfo` line.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MountEntry {
    pub mount_id: String,
    pub parent_id: String,
    pub major_minor: String,
    pub root: String,
    pub mount_point: String,
    pub mount_opts: Vec<String>,
    pub optional_fields: Vec<String>,
    pub fs_type: String,
    pub mount_source: String,
    pub super_opts: Vec<String>,
}

/// Entries already seen during one table scan, keyed by mount source.
pub type EntryCache = HashMap<String, MountEntry>;

/// Converts a raw entry into a record, or drops it by returning `None`.
pub type EntryScanFn = fn(&MountEntry, &mut EntryCache) -> Result<Option<MountRecord>>;

/// Keep real block devices plus `devtmpfs`, FUSE and NFS mounts.
///
/// The first time a source is seen its mount point is cached; later entries
/// for the same source are bind mounts and get `source` rewritten to the
/// cached mount point joined with their root.
pub fn default_entry_scan(entry: &MountEntry, cache: &mut EntryCache) -> Result<Option<MountRecord>> {
    let pseudo = PSEUDO_FS_RE.is_match(&entry.fs_type);
    if !pseudo && !entry.mount_source.starts_with('/') {
        return Ok(None);
    }

    let source = match cache.get(&entry.mount_source) {
        Some(first) => clean_path(&format!("{}/{}", first.mount_point, entry.root))
            .to_string_lossy()
            .into_owned(),
        None => {
            cache.insert(entry.mount_source.clone(), entry.clone());
            entry.mount_source.clone()
        }
    };

    Ok(Some(MountRecord {
        device: entry.mount_source.clone(),
        path: entry.mount_point.clone(),
        source,
        fs_type: entry.fs_type.clone(),
        opts: entry.mount_opts.clone(),
    }))
}

/// Tokenise one `mountinfo` line.
pub fn parse_mountinfo_line(line: &str) -> Result<MountEntry> {
    let (pre, post) = line
        .split_once(" - ")
        .ok_or_else(|| FsError::Parse(format!("mountinfo line without separator: {}", line)))?;

    let pre_fields: Vec<&str> = pre.split_whitespace().collect();
    let post_fields: Vec<&str> = post.split_whitespace().collect();
    if pre_fields.len() < 6 || post_fields.len() < 2 {
        return Err(FsError::Parse(format!("truncated mountinfo line: {}", line)));
    }

    Ok(MountEntry {
        mount_id: pre_fields[0].to_string(),
        parent_id: pre_fields[1].to_string(),
        major_minor: pre_fields[2].to_string(),
        root: unescape(pre_fields[3]),
        mount_point: unescape(pre_fields[4]),
        mount_opts: split_opts(pre_fields[5]),
        optional_fields: pre_fields[6..].iter().map(|s| s.to_string()).collect(),
        fs_type: post_fields[0].to_string(),
        mount_source: unescape(post_fields[1]),
        super_opts: post_fields.get(2).map(|o| split_opts(o)).unwrap_or_default(),
    })
}

/// Parse a full `mountinfo` document, passing every entry through `scan`.
pub fn read_mountinfo_from(content: &str, scan: EntryScanFn) -> Result<Vec<MountRecord>> {
    let mut cache = EntryCache::new();
    let mut records = Vec::new();
    for line in content.lines() {
        if line.trim().is_empty() {
            continue;
        }
        let entry = parse_mountinfo_line(line)?;
        if let Some(record) = scan(&entry, &mut cache)? {
            records.push(record);
        }
    }
    Ok(records)
}

/// Parse macOS `mount` output: `<device> on <path> (<type>, <opts...>)`.
///
/// Lines whose device is not a path (`map auto_home`, network shares) are
/// skipped.
pub fn parse_mount_output(output: &str) -> Result<Vec<MountRecord>> {
    let mut records = Vec::new();
    for line in output.lines() {
        let Some(caps) = DARWIN_MOUNT_RE.captures(line) else {
            continue;
        };
        let device = &caps[1];
        if !device.starts_with('/') {
            continue;
        }
        let mut options: Vec<String> = caps[3].split(',').map(|o| o.trim().to_string()).collect();
        if options.is_empty() || options[0].is_empty() {
            return Err(FsError::Parse(format!("mount options for {}", device)));
        }
        let fs_type = options.remove(0);
        records.push(MountRecord {
            device: device.to_string(),
            path: caps[2].to_string(),
            source: device.to_string(),
            fs_type,
            opts: options,
        });
    }
    Ok(records)
}

/// Build the argument vector for `mount`:
/// `[-t <type>] [-o <opts>] [<source>] <target>`.
///
/// Blank options are dropped and repeated options collapse to their first
/// occurrence.
pub fn make_mount_args<S: AsRef<str>>(
    source: &str,
    target: &str,
    fs_type: &str,
    options: &[S],
) -> Vec<String> {
    let mut args = Vec::new();
    if !fs_type.is_empty() {
        args.push("-t".to_string());
        args.push(fs_type.to_string());
    }

    let mut unique: Vec<&str> = Vec::new();
    for opt in options {
        let opt = opt.as_ref().trim();
        if !opt.is_empty() && !unique.contains(&opt) {
            unique.push(opt);
        }
    }
    if !unique.is_empty() {
        args.push("-o".to_string());
        args.push(unique.join(","));
    }

    if !source.is_empty() {
        args.push(source.to_string());
    }
    args.push(target.to_string());
    args
}

/// Read `path` until two consecutive reads return identical bytes.
///
/// The kernel generates `mountinfo` page by page, so a mount or unmount
/// racing with the read can produce a torn snapshot.
pub(crate) fn consistent_read(path: &Path, retries: usize) -> Result<Vec<u8>> {
    let mut previous = fs::read(path)?;
    for attempt in 0..retries {
        let current = fs::read(path)?;
        if current == previous {
            return Ok(current);
        }
        debug!(path = %path.display(), attempt, "Mount table changed while reading, retrying");
        previous = current;
    }
    warn!(path = %path.display(), retries, "No consistent read of mount table");
    Err(FsError::InconsistentRead {
        path: path.display().to_string(),
        attempts: retries,
    })
}

impl<R: CommandRunner> Fs<R> {
    /// All mounted filesystems, in table order.
    pub fn get_mounts(&self) -> Result<Vec<MountRecord>> {
        #[cfg(target_os = "linux")]
        {
            let content = consistent_read(&self.paths.proc_mountinfo, self.paths.mountinfo_retries)?;
            read_mountinfo_from(&String::from_utf8_lossy(&content), self.scan_entry)
        }
        #[cfg(target_os = "macos")]
        {
            let output = crate::exec::run_checked(&self.runner, "mount", &[])?;
            parse_mount_output(&output.stdout_str())
        }
        #[cfg(not(any(target_os = "linux", target_os = "macos")))]
        {
            Err(FsError::NotImplemented)
        }
    }

    /// Parse an arbitrary mountinfo-format file with the configured scan
    /// callback. No consistency retry is applied.
    pub fn read_proc_mounts(&self, path: impl AsRef<Path>) -> Result<Vec<MountRecord>> {
        let content = fs::read_to_string(path.as_ref())?;
        read_mountinfo_from(&content, self.scan_entry)
    }

    /// Mounts whose device is exactly `device`.
    pub fn get_dev_mounts(&self, device: &str) -> Result<Vec<MountRecord>> {
        Ok(self
            .get_mounts()?
            .into_iter()
            .filter(|m| m.device == device)
            .collect())
    }
}

fn split_opts(field: &str) -> Vec<String> {
    field.split(',').map(|s| s.to_string()).collect()
}

/// Decode the `\ooo` octal escapes the kernel uses for space, tab, newline
/// and backslash in path fields.
fn unescape(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\'
            && i + 3 < bytes.len()
            && bytes[i + 1..i + 4].iter().all(|b| (b'0'..=b'7').contains(b))
        {
            let value = (bytes[i + 1] - b'0') as u32 * 64
                + (bytes[i + 2] - b'0') as u32 * 8
                + (bytes[i + 3] - b'0') as u32;
            if let Ok(byte) = u8::try_from(value) {
                out.push(byte);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    const MOUNTINFO: &str = "\
22 28 0:21 / /sys rw,nosuid,nodev,noexec,relatime shared:7 - sysfs sysfs rw
26 28 0:5 / /dev rw,nosuid,relatime shared:2 - devtmpfs udev rw,size=8148068k,nr_inodes=2037017,mode=755
28 1 8:1 / / rw,relatime shared:1 - ext4 /dev/sda1 rw,errors=remount-ro
301 28 8:16 / /var/lib/kubelet/plugins/csi/vol-1 rw,noatime shared:150 - xfs /dev/sdb rw,attr2,inode64
305 28 8:16 /data /var/lib/kubelet/pods/p1/volumes/vol-1 rw,noatime,rw shared:150 - xfs /dev/sdb rw,attr2,inode64
310 28 0:52 / /mnt/nfs rw,relatime shared:160 - nfs4 10.0.0.5:/export rw,vers=4.1
";

    #[test]
    fn test_parse_line_fields() {
        let entry = parse_mountinfo_line(
            "36 35 98:0 /mnt1 /mnt2 rw,noatime master:1 - ext3 /dev/root rw,errors=continue",
        )
        .unwrap();
        assert_eq!(entry.mount_id, "36");
        assert_eq!(entry.parent_id, "35");
        assert_eq!(entry.major_minor, "98:0");
        assert_eq!(entry.root, "/mnt1");
        assert_eq!(entry.mount_point, "/mnt2");
        assert_eq!(entry.mount_opts, vec!["rw", "noatime"]);
        assert_eq!(entry.optional_fields, vec!["master:1"]);
        assert_eq!(entry.fs_type, "ext3");
        assert_eq!(entry.mount_source, "/dev/root");
        assert_eq!(entry.super_opts, vec!["rw", "errors=continue"]);
    }

    #[test]
    fn test_parse_line_without_optional_fields() {
        let entry = parse_mountinfo_line("40 28 8:2 / /boot rw - vfat /dev/sda2 rw").unwrap();
        assert!(entry.optional_fields.is_empty());
        assert_eq!(entry.fs_type, "vfat");
    }

    #[test]
    fn test_parse_line_unescapes_paths() {
        let entry =
            parse_mountinfo_line(r"40 28 8:2 / /mnt/my\040disk rw - ext4 /dev/sdc rw").unwrap();
        assert_eq!(entry.mount_point, "/mnt/my disk");
    }

    #[test]
    fn test_parse_line_rejects_garbage() {
        assert!(parse_mountinfo_line("not a mountinfo line").is_err());
        assert!(parse_mountinfo_line("1 2 - ext4").is_err());
    }

    #[test]
    fn test_default_scan_filters_and_resolves_binds() {
        let records = read_mountinfo_from(MOUNTINFO, default_entry_scan).unwrap();
        let paths: Vec<&str> = records.iter().map(|r| r.path.as_str()).collect();
        // sysfs is dropped, devtmpfs and nfs4 kept
        assert_eq!(
            paths,
            vec![
                "/dev",
                "/",
                "/var/lib/kubelet/plugins/csi/vol-1",
                "/var/lib/kubelet/pods/p1/volumes/vol-1",
                "/mnt/nfs",
            ]
        );

        let staging = &records[2];
        assert_eq!(staging.device, "/dev/sdb");
        assert_eq!(staging.source, "/dev/sdb");
        assert_eq!(staging.fs_type, "xfs");

        let bind = &records[3];
        assert_eq!(bind.device, "/dev/sdb");
        assert_eq!(bind.source, "/var/lib/kubelet/plugins/csi/vol-1/data");
        // duplicates preserved in table order
        assert_eq!(bind.opts, vec!["rw", "noatime", "rw"]);
    }

    #[test]
    fn test_parse_is_idempotent() {
        let first = read_mountinfo_from(MOUNTINFO, default_entry_scan).unwrap();
        let second = read_mountinfo_from(MOUNTINFO, default_entry_scan).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_custom_scan_can_filter() {
        fn only_with_noatime(
            entry: &MountEntry,
            cache: &mut EntryCache,
        ) -> Result<Option<MountRecord>> {
            if !entry.mount_opts.iter().any(|o| o == "noatime") {
                return Ok(None);
            }
            default_entry_scan(entry, cache)
        }
        let records = read_mountinfo_from(MOUNTINFO, only_with_noatime).unwrap();
        assert_eq!(records.len(), 2);
        assert!(records.iter().all(|r| r.device == "/dev/sdb"));
    }

    #[test]
    fn test_parse_darwin_mount_output() {
        let output = "\
/dev/disk1s1 on / (apfs, local, journaled)
devfs on /dev (devfs, local, nobrowse)
/dev/disk1s4 on /private/var/vm (apfs, local, noexec, journaled, noatime, nobrowse)
map auto_home on /System/Volumes/Data/home (autofs, automounted, nobrowse)
";
        let records = parse_mount_output(output).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(
            records[0],
            MountRecord {
                device: "/dev/disk1s1".into(),
                path: "/".into(),
                source: "/dev/disk1s1".into(),
                fs_type: "apfs".into(),
                opts: vec!["local".into(), "journaled".into()],
            }
        );
        assert_eq!(records[1].path, "/private/var/vm");
        assert_eq!(records[1].opts.len(), 5);
    }

    #[test]
    fn test_make_mount_args() {
        let cases: Vec<(&str, &str, &str, Vec<&str>, &str)> = vec![
            ("localhost:/data", "/mnt", "nfs", vec![], "-t nfs localhost:/data /mnt"),
            ("localhost:/data", "/mnt", "", vec![], "localhost:/data /mnt"),
            (
                "localhost:/data",
                "/mnt",
                "nfs",
                vec!["tcp", "vers=4"],
                "-t nfs -o tcp,vers=4 localhost:/data /mnt",
            ),
            (
                "/dev/disk/mydisk",
                "/mnt/mydisk",
                "xfs",
                vec!["ro", "noatime", "ro"],
                "-t xfs -o ro,noatime /dev/disk/mydisk /mnt/mydisk",
            ),
            ("/dev/sdc", "/mnt", "", vec!["rw", "", "noatime"], "-o rw,noatime /dev/sdc /mnt"),
            ("", "/mnt", "", vec!["remount", "ro"], "-o remount,ro /mnt"),
        ];
        for (src, tgt, fst, opts, expected) in cases {
            assert_eq!(make_mount_args(src, tgt, fst, &opts).join(" "), expected);
        }
    }

    #[test]
    fn test_consistent_read_stable_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mountinfo");
        fs::write(&path, MOUNTINFO).unwrap();
        let content = consistent_read(&path, 30).unwrap();
        assert_eq!(content, MOUNTINFO.as_bytes());
    }

    #[test]
    fn test_consistent_read_zero_retries_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mountinfo");
        fs::write(&path, MOUNTINFO).unwrap();
        let err = consistent_read(&path, 0).unwrap_err();
        assert!(matches!(err, FsError::InconsistentRead { attempts: 0, .. }));
    }

    #[test]
    fn test_consistent_read_missing_file() {
        let err = consistent_read(Path::new("/nonexistent/mountinfo"), 30).unwrap_err();
        assert!(matches!(err, FsError::Io(_)));
    }
}
