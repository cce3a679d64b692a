//! Argument validation run before any command is spawned or sysfs file is
//! touched.

use std::path::{Component, Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;

use crate::error::{FsError, Result};

/// Filesystem types accepted by mount and format operations.
pub const SUPPORTED_FS_TYPES: [&str; 4] = ["ext3", "ext4", "xfs", "nfs"];

// e.g. "rw", "noatime", "vers=4", "uid=1000"
static MOUNT_OPTION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\w+=*\w*").expect("mount option pattern"));

// e.g. "-A", "-iR", "-h1", "-f"
static MULTIPATH_FLAG_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^-[A-Za-z0-9]+$").expect("multipath flag pattern"));

/// Reject the filesystem root. Every other string is accepted.
pub fn validate_path(path: &str) -> Result<()> {
    if path == "/" {
        return Err(FsError::InvalidPath(path.to_string()));
    }
    Ok(())
}

/// Exact-case membership in [`SUPPORTED_FS_TYPES`].
///
/// Callers that treat an empty type as "auto" skip this check.
pub fn validate_fs_type(fs_type: &str) -> Result<()> {
    if !SUPPORTED_FS_TYPES.contains(&fs_type) {
        return Err(FsError::InvalidFsType(fs_type.to_string()));
    }
    Ok(())
}

pub fn validate_mount_options<S: AsRef<str>>(options: &[S]) -> Result<()> {
    for opt in options {
        let opt = opt.as_ref();
        // Blank options are dropped when the argument vector is built
        if opt.trim().is_empty() {
            continue;
        }
        if !MOUNT_OPTION_RE.is_match(opt) {
            return Err(FsError::InvalidMountOption(opt.to_string()));
        }
    }
    Ok(())
}

/// Each argument is either a short flag or a path other than `/`.
pub fn validate_multipath_args<S: AsRef<str>>(args: &[S]) -> Result<()> {
    for arg in args {
        let arg = arg.as_ref();
        if MULTIPATH_FLAG_RE.is_match(arg) {
            continue;
        }
        let cleaned = clean_path(arg);
        if validate_path(&cleaned.to_string_lossy()).is_err() {
            return Err(FsError::InvalidMultipathOption(arg.to_string()));
        }
    }
    Ok(())
}

/// Source, target, optional filesystem type and options of a mount call.
pub fn validate_mount_args<S: AsRef<str>>(
    source: &str,
    target: &str,
    fs_type: &str,
    options: &[S],
) -> Result<()> {
    validate_path(source)?;
    validate_path(target)?;
    if !fs_type.is_empty() {
        validate_fs_type(fs_type)?;
    }
    validate_mount_options(options)
}

/// Lexically normalise a path: collapse separators, drop `.` components and
/// resolve `..` against the preceding component. An empty result is `.`.
pub fn clean_path(path: &str) -> PathBuf {
    let mut out: Vec<Component<'_>> = Vec::new();
    for component in Path::new(path).components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => match out.last() {
                Some(Component::Normal(_)) => {
                    out.pop();
                }
                Some(Component::RootDir) => {}
                _ => out.push(component),
            },
            other => out.push(other),
        }
    }
    if out.is_empty() {
        return PathBuf::from(".");
    }
    out.iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_path_rejects_only_root() {
        assert!(validate_path("/").is_err());
        assert!(validate_path("").is_ok());
        assert!(validate_path("relative/dir").is_ok());
        assert!(validate_path("/dev/sda").is_ok());
        assert!(validate_path("/does/not/exist").is_ok());
        assert_eq!(
            validate_path("/").unwrap_err().to_string(),
            "Path: / is invalid"
        );
    }

    #[test]
    fn test_validate_fs_type_exact_set() {
        for fs in ["ext3", "ext4", "xfs", "nfs"] {
            assert!(validate_fs_type(fs).is_ok(), "{} should be accepted", fs);
        }
        for fs in ["EXT4", "Xfs", "btrfs", "ntfs", "zfs", "ext2", "nfs4", " ext4"] {
            assert!(validate_fs_type(fs).is_err(), "{} should be rejected", fs);
        }
        assert_eq!(
            validate_fs_type("fstype").unwrap_err().to_string(),
            "FsType: fstype is invalid"
        );
    }

    #[test]
    fn test_validate_mount_options() {
        assert!(validate_mount_options(&["rw", "noatime", "vers=4", "", " "]).is_ok());
        assert!(validate_mount_options::<&str>(&[]).is_ok());
        assert!(validate_mount_options(&["rw", "=="]).is_err());
        assert!(validate_mount_options(&["--"]).is_err());
    }

    #[test]
    fn test_validate_multipath_args() {
        assert!(validate_multipath_args(&["-f", "mpatha"]).is_ok());
        assert!(validate_multipath_args(&["-A", "-iR", "-h1"]).is_ok());
        assert!(validate_multipath_args(&["/dev/sdb", "/tmp", "", " "]).is_ok());
        assert!(validate_multipath_args(&["-W"]).is_ok());

        assert!(validate_multipath_args(&["/"]).is_err());
        assert!(validate_multipath_args(&["//"]).is_err());
        assert!(validate_multipath_args(&["/tmp/.."]).is_err());
        assert!(validate_multipath_args(&["-f", "/dev/../"]).is_err());
    }

    #[test]
    fn test_validate_mount_args() {
        assert!(validate_mount_args("/", "", "", &["a", "b"]).is_err());
        assert!(validate_mount_args("source", "/", "", &["a", "b"]).is_err());
        assert_eq!(
            validate_mount_args("source", "target", "fstype", &["a"])
                .unwrap_err()
                .to_string(),
            "FsType: fstype is invalid"
        );
        assert!(validate_mount_args("/dev/sdb", "/mnt/data", "", &["rw"]).is_ok());
    }

    #[test]
    fn test_clean_path() {
        assert_eq!(clean_path(""), PathBuf::from("."));
        assert_eq!(clean_path("//"), PathBuf::from("/"));
        assert_eq!(clean_path("/a/./b/../c"), PathBuf::from("/a/c"));
        assert_eq!(clean_path("/.."), PathBuf::from("/"));
        assert_eq!(clean_path("../x"), PathBuf::from("../x"));
    }
}
