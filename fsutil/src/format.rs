//! Mounting, unmounting and first-use formatting of volumes.

use tracing::{error, info, warn};

use crate::Fs;
use crate::error::{FsError, Result};
use crate::exec::{CommandRunner, run_checked};
use crate::mount::make_mount_args;
use crate::validate::{clean_path, validate_mount_args, validate_path};

/// Marks the trailing mount option that carries raw `mkfs` arguments.
pub const FS_FORMAT_OPTION_PREFIX: &str = "fsFormatOption:";

/// Filesystem created when the caller does not name one.
pub const DEFAULT_FS_TYPE: &str = "ext4";

/// Reported by [`Fs::get_disk_format`] for a device with child devices but
/// no filesystem of its own.
pub const PARTITIONED_FORMAT: &str = "unknown data, probably partitions";

/// Per-request settings for format operations.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FormatContext {
    /// Skip the discard pass of `mkfs`, which can take minutes on thin LUNs
    pub no_discard: bool,
    /// Caller's request id, attached to log lines
    pub request_id: Option<String>,
}

impl FormatContext {
    fn request_id(&self) -> &str {
        self.request_id.as_deref().unwrap_or("")
    }
}

/// Detect a bind mount request.
///
/// Returns the options for the follow-up remount (`remount` plus every
/// option other than `bind`/`remount`) and whether `bind` was present.
pub fn is_bind<S: AsRef<str>>(options: &[S]) -> (Vec<String>, bool) {
    let mut bind = false;
    let mut remount = vec!["remount".to_string()];
    for opt in options {
        match opt.as_ref() {
            "bind" => bind = true,
            "remount" => {}
            other => remount.push(other.to_string()),
        }
    }
    (remount, bind)
}

/// Pull a trailing `fsFormatOption:<args>` entry out of the mount options.
///
/// Returns the remaining mount options and the whitespace separated `mkfs`
/// arguments.
pub fn split_format_option(options: &[String]) -> (Vec<String>, Vec<String>) {
    if let Some((last, rest)) = options.split_last()
        && let Some(raw) = last.strip_prefix(FS_FORMAT_OPTION_PREFIX)
    {
        let format_options = raw.split_whitespace().map(str::to_string).collect();
        return (rest.to_vec(), format_options);
    }
    (options.to_vec(), Vec::new())
}

/// Arguments for `mkfs.<fs_type>` on `source`.
pub fn mkfs_args(
    fs_type: &str,
    source: &str,
    format_options: &[String],
    no_discard: bool,
) -> Vec<String> {
    let ext = fs_type == "ext4" || fs_type == "ext3";
    let xfs = fs_type == "xfs";

    let mut args: Vec<String> = format_options.to_vec();
    if format_options.is_empty() {
        if ext {
            args.push("-F".into());
            if no_discard {
                args.extend(["-E".into(), "nodiscard".into()]);
            }
        } else if xfs && no_discard {
            args.push("-K".into());
        }
        args.push(source.to_string());
        if xfs {
            args.extend(["-m".into(), "crc=0".into()]);
        }
    } else {
        if no_discard && ext {
            args.extend(["-E".into(), "nodiscard".into()]);
        } else if no_discard && xfs {
            args.push("-K".into());
        }
        args.push(source.to_string());
    }
    args
}

/// Interpret `lsblk -n -o FSTYPE` output.
///
/// An unformatted disk prints a single empty line. Further lines belong to
/// child devices (partitions).
pub fn parse_disk_format(output: &str) -> String {
    let output = output.strip_suffix('\n').unwrap_or(output);
    let lines: Vec<&str> = output.split('\n').collect();
    let first = lines[0].trim();
    if !first.is_empty() {
        return first.to_string();
    }
    if lines.len() == 1 {
        return String::new();
    }
    PARTITIONED_FORMAT.to_string()
}

impl<R: CommandRunner> Fs<R> {
    /// Mount `source` on `target`. Requests containing `bind` are routed to
    /// [`Fs::bind_mount`].
    pub fn mount<S: AsRef<str>>(
        &self,
        source: &str,
        target: &str,
        fs_type: &str,
        options: &[S],
    ) -> Result<()> {
        if is_bind(options).1 {
            return self.bind_mount(source, target, options);
        }
        self.do_mount("mount", source, target, fs_type, options)
    }

    /// Bind mount `source` on `target`, then remount to apply `options`.
    ///
    /// The kernel ignores most options on the initial bind.
    pub fn bind_mount<S: AsRef<str>>(&self, source: &str, target: &str, options: &[S]) -> Result<()> {
        if cfg!(target_os = "macos") {
            return self.do_mount("bindfs", source, target, "", options);
        }
        let (remount, _) = is_bind(options);
        self.do_mount("mount", source, target, "", &["bind"])?;
        self.do_mount("mount", source, target, "", &remount)
    }

    fn do_mount<S: AsRef<str>>(
        &self,
        program: &str,
        source: &str,
        target: &str,
        fs_type: &str,
        options: &[S],
    ) -> Result<()> {
        validate_mount_args(source, target, fs_type, options)?;
        let args = make_mount_args(source, target, fs_type, options);
        run_checked(&self.runner, program, &args)?;
        Ok(())
    }

    /// Unmount `target`.
    pub fn unmount(&self, target: &str) -> Result<()> {
        validate_path(target)?;
        info!(path = %target, "Unmounting");

        #[cfg(target_os = "linux")]
        {
            nix::mount::umount(target).map_err(|e| {
                error!(path = %target, error = %e, "Unmount failed");
                FsError::Unmount {
                    target: target.to_string(),
                    reason: e.to_string(),
                }
            })
        }
        #[cfg(not(target_os = "linux"))]
        {
            run_checked(&self.runner, "umount", &[target.to_string()])
                .map(|_| ())
                .map_err(|e| FsError::Unmount {
                    target: target.to_string(),
                    reason: e.to_string(),
                })
        }
    }

    /// Filesystem currently on `disk`, empty when unformatted.
    pub fn get_disk_format(&self, disk: &str) -> Result<String> {
        validate_path(&clean_path(disk).to_string_lossy())?;

        if cfg!(target_os = "linux") {
            info!(disk = %disk, "Checking if disk is formatted using lsblk");
            let args = vec!["-n".into(), "-o".into(), "FSTYPE".into(), disk.to_string()];
            let output = run_checked(&self.runner, "lsblk", &args)?;
            return Ok(parse_disk_format(&output.stdout_str()));
        }

        self.get_mounts()?
            .into_iter()
            .find(|m| m.device == disk)
            .map(|m| m.fs_type)
            .ok_or_else(|| FsError::NotFound(format!("disk format of {}", disk)))
    }

    /// Mount `source`, formatting it first if it carries no filesystem.
    ///
    /// A failed mount is followed by a format check: an empty disk is
    /// formatted as `fs_type` (ext4 when empty) and mounted again; a disk
    /// already holding the requested type surfaces the mount error; any other
    /// filesystem is reported as a mismatch.
    pub fn format_and_mount(
        &self,
        ctx: &FormatContext,
        source: &str,
        target: &str,
        fs_type: &str,
        options: &[String],
    ) -> Result<()> {
        if !cfg!(target_os = "linux") {
            return Err(FsError::NotImplemented);
        }
        validate_mount_args(source, target, fs_type, options)?;

        let (mut options, format_options) = split_format_option(options);
        options.push("defaults".to_string());

        info!(
            request_id = %ctx.request_id(),
            source = %source,
            target = %target,
            fs_type = %fs_type,
            options = ?options,
            "Attempting to mount disk"
        );
        let mount_err = match self.mount(source, target, fs_type, &options) {
            Ok(()) => return Ok(()),
            Err(e) => e,
        };
        info!(request_id = %ctx.request_id(), error = %mount_err, "Mount attempt failed");

        let existing = self.get_disk_format(source)?;
        info!(
            request_id = %ctx.request_id(),
            source = %source,
            existing_format = %existing,
            "Disk format after failed mount"
        );

        if existing.is_empty() {
            let fs_type = if fs_type.is_empty() { DEFAULT_FS_TYPE } else { fs_type };
            let args = mkfs_args(fs_type, source, &format_options, ctx.no_discard);
            info!(request_id = %ctx.request_id(), source = %source, fs_type = %fs_type, "Disk appears unformatted, formatting");

            // Another caller may have formatted the disk concurrently, so the
            // mount is retried whatever mkfs reports.
            match run_checked(&self.runner, &format!("mkfs.{}", fs_type), &args) {
                Ok(_) => info!(source = %source, fs_type = %fs_type, "Disk formatted"),
                Err(e) => error!(source = %source, error = %e, "Format of disk failed"),
            }

            info!(request_id = %ctx.request_id(), "Re-attempting disk mount");
            return self.mount(source, target, fs_type, &options);
        }

        if !fs_type.is_empty() && fs_type == existing {
            warn!(source = %source, existing_format = %existing, "Disk failed to mount");
            return Err(mount_err);
        }

        Err(FsError::FormatMismatch {
            requested: fs_type.to_string(),
            existing,
            source: Box::new(mount_err),
        })
    }

    /// Create a filesystem on `source` without mounting it.
    pub fn format(
        &self,
        ctx: &FormatContext,
        source: &str,
        target: &str,
        fs_type: &str,
        options: &[String],
    ) -> Result<()> {
        if !cfg!(target_os = "linux") {
            return Err(FsError::NotImplemented);
        }
        validate_mount_args(source, target, fs_type, options)?;

        let (_, format_options) = split_format_option(options);
        let fs_type = if fs_type.is_empty() { DEFAULT_FS_TYPE } else { fs_type };
        let args = mkfs_args(fs_type, source, &format_options, ctx.no_discard);
        info!(request_id = %ctx.request_id(), source = %source, fs_type = %fs_type, "Formatting disk");
        run_checked(&self.runner, &format!("mkfs.{}", fs_type), &args)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SysPaths;
    use crate::exec::{CommandOutput, ScriptedRunner};

    fn scripted() -> Fs<ScriptedRunner> {
        Fs::with_runner(SysPaths::default(), ScriptedRunner::new())
    }

    fn opts(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_is_bind() {
        let (remount, bind) = is_bind(&["a", "bind", "remount"]);
        assert!(bind);
        assert_eq!(remount, vec!["remount", "a"]);

        let (_, bind) = is_bind(&["rw", "noatime"]);
        assert!(!bind);
    }

    #[test]
    fn test_split_format_option() {
        let (rest, fmt) = split_format_option(&opts(&["rw", "fsFormatOption:-b 4096  -L data"]));
        assert_eq!(rest, vec!["rw"]);
        assert_eq!(fmt, vec!["-b", "4096", "-L", "data"]);

        // only honoured as the last option
        let (rest, fmt) = split_format_option(&opts(&["fsFormatOption:-b 4096", "rw"]));
        assert_eq!(rest.len(), 2);
        assert!(fmt.is_empty());
    }

    #[test]
    fn test_mkfs_args_defaults() {
        let none: Vec<String> = Vec::new();
        assert_eq!(mkfs_args("ext4", "/dev/sdz", &none, false), vec!["-F", "/dev/sdz"]);
        assert_eq!(
            mkfs_args("ext3", "/dev/sdz", &none, true),
            vec!["-F", "-E", "nodiscard", "/dev/sdz"]
        );
        assert_eq!(
            mkfs_args("xfs", "/dev/sdz", &none, false),
            vec!["/dev/sdz", "-m", "crc=0"]
        );
        assert_eq!(
            mkfs_args("xfs", "/dev/sdz", &none, true),
            vec!["-K", "/dev/sdz", "-m", "crc=0"]
        );
        assert_eq!(mkfs_args("nfs", "/dev/sdz", &none, true), vec!["/dev/sdz"]);
    }

    #[test]
    fn test_mkfs_args_with_format_options() {
        let fmt = opts(&["-b", "4096"]);
        assert_eq!(
            mkfs_args("ext4", "/dev/sdz", &fmt, false),
            vec!["-b", "4096", "/dev/sdz"]
        );
        assert_eq!(
            mkfs_args("ext4", "/dev/sdz", &fmt, true),
            vec!["-b", "4096", "-E", "nodiscard", "/dev/sdz"]
        );
        assert_eq!(
            mkfs_args("xfs", "/dev/sdz", &fmt, true),
            vec!["-b", "4096", "-K", "/dev/sdz"]
        );
    }

    #[test]
    fn test_parse_disk_format() {
        assert_eq!(parse_disk_format("ext4\n"), "ext4");
        assert_eq!(parse_disk_format("\n"), "");
        assert_eq!(parse_disk_format(""), "");
        assert_eq!(parse_disk_format("\n\n"), PARTITIONED_FORMAT);
        assert_eq!(parse_disk_format("\nxfs\n"), PARTITIONED_FORMAT);
    }

    #[test]
    fn test_mount_builds_arguments() {
        let fs_ = scripted();
        fs_.mount("/dev/sdc", "/mnt/data", "xfs", &["ro", "noatime", "ro"])
            .unwrap();
        assert_eq!(
            fs_.runner().command_lines(),
            vec!["mount -t xfs -o ro,noatime /dev/sdc /mnt/data"]
        );
    }

    #[test]
    fn test_mount_validates_before_running() {
        let fs_ = scripted();
        assert!(fs_.mount("/dev/sdc", "/", "", &["rw"]).is_err());
        assert!(fs_.mount("/dev/sdc", "/mnt", "btrfs", &["rw"]).is_err());
        assert!(fs_.runner().calls().is_empty());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_bind_mount_is_two_invocations() {
        let fs_ = scripted();
        fs_.mount("/var/lib/staging", "/var/lib/pod", "", &["bind", "ro"])
            .unwrap();
        assert_eq!(
            fs_.runner().command_lines(),
            vec![
                "mount -o bind /var/lib/staging /var/lib/pod",
                "mount -o remount,ro /var/lib/staging /var/lib/pod",
            ]
        );
    }

    #[test]
    fn test_mount_error_carries_output() {
        let fs_ = scripted();
        fs_.runner()
            .respond("mount", CommandOutput::failed(32, "wrong fs type, bad option"));
        let err = fs_.mount("/dev/sdc", "/mnt", "ext4", &["rw"]).unwrap_err();
        let msg = err.to_string();
        assert!(msg.starts_with("mount failed"));
        assert!(msg.contains("-t ext4 -o rw /dev/sdc /mnt"));
        assert!(msg.contains("wrong fs type"));
    }

    #[cfg(target_os = "linux")]
    mod linux {
        use super::*;

        #[test]
        fn test_get_disk_format() {
            let fs_ = scripted();
            fs_.runner().respond("lsblk", CommandOutput::ok("xfs\n"));
            assert_eq!(fs_.get_disk_format("/dev/sdb").unwrap(), "xfs");
            assert_eq!(
                fs_.runner().command_lines(),
                vec!["lsblk -n -o FSTYPE /dev/sdb"]
            );
            assert!(fs_.get_disk_format("/").is_err());
        }

        #[test]
        fn test_format_and_mount_first_try() {
            let fs_ = scripted();
            fs_.format_and_mount(&FormatContext::default(), "/dev/sdz1", "/mnt/x", "ext4", &[])
                .unwrap();
            assert_eq!(
                fs_.runner().command_lines(),
                vec!["mount -t ext4 -o defaults /dev/sdz1 /mnt/x"]
            );
        }

        #[test]
        fn test_format_and_mount_formats_blank_disk() {
            let fs_ = scripted();
            fs_.runner()
                .respond("mount", CommandOutput::failed(32, "wrong fs type"))
                .respond("lsblk", CommandOutput::ok("\n"));
            fs_.format_and_mount(&FormatContext::default(), "/dev/sdz1", "/mnt/x", "ext4", &[])
                .unwrap();
            assert_eq!(
                fs_.runner().command_lines(),
                vec![
                    "mount -t ext4 -o defaults /dev/sdz1 /mnt/x",
                    "lsblk -n -o FSTYPE /dev/sdz1",
                    "mkfs.ext4 -F /dev/sdz1",
                    "mount -t ext4 -o defaults /dev/sdz1 /mnt/x",
                ]
            );
        }

        #[test]
        fn test_format_and_mount_defaults_to_ext4() {
            let fs_ = scripted();
            fs_.runner()
                .respond("mount", CommandOutput::failed(32, "wrong fs type"));
            fs_.format_and_mount(&FormatContext::default(), "/dev/sdz1", "/mnt/x", "", &[])
                .unwrap();
            let lines = fs_.runner().command_lines();
            assert_eq!(lines[2], "mkfs.ext4 -F /dev/sdz1");
            assert_eq!(lines[3], "mount -t ext4 -o defaults /dev/sdz1 /mnt/x");
        }

        #[test]
        fn test_format_and_mount_no_discard_and_format_option() {
            let fs_ = scripted();
            fs_.runner()
                .respond("mount", CommandOutput::failed(32, "wrong fs type"));
            let ctx = FormatContext {
                no_discard: true,
                request_id: Some("req-42".into()),
            };
            fs_.format_and_mount(
                &ctx,
                "/dev/sdz1",
                "/mnt/x",
                "xfs",
                &opts(&["noatime", "fsFormatOption:-i size=512"]),
            )
            .unwrap();
            let lines = fs_.runner().command_lines();
            assert_eq!(lines[0], "mount -t xfs -o noatime,defaults /dev/sdz1 /mnt/x");
            assert_eq!(lines[2], "mkfs.xfs -i size=512 -K /dev/sdz1");
        }

        #[test]
        fn test_format_and_mount_retries_after_mkfs_failure() {
            let fs_ = scripted();
            fs_.runner()
                .respond("mount", CommandOutput::failed(32, "wrong fs type"))
                .respond("mkfs.ext4", CommandOutput::failed(1, "device busy"));
            fs_.format_and_mount(&FormatContext::default(), "/dev/sdz1", "/mnt/x", "ext4", &[])
                .unwrap();
            assert_eq!(fs_.runner().calls().len(), 4);
        }

        #[test]
        fn test_format_and_mount_same_format_returns_mount_error() {
            let fs_ = scripted();
            fs_.runner()
                .respond("mount", CommandOutput::failed(32, "structure needs cleaning"))
                .respond("lsblk", CommandOutput::ok("ext4\n"));
            let err = fs_
                .format_and_mount(&FormatContext::default(), "/dev/sdz1", "/mnt/x", "ext4", &[])
                .unwrap_err();
            assert!(matches!(err, FsError::CommandFailed { .. }));
            assert!(err.to_string().contains("structure needs cleaning"));
            assert_eq!(fs_.runner().calls().len(), 2);
        }

        #[test]
        fn test_format_and_mount_mismatch() {
            let fs_ = scripted();
            fs_.runner()
                .respond("mount", CommandOutput::failed(32, "wrong fs type"))
                .respond("lsblk", CommandOutput::ok("xfs\n"));
            let err = fs_
                .format_and_mount(&FormatContext::default(), "/dev/sdz1", "/mnt/x", "ext4", &[])
                .unwrap_err();
            match err {
                FsError::FormatMismatch {
                    requested,
                    existing,
                    ..
                } => {
                    assert_eq!(requested, "ext4");
                    assert_eq!(existing, "xfs");
                }
                other => panic!("unexpected error: {other}"),
            }
        }

        #[test]
        fn test_format_and_mount_unspecified_type_with_existing_fs() {
            let fs_ = scripted();
            fs_.runner()
                .respond("mount", CommandOutput::failed(32, "bad option"))
                .respond("lsblk", CommandOutput::ok("ext4\n"));
            let err = fs_
                .format_and_mount(&FormatContext::default(), "/dev/sdz1", "/mnt/x", "", &[])
                .unwrap_err();
            assert!(matches!(err, FsError::FormatMismatch { .. }));
        }

        #[test]
        fn test_format_and_mount_validates() {
            let fs_ = scripted();
            let err = fs_
                .format_and_mount(&FormatContext::default(), "/", "/mnt/x", "ext4", &[])
                .unwrap_err();
            assert!(matches!(err, FsError::InvalidPath(_)));
            assert!(fs_.runner().calls().is_empty());
        }

        #[test]
        fn test_format_only() {
            let fs_ = scripted();
            fs_.format(&FormatContext::default(), "/dev/sdy", "/mnt/y", "xfs", &[])
                .unwrap();
            assert_eq!(
                fs_.runner().command_lines(),
                vec!["mkfs.xfs /dev/sdy -m crc=0"]
            );

            fs_.runner()
                .respond("mkfs.ext4", CommandOutput::failed(1, "in use"));
            assert!(
                fs_.format(&FormatContext::default(), "/dev/sdy", "/mnt/y", "ext4", &[])
                    .is_err()
            );
        }

        #[test]
        fn test_unmount_not_mounted() {
            let fs_ = scripted();
            let dir = tempfile::tempdir().unwrap();
            let err = fs_.unmount(&dir.path().display().to_string()).unwrap_err();
            assert!(matches!(err, FsError::Unmount { .. }));
            assert!(matches!(fs_.unmount("/"), Err(FsError::InvalidPath(_))));
        }
    }
}
