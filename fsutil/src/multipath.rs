use std::time::Duration;

use tokio::process::Command;
use tracing::{debug, error, info};

use crate::Fs;
use crate::error::{FsError, Result};
use crate::exec::CommandRunner;
use crate::validate::validate_multipath_args;

impl<R: CommandRunner> Fs<R> {
    /// Run `multipath <args>` with a hard deadline, optionally inside
    /// `chroot` (for callers running in a container with the host root
    /// mounted elsewhere).
    ///
    /// Returns the combined stdout and stderr. A non-zero exit yields
    /// [`FsError::MultipathFailed`] carrying the same raw bytes. The child is
    /// killed when the deadline passes.
    pub async fn multipath_command(
        &self,
        timeout: Duration,
        chroot: Option<&str>,
        args: &[String],
    ) -> Result<Vec<u8>> {
        validate_multipath_args(args)?;

        let multipath = self.paths.multipath_bin.display().to_string();
        let (program, full_args) = match chroot.filter(|dir| !dir.is_empty()) {
            Some(dir) => {
                let mut full = vec![dir.to_string(), multipath];
                full.extend(args.iter().cloned());
                (self.paths.chroot_bin.display().to_string(), full)
            }
            None => (multipath, args.to_vec()),
        };
        let joined = full_args.join(" ");
        info!(cmd = %program, args = %joined, timeout = ?timeout, "Running multipath");

        let mut command = Command::new(&program);
        command.args(&full_args).kill_on_drop(true);

        let output = match tokio::time::timeout(timeout, command.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                error!(cmd = %program, error = %e, "Failed to execute multipath");
                return Err(FsError::CommandFailed {
                    command: program,
                    args: joined,
                    reason: e.to_string(),
                    output: String::new(),
                });
            }
            Err(_) => {
                error!(cmd = %program, args = %joined, timeout = ?timeout, "multipath timed out");
                return Err(FsError::Timeout {
                    command: program,
                    timeout,
                });
            }
        };

        let mut combined = output.stdout;
        combined.extend_from_slice(&output.stderr);
        let text = String::from_utf8_lossy(&combined);
        debug!(cmd = %program, output = %text, "multipath output");

        if !output.status.success() {
            error!(cmd = %program, args = %joined, output = %text, "multipath failed");
            return Err(FsError::MultipathFailed {
                command: program,
                args: joined,
                reason: output.status.to_string(),
                output: combined,
            });
        }
        Ok(combined)
    }
}
