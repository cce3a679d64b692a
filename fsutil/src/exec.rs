//! External command execution.
//!
//! All tools (`lsblk`, `mount`, `mkfs.*`, `resize2fs`, ...) are spawned
//! through a [`CommandRunner`] so that the orchestration logic can be driven
//! by canned output in tests. `multipath` is the exception: it needs a
//! cancellable deadline and is run directly on tokio (see
//! [`crate::multipath`]).

use std::borrow::Cow;
use std::collections::VecDeque;
use std::io;
use std::process::Command;
use std::sync::Mutex;

use tracing::{debug, error, info};

use crate::error::{FsError, Result};

/// Captured result of a finished external command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub success: bool,
    /// Exit code, `None` when the process was killed by a signal
    pub code: Option<i32>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl CommandOutput {
    pub fn ok(stdout: impl Into<Vec<u8>>) -> Self {
        Self {
            success: true,
            code: Some(0),
            stdout: stdout.into(),
            stderr: Vec::new(),
        }
    }

    pub fn failed(code: i32, stderr: impl Into<Vec<u8>>) -> Self {
        Self {
            success: false,
            code: Some(code),
            stdout: Vec::new(),
            stderr: stderr.into(),
        }
    }

    pub fn stdout_str(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.stdout)
    }

    /// stdout followed by stderr, the way a shell `2>&1` would show them.
    pub fn combined(&self) -> String {
        let mut out = String::from_utf8_lossy(&self.stdout).into_owned();
        out.push_str(&String::from_utf8_lossy(&self.stderr));
        out
    }

    pub fn reason(&self) -> String {
        match self.code {
            Some(code) => format!("exit status {}", code),
            None => "terminated by signal".to_string(),
        }
    }
}

/// Spawns external programs and waits for them to finish.
pub trait CommandRunner: Send + Sync {
    fn run(&self, program: &str, args: &[String]) -> io::Result<CommandOutput>;
}

/// Runs commands on the host with [`std::process::Command`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn run(&self, program: &str, args: &[String]) -> io::Result<CommandOutput> {
        let output = Command::new(program).args(args).output()?;
        Ok(CommandOutput {
            success: output.status.success(),
            code: output.status.code(),
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }
}

/// Run a command and turn a spawn failure or non-zero exit into
/// [`FsError::CommandFailed`] carrying the combined output.
pub(crate) fn run_checked<R: CommandRunner + ?Sized>(
    runner: &R,
    program: &str,
    args: &[String],
) -> Result<CommandOutput> {
    let joined = args.join(" ");
    info!(cmd = %program, args = %joined, "Running command");

    let output = runner.run(program, args).map_err(|e| {
        error!(cmd = %program, error = %e, "Failed to execute command");
        FsError::CommandFailed {
            command: program.to_string(),
            args: joined.clone(),
            reason: e.to_string(),
            output: String::new(),
        }
    })?;

    let combined = output.combined();
    debug!(cmd = %program, output = %combined, "Command output");

    if !output.success {
        error!(cmd = %program, args = %joined, output = %combined, "Command failed");
        return Err(FsError::CommandFailed {
            command: program.to_string(),
            args: joined,
            reason: output.reason(),
            output: combined,
        });
    }
    Ok(output)
}

/// One recorded call made through a [`ScriptedRunner`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
}

impl Invocation {
    pub fn command_line(&self) -> String {
        let mut line = self.program.clone();
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }
}

/// Test double that records every invocation and replays queued output.
///
/// Responses are queued per program name and consumed in order; a program
/// with nothing queued succeeds with empty output.
#[derive(Debug, Default)]
pub struct ScriptedRunner {
    responses: Mutex<VecDeque<(String, CommandOutput)>>,
    calls: Mutex<Vec<Invocation>>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue the output returned by the next call to `program`.
    pub fn respond(&self, program: &str, output: CommandOutput) -> &Self {
        if let Ok(mut queue) = self.responses.lock() {
            queue.push_back((program.to_string(), output));
        }
        self
    }

    pub fn calls(&self) -> Vec<Invocation> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn command_lines(&self) -> Vec<String> {
        self.calls().iter().map(Invocation::command_line).collect()
    }
}

impl CommandRunner for ScriptedRunner {
    fn run(&self, program: &str, args: &[String]) -> io::Result<CommandOutput> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(Invocation {
                program: program.to_string(),
                args: args.to_vec(),
            });
        }
        let mut queue = self
            .responses
            .lock()
            .map_err(|_| io::Error::other("scripted runner poisoned"))?;
        let position = queue.iter().position(|(p, _)| p == program);
        Ok(position
            .and_then(|i| queue.remove(i))
            .map(|(_, output)| output)
            .unwrap_or_else(|| CommandOutput::ok("")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_scripted_runner_replays_per_program() {
        let runner = ScriptedRunner::new();
        runner
            .respond("lsblk", CommandOutput::ok("ext4\n"))
            .respond("mount", CommandOutput::failed(32, "wrong fs type"));

        let mount = runner.run("mount", &args(&["/dev/sda", "/mnt"])).unwrap();
        assert!(!mount.success);
        let lsblk = runner.run("lsblk", &args(&["-n"])).unwrap();
        assert_eq!(lsblk.stdout_str(), "ext4\n");
        // Nothing queued: empty success
        let again = runner.run("mount", &args(&[])).unwrap();
        assert!(again.success);

        assert_eq!(
            runner.command_lines(),
            vec!["mount /dev/sda /mnt", "lsblk -n", "mount"]
        );
    }

    #[test]
    fn test_run_checked_embeds_output() {
        let runner = ScriptedRunner::new();
        runner.respond("mkfs.ext4", CommandOutput::failed(1, "device is busy"));
        let err = run_checked(&runner, "mkfs.ext4", &args(&["-F", "/dev/sdz"])).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("mkfs.ext4 failed"));
        assert!(msg.contains("-F /dev/sdz"));
        assert!(msg.contains("device is busy"));
    }

    #[test]
    fn test_system_runner_reports_missing_binary() {
        let err = SystemRunner
            .run("/nonexistent/fsutil-test-binary", &[])
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }
}
