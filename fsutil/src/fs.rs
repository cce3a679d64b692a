use crate::config::SysPaths;
use crate::exec::{CommandRunner, SystemRunner};
use crate::mount::{EntryScanFn, default_entry_scan};

/// Handle to the host's block device, mount and SCSI facilities.
///
/// `Fs` holds no mutable state: every call reads sysfs or the mount table
/// afresh, so a single instance can be shared across threads.
pub struct Fs<R: CommandRunner = SystemRunner> {
    pub(crate) paths: SysPaths,
    pub(crate) scan_entry: EntryScanFn,
    pub(crate) runner: R,
}

impl Fs<SystemRunner> {
    pub fn new(paths: SysPaths) -> Self {
        Self::with_runner(paths, SystemRunner)
    }
}

impl Default for Fs<SystemRunner> {
    fn default() -> Self {
        Self::new(SysPaths::default())
    }
}

impl<R: CommandRunner> Fs<R> {
    /// Build a handle that spawns tools through `runner`.
    pub fn with_runner(paths: SysPaths, runner: R) -> Self {
        Self {
            paths,
            scan_entry: default_entry_scan,
            runner,
        }
    }

    /// Replace the mount table entry filter.
    pub fn with_scan_entry(mut self, scan: EntryScanFn) -> Self {
        self.scan_entry = scan;
        self
    }

    pub fn paths(&self) -> &SysPaths {
        &self.paths
    }

    pub fn runner(&self) -> &R {
        &self.runner
    }
}

impl<R: CommandRunner + std::fmt::Debug> std::fmt::Debug for Fs<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fs")
            .field("paths", &self.paths)
            .field("runner", &self.runner)
            .finish_non_exhaustive()
    }
}
