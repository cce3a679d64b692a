use nix::sys::statvfs::statvfs;
use serde::Serialize;

use crate::Fs;
use crate::error::{FsError, Result};
use crate::exec::CommandRunner;

/// Capacity and inode usage of a mounted filesystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct FsStats {
    /// Bytes available to unprivileged users
    pub available: u64,
    pub capacity: u64,
    pub used: u64,
    pub inodes: u64,
    pub inodes_free: u64,
    pub inodes_used: u64,
}

impl<R: CommandRunner> Fs<R> {
    /// Usage of the filesystem holding `path`.
    pub fn fs_info(&self, path: &str) -> Result<FsStats> {
        let st = statvfs(path).map_err(|e| FsError::Io(e.into()))?;
        let fragment = st.fragment_size() as u64;
        let blocks = st.blocks() as u64;
        let files = st.files() as u64;
        let files_free = st.files_free() as u64;

        Ok(FsStats {
            available: st.blocks_available() as u64 * fragment,
            capacity: blocks * fragment,
            used: blocks.saturating_sub(st.blocks_free() as u64) * fragment,
            inodes: files,
            inodes_free: files_free,
            inodes_used: files.saturating_sub(files_free),
        })
    }
}
