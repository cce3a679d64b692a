//! Backend selection.
//!
//! ```ignore
//! use fsutil::platform::{self, BackendKind};
//!
//! let fs = platform::select(BackendKind::Host, SysPaths::default());
//! let mounts = fs.get_mounts().await?;
//! ```

use tracing::info;

use crate::Fs;
use crate::backend::FsBackend;
use crate::config::SysPaths;
use crate::mock::MockFs;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackendKind {
    /// Real sysfs, procfs and host tools
    #[default]
    Host,
    /// In-memory state, nothing on the host is touched
    Mock,
}

/// Build the backend for `kind`. `paths` only applies to the host backend.
pub fn select(kind: BackendKind, paths: SysPaths) -> Box<dyn FsBackend> {
    info!(backend = ?kind, os = std::env::consts::OS, "Selecting filesystem backend");
    match kind {
        BackendKind::Host => Box::new(Fs::new(paths)),
        BackendKind::Mock => Box::new(MockFs::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_select_mock_is_isolated() {
        let backend = select(BackendKind::Mock, SysPaths::default());
        backend
            .mount("/dev/sdb", "/mnt/a", "ext4", &[])
            .await
            .unwrap();
        assert_eq!(backend.get_mounts().await.unwrap().len(), 1);

        let other = select(BackendKind::Mock, SysPaths::default());
        assert!(other.get_mounts().await.unwrap().is_empty());
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_select_host_uses_paths() {
        let dir = tempfile::tempdir().unwrap();
        let paths = SysPaths::rooted(dir.path());
        std::fs::create_dir_all(paths.proc_mountinfo.parent().unwrap()).unwrap();
        std::fs::write(
            &paths.proc_mountinfo,
            "28 1 8:1 / / rw,relatime shared:1 - ext4 /dev/sda1 rw\n",
        )
        .unwrap();

        let backend = select(BackendKind::Host, paths);
        let mounts = backend.get_mounts().await.unwrap();
        assert_eq!(mounts.len(), 1);
        assert_eq!(mounts[0].device, "/dev/sda1");
    }
}
