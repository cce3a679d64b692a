use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum FsError {
    #[error("Path: {0} is invalid")]
    InvalidPath(String),

    #[error("FsType: {0} is invalid")]
    InvalidFsType(String),

    #[error("Mount option: {0} is invalid")]
    InvalidMountOption(String),

    #[error("Multipath option: {0} is invalid")]
    InvalidMultipathOption(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("Device not found")]
    DeviceNotFound,

    #[error("device {0} does not exist")]
    DeviceDoesNotExist(String),

    #[error("controller not found for device {0}")]
    ControllerNotFound(String),

    #[error("device {0} is in blocked state, refusing to delete it")]
    DeviceBlocked(String),

    #[error("invalid device: {0}")]
    InvalidDevice(String),

    #[error("Cannot read {path}: {source}")]
    SysfsRead {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Cannot write {path}: {source}")]
    SysfsWrite {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("could not get consistent content of {path} after {attempts} attempts")]
    InconsistentRead { path: String, attempts: usize },

    #[error("{command} failed: {reason}\narguments: {args}\noutput: {output}")]
    CommandFailed {
        command: String,
        args: String,
        reason: String,
        output: String,
    },

    #[error("{command} failed: {reason}\narguments: {args}\noutput: {}", String::from_utf8_lossy(.output))]
    MultipathFailed {
        command: String,
        args: String,
        reason: String,
        /// Combined stdout and stderr, unmodified
        output: Vec<u8>,
    },

    #[error("{command} timed out after {timeout:?}")]
    Timeout { command: String, timeout: Duration },

    #[error("unmount failed: {reason}\nunmounting arguments: {target}")]
    Unmount { target: String, reason: String },

    #[error("failed to mount volume as {requested:?}; already contains {existing}: error: {source}")]
    FormatMismatch {
        requested: String,
        existing: String,
        #[source]
        source: Box<FsError>,
    },

    #[error("filesystem {0:?} not supported to resize")]
    UnsupportedResize(String),

    #[error("failed to parse {0}")]
    Parse(String),

    #[error("not implemented")]
    NotImplemented,

    #[error("{0} induced error")]
    Induced(&'static str),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl FsError {
    /// True when a lookup exhausted every candidate without hitting an I/O
    /// failure, i.e. the mapping simply does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            FsError::NotFound(_)
                | FsError::DeviceNotFound
                | FsError::DeviceDoesNotExist(_)
                | FsError::ControllerNotFound(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, FsError>;
