//! The error taxonomy surfaced by the filesystem layer.
//!
//! Each variant corresponds to one POSIX errno value, available through [FsError::errno], so that
//! a C-style shim can hand back `-1` and set `errno`.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, FsError>;

#[derive(Debug, Error, Copy, Clone, PartialEq, Eq, Hash)]
pub enum FsError {
    #[error("no such file or directory")]
    NotFound,

    #[error("not a directory")]
    NotADirectory,

    #[error("is a directory")]
    IsADirectory,

    #[error("directory not empty")]
    NotEmpty,

    #[error("file exists")]
    AlreadyExists,

    #[error("permission denied")]
    AccessDenied,

    #[error("bad file descriptor")]
    BadFd,

    #[error("cross-device link")]
    CrossDevice,

    #[error("out of memory")]
    OutOfMemory,

    /// Every slot of the handle table is in use
    #[error("too many open files")]
    OutOfHandles,

    #[error("device or resource busy")]
    Busy,

    #[error("device not mounted")]
    NotMounted,

    #[error("too many levels of symbolic links")]
    TooManySymlinks,

    #[error("invalid argument")]
    InvalidArgument,

    /// No mount point covers the path
    #[error("no such device")]
    NoSuchDevice,

    #[error("no space left on device")]
    NoSpace,

    #[error("file name too long")]
    NameTooLong,

    /// The flash underneath failed; details were logged when it happened
    #[error("input/output error")]
    Io,
}

impl FsError {
    /// The POSIX `errno` value for this error (positive, as stored in `errno`)
    pub fn errno(&self) -> i32 {
        match self {
            FsError::NotFound => 2,
            FsError::Io => 5,
            FsError::BadFd => 9,
            FsError::OutOfMemory => 12,
            FsError::AccessDenied => 13,
            FsError::Busy => 16,
            FsError::AlreadyExists => 17,
            FsError::CrossDevice => 18,
            FsError::NoSuchDevice => 19,
            FsError::NotADirectory => 20,
            FsError::IsADirectory => 21,
            FsError::InvalidArgument => 22,
            FsError::OutOfHandles => 24,
            FsError::NoSpace => 28,
            FsError::NameTooLong => 36,
            FsError::NotEmpty => 39,
            FsError::TooManySymlinks => 40,
            // Same as umount(2) on something that is not a mount point
            FsError::NotMounted => 22,
        }
    }
}

impl From<std::collections::TryReserveError> for FsError {
    fn from(_: std::collections::TryReserveError) -> Self {
        FsError::OutOfMemory
    }
}

#[test]
fn test_errno_values() {
    assert_eq!(FsError::NotFound.errno(), 2);
    assert_eq!(FsError::NotEmpty.errno(), 39);
    assert_eq!(FsError::TooManySymlinks.errno(), 40);
    assert_eq!(FsError::CrossDevice.to_string(), "cross-device link");
}
