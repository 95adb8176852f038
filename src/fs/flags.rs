//! `open(2)`- and `access(2)`-style flag sets

use crate::error::{FsError, Result};

use bitflags::bitflags;

bitflags! {
    /// Flags accepted by [super::FilesystemRuntime::open], with the usual Linux values
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct OpenFlags: u32 {
        const O_WRONLY = 0o1;
        const O_RDWR   = 0o2;
        const O_CREAT  = 0o100;
        const O_EXCL   = 0o200;
        const O_TRUNC  = 0o1000;
        const O_APPEND = 0o2000;
    }
}

bitflags! {
    /// Permissions tested by [super::FilesystemRuntime::access]
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct AccessMode: u32 {
        const R_OK = 4;
        const W_OK = 2;
        const X_OK = 1;
    }
}

/// The access mode part of [OpenFlags]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    ReadOnly,
    WriteOnly,
    ReadWrite,
}

impl Access {
    pub fn readable(self) -> bool {
        self != Access::WriteOnly
    }

    pub fn writable(self) -> bool {
        self != Access::ReadOnly
    }
}

impl OpenFlags {
    /// Zero, as on Linux
    pub const O_RDONLY: Self = Self::empty();

    pub fn access(self) -> Result<Access> {
        match (
            self.contains(OpenFlags::O_WRONLY),
            self.contains(OpenFlags::O_RDWR),
        ) {
            (false, false) => Ok(Access::ReadOnly),
            (true, false) => Ok(Access::WriteOnly),
            (false, true) => Ok(Access::ReadWrite),
            (true, true) => Err(FsError::InvalidArgument),
        }
    }
}

#[test]
fn test_access_mode() {
    assert_eq!(OpenFlags::O_RDONLY.access(), Ok(Access::ReadOnly));
    assert_eq!(
        (OpenFlags::O_CREAT | OpenFlags::O_WRONLY).access(),
        Ok(Access::WriteOnly)
    );
    assert_eq!(
        (OpenFlags::O_RDWR | OpenFlags::O_TRUNC).access(),
        Ok(Access::ReadWrite)
    );
    assert_eq!(
        (OpenFlags::O_RDWR | OpenFlags::O_WRONLY).access(),
        Err(FsError::InvalidArgument)
    );
    assert!(Access::ReadWrite.readable() && Access::ReadWrite.writable());
    assert!(!Access::WriteOnly.readable());
}
