//! stat/lstat/fstat, chmod/fchmod, and access

use super::flags::AccessMode;
use super::handle::Fd;
use super::mount::ObjRef;
use super::State;
use crate::error::{FsError, Result};
use crate::guts::{ObjectType, Permissions};

pub const S_IFMT: u32 = 0o170000;
pub const S_IFREG: u32 = 0o100000;
pub const S_IFDIR: u32 = 0o040000;
pub const S_IFLNK: u32 = 0o120000;

/// File status, shaped like `struct stat`. Ownership is not modeled; uid and gid are always 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stat {
    pub st_dev: u32,
    pub st_ino: u32,
    pub st_mode: u32,
    pub st_nlink: u32,
    pub st_uid: u32,
    pub st_gid: u32,
    pub st_size: u64,
    pub st_blksize: u32,
    pub st_blocks: u64,
    pub st_atime: u32,
    pub st_mtime: u32,
    pub st_ctime: u32,
}

impl Stat {
    pub fn is_dir(&self) -> bool {
        self.st_mode & S_IFMT == S_IFDIR
    }

    pub fn is_file(&self) -> bool {
        self.st_mode & S_IFMT == S_IFREG
    }

    pub fn is_symlink(&self) -> bool {
        self.st_mode & S_IFMT == S_IFLNK
    }

    pub fn perms(&self) -> Permissions {
        Permissions::from_mode(self.st_mode)
    }
}

impl State {
    fn stat_obj(&self, obj: ObjRef) -> Result<Stat> {
        let graph = self.mounts.graph(obj.dev)?;
        let id = graph.equivalent(obj.id);
        let target = graph.get(id).ok_or(FsError::NotFound)?;

        let type_bits = match target.object_type() {
            ObjectType::Directory => S_IFDIR,
            ObjectType::SymLink => S_IFLNK,
            ObjectType::File | ObjectType::HardLink => S_IFREG,
        };
        let size = graph.file_length(id)?;
        let blksize = self.mounts.geometry(obj.dev)?.data_bytes_per_chunk as u32;
        let times = target.times();

        Ok(Stat {
            st_dev: obj.dev as u32,
            st_ino: target.obj_id(),
            st_mode: type_bits | target.perms().bits(),
            st_nlink: graph.link_count(id),
            st_uid: 0,
            st_gid: 0,
            st_size: size,
            st_blksize: blksize,
            st_blocks: size.div_ceil(u64::from(blksize.max(1))),
            st_atime: times.atime,
            st_mtime: times.mtime,
            st_ctime: times.ctime,
        })
    }

    pub(super) fn stat(&self, path: &str) -> Result<Stat> {
        let obj = self.mounts.find_object(None, path, 0)?;
        self.stat_obj(self.mounts.follow_link(obj, 0)?)
    }

    pub(super) fn lstat(&self, path: &str) -> Result<Stat> {
        self.stat_obj(self.mounts.find_object(None, path, 0)?)
    }

    pub(super) fn fstat(&self, fd: Fd) -> Result<Stat> {
        self.stat_obj(self.handles.get(fd)?.obj)
    }

    fn chmod_obj(&mut self, obj: ObjRef, mode: u32) -> Result<()> {
        let graph = self.mounts.graph_mut(obj.dev)?;
        let id = graph.equivalent(obj.id);
        graph.chmod(id, Permissions::from_mode(mode))
    }

    pub(super) fn chmod(&mut self, path: &str, mode: u32) -> Result<()> {
        let obj = self.mounts.find_object(None, path, 0)?;
        let obj = self.mounts.follow_link(obj, 0)?;
        self.chmod_obj(obj, mode)
    }

    pub(super) fn fchmod(&mut self, fd: Fd, mode: u32) -> Result<()> {
        let obj = self.handles.get(fd)?.obj;
        self.chmod_obj(obj, mode)
    }

    pub(super) fn access(&self, path: &str, amode: AccessMode) -> Result<()> {
        let obj = self.mounts.find_object(None, path, 0)?;
        let obj = self.mounts.follow_link(obj, 0)?;
        let graph = self.mounts.graph(obj.dev)?;
        let perms = graph
            .get(graph.equivalent(obj.id))
            .ok_or(FsError::NotFound)?
            .perms();

        let denied = (amode.contains(AccessMode::R_OK) && !perms.contains(Permissions::S_IREAD))
            || (amode.contains(AccessMode::W_OK) && !perms.contains(Permissions::S_IWRITE))
            || (amode.contains(AccessMode::X_OK) && !perms.contains(Permissions::S_IEXEC));
        if denied {
            return Err(FsError::AccessDenied);
        }
        Ok(())
    }
}

#[test]
fn test_stat_type_bits() {
    let mut stat = Stat {
        st_dev: 0,
        st_ino: 1,
        st_mode: S_IFDIR | 0o755,
        st_nlink: 1,
        st_uid: 0,
        st_gid: 0,
        st_size: 0,
        st_blksize: 512,
        st_blocks: 0,
        st_atime: 0,
        st_mtime: 0,
        st_ctime: 0,
    };
    assert!(stat.is_dir() && !stat.is_file() && !stat.is_symlink());
    assert_eq!(stat.perms().bits(), 0o755);

    stat.st_mode = S_IFLNK | 0o777;
    assert!(stat.is_symlink() && !stat.is_dir());
}
