//! The POSIX-flavoured filesystem interface.
//!
//! [FilesystemRuntime] owns everything: the mount table (and through it each mounted device's
//! object graph), the open file handles, and the directory search contexts. Every entry point
//! takes the runtime's single lock for its whole duration, so operations are totally ordered and
//! never observe each other half-done.

mod file;
mod flags;
mod handle;
mod mount;
mod namespace;
mod resolve;
mod search;
mod stat;


pub use flags::{Access, AccessMode, OpenFlags};
pub use handle::{Fd, HANDLE_CAPACITY};
pub use mount::DeviceConfig;
pub use resolve::MAX_SYMLINK_DEPTH;
pub use search::{DirEntry, DirHandle};
pub use stat::{Stat, S_IFDIR, S_IFLNK, S_IFMT, S_IFREG};

use crate::chunk::ChunkDevice;
use crate::error::{FsError, Result};
use handle::HandleTable;
use mount::{MountTable, ObjRef};
use search::SearchContexts;

use std::io::SeekFrom;
use std::sync::{Mutex, PoisonError};

struct State {
    mounts: MountTable,
    handles: HandleTable,
    searches: SearchContexts,

    /// The failure of the most recent operation that failed, like `errno`
    last_error: Option<FsError>,
}

pub struct FilesystemRuntime {
    state: Mutex<State>,
}

impl FilesystemRuntime {
    /// Set up the runtime over a fixed list of devices, all initially unmounted
    pub fn new(configs: Vec<DeviceConfig>) -> Result<Self> {
        Ok(Self {
            state: Mutex::new(State {
                mounts: MountTable::new(configs)?,
                handles: HandleTable::new(HANDLE_CAPACITY),
                searches: SearchContexts::default(),
                last_error: None,
            }),
        })
    }

    /// Run one operation under the lock, remembering its failure if it fails
    fn run<T>(&self, op: impl FnOnce(&mut State) -> Result<T>) -> Result<T> {
        // Every operation leaves the state consistent before it can panic, so poisoning is
        // harmless here.
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let result = op(&mut state);
        if let Err(e) = &result {
            state.last_error = Some(*e);
        }
        result
    }

    /// The error from the most recent failed operation
    pub fn last_error(&self) -> Option<FsError> {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .last_error
    }

    /// Tear the runtime down, returning each device's mount point and storage. Mounted devices are
    /// not checkpointed; unmount them first.
    pub fn into_storage(self) -> Vec<(String, Box<dyn ChunkDevice + Send>)> {
        self.state
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner)
            .mounts
            .into_storage()
    }

    pub fn mount(&self, path: &str) -> Result<()> {
        self.run(|s| s.mount(path))
    }

    /// Checkpoint the device mounted at `path` and unmount it. Fails with [FsError::Busy] (after
    /// checkpointing) while any of its files are open.
    pub fn unmount(&self, path: &str) -> Result<()> {
        self.run(|s| s.unmount(path))
    }

    /// Write a checkpoint for the device owning `path`
    pub fn sync(&self, path: &str) -> Result<()> {
        self.run(|s| s.sync(path))
    }

    pub fn freespace(&self, path: &str) -> Result<u64> {
        self.run(|s| s.freespace(path))
    }

    pub fn totalspace(&self, path: &str) -> Result<u64> {
        self.run(|s| s.totalspace(path))
    }

    /// Open (and with [OpenFlags::O_CREAT], create) a file. `mode` supplies the permission bits
    /// of a newly created file.
    pub fn open(&self, path: &str, flags: OpenFlags, mode: u32) -> Result<Fd> {
        self.run(|s| s.open(path, flags, mode))
    }

    pub fn close(&self, fd: Fd) -> Result<()> {
        self.run(|s| s.close(fd))
    }

    /// Read at the handle's position; 0 at end of file
    pub fn read(&self, fd: Fd, buf: &mut [u8]) -> Result<usize> {
        self.run(|s| s.read(fd, buf))
    }

    pub fn write(&self, fd: Fd, buf: &[u8]) -> Result<usize> {
        self.run(|s| s.write(fd, buf))
    }

    pub fn lseek(&self, fd: Fd, pos: SeekFrom) -> Result<u64> {
        self.run(|s| s.lseek(fd, pos))
    }

    pub fn truncate(&self, fd: Fd, size: u64) -> Result<()> {
        self.run(|s| s.truncate(fd, size))
    }

    pub fn unlink(&self, path: &str) -> Result<()> {
        self.run(|s| s.unlink(path))
    }

    pub fn rmdir(&self, path: &str) -> Result<()> {
        self.run(|s| s.rmdir(path))
    }

    pub fn rename(&self, old_path: &str, new_path: &str) -> Result<()> {
        self.run(|s| s.rename(old_path, new_path))
    }

    pub fn mkdir(&self, path: &str, mode: u32) -> Result<()> {
        self.run(|s| s.mkdir(path, mode))
    }

    /// Create a symlink at `path` pointing to `target`
    pub fn symlink(&self, target: &str, path: &str) -> Result<()> {
        self.run(|s| s.symlink(target, path))
    }

    /// Create a hard link at `new_path` to the file at `existing`
    pub fn link(&self, existing: &str, new_path: &str) -> Result<()> {
        self.run(|s| s.link(existing, new_path))
    }

    pub fn readlink(&self, path: &str) -> Result<String> {
        self.run(|s| s.readlink(path))
    }

    pub fn stat(&self, path: &str) -> Result<Stat> {
        self.run(|s| s.stat(path))
    }

    pub fn lstat(&self, path: &str) -> Result<Stat> {
        self.run(|s| s.lstat(path))
    }

    pub fn fstat(&self, fd: Fd) -> Result<Stat> {
        self.run(|s| s.fstat(fd))
    }

    pub fn chmod(&self, path: &str, mode: u32) -> Result<()> {
        self.run(|s| s.chmod(path, mode))
    }

    pub fn fchmod(&self, fd: Fd, mode: u32) -> Result<()> {
        self.run(|s| s.fchmod(fd, mode))
    }

    pub fn access(&self, path: &str, amode: AccessMode) -> Result<()> {
        self.run(|s| s.access(path, amode))
    }

    pub fn opendir(&self, path: &str) -> Result<DirHandle> {
        self.run(|s| s.opendir(path))
    }

    /// The next entry of an open directory, or None at the end
    pub fn readdir(&self, dir: DirHandle) -> Result<Option<DirEntry>> {
        self.run(|s| s.readdir(dir))
    }

    pub fn rewinddir(&self, dir: DirHandle) -> Result<()> {
        self.run(|s| s.rewinddir(dir))
    }

    pub fn closedir(&self, dir: DirHandle) -> Result<()> {
        self.run(|s| s.closedir(dir))
    }

    /// How many file handles are open
    pub fn open_handles(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .handles
            .in_use()
    }
}

impl std::fmt::Debug for FilesystemRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("FilesystemRuntime")
            .field("open_handles", &state.handles.in_use())
            .field("search_contexts", &state.searches.live())
            .field("last_error", &state.last_error)
            .finish()
    }
}
