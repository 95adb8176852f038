//! Operations on file handles: open, close, read, write, lseek, truncate

use super::flags::OpenFlags;
use super::handle::{Fd, Handle};
use super::mount::ObjRef;
use super::State;
use crate::error::{FsError, Result};
use crate::guts::{NewObject, Permissions};

use tracing::debug;

use std::io::SeekFrom;

impl State {
    pub(super) fn open(&mut self, path: &str, flags: OpenFlags, mode: u32) -> Result<Fd> {
        let access = flags.access()?;
        let creating = flags.contains(OpenFlags::O_CREAT);
        let exclusive = flags.contains(OpenFlags::O_EXCL);

        // Checked up front so that running out of handles never leaves a new file behind
        if self.handles.is_full() {
            return Err(FsError::OutOfHandles);
        }

        let (dir, name) = self.mounts.resolve_parent(None, path, 0)?;
        let (obj, created) = match self.mounts.lookup(dir, &name)? {
            Some(_) if creating && exclusive => return Err(FsError::AlreadyExists),
            Some(obj) => (self.mounts.follow_link(obj, 0)?, false),
            None if creating => {
                let graph = self.mounts.graph_mut(dir.dev)?;
                let perms = Permissions::from_mode(mode);
                let id = graph.mknod(dir.id, &name, perms, NewObject::File)?;
                (ObjRef { dev: dir.dev, id }, true)
            }
            None => return Err(FsError::NotFound),
        };

        // Handles always refer to the file itself, never to a hard link
        let graph = self.mounts.graph(obj.dev)?;
        let obj = ObjRef {
            dev: obj.dev,
            id: graph.equivalent(obj.id),
        };
        let target = graph.get(obj.id).ok_or(FsError::NotFound)?;

        if !created {
            if target.is_dir() && access.writable() {
                return Err(FsError::IsADirectory);
            }

            let mut open_handles = self.handles.open_on(obj).peekable();
            let already_open = open_handles.peek().is_some();
            if open_handles.any(|handle| handle.exclusive) || (exclusive && already_open) {
                return Err(FsError::AccessDenied);
            }

            let perms = target.perms();
            if (access.readable() && !perms.contains(Permissions::S_IREAD))
                || (access.writable() && !perms.contains(Permissions::S_IWRITE))
            {
                return Err(FsError::AccessDenied);
            }
        }

        let graph = self.mounts.graph_mut(obj.dev)?;
        if flags.contains(OpenFlags::O_TRUNC) && access.writable() {
            graph.resize(obj.id, 0)?;
        }
        graph.open_ref(obj.id)?;

        self.handles.acquire(Handle {
            obj,
            position: 0,
            read_only: !access.writable(),
            append: flags.contains(OpenFlags::O_APPEND),
            exclusive,
        })
    }

    pub(super) fn close(&mut self, fd: Fd) -> Result<()> {
        let handle = self.handles.release(fd)?;
        let graph = self.mounts.graph_mut(handle.obj.dev)?;
        if graph.close_ref(handle.obj.id)? {
            debug!("{fd} was the last reference to an unlinked object; freed it");
        }
        Ok(())
    }

    pub(super) fn read(&mut self, fd: Fd, buf: &mut [u8]) -> Result<usize> {
        let handle = self.handles.get_mut(fd)?;
        let graph = self.mounts.graph_mut(handle.obj.dev)?;

        let n = graph.read_data(handle.obj.id, handle.position, buf)?;
        handle.position += n as u64;
        Ok(n)
    }

    pub(super) fn write(&mut self, fd: Fd, buf: &[u8]) -> Result<usize> {
        let handle = self.handles.get_mut(fd)?;
        if handle.read_only {
            return Err(FsError::AccessDenied);
        }

        let graph = self.mounts.graph_mut(handle.obj.dev)?;
        if handle.append {
            handle.position = graph.file_length(handle.obj.id)?;
        }

        let n = graph.write_data(handle.obj.id, handle.position, buf)?;
        handle.position += n as u64;
        Ok(n)
    }

    pub(super) fn lseek(&mut self, fd: Fd, pos: SeekFrom) -> Result<u64> {
        let handle = self.handles.get_mut(fd)?;
        let new_position = match pos {
            SeekFrom::Start(offset) => Some(offset),
            SeekFrom::Current(delta) => handle.position.checked_add_signed(delta),
            SeekFrom::End(delta) => {
                let graph = self.mounts.graph(handle.obj.dev)?;
                graph.file_length(handle.obj.id)?.checked_add_signed(delta)
            }
        };

        // A position before the start of the file leaves the handle where it was
        handle.position = new_position.ok_or(FsError::InvalidArgument)?;
        Ok(handle.position)
    }

    pub(super) fn truncate(&mut self, fd: Fd, size: u64) -> Result<()> {
        let obj = self.handles.get(fd)?.obj;
        self.mounts.graph_mut(obj.dev)?.resize(obj.id, size)
    }
}
