//! The fixed-capacity table of open file handles

use super::ObjRef;
use crate::error::{FsError, Result};

/// How many files may be open at once, across all devices
pub const HANDLE_CAPACITY: usize = 200;

/// A file descriptor: an index into the handle table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fd(pub usize);

impl std::fmt::Display for Fd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "fd {}", self.0)
    }
}

/// The state behind one open file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handle {
    pub obj: ObjRef,
    pub position: u64,
    pub read_only: bool,
    pub append: bool,

    /// Opened with `O_EXCL`; no other handle may open the object meanwhile
    pub exclusive: bool,
}

#[derive(Debug)]
pub struct HandleTable {
    slots: Box<[Option<Handle>]>,
}

impl HandleTable {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: vec![None; capacity].into_boxed_slice(),
        }
    }

    pub fn is_full(&self) -> bool {
        self.slots.iter().all(Option::is_some)
    }

    /// Store `handle` in the lowest free slot
    pub fn acquire(&mut self, handle: Handle) -> Result<Fd> {
        let index = self
            .slots
            .iter()
            .position(Option::is_none)
            .ok_or(FsError::OutOfHandles)?;
        self.slots[index] = Some(handle);
        Ok(Fd(index))
    }

    /// Free a slot, handing back what it held. Closing the object is up to the caller.
    pub fn release(&mut self, fd: Fd) -> Result<Handle> {
        self.slots
            .get_mut(fd.0)
            .and_then(Option::take)
            .ok_or(FsError::BadFd)
    }

    pub fn get(&self, fd: Fd) -> Result<&Handle> {
        self.slots
            .get(fd.0)
            .and_then(Option::as_ref)
            .ok_or(FsError::BadFd)
    }

    pub fn get_mut(&mut self, fd: Fd) -> Result<&mut Handle> {
        self.slots
            .get_mut(fd.0)
            .and_then(Option::as_mut)
            .ok_or(FsError::BadFd)
    }

    /// Every handle in use
    pub fn iter(&self) -> impl Iterator<Item = &Handle> {
        self.slots.iter().flatten()
    }

    /// The open handles on `obj`
    pub fn open_on(&self, obj: ObjRef) -> impl Iterator<Item = &Handle> {
        self.iter().filter(move |handle| handle.obj == obj)
    }

    pub fn in_use(&self) -> usize {
        self.iter().count()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::guts::ObjectGraph;

    fn handle() -> Handle {
        Handle {
            obj: ObjRef {
                dev: 0,
                id: ObjectGraph::new(0).root(),
            },
            position: 0,
            read_only: false,
            append: false,
            exclusive: false,
        }
    }

    #[test]
    fn test_acquire_lowest_free() -> Result<()> {
        let mut table = HandleTable::new(3);
        assert_eq!(table.acquire(handle())?, Fd(0));
        assert_eq!(table.acquire(handle())?, Fd(1));
        assert_eq!(table.acquire(handle())?, Fd(2));
        assert!(table.is_full());
        assert_eq!(table.acquire(handle()), Err(FsError::OutOfHandles));

        table.release(Fd(1))?;
        assert_eq!(table.in_use(), 2);
        assert_eq!(table.acquire(handle())?, Fd(1));
        Ok(())
    }

    #[test]
    fn test_bad_fd() {
        let mut table = HandleTable::new(2);
        assert_eq!(table.get(Fd(0)).err(), Some(FsError::BadFd));
        assert_eq!(table.get(Fd(7)).err(), Some(FsError::BadFd));
        assert_eq!(table.release(Fd(1)).err(), Some(FsError::BadFd));
        assert!(table.get_mut(Fd(5)).is_err());
    }
}
