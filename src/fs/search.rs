//! Directory search contexts: the cursors behind opendir/readdir.
//!
//! A cursor names the next entry to return. Anything that takes an entry out of a directory
//! listing must call [SearchContexts::notify_removal] first, so that cursors parked on that
//! entry move on to its successor instead of pointing at an object that no longer exists.

use super::mount::ObjRef;
use super::State;
use crate::error::{FsError, Result};
use crate::guts::{ObjectId, ObjectType};

use tracing::warn;

/// Stands in for a stored name that is empty, which should never happen
const PLACEHOLDER_NAME: &str = "zz";

/// An open directory stream, as returned by `opendir`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DirHandle {
    index: usize,
    generation: u32,
}

/// One entry returned by `readdir`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    /// Inode number
    pub ino: u32,
    pub name: String,

    /// Position of this entry in the stream (`d_off`)
    pub offset: u64,
    pub kind: ObjectType,
}

#[derive(Debug)]
struct SearchContext {
    dir: ObjRef,

    /// The next entry to return; None once the listing is exhausted
    cursor: Option<ObjectId>,
    offset: u64,
}

#[derive(Debug, Default)]
struct Slot {
    generation: u32,
    context: Option<SearchContext>,
}

/// Every live search context, across all devices
#[derive(Debug, Default)]
pub struct SearchContexts {
    slots: Vec<Slot>,
}

impl SearchContexts {
    fn open(&mut self, dir: ObjRef, first: Option<ObjectId>) -> DirHandle {
        let context = SearchContext {
            dir,
            cursor: first,
            offset: 0,
        };

        let index = match self.slots.iter().position(|slot| slot.context.is_none()) {
            Some(index) => index,
            None => {
                self.slots.push(Slot::default());
                self.slots.len() - 1
            }
        };
        let slot = &mut self.slots[index];
        slot.context = Some(context);
        DirHandle {
            index,
            generation: slot.generation,
        }
    }

    fn get_mut(&mut self, handle: DirHandle) -> Result<&mut SearchContext> {
        self.slots
            .get_mut(handle.index)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.context.as_mut())
            .ok_or(FsError::BadFd)
    }

    fn close(&mut self, handle: DirHandle) -> Result<()> {
        let slot = self
            .slots
            .get_mut(handle.index)
            .filter(|slot| slot.generation == handle.generation && slot.context.is_some())
            .ok_or(FsError::BadFd)?;
        slot.context = None;
        slot.generation = slot.generation.wrapping_add(1);
        Ok(())
    }

    /// `id` is about to leave its directory listing: move every cursor parked on it to `next`
    pub fn notify_removal(&mut self, dev: usize, id: ObjectId, next: Option<ObjectId>) {
        for context in self.slots.iter_mut().filter_map(|slot| slot.context.as_mut()) {
            if context.dir.dev == dev && context.cursor == Some(id) {
                context.cursor = next;
            }
        }
    }

    /// Close every context on a device that is going away
    pub fn invalidate_device(&mut self, dev: usize) {
        for slot in &mut self.slots {
            if slot.context.as_ref().is_some_and(|c| c.dir.dev == dev) {
                slot.context = None;
                slot.generation = slot.generation.wrapping_add(1);
            }
        }
    }

    pub fn live(&self) -> usize {
        self.slots.iter().filter(|slot| slot.context.is_some()).count()
    }
}

impl State {
    pub(super) fn opendir(&mut self, path: &str) -> Result<DirHandle> {
        let obj = self.mounts.find_object(None, path, 0)?;
        let obj = self.mounts.follow_link(obj, 0)?;
        let graph = self.mounts.graph(obj.dev)?;
        if !graph.get(obj.id).is_some_and(|o| o.is_dir()) {
            return Err(FsError::NotADirectory);
        }

        let first = graph.first_child(obj.id);
        Ok(self.searches.open(obj, first))
    }

    pub(super) fn readdir(&mut self, handle: DirHandle) -> Result<Option<DirEntry>> {
        let context = self.searches.get_mut(handle)?;
        let Some(cursor) = context.cursor else {
            return Ok(None);
        };

        let graph = self.mounts.graph(context.dir.dev)?;
        let Some(obj) = graph.get(cursor) else {
            // Only reachable if a removal skipped notification; end the listing
            warn!("directory cursor points at a deleted object");
            context.cursor = None;
            return Ok(None);
        };
        let target = graph.get(graph.equivalent(cursor)).unwrap_or(obj);

        let name = if obj.name().is_empty() {
            warn!("object {} has an empty name", obj.obj_id());
            PLACEHOLDER_NAME.to_owned()
        } else {
            obj.name().to_owned()
        };

        let entry = DirEntry {
            ino: target.obj_id(),
            name,
            offset: context.offset,
            kind: target.object_type(),
        };
        context.offset += 1;
        context.cursor = graph.next_sibling(cursor);

        Ok(Some(entry))
    }

    pub(super) fn rewinddir(&mut self, handle: DirHandle) -> Result<()> {
        let context = self.searches.get_mut(handle)?;
        context.cursor = self.mounts.graph(context.dir.dev)?.first_child(context.dir.id);
        context.offset = 0;
        Ok(())
    }

    pub(super) fn closedir(&mut self, handle: DirHandle) -> Result<()> {
        self.searches.close(handle)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::guts::{NewObject, ObjectGraph, Permissions};

    #[test]
    fn test_notify_removal() -> Result<()> {
        let mut graph = ObjectGraph::new(1 << 20);
        let root = graph.root();
        let perms = Permissions::S_IREAD;
        let a = graph.mknod(root, "a", perms, NewObject::File)?;
        let b = graph.mknod(root, "b", perms, NewObject::File)?;

        let mut searches = SearchContexts::default();
        let dir = ObjRef { dev: 0, id: root };
        let on_a = searches.open(dir, Some(a));
        let other_dev = searches.open(ObjRef { dev: 1, id: root }, Some(a));

        searches.notify_removal(0, a, graph.next_sibling(a));
        assert_eq!(searches.get_mut(on_a)?.cursor, Some(b));
        assert_eq!(searches.get_mut(other_dev)?.cursor, Some(a));

        searches.notify_removal(0, b, None);
        assert_eq!(searches.get_mut(on_a)?.cursor, None);
        Ok(())
    }

    #[test]
    fn test_stale_handles() -> Result<()> {
        let graph = ObjectGraph::new(1 << 20);
        let dir = ObjRef {
            dev: 3,
            id: graph.root(),
        };

        let mut searches = SearchContexts::default();
        let first = searches.open(dir, None);
        searches.close(first)?;
        assert_eq!(searches.close(first), Err(FsError::BadFd));

        // The slot is reused, but the old handle stays dead
        let second = searches.open(dir, None);
        assert!(searches.get_mut(first).is_err());
        assert!(searches.get_mut(second).is_ok());

        searches.invalidate_device(3);
        assert!(searches.get_mut(second).is_err());
        assert_eq!(searches.live(), 0);
        Ok(())
    }
}
