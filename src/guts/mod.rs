//! The object graph that the filesystem layer drives.
//!
//! Objects live in an arena addressed by generation-checked [ObjectId]s, so a stale reference
//! (to an object that has since been deleted) simply stops resolving instead of aliasing whatever
//! reuses the slot. Parent links and search-context cursors are such references; they never own
//! anything.
//!
//! The graph is held in RAM while a device is mounted and persisted as a checkpoint (see
//! [checkpoint]) when the device is synced or unmounted.

pub mod checkpoint;
mod object;

pub use object::{Object, ObjectId, ObjectType, Permissions, Times, Variant};

use crate::error::{FsError, Result};

/// Longest permitted object name, in bytes
pub const MAX_NAME_LENGTH: usize = 255;

/// Inode number of the root directory
pub const ROOT_OBJ_ID: u32 = 1;

#[derive(Debug, Clone)]
struct Slot {
    generation: u32,
    object: Option<Object>,
}

/// What kind of object [ObjectGraph::mknod] should create
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NewObject {
    File,
    Directory,
    SymLink(String),

    /// A hard link to the given file
    HardLink(ObjectId),
}

/// What [ObjectGraph::unlink] ended up doing
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum UnlinkOutcome {
    /// The object is gone
    Deleted,

    /// The object is detached but still open; it is freed by the last [ObjectGraph::close_ref]
    Deferred,

    /// The file had hard links; it took over one of them, which was deleted instead
    Relinked,
}

#[derive(Debug, Clone)]
pub struct ObjectGraph {
    slots: Vec<Slot>,
    free: Vec<u32>,
    root: ObjectId,
    next_obj_id: u32,

    /// Maximum stored size, in bytes, as determined by the flash behind this graph
    capacity: u64,

    /// Changed since the last checkpoint
    dirty: bool,
}

/// Reject names that cannot be stored in a directory
fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name == "." || name == ".." || name.contains('/') {
        return Err(FsError::InvalidArgument);
    }
    if name.len() > MAX_NAME_LENGTH {
        return Err(FsError::NameTooLong);
    }
    Ok(())
}

impl ObjectGraph {
    /// A freshly formatted graph: an empty root directory
    pub fn new(capacity: u64) -> Self {
        let root = Object {
            obj_id: ROOT_OBJ_ID,
            name: String::new(),
            parent: None,
            perms: Permissions::from_mode(0o755),
            times: Times::now(),
            variant: Variant::Directory {
                children: Vec::new(),
            },
            open_count: 0,
            unlinked: false,
        };
        let mut graph = Self::from_root(root, capacity, ROOT_OBJ_ID + 1);
        graph.dirty = true;
        graph
    }

    fn from_root(root: Object, capacity: u64, next_obj_id: u32) -> Self {
        let mut graph = Self {
            slots: Vec::new(),
            free: Vec::new(),
            root: ObjectId {
                index: 0,
                generation: 0,
            },
            next_obj_id,
            capacity,
            dirty: false,
        };
        graph.root = graph.alloc(root);
        graph
    }

    pub fn root(&self) -> ObjectId {
        self.root
    }

    pub fn get(&self, id: ObjectId) -> Option<&Object> {
        self.slots
            .get(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.object.as_ref())
    }

    fn get_mut(&mut self, id: ObjectId) -> Option<&mut Object> {
        self.slots
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.object.as_mut())
    }

    fn obj(&self, id: ObjectId) -> Result<&Object> {
        self.get(id).ok_or(FsError::NotFound)
    }

    fn obj_mut(&mut self, id: ObjectId) -> Result<&mut Object> {
        self.get_mut(id).ok_or(FsError::NotFound)
    }

    fn alloc(&mut self, object: Object) -> ObjectId {
        match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                slot.object = Some(object);
                ObjectId {
                    index,
                    generation: slot.generation,
                }
            }
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    object: Some(object),
                });
                ObjectId {
                    index: (self.slots.len() - 1) as u32,
                    generation: 0,
                }
            }
        }
    }

    fn release(&mut self, id: ObjectId) {
        if let Some(slot) = self
            .slots
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
        {
            slot.object = None;
            slot.generation = slot.generation.wrapping_add(1);
            self.free.push(id.index);
        }
    }

    /// Every live, linked object, parents before their children
    pub fn walk(&self) -> Vec<ObjectId> {
        let mut order = Vec::new();
        let mut stack = vec![self.root];
        while let Some(id) = stack.pop() {
            let Some(obj) = self.get(id) else {
                continue;
            };
            order.push(id);
            if let Some(children) = obj.children() {
                stack.extend(children.iter().rev());
            }
        }
        order
    }

    pub fn next_obj_id(&self) -> u32 {
        self.next_obj_id
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn mark_clean(&mut self) {
        self.dirty = false;
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Bytes the graph would occupy as a checkpoint
    pub fn stored_size(&self) -> u64 {
        checkpoint::encoded_len(self)
    }

    pub fn free_space(&self) -> u64 {
        self.capacity.saturating_sub(self.stored_size())
    }

    /// Fail with [FsError::NoSpace] unless `extra` more bytes can be stored
    fn reserve_space(&self, extra: u64) -> Result<()> {
        if extra > 0 && self.stored_size() + extra > self.capacity {
            return Err(FsError::NoSpace);
        }
        Ok(())
    }

    /// Look up a child of `dir` by its exact name
    pub fn find_by_name(&self, dir: ObjectId, name: &str) -> Option<ObjectId> {
        self.get(dir)?
            .children()?
            .iter()
            .copied()
            .find(|&child| self.get(child).is_some_and(|obj| obj.name == name))
    }

    /// The object that `id` stands for: a hard link's file, otherwise `id` itself
    pub fn equivalent(&self, id: ObjectId) -> ObjectId {
        match self.get(id).map(|obj| &obj.variant) {
            Some(Variant::HardLink { equivalent }) => *equivalent,
            _ => id,
        }
    }

    pub fn first_child(&self, dir: ObjectId) -> Option<ObjectId> {
        self.get(dir)?.children()?.first().copied()
    }

    /// The entry after `id` in its parent's listing
    pub fn next_sibling(&self, id: ObjectId) -> Option<ObjectId> {
        let siblings = self.get(self.get(id)?.parent?)?.children()?;
        let position = siblings.iter().position(|&x| x == id)?;
        siblings.get(position + 1).copied()
    }

    /// Is `candidate` equal to `id`, or one of its ancestors?
    pub fn is_ancestor(&self, candidate: ObjectId, id: ObjectId) -> bool {
        let mut cursor = Some(id);
        while let Some(current) = cursor {
            if current == candidate {
                return true;
            }
            cursor = self.get(current).and_then(|obj| obj.parent);
        }
        false
    }

    /// Create an object named `name` inside the directory `parent`
    pub fn mknod(
        &mut self,
        parent: ObjectId,
        name: &str,
        perms: Permissions,
        kind: NewObject,
    ) -> Result<ObjectId> {
        validate_name(name)?;
        if !self.obj(parent)?.is_dir() {
            return Err(FsError::NotADirectory);
        }
        if self.find_by_name(parent, name).is_some() {
            return Err(FsError::AlreadyExists);
        }

        let variant = match kind {
            NewObject::File => Variant::File {
                data: Vec::new(),
                hard_links: Vec::new(),
            },
            NewObject::Directory => Variant::Directory {
                children: Vec::new(),
            },
            NewObject::SymLink(alias) => {
                if alias.is_empty() {
                    return Err(FsError::InvalidArgument);
                }
                Variant::SymLink { alias }
            }
            NewObject::HardLink(equivalent) => {
                if !matches!(self.obj(equivalent)?.variant, Variant::File { .. }) {
                    return Err(FsError::InvalidArgument);
                }
                Variant::HardLink { equivalent }
            }
        };

        let object = Object {
            obj_id: self.next_obj_id,
            name: name.to_owned(),
            parent: Some(parent),
            perms,
            times: Times::now(),
            variant,
            open_count: 0,
            unlinked: false,
        };
        self.reserve_space(checkpoint::record_len(&object))?;

        self.next_obj_id += 1;
        let id = self.alloc(object);

        if let Some(Variant::HardLink { equivalent }) = self.get(id).map(|obj| obj.variant.clone())
        {
            if let Ok(Variant::File { hard_links, .. }) =
                self.obj_mut(equivalent).map(|obj| &mut obj.variant)
            {
                hard_links.push(id);
            }
            if let Ok(file) = self.obj_mut(equivalent) {
                file.times.touch_changed();
            }
        }

        let dir = self.obj_mut(parent)?;
        if let Variant::Directory { children } = &mut dir.variant {
            children.push(id);
        }
        dir.times.touch_modified();
        self.dirty = true;

        Ok(id)
    }

    /// The size reported for an object: data length for files, alias length for symlinks
    pub fn file_length(&self, id: ObjectId) -> Result<u64> {
        let id = self.equivalent(id);
        Ok(match &self.obj(id)?.variant {
            Variant::File { data, .. } => data.len() as u64,
            Variant::SymLink { alias } => alias.len() as u64,
            Variant::Directory { .. } | Variant::HardLink { .. } => 0,
        })
    }

    pub fn link_count(&self, id: ObjectId) -> u32 {
        let id = self.equivalent(id);
        match self.get(id) {
            None => 0,
            Some(obj) if obj.unlinked => 0,
            Some(Object {
                variant: Variant::File { hard_links, .. },
                ..
            }) => 1 + hard_links.len() as u32,
            Some(_) => 1,
        }
    }

    fn file_data(&self, id: ObjectId) -> Result<&Vec<u8>> {
        match &self.obj(id)?.variant {
            Variant::File { data, .. } => Ok(data),
            Variant::Directory { .. } => Err(FsError::IsADirectory),
            _ => Err(FsError::InvalidArgument),
        }
    }

    fn file_data_mut(&mut self, id: ObjectId) -> Result<&mut Vec<u8>> {
        match &mut self.obj_mut(id)?.variant {
            Variant::File { data, .. } => Ok(data),
            Variant::Directory { .. } => Err(FsError::IsADirectory),
            _ => Err(FsError::InvalidArgument),
        }
    }

    /// Read from a file at `offset`; reading at or past the end yields 0 bytes
    pub fn read_data(&mut self, id: ObjectId, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let data = self.file_data(id)?;
        let available = usize::try_from(offset)
            .ok()
            .and_then(|offset| data.get(offset..))
            .unwrap_or_default();

        let n = std::cmp::min(buf.len(), available.len());
        buf[..n].copy_from_slice(&available[..n]);

        self.obj_mut(id)?.times.touch_accessed();
        Ok(n)
    }

    /// Write into a file at `offset`, zero-filling any gap past the current end
    pub fn write_data(&mut self, id: ObjectId, offset: u64, buf: &[u8]) -> Result<usize> {
        let offset = usize::try_from(offset).map_err(|_| FsError::NoSpace)?;
        let end = offset.checked_add(buf.len()).ok_or(FsError::NoSpace)?;

        let length = self.file_data(id)?.len();
        if end > length {
            self.reserve_space((end - length) as u64)?;
        }

        let data = self.file_data_mut(id)?;
        if end > data.len() {
            data.try_reserve_exact(end - data.len())?;
            data.resize(end, 0);
        }
        data[offset..end].copy_from_slice(buf);

        self.obj_mut(id)?.times.touch_modified();
        self.dirty = true;
        Ok(buf.len())
    }

    /// Grow (zero-filled) or shrink a file
    pub fn resize(&mut self, id: ObjectId, size: u64) -> Result<()> {
        let size = usize::try_from(size).map_err(|_| FsError::NoSpace)?;
        let length = self.file_data(id)?.len();
        if size > length {
            self.reserve_space((size - length) as u64)?;
        }

        let data = self.file_data_mut(id)?;
        if size > data.len() {
            data.try_reserve_exact(size - data.len())?;
        }
        data.resize(size, 0);

        self.obj_mut(id)?.times.touch_modified();
        self.dirty = true;
        Ok(())
    }

    /// Replace an object's permission bits wholesale
    pub fn chmod(&mut self, id: ObjectId, perms: Permissions) -> Result<()> {
        let obj = self.obj_mut(id)?;
        obj.perms = perms;
        obj.times.touch_changed();
        self.dirty = true;
        Ok(())
    }

    /// The listing entries that go away if `id` is unlinked, each with the entry that takes over
    /// its position in the listing.
    ///
    /// Usually that is just `id` and its next sibling. A file with hard links also takes the place
    /// of its first link.
    pub fn departing(&self, id: ObjectId) -> Vec<(ObjectId, Option<ObjectId>)> {
        match self.get(id).map(|obj| &obj.variant) {
            Some(Variant::File { hard_links, .. }) if !hard_links.is_empty() => {
                vec![(id, self.next_sibling(id)), (hard_links[0], Some(id))]
            }
            Some(_) => vec![(id, self.next_sibling(id))],
            None => Vec::new(),
        }
    }

    /// Remove `id` from its parent's listing
    fn detach(&mut self, id: ObjectId) -> Result<()> {
        let Some(parent) = self.obj(id)?.parent else {
            return Ok(());
        };
        let dir = self.obj_mut(parent)?;
        if let Variant::Directory { children } = &mut dir.variant {
            children.retain(|&child| child != id);
        }
        dir.times.touch_modified();
        Ok(())
    }

    /// Remove an object from the namespace.
    ///
    /// Directories must be empty. A file with hard links survives under one of the links' names.
    pub fn unlink(&mut self, id: ObjectId) -> Result<UnlinkOutcome> {
        if id == self.root {
            return Err(FsError::Busy);
        }

        let obj = self.obj(id)?;
        if obj.unlinked {
            return Err(FsError::NotFound);
        }

        let outcome = match &obj.variant {
            Variant::Directory { children } if !children.is_empty() => {
                return Err(FsError::NotEmpty);
            }
            Variant::HardLink { equivalent } => {
                let equivalent = *equivalent;
                self.detach(id)?;
                if let Ok(file) = self.obj_mut(equivalent) {
                    if let Variant::File { hard_links, .. } = &mut file.variant {
                        hard_links.retain(|&link| link != id);
                    }
                    file.times.touch_changed();
                }
                self.release(id);
                UnlinkOutcome::Deleted
            }
            Variant::File { hard_links, .. } if !hard_links.is_empty() => {
                let link = hard_links[0];
                let link_obj = self.obj(link)?;
                let (link_parent, link_name) = (link_obj.parent, link_obj.name.clone());

                self.detach(id)?;
                if let Some(Variant::Directory { children }) = link_parent
                    .and_then(|parent| self.get_mut(parent))
                    .map(|dir| &mut dir.variant)
                {
                    for child in children.iter_mut().filter(|child| **child == link) {
                        *child = id;
                    }
                }

                let file = self.obj_mut(id)?;
                file.parent = link_parent;
                file.name = link_name;
                file.times.touch_changed();
                if let Variant::File { hard_links, .. } = &mut file.variant {
                    hard_links.remove(0);
                }

                self.release(link);
                UnlinkOutcome::Relinked
            }
            _ => {
                self.detach(id)?;
                let obj = self.obj_mut(id)?;
                if obj.open_count > 0 {
                    obj.unlinked = true;
                    obj.parent = None;
                    UnlinkOutcome::Deferred
                } else {
                    self.release(id);
                    UnlinkOutcome::Deleted
                }
            }
        };

        self.dirty = true;
        Ok(outcome)
    }

    /// Move `id` into `new_parent` under `new_name`. The destination name must be free.
    pub fn rename(&mut self, id: ObjectId, new_parent: ObjectId, new_name: &str) -> Result<()> {
        validate_name(new_name)?;
        if id == self.root {
            return Err(FsError::Busy);
        }
        if !self.obj(new_parent)?.is_dir() {
            return Err(FsError::NotADirectory);
        }
        if self.find_by_name(new_parent, new_name).is_some() {
            return Err(FsError::AlreadyExists);
        }
        if self.is_ancestor(id, new_parent) {
            return Err(FsError::AccessDenied);
        }

        let old_name_len = self.obj(id)?.name.len() as u64;
        self.reserve_space((new_name.len() as u64).saturating_sub(old_name_len))?;

        self.detach(id)?;
        let obj = self.obj_mut(id)?;
        obj.parent = Some(new_parent);
        obj.name = new_name.to_owned();
        obj.times.touch_changed();

        let dir = self.obj_mut(new_parent)?;
        if let Variant::Directory { children } = &mut dir.variant {
            children.push(id);
        }
        dir.times.touch_modified();

        self.dirty = true;
        Ok(())
    }

    /// Note a new open handle on `id`
    pub fn open_ref(&mut self, id: ObjectId) -> Result<()> {
        self.obj_mut(id)?.open_count += 1;
        Ok(())
    }

    /// Drop an open handle on `id`; returns whether that freed an unlinked object
    pub fn close_ref(&mut self, id: ObjectId) -> Result<bool> {
        let obj = self.obj_mut(id)?;
        obj.open_count = obj.open_count.saturating_sub(1);
        if obj.open_count == 0 && obj.unlinked {
            self.release(id);
            return Ok(true);
        }
        Ok(false)
    }

    /// Attach an object read back from a checkpoint under `parent`
    fn attach_loaded(&mut self, parent: ObjectId, mut object: Object) -> Result<ObjectId> {
        object.parent = Some(parent);
        let id = self.alloc(object);
        match &mut self.obj_mut(parent)?.variant {
            Variant::Directory { children } => children.push(id),
            _ => return Err(FsError::NotADirectory),
        }
        Ok(id)
    }

    /// Point a loaded hard link at its file
    fn link_loaded(&mut self, link: ObjectId, equivalent: ObjectId) -> Result<()> {
        match &mut self.obj_mut(equivalent)?.variant {
            Variant::File { hard_links, .. } => hard_links.push(link),
            _ => return Err(FsError::InvalidArgument),
        }
        match &mut self.obj_mut(link)?.variant {
            Variant::HardLink { equivalent: target } => *target = equivalent,
            _ => return Err(FsError::InvalidArgument),
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const CAPACITY: u64 = 1 << 20;

    fn rw() -> Permissions {
        Permissions::S_IREAD | Permissions::S_IWRITE
    }

    #[test]
    fn test_mknod_and_lookup() -> Result<()> {
        let mut graph = ObjectGraph::new(CAPACITY);
        let root = graph.root();
        let dir = graph.mknod(root, "dir", rw(), NewObject::Directory)?;
        let file = graph.mknod(dir, "file", rw(), NewObject::File)?;

        assert_eq!(graph.find_by_name(root, "dir"), Some(dir));
        assert_eq!(graph.find_by_name(dir, "file"), Some(file));
        assert_eq!(graph.find_by_name(root, "file"), None);
        assert_eq!(
            graph.mknod(dir, "file", rw(), NewObject::File),
            Err(FsError::AlreadyExists)
        );
        assert_eq!(
            graph.mknod(file, "x", rw(), NewObject::File),
            Err(FsError::NotADirectory)
        );
        assert_eq!(
            graph.mknod(root, "a/b", rw(), NewObject::File),
            Err(FsError::InvalidArgument)
        );
        assert_eq!(
            graph.mknod(root, &"n".repeat(MAX_NAME_LENGTH + 1), rw(), NewObject::File),
            Err(FsError::NameTooLong)
        );
        assert_eq!(graph.get(file).map(Object::obj_id), Some(ROOT_OBJ_ID + 2));
        Ok(())
    }

    #[test]
    fn test_stale_ids_do_not_resolve() -> Result<()> {
        let mut graph = ObjectGraph::new(CAPACITY);
        let root = graph.root();
        let a = graph.mknod(root, "a", rw(), NewObject::File)?;
        assert_eq!(graph.unlink(a)?, UnlinkOutcome::Deleted);

        // The slot is reused, but the old id must not see the new object
        let b = graph.mknod(root, "b", rw(), NewObject::File)?;
        assert_eq!(a.index, b.index);
        assert!(graph.get(a).is_none());
        assert!(graph.get(b).is_some());
        Ok(())
    }

    #[test]
    fn test_read_write_resize() -> Result<()> {
        let mut graph = ObjectGraph::new(CAPACITY);
        let file = graph.mknod(graph.root(), "f", rw(), NewObject::File)?;

        graph.write_data(file, 0, b"hello")?;
        graph.write_data(file, 8, b"!")?;
        assert_eq!(graph.file_length(file)?, 9);

        let mut buf = [0xAAu8; 16];
        assert_eq!(graph.read_data(file, 0, &mut buf)?, 9);
        assert_eq!(&buf[..9], b"hello\0\0\0!");
        assert_eq!(graph.read_data(file, 9, &mut buf)?, 0);
        assert_eq!(graph.read_data(file, 100, &mut buf)?, 0);

        graph.resize(file, 2)?;
        assert_eq!(graph.read_data(file, 0, &mut buf)?, 2);
        graph.resize(file, 4)?;
        assert_eq!(graph.read_data(file, 0, &mut buf)?, 4);
        assert_eq!(&buf[..4], b"he\0\0");
        Ok(())
    }

    #[test]
    fn test_capacity_enforced() -> Result<()> {
        let mut graph = ObjectGraph::new(0);
        assert_eq!(
            graph.mknod(graph.root(), "f", rw(), NewObject::File),
            Err(FsError::NoSpace)
        );

        let mut graph = ObjectGraph::new(CAPACITY);
        let file = graph.mknod(graph.root(), "f", rw(), NewObject::File)?;
        let room = graph.free_space();
        assert_eq!(
            graph.write_data(file, 0, &vec![0u8; room as usize + 1]),
            Err(FsError::NoSpace)
        );
        graph.write_data(file, 0, &vec![0u8; room as usize])?;
        assert_eq!(graph.free_space(), 0);
        Ok(())
    }

    #[test]
    fn test_unlink_deferred_until_close() -> Result<()> {
        let mut graph = ObjectGraph::new(CAPACITY);
        let root = graph.root();
        let file = graph.mknod(root, "f", rw(), NewObject::File)?;
        graph.open_ref(file)?;

        assert_eq!(graph.unlink(file)?, UnlinkOutcome::Deferred);
        assert_eq!(graph.find_by_name(root, "f"), None);
        assert!(graph.get(file).is_some_and(Object::is_unlinked));
        assert_eq!(graph.link_count(file), 0);

        // Still usable through the open reference
        graph.write_data(file, 0, b"data")?;
        assert!(graph.close_ref(file)?);
        assert!(graph.get(file).is_none());
        Ok(())
    }

    #[test]
    fn test_unlink_file_with_hard_link() -> Result<()> {
        let mut graph = ObjectGraph::new(CAPACITY);
        let root = graph.root();
        let dir = graph.mknod(root, "d", rw(), NewObject::Directory)?;
        let file = graph.mknod(root, "f", rw(), NewObject::File)?;
        graph.write_data(file, 0, b"shared")?;
        let link = graph.mknod(dir, "l", rw(), NewObject::HardLink(file))?;

        assert_eq!(graph.link_count(file), 2);
        assert_eq!(graph.equivalent(link), file);
        assert_eq!(graph.departing(file), vec![(file, None), (link, Some(file))]);

        assert_eq!(graph.unlink(file)?, UnlinkOutcome::Relinked);
        assert_eq!(graph.find_by_name(root, "f"), None);
        assert_eq!(graph.find_by_name(dir, "l"), Some(file));
        assert!(graph.get(link).is_none());
        assert_eq!(graph.link_count(file), 1);

        let mut buf = [0u8; 6];
        graph.read_data(file, 0, &mut buf)?;
        assert_eq!(&buf, b"shared");
        Ok(())
    }

    #[test]
    fn test_unlink_hard_link_keeps_file() -> Result<()> {
        let mut graph = ObjectGraph::new(CAPACITY);
        let root = graph.root();
        let file = graph.mknod(root, "f", rw(), NewObject::File)?;
        let link = graph.mknod(root, "l", rw(), NewObject::HardLink(file))?;

        assert_eq!(graph.unlink(link)?, UnlinkOutcome::Deleted);
        assert_eq!(graph.find_by_name(root, "f"), Some(file));
        assert_eq!(graph.link_count(file), 1);
        Ok(())
    }

    #[test]
    fn test_unlink_nonempty_dir() -> Result<()> {
        let mut graph = ObjectGraph::new(CAPACITY);
        let root = graph.root();
        let dir = graph.mknod(root, "d", rw(), NewObject::Directory)?;
        let file = graph.mknod(dir, "f", rw(), NewObject::File)?;

        assert_eq!(graph.unlink(dir), Err(FsError::NotEmpty));
        graph.unlink(file)?;
        assert_eq!(graph.unlink(dir)?, UnlinkOutcome::Deleted);
        assert_eq!(graph.unlink(root), Err(FsError::Busy));
        Ok(())
    }

    #[test]
    fn test_siblings_and_rename() -> Result<()> {
        let mut graph = ObjectGraph::new(CAPACITY);
        let root = graph.root();
        let a = graph.mknod(root, "a", rw(), NewObject::Directory)?;
        let b = graph.mknod(a, "b", rw(), NewObject::Directory)?;
        let c = graph.mknod(root, "c", rw(), NewObject::File)?;

        assert_eq!(graph.first_child(root), Some(a));
        assert_eq!(graph.next_sibling(a), Some(c));
        assert_eq!(graph.next_sibling(c), None);

        assert!(graph.is_ancestor(a, b));
        assert!(!graph.is_ancestor(b, a));
        assert_eq!(graph.rename(a, b, "d"), Err(FsError::AccessDenied));

        graph.rename(c, b, "d")?;
        assert_eq!(graph.find_by_name(b, "d"), Some(c));
        assert_eq!(graph.next_sibling(a), None);
        assert_eq!(graph.rename(a, root, "a"), Err(FsError::AlreadyExists));
        Ok(())
    }

    #[test]
    fn test_walk_order() -> Result<()> {
        let mut graph = ObjectGraph::new(CAPACITY);
        let root = graph.root();
        let a = graph.mknod(root, "a", rw(), NewObject::Directory)?;
        let b = graph.mknod(root, "b", rw(), NewObject::File)?;
        let c = graph.mknod(a, "c", rw(), NewObject::File)?;

        assert_eq!(graph.walk(), vec![root, a, c, b]);
        Ok(())
    }
}
