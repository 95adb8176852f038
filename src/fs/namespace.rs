//! Operations that change the directory tree: unlink, rmdir, rename, mkdir, symlink, link, and
//! readlink alongside them

use super::mount::ObjRef;
use super::State;
use crate::error::{FsError, Result};
use crate::guts::{NewObject, Permissions, UnlinkOutcome};

use tracing::debug;

impl State {
    /// Take an object out of its directory, keeping search contexts off it
    fn remove(&mut self, obj: ObjRef) -> Result<()> {
        let graph = self.mounts.graph_mut(obj.dev)?;
        for (departing, successor) in graph.departing(obj.id) {
            self.searches.notify_removal(obj.dev, departing, successor);
        }

        match graph.unlink(obj.id)? {
            UnlinkOutcome::Deferred => debug!("object still open, deleting on last close"),
            UnlinkOutcome::Relinked => debug!("file kept alive by a hard link"),
            UnlinkOutcome::Deleted => {}
        }
        Ok(())
    }

    pub(super) fn unlink(&mut self, path: &str) -> Result<()> {
        let obj = self.mounts.find_object(None, path, 0)?;
        let graph = self.mounts.graph(obj.dev)?;
        if graph.get(obj.id).ok_or(FsError::NotFound)?.is_dir() {
            return Err(FsError::IsADirectory);
        }
        self.remove(obj)
    }

    pub(super) fn rmdir(&mut self, path: &str) -> Result<()> {
        let obj = self.mounts.find_object(None, path, 0)?;
        let graph = self.mounts.graph(obj.dev)?;
        let dir = graph.get(obj.id).ok_or(FsError::NotFound)?;

        if obj.id == graph.root() {
            return Err(FsError::Busy);
        }
        match dir.children() {
            None => return Err(FsError::NotADirectory),
            Some(children) if !children.is_empty() => return Err(FsError::NotEmpty),
            Some(_) => {}
        }
        self.remove(obj)
    }

    pub(super) fn rename(&mut self, old_path: &str, new_path: &str) -> Result<()> {
        let (old_dir, old_name) = self.mounts.resolve_parent(None, old_path, 0)?;
        let (new_dir, new_name) = self.mounts.resolve_parent(None, new_path, 0)?;
        if old_dir.dev != new_dir.dev {
            return Err(FsError::CrossDevice);
        }
        let dev = old_dir.dev;

        let obj = self
            .mounts
            .lookup(old_dir, &old_name)?
            .ok_or(FsError::NotFound)?;
        let graph = self.mounts.graph(dev)?;
        if obj.id == graph.root() {
            return Err(FsError::Busy);
        }
        if matches!(old_name.as_str(), "." | "..") || matches!(new_name.as_str(), "" | "." | "..")
        {
            return Err(FsError::InvalidArgument);
        }

        let is_dir = graph.get(obj.id).is_some_and(|o| o.is_dir());
        if is_dir && graph.is_ancestor(obj.id, new_dir.id) {
            return Err(FsError::AccessDenied);
        }

        // Renaming over an existing entry replaces it, provided the two are compatible
        if let Some(existing) = graph.find_by_name(new_dir.id, &new_name) {
            if graph.equivalent(existing) == graph.equivalent(obj.id) {
                return Ok(());
            }

            let target = graph.get(existing).ok_or(FsError::NotFound)?;
            match (is_dir, target.children()) {
                (true, None) => return Err(FsError::NotADirectory),
                (false, Some(_)) => return Err(FsError::IsADirectory),
                (true, Some(children)) if !children.is_empty() => return Err(FsError::NotEmpty),
                _ => {}
            }
            self.remove(ObjRef { dev, id: existing })?;
        }

        let graph = self.mounts.graph_mut(dev)?;
        let successor = graph.next_sibling(obj.id);
        self.searches.notify_removal(dev, obj.id, successor);
        graph.rename(obj.id, new_dir.id, &new_name)
    }

    /// Create a new, not yet existing, object at `path`
    fn create(&mut self, path: &str, perms: Permissions, kind: NewObject) -> Result<ObjRef> {
        let (dir, name) = self.mounts.resolve_parent(None, path, 0)?;
        if self.mounts.lookup(dir, &name)?.is_some() {
            return Err(FsError::AlreadyExists);
        }

        let id = self.mounts.graph_mut(dir.dev)?.mknod(dir.id, &name, perms, kind)?;
        Ok(ObjRef { dev: dir.dev, id })
    }

    pub(super) fn mkdir(&mut self, path: &str, mode: u32) -> Result<()> {
        self.create(path, Permissions::from_mode(mode), NewObject::Directory)
            .map(drop)
    }

    pub(super) fn symlink(&mut self, target: &str, path: &str) -> Result<()> {
        let perms = Permissions::from_mode(0o777);
        self.create(path, perms, NewObject::SymLink(target.to_owned()))
            .map(drop)
    }

    pub(super) fn link(&mut self, existing: &str, new_path: &str) -> Result<()> {
        let obj = self.mounts.find_object(None, existing, 0)?;
        let (dir, name) = self.mounts.resolve_parent(None, new_path, 0)?;
        if self.mounts.lookup(dir, &name)?.is_some() {
            return Err(FsError::AlreadyExists);
        }
        if dir.dev != obj.dev {
            return Err(FsError::CrossDevice);
        }

        // Hard links only ever point at a file, never at another link
        let graph = self.mounts.graph_mut(obj.dev)?;
        let file = graph.equivalent(obj.id);
        let perms = match graph.get(file) {
            Some(target) if target.children().is_none() && target.alias().is_none() => {
                target.perms()
            }
            Some(_) => return Err(FsError::AccessDenied),
            None => return Err(FsError::NotFound),
        };
        graph.mknod(dir.id, &name, perms, NewObject::HardLink(file))?;
        Ok(())
    }

    pub(super) fn readlink(&self, path: &str) -> Result<String> {
        let obj = self.mounts.find_object(None, path, 0)?;
        self.mounts
            .graph(obj.dev)?
            .get(obj.id)
            .and_then(|o| o.alias())
            .map(str::to_owned)
            .ok_or(FsError::InvalidArgument)
    }
}
