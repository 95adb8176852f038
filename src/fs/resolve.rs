//! Path resolution: mount point matching, `.`/`..` handling, and symlink following

use super::mount::{MountTable, ObjRef};
use crate::error::{FsError, Result};
use crate::guts::Variant;

/// How many symlinks one resolution may pass through
pub const MAX_SYMLINK_DEPTH: u32 = 5;

impl MountTable {
    /// Find the directory that holds the last component of `path`, and that component.
    ///
    /// Without a `start` directory, `path` must be absolute and is matched against the mount
    /// points. The last component is not looked up; it is "" when `path` names a directory
    /// outright (e.g. a mount point).
    pub fn resolve_parent(
        &self,
        start: Option<ObjRef>,
        path: &str,
        depth: u32,
    ) -> Result<(ObjRef, String)> {
        if depth > MAX_SYMLINK_DEPTH {
            return Err(FsError::TooManySymlinks);
        }

        let (mut dir, remaining) = match start {
            Some(start) => (start, path.to_owned()),
            None => {
                let (dev, remaining) = self.find_device(path).ok_or(FsError::NoSuchDevice)?;
                let graph = self.graph(dev).map_err(|_| FsError::NoSuchDevice)?;
                let root = ObjRef {
                    dev,
                    id: graph.root(),
                };
                (root, remaining)
            }
        };

        let mut components: Vec<&str> = remaining.split('/').filter(|c| !c.is_empty()).collect();
        let last = components.pop().unwrap_or_default().to_owned();

        for component in components {
            let next = self.lookup(dir, component)?.ok_or(FsError::NotADirectory)?;
            let next = self.follow_link(next, depth)?;
            if !self.graph(next.dev)?.get(next.id).is_some_and(|obj| obj.is_dir()) {
                return Err(FsError::NotADirectory);
            }
            dir = next;
        }

        Ok((dir, last))
    }

    /// Look up `name` in `dir`, with `.` and `..` (and "", meaning `dir` itself) handled
    pub fn lookup(&self, dir: ObjRef, name: &str) -> Result<Option<ObjRef>> {
        let graph = self.graph(dir.dev)?;
        let id = match name {
            "" | "." => Some(dir.id),
            ".." => Some(
                graph
                    .get(dir.id)
                    .and_then(|obj| obj.parent())
                    .unwrap_or(dir.id),
            ),
            _ => graph.find_by_name(dir.id, name),
        };
        Ok(id.map(|id| ObjRef { dev: dir.dev, id }))
    }

    /// Resolve `path` to an object, without following a symlink in the last position
    pub fn find_object(&self, start: Option<ObjRef>, path: &str, depth: u32) -> Result<ObjRef> {
        let (dir, name) = self.resolve_parent(start, path, depth)?;
        self.lookup(dir, &name)?.ok_or(FsError::NotFound)
    }

    /// If `obj` is a symlink, chase it (and any symlink it leads to) to a non-symlink
    pub fn follow_link(&self, mut obj: ObjRef, mut depth: u32) -> Result<ObjRef> {
        loop {
            let graph = self.graph(obj.dev)?;
            let Some(target) = graph.get(obj.id) else {
                return Err(FsError::NotFound);
            };
            let Variant::SymLink { alias } = target.variant() else {
                return Ok(obj);
            };

            depth += 1;
            if depth > MAX_SYMLINK_DEPTH {
                return Err(FsError::TooManySymlinks);
            }

            let base = if alias.starts_with('/') {
                None
            } else {
                Some(ObjRef {
                    dev: obj.dev,
                    id: target.parent().unwrap_or(graph.root()),
                })
            };
            obj = self.find_object(base, alias, depth)?;
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::chunk::TaggedNand;
    use crate::fs::DeviceConfig;
    use crate::guts::{NewObject, Permissions};
    use crate::nand::{SimNand, TEST_LAYOUT};

    /// /flash with: dir/, dir/file, abs -> /flash/dir, rel -> dir/file, loop -> loop
    fn table() -> MountTable {
        let mut table = MountTable::new(vec![DeviceConfig {
            mount_point: "/flash".into(),
            storage: Box::new(TaggedNand::new(SimNand::new(TEST_LAYOUT)).unwrap()),
        }])
        .unwrap();
        table.mount_device(0).unwrap();

        let perms = Permissions::S_IREAD | Permissions::S_IWRITE;
        let graph = table.graph_mut(0).unwrap();
        let root = graph.root();
        let dir = graph.mknod(root, "dir", perms, NewObject::Directory).unwrap();
        graph.mknod(dir, "file", perms, NewObject::File).unwrap();
        for (name, alias) in [("abs", "/flash/dir"), ("rel", "dir/file"), ("loop", "loop")] {
            graph
                .mknod(root, name, perms, NewObject::SymLink(alias.into()))
                .unwrap();
        }
        table
    }

    fn name_of(table: &MountTable, obj: ObjRef) -> String {
        table.graph(obj.dev).unwrap().get(obj.id).unwrap().name().to_owned()
    }

    #[test]
    fn test_resolve_parent() -> Result<()> {
        let table = table();
        let (dir, name) = table.resolve_parent(None, "/flash/dir/file", 0)?;
        assert_eq!(name_of(&table, dir), "dir");
        assert_eq!(name, "file");

        let (dir, name) = table.resolve_parent(None, "/flash", 0)?;
        assert_eq!(dir.id, table.graph(0)?.root());
        assert_eq!(name, "");

        let (dir, _) = table.resolve_parent(None, "/flash/dir/./../dir//file", 0)?;
        assert_eq!(name_of(&table, dir), "dir");

        // ".." at the root stays at the root
        let obj = table.find_object(None, "/flash/../../dir", 0)?;
        assert_eq!(name_of(&table, obj), "dir");
        Ok(())
    }

    #[test]
    fn test_resolve_errors() {
        let table = table();
        assert_eq!(
            table.find_object(None, "/flash/missing", 0),
            Err(FsError::NotFound)
        );
        assert_eq!(
            table.find_object(None, "/flash/missing/x", 0),
            Err(FsError::NotADirectory)
        );
        assert_eq!(
            table.find_object(None, "/flash/dir/file/x", 0),
            Err(FsError::NotADirectory)
        );
        assert_eq!(
            table.find_object(None, "/other/x", 0),
            Err(FsError::NoSuchDevice)
        );
    }

    #[test]
    fn test_symlinks() -> Result<()> {
        let table = table();

        // Intermediate symlinks are always followed
        let obj = table.find_object(None, "/flash/abs/file", 0)?;
        assert_eq!(name_of(&table, obj), "file");

        // A terminal symlink is only followed on request
        let link = table.find_object(None, "/flash/rel", 0)?;
        assert_eq!(name_of(&table, link), "rel");
        let obj = table.follow_link(link, 0)?;
        assert_eq!(name_of(&table, obj), "file");

        let looping = table.find_object(None, "/flash/loop", 0)?;
        assert_eq!(table.follow_link(looping, 0), Err(FsError::TooManySymlinks));
        assert_eq!(
            table.find_object(None, "/flash/loop/x", 0),
            Err(FsError::TooManySymlinks)
        );
        Ok(())
    }
}
