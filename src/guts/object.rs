//! Filesystem objects as stored in the [super::ObjectGraph] arena.

use bitflags::bitflags;

bitflags! {
    /// Permission bits of an object. The object's type is carried separately by its [Variant].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Permissions: u32 {
        /// Owner may read
        const S_IREAD  = 0o400;
        /// Owner may write
        const S_IWRITE = 0o200;
        /// Owner may execute
        const S_IEXEC  = 0o100;
        const S_IRGRP  = 0o040;
        const S_IWGRP  = 0o020;
        const S_IXGRP  = 0o010;
        const S_IROTH  = 0o004;
        const S_IWOTH  = 0o002;
        const S_IXOTH  = 0o001;
    }
}

impl Permissions {
    /// Interpret a POSIX-style mode, discarding type and set-id bits
    pub fn from_mode(mode: u32) -> Self {
        Self::from_bits_truncate(mode)
    }
}

/// A generation-checked reference into the object arena.
///
/// Once the object is freed, the id stops resolving, even if its slot gets reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjectId {
    pub(super) index: u32,
    pub(super) generation: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectType {
    File,
    Directory,
    SymLink,
    HardLink,
}

/// The type-specific part of an object. Never changes variant after creation.
#[derive(Debug, Clone)]
pub enum Variant {
    File {
        data: Vec<u8>,

        /// The hard links that share this file's data
        hard_links: Vec<ObjectId>,
    },
    Directory {
        /// In listing order
        children: Vec<ObjectId>,
    },
    SymLink {
        alias: String,
    },
    HardLink {
        equivalent: ObjectId,
    },
}

impl Variant {
    pub fn object_type(&self) -> ObjectType {
        match self {
            Variant::File { .. } => ObjectType::File,
            Variant::Directory { .. } => ObjectType::Directory,
            Variant::SymLink { .. } => ObjectType::SymLink,
            Variant::HardLink { .. } => ObjectType::HardLink,
        }
    }
}

/// Seconds since the Unix epoch
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Times {
    pub atime: u32,
    pub mtime: u32,
    pub ctime: u32,
}

impl Times {
    pub fn now() -> Self {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map_or(0, |d| d.as_secs() as u32);
        Self {
            atime: now,
            mtime: now,
            ctime: now,
        }
    }

    pub(super) fn touch_accessed(&mut self) {
        self.atime = Self::now().atime;
    }

    pub(super) fn touch_modified(&mut self) {
        let now = Self::now();
        self.mtime = now.mtime;
        self.ctime = now.ctime;
    }

    pub(super) fn touch_changed(&mut self) {
        self.ctime = Self::now().ctime;
    }
}

#[derive(Debug, Clone)]
pub struct Object {
    /// Stable inode number, persisted across mounts
    pub(super) obj_id: u32,
    pub(super) name: String,
    pub(super) parent: Option<ObjectId>,
    pub(super) perms: Permissions,
    pub(super) times: Times,
    pub(super) variant: Variant,

    /// Number of open handles referring to this object
    pub(super) open_count: u32,

    /// Detached from the namespace, waiting for its last handle to close
    pub(super) unlinked: bool,
}

impl Object {
    pub fn obj_id(&self) -> u32 {
        self.obj_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn parent(&self) -> Option<ObjectId> {
        self.parent
    }

    pub fn perms(&self) -> Permissions {
        self.perms
    }

    pub fn times(&self) -> Times {
        self.times
    }

    pub fn variant(&self) -> &Variant {
        &self.variant
    }

    pub fn object_type(&self) -> ObjectType {
        self.variant.object_type()
    }

    pub fn is_dir(&self) -> bool {
        matches!(self.variant, Variant::Directory { .. })
    }

    pub fn is_unlinked(&self) -> bool {
        self.unlinked
    }

    pub fn open_count(&self) -> u32 {
        self.open_count
    }

    /// The symlink target, for symlinks
    pub fn alias(&self) -> Option<&str> {
        match &self.variant {
            Variant::SymLink { alias } => Some(alias),
            _ => None,
        }
    }

    pub fn children(&self) -> Option<&[ObjectId]> {
        match &self.variant {
            Variant::Directory { children } => Some(children),
            _ => None,
        }
    }
}

#[test]
fn test_permissions_from_mode() {
    let perms = Permissions::from_mode(0o100644);
    assert!(perms.contains(Permissions::S_IREAD | Permissions::S_IWRITE));
    assert!(!perms.contains(Permissions::S_IEXEC));
    assert_eq!(perms.bits(), 0o644);
}
