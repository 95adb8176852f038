//! The mount table: which device answers for which path prefix, and the mount lifecycle

use super::State;
use crate::chunk::{ChunkDevice, Geometry};
use crate::error::{FsError, Result};
use crate::guts::checkpoint::{self, CheckpointState};
use crate::guts::{ObjectGraph, ObjectId};

use tracing::{debug, warn};

/// One entry of the static device configuration
pub struct DeviceConfig {
    /// Absolute path prefix the device answers for, e.g. "/flash"
    pub mount_point: String,
    pub storage: Box<dyn ChunkDevice + Send>,
}

impl std::fmt::Debug for DeviceConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceConfig")
            .field("mount_point", &self.mount_point)
            .field("geometry", &self.storage.geometry())
            .finish()
    }
}

/// An object on a particular device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjRef {
    pub dev: usize,
    pub id: ObjectId,
}

pub struct Device {
    /// Normalized: a leading '/', no trailing or repeated separators
    pub mount_point: String,
    components: Vec<String>,
    storage: Box<dyn ChunkDevice + Send>,

    /// Present while mounted
    graph: Option<ObjectGraph>,
    checkpoint: CheckpointState,
}

/// Log a flash-layer failure and reduce it to an [FsError]
fn flash_error(what: &str, e: anyhow::Error) -> FsError {
    if e.is::<std::collections::TryReserveError>() {
        warn!("{what}: out of memory");
        return FsError::OutOfMemory;
    }
    warn!("{what}: {e:#}");
    FsError::Io
}

fn components(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|c| !c.is_empty())
}

pub struct MountTable {
    devices: Vec<Device>,
}

impl MountTable {
    pub fn new(configs: Vec<DeviceConfig>) -> Result<Self> {
        let mut devices: Vec<Device> = Vec::with_capacity(configs.len());
        for config in configs {
            if !config.mount_point.starts_with('/') {
                return Err(FsError::InvalidArgument);
            }
            let components: Vec<String> = components(&config.mount_point)
                .map(str::to_owned)
                .collect();
            if components.iter().any(|c| c == "." || c == "..")
                || devices.iter().any(|dev| dev.components == components)
            {
                return Err(FsError::InvalidArgument);
            }

            devices.push(Device {
                mount_point: format!("/{}", components.join("/")),
                components,
                storage: config.storage,
                graph: None,
                checkpoint: CheckpointState::default(),
            });
        }
        Ok(Self { devices })
    }

    /// The device whose mount point is the longest component-aligned prefix of `path`, and the
    /// rest of the path below it
    pub fn find_device(&self, path: &str) -> Option<(usize, String)> {
        if !path.starts_with('/') {
            return None;
        }
        let path: Vec<&str> = components(path).collect();

        let (index, device) = self
            .devices
            .iter()
            .enumerate()
            .filter(|(_, dev)| {
                dev.components.len() <= path.len()
                    && dev.components.iter().zip(&path).all(|(a, b)| a == b)
            })
            .max_by_key(|(_, dev)| dev.components.len())?;

        Some((index, path[device.components.len()..].join("/")))
    }

    pub fn device(&self, dev: usize) -> Result<&Device> {
        self.devices.get(dev).ok_or(FsError::NoSuchDevice)
    }

    pub fn is_mounted(&self, dev: usize) -> bool {
        self.devices
            .get(dev)
            .is_some_and(|device| device.graph.is_some())
    }

    pub fn graph(&self, dev: usize) -> Result<&ObjectGraph> {
        self.device(dev)?.graph.as_ref().ok_or(FsError::NotMounted)
    }

    pub fn graph_mut(&mut self, dev: usize) -> Result<&mut ObjectGraph> {
        self.devices
            .get_mut(dev)
            .ok_or(FsError::NoSuchDevice)?
            .graph
            .as_mut()
            .ok_or(FsError::NotMounted)
    }

    pub fn geometry(&self, dev: usize) -> Result<Geometry> {
        Ok(self.device(dev)?.storage.geometry())
    }

    /// Bring a device's object graph into memory from its newest checkpoint
    pub fn mount_device(&mut self, dev: usize) -> Result<()> {
        let device = self.devices.get_mut(dev).ok_or(FsError::NoSuchDevice)?;
        if device.graph.is_some() {
            return Err(FsError::Busy);
        }

        let geometry = device.storage.geometry();
        let (good_blocks, state, graph) = checkpoint::load(&mut *device.storage)
            .map_err(|e| flash_error(&format!("mounting {}", device.mount_point), e))?;

        let graph = match graph {
            Some(graph) => graph,
            None => {
                debug!("no checkpoint on {}, starting empty", device.mount_point);
                ObjectGraph::new(checkpoint::capacity(geometry, good_blocks))
            }
        };
        debug!(
            "mounted {} ({good_blocks} good blocks, {} bytes capacity)",
            device.mount_point,
            graph.capacity()
        );

        device.checkpoint = state;
        device.graph = Some(graph);
        Ok(())
    }

    /// Write a checkpoint if anything changed since the last one
    pub fn checkpoint_device(&mut self, dev: usize) -> Result<()> {
        let device = self.devices.get_mut(dev).ok_or(FsError::NoSuchDevice)?;
        let graph = device.graph.as_mut().ok_or(FsError::NotMounted)?;
        if !graph.is_dirty() {
            return Ok(());
        }

        checkpoint::store(&mut *device.storage, &mut device.checkpoint, graph)
            .map_err(|e| flash_error(&format!("checkpointing {}", device.mount_point), e))
    }

    pub fn unmount_device(&mut self, dev: usize) -> Result<()> {
        let device = self.devices.get_mut(dev).ok_or(FsError::NoSuchDevice)?;
        device.graph = None;
        debug!("unmounted {}", device.mount_point);
        Ok(())
    }

    /// Tear the table down, handing back each device's storage
    pub fn into_storage(self) -> Vec<(String, Box<dyn ChunkDevice + Send>)> {
        self.devices
            .into_iter()
            .map(|device| (device.mount_point, device.storage))
            .collect()
    }
}

impl State {
    /// The device that `path` names exactly
    fn device_at(&self, path: &str) -> Result<usize> {
        match self.mounts.find_device(path) {
            Some((dev, rest)) if rest.is_empty() => Ok(dev),
            _ => Err(FsError::NoSuchDevice),
        }
    }

    pub(super) fn mount(&mut self, path: &str) -> Result<()> {
        let dev = self.device_at(path)?;
        self.mounts.mount_device(dev)
    }

    pub(super) fn unmount(&mut self, path: &str) -> Result<()> {
        let dev = self.device_at(path)?;
        if !self.mounts.is_mounted(dev) {
            return Err(FsError::NotMounted);
        }

        self.mounts.checkpoint_device(dev)?;
        if self.handles.iter().any(|handle| handle.obj.dev == dev) {
            return Err(FsError::Busy);
        }

        self.searches.invalidate_device(dev);
        self.mounts.unmount_device(dev)
    }

    /// The mounted device owning `path`
    fn mounted_device(&self, path: &str) -> Result<usize> {
        let (dev, _) = self.mounts.find_device(path).ok_or(FsError::NoSuchDevice)?;
        if !self.mounts.is_mounted(dev) {
            return Err(FsError::NotMounted);
        }
        Ok(dev)
    }

    pub(super) fn sync(&mut self, path: &str) -> Result<()> {
        let dev = self.mounted_device(path)?;
        self.mounts.checkpoint_device(dev)
    }

    pub(super) fn freespace(&self, path: &str) -> Result<u64> {
        let dev = self.mounted_device(path)?;
        Ok(self.mounts.graph(dev)?.free_space())
    }

    pub(super) fn totalspace(&self, path: &str) -> Result<u64> {
        let dev = self.mounted_device(path)?;
        Ok(self.mounts.graph(dev)?.capacity())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::chunk::TaggedNand;
    use crate::nand::{SimNand, TEST_LAYOUT};

    fn config(mount_point: &str) -> DeviceConfig {
        DeviceConfig {
            mount_point: mount_point.to_owned(),
            storage: Box::new(TaggedNand::new(SimNand::new(TEST_LAYOUT)).unwrap()),
        }
    }

    #[test]
    fn test_longest_prefix() -> Result<()> {
        let table = MountTable::new(vec![config("/"), config("/a"), config("/a/b/")])?;

        assert_eq!(table.find_device("/a/b/c"), Some((2, "c".into())));
        assert_eq!(table.find_device("/a/b"), Some((2, "".into())));
        assert_eq!(table.find_device("/a/bc"), Some((1, "bc".into())));
        assert_eq!(table.find_device("/abc"), Some((0, "abc".into())));
        assert_eq!(table.find_device("//a///x"), Some((1, "x".into())));
        assert_eq!(table.find_device("a"), None);
        assert_eq!(table.device(2)?.mount_point, "/a/b");
        Ok(())
    }

    #[test]
    fn test_component_aligned() -> Result<()> {
        let table = MountTable::new(vec![config("/a")])?;
        assert_eq!(table.find_device("/abc"), None);
        assert_eq!(table.find_device("/a"), Some((0, "".into())));
        Ok(())
    }

    #[test]
    fn test_bad_configs() {
        for configs in [
            vec![config("relative")],
            vec![config("/x"), config("/x/")],
            vec![config("/x/../y")],
        ] {
            assert_eq!(MountTable::new(configs).err(), Some(FsError::InvalidArgument));
        }
    }
}
