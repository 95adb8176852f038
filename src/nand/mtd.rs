//! NAND abstraction layer implementation over the Linux MTD subsystem
//!
//! This lets a YAFFS partition be mounted straight from a `/dev/mtdX` node, with MTD's own
//! bad-block table standing in for [super::SimNand]'s `marked_bad` flag.

use super::{Nand, NandBlock, NandLayout};

use anyhow::{bail, ensure, Context};
use nix::errno::Errno;

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::mem::MaybeUninit;
use std::os::{fd::AsRawFd, unix::fs::FileExt};
use std::path::Path;

/// NAND flash that wraps an open /dev/mtdX file
#[derive(Debug)]
pub struct MtdNand {
    file: File,
    layout: NandLayout,
}

impl MtdNand {
    /// Open an `mtd` device, by path (e.g. "/dev/mtd0")
    pub fn open<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let file = File::options()
            .read(true)
            .write(true)
            .open(path)
            .with_context(|| format!("opening {}", path.display()))?;
        let layout = unsafe {
            let mut info = MaybeUninit::<ioctl::mtd_info_user>::uninit();
            ioctl::memgetinfo(file.as_raw_fd(), info.as_mut_ptr())?;
            info.assume_init()
        }
        .try_into()?;

        Ok(Self { file, layout })
    }

    /// Open an `mtd` device by its partition name, by searching `/proc/mtd`
    pub fn open_named(name: &str) -> anyhow::Result<Self> {
        let quoted = format!("\"{name}\"");

        let proc_mtd = BufReader::new(File::open("/proc/mtd")?);
        for line in proc_mtd.lines() {
            let line = line?;
            if !line.contains(&quoted) {
                continue;
            }
            if let Some((mtd_dev, _)) = line.split_once(':') {
                return Self::open(Path::new("/dev").join(mtd_dev));
            }
        }

        bail!("MTD partition {quoted} could not be found");
    }

    /// Byte offset of the first page of a block, in u64 so that devices past 4 GiB work
    fn block_base(&self, index: u32) -> u64 {
        u64::from(index) * self.layout.block_size() as u64
    }
}

impl Nand for MtdNand {
    type Block<'a> = MtdBlock<'a>;

    fn block(&mut self, index: u32) -> anyhow::Result<Option<MtdBlock<'_>>> {
        ensure!(index < self.layout.blocks, "block {index} out of range");

        let block_base = self.block_base(index);
        let bad = unsafe { ioctl::memgetbadblock(self.file.as_raw_fd(), &block_base)? };
        if bad == 0 {
            Ok(Some(MtdBlock { nand: self, index }))
        } else {
            Ok(None)
        }
    }

    fn get_layout(&self) -> NandLayout {
        self.layout
    }
}

pub struct MtdBlock<'a> {
    nand: &'a MtdNand,
    index: u32,
}

impl MtdBlock<'_> {
    /// Ensure that the byte count and starting page range is valid, and compute the /dev/mtdX
    /// offset for the page
    fn offset_for(&self, start_page: u32, bytes: usize) -> anyhow::Result<u64> {
        ensure!(
            bytes % self.page_size() == 0,
            "buffer not multiple of page size"
        );

        let end_page = start_page + (bytes / self.page_size()) as u32;
        ensure!(
            end_page <= self.page_count(),
            "block {0}, page range {start_page}..{end_page} out of bounds",
            self.index
        );

        Ok(self.nand.block_base(self.index) + self.page_size() as u64 * u64::from(start_page))
    }
}

impl NandBlock for MtdBlock<'_> {
    fn page_count(&self) -> u32 {
        self.nand.layout.pages_per_block
    }
    fn page_size(&self) -> usize {
        self.nand.layout.bytes_per_page
    }
    fn read(&self, start_page: u32, content: &mut [u8]) -> anyhow::Result<()> {
        let offset = self.offset_for(start_page, content.len())?;
        match self.nand.file.read_exact_at(content, offset) {
            // The MTD layer reports uncorrectable ECC failures as EBADMSG; the data is garbage.
            Err(e) if e.raw_os_error() == Some(Errno::EBADMSG as i32) => {
                bail!("uncorrectable ECC error in block {}", self.index)
            }
            r => Ok(r?),
        }
    }
    fn program(&mut self, start_page: u32, content: &[u8]) -> anyhow::Result<()> {
        let offset = self.offset_for(start_page, content.len())?;
        Ok(self.nand.file.write_all_at(content, offset)?)
    }
    fn erase(&mut self) -> anyhow::Result<()> {
        let erase_info = ioctl::erase_info_user64 {
            start: self.nand.block_base(self.index),
            length: self.nand.layout.block_size() as u64,
        };
        unsafe {
            ioctl::memerase64(self.nand.file.as_raw_fd(), &erase_info)?;
        }
        Ok(())
    }
    fn mark_bad(self) -> anyhow::Result<()> {
        let block_base = self.nand.block_base(self.index);
        unsafe {
            ioctl::memsetbadblock(self.nand.file.as_raw_fd(), &block_base)?;
        }
        Ok(())
    }
}

mod ioctl {
    //! The private ioctls for interfacing with MTD devices

    use super::NandLayout;

    use anyhow::ensure;
    use nix::{ioctl_read, ioctl_write_ptr};

    const MTD_IOC_MAGIC: u8 = b'M';

    /// `MTD_NANDFLASH` and `MTD_MLCNANDFLASH` from `mtd-abi.h`
    const MTD_NAND_TYPES: [u8; 2] = [4, 8];

    #[repr(C)]
    pub struct mtd_info_user {
        pub r#type: u8,
        pub flags: u32,
        pub size: u32,
        pub erasesize: u32,
        pub writesize: u32,
        pub oobsize: u32,
        pub padding: u64,
    }
    ioctl_read!(memgetinfo, MTD_IOC_MAGIC, 1, mtd_info_user);

    impl TryInto<NandLayout> for mtd_info_user {
        type Error = anyhow::Error;

        fn try_into(self) -> anyhow::Result<NandLayout> {
            ensure!(
                MTD_NAND_TYPES.contains(&self.r#type),
                "MTD device is not NAND flash (type {})",
                self.r#type
            );
            ensure!(
                self.erasesize != 0 && self.writesize != 0,
                "MTD device reports zero-sized geometry"
            );
            ensure!(
                self.size % self.erasesize == 0,
                "MTD size not multiple of erasesize"
            );
            ensure!(
                self.erasesize % self.writesize == 0,
                "MTD erasesize not multiple of writesize"
            );

            Ok(NandLayout {
                blocks: self.size / self.erasesize,
                pages_per_block: self.erasesize / self.writesize,
                bytes_per_page: self.writesize as usize,
            })
        }
    }

    #[repr(C)]
    pub struct erase_info_user64 {
        pub start: u64,
        pub length: u64,
    }
    ioctl_write_ptr!(memerase64, MTD_IOC_MAGIC, 20, erase_info_user64);

    ioctl_write_ptr!(memgetbadblock, MTD_IOC_MAGIC, 11, u64);
    ioctl_write_ptr!(memsetbadblock, MTD_IOC_MAGIC, 12, u64);
}
