//! Abstractions and code to access raw NAND flash
//!
//! The filesystem never talks to these types directly; it goes through the chunk layer in
//! [crate::chunk], which packs tags into each page. What lives here is the lowest-level contract:
//! page-granular reads, strictly ascending page programs, whole-block erases, and bad-block
//! marking.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::str::FromStr;

use anyhow::{bail, ensure};

#[cfg(target_os = "linux")]
pub mod mtd;

/// The byte pattern stored in place of a bad block when a NAND is dumped to an image file
const BAD_BLOCK_FILL: u8 = 0xBD;

/// Convenience methods for operating on `[u8]`s that represent page contents
pub trait PageUtil {
    /// Does this page contain the all-1s bit pattern?
    fn is_erased(&self) -> bool;
}

impl PageUtil for [u8] {
    fn is_erased(&self) -> bool {
        self.iter().all(|&x| x == 0xFF)
    }
}

/// A pub-fields struct describing the data layout of a NAND flash device
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct NandLayout {
    pub blocks: u32,
    pub pages_per_block: u32,
    pub bytes_per_page: usize,
}

impl NandLayout {
    /// Number of bytes in one erase block
    pub fn block_size(&self) -> usize {
        self.pages_per_block as usize * self.bytes_per_page
    }

    /// Total number of pages across the device
    pub fn page_count(&self) -> u32 {
        self.blocks * self.pages_per_block
    }
}

/// Parse strings like "BLOCKSxPAGESxBYTES"
impl FromStr for NandLayout {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        let [blocks, pages_per_block, bytes_per_page]: [&str; 3] = s
            .split('x')
            .collect::<Vec<_>>()
            .try_into()
            .map_err(|_| anyhow::anyhow!("expected #x#x#"))?;
        let blocks = blocks.parse()?;
        let pages_per_block = pages_per_block.parse()?;
        let bytes_per_page = bytes_per_page.parse()?;

        ensure!(
            blocks > 0 && pages_per_block > 0 && bytes_per_page > 0,
            "NAND layout dimensions must be nonzero"
        );

        Ok(NandLayout {
            blocks,
            pages_per_block,
            bytes_per_page,
        })
    }
}

/// Represents a NAND flash device
pub trait Nand {
    type Block<'a>: NandBlock + 'a
    where
        Self: 'a;

    /// Get a block
    ///
    /// Returns None if `index` refers to a block marked bad
    fn block(&mut self, index: u32) -> anyhow::Result<Option<Self::Block<'_>>>;

    /// Get the layout of the NAND
    fn get_layout(&self) -> NandLayout;
}

/// Represents a block of a NAND flash device
pub trait NandBlock {
    /// How many pages in this block?
    fn page_count(&self) -> u32;

    /// How many bytes per page?
    fn page_size(&self) -> usize;

    /// Read an integral number of pages, starting at the specified page
    fn read(&self, start_page: u32, content: &mut [u8]) -> anyhow::Result<()>;

    /// Write the specified content, beginning at the specified page
    ///
    /// Note that `index` must be greater than any previously-written index, or in other words,
    /// writing a page makes it and all skipped pages nonwritable until the next erase.
    fn program(&mut self, start_page: u32, content: &[u8]) -> anyhow::Result<()>;

    /// Erase a block, making all pages writable again
    fn erase(&mut self) -> anyhow::Result<()>;

    /// Marks the block as bad, consuming the block object (it cannot be retrieved again).
    ///
    /// This should be called if an erase() results in error, or if a (properly in-order) program()
    /// results in error and we have already tried erase() and reprogramming it.
    fn mark_bad(self) -> anyhow::Result<()>;
}

/// Write every block of a NAND out to a stream, substituting a fill pattern for bad blocks.
///
/// The output is suitable for [SimNand::load].
pub fn dump<N: Nand, W: Write + ?Sized>(nand: &mut N, write: &mut W) -> anyhow::Result<()> {
    let layout = nand.get_layout();
    let mut buf = vec![0; layout.block_size()];

    for block in 0..layout.blocks {
        match nand.block(block)? {
            None => buf.fill(BAD_BLOCK_FILL),
            Some(block) => block.read(0, &mut buf)?,
        };

        write.write_all(&buf)?;
    }

    Ok(())
}

/// A failure that a [SimNand] block has been told to exhibit
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SimFault {
    /// Every program() fails, as on a worn-out block
    Program,

    /// Every erase() fails
    Erase,
}

/// A simulated in-memory NAND flash, for testing purposes
#[derive(Debug, Clone)]
pub struct SimNand {
    blocks: Box<[SimBlock]>,
    layout: NandLayout,
}

/// A block of SimNand
#[derive(Debug, Clone)]
pub struct SimBlock {
    /// All bytes of all written pages (legally, can only append to this)
    data: Vec<u8>,

    /// How many pages in this block
    page_count: u32,

    /// How many bytes per page
    page_size: usize,

    /// Is this block marked bad?
    marked_bad: bool,

    /// How many times this block has been erased
    erase_count: u32,

    /// Injected failure, if any
    fault: Option<SimFault>,
}

impl SimNand {
    /// Create an empty SimNand with the specified layout
    pub fn new(layout: NandLayout) -> Self {
        let blocks = vec![SimBlock::new(layout); layout.blocks as usize];
        let blocks = blocks.into_boxed_slice();

        Self { blocks, layout }
    }

    /// Initialize the NAND contents with content read from a type implementing `Read`.
    ///
    /// Blocks consisting entirely of the bad-block fill pattern come back marked bad.
    pub fn load<R: Read>(&mut self, read: &mut R) -> anyhow::Result<()> {
        let mut buf = vec![0; self.layout.block_size()];

        for mut block in self.blocks.iter_mut() {
            read.read_exact(&mut buf)?;
            block.data.clear();
            block.marked_bad = buf.iter().all(|&x| x == BAD_BLOCK_FILL);
            if !block.marked_bad {
                block.program(0, &buf)?;
            }
        }

        Ok(())
    }

    /// Write the contents of this simulated NAND out to a writable stream (such as a File)
    pub fn save<W: Write>(&mut self, write: &mut W) -> anyhow::Result<()> {
        dump(self, write)
    }

    /// Make a block misbehave from now on
    pub fn inject_fault(&mut self, index: u32, fault: SimFault) -> anyhow::Result<()> {
        let Some(block) = self.blocks.get_mut(index as usize) else {
            bail!("block {index} out of range");
        };
        block.fault = Some(fault);
        Ok(())
    }

    /// How many times each block has been erased, keyed by block index (never-erased blocks are
    /// omitted)
    pub fn erase_counts(&self) -> HashMap<u32, u32> {
        self.blocks
            .iter()
            .enumerate()
            .filter(|(_, block)| block.erase_count > 0)
            .map(|(i, block)| (i as u32, block.erase_count))
            .collect()
    }
}

impl SimBlock {
    /// Construct an empty block within the given layout
    fn new(layout: NandLayout) -> Self {
        Self {
            data: Default::default(),
            page_count: layout.pages_per_block,
            page_size: layout.bytes_per_page,
            marked_bad: false,
            erase_count: 0,
            fault: None,
        }
    }

    fn write_page(&mut self, index: u32, content: &[u8]) -> anyhow::Result<()> {
        ensure!(content.len() == self.page_size, "content not page-sized");
        ensure!(index < self.page_count, "page index out of bounds");
        ensure!(self.fault != Some(SimFault::Program), "program failure");

        let begin = index as usize * self.page_size;

        ensure!(begin >= self.data.len(), "write in already-written area");

        // Writing fully-erased content is a no-op.
        if !content.is_erased() {
            self.data.resize(begin, 0xFF);
            self.data.extend_from_slice(content);
        }

        Ok(())
    }

    fn read_page(&self, index: u32, content: &mut [u8]) -> anyhow::Result<()> {
        ensure!(content.len() == self.page_size, "content not page-sized");
        ensure!(index < self.page_count, "page index out of bounds");

        let begin = index as usize * self.page_size;
        let end = begin + self.page_size;

        if let Some(page) = self.data.get(begin..end) {
            content.copy_from_slice(page);
        } else {
            content.fill(0xFF);
        }

        Ok(())
    }
}

impl Nand for SimNand {
    type Block<'a> = &'a mut SimBlock;

    fn block(&mut self, index: u32) -> anyhow::Result<Option<Self::Block<'_>>> {
        self.blocks
            .get_mut(index as usize)
            .ok_or(anyhow::anyhow!("block {index} out of range"))
            .map(|x| Some(x).filter(|y| !y.marked_bad))
    }

    fn get_layout(&self) -> NandLayout {
        self.layout
    }
}

impl NandBlock for &mut SimBlock {
    fn page_count(&self) -> u32 {
        self.page_count
    }
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn read(&self, start_page: u32, content: &mut [u8]) -> anyhow::Result<()> {
        let mut page = start_page;
        for chunk in content.chunks_mut(self.page_size()) {
            self.read_page(page, chunk)?;
            page += 1;
        }
        Ok(())
    }

    fn program(&mut self, start_page: u32, content: &[u8]) -> anyhow::Result<()> {
        let mut page = start_page;
        for chunk in content.chunks(self.page_size()) {
            self.write_page(page, chunk)?;
            page += 1;
        }
        Ok(())
    }

    fn erase(&mut self) -> anyhow::Result<()> {
        ensure!(self.fault != Some(SimFault::Erase), "erase failure");
        self.data.clear();
        self.erase_count += 1;

        Ok(())
    }

    fn mark_bad(self) -> anyhow::Result<()> {
        self.data.clear();
        self.marked_bad = true;
        Ok(())
    }
}

#[cfg(test)]
pub(crate) const TEST_LAYOUT: NandLayout = NandLayout {
    blocks: 8,
    pages_per_block: 16,
    bytes_per_page: 256,
};

#[test]
fn test_sim_block() {
    let mut nand = SimNand::new(TEST_LAYOUT);
    assert!(nand.block(0).unwrap().is_some());
    assert!(nand.block(TEST_LAYOUT.blocks - 1).unwrap().is_some());
    assert!(nand.block(TEST_LAYOUT.blocks).is_err());
}

#[test]
fn test_sim_mark_bad() {
    let mut nand = SimNand::new(TEST_LAYOUT);
    assert!(nand.block(0).unwrap().is_some());
    nand.block(0).unwrap().unwrap().mark_bad().unwrap();
    assert!(nand.block(0).unwrap().is_none());
}

#[test]
fn test_sim_erase_before_write() {
    let mut nand = SimNand::new(TEST_LAYOUT);

    let data_in = vec![0xA5u8; nand.get_layout().bytes_per_page];
    let mut data_out = data_in.clone();

    let mut block = nand.block(0).unwrap().unwrap();
    block.program(2, &data_in).unwrap();
    assert!(block.program(1, &data_in).is_err());
    assert!(block.program(2, &data_in).is_err());

    block.read(1, &mut data_out).unwrap();
    assert!(data_out.is_erased());

    block.read(2, &mut data_out).unwrap();
    assert_eq!(data_out, data_in);

    block.erase().unwrap();
    block.program(1, &data_in).unwrap();
    block.read(2, &mut data_out).unwrap();
    assert!(data_out.is_erased());

    assert_eq!(nand.erase_counts().get(&0), Some(&1));
}

#[test]
fn test_sim_faults() {
    let mut nand = SimNand::new(TEST_LAYOUT);
    let page = vec![0u8; TEST_LAYOUT.bytes_per_page];

    nand.inject_fault(1, SimFault::Program).unwrap();
    nand.inject_fault(2, SimFault::Erase).unwrap();
    assert!(nand.inject_fault(TEST_LAYOUT.blocks, SimFault::Erase).is_err());

    let mut block = nand.block(1).unwrap().unwrap();
    assert!(block.program(0, &page).is_err());
    assert!(block.erase().is_ok());

    let mut block = nand.block(2).unwrap().unwrap();
    assert!(block.program(0, &page).is_ok());
    assert!(block.erase().is_err());
}

#[test]
fn test_sim_save_load() {
    let mut nand = SimNand::new(TEST_LAYOUT);
    let page = vec![0x55u8; TEST_LAYOUT.bytes_per_page];

    nand.block(0).unwrap().unwrap().program(3, &page).unwrap();
    nand.block(5).unwrap().unwrap().mark_bad().unwrap();

    let mut image = Vec::new();
    nand.save(&mut image).unwrap();
    assert_eq!(
        image.len(),
        TEST_LAYOUT.block_size() * TEST_LAYOUT.blocks as usize
    );

    let mut restored = SimNand::new(TEST_LAYOUT);
    restored.load(&mut &image[..]).unwrap();
    assert!(restored.block(5).unwrap().is_none());

    let mut buf = vec![0u8; TEST_LAYOUT.bytes_per_page];
    let block = restored.block(0).unwrap().unwrap();
    block.read(3, &mut buf).unwrap();
    assert_eq!(buf, page);
    block.read(2, &mut buf).unwrap();
    assert!(buf.is_erased());
}

#[test]
fn test_layout_parse() {
    let layout: NandLayout = "64x32x512".parse().unwrap();
    assert_eq!(layout.blocks, 64);
    assert_eq!(layout.block_size(), 32 * 512);
    assert!("64x32".parse::<NandLayout>().is_err());
    assert!("0x32x512".parse::<NandLayout>().is_err());
}
