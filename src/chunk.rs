//! The chunk/block storage contract that the object graph is persisted through.
//!
//! A chunk is one NAND page. YAFFS needs a few words of metadata ("tags") with every chunk so
//! that a scan can tell which object and which position within it the chunk belongs to. This
//! implementation keeps the tags in-band, packed into the tail of the page, so that any [Nand]
//! works without out-of-band access:
//!
//! ```text
//! +---------------------------- page ---------------------------+
//! | payload (n_bytes) | 0xFF padding ... | packed tags (SIZE)   |
//! +-------------------------------------------------------------+
//! ```

use crate::nand::{Nand, NandBlock, NandLayout, PageUtil};

use anyhow::{bail, ensure};
use crc::{Crc, CRC_32_ISCSI};
use deku::prelude::*;

use std::io::Write;

pub const TAGS_CRC: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// How the tags are laid out in the page; see [Tags] for the ergonomic form
#[derive(Debug, Default, PartialEq, Eq, DekuRead, DekuWrite)]
#[deku(magic = b"YTG2", endian = "little")]
struct PackedTags {
    seq_number: u32,
    obj_id: u32,
    chunk_id: u32,
    n_bytes: u32,
    crc: u32,
}

/// The per-chunk metadata written alongside every chunk's payload
#[derive(Debug, Default, Eq, PartialEq, Copy, Clone)]
pub struct Tags {
    /// Sequence number of the write "generation" this chunk belongs to
    pub seq_number: u32,

    /// The object the chunk belongs to
    pub obj_id: u32,

    /// The position of the chunk within its object
    pub chunk_id: u32,

    /// How many payload bytes are valid
    pub n_bytes: u32,
}

impl Tags {
    /// Size of the packed form, in bytes
    pub const SIZE: usize = 24;

    fn crc(&self, payload: &[u8]) -> u32 {
        let mut digest = TAGS_CRC.digest();
        digest.update(&self.seq_number.to_le_bytes());
        digest.update(&self.obj_id.to_le_bytes());
        digest.update(&self.chunk_id.to_le_bytes());
        digest.update(&self.n_bytes.to_le_bytes());
        digest.update(payload);
        digest.finalize()
    }

    /// Write the packed tags into a byte slice, with a CRC covering `payload`
    pub fn encode(self, payload: &[u8], out_bytes: &mut [u8]) -> anyhow::Result<()> {
        let packed = PackedTags {
            seq_number: self.seq_number,
            obj_id: self.obj_id,
            chunk_id: self.chunk_id,
            n_bytes: self.n_bytes,
            crc: self.crc(payload),
        };
        let bytes = packed.to_bytes()?;
        let out_bytes = out_bytes
            .get_mut(..bytes.len())
            .ok_or(anyhow::anyhow!("out_bytes too small"))?;
        out_bytes.copy_from_slice(&bytes);
        Ok(())
    }

    /// Parse packed tags, verifying magic and the CRC over `page_payload`'s first `n_bytes`
    pub fn decode(bytes: &[u8], page_payload: &[u8]) -> Option<Self> {
        let (_, packed) = PackedTags::from_bytes((bytes, 0)).ok()?;
        let tags = Self {
            seq_number: packed.seq_number,
            obj_id: packed.obj_id,
            chunk_id: packed.chunk_id,
            n_bytes: packed.n_bytes,
        };

        let payload = page_payload.get(..tags.n_bytes as usize)?;
        (tags.crc(payload) == packed.crc).then_some(tags)
    }
}

/// The shape of a chunk device, as seen by the layers above
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Geometry {
    pub blocks: u32,
    pub chunks_per_block: u32,

    /// Payload bytes per chunk (the page size minus the tags)
    pub data_bytes_per_chunk: usize,
}

impl Geometry {
    /// Payload bytes in one whole block
    pub fn data_bytes_per_block(&self) -> u64 {
        u64::from(self.chunks_per_block) * self.data_bytes_per_chunk as u64
    }

    /// The chunk number of the first chunk in `block`
    pub fn first_chunk(&self, block: u32) -> u32 {
        block * self.chunks_per_block
    }
}

/// What [ChunkDevice::query_block] finds in a block
#[derive(Debug, Eq, PartialEq, Copy, Clone)]
pub enum BlockState {
    /// The block is marked bad, and cannot be accessed
    Bad,

    /// Every page in the block is erased
    Erased,

    /// At least one page has been programmed
    InUse,
}

/// Chunk-addressed flash with erase-before-write and bad-block semantics
pub trait ChunkDevice {
    fn geometry(&self) -> Geometry;

    /// Program a chunk. `data` must fit in [Geometry::data_bytes_per_chunk]; `tags.n_bytes` is
    /// overwritten with its length.
    fn write_chunk(&mut self, chunk: u32, data: &[u8], tags: Tags) -> anyhow::Result<()>;

    /// Read a chunk's payload into `data` (which must hold a whole chunk's payload).
    ///
    /// Returns the chunk's tags, or None if the chunk is erased or its tags do not verify.
    fn read_chunk(&mut self, chunk: u32, data: &mut [u8]) -> anyhow::Result<Option<Tags>>;

    fn erase_block(&mut self, block: u32) -> anyhow::Result<()>;

    fn query_block(&mut self, block: u32) -> anyhow::Result<BlockState>;

    fn mark_block_bad(&mut self, block: u32) -> anyhow::Result<()>;

    /// Copy the raw device contents out, e.g. to save a simulated device as an image file
    fn dump(&mut self, out: &mut dyn Write) -> anyhow::Result<()>;
}

/// Adapts a raw [Nand] to [ChunkDevice] by packing tags into every page
#[derive(Debug)]
pub struct TaggedNand<N: Nand> {
    nand: N,
    layout: NandLayout,
}

impl<N: Nand> TaggedNand<N> {
    pub fn new(nand: N) -> anyhow::Result<Self> {
        let layout = nand.get_layout();
        ensure!(
            layout.bytes_per_page > Tags::SIZE,
            "page size {} leaves no room for chunk data",
            layout.bytes_per_page
        );
        Ok(Self { nand, layout })
    }

    pub fn into_inner(self) -> N {
        self.nand
    }

    /// Split a chunk number into block and page
    fn locate(&self, chunk: u32) -> anyhow::Result<(u32, u32)> {
        ensure!(
            chunk < self.layout.page_count(),
            "chunk {chunk} out of range"
        );
        Ok((
            chunk / self.layout.pages_per_block,
            chunk % self.layout.pages_per_block,
        ))
    }

    fn data_bytes(&self) -> usize {
        self.layout.bytes_per_page - Tags::SIZE
    }
}

impl<N: Nand> ChunkDevice for TaggedNand<N> {
    fn geometry(&self) -> Geometry {
        Geometry {
            blocks: self.layout.blocks,
            chunks_per_block: self.layout.pages_per_block,
            data_bytes_per_chunk: self.data_bytes(),
        }
    }

    fn write_chunk(&mut self, chunk: u32, data: &[u8], mut tags: Tags) -> anyhow::Result<()> {
        let (block, page) = self.locate(chunk)?;
        let data_bytes = self.data_bytes();
        ensure!(
            data.len() <= data_bytes,
            "{} bytes do not fit in a {data_bytes}-byte chunk",
            data.len()
        );

        tags.n_bytes = data.len() as u32;
        let mut page_buf = vec![0xFFu8; self.layout.bytes_per_page];
        page_buf[..data.len()].copy_from_slice(data);
        tags.encode(data, &mut page_buf[data_bytes..])?;

        let Some(mut block) = self.nand.block(block)? else {
            bail!("block {block} is marked bad");
        };
        block.program(page, &page_buf)
    }

    fn read_chunk(&mut self, chunk: u32, data: &mut [u8]) -> anyhow::Result<Option<Tags>> {
        let (block, page) = self.locate(chunk)?;
        let data_bytes = self.data_bytes();
        ensure!(data.len() >= data_bytes, "buffer smaller than a chunk");

        let Some(block) = self.nand.block(block)? else {
            bail!("block {block} is marked bad");
        };
        let mut page_buf = vec![0u8; self.layout.bytes_per_page];
        block.read(page, &mut page_buf)?;

        if page_buf.is_erased() {
            return Ok(None);
        }

        let (payload, tag_bytes) = page_buf.split_at(data_bytes);
        data[..data_bytes].copy_from_slice(payload);
        Ok(Tags::decode(tag_bytes, payload))
    }

    fn erase_block(&mut self, block: u32) -> anyhow::Result<()> {
        let Some(mut nand_block) = self.nand.block(block)? else {
            bail!("block {block} is marked bad");
        };
        nand_block.erase()
    }

    fn query_block(&mut self, block: u32) -> anyhow::Result<BlockState> {
        // How many pages do we read at a time? A higher number helps in high-latency situations.
        const PAGE_CHUNKS: u32 = 4;

        let Some(block) = self.nand.block(block)? else {
            return Ok(BlockState::Bad);
        };

        let mut buf = vec![0; block.page_size() * PAGE_CHUNKS as usize];
        for start_page in (0..block.page_count()).step_by(PAGE_CHUNKS as usize) {
            let end_page = std::cmp::min(block.page_count(), start_page + PAGE_CHUNKS);
            let buf = &mut buf[..block.page_size() * (end_page - start_page) as usize];
            block.read(start_page, buf)?;

            if !buf.is_erased() {
                return Ok(BlockState::InUse);
            }
        }

        Ok(BlockState::Erased)
    }

    fn mark_block_bad(&mut self, block: u32) -> anyhow::Result<()> {
        match self.nand.block(block)? {
            Some(nand_block) => nand_block.mark_bad(),
            None => Ok(()),
        }
    }

    fn dump(&mut self, out: &mut dyn Write) -> anyhow::Result<()> {
        crate::nand::dump(&mut self.nand, out)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::nand::{SimNand, TEST_LAYOUT};

    fn device() -> TaggedNand<SimNand> {
        TaggedNand::new(SimNand::new(TEST_LAYOUT)).unwrap()
    }

    #[test]
    fn test_tags_round_trip() -> anyhow::Result<()> {
        let mut dev = device();
        let geometry = dev.geometry();
        assert_eq!(
            geometry.data_bytes_per_chunk,
            TEST_LAYOUT.bytes_per_page - Tags::SIZE
        );

        let tags = Tags {
            seq_number: 7,
            obj_id: 42,
            chunk_id: 3,
            n_bytes: 0,
        };
        dev.write_chunk(5, b"hello chunk", tags)?;

        let mut data = vec![0u8; geometry.data_bytes_per_chunk];
        let read_back = dev.read_chunk(5, &mut data)?.expect("tags should verify");
        assert_eq!(read_back.obj_id, 42);
        assert_eq!(read_back.chunk_id, 3);
        assert_eq!(read_back.n_bytes, 11);
        assert_eq!(&data[..11], b"hello chunk");

        // Untouched chunks have no tags
        assert_eq!(dev.read_chunk(6, &mut data)?, None);
        Ok(())
    }

    #[test]
    fn test_corrupt_tags_rejected() {
        let page = vec![0x11u8; TEST_LAYOUT.bytes_per_page];
        let (payload, tag_bytes) = page.split_at(TEST_LAYOUT.bytes_per_page - Tags::SIZE);
        assert_eq!(Tags::decode(tag_bytes, payload), None);

        let mut page = vec![0xFFu8; TEST_LAYOUT.bytes_per_page];
        let split = TEST_LAYOUT.bytes_per_page - Tags::SIZE;
        page[..4].copy_from_slice(b"data");
        let tags = Tags {
            n_bytes: 4,
            ..Default::default()
        };
        tags.encode(b"data", &mut page[split..]).unwrap();
        assert_eq!(Tags::decode(&page[split..], &page[..split]), Some(tags));

        // Flip a payload bit: CRC must catch it
        page[0] ^= 1;
        assert_eq!(Tags::decode(&page[split..], &page[..split]), None);
    }

    #[test]
    fn test_erase_before_write() -> anyhow::Result<()> {
        let mut dev = device();
        dev.write_chunk(0, b"a", Tags::default())?;
        assert!(dev.write_chunk(0, b"b", Tags::default()).is_err());

        dev.erase_block(0)?;
        dev.write_chunk(0, b"b", Tags::default())?;
        Ok(())
    }

    #[test]
    fn test_query_block() -> anyhow::Result<()> {
        let mut dev = device();
        let last_chunk = dev.geometry().first_chunk(2) - 1;

        assert_eq!(dev.query_block(1)?, BlockState::Erased);
        dev.write_chunk(last_chunk, b"x", Tags::default())?;
        assert_eq!(dev.query_block(1)?, BlockState::InUse);

        dev.mark_block_bad(1)?;
        assert_eq!(dev.query_block(1)?, BlockState::Bad);
        assert!(dev.erase_block(1).is_err());
        Ok(())
    }

    #[test]
    fn test_oversized_write_rejected() {
        let mut dev = device();
        let too_big = vec![0u8; dev.geometry().data_bytes_per_chunk + 1];
        assert!(dev.write_chunk(0, &too_big, Tags::default()).is_err());
        assert!(dev
            .write_chunk(TEST_LAYOUT.page_count(), b"x", Tags::default())
            .is_err());
    }
}
