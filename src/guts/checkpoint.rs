//! Persisting an [ObjectGraph] to flash, and finding it again at mount time.
//!
//! The whole graph is serialized into one stream, led by a [CheckpointHeader], and spread over
//! as many blocks as it needs. Every chunk of the stream is tagged with [CHECKPOINT_OBJ_ID], the
//! checkpoint's sequence number, and its position in the stream. A new checkpoint is always
//! written to blocks the previous one does not occupy, and the previous one is only erased once
//! the new one is complete, so losing power part-way leaves the old checkpoint intact.
//!
//! Stream payload layout (all integers little-endian):
//!
//! ```text
//! next_obj_id u32 | object count u32 | object records, parents before children
//!
//! record: obj_id u32 | parent obj_id u32 (0 for root) | kind u8 | perms u32
//!         | atime u32 | mtime u32 | ctime u32 | name_len u16 | name
//!         | file: data_len u64 | data
//!         | symlink: alias_len u16 | alias
//!         | hard link: equivalent obj_id u32
//! ```

use super::{Object, ObjectGraph, ObjectId, ObjectType, Permissions, Times, Variant, ROOT_OBJ_ID};
use crate::chunk::{BlockState, ChunkDevice, Geometry, Tags};

use anyhow::{anyhow, bail, ensure};
use bytes::{Buf, BufMut, BytesMut};
use crc::{Crc, CRC_32_ISCSI};
use deku::prelude::*;
use tracing::{debug, warn};

use std::collections::{BTreeMap, HashMap};

const CHECKPOINT_CRC: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);
const CHECKPOINT_VERSION: u32 = 1;

/// The tag `obj_id` that marks a chunk as part of a checkpoint
pub const CHECKPOINT_OBJ_ID: u32 = 0x7FFF_FF00;

#[derive(Debug, PartialEq, Eq, DekuRead, DekuWrite)]
#[deku(magic = b"YCKP", endian = "little")]
struct CheckpointHeader {
    version: u32,
    payload_len: u64,
    payload_crc: u32,
}

impl CheckpointHeader {
    /// Size of the encoded header, magic included
    const SIZE: u64 = 20;
}

/// Bytes per record before any variable-length fields
const RECORD_FIXED_LEN: u64 = 4 + 4 + 1 + 4 + 12 + 2;

const KIND_FILE: u8 = 0;
const KIND_DIRECTORY: u8 = 1;
const KIND_SYMLINK: u8 = 2;
const KIND_HARD_LINK: u8 = 3;

/// Where the current checkpoint lives
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CheckpointState {
    /// The highest sequence number seen on the device; the next checkpoint uses one more
    pub seq_number: u32,

    /// The blocks holding the current checkpoint, in stream order
    pub blocks: Vec<u32>,
}

/// How many bytes one object contributes to the stream
pub(super) fn record_len(object: &Object) -> u64 {
    let extra = match &object.variant {
        Variant::File { data, .. } => 8 + data.len() as u64,
        Variant::Directory { .. } => 0,
        Variant::SymLink { alias } => 2 + alias.len() as u64,
        Variant::HardLink { .. } => 4,
    };
    RECORD_FIXED_LEN + object.name.len() as u64 + extra
}

/// How long the stream for `graph` would be, header included
pub fn encoded_len(graph: &ObjectGraph) -> u64 {
    graph
        .walk()
        .into_iter()
        .filter_map(|id| graph.get(id))
        .map(record_len)
        .sum::<u64>()
        + CheckpointHeader::SIZE
        + 8
}

/// How much the graph on a device may store: half the good blocks, leaving room to write the next
/// checkpoint beside the current one
pub fn capacity(geometry: Geometry, good_blocks: u32) -> u64 {
    u64::from(good_blocks / 2) * geometry.data_bytes_per_block()
}

/// Serialize the graph into a checkpoint stream
pub fn encode(graph: &ObjectGraph) -> anyhow::Result<Vec<u8>> {
    let order = graph.walk();
    let mut payload = BytesMut::new();
    payload.put_u32_le(graph.next_obj_id);
    payload.put_u32_le(u32::try_from(order.len())?);

    let obj_id_of = |id: ObjectId| {
        graph
            .get(id)
            .map(|obj| obj.obj_id)
            .ok_or(anyhow!("dangling object reference"))
    };

    for id in order {
        let obj = graph.get(id).ok_or(anyhow!("dangling object reference"))?;
        let parent_obj_id = match obj.parent {
            Some(parent) => obj_id_of(parent)?,
            None => 0,
        };

        payload.put_u32_le(obj.obj_id);
        payload.put_u32_le(parent_obj_id);
        payload.put_u8(match obj.object_type() {
            ObjectType::File => KIND_FILE,
            ObjectType::Directory => KIND_DIRECTORY,
            ObjectType::SymLink => KIND_SYMLINK,
            ObjectType::HardLink => KIND_HARD_LINK,
        });
        payload.put_u32_le(obj.perms.bits());
        payload.put_u32_le(obj.times.atime);
        payload.put_u32_le(obj.times.mtime);
        payload.put_u32_le(obj.times.ctime);
        payload.put_u16_le(u16::try_from(obj.name.len())?);
        payload.put_slice(obj.name.as_bytes());

        match &obj.variant {
            Variant::File { data, .. } => {
                payload.put_u64_le(data.len() as u64);
                payload.put_slice(data);
            }
            Variant::Directory { .. } => {}
            Variant::SymLink { alias } => {
                payload.put_u16_le(u16::try_from(alias.len())?);
                payload.put_slice(alias.as_bytes());
            }
            Variant::HardLink { equivalent } => {
                payload.put_u32_le(obj_id_of(*equivalent)?);
            }
        }
    }

    let header = CheckpointHeader {
        version: CHECKPOINT_VERSION,
        payload_len: payload.len() as u64,
        payload_crc: CHECKPOINT_CRC.checksum(&payload),
    };
    let mut stream = header.to_bytes()?;
    stream.extend_from_slice(&payload);
    Ok(stream)
}

/// Check the header and CRC of a stream, returning the payload
fn verify(stream: &[u8]) -> Option<&[u8]> {
    let ((rest, _), header) = CheckpointHeader::from_bytes((stream, 0)).ok()?;
    if header.version != CHECKPOINT_VERSION {
        return None;
    }
    let payload = rest.get(..usize::try_from(header.payload_len).ok()?)?;
    (CHECKPOINT_CRC.checksum(payload) == header.payload_crc).then_some(payload)
}

fn take_u8(buf: &mut &[u8]) -> anyhow::Result<u8> {
    ensure!(buf.remaining() >= 1, "checkpoint truncated");
    Ok(buf.get_u8())
}

fn take_u16(buf: &mut &[u8]) -> anyhow::Result<u16> {
    ensure!(buf.remaining() >= 2, "checkpoint truncated");
    Ok(buf.get_u16_le())
}

fn take_u32(buf: &mut &[u8]) -> anyhow::Result<u32> {
    ensure!(buf.remaining() >= 4, "checkpoint truncated");
    Ok(buf.get_u32_le())
}

fn take_u64(buf: &mut &[u8]) -> anyhow::Result<u64> {
    ensure!(buf.remaining() >= 8, "checkpoint truncated");
    Ok(buf.get_u64_le())
}

fn take_bytes<'a>(buf: &mut &'a [u8], len: usize) -> anyhow::Result<&'a [u8]> {
    ensure!(buf.remaining() >= len, "checkpoint truncated");
    let whole: &'a [u8] = *buf;
    let (bytes, rest) = whole.split_at(len);
    *buf = rest;
    Ok(bytes)
}

fn take_string(buf: &mut &[u8], len: usize) -> anyhow::Result<String> {
    Ok(String::from_utf8(take_bytes(buf, len)?.to_vec())?)
}

struct Record {
    parent_obj_id: u32,
    object: Object,

    /// For hard links, the obj_id of the file they refer to
    link_target: Option<u32>,
}

/// Never resolves; stands in for a hard link's target until every record is loaded
const UNRESOLVED: ObjectId = ObjectId {
    index: u32::MAX,
    generation: u32::MAX,
};

fn read_record(buf: &mut &[u8]) -> anyhow::Result<Record> {
    let obj_id = take_u32(buf)?;
    let parent_obj_id = take_u32(buf)?;
    let kind = take_u8(buf)?;
    let perms = Permissions::from_bits_truncate(take_u32(buf)?);
    let times = Times {
        atime: take_u32(buf)?,
        mtime: take_u32(buf)?,
        ctime: take_u32(buf)?,
    };
    let name_len = take_u16(buf)?;
    let name = take_string(buf, name_len.into())?;

    let mut link_target = None;
    let variant = match kind {
        KIND_FILE => {
            let len = usize::try_from(take_u64(buf)?)?;
            let bytes = take_bytes(buf, len)?;
            let mut data = Vec::new();
            data.try_reserve_exact(bytes.len())?;
            data.extend_from_slice(bytes);
            Variant::File {
                data,
                hard_links: Vec::new(),
            }
        }
        KIND_DIRECTORY => Variant::Directory {
            children: Vec::new(),
        },
        KIND_SYMLINK => {
            let alias_len = take_u16(buf)?;
            Variant::SymLink {
                alias: take_string(buf, alias_len.into())?,
            }
        }
        KIND_HARD_LINK => {
            link_target = Some(take_u32(buf)?);
            Variant::HardLink {
                equivalent: UNRESOLVED,
            }
        }
        _ => bail!("object {obj_id} has unknown kind {kind}"),
    };

    Ok(Record {
        parent_obj_id,
        object: Object {
            obj_id,
            name,
            parent: None,
            perms,
            times,
            variant,
            open_count: 0,
            unlinked: false,
        },
        link_target,
    })
}

/// Rebuild a graph from a checkpoint stream
pub fn decode(stream: &[u8], capacity: u64) -> anyhow::Result<ObjectGraph> {
    let mut buf = verify(stream).ok_or(anyhow!("checkpoint header or CRC invalid"))?;

    let next_obj_id = take_u32(&mut buf)?;
    let count = take_u32(&mut buf)?;
    ensure!(count > 0, "checkpoint has no root directory");

    let root = read_record(&mut buf)?;
    ensure!(
        root.object.obj_id == ROOT_OBJ_ID && root.parent_obj_id == 0 && root.object.is_dir(),
        "checkpoint does not start with the root directory"
    );
    let mut graph = ObjectGraph::from_root(root.object, capacity, next_obj_id);

    let mut by_obj_id = HashMap::from([(ROOT_OBJ_ID, graph.root())]);
    let mut links = Vec::new();
    for _ in 1..count {
        let record = read_record(&mut buf)?;
        let obj_id = record.object.obj_id;
        ensure!(
            obj_id < next_obj_id && !by_obj_id.contains_key(&obj_id),
            "checkpoint has bad object id {obj_id}"
        );

        let parent = *by_obj_id
            .get(&record.parent_obj_id)
            .ok_or(anyhow!("object {obj_id} precedes its parent"))?;
        let id = graph.attach_loaded(parent, record.object)?;
        by_obj_id.insert(obj_id, id);
        if let Some(target) = record.link_target {
            links.push((id, target));
        }
    }
    ensure!(!buf.has_remaining(), "checkpoint has trailing bytes");

    for (link, target) in links {
        let equivalent = *by_obj_id
            .get(&target)
            .ok_or(anyhow!("hard link to missing object {target}"))?;
        graph.link_loaded(link, equivalent)?;
    }

    Ok(graph)
}

/// Everything a mount needs to know about a device's contents
#[derive(Debug)]
pub struct Scan {
    pub good_blocks: u32,
    pub state: CheckpointState,

    /// Streams that verified, newest first, with the blocks each occupies
    candidates: Vec<(u32, Vec<u32>, Vec<u8>)>,
}

/// Read the first chunk of every block, collecting checkpoint chunks by sequence number
pub fn scan(dev: &mut dyn ChunkDevice) -> anyhow::Result<Scan> {
    let geometry = dev.geometry();
    let rpt = howudoin::new()
        .label("Scanning for checkpoint")
        .set_len(u64::from(geometry.blocks));

    let mut good_blocks = 0;
    let mut found: BTreeMap<u32, Vec<(u32, u32, Vec<u8>)>> = BTreeMap::new();
    let mut buf = vec![0u8; geometry.data_bytes_per_chunk];

    for block in 0..geometry.blocks {
        rpt.inc();
        match dev.query_block(block)? {
            BlockState::Bad => continue,
            BlockState::Erased => {
                good_blocks += 1;
                continue;
            }
            BlockState::InUse => good_blocks += 1,
        }

        let first_chunk = geometry.first_chunk(block);
        match dev.read_chunk(first_chunk, &mut buf) {
            Ok(Some(tags)) if tags.obj_id == CHECKPOINT_OBJ_ID => {}
            Ok(_) => continue,
            Err(e) => {
                warn!("block {block} unreadable while scanning: {e:#}");
                continue;
            }
        }

        for page in 0..geometry.chunks_per_block {
            match dev.read_chunk(first_chunk + page, &mut buf) {
                Ok(Some(tags)) if tags.obj_id == CHECKPOINT_OBJ_ID => {
                    found.entry(tags.seq_number).or_default().push((
                        tags.chunk_id,
                        block,
                        buf[..tags.n_bytes as usize].to_vec(),
                    ));
                }
                Ok(_) => break,
                Err(e) => {
                    warn!("block {block} page {page} unreadable while scanning: {e:#}");
                    break;
                }
            }
        }
    }
    rpt.close();

    let seq_number = found.keys().next_back().copied().unwrap_or(0);
    let mut candidates = Vec::new();
    for (seq, mut pieces) in found.into_iter().rev() {
        // The header's payload length bounds the stream, so anything past the first gap is stale
        pieces.sort_by_key(|&(chunk_id, _, _)| chunk_id);
        let contiguous = pieces
            .iter()
            .enumerate()
            .take_while(|&(i, &(chunk_id, _, _))| chunk_id as usize == i)
            .count();
        pieces.truncate(contiguous);

        let mut blocks: Vec<u32> = pieces.iter().map(|&(_, block, _)| block).collect();
        blocks.dedup();
        let stream: Vec<u8> = pieces.into_iter().flat_map(|(_, _, data)| data).collect();

        if verify(&stream).is_some() {
            candidates.push((seq, blocks, stream));
        } else {
            warn!("discarding incomplete checkpoint {seq}");
        }
    }

    Ok(Scan {
        good_blocks,
        state: CheckpointState {
            seq_number,
            blocks: Vec::new(),
        },
        candidates,
    })
}

/// Load the newest checkpoint that decodes, or None if the device holds none
pub fn load(
    dev: &mut dyn ChunkDevice,
) -> anyhow::Result<(u32, CheckpointState, Option<ObjectGraph>)> {
    let geometry = dev.geometry();
    let Scan {
        good_blocks,
        mut state,
        candidates,
    } = scan(dev)?;
    let capacity = capacity(geometry, good_blocks);

    for (seq, blocks, stream) in candidates {
        match decode(&stream, capacity) {
            Ok(graph) => {
                debug!(
                    "loaded checkpoint {seq} from blocks {blocks:?}, {} bytes",
                    stream.len()
                );
                state.blocks = blocks;
                return Ok((good_blocks, state, Some(graph)));
            }
            Err(e) if e.is::<std::collections::TryReserveError>() => return Err(e),
            Err(e) => warn!("checkpoint {seq} does not decode: {e:#}"),
        }
    }

    Ok((good_blocks, state, None))
}

/// Program one block's share of the stream
fn program_block(
    dev: &mut dyn ChunkDevice,
    block: u32,
    pieces: &[&[u8]],
    first_chunk_id: usize,
    seq_number: u32,
) -> anyhow::Result<()> {
    let first_chunk = dev.geometry().first_chunk(block);
    for (i, piece) in pieces.iter().enumerate() {
        let tags = Tags {
            seq_number,
            obj_id: CHECKPOINT_OBJ_ID,
            chunk_id: u32::try_from(first_chunk_id + i)?,
            n_bytes: 0,
        };
        dev.write_chunk(first_chunk + i as u32, piece, tags)?;
    }
    Ok(())
}

/// Write `graph` out as a new checkpoint, then retire the previous one
pub fn store(
    dev: &mut dyn ChunkDevice,
    state: &mut CheckpointState,
    graph: &mut ObjectGraph,
) -> anyhow::Result<()> {
    let stream = encode(graph)?;
    let seq_number = state
        .seq_number
        .checked_add(1)
        .ok_or(anyhow!("checkpoint sequence numbers exhausted"))?;
    // Chunks left behind by a store that fails part-way never share a sequence number with a
    // later checkpoint
    state.seq_number = seq_number;

    let mut written = Vec::new();
    if let Err(e) = write_stream(dev, &state.blocks, &stream, seq_number, &mut written) {
        for block in written {
            if let Err(e) = dev.erase_block(block) {
                warn!("erasing partial checkpoint block {block} failed, marking bad: {e:#}");
                dev.mark_block_bad(block)?;
            }
        }
        return Err(e);
    }

    for block in std::mem::replace(&mut state.blocks, written) {
        if let Err(e) = dev.erase_block(block) {
            warn!("erasing old checkpoint block {block} failed, marking bad: {e:#}");
            dev.mark_block_bad(block)?;
        }
    }

    debug!(
        "wrote checkpoint {seq_number} to blocks {:?}, {} bytes",
        state.blocks,
        stream.len()
    );
    graph.mark_clean();
    Ok(())
}

/// Spread `stream` over blocks outside `in_use`, pushing each block onto `written` as it fills
fn write_stream(
    dev: &mut dyn ChunkDevice,
    in_use: &[u32],
    stream: &[u8],
    seq_number: u32,
    written: &mut Vec<u32>,
) -> anyhow::Result<()> {
    let geometry = dev.geometry();
    let pieces: Vec<&[u8]> = stream.chunks(geometry.data_bytes_per_chunk).collect();
    let per_block = geometry.chunks_per_block as usize;
    let mut candidates = (0..geometry.blocks).filter(|block| !in_use.contains(block));

    let rpt = howudoin::new()
        .label("Writing checkpoint")
        .set_len(u64::try_from(pieces.len().div_ceil(per_block)).ok());

    for (index, group) in pieces.chunks(per_block).enumerate() {
        // Keep picking blocks until this part of the stream lands somewhere
        'write_loop: loop {
            let block = candidates
                .next()
                .ok_or(anyhow!("Flash is full; no blocks left for the checkpoint"))?;

            match dev.query_block(block)? {
                BlockState::Bad => continue,
                BlockState::Erased => {}
                BlockState::InUse => {
                    if let Err(e) = dev.erase_block(block) {
                        warn!("erasing block {block} failed, marking bad: {e:#}");
                        dev.mark_block_bad(block)?;
                        continue;
                    }
                }
            }

            // Try to write the block; if that fails, erase it and try again; if that still fails,
            // mark the block bad.
            let mut tried_erase = false;
            loop {
                match program_block(dev, block, group, index * per_block, seq_number) {
                    Ok(()) => {
                        written.push(block);
                        break 'write_loop;
                    }
                    Err(e) if tried_erase => {
                        warn!("block {block} will not program, marking bad: {e:#}");
                        dev.mark_block_bad(block)?;
                        break;
                    }
                    Err(_) => {
                        if let Err(e) = dev.erase_block(block) {
                            warn!("erasing block {block} failed, marking bad: {e:#}");
                            dev.mark_block_bad(block)?;
                            break;
                        }
                        tried_erase = true;
                    }
                }
            }
        }
        rpt.inc();
    }
    rpt.close();

    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::chunk::TaggedNand;
    use crate::guts::NewObject;
    use crate::nand::{SimFault, SimNand, TEST_LAYOUT};

    fn sample_graph(capacity: u64) -> ObjectGraph {
        let rw = Permissions::S_IREAD | Permissions::S_IWRITE;
        let mut graph = ObjectGraph::new(capacity);
        let root = graph.root();
        let dir = graph.mknod(root, "dir", rw, NewObject::Directory).unwrap();
        let file = graph.mknod(dir, "file", rw, NewObject::File).unwrap();
        graph.write_data(file, 0, &[0x5A; 700]).unwrap();
        graph
            .mknod(root, "link", rw, NewObject::SymLink("dir/file".into()))
            .unwrap();
        graph
            .mknod(root, "hard", rw, NewObject::HardLink(file))
            .unwrap();
        graph
    }

    fn assert_same_shape(a: &ObjectGraph, b: &ObjectGraph) {
        let describe = |graph: &ObjectGraph| {
            graph
                .walk()
                .into_iter()
                .map(|id| {
                    let obj = graph.get(id).unwrap();
                    (
                        obj.obj_id,
                        obj.name.clone(),
                        obj.object_type(),
                        graph.file_length(id).unwrap(),
                        graph.link_count(id),
                    )
                })
                .collect::<Vec<_>>()
        };
        assert_eq!(describe(a), describe(b));
    }

    #[test]
    fn test_encode_decode() -> anyhow::Result<()> {
        let graph = sample_graph(1 << 20);
        let stream = encode(&graph)?;
        assert_eq!(stream.len() as u64, encoded_len(&graph));

        let decoded = decode(&stream, 1 << 20)?;
        assert_same_shape(&graph, &decoded);
        assert_eq!(decoded.next_obj_id(), graph.next_obj_id());

        let hard = decoded.find_by_name(decoded.root(), "hard").unwrap();
        let dir = decoded.find_by_name(decoded.root(), "dir").unwrap();
        let file = decoded.find_by_name(dir, "file").unwrap();
        assert_eq!(decoded.equivalent(hard), file);
        Ok(())
    }

    #[test]
    fn test_corrupt_stream_rejected() -> anyhow::Result<()> {
        let mut stream = encode(&sample_graph(1 << 20))?;
        let last = stream.len() - 1;
        stream[last] ^= 0x01;
        assert!(decode(&stream, 1 << 20).is_err());
        assert!(decode(&stream[..10], 1 << 20).is_err());
        Ok(())
    }

    #[test]
    fn test_store_and_load() -> anyhow::Result<()> {
        let mut dev = TaggedNand::new(SimNand::new(TEST_LAYOUT))?;
        let (good_blocks, mut state, graph) = load(&mut dev)?;
        assert_eq!(good_blocks, TEST_LAYOUT.blocks);
        assert!(graph.is_none());

        let mut graph = sample_graph(capacity(dev.geometry(), good_blocks));
        store(&mut dev, &mut state, &mut graph)?;
        assert!(!graph.is_dirty());
        assert_eq!(state.seq_number, 1);
        let first_blocks = state.blocks.clone();

        // A second checkpoint goes elsewhere and retires the first
        store(&mut dev, &mut state, &mut graph)?;
        assert_eq!(state.seq_number, 2);
        assert!(state.blocks.iter().all(|b| !first_blocks.contains(b)));
        for block in &first_blocks {
            assert_eq!(dev.query_block(*block)?, BlockState::Erased);
        }

        let (_, loaded_state, loaded) = load(&mut dev)?;
        assert_eq!(loaded_state, state);
        assert_same_shape(&graph, &loaded.unwrap());

        // Blank blocks were programmed as-is; only the retired ones saw an erase
        let erase_counts = dev.into_inner().erase_counts();
        let mut erased: Vec<u32> = erase_counts.keys().copied().collect();
        erased.sort();
        assert_eq!(erased, first_blocks);
        assert!(erase_counts.values().all(|&count| count == 1));
        Ok(())
    }

    #[test]
    fn test_store_skips_failing_blocks() -> anyhow::Result<()> {
        let mut nand = SimNand::new(TEST_LAYOUT);
        nand.inject_fault(0, SimFault::Program)?;
        nand.inject_fault(1, SimFault::Erase)?;
        let mut dev = TaggedNand::new(nand)?;

        // Dirty block 1 so that it needs an erase before use
        dev.write_chunk(dev.geometry().first_chunk(1), b"junk", Tags::default())?;

        let mut state = CheckpointState::default();
        let mut graph = sample_graph(1 << 20);
        store(&mut dev, &mut state, &mut graph)?;

        assert_eq!(dev.query_block(0)?, BlockState::Bad);
        assert_eq!(dev.query_block(1)?, BlockState::Bad);
        assert!(!state.blocks.contains(&0) && !state.blocks.contains(&1));

        let (good_blocks, _, loaded) = load(&mut dev)?;
        assert_eq!(good_blocks, TEST_LAYOUT.blocks - 2);
        assert_same_shape(&graph, &loaded.unwrap());
        Ok(())
    }

    #[test]
    fn test_failed_store_does_not_lose_next_checkpoint() -> anyhow::Result<()> {
        let mut nand = SimNand::new(TEST_LAYOUT);
        nand.inject_fault(7, SimFault::Program)?;
        let mut dev = TaggedNand::new(nand)?;

        // Big enough to need four blocks, so a second copy runs into block 7 and out of room
        let mut graph = sample_graph(1 << 20);
        let root = graph.root();
        let rw = Permissions::S_IREAD | Permissions::S_IWRITE;
        let big = graph.mknod(root, "big", rw, NewObject::File)?;
        graph.write_data(big, 0, &[0xA5; 12500])?;

        let mut state = CheckpointState::default();
        store(&mut dev, &mut state, &mut graph)?;
        assert_eq!(state.blocks, vec![0, 1, 2, 3]);

        assert!(store(&mut dev, &mut state, &mut graph).is_err());
        assert_eq!(state.seq_number, 2);
        assert_eq!(state.blocks, vec![0, 1, 2, 3]);
        assert_eq!(dev.query_block(7)?, BlockState::Bad);
        for block in 4..7 {
            assert_eq!(dev.query_block(block)?, BlockState::Erased);
        }

        graph.resize(big, 4000)?;
        store(&mut dev, &mut state, &mut graph)?;
        assert_eq!(state.seq_number, 3);
        assert_eq!(state.blocks, vec![4, 5]);

        let (_, loaded_state, loaded) = load(&mut dev)?;
        assert_eq!(loaded_state, state);
        let loaded = loaded.unwrap();
        assert_same_shape(&graph, &loaded);
        let big = loaded.find_by_name(loaded.root(), "big").unwrap();
        assert_eq!(loaded.file_length(big)?, 4000);
        Ok(())
    }

    #[test]
    fn test_stale_chunks_past_the_stream_are_ignored() -> anyhow::Result<()> {
        let mut dev = TaggedNand::new(SimNand::new(TEST_LAYOUT))?;
        let mut state = CheckpointState::default();
        let mut graph = sample_graph(1 << 20);
        store(&mut dev, &mut state, &mut graph)?;

        // Leftover chunk from a longer stream with the same sequence number
        let spare = (0..TEST_LAYOUT.blocks)
            .find(|b| !state.blocks.contains(b))
            .unwrap();
        let tags = Tags {
            seq_number: state.seq_number,
            obj_id: CHECKPOINT_OBJ_ID,
            chunk_id: 40,
            n_bytes: 0,
        };
        dev.write_chunk(dev.geometry().first_chunk(spare), b"junk", tags)?;

        let (_, loaded_state, loaded) = load(&mut dev)?;
        assert_eq!(loaded_state, state);
        assert_same_shape(&graph, &loaded.unwrap());
        Ok(())
    }

    #[test]
    fn test_falls_back_to_older_checkpoint() -> anyhow::Result<()> {
        let mut dev = TaggedNand::new(SimNand::new(TEST_LAYOUT))?;
        let mut state = CheckpointState::default();
        let mut graph = sample_graph(1 << 20);
        store(&mut dev, &mut state, &mut graph)?;

        // A newer checkpoint that never finished: only its first chunk made it out
        let stale = state.blocks[0];
        let spare = (0..TEST_LAYOUT.blocks).find(|b| *b != stale).unwrap();
        let tags = Tags {
            seq_number: state.seq_number + 1,
            obj_id: CHECKPOINT_OBJ_ID,
            chunk_id: 0,
            n_bytes: 0,
        };
        dev.write_chunk(dev.geometry().first_chunk(spare), b"YCKP", tags)?;

        let (_, loaded_state, loaded) = load(&mut dev)?;
        assert_eq!(loaded_state.seq_number, state.seq_number + 1);
        assert_eq!(loaded_state.blocks, state.blocks);
        assert_same_shape(&graph, &loaded.unwrap());
        Ok(())
    }
}
