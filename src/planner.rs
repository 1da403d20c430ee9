//! Turns the caller's writes into the payload sequence sent to the device.
//!
//! Every write is cut into chunks, each chunk is hashed and identical chunks
//! are merged into one payload that targets several locations. Consecutive
//! single-destination chunks are then folded into contiguous runs. The result
//! is ordered by ascending number of destinations, which the device requires:
//! it streams single-destination payloads in bulk before handling the
//! multi-destination ones individually.
//!
//! NOTE: deduplication treats equal SHA-256 digests as equal content.

use crate::error::{Error, Result};
use sha2::{Digest, Sha256};
use std::{
    collections::{HashMap, HashSet},
    io::{Read, Seek, SeekFrom},
};
use thiserror::Error;

/// Size of a disk sector, the unit of `start_sector`.
pub const SECTOR_SIZE: u64 = 512;

/// Longest run of contiguous chunks folded into one payload.
pub const DEFAULT_MAX_RUN_CHUNKS: u32 = 64;

/// Size of a hash table entry.
pub const HASH_ENTRY_SIZE: usize = 32;
/// Size of one descriptor location record, also the size of the descriptor
/// record preamble.
pub const LOCATION_ENTRY_SIZE: usize = 8;

pub type ChunkHash = [u8; HASH_ENTRY_SIZE];

/// A readable and seekable byte source.
pub trait ChunkSource: Read + Seek + Send {}

impl<T: Read + Seek + Send> ChunkSource for T {}

/// A caller supplied write.
pub struct WritePart {
    /// Destination, in 512-byte sectors.
    pub start_sector: u32,
    pub source: Box<dyn ChunkSource>,
    /// Progress text shown while the part is streamed.
    pub label: Option<String>,
}

impl WritePart {
    pub fn new(start_sector: u32, source: impl ChunkSource + 'static) -> Self {
        WritePart {
            start_sector,
            source: Box::new(source),
            label: None,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }
}

impl std::fmt::Debug for WritePart {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WritePart")
            .field("start_sector", &self.start_sector)
            .field("label", &self.label)
            .finish()
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InputError {
    #[error("no writes were given")]
    NoWrites,
    #[error("chunk size {0:#x} is not a power of two multiple of the sector size")]
    InvalidChunkSize(u32),
    #[error("write {part} starts at sector {sector} which is not chunk aligned")]
    MisalignedStart { part: usize, sector: u32 },
    #[error("write {part} is {len:#x} bytes long, not a multiple of the chunk size")]
    UnalignedLength { part: usize, len: u64 },
    #[error("write {part} is empty")]
    EmptySource { part: usize },
    #[error("write {part} overlaps the partition table chunk")]
    OverlapsPartitionTable { part: usize },
    #[error("write {part} reaches past the addressable chunk range")]
    OutOfRange { part: usize },
    #[error("chunk {chunk} is written more than once")]
    OverlappingWrites { chunk: u32 },
    #[error("the image uses {found:#x}-byte chunks but {expected:#x} was requested")]
    ChunkSizeMismatch { expected: u32, found: u32 },
}

/// Where the bytes of a chunk can be read back from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceRef {
    pub part: usize,
    pub offset: u64,
}

/// A unit of transfer: one or more chunks written to one or more places.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payload {
    pub chunk_count: u32,
    /// One digest per constituent chunk.
    pub chunk_hashes: Vec<ChunkHash>,
    /// Absolute destination chunk of the first constituent chunk, per target.
    pub target_chunk_indices: Vec<u32>,
    /// One back-pointer per constituent chunk.
    pub source_refs: Vec<SourceRef>,
}

impl Payload {
    fn single(hash: ChunkHash, target: u32, source: SourceRef) -> Self {
        Payload {
            chunk_count: 1,
            chunk_hashes: vec![hash],
            target_chunk_indices: vec![target],
            source_refs: vec![source],
        }
    }

    /// Bytes taken in the hash table of a forged header.
    pub fn hash_table_bytes(&self) -> usize {
        HASH_ENTRY_SIZE * self.chunk_hashes.len()
    }

    /// Bytes taken in the descriptor table of a forged header.
    pub fn descriptor_bytes(&self) -> usize {
        LOCATION_ENTRY_SIZE * (self.target_chunk_indices.len() + 1)
    }

    /// Single-destination payloads are streamed in bulk.
    pub fn is_bulk(&self) -> bool {
        self.target_chunk_indices.len() == 1
    }

    /// Every destination chunk this payload writes.
    pub fn covered_chunks(&self) -> impl Iterator<Item = u32> + '_ {
        self.target_chunk_indices
            .iter()
            .flat_map(move |&target| target..target + self.chunk_count)
    }
}

/// Plans `parts` with deduplication and run folding.
pub fn plan(parts: &mut [WritePart], chunk_size: u32) -> Result<Vec<Payload>> {
    plan_with_run_limit(parts, chunk_size, DEFAULT_MAX_RUN_CHUNKS)
}

/// Same as [`plan`] with an explicit limit on folded runs.
pub fn plan_with_run_limit(
    parts: &mut [WritePart],
    chunk_size: u32,
    max_run_chunks: u32,
) -> Result<Vec<Payload>> {
    let mut payloads = Vec::new();
    let mut by_hash: HashMap<ChunkHash, usize> = HashMap::new();

    scan(parts, chunk_size, |hash, target, source| {
        match by_hash.get(&hash) {
            Some(&index) => {
                let payload: &mut Payload = &mut payloads[index];
                payload.target_chunk_indices.push(target);
            }
            None => {
                by_hash.insert(hash, payloads.len());
                payloads.push(Payload::single(hash, target, source));
            }
        }
    })?;

    let mut payloads = fold_runs(payloads, chunk_size, max_run_chunks.max(1));
    payloads.sort_by_key(|p| p.target_chunk_indices.len());

    tracing::debug!(
        "planned {} payloads, {} of them multi-destination",
        payloads.len(),
        payloads.iter().filter(|p| !p.is_bulk()).count()
    );
    Ok(payloads)
}

/// Plans one payload per chunk, without looking at content.
pub fn plan_without_dedup(parts: &mut [WritePart], chunk_size: u32) -> Result<Vec<Payload>> {
    let mut payloads = Vec::new();
    scan(parts, chunk_size, |hash, target, source| {
        payloads.push(Payload::single(hash, target, source));
    })?;
    Ok(payloads)
}

/// Reads the chunk a [`SourceRef`] points at.
pub fn read_chunk(parts: &mut [WritePart], source: SourceRef, chunk_size: u32) -> Result<Vec<u8>> {
    let part = parts
        .get_mut(source.part)
        .ok_or(InputError::OutOfRange { part: source.part })?;
    let mut chunk = vec![0u8; chunk_size as usize];
    part.source.seek(SeekFrom::Start(source.offset))?;
    part.source.read_exact(&mut chunk)?;
    Ok(chunk)
}

/// Reads every constituent chunk of `payload`, in order.
pub fn read_payload(
    parts: &mut [WritePart],
    payload: &Payload,
    chunk_size: u32,
) -> Result<Vec<u8>> {
    let mut data = Vec::with_capacity(payload.source_refs.len() * chunk_size as usize);
    for &source in &payload.source_refs {
        data.extend(read_chunk(parts, source, chunk_size)?);
    }
    Ok(data)
}

pub fn validate_chunk_size(chunk_size: u32) -> Result<(), InputError> {
    if chunk_size as u64 >= SECTOR_SIZE && chunk_size.is_power_of_two() {
        Ok(())
    } else {
        Err(InputError::InvalidChunkSize(chunk_size))
    }
}

/// Streams every part in chunk windows, in input order, and hands each
/// chunk's digest and destination to `visit`.
fn scan<F>(parts: &mut [WritePart], chunk_size: u32, mut visit: F) -> Result<()>
where
    F: FnMut(ChunkHash, u32, SourceRef),
{
    validate_chunk_size(chunk_size)?;
    let chunk_len = chunk_size as u64;
    let mut seen = HashSet::new();
    let mut chunk = vec![0u8; chunk_size as usize];

    for (index, part) in parts.iter_mut().enumerate() {
        let start = part.start_sector as u64 * SECTOR_SIZE;
        if start % chunk_len != 0 {
            return Err(InputError::MisalignedStart {
                part: index,
                sector: part.start_sector,
            }
            .into());
        }
        let first = start / chunk_len;
        if first == 0 {
            return Err(InputError::OverlapsPartitionTable { part: index }.into());
        }

        let len = part.source.seek(SeekFrom::End(0))?;
        if len == 0 {
            return Err(InputError::EmptySource { part: index }.into());
        }
        if len % chunk_len != 0 {
            return Err(InputError::UnalignedLength { part: index, len }.into());
        }
        part.source.seek(SeekFrom::Start(0))?;

        for n in 0..len / chunk_len {
            let target = u32::try_from(first + n)
                .map_err(|_| Error::from(InputError::OutOfRange { part: index }))?;
            if !seen.insert(target) {
                return Err(InputError::OverlappingWrites { chunk: target }.into());
            }
            part.source.read_exact(&mut chunk)?;
            let hash: ChunkHash = Sha256::digest(&chunk).into();
            visit(
                hash,
                target,
                SourceRef {
                    part: index,
                    offset: n * chunk_len,
                },
            );
        }
    }
    Ok(())
}

/// Folds consecutive single-destination payloads that are contiguous both on
/// the device and in their source into multi-chunk runs.
fn fold_runs(payloads: Vec<Payload>, chunk_size: u32, max_run_chunks: u32) -> Vec<Payload> {
    let mut folded: Vec<Payload> = Vec::with_capacity(payloads.len());
    for payload in payloads {
        if let Some(last) = folded.last_mut() {
            if extends_run(last, &payload, chunk_size, max_run_chunks) {
                last.chunk_count += 1;
                last.chunk_hashes.extend(payload.chunk_hashes);
                last.source_refs.extend(payload.source_refs);
                continue;
            }
        }
        folded.push(payload);
    }
    folded
}

fn extends_run(run: &Payload, next: &Payload, chunk_size: u32, max_run_chunks: u32) -> bool {
    if !run.is_bulk() || !next.is_bulk() || run.chunk_count >= max_run_chunks {
        return false;
    }
    let (last_source, next_source) = match (run.source_refs.last(), next.source_refs.first()) {
        (Some(last), Some(next)) => (last, next),
        _ => return false,
    };
    run.target_chunk_indices[0] + run.chunk_count == next.target_chunk_indices[0]
        && last_source.part == next_source.part
        && last_source.offset + chunk_size as u64 == next_source.offset
}
