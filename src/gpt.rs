//! A small GUID partition table handle over the first chunk of the disk.
//!
//! The chunk starts with the protective MBR, the primary header sits in the
//! second sector and the entry array follows it. Edits are made on the parsed
//! entries and only reach the bytes through [`Gpt::rebuild`].

use crate::header::{read_u32, write_u32};
use thiserror::Error;

const SECTOR: usize = 0x200;
const HEADER_OFFSET: usize = SECTOR;
const SIGNATURE: &[u8; 8] = b"EFI PART";

mod field {
    pub const HEADER_SIZE: usize = 0x0C;
    pub const HEADER_CRC: usize = 0x10;
    pub const ENTRIES_LBA: usize = 0x48;
    pub const ENTRY_COUNT: usize = 0x50;
    pub const ENTRY_SIZE: usize = 0x54;
    pub const ENTRIES_CRC: usize = 0x58;
}

const NAME_OFFSET: usize = 0x38;
const NAME_UNITS: usize = 36;

/// Partition the legacy unlock path keys off.
pub const BACKDOOR_PARTITION: &str = "BACKUP_BS_NV";
/// Attribute bit that hides a partition from the firmware.
pub const ATTRIBUTE_HIDDEN: u64 = 1 << 62;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GptError {
    #[error("no GPT signature in the partition table chunk")]
    MissingSignature,
    #[error("the entry array does not fit in the {0:#x}-byte chunk")]
    Truncated(usize),
    #[error("unsupported entry size {0:#x}")]
    InvalidEntrySize(u32),
    #[error("header checksum mismatch")]
    HeaderChecksum,
    #[error("no partition named {0}")]
    MissingPartition(String),
}

/// One used slot of the entry array.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partition {
    pub name: String,
    pub type_guid: [u8; 16],
    pub unique_guid: [u8; 16],
    pub first_lba: u64,
    pub last_lba: u64,
    pub attributes: u64,
    slot: usize,
}

impl Partition {
    /// `None` when the entry's bounds are inverted or overflow.
    pub fn size_in_bytes(&self) -> Option<u64> {
        self.last_lba
            .checked_add(1)?
            .checked_sub(self.first_lba)?
            .checked_mul(SECTOR as u64)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Gpt {
    raw: Vec<u8>,
    entries_offset: usize,
    entry_count: usize,
    entry_size: usize,
    partitions: Vec<Partition>,
}

impl Gpt {
    pub fn parse(chunk: &[u8]) -> Result<Self, GptError> {
        if chunk.len() < HEADER_OFFSET + SECTOR {
            return Err(GptError::Truncated(chunk.len()));
        }
        let header = &chunk[HEADER_OFFSET..HEADER_OFFSET + SECTOR];
        if &header[..8] != SIGNATURE {
            return Err(GptError::MissingSignature);
        }

        let header_size = read_u32(header, field::HEADER_SIZE) as usize;
        if header_size > SECTOR || header_size < field::ENTRIES_CRC + 4 {
            return Err(GptError::MissingSignature);
        }
        let mut copy = header[..header_size].to_vec();
        write_u32(&mut copy, field::HEADER_CRC, 0);
        if crc32(&copy) != read_u32(header, field::HEADER_CRC) {
            return Err(GptError::HeaderChecksum);
        }

        let entry_size = read_u32(header, field::ENTRY_SIZE);
        if entry_size < 0x80 || entry_size % 8 != 0 {
            return Err(GptError::InvalidEntrySize(entry_size));
        }
        let entry_size = entry_size as usize;
        let entry_count = read_u32(header, field::ENTRY_COUNT) as usize;
        let entries_offset = usize::try_from(read_u64(header, field::ENTRIES_LBA))
            .ok()
            .and_then(|lba| lba.checked_mul(SECTOR))
            .ok_or(GptError::Truncated(chunk.len()))?;
        let entries_end = entry_count
            .checked_mul(entry_size)
            .and_then(|len| len.checked_add(entries_offset));
        if entries_end.map_or(true, |end| end > chunk.len()) {
            return Err(GptError::Truncated(chunk.len()));
        }

        let partitions = (0..entry_count)
            .filter_map(|slot| {
                let entry = &chunk[entries_offset + slot * entry_size..][..entry_size];
                parse_entry(entry, slot)
            })
            .collect();

        Ok(Gpt {
            raw: chunk.to_vec(),
            entries_offset,
            entry_count,
            entry_size,
            partitions,
        })
    }

    pub fn partitions(&self) -> &[Partition] {
        &self.partitions
    }

    pub fn get(&self, name: &str) -> Option<&Partition> {
        self.partitions.iter().find(|p| p.name == name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Partition> {
        self.partitions.iter_mut().find(|p| p.name == name)
    }

    /// Hides or unhides the backdoor partition.
    pub fn set_backdoor_enabled(&mut self, enabled: bool) -> Result<(), GptError> {
        let partition = self
            .get_mut(BACKDOOR_PARTITION)
            .ok_or_else(|| GptError::MissingPartition(BACKDOOR_PARTITION.to_string()))?;
        if enabled {
            partition.attributes &= !ATTRIBUTE_HIDDEN;
        } else {
            partition.attributes |= ATTRIBUTE_HIDDEN;
        }
        Ok(())
    }

    /// Serializes the entries back into the chunk and recomputes both
    /// checksums.
    pub fn rebuild(&self) -> Vec<u8> {
        let mut raw = self.raw.clone();
        for partition in &self.partitions {
            let offset = self.entries_offset + partition.slot * self.entry_size;
            write_entry(&mut raw[offset..offset + self.entry_size], partition);
        }

        let entries_len = self.entry_count * self.entry_size;
        let entries_crc = crc32(&raw[self.entries_offset..self.entries_offset + entries_len]);
        let header = &mut raw[HEADER_OFFSET..HEADER_OFFSET + SECTOR];
        write_u32(header, field::ENTRIES_CRC, entries_crc);
        write_u32(header, field::HEADER_CRC, 0);
        let header_size = read_u32(header, field::HEADER_SIZE) as usize;
        let header_crc = crc32(&header[..header_size]);
        write_u32(header, field::HEADER_CRC, header_crc);
        raw
    }
}

fn parse_entry(entry: &[u8], slot: usize) -> Option<Partition> {
    let mut type_guid = [0u8; 16];
    type_guid.copy_from_slice(&entry[..16]);
    if type_guid == [0u8; 16] {
        return None;
    }
    let mut unique_guid = [0u8; 16];
    unique_guid.copy_from_slice(&entry[16..32]);

    let units: Vec<u16> = entry[NAME_OFFSET..NAME_OFFSET + 2 * NAME_UNITS]
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .take_while(|&unit| unit != 0)
        .collect();

    Some(Partition {
        name: String::from_utf16_lossy(&units),
        type_guid,
        unique_guid,
        first_lba: read_u64(entry, 0x20),
        last_lba: read_u64(entry, 0x28),
        attributes: read_u64(entry, 0x30),
        slot,
    })
}

fn write_entry(entry: &mut [u8], partition: &Partition) {
    entry[..16].copy_from_slice(&partition.type_guid);
    entry[16..32].copy_from_slice(&partition.unique_guid);
    entry[0x20..0x28].copy_from_slice(&partition.first_lba.to_le_bytes());
    entry[0x28..0x30].copy_from_slice(&partition.last_lba.to_le_bytes());
    entry[0x30..0x38].copy_from_slice(&partition.attributes.to_le_bytes());

    let name = &mut entry[NAME_OFFSET..NAME_OFFSET + 2 * NAME_UNITS];
    name.fill(0);
    for (unit, slot) in partition
        .name
        .encode_utf16()
        .take(NAME_UNITS - 1)
        .zip(name.chunks_exact_mut(2))
    {
        slot.copy_from_slice(&unit.to_le_bytes());
    }
}

fn read_u64(data: &[u8], offset: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&data[offset..offset + 8]);
    u64::from_le_bytes(raw)
}

/// CRC-32 (IEEE 802.3, reflected) as used by GPT.
pub fn crc32(data: &[u8]) -> u32 {
    let mut crc = !0u32;
    for &byte in data {
        crc ^= byte as u32;
        for _ in 0..8 {
            let mask = (crc & 1).wrapping_neg();
            crc = (crc >> 1) ^ (0xEDB8_8320 & mask);
        }
    }
    !crc
}
