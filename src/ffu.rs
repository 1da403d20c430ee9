//! Minimal reader for the signed firmware image (FFU) container.
//!
//! Only the headers are read: the security header with its catalog and hash
//! table, the image header with its manifest, and the store header with its
//! descriptors. Each of the three regions is padded to a whole chunk.

use crate::header::{read_u32, security, store, HeaderTemplate};
use std::{
    fs::File,
    io::{BufReader, Read, Seek, SeekFrom},
    path::Path,
};
use thiserror::Error;

const IMAGE_HEADER_SIZE: usize = 0x18;
const IMAGE_SIGNATURE: &[u8; 12] = b"ImageFlash  ";
const IMAGE_MANIFEST_LENGTH: usize = 0x10;
const STORE_VALIDATE_LENGTH: usize = store::VALIDATE_LENGTH;
const MANIFEST_VERSION_KEY: &str = "OSVersion";

#[derive(Error, Debug)]
pub enum ImageError {
    #[error("bad {0} signature")]
    BadSignature(&'static str),
    #[error("truncated {0}")]
    Truncated(&'static str),
    #[error("unsupported chunk size {0:#x}")]
    InvalidChunkSize(u32),
    #[error("{0}")]
    Io(#[from] std::io::Error),
}

/// What the exploit needs from a reference firmware image.
pub trait FirmwareImage {
    fn chunk_size(&self) -> u32;
    /// The signed legitimate headers.
    fn header_template(&self) -> &HeaderTemplate;
    /// The complete signed header region, as sent by a regular flash.
    fn signed_header(&self) -> &[u8];
    fn platform_id(&self) -> &str;
    fn firmware_version(&self) -> &str;
}

/// Headers of an FFU file.
#[derive(Debug, Clone)]
pub struct FfuImage {
    template: HeaderTemplate,
    signed_header: Vec<u8>,
    platform_id: String,
    firmware_version: String,
}

impl FfuImage {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, ImageError> {
        let file = File::open(path)?;
        Self::read(BufReader::new(file))
    }

    pub fn read<R: Read + Seek>(mut reader: R) -> Result<Self, ImageError> {
        let len = reader.seek(SeekFrom::End(0))?;
        reader.seek(SeekFrom::Start(0))?;

        // Security header, catalog and hash table.
        let mut fixed = vec![0u8; security::HEADER_SIZE];
        read_exact(&mut reader, &mut fixed, "security header")?;
        let signature = &fixed[security::SIGNATURE_OFFSET..security::SIGNATURE_OFFSET + 12];
        if signature != security::SIGNATURE {
            return Err(ImageError::BadSignature("security header"));
        }
        let chunk_kb = read_u32(&fixed, security::CHUNK_SIZE_KB);
        let chunk_size = chunk_kb
            .checked_mul(1024)
            .filter(|size| size.is_power_of_two())
            .ok_or(ImageError::InvalidChunkSize(chunk_kb))?;
        let tables = read_u32(&fixed, security::CATALOG_SIZE) as u64
            + read_u32(&fixed, security::HASH_TABLE_SIZE) as u64;
        let security_end = within(len, 0, security::HEADER_SIZE as u64 + tables, "hash table")?;
        let mut security_region = fixed;
        security_region.resize(security_end, 0);
        read_exact(&mut reader, &mut security_region[security::HEADER_SIZE..], "hash table")?;
        let image_offset = pad_to(security_region.len(), chunk_size);

        // Image header and manifest.
        reader.seek(SeekFrom::Start(image_offset as u64))?;
        let mut image_header = vec![0u8; IMAGE_HEADER_SIZE];
        read_exact(&mut reader, &mut image_header, "image header")?;
        if &image_header[4..16] != IMAGE_SIGNATURE {
            return Err(ImageError::BadSignature("image header"));
        }
        let header_size = read_u32(&image_header, 0) as usize;
        let manifest_start = image_offset + header_size;
        let manifest_len = read_u32(&image_header, IMAGE_MANIFEST_LENGTH) as u64;
        let manifest_end = within(len, manifest_start, manifest_len, "manifest")?;
        let mut manifest = vec![0u8; manifest_end - manifest_start];
        reader.seek(SeekFrom::Start(manifest_start as u64))?;
        read_exact(&mut reader, &mut manifest, "manifest")?;
        let store_offset = image_offset + pad_to(header_size + manifest.len(), chunk_size);

        // Store header and descriptors.
        reader.seek(SeekFrom::Start(store_offset as u64))?;
        let mut store_region = vec![0u8; store::HEADER_SIZE];
        read_exact(&mut reader, &mut store_region, "store header")?;
        let descriptors = read_u32(&store_region, STORE_VALIDATE_LENGTH) as u64
            + read_u32(&store_region, store::DESCRIPTOR_LENGTH) as u64;
        let store_size = store::HEADER_SIZE as u64 + descriptors;
        let store_end = within(len, store_offset, store_size, "descriptors")?;
        store_region.resize(store_end - store_offset, 0);
        read_exact(&mut reader, &mut store_region[store::HEADER_SIZE..], "descriptors")?;
        let end = store_offset + pad_to(store_region.len(), chunk_size);
        within(len, 0, end as u64, "signed header")?;

        let mut signed_header = vec![0u8; end];
        reader.seek(SeekFrom::Start(0))?;
        read_exact(&mut reader, &mut signed_header, "signed header")?;

        let platform = store::PLATFORM_ID..store::PLATFORM_ID + store::PLATFORM_ID_LEN;
        let platform_id = c_string(&store_region[platform]);
        let firmware_version = manifest_value(&manifest, MANIFEST_VERSION_KEY)
            .unwrap_or_else(|| String::from("unknown"));

        tracing::debug!(
            "read image for {} ({}), {:#x}-byte chunks, {:#x}-byte signed header",
            platform_id,
            firmware_version,
            chunk_size,
            signed_header.len()
        );

        Ok(FfuImage {
            template: HeaderTemplate::new(security_region, store_region, chunk_size)?,
            signed_header,
            platform_id,
            firmware_version,
        })
    }
}

impl FirmwareImage for FfuImage {
    fn chunk_size(&self) -> u32 {
        self.template.chunk_size()
    }

    fn header_template(&self) -> &HeaderTemplate {
        &self.template
    }

    fn signed_header(&self) -> &[u8] {
        &self.signed_header
    }

    fn platform_id(&self) -> &str {
        &self.platform_id
    }

    fn firmware_version(&self) -> &str {
        &self.firmware_version
    }
}

fn read_exact<R: Read>(
    reader: &mut R,
    buf: &mut [u8],
    what: &'static str,
) -> Result<(), ImageError> {
    reader.read_exact(buf).map_err(|err| match err.kind() {
        std::io::ErrorKind::UnexpectedEof => ImageError::Truncated(what),
        _ => ImageError::Io(err),
    })
}

/// Returns the end of the `size` bytes at `offset` when they lie inside an
/// image of `len` bytes.
fn within(len: u64, offset: usize, size: u64, what: &'static str) -> Result<usize, ImageError> {
    (offset as u64)
        .checked_add(size)
        .filter(|&end| end <= len)
        .map(|end| end as usize)
        .ok_or(ImageError::Truncated(what))
}

fn pad_to(len: usize, chunk_size: u32) -> usize {
    let chunk = chunk_size as usize;
    (len + chunk - 1) / chunk * chunk
}

fn c_string(raw: &[u8]) -> String {
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    String::from_utf8_lossy(&raw[..end]).into_owned()
}

/// Looks up `key = value` in the manifest text.
fn manifest_value(manifest: &[u8], key: &str) -> Option<String> {
    String::from_utf8_lossy(manifest).lines().find_map(|line| {
        let (name, value) = line.split_once('=')?;
        if name.trim() == key {
            Some(value.trim().to_string())
        } else {
            None
        }
    })
}
