//! Capability sets of a connected device, one per personality it can boot
//! into, and the interface used to wait for it to come and go.

use crate::error::{Error, Result};
use std::{fmt, sync::atomic::AtomicBool, time::Duration};

/// Bits of [`DeviceInfo::supported_protocols`].
pub mod protocol {
    pub const HEADER_V1: u32 = 1 << 0;
    /// Header fragments carrying a declared total size and an offset.
    pub const HEADER_V2: u32 = 1 << 1;
    /// Bulk payload transfers.
    pub const PAYLOAD_V2: u32 = 1 << 2;
    pub const ASYNC_BUFFERS: u32 = 1 << 3;
    pub const BACKUP_TO_RAM: u32 = 1 << 4;
}

/// Bytes of a transfer taken by the command framing of a v2 header fragment.
pub const HEADER_V2_OVERHEAD: u32 = 0x10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceMode {
    Flash,
    Bootloader,
    MassStorage,
    EmergencyDownload,
}

impl fmt::Display for DeviceMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DeviceMode::Flash => "flash",
            DeviceMode::Bootloader => "bootloader",
            DeviceMode::MassStorage => "mass storage",
            DeviceMode::EmergencyDownload => "emergency download",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DeviceInfo {
    pub protocol_major: u8,
    pub root_key_hash: Vec<u8>,
    /// Largest single transfer the device accepts.
    pub write_buffer_size: u32,
    pub secure_boot_enabled: bool,
    pub supported_protocols: u32,
    pub model: String,
    pub platform_id: String,
    pub firmware_version: String,
}

impl DeviceInfo {
    pub fn supports(&self, protocol: u32) -> bool {
        self.supported_protocols & protocol == protocol
    }
}

/// Commands of the flashing personality.
pub trait FlashSession {
    fn read_device_info(&mut self) -> Result<DeviceInfo>;
    /// Reads the first `size` bytes of the disk.
    fn get_partition_table_chunk(&mut self, size: u32) -> Result<Vec<u8>>;
    /// Sends a complete signed header.
    fn send_header_v1(&mut self, header: &[u8]) -> Result<()>;
    /// Sends `fragment` at `offset` of a header of `declared_size` bytes.
    /// The device processes the header once the declared size is reached.
    fn send_header_v2(&mut self, declared_size: u32, offset: u32, fragment: &[u8]) -> Result<()>;
    /// Sends the content of one payload.
    fn send_payload_v1(&mut self, data: &[u8]) -> Result<()>;
    /// Sends the content of consecutive payloads in one transfer.
    fn send_payload_v2(&mut self, data: &[u8]) -> Result<()>;
    fn reset_device(&mut self) -> Result<()>;
    fn start_async_buffer_allocation(&mut self) -> Result<()>;
    fn end_async_buffer_allocation(&mut self) -> Result<()>;
    fn backup_partition_to_ram(&mut self, name: &str) -> Result<()>;
}

pub trait BootloaderSession {
    /// Reboots into the flashing personality.
    fn switch_to_flash(&mut self) -> Result<()>;
    fn reset_device(&mut self) -> Result<()>;
}

pub trait MassStorageSession {
    fn reset_device(&mut self) -> Result<()>;
}

pub trait EmergencySession {
    /// Uploads and starts a second-stage loader.
    fn boot_loader(&mut self, loader: &[u8]) -> Result<()>;
}

/// A connected device, tagged by the personality it runs.
pub enum DeviceSession {
    Flash(Box<dyn FlashSession>),
    Bootloader(Box<dyn BootloaderSession>),
    MassStorage(Box<dyn MassStorageSession>),
    EmergencyDownload(Box<dyn EmergencySession>),
}

impl DeviceSession {
    pub fn mode(&self) -> DeviceMode {
        match self {
            DeviceSession::Flash(_) => DeviceMode::Flash,
            DeviceSession::Bootloader(_) => DeviceMode::Bootloader,
            DeviceSession::MassStorage(_) => DeviceMode::MassStorage,
            DeviceSession::EmergencyDownload(_) => DeviceMode::EmergencyDownload,
        }
    }

    pub fn into_flash(self) -> Result<Box<dyn FlashSession>> {
        match self {
            DeviceSession::Flash(session) => Ok(session),
            other => Err(Error::UnexpectedMode {
                observed: other.mode(),
                expected: DeviceMode::Flash,
            }),
        }
    }
}

impl fmt::Debug for DeviceSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DeviceSession({})", self.mode())
    }
}

/// Watches the bus for the device.
///
/// A `timeout` of `None` waits until the device shows up or `cancel` is set.
pub trait DeviceConnector {
    /// Returns `Ok(None)` when the timeout elapsed first.
    fn wait_for_arrival(
        &mut self,
        timeout: Option<Duration>,
        cancel: &AtomicBool,
    ) -> Result<Option<DeviceSession>>;

    /// Returns `Ok(false)` when the timeout elapsed first.
    fn wait_for_removal(&mut self, timeout: Option<Duration>, cancel: &AtomicBool) -> Result<bool>;
}
