//! USB transport for the phone's flashing protocol.
//!
//! Every command starts with an ASCII signature followed by little-endian
//! arguments and data. Responses echo the signature and carry a big-endian
//! status at offset 6, zero meaning success, followed by the reply data.

use crate::{
    error::{Error, Result},
    session::{
        BootloaderSession, DeviceConnector, DeviceInfo, DeviceSession, EmergencySession,
        FlashSession, MassStorageSession,
    },
};
use bytes::{Buf, BufMut, BytesMut};
use rusb::{Device, DeviceHandle, DeviceList, GlobalContext};
use std::{
    cmp,
    sync::atomic::{AtomicBool, Ordering},
    thread,
    time::{Duration, Instant},
};

/// Vendor ID of the phone in flash and bootloader mode.
pub const PHONE_VID: u16 = 0x0421;
/// Product ID of the phone in flash and bootloader mode.
pub const PHONE_PID: u16 = 0x066E;
/// Product ID of the phone exposing its storage as a mass storage device.
pub const MASS_STORAGE_PID: u16 = 0x0A00;
/// Emergency download personality of the SoC.
pub const EMERGENCY_VID: u16 = 0x05C6;
pub const EMERGENCY_PID: u16 = 0x9008;

const ENDPOINT_OUT: u8 = 0x01;
const ENDPOINT_IN: u8 = 0x81;
const INTERFACE: u8 = 0;

const READ_TIMEOUT: Duration = Duration::from_millis(5000);
const WRITE_TIMEOUT: Duration = Duration::from_millis(5000);
const POLL_INTERVAL: Duration = Duration::from_millis(500);

const RESPONSE_HEADER: usize = 8;
const STATUS_OFFSET: usize = 6;
const MAX_RESPONSE: usize = 0x1000;

/// Transfer size used until the device reported its own.
const DEFAULT_WRITE_BUFFER: usize = 0x8000;
const LOADER_PACKET: usize = 0x1000;
const LOADER_ACK: &[u8; 4] = b"LDOK";

mod command {
    pub const INFO: &[u8; 4] = b"NOKV";
    pub const READ_GPT: &[u8; 4] = b"NOKT";
    pub const HEADER_V1: &[u8; 4] = b"NOKH";
    pub const HEADER_V2: &[u8; 4] = b"NOKX";
    pub const PAYLOAD_V1: &[u8; 4] = b"NOKP";
    pub const PAYLOAD_V2: &[u8; 4] = b"NOKB";
    pub const RESET: &[u8; 4] = b"NOKR";
    pub const ASYNC: &[u8; 4] = b"NOKA";
    pub const BACKUP: &[u8; 4] = b"NOKM";
    pub const SWITCH: &[u8; 4] = b"NOKS";
}

/// Tags of the device info reply.
mod info {
    pub const PROTOCOL_VERSION: u8 = 0x01;
    pub const WRITE_BUFFER_SIZE: u8 = 0x02;
    pub const ROOT_KEY_HASH: u8 = 0x03;
    pub const SECURE_BOOT: u8 = 0x04;
    pub const SUPPORTED_PROTOCOLS: u8 = 0x05;
    pub const MODEL: u8 = 0x06;
    pub const PLATFORM_ID: u8 = 0x07;
    pub const FIRMWARE_VERSION: u8 = 0x08;
    pub const APPLICATION: u8 = 0x09;

    pub const APP_BOOTLOADER: u8 = 1;
    pub const APP_FLASH: u8 = 2;
}

/// Maps the ways libusb reports a vanished device to [`Error::ConnectionLost`].
fn usb_error(err: rusb::Error) -> Error {
    match err {
        rusb::Error::NoDevice | rusb::Error::Io | rusb::Error::Pipe => Error::ConnectionLost,
        err => Error::Usb(err),
    }
}

/// An open bulk channel to the device.
pub struct Link {
    device: DeviceHandle<GlobalContext>,
    write_buffer_size: usize,
}

impl Link {
    fn open(device: &Device<GlobalContext>) -> Result<Self> {
        let mut handle = device.open().map_err(usb_error)?;
        handle.claim_interface(INTERFACE).map_err(usb_error)?;
        Ok(Link {
            device: handle,
            write_buffer_size: DEFAULT_WRITE_BUFFER,
        })
    }

    fn write(&mut self, mut buffer: &[u8]) -> Result<()> {
        while !buffer.is_empty() {
            let len = cmp::min(buffer.len(), self.write_buffer_size);
            let written = self
                .device
                .write_bulk(ENDPOINT_OUT, &buffer[..len], WRITE_TIMEOUT)
                .map_err(usb_error)?;
            buffer = &buffer[written..];
        }
        Ok(())
    }

    fn read(&mut self, capacity: usize) -> Result<Vec<u8>> {
        let mut buffer = vec![0u8; capacity];
        let len = self
            .device
            .read_bulk(ENDPOINT_IN, &mut buffer, READ_TIMEOUT)
            .map_err(usb_error)?;
        buffer.truncate(len);
        Ok(buffer)
    }

    /// Sends one framed request and returns the reply data.
    fn transact(&mut self, name: &'static str, request: &[u8], reply: usize) -> Result<Vec<u8>> {
        self.write(request)?;
        let response = self.read(RESPONSE_HEADER + reply)?;
        if response.len() < RESPONSE_HEADER || response[..4] != request[..4] {
            return Err(Error::Protocol {
                command: name,
                status: 0xffff,
            });
        }
        let status = (&response[STATUS_OFFSET..]).get_u16();
        if status != 0 {
            return Err(Error::Protocol {
                command: name,
                status,
            });
        }
        Ok(response[RESPONSE_HEADER..].to_vec())
    }

    fn request(signature: &[u8; 4], capacity: usize) -> BytesMut {
        let mut request = BytesMut::with_capacity(4 + capacity);
        request.put_slice(signature);
        request
    }

    fn read_info(&mut self) -> Result<(DeviceInfo, u8)> {
        let reply = self.transact("device info", command::INFO, MAX_RESPONSE)?;
        let (info, application) = parse_info(&reply);
        if info.write_buffer_size != 0 {
            self.write_buffer_size = info.write_buffer_size as usize;
        }
        Ok((info, application))
    }
}

/// Decodes the `tag, u16 length, value` records of the device info reply.
fn parse_info(mut reply: &[u8]) -> (DeviceInfo, u8) {
    let mut info = DeviceInfo::default();
    let mut application = info::APP_FLASH;
    while reply.len() >= 3 {
        let tag = reply.get_u8();
        let len = cmp::min(reply.get_u16_le() as usize, reply.len());
        let value = &reply[..len];
        match tag {
            info::PROTOCOL_VERSION if len >= 1 => info.protocol_major = value[0],
            info::WRITE_BUFFER_SIZE if len >= 4 => {
                info.write_buffer_size = (&value[..4]).get_u32_le()
            }
            info::ROOT_KEY_HASH => info.root_key_hash = value.to_vec(),
            info::SECURE_BOOT if len >= 1 => info.secure_boot_enabled = value[0] != 0,
            info::SUPPORTED_PROTOCOLS if len >= 4 => {
                info.supported_protocols = (&value[..4]).get_u32_le()
            }
            info::MODEL => info.model = text(value),
            info::PLATFORM_ID => info.platform_id = text(value),
            info::FIRMWARE_VERSION => info.firmware_version = text(value),
            info::APPLICATION if len >= 1 => application = value[0],
            _ => tracing::trace!("ignoring device info tag {:#04x}", tag),
        }
        reply.advance(len);
    }
    (info, application)
}

fn text(value: &[u8]) -> String {
    String::from_utf8_lossy(value).trim_end_matches('\0').to_string()
}

/// The phone running its flashing application.
pub struct UsbFlashSession {
    link: Link,
}

impl FlashSession for UsbFlashSession {
    fn read_device_info(&mut self) -> Result<DeviceInfo> {
        self.link.read_info().map(|(info, _)| info)
    }

    fn get_partition_table_chunk(&mut self, size: u32) -> Result<Vec<u8>> {
        let mut request = Link::request(command::READ_GPT, 4);
        request.put_u32_le(size);
        let chunk = self.link.transact("read partition table", &request, size as usize)?;
        if chunk.len() != size as usize {
            return Err(Error::Protocol {
                command: "read partition table",
                status: 0xffff,
            });
        }
        Ok(chunk)
    }

    fn send_header_v1(&mut self, header: &[u8]) -> Result<()> {
        let fragment = self.link.write_buffer_size - 8;
        let mut chunks = header.chunks(fragment).peekable();
        while let Some(chunk) = chunks.next() {
            let mut request = Link::request(command::HEADER_V1, 4 + chunk.len());
            request.put_u32_le(chunks.peek().is_some() as u32);
            request.put_slice(chunk);
            self.link.transact("send header", &request, 0)?;
        }
        Ok(())
    }

    fn send_header_v2(&mut self, declared_size: u32, offset: u32, fragment: &[u8]) -> Result<()> {
        let mut request = Link::request(command::HEADER_V2, 12 + fragment.len());
        request.put_u32_le(declared_size);
        request.put_u32_le(offset);
        request.put_u32_le(fragment.len() as u32);
        request.put_slice(fragment);
        self.link.transact("send header fragment", &request, 0).map(drop)
    }

    fn send_payload_v1(&mut self, data: &[u8]) -> Result<()> {
        let mut request = Link::request(command::PAYLOAD_V1, data.len());
        request.put_slice(data);
        self.link.transact("send payload", &request, 0).map(drop)
    }

    fn send_payload_v2(&mut self, data: &[u8]) -> Result<()> {
        let mut request = Link::request(command::PAYLOAD_V2, 4 + data.len());
        request.put_u32_le(data.len() as u32);
        request.put_slice(data);
        self.link.transact("send bulk payload", &request, 0).map(drop)
    }

    fn reset_device(&mut self) -> Result<()> {
        self.link.transact("reset", command::RESET, 0).map(drop)
    }

    fn start_async_buffer_allocation(&mut self) -> Result<()> {
        let mut request = Link::request(command::ASYNC, 1);
        request.put_u8(1);
        self.link.transact("allocate async buffers", &request, 0).map(drop)
    }

    fn end_async_buffer_allocation(&mut self) -> Result<()> {
        let mut request = Link::request(command::ASYNC, 1);
        request.put_u8(0);
        self.link.transact("release async buffers", &request, 0).map(drop)
    }

    fn backup_partition_to_ram(&mut self, name: &str) -> Result<()> {
        let mut request = Link::request(command::BACKUP, name.len() + 1);
        request.put_slice(name.as_bytes());
        request.put_u8(0);
        self.link.transact("backup partition", &request, 0).map(drop)
    }
}

/// The phone running its boot manager.
pub struct UsbBootloaderSession {
    link: Link,
}

impl BootloaderSession for UsbBootloaderSession {
    fn switch_to_flash(&mut self) -> Result<()> {
        let mut request = Link::request(command::SWITCH, 1);
        request.put_u8(info::APP_FLASH);
        self.link.transact("switch to flash mode", &request, 0).map(drop)
    }

    fn reset_device(&mut self) -> Result<()> {
        self.link.transact("reset", command::RESET, 0).map(drop)
    }
}

/// The phone exposing its storage. Only a port reset is available here.
pub struct UsbMassStorageSession {
    device: DeviceHandle<GlobalContext>,
}

impl MassStorageSession for UsbMassStorageSession {
    fn reset_device(&mut self) -> Result<()> {
        self.device.reset().map_err(usb_error)
    }
}

/// The SoC's emergency download personality.
pub struct UsbEmergencySession {
    link: Link,
}

impl EmergencySession for UsbEmergencySession {
    fn boot_loader(&mut self, loader: &[u8]) -> Result<()> {
        self.link.write_buffer_size = LOADER_PACKET;
        let mut header = BytesMut::with_capacity(8);
        header.put_u32_le(loader.len() as u32);
        header.put_u32_le(LOADER_PACKET as u32);
        self.link.write(&header)?;
        self.link.write(loader)?;

        let ack = self.link.read(LOADER_ACK.len())?;
        if ack != LOADER_ACK {
            return Err(Error::Protocol {
                command: "boot loader",
                status: 0xffff,
            });
        }
        tracing::info!("second-stage loader started ({:#x} bytes)", loader.len());
        Ok(())
    }
}

/// Finds the phone on the bus, in whichever personality it runs.
pub struct UsbConnector {
    vendor_id: u16,
    product_id: u16,
}

impl Default for UsbConnector {
    fn default() -> Self {
        Self::new(None, None)
    }
}

impl UsbConnector {
    /// Overrides the IDs of the flashing personality when given.
    pub fn new(vendor_id: Option<u16>, product_id: Option<u16>) -> Self {
        UsbConnector {
            vendor_id: vendor_id.unwrap_or(PHONE_VID),
            product_id: product_id.unwrap_or(PHONE_PID),
        }
    }

    fn find(&self) -> Result<Option<Device<GlobalContext>>> {
        let device_list = DeviceList::new()?;

        for device in device_list.iter() {
            let descriptor = device.device_descriptor()?;
            let ids = (descriptor.vendor_id(), descriptor.product_id());
            if ids == (self.vendor_id, self.product_id)
                || ids == (self.vendor_id, MASS_STORAGE_PID)
                || ids == (EMERGENCY_VID, EMERGENCY_PID)
            {
                return Ok(Some(device));
            }
        }

        Ok(None)
    }

    /// Opens the device and tags it by the personality it runs.
    pub fn open(&self, device: &Device<GlobalContext>) -> Result<DeviceSession> {
        let descriptor = device.device_descriptor()?;
        match (descriptor.vendor_id(), descriptor.product_id()) {
            (EMERGENCY_VID, EMERGENCY_PID) => Ok(DeviceSession::EmergencyDownload(Box::new(
                UsbEmergencySession {
                    link: Link::open(device)?,
                },
            ))),
            (_, MASS_STORAGE_PID) => Ok(DeviceSession::MassStorage(Box::new(
                UsbMassStorageSession {
                    device: device.open().map_err(usb_error)?,
                },
            ))),
            _ => {
                let mut link = Link::open(device)?;
                let (_, application) = link.read_info()?;
                if application == info::APP_BOOTLOADER {
                    Ok(DeviceSession::Bootloader(Box::new(UsbBootloaderSession { link })))
                } else {
                    Ok(DeviceSession::Flash(Box::new(UsbFlashSession { link })))
                }
            }
        }
    }
}

impl DeviceConnector for UsbConnector {
    fn wait_for_arrival(
        &mut self,
        timeout: Option<Duration>,
        cancel: &AtomicBool,
    ) -> Result<Option<DeviceSession>> {
        let start = Instant::now();
        loop {
            if cancel.load(Ordering::Relaxed) {
                return Err(Error::Cancelled);
            }
            if let Some(device) = self.find()? {
                return self.open(&device).map(Some);
            }
            if timeout.map_or(false, |timeout| start.elapsed() >= timeout) {
                return Ok(None);
            }
            thread::sleep(POLL_INTERVAL);
        }
    }

    fn wait_for_removal(&mut self, timeout: Option<Duration>, cancel: &AtomicBool) -> Result<bool> {
        let start = Instant::now();
        loop {
            if cancel.load(Ordering::Relaxed) {
                return Err(Error::Cancelled);
            }
            if self.find()?.is_none() {
                return Ok(true);
            }
            if timeout.map_or(false, |timeout| start.elapsed() >= timeout) {
                return Ok(false);
            }
            thread::sleep(POLL_INTERVAL);
        }
    }
}
