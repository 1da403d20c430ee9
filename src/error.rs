//! Error types shared by the exploit engine and its collaborators.
//!
//! Messages are phrased to follow a "Failed" status title, e.g.
//! `Failed to read the firmware image: ...`.

use crate::{
    ffu::ImageError, gpt::GptError, heap::HeapError, planner::InputError,
    profile::ProfileError, session::DeviceMode,
};
use thiserror::Error;

/// Convenient `Result` alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum Error {
    /// The device answered a command with a non-zero status.
    #[error("because the device rejected {command} with status {status:#06x}.")]
    Protocol { command: &'static str, status: u16 },
    /// The device vanished from the bus in the middle of a command.
    #[error("because the device disconnected.")]
    ConnectionLost,
    #[error("because the device came back in {observed} mode instead of {expected} mode.")]
    UnexpectedMode {
        observed: DeviceMode,
        expected: DeviceMode,
    },
    #[error("due to invalid input: {0}")]
    Input(#[from] InputError),
    #[error("to simulate the device heap: {0}")]
    Heap(#[from] HeapError),
    #[error("to read the firmware image: {0}")]
    Image(#[from] ImageError),
    #[error("to handle the partition table: {0}")]
    Gpt(#[from] GptError),
    #[error("to access the profile store: {0}")]
    Profile(#[from] ProfileError),
    #[error("because the device does not support {0}.")]
    UnsupportedDevice(&'static str),
    #[error("because payload {index} needs {needed:#x} bytes but a header holds {capacity:#x}.")]
    PayloadTooBig {
        index: usize,
        needed: usize,
        capacity: usize,
    },
    #[error("because no parameter candidate worked after {attempts} attempts.")]
    Exhausted { attempts: u32 },
    #[error("because the operation was cancelled.")]
    Cancelled,
    #[error("due to an I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("due an unknown usb error: {0}")]
    Usb(#[from] rusb::Error),
}

impl Error {
    /// Returns whether the error is the device dropping off the bus, which
    /// the exploit deliberately provokes.
    pub fn is_disconnect(&self) -> bool {
        matches!(self, Error::ConnectionLost | Error::Usb(rusb::Error::NoDevice))
    }
}
