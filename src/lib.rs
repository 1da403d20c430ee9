//! `forgeflash` writes arbitrary data to phones whose flash protocol only
//! accepts signed images.
//!
//! The device validates a legitimate signed header and keeps its security
//! and store parts in heap buffers. A second, fragmented header is then
//! allocated below them and overflowed upward, so the validated copies end
//! up describing hash tables and write locations chosen by the host.
//!
//! A run has the following steps:
//! 1. The requested writes are cut into chunks, deduplicated and ordered by
//! the [`planner`].
//! 2. The payloads are packed into phases that each fit one forged header,
//! see [`header`].
//! 3. For each attempt the firmware's allocations are replayed on a
//! [`heap::MemorySimulator`] and the overflow is forged from the predicted
//! [`layout`].
//! 4. The [`exploit::ExploitController`] negotiates the headers, streams the
//! payloads and searches the allocation parameters until one attempt
//! succeeds. Working parameters are cached in a [`profile`] store.

pub use bytes;
pub use rusb;

pub mod config;
pub mod error;
pub mod exploit;
pub mod ffu;
pub mod gpt;
pub mod header;
pub mod heap;
pub mod layout;
pub mod planner;
pub mod profile;
pub mod search;
pub mod session;
pub mod usb;

pub use config::ExploitConfig;
pub use error::{Error, Result};
pub use exploit::{Event, ExploitController, FlashReport};
pub use ffu::{FfuImage, FirmwareImage};
pub use planner::WritePart;
pub use profile::{
    ExploitParameters, JsonProfileStore, MemoryProfileStore, ProfileKey, ProfileStore,
};
