//! Host-side model of the target firmware's pool allocator.
//!
//! The firmware allocates its header buffers from a page-granular pool
//! allocator that hands out memory from the top of its region downward. The
//! exploit needs to know, before touching the device, the exact distance
//! between the buffer it sends and the buffers the firmware already holds.
//! [`MemorySimulator`] replays the same allocation sequence and keeps a byte
//! image of the simulated region so forged headers can be patched in place
//! and read back out for transmission.
//!
//! Only allocations of at least one page (metadata included) are modeled.

use std::collections::BTreeMap;
use thiserror::Error;

/// Page size of the target.
pub const PAGE_SIZE: u32 = 0x1000;

/// Size of the metadata placed in front of the content of a pool allocation.
pub const POOL_HEAD_SIZE: u32 = 0x10;
/// Size of the metadata placed after the content of a pool allocation.
pub const POOL_TAIL_SIZE: u32 = 0x08;

pub const POOL_HEAD_TAG: &[u8; 4] = b"phd0";
pub const POOL_TAIL_TAG: &[u8; 4] = b"ptal";

/// Memory type recorded in pool heads (boot services data).
const POOL_MEMORY_TYPE: u32 = 4;

/// Declared size written when the metadata is deliberately deflated.
pub const DEFLATED_DECLARED_SIZE: u32 = POOL_HEAD_SIZE + POOL_TAIL_SIZE;

/// Default conceptual top of the simulated heap.
pub const DEFAULT_HEAP_TOP: u32 = 0x8000_0000;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HeapError {
    #[error("pool allocations below one page are not modeled (requested {0:#x} bytes)")]
    UnsupportedPoolSize(u32),
    #[error("invalid allocation size {0:#x}")]
    InvalidSize(u32),
    #[error("no live allocation starts at {0:#010x}")]
    UnknownAllocation(u32),
    #[error("access of {1:#x} bytes at {0:#010x} is outside the simulated heap")]
    OutOfRange(u32, usize),
    #[error("the simulated heap ran out of address space")]
    OutOfMemory,
}

/// An inclusive address range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Region {
    pub start: u32,
    pub end: u32,
}

impl Region {
    fn from_len(start: u32, len: u32) -> Self {
        Region {
            start,
            end: start + len - 1,
        }
    }

    pub fn len(&self) -> u32 {
        self.end - self.start + 1
    }

    pub fn contains(&self, addr: u32) -> bool {
        self.start <= addr && addr <= self.end
    }

    pub fn overlaps(&self, other: &Region) -> bool {
        self.start <= other.end && other.start <= self.end
    }
}

/// A block handed out by the simulator.
///
/// Page allocations carry no head or tail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Allocation {
    pub total: Region,
    pub head: Option<Region>,
    pub content: Region,
    pub tail: Option<Region>,
}

impl Allocation {
    pub fn is_pool(&self) -> bool {
        self.head.is_some()
    }

    /// The declared size the real allocator records for this block.
    pub fn true_declared_size(&self) -> u32 {
        match (self.head, self.tail) {
            (Some(head), Some(tail)) => tail.end - head.start + 1,
            _ => self.total.len(),
        }
    }
}

/// Which value to place in the declared-size fields of pool metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeclaredSize {
    /// Matches the allocator's own bookkeeping, freeing succeeds.
    True,
    /// Deflated sentinel, freeing faults inside the firmware.
    Deflated,
}

/// Deterministic replica of the target's top-down page allocator.
///
/// The state is scoped to one attempt: call [`MemorySimulator::reset`] before
/// replaying a new boot cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemorySimulator {
    /// One past the highest simulated address.
    top: u32,
    /// Lowest address backed by `buffer`.
    bottom: u32,
    /// Byte image of `[bottom, top)`.
    buffer: Vec<u8>,
    /// Live allocations keyed by their start address.
    live: BTreeMap<u32, Allocation>,
    /// Free ranges keyed by start, valued by inclusive end.
    free: BTreeMap<u32, u32>,
}

impl Default for MemorySimulator {
    fn default() -> Self {
        Self::new()
    }
}

impl MemorySimulator {
    pub fn new() -> Self {
        Self::with_top(DEFAULT_HEAP_TOP)
    }

    /// Creates a simulator whose heap starts right below `top`.
    pub fn with_top(top: u32) -> Self {
        MemorySimulator {
            top,
            bottom: top,
            buffer: Vec::new(),
            live: BTreeMap::new(),
            free: BTreeMap::new(),
        }
    }

    /// Drops every allocation, as after a fresh boot of the device.
    pub fn reset(&mut self) {
        self.bottom = self.top;
        self.buffer.clear();
        self.live.clear();
        self.free.clear();
    }

    pub fn top(&self) -> u32 {
        self.top
    }

    pub fn bottom(&self) -> u32 {
        self.bottom
    }

    pub fn live_allocations(&self) -> impl Iterator<Item = &Allocation> {
        self.live.values()
    }

    pub fn free_ranges(&self) -> impl Iterator<Item = Region> + '_ {
        self.free
            .iter()
            .map(|(&start, &end)| Region { start, end })
    }

    /// Allocates a pool block of `size` content bytes surrounded by head and
    /// tail metadata, rounded up to whole pages.
    pub fn allocate_pool(&mut self, size: u32) -> Result<Allocation, HeapError> {
        let padded = align_up(size, 8).ok_or(HeapError::InvalidSize(size))?;
        let overhead = padded
            .checked_add(POOL_HEAD_SIZE + POOL_TAIL_SIZE)
            .ok_or(HeapError::InvalidSize(size))?;
        if overhead < PAGE_SIZE {
            return Err(HeapError::UnsupportedPoolSize(size));
        }
        let total_len = align_up(overhead, PAGE_SIZE).ok_or(HeapError::InvalidSize(size))?;
        let start = self.place(total_len)?;

        let head = Region::from_len(start, POOL_HEAD_SIZE);
        let content = Region::from_len(head.end + 1, size);
        let tail = Region::from_len(head.end + 1 + padded, POOL_TAIL_SIZE);
        let allocation = Allocation {
            total: Region::from_len(start, total_len),
            head: Some(head),
            content,
            tail: Some(tail),
        };
        self.live.insert(start, allocation);
        self.write_pool_metadata(&allocation, DeclaredSize::True)?;

        tracing::debug!(
            "pool of {:#x} bytes at {:#010x}..={:#010x}",
            size,
            allocation.total.start,
            allocation.total.end
        );
        Ok(allocation)
    }

    /// Allocates `size` bytes rounded up to whole pages, without metadata.
    pub fn allocate_pages(&mut self, size: u32) -> Result<Allocation, HeapError> {
        if size == 0 {
            return Err(HeapError::InvalidSize(size));
        }
        let total_len = align_up(size, PAGE_SIZE).ok_or(HeapError::InvalidSize(size))?;
        let start = self.place(total_len)?;
        let allocation = Allocation {
            total: Region::from_len(start, total_len),
            head: None,
            content: Region::from_len(start, size),
            tail: None,
        };
        self.live.insert(start, allocation);

        tracing::debug!("{:#x} bytes of pages at {:#010x}", size, start);
        Ok(allocation)
    }

    /// Releases a pool allocation.
    pub fn free_pool(&mut self, allocation: &Allocation) -> Result<(), HeapError> {
        self.release(allocation)
    }

    /// Releases a page allocation.
    pub fn free_pages(&mut self, allocation: &Allocation) -> Result<(), HeapError> {
        self.release(allocation)
    }

    /// Rewrites the head and tail of a pool allocation.
    ///
    /// Page allocations have no metadata and are left untouched.
    pub fn write_pool_metadata(
        &mut self,
        allocation: &Allocation,
        declared: DeclaredSize,
    ) -> Result<(), HeapError> {
        let (head, tail) = match (allocation.head, allocation.tail) {
            (Some(head), Some(tail)) => (head, tail),
            _ => return Ok(()),
        };
        let size = match declared {
            DeclaredSize::True => allocation.true_declared_size(),
            DeclaredSize::Deflated => DEFLATED_DECLARED_SIZE,
        };

        let mut raw = [0u8; POOL_HEAD_SIZE as usize];
        raw[0..4].copy_from_slice(POOL_HEAD_TAG);
        raw[4..8].copy_from_slice(&size.to_le_bytes());
        raw[8..12].copy_from_slice(&POOL_MEMORY_TYPE.to_le_bytes());
        self.write(head.start, &raw)?;

        let mut raw = [0u8; POOL_TAIL_SIZE as usize];
        raw[0..4].copy_from_slice(POOL_TAIL_TAG);
        raw[4..8].copy_from_slice(&size.to_le_bytes());
        self.write(tail.start, &raw)
    }

    pub fn write(&mut self, addr: u32, data: &[u8]) -> Result<(), HeapError> {
        let offset = self.offset_of(addr, data.len())?;
        self.buffer[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }

    pub fn write_u32(&mut self, addr: u32, value: u32) -> Result<(), HeapError> {
        self.write(addr, &value.to_le_bytes())
    }

    pub fn read(&self, addr: u32, len: usize) -> Result<Vec<u8>, HeapError> {
        let offset = self.offset_of(addr, len)?;
        Ok(self.buffer[offset..offset + len].to_vec())
    }

    pub fn read_u32(&self, addr: u32) -> Result<u32, HeapError> {
        let raw = self.read(addr, 4)?;
        Ok(u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]))
    }

    fn offset_of(&self, addr: u32, len: usize) -> Result<usize, HeapError> {
        let end = addr as u64 + len as u64;
        if addr < self.bottom || end > self.top as u64 {
            return Err(HeapError::OutOfRange(addr, len));
        }
        Ok((addr - self.bottom) as usize)
    }

    /// Picks the start address of a new block of `len` bytes.
    fn place(&mut self, len: u32) -> Result<u32, HeapError> {
        // First fit, scanning free ranges from the highest address down.
        let fit = self
            .free
            .iter()
            .rev()
            .find(|&(&start, &end)| end - start + 1 >= len)
            .map(|(&start, &end)| (start, end));
        if let Some((start, end)) = fit {
            let block = end + 1 - len;
            self.free.remove(&start);
            if block > start {
                self.free.insert(start, block - 1);
            }
            return Ok(block);
        }

        // Nothing fits: stack the block right below the lowest live block.
        let floor = self.live.keys().next().copied().unwrap_or(self.top);
        let block = floor.checked_sub(len).ok_or(HeapError::OutOfMemory)?;

        // Free space below the floor is swallowed by the new block.
        let swallowed: Vec<(u32, u32)> = self
            .free
            .range(..floor)
            .filter(|&(_, &end)| end >= block)
            .map(|(&start, &end)| (start, end))
            .collect();
        for (start, _) in swallowed {
            self.free.remove(&start);
            if start < block {
                self.free.insert(start, block - 1);
            }
        }

        if block < self.bottom {
            let shortfall = (self.bottom - block) as usize;
            let mut grown = vec![0u8; shortfall + self.buffer.len()];
            grown[shortfall..].copy_from_slice(&self.buffer);
            self.buffer = grown;
            self.bottom = block;
        }
        Ok(block)
    }

    fn release(&mut self, allocation: &Allocation) -> Result<(), HeapError> {
        let start = allocation.total.start;
        match self.live.get(&start) {
            Some(live) if live == allocation => {}
            _ => return Err(HeapError::UnknownAllocation(start)),
        }
        self.live.remove(&start);

        let mut start = start;
        let mut end = allocation.total.end;
        // Coalesce with the range right below.
        let below = self
            .free
            .range(..start)
            .next_back()
            .filter(|&(_, &e)| e + 1 == start)
            .map(|(&s, _)| s);
        if let Some(below) = below {
            self.free.remove(&below);
            start = below;
        }
        // And with the one right above.
        if let Some(above_end) = end.checked_add(1).and_then(|above| self.free.remove(&above)) {
            end = above_end;
        }
        self.free.insert(start, end);
        Ok(())
    }
}

/// Rounds `value` up to a multiple of `align`, which must be a power of two.
pub fn align_up(value: u32, align: u32) -> Option<u32> {
    value
        .checked_add(align - 1)
        .map(|v| v & !(align - 1))
}
