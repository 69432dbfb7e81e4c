//! C1 — the buffer pool: a fixed count of sector-sized byte buffers shared
//! by every layer above it (cache, volume, syscall layer).

use crate::error::{FsError, ResourceError};
use crate::phy::{SectorBuf, MAX_SECTOR_SIZE};

/// A handle to one buffer taken from the pool. Callers return it to the
/// pool explicitly via [`BufferPool::release`] — the cache holds these
/// across calls and manages their lifetime by hand.
pub struct BufferHandle {
    idx: usize,
    pub owning_volume: Option<u8>,
}

impl BufferHandle {
    pub fn index(&self) -> usize {
        self.idx
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Slot {
    Free,
    Taken,
}

/// A fixed-count pool of `SIZE`-sector buffers. Reentrant under the device
/// lock (§4.1): callers hold no ordering guarantee between waiters, so the
/// design leans on callers pre-reserving buffers before entering tight paths
/// rather than queuing.
pub struct BufferPool<const N: usize> {
    bufs: [SectorBuf; N],
    slots: [Slot; N],
}

impl<const N: usize> BufferPool<N> {
    pub fn new() -> Self {
        Self {
            bufs: core::array::from_fn(|_| SectorBuf::default()),
            slots: [Slot::Free; N],
        }
    }

    /// Acquires one buffer, tagging it with the owning volume. First-fit over
    /// the fixed-size slot array; no ordering is promised between
    /// contending callers.
    pub fn get(&mut self, owning_volume: u8) -> Result<BufferHandle, FsError> {
        for (idx, slot) in self.slots.iter_mut().enumerate() {
            if *slot == Slot::Free {
                *slot = Slot::Taken;
                return Ok(BufferHandle { idx, owning_volume: Some(owning_volume) });
            }
        }
        Err(ResourceError::PoolEmpty.into())
    }

    /// Returns the buffer to the pool. In debug builds the contents are
    /// zeroed first so stale data can't leak into the next borrower.
    pub fn release(&mut self, handle: BufferHandle) {
        #[cfg(debug_assertions)]
        {
            self.bufs[handle.idx].fill(0);
        }
        self.slots[handle.idx] = Slot::Free;
    }

    pub fn data(&self, handle: &BufferHandle) -> &[u8] {
        &self.bufs[handle.idx]
    }

    pub fn data_mut(&mut self, handle: &BufferHandle) -> &mut [u8] {
        &mut self.bufs[handle.idx]
    }

    pub fn capacity(&self) -> usize {
        N
    }

    pub fn free_count(&self) -> usize {
        self.slots.iter().filter(|s| **s == Slot::Free).count()
    }
}

impl<const N: usize> Default for BufferPool<N> {
    fn default() -> Self {
        Self::new()
    }
}

const _: () = assert!(MAX_SECTOR_SIZE == 4096);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_release_round_trip() {
        let mut pool: BufferPool<2> = BufferPool::new();
        let a = pool.get(0).unwrap();
        let b = pool.get(0).unwrap();
        assert!(pool.get(0).is_err());
        pool.release(a);
        let _c = pool.get(0).unwrap();
        pool.release(b);
    }
}
