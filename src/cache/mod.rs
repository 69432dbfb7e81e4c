//! C4 — the per-volume typed sector cache (spec.md §4.4).
//!
//! Buffers are split into three disjoint pools — management, directory,
//! file — sized proportionally to configured percentages. Replacement
//! within a pool is round-robin over that pool's buffer indices, matching
//! the teacher's `CacheEntry` state machine (`fat/cache.rs`) generalized
//! from a single untyped pool to the spec's three typed ones.

use crate::error::{CacheError, FsError};
use crate::phy::{SectorBuf, MAX_SECTOR_SIZE};

/// The three typed sector pools (spec.md §4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SectorType {
    Management,
    Directory,
    File,
}

/// Write policy (spec.md §4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheMode {
    ReadOnly,
    WriteThrough,
    WriteBack,
}

/// Anything the cache can read from / write through to on a miss or flush.
/// The volume layer implements this (translating cache-relative sectors
/// through the partition offset) so the cache itself stays device-agnostic.
pub trait SectorIo {
    fn read_sectors(&self, dest: &mut [u8], start: u32, count: u32) -> Result<(), FsError>;
    fn write_sectors(&self, src: &[u8], start: u32, count: u32) -> Result<(), FsError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Free,
    Clean(u32),
    Dirty(u32),
}

struct Slot {
    state: SlotState,
    data: SectorBuf,
}

impl Slot {
    fn sector(&self) -> Option<u32> {
        match self.state {
            SlotState::Clean(s) | SlotState::Dirty(s) => Some(s),
            SlotState::Free => None,
        }
    }
}

struct Pool {
    /// Indices into the cache's flat `slots` array that belong to this pool.
    range: core::ops::Range<usize>,
    /// Round-robin cursor for eviction, relative to `range.start`.
    cursor: usize,
}

impl Pool {
    fn find(&self, slots: &[Slot], sector: u32) -> Option<usize> {
        slots[self.range.clone()]
            .iter()
            .position(|s| s.sector() == Some(sector))
            .map(|i| i + self.range.start)
    }

    fn find_free(&self, slots: &[Slot]) -> Option<usize> {
        slots[self.range.clone()]
            .iter()
            .position(|s| matches!(s.state, SlotState::Free))
            .map(|i| i + self.range.start)
    }

    /// Picks the slot to reuse for a fresh insertion, advancing the
    /// round-robin cursor. Never called when `find_free` would have
    /// succeeded.
    fn evict_candidate(&mut self) -> usize {
        let idx = self.range.start + self.cursor;
        self.cursor = (self.cursor + 1) % self.range.len();
        idx
    }
}

/// The typed sector cache for one volume. `N` is the total buffer count;
/// `pct_mgmt`/`pct_dir` (the file pool gets the remainder) determine the
/// split at construction time.
pub struct SectorCache<const N: usize> {
    slots: [Slot; N],
    mgmt: Pool,
    dir: Pool,
    file: Pool,
    mode: CacheMode,
    sector_size: u16,
}

impl<const N: usize> SectorCache<N> {
    pub fn new(sector_size: u16, pct_mgmt: u8, pct_dir: u8, mode: CacheMode) -> Result<Self, FsError> {
        if pct_mgmt as u32 + pct_dir as u32 > 100 {
            return Err(CacheError::InvalidMode.into());
        }

        let mgmt_count = (N * pct_mgmt as usize) / 100;
        let dir_count = (N * pct_dir as usize) / 100;
        let file_count = N - mgmt_count - dir_count;

        if mgmt_count == 0 || dir_count == 0 || file_count == 0 {
            return Err(CacheError::TooSmall.into());
        }

        Ok(Self {
            slots: core::array::from_fn(|_| Slot { state: SlotState::Free, data: SectorBuf::default() }),
            mgmt: Pool { range: 0..mgmt_count, cursor: 0 },
            dir: Pool { range: mgmt_count..(mgmt_count + dir_count), cursor: 0 },
            file: Pool { range: (mgmt_count + dir_count)..N, cursor: 0 },
            mode,
            sector_size,
        })
    }

    fn pool(&mut self, t: SectorType) -> &mut Pool {
        match t {
            SectorType::Management => &mut self.mgmt,
            SectorType::Directory => &mut self.dir,
            SectorType::File => &mut self.file,
        }
    }

    fn pool_ref(&self, t: SectorType) -> &Pool {
        match t {
            SectorType::Management => &self.mgmt,
            SectorType::Directory => &self.dir,
            SectorType::File => &self.file,
        }
    }

    /// Flushes a single dirty slot through `io`, if it is in fact dirty.
    fn flush_slot(&mut self, idx: usize, io: &dyn SectorIo) -> Result<(), FsError> {
        if let SlotState::Dirty(sector) = self.slots[idx].state {
            io.write_sectors(&self.slots[idx].data[..self.sector_size as usize], sector, 1)?;
            self.slots[idx].state = SlotState::Clean(sector);
        }
        Ok(())
    }

    /// Inserts (or refreshes) a clean sector into `t`'s pool, evicting (and,
    /// if dirty, flushing) an existing entry if no free slot remains. A slot
    /// that already holds the target sector is updated in place without
    /// advancing the round-robin cursor (spec.md §4.4 edge policy).
    fn place(&mut self, t: SectorType, sector: u32, data: &[u8], io: &dyn SectorIo) -> Result<usize, FsError> {
        if let Some(idx) = self.pool_ref(t).find(&self.slots, sector) {
            self.slots[idx].data[..data.len()].copy_from_slice(data);
            return Ok(idx);
        }

        let idx = if let Some(idx) = self.pool_ref(t).find_free(&self.slots) {
            idx
        } else {
            let idx = self.pool(t).evict_candidate();
            self.flush_slot(idx, io)?;
            idx
        };

        self.slots[idx].data[..data.len()].copy_from_slice(data);
        self.slots[idx].state = SlotState::Clean(sector);
        Ok(idx)
    }

    /// Reads `count` sectors of type `t` starting at `start` into `dest`,
    /// coalescing misses into contiguous device reads.
    pub fn read(&mut self, io: &dyn SectorIo, dest: &mut [u8], start: u32, count: u32, t: SectorType) -> Result<(), FsError> {
        let ss = self.sector_size as usize;
        let mut i = 0u32;
        while i < count {
            let sector = start + i;
            if let Some(idx) = self.pool_ref(t).find(&self.slots, sector) {
                dest[(i as usize) * ss..(i as usize + 1) * ss].copy_from_slice(&self.slots[idx].data[..ss]);
                i += 1;
                continue;
            }

            // Coalesce a contiguous run of misses.
            let run_start = i;
            let mut run_len = 0u32;
            while run_start + run_len < count
                && self.pool_ref(t).find(&self.slots, start + run_start + run_len).is_none()
            {
                run_len += 1;
            }

            let chunk = &mut dest[(run_start as usize) * ss..((run_start + run_len) as usize) * ss];
            io.read_sectors(chunk, start + run_start, run_len)?;

            for j in 0..run_len {
                let sector = start + run_start + j;
                let data = chunk[(j as usize) * ss..(j as usize + 1) * ss].to_vec_like(ss);
                self.place(t, sector, &data, io)?;
            }

            i = run_start + run_len;
        }
        Ok(())
    }

    /// Writes `count` sectors of type `t` starting at `start` from `src`.
    /// In `ReadOnly` mode, writes go straight to the device and any cached
    /// copy is invalidated. In `WriteThrough` mode, the cache is updated and
    /// the write is issued immediately. In `WriteBack` mode, the affected
    /// slots are marked dirty; the underlying write happens on eviction,
    /// explicit flush, or unmount.
    pub fn write(&mut self, io: &dyn SectorIo, src: &[u8], start: u32, count: u32, t: SectorType) -> Result<(), FsError> {
        let ss = self.sector_size as usize;

        match self.mode {
            CacheMode::ReadOnly => {
                io.write_sectors(src, start, count)?;
                for i in 0..count {
                    let sector = start + i;
                    if let Some(idx) = self.pool_ref(t).find(&self.slots, sector) {
                        self.slots[idx].state = SlotState::Free;
                    }
                }
                Ok(())
            }
            CacheMode::WriteThrough => {
                for i in 0..count {
                    let sector = start + i;
                    let chunk = &src[(i as usize) * ss..(i as usize + 1) * ss];
                    self.place(t, sector, chunk, io)?;
                }
                io.write_sectors(src, start, count)
            }
            CacheMode::WriteBack => {
                for i in 0..count {
                    let sector = start + i;
                    let chunk = &src[(i as usize) * ss..(i as usize + 1) * ss];
                    let idx = self.place(t, sector, chunk, io)?;
                    self.slots[idx].state = SlotState::Dirty(sector);
                }
                Ok(())
            }
        }
    }

    /// Drops any cached copy of sectors in `start..start+count` from all
    /// three pools (the sector is now free on the device).
    pub fn release(&mut self, start: u32, count: u32) {
        for slot in &mut self.slots {
            if let Some(s) = slot.sector() {
                if s >= start && s < start + count {
                    slot.state = SlotState::Free;
                }
            }
        }
    }

    /// Marks every buffer free without writing dirty contents back — used
    /// when the underlying data is known superseded (e.g. post-format).
    pub fn invalidate(&mut self) {
        for slot in &mut self.slots {
            slot.state = SlotState::Free;
        }
    }

    /// Writes every dirty buffer and clears its dirty flag. A no-op in
    /// `WriteThrough`/`ReadOnly` modes, where nothing is ever left dirty.
    pub fn flush(&mut self, io: &dyn SectorIo) -> Result<(), FsError> {
        if matches!(self.mode, CacheMode::ReadOnly | CacheMode::WriteThrough) {
            return Ok(());
        }
        for idx in 0..N {
            self.flush_slot(idx, io)?;
        }
        Ok(())
    }

    pub fn mode(&self) -> CacheMode {
        self.mode
    }
}

/// Tiny helper so `read`'s coalesced-run loop can build an owned chunk
/// without pulling in `alloc` — backed by a stack array bounded by the
/// largest supported sector size.
trait ToVecLike {
    fn to_vec_like(&self, len: usize) -> [u8; MAX_SECTOR_SIZE];
}

impl ToVecLike for [u8] {
    fn to_vec_like(&self, len: usize) -> [u8; MAX_SECTOR_SIZE] {
        let mut out = [0u8; MAX_SECTOR_SIZE];
        out[..len].copy_from_slice(&self[..len]);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::cell::RefCell;

    struct MemIo {
        sectors: RefCell<std::vec::Vec<[u8; 512]>>,
    }

    impl MemIo {
        fn new(n: usize) -> Self {
            Self { sectors: RefCell::new(vec![[0u8; 512]; n]) }
        }
    }

    impl SectorIo for MemIo {
        fn read_sectors(&self, dest: &mut [u8], start: u32, count: u32) -> Result<(), FsError> {
            let sectors = self.sectors.borrow();
            for i in 0..count {
                let s = &sectors[(start + i) as usize];
                dest[(i as usize) * 512..(i as usize + 1) * 512].copy_from_slice(s);
            }
            Ok(())
        }

        fn write_sectors(&self, src: &[u8], start: u32, count: u32) -> Result<(), FsError> {
            let mut sectors = self.sectors.borrow_mut();
            for i in 0..count {
                sectors[(start + i) as usize].copy_from_slice(&src[(i as usize) * 512..(i as usize + 1) * 512]);
            }
            Ok(())
        }
    }

    #[test]
    fn eviction_replaces_oldest_inserted_management_buffer() {
        // S4 from spec.md §8: 2 management buffers, sectors 10, 20, 30.
        let io = MemIo::new(64);
        let mut cache: SectorCache<6> = SectorCache::new(512, 34, 33, CacheMode::WriteThrough).unwrap();
        // With N=6 and 34%/33%, mgmt gets 2 slots, dir gets 1, file gets 3 — matches the scenario's "2 management buffers".

        let mut buf = [0u8; 512];
        cache.read(&io, &mut buf, 10, 1, SectorType::Management).unwrap();
        cache.read(&io, &mut buf, 20, 1, SectorType::Management).unwrap();
        cache.read(&io, &mut buf, 30, 1, SectorType::Management).unwrap();

        assert!(cache.mgmt.find(&cache.slots, 30).is_some());
        assert!(cache.mgmt.find(&cache.slots, 20).is_some());
        assert!(cache.mgmt.find(&cache.slots, 10).is_none());
    }

    #[test]
    fn write_back_marks_dirty_and_flush_persists() {
        let io = MemIo::new(64);
        let mut cache: SectorCache<4> = SectorCache::new(512, 25, 25, CacheMode::WriteBack).unwrap();

        let data = [0xAAu8; 512];
        cache.write(&io, &data, 5, 1, SectorType::File).unwrap();

        // Not yet on the "device".
        let mut readback = [0u8; 512];
        io.read_sectors(&mut readback, 5, 1).unwrap();
        assert_ne!(readback[0], 0xAA);

        cache.flush(&io).unwrap();
        io.read_sectors(&mut readback, 5, 1).unwrap();
        assert_eq!(readback[0], 0xAA);
    }
}
