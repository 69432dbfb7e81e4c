//! The `PhyDriver` collaborator (spec.md §6.4): NAND/NOR/SD physical-layer
//! drivers, ECC, and sector translation are consumed through this interface
//! only — none of that logic lives in this crate.

use generic_array::GenericArray;
use typenum::consts::U4096;

/// The largest sector size this crate supports (spec.md §3.1: 512..4096,
/// power of two). Every sector buffer in the crate is a `GenericArray`
/// sized to this constant; drivers with a smaller logical sector size use
/// only a leading slice of it.
pub type MaxSectorSize = U4096;
pub const MAX_SECTOR_SIZE: usize = 4096;

pub type SectorBuf = GenericArray<u8, MaxSectorSize>;

/// Operations the core invokes on a physical driver. Implementors translate
/// these into NAND/NOR/SD commands, ECC checks, and wear-leveling as
/// appropriate for their medium; none of that is this crate's concern.
pub trait PhyDriver {
    type Error: core::fmt::Debug;

    fn open(&mut self, unit: u8) -> Result<(), Self::Error>;
    fn close(&mut self, unit: u8) -> Result<(), Self::Error>;

    /// Reads `count` sectors starting at `start_sector` into `dest`, which
    /// must be exactly `count * sector_size()` bytes.
    fn rd(&mut self, unit: u8, dest: &mut [u8], start_sector: u32, count: u32) -> Result<(), Self::Error>;

    /// Writes `count` sectors starting at `start_sector` from `src`, which
    /// must be exactly `count * sector_size()` bytes.
    fn wr(&mut self, unit: u8, src: &[u8], start_sector: u32, count: u32) -> Result<(), Self::Error>;

    /// Hints that sectors in this range are no longer live (FAT semantics:
    /// the driver may reclaim the underlying blocks).
    fn erase_block(&mut self, unit: u8, start: u32, size: u32) -> Result<(), Self::Error>;

    /// Driver-specific out-of-band control, e.g. querying ECC status.
    fn io_ctrl(&mut self, unit: u8, opcode: u16, buf: &mut [u8]) -> Result<(), Self::Error>;

    /// Polls until the device reports it is no longer busy, or returns
    /// `Err` once `timeout_us` has elapsed (a distinguished timeout, not
    /// necessarily the same `Error` variant as an I/O failure).
    fn wait_while_busy(&mut self, unit: u8, timeout_us: u32) -> Result<(), Self::Error>;

    /// Bytes per sector; must be a power of two in `512..=4096`.
    fn sector_size(&self) -> u16;

    /// Total number of addressable sectors on the medium.
    fn sector_count(&self) -> u32;

    /// Whether the medium is currently inserted/present (for removable
    /// media; always `true` for fixed media).
    fn is_present(&mut self, unit: u8) -> bool {
        let _ = unit;
        true
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    //! An in-memory `PhyDriver` used across the crate's unit and integration
    //! tests, mirroring the teacher's `FileBackedStorage` test harness but
    //! backed by a `Vec<u8>` instead of a real file descriptor.

    extern crate std;

    use super::PhyDriver;
    use std::vec::Vec;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MemError;

    pub struct MemDriver {
        pub sector_size: u16,
        pub sectors: Vec<u8>,
        pub present: bool,
    }

    impl MemDriver {
        pub fn new(sector_size: u16, sector_count: u32) -> Self {
            Self {
                sector_size,
                sectors: std::vec![0u8; sector_size as usize * sector_count as usize],
                present: true,
            }
        }
    }

    impl PhyDriver for MemDriver {
        type Error = MemError;

        fn open(&mut self, _unit: u8) -> Result<(), Self::Error> {
            Ok(())
        }

        fn close(&mut self, _unit: u8) -> Result<(), Self::Error> {
            Ok(())
        }

        fn rd(&mut self, _unit: u8, dest: &mut [u8], start_sector: u32, count: u32) -> Result<(), Self::Error> {
            let start = start_sector as usize * self.sector_size as usize;
            let len = count as usize * self.sector_size as usize;
            if start + len > self.sectors.len() {
                return Err(MemError);
            }
            dest[..len].copy_from_slice(&self.sectors[start..start + len]);
            Ok(())
        }

        fn wr(&mut self, _unit: u8, src: &[u8], start_sector: u32, count: u32) -> Result<(), Self::Error> {
            let start = start_sector as usize * self.sector_size as usize;
            let len = count as usize * self.sector_size as usize;
            if start + len > self.sectors.len() {
                return Err(MemError);
            }
            self.sectors[start..start + len].copy_from_slice(&src[..len]);
            Ok(())
        }

        fn erase_block(&mut self, _unit: u8, start: u32, size: u32) -> Result<(), Self::Error> {
            let start = start as usize * self.sector_size as usize;
            let len = size as usize * self.sector_size as usize;
            if start + len > self.sectors.len() {
                return Err(MemError);
            }
            self.sectors[start..start + len].fill(0);
            Ok(())
        }

        fn io_ctrl(&mut self, _unit: u8, _opcode: u16, _buf: &mut [u8]) -> Result<(), Self::Error> {
            Ok(())
        }

        fn wait_while_busy(&mut self, _unit: u8, _timeout_us: u32) -> Result<(), Self::Error> {
            Ok(())
        }

        fn sector_size(&self) -> u16 {
            self.sector_size
        }

        fn sector_count(&self) -> u32 {
            (self.sectors.len() / self.sector_size as usize) as u32
        }

        fn is_present(&mut self, _unit: u8) -> bool {
            self.present
        }
    }
}
