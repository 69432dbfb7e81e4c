//! C2 — the block device: wraps a `PhyDriver`, tracking open/present/
//! formatted state, refresh generation, and sector geometry (spec.md §4.2).

use crate::error::{DeviceError, FsError};
use crate::phy::PhyDriver;
use crate::rtos::{MutexHandle, RecursiveLock, Rtos};

/// Device lifecycle (spec.md §3.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    Closed,
    Opening,
    Open,
    Present,
    LowFormatValid,
    Closing,
}

/// `{state, size, sector_size}`, as returned by `query`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceQuery {
    pub state: DeviceState,
    pub sector_count: u32,
    pub sector_size: u16,
}

struct DeviceInner<D: PhyDriver> {
    driver: D,
    unit: u8,
    state: DeviceState,
    sector_count: u32,
    sector_size: u16,
    refresh_generation: u32,
    reference_count: u32,
}

/// A handle to an open block device. Owns the `PhyDriver`, the device-wide
/// lock (tier 3, held for the duration of any sector I/O), and the
/// recursive access lock (tier 2, for format/low-format/refresh).
pub struct Device<D: PhyDriver, R: Rtos> {
    inner: R::Mutex<DeviceInner<D>>,
    access_lock: RecursiveLock<R>,
}

impl<D: PhyDriver, R: Rtos> Device<D, R> {
    /// Opens the device by initializing the driver and populating geometry.
    pub fn open(rtos: &R, mut driver: D, unit: u8) -> Result<Self, FsError> {
        driver.open(unit).map_err(|_| DeviceError::Io)?;

        let sector_size = driver.sector_size();
        if !sector_size.is_power_of_two() || !(512..=4096).contains(&sector_size) {
            return Err(DeviceError::InvalidSectorSize.into());
        }

        let sector_count = driver.sector_count();
        if sector_count == 0 {
            return Err(DeviceError::InvalidSize.into());
        }

        let present = driver.is_present(unit);

        let inner = DeviceInner {
            driver,
            unit,
            state: if present { DeviceState::Present } else { DeviceState::Open },
            sector_count,
            sector_size,
            refresh_generation: 1,
            reference_count: 0,
        };

        Ok(Self {
            inner: rtos.new_mutex(inner),
            access_lock: RecursiveLock::new(rtos),
        })
    }

    /// Bulk sector transfer; fails with `DeviceChanged` if the caller's
    /// snapshot of the refresh generation no longer matches the device's.
    pub fn read(&self, caller_generation: u32, dest: &mut [u8], start: u32, count: u32) -> Result<(), FsError> {
        self.inner.cs(|dev| {
            if dev.refresh_generation != caller_generation {
                return Err(DeviceError::Changed.into());
            }
            if start.checked_add(count).map_or(true, |end| end > dev.sector_count) {
                return Err(DeviceError::InvalidSize.into());
            }
            dev.driver.rd(dev.unit, dest, start, count).map_err(|_| DeviceError::Io.into())
        })
    }

    pub fn write(&self, caller_generation: u32, src: &[u8], start: u32, count: u32) -> Result<(), FsError> {
        self.inner.cs(|dev| {
            if dev.refresh_generation != caller_generation {
                return Err(DeviceError::Changed.into());
            }
            if start.checked_add(count).map_or(true, |end| end > dev.sector_count) {
                return Err(DeviceError::InvalidSize.into());
            }
            dev.driver.wr(dev.unit, src, start, count).map_err(|_| DeviceError::Io.into())
        })
    }

    /// Hints that sectors are free; the driver may reclaim them.
    pub fn release(&self, start: u32, count: u32) -> Result<(), FsError> {
        self.inner.cs(|dev| {
            dev.driver.erase_block(dev.unit, start, count).map_err(|_| DeviceError::Io.into())
        })
    }

    /// Re-queries the driver for media presence. On a detected change,
    /// increments the refresh generation (fencing all stale caller
    /// snapshots) and re-reads geometry.
    pub fn refresh(&self, task: u32) -> Result<bool, FsError> {
        self.access_lock.acquire(task);
        let result = self.inner.cs(|dev| {
            let was_present = matches!(dev.state, DeviceState::Present | DeviceState::LowFormatValid);
            let now_present = dev.driver.is_present(dev.unit);

            if was_present == now_present {
                return Ok(false);
            }

            dev.refresh_generation = dev.refresh_generation.wrapping_add(1);
            dev.state = if now_present { DeviceState::Present } else { DeviceState::Open };

            if now_present {
                let sector_size = dev.driver.sector_size();
                if !sector_size.is_power_of_two() || !(512..=4096).contains(&sector_size) {
                    return Err(DeviceError::InvalidSectorSize.into());
                }
                dev.sector_size = sector_size;
                dev.sector_count = dev.driver.sector_count();
            }

            log::debug!("device unit {} media change detected, generation now {}", dev.unit, dev.refresh_generation);
            Ok(true)
        });
        self.access_lock.release(task);
        result
    }

    pub fn query(&self) -> DeviceQuery {
        self.inner.cs(|dev| DeviceQuery {
            state: dev.state,
            sector_count: dev.sector_count,
            sector_size: dev.sector_size,
        })
    }

    pub fn refresh_generation(&self) -> u32 {
        self.inner.cs(|dev| dev.refresh_generation)
    }

    pub fn sector_size(&self) -> u16 {
        self.inner.cs(|dev| dev.sector_size)
    }

    pub fn sector_count(&self) -> u32 {
        self.inner.cs(|dev| dev.sector_count)
    }

    pub fn incr_refcount(&self) {
        self.inner.cs(|dev| dev.reference_count += 1);
    }

    pub fn decr_refcount(&self) -> u32 {
        self.inner.cs(|dev| {
            dev.reference_count = dev.reference_count.saturating_sub(1);
            dev.reference_count
        })
    }

    /// Acquires the recursive access lock for format/low-format; callers
    /// must pair with `release_access`.
    pub fn acquire_access(&self, task: u32) {
        self.access_lock.acquire(task);
    }

    pub fn release_access(&self, task: u32) {
        self.access_lock.release(task);
    }

    pub fn with_driver<Ret>(&self, f: impl FnOnce(&mut D, u8) -> Ret) -> Ret {
        self.inner.cs(|dev| f(&mut dev.driver, dev.unit))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::phy::test_support::MemDriver;
    use crate::rtos::from_std::StdRtos;

    #[test]
    fn open_populates_geometry() {
        let rtos = StdRtos;
        let driver = MemDriver::new(512, 4096);
        let dev: Device<MemDriver, StdRtos> = Device::open(&rtos, driver, 0).unwrap();
        let q = dev.query();
        assert_eq!(q.sector_size, 512);
        assert_eq!(q.sector_count, 4096);
    }

    #[test]
    fn refresh_generation_bumps_on_media_change() {
        let rtos = StdRtos;
        let driver = MemDriver::new(512, 16);
        let dev: Device<MemDriver, StdRtos> = Device::open(&rtos, driver, 0).unwrap();
        let gen_before = dev.refresh_generation();

        dev.with_driver(|d, _| d.present = false);
        let changed = dev.refresh(1).unwrap();
        assert!(changed);
        assert_ne!(dev.refresh_generation(), gen_before);
    }

    #[test]
    fn read_with_stale_generation_is_rejected() {
        let rtos = StdRtos;
        let driver = MemDriver::new(512, 16);
        let dev: Device<MemDriver, StdRtos> = Device::open(&rtos, driver, 0).unwrap();
        let stale = dev.refresh_generation();

        dev.with_driver(|d, _| d.present = false);
        dev.refresh(1).unwrap();

        let mut buf = [0u8; 512];
        let err = dev.read(stale, &mut buf, 0, 1).unwrap_err();
        assert_eq!(err, FsError::Device(DeviceError::Changed));
    }
}
