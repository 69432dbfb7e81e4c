//! C0 — the top-level filesystem context (spec.md §4.0): the single object
//! an embedding application constructs once at init time, owning the device
//! table, the shared buffer pool, and the file/dir handle arenas every
//! mounted volume draws from.
//!
//! Nothing in the teacher plays this role: `FatFs` was built fresh on every
//! call from a borrowed `&mut Storage`, with no shared device registry or
//! handle pool at all. This follows the shape `Volume` and `Device` already
//! use — a struct assembled once over const-generic capacities — rather than
//! introducing a different construction style at the top of the stack.

use crate::cache::CacheMode;
use crate::device::Device;
use crate::error::{FsError, ResourceError, VolumeError};
use crate::handle::dir::DirHandle;
use crate::handle::file::FileHandle;
use crate::handle::Arena;
use crate::phy::PhyDriver;
use crate::rtos::{MutexHandle, Rtos};
use crate::volume::{AccessMode, Volume};

/// Tunables gathered at init time (spec.md §4.1c). There is no setter: a
/// configuration change means tearing the `Filesystem` down and building a
/// new one, the same way `Volume::open` takes its `cache_mode` once and
/// never revisits it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FsConfig {
    /// Percentage of each volume's sector cache reserved for management
    /// sectors (BPB/FSINFO/FAT). The remainder splits between the
    /// directory and file pools per `dir_cache_percent` and whatever's
    /// left (spec.md §4.4).
    pub mgmt_cache_percent: u8,
    pub dir_cache_percent: u8,
    pub cache_mode: CacheMode,
    pub long_names: bool,
    pub journal: bool,
    pub advisory_locks: bool,
    /// Whether a second `file_open` against an already-open name is
    /// rejected (`FileError::AlreadyOpen`) or allowed to alias the same
    /// on-disk entry through independent handles (spec.md §4.8
    /// `file_open`, §9 "Open Questions").
    pub allow_concurrent_open: bool,
}

impl Default for FsConfig {
    fn default() -> Self {
        Self {
            mgmt_cache_percent: 25,
            dir_cache_percent: 25,
            cache_mode: CacheMode::WriteThrough,
            long_names: cfg!(feature = "long-names"),
            journal: cfg!(feature = "journal"),
            advisory_locks: cfg!(feature = "advisory-locks"),
            allow_concurrent_open: true,
        }
    }
}

/// The shared runtime state an embedding application builds once (spec.md
/// §4.0). Generic over the `PhyDriver` every registered device shares, the
/// host `Rtos`, and four capacities: device slots, open files, open
/// directories, and — since `sys::file_open` ties one buffer to each open
/// file handle (spec.md §4.9a) — the file buffer pool shares `MAX_FILES`
/// rather than taking a capacity of its own.
///
/// Deliberately does *not* also hold a table of mounted [`Volume`]s:
/// `Volume<'d, D, R>` borrows the `Device` it was opened against, and a
/// sibling field borrowing another field of the same struct isn't
/// expressible in safe Rust. [`Filesystem::mount`] hands back an owned
/// `Volume<'_, D, R>` instead, for the caller to hold however suits them —
/// a local variable, or a [`VolumeTable`] alongside this `Filesystem`.
pub struct Filesystem<D: PhyDriver, R: Rtos, const MAX_DEVICES: usize, const MAX_FILES: usize, const MAX_DIRS: usize> {
    rtos: R,
    config: FsConfig,
    registry_lock: R::Mutex<()>,
    devices: R::Mutex<[Option<Device<D, R>>; MAX_DEVICES]>,
    files: R::Mutex<Arena<FileHandle, MAX_FILES>>,
    dirs: R::Mutex<Arena<DirHandle, MAX_DIRS>>,
    buffers: R::Mutex<crate::buffer::BufferPool<MAX_FILES>>,
}

impl<D: PhyDriver, R: Rtos, const MAX_DEVICES: usize, const MAX_FILES: usize, const MAX_DIRS: usize>
    Filesystem<D, R, MAX_DEVICES, MAX_FILES, MAX_DIRS>
{
    pub fn new(rtos: R, config: FsConfig) -> Self {
        let registry_lock = rtos.new_mutex(());
        let devices = rtos.new_mutex(core::array::from_fn(|_| None));
        let files = rtos.new_mutex(Arena::new());
        let dirs = rtos.new_mutex(Arena::new());
        let buffers = rtos.new_mutex(crate::buffer::BufferPool::new());
        Self { rtos, config, registry_lock, devices, files, dirs, buffers }
    }

    pub fn config(&self) -> &FsConfig {
        &self.config
    }

    pub fn rtos(&self) -> &R {
        &self.rtos
    }

    /// Opens `driver` as unit `unit` and registers it in the first free
    /// device slot, returning the slot index callers pass to
    /// [`Filesystem::mount`]/[`Filesystem::device`].
    pub fn register_device(&self, driver: D, unit: u8) -> Result<usize, FsError> {
        let device = Device::open(&self.rtos, driver, unit)?;
        self.registry_lock.cs(|_| {
            self.devices.cs(|slots| {
                for (idx, slot) in slots.iter_mut().enumerate() {
                    if slot.is_none() {
                        *slot = Some(device);
                        return Ok(idx);
                    }
                }
                Err(ResourceError::MemoryExhausted.into())
            })
        })
    }

    /// Runs `func` with the registered device at `slot`, failing with
    /// `ResourceError::MemoryExhausted` if the slot is empty — there is no
    /// `DeviceError` variant for "never registered", since that's a
    /// resource-table condition, not a device-I/O one.
    pub fn with_device<Ret>(&self, slot: usize, func: impl FnOnce(&Device<D, R>) -> Ret) -> Result<Ret, FsError> {
        self.devices.cs(|slots| {
            let device = slots.get(slot).and_then(|s| s.as_ref()).ok_or(ResourceError::MemoryExhausted)?;
            Ok(func(device))
        })
    }

    /// Removes and drops the device registered at `slot`. Fails with
    /// `VolumeError::FilesOpen`-shaped callers' own bookkeeping is expected
    /// to have already closed every volume/handle backed by this device;
    /// this call itself has no visibility into open `Volume`s, since those
    /// live outside the `Filesystem`.
    pub fn unregister_device(&self, slot: usize) -> Result<(), FsError> {
        self.registry_lock.cs(|_| {
            self.devices.cs(|slots| {
                let entry = slots.get_mut(slot).ok_or(ResourceError::MemoryExhausted)?;
                if entry.is_none() {
                    return Err(ResourceError::MemoryExhausted.into());
                }
                *entry = None;
                Ok(())
            })
        })
    }

    pub fn with_files<Ret>(&self, func: impl FnOnce(&mut Arena<FileHandle, MAX_FILES>) -> Ret) -> Ret {
        self.files.cs(func)
    }

    pub fn with_dirs<Ret>(&self, func: impl FnOnce(&mut Arena<DirHandle, MAX_DIRS>) -> Ret) -> Ret {
        self.dirs.cs(func)
    }

    pub fn with_buffers<Ret>(&self, func: impl FnOnce(&mut crate::buffer::BufferPool<MAX_FILES>) -> Ret) -> Ret {
        self.buffers.cs(func)
    }

    pub fn open_file_count(&self) -> usize {
        self.files.cs(|a| a.len())
    }

    pub fn open_dir_count(&self) -> usize {
        self.dirs.cs(|a| a.len())
    }
}

/// Owns the `Volume`s an application has mounted against a [`Filesystem`]'s
/// registered devices. Kept as a sibling value (not a field of
/// `Filesystem` itself) purely to sidestep the self-reference described on
/// [`Filesystem`]; nothing about its own shape is otherwise special — it's
/// the same fixed-capacity `Option` array every other table in this crate
/// uses.
pub struct VolumeTable<'d, D: PhyDriver, R: Rtos, const N: usize> {
    slots: [Option<Volume<'d, D, R>>; N],
}

impl<'d, D: PhyDriver, R: Rtos, const N: usize> VolumeTable<'d, D, R, N> {
    pub fn new() -> Self {
        Self { slots: core::array::from_fn(|_| None) }
    }

    /// Opens `name` against `device` (typically fetched via
    /// [`Filesystem::with_device`]) and stores it in the first free slot.
    pub fn mount(
        &mut self,
        rtos: &R,
        name: &str,
        device: &'d Device<D, R>,
        partition_index: u8,
        access_mode: AccessMode,
        cache_mode: CacheMode,
    ) -> Result<usize, FsError> {
        let volume = Volume::open(rtos, name, device, partition_index, access_mode, cache_mode)?;
        for (idx, slot) in self.slots.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(volume);
                return Ok(idx);
            }
        }
        Err(ResourceError::MemoryExhausted.into())
    }

    pub fn get(&self, idx: usize) -> Option<&Volume<'d, D, R>> {
        self.slots.get(idx).and_then(|s| s.as_ref())
    }

    /// Unmounts the volume at `idx`, refusing while it still has open
    /// files or directories (spec.md §4.5 `close`).
    pub fn unmount(&mut self, idx: usize) -> Result<(), FsError> {
        let slot = self.slots.get_mut(idx).ok_or(ResourceError::MemoryExhausted)?;
        match slot {
            None => Err(ResourceError::MemoryExhausted.into()),
            Some(volume) => {
                let (files, dirs) = volume.open_handle_counts();
                if files > 0 {
                    return Err(VolumeError::FilesOpen.into());
                }
                if dirs > 0 {
                    return Err(VolumeError::DirsOpen.into());
                }
                *slot = None;
                Ok(())
            }
        }
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<'d, D: PhyDriver, R: Rtos, const N: usize> Default for VolumeTable<'d, D, R, N> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fat::bpb::Bpb;
    use crate::fat::FatType;
    use crate::phy::test_support::MemDriver;
    use crate::rtos::from_std::StdRtos;
    use crate::volume::{compute_format_geometry, FormatConfig};

    #[test]
    fn register_and_fetch_device_round_trips() {
        let fs: Filesystem<MemDriver, StdRtos, 2, 4, 4> = Filesystem::new(StdRtos, FsConfig::default());
        let slot = fs.register_device(MemDriver::new(512, 4096), 0).unwrap();
        let sector_count = fs.with_device(slot, |d| d.sector_count()).unwrap();
        assert_eq!(sector_count, 4096);
    }

    #[test]
    fn unregister_empty_slot_errors() {
        let fs: Filesystem<MemDriver, StdRtos, 2, 4, 4> = Filesystem::new(StdRtos, FsConfig::default());
        assert!(fs.unregister_device(0).is_err());
    }

    /// Writes a bootstrap BPB by hand (mirrors `volume::tests::mounted_fat16`):
    /// `Volume::open` needs a valid on-disk BPB before it'll mount, and
    /// `Volume::format` needs an open volume to run against, so the very
    /// first format on a blank device is always seeded this way.
    fn write_bootstrap_bpb(device: &Device<MemDriver, StdRtos>, cfg: &FormatConfig) {
        let geometry = compute_format_geometry(cfg, 512, 4096).unwrap();
        let bpb = Bpb {
            oem_name: *b"RUSTFAT ",
            bytes_per_sector: 512,
            sectors_per_cluster: cfg.cluster_size_sectors,
            reserved_sector_count: geometry.reserved_sector_count,
            num_fats: cfg.number_of_fats,
            root_entry_count: cfg.root_entry_count,
            total_sectors_16: 4096,
            media: cfg.media,
            fat_size_16: geometry.fat_size_sectors as u16,
            sectors_per_track: 63,
            num_heads: 255,
            hidden_sectors: 0,
            total_sectors_32: 0,
            fat_size_32: 0,
            ext_flags: 0,
            fs_version: 0,
            root_cluster: 0,
            fs_info_sector: 0,
            backup_boot_sector: 0,
            drive_number: 0x80,
            boot_sig: 0x29,
            volume_id: 1,
            volume_label: *b"NO NAME    ",
            fs_type: *FatType::Fat16.fs_type_label(),
        };
        let mut sector = [0u8; 512];
        bpb.encode(&mut sector, FatType::Fat16);
        device.write(device.refresh_generation(), &sector, 0, 1).unwrap();
    }

    #[test]
    fn mount_unmount_round_trips_through_volume_table() {
        let fs: Filesystem<MemDriver, StdRtos, 1, 4, 4> = Filesystem::new(StdRtos, FsConfig::default());
        let slot = fs.register_device(MemDriver::new(512, 4096), 0).unwrap();
        let cfg = FormatConfig { fat_type: FatType::Fat16, cluster_size_sectors: 8, number_of_fats: 2, root_entry_count: 512, media: 0xF8 };

        fs.with_device(slot, |device| write_bootstrap_bpb(device, &cfg)).unwrap();

        let mut volumes: VolumeTable<'_, MemDriver, StdRtos, 2> = VolumeTable::new();
        fs.with_device(slot, |device| {
            let idx = volumes
                .mount(fs.rtos(), "TEST", device, 0, AccessMode::ReadWrite, CacheMode::WriteThrough)
                .unwrap();
            assert!(volumes.get(idx).is_some());
            volumes.unmount(idx).unwrap();
            assert!(volumes.get(idx).is_none());
        })
        .unwrap();
    }
}
