//! End-to-end coverage over a file-backed `PhyDriver`: format, mount,
//! create/write/read a file, mkdir, rename, and delete.

#[path = "common/file_driver.rs"]
mod file_driver;

use embedded_fatfs::buffer::BufferPool;
use embedded_fatfs::cache::CacheMode;
use embedded_fatfs::clock::EpochClock;
use embedded_fatfs::device::Device;
use embedded_fatfs::fat::bpb::Bpb;
use embedded_fatfs::fat::FatType;
use embedded_fatfs::handle::Arena;
use embedded_fatfs::rtos::from_std::StdRtos;
use embedded_fatfs::sys::{self, OpenMode};
use embedded_fatfs::volume::{AccessMode, FormatConfig, Volume};

use file_driver::FileDriver;

const SECTOR_SIZE: u16 = 512;
const SECTOR_COUNT: u32 = 4096; // 2 MiB, matches spec.md scenario S1.

/// Solves for the FAT size that covers the resulting cluster count, the same
/// fixed-point iteration the volume layer's own format path runs — needed
/// here only to hand-write the bootstrap BPB `Volume::open` requires before
/// the first real `format` call can run.
fn fat16_bootstrap_geometry(cfg: &FormatConfig, total_sectors: u32) -> (u16, u16) {
    let root_dir_sectors = (cfg.root_entry_count as u32 * 32 + SECTOR_SIZE as u32 - 1) / SECTOR_SIZE as u32;
    let mut fat_size_sectors: u32 = 1;
    for _ in 0..16 {
        let data_sectors = total_sectors
            .saturating_sub(1)
            .saturating_sub(cfg.number_of_fats as u32 * fat_size_sectors)
            .saturating_sub(root_dir_sectors);
        let cluster_count = data_sectors / cfg.cluster_size_sectors as u32;
        let fat_bytes = (cluster_count as u64 + 2) * 16 / 8;
        let needed = ((fat_bytes + SECTOR_SIZE as u64 - 1) / SECTOR_SIZE as u64) as u32;
        if needed == fat_size_sectors {
            break;
        }
        fat_size_sectors = needed.max(1);
    }
    (1, fat_size_sectors as u16)
}

fn bootstrap_image(path: &str) -> Device<FileDriver, StdRtos> {
    let file = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)
        .unwrap();
    file.set_len(SECTOR_SIZE as u64 * SECTOR_COUNT as u64).unwrap();
    drop(file);

    let driver = FileDriver::open(path, SECTOR_SIZE).unwrap();
    let rtos = StdRtos;
    let device = Device::open(&rtos, driver, 0).unwrap();

    let cfg = FormatConfig { fat_type: FatType::Fat16, cluster_size_sectors: 8, number_of_fats: 2, root_entry_count: 512, media: 0xF8 };
    let (reserved, fat_size) = fat16_bootstrap_geometry(&cfg, SECTOR_COUNT);

    let bpb = Bpb {
        oem_name: *b"RUSTFAT ",
        bytes_per_sector: SECTOR_SIZE,
        sectors_per_cluster: cfg.cluster_size_sectors,
        reserved_sector_count: reserved,
        num_fats: cfg.number_of_fats,
        root_entry_count: cfg.root_entry_count,
        total_sectors_16: SECTOR_COUNT as u16,
        media: cfg.media,
        fat_size_16: fat_size,
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
    let mut sector = [0u8; SECTOR_SIZE as usize];
    bpb.encode(&mut sector, FatType::Fat16);
    device.write(device.refresh_generation(), &sector, 0, 1).unwrap();

    let vol = Volume::open(&rtos, "BOOT", &device, 0, AccessMode::ReadWrite, CacheMode::WriteThrough).unwrap();
    vol.format(cfg, &EpochClock).unwrap();

    device
}

#[test]
fn create_write_read_rename_and_delete_a_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("disk.img");
    let path = path.to_str().unwrap();

    let device = bootstrap_image(path);
    let rtos = StdRtos;
    let volume = Volume::open(&rtos, "DISK", &device, 0, AccessMode::ReadWrite, CacheMode::WriteThrough).unwrap();
    let root = volume.root_dir_handle();

    let mut files = Arena::<_, 4>::new();
    let mut buffers = BufferPool::<4>::new();

    let handle = sys::file_open(&volume, &mut files, &mut buffers, &EpochClock, root, "HELLO.TXT", OpenMode::create_write(), true).unwrap();
    {
        let fh = files.get_mut(handle).unwrap();
        let written = sys::file_write(&volume, fh, &mut buffers, &EpochClock, b"hello, fat").unwrap();
        assert_eq!(written, 10);
    }
    sys::file_close(&volume, &mut files, &mut buffers, handle).unwrap();

    let handle = sys::file_open(&volume, &mut files, &mut buffers, &EpochClock, root, "HELLO.TXT", OpenMode::read(), true).unwrap();
    let mut buf = [0u8; 32];
    let read = {
        let fh = files.get_mut(handle).unwrap();
        sys::file_read(&volume, fh, &mut buffers, &mut buf).unwrap()
    };
    assert_eq!(&buf[..read as usize], b"hello, fat");
    sys::file_close(&volume, &mut files, &mut buffers, handle).unwrap();

    sys::entry_rename(&volume, &EpochClock, root, "HELLO.TXT", root, "RENAMED.TXT").unwrap();
    assert!(sys::entry_rename(&volume, &EpochClock, root, "HELLO.TXT", root, "AGAIN.TXT").is_err());

    sys::dir_create(&volume, &EpochClock, root, "SUBDIR").unwrap();

    let mut dirs = Arena::<_, 4>::new();
    let sub = sys::dir_open(&volume, &mut dirs, root, Some("SUBDIR")).unwrap();
    let mut seen: Vec<String> = Vec::new();
    {
        let dh = dirs.get_mut(sub).unwrap();
        while let Some(entry) = sys::dir_read(&volume, dh).unwrap() {
            seen.push(entry.name.to_string());
        }
    }
    assert!(seen.iter().any(|n| n == "."));
    assert!(seen.iter().any(|n| n == ".."));
    sys::dir_close(&volume, &mut dirs, sub).unwrap();

    sys::entry_delete(&volume, root, "RENAMED.TXT").unwrap();
    assert!(sys::entry_delete(&volume, root, "RENAMED.TXT").is_err());

    let query = volume.query().unwrap();
    assert!(query.free_sectors > 0);
    assert!(query.free_sectors < query.total_sectors);
}
