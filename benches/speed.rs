//! A read benchmark that measures sequential file read throughput through
//! the syscall layer (`sys::file_read`) at a few file sizes.

#[path = "common/file_driver.rs"]
mod file_driver;

use criterion::{black_box, criterion_group, criterion_main, AxisScale, BenchmarkId, Criterion, PlotConfiguration, Throughput};

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
const SECTOR_COUNT: u32 = 1 << 16; // 32 MiB, room for a few benchmark files.

const FILES: &[(&str, usize)] = &[("SMALL.BIN", 1024), ("MEDIUM.BIN", 100 * 1024), ("LARGE.BIN", 2 * 1024 * 1024)];

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

fn build_image(path: &str) -> Device<FileDriver, StdRtos> {
    let file = std::fs::OpenOptions::new().read(true).write(true).create(true).truncate(true).open(path).unwrap();
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
        total_sectors_16: 0,
        media: cfg.media,
        fat_size_16: fat_size,
        sectors_per_track: 63,
        num_heads: 255,
        hidden_sectors: 0,
        total_sectors_32: SECTOR_COUNT,
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

    let vol = Volume::open(&rtos, "BENCH", &device, 0, AccessMode::ReadWrite, CacheMode::WriteThrough).unwrap();
    vol.format(cfg, &EpochClock).unwrap();

    let mut files = Arena::<_, 2>::new();
    let mut buffers = BufferPool::<2>::new();
    for (name, size) in FILES {
        let handle = sys::file_open(&vol, &mut files, &mut buffers, &EpochClock, vol.root_dir_handle(), name, OpenMode::create_write(), true).unwrap();
        let payload = vec![0xAAu8; *size];
        {
            let fh = files.get_mut(handle).unwrap();
            let mut written = 0;
            while written < payload.len() {
                let chunk = std::cmp::min(4096, payload.len() - written);
                written += sys::file_write(&vol, fh, &mut buffers, &EpochClock, &payload[written..written + chunk]).unwrap() as usize;
            }
        }
        sys::file_close(&vol, &mut files, &mut buffers, handle).unwrap();
    }

    device
}

fn bench_read_speed(c: &mut Criterion) {
    let mut group = c.benchmark_group("read speed");
    group.plot_config(PlotConfiguration::default().summary_scale(AxisScale::Logarithmic));

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bench.img");
    let device = build_image(path.to_str().unwrap());

    let rtos = StdRtos;
    let volume = Volume::open(&rtos, "BENCH", &device, 0, AccessMode::ReadOnly, CacheMode::ReadOnly).unwrap();
    let mut files = Arena::<_, 2>::new();
    let mut buffers = BufferPool::<2>::new();

    for (name, size) in FILES {
        group.throughput(Throughput::Bytes(*size as u64));
        group.bench_with_input(BenchmarkId::new("file read speed", size), name, |b, name| {
            b.iter(|| {
                let handle = sys::file_open(&volume, &mut files, &mut buffers, &EpochClock, volume.root_dir_handle(), name, OpenMode::read(), true).unwrap();
                let mut buf = [0u8; 4096];
                let mut checksum: u64 = 0;
                loop {
                    let fh = files.get_mut(handle).unwrap();
                    let read = sys::file_read(&volume, fh, &mut buffers, &mut buf).unwrap();
                    if read == 0 {
                        break;
                    }
                    for &b in &buf[..read as usize] {
                        checksum = checksum.wrapping_add(b as u64);
                    }
                }
                sys::file_close(&volume, &mut files, &mut buffers, handle).unwrap();
                black_box(checksum);
            })
        });
    }
}

criterion_group!(benches, bench_read_speed);
criterion_main!(benches);
