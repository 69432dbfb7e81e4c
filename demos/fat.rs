//! Mounts a FAT-formatted disk image and prints its layout and free space.
//!
//! Usage: `cargo run --example fat -- <path-to-image>`

#[path = "common/file_driver.rs"]
mod file_driver;

use embedded_fatfs::rtos::from_std::StdRtos;
use embedded_fatfs::volume::{AccessMode, Volume};
use embedded_fatfs::{cache::CacheMode, device::Device};

use file_driver::FileDriver;

fn main() {
    env_logger::init();

    let path = std::env::args().nth(1).expect("usage: fat <path-to-image>");
    let driver = FileDriver::open(&path, 512).expect("failed to open image");

    let rtos = StdRtos;
    let device = Device::open(&rtos, driver, 0).expect("failed to open device");
    let volume = Volume::open(&rtos, "disk", &device, 0, AccessMode::ReadOnly, CacheMode::ReadOnly)
        .expect("failed to mount volume");

    println!("fat type:    {:?}", volume.layout().fat_type);
    println!("sector size: {}", volume.sector_size());
    println!("cluster size (sectors): {}", volume.layout().cluster_size_sectors);

    let query = volume.query().unwrap();
    println!("{query:#?}");
}
