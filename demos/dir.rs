//! Lists the root directory of a FAT-formatted disk image.
//!
//! Usage: `cargo run --example dir -- <path-to-image>`

#[path = "common/file_driver.rs"]
mod file_driver;

use embedded_fatfs::handle::Arena;
use embedded_fatfs::rtos::from_std::StdRtos;
use embedded_fatfs::volume::{AccessMode, Volume};
use embedded_fatfs::{cache::CacheMode, device::Device, sys};

use file_driver::FileDriver;

fn main() {
    env_logger::init();

    let path = std::env::args().nth(1).expect("usage: dir <path-to-image>");
    let driver = FileDriver::open(&path, 512).expect("failed to open image");

    let rtos = StdRtos;
    let device = Device::open(&rtos, driver, 0).expect("failed to open device");
    let volume = Volume::open(&rtos, "disk", &device, 0, AccessMode::ReadOnly, CacheMode::ReadOnly)
        .expect("failed to mount volume");

    let mut dirs = Arena::<_, 4>::new();
    let root = sys::dir_open(&volume, &mut dirs, volume.root_dir_handle(), None).unwrap();
    let handle = dirs.get_mut(root).unwrap();

    while let Some(entry) = sys::dir_read(&volume, handle).unwrap() {
        let kind = if entry.entry.is_dir() { "dir " } else { "file" };
        println!("{kind}  {:>10}  {}", entry.entry.file_size, entry.name);
    }

    sys::dir_close(&volume, &mut dirs, root).unwrap();
}
