//! Reads the MBR partition table from sector 0 of a disk image and prints
//! each partition's start/size/type.
//!
//! Usage: `cargo run --example partition -- <path-to-image>`

#[path = "common/file_driver.rs"]
mod file_driver;

use embedded_fatfs::partition;
use embedded_fatfs::phy::PhyDriver;

use file_driver::FileDriver;

fn main() {
    let path = std::env::args().nth(1).expect("usage: partition <path-to-image>");
    let mut driver = FileDriver::open(&path, 512).expect("failed to open image");
    driver.open(0).unwrap();

    let mut sector = [0u8; 512];
    driver.rd(0, &mut sector, 0, 1).expect("failed to read sector 0");

    if !partition::has_partition_table(&sector) {
        println!("no MBR partition table; the whole device is one FAT volume");
        return;
    }

    for index in 1..=4u8 {
        match partition::partition_entry(&sector, index, driver.sector_count()) {
            Ok(entry) => println!("{index}: {entry:#?}"),
            Err(_) => println!("{index}: (empty)"),
        }
    }
}
