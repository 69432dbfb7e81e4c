//! A `PhyDriver` over a plain file, shared by the demos below. Not part of
//! the library: a real embedding glues `PhyDriver` to NAND/NOR/SD hardware,
//! and a file is a reasonable stand-in only for development on a host.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};

use embedded_fatfs::phy::PhyDriver;

pub struct FileDriver {
    file: File,
    sector_size: u16,
    sector_count: u32,
}

impl FileDriver {
    pub fn open(path: &str, sector_size: u16) -> std::io::Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let len = file.metadata()?.len();
        Ok(Self { file, sector_size, sector_count: (len / sector_size as u64) as u32 })
    }
}

impl PhyDriver for FileDriver {
    type Error = std::io::Error;

    fn open(&mut self, _unit: u8) -> Result<(), Self::Error> {
        Ok(())
    }

    fn close(&mut self, _unit: u8) -> Result<(), Self::Error> {
        Ok(())
    }

    fn rd(&mut self, _unit: u8, dest: &mut [u8], start_sector: u32, count: u32) -> Result<(), Self::Error> {
        self.file.seek(SeekFrom::Start(start_sector as u64 * self.sector_size as u64))?;
        self.file.read_exact(&mut dest[..count as usize * self.sector_size as usize])
    }

    fn wr(&mut self, _unit: u8, src: &[u8], start_sector: u32, count: u32) -> Result<(), Self::Error> {
        self.file.seek(SeekFrom::Start(start_sector as u64 * self.sector_size as u64))?;
        self.file.write_all(&src[..count as usize * self.sector_size as usize])
    }

    fn erase_block(&mut self, _unit: u8, _start: u32, _size: u32) -> Result<(), Self::Error> {
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
        self.sector_count
    }
}
