//! Cluster chain operations: follow, alloc, free (spec.md §4.6.2).
//!
//! Generalized from the teacher's `fat/table.rs` `FatEntryTracer` (FAT32-
//! only, fixed 512-byte sectors, reads with `.unwrap()` and `dbg!`) into a
//! variant-dispatching, error-propagating implementation that also covers
//! FAT12's sector-straddling entries.

use crate::error::{DeviceError, FsError};
use crate::fat::{table12, table16, table32, FatLayout, FatType};

/// Everything a chain operation needs from the volume to read/write one
/// sector's worth of FAT bytes, mirrored across every FAT copy on write.
/// Implemented by the volume layer so this module stays independent of the
/// cache's const-generic buffer count.
pub trait FatIo {
    fn layout(&self) -> &FatLayout;

    /// Reads `sector_in_fat` (0-based, within a single FAT copy) into `buf`,
    /// which must be exactly one sector.
    fn read_fat_sector(&mut self, sector_in_fat: u32, buf: &mut [u8]) -> Result<(), FsError>;

    /// Writes `buf` to `sector_in_fat` in every mirrored FAT copy.
    fn write_fat_sector(&mut self, sector_in_fat: u32, buf: &[u8]) -> Result<(), FsError>;
}

fn entry_sector_and_offset(layout: &FatLayout, cluster: u32) -> (u32, u16) {
    let byte_offset = match layout.fat_type {
        FatType::Fat12 => table12::byte_offset(cluster),
        FatType::Fat16 => table16::byte_offset(cluster),
        FatType::Fat32 => table32::byte_offset(cluster),
    };
    (byte_offset / layout.sector_size as u32, (byte_offset % layout.sector_size as u32) as u16)
}

/// Reads the FAT entry for `cluster`.
pub fn read_entry(io: &mut dyn FatIo, cluster: u32) -> Result<u32, FsError> {
    let layout = io.layout().clone();
    let ss = layout.sector_size as usize;
    let (sector, offset) = entry_sector_and_offset(&layout, cluster);

    let mut buf = [0u8; crate::phy::MAX_SECTOR_SIZE];
    io.read_fat_sector(sector, &mut buf[..ss])?;

    Ok(match layout.fat_type {
        FatType::Fat12 => {
            let b0 = buf[offset as usize];
            let b1 = if (offset as usize + 1) < ss {
                buf[offset as usize + 1]
            } else {
                let mut next = [0u8; crate::phy::MAX_SECTOR_SIZE];
                io.read_fat_sector(sector + 1, &mut next[..ss])?;
                next[0]
            };
            table12::decode(b0, b1, cluster)
        }
        FatType::Fat16 => table16::decode([buf[offset as usize], buf[offset as usize + 1]]),
        FatType::Fat32 => table32::decode(buf[offset as usize..offset as usize + 4].try_into().unwrap()),
    })
}

/// Writes `value` into the FAT entry for `cluster`, across every FAT copy.
pub fn write_entry(io: &mut dyn FatIo, cluster: u32, value: u32) -> Result<(), FsError> {
    let layout = io.layout().clone();
    let ss = layout.sector_size as usize;
    let (sector, offset) = entry_sector_and_offset(&layout, cluster);

    let mut buf = [0u8; crate::phy::MAX_SECTOR_SIZE];
    io.read_fat_sector(sector, &mut buf[..ss])?;

    match layout.fat_type {
        FatType::Fat12 => {
            if (offset as usize + 1) < ss {
                let (b0, b1) = (buf[offset as usize], buf[offset as usize + 1]);
                let mut b0 = b0;
                let mut b1 = b1;
                table12::encode(&mut b0, &mut b1, cluster, value);
                buf[offset as usize] = b0;
                buf[offset as usize + 1] = b1;
                io.write_fat_sector(sector, &buf[..ss])?;
            } else {
                let mut next = [0u8; crate::phy::MAX_SECTOR_SIZE];
                io.read_fat_sector(sector + 1, &mut next[..ss])?;
                let mut b0 = buf[offset as usize];
                let mut b1 = next[0];
                table12::encode(&mut b0, &mut b1, cluster, value);
                buf[offset as usize] = b0;
                next[0] = b1;
                io.write_fat_sector(sector, &buf[..ss])?;
                io.write_fat_sector(sector + 1, &next[..ss])?;
            }
        }
        FatType::Fat16 => {
            let bytes = table16::encode(value);
            buf[offset as usize] = bytes[0];
            buf[offset as usize + 1] = bytes[1];
            io.write_fat_sector(sector, &buf[..ss])?;
        }
        FatType::Fat32 => {
            let existing: [u8; 4] = buf[offset as usize..offset as usize + 4].try_into().unwrap();
            let bytes = table32::encode(existing, value);
            buf[offset as usize..offset as usize + 4].copy_from_slice(&bytes);
            io.write_fat_sector(sector, &buf[..ss])?;
        }
    }

    Ok(())
}

pub fn cluster_bad_marker(fat_type: FatType) -> u32 {
    match fat_type {
        FatType::Fat12 => table12::BAD,
        FatType::Fat16 => table16::BAD,
        FatType::Fat32 => table32::BAD,
    }
}

pub fn cluster_eof_marker(fat_type: FatType) -> u32 {
    match fat_type {
        FatType::Fat12 => table12::EOF,
        FatType::Fat16 => table16::EOF,
        FatType::Fat32 => table32::EOF,
    }
}

pub fn cluster_free_marker(fat_type: FatType) -> u32 {
    match fat_type {
        FatType::Fat12 => table12::FREE,
        FatType::Fat16 => table16::FREE,
        FatType::Fat32 => table32::FREE,
    }
}

fn is_eof(fat_type: FatType, value: u32) -> bool {
    value >= cluster_eof_marker(fat_type)
}

/// Walks forward up to `length` steps from `start`. Returns the cluster
/// reached and how many steps were actually taken — fewer than `length` if
/// EOF was hit first.
pub fn chain_follow(io: &mut dyn FatIo, start: u32, length: u32) -> Result<(u32, u32), FsError> {
    let fat_type = io.layout().fat_type;
    let mut current = start;
    let mut steps = 0;

    while steps < length {
        let next = read_entry(io, current)?;
        if is_eof(fat_type, next) {
            break;
        }
        current = next;
        steps += 1;
    }

    Ok((current, steps))
}

/// Follows `start` until EOF, returning the last cluster and the chain's
/// length (including `start`).
pub fn chain_end_find(io: &mut dyn FatIo, start: u32) -> Result<(u32, u32), FsError> {
    let fat_type = io.layout().fat_type;
    let mut current = start;
    let mut length = 1;

    loop {
        let next = read_entry(io, current)?;
        if is_eof(fat_type, next) {
            return Ok((current, length));
        }
        current = next;
        length += 1;
    }
}

/// Finds the predecessor of `stop` in the chain starting at `start`, by
/// repeated `chain_end_find` semantics (used for truncation, spec.md
/// §4.6.2). Returns `None` if `stop == start` (no predecessor exists).
pub fn chain_reverse_follow(io: &mut dyn FatIo, start: u32, stop: u32) -> Result<Option<u32>, FsError> {
    if start == stop {
        return Ok(None);
    }

    let mut current = start;
    loop {
        let next = read_entry(io, current)?;
        if next == stop {
            return Ok(Some(current));
        }
        current = next;
    }
}

/// First-fit scan for a single free cluster, starting at `hint` and
/// wrapping around `layout.max_cluster_number`.
pub fn cluster_free_find(io: &mut dyn FatIo, hint: u32) -> Result<u32, FsError> {
    let layout = io.layout().clone();
    let fat_type = layout.fat_type;
    let free = cluster_free_marker(fat_type);

    let total = layout.max_cluster_number;
    let start = hint.max(2);

    for offset in 0..=(total - 2) {
        let cluster = 2 + (start - 2 + offset) % (total - 1);
        if read_entry(io, cluster)? == free {
            return Ok(cluster);
        }
    }

    Err(DeviceError::Full.into())
}

/// Upper bound on clusters a single [`chain_alloc`] call can extend a chain
/// by. Rollback scratch is a fixed-capacity `heapless::Vec`, so this also
/// bounds worst-case stack use (`MAX_CHAIN_ALLOC * size_of::<u32>()`
/// bytes). All in-crate callers request one cluster at a time (`Volume`'s
/// grow-by-one helpers), so this only constrains callers of the public
/// `Volume::chain_alloc` API asking for a single oversized extend.
const MAX_CHAIN_ALLOC: usize = 4096;

/// Allocates `count` free clusters, linking each to the previous one (or to
/// `start_or_none`'s existing tail if provided). Returns the head of the
/// newly allocated run. Rolls back (frees) any clusters already allocated
/// if a later allocation in the same call fails.
pub fn chain_alloc(io: &mut dyn FatIo, start_or_none: Option<u32>, count: u32, hint: u32) -> Result<u32, FsError> {
    let fat_type = io.layout().fat_type;
    let eof = cluster_eof_marker(fat_type);

    if count as usize > MAX_CHAIN_ALLOC {
        log::warn!(
            "chain_alloc: requested {count} clusters exceeds the {MAX_CHAIN_ALLOC}-cluster \
             rollback-scratch bound; refusing rather than silently truncating the request",
        );
        return Err(DeviceError::Full.into());
    }

    let mut allocated: heapless::Vec<u32, MAX_CHAIN_ALLOC> = heapless::Vec::new();
    let mut search_hint = hint;

    let result = (|| {
        for _ in 0..count {
            let cluster = cluster_free_find(io, search_hint)?;
            write_entry(io, cluster, eof)?;

            if let Some(&prev) = allocated.last() {
                write_entry(io, prev, cluster)?;
            } else if let Some(prev) = start_or_none {
                write_entry(io, prev, cluster)?;
            }

            allocated.push(cluster).map_err(|_| DeviceError::Full)?;
            search_hint = cluster + 1;
        }
        Ok(())
    })();

    match result {
        Ok(()) => Ok(*allocated.first().unwrap()),
        Err(e) => {
            // Roll back the partial chain.
            let free = cluster_free_marker(fat_type);
            for &c in allocated.iter() {
                let _ = write_entry(io, c, free);
            }
            Err(e)
        }
    }
}

/// Marks every cluster in the chain starting at `start` free. If
/// `delete_first` is false, the head cluster itself is left untouched
/// (used when truncating a file down to its first cluster).
pub fn chain_del(io: &mut dyn FatIo, start: u32, delete_first: bool) -> Result<(), FsError> {
    let fat_type = io.layout().fat_type;
    let free = cluster_free_marker(fat_type);

    let mut current = start;
    let mut first = true;

    loop {
        let next = read_entry(io, current)?;
        let is_last = is_eof(fat_type, next);

        if !first || delete_first {
            write_entry(io, current, free)?;
        }

        first = false;
        if is_last {
            break;
        }
        current = next;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fat::FatType;

    struct FakeFat {
        layout: FatLayout,
        bytes: std::vec::Vec<u8>,
    }

    impl FakeFat {
        fn new(fat_type: FatType, max_cluster_number: u32) -> Self {
            let sector_size = 512u16;
            let layout = FatLayout {
                fat_type,
                fat_start_sector: 1,
                fat_size_sectors: 8,
                number_of_fats: 1,
                sector_size,
                max_cluster_number,
                data_region_start: 100,
                cluster_size_sectors: 1,
                cluster_size_sectors_log2: 0,
                root_dir_start_sector: 9,
                root_dir_sector_count: 32,
                root_cluster: if matches!(fat_type, FatType::Fat32) { 2 } else { 0 },
                fsinfo_sector: 1,
                backup_boot_sector: 6,
            };
            Self { layout, bytes: std::vec![0u8; sector_size as usize * 8] }
        }
    }

    impl FatIo for FakeFat {
        fn layout(&self) -> &FatLayout {
            &self.layout
        }

        fn read_fat_sector(&mut self, sector_in_fat: u32, buf: &mut [u8]) -> Result<(), FsError> {
            let ss = self.layout.sector_size as usize;
            let start = sector_in_fat as usize * ss;
            buf.copy_from_slice(&self.bytes[start..start + ss]);
            Ok(())
        }

        fn write_fat_sector(&mut self, sector_in_fat: u32, buf: &[u8]) -> Result<(), FsError> {
            let ss = self.layout.sector_size as usize;
            let start = sector_in_fat as usize * ss;
            self.bytes[start..start + ss].copy_from_slice(buf);
            Ok(())
        }
    }

    #[test]
    fn alloc_links_chain_and_follow_reaches_eof() {
        let mut fat = FakeFat::new(FatType::Fat16, 1000);
        let head = chain_alloc(&mut fat, None, 3, 2).unwrap();
        let (end, len) = chain_end_find(&mut fat, head).unwrap();
        assert_eq!(len, 3);
        assert_ne!(end, head);
    }

    #[test]
    fn chain_del_frees_all_clusters() {
        let mut fat = FakeFat::new(FatType::Fat16, 1000);
        let head = chain_alloc(&mut fat, None, 4, 2).unwrap();
        chain_del(&mut fat, head, true).unwrap();

        for c in 2..10 {
            assert_eq!(read_entry(&mut fat, c).unwrap(), table16::FREE);
        }
    }

    #[test]
    fn chain_del_keep_first_leaves_head_allocated() {
        let mut fat = FakeFat::new(FatType::Fat16, 1000);
        let head = chain_alloc(&mut fat, None, 2, 2).unwrap();
        chain_del(&mut fat, head, false).unwrap();
        assert_eq!(read_entry(&mut fat, head).unwrap(), table16::EOF);
    }

    #[test]
    fn fat12_split_entry_write_and_read() {
        let mut fat = FakeFat::new(FatType::Fat12, 2000);
        // Pick a cluster whose entry straddles sector 0/1 (byte_offset 511).
        let cluster = 341;
        write_entry(&mut fat, cluster, 0x123).unwrap();
        assert_eq!(read_entry(&mut fat, cluster).unwrap(), 0x123);
    }
}
