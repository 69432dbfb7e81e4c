//! C8 — the syscall layer: spec.md §4.8's file/dir operation contracts,
//! built over the FAT chain engine (C6, `fat::chain`) and the directory
//! engine (C7, `dir`) through a mounted [`crate::volume::Volume`].
//!
//! Nothing in the teacher plays this role: `fat/file.rs`'s `FatFile` read
//! and wrote straight off a `&mut Storage` with no buffering, no handle
//! pool, and no growth-on-write. This module is new, free functions over
//! the caller-owned handle arenas (spec.md §4.9) rather than a method on a
//! type that would otherwise have to wrap every collaborator, matching the
//! style `dir/mod.rs` and `fat/chain.rs` already use for the layers below.

use crate::buffer::BufferPool;
use crate::cache::SectorType;
use crate::clock::Clock;
use crate::dir::entry::{Attributes, DirEntry, ENTRY_SIZE};
use crate::dir::{self, DirIo};
use crate::error::{EntryError, FileError, FsError, ResourceError};
use crate::handle::dir::DirHandle;
use crate::handle::file::{BufferDirection, FileBuffer, FileHandle, OpenAccess};
use crate::handle::{Arena, HandleId};
use crate::phy::{PhyDriver, MAX_SECTOR_SIZE};
use crate::rtos::Rtos;
use crate::volume::Volume;

/// Upper bound on how many existing short names `file_open`'s create path
/// scans for numeric-tail collision avoidance (spec.md §4.7.4). A directory
/// with more live entries than this falls back to accepting the first
/// still-free numeric tail without checking names past the cap — a
/// known limitation, see DESIGN.md.
const MAX_SCAN_NAMES: usize = 256;

/// Requested disposition for a name at `file_open` (spec.md §4.8
/// `file_open`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenMode {
    pub access: OpenAccess,
    /// Create a zero-length file if `name` doesn't exist.
    pub create: bool,
    /// Fail with `EntryExists` if `name` already exists.
    pub excl: bool,
    /// Delete the chain (keeping the first cluster) and zero the size if
    /// `name` already exists.
    pub truncate: bool,
}

impl OpenMode {
    pub fn read() -> Self {
        Self { access: OpenAccess::Read, create: false, excl: false, truncate: false }
    }

    pub fn create_write() -> Self {
        Self { access: OpenAccess::Write, create: true, excl: false, truncate: true }
    }
}

/// `origin` for [`file_pos_set`] (spec.md §4.8 `file_pos_set`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekOrigin {
    Start,
    Current,
    End,
}

/// A decoded directory row as returned by [`dir_read`]: never an LFN
/// fragment or a deleted/volume-id slot (spec.md §4.8 `dir_read`).
#[derive(Debug, Clone)]
pub struct DirReadEntry {
    pub name: heapless::String<255>,
    pub entry: DirEntry,
}

fn scan_existing_short_names(dir_io: &mut dyn DirIo) -> Result<heapless::Vec<heapless::String<12>, MAX_SCAN_NAMES>, FsError> {
    let total = dir_io.slot_capacity();
    let mut names = heapless::Vec::new();
    let mut raw = [0u8; ENTRY_SIZE];

    let mut idx = 0;
    while idx < total {
        dir_io.read_slot(idx, &mut raw)?;
        match dir::entry::slot_state(&raw) {
            dir::entry::SlotState::End => break,
            dir::entry::SlotState::Deleted => {}
            dir::entry::SlotState::Occupied if raw[11] != Attributes::LFN.bits() => {
                let decoded = DirEntry::decode(&raw);
                if !decoded.is_volume_id() {
                    let _ = names.push(dir::sfn::decode(&decoded.name_raw));
                }
            }
            dir::entry::SlotState::Occupied => {}
        }
        idx += 1;
    }
    Ok(names)
}

fn write_entry_fields<D: PhyDriver, R: Rtos>(
    volume: &Volume<'_, D, R>,
    parent_first_cluster: Option<u32>,
    dir_slot: u32,
    first_cluster: u32,
    size: u32,
    clock: &impl Clock,
) -> Result<(), FsError> {
    let now = clock.now();
    volume.with_dir(parent_first_cluster, |dir_io| {
        let mut raw = [0u8; ENTRY_SIZE];
        dir_io.read_slot(dir_slot, &mut raw)?;
        let mut entry = DirEntry::decode(&raw);
        entry.first_cluster = first_cluster;
        entry.file_size = size;
        entry.set_write_timestamp(now);
        dir_io.write_slot(dir_slot, &entry.encode())
    })
}

/// Resolves `name` within `parent_first_cluster` and opens it, creating or
/// truncating per `mode` (spec.md §4.8 `file_open`). `allow_concurrent_open`
/// mirrors [`crate::context::FsConfig::allow_concurrent_open`] (spec.md
/// §4.9 "Concurrent-open policy"): when `false`, a second open of an
/// already-open entry is refused with `FileError::AlreadyOpen` if either
/// the existing handle or this open requests write access.
pub fn file_open<D: PhyDriver, R: Rtos, const N: usize>(
    volume: &Volume<'_, D, R>,
    files: &mut Arena<FileHandle, N>,
    buffers: &mut BufferPool<N>,
    clock: &impl Clock,
    parent_first_cluster: Option<u32>,
    name: &str,
    mode: OpenMode,
    allow_concurrent_open: bool,
) -> Result<HandleId, FsError> {
    if mode.truncate && !mode.access.can_write() {
        return Err(FileError::InvalidAccessMode.into());
    }

    enum Resolved {
        Existing { dir_slot: u32, first_cluster: u32, size: u32 },
        Created { dir_slot: u32 },
    }

    let now = clock.now();
    let resolved = volume.with_dir(parent_first_cluster, |dir_io| match dir::find(dir_io, name)? {
        Some(found) => {
            if found.entry.is_dir() {
                return Err(EntryError::NotFile.into());
            }
            if mode.excl {
                return Err(EntryError::Exists.into());
            }
            Ok(Resolved::Existing { dir_slot: found.end, first_cluster: found.entry.first_cluster, size: found.entry.file_size })
        }
        None => {
            if !mode.create {
                return Err(EntryError::NotFound.into());
            }
            let existing = scan_existing_short_names(dir_io)?;
            #[cfg(feature = "long-names")]
            let (_start, entry_slot) = dir::insert(
                dir_io,
                name,
                |raw| DirEntry::new_file(raw, 0, now),
                |candidate| existing.iter().any(|s| s.eq_ignore_ascii_case(candidate)),
            )?;
            #[cfg(not(feature = "long-names"))]
            let (_start, entry_slot) = dir::insert(dir_io, name, |raw| DirEntry::new_file(raw, 0, now))?;
            let _ = &existing;
            Ok(Resolved::Created { dir_slot: entry_slot })
        }
    })?;

    let (dir_slot, mut first_cluster, mut size, pre_existing) = match resolved {
        Resolved::Existing { dir_slot, first_cluster, size } => (dir_slot, first_cluster, size, true),
        Resolved::Created { dir_slot } => (dir_slot, 0, 0, false),
    };

    if pre_existing && !allow_concurrent_open {
        let already_open = files.iter().any(|(_, h)| {
            h.parent_dir_first_cluster == parent_first_cluster && h.dir_slot == dir_slot && (h.access.can_write() || mode.access.can_write())
        });
        if already_open {
            return Err(FileError::AlreadyOpen.into());
        }
    }

    if mode.truncate && first_cluster != 0 {
        volume.chain_del(first_cluster, false)?;
        volume.terminate_chain(first_cluster)?;
        size = 0;
        write_entry_fields(volume, parent_first_cluster, dir_slot, first_cluster, size, clock)?;
    }

    if files.len() >= files.capacity() {
        return Err(ResourceError::MemoryExhausted.into());
    }
    let buf_handle = buffers.get(0)?;
    let handle = FileHandle::new(parent_first_cluster, dir_slot, first_cluster, size, mode.access, FileBuffer::new(buf_handle));
    let id = files.alloc(handle).expect("capacity checked above");
    volume.handle_opened(false);
    Ok(id)
}

fn flush_buffer<D: PhyDriver, R: Rtos, const N: usize>(
    volume: &Volume<'_, D, R>,
    handle: &mut FileHandle,
    buffers: &mut BufferPool<N>,
) -> Result<(), FsError> {
    if handle.buffer.direction == BufferDirection::Write {
        let ss = volume.sector_size() as usize;
        let mut scratch = [0u8; MAX_SECTOR_SIZE];
        scratch[..ss].copy_from_slice(&buffers.data(&handle.buffer.handle)[..ss]);
        volume.write(&scratch[..ss], handle.buffer.sector, 1, SectorType::File)?;
    }
    handle.buffer.direction = BufferDirection::None;
    Ok(())
}

fn load_buffer<D: PhyDriver, R: Rtos, const N: usize>(
    volume: &Volume<'_, D, R>,
    handle: &mut FileHandle,
    buffers: &mut BufferPool<N>,
    sector: u32,
    direction: BufferDirection,
) -> Result<(), FsError> {
    if handle.buffer.holds(sector) && handle.buffer.direction == direction {
        return Ok(());
    }
    flush_buffer(volume, handle, buffers)?;

    if direction == BufferDirection::Read {
        let ss = volume.sector_size() as usize;
        let mut scratch = [0u8; MAX_SECTOR_SIZE];
        volume.read(&mut scratch[..ss], sector, 1, SectorType::File)?;
        buffers.data_mut(&handle.buffer.handle)[..ss].copy_from_slice(&scratch[..ss]);
    }
    handle.buffer.sector = sector;
    handle.buffer.direction = direction;
    Ok(())
}

/// Walks `handle`'s chain from wherever it currently sits to
/// `target_cluster_index`, without allocating (used by reads and by
/// backward seeks).
fn seek_cluster<D: PhyDriver, R: Rtos>(volume: &Volume<'_, D, R>, handle: &mut FileHandle, target_cluster_index: u32) -> Result<(), FsError> {
    if handle.first_cluster == 0 {
        return Ok(());
    }

    if target_cluster_index >= handle.current_cluster_index {
        let delta = target_cluster_index - handle.current_cluster_index;
        if delta > 0 {
            let (cluster, steps) = volume.chain_follow(handle.current_cluster, delta)?;
            if steps != delta {
                return Err(EntryError::Corrupt.into());
            }
            handle.current_cluster = cluster;
            handle.current_cluster_index = target_cluster_index;
        }
    } else {
        let (cluster, steps) = volume.chain_follow(handle.first_cluster, target_cluster_index)?;
        if steps != target_cluster_index {
            return Err(EntryError::Corrupt.into());
        }
        handle.current_cluster = cluster;
        handle.current_cluster_index = target_cluster_index;
    }
    Ok(())
}

/// Like [`seek_cluster`], but allocates a cluster past the current chain
/// end instead of erroring when `target_cluster_index` isn't reached yet
/// (spec.md §4.8 `file_write`/`file_pos_set`: "grows chain... as needed").
fn ensure_cluster<D: PhyDriver, R: Rtos>(volume: &Volume<'_, D, R>, handle: &mut FileHandle, target_cluster_index: u32) -> Result<(), FsError> {
    if handle.first_cluster == 0 {
        let new_cluster = volume.chain_alloc(None, 1)?;
        handle.first_cluster = new_cluster;
        handle.current_cluster = new_cluster;
        handle.current_cluster_index = 0;
    }

    while handle.current_cluster_index < target_cluster_index {
        let (next, steps) = volume.chain_follow(handle.current_cluster, 1)?;
        handle.current_cluster = if steps == 1 { next } else { volume.chain_alloc(Some(handle.current_cluster), 1)? };
        handle.current_cluster_index += 1;
    }

    if handle.current_cluster_index > target_cluster_index {
        seek_cluster(volume, handle, target_cluster_index)?;
    }
    Ok(())
}

/// Reads `min(out.len(), size - pos)` bytes through the per-handle buffer,
/// setting EOF when the read is shorter than requested (spec.md §4.8
/// `file_read`).
pub fn file_read<D: PhyDriver, R: Rtos, const N: usize>(
    volume: &Volume<'_, D, R>,
    handle: &mut FileHandle,
    buffers: &mut BufferPool<N>,
    out: &mut [u8],
) -> Result<u32, FsError> {
    handle.check_error()?;
    if !handle.access.can_read() {
        return Err(FileError::InvalidAccessMode.into());
    }

    let to_read = core::cmp::min(out.len() as u32, handle.size.saturating_sub(handle.position));
    if to_read == 0 {
        handle.eof_flag = true;
        return Ok(0);
    }

    let bytes_per_cluster = volume.bytes_per_cluster();
    let ss = volume.sector_size() as u32;
    let mut done = 0u32;

    while done < to_read {
        let cluster_index = handle.position / bytes_per_cluster;
        seek_cluster(volume, handle, cluster_index).map_err(|e| {
            handle.error_flag = true;
            e
        })?;

        let offset_in_cluster = handle.position % bytes_per_cluster;
        let sector_in_cluster = offset_in_cluster / ss;
        let offset_in_sector = (offset_in_cluster % ss) as usize;
        let sector = volume.sector_of_cluster(handle.current_cluster) + sector_in_cluster;

        load_buffer(volume, handle, buffers, sector, BufferDirection::Read).map_err(|e| {
            handle.error_flag = true;
            e
        })?;

        let chunk = core::cmp::min(ss as usize - offset_in_sector, (to_read - done) as usize);
        out[done as usize..done as usize + chunk].copy_from_slice(&buffers.data(&handle.buffer.handle)[offset_in_sector..offset_in_sector + chunk]);

        handle.position += chunk as u32;
        done += chunk as u32;
    }

    handle.eof_flag = handle.position >= handle.size;
    Ok(done)
}

/// Writes `input`, growing the chain as needed; for `Append` access,
/// repositions to the current size first (spec.md §4.8 `file_write`).
pub fn file_write<D: PhyDriver, R: Rtos, const N: usize>(
    volume: &Volume<'_, D, R>,
    handle: &mut FileHandle,
    buffers: &mut BufferPool<N>,
    clock: &impl Clock,
    input: &[u8],
) -> Result<u32, FsError> {
    handle.check_error()?;
    if !handle.access.can_write() {
        return Err(FileError::InvalidAccessMode.into());
    }
    if matches!(handle.access, OpenAccess::Append) {
        handle.position = handle.size;
    }
    let new_end = handle.position.checked_add(input.len() as u32).ok_or(FileError::Overflow)?;

    let bytes_per_cluster = volume.bytes_per_cluster();
    let ss = volume.sector_size() as u32;
    let mut done = 0u32;

    while done < input.len() as u32 {
        let cluster_index = handle.position / bytes_per_cluster;
        ensure_cluster(volume, handle, cluster_index).map_err(|e| {
            handle.error_flag = true;
            e
        })?;

        let offset_in_cluster = handle.position % bytes_per_cluster;
        let sector_in_cluster = offset_in_cluster / ss;
        let offset_in_sector = (offset_in_cluster % ss) as usize;
        let sector = volume.sector_of_cluster(handle.current_cluster) + sector_in_cluster;

        load_buffer(volume, handle, buffers, sector, BufferDirection::Write).map_err(|e| {
            handle.error_flag = true;
            e
        })?;

        let chunk = core::cmp::min(ss as usize - offset_in_sector, (input.len() as u32 - done) as usize);
        buffers.data_mut(&handle.buffer.handle)[offset_in_sector..offset_in_sector + chunk]
            .copy_from_slice(&input[done as usize..done as usize + chunk]);

        handle.position += chunk as u32;
        done += chunk as u32;
    }

    if new_end > handle.size {
        handle.size = new_end;
    }
    handle.eof_flag = false;
    write_entry_fields(volume, handle.parent_dir_first_cluster, handle.dir_slot, handle.first_cluster, handle.size, clock)?;
    Ok(done)
}

/// Seeks to a new position; a seek past the current size pads with zeros
/// through `file_write` if the handle is writable (spec.md §4.8
/// `file_pos_set`).
pub fn file_pos_set<D: PhyDriver, R: Rtos, const N: usize>(
    volume: &Volume<'_, D, R>,
    handle: &mut FileHandle,
    buffers: &mut BufferPool<N>,
    clock: &impl Clock,
    offset: i64,
    origin: SeekOrigin,
) -> Result<u32, FsError> {
    handle.check_error()?;
    flush_buffer(volume, handle, buffers)?;

    let base = match origin {
        SeekOrigin::Start => 0i64,
        SeekOrigin::Current => handle.position as i64,
        SeekOrigin::End => handle.size as i64,
    };
    let new_pos = base
        .checked_add(offset)
        .filter(|&p| (0..=u32::MAX as i64).contains(&p))
        .ok_or(FileError::Overflow)? as u32;

    if new_pos > handle.size {
        if !handle.access.can_write() {
            return Err(FileError::InvalidOffset.into());
        }
        handle.position = handle.size;
        let mut remaining = new_pos - handle.size;
        let zero = [0u8; 512];
        while remaining > 0 {
            let chunk = core::cmp::min(remaining, zero.len() as u32);
            file_write(volume, handle, buffers, clock, &zero[..chunk as usize])?;
            remaining -= chunk;
        }
    } else {
        handle.position = new_pos;
        if handle.first_cluster != 0 {
            let bytes_per_cluster = volume.bytes_per_cluster();
            seek_cluster(volume, handle, new_pos / bytes_per_cluster)?;
        }
    }

    handle.eof_flag = false;
    Ok(handle.position)
}

/// Shrinks or extends the file to `new_size`, freeing or zero-padding
/// clusters accordingly (spec.md §4.8 `file_truncate`).
pub fn file_truncate<D: PhyDriver, R: Rtos, const N: usize>(
    volume: &Volume<'_, D, R>,
    handle: &mut FileHandle,
    buffers: &mut BufferPool<N>,
    clock: &impl Clock,
    new_size: u32,
) -> Result<(), FsError> {
    handle.check_error()?;
    if !handle.access.can_write() {
        return Err(FileError::InvalidAccessMode.into());
    }
    flush_buffer(volume, handle, buffers)?;

    if new_size < handle.size {
        if handle.first_cluster != 0 {
            if new_size == 0 {
                volume.chain_del(handle.first_cluster, true)?;
                handle.first_cluster = 0;
                handle.current_cluster = 0;
                handle.current_cluster_index = 0;
            } else {
                let bytes_per_cluster = volume.bytes_per_cluster();
                let last_index = (new_size - 1) / bytes_per_cluster;
                let (last_cluster, steps) = volume.chain_follow(handle.first_cluster, last_index)?;
                if steps != last_index {
                    return Err(EntryError::Corrupt.into());
                }
                let (after, advanced) = volume.chain_follow(last_cluster, 1)?;
                if advanced == 1 {
                    volume.chain_del(after, true)?;
                }
                volume.terminate_chain(last_cluster)?;
                handle.current_cluster = last_cluster;
                handle.current_cluster_index = last_index;
            }
        }
        handle.size = new_size;
        if handle.position > new_size {
            handle.position = new_size;
        }
        write_entry_fields(volume, handle.parent_dir_first_cluster, handle.dir_slot, handle.first_cluster, handle.size, clock)?;
    } else if new_size > handle.size {
        let saved_pos = handle.position;
        handle.position = handle.size;
        let mut remaining = new_size - handle.size;
        let zero = [0u8; 512];
        while remaining > 0 {
            let chunk = core::cmp::min(remaining, zero.len() as u32);
            file_write(volume, handle, buffers, clock, &zero[..chunk as usize])?;
            remaining -= chunk;
        }
        handle.position = saved_pos;
    }

    Ok(())
}

/// Flushes and releases a file handle (spec.md §4.8 "handle lifecycle":
/// close flushes the buffer, unlinks, decrements refcounts).
pub fn file_close<D: PhyDriver, R: Rtos, const N: usize>(
    volume: &Volume<'_, D, R>,
    files: &mut Arena<FileHandle, N>,
    buffers: &mut BufferPool<N>,
    id: HandleId,
) -> Result<(), FsError> {
    let mut handle = files.free(id).ok_or(FileError::NotOpen)?;
    let flush_result = flush_buffer(volume, &mut handle, buffers);
    buffers.release(handle.buffer.handle);
    volume.handle_closed(false);
    flush_result
}

/// Deletes `name`: frees its cluster chain (if any) and marks its
/// directory slots deleted (spec.md §1 overview "create, delete, rename").
pub fn entry_delete<D: PhyDriver, R: Rtos>(volume: &Volume<'_, D, R>, parent_first_cluster: Option<u32>, name: &str) -> Result<(), FsError> {
    let found = volume.with_dir(parent_first_cluster, |dir_io| dir::find(dir_io, name))?.ok_or(EntryError::NotFound)?;
    if found.entry.first_cluster != 0 {
        volume.chain_del(found.entry.first_cluster, true)?;
    }
    volume.with_dir(parent_first_cluster, |dir_io| dir::delete(dir_io, found.start, found.end))
}

/// Creates a new, empty subdirectory named `name` within
/// `parent_first_cluster`, seeding it with `.` and `..` entries pointing at
/// itself and its parent (spec.md §1 overview "create... directories";
/// §GLOSSARY "Directory entry" — the conventional FAT dot-entries).
/// `parent_first_cluster` of `None` means the dot-entries point at the fixed
/// root region, recorded as cluster `0` per the DOS convention FAT readers
/// expect.
pub fn dir_create<D: PhyDriver, R: Rtos>(
    volume: &Volume<'_, D, R>,
    clock: &impl Clock,
    parent_first_cluster: Option<u32>,
    name: &str,
) -> Result<(), FsError> {
    let now = clock.now();

    let exists = volume.with_dir(parent_first_cluster, |dir_io| dir::find(dir_io, name))?;
    if exists.is_some() {
        return Err(EntryError::Exists.into());
    }

    let new_cluster = volume.chain_alloc(None, 1)?;
    volume.zero_cluster(new_cluster)?;

    let parent_dot_dot = parent_first_cluster.unwrap_or(0);
    volume.with_dir(Some(new_cluster), |dir_io| {
        let dot = DirEntry::new_dir(*b".          ", new_cluster, now);
        dir_io.write_slot(0, &dot.encode())?;
        let dot_dot = DirEntry::new_dir(*b"..         ", parent_dot_dot, now);
        dir_io.write_slot(1, &dot_dot.encode())
    })?;

    let result = volume.with_dir(parent_first_cluster, |dir_io| {
        let existing = scan_existing_short_names(dir_io)?;
        #[cfg(feature = "long-names")]
        let _ = dir::insert(
            dir_io,
            name,
            |raw| DirEntry::new_dir(raw, new_cluster, now),
            |candidate| existing.iter().any(|s| s.eq_ignore_ascii_case(candidate)),
        )?;
        #[cfg(not(feature = "long-names"))]
        let _ = dir::insert(dir_io, name, |raw| DirEntry::new_dir(raw, new_cluster, now))?;
        let _ = &existing;
        Ok(())
    });

    if result.is_err() {
        volume.chain_del(new_cluster, true)?;
    }
    result
}

/// Renames (and, when `new_parent_first_cluster` differs from
/// `old_parent_first_cluster`, moves) `old_name` to `new_name` (spec.md §1
/// overview "create, delete, rename"). Preserves the entry's attributes,
/// cluster chain, and size, and bumps its write timestamp the same as any
/// other directory-entry mutation; if the entry being moved is a directory,
/// its `..` entry is rewritten to point at the new parent so a subsequent
/// `dir_open("..")` still resolves correctly.
pub fn entry_rename<D: PhyDriver, R: Rtos>(
    volume: &Volume<'_, D, R>,
    clock: &impl Clock,
    old_parent_first_cluster: Option<u32>,
    old_name: &str,
    new_parent_first_cluster: Option<u32>,
    new_name: &str,
) -> Result<(), FsError> {
    let found = volume.with_dir(old_parent_first_cluster, |dir_io| dir::find(dir_io, old_name))?.ok_or(EntryError::NotFound)?;

    let already_there = volume.with_dir(new_parent_first_cluster, |dir_io| dir::find(dir_io, new_name))?;
    if already_there.is_some() {
        return Err(EntryError::Exists.into());
    }

    let now = clock.now();
    let entry = found.entry.clone();
    volume.with_dir(new_parent_first_cluster, |dir_io| {
        let existing = scan_existing_short_names(dir_io)?;
        #[cfg(feature = "long-names")]
        let _ = dir::insert(
            dir_io,
            new_name,
            |raw| {
                let mut e = entry.clone();
                e.name_raw = raw;
                e.set_write_timestamp(now);
                e
            },
            |candidate| existing.iter().any(|s| s.eq_ignore_ascii_case(candidate)),
        )?;
        #[cfg(not(feature = "long-names"))]
        let _ = dir::insert(dir_io, new_name, |raw| {
            let mut e = entry.clone();
            e.name_raw = raw;
            e.set_write_timestamp(now);
            e
        })?;
        let _ = &existing;
        Ok(())
    })?;

    if entry.is_dir() && new_parent_first_cluster != old_parent_first_cluster {
        let parent_dot_dot = new_parent_first_cluster.unwrap_or(0);
        volume.with_dir(Some(entry.first_cluster), |dir_io| {
            let mut raw = [0u8; ENTRY_SIZE];
            dir_io.read_slot(1, &mut raw)?;
            let mut dot_dot = DirEntry::decode(&raw);
            dot_dot.first_cluster = parent_dot_dot;
            dir_io.write_slot(1, &dot_dot.encode())
        })?;
    }

    volume.with_dir(old_parent_first_cluster, |dir_io| dir::delete(dir_io, found.start, found.end))
}

/// Opens `name` within `parent_first_cluster` as a directory, or (when
/// `name` is `None`) opens `parent_first_cluster` itself — used to open
/// the root (spec.md §4.8 `dir_open`).
pub fn dir_open<D: PhyDriver, R: Rtos, const M: usize>(
    volume: &Volume<'_, D, R>,
    dirs: &mut Arena<DirHandle, M>,
    parent_first_cluster: Option<u32>,
    name: Option<&str>,
) -> Result<HandleId, FsError> {
    let first_cluster = match name {
        None => parent_first_cluster,
        Some(name) => {
            let found = volume.with_dir(parent_first_cluster, |dir_io| dir::find(dir_io, name))?.ok_or(EntryError::NotFound)?;
            if !found.entry.is_dir() {
                return Err(EntryError::NotDir.into());
            }
            Some(found.entry.first_cluster)
        }
    };

    if dirs.len() >= dirs.capacity() {
        return Err(ResourceError::MemoryExhausted.into());
    }
    let id = dirs.alloc(DirHandle::new(first_cluster)).expect("capacity checked above");
    volume.handle_opened(true);
    Ok(id)
}

/// Returns the next live entry (never an LFN fragment, deleted slot, or
/// volume label), or `None` at the directory's end (spec.md §4.8
/// `dir_read`).
pub fn dir_read<D: PhyDriver, R: Rtos>(volume: &Volume<'_, D, R>, handle: &mut DirHandle) -> Result<Option<DirReadEntry>, FsError> {
    volume.with_dir(handle.first_cluster, |dir_io| {
        let total = dir_io.slot_capacity();
        let mut raw = [0u8; ENTRY_SIZE];

        #[cfg(feature = "long-names")]
        let mut lfn_fragments: heapless::Vec<dir::lfn::LfnFragment, 20> = heapless::Vec::new();

        while handle.read_cursor < total {
            let idx = handle.read_cursor;
            handle.read_cursor += 1;
            dir_io.read_slot(idx, &mut raw)?;

            match dir::entry::slot_state(&raw) {
                dir::entry::SlotState::End => {
                    handle.read_cursor = total;
                    return Ok(None);
                }
                dir::entry::SlotState::Deleted => {
                    #[cfg(feature = "long-names")]
                    lfn_fragments.clear();
                }
                dir::entry::SlotState::Occupied => {
                    #[cfg(feature = "long-names")]
                    if raw[11] == Attributes::LFN.bits() {
                        let _ = lfn_fragments.push(dir::lfn::decode_fragment(&raw));
                        continue;
                    }

                    let decoded = DirEntry::decode(&raw);
                    if decoded.is_volume_id() {
                        #[cfg(feature = "long-names")]
                        lfn_fragments.clear();
                        continue;
                    }

                    #[cfg(feature = "long-names")]
                    if !lfn_fragments.is_empty() {
                        let mut long_name = heapless::String::new();
                        dir::lfn::reassemble(&lfn_fragments, &mut long_name);
                        lfn_fragments.clear();
                        return Ok(Some(DirReadEntry { name: long_name, entry: decoded }));
                    }

                    let short = dir::sfn::decode(&decoded.name_raw);
                    let mut name = heapless::String::new();
                    let _ = name.push_str(short.as_str());
                    return Ok(Some(DirReadEntry { name, entry: decoded }));
                }
            }
        }

        Ok(None)
    })
}

/// Releases a directory handle (spec.md §4.8 `dir_close`).
pub fn dir_close<D: PhyDriver, R: Rtos, const M: usize>(volume: &Volume<'_, D, R>, dirs: &mut Arena<DirHandle, M>, id: HandleId) -> Result<(), FsError> {
    dirs.free(id).ok_or(FileError::NotOpen)?;
    volume.handle_closed(true);
    Ok(())
}
