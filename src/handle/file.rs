//! File handle state: position/size bookkeeping, the per-file buffer, and
//! the advisory lock (spec.md §4.9, §3.1 "File handle").
//!
//! Grounded in `original_source/Source/fs_file.c`'s single `FS_FILE` buffer
//! with a `NONE`/`RD`/`WR` direction flag (see SPEC_FULL.md §4.9a); the
//! teacher's `fat/file.rs` had no buffering at all (`read`/`write` hit the
//! device every call).

use crate::buffer::BufferHandle;
use crate::error::{FileError, FsError};
use crate::phy::MAX_SECTOR_SIZE;

/// Which way the per-file buffer is currently facing (spec.md §4.9a).
/// Flips to `None` (flushing first, if `Write`) on `fseek`/`fflush`/`fclose`
/// and whenever a read or write crosses into a different sector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferDirection {
    None,
    Read,
    Write,
}

/// The single sector-sized buffer backing one open file (spec.md §4.9a:
/// "a file handle's buffer with a single FS_BUF whose direction is tracked
/// exactly"). Borrows its storage from the shared [`crate::buffer::BufferPool`]
/// for the handle's lifetime.
pub struct FileBuffer {
    pub handle: BufferHandle,
    pub direction: BufferDirection,
    /// Volume-relative sector currently buffered; meaningless while
    /// `direction == None`.
    pub sector: u32,
}

impl FileBuffer {
    pub fn new(handle: BufferHandle) -> Self {
        Self { handle, direction: BufferDirection::None, sector: 0 }
    }

    pub fn is_dirty(&self) -> bool {
        matches!(self.direction, BufferDirection::Write)
    }

    pub fn holds(&self, sector: u32) -> bool {
        self.direction != BufferDirection::None && self.sector == sector
    }
}

/// Per-handle advisory lock state (spec.md §4.9, §5 tier 4): a single
/// owning task may hold it recursively; any other task is refused.
#[cfg(feature = "advisory-locks")]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdvisoryLock {
    owner: u32,
    count: u32,
}

#[cfg(feature = "advisory-locks")]
impl AdvisoryLock {
    pub fn try_acquire(slot: &mut Option<AdvisoryLock>, task: u32) -> Result<(), FsError> {
        match slot {
            None => {
                *slot = Some(AdvisoryLock { owner: task, count: 1 });
                Ok(())
            }
            Some(lock) if lock.owner == task => {
                lock.count += 1;
                Ok(())
            }
            Some(_) => Err(FileError::Locked.into()),
        }
    }

    pub fn release(slot: &mut Option<AdvisoryLock>, task: u32) -> Result<(), FsError> {
        match slot {
            Some(lock) if lock.owner == task => {
                lock.count -= 1;
                if lock.count == 0 {
                    *slot = None;
                }
                Ok(())
            }
            _ => Err(FileError::InvalidOp.into()),
        }
    }

    pub fn owner(slot: &Option<AdvisoryLock>) -> Option<u32> {
        slot.map(|l| l.owner)
    }
}

/// Access mode a file was opened with (spec.md §4.8 `file_open`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenAccess {
    Read,
    Write,
    ReadWrite,
    Append,
}

impl OpenAccess {
    pub fn can_read(self) -> bool {
        matches!(self, OpenAccess::Read | OpenAccess::ReadWrite)
    }

    pub fn can_write(self) -> bool {
        matches!(self, OpenAccess::Write | OpenAccess::ReadWrite | OpenAccess::Append)
    }
}

/// One open file (spec.md §3.1 "File handle", §4.9). Lives in a
/// [`crate::handle::Arena`] slot, addressed by the [`crate::handle::HandleId`]
/// returned at open.
pub struct FileHandle {
    pub parent_dir_first_cluster: Option<u32>,
    pub dir_slot: u32,
    pub first_cluster: u32,
    pub size: u32,
    pub position: u32,
    /// Cluster currently addressed by `position` and the 0-based index of
    /// that cluster within the chain, kept in sync so seeks don't have to
    /// re-walk the chain from the head every time.
    pub current_cluster: u32,
    pub current_cluster_index: u32,
    pub access: OpenAccess,
    pub buffer: FileBuffer,
    /// Sticky per-handle error flag (spec.md §4.9 "Error"): once set, every
    /// subsequent operation on this handle fails until it is explicitly
    /// cleared or the handle is closed.
    pub error_flag: bool,
    pub eof_flag: bool,
    #[cfg(feature = "advisory-locks")]
    pub lock: Option<AdvisoryLock>,
}

impl FileHandle {
    pub fn new(
        parent_dir_first_cluster: Option<u32>,
        dir_slot: u32,
        first_cluster: u32,
        size: u32,
        access: OpenAccess,
        buffer: FileBuffer,
    ) -> Self {
        Self {
            parent_dir_first_cluster,
            dir_slot,
            first_cluster,
            size,
            position: 0,
            current_cluster: first_cluster,
            current_cluster_index: 0,
            access,
            buffer,
            error_flag: false,
            eof_flag: false,
            #[cfg(feature = "advisory-locks")]
            lock: None,
        }
    }

    pub fn check_error(&self) -> Result<(), FsError> {
        if self.error_flag {
            return Err(FileError::Error.into());
        }
        Ok(())
    }

    pub fn byte_offset_in_cluster(&self, bytes_per_cluster: u32) -> u32 {
        self.position % bytes_per_cluster
    }

    pub fn sector_in_file(&self, sector_size: u16) -> u32 {
        self.position / sector_size as u32
    }
}

const _: () = assert!(MAX_SECTOR_SIZE >= 512);
