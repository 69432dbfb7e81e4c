//! The error taxonomy every externally-visible operation returns through.
//!
//! Mirrors the six sub-taxonomies a caller reasons about: device, volume,
//! entry/name, file, resource, and cache errors. Nested enums let call sites
//! match broadly (`FsError::Device(_)`) or narrowly
//! (`FsError::Device(DeviceError::Changed)`).

use thiserror::Error;

/// Errors surfaced by the block-device layer (C2) and its `PhyDriver`.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceError {
    #[error("device I/O error")]
    Io,
    #[error("device operation timed out")]
    Timeout,
    #[error("device not present")]
    NotPresent,
    #[error("media changed since last operation")]
    Changed,
    #[error("device is full")]
    Full,
    #[error("device reports an invalid size")]
    InvalidSize,
    #[error("device reports an invalid sector size")]
    InvalidSectorSize,
    #[error("low-level format is invalid")]
    InvalidLowFormat,
}

/// Errors surfaced by the volume layer (C5).
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum VolumeError {
    #[error("volume is not open")]
    NotOpen,
    #[error("volume is not mounted")]
    NotMounted,
    #[error("volume is already open")]
    AlreadyOpen,
    #[error("volume name is invalid")]
    InvalidName,
    #[error("sector is outside the volume's partition")]
    InvalidSector,
    #[error("volume does not contain a recognized FAT file system")]
    InvalidSystem,
    #[error("volume has open files")]
    FilesOpen,
    #[error("volume has open directories")]
    DirsOpen,
    #[error("volume label contains a forbidden character")]
    LabelInvalid,
    #[error("volume label is longer than 11 bytes")]
    LabelTooLong,
}

/// Errors surfaced while searching, inserting, or deleting directory entries (C7).
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryError {
    #[error("name contains a character outside the legal set")]
    NameInvalid,
    #[error("name is longer than the supported maximum")]
    NameTooLong,
    #[error("entry not found")]
    NotFound,
    #[error("a component of the parent path was not found")]
    ParentNotFound,
    #[error("entry already exists")]
    Exists,
    #[error("entry is not a file")]
    NotFile,
    #[error("entry is not a directory")]
    NotDir,
    #[error("directory entry is corrupt")]
    Corrupt,
    #[error("operation is not valid on the root directory")]
    RootDir,
    #[error("entry is read-only")]
    ReadOnly,
}

/// Errors surfaced by file handle operations (C8/C9).
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileError {
    #[error("access mode is invalid for this operation")]
    InvalidAccessMode,
    #[error("operation is invalid for this handle")]
    InvalidOp,
    #[error("operation is invalid in the current sequence of operations")]
    InvalidOpSeq,
    #[error("position or size would exceed the maximum representable file size")]
    Overflow,
    #[error("sticky per-handle error flag is set")]
    Error,
    #[error("file handle is not open")]
    NotOpen,
    #[error("file is locked by another owner")]
    Locked,
    #[error("file is already open with an incompatible access mode")]
    AlreadyOpen,
    #[error("requested offset is invalid for a read-only handle")]
    InvalidOffset,
}

/// Errors surfaced by fixed-capacity resource pools (C1, C9).
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceError {
    #[error("buffer pool is empty")]
    PoolEmpty,
    #[error("no buffer is available for this operation")]
    BufferUnavailable,
    #[error("a fixed-capacity arena is exhausted")]
    MemoryExhausted,
    #[error("the host RTOS lock primitive failed")]
    OsLock,
}

/// Errors surfaced by the sector cache (C4).
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheError {
    #[error("cache mode is invalid for this operation")]
    InvalidMode,
    #[error("cache is too small for the requested partitioning")]
    TooSmall,
    #[error("sector type is invalid for this cache")]
    InvalidSectorType,
}

/// The top-level error type every public API in this crate returns.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsError {
    #[error("device error: {0}")]
    Device(#[from] DeviceError),
    #[error("volume error: {0}")]
    Volume(#[from] VolumeError),
    #[error("entry error: {0}")]
    Entry(#[from] EntryError),
    #[error("file error: {0}")]
    File(#[from] FileError),
    #[error("resource error: {0}")]
    Resource(#[from] ResourceError),
    #[error("cache error: {0}")]
    Cache(#[from] CacheError),
}

pub type FsResult<T> = Result<T, FsError>;

/// Bridges a `PhyDriver`-reported error (generic over the driver's own error
/// type, as the driver may not be able to distinguish every case in
/// [`DeviceError`]) into the taxonomy above. Drivers that can't tell a timeout
/// from a generic I/O failure should map to `DeviceError::Io`.
pub trait IntoDeviceError {
    fn into_device_error(self) -> DeviceError;
}
