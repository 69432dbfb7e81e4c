//! An embedded FAT12/16/32 filesystem for sector-oriented block devices.
//!
//! Built in layers (spec.md §2): a buffer pool and block device at the
//! bottom, a typed sector cache and volume above that, the FAT chain engine
//! and directory engine beside each other, and the syscall layer, handle
//! manager, journal hook, and path parser tying it all together. A
//! [`context::Filesystem`] is the one thing an embedding application
//! constructs to get access to all of it.

#![cfg_attr(all(feature = "no_std", not(test)), no_std)]

#[allow(unused_extern_crates)]
extern crate core; // makes rls actually look into the standard library (hack)

#[cfg_attr(target_os = "none", panic_handler)]
#[cfg(target_os = "none")]
fn panic(_info: &core::panic::PanicInfo) -> ! {
    loop {}
}

pub mod buffer;
pub mod cache;
pub mod clock;
pub mod context;
pub mod device;
pub mod dir;
pub mod error;
pub mod fat;
pub mod handle;
pub mod journal;
pub mod partition;
pub mod path;
pub mod phy;
pub mod rtos;
pub mod sys;
pub mod volume;

pub use context::{Filesystem, FsConfig, VolumeTable};
pub use error::{FsError, FsResult};
