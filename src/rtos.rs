//! The `Rtos` collaborator: host mutex/semaphore primitives.
//!
//! Nothing here implements poisoning! If you panic while holding one of these
//! locks, no guarantees are made about what happens next.
//!
//! (We're okay with this because, as configured, we can't recover from panics
//! on embedded anyway — the panic handler just spins forever.)

/// A single lock backing one of the tiers in §5 (registry / device access /
/// device operation / advisory file lock).
pub trait MutexHandle<T> {
    fn new(inner: T) -> Self;

    /// Runs `func` in a critical section.
    fn cs<F: FnOnce(&mut T) -> R, R>(&self, func: F) -> R;

    /// Mutable access using a `&mut` reference: since Rust can statically
    /// prove exclusive access here, no locking occurs.
    fn get_mut(&mut self) -> &mut T;
}

/// The external collaborator named in spec.md §6: host OS mutex/semaphore
/// primitives, abstracted so the core never assumes a particular RTOS.
pub trait Rtos {
    type Mutex<T>: MutexHandle<T>;

    fn new_mutex<T>(&self, inner: T) -> Self::Mutex<T> {
        Self::Mutex::<T>::new(inner)
    }
}

#[cfg(feature = "std")]
pub mod from_std {
    use super::MutexHandle;

    pub use std::sync::Mutex;

    impl<T: Send> MutexHandle<T> for Mutex<T> {
        fn new(inner: T) -> Self {
            Mutex::new(inner)
        }

        #[inline]
        fn cs<F: FnOnce(&mut T) -> R, R>(&self, func: F) -> R {
            let mut inner = self.lock().unwrap();
            func(&mut *inner)
        }

        #[inline]
        fn get_mut(&mut self) -> &mut T {
            (*self).get_mut().unwrap()
        }
    }

    /// The default `Rtos` for hosted builds: std's `Mutex`.
    #[derive(Debug, Default, Clone, Copy)]
    pub struct StdRtos;

    impl super::Rtos for StdRtos {
        type Mutex<T> = Mutex<T>;
    }
}

/// Backs the `Rtos` collaborator with an opaque C semaphore, for targets
/// whose RTOS this crate has no built-in binding for. The three FFI hooks
/// below are the entire contract a host RTOS must satisfy.
#[cfg(feature = "external_mutex")]
pub mod external_mutex {
    use super::MutexHandle;

    use core::cell::Cell;
    use core::ptr;

    #[repr(C)]
    pub struct TcbList {
        _priv: [u8; 0],
    }

    #[repr(C)]
    pub struct Semaphore {
        locked: u8,
        blocked: *mut TcbList,
    }

    extern "C" {
        fn semaphore_init(s: *mut Semaphore, locked: u8);
        fn semaphore_wait(s: *mut Semaphore);
        fn semaphore_signal(s: *mut Semaphore);
    }

    pub struct Mutex<T> {
        semaphore: Cell<Semaphore>,
        inner: Cell<T>,
    }

    impl<T: Send> MutexHandle<T> for Mutex<T> {
        fn new(inner: T) -> Self {
            let semaphore = Cell::new(Semaphore {
                locked: 0,
                blocked: ptr::null::<TcbList>() as *mut TcbList,
            });

            unsafe {
                semaphore_init(semaphore.as_ptr(), 0);
            }

            Self {
                semaphore,
                inner: Cell::new(inner),
            }
        }

        #[inline]
        fn cs<F: FnOnce(&mut T) -> R, R>(&self, func: F) -> R {
            unsafe {
                semaphore_wait(self.semaphore.as_ptr());
            }

            let res = func(unsafe { &mut *self.inner.as_ptr() });

            unsafe {
                semaphore_signal(self.semaphore.as_ptr());
            }

            res
        }

        #[inline]
        fn get_mut(&mut self) -> &mut T {
            self.inner.get_mut()
        }
    }

    // The RTOS binding promises this.
    unsafe impl<T> Sync for Mutex<T> where T: Send {}

    #[derive(Debug, Default, Clone, Copy)]
    pub struct ExternalRtos;

    impl super::Rtos for ExternalRtos {
        type Mutex<T> = Mutex<T>;
    }
}

/// Cortex-M critical-section backed lock, for bare-metal ARM targets with no
/// external RTOS.
#[cfg(all(target_arch = "arm", not(feature = "external_mutex")))]
pub mod bare_metal_rtos {
    use super::MutexHandle;

    use core::cell::Cell;

    use bare_metal::CriticalSection;
    use cortex_m::interrupt;

    pub struct Mutex<T> {
        inner: Cell<T>,
    }

    impl<T> Mutex<T> {
        #[inline]
        pub fn borrow<'cs>(&'cs self, _cs: &'cs CriticalSection) -> &'cs mut T {
            unsafe { &mut *self.inner.as_ptr() }
        }
    }

    impl<T: Send> MutexHandle<T> for Mutex<T> {
        fn new(value: T) -> Self {
            Mutex {
                inner: Cell::new(value),
            }
        }

        #[inline]
        fn cs<F: FnOnce(&mut T) -> R, R>(&self, func: F) -> R {
            interrupt::free(|cs| func(self.borrow(cs)))
        }

        #[inline]
        fn get_mut(&mut self) -> &mut T {
            self.inner.get_mut()
        }
    }

    unsafe impl<T> Sync for Mutex<T> where T: Send {}

    #[derive(Debug, Default, Clone, Copy)]
    pub struct BareMetalRtos;

    impl super::Rtos for BareMetalRtos {
        type Mutex<T> = Mutex<T>;
    }
}

cfg_if::cfg_if! {
    if #[cfg(feature = "external_mutex")] {
        pub use external_mutex::{ExternalRtos as DefaultRtos};
    } else if #[cfg(all(target_arch = "arm", feature = "no_std"))] {
        pub use bare_metal_rtos::{BareMetalRtos as DefaultRtos};
    } else if #[cfg(feature = "std")] {
        pub use from_std::{StdRtos as DefaultRtos};
    } else {
        compile_error!("Enable `std`, `external_mutex`, or build for `target_arch = \"arm\"` \
            with `no_std` to select an `Rtos` implementation.");
    }
}

/// A counted re-entrant wrapper around an `Rtos::Mutex`, used for the per-
/// device access lock (tier 2 in §5), which must be acquirable recursively by
/// the thread already holding it (e.g. format calling into refresh).
pub struct RecursiveLock<R: Rtos> {
    owner: R::Mutex<Option<(u32, u32)>>, // (task id, depth)
}

impl<R: Rtos> RecursiveLock<R> {
    pub fn new(rtos: &R) -> Self {
        Self {
            owner: rtos.new_mutex(None),
        }
    }

    /// Acquires the lock, incrementing the depth if `task` already holds it.
    /// Returns the depth *before* this acquisition (0 ⇒ freshly acquired).
    pub fn acquire(&self, task: u32) -> u32 {
        self.owner.cs(|slot| match slot {
            Some((owner, depth)) if *owner == task => {
                let prev = *depth;
                *depth += 1;
                prev
            }
            _ => {
                *slot = Some((task, 1));
                0
            }
        })
    }

    /// Releases one level; clears ownership entirely once depth hits 0.
    pub fn release(&self, task: u32) {
        self.owner.cs(|slot| {
            if let Some((owner, depth)) = slot {
                if *owner == task {
                    *depth -= 1;
                    if *depth == 0 {
                        *slot = None;
                    }
                }
            }
        });
    }
}
