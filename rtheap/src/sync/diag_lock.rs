//! # Diagnostic Lock
//!
//! An interrupt-safe spinlock for state touched from interrupt handlers.
//!
//! Acquiring masks local interrupts first, then busy-waits for cross-core
//! ownership; the owner word holds the core number of the holder. Releasing
//! frees the owner word and restores the saved interrupt state, so nested
//! lock/unlock pairs on one core compose.
//!
//! The lock never sleeps and never fails. It is not reentrant: acquiring
//! the same lock twice on one core deadlocks, and nothing checks for it.
//!
//! Counters are a type-level choice. [`Plain`] keeps none, [`Instrumented`]
//! keeps per-core acquire/release counts and the spin high-water mark. The
//! counters are updated after ownership changes hands and never feed back
//! into acquisition.
//!
//! Without the `smp` feature and with [`Plain`] counters there is nobody to
//! contend with, and the lock reduces to interrupt masking.

use core::cell::UnsafeCell;
use core::marker::PhantomData;
use core::ops::{Deref, DerefMut};
use core::panic::Location;
use core::sync::atomic::{AtomicPtr, AtomicU64, AtomicUsize, Ordering};

use super::cpu::{CpuControl, DefaultCpu, IrqFlags, MAX_CORES};

/// Owner word value when nobody holds the lock
const NO_OWNER: usize = usize::MAX;

/// Whether ownership must be arbitrated between cores
const CROSS_CORE: bool = cfg!(feature = "smp");

/// Counter policy for a [`DiagLock`]
pub trait LockDiagnostics: Sync {
    /// Whether this policy records anything
    const ENABLED: bool;

    /// Initial (all-zero) state
    const INIT: Self;

    /// Called by the new owner right after it took the lock
    fn on_acquire(&self, core: usize, spins: u64, site: &'static Location<'static>);

    /// Called by the owner right before it gives the lock up
    fn on_release(&self, core: usize);

    /// Snapshot of everything recorded so far
    fn stats(&self) -> LockStats;
}

/// No counters at all
pub struct Plain;

impl LockDiagnostics for Plain {
    const ENABLED: bool = false;
    const INIT: Self = Plain;

    #[inline(always)]
    fn on_acquire(&self, _core: usize, _spins: u64, _site: &'static Location<'static>) {}

    #[inline(always)]
    fn on_release(&self, _core: usize) {}

    fn stats(&self) -> LockStats {
        LockStats::EMPTY
    }
}

/// Counters owned by one core
///
/// Only the owning core writes its slot, so plain relaxed increments
/// are enough. All counters wrap.
struct CoreCounters {
    locks: AtomicU64,
    unlocks: AtomicU64,
    max_spins: AtomicU64,
}

const CORE_COUNTERS_INIT: CoreCounters = CoreCounters {
    locks: AtomicU64::new(0),
    unlocks: AtomicU64::new(0),
    max_spins: AtomicU64::new(0),
};

/// Per-core acquire/release counters and spin high-water marks
pub struct Instrumented {
    cores: [CoreCounters; MAX_CORES],
    /// Source location of the most recent acquisition
    last_site: AtomicPtr<Location<'static>>,
}

impl LockDiagnostics for Instrumented {
    const ENABLED: bool = true;
    const INIT: Self = Instrumented {
        cores: [CORE_COUNTERS_INIT; MAX_CORES],
        last_site: AtomicPtr::new(core::ptr::null_mut()),
    };

    fn on_acquire(&self, core: usize, spins: u64, site: &'static Location<'static>) {
        let slot = &self.cores[core % MAX_CORES];
        slot.locks.fetch_add(1, Ordering::Relaxed);
        slot.max_spins.fetch_max(spins, Ordering::Relaxed);
        self.last_site
            .store(site as *const Location<'static> as *mut _, Ordering::Relaxed);
    }

    fn on_release(&self, core: usize) {
        self.cores[core % MAX_CORES]
            .unlocks
            .fetch_add(1, Ordering::Relaxed);
    }

    fn stats(&self) -> LockStats {
        let mut stats = LockStats::EMPTY;
        for (out, slot) in stats.cores.iter_mut().zip(self.cores.iter()) {
            *out = CoreLockStats {
                lock_count: slot.locks.load(Ordering::Relaxed),
                unlock_count: slot.unlocks.load(Ordering::Relaxed),
                max_spins: slot.max_spins.load(Ordering::Relaxed),
            };
        }
        let site = self.last_site.load(Ordering::Relaxed);
        // SAFETY: only ever stores `&'static Location` values
        stats.last_site = unsafe { site.as_ref() };
        stats
    }
}

/// Lock counter policy used when a lock does not name one
#[cfg(feature = "lock-diagnostics")]
pub type DefaultDiag = Instrumented;

/// Lock counter policy used when a lock does not name one
#[cfg(not(feature = "lock-diagnostics"))]
pub type DefaultDiag = Plain;

/// Counters recorded on one core
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CoreLockStats {
    pub lock_count: u64,
    pub unlock_count: u64,
    /// Longest busy-wait observed before acquiring, in spin iterations
    pub max_spins: u64,
}

/// Snapshot of a lock's counters
#[derive(Debug, Clone, Copy)]
pub struct LockStats {
    pub cores: [CoreLockStats; MAX_CORES],
    pub last_site: Option<&'static Location<'static>>,
}

impl LockStats {
    const EMPTY: LockStats = LockStats {
        cores: [CoreLockStats {
            lock_count: 0,
            unlock_count: 0,
            max_spins: 0,
        }; MAX_CORES],
        last_site: None,
    };

    /// Acquisitions summed over all cores
    pub fn total_locks(&self) -> u64 {
        self.cores
            .iter()
            .fold(0u64, |acc, c| acc.wrapping_add(c.lock_count))
    }

    /// Releases summed over all cores
    pub fn total_unlocks(&self) -> u64 {
        self.cores
            .iter()
            .fold(0u64, |acc, c| acc.wrapping_add(c.unlock_count))
    }

    /// Spin high-water mark over all cores
    pub fn max_spins(&self) -> u64 {
        self.cores.iter().map(|c| c.max_spins).max().unwrap_or(0)
    }
}

/// An interrupt-safe spinlock with optional per-core counters
pub struct DiagLock<T, D: LockDiagnostics = DefaultDiag, C: CpuControl = DefaultCpu> {
    /// Core number of the holder, or `NO_OWNER`
    owner: AtomicUsize,
    diag: D,
    data: UnsafeCell<T>,
    /// Name shown in diagnostics
    name: &'static str,
    _cpu: PhantomData<fn() -> C>,
}

unsafe impl<T: Send, D: LockDiagnostics, C: CpuControl> Sync for DiagLock<T, D, C> {}
unsafe impl<T: Send, D: LockDiagnostics, C: CpuControl> Send for DiagLock<T, D, C> {}

impl<T, D: LockDiagnostics, C: CpuControl> DiagLock<T, D, C> {
    pub const fn new(data: T, name: &'static str) -> Self {
        Self {
            owner: AtomicUsize::new(NO_OWNER),
            diag: D::INIT,
            data: UnsafeCell::new(data),
            name,
            _cpu: PhantomData,
        }
    }

    /// Acquire the lock, masking local interrupts until the guard drops
    ///
    /// Safe from interrupt context and while holding unrelated locks.
    #[track_caller]
    pub fn lock(&self) -> DiagLockGuard<'_, T, D, C> {
        // Mask first: an interrupt taken while we own the word would
        // deadlock on this core
        let flags = C::irq_save();
        let core = C::core_id();

        if CROSS_CORE || D::ENABLED {
            let mut spins: u64 = 0;
            while self
                .owner
                .compare_exchange_weak(NO_OWNER, core, Ordering::Acquire, Ordering::Relaxed)
                .is_err()
            {
                while self.owner.load(Ordering::Relaxed) != NO_OWNER {
                    core::hint::spin_loop();
                    spins = spins.wrapping_add(1);
                }
            }
            self.diag.on_acquire(core, spins, Location::caller());
        }

        DiagLockGuard {
            lock: self,
            flags,
            core,
            _not_send: PhantomData,
        }
    }

    /// Acquire the lock only if nobody holds it
    ///
    /// The interrupt state is left untouched on failure.
    #[track_caller]
    pub fn try_lock(&self) -> Option<DiagLockGuard<'_, T, D, C>> {
        let flags = C::irq_save();
        let core = C::core_id();

        if CROSS_CORE || D::ENABLED {
            if self
                .owner
                .compare_exchange(NO_OWNER, core, Ordering::Acquire, Ordering::Relaxed)
                .is_err()
            {
                C::irq_restore(flags);
                return None;
            }
            self.diag.on_acquire(core, 0, Location::caller());
        }

        Some(DiagLockGuard {
            lock: self,
            flags,
            core,
            _not_send: PhantomData,
        })
    }

    /// Whether some core holds the lock right now
    pub fn is_locked(&self) -> bool {
        self.owner.load(Ordering::Relaxed) != NO_OWNER
    }

    /// Core number of the current holder
    pub fn owner(&self) -> Option<usize> {
        match self.owner.load(Ordering::Relaxed) {
            NO_OWNER => None,
            core => Some(core),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Counter snapshot; all zero for [`Plain`] locks
    pub fn stats(&self) -> LockStats {
        self.diag.stats()
    }

    /// Exclusive access without locking, for set-up before sharing
    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }

    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

/// Holds a [`DiagLock`]; releases it and restores interrupts on drop
///
/// The guard must be dropped on the core that created it.
pub struct DiagLockGuard<'a, T, D: LockDiagnostics, C: CpuControl> {
    lock: &'a DiagLock<T, D, C>,
    flags: IrqFlags,
    core: usize,
    _not_send: PhantomData<*mut ()>,
}

impl<T, D: LockDiagnostics, C: CpuControl> Deref for DiagLockGuard<'_, T, D, C> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the guard proves exclusive ownership
        unsafe { &*self.lock.data.get() }
    }
}

impl<T, D: LockDiagnostics, C: CpuControl> DerefMut for DiagLockGuard<'_, T, D, C> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: the guard proves exclusive ownership
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T, D: LockDiagnostics, C: CpuControl> Drop for DiagLockGuard<'_, T, D, C> {
    fn drop(&mut self) {
        if CROSS_CORE || D::ENABLED {
            self.lock.diag.on_release(self.core);
            self.lock.owner.store(NO_OWNER, Ordering::Release);
        }
        C::irq_restore(self.flags);
    }
}
