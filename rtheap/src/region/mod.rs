//! # Memory Regions
//!
//! A region multiplexes one host block between the kernel and any number of
//! user views. It owns the block exclusively and lays a [`Heap`] over it.
//!
//! ## Lifetime
//! - Created with one reference, held by whoever registered it
//! - Every user view adds one reference, every closed view drops one
//! - The drop that reaches zero destroys the heap, hands the block back to
//!   the host and runs the release callback, exactly once
//!
//! The region value itself (tag, size, counters) outlives destruction for
//! as long as somebody holds an `Arc` to it; only the backing is gone.
//!
//! Creation and destruction may block in the host and must not run with
//! interrupts masked. Reference counting, allocation and snapshots are
//! short and safe anywhere.

pub mod buddy;
pub mod heap;
pub mod host;

pub use buddy::BuddyHeap;
pub use heap::Heap;
pub use host::{page_align, HostMemory, PageBlock, SystemPages, PAGE_SHIFT, PAGE_SIZE};

use alloc::boxed::Box;
use alloc::sync::Arc;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicUsize, Ordering};

use crate::error::MemError;
use crate::sync::{CpuControl, DefaultCpu, DiagLock};

bitflags::bitflags! {
    /// What a region lets its users do
    pub struct RegionCaps: u32 {
        const ALLOC = 0b001;
        const MAP   = 0b010;
        const STAT  = 0b100;
    }
}

impl RegionCaps {
    /// Allocate, map and query: shared and private regions
    pub fn mappable() -> Self {
        Self::ALLOC | Self::MAP | Self::STAT
    }

    /// Query only: the system region
    pub fn stats_only() -> Self {
        Self::STAT
    }
}

/// Called once, after the backing of a region has been returned
pub type ReleaseFn = Box<dyn FnOnce(&'static str) + Send>;

/// Size and free space of a region, read at one instant
///
/// Laid out as the fixed 16-byte record handed to user space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct RegionStat {
    pub size: u64,
    pub free: u64,
}

impl RegionStat {
    pub const WIRE_SIZE: usize = 16;

    /// The record in native byte order
    pub fn to_ne_bytes(&self) -> [u8; Self::WIRE_SIZE] {
        let mut out = [0u8; Self::WIRE_SIZE];
        out[..8].copy_from_slice(&self.size.to_ne_bytes());
        out[8..].copy_from_slice(&self.free.to_ne_bytes());
        out
    }
}

struct Backing<H> {
    block: PageBlock,
    heap: H,
}

/// A reference-counted heap over one host block
pub struct MemoryRegion<H: Heap = BuddyHeap> {
    tag: &'static str,
    caps: RegionCaps,
    /// Page-rounded size, fixed at creation
    size: usize,
    /// Block address, fixed at creation; only meaningful while not destroyed
    base: usize,
    refcount: AtomicUsize,
    /// `None` once destroyed
    backing: DiagLock<Option<Backing<H>>>,
    release: spin::Mutex<Option<ReleaseFn>>,
    host: Arc<dyn HostMemory>,
}

impl<H: Heap> MemoryRegion<H> {
    /// Create a region of at least `size` bytes with one reference
    ///
    /// The size is rounded up to the host page size. The block is
    /// requested uncached when the host reports cache aliasing. If the
    /// heap cannot be laid over the block, the block goes back before
    /// failing.
    pub fn create(
        host: Arc<dyn HostMemory>,
        tag: &'static str,
        size: usize,
        caps: RegionCaps,
        release: Option<ReleaseFn>,
    ) -> Result<Self, MemError> {
        debug_assert!(
            !DefaultCpu::irqs_disabled(),
            "region creation may block in the host"
        );

        if size == 0 {
            return Err(MemError::InvalidArgument);
        }
        let size = page_align(size, host.page_size()).ok_or(MemError::InvalidArgument)?;

        let block = host.allocate_zeroed_pages(size, !host.cache_aliasing())?;

        // SAFETY: the block is fresh, exclusively ours, and outlives the heap
        let heap = match unsafe { H::init(block.base(), size) } {
            Ok(heap) => heap,
            Err(err) => {
                log::warn!("{}: heap init over {} bytes failed: {}", tag, size, err);
                // SAFETY: nothing points into the block yet
                unsafe { host.free_pages(block) };
                return Err(MemError::OutOfMemory);
            }
        };

        let base = block.base().as_ptr() as usize;
        log::debug!("{}: {} KiB at {:#x}", tag, size / 1024, base);

        Ok(Self {
            tag,
            caps,
            size,
            base,
            refcount: AtomicUsize::new(1),
            backing: DiagLock::new(Some(Backing { block, heap }), tag),
            release: spin::Mutex::new(release),
            host,
        })
    }

    /// Take one more reference on behalf of a holder that already has one,
    /// as when a user view is duplicated
    pub fn acquire_reference(&self) {
        let prev = self.refcount.fetch_add(1, Ordering::SeqCst);
        debug_assert!(prev > 0, "{}: reference taken on a destroyed region", self.tag);
    }

    /// Take a reference unless the region is already destroyed
    ///
    /// Never moves the count off zero, so a region that lost its last
    /// reference stays gone even if a new view races with the final close.
    pub fn try_acquire_reference(&self) -> Result<(), MemError> {
        let mut current = self.refcount.load(Ordering::SeqCst);
        loop {
            if current == 0 {
                return Err(MemError::NoSuchDevice);
            }
            match self.refcount.compare_exchange_weak(
                current,
                current + 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return Ok(()),
                Err(actual) => current = actual,
            }
        }
    }

    /// Drop one reference; the call that drops the last one destroys
    ///
    /// Returns whether this call performed the destruction. Concurrent
    /// callers race on the decrement, and only the one that moves the
    /// count from one to zero wins.
    pub fn release_reference(&self) -> bool {
        let mut current = self.refcount.load(Ordering::SeqCst);
        loop {
            if current == 0 {
                debug_assert!(false, "{}: reference dropped below zero", self.tag);
                return false;
            }
            match self.refcount.compare_exchange_weak(
                current,
                current - 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }

        if current == 1 {
            self.destroy();
            true
        } else {
            false
        }
    }

    /// Destructive path, reached once per region
    fn destroy(&self) {
        debug_assert!(
            !DefaultCpu::irqs_disabled(),
            "region destruction may block in the host"
        );

        let backing = self.backing.lock().take();
        if let Some(Backing { block, heap }) = backing {
            heap.destroy();
            // SAFETY: the heap is gone and no reference remains
            unsafe { self.host.free_pages(block) };
        }

        if let Some(release) = self.release.lock().take() {
            release(self.tag);
        }
        log::debug!("{}: destroyed", self.tag);
    }

    /// Allocate `size` bytes from the region heap
    pub fn allocate(&self, size: usize) -> Result<NonNull<u8>, MemError> {
        if !self.caps.contains(RegionCaps::ALLOC) {
            return Err(MemError::PermissionDenied);
        }
        let mut backing = self.backing.lock();
        let backing = backing.as_mut().ok_or(MemError::NoSuchDevice)?;
        backing.heap.alloc(size)
    }

    /// Return an allocation to the region heap
    ///
    /// # Safety
    ///
    /// `ptr` must come from `allocate` on this region and must not be used
    /// afterwards.
    pub unsafe fn free(&self, ptr: NonNull<u8>) -> Result<(), MemError> {
        if !self.caps.contains(RegionCaps::ALLOC) {
            return Err(MemError::PermissionDenied);
        }
        let mut backing = self.backing.lock();
        let backing = backing.as_mut().ok_or(MemError::NoSuchDevice)?;
        backing.heap.free(ptr)
    }

    /// Total and free bytes, read together under the region lock
    pub fn snapshot(&self) -> Result<RegionStat, MemError> {
        if !self.caps.contains(RegionCaps::STAT) {
            return Err(MemError::PermissionDenied);
        }
        let backing = self.backing.lock();
        let backing = backing.as_ref().ok_or(MemError::NoSuchDevice)?;
        Ok(RegionStat {
            size: backing.heap.size() as u64,
            free: backing.heap.free_bytes() as u64,
        })
    }

    pub fn tag(&self) -> &'static str {
        self.tag
    }

    pub fn caps(&self) -> RegionCaps {
        self.caps
    }

    /// Page-rounded size of the backing block
    pub fn size(&self) -> usize {
        self.size
    }

    /// Start of the backing block, while the region is alive
    pub fn base_address(&self) -> Option<NonNull<u8>> {
        if self.is_destroyed() {
            return None;
        }
        NonNull::new(self.base as *mut u8)
    }

    pub fn refcount(&self) -> usize {
        self.refcount.load(Ordering::SeqCst)
    }

    pub fn is_destroyed(&self) -> bool {
        self.refcount() == 0
    }

    pub(crate) fn host(&self) -> &Arc<dyn HostMemory> {
        &self.host
    }
}

impl<H: Heap> core::fmt::Debug for MemoryRegion<H> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("MemoryRegion")
            .field("tag", &self.tag)
            .field("size", &self.size)
            .field("refcount", &self.refcount())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockHeap, MockHost};
    use core::sync::atomic::AtomicUsize;

    fn region(host: &Arc<MockHost>, size: usize) -> MemoryRegion {
        MemoryRegion::create(host.clone(), "test heap", size, RegionCaps::mappable(), None).unwrap()
    }

    #[test]
    fn test_create_rounds_to_pages_and_is_all_free() {
        let host = Arc::new(MockHost::new());
        let r = region(&host, 10_000);

        let stat = r.snapshot().unwrap();
        assert_eq!(stat.size, 3 * PAGE_SIZE as u64);
        assert_eq!(stat.free, stat.size);
        assert_eq!(r.size(), 3 * PAGE_SIZE);
        assert_eq!(r.refcount(), 1);
        assert_eq!(host.live_blocks(), 1);
    }

    #[test]
    fn test_create_rejects_zero_size() {
        let host = Arc::new(MockHost::new());
        let err = MemoryRegion::<BuddyHeap>::create(host, "zero", 0, RegionCaps::mappable(), None)
            .unwrap_err();
        assert_eq!(err, MemError::InvalidArgument);
    }

    #[test]
    fn test_host_failure_is_out_of_memory() {
        let host = Arc::new(MockHost::new());
        host.fail_next_allocs(1);
        let err = MemoryRegion::<BuddyHeap>::create(
            host.clone(),
            "oom",
            PAGE_SIZE,
            RegionCaps::mappable(),
            None,
        )
        .unwrap_err();
        assert_eq!(err, MemError::OutOfMemory);
        assert_eq!(host.live_blocks(), 0);
    }

    #[test]
    fn test_heap_init_failure_returns_block() {
        let host = Arc::new(MockHost::new());
        MockHeap::fail_next_inits(1);
        let err = MemoryRegion::<MockHeap>::create(
            host.clone(),
            "bad heap",
            PAGE_SIZE,
            RegionCaps::mappable(),
            None,
        )
        .unwrap_err();
        assert_eq!(err, MemError::OutOfMemory);
        assert_eq!(host.live_blocks(), 0, "block must go back before failing");
    }

    #[test]
    fn test_allocate_then_free_restores_free() {
        let host = Arc::new(MockHost::new());
        let r = region(&host, 4 * PAGE_SIZE);
        let before = r.snapshot().unwrap().free;

        let p = r.allocate(300).unwrap();
        assert!(r.snapshot().unwrap().free < before);

        unsafe { r.free(p).unwrap() };
        assert_eq!(r.snapshot().unwrap().free, before);
    }

    #[test]
    fn test_release_to_zero_destroys_once() {
        let host = Arc::new(MockHost::new());
        let released = Arc::new(AtomicUsize::new(0));
        let seen = released.clone();
        let r: MemoryRegion = MemoryRegion::create(
            host.clone(),
            "callback",
            PAGE_SIZE,
            RegionCaps::mappable(),
            Some(Box::new(move |tag: &'static str| {
                assert_eq!(tag, "callback");
                seen.fetch_add(1, Ordering::SeqCst);
            })),
        )
        .unwrap();

        r.acquire_reference();
        assert!(!r.release_reference());
        assert_eq!(released.load(Ordering::SeqCst), 0);
        assert_eq!(host.live_blocks(), 1);

        assert!(r.release_reference());
        assert_eq!(released.load(Ordering::SeqCst), 1);
        assert_eq!(host.live_blocks(), 0);
        assert!(r.is_destroyed());
        assert_eq!(r.base_address(), None);
    }

    #[test]
    fn test_destroyed_region_refuses_heap_operations() {
        let host = Arc::new(MockHost::new());
        let r = region(&host, PAGE_SIZE);
        let p = r.allocate(64).unwrap();
        assert!(r.release_reference());

        assert_eq!(r.allocate(64).unwrap_err(), MemError::NoSuchDevice);
        assert_eq!(unsafe { r.free(p) }.unwrap_err(), MemError::NoSuchDevice);
        assert_eq!(r.snapshot().unwrap_err(), MemError::NoSuchDevice);
    }

    #[test]
    fn test_concurrent_release_has_one_destroyer() {
        let host = Arc::new(MockHost::new());
        let r = Arc::new(region(&host, PAGE_SIZE));
        for _ in 0..7 {
            r.acquire_reference();
        }

        let workers: alloc::vec::Vec<_> = (0..8)
            .map(|_| {
                let r = r.clone();
                std::thread::spawn(move || r.release_reference())
            })
            .collect();
        let destroyers = workers
            .into_iter()
            .map(|w| w.join().unwrap())
            .filter(|&destroyed| destroyed)
            .count();

        assert_eq!(destroyers, 1);
        assert_eq!(r.refcount(), 0);
        assert_eq!(host.live_blocks(), 0);
    }

    #[test]
    fn test_try_acquire_refuses_destroyed_region() {
        let host = Arc::new(MockHost::new());
        let r = region(&host, PAGE_SIZE);
        r.try_acquire_reference().unwrap();
        assert_eq!(r.refcount(), 2);

        assert!(!r.release_reference());
        assert!(r.release_reference());
        assert_eq!(r.try_acquire_reference().unwrap_err(), MemError::NoSuchDevice);
        assert_eq!(r.refcount(), 0);
        assert_eq!(host.live_blocks(), 0);
    }

    #[cfg(any(feature = "smp", feature = "lock-diagnostics"))]
    #[test]
    fn test_snapshot_is_consistent_under_concurrent_allocation() {
        use core::sync::atomic::{AtomicBool, Ordering};

        let host = Arc::new(MockHost::new());
        let r = Arc::new(region(&host, 4 * PAGE_SIZE));
        let stop = Arc::new(AtomicBool::new(false));

        let writer = {
            let r = r.clone();
            let stop = stop.clone();
            std::thread::spawn(move || {
                let mut size = 64;
                while !stop.load(Ordering::Relaxed) {
                    let a = r.allocate(size).unwrap();
                    let b = r.allocate(64).unwrap();
                    unsafe {
                        r.free(a).unwrap();
                        r.free(b).unwrap();
                    }
                    size = if size >= 512 { 64 } else { size * 2 };
                }
            })
        };

        for _ in 0..20_000 {
            let stat = r.snapshot().unwrap();
            assert!(stat.free <= stat.size);
            assert_eq!((stat.size - stat.free) % 64, 0);
        }
        stop.store(true, Ordering::Relaxed);
        writer.join().unwrap();

        let stat = r.snapshot().unwrap();
        assert_eq!(stat.free, stat.size);
    }

    #[test]
    fn test_stats_only_region_denies_allocation() {
        let host = Arc::new(MockHost::new());
        let r: MemoryRegion =
            MemoryRegion::create(host, "system heap", PAGE_SIZE, RegionCaps::stats_only(), None)
                .unwrap();
        assert_eq!(r.allocate(16).unwrap_err(), MemError::PermissionDenied);
        assert!(r.snapshot().is_ok());
    }

    #[test]
    fn test_cache_aliasing_requests_uncached_block() {
        let host = Arc::new(MockHost::with_cache_aliasing());
        let _r = region(&host, PAGE_SIZE);
        assert_eq!(host.uncached_allocs(), 1);
    }

    #[test]
    fn test_stat_wire_layout() {
        let stat = RegionStat { size: 8192, free: 4096 };
        let bytes = stat.to_ne_bytes();
        assert_eq!(&bytes[..8], &8192u64.to_ne_bytes());
        assert_eq!(&bytes[8..], &4096u64.to_ne_bytes());
        assert_eq!(core::mem::size_of::<RegionStat>(), RegionStat::WIRE_SIZE);
    }
}
