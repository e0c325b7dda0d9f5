//! # Mapping Lifecycle
//!
//! Binds user-space views to regions. Every live view holds exactly one
//! reference on its region, taken when the view is opened or duplicated and
//! dropped when it closes. The last close of the last view of a region that
//! its owner already let go of destroys it.

use alloc::sync::Arc;

use crate::error::MemError;
use crate::region::{BuddyHeap, Heap, MemoryRegion, RegionCaps, RegionStat, PAGE_SHIFT};

/// Device class of the memory endpoints, used as the control code type
pub const MEMDEV_CLASS: u32 = 14;

const IOC_READ: u32 = 2;

const fn ior(ty: u32, nr: u32, size: usize) -> u32 {
    (IOC_READ << 30) | ((size as u32) << 16) | (ty << 8) | nr
}

/// Read the region size and free space as a [`RegionStat`]
pub const MEMDEV_STAT: u32 = ior(MEMDEV_CLASS, 0, RegionStat::WIRE_SIZE);

/// The user address range a view is requested at
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmArea {
    start: usize,
    end: usize,
    noncached: bool,
    bound: Option<usize>,
}

impl VmArea {
    pub fn new(start: usize, len: usize) -> Self {
        Self {
            start,
            end: start + len,
            noncached: false,
            bound: None,
        }
    }

    pub fn start(&self) -> usize {
        self.start
    }

    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    pub fn is_noncached(&self) -> bool {
        self.noncached
    }

    pub fn set_noncached(&mut self) {
        self.noncached = true;
    }

    /// Kernel address the range is backed by, once the host has bound it
    pub fn bound(&self) -> Option<usize> {
        self.bound
    }

    /// Record the backing address; called by the host
    pub fn bind(&mut self, addr: usize) {
        self.bound = Some(addr);
    }
}

/// One live user view of a region
///
/// Holds one reference for as long as it exists. Dropping the handle is the
/// same as [`Mapping::close`].
pub struct Mapping<H: Heap = BuddyHeap> {
    region: Option<Arc<MemoryRegion<H>>>,
}

impl<H: Heap> Mapping<H> {
    /// Map `region` into `vma`
    ///
    /// The view must cover the region exactly. On any failure the reference
    /// count is left untouched.
    pub fn open(region: &Arc<MemoryRegion<H>>, vma: &mut VmArea) -> Result<Self, MemError> {
        if !region.caps().contains(RegionCaps::MAP) {
            return Err(MemError::PermissionDenied);
        }
        if vma.len() != region.size() {
            return Err(MemError::InvalidArgument);
        }

        // Hold the reference before touching the block, so the last close
        // cannot free it under the bind
        region.try_acquire_reference()?;
        let view = Self {
            region: Some(region.clone()),
        };
        let base = region.base_address().ok_or(MemError::NoSuchDevice)?;

        let host = region.host();
        if host.cache_aliasing() {
            vma.set_noncached();
        }
        // on failure `view` drops and gives the reference back
        host.bind_mapping(vma, base, region.size())?;

        log::trace!("{}: mapped at {:#x}", region.tag(), vma.start());
        Ok(view)
    }

    /// A second view of the same region, as when an address space forks
    ///
    /// Never fails.
    pub fn duplicate(&self) -> Self {
        if let Some(region) = &self.region {
            region.acquire_reference();
        }
        Self {
            region: self.region.clone(),
        }
    }

    /// Drop the view; returns whether this destroyed the region
    pub fn close(mut self) -> bool {
        self.release()
    }

    pub fn region(&self) -> Option<&Arc<MemoryRegion<H>>> {
        self.region.as_ref()
    }

    fn release(&mut self) -> bool {
        match self.region.take() {
            Some(region) => region.release_reference(),
            None => false,
        }
    }
}

impl<H: Heap> Drop for Mapping<H> {
    fn drop(&mut self) {
        self.release();
    }
}

impl<H: Heap> core::fmt::Debug for Mapping<H> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Mapping")
            .field("region", &self.region.as_ref().map(|r| r.tag()))
            .finish()
    }
}

/// Serve a control request against `region`
pub fn control<H: Heap>(region: &MemoryRegion<H>, code: u32) -> Result<RegionStat, MemError> {
    match code {
        MEMDEV_STAT => region.snapshot(),
        _ => Err(MemError::InvalidArgument),
    }
}

/// Placement hint for hosts without an MMU
///
/// Offset zero lands on the region itself; anything else is taken as a
/// page offset.
pub fn unmapped_area<H: Heap>(region: &MemoryRegion<H>, pgoff: usize) -> Result<usize, MemError> {
    if pgoff == 0 {
        let base = region.base_address().ok_or(MemError::NoSuchDevice)?;
        return Ok(base.as_ptr() as usize);
    }
    pgoff
        .checked_mul(1 << PAGE_SHIFT)
        .ok_or(MemError::InvalidArgument)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockHost;
    use crate::region::{HostMemory, PageBlock, PAGE_SIZE};
    use alloc::vec::Vec;
    use core::ptr::NonNull;

    /// Host that lets the owner's reference go while a view is being bound
    struct ReleasingHost {
        pages: MockHost,
        owner: spin::Mutex<Option<Arc<MemoryRegion>>>,
    }

    impl HostMemory for ReleasingHost {
        fn allocate_zeroed_pages(&self, size: usize, cacheable: bool) -> Result<PageBlock, MemError> {
            self.pages.allocate_zeroed_pages(size, cacheable)
        }

        unsafe fn free_pages(&self, block: PageBlock) {
            self.pages.free_pages(block)
        }

        fn bind_mapping(
            &self,
            vma: &mut VmArea,
            base: NonNull<u8>,
            size: usize,
        ) -> Result<(), MemError> {
            let owner = self.owner.lock().take();
            if let Some(region) = owner {
                region.release_reference();
            }
            self.pages.bind_mapping(vma, base, size)
        }
    }

    fn shared(host: &Arc<MockHost>) -> Arc<MemoryRegion> {
        Arc::new(
            MemoryRegion::create(
                host.clone(),
                "shared heap",
                2 * PAGE_SIZE,
                RegionCaps::mappable(),
                None,
            )
            .unwrap(),
        )
    }

    #[test]
    fn test_open_close_any_order_restores_refcount() {
        let host = Arc::new(MockHost::new());
        let region = shared(&host);

        let mut views: Vec<_> = (0..5)
            .map(|i| {
                let mut vma = VmArea::new(0x1000_0000 + i * 0x10_0000, region.size());
                Mapping::open(&region, &mut vma).unwrap()
            })
            .collect();
        assert_eq!(region.refcount(), 6);

        // close out of order
        let third = views.remove(2);
        assert!(!third.close());
        let last = views.pop().unwrap();
        assert!(!last.close());
        drop(views);

        assert_eq!(region.refcount(), 1);
        assert!(!region.is_destroyed());
    }

    #[test]
    fn test_open_binds_region_base() {
        let host = Arc::new(MockHost::new());
        let region = shared(&host);
        let mut vma = VmArea::new(0x2000_0000, region.size());

        let _view = Mapping::open(&region, &mut vma).unwrap();
        let base = region.base_address().unwrap().as_ptr() as usize;
        assert_eq!(vma.bound(), Some(base));
        assert!(!vma.is_noncached());
    }

    #[test]
    fn test_length_mismatch_leaves_refcount() {
        let host = Arc::new(MockHost::new());
        let region = shared(&host);

        for len in [PAGE_SIZE, 3 * PAGE_SIZE] {
            let mut vma = VmArea::new(0x2000_0000, len);
            let err = Mapping::open(&region, &mut vma).unwrap_err();
            assert_eq!(err, MemError::InvalidArgument);
            assert_eq!(vma.bound(), None);
        }
        assert_eq!(region.refcount(), 1);
    }

    #[test]
    fn test_stats_only_region_cannot_be_mapped() {
        let host = Arc::new(MockHost::new());
        let system: Arc<MemoryRegion> = Arc::new(
            MemoryRegion::create(host, "system heap", PAGE_SIZE, RegionCaps::stats_only(), None)
                .unwrap(),
        );
        let mut vma = VmArea::new(0x2000_0000, PAGE_SIZE);
        assert_eq!(
            Mapping::open(&system, &mut vma).unwrap_err(),
            MemError::PermissionDenied
        );
        assert_eq!(system.refcount(), 1);
        assert!(control(&system, MEMDEV_STAT).is_ok());
    }

    #[test]
    fn test_duplicate_then_last_close_destroys() {
        let host = Arc::new(MockHost::new());
        let region = shared(&host);
        let mut vma = VmArea::new(0x2000_0000, region.size());

        let view = Mapping::open(&region, &mut vma).unwrap();
        let child = view.duplicate();
        assert_eq!(region.refcount(), 3);

        // owner lets go while views are alive
        assert!(!region.release_reference());
        assert!(!view.close());
        assert_eq!(host.live_blocks(), 1);

        assert!(child.close());
        assert!(region.is_destroyed());
        assert_eq!(host.live_blocks(), 0);
    }

    #[test]
    fn test_cache_aliasing_marks_view_noncached() {
        let host = Arc::new(MockHost::with_cache_aliasing());
        let region = shared(&host);
        let mut vma = VmArea::new(0x2000_0000, region.size());
        let _view = Mapping::open(&region, &mut vma).unwrap();
        assert!(vma.is_noncached());
    }

    #[test]
    fn test_control_codes() {
        let host = Arc::new(MockHost::new());
        let region = shared(&host);

        let stat = control(&region, MEMDEV_STAT).unwrap();
        assert_eq!(stat.size, region.size() as u64);
        assert_eq!(stat.free, stat.size);

        assert_eq!(
            control(&region, MEMDEV_STAT + 1).unwrap_err(),
            MemError::InvalidArgument
        );
        assert_eq!(control(&region, 0).unwrap_err(), MemError::InvalidArgument);
    }

    #[test]
    fn test_stat_code_encoding() {
        assert_eq!(MEMDEV_STAT >> 30, IOC_READ);
        assert_eq!((MEMDEV_STAT >> 16) & 0x3fff, 16);
        assert_eq!((MEMDEV_STAT >> 8) & 0xff, MEMDEV_CLASS);
        assert_eq!(MEMDEV_STAT & 0xff, 0);
    }

    #[test]
    fn test_unmapped_area() {
        let host = Arc::new(MockHost::new());
        let region = shared(&host);
        let base = region.base_address().unwrap().as_ptr() as usize;

        assert_eq!(unmapped_area(&region, 0).unwrap(), base);
        assert_eq!(unmapped_area(&region, 3).unwrap(), 3 * PAGE_SIZE);
    }

    #[test]
    fn test_destroyed_region_cannot_be_opened() {
        let host = Arc::new(MockHost::new());
        let region = shared(&host);
        assert!(region.release_reference());

        let mut vma = VmArea::new(0x2000_0000, 2 * PAGE_SIZE);
        assert_eq!(
            Mapping::open(&region, &mut vma).unwrap_err(),
            MemError::NoSuchDevice
        );
        assert_eq!(unmapped_area(&region, 0).unwrap_err(), MemError::NoSuchDevice);
    }

    #[test]
    fn test_owner_release_during_bind_keeps_block_alive() {
        let host = Arc::new(ReleasingHost {
            pages: MockHost::new(),
            owner: spin::Mutex::new(None),
        });
        let region: Arc<MemoryRegion> = Arc::new(
            MemoryRegion::create(
                host.clone(),
                "private heap",
                PAGE_SIZE,
                RegionCaps::mappable(),
                None,
            )
            .unwrap(),
        );
        *host.owner.lock() = Some(region.clone());

        let mut vma = VmArea::new(0x2000_0000, PAGE_SIZE);
        let view = Mapping::open(&region, &mut vma).unwrap();

        // the view now holds the only reference
        assert_eq!(region.refcount(), 1);
        assert!(!region.is_destroyed());
        assert_eq!(host.pages.live_blocks(), 1);
        assert_eq!(vma.bound(), region.base_address().map(|b| b.as_ptr() as usize));

        assert!(view.close());
        assert!(region.is_destroyed());
        assert_eq!(host.pages.live_blocks(), 0);
    }

    #[test]
    fn test_bind_failure_gives_reference_back() {
        let host = Arc::new(MockHost::new());
        let region = shared(&host);
        host.fail_next_binds(1);

        let mut vma = VmArea::new(0x2000_0000, region.size());
        assert_eq!(
            Mapping::open(&region, &mut vma).unwrap_err(),
            MemError::OutOfMemory
        );
        assert_eq!(region.refcount(), 1);
        assert_eq!(vma.bound(), None);
    }

    #[test]
    fn test_open_racing_last_release_never_revives() {
        for _ in 0..200 {
            let host = Arc::new(MockHost::new());
            let region = shared(&host);

            let owner = region.clone();
            let closer = std::thread::spawn(move || owner.release_reference());

            let mut vma = VmArea::new(0x2000_0000, 2 * PAGE_SIZE);
            let opened = Mapping::open(&region, &mut vma);
            let closer_destroyed = closer.join().unwrap();

            match opened {
                Ok(view) => {
                    assert!(!closer_destroyed);
                    assert_eq!(host.live_blocks(), 1);
                    assert!(view.close());
                }
                Err(err) => {
                    assert_eq!(err, MemError::NoSuchDevice);
                    assert!(closer_destroyed);
                    assert_eq!(region.refcount(), 0);
                }
            }
            assert_eq!(host.live_blocks(), 0);
        }
    }
}
