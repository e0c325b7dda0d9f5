//! Host virtual-memory capability
//!
//! The host hands out zero-filled, page-aligned blocks and binds them into
//! user address spaces. Page-table and cache maintenance stay on the host
//! side of this trait.

use alloc::alloc::{alloc_zeroed, dealloc, Layout};
use core::ptr::NonNull;

use crate::error::MemError;
use crate::mapping::VmArea;

pub const PAGE_SHIFT: usize = 12;
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;

/// Round `size` up to a multiple of `page`
///
/// `page` must be a power of two. Returns `None` on overflow.
pub fn page_align(size: usize, page: usize) -> Option<usize> {
    Some(size.checked_add(page - 1)? & !(page - 1))
}

/// A page-aligned block obtained from the host
///
/// Owned by exactly one region; never cloned.
#[derive(Debug)]
pub struct PageBlock {
    base: NonNull<u8>,
    size: usize,
    cacheable: bool,
}

// SAFETY: the block is plain memory, owned by whoever holds the PageBlock
unsafe impl Send for PageBlock {}
unsafe impl Sync for PageBlock {}

impl PageBlock {
    /// # Safety
    ///
    /// `base..base + size` must be a live host allocation that nothing
    /// else owns.
    pub unsafe fn from_raw_parts(base: NonNull<u8>, size: usize, cacheable: bool) -> Self {
        Self {
            base,
            size,
            cacheable,
        }
    }

    pub fn base(&self) -> NonNull<u8> {
        self.base
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn is_cacheable(&self) -> bool {
        self.cacheable
    }
}

/// Operations consumed from the host virtual-memory subsystem
///
/// `allocate_zeroed_pages` and `free_pages` may sleep: call them only
/// where blocking is legal.
pub trait HostMemory: Send + Sync {
    /// Allocation granularity
    fn page_size(&self) -> usize {
        PAGE_SIZE
    }

    /// Whether the data cache can alias between kernel and user views,
    /// in which case shared blocks must be mapped uncached
    fn cache_aliasing(&self) -> bool {
        false
    }

    /// Obtain a zero-filled block of exactly `size` bytes
    fn allocate_zeroed_pages(&self, size: usize, cacheable: bool) -> Result<PageBlock, MemError>;

    /// Give a block back
    ///
    /// # Safety
    ///
    /// `block` must come from `allocate_zeroed_pages` on this host, and no
    /// pointer into it may be used afterwards.
    unsafe fn free_pages(&self, block: PageBlock);

    /// Bind the block at `base` into the user view described by `vma`
    ///
    /// Fails with `InvalidArgument` when the view length differs from
    /// `size`.
    fn bind_mapping(&self, vma: &mut VmArea, base: NonNull<u8>, size: usize)
        -> Result<(), MemError>;
}

/// Host pages served by the global allocator
#[derive(Debug, Default)]
pub struct SystemPages {
    cache_aliasing: bool,
}

impl SystemPages {
    pub const fn new() -> Self {
        Self {
            cache_aliasing: false,
        }
    }

    /// A host whose caches alias, so blocks are handed out uncached
    pub const fn with_cache_aliasing() -> Self {
        Self {
            cache_aliasing: true,
        }
    }
}

impl HostMemory for SystemPages {
    fn cache_aliasing(&self) -> bool {
        self.cache_aliasing
    }

    fn allocate_zeroed_pages(&self, size: usize, cacheable: bool) -> Result<PageBlock, MemError> {
        if size == 0 || size % PAGE_SIZE != 0 {
            return Err(MemError::InvalidArgument);
        }
        let layout =
            Layout::from_size_align(size, PAGE_SIZE).map_err(|_| MemError::InvalidArgument)?;

        // SAFETY: layout has non-zero size
        let base = NonNull::new(unsafe { alloc_zeroed(layout) }).ok_or(MemError::OutOfMemory)?;

        // SAFETY: fresh allocation of `size` bytes
        Ok(unsafe { PageBlock::from_raw_parts(base, size, cacheable) })
    }

    unsafe fn free_pages(&self, block: PageBlock) {
        let layout = Layout::from_size_align_unchecked(block.size(), PAGE_SIZE);
        dealloc(block.base().as_ptr(), layout);
    }

    fn bind_mapping(
        &self,
        vma: &mut VmArea,
        base: NonNull<u8>,
        size: usize,
    ) -> Result<(), MemError> {
        if vma.len() != size {
            return Err(MemError::InvalidArgument);
        }
        vma.bind(base.as_ptr() as usize);
        Ok(())
    }
}
