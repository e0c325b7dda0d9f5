//! Heap capability
//!
//! The byte-granular allocator a region delegates to. A region owns the
//! backing block; the heap only carves it up.

use core::ptr::NonNull;

use crate::error::MemError;

/// A byte-granular allocator laid over one contiguous block
pub trait Heap: Send + Sized {
    /// Lay a fresh heap over `base..base + size`
    ///
    /// # Safety
    ///
    /// The range must be valid, writable, and reserved for this heap until
    /// `destroy` returns.
    unsafe fn init(base: NonNull<u8>, size: usize) -> Result<Self, MemError>;

    /// Tear the heap down. The block itself is not released here.
    fn destroy(self) {}

    /// Allocate `size` bytes
    fn alloc(&mut self, size: usize) -> Result<NonNull<u8>, MemError>;

    /// Return an allocation
    ///
    /// Pointers the heap can tell it never handed out are rejected with
    /// `InvalidArgument`.
    ///
    /// # Safety
    ///
    /// `ptr` must not be used after this call.
    unsafe fn free(&mut self, ptr: NonNull<u8>) -> Result<(), MemError>;

    /// Total managed bytes
    fn size(&self) -> usize;

    /// Bytes currently available
    fn free_bytes(&self) -> usize;

    /// Start of the managed block
    fn base_address(&self) -> NonNull<u8>;
}
