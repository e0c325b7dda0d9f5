//! # Buddy Heap
//!
//! The default [`Heap`] behind every region.
//!
//! Memory is divided into power-of-2 sized blocks that split on
//! allocation and coalesce with their buddy on release. Buddy arithmetic
//! works on offsets from the heap base, so any 64-byte aligned block will
//! do. A side table remembers the order of each live allocation, which is
//! why `free` needs nothing but the pointer.

use alloc::vec::Vec;
use core::ptr::NonNull;

use super::heap::Heap;
use crate::error::MemError;

/// Minimum block size: 64 bytes
const MIN_BLOCK_SIZE: usize = 64;

/// Maximum order: 2^MAX_ORDER * MIN_BLOCK_SIZE
/// With MAX_ORDER = 16, this gives us blocks up to 4MB
const MAX_ORDER: usize = 16;

/// Number of free lists (one for each order)
const NUM_ORDERS: usize = MAX_ORDER + 1;

/// A free block; the link lives inside the free memory itself
#[repr(C)]
struct Block {
    next: Option<NonNull<Block>>,
}

impl Block {
    /// # Safety
    /// `addr` must point to at least `MIN_BLOCK_SIZE` free bytes inside the heap
    unsafe fn new(addr: usize) -> NonNull<Block> {
        let ptr = addr as *mut Block;
        (*ptr).next = None;
        NonNull::new_unchecked(ptr)
    }

    fn next(&self) -> Option<NonNull<Block>> {
        self.next
    }

    fn set_next(&mut self, next: Option<NonNull<Block>>) {
        self.next = next;
    }
}

pub struct BuddyHeap {
    /// free_lists[i] contains blocks of size MIN_BLOCK_SIZE * 2^i
    free_lists: [Option<NonNull<Block>>; NUM_ORDERS],
    base: NonNull<u8>,
    size: usize,
    free_bytes: usize,
    /// `order + 1` for every live allocation start, indexed by
    /// `offset / MIN_BLOCK_SIZE`; zero everywhere else
    live: Vec<u8>,
}

// SAFETY: the heap exclusively owns the block its pointers reach into
unsafe impl Send for BuddyHeap {}

impl core::fmt::Debug for BuddyHeap {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("BuddyHeap")
            .field("base", &self.base)
            .field("size", &self.size)
            .field("free_bytes", &self.free_bytes)
            .finish()
    }
}

impl BuddyHeap {
    /// Carve `size` bytes from offset 0 into the largest blocks that fit
    ///
    /// Each block size is at most half the previous one past the first
    /// run of maximal blocks, so every offset stays aligned to its block.
    unsafe fn add_initial_blocks(&mut self, size: usize) {
        let mut offset = 0;
        let mut remaining = size;

        while remaining >= MIN_BLOCK_SIZE {
            let order = Self::floor_order(remaining).min(MAX_ORDER);
            let block_size = Self::order_to_size(order);

            let block = Block::new(self.addr_of(offset));
            self.add_to_free_list(block, order);
            self.free_bytes += block_size;

            offset += block_size;
            remaining -= block_size;
        }
    }

    fn addr_of(&self, offset: usize) -> usize {
        self.base.as_ptr() as usize + offset
    }

    fn offset_of(&self, addr: usize) -> usize {
        addr - self.base.as_ptr() as usize
    }

    /// Find a free block of at least the given order
    ///
    /// Returns the order of the block found (may be larger than requested)
    fn find_free_block(&self, min_order: usize) -> Option<usize> {
        (min_order..=MAX_ORDER).find(|&order| self.free_lists[order].is_some())
    }

    /// Remove the head block from the free list of the given order
    fn remove_from_free_list(&mut self, order: usize) -> Option<NonNull<Block>> {
        let block = self.free_lists[order]?;

        unsafe {
            self.free_lists[order] = block.as_ref().next();
        }

        Some(block)
    }

    fn add_to_free_list(&mut self, mut block: NonNull<Block>, order: usize) {
        unsafe {
            block.as_mut().set_next(self.free_lists[order]);
        }
        self.free_lists[order] = Some(block);
    }

    /// Split a block down to the target order
    ///
    /// The upper half of every split goes to the free list one order down.
    fn split_block(&mut self, block: NonNull<Block>, current_order: usize, target_order: usize) {
        let mut order = current_order;
        let addr = block.as_ptr() as usize;

        while order > target_order {
            order -= 1;
            let buddy_addr = addr + Self::order_to_size(order);

            unsafe {
                let buddy = Block::new(buddy_addr);
                self.add_to_free_list(buddy, order);
            }
        }
    }

    /// Coalesce a block with its buddy and add to free list
    ///
    /// Keeps merging until the buddy is busy, out of range, or the block
    /// reached MAX_ORDER.
    fn coalesce_and_free(&mut self, mut offset: usize, mut order: usize) {
        while order < MAX_ORDER {
            let buddy = Self::buddy_offset(offset, order);
            if buddy + Self::order_to_size(order) > self.size {
                break;
            }

            if self.find_and_remove(self.addr_of(buddy), order).is_none() {
                break;
            }
            offset = offset.min(buddy);
            order += 1;
        }

        unsafe {
            let block = Block::new(self.addr_of(offset));
            self.add_to_free_list(block, order);
        }
    }

    /// Find and unlink a specific block from a free list
    fn find_and_remove(&mut self, addr: usize, order: usize) -> Option<NonNull<Block>> {
        let mut current = self.free_lists[order]?;
        let mut prev: Option<NonNull<Block>> = None;

        unsafe {
            loop {
                if current.as_ptr() as usize == addr {
                    if let Some(mut prev_block) = prev {
                        prev_block.as_mut().set_next(current.as_ref().next());
                    } else {
                        self.free_lists[order] = current.as_ref().next();
                    }
                    return Some(current);
                }

                prev = Some(current);
                current = current.as_ref().next()?;
            }
        }
    }

    /// The buddy of the block at `offset` with order O sits at
    /// offset XOR (size of block)
    fn buddy_offset(offset: usize, order: usize) -> usize {
        offset ^ Self::order_to_size(order)
    }

    /// Smallest order whose block holds `size` bytes
    fn size_to_order(size: usize) -> usize {
        let blocks = size.max(1).div_ceil(MIN_BLOCK_SIZE);
        blocks.next_power_of_two().trailing_zeros() as usize
    }

    /// Largest order whose block fits in `size` bytes (`size >= MIN_BLOCK_SIZE`)
    fn floor_order(size: usize) -> usize {
        let blocks = size / MIN_BLOCK_SIZE;
        (usize::BITS - 1 - blocks.leading_zeros()) as usize
    }

    fn order_to_size(order: usize) -> usize {
        MIN_BLOCK_SIZE << order
    }
}

impl Heap for BuddyHeap {
    unsafe fn init(base: NonNull<u8>, size: usize) -> Result<Self, MemError> {
        if size < MIN_BLOCK_SIZE || base.as_ptr() as usize % MIN_BLOCK_SIZE != 0 {
            return Err(MemError::InvalidArgument);
        }
        let size = size - size % MIN_BLOCK_SIZE;

        let slots = size / MIN_BLOCK_SIZE;
        let mut live = Vec::new();
        live.try_reserve_exact(slots)
            .map_err(|_| MemError::OutOfMemory)?;
        live.resize(slots, 0);

        let mut heap = Self {
            free_lists: [None; NUM_ORDERS],
            base,
            size,
            free_bytes: 0,
            live,
        };
        heap.add_initial_blocks(size);
        Ok(heap)
    }

    fn alloc(&mut self, size: usize) -> Result<NonNull<u8>, MemError> {
        if size == 0 {
            return Err(MemError::InvalidArgument);
        }

        let needed_order = Self::size_to_order(size);
        if needed_order > MAX_ORDER {
            return Err(MemError::OutOfMemory);
        }

        let alloc_order = self.find_free_block(needed_order).ok_or(MemError::OutOfMemory)?;
        let block = self
            .remove_from_free_list(alloc_order)
            .ok_or(MemError::OutOfMemory)?;
        self.split_block(block, alloc_order, needed_order);

        let offset = self.offset_of(block.as_ptr() as usize);
        self.live[offset / MIN_BLOCK_SIZE] = needed_order as u8 + 1;
        self.free_bytes -= Self::order_to_size(needed_order);

        Ok(block.cast())
    }

    unsafe fn free(&mut self, ptr: NonNull<u8>) -> Result<(), MemError> {
        let addr = ptr.as_ptr() as usize;
        if addr < self.base.as_ptr() as usize {
            return Err(MemError::InvalidArgument);
        }
        let offset = self.offset_of(addr);
        if offset >= self.size || offset % MIN_BLOCK_SIZE != 0 {
            return Err(MemError::InvalidArgument);
        }

        let slot = &mut self.live[offset / MIN_BLOCK_SIZE];
        if *slot == 0 {
            return Err(MemError::InvalidArgument);
        }
        let order = (*slot - 1) as usize;
        *slot = 0;

        self.free_bytes += Self::order_to_size(order);
        self.coalesce_and_free(offset, order);
        Ok(())
    }

    fn size(&self) -> usize {
        self.size
    }

    fn free_bytes(&self) -> usize {
        self.free_bytes
    }

    fn base_address(&self) -> NonNull<u8> {
        self.base
    }
}
