//! Mock collaborators for hosted tests
//!
//! Stand-ins for the host page provider, the heap and the device glue, each
//! with failure injection so unwinding paths can be driven from tests.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::cell::Cell;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicUsize, Ordering};

use crate::error::MemError;
use crate::mapping::VmArea;
use crate::region::{BuddyHeap, Heap, HostMemory, PageBlock, SystemPages};
use crate::registry::{Endpoint, EndpointRegistrar};

fn take_one(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

/// Host pages with accounting
///
/// Tracks how many blocks are outstanding so tests can prove nothing
/// leaked.
#[derive(Debug, Default)]
pub struct MockHost {
    pages: SystemPages,
    fail_allocs: AtomicUsize,
    fail_binds: AtomicUsize,
    live: AtomicUsize,
    allocs: AtomicUsize,
    frees: AtomicUsize,
    uncached: AtomicUsize,
}

impl MockHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// A host whose caches alias
    pub fn with_cache_aliasing() -> Self {
        Self {
            pages: SystemPages::with_cache_aliasing(),
            ..Self::default()
        }
    }

    /// Make the next `n` page requests fail with `OutOfMemory`
    pub fn fail_next_allocs(&self, n: usize) {
        self.fail_allocs.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` mapping binds fail with `OutOfMemory`
    pub fn fail_next_binds(&self, n: usize) {
        self.fail_binds.store(n, Ordering::SeqCst);
    }

    /// Blocks handed out and not yet returned
    pub fn live_blocks(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    pub fn total_allocs(&self) -> usize {
        self.allocs.load(Ordering::SeqCst)
    }

    pub fn total_frees(&self) -> usize {
        self.frees.load(Ordering::SeqCst)
    }

    /// Blocks requested non-cacheable
    pub fn uncached_allocs(&self) -> usize {
        self.uncached.load(Ordering::SeqCst)
    }
}

impl HostMemory for MockHost {
    fn page_size(&self) -> usize {
        self.pages.page_size()
    }

    fn cache_aliasing(&self) -> bool {
        self.pages.cache_aliasing()
    }

    fn allocate_zeroed_pages(&self, size: usize, cacheable: bool) -> Result<PageBlock, MemError> {
        if take_one(&self.fail_allocs) {
            return Err(MemError::OutOfMemory);
        }
        let block = self.pages.allocate_zeroed_pages(size, cacheable)?;
        self.allocs.fetch_add(1, Ordering::SeqCst);
        self.live.fetch_add(1, Ordering::SeqCst);
        if !cacheable {
            self.uncached.fetch_add(1, Ordering::SeqCst);
        }
        Ok(block)
    }

    unsafe fn free_pages(&self, block: PageBlock) {
        self.frees.fetch_add(1, Ordering::SeqCst);
        self.live.fetch_sub(1, Ordering::SeqCst);
        self.pages.free_pages(block);
    }

    fn bind_mapping(
        &self,
        vma: &mut VmArea,
        base: NonNull<u8>,
        size: usize,
    ) -> Result<(), MemError> {
        if take_one(&self.fail_binds) {
            return Err(MemError::OutOfMemory);
        }
        self.pages.bind_mapping(vma, base, size)
    }
}

std::thread_local! {
    static FAIL_INITS: Cell<usize> = Cell::new(0);
    static FAIL_ALLOCS: Cell<usize> = Cell::new(0);
}

fn take_local(key: &'static std::thread::LocalKey<Cell<usize>>) -> bool {
    key.with(|n| match n.get() {
        0 => false,
        left => {
            n.set(left - 1);
            true
        }
    })
}

/// A [`BuddyHeap`] with injectable failures
///
/// Failures are armed per thread, so tests running in parallel do not see
/// each other's.
#[derive(Debug)]
pub struct MockHeap(BuddyHeap);

impl MockHeap {
    /// Make the next `n` heap inits on this thread fail
    pub fn fail_next_inits(n: usize) {
        FAIL_INITS.with(|c| c.set(n));
    }

    /// Make the next `n` allocations on this thread fail
    pub fn fail_next_allocs(n: usize) {
        FAIL_ALLOCS.with(|c| c.set(n));
    }
}

impl Heap for MockHeap {
    unsafe fn init(base: NonNull<u8>, size: usize) -> Result<Self, MemError> {
        if take_local(&FAIL_INITS) {
            return Err(MemError::OutOfMemory);
        }
        BuddyHeap::init(base, size).map(MockHeap)
    }

    fn destroy(self) {
        self.0.destroy()
    }

    fn alloc(&mut self, size: usize) -> Result<NonNull<u8>, MemError> {
        if take_local(&FAIL_ALLOCS) {
            return Err(MemError::OutOfMemory);
        }
        self.0.alloc(size)
    }

    unsafe fn free(&mut self, ptr: NonNull<u8>) -> Result<(), MemError> {
        self.0.free(ptr)
    }

    fn size(&self) -> usize {
        self.0.size()
    }

    fn free_bytes(&self) -> usize {
        self.0.free_bytes()
    }

    fn base_address(&self) -> NonNull<u8> {
        self.0.base_address()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrarEvent {
    Registered(Endpoint),
    Unregistered(Endpoint),
}

#[derive(Debug, Default)]
struct RegistrarState {
    registered: heapless::Vec<Endpoint, 4>,
    failing: heapless::Vec<Endpoint, 4>,
    history: Vec<RegistrarEvent>,
}

/// Device glue that records what it was asked to do
///
/// Clones share state, so a test keeps one handle while the registry owns
/// another.
#[derive(Debug, Clone, Default)]
pub struct MockRegistrar {
    state: Arc<spin::Mutex<RegistrarState>>,
}

impl MockRegistrar {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse registration of `endpoint` with `NoSuchDevice`
    pub fn fail_on(&self, endpoint: Endpoint) {
        let mut state = self.state.lock();
        if !state.failing.contains(&endpoint) {
            let _ = state.failing.push(endpoint);
        }
    }

    /// Endpoints currently registered, in registration order
    pub fn registered(&self) -> heapless::Vec<Endpoint, 4> {
        self.state.lock().registered.clone()
    }

    /// Unregistrations since the last `clear_history`, in call order
    pub fn unregistered(&self) -> Vec<Endpoint> {
        self.state
            .lock()
            .history
            .iter()
            .filter_map(|event| match event {
                RegistrarEvent::Unregistered(endpoint) => Some(*endpoint),
                RegistrarEvent::Registered(_) => None,
            })
            .collect()
    }

    pub fn history(&self) -> Vec<RegistrarEvent> {
        self.state.lock().history.clone()
    }

    pub fn clear_history(&self) {
        self.state.lock().history.clear();
    }
}

impl EndpointRegistrar for MockRegistrar {
    fn register(&self, endpoint: Endpoint) -> Result<(), MemError> {
        let mut state = self.state.lock();
        if state.failing.contains(&endpoint) {
            return Err(MemError::NoSuchDevice);
        }
        if state.registered.contains(&endpoint) {
            return Err(MemError::InvalidArgument);
        }
        state
            .registered
            .push(endpoint)
            .map_err(|_| MemError::OutOfMemory)?;
        state.history.push(RegistrarEvent::Registered(endpoint));
        Ok(())
    }

    fn unregister(&self, endpoint: Endpoint) {
        let mut state = self.state.lock();
        state.registered.retain(|e| *e != endpoint);
        state.history.push(RegistrarEvent::Unregistered(endpoint));
    }
}
