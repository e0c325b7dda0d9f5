//! # rtheap - Real-time Memory Core
//!
//! The memory and synchronization core of a real-time nucleus running
//! alongside a general-purpose host kernel.
//!
//! - [`DiagLock`]: interrupt-safe spinlock with optional per-core counters
//! - [`MemoryRegion`]: reference-counted heap over one host block, mappable
//!   into user space
//! - [`RegionRegistry`]: the shared, system and per-process heaps, and the
//!   startup/teardown sequence of the memory devices
//! - [`Mapping`]: one user view of a region, holding one reference
//! - [`SharedInfoPage`]: feature record published from the shared heap
//!
//! Builds `no_std` with `alloc`. The `std` feature (and `cargo test`) swaps
//! in a host CPU model where threads stand for cores, and enables the
//! [`mock`] collaborators.

#![cfg_attr(not(any(test, feature = "std")), no_std)]

extern crate alloc;

pub mod config;
pub mod error;
pub mod info_page;
pub mod mapping;
pub mod region;
pub mod registry;
pub mod sync;

#[cfg(any(test, feature = "std"))]
pub mod mock;


pub use config::MemConfig;
pub use error::MemError;
pub use info_page::{Features, InfoRecord, SharedInfoPage};
pub use mapping::{Mapping, VmArea, MEMDEV_STAT};
pub use region::{BuddyHeap, Heap, HostMemory, MemoryRegion, RegionCaps, RegionStat, SystemPages};
pub use registry::{
    Endpoint, EndpointRegistrar, OpenFlags, ProcessId, RegionRegistry, Session, StartupStage,
};
pub use sync::{CpuControl, DiagLock, LockStats};
