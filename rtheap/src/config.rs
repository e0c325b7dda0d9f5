//! Memory configuration
//!
//! Sizes of the well-known heaps and the feature set published in the shared
//! info page. Sizes are in bytes and are rounded up to whole pages when the
//! regions are created.
//!
//! | Field | Description | Default |
//! |-------|-------------|---------|
//! | `shared_heap_size` | Shared heap, mapped by every process | 65536 (64 KiB) |
//! | `private_heap_size` | Heap created per attached process | 65536 (64 KiB) |
//! | `system_heap_size` | Nucleus heap, stats only from user space | 262144 (256 KiB) |
//! | `features` | Published feature bits | all known features |
//!
//! ```rust,ignore
//! let config = MemConfig::default()
//!     .with_shared_heap_size(128 * 1024)
//!     .with_features(Features::HOST_REALTIME);
//! ```

use crate::error::MemError;
use crate::info_page::Features;

pub const DEFAULT_SHARED_HEAP_SIZE: usize = 64 * 1024;
pub const DEFAULT_PRIVATE_HEAP_SIZE: usize = 64 * 1024;
pub const DEFAULT_SYSTEM_HEAP_SIZE: usize = 256 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemConfig {
    pub shared_heap_size: usize,
    pub private_heap_size: usize,
    pub system_heap_size: usize,
    pub features: Features,
}

impl Default for MemConfig {
    fn default() -> Self {
        Self {
            shared_heap_size: DEFAULT_SHARED_HEAP_SIZE,
            private_heap_size: DEFAULT_PRIVATE_HEAP_SIZE,
            system_heap_size: DEFAULT_SYSTEM_HEAP_SIZE,
            features: Features::all(),
        }
    }
}

impl MemConfig {
    pub fn with_shared_heap_size(mut self, size: usize) -> Self {
        self.shared_heap_size = size;
        self
    }

    pub fn with_private_heap_size(mut self, size: usize) -> Self {
        self.private_heap_size = size;
        self
    }

    pub fn with_system_heap_size(mut self, size: usize) -> Self {
        self.system_heap_size = size;
        self
    }

    pub fn with_features(mut self, features: Features) -> Self {
        self.features = features;
        self
    }

    /// Reject configurations no region could be built from
    pub fn validate(&self) -> Result<(), MemError> {
        if self.shared_heap_size == 0 || self.private_heap_size == 0 || self.system_heap_size == 0
        {
            return Err(MemError::InvalidArgument);
        }
        Ok(())
    }
}
