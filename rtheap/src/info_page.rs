//! Shared info page
//!
//! A fixed record carved from the shared region at startup. User views find
//! it at a stable offset from the region base; kernel consumers get it from
//! the registry once startup has completed.

use core::ptr::NonNull;

bitflags::bitflags! {
    /// Features the nucleus advertises to user space
    pub struct Features: u64 {
        /// The host clock can be read without entering the kernel
        const HOST_REALTIME    = 1 << 0;
        /// A wall-clock offset is published alongside the host clock
        const WALLCLOCK_OFFSET = 1 << 1;
    }
}

/// Layout of the published record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct InfoRecord {
    pub features: u64,
}

/// Handle on the record inside the shared region
#[derive(Debug, Clone, Copy)]
pub struct SharedInfoPage {
    record: NonNull<InfoRecord>,
    offset: usize,
}

// SAFETY: the record is written once before the handle escapes and is
// read-only afterwards
unsafe impl Send for SharedInfoPage {}
unsafe impl Sync for SharedInfoPage {}

impl SharedInfoPage {
    /// Write the record at `ptr`
    ///
    /// # Safety
    ///
    /// `ptr` must point to at least `size_of::<InfoRecord>()` writable bytes
    /// suitably aligned, inside the region starting at `region_base`, and
    /// must stay valid while the handle is in use.
    pub(crate) unsafe fn populate(
        ptr: NonNull<u8>,
        region_base: NonNull<u8>,
        features: Features,
    ) -> Self {
        let record = ptr.cast::<InfoRecord>();
        core::ptr::write_volatile(
            record.as_ptr(),
            InfoRecord {
                features: features.bits(),
            },
        );
        Self {
            record,
            offset: ptr.as_ptr() as usize - region_base.as_ptr() as usize,
        }
    }

    /// Published features; bits this build does not know are dropped
    pub fn features(&self) -> Features {
        Features::from_bits_truncate(self.raw_features())
    }

    pub fn raw_features(&self) -> u64 {
        // SAFETY: the record lives as long as the shared region backing it
        unsafe { core::ptr::read_volatile(core::ptr::addr_of!((*self.record.as_ptr()).features)) }
    }

    /// Byte offset of the record from the shared region base
    pub fn offset(&self) -> usize {
        self.offset
    }

    pub(crate) fn as_ptr(&self) -> NonNull<u8> {
        self.record.cast()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_populate_and_read_back() {
        let mut backing = [0u64; 8];
        let base = NonNull::new(backing.as_mut_ptr() as *mut u8).unwrap();
        let at = NonNull::new(unsafe { base.as_ptr().add(16) }).unwrap();

        let page = unsafe { SharedInfoPage::populate(at, base, Features::HOST_REALTIME) };

        assert_eq!(page.offset(), 16);
        assert_eq!(page.features(), Features::HOST_REALTIME);
        assert_eq!(backing[2], Features::HOST_REALTIME.bits());
    }

    #[test]
    fn test_unknown_bits_are_truncated() {
        let mut backing = [0u64; 1];
        let base = NonNull::new(backing.as_mut_ptr() as *mut u8).unwrap();
        let page = unsafe { SharedInfoPage::populate(base, base, Features::all()) };

        unsafe { core::ptr::write_volatile(base.as_ptr() as *mut u64, Features::all().bits() | 1 << 40) };
        assert_eq!(page.raw_features() & (1 << 40), 1 << 40);
        assert_eq!(page.features(), Features::all());
    }

    #[test]
    fn test_record_layout() {
        assert_eq!(core::mem::size_of::<InfoRecord>(), 8);
    }
}
