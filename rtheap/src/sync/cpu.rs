//! # CPU Control
//!
//! Local interrupt masking and core identification, the two things the
//! diagnostic lock needs from the processor.
//!
//! Two implementations are provided:
//! - [`NativeCpu`]: bare-metal x86_64, real `cli`/`sti` and the APIC id
//! - [`HostCpu`]: hosted builds and tests, where every thread models one
//!   core and a thread-local flag models the interrupt mask
//!
//! [`DefaultCpu`] picks one at build time.

/// Number of per-core slots kept by diagnostic counters.
///
/// Core numbers beyond this are folded back into range.
pub const MAX_CORES: usize = 16;

/// Interrupt state saved by [`CpuControl::irq_save`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IrqFlags {
    enabled: bool,
}

impl IrqFlags {
    /// Whether interrupts were enabled before the save
    pub fn were_enabled(self) -> bool {
        self.enabled
    }
}

/// Processor operations used by the lock
///
/// All functions act on the calling core only.
pub trait CpuControl {
    /// Disable local interrupt delivery and return the previous state
    fn irq_save() -> IrqFlags;

    /// Restore the interrupt state returned by a matching `irq_save`
    fn irq_restore(flags: IrqFlags);

    /// Whether local interrupt delivery is currently masked
    fn irqs_disabled() -> bool;

    /// Index of the calling core, always below [`MAX_CORES`]
    fn core_id() -> usize;
}

/// Bare-metal x86_64 interrupt control
#[cfg(target_arch = "x86_64")]
pub struct NativeCpu;

#[cfg(target_arch = "x86_64")]
impl CpuControl for NativeCpu {
    #[inline]
    fn irq_save() -> IrqFlags {
        let enabled = x86_64::instructions::interrupts::are_enabled();
        if enabled {
            x86_64::instructions::interrupts::disable();
        }
        IrqFlags { enabled }
    }

    #[inline]
    fn irq_restore(flags: IrqFlags) {
        if flags.enabled {
            x86_64::instructions::interrupts::enable();
        }
    }

    #[inline]
    fn irqs_disabled() -> bool {
        !x86_64::instructions::interrupts::are_enabled()
    }

    #[inline]
    fn core_id() -> usize {
        // Initial APIC id lives in EBX[31:24] of leaf 1
        #[allow(unused_unsafe)]
        let leaf = unsafe { core::arch::x86_64::__cpuid(1) };
        ((leaf.ebx >> 24) as usize) % MAX_CORES
    }
}

#[cfg(any(test, feature = "std"))]
pub use host::HostCpu;

#[cfg(any(test, feature = "std"))]
mod host {
    use super::{CpuControl, IrqFlags, MAX_CORES};
    use core::sync::atomic::{AtomicUsize, Ordering};
    use std::cell::Cell;

    /// Next core number handed to a thread that has not asked yet
    static NEXT_CORE: AtomicUsize = AtomicUsize::new(0);

    const UNASSIGNED: usize = usize::MAX;

    std::thread_local! {
        static IRQS_ENABLED: Cell<bool> = Cell::new(true);
        static CORE: Cell<usize> = Cell::new(UNASSIGNED);
    }

    /// Hosted CPU model: one thread is one core
    ///
    /// Core numbers are assigned round-robin on first use, so more than
    /// [`MAX_CORES`] threads share slots.
    pub struct HostCpu;

    impl CpuControl for HostCpu {
        fn irq_save() -> IrqFlags {
            let enabled = IRQS_ENABLED.with(|flag| flag.replace(false));
            IrqFlags { enabled }
        }

        fn irq_restore(flags: IrqFlags) {
            IRQS_ENABLED.with(|flag| flag.set(flags.enabled));
        }

        fn irqs_disabled() -> bool {
            !IRQS_ENABLED.with(|flag| flag.get())
        }

        fn core_id() -> usize {
            CORE.with(|core| {
                if core.get() == UNASSIGNED {
                    core.set(NEXT_CORE.fetch_add(1, Ordering::Relaxed) % MAX_CORES);
                }
                core.get()
            })
        }
    }
}

/// CPU model used when a lock does not name one
#[cfg(any(test, feature = "std"))]
pub type DefaultCpu = HostCpu;

/// CPU model used when a lock does not name one
#[cfg(all(not(any(test, feature = "std")), target_arch = "x86_64"))]
pub type DefaultCpu = NativeCpu;

#[cfg(all(not(any(test, feature = "std")), not(target_arch = "x86_64")))]
compile_error!("bare-metal builds need a CpuControl for this architecture; enable `std` for hosted builds");
