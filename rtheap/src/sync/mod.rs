//! # Synchronization
//!
//! The interrupt-safe diagnostic lock and the processor seam it sits on.

pub mod cpu;
pub mod diag_lock;

pub use cpu::{CpuControl, DefaultCpu, IrqFlags, MAX_CORES};
pub use diag_lock::{
    CoreLockStats, DefaultDiag, DiagLock, DiagLockGuard, Instrumented, LockDiagnostics, LockStats,
    Plain,
};
