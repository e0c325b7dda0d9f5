//! Error taxonomy shared by every layer of the memory core.
//!
//! All failures propagate synchronously to the immediate caller. Nothing in
//! this crate retries.

/// Errors reported by regions, the registry and the mapping layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemError {
    /// Host page allocation or heap allocation failed
    OutOfMemory,
    /// Malformed size, size mismatch, or unknown request code
    InvalidArgument,
    /// The session references a region that does not exist
    NoSuchDevice,
    /// Write, allocate or map request against a stats-only region
    PermissionDenied,
}

impl MemError {
    /// Negative POSIX error code, as returned to the device glue
    pub fn errno(self) -> i32 {
        match self {
            MemError::OutOfMemory => -12,
            MemError::InvalidArgument => -22,
            MemError::NoSuchDevice => -19,
            MemError::PermissionDenied => -13,
        }
    }
}

impl core::fmt::Display for MemError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            MemError::OutOfMemory => write!(f, "Out of memory"),
            MemError::InvalidArgument => write!(f, "Invalid argument"),
            MemError::NoSuchDevice => write!(f, "No such device"),
            MemError::PermissionDenied => write!(f, "Permission denied"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::string::ToString;

    #[test]
    fn test_errno_values() {
        assert_eq!(MemError::OutOfMemory.errno(), -12);
        assert_eq!(MemError::InvalidArgument.errno(), -22);
        assert_eq!(MemError::NoSuchDevice.errno(), -19);
        assert_eq!(MemError::PermissionDenied.errno(), -13);
    }

    #[test]
    fn test_display() {
        assert_eq!(MemError::NoSuchDevice.to_string(), "No such device");
    }
}
