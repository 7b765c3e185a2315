//! Kernel status codes.
//!
//! Every fallible API returns [`KernelResult`]. The discriminants match the
//! wire-level status codes of the kernel ABI, so `err as i32` yields the
//! numeric code.

/// Error codes returned by kernel APIs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum KernelError {
    /// Generic failure (resource unavailable, saturation, non-owner release).
    Error = -1,
    /// A finite wait elapsed without the resource becoming available.
    Timeout = -2,
    /// Resource busy.
    Busy = -3,
    /// Out-of-range or inconsistent argument.
    Invalid = -4,
    /// Null pointer argument.
    NullPtr = -5,
    /// The object was deleted (possibly while the caller was blocked on it).
    Deleted = -6,
    /// Operation not supported in the current context.
    Unsupported = -7,
}

impl KernelError {
    /// Numeric status code of this error.
    #[inline]
    pub const fn code(self) -> i32 {
        self as i32
    }
}

/// Result alias used across the kernel. `Ok(())` corresponds to status 0.
pub type KernelResult<T = ()> = Result<T, KernelError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(KernelError::Error.code(), -1);
        assert_eq!(KernelError::Timeout.code(), -2);
        assert_eq!(KernelError::Busy.code(), -3);
        assert_eq!(KernelError::Invalid.code(), -4);
        assert_eq!(KernelError::NullPtr.code(), -5);
        assert_eq!(KernelError::Deleted.code(), -6);
        assert_eq!(KernelError::Unsupported.code(), -7);
    }
}
