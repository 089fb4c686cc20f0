//! Kernel error types
//!
//! A single `KernelError` enum covers every failure surface in the
//! execution core (§7): resource exhaustion, address-space lookup
//! failures, permission faults, interrupted waits and deadline timeouts.
//! Fatal invariant violations are never returned as a value -- they panic
//! at the point of violation, per the scheduler's panic contract.

use core::fmt;

/// Main kernel error type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "kernel errors must be handled, not silently discarded"]
pub enum KernelError {
    /// A frame, ASID or thread slot could not be allocated.
    ResourceExhausted { resource: &'static str },
    /// No address-space region contains the faulting address.
    NotFound { what: &'static str },
    /// The access type is forbidden by the region's flags or privilege
    /// level (write to read-only, execute non-executable, user to kernel).
    Permission { operation: &'static str },
    /// A wait was cancelled before its predicate was satisfied.
    Interrupted,
    /// A deadline elapsed before the operation completed.
    Timeout,
    /// Legacy string error, retained for gradual migration from
    /// `&'static str` return types.
    LegacyError { message: &'static str },
}

/// Result type alias for kernel operations.
pub type KernelResult<T> = Result<T, KernelError>;

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ResourceExhausted { resource } => {
                write!(f, "resource exhausted: {resource}")
            }
            Self::NotFound { what } => write!(f, "not found: {what}"),
            Self::Permission { operation } => {
                write!(f, "permission denied for operation: {operation}")
            }
            Self::Interrupted => write!(f, "wait interrupted"),
            Self::Timeout => write!(f, "deadline elapsed"),
            Self::LegacyError { message } => write!(f, "{message}"),
        }
    }
}

impl From<&'static str> for KernelError {
    fn from(msg: &'static str) -> Self {
        Self::LegacyError { message: msg }
    }
}

/// Helper macro for concise error construction.
#[macro_export]
macro_rules! kernel_error {
    (ResourceExhausted { $resource:expr }) => {
        $crate::error::KernelError::ResourceExhausted { resource: $resource }
    };
    (NotFound { $what:expr }) => {
        $crate::error::KernelError::NotFound { what: $what }
    };
    (Permission { $op:expr }) => {
        $crate::error::KernelError::Permission { operation: $op }
    };
    ($variant:ident) => {
        $crate::error::KernelError::$variant
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_renders_resource() {
        use core::fmt::Write;
        let mut buf = heapless_buf::Buf::new();
        let e = KernelError::ResourceExhausted { resource: "frames" };
        write!(buf, "{e}").unwrap();
        assert_eq!(buf.as_str(), "resource exhausted: frames");
    }

    mod heapless_buf {
        use core::fmt;

        pub struct Buf {
            data: [u8; 64],
            len: usize,
        }

        impl Buf {
            pub fn new() -> Self {
                Self {
                    data: [0; 64],
                    len: 0,
                }
            }

            pub fn as_str(&self) -> &str {
                core::str::from_utf8(&self.data[..self.len]).unwrap()
            }
        }

        impl fmt::Write for Buf {
            fn write_str(&mut self, s: &str) -> fmt::Result {
                let bytes = s.as_bytes();
                self.data[self.len..self.len + bytes.len()].copy_from_slice(bytes);
                self.len += bytes.len();
                Ok(())
            }
        }
    }

    #[test]
    fn legacy_str_conversion() {
        let e: KernelError = "boom".into();
        assert_eq!(e, KernelError::LegacyError { message: "boom" });
    }
}
