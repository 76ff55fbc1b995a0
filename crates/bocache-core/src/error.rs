//! Error types for BO allocation.

use thiserror::Error;

/// Failure reported by a [`Backend`](crate::Backend).
///
/// An allocation failure from the backend is transient from the allocator's
/// point of view: `Device::create` falls back to the cache and to eviction
/// before giving up.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    #[error("backend out of memory allocating {size} bytes")]
    OutOfMemory { size: usize },
    #[error("backend rejected request: {0}")]
    Rejected(String),
}

/// Error returned by [`Device`](crate::Device) operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BoError {
    /// Zero-byte request, or a size that overflows when rounded to the page size.
    #[error("invalid BO size {size}")]
    InvalidSize { size: usize },
    #[error("BO alignment {align} is not a power of two")]
    InvalidAlignment { align: usize },
    /// Every retry was exhausted. Fatal to the call, not to the process.
    #[error("BO creation failed: {size} bytes, align {align}, flags {flags:#x}")]
    OutOfMemory { size: usize, align: usize, flags: u32 },
    #[error("no live BO with handle {0}")]
    UnknownHandle(u32),
    /// The BO is cached or being released, so the caller holds no reference.
    #[error("BO {0} holds no references")]
    Unreferenced(u32),
    #[error(transparent)]
    Backend(#[from] BackendError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn oom_message_names_request() {
        let err = BoError::OutOfMemory {
            size: 12288,
            align: 4096,
            flags: 0x4,
        };
        assert_eq!(
            err.to_string(),
            "BO creation failed: 12288 bytes, align 4096, flags 0x4"
        );
    }

    #[test]
    fn backend_error_converts_transparently() {
        let err: BoError = BackendError::OutOfMemory { size: 64 }.into();
        assert_eq!(err.to_string(), "backend out of memory allocating 64 bytes");
        assert!(matches!(err, BoError::Backend(_)));
    }
}
