//! Memory backend the cache sits in front of.
//!
//! The backend is the only source of genuinely new memory. In a driver it wraps
//! the kernel's GEM create/close and mmap ioctls.

pub mod sim;

use std::sync::Arc;

use crate::bo::Bo;
use crate::bo::flags::BoFlags;
use crate::error::BackendError;

/// A fresh allocation as reported by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackendBo {
    /// Backend handle, unique among live allocations.
    pub handle: u32,
    /// Allocated size; at least the requested (page-aligned) size.
    pub size: usize,
    pub align: usize,
    pub flags: BoFlags,
    /// GPU virtual address.
    pub va: u64,
}

/// Kernel-side allocation service.
///
/// `bo_alloc` may fail at any time and must be safe to call again right away.
/// `bo_free` cannot fail.
pub trait Backend: Send + Sync {
    /// Allocation granule; every BO size is a multiple of it.
    fn page_size(&self) -> usize;

    fn bo_alloc(&self, size: usize, align: usize, flags: BoFlags)
    -> Result<BackendBo, BackendError>;

    /// Return a BO's memory. The handle may be reused afterwards.
    fn bo_free(&self, bo: &Bo);

    /// Map a BO for CPU access and return the CPU address.
    fn bo_map(&self, bo: &Bo) -> Result<u64, BackendError>;
}

impl<B: Backend + ?Sized> Backend for Arc<B> {
    fn page_size(&self) -> usize {
        (**self).page_size()
    }

    fn bo_alloc(
        &self,
        size: usize,
        align: usize,
        flags: BoFlags,
    ) -> Result<BackendBo, BackendError> {
        (**self).bo_alloc(size, align, flags)
    }

    fn bo_free(&self, bo: &Bo) {
        (**self).bo_free(bo);
    }

    fn bo_map(&self, bo: &Bo) -> Result<u64, BackendError> {
        (**self).bo_map(bo)
    }
}
