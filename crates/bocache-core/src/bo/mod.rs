//! Buffer objects and the allocator built around them.

pub mod bucket;
pub mod cache;
pub mod device;
pub mod diag;
pub mod flags;
pub(crate) mod table;

use std::borrow::Cow;
use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::backend::BackendBo;
use flags::BoFlags;

/// One GPU-visible memory allocation.
///
/// `Arc<Bo>` keeps the record itself alive; ownership of the *memory* is
/// tracked by the explicit reference count. A BO with a count of zero is either
/// sitting in the device cache or has been returned to the backend.
pub struct Bo {
    handle: u32,
    /// Page-aligned size.
    size: usize,
    align: usize,
    /// GPU virtual address.
    va: u64,
    flags: AtomicU32,
    refcnt: AtomicU32,
    /// CPU mapping, 0 when unmapped.
    map: AtomicU64,
    label: Mutex<Cow<'static, str>>,
}

impl Bo {
    /// New BO from a fresh backend allocation, holding one reference.
    pub(crate) fn from_backend(raw: BackendBo, label: Cow<'static, str>) -> Self {
        Self {
            handle: raw.handle,
            size: raw.size,
            align: raw.align,
            va: raw.va,
            flags: AtomicU32::new(raw.flags.bits()),
            refcnt: AtomicU32::new(1),
            map: AtomicU64::new(0),
            label: Mutex::new(label),
        }
    }

    #[must_use]
    pub fn handle(&self) -> u32 {
        self.handle
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    #[must_use]
    pub fn align(&self) -> usize {
        self.align
    }

    #[must_use]
    pub fn va(&self) -> u64 {
        self.va
    }

    #[must_use]
    pub fn flags(&self) -> BoFlags {
        BoFlags::from_bits(self.flags.load(Ordering::Acquire))
    }

    #[must_use]
    pub fn is_shared(&self) -> bool {
        self.flags().is_shared()
    }

    #[must_use]
    pub fn refcount(&self) -> u32 {
        self.refcnt.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn label(&self) -> Cow<'static, str> {
        self.label.lock().clone()
    }

    /// CPU address of the mapping, if mapped.
    #[must_use]
    pub fn mapped_addr(&self) -> Option<u64> {
        match self.map.load(Ordering::Acquire) {
            0 => None,
            addr => Some(addr),
        }
    }

    #[must_use]
    pub fn is_mapped(&self) -> bool {
        self.mapped_addr().is_some()
    }

    /// Take an additional reference.
    ///
    /// The caller must already hold one: referencing a cached or freed BO is a
    /// contract violation.
    pub fn reference(&self) {
        let prev = self.refcnt.fetch_add(1, Ordering::AcqRel);
        debug_assert!(prev != 0, "BO {} referenced with a zero count", self.handle);
    }

    /// Drop one reference and return the remaining count, or `None` if the
    /// count was already zero.
    pub(crate) fn release(&self) -> Option<u32> {
        self.refcnt
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                count.checked_sub(1)
            })
            .ok()
            .map(|prev| prev - 1)
    }

    /// Take a reference on a BO that may be mid-release.
    ///
    /// Only valid under the BO-table lock, where the releasing thread
    /// re-checks the count before committing.
    pub(crate) fn reacquire(&self) {
        self.refcnt.fetch_add(1, Ordering::AcqRel);
    }

    /// Hand a cached BO back out with one reference.
    pub(crate) fn revive(&self) {
        self.refcnt.store(1, Ordering::Release);
    }

    pub(crate) fn set_label(&self, label: Cow<'static, str>) {
        *self.label.lock() = label;
    }

    pub(crate) fn mark_shared(&self) {
        self.flags.fetch_or(BoFlags::SHARED.bits(), Ordering::AcqRel);
    }

    /// Record a mapping unless one already exists; returns the winning address.
    pub(crate) fn set_mapped(&self, addr: u64) -> u64 {
        match self
            .map
            .compare_exchange(0, addr, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => addr,
            Err(existing) => existing,
        }
    }
}

impl fmt::Debug for Bo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bo")
            .field("handle", &self.handle)
            .field("size", &self.size)
            .field("align", &self.align)
            .field("va", &format_args!("{:#x}", self.va))
            .field("flags", &self.flags())
            .field("refcnt", &self.refcount())
            .field("label", &self.label())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bo() -> Bo {
        Bo::from_backend(
            BackendBo {
                handle: 3,
                size: 8192,
                align: 4096,
                flags: BoFlags::WRITEBACK,
                va: 0x1_0000_0000,
            },
            Cow::Borrowed("Test"),
        )
    }

    #[test]
    fn fresh_bo_holds_one_reference() {
        let bo = bo();
        assert_eq!(bo.refcount(), 1);
        assert_eq!(bo.handle(), 3);
        assert_eq!(bo.flags(), BoFlags::WRITEBACK);
        assert_eq!(bo.label(), "Test");
        assert!(!bo.is_mapped());
    }

    #[test]
    fn reference_and_release_pair_up() {
        let bo = bo();
        bo.reference();
        assert_eq!(bo.refcount(), 2);
        assert_eq!(bo.release(), Some(1));
        assert_eq!(bo.release(), Some(0));
        assert_eq!(bo.release(), None, "release below zero must be refused");
        assert_eq!(bo.refcount(), 0);
    }

    #[test]
    fn revive_restores_single_reference() {
        let bo = bo();
        assert_eq!(bo.release(), Some(0));
        bo.revive();
        assert_eq!(bo.refcount(), 1);
    }

    #[test]
    fn mark_shared_is_sticky() {
        let bo = bo();
        bo.mark_shared();
        assert!(bo.is_shared());
        assert!(bo.flags().contains(BoFlags::WRITEBACK));
    }

    #[test]
    fn first_mapping_wins() {
        let bo = bo();
        assert_eq!(bo.set_mapped(0x7000), 0x7000);
        assert_eq!(bo.set_mapped(0x9000), 0x7000);
        assert_eq!(bo.mapped_addr(), Some(0x7000));
    }
}
