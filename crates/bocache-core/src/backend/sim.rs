//! In-process simulated backend.
//!
//! Hands out recycled handles (lowest free first, starting at 1, like GEM
//! handles) and bump-allocated GPU addresses. An optional byte budget and
//! failure switches let callers reproduce memory pressure.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use parking_lot::Mutex;

use super::{Backend, BackendBo};
use crate::bo::Bo;
use crate::bo::flags::BoFlags;
use crate::error::BackendError;

/// Default simulated page size.
pub const SIM_PAGE_SIZE: usize = 4096;

/// First GPU virtual address handed out.
const SIM_VA_BASE: u64 = 0x1_0000_0000;

/// Offset of simulated CPU mappings from the GPU address.
const SIM_CPU_MAP_BASE: u64 = 0x7f00_0000_0000;

struct SimState {
    /// Live allocations: handle -> size.
    live: HashMap<u32, usize>,
    live_bytes: usize,
    budget: Option<usize>,
    /// Freed handles available for reuse.
    free_handles: BTreeSet<u32>,
    next_handle: u32,
    next_va: u64,
}

/// Simulated memory backend.
pub struct SimBackend {
    page_size: usize,
    state: Mutex<SimState>,
    fail_all: AtomicBool,
    fail_next: AtomicU32,
    alloc_attempts: AtomicU64,
    alloc_failures: AtomicU64,
    frees: AtomicU64,
    unknown_frees: AtomicU64,
    maps: AtomicU64,
}

impl SimBackend {
    /// Unbounded backend with 4 KiB pages.
    #[must_use]
    pub fn new() -> Self {
        Self {
            page_size: SIM_PAGE_SIZE,
            state: Mutex::new(SimState {
                live: HashMap::new(),
                live_bytes: 0,
                budget: None,
                free_handles: BTreeSet::new(),
                next_handle: 1,
                next_va: SIM_VA_BASE,
            }),
            fail_all: AtomicBool::new(false),
            fail_next: AtomicU32::new(0),
            alloc_attempts: AtomicU64::new(0),
            alloc_failures: AtomicU64::new(0),
            frees: AtomicU64::new(0),
            unknown_frees: AtomicU64::new(0),
            maps: AtomicU64::new(0),
        }
    }

    /// Use a different page size. Must be a power of two.
    #[must_use]
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        debug_assert!(page_size.is_power_of_two());
        self.page_size = page_size;
        self
    }

    /// Cap live bytes; allocations that would exceed the cap fail.
    #[must_use]
    pub fn with_budget(self, bytes: usize) -> Self {
        self.state.lock().budget = Some(bytes);
        self
    }

    pub fn set_budget(&self, bytes: Option<usize>) {
        self.state.lock().budget = bytes;
    }

    /// Make every allocation fail until switched off.
    pub fn set_fail_all(&self, fail: bool) {
        self.fail_all.store(fail, Ordering::Release);
    }

    /// Make the next `count` allocations fail.
    pub fn fail_next(&self, count: u32) {
        self.fail_next.store(count, Ordering::Release);
    }

    #[must_use]
    pub fn alloc_attempts(&self) -> u64 {
        self.alloc_attempts.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn alloc_failures(&self) -> u64 {
        self.alloc_failures.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn frees(&self) -> u64 {
        self.frees.load(Ordering::Acquire)
    }

    /// Frees of handles that were not live (double frees).
    #[must_use]
    pub fn unknown_frees(&self) -> u64 {
        self.unknown_frees.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn maps(&self) -> u64 {
        self.maps.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn live_bytes(&self) -> usize {
        self.state.lock().live_bytes
    }

    #[must_use]
    pub fn live_count(&self) -> usize {
        self.state.lock().live.len()
    }

    fn injected_failure(&self) -> bool {
        if self.fail_all.load(Ordering::Acquire) {
            return true;
        }
        self.fail_next
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl Default for SimBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl Backend for SimBackend {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn bo_alloc(
        &self,
        size: usize,
        align: usize,
        flags: BoFlags,
    ) -> Result<BackendBo, BackendError> {
        self.alloc_attempts.fetch_add(1, Ordering::AcqRel);
        if self.injected_failure() {
            self.alloc_failures.fetch_add(1, Ordering::AcqRel);
            return Err(BackendError::OutOfMemory { size });
        }
        if size == 0 || size % self.page_size != 0 || !align.is_power_of_two() {
            self.alloc_failures.fetch_add(1, Ordering::AcqRel);
            return Err(BackendError::Rejected(format!(
                "size={size} align={align} page_size={}",
                self.page_size
            )));
        }

        let mut state = self.state.lock();
        let align = align.max(self.page_size) as u64;
        // Requests that overflow the byte count or the address space fail
        // like any other exhausted allocation.
        let range = u64::try_from(size).ok().and_then(|len| {
            let va = state.next_va.checked_next_multiple_of(align)?;
            Some((va, va.checked_add(len)?))
        });
        let live_bytes = state.live_bytes.checked_add(size);
        let Some(((va, next_va), live_bytes)) = range.zip(live_bytes) else {
            self.alloc_failures.fetch_add(1, Ordering::AcqRel);
            return Err(BackendError::OutOfMemory { size });
        };
        if state.budget.is_some_and(|budget| live_bytes > budget) {
            self.alloc_failures.fetch_add(1, Ordering::AcqRel);
            return Err(BackendError::OutOfMemory { size });
        }

        let handle = match state.free_handles.pop_first() {
            Some(handle) => handle,
            None => {
                let handle = state.next_handle;
                state.next_handle += 1;
                handle
            }
        };
        state.next_va = next_va;
        state.live.insert(handle, size);
        state.live_bytes = live_bytes;

        Ok(BackendBo {
            handle,
            size,
            align: align as usize,
            flags,
            va,
        })
    }

    fn bo_free(&self, bo: &Bo) {
        let mut state = self.state.lock();
        match state.live.remove(&bo.handle()) {
            Some(size) => {
                state.live_bytes -= size;
                state.free_handles.insert(bo.handle());
                self.frees.fetch_add(1, Ordering::AcqRel);
            }
            None => {
                self.unknown_frees.fetch_add(1, Ordering::AcqRel);
            }
        }
    }

    fn bo_map(&self, bo: &Bo) -> Result<u64, BackendError> {
        if !self.state.lock().live.contains_key(&bo.handle()) {
            return Err(BackendError::Rejected(format!(
                "map of dead handle {}",
                bo.handle()
            )));
        }
        self.maps.fetch_add(1, Ordering::AcqRel);
        Ok(SIM_CPU_MAP_BASE.wrapping_add(bo.va()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::borrow::Cow;

    fn wrap(raw: BackendBo) -> Bo {
        Bo::from_backend(raw, Cow::Borrowed("Sim"))
    }

    #[test]
    fn handles_start_at_one_and_recycle_lowest_first() {
        let sim = SimBackend::new();
        let a = sim.bo_alloc(4096, 4096, BoFlags::NONE).unwrap();
        let b = sim.bo_alloc(4096, 4096, BoFlags::NONE).unwrap();
        let c = sim.bo_alloc(4096, 4096, BoFlags::NONE).unwrap();
        assert_eq!((a.handle, b.handle, c.handle), (1, 2, 3));

        sim.bo_free(&wrap(c));
        sim.bo_free(&wrap(a));
        let d = sim.bo_alloc(8192, 4096, BoFlags::NONE).unwrap();
        assert_eq!(d.handle, 1);
        assert_eq!(sim.live_count(), 2);
        assert_eq!(sim.live_bytes(), 4096 + 8192);
    }

    #[test]
    fn addresses_honor_alignment_and_do_not_overlap() {
        let sim = SimBackend::new();
        let a = sim.bo_alloc(4096, 4096, BoFlags::NONE).unwrap();
        let b = sim.bo_alloc(8192, 65536, BoFlags::NONE).unwrap();
        assert_eq!(b.va % 65536, 0);
        assert!(b.va >= a.va + 4096);
        assert_eq!(b.align, 65536);
    }

    #[test]
    fn budget_limits_live_bytes() {
        let sim = SimBackend::new().with_budget(3 * 4096);
        let a = sim.bo_alloc(8192, 4096, BoFlags::NONE).unwrap();
        assert_eq!(
            sim.bo_alloc(8192, 4096, BoFlags::NONE),
            Err(BackendError::OutOfMemory { size: 8192 })
        );
        sim.bo_free(&wrap(a));
        assert!(sim.bo_alloc(8192, 4096, BoFlags::NONE).is_ok());
        assert_eq!(sim.alloc_attempts(), 3);
        assert_eq!(sim.alloc_failures(), 1);
    }

    #[test]
    fn failure_injection() {
        let sim = SimBackend::new();
        sim.fail_next(2);
        assert!(sim.bo_alloc(4096, 4096, BoFlags::NONE).is_err());
        assert!(sim.bo_alloc(4096, 4096, BoFlags::NONE).is_err());
        assert!(sim.bo_alloc(4096, 4096, BoFlags::NONE).is_ok());

        sim.set_fail_all(true);
        assert!(sim.bo_alloc(4096, 4096, BoFlags::NONE).is_err());
        sim.set_fail_all(false);
        assert!(sim.bo_alloc(4096, 4096, BoFlags::NONE).is_ok());
        assert_eq!(sim.alloc_failures(), 3);
    }

    #[test]
    fn oversized_request_fails_without_consuming_a_handle() {
        let sim = SimBackend::new();
        let huge = usize::MAX - (SIM_PAGE_SIZE - 1);
        assert_eq!(
            sim.bo_alloc(huge, 4096, BoFlags::NONE),
            Err(BackendError::OutOfMemory { size: huge })
        );
        assert_eq!(sim.alloc_failures(), 1);
        assert_eq!(sim.live_bytes(), 0);

        let bo = sim.bo_alloc(4096, 4096, BoFlags::NONE).unwrap();
        assert_eq!(bo.handle, 1);
        assert_eq!(bo.va, SIM_VA_BASE);
    }

    #[test]
    fn rejects_unaligned_sizes() {
        let sim = SimBackend::new();
        assert!(matches!(
            sim.bo_alloc(1000, 4096, BoFlags::NONE),
            Err(BackendError::Rejected(_))
        ));
    }

    #[test]
    fn double_free_is_counted_not_applied() {
        let sim = SimBackend::new();
        let bo = wrap(sim.bo_alloc(4096, 4096, BoFlags::NONE).unwrap());
        sim.bo_free(&bo);
        sim.bo_free(&bo);
        assert_eq!(sim.frees(), 1);
        assert_eq!(sim.unknown_frees(), 1);
        assert_eq!(sim.live_bytes(), 0);
    }

    #[test]
    fn map_requires_live_handle() {
        let sim = SimBackend::new();
        let bo = wrap(sim.bo_alloc(4096, 4096, BoFlags::NONE).unwrap());
        let addr = sim.bo_map(&bo).unwrap();
        assert_eq!(addr, SIM_CPU_MAP_BASE + bo.va());
        sim.bo_free(&bo);
        assert!(sim.bo_map(&bo).is_err());
        assert_eq!(sim.maps(), 1);
    }
}
