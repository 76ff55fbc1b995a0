//! Handle-indexed table of live BOs.
//!
//! Cached BOs stay in the table with a zero count; a BO leaves the table only
//! when it is returned to the backend. The device guards the table with the
//! BO-table lock, which also serializes zero-count transitions.

use std::sync::Arc;

use super::Bo;

#[derive(Default)]
pub(crate) struct BoTable {
    slots: Vec<Option<Arc<Bo>>>,
    live: usize,
}

impl BoTable {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Register a BO under its handle.
    ///
    /// Backends recycle a handle only after it was freed, so the slot is empty.
    pub(crate) fn insert(&mut self, bo: Arc<Bo>) {
        let slot = bo.handle() as usize;
        if self.slots.len() <= slot {
            self.slots.resize_with(slot + 1, || None);
        }
        let previous = self.slots[slot].replace(bo);
        debug_assert!(previous.is_none(), "handle {slot} registered twice");
        if previous.is_none() {
            self.live += 1;
        }
    }

    pub(crate) fn get(&self, handle: u32) -> Option<&Arc<Bo>> {
        self.slots.get(handle as usize)?.as_ref()
    }

    /// Returns true if `bo` itself (not a later BO reusing its handle) is live.
    pub(crate) fn holds(&self, bo: &Arc<Bo>) -> bool {
        self.get(bo.handle())
            .is_some_and(|live| Arc::ptr_eq(live, bo))
    }

    pub(crate) fn remove(&mut self, handle: u32) -> Option<Arc<Bo>> {
        let bo = self.slots.get_mut(handle as usize)?.take()?;
        self.live -= 1;
        Some(bo)
    }

    /// One past the highest handle ever registered.
    pub(crate) fn max_handle(&self) -> u32 {
        self.slots.len() as u32
    }

    pub(crate) fn len(&self) -> usize {
        self.live
    }

    /// Live BOs in handle order.
    pub(crate) fn iter(&self) -> impl Iterator<Item = &Arc<Bo>> {
        self.slots.iter().flatten()
    }
}
