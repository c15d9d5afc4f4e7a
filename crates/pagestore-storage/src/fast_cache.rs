//! Per-storage cache of the most recently touched pages.
//!
//! Hot sequential access keeps hitting the same one or two pages; serving
//! those from a few local slots avoids contending on the shared cache.
//! Slots hold strong references but do not pin pages: the shared cache may
//! still reclaim them, and reclaimed wrappers are skipped on lookup.

use crate::buffer::BufferWrapper;
use parking_lot::RwLock;
use std::sync::Arc;

/// Number of pages remembered per storage
pub const FAST_CACHE_SLOTS: usize = 3;

type Slot = Option<(u64, Arc<BufferWrapper>)>;

#[derive(Default)]
pub struct FastPageCache {
    /// Most recently used first
    slots: RwLock<[Slot; FAST_CACHE_SLOTS]>,
}

impl FastPageCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a live wrapper for `page`
    pub fn get(&self, page: u64) -> Option<Arc<BufferWrapper>> {
        let slots = self.slots.read();
        slots.iter().flatten().find_map(|(cached, wrapper)| {
            (*cached == page && !wrapper.is_released()).then(|| wrapper.clone())
        })
    }

    /// Remember `wrapper` as the most recently used page
    pub fn update(&self, page: u64, wrapper: Arc<BufferWrapper>) {
        let mut slots = self.slots.write();
        let end = slots
            .iter()
            .position(|slot| matches!(slot, Some((cached, _)) if *cached == page))
            .unwrap_or(FAST_CACHE_SLOTS - 1);
        slots[..=end].rotate_right(1);
        slots[0] = Some((page, wrapper));
    }

    pub fn clear(&self) {
        *self.slots.write() = Default::default();
    }

    /// Page bytes still reachable through the slots
    #[cfg(test)]
    pub(crate) fn retained_bytes(&self) -> usize {
        self.slots.read().iter().flatten().map(|(_, wrapper)| wrapper.len()).sum()
    }

    /// Pages currently remembered, most recent first
    pub fn pages(&self) -> Vec<u64> {
        self.slots.read().iter().flatten().map(|(page, _)| *page).collect()
    }
}
