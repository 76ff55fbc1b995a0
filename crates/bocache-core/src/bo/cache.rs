//! Free-list store: per-bucket free lists plus one LRU list.
//!
//! Each cached BO sits on two doubly linked lists at once: its size bucket and
//! the device-wide LRU list. Links are handle indices into a node arena, so
//! removing a BO from both lists is O(1) given its handle.
//!
//! Insertion always appends to the LRU tail with the current time, which keeps
//! the LRU ordered by last release. The stale sweep relies on that ordering to
//! stop at the first entry that is still young.

use std::sync::Arc;

use super::Bo;
use super::bucket::{NR_BO_CACHE_BUCKETS, bucket_index};
use super::flags::BoFlags;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Links {
    prev: Option<u32>,
    next: Option<u32>,
}

#[derive(Debug, Clone, Copy, Default)]
struct ListHead {
    head: Option<u32>,
    tail: Option<u32>,
    len: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Chain {
    Bucket(usize),
    Lru,
}

#[derive(Default)]
struct CacheNode {
    bo: Option<Arc<Bo>>,
    /// Clock seconds at release.
    last_used: u64,
    bucket: Links,
    lru: Links,
}

/// Cache of unreferenced BOs, keyed by size bucket and ordered by release time.
pub struct BoCache {
    nodes: Vec<CacheNode>,
    buckets: [ListHead; NR_BO_CACHE_BUCKETS],
    lru: ListHead,
    /// Sum of the sizes of every cached BO.
    size: usize,
}

impl BoCache {
    #[must_use]
    pub fn new() -> Self {
        Self {
            nodes: Vec::new(),
            buckets: [ListHead::default(); NR_BO_CACHE_BUCKETS],
            lru: ListHead::default(),
            size: 0,
        }
    }

    /// Total bytes held by the cache.
    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lru.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lru.len == 0
    }

    #[must_use]
    pub fn bucket_len(&self, bucket: usize) -> usize {
        self.buckets.get(bucket).map_or(0, |b| b.len)
    }

    #[must_use]
    pub fn contains(&self, handle: u32) -> bool {
        self.nodes
            .get(handle as usize)
            .is_some_and(|node| node.bo.is_some())
    }

    /// Release time of a cached BO.
    #[must_use]
    pub fn last_used(&self, handle: u32) -> Option<u64> {
        let node = self.nodes.get(handle as usize)?;
        node.bo.as_ref().map(|_| node.last_used)
    }

    /// Cached handles from oldest to newest release.
    #[must_use]
    pub fn lru_handles(&self) -> Vec<u32> {
        let mut handles = Vec::with_capacity(self.lru.len);
        let mut cursor = self.lru.head;
        while let Some(idx) = cursor {
            handles.push(idx);
            cursor = self.nodes[idx as usize].lru.next;
        }
        handles
    }

    /// Add an unreferenced BO to its bucket and the LRU tail.
    ///
    /// Returns false if the BO is already cached.
    pub fn put(&mut self, bo: Arc<Bo>, now: u64) -> bool {
        let handle = bo.handle();
        let slot = handle as usize;
        if self.nodes.len() <= slot {
            self.nodes.resize_with(slot + 1, CacheNode::default);
        }
        if self.nodes[slot].bo.is_some() {
            return false;
        }

        let bucket = bucket_index(bo.size());
        self.size += bo.size();
        let node = &mut self.nodes[slot];
        node.bo = Some(bo);
        node.last_used = now;
        self.push_back(Chain::Bucket(bucket), handle);
        self.push_back(Chain::Lru, handle);
        true
    }

    /// Unlink a cached BO from both lists.
    pub fn remove(&mut self, handle: u32) -> Option<Arc<Bo>> {
        let bo = self.nodes.get_mut(handle as usize)?.bo.take()?;
        self.unlink(Chain::Bucket(bucket_index(bo.size())), handle);
        self.unlink(Chain::Lru, handle);
        self.size -= bo.size();
        Some(bo)
    }

    /// First-fit lookup in the bucket of `size`.
    ///
    /// An entry qualifies when it is at least `size` but no more than twice
    /// that, its flags match exactly and its alignment is at least `align`.
    /// The match is unlinked before it is returned.
    pub fn fetch(&mut self, size: usize, align: usize, flags: BoFlags) -> Option<Arc<Bo>> {
        let bucket = bucket_index(size);
        let mut cursor = self.buckets[bucket].head;

        while let Some(idx) = cursor {
            let node = &self.nodes[idx as usize];
            cursor = node.bucket.next;
            let Some(entry) = node.bo.as_ref() else {
                continue;
            };

            if entry.size() < size || entry.flags() != flags {
                continue;
            }
            // Do not hand out grossly oversized BOs.
            if entry.size() > size.saturating_mul(2) {
                continue;
            }
            if align > entry.align() {
                continue;
            }

            return self.remove(idx);
        }
        None
    }

    /// Remove every entry idle for more than `max_idle` seconds at `now`.
    ///
    /// Walks the LRU from the oldest entry and stops at the first young one.
    pub fn evict_stale(&mut self, now: u64, max_idle: u64) -> Vec<Arc<Bo>> {
        let mut evicted = Vec::new();
        while let Some(idx) = self.lru.head {
            let last_used = self.nodes[idx as usize].last_used;
            if now.saturating_sub(last_used) <= max_idle {
                break;
            }
            match self.remove(idx) {
                Some(bo) => evicted.push(bo),
                None => break,
            }
        }
        evicted
    }

    /// Remove every entry regardless of age, bucket by bucket.
    pub fn drain(&mut self) -> Vec<Arc<Bo>> {
        let mut drained = Vec::with_capacity(self.lru.len);
        for bucket in 0..NR_BO_CACHE_BUCKETS {
            while let Some(idx) = self.buckets[bucket].head {
                match self.remove(idx) {
                    Some(bo) => drained.push(bo),
                    None => break,
                }
            }
        }
        drained
    }

    fn list(&self, chain: Chain) -> &ListHead {
        match chain {
            Chain::Bucket(b) => &self.buckets[b],
            Chain::Lru => &self.lru,
        }
    }

    fn list_mut(&mut self, chain: Chain) -> &mut ListHead {
        match chain {
            Chain::Bucket(b) => &mut self.buckets[b],
            Chain::Lru => &mut self.lru,
        }
    }

    fn links(&self, idx: u32, chain: Chain) -> Links {
        let node = &self.nodes[idx as usize];
        match chain {
            Chain::Bucket(_) => node.bucket,
            Chain::Lru => node.lru,
        }
    }

    fn links_mut(&mut self, idx: u32, chain: Chain) -> &mut Links {
        let node = &mut self.nodes[idx as usize];
        match chain {
            Chain::Bucket(_) => &mut node.bucket,
            Chain::Lru => &mut node.lru,
        }
    }

    fn push_back(&mut self, chain: Chain, idx: u32) {
        let tail = self.list(chain).tail;
        *self.links_mut(idx, chain) = Links {
            prev: tail,
            next: None,
        };
        match tail {
            Some(t) => self.links_mut(t, chain).next = Some(idx),
            None => self.list_mut(chain).head = Some(idx),
        }
        let list = self.list_mut(chain);
        list.tail = Some(idx);
        list.len += 1;
    }

    fn unlink(&mut self, chain: Chain, idx: u32) {
        let Links { prev, next } = self.links(idx, chain);
        match prev {
            Some(p) => self.links_mut(p, chain).next = next,
            None => self.list_mut(chain).head = next,
        }
        match next {
            Some(n) => self.links_mut(n, chain).prev = prev,
            None => self.list_mut(chain).tail = prev,
        }
        *self.links_mut(idx, chain) = Links::default();
        self.list_mut(chain).len -= 1;
    }
}

impl Default for BoCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BackendBo;
    use std::borrow::Cow;

    fn bo_with(handle: u32, size: usize, align: usize, flags: BoFlags) -> Arc<Bo> {
        let bo = Bo::from_backend(
            BackendBo {
                handle,
                size,
                align,
                flags,
                va: 0x10_0000 * u64::from(handle),
            },
            Cow::Borrowed("Cache test"),
        );
        // Cached BOs carry no references.
        assert_eq!(bo.release(), Some(0));
        Arc::new(bo)
    }

    fn bo(handle: u32, size: usize) -> Arc<Bo> {
        bo_with(handle, size, 4096, BoFlags::NONE)
    }

    fn bucket_sum(cache: &BoCache) -> usize {
        (0..NR_BO_CACHE_BUCKETS).map(|b| cache.bucket_len(b)).sum()
    }

    #[test]
    fn put_then_fetch_same_request() {
        let mut cache = BoCache::new();
        assert!(cache.put(bo(1, 12288), 0));
        assert_eq!(cache.size(), 12288);
        assert_eq!(cache.bucket_len(1), 1);

        let hit = cache.fetch(12288, 4096, BoFlags::NONE).expect("cached BO");
        assert_eq!(hit.handle(), 1);
        assert_eq!(cache.size(), 0);
        assert!(cache.is_empty());
        assert!(!cache.contains(1));
    }

    #[test]
    fn fetch_accepts_up_to_twice_the_request() {
        let mut cache = BoCache::new();
        cache.put(bo(1, 12288), 0);
        // 12288 <= 2 * 9000 and both round into bucket 1.
        let hit = cache.fetch(9000, 4096, BoFlags::NONE);
        assert_eq!(hit.map(|b| b.size()), Some(12288));
    }

    #[test]
    fn fetch_rejects_grossly_oversized_entries() {
        let mut cache = BoCache::new();
        // Both in the top bucket; 16 MiB is more than twice 5 MiB.
        cache.put(bo(1, 16 << 20), 0);
        assert!(cache.fetch(5 << 20, 4096, BoFlags::NONE).is_none());
        assert!(cache.fetch(8 << 20, 4096, BoFlags::NONE).is_some());
    }

    #[test]
    fn fetch_rejects_too_small_entries() {
        let mut cache = BoCache::new();
        cache.put(bo(1, 8192), 0);
        assert!(cache.fetch(12288, 4096, BoFlags::NONE).is_none());
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn fetch_requires_exact_flags_and_sufficient_alignment() {
        let mut cache = BoCache::new();
        cache.put(bo_with(1, 8192, 4096, BoFlags::WRITEBACK), 0);
        assert!(cache.fetch(8192, 4096, BoFlags::NONE).is_none());
        assert!(cache.fetch(8192, 4096, BoFlags::WRITEBACK | BoFlags::EXEC).is_none());
        assert!(cache.fetch(8192, 16384, BoFlags::WRITEBACK).is_none());
        assert!(cache.fetch(8192, 4096, BoFlags::WRITEBACK).is_some());
    }

    #[test]
    fn fetch_is_first_fit_in_insertion_order() {
        let mut cache = BoCache::new();
        cache.put(bo(1, 16384 - 4096), 0);
        cache.put(bo(2, 8192), 0);
        // Both qualify for 8192; the older entry wins even though it is larger.
        let hit = cache.fetch(8192, 4096, BoFlags::NONE).expect("hit");
        assert_eq!(hit.handle(), 1);
        let hit = cache.fetch(8192, 4096, BoFlags::NONE).expect("hit");
        assert_eq!(hit.handle(), 2);
    }

    #[test]
    fn remove_from_middle_keeps_lists_consistent() {
        let mut cache = BoCache::new();
        for handle in 1..=4 {
            cache.put(bo(handle, 8192), u64::from(handle));
        }
        assert!(cache.remove(2).is_some());
        assert!(cache.remove(2).is_none());
        assert_eq!(cache.lru_handles(), vec![1, 3, 4]);
        assert_eq!(cache.bucket_len(1), 3);

        assert!(cache.remove(4).is_some());
        assert!(cache.remove(1).is_some());
        assert_eq!(cache.lru_handles(), vec![3]);
        assert!(cache.put(bo(5, 8192), 9));
        assert_eq!(cache.lru_handles(), vec![3, 5]);
        assert_eq!(cache.size(), 2 * 8192);
    }

    #[test]
    fn double_put_is_refused() {
        let mut cache = BoCache::new();
        let entry = bo(1, 4096);
        assert!(cache.put(Arc::clone(&entry), 0));
        assert!(!cache.put(entry, 1));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.size(), 4096);
        assert_eq!(cache.last_used(1), Some(0));
    }

    #[test]
    fn evict_stale_stops_at_first_young_entry() {
        let mut cache = BoCache::new();
        cache.put(bo(1, 4096), 10);
        cache.put(bo(2, 8192), 11);
        cache.put(bo(3, 4096), 12);
        cache.put(bo(4, 4096), 13);

        // At 14: ages 4, 3, 2, 1. Only ages > 2 go.
        let evicted: Vec<_> = cache
            .evict_stale(14, 2)
            .iter()
            .map(|b| b.handle())
            .collect();
        assert_eq!(evicted, vec![1, 2]);
        assert_eq!(cache.lru_handles(), vec![3, 4]);
        assert_eq!(cache.size(), 8192);
    }

    #[test]
    fn evict_stale_keeps_entry_at_exact_threshold() {
        let mut cache = BoCache::new();
        cache.put(bo(1, 4096), 5);
        assert!(cache.evict_stale(7, 2).is_empty());
        assert_eq!(cache.evict_stale(8, 2).len(), 1);
    }

    #[test]
    fn drain_empties_every_bucket() {
        let mut cache = BoCache::new();
        cache.put(bo(1, 4096), 0);
        cache.put(bo(2, 1 << 20), 100);
        cache.put(bo(3, 64 << 20), 200);
        let drained = cache.drain();
        assert_eq!(drained.len(), 3);
        assert!(cache.is_empty());
        assert_eq!(cache.size(), 0);
        assert_eq!(bucket_sum(&cache), 0);
        assert!(cache.lru_handles().is_empty());
    }

    #[test]
    fn size_tracks_sum_under_deterministic_churn() {
        let mut state = 0x9E37_79B9_7F4A_7C15u64;
        let mut next = move || {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            state
        };

        let mut cache = BoCache::new();
        let mut now = 0u64;
        for step in 0..2_000u32 {
            let roll = next();
            let handle = (roll % 64) as u32;
            match roll % 4 {
                0 | 1 => {
                    let size = 4096 * (1 + (roll >> 8) as usize % 256);
                    let _ = cache.put(bo(handle, size), now);
                }
                2 => {
                    let size = 4096 * (1 + (roll >> 8) as usize % 256);
                    let _ = cache.fetch(size, 4096, BoFlags::NONE);
                }
                _ => {
                    now += 1;
                    let _ = cache.evict_stale(now, 2);
                }
            }

            let lru = cache.lru_handles();
            assert_eq!(lru.len(), cache.len(), "step {step}");
            assert_eq!(bucket_sum(&cache), cache.len(), "step {step}");
            let total: usize = lru
                .iter()
                .map(|&h| cache.nodes[h as usize].bo.as_ref().map_or(0, |b| b.size()))
                .sum();
            assert_eq!(total, cache.size(), "step {step}");
            let times: Vec<_> = lru.iter().filter_map(|&h| cache.last_used(h)).collect();
            assert!(times.windows(2).all(|w| w[0] <= w[1]), "LRU out of order");
        }
    }
}
