//! Cache instances and the page checkout guard.
//!
//! A [`PageCache`] is the per-database-file view onto a cache group. Pages
//! come back from [`PageCache::fetch`] as [`PinnedPage`] guards: while a
//! guard lives the page buffer is checked out of the cache and cannot be
//! evicted. Consuming the guard — [`PinnedPage::release`],
//! [`PinnedPage::discard`], or dropping it — is the only way a page returns
//! to the recyclable state, so a page cannot be released twice.

use std::fmt;
use std::sync::Arc;

use tracing::debug;

use cairn_error::Result;
use cairn_types::{CreateMode, ExtraSize, PageKey, PageSize};

use crate::arena::{PageHandle, PageRecord};
use crate::group::{CacheGroup, CacheId, GroupStats};
use crate::pool::PoolBuf;

// ---------------------------------------------------------------------------
// PageCache
// ---------------------------------------------------------------------------

/// One logical page cache: a keyed set of fixed-size page buffers backed by
/// a shared cache group.
///
/// Dropping the cache destroys it: all pages are discarded, its capacity
/// contribution leaves the group budget, and the group evicts down to the
/// reduced budget.
pub struct PageCache {
    group: Arc<CacheGroup>,
    id: CacheId,
    page_size: PageSize,
    extra_size: ExtraSize,
    purgeable: bool,
}

impl PageCache {
    pub(crate) fn new(
        group: Arc<CacheGroup>,
        page_size: PageSize,
        extra_size: ExtraSize,
        purgeable: bool,
    ) -> Result<Self> {
        let id = group
            .lock()
            .register_cache(page_size, extra_size, purgeable);
        debug!(
            cache = id.index(),
            page_size = page_size.get(),
            extra_size = extra_size.get(),
            purgeable,
            "created page cache"
        );
        Ok(Self {
            group,
            id,
            page_size,
            extra_size,
            purgeable,
        })
    }

    /// The page data size this cache serves.
    #[inline]
    #[must_use]
    pub fn page_size(&self) -> PageSize {
        self.page_size
    }

    /// The per-page extra metadata size.
    #[inline]
    #[must_use]
    pub fn extra_size(&self) -> ExtraSize {
        self.extra_size
    }

    /// Whether this cache's pages may be evicted under pressure.
    #[inline]
    #[must_use]
    pub fn is_purgeable(&self) -> bool {
        self.purgeable
    }

    /// Bytes per page buffer: page data plus extra metadata.
    #[inline]
    fn frame_size(&self) -> usize {
        self.page_size.as_usize() + self.extra_size.as_usize()
    }

    /// Set this cache's capacity (the `cache_size` knob). No-op for
    /// non-purgeable caches. Shrinking below the current group usage evicts
    /// immediately.
    pub fn set_capacity(&self, max_pages: u32) {
        if !self.purgeable {
            return;
        }
        self.group.lock().set_cache_capacity(self.id, max_pages);
    }

    /// Look up `key`, optionally materializing the page.
    ///
    /// * [`CreateMode::Never`]: `Ok(None)` on a miss.
    /// * [`CreateMode::IfRoom`]: on a miss, create the page unless the
    ///   admission throttle declines (`Ok(None)`): too many pages pinned, or
    ///   memory pressure with less recyclable than pinned. Never declines
    ///   for non-purgeable caches.
    /// * [`CreateMode::Must`]: on a miss, always create, recycling the
    ///   eviction-list tail when this cache or the group is at capacity or
    ///   memory is tight.
    ///
    /// Returns [`CairnError::OutOfMemory`](cairn_error::CairnError) only
    /// when a fresh buffer allocation fails after recycling was exhausted.
    ///
    /// # Panics
    ///
    /// Fetching a page that is currently checked out is a caller contract
    /// violation (the layer above serializes access per page) and panics
    /// rather than aliasing the buffer.
    pub fn fetch(&self, key: PageKey, mode: CreateMode) -> Result<Option<PinnedPage>> {
        let mut inner = self.group.lock();

        // Step 1: search the hash table for an existing entry.
        if let Some(handle) = inner.hash_lookup(self.id, key) {
            if !inner.arena.get(handle).pinned {
                inner.pin_record(handle);
            }
            let buf = inner
                .arena
                .get_mut(handle)
                .buf
                .take()
                .unwrap_or_else(|| panic!("page {key} is already checked out"));
            drop(inner);
            return Ok(Some(self.guard(handle, key, buf)));
        }

        // Step 2: a miss without permission to create.
        if mode == CreateMode::Never {
            return Ok(None);
        }

        // Step 3: the admission throttle may decline speculative creation.
        // Non-purgeable caches have no capacity ceiling, so the throttle
        // never applies to them.
        if mode == CreateMode::IfRoom && self.purgeable {
            let cache = inner.cache(self.id);
            let pinned_count = cache.page_count - cache.recyclable;
            let starved = self.group.pool().under_memory_pressure(self.frame_size())
                && cache.recyclable < pinned_count;
            if pinned_count >= inner.max_pinned || pinned_count >= cache.n90pct || starved {
                return Ok(None);
            }
        }

        // Keep hash chains short before the insert.
        inner.maybe_grow_hash(self.id);

        // Step 4: prefer recycling the eviction-list tail over allocating,
        // when this cache or the group is at capacity or memory is tight.
        let mut buf: Option<PoolBuf> = None;
        if self.purgeable {
            if let Some(victim) = inner.lru_tail {
                let cache = inner.cache(self.id);
                let cache_full = cache.page_count + 1 >= cache.max_pages;
                let group_full = inner.current_page_count >= inner.max_pages;
                if cache_full
                    || group_full
                    || self.group.pool().under_memory_pressure(self.frame_size())
                {
                    let (owner, victim_frame, donor_purgeable) = {
                        let record = inner.arena.get(victim);
                        let donor = inner.cache(record.owner);
                        (record.owner, donor.frame_size(), donor.purgeable)
                    };
                    inner.pin_record(victim);
                    inner.hash_remove(owner, victim);
                    if victim_frame == self.frame_size() {
                        // Same buffer shape: reuse it, moving the allocation
                        // from the donor's accounting to this cache's.
                        let record = inner.arena.remove(victim);
                        buf = Some(record.buf.expect("recyclable record holds its buffer"));
                        if donor_purgeable && !self.purgeable {
                            inner.current_page_count -= 1;
                        } else if !donor_purgeable && self.purgeable {
                            inner.current_page_count += 1;
                        }
                    } else {
                        // Cross-cache recycling needs an identical buffer
                        // shape; free the victim outright instead.
                        inner.free_record(victim);
                    }
                }
            }
        }

        // Step 5: fall back to a fresh allocation. The group mutex is
        // released around the pool call; the pool has its own lock.
        let mut buf = match buf {
            Some(buf) => buf,
            None => {
                drop(inner);
                let fresh = self.group.pool().alloc(self.frame_size())?;
                inner = self.group.lock();
                debug_assert!(
                    inner.hash_lookup(self.id, key).is_none(),
                    "page {key} materialized twice; callers must serialize access per page"
                );
                if self.purgeable {
                    inner.current_page_count += 1;
                }
                fresh
            }
        };

        // Insert pinned, with a clean extra region. Recycled page data is
        // left as-is; the caller overwrites it.
        buf.as_mut_slice()[self.page_size.as_usize()..].fill(0);
        let handle = inner.arena.insert(PageRecord {
            key,
            owner: self.id,
            pinned: true,
            buf: None,
            hash_next: None,
            lru_prev: None,
            lru_next: None,
        });
        inner.hash_insert(self.id, handle);
        drop(inner);
        Ok(Some(self.guard(handle, key, buf)))
    }

    /// Release a checked-out page back to the cache.
    ///
    /// With `discard_hint` the page is dropped instead of joining the
    /// eviction list (the caller expects no reuse).
    pub fn unpin(&self, page: PinnedPage, discard_hint: bool) {
        debug_assert_eq!(page.cache, self.id, "page released through a foreign cache");
        if discard_hint {
            page.discard();
        } else {
            page.release();
        }
    }

    /// Move a checked-out page to a new key within this cache.
    ///
    /// Pin state and eviction-list position are untouched. The target key
    /// must not be occupied.
    pub fn rekey(&self, page: &mut PinnedPage, new_key: PageKey) {
        debug_assert_eq!(page.cache, self.id, "page rekeyed through a foreign cache");
        if page.key == new_key {
            return;
        }
        self.group
            .lock()
            .rekey_record(self.id, page.handle, new_key);
        page.key = new_key;
    }

    /// Discard every page with `key >= limit`.
    ///
    /// Pages currently checked out are implicitly unpinned: their cache
    /// entry dies now and the outstanding guard releases the buffer when it
    /// drops.
    pub fn truncate(&self, limit: PageKey) {
        let mut inner = self.group.lock();
        if limit <= inner.cache(self.id).max_key {
            inner.truncate_cache(self.id, limit);
            inner.cache_mut(self.id).max_key = limit.predecessor();
        }
    }

    /// Evict everything evictable in this cache's group, regardless of
    /// budget. No-op for non-purgeable caches.
    pub fn shrink(&self) {
        if !self.purgeable {
            return;
        }
        let mut inner = self.group.lock();
        let saved = inner.max_pages;
        inner.max_pages = 0;
        inner.enforce_max_page();
        inner.max_pages = saved;
    }

    /// Total pages currently held by this cache (pinned + recyclable).
    #[must_use]
    pub fn page_count(&self) -> u32 {
        self.group.lock().cache(self.id).page_count
    }

    /// Snapshot the counters of this cache's group.
    #[must_use]
    pub fn group_stats(&self) -> GroupStats {
        self.group.stats()
    }

    fn guard(&self, handle: PageHandle, key: PageKey, buf: PoolBuf) -> PinnedPage {
        PinnedPage {
            group: Arc::clone(&self.group),
            cache: self.id,
            handle,
            key,
            page_len: self.page_size.as_usize(),
            buf: Some(buf),
        }
    }

}

impl Drop for PageCache {
    fn drop(&mut self) {
        debug!(cache = self.id.index(), "destroying page cache");
        self.group.lock().unregister_cache(self.id);
    }
}

impl fmt::Debug for PageCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageCache")
            .field("page_size", &self.page_size)
            .field("extra_size", &self.extra_size)
            .field("purgeable", &self.purgeable)
            .field("pages", &self.page_count())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// PinnedPage
// ---------------------------------------------------------------------------

/// Exclusive checkout of one cached page.
///
/// The guard owns the page buffer for its lifetime; the cache keeps only
/// the record. Dropping the guard releases the page onto the eviction list
/// (equivalent to [`PinnedPage::release`]).
pub struct PinnedPage {
    group: Arc<CacheGroup>,
    pub(crate) cache: CacheId,
    pub(crate) handle: PageHandle,
    pub(crate) key: PageKey,
    page_len: usize,
    /// `Some` until the guard is consumed.
    buf: Option<PoolBuf>,
}

impl PinnedPage {
    /// The page's current key.
    #[inline]
    #[must_use]
    pub fn key(&self) -> PageKey {
        self.key
    }

    /// The page data region.
    #[inline]
    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.buf_ref().as_slice()[..self.page_len]
    }

    /// The page data region, mutably.
    #[inline]
    pub fn data_mut(&mut self) -> &mut [u8] {
        let page_len = self.page_len;
        &mut self.buf_mut().as_mut_slice()[..page_len]
    }

    /// The extra metadata region following the page data. Zeroed when the
    /// page was created.
    #[inline]
    #[must_use]
    pub fn extra(&self) -> &[u8] {
        &self.buf_ref().as_slice()[self.page_len..]
    }

    /// The extra metadata region, mutably.
    #[inline]
    pub fn extra_mut(&mut self) -> &mut [u8] {
        let page_len = self.page_len;
        &mut self.buf_mut().as_mut_slice()[page_len..]
    }

    /// Release the page onto the eviction list (it stays cached).
    pub fn release(mut self) {
        self.finish(false);
    }

    /// Drop the page from the cache (reuse is unlikely).
    pub fn discard(mut self) {
        self.finish(true);
    }

    fn finish(&mut self, discard: bool) {
        if let Some(buf) = self.buf.take() {
            self.group.unpin(self.cache, self.handle, buf, discard);
        }
    }

    #[inline]
    fn buf_ref(&self) -> &PoolBuf {
        self.buf
            .as_ref()
            .expect("pinned page buffer present until release")
    }

    #[inline]
    fn buf_mut(&mut self) -> &mut PoolBuf {
        self.buf
            .as_mut()
            .expect("pinned page buffer present until release")
    }
}

impl Drop for PinnedPage {
    fn drop(&mut self) {
        self.finish(false);
    }
}

impl fmt::Debug for PinnedPage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PinnedPage")
            .field("key", &self.key)
            .field("page_len", &self.page_len)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(clippy::too_many_lines)]
mod tests {
    use super::*;
    use crate::pool::{PagePool, PoolConfig};

    use proptest::collection::vec;
    use proptest::prelude::{ProptestConfig, any};
    use proptest::proptest;

    fn key(n: u32) -> PageKey {
        PageKey::new(n)
    }

    fn group_with_pool(pool: PagePool) -> Arc<CacheGroup> {
        Arc::new(CacheGroup::new(pool))
    }

    fn unbounded_group() -> Arc<CacheGroup> {
        group_with_pool(PagePool::unbounded())
    }

    /// A purgeable 512-byte cache with the given capacity.
    fn cache_with_capacity(group: &Arc<CacheGroup>, capacity: u32) -> PageCache {
        let cache = PageCache::new(
            Arc::clone(group),
            PageSize::new(512).unwrap(),
            ExtraSize::ZERO,
            true,
        )
        .unwrap();
        cache.set_capacity(capacity);
        cache
    }

    #[test]
    fn miss_without_create_returns_none() {
        let group = unbounded_group();
        let cache = cache_with_capacity(&group, 10);
        assert!(cache.fetch(key(1), CreateMode::Never).unwrap().is_none());
        assert_eq!(cache.page_count(), 0);
    }

    #[test]
    fn must_create_pins_a_zero_extra_page() {
        let group = unbounded_group();
        let cache = PageCache::new(
            Arc::clone(&group),
            PageSize::new(512).unwrap(),
            ExtraSize::new(16).unwrap(),
            true,
        )
        .unwrap();
        cache.set_capacity(10);

        let page = cache.fetch(key(3), CreateMode::Must).unwrap().unwrap();
        assert_eq!(page.key(), key(3));
        assert_eq!(page.data().len(), 512);
        assert_eq!(page.extra().len(), 16);
        assert!(page.extra().iter().all(|&b| b == 0), "extra must be zeroed");
        assert_eq!(cache.page_count(), 1);
        assert_eq!(cache.group_stats().current_page_count, 1);
        group.lock().assert_invariants();
        page.release();
        group.lock().assert_invariants();
    }

    #[test]
    fn roundtrip_preserves_buffer_contents() {
        let group = unbounded_group();
        let cache = cache_with_capacity(&group, 10);

        let mut page = cache.fetch(key(7), CreateMode::Must).unwrap().unwrap();
        page.data_mut().copy_from_slice(&[0xA7; 512]);
        page.release();

        let page = cache.fetch(key(7), CreateMode::Never).unwrap().unwrap();
        assert_eq!(page.data(), &[0xA7; 512][..], "contents survive unpin");
        page.release();
    }

    #[test]
    fn release_order_defines_eviction_order() {
        let group = unbounded_group();
        let cache = cache_with_capacity(&group, 10);

        let p1 = cache.fetch(key(1), CreateMode::Must).unwrap().unwrap();
        let p2 = cache.fetch(key(2), CreateMode::Must).unwrap().unwrap();
        let p3 = cache.fetch(key(3), CreateMode::Must).unwrap().unwrap();
        p2.release();
        p3.release();
        p1.release();

        // Head = most recently released, tail = next victim.
        assert_eq!(group.lock().lru_keys(), vec![key(1), key(3), key(2)]);
        group.lock().assert_invariants();
    }

    #[test]
    fn refetch_removes_page_from_eviction_list() {
        let group = unbounded_group();
        let cache = cache_with_capacity(&group, 10);

        cache.fetch(key(1), CreateMode::Must).unwrap().unwrap().release();
        cache.fetch(key(2), CreateMode::Must).unwrap().unwrap().release();
        assert_eq!(group.lock().lru_keys().len(), 2);

        let held = cache.fetch(key(1), CreateMode::Never).unwrap().unwrap();
        assert_eq!(group.lock().lru_keys(), vec![key(2)]);
        group.lock().assert_invariants();
        held.release();
    }

    #[test]
    fn discard_drops_the_page() {
        let group = unbounded_group();
        let cache = cache_with_capacity(&group, 10);

        let page = cache.fetch(key(4), CreateMode::Must).unwrap().unwrap();
        page.discard();
        assert!(cache.fetch(key(4), CreateMode::Never).unwrap().is_none());
        assert_eq!(cache.page_count(), 0);
        assert_eq!(cache.group_stats().current_page_count, 0);
        group.lock().assert_invariants();
    }

    #[test]
    fn dropping_the_guard_releases_the_page() {
        let group = unbounded_group();
        let cache = cache_with_capacity(&group, 10);

        {
            let _page = cache.fetch(key(5), CreateMode::Must).unwrap().unwrap();
        }
        // Still cached, now recyclable.
        assert_eq!(cache.page_count(), 1);
        assert_eq!(group.lock().lru_keys(), vec![key(5)]);
    }

    #[test]
    fn unpin_api_matches_guard_methods() {
        let group = unbounded_group();
        let cache = cache_with_capacity(&group, 10);

        let page = cache.fetch(key(6), CreateMode::Must).unwrap().unwrap();
        cache.unpin(page, false);
        assert_eq!(cache.page_count(), 1);

        let page = cache.fetch(key(6), CreateMode::Never).unwrap().unwrap();
        cache.unpin(page, true);
        assert_eq!(cache.page_count(), 0);
    }

    #[test]
    #[should_panic(expected = "already checked out")]
    fn double_checkout_panics() {
        let group = unbounded_group();
        let cache = cache_with_capacity(&group, 10);
        let _held = cache.fetch(key(1), CreateMode::Must).unwrap().unwrap();
        let _ = cache.fetch(key(1), CreateMode::Must);
    }

    #[test]
    fn rekey_moves_identity_and_content() {
        let group = unbounded_group();
        let cache = cache_with_capacity(&group, 10);

        let mut page = cache.fetch(key(2), CreateMode::Must).unwrap().unwrap();
        page.data_mut()[0] = 0x5C;
        cache.rekey(&mut page, key(9));
        assert_eq!(page.key(), key(9));
        page.release();

        assert!(cache.fetch(key(2), CreateMode::Never).unwrap().is_none());
        let page = cache.fetch(key(9), CreateMode::Never).unwrap().unwrap();
        assert_eq!(page.data()[0], 0x5C);
        group.lock().assert_invariants();
        page.release();
    }

    #[test]
    fn rekey_to_the_same_key_is_a_noop() {
        let group = unbounded_group();
        let cache = cache_with_capacity(&group, 10);
        let mut page = cache.fetch(key(2), CreateMode::Must).unwrap().unwrap();
        cache.rekey(&mut page, key(2));
        assert_eq!(page.key(), key(2));
        page.release();
        assert_eq!(cache.page_count(), 1);
    }

    #[test]
    fn rekey_raises_the_truncate_bound() {
        let group = unbounded_group();
        let cache = cache_with_capacity(&group, 10);

        let mut page = cache.fetch(key(2), CreateMode::Must).unwrap().unwrap();
        cache.rekey(&mut page, key(40));
        page.release();

        // Truncating at the new key's level must see it.
        cache.truncate(key(40));
        assert!(cache.fetch(key(40), CreateMode::Never).unwrap().is_none());
    }

    #[test]
    fn truncate_drops_keys_at_or_above_the_limit() {
        let group = unbounded_group();
        let cache = cache_with_capacity(&group, 10);

        for n in 1..=6 {
            cache.fetch(key(n), CreateMode::Must).unwrap().unwrap().release();
        }
        cache.truncate(key(3));

        for n in 1..=2 {
            assert!(
                cache.fetch(key(n), CreateMode::Never).unwrap().is_some(),
                "page {n} below the limit must survive"
            );
        }
        for n in 3..=6 {
            assert!(
                cache.fetch(key(n), CreateMode::Never).unwrap().is_none(),
                "page {n} at or above the limit must be gone"
            );
        }
        group.lock().assert_invariants();
    }

    #[test]
    fn truncate_of_a_checked_out_page_is_safe() {
        let pool = PagePool::new(PoolConfig {
            slab_slot_size: 512,
            slab_slot_count: 4,
            heap_limit: 0,
        })
        .unwrap();
        let group = group_with_pool(pool.clone());
        let cache = cache_with_capacity(&group, 10);

        let page = cache.fetch(key(8), CreateMode::Must).unwrap().unwrap();
        cache.truncate(PageKey::ZERO);
        assert_eq!(cache.page_count(), 0);
        assert_eq!(cache.group_stats().current_page_count, 0);
        group.lock().assert_invariants();

        // The guard still owns the buffer; releasing it returns the slot to
        // the pool rather than resurrecting the page.
        assert_eq!(pool.free_slots(), 3);
        page.release();
        assert_eq!(pool.free_slots(), 4);
        assert!(cache.fetch(key(8), CreateMode::Never).unwrap().is_none());
        group.lock().assert_invariants();
    }

    #[test]
    fn truncate_beyond_the_largest_key_is_a_noop() {
        let group = unbounded_group();
        let cache = cache_with_capacity(&group, 10);
        cache.fetch(key(3), CreateMode::Must).unwrap().unwrap().release();
        cache.truncate(key(100));
        assert_eq!(cache.page_count(), 1);
    }

    #[test]
    fn truncate_resets_the_key_bound_for_new_inserts() {
        let group = unbounded_group();
        let cache = cache_with_capacity(&group, 10);
        cache.fetch(key(50), CreateMode::Must).unwrap().unwrap().release();
        cache.truncate(PageKey::ZERO);

        // The cache is empty; re-inserting below the old bound works and a
        // fresh truncate sees the new key.
        cache.fetch(key(5), CreateMode::Must).unwrap().unwrap().release();
        cache.truncate(key(5));
        assert_eq!(cache.page_count(), 0);
    }

    #[test]
    fn capacity_eviction_recycles_the_oldest_release() {
        let group = unbounded_group();
        let cache = cache_with_capacity(&group, 2);

        let p1 = cache.fetch(key(1), CreateMode::Must).unwrap().unwrap();
        let p2 = cache.fetch(key(2), CreateMode::Must).unwrap().unwrap();
        p1.release();
        p2.release();

        let p3 = cache.fetch(key(3), CreateMode::Must).unwrap().unwrap();
        assert_eq!(
            cache.group_stats().current_page_count,
            2,
            "recycling must not grow the group"
        );
        assert!(
            cache.fetch(key(1), CreateMode::Never).unwrap().is_none(),
            "oldest released page is the recycling victim"
        );
        assert!(cache.fetch(key(2), CreateMode::Never).unwrap().is_some());
        group.lock().assert_invariants();
        p3.release();
    }

    #[test]
    fn admission_throttle_declines_near_the_pin_ceiling() {
        let group = unbounded_group();
        let cache = cache_with_capacity(&group, 10);

        // Pin 9 pages: the 90% ceiling (n90pct = 9) is reached.
        let held: Vec<PinnedPage> = (1..=9)
            .map(|n| cache.fetch(key(n), CreateMode::Must).unwrap().unwrap())
            .collect();

        assert!(
            cache.fetch(key(10), CreateMode::IfRoom).unwrap().is_none(),
            "speculative creation must be declined at the pin ceiling"
        );
        let page = cache.fetch(key(10), CreateMode::Must).unwrap().unwrap();
        page.release();
        drop(held);
    }

    #[test]
    fn admission_throttle_declines_under_memory_pressure() {
        // Four 512-byte slots, reserve 1: the slab is under pressure once
        // all slots are out.
        let pool = PagePool::new(PoolConfig {
            slab_slot_size: 512,
            slab_slot_count: 4,
            heap_limit: 0,
        })
        .unwrap();
        let group = group_with_pool(pool.clone());
        let cache = cache_with_capacity(&group, 100);

        let held: Vec<PinnedPage> = (1..=4)
            .map(|n| cache.fetch(key(n), CreateMode::Must).unwrap().unwrap())
            .collect();
        assert!(pool.under_memory_pressure(512));

        // Pressure and nothing recyclable: declined.
        assert!(cache.fetch(key(5), CreateMode::IfRoom).unwrap().is_none());

        // Must still succeeds by falling back to the heap.
        let page = cache.fetch(key(5), CreateMode::Must).unwrap().unwrap();
        page.release();
        drop(held);
        group.lock().assert_invariants();
    }

    #[test]
    fn non_purgeable_cache_ignores_the_throttle_and_the_budget() {
        let group = unbounded_group();
        // A purgeable sibling keeps the group budget tight.
        let sibling = cache_with_capacity(&group, 1);
        sibling.fetch(key(1), CreateMode::Must).unwrap().unwrap().release();

        let memdb = PageCache::new(
            Arc::clone(&group),
            PageSize::new(512).unwrap(),
            ExtraSize::ZERO,
            false,
        )
        .unwrap();

        let held: Vec<PinnedPage> = (1..=20)
            .map(|n| {
                memdb
                    .fetch(key(n), CreateMode::IfRoom)
                    .unwrap()
                    .expect("non-purgeable creation must never be declined")
            })
            .collect();
        assert_eq!(memdb.page_count(), 20);
        assert_eq!(
            memdb.group_stats().current_page_count,
            1,
            "non-purgeable pages stay outside the group accounting"
        );
        group.lock().assert_invariants();
        drop(held);
    }

    #[test]
    fn shrink_evicts_everything_evictable() {
        let group = unbounded_group();
        let cache = cache_with_capacity(&group, 10);

        let held = cache.fetch(key(1), CreateMode::Must).unwrap().unwrap();
        cache.fetch(key(2), CreateMode::Must).unwrap().unwrap().release();
        cache.fetch(key(3), CreateMode::Must).unwrap().unwrap().release();

        cache.shrink();
        assert_eq!(cache.page_count(), 1, "only the pinned page survives");
        assert_eq!(cache.group_stats().current_page_count, 1);
        assert_eq!(
            cache.group_stats().max_pages,
            10,
            "shrink must restore the budget"
        );
        group.lock().assert_invariants();
        held.release();
    }

    #[test]
    fn capacity_reduction_evicts_immediately() {
        let group = unbounded_group();
        let cache = cache_with_capacity(&group, 5);
        for n in 1..=5 {
            cache.fetch(key(n), CreateMode::Must).unwrap().unwrap().release();
        }

        cache.set_capacity(2);
        assert_eq!(cache.page_count(), 2);
        assert_eq!(cache.group_stats().current_page_count, 2);
        // Strict LRU: the two most recently released pages survive.
        assert!(cache.fetch(key(4), CreateMode::Never).unwrap().is_some());
        assert!(cache.fetch(key(5), CreateMode::Never).unwrap().is_some());
        group.lock().assert_invariants();
    }

    #[test]
    fn destroying_a_cache_shrinks_the_group_budget() {
        let group = unbounded_group();
        let big = cache_with_capacity(&group, 20);
        let a = cache_with_capacity(&group, 4);
        let b = cache_with_capacity(&group, 4);

        // Pin everything first so no fetch can recycle, then release: `a`
        // and `b` together hold 14 pages sanctioned by `big`'s quota.
        let held_a: Vec<PinnedPage> = (1..=7)
            .map(|n| a.fetch(key(n), CreateMode::Must).unwrap().unwrap())
            .collect();
        let held_b: Vec<PinnedPage> = (1..=7)
            .map(|n| b.fetch(key(n), CreateMode::Must).unwrap().unwrap())
            .collect();
        for page in held_a {
            page.release();
        }
        for page in held_b {
            page.release();
        }
        assert_eq!(a.group_stats().current_page_count, 14);

        drop(big);
        // Group budget fell from 28 to 8: eviction trims the oldest
        // releases (a's pages) first.
        let stats = a.group_stats();
        assert_eq!(stats.max_pages, 8);
        assert_eq!(stats.current_page_count, 8);
        assert_eq!(a.page_count(), 1);
        assert_eq!(b.page_count(), 7);
        group.lock().assert_invariants();
    }

    #[test]
    fn release_over_budget_frees_instead_of_recycling() {
        let group = unbounded_group();
        let cache = cache_with_capacity(&group, 2);

        let p1 = cache.fetch(key(1), CreateMode::Must).unwrap().unwrap();
        let p2 = cache.fetch(key(2), CreateMode::Must).unwrap().unwrap();
        let p3 = cache.fetch(key(3), CreateMode::Must).unwrap().unwrap();
        assert_eq!(cache.group_stats().current_page_count, 3);

        // The group is over budget: this release frees the page outright.
        p1.release();
        assert_eq!(cache.page_count(), 2);
        assert_eq!(cache.group_stats().current_page_count, 2);
        assert_eq!(cache.group_stats().recyclable, 0);
        group.lock().assert_invariants();
        p2.release();
        p3.release();
    }

    #[test]
    fn hash_table_growth_keeps_every_page_reachable() {
        let group = unbounded_group();
        let cache = cache_with_capacity(&group, 1000);

        // Cross the 256-bucket threshold to force at least one doubling.
        for n in 1..=600 {
            cache.fetch(key(n), CreateMode::Must).unwrap().unwrap().release();
        }
        assert_eq!(cache.page_count(), 600);
        for n in (1..=600).step_by(37) {
            assert!(
                cache.fetch(key(n), CreateMode::Never).unwrap().is_some(),
                "page {n} must survive the rehash"
            );
        }
        group.lock().assert_invariants();
    }

    #[test]
    fn out_of_memory_surfaces_and_leaves_state_consistent() {
        // Room for exactly one 512-byte frame on the heap.
        let pool = PagePool::new(PoolConfig {
            slab_slot_size: 0,
            slab_slot_count: 0,
            heap_limit: 600,
        })
        .unwrap();
        let group = group_with_pool(pool);
        let cache = cache_with_capacity(&group, 1);

        let held = cache.fetch(key(1), CreateMode::Must).unwrap().unwrap();
        let err = cache.fetch(key(2), CreateMode::Must).unwrap_err();
        assert!(matches!(err, cairn_error::CairnError::OutOfMemory), "{err}");
        assert_eq!(cache.page_count(), 1, "failed fetch must not half-insert");
        group.lock().assert_invariants();

        // Once page 1 is recyclable, the same fetch succeeds by reusing its
        // buffer instead of allocating.
        held.release();
        let page = cache.fetch(key(2), CreateMode::Must).unwrap().unwrap();
        page.release();
        assert!(cache.fetch(key(1), CreateMode::Never).unwrap().is_none());
        group.lock().assert_invariants();
    }

    // --- Randomized interleavings ---

    /// Drive two caches in one group with a random op sequence, checking
    /// the structural invariants after every step.
    fn run_random_ops(capacity_a: u32, capacity_b: u32, ops: &[(u8, u8)]) {
        let group = unbounded_group();
        let caches = [
            cache_with_capacity(&group, capacity_a),
            cache_with_capacity(&group, capacity_b),
        ];
        let mut held: Vec<(usize, PageKey, PinnedPage)> = Vec::new();

        for &(selector, raw) in ops {
            let which = usize::from(selector / 2) % 2;
            let cache = &caches[which];
            let k = key(u32::from(raw) % 16);
            match selector % 6 {
                0 | 1 => {
                    let mode = if selector % 2 == 0 {
                        CreateMode::Must
                    } else {
                        CreateMode::IfRoom
                    };
                    let already_held = held
                        .iter()
                        .any(|(owner, held_key, _)| *owner == which && *held_key == k);
                    if !already_held {
                        if let Some(page) = cache.fetch(k, mode).unwrap() {
                            held.push((which, k, page));
                        }
                    }
                }
                2 => {
                    if !held.is_empty() {
                        let (_, _, page) = held.remove(usize::from(raw) % held.len());
                        page.release();
                    }
                }
                3 => {
                    if !held.is_empty() {
                        let (_, _, page) = held.remove(usize::from(raw) % held.len());
                        page.discard();
                    }
                }
                4 => {
                    let limit = key(u32::from(raw) % 16);
                    cache.truncate(limit);
                    // Guards for truncated keys are stale but stay safe to
                    // release; stop tracking them so the keys can be
                    // refetched.
                    held.retain(|(owner, held_key, _)| *owner != which || *held_key < limit);
                }
                _ => {
                    cache.set_capacity(u32::from(raw) % 8);
                }
            }

            let inner = group.lock();
            inner.assert_invariants();
            // Capacity changes run eviction; afterwards the group is under
            // budget unless only pinned pages remain.
            if selector % 6 == 5 {
                assert!(
                    inner.current_page_count <= inner.max_pages || inner.lru_head.is_none(),
                    "group must not stay over budget while evictable pages remain"
                );
            }
            drop(inner);
        }

        drop(held);
        group.lock().assert_invariants();
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(256))]

        #[test]
        fn prop_invariants_hold_for_random_sequences(
            capacity_a in 0u32..8,
            capacity_b in 0u32..8,
            ops in vec(any::<(u8, u8)>(), 1..80),
        ) {
            run_random_ops(capacity_a, capacity_b, &ops);
        }
    }
}
