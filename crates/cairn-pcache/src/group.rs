//! Cache groups: the shared eviction list and aggregate page budget.
//!
//! A group is a set of caches that can recycle each other's unpinned pages
//! under memory pressure. All group state — the LRU list, the budgets, and
//! every member cache's hash table — mutates under the group's one mutex,
//! which linearizes concurrent fetch/unpin/truncate calls from different
//! connections.
//!
//! The eviction list is intrusive: records chain through their own
//! `lru_prev`/`lru_next` handles, head = most recently released, tail =
//! next victim. A record is on the list iff it is not pinned.

use parking_lot::{Mutex, MutexGuard};
use serde::Serialize;
use tracing::trace;

use cairn_types::{ExtraSize, PageKey, PageSize};

use crate::arena::{PageArena, PageHandle};
use crate::pool::{PagePool, PoolBuf};

/// Initial (and minimum) hash bucket count per cache.
const MIN_HASH_BUCKETS: usize = 256;

/// Pages reserved from the group budget by every purgeable cache.
pub(crate) const MIN_PAGES_PER_CACHE: u32 = 10;

/// Identifies a member cache within its group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct CacheId(u32);

impl CacheId {
    #[inline]
    pub(crate) fn index(self) -> u32 {
        self.0
    }

    #[cfg(test)]
    pub(crate) fn test_id(index: u32) -> Self {
        Self(index)
    }
}

// ---------------------------------------------------------------------------
// Per-cache state
// ---------------------------------------------------------------------------

/// State of one member cache. Lives inside the group mutex because the hash
/// table is touched by cross-cache recycling and group-wide eviction.
pub(crate) struct CacheState {
    pub page_size: PageSize,
    pub extra_size: ExtraSize,
    pub purgeable: bool,
    /// Pages reserved from the group budget (10 for purgeable, else 0).
    pub min_pages: u32,
    /// Configured capacity ("cache_size"). Zero until set.
    pub max_pages: u32,
    /// `max_pages * 9 / 10`: soft ceiling on pinned pages.
    pub n90pct: u32,
    /// Pages owned by this cache currently on the eviction list.
    pub recyclable: u32,
    /// Total pages owned by this cache (pinned + recyclable).
    pub page_count: u32,
    /// Largest key inserted since the last truncate.
    pub max_key: PageKey,
    /// Hash bucket heads; chains run through `PageRecord::hash_next`.
    pub buckets: Vec<Option<PageHandle>>,
}

impl CacheState {
    fn new(page_size: PageSize, extra_size: ExtraSize, purgeable: bool) -> Self {
        Self {
            page_size,
            extra_size,
            purgeable,
            min_pages: if purgeable { MIN_PAGES_PER_CACHE } else { 0 },
            max_pages: 0,
            n90pct: 0,
            recyclable: 0,
            page_count: 0,
            max_key: PageKey::ZERO,
            buckets: vec![None; MIN_HASH_BUCKETS],
        }
    }

    /// Bytes per page buffer: page data plus extra metadata.
    #[inline]
    pub(crate) fn frame_size(&self) -> usize {
        self.page_size.as_usize() + self.extra_size.as_usize()
    }

    /// Bucket index for `key`. Bucket counts are powers of two, so this is
    /// a mask.
    #[inline]
    fn bucket_index(&self, key: PageKey) -> usize {
        key.get() as usize & (self.buckets.len() - 1)
    }
}

fn n90pct(max_pages: u32) -> u32 {
    u32::try_from(u64::from(max_pages) * 9 / 10).unwrap_or(u32::MAX)
}

// ---------------------------------------------------------------------------
// GroupInner
// ---------------------------------------------------------------------------

/// Everything the group mutex protects.
pub(crate) struct GroupInner {
    pub arena: PageArena,
    caches: Vec<Option<CacheState>>,
    free_cache_slots: Vec<u32>,
    /// Sum of `max_pages` over purgeable member caches.
    pub max_pages: u32,
    /// Sum of `min_pages` over purgeable member caches.
    pub min_pages: u32,
    /// Group-wide ceiling on pinned pages: `max_pages + 10 - min_pages`.
    pub max_pinned: u32,
    /// Purgeable pages allocated group-wide.
    pub current_page_count: u32,
    pub lru_head: Option<PageHandle>,
    pub lru_tail: Option<PageHandle>,
}

impl GroupInner {
    fn new() -> Self {
        Self {
            arena: PageArena::new(),
            caches: Vec::new(),
            free_cache_slots: Vec::new(),
            max_pages: 0,
            min_pages: 0,
            max_pinned: MIN_PAGES_PER_CACHE,
            current_page_count: 0,
            lru_head: None,
            lru_tail: None,
        }
    }

    #[inline]
    pub(crate) fn cache(&self, id: CacheId) -> &CacheState {
        self.caches[id.0 as usize]
            .as_ref()
            .expect("cache id resolves to a live cache")
    }

    #[inline]
    pub(crate) fn cache_mut(&mut self, id: CacheId) -> &mut CacheState {
        self.caches[id.0 as usize]
            .as_mut()
            .expect("cache id resolves to a live cache")
    }

    // --- Membership ---

    /// Add a cache to the group. Purgeable caches reserve their minimum
    /// from the group budget, which tightens the pin ceiling.
    pub(crate) fn register_cache(
        &mut self,
        page_size: PageSize,
        extra_size: ExtraSize,
        purgeable: bool,
    ) -> CacheId {
        let state = CacheState::new(page_size, extra_size, purgeable);
        if purgeable {
            self.min_pages += state.min_pages;
            self.recompute_max_pinned();
        }
        if let Some(index) = self.free_cache_slots.pop() {
            self.caches[index as usize] = Some(state);
            CacheId(index)
        } else {
            let index = u32::try_from(self.caches.len()).expect("cache slot overflow");
            self.caches.push(Some(state));
            CacheId(index)
        }
    }

    /// Tear down a cache: drop all its pages, return its budget
    /// contribution, and re-run eviction — the remaining caches may now be
    /// over the reduced budget.
    pub(crate) fn unregister_cache(&mut self, id: CacheId) {
        self.truncate_cache(id, PageKey::ZERO);
        let (cache_min, cache_max) = {
            let cache = self.cache(id);
            (cache.min_pages, cache.max_pages)
        };
        debug_assert!(self.max_pages >= cache_max);
        debug_assert!(self.min_pages >= cache_min);
        self.max_pages -= cache_max;
        self.min_pages -= cache_min;
        self.recompute_max_pinned();
        self.enforce_max_page();
        self.caches[id.0 as usize] = None;
        self.free_cache_slots.push(id.0);
    }

    /// Retarget a purgeable cache's capacity and evict down to the new
    /// group budget.
    pub(crate) fn set_cache_capacity(&mut self, id: CacheId, max_pages: u32) {
        let old = self.cache(id).max_pages;
        debug_assert!(self.max_pages >= old);
        self.max_pages -= old;
        self.max_pages += max_pages;
        self.recompute_max_pinned();
        let cache = self.cache_mut(id);
        cache.max_pages = max_pages;
        cache.n90pct = n90pct(max_pages);
        self.enforce_max_page();
    }

    pub(crate) fn recompute_max_pinned(&mut self) {
        // Unsigned arithmetic: a group whose minimum reservations exceed its
        // configured capacity wraps to a ceiling that never binds.
        self.max_pinned = self
            .max_pages
            .wrapping_add(MIN_PAGES_PER_CACHE)
            .wrapping_sub(self.min_pages);
    }

    // --- Hash table ---

    pub(crate) fn hash_lookup(&self, id: CacheId, key: PageKey) -> Option<PageHandle> {
        let cache = self.cache(id);
        let mut cursor = cache.buckets[cache.bucket_index(key)];
        while let Some(handle) = cursor {
            let record = self.arena.get(handle);
            if record.key == key {
                return Some(handle);
            }
            cursor = record.hash_next;
        }
        None
    }

    /// Link a record into its owner's table under `record.key` and account
    /// for it.
    pub(crate) fn hash_insert(&mut self, id: CacheId, handle: PageHandle) {
        let key = self.arena.get(handle).key;
        let cache = self.cache_mut(id);
        let bucket = cache.bucket_index(key);
        let chain = cache.buckets[bucket];
        cache.buckets[bucket] = Some(handle);
        cache.page_count += 1;
        if key > cache.max_key {
            cache.max_key = key;
        }
        self.arena.get_mut(handle).hash_next = chain;
    }

    /// Unlink a record from its owner's table and account for it.
    pub(crate) fn hash_remove(&mut self, id: CacheId, handle: PageHandle) {
        let key = self.arena.get(handle).key;
        let next = self.arena.get(handle).hash_next;
        let bucket = self.cache(id).bucket_index(key);
        let head = self.cache(id).buckets[bucket].expect("record present in its bucket");
        if head == handle {
            self.cache_mut(id).buckets[bucket] = next;
        } else {
            let mut prev = head;
            loop {
                let link = self
                    .arena
                    .get(prev)
                    .hash_next
                    .expect("record present in its hash chain");
                if link == handle {
                    break;
                }
                prev = link;
            }
            self.arena.get_mut(prev).hash_next = next;
        }
        self.arena.get_mut(handle).hash_next = None;
        self.cache_mut(id).page_count -= 1;
    }

    /// Double the bucket array once the cache holds as many pages as it has
    /// buckets, keeping chains short.
    pub(crate) fn maybe_grow_hash(&mut self, id: CacheId) {
        let (page_count, bucket_count) = {
            let cache = self.cache(id);
            (cache.page_count as usize, cache.buckets.len())
        };
        if page_count < bucket_count {
            return;
        }
        let new_count = (bucket_count * 2).max(MIN_HASH_BUCKETS);
        let old = std::mem::replace(&mut self.cache_mut(id).buckets, vec![None; new_count]);
        for head in old {
            let mut cursor = head;
            while let Some(handle) = cursor {
                cursor = self.arena.get(handle).hash_next;
                let key = self.arena.get(handle).key;
                let cache = self.cache_mut(id);
                let bucket = cache.bucket_index(key);
                let chain = cache.buckets[bucket];
                cache.buckets[bucket] = Some(handle);
                self.arena.get_mut(handle).hash_next = chain;
            }
        }
    }

    /// Move a record to a new key within the same table. Pin state and LRU
    /// position are untouched.
    pub(crate) fn rekey_record(&mut self, id: CacheId, handle: PageHandle, new_key: PageKey) {
        debug_assert!(
            self.hash_lookup(id, new_key).is_none(),
            "rekey target {new_key} already occupied"
        );
        self.hash_remove(id, handle);
        self.arena.get_mut(handle).key = new_key;
        self.hash_insert(id, handle);
    }

    // --- Eviction list ---

    /// Take a record off the eviction list and mark it pinned.
    pub(crate) fn pin_record(&mut self, handle: PageHandle) {
        let (prev, next, owner) = {
            let record = self.arena.get(handle);
            debug_assert!(!record.pinned, "pin of an already pinned record");
            (record.lru_prev, record.lru_next, record.owner)
        };
        match prev {
            Some(p) => self.arena.get_mut(p).lru_next = next,
            None => self.lru_head = next,
        }
        match next {
            Some(n) => self.arena.get_mut(n).lru_prev = prev,
            None => self.lru_tail = prev,
        }
        let record = self.arena.get_mut(handle);
        record.lru_prev = None;
        record.lru_next = None;
        record.pinned = true;
        self.cache_mut(owner).recyclable -= 1;
    }

    /// Push a pinned record onto the head of the eviction list.
    pub(crate) fn push_lru_head(&mut self, handle: PageHandle) {
        let owner = {
            let record = self.arena.get_mut(handle);
            debug_assert!(record.pinned, "release of an unpinned record");
            debug_assert!(record.buf.is_some(), "released record must hold its buffer");
            record.pinned = false;
            record.lru_prev = None;
            record.lru_next = self.lru_head;
            record.owner
        };
        match self.lru_head {
            Some(head) => self.arena.get_mut(head).lru_prev = Some(handle),
            None => self.lru_tail = Some(handle),
        }
        self.lru_head = Some(handle);
        self.cache_mut(owner).recyclable += 1;
    }

    /// Drop a record (already pinned and hash-unlinked) and release its
    /// buffer, if present, back to the pool.
    pub(crate) fn free_record(&mut self, handle: PageHandle) {
        let record = self.arena.remove(handle);
        if self.cache(record.owner).purgeable {
            self.current_page_count -= 1;
        }
        drop(record);
    }

    /// Evict from the eviction-list tail until the group is back under its
    /// page budget or nothing evictable remains.
    pub(crate) fn enforce_max_page(&mut self) {
        while self.current_page_count > self.max_pages {
            let Some(victim) = self.lru_tail else { break };
            let (owner, key) = {
                let record = self.arena.get(victim);
                (record.owner, record.key)
            };
            trace!(key = %key, "evicting page past group budget");
            self.pin_record(victim);
            self.hash_remove(owner, victim);
            self.free_record(victim);
        }
    }

    /// Discard every record of `id` with `key >= limit`. Pinned records are
    /// implicitly unpinned: their arena slot dies now, and the outstanding
    /// guard releases the buffer when it drops.
    pub(crate) fn truncate_cache(&mut self, id: CacheId, limit: PageKey) {
        for bucket in 0..self.cache(id).buckets.len() {
            let mut prev: Option<PageHandle> = None;
            let mut cursor = self.cache(id).buckets[bucket];
            while let Some(handle) = cursor {
                let (key, pinned, next) = {
                    let record = self.arena.get(handle);
                    (record.key, record.pinned, record.hash_next)
                };
                if key >= limit {
                    match prev {
                        Some(p) => self.arena.get_mut(p).hash_next = next,
                        None => self.cache_mut(id).buckets[bucket] = next,
                    }
                    self.cache_mut(id).page_count -= 1;
                    if !pinned {
                        self.pin_record(handle);
                    }
                    self.free_record(handle);
                } else {
                    prev = cursor;
                }
                cursor = next;
            }
        }
    }

    // --- Test seams ---

    /// Keys on the eviction list, head (most recent) to tail (next victim).
    #[cfg(test)]
    pub(crate) fn lru_keys(&self) -> Vec<PageKey> {
        let mut keys = Vec::new();
        let mut cursor = self.lru_head;
        while let Some(handle) = cursor {
            let record = self.arena.get(handle);
            keys.push(record.key);
            cursor = record.lru_next;
        }
        keys
    }

    /// Check every structural invariant of the group. Used after each step
    /// of the property tests.
    #[cfg(test)]
    pub(crate) fn assert_invariants(&self) {
        use std::collections::HashSet;

        // Walk the eviction list, checking link symmetry.
        let mut on_lru: HashSet<PageHandle> = HashSet::new();
        let mut cursor = self.lru_head;
        let mut prev: Option<PageHandle> = None;
        while let Some(handle) = cursor {
            let record = self.arena.get(handle);
            assert!(!record.pinned, "pinned record on the eviction list");
            assert!(
                record.buf.is_some(),
                "eviction-list record missing its buffer"
            );
            assert_eq!(record.lru_prev, prev, "eviction list prev link broken");
            assert!(on_lru.insert(handle), "eviction list cycle");
            prev = cursor;
            cursor = record.lru_next;
        }
        assert_eq!(self.lru_tail, prev, "eviction list tail mismatch");

        // Every record: on the list iff unpinned; reachable from its
        // owner's hash table.
        let mut per_cache_pages: Vec<(CacheId, PageKey)> = Vec::new();
        for (handle, record) in self.arena.iter() {
            assert_eq!(
                on_lru.contains(&handle),
                !record.pinned,
                "record {} LRU membership disagrees with its pin state",
                record.key
            );
            assert_eq!(
                self.hash_lookup(record.owner, record.key),
                Some(handle),
                "record {} unreachable through its owner's hash table",
                record.key
            );
            per_cache_pages.push((record.owner, record.key));
        }

        // Per-cache counters and key uniqueness; group-wide accounting.
        let mut purgeable_total = 0u32;
        for (index, cache) in self.caches.iter().enumerate() {
            let Some(cache) = cache else { continue };
            let id = CacheId(u32::try_from(index).expect("cache slot overflow"));
            let owned: Vec<PageKey> = per_cache_pages
                .iter()
                .filter(|(owner, _)| *owner == id)
                .map(|(_, key)| *key)
                .collect();
            let distinct: HashSet<PageKey> = owned.iter().copied().collect();
            assert_eq!(distinct.len(), owned.len(), "duplicate key within a cache");
            assert_eq!(
                owned.len(),
                cache.page_count as usize,
                "cache page_count diverges from its hash table"
            );
            let recyclable_here = self
                .arena
                .iter()
                .filter(|(_, r)| r.owner == id && !r.pinned)
                .count();
            assert_eq!(
                recyclable_here, cache.recyclable as usize,
                "cache recyclable count diverges from the eviction list"
            );
            if cache.purgeable {
                purgeable_total += cache.page_count;
            }
        }
        assert_eq!(
            purgeable_total, self.current_page_count,
            "group page accounting diverges from purgeable cache totals"
        );
    }
}

// ---------------------------------------------------------------------------
// CacheGroup
// ---------------------------------------------------------------------------

/// A set of caches sharing one eviction list and one page budget, behind
/// one mutex.
pub(crate) struct CacheGroup {
    pool: PagePool,
    inner: Mutex<GroupInner>,
}

impl CacheGroup {
    pub(crate) fn new(pool: PagePool) -> Self {
        Self {
            pool,
            inner: Mutex::new(GroupInner::new()),
        }
    }

    #[inline]
    pub(crate) fn pool(&self) -> &PagePool {
        &self.pool
    }

    #[inline]
    pub(crate) fn lock(&self) -> MutexGuard<'_, GroupInner> {
        self.inner.lock()
    }

    /// Return a checked-out buffer. Invoked by the pin guard exactly once.
    ///
    /// If the record died while checked out (truncate or cache teardown),
    /// the buffer simply returns to the pool. A discard hint, or a group
    /// over its budget, frees the page instead of recycling it.
    pub(crate) fn unpin(&self, id: CacheId, handle: PageHandle, buf: PoolBuf, discard: bool) {
        let mut inner = self.inner.lock();
        if !inner.arena.contains(handle) {
            drop(inner);
            drop(buf);
            return;
        }
        debug_assert_eq!(inner.arena.get(handle).owner, id);
        debug_assert!(inner.arena.get(handle).pinned);

        if discard || inner.current_page_count > inner.max_pages {
            inner.hash_remove(id, handle);
            inner.free_record(handle);
            drop(inner);
            drop(buf);
        } else {
            inner.arena.get_mut(handle).buf = Some(buf);
            inner.push_lru_head(handle);
        }
    }

    /// Evict eviction-list pages until at least `want` buffer bytes have
    /// been released or nothing evictable remains. Returns the bytes freed.
    pub(crate) fn evict_bytes(&self, want: usize) -> usize {
        let mut inner = self.inner.lock();
        let mut freed = 0usize;
        while freed < want {
            let Some(victim) = inner.lru_tail else { break };
            let (owner, key) = {
                let record = inner.arena.get(victim);
                (record.owner, record.key)
            };
            freed += inner.cache(owner).frame_size();
            trace!(key = %key, "releasing page for memory reclamation");
            inner.pin_record(victim);
            inner.hash_remove(owner, victim);
            inner.free_record(victim);
        }
        freed
    }

    /// Snapshot the group counters.
    pub(crate) fn stats(&self) -> GroupStats {
        let inner = self.inner.lock();
        let mut recyclable = 0u32;
        let mut cache_count = 0usize;
        for cache in inner.caches.iter().flatten() {
            recyclable += cache.recyclable;
            cache_count += 1;
        }
        GroupStats {
            current_page_count: inner.current_page_count,
            max_pages: inner.max_pages,
            min_pages: inner.min_pages,
            max_pinned: inner.max_pinned,
            recyclable,
            cache_count,
        }
    }
}

/// Point-in-time counters for one cache group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct GroupStats {
    /// Purgeable pages allocated group-wide.
    pub current_page_count: u32,
    /// Aggregate capacity over purgeable member caches.
    pub max_pages: u32,
    /// Aggregate minimum reservation over purgeable member caches.
    pub min_pages: u32,
    /// Group-wide ceiling on pinned pages.
    pub max_pinned: u32,
    /// Pages on the shared eviction list.
    pub recyclable: u32,
    /// Live member caches.
    pub cache_count: usize,
}
