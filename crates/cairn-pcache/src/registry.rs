//! The cache registry: process-wide context for page caching.
//!
//! The registry owns the page-buffer pool and the default shared cache
//! group, and decides how new caches map onto groups. It is an explicitly
//! constructed, explicitly dropped object — embedders create one per engine
//! instance (or per test fixture) instead of sharing hidden global state.

use std::fmt;
use std::sync::Arc;

use tracing::debug;

use cairn_error::Result;
use cairn_types::{ExtraSize, PageSize};

use crate::cache::PageCache;
use crate::group::{CacheGroup, GroupStats};
use crate::pool::{PagePool, PoolConfig, PoolStats};

/// How caches map onto cache groups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GroupMode {
    /// Every cache joins one shared group: pages recycle across caches
    /// under one budget, serialized by one mutex.
    #[default]
    Shared,
    /// Every cache gets a private group: no shared lock, at the cost of
    /// unshared recycling and higher aggregate memory use.
    Isolated,
}

/// Registry construction parameters.
#[derive(Debug, Clone, Copy, Default)]
pub struct RegistryConfig {
    /// Page-buffer pool parameters (slab shape, heap bound).
    pub pool: PoolConfig,
    /// Group policy for caches created through this registry.
    pub group_mode: GroupMode,
}

/// Process-wide page-cache context.
///
/// Cheap to share behind an `Arc` if multiple subsystems open caches.
/// Dropping the registry tears down the pool and the shared group once the
/// last cache and the last checked-out page are gone.
pub struct CacheRegistry {
    pool: PagePool,
    shared_group: Arc<CacheGroup>,
    mode: GroupMode,
}

impl CacheRegistry {
    /// Initialize a registry, allocating the configured slab up front.
    pub fn new(config: RegistryConfig) -> Result<Self> {
        let pool = PagePool::new(config.pool)?;
        let shared_group = Arc::new(CacheGroup::new(pool.clone()));
        debug!(mode = ?config.group_mode, "cache registry initialized");
        Ok(Self {
            pool,
            shared_group,
            mode: config.group_mode,
        })
    }

    /// A registry with no slab, no heap bound, and shared grouping.
    #[must_use]
    pub fn with_defaults() -> Self {
        Self::new(RegistryConfig::default()).expect("default registry config is valid")
    }

    /// Open a new page cache.
    ///
    /// Purgeable caches participate in their group's budget and eviction;
    /// non-purgeable caches (in-memory databases) never lose pages
    /// involuntarily. Callers normally follow up with
    /// [`PageCache::set_capacity`] to grant the cache a real budget.
    pub fn create_cache(
        &self,
        page_size: PageSize,
        extra_size: ExtraSize,
        purgeable: bool,
    ) -> Result<PageCache> {
        let group = match self.mode {
            GroupMode::Shared => Arc::clone(&self.shared_group),
            GroupMode::Isolated => Arc::new(CacheGroup::new(self.pool.clone())),
        };
        PageCache::new(group, page_size, extra_size, purgeable)
    }

    /// Free cached memory: evict from the shared group's eviction list
    /// until at least `bytes` of page buffers have been released or nothing
    /// evictable remains. Returns the bytes actually freed.
    ///
    /// Slab slots are never returned to the heap, so this is a no-op when a
    /// slab is configured; it only reclaims general-allocator memory.
    pub fn release_memory(&self, bytes: usize) -> usize {
        if self.pool.has_slab() {
            return 0;
        }
        let freed = self.shared_group.evict_bytes(bytes);
        if freed > 0 {
            debug!(freed, "released cache memory");
        }
        freed
    }

    /// Snapshot the shared group's counters. Isolated-mode caches report
    /// through [`PageCache::group_stats`] instead.
    #[must_use]
    pub fn group_stats(&self) -> GroupStats {
        self.shared_group.stats()
    }

    /// Snapshot the pool counters.
    #[must_use]
    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }
}

impl fmt::Debug for CacheRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheRegistry")
            .field("mode", &self.mode)
            .field("pool", &self.pool)
            .field("shared_group", &self.shared_group.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cairn_types::{CreateMode, PageKey};

    fn page_size() -> PageSize {
        PageSize::new(512).unwrap()
    }

    #[test]
    fn shared_mode_caches_share_one_group() {
        let registry = CacheRegistry::with_defaults();
        let a = registry
            .create_cache(page_size(), ExtraSize::ZERO, true)
            .unwrap();
        let b = registry
            .create_cache(page_size(), ExtraSize::ZERO, true)
            .unwrap();
        a.set_capacity(3);
        b.set_capacity(3);

        a.fetch(PageKey::new(1), CreateMode::Must)
            .unwrap()
            .unwrap()
            .release();
        let stats = registry.group_stats();
        assert_eq!(stats.cache_count, 2);
        assert_eq!(stats.max_pages, 6);
        assert_eq!(stats.current_page_count, 1);
    }

    #[test]
    fn isolated_mode_gives_every_cache_its_own_group() {
        let registry = CacheRegistry::new(RegistryConfig {
            pool: PoolConfig::default(),
            group_mode: GroupMode::Isolated,
        })
        .unwrap();
        let a = registry
            .create_cache(page_size(), ExtraSize::ZERO, true)
            .unwrap();
        let b = registry
            .create_cache(page_size(), ExtraSize::ZERO, true)
            .unwrap();
        a.set_capacity(1);
        b.set_capacity(1);

        a.fetch(PageKey::new(1), CreateMode::Must)
            .unwrap()
            .unwrap()
            .release();
        // Filling `b` cannot evict `a`'s page: the groups are disjoint.
        b.fetch(PageKey::new(1), CreateMode::Must)
            .unwrap()
            .unwrap()
            .release();
        b.fetch(PageKey::new(2), CreateMode::Must)
            .unwrap()
            .unwrap()
            .release();

        assert!(
            a.fetch(PageKey::new(1), CreateMode::Never).unwrap().is_some(),
            "isolated groups must not recycle each other's pages"
        );
        assert_eq!(a.group_stats().cache_count, 1);
        assert_eq!(
            registry.group_stats().cache_count,
            0,
            "isolated caches never join the shared group"
        );
    }

    #[test]
    fn release_memory_reclaims_unpinned_heap_pages() {
        let registry = CacheRegistry::with_defaults();
        let cache = registry
            .create_cache(page_size(), ExtraSize::ZERO, true)
            .unwrap();
        cache.set_capacity(8);
        for n in 1..=3 {
            cache
                .fetch(PageKey::new(n), CreateMode::Must)
                .unwrap()
                .unwrap()
                .release();
        }
        assert_eq!(registry.pool_stats().heap_in_use_bytes, 3 * 512);

        let freed = registry.release_memory(1024);
        assert_eq!(freed, 1024, "two 512-byte frames satisfy the request");
        assert_eq!(cache.page_count(), 1);
        assert_eq!(registry.pool_stats().heap_in_use_bytes, 512);
    }

    #[test]
    fn release_memory_is_a_noop_with_a_slab() {
        let registry = CacheRegistry::new(RegistryConfig {
            pool: PoolConfig {
                slab_slot_size: 512,
                slab_slot_count: 8,
                heap_limit: 0,
            },
            group_mode: GroupMode::Shared,
        })
        .unwrap();
        let cache = registry
            .create_cache(page_size(), ExtraSize::ZERO, true)
            .unwrap();
        cache.set_capacity(8);
        cache
            .fetch(PageKey::new(1), CreateMode::Must)
            .unwrap()
            .unwrap()
            .release();

        assert_eq!(registry.release_memory(usize::MAX), 0);
        assert_eq!(cache.page_count(), 1, "slab-backed pages stay put");
    }

    #[test]
    fn registry_debug_includes_counters() {
        let registry = CacheRegistry::with_defaults();
        let debug = format!("{registry:?}");
        assert!(debug.contains("CacheRegistry"));
        assert!(debug.contains("Shared"));
    }
}
