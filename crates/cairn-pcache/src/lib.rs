//! The default page cache for the cairn storage engine.
//!
//! Every open database file (including temp and in-memory databases) owns a
//! [`PageCache`]. Caches are clustered into *groups* that share one eviction
//! list and one aggregate page budget, so that an idle database's unpinned
//! pages can be recycled by a busy one. Page buffers come from a process-wide
//! [`PagePool`]: a fixed-size slab with O(1) alloc/free for the common case,
//! falling back to the general allocator for odd sizes or when the slab runs
//! dry.
//!
//! # Checkout model
//!
//! [`PageCache::fetch`] returns a move-only [`PinnedPage`] guard. While the
//! guard lives, the caller has exclusive access to the page buffer and the
//! page cannot be evicted. Consuming the guard (via
//! [`PinnedPage::release`], [`PinnedPage::discard`], or plain drop) is the
//! only way back to the recyclable state, so releasing a page twice does not
//! compile.
//!
//! # Locking
//!
//! Each group owns one mutex covering its eviction list, its budgets, and
//! every member cache's hash table. The pool has its own independent mutex;
//! the group mutex is always released before calling into the pool for a
//! fresh allocation, and the pool never calls back into group code.

mod arena;
mod group;
pub mod cache;
pub mod pool;
pub mod registry;

pub use cache::{PageCache, PinnedPage};
pub use group::GroupStats;
pub use pool::{PagePool, PoolBuf, PoolConfig, PoolStats};
pub use registry::{CacheRegistry, GroupMode, RegistryConfig};

pub use cairn_error::{CairnError, Result};
pub use cairn_types::{CreateMode, ExtraSize, PageKey, PageSize};
