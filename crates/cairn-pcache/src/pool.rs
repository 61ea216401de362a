//! Page-buffer allocation: a fixed-size slab with heap fallback.
//!
//! The slab is carved into `slot_count` slots of `slot_size` bytes at
//! construction time. Requests that fit a slot pop the free list in O(1);
//! everything else (oversized requests, or a drained slab) falls back to the
//! general allocator with separate accounting. A reserve watermark on the
//! free list drives the `under_pressure` signal that the cache layer uses to
//! prefer recycling over fresh allocation.
//!
//! [`PoolBuf`] returns its storage to the originating pool on `Drop`, so a
//! buffer can be handed across module boundaries without leaking slots.

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::debug;

use cairn_error::{CairnError, Result};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Pool construction parameters.
///
/// With the default configuration there is no slab and no heap bound: every
/// request is served from the general allocator and
/// [`PagePool::under_memory_pressure`] never fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolConfig {
    /// Size of each slab slot in bytes. Rounded down to 8-byte alignment.
    /// Zero disables the slab.
    pub slab_slot_size: usize,
    /// Number of slab slots. Zero disables the slab.
    pub slab_slot_count: usize,
    /// Hard bound on bytes obtained from the general allocator. Zero means
    /// unbounded; a nonzero bound also arms the heap-side pressure signal at
    /// 90% occupancy.
    pub heap_limit: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            slab_slot_size: 0,
            slab_slot_count: 0,
            heap_limit: 0,
        }
    }
}

/// Free-list headroom to keep below `slot_count`.
///
/// Dipping under the reserve flips the pool into the under-pressure state
/// before the slab is fully drained.
const fn reserve_for(slot_count: usize) -> usize {
    if slot_count > 90 {
        10
    } else {
        slot_count / 10 + 1
    }
}

// ---------------------------------------------------------------------------
// PagePool
// ---------------------------------------------------------------------------

struct PoolShared {
    /// Slot size after 8-byte round-down; zero when the slab is disabled.
    slot_size: usize,
    slot_count: usize,
    reserve: usize,
    heap_limit: usize,
    state: Mutex<PoolState>,
}

struct PoolState {
    free_slots: Vec<Vec<u8>>,
    under_pressure: bool,
    heap_bytes: usize,
    heap_allocs: usize,
    heap_bytes_peak: usize,
}

impl PoolShared {
    fn release(&self, storage: Vec<u8>, len: usize, from_slab: bool) {
        let mut state = self.state.lock();
        if from_slab {
            debug_assert_eq!(storage.len(), self.slot_size);
            debug_assert!(state.free_slots.len() < self.slot_count);
            state.free_slots.push(storage);
            state.under_pressure = state.free_slots.len() < self.reserve;
        } else {
            state.heap_bytes = state.heap_bytes.saturating_sub(len);
            state.heap_allocs = state.heap_allocs.saturating_sub(1);
        }
    }
}

/// Process-wide page-buffer pool.
///
/// Thread-safe and cheaply cloneable (backed by `Arc`). The pool's mutex is
/// independent of any cache-group mutex: allocation must be callable while a
/// group mutex is *not* held, so the pool can never participate in a
/// lock-order cycle with eviction.
#[derive(Clone)]
pub struct PagePool {
    shared: Arc<PoolShared>,
}

impl PagePool {
    /// Build a pool from `config`, allocating the slab up front.
    ///
    /// A slab configured with a slot size that rounds down to zero is
    /// rejected.
    pub fn new(config: PoolConfig) -> Result<Self> {
        let mut slot_size = config.slab_slot_size & !7;
        let mut slot_count = config.slab_slot_count;
        if config.slab_slot_size > 0 && config.slab_slot_count > 0 && slot_size == 0 {
            return Err(CairnError::InvalidConfig {
                detail: format!(
                    "slab slot size {} rounds down to zero",
                    config.slab_slot_size
                ),
            });
        }
        if slot_size == 0 || slot_count == 0 {
            slot_size = 0;
            slot_count = 0;
        }

        let reserve = reserve_for(slot_count);
        let free_slots: Vec<Vec<u8>> = (0..slot_count).map(|_| vec![0u8; slot_size]).collect();
        if slot_count > 0 {
            debug!(slot_size, slot_count, reserve, "configured page-buffer slab");
        }
        Ok(Self {
            shared: Arc::new(PoolShared {
                slot_size,
                slot_count,
                reserve,
                heap_limit: config.heap_limit,
                state: Mutex::new(PoolState {
                    free_slots,
                    under_pressure: slot_count > 0 && slot_count < reserve,
                    heap_bytes: 0,
                    heap_allocs: 0,
                    heap_bytes_peak: 0,
                }),
            }),
        })
    }

    /// A pool with no slab and no heap bound.
    #[must_use]
    pub fn unbounded() -> Self {
        Self::new(PoolConfig::default()).expect("default pool config is valid")
    }

    /// Allocate a buffer of exactly `n` bytes.
    ///
    /// Served from the slab when `n` fits a slot and a slot is free;
    /// otherwise from the general allocator. Fails with
    /// [`CairnError::OutOfMemory`] only when the configured heap bound would
    /// be exceeded.
    pub fn alloc(&self, n: usize) -> Result<PoolBuf> {
        debug_assert!(n > 0, "zero-length page buffer requested");
        let shared = &self.shared;

        if n <= shared.slot_size {
            let mut state = shared.state.lock();
            if let Some(storage) = state.free_slots.pop() {
                state.under_pressure = state.free_slots.len() < shared.reserve;
                drop(state);
                return Ok(PoolBuf {
                    storage: Some(storage),
                    len: n,
                    from_slab: true,
                    pool: Arc::clone(shared),
                });
            }
        }

        // Slab exhausted or request too large: general allocator, accounted
        // separately.
        {
            let mut state = shared.state.lock();
            if shared.heap_limit != 0 && state.heap_bytes.saturating_add(n) > shared.heap_limit {
                return Err(CairnError::OutOfMemory);
            }
            state.heap_bytes += n;
            state.heap_allocs += 1;
            state.heap_bytes_peak = state.heap_bytes_peak.max(state.heap_bytes);
        }
        Ok(PoolBuf {
            storage: Some(vec![0u8; n]),
            len: n,
            from_slab: false,
            pool: Arc::clone(shared),
        })
    }

    /// Whether allocating `requested` bytes now would stress memory.
    ///
    /// When the slab is configured and could serve the request, this is the
    /// slab watermark; otherwise it defers to the heap-side indicator.
    #[must_use]
    pub fn under_memory_pressure(&self, requested: usize) -> bool {
        let shared = &self.shared;
        if shared.slot_count > 0 && requested <= shared.slot_size {
            shared.state.lock().under_pressure
        } else {
            self.heap_nearly_full()
        }
    }

    /// Whether a slab was configured for this pool.
    #[inline]
    #[must_use]
    pub fn has_slab(&self) -> bool {
        self.shared.slot_count > 0
    }

    /// Effective slab slot size in bytes (zero when the slab is disabled).
    #[inline]
    #[must_use]
    pub fn slot_size(&self) -> usize {
        self.shared.slot_size
    }

    /// Number of free slab slots.
    #[must_use]
    pub fn free_slots(&self) -> usize {
        self.shared.state.lock().free_slots.len()
    }

    /// Snapshot the pool counters.
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        let shared = &self.shared;
        let state = shared.state.lock();
        PoolStats {
            slot_size: shared.slot_size,
            slot_count: shared.slot_count,
            slab_free: state.free_slots.len(),
            slab_in_use: shared.slot_count - state.free_slots.len(),
            under_pressure: state.under_pressure,
            heap_in_use_bytes: state.heap_bytes,
            heap_in_use_allocs: state.heap_allocs,
            heap_peak_bytes: state.heap_bytes_peak,
        }
    }

    fn heap_nearly_full(&self) -> bool {
        let limit = self.shared.heap_limit;
        if limit == 0 {
            return false;
        }
        self.shared.state.lock().heap_bytes >= limit - limit / 10
    }
}

impl fmt::Debug for PagePool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let stats = self.stats();
        f.debug_struct("PagePool")
            .field("slot_size", &stats.slot_size)
            .field("slot_count", &stats.slot_count)
            .field("slab_free", &stats.slab_free)
            .field("heap_in_use_bytes", &stats.heap_in_use_bytes)
            .finish()
    }
}

/// Point-in-time pool counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    /// Effective slab slot size in bytes.
    pub slot_size: usize,
    /// Total slab slots.
    pub slot_count: usize,
    /// Free slab slots.
    pub slab_free: usize,
    /// Slab slots currently handed out.
    pub slab_in_use: usize,
    /// Whether the free list is below the reserve watermark.
    pub under_pressure: bool,
    /// Live bytes obtained from the general allocator.
    pub heap_in_use_bytes: usize,
    /// Live allocations obtained from the general allocator.
    pub heap_in_use_allocs: usize,
    /// High-water mark of `heap_in_use_bytes`.
    pub heap_peak_bytes: usize,
}

// ---------------------------------------------------------------------------
// PoolBuf
// ---------------------------------------------------------------------------

/// Owned page buffer handle.
///
/// `Send + 'static`. When dropped, the storage is returned to the
/// originating pool: slab slots rejoin the free list, heap allocations are
/// subtracted from the overflow accounting and freed normally.
pub struct PoolBuf {
    /// Backing storage. `None` only transiently during `Drop`.
    storage: Option<Vec<u8>>,
    /// Requested length; slab-backed storage may be longer.
    len: usize,
    from_slab: bool,
    pool: Arc<PoolShared>,
}

const _: () = {
    const fn assert_send_static<T: Send + 'static>() {}
    assert_send_static::<PoolBuf>();
};

impl PoolBuf {
    /// The requested buffer length in bytes.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns `true` if the buffer has zero length (never, in practice).
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The buffer contents.
    #[inline]
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        let storage = self.storage.as_ref().expect("PoolBuf storage consumed");
        &storage[..self.len]
    }

    /// The buffer contents, mutably.
    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        let storage = self.storage.as_mut().expect("PoolBuf storage consumed");
        &mut storage[..self.len]
    }

    /// Returns `true` if this buffer occupies a slab slot.
    #[inline]
    #[must_use]
    pub fn is_slab_backed(&self) -> bool {
        self.from_slab
    }

    /// Raw pointer to the buffer start (used by tests to verify reuse).
    #[inline]
    #[must_use]
    pub fn as_ptr(&self) -> *const u8 {
        self.as_slice().as_ptr()
    }
}

impl Deref for PoolBuf {
    type Target = [u8];

    #[inline]
    fn deref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl DerefMut for PoolBuf {
    #[inline]
    fn deref_mut(&mut self) -> &mut [u8] {
        self.as_mut_slice()
    }
}

impl Drop for PoolBuf {
    fn drop(&mut self) {
        if let Some(storage) = self.storage.take() {
            self.pool.release(storage, self.len, self.from_slab);
        }
    }
}

impl fmt::Debug for PoolBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolBuf")
            .field("len", &self.len)
            .field("slab_backed", &self.from_slab)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
