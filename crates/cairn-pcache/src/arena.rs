//! Generation-tagged arena of cached page records.
//!
//! Hash chains and the shared eviction list link records by [`PageHandle`]
//! (a slot index plus a generation) instead of pointers, which keeps
//! O(1) link/unlink without aliasing hazards. The generation lets a
//! checkout guard detect that its record was freed underneath it (a
//! truncate or cache teardown while the page was pinned) and release the
//! buffer gracefully.

use cairn_types::PageKey;

use crate::group::CacheId;
use crate::pool::PoolBuf;

/// Stable reference to an arena slot.
///
/// A handle is live while the slot holds the same generation; freeing the
/// slot bumps the generation, so stale handles never resolve to a reused
/// record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct PageHandle {
    index: u32,
    generation: u32,
}

/// Descriptor for one cached page.
pub(crate) struct PageRecord {
    /// Page number within the owning cache.
    pub key: PageKey,
    /// Cache whose hash table holds this record.
    pub owner: CacheId,
    /// Checked out to a caller; not on the eviction list.
    pub pinned: bool,
    /// Page + extra buffer. `Some` iff the record is not checked out.
    pub buf: Option<PoolBuf>,
    /// Next record in the owner's hash bucket chain.
    pub hash_next: Option<PageHandle>,
    /// Neighbors on the group eviction list (unpinned records only).
    pub lru_prev: Option<PageHandle>,
    pub lru_next: Option<PageHandle>,
}

struct Slot {
    generation: u32,
    record: Option<PageRecord>,
}

/// Slot arena with free-index recycling.
pub(crate) struct PageArena {
    slots: Vec<Slot>,
    free_indices: Vec<u32>,
    live: usize,
}

impl PageArena {
    pub(crate) fn new() -> Self {
        Self {
            slots: Vec::new(),
            free_indices: Vec::new(),
            live: 0,
        }
    }

    /// Number of live records.
    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.live
    }

    /// Store a record, returning its handle.
    pub(crate) fn insert(&mut self, record: PageRecord) -> PageHandle {
        self.live += 1;
        if let Some(index) = self.free_indices.pop() {
            let slot = &mut self.slots[index as usize];
            debug_assert!(slot.record.is_none());
            slot.record = Some(record);
            PageHandle {
                index,
                generation: slot.generation,
            }
        } else {
            let index = u32::try_from(self.slots.len()).expect("page arena overflow");
            self.slots.push(Slot {
                generation: 0,
                record: Some(record),
            });
            PageHandle {
                index,
                generation: 0,
            }
        }
    }

    /// Remove a record, invalidating every copy of its handle.
    pub(crate) fn remove(&mut self, handle: PageHandle) -> PageRecord {
        let slot = &mut self.slots[handle.index as usize];
        assert_eq!(slot.generation, handle.generation, "stale page handle");
        let record = slot.record.take().expect("vacant page slot");
        slot.generation = slot.generation.wrapping_add(1);
        self.free_indices.push(handle.index);
        self.live -= 1;
        record
    }

    /// Returns `true` if the handle still refers to a live record.
    #[inline]
    pub(crate) fn contains(&self, handle: PageHandle) -> bool {
        self.slots
            .get(handle.index as usize)
            .is_some_and(|slot| slot.generation == handle.generation && slot.record.is_some())
    }

    #[inline]
    pub(crate) fn get(&self, handle: PageHandle) -> &PageRecord {
        let slot = &self.slots[handle.index as usize];
        debug_assert_eq!(slot.generation, handle.generation, "stale page handle");
        slot.record.as_ref().expect("vacant page slot")
    }

    #[inline]
    pub(crate) fn get_mut(&mut self, handle: PageHandle) -> &mut PageRecord {
        let slot = &mut self.slots[handle.index as usize];
        debug_assert_eq!(slot.generation, handle.generation, "stale page handle");
        slot.record.as_mut().expect("vacant page slot")
    }

    /// Iterate over every live record (diagnostics and invariant checks).
    #[cfg(test)]
    pub(crate) fn iter(&self) -> impl Iterator<Item = (PageHandle, &PageRecord)> {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            slot.record.as_ref().map(|record| {
                (
                    PageHandle {
                        index: u32::try_from(index).expect("page arena overflow"),
                        generation: slot.generation,
                    },
                    record,
                )
            })
        })
    }
}
