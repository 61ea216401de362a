//! Shared vocabulary types for the cairn storage engine.
//!
//! These are the types that cross crate boundaries: page identity, buffer
//! sizing, and the page-cache creation policy. Everything here is a small
//! validated newtype so that invalid values are unrepresentable past the
//! constructor.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A page's identity within one page cache.
///
/// Keys are plain unsigned integers, unique per cache but not across caches.
/// Unlike a page *number* in the database file, a cache key may be zero:
/// `truncate(PageKey::ZERO)` discards every page of a cache.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[repr(transparent)]
pub struct PageKey(u32);

impl PageKey {
    /// The smallest key. Truncating to this bound empties the cache.
    pub const ZERO: Self = Self(0);

    /// Wrap a raw key value.
    #[inline]
    #[must_use]
    pub const fn new(key: u32) -> Self {
        Self(key)
    }

    /// The raw key value.
    #[inline]
    #[must_use]
    pub const fn get(self) -> u32 {
        self.0
    }

    /// The key one below this one, saturating at zero.
    #[inline]
    #[must_use]
    pub const fn predecessor(self) -> Self {
        Self(self.0.saturating_sub(1))
    }
}

impl fmt::Display for PageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for PageKey {
    fn from(key: u32) -> Self {
        Self(key)
    }
}

/// Page buffer size in bytes.
///
/// Must be a power of two between 512 and 65536 (inclusive). The default is
/// 4096 bytes. Only serialization is derived; values re-enter the system
/// through [`PageSize::new`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct PageSize(u32);

impl PageSize {
    /// Minimum page size: 512 bytes.
    pub const MIN: Self = Self(512);

    /// Default page size: 4096 bytes.
    pub const DEFAULT: Self = Self(4096);

    /// Maximum page size: 65536 bytes.
    pub const MAX: Self = Self(65536);

    /// Create a new page size, validating that it is a power of two in
    /// the range \[512, 65536\].
    #[must_use]
    pub const fn new(size: u32) -> Option<Self> {
        if size < 512 || size > 65536 || !size.is_power_of_two() {
            None
        } else {
            Some(Self(size))
        }
    }

    /// The raw page size in bytes.
    #[inline]
    #[must_use]
    pub const fn get(self) -> u32 {
        self.0
    }

    /// The page size as a `usize`.
    #[inline]
    #[must_use]
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }
}

impl Default for PageSize {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl fmt::Display for PageSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Per-page extra metadata size in bytes.
///
/// Each cached page carries `extra` bytes of caller-owned metadata directly
/// after the page data. The bound keeps page + extra within a single
/// allocator slot for every supported page size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Default)]
pub struct ExtraSize(u32);

impl ExtraSize {
    /// No extra metadata.
    pub const ZERO: Self = Self(0);

    /// Largest permitted extra size, exclusive bound 300 bytes.
    pub const MAX: Self = Self(299);

    /// Create a new extra size. Returns `None` for sizes of 300 bytes or
    /// more.
    #[must_use]
    pub const fn new(size: u32) -> Option<Self> {
        if size < 300 { Some(Self(size)) } else { None }
    }

    /// The raw extra size in bytes.
    #[inline]
    #[must_use]
    pub const fn get(self) -> u32 {
        self.0
    }

    /// The extra size as a `usize`.
    #[inline]
    #[must_use]
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for ExtraSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How far `fetch` may go to materialize a page that is not in the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CreateMode {
    /// Lookup only. A miss returns nothing.
    Never,
    /// Create the page if that is cheap: the admission throttle may decline
    /// when the cache is near its pin budget or memory is tight. Callers
    /// retry with [`CreateMode::Must`] when they cannot proceed without the
    /// page.
    IfRoom,
    /// Create the page, recycling or allocating as needed. Fails only when
    /// no buffer can be obtained at all.
    Must,
}

impl CreateMode {
    /// Returns `true` if this mode permits materializing a missing page.
    #[inline]
    #[must_use]
    pub const fn may_create(self) -> bool {
        !matches!(self, Self::Never)
    }
}
