//! Open-time configuration for a database instance.
//!
//! Every knob a database is parameterised by lives here: branching factors,
//! page-cache size, compression, removal semantics, persistence, and the
//! allocator/eviction strategies bound to the pager. All options are fixed
//! for the lifetime of a database; changing one requires a dump and reload.
//!
//! # See Also
//! - [`Btree`](crate::storage::btree::Btree): consumes a [`TreeOptions`] at open time.
//! - [`Pager`](crate::storage::pager::Pager): consumes the derived [`PagerOptions`].

/// Default page-cache capacity: 1 MiB.
pub const DEFAULT_CACHE_BYTES: usize = 1 << 20;

/// Action taken when a database is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Start from an empty tree, ignoring any state on disk.
    Bare,
    /// Restore the tree from its header and pager sidecars.
    Load,
}

/// Page allocation strategy bound to the pager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AllocatorKind {
    /// Monotonic bump allocator; `free` is unsupported.
    Stack,
    /// Reclaiming allocator backed by a sorted freelist.
    #[default]
    FreeList,
}

/// Cache eviction strategy bound to the page cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EvictionKind {
    /// Least-recently-used; lookups promote.
    #[default]
    Lru,
    /// Insertion-ordered; lookups do not promote.
    Fifo,
}

/// Parameters a tree is opened with.
///
/// A fanout of `0` means "derive the largest value for which a fully
/// populated node still encodes into one page".
#[derive(Debug, Clone)]
pub struct TreeOptions {
    /// Leaf fanout `m`: leaves hold at most `m - 1` entries. `0` derives it.
    pub leaf_fanout: usize,
    /// Branch fanout `m`: branches hold at most `m` children. `0` derives it.
    pub branch_fanout: usize,
    /// Page-cache capacity in bytes; converted to a page count internally.
    pub cache_bytes: usize,
    /// Huffman-compress stored values.
    pub apply_compression: bool,
    /// Tolerate under-filled nodes after removals instead of rebalancing.
    pub relaxed_removes: bool,
    /// Whether `save` writes the header and pager sidecars at all.
    pub persistent: bool,
    pub allocator: AllocatorKind,
    pub eviction: EvictionKind,
    /// Soft limit on the number of pages the freelist allocator may hand out.
    pub page_limit: Option<u64>,
}

impl Default for TreeOptions {
    fn default() -> Self {
        Self {
            leaf_fanout: 0,
            branch_fanout: 0,
            cache_bytes: DEFAULT_CACHE_BYTES,
            apply_compression: false,
            relaxed_removes: false,
            persistent: true,
            allocator: AllocatorKind::default(),
            eviction: EvictionKind::default(),
            page_limit: None,
        }
    }
}

impl TreeOptions {
    pub(crate) fn pager_options(&self) -> PagerOptions {
        PagerOptions {
            cache_bytes: self.cache_bytes,
            allocator: self.allocator,
            eviction: self.eviction,
            page_limit: self.page_limit,
        }
    }
}

/// The subset of [`TreeOptions`] the pager cares about.
#[derive(Debug, Clone)]
pub struct PagerOptions {
    pub cache_bytes: usize,
    pub allocator: AllocatorKind,
    pub eviction: EvictionKind,
    pub page_limit: Option<u64>,
}

impl Default for PagerOptions {
    fn default() -> Self {
        TreeOptions::default().pager_options()
    }
}
