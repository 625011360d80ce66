//! Write-behind page cache.
//!
//! A capacity-bounded LRU over `(position → page)`. The cache never touches
//! the disk itself: dirty pages displaced by [`place`](PageCache::place) or
//! drained by [`flush`](PageCache::flush) are handed back to the pager, which
//! is responsible for syncing them. Clean evictions are silent.
//!
//! During a flush, evictions reach the pager in LRU order. In steady state
//! the only promise is that the least-recently-used entry is evicted next.

use std::num::NonZeroUsize;

use log::trace;
use lru::LruCache;

use crate::config::EvictionKind;

use super::{page::PAGE_SIZE, page::Page, position::Position};

/// A dirty page displaced from the cache, due for a disk sync.
#[derive(Debug)]
pub struct Eviction {
    pub pos: Position,
    pub page: Page,
}

#[derive(Debug)]
struct Frame {
    page: Page,
    dirty: bool,
}

/// Write-behind cache over positions and pages.
///
/// Capacity is expressed in bytes and converted to a page count. Keys are raw
/// offsets: poison never names a cached page.
pub struct PageCache {
    frames: LruCache<u64, Frame>,
    policy: EvictionKind,
}

impl PageCache {
    pub fn new(cache_bytes: usize, policy: EvictionKind) -> Self {
        let limit = NonZeroUsize::new((cache_bytes / PAGE_SIZE).max(1)).expect("at least one page");
        Self {
            frames: LruCache::new(limit),
            policy,
        }
    }

    /// Looks up a cached page. Under LRU the entry is promoted to
    /// most-recently-used; under FIFO the order is left untouched.
    pub fn get(&mut self, pos: Position) -> Option<&Page> {
        let frame = match self.policy {
            EvictionKind::Lru => self.frames.get(&pos.raw()),
            EvictionKind::Fifo => self.frames.peek(&pos.raw()),
        };
        frame.map(|f| &f.page)
    }

    /// Places an owned page, marking it dirty. Replaces in place when the
    /// position is already cached; otherwise the least-recently-used entry
    /// makes room, and is returned when it still owed a disk write.
    pub fn place(&mut self, pos: Position, page: Page) -> Option<Eviction> {
        self.insert(pos, Frame { page, dirty: true })
    }

    /// Places a page that is already in sync with the disk, e.g. one the
    /// pager just faulted in.
    pub fn place_clean(&mut self, pos: Position, page: Page) -> Option<Eviction> {
        self.insert(pos, Frame { page, dirty: false })
    }

    fn insert(&mut self, pos: Position, frame: Frame) -> Option<Eviction> {
        let key = pos.raw();
        let existing = match self.policy {
            EvictionKind::Lru => self.frames.get_mut(&key),
            EvictionKind::Fifo => self.frames.peek_mut(&key),
        };
        if let Some(cached) = existing {
            cached.page = frame.page;
            cached.dirty = cached.dirty || frame.dirty;
            return None;
        }

        let mut displaced = None;
        if self.frames.len() == self.frames.cap().get() {
            displaced = self.evict();
        }
        self.frames.put(key, frame);
        displaced
    }

    fn evict(&mut self) -> Option<Eviction> {
        let (key, frame) = self.frames.pop_lru()?;
        if frame.dirty {
            trace!("evicting dirty page at {key}");
            Some(Eviction {
                pos: Position::new(key),
                page: frame.page,
            })
        } else {
            None
        }
    }

    /// Drains the cache in LRU order, yielding the dirty evictions.
    pub fn flush(&mut self) -> Vec<Eviction> {
        let mut out = Vec::new();
        while !self.frames.is_empty() {
            if let Some(eviction) = self.evict() {
                out.push(eviction);
            }
        }
        out
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.frames.cap().get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filled(byte: u8) -> Page {
        let mut page = Page::zeroed();
        page.write_bytes(0, &[byte; PAGE_SIZE]).unwrap();
        page
    }

    fn pos(n: u64) -> Position {
        Position::new(n * PAGE_SIZE as u64)
    }

    #[test]
    fn capacity_is_a_page_count() {
        let cache = PageCache::new(4 * PAGE_SIZE, EvictionKind::Lru);
        assert_eq!(cache.capacity(), 4);

        // Degenerate byte budgets still hold one page.
        let cache = PageCache::new(1, EvictionKind::Lru);
        assert_eq!(cache.capacity(), 1);
    }

    #[test]
    fn evicts_the_least_recently_used() {
        let mut cache = PageCache::new(4 * PAGE_SIZE, EvictionKind::Lru);
        for i in 0..4 {
            assert!(cache.place(pos(i), filled(i as u8)).is_none());
            assert_eq!(cache.get(pos(i)).unwrap(), &filled(i as u8));
        }
        assert!(cache.get(Position::new(42)).is_none());

        let first = cache.place(pos(4), filled(42)).expect("dirty eviction");
        assert_eq!(first.pos, pos(0));
        assert_eq!(first.page, filled(0));

        let second = cache.place(pos(5), filled(13)).expect("dirty eviction");
        assert_eq!(second.pos, pos(1));
    }

    #[test]
    fn lookups_promote_under_lru() {
        let mut cache = PageCache::new(2 * PAGE_SIZE, EvictionKind::Lru);
        cache.place(pos(0), filled(0));
        cache.place(pos(1), filled(1));

        cache.get(pos(0));
        let evicted = cache.place(pos(2), filled(2)).unwrap();
        assert_eq!(evicted.pos, pos(1));
    }

    #[test]
    fn lookups_do_not_promote_under_fifo() {
        let mut cache = PageCache::new(2 * PAGE_SIZE, EvictionKind::Fifo);
        cache.place(pos(0), filled(0));
        cache.place(pos(1), filled(1));

        cache.get(pos(0));
        let evicted = cache.place(pos(2), filled(2)).unwrap();
        assert_eq!(evicted.pos, pos(0));
    }

    #[test]
    fn place_replaces_in_place() {
        let mut cache = PageCache::new(2 * PAGE_SIZE, EvictionKind::Lru);
        cache.place(pos(0), filled(1));
        assert!(cache.place(pos(0), filled(2)).is_none());
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get(pos(0)).unwrap(), &filled(2));
    }

    #[test]
    fn clean_evictions_are_silent() {
        let mut cache = PageCache::new(PAGE_SIZE, EvictionKind::Lru);
        cache.place_clean(pos(0), filled(0));
        assert!(cache.place(pos(1), filled(1)).is_none());
    }

    #[test]
    fn flush_drains_in_lru_order() {
        let mut cache = PageCache::new(4 * PAGE_SIZE, EvictionKind::Lru);
        for i in 0..3 {
            cache.place(pos(i), filled(i as u8));
        }
        cache.get(pos(0));

        let order: Vec<_> = cache.flush().into_iter().map(|e| e.pos).collect();
        assert_eq!(order, vec![pos(1), pos(2), pos(0)]);
        assert!(cache.is_empty());
    }
}
