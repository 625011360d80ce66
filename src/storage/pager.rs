//! Disk-backed page management layer.
//!
//! The [`Pager`] owns the backing file, the write-behind page cache, the page
//! allocator and the inner-region allocator. Higher layers address whole
//! pages through [`get`](Pager::get)/[`place`](Pager::place) and sub-page
//! byte ranges through the `*_inner` family; nothing above the pager touches
//! a file offset directly.
//!
//! # Responsibilities
//!
//! - Opening a backing file for read+write and holding its descriptor
//!   exclusively for the pager's lifetime.
//! - Routing page reads and writes through the cache, syncing dirty
//!   evictions with positioned writes (the file grows implicitly as
//!   positions beyond the current end are written).
//! - Delegating `alloc`/`free` to the configured allocator variant.
//! - Carving inner byte ranges out of pages, after the reserved header.
//! - Persisting allocator state to the `<file>-pager` sidecar on `save` and
//!   restoring it on `load`.
//!
//! # Example
//! ```no_run
//! use floe::config::PagerOptions;
//! use floe::storage::pager::Pager;
//! use floe::storage::page::Page;
//!
//! let mut pager = Pager::open("floe.db", &PagerOptions::default()).unwrap();
//!
//! let pos = pager.alloc().unwrap();
//! pager.place(pos, Page::zeroed()).unwrap();
//! let page = pager.get(pos).unwrap();
//! # let _ = page;
//! ```

use std::{
    fs::{File, OpenOptions},
    io::{Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
};

use log::{debug, trace};

use crate::config::PagerOptions;

use super::{
    CodecConfig, ReadError, StorageError, WriteError,
    allocator::{InnerAllocator, PageAllocator},
    cache::{Eviction, PageCache},
    codec_config,
    page::{PAGE_SIZE, Page},
    position::Position,
};

pub struct Pager {
    file: File,
    path: PathBuf,
    cache: PageCache,
    allocator: PageAllocator,
    inner: InnerAllocator,
    config: CodecConfig,
}

impl Pager {
    /// Opens the backing file at `path`, creating it when absent.
    pub fn open(path: impl Into<PathBuf>, opts: &PagerOptions) -> Result<Self, StorageError> {
        let path = path.into();
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&path)
            .map_err(ReadError::Io)?;

        Ok(Self {
            file,
            path,
            cache: PageCache::new(opts.cache_bytes, opts.eviction),
            allocator: PageAllocator::new(opts.allocator, opts.page_limit),
            inner: InnerAllocator::default(),
            config: codec_config(),
        })
    }

    /// Hands out a fresh page-aligned position.
    pub fn alloc(&mut self) -> Result<Position, StorageError> {
        self.allocator.alloc()
    }

    /// Returns a position to the allocation pool.
    pub fn free(&mut self, pos: Position) -> Result<(), StorageError> {
        self.allocator.free(pos)
    }

    /// Reads the page at `pos`, faulting it into the cache on a miss.
    pub fn get(&mut self, pos: Position) -> Result<Page, StorageError> {
        if let Some(page) = self.cache.get(pos) {
            return Ok(page.clone());
        }

        trace!("faulting page at {pos}");
        let page = self.read_page(pos)?;
        if let Some(eviction) = self.cache.place_clean(pos, page.clone()) {
            self.sync(eviction)?;
        }
        Ok(page)
    }

    /// Places an owned page at `pos`; the write reaches the disk when the
    /// page is evicted or the cache flushed.
    pub fn place(&mut self, pos: Position, page: Page) -> Result<(), StorageError> {
        if let Some(eviction) = self.cache.place(pos, page) {
            self.sync(eviction)?;
        }
        Ok(())
    }

    /// Hands out an inner byte range of at least `size` bytes.
    pub fn alloc_inner(&mut self, size: u32) -> Result<Position, StorageError> {
        let allocator = &mut self.allocator;
        self.inner.alloc(size, || allocator.alloc())
    }

    /// Returns an inner byte range to the coalescing freelist.
    pub fn free_inner(&mut self, pos: Position, size: u32) {
        self.inner.free(pos, size);
    }

    /// Reads `size` bytes from an inner range.
    pub fn get_inner(&mut self, pos: Position, size: u32) -> Result<Vec<u8>, StorageError> {
        let (page_pos, offset) = split_inner(pos);
        let page = self.get(page_pos)?;
        let bytes = page
            .read_bytes(offset, size as usize)
            .ok_or(ReadError::OutOfPage)?;
        Ok(bytes.to_vec())
    }

    /// Writes `bytes` into a previously allocated inner range.
    pub fn place_inner(&mut self, pos: Position, bytes: &[u8]) -> Result<(), StorageError> {
        let (page_pos, offset) = split_inner(pos);
        let mut page = self.get(page_pos)?;
        page.write_bytes(offset, bytes).ok_or(ReadError::OutOfPage)?;
        self.place(page_pos, page)
    }

    /// Largest number of inner bytes ever in use at once.
    pub fn inner_high_water(&self) -> u64 {
        self.inner.high_water_mark()
    }

    /// Serializes allocator state to the sidecar and flushes the cache.
    pub fn save(&mut self) -> Result<(), StorageError> {
        let state = bincode::encode_to_vec((&self.allocator, &self.inner), self.config)
            .map_err(WriteError::Encode)?;
        let mut sidecar = OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .open(self.state_path())
            .map_err(WriteError::Io)?;
        sidecar.write_all(&state).map_err(WriteError::Io)?;

        debug!("pager state saved to {}", self.state_path().display());
        self.flush()
    }

    /// Restores allocator state from the sidecar.
    pub fn load(&mut self) -> Result<(), StorageError> {
        let mut sidecar = File::open(self.state_path()).map_err(ReadError::Io)?;
        let mut state = Vec::new();
        sidecar.read_to_end(&mut state).map_err(ReadError::Io)?;

        let ((allocator, inner), _): ((PageAllocator, InnerAllocator), usize) =
            bincode::decode_from_slice(&state, self.config).map_err(ReadError::Decode)?;
        self.allocator = allocator;
        self.inner = inner;
        debug!("pager state loaded from {}", self.state_path().display());
        Ok(())
    }

    /// Evicts every cached page, syncing the dirty ones in LRU order.
    pub fn flush(&mut self) -> Result<(), StorageError> {
        for eviction in self.cache.flush() {
            self.sync(eviction)?;
        }
        self.file.flush().map_err(WriteError::Io)?;
        Ok(())
    }

    fn sync(&mut self, eviction: Eviction) -> Result<(), StorageError> {
        trace!("syncing page at {}", eviction.pos);
        self.write_page(eviction.pos, &eviction.page)
    }

    fn read_page(&mut self, pos: Position) -> Result<Page, StorageError> {
        self.file
            .seek(SeekFrom::Start(pos.raw()))
            .map_err(ReadError::Io)?;

        let mut buf = [0; PAGE_SIZE];
        let mut filled = 0;
        while filled < PAGE_SIZE {
            match self.file.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(ReadError::Io(e).into()),
            }
        }

        // Allocated-but-unwritten positions read back as zeroed pages.
        Ok(Page::from_bytes(&buf).expect("buffer is exactly one page"))
    }

    fn write_page(&mut self, pos: Position, page: &Page) -> Result<(), StorageError> {
        self.file
            .seek(SeekFrom::Start(pos.raw()))
            .map_err(WriteError::Io)?;
        self.file
            .write_all(page.as_bytes())
            .map_err(WriteError::Io)?;
        Ok(())
    }

    fn state_path(&self) -> PathBuf {
        sidecar_path(&self.path, "-pager")
    }

    #[cfg(test)]
    pub(crate) fn allocator(&self) -> &PageAllocator {
        &self.allocator
    }
}

/// Derives a sidecar path by appending `suffix` to the file name.
pub(crate) fn sidecar_path(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}

fn split_inner(pos: Position) -> (Position, usize) {
    let raw = pos.raw();
    let page = raw / PAGE_SIZE as u64 * PAGE_SIZE as u64;
    (Position::new(page), (raw - page) as usize)
}

#[cfg(test)]
mod tests {
    use tempdir::TempDir;

    use crate::config::AllocatorKind;
    use crate::storage::allocator::FreeListAllocator;
    use crate::storage::page::PAGE_HEADER_SIZE;

    use super::*;

    fn freelist(pager: &Pager) -> &FreeListAllocator {
        match pager.allocator() {
            PageAllocator::FreeList(inner) => inner,
            PageAllocator::Stack(_) => panic!("freelist pager expected"),
        }
    }

    #[test]
    fn pages_round_trip_through_the_file() {
        let temp = TempDir::new("pager").unwrap();
        let mut pager = Pager::open(temp.path().join("floe.db"), &PagerOptions::default()).unwrap();

        let mut page = Page::zeroed();
        page.write_bytes(0, &[42; PAGE_SIZE]).unwrap();
        pager.place(Position::new(0), page.clone()).unwrap();
        assert_eq!(pager.get(Position::new(0)).unwrap(), page);

        let mut other = Page::zeroed();
        other.write_bytes(0, &[13; PAGE_SIZE]).unwrap();
        pager
            .place(Position::new(PAGE_SIZE as u64), other.clone())
            .unwrap();
        assert_eq!(pager.get(Position::new(PAGE_SIZE as u64)).unwrap(), other);
    }

    #[test]
    fn unwritten_positions_read_back_zeroed() {
        let temp = TempDir::new("pager").unwrap();
        let mut pager = Pager::open(temp.path().join("floe.db"), &PagerOptions::default()).unwrap();

        let pos = pager.alloc().unwrap();
        assert_eq!(pager.get(pos).unwrap(), Page::zeroed());
    }

    #[test]
    fn pages_survive_a_flush_and_reopen() {
        let temp = TempDir::new("pager").unwrap();
        let path = temp.path().join("floe.db");

        let mut pager = Pager::open(&path, &PagerOptions::default()).unwrap();
        let pos = pager.alloc().unwrap();
        let mut page = Page::zeroed();
        page.write_bytes(64, b"persisted").unwrap();
        pager.place(pos, page.clone()).unwrap();
        pager.flush().unwrap();
        drop(pager);

        let mut pager = Pager::open(&path, &PagerOptions::default()).unwrap();
        assert_eq!(pager.get(pos).unwrap(), page);
    }

    #[test]
    fn stack_allocator_state_round_trips() {
        let temp = TempDir::new("pager").unwrap();
        let path = temp.path().join("floe.db");
        let opts = PagerOptions {
            allocator: AllocatorKind::Stack,
            ..PagerOptions::default()
        };

        let mut pager = Pager::open(&path, &opts).unwrap();
        for _ in 0..10 {
            pager.alloc().unwrap();
        }
        pager.save().unwrap();
        drop(pager);

        let mut pager = Pager::open(&path, &opts).unwrap();
        pager.load().unwrap();
        assert_eq!(pager.alloc().unwrap(), 10 * PAGE_SIZE as u64);
    }

    #[test]
    fn freelist_state_round_trips() {
        let temp = TempDir::new("pager").unwrap();
        let path = temp.path().join("floe.db");
        let opts = PagerOptions {
            page_limit: Some(10),
            ..PagerOptions::default()
        };

        let mut pager = Pager::open(&path, &opts).unwrap();
        for _ in 0..10 {
            pager.alloc().unwrap();
        }
        for i in (0..10).step_by(2) {
            pager.free(Position::new(i * PAGE_SIZE as u64)).unwrap();
        }
        let expected: Vec<u64> = freelist(&pager).freelist().to_vec();
        pager.save().unwrap();
        drop(pager);

        let mut pager = Pager::open(&path, &opts).unwrap();
        pager.load().unwrap();
        assert_eq!(freelist(&pager).freelist(), expected);

        // A fresh pager that never loads starts clean.
        let other = Pager::open(&path, &opts).unwrap();
        assert!(freelist(&other).freelist().is_empty());
    }

    #[test]
    fn inner_ranges_round_trip() {
        let temp = TempDir::new("pager").unwrap();
        let mut pager = Pager::open(temp.path().join("floe.db"), &PagerOptions::default()).unwrap();

        let pos = pager.alloc_inner(10).unwrap();
        assert_eq!(pos, PAGE_HEADER_SIZE as u64);
        assert_eq!(pager.inner_high_water(), 12);

        pager.place_inner(pos, b"ten bytes!").unwrap();
        assert_eq!(pager.get_inner(pos, 10).unwrap(), b"ten bytes!");

        let second = pager.alloc_inner(20).unwrap();
        assert_eq!(second, PAGE_HEADER_SIZE as u64 + 12);
        assert_eq!(pager.inner_high_water(), 32);
    }

    #[test]
    fn freed_inner_ranges_are_reused() {
        let temp = TempDir::new("pager").unwrap();
        let mut pager = Pager::open(temp.path().join("floe.db"), &PagerOptions::default()).unwrap();

        let a = pager.alloc_inner(100).unwrap();
        let _b = pager.alloc_inner(100).unwrap();
        pager.free_inner(a, 100);

        let again = pager.alloc_inner(60).unwrap();
        assert_eq!(again.raw(), a.raw());
    }
}
