//! Disk-based B+ tree for ordered key-value storage.
//!
//! The tree is built on top of the [`Pager`], using fixed-size pages to hold
//! branch and leaf [`Node`]s. Keys live in sorted order; leaves additionally
//! form a doubly-linked list, so scans walk sibling links instead of
//! re-descending.
//!
//! # Design Overview
//! - **Branch nodes** hold separator references and child positions
//! - **Leaf nodes** hold the actual entries
//! - Nodes are loaded and persisted through the pager's write-behind cache
//! - Insertion splits full nodes pre-emptively on the way down
//! - Removal rebalances under-filled nodes by borrowing from or merging with
//!   a sibling, unless relaxed removes are configured
//!
//! # Separator discipline
//!
//! Separators are right-biased: for a separator `r` between two children,
//! every key in the left child is `≤ r` and every key in the right child is
//! `> r`. Search descends through the first reference that is `≥` the target.
//! A leaf split keeps the middle key as the last entry of the left sibling
//! and promotes a copy; a branch split moves its middle reference up.
//!
//! # Persistence
//!
//! Tree state is `(rootpos, size, depth)` plus a dirty flag; every mutation
//! dirties the header. `save` rewrites the `<name>-header` sidecar and
//! flushes the cache through the pager; `load` restores counters from the
//! header after checking its magic and page size.
//!
//! # Example
//! ```no_run
//! use floe::config::{OpenMode, TreeOptions};
//! use floe::storage::btree::Btree;
//!
//! let mut tree: Btree<i32, i32> =
//!     Btree::open("floe.db", OpenMode::Bare, TreeOptions::default()).unwrap();
//! tree.insert(1, 100).unwrap();
//! assert_eq!(tree.get(&1).unwrap(), Some(100));
//! tree.save().unwrap();
//! ```
//!
//! # See Also
//! - [`Node`]: one page interpreted as a tree node
//! - [`Pager`]: disk I/O, caching and allocation
//! - [`SlotTree`](crate::storage::indvec::SlotTree): the same index over
//!   variable-sized values

use std::{
    collections::VecDeque,
    fs::{File, OpenOptions},
    io::BufReader,
    marker::PhantomData,
    path::PathBuf,
};

use bincode::{Decode, Encode};
use log::{debug, trace};

use crate::config::{OpenMode, TreeOptions};

use super::{
    AllocError, CodecConfig, HeaderError, ReadError, StorageError, WriteError, codec_config,
    node::{Fanout, Key, Node, NodeBody, Value},
    page::PAGE_SIZE,
    pager::{Pager, sidecar_path},
    position::Position,
};

const MAGIC: u32 = 0x3154_5042;

/// Persistent description of a tree, written to the header sidecar on every
/// `save` and read back on `load`.
#[derive(Debug, Clone, PartialEq, Encode, Decode)]
pub struct TreeHeader {
    pub magic: u32,
    pub page_size: u32,
    pub cache_bytes: u32,
    pub compressed: u8,
    pub rootpos: u64,
    pub size: u64,
    pub depth: u64,
    pub content_file: String,
}

/// Result of an insert: either the pair went in, or the key was already
/// present and nothing was written. Both carry the position of the leaf
/// holding the effective entry.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum InsertOutcome {
    Inserted(Position),
    InsertedNothing(Position),
}

/// Result of a remove: the evicted value, or nothing to do.
#[derive(Debug, Clone, PartialEq)]
pub enum RemoveOutcome<V> {
    Removed(V),
    RemovedNothing,
}

/// Disk-based B+ tree.
pub struct Btree<K, V> {
    pager: Pager,
    content_path: PathBuf,
    header_path: PathBuf,
    rootpos: Position,
    size: u64,
    depth: u64,
    header_dirty: bool,
    fanout: Fanout,
    opts: TreeOptions,
    config: CodecConfig,
    _marker: PhantomData<(K, V)>,
}

impl<K: Key, V: Value> Btree<K, V> {
    /// Opens a tree whose content lives at `path` and whose header lives in
    /// the `<path>-header` sidecar.
    pub fn open(
        path: impl Into<PathBuf>,
        mode: OpenMode,
        opts: TreeOptions,
    ) -> Result<Self, StorageError> {
        let content_path = path.into();
        let header_path = sidecar_path(&content_path, "-header");
        let config = codec_config();
        let fanout = Fanout::compute::<K, V>(opts.leaf_fanout, opts.branch_fanout, config)?;
        let pager = Pager::open(content_path.clone(), &opts.pager_options())?;

        let mut tree = Self {
            pager,
            content_path,
            header_path,
            rootpos: Position::POISON,
            size: 0,
            depth: 1,
            header_dirty: true,
            fanout,
            opts,
            config,
            _marker: PhantomData,
        };
        match mode {
            OpenMode::Bare => tree.init_bare()?,
            OpenMode::Load => tree.load()?,
        }
        Ok(tree)
    }

    /// Number of entries in the tree.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Number of levels, leaves included.
    pub fn depth(&self) -> u64 {
        self.depth
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Position of the root node.
    pub fn rootpos(&self) -> Position {
        self.rootpos
    }

    /// Whether the in-memory header has diverged from the saved one.
    pub fn header_dirty(&self) -> bool {
        self.header_dirty
    }

    /// Most entries a leaf may hold.
    pub fn leaf_records(&self) -> usize {
        self.fanout.leaf_records
    }

    /// Most separator references a branch may hold.
    pub fn branch_records(&self) -> usize {
        self.fanout.branch_records()
    }

    /// Looks up the value stored under `key`.
    pub fn get(&mut self, key: &K) -> Result<Option<V>, StorageError> {
        let mut node = self.fetch_node(self.rootpos)?;
        loop {
            let next = match &node.body {
                NodeBody::Branch { refs, links } => links[refs.partition_point(|r| r < key)],
                NodeBody::Leaf { keys, vals } => {
                    return Ok(keys.binary_search(key).ok().map(|at| vals[at].clone()));
                }
            };
            node = self.fetch_node(next)?;
        }
    }

    pub fn contains(&mut self, key: &K) -> Result<bool, StorageError> {
        Ok(self.get(key)?.is_some())
    }

    /// Inserts the pair if `key` is absent. A present key leaves the tree
    /// untouched and reports [`InsertOutcome::InsertedNothing`].
    pub fn insert(&mut self, key: K, val: V) -> Result<InsertOutcome, StorageError> {
        enum Step {
            Descend(usize),
            InsertAt(usize),
            Duplicate,
        }

        let mut node = self.fetch_node(self.rootpos)?;
        if self.is_full(&node) {
            node = self.grow_root(node)?;
        }

        loop {
            let step = match &node.body {
                NodeBody::Leaf { keys, .. } => {
                    let at = keys.partition_point(|k| k < &key);
                    if keys.get(at).is_some_and(|k| *k == key) {
                        Step::Duplicate
                    } else {
                        Step::InsertAt(at)
                    }
                }
                NodeBody::Branch { refs, .. } => {
                    Step::Descend(refs.partition_point(|r| r < &key))
                }
            };

            match step {
                Step::Duplicate => {
                    trace!("key already present in node at {}", node.pos);
                    return Ok(InsertOutcome::InsertedNothing(node.pos));
                }
                Step::InsertAt(at) => {
                    let NodeBody::Leaf { keys, vals } = &mut node.body else {
                        unreachable!("insertion lands in a leaf");
                    };
                    keys.insert(at, key);
                    vals.insert(at, val);
                    self.place_node(&node)?;
                    self.size += 1;
                    self.header_dirty = true;
                    return Ok(InsertOutcome::Inserted(node.pos));
                }
                Step::Descend(idx) => {
                    let child = self.fetch_node(node.link(idx))?;
                    if self.is_full(&child) {
                        self.split_child(&mut node, idx)?;
                        // Re-route through the widened branch.
                        continue;
                    }
                    node = child;
                }
            }
        }
    }

    /// Replaces the value of an existing key, returning the old value.
    pub fn update(&mut self, key: &K, val: V) -> Result<V, StorageError> {
        enum Step {
            Descend(Position),
            Found(usize),
            Missing,
        }

        let mut node = self.fetch_node(self.rootpos)?;
        loop {
            let step = match &node.body {
                NodeBody::Branch { refs, links } => {
                    Step::Descend(links[refs.partition_point(|r| r < key)])
                }
                NodeBody::Leaf { keys, .. } => match keys.binary_search(key) {
                    Ok(at) => Step::Found(at),
                    Err(_) => Step::Missing,
                },
            };
            match step {
                Step::Missing => return Err(StorageError::NoSuchEntry),
                Step::Found(at) => {
                    let NodeBody::Leaf { vals, .. } = &mut node.body else {
                        unreachable!("entries live in leaves");
                    };
                    let old = std::mem::replace(&mut vals[at], val);
                    self.place_node(&node)?;
                    debug!("updated entry in node at {}", node.pos);
                    return Ok(old);
                }
                Step::Descend(next) => node = self.fetch_node(next)?,
            }
        }
    }

    /// Removes the entry under `key`, rebalancing unless relaxed removes are
    /// configured.
    pub fn remove(&mut self, key: &K) -> Result<RemoveOutcome<V>, StorageError> {
        enum Step {
            Descend(usize),
            Found(usize),
            Missing,
        }

        let mut path: Vec<(Position, usize)> = Vec::new();
        let mut node = self.fetch_node(self.rootpos)?;
        let removed = loop {
            let step = match &node.body {
                NodeBody::Branch { refs, .. } => Step::Descend(refs.partition_point(|r| r < key)),
                NodeBody::Leaf { keys, .. } => match keys.binary_search(key) {
                    Ok(at) => Step::Found(at),
                    Err(_) => Step::Missing,
                },
            };
            match step {
                Step::Missing => return Ok(RemoveOutcome::RemovedNothing),
                Step::Found(at) => {
                    let NodeBody::Leaf { keys, vals } = &mut node.body else {
                        unreachable!("entries live in leaves");
                    };
                    keys.remove(at);
                    let val = vals.remove(at);
                    self.place_node(&node)?;
                    self.size -= 1;
                    self.header_dirty = true;
                    break val;
                }
                Step::Descend(idx) => {
                    path.push((node.pos, idx));
                    node = self.fetch_node(node.link(idx))?;
                }
            }
        };

        if self.opts.relaxed_removes {
            trace!("relaxed removes: leaving node at {} as is", node.pos);
        } else {
            self.rebalance(node, path)?;
        }
        Ok(RemoveOutcome::Removed(removed))
    }

    /// Smallest entry, or absence on an empty tree.
    pub fn min_entry(&mut self) -> Result<Option<(K, V)>, StorageError> {
        if self.is_empty() {
            return Ok(None);
        }
        let mut node = self.fetch_node(self.rootpos)?;
        loop {
            let next = match &node.body {
                NodeBody::Branch { links, .. } => links[0],
                NodeBody::Leaf { keys, vals } => {
                    return Ok(keys.first().cloned().zip(vals.first().cloned()));
                }
            };
            node = self.fetch_node(next)?;
        }
    }

    /// Largest entry, or absence on an empty tree.
    pub fn max_entry(&mut self) -> Result<Option<(K, V)>, StorageError> {
        if self.is_empty() {
            return Ok(None);
        }
        let mut node = self.fetch_node(self.rootpos)?;
        loop {
            let next = match &node.body {
                NodeBody::Branch { links, .. } => links[links.len() - 1],
                NodeBody::Leaf { keys, vals } => {
                    return Ok(keys.last().cloned().zip(vals.last().cloned()));
                }
            };
            node = self.fetch_node(next)?;
        }
    }

    /// Lazy ascending scan over every entry.
    pub fn scan(&mut self) -> Result<Scan<'_, K, V>, StorageError> {
        let mut node = self.fetch_node(self.rootpos)?;
        loop {
            let next = match &node.body {
                NodeBody::Branch { links, .. } => links[0],
                NodeBody::Leaf { .. } => break,
            };
            node = self.fetch_node(next)?;
        }
        Ok(Scan {
            tree: self,
            cursor: Some((node, 0)),
            upper: None,
            done: false,
        })
    }

    /// Lazy ascending scan over entries with keys in `[low, high)`.
    pub fn scan_range(&mut self, low: &K, high: &K) -> Result<Scan<'_, K, V>, StorageError> {
        enum Step {
            Descend(Position),
            Start(usize),
        }

        let mut node = self.fetch_node(self.rootpos)?;
        loop {
            let step = match &node.body {
                NodeBody::Branch { refs, links } => {
                    Step::Descend(links[refs.partition_point(|r| r < low)])
                }
                NodeBody::Leaf { keys, .. } => Step::Start(keys.partition_point(|k| k < low)),
            };
            match step {
                Step::Descend(next) => node = self.fetch_node(next)?,
                Step::Start(at) => {
                    return Ok(Scan {
                        tree: self,
                        cursor: Some((node, at)),
                        upper: Some(high.clone()),
                        done: false,
                    });
                }
            }
        }
    }

    /// Lazy ascending scan over entries satisfying `pred`.
    pub fn scan_filtered<'a, F>(
        &'a mut self,
        mut pred: F,
    ) -> Result<impl Iterator<Item = Result<(K, V), StorageError>> + 'a, StorageError>
    where
        F: FnMut(&K, &V) -> bool + 'a,
    {
        Ok(self.scan()?.filter(move |item| match item {
            Ok((k, v)) => pred(k, v),
            Err(_) => true,
        }))
    }

    /// Lazy descending scan over every entry, walking leaf `prev` links.
    pub fn scan_rev(&mut self) -> Result<ScanRev<'_, K, V>, StorageError> {
        let mut node = self.fetch_node(self.rootpos)?;
        loop {
            let next = match &node.body {
                NodeBody::Branch { links, .. } => links[links.len() - 1],
                NodeBody::Leaf { .. } => break,
            };
            node = self.fetch_node(next)?;
        }
        let at = node.num_filled();
        Ok(ScanRev {
            tree: self,
            cursor: Some((node, at)),
            done: false,
        })
    }

    /// Renders the tree's shape in Graphviz DOT language.
    pub fn structure(&mut self) -> Result<String, StorageError> {
        let mut queue = VecDeque::from([self.rootpos]);
        let mut out = String::from("digraph {\n");

        while let Some(pos) = queue.pop_back() {
            let node = self.fetch_node(pos)?;
            match &node.body {
                NodeBody::Branch { links, .. } => {
                    for link in links {
                        out += format!("    n{} -> n{};\n", pos.raw(), link.raw()).as_str();
                        queue.push_front(*link);
                    }
                }
                NodeBody::Leaf { keys, .. } => {
                    out += format!("    n{} [label=\"{} entries\"];\n", pos.raw(), keys.len())
                        .as_str();
                    if node.next.is_set() {
                        out += format!(
                            "    n{} -> n{} [style=\"dashed\"];\n",
                            pos.raw(),
                            node.next.raw()
                        )
                        .as_str();
                    }
                }
            }
        }

        out += "}";
        Ok(out)
    }

    /// Serializes the header sidecar and flushes the cache. A no-op for
    /// non-persistent trees.
    pub fn save(&mut self) -> Result<(), StorageError> {
        if !self.opts.persistent {
            trace!("non-persistent tree; save skipped");
            return Ok(());
        }

        let header = TreeHeader {
            magic: MAGIC,
            page_size: PAGE_SIZE as u32,
            cache_bytes: self.opts.cache_bytes as u32,
            compressed: self.opts.apply_compression as u8,
            rootpos: self.rootpos.raw(),
            size: self.size,
            depth: self.depth,
            content_file: self.content_path.display().to_string(),
        };
        let mut file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .open(&self.header_path)
            .map_err(WriteError::Io)?;
        bincode::encode_into_std_write(&header, &mut file, self.config)
            .map_err(WriteError::Encode)?;

        self.header_dirty = false;
        self.pager.save()?;
        debug!(
            "tree saved: rootpos {} size {} depth {}",
            self.rootpos, self.size, self.depth
        );
        Ok(())
    }

    /// Reads the header sidecar and resets in-memory state from it.
    pub fn load(&mut self) -> Result<(), StorageError> {
        let file = File::open(&self.header_path).map_err(ReadError::Io)?;
        let mut reader = BufReader::new(file);
        let header: TreeHeader =
            bincode::decode_from_reader(&mut reader, self.config).map_err(ReadError::Decode)?;

        if header.magic != MAGIC {
            return Err(HeaderError::BadMagic {
                found: header.magic,
                expected: MAGIC,
            }
            .into());
        }
        if header.page_size != PAGE_SIZE as u32 {
            return Err(HeaderError::PageSize {
                found: header.page_size,
                expected: PAGE_SIZE as u32,
            }
            .into());
        }

        self.pager.load()?;
        self.rootpos = Position::new(header.rootpos);
        self.size = header.size;
        self.depth = header.depth;
        self.header_dirty = false;
        debug!(
            "tree loaded: rootpos {} size {} depth {}",
            self.rootpos, self.size, self.depth
        );
        Ok(())
    }

    fn init_bare(&mut self) -> Result<(), StorageError> {
        let rootpos = self.pager.alloc()?;
        let root = Node::<K, V>::leaf(rootpos);
        self.rootpos = rootpos;
        self.size = 0;
        self.depth = 1;
        self.header_dirty = true;
        self.place_node(&root)?;
        debug!("bare tree initialised; root at {rootpos}");
        Ok(())
    }

    fn fetch_node(&mut self, pos: Position) -> Result<Node<K, V>, StorageError> {
        let page = self.pager.get(pos)?;
        Node::from_page(&page, self.config)
    }

    fn place_node(&mut self, node: &Node<K, V>) -> Result<(), StorageError> {
        let page = node.to_page(self.config)?;
        self.pager.place(node.pos, page)
    }

    fn is_full(&self, node: &Node<K, V>) -> bool {
        match &node.body {
            NodeBody::Leaf { keys, .. } => keys.len() >= self.fanout.leaf_records,
            NodeBody::Branch { refs, .. } => refs.len() >= self.fanout.branch_records(),
        }
    }

    fn min_filled(&self, node: &Node<K, V>) -> usize {
        if node.is_leaf() {
            self.fanout.leaf_min()
        } else {
            self.fanout.branch_min()
        }
    }

    /// Splits a full root under a fresh branch root, growing the tree by one
    /// level.
    fn grow_root(&mut self, mut old_root: Node<K, V>) -> Result<Node<K, V>, StorageError> {
        let new_pos = self.pager.alloc()?;
        debug!("growing root: new root at {new_pos}");

        let mut new_root = Node::branch(new_pos, Vec::new(), vec![old_root.pos]);
        old_root.parent = new_pos;
        self.place_node(&old_root)?;
        self.split_child(&mut new_root, 0)?;

        self.rootpos = new_pos;
        self.depth += 1;
        self.header_dirty = true;
        Ok(new_root)
    }

    /// Splits the full child behind `parent.links[idx]` at its middle index,
    /// inserting the promoted key and the right sibling into `parent`.
    fn split_child(&mut self, parent: &mut Node<K, V>, idx: usize) -> Result<(), StorageError> {
        let child_pos = parent.link(idx);
        let mut child = self.fetch_node(child_pos)?;
        let right_pos = self.pager.alloc()?;
        debug!("splitting node at {child_pos}; right sibling at {right_pos}");

        let (midkey, mut right) = match &mut child.body {
            NodeBody::Leaf { keys, vals } => {
                let mid = keys.len() / 2;
                let right_keys = keys.split_off(mid + 1);
                let right_vals = vals.split_off(mid + 1);
                // Copy-up: the middle key stays in the left sibling and a
                // copy is promoted.
                let midkey = keys[mid].clone();
                let right = Node {
                    pos: right_pos,
                    prev: child_pos,
                    next: child.next,
                    parent: Position::POISON,
                    body: NodeBody::Leaf {
                        keys: right_keys,
                        vals: right_vals,
                    },
                };
                (midkey, right)
            }
            NodeBody::Branch { refs, links } => {
                let mid = refs.len() / 2;
                let right_refs = refs.split_off(mid + 1);
                let right_links = links.split_off(mid + 1);
                // Move-up: the middle reference leaves the child entirely.
                let midkey = refs.pop().expect("split point inside the node");
                let right = Node {
                    pos: right_pos,
                    prev: Position::POISON,
                    next: Position::POISON,
                    parent: Position::POISON,
                    body: NodeBody::Branch {
                        refs: right_refs,
                        links: right_links,
                    },
                };
                (midkey, right)
            }
        };

        if child.is_leaf() {
            if child.next.is_set() {
                let mut after = self.fetch_node(child.next)?;
                after.prev = right_pos;
                self.place_node(&after)?;
            }
            child.next = right_pos;
        } else {
            for pos in right.links_snapshot() {
                let mut grandchild = self.fetch_node(pos)?;
                grandchild.parent = right_pos;
                self.place_node(&grandchild)?;
            }
        }

        child.parent = parent.pos;
        right.parent = parent.pos;

        match &mut parent.body {
            NodeBody::Branch { refs, links } => {
                refs.insert(idx, midkey);
                links.insert(idx + 1, right_pos);
            }
            NodeBody::Leaf { .. } => unreachable!("split target's parent is a branch"),
        }

        self.place_node(&child)?;
        self.place_node(&right)?;
        self.place_node(parent)
    }

    /// Walks from a freshly shrunk node toward the root, borrowing or
    /// merging wherever the fill invariant broke.
    fn rebalance(
        &mut self,
        mut node: Node<K, V>,
        mut path: Vec<(Position, usize)>,
    ) -> Result<(), StorageError> {
        loop {
            let Some(&(parent_pos, idx)) = path.last() else {
                return self.collapse_root(node);
            };
            if node.num_filled() >= self.min_filled(&node) {
                return Ok(());
            }
            path.pop();
            let min = self.min_filled(&node);
            let mut parent = self.fetch_node(parent_pos)?;

            if idx > 0 {
                let left = self.fetch_node(parent.link(idx - 1))?;
                if left.num_filled() > min {
                    return self.borrow_from_left(&mut parent, idx, left, node);
                }
            }
            if idx + 1 < parent.num_links() {
                let right = self.fetch_node(parent.link(idx + 1))?;
                if right.num_filled() > min {
                    return self.borrow_from_right(&mut parent, idx, node, right);
                }
            }

            if idx > 0 {
                let left = self.fetch_node(parent.link(idx - 1))?;
                self.merge_siblings(&mut parent, idx - 1, left, node)?;
            } else {
                let right = self.fetch_node(parent.link(idx + 1))?;
                self.merge_siblings(&mut parent, idx, node, right)?;
            }
            node = parent;
        }
    }

    /// Replaces a single-child branch root by its child, shrinking depth.
    fn collapse_root(&mut self, root: Node<K, V>) -> Result<(), StorageError> {
        let NodeBody::Branch { refs, links } = &root.body else {
            return Ok(());
        };
        if !refs.is_empty() {
            return Ok(());
        }

        let child_pos = links[0];
        let mut child = self.fetch_node(child_pos)?;
        child.parent = Position::POISON;
        self.place_node(&child)?;
        self.release_page(root.pos)?;

        self.rootpos = child_pos;
        self.depth -= 1;
        self.header_dirty = true;
        debug!("root collapsed; new root at {child_pos}, depth {}", self.depth);
        Ok(())
    }

    fn borrow_from_left(
        &mut self,
        parent: &mut Node<K, V>,
        idx: usize,
        mut left: Node<K, V>,
        mut node: Node<K, V>,
    ) -> Result<(), StorageError> {
        debug!("borrowing from left sibling {} into {}", left.pos, node.pos);
        match (&mut left.body, &mut node.body) {
            (
                NodeBody::Leaf { keys: lk, vals: lv },
                NodeBody::Leaf { keys: nk, vals: nv },
            ) => {
                let key = lk.pop().expect("sibling holds spare entries");
                let val = lv.pop().expect("sibling holds spare entries");
                nk.insert(0, key);
                nv.insert(0, val);
                let sep = lk.last().expect("sibling keeps its minimum").clone();
                parent.set_separator(idx - 1, sep);
            }
            (
                NodeBody::Branch { refs: lr, links: ll },
                NodeBody::Branch { refs: nr, links: nl },
            ) => {
                nr.insert(0, parent.separator(idx - 1).clone());
                parent.set_separator(idx - 1, lr.pop().expect("sibling holds spare refs"));
                nl.insert(0, ll.pop().expect("links outnumber refs"));
            }
            _ => unreachable!("siblings share a level"),
        }

        if node.is_branch() {
            let moved = node.link(0);
            let mut child = self.fetch_node(moved)?;
            child.parent = node.pos;
            self.place_node(&child)?;
        }
        self.place_node(&left)?;
        self.place_node(&node)?;
        self.place_node(parent)
    }

    fn borrow_from_right(
        &mut self,
        parent: &mut Node<K, V>,
        idx: usize,
        mut node: Node<K, V>,
        mut right: Node<K, V>,
    ) -> Result<(), StorageError> {
        debug!("borrowing from right sibling {} into {}", right.pos, node.pos);
        match (&mut node.body, &mut right.body) {
            (
                NodeBody::Leaf { keys: nk, vals: nv },
                NodeBody::Leaf { keys: rk, vals: rv },
            ) => {
                let key = rk.remove(0);
                let val = rv.remove(0);
                nk.push(key.clone());
                nv.push(val);
                // The moved key is the new largest of the left participant.
                parent.set_separator(idx, key);
            }
            (
                NodeBody::Branch { refs: nr, links: nl },
                NodeBody::Branch { refs: rr, links: rl },
            ) => {
                nr.push(parent.separator(idx).clone());
                parent.set_separator(idx, rr.remove(0));
                nl.push(rl.remove(0));
            }
            _ => unreachable!("siblings share a level"),
        }

        if node.is_branch() {
            let moved = node.link(node.num_links() - 1);
            let mut child = self.fetch_node(moved)?;
            child.parent = node.pos;
            self.place_node(&child)?;
        }
        self.place_node(&node)?;
        self.place_node(&right)?;
        self.place_node(parent)
    }

    /// Folds `right` into `left` and drops the separator between them from
    /// `parent`. The right sibling's page is released.
    fn merge_siblings(
        &mut self,
        parent: &mut Node<K, V>,
        sep_idx: usize,
        mut left: Node<K, V>,
        right: Node<K, V>,
    ) -> Result<(), StorageError> {
        debug!("merging node {} into {}", right.pos, left.pos);
        let right_pos = right.pos;
        let right_next = right.next;

        let moved_children = match (&mut left.body, right.body) {
            (
                NodeBody::Leaf { keys: lk, vals: lv },
                NodeBody::Leaf { keys: rk, vals: rv },
            ) => {
                lk.extend(rk);
                lv.extend(rv);
                Vec::new()
            }
            (
                NodeBody::Branch { refs: lr, links: ll },
                NodeBody::Branch { refs: rr, links: rl },
            ) => {
                lr.push(parent.separator(sep_idx).clone());
                lr.extend(rr);
                let moved = rl.clone();
                ll.extend(rl);
                moved
            }
            _ => unreachable!("siblings share a level"),
        };

        for pos in moved_children {
            let mut child = self.fetch_node(pos)?;
            child.parent = left.pos;
            self.place_node(&child)?;
        }

        if left.is_leaf() {
            left.next = right_next;
            if right_next.is_set() {
                let mut after = self.fetch_node(right_next)?;
                after.prev = left.pos;
                self.place_node(&after)?;
            }
        }

        match &mut parent.body {
            NodeBody::Branch { refs, links } => {
                refs.remove(sep_idx);
                links.remove(sep_idx + 1);
            }
            NodeBody::Leaf { .. } => unreachable!("merge happens under a branch"),
        }

        self.place_node(&left)?;
        self.place_node(parent)?;
        self.release_page(right_pos)
    }

    /// Frees a page, tolerating allocators that cannot reclaim. Merged nodes
    /// simply leak under the stack allocator.
    fn release_page(&mut self, pos: Position) -> Result<(), StorageError> {
        match self.pager.free(pos) {
            Err(StorageError::BadAlloc {
                cause: AllocError::FreeUnsupported,
            }) => Ok(()),
            other => other,
        }
    }
}

impl<K, V> Node<K, V> {
    fn links_snapshot(&self) -> Vec<Position> {
        match &self.body {
            NodeBody::Branch { links, .. } => links.clone(),
            NodeBody::Leaf { .. } => Vec::new(),
        }
    }
}

/// Ascending iterator over entries, optionally bounded above.
pub struct Scan<'t, K, V> {
    tree: &'t mut Btree<K, V>,
    cursor: Option<(Node<K, V>, usize)>,
    upper: Option<K>,
    done: bool,
}

impl<K: Key, V: Value> Iterator for Scan<'_, K, V> {
    type Item = Result<(K, V), StorageError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        loop {
            let (leaf, at) = self.cursor.as_mut()?;
            let NodeBody::Leaf { keys, vals } = &leaf.body else {
                unreachable!("scans walk the leaf level");
            };

            if *at < keys.len() {
                let key = keys[*at].clone();
                let val = vals[*at].clone();
                *at += 1;
                if self.upper.as_ref().is_some_and(|high| key >= *high) {
                    self.done = true;
                    return None;
                }
                return Some(Ok((key, val)));
            }

            let next = leaf.next;
            if !next.is_set() {
                self.done = true;
                return None;
            }
            match self.tree.fetch_node(next) {
                Ok(node) => self.cursor = Some((node, 0)),
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            }
        }
    }
}

/// Descending iterator over entries, the mirror of [`Scan`].
pub struct ScanRev<'t, K, V> {
    tree: &'t mut Btree<K, V>,
    cursor: Option<(Node<K, V>, usize)>,
    done: bool,
}

impl<K: Key, V: Value> Iterator for ScanRev<'_, K, V> {
    type Item = Result<(K, V), StorageError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        loop {
            let (leaf, at) = self.cursor.as_mut()?;
            let NodeBody::Leaf { keys, vals } = &leaf.body else {
                unreachable!("scans walk the leaf level");
            };

            if *at > 0 {
                *at -= 1;
                return Some(Ok((keys[*at].clone(), vals[*at].clone())));
            }

            let prev = leaf.prev;
            if !prev.is_set() {
                self.done = true;
                return None;
            }
            match self.tree.fetch_node(prev) {
                Ok(node) => {
                    let len = node.num_filled();
                    self.cursor = Some((node, len));
                }
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            }
        }
    }
}

#[cfg(test)]
impl<K: Key, V: Value> Btree<K, V> {
    /// Walks the whole tree asserting the structural invariants: fill
    /// bounds, separator partitioning, uniform leaf depth, parent pointers
    /// and a clean sibling chain.
    pub(crate) fn check_invariants(&mut self) {
        let root = self.fetch_node(self.rootpos).unwrap();
        assert!(!root.parent.is_set(), "root must not have a parent");

        let mut leaves = Vec::new();
        let depth = self.check_node(&root, None, None, true, &mut leaves);
        assert_eq!(depth as u64, self.depth, "depth counter out of sync");

        let first = self.fetch_node(leaves[0]).unwrap();
        assert!(!first.prev.is_set());
        let last = self.fetch_node(*leaves.last().unwrap()).unwrap();
        assert!(!last.next.is_set());
        for pair in leaves.windows(2) {
            let a = self.fetch_node(pair[0]).unwrap();
            let b = self.fetch_node(pair[1]).unwrap();
            assert_eq!(a.next.raw(), pair[1].raw(), "broken next link");
            assert_eq!(b.prev.raw(), pair[0].raw(), "broken prev link");
        }

        let keys: Vec<K> = self
            .scan()
            .unwrap()
            .map(|item| item.unwrap().0)
            .collect();
        assert!(
            keys.windows(2).all(|w| w[0] < w[1]),
            "traversal not strictly ascending"
        );
        assert_eq!(keys.len() as u64, self.size, "size counter out of sync");
    }

    fn check_node(
        &mut self,
        node: &Node<K, V>,
        low: Option<&K>,
        high: Option<&K>,
        is_root: bool,
        leaves: &mut Vec<Position>,
    ) -> usize {
        if !is_root {
            assert!(
                node.num_filled() >= self.min_filled(node),
                "under-filled node at {}",
                node.pos
            );
        }

        match &node.body {
            NodeBody::Leaf { keys, vals } => {
                assert_eq!(keys.len(), vals.len());
                assert!(keys.len() <= self.fanout.leaf_records);
                assert!(keys.windows(2).all(|w| w[0] < w[1]));
                if let Some(low) = low {
                    assert!(keys.iter().all(|k| k > low));
                }
                if let Some(high) = high {
                    assert!(keys.iter().all(|k| k <= high));
                }
                leaves.push(node.pos);
                1
            }
            NodeBody::Branch { refs, links } => {
                assert_eq!(links.len(), refs.len() + 1);
                assert!(refs.len() <= self.fanout.branch_records());
                assert!(refs.windows(2).all(|w| w[0] < w[1]));

                let mut child_depth = None;
                for (i, link) in links.iter().enumerate() {
                    let child = self.fetch_node(*link).unwrap();
                    assert_eq!(child.parent.raw(), node.pos.raw(), "stale parent pointer");
                    let lo = if i == 0 { low } else { Some(&refs[i - 1]) };
                    let hi = if i == refs.len() { high } else { Some(&refs[i]) };
                    let depth = self.check_node(&child, lo, hi, false, leaves);
                    assert_eq!(*child_depth.get_or_insert(depth), depth, "uneven leaves");
                }
                child_depth.expect("branches have children") + 1
            }
        }
    }
}
