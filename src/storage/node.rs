//! B+ tree node representation and its page codec.
//!
//! A [`Node`] is one page interpreted as a tree node. Branch versus leaf is a
//! tagged variant, not a hierarchy: dispatch happens on the tag where
//! behavior differs. Every node carries its own position, optional sibling
//! positions (leaves form a doubly-linked list in key order), and an optional
//! parent — all as [`Position`]s with poison marking "unset", because the
//! page cache is the single owner of node memory and navigation happens by
//! position lookup.
//!
//! # Codec
//!
//! Nodes serialize with the crate-wide bincode configuration into the page
//! region after the reserved header; the payload length is stamped into the
//! header so decoding consumes exactly what was written. Serialization is
//! structural: `decode(encode(n))` reproduces `n`.
//!
//! # Fanout
//!
//! The maximum number of records per leaf and per branch is the largest
//! count for which a fully populated node encodes within one page, found by
//! binary search at construction time. Leaf and branch fanouts may differ; an
//! additional clamp guarantees that a split leaf's contents distribute
//! cleanly under the branch fanout.

use std::fmt::Debug;

use bincode::{Decode, Encode};

use super::{
    CodecConfig, ReadError, StorageError, WriteError,
    page::{PAGE_HEADER_SIZE, PAGE_SIZE, Page},
    position::Position,
};

/// Bounds every key type must satisfy: total order for navigation, `Default`
/// for fanout probing, and the crate codec for the page format.
pub trait Key: Ord + Clone + Debug + Default + Encode + Decode<()> {}
impl<T: Ord + Clone + Debug + Default + Encode + Decode<()>> Key for T {}

/// Bounds every value type must satisfy.
pub trait Value: Clone + Debug + Default + Encode + Decode<()> {}
impl<T: Clone + Debug + Default + Encode + Decode<()>> Value for T {}

/// Payload of a node: either ordered entries or separator references with
/// one more child link than references.
#[derive(Debug, Clone, PartialEq, Encode, Decode)]
pub enum NodeBody<K, V> {
    Leaf { keys: Vec<K>, vals: Vec<V> },
    Branch { refs: Vec<K>, links: Vec<Position> },
}

/// One page's worth of tree structure.
#[derive(Debug, Clone, Encode, Decode)]
pub struct Node<K, V> {
    pub pos: Position,
    pub prev: Position,
    pub next: Position,
    pub parent: Position,
    pub body: NodeBody<K, V>,
}

impl<K: Key, V: Value> Node<K, V> {
    pub fn leaf(pos: Position) -> Self {
        Self {
            pos,
            prev: Position::POISON,
            next: Position::POISON,
            parent: Position::POISON,
            body: NodeBody::Leaf {
                keys: Vec::new(),
                vals: Vec::new(),
            },
        }
    }

    pub fn branch(pos: Position, refs: Vec<K>, links: Vec<Position>) -> Self {
        Self {
            pos,
            prev: Position::POISON,
            next: Position::POISON,
            parent: Position::POISON,
            body: NodeBody::Branch { refs, links },
        }
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self.body, NodeBody::Leaf { .. })
    }

    pub fn is_branch(&self) -> bool {
        !self.is_leaf()
    }

    /// Number of entries (leaf) or separator references (branch).
    pub fn num_filled(&self) -> usize {
        match &self.body {
            NodeBody::Leaf { keys, .. } => keys.len(),
            NodeBody::Branch { refs, .. } => refs.len(),
        }
    }

    /// Child position at `index`.
    ///
    /// # Panics
    ///
    /// Panics when called on a leaf.
    pub fn link(&self, index: usize) -> Position {
        match &self.body {
            NodeBody::Branch { links, .. } => links[index],
            NodeBody::Leaf { .. } => panic!("link() called on a leaf node"),
        }
    }

    pub fn num_links(&self) -> usize {
        match &self.body {
            NodeBody::Branch { links, .. } => links.len(),
            NodeBody::Leaf { .. } => 0,
        }
    }

    /// Separator reference at `index`.
    ///
    /// # Panics
    ///
    /// Panics when called on a leaf.
    pub fn separator(&self, index: usize) -> &K {
        match &self.body {
            NodeBody::Branch { refs, .. } => &refs[index],
            NodeBody::Leaf { .. } => panic!("separator() called on a leaf node"),
        }
    }

    pub fn set_separator(&mut self, index: usize, key: K) {
        match &mut self.body {
            NodeBody::Branch { refs, .. } => refs[index] = key,
            NodeBody::Leaf { .. } => panic!("set_separator() called on a leaf node"),
        }
    }

    /// Serializes the node into one page; the payload length lands in the
    /// reserved header.
    pub fn to_page(&self, config: CodecConfig) -> Result<Page, StorageError> {
        let payload = bincode::encode_to_vec(self, config).map_err(WriteError::Encode)?;
        let mut page = Page::zeroed();
        page.write_u32(0, payload.len() as u32)
            .expect("header within page");
        page.write_bytes(PAGE_HEADER_SIZE, &payload)
            .ok_or(WriteError::NodeOverflow)?;
        Ok(page)
    }

    /// Reconstructs a node from one page.
    pub fn from_page(page: &Page, config: CodecConfig) -> Result<Self, StorageError> {
        let len = page.read_u32(0).ok_or(ReadError::OutOfPage)? as usize;
        let payload = page
            .read_bytes(PAGE_HEADER_SIZE, len)
            .ok_or(ReadError::OutOfPage)?;
        let (node, _) = bincode::decode_from_slice(payload, config).map_err(ReadError::Decode)?;
        Ok(node)
    }
}

impl<K: PartialEq, V: PartialEq> PartialEq for Node<K, V> {
    fn eq(&self, other: &Self) -> bool {
        // Header positions compare raw so that unset links match unset links.
        self.pos.raw() == other.pos.raw()
            && self.prev.raw() == other.prev.raw()
            && self.next.raw() == other.next.raw()
            && self.parent.raw() == other.parent.raw()
            && self.body == other.body
    }
}

/// Record capacities derived from the page size (or overridden).
#[derive(Debug, Clone, Copy)]
pub struct Fanout {
    /// Most entries a leaf may hold (`m_L - 1`).
    pub leaf_records: usize,
    /// Most children a branch may hold (`m_B`).
    pub branch_links: usize,
}

impl Fanout {
    /// Most separator references a branch may hold.
    pub fn branch_records(&self) -> usize {
        self.branch_links - 1
    }

    /// Fewest entries a non-root leaf may hold.
    pub fn leaf_min(&self) -> usize {
        (self.leaf_records + 1).div_ceil(2) - 1
    }

    /// Fewest references a non-root branch may hold.
    pub fn branch_min(&self) -> usize {
        self.branch_links.div_ceil(2) - 1
    }

    /// Derives capacities for the given key/value types. A non-zero
    /// `leaf_fanout`/`branch_fanout` overrides the computation.
    pub fn compute<K: Key, V: Value>(
        leaf_fanout: usize,
        branch_fanout: usize,
        config: CodecConfig,
    ) -> Result<Fanout, StorageError> {
        let branch_links = if branch_fanout != 0 {
            branch_fanout
        } else {
            max_fitting(|links| {
                let probe: Node<K, V> = Node::branch(
                    Position::POISON,
                    vec![K::default(); links - 1],
                    vec![Position::POISON; links],
                );
                encoded_len(&probe, config)
            })?
        };

        let mut leaf_records = if leaf_fanout != 0 {
            leaf_fanout - 1
        } else {
            max_fitting(|records| {
                let probe: Node<K, V> = Node {
                    pos: Position::POISON,
                    prev: Position::POISON,
                    next: Position::POISON,
                    parent: Position::POISON,
                    body: NodeBody::Leaf {
                        keys: vec![K::default(); records],
                        vals: vec![V::default(); records],
                    },
                };
                encoded_len(&probe, config)
            })?
        };

        assert!(leaf_records >= 3, "leaf fanout too small to split");
        assert!(branch_links >= 4, "branch fanout too small to split");

        // A split leaf must distribute under the branch fanout.
        let branch_records = branch_links - 1;
        if leaf_records - 1 >= 2 * branch_records {
            leaf_records = 2 * branch_records - 1;
        }

        Ok(Fanout {
            leaf_records,
            branch_links,
        })
    }
}

fn encoded_len<K: Key, V: Value>(
    node: &Node<K, V>,
    config: CodecConfig,
) -> Result<usize, StorageError> {
    Ok(bincode::encode_to_vec(node, config)
        .map_err(WriteError::Encode)?
        .len())
}

const USABLE: usize = PAGE_SIZE - PAGE_HEADER_SIZE;

/// Largest `n` for which `probe(n)` still fits the usable page region.
fn max_fitting(
    mut probe: impl FnMut(usize) -> Result<usize, StorageError>,
) -> Result<usize, StorageError> {
    let (mut low, mut high) = (2_usize, PAGE_SIZE);
    let mut best = 0;
    while low <= high {
        let mid = (low + high) / 2;
        if probe(mid)? <= USABLE {
            best = mid;
            low = mid + 1;
        } else {
            high = mid - 1;
        }
    }
    Ok(best)
}

#[cfg(test)]
mod tests {
    use crate::storage::codec_config;

    use super::*;

    #[test]
    fn leaf_round_trips_through_a_page() {
        let config = codec_config();
        let mut node: Node<i32, i32> = Node::leaf(Position::new(PAGE_SIZE as u64));
        if let NodeBody::Leaf { keys, vals } = &mut node.body {
            keys.extend([1, 5, 9]);
            vals.extend([10, 50, 90]);
        }
        node.next = Position::new(2 * PAGE_SIZE as u64);

        let page = node.to_page(config).unwrap();
        let back = Node::<i32, i32>::from_page(&page, config).unwrap();
        assert_eq!(back, node);
    }

    #[test]
    fn branch_round_trips_through_a_page() {
        let config = codec_config();
        let node: Node<i32, i32> = Node::branch(
            Position::new(0),
            vec![7, 21],
            vec![
                Position::new(PAGE_SIZE as u64),
                Position::new(2 * PAGE_SIZE as u64),
                Position::new(3 * PAGE_SIZE as u64),
            ],
        );

        let page = node.to_page(config).unwrap();
        let back = Node::<i32, i32>::from_page(&page, config).unwrap();
        assert_eq!(back, node);
    }

    #[test]
    fn unset_links_survive_the_codec() {
        let config = codec_config();
        let node: Node<i32, i32> = Node::leaf(Position::new(0));

        let page = node.to_page(config).unwrap();
        let back = Node::<i32, i32>::from_page(&page, config).unwrap();
        assert!(!back.prev.is_set());
        assert!(!back.next.is_set());
        assert!(!back.parent.is_set());
    }

    #[test]
    fn computed_fanouts_fill_one_page() {
        let config = codec_config();
        let fanout = Fanout::compute::<i64, i64>(0, 0, config).unwrap();

        // A fully populated leaf fits...
        let full: Node<i64, i64> = Node {
            pos: Position::POISON,
            prev: Position::POISON,
            next: Position::POISON,
            parent: Position::POISON,
            body: NodeBody::Leaf {
                keys: vec![0; fanout.leaf_records],
                vals: vec![0; fanout.leaf_records],
            },
        };
        assert!(full.to_page(config).is_ok());

        // ...and one more record does not.
        let over: Node<i64, i64> = Node {
            body: NodeBody::Leaf {
                keys: vec![0; fanout.leaf_records + 1],
                vals: vec![0; fanout.leaf_records + 1],
            },
            ..full
        };
        assert!(over.to_page(config).is_err());
    }

    #[test]
    fn computed_branch_fanout_fills_one_page() {
        let config = codec_config();
        let fanout = Fanout::compute::<i64, i64>(0, 0, config).unwrap();

        let full: Node<i64, i64> = Node::branch(
            Position::POISON,
            vec![0; fanout.branch_links - 1],
            vec![Position::POISON; fanout.branch_links],
        );
        assert!(full.to_page(config).is_ok());

        let over: Node<i64, i64> = Node::branch(
            Position::POISON,
            vec![0; fanout.branch_links],
            vec![Position::POISON; fanout.branch_links + 1],
        );
        assert!(over.to_page(config).is_err());
    }

    #[test]
    fn leaf_fanout_is_clamped_to_split_under_branches() {
        let config = codec_config();
        // Zero-sized values make leaves far roomier than branches, which
        // forces the clamp.
        let fanout = Fanout::compute::<i32, ()>(0, 0, config).unwrap();
        assert_eq!(fanout.leaf_records, 2 * fanout.branch_records() - 1);

        // Bulky values keep leaves below the threshold; nothing is clamped
        // upward.
        let fanout = Fanout::compute::<i64, [u64; 16]>(0, 0, config).unwrap();
        assert!(fanout.leaf_records - 1 < 2 * fanout.branch_records());
    }

    #[test]
    fn overrides_bypass_the_computation() {
        let config = codec_config();
        let fanout = Fanout::compute::<i32, i32>(5, 4, config).unwrap();
        assert_eq!(fanout.leaf_records, 4);
        assert_eq!(fanout.branch_links, 4);
        assert_eq!(fanout.leaf_min(), 2);
        assert_eq!(fanout.branch_min(), 1);
    }

    #[test]
    fn minimums_follow_the_fill_rule() {
        let fanout = Fanout {
            leaf_records: 4,
            branch_links: 5,
        };
        // ceil(m/2) - 1 with m = 5.
        assert_eq!(fanout.leaf_min(), 2);
        assert_eq!(fanout.branch_min(), 2);
    }
}
