//! Opaque offsets into the backing file.

use std::cmp::Ordering;
use std::fmt;

use bincode::{Decode, Encode};

/// A 64-bit file offset, page-aligned when referring to whole pages.
///
/// A distinguished [`POISON`](Position::POISON) value marks "unset". Poisoned
/// positions compare unequal to every position, including another poisoned
/// one, so equality behaves like a NaN check: `a == b` implies both sides are
/// set. Code that needs a total order or hashing works on [`raw`](Position::raw)
/// offsets instead.
#[derive(Debug, Clone, Copy, Encode, Decode)]
pub struct Position(u64);

impl Position {
    pub const POISON: Position = Position(u64::MAX);

    pub fn new(offset: u64) -> Self {
        debug_assert!(offset != u64::MAX, "offset collides with the poison value");
        Position(offset)
    }

    /// Whether this position refers to an actual offset.
    pub fn is_set(&self) -> bool {
        self.0 != u64::MAX
    }

    /// The underlying offset, poison included.
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl PartialEq for Position {
    fn eq(&self, other: &Self) -> bool {
        self.is_set() && other.is_set() && self.0 == other.0
    }
}

impl PartialEq<u64> for Position {
    fn eq(&self, other: &u64) -> bool {
        self.is_set() && self.0 == *other
    }
}

impl PartialOrd for Position {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        if self.is_set() && other.is_set() {
            self.0.partial_cmp(&other.0)
        } else {
            None
        }
    }
}

impl From<u64> for Position {
    fn from(offset: u64) -> Self {
        Position::new(offset)
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_set() {
            write!(f, "{}", self.0)
        } else {
            write!(f, "<poison>")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_positions_compare_as_integers() {
        let a = Position::new(4096);
        let b = Position::new(4096);
        let c = Position::new(8192);

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a < c);
    }

    #[test]
    fn poison_compares_unequal_to_everything() {
        let poison = Position::POISON;

        assert_ne!(poison, Position::new(0));
        assert_ne!(poison, Position::POISON);
        assert!(!poison.is_set());
        assert!(poison.partial_cmp(&Position::new(0)).is_none());
    }

    #[test]
    fn round_trips_through_codec() {
        let config = crate::storage::codec_config();
        let pos = Position::new(12 * 4096);

        let bytes = bincode::encode_to_vec(pos, config).unwrap();
        let (back, _): (Position, usize) = bincode::decode_from_slice(&bytes, config).unwrap();
        assert_eq!(pos, back);
    }
}
