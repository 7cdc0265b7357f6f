//! The set-of-piece-indices datatype and its algebra.
//!
//! A [`Bitfield`] tracks which pieces of a torrent a peer (or we) have. It
//! wraps a dense [`bitvec`] bitmap the same way the engine's peer-wire layer
//! already represents piece availability (see the `Bitfield` type alias this
//! module replaces), but additionally carries an explicit `total_count` so
//! that bits beyond the torrent's piece count are never observable, even
//! when a peer's wire encoding padded them to a byte boundary.

use bitvec::prelude::{BitVec, Msb0};

/// The underlying bit storage: most-significant-bit first, byte-addressed,
/// matching the wire representation of the `bitfield` peer message.
pub type BitStore = BitVec<Msb0, u8>;

/// A set of piece indices backed by a dense bitmap.
///
/// All operations behave as if the bitfield were exactly `total_count` bits
/// wide; indices at or beyond `total_count` are never inserted, tested, or
/// reported by iteration, even if the backing storage happens to be longer
/// (e.g. right after decoding a byte-aligned wire message).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Bitfield {
    total_count: usize,
    bits: BitStore,
}

impl Bitfield {
    /// Creates an empty bitfield with room for exactly `total_count` pieces.
    pub fn new(total_count: usize) -> Self {
        Self {
            total_count,
            bits: BitStore::repeat(false, total_count),
        }
    }

    /// Creates a bitfield where every piece is marked as present.
    pub fn full(total_count: usize) -> Self {
        Self {
            total_count,
            bits: BitStore::repeat(true, total_count),
        }
    }

    /// Reconstructs a bitfield from a raw wire payload (e.g. the body of a
    /// `bitfield` peer message). The resulting bitfield's capacity is the
    /// payload's bit length (`bytes.len() * 8`); call [`Self::adjust_size`]
    /// with the torrent's real piece count before using it, as the payload
    /// may have been padded to a byte boundary by the sender.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut bits = BitStore::from_vec(bytes.to_vec());
        let total_count = bits.len();
        // `from_vec` never fails to preserve length, but keep it explicit so
        // a change of representation can't silently break the invariant.
        bits.resize(total_count, false);
        Self { total_count, bits }
    }

    /// Serializes the bitfield to its wire form: `ceil(total_count / 8)`
    /// bytes, with any spare high bits in the last byte cleared.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bits = self.bits.clone();
        let byte_len = (self.total_count + 7) / 8;
        bits.resize(byte_len * 8, false);
        bits.into_vec()
    }

    /// The capacity of this bitfield, i.e. the torrent's piece count.
    pub fn total_count(&self) -> usize {
        self.total_count
    }

    /// The number of pieces marked present.
    pub fn count_ones(&self) -> usize {
        (0..self.total_count).filter(|&i| self.bits[i]).count()
    }

    /// Returns `true` if every piece in `[0, total_count)` is present.
    pub fn have_all(&self) -> bool {
        self.total_count == 0 || (0..self.total_count).all(|i| self.bits[i])
    }

    /// Returns `true` if no piece is present.
    pub fn have_none(&self) -> bool {
        (0..self.total_count).all(|i| !self.bits[i])
    }

    /// Returns `true` if `index` is present. Out-of-range indices are never
    /// present.
    pub fn test(&self, index: usize) -> bool {
        index < self.total_count && self.bits[index]
    }

    /// Marks `index` as present.
    ///
    /// # Panics
    ///
    /// Panics if `index >= total_count()`.
    pub fn insert(&mut self, index: usize) {
        assert!(index < self.total_count, "piece index out of bounds");
        self.bits.set(index, true);
    }

    /// Clears `index`.
    ///
    /// # Panics
    ///
    /// Panics if `index >= total_count()`.
    pub fn remove(&mut self, index: usize) {
        assert!(index < self.total_count, "piece index out of bounds");
        self.bits.set(index, false);
    }

    /// The smallest present index, if any.
    pub fn find_min(&self) -> Option<usize> {
        (0..self.total_count).find(|&i| self.bits[i])
    }

    /// The largest present index, if any.
    pub fn find_max(&self) -> Option<usize> {
        (0..self.total_count).rev().find(|&i| self.bits[i])
    }

    /// The fraction of pieces present, in `[0, 1]`. Returns `0.0` for an
    /// empty (zero-capacity) bitfield.
    pub fn completeness(&self) -> f64 {
        if self.total_count == 0 {
            0.0
        } else {
            self.count_ones() as f64 / self.total_count as f64
        }
    }

    /// Resizes the bitfield's capacity to `new_total_count`, preserving
    /// members that remain in range and dropping (zeroing) any bits beyond
    /// it. This is the operation a peer-wire decode must apply before
    /// exposing a freshly parsed bitfield, since wire payloads are
    /// byte-aligned and may carry spare high bits past the real piece count.
    pub fn adjust_size(&mut self, new_total_count: usize) {
        self.bits.resize(new_total_count, false);
        self.total_count = new_total_count;
    }

    /// Returns an iterator over the present piece indices, in ascending
    /// order.
    pub fn iter_ones(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.total_count).filter(move |&i| self.bits[i])
    }

    fn zip_same_size(&self, other: &Self) -> std::ops::Range<usize> {
        debug_assert_eq!(
            self.total_count, other.total_count,
            "bitfield algebra requires operands of equal total_count"
        );
        0..self.total_count
    }

    /// The set union: pieces present in `self` or `other`.
    ///
    /// Both operands must share the same `total_count`.
    pub fn union(&self, other: &Self) -> Self {
        let range = self.zip_same_size(other);
        let mut out = Self::new(self.total_count);
        for i in range {
            if self.bits[i] || other.bits[i] {
                out.bits.set(i, true);
            }
        }
        out
    }

    /// The set intersection: pieces present in both `self` and `other`.
    ///
    /// Both operands must share the same `total_count`.
    pub fn intersection(&self, other: &Self) -> Self {
        let range = self.zip_same_size(other);
        let mut out = Self::new(self.total_count);
        for i in range {
            if self.bits[i] && other.bits[i] {
                out.bits.set(i, true);
            }
        }
        out
    }

    /// The set difference: pieces present in `self` but not in `other`.
    ///
    /// Both operands must share the same `total_count`.
    pub fn difference(&self, other: &Self) -> Self {
        let range = self.zip_same_size(other);
        let mut out = Self::new(self.total_count);
        for i in range {
            if self.bits[i] && !other.bits[i] {
                out.bits.set(i, true);
            }
        }
        out
    }
}

/// Picks the rarest piece across a list of bitfields: the index present in
/// strictly fewer than `bitfields.len()` of them, with the lowest presence
/// count (ties broken by smallest index).
///
/// Indices are considered up to the *largest* `total_count` among the
/// inputs; a bitfield that is shorter than that is treated as not having any
/// of the indices past its own capacity. Returns `None` if `bitfields` is
/// empty, or if every piece is either present everywhere or present
/// nowhere (no informative rarity signal).
pub fn rarest(bitfields: &[Bitfield]) -> Option<usize> {
    let max_total = bitfields.iter().map(Bitfield::total_count).max()?;
    if max_total == 0 {
        return None;
    }

    let mut counts = vec![0usize; max_total];
    for bf in bitfields {
        for i in 0..bf.total_count() {
            if bf.test(i) {
                counts[i] += 1;
            }
        }
    }

    let n = bitfields.len();
    counts
        .iter()
        .enumerate()
        .filter(|(_, &count)| count > 0 && count < n)
        .min_by_key(|(index, &count)| (count, *index))
        .map(|(index, _)| index)
}
