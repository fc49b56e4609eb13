//! Byte-serialised index bitsets for the sampled-tick wire records.

use bit_vec::BitVec;

/// Packs sorted flat indices into a little-endian-bit bitset byte array.
///
/// Bit `i % 8` of byte `i / 8` marks index `i`. The array is sized to the
/// highest index present, an empty set is an empty array.
pub fn bitset_bytes(indices: &[u32]) -> Vec<u8> {
    let max = match indices.last() {
        Some(max) => *max as usize,
        None => return Vec::new(),
    };
    let mut bytes = vec![0u8; max / 8 + 1];
    for &i in indices {
        bytes[i as usize / 8] |= 1 << (i % 8);
    }
    bytes
}

/// Expands a bitset byte array back into sorted indices.
pub fn bitset_indices(bytes: &[u8]) -> Vec<u32> {
    let mut indices = Vec::new();
    for (byte_idx, byte) in bytes.iter().enumerate() {
        let mut rest = *byte;
        while rest != 0 {
            let bit = rest.trailing_zeros();
            indices.push(byte_idx as u32 * 8 + bit);
            rest &= rest - 1;
        }
    }
    indices
}

/// A dirty-index tracker over a fixed-size grid.
///
/// Pairs a bitset with the list of set positions so that both membership
/// tests and extraction/reset stay proportional to the number of dirty
/// cells, not the grid volume.
#[derive(Debug, Clone)]
pub struct ChangeTracker {
    bits: BitVec,
    dirty: Vec<u32>,
}

impl ChangeTracker {
    /// Creates a tracker for `len` cells, all clean.
    pub fn new(len: usize) -> ChangeTracker {
        ChangeTracker {
            bits: BitVec::from_elem(len, false),
            dirty: Vec::new(),
        }
    }

    /// Marks index `i` dirty.
    pub fn mark(&mut self, i: u32) {
        if !self.bits.get(i as usize).unwrap_or(false) {
            self.bits.set(i as usize, true);
            self.dirty.push(i);
        }
    }

    /// Whether index `i` is dirty.
    pub fn contains(&self, i: u32) -> bool {
        self.bits.get(i as usize).unwrap_or(false)
    }

    /// Number of dirty indices.
    pub fn len(&self) -> usize {
        self.dirty.len()
    }

    /// Whether nothing is dirty.
    pub fn is_empty(&self) -> bool {
        self.dirty.is_empty()
    }

    /// A sorted copy of the dirty indices, the tracker is left untouched.
    pub fn sorted_indices(&self) -> Vec<u32> {
        let mut copy = self.dirty.clone();
        copy.sort_unstable();
        copy
    }

    /// Returns the dirty indices sorted ascending, then clears the tracker.
    pub fn drain_sorted(&mut self) -> Vec<u32> {
        let mut taken = std::mem::take(&mut self.dirty);
        for &i in &taken {
            self.bits.set(i as usize, false);
        }
        taken.sort_unstable();
        taken
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bitset_roundtrip() {
        let indices = vec![0, 3, 8, 64, 65];
        let bytes = bitset_bytes(&indices);
        assert_eq!(bytes.len(), 9);
        assert_eq!(bitset_indices(&bytes), indices);
        assert!(bitset_bytes(&[]).is_empty());
        assert!(bitset_indices(&[]).is_empty());
    }

    #[test]
    fn tracker_drains_sorted_and_resets() {
        let mut tracker = ChangeTracker::new(128);
        for &i in &[100u32, 2, 2, 77] {
            tracker.mark(i);
        }
        assert_eq!(tracker.len(), 3);
        assert!(tracker.contains(77));
        assert_eq!(tracker.drain_sorted(), vec![2, 77, 100]);
        assert!(tracker.is_empty());
        assert!(!tracker.contains(77));
    }
}
