//! Received-chunk tracking for a single receive session.

/// Bitset of chunk indices received so far.
///
/// Uses `Vec<u64>` words: `words[idx / 64] & (1 << (idx % 64))`. The count of
/// set bits is cached so completeness checks are O(1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkBitmap {
    words: Vec<u64>,
    total: u32,
    received: u32,
}

impl ChunkBitmap {
    /// Create an empty bitmap for `total` chunks.
    #[must_use]
    pub fn new(total: u32) -> Self {
        let words = (total as usize).div_ceil(64);
        Self {
            words: vec![0u64; words],
            total,
            received: 0,
        }
    }

    /// Total number of chunks tracked.
    #[must_use]
    pub fn total(&self) -> u32 {
        self.total
    }

    /// Number of chunks marked as received.
    #[must_use]
    pub fn received(&self) -> u32 {
        self.received
    }

    /// Whether `index` has been received. Out-of-range indices are never set.
    #[must_use]
    pub fn contains(&self, index: u32) -> bool {
        index < self.total && self.words[(index / 64) as usize] & (1u64 << (index % 64)) != 0
    }

    /// Mark `index` as received.
    ///
    /// Returns `true` if the bit was newly set, `false` for duplicates and
    /// out-of-range indices.
    pub fn insert(&mut self, index: u32) -> bool {
        if index >= self.total || self.contains(index) {
            return false;
        }
        self.words[(index / 64) as usize] |= 1u64 << (index % 64);
        self.received += 1;
        true
    }

    /// Mark every index below `end` as received (used when resuming).
    pub fn fill_prefix(&mut self, end: u32) {
        for index in 0..end.min(self.total) {
            self.insert(index);
        }
    }

    /// First index that has not been received, if any.
    #[must_use]
    pub fn first_missing(&self) -> Option<u32> {
        for (word_idx, &word) in self.words.iter().enumerate() {
            if word == u64::MAX {
                continue;
            }
            let index = word_idx as u64 * 64 + u64::from((!word).trailing_zeros());
            if index < u64::from(self.total) {
                return Some(index as u32);
            }
        }
        None
    }

    /// Length of the contiguous run of received chunks starting at zero.
    ///
    /// This is the `nextChunkIndex` persisted in checkpoints.
    #[must_use]
    pub fn contiguous_prefix(&self) -> u32 {
        self.first_missing().unwrap_or(self.total)
    }

    /// Whether all chunks have been received.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.received == self.total
    }
}
