use alloc::{vec, vec::Vec};

/// Occupancy bitmap over swap slots. A set bit means the slot is in use.
#[derive(Debug, Clone)]
pub struct SlotBitmap {
    words: Vec<u64>,
    len: u32,
    used: u32,
}

impl SlotBitmap {
    pub fn new(len: u32) -> Self {
        Self {
            words: vec![0; len.div_ceil(64) as usize],
            len,
            used: 0,
        }
    }

    pub fn len(&self) -> u32 {
        self.len
    }

    pub fn used(&self) -> u32 {
        self.used
    }

    /// Finds the lowest clear bit, sets it and returns its index.
    pub fn scan_and_set(&mut self) -> Option<u32> {
        let (word_index, word) = self
            .words
            .iter_mut()
            .enumerate()
            .find(|(_, word)| **word != u64::MAX)?;
        let bit = word.trailing_ones();
        // `word_index` is bounded by `len / 64`, which is a u32.
        #[allow(clippy::cast_possible_truncation)]
        let index = word_index as u32 * 64 + bit;
        // Bits past `len` in the last word are never set, so they show up here.
        if index >= self.len {
            return None;
        }
        *word |= 1 << bit;
        self.used += 1;
        Some(index)
    }

    pub fn test(&self, index: u32) -> bool {
        index < self.len && self.words[(index / 64) as usize] & (1 << (index % 64)) != 0
    }

    /// Clears the bit for `index`. Returns `false`, changing nothing, if it was already clear.
    pub fn reset(&mut self, index: u32) -> bool {
        if !self.test(index) {
            return false;
        }
        self.words[(index / 64) as usize] &= !(1 << (index % 64));
        self.used -= 1;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_fit_and_reuse() {
        let mut bitmap = SlotBitmap::new(70);
        for expected in 0..70 {
            assert_eq!(bitmap.scan_and_set(), Some(expected));
        }
        assert_eq!(bitmap.scan_and_set(), None);
        assert_eq!(bitmap.used(), 70);

        assert!(bitmap.reset(65));
        assert!(bitmap.reset(3));
        // Lowest free slot first.
        assert_eq!(bitmap.scan_and_set(), Some(3));
        assert_eq!(bitmap.scan_and_set(), Some(65));
    }

    #[test]
    fn test_reset_free_slot_is_noop() {
        let mut bitmap = SlotBitmap::new(8);
        assert!(!bitmap.reset(2));
        assert!(!bitmap.reset(100));
        assert_eq!(bitmap.used(), 0);
        assert_eq!(bitmap.scan_and_set(), Some(0));
    }

    #[test]
    fn test_empty_bitmap() {
        let mut bitmap = SlotBitmap::new(0);
        assert_eq!(bitmap.scan_and_set(), None);
        assert!(!bitmap.test(0));
    }
}
