//! Implementation of some common frame placement policies.
//!
//! User pages are handed out one frame at a time, so a policy only has to pick
//! which free frame to use next.

use super::CoreMapEntry;

/// A placement algorithm for allocating frames.
pub trait PlacementAlgorithm: Default + Send {
    /// Returns the frame number of a free frame, or `None` if every frame is
    /// allocated.
    fn place(&mut self, core_map: &[CoreMapEntry]) -> Option<usize>;
}

#[derive(Default)]
pub struct NextFit {
    /// The next frame number to start searching for free frames.
    position: usize,
}

// There is no internal data for this algorithm. Declare it as a zero-sized type.
#[derive(Default)]
pub struct FirstFit;

impl PlacementAlgorithm for NextFit {
    fn place(&mut self, core_map: &[CoreMapEntry]) -> Option<usize> {
        let total_frames = core_map.len();
        if total_frames == 0 {
            return None;
        }

        let start = self.position % total_frames;
        let found = (start..total_frames)
            .chain(0..start)
            .find(|&i| !core_map[i].allocated())?;

        self.position = (found + 1) % total_frames;
        Some(found)
    }
}

impl PlacementAlgorithm for FirstFit {
    fn place(&mut self, core_map: &[CoreMapEntry]) -> Option<usize> {
        core_map.iter().position(|entry| !entry.allocated())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::ops::Range;

    /// Fills the coremap entries in `range` to indicate they are allocated.
    fn fill_coremap_range(core_map: &mut [CoreMapEntry], range: Range<usize>) {
        for i in range {
            assert!(!core_map[i].allocated());
            core_map[i] = core_map[i].with_allocated(true);
        }
    }

    #[test]
    fn test_next_fit() {
        let mut core_map = [CoreMapEntry::default(); 16];
        fill_coremap_range(&mut core_map, 1..4);
        fill_coremap_range(&mut core_map, 8..12);

        let mut algorithm = NextFit::default();
        assert_eq!(algorithm.place(&core_map), Some(0));
        fill_coremap_range(&mut core_map, 0..1);

        // Searching resumes after the frame handed out last.
        assert_eq!(algorithm.place(&core_map), Some(4));
        core_map[0] = core_map[0].with_allocated(false);
        assert_eq!(algorithm.place(&core_map), Some(5));
    }

    #[test]
    fn test_next_fit_wrap_around() {
        let mut core_map = [CoreMapEntry::default(); 16];
        fill_coremap_range(&mut core_map, 1..16);
        let mut algorithm = NextFit { position: 8 };
        assert_eq!(algorithm.place(&core_map), Some(0));
        fill_coremap_range(&mut core_map, 0..1);
        assert_eq!(algorithm.place(&core_map), None);
    }

    #[test]
    fn test_first_fit() {
        let mut core_map = [CoreMapEntry::default(); 16];
        fill_coremap_range(&mut core_map, 0..4);
        fill_coremap_range(&mut core_map, 5..16);

        let mut algorithm = FirstFit;
        assert_eq!(algorithm.place(&core_map), Some(4));
        fill_coremap_range(&mut core_map, 4..5);
        assert_eq!(algorithm.place(&core_map), None);

        core_map[2] = core_map[2].with_allocated(false);
        assert_eq!(algorithm.place(&core_map), Some(2));
    }

    #[test]
    fn test_empty_core_map() {
        assert_eq!(NextFit::default().place(&[]), None);
        assert_eq!(FirstFit.place(&[]), None);
    }
}
