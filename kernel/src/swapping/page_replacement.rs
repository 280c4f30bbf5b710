use crate::mem::frame_table::FrameId;
use alloc::collections::VecDeque;

pub trait PageReplacementPolicy {
    /// Start tracking a newly registered frame.
    fn insert(&mut self, frame: FrameId);

    /// Stop tracking `frame`.
    fn remove(&mut self, frame: FrameId);

    /// Proposes the next eviction candidate without removing it.
    ///
    /// `take_accessed` must report whether the frame was used since it was
    /// last asked, and clear that state.
    fn candidate(&mut self, take_accessed: &mut dyn FnMut(FrameId) -> bool) -> Option<FrameId>;

    /// The last candidate cannot be evicted right now; move past it.
    fn skip(&mut self);
}

/// Second-chance (clock) replacement.
///
/// Frames sit in allocation order with the clock hand at the front. A frame
/// whose accessed bit is set gets the bit cleared and goes to the back; the
/// first frame found with a clear bit is the candidate.
#[derive(Debug, Default)]
pub struct SecondChance {
    queue: VecDeque<FrameId>,
}

impl SecondChance {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

impl PageReplacementPolicy for SecondChance {
    fn insert(&mut self, frame: FrameId) {
        self.queue.push_back(frame);
    }

    fn remove(&mut self, frame: FrameId) {
        if let Some(position) = self.queue.iter().position(|&f| f == frame) {
            self.queue.remove(position);
        }
    }

    fn candidate(&mut self, take_accessed: &mut dyn FnMut(FrameId) -> bool) -> Option<FrameId> {
        // After one full lap every bit has been cleared, so this terminates
        // within two laps.
        for _ in 0..=self.queue.len() * 2 {
            let frame = *self.queue.front()?;
            if !take_accessed(frame) {
                return Some(frame);
            }
            self.queue.rotate_left(1);
        }
        None
    }

    fn skip(&mut self) {
        if !self.queue.is_empty() {
            self.queue.rotate_left(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn frame(index: u32) -> FrameId {
        FrameId::new(index, 0)
    }

    #[test]
    fn test_prefers_unreferenced_frames() {
        let mut policy = SecondChance::new();
        for i in 0..3 {
            policy.insert(frame(i));
        }
        let mut accessed: BTreeSet<FrameId> = [frame(0), frame(2)].into();
        let mut take = |f| accessed.remove(&f);
        assert_eq!(policy.candidate(&mut take), Some(frame(1)));
    }

    #[test]
    fn test_all_referenced_falls_back_to_oldest() {
        let mut policy = SecondChance::new();
        for i in 0..3 {
            policy.insert(frame(i));
        }
        let mut accessed: BTreeSet<FrameId> = (0..3).map(frame).collect();
        let mut take = |f| accessed.remove(&f);
        // The first lap clears every bit, the second picks the oldest frame.
        assert_eq!(policy.candidate(&mut take), Some(frame(0)));
        policy.remove(frame(0));
        assert_eq!(policy.candidate(&mut take), Some(frame(1)));
    }

    #[test]
    fn test_skip_moves_past_candidate() {
        let mut policy = SecondChance::new();
        policy.insert(frame(0));
        policy.insert(frame(1));
        let mut never = |_| false;
        assert_eq!(policy.candidate(&mut never), Some(frame(0)));
        policy.skip();
        assert_eq!(policy.candidate(&mut never), Some(frame(1)));
    }

    #[test]
    fn test_empty_policy() {
        let mut policy = SecondChance::new();
        assert_eq!(policy.candidate(&mut |_| false), None);
        policy.skip();
        assert!(policy.is_empty());
    }
}
