pub mod placement_algorithms;

use crate::mem::PhysicalMemory;
use crate::sync::mutex::Mutex;
use alloc::{boxed::Box, vec};
use bitbybit::bitfield;
use kidneyos_shared::mem::{PhysicalPage, PAGE_FRAME_SIZE};
use kidneyos_shared::paging::MAX_FRAME_NUMBER;
use placement_algorithms::{FirstFit, PlacementAlgorithm};

#[bitfield(u8, default = 0)]
pub struct CoreMapEntry {
    #[bit(0, rw)]
    allocated: bool,
    #[bit(2, rw)]
    is_user: bool,
}

struct FramePoolState<P> {
    frames: Box<[u8]>,
    core_map: Box<[CoreMapEntry]>,
    placement_algorithm: P,
    frames_allocated: usize,
}

impl<P> FramePoolState<P> {
    fn bytes(&mut self, page: PhysicalPage, offset: usize, len: usize) -> &mut [u8] {
        let index = page.number() as usize;
        assert!(
            index < self.core_map.len() && self.core_map[index].allocated(),
            "access to unallocated frame {index}"
        );
        assert!(offset + len <= PAGE_FRAME_SIZE, "access past end of frame");
        let start = index * PAGE_FRAME_SIZE + offset;
        &mut self.frames[start..start + len]
    }
}

/// A fixed pool of page frames tracked by a core map.
pub struct FramePool<P: PlacementAlgorithm = FirstFit> {
    state: Mutex<FramePoolState<P>>,
}

impl<P: PlacementAlgorithm> FramePool<P> {
    pub fn new(num_frames: usize) -> Self {
        assert!(
            num_frames <= MAX_FRAME_NUMBER as usize + 1,
            "{num_frames} frames cannot be addressed by a page table entry"
        );
        Self {
            state: Mutex::new(FramePoolState {
                frames: vec![0; num_frames * PAGE_FRAME_SIZE].into_boxed_slice(),
                core_map: vec![CoreMapEntry::DEFAULT; num_frames].into_boxed_slice(),
                placement_algorithm: P::default(),
                frames_allocated: 0,
            }),
        }
    }

    pub fn frames_allocated(&self) -> usize {
        self.state.lock().frames_allocated
    }
}

impl<P: PlacementAlgorithm> PhysicalMemory for FramePool<P> {
    fn alloc_user_page(&self, zero: bool) -> Option<PhysicalPage> {
        let mut state = self.state.lock();
        let state = &mut *state;

        let index = state.placement_algorithm.place(&state.core_map)?;
        assert!(!state.core_map[index].allocated());
        state.core_map[index] = state.core_map[index]
            .with_allocated(true)
            .with_is_user(true);
        state.frames_allocated += 1;

        // The frame number fits in a u32, `new` checked the pool size.
        #[allow(clippy::cast_possible_truncation)]
        let page = PhysicalPage(index as u32);
        if zero {
            state.bytes(page, 0, PAGE_FRAME_SIZE).fill(0);
        }
        Some(page)
    }

    fn free_user_page(&self, page: PhysicalPage) {
        let mut state = self.state.lock();
        let index = page.number() as usize;
        let entry = state.core_map[index];
        assert!(
            entry.allocated() && entry.is_user(),
            "freeing frame {index} which is not an allocated user frame"
        );
        state.core_map[index] = CoreMapEntry::DEFAULT;
        state.frames_allocated -= 1;
    }

    fn read(&self, page: PhysicalPage, offset: usize, dst: &mut [u8]) {
        let mut state = self.state.lock();
        dst.copy_from_slice(state.bytes(page, offset, dst.len()));
    }

    fn write(&self, page: PhysicalPage, offset: usize, src: &[u8]) {
        let mut state = self.state.lock();
        state.bytes(page, offset, src.len()).copy_from_slice(src);
    }

    fn zero(&self, page: PhysicalPage) {
        self.state.lock().bytes(page, 0, PAGE_FRAME_SIZE).fill(0);
    }
}
