//! Every physical frame currently backing a user page.
//!
//! Lock order is page table, then frame table. Eviction runs with the frame
//! table locked and may only `try_lock` a victim's page table, except for the
//! page table its caller already holds, which is passed in as `held`.

use crate::block::block_core::BlockOp;
use crate::mem::page_table::{AddressSpace, PageStatus, PageTable};
use crate::mem::{PhysicalMemory, Result, VmError};
use crate::swapping::page_replacement::{PageReplacementPolicy, SecondChance};
use crate::swapping::{SlotId, SwapStore};
use crate::sync::mutex::Mutex;
use crate::threading::process::Asid;
use alloc::{sync::Weak, vec::Vec};
use core::{fmt, hint::spin_loop, mem};
use kidneyos_shared::mem::{PhysicalPage, VirtPageNum, PAGE_FRAME_SIZE};
use log::{debug, error, trace};

/// Default rounds of victim selection before eviction reports
/// [`VmError::VictimsBusy`]. Each round drops the frame table lock so that page
/// tables held elsewhere can be released.
pub const EVICTION_RETRIES: usize = 1024;

/// Handle to a registered frame. Handles are never reused: once the frame is
/// freed or evicted, its handle no longer resolves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FrameId {
    index: u32,
    generation: u32,
}

impl FrameId {
    pub const fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    pub const fn index(self) -> u32 {
        self.index
    }
}

impl fmt::Display for FrameId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.index, self.generation)
    }
}

/// The virtual page a frame backs.
#[derive(Debug, Clone)]
pub struct FrameOwner {
    pub space: Weak<AddressSpace>,
    pub asid: Asid,
    pub vpn: VirtPageNum,
}

/// A frame handed out by [`FrameTable::allocate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame {
    pub id: FrameId,
    pub page: PhysicalPage,
}

#[derive(Debug)]
struct FrameEntry {
    page: PhysicalPage,
    owner: FrameOwner,
    accessed: bool,
}

#[derive(Debug, Default)]
struct FrameCell {
    generation: u32,
    entry: Option<FrameEntry>,
}

#[derive(Default)]
struct FrameTableInner {
    cells: Vec<FrameCell>,
    vacant: Vec<u32>,
    policy: SecondChance,
    len: usize,
}

impl FrameTableInner {
    fn insert(&mut self, page: PhysicalPage, owner: FrameOwner) -> FrameId {
        let index = self.vacant.pop().unwrap_or_else(|| {
            self.cells.push(FrameCell::default());
            // Bounded by the number of physical frames.
            #[allow(clippy::cast_possible_truncation)]
            let index = (self.cells.len() - 1) as u32;
            index
        });
        let cell = &mut self.cells[index as usize];
        assert!(cell.entry.is_none(), "vacant frame cell {index} is occupied");
        cell.entry = Some(FrameEntry {
            page,
            owner,
            accessed: true,
        });
        let id = FrameId::new(index, cell.generation);
        self.policy.insert(id);
        self.len += 1;
        id
    }

    fn get_mut(&mut self, id: FrameId) -> Option<&mut FrameEntry> {
        self.cells
            .get_mut(id.index as usize)
            .filter(|cell| cell.generation == id.generation)?
            .entry
            .as_mut()
    }

    fn remove(&mut self, id: FrameId) -> Option<FrameEntry> {
        let cell = self
            .cells
            .get_mut(id.index as usize)
            .filter(|cell| cell.generation == id.generation)?;
        let entry = cell.entry.take()?;
        cell.generation = cell.generation.wrapping_add(1);
        self.vacant.push(id.index);
        self.policy.remove(id);
        self.len -= 1;
        Some(entry)
    }

    fn candidate(&mut self) -> Option<FrameId> {
        let cells = &mut self.cells;
        self.policy.candidate(&mut |id| {
            let Some(entry) = cells[id.index as usize].entry.as_mut() else {
                panic!("replacement policy tracks unregistered frame {id}");
            };
            mem::replace(&mut entry.accessed, false)
        })
    }
}

pub struct FrameTable<M: PhysicalMemory> {
    memory: M,
    inner: Mutex<FrameTableInner>,
    eviction_retries: usize,
}

impl<M: PhysicalMemory> FrameTable<M> {
    pub fn new(memory: M) -> Self {
        Self {
            memory,
            inner: Mutex::new(FrameTableInner::default()),
            eviction_retries: EVICTION_RETRIES,
        }
    }

    pub fn with_eviction_retries(self, eviction_retries: usize) -> Self {
        Self {
            eviction_retries,
            ..self
        }
    }

    pub fn memory(&self) -> &M {
        &self.memory
    }

    /// Number of registered frames.
    pub fn len(&self) -> usize {
        self.inner.lock().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, id: FrameId) -> bool {
        self.inner.lock().get_mut(id).is_some()
    }

    /// Marks the frame as recently used. Returns `false` for a stale handle.
    pub fn touch(&self, id: FrameId) -> bool {
        match self.inner.lock().get_mut(id) {
            Some(entry) => {
                entry.accessed = true;
                true
            }
            None => false,
        }
    }

    /// Obtains a frame for `owner` and registers it, evicting another frame if
    /// physical memory is exhausted.
    ///
    /// `held` is the page table the caller has locked; it must be the
    /// owner's.
    pub fn allocate<B: BlockOp>(
        &self,
        swap: &SwapStore<B>,
        owner: FrameOwner,
        zero: bool,
        held: &mut PageTable,
    ) -> Result<Frame> {
        let page = match self.memory.alloc_user_page(zero) {
            Some(page) => page,
            None => {
                let page = self.evict(swap, held)?;
                if zero {
                    self.memory.zero(page);
                }
                page
            }
        };
        let vpn = owner.vpn;
        let id = self.inner.lock().insert(page, owner);
        trace!("frame table: frame {id} backs page {vpn}");
        Ok(Frame { id, page })
    }

    /// Unregisters the frame and returns its page to physical memory.
    /// Returns `false`, doing nothing, for a stale handle.
    pub fn free(&self, id: FrameId) -> bool {
        let Some(entry) = self.inner.lock().remove(id) else {
            return false;
        };
        self.memory.free_user_page(entry.page);
        trace!("frame table: freed frame {id}");
        true
    }

    /// Moves one frame's contents to swap and hands its physical page to the
    /// caller, who now owns it.
    ///
    /// Fails with [`VmError::VictimsBusy`] when every candidate stayed locked
    /// by other threads. The caller should unlock `held` before trying again.
    pub fn evict<B: BlockOp>(
        &self,
        swap: &SwapStore<B>,
        held: &mut PageTable,
    ) -> Result<PhysicalPage> {
        for _ in 0..self.eviction_retries {
            if let Some(page) = self.try_evict(swap, held)? {
                return Ok(page);
            }
            spin_loop();
        }
        debug!(
            "frame table: no victim could be locked after {} rounds",
            self.eviction_retries
        );
        Err(VmError::VictimsBusy)
    }

    /// One round of victim selection. `Ok(None)` means every candidate's page
    /// table was busy.
    fn try_evict<B: BlockOp>(
        &self,
        swap: &SwapStore<B>,
        held: &mut PageTable,
    ) -> Result<Option<PhysicalPage>> {
        let mut inner = self.inner.lock();
        if inner.len == 0 {
            error!("frame table: out of memory with no frames to evict");
            return Err(VmError::OutOfMemory);
        }
        // Each frame may be passed over once for its hardware accessed bit
        // and once more for a busy page table.
        for _ in 0..inner.len * 2 {
            let id = inner.candidate().ok_or(VmError::OutOfMemory)?;
            let owner = match inner.get_mut(id) {
                Some(entry) => entry.owner.clone(),
                None => panic!("eviction candidate {id} is not registered"),
            };

            if owner.asid == held.asid() {
                if held.take_accessed(owner.vpn) {
                    inner.policy.skip();
                    continue;
                }
                let slot = swap.reserve_slot()?;
                let entry = Self::take(&mut inner, id);
                drop(inner);
                return self.swap_out(swap, held, id, entry, slot).map(Some);
            }

            let Some(space) = owner.space.upgrade() else {
                // Nothing can reach the page any more; its contents are garbage.
                let entry = Self::take(&mut inner, id);
                debug!(
                    "frame table: reclaimed frame {id} of dropped address space {}",
                    owner.asid
                );
                return Ok(Some(entry.page));
            };
            let Some(mut table) = space.table().try_lock() else {
                debug!("frame table: page table {} busy, skipping frame {id}", owner.asid);
                inner.policy.skip();
                continue;
            };
            if table.take_accessed(owner.vpn) {
                inner.policy.skip();
                continue;
            }
            let slot = swap.reserve_slot()?;
            let entry = Self::take(&mut inner, id);
            drop(inner);
            return self.swap_out(swap, &mut table, id, entry, slot).map(Some);
        }
        Ok(None)
    }

    /// Evicts the frame backing a specific resident page of `table` and frees
    /// the physical page.
    pub fn evict_frame<B: BlockOp>(
        &self,
        swap: &SwapStore<B>,
        table: &mut PageTable,
        id: FrameId,
    ) -> Result<()> {
        let slot = swap.reserve_slot()?;
        let Some(entry) = self.inner.lock().remove(id) else {
            panic!("resident page refers to unregistered frame {id}");
        };
        let page = self.swap_out(swap, table, id, entry, slot)?;
        self.memory.free_user_page(page);
        Ok(())
    }

    fn take(inner: &mut FrameTableInner, id: FrameId) -> FrameEntry {
        inner
            .remove(id)
            .unwrap_or_else(|| panic!("frame {id} vanished while the frame table was locked"))
    }

    /// Writes an unregistered frame to `slot` and points its page at the slot.
    /// If the write fails the frame is registered again under a new handle
    /// and remapped, and the slot is released.
    fn swap_out<B: BlockOp>(
        &self,
        swap: &SwapStore<B>,
        table: &mut PageTable,
        id: FrameId,
        entry: FrameEntry,
        slot: SlotId,
    ) -> Result<PhysicalPage> {
        let vpn = entry.owner.vpn;
        let writable = table.detach_frame(vpn, id);

        let mut contents = [0; PAGE_FRAME_SIZE];
        self.memory.read(entry.page, 0, &mut contents);
        if let Err(err) = swap.write_frame(slot, &contents) {
            error!("frame table: evicting page {vpn} of {} failed: {err}", entry.owner.asid);
            let restored = self.inner.lock().insert(entry.page, entry.owner);
            table.attach_frame(vpn, restored, entry.page, writable);
            swap.release_slot(slot)?;
            return Err(err);
        }

        table.set_status(vpn, PageStatus::Swapped(slot));
        debug!(
            "frame table: evicted page {vpn} of {} from frame {id} to slot {slot}",
            entry.owner.asid
        );
        Ok(entry.page)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::page_table::{PageInit, PageState};
    use crate::test_util::{pattern, Fixture};

    #[test]
    fn test_free_is_idempotent() {
        let fixture = Fixture::new(2, 2);
        let space = fixture.space(1);
        let mut table = space.table().lock();
        let owner = table.owner(VirtPageNum(1));
        let frame = fixture.frames.allocate(&fixture.swap, owner, true, &mut table).unwrap();

        assert!(fixture.frames.contains(frame.id));
        assert!(fixture.frames.free(frame.id));
        assert!(!fixture.frames.free(frame.id));
        assert!(!fixture.frames.touch(frame.id));
        assert_eq!(fixture.frames.memory().frames_allocated(), 0);

        // The cell is reused, the stale handle still does not resolve.
        let owner = table.owner(VirtPageNum(2));
        let again = fixture.frames.allocate(&fixture.swap, owner, true, &mut table).unwrap();
        assert_eq!(again.id.index(), frame.id.index());
        assert_ne!(again.id, frame.id);
        assert!(!fixture.frames.contains(frame.id));
    }

    #[test]
    fn test_evicts_oldest_untouched_frame() {
        let fixture = Fixture::new(2, 4);
        let space = fixture.space(1);
        let mut table = space.table().lock();
        for vpn in 1..=2 {
            table
                .reserve(&fixture.frames, &fixture.swap, VirtPageNum(vpn), true, PageInit::Resident)
                .unwrap();
        }
        // Both start referenced; the first sweep clears them and picks page 1.
        table
            .reserve(&fixture.frames, &fixture.swap, VirtPageNum(3), true, PageInit::Resident)
            .unwrap();
        assert_eq!(table.state(VirtPageNum(1)), Some(PageState::Swapped));
        assert_eq!(table.state(VirtPageNum(2)), Some(PageState::Resident));

        // Page 2 is now unreferenced and page 3 fresh, so page 2 goes next.
        table
            .reserve(&fixture.frames, &fixture.swap, VirtPageNum(4), true, PageInit::Resident)
            .unwrap();
        assert_eq!(table.state(VirtPageNum(2)), Some(PageState::Swapped));
        assert_eq!(table.state(VirtPageNum(3)), Some(PageState::Resident));
        assert_eq!(fixture.frames.len(), 2);
        assert_eq!(fixture.swap.used_slots(), 2);
    }

    #[test]
    fn test_hardware_accessed_bit_earns_second_chance() {
        let fixture = Fixture::new(2, 4);
        let (space, directory) = fixture.space_with_directory(1);
        let mut table = space.table().lock();
        for vpn in 1..=2 {
            table
                .reserve(&fixture.frames, &fixture.swap, VirtPageNum(vpn), true, PageInit::Resident)
                .unwrap();
        }
        // User code touched page 1 without going through the kernel.
        assert!(directory.mark_accessed(VirtPageNum(1)));

        table
            .reserve(&fixture.frames, &fixture.swap, VirtPageNum(3), true, PageInit::Resident)
            .unwrap();
        assert_eq!(table.state(VirtPageNum(1)), Some(PageState::Resident));
        assert_eq!(table.state(VirtPageNum(2)), Some(PageState::Swapped));
    }

    #[test]
    fn test_frames_of_dropped_space_are_reclaimed() {
        let fixture = Fixture::new(1, 1);
        let a = fixture.space(1);
        a.table()
            .lock()
            .reserve(&fixture.frames, &fixture.swap, VirtPageNum(5), true, PageInit::Resident)
            .unwrap();
        drop(a);
        assert_eq!(fixture.frames.len(), 1);

        let b = fixture.space(2);
        b.table()
            .lock()
            .reserve(&fixture.frames, &fixture.swap, VirtPageNum(5), true, PageInit::Resident)
            .unwrap();
        assert_eq!(fixture.frames.len(), 1);
        assert_eq!(fixture.frames.memory().frames_allocated(), 1);
        assert_eq!(fixture.swap.used_slots(), 0);
    }

    #[test]
    fn test_evicts_from_other_address_space() {
        let fixture = Fixture::new(1, 1);
        let a = fixture.space(1);
        let b = fixture.space(2);
        a.table()
            .lock()
            .reserve(&fixture.frames, &fixture.swap, VirtPageNum(5), true, PageInit::Resident)
            .unwrap();

        b.table()
            .lock()
            .reserve(&fixture.frames, &fixture.swap, VirtPageNum(5), true, PageInit::Resident)
            .unwrap();
        let a_table = a.table().lock();
        assert_eq!(a_table.state(VirtPageNum(5)), Some(PageState::Swapped));
        assert_eq!(a_table.translate(VirtPageNum(5).start_address()), None);
    }

    #[test]
    fn test_busy_page_table_is_not_a_victim() {
        let fixture = Fixture::new(1, 1);
        let a = fixture.space(1);
        let b = fixture.space(2);
        a.table()
            .lock()
            .reserve(&fixture.frames, &fixture.swap, VirtPageNum(5), true, PageInit::Resident)
            .unwrap();

        let _a_held = a.table().lock();
        let mut b_table = b.table().lock();
        let err = fixture.frames.evict(&fixture.swap, &mut b_table).unwrap_err();
        assert_eq!(err, VmError::VictimsBusy);
        assert_eq!(err.kind(), crate::mem::ErrorKind::Transient);
        assert_eq!(fixture.frames.len(), 1);
        assert_eq!(fixture.swap.used_slots(), 0);
    }

    #[test]
    fn test_failed_write_restores_victim() {
        let fixture = Fixture::new(1, 1);
        let space = fixture.space(1);
        let mut table = space.table().lock();
        table
            .reserve(&fixture.frames, &fixture.swap, VirtPageNum(5), true, PageInit::Resident)
            .unwrap();
        let page = table.translate(VirtPageNum(5).start_address()).unwrap();
        fixture.frames.memory().write(page, 0, &pattern(9));

        fixture.disk.fail_writes(true);
        let result =
            table.reserve(&fixture.frames, &fixture.swap, VirtPageNum(6), true, PageInit::Resident);
        assert!(matches!(result, Err(VmError::Io(_))));

        assert_eq!(table.state(VirtPageNum(5)), Some(PageState::Resident));
        assert_eq!(table.state(VirtPageNum(6)), None);
        assert_eq!(table.translate(VirtPageNum(5).start_address()), Some(page));
        let mut contents = [0; PAGE_FRAME_SIZE];
        fixture.frames.memory().read(page, 0, &mut contents);
        assert_eq!(contents, pattern(9));
        assert_eq!(fixture.swap.used_slots(), 0);
        assert_eq!(fixture.frames.len(), 1);
    }

    #[test]
    fn test_out_of_swap() {
        let fixture = Fixture::new(1, 0);
        let space = fixture.space(1);
        let mut table = space.table().lock();
        table
            .reserve(&fixture.frames, &fixture.swap, VirtPageNum(1), true, PageInit::Resident)
            .unwrap();
        assert_eq!(
            table.reserve(&fixture.frames, &fixture.swap, VirtPageNum(2), true, PageInit::Resident),
            Err(VmError::OutOfSwap)
        );
        assert_eq!(table.state(VirtPageNum(1)), Some(PageState::Resident));
    }
}
