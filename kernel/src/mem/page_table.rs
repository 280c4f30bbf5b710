//! Per address space records of every reserved virtual page.

use crate::block::block_core::BlockOp;
use crate::block::block_error::BlockError;
use crate::mem::frame_table::{FrameId, FrameOwner, FrameTable};
use crate::mem::{FrameBuffer, PhysicalMemory, Result, VmError};
use crate::paging::AddressTranslation;
use crate::swapping::{SlotId, SwapStore};
use crate::sync::mutex::Mutex;
use crate::threading::process::Asid;
use alloc::{
    boxed::Box,
    collections::BTreeMap,
    sync::{Arc, Weak},
    vec::Vec,
};
use core::fmt;
use kidneyos_shared::mem::{PhysicalPage, VirtPageNum, PAGE_FRAME_SIZE};
use log::{debug, error, trace};

/// Backing data for pages that are loaded lazily, such as program segments.
pub trait PageSource: Send + Sync {
    /// Reads up to one page starting at `offset` into `buf` and returns the
    /// number of bytes read. The rest of the page is zero-filled by the caller.
    fn read_page(
        &self,
        offset: usize,
        buf: &mut FrameBuffer,
    ) -> core::result::Result<usize, BlockError>;
}

impl PageSource for Vec<u8> {
    fn read_page(
        &self,
        offset: usize,
        buf: &mut FrameBuffer,
    ) -> core::result::Result<usize, BlockError> {
        let Some(remaining) = self.get(offset..) else {
            return Ok(0);
        };
        let len = remaining.len().min(PAGE_FRAME_SIZE);
        buf[..len].copy_from_slice(&remaining[..len]);
        Ok(len)
    }
}

/// Where the contents of a page currently live.
#[derive(Clone)]
pub enum PageStatus {
    Resident(FrameId),
    Swapped(SlotId),
    FileBacked {
        source: Arc<dyn PageSource>,
        offset: usize,
    },
    /// Reads as zeros until first touched.
    Uninitialized,
}

impl fmt::Debug for PageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Resident(id) => f.debug_tuple("Resident").field(id).finish(),
            Self::Swapped(slot) => f.debug_tuple("Swapped").field(slot).finish(),
            Self::FileBacked { offset, .. } => f
                .debug_struct("FileBacked")
                .field("offset", offset)
                .finish_non_exhaustive(),
            Self::Uninitialized => write!(f, "Uninitialized"),
        }
    }
}

impl PageStatus {
    pub fn state(&self) -> PageState {
        match self {
            Self::Resident(_) => PageState::Resident,
            Self::Swapped(_) => PageState::Swapped,
            Self::FileBacked { .. } => PageState::FileBacked,
            Self::Uninitialized => PageState::Uninitialized,
        }
    }
}

/// [`PageStatus`] without its payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageState {
    Resident,
    Swapped,
    FileBacked,
    Uninitialized,
}

/// How a newly reserved page starts out.
#[derive(Clone)]
pub enum PageInit {
    /// Backed by a zero-filled frame right away.
    Resident,
    Uninitialized,
    FileBacked {
        source: Arc<dyn PageSource>,
        offset: usize,
    },
}

#[derive(Debug, Clone)]
pub struct Page {
    pub vpn: VirtPageNum,
    pub asid: Asid,
    pub writable: bool,
    pub status: PageStatus,
}

enum Fill {
    Zero,
    Swap(SlotId),
    File(Arc<dyn PageSource>, usize),
}

pub struct PageTable {
    asid: Asid,
    space: Weak<AddressSpace>,
    pages: BTreeMap<VirtPageNum, Page>,
    mmu: Box<dyn AddressTranslation>,
    destroyed: bool,
}

impl PageTable {
    pub fn asid(&self) -> Asid {
        self.asid
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    /// Whether [`Self::destroy`] has run. A destroyed table refuses new pages
    /// and faults.
    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    fn ensure_live(&self) -> Result<()> {
        if self.destroyed {
            error!("page table {}: used after it was destroyed", self.asid);
            return Err(VmError::NoSuchAddressSpace(self.asid));
        }
        Ok(())
    }

    /// Number of pages currently backed by a frame.
    pub fn resident_pages(&self) -> usize {
        self.pages
            .values()
            .filter(|page| matches!(page.status, PageStatus::Resident(_)))
            .count()
    }

    pub fn owner(&self, vpn: VirtPageNum) -> FrameOwner {
        FrameOwner {
            space: self.space.clone(),
            asid: self.asid,
            vpn,
        }
    }

    /// The page containing `addr`.
    pub fn lookup(&self, addr: usize) -> Option<&Page> {
        self.pages.get(&VirtPageNum::containing(addr))
    }

    pub fn state(&self, vpn: VirtPageNum) -> Option<PageState> {
        self.pages.get(&vpn).map(|page| page.status.state())
    }

    /// The frame `addr` is currently mapped to.
    pub fn translate(&self, addr: usize) -> Option<PhysicalPage> {
        self.mmu.translate(addr)
    }

    fn page_mut(&mut self, vpn: VirtPageNum) -> &mut Page {
        let asid = self.asid;
        self.pages
            .get_mut(&vpn)
            .unwrap_or_else(|| panic!("address space {asid} has no record for page {vpn}"))
    }

    /// Creates the record for `vpn`. With [`PageInit::Resident`] a frame is
    /// allocated and mapped before returning; if that fails no record is left
    /// behind.
    pub fn reserve<M: PhysicalMemory, B: BlockOp>(
        &mut self,
        frames: &FrameTable<M>,
        swap: &SwapStore<B>,
        vpn: VirtPageNum,
        writable: bool,
        init: PageInit,
    ) -> Result<()> {
        self.ensure_live()?;
        if self.pages.contains_key(&vpn) {
            error!("page table {}: page {vpn} reserved twice", self.asid);
            return Err(VmError::DuplicatePage(vpn));
        }
        let (status, load) = match init {
            PageInit::Resident => (PageStatus::Uninitialized, true),
            PageInit::Uninitialized => (PageStatus::Uninitialized, false),
            PageInit::FileBacked { source, offset } => {
                (PageStatus::FileBacked { source, offset }, false)
            }
        };
        self.pages.insert(
            vpn,
            Page {
                vpn,
                asid: self.asid,
                writable,
                status,
            },
        );
        trace!("page table {}: reserved page {vpn}", self.asid);

        if load {
            if let Err(err) = self.resolve_fault(frames, swap, vpn) {
                self.pages.remove(&vpn);
                return Err(err);
            }
        }
        Ok(())
    }

    /// Makes `vpn` resident and mapped, loading its contents from wherever
    /// they are. On failure the page keeps its previous status, and a swapped
    /// page keeps its slot.
    pub fn resolve_fault<M: PhysicalMemory, B: BlockOp>(
        &mut self,
        frames: &FrameTable<M>,
        swap: &SwapStore<B>,
        vpn: VirtPageNum,
    ) -> Result<PhysicalPage> {
        self.ensure_live()?;
        let Some(page) = self.pages.get(&vpn) else {
            error!("page table {}: fault on unreserved page {vpn}", self.asid);
            return Err(VmError::NoSuchPage(vpn));
        };
        let writable = page.writable;
        let fill = match &page.status {
            PageStatus::Resident(id) => {
                let id = *id;
                frames.touch(id);
                return match self.mmu.translate(vpn.start_address()) {
                    Some(frame) => Ok(frame),
                    None => panic!("resident page {vpn} of {} is not mapped", self.asid),
                };
            }
            PageStatus::Swapped(slot) => Fill::Swap(*slot),
            PageStatus::FileBacked { source, offset } => Fill::File(source.clone(), *offset),
            PageStatus::Uninitialized => Fill::Zero,
        };

        let owner = self.owner(vpn);
        let frame = frames.allocate(swap, owner, matches!(fill, Fill::Zero), self)?;
        if let Err(err) = Self::fill_frame(frames, swap, frame.page, &fill) {
            frames.free(frame.id);
            return Err(err);
        }
        if !self.mmu.map(vpn, frame.page, writable) {
            error!("page table {}: could not map page {vpn}", self.asid);
            frames.free(frame.id);
            return Err(VmError::MapFailed(vpn));
        }
        self.page_mut(vpn).status = PageStatus::Resident(frame.id);

        if let Fill::Swap(slot) = fill {
            if swap.release_slot(slot).is_err() {
                panic!("swapped page {vpn} of {} did not own slot {slot}", self.asid);
            }
            trace!("page table {}: swapped in page {vpn} from slot {slot}", self.asid);
        }
        Ok(frame.page)
    }

    fn fill_frame<M: PhysicalMemory, B: BlockOp>(
        frames: &FrameTable<M>,
        swap: &SwapStore<B>,
        page: PhysicalPage,
        fill: &Fill,
    ) -> Result<()> {
        let mut contents = [0; PAGE_FRAME_SIZE];
        match fill {
            Fill::Zero => return Ok(()),
            Fill::Swap(slot) => swap.read_frame(*slot, &mut contents)?,
            Fill::File(source, offset) => {
                let read = source.read_page(*offset, &mut contents)?;
                contents[read.min(PAGE_FRAME_SIZE)..].fill(0);
            }
        }
        frames.memory().write(page, 0, &contents);
        Ok(())
    }

    /// Deletes the record for `vpn`, releasing its frame or swap slot.
    pub fn remove<M: PhysicalMemory, B: BlockOp>(
        &mut self,
        frames: &FrameTable<M>,
        swap: &SwapStore<B>,
        vpn: VirtPageNum,
    ) -> Result<()> {
        let Some(page) = self.pages.remove(&vpn) else {
            error!("page table {}: removing unreserved page {vpn}", self.asid);
            return Err(VmError::NoSuchPage(vpn));
        };
        match page.status {
            PageStatus::Resident(id) => {
                self.mmu.unmap(vpn);
                assert!(frames.free(id), "resident page {vpn} had no frame");
            }
            PageStatus::Swapped(slot) => swap.release_slot(slot)?,
            PageStatus::FileBacked { .. } | PageStatus::Uninitialized => {}
        }
        trace!("page table {}: removed page {vpn}", self.asid);
        Ok(())
    }

    /// Pushes `vpn` out to swap if it is resident. Returns whether anything
    /// was evicted.
    pub fn evict_page<M: PhysicalMemory, B: BlockOp>(
        &mut self,
        frames: &FrameTable<M>,
        swap: &SwapStore<B>,
        vpn: VirtPageNum,
    ) -> Result<bool> {
        let Some(page) = self.pages.get(&vpn) else {
            error!("page table {}: evicting unreserved page {vpn}", self.asid);
            return Err(VmError::NoSuchPage(vpn));
        };
        let PageStatus::Resident(id) = page.status else {
            return Ok(false);
        };
        frames.evict_frame(swap, self, id)?;
        Ok(true)
    }

    /// Releases every page. The table is empty afterwards and stays empty.
    pub fn destroy<M: PhysicalMemory, B: BlockOp>(
        &mut self,
        frames: &FrameTable<M>,
        swap: &SwapStore<B>,
    ) -> Result<()> {
        self.destroyed = true;
        let vpns: Vec<_> = self.pages.keys().copied().collect();
        let mut result = Ok(());
        for vpn in vpns {
            if let Err(err) = self.remove(frames, swap, vpn) {
                result = result.and(Err(err));
            }
        }
        debug!("page table {}: destroyed", self.asid);
        result
    }

    /// Reads and clears the hardware accessed bit of `vpn`.
    pub(super) fn take_accessed(&mut self, vpn: VirtPageNum) -> bool {
        self.mmu.take_accessed(vpn)
    }

    /// Unmaps a resident page whose frame is being evicted and returns its
    /// writable flag. The record stays `Resident(id)` until the caller
    /// settles it.
    pub(super) fn detach_frame(&mut self, vpn: VirtPageNum, id: FrameId) -> bool {
        let asid = self.asid;
        let page = self.page_mut(vpn);
        assert!(
            matches!(page.status, PageStatus::Resident(frame) if frame == id),
            "frame {id} is not the frame of page {vpn} in {asid}: {:?}",
            page.status
        );
        let writable = page.writable;
        self.mmu.unmap(vpn);
        writable
    }

    /// Undoes [`Self::detach_frame`] with the frame's new handle.
    pub(super) fn attach_frame(
        &mut self,
        vpn: VirtPageNum,
        id: FrameId,
        frame: PhysicalPage,
        writable: bool,
    ) {
        assert!(self.mmu.map(vpn, frame, writable), "could not remap page {vpn}");
        self.page_mut(vpn).status = PageStatus::Resident(id);
    }

    pub(super) fn set_status(&mut self, vpn: VirtPageNum, status: PageStatus) {
        self.page_mut(vpn).status = status;
    }
}

/// A process's virtual memory: its page records and translation structure.
pub struct AddressSpace {
    asid: Asid,
    table: Mutex<PageTable>,
}

impl AddressSpace {
    pub fn new(asid: Asid, mmu: Box<dyn AddressTranslation>) -> Arc<Self> {
        Arc::new_cyclic(|space| Self {
            asid,
            table: Mutex::new(PageTable {
                asid,
                space: space.clone(),
                pages: BTreeMap::new(),
                mmu,
                destroyed: false,
            }),
        })
    }

    pub fn asid(&self) -> Asid {
        self.asid
    }

    pub fn table(&self) -> &Mutex<PageTable> {
        &self.table
    }
}
