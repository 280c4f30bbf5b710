pub mod config;
pub mod frame_allocator;
pub mod frame_table;
pub mod page_table;
pub mod user;

use crate::block::block_error::BlockError;
use crate::swapping::SlotId;
use crate::threading::process::Asid;
use core::fmt;
use kidneyos_shared::mem::{PhysicalPage, VirtPageNum, PAGE_FRAME_SIZE};

/// The contents of one page frame.
pub type FrameBuffer = [u8; PAGE_FRAME_SIZE];

/// The allocator handing out physical pages for user memory, together with the
/// kernel's view of those pages' bytes.
///
/// `offset + buf.len()` must not exceed `PAGE_FRAME_SIZE` in `read`/`write`.
pub trait PhysicalMemory: Send + Sync {
    /// Allocate a page tagged as user memory, zeroed if `zero` is set.
    fn alloc_user_page(&self, zero: bool) -> Option<PhysicalPage>;

    fn free_user_page(&self, page: PhysicalPage);

    fn read(&self, page: PhysicalPage, offset: usize, dst: &mut [u8]);

    fn write(&self, page: PhysicalPage, offset: usize, src: &[u8]);

    fn zero(&self, page: PhysicalPage) {
        self.write(page, 0, &[0; PAGE_FRAME_SIZE]);
    }
}

/// Coarse classification of a [`VmError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// No safe continuation exists for the requested operation.
    Kernel,
    /// A caller broke the contract of the operation.
    Programming,
    /// Nothing is wrong; the operation may succeed once other address spaces
    /// release their page tables.
    Transient,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmError {
    /// No physical frame is free and none could be evicted
    OutOfMemory,
    /// Every swap slot is in use
    OutOfSwap,
    /// The swap device failed a transfer
    Io(BlockError),
    /// The translation structure refused to map this page
    MapFailed(VirtPageNum),
    /// A page record already exists for this virtual page
    DuplicatePage(VirtPageNum),
    /// No page record exists for this virtual page
    NoSuchPage(VirtPageNum),
    /// The swap slot is not currently reserved
    SlotNotReserved(SlotId),
    /// No address space with this id is registered, or it was destroyed
    NoSuchAddressSpace(Asid),
    /// Every eviction candidate belongs to a page table locked elsewhere
    VictimsBusy,
}

impl VmError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::OutOfMemory | Self::OutOfSwap | Self::Io(_) | Self::MapFailed(_) => {
                ErrorKind::Kernel
            }
            Self::DuplicatePage(_)
            | Self::NoSuchPage(_)
            | Self::SlotNotReserved(_)
            | Self::NoSuchAddressSpace(_) => ErrorKind::Programming,
            Self::VictimsBusy => ErrorKind::Transient,
        }
    }
}

impl fmt::Display for VmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfMemory => write!(f, "out of physical memory"),
            Self::OutOfSwap => write!(f, "out of swap space"),
            Self::Io(err) => write!(f, "swap I/O failed: {err}"),
            Self::MapFailed(vpn) => write!(f, "could not map page {vpn}"),
            Self::DuplicatePage(vpn) => write!(f, "page {vpn} is already reserved"),
            Self::NoSuchPage(vpn) => write!(f, "page {vpn} is not reserved"),
            Self::SlotNotReserved(slot) => write!(f, "swap slot {slot} is not reserved"),
            Self::NoSuchAddressSpace(asid) => write!(f, "no address space {asid}"),
            Self::VictimsBusy => write!(f, "every eviction candidate is locked"),
        }
    }
}

impl core::error::Error for VmError {}

impl From<BlockError> for VmError {
    fn from(err: BlockError) -> Self {
        Self::Io(err)
    }
}

pub type Result<T> = core::result::Result<T, VmError>;
