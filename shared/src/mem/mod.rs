use crate::sizes::{KB, MB};
use core::fmt;

// Page size is 4KB. This is a property of x86 processors.
pub const PAGE_FRAME_SIZE: usize = 4 * KB;
pub const PAGE_SHIFT: usize = 12;

// Any virtual address at or above OFFSET is a kernel address.
pub const OFFSET: usize = 0x80000000;

pub const USER_STACK_LIMIT: usize = 8 * MB;

#[inline]
pub const fn page_round_down(addr: usize) -> usize {
    addr & !(PAGE_FRAME_SIZE - 1)
}

#[inline]
pub const fn page_offset(addr: usize) -> usize {
    addr & (PAGE_FRAME_SIZE - 1)
}

#[inline]
pub const fn is_kernel_address(addr: usize) -> bool {
    addr >= OFFSET
}

/// A virtual page number: a virtual address with the in-page offset dropped.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VirtPageNum(pub usize);

impl VirtPageNum {
    /// The page that `addr` falls in.
    #[inline]
    pub const fn containing(addr: usize) -> Self {
        Self(addr >> PAGE_SHIFT)
    }

    #[inline]
    pub const fn start_address(self) -> usize {
        self.0 << PAGE_SHIFT
    }

    #[inline]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Debug for VirtPageNum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VirtPageNum({:#X})", self.start_address())
    }
}

impl fmt::Display for VirtPageNum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#X}", self.start_address())
    }
}

/// Handle to one physical page frame, given as its frame number.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PhysicalPage(pub u32);

impl PhysicalPage {
    #[inline]
    pub const fn number(self) -> u32 {
        self.0
    }
}
