// https://wiki.osdev.org/Paging

// Avoids lots of warnings about casting usize to u32 which cannot result in
// truncation on a 32-bit platform, which is all we support.
#![allow(clippy::cast_possible_truncation)]

use crate::mem::{PhysicalPage, VirtPageNum, PAGE_FRAME_SIZE};
use arbitrary_int::{u10, u12, u20};
use bitbybit::bitfield;
use core::{
    mem::size_of,
    ops::{Deref, DerefMut},
};

pub const PAGE_TABLE_LEN: usize = PAGE_FRAME_SIZE / size_of::<PageTableEntry>();

/// Largest frame number a page table entry can hold.
pub const MAX_FRAME_NUMBER: u32 = (1 << 20) - 1;

#[repr(align(4096))]
pub struct PageTable(pub [PageTableEntry; PAGE_TABLE_LEN]);

impl Default for PageTable {
    fn default() -> Self {
        Self([PageTableEntry::default(); PAGE_TABLE_LEN])
    }
}

impl PageTable {
    pub fn is_empty(&self) -> bool {
        self.0.iter().all(|entry| !entry.present())
    }
}

impl Deref for PageTable {
    type Target = [PageTableEntry; PAGE_TABLE_LEN];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for PageTable {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

#[bitfield(u32, default = 0)]
pub struct PageTableEntry {
    #[bit(0, rw)]
    present: bool,
    #[bit(1, rw)]
    read_write: bool,
    #[bit(2, rw)]
    user_supervisor: bool,
    #[bit(5, rw)]
    accessed: bool,
    #[bit(6, rw)]
    dirty: bool,
    #[bits(12..=31, rw)]
    page_frame_address: u20,
}

impl PageTableEntry {
    /// A present user-mode entry pointing at `frame`.
    ///
    /// Returns `None` if the frame number does not fit in the entry.
    pub fn user(frame: PhysicalPage, writable: bool) -> Option<Self> {
        if frame.number() > MAX_FRAME_NUMBER {
            return None;
        }
        Some(
            Self::DEFAULT
                .with_present(true)
                .with_user_supervisor(true)
                .with_read_write(writable)
                .with_page_frame_address(u20::new(frame.number())),
        )
    }

    pub fn frame(&self) -> PhysicalPage {
        PhysicalPage(self.page_frame_address().value())
    }
}

#[bitfield(u32)]
pub struct VirtualAddress {
    #[bits(22..=31, r)]
    page_directory_index: u10,
    #[bits(12..=21, r)]
    page_table_index: u10,
    #[bits(0..=11, r)]
    offset: u12,
}

impl VirtualAddress {
    /// Splits `addr` into its paging indices, or `None` if it is wider than 32 bits.
    pub fn split(addr: usize) -> Option<Self> {
        u32::try_from(addr).ok().map(Self::new_with_raw_value)
    }

    pub fn of_page(page: VirtPageNum) -> Option<Self> {
        Self::split(page.start_address())
    }
}
