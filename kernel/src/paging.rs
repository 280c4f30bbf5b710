// https://wiki.osdev.org/Paging

use alloc::{boxed::Box, collections::BTreeMap};
use kidneyos_shared::{
    mem::{PhysicalPage, VirtPageNum},
    paging::{PageTable, PageTableEntry, VirtualAddress},
};
use log::trace;

/// The hardware translation structure of one address space.
pub trait AddressTranslation: Send {
    /// Maps `page` to `frame`. Returns `false`, changing nothing, if `page` is
    /// already mapped or cannot be represented.
    fn map(&mut self, page: VirtPageNum, frame: PhysicalPage, writable: bool) -> bool;

    /// Removes the mapping for `page`, if any.
    fn unmap(&mut self, page: VirtPageNum);

    /// The frame `addr` is mapped to.
    fn translate(&self, addr: usize) -> Option<PhysicalPage>;

    /// Whether the MMU marked `page` accessed since the last call. Clears the
    /// mark.
    fn take_accessed(&mut self, page: VirtPageNum) -> bool;
}

/// A two-level x86 page directory. Second-level tables are allocated on first
/// use and freed when their last entry goes away.
#[derive(Default)]
pub struct PageDirectory {
    tables: BTreeMap<u16, Box<PageTable>>,
}

impl PageDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, va: VirtualAddress) -> Option<&PageTableEntry> {
        let table = self.tables.get(&va.page_directory_index().value())?;
        Some(&table[usize::from(va.page_table_index().value())]).filter(|entry| entry.present())
    }

    fn entry_mut(&mut self, va: VirtualAddress) -> Option<&mut PageTableEntry> {
        let table = self.tables.get_mut(&va.page_directory_index().value())?;
        Some(&mut table[usize::from(va.page_table_index().value())])
            .filter(|entry| entry.present())
    }

    /// Number of mapped pages.
    pub fn mapped_count(&self) -> usize {
        self.tables
            .values()
            .map(|table| table.iter().filter(|entry| entry.present()).count())
            .sum()
    }

    pub fn is_writable(&self, page: VirtPageNum) -> Option<bool> {
        let va = VirtualAddress::of_page(page)?;
        self.entry(va).map(PageTableEntry::read_write)
    }

    /// Sets the accessed bit the way the MMU does on a user access.
    #[cfg(test)]
    pub fn mark_accessed(&mut self, page: VirtPageNum) -> bool {
        let Some(entry) = VirtualAddress::of_page(page).and_then(|va| self.entry_mut(va)) else {
            return false;
        };
        *entry = entry.with_accessed(true);
        true
    }
}

impl AddressTranslation for PageDirectory {
    fn map(&mut self, page: VirtPageNum, frame: PhysicalPage, writable: bool) -> bool {
        let Some(va) = VirtualAddress::of_page(page) else {
            return false;
        };
        let Some(new_entry) = PageTableEntry::user(frame, writable) else {
            return false;
        };
        let table = self
            .tables
            .entry(va.page_directory_index().value())
            .or_default();
        let entry = &mut table[usize::from(va.page_table_index().value())];
        if entry.present() {
            return false;
        }
        *entry = new_entry;
        trace!("paging: mapped {page} to frame {:#X}", frame.number());
        true
    }

    fn unmap(&mut self, page: VirtPageNum) {
        let Some(va) = VirtualAddress::of_page(page) else {
            return;
        };
        let directory_index = va.page_directory_index().value();
        let Some(table) = self.tables.get_mut(&directory_index) else {
            return;
        };
        table[usize::from(va.page_table_index().value())] = PageTableEntry::DEFAULT;
        if table.is_empty() {
            self.tables.remove(&directory_index);
        }
        trace!("paging: unmapped {page}");
    }

    fn translate(&self, addr: usize) -> Option<PhysicalPage> {
        let va = VirtualAddress::split(addr)?;
        self.entry(va).map(PageTableEntry::frame)
    }

    fn take_accessed(&mut self, page: VirtPageNum) -> bool {
        let Some(entry) = VirtualAddress::of_page(page).and_then(|va| self.entry_mut(va)) else {
            return false;
        };
        let accessed = entry.accessed();
        *entry = entry.with_accessed(false);
        accessed
    }
}
