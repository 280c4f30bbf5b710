use crate::block::block_core::{Block, BlockOp};
use crate::mem::config::VmConfig;
use crate::mem::frame_table::FrameTable;
use crate::mem::page_table::{AddressSpace, PageInit, PageState, PageTable};
use crate::mem::{PhysicalMemory, Result, VmError};
use crate::paging::{AddressTranslation, PageDirectory};
use crate::swapping::SwapStore;
use crate::sync::mutex::Mutex;
use crate::threading::process::{
    Access, Asid, AsidAllocator, LogTermination, TerminationHook, EXIT_STATUS_INVALID_ACCESS,
};
use alloc::{boxed::Box, collections::BTreeMap, sync::Arc};
use core::hint::spin_loop;
use kidneyos_shared::mem::{PhysicalPage, VirtPageNum};
use log::{debug, error, trace, warn};

/// The virtual memory subsystem: frames, swap and every address space.
pub struct VirtualMemory<M: PhysicalMemory, B: BlockOp> {
    config: VmConfig,
    frames: FrameTable<M>,
    swap: SwapStore<B>,
    spaces: Mutex<BTreeMap<Asid, Arc<AddressSpace>>>,
    asids: AsidAllocator,
    hook: Box<dyn TerminationHook>,
}

impl<M: PhysicalMemory, B: BlockOp> VirtualMemory<M, B> {
    pub fn new(config: VmConfig, memory: M, swap_device: Block<B>) -> Self {
        Self {
            config,
            frames: FrameTable::new(memory).with_eviction_retries(config.eviction_retries),
            swap: SwapStore::new(swap_device),
            spaces: Mutex::new(BTreeMap::new()),
            asids: AsidAllocator::new(),
            hook: Box::new(LogTermination),
        }
    }

    /// Replaces the action taken when a process is killed for an invalid access.
    pub fn with_hook(self, hook: impl TerminationHook + 'static) -> Self {
        Self {
            hook: Box::new(hook),
            ..self
        }
    }

    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    pub fn frames(&self) -> &FrameTable<M> {
        &self.frames
    }

    pub fn swap(&self) -> &SwapStore<B> {
        &self.swap
    }

    pub fn create_address_space(&self) -> Asid {
        self.create_address_space_with(Box::new(PageDirectory::new()))
    }

    pub fn create_address_space_with(&self, mmu: Box<dyn AddressTranslation>) -> Asid {
        let asid = self.asids.allocate();
        self.spaces.lock().insert(asid, AddressSpace::new(asid, mmu));
        debug!("vm: created address space {asid}");
        asid
    }

    /// Releases every page, frame and swap slot of `asid`.
    pub fn destroy_address_space(&self, asid: Asid) -> Result<()> {
        let Some(space) = self.spaces.lock().remove(&asid) else {
            error!("vm: destroying unknown address space {asid}");
            return Err(VmError::NoSuchAddressSpace(asid));
        };
        let result = space.table().lock().destroy(&self.frames, &self.swap);
        debug!("vm: destroyed address space {asid}");
        result
    }

    pub fn address_space(&self, asid: Asid) -> Result<Arc<AddressSpace>> {
        match self.spaces.lock().get(&asid) {
            Some(space) => Ok(space.clone()),
            None => {
                error!("vm: no address space {asid}");
                Err(VmError::NoSuchAddressSpace(asid))
            }
        }
    }

    pub fn address_space_count(&self) -> usize {
        self.spaces.lock().len()
    }

    /// Runs `op` with the page table of `space` locked. While every eviction
    /// victim is locked elsewhere, the table is unlocked and `op` runs again.
    pub(crate) fn with_table<T>(
        &self,
        space: &AddressSpace,
        mut op: impl FnMut(&mut PageTable) -> Result<T>,
    ) -> Result<T> {
        loop {
            let result = op(&mut space.table().lock());
            match result {
                Err(VmError::VictimsBusy) => {
                    trace!("vm: eviction victims busy, retrying for {}", space.asid());
                    spin_loop();
                }
                result => return result,
            }
        }
    }

    /// Reserves the page containing `addr`.
    pub fn reserve(&self, asid: Asid, addr: usize, writable: bool, init: PageInit) -> Result<()> {
        let space = self.address_space(asid)?;
        let vpn = VirtPageNum::containing(addr);
        self.with_table(&space, |table| {
            table.reserve(&self.frames, &self.swap, vpn, writable, init.clone())
        })
    }

    pub fn remove(&self, asid: Asid, addr: usize) -> Result<()> {
        let space = self.address_space(asid)?;
        let mut table = space.table().lock();
        table.remove(&self.frames, &self.swap, VirtPageNum::containing(addr))
    }

    /// Makes the reserved page containing `addr` resident.
    pub fn resolve_fault(&self, asid: Asid, addr: usize) -> Result<PhysicalPage> {
        let space = self.address_space(asid)?;
        let vpn = VirtPageNum::containing(addr);
        self.with_table(&space, |table| table.resolve_fault(&self.frames, &self.swap, vpn))
    }

    /// Forces the page containing `addr` out to swap.
    pub fn evict_page(&self, asid: Asid, addr: usize) -> Result<bool> {
        let space = self.address_space(asid)?;
        let mut table = space.table().lock();
        table.evict_page(&self.frames, &self.swap, VirtPageNum::containing(addr))
    }

    pub fn page_state(&self, asid: Asid, addr: usize) -> Option<PageState> {
        let space = self.address_space(asid).ok()?;
        let state = space.table().lock().state(VirtPageNum::containing(addr));
        state
    }

    /// Kills `asid` for an invalid access at `addr`. Must be called with no
    /// page table locked.
    pub(crate) fn terminate(
        &self,
        asid: Asid,
        addr: usize,
        reason: &dyn core::fmt::Display,
    ) -> Access {
        warn!("vm: process {asid} killed by access at {addr:#X}: {reason}");
        self.hook.terminate(asid, EXIT_STATUS_INVALID_ACCESS);
        Access::Terminate(EXIT_STATUS_INVALID_ACCESS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::ErrorKind;
    use crate::test_util::vm;

    #[test]
    fn test_address_space_lifecycle() {
        let (vm, _) = vm(2, 2);
        let a = vm.create_address_space();
        let b = vm.create_address_space();
        assert_ne!(a, b);
        assert_eq!(vm.address_space_count(), 2);

        vm.reserve(a, 0x1000, true, PageInit::Resident).unwrap();
        vm.reserve(a, 0x2000, true, PageInit::Resident).unwrap();
        vm.reserve(b, 0x1000, true, PageInit::Resident).unwrap();
        assert_eq!(vm.swap().used_slots(), 1);

        vm.destroy_address_space(a).unwrap();
        assert_eq!(vm.frames().len(), 1);
        assert_eq!(vm.swap().used_slots(), 0);
        assert_eq!(vm.page_state(a, 0x1000), None);
        assert_eq!(vm.page_state(b, 0x1000), Some(PageState::Resident));

        let err = vm.destroy_address_space(a).unwrap_err();
        assert_eq!(err, VmError::NoSuchAddressSpace(a));
        assert_eq!(err.kind(), ErrorKind::Programming);
    }

    #[test]
    fn test_destroyed_space_stays_dead_through_old_handles() {
        let (vm, _) = vm(1, 1);
        let a = vm.create_address_space();
        let space = vm.address_space(a).unwrap();
        vm.destroy_address_space(a).unwrap();

        let reserved = space.table().lock().reserve(
            vm.frames(),
            vm.swap(),
            VirtPageNum(1),
            true,
            PageInit::Resident,
        );
        assert_eq!(reserved, Err(VmError::NoSuchAddressSpace(a)));
        drop(space);
        assert_eq!(vm.frames().len(), 0);

        // The only frame is still available to everyone else.
        let b = vm.create_address_space();
        vm.reserve(b, 0x1000, true, PageInit::Resident).unwrap();
        assert_eq!(vm.frames().len(), 1);
    }

    #[test]
    fn test_operations_on_unknown_space() {
        let (vm, _) = vm(1, 1);
        assert_eq!(
            vm.reserve(9, 0, true, PageInit::Uninitialized),
            Err(VmError::NoSuchAddressSpace(9))
        );
        assert_eq!(vm.resolve_fault(9, 0), Err(VmError::NoSuchAddressSpace(9)));
    }

    #[test]
    fn test_reserve_rounds_down() {
        let (vm, _) = vm(1, 1);
        let asid = vm.create_address_space();
        vm.reserve(asid, 0x4321, false, PageInit::Uninitialized).unwrap();
        assert_eq!(vm.page_state(asid, 0x4000), Some(PageState::Uninitialized));
        assert_eq!(
            vm.reserve(asid, 0x4fff, false, PageInit::Uninitialized),
            Err(VmError::DuplicatePage(VirtPageNum(4)))
        );
        vm.resolve_fault(asid, 0x4abc).unwrap();
        assert!(vm.evict_page(asid, 0x4000).unwrap());
        vm.remove(asid, 0x4000).unwrap();
        assert_eq!(vm.swap().used_slots(), 0);
    }
}
