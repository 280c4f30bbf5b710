//! Small subsystems assembled from the in-memory collaborators.

use crate::block::block_core::{Block, BlockOp, BlockSector};
use crate::block::block_error::BlockError;
use crate::drivers::ram_disk::RamDisk;
use crate::mem::config::VmConfig;
use crate::mem::frame_allocator::FramePool;
use crate::mem::frame_table::FrameTable;
use crate::mem::page_table::AddressSpace;
use crate::mem::FrameBuffer;
use crate::paging::{AddressTranslation, PageDirectory};
use crate::swapping::{SwapStore, SECTORS_PER_FRAME};
use crate::system::VirtualMemory;
use crate::threading::process::Asid;
use kidneyos_shared::mem::{PhysicalPage, VirtPageNum, PAGE_FRAME_SIZE};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

pub type TestVm = VirtualMemory<FramePool, FailingDisk>;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// A page whose bytes depend on `seed` and position.
pub fn pattern(seed: u8) -> FrameBuffer {
    let mut frame = [0; PAGE_FRAME_SIZE];
    for (i, byte) in frame.iter_mut().enumerate() {
        *byte = seed.wrapping_mul(31).wrapping_add(i as u8);
    }
    frame
}

/// Makes a [`FailingDisk`] fail on demand after it has been handed off.
#[derive(Clone, Default)]
pub struct FaultSwitch {
    reads: Arc<AtomicBool>,
    writes: Arc<AtomicBool>,
}

impl FaultSwitch {
    pub fn fail_reads(&self, fail: bool) {
        self.reads.store(fail, Ordering::SeqCst);
    }

    pub fn fail_writes(&self, fail: bool) {
        self.writes.store(fail, Ordering::SeqCst);
    }
}

pub struct FailingDisk {
    inner: RamDisk,
    switch: FaultSwitch,
}

impl FailingDisk {
    pub fn new(inner: RamDisk) -> Self {
        Self {
            inner,
            switch: FaultSwitch::default(),
        }
    }

    pub fn switch(&self) -> FaultSwitch {
        self.switch.clone()
    }

    pub fn fail_reads(&self, fail: bool) {
        self.switch.fail_reads(fail);
    }

    pub fn fail_writes(&self, fail: bool) {
        self.switch.fail_writes(fail);
    }
}

impl BlockOp for FailingDisk {
    fn read(&mut self, sector: BlockSector, buf: &mut [u8]) -> Result<(), BlockError> {
        if self.switch.reads.load(Ordering::SeqCst) {
            return Err(BlockError::ReadError);
        }
        self.inner.read(sector, buf)
    }

    fn write(&mut self, sector: BlockSector, buf: &[u8]) -> Result<(), BlockError> {
        if self.switch.writes.load(Ordering::SeqCst) {
            return Err(BlockError::WriteError);
        }
        self.inner.write(sector, buf)
    }

    fn sector_count(&self) -> BlockSector {
        self.inner.sector_count()
    }
}

fn swap_device(slots: u32) -> (Block<FailingDisk>, FaultSwitch) {
    let disk = FailingDisk::new(RamDisk::new(slots * SECTORS_PER_FRAME));
    let switch = disk.switch();
    (Block::new("swap", disk), switch)
}

/// A frame table and swap store without the address space registry.
pub struct Fixture {
    pub frames: FrameTable<FramePool>,
    pub swap: SwapStore<FailingDisk>,
    pub disk: FaultSwitch,
}

impl Fixture {
    pub fn new(frames: usize, slots: u32) -> Self {
        init_logging();
        let (device, disk) = swap_device(slots);
        Self {
            frames: FrameTable::new(FramePool::new(frames)),
            swap: SwapStore::new(device),
            disk,
        }
    }

    pub fn space(&self, asid: Asid) -> Arc<AddressSpace> {
        AddressSpace::new(asid, Box::new(PageDirectory::new()))
    }

    /// A space whose page directory stays reachable, standing in for the MMU.
    pub fn space_with_directory(&self, asid: Asid) -> (Arc<AddressSpace>, SharedDirectory) {
        let directory = SharedDirectory::default();
        (AddressSpace::new(asid, Box::new(directory.clone())), directory)
    }
}

#[derive(Clone, Default)]
pub struct SharedDirectory(Arc<Mutex<PageDirectory>>);

impl SharedDirectory {
    pub fn mark_accessed(&self, page: VirtPageNum) -> bool {
        self.0.lock().unwrap().mark_accessed(page)
    }
}

impl AddressTranslation for SharedDirectory {
    fn map(&mut self, page: VirtPageNum, frame: PhysicalPage, writable: bool) -> bool {
        self.0.lock().unwrap().map(page, frame, writable)
    }

    fn unmap(&mut self, page: VirtPageNum) {
        self.0.lock().unwrap().unmap(page);
    }

    fn translate(&self, addr: usize) -> Option<PhysicalPage> {
        self.0.lock().unwrap().translate(addr)
    }

    fn take_accessed(&mut self, page: VirtPageNum) -> bool {
        self.0.lock().unwrap().take_accessed(page)
    }
}

pub fn vm(frames: usize, slots: u32) -> (TestVm, FaultSwitch) {
    vm_with(VmConfig::DEFAULT, frames, slots)
}

pub fn vm_with(config: VmConfig, frames: usize, slots: u32) -> (TestVm, FaultSwitch) {
    init_logging();
    let (device, switch) = swap_device(slots);
    (VirtualMemory::new(config, FramePool::new(frames), device), switch)
}
