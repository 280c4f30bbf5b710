//! Swap space: page-sized slots on a block device holding evicted frames.
//!
//! The slot index and the device have separate locks. Reserving or releasing
//! a slot never waits behind a transfer, and transfers to different slots
//! still go through the device one at a time.

pub mod page_replacement;
mod slot_bitmap;

use crate::block::block_core::{Block, BlockOp, BlockSector, BLOCK_SECTOR_SIZE};
use crate::mem::{FrameBuffer, Result, VmError};
use crate::sync::mutex::Mutex;
use core::fmt;
use kidneyos_shared::mem::PAGE_FRAME_SIZE;
use log::{error, trace};
use slot_bitmap::SlotBitmap;

/// Number of device sectors backing one swap slot.
#[allow(clippy::cast_possible_truncation)]
pub const SECTORS_PER_FRAME: BlockSector = (PAGE_FRAME_SIZE / BLOCK_SECTOR_SIZE) as BlockSector;

/// Index of a page-sized slot in swap space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SlotId(pub u32);

impl SlotId {
    fn first_sector(self) -> BlockSector {
        self.0 * SECTORS_PER_FRAME
    }
}

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub struct SwapStore<B: BlockOp> {
    slots: Mutex<SlotBitmap>,
    device: Mutex<Block<B>>,
}

impl<B: BlockOp> SwapStore<B> {
    /// Carves `device` into page-sized slots. Trailing sectors that do not
    /// fill a whole slot are left unused.
    pub fn new(device: Block<B>) -> Self {
        let slot_count = device.get_size() / SECTORS_PER_FRAME;
        log::info!("swap: {device}, {slot_count} slots");
        Self {
            slots: Mutex::new(SlotBitmap::new(slot_count)),
            device: Mutex::new(device),
        }
    }

    pub fn slot_count(&self) -> u32 {
        self.slots.lock().len()
    }

    pub fn used_slots(&self) -> u32 {
        self.slots.lock().used()
    }

    pub fn is_reserved(&self, slot: SlotId) -> bool {
        self.slots.lock().test(slot.0)
    }

    /// Claims the lowest-numbered free slot.
    pub fn reserve_slot(&self) -> Result<SlotId> {
        let slot = self.slots.lock().scan_and_set().ok_or(VmError::OutOfSwap)?;
        trace!("swap: reserved slot {slot}");
        Ok(SlotId(slot))
    }

    /// Returns `slot` to the free pool. The slot's contents are not erased.
    pub fn release_slot(&self, slot: SlotId) -> Result<()> {
        if !self.slots.lock().reset(slot.0) {
            error!("swap: releasing slot {slot} which is not reserved");
            return Err(VmError::SlotNotReserved(slot));
        }
        trace!("swap: released slot {slot}");
        Ok(())
    }

    fn check_reserved(&self, slot: SlotId) -> Result<()> {
        if !self.is_reserved(slot) {
            error!("swap: transfer to slot {slot} which is not reserved");
            return Err(VmError::SlotNotReserved(slot));
        }
        Ok(())
    }

    /// Writes a full frame to `slot`.
    pub fn write_frame(&self, slot: SlotId, frame: &FrameBuffer) -> Result<()> {
        self.check_reserved(slot)?;
        let mut device = self.device.lock();
        for (sector, chunk) in (slot.first_sector()..).zip(frame.chunks_exact(BLOCK_SECTOR_SIZE)) {
            device.write(sector, chunk).inspect_err(|err| {
                error!("swap: writing slot {slot} failed at sector {sector}: {err}");
            })?;
        }
        Ok(())
    }

    /// Reads the full frame stored in `slot`. The slot stays reserved.
    pub fn read_frame(&self, slot: SlotId, frame: &mut FrameBuffer) -> Result<()> {
        self.check_reserved(slot)?;
        let mut device = self.device.lock();
        for (sector, chunk) in
            (slot.first_sector()..).zip(frame.chunks_exact_mut(BLOCK_SECTOR_SIZE))
        {
            device.read(sector, chunk).inspect_err(|err| {
                error!("swap: reading slot {slot} failed at sector {sector}: {err}");
            })?;
        }
        Ok(())
    }
}
