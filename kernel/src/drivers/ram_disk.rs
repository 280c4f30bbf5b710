use crate::block::block_core::{BlockOp, BlockSector, BLOCK_SECTOR_SIZE};
use crate::block::block_error::BlockError;
use alloc::{vec, vec::Vec};

/// A block device backed by kernel memory. Contents are lost when it is dropped.
pub struct RamDisk {
    data: Vec<u8>,
    sectors: BlockSector,
}

impl RamDisk {
    pub fn new(sectors: BlockSector) -> Self {
        Self {
            data: vec![0; sectors as usize * BLOCK_SECTOR_SIZE],
            sectors,
        }
    }

    fn range(&self, sector: BlockSector) -> Result<core::ops::Range<usize>, BlockError> {
        if sector >= self.sectors {
            return Err(BlockError::SectorOutOfBounds);
        }
        let start = sector as usize * BLOCK_SECTOR_SIZE;
        Ok(start..start + BLOCK_SECTOR_SIZE)
    }
}

impl BlockOp for RamDisk {
    fn read(&mut self, sector: BlockSector, buf: &mut [u8]) -> Result<(), BlockError> {
        let range = self.range(sector)?;
        buf.copy_from_slice(&self.data[range]);
        Ok(())
    }

    fn write(&mut self, sector: BlockSector, buf: &[u8]) -> Result<(), BlockError> {
        let range = self.range(sector)?;
        self.data[range].copy_from_slice(buf);
        Ok(())
    }

    fn sector_count(&self) -> BlockSector {
        self.sectors
    }
}
