use bfs_error::{BfsError, Result};
use bfs_ondisk::Superblock;
use bfs_types::{BlockNumber, PAGE_SHIFT, SECTOR_SIZE, SectorNumber};

/// Superblock-derived filesystem geometry, immutable after init.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    /// Size of one on-disk inode record in bytes.
    pub inode_size: u32,
    /// log2 of the block size.
    pub block_shift: u32,
    pub block_size: u32,
    pub sectors_per_block: u32,
    /// log2 of the stride of one block inside a managed window; blocks
    /// smaller than a page still occupy a whole page there.
    pub block_pages_shift: u32,
    pub num_block_groups: u32,
    pub inodes_per_group: u32,
}

impl Geometry {
    pub fn from_superblock(sb: &Superblock) -> Result<Self> {
        let block_shift = 10 + sb.log_block_size;
        if block_shift > PAGE_SHIFT {
            return Err(BfsError::Format(format!(
                "block size {} exceeds the host page size",
                sb.block_size
            )));
        }
        Ok(Self {
            inode_size: u32::from(sb.inode_size),
            block_shift,
            block_size: sb.block_size,
            sectors_per_block: sb.block_size / SECTOR_SIZE as u32,
            block_pages_shift: block_shift.max(PAGE_SHIFT),
            num_block_groups: sb.blocks_count.div_ceil(sb.blocks_per_group),
            inodes_per_group: sb.inodes_per_group,
        })
    }

    /// First sector of a filesystem block.
    #[must_use]
    pub fn first_sector(&self, block: BlockNumber) -> SectorNumber {
        SectorNumber(u64::from(block.0) * u64::from(self.sectors_per_block))
    }

    /// Number of 32-bit block pointers held by one block.
    #[must_use]
    pub fn pointers_per_block(&self) -> u32 {
        self.block_size / 4
    }

    /// Byte stride of one block slot inside a managed window.
    #[must_use]
    pub fn slot_bytes(&self) -> usize {
        1_usize << self.block_pages_shift
    }
}
