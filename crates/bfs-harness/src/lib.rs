#![forbid(unsafe_code)]
//! Test harness for blockfs.
//!
//! [`ImageBuilder`] constructs small, valid ext2 images entirely in
//! memory: one block group, a 64-entry inode table, and whatever blocks
//! the test writes. Conformance tests mount the result on a counting
//! sector device and assert on the exact reads the driver issues.

use anyhow::Result;
use bfs_block::{CountingSectorDevice, MemorySectorDevice, SectorDevice};
use bfs_ext2::FileSystem;
use bfs_types::{
    EXT2_DIRENT_HEADER, EXT2_GROUP_DESC_TABLE_BASE, EXT2_SUPER_MAGIC, EXT2_SUPERBLOCK_OFFSET,
    S_IFLNK, align_up,
};
use std::sync::Arc;

/// The device stack conformance tests mount on: every read the driver
/// issues is recorded.
pub type TestDevice = CountingSectorDevice<MemorySectorDevice>;

/// Mount an image on a counting in-memory device.
pub fn mount(image: Vec<u8>) -> Result<(FileSystem, Arc<TestDevice>)> {
    let device = Arc::new(CountingSectorDevice::new(MemorySectorDevice::new(image)));
    let fs = FileSystem::init(Arc::clone(&device) as Arc<dyn SectorDevice>)?;
    Ok((fs, device))
}

/// Builds a single-group ext2 image in memory.
///
/// The layout is fixed: superblock at byte 1024, the group descriptor
/// table at the first block boundary at or after byte 2048, the inode
/// table right after it, and free blocks beyond. Tests may also write
/// any block directly to construct specific physical placements.
pub struct ImageBuilder {
    block_size: u32,
    total_blocks: u32,
    inodes_per_group: u32,
    inode_size: u16,
    inode_table_block: u32,
    next_block: u32,
    data: Vec<u8>,
}

impl ImageBuilder {
    /// Create a builder for an image of `total_blocks` blocks. Block
    /// sizes of 1024, 2048, and 4096 are supported.
    #[must_use]
    pub fn new(block_size: u32, total_blocks: u32) -> Self {
        assert!(
            matches!(block_size, 1024 | 2048 | 4096),
            "unsupported block size {block_size}"
        );
        let bs = block_size as usize;
        let inodes_per_group = 64_u32;
        let inode_size = 128_u16;

        let bgdt_block = (align_up(EXT2_GROUP_DESC_TABLE_BASE, bs) / bs) as u32;
        let inode_table_block = bgdt_block + 1;
        let table_blocks =
            ((inodes_per_group as usize * usize::from(inode_size)).div_ceil(bs)) as u32;

        Self {
            block_size,
            total_blocks,
            inodes_per_group,
            inode_size,
            inode_table_block,
            next_block: inode_table_block + table_blocks,
            data: vec![0_u8; bs * total_blocks as usize],
        }
    }

    #[must_use]
    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    /// Hand out the next free block after the metadata area.
    pub fn alloc_block(&mut self) -> u32 {
        let block = self.next_block;
        assert!(block < self.total_blocks, "image out of blocks");
        self.next_block += 1;
        block
    }

    /// Write `bytes` at the start of `block`; the rest stays zeroed.
    pub fn write_block(&mut self, block: u32, bytes: &[u8]) {
        let bs = self.block_size as usize;
        assert!(bytes.len() <= bs, "block overflow");
        assert!(block < self.total_blocks, "block {block} outside image");
        let start = block as usize * bs;
        self.data[start..start + bytes.len()].copy_from_slice(bytes);
    }

    /// Fill an entire block with one byte value.
    pub fn fill_block(&mut self, block: u32, value: u8) {
        let bs = self.block_size as usize;
        let pattern = vec![value; bs];
        self.write_block(block, &pattern);
    }

    /// Write a block of little-endian u32 block pointers (an indirect
    /// block).
    pub fn write_pointer_block(&mut self, block: u32, pointers: &[u32]) {
        let mut bytes = Vec::with_capacity(pointers.len() * 4);
        for pointer in pointers {
            bytes.extend_from_slice(&pointer.to_le_bytes());
        }
        self.write_block(block, &bytes);
    }

    /// Install an inode record with the given mode, size, and block
    /// pointers (up to 12 direct plus the three indirection roots).
    pub fn put_inode(&mut self, number: u32, mode: u16, size: u32, block_ptrs: &[u32]) {
        assert!(block_ptrs.len() <= 15, "too many block pointers");
        let mut record = vec![0_u8; usize::from(self.inode_size)];
        record[0..2].copy_from_slice(&mode.to_le_bytes());
        record[4..8].copy_from_slice(&size.to_le_bytes());
        record[26..28].copy_from_slice(&1_u16.to_le_bytes()); // links count
        record[28..32].copy_from_slice(&size.div_ceil(512).to_le_bytes());
        for (slot, pointer) in block_ptrs.iter().enumerate() {
            let at = 40 + slot * 4;
            record[at..at + 4].copy_from_slice(&pointer.to_le_bytes());
        }
        self.put_raw_inode(number, &record);
    }

    /// Install a fast symlink: the target lives inline in the pointer
    /// area of the inode record.
    pub fn put_symlink_inode(&mut self, number: u32, target: &str) {
        assert!(target.len() < 60, "fast symlink targets are under 60 bytes");
        let mut record = vec![0_u8; usize::from(self.inode_size)];
        record[0..2].copy_from_slice(&(S_IFLNK | 0o777).to_le_bytes());
        #[expect(clippy::cast_possible_truncation)]
        record[4..8].copy_from_slice(&(target.len() as u32).to_le_bytes());
        record[26..28].copy_from_slice(&1_u16.to_le_bytes());
        record[40..40 + target.len()].copy_from_slice(target.as_bytes());
        self.put_raw_inode(number, &record);
    }

    fn put_raw_inode(&mut self, number: u32, record: &[u8]) {
        assert!(
            number >= 1 && number <= self.inodes_per_group,
            "inode {number} outside the table"
        );
        let bs = self.block_size as usize;
        let offset = self.inode_table_block as usize * bs
            + (number - 1) as usize * usize::from(self.inode_size);
        self.data[offset..offset + record.len()].copy_from_slice(record);
    }

    /// Write the superblock and group descriptor table, returning the
    /// finished image.
    #[must_use]
    pub fn build(mut self) -> Vec<u8> {
        let bs = self.block_size as usize;

        let mut sb = vec![0_u8; 1024];
        sb[0..4].copy_from_slice(&self.inodes_per_group.to_le_bytes());
        sb[4..8].copy_from_slice(&self.total_blocks.to_le_bytes());
        sb[20..24].copy_from_slice(&u32::from(self.block_size == 1024).to_le_bytes());
        sb[24..28].copy_from_slice(&(self.block_size.trailing_zeros() - 10).to_le_bytes());
        sb[32..36].copy_from_slice(&self.total_blocks.to_le_bytes()); // blocks per group
        sb[40..44].copy_from_slice(&self.inodes_per_group.to_le_bytes());
        sb[56..58].copy_from_slice(&EXT2_SUPER_MAGIC.to_le_bytes());
        sb[58..60].copy_from_slice(&1_u16.to_le_bytes()); // clean state
        sb[76..80].copy_from_slice(&1_u32.to_le_bytes()); // revision
        sb[88..90].copy_from_slice(&self.inode_size.to_le_bytes());
        self.data[EXT2_SUPERBLOCK_OFFSET..EXT2_SUPERBLOCK_OFFSET + 1024].copy_from_slice(&sb);

        let mut desc = vec![0_u8; 32];
        desc[8..12].copy_from_slice(&self.inode_table_block.to_le_bytes());
        let bgdt_offset = align_up(EXT2_GROUP_DESC_TABLE_BASE, bs);
        self.data[bgdt_offset..bgdt_offset + 32].copy_from_slice(&desc);

        self.data
    }
}

/// Encode one directory record. `record_length` is the advance to the
/// next record and may exceed the encoded name to pad out a block.
#[must_use]
pub fn dir_record(inode: u32, record_length: u16, file_type: u8, name: &[u8]) -> Vec<u8> {
    assert!(name.len() <= 255);
    assert!(usize::from(record_length) >= EXT2_DIRENT_HEADER + name.len());
    let mut bytes = vec![0_u8; usize::from(record_length)];
    bytes[0..4].copy_from_slice(&inode.to_le_bytes());
    bytes[4..6].copy_from_slice(&record_length.to_le_bytes());
    #[expect(clippy::cast_possible_truncation)]
    {
        bytes[6] = name.len() as u8;
    }
    bytes[7] = file_type;
    bytes[8..8 + name.len()].copy_from_slice(name);
    bytes
}

/// An unused filler record stretching `record_length` bytes, as ext2
/// uses to pad directories out to a block boundary.
#[must_use]
pub fn pad_record(record_length: u16) -> Vec<u8> {
    dir_record(0, record_length, 0, b"")
}
