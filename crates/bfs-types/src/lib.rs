#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Device sector size. The block layer always addresses 512-byte sectors,
/// regardless of the filesystem block size stacked on top.
pub const SECTOR_SIZE: usize = 512;

/// Host page shift. Managed memory objects are populated at page
/// granularity.
pub const PAGE_SHIFT: u32 = 12;

/// Host page size in bytes.
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;

pub const EXT2_SUPERBLOCK_OFFSET: usize = 1024;
pub const EXT2_SUPERBLOCK_SIZE: usize = 1024;
pub const EXT2_SUPER_MAGIC: u16 = 0xEF53;

/// The group descriptor table starts at the first block boundary at or
/// after this byte offset.
pub const EXT2_GROUP_DESC_TABLE_BASE: usize = 2048;

/// Size of one on-disk block group descriptor.
pub const EXT2_GROUP_DESC_SIZE: usize = 32;

/// Number of direct block pointers in an inode.
pub const EXT2_NUM_DIRECT: usize = 12;

/// Byte size of a directory record header (inode, record length, name
/// length, file type).
pub const EXT2_DIRENT_HEADER: usize = 8;

// ── Inode mode bits ─────────────────────────────────────────────────────────

pub const S_IFMT: u16 = 0xF000;
pub const S_IFREG: u16 = 0x8000;
pub const S_IFLNK: u16 = 0xA000;
pub const S_IFDIR: u16 = 0x4000;

// ── Directory record file-type codes ────────────────────────────────────────

pub const EXT2_FT_REG_FILE: u8 = 1;
pub const EXT2_FT_DIR: u8 = 2;
pub const EXT2_FT_SYMLINK: u8 = 7;

// ── Unit-carrying newtypes ──────────────────────────────────────────────────

/// Absolute filesystem block number (32-bit on disk; 0 means hole/absent).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockNumber(pub u32);

impl fmt::Display for BlockNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Absolute 512-byte sector number on the underlying device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SectorNumber(pub u64);

impl fmt::Display for SectorNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Inode number. Valid numbers start at 1; the root directory is inode 2.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct InodeNumber(pub u32);

impl InodeNumber {
    pub const ROOT: Self = Self(2);
}

impl fmt::Display for InodeNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ── Alignment helpers ───────────────────────────────────────────────────────

/// Round `value` up to the next multiple of `align`. `align` must be a
/// power of two.
#[must_use]
pub fn align_up(value: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two());
    (value + align - 1) & !(align - 1)
}

/// Round a byte count up to whole host pages.
#[must_use]
pub fn page_align_up(value: usize) -> usize {
    align_up(value, PAGE_SIZE)
}

/// Decode the superblock's log-block-size field. Valid values give block
/// sizes of 1 KiB through 64 KiB.
#[must_use]
pub fn block_size_from_log(log_block_size: u32) -> Option<u32> {
    if log_block_size > 6 {
        return None;
    }
    Some(1024_u32 << log_block_size)
}

// ── On-disk decoding errors ─────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("need {needed} bytes at offset {offset}, have {actual}")]
    InsufficientData {
        needed: usize,
        offset: usize,
        actual: usize,
    },

    #[error("invalid magic: expected {expected:#06x}, found {actual:#06x}")]
    InvalidMagic { expected: u64, actual: u64 },

    #[error("invalid field {field}: {reason}")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
}

/// Borrow `len` bytes at `offset`, or report how much was missing.
pub fn ensure_slice(data: &[u8], offset: usize, len: usize) -> Result<&[u8], ParseError> {
    let end = offset
        .checked_add(len)
        .ok_or(ParseError::InvalidField {
            field: "offset",
            reason: "offset + length overflows",
        })?;
    if end > data.len() {
        return Err(ParseError::InsufficientData {
            needed: len,
            offset,
            actual: data.len().saturating_sub(offset),
        });
    }
    Ok(&data[offset..end])
}

pub fn read_le_u16(data: &[u8], offset: usize) -> Result<u16, ParseError> {
    let bytes = ensure_slice(data, offset, 2)?;
    Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
}

pub fn read_le_u32(data: &[u8], offset: usize) -> Result<u32, ParseError> {
    let bytes = ensure_slice(data, offset, 4)?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

pub fn read_fixed<const N: usize>(data: &[u8], offset: usize) -> Result<[u8; N], ParseError> {
    let bytes = ensure_slice(data, offset, N)?;
    let mut out = [0_u8; N];
    out.copy_from_slice(bytes);
    Ok(out)
}
