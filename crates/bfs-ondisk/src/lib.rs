#![forbid(unsafe_code)]
//! On-disk ext2 structure decoding.
//!
//! Every structure is parsed field-by-field with explicit little-endian
//! offsets; nothing is blitted. The four structures the driver core
//! consumes are the superblock, the block group descriptor, the raw inode
//! record, and the variable-length directory record.

use bfs_types::{
    EXT2_DIRENT_HEADER, EXT2_FT_DIR, EXT2_FT_REG_FILE, EXT2_FT_SYMLINK, EXT2_GROUP_DESC_SIZE,
    EXT2_SUPER_MAGIC, EXT2_SUPERBLOCK_SIZE, ParseError, S_IFDIR, S_IFLNK, S_IFMT, S_IFREG,
    block_size_from_log, ensure_slice, read_fixed, read_le_u16, read_le_u32,
};
use serde::{Deserialize, Serialize};

/// Byte length of the block-pointer area in an inode record: 12 direct
/// pointers plus the three indirection roots.
pub const INODE_POINTER_AREA: usize = 60;

/// Index of the single-indirect root in the 15-entry pointer array.
pub const SINGLE_INDIRECT_SLOT: usize = 12;
/// Index of the double-indirect root.
pub const DOUBLE_INDIRECT_SLOT: usize = 13;
/// Index of the triple-indirect root.
pub const TRIPLE_INDIRECT_SLOT: usize = 14;

// ── Superblock ──────────────────────────────────────────────────────────────

/// Parsed superblock, reduced to the fields the driver consumes plus the
/// feature words surfaced for inspection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Superblock {
    pub inodes_count: u32,
    pub blocks_count: u32,
    pub first_data_block: u32,
    pub log_block_size: u32,
    pub block_size: u32,
    pub blocks_per_group: u32,
    pub inodes_per_group: u32,
    pub inode_size: u16,
    pub magic: u16,
    pub state: u16,
    pub rev_level: u32,
    pub feature_compat: u32,
    pub feature_incompat: u32,
    pub feature_ro_compat: u32,
}

impl Superblock {
    /// Parse a superblock from the 1024-byte region at device byte offset
    /// 1024. The magic is validated first; geometry fields after.
    pub fn parse(region: &[u8]) -> Result<Self, ParseError> {
        if region.len() < EXT2_SUPERBLOCK_SIZE {
            return Err(ParseError::InsufficientData {
                needed: EXT2_SUPERBLOCK_SIZE,
                offset: 0,
                actual: region.len(),
            });
        }

        let magic = read_le_u16(region, 56)?;
        if magic != EXT2_SUPER_MAGIC {
            return Err(ParseError::InvalidMagic {
                expected: u64::from(EXT2_SUPER_MAGIC),
                actual: u64::from(magic),
            });
        }

        let log_block_size = read_le_u32(region, 24)?;
        let Some(block_size) = block_size_from_log(log_block_size) else {
            return Err(ParseError::InvalidField {
                field: "log_block_size",
                reason: "block size out of range",
            });
        };

        let blocks_per_group = read_le_u32(region, 32)?;
        if blocks_per_group == 0 {
            return Err(ParseError::InvalidField {
                field: "blocks_per_group",
                reason: "must be nonzero",
            });
        }
        let inodes_per_group = read_le_u32(region, 40)?;
        if inodes_per_group == 0 {
            return Err(ParseError::InvalidField {
                field: "inodes_per_group",
                reason: "must be nonzero",
            });
        }

        let rev_level = read_le_u32(region, 76)?;
        // Revision 0 predates variable inode sizes.
        let inode_size = if rev_level == 0 {
            128
        } else {
            read_le_u16(region, 88)?
        };
        if inode_size < 128 || !inode_size.is_power_of_two() {
            return Err(ParseError::InvalidField {
                field: "inode_size",
                reason: "must be a power of two >= 128",
            });
        }

        Ok(Self {
            inodes_count: read_le_u32(region, 0)?,
            blocks_count: read_le_u32(region, 4)?,
            first_data_block: read_le_u32(region, 20)?,
            log_block_size,
            block_size,
            blocks_per_group,
            inodes_per_group,
            inode_size,
            magic,
            state: read_le_u16(region, 58)?,
            rev_level,
            feature_compat: read_le_u32(region, 92)?,
            feature_incompat: read_le_u32(region, 96)?,
            feature_ro_compat: read_le_u32(region, 100)?,
        })
    }
}

// ── Block group descriptor ──────────────────────────────────────────────────

/// One 32-byte block group descriptor. The core consumes `inode_table`;
/// the bitmap locations and free counts are parsed for inspection
/// surfaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupDesc {
    pub block_bitmap: u32,
    pub inode_bitmap: u32,
    pub inode_table: u32,
    pub free_blocks_count: u16,
    pub free_inodes_count: u16,
    pub used_dirs_count: u16,
}

impl GroupDesc {
    pub fn parse(data: &[u8]) -> Result<Self, ParseError> {
        Ok(Self {
            block_bitmap: read_le_u32(data, 0)?,
            inode_bitmap: read_le_u32(data, 4)?,
            inode_table: read_le_u32(data, 8)?,
            free_blocks_count: read_le_u16(data, 12)?,
            free_inodes_count: read_le_u16(data, 14)?,
            used_dirs_count: read_le_u16(data, 16)?,
        })
    }

    /// Parse `count` consecutive descriptors from a descriptor table
    /// buffer.
    pub fn parse_table(data: &[u8], count: usize) -> Result<Vec<Self>, ParseError> {
        let mut descs = Vec::with_capacity(count);
        for index in 0..count {
            let raw = ensure_slice(data, index * EXT2_GROUP_DESC_SIZE, EXT2_GROUP_DESC_SIZE)?;
            descs.push(Self::parse(raw)?);
        }
        Ok(descs)
    }
}

// ── File kinds ──────────────────────────────────────────────────────────────

/// File classification shared by inode modes and directory records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileKind {
    Regular,
    Directory,
    Symlink,
    Unknown,
}

impl FileKind {
    /// Classify an inode mode. Returns `None` for types the driver does
    /// not handle (FIFOs, sockets, device nodes).
    #[must_use]
    pub fn from_mode(mode: u16) -> Option<Self> {
        match mode & S_IFMT {
            S_IFREG => Some(Self::Regular),
            S_IFDIR => Some(Self::Directory),
            S_IFLNK => Some(Self::Symlink),
            _ => None,
        }
    }

    /// Decode a directory record's file-type byte.
    #[must_use]
    pub fn from_dirent(raw: u8) -> Self {
        match raw {
            EXT2_FT_REG_FILE => Self::Regular,
            EXT2_FT_DIR => Self::Directory,
            EXT2_FT_SYMLINK => Self::Symlink,
            _ => Self::Unknown,
        }
    }
}

// ── Inode record ────────────────────────────────────────────────────────────

/// A raw on-disk inode record.
///
/// `block_ptrs` holds the 15-entry pointer array (12 direct pointers and
/// the three indirection roots); `pointer_bytes` keeps the same 60 bytes
/// undecoded, because symlinks shorter than 60 bytes store their target
/// there instead of block pointers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawInode {
    pub mode: u16,
    pub uid: u16,
    pub gid: u16,
    pub size: u32,
    pub atime: u32,
    pub ctime: u32,
    pub mtime: u32,
    pub dtime: u32,
    pub links_count: u16,
    pub sector_count: u32,
    pub flags: u32,
    pub block_ptrs: [u32; 15],
    pub pointer_bytes: Vec<u8>,
}

impl RawInode {
    /// Parse an inode record. Requires at least the 128-byte base area.
    pub fn parse_from_bytes(bytes: &[u8]) -> Result<Self, ParseError> {
        if bytes.len() < 128 {
            return Err(ParseError::InsufficientData {
                needed: 128,
                offset: 0,
                actual: bytes.len(),
            });
        }

        let pointer_bytes = read_fixed::<INODE_POINTER_AREA>(bytes, 40)?.to_vec();
        let mut block_ptrs = [0_u32; 15];
        for (slot, ptr) in block_ptrs.iter_mut().enumerate() {
            *ptr = read_le_u32(&pointer_bytes, slot * 4)?;
        }

        Ok(Self {
            mode: read_le_u16(bytes, 0)?,
            uid: read_le_u16(bytes, 2)?,
            gid: read_le_u16(bytes, 24)?,
            size: read_le_u32(bytes, 4)?,
            atime: read_le_u32(bytes, 8)?,
            ctime: read_le_u32(bytes, 12)?,
            mtime: read_le_u32(bytes, 16)?,
            dtime: read_le_u32(bytes, 20)?,
            links_count: read_le_u16(bytes, 26)?,
            sector_count: read_le_u32(bytes, 28)?,
            flags: read_le_u32(bytes, 32)?,
            block_ptrs,
            pointer_bytes,
        })
    }

    /// The 12 direct block pointers.
    #[must_use]
    pub fn direct(&self) -> &[u32] {
        &self.block_ptrs[..SINGLE_INDIRECT_SLOT]
    }

    #[must_use]
    pub fn single_indirect(&self) -> u32 {
        self.block_ptrs[SINGLE_INDIRECT_SLOT]
    }

    #[must_use]
    pub fn double_indirect(&self) -> u32 {
        self.block_ptrs[DOUBLE_INDIRECT_SLOT]
    }

    #[must_use]
    pub fn triple_indirect(&self) -> u32 {
        self.block_ptrs[TRIPLE_INDIRECT_SLOT]
    }
}

/// Decode a buffer of little-endian u32 block pointers.
#[must_use]
pub fn decode_block_pointers(bytes: &[u8]) -> Vec<u32> {
    bytes
        .chunks_exact(4)
        .map(|chunk| u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

// ── Directory records ───────────────────────────────────────────────────────

/// A decoded variable-length directory record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirRecord {
    pub inode: u32,
    pub record_length: u16,
    pub name_length: u8,
    pub file_type: u8,
    pub name: Vec<u8>,
}

impl DirRecord {
    /// The name as a UTF-8 string (lossy).
    #[must_use]
    pub fn name_str(&self) -> String {
        String::from_utf8_lossy(&self.name).into_owned()
    }
}

/// Decode one directory record at `offset`.
///
/// Validates that the header fits, that `record_length` covers the header
/// and the name, and that the record does not overrun the buffer.
/// `record_length` is the advance to the next record.
pub fn read_dir_record(data: &[u8], offset: usize) -> Result<DirRecord, ParseError> {
    if offset + EXT2_DIRENT_HEADER > data.len() {
        return Err(ParseError::InsufficientData {
            needed: EXT2_DIRENT_HEADER,
            offset,
            actual: data.len().saturating_sub(offset),
        });
    }

    let inode = read_le_u32(data, offset)?;
    let record_length = read_le_u16(data, offset + 4)?;
    let name_length = ensure_slice(data, offset + 6, 1)?[0];
    let file_type = ensure_slice(data, offset + 7, 1)?[0];

    if usize::from(record_length) < EXT2_DIRENT_HEADER + usize::from(name_length) {
        return Err(ParseError::InvalidField {
            field: "record_length",
            reason: "shorter than header plus name",
        });
    }
    if offset + usize::from(record_length) > data.len() {
        return Err(ParseError::InvalidField {
            field: "record_length",
            reason: "record extends past end of directory",
        });
    }

    let name = ensure_slice(data, offset + EXT2_DIRENT_HEADER, usize::from(name_length))?.to_vec();

    Ok(DirRecord {
        inode,
        record_length,
        name_length,
        file_type,
        name,
    })
}
