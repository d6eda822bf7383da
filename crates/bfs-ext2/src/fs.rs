use crate::geometry::Geometry;
use crate::inode::{self, Inode};
use bfs_block::SectorDevice;
use bfs_error::Result;
use bfs_ondisk::{GroupDesc, Superblock};
use bfs_types::{
    EXT2_GROUP_DESC_SIZE, EXT2_GROUP_DESC_TABLE_BASE, EXT2_SUPERBLOCK_OFFSET,
    EXT2_SUPERBLOCK_SIZE, InodeNumber, SECTOR_SIZE, SectorNumber, align_up,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tracing::info;

/// State shared by the filesystem handle, its inodes, and their servicer
/// threads.
pub(crate) struct FsShared {
    pub(crate) device: Arc<dyn SectorDevice>,
    pub(crate) geometry: Geometry,
    pub(crate) group_descs: Vec<GroupDesc>,
    /// Inode registry: number → non-owning back-reference. A dead entry
    /// stays until the number is accessed again; the registry never
    /// extends inode lifetime.
    registry: Mutex<HashMap<u32, Weak<Inode>>>,
}

/// A mounted read-only ext2 filesystem.
pub struct FileSystem {
    shared: Arc<FsShared>,
}

impl FileSystem {
    /// Read and validate the superblock, derive the geometry, and load
    /// the block group descriptor table.
    pub fn init(device: Arc<dyn SectorDevice>) -> Result<Self> {
        let mut region = vec![0_u8; EXT2_SUPERBLOCK_SIZE];
        device.read_sectors(
            SectorNumber((EXT2_SUPERBLOCK_OFFSET / SECTOR_SIZE) as u64),
            &mut region,
        )?;
        let sb = Superblock::parse(&region)?;
        let geometry = Geometry::from_superblock(&sb)?;

        info!(
            target: "bfs::ext2",
            block_size = geometry.block_size,
            block_groups = geometry.num_block_groups,
            feature_compat = sb.feature_compat,
            feature_incompat = sb.feature_incompat,
            feature_ro_compat = sb.feature_ro_compat,
            "mounted ext2 filesystem"
        );

        let bgdt_offset = align_up(EXT2_GROUP_DESC_TABLE_BASE, geometry.block_size as usize);
        let bgdt_size = align_up(
            geometry.num_block_groups as usize * EXT2_GROUP_DESC_SIZE,
            SECTOR_SIZE,
        );
        let mut table = vec![0_u8; bgdt_size];
        let bgdt_block = (bgdt_offset >> geometry.block_shift) as u64;
        device.read_sectors(
            SectorNumber(bgdt_block * u64::from(geometry.sectors_per_block)),
            &mut table,
        )?;
        let group_descs = GroupDesc::parse_table(&table, geometry.num_block_groups as usize)?;

        Ok(Self {
            shared: Arc::new(FsShared {
                device,
                geometry,
                group_descs,
                registry: Mutex::new(HashMap::new()),
            }),
        })
    }

    #[must_use]
    pub fn geometry(&self) -> &Geometry {
        &self.shared.geometry
    }

    #[must_use]
    pub fn group_descs(&self) -> &[GroupDesc] {
        &self.shared.group_descs
    }

    /// Return the interned inode for `number`, constructing and
    /// initializing it if no live reference exists.
    ///
    /// The registry lock is the tie-break for concurrent first access:
    /// exactly one initialization task runs per number and both callers
    /// observe the same object.
    #[must_use]
    pub fn access_inode(&self, number: InodeNumber) -> Arc<Inode> {
        assert!(number.0 >= 1, "inode numbers start at 1");
        let mut registry = self.shared.registry.lock();
        let slot = registry.entry(number.0).or_default();
        if let Some(live) = slot.upgrade() {
            return live;
        }
        let fresh = Arc::new(Inode::new_unready(number, Arc::clone(&self.shared)));
        *slot = Arc::downgrade(&fresh);
        drop(registry);
        inode::spawn_initiate(Arc::clone(&fresh));
        fresh
    }

    /// The root directory, inode 2.
    #[must_use]
    pub fn access_root(&self) -> Arc<Inode> {
        self.access_inode(InodeNumber::ROOT)
    }
}
