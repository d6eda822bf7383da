use crate::fs::FsShared;
use crate::service;
use bfs_error::{BfsError, Result};
use bfs_mm::{FrontalMemory, managed_pair};
use bfs_ondisk::{FileKind, INODE_POINTER_AREA, RawInode, read_dir_record};
use bfs_types::{
    EXT2_NUM_DIRECT, InodeNumber, PAGE_SIZE, S_IFMT, SECTOR_SIZE, SectorNumber, page_align_up,
};
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::thread;
use tracing::debug;

/// One-shot latch carrying the initialized inode state. Consumers wait on
/// it before observing anything but the inode number.
struct ReadyLatch {
    slot: Mutex<Option<Arc<InodeState>>>,
    ready: Condvar,
}

impl ReadyLatch {
    fn new() -> Self {
        Self {
            slot: Mutex::new(None),
            ready: Condvar::new(),
        }
    }

    fn set(&self, state: Arc<InodeState>) {
        let mut slot = self.slot.lock();
        debug_assert!(slot.is_none(), "inode initialized twice");
        *slot = Some(state);
        drop(slot);
        self.ready.notify_all();
    }

    fn wait(&self) -> Arc<InodeState> {
        let mut slot = self.slot.lock();
        loop {
            if let Some(state) = slot.as_ref() {
                return Arc::clone(state);
            }
            self.ready.wait(&mut slot);
        }
    }

    fn peek(&self) -> Option<Arc<InodeState>> {
        self.slot.lock().clone()
    }
}

/// Everything about an inode that becomes visible once the ready latch
/// fires. Stable for the lifetime of the inode; only the memory-object
/// contents change after initialization.
pub struct InodeState {
    pub kind: FileKind,
    pub file_size: u64,
    /// Permission bits only; the type bits are folded into `kind`.
    pub mode: u16,
    pub num_links: u16,
    pub uid: u16,
    pub gid: u16,
    pub atime: u32,
    pub mtime: u32,
    pub ctime: u32,
    pub(crate) direct: [u32; EXT2_NUM_DIRECT],
    pub(crate) single_indirect: u32,
    pub(crate) double_indirect: u32,
    pub(crate) triple_indirect: u32,
    /// Undecoded pointer area; symlink targets shorter than 60 bytes live
    /// here instead of block pointers.
    pointer_bytes: Vec<u8>,
    /// Page cache of file contents, sized to the file rounded up to whole
    /// pages. The public channel for file bytes.
    pub(crate) frontal: FrontalMemory,
    /// Window over the three indirection root blocks (slots 0, 1, 2).
    pub(crate) indirect1: FrontalMemory,
    /// Window over all second-level indirect blocks reachable through the
    /// double-indirect root.
    pub(crate) indirect2: FrontalMemory,
}

impl InodeState {
    fn close_all(&self) {
        self.frontal.close();
        self.indirect1.close();
        self.indirect2.close();
    }
}

/// An interned inode. At most one live `Inode` exists per number; all
/// holders share it through `Arc`.
pub struct Inode {
    number: InodeNumber,
    fs: Arc<FsShared>,
    latch: ReadyLatch,
}

impl Inode {
    pub(crate) fn new_unready(number: InodeNumber, fs: Arc<FsShared>) -> Self {
        Self {
            number,
            fs,
            latch: ReadyLatch::new(),
        }
    }

    #[must_use]
    pub fn number(&self) -> InodeNumber {
        self.number
    }

    /// Block until initialization finished, then return the stable state.
    #[must_use]
    pub fn wait_ready(&self) -> Arc<InodeState> {
        self.latch.wait()
    }

    /// Handle to the file-contents page cache. Locking and mapping it is
    /// how file bytes are read.
    #[must_use]
    pub fn frontal(&self) -> FrontalMemory {
        self.latch.wait().frontal.clone()
    }

    /// Look up `name` in this directory.
    ///
    /// Returns the referenced inode number and the record's file kind, or
    /// `None` when no record matches. `name` must be a real path
    /// component, not `""`, `"."` or `".."`.
    #[expect(clippy::cast_possible_truncation)]
    pub fn find_entry(&self, name: &str) -> Result<Option<DirEntry>> {
        assert!(
            !name.is_empty() && name != "." && name != "..",
            "lookup names must be real path components"
        );

        let state = self.latch.wait();
        if state.kind != FileKind::Directory {
            return Err(BfsError::NotDirectory);
        }

        let file_size = state.file_size as usize;
        let map_size = page_align_up(file_size);
        let _lock = state.frontal.lock(0, map_size)?;
        let mapping = state.frontal.map(0, map_size)?;
        let data = &mapping.as_slice()[..file_size];

        let mut offset = 0_usize;
        while offset < file_size {
            let record = read_dir_record(data, offset)?;
            if record.inode != 0 && record.name == name.as_bytes() {
                return Ok(Some(DirEntry {
                    inode: InodeNumber(record.inode),
                    kind: FileKind::from_dirent(record.file_type),
                }));
            }
            offset += usize::from(record.record_length);
        }
        debug_assert_eq!(offset, file_size);
        Ok(None)
    }

    /// Read up to `length` bytes of file contents at `offset`, clamped at
    /// end of file.
    #[expect(clippy::cast_possible_truncation)]
    pub fn read_at(&self, offset: u64, length: usize) -> Result<Vec<u8>> {
        let state = self.latch.wait();
        if offset >= state.file_size {
            return Ok(Vec::new());
        }
        let length = length.min((state.file_size - offset) as usize);
        let offset = offset as usize;

        let lock_start = offset & !(PAGE_SIZE - 1);
        let lock_end = page_align_up(offset + length);
        let _lock = state.frontal.lock(lock_start, lock_end - lock_start)?;
        let mapping = state.frontal.map(offset, length)?;
        Ok(mapping.as_slice().to_vec())
    }

    /// Read a symlink target. Short targets are stored inline in the
    /// inode's pointer area; long ones go through the page cache.
    #[expect(clippy::cast_possible_truncation)]
    pub fn read_link(&self) -> Result<String> {
        let state = self.latch.wait();
        if state.kind != FileKind::Symlink {
            return Err(BfsError::NotSymlink);
        }
        let size = state.file_size as usize;
        let bytes = if size < INODE_POINTER_AREA {
            state.pointer_bytes[..size].to_vec()
        } else {
            self.read_at(0, size)?
        };
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}

impl Drop for Inode {
    fn drop(&mut self) {
        // Closing the memory objects unblocks any stale handles and
        // releases the three servicer threads.
        if let Some(state) = self.latch.peek() {
            state.close_all();
        }
    }
}

/// A directory lookup result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirEntry {
    pub inode: InodeNumber,
    pub kind: FileKind,
}

/// Sequential read cursor over a directory.
pub struct OpenFile {
    inode: Arc<Inode>,
    offset: u64,
}

impl OpenFile {
    #[must_use]
    pub fn new(inode: Arc<Inode>) -> Self {
        Self { inode, offset: 0 }
    }

    /// Decode the record at the cursor and advance by its length.
    ///
    /// Returns the record's name, or `None` once the cursor has reached
    /// the directory size exactly.
    #[expect(clippy::cast_possible_truncation)]
    pub fn read_entries(&mut self) -> Result<Option<String>> {
        let state = self.inode.latch.wait();
        if state.kind != FileKind::Directory {
            return Err(BfsError::NotDirectory);
        }

        let file_size = state.file_size as usize;
        debug_assert!(self.offset as usize <= file_size);
        if self.offset as usize == file_size {
            return Ok(None);
        }

        let map_size = page_align_up(file_size);
        let _lock = state.frontal.lock(0, map_size)?;
        let mapping = state.frontal.map(0, map_size)?;
        let data = &mapping.as_slice()[..file_size];

        let record = read_dir_record(data, self.offset as usize)?;
        self.offset += u64::from(record.record_length);
        Ok(Some(record.name_str()))
    }
}

/// Spawn the one-shot initialization task for a freshly interned inode.
pub(crate) fn spawn_initiate(inode: Arc<Inode>) {
    let name = format!("ext2-init-{}", inode.number);
    let spawned = thread::Builder::new().name(name).spawn(move || {
        if let Err(err) = initiate(&inode) {
            service::fatal("inode initialization", &err);
        }
    });
    if let Err(err) = spawned {
        service::fatal("spawn inode initialization", &err.into());
    }
}

/// Locate and decode the on-disk inode record, create the page cache and
/// the two indirection windows, start the servicers, and fire the ready
/// latch.
fn initiate(inode: &Inode) -> Result<()> {
    let fs = &inode.fs;
    let geo = &fs.geometry;
    let number = inode.number.0;

    let group = (number - 1) / geo.inodes_per_group;
    let index = (number - 1) % geo.inodes_per_group;
    let table_offset = u64::from(index) * u64::from(geo.inode_size);

    let desc = fs
        .group_descs
        .get(group as usize)
        .ok_or_else(|| BfsError::Corruption {
            block: 0,
            detail: format!(
                "inode {number} maps to block group {group}, but only {} groups exist",
                fs.group_descs.len()
            ),
        })?;

    let sector = u64::from(desc.inode_table) * u64::from(geo.sectors_per_block)
        + table_offset / SECTOR_SIZE as u64;
    let mut sector_buf = vec![0_u8; SECTOR_SIZE];
    fs.device.read_sectors(SectorNumber(sector), &mut sector_buf)?;

    #[expect(clippy::cast_possible_truncation)]
    let record_offset = (table_offset % SECTOR_SIZE as u64) as usize;
    let record_len = (geo.inode_size as usize).min(SECTOR_SIZE - record_offset);
    let raw = RawInode::parse_from_bytes(&sector_buf[record_offset..record_offset + record_len])?;

    let Some(kind) = FileKind::from_mode(raw.mode) else {
        return Err(BfsError::Format(format!(
            "unexpected inode type {:#06x} for inode {number}",
            raw.mode & S_IFMT
        )));
    };
    debug!(
        target: "bfs::ext2",
        event = "inode_loaded",
        inode = number,
        kind = ?kind,
        size = raw.size,
    );

    let file_size = u64::from(raw.size);
    #[expect(clippy::cast_possible_truncation)]
    let cache_size = page_align_up(file_size as usize);
    let (data_backing, frontal) = managed_pair(cache_size);

    let slot = geo.slot_bytes();
    let (order1_backing, indirect1) = managed_pair(3 * slot);
    let (order2_backing, indirect2) = managed_pair(geo.pointers_per_block() as usize * slot);

    let mut direct = [0_u32; EXT2_NUM_DIRECT];
    direct.copy_from_slice(raw.direct());

    let state = Arc::new(InodeState {
        kind,
        file_size,
        mode: raw.mode & 0x0FFF,
        num_links: raw.links_count,
        uid: raw.uid,
        gid: raw.gid,
        atime: raw.atime,
        mtime: raw.mtime,
        ctime: raw.ctime,
        direct,
        single_indirect: raw.single_indirect(),
        double_indirect: raw.double_indirect(),
        triple_indirect: raw.triple_indirect(),
        pointer_bytes: raw.pointer_bytes,
        frontal,
        indirect1,
        indirect2,
    });

    service::spawn_servicers(
        inode.number,
        &state,
        &inode.fs,
        data_backing,
        order1_backing,
        order2_backing,
    );

    inode.latch.set(state);
    Ok(())
}
