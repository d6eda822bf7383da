#![forbid(unsafe_code)]
//! Sector-addressed block device layer.
//!
//! Provides the `SectorDevice` trait (uniform 512-byte sector reads), a
//! file-backed device using `pread`-style I/O, an in-memory device for
//! tests and tooling, and a counting wrapper that records every read for
//! read-fusion assertions.

use bfs_error::{BfsError, Result};
use bfs_types::{SECTOR_SIZE, SectorNumber};
use parking_lot::Mutex;
use std::fs::File;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;
use tracing::trace;

/// Read-only sector access to an underlying device.
///
/// `dest.len()` must be a multiple of the 512-byte sector size; the read
/// covers `dest.len() / 512` sectors starting at `lba`.
pub trait SectorDevice: Send + Sync {
    /// Total number of sectors on the device.
    fn num_sectors(&self) -> u64;

    /// Fill `dest` with consecutive sectors starting at `lba`.
    fn read_sectors(&self, lba: SectorNumber, dest: &mut [u8]) -> Result<()>;
}

fn check_read(lba: SectorNumber, dest_len: usize, num_sectors: u64) -> Result<u64> {
    if dest_len % SECTOR_SIZE != 0 {
        return Err(BfsError::Format(format!(
            "sector read length {dest_len} is not a multiple of {SECTOR_SIZE}"
        )));
    }
    let count = (dest_len / SECTOR_SIZE) as u64;
    let end = lba
        .0
        .checked_add(count)
        .ok_or_else(|| BfsError::Format("sector range overflows u64".to_owned()))?;
    if end > num_sectors {
        return Err(BfsError::Format(format!(
            "sector read out of bounds: lba={lba} count={count} device={num_sectors}"
        )));
    }
    Ok(count)
}

/// File-backed sector device.
///
/// Opens the image read-only; this is a read-only driver and never writes
/// through this layer.
#[derive(Debug, Clone)]
pub struct FileSectorDevice {
    file: Arc<File>,
    num_sectors: u64,
}

impl FileSectorDevice {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path.as_ref())?;
        let len = file.metadata()?.len();
        Ok(Self {
            file: Arc::new(file),
            num_sectors: len / SECTOR_SIZE as u64,
        })
    }
}

impl SectorDevice for FileSectorDevice {
    fn num_sectors(&self) -> u64 {
        self.num_sectors
    }

    fn read_sectors(&self, lba: SectorNumber, dest: &mut [u8]) -> Result<()> {
        let count = check_read(lba, dest.len(), self.num_sectors)?;
        self.file.read_exact_at(dest, lba.0 * SECTOR_SIZE as u64)?;
        trace!(
            target: "bfs::block",
            event = "read_sectors",
            device = "file",
            lba = lba.0,
            count,
        );
        Ok(())
    }
}

/// In-memory sector device over an owned image buffer.
///
/// The image is padded with zeroes to a whole number of sectors.
#[derive(Debug, Clone)]
pub struct MemorySectorDevice {
    data: Arc<Vec<u8>>,
}

impl MemorySectorDevice {
    #[must_use]
    pub fn new(mut image: Vec<u8>) -> Self {
        let padded = image.len().next_multiple_of(SECTOR_SIZE);
        image.resize(padded, 0);
        Self {
            data: Arc::new(image),
        }
    }
}

impl SectorDevice for MemorySectorDevice {
    fn num_sectors(&self) -> u64 {
        (self.data.len() / SECTOR_SIZE) as u64
    }

    fn read_sectors(&self, lba: SectorNumber, dest: &mut [u8]) -> Result<()> {
        let count = check_read(lba, dest.len(), self.num_sectors())?;
        #[expect(clippy::cast_possible_truncation)]
        let start = (lba.0 as usize) * SECTOR_SIZE;
        dest.copy_from_slice(&self.data[start..start + dest.len()]);
        trace!(
            target: "bfs::block",
            event = "read_sectors",
            device = "memory",
            lba = lba.0,
            count,
        );
        Ok(())
    }
}

/// One recorded device read: starting sector and sector count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadRecord {
    pub lba: u64,
    pub sectors: u32,
}

/// Wrapper that records every `read_sectors` call issued to the inner
/// device. Used by tests to assert read-fusion and cache-idempotence
/// behavior.
#[derive(Debug)]
pub struct CountingSectorDevice<D> {
    inner: D,
    reads: Mutex<Vec<ReadRecord>>,
}

impl<D: SectorDevice> CountingSectorDevice<D> {
    pub fn new(inner: D) -> Self {
        Self {
            inner,
            reads: Mutex::new(Vec::new()),
        }
    }

    /// All reads issued since construction or the last `reset`.
    pub fn reads(&self) -> Vec<ReadRecord> {
        self.reads.lock().clone()
    }

    pub fn read_count(&self) -> usize {
        self.reads.lock().len()
    }

    pub fn reset(&self) {
        self.reads.lock().clear();
    }
}

impl<D: SectorDevice> SectorDevice for CountingSectorDevice<D> {
    fn num_sectors(&self) -> u64 {
        self.inner.num_sectors()
    }

    fn read_sectors(&self, lba: SectorNumber, dest: &mut [u8]) -> Result<()> {
        #[expect(clippy::cast_possible_truncation)]
        self.reads.lock().push(ReadRecord {
            lba: lba.0,
            sectors: (dest.len() / SECTOR_SIZE) as u32,
        });
        self.inner.read_sectors(lba, dest)
    }
}
