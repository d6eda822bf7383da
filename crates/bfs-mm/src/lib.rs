#![forbid(unsafe_code)]
//! Managed memory objects.
//!
//! A managed object is a byte buffer whose pages are populated on demand
//! by a servicer. It is created as a *(backing, frontal)* pair over one
//! shared buffer:
//!
//! - Readers use the frontal side: [`FrontalMemory::lock`] blocks until a
//!   range is resident, generating one manage fault per maximal
//!   unpopulated run; [`FrontalMemory::map`] copies a resident range out.
//! - The servicer uses the backing side: [`BackingMemory::submit_manage`]
//!   blocks for the next fault, and [`BackingMemory::complete_load`]
//!   installs the bytes and wakes every waiter.
//!
//! Pages are tracked at host-page granularity and are populated exactly
//! once; a populated page is never re-read. Closing the object (from
//! either side) unblocks all waiters with an error and releases the
//! servicer loop.

use bfs_error::{BfsError, Result};
use bfs_types::{PAGE_SIZE, page_align_up};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::trace;

/// A pending request to populate `length` bytes at `offset`.
///
/// Offsets and lengths are page-aligned. A request is delivered to exactly
/// one `submit_manage` call and must be answered with a single
/// `complete_load` covering the same range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ManageRequest {
    pub offset: usize,
    pub length: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PageState {
    Missing,
    Requested,
    Resident,
}

#[derive(Debug)]
struct State {
    buf: Vec<u8>,
    pages: Vec<PageState>,
    queue: VecDeque<ManageRequest>,
    active_locks: usize,
    closed: bool,
}

#[derive(Debug)]
struct Shared {
    size: usize,
    state: Mutex<State>,
    /// Wakes the servicer blocked in `submit_manage`.
    faults: Condvar,
    /// Wakes lockers waiting for residency.
    loads: Condvar,
}

impl Shared {
    fn page_range(&self, offset: usize, length: usize) -> Result<std::ops::Range<usize>> {
        let end = offset
            .checked_add(length)
            .ok_or(BfsError::OutOfRange {
                offset,
                length,
                size: self.size,
            })?;
        if end > page_align_up(self.size) {
            return Err(BfsError::OutOfRange {
                offset,
                length,
                size: self.size,
            });
        }
        Ok(offset / PAGE_SIZE..page_align_up(end) / PAGE_SIZE)
    }

    fn close(&self) {
        let mut state = self.state.lock();
        if state.closed {
            return;
        }
        state.closed = true;
        trace!(target: "bfs::mm", event = "close", size = self.size);
        drop(state);
        self.faults.notify_all();
        self.loads.notify_all();
    }
}

/// Create a managed object of `size` bytes.
///
/// The buffer is rounded up to whole pages internally; `size` itself is
/// reported by both handles.
#[must_use]
pub fn managed_pair(size: usize) -> (BackingMemory, FrontalMemory) {
    let padded = page_align_up(size);
    let shared = Arc::new(Shared {
        size,
        state: Mutex::new(State {
            buf: vec![0_u8; padded],
            pages: vec![PageState::Missing; padded / PAGE_SIZE],
            queue: VecDeque::new(),
            active_locks: 0,
            closed: false,
        }),
        faults: Condvar::new(),
        loads: Condvar::new(),
    });
    (
        BackingMemory {
            shared: Arc::clone(&shared),
        },
        FrontalMemory { shared },
    )
}

/// Reader-facing side of a managed object.
#[derive(Debug, Clone)]
pub struct FrontalMemory {
    shared: Arc<Shared>,
}

/// A copied-out view of a resident range.
#[derive(Debug)]
pub struct Mapping {
    bytes: Vec<u8>,
}

impl Mapping {
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Pins a locked range for the duration of an operation.
///
/// Residency of the pages is guaranteed while the lock is held; dropping
/// it releases the pin.
#[derive(Debug)]
pub struct RangeLock {
    shared: Arc<Shared>,
}

impl Drop for RangeLock {
    fn drop(&mut self) {
        self.shared.state.lock().active_locks -= 1;
    }
}

impl FrontalMemory {
    /// Logical size of the object in bytes.
    #[must_use]
    pub fn size(&self) -> usize {
        self.shared.size
    }

    /// Block until every page overlapping `[offset, offset + length)` is
    /// resident, queueing manage faults for runs nobody has requested yet.
    pub fn lock(&self, offset: usize, length: usize) -> Result<RangeLock> {
        let pages = self.shared.page_range(offset, length)?;
        let mut state = self.shared.state.lock();
        if state.closed {
            return Err(BfsError::Revoked);
        }

        // Queue one fault per maximal missing run.
        let mut run_start = None;
        let mut queued = 0_usize;
        for page in pages.clone().chain(std::iter::once(pages.end)) {
            let missing = page < pages.end && state.pages[page] == PageState::Missing;
            match (missing, run_start) {
                (true, None) => run_start = Some(page),
                (false, Some(start)) => {
                    let request = ManageRequest {
                        offset: start * PAGE_SIZE,
                        length: (page - start) * PAGE_SIZE,
                    };
                    for p in start..page {
                        state.pages[p] = PageState::Requested;
                    }
                    trace!(
                        target: "bfs::mm",
                        event = "fault_queued",
                        offset = request.offset,
                        length = request.length,
                    );
                    state.queue.push_back(request);
                    queued += 1;
                    run_start = None;
                }
                _ => {}
            }
        }
        if queued > 0 {
            self.shared.faults.notify_all();
        }

        while !pages
            .clone()
            .all(|p| state.pages[p] == PageState::Resident)
        {
            if state.closed {
                return Err(BfsError::Revoked);
            }
            self.shared.loads.wait(&mut state);
        }
        if state.closed {
            return Err(BfsError::Revoked);
        }

        state.active_locks += 1;
        Ok(RangeLock {
            shared: Arc::clone(&self.shared),
        })
    }

    /// Copy a resident range out of the object.
    ///
    /// The range must have been made resident by a prior [`lock`]; mapping
    /// never populates pages.
    ///
    /// [`lock`]: Self::lock
    pub fn map(&self, offset: usize, length: usize) -> Result<Mapping> {
        let pages = self.shared.page_range(offset, length)?;
        let state = self.shared.state.lock();
        if state.closed {
            return Err(BfsError::Revoked);
        }
        if !pages
            .clone()
            .all(|p| state.pages[p] == PageState::Resident)
        {
            return Err(BfsError::NotResident { offset, length });
        }
        Ok(Mapping {
            bytes: state.buf[offset..offset + length].to_vec(),
        })
    }

    /// Number of currently held range locks. Exposed for tests.
    #[must_use]
    pub fn active_locks(&self) -> usize {
        self.shared.state.lock().active_locks
    }

    /// Revoke the object: unblock all waiters and release the servicer.
    pub fn close(&self) {
        self.shared.close();
    }
}

/// Servicer-facing side of a managed object.
#[derive(Debug)]
pub struct BackingMemory {
    shared: Arc<Shared>,
}

impl BackingMemory {
    /// Logical size of the object in bytes.
    #[must_use]
    pub fn size(&self) -> usize {
        self.shared.size
    }

    /// Block for the next manage fault. Returns `None` once the object is
    /// closed and the queue has drained; the servicer loop ends then.
    #[must_use]
    pub fn submit_manage(&self) -> Option<ManageRequest> {
        let mut state = self.shared.state.lock();
        loop {
            if let Some(request) = state.queue.pop_front() {
                trace!(
                    target: "bfs::mm",
                    event = "fault_taken",
                    offset = request.offset,
                    length = request.length,
                );
                return Some(request);
            }
            if state.closed {
                return None;
            }
            self.shared.faults.wait(&mut state);
        }
    }

    /// Install `bytes` at `offset`, mark the pages resident, and wake all
    /// lock waiters. `offset` must be page-aligned and `bytes` a whole
    /// number of pages, matching the fault being answered.
    pub fn complete_load(&self, offset: usize, bytes: &[u8]) -> Result<()> {
        if offset % PAGE_SIZE != 0 || bytes.len() % PAGE_SIZE != 0 {
            return Err(BfsError::Format(format!(
                "unaligned load completion: offset={offset} length={}",
                bytes.len()
            )));
        }
        let pages = self.shared.page_range(offset, bytes.len())?;
        let mut state = self.shared.state.lock();
        if state.closed {
            // Teardown race: the reader side is gone, drop the bytes.
            return Ok(());
        }
        state.buf[offset..offset + bytes.len()].copy_from_slice(bytes);
        for p in pages {
            state.pages[p] = PageState::Resident;
        }
        trace!(
            target: "bfs::mm",
            event = "load_complete",
            offset,
            length = bytes.len(),
        );
        drop(state);
        self.shared.loads.notify_all();
        Ok(())
    }

    /// Revoke the object: unblock all waiters and release the servicer.
    pub fn close(&self) {
        self.shared.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    fn serviced_pair(size: usize, fill: u8) -> (FrontalMemory, thread::JoinHandle<usize>) {
        let (backing, frontal) = managed_pair(size);
        let handle = thread::spawn(move || {
            let mut served = 0;
            while let Some(request) = backing.submit_manage() {
                let bytes = vec![fill; request.length];
                backing
                    .complete_load(request.offset, &bytes)
                    .expect("complete");
                served += 1;
            }
            served
        });
        (frontal, handle)
    }

    #[test]
    fn lock_faults_once_and_map_sees_bytes() {
        let (frontal, handle) = serviced_pair(3 * PAGE_SIZE, 0xAB);

        let guard = frontal.lock(0, 2 * PAGE_SIZE).expect("lock");
        assert_eq!(frontal.active_locks(), 1);
        let mapping = frontal.map(PAGE_SIZE, PAGE_SIZE).expect("map");
        assert!(mapping.as_slice().iter().all(|&b| b == 0xAB));
        drop(guard);
        assert_eq!(frontal.active_locks(), 0);

        frontal.close();
        assert_eq!(handle.join().expect("servicer"), 1);
    }

    #[test]
    fn relocking_resident_range_faults_nothing() {
        let (frontal, handle) = serviced_pair(2 * PAGE_SIZE, 0x11);

        let _a = frontal.lock(0, 2 * PAGE_SIZE).expect("first lock");
        let _b = frontal.lock(0, PAGE_SIZE).expect("second lock");

        frontal.close();
        assert_eq!(handle.join().expect("servicer"), 1);
    }

    #[test]
    fn disjoint_missing_runs_fault_separately() {
        let (backing, frontal) = managed_pair(4 * PAGE_SIZE);

        // Populate page 1 up front so a whole-object lock sees a hole
        // pattern: missing, resident, missing, missing.
        let warm = {
            let f = frontal.clone();
            thread::spawn(move || f.lock(PAGE_SIZE, PAGE_SIZE).expect("warm lock"))
        };
        let first = backing.submit_manage().expect("warm fault");
        assert_eq!(
            first,
            ManageRequest {
                offset: PAGE_SIZE,
                length: PAGE_SIZE,
            }
        );
        backing
            .complete_load(first.offset, &vec![1; first.length])
            .expect("complete");
        drop(warm.join().expect("warm locker"));

        let cold = {
            let f = frontal.clone();
            thread::spawn(move || f.lock(0, 4 * PAGE_SIZE).expect("cold lock"))
        };
        let a = backing.submit_manage().expect("run a");
        let b = backing.submit_manage().expect("run b");
        assert_eq!(
            a,
            ManageRequest {
                offset: 0,
                length: PAGE_SIZE,
            }
        );
        assert_eq!(
            b,
            ManageRequest {
                offset: 2 * PAGE_SIZE,
                length: 2 * PAGE_SIZE,
            }
        );
        backing.complete_load(a.offset, &vec![2; a.length]).expect("a");
        backing.complete_load(b.offset, &vec![3; b.length]).expect("b");
        drop(cold.join().expect("cold locker"));

        let mapping = frontal.map(0, 4 * PAGE_SIZE).expect("map");
        assert_eq!(mapping.as_slice()[0], 2);
        assert_eq!(mapping.as_slice()[PAGE_SIZE], 1);
        assert_eq!(mapping.as_slice()[2 * PAGE_SIZE], 3);
    }

    #[test]
    fn map_of_unpopulated_range_is_refused() {
        let (_backing, frontal) = managed_pair(PAGE_SIZE);
        let err = frontal.map(0, PAGE_SIZE).expect_err("not resident");
        assert!(matches!(err, BfsError::NotResident { .. }));
    }

    #[test]
    fn lock_out_of_bounds_is_refused() {
        let (_backing, frontal) = managed_pair(PAGE_SIZE);
        let err = frontal.lock(0, 2 * PAGE_SIZE).expect_err("out of bounds");
        assert!(matches!(err, BfsError::OutOfRange { .. }));
    }

    #[test]
    fn close_releases_servicer_and_waiters() {
        let (backing, frontal) = managed_pair(2 * PAGE_SIZE);

        let waiter = {
            let f = frontal.clone();
            thread::spawn(move || f.lock(0, PAGE_SIZE))
        };
        // Let the waiter queue its fault and block.
        while backing.shared.state.lock().queue.is_empty() {
            thread::sleep(Duration::from_millis(1));
        }
        frontal.close();

        assert!(matches!(waiter.join().expect("waiter"), Err(BfsError::Revoked)));
        // The queued fault is still drained, then the servicer is released.
        assert!(backing.submit_manage().is_some());
        assert!(backing.submit_manage().is_none());
        assert!(matches!(frontal.lock(0, PAGE_SIZE), Err(BfsError::Revoked)));
    }

    #[test]
    fn zero_sized_object_locks_trivially() {
        let (_backing, frontal) = managed_pair(0);
        let _guard = frontal.lock(0, 0).expect("empty lock");
        assert_eq!(frontal.map(0, 0).expect("empty map").len(), 0);
    }
}
