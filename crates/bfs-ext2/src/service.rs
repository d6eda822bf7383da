use crate::fs::FsShared;
use crate::inode::InodeState;
use crate::resolve;
use bfs_error::{BfsError, Result};
use bfs_mm::{BackingMemory, ManageRequest};
use bfs_types::{InodeNumber, page_align_up, read_le_u32};
use std::sync::Arc;
use std::thread;
use tracing::{error, trace};

/// Terminal failure path for detached tasks.
///
/// A servicer that fails would leave readers blocked on pages that can
/// never be populated, so anything beyond a normal fault here takes the
/// whole driver down.
pub(crate) fn fatal(context: &str, err: &BfsError) -> ! {
    error!(target: "bfs::ext2", context, error = %err, "unrecoverable driver failure");
    std::process::abort();
}

/// Start the three long-lived fault servicers for an initialized inode:
/// file data, order-1 indirection, order-2 indirection. Each owns the
/// backing side of its memory object and exits when the object closes.
pub(crate) fn spawn_servicers(
    number: InodeNumber,
    state: &Arc<InodeState>,
    fs: &Arc<FsShared>,
    data: BackingMemory,
    order1: BackingMemory,
    order2: BackingMemory,
) {
    spawn_named(format!("ext2-data-{number}"), {
        let state = Arc::clone(state);
        let fs = Arc::clone(fs);
        move || run_file_data(&state, &fs, &data)
    });
    spawn_named(format!("ext2-ind1-{number}"), {
        let state = Arc::clone(state);
        let fs = Arc::clone(fs);
        move || run_indirect_order1(&state, &fs, &order1)
    });
    spawn_named(format!("ext2-ind2-{number}"), {
        let state = Arc::clone(state);
        let fs = Arc::clone(fs);
        move || run_indirect_order2(&state, &fs, &order2)
    });
}

fn spawn_named(name: String, body: impl FnOnce() + Send + 'static) {
    if let Err(err) = thread::Builder::new().name(name).spawn(body) {
        fatal("spawn fault servicer", &err.into());
    }
}

/// Answer manage faults on the file-contents backing object.
///
/// Each fault covers whole pages of the cache; the tail past end-of-file
/// stays zeroed. Faults are serviced strictly serially and never retried.
#[expect(clippy::cast_possible_truncation)]
fn run_file_data(state: &InodeState, fs: &FsShared, backing: &BackingMemory) {
    let block_size = fs.geometry.block_size as usize;
    let file_size = state.file_size as usize;
    let cache_size = page_align_up(file_size);

    while let Some(request) = backing.submit_manage() {
        if request.offset + request.length > cache_size || request.offset % block_size != 0 {
            fatal(
                "file data fault",
                &BfsError::Format(format!(
                    "misaligned manage fault: offset={} length={}",
                    request.offset, request.length
                )),
            );
        }

        let effective = request.length.min(file_size - request.offset);
        let num_blocks = effective.div_ceil(block_size);
        if num_blocks * block_size > request.length {
            fatal(
                "file data fault",
                &BfsError::Format(format!(
                    "fault window holds {} bytes but {num_blocks} blocks are needed",
                    request.length
                )),
            );
        }

        let mut window = vec![0_u8; request.length];
        if let Err(err) = resolve::read_data(
            state,
            fs,
            (request.offset / block_size) as u64,
            num_blocks,
            &mut window,
        ) {
            fatal("file data read", &err);
        }
        if let Err(err) = backing.complete_load(request.offset, &window) {
            fatal("file data completion", &err);
        }
    }
    trace!(target: "bfs::ext2", event = "servicer_released", which = "data");
}

/// Answer manage faults on the order-1 indirection window: slot 0 is the
/// single-indirect root, slot 1 the double-indirect root, slot 2 the
/// triple-indirect root.
fn run_indirect_order1(state: &InodeState, fs: &FsShared, backing: &BackingMemory) {
    while let Some(request) = backing.submit_manage() {
        let element = window_element(fs, &request);
        let root = match element {
            0 => state.single_indirect,
            1 => state.double_indirect,
            2 => state.triple_indirect,
            _ => fatal(
                "order-1 indirection fault",
                &BfsError::Format(format!("unexpected window element {element}")),
            ),
        };
        fill_window(fs, backing, &request, root);
    }
    trace!(target: "bfs::ext2", event = "servicer_released", which = "order1");
}

/// Answer manage faults on the order-2 indirection window. The faulted
/// element names a second-level indirect block; its address is read out
/// of the double-indirect root, which is itself faulted in through the
/// order-1 window.
fn run_indirect_order2(state: &InodeState, fs: &FsShared, backing: &BackingMemory) {
    let geo = &fs.geometry;
    let per = geo.pointers_per_block() as usize;
    let slot = geo.slot_bytes();

    while let Some(request) = backing.submit_manage() {
        let element = window_element(fs, &request);
        let frame = element >> (geo.block_shift - 2);
        let slot_index = element & (per - 1);

        let looked_up = (|| -> Result<u32> {
            let _lock = state.indirect1.lock((1 + frame) * slot, slot)?;
            let mapping = state.indirect1.map((1 + frame) * slot, slot)?;
            Ok(read_le_u32(mapping.as_slice(), slot_index * 4)?)
        })();
        let block = match looked_up {
            Ok(block) => block,
            Err(err) => fatal("second-level indirection lookup", &err),
        };
        fill_window(fs, backing, &request, block);
    }
    trace!(target: "bfs::ext2", event = "servicer_released", which = "order2");
}

/// Validate a window fault (exactly one block-slot, slot-aligned) and
/// return the slot index.
fn window_element(fs: &FsShared, request: &ManageRequest) -> usize {
    let slot = fs.geometry.slot_bytes();
    if request.length != slot || request.offset % slot != 0 {
        fatal(
            "indirection window fault",
            &BfsError::Format(format!(
                "window fault must cover one block slot: offset={} length={}",
                request.offset, request.length
            )),
        );
    }
    request.offset >> fs.geometry.block_pages_shift
}

/// Read one indirect block from the device into the faulted window slot.
fn fill_window(fs: &FsShared, backing: &BackingMemory, request: &ManageRequest, block: u32) {
    if block == 0 {
        fatal(
            "indirection window fault",
            &BfsError::Corruption {
                block: 0,
                detail: "indirection chain points at block 0".to_owned(),
            },
        );
    }
    let block_size = fs.geometry.block_size as usize;
    let mut page = vec![0_u8; request.length];
    if let Err(err) = fs.device.read_sectors(
        fs.geometry.first_sector(bfs_types::BlockNumber(block)),
        &mut page[..block_size],
    ) {
        fatal("indirect block read", &err);
    }
    if let Err(err) = backing.complete_load(request.offset, &page) {
        fatal("indirect block completion", &err);
    }
}
