use crate::fs::FsShared;
use crate::inode::InodeState;
use bfs_error::{BfsError, Result};
use bfs_ondisk::decode_block_pointers;
use bfs_types::{BlockNumber, EXT2_NUM_DIRECT};
use tracing::trace;

/// Fill `out` with `num_blocks` logical blocks of file contents starting
/// at `first_block`, resolving each through the direct, single-indirect,
/// or double-indirect pointer chain.
///
/// Physically consecutive pointer runs are fused into single device
/// reads. Fusion restarts at every iteration and never crosses a pointer
/// table boundary, so a direct→indirect transition is always a fresh
/// read.
#[expect(clippy::cast_possible_truncation)]
pub(crate) fn read_data(
    state: &InodeState,
    fs: &FsShared,
    first_block: u64,
    num_blocks: usize,
    out: &mut [u8],
) -> Result<()> {
    let geo = &fs.geometry;
    let block_size = geo.block_size as usize;
    debug_assert!(out.len() >= num_blocks * block_size);

    let per = u64::from(geo.pointers_per_block());
    // Logical block index limits of each addressing mode.
    let direct_limit = EXT2_NUM_DIRECT as u64;
    let single_limit = direct_limit + per;
    let double_limit = single_limit + per * per;
    let slot = geo.slot_bytes();

    let mut progress = 0_usize;
    while progress < num_blocks {
        let index = first_block + progress as u64;
        let remaining = num_blocks - progress;

        let (base, run) = if index >= double_limit {
            return Err(BfsError::Format(format!(
                "logical block {index} requires triple indirection"
            )));
        } else if index >= single_limit {
            // The window slot holding the second-level indirect block,
            // and the pointer slot within it.
            let rel = index - single_limit;
            let frame = (rel >> (geo.block_shift - 2)) as usize;
            let slot_index = (rel & (per - 1)) as usize;
            let _lock = state.indirect2.lock(frame * slot, slot)?;
            let mapping = state.indirect2.map(frame * slot, slot)?;
            let table = decode_block_pointers(&mapping.as_slice()[..block_size]);
            fuse(&table, slot_index, remaining)
        } else if index >= direct_limit {
            let _lock = state.indirect1.lock(0, slot)?;
            let mapping = state.indirect1.map(0, slot)?;
            let table = decode_block_pointers(&mapping.as_slice()[..block_size]);
            fuse(&table, (index - direct_limit) as usize, remaining)
        } else {
            fuse(&state.direct, index as usize, remaining)
        };

        if base == 0 {
            return Err(BfsError::Corruption {
                block: index,
                detail: "logical block resolves to physical block 0".to_owned(),
            });
        }

        let dest = &mut out[progress * block_size..(progress + run) * block_size];
        fs.device.read_sectors(geo.first_sector(BlockNumber(base)), dest)?;
        trace!(
            target: "bfs::ext2",
            event = "fused_read",
            logical = index,
            physical = base,
            run,
        );
        progress += run;
    }
    Ok(())
}

/// Scan forward from `index` while the pointers stay physically
/// consecutive, bounded by the table and by `remaining` blocks of the
/// request. Returns the physical base block and the run length.
fn fuse(table: &[u32], index: usize, remaining: usize) -> (u32, usize) {
    let base = table[index];
    let mut run = 1_usize;
    while run < remaining
        && index + run < table.len()
        && table[index + run] == base.wrapping_add(run as u32)
    {
        run += 1;
    }
    (base, run)
}
