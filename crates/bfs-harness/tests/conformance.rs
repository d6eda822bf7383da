#![forbid(unsafe_code)]
//! End-to-end conformance tests for the ext2 driver.
//!
//! Each test builds a purpose-made image, mounts it on a counting sector
//! device, and asserts both the returned bytes and the exact device reads
//! the driver issued.

use bfs_block::{FileSectorDevice, ReadRecord, SectorDevice};
use bfs_error::BfsError;
use bfs_ext2::{FileKind, FileSystem, OpenFile};
use bfs_harness::{ImageBuilder, TestDevice, dir_record, mount, pad_record};
use bfs_types::{EXT2_FT_DIR, EXT2_FT_REG_FILE, InodeNumber, S_IFDIR, S_IFREG};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

fn reads(device: &TestDevice) -> Vec<(u64, u32)> {
    device
        .reads()
        .into_iter()
        .map(|ReadRecord { lba, sectors }| (lba, sectors))
        .collect()
}

/// Mount and wait for one inode to finish initializing, then clear the
/// read log so assertions only see the reads of the operation under
/// test.
fn mount_and_settle(image: Vec<u8>, number: u32) -> (FileSystem, Arc<TestDevice>, Arc<bfs_ext2::Inode>) {
    let (fs, device) = mount(image).expect("mount");
    let inode = fs.access_inode(InodeNumber(number));
    inode.wait_ready();
    device.reset();
    (fs, device, inode)
}

#[test]
fn root_lookup_finds_entry_and_misses() {
    let mut builder = ImageBuilder::new(1024, 256);
    let block = builder.alloc_block();
    let mut records = dir_record(14, 16, EXT2_FT_DIR, b"etc");
    records.extend_from_slice(&pad_record(1008));
    builder.write_block(block, &records);
    builder.put_inode(2, S_IFDIR | 0o755, 1024, &[block]);

    let (_fs, _device, root) = mount_and_settle(builder.build(), 2);

    let entry = root.find_entry("etc").expect("lookup").expect("present");
    assert_eq!(entry.inode, InodeNumber(14));
    assert_eq!(entry.kind, FileKind::Directory);

    assert!(root.find_entry("missing").expect("lookup").is_none());
}

#[test]
fn contiguous_direct_blocks_fuse_into_one_read() {
    let mut builder = ImageBuilder::new(1024, 256);
    for (index, block) in (100_u32..103).enumerate() {
        #[expect(clippy::cast_possible_truncation)]
        builder.fill_block(block, 0x10 + index as u8);
    }
    builder.put_inode(12, S_IFREG | 0o644, 3072, &[100, 101, 102]);

    let (_fs, device, inode) = mount_and_settle(builder.build(), 12);

    let bytes = inode.read_at(0, 3072).expect("read");
    assert_eq!(bytes.len(), 3072);
    assert!(bytes[..1024].iter().all(|&b| b == 0x10));
    assert!(bytes[1024..2048].iter().all(|&b| b == 0x11));
    assert!(bytes[2048..].iter().all(|&b| b == 0x12));

    // 3 consecutive blocks at 2 sectors each: one fused device read.
    assert_eq!(reads(&device), vec![(200, 6)]);
}

#[test]
fn noncontiguous_direct_blocks_split_reads() {
    let mut builder = ImageBuilder::new(1024, 512);
    builder.fill_block(100, 0xA0);
    builder.fill_block(200, 0xB0);
    builder.fill_block(201, 0xB1);
    builder.put_inode(12, S_IFREG | 0o644, 3072, &[100, 200, 201]);

    let (_fs, device, inode) = mount_and_settle(builder.build(), 12);

    let bytes = inode.read_at(0, 3072).expect("read");
    assert!(bytes[..1024].iter().all(|&b| b == 0xA0));
    assert!(bytes[1024..2048].iter().all(|&b| b == 0xB0));
    assert!(bytes[2048..].iter().all(|&b| b == 0xB1));

    assert_eq!(reads(&device), vec![(200, 2), (400, 4)]);
}

#[test]
fn single_indirect_boundary_faults_window_then_data() {
    let mut builder = ImageBuilder::new(1024, 512);
    let mut direct = [0_u32; 13];
    for (slot, pointer) in direct.iter_mut().take(12).enumerate() {
        *pointer = 100 + slot as u32;
    }
    direct[12] = 50; // single-indirect root
    builder.write_pointer_block(50, &[112]);
    builder.fill_block(112, 0xC7);
    builder.put_inode(12, S_IFREG | 0o644, 13 * 1024, &direct);

    let (_fs, device, inode) = mount_and_settle(builder.build(), 12);

    let bytes = inode.read_at(12 * 1024, 1024).expect("read");
    assert!(bytes.iter().all(|&b| b == 0xC7));

    // The order-1 window faults in the single-indirect block first, then
    // the data block resolves through it.
    assert_eq!(reads(&device), vec![(100, 2), (224, 2)]);
}

#[test]
fn double_indirect_traversal_reads_roots_in_order() {
    let mut builder = ImageBuilder::new(1024, 1024);
    // Logical block 12 + 256 + 256: order-2 window frame 1, whose address
    // sits at entry 1 of the double-indirect root.
    let mut ptrs = [0_u32; 14];
    ptrs[13] = 60; // double-indirect root
    builder.write_pointer_block(60, &[0, 61]);
    builder.write_pointer_block(61, &[70]);
    builder.fill_block(70, 0x5A);
    let logical: u32 = 12 + 256 + 256;
    builder.put_inode(12, S_IFREG | 0o644, (logical + 1) * 1024, &ptrs);

    let (_fs, device, inode) = mount_and_settle(builder.build(), 12);

    let bytes = inode.read_at(u64::from(logical) * 1024, 1024).expect("read");
    assert!(bytes.iter().all(|&b| b == 0x5A));

    // Double-indirect root, then the second-level block, then the data.
    assert_eq!(reads(&device), vec![(120, 2), (122, 2), (140, 2)]);
}

#[test]
fn fusion_stops_at_pointer_table_boundary() {
    let mut builder = ImageBuilder::new(1024, 512);
    let mut ptrs = [0_u32; 13];
    for (slot, pointer) in ptrs.iter_mut().take(12).enumerate() {
        *pointer = 100 + slot as u32;
    }
    ptrs[12] = 50;
    // The single-indirect pointers continue exactly where the direct
    // pointers stop; fusion must still restart at the table switch.
    builder.write_pointer_block(50, &[112, 113, 114, 115, 116, 117, 118, 119]);
    for block in 100..120 {
        #[expect(clippy::cast_possible_truncation)]
        builder.fill_block(block, block as u8);
    }
    builder.put_inode(12, S_IFREG | 0o644, 20 * 1024, &ptrs);

    let (_fs, device, inode) = mount_and_settle(builder.build(), 12);

    let bytes = inode.read_at(0, 20 * 1024).expect("read");
    for (index, chunk) in bytes.chunks(1024).enumerate() {
        #[expect(clippy::cast_possible_truncation)]
        let expected = (100 + index) as u8;
        assert!(chunk.iter().all(|&b| b == expected), "block {index}");
    }

    assert_eq!(
        reads(&device),
        vec![
            (200, 24), // 12 direct blocks, one fused read
            (100, 2),  // single-indirect window fault
            (224, 16), // 8 single-indirect blocks, one fused read
        ]
    );
}

#[test]
fn cached_blocks_are_not_reread() {
    let mut builder = ImageBuilder::new(1024, 512);
    let mut ptrs = [0_u32; 13];
    for (slot, pointer) in ptrs.iter_mut().take(12).enumerate() {
        *pointer = 100 + slot as u32;
    }
    ptrs[12] = 50;
    builder.write_pointer_block(50, &[112, 113]);
    builder.put_inode(12, S_IFREG | 0o644, 14 * 1024, &ptrs);

    let (_fs, device, inode) = mount_and_settle(builder.build(), 12);

    let first = inode.read_at(12 * 1024, 2048).expect("first read");
    let read_count_after_first = device.read_count();

    let second = inode.read_at(12 * 1024, 2048).expect("second read");
    assert_eq!(first, second);
    // Window and page cache both hit: no further device traffic.
    assert_eq!(device.read_count(), read_count_after_first);
}

#[test]
fn directory_iteration_terminates_at_exact_size() {
    let mut builder = ImageBuilder::new(1024, 256);
    let first = builder.alloc_block();
    let second = builder.alloc_block();

    let mut block_a = dir_record(11, 12, EXT2_FT_REG_FILE, b"bin");
    block_a.extend_from_slice(&dir_record(12, 12, EXT2_FT_DIR, b"usr"));
    block_a.extend_from_slice(&pad_record(1000));
    builder.write_block(first, &block_a);

    let mut block_b = dir_record(13, 12, EXT2_FT_DIR, b"var");
    block_b.extend_from_slice(&pad_record(1012));
    builder.write_block(second, &block_b);

    builder.put_inode(2, S_IFDIR | 0o755, 2048, &[first, second]);

    let (fs, _device, root) = mount_and_settle(builder.build(), 2);

    let mut names = Vec::new();
    let mut dir = OpenFile::new(fs.access_root());
    while let Some(name) = dir.read_entries().expect("read entries") {
        names.push(name);
    }
    // Filler records surface with empty names; the advance lengths sum
    // to exactly the directory size.
    assert_eq!(names, vec!["bin", "usr", "", "var", ""]);
    assert!(dir.read_entries().expect("past end").is_none());

    // A lookup that has to cross into the second block.
    let entry = root.find_entry("var").expect("lookup").expect("present");
    assert_eq!(entry.inode, InodeNumber(13));
}

#[test]
fn inode_interning_returns_same_object() {
    let mut builder = ImageBuilder::new(1024, 256);
    let block = builder.alloc_block();
    builder.put_inode(12, S_IFREG | 0o644, 1024, &[block]);
    let (fs, _device) = mount(builder.build()).expect("mount");

    let first = fs.access_inode(InodeNumber(12));
    let second = fs.access_inode(InodeNumber(12));
    assert!(Arc::ptr_eq(&first, &second));

    let fs = Arc::new(fs);
    let handles: Vec<_> = (0..8)
        .map(|_| {
            let fs = Arc::clone(&fs);
            thread::spawn(move || fs.access_inode(InodeNumber(12)))
        })
        .collect();
    for handle in handles {
        let shared = handle.join().expect("accessor thread");
        assert!(Arc::ptr_eq(&first, &shared));
    }
}

#[test]
fn dropping_last_reference_tears_down_the_page_cache() {
    let mut builder = ImageBuilder::new(1024, 256);
    let block = builder.alloc_block();
    builder.fill_block(block, 0x33);
    builder.put_inode(12, S_IFREG | 0o644, 1024, &[block]);
    let (fs, _device) = mount(builder.build()).expect("mount");

    let inode = fs.access_inode(InodeNumber(12));
    inode.wait_ready();
    let frontal = inode.frontal();
    drop(inode);

    // The initialization task may still hold its transient reference for
    // an instant; the cache closes as soon as the last one is gone.
    let mut revoked = false;
    for _ in 0..2000 {
        match frontal.lock(0, frontal.size()) {
            Err(BfsError::Revoked) => {
                revoked = true;
                break;
            }
            _ => thread::sleep(Duration::from_millis(1)),
        }
    }
    assert!(revoked, "page cache never closed after the last drop");

    // Re-accessing the number builds a fresh, working inode.
    let again = fs.access_inode(InodeNumber(12));
    let bytes = again.read_at(0, 1024).expect("read after rebuild");
    assert!(bytes.iter().all(|&b| b == 0x33));
}

#[test]
fn lookup_on_regular_file_is_rejected() {
    let mut builder = ImageBuilder::new(1024, 256);
    let block = builder.alloc_block();
    builder.put_inode(12, S_IFREG | 0o644, 1024, &[block]);
    let (fs, _device) = mount(builder.build()).expect("mount");

    let inode = fs.access_inode(InodeNumber(12));
    assert!(matches!(
        inode.find_entry("anything"),
        Err(BfsError::NotDirectory)
    ));
    let mut cursor = OpenFile::new(inode);
    assert!(matches!(cursor.read_entries(), Err(BfsError::NotDirectory)));
}

#[test]
fn fast_and_slow_symlinks_resolve() {
    let mut builder = ImageBuilder::new(1024, 256);
    builder.put_symlink_inode(20, "etc/fstab");
    builder.put_inode(12, S_IFREG | 0o644, 0, &[]);

    let long_target = "directory/".repeat(7); // 70 bytes, too long for the inode
    let block = builder.alloc_block();
    builder.write_block(block, long_target.as_bytes());
    #[expect(clippy::cast_possible_truncation)]
    builder.put_inode(21, bfs_types::S_IFLNK | 0o777, long_target.len() as u32, &[block]);

    let (fs, _device) = mount(builder.build()).expect("mount");

    let fast = fs.access_inode(InodeNumber(20));
    assert_eq!(fast.read_link().expect("fast target"), "etc/fstab");

    let slow = fs.access_inode(InodeNumber(21));
    assert_eq!(slow.read_link().expect("slow target"), long_target);

    let regular = fs.access_inode(InodeNumber(12));
    assert!(matches!(regular.read_link(), Err(BfsError::NotSymlink)));
}

#[test]
fn file_bytes_flow_through_the_frontal_channel() {
    let mut builder = ImageBuilder::new(1024, 256);
    let block = builder.alloc_block();
    builder.fill_block(block, 0x77);
    builder.put_inode(12, S_IFREG | 0o644, 1024, &[block]);
    let (fs, _device) = mount(builder.build()).expect("mount");

    let inode = fs.access_inode(InodeNumber(12));
    let frontal = inode.frontal();
    let _lock = frontal.lock(0, frontal.size()).expect("lock");
    let mapping = frontal.map(0, 1024).expect("map");
    assert!(mapping.as_slice().iter().all(|&b| b == 0x77));
}

#[test]
fn file_backed_image_mounts_and_reads() {
    use std::io::Write;

    let mut builder = ImageBuilder::new(1024, 256);
    let block = builder.alloc_block();
    builder.fill_block(block, 0x99);
    builder.put_inode(12, S_IFREG | 0o644, 1024, &[block]);
    let image = builder.build();

    let mut tmp = tempfile::NamedTempFile::new().expect("tempfile");
    tmp.write_all(&image).expect("write image");
    tmp.flush().expect("flush");

    let device = FileSectorDevice::open(tmp.path()).expect("open");
    let fs = FileSystem::init(Arc::new(device) as Arc<dyn SectorDevice>).expect("mount");
    let inode = fs.access_inode(InodeNumber(12));
    let bytes = inode.read_at(0, 1024).expect("read");
    assert!(bytes.iter().all(|&b| b == 0x99));
}

#[test]
fn four_kib_block_size_end_to_end() {
    let mut builder = ImageBuilder::new(4096, 128);
    let dir_block = builder.alloc_block();
    let mut records = dir_record(12, 16, EXT2_FT_REG_FILE, b"data");
    records.extend_from_slice(&pad_record(4080));
    builder.write_block(dir_block, &records);
    builder.put_inode(2, S_IFDIR | 0o755, 4096, &[dir_block]);

    builder.fill_block(100, 0x42);
    builder.fill_block(101, 0x43);
    builder.put_inode(12, S_IFREG | 0o644, 8192, &[100, 101]);

    let (fs, device, inode) = mount_and_settle(builder.build(), 12);

    let root = fs.access_root();
    let entry = root.find_entry("data").expect("lookup").expect("present");
    assert_eq!(entry.inode, InodeNumber(12));
    assert_eq!(entry.kind, FileKind::Regular);

    device.reset();
    let bytes = inode.read_at(0, 8192).expect("read");
    assert!(bytes[..4096].iter().all(|&b| b == 0x42));
    assert!(bytes[4096..].iter().all(|&b| b == 0x43));
    // Two consecutive 8-sector blocks: one fused read.
    assert_eq!(reads(&device), vec![(800, 16)]);
}
