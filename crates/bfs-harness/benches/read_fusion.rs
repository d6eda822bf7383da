#![forbid(unsafe_code)]

use bfs_harness::{ImageBuilder, mount};
use bfs_types::{InodeNumber, S_IFREG};
use criterion::{BatchSize, Criterion, criterion_group, criterion_main};

/// A 12-block file addressed through the direct pointers, either one
/// physically contiguous run or fully fragmented (every pointer breaks
/// the run).
fn build_image(contiguous: bool) -> Vec<u8> {
    let mut builder = ImageBuilder::new(1024, 1024);
    let mut ptrs = [0_u32; 12];
    for (slot, pointer) in ptrs.iter_mut().enumerate() {
        let slot = slot as u32;
        *pointer = if contiguous {
            100 + slot
        } else if slot % 2 == 0 {
            100 + slot
        } else {
            500 + slot
        };
    }
    for pointer in ptrs {
        builder.fill_block(pointer, 0xAB);
    }
    builder.put_inode(12, S_IFREG | 0o644, 12 * 1024, &ptrs);
    builder.build()
}

fn bench_cold_sequential_read(c: &mut Criterion) {
    let mut group = c.benchmark_group("cold_sequential_read");
    for (name, image) in [
        ("fused", build_image(true)),
        ("fragmented", build_image(false)),
    ] {
        group.bench_function(name, |b| {
            b.iter_batched(
                || mount(image.clone()).expect("mount"),
                |(fs, _device)| {
                    let inode = fs.access_inode(InodeNumber(12));
                    inode.read_at(0, 12 * 1024).expect("read")
                },
                BatchSize::SmallInput,
            );
        });
    }
    group.finish();
}

criterion_group!(benches, bench_cold_sequential_read);
criterion_main!(benches);
