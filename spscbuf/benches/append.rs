use std::hint::black_box;

use spscbuf::SpscBuffer;

fn main() {
    divan::main();
}

#[global_allocator]
static ALLOC: divan::AllocProfiler = divan::AllocProfiler::system();

#[derive(Clone, Copy)]
struct Sample {
    _id: u64,
    _timestamp: u64,
    _value: f64,
}

#[divan::bench(args = [256, 1024, 4096])]
fn bench_push(bencher: divan::Bencher, block_capacity: usize) {
    bencher
        .with_inputs(|| SpscBuffer::<Sample>::with_block_capacity(block_capacity))
        .bench_values(|buffer| {
            for i in 0..10_000u64 {
                buffer.push(Sample {
                    _id: i,
                    _timestamp: i * 1000,
                    _value: i as f64,
                });
            }
            black_box(buffer);
        });
}

#[divan::bench(args = [1024])]
fn bench_push_drain_cycle(bencher: divan::Bencher, block_capacity: usize) {
    let buffer = SpscBuffer::<u64>::with_block_capacity(block_capacity);
    let mut out = Vec::new();
    bencher.bench_local(move || {
        for i in 0..10_000u64 {
            buffer.push(i);
        }
        buffer.drain_all(&mut out, -1);
        black_box(out.len());
        out.clear();
    });
}
