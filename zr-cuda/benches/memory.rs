use criterion::{criterion_group, criterion_main, Criterion};

use zr_cuda::CudaEngine;

fn engine() -> CudaEngine {
    let path = std::env::var("ZR_CUDA_KERNELS")
        .unwrap_or_else(|_| concat!(env!("CARGO_MANIFEST_DIR"), "/kernels/engine.ptx").to_owned());
    CudaEngine::new(0, path).unwrap()
}

/// The training-loop allocation pattern: identical shapes allocated and freed every iteration.
/// Reuse from the free list should make this independent of the device allocator.
fn pool_reuse(c: &mut Criterion) {
    let engine = engine();
    engine.push_layer();

    c.bench_function("alloc_free_reused_64x1024", |b| {
        b.iter(|| {
            for _ in 0..64 {
                let buffer = engine.alloc(1024, false).unwrap();
                engine.free(buffer);
            }
        })
    });

    c.bench_function("layer_bracket_16x4096", |b| {
        b.iter(|| {
            engine.push_layer();
            for _ in 0..16 {
                engine.alloc(4096, false).unwrap();
            }
            engine.pop_layer();
        })
    });

    engine.pop_layer();
}

criterion_group!(benches, pool_reuse);
criterion_main!(benches);
