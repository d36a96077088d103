use blockmask::{
    create_block_mask, dense_to_ordered, ordered_to_dense, transpose_ordered, BlockMaskOptions,
    BlockSize, MaskMod,
};
use candle_core::{Device, Tensor};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use rand::{rngs::StdRng, Rng, SeedableRng};

fn random_grid(device: &Device, rows: usize, cols: usize, density: f64) -> Tensor {
    let mut rng = StdRng::seed_from_u64(0x5eed);
    let data: Vec<u8> = (0..rows * cols)
        .map(|_| u8::from(rng.gen_bool(density)))
        .collect();
    Tensor::from_vec(data, (rows, cols), device).expect("grid")
}

fn bench_codec(c: &mut Criterion) {
    let device = Device::Cpu;
    let sizes = &[(64usize, 64usize), (256, 256), (1024, 1024)];

    let mut group = c.benchmark_group("codec/round_trip");
    for &(rows, cols) in sizes {
        let dense = random_grid(&device, rows, cols, 0.3);
        group.throughput(Throughput::Elements((rows * cols) as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(format!("{}x{}", rows, cols)),
            &dense,
            |b, dense| {
                b.iter(|| {
                    let (counts, indices) = dense_to_ordered(black_box(dense)).expect("encode");
                    let back = ordered_to_dense(&counts, &indices).expect("decode");
                    black_box(back);
                });
            },
        );
    }
    group.finish();

    let mut group = c.benchmark_group("codec/transpose");
    for &(rows, cols) in sizes {
        let dense = random_grid(&device, rows, cols, 0.3);
        let (counts, indices) = dense_to_ordered(&dense).expect("encode");
        group.throughput(Throughput::Elements((rows * cols) as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(format!("{}x{}", rows, cols)),
            &(counts, indices),
            |b, (counts, indices)| {
                b.iter(|| {
                    let out = transpose_ordered(black_box(counts), black_box(indices))
                        .expect("transpose");
                    black_box(out);
                });
            },
        );
    }
    group.finish();
}

fn bench_builder(c: &mut Criterion) {
    let device = Device::Cpu;
    let causal = MaskMod::named("causal", |_b, _h, q, kv| q.broadcast_ge(kv));
    let seq_lens = &[512usize, 2048];

    let mut group = c.benchmark_group("builder/causal");
    for &seq_len in seq_lens {
        group.throughput(Throughput::Elements((seq_len * seq_len) as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(seq_len),
            &causal,
            |b, causal| {
                b.iter(|| {
                    let mask = create_block_mask(
                        &causal.clone().into(),
                        1,
                        4,
                        seq_len,
                        seq_len,
                        &device,
                        BlockMaskOptions::from(BlockSize::square(128)),
                    )
                    .expect("block mask");
                    black_box(mask);
                });
            },
        );
    }
    group.finish();
}

criterion_group!(benches, bench_codec, bench_builder);
criterion_main!(benches);
