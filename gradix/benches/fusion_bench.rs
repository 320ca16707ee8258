//! Fusion pipeline benchmarks: expression building and simplification,
//! kernel execution on both host backends, and bytecode assembly.

use criterion::{criterion_group, criterion_main, BatchSize, Criterion};

use gradix::{init, ops, Device, Tensor, Val};

fn chain(x: &Val, depth: usize) -> Val {
    let mut acc = x.clone();
    for i in 0..depth {
        acc = ops::add(&ops::mul(&acc, x).unwrap(), &ops::muls(x, i as f64).unwrap()).unwrap();
    }
    acc
}

fn bench_fused_elementwise(c: &mut Criterion) {
    init(&[Device::Cpu, Device::Bytecode]);
    let mut group = c.benchmark_group("fused_elementwise_4096");
    for device in [Device::Cpu, Device::Bytecode] {
        let data: Vec<f32> = (0..4096).map(|i| (i as f32) * 0.001).collect();
        let x = Val::from(Tensor::from_f32(&[4096], &data, Some(device)).unwrap());
        group.bench_function(device.name(), |b| {
            b.iter_batched(
                || chain(&x, 8),
                |y| y.tensor().unwrap().to_vec().unwrap(),
                BatchSize::SmallInput,
            )
        });
    }
    group.finish();
}

fn bench_reduction(c: &mut Criterion) {
    init(&[Device::Cpu, Device::Bytecode]);
    let mut group = c.benchmark_group("sum_64x512");
    for device in [Device::Cpu, Device::Bytecode] {
        let data: Vec<f32> = (0..64 * 512).map(|i| (i as f32) * 0.001).collect();
        let x = Tensor::from_f32(&[64, 512], &data, Some(device)).unwrap();
        group.bench_function(device.name(), |b| {
            b.iter(|| x.sum(Some(&[1]), false).unwrap().to_vec().unwrap())
        });
    }
    group.finish();
}

fn bench_graph_build_and_simplify(c: &mut Criterion) {
    init(&[Device::Cpu]);
    let data: Vec<f32> = (0..256).map(|i| i as f32).collect();
    let x = Val::from(Tensor::from_f32(&[256], &data, Some(Device::Cpu)).unwrap());
    c.bench_function("build_chain_depth_32", |b| b.iter(|| chain(&x, 32)));
}

criterion_group!(
    benches,
    bench_fused_elementwise,
    bench_reduction,
    bench_graph_build_and_simplify
);
criterion_main!(benches);
