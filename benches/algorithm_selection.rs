//! Algorithm selection and execution on the host engine.
//!
//! Shapes: small image batches with 3×3 filters, grouped and ungrouped.
//! Reports: enumeration cost per direction, and forward throughput
//! (2*N*K*C*R*S*P*Q FLOPs per call).

use std::sync::Arc;
use std::time::Duration;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use convcheck::{
    create_convolution, run_convolution, supported_candidates, ConvolutionConfig,
    ConvolutionParams, DataType, Device, Direction, FilterConfig, FwdAlgo, HostDriver,
    RandomGenerator, TensorConfig, TensorFormat, Tunables,
};

/// `(n, c, h, w, k, groups)` with a 3×3 filter and unit padding.
const SHAPES: &[(i32, i32, i32, i32, i32, i32)] = &[
    (1, 8, 16, 16, 8, 1),
    (2, 16, 16, 16, 16, 1),
    (2, 16, 16, 16, 16, 4),
    (4, 32, 8, 8, 32, 1),
];

fn open_device() -> Device {
    let tunables = Tunables { device: 0, device_memory_limit_mb: 512 };
    match Device::open(Arc::new(HostDriver::new()), &tunables) {
        Ok(device) => device,
        Err(err) => panic!("[algorithm_selection] host device: {err}"),
    }
}

fn config(shape: (i32, i32, i32, i32, i32, i32), direction: Direction) -> ConvolutionConfig {
    let (n, c, h, w, k, groups) = shape;
    ConvolutionConfig::new(
        TensorConfig::packed(DataType::Float, &[n, c, h, w], TensorFormat::Nchw),
        FilterConfig::new(DataType::Float, TensorFormat::Nchw, &[k, c / groups, 3, 3]),
        ConvolutionParams::new(&[1, 1], &[1, 1], &[1, 1], DataType::Float).with_group_count(groups),
        direction,
    )
}

fn label(shape: (i32, i32, i32, i32, i32, i32)) -> String {
    let (n, c, h, w, k, groups) = shape;
    format!("{n}x{c}x{h}x{w}_k{k}_g{groups}")
}

fn bench_enumeration(c: &mut Criterion) {
    let device = open_device();
    let handle = device.create_engine_handle().unwrap();
    let mut group = c.benchmark_group("supported_candidates");
    for &shape in SHAPES {
        for direction in Direction::ALL {
            let mut rng = RandomGenerator::new(0);
            let conv = create_convolution(&device, &config(shape, direction), -1.0, 1.0, &mut rng)
                .unwrap();
            let limit = device.available_bytes();
            group.bench_with_input(
                BenchmarkId::new(direction.name(), label(shape)),
                &conv,
                |b, conv| {
                    b.iter(|| {
                        supported_candidates(&handle, direction, black_box(conv.descriptors()), limit)
                    })
                },
            );
        }
    }
    group.finish();
}

fn bench_forward(c: &mut Criterion) {
    let device = open_device();
    let handle = device.create_engine_handle().unwrap();
    let mut group = c.benchmark_group("forward_implicit_gemm");
    for &shape in SHAPES {
        let (n, ch, h, w, k, groups) = shape;
        let flops = 2 * (n * k * (ch / groups) * 9 * h * w) as u64;
        group.throughput(Throughput::Elements(flops));
        let mut rng = RandomGenerator::new(1);
        let conv = create_convolution(&device, &config(shape, Direction::Forward), -1.0, 1.0, &mut rng)
            .unwrap();
        group.bench_with_input(BenchmarkId::from_parameter(label(shape)), &conv, |b, conv| {
            b.iter(|| {
                run_convolution(&handle, FwdAlgo::ImplicitGemm.into(), 1.0, 0.0, &conv.args(), None)
                    .unwrap()
            })
        });
    }
    group.finish();
}

criterion_group!(
    name = selection_benches;
    config = Criterion::default().measurement_time(Duration::from_secs(3));
    targets = bench_enumeration, bench_forward,
);
criterion_main!(selection_benches);
