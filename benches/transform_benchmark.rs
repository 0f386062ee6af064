//! Throughput of accumulation plus the host-memory convolution backend

use std::f32::consts::PI;
use std::sync::Arc;

use cqt_analyzer::{AnalyzerConfig, CpuDevice, KernelBank, Transformer};
use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};

fn sine(sample_rate: f32, frequency: f32, len: usize) -> Vec<f32> {
    (0..len)
        .map(|n| (2.0 * PI * frequency * n as f32 / sample_rate).sin() * 0.5)
        .collect()
}

fn bench_kernel_bank(c: &mut Criterion) {
    c.bench_function("kernel_bank_default", |b| {
        b.iter(|| KernelBank::new(black_box(48_000.0), 32.7, 16_000.0, 12));
    });
}

fn bench_stream(c: &mut Criterion, name: &str, config: AnalyzerConfig, seconds: f32) {
    let samples = sine(config.sample_rate, 440.0, (config.sample_rate * seconds) as usize);

    c.bench_function(name, |b| {
        b.iter_batched(
            || Transformer::new(Arc::new(CpuDevice::new()), config.clone()),
            |transformer| {
                let Ok(mut transformer) = transformer else {
                    return;
                };
                for chunk in samples.chunks(512) {
                    let _ = transformer.add_samples(black_box(chunk));
                }
                let _ = transformer.flush();
                let _ = transformer.destroy();
            },
            BatchSize::LargeInput,
        );
    });
}

fn bench_streaming(c: &mut Criterion) {
    bench_stream(c, "stream_default_1s", AnalyzerConfig::default(), 1.0);

    let voice = AnalyzerConfig {
        sample_rate: 16_000.0,
        f_min: 80.0,
        f_max: 4_000.0,
        bins_per_octave: 24,
        block_size: 1024,
        batch_factor: 8,
        max_blocks: 16,
        working_buffer_size: 16_384,
        num_bands: 3,
        ..AnalyzerConfig::default()
    };
    bench_stream(c, "stream_voice_5s", voice, 5.0);
}

criterion_group!(benches, bench_kernel_bank, bench_streaming);
criterion_main!(benches);
