use std::f32::consts::PI;
use std::sync::Arc;

use cqt_analyzer::config::q_factor;
use cqt_analyzer::wavelet::MAX_KERNEL_LENGTH;
use cqt_analyzer::{
    frame_count, Accumulator, AccumulatorEvent, AnalyzerConfig, ComputeDevice, CpuDevice,
    Decimator, Kernel, KernelBank, ReadyBlock, RingBuffer, Transformer,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn sine(sample_rate: f32, frequency: f32, len: usize) -> Vec<f32> {
    (0..len)
        .map(|n| (2.0 * PI * frequency * n as f32 / sample_rate).sin() * 0.5)
        .collect()
}

fn small_config() -> AnalyzerConfig {
    AnalyzerConfig {
        sample_rate: 8_000.0,
        f_min: 200.0,
        f_max: 3_200.0,
        bins_per_octave: 4,
        block_size: 64,
        batch_factor: 4,
        max_blocks: 8,
        working_buffer_size: 512,
        num_bands: 2,
        time_slice_count: 8,
        texture_ring_size: 3,
        history_layers: 4,
        event_queue_capacity: 8,
    }
}

fn stream(config: AnalyzerConfig, samples: &[f32], chunk: usize) -> Vec<Vec<f32>> {
    let mut transformer = Transformer::new(Arc::new(CpuDevice::new()), config).unwrap();
    let mut frames = Vec::new();
    for piece in samples.chunks(chunk) {
        let produced = transformer.add_samples(piece).unwrap();
        frames.extend(transformer.read_recent_frames(produced).unwrap());
    }
    let produced = transformer.flush().unwrap();
    frames.extend(transformer.read_recent_frames(produced).unwrap());
    transformer.destroy().unwrap();
    frames
}

fn peak_bin(frame: &[f32]) -> usize {
    frame
        .iter()
        .enumerate()
        .max_by(|a, b| a.1.total_cmp(b.1))
        .map(|(bin, _)| bin)
        .unwrap()
}

#[test]
fn test_concert_a_peaks_at_its_bin() {
    let config = AnalyzerConfig::default();
    let samples = sine(48_000.0, 440.0, 72_000);
    let frames = stream(config.clone(), &samples, 4096);

    // The lowest kernels are clamped, so 1.5 s of audio yields 209 frames.
    assert_eq!(frames.len(), frame_count(samples.len(), MAX_KERNEL_LENGTH, 256));
    assert_eq!(frames.len(), 209);

    // 12 * log2(440 / 32.7) rounds to 45
    let on_pitch = frames
        .iter()
        .filter(|frame| peak_bin(frame).abs_diff(45) <= 2)
        .count();
    assert!(
        on_pitch * 5 >= frames.len() * 4,
        "{} of {} frames peak near 440 Hz",
        on_pitch,
        frames.len()
    );
}

#[test]
fn test_repeated_runs_are_deterministic() {
    let samples = sine(8_000.0, 600.0, 64 * 30);
    let first = stream(small_config(), &samples, 200);
    let second = stream(small_config(), &samples, 200);

    assert_eq!(first.len(), second.len());
    for (a, b) in first.iter().flatten().zip(second.iter().flatten()) {
        assert!((a - b).abs() <= 1e-4 * b.abs().max(1e-6));
    }
}

#[test]
fn test_random_chunk_sizes_match_whole_input() {
    let samples = sine(8_000.0, 900.0, 64 * 25);
    let whole = stream(small_config(), &samples, samples.len());

    let mut rng = StdRng::seed_from_u64(7);
    let mut transformer = Transformer::new(Arc::new(CpuDevice::new()), small_config()).unwrap();
    let mut pieces = Vec::new();
    let mut offset = 0;
    while offset < samples.len() {
        let len = rng.random_range(1..=97).min(samples.len() - offset);
        let produced = transformer.add_samples(&samples[offset..offset + len]).unwrap();
        pieces.extend(transformer.read_recent_frames(produced).unwrap());
        offset += len;
    }
    let produced = transformer.flush().unwrap();
    pieces.extend(transformer.read_recent_frames(produced).unwrap());
    transformer.destroy().unwrap();

    // A single large chunk outruns the output ring; compare the frames both still hold.
    let kept = whole.len().min(24);
    assert_eq!(pieces.len(), frame_count(samples.len(), 212, 16));
    for (a, b) in pieces[pieces.len() - kept..]
        .iter()
        .flatten()
        .zip(whole[whole.len() - kept..].iter().flatten())
    {
        assert!((a - b).abs() <= 1e-5 * b.abs().max(1.0));
    }
}

#[test]
fn test_ring_buffer_overwrites_oldest() {
    let mut ring = RingBuffer::new(4, || 0u32);
    for value in 1..=5 {
        ring.push(value);
    }
    assert_eq!(ring.len(), 4);
    assert_eq!(ring.total_writes(), 5);
    assert_eq!(ring.current(), Some(&5));
    assert_eq!(*ring.get(0), 5);
    assert_eq!(ring.latest(4).copied().collect::<Vec<_>>(), vec![2, 3, 4, 5]);
}

#[test]
fn test_kernels_have_unit_energy() {
    let q = q_factor(12);
    for frequency in [32.7, 440.0, 15_000.0] {
        let kernel = Kernel::new(frequency, 48_000.0, q);
        assert!((kernel.energy() - 1.0).abs() < 1e-4);
    }

    let bank = KernelBank::new(48_000.0, 32.7, 16_000.0, 12);
    assert_eq!(bank.num_bins(), 108);
    assert_eq!(bank.max_length(), MAX_KERNEL_LENGTH);
}

#[test]
fn test_frame_count_matches_default_layout() {
    assert_eq!(frame_count(57_344, 24_686, 256), 128);
    assert_eq!(frame_count(24_685, 24_686, 256), 0);
    assert_eq!(frame_count(24_686, 24_686, 256), 1);
    assert_eq!(frame_count(1_000, 24_686, 0), 0);
}

#[test]
fn test_decimation_factors_divide_the_hop() {
    let config = AnalyzerConfig::default();
    let mut decimator = Decimator::new();
    decimator
        .configure(
            config.num_bands,
            config.f_min,
            config.f_max,
            config.sample_rate,
            config.block_size,
            config.batch_factor,
        )
        .unwrap();

    let hop = config.hop_length();
    assert_eq!(decimator.num_bands(), 6);
    for band in decimator.bands() {
        assert_eq!(hop % band.cumulative_factor, 0);
        assert_eq!(config.block_size % band.cumulative_factor, 0);
    }
    assert!(decimator
        .bands()
        .windows(2)
        .all(|pair| pair[0].cumulative_factor >= pair[1].cumulative_factor));
}

#[test]
fn test_working_buffer_holds_back_filled_history() {
    let device: Arc<dyn ComputeDevice> = Arc::new(CpuDevice::new());
    let config = small_config();
    let mut accumulator = Accumulator::new(device, &config, 212).unwrap();
    assert_eq!(accumulator.backfill_blocks(), 4);

    let ramp: Vec<f32> = (0..64 * 9).map(|n| n as f32).collect();

    accumulator.add_samples(&ramp[..64 * 5]).unwrap();
    assert_eq!(
        accumulator.poll_event(),
        Some(AccumulatorEvent::BlockReady(ReadyBlock {
            offset: 0,
            sequence: 0
        }))
    );
    assert_eq!(accumulator.read_working_buffer(0, 320).unwrap(), ramp[..320]);

    // The ninth block no longer fits: four blocks move to the front first.
    accumulator.add_samples(&ramp[64 * 5..]).unwrap();
    let events: Vec<_> = accumulator.drain_events().collect();
    assert!(events.contains(&AccumulatorEvent::Wrapped { shift: 256 }));
    assert_eq!(accumulator.write_offset(), 320);
    assert_eq!(accumulator.read_working_buffer(0, 320).unwrap(), ramp[256..]);

    accumulator.destroy().unwrap();
}
