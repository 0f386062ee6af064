//! Block accumulation into the device-resident working buffer.
//!
//! Chunks of any length are gathered into fixed-size blocks held in a [`RingBuffer`].
//! Each completed block is decimated and appended to a flat working buffer on the
//! compute device. When the working buffer cannot take another block it restarts at
//! offset zero, after copying back the most recent blocks so that analysis windows
//! crossing the restart still see contiguous audio.

use std::collections::VecDeque;
use std::sync::Arc;

use crate::audio::{AudioBuffer, RingBuffer};
use crate::config::{validate_block_layout, AnalyzerConfig};
use crate::decimator::Decimator;
use crate::device::{self, BufferHandle, ComputeDevice};
use crate::error::{AnalyzerError, Result};

/// A completed block whose analysis window is fully present in the working buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadyBlock {
    /// Start of the block in the working buffer, in samples.
    pub offset: usize,
    /// Number of blocks completed before this one since the last reset.
    pub sequence: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccumulatorEvent {
    /// The working buffer restarted; every offset at or past `shift` moved down by it.
    Wrapped { shift: usize },
    BlockReady(ReadyBlock),
}

/// Longest window, in input samples, that any bin needs for one frame.
///
/// Each bin is sized at the rate of the decimation band it falls into and scaled back
/// by that band's cumulative factor. The result never drops below `max_kernel_length`.
pub fn min_window_size(config: &AnalyzerConfig, decimator: &Decimator, max_kernel_length: usize) -> usize {
    let q = config.q_factor();
    config
        .frequencies()
        .into_iter()
        .map(|frequency| {
            let (rate, cumulative) = decimator
                .band_for_frequency(frequency)
                .map(|band| (band.effective_sample_rate, band.cumulative_factor))
                .unwrap_or((config.sample_rate, 1));
            (q * rate as f64 / frequency as f64).ceil() as usize * cumulative
        })
        .max()
        .unwrap_or(0)
        .max(max_kernel_length)
}

pub struct Accumulator {
    device: Arc<dyn ComputeDevice>,
    block_size: usize,
    blocks: RingBuffer<AudioBuffer>,
    fill: usize,
    working_buffer: Option<BufferHandle>,
    working_capacity: usize,
    write_offset: usize,
    min_window_size: usize,
    backfill_blocks: usize,
    pending: VecDeque<ReadyBlock>,
    events: VecDeque<AccumulatorEvent>,
    event_capacity: usize,
    decimator: Decimator,
    band_outputs: Vec<Vec<f32>>,
    sequence: u64,
    dropped_events: u64,
}

impl Accumulator {
    /// Builds the block ring, the decimator and the working buffer.
    ///
    /// `max_kernel_length` is the longest kernel of the transform that will read the
    /// working buffer; the back-fill region is sized to cover it.
    pub fn new(
        device: Arc<dyn ComputeDevice>,
        config: &AnalyzerConfig,
        max_kernel_length: usize,
    ) -> Result<Self> {
        validate_block_layout(config.block_size, config.batch_factor, config.max_blocks)?;
        if config.event_queue_capacity == 0 {
            return Err(AnalyzerError::InvalidConfig(
                "event queue capacity must be positive".to_string(),
            ));
        }
        device::ensure_alive(device.as_ref())?;

        let mut decimator = Decimator::new();
        decimator.configure(
            config.num_bands,
            config.f_min,
            config.f_max,
            config.sample_rate,
            config.block_size,
            config.batch_factor,
        )?;

        let block_size = config.block_size;
        let min_window = min_window_size(config, &decimator, max_kernel_length);
        let backfill_blocks = min_window.div_ceil(block_size);

        if config.max_blocks < backfill_blocks + 1 {
            return Err(AnalyzerError::InvalidConfig(format!(
                "max blocks {} cannot hold {} back-fill blocks plus the block being appended",
                config.max_blocks, backfill_blocks
            )));
        }
        if config.working_buffer_size < (backfill_blocks + 1) * block_size {
            return Err(AnalyzerError::InvalidConfig(format!(
                "working buffer of {} samples cannot hold a {}-sample back-fill plus one block",
                config.working_buffer_size,
                backfill_blocks * block_size
            )));
        }

        let working_buffer =
            device.create_buffer("working buffer", device::byte_len(config.working_buffer_size))?;

        log::debug!(
            "accumulator: block {} x {}, working buffer {} samples, min window {} ({} back-fill blocks)",
            block_size,
            config.max_blocks,
            config.working_buffer_size,
            min_window,
            backfill_blocks
        );

        Ok(Self {
            device,
            block_size,
            blocks: RingBuffer::new(config.max_blocks, || AudioBuffer::new(block_size)),
            fill: 0,
            working_buffer: Some(working_buffer),
            working_capacity: config.working_buffer_size,
            write_offset: 0,
            min_window_size: min_window,
            backfill_blocks,
            pending: VecDeque::with_capacity(backfill_blocks + 1),
            events: VecDeque::with_capacity(config.event_queue_capacity),
            event_capacity: config.event_queue_capacity,
            decimator,
            band_outputs: Vec::new(),
            sequence: 0,
            dropped_events: 0,
        })
    }

    /// Appends `samples`; returns how many blocks were completed.
    pub fn add_samples(&mut self, samples: &[f32]) -> Result<usize> {
        self.check_usable()?;

        let mut consumed = 0;
        let mut completed = 0;
        while consumed < samples.len() {
            let copied = self.blocks.slot_mut().fill_from(self.fill, &samples[consumed..]);
            self.fill += copied;
            consumed += copied;

            if self.fill == self.block_size {
                self.complete_block()?;
                self.fill = 0;
                completed += 1;
            }
        }

        if completed > 1 {
            log::debug!("{} blocks completed by one chunk of {} samples", completed, samples.len());
        }
        Ok(completed)
    }

    fn complete_block(&mut self) -> Result<()> {
        let index = self.blocks.write();
        self.band_outputs = self.decimator.process_block(self.blocks.get(index).as_slice());
        self.prepare_output_buffer(index)
    }

    /// Copies the committed block at ring `index` into the working buffer.
    fn prepare_output_buffer(&mut self, index: usize) -> Result<()> {
        let working_buffer = self.check_usable()?;

        if self.wraps_on_next_block() {
            self.wrap(working_buffer)?;
        }

        device::write_samples(
            self.device.as_ref(),
            working_buffer,
            self.write_offset,
            self.blocks.get(index).as_slice(),
        )?;

        let ready = ReadyBlock {
            offset: self.write_offset,
            sequence: self.sequence,
        };
        self.write_offset += self.block_size;
        self.sequence += 1;

        self.pending.push_back(ready);
        while self.pending.len() > self.backfill_blocks {
            if let Some(block) = self.pending.pop_front() {
                self.push_event(AccumulatorEvent::BlockReady(block));
            }
        }
        Ok(())
    }

    /// Restarts the working buffer, back-filling the blocks that precede the one about
    /// to be appended.
    fn wrap(&mut self, working_buffer: BufferHandle) -> Result<()> {
        // The newest committed block is the one being appended, so history starts one back.
        let available = self.blocks.len().saturating_sub(1).min(self.backfill_blocks);
        let backfill_len = available * self.block_size;
        let shift = self.write_offset - backfill_len;

        for (position, back) in (1..=available).rev().enumerate() {
            let Some(index) = self.blocks.index_back(back) else {
                continue;
            };
            device::write_samples(
                self.device.as_ref(),
                working_buffer,
                position * self.block_size,
                self.blocks.get(index).as_slice(),
            )?;
        }

        for block in self.pending.iter_mut() {
            block.offset = block.offset.saturating_sub(shift);
        }
        self.write_offset = backfill_len;

        log::debug!(
            "working buffer wrapped: {} blocks back-filled, offsets shifted by {}",
            available,
            shift
        );
        self.push_event(AccumulatorEvent::Wrapped { shift });
        Ok(())
    }

    fn push_event(&mut self, event: AccumulatorEvent) {
        if self.events.len() == self.event_capacity {
            self.events.pop_front();
            self.dropped_events += 1;
            log::warn!(
                "accumulator event queue full ({}), dropping oldest event",
                self.event_capacity
            );
        }
        self.events.push_back(event);
    }

    /// Next undelivered event, oldest first.
    pub fn poll_event(&mut self) -> Option<AccumulatorEvent> {
        self.events.pop_front()
    }

    pub fn drain_events(&mut self) -> impl Iterator<Item = AccumulatorEvent> + '_ {
        self.events.drain(..)
    }

    pub fn pending_events(&self) -> usize {
        self.events.len()
    }

    pub fn dropped_events(&self) -> u64 {
        self.dropped_events
    }

    /// Samples still needed to complete the active block.
    pub fn samples_until_block(&self) -> usize {
        self.block_size - self.fill
    }

    /// True when the next completed block restarts the working buffer.
    pub fn wraps_on_next_block(&self) -> bool {
        self.write_offset + self.block_size > self.working_capacity
    }

    /// Copies `len` samples at `offset` out of the working buffer, waiting for every
    /// pending device write first.
    pub fn read_working_buffer(&self, offset: usize, len: usize) -> Result<Vec<f32>> {
        let working_buffer = self.check_usable()?;
        if offset + len > self.working_capacity {
            return Err(AnalyzerError::OutOfRange {
                what: "working buffer",
                offset,
                end: offset + len,
                capacity: self.working_capacity,
            });
        }
        device::read_samples(self.device.as_ref(), working_buffer, offset, len)
    }

    pub fn working_buffer(&self) -> Result<BufferHandle> {
        self.working_buffer.ok_or(AnalyzerError::Destroyed("accumulator"))
    }

    pub fn working_capacity(&self) -> usize {
        self.working_capacity
    }

    /// Offset in the working buffer where the next block lands.
    pub fn write_offset(&self) -> usize {
        self.write_offset
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn min_window_size(&self) -> usize {
        self.min_window_size
    }

    /// Blocks copied back on every wrap, and held back before `BlockReady` fires.
    pub fn backfill_blocks(&self) -> usize {
        self.backfill_blocks
    }

    pub fn blocks_completed(&self) -> u64 {
        self.sequence
    }

    pub fn decimator(&self) -> &Decimator {
        &self.decimator
    }

    /// Per-band decimated output of the most recent block, ascending cutoff.
    pub fn band_outputs(&self) -> &[Vec<f32>] {
        &self.band_outputs
    }

    /// Zero-fills the block ring and working buffer and clears every offset and queue.
    pub fn reset(&mut self) -> Result<()> {
        let working_buffer = self.check_usable()?;
        let block_size = self.block_size;
        self.blocks.reset(|| AudioBuffer::new(block_size));
        self.device.clear_buffer(working_buffer)?;
        self.fill = 0;
        self.write_offset = 0;
        self.sequence = 0;
        self.dropped_events = 0;
        self.pending.clear();
        self.events.clear();
        self.band_outputs.clear();
        self.decimator.reset();
        Ok(())
    }

    /// Releases the working buffer. Later calls are no-ops.
    pub fn destroy(&mut self) -> Result<()> {
        if let Some(buffer) = self.working_buffer.take() {
            if self.device.is_lost() {
                return Ok(());
            }
            self.device.destroy_buffer(buffer)?;
        }
        Ok(())
    }

    fn check_usable(&self) -> Result<BufferHandle> {
        let buffer = self.working_buffer()?;
        device::ensure_alive(self.device.as_ref())?;
        Ok(buffer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::CpuDevice;

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
            ..AnalyzerConfig::default()
        }
    }

    fn accumulator(config: &AnalyzerConfig) -> (Arc<CpuDevice>, Accumulator) {
        let device = Arc::new(CpuDevice::new());
        let accumulator = Accumulator::new(device.clone(), config, 64).unwrap();
        (device, accumulator)
    }

    fn ramp(len: usize, start: usize) -> Vec<f32> {
        (start..start + len).map(|n| n as f32).collect()
    }

    #[test]
    fn test_min_window_covers_lowest_bin() {
        let config = small_config();
        let (_, accumulator) = accumulator(&config);
        // Q * 8000 / 200 for 4 bins per octave
        let lowest = (config.q_factor() * 40.0).ceil() as usize;
        assert!(accumulator.min_window_size() >= lowest);
        assert_eq!(
            accumulator.backfill_blocks(),
            accumulator.min_window_size().div_ceil(64)
        );
    }

    #[test]
    fn test_partial_chunks_complete_blocks() {
        let config = small_config();
        let (_, mut accumulator) = accumulator(&config);
        assert_eq!(accumulator.add_samples(&ramp(40, 0)).unwrap(), 0);
        assert_eq!(accumulator.samples_until_block(), 24);
        assert_eq!(accumulator.add_samples(&ramp(30, 40)).unwrap(), 1);
        assert_eq!(accumulator.samples_until_block(), 58);
        assert_eq!(accumulator.add_samples(&ramp(250, 70)).unwrap(), 4);
        assert_eq!(accumulator.blocks_completed(), 5);
        assert_eq!(accumulator.write_offset(), 5 * 64);
    }

    #[test]
    fn test_working_buffer_matches_input_before_wrap() {
        let config = small_config();
        let (_, mut accumulator) = accumulator(&config);
        let input = ramp(448, 0);
        for chunk in input.chunks(37) {
            accumulator.add_samples(chunk).unwrap();
        }
        assert_eq!(accumulator.write_offset(), 448);
        assert_eq!(accumulator.read_working_buffer(0, 448).unwrap(), input);
    }

    #[test]
    fn test_block_ready_waits_for_window() {
        let config = small_config();
        let (_, mut accumulator) = accumulator(&config);
        let required = accumulator.backfill_blocks();

        accumulator.add_samples(&ramp(64 * required, 0)).unwrap();
        assert_eq!(accumulator.poll_event(), None);

        accumulator.add_samples(&ramp(64, 0)).unwrap();
        assert_eq!(
            accumulator.poll_event(),
            Some(AccumulatorEvent::BlockReady(ReadyBlock { offset: 0, sequence: 0 }))
        );
        accumulator.add_samples(&ramp(64, 0)).unwrap();
        assert_eq!(
            accumulator.poll_event(),
            Some(AccumulatorEvent::BlockReady(ReadyBlock { offset: 64, sequence: 1 }))
        );
    }

    #[test]
    fn test_wrap_backfills_recent_blocks() {
        let config = small_config();
        let (_, mut accumulator) = accumulator(&config);
        let backfill = accumulator.backfill_blocks();
        let total_blocks = 512 / 64 + 1;
        let input = ramp(total_blocks * 64, 0);
        accumulator.add_samples(&input).unwrap();

        let wrapped: Vec<_> = accumulator
            .drain_events()
            .filter(|event| matches!(event, AccumulatorEvent::Wrapped { .. }))
            .collect();
        assert_eq!(wrapped, vec![AccumulatorEvent::Wrapped { shift: 512 - backfill * 64 }]);

        // Back-filled history is followed directly by the block that triggered the wrap.
        let contiguous = (backfill + 1) * 64;
        assert_eq!(accumulator.write_offset(), contiguous);
        let expected = &input[input.len() - contiguous..];
        assert_eq!(accumulator.read_working_buffer(0, contiguous).unwrap(), expected);
    }

    #[test]
    fn test_pending_offsets_follow_wrap() {
        let config = small_config();
        let (_, mut accumulator) = accumulator(&config);
        let backfill = accumulator.backfill_blocks();
        accumulator.add_samples(&ramp(9 * 64, 0)).unwrap();

        let ready: Vec<ReadyBlock> = accumulator
            .drain_events()
            .filter_map(|event| match event {
                AccumulatorEvent::BlockReady(block) => Some(block),
                _ => None,
            })
            .collect();
        let last = ready.last().copied().unwrap();
        // Block `last.sequence` sits `backfill` blocks before the newest one.
        assert_eq!(last.sequence, 8 - backfill as u64);
        let offset = last.offset;
        let samples = accumulator.read_working_buffer(offset, 64).unwrap();
        assert_eq!(samples, ramp(64, last.sequence as usize * 64));
    }

    #[test]
    fn test_event_queue_drops_oldest() {
        let config = AnalyzerConfig {
            event_queue_capacity: 2,
            ..small_config()
        };
        let (_, mut accumulator) = accumulator(&config);
        accumulator.add_samples(&ramp(64 * 7, 0)).unwrap();
        assert_eq!(accumulator.pending_events(), 2);
        assert!(accumulator.dropped_events() > 0);
    }

    #[test]
    fn test_reset_clears_dropped_events() {
        let config = AnalyzerConfig {
            event_queue_capacity: 1,
            ..small_config()
        };
        let (_, mut accumulator) = accumulator(&config);
        accumulator.add_samples(&ramp(64 * 7, 0)).unwrap();
        assert!(accumulator.dropped_events() > 0);

        accumulator.reset().unwrap();
        assert_eq!(accumulator.dropped_events(), 0);
        assert_eq!(accumulator.pending_events(), 0);

        // Counting restarts from zero after a reset.
        accumulator.add_samples(&ramp(64 * 7, 0)).unwrap();
        let dropped = accumulator.dropped_events();
        assert!(dropped > 0);
        accumulator.reset().unwrap();
        assert_eq!(accumulator.dropped_events(), 0);
    }

    #[test]
    fn test_band_outputs_follow_decimation() {
        let config = small_config();
        let (_, mut accumulator) = accumulator(&config);
        accumulator.add_samples(&ramp(64, 0)).unwrap();
        let outputs = accumulator.band_outputs();
        assert_eq!(outputs.len(), accumulator.decimator().num_bands());
        for (output, band) in outputs.iter().zip(accumulator.decimator().bands()) {
            assert_eq!(output.len(), 64 / band.cumulative_factor);
        }
    }

    #[test]
    fn test_rejects_undersized_working_buffer() {
        let config = AnalyzerConfig {
            working_buffer_size: 128,
            ..small_config()
        };
        let device = Arc::new(CpuDevice::new());
        assert!(matches!(
            Accumulator::new(device, &config, 64),
            Err(AnalyzerError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_reset_and_destroy() {
        let config = small_config();
        let (device, mut accumulator) = accumulator(&config);
        accumulator.add_samples(&ramp(300, 1)).unwrap();
        accumulator.reset().unwrap();
        assert_eq!(accumulator.write_offset(), 0);
        assert_eq!(accumulator.samples_until_block(), 64);
        assert_eq!(accumulator.pending_events(), 0);
        assert!(accumulator.read_working_buffer(0, 512).unwrap().iter().all(|&s| s == 0.0));

        accumulator.destroy().unwrap();
        accumulator.destroy().unwrap();
        assert_eq!(device.resource_count(), (0, 0));
        assert!(matches!(
            accumulator.add_samples(&[0.0]),
            Err(AnalyzerError::Destroyed(_))
        ));
    }

    #[test]
    fn test_device_loss_is_reported() {
        let config = small_config();
        let (device, mut accumulator) = accumulator(&config);
        device.simulate_loss();
        assert!(matches!(
            accumulator.add_samples(&[0.0; 64]),
            Err(AnalyzerError::DeviceLost(_))
        ));
    }
}
