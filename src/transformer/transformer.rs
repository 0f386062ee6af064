use std::sync::Arc;

use super::types::{RingPosition, SpectrogramInfo};
use crate::audio::{Accumulator, AccumulatorEvent, RingBuffer};
use crate::config::AnalyzerConfig;
use crate::device::{self, ComputeDevice, TextureHandle, TextureRegion, TextureShape};
use crate::error::{AnalyzerError, Result};
use crate::wavelet::WaveletTransform;

/// Streaming CQT pipeline.
///
/// Samples go through the [`Accumulator`] into the device working buffer. Whenever a
/// tile's worth of frames is analyzable, the [`WaveletTransform`] writes them into its
/// output ring and the rows are copied into the current tile texture and the matching
/// layer of the history texture array.
///
/// Device resources are released by [`Transformer::destroy`], never implicitly.
pub struct Transformer {
    device: Arc<dyn ComputeDevice>,
    config: AnalyzerConfig,
    accumulator: Accumulator,
    transform: WaveletTransform,
    tiles: RingBuffer<TextureHandle>,
    history: TextureHandle,
    history_layers: RingBuffer<u32>,
    tile_fill: usize,
    /// Working buffer offset of the first frame not yet analyzed
    next_frame_offset: usize,
    frames_written: u64,
    skipped_samples: u64,
    destroyed: bool,
}

/// Tile ring and history array for one configuration.
struct Textures {
    tiles: RingBuffer<TextureHandle>,
    history: TextureHandle,
    history_layers: RingBuffer<u32>,
}

impl Transformer {
    pub fn new(device: Arc<dyn ComputeDevice>, config: AnalyzerConfig) -> Result<Self> {
        Self::validate(&config)?;
        device::ensure_alive(device.as_ref())?;

        let mut transform = WaveletTransform::new(device.clone(), &config, output_frames(&config))?;
        let (accumulator, textures) = match attach(device.clone(), &config, &mut transform) {
            Ok(parts) => parts,
            Err(err) => {
                if let Err(cleanup) = transform.destroy() {
                    log::warn!("failed to release kernels after construction error: {}", cleanup);
                }
                return Err(err);
            }
        };

        log::info!(
            "transformer ready on '{}': {} bins, hop {}, {} x {} frame tiles",
            device.name(),
            transform.num_bins(),
            transform.hop_length(),
            config.texture_ring_size,
            config.time_slice_count
        );

        Ok(Self {
            device,
            config,
            accumulator,
            transform,
            tiles: textures.tiles,
            history: textures.history,
            history_layers: textures.history_layers,
            tile_fill: 0,
            next_frame_offset: 0,
            frames_written: 0,
            skipped_samples: 0,
            destroyed: false,
        })
    }

    fn validate(config: &AnalyzerConfig) -> Result<()> {
        config.validate()?;
        // One block can raise both a wrap and a ready event before they are serviced.
        if config.event_queue_capacity < 2 {
            return Err(AnalyzerError::InvalidConfig(format!(
                "event queue capacity {} cannot hold a wrap and a ready event",
                config.event_queue_capacity
            )));
        }
        Ok(())
    }

    /// Streams `samples` through the pipeline; returns the number of frames computed.
    pub fn add_samples(&mut self, samples: &[f32]) -> Result<usize> {
        self.check_usable()?;
        let before = self.frames_written;

        let mut consumed = 0;
        while consumed < samples.len() {
            let until_block = self.accumulator.samples_until_block();
            let take = until_block.min(samples.len() - consumed);

            // The block completed by this piece restarts the working buffer, so analyze
            // everything staged before it is overwritten.
            if take == until_block && self.accumulator.wraps_on_next_block() {
                self.do_transform()?;
            }

            self.accumulator.add_samples(&samples[consumed..consumed + take])?;
            consumed += take;
            self.service_events()?;
        }

        Ok((self.frames_written - before) as usize)
    }

    fn service_events(&mut self) -> Result<()> {
        while let Some(event) = self.accumulator.poll_event() {
            match event {
                AccumulatorEvent::Wrapped { shift } => {
                    if self.next_frame_offset < shift {
                        let lost = shift - self.next_frame_offset;
                        self.skipped_samples += lost as u64;
                        log::warn!("{} staged samples were not analyzed before the working buffer wrapped", lost);
                        self.next_frame_offset = 0;
                    } else {
                        self.next_frame_offset -= shift;
                    }
                }
                AccumulatorEvent::BlockReady(block) => {
                    log::trace!("block {} ready at offset {}", block.sequence, block.offset);
                    let ready = self.transform.frame_count(self.staged_samples());
                    if ready >= self.config.time_slice_count {
                        self.do_transform()?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Analyzes every complete frame in the staging region; returns the frame count.
    fn do_transform(&mut self) -> Result<usize> {
        let total = self.transform.frame_count(self.staged_samples());
        if total == 0 {
            return Ok(0);
        }

        let slices = self.config.time_slice_count;
        let hop = self.transform.hop_length();
        let num_bins = self.transform.num_bins();
        let output = self.transform.output_buffer()?;

        let mut done = 0;
        while done < total {
            let tile_slot = self.tiles.write_index();
            let count = (slices - self.tile_fill).min(total - done);
            let row = tile_slot * slices + self.tile_fill;

            self.transform
                .transform(self.next_frame_offset + done * hop, row, count)?;

            let source_offset = device::byte_len(row * num_bins);
            let region = TextureRegion {
                layer: 0,
                row: self.tile_fill as u32,
                rows: count as u32,
            };
            self.device
                .copy_buffer_to_texture(output, source_offset, *self.tiles.get(tile_slot), region)?;
            let layer = *self.history_layers.get(self.history_layers.write_index());
            self.device.copy_buffer_to_texture(
                output,
                source_offset,
                self.history,
                TextureRegion { layer, ..region },
            )?;

            self.tile_fill += count;
            self.frames_written += count as u64;
            done += count;

            if self.tile_fill == slices {
                self.tiles.write();
                self.history_layers.write();
                self.tile_fill = 0;
                log::debug!("tile {} complete, history layer {}", tile_slot, layer);
            }
        }

        self.next_frame_offset += total * hop;
        Ok(total)
    }

    /// Analyzes whatever is staged and waits for the device to finish.
    pub fn flush(&mut self) -> Result<usize> {
        self.check_usable()?;
        let frames = self.do_transform()?;
        self.device.synchronize()?;
        Ok(frames)
    }

    /// Rebuilds every device resource for `config`. Kernels are only recomputed when the
    /// frequency layout changed. Streaming state starts over.
    ///
    /// A failure after teardown has begun leaves the transformer destroyed.
    pub fn reconfigure(&mut self, config: AnalyzerConfig) -> Result<()> {
        self.check_usable()?;
        Self::validate(&config)?;

        let rebuilt = match self.rebuild(&config) {
            Ok(rebuilt) => rebuilt,
            Err(err) => {
                self.destroyed = true;
                if let Err(cleanup) = self.transform.destroy() {
                    log::warn!("failed to release kernels after reconfiguration error: {}", cleanup);
                }
                return Err(err);
            }
        };

        debug_assert_eq!(rebuilt, self.config.frequency_params_differ(&config));
        self.tile_fill = 0;
        self.next_frame_offset = 0;
        self.frames_written = 0;
        self.skipped_samples = 0;
        self.config = config;

        log::info!(
            "transformer reconfigured ({}): {} bins, hop {}",
            if rebuilt { "kernels rebuilt" } else { "kernels kept" },
            self.transform.num_bins(),
            self.transform.hop_length()
        );
        Ok(())
    }

    fn rebuild(&mut self, config: &AnalyzerConfig) -> Result<bool> {
        self.release_textures()?;
        self.accumulator.destroy()?;

        let rebuilt = self.transform.reconfigure(config, output_frames(config))?;
        let (accumulator, textures) = attach(self.device.clone(), config, &mut self.transform)?;
        self.accumulator = accumulator;
        self.tiles = textures.tiles;
        self.history = textures.history;
        self.history_layers = textures.history_layers;
        Ok(rebuilt)
    }

    /// Releases every device resource. Later calls are no-ops.
    pub fn destroy(&mut self) -> Result<()> {
        if self.destroyed {
            return Ok(());
        }
        self.destroyed = true;
        if !self.device.is_lost() {
            self.release_textures()?;
        }
        self.accumulator.destroy()?;
        self.transform.destroy()?;
        log::info!("transformer destroyed");
        Ok(())
    }

    fn release_textures(&mut self) -> Result<()> {
        for &texture in self.tiles.iter() {
            self.device.destroy_texture(texture)?;
        }
        self.device.destroy_texture(self.history)
    }

    pub fn info(&self) -> SpectrogramInfo {
        SpectrogramInfo {
            num_bins: self.transform.num_bins(),
            frequencies: self.transform.frequencies(),
            hop_length: self.transform.hop_length(),
            sample_rate: self.config.sample_rate,
            time_slice_count: self.config.time_slice_count,
            texture_ring_size: self.config.texture_ring_size,
            history_layers: self.config.history_layers,
        }
    }

    pub fn position(&self) -> RingPosition {
        RingPosition {
            tile: self.tiles.write_index(),
            tile_fill: self.tile_fill,
            tiles_completed: self.tiles.total_writes(),
            history_layer: *self.history_layers.get(self.history_layers.write_index()),
            frames_written: self.frames_written,
        }
    }

    /// Contents of tile `slot`, `time_slice_count` rows of `num_bins` magnitudes.
    pub fn read_tile(&self, slot: usize) -> Result<Vec<f32>> {
        self.check_usable()?;
        if slot >= self.tiles.capacity() {
            return Err(AnalyzerError::OutOfRange {
                what: "texture ring",
                offset: slot,
                end: slot + 1,
                capacity: self.tiles.capacity(),
            });
        }
        let bytes = self.device.read_texture(*self.tiles.get(slot), 0)?;
        Ok(device::samples_from_bytes(&bytes))
    }

    /// Contents of one history array layer, laid out like a tile.
    pub fn read_history_layer(&self, layer: u32) -> Result<Vec<f32>> {
        self.check_usable()?;
        let bytes = self.device.read_texture(self.history, layer)?;
        Ok(device::samples_from_bytes(&bytes))
    }

    /// The most recent `count` frames still held by the output ring, oldest first, as
    /// `magnitude[frame][bin]`.
    pub fn read_recent_frames(&self, count: usize) -> Result<Vec<Vec<f32>>> {
        self.check_usable()?;
        let capacity = self.transform.output_frames();
        let count = count.min(self.frames_written as usize).min(capacity);
        if count == 0 {
            return Ok(Vec::new());
        }

        let first = ((self.frames_written - count as u64) % capacity as u64) as usize;
        let head = count.min(capacity - first);
        let mut magnitudes = self.transform.read_output(first, head)?;
        if head < count {
            magnitudes.extend(self.transform.read_output(0, count - head)?);
        }

        Ok(magnitudes
            .chunks(self.transform.num_bins())
            .map(<[f32]>::to_vec)
            .collect())
    }

    pub fn config(&self) -> &AnalyzerConfig {
        &self.config
    }

    pub fn accumulator(&self) -> &Accumulator {
        &self.accumulator
    }

    pub fn transform(&self) -> &WaveletTransform {
        &self.transform
    }

    pub fn tile_texture(&self, slot: usize) -> TextureHandle {
        *self.tiles.get(slot)
    }

    pub fn history_texture(&self) -> TextureHandle {
        self.history
    }

    /// Samples in the working buffer awaiting analysis.
    pub fn staged_samples(&self) -> usize {
        self.accumulator
            .write_offset()
            .saturating_sub(self.next_frame_offset)
    }

    /// Samples dropped without analysis because a wrap overtook them.
    pub fn skipped_samples(&self) -> u64 {
        self.skipped_samples
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    fn check_usable(&self) -> Result<()> {
        if self.destroyed {
            return Err(AnalyzerError::Destroyed("transformer"));
        }
        device::ensure_alive(self.device.as_ref())
    }
}

impl Drop for Transformer {
    fn drop(&mut self) {
        if !self.destroyed {
            log::warn!("transformer dropped without destroy(); its device resources were not released");
        }
    }
}

fn output_frames(config: &AnalyzerConfig) -> usize {
    config.texture_ring_size * config.time_slice_count
}

/// Creates the accumulator and textures for `config` and binds the working buffer as
/// the transform's input.
fn attach(
    device: Arc<dyn ComputeDevice>,
    config: &AnalyzerConfig,
    transform: &mut WaveletTransform,
) -> Result<(Accumulator, Textures)> {
    let mut accumulator = Accumulator::new(device.clone(), config, transform.max_kernel_length())?;
    transform.configure(accumulator.working_buffer()?, accumulator.working_capacity());

    match create_textures(device.as_ref(), config, transform.num_bins()) {
        Ok(textures) => Ok((accumulator, textures)),
        Err(err) => {
            accumulator.destroy()?;
            Err(err)
        }
    }
}

fn create_textures(
    device: &dyn ComputeDevice,
    config: &AnalyzerConfig,
    num_bins: usize,
) -> Result<Textures> {
    let tile_shape = TextureShape {
        width: num_bins as u32,
        height: config.time_slice_count as u32,
        layers: 1,
    };
    let mut tiles = Vec::with_capacity(config.texture_ring_size);
    let created = (0..config.texture_ring_size).try_for_each(|index| -> Result<()> {
        tiles.push(device.create_texture(&format!("cqt tile {index}"), tile_shape)?);
        Ok(())
    });
    let history = created.and_then(|()| {
        device.create_texture(
            "cqt history",
            TextureShape {
                layers: config.history_layers as u32,
                ..tile_shape
            },
        )
    });
    let history = match history {
        Ok(history) => history,
        Err(err) => {
            for texture in tiles {
                device.destroy_texture(texture)?;
            }
            return Err(err);
        }
    };

    Ok(Textures {
        tiles: RingBuffer::from_entries(tiles),
        history,
        history_layers: RingBuffer::from_entries((0..config.history_layers as u32).collect()),
    })
}
