use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{mpsc, Arc, Mutex};

use rustc_hash::FxHashMap;

use super::{
    BufferHandle, ComputeDevice, ConvolutionBindings, ConvolutionParams, TextureHandle,
    TextureRegion, TextureShape, CQT_SHADER, WORKGROUP_SIZE,
};
use crate::error::{AnalyzerError, Result};

const TEXTURE_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::R32Float;
const BYTES_PER_TEXEL: u32 = 4;

#[derive(Default)]
struct GpuResources {
    buffers: FxHashMap<u64, wgpu::Buffer>,
    textures: FxHashMap<u64, (wgpu::Texture, TextureShape)>,
    bind_groups: FxHashMap<ConvolutionBindings, wgpu::BindGroup>,
}

/// [`ComputeDevice`] backed by a wgpu device and queue.
pub struct WgpuDevice {
    device: wgpu::Device,
    queue: wgpu::Queue,
    pipeline: wgpu::ComputePipeline,
    bind_group_layout: wgpu::BindGroupLayout,
    params: wgpu::Buffer,
    resources: Mutex<GpuResources>,
    next_id: AtomicU64,
    lost: Arc<AtomicBool>,
    name: String,
}

impl WgpuDevice {
    /// Requests the default high-performance adapter and a device on it.
    pub fn request() -> Result<Self> {
        pollster::block_on(Self::request_async())
    }

    pub async fn request_async() -> Result<Self> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor::default());
        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                force_fallback_adapter: false,
                compatible_surface: None,
            })
            .await
            .map_err(|e| AnalyzerError::Device(format!("no suitable adapter: {e}")))?;

        let info = adapter.get_info();
        let (device, queue) = adapter
            .request_device(&wgpu::DeviceDescriptor {
                label: Some("cqt device"),
                required_features: wgpu::Features::empty(),
                required_limits: adapter.limits(),
                memory_hints: wgpu::MemoryHints::Performance,
                trace: wgpu::Trace::Off,
            })
            .await
            .map_err(|e| AnalyzerError::Device(format!("device request failed: {e}")))?;

        Ok(Self::from_parts(
            device,
            queue,
            format!("{} ({:?})", info.name, info.backend),
        ))
    }

    /// Wraps an existing device, e.g. one shared with a renderer.
    pub fn from_parts(device: wgpu::Device, queue: wgpu::Queue, name: String) -> Self {
        let lost = Arc::new(AtomicBool::new(false));
        {
            let lost = lost.clone();
            device.set_device_lost_callback(move |reason, message| {
                log::error!("wgpu device lost ({:?}): {}", reason, message);
                lost.store(true, Ordering::SeqCst);
            });
        }

        let module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("cqt shader"),
            source: wgpu::ShaderSource::Wgsl(CQT_SHADER.into()),
        });

        let storage = |binding: u32, read_only: bool| wgpu::BindGroupLayoutEntry {
            binding,
            visibility: wgpu::ShaderStages::COMPUTE,
            ty: wgpu::BindingType::Buffer {
                ty: wgpu::BufferBindingType::Storage { read_only },
                has_dynamic_offset: false,
                min_binding_size: None,
            },
            count: None,
        };
        let bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("cqt bind group layout"),
            entries: &[
                storage(0, true),
                storage(1, true),
                storage(2, true),
                storage(3, false),
                wgpu::BindGroupLayoutEntry {
                    binding: 4,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
            ],
        });

        let layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("cqt pipeline layout"),
            bind_group_layouts: &[&bind_group_layout],
            push_constant_ranges: &[],
        });

        let pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some("cqt pipeline"),
            layout: Some(&layout),
            module: &module,
            entry_point: Some("main"),
            compilation_options: Default::default(),
            cache: None,
        });

        let params = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("cqt params"),
            size: std::mem::size_of::<ConvolutionParams>() as u64,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        log::info!("wgpu compute device ready: {}", name);

        Self {
            device,
            queue,
            pipeline,
            bind_group_layout,
            params,
            resources: Mutex::new(GpuResources::default()),
            next_id: AtomicU64::new(1),
            lost,
            name,
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, GpuResources>> {
        if self.is_lost() {
            return Err(AnalyzerError::DeviceLost(self.name.clone()));
        }
        self.resources
            .lock()
            .map_err(|_| AnalyzerError::Device("wgpu resource table poisoned".into()))
    }

    fn allocate_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn wait(&self) -> Result<()> {
        self.device
            .poll(wgpu::PollType::Wait)
            .map(|_| ())
            .map_err(|e| AnalyzerError::Device(format!("poll failed: {e}")))
    }

    /// Submits `encoder`, then maps `staging` once the copy has completed.
    fn read_back(&self, encoder: wgpu::CommandEncoder, staging: wgpu::Buffer) -> Result<Vec<u8>> {
        self.queue.submit(Some(encoder.finish()));

        let slice = staging.slice(..);
        let (sender, receiver) = mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = sender.send(result);
        });
        self.wait()?;

        receiver
            .recv()
            .map_err(|_| AnalyzerError::Device("map callback dropped".into()))?
            .map_err(|e| AnalyzerError::Device(format!("buffer map failed: {e}")))?;

        let bytes = slice.get_mapped_range().to_vec();
        staging.unmap();
        if self.is_lost() {
            return Err(AnalyzerError::DeviceLost(self.name.clone()));
        }
        Ok(bytes)
    }

    fn staging_buffer(&self, size: u64) -> wgpu::Buffer {
        self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("cqt readback"),
            size,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        })
    }
}

fn unknown_buffer(handle: BufferHandle) -> AnalyzerError {
    AnalyzerError::UnknownResource(format!("buffer {}", handle.0))
}

fn unknown_texture(handle: TextureHandle) -> AnalyzerError {
    AnalyzerError::UnknownResource(format!("texture {}", handle.0))
}

fn padded_bytes_per_row(width: u32) -> u32 {
    let unpadded = width * BYTES_PER_TEXEL;
    let align = wgpu::COPY_BYTES_PER_ROW_ALIGNMENT;
    unpadded.div_ceil(align) * align
}

impl ComputeDevice for WgpuDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn create_buffer(&self, label: &str, size: u64) -> Result<BufferHandle> {
        let size = size.div_ceil(wgpu::COPY_BUFFER_ALIGNMENT) * wgpu::COPY_BUFFER_ALIGNMENT;
        let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(label),
            size,
            usage: wgpu::BufferUsages::STORAGE
                | wgpu::BufferUsages::COPY_DST
                | wgpu::BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        });
        let id = self.allocate_id();
        self.lock()?.buffers.insert(id, buffer);
        Ok(BufferHandle(id))
    }

    fn write_buffer(&self, buffer: BufferHandle, offset: u64, data: &[u8]) -> Result<()> {
        let resources = self.lock()?;
        let target = resources.buffers.get(&buffer.0).ok_or_else(|| unknown_buffer(buffer))?;
        let end = offset + data.len() as u64;
        if end > target.size() {
            return Err(AnalyzerError::OutOfRange {
                what: "buffer write",
                offset: offset as usize,
                end: end as usize,
                capacity: target.size() as usize,
            });
        }
        self.queue.write_buffer(target, offset, data);
        Ok(())
    }

    fn clear_buffer(&self, buffer: BufferHandle) -> Result<()> {
        let resources = self.lock()?;
        let target = resources.buffers.get(&buffer.0).ok_or_else(|| unknown_buffer(buffer))?;
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some("cqt clear") });
        encoder.clear_buffer(target, 0, None);
        self.queue.submit(Some(encoder.finish()));
        Ok(())
    }

    fn destroy_buffer(&self, buffer: BufferHandle) -> Result<()> {
        let mut resources = self.lock()?;
        let removed = resources.buffers.remove(&buffer.0).ok_or_else(|| unknown_buffer(buffer))?;
        resources.bind_groups.retain(|bindings, _| {
            ![bindings.input, bindings.kernels, bindings.kernel_info, bindings.output]
                .contains(&buffer)
        });
        removed.destroy();
        Ok(())
    }

    fn create_texture(&self, label: &str, shape: TextureShape) -> Result<TextureHandle> {
        let texture = self.device.create_texture(&wgpu::TextureDescriptor {
            label: Some(label),
            size: wgpu::Extent3d {
                width: shape.width,
                height: shape.height,
                depth_or_array_layers: shape.layers,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: TEXTURE_FORMAT,
            usage: wgpu::TextureUsages::COPY_DST
                | wgpu::TextureUsages::COPY_SRC
                | wgpu::TextureUsages::TEXTURE_BINDING,
            view_formats: &[],
        });
        let id = self.allocate_id();
        self.lock()?.textures.insert(id, (texture, shape));
        Ok(TextureHandle(id))
    }

    fn copy_buffer_to_texture(
        &self,
        source: BufferHandle,
        offset: u64,
        texture: TextureHandle,
        region: TextureRegion,
    ) -> Result<()> {
        let resources = self.lock()?;
        let buffer = resources.buffers.get(&source.0).ok_or_else(|| unknown_buffer(source))?;
        let (target, shape) = resources
            .textures
            .get(&texture.0)
            .ok_or_else(|| unknown_texture(texture))?;
        if region.layer >= shape.layers || region.row + region.rows > shape.height {
            return Err(AnalyzerError::OutOfRange {
                what: "texture copy",
                offset: region.row as usize,
                end: (region.row + region.rows) as usize,
                capacity: shape.height as usize,
            });
        }

        let row_bytes = shape.width * BYTES_PER_TEXEL;
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some("cqt texture copy") });

        // Multi-row copies need 256-byte aligned rows; other widths go row by row.
        let aligned = row_bytes % wgpu::COPY_BYTES_PER_ROW_ALIGNMENT == 0;
        let copies: Vec<(u64, u32, u32)> = if aligned || region.rows == 1 {
            vec![(offset, region.row, region.rows)]
        } else {
            (0..region.rows)
                .map(|r| (offset + (r * row_bytes) as u64, region.row + r, 1))
                .collect()
        };

        for (src_offset, row, rows) in copies {
            encoder.copy_buffer_to_texture(
                wgpu::TexelCopyBufferInfo {
                    buffer,
                    layout: wgpu::TexelCopyBufferLayout {
                        offset: src_offset,
                        bytes_per_row: if rows > 1 { Some(row_bytes) } else { None },
                        rows_per_image: None,
                    },
                },
                wgpu::TexelCopyTextureInfo {
                    texture: target,
                    mip_level: 0,
                    origin: wgpu::Origin3d { x: 0, y: row, z: region.layer },
                    aspect: wgpu::TextureAspect::All,
                },
                wgpu::Extent3d {
                    width: shape.width,
                    height: rows,
                    depth_or_array_layers: 1,
                },
            );
        }
        self.queue.submit(Some(encoder.finish()));
        Ok(())
    }

    fn destroy_texture(&self, texture: TextureHandle) -> Result<()> {
        let (removed, _) = self
            .lock()?
            .textures
            .remove(&texture.0)
            .ok_or_else(|| unknown_texture(texture))?;
        removed.destroy();
        Ok(())
    }

    fn dispatch_convolution(
        &self,
        bindings: &ConvolutionBindings,
        params: &ConvolutionParams,
    ) -> Result<()> {
        let mut guard = self.lock()?;
        let resources = &mut *guard;

        if !resources.bind_groups.contains_key(bindings) {
            let buffer = |handle: BufferHandle| {
                resources.buffers.get(&handle.0).ok_or_else(|| unknown_buffer(handle))
            };
            let entries = [
                (0, buffer(bindings.input)?),
                (1, buffer(bindings.kernels)?),
                (2, buffer(bindings.kernel_info)?),
                (3, buffer(bindings.output)?),
                (4, &self.params),
            ];
            let entries: Vec<wgpu::BindGroupEntry> = entries
                .iter()
                .map(|(binding, buffer)| wgpu::BindGroupEntry {
                    binding: *binding,
                    resource: buffer.as_entire_binding(),
                })
                .collect();
            let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some("cqt bind group"),
                layout: &self.bind_group_layout,
                entries: &entries,
            });
            resources.bind_groups.insert(*bindings, bind_group);
        }
        let bind_group = resources
            .bind_groups
            .get(bindings)
            .ok_or_else(|| AnalyzerError::Device("bind group cache miss".into()))?;

        self.queue.write_buffer(&self.params, 0, bytemuck::bytes_of(params));

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some("cqt dispatch") });
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("cqt pass"),
                timestamp_writes: None,
            });
            pass.set_pipeline(&self.pipeline);
            pass.set_bind_group(0, bind_group, &[]);
            pass.dispatch_workgroups(
                params.num_bins.div_ceil(WORKGROUP_SIZE),
                params.num_frames,
                1,
            );
        }
        self.queue.submit(Some(encoder.finish()));
        Ok(())
    }

    fn read_buffer(&self, buffer: BufferHandle, offset: u64, size: u64) -> Result<Vec<u8>> {
        let padded = size.div_ceil(wgpu::COPY_BUFFER_ALIGNMENT) * wgpu::COPY_BUFFER_ALIGNMENT;
        let staging = self.staging_buffer(padded.max(wgpu::COPY_BUFFER_ALIGNMENT));
        let encoder = {
            let resources = self.lock()?;
            let source = resources.buffers.get(&buffer.0).ok_or_else(|| unknown_buffer(buffer))?;
            if offset + padded > source.size() {
                return Err(AnalyzerError::OutOfRange {
                    what: "buffer read",
                    offset: offset as usize,
                    end: (offset + size) as usize,
                    capacity: source.size() as usize,
                });
            }
            let mut encoder = self
                .device
                .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some("cqt read buffer") });
            encoder.copy_buffer_to_buffer(source, offset, &staging, 0, padded);
            encoder
        };
        let mut bytes = self.read_back(encoder, staging)?;
        bytes.truncate(size as usize);
        Ok(bytes)
    }

    fn read_texture(&self, texture: TextureHandle, layer: u32) -> Result<Vec<u8>> {
        let (encoder, staging, shape) = {
            let resources = self.lock()?;
            let (source, shape) = resources
                .textures
                .get(&texture.0)
                .ok_or_else(|| unknown_texture(texture))?;
            if layer >= shape.layers {
                return Err(AnalyzerError::OutOfRange {
                    what: "texture layer",
                    offset: layer as usize,
                    end: layer as usize + 1,
                    capacity: shape.layers as usize,
                });
            }
            let padded_row = padded_bytes_per_row(shape.width);
            let staging = self.staging_buffer(padded_row as u64 * shape.height as u64);
            let mut encoder = self
                .device
                .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some("cqt read texture") });
            encoder.copy_texture_to_buffer(
                wgpu::TexelCopyTextureInfo {
                    texture: source,
                    mip_level: 0,
                    origin: wgpu::Origin3d { x: 0, y: 0, z: layer },
                    aspect: wgpu::TextureAspect::All,
                },
                wgpu::TexelCopyBufferInfo {
                    buffer: &staging,
                    layout: wgpu::TexelCopyBufferLayout {
                        offset: 0,
                        bytes_per_row: Some(padded_row),
                        rows_per_image: Some(shape.height),
                    },
                },
                wgpu::Extent3d {
                    width: shape.width,
                    height: shape.height,
                    depth_or_array_layers: 1,
                },
            );
            (encoder, staging, *shape)
        };

        let padded = self.read_back(encoder, staging)?;
        let row_bytes = (shape.width * BYTES_PER_TEXEL) as usize;
        let padded_row = padded_bytes_per_row(shape.width) as usize;
        Ok(padded
            .chunks(padded_row)
            .take(shape.height as usize)
            .flat_map(|row| row[..row_bytes].iter().copied())
            .collect())
    }

    fn synchronize(&self) -> Result<()> {
        self.wait()?;
        if self.is_lost() {
            return Err(AnalyzerError::DeviceLost(self.name.clone()));
        }
        Ok(())
    }

    fn is_lost(&self) -> bool {
        self.lost.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AnalyzerConfig;
    use crate::device::CpuDevice;
    use crate::transformer::Transformer;

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

    struct Run {
        frames: Vec<Vec<f32>>,
        tiles: Vec<Vec<f32>>,
        history: Vec<f32>,
    }

    fn run(device: Arc<dyn ComputeDevice>, samples: &[f32]) -> Run {
        let mut transformer = Transformer::new(device, small_config()).unwrap();
        let mut frames = Vec::new();
        for chunk in samples.chunks(100) {
            let produced = transformer.add_samples(chunk).unwrap();
            frames.extend(transformer.read_recent_frames(produced).unwrap());
        }
        let produced = transformer.flush().unwrap();
        frames.extend(transformer.read_recent_frames(produced).unwrap());

        let tiles = (0..3).map(|slot| transformer.read_tile(slot).unwrap()).collect();
        let history = transformer.read_history_layer(0).unwrap();
        transformer.destroy().unwrap();
        Run {
            frames,
            tiles,
            history,
        }
    }

    fn assert_close(gpu: &[f32], cpu: &[f32]) {
        assert_eq!(gpu.len(), cpu.len());
        for (g, c) in gpu.iter().zip(cpu) {
            assert!((g - c).abs() <= 1e-3 * c.abs().max(1e-3), "gpu {} vs cpu {}", g, c);
        }
    }

    #[test]
    fn test_matches_cpu_device() {
        let gpu = match WgpuDevice::request() {
            Ok(device) => device,
            Err(err) => {
                eprintln!("skipping: no wgpu adapter ({})", err);
                return;
            }
        };

        // Two partials so more than one bin carries energy.
        let samples: Vec<f32> = (0..64 * 30)
            .map(|n| {
                let t = n as f32 / 8_000.0;
                0.5 * (2.0 * std::f32::consts::PI * 600.0 * t).sin()
                    + 0.25 * (2.0 * std::f32::consts::PI * 1_700.0 * t).sin()
            })
            .collect();

        let on_gpu = run(Arc::new(gpu), &samples);
        let on_cpu = run(Arc::new(CpuDevice::new()), &samples);

        assert!(!on_cpu.frames.is_empty());
        assert_eq!(on_gpu.frames.len(), on_cpu.frames.len());
        for (g, c) in on_gpu.frames.iter().zip(&on_cpu.frames) {
            assert_close(g, c);
        }
        for (g, c) in on_gpu.tiles.iter().zip(&on_cpu.tiles) {
            assert_close(g, c);
        }
        assert_close(&on_gpu.history, &on_cpu.history);
    }

    #[test]
    fn test_padded_bytes_per_row() {
        assert_eq!(padded_bytes_per_row(64), 256);
        assert_eq!(padded_bytes_per_row(108), 512);
        assert_eq!(padded_bytes_per_row(1), 256);
    }
}
