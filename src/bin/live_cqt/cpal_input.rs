//! CPAL-based audio input for live analysis
//!
//! Handles host and device selection, stream configuration, and conversion of every
//! supported sample format to mono f32 chunks delivered over a bounded channel.

use std::sync::mpsc::{SyncSender, TrySendError};

use anyhow::Context;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{BufferSize, HostId, Sample, SampleFormat, SizedSample, StreamConfig, SupportedBufferSize};
use dasp_sample::FromSample;

// Callback sizes requested per host; JACK keeps its own
const ALSA_HOST_BUFFER: u32 = 1024;
const DEFAULT_HOST_BUFFER: u32 = 512;

const PREFERRED_SAMPLE_RATE: u32 = 48000;

/// An input device as reported by a host.
#[derive(Debug, Clone)]
pub struct InputInfo {
    pub host: HostId,
    pub name: String,
    pub is_default: bool,
}

/// Negotiated parameters of the running input stream.
#[derive(Debug, Clone)]
pub struct InputConfig {
    pub sample_rate: f32,
    pub channels: u16,
    pub device_name: String,
    pub host_name: String,
}

/// Running capture stream; audio stops when this is dropped.
pub struct AudioInput {
    _stream: cpal::Stream,
    config: InputConfig,
}

impl AudioInput {
    /// Lists every input device of every available host.
    pub fn list_inputs() -> Vec<InputInfo> {
        let mut inputs = Vec::new();

        for host_id in cpal::available_hosts() {
            let Ok(host) = cpal::host_from_id(host_id) else {
                continue;
            };
            let default_name = host.default_input_device().and_then(|d| d.name().ok());
            let Ok(devices) = host.input_devices() else {
                continue;
            };
            for device in devices {
                let Ok(name) = device.name() else {
                    continue;
                };
                inputs.push(InputInfo {
                    host: host_id,
                    is_default: default_name.as_deref() == Some(name.as_str()),
                    name,
                });
            }
        }

        inputs
    }

    /// Opens the named input device (or the first host's default input) and starts
    /// streaming mono chunks into `sender`.
    ///
    /// Chunks that do not fit into the channel are dropped and counted by the callback.
    pub fn open(device_name: Option<&str>, sender: SyncSender<Vec<f32>>) -> anyhow::Result<Self> {
        let (device, config, sample_format, host_name) = select_input_device(device_name)?;

        let sample_rate = config.sample_rate.0 as f32;
        let device_name = device
            .name()
            .unwrap_or_else(|_| "Unknown device".to_string());

        println!("=== INPUT CONFIGURATION ===");
        match config.buffer_size {
            BufferSize::Fixed(frames) => println!("CPAL buffer size: {} frames", frames),
            BufferSize::Default => println!("CPAL buffer size: default"),
        }
        println!("Sample rate: {} Hz", sample_rate);
        println!("Channels: {}", config.channels);

        let input_config = InputConfig {
            sample_rate,
            channels: config.channels,
            device_name: device_name.clone(),
            host_name: host_name.clone(),
        };

        let stream = match sample_format {
            SampleFormat::F32 => build_stream::<f32>(&device, &config, sender)?,
            SampleFormat::I16 => build_stream::<i16>(&device, &config, sender)?,
            SampleFormat::U16 => build_stream::<u16>(&device, &config, sender)?,
            other => anyhow::bail!("unsupported sample format: {:?}", other),
        };

        stream.play().context("failed to start stream")?;

        println!("\n=== NOW LISTENING ===");
        println!(
            "Host: '{}', Device: '{}', Sample Rate: {} Hz",
            host_name, device_name, sample_rate
        );

        Ok(Self {
            _stream: stream,
            config: input_config,
        })
    }

    pub fn config(&self) -> &InputConfig {
        &self.config
    }
}

fn select_input_device(
    device_name: Option<&str>,
) -> anyhow::Result<(cpal::Device, StreamConfig, SampleFormat, String)> {
    let mut last_error: Option<anyhow::Error> = None;

    for host_id in cpal::available_hosts() {
        let host = cpal::host_from_id(host_id)?;
        let host_name = host_id.name().to_string();

        let device = match device_name {
            Some(wanted) => host
                .input_devices()
                .ok()
                .and_then(|mut devices| devices.find(|d| d.name().is_ok_and(|n| n == wanted))),
            None => host.default_input_device(),
        };
        let Some(device) = device else {
            last_error = Some(anyhow::anyhow!(
                "host {} has no matching input device",
                host_name
            ));
            continue;
        };

        match device.supported_input_configs() {
            Ok(configs) => {
                for supported in configs {
                    let sample_format = supported.sample_format();
                    if !matches!(
                        sample_format,
                        SampleFormat::F32 | SampleFormat::I16 | SampleFormat::U16
                    ) {
                        continue;
                    }

                    if supported.min_sample_rate().0 <= PREFERRED_SAMPLE_RATE
                        && supported.max_sample_rate().0 >= PREFERRED_SAMPLE_RATE
                    {
                        let supported =
                            supported.with_sample_rate(cpal::SampleRate(PREFERRED_SAMPLE_RATE));
                        let mut config = supported.config();
                        config.buffer_size = choose_buffer_size(supported.buffer_size(), &host_name);
                        return Ok((device, config, sample_format, host_name));
                    }
                }
            }
            Err(err) => {
                last_error = Some(anyhow::anyhow!(
                    "failed to enumerate input configs for host {}: {}",
                    host_name,
                    err
                ));
            }
        }

        match device.default_input_config() {
            Ok(supported) => {
                let sample_format = supported.sample_format();
                let mut config = supported.config();
                config.buffer_size = choose_buffer_size(supported.buffer_size(), &host_name);
                println!(
                    "Using device default sample rate: {} Hz (preferred {} Hz not available)",
                    config.sample_rate.0, PREFERRED_SAMPLE_RATE
                );
                return Ok((device, config, sample_format, host_name));
            }
            Err(err) => {
                last_error = Some(anyhow::anyhow!(
                    "failed to query default input config for host {}: {}",
                    host_name,
                    err
                ));
            }
        }
    }

    Err(last_error.unwrap_or_else(|| anyhow::anyhow!("no usable input device found")))
}

fn choose_buffer_size(supported: &SupportedBufferSize, host_name: &str) -> BufferSize {
    let preferred = match host_name {
        "JACK" => return BufferSize::Default,
        "ALSA" => ALSA_HOST_BUFFER,
        _ => DEFAULT_HOST_BUFFER,
    };

    match supported {
        SupportedBufferSize::Range { min, max } => BufferSize::Fixed(preferred.clamp(*min, *max)),
        SupportedBufferSize::Unknown => BufferSize::Fixed(preferred),
    }
}

fn build_stream<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    sender: SyncSender<Vec<f32>>,
) -> anyhow::Result<cpal::Stream>
where
    T: Sample + SizedSample,
    f32: FromSample<T>,
{
    let channels = config.channels.max(1) as usize;
    let mut dropped_chunks = 0u64;

    let stream = device
        .build_input_stream(
            config,
            move |data: &[T], _| {
                let mono = downmix(data, channels);
                match sender.try_send(mono) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        dropped_chunks += 1;
                        if dropped_chunks.is_power_of_two() {
                            eprintln!("Analysis is behind, dropped {} input chunks", dropped_chunks);
                        }
                    }
                    Err(TrySendError::Disconnected(_)) => {}
                }
            },
            move |err| {
                eprintln!("Stream error: {}", err);
            },
            None,
        )
        .context("failed to build stream")?;

    Ok(stream)
}

/// Averages interleaved frames of any sample type into mono f32.
fn downmix<T>(data: &[T], channels: usize) -> Vec<f32>
where
    T: Sample,
    f32: FromSample<T>,
{
    data.chunks_exact(channels)
        .map(|frame| {
            frame.iter().map(|&s| f32::from_sample_(s)).sum::<f32>() / channels as f32
        })
        .collect()
}
