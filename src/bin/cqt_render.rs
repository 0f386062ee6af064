// Offline renderer: streams a WAV file through the analyzer and summarizes the result.

use std::fs::File;
use std::io::BufWriter;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use cqt_analyzer::{AnalyzerConfig, ComputeDevice, CpuDevice, SpectrogramInfo, Transformer};
use log::{info, warn};
use serde::Serialize;

// Chunk sizes cycled through while streaming, so block boundaries never line up.
const CHUNK_PATTERN: [usize; 5] = [480, 1024, 317, 2048, 129];
const SUMMARY_ROWS: usize = 24;

/// Render a WAV file into a constant-Q spectrogram
#[derive(Parser, Debug)]
#[command(name = "cqt_render")]
#[command(about = "Stream a WAV file through the CQT analyzer and summarize the result")]
struct Cli {
    /// WAV file to analyze
    input: PathBuf,

    /// JSON analyzer configuration (camelCase keys)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Use the host-memory device even when a GPU is available
    #[arg(long)]
    cpu: bool,

    /// Write every frame plus the layout to this JSON file
    #[arg(long)]
    json: Option<PathBuf>,

    /// Print each band's anti-alias filter response at this many points
    #[arg(long = "filter-response", value_name = "POINTS")]
    filter_response: Option<usize>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Rendering<'a> {
    source: String,
    config: &'a AnalyzerConfig,
    info: &'a SpectrogramInfo,
    skipped_samples: u64,
    frames: &'a [Vec<f32>],
}

/// Decodes a WAV file and averages its channels down to mono.
fn read_wav_mono(path: &PathBuf) -> Result<(Vec<f32>, f32)> {
    let mut reader =
        hound::WavReader::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let spec = reader.spec();
    let channels = spec.channels.max(1) as usize;

    let interleaved: Vec<f32> = match (spec.bits_per_sample, spec.sample_format) {
        (32, hound::SampleFormat::Float) => reader.samples::<f32>().collect::<Result<_, _>>()?,
        (16, hound::SampleFormat::Int) => reader
            .samples::<i16>()
            .map(|s| s.map(|v| v as f32 / i16::MAX as f32))
            .collect::<Result<_, _>>()?,
        (24, hound::SampleFormat::Int) => reader
            .samples::<i32>()
            .map(|s| s.map(|v| v as f32 / 8_388_607.0))
            .collect::<Result<_, _>>()?,
        (32, hound::SampleFormat::Int) => reader
            .samples::<i32>()
            .map(|s| s.map(|v| v as f32 / i32::MAX as f32))
            .collect::<Result<_, _>>()?,
        (bits, format) => bail!(
            "unsupported WAV format: bits_per_sample={} sample_format={:?}",
            bits,
            format
        ),
    };

    let mono = interleaved
        .chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / channels as f32)
        .collect();
    Ok((mono, spec.sample_rate as f32))
}

#[cfg(feature = "gpu")]
fn open_device(force_cpu: bool) -> Arc<dyn ComputeDevice> {
    if force_cpu {
        return Arc::new(CpuDevice::new());
    }
    match cqt_analyzer::WgpuDevice::request() {
        Ok(device) => Arc::new(device),
        Err(err) => {
            warn!("GPU unavailable ({}), falling back to the CPU device", err);
            Arc::new(CpuDevice::new())
        }
    }
}

#[cfg(not(feature = "gpu"))]
fn open_device(force_cpu: bool) -> Arc<dyn ComputeDevice> {
    if !force_cpu {
        warn!("built without the gpu feature, using the CPU device");
    }
    Arc::new(CpuDevice::new())
}

fn dominant_bin(frame: &[f32]) -> Option<(usize, f32)> {
    frame
        .iter()
        .copied()
        .enumerate()
        .max_by(|a, b| a.1.total_cmp(&b.1))
}

fn print_filter_responses(transformer: &Transformer, points: usize) -> Result<()> {
    let decimator = transformer.accumulator().decimator();
    let nyquist = decimator.sample_rate() / 2.0;
    println!("\n=== BAND FILTER RESPONSES ===");
    if decimator.fallback_count() > 0 {
        println!("{} band(s) fell back to decimation factor 1", decimator.fallback_count());
    }
    for (index, band) in decimator.bands().iter().enumerate() {
        let response = decimator.filter_response(index, points, 20.0, nyquist)?;
        println!(
            "band {}: cutoff {:.1} Hz, factor {} (x{} total), {:.1} Hz out",
            index,
            band.cutoff,
            band.decimation_factor,
            band.cumulative_factor,
            band.effective_sample_rate
        );
        for ((freq, db), phase) in response
            .frequencies
            .iter()
            .zip(&response.magnitude_db)
            .zip(&response.phase_radians)
        {
            println!("  {:>9.1} Hz {:>8.2} dB {:>7.3} rad", freq, db, phase);
        }
    }
    Ok(())
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let options = Cli::parse();

    let mut config = match &options.config {
        Some(path) => AnalyzerConfig::load(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => AnalyzerConfig::default(),
    };

    let (samples, sample_rate) = read_wav_mono(&options.input)?;
    if (sample_rate - config.sample_rate).abs() > f32::EPSILON {
        info!(
            "using the file's sample rate {} Hz instead of {} Hz",
            sample_rate, config.sample_rate
        );
        config.sample_rate = sample_rate;
        config.f_max = config.f_max.min(sample_rate / 2.0 * 0.95);
    }

    let device = open_device(options.cpu);
    println!("=== CQT RENDER ===");
    println!("Input: {} ({} samples, {} Hz)", options.input.display(), samples.len(), sample_rate);
    println!("Device: {}", device.name());

    let mut transformer = Transformer::new(device, config.clone())?;
    let info = transformer.info();
    println!(
        "Bins: {} ({:.1}-{:.1} Hz), hop {} samples ({:.2} ms)",
        info.num_bins,
        info.frequencies.first().copied().unwrap_or_default(),
        info.frequencies.last().copied().unwrap_or_default(),
        info.hop_length,
        info.frame_duration() * 1000.0
    );

    let mut frames: Vec<Vec<f32>> = Vec::new();
    let mut offset = 0;
    for &len in CHUNK_PATTERN.iter().cycle() {
        if offset >= samples.len() {
            break;
        }
        let end = (offset + len).min(samples.len());
        let produced = transformer.add_samples(&samples[offset..end])?;
        if produced > 0 {
            frames.extend(transformer.read_recent_frames(produced)?);
        }
        offset = end;
    }
    let produced = transformer.flush()?;
    if produced > 0 {
        frames.extend(transformer.read_recent_frames(produced)?);
    }

    let position = transformer.position();
    if frames.len() as u64 != position.frames_written {
        warn!(
            "collected {} of {} frames; chunks produced more than the output ring holds",
            frames.len(),
            position.frames_written
        );
    }
    println!(
        "Frames: {} in {} tiles, {} samples skipped",
        position.frames_written,
        position.tiles_completed,
        transformer.skipped_samples()
    );

    println!("\n=== DOMINANT FREQUENCY ===");
    let stride = (frames.len() / SUMMARY_ROWS).max(1);
    for (index, frame) in frames.iter().enumerate().step_by(stride) {
        if let Some((bin, magnitude)) = dominant_bin(frame) {
            println!(
                "{:>8.3} s  {:>9.1} Hz  (bin {:>3}, magnitude {:.4})",
                index as f32 * info.frame_duration(),
                info.frequencies[bin],
                bin,
                magnitude
            );
        }
    }

    if let Some(points) = options.filter_response {
        print_filter_responses(&transformer, points)?;
    }

    if let Some(path) = &options.json {
        let file = File::create(path).with_context(|| format!("failed to create {}", path.display()))?;
        let rendering = Rendering {
            source: options.input.display().to_string(),
            config: &config,
            info: &info,
            skipped_samples: transformer.skipped_samples(),
            frames: &frames,
        };
        serde_json::to_writer(BufWriter::new(file), &rendering)?;
        println!("\nWrote {}", path.display());
    }

    transformer.destroy()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_cli_parses_all_options() {
        let cli = Cli::try_parse_from([
            "cqt_render",
            "tone.wav",
            "--config",
            "demos/analyzer.json",
            "--cpu",
            "--json",
            "out.json",
            "--filter-response",
            "16",
        ])
        .unwrap();
        assert_eq!(cli.input, PathBuf::from("tone.wav"));
        assert_eq!(cli.config, Some(PathBuf::from("demos/analyzer.json")));
        assert!(cli.cpu);
        assert_eq!(cli.json, Some(PathBuf::from("out.json")));
        assert_eq!(cli.filter_response, Some(16));
    }

    #[test]
    fn test_cli_rejects_bad_input() {
        assert!(Cli::try_parse_from(["cqt_render"]).is_err());
        assert!(Cli::try_parse_from(["cqt_render", "a.wav", "--filter-response", "many"]).is_err());
        assert!(Cli::try_parse_from(["cqt_render", "a.wav", "--bogus"]).is_err());
    }
}
