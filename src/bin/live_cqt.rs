#![cfg(feature = "native-host")]

#[path = "live_cqt/cpal_input.rs"]
mod cpal_input;

use std::path::PathBuf;
use std::sync::mpsc::{self, Receiver};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::Parser;
use cpal_input::AudioInput;
use cqt_analyzer::{AnalyzerConfig, ComputeDevice, CpuDevice, Transformer};
use log::warn;

// Pending input chunks before the callback starts dropping them
const CHANNEL_CAPACITY: usize = 64;
const REPORT_INTERVAL: Duration = Duration::from_secs(1);

#[cfg(feature = "gpu")]
fn open_device() -> Arc<dyn ComputeDevice> {
    match cqt_analyzer::WgpuDevice::request() {
        Ok(device) => Arc::new(device),
        Err(err) => {
            warn!("GPU unavailable ({}), falling back to the CPU device", err);
            Arc::new(CpuDevice::new())
        }
    }
}

#[cfg(not(feature = "gpu"))]
fn open_device() -> Arc<dyn ComputeDevice> {
    warn!("built without the gpu feature, using the CPU device");
    Arc::new(CpuDevice::new())
}

/// Live constant-Q analysis of an input device
#[derive(Parser, Debug)]
#[command(name = "live_cqt")]
#[command(about = "Analyze a capture device in real time and print level and pitch")]
struct Cli {
    /// Input device name; the host default when omitted
    device: Option<String>,

    /// JSON analyzer configuration (camelCase keys)
    #[arg(long)]
    config: Option<PathBuf>,
}

/// Feeds captured chunks through the analyzer and prints level and pitch once per second.
fn analyze(receiver: Receiver<Vec<f32>>, mut transformer: Transformer) -> anyhow::Result<()> {
    let info = transformer.info();
    let mut last_report = Instant::now();
    let mut sum_squares = 0.0f64;
    let mut counted = 0usize;

    for chunk in receiver {
        sum_squares += chunk.iter().map(|&s| (s as f64) * (s as f64)).sum::<f64>();
        counted += chunk.len();
        transformer.add_samples(&chunk)?;

        if last_report.elapsed() < REPORT_INTERVAL {
            continue;
        }
        last_report = Instant::now();

        let rms = if counted > 0 {
            (sum_squares / counted as f64).sqrt() as f32
        } else {
            0.0
        };
        let level_db = 20.0 * rms.max(1e-9).log10();
        sum_squares = 0.0;
        counted = 0;

        let dominant = transformer
            .read_recent_frames(1)?
            .first()
            .and_then(|frame| {
                frame
                    .iter()
                    .copied()
                    .enumerate()
                    .max_by(|a, b| a.1.total_cmp(&b.1))
            });
        match dominant {
            Some((bin, magnitude)) => println!(
                "level {:>7.1} dBFS | peak bin {:>3} {:>8.1} Hz (magnitude {:.4})",
                level_db, bin, info.frequencies[bin], magnitude
            ),
            None => println!("level {:>7.1} dBFS | warming up", level_db),
        }
    }

    transformer.destroy()?;
    Ok(())
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    println!("=== AVAILABLE INPUT DEVICES ===");
    for input in AudioInput::list_inputs() {
        let marker = if input.is_default { " (default)" } else { "" };
        println!("  - [{}] {}{}", input.host.name(), input.name, marker);
    }
    println!();

    let (sender, receiver) = mpsc::sync_channel(CHANNEL_CAPACITY);
    let input = AudioInput::open(cli.device.as_deref(), sender)?;

    let mut config = match &cli.config {
        Some(path) => AnalyzerConfig::load(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => AnalyzerConfig::default(),
    };
    config.sample_rate = input.config().sample_rate;
    config.f_max = config.f_max.min(config.sample_rate / 2.0 * 0.95);

    let device = open_device();
    let transformer = Transformer::new(device.clone(), config)?;
    println!(
        "Analyzing '{}' on {} ({} channels) with {}",
        input.config().device_name,
        input.config().host_name,
        input.config().channels,
        device.name()
    );
    println!("   Press Ctrl+C to stop\n");

    let analysis = thread::spawn(move || analyze(receiver, transformer));
    match analysis.join() {
        Ok(result) => result,
        Err(_) => anyhow::bail!("analysis thread panicked"),
    }
}
