//! Error types for the spectrogram pipeline

use thiserror::Error;

/// Errors produced while building or driving the CQT pipeline.
#[derive(Debug, Error)]
pub enum AnalyzerError {
    /// A configuration value violates a construction-time constraint.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Block size must be a positive power of two.
    #[error("block size must be a positive power of two, got {0}")]
    BlockSizeNotPowerOfTwo(usize),

    /// Batch factor must be positive and divide the block size.
    #[error("batch factor {batch_factor} must be positive and divide block size {block_size}")]
    InvalidBatchFactor {
        block_size: usize,
        batch_factor: usize,
    },

    /// Block ring capacity must be positive.
    #[error("max blocks must be a positive integer, got {0}")]
    InvalidMaxBlocks(usize),

    /// Frequency range must satisfy 0 < f_min < f_max <= nyquist.
    #[error("frequency range {f_min}..{f_max} Hz is invalid for sample rate {sample_rate} Hz")]
    InvalidFrequencyRange {
        f_min: f32,
        f_max: f32,
        sample_rate: f32,
    },

    /// Backend failure (allocation, submission, mapping).
    #[error("compute device error: {0}")]
    Device(String),

    /// The device was lost; every device-resident resource is invalid.
    #[error("compute device lost: {0}")]
    DeviceLost(String),

    /// A handle was used after its resource was destroyed.
    #[error("unknown or destroyed device resource: {0}")]
    UnknownResource(String),

    /// A component was used before it was bound to its inputs.
    #[error("{0} is not configured")]
    NotConfigured(&'static str),

    /// A component was used after `destroy`.
    #[error("{0} has been destroyed")]
    Destroyed(&'static str),

    /// A requested range falls outside a fixed-capacity buffer.
    #[error("range {offset}..{end} exceeds capacity {capacity} of {what}")]
    OutOfRange {
        what: &'static str,
        offset: usize,
        end: usize,
        capacity: usize,
    },

    /// Reading a configuration file failed.
    #[error("config I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Parsing a configuration file failed.
    #[error("config parse error: {0}")]
    Parse(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, AnalyzerError>;
