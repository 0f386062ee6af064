use serde::Serialize;

/// Layout of the magnitude surface, for mapping texels to frequencies and time.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SpectrogramInfo {
    pub num_bins: usize,
    /// Center frequency of each bin, lowest first
    pub frequencies: Vec<f32>,
    /// Input samples between consecutive frames
    pub hop_length: usize,
    pub sample_rate: f32,
    /// Frames per texture tile
    pub time_slice_count: usize,
    pub texture_ring_size: usize,
    pub history_layers: usize,
}

impl SpectrogramInfo {
    /// Seconds between consecutive frames.
    pub fn frame_duration(&self) -> f32 {
        self.hop_length as f32 / self.sample_rate
    }
}

/// Write counters of the output rings.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RingPosition {
    /// Tile currently being filled
    pub tile: usize,
    /// Frames already written into that tile
    pub tile_fill: usize,
    pub tiles_completed: u64,
    /// History array layer mirroring the current tile
    pub history_layer: u32,
    pub frames_written: u64,
}
