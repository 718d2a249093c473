use crate::volume::VolumeConfig;

/// How the device reacts when a track's native rate differs from the open output.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RatePolicy {
    /// Reopen the output at the track rate (falling back to resampling when the
    /// hardware cannot match it).
    #[default]
    Reopen,
    /// Keep the current output rate and resample every track to it.
    Resample,
}

/// Playback tuning parameters shared by decode/resample/output stages.
#[derive(Clone, Debug)]
pub struct PlaybackConfig {
    /// Decoder/resampler chunk size in frames.
    pub chunk_frames: usize,
    /// Target decode-ahead duration for the decoder queue.
    pub buffer_seconds: f32,
    /// Output buffer period in milliseconds.
    pub device_buffer_ms: u32,
    pub rate_policy: RatePolicy,
    /// Volume-to-attenuation mapping.
    pub volume: VolumeConfig,
    /// Output device substring (default device when unset).
    pub device: Option<String>,
}

impl Default for PlaybackConfig {
    /// Defaults tuned for low-risk playback across common devices.
    fn default() -> Self {
        Self {
            chunk_frames: 1024,
            buffer_seconds: 2.0,
            device_buffer_ms: 150,
            rate_policy: RatePolicy::Reopen,
            volume: VolumeConfig::default(),
            device: None,
        }
    }
}
