//! Playback device for streamed tracks.
//!
//! ## Pipeline
//! 1. **Decode**: a background thread uses Symphonia to decode the track into interleaved `f32`.
//! 2. **Feed**: a per-track thread resamples (Rubato) when the output rate differs, applies
//!    volume, and writes into the [`sink::AudioSink`].
//! 3. **Output**: the sink plays the samples (CPAL in production, [`sink::NullSink`] in tests).
//!
//! [`engine::PlaybackDevice`] owns the active pipeline and swaps it atomically when a new
//! track starts.

pub mod config;
pub mod decode;
pub mod device;
pub mod engine;
mod pipeline;
pub mod playback;
pub mod queue;
pub mod resample;
pub mod sink;
mod status;
pub mod volume;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use config::{PlaybackConfig, RatePolicy};
pub use decode::TrackMedia;
pub use engine::{NowPlaying, PlaybackDevice};
pub use sink::{AudioSink, NullSink, SinkSpec};

/// Errors surfaced by the playback device.
#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    /// Container probe or codec failure.
    #[error("decode: {0}")]
    Decode(#[from] symphonia::core::errors::Error),
    /// The stream probed but cannot be played (no track, unknown layout).
    #[error("unsupported stream: {0}")]
    Format(String),
    #[error("resampler: {0}")]
    Resample(String),
    /// Output device could not be opened or driven.
    #[error("output: {0}")]
    Output(String),
}
