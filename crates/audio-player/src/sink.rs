//! Output capability consumed by the playback device.
//!
//! A sink is opened at a rate/channel layout, accepts interleaved PCM with backpressure,
//! and reports how far playback has progressed. [`crate::playback::CpalSink`] drives a
//! real device; [`NullSink`] discards (or captures) samples for tests and headless runs.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::DeviceError;

/// Upper bound a `write` call may block waiting for room.
pub const WRITE_WAIT: Duration = Duration::from_millis(50);

/// Layout the sink accepts from `write`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SinkSpec {
    /// Rate the output actually runs at (Hz).
    pub rate: u32,
    /// Interleaved channel count expected by `write`.
    pub channels: usize,
}

pub trait AudioSink: Send + Sync {
    /// Open (or reuse) the output for `rate`/`channels`; returns what was actually opened.
    ///
    /// The returned rate may differ when the hardware cannot match the request.
    fn open(&self, rate: u32, channels: usize) -> Result<SinkSpec, DeviceError>;

    /// Current layout, `None` before the first `open`.
    fn spec(&self) -> Option<SinkSpec>;

    /// Write interleaved samples; blocks up to [`WRITE_WAIT`] for room.
    ///
    /// Returns the number of whole frames accepted, possibly zero.
    fn write(&self, samples: &[f32]) -> usize;

    /// Drop everything queued but not yet played.
    fn clear(&self);

    /// While paused the sink outputs silence and does not drain.
    fn set_paused(&self, paused: bool);

    /// Frames handed to the hardware since the sink was created.
    fn played_frames(&self) -> u64;

    /// Frames accepted by `write` but not yet played.
    fn pending_frames(&self) -> usize;
}

/// Sink that never touches hardware.
///
/// By default writes are accepted instantly. With [`NullSink::realtime`] they are paced
/// at the opened rate so elapsed-time logic behaves as it would on a device.
#[derive(Debug, Default)]
pub struct NullSink {
    spec: Mutex<Option<SinkSpec>>,
    fixed_rate: Option<u32>,
    realtime: bool,
    paused: AtomicBool,
    played: AtomicU64,
    opens: AtomicU64,
    capture: Option<Mutex<Vec<f32>>>,
}

impl NullSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pace writes at the opened sample rate.
    pub fn realtime() -> Self {
        Self {
            realtime: true,
            ..Self::default()
        }
    }

    /// Keep every written sample for inspection.
    pub fn capturing() -> Self {
        Self {
            capture: Some(Mutex::new(Vec::new())),
            ..Self::default()
        }
    }

    /// Always report `rate` from `open`, like hardware locked to one rate.
    pub fn with_fixed_rate(mut self, rate: u32) -> Self {
        self.fixed_rate = Some(rate);
        self
    }

    /// Samples written so far (empty unless built with [`NullSink::capturing`]).
    pub fn captured(&self) -> Vec<f32> {
        self.capture
            .as_ref()
            .map(|c| c.lock().clone())
            .unwrap_or_default()
    }

    /// How many times the output was (re)opened with a new layout.
    pub fn open_count(&self) -> u64 {
        self.opens.load(Ordering::Relaxed)
    }
}

impl AudioSink for NullSink {
    fn open(&self, rate: u32, channels: usize) -> Result<SinkSpec, DeviceError> {
        let wanted = SinkSpec {
            rate: self.fixed_rate.unwrap_or(rate),
            channels,
        };
        let mut spec = self.spec.lock();
        if *spec != Some(wanted) {
            self.opens.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(rate_hz = wanted.rate, channels, "null sink opened");
        }
        *spec = Some(wanted);
        Ok(wanted)
    }

    fn spec(&self) -> Option<SinkSpec> {
        *self.spec.lock()
    }

    fn write(&self, samples: &[f32]) -> usize {
        let Some(spec) = self.spec() else {
            return 0;
        };
        if self.paused.load(Ordering::Relaxed) {
            std::thread::sleep(Duration::from_millis(5));
            return 0;
        }
        let channels = spec.channels.max(1);
        let frames = samples.len() / channels;
        if frames == 0 {
            return 0;
        }
        if self.realtime {
            let wait = Duration::from_secs_f64(frames as f64 / spec.rate.max(1) as f64);
            let deadline = Instant::now() + wait.min(WRITE_WAIT);
            std::thread::sleep(deadline.saturating_duration_since(Instant::now()));
            let paced = if wait > WRITE_WAIT {
                (WRITE_WAIT.as_secs_f64() * spec.rate as f64) as usize
            } else {
                frames
            };
            let accepted = paced.clamp(1, frames);
            self.accept(&samples[..accepted * channels], accepted);
            return accepted;
        }
        self.accept(&samples[..frames * channels], frames);
        frames
    }

    fn clear(&self) {}

    fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::Relaxed);
    }

    fn played_frames(&self) -> u64 {
        self.played.load(Ordering::Relaxed)
    }

    fn pending_frames(&self) -> usize {
        0
    }
}

impl NullSink {
    fn accept(&self, samples: &[f32], frames: usize) {
        if let Some(capture) = &self.capture {
            capture.lock().extend_from_slice(samples);
        }
        self.played.fetch_add(frames as u64, Ordering::Relaxed);
    }
}
