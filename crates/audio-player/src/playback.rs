//! CPAL output stage.
//!
//! [`CpalSink`] keeps the (non-`Send`) CPAL stream on a dedicated output thread. The
//! real-time callback:
//! - refills a small local buffer from the shared [`SampleQueue`] without blocking
//! - applies basic channel mapping (mono↔stereo, best-effort otherwise)
//! - converts `f32` samples to the device sample format
//! - outputs silence without draining while paused

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{Result, anyhow};
use cpal::traits::{DeviceTrait, StreamTrait};
use crossbeam_channel::Sender;
use parking_lot::Mutex;

use crate::DeviceError;
use crate::device;
use crate::queue::{PopStrategy, SampleQueue, calc_max_buffered_samples};
use crate::sink::{AudioSink, SinkSpec, WRITE_WAIT};

/// Max frames pulled from the queue per callback refill.
const REFILL_MAX_FRAMES: usize = 1024;
/// How long a layout change waits for queued audio to play out.
const DRAIN_BEFORE_REOPEN: Duration = Duration::from_secs(1);

/// Sink playing through a CPAL output device.
pub struct CpalSink {
    device_name: Option<String>,
    buffer_ms: u32,
    output: Mutex<Option<OutputHandle>>,
    paused: Arc<AtomicBool>,
    played: Arc<AtomicU64>,
}

struct OutputHandle {
    spec: SinkSpec,
    queue: Arc<SampleQueue>,
    stop_tx: Sender<()>,
    join: JoinHandle<()>,
}

impl OutputHandle {
    fn shutdown(self) {
        self.queue.close();
        let _ = self.stop_tx.send(());
        let _ = self.join.join();
    }
}

impl CpalSink {
    /// `device_name` selects by substring; `buffer_ms` sizes the output queue.
    pub fn new(device_name: Option<String>, buffer_ms: u32) -> Self {
        Self {
            device_name,
            buffer_ms,
            output: Mutex::new(None),
            paused: Arc::new(AtomicBool::new(false)),
            played: Arc::new(AtomicU64::new(0)),
        }
    }

    fn queue(&self) -> Option<Arc<SampleQueue>> {
        self.output.lock().as_ref().map(|o| o.queue.clone())
    }

    fn spawn_output(&self, rate: u32, channels: usize) -> Result<OutputHandle, DeviceError> {
        let (ready_tx, ready_rx) = crossbeam_channel::bounded(1);
        let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(1);
        let device_name = self.device_name.clone();
        let buffer_seconds = self.buffer_ms.max(20) as f32 / 1000.0;
        let paused = self.paused.clone();
        let played = self.played.clone();

        let join = std::thread::Builder::new()
            .name("audio-output".to_string())
            .spawn(move || {
                match open_stream(device_name.as_deref(), rate, channels, buffer_seconds, paused, played) {
                    Ok((stream, spec, queue)) => {
                        let _ = ready_tx.send(Ok((spec, queue)));
                        let _ = stop_rx.recv();
                        drop(stream);
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(format!("{e:#}")));
                    }
                }
            })
            .map_err(|e| DeviceError::Output(format!("spawn output thread: {e}")))?;

        match ready_rx.recv() {
            Ok(Ok((spec, queue))) => Ok(OutputHandle {
                spec,
                queue,
                stop_tx,
                join,
            }),
            Ok(Err(msg)) => {
                let _ = join.join();
                Err(DeviceError::Output(msg))
            }
            Err(_) => {
                let _ = join.join();
                Err(DeviceError::Output("output thread exited".to_string()))
            }
        }
    }
}

impl AudioSink for CpalSink {
    fn open(&self, rate: u32, channels: usize) -> Result<SinkSpec, DeviceError> {
        let mut output = self.output.lock();
        if let Some(current) = output.as_ref() {
            if current.spec.channels == channels && current.spec.rate == rate {
                return Ok(current.spec);
            }
            current.queue.wait_until_empty(DRAIN_BEFORE_REOPEN);
        }
        if let Some(old) = output.take() {
            old.shutdown();
        }
        let handle = self.spawn_output(rate, channels)?;
        let spec = handle.spec;
        *output = Some(handle);
        Ok(spec)
    }

    fn spec(&self) -> Option<SinkSpec> {
        self.output.lock().as_ref().map(|o| o.spec)
    }

    fn write(&self, samples: &[f32]) -> usize {
        match self.queue() {
            Some(q) => q.push_frames_timeout(samples, WRITE_WAIT),
            None => {
                std::thread::sleep(WRITE_WAIT);
                0
            }
        }
    }

    fn clear(&self) {
        if let Some(q) = self.queue() {
            q.clear();
        }
    }

    fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::Relaxed);
    }

    fn played_frames(&self) -> u64 {
        self.played.load(Ordering::Relaxed)
    }

    fn pending_frames(&self) -> usize {
        self.queue().map(|q| q.len_frames()).unwrap_or(0)
    }
}

impl Drop for CpalSink {
    fn drop(&mut self) {
        if let Some(handle) = self.output.get_mut().take() {
            handle.shutdown();
        }
    }
}

/// Open the device and start a stream fed from a fresh queue.
///
/// The queue carries `channels` interleaved channels at the rate the device accepted.
fn open_stream(
    device_name: Option<&str>,
    rate: u32,
    channels: usize,
    buffer_seconds: f32,
    paused: Arc<AtomicBool>,
    played: Arc<AtomicU64>,
) -> Result<(cpal::Stream, SinkSpec, Arc<SampleQueue>)> {
    let host = cpal::default_host();
    let device = device::pick_device(&host, device_name)?;
    let config = device::pick_output_config(&device, rate)?;
    let mut stream_config: cpal::StreamConfig = config.clone().into();
    if let Some(buf) = device::pick_buffer_size(&config) {
        stream_config.buffer_size = buf;
    }

    let actual_rate = stream_config.sample_rate;
    let queue = Arc::new(SampleQueue::new(
        channels,
        calc_max_buffered_samples(actual_rate, channels, buffer_seconds),
    ));
    tracing::info!(
        device = %device.description()?,
        requested_hz = rate,
        rate_hz = actual_rate,
        device_channels = stream_config.channels,
        buffer_size = ?stream_config.buffer_size,
        "output opened"
    );

    let stream = build_output_stream(
        &device,
        &stream_config,
        config.sample_format(),
        &queue,
        paused,
        played,
    )?;
    stream.play()?;

    Ok((
        stream,
        SinkSpec {
            rate: actual_rate,
            channels,
        },
        queue,
    ))
}

/// Build a CPAL output stream that plays audio from `queue`.
fn build_output_stream(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    sample_format: cpal::SampleFormat,
    queue: &Arc<SampleQueue>,
    paused: Arc<AtomicBool>,
    played: Arc<AtomicU64>,
) -> Result<cpal::Stream> {
    match sample_format {
        cpal::SampleFormat::F32 => build_stream::<f32>(device, config, queue, paused, played),
        cpal::SampleFormat::I16 => build_stream::<i16>(device, config, queue, paused, played),
        cpal::SampleFormat::I32 => build_stream::<i32>(device, config, queue, paused, played),
        cpal::SampleFormat::U16 => build_stream::<u16>(device, config, queue, paused, played),
        other => Err(anyhow!("Unsupported sample format: {other:?}")),
    }
}

fn build_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    queue: &Arc<SampleQueue>,
    paused: Arc<AtomicBool>,
    played: Arc<AtomicU64>,
) -> Result<cpal::Stream>
where
    T: cpal::Sample + cpal::SizedSample + cpal::FromSample<f32>,
{
    let channels_out = config.channels as usize;
    let queue_cb = queue.clone();
    let mut st = CallbackState {
        pos: 0,
        src_channels: queue.channels(),
        src: Vec::new(),
    };

    let err_fn = |err| tracing::warn!("stream error: {err}");

    let stream = device.build_output_stream(
        config,
        move |data: &mut [T], _| {
            let silence = <T as cpal::Sample>::from_sample::<f32>(0.0);
            if paused.load(Ordering::Relaxed) {
                data.fill(silence);
                return;
            }

            let frames = data.len() / channels_out;
            let mut filled_frames = 0u64;
            for frame in 0..frames {
                if st.pos >= st.src.len() {
                    st.pos = 0;
                    match queue_cb.pop(PopStrategy::NonBlocking {
                        max_frames: REFILL_MAX_FRAMES,
                    }) {
                        Some(v) => st.src = v,
                        None => {
                            st.src.clear();
                            data[frame * channels_out..].fill(silence);
                            break;
                        }
                    }
                }
                for ch in 0..channels_out {
                    let sample = next_sample_mapped(&mut st, channels_out, ch);
                    data[frame * channels_out + ch] = <T as cpal::Sample>::from_sample::<f32>(sample);
                }
                filled_frames += 1;
            }
            if filled_frames > 0 {
                played.fetch_add(filled_frames, Ordering::Relaxed);
            }
        },
        err_fn,
        None,
    )?;

    Ok(stream)
}

/// Local refill buffer owned by the callback.
struct CallbackState {
    pos: usize,
    src_channels: usize,
    src: Vec<f32>,
}

/// Read one output sample for `dst_ch`, applying a simple channel mapping.
///
/// - mono → stereo: duplicate channel 0
/// - stereo → mono: average L/R
/// - other layouts: clamp to available channels
///
/// `st.pos` advances once per destination frame (after the last channel).
fn next_sample_mapped(st: &mut CallbackState, dst_channels: usize, dst_ch: usize) -> f32 {
    if st.pos >= st.src.len() {
        return 0.0;
    }

    let frame_start = st.pos;
    let get_src = |ch: usize, st: &CallbackState| -> f32 {
        if ch < st.src_channels && frame_start + ch < st.src.len() {
            st.src[frame_start + ch]
        } else {
            0.0
        }
    };

    let out = match (st.src_channels, dst_channels) {
        (2, 1) => 0.5 * (get_src(0, st) + get_src(1, st)),
        (1, _) => get_src(0, st),
        _ => get_src(dst_ch.min(st.src_channels.saturating_sub(1)), st),
    };

    if dst_ch + 1 == dst_channels {
        st.pos += st.src_channels;
    }
    out
}
