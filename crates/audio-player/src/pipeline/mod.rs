//! Per-track playback pipeline: decoded queue → optional resample → volume → sink.
//!
//! A pipeline is created when a track starts, installed in the device, and then started
//! once the sink is open. The feeder thread reports end-of-stream through a one-shot
//! callback; cancelled pipelines never report.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};

use crate::DeviceError;
use crate::decode::DecodedStream;
use crate::queue::{PopStrategy, SampleQueue};
use crate::resample::StreamResampler;
use crate::sink::{AudioSink, SinkSpec};
use crate::volume::VolumeControl;

/// Inputs the feeder needs once the sink layout is known.
pub(crate) struct FeederParams {
    pub(crate) sink: Arc<dyn AudioSink>,
    pub(crate) spec: SinkSpec,
    pub(crate) volume: Arc<VolumeControl>,
    pub(crate) chunk_frames: usize,
    pub(crate) on_finished: Box<dyn FnOnce() + Send>,
}

pub(crate) struct Pipeline {
    pub(crate) id: u64,
    decoded: DecodedStream,
    cancel: Arc<AtomicBool>,
    finished: Arc<AtomicBool>,
    frames_written: Arc<AtomicU64>,
    output_rate: Option<u32>,
    feeder: Option<JoinHandle<()>>,
}

impl Pipeline {
    pub(crate) fn new(id: u64, decoded: DecodedStream) -> Self {
        Self {
            id,
            decoded,
            cancel: Arc::new(AtomicBool::new(false)),
            finished: Arc::new(AtomicBool::new(false)),
            frames_written: Arc::new(AtomicU64::new(0)),
            output_rate: None,
            feeder: None,
        }
    }

    pub(crate) fn source_rate(&self) -> u32 {
        self.decoded.spec.rate
    }

    pub(crate) fn channels(&self) -> usize {
        self.decoded.spec.channels.count()
    }

    /// Rate the feeder writes at, once started.
    pub(crate) fn output_rate(&self) -> Option<u32> {
        self.output_rate
    }

    /// Frames written to the sink at the output rate.
    pub(crate) fn frames_written(&self) -> u64 {
        self.frames_written.load(Ordering::Relaxed)
    }

    /// The feeder wrote its last frame.
    pub(crate) fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    /// Spawn the feeder thread. Resamples when the sink rate differs from the source.
    pub(crate) fn start(&mut self, params: FeederParams) -> Result<(), DeviceError> {
        let src_rate = self.source_rate();
        let channels = self.channels();
        let resampler = if params.spec.rate != src_rate {
            tracing::info!(from_hz = src_rate, to_hz = params.spec.rate, "resampling");
            Some(StreamResampler::new(
                src_rate,
                params.spec.rate,
                channels,
                params.chunk_frames,
            )?)
        } else {
            tracing::debug!(rate_hz = src_rate, "resample skipped");
            None
        };

        let feeder = Feeder {
            srcq: self.decoded.queue.clone(),
            resampler,
            cancel: self.cancel.clone(),
            finished: self.finished.clone(),
            frames_written: self.frames_written.clone(),
        };
        self.output_rate = Some(params.spec.rate);
        let join = thread::Builder::new()
            .name(format!("audio-feed-{}", self.id))
            .spawn(move || feeder.run(params))
            .map_err(|e| DeviceError::Output(format!("spawn feeder: {e}")))?;
        self.feeder = Some(join);
        Ok(())
    }

    /// Flag the feeder to stop at its next check. Safe under the device lock.
    pub(crate) fn signal_cancel(&self) {
        self.cancel.store(true, Ordering::Relaxed);
    }

    /// Stop decoding, release the input, and wait for the feeder.
    ///
    /// Must not be called with the device lock held; the feeder may be waiting on it.
    pub(crate) fn close(mut self) {
        self.signal_cancel();
        self.decoded.close();
        if let Some(join) = self.feeder.take() {
            if join.thread().id() != thread::current().id() {
                let _ = join.join();
            }
        }
    }
}

struct Feeder {
    srcq: Arc<SampleQueue>,
    resampler: Option<StreamResampler>,
    cancel: Arc<AtomicBool>,
    finished: Arc<AtomicBool>,
    frames_written: Arc<AtomicU64>,
}

impl Feeder {
    fn run(mut self, params: FeederParams) {
        let FeederParams {
            sink,
            spec,
            volume,
            chunk_frames,
            on_finished,
        } = params;

        while !self.cancelled() {
            let Some(chunk) = self.srcq.pop(PopStrategy::BlockingUpTo {
                max_frames: chunk_frames.max(1),
            }) else {
                break;
            };
            let out = match self.resampler.as_mut() {
                Some(rs) => match rs.process(&chunk) {
                    Ok(v) => v,
                    Err(e) => {
                        tracing::error!("feeder stopped: {e}");
                        break;
                    }
                },
                None => chunk,
            };
            if !self.write_all(&*sink, out, spec.channels, &volume) {
                return;
            }
        }

        if self.cancelled() {
            return;
        }
        if let Some(rs) = self.resampler.as_mut() {
            match rs.flush() {
                Ok(tail) => {
                    if !self.write_all(&*sink, tail, spec.channels, &volume) {
                        return;
                    }
                }
                Err(e) => tracing::warn!("resampler flush failed: {e}"),
            }
        }

        self.finished.store(true, Ordering::Release);
        tracing::debug!(frames = self.frames_written.load(Ordering::Relaxed), "pipeline drained");
        on_finished();
    }

    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }

    /// Returns `false` when cancelled mid-write.
    fn write_all(
        &self,
        sink: &dyn AudioSink,
        mut samples: Vec<f32>,
        channels: usize,
        volume: &VolumeControl,
    ) -> bool {
        volume.apply(&mut samples);
        let mut offset = 0;
        while offset + channels <= samples.len() {
            if self.cancelled() {
                return false;
            }
            let frames = sink.write(&samples[offset..]);
            self.frames_written.fetch_add(frames as u64, Ordering::Relaxed);
            offset += frames * channels;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::start_decode;
    use crate::sink::NullSink;
    use crate::testing;
    use crate::volume::VolumeConfig;
    use crossbeam_channel::RecvTimeoutError;
    use std::time::Duration;

    fn params(sink: Arc<NullSink>, spec: SinkSpec, done: crossbeam_channel::Sender<()>) -> FeederParams {
        FeederParams {
            sink,
            spec,
            volume: Arc::new(VolumeControl::new(VolumeConfig::default().level(100))),
            chunk_frames: 256,
            on_finished: Box::new(move || {
                let _ = done.send(());
            }),
        }
    }

    #[test]
    fn feeds_all_frames_and_reports_once() {
        let decoded = start_decode(testing::wav_media(8_000, 2, 4_000), 1.0).unwrap();
        let sink = Arc::new(NullSink::capturing());
        let spec = sink.open(8_000, 2).unwrap();
        let (tx, rx) = crossbeam_channel::unbounded();

        let mut p = Pipeline::new(1, decoded);
        p.start(params(sink.clone(), spec, tx)).unwrap();
        rx.recv_timeout(Duration::from_secs(5)).unwrap();

        assert!(p.is_finished());
        assert_eq!(p.frames_written(), 4_000);
        assert_eq!(sink.captured().len(), 8_000);
        p.close();
        assert_eq!(rx.recv_timeout(Duration::from_millis(50)), Err(RecvTimeoutError::Disconnected));
    }

    #[test]
    fn resamples_when_sink_rate_differs() {
        let decoded = start_decode(testing::wav_media(8_000, 1, 8_000), 1.0).unwrap();
        let sink = Arc::new(NullSink::new().with_fixed_rate(16_000));
        let spec = sink.open(8_000, 1).unwrap();
        let (tx, rx) = crossbeam_channel::unbounded();

        let mut p = Pipeline::new(2, decoded);
        p.start(params(sink.clone(), spec, tx)).unwrap();
        rx.recv_timeout(Duration::from_secs(10)).unwrap();

        assert_eq!(p.output_rate(), Some(16_000));
        let written = p.frames_written();
        assert!(written > 8_000 && written <= 17_000, "wrote {written}");
        p.close();
    }

    #[test]
    fn cancelled_pipeline_never_reports() {
        let decoded = start_decode(testing::wav_media(8_000, 1, 80_000), 1.0).unwrap();
        let sink = Arc::new(NullSink::realtime());
        let spec = sink.open(8_000, 1).unwrap();
        let (tx, rx) = crossbeam_channel::unbounded();

        let mut p = Pipeline::new(3, decoded);
        p.start(params(sink, spec, tx)).unwrap();
        std::thread::sleep(Duration::from_millis(30));
        p.close();
        assert_eq!(rx.recv_timeout(Duration::from_millis(100)), Err(RecvTimeoutError::Disconnected));
    }
}
