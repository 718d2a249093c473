//! The playback device: one active pipeline plus transport controls.
//!
//! State machine: Stopped → Playing → Paused → Playing → Stopped. Every mutating call
//! publishes a [`PlaybackStatus`] snapshot captured under the device lock; listeners run
//! after the lock is released. The device knows nothing about queues: when the active
//! pipeline drains it fires the single completion callback and leaves the next move to
//! its owner.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use streamplay_types::{Album, Artist, AudioAction, AudioState, PlaybackStatus, Track};

use crate::DeviceError;
use crate::config::{PlaybackConfig, RatePolicy};
use crate::decode::{TrackMedia, start_decode};
use crate::pipeline::{FeederParams, Pipeline};
use crate::sink::{AudioSink, SinkSpec};
use crate::status::{StatusState, elapsed_ms};
use crate::volume::VolumeControl;

type StatusCallback = Arc<dyn Fn(&PlaybackStatus) + Send + Sync>;
type CompletionCallback = Arc<dyn Fn() + Send + Sync>;

/// Metadata shown while a track plays.
#[derive(Clone, Debug, Default)]
pub struct NowPlaying {
    pub track: Track,
    pub album: Option<Album>,
    pub artist: Option<Artist>,
}

impl From<Track> for NowPlaying {
    fn from(track: Track) -> Self {
        Self {
            track,
            album: None,
            artist: None,
        }
    }
}

/// Cloneable handle to the playback device.
#[derive(Clone)]
pub struct PlaybackDevice {
    inner: Arc<DeviceInner>,
}

struct DeviceInner {
    sink: Arc<dyn AudioSink>,
    config: PlaybackConfig,
    volume: Arc<VolumeControl>,
    state: Mutex<DeviceState>,
    /// Serializes track transitions so two swaps never interleave.
    transition: Mutex<()>,
    listeners: Mutex<Vec<StatusCallback>>,
    on_complete: Mutex<Option<CompletionCallback>>,
}

#[derive(Default)]
struct DeviceState {
    status: StatusState,
    pipeline: Option<Pipeline>,
    next_pipeline_id: u64,
}

impl PlaybackDevice {
    /// Create a device writing to `sink`. Volume starts at 50%.
    pub fn new(sink: Arc<dyn AudioSink>, config: PlaybackConfig) -> Self {
        let volume = Arc::new(VolumeControl::new(config.volume.level(50)));
        Self {
            inner: Arc::new(DeviceInner {
                sink,
                config,
                volume,
                state: Mutex::new(DeviceState::default()),
                transition: Mutex::new(()),
                listeners: Mutex::new(Vec::new()),
                on_complete: Mutex::new(None),
            }),
        }
    }

    /// Register a listener for every status snapshot.
    pub fn add_status_callback(&self, cb: impl Fn(&PlaybackStatus) + Send + Sync + 'static) {
        self.inner.listeners.lock().push(Arc::new(cb));
    }

    /// Set the callback fired when the active track plays to its end.
    pub fn set_completion_callback(&self, cb: impl Fn() + Send + Sync + 'static) {
        *self.inner.on_complete.lock() = Some(Arc::new(cb));
    }

    /// Current snapshot without notifying listeners.
    pub fn status(&self) -> PlaybackStatus {
        self.inner.snapshot(&self.inner.state.lock())
    }

    pub fn state(&self) -> AudioState {
        self.inner.state.lock().status.state
    }

    /// Publish a time-update snapshot (driven by the owner's periodic tick).
    pub fn update_status(&self) {
        self.inner.mutate(|st| {
            st.status.action = AudioAction::TimeUpdate;
            true
        });
    }

    /// Decode `media` and make it the active track, replacing whatever was playing.
    ///
    /// The new pipeline is swapped in under the device lock; the previous one is closed
    /// after the swap. If the previous track had already drained, its queued tail keeps
    /// playing ahead of the new track. Playback resumes unpaused.
    pub fn play_track(
        &self,
        media: TrackMedia,
        now_playing: NowPlaying,
        action: AudioAction,
    ) -> Result<(), DeviceError> {
        let inner = &self.inner;
        let _transition = inner.transition.lock();

        let decoded = start_decode(media, inner.config.buffer_seconds)?;
        let pipeline_id;
        let old = {
            let mut st = inner.state.lock();
            st.next_pipeline_id += 1;
            pipeline_id = st.next_pipeline_id;
            let new = Pipeline::new(pipeline_id, decoded);
            let channels = new.channels();
            let source_rate = new.source_rate();
            let old = st.pipeline.replace(new);
            if let Some(old) = old.as_ref() {
                old.signal_cancel();
            }
            st.status.state = AudioState::Playing;
            st.status.action = action;
            st.status.paused = false;
            st.status.track = Some(now_playing.track.clone());
            st.status.album = now_playing.album;
            st.status.artist = now_playing.artist;
            st.status.source_rate = Some(source_rate);
            st.status.output_rate = None;
            tracing::info!(
                track = %now_playing.track.name,
                id = %now_playing.track.id,
                rate_hz = source_rate,
                channels,
                "play track"
            );
            old
        };

        if let Some(old) = old {
            let drained = old.is_finished();
            old.close();
            if !drained {
                inner.sink.clear();
            }
        }

        let started = self.start_pipeline(pipeline_id);
        if let Err(e) = &started {
            tracing::error!("output failed: {e}");
            let failed = {
                let mut st = inner.state.lock();
                st.status.clear_playback();
                st.status.action = AudioAction::Stop;
                st.pipeline.take()
            };
            if let Some(p) = failed {
                p.close();
            }
        }
        inner.publish();
        started
    }

    fn start_pipeline(&self, pipeline_id: u64) -> Result<(), DeviceError> {
        let inner = &self.inner;
        let (source_rate, channels) = {
            let st = inner.state.lock();
            match st.pipeline.as_ref() {
                Some(p) if p.id == pipeline_id => (p.source_rate(), p.channels()),
                _ => return Ok(()),
            }
        };

        let target_rate = match (inner.config.rate_policy, inner.sink.spec()) {
            (RatePolicy::Resample, Some(current)) => current.rate,
            _ => source_rate,
        };
        let spec: SinkSpec = inner.sink.open(target_rate, channels)?;
        if spec.channels != channels {
            return Err(DeviceError::Output(format!(
                "sink opened {} channels, track has {channels}",
                spec.channels
            )));
        }
        inner.sink.set_paused(false);

        let weak = Arc::downgrade(inner);
        let mut st = inner.state.lock();
        let Some(pipeline) = st.pipeline.as_mut().filter(|p| p.id == pipeline_id) else {
            return Ok(());
        };
        pipeline.start(FeederParams {
            sink: inner.sink.clone(),
            spec,
            volume: inner.volume.clone(),
            chunk_frames: inner.config.chunk_frames,
            on_finished: Box::new(move || DeviceInner::pipeline_finished(&weak, pipeline_id)),
        })?;
        st.status.output_rate = Some(spec.rate);
        Ok(())
    }

    /// Toggle pause. Works while stopped too; the flag applies to the next track.
    pub fn play_pause(&self) {
        self.inner.mutate(|st| {
            st.status.paused = !st.status.paused;
            st.status.action = AudioAction::PlayPause;
            tracing::info!(paused = st.status.paused, "play/pause");
            true
        });
        self.sync_sink_pause();
    }

    /// Pause; no-op when already paused.
    pub fn pause(&self) {
        let changed = self.inner.mutate(|st| {
            if st.status.paused {
                return false;
            }
            st.status.paused = true;
            st.status.action = AudioAction::PlayPause;
            tracing::info!("pause audio");
            true
        });
        if changed {
            self.sync_sink_pause();
        }
    }

    /// Continue after a pause; no-op when not paused.
    pub fn resume(&self) {
        let changed = self.inner.mutate(|st| {
            if !st.status.paused {
                return false;
            }
            st.status.paused = false;
            st.status.action = AudioAction::PlayPause;
            tracing::info!("continue audio");
            true
        });
        if changed {
            self.sync_sink_pause();
        }
    }

    fn sync_sink_pause(&self) {
        let paused = self.inner.state.lock().status.paused;
        self.inner.sink.set_paused(paused);
    }

    /// Stop playback and drop the active pipeline.
    ///
    /// A drained pipeline's queued tail is left to play out.
    pub fn stop_media(&self) {
        let _transition = self.inner.transition.lock();
        let old = {
            let mut st = self.inner.state.lock();
            st.status.clear_playback();
            st.status.action = AudioAction::Stop;
            let old = st.pipeline.take();
            if let Some(p) = old.as_ref() {
                p.signal_cancel();
            }
            old
        };
        if let Some(old) = old {
            let drained = old.is_finished();
            old.close();
            if !drained {
                self.inner.sink.clear();
            }
        }
        self.inner.sink.set_paused(false);
        tracing::info!("stop audio");
        self.inner.publish();
    }

    /// Set volume in percent; values above 100 are clamped.
    pub fn set_volume(&self, percent: u8) {
        let level = self.inner.config.volume.level(percent);
        tracing::debug!(percent = level.percent, db = level.db, silent = level.silent, "set volume");
        self.inner.mutate(|st| {
            self.inner.volume.set_level(level);
            st.status.action = AudioAction::SetVolume;
            true
        });
    }

    pub fn volume(&self) -> u8 {
        self.inner.volume.percent()
    }

    /// Mute or unmute without touching the pause state.
    pub fn set_mute(&self, muted: bool) {
        tracing::info!(muted, "set mute");
        self.inner.mutate(|st| {
            self.inner.volume.set_muted(muted);
            st.status.action = AudioAction::SetVolume;
            true
        });
    }

    pub fn toggle_mute(&self) {
        self.set_mute(!self.inner.volume.is_muted());
    }

    /// Record the queue's shuffle mode in status.
    pub fn set_shuffle(&self, enabled: bool) {
        self.inner.mutate(|st| {
            st.status.shuffle = enabled;
            st.status.action = AudioAction::ShuffleChanged;
            true
        });
    }

    /// Seeking is not supported; the call is logged and ignored.
    pub fn seek(&self, position_ms: u64) {
        tracing::warn!(position_ms, "seek is not implemented; ignoring");
    }
}

impl DeviceInner {
    /// Apply `f` under the lock and publish when it reports a change.
    fn mutate(&self, f: impl FnOnce(&mut DeviceState) -> bool) -> bool {
        let snapshot = {
            let mut st = self.state.lock();
            if !f(&mut st) {
                return false;
            }
            self.snapshot(&st)
        };
        self.notify(&snapshot);
        true
    }

    fn publish(&self) {
        let snapshot = self.snapshot(&self.state.lock());
        self.notify(&snapshot);
    }

    fn snapshot(&self, st: &DeviceState) -> PlaybackStatus {
        let elapsed = match st.pipeline.as_ref() {
            Some(p) if st.status.state == AudioState::Playing => match p.output_rate() {
                Some(rate) => {
                    let pending = if p.is_finished() { 0 } else { self.sink.pending_frames() };
                    elapsed_ms(p.frames_written(), pending, rate)
                }
                None => 0,
            },
            _ => 0,
        };
        st.status
            .snapshot(elapsed, self.volume.percent(), self.volume.is_muted())
    }

    fn notify(&self, snapshot: &PlaybackStatus) {
        let listeners: Vec<StatusCallback> = self.listeners.lock().clone();
        for cb in listeners {
            cb(snapshot);
        }
    }

    /// Called from the feeder thread after its last write.
    fn pipeline_finished(weak: &Weak<DeviceInner>, pipeline_id: u64) {
        let Some(inner) = weak.upgrade() else {
            return;
        };
        let current = inner
            .state
            .lock()
            .pipeline
            .as_ref()
            .is_some_and(|p| p.id == pipeline_id);
        if !current {
            return;
        }
        tracing::debug!(pipeline_id, "track complete");
        let cb = inner.on_complete.lock().clone();
        if let Some(cb) = cb {
            cb();
        }
    }
}
