//! The player loop: ties the queue, the playback device and downloads together.
//!
//! One [`Task`] runs the decision loop. It reacts to track completion, finished
//! downloads and a periodic tick; user commands mutate the queue or the device directly
//! and leave follow-up work (fetching the new head) to the same paths. At most one
//! download is in flight, and at most one finished download is held back as the next
//! song for a gapless hand-off.

use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Result;
use audio_player::{NowPlaying, PlaybackDevice, TrackMedia};
use crossbeam_channel::{Receiver, Sender, select};
use parking_lot::Mutex;
use streamplay_types::{Album, Artist, AudioAction, AudioState, PlaybackStatus, Track};

use crate::media::MediaServer;
use crate::play_queue::{Direction, Queue};
use crate::report::{ReportDispatcher, ReportGate, Reporter, build_report};
use crate::task::{StopSignal, Task, TaskError};

const UNKNOWN_ALBUM: &str = "unknown album";
const UNKNOWN_ARTIST: &str = "unknown artist";

/// Player timing and policy.
#[derive(Clone, Debug)]
pub struct PlayerConfig {
    /// Start fetching the next track when less than this is left on the current one.
    pub prefetch_threshold: Duration,
    /// Status refresh period of the loop.
    pub tick_interval: Duration,
    /// Minimum spacing of time-update reports.
    pub report_interval: Duration,
    pub disable_reporting: bool,
    /// Pause before the single retry of a transient download failure.
    pub retry_delay: Duration,
    /// Error substrings treated as transient.
    pub transient_errors: Vec<String>,
}

impl Default for PlayerConfig {
    fn default() -> Self {
        Self {
            prefetch_threshold: Duration::from_secs(5),
            tick_interval: Duration::from_secs(1),
            report_interval: Duration::from_millis(9_500),
            disable_reporting: false,
            retry_delay: Duration::from_secs(1),
            transient_errors: vec!["A task was canceled".to_string()],
        }
    }
}

/// A fetched track ready for the device.
struct Downloaded {
    track: Track,
    album: Album,
    artist: Artist,
    media: TrackMedia,
}

impl Downloaded {
    fn discard(self) {
        tracing::debug!(track = %self.track.name, "discarding downloaded track");
        self.media.close();
    }
}

enum PlayerEvent {
    SongComplete,
    Downloaded(Box<Downloaded>),
}

#[derive(Default)]
struct PlayerState {
    downloading: bool,
    next_song: Option<Downloaded>,
    /// Action reported when the next track starts (Next/Previous after a skip).
    pending_action: Option<AudioAction>,
    /// Set once the loop has shut down; late downloads are closed, not delivered.
    shut_down: bool,
}

pub struct Player {
    inner: Arc<PlayerInner>,
    task: Task,
}

struct PlayerInner {
    device: PlaybackDevice,
    queue: Queue,
    server: Arc<dyn MediaServer>,
    config: PlayerConfig,
    events_tx: Sender<PlayerEvent>,
    events_rx: Receiver<PlayerEvent>,
    state: Mutex<PlayerState>,
    reports: Option<ReportDispatcher>,
    gate: Mutex<ReportGate>,
}

impl Player {
    /// Wire a player around `device`. Reporting is enabled when `reporter` is given and
    /// not disabled in `config`.
    pub fn new(
        device: PlaybackDevice,
        server: Arc<dyn MediaServer>,
        reporter: Option<Arc<dyn Reporter>>,
        config: PlayerConfig,
    ) -> Result<Self> {
        let reports = match reporter {
            Some(r) if !config.disable_reporting => Some(ReportDispatcher::spawn(r)?),
            _ => None,
        };
        let (events_tx, events_rx) = crossbeam_channel::unbounded();
        let inner = Arc::new(PlayerInner {
            device,
            queue: Queue::new(),
            server,
            gate: Mutex::new(ReportGate::new(config.report_interval, config.disable_reporting)),
            config,
            events_tx,
            events_rx,
            state: Mutex::new(PlayerState::default()),
            reports,
        });

        let weak = Arc::downgrade(&inner);
        let tx = inner.events_tx.clone();
        inner.device.set_completion_callback(move || {
            let _ = tx.send(PlayerEvent::SongComplete);
        });
        inner.device.add_status_callback(with_inner(&weak, |p, status: &PlaybackStatus| p.on_status(status)));
        inner
            .queue
            .add_queue_changed_callback(with_inner(&weak, |p, tracks: &[Track]| p.on_queue_changed(tracks)));

        let task = Task::new("player");
        let looped = inner.clone();
        task.set_loop(move |stop| looped.run(stop));
        Ok(Self { inner, task })
    }

    /// Start the player loop.
    pub fn start(&self) -> Result<(), TaskError> {
        self.task.start()
    }

    /// Stop playback and the loop.
    pub fn stop(&self) -> Result<(), TaskError> {
        self.task.stop()
    }

    pub fn is_running(&self) -> bool {
        self.task.is_running()
    }

    pub fn status(&self) -> PlaybackStatus {
        self.inner.device.status()
    }

    pub fn add_status_callback(&self, cb: impl Fn(&PlaybackStatus) + Send + Sync + 'static) {
        self.inner.device.add_status_callback(cb);
    }

    pub fn add_queue_changed_callback(&self, cb: impl Fn(&[Track]) + Send + Sync + 'static) {
        self.inner.queue.add_queue_changed_callback(cb);
    }

    pub fn set_history_changed_callback(&self, cb: impl Fn(&[Track]) + Send + Sync + 'static) {
        self.inner.queue.set_history_changed_callback(cb);
    }

    pub fn play_pause(&self) {
        self.inner.device.play_pause();
    }

    pub fn pause(&self) {
        self.inner.device.pause();
    }

    pub fn resume(&self) {
        self.inner.device.resume();
    }

    pub fn stop_media(&self) {
        self.inner.device.stop_media();
    }

    pub fn seek(&self, position_ms: u64) {
        self.inner.device.seek(position_ms);
    }

    pub fn set_volume(&self, percent: u8) {
        self.inner.device.set_volume(percent);
    }

    pub fn set_mute(&self, muted: bool) {
        self.inner.device.set_mute(muted);
    }

    pub fn toggle_mute(&self) {
        self.inner.device.toggle_mute();
    }

    /// Skip to the next queued track; needs at least two.
    pub fn next(&self) {
        let p = &self.inner;
        if p.queue.len() < 2 {
            tracing::debug!("next: nothing queued after current track");
            return;
        }
        p.skip(AudioAction::Next, || p.queue.song_complete());
    }

    /// Go back to the most recently played track.
    pub fn previous(&self) {
        let p = &self.inner;
        if p.queue.get_history(1).is_empty() {
            tracing::debug!("previous: history is empty");
            return;
        }
        p.skip(AudioAction::Previous, || p.queue.play_last_song());
    }

    pub fn set_shuffle(&self, enabled: bool) {
        self.inner.queue.set_shuffle(enabled);
        self.inner.device.set_shuffle(enabled);
    }

    pub fn add_songs(&self, tracks: &[Track]) {
        self.inner.queue.add_songs(tracks);
    }

    pub fn play_next(&self, tracks: &[Track]) {
        self.inner.queue.play_next(tracks);
    }

    pub fn remove_song(&self, index: usize) {
        self.inner.queue.remove_song(index);
    }

    /// Move a queued track; the playing head stays put.
    pub fn reorder(&self, index: usize, direction: Direction) -> bool {
        let playing = self.inner.device.state() == AudioState::Playing;
        self.inner.queue.reorder(index, direction, playing)
    }

    pub fn clear_queue(&self, include_head: bool) {
        self.inner.queue.clear_queue(include_head);
    }

    pub fn queue(&self) -> Vec<Track> {
        self.inner.queue.get_queue()
    }

    pub fn history(&self, n: usize) -> Vec<Track> {
        self.inner.queue.get_history(n)
    }
}

/// Adapt a callback on the player to one holding only a weak reference.
fn with_inner<A: ?Sized + 'static>(
    weak: &Weak<PlayerInner>,
    f: impl Fn(&Arc<PlayerInner>, &A) + Send + Sync + 'static,
) -> impl Fn(&A) + Send + Sync + 'static {
    let weak = weak.clone();
    move |arg| {
        if let Some(p) = weak.upgrade() {
            f(&p, arg);
        }
    }
}

impl PlayerInner {
    fn run(self: &Arc<Self>, stop: &StopSignal) {
        let ticker = crossbeam_channel::tick(self.config.tick_interval);
        self.state.lock().shut_down = false;
        tracing::info!("player loop started");
        loop {
            select! {
                recv(stop.receiver()) -> _ => {
                    self.shutdown();
                    break;
                }
                recv(self.events_rx) -> event => match event {
                    Ok(PlayerEvent::SongComplete) => self.on_song_complete(),
                    Ok(PlayerEvent::Downloaded(d)) => self.on_downloaded(*d),
                    Err(_) => break,
                },
                recv(ticker) -> _ => self.on_tick(),
            }
        }
        tracing::info!("player loop stopped");
    }

    fn shutdown(&self) {
        let next = {
            let mut st = self.state.lock();
            st.shut_down = true;
            st.next_song.take()
        };
        self.device.stop_media();
        if let Some(next) = next {
            next.discard();
        }
        for event in self.events_rx.try_iter() {
            if let PlayerEvent::Downloaded(d) = event {
                self.state.lock().downloading = false;
                d.discard();
            }
        }
    }

    fn on_song_complete(self: &Arc<Self>) {
        // A skip stopped the device after this track had already drained.
        if self.device.state() == AudioState::Stopped {
            tracing::debug!("ignoring completion of a stopped track");
            return;
        }
        self.queue.song_complete();
        let Some(head) = self.queue.get(0) else {
            tracing::info!("queue finished");
            self.device.stop_media();
            return;
        };

        let next = self.state.lock().next_song.take();
        match next {
            Some(next) if next.track.id == head.id => self.play(next),
            stale => {
                if let Some(stale) = stale {
                    stale.discard();
                }
                self.device.stop_media();
                self.download(0);
            }
        }
    }

    fn on_downloaded(self: &Arc<Self>, song: Downloaded) {
        self.state.lock().downloading = false;

        if self.device.state() == AudioState::Stopped {
            let is_head = self.queue.get(0).is_some_and(|t| t.id == song.track.id);
            if is_head {
                if let Some(stale) = self.state.lock().next_song.take() {
                    stale.discard();
                }
                self.play(song);
            } else {
                song.discard();
                self.download(0);
            }
            return;
        }

        let is_next = self.queue.get(1).is_some_and(|t| t.id == song.track.id);
        if is_next {
            tracing::debug!(track = %song.track.name, "next track ready");
            let previous = self.state.lock().next_song.replace(song);
            if let Some(previous) = previous {
                previous.discard();
            }
        } else {
            song.discard();
        }
    }

    fn on_tick(self: &Arc<Self>) {
        self.device.update_status();
        let status = self.device.status();
        if !status.is_playing() {
            return;
        }
        let Some(remaining) = status.remaining_ms() else {
            return;
        };
        let threshold = self.config.prefetch_threshold.as_millis() as u64;
        let idle = {
            let st = self.state.lock();
            !st.downloading && st.next_song.is_none()
        };
        if remaining < threshold && idle && self.queue.len() >= 2 {
            tracing::debug!(remaining_ms = remaining, "prefetching next track");
            self.download(1);
        }
    }

    fn on_queue_changed(self: &Arc<Self>, tracks: &[Track]) {
        if self.device.state() == AudioState::Stopped && !tracks.is_empty() {
            self.download(0);
        }
    }

    fn on_status(&self, status: &PlaybackStatus) {
        let Some(reports) = self.reports.as_ref() else {
            return;
        };
        if !self.gate.lock().admit(status, Instant::now()) {
            return;
        }
        reports.dispatch(build_report(status, &self.queue.get_queue()));
    }

    /// Stop, drop any prefetched track, then let `mutate` pick the new head.
    fn skip(self: &Arc<Self>, action: AudioAction, mutate: impl FnOnce()) {
        {
            let mut st = self.state.lock();
            st.pending_action = Some(action);
            if let Some(next) = st.next_song.take() {
                next.discard();
            }
        }
        self.device.stop_media();
        mutate();
        self.download(0);
    }

    fn play(&self, song: Downloaded) {
        let action = self.state.lock().pending_action.take().unwrap_or(AudioAction::Play);
        let now_playing = NowPlaying {
            track: song.track,
            album: Some(song.album),
            artist: Some(song.artist),
        };
        if let Err(e) = self.device.play_track(song.media, now_playing, action) {
            tracing::error!("play track: {e}");
        }
    }

    /// Fetch queue entry `index` on a worker thread unless a download is in flight.
    fn download(self: &Arc<Self>, index: usize) {
        let Some(track) = self.queue.get(index) else {
            return;
        };
        {
            let mut st = self.state.lock();
            if st.downloading {
                return;
            }
            st.downloading = true;
        }
        tracing::debug!(index, track = %track.name, "download track");
        let player = self.clone();
        let spawned = thread::Builder::new()
            .name("track-download".to_string())
            .spawn(move || {
                let song = player.fetch(track);
                // Delivery and shutdown are ordered by the state lock.
                let mut st = player.state.lock();
                match song {
                    Some(song) if !st.shut_down => {
                        let _ = player.events_tx.send(PlayerEvent::Downloaded(Box::new(song)));
                    }
                    Some(song) => {
                        st.downloading = false;
                        drop(st);
                        song.discard();
                    }
                    None => {
                        st.downloading = false;
                        st.pending_action = None;
                    }
                }
            });
        if let Err(e) = spawned {
            tracing::error!("spawn download thread: {e}");
            let mut st = self.state.lock();
            st.downloading = false;
            st.pending_action = None;
        }
    }

    fn fetch(&self, track: Track) -> Option<Downloaded> {
        let media = match self.server.stream(&track) {
            Ok(media) => media,
            Err(e) if self.is_transient(&e) => {
                tracing::warn!(track = %track.name, "download failed, retrying: {e:#}");
                thread::sleep(self.config.retry_delay);
                match self.server.stream(&track) {
                    Ok(media) => media,
                    Err(e) => {
                        tracing::error!(track = %track.name, "retry download: {e:#}");
                        return None;
                    }
                }
            }
            Err(e) => {
                tracing::error!(track = %track.name, "download track: {e:#}");
                return None;
            }
        };
        let (album, artist) = self.lookup_metadata(&track);
        Some(Downloaded {
            track,
            album,
            artist,
            media,
        })
    }

    fn is_transient(&self, err: &anyhow::Error) -> bool {
        let msg = format!("{err:#}");
        self.config.transient_errors.iter().any(|sig| msg.contains(sig.as_str()))
    }

    fn lookup_metadata(&self, track: &Track) -> (Album, Artist) {
        let album = self.server.album(&track.album_id).unwrap_or_else(|e| {
            tracing::warn!(album = %track.album_id, "album lookup failed: {e:#}");
            Album {
                id: track.album_id.clone(),
                name: UNKNOWN_ALBUM.to_string(),
                ..Album::default()
            }
        });
        let artist_id = if album.artist_id.is_empty() {
            track.album_artist_id.clone()
        } else {
            album.artist_id.clone()
        };
        let artist = self.server.artist(&artist_id).unwrap_or_else(|e| {
            tracing::warn!(artist = %artist_id, "artist lookup failed: {e:#}");
            Artist {
                id: artist_id.clone(),
                name: UNKNOWN_ARTIST.to_string(),
            }
        });
        (album, artist)
    }
}
