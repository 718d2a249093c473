//! Remote playback reporting.
//!
//! Status snapshots from the device become [`ProgressReport`]s. A [`ReportGate`] decides
//! which snapshots are worth sending, and a [`ReportDispatcher`] ships them from its own
//! thread so a slow server never stalls playback.

use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use crossbeam_channel::Sender;
use rand::Rng;
use rand::distr::Alphanumeric;
use serde::Serialize;
use std::sync::Arc;
use streamplay_types::{AudioAction, AudioState, PlaybackEvent, PlaybackStatus, ProgressReport, Track};

/// Position unit used by the session endpoints (100 ns).
const TICKS_PER_SECOND: u64 = 10_000_000;

/// Receives progress reports.
pub trait Reporter: Send + Sync {
    fn report_progress(&self, report: &ProgressReport) -> Result<()>;
}

/// Event reported for the action that produced `status`.
pub fn progress_event(status: &PlaybackStatus) -> PlaybackEvent {
    match status.action {
        AudioAction::Stop => PlaybackEvent::Stop,
        AudioAction::Play => PlaybackEvent::Start,
        AudioAction::Next | AudioAction::Previous => PlaybackEvent::AudioTrackChange,
        AudioAction::SetVolume => PlaybackEvent::VolumeChange,
        AudioAction::TimeUpdate => PlaybackEvent::TimeUpdate,
        AudioAction::PlayPause if status.paused => PlaybackEvent::Pause,
        AudioAction::PlayPause => PlaybackEvent::Unpause,
        AudioAction::ShuffleChanged => PlaybackEvent::ShuffleModeChange,
        other => {
            tracing::warn!(action = ?other, "no report event for action; sending time update");
            PlaybackEvent::TimeUpdate
        }
    }
}

/// Build the report for `status` with the current queue.
pub fn build_report(status: &PlaybackStatus, queue: &[Track]) -> ProgressReport {
    ProgressReport {
        event: progress_event(status),
        item_id: status.track.as_ref().map(|t| t.id.clone()).unwrap_or_default(),
        is_paused: status.paused,
        is_muted: status.muted,
        playlist_length: status.track.as_ref().map(|t| t.duration_secs).unwrap_or(0),
        position_secs: status.elapsed_ms / 1000,
        volume: status.volume,
        queue: queue.iter().map(|t| t.id.clone()).collect(),
        shuffle: status.shuffle,
    }
}

/// Filters status snapshots down to the ones worth reporting.
#[derive(Debug)]
pub struct ReportGate {
    interval: Duration,
    disabled: bool,
    last_sent: Option<Instant>,
}

impl ReportGate {
    pub fn new(interval: Duration, disabled: bool) -> Self {
        Self {
            interval,
            disabled,
            last_sent: None,
        }
    }

    /// Time updates are throttled to one per interval and dropped while stopped; every
    /// other action passes and restarts the interval.
    pub fn admit(&mut self, status: &PlaybackStatus, now: Instant) -> bool {
        if self.disabled {
            return false;
        }
        if status.action == AudioAction::TimeUpdate {
            let recent = self
                .last_sent
                .is_some_and(|at| now.saturating_duration_since(at) < self.interval);
            if recent || status.state == AudioState::Stopped {
                return false;
            }
        }
        self.last_sent = Some(now);
        true
    }
}

/// Sends reports on a background thread; failures are logged.
pub struct ReportDispatcher {
    tx: Sender<ProgressReport>,
}

impl ReportDispatcher {
    pub fn spawn(reporter: Arc<dyn Reporter>) -> Result<Self> {
        let (tx, rx) = crossbeam_channel::unbounded::<ProgressReport>();
        thread::Builder::new()
            .name("progress-report".to_string())
            .spawn(move || {
                for report in rx {
                    match reporter.report_progress(&report) {
                        Ok(()) => tracing::debug!(event = ?report.event, "progress reported"),
                        Err(e) => tracing::error!("report playback progress: {e:#}"),
                    }
                }
            })
            .context("spawn report thread")?;
        Ok(Self { tx })
    }

    /// Queue `report` without blocking.
    pub fn dispatch(&self, report: ProgressReport) {
        if self.tx.send(report).is_err() {
            tracing::warn!("report thread gone; dropping report");
        }
    }
}

/// Reporter for session endpoints under `base_url`.
///
/// `Start` posts to `/Sessions/Playing`, `Stop` to `/Sessions/Playing/Stopped`, and
/// everything else to `/Sessions/Playing/Progress`.
pub struct HttpReporter {
    base_url: String,
    headers: Vec<(String, String)>,
    session_id: String,
}

impl HttpReporter {
    pub fn new(base_url: impl Into<String>) -> Self {
        let session_id = rand::rng()
            .sample_iter(&Alphanumeric)
            .take(20)
            .map(char::from)
            .collect();
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            headers: Vec::new(),
            session_id,
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct QueueItem {
    id: String,
    playlist_item_id: String,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct SessionPayload<'a> {
    queueable_media_types: [&'static str; 1],
    can_seek: bool,
    item_id: &'a str,
    media_source_id: &'a str,
    position_ticks: u64,
    volume_level: u8,
    is_paused: bool,
    is_muted: bool,
    play_method: &'static str,
    play_session_id: &'a str,
    playlist_length: u64,
    queue: Vec<QueueItem>,
    shuffle_mode: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    event_name: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    played_to_completion: Option<bool>,
}

fn event_name(event: PlaybackEvent) -> &'static str {
    match event {
        PlaybackEvent::Start => "start",
        PlaybackEvent::Stop => "stop",
        PlaybackEvent::Pause => "pause",
        PlaybackEvent::Unpause => "unpause",
        PlaybackEvent::AudioTrackChange => "audiotrackchange",
        PlaybackEvent::VolumeChange => "volumechange",
        PlaybackEvent::TimeUpdate => "timeupdate",
        PlaybackEvent::ShuffleModeChange => "shufflemodechange",
    }
}

impl Reporter for HttpReporter {
    fn report_progress(&self, report: &ProgressReport) -> Result<()> {
        let (path, event, completed) = match report.event {
            PlaybackEvent::Start => ("/Sessions/Playing", None, None),
            PlaybackEvent::Stop => ("/Sessions/Playing/Stopped", None, Some(false)),
            other => ("/Sessions/Playing/Progress", Some(event_name(other)), None),
        };
        let payload = SessionPayload {
            queueable_media_types: ["Audio"],
            can_seek: false,
            item_id: &report.item_id,
            media_source_id: &report.item_id,
            position_ticks: report.position_secs * TICKS_PER_SECOND,
            volume_level: report.volume,
            is_paused: report.is_paused,
            is_muted: report.is_muted,
            play_method: "DirectPlay",
            play_session_id: &self.session_id,
            playlist_length: u64::from(report.playlist_length) * TICKS_PER_SECOND,
            queue: report
                .queue
                .iter()
                .enumerate()
                .map(|(i, id)| QueueItem {
                    id: id.clone(),
                    playlist_item_id: format!("playlistItem{i}"),
                })
                .collect(),
            shuffle_mode: if report.shuffle { "Shuffle" } else { "Sorted" },
            event_name: event,
            played_to_completion: completed,
        };

        let url = format!("{}{path}", self.base_url);
        let mut request = ureq::post(&url);
        for (name, value) in &self.headers {
            request = request.header(name.as_str(), value.as_str());
        }
        let resp = request
            .send_json(&payload)
            .with_context(|| format!("request {path}"))?;
        if !resp.status().is_success() {
            return Err(anyhow!("{path} failed with {}", resp.status()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{http_response, serve};
    use parking_lot::Mutex;

    fn status(action: AudioAction, state: AudioState) -> PlaybackStatus {
        PlaybackStatus {
            action,
            state,
            ..PlaybackStatus::default()
        }
    }

    #[test]
    fn actions_map_to_events() {
        let mut s = status(AudioAction::PlayPause, AudioState::Playing);
        s.paused = true;
        assert_eq!(progress_event(&s), PlaybackEvent::Pause);
        s.paused = false;
        assert_eq!(progress_event(&s), PlaybackEvent::Unpause);
        assert_eq!(progress_event(&status(AudioAction::Play, AudioState::Playing)), PlaybackEvent::Start);
        assert_eq!(progress_event(&status(AudioAction::Previous, AudioState::Playing)), PlaybackEvent::AudioTrackChange);
        assert_eq!(progress_event(&status(AudioAction::ShuffleChanged, AudioState::Stopped)), PlaybackEvent::ShuffleModeChange);
        assert_eq!(progress_event(&status(AudioAction::Seek, AudioState::Playing)), PlaybackEvent::TimeUpdate);
    }

    #[test]
    fn report_carries_track_and_queue() {
        let mut s = status(AudioAction::TimeUpdate, AudioState::Playing);
        s.track = Some(Track::new("a", "A", 200));
        s.elapsed_ms = 12_900;
        s.volume = 40;
        s.shuffle = true;
        let report = build_report(&s, &[Track::new("a", "A", 200), Track::new("b", "B", 3)]);
        assert_eq!(report.item_id, "a");
        assert_eq!(report.playlist_length, 200);
        assert_eq!(report.position_secs, 12);
        assert_eq!(report.queue, ["a", "b"]);
        assert!(report.shuffle);
    }

    #[test]
    fn gate_throttles_time_updates_only() {
        let mut gate = ReportGate::new(Duration::from_millis(9_500), false);
        let t0 = Instant::now();
        let tick = status(AudioAction::TimeUpdate, AudioState::Playing);
        assert!(gate.admit(&tick, t0));
        assert!(!gate.admit(&tick, t0 + Duration::from_secs(5)));
        assert!(gate.admit(&status(AudioAction::SetVolume, AudioState::Playing), t0 + Duration::from_secs(6)));
        assert!(!gate.admit(&tick, t0 + Duration::from_secs(12)));
        assert!(gate.admit(&tick, t0 + Duration::from_secs(16)));
    }

    #[test]
    fn gate_drops_time_updates_while_stopped() {
        let mut gate = ReportGate::new(Duration::from_millis(9_500), false);
        let now = Instant::now();
        assert!(!gate.admit(&status(AudioAction::TimeUpdate, AudioState::Stopped), now));
        assert!(gate.admit(&status(AudioAction::Stop, AudioState::Stopped), now));
    }

    #[test]
    fn disabled_gate_admits_nothing() {
        let mut gate = ReportGate::new(Duration::ZERO, true);
        assert!(!gate.admit(&status(AudioAction::Play, AudioState::Playing), Instant::now()));
    }

    struct Recording(Mutex<Vec<PlaybackEvent>>, Sender<()>);

    impl Reporter for Recording {
        fn report_progress(&self, report: &ProgressReport) -> Result<()> {
            self.0.lock().push(report.event);
            let _ = self.1.send(());
            Err(anyhow!("server unavailable"))
        }
    }

    #[test]
    fn dispatcher_survives_reporter_failures() {
        let (tx, rx) = crossbeam_channel::unbounded();
        let reporter = Arc::new(Recording(Mutex::new(Vec::new()), tx));
        let dispatcher = ReportDispatcher::spawn(reporter.clone()).unwrap();
        let s = status(AudioAction::Stop, AudioState::Stopped);
        dispatcher.dispatch(build_report(&s, &[]));
        dispatcher.dispatch(build_report(&s, &[]));
        for _ in 0..2 {
            rx.recv_timeout(Duration::from_secs(2)).unwrap();
        }
        assert_eq!(*reporter.0.lock(), [PlaybackEvent::Stop, PlaybackEvent::Stop]);
    }

    #[test]
    fn http_reporter_posts_to_event_endpoint() {
        let ok = || http_response("204 No Content", "text/plain", b"");
        let (base, requests) = serve(vec![ok(), ok()]);
        let reporter = HttpReporter::new(format!("{base}/")).with_header("X-Emby-Token", "t");

        let mut s = status(AudioAction::Play, AudioState::Playing);
        s.track = Some(Track::new("a", "A", 2));
        reporter.report_progress(&build_report(&s, &[Track::new("a", "A", 2)])).unwrap();
        s.action = AudioAction::TimeUpdate;
        s.elapsed_ms = 1_000;
        reporter.report_progress(&build_report(&s, &[])).unwrap();

        let start = requests.recv().unwrap();
        assert_eq!(start.request_line(), "POST /Sessions/Playing HTTP/1.1");
        assert_eq!(start.header("X-Emby-Token"), Some("t"));
        let body: serde_json::Value = serde_json::from_slice(&start.body).unwrap();
        assert_eq!(body["ItemId"], "a");
        assert_eq!(body["PlaylistLength"], 20_000_000);
        assert_eq!(body["Queue"][0]["PlaylistItemId"], "playlistItem0");
        assert_eq!(body["PlaySessionId"], reporter.session_id());

        let progress = requests.recv().unwrap();
        assert_eq!(progress.request_line(), "POST /Sessions/Playing/Progress HTTP/1.1");
        let body: serde_json::Value = serde_json::from_slice(&progress.body).unwrap();
        assert_eq!(body["EventName"], "timeupdate");
        assert_eq!(body["PositionTicks"], 10_000_000);
    }
}
