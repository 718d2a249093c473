use streamplay_types::{Album, Artist, AudioAction, AudioState, PlaybackStatus, Track};

/// Mutable status fields kept under the device lock.
///
/// Progress and volume live elsewhere (pipeline counters, volume atomics) and are folded
/// in when a snapshot is taken.
#[derive(Debug, Default)]
pub(crate) struct StatusState {
    pub(crate) state: AudioState,
    pub(crate) action: AudioAction,
    pub(crate) track: Option<Track>,
    pub(crate) album: Option<Album>,
    pub(crate) artist: Option<Artist>,
    pub(crate) paused: bool,
    pub(crate) shuffle: bool,
    pub(crate) source_rate: Option<u32>,
    pub(crate) output_rate: Option<u32>,
}

impl StatusState {
    pub(crate) fn snapshot(&self, elapsed_ms: u64, volume: u8, muted: bool) -> PlaybackStatus {
        PlaybackStatus {
            state: self.state,
            action: self.action,
            track: self.track.clone(),
            album: self.album.clone(),
            artist: self.artist.clone(),
            elapsed_ms,
            volume,
            muted,
            paused: self.paused,
            shuffle: self.shuffle,
            source_rate: self.source_rate,
            sample_rate: self.output_rate,
            resampling: match (self.source_rate, self.output_rate) {
                (Some(src), Some(out)) => Some(src != out),
                _ => None,
            },
        }
    }

    /// Forget the current track after a stop.
    pub(crate) fn clear_playback(&mut self) {
        self.state = AudioState::Stopped;
        self.paused = false;
        self.source_rate = None;
        self.output_rate = None;
    }
}

/// Elapsed milliseconds from frames written minus frames still queued in the sink.
pub(crate) fn elapsed_ms(frames_written: u64, pending_frames: usize, rate_hz: u32) -> u64 {
    if rate_hz == 0 {
        return 0;
    }
    let played = frames_written.saturating_sub(pending_frames as u64);
    played.saturating_mul(1000) / u64::from(rate_hz)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn elapsed_ms_subtracts_pending_frames() {
        assert_eq!(elapsed_ms(96_000, 0, 48_000), 2_000);
        assert_eq!(elapsed_ms(96_000, 48_000, 48_000), 1_000);
        assert_eq!(elapsed_ms(100, 4_000, 48_000), 0);
        assert_eq!(elapsed_ms(100, 0, 0), 0);
    }

    #[test]
    fn snapshot_reports_resampling() {
        let state = StatusState {
            state: AudioState::Playing,
            source_rate: Some(44_100),
            output_rate: Some(48_000),
            ..StatusState::default()
        };
        let snap = state.snapshot(1_500, 40, true);
        assert_eq!(snap.resampling, Some(true));
        assert_eq!(snap.sample_rate, Some(48_000));
        assert_eq!(snap.elapsed_ms, 1_500);
        assert!(snap.muted);
    }

    #[test]
    fn clear_playback_keeps_track_and_shuffle() {
        let mut state = StatusState {
            state: AudioState::Playing,
            track: Some(Track::new("a", "A", 3)),
            paused: true,
            shuffle: true,
            output_rate: Some(48_000),
            ..StatusState::default()
        };
        state.clear_playback();
        assert_eq!(state.state, AudioState::Stopped);
        assert!(!state.paused);
        assert!(state.shuffle);
        assert!(state.track.is_some());
        assert!(state.output_rate.is_none());
    }
}
