use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// A single playable item as mapped from the catalog.
///
/// Tracks are immutable once built; the queue and the player only ever clone them.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Track {
    /// Catalog id used for streaming and reporting.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Track length in whole seconds.
    pub duration_secs: u32,
    /// Position within its disc.
    pub index: u32,
    /// Disc number.
    pub disc: u32,
    /// Album id (empty when unknown).
    pub album_id: String,
    /// Performing artist names.
    pub artists: Vec<String>,
    /// Album artist id (empty when unknown).
    pub album_artist_id: String,
    /// User marked this track as favorite.
    pub favorite: bool,
}

impl Track {
    /// Convenience constructor for the fields every caller needs.
    pub fn new(id: impl Into<String>, name: impl Into<String>, duration_secs: u32) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            duration_secs,
            ..Self::default()
        }
    }

    /// Track duration in milliseconds.
    pub fn duration_ms(&self) -> u64 {
        u64::from(self.duration_secs) * 1000
    }
}

/// Album metadata used to enrich playback status.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Album {
    pub id: String,
    pub name: String,
    /// Album artist id.
    pub artist_id: String,
    pub year: Option<u32>,
    pub image_url: Option<String>,
}

/// Artist metadata used to enrich playback status.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Artist {
    pub id: String,
    pub name: String,
}

/// Declared container/codec of a media stream.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AudioFormat {
    Mp3,
    Flac,
    Ogg,
    Wav,
}

/// Raised for MIME types or extensions the player cannot decode.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unsupported audio format: {0}")]
pub struct UnsupportedFormat(pub String);

impl AudioFormat {
    /// Map a `Content-Type` value to a format, ignoring parameters such as `; charset`.
    pub fn from_mime(mime: &str) -> Result<Self, UnsupportedFormat> {
        let essence = mime.split(';').next().unwrap_or(mime).trim().to_ascii_lowercase();
        match essence.as_str() {
            "audio/mpeg" | "audio/mp3" => Ok(Self::Mp3),
            "audio/flac" | "audio/x-flac" => Ok(Self::Flac),
            "audio/ogg" | "application/ogg" => Ok(Self::Ogg),
            "audio/wav" | "audio/x-wav" | "audio/wave" => Ok(Self::Wav),
            _ => Err(UnsupportedFormat(mime.to_string())),
        }
    }

    /// Map a file extension (with or without a leading dot).
    pub fn from_extension(ext: &str) -> Result<Self, UnsupportedFormat> {
        match ext.trim_start_matches('.').to_ascii_lowercase().as_str() {
            "mp3" => Ok(Self::Mp3),
            "flac" => Ok(Self::Flac),
            "ogg" | "oga" => Ok(Self::Ogg),
            "wav" | "wave" => Ok(Self::Wav),
            _ => Err(UnsupportedFormat(ext.to_string())),
        }
    }

    /// File extension used as a probe hint.
    pub fn extension(self) -> &'static str {
        match self {
            Self::Mp3 => "mp3",
            Self::Flac => "flac",
            Self::Ogg => "ogg",
            Self::Wav => "wav",
        }
    }

    pub fn mime(self) -> &'static str {
        match self {
            Self::Mp3 => "audio/mpeg",
            Self::Flac => "audio/flac",
            Self::Ogg => "audio/ogg",
            Self::Wav => "audio/wav",
        }
    }
}

impl FromStr for AudioFormat {
    type Err = UnsupportedFormat;

    /// Accepts either a MIME type or a bare extension.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.contains('/') {
            Self::from_mime(s)
        } else {
            Self::from_extension(s)
        }
    }
}

impl fmt::Display for AudioFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

/// Coarse playback state of the device.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AudioState {
    #[default]
    Stopped,
    Playing,
}

/// The call that produced a status snapshot.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AudioAction {
    #[default]
    TimeUpdate,
    Stop,
    Play,
    PlayPause,
    Next,
    Previous,
    Seek,
    SetVolume,
    ShuffleChanged,
}

/// Immutable snapshot of the playback device, fanned out to status listeners.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct PlaybackStatus {
    pub state: AudioState,
    /// Call that produced this snapshot.
    pub action: AudioAction,
    pub track: Option<Track>,
    pub album: Option<Album>,
    pub artist: Option<Artist>,
    /// Elapsed time of the current track in milliseconds.
    pub elapsed_ms: u64,
    /// User-facing volume in `0..=100`.
    pub volume: u8,
    pub muted: bool,
    pub paused: bool,
    pub shuffle: bool,
    /// Native sample rate of the current track (Hz).
    pub source_rate: Option<u32>,
    /// Sample rate actually written to the output (Hz).
    pub sample_rate: Option<u32>,
    /// Whether the current track is being resampled.
    pub resampling: Option<bool>,
}

impl PlaybackStatus {
    /// Milliseconds left on the current track, `None` when nothing is loaded.
    pub fn remaining_ms(&self) -> Option<u64> {
        self.track
            .as_ref()
            .map(|t| t.duration_ms().saturating_sub(self.elapsed_ms))
    }

    pub fn is_playing(&self) -> bool {
        self.state == AudioState::Playing
    }
}

/// Event kind sent to the remote reporting collaborator.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PlaybackEvent {
    Start,
    Stop,
    Pause,
    Unpause,
    AudioTrackChange,
    VolumeChange,
    TimeUpdate,
    ShuffleModeChange,
}

/// Progress payload for remote reporting.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ProgressReport {
    pub event: PlaybackEvent,
    /// Id of the current track (empty when idle).
    pub item_id: String,
    pub is_paused: bool,
    pub is_muted: bool,
    /// Duration of the current track in seconds.
    pub playlist_length: u32,
    /// Elapsed position in seconds.
    pub position_secs: u64,
    pub volume: u8,
    /// Ids of the queued tracks, head first.
    pub queue: Vec<String>,
    pub shuffle: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn audio_format_from_mime_accepts_parameters() {
        assert_eq!(AudioFormat::from_mime("audio/mpeg"), Ok(AudioFormat::Mp3));
        assert_eq!(
            AudioFormat::from_mime("audio/flac; charset=binary"),
            Ok(AudioFormat::Flac)
        );
        assert_eq!(AudioFormat::from_mime("AUDIO/OGG"), Ok(AudioFormat::Ogg));
        assert_eq!(AudioFormat::from_mime("audio/x-wav"), Ok(AudioFormat::Wav));
    }

    #[test]
    fn audio_format_rejects_unknown() {
        let err = AudioFormat::from_mime("audio/aac").unwrap_err();
        assert_eq!(err.to_string(), "unsupported audio format: audio/aac");
        assert!("opus".parse::<AudioFormat>().is_err());
    }

    #[test]
    fn audio_format_from_str_dispatches_on_slash() {
        assert_eq!(".FLAC".parse::<AudioFormat>(), Ok(AudioFormat::Flac));
        assert_eq!("audio/wav".parse::<AudioFormat>(), Ok(AudioFormat::Wav));
        assert_eq!(AudioFormat::Mp3.to_string(), "mp3");
    }

    #[test]
    fn remaining_ms_saturates() {
        let mut status = PlaybackStatus {
            track: Some(Track::new("a", "A", 10)),
            elapsed_ms: 4_000,
            ..PlaybackStatus::default()
        };
        assert_eq!(status.remaining_ms(), Some(6_000));
        status.elapsed_ms = 12_000;
        assert_eq!(status.remaining_ms(), Some(0));
        status.track = None;
        assert_eq!(status.remaining_ms(), None);
    }

    #[test]
    fn track_deserializes_with_missing_fields() {
        let track: Track =
            serde_json::from_str(r#"{"id":"t1","name":"One","duration_secs":61}"#).unwrap();
        assert_eq!(track.duration_ms(), 61_000);
        assert!(track.artists.is_empty());
        assert!(!track.favorite);
    }
}
