//! Settings file.
//!
//! Every section has defaults, so a minimal file only needs `server.stream_url`:
//!
//! ```toml
//! [server]
//! stream_url = "https://media.example/Audio/{id}/universal?static=true"
//! report_url = "https://media.example"
//!
//! [server.headers]
//! X-Emby-Token = "..."
//! ```

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use audio_player::volume::VolumeConfig;
use audio_player::{PlaybackConfig, RatePolicy};
use serde::Deserialize;

use crate::player::PlayerConfig;
use crate::stream::BufferConfig;

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct Settings {
    pub server: ServerSettings,
    pub buffer: BufferSettings,
    pub player: PlayerSettings,
    pub audio: AudioSettings,
}

/// Media server endpoints. `{id}` is replaced by the item id.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerSettings {
    pub stream_url: Option<String>,
    pub album_url: Option<String>,
    pub artist_url: Option<String>,
    /// Base URL for playback session reports.
    pub report_url: Option<String>,
    /// Headers sent with every request.
    pub headers: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct BufferSettings {
    /// Explicit initial fill in KiB (0 derives it from the bitrate).
    pub initial_buffer_kb: u32,
    pub http_buffering_secs: u32,
    pub http_buffering_limit_mb: u32,
    pub response_timeout_secs: u64,
}

impl Default for BufferSettings {
    fn default() -> Self {
        let d = BufferConfig::default();
        Self {
            initial_buffer_kb: d.initial_buffer_kb,
            http_buffering_secs: d.http_buffering_secs,
            http_buffering_limit_mb: d.http_buffering_limit_mb,
            response_timeout_secs: d.response_timeout.as_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct PlayerSettings {
    pub prefetch_threshold_secs: u64,
    pub report_interval_ms: u64,
    pub disable_playback_reporting: bool,
    pub retry_delay_ms: u64,
    /// Error substrings that earn a download one retry.
    pub transient_errors: Vec<String>,
}

impl Default for PlayerSettings {
    fn default() -> Self {
        let d = PlayerConfig::default();
        Self {
            prefetch_threshold_secs: d.prefetch_threshold.as_secs(),
            report_interval_ms: d.report_interval.as_millis() as u64,
            disable_playback_reporting: d.disable_reporting,
            retry_delay_ms: d.retry_delay.as_millis() as u64,
            transient_errors: d.transient_errors,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RateMode {
    #[default]
    Reopen,
    Resample,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct AudioSettings {
    /// Output device substring; default device when unset.
    pub device: Option<String>,
    pub device_buffer_ms: u32,
    pub buffer_seconds: f32,
    pub chunk_frames: usize,
    pub rate_policy: RateMode,
    pub volume_min_db: f32,
    pub volume_max_db: f32,
    pub volume_log_base: f32,
    /// Volume applied at startup, in percent.
    pub initial_volume: u8,
}

impl Default for AudioSettings {
    fn default() -> Self {
        let d = PlaybackConfig::default();
        Self {
            device: d.device,
            device_buffer_ms: d.device_buffer_ms,
            buffer_seconds: d.buffer_seconds,
            chunk_frames: d.chunk_frames,
            rate_policy: RateMode::Reopen,
            volume_min_db: d.volume.min_db,
            volume_max_db: d.volume.max_db,
            volume_log_base: d.volume.log_base,
            initial_volume: 50,
        }
    }
}

impl Settings {
    /// Load settings from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).with_context(|| format!("read config {:?}", path))?;
        Self::parse(&raw).with_context(|| format!("parse config {:?}", path))
    }

    pub fn parse(raw: &str) -> Result<Self> {
        Ok(toml::from_str::<Settings>(raw)?)
    }

    pub fn buffer_config(&self) -> BufferConfig {
        BufferConfig {
            initial_buffer_kb: self.buffer.initial_buffer_kb,
            http_buffering_secs: self.buffer.http_buffering_secs,
            http_buffering_limit_mb: self.buffer.http_buffering_limit_mb,
            response_timeout: Duration::from_secs(self.buffer.response_timeout_secs),
        }
    }

    pub fn player_config(&self) -> PlayerConfig {
        PlayerConfig {
            prefetch_threshold: Duration::from_secs(self.player.prefetch_threshold_secs),
            report_interval: Duration::from_millis(self.player.report_interval_ms),
            disable_reporting: self.player.disable_playback_reporting,
            retry_delay: Duration::from_millis(self.player.retry_delay_ms),
            transient_errors: self.player.transient_errors.clone(),
            ..PlayerConfig::default()
        }
    }

    pub fn playback_config(&self) -> PlaybackConfig {
        PlaybackConfig {
            chunk_frames: self.audio.chunk_frames,
            buffer_seconds: self.audio.buffer_seconds,
            device_buffer_ms: self.audio.device_buffer_ms,
            rate_policy: match self.audio.rate_policy {
                RateMode::Reopen => RatePolicy::Reopen,
                RateMode::Resample => RatePolicy::Resample,
            },
            volume: VolumeConfig {
                min_db: self.audio.volume_min_db,
                max_db: self.audio.volume_max_db,
                log_base: self.audio.volume_log_base,
            },
            device: self.audio.device.clone(),
        }
    }

    pub fn headers(&self) -> Vec<(String, String)> {
        self.server
            .headers
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_uses_defaults() {
        let settings = Settings::parse("").unwrap();
        assert_eq!(settings, Settings::default());
        assert_eq!(settings.buffer.http_buffering_secs, 5);
        assert_eq!(settings.buffer.http_buffering_limit_mb, 20);
        assert_eq!(settings.buffer_config().response_timeout, Duration::from_secs(10));
        assert_eq!(settings.player.report_interval_ms, 9_500);
        assert_eq!(settings.player.retry_delay_ms, 1_000);
        assert_eq!(settings.player.transient_errors, ["A task was canceled"]);
        assert_eq!(settings.player_config().prefetch_threshold, Duration::from_secs(5));
    }

    #[test]
    fn sections_override_defaults() {
        let settings = Settings::parse(
            r#"
            [server]
            stream_url = "http://media/Audio/{id}"

            [server.headers]
            X-Emby-Token = "abc"

            [buffer]
            initial_buffer_kb = 256

            [player]
            disable_playback_reporting = true

            [audio]
            rate_policy = "resample"
            volume_min_db = -30.0
            "#,
        )
        .unwrap();
        assert_eq!(settings.server.stream_url.as_deref(), Some("http://media/Audio/{id}"));
        assert_eq!(settings.headers(), [("X-Emby-Token".to_string(), "abc".to_string())]);
        assert_eq!(settings.buffer_config().initial_buffer_kb, 256);
        assert_eq!(settings.buffer_config().http_buffering_secs, 5);
        assert!(settings.player_config().disable_reporting);
        let playback = settings.playback_config();
        assert_eq!(playback.rate_policy, RatePolicy::Resample);
        assert_eq!(playback.volume.min_db, -30.0);
        assert_eq!(playback.volume.max_db, 0.0);
    }

    #[test]
    fn unknown_rate_policy_is_rejected() {
        let err = Settings::parse("[audio]\nrate_policy = \"bogus\"").unwrap_err();
        assert!(format!("{err:#}").contains("bogus"));
    }
}
