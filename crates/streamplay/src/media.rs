//! Media server collaborator: where track bytes and metadata come from.

use anyhow::{Context, Result, anyhow};
use audio_player::TrackMedia;
use serde::de::DeserializeOwned;
use streamplay_types::{Album, Artist, AudioFormat, Track};

use crate::stream::{BufferConfig, StreamBuffer};

/// Source of playable bytes and catalog metadata for the player.
pub trait MediaServer: Send + Sync {
    /// Open a stream for `track`.
    fn stream(&self, track: &Track) -> Result<TrackMedia>;
    fn album(&self, id: &str) -> Result<Album>;
    fn artist(&self, id: &str) -> Result<Artist>;
}

/// Wrap a buffered download so closing the media also stops the download.
pub fn buffered_media(stream: StreamBuffer, format: AudioFormat) -> TrackMedia {
    let handle = stream.handle();
    TrackMedia::new(Box::new(stream), format).with_closer(move || handle.close())
}

/// HTTP-backed media server driven by URL templates.
///
/// `{id}` in a template is replaced by the track, album or artist id.
#[derive(Clone, Debug)]
pub struct HttpMediaServer {
    stream_url: String,
    album_url: Option<String>,
    artist_url: Option<String>,
    headers: Vec<(String, String)>,
    buffer: BufferConfig,
}

impl HttpMediaServer {
    pub fn new(stream_url: impl Into<String>, buffer: BufferConfig) -> Self {
        Self {
            stream_url: stream_url.into(),
            album_url: None,
            artist_url: None,
            headers: Vec::new(),
            buffer,
        }
    }

    pub fn with_album_url(mut self, template: impl Into<String>) -> Self {
        self.album_url = Some(template.into());
        self
    }

    pub fn with_artist_url(mut self, template: impl Into<String>) -> Self {
        self.artist_url = Some(template.into());
        self
    }

    /// Extra header sent with every request (auth tokens and the like).
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    fn get_json<T: DeserializeOwned>(&self, template: Option<&str>, id: &str, label: &str) -> Result<T> {
        let template = template.ok_or_else(|| anyhow!("{label} lookup not available"))?;
        let url = fill_template(template, id);
        let mut request = ureq::get(&url);
        for (name, value) in &self.headers {
            request = request.header(name.as_str(), value.as_str());
        }
        let mut resp = request.call().with_context(|| format!("request {label} {id}"))?;
        let body = resp
            .body_mut()
            .read_to_string()
            .with_context(|| format!("read {label} response body"))?;
        serde_json::from_str(&body).with_context(|| format!("decode {label} response"))
    }
}

impl MediaServer for HttpMediaServer {
    fn stream(&self, track: &Track) -> Result<TrackMedia> {
        let url = fill_template(&self.stream_url, &track.id);
        tracing::debug!(track = %track.name, url = %url, "open stream");
        let stream = StreamBuffer::open(&url, &self.headers, track.duration_secs, &self.buffer)
            .with_context(|| format!("stream {}", track.id))?;
        let format = match stream.format() {
            Ok(format) => format,
            Err(e) => match format_from_url(&url) {
                Some(format) => format,
                None => {
                    stream.close();
                    return Err(e).with_context(|| format!("stream {}", track.id));
                }
            },
        };
        tracing::info!(
            track = %track.name,
            format = %format,
            bitrate = ?stream.bitrate(),
            buffered = stream.len(),
            "stream ready"
        );
        Ok(buffered_media(stream, format))
    }

    fn album(&self, id: &str) -> Result<Album> {
        self.get_json(self.album_url.as_deref(), id, "album")
    }

    fn artist(&self, id: &str) -> Result<Artist> {
        self.get_json(self.artist_url.as_deref(), id, "artist")
    }
}

fn fill_template(template: &str, id: &str) -> String {
    template.replace("{id}", id)
}

/// Guess the format from the URL path's extension.
fn format_from_url(url: &str) -> Option<AudioFormat> {
    let path = url.split(['?', '#']).next()?;
    let (_, ext) = path.rsplit_once('.')?;
    if ext.contains('/') {
        return None;
    }
    AudioFormat::from_extension(ext).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{http_response, serve};
    use std::io::Cursor;

    #[test]
    fn stream_uses_template_headers_and_content_type() {
        let wav = audio_player::testing::wav_bytes(8_000, 1, 800);
        let (base, requests) = serve(vec![http_response("200 OK", "audio/wav", &wav)]);
        let server = HttpMediaServer::new(format!("{base}/Audio/{{id}}/stream"), BufferConfig::default())
            .with_header("X-Emby-Token", "secret");

        let media = server.stream(&Track::new("abc", "A", 1)).unwrap();
        assert_eq!(media.format(), AudioFormat::Wav);

        let req = requests.recv().unwrap();
        assert_eq!(req.request_line(), "GET /Audio/abc/stream HTTP/1.1");
        assert_eq!(req.header("X-Emby-Token"), Some("secret"));
        media.close();
    }

    #[test]
    fn unknown_content_type_falls_back_to_extension() {
        let (base, _) = serve(vec![http_response("200 OK", "application/octet-stream", &[1u8; 100])]);
        let server = HttpMediaServer::new(format!("{base}/files/{{id}}.flac"), BufferConfig::default());
        let media = server.stream(&Track::new("x", "X", 1)).unwrap();
        assert_eq!(media.format(), AudioFormat::Flac);
        media.close();
    }

    #[test]
    fn unsupported_format_is_an_error() {
        let (base, _) = serve(vec![http_response("200 OK", "video/mp4", &[1u8; 100])]);
        let server = HttpMediaServer::new(format!("{base}/Audio/{{id}}"), BufferConfig::default());
        let err = server.stream(&Track::new("x", "X", 1)).err().unwrap();
        assert!(format!("{err:#}").contains("unsupported audio format"));
    }

    #[test]
    fn server_error_message_reaches_caller() {
        let body = b"A task was canceled.";
        let (base, _) = serve(vec![http_response("500 Internal Server Error", "text/plain", body)]);
        let server = HttpMediaServer::new(format!("{base}/Audio/{{id}}"), BufferConfig::default());
        let err = server.stream(&Track::new("x", "X", 1)).err().unwrap();
        assert!(format!("{err:#}").contains("A task was canceled"));
    }

    #[test]
    fn album_lookup_decodes_json() {
        let json = br#"{"id":"al1","name":"Blue","artist_id":"ar1","year":1971}"#;
        let (base, _) = serve(vec![http_response("200 OK", "application/json", json)]);
        let server = HttpMediaServer::new(format!("{base}/s/{{id}}"), BufferConfig::default())
            .with_album_url(format!("{base}/Items/{{id}}"));
        let album = server.album("al1").unwrap();
        assert_eq!(album.name, "Blue");
        assert_eq!(album.year, Some(1971));
    }

    #[test]
    fn lookups_without_template_are_unavailable() {
        let server = HttpMediaServer::new("http://127.0.0.1:1/{id}", BufferConfig::default());
        assert!(server.artist("a").is_err());
        assert!(server.album("a").is_err());
    }

    #[test]
    fn buffered_media_close_stops_the_stream() {
        let stream =
            StreamBuffer::from_reader(Cursor::new(vec![0u8; 10]), None, None, 0, &BufferConfig::default()).unwrap();
        let handle = stream.handle();
        let media = buffered_media(stream, AudioFormat::Mp3);
        assert!(!handle.is_closed());
        media.close();
        assert!(handle.is_closed());
    }

    #[test]
    fn format_guess_from_url_path() {
        assert_eq!(format_from_url("http://h/a/b.mp3?x=1"), Some(AudioFormat::Mp3));
        assert_eq!(format_from_url("http://h.example/a"), None);
    }
}
