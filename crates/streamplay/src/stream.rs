//! Progressive HTTP download behind a blocking `Read`.
//!
//! [`StreamBuffer`] fills an in-memory buffer from the response body on a background
//! thread and hands bytes to the decoder as they arrive. Construction blocks until an
//! initial amount is buffered so playback does not start on an empty buffer. The filler
//! stops reading while the buffer sits at its memory ceiling and resumes once the
//! consumer drains it.

use std::collections::VecDeque;
use std::io::{self, Read, Seek, SeekFrom};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use streamplay_types::{AudioFormat, UnsupportedFormat};
use symphonia::core::io::MediaSource;

const KIB: usize = 1024;
const MIN_INITIAL_BYTES: usize = 64 * KIB;
const UNKNOWN_BITRATE_INITIAL_BYTES: usize = 512 * KIB;
const MIN_CHUNK_BYTES: usize = 4 * KIB;
const MAX_CHUNK_BYTES: usize = 256 * KIB;
const DEFAULT_CHUNK_BYTES: usize = 32 * KIB;
/// Cap on how much of an error response body is kept.
const ERROR_BODY_LIMIT: u64 = 64 * 1024;

/// Buffering knobs for a [`StreamBuffer`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BufferConfig {
    /// Explicit initial fill in KiB; `0` derives it from the bitrate.
    pub initial_buffer_kb: u32,
    /// Seconds of audio to buffer before playback when the bitrate is known.
    pub http_buffering_secs: u32,
    /// Memory ceiling for buffered bytes, in MiB.
    pub http_buffering_limit_mb: u32,
    /// Limit on connecting and on waiting for the response head.
    pub response_timeout: Duration,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            initial_buffer_kb: 0,
            http_buffering_secs: 5,
            http_buffering_limit_mb: 20,
            response_timeout: Duration::from_secs(10),
        }
    }
}

impl BufferConfig {
    fn limit_bytes(&self) -> usize {
        (self.http_buffering_limit_mb.max(1) as usize) * KIB * KIB
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    /// The request never produced a response.
    #[error("http request failed: {0}")]
    Request(String),
    #[error("http request error, status {status}: {body}")]
    Status { status: u16, body: String },
    /// The source ended before a single byte arrived.
    #[error("initial buffering failed, no data read: {0}")]
    Empty(String),
    /// The buffer was closed by its owner.
    #[error("stream closed")]
    Closed,
}

impl StreamError {
    /// True when `err` came from reading a closed [`StreamBuffer`].
    pub fn is_closed(err: &io::Error) -> bool {
        err.get_ref()
            .and_then(|e| e.downcast_ref::<StreamError>())
            .is_some_and(|e| matches!(e, StreamError::Closed))
    }
}

/// How the download ended.
#[derive(Clone, Debug)]
enum Terminal {
    End,
    Closed,
    Failed(io::ErrorKind, String),
}

impl Terminal {
    fn describe(&self) -> String {
        match self {
            Terminal::End => "end of stream".to_string(),
            Terminal::Closed => "closed".to_string(),
            Terminal::Failed(_, msg) => msg.clone(),
        }
    }
}

#[derive(Default)]
struct BufState {
    buf: VecDeque<u8>,
    written: u64,
    read: u64,
    terminal: Option<Terminal>,
}

struct Shared {
    state: Mutex<BufState>,
    cond: Condvar,
    cancel: AtomicBool,
}

impl Shared {
    fn finish(&self, outcome: Terminal) {
        let mut st = self.state.lock();
        if st.terminal.is_none() {
            st.terminal = Some(outcome);
        }
        drop(st);
        self.cond.notify_all();
    }

    fn close(&self) {
        if self.cancel.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut st = self.state.lock();
        if st.terminal.is_none() {
            st.terminal = Some(Terminal::Closed);
        }
        st.buf.clear();
        st.buf.shrink_to_fit();
        drop(st);
        self.cond.notify_all();
        tracing::debug!("stream download closed");
    }
}

/// Closes a [`StreamBuffer`] from another owner (e.g. after it was handed to a decoder).
#[derive(Clone)]
pub struct StreamHandle {
    shared: Arc<Shared>,
}

impl StreamHandle {
    pub fn close(&self) {
        self.shared.close();
    }

    pub fn is_closed(&self) -> bool {
        self.shared.cancel.load(Ordering::Acquire)
    }
}

pub struct StreamBuffer {
    shared: Arc<Shared>,
    bitrate: Option<u64>,
    content_length: Option<u64>,
    content_type: Option<String>,
}

impl StreamBuffer {
    /// GET `url` and buffer the body.
    ///
    /// `expected_duration_secs` is the track length used to estimate the bitrate.
    pub fn open(
        url: &str,
        headers: &[(String, String)],
        expected_duration_secs: u32,
        config: &BufferConfig,
    ) -> Result<Self, StreamError> {
        let mut request = ureq::get(url)
            .config()
            .http_status_as_error(false)
            .timeout_connect(Some(config.response_timeout))
            .timeout_recv_response(Some(config.response_timeout))
            .build();
        for (name, value) in headers {
            request = request.header(name.as_str(), value.as_str());
        }
        let resp = request
            .call()
            .map_err(|e| StreamError::Request(format!("{url}: {e}")))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp
                .into_body()
                .with_config()
                .limit(ERROR_BODY_LIMIT)
                .read_to_string()
                .unwrap_or_default();
            return Err(StreamError::Status {
                status: status.as_u16(),
                body: body.trim().to_string(),
            });
        }

        let header = |name: &str| {
            resp.headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(|v| v.trim().to_string())
        };
        let content_length = header("Content-Length").and_then(|v| v.parse::<u64>().ok());
        let content_type = header("Content-Type");
        tracing::debug!(url, ?content_length, ?content_type, "stream response");

        let (_, body) = resp.into_parts();
        Self::from_reader(
            body.into_reader(),
            content_length,
            content_type,
            expected_duration_secs,
            config,
        )
    }

    /// Buffer from any byte source. Blocks until the initial target is met.
    pub fn from_reader<R>(
        mut reader: R,
        content_length: Option<u64>,
        content_type: Option<String>,
        expected_duration_secs: u32,
        config: &BufferConfig,
    ) -> Result<Self, StreamError>
    where
        R: Read + Send + 'static,
    {
        let bitrate = estimate_bitrate(content_length, expected_duration_secs);
        if bitrate.is_none() {
            tracing::warn!(?content_length, expected_duration_secs, "could not estimate bitrate");
        }
        let target = initial_target(config, bitrate);
        let chunk = chunk_size(bitrate);
        let shared = Arc::new(Shared {
            state: Mutex::new(BufState::default()),
            cond: Condvar::new(),
            cancel: AtomicBool::new(false),
        });

        let mut scratch = vec![0u8; chunk];
        loop {
            if shared.state.lock().buf.len() >= target {
                tracing::debug!(target, "initial buffer filled");
                break;
            }
            match read_chunk(&mut reader, &mut scratch) {
                Ok(0) => {
                    shared.finish(Terminal::End);
                    break;
                }
                Ok(n) => append(&shared, &scratch[..n]),
                Err(e) => {
                    shared.finish(Terminal::Failed(e.kind(), e.to_string()));
                    break;
                }
            }
        }

        let (buffered, terminal) = {
            let st = shared.state.lock();
            (st.buf.len(), st.terminal.clone())
        };
        if let Some(terminal) = terminal {
            if buffered == 0 {
                return Err(StreamError::Empty(terminal.describe()));
            }
            if !matches!(terminal, Terminal::End) || buffered < target {
                tracing::warn!(buffered, target, "initial buffering stopped early: {}", terminal.describe());
            }
        } else {
            let filler = Filler {
                shared: shared.clone(),
                limit: config.limit_bytes(),
                scratch,
            };
            thread::Builder::new()
                .name("stream-fill".to_string())
                .spawn(move || filler.run(reader))
                .map_err(|e| StreamError::Request(format!("spawn stream filler: {e}")))?;
        }

        Ok(Self {
            shared,
            bitrate,
            content_length,
            content_type,
        })
    }

    /// Bytes buffered and not yet read.
    pub fn len(&self) -> usize {
        self.shared.state.lock().buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Buffered audio in whole seconds; `0` when the bitrate is unknown.
    pub fn seconds_buffered(&self) -> u64 {
        match self.bitrate {
            Some(rate) if rate > 0 => self.len() as u64 / rate,
            _ => 0,
        }
    }

    /// Estimated bytes per second.
    pub fn bitrate(&self) -> Option<u64> {
        self.bitrate
    }

    /// Format from the response `Content-Type`.
    pub fn format(&self) -> Result<AudioFormat, UnsupportedFormat> {
        match self.content_type.as_deref() {
            Some(mime) => AudioFormat::from_mime(mime),
            None => Err(UnsupportedFormat("missing content type".to_string())),
        }
    }

    /// The download ended and every byte was read.
    pub fn is_done(&self) -> bool {
        let st = self.shared.state.lock();
        st.terminal.is_some() && st.buf.is_empty()
    }

    pub fn handle(&self) -> StreamHandle {
        StreamHandle {
            shared: self.shared.clone(),
        }
    }

    /// Stop downloading and release the connection. Safe to call repeatedly.
    ///
    /// Readers wake immediately. A filler blocked on a stalled socket exits, dropping
    /// the connection, once its pending read returns.
    pub fn close(&self) {
        self.shared.close();
    }
}

impl Drop for StreamBuffer {
    fn drop(&mut self) {
        self.shared.close();
    }
}

impl Read for StreamBuffer {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        if out.is_empty() {
            return Ok(0);
        }
        let mut st = self.shared.state.lock();
        loop {
            if !st.buf.is_empty() {
                let n = st.buf.read(out)?;
                st.read += n as u64;
                debug_assert!(st.read <= st.written);
                drop(st);
                // The filler may be parked at the memory ceiling.
                self.shared.cond.notify_all();
                return Ok(n);
            }
            let Some(terminal) = st.terminal.as_ref() else {
                self.shared.cond.wait(&mut st);
                continue;
            };
            return match terminal {
                Terminal::End => Ok(0),
                Terminal::Closed => Err(io::Error::new(io::ErrorKind::BrokenPipe, StreamError::Closed)),
                Terminal::Failed(kind, msg) => Err(io::Error::new(*kind, msg.clone())),
            };
        }
    }
}

impl Seek for StreamBuffer {
    fn seek(&mut self, _pos: SeekFrom) -> io::Result<u64> {
        Err(io::Error::new(io::ErrorKind::Unsupported, "stream is not seekable"))
    }
}

impl MediaSource for StreamBuffer {
    fn is_seekable(&self) -> bool {
        false
    }

    fn byte_len(&self) -> Option<u64> {
        self.content_length
    }
}

struct Filler {
    shared: Arc<Shared>,
    limit: usize,
    scratch: Vec<u8>,
}

impl Filler {
    fn run<R: Read>(mut self, mut reader: R) {
        tracing::debug!(chunk = self.scratch.len(), limit = self.limit, "background buffering started");
        loop {
            {
                let mut st = self.shared.state.lock();
                while st.buf.len() >= self.limit && st.terminal.is_none() {
                    tracing::trace!(buffered = st.buf.len(), "buffer at ceiling");
                    self.shared.cond.wait(&mut st);
                }
                if st.terminal.is_some() {
                    break;
                }
            }
            let result = read_chunk(&mut reader, &mut self.scratch);
            if self.shared.cancel.load(Ordering::Acquire) {
                break;
            }
            match result {
                Ok(0) => {
                    self.shared.finish(Terminal::End);
                    break;
                }
                Ok(n) => append(&self.shared, &self.scratch[..n]),
                Err(e) => {
                    tracing::warn!("stream download failed: {e}");
                    self.shared.finish(Terminal::Failed(e.kind(), e.to_string()));
                    break;
                }
            }
        }
        tracing::debug!("background buffering finished");
    }
}

fn read_chunk<R: Read>(reader: &mut R, scratch: &mut [u8]) -> io::Result<usize> {
    loop {
        match reader.read(scratch) {
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            other => return other,
        }
    }
}

fn append(shared: &Shared, bytes: &[u8]) {
    let mut st = shared.state.lock();
    if st.terminal.is_some() {
        return;
    }
    st.buf.extend(bytes);
    st.written += bytes.len() as u64;
    drop(st);
    shared.cond.notify_all();
}

/// Bytes per second from the advertised length and the track duration.
pub fn estimate_bitrate(content_length: Option<u64>, duration_secs: u32) -> Option<u64> {
    match content_length {
        Some(len) if len > 0 && duration_secs > 0 => Some(len / u64::from(duration_secs)).filter(|r| *r > 0),
        _ => None,
    }
}

/// Bytes to buffer before the stream is handed out.
pub fn initial_target(config: &BufferConfig, bitrate: Option<u64>) -> usize {
    let target = if config.initial_buffer_kb > 0 {
        config.initial_buffer_kb as usize * KIB
    } else if let Some(rate) = bitrate {
        (rate as usize).saturating_mul(config.http_buffering_secs as usize)
    } else {
        UNKNOWN_BITRATE_INITIAL_BYTES
    };
    target.max(MIN_INITIAL_BYTES)
}

/// Read size for the filler: about one second of audio.
pub fn chunk_size(bitrate: Option<u64>) -> usize {
    match bitrate {
        Some(rate) => (rate as usize).clamp(MIN_CHUNK_BYTES, MAX_CHUNK_BYTES),
        None => DEFAULT_CHUNK_BYTES,
    }
}
