//! Streaming audio decode stage.
//!
//! Uses Symphonia to:
//! - probe the input container/codec using the declared [`AudioFormat`] as a hint
//! - decode packets into interleaved `f32` samples
//! - push samples into a bounded [`SampleQueue`] from a background thread

use std::io;
use std::sync::Arc;
use std::thread;

use streamplay_types::AudioFormat;
use symphonia::core::audio::{SampleBuffer, SignalSpec};
use symphonia::core::codecs::{CodecParameters, DecoderOptions};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::{FormatOptions, FormatReader};
use symphonia::core::io::{MediaSource, MediaSourceStream};
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;

use crate::DeviceError;
use crate::queue::{SampleQueue, calc_max_buffered_samples};

type Closer = Box<dyn Fn() + Send + Sync>;

/// A playable byte stream plus its declared format.
///
/// The optional closer releases whatever feeds `source` (for example an HTTP
/// download) even while the decoder thread is blocked reading from it.
pub struct TrackMedia {
    source: Box<dyn MediaSource>,
    format: AudioFormat,
    closer: Option<Closer>,
}

impl TrackMedia {
    pub fn new(source: Box<dyn MediaSource>, format: AudioFormat) -> Self {
        Self {
            source,
            format,
            closer: None,
        }
    }

    pub fn with_closer(mut self, closer: impl Fn() + Send + Sync + 'static) -> Self {
        self.closer = Some(Box::new(closer));
        self
    }

    pub fn format(&self) -> AudioFormat {
        self.format
    }

    /// Release the underlying stream without decoding it.
    pub fn close(self) {
        if let Some(closer) = &self.closer {
            closer();
        }
    }

    fn into_parts(self) -> (Box<dyn MediaSource>, AudioFormat, Option<Closer>) {
        (self.source, self.format, self.closer)
    }
}

impl std::fmt::Debug for TrackMedia {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrackMedia")
            .field("format", &self.format)
            .field("closable", &self.closer.is_some())
            .finish()
    }
}

/// Metadata captured while probing the source.
#[derive(Clone, Debug, Default)]
pub struct SourceInfo {
    /// Codec name (best-effort).
    pub codec: Option<String>,
    /// Source bit depth (best-effort).
    pub bit_depth: Option<u16>,
    /// Total duration reported by the container.
    pub duration_ms: Option<u64>,
}

/// A running decoder: its output queue plus the handle that tears the input down.
pub(crate) struct DecodedStream {
    pub(crate) spec: SignalSpec,
    pub(crate) queue: Arc<SampleQueue>,
    pub(crate) info: SourceInfo,
    pub(crate) closer: Option<Closer>,
}

impl DecodedStream {
    /// Stop the decoder and release the input.
    pub(crate) fn close(&self) {
        self.queue.close();
        if let Some(closer) = &self.closer {
            closer();
        }
    }
}

/// Probe `media` and start a background decoder thread.
///
/// On probe failure the input is closed before the error is returned.
pub(crate) fn start_decode(media: TrackMedia, buffer_seconds: f32) -> Result<DecodedStream, DeviceError> {
    let (source, format, closer) = media.into_parts();
    match probe(source, format) {
        Ok((reader, params, spec)) => {
            let channels = spec.channels.count();
            let max_buffered_samples = calc_max_buffered_samples(spec.rate, channels, buffer_seconds);
            let queue = Arc::new(SampleQueue::new(channels, max_buffered_samples));
            let info = SourceInfo {
                codec: codec_name_from_params(&params),
                bit_depth: params
                    .bits_per_sample
                    .or(params.bits_per_coded_sample)
                    .and_then(|v| u16::try_from(v).ok()),
                duration_ms: duration_ms_from_codec_params(&params),
            };

            let queue_for_thread = queue.clone();
            thread::Builder::new()
                .name("audio-decode".to_string())
                .spawn(move || {
                    if let Err(e) = decode_format_loop(reader, params, &queue_for_thread) {
                        tracing::error!("decoder thread error: {e}");
                    }
                    queue_for_thread.close();
                })
                .map_err(|e| DeviceError::Output(format!("spawn decoder: {e}")))?;

            tracing::debug!(
                format = %format,
                rate_hz = spec.rate,
                channels,
                codec = info.codec.as_deref().unwrap_or("unknown"),
                "decoder started"
            );
            Ok(DecodedStream {
                spec,
                queue,
                info,
                closer,
            })
        }
        Err(e) => {
            if let Some(closer) = &closer {
                closer();
            }
            Err(e)
        }
    }
}

fn probe(
    source: Box<dyn MediaSource>,
    format: AudioFormat,
) -> Result<(Box<dyn FormatReader>, CodecParameters, SignalSpec), DeviceError> {
    let mut hint = Hint::new();
    hint.with_extension(format.extension());
    hint.mime_type(format.mime());

    let mss = MediaSourceStream::new(source, Default::default());
    let probed = symphonia::default::get_probe().format(
        &hint,
        mss,
        &FormatOptions::default(),
        &MetadataOptions::default(),
    )?;

    let reader = probed.format;
    let track = reader
        .default_track()
        .ok_or_else(|| DeviceError::Format("no default audio track".to_string()))?;
    let params = track.codec_params.clone();
    let channels = params
        .channels
        .ok_or_else(|| DeviceError::Format("unknown channel layout".to_string()))?;
    let rate = params
        .sample_rate
        .ok_or_else(|| DeviceError::Format("unknown sample rate".to_string()))?;

    Ok((reader, params, SignalSpec::new(rate, channels)))
}

/// Decode packets and push interleaved `f32` into `shared` until EOF or close.
fn decode_format_loop(
    mut format: Box<dyn FormatReader>,
    codec_params: CodecParameters,
    shared: &SampleQueue,
) -> Result<(), DeviceError> {
    let mut decoder =
        symphonia::default::get_codecs().make(&codec_params, &DecoderOptions::default())?;

    loop {
        if shared.is_done() {
            break;
        }
        let packet = match format.next_packet() {
            Ok(p) => p,
            Err(SymphoniaError::IoError(e)) if e.kind() == io::ErrorKind::UnexpectedEof => break,
            Err(e) => {
                tracing::warn!("decoder stopped early: {e}");
                break;
            }
        };

        let decoded = match decoder.decode(&packet) {
            Ok(d) => d,
            Err(SymphoniaError::DecodeError(e)) => {
                tracing::debug!("skipping corrupt packet: {e}");
                continue;
            }
            Err(e) => return Err(e.into()),
        };

        let mut sample_buf = SampleBuffer::<f32>::new(decoded.frames() as u64, *decoded.spec());
        sample_buf.copy_interleaved_ref(decoded);

        shared.push_interleaved_blocking(sample_buf.samples());
    }

    Ok(())
}

/// Best-effort duration in milliseconds from codec metadata.
fn duration_ms_from_codec_params(codec_params: &CodecParameters) -> Option<u64> {
    let frames = codec_params.n_frames?;
    let rate = codec_params.sample_rate? as u64;
    if rate == 0 {
        return None;
    }
    Some(frames.saturating_mul(1000) / rate)
}

/// Best-effort codec label used for logs.
fn codec_name_from_params(params: &CodecParameters) -> Option<String> {
    use symphonia::core::codecs::*;
    let name = match params.codec {
        CODEC_TYPE_FLAC => "FLAC",
        CODEC_TYPE_MP3 => "MP3",
        CODEC_TYPE_VORBIS => "VORBIS",
        CODEC_TYPE_OPUS => "OPUS",
        CODEC_TYPE_PCM_S16LE | CODEC_TYPE_PCM_S16BE => "PCM_S16",
        CODEC_TYPE_PCM_S24LE | CODEC_TYPE_PCM_S24BE => "PCM_S24",
        CODEC_TYPE_PCM_S32LE | CODEC_TYPE_PCM_S32BE => "PCM_S32",
        CODEC_TYPE_PCM_F32LE | CODEC_TYPE_PCM_F32BE => "PCM_F32",
        _ => return None,
    };
    Some(name.to_string())
}
