//! In-memory WAV fixtures for tests.

use std::io::Cursor;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use streamplay_types::AudioFormat;

use crate::decode::TrackMedia;

/// Build a 16-bit PCM WAV file holding a quiet square wave.
pub fn wav_bytes(rate: u32, channels: u16, frames: u32) -> Vec<u8> {
    let block_align = channels * 2;
    let data_len = frames * u32::from(block_align);
    let mut out = Vec::with_capacity(44 + data_len as usize);
    out.extend_from_slice(b"RIFF");
    out.extend_from_slice(&(36 + data_len).to_le_bytes());
    out.extend_from_slice(b"WAVE");
    out.extend_from_slice(b"fmt ");
    out.extend_from_slice(&16u32.to_le_bytes());
    out.extend_from_slice(&1u16.to_le_bytes());
    out.extend_from_slice(&channels.to_le_bytes());
    out.extend_from_slice(&rate.to_le_bytes());
    out.extend_from_slice(&(rate * u32::from(block_align)).to_le_bytes());
    out.extend_from_slice(&block_align.to_le_bytes());
    out.extend_from_slice(&16u16.to_le_bytes());
    out.extend_from_slice(b"data");
    out.extend_from_slice(&data_len.to_le_bytes());
    for i in 0..frames {
        let v: i16 = if (i / 20) % 2 == 0 { 8_000 } else { -8_000 };
        for _ in 0..channels {
            out.extend_from_slice(&v.to_le_bytes());
        }
    }
    out
}

/// WAV media backed by memory.
pub fn wav_media(rate: u32, channels: u16, frames: u32) -> TrackMedia {
    TrackMedia::new(
        Box::new(Cursor::new(wav_bytes(rate, channels, frames))),
        AudioFormat::Wav,
    )
}

/// WAV media whose closer flips the returned flag.
pub fn tracked_wav_media(rate: u32, channels: u16, frames: u32) -> (TrackMedia, Arc<AtomicBool>) {
    let closed = Arc::new(AtomicBool::new(false));
    let flag = closed.clone();
    let media = wav_media(rate, channels, frames).with_closer(move || flag.store(true, Ordering::SeqCst));
    (media, closed)
}
