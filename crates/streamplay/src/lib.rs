//! streamplay: a streaming audio player.
//!
//! Tracks are fetched progressively over HTTP into a [`stream::StreamBuffer`] and
//! played through an `audio_player::PlaybackDevice`. The [`player::Player`] loop owns
//! the [`play_queue::Queue`], prefetches the next track near the end of the current
//! one and hands it over without a gap.

pub mod cli;
pub mod config;
pub mod media;
pub mod play_queue;
pub mod player;
pub mod report;
pub mod runtime;
pub mod stream;
pub mod task;

#[cfg(test)]
mod test_support;
