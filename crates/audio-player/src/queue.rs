//! Thread-safe bounded queues for interleaved audio samples.
//!
//! [`SampleQueue`] is the hand-off format between stages:
//! - decode thread → queue → feeder thread
//! - feeder thread → queue → output callback (non-blocking)
//!
//! Shutdown is deterministic: `close()` wakes every waiter, blocked producers give up,
//! and consumers drain what is left before seeing `None`.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// Bounded MPMC queue of interleaved `f32` samples.
///
/// A single [`Condvar`] is used as a general "state changed" signal, and the `done`
/// flag lives under the same mutex as the samples so close/push/pop never race.
pub struct SampleQueue {
    channels: usize,
    inner: Mutex<QueueInner>,
    cv: Condvar,
    max_buffered_samples: usize,
}

struct QueueInner {
    samples: VecDeque<f32>,
    done: bool,
}

/// Strategy for popping interleaved frames from the queue.
pub enum PopStrategy {
    /// Block until exactly `frames` are available, or return `None` if closed before enough data.
    BlockingExact { frames: usize },
    /// Block until at least one frame is available, then return up to `max_frames`.
    BlockingUpTo { max_frames: usize },
    /// Return immediately with up to `max_frames`, or `None` if currently empty.
    NonBlocking { max_frames: usize },
}

/// Queue capacity in **samples** for a `(rate, channels, seconds)` target.
///
/// Non-finite or non-positive durations fall back to two seconds.
pub fn calc_max_buffered_samples(rate_hz: u32, channels: usize, buffer_seconds: f32) -> usize {
    let secs = if buffer_seconds.is_finite() && buffer_seconds > 0.0 {
        buffer_seconds
    } else {
        2.0
    };

    // f32 seconds like 0.15 sit just above the decimal value; round to the nearest frame.
    let frames = (f64::from(rate_hz) * f64::from(secs)).round() as usize;
    frames.max(1).saturating_mul(channels.max(1))
}

impl SampleQueue {
    /// `max_buffered_samples` is a cap in samples, not frames.
    pub fn new(channels: usize, max_buffered_samples: usize) -> Self {
        let channels = channels.max(1);
        Self {
            channels,
            inner: Mutex::new(QueueInner {
                samples: VecDeque::new(),
                done: false,
            }),
            cv: Condvar::new(),
            max_buffered_samples: max_buffered_samples.max(channels),
        }
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    /// Capacity in frames.
    pub fn max_frames(&self) -> usize {
        self.max_buffered_samples / self.channels
    }

    /// Buffered frames (best-effort snapshot).
    pub fn len_frames(&self) -> usize {
        self.inner.lock().samples.len() / self.channels
    }

    /// Whether the producer closed the queue. Closed queues may still hold samples.
    pub fn is_done(&self) -> bool {
        self.inner.lock().done
    }

    /// Mark the queue finished and wake all waiters. Idempotent.
    pub fn close(&self) {
        self.inner.lock().done = true;
        self.cv.notify_all();
    }

    /// Drop all buffered samples without closing.
    pub fn clear(&self) {
        self.inner.lock().samples.clear();
        self.cv.notify_all();
    }

    /// Push samples, blocking while the queue is full.
    ///
    /// Returns early (dropping the rest) if the queue is closed while waiting.
    pub fn push_interleaved_blocking(&self, samples: &[f32]) {
        let mut offset = 0;
        while offset < samples.len() {
            let mut g = self.inner.lock();
            while g.samples.len() >= self.max_buffered_samples && !g.done {
                self.cv.wait(&mut g);
            }
            if g.done {
                return;
            }
            let room = self.max_buffered_samples - g.samples.len();
            let take = room.min(samples.len() - offset);
            g.samples.extend(&samples[offset..offset + take]);
            offset += take;
            drop(g);
            self.cv.notify_all();
        }
    }

    /// Push as many whole frames as fit, waiting up to `timeout` for room.
    ///
    /// Returns the number of frames accepted (zero on timeout or when closed).
    pub fn push_frames_timeout(&self, samples: &[f32], timeout: Duration) -> usize {
        let deadline = Instant::now() + timeout;
        let mut g = self.inner.lock();
        while g.samples.len() + self.channels > self.max_buffered_samples && !g.done {
            if self.cv.wait_until(&mut g, deadline).timed_out() {
                break;
            }
        }
        if g.done {
            return 0;
        }
        let room_frames = (self.max_buffered_samples - g.samples.len().min(self.max_buffered_samples))
            / self.channels;
        let frames = room_frames.min(samples.len() / self.channels);
        if frames == 0 {
            return 0;
        }
        g.samples.extend(&samples[..frames * self.channels]);
        drop(g);
        self.cv.notify_all();
        frames
    }

    /// Pop interleaved frames using the requested strategy.
    ///
    /// Returns `None` when no data can satisfy the request.
    pub fn pop(&self, strategy: PopStrategy) -> Option<Vec<f32>> {
        let mut g = self.inner.lock();
        let take_samples = match strategy {
            PopStrategy::BlockingExact { frames } => {
                let want = frames * self.channels;
                while g.samples.len() < want && !g.done {
                    self.cv.wait(&mut g);
                }
                if g.samples.len() < want {
                    return None;
                }
                want
            }
            PopStrategy::BlockingUpTo { max_frames } => {
                while g.samples.len() < self.channels && !g.done {
                    self.cv.wait(&mut g);
                }
                let available = g.samples.len() / self.channels;
                available.min(max_frames) * self.channels
            }
            PopStrategy::NonBlocking { max_frames } => {
                let available = g.samples.len() / self.channels;
                available.min(max_frames) * self.channels
            }
        };
        if take_samples == 0 {
            return None;
        }

        let out: Vec<f32> = g.samples.drain(..take_samples).collect();
        drop(g);
        self.cv.notify_all();
        Some(out)
    }

    /// Wait until the queue is empty. Returns `false` on timeout.
    pub fn wait_until_empty(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut g = self.inner.lock();
        while !g.samples.is_empty() {
            if self.cv.wait_until(&mut g, deadline).timed_out() {
                return g.samples.is_empty();
            }
        }
        true
    }

    /// Wait briefly for any buffered audio to appear.
    pub fn wait_for_any(&self, timeout: Duration) -> bool {
        let mut g = self.inner.lock();
        if !g.samples.is_empty() {
            return true;
        }
        let _ = self.cv.wait_for(&mut g, timeout);
        !g.samples.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn calc_max_buffered_samples_fallbacks() {
        assert_eq!(calc_max_buffered_samples(48_000, 2, 2.0), 192_000);
        assert_eq!(calc_max_buffered_samples(48_000, 2, -1.0), 192_000);
        assert_eq!(calc_max_buffered_samples(48_000, 2, f32::NAN), 192_000);
        assert_eq!(calc_max_buffered_samples(48_000, 2, 0.15), 14_400);
        assert_eq!(calc_max_buffered_samples(44_100, 1, 0.1), 4_410);
    }

    #[test]
    fn pop_nonblocking_empty() {
        let q = SampleQueue::new(2, 16);
        assert!(q.pop(PopStrategy::NonBlocking { max_frames: 4 }).is_none());
    }

    #[test]
    fn pop_blocking_exact_waits_for_full_frames() {
        let q = Arc::new(SampleQueue::new(2, 64));
        let q_pop = q.clone();

        let handle = thread::spawn(move || {
            let out = q_pop.pop(PopStrategy::BlockingExact { frames: 3 }).unwrap();
            assert_eq!(out, vec![0.1, 0.2, 0.3, 0.4, 0.5, 0.6]);
        });

        q.push_interleaved_blocking(&[0.1, 0.2, 0.3, 0.4]);
        q.push_interleaved_blocking(&[0.5, 0.6]);
        handle.join().unwrap();
    }

    #[test]
    fn pop_blocking_up_to_drains_tail_after_close() {
        let q = Arc::new(SampleQueue::new(2, 64));
        let q_pop = q.clone();

        q.push_interleaved_blocking(&[1.0, 2.0, 3.0, 4.0]);
        q.close();

        let handle = thread::spawn(move || {
            let out = q_pop.pop(PopStrategy::BlockingUpTo { max_frames: 8 }).unwrap();
            assert_eq!(out.len(), 4);
            assert!(q_pop.pop(PopStrategy::BlockingUpTo { max_frames: 8 }).is_none());
        });
        handle.join().unwrap();
    }

    #[test]
    fn pop_blocking_exact_returns_none_when_closed_short() {
        let q = SampleQueue::new(2, 64);
        q.push_interleaved_blocking(&[1.0, 2.0]);
        q.close();
        assert!(q.pop(PopStrategy::BlockingExact { frames: 2 }).is_none());
        assert_eq!(q.len_frames(), 1);
    }

    #[test]
    fn push_frames_timeout_accepts_whole_frames_only() {
        let q = SampleQueue::new(2, 6);
        let accepted = q.push_frames_timeout(&[1.0; 10], Duration::from_millis(5));
        assert_eq!(accepted, 3);
        let accepted = q.push_frames_timeout(&[1.0; 2], Duration::from_millis(5));
        assert_eq!(accepted, 0);
    }

    #[test]
    fn blocked_push_gives_up_on_close() {
        let q = Arc::new(SampleQueue::new(1, 2));
        let q_push = q.clone();
        let handle = thread::spawn(move || q_push.push_interleaved_blocking(&[1.0; 8]));
        assert!(q.wait_for_any(Duration::from_millis(200)));
        q.close();
        handle.join().unwrap();
        assert_eq!(q.len_frames(), 2);
    }

    #[test]
    fn clear_unblocks_producer() {
        let q = Arc::new(SampleQueue::new(1, 2));
        q.push_interleaved_blocking(&[1.0, 1.0]);
        let q_push = q.clone();
        let handle = thread::spawn(move || q_push.push_frames_timeout(&[2.0], Duration::from_secs(5)));
        thread::sleep(Duration::from_millis(20));
        q.clear();
        assert_eq!(handle.join().unwrap(), 1);
    }

    #[test]
    fn wait_until_empty_times_out_when_nobody_drains() {
        let q = SampleQueue::new(1, 4);
        q.push_interleaved_blocking(&[1.0]);
        assert!(!q.wait_until_empty(Duration::from_millis(10)));
        q.clear();
        assert!(q.wait_until_empty(Duration::from_millis(10)));
    }
}
