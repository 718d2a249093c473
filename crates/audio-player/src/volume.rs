//! User volume to gain mapping.
//!
//! Volume percent maps linearly onto a decibel-like range `[min_db, max_db]`, and the
//! applied gain is `log_base ^ db`. At or below `min_db` the output is flagged silent
//! instead of merely quiet.

use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU32, Ordering};

/// Attenuation range endpoints.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct VolumeConfig {
    pub min_db: f32,
    pub max_db: f32,
    pub log_base: f32,
}

impl Default for VolumeConfig {
    fn default() -> Self {
        Self {
            min_db: -5.0,
            max_db: 0.0,
            log_base: 8.0,
        }
    }
}

/// Resolved volume setting.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct VolumeLevel {
    pub percent: u8,
    pub db: f32,
    pub gain: f32,
    pub silent: bool,
}

impl VolumeConfig {
    /// Resolve a percent value (clamped to `0..=100`).
    pub fn level(&self, percent: u8) -> VolumeLevel {
        let percent = percent.min(100);
        let db = self.min_db + (self.max_db - self.min_db) * f32::from(percent) / 100.0;
        if db <= self.min_db {
            return VolumeLevel {
                percent,
                db: self.min_db,
                gain: 0.0,
                silent: true,
            };
        }
        let db = db.min(self.max_db);
        VolumeLevel {
            percent,
            db,
            gain: self.log_base.powf(db),
            silent: false,
        }
    }
}

/// Lock-free volume state read by the feeder thread on every chunk.
#[derive(Debug)]
pub struct VolumeControl {
    percent: AtomicU8,
    gain_bits: AtomicU32,
    silent: AtomicBool,
    muted: AtomicBool,
}

impl VolumeControl {
    pub fn new(level: VolumeLevel) -> Self {
        Self {
            percent: AtomicU8::new(level.percent),
            gain_bits: AtomicU32::new(level.gain.to_bits()),
            silent: AtomicBool::new(level.silent),
            muted: AtomicBool::new(false),
        }
    }

    pub fn set_level(&self, level: VolumeLevel) {
        self.gain_bits.store(level.gain.to_bits(), Ordering::Relaxed);
        self.silent.store(level.silent, Ordering::Relaxed);
        self.percent.store(level.percent, Ordering::Relaxed);
    }

    pub fn set_muted(&self, muted: bool) {
        self.muted.store(muted, Ordering::Relaxed);
    }

    pub fn percent(&self) -> u8 {
        self.percent.load(Ordering::Relaxed)
    }

    pub fn is_muted(&self) -> bool {
        self.muted.load(Ordering::Relaxed)
    }

    pub fn is_silent(&self) -> bool {
        self.silent.load(Ordering::Relaxed)
    }

    /// Gain to multiply samples by; zero while muted or silent.
    pub fn effective_gain(&self) -> f32 {
        if self.is_muted() || self.is_silent() {
            0.0
        } else {
            f32::from_bits(self.gain_bits.load(Ordering::Relaxed))
        }
    }

    /// Scale interleaved samples in place.
    pub fn apply(&self, samples: &mut [f32]) {
        let gain = self.effective_gain();
        if gain == 1.0 {
            return;
        }
        for s in samples.iter_mut() {
            *s *= gain;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_clamps_percent() {
        let cfg = VolumeConfig::default();
        let level = cfg.level(150);
        assert_eq!(level.percent, 100);
        assert_eq!(level.db, 0.0);
        assert_eq!(level.gain, 1.0);
        assert!(!level.silent);
    }

    #[test]
    fn level_at_minimum_is_silent() {
        let level = VolumeConfig::default().level(0);
        assert!(level.silent);
        assert_eq!(level.gain, 0.0);
    }

    #[test]
    fn gain_is_monotonic_in_percent() {
        let cfg = VolumeConfig::default();
        let mut last = -1.0f32;
        for p in 0..=100u8 {
            let gain = cfg.level(p).gain;
            assert!(gain >= last, "gain dropped at {p}");
            last = gain;
        }
    }

    #[test]
    fn mute_zeroes_gain_and_keeps_level() {
        let cfg = VolumeConfig::default();
        let ctl = VolumeControl::new(cfg.level(50));
        let before = ctl.effective_gain();
        assert!(before > 0.0 && before < 1.0);

        ctl.set_muted(true);
        let mut buf = [0.5f32, -0.5];
        ctl.apply(&mut buf);
        assert_eq!(buf, [0.0, 0.0]);
        assert_eq!(ctl.percent(), 50);

        ctl.set_muted(false);
        assert_eq!(ctl.effective_gain(), before);
    }
}
