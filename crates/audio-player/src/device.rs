//! Output device lookup for [`crate::playback::CpalSink`] and the device listing.

use std::cmp::Reverse;

use anyhow::{Context, Result, anyhow};
use cpal::traits::{DeviceTrait, HostTrait};

/// Largest fixed device buffer requested, in frames.
const MAX_BUFFER_FRAMES: u32 = 16_384;

/// Output device whose name contains `needle` (case-insensitive); the host default when
/// `needle` is unset or blank.
pub fn pick_device(host: &cpal::Host, needle: Option<&str>) -> Result<cpal::Device> {
    let needle = needle.map(str::trim).filter(|n| !n.is_empty());
    let Some(needle) = needle else {
        return host
            .default_output_device()
            .ok_or_else(|| anyhow!("No default output device"));
    };
    host.output_devices()
        .context("No output devices")?
        .find(|d| {
            d.description()
                .is_ok_and(|desc| matches_device_name(&desc.name(), needle))
        })
        .ok_or_else(|| anyhow!("No output device matched: {needle}"))
}

/// Supported config for playing a `rate` Hz track.
///
/// The rate itself wins when a range covers it. Otherwise the highest rate below it is
/// taken, then the lowest above. Formats the output stream cannot drive are skipped.
pub fn pick_output_config(device: &cpal::Device, rate: u32) -> Result<cpal::SupportedStreamConfig> {
    device
        .supported_output_configs()
        .context("query output configs")?
        .filter_map(|range| {
            let (chosen, key) =
                rank_range(range.min_sample_rate(), range.max_sample_rate(), range.sample_format(), rate)?;
            Some((key, range.with_sample_rate(chosen)))
        })
        .max_by_key(|(key, _)| *key)
        .map(|(_, config)| config)
        .ok_or_else(|| anyhow!("No playable output config for {rate} Hz"))
}

/// Fixed buffer size for `config`, or `None` to leave CPAL's default.
pub fn pick_buffer_size(config: &cpal::SupportedStreamConfig) -> Option<cpal::BufferSize> {
    match config.buffer_size() {
        cpal::SupportedBufferSize::Range { min, max } => {
            Some(cpal::BufferSize::Fixed(fixed_buffer_frames(*min, *max)))
        }
        cpal::SupportedBufferSize::Unknown => None,
    }
}

/// Names of the host's output devices, in enumeration order.
pub fn output_device_names(host: &cpal::Host) -> Result<Vec<String>> {
    let devices = host.output_devices().context("No output devices")?;
    devices
        .map(|d| -> Result<String> { Ok(d.description()?.to_string()) })
        .collect()
}

type RangeKey = (bool, u32, Reverse<u8>);

/// Rate to use from a `[min, max]` range and its ordering key; `None` for formats the
/// output stream cannot write.
fn rank_range(min: u32, max: u32, format: cpal::SampleFormat, target: u32) -> Option<(u32, RangeKey)> {
    let format_rank = match format {
        cpal::SampleFormat::F32 => 0,
        cpal::SampleFormat::I32 => 1,
        cpal::SampleFormat::I16 => 2,
        cpal::SampleFormat::U16 => 3,
        _ => return None,
    };
    let rate = target.clamp(min, max.max(min));
    let below = rate <= target;
    // Closer is better on either side of the target.
    let closeness = if below { rate } else { u32::MAX - rate };
    Some((rate, (below, closeness, Reverse(format_rank))))
}

fn fixed_buffer_frames(min: u32, max: u32) -> u32 {
    MAX_BUFFER_FRAMES.min(max).max(min)
}

fn matches_device_name(name: &str, needle: &str) -> bool {
    let needle = needle.trim();
    !needle.is_empty() && name.to_lowercase().contains(&needle.to_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;
    use cpal::SampleFormat;

    fn best(ranges: &[(u32, u32, SampleFormat)], target: u32) -> Option<(u32, SampleFormat)> {
        ranges
            .iter()
            .filter_map(|&(min, max, format)| {
                let (rate, key) = rank_range(min, max, format, target)?;
                Some((key, (rate, format)))
            })
            .max_by_key(|(key, _)| *key)
            .map(|(_, pick)| pick)
    }

    #[test]
    fn matches_device_name_is_case_insensitive() {
        assert!(matches_device_name("USB DAC", "dac"));
        assert!(matches_device_name("usb dac", " USB "));
        assert!(!matches_device_name("USB DAC", "speaker"));
        assert!(!matches_device_name("USB DAC", ""));
    }

    #[test]
    fn track_rate_inside_a_range_is_used_as_is() {
        let ranges = [(8_000, 48_000, SampleFormat::I16), (44_100, 192_000, SampleFormat::F32)];
        assert_eq!(best(&ranges, 44_100), Some((44_100, SampleFormat::F32)));
        assert_eq!(best(&ranges, 22_050), Some((22_050, SampleFormat::I16)));
    }

    #[test]
    fn falls_back_below_then_above_the_track_rate() {
        let ranges = [(48_000, 48_000, SampleFormat::F32), (96_000, 96_000, SampleFormat::F32)];
        assert_eq!(best(&ranges, 88_200), Some((48_000, SampleFormat::F32)));
        assert_eq!(best(&ranges, 44_100), Some((48_000, SampleFormat::F32)));

        let above = [(96_000, 96_000, SampleFormat::F32), (192_000, 192_000, SampleFormat::F32)];
        assert_eq!(best(&above, 44_100), Some((96_000, SampleFormat::F32)));
    }

    #[test]
    fn unplayable_formats_are_skipped() {
        let ranges = [(44_100, 44_100, SampleFormat::F64), (48_000, 48_000, SampleFormat::I16)];
        assert_eq!(best(&ranges, 44_100), Some((48_000, SampleFormat::I16)));
        assert_eq!(best(&[(44_100, 44_100, SampleFormat::U8)], 44_100), None);
    }

    #[test]
    fn fixed_buffer_is_capped_within_the_device_range() {
        assert_eq!(fixed_buffer_frames(64, 4_096), 4_096);
        assert_eq!(fixed_buffer_frames(64, 65_536), MAX_BUFFER_FRAMES);
        assert_eq!(fixed_buffer_frames(32_768, 65_536), 32_768);
    }
}
