//! Streaming resample stage.
//!
//! Uses Rubato to convert decoded interleaved `f32` audio from the source rate to the
//! rate the output was opened at. Runs inline on the feeder thread: input of any length
//! is accumulated into fixed chunks, and `flush` pushes the final partial chunk through.

use audioadapter_buffers::direct::InterleavedSlice;
use rubato::{
    Async, FixedAsync, Indexing, Resampler, SincInterpolationParameters, SincInterpolationType,
    WindowFunction, calculate_cutoff,
};

use crate::DeviceError;

/// Sinc resampler with an input accumulator.
pub struct StreamResampler {
    inner: Async<f32>,
    channels: usize,
    chunk_frames: usize,
    pending: Vec<f32>,
    out: Vec<f32>,
    indexing: Indexing,
}

impl StreamResampler {
    /// Build a resampler converting `src_rate` to `dst_rate`.
    ///
    /// `chunk_frames` trades latency for per-call overhead.
    pub fn new(
        src_rate: u32,
        dst_rate: u32,
        channels: usize,
        chunk_frames: usize,
    ) -> Result<Self, DeviceError> {
        let f_ratio = dst_rate as f64 / src_rate as f64;

        let sinc_len = 128;
        let window = WindowFunction::BlackmanHarris2;
        let params = SincInterpolationParameters {
            sinc_len,
            f_cutoff: calculate_cutoff(sinc_len, window),
            interpolation: SincInterpolationType::Cubic,
            oversampling_factor: 256,
            window,
        };

        let chunk_frames = chunk_frames.max(1);
        let inner = Async::<f32>::new_sinc(
            f_ratio,
            1.1,
            &params,
            chunk_frames,
            channels,
            FixedAsync::Input,
        )
        .map_err(|e| DeviceError::Resample(format!("init: {e}")))?;

        let out = vec![0.0f32; channels * inner.output_frames_max()];
        Ok(Self {
            inner,
            channels,
            chunk_frames,
            pending: Vec::with_capacity(channels * chunk_frames),
            out,
            indexing: Indexing {
                input_offset: 0,
                output_offset: 0,
                active_channels_mask: None,
                partial_len: None,
            },
        })
    }

    /// Feed interleaved input; returns whatever output full chunks produced.
    pub fn process(&mut self, input: &[f32]) -> Result<Vec<f32>, DeviceError> {
        self.pending.extend_from_slice(input);
        let chunk_samples = self.chunk_frames * self.channels;
        let mut produced = Vec::new();
        let mut start = 0;
        while self.pending.len() - start >= chunk_samples {
            let chunk = self.pending[start..start + chunk_samples].to_vec();
            self.run(&chunk, None, &mut produced)?;
            start += chunk_samples;
        }
        self.pending.drain(..start);
        Ok(produced)
    }

    /// Push the buffered remainder through as a partial chunk.
    pub fn flush(&mut self) -> Result<Vec<f32>, DeviceError> {
        let mut produced = Vec::new();
        let tail_frames = self.pending.len() / self.channels;
        if tail_frames > 0 {
            let tail = std::mem::take(&mut self.pending);
            self.run(&tail[..tail_frames * self.channels], Some(tail_frames), &mut produced)?;
        }
        self.pending.clear();
        Ok(produced)
    }

    fn run(
        &mut self,
        input: &[f32],
        partial_len: Option<usize>,
        produced: &mut Vec<f32>,
    ) -> Result<(), DeviceError> {
        let frames = input.len() / self.channels;
        let input_adapter = InterleavedSlice::new(input, self.channels, frames)
            .map_err(|e| DeviceError::Resample(format!("input slice: {e}")))?;
        let out_frames = self.out.len() / self.channels;
        let mut output_adapter = InterleavedSlice::new_mut(&mut self.out, self.channels, out_frames)
            .map_err(|e| DeviceError::Resample(format!("output slice: {e}")))?;

        self.indexing.input_offset = 0;
        self.indexing.output_offset = 0;
        self.indexing.partial_len = partial_len;

        let (_nbr_in, nbr_out) = self
            .inner
            .process_into_buffer(&input_adapter, &mut output_adapter, Some(&self.indexing))
            .map_err(|e| DeviceError::Resample(format!("process: {e}")))?;
        produced.extend_from_slice(&self.out[..nbr_out * self.channels]);
        Ok(())
    }
}
