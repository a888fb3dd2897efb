//! Frequency spectrum sampling for live visualization
//!
//! Produces byte-scaled magnitude bins the way a browser analyser node does:
//! Blackman window, FFT, magnitude in decibels mapped linearly from
//! `[MIN_DB, MAX_DB]` onto `0..=255`.

use std::sync::Arc;

use rustfft::num_complex::Complex32;
use rustfft::{Fft, FftPlanner};

/// FFT size used for the playback visualizer
pub const PLAYBACK_FFT_SIZE: usize = 32;

/// FFT size used for the recording waveform
pub const RECORDING_FFT_SIZE: usize = 1024;

const MIN_DB: f32 = -100.0;
const MAX_DB: f32 = -30.0;

/// Computes byte frequency data over the most recent window of samples
pub struct SpectrumAnalyzer {
    fft: Arc<dyn Fft<f32>>,
    window: Vec<f32>,
}

impl SpectrumAnalyzer {
    /// Create an analyzer with `fft_size` points (bins = `fft_size / 2`)
    #[must_use]
    pub fn new(fft_size: usize) -> Self {
        let fft_size = fft_size.max(2);
        let mut planner = FftPlanner::<f32>::new();
        Self {
            fft: planner.plan_fft_forward(fft_size),
            window: blackman_window(fft_size),
        }
    }

    #[must_use]
    pub fn fft_size(&self) -> usize {
        self.window.len()
    }

    #[must_use]
    pub fn bin_count(&self) -> usize {
        self.window.len() / 2
    }

    /// Spectrum of the `fft_size` samples ending at `end`
    ///
    /// Missing samples before the start of the clip are treated as silence.
    #[must_use]
    pub fn frequency_data_at(&self, samples: &[f32], end: usize) -> Vec<u8> {
        let end = end.min(samples.len());
        let start = end.saturating_sub(self.fft_size());
        self.frequency_data(&samples[start..end])
    }

    /// Spectrum of the most recent `fft_size` samples of `samples`
    #[must_use]
    pub fn frequency_data(&self, samples: &[f32]) -> Vec<u8> {
        let n = self.fft_size();
        let tail = &samples[samples.len().saturating_sub(n)..];
        let pad = n - tail.len();

        let mut buf: Vec<Complex32> = (0..n)
            .map(|i| {
                let sample = if i < pad { 0.0 } else { tail[i - pad] };
                Complex32::new(sample * self.window[i], 0.0)
            })
            .collect();
        self.fft.process(&mut buf);

        #[allow(clippy::cast_precision_loss)]
        let scale = 1.0 / n as f32;
        buf.iter()
            .take(self.bin_count())
            .map(|c| to_byte(c.norm() * scale))
            .collect()
    }
}

/// Mean bin value, the scalar the visualizer is driven by
#[must_use]
pub fn average(bins: &[u8]) -> f32 {
    if bins.is_empty() {
        return 0.0;
    }
    let sum: u32 = bins.iter().map(|&b| u32::from(b)).sum();
    #[allow(clippy::cast_precision_loss)]
    let avg = sum as f32 / bins.len() as f32;
    avg
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn to_byte(magnitude: f32) -> u8 {
    if magnitude <= 0.0 {
        return 0;
    }
    let db = 20.0 * magnitude.log10();
    let scaled = 255.0 * (db - MIN_DB) / (MAX_DB - MIN_DB);
    scaled.clamp(0.0, 255.0) as u8
}

#[allow(clippy::cast_precision_loss)]
fn blackman_window(n: usize) -> Vec<f32> {
    let alpha = 0.16_f32;
    let a0 = 0.5 * (1.0 - alpha);
    let a1 = 0.5;
    let a2 = 0.5 * alpha;
    let denom = n as f32;
    (0..n)
        .map(|i| {
            let x = 2.0 * std::f32::consts::PI * i as f32 / denom;
            a0 - a1 * x.cos() + a2 * (2.0 * x).cos()
        })
        .collect()
}
