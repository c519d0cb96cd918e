//! Spectrum analyser tap.
//!
//! [`AnalyserStream`] sits just before the output in the chain. It forwards
//! samples untouched, and on every correctly sized block it runs a Hamming
//! windowed, 50% overlapped FFT, converts the lower bins to a normalised dB
//! scale and smooths each bin over the last few frames. The result is
//! published through a [`SpectrumHandle`] that any thread can copy from.

pub mod fft;

use std::{
    f32::consts::PI,
    fmt,
    sync::{Arc, Mutex, PoisonError},
};

use serde::{Deserialize, Serialize};
use tracing::{trace, warn};

use crate::{
    config::AnalyserConfig,
    stream::{read_upstream, AudioStream, BoxedStream, Sample},
    PlayerError, Result,
};

pub use fft::{transform, Direction};

const MIN_DB: f32 = -100.0;
const MAX_DB: f32 = 0.0;
const CHANNELS: usize = 2;
const SAMPLE_SCALE: f32 = 1.0 / i16::MAX as f32;

/// Triangular temporal filter, newest frame first.
const SMOOTHING: [f32; 5] = [1.0, 2.0, 3.0, 2.0, 1.0];
const SMOOTHING_NORM: f32 = 1.0 / 9.0;
const HISTORY: usize = SMOOTHING.len();

/// Copy of one published spectrum generation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SpectrumFrame {
    pub generation: u64,
    pub bins: Vec<f32>,
}

#[derive(Debug)]
struct SpectrumBuffers {
    current: Vec<f32>,
    previous: Vec<f32>,
    generation: u64,
}

/// Shared, thread-safe view over the spectrum published by an
/// [`AnalyserStream`].
#[derive(Clone)]
pub struct SpectrumHandle {
    shared: Arc<Mutex<SpectrumBuffers>>,
    bin_count: usize,
}

impl SpectrumHandle {
    fn new(bin_count: usize) -> Self {
        Self {
            shared: Arc::new(Mutex::new(SpectrumBuffers {
                current: vec![0.0; bin_count],
                previous: vec![0.0; bin_count],
                generation: 0,
            })),
            bin_count,
        }
    }

    pub fn bin_count(&self) -> usize {
        self.bin_count
    }

    /// Copies the latest complete spectrum into `output`, which is resized to
    /// `bins`. Returns how many values were copied, `min(bins, bin_count)`;
    /// the remainder of `output` is zeroed.
    pub fn copy_bins(&self, output: &mut Vec<f32>, bins: usize) -> Result<usize> {
        let buffers = self.lock()?;
        Ok(copy_into(&buffers.current, output, bins))
    }

    /// Same as [`copy_bins`](Self::copy_bins) for the generation before the
    /// latest one.
    pub fn copy_previous_bins(&self, output: &mut Vec<f32>, bins: usize) -> Result<usize> {
        let buffers = self.lock()?;
        Ok(copy_into(&buffers.previous, output, bins))
    }

    /// Number of spectra published so far.
    pub fn generation(&self) -> Result<u64> {
        Ok(self.lock()?.generation)
    }

    pub fn snapshot(&self) -> Result<SpectrumFrame> {
        let buffers = self.lock()?;
        Ok(SpectrumFrame {
            generation: buffers.generation,
            bins: buffers.current.clone(),
        })
    }

    fn publish(&self, bins: &[f32]) {
        // The audio thread must keep running even if an observer panicked
        // while holding the lock.
        let mut buffers = self.shared.lock().unwrap_or_else(PoisonError::into_inner);
        let SpectrumBuffers {
            current, previous, ..
        } = &mut *buffers;
        std::mem::swap(current, previous);
        current.copy_from_slice(bins);
        buffers.generation += 1;
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, SpectrumBuffers>> {
        self.shared
            .lock()
            .map_err(|_| PlayerError::msg("spectrum buffer has been poisoned"))
    }
}

impl fmt::Debug for SpectrumHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpectrumHandle")
            .field("bin_count", &self.bin_count)
            .finish()
    }
}

fn copy_into(source: &[f32], output: &mut Vec<f32>, bins: usize) -> usize {
    let count = bins.min(source.len());
    output.clear();
    output.resize(bins, 0.0);
    output[..count].copy_from_slice(&source[..count]);
    count
}

/// Transparent pass-through stage that publishes a smoothed magnitude
/// spectrum of the samples flowing through it.
pub struct AnalyserStream {
    upstream: Option<BoxedStream>,
    frame_size: usize,
    bin_count: usize,
    window: Vec<f32>,
    transform: Vec<f32>,
    prev: Vec<f32>,
    /// `HISTORY` rows of `bin_count` normalised magnitudes; row `cursor` is the
    /// newest.
    history: Vec<f32>,
    cursor: usize,
    smoothed: Vec<f32>,
    framing_errors: u64,
    spectrum: SpectrumHandle,
}

impl AnalyserStream {
    pub fn new(upstream: BoxedStream, config: &AnalyserConfig) -> Result<Self> {
        config.validate()?;

        let window_len = config.window_len();
        let bin_count = config.bin_count;
        Ok(Self {
            upstream: Some(upstream),
            frame_size: config.frame_size,
            bin_count,
            window: (0..window_len).map(|n| hamming(n, window_len)).collect(),
            transform: vec![0.0; 2 * window_len],
            prev: vec![0.0; config.frame_size],
            history: vec![0.0; HISTORY * bin_count],
            cursor: 0,
            smoothed: vec![0.0; bin_count],
            framing_errors: 0,
            spectrum: SpectrumHandle::new(bin_count),
        })
    }

    /// Handle observers use to copy out the published spectrum.
    pub fn spectrum(&self) -> SpectrumHandle {
        self.spectrum.clone()
    }

    /// Samples per `read` that trigger analysis.
    pub fn block_len(&self) -> usize {
        CHANNELS * self.frame_size
    }

    /// Reads whose length did not match [`block_len`](Self::block_len).
    pub fn framing_errors(&self) -> u64 {
        self.framing_errors
    }

    fn analyse(&mut self, block: &[Sample], produced: usize) {
        let frame_size = self.frame_size;

        for (index, prev) in self.prev.iter().enumerate() {
            self.transform[2 * index] = prev * self.window[index];
            self.transform[2 * index + 1] = 0.0;
        }

        for index in 0..frame_size {
            let left = CHANNELS * index;
            // Whatever upstream did not produce is analysed as silence.
            let mono = if left + 1 < produced {
                downmix(block[left], block[left + 1])
            } else {
                0.0
            };
            let slot = frame_size + index;
            self.transform[2 * slot] = mono * self.window[slot];
            self.transform[2 * slot + 1] = 0.0;
            self.prev[index] = mono;
        }

        if let Err(err) = transform(&mut self.transform, Direction::Forward) {
            warn!(%err, "spectrum transform failed");
            return;
        }

        self.cursor = (self.cursor + 1) % HISTORY;
        let scale = 2.0 / self.window.len() as f32;
        let row = self.cursor * self.bin_count;
        for bin in 0..self.bin_count {
            let re = self.transform[2 * bin];
            let im = self.transform[2 * bin + 1];
            self.history[row + bin] = normalised_db(scale * (re * re + im * im).sqrt());
        }

        for bin in 0..self.bin_count {
            let mut acc = 0.0;
            for (age, weight) in SMOOTHING.iter().enumerate() {
                let row = (self.cursor + HISTORY - age) % HISTORY;
                acc += weight * self.history[row * self.bin_count + bin];
            }
            self.smoothed[bin] = acc * SMOOTHING_NORM;
        }

        self.spectrum.publish(&self.smoothed);
    }
}

impl AudioStream for AnalyserStream {
    fn read(&mut self, buffer: &mut [Sample]) -> usize {
        let produced = read_upstream(self.upstream.as_mut(), buffer);

        if buffer.len() != self.block_len() {
            self.framing_errors += 1;
            warn!(
                expected = self.block_len(),
                got = buffer.len(),
                "analyser frame size mismatch, skipping analysis"
            );
            return produced;
        }

        if produced == 0 {
            trace!("analyser upstream exhausted");
            return 0;
        }

        self.analyse(buffer, produced);
        produced
    }

    fn start(&mut self) -> bool {
        self.upstream.as_mut().map(|u| u.start()).unwrap_or(false)
    }
}

impl fmt::Debug for AnalyserStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AnalyserStream")
            .field("frame_size", &self.frame_size)
            .field("bin_count", &self.bin_count)
            .field("framing_errors", &self.framing_errors)
            .finish()
    }
}

fn downmix(left: Sample, right: Sample) -> f32 {
    let mono = (left as f32 + right as f32) * 0.5 * SAMPLE_SCALE;
    mono.clamp(-1.0, 1.0)
}

/// Maps a linear magnitude to `[0, 1]` over a -100..0 dB range. Zero and NaN
/// land on the floor.
fn normalised_db(magnitude: f32) -> f32 {
    let db = if magnitude > 0.0 {
        20.0 * magnitude.log10()
    } else {
        MIN_DB
    };
    (db.clamp(MIN_DB, MAX_DB) - MIN_DB) * 0.01
}

fn hamming(index: usize, len: usize) -> f32 {
    if len <= 1 {
        return 1.0;
    }

    0.54 - 0.46 * ((2.0 * PI * index as f32) / (len as f32 - 1.0)).cos()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::MemoryStream;

    const SAMPLE_RATE: f32 = 44_100.0;

    fn config(frame_size: usize, bin_count: usize) -> AnalyserConfig {
        AnalyserConfig {
            frame_size,
            bin_count,
        }
    }

    fn analyser(samples: Vec<Sample>, frame_size: usize, bins: usize) -> AnalyserStream {
        AnalyserStream::new(Box::new(MemoryStream::new(samples)), &config(frame_size, bins)).unwrap()
    }

    fn stereo_sine(frequency: f32, frames: usize, amplitude: f32) -> Vec<Sample> {
        (0..frames)
            .flat_map(|n| {
                let value = (2.0 * PI * frequency * n as f32 / SAMPLE_RATE).sin();
                let sample = (value * amplitude * i16::MAX as f32).round() as Sample;
                [sample, sample]
            })
            .collect()
    }

    #[test]
    fn silence_publishes_all_zero_bins() {
        let mut stream = analyser(vec![0; 2048], 512, 128);
        let spectrum = stream.spectrum();
        let mut block = vec![0; 1024];

        assert_eq!(stream.read(&mut block), 1024);
        assert_eq!(stream.read(&mut block), 1024);

        let mut bins = Vec::new();
        assert_eq!(spectrum.copy_bins(&mut bins, 128).unwrap(), 128);
        assert!(bins.iter().all(|&b| b == 0.0));
        assert!(bins.iter().all(|b| b.is_finite()));
        assert_eq!(spectrum.generation().unwrap(), 2);
    }

    #[test]
    fn sine_peaks_at_expected_bin() {
        let frame_size = 512;
        let frequency = 2_000.0;
        let blocks = 6;
        let mut stream = analyser(stereo_sine(frequency, frame_size * blocks, 0.5), frame_size, 128);
        let spectrum = stream.spectrum();
        let mut block = vec![0; 2 * frame_size];
        for _ in 0..blocks {
            assert_eq!(stream.read(&mut block), block.len());
        }

        let mut bins = Vec::new();
        spectrum.copy_bins(&mut bins, 128).unwrap();
        let peak = bins
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(index, _)| index)
            .unwrap();

        let expected = frequency * (2 * frame_size) as f32 / SAMPLE_RATE;
        assert!(
            (peak as f32 - expected).abs() <= 1.0,
            "peak at {peak}, expected near {expected}"
        );
        assert!(bins[peak] > 0.5);
    }

    #[test]
    fn early_frames_use_zero_padded_history() {
        let frame_size = 64;
        let mut stream = analyser(stereo_sine(3_000.0, frame_size * 3, 0.8), frame_size, 32);
        let spectrum = stream.spectrum();
        let mut block = vec![0; 2 * frame_size];
        let mut bins = Vec::new();

        stream.read(&mut block);
        spectrum.copy_bins(&mut bins, 32).unwrap();
        let newest = stream.cursor * 32;
        for bin in 0..32 {
            let expected = stream.history[newest + bin] * SMOOTHING_NORM;
            assert!((bins[bin] - expected).abs() < 1e-6);
        }

        stream.read(&mut block);
        stream.read(&mut block);
        spectrum.copy_bins(&mut bins, 32).unwrap();
        let row = |age: usize| ((stream.cursor + HISTORY - age) % HISTORY) * 32;
        for bin in 0..32 {
            let expected = (stream.history[row(0) + bin]
                + 2.0 * stream.history[row(1) + bin]
                + 3.0 * stream.history[row(2) + bin])
                * SMOOTHING_NORM;
            assert!((bins[bin] - expected).abs() < 1e-6);
            assert_eq!(stream.history[row(3) + bin], 0.0);
            assert_eq!(stream.history[row(4) + bin], 0.0);
        }
    }

    #[test]
    fn passes_samples_through_unchanged() {
        let input = stereo_sine(440.0, 256, 0.9);
        let mut stream = analyser(input.clone(), 128, 16);
        let mut output = Vec::new();
        let mut block = vec![0; 256];
        while stream.read(&mut block) == block.len() {
            output.extend_from_slice(&block);
        }
        assert_eq!(output, input);
    }

    #[test]
    fn overlap_keeps_latest_half() {
        let input: Vec<Sample> = (0..256).map(|n| (n * 100) as Sample).collect();
        let mut stream = analyser(input.clone(), 64, 8);
        let mut block = vec![0; 128];
        stream.read(&mut block);
        stream.read(&mut block);

        for (index, prev) in stream.prev.iter().enumerate() {
            let expected = downmix(input[128 + 2 * index], input[128 + 2 * index + 1]);
            assert_eq!(*prev, expected);
        }
    }

    #[test]
    fn mismatched_block_passes_through_without_analysis() {
        let mut stream = analyser(vec![1_000; 300], 64, 8);
        let spectrum = stream.spectrum();
        let mut block = vec![0; 100];

        assert_eq!(stream.read(&mut block), 100);
        assert!(block.iter().all(|&s| s == 1_000));
        assert_eq!(stream.framing_errors(), 1);
        assert_eq!(spectrum.generation().unwrap(), 0);
    }

    #[test]
    fn previous_generation_is_retained() {
        let mut samples = vec![0; 128];
        samples.extend(stereo_sine(5_000.0, 64, 0.9));
        let mut stream = analyser(samples, 64, 16);
        let spectrum = stream.spectrum();
        let mut block = vec![0; 128];

        stream.read(&mut block);
        let first = spectrum.snapshot().unwrap();
        stream.read(&mut block);

        let mut previous = Vec::new();
        spectrum.copy_previous_bins(&mut previous, 16).unwrap();
        assert_eq!(previous, first.bins);
        assert_eq!(spectrum.generation().unwrap(), 2);
    }

    #[test]
    fn copy_out_pads_when_asking_for_more_bins() {
        let stream = analyser(Vec::new(), 64, 8);
        let mut bins = vec![9.0; 3];
        assert_eq!(stream.spectrum().copy_bins(&mut bins, 12).unwrap(), 8);
        assert_eq!(bins.len(), 12);
        assert!(bins.iter().all(|&b| b == 0.0));
    }

    #[test]
    fn rejects_invalid_shape() {
        let upstream: BoxedStream = Box::new(MemoryStream::default());
        assert!(AnalyserStream::new(upstream, &config(100, 10)).is_err());
    }

    #[test]
    fn db_mapping_is_clamped() {
        assert_eq!(normalised_db(0.0), 0.0);
        assert_eq!(normalised_db(f32::NAN), 0.0);
        assert_eq!(normalised_db(10.0), 1.0);
        assert!((normalised_db(0.1) - 0.8).abs() < 1e-6);
    }
}
