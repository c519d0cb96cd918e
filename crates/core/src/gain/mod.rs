use std::{
    fmt,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
};

use crate::stream::{read_upstream, AudioStream, BoxedStream, Sample};

/// Live-adjustable gain shared between the control plane and the audio path.
#[derive(Clone)]
pub struct VolumeControl {
    bits: Arc<AtomicU32>,
}

impl VolumeControl {
    pub fn new(volume: f32) -> Self {
        Self {
            bits: Arc::new(AtomicU32::new(clamp_volume(volume).to_bits())),
        }
    }

    /// Stores `volume` clamped to `[0, 1]`; NaN mutes.
    pub fn set(&self, volume: f32) {
        self.bits
            .store(clamp_volume(volume).to_bits(), Ordering::Relaxed);
    }

    pub fn get(&self) -> f32 {
        f32::from_bits(self.bits.load(Ordering::Relaxed))
    }
}

impl Default for VolumeControl {
    fn default() -> Self {
        Self::new(1.0)
    }
}

impl fmt::Debug for VolumeControl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VolumeControl")
            .field("volume", &self.get())
            .finish()
    }
}

fn clamp_volume(volume: f32) -> f32 {
    if volume.is_nan() {
        0.0
    } else {
        volume.clamp(0.0, 1.0)
    }
}

/// Applies the current [`VolumeControl`] value to every sample read.
///
/// The gain is sampled once per `read`; a change lands on the next block
/// without interpolation.
pub struct GainStream {
    upstream: Option<BoxedStream>,
    volume: VolumeControl,
}

impl GainStream {
    pub fn new(upstream: BoxedStream, volume: VolumeControl) -> Self {
        Self {
            upstream: Some(upstream),
            volume,
        }
    }

    pub fn volume(&self) -> VolumeControl {
        self.volume.clone()
    }
}

impl AudioStream for GainStream {
    fn read(&mut self, buffer: &mut [Sample]) -> usize {
        let produced = read_upstream(self.upstream.as_mut(), buffer);
        let gain = self.volume.get();
        for sample in &mut buffer[..produced] {
            *sample = (*sample as f32 * gain).round() as Sample;
        }
        produced
    }

    fn start(&mut self) -> bool {
        self.upstream.as_mut().map(|u| u.start()).unwrap_or(false)
    }
}

impl fmt::Debug for GainStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GainStream")
            .field("volume", &self.volume)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::MemoryStream;

    fn gain_over(samples: Vec<Sample>, volume: f32) -> GainStream {
        GainStream::new(Box::new(MemoryStream::new(samples)), VolumeControl::new(volume))
    }

    #[test]
    fn scales_and_rounds_every_sample() {
        let input = vec![1_001, -1_001, 32_767, -32_768, 3];
        let mut stream = gain_over(input.clone(), 0.5);
        let mut block = vec![0; 5];
        assert_eq!(stream.read(&mut block), 5);

        let expected: Vec<Sample> = input
            .iter()
            .map(|&s| (s as f32 * 0.5).round() as Sample)
            .collect();
        assert_eq!(block, expected);
        assert_eq!(block[0], 501);
        assert_eq!(block[1], -501);
    }

    #[test]
    fn clamps_out_of_range_volume() {
        let volume = VolumeControl::new(1.7);
        assert_eq!(volume.get(), 1.0);
        volume.set(-0.3);
        assert_eq!(volume.get(), 0.0);
        volume.set(f32::NAN);
        assert_eq!(volume.get(), 0.0);

        let mut stream = gain_over(vec![12_345; 4], 4.0);
        let mut block = [0; 4];
        stream.read(&mut block);
        assert_eq!(block, [12_345; 4]);
    }

    #[test]
    fn volume_change_applies_to_next_block() {
        let mut stream = gain_over(vec![1_000; 8], 1.0);
        let volume = stream.volume();
        let mut block = [0; 4];

        stream.read(&mut block);
        assert_eq!(block, [1_000; 4]);

        volume.set(0.25);
        stream.read(&mut block);
        assert_eq!(block, [250; 4]);
    }

    #[test]
    fn leaves_unproduced_tail_alone() {
        let mut stream = gain_over(vec![100; 2], 0.5);
        let mut block = [7; 4];
        assert_eq!(stream.read(&mut block), 2);
        assert_eq!(block, [50, 50, 7, 7]);
    }
}
