//! In-place radix-2 FFT over interleaved `[re, im, re, im, ...]` buffers.

use std::f64::consts::PI;

use crate::{PlayerError, Result};

/// Sign convention of the transform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// `X[k] = Σ x[n] e^{-2πikn/N}`
    Forward,
    /// `x[n] = Σ X[k] e^{+2πikn/N}`, unnormalised: divide by `N` to recover
    /// the forward input.
    Inverse,
}

/// Iterative Cooley–Tukey transform of `buffer.len() / 2` complex points.
///
/// The point count must be a power of two.
pub fn transform(buffer: &mut [f32], direction: Direction) -> Result<()> {
    if buffer.len() % 2 != 0 {
        return Err(PlayerError::InvalidInput(
            "fft buffer must hold interleaved re/im pairs",
        ));
    }
    let points = buffer.len() / 2;
    if !points.is_power_of_two() {
        return Err(PlayerError::InvalidInput(
            "fft length must be a power of two",
        ));
    }
    if points == 1 {
        return Ok(());
    }

    bit_reverse(buffer, points);

    let sign = match direction {
        Direction::Forward => -1.0,
        Direction::Inverse => 1.0,
    };

    let mut width = 2;
    while width <= points {
        let half = width / 2;
        let step = PI / half as f64;
        let (wr, wi) = (step.cos(), sign * step.sin());
        // Twiddle recurrence runs in f64 so large windows do not drift.
        let (mut ur, mut ui) = (1.0_f64, 0.0_f64);

        for offset in 0..half {
            let (tw_re, tw_im) = (ur as f32, ui as f32);
            let mut lower = offset;
            while lower < points {
                let p = 2 * lower;
                let q = 2 * (lower + half);
                let tr = buffer[q] * tw_re - buffer[q + 1] * tw_im;
                let ti = buffer[q] * tw_im + buffer[q + 1] * tw_re;
                buffer[q] = buffer[p] - tr;
                buffer[q + 1] = buffer[p + 1] - ti;
                buffer[p] += tr;
                buffer[p + 1] += ti;
                lower += width;
            }

            let next = ur * wr - ui * wi;
            ui = ur * wi + ui * wr;
            ur = next;
        }

        width <<= 1;
    }

    Ok(())
}

fn bit_reverse(buffer: &mut [f32], points: usize) {
    let shift = usize::BITS - points.trailing_zeros();
    for index in 0..points {
        let reversed = index.reverse_bits() >> shift;
        if index < reversed {
            buffer.swap(2 * index, 2 * reversed);
            buffer.swap(2 * index + 1, 2 * reversed + 1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use realfft::RealFftPlanner;

    fn test_signal(points: usize) -> Vec<f32> {
        (0..points)
            .map(|n| {
                let t = n as f32 / points as f32;
                (2.0 * std::f32::consts::PI * 3.0 * t).sin() * 0.7
                    + (2.0 * std::f32::consts::PI * 11.0 * t).cos() * 0.2
                    + ((n * 7919) % 13) as f32 / 13.0 * 0.1
            })
            .collect()
    }

    fn interleave(real: &[f32]) -> Vec<f32> {
        real.iter().flat_map(|&re| [re, 0.0]).collect()
    }

    #[test]
    fn forward_then_inverse_reconstructs_input() {
        for power in 0..=12 {
            let points = 1usize << power;
            let original = interleave(&test_signal(points));
            let mut buffer = original.clone();

            transform(&mut buffer, Direction::Forward).unwrap();
            transform(&mut buffer, Direction::Inverse).unwrap();

            let scale = 1.0 / points as f32;
            for (index, (got, want)) in buffer.iter().zip(&original).enumerate() {
                assert!(
                    (got * scale - want).abs() < 1e-4,
                    "size {points}, index {index}: {} vs {want}",
                    got * scale
                );
            }
        }
    }

    #[test]
    fn forward_matches_realfft() {
        let points = 1024;
        let signal = test_signal(points);

        let mut planner = RealFftPlanner::<f32>::new();
        let plan = planner.plan_fft_forward(points);
        let mut input = signal.clone();
        let mut spectrum = plan.make_output_vec();
        plan.process(&mut input, &mut spectrum).unwrap();

        let mut buffer = interleave(&signal);
        transform(&mut buffer, Direction::Forward).unwrap();

        for (bin, expected) in spectrum.iter().enumerate() {
            let re = buffer[2 * bin];
            let im = buffer[2 * bin + 1];
            assert!((re - expected.re).abs() < 1e-2, "bin {bin} re {re} vs {}", expected.re);
            assert!((im - expected.im).abs() < 1e-2, "bin {bin} im {im} vs {}", expected.im);
        }
    }

    #[test]
    fn impulse_has_flat_spectrum() {
        let mut buffer = vec![0.0; 2 * 16];
        buffer[0] = 1.0;
        transform(&mut buffer, Direction::Forward).unwrap();

        for pair in buffer.chunks(2) {
            assert!((pair[0] - 1.0).abs() < 1e-6);
            assert!(pair[1].abs() < 1e-6);
        }
    }

    #[test]
    fn rejects_non_power_of_two() {
        let mut buffer = vec![0.0; 2 * 12];
        assert!(matches!(
            transform(&mut buffer, Direction::Forward),
            Err(PlayerError::InvalidInput(_))
        ));

        let mut odd = vec![0.0; 5];
        assert!(transform(&mut odd, Direction::Inverse).is_err());

        let mut empty: Vec<f32> = Vec::new();
        assert!(transform(&mut empty, Direction::Forward).is_err());
    }
}
