//! Spectrum analyser: byte-scaled magnitude spectrum over a sliding window,
//! computed like WebAudio's `AnalyserNode::getByteFrequencyData`.

use std::collections::VecDeque;
use std::f32::consts::PI;
use std::sync::Arc;

use rustfft::num_complex::Complex;
use rustfft::{Fft, FftPlanner};

const MIN_DECIBELS: f32 = -100.0;
const MAX_DECIBELS: f32 = -30.0;
const SMOOTHING: f32 = 0.8;

pub struct SpectrumAnalyser {
    fft: Arc<dyn Fft<f32>>,
    fft_size: usize,
    window: Vec<f32>,
    history: VecDeque<f32>,
    smoothed: Vec<f32>,
    scratch: Vec<Complex<f32>>,
}

impl std::fmt::Debug for SpectrumAnalyser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpectrumAnalyser")
            .field("fft_size", &self.fft_size)
            .finish_non_exhaustive()
    }
}

impl SpectrumAnalyser {
    /// `fft_size` is rounded up to a power of two, minimum 32.
    pub fn new(fft_size: usize) -> Self {
        let fft_size = fft_size.max(32).next_power_of_two();
        let fft = FftPlanner::<f32>::new().plan_fft_forward(fft_size);
        let window = (0..fft_size)
            .map(|i| {
                let x = i as f32 / fft_size as f32;
                0.42 - 0.5 * (2.0 * PI * x).cos() + 0.08 * (4.0 * PI * x).cos()
            })
            .collect();
        SpectrumAnalyser {
            fft,
            fft_size,
            window,
            history: VecDeque::from(vec![0.0; fft_size]),
            smoothed: vec![0.0; fft_size / 2],
            scratch: vec![Complex::new(0.0, 0.0); fft_size],
        }
    }

    pub fn frequency_bin_count(&self) -> usize {
        self.fft_size / 2
    }

    /// Feed time-domain samples; only the latest `fft_size` are kept.
    pub fn push(&mut self, samples: &[f32]) {
        for &s in samples {
            self.history.pop_front();
            self.history.push_back(s);
        }
    }

    /// Fill `out` with byte-scaled magnitudes, one per bin. Extra entries in
    /// `out` beyond the bin count are zeroed.
    pub fn byte_frequency_data(&mut self, out: &mut [u8]) {
        for (slot, (&s, &w)) in self
            .scratch
            .iter_mut()
            .zip(self.history.iter().zip(self.window.iter()))
        {
            *slot = Complex::new(s * w, 0.0);
        }
        self.fft.process(&mut self.scratch);

        let scale = 1.0 / self.fft_size as f32;
        let bins = self.frequency_bin_count();
        for (k, slot) in out.iter_mut().enumerate() {
            if k >= bins {
                *slot = 0;
                continue;
            }
            let magnitude = self.scratch[k].norm() * scale;
            self.smoothed[k] = SMOOTHING * self.smoothed[k] + (1.0 - SMOOTHING) * magnitude;
            let db = 20.0 * self.smoothed[k].max(1e-12).log10();
            let scaled = 255.0 * (db - MIN_DECIBELS) / (MAX_DECIBELS - MIN_DECIBELS);
            *slot = scaled.clamp(0.0, 255.0) as u8;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn average(bytes: &[u8]) -> f64 {
        bytes.iter().map(|&b| b as f64).sum::<f64>() / bytes.len() as f64
    }

    #[test]
    fn silence_reads_zero() {
        let mut a = SpectrumAnalyser::new(256);
        a.push(&[0.0; 256]);
        let mut out = vec![0u8; a.frequency_bin_count()];
        a.byte_frequency_data(&mut out);
        assert!(out.iter().all(|&b| b == 0));
    }

    #[test]
    fn tone_peaks_in_its_bin() {
        let sample_rate = 8192.0;
        let mut a = SpectrumAnalyser::new(256);
        // 1024 Hz → bin 1024 / (8192 / 256) = 32. Kept quiet so no bin clips at 255.
        let tone: Vec<f32> = (0..256)
            .map(|i| 0.001 * (2.0 * PI * 1024.0 * i as f32 / sample_rate).sin())
            .collect();
        let mut out = vec![0u8; a.frequency_bin_count()];
        for _ in 0..20 {
            a.push(&tone);
            a.byte_frequency_data(&mut out);
        }
        let peak = out
            .iter()
            .enumerate()
            .max_by_key(|&(_, &b)| b)
            .map(|(i, _)| i);
        assert_eq!(peak, Some(32));
    }

    #[test]
    fn louder_input_raises_average() {
        let mut quiet = SpectrumAnalyser::new(512);
        let mut loud = SpectrumAnalyser::new(512);
        let signal: Vec<f32> = (0..512).map(|i| if i % 2 == 0 { 1.0 } else { -1.0 }).collect();
        let soft: Vec<f32> = signal.iter().map(|s| s * 0.001).collect();

        let mut q = vec![0u8; 256];
        let mut l = vec![0u8; 256];
        for _ in 0..10 {
            quiet.push(&soft);
            loud.push(&signal);
            quiet.byte_frequency_data(&mut q);
            loud.byte_frequency_data(&mut l);
        }
        assert!(average(&l) > average(&q));
    }

    #[test]
    fn size_rounds_to_power_of_two() {
        assert_eq!(SpectrumAnalyser::new(1000).frequency_bin_count(), 512);
        assert_eq!(SpectrumAnalyser::new(4).frequency_bin_count(), 16);
    }
}
