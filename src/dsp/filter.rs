//! Biquad filter with WebAudio BiquadFilterNode coefficients. Noise
//! coloring is the main user.

use std::f64::consts::PI;

use serde::{Deserialize, Serialize};

/// Response shape, named as WebAudio names them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterType {
    Lowpass,
    Highpass,
    Bandpass,
    Notch,
    Allpass,
}

/// Second-order IIR section in transposed direct form II.
/// Coefficient formulas from the Audio EQ
/// Cookbook (Robert Bristow-Johnson).
#[derive(Debug, Clone)]
pub struct BiquadFilter {
    pub filter_type: FilterType,
    frequency: f64,
    q: f64,

    b0: f64,
    b1: f64,
    b2: f64,
    a1: f64,
    a2: f64,

    z1: f64,
    z2: f64,

    sample_rate: f64,
}

impl BiquadFilter {
    pub fn new(filter_type: FilterType, frequency: f64, q: f64, sample_rate: f64) -> Self {
        let mut f = BiquadFilter {
            filter_type,
            frequency,
            q,
            b0: 1.0,
            b1: 0.0,
            b2: 0.0,
            a1: 0.0,
            a2: 0.0,
            z1: 0.0,
            z2: 0.0,
            sample_rate,
        };
        f.update_coefficients();
        f
    }

    pub fn frequency(&self) -> f64 {
        self.frequency
    }

    pub fn q(&self) -> f64 {
        self.q
    }

    /// Retune the filter. Coefficients are only recomputed when a value
    /// actually changes, so this is cheap to call once per render block.
    pub fn set_params(&mut self, frequency: f64, q: f64) {
        if frequency != self.frequency || q != self.q {
            self.frequency = frequency;
            self.q = q;
            self.update_coefficients();
        }
    }

    fn update_coefficients(&mut self) {
        let nyquist = self.sample_rate / 2.0;
        let freq = self.frequency.clamp(1.0, nyquist - 1.0);
        let q = self.q.max(1e-4);
        let w0 = 2.0 * PI * freq / self.sample_rate;
        let cos_w0 = w0.cos();
        let alpha = w0.sin() / (2.0 * q);

        let (b0, b1, b2) = match self.filter_type {
            FilterType::Lowpass => {
                let b1 = 1.0 - cos_w0;
                (b1 / 2.0, b1, b1 / 2.0)
            }
            FilterType::Highpass => {
                let b0 = (1.0 + cos_w0) / 2.0;
                (b0, -(1.0 + cos_w0), b0)
            }
            FilterType::Bandpass => (alpha, 0.0, -alpha),
            FilterType::Notch => (1.0, -2.0 * cos_w0, 1.0),
            FilterType::Allpass => (1.0 - alpha, -2.0 * cos_w0, 1.0 + alpha),
        };
        let a0 = 1.0 + alpha;
        let a1 = -2.0 * cos_w0;
        let a2 = 1.0 - alpha;

        self.b0 = b0 / a0;
        self.b1 = b1 / a0;
        self.b2 = b2 / a0;
        self.a1 = a1 / a0;
        self.a2 = a2 / a0;
    }

    #[inline]
    pub fn process(&mut self, input: f64) -> f64 {
        let output = self.b0 * input + self.z1;
        self.z1 = self.b1 * input - self.a1 * output + self.z2;
        self.z2 = self.b2 * input - self.a2 * output;
        output
    }

    pub fn reset(&mut self) {
        self.z1 = 0.0;
        self.z2 = 0.0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn steady_amplitude(f: &mut BiquadFilter, freq: f64, sample_rate: f64) -> f64 {
        let mut max_out = 0.0_f64;
        for i in 0..8820 {
            let t = i as f64 / sample_rate;
            let out = f.process((2.0 * PI * freq * t).sin());
            if i > 4410 {
                max_out = max_out.max(out.abs());
            }
        }
        max_out
    }

    #[test]
    fn brown_shaping_passes_dc() {
        let mut f = BiquadFilter::new(FilterType::Lowpass, 300.0, 1.0, 44100.0);
        let settled = (0..5000).map(|_| f.process(1.0)).last().unwrap_or_default();
        assert!((settled - 1.0).abs() < 0.001, "settled at {settled}");
    }

    #[test]
    fn highpass_settles_to_zero_on_dc() {
        let mut f = BiquadFilter::new(FilterType::Highpass, 1000.0, 0.707, 44100.0);
        let settled = (0..1000).map(|_| f.process(1.0)).last().unwrap_or_default();
        assert!(settled.abs() < 0.001, "settled at {settled}");
    }

    #[test]
    fn brown_shaping_removes_hiss() {
        let mut f = BiquadFilter::new(FilterType::Lowpass, 300.0, 1.0, 44100.0);
        let amp = steady_amplitude(&mut f, 10000.0, 44100.0);
        assert!(amp < 0.01, "10 kHz came through at {amp}");
    }

    #[test]
    fn allpass_keeps_magnitude() {
        for freq in [100.0, 1000.0, 8000.0] {
            let mut f = BiquadFilter::new(FilterType::Allpass, 1000.0, 0.707, 44100.0);
            let amp = steady_amplitude(&mut f, freq, 44100.0);
            assert!((amp - 1.0).abs() < 0.02, "Allpass should be flat at {freq}Hz, got {amp}");
        }
    }

    #[test]
    fn set_params_retunes() {
        let mut f = BiquadFilter::new(FilterType::Lowpass, 20000.0, 0.707, 44100.0);
        let open = steady_amplitude(&mut f, 5000.0, 44100.0);
        f.reset();
        f.set_params(200.0, 0.707);
        let closed = steady_amplitude(&mut f, 5000.0, 44100.0);
        assert!(open > 0.9);
        assert!(closed < 0.05);
        assert_eq!(f.frequency(), 200.0);
    }

    #[test]
    fn impulse_train_stays_finite() {
        let mut f = BiquadFilter::new(FilterType::Bandpass, 1000.0, 0.707, 44100.0);
        let impulses = (0..10000).map(|i| if i % 100 == 0 { 1.0 } else { 0.0 });
        assert!(impulses.map(|x| f.process(x)).all(f64::is_finite));
    }
}
