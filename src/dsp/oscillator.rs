//! Oscillator source. Square and sawtooth are band-limited with PolyBLEP;
//! the sleep tones themselves only ever use sine and triangle.

use std::f64::consts::PI;

use serde::{Deserialize, Serialize};

/// Oscillator shape, named as WebAudio names them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Waveform {
    Sine,
    Square,
    Sawtooth,
    Triangle,
}

/// A band-limited oscillator. Phase starts at zero, so every freshly
/// created oscillator begins on a zero crossing.
#[derive(Debug, Clone)]
pub struct Oscillator {
    pub waveform: Waveform,
    pub frequency: f64,
    /// Cents.
    pub detune: f64,
    phase: f64,
    sample_rate: f64,
}

impl Oscillator {
    pub fn new(waveform: Waveform, frequency: f64, sample_rate: f64) -> Self {
        Oscillator {
            waveform,
            frequency,
            detune: 0.0,
            phase: 0.0,
            sample_rate,
        }
    }

    /// Frequency after detune.
    pub fn effective_freq(&self) -> f64 {
        self.frequency * 2f64.powf(self.detune / 1200.0)
    }

    pub fn next_sample(&mut self) -> f64 {
        let inc = self.effective_freq() / self.sample_rate;
        let sample = match self.waveform {
            Waveform::Sine => (2.0 * PI * self.phase).sin(),
            Waveform::Sawtooth => 2.0 * self.phase - 1.0 - poly_blep(self.phase, inc),
            Waveform::Square => {
                let naive = if self.phase < 0.5 { 1.0 } else { -1.0 };
                naive + poly_blep(self.phase, inc) - poly_blep((self.phase + 0.5) % 1.0, inc)
            }
            // Piecewise linear: -1→+1 over the first half, +1→-1 over the second.
            Waveform::Triangle => {
                if self.phase < 0.5 {
                    4.0 * self.phase - 1.0
                } else {
                    3.0 - 4.0 * self.phase
                }
            }
        };

        self.phase += inc;
        if self.phase >= 1.0 {
            self.phase -= self.phase.floor();
        }

        sample
    }
}

/// Band-limited step correction for a discontinuity at phase 0, given
/// phase `t` in [0, 1) and per-sample increment `dt`.
fn poly_blep(t: f64, dt: f64) -> f64 {
    match t {
        t if t < dt => {
            let x = t / dt;
            -x * x + 2.0 * x - 1.0
        }
        t if t > 1.0 - dt => {
            let x = (t - 1.0) / dt;
            x * x + 2.0 * x + 1.0
        }
        _ => 0.0,
    }
}
