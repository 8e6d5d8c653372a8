//! Reverb: Schroeder/Freeverb-style algorithmic reverb used as an effect send.
//!
//! Parallel damped comb filters feed a series of allpass diffusers. The
//! output is wet only: the send gain in front of it sets how much of the
//! music bus reaches the room.

#[derive(Debug, Clone)]
struct CombFilter {
    buffer: Vec<f32>,
    index: usize,
    feedback: f32,
    damp: f32,
    filterstore: f32,
}

impl CombFilter {
    fn new(size: usize) -> Self {
        Self {
            buffer: vec![0.0; size.max(1)],
            index: 0,
            feedback: 0.84,
            damp: 0.2,
            filterstore: 0.0,
        }
    }

    #[inline]
    fn process(&mut self, input: f32) -> f32 {
        let output = self.buffer[self.index];
        self.filterstore = output * (1.0 - self.damp) + self.filterstore * self.damp;
        self.buffer[self.index] = input + self.filterstore * self.feedback;
        self.index = (self.index + 1) % self.buffer.len();
        output
    }
}

#[derive(Debug, Clone)]
struct AllpassFilter {
    buffer: Vec<f32>,
    index: usize,
}

impl AllpassFilter {
    const FEEDBACK: f32 = 0.5;

    fn new(size: usize) -> Self {
        Self {
            buffer: vec![0.0; size.max(1)],
            index: 0,
        }
    }

    #[inline]
    fn process(&mut self, input: f32) -> f32 {
        let bufout = self.buffer[self.index];
        self.buffer[self.index] = input + bufout * Self::FEEDBACK;
        self.index = (self.index + 1) % self.buffer.len();
        bufout - input
    }
}

// Tuning constants (scaled for 44100 Hz sample rate)
const COMB_TUNING: [usize; 8] = [1116, 1188, 1277, 1356, 1422, 1491, 1557, 1617];
const ALLPASS_TUNING: [usize; 4] = [556, 441, 341, 225];
const STEREO_SPREAD: usize = 23;
const INPUT_GAIN: f32 = 0.015;

/// A stereo algorithmic reverb, fully wet.
#[derive(Debug, Clone)]
pub struct Reverb {
    comb_l: Vec<CombFilter>,
    comb_r: Vec<CombFilter>,
    allpass_l: Vec<AllpassFilter>,
    allpass_r: Vec<AllpassFilter>,
    room_size: f64,
    damping: f64,
}

impl Reverb {
    /// `room_size` and `damping` are both in `[0, 1]`; larger rooms ring
    /// longer, more damping darkens the tail.
    pub fn new(sample_rate: f64, room_size: f64, damping: f64) -> Self {
        let scale = sample_rate / 44100.0;
        let sized = |t: usize, spread: usize| ((t as f64) * scale) as usize + spread;

        let mut reverb = Self {
            comb_l: COMB_TUNING.iter().map(|&t| CombFilter::new(sized(t, 0))).collect(),
            comb_r: COMB_TUNING.iter().map(|&t| CombFilter::new(sized(t, STEREO_SPREAD))).collect(),
            allpass_l: ALLPASS_TUNING.iter().map(|&t| AllpassFilter::new(sized(t, 0))).collect(),
            allpass_r: ALLPASS_TUNING.iter().map(|&t| AllpassFilter::new(sized(t, STEREO_SPREAD))).collect(),
            room_size: room_size.clamp(0.0, 1.0),
            damping: damping.clamp(0.0, 1.0),
        };
        reverb.update_parameters();
        reverb
    }

    fn update_parameters(&mut self) {
        let feedback = (self.room_size * 0.28 + 0.7) as f32;
        let damp = self.damping as f32;
        for comb in self.comb_l.iter_mut().chain(self.comb_r.iter_mut()) {
            comb.feedback = feedback;
            comb.damp = damp;
        }
    }

    /// Process one stereo frame, returning the reverberated signal.
    #[inline]
    pub fn process(&mut self, left: f32, right: f32) -> (f32, f32) {
        let input = (left + right) * INPUT_GAIN;

        let mut out_l: f32 = self.comb_l.iter_mut().map(|c| c.process(input)).sum();
        let mut out_r: f32 = self.comb_r.iter_mut().map(|c| c.process(input)).sum();

        for allpass in &mut self.allpass_l {
            out_l = allpass.process(out_l);
        }
        for allpass in &mut self.allpass_r {
            out_r = allpass.process(out_r);
        }

        (out_l, out_r)
    }

    /// Process a block of stereo audio in-place.
    pub fn process_block(&mut self, left: &mut [f32], right: &mut [f32]) {
        for (l, r) in left.iter_mut().zip(right.iter_mut()) {
            let (out_l, out_r) = self.process(*l, *r);
            *l = out_l;
            *r = out_r;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn silent_input_stays_silent() {
        let mut reverb = Reverb::new(44100.0, 0.85, 0.4);
        for _ in 0..1000 {
            let (l, r) = reverb.process(0.0, 0.0);
            assert_eq!((l, r), (0.0, 0.0));
        }
    }

    #[test]
    fn impulse_produces_tail() {
        let mut reverb = Reverb::new(44100.0, 0.5, 0.5);
        reverb.process(1.0, 1.0);

        let found = (0..5000).any(|_| {
            let (l, r) = reverb.process(0.0, 0.0);
            l.abs() > 0.001 || r.abs() > 0.001
        });
        assert!(found, "Reverb should ring after an impulse");
    }

    #[test]
    fn tail_decays() {
        let mut reverb = Reverb::new(44100.0, 0.3, 0.5);
        reverb.process(1.0, 1.0);
        for _ in 0..2000 {
            reverb.process(0.0, 0.0);
        }

        let mut late_max = 0.0f32;
        for _ in 0..44100 {
            reverb.process(0.0, 0.0);
        }
        for _ in 0..4410 {
            let (l, r) = reverb.process(0.0, 0.0);
            late_max = late_max.max(l.abs().max(r.abs()));
        }
        assert!(late_max < 0.01, "Reverb should decay over time, got {late_max}");
    }

    #[test]
    fn stereo_channels_differ() {
        let mut reverb = Reverb::new(44100.0, 0.85, 0.4);
        reverb.process(1.0, 1.0);
        let differs = (0..5000).any(|_| {
            let (l, r) = reverb.process(0.0, 0.0);
            (l - r).abs() > 1e-6
        });
        assert!(differs, "Spread comb lengths should decorrelate left and right");
    }
}
