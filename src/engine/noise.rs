//! Colored noise: a looping buffer of uniform white noise shaped by one
//! biquad per color.

use rand::Rng;

use crate::dsp::filter::FilterType;
use crate::dsp::param::Automation;
use crate::error::GraphError;
use crate::graph::{AudioBuffer, AudioContext, NodeId, Param};
use crate::model::NoiseType;

/// Filter `(type, cutoff Hz, Q)` that gives each noise color its tilt.
pub fn filter_for(noise_type: NoiseType) -> (FilterType, f64, f64) {
    match noise_type {
        // All-pass keeps white noise flat.
        NoiseType::White => (FilterType::Allpass, 1000.0, 0.707),
        NoiseType::Grey => (FilterType::Lowpass, 1000.0, 0.5),
        NoiseType::Brown => (FilterType::Lowpass, 300.0, 1.0),
    }
}

/// `seconds` of uniform noise in `[-1, 1)`.
pub fn noise_buffer<R: Rng + ?Sized>(rng: &mut R, seconds: f64, sample_rate: f64) -> AudioBuffer {
    let len = (seconds * sample_rate).round().max(1.0) as usize;
    let samples = (0..len).map(|_| rng.gen_range(-1.0f32..1.0)).collect();
    AudioBuffer::new(samples, sample_rate)
}

/// One running noise chain: buffer source → filter → gain.
#[derive(Debug, Clone, PartialEq)]
pub struct NoiseSource {
    pub noise_type: NoiseType,
    pub source: NodeId,
    pub filter: NodeId,
    pub gain: NodeId,
}

impl NoiseSource {
    /// Build and start the chain at `now`, fading in to `volume` with
    /// `time_constant`, routed into `output`.
    pub fn start<C: AudioContext>(
        ctx: &mut C,
        output: NodeId,
        noise_type: NoiseType,
        volume: f64,
        buffer_seconds: f64,
        time_constant: f64,
    ) -> Result<Self, GraphError> {
        let now = ctx.current_time();
        let buffer = noise_buffer(&mut rand::thread_rng(), buffer_seconds, ctx.sample_rate());
        let (filter_type, frequency, q) = filter_for(noise_type);

        let noise = NoiseSource {
            noise_type,
            source: ctx.create_buffer_source(buffer, true),
            filter: ctx.create_biquad(filter_type, frequency, q),
            gain: ctx.create_gain(0.0),
        };
        if let Err(e) = noise.wire(ctx, output, volume, now, time_constant) {
            noise.release(ctx);
            return Err(e);
        }
        Ok(noise)
    }

    fn wire<C: AudioContext>(
        &self,
        ctx: &mut C,
        output: NodeId,
        volume: f64,
        now: f64,
        time_constant: f64,
    ) -> Result<(), GraphError> {
        ctx.connect(self.source, self.filter)?;
        ctx.connect(self.filter, self.gain)?;
        ctx.connect(self.gain, output)?;
        ctx.schedule(self.gain, Param::Gain, Automation::SetValueAtTime { value: 0.0, time: now })?;
        ctx.schedule(
            self.gain,
            Param::Gain,
            Automation::SetTargetAtTime {
                target: volume,
                start: now,
                time_constant,
            },
        )?;
        ctx.start(self.source, now)
    }

    pub fn stop<C: AudioContext>(&self, ctx: &mut C, when: f64) -> Result<(), GraphError> {
        ctx.stop(self.source, when)
    }

    pub fn nodes(&self) -> [NodeId; 3] {
        [self.source, self.filter, self.gain]
    }

    pub fn release<C: AudioContext>(&self, ctx: &mut C) {
        for node in self.nodes() {
            let _ = ctx.disconnect(node);
        }
    }
}
