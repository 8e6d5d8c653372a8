//! Binaural pair: `carrier` in the left ear, `carrier + beat` in the right.

use crate::dsp::oscillator::Waveform;
use crate::dsp::param::Automation;
use crate::error::GraphError;
use crate::graph::{AudioContext, NodeId, Param};

#[derive(Debug, Clone, PartialEq)]
pub struct BinauralPair {
    pub carrier: f64,
    pub beat: f64,
    pub left: NodeId,
    pub right: NodeId,
    left_pan: NodeId,
    right_pan: NodeId,
    pub gain: NodeId,
}

impl BinauralPair {
    /// Build and start both tones at `now`, fading in to `volume`.
    pub fn start<C: AudioContext>(
        ctx: &mut C,
        output: NodeId,
        carrier: f64,
        beat: f64,
        volume: f64,
        time_constant: f64,
    ) -> Result<Self, GraphError> {
        let now = ctx.current_time();
        let pair = BinauralPair {
            carrier,
            beat,
            left: ctx.create_oscillator(Waveform::Sine, carrier, 0.0),
            right: ctx.create_oscillator(Waveform::Sine, carrier + beat, 0.0),
            left_pan: ctx.create_stereo_panner(-1.0),
            right_pan: ctx.create_stereo_panner(1.0),
            gain: ctx.create_gain(0.0),
        };
        if let Err(e) = pair.wire(ctx, output, volume, now, time_constant) {
            pair.release(ctx);
            return Err(e);
        }
        Ok(pair)
    }

    fn wire<C: AudioContext>(
        &self,
        ctx: &mut C,
        output: NodeId,
        volume: f64,
        now: f64,
        time_constant: f64,
    ) -> Result<(), GraphError> {
        ctx.connect(self.left, self.left_pan)?;
        ctx.connect(self.right, self.right_pan)?;
        ctx.connect(self.left_pan, self.gain)?;
        ctx.connect(self.right_pan, self.gain)?;
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
        ctx.start(self.left, now)?;
        ctx.start(self.right, now)
    }

    pub fn stop<C: AudioContext>(&self, ctx: &mut C, when: f64) -> Result<(), GraphError> {
        ctx.stop(self.left, when)?;
        ctx.stop(self.right, when)
    }

    pub fn nodes(&self) -> [NodeId; 5] {
        [self.left, self.right, self.left_pan, self.right_pan, self.gain]
    }

    pub fn release<C: AudioContext>(&self, ctx: &mut C) {
        for node in self.nodes() {
            let _ = ctx.disconnect(node);
        }
    }
}
