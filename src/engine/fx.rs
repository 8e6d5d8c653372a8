//! Shared reverb/delay sends for the music bus.

use crate::error::GraphError;
use crate::graph::{AudioContext, NodeId};

pub const REVERB_ROOM_SIZE: f64 = 0.85;
pub const REVERB_DAMPING: f64 = 0.4;
pub const DELAY_TIME: f64 = 0.6;
pub const DELAY_FEEDBACK: f64 = 0.35;

/// `input → reverb → reverb_gain → output` and
/// `input → delay → delay_gain → output`, both wet-only.
#[derive(Debug, Clone, PartialEq)]
pub struct FxBus {
    pub input: NodeId,
    pub reverb: NodeId,
    pub reverb_gain: NodeId,
    pub delay: NodeId,
    pub delay_gain: NodeId,
}

impl FxBus {
    pub fn build<C: AudioContext>(
        ctx: &mut C,
        output: NodeId,
        reverb_mix: f64,
        delay_mix: f64,
    ) -> Result<Self, GraphError> {
        let fx = FxBus {
            input: ctx.create_gain(1.0),
            reverb: ctx.create_reverb(REVERB_ROOM_SIZE, REVERB_DAMPING),
            reverb_gain: ctx.create_gain(reverb_mix),
            delay: ctx.create_delay(DELAY_TIME, DELAY_FEEDBACK),
            delay_gain: ctx.create_gain(delay_mix),
        };
        ctx.connect(fx.input, fx.reverb)?;
        ctx.connect(fx.reverb, fx.reverb_gain)?;
        ctx.connect(fx.reverb_gain, output)?;
        ctx.connect(fx.input, fx.delay)?;
        ctx.connect(fx.delay, fx.delay_gain)?;
        ctx.connect(fx.delay_gain, output)?;
        Ok(fx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{AudioBuffer, Param, SoftwareContext};

    #[test]
    fn sends_are_wet_only() {
        let mut ctx = SoftwareContext::new(8000.0);
        ctx.resume();
        let dest = ctx.destination();
        let fx = FxBus::build(&mut ctx, dest, 0.0, 1.0).unwrap();
        assert_eq!(ctx.param_value(fx.delay_gain, Param::Gain), Ok(1.0));

        let mut click = vec![0.0; 8000];
        click[0] = 1.0;
        let src = ctx.create_buffer_source(AudioBuffer::new(click, 8000.0), false);
        ctx.connect(src, fx.input).unwrap();
        ctx.start(src, 0.0).unwrap();

        let (left, _) = ctx.render(8000);
        assert_eq!(left[0], 0.0, "Dry signal must not pass");
        let echo_at = (DELAY_TIME * 8000.0) as usize;
        assert!(left[echo_at].abs() > 0.5);
    }
}
