//! Signal graph: the platform audio API seen through one narrow trait.
//!
//! The engine, synthesis voices and the adaptive monitor only ever talk to
//! an [`AudioContext`]: create a node, connect it, start/stop it, schedule a
//! parameter ramp against the audio clock. [`SoftwareContext`] is the
//! pure-Rust implementation used for offline rendering, device playback and
//! tests; a browser build binds the same trait to WebAudio.

pub mod software;

pub use software::SoftwareContext;

use std::fmt;
use std::sync::Arc;

use crate::dsp::filter::FilterType;
use crate::dsp::oscillator::Waveform;
use crate::dsp::param::Automation;
use crate::error::GraphError;
use crate::microphone::MicrophoneStream;

/// Opaque handle to a node living inside an [`AudioContext`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub(crate) u32);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node#{}", self.0)
    }
}

/// Lifecycle of the processing context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextState {
    Suspended,
    Running,
    Closed,
}

/// What a node is. Used for validation and introspection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeKind {
    Destination,
    Oscillator,
    Gain,
    Biquad,
    StereoPanner,
    BufferSource,
    Delay,
    Reverb,
    Analyser,
    MicrophoneInput,
}

impl NodeKind {
    /// Source nodes must be started and stopped explicitly.
    pub fn is_scheduled_source(self) -> bool {
        matches!(self, NodeKind::Oscillator | NodeKind::BufferSource)
    }
}

/// An automatable parameter on a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Param {
    Frequency,
    Detune,
    Gain,
    Q,
    Pan,
}

/// A mono sample buffer played by a buffer source node.
#[derive(Debug, Clone)]
pub struct AudioBuffer {
    pub sample_rate: f64,
    pub samples: Arc<[f32]>,
}

impl AudioBuffer {
    pub fn new(samples: Vec<f32>, sample_rate: f64) -> Self {
        AudioBuffer {
            sample_rate,
            samples: samples.into(),
        }
    }

    pub fn duration(&self) -> f64 {
        self.samples.len() as f64 / self.sample_rate
    }
}

/// The operations the soundscape needs from an audio backend.
///
/// Times are seconds on the context's own clock ([`current_time`]), never
/// wall-clock time.
///
/// [`current_time`]: AudioContext::current_time
pub trait AudioContext: Send + 'static {
    fn current_time(&self) -> f64;
    fn sample_rate(&self) -> f64;
    fn state(&self) -> ContextState;
    fn resume(&mut self);
    fn suspend(&mut self);
    /// Shut the context down for good. Later graph edits fail with
    /// [`GraphError::Closed`].
    fn close(&mut self);
    fn destination(&self) -> NodeId;

    fn create_oscillator(&mut self, waveform: Waveform, frequency: f64, detune: f64) -> NodeId;
    fn create_gain(&mut self, gain: f64) -> NodeId;
    fn create_biquad(&mut self, filter: FilterType, frequency: f64, q: f64) -> NodeId;
    fn create_stereo_panner(&mut self, pan: f64) -> NodeId;
    fn create_buffer_source(&mut self, buffer: AudioBuffer, looping: bool) -> NodeId;
    /// A wet-only feedback delay line.
    fn create_delay(&mut self, delay_time: f64, feedback: f64) -> NodeId;
    /// A wet-only stereo reverb.
    fn create_reverb(&mut self, room_size: f64, damping: f64) -> NodeId;
    fn create_analyser(&mut self, fft_size: usize) -> NodeId;
    fn create_media_stream_source(&mut self, stream: &MicrophoneStream) -> NodeId;

    /// Route `from`'s output into `to`. Rejects connections that would form a cycle.
    fn connect(&mut self, from: NodeId, to: NodeId) -> Result<(), GraphError>;
    /// Remove every connection touching `node` and release it.
    fn disconnect(&mut self, node: NodeId) -> Result<(), GraphError>;
    fn start(&mut self, node: NodeId, when: f64) -> Result<(), GraphError>;
    fn stop(&mut self, node: NodeId, when: f64) -> Result<(), GraphError>;

    fn schedule(&mut self, node: NodeId, param: Param, automation: Automation) -> Result<(), GraphError>;
    /// The parameter's value at the current time, automation included.
    fn param_value(&self, node: NodeId, param: Param) -> Result<f64, GraphError>;

    fn byte_frequency_data(&mut self, node: NodeId, out: &mut [u8]) -> Result<(), GraphError>;
}
