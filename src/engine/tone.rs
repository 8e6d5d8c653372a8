//! Tone voices: one note event becomes two detuned, panned, enveloped
//! oscillators feeding the music bus.

use crate::dsp::oscillator::Waveform;
use crate::dsp::param::Automation;
use crate::error::GraphError;
use crate::graph::{AudioContext, NodeId, Param};
use crate::model::NoteEvent;

/// Used when a pitch name cannot be parsed (C4).
pub const FALLBACK_FREQUENCY: f64 = 261.63;

/// Detune of the second voice, in cents.
pub const CHORUS_DETUNE_CENTS: f64 = 8.0;

/// Fraction of the note spent in attack, and again in release.
const RAMP_FRACTION: f64 = 0.3;

struct VoiceShape {
    waveform: Waveform,
    detune: f64,
    peak: f64,
    pan: f64,
}

const VOICE_A: VoiceShape = VoiceShape {
    waveform: Waveform::Sine,
    detune: 0.0,
    peak: 0.25,
    pan: -0.3,
};

const VOICE_B: VoiceShape = VoiceShape {
    waveform: Waveform::Triangle,
    detune: CHORUS_DETUNE_CENTS,
    peak: 0.12,
    pan: 0.3,
};

/// Parse a note name (e.g. "C4", "F#3", "Bb5") into a MIDI note number.
pub fn note_to_midi(note: &str) -> Option<i32> {
    let mut chars = note.trim().chars();
    let mut semitone = match chars.next()?.to_ascii_uppercase() {
        'C' => 0,
        'D' => 2,
        'E' => 4,
        'F' => 5,
        'G' => 7,
        'A' => 9,
        'B' => 11,
        _ => return None,
    };

    let rest = chars.as_str();
    let octave_str = if let Some(r) = rest.strip_prefix('#') {
        semitone += 1;
        r
    } else if let Some(r) = rest.strip_prefix('b') {
        semitone -= 1;
        r
    } else {
        rest
    };

    let octave: i32 = octave_str.parse().ok()?;
    // C4 = 60
    Some((octave + 1) * 12 + semitone)
}

/// 12-TET, A4 = 440 Hz.
pub fn midi_to_frequency(midi: i32) -> f64 {
    440.0 * 2f64.powf((midi as f64 - 69.0) / 12.0)
}

/// Frequency of a pitch name; unknown names give [`FALLBACK_FREQUENCY`].
pub fn pitch_to_frequency(pitch: &str) -> f64 {
    note_to_midi(pitch).map_or(FALLBACK_FREQUENCY, midi_to_frequency)
}

/// The nodes of one scheduled voice. Released once the note has ended.
#[derive(Debug, Clone, PartialEq)]
pub struct ToneVoice {
    pub oscillator: NodeId,
    pub envelope: NodeId,
    pub panner: NodeId,
    /// Audio-clock time at which the voice falls silent.
    pub end: f64,
}

impl ToneVoice {
    pub fn nodes(&self) -> [NodeId; 3] {
        [self.oscillator, self.envelope, self.panner]
    }

    /// Silence from `when` on, even if the note has not finished.
    pub fn stop<C: AudioContext>(&self, ctx: &mut C, when: f64) -> Result<(), GraphError> {
        ctx.stop(self.oscillator, when)
    }

    pub fn release<C: AudioContext>(&self, ctx: &mut C) {
        for node in self.nodes() {
            // Already gone is fine.
            let _ = ctx.disconnect(node);
        }
    }
}

/// Schedule `note` relative to `segment_start` on the audio clock, routed
/// into `bus`. Returns the two voices.
pub fn schedule_note<C: AudioContext>(
    ctx: &mut C,
    bus: NodeId,
    note: &NoteEvent,
    segment_start: f64,
) -> Result<[ToneVoice; 2], GraphError> {
    let frequency = pitch_to_frequency(&note.pitch);
    let start = segment_start + note.start_time.max(0.0);
    let duration = note.duration.max(0.0);
    let velocity = note.velocity.clamp(0.0, 1.0);

    let a = schedule_voice(ctx, bus, &VOICE_A, frequency, velocity, start, duration)?;
    let b = schedule_voice(ctx, bus, &VOICE_B, frequency, velocity, start, duration)?;
    Ok([a, b])
}

fn schedule_voice<C: AudioContext>(
    ctx: &mut C,
    bus: NodeId,
    shape: &VoiceShape,
    frequency: f64,
    velocity: f64,
    start: f64,
    duration: f64,
) -> Result<ToneVoice, GraphError> {
    let oscillator = ctx.create_oscillator(shape.waveform, frequency, shape.detune);
    let envelope = ctx.create_gain(0.0);
    let panner = ctx.create_stereo_panner(shape.pan);
    let voice = ToneVoice {
        oscillator,
        envelope,
        panner,
        end: start + duration,
    };

    if let Err(e) = wire_voice(ctx, &voice, bus, shape.peak * velocity, start, duration) {
        voice.release(ctx);
        return Err(e);
    }
    Ok(voice)
}

fn wire_voice<C: AudioContext>(
    ctx: &mut C,
    voice: &ToneVoice,
    bus: NodeId,
    peak: f64,
    start: f64,
    duration: f64,
) -> Result<(), GraphError> {
    ctx.connect(voice.oscillator, voice.envelope)?;
    ctx.connect(voice.envelope, voice.panner)?;
    ctx.connect(voice.panner, bus)?;

    let ramp = duration * RAMP_FRACTION;
    for automation in [
        Automation::SetValueAtTime { value: 0.0, time: start },
        Automation::LinearRampToValueAtTime {
            value: peak,
            time: start + ramp,
        },
        Automation::LinearRampToValueAtTime {
            value: peak,
            time: start + duration - ramp,
        },
        Automation::LinearRampToValueAtTime {
            value: 0.0,
            time: start + duration,
        },
    ] {
        ctx.schedule(voice.envelope, Param::Gain, automation)?;
    }

    ctx.start(voice.oscillator, start)?;
    ctx.stop(voice.oscillator, start + duration)
}
