//! Audio engine: owns the processing context and the mix topology.
//!
//! ```text
//! binaural pair ─────────────────────────┐
//! noise source → filter → gain ──────────┤
//! tone voices → music bus ───────────────┼→ master → destination
//!                   └→ fx input → reverb / delay sends ┘
//! microphone → analyser   (never routed onward)
//! ```
//!
//! The context is created lazily on the first [`AudioEngine::resume`] so a
//! browser host can defer it until a user gesture. At most one binaural
//! pair and one noise source exist at a time; replacing either fades the old
//! one out over a short hand-off while the new one ramps in from silence.

pub mod binaural;
pub mod fx;
pub mod noise;
pub mod tone;

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::config::AudioSettings;
use crate::dsp::param::Automation;
use crate::error::GraphError;
use crate::graph::{AudioContext, ContextState, NodeId, Param, SoftwareContext};
use crate::microphone::MicrophoneStream;
use crate::model::{AudioState, NoiseType, NoteEvent};
use crate::monitor;

use binaural::BinauralPair;
use fx::FxBus;
use noise::NoiseSource;
use tone::ToneVoice;

/// Engine handle shared by the session, the scheduler and the monitor.
pub type SharedEngine<C> = Arc<Mutex<AudioEngine<C>>>;

/// A segment boundary closer than this to "now" is treated as already missed.
const SPLICE_MARGIN: f64 = 0.005;

/// Last levels requested by the user. Kept even before the graph exists so
/// the first build picks them up.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Levels {
    pub binaural: f64,
    /// Base noise volume. The adaptive monitor boosts on top of this without
    /// changing it.
    pub noise: f64,
    pub music: f64,
    pub reverb: f64,
    pub delay: f64,
}

impl Default for Levels {
    fn default() -> Self {
        Levels::from(&AudioState::default())
    }
}

impl From<&AudioState> for Levels {
    fn from(state: &AudioState) -> Self {
        Levels {
            binaural: state.vol_binaural,
            noise: state.vol_noise,
            music: state.vol_music,
            reverb: state.reverb_mix,
            delay: state.delay_mix,
        }
    }
}

struct AdaptiveInput {
    stream: MicrophoneStream,
    source: NodeId,
    analyser: NodeId,
    bins: usize,
}

/// Nodes waiting for a fade-out to finish before they are disconnected.
struct Retiring {
    nodes: Vec<NodeId>,
    until: f64,
}

struct Graph<C> {
    ctx: C,
    master: NodeId,
    fx: FxBus,
    music_bus: Option<NodeId>,
    binaural: Option<BinauralPair>,
    noise: Option<NoiseSource>,
    voices: Vec<ToneVoice>,
    retiring: Vec<Retiring>,
    fade_until: Option<f64>,
    /// Audio-clock time the last scheduled segment ends.
    next_segment_at: Option<f64>,
    adaptive: Option<AdaptiveInput>,
}

impl<C: AudioContext> Graph<C> {
    fn now(&self) -> f64 {
        self.ctx.current_time()
    }

    /// Smoothly move `param` toward `target` from its present value.
    fn glide(&mut self, node: NodeId, param: Param, target: f64, time_constant: f64) -> Result<(), GraphError> {
        let now = self.now();
        let current = self.ctx.param_value(node, param)?;
        self.ctx.schedule(node, param, Automation::CancelScheduledValues { time: now })?;
        self.ctx.schedule(node, param, Automation::SetValueAtTime { value: current, time: now })?;
        self.ctx.schedule(
            node,
            param,
            Automation::SetTargetAtTime {
                target,
                start: now,
                time_constant,
            },
        )
    }

    fn music_bus(&mut self, level: f64) -> Result<NodeId, GraphError> {
        if let Some(bus) = self.music_bus {
            return Ok(bus);
        }
        let bus = self.ctx.create_gain(level);
        self.ctx.connect(bus, self.master)?;
        self.ctx.connect(bus, self.fx.input)?;
        debug!(%bus, "music bus created");
        self.music_bus = Some(bus);
        Ok(bus)
    }

    /// Ramp `gain` to silence over `fade` seconds and queue `nodes` for
    /// disconnection once it lands. Returns the time the ramp ends.
    fn fade_out(&mut self, gain: NodeId, nodes: Vec<NodeId>, fade: f64) -> f64 {
        let now = self.now();
        let until = now + fade;
        let current = self.ctx.param_value(gain, Param::Gain).unwrap_or(0.0);
        for automation in [
            Automation::CancelScheduledValues { time: now },
            Automation::SetValueAtTime { value: current, time: now },
            Automation::LinearRampToValueAtTime { value: 0.0, time: until },
        ] {
            if let Err(e) = self.ctx.schedule(gain, Param::Gain, automation) {
                warn!(%gain, "scheduling hand-off fade: {e}");
            }
        }
        self.retiring.push(Retiring { nodes, until });
        until
    }

    fn drop_binaural(&mut self, fade: f64) {
        if let Some(pair) = self.binaural.take() {
            let until = self.fade_out(pair.gain, pair.nodes().to_vec(), fade);
            if let Err(e) = pair.stop(&mut self.ctx, until) {
                warn!("stopping binaural pair: {e}");
            }
            debug!(carrier = pair.carrier, beat = pair.beat, until, "binaural pair retiring");
        }
    }

    fn drop_noise(&mut self, fade: f64) {
        if let Some(noise) = self.noise.take() {
            let until = self.fade_out(noise.gain, noise.nodes().to_vec(), fade);
            if let Err(e) = noise.stop(&mut self.ctx, until) {
                warn!("stopping noise source: {e}");
            }
            debug!(noise_type = %noise.noise_type, until, "noise source retiring");
        }
    }

    fn drop_adaptive_input(&mut self) {
        if let Some(input) = self.adaptive.take() {
            let _ = self.ctx.disconnect(input.source);
            let _ = self.ctx.disconnect(input.analyser);
            input.stream.release();
            info!("microphone released");
        }
    }

    /// Disconnect voices and retired nodes whose time has passed.
    fn reap(&mut self) {
        let now = self.now();
        let (done, live): (Vec<_>, Vec<_>) = std::mem::take(&mut self.voices)
            .into_iter()
            .partition(|v| v.end <= now);
        for voice in &done {
            voice.release(&mut self.ctx);
        }
        self.voices = live;

        let (done, pending): (Vec<_>, Vec<_>) = std::mem::take(&mut self.retiring)
            .into_iter()
            .partition(|r| r.until <= now);
        for node in done.into_iter().flat_map(|r| r.nodes) {
            let _ = self.ctx.disconnect(node);
        }
        self.retiring = pending;

        if self.fade_until.is_some_and(|t| t <= now) {
            self.fade_until = None;
        }
    }

    /// Abandon a running stop fade: drop everything it was fading and bring
    /// the master back to full scale.
    fn cancel_fade(&mut self) -> Result<(), GraphError> {
        let now = self.now();
        for node in std::mem::take(&mut self.retiring).into_iter().flat_map(|r| r.nodes) {
            let _ = self.ctx.disconnect(node);
        }
        self.ctx
            .schedule(self.master, Param::Gain, Automation::CancelScheduledValues { time: now })?;
        self.ctx
            .schedule(self.master, Param::Gain, Automation::SetValueAtTime { value: 1.0, time: now })?;
        self.fade_until = None;
        debug!("stop fade cancelled");
        Ok(())
    }
}

pub struct AudioEngine<C: AudioContext> {
    settings: AudioSettings,
    factory: Box<dyn FnMut(f64) -> C + Send>,
    levels: Levels,
    graph: Option<Graph<C>>,
}

impl AudioEngine<SoftwareContext> {
    /// An engine rendering through the in-process [`SoftwareContext`].
    pub fn software(settings: AudioSettings) -> Self {
        AudioEngine::new(settings, SoftwareContext::new)
    }
}

impl<C: AudioContext> AudioEngine<C> {
    /// `factory` builds the context on first use, given the sample rate.
    pub fn new(settings: AudioSettings, factory: impl FnMut(f64) -> C + Send + 'static) -> Self {
        AudioEngine {
            settings,
            factory: Box::new(factory),
            levels: Levels::default(),
            graph: None,
        }
    }

    pub fn shared(self) -> SharedEngine<C> {
        Arc::new(Mutex::new(self))
    }

    pub fn settings(&self) -> &AudioSettings {
        &self.settings
    }

    pub fn context(&self) -> Option<&C> {
        self.graph.as_ref().map(|g| &g.ctx)
    }

    pub fn levels(&self) -> Levels {
        self.levels
    }

    pub fn master(&self) -> Option<NodeId> {
        self.graph.as_ref().map(|g| g.master)
    }

    pub fn fx(&self) -> Option<&FxBus> {
        self.graph.as_ref().map(|g| &g.fx)
    }

    pub fn music_bus(&self) -> Option<NodeId> {
        self.graph.as_ref().and_then(|g| g.music_bus)
    }

    pub fn binaural(&self) -> Option<&BinauralPair> {
        self.graph.as_ref().and_then(|g| g.binaural.as_ref())
    }

    pub fn noise(&self) -> Option<&NoiseSource> {
        self.graph.as_ref().and_then(|g| g.noise.as_ref())
    }

    /// Audio-clock time the most recently scheduled segment ends.
    pub fn segment_end(&self) -> Option<f64> {
        self.graph.as_ref().and_then(|g| g.next_segment_at)
    }

    pub fn is_fading_out(&self) -> bool {
        self.graph.as_ref().is_some_and(|g| g.fade_until.is_some())
    }

    // ── Lifecycle ───────────────────────────────────────────────

    /// Make sure the context exists and is running. The first call builds
    /// the graph. A stop fade still in progress is abandoned.
    pub fn resume(&mut self) -> Result<(), GraphError> {
        if self.graph.is_none() {
            let graph = self.build_graph()?;
            info!(sample_rate = self.settings.sample_rate, "audio context created");
            self.graph = Some(graph);
        }
        let graph = self.graph_mut()?;
        match graph.ctx.state() {
            ContextState::Closed => return Err(GraphError::Closed),
            ContextState::Suspended => {
                graph.ctx.resume();
                debug!("audio context resumed");
            }
            ContextState::Running => {}
        }
        if graph.fade_until.is_some() {
            graph.cancel_fade()?;
        }
        graph.reap();
        Ok(())
    }

    fn build_graph(&mut self) -> Result<Graph<C>, GraphError> {
        let mut ctx = (self.factory)(self.settings.sample_rate);
        let master = ctx.create_gain(1.0);
        let destination = ctx.destination();
        ctx.connect(master, destination)?;
        let fx = FxBus::build(&mut ctx, master, self.levels.reverb, self.levels.delay)?;
        Ok(Graph {
            ctx,
            master,
            fx,
            music_bus: None,
            binaural: None,
            noise: None,
            voices: Vec::new(),
            retiring: Vec::new(),
            fade_until: None,
            next_segment_at: None,
            adaptive: None,
        })
    }

    fn graph_mut(&mut self) -> Result<&mut Graph<C>, GraphError> {
        self.graph.as_mut().ok_or(GraphError::Closed)
    }

    /// Release notes and faded sources that have finished.
    pub fn reap(&mut self) {
        if let Some(graph) = self.graph.as_mut() {
            graph.reap();
        }
    }

    // ── Sources ─────────────────────────────────────────────────

    pub fn start_binaural(&mut self, carrier: f64, beat: f64, volume: f64) -> Result<(), GraphError> {
        self.levels.binaural = volume;
        let time_constant = self.settings.ramp_time_constant;
        let fade = self.settings.handoff_fade;
        self.resume()?;
        let graph = self.graph_mut()?;
        graph.drop_binaural(fade);
        let master = graph.master;
        let pair = BinauralPair::start(&mut graph.ctx, master, carrier, beat, volume, time_constant)?;
        info!(carrier, beat, volume, "binaural pair started");
        graph.binaural = Some(pair);
        Ok(())
    }

    /// Fade the binaural pair out over the hand-off fade and drop it.
    pub fn stop_binaural(&mut self) {
        let fade = self.settings.handoff_fade;
        if let Some(graph) = self.graph.as_mut() {
            graph.drop_binaural(fade);
        }
    }

    pub fn start_noise(&mut self, noise_type: NoiseType, volume: f64) -> Result<(), GraphError> {
        self.levels.noise = volume;
        let time_constant = self.settings.ramp_time_constant;
        let buffer_seconds = self.settings.noise_buffer_seconds;
        let fade = self.settings.handoff_fade;
        self.resume()?;
        let graph = self.graph_mut()?;
        graph.drop_noise(fade);
        let master = graph.master;
        let noise = NoiseSource::start(&mut graph.ctx, master, noise_type, volume, buffer_seconds, time_constant)?;
        info!(%noise_type, volume, "noise started");
        graph.noise = Some(noise);
        Ok(())
    }

    pub fn stop_noise(&mut self) {
        let fade = self.settings.handoff_fade;
        if let Some(graph) = self.graph.as_mut() {
            graph.drop_noise(fade);
        }
    }

    /// Fade the master out and release every source, the scheduled notes
    /// and the microphone. The master returns to full scale once the fade
    /// has finished.
    pub fn stop_all(&mut self) {
        let fade = self.settings.stop_fade;
        let Some(graph) = self.graph.as_mut() else {
            return;
        };
        let now = graph.now();
        let until = now + fade;

        let master = graph.master;
        let current = graph.ctx.param_value(master, Param::Gain).unwrap_or(1.0);
        for automation in [
            Automation::CancelScheduledValues { time: now },
            Automation::SetValueAtTime { value: current, time: now },
            Automation::LinearRampToValueAtTime { value: 0.0, time: until },
            Automation::SetValueAtTime { value: 1.0, time: until },
        ] {
            if let Err(e) = graph.ctx.schedule(master, Param::Gain, automation) {
                warn!("scheduling master fade: {e}");
            }
        }

        let mut nodes = Vec::new();
        if let Some(pair) = graph.binaural.take() {
            let _ = pair.stop(&mut graph.ctx, until);
            nodes.extend(pair.nodes());
        }
        if let Some(noise) = graph.noise.take() {
            let _ = noise.stop(&mut graph.ctx, until);
            nodes.extend(noise.nodes());
        }
        for voice in std::mem::take(&mut graph.voices) {
            let _ = voice.stop(&mut graph.ctx, until);
            nodes.extend(voice.nodes());
        }
        graph.retiring.push(Retiring { nodes, until });
        graph.fade_until = Some(until);
        graph.next_segment_at = None;
        graph.drop_adaptive_input();
        info!(fade, "all sources stopping");
    }

    // ── Levels ──────────────────────────────────────────────────

    fn glide_level(&mut self, node: impl FnOnce(&Graph<C>) -> Option<NodeId>, value: f64, time_constant: f64) {
        let Some(graph) = self.graph.as_mut() else {
            return;
        };
        let Some(node) = node(graph) else {
            return;
        };
        if let Err(e) = graph.glide(node, Param::Gain, value, time_constant) {
            warn!(%node, "level change failed: {e}");
        }
    }

    pub fn set_binaural_volume(&mut self, volume: f64) {
        self.levels.binaural = volume;
        let tc = self.settings.ramp_time_constant;
        self.glide_level(|g| g.binaural.as_ref().map(|b| b.gain), volume, tc);
    }

    /// Sets the base noise volume.
    pub fn set_noise_volume(&mut self, volume: f64) {
        self.levels.noise = volume;
        let tc = self.settings.ramp_time_constant;
        self.glide_level(|g| g.noise.as_ref().map(|n| n.gain), volume, tc);
    }

    pub fn set_music_volume(&mut self, volume: f64) {
        self.levels.music = volume;
        let tc = self.settings.ramp_time_constant;
        self.glide_level(|g| g.music_bus, volume, tc);
    }

    pub fn set_reverb_mix(&mut self, mix: f64) {
        self.levels.reverb = mix;
        let tc = self.settings.ramp_time_constant;
        self.glide_level(|g| Some(g.fx.reverb_gain), mix, tc);
    }

    pub fn set_delay_mix(&mut self, mix: f64) {
        self.levels.delay = mix;
        let tc = self.settings.ramp_time_constant;
        self.glide_level(|g| Some(g.fx.delay_gain), mix, tc);
    }

    // ── Music ───────────────────────────────────────────────────

    /// Schedule a segment's notes on the audio clock and return its start
    /// time. A segment requested right as the previous one runs out starts
    /// exactly where that one ends; otherwise it starts one scheduling lead
    /// from now.
    pub fn play_composition(&mut self, notes: &[NoteEvent]) -> Result<f64, GraphError> {
        let lead = self.settings.schedule_lead;
        let music_level = self.levels.music;
        self.resume()?;
        let graph = self.graph_mut()?;
        let bus = graph.music_bus(music_level)?;

        let now = graph.now();
        let start = match graph.next_segment_at {
            Some(t) if t >= now + SPLICE_MARGIN && t <= now + 2.0 * lead => t,
            _ => now + lead,
        };

        for note in notes {
            match tone::schedule_note(&mut graph.ctx, bus, note, start) {
                Ok(voices) => graph.voices.extend(voices),
                Err(e) => warn!(pitch = %note.pitch, "note dropped: {e}"),
            }
        }
        graph.next_segment_at = notes
            .iter()
            .map(NoteEvent::end_time)
            .reduce(f64::max)
            .map(|span| start + span);
        debug!(notes = notes.len(), start, "segment scheduled");
        Ok(start)
    }

    // ── Adaptive input ──────────────────────────────────────────

    pub fn has_microphone(&self) -> bool {
        self.graph.as_ref().is_some_and(|g| g.adaptive.is_some())
    }

    /// The analyser fed by the microphone, if one is attached.
    pub fn adaptive_analyser(&self) -> Option<NodeId> {
        self.graph.as_ref().and_then(|g| g.adaptive.as_ref().map(|a| a.analyser))
    }

    /// Wire `stream` into an analyser and nothing else. A microphone that is
    /// already attached is kept and `stream` is released.
    pub fn attach_microphone(&mut self, stream: MicrophoneStream, fft_size: usize) -> Result<NodeId, GraphError> {
        self.resume()?;
        let graph = self.graph_mut()?;
        if let Some(input) = &graph.adaptive {
            if !input.stream.same_stream(&stream) {
                stream.release();
            }
            return Ok(input.analyser);
        }

        let source = graph.ctx.create_media_stream_source(&stream);
        let analyser = graph.ctx.create_analyser(fft_size);
        if let Err(e) = graph.ctx.connect(source, analyser) {
            let _ = graph.ctx.disconnect(source);
            let _ = graph.ctx.disconnect(analyser);
            return Err(e);
        }
        graph.adaptive = Some(AdaptiveInput {
            stream,
            source,
            analyser,
            bins: (fft_size / 2).max(1),
        });
        info!(fft_size, "microphone attached to analyser");
        Ok(analyser)
    }

    pub fn release_microphone(&mut self) {
        if let Some(graph) = self.graph.as_mut() {
            graph.drop_adaptive_input();
        }
    }

    /// Mean of the analyser's byte spectrum, `0..=255`.
    pub fn ambient_loudness(&mut self) -> Option<f64> {
        let graph = self.graph.as_mut()?;
        let input = graph.adaptive.as_ref()?;
        let analyser = input.analyser;
        let mut bins = vec![0u8; input.bins];
        match graph.ctx.byte_frequency_data(analyser, &mut bins) {
            Ok(()) => Some(monitor::average_loudness(&bins)),
            Err(e) => {
                warn!("reading analyser: {e}");
                None
            }
        }
    }

    /// Drive the effective noise gain toward `target` without touching the
    /// stored base volume.
    pub fn apply_noise_target(&mut self, target: f64, time_constant: f64) {
        self.glide_level(|g| g.noise.as_ref().map(|n| n.gain), target, time_constant);
    }

    /// Return the noise gain to the last user-set base volume.
    pub fn reset_noise_to_base(&mut self) {
        let base = self.levels.noise;
        let tc = self.settings.ramp_time_constant;
        self.glide_level(|g| g.noise.as_ref().map(|n| n.gain), base, tc);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dsp::filter::FilterType;
    use crate::graph::NodeKind;

    fn engine() -> AudioEngine<SoftwareContext> {
        AudioEngine::software(AudioSettings {
            sample_rate: 8000.0,
            ..AudioSettings::default()
        })
    }

    fn ctx_of(engine: &AudioEngine<SoftwareContext>) -> SoftwareContext {
        engine.context().cloned().unwrap()
    }

    fn note(start: f64, duration: f64) -> NoteEvent {
        NoteEvent {
            pitch: "D3".into(),
            duration,
            start_time: start,
            velocity: 0.6,
        }
    }

    #[test]
    fn context_is_created_lazily_and_resume_is_idempotent() {
        let mut engine = engine();
        engine.set_noise_volume(0.4);
        engine.stop_all();
        assert!(engine.context().is_none());
        assert_eq!(engine.levels().noise, 0.4);

        engine.resume().unwrap();
        let ctx = ctx_of(&engine);
        assert_eq!(ctx.state(), ContextState::Running);
        let nodes = ctx.node_count();
        engine.resume().unwrap();
        assert_eq!(ctx.node_count(), nodes);
        assert!(ctx.reaches(engine.fx().unwrap().input, ctx.destination()));
    }

    #[test]
    fn binaural_replacement_leaves_one_pair() {
        let mut engine = engine();
        engine.start_binaural(150.0, 2.5, 0.3).unwrap();
        let old = engine.binaural().cloned().unwrap();
        let ctx = ctx_of(&engine);
        ctx.advance(0.5);
        engine.start_binaural(200.0, 4.0, 0.3).unwrap();

        // The old pair ramps to silence over the hand-off instead of cutting.
        let now = ctx.current_time();
        assert_eq!(ctx.stop_time(old.left), Some(now + 0.02));
        let old_level = ctx.param_at(old.gain, Param::Gain, now).unwrap();
        assert!(old_level > 0.2, "old pair cut at {old_level}");
        assert!(ctx.param_at(old.gain, Param::Gain, now + 0.01).unwrap() < old_level);
        assert!(ctx.param_at(old.gain, Param::Gain, now + 0.02).unwrap().abs() < 1e-9);

        let pair = engine.binaural().unwrap();
        assert_eq!(ctx.param_value(pair.left, Param::Frequency), Ok(200.0));
        assert_eq!(ctx.param_value(pair.right, Param::Frequency), Ok(204.0));
        // The new pair fades in from silence.
        assert_eq!(ctx.param_value(pair.gain, Param::Gain), Ok(0.0));

        ctx.advance(0.05);
        engine.reap();
        assert_eq!(ctx.live_sources(NodeKind::Oscillator).len(), 2);
        assert!(old.nodes().iter().all(|n| ctx.kind_of(*n).is_none()));
    }

    #[test]
    fn restarting_noise_replaces_the_source() {
        let mut engine = engine();
        engine.start_noise(NoiseType::White, 0.2).unwrap();
        engine.start_noise(NoiseType::Brown, 0.2).unwrap();
        let ctx = ctx_of(&engine);
        ctx.advance(0.05);
        engine.reap();

        assert_eq!(ctx.live_sources(NodeKind::BufferSource).len(), 1);
        assert_eq!(ctx.nodes_of(NodeKind::Biquad).len(), 1);
        let noise = engine.noise().unwrap();
        assert_eq!(noise.noise_type, NoiseType::Brown);
        assert_eq!(ctx.filter_type(noise.filter), Some(FilterType::Lowpass));
    }

    #[test]
    fn level_changes_glide() {
        let mut engine = engine();
        engine.start_noise(NoiseType::Grey, 0.1).unwrap();
        let ctx = ctx_of(&engine);
        ctx.advance(1.0);

        engine.set_noise_volume(0.5);
        let gain = engine.noise().unwrap().gain;
        let now = ctx.current_time();
        let at = |t: f64| ctx.param_at(gain, Param::Gain, now + t).unwrap();
        assert!((at(0.0) - 0.1).abs() < 1e-3, "No step at the change");
        assert!(at(0.05) > 0.1 && at(0.05) < 0.5);
        assert!((at(1.0) - 0.5).abs() < 1e-3);
    }

    #[test]
    fn stopping_a_role_fades_it_out() {
        let mut engine = engine();
        engine.start_binaural(150.0, 2.5, 0.3).unwrap();
        engine.start_noise(NoiseType::Brown, 0.15).unwrap();
        let ctx = ctx_of(&engine);
        ctx.advance(0.5);

        engine.set_binaural_volume(0.1);
        let gain = engine.binaural().unwrap().gain;
        ctx.advance(1.0);
        assert!((ctx.param_value(gain, Param::Gain).unwrap() - 0.1).abs() < 1e-3);

        engine.stop_binaural();
        assert!(engine.binaural().is_none());
        let now = ctx.current_time();
        assert!(ctx.param_at(gain, Param::Gain, now + 0.01).unwrap() > 0.0);
        ctx.advance(0.05);
        engine.reap();
        assert_eq!(ctx.kind_of(gain), None);
        assert!(ctx.live_sources(NodeKind::Oscillator).is_empty());
        assert_eq!(ctx.live_sources(NodeKind::BufferSource).len(), 1);

        engine.stop_noise();
        engine.stop_noise();
        assert!(engine.noise().is_none());
        ctx.advance(0.05);
        assert!(ctx.live_sources(NodeKind::BufferSource).is_empty());
        assert_eq!(engine.levels().binaural, 0.1);
    }

    #[test]
    fn releasing_the_microphone_frees_the_stream() {
        let mut engine = engine();
        let stream = MicrophoneStream::new(8000.0);
        let analyser = engine.attach_microphone(stream.clone(), 256).unwrap();
        engine.release_microphone();
        assert!(!engine.has_microphone());
        assert!(!stream.is_active());
        assert_eq!(engine.ambient_loudness(), None);
        assert_eq!(ctx_of(&engine).kind_of(analyser), None);
    }

    #[test]
    fn stop_all_fades_master_then_restores_it() {
        let mut engine = engine();
        engine.start_binaural(150.0, 2.5, 0.3).unwrap();
        engine.start_noise(NoiseType::Brown, 0.15).unwrap();
        engine.play_composition(&[note(0.0, 4.0)]).unwrap();
        let ctx = ctx_of(&engine);
        let master = engine.master().unwrap();

        engine.stop_all();
        assert!(engine.is_fading_out());
        assert!((ctx.param_at(master, Param::Gain, 0.25).unwrap() - 0.5).abs() < 1e-9);
        assert!(engine.binaural().is_none());
        assert!(ctx.live_sources(NodeKind::Oscillator).iter().all(|n| ctx.stop_time(*n) <= Some(0.5)));

        ctx.advance(0.6);
        engine.reap();
        assert!(!engine.is_fading_out());
        assert!(ctx.live_sources(NodeKind::Oscillator).is_empty());
        assert!(ctx.live_sources(NodeKind::BufferSource).is_empty());
        assert_eq!(ctx.nodes_of(NodeKind::StereoPanner).len(), 0);
        assert_eq!(ctx.param_value(master, Param::Gain), Ok(1.0));
    }

    #[test]
    fn resuming_mid_fade_restores_master() {
        let mut engine = engine();
        engine.start_binaural(150.0, 2.5, 0.3).unwrap();
        let ctx = ctx_of(&engine);
        let master = engine.master().unwrap();
        ctx.advance(0.5);

        engine.stop_all();
        ctx.advance(0.25);
        engine.start_binaural(150.0, 2.5, 0.3).unwrap();

        assert!(!engine.is_fading_out());
        assert_eq!(ctx.live_sources(NodeKind::Oscillator).len(), 2);
        assert_eq!(ctx.param_value(master, Param::Gain), Ok(1.0));
        assert_eq!(ctx.param_at(master, Param::Gain, 5.0), Ok(1.0));
    }

    #[test]
    fn music_bus_is_created_once_and_feeds_both_sends() {
        let mut engine = engine();
        engine.set_music_volume(0.7);
        engine.play_composition(&[note(0.0, 1.0)]).unwrap();
        let bus = engine.music_bus().unwrap();
        engine.play_composition(&[note(0.0, 1.0)]).unwrap();
        assert_eq!(engine.music_bus(), Some(bus));

        let ctx = ctx_of(&engine);
        let fx = engine.fx().unwrap();
        let mut outputs = ctx.outputs(bus);
        outputs.sort();
        let mut expected = vec![engine.master().unwrap(), fx.input];
        expected.sort();
        assert_eq!(outputs, expected);
        assert_eq!(ctx.param_value(bus, Param::Gain), Ok(0.7));
    }

    #[test]
    fn consecutive_segments_splice_on_the_audio_clock() {
        let mut engine = engine();
        let first = engine.play_composition(&[note(0.0, 0.5), note(0.5, 0.5)]).unwrap();
        assert!((first - 0.1).abs() < 1e-9);
        assert_eq!(engine.segment_end(), Some(first + 1.0));

        let ctx = ctx_of(&engine);
        ctx.advance(1.0);
        let second = engine.play_composition(&[note(0.0, 1.0)]).unwrap();
        assert_eq!(second, first + 1.0, "Starts exactly where the first ended");

        // A tick that arrives far too late starts from now instead.
        ctx.advance(3.0);
        let late = engine.play_composition(&[note(0.0, 1.0)]).unwrap();
        assert!((late - (ctx.current_time() + 0.1)).abs() < 1e-9);
    }

    #[test]
    fn finished_notes_are_released() {
        let mut engine = engine();
        engine.resume().unwrap();
        let ctx = ctx_of(&engine);
        let baseline = ctx.node_count();

        engine.play_composition(&[note(0.0, 0.2), note(0.1, 0.2)]).unwrap();
        let with_bus = baseline + 1;
        assert_eq!(ctx.node_count(), with_bus + 12);

        ctx.advance(1.0);
        engine.reap();
        assert_eq!(ctx.node_count(), with_bus);
    }

    #[test]
    fn microphone_reaches_only_the_analyser() {
        let mut engine = engine();
        let stream = MicrophoneStream::new(8000.0);
        let analyser = engine.attach_microphone(stream.clone(), 256).unwrap();
        let ctx = ctx_of(&engine);
        assert!(!ctx.reaches(analyser, ctx.destination()));
        assert!(ctx.outputs(analyser).is_empty());

        // Attaching again keeps the first stream.
        let other = MicrophoneStream::new(8000.0);
        assert_eq!(engine.attach_microphone(other.clone(), 256), Ok(analyser));
        assert!(!other.is_active());
        assert!(stream.is_active());

        let loud: Vec<f32> = (0..2048).map(|i| 0.8 * (i as f32 * 0.785).sin()).collect();
        stream.push(&loud);
        ctx.advance(0.25);
        assert!(engine.ambient_loudness().unwrap() > 0.0);

        engine.stop_all();
        assert!(!engine.has_microphone());
        assert!(!stream.is_active());
        assert_eq!(ctx.kind_of(analyser), None);
    }

    #[test]
    fn adaptive_target_leaves_base_volume_alone() {
        let mut engine = engine();
        engine.start_noise(NoiseType::Brown, 0.2).unwrap();
        let ctx = ctx_of(&engine);
        let gain = engine.noise().unwrap().gain;

        engine.apply_noise_target(0.45, 0.5);
        ctx.advance(5.0);
        assert!((ctx.param_value(gain, Param::Gain).unwrap() - 0.45).abs() < 1e-3);
        assert_eq!(engine.levels().noise, 0.2);

        engine.reset_noise_to_base();
        ctx.advance(2.0);
        assert!((ctx.param_value(gain, Param::Gain).unwrap() - 0.2).abs() < 1e-3);
    }
}
