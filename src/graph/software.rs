//! Software audio context: renders the node graph block-by-block in Rust.
//!
//! The context is a cheap-to-clone handle over shared graph state, so a
//! device callback can pull audio while the control side keeps creating,
//! wiring and ramping nodes. The clock only advances when audio is rendered.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::f32::consts::FRAC_PI_2;
use std::sync::Arc;

use parking_lot::Mutex;

use super::{AudioBuffer, AudioContext, ContextState, NodeId, NodeKind, Param};
use crate::dsp::analyser::SpectrumAnalyser;
use crate::dsp::delay::FeedbackDelay;
use crate::dsp::filter::{BiquadFilter, FilterType};
use crate::dsp::oscillator::{Oscillator, Waveform};
use crate::dsp::param::{Automation, ParamTimeline};
use crate::dsp::reverb::Reverb;
use crate::error::GraphError;
use crate::microphone::MicrophoneStream;

/// Frames rendered per processing quantum.
pub const BLOCK_SIZE: usize = 128;

const MAX_DELAY_SECONDS: f64 = 2.0;

/// Per-node processing state.
enum Processor {
    Destination,
    Oscillator(Oscillator),
    Gain,
    Biquad(BiquadFilter, BiquadFilter),
    StereoPanner,
    BufferSource {
        buffer: AudioBuffer,
        looping: bool,
        position: usize,
    },
    Delay(FeedbackDelay),
    Reverb(Reverb),
    Analyser(SpectrumAnalyser),
    Microphone(MicrophoneStream),
}

impl Processor {
    fn kind(&self) -> NodeKind {
        match self {
            Processor::Destination => NodeKind::Destination,
            Processor::Oscillator(_) => NodeKind::Oscillator,
            Processor::Gain => NodeKind::Gain,
            Processor::Biquad(..) => NodeKind::Biquad,
            Processor::StereoPanner => NodeKind::StereoPanner,
            Processor::BufferSource { .. } => NodeKind::BufferSource,
            Processor::Delay(_) => NodeKind::Delay,
            Processor::Reverb(_) => NodeKind::Reverb,
            Processor::Analyser(_) => NodeKind::Analyser,
            Processor::Microphone(_) => NodeKind::MicrophoneInput,
        }
    }
}

/// One node's output for the current block.
#[derive(Clone)]
struct Block {
    left: Vec<f32>,
    right: Vec<f32>,
    stereo: bool,
}

impl Block {
    fn silent(frames: usize) -> Self {
        Block {
            left: vec![0.0; frames],
            right: vec![0.0; frames],
            stereo: false,
        }
    }

    fn mono(samples: Vec<f32>) -> Self {
        Block {
            right: samples.clone(),
            left: samples,
            stereo: false,
        }
    }

    /// Sum `other` into `self`, up-mixing mono to stereo as needed.
    fn mix(&mut self, other: &Block) {
        for (a, b) in self.left.iter_mut().zip(&other.left) {
            *a += b;
        }
        for (a, b) in self.right.iter_mut().zip(&other.right) {
            *a += b;
        }
        self.stereo |= other.stereo;
    }
}

struct Node {
    processor: Processor,
    params: HashMap<Param, ParamTimeline>,
    start: Option<f64>,
    stop: Option<f64>,
}

impl Node {
    fn new(processor: Processor, params: &[(Param, f64)]) -> Self {
        Node {
            processor,
            params: params
                .iter()
                .map(|&(p, v)| (p, ParamTimeline::new(v)))
                .collect(),
            start: None,
            stop: None,
        }
    }

    fn param_at(&self, param: Param, t: f64) -> f64 {
        self.params.get(&param).map_or(0.0, |p| p.value_at(t))
    }

    fn has_ended(&self, now: f64) -> bool {
        self.stop.is_some_and(|s| s <= now)
    }

    fn is_playing_at(&self, t: f64) -> bool {
        self.start.is_some_and(|s| s <= t) && !self.stop.is_some_and(|s| s <= t)
    }
}

struct GraphState {
    sample_rate: f64,
    frames_rendered: u64,
    state: ContextState,
    next_id: u32,
    destination: NodeId,
    nodes: BTreeMap<NodeId, Node>,
    /// Directed edges, `from → to`.
    edges: Vec<(NodeId, NodeId)>,
    order: Option<Vec<NodeId>>,
}

impl GraphState {
    fn now(&self) -> f64 {
        self.frames_rendered as f64 / self.sample_rate
    }

    fn add(&mut self, node: Node) -> NodeId {
        let id = NodeId(self.next_id);
        self.next_id += 1;
        self.nodes.insert(id, node);
        self.order = None;
        id
    }

    fn node(&self, id: NodeId) -> Result<&Node, GraphError> {
        self.nodes.get(&id).ok_or(GraphError::UnknownNode(id))
    }

    fn node_mut(&mut self, id: NodeId) -> Result<&mut Node, GraphError> {
        self.nodes.get_mut(&id).ok_or(GraphError::UnknownNode(id))
    }

    fn reaches(&self, from: NodeId, to: NodeId) -> bool {
        let mut stack = vec![from];
        let mut seen = vec![from];
        while let Some(n) = stack.pop() {
            if n == to {
                return true;
            }
            for &(a, b) in &self.edges {
                if a == n && !seen.contains(&b) {
                    seen.push(b);
                    stack.push(b);
                }
            }
        }
        false
    }

    /// Kahn's algorithm; connect() keeps the graph acyclic.
    fn processing_order(&mut self) -> Vec<NodeId> {
        if let Some(order) = &self.order {
            return order.clone();
        }
        let mut indegree: BTreeMap<NodeId, usize> = self.nodes.keys().map(|&k| (k, 0)).collect();
        for (_, to) in &self.edges {
            if let Some(d) = indegree.get_mut(to) {
                *d += 1;
            }
        }
        let mut ready: VecDeque<NodeId> = indegree
            .iter()
            .filter(|&(_, &d)| d == 0)
            .map(|(&k, _)| k)
            .collect();
        let mut order = Vec::with_capacity(self.nodes.len());
        while let Some(n) = ready.pop_front() {
            order.push(n);
            for &(from, to) in &self.edges {
                if from == n {
                    if let Some(d) = indegree.get_mut(&to) {
                        *d -= 1;
                        if *d == 0 {
                            ready.push_back(to);
                        }
                    }
                }
            }
        }
        self.order = Some(order.clone());
        order
    }

    fn render_block(&mut self, frames: usize, out_l: &mut [f32], out_r: &mut [f32]) {
        let order = self.processing_order();
        let block_start = self.frames_rendered;
        let sample_rate = self.sample_rate;
        let time_of = |i: usize| (block_start + i as u64) as f64 / sample_rate;
        let t0 = time_of(0);

        let mut outputs: HashMap<NodeId, Block> = HashMap::with_capacity(order.len());
        for id in order {
            let mut input = Block::silent(frames);
            for &(from, to) in &self.edges {
                if to == id {
                    if let Some(upstream) = outputs.get(&from) {
                        input.mix(upstream);
                    }
                }
            }

            let Some(node) = self.nodes.get_mut(&id) else {
                continue;
            };
            let output = match &mut node.processor {
                Processor::Destination => input,
                Processor::Oscillator(osc) => {
                    osc.frequency = node.params.get(&Param::Frequency).map_or(osc.frequency, |p| p.value_at(t0));
                    osc.detune = node.params.get(&Param::Detune).map_or(osc.detune, |p| p.value_at(t0));
                    let mut samples = vec![0.0; frames];
                    for (i, s) in samples.iter_mut().enumerate() {
                        let t = time_of(i);
                        if node.start.is_some_and(|st| st <= t) && !node.stop.is_some_and(|sp| sp <= t) {
                            *s = osc.next_sample() as f32;
                        }
                    }
                    Block::mono(samples)
                }
                Processor::BufferSource {
                    buffer,
                    looping,
                    position,
                } => {
                    let mut samples = vec![0.0; frames];
                    let len = buffer.samples.len();
                    for (i, s) in samples.iter_mut().enumerate() {
                        let t = time_of(i);
                        let playing = node.start.is_some_and(|st| st <= t) && !node.stop.is_some_and(|sp| sp <= t);
                        if !playing || len == 0 {
                            continue;
                        }
                        if *position >= len {
                            if !*looping {
                                continue;
                            }
                            *position = 0;
                        }
                        *s = buffer.samples[*position];
                        *position += 1;
                    }
                    Block::mono(samples)
                }
                Processor::Microphone(stream) => {
                    let mut samples = vec![0.0; frames];
                    stream.read_into(&mut samples);
                    Block::mono(samples)
                }
                Processor::Gain => {
                    let gain = node.params.get(&Param::Gain);
                    let mut out = input;
                    for i in 0..frames {
                        let g = gain.map_or(1.0, |p| p.value_at(time_of(i))) as f32;
                        out.left[i] *= g;
                        out.right[i] *= g;
                    }
                    out
                }
                Processor::Biquad(fl, fr) => {
                    let freq = node.params.get(&Param::Frequency).map_or(fl.frequency(), |p| p.value_at(t0));
                    let q = node.params.get(&Param::Q).map_or(fl.q(), |p| p.value_at(t0));
                    fl.set_params(freq, q);
                    fr.set_params(freq, q);
                    let mut out = input;
                    for s in out.left.iter_mut() {
                        *s = fl.process(*s as f64) as f32;
                    }
                    for s in out.right.iter_mut() {
                        *s = fr.process(*s as f64) as f32;
                    }
                    out
                }
                Processor::StereoPanner => {
                    let pan = node.params.get(&Param::Pan).map_or(0.0, |p| p.value_at(t0)).clamp(-1.0, 1.0) as f32;
                    pan_block(input, pan)
                }
                Processor::Delay(delay) => {
                    let mut out = input;
                    delay.process_block(&mut out.left, &mut out.right);
                    out
                }
                Processor::Reverb(reverb) => {
                    let mut out = input;
                    reverb.process_block(&mut out.left, &mut out.right);
                    out.stereo = true;
                    out
                }
                Processor::Analyser(analyser) => {
                    let mono: Vec<f32> = if input.stereo {
                        input.left.iter().zip(&input.right).map(|(l, r)| 0.5 * (l + r)).collect()
                    } else {
                        input.left.clone()
                    };
                    analyser.push(&mono);
                    input
                }
            };
            outputs.insert(id, output);
        }

        if let Some(dest) = outputs.get(&self.destination) {
            out_l[..frames].copy_from_slice(&dest.left);
            out_r[..frames].copy_from_slice(&dest.right);
        }
        self.frames_rendered += frames as u64;

        let now = self.now();
        for node in self.nodes.values_mut() {
            for timeline in node.params.values_mut() {
                timeline.prune(now);
            }
        }
    }
}

/// Equal-power stereo panning, following WebAudio's StereoPannerNode.
fn pan_block(input: Block, pan: f32) -> Block {
    let mut out = input;
    if out.stereo {
        let x = if pan <= 0.0 { pan + 1.0 } else { pan };
        let (gl, gr) = ((x * FRAC_PI_2).cos(), (x * FRAC_PI_2).sin());
        for (l, r) in out.left.iter_mut().zip(out.right.iter_mut()) {
            let (in_l, in_r) = (*l, *r);
            if pan <= 0.0 {
                *l = in_l + in_r * gl;
                *r = in_r * gr;
            } else {
                *l = in_l * gl;
                *r = in_r + in_l * gr;
            }
        }
    } else {
        let x = (pan + 1.0) / 2.0;
        let (gl, gr) = ((x * FRAC_PI_2).cos(), (x * FRAC_PI_2).sin());
        for (l, r) in out.left.iter_mut().zip(out.right.iter_mut()) {
            let m = *l;
            *l = m * gl;
            *r = m * gr;
        }
    }
    out.stereo = true;
    out
}

/// Pure-Rust [`AudioContext`]. Cloning yields another handle to the same graph.
#[derive(Clone)]
pub struct SoftwareContext {
    inner: Arc<Mutex<GraphState>>,
}

impl std::fmt::Debug for SoftwareContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let g = self.inner.lock();
        f.debug_struct("SoftwareContext")
            .field("sample_rate", &g.sample_rate)
            .field("time", &g.now())
            .field("state", &g.state)
            .field("nodes", &g.nodes.len())
            .finish()
    }
}

impl SoftwareContext {
    /// A new context starts suspended, as browsers do before a user gesture.
    pub fn new(sample_rate: f64) -> Self {
        let mut nodes = BTreeMap::new();
        let destination = NodeId(0);
        nodes.insert(destination, Node::new(Processor::Destination, &[]));
        SoftwareContext {
            inner: Arc::new(Mutex::new(GraphState {
                sample_rate,
                frames_rendered: 0,
                state: ContextState::Suspended,
                next_id: 1,
                destination,
                nodes,
                edges: Vec::new(),
                order: None,
            })),
        }
    }

    /// Render `frames` of stereo audio. A suspended context outputs silence
    /// and its clock stands still.
    pub fn render(&self, frames: usize) -> (Vec<f32>, Vec<f32>) {
        let mut left = vec![0.0; frames];
        let mut right = vec![0.0; frames];
        let mut g = self.inner.lock();
        if g.state != ContextState::Running {
            return (left, right);
        }
        let mut offset = 0;
        while offset < frames {
            let n = BLOCK_SIZE.min(frames - offset);
            g.render_block(n, &mut left[offset..offset + n], &mut right[offset..offset + n]);
            offset += n;
        }
        (left, right)
    }

    /// Render into an interleaved device buffer with `channels` channels.
    pub fn render_interleaved(&self, out: &mut [f32], channels: usize) {
        let channels = channels.max(1);
        let frames = out.len() / channels;
        let (left, right) = self.render(frames);
        for (i, frame) in out.chunks_mut(channels).enumerate().take(frames) {
            match frame {
                [mono] => *mono = 0.5 * (left[i] + right[i]),
                [l, r, rest @ ..] => {
                    *l = left[i];
                    *r = right[i];
                    rest.fill(0.0);
                }
                [] => {}
            }
        }
    }

    /// Advance the clock by rendering and discarding `seconds` of audio.
    pub fn advance(&self, seconds: f64) {
        let frames = (seconds * self.sample_rate()).round() as usize;
        let _ = self.render(frames);
    }

    pub fn node_count(&self) -> usize {
        self.inner.lock().nodes.len()
    }

    pub fn kind_of(&self, node: NodeId) -> Option<NodeKind> {
        self.inner.lock().nodes.get(&node).map(|n| n.processor.kind())
    }

    pub fn nodes_of(&self, kind: NodeKind) -> Vec<NodeId> {
        let g = self.inner.lock();
        g.nodes
            .iter()
            .filter(|(_, n)| n.processor.kind() == kind)
            .map(|(&id, _)| id)
            .collect()
    }

    /// Source nodes that are started and have not reached their stop time.
    pub fn live_sources(&self, kind: NodeKind) -> Vec<NodeId> {
        let g = self.inner.lock();
        let now = g.now();
        g.nodes
            .iter()
            .filter(|(_, n)| n.processor.kind() == kind && n.start.is_some() && !n.has_ended(now))
            .map(|(&id, _)| id)
            .collect()
    }

    /// Whether `node` will be producing sound at time `t`.
    pub fn is_playing_at(&self, node: NodeId, t: f64) -> bool {
        self.inner.lock().nodes.get(&node).is_some_and(|n| n.is_playing_at(t))
    }

    pub fn stop_time(&self, node: NodeId) -> Option<f64> {
        self.inner.lock().nodes.get(&node).and_then(|n| n.stop)
    }

    pub fn inputs(&self, node: NodeId) -> Vec<NodeId> {
        let g = self.inner.lock();
        g.edges.iter().filter(|(_, to)| *to == node).map(|(from, _)| *from).collect()
    }

    pub fn outputs(&self, node: NodeId) -> Vec<NodeId> {
        let g = self.inner.lock();
        g.edges.iter().filter(|(from, _)| *from == node).map(|(_, to)| *to).collect()
    }

    /// Whether audio leaving `from` can reach `to` along any path.
    pub fn reaches(&self, from: NodeId, to: NodeId) -> bool {
        self.inner.lock().reaches(from, to)
    }

    /// Parameter value at an arbitrary time, automation included.
    pub fn param_at(&self, node: NodeId, param: Param, t: f64) -> Result<f64, GraphError> {
        let g = self.inner.lock();
        let n = g.node(node)?;
        if !n.params.contains_key(&param) {
            return Err(GraphError::NoSuchParam {
                node,
                kind: n.processor.kind(),
                param,
            });
        }
        Ok(n.param_at(param, t))
    }

    pub fn filter_type(&self, node: NodeId) -> Option<FilterType> {
        match self.inner.lock().nodes.get(&node).map(|n| &n.processor) {
            Some(Processor::Biquad(f, _)) => Some(f.filter_type),
            _ => None,
        }
    }

    pub fn waveform(&self, node: NodeId) -> Option<Waveform> {
        match self.inner.lock().nodes.get(&node).map(|n| &n.processor) {
            Some(Processor::Oscillator(o)) => Some(o.waveform),
            _ => None,
        }
    }

    pub fn buffer_of(&self, node: NodeId) -> Option<(AudioBuffer, bool)> {
        match self.inner.lock().nodes.get(&node).map(|n| &n.processor) {
            Some(Processor::BufferSource { buffer, looping, .. }) => Some((buffer.clone(), *looping)),
            _ => None,
        }
    }

    fn create(&mut self, processor: Processor, params: &[(Param, f64)]) -> NodeId {
        self.inner.lock().add(Node::new(processor, params))
    }
}

impl AudioContext for SoftwareContext {
    fn current_time(&self) -> f64 {
        self.inner.lock().now()
    }

    fn sample_rate(&self) -> f64 {
        self.inner.lock().sample_rate
    }

    fn state(&self) -> ContextState {
        self.inner.lock().state
    }

    fn resume(&mut self) {
        let mut g = self.inner.lock();
        if g.state == ContextState::Suspended {
            g.state = ContextState::Running;
        }
    }

    fn suspend(&mut self) {
        let mut g = self.inner.lock();
        if g.state == ContextState::Running {
            g.state = ContextState::Suspended;
        }
    }

    fn close(&mut self) {
        self.inner.lock().state = ContextState::Closed;
    }

    fn destination(&self) -> NodeId {
        self.inner.lock().destination
    }

    fn create_oscillator(&mut self, waveform: Waveform, frequency: f64, detune: f64) -> NodeId {
        let sr = self.sample_rate();
        let mut osc = Oscillator::new(waveform, frequency, sr);
        osc.detune = detune;
        self.create(
            Processor::Oscillator(osc),
            &[(Param::Frequency, frequency), (Param::Detune, detune)],
        )
    }

    fn create_gain(&mut self, gain: f64) -> NodeId {
        self.create(Processor::Gain, &[(Param::Gain, gain)])
    }

    fn create_biquad(&mut self, filter: FilterType, frequency: f64, q: f64) -> NodeId {
        let sr = self.sample_rate();
        let f = BiquadFilter::new(filter, frequency, q, sr);
        self.create(
            Processor::Biquad(f.clone(), f),
            &[(Param::Frequency, frequency), (Param::Q, q)],
        )
    }

    fn create_stereo_panner(&mut self, pan: f64) -> NodeId {
        self.create(Processor::StereoPanner, &[(Param::Pan, pan)])
    }

    fn create_buffer_source(&mut self, buffer: AudioBuffer, looping: bool) -> NodeId {
        self.create(
            Processor::BufferSource {
                buffer,
                looping,
                position: 0,
            },
            &[],
        )
    }

    fn create_delay(&mut self, delay_time: f64, feedback: f64) -> NodeId {
        let sr = self.sample_rate();
        self.create(
            Processor::Delay(FeedbackDelay::new(sr, MAX_DELAY_SECONDS, delay_time, feedback)),
            &[],
        )
    }

    fn create_reverb(&mut self, room_size: f64, damping: f64) -> NodeId {
        let sr = self.sample_rate();
        self.create(Processor::Reverb(Reverb::new(sr, room_size, damping)), &[])
    }

    fn create_analyser(&mut self, fft_size: usize) -> NodeId {
        self.create(Processor::Analyser(SpectrumAnalyser::new(fft_size)), &[])
    }

    fn create_media_stream_source(&mut self, stream: &MicrophoneStream) -> NodeId {
        self.create(Processor::Microphone(stream.clone()), &[])
    }

    fn connect(&mut self, from: NodeId, to: NodeId) -> Result<(), GraphError> {
        let mut g = self.inner.lock();
        if g.state == ContextState::Closed {
            return Err(GraphError::Closed);
        }
        g.node(from)?;
        g.node(to)?;
        if g.edges.contains(&(from, to)) {
            return Ok(());
        }
        if from == to || g.reaches(to, from) {
            return Err(GraphError::Cycle { from, to });
        }
        g.edges.push((from, to));
        g.order = None;
        Ok(())
    }

    fn disconnect(&mut self, node: NodeId) -> Result<(), GraphError> {
        let mut g = self.inner.lock();
        let kind = g.node(node)?.processor.kind();
        if kind == NodeKind::Destination {
            return Err(GraphError::InvalidOperation {
                node,
                kind,
                op: "disconnected",
            });
        }
        g.edges.retain(|&(a, b)| a != node && b != node);
        g.nodes.remove(&node);
        g.order = None;
        Ok(())
    }

    fn start(&mut self, node: NodeId, when: f64) -> Result<(), GraphError> {
        let mut g = self.inner.lock();
        let n = g.node_mut(node)?;
        let kind = n.processor.kind();
        if !kind.is_scheduled_source() {
            return Err(GraphError::InvalidOperation {
                node,
                kind,
                op: "started",
            });
        }
        if n.start.is_some() {
            return Err(GraphError::AlreadyStarted(node));
        }
        n.start = Some(when.max(0.0));
        Ok(())
    }

    fn stop(&mut self, node: NodeId, when: f64) -> Result<(), GraphError> {
        let mut g = self.inner.lock();
        let n = g.node_mut(node)?;
        let kind = n.processor.kind();
        if !kind.is_scheduled_source() || n.start.is_none() {
            return Err(GraphError::InvalidOperation {
                node,
                kind,
                op: "stopped",
            });
        }
        // An earlier stop wins over a later one.
        n.stop = Some(n.stop.map_or(when, |s| s.min(when)));
        Ok(())
    }

    fn schedule(&mut self, node: NodeId, param: Param, automation: Automation) -> Result<(), GraphError> {
        let mut g = self.inner.lock();
        let n = g.node_mut(node)?;
        let kind = n.processor.kind();
        let timeline = n
            .params
            .get_mut(&param)
            .ok_or(GraphError::NoSuchParam { node, kind, param })?;
        timeline.schedule(automation);
        Ok(())
    }

    fn param_value(&self, node: NodeId, param: Param) -> Result<f64, GraphError> {
        let now = self.current_time();
        self.param_at(node, param, now)
    }

    fn byte_frequency_data(&mut self, node: NodeId, out: &mut [u8]) -> Result<(), GraphError> {
        let mut g = self.inner.lock();
        let n = g.node_mut(node)?;
        match &mut n.processor {
            Processor::Analyser(analyser) => {
                analyser.byte_frequency_data(out);
                Ok(())
            }
            other => Err(GraphError::InvalidOperation {
                node,
                kind: other.kind(),
                op: "analysed",
            }),
        }
    }
}
