//! Playback session: the one owner handed to UI code.
//!
//! Ties the shared engine to the segment scheduler, the adaptive monitor,
//! the microphone provider and the remote composer/orchestrator.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{info, warn};

use crate::composer::{ComposeRequest, Composer, MusicSettings};
use crate::config::Settings;
use crate::engine::{AudioEngine, SharedEngine};
use crate::error::{LullabyError, MicrophoneError};
use crate::graph::AudioContext;
use crate::microphone::MicrophoneProvider;
use crate::model::{AudioState, Composition};
use crate::monitor::AdaptiveMonitor;
use crate::orchestrator::{AgenticConfig, OrchestrateRequest, Orchestrator};
use crate::scheduler::SegmentScheduler;

pub const DEFAULT_MOOD: &str = "deep, peaceful sleep";

pub struct Session<C: AudioContext, M, G, O> {
    engine: SharedEngine<C>,
    scheduler: SegmentScheduler<Mutex<AudioEngine<C>>, G>,
    monitor: AdaptiveMonitor,
    microphone: M,
    orchestrator: O,
    settings: Settings,
    playing: bool,
    adaptive_error: Option<MicrophoneError>,
}

impl<C, M, G, O> Session<C, M, G, O>
where
    C: AudioContext,
    M: MicrophoneProvider,
    G: Composer,
    O: Orchestrator,
{
    pub fn new(engine: AudioEngine<C>, microphone: M, composer: G, orchestrator: O, settings: Settings) -> Self {
        let engine = engine.shared();
        let defaults = AudioState::default();
        let scheduler = SegmentScheduler::new(
            engine.clone(),
            Arc::new(composer),
            settings.scheduler.clone(),
            ComposeRequest::new(DEFAULT_MOOD, defaults.carrier_freq, defaults.beat_freq),
        );
        Session {
            engine,
            scheduler,
            monitor: AdaptiveMonitor::new(),
            microphone,
            orchestrator,
            settings,
            playing: false,
            adaptive_error: None,
        }
    }

    pub fn engine(&self) -> &SharedEngine<C> {
        &self.engine
    }

    pub fn scheduler(&self) -> &SegmentScheduler<Mutex<AudioEngine<C>>, G> {
        &self.scheduler
    }

    pub fn is_playing(&self) -> bool {
        self.playing
    }

    pub fn adaptive_enabled(&self) -> bool {
        self.monitor.is_active()
    }

    /// Why adaptive noise was last forced off, if it was.
    pub fn adaptive_error(&self) -> Option<&MicrophoneError> {
        self.adaptive_error.as_ref()
    }

    /// Start every role from `state` and begin scheduling segments,
    /// optionally starting with `initial`.
    pub async fn play(&mut self, state: &AudioState, initial: Option<Composition>) -> Result<(), LullabyError> {
        {
            let mut engine = self.engine.lock();
            engine.resume()?;
            engine.set_music_volume(state.vol_music);
            engine.set_reverb_mix(state.reverb_mix);
            engine.set_delay_mix(state.delay_mix);
            engine.start_binaural(state.carrier_freq, state.beat_freq, state.vol_binaural)?;
            engine.start_noise(state.noise_type, state.vol_noise)?;
        }

        let request = self.scheduler.request();
        if request.carrier_freq != state.carrier_freq || request.beat_freq != state.beat_freq {
            self.scheduler.set_request(ComposeRequest {
                carrier_freq: state.carrier_freq,
                beat_freq: state.beat_freq,
                ..request
            });
        }
        self.scheduler.start(initial);
        self.playing = true;
        info!(carrier = state.carrier_freq, beat = state.beat_freq, noise = %state.noise_type, "playback started");

        if state.adaptive_noise {
            self.set_adaptive_noise(true).await;
        }
        Ok(())
    }

    /// Cancel the segment timer, stop the monitor and fade everything out.
    pub fn pause(&mut self) {
        self.scheduler.stop();
        self.monitor.stop();
        self.engine.lock().stop_all();
        self.playing = false;
        info!("playback paused");
    }

    /// Turn adaptive noise on or off and return whether it is on. Failing to
    /// get the microphone leaves it off and records the error.
    pub async fn set_adaptive_noise(&mut self, enable: bool) -> bool {
        if !enable {
            if self.monitor.is_active() {
                self.monitor.stop();
                self.engine.lock().reset_noise_to_base();
            }
            return false;
        }
        if self.monitor.is_active() {
            return true;
        }

        if !self.engine.lock().has_microphone() {
            let stream = match self.microphone.acquire().await {
                Ok(stream) => stream,
                Err(e) => {
                    warn!("adaptive noise disabled: {e}");
                    self.adaptive_error = Some(e);
                    return false;
                }
            };
            let fft_size = self.settings.adaptive.fft_size;
            if let Err(e) = self.engine.lock().attach_microphone(stream, fft_size) {
                warn!("adaptive noise disabled: {e}");
                self.adaptive_error = Some(MicrophoneError::Device(e.to_string()));
                return false;
            }
        }

        self.adaptive_error = None;
        self.monitor.start(self.engine.clone(), self.settings.adaptive.clone());
        true
    }

    pub fn set_music_settings(&self, settings: Option<MusicSettings>) {
        self.scheduler.set_request(ComposeRequest {
            settings,
            ..self.scheduler.request()
        });
    }

    /// Ask the orchestrator for a station matching `request` and switch to
    /// it. Returns `None`, changing nothing, if no usable reply came back.
    pub async fn apply_intent(&mut self, request: &OrchestrateRequest) -> Option<AgenticConfig> {
        let config = self.orchestrator.orchestrate(request).await?;

        {
            let mut engine = self.engine.lock();
            if self.playing {
                let volume = engine.levels().binaural;
                if let Err(e) = engine.start_binaural(config.carrier_freq, config.beat_freq, volume) {
                    warn!("binaural not restarted: {e}");
                }
                if let Err(e) = engine.start_noise(config.noise_type, config.noise_volume) {
                    warn!("noise not restarted: {e}");
                }
            } else {
                engine.set_noise_volume(config.noise_volume);
            }
        }

        self.scheduler.set_request(ComposeRequest {
            mood: config.music_prompt.clone(),
            previous_track: None,
            carrier_freq: config.carrier_freq,
            beat_freq: config.beat_freq,
            settings: self.scheduler.request().settings,
        });
        info!(station = %config.station_name, "intent applied");
        Some(config)
    }
}
