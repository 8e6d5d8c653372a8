//! Adaptive loudness monitor: polls the microphone analyser and raises the
//! noise gain while the room is loud.
//!
//! Idle until [`AdaptiveMonitor::start`], Active until [`AdaptiveMonitor::stop`].
//! Each poll averages the byte spectrum, maps it through a deadband plus a
//! capped linear boost, and glides the noise gain toward `base + boost`.

use tracing::{debug, info};

use crate::config::AdaptiveSettings;
use crate::engine::SharedEngine;
use crate::graph::AudioContext;
use crate::task::TaskHandle;

/// Unweighted mean over all bins, `0..=255`.
pub fn average_loudness(bins: &[u8]) -> f64 {
    if bins.is_empty() {
        return 0.0;
    }
    bins.iter().map(|&b| b as f64).sum::<f64>() / bins.len() as f64
}

/// Extra noise gain for a loudness reading.
pub fn boost_for(loudness: f64, settings: &AdaptiveSettings) -> f64 {
    if loudness <= settings.floor {
        return 0.0;
    }
    ((loudness - settings.floor) / settings.span).min(settings.max_boost)
}

/// Effective noise gain: base plus boost, never above the ceiling.
pub fn noise_target(loudness: f64, base: f64, settings: &AdaptiveSettings) -> f64 {
    (base + boost_for(loudness, settings)).min(settings.ceiling)
}

#[derive(Debug, Default)]
pub struct AdaptiveMonitor {
    task: Option<TaskHandle>,
}

impl AdaptiveMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_active(&self) -> bool {
        self.task.is_some()
    }

    /// Start polling. Restarting replaces the previous loop.
    pub fn start<C: AudioContext>(&mut self, engine: SharedEngine<C>, settings: AdaptiveSettings) {
        self.stop();
        let interval = settings.poll_interval();
        self.task = Some(TaskHandle::spawn(move |mut token| async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let mut engine = engine.lock();
                        let Some(loudness) = engine.ambient_loudness() else {
                            continue;
                        };
                        let base = engine.levels().noise;
                        let target = noise_target(loudness, base, &settings);
                        engine.apply_noise_target(target, settings.time_constant);
                        debug!(loudness, target, "adaptive noise");
                    }
                }
            }
        }));
        info!(?interval, "adaptive monitor active");
    }

    /// Stop polling. The noise gain is left where it is.
    pub fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.cancel();
            info!("adaptive monitor idle");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AudioSettings;
    use crate::engine::AudioEngine;
    use crate::graph::Param;
    use crate::microphone::MicrophoneStream;
    use crate::model::NoiseType;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::time::Duration;

    fn settings() -> AdaptiveSettings {
        AdaptiveSettings::default()
    }

    #[test]
    fn deadband_then_capped_boost() {
        let s = settings();
        assert_eq!(boost_for(0.0, &s), 0.0);
        assert_eq!(boost_for(20.0, &s), 0.0);
        assert!((boost_for(60.0, &s) - 0.2).abs() < 1e-12);
        assert_eq!(boost_for(220.0, &s), 0.3);
        assert_eq!(boost_for(255.0, &s), 0.3);
    }

    #[test]
    fn target_never_exceeds_ceiling() {
        let s = settings();
        for base in [0.0, 0.15, 0.5, 0.7, 0.8, 1.0] {
            for loudness in [0.0, 20.0, 100.0, 220.0, 255.0] {
                assert!(noise_target(loudness, base, &s) <= 0.8, "base {base} loudness {loudness}");
            }
        }
        assert!((noise_target(220.0, 0.15, &s) - 0.45).abs() < 1e-12);
    }

    #[test]
    fn average_covers_all_bins() {
        assert_eq!(average_loudness(&[]), 0.0);
        assert_eq!(average_loudness(&[0, 100, 200]), 100.0);
    }

    #[tokio::test(start_paused = true)]
    async fn loud_room_boosts_noise_until_stopped() {
        let engine = AudioEngine::software(AudioSettings {
            sample_rate: 8000.0,
            ..AudioSettings::default()
        })
        .shared();
        let stream = MicrophoneStream::new(8000.0);
        let (ctx, gain) = {
            let mut e = engine.lock();
            e.start_noise(NoiseType::Brown, 0.15).unwrap();
            e.attach_microphone(stream.clone(), 256).unwrap();
            (e.context().cloned().unwrap(), e.noise().unwrap().gain)
        };

        // Broadband input lifts every bin well above the floor.
        let mut rng = StdRng::seed_from_u64(3);
        let loud: Vec<f32> = (0..4000).map(|_| rng.gen_range(-0.5f32..0.5)).collect();
        stream.push(&loud);
        ctx.advance(0.25);

        let mut monitor = AdaptiveMonitor::new();
        monitor.start(engine.clone(), settings());
        assert!(monitor.is_active());
        tokio::time::sleep(Duration::from_millis(10)).await;

        ctx.advance(3.0);
        let boosted = ctx.param_value(gain, Param::Gain).unwrap();
        assert!(boosted > 0.2 && boosted <= 0.8, "gain {boosted}");
        assert_eq!(engine.lock().levels().noise, 0.15);

        monitor.stop();
        assert!(!monitor.is_active());
        engine.lock().apply_noise_target(0.15, 0.1);
        tokio::time::sleep(Duration::from_secs(5)).await;
        ctx.advance(1.0);
        assert!((ctx.param_value(gain, Param::Gain).unwrap() - 0.15).abs() < 1e-3);
    }
}
