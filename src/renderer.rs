//! WAV renderer: renders a soundscape offline to a WAV byte buffer.
//!
//! The same engine that drives live playback is run against a
//! [`SoftwareContext`], with the composition looped segment after segment
//! for as long as requested.

use crate::config::AudioSettings;
use crate::engine::AudioEngine;
use crate::error::GraphError;
use crate::graph::{AudioContext, SoftwareContext};
use crate::model::{AudioState, Composition};

/// Render `seconds` of the soundscape described by `state`, looping
/// `composition`, as 16-bit stereo PCM WAV bytes.
pub fn render_wav(
    composition: &Composition,
    state: &AudioState,
    seconds: f64,
    settings: &AudioSettings,
) -> Result<Vec<u8>, GraphError> {
    let (left, right) = render_stereo(composition, state, seconds, settings)?;
    let samples: Vec<i16> = left
        .iter()
        .zip(&right)
        .flat_map(|(l, r)| [to_pcm(*l), to_pcm(*r)])
        .collect();
    Ok(encode_wav(&samples, settings.sample_rate.round() as u32, 2))
}

/// Render `seconds` of the soundscape as separate left/right channels.
pub fn render_stereo(
    composition: &Composition,
    state: &AudioState,
    seconds: f64,
    settings: &AudioSettings,
) -> Result<(Vec<f32>, Vec<f32>), GraphError> {
    let ctx = SoftwareContext::new(settings.sample_rate);
    let handle = ctx.clone();
    let mut engine = AudioEngine::new(settings.clone(), move |_| handle.clone());

    engine.resume()?;
    engine.set_music_volume(state.vol_music);
    engine.set_reverb_mix(state.reverb_mix);
    engine.set_delay_mix(state.delay_mix);
    engine.start_binaural(state.carrier_freq, state.beat_freq, state.vol_binaural)?;
    engine.start_noise(state.noise_type, state.vol_noise)?;

    let total = (seconds.max(0.0) * settings.sample_rate).round() as usize;
    let chunk = ((settings.schedule_lead * settings.sample_rate).round() as usize).max(1);
    let looping = composition.span().is_some_and(|span| span > 0.0);
    let mut left = Vec::with_capacity(total);
    let mut right = Vec::with_capacity(total);
    let mut scheduled = false;

    while left.len() < total {
        // Queue the next pass while the current one is inside its last two
        // leads, so it splices onto the end.
        let due = match engine.segment_end() {
            Some(end) => ctx.current_time() >= end - 2.0 * settings.schedule_lead,
            None => !scheduled,
        };
        if due && (looping || !scheduled) {
            engine.reap();
            engine.play_composition(&composition.notes)?;
            scheduled = true;
        }

        let (l, r) = ctx.render(chunk.min(total - left.len()));
        left.extend(l);
        right.extend(r);
    }
    Ok((left, right))
}

fn to_pcm(sample: f32) -> i16 {
    (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16
}

/// Encode interleaved i16 PCM samples to a WAV byte buffer.
pub fn encode_wav(samples: &[i16], sample_rate: u32, channels: u16) -> Vec<u8> {
    let bits_per_sample: u16 = 16;
    let byte_rate = sample_rate * channels as u32 * (bits_per_sample as u32 / 8);
    let block_align = channels * (bits_per_sample / 8);
    let data_size = (samples.len() * 2) as u32;

    let mut buf = Vec::with_capacity(44 + data_size as usize);

    buf.extend_from_slice(b"RIFF");
    buf.extend_from_slice(&(36 + data_size).to_le_bytes());
    buf.extend_from_slice(b"WAVE");

    buf.extend_from_slice(b"fmt ");
    buf.extend_from_slice(&16u32.to_le_bytes());
    buf.extend_from_slice(&1u16.to_le_bytes()); // PCM
    buf.extend_from_slice(&channels.to_le_bytes());
    buf.extend_from_slice(&sample_rate.to_le_bytes());
    buf.extend_from_slice(&byte_rate.to_le_bytes());
    buf.extend_from_slice(&block_align.to_le_bytes());
    buf.extend_from_slice(&bits_per_sample.to_le_bytes());

    buf.extend_from_slice(b"data");
    buf.extend_from_slice(&data_size.to_le_bytes());
    for &sample in samples {
        buf.extend_from_slice(&sample.to_le_bytes());
    }
    buf
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::NoteEvent;

    fn settings() -> AudioSettings {
        AudioSettings {
            sample_rate: 8000.0,
            ..AudioSettings::default()
        }
    }

    fn chime(duration: f64) -> Composition {
        Composition {
            name: "Chime".into(),
            bpm: 60.0,
            key: None,
            notes: vec![NoteEvent {
                pitch: "A4".into(),
                duration,
                start_time: 0.0,
                velocity: 1.0,
            }],
            description: String::new(),
            tags: None,
        }
    }

    fn rms(samples: &[f32]) -> f32 {
        (samples.iter().map(|s| s * s).sum::<f32>() / samples.len() as f32).sqrt()
    }

    #[test]
    fn wav_header_valid() {
        let wav = render_wav(&chime(0.5), &AudioState::default(), 0.5, &settings()).unwrap();

        assert_eq!(&wav[0..4], b"RIFF");
        assert_eq!(&wav[8..12], b"WAVE");
        assert_eq!(&wav[12..16], b"fmt ");
        assert_eq!(&wav[36..40], b"data");
        assert_eq!(u32::from_le_bytes(wav[24..28].try_into().unwrap()), 8000);
        assert_eq!(u16::from_le_bytes(wav[22..24].try_into().unwrap()), 2);
        let riff_size = u32::from_le_bytes(wav[4..8].try_into().unwrap());
        assert_eq!(riff_size as usize, wav.len() - 8);
    }

    #[test]
    fn wav_size_correct() {
        let wav = render_wav(&chime(0.5), &AudioState::default(), 1.0, &settings()).unwrap();
        let data_size = u32::from_le_bytes(wav[40..44].try_into().unwrap());
        // 8000 frames, 2 channels, 2 bytes per sample.
        assert_eq!(data_size, 8000 * 2 * 2);
        assert_eq!(wav.len(), 44 + data_size as usize);
    }

    #[test]
    fn drones_are_audible() {
        let (left, right) = render_stereo(&chime(0.5), &AudioState::default(), 1.0, &settings()).unwrap();
        assert!(rms(&left[4000..]) > 0.001);
        assert!(rms(&right[4000..]) > 0.001);
        assert!(left.iter().chain(&right).all(|s| s.is_finite()));
    }

    #[test]
    fn composition_loops_for_the_whole_render() {
        let music_only = AudioState {
            vol_binaural: 0.0,
            vol_noise: 0.0,
            vol_music: 1.0,
            reverb_mix: 0.0,
            delay_mix: 0.0,
            ..AudioState::default()
        };
        let (left, _) = render_stereo(&chime(0.5), &music_only, 2.0, &settings()).unwrap();
        // Passes start at 0.1, 0.6, 1.1 and 1.6 seconds.
        assert!(rms(&left[14_400..15_200]) > 0.01);

        let empty = Composition {
            notes: Vec::new(),
            ..chime(0.5)
        };
        let (left, _) = render_stereo(&empty, &music_only, 1.0, &settings()).unwrap();
        assert!(rms(&left) < 1e-6);
    }
}
