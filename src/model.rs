//! Data model shared by the engine, the scheduler and the remote services.
//!
//! Field names serialize in camelCase, matching the JSON the composer
//! produces and the preset library stores.

use std::fmt;

use serde::{Deserialize, Serialize};

/// One note of a generated segment. `start_time` is an offset from the
/// segment start; all values are seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NoteEvent {
    pub pitch: String,
    pub duration: f64,
    pub start_time: f64,
    pub velocity: f64,
}

impl NoteEvent {
    pub fn end_time(&self) -> f64 {
        self.start_time + self.duration
    }
}

/// One generated musical segment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Composition {
    pub name: String,
    pub bpm: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    /// Order of arrival is kept for display; playback does not depend on it.
    pub notes: Vec<NoteEvent>,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
}

impl Composition {
    /// Latest note end, or `None` for an empty segment.
    pub fn span(&self) -> Option<f64> {
        self.notes.iter().map(NoteEvent::end_time).reduce(f64::max)
    }
}

/// Color of the masking noise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NoiseType {
    White,
    Grey,
    #[default]
    Brown,
}

impl fmt::Display for NoiseType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            NoiseType::White => "white",
            NoiseType::Grey => "grey",
            NoiseType::Brown => "brown",
        })
    }
}

/// Every player-visible parameter. Owned by the host UI; the engine only
/// ever receives individual values taken from it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AudioState {
    pub vol_binaural: f64,
    pub vol_noise: f64,
    pub vol_music: f64,
    pub carrier_freq: f64,
    pub beat_freq: f64,
    pub noise_type: NoiseType,
    pub reverb_mix: f64,
    pub delay_mix: f64,
    pub adaptive_noise: bool,
}

impl Default for AudioState {
    fn default() -> Self {
        AudioState {
            vol_binaural: 0.3,
            vol_noise: 0.15,
            vol_music: 0.5,
            carrier_freq: 150.0,
            beat_freq: 2.5,
            noise_type: NoiseType::Brown,
            reverb_mix: 0.3,
            delay_mix: 0.2,
            adaptive_noise: false,
        }
    }
}
