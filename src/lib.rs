pub mod composer;
pub mod config;
pub mod dsp;
pub mod engine;
pub mod error;
pub mod graph;
pub mod library;
pub mod microphone;
pub mod model;
pub mod monitor;
pub mod orchestrator;
#[cfg(feature = "device")]
pub mod output;
pub mod renderer;
pub mod scheduler;
pub mod service;
pub mod session;
pub mod task;

use crate::config::AudioSettings;
use crate::model::{AudioState, Composition};
use wasm_bindgen::prelude::*;

/// The crate version, read from Cargo.toml at compile time.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// WASM-exposed: return the lullaby-core version string.
#[wasm_bindgen]
pub fn core_version() -> String {
    VERSION.to_string()
}

/// WASM-exposed: validate a composer reply and return it as a composition
/// object.
#[wasm_bindgen]
pub fn parse_composition_json(text: &str) -> Result<JsValue, JsValue> {
    let composition = composer::parse_composition(text).map_err(|e| JsValue::from_str(&format!("{e}")))?;
    serde_wasm_bindgen::to_value(&composition).map_err(|e| JsValue::from_str(&format!("{e}")))
}

/// WASM-exposed: render `seconds` of a soundscape, looping `composition`,
/// to a WAV byte array.
#[wasm_bindgen]
pub fn render_soundscape_wav(
    composition: JsValue,
    state: JsValue,
    seconds: f64,
    sample_rate: u32,
) -> Result<Vec<u8>, JsValue> {
    let composition: Composition =
        serde_wasm_bindgen::from_value(composition).map_err(|e| JsValue::from_str(&format!("{e}")))?;
    let state: AudioState = serde_wasm_bindgen::from_value(state).map_err(|e| JsValue::from_str(&format!("{e}")))?;
    let settings = AudioSettings {
        sample_rate: sample_rate as f64,
        ..AudioSettings::default()
    };
    renderer::render_wav(&composition, &state, seconds, &settings).map_err(|e| JsValue::from_str(&format!("{e}")))
}
