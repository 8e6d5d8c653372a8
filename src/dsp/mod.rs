//! DSP building blocks: the per-sample processors behind the software
//! audio graph.
//!
//! Everything here is plain deterministic Rust so the live device path
//! and the offline WAV renderer produce the same audio.

pub mod analyser;
pub mod delay;
pub mod filter;
pub mod oscillator;
pub mod param;
pub mod reverb;
