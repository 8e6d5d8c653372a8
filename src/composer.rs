//! Composer: asks the generation service for the next musical segment.
//!
//! The prompt carries the binaural context as hard constraints: the carrier
//! picks an approximate key, the beat picks a tempo band. Replies are
//! validated before use; anything malformed becomes "no composition" and the
//! scheduler retries on its own cadence.

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::config::MAX_SEGMENT_SECONDS;
use crate::error::ServiceError;
use crate::model::Composition;
use crate::service::strip_code_fence;

// ── Musical settings ────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Scale {
    #[default]
    Auto,
    Major,
    Minor,
    Pentatonic,
    Dorian,
    Lydian,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Style {
    #[default]
    Auto,
    Ambient,
    Lullaby,
    MusicBox,
    Classical,
    Drone,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Mood {
    #[default]
    Auto,
    Calm,
    Dreamy,
    Warm,
    Ethereal,
    Melancholic,
}

macro_rules! display_as_debug {
    ($($ty:ty),*) => {$(
        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Debug::fmt(self, f)
            }
        }
    )*};
}

display_as_debug!(Scale, Style, Mood);

/// Overrides for the generated music. `Auto` leaves the choice to the
/// carrier/beat context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MusicSettings {
    pub scale: Scale,
    pub style: Style,
    pub mood: Mood,
}

/// Approximate musical key matching a binaural carrier.
pub fn carrier_to_key(carrier: f64) -> &'static str {
    match carrier {
        c if c < 155.0 => "D3",
        c if c < 165.0 => "Eb3",
        c if c < 175.0 => "E3",
        c if c < 185.0 => "F3",
        c if c < 196.0 => "F#3",
        c if c < 208.0 => "G3",
        c if c < 220.0 => "Ab3",
        _ => "A3",
    }
}

/// Tempo band matching a binaural beat frequency.
pub fn beat_to_tempo_band(beat: f64) -> &'static str {
    if beat <= 4.0 {
        "30-50 BPM"
    } else if beat <= 8.0 {
        "50-70 BPM"
    } else {
        "70-90 BPM"
    }
}

// ── Requests ────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComposeRequest {
    pub mood: String,
    /// Name of the segment that will precede this one.
    pub previous_track: Option<String>,
    pub carrier_freq: f64,
    pub beat_freq: f64,
    pub settings: Option<MusicSettings>,
}

impl ComposeRequest {
    pub fn new(mood: impl Into<String>, carrier_freq: f64, beat_freq: f64) -> Self {
        ComposeRequest {
            mood: mood.into(),
            previous_track: None,
            carrier_freq,
            beat_freq,
            settings: None,
        }
    }
}

pub const SYSTEM_PROMPT: &str = "You compose short, gentle ambient segments for an infant sleep \
soundscape. Reply with JSON only, matching: {\"name\": string, \"bpm\": number, \"key\": string, \
\"description\": string, \"tags\": [string], \"notes\": [{\"pitch\": string like \"G3\", \
\"duration\": seconds, \"startTime\": seconds from segment start, \"velocity\": 0..1}]}.";

pub fn build_prompt(request: &ComposeRequest) -> String {
    let mut prompt = format!(
        "Compose a calming segment. Mood: {}.\n\
         It plays over a binaural drone with carrier {:.1} Hz and beat {:.1} Hz.\n\
         Keep the tonal center near {} and the tempo within {}.\n\
         Use 20 to 40 long, soft notes spanning 12 to 20 seconds.\n",
        request.mood,
        request.carrier_freq,
        request.beat_freq,
        carrier_to_key(request.carrier_freq),
        beat_to_tempo_band(request.beat_freq),
    );
    if let Some(previous) = &request.previous_track {
        prompt.push_str(&format!(
            "This segment follows \"{previous}\"; continue it smoothly without repeating it.\n"
        ));
    }
    if let Some(settings) = &request.settings {
        if settings.scale != Scale::Auto {
            prompt.push_str(&format!("Scale: {}.\n", settings.scale));
        }
        if settings.style != Style::Auto {
            prompt.push_str(&format!("Style: {}.\n", settings.style));
        }
        if settings.mood != Mood::Auto {
            prompt.push_str(&format!("Emotional color: {}.\n", settings.mood));
        }
    }
    prompt
}

/// Parse and validate a composer reply, allowing segments up to
/// [`MAX_SEGMENT_SECONDS`] long.
pub fn parse_composition(text: &str) -> Result<Composition, ServiceError> {
    parse_composition_within(text, MAX_SEGMENT_SECONDS)
}

/// Parse and validate a composer reply whose notes must all end within
/// `max_span` seconds of the segment start.
pub fn parse_composition_within(text: &str, max_span: f64) -> Result<Composition, ServiceError> {
    let mut composition: Composition = serde_json::from_str(strip_code_fence(text))?;

    if composition.name.trim().is_empty() {
        return Err(ServiceError::Invalid("composition has no name".into()));
    }
    if !(composition.bpm.is_finite() && composition.bpm > 0.0) {
        return Err(ServiceError::Invalid(format!("bpm {} is not positive", composition.bpm)));
    }
    for (i, note) in composition.notes.iter_mut().enumerate() {
        if !(note.duration.is_finite() && note.duration > 0.0) {
            return Err(ServiceError::Invalid(format!("note {i} has duration {}", note.duration)));
        }
        if !(note.start_time.is_finite() && note.start_time >= 0.0) {
            return Err(ServiceError::Invalid(format!("note {i} starts at {}", note.start_time)));
        }
        if note.end_time() > max_span {
            return Err(ServiceError::Invalid(format!(
                "note {i} ends at {} s, past the {max_span} s limit",
                note.end_time()
            )));
        }
        note.velocity = if note.velocity.is_finite() {
            note.velocity.clamp(0.0, 1.0)
        } else {
            0.0
        };
    }
    Ok(composition)
}

// ── Composers ───────────────────────────────────────────────

/// Source of new segments. `None` means "nothing usable this time".
pub trait Composer: Send + Sync + 'static {
    fn compose(&self, request: &ComposeRequest) -> impl Future<Output = Option<Composition>> + Send;
}

#[cfg(feature = "remote")]
pub use http::HttpComposer;

#[cfg(feature = "remote")]
mod http {
    use std::future::Future;

    use tracing::{info, warn};

    use super::{ComposeRequest, Composer, SYSTEM_PROMPT, build_prompt, parse_composition_within};
    use crate::config::MAX_SEGMENT_SECONDS;
    use crate::model::Composition;
    use crate::service::GenerationClient;

    #[derive(Debug, Clone)]
    pub struct HttpComposer {
        client: GenerationClient,
        max_segment_seconds: f64,
    }

    impl HttpComposer {
        pub fn new(client: GenerationClient) -> Self {
            HttpComposer {
                client,
                max_segment_seconds: MAX_SEGMENT_SECONDS,
            }
        }

        /// Reject replies with notes ending later than `seconds`.
        pub fn with_max_segment_seconds(mut self, seconds: f64) -> Self {
            self.max_segment_seconds = seconds;
            self
        }
    }

    impl Composer for HttpComposer {
        fn compose(&self, request: &ComposeRequest) -> impl Future<Output = Option<Composition>> + Send {
            let prompt = build_prompt(request);
            async move {
                let result = match self.client.generate(SYSTEM_PROMPT, &prompt).await {
                    Ok(text) => parse_composition_within(&text, self.max_segment_seconds),
                    Err(e) => Err(e),
                };
                match result {
                    Ok(composition) => {
                        info!(name = %composition.name, notes = composition.notes.len(), "composition received");
                        Some(composition)
                    }
                    Err(e) => {
                        warn!("composer failed: {e}");
                        None
                    }
                }
            }
        }
    }
}

/// Composer replaying canned replies, for offline hosts and tests.
///
/// Each call pops the next queued reply; once the queue is empty every call
/// yields the fallback. Requests are recorded.
#[derive(Debug, Clone, Default)]
pub struct ScriptedComposer {
    inner: Arc<Mutex<Script>>,
}

#[derive(Debug, Default)]
struct Script {
    queue: VecDeque<Option<Composition>>,
    fallback: Option<Composition>,
    requests: Vec<ComposeRequest>,
}

impl ScriptedComposer {
    /// Always answers with `composition`.
    pub fn repeating(composition: Composition) -> Self {
        let composer = Self::default();
        composer.inner.lock().fallback = Some(composition);
        composer
    }

    /// Queue a raw service reply. Malformed text queues a `None`.
    pub fn push_reply(&self, text: &str) {
        let parsed = parse_composition(text)
            .inspect_err(|e| warn!("scripted reply rejected: {e}"))
            .ok();
        self.inner.lock().queue.push_back(parsed);
    }

    pub fn push(&self, composition: Option<Composition>) {
        self.inner.lock().queue.push_back(composition);
    }

    pub fn requests(&self) -> Vec<ComposeRequest> {
        self.inner.lock().requests.clone()
    }
}

impl Composer for ScriptedComposer {
    fn compose(&self, request: &ComposeRequest) -> impl Future<Output = Option<Composition>> + Send {
        let reply = {
            let mut script = self.inner.lock();
            script.requests.push(request.clone());
            script.queue.pop_front().unwrap_or_else(|| script.fallback.clone())
        };
        async move { reply }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const REPLY: &str = r#"```json
{
  "name": "Moonlit Drift",
  "bpm": 42,
  "key": "D3",
  "description": "slow",
  "notes": [
    {"pitch": "D3", "duration": 4.0, "startTime": 0.0, "velocity": 0.5},
    {"pitch": "A3", "duration": 2.5, "startTime": 10.0, "velocity": 1.7}
  ]
}
```"#;

    #[test]
    fn key_table_boundaries() {
        assert_eq!(carrier_to_key(100.0), "D3");
        assert_eq!(carrier_to_key(154.9), "D3");
        assert_eq!(carrier_to_key(155.0), "Eb3");
        assert_eq!(carrier_to_key(170.0), "E3");
        assert_eq!(carrier_to_key(180.0), "F3");
        assert_eq!(carrier_to_key(195.0), "F#3");
        assert_eq!(carrier_to_key(200.0), "G3");
        assert_eq!(carrier_to_key(219.9), "Ab3");
        assert_eq!(carrier_to_key(220.0), "A3");
        assert_eq!(carrier_to_key(432.0), "A3");
    }

    #[test]
    fn tempo_band_boundaries() {
        assert_eq!(beat_to_tempo_band(0.5), "30-50 BPM");
        assert_eq!(beat_to_tempo_band(4.0), "30-50 BPM");
        assert_eq!(beat_to_tempo_band(4.1), "50-70 BPM");
        assert_eq!(beat_to_tempo_band(8.0), "50-70 BPM");
        assert_eq!(beat_to_tempo_band(10.0), "70-90 BPM");
    }

    #[test]
    fn prompt_carries_constraints_and_continuity() {
        let mut request = ComposeRequest::new("deep sleep", 150.0, 2.5);
        request.previous_track = Some("Moonlit Drift".into());
        request.settings = Some(MusicSettings {
            scale: Scale::Pentatonic,
            style: Style::Auto,
            mood: Mood::Dreamy,
        });
        let prompt = build_prompt(&request);
        assert!(prompt.contains("near D3"));
        assert!(prompt.contains("30-50 BPM"));
        assert!(prompt.contains("follows \"Moonlit Drift\""));
        assert!(prompt.contains("Scale: Pentatonic"));
        assert!(prompt.contains("Emotional color: Dreamy"));
        assert!(!prompt.contains("Style:"));
    }

    #[test]
    fn parses_fenced_reply_and_clamps_velocity() {
        let c = parse_composition(REPLY).unwrap();
        assert_eq!(c.name, "Moonlit Drift");
        assert_eq!(c.notes.len(), 2);
        assert_eq!(c.notes[1].velocity, 1.0);
        assert_eq!(c.span(), Some(12.5));
    }

    #[test]
    fn missing_notes_is_rejected() {
        let err = parse_composition(r#"{"name":"x","bpm":40}"#).unwrap_err();
        assert!(matches!(err, ServiceError::Json(_)));
    }

    #[test]
    fn invalid_fields_are_rejected() {
        for bad in [
            r#"{"name":"","bpm":40,"notes":[]}"#,
            r#"{"name":"x","bpm":0,"notes":[]}"#,
            r#"{"name":"x","bpm":40,"notes":[{"pitch":"C4","duration":0,"startTime":0,"velocity":0.5}]}"#,
            r#"{"name":"x","bpm":40,"notes":[{"pitch":"C4","duration":1,"startTime":-1,"velocity":0.5}]}"#,
            "not json at all",
        ] {
            assert!(parse_composition(bad).is_err(), "{bad}");
        }
    }

    #[test]
    fn notes_past_the_segment_limit_are_rejected() {
        let endless = r#"{"name":"Endless","bpm":40,"notes":[{"pitch":"D3","duration":1e20,"startTime":0,"velocity":0.5}]}"#;
        let err = parse_composition(endless).unwrap_err();
        assert!(matches!(err, ServiceError::Invalid(ref msg) if msg.contains("limit")), "{err}");

        let late = r#"{"name":"Late","bpm":40,"notes":[{"pitch":"D3","duration":4,"startTime":18,"velocity":0.5}]}"#;
        assert!(parse_composition_within(late, 20.0).is_err());
        assert_eq!(parse_composition_within(late, 22.0).unwrap().span(), Some(22.0));
    }

    #[tokio::test]
    async fn scripted_composer_replays_then_falls_back() {
        let fallback = parse_composition(REPLY).unwrap();
        let composer = ScriptedComposer::repeating(fallback.clone());
        composer.push_reply(r#"{"name":"x","bpm":40}"#);

        let request = ComposeRequest::new("calm", 150.0, 2.5);
        assert_eq!(composer.compose(&request).await, None);
        assert_eq!(composer.compose(&request).await, Some(fallback));
        assert_eq!(composer.requests().len(), 2);
    }
}
