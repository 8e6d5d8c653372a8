//! Orchestrator: turns a free-text intent into a full soundscape setup.

use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::ServiceError;
use crate::model::NoiseType;
use crate::service::strip_code_fence;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Personalization {
    pub baby_disposition: Option<String>,
    pub emotional_state: Option<String>,
    pub time_of_day: Option<String>,
    pub environment: Option<String>,
    pub musical_preference: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrchestrateRequest {
    pub intent: String,
    #[serde(default)]
    pub personalization: Option<Personalization>,
}

impl OrchestrateRequest {
    pub fn new(intent: impl Into<String>) -> Self {
        OrchestrateRequest {
            intent: intent.into(),
            personalization: None,
        }
    }
}

/// A complete station setup chosen by the orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgenticConfig {
    pub station_name: String,
    pub carrier_freq: f64,
    pub beat_freq: f64,
    pub noise_type: NoiseType,
    pub noise_volume: f64,
    /// Mood line handed to the composer.
    pub music_prompt: String,
    #[serde(default)]
    pub reasoning: String,
}

pub const SYSTEM_PROMPT: &str = "You configure an infant sleep soundscape. Reply with JSON only, \
matching: {\"stationName\": string, \"carrierFreq\": Hz 100-400, \"beatFreq\": Hz 0.5-12, \
\"noiseType\": \"white\"|\"grey\"|\"brown\", \"noiseVolume\": 0..1, \"musicPrompt\": string, \
\"reasoning\": string}.";

pub fn build_prompt(request: &OrchestrateRequest) -> String {
    let mut prompt = format!("Parent's request: {}\n", request.intent.trim());
    if let Some(p) = &request.personalization {
        let fields = [
            ("Baby's disposition", &p.baby_disposition),
            ("Emotional state", &p.emotional_state),
            ("Time of day", &p.time_of_day),
            ("Environment", &p.environment),
            ("Musical preference", &p.musical_preference),
        ];
        for (label, value) in fields {
            if let Some(value) = value.as_deref().filter(|v| !v.trim().is_empty()) {
                prompt.push_str(&format!("{label}: {value}\n"));
            }
        }
    }
    prompt
}

/// Parse and validate an orchestrator reply.
pub fn parse_config(text: &str) -> Result<AgenticConfig, ServiceError> {
    let mut config: AgenticConfig = serde_json::from_str(strip_code_fence(text))?;
    if config.station_name.trim().is_empty() {
        return Err(ServiceError::Invalid("station has no name".into()));
    }
    if !(config.carrier_freq.is_finite() && config.carrier_freq > 0.0) {
        return Err(ServiceError::Invalid(format!("carrier {} Hz", config.carrier_freq)));
    }
    if !(config.beat_freq.is_finite() && config.beat_freq >= 0.0) {
        return Err(ServiceError::Invalid(format!("beat {} Hz", config.beat_freq)));
    }
    config.noise_volume = if config.noise_volume.is_finite() {
        config.noise_volume.clamp(0.0, 1.0)
    } else {
        0.0
    };
    Ok(config)
}

pub trait Orchestrator: Send + Sync + 'static {
    fn orchestrate(&self, request: &OrchestrateRequest) -> impl Future<Output = Option<AgenticConfig>> + Send;
}

#[cfg(feature = "remote")]
pub use http::HttpOrchestrator;

#[cfg(feature = "remote")]
mod http {
    use std::future::Future;

    use tracing::{info, warn};

    use super::{AgenticConfig, OrchestrateRequest, Orchestrator, SYSTEM_PROMPT, build_prompt, parse_config};
    use crate::service::GenerationClient;

    #[derive(Debug, Clone)]
    pub struct HttpOrchestrator {
        client: GenerationClient,
    }

    impl HttpOrchestrator {
        pub fn new(client: GenerationClient) -> Self {
            HttpOrchestrator { client }
        }
    }

    impl Orchestrator for HttpOrchestrator {
        fn orchestrate(&self, request: &OrchestrateRequest) -> impl Future<Output = Option<AgenticConfig>> + Send {
            let prompt = build_prompt(request);
            async move {
                let result = match self.client.generate(SYSTEM_PROMPT, &prompt).await {
                    Ok(text) => parse_config(&text),
                    Err(e) => Err(e),
                };
                result
                    .inspect(|c| info!(station = %c.station_name, "station configured"))
                    .inspect_err(|e| warn!("orchestrator failed: {e}"))
                    .ok()
            }
        }
    }
}

/// Orchestrator answering from a fixed list, for offline hosts and tests.
#[derive(Debug, Clone, Default)]
pub struct ScriptedOrchestrator {
    replies: Arc<Mutex<Vec<Option<AgenticConfig>>>>,
}

impl ScriptedOrchestrator {
    pub fn new(replies: Vec<Option<AgenticConfig>>) -> Self {
        let mut replies = replies;
        replies.reverse();
        ScriptedOrchestrator {
            replies: Arc::new(Mutex::new(replies)),
        }
    }
}

impl Orchestrator for ScriptedOrchestrator {
    fn orchestrate(&self, _request: &OrchestrateRequest) -> impl Future<Output = Option<AgenticConfig>> + Send {
        let reply = self.replies.lock().pop().flatten();
        async move { reply }
    }
}
