//! Generation service plumbing shared by the composer and the orchestrator.
//!
//! Both talk to a `generateContent`-style language model endpoint and ask
//! for a JSON reply. Request bodies and reply unwrapping are plain functions
//! so they work without the `remote` feature; [`GenerationClient`] adds the
//! HTTP transport.

use serde_json::{Value, json};

use crate::error::ServiceError;

/// Request body asking for a single JSON reply to `prompt`.
pub fn request_body(system: &str, prompt: &str) -> Value {
    json!({
        "systemInstruction": { "parts": [{ "text": system }] },
        "contents": [{ "role": "user", "parts": [{ "text": prompt }] }],
        "generationConfig": { "responseMimeType": "application/json" }
    })
}

/// Text of the first candidate's parts, concatenated.
pub fn extract_text(reply: &Value) -> Result<String, ServiceError> {
    let parts = reply
        .pointer("/candidates/0/content/parts")
        .and_then(Value::as_array)
        .ok_or(ServiceError::EmptyResponse)?;
    let text: String = parts.iter().filter_map(|p| p.get("text").and_then(Value::as_str)).collect();
    if text.trim().is_empty() {
        return Err(ServiceError::EmptyResponse);
    }
    Ok(text)
}

/// Drop a surrounding Markdown code fence, with or without a language tag.
pub fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(inner) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let inner = inner.strip_suffix("```").unwrap_or(inner);
    // Skip a language tag such as `json` on the opening line.
    match inner.find('\n') {
        Some(nl) if !inner[..nl].trim_start().starts_with(['{', '[']) => inner[nl + 1..].trim(),
        _ => inner.trim(),
    }
}

#[cfg(feature = "remote")]
pub use client::GenerationClient;

#[cfg(feature = "remote")]
mod client {
    use std::time::Duration;

    use serde_json::Value;
    use tracing::debug;

    use super::{extract_text, request_body};
    use crate::config::ServiceSettings;
    use crate::error::ServiceError;

    /// HTTP client for the generation endpoint.
    #[derive(Debug, Clone)]
    pub struct GenerationClient {
        http: reqwest::Client,
        url: String,
        api_key: String,
    }

    impl GenerationClient {
        /// Build from settings, reading the key from `settings.api_key_env`.
        pub fn from_settings(settings: &ServiceSettings) -> Result<Self, ServiceError> {
            let api_key = std::env::var(&settings.api_key_env)
                .ok()
                .filter(|k| !k.trim().is_empty())
                .ok_or_else(|| ServiceError::MissingApiKey(settings.api_key_env.clone()))?;
            Self::new(settings, api_key)
        }

        pub fn new(settings: &ServiceSettings, api_key: String) -> Result<Self, ServiceError> {
            let http = reqwest::Client::builder()
                .timeout(Duration::from_secs(settings.timeout_secs))
                .build()
                .map_err(|e| ServiceError::Transport(e.to_string()))?;
            let url = format!(
                "{}/models/{}:generateContent",
                settings.endpoint.trim_end_matches('/'),
                settings.model
            );
            Ok(GenerationClient { http, url, api_key })
        }

        /// Send `prompt` and return the model's text reply.
        pub async fn generate(&self, system: &str, prompt: &str) -> Result<String, ServiceError> {
            debug!(url = %self.url, "generation request");
            let response = self
                .http
                .post(&self.url)
                .header("x-goog-api-key", &self.api_key)
                .json(&request_body(system, prompt))
                .send()
                .await
                .map_err(|e| ServiceError::Transport(e.to_string()))?;

            let status = response.status();
            if !status.is_success() {
                return Err(ServiceError::Status(status.as_u16()));
            }
            let reply: Value = response
                .json()
                .await
                .map_err(|e| ServiceError::Transport(e.to_string()))?;
            extract_text(&reply)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_first_candidate_text() {
        let reply = json!({
            "candidates": [
                { "content": { "parts": [{ "text": "{\"a\":" }, { "text": "1}" }] } },
                { "content": { "parts": [{ "text": "ignored" }] } }
            ]
        });
        assert_eq!(extract_text(&reply).unwrap(), "{\"a\":1}");
    }

    #[test]
    fn missing_or_blank_text_is_empty_response() {
        for reply in [
            json!({}),
            json!({ "candidates": [] }),
            json!({ "candidates": [{ "content": { "parts": [{ "text": "  " }] } }] }),
        ] {
            assert!(matches!(extract_text(&reply), Err(ServiceError::EmptyResponse)));
        }
    }

    #[test]
    fn fences_are_stripped() {
        assert_eq!(strip_code_fence("```json\n{\"x\":1}\n```"), "{\"x\":1}");
        assert_eq!(strip_code_fence("```\n{\"x\":1}```"), "{\"x\":1}");
        assert_eq!(strip_code_fence("```{\"x\":1}```"), "{\"x\":1}");
        assert_eq!(strip_code_fence("  {\"x\":1} "), "{\"x\":1}");
    }

    #[test]
    fn body_requests_json() {
        let body = request_body("sys", "hello");
        assert_eq!(body["generationConfig"]["responseMimeType"], "application/json");
        assert_eq!(body["contents"][0]["parts"][0]["text"], "hello");
    }
}
