//! Remote AI-vision client.

use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;

use super::{VisionFindings, VisionService};
use crate::config::{ConfigError, ConfigResult, VisionEndpoint};
use crate::layer::{LayerError, LayerResult};

const SERVICE: &str = "vision";

/// Posts raw image bytes to a vision endpoint and parses the findings.
///
/// The request timeout matches the vision layer budget. Dropping the
/// returned future aborts the in-flight request.
pub struct HttpVisionService {
    endpoint: VisionEndpoint,
    client: reqwest::Client,
}

impl HttpVisionService {
    pub fn new(endpoint: VisionEndpoint, timeout: Duration) -> ConfigResult<Self> {
        if endpoint.url.trim().is_empty() {
            return Err(ConfigError::Invalid("vision.url must not be empty".into()));
        }
        let client = reqwest::Client::builder()
            .user_agent(concat!("trustscore/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()
            .map_err(|e| ConfigError::Invalid(format!("vision http client: {e}")))?;
        Ok(Self { endpoint, client })
    }

    pub fn endpoint(&self) -> &VisionEndpoint {
        &self.endpoint
    }
}

#[async_trait]
impl VisionService for HttpVisionService {
    async fn analyze(&self, image: &[u8]) -> LayerResult<VisionFindings> {
        let mut request = self
            .client
            .post(&self.endpoint.url)
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(image.to_vec());
        if let Some(model) = &self.endpoint.model {
            request = request.query(&[("model", model)]);
        }
        if let Some(key) = &self.endpoint.api_key {
            request = request.query(&[("key", key)]);
        }

        let response = request.send().await.map_err(|e| LayerError::Unavailable {
            service: SERVICE,
            detail: e.to_string(),
        })?;
        let status = response.status();
        let body = response.text().await.map_err(|e| LayerError::Unavailable {
            service: SERVICE,
            detail: e.to_string(),
        })?;
        if !status.is_success() {
            return Err(LayerError::Unavailable {
                service: SERVICE,
                detail: format!("HTTP {status}: {}", truncate(&body, 200)),
            });
        }

        parse_findings(&body)
    }
}

fn json_object_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"(?s)\{.*\}").ok())
        .as_ref()
}

fn truncate(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// Parse a vision response.
///
/// Accepts a bare findings object, a generative-model envelope whose first
/// candidate carries the findings as text, or free text wrapping a JSON
/// object (for example inside a markdown fence).
pub fn parse_findings(body: &str) -> LayerResult<VisionFindings> {
    let text = match serde_json::from_str::<serde_json::Value>(body) {
        Ok(value) => match value.pointer("/candidates/0/content/parts/0/text") {
            Some(serde_json::Value::String(inner)) => inner.clone(),
            _ if value.is_object() => {
                return serde_json::from_value(value).map_err(|e| malformed(e.to_string()));
            }
            _ => body.to_string(),
        },
        Err(_) => body.to_string(),
    };

    let object = json_object_pattern()
        .and_then(|pattern| pattern.find(&text))
        .ok_or_else(|| malformed(format!("no JSON object in {:?}", truncate(&text, 80))))?;
    serde_json::from_str(object.as_str()).map_err(|e| malformed(e.to_string()))
}

fn malformed(detail: String) -> LayerError {
    LayerError::MalformedResponse {
        service: SERVICE,
        detail,
    }
}
