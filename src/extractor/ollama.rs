use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use reqwest::blocking::Client;
use serde_json::{Value, json};
use tracing::warn;

use super::{
    ExtractionRequest, Extractor, ExtractorError, ExtractorSettings, send_json, trim_base_url,
};

pub const DEFAULT_BASE_URL: &str = "http://127.0.0.1:11434";
const PROVIDER: &str = "ollama";

pub struct OllamaExtractor {
    client: Client,
    endpoint: String,
    model: String,
    temperature: f32,
    label: String,
}

impl OllamaExtractor {
    pub fn new(client: Client, settings: &ExtractorSettings) -> Self {
        let base_url = settings.base_url.as_deref().unwrap_or(DEFAULT_BASE_URL);
        Self {
            client,
            endpoint: format!("{}/api/generate", trim_base_url(base_url)),
            model: settings.model.clone(),
            temperature: settings.temperature,
            label: settings.label(),
        }
    }

    pub fn payload(&self, request: &ExtractionRequest<'_>) -> Value {
        json!({
            "model": self.model,
            "prompt": request.prompt(),
            "images": [STANDARD.encode(request.image)],
            "stream": false,
            "options": {"temperature": self.temperature},
        })
    }
}

impl Extractor for OllamaExtractor {
    fn label(&self) -> &str {
        &self.label
    }

    fn extract(&self, request: &ExtractionRequest<'_>) -> Result<String, ExtractorError> {
        let envelope = send_json(
            PROVIDER,
            self.client.post(&self.endpoint).json(&self.payload(request)),
        )?;
        let text = response_text(&envelope)?;
        if text.trim().is_empty() {
            warn!(model = %self.model, "ollama returned an empty response");
        }
        Ok(text)
    }
}

pub fn response_text(envelope: &Value) -> Result<String, ExtractorError> {
    if let Some(message) = envelope.get("error").and_then(Value::as_str) {
        return Err(ExtractorError::malformed(PROVIDER, message));
    }
    envelope
        .get("response")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| ExtractorError::malformed(PROVIDER, "missing `response` field"))
}
