use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use reqwest::blocking::Client;
use serde_json::{Value, json};

use super::{
    ExtractionRequest, Extractor, ExtractorError, ExtractorSettings, send_json, trim_base_url,
};

pub const API_KEY_ENV: &str = "GEMINI_API_KEY";
pub const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta/models";
pub const JSON_ONLY_SUFFIX: &str = "\nReturn valid JSON only.";
const PROVIDER: &str = "gemini";

pub struct GeminiExtractor {
    client: Client,
    endpoint: String,
    api_key: String,
    model: String,
    temperature: f32,
    label: String,
}

impl GeminiExtractor {
    pub fn new(client: Client, settings: &ExtractorSettings, api_key: String) -> Self {
        let base_url = settings.base_url.as_deref().unwrap_or(DEFAULT_BASE_URL);
        let model = settings
            .model
            .trim()
            .trim_start_matches("models/")
            .to_string();
        Self {
            client,
            endpoint: format!("{}/{model}:generateContent", trim_base_url(base_url)),
            api_key,
            model,
            temperature: settings.temperature,
            label: settings.label(),
        }
    }

    pub fn payload(&self, request: &ExtractionRequest<'_>) -> Value {
        let mut generation_config = json!({"temperature": self.temperature});
        // Image-generation models reject a forced JSON mime type.
        if !self.model.to_lowercase().contains("image") {
            generation_config["response_mime_type"] = json!("application/json");
        }

        json!({
            "contents": [{
                "parts": [
                    {"text": format!("{}{JSON_ONLY_SUFFIX}", request.prompt())},
                    {"inline_data": {
                        "mime_type": request.mime_type,
                        "data": STANDARD.encode(request.image),
                    }},
                ],
            }],
            "generationConfig": generation_config,
        })
    }
}

impl Extractor for GeminiExtractor {
    fn label(&self) -> &str {
        &self.label
    }

    fn extract(&self, request: &ExtractionRequest<'_>) -> Result<String, ExtractorError> {
        let url = format!("{}?key={}", self.endpoint, self.api_key);
        let envelope = send_json(
            PROVIDER,
            self.client.post(url).json(&self.payload(request)),
        )?;
        response_text(&envelope)
    }
}

pub fn response_text(envelope: &Value) -> Result<String, ExtractorError> {
    let candidate = envelope
        .get("candidates")
        .and_then(Value::as_array)
        .and_then(|candidates| candidates.first())
        .ok_or_else(|| {
            let reason = envelope
                .pointer("/promptFeedback/blockReason")
                .and_then(Value::as_str)
                .unwrap_or("no candidates");
            ExtractorError::malformed(PROVIDER, reason)
        })?;

    candidate
        .pointer("/content/parts/0/text")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| {
            let reason = candidate
                .get("finishReason")
                .and_then(Value::as_str)
                .unwrap_or("missing text part");
            ExtractorError::malformed(PROVIDER, reason)
        })
}
