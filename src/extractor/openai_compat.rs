use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use reqwest::blocking::Client;
use serde_json::{Value, json};

use super::gemini::JSON_ONLY_SUFFIX;
use super::{
    ExtractionRequest, Extractor, ExtractorError, ExtractorSettings, send_json, trim_base_url,
};

pub const API_KEY_ENV: &str = "OPENAI_API_KEY";
pub const DEFAULT_BASE_URL: &str = "https://api.siliconflow.cn/v1";
const PROVIDER: &str = "openai-compatible";

// Model families that answer HTTP 400 to `response_format`.
const NO_JSON_MODE_MARKERS: [&str; 3] = ["glm", "thudm", "qwen/qwen2"];

pub struct OpenAiCompatExtractor {
    client: Client,
    endpoint: String,
    api_key: String,
    model: String,
    max_tokens: u32,
    label: String,
}

impl OpenAiCompatExtractor {
    pub fn new(client: Client, settings: &ExtractorSettings, api_key: String) -> Self {
        let base_url = settings.base_url.as_deref().unwrap_or(DEFAULT_BASE_URL);
        Self {
            client,
            endpoint: format!("{}/chat/completions", trim_base_url(base_url)),
            api_key,
            model: settings.model.clone(),
            max_tokens: settings.max_tokens,
            label: settings.label(),
        }
    }

    pub fn payload(&self, request: &ExtractionRequest<'_>) -> Value {
        let data_uri = format!(
            "data:{};base64,{}",
            request.mime_type,
            STANDARD.encode(request.image)
        );
        let mut payload = json!({
            "model": self.model,
            "messages": [{
                "role": "user",
                "content": [
                    {"type": "text", "text": format!("{}{JSON_ONLY_SUFFIX}", request.prompt())},
                    {"type": "image_url", "image_url": {"url": data_uri}},
                ],
            }],
            "max_tokens": self.max_tokens,
        });
        if supports_json_mode(&self.model) {
            payload["response_format"] = json!({"type": "json_object"});
        }
        payload
    }
}

impl Extractor for OpenAiCompatExtractor {
    fn label(&self) -> &str {
        &self.label
    }

    fn extract(&self, request: &ExtractionRequest<'_>) -> Result<String, ExtractorError> {
        let envelope = send_json(
            PROVIDER,
            self.client
                .post(&self.endpoint)
                .bearer_auth(&self.api_key)
                .json(&self.payload(request)),
        )?;
        response_text(&envelope)
    }
}

pub fn supports_json_mode(model: &str) -> bool {
    let lowered = model.to_lowercase();
    !NO_JSON_MODE_MARKERS
        .iter()
        .any(|marker| lowered.contains(marker))
}

pub fn response_text(envelope: &Value) -> Result<String, ExtractorError> {
    let content = envelope
        .pointer("/choices/0/message/content")
        .ok_or_else(|| ExtractorError::malformed(PROVIDER, "missing choices[0].message.content"))?;

    match content {
        Value::String(text) => Ok(text.clone()),
        Value::Null => Ok(String::new()),
        Value::Array(parts) => Ok(parts
            .iter()
            .filter_map(|part| part.get("text").and_then(Value::as_str))
            .collect::<Vec<&str>>()
            .join("")),
        _ => Err(ExtractorError::malformed(
            PROVIDER,
            "unexpected message content type",
        )),
    }
}
