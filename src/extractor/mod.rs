use std::time::Duration;

use anyhow::{Context, Result, bail};
use reqwest::blocking::{Client, RequestBuilder};
use serde_json::Value;
use thiserror::Error;

use crate::cli::Provider;
use crate::util::head_chars;

pub mod gemini;
pub mod ollama;
pub mod openai_compat;
pub mod retry;
#[cfg(test)]
mod tests;

pub const MAX_TIMEOUT_SEC: u64 = 600;
const ERROR_BODY_MAX_CHARS: usize = 500;

/// One image plus the text that tells the model what to pull out of it.
#[derive(Debug, Clone, Copy)]
pub struct ExtractionRequest<'a> {
    pub image: &'a [u8],
    pub mime_type: &'a str,
    pub instruction: &'a str,
    pub context: Option<&'a str>,
}

impl ExtractionRequest<'_> {
    pub fn prompt(&self) -> String {
        match self.context.map(str::trim).filter(|context| !context.is_empty()) {
            Some(context) => format!("{}\n\nContext: {context}", self.instruction),
            None => self.instruction.to_string(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ExtractorError {
    #[error("{provider} request timed out")]
    Timeout { provider: &'static str },
    #[error("{provider} returned HTTP {status}: {body}")]
    Http {
        provider: &'static str,
        status: u16,
        body: String,
    },
    #[error("{provider} transport error: {message}")]
    Transport {
        provider: &'static str,
        message: String,
    },
    #[error("{provider} response envelope malformed: {detail}")]
    MalformedEnvelope {
        provider: &'static str,
        detail: String,
    },
    #[error("extraction cancelled")]
    Cancelled,
}

impl ExtractorError {
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Timeout { .. } => true,
            Self::Http { status, body, .. } => match status {
                429 | 503 => true,
                400 => {
                    let lowered = body.to_lowercase();
                    lowered.contains("quota") || lowered.contains("limit")
                }
                _ => false,
            },
            Self::Transport { .. } | Self::MalformedEnvelope { .. } | Self::Cancelled => false,
        }
    }

    fn from_transport(provider: &'static str, err: reqwest::Error) -> Self {
        if err.is_timeout() {
            return Self::Timeout { provider };
        }
        // The gemini endpoint carries its key in the URL.
        Self::Transport {
            provider,
            message: err.without_url().to_string(),
        }
    }

    fn malformed(provider: &'static str, detail: impl Into<String>) -> Self {
        Self::MalformedEnvelope {
            provider,
            detail: detail.into(),
        }
    }
}

pub trait Extractor: Send + Sync {
    fn label(&self) -> &str;

    fn extract(&self, request: &ExtractionRequest<'_>) -> Result<String, ExtractorError>;
}

#[derive(Debug, Clone)]
pub struct ExtractorSettings {
    pub provider: Provider,
    pub model: String,
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    pub timeout: Duration,
    pub temperature: f32,
    pub max_tokens: u32,
}

impl ExtractorSettings {
    pub fn label(&self) -> String {
        format!("{}:{}", self.provider.as_str(), self.model)
    }
}

pub fn build_extractor(settings: &ExtractorSettings) -> Result<Box<dyn Extractor>> {
    if settings.model.trim().is_empty() {
        bail!("--model must not be empty for provider {}", settings.provider.as_str());
    }
    if settings.timeout.is_zero() || settings.timeout > Duration::from_secs(MAX_TIMEOUT_SEC) {
        bail!(
            "--timeout-sec must be within 1..={MAX_TIMEOUT_SEC}, got {}",
            settings.timeout.as_secs()
        );
    }

    let client = http_client(settings.timeout)?;
    let extractor: Box<dyn Extractor> = match settings.provider {
        Provider::Ollama => Box::new(ollama::OllamaExtractor::new(client, settings)),
        Provider::Gemini => {
            let api_key = resolve_api_key(settings.api_key.as_deref(), gemini::API_KEY_ENV)?;
            Box::new(gemini::GeminiExtractor::new(client, settings, api_key))
        }
        Provider::OpenaiCompatible => {
            let api_key = resolve_api_key(settings.api_key.as_deref(), openai_compat::API_KEY_ENV)?;
            Box::new(openai_compat::OpenAiCompatExtractor::new(
                client, settings, api_key,
            ))
        }
    };

    Ok(extractor)
}

fn http_client(timeout: Duration) -> Result<Client> {
    Client::builder()
        .timeout(timeout)
        .build()
        .context("failed to build http client")
}

fn resolve_api_key(explicit: Option<&str>, env_name: &str) -> Result<String> {
    if let Some(key) = explicit.map(str::trim).filter(|key| !key.is_empty()) {
        return Ok(key.to_string());
    }
    match std::env::var(env_name) {
        Ok(key) if !key.trim().is_empty() => Ok(key.trim().to_string()),
        _ => bail!("missing api key: pass --api-key or set {env_name}"),
    }
}

fn send_json(provider: &'static str, request: RequestBuilder) -> Result<Value, ExtractorError> {
    let response = request
        .send()
        .map_err(|err| ExtractorError::from_transport(provider, err))?;
    let status = response.status();
    let body = response
        .text()
        .map_err(|err| ExtractorError::from_transport(provider, err))?;

    if !status.is_success() {
        return Err(ExtractorError::Http {
            provider,
            status: status.as_u16(),
            body: head_chars(&body, ERROR_BODY_MAX_CHARS),
        });
    }

    serde_json::from_str::<Value>(&body)
        .map_err(|err| ExtractorError::malformed(provider, format!("invalid json: {err}")))
}

fn trim_base_url(base_url: &str) -> String {
    base_url.trim_end_matches('/').to_string()
}
