use std::cell::Cell;
use std::time::Duration;

use reqwest::blocking::Client;
use serde_json::json;

use super::gemini::GeminiExtractor;
use super::ollama::OllamaExtractor;
use super::openai_compat::{OpenAiCompatExtractor, supports_json_mode};
use super::retry::{RetryPolicy, call_with_retry};
use super::*;
use crate::cancel::CancelToken;
use crate::cli::Backoff;

fn settings(provider: Provider, model: &str) -> ExtractorSettings {
    ExtractorSettings {
        provider,
        model: model.to_string(),
        base_url: Some("http://localhost:9999/".to_string()),
        api_key: Some("test-key".to_string()),
        timeout: Duration::from_secs(30),
        temperature: 0.1,
        max_tokens: 1024,
    }
}

fn request() -> ExtractionRequest<'static> {
    ExtractionRequest {
        image: b"\x89PNG fake",
        mime_type: "image/png",
        instruction: "List every deal.",
        context: Some("Store: Lidl"),
    }
}

fn http_error(status: u16, body: &str) -> ExtractorError {
    ExtractorError::Http {
        provider: "test",
        status,
        body: body.to_string(),
    }
}

fn no_wait(max_retries: u32) -> RetryPolicy {
    RetryPolicy {
        max_retries,
        delay: Duration::ZERO,
        backoff: Backoff::Fixed,
    }
}

#[test]
fn transient_classification_follows_provider_status() {
    assert!(http_error(429, "").is_transient());
    assert!(http_error(503, "").is_transient());
    assert!(http_error(400, "Quota exceeded for metric").is_transient());
    assert!(http_error(400, "rate LIMIT reached").is_transient());
    assert!(!http_error(400, "invalid image").is_transient());
    assert!(!http_error(401, "unauthorized").is_transient());
    assert!(ExtractorError::Timeout { provider: "test" }.is_transient());
    assert!(!ExtractorError::Cancelled.is_transient());
}

#[test]
fn retry_recovers_after_transient_failures() {
    let calls = Cell::new(0_u32);
    let result = call_with_retry(&no_wait(3), &CancelToken::default(), "test", || {
        calls.set(calls.get() + 1);
        if calls.get() < 3 {
            Err(http_error(429, "slow down"))
        } else {
            Ok("[]".to_string())
        }
    });

    assert_eq!(result.expect("third call should succeed"), "[]");
    assert_eq!(calls.get(), 3);
}

#[test]
fn retry_gives_up_after_max_retries() {
    let calls = Cell::new(0_u32);
    let result: Result<String, ExtractorError> =
        call_with_retry(&no_wait(2), &CancelToken::default(), "test", || {
            calls.set(calls.get() + 1);
            Err(http_error(503, "unavailable"))
        });

    assert!(matches!(result, Err(ExtractorError::Http { status: 503, .. })));
    assert_eq!(calls.get(), 3);
}

#[test]
fn retry_does_not_repeat_permanent_failures() {
    let calls = Cell::new(0_u32);
    let result: Result<String, ExtractorError> =
        call_with_retry(&no_wait(3), &CancelToken::default(), "test", || {
            calls.set(calls.get() + 1);
            Err(http_error(401, "bad key"))
        });

    assert!(result.is_err());
    assert_eq!(calls.get(), 1);
}

#[test]
fn retry_stops_when_cancelled_during_backoff() {
    let cancel = CancelToken::default();
    cancel.cancel();
    let policy = RetryPolicy {
        max_retries: 3,
        delay: Duration::from_secs(30),
        backoff: Backoff::Fixed,
    };

    let result: Result<String, ExtractorError> =
        call_with_retry(&policy, &cancel, "test", || Err(http_error(429, "")));
    assert!(matches!(result, Err(ExtractorError::Cancelled)));
}

#[test]
fn exponential_backoff_doubles_delay() {
    let policy = RetryPolicy {
        max_retries: 3,
        delay: Duration::from_secs(30),
        backoff: Backoff::Exponential,
    };
    assert_eq!(policy.delay_for(0), Duration::from_secs(30));
    assert_eq!(policy.delay_for(2), Duration::from_secs(120));

    let fixed = RetryPolicy {
        backoff: Backoff::Fixed,
        ..policy
    };
    assert_eq!(fixed.delay_for(2), Duration::from_secs(30));
}

#[test]
fn prompt_appends_context_when_present() {
    assert_eq!(request().prompt(), "List every deal.\n\nContext: Store: Lidl");

    let bare = ExtractionRequest {
        context: Some("   "),
        ..request()
    };
    assert_eq!(bare.prompt(), "List every deal.");
}

#[test]
fn ollama_payload_carries_base64_image() {
    let extractor = OllamaExtractor::new(Client::new(), &settings(Provider::Ollama, "qwen2.5vl:7b"));
    let payload = extractor.payload(&request());

    assert_eq!(payload["model"], "qwen2.5vl:7b");
    assert_eq!(payload["stream"], false);
    assert_eq!(payload["images"][0], "iVBORyBmYWtl");
}

#[test]
fn gemini_payload_requests_json_except_for_image_models() {
    let text_model = GeminiExtractor::new(
        Client::new(),
        &settings(Provider::Gemini, "models/gemini-2.5-flash"),
        "key".to_string(),
    );
    let payload = text_model.payload(&request());
    assert_eq!(
        payload["generationConfig"]["response_mime_type"],
        "application/json"
    );
    assert_eq!(
        payload["contents"][0]["parts"][1]["inline_data"]["mime_type"],
        "image/png"
    );

    let image_model = GeminiExtractor::new(
        Client::new(),
        &settings(Provider::Gemini, "gemini-2.5-flash-image"),
        "key".to_string(),
    );
    let payload = image_model.payload(&request());
    assert!(payload["generationConfig"].get("response_mime_type").is_none());
}

#[test]
fn openai_payload_uses_data_uri_and_json_mode() {
    let extractor = OpenAiCompatExtractor::new(
        Client::new(),
        &settings(Provider::OpenaiCompatible, "deepseek-ai/deepseek-vl2"),
        "key".to_string(),
    );
    let payload = extractor.payload(&request());
    let url = payload["messages"][0]["content"][1]["image_url"]["url"]
        .as_str()
        .expect("image url should be a string");
    assert!(url.starts_with("data:image/png;base64,"));
    assert_eq!(payload["max_tokens"], 1024);
    assert_eq!(payload["response_format"]["type"], "json_object");

    assert!(!supports_json_mode("THUDM/GLM-4.1V-9B-Thinking"));
    assert!(supports_json_mode("deepseek-ai/deepseek-vl2"));
}

#[test]
fn envelope_text_is_extracted_per_provider() {
    assert_eq!(
        ollama::response_text(&json!({"response": "[]", "done": true})).expect("ollama text"),
        "[]"
    );
    assert!(ollama::response_text(&json!({"error": "model not found"})).is_err());

    let gemini_envelope = json!({
        "candidates": [{"content": {"parts": [{"text": "[{\"product_name\": \"Milch\"}]"}]}}]
    });
    assert!(
        gemini::response_text(&gemini_envelope)
            .expect("gemini text")
            .contains("Milch")
    );
    let blocked = gemini::response_text(&json!({"promptFeedback": {"blockReason": "SAFETY"}}))
        .expect_err("blocked prompt has no candidates");
    assert!(blocked.to_string().contains("SAFETY"));

    let chat = json!({"choices": [{"message": {"role": "assistant", "content": "[]"}}]});
    assert_eq!(openai_compat::response_text(&chat).expect("chat text"), "[]");
    let empty = json!({"choices": [{"message": {"content": null}}]});
    assert_eq!(openai_compat::response_text(&empty).expect("null content"), "");
    assert!(openai_compat::response_text(&json!({"choices": []})).is_err());
}

#[test]
fn build_extractor_validates_settings() {
    let mut blank_model = settings(Provider::Ollama, "  ");
    blank_model.api_key = None;
    assert!(build_extractor(&blank_model).is_err());

    let mut slow = settings(Provider::Ollama, "llava");
    slow.timeout = Duration::from_secs(MAX_TIMEOUT_SEC + 1);
    assert!(build_extractor(&slow).is_err());

    let extractor = build_extractor(&settings(Provider::Ollama, "llava")).expect("ollama builds");
    assert_eq!(extractor.label(), "ollama:llava");
}
