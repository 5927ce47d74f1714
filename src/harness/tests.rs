use std::fs;
use std::path::Path;
use std::time::Duration;

use serde_json::{Value, json};
use tempfile::TempDir;

use super::dataset::{
    PAGE_INSTRUCTION, discover_image_samples, load_prediction_file, sniff_image_mime,
};
use super::report::{SUMMARY_CSV_FILE, SUMMARY_FILE, publish, render_report};
use super::runner::{CallContext, Lane, run_samples};
use super::session::{EvaluationSession, SampleInput, SessionOptions};
use super::*;
use crate::cancel::CancelToken;
use crate::cli::Backoff;
use crate::eval::ScoringConfig;
use crate::extractor::retry::RetryPolicy;
use crate::extractor::{ExtractionRequest, Extractor, ExtractorError};
use crate::model::DealRecord;

const PNG_BYTES: &[u8] = b"\x89PNG\r\n\x1a\nnot-really-pixels";

fn write(path: &Path, contents: &[u8]) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).expect("create fixture dir");
    }
    fs::write(path, contents).expect("write fixture");
}

fn session_at(dir: &Path, label: &str, diag_max_samples: usize) -> EvaluationSession {
    EvaluationSession::create(SessionOptions {
        label: label.to_string(),
        run_id: "20260101T000000Z".to_string(),
        log_path: dir.join(format!("{label}.jsonl")),
        scoring: ScoringConfig::default(),
        diag_max_samples,
        source_sha256: None,
    })
    .expect("session should open")
}

fn read_log(path: &Path) -> Vec<Value> {
    fs::read_to_string(path)
        .expect("read log")
        .lines()
        .map(|line| serde_json::from_str::<Value>(line).expect("log line is json"))
        .collect()
}

fn butter() -> Vec<DealRecord> {
    vec![
        DealRecord::from_untyped(&json!({"product_name": "Butter", "price": "1.79"}))
            .expect("fixture deal"),
    ]
}

struct CannedExtractor {
    label: String,
    reply: Result<String, u16>,
}

impl Extractor for CannedExtractor {
    fn label(&self) -> &str {
        &self.label
    }

    fn extract(&self, _request: &ExtractionRequest<'_>) -> Result<String, ExtractorError> {
        match &self.reply {
            Ok(text) => Ok(text.clone()),
            Err(status) => Err(ExtractorError::Http {
                provider: "canned",
                status: *status,
                body: "nope".to_string(),
            }),
        }
    }
}

#[test]
fn discovers_annotated_pages_in_sorted_order() {
    let temp = TempDir::new().expect("tempdir");
    let root = temp.path();
    write(
        &root.join("lidl_annotated/p2.json"),
        br#"[{"product_name": "Kaffee", "price": "4,99"}]"#,
    );
    write(
        &root.join("lidl_annotated/p1.json"),
        br#"[{"product_name": "Butter", "price": 1.79}]"#,
    );
    write(&root.join("lidl_annotated/p3.json"), b"{broken");
    write(&root.join("lidl_annotated/orphan.json"), b"[]");
    write(&root.join("lidl/p1.png"), PNG_BYTES);
    write(&root.join("lidl/p2.jpg"), b"\xFF\xD8\xFFjpeg");
    write(&root.join("lidl/p3.webp"), b"RIFF\0\0\0\0WEBPVP8 ");
    write(&root.join("aldi_annotated/a1.json"), b"[]");

    let samples = discover_image_samples(root, None).expect("discovery should succeed");
    let names = samples
        .iter()
        .map(|sample| {
            sample
                .image_path
                .file_name()
                .and_then(|name| name.to_str())
                .unwrap_or_default()
                .to_string()
        })
        .collect::<Vec<String>>();
    assert_eq!(names, vec!["p1.png", "p2.jpg", "p3.webp"]);
    assert_eq!(samples[0].ground_truth[0].price.as_deref(), Some("1.79"));
    assert_eq!(samples[1].ground_truth[0].price.as_deref(), Some("4.99"));
    assert!(samples[2].ground_truth.is_empty());
    assert_eq!(samples[2].index, 2);

    let limited = discover_image_samples(root, Some(2)).expect("limited discovery");
    assert_eq!(limited.len(), 2);
}

#[test]
fn sniffs_supported_image_signatures() {
    assert_eq!(sniff_image_mime(PNG_BYTES), Some("image/png"));
    assert_eq!(sniff_image_mime(b"\xFF\xD8\xFF\xE0"), Some("image/jpeg"));
    assert_eq!(sniff_image_mime(b"RIFF\x10\0\0\0WEBPVP8 "), Some("image/webp"));
    assert_eq!(sniff_image_mime(b"GIF89a"), None);
    assert_eq!(sniff_image_mime(b""), None);
}

#[test]
fn prediction_file_accepts_text_and_inline_ground_truth() {
    let temp = TempDir::new().expect("tempdir");
    let path = temp.path().join("preds.jsonl");
    let lines = [
        json!({"index": 7, "prompt": "p", "ground_truth": "[{\"product_name\": \"Butter\"}]", "prediction": "[]"}),
        json!({"ground_truth": [{"product_name": "Milch"}], "prediction": "```json\n[]\n```"}),
        json!({"index": 9, "error": "bad_image", "prompt_head": "Task"}),
    ]
    .iter()
    .map(Value::to_string)
    .collect::<Vec<String>>()
    .join("\n");
    write(&path, format!("{lines}\nnot json\n\n").as_bytes());

    let samples = load_prediction_file(&path, None).expect("prediction file should load");
    assert_eq!(samples.len(), 2);
    assert_eq!(samples[0].index, 7);
    assert_eq!(samples[0].prompt, "p");
    assert_eq!(samples[1].index, 1);
    assert!(samples[1].ground_truth_text.contains("Milch"));
    assert_eq!(samples[1].prompt, "");

    let capped = load_prediction_file(&path, Some(1)).expect("capped load");
    assert_eq!(capped.len(), 1);
}

#[test]
fn session_logs_every_sample_and_caps_diagnostics() {
    let temp = TempDir::new().expect("tempdir");
    let mut session = session_at(temp.path(), "unit", 1);
    let ground_truth = butter();

    for (index, prediction) in [
        r#"[{"product_name": "Butter", "price": "1.79"}]"#,
        "sorry, no deals",
        "[]",
    ]
    .into_iter()
    .enumerate()
    {
        session
            .evaluate_sample(&SampleInput {
                index,
                prompt: PAGE_INSTRUCTION,
                ground_truth: &ground_truth,
                ground_truth_text: r#"[{"product_name":"Butter","price":"1.79"}]"#,
                prediction,
                image: None,
                image_sha256: None,
                elapsed_ms: Some(12),
                error: None,
            })
            .expect("sample should be scored");
    }
    session
        .record_bad_image(3, PAGE_INSTRUCTION, Path::new("broken.png"))
        .expect("bad image should be logged");

    let report = session.finish(false).expect("session should finish");
    let summary = &report.summary;
    assert_eq!(summary.total_samples, 3);
    assert_eq!(summary.input_samples, 4);
    assert_eq!(summary.skipped_bad_images, 1);
    assert!((summary.recall - 1.0 / 3.0).abs() < 1e-12);
    assert!((summary.json_parse_rate - 2.0 / 3.0).abs() < 1e-12);
    assert!((summary.bad_image_rate - 0.25).abs() < 1e-12);
    assert_eq!(summary.label, "unit");
    assert!(!summary.cancelled);
    assert_eq!(report.diagnostics.len(), 1);

    let log = read_log(&temp.path().join("unit.jsonl"));
    assert_eq!(log.len(), 4);
    assert_eq!(log[0]["metrics"]["json_parse_ok"], true);
    assert_eq!(log[0]["metrics"]["matched_count"], 1);
    assert_eq!(log[0]["json_recovery"], "verbatim");
    assert_eq!(log[1]["metrics"]["json_parse_ok"], false);
    assert!(log[1].get("json_recovery").is_none());
    assert_eq!(log[3]["error"], "bad_image");
    assert_eq!(log[3]["prompt_head"].as_str().map(str::len), Some(200));
}

#[test]
fn session_log_can_be_rescored() {
    let temp = TempDir::new().expect("tempdir");
    let mut session = session_at(temp.path(), "first", 5);
    let ground_truth = butter();
    let ground_truth_text = serde_json::to_string(&ground_truth).expect("serialize gt");
    session
        .evaluate_sample(&SampleInput {
            index: 0,
            prompt: "prompt",
            ground_truth: &ground_truth,
            ground_truth_text: &ground_truth_text,
            prediction: "Here you go: [{\"product_name\": \"Butter\", \"price\": 1.79}]",
            image: None,
            image_sha256: None,
            elapsed_ms: None,
            error: None,
        })
        .expect("sample should be scored");
    session
        .record_bad_image(1, "prompt", Path::new("x.png"))
        .expect("bad image");
    let first = session.finish(false).expect("finish");

    let recorded =
        load_prediction_file(&temp.path().join("first.jsonl"), None).expect("reload log");
    assert_eq!(recorded.len(), 1);
    assert_eq!(recorded[0].ground_truth_text, ground_truth_text);
    assert_eq!(first.summary.safe_deal_rate, 1.0);
}

#[test]
fn extractor_failures_are_scored_as_empty_predictions() {
    let temp = TempDir::new().expect("tempdir");
    let root = temp.path().join("data");
    write(
        &root.join("rewe_annotated/p1.json"),
        br#"[{"product_name": "Butter", "price": "1.79"}]"#,
    );
    write(&root.join("rewe/p1.png"), PNG_BYTES);
    write(&root.join("rewe_annotated/p2.json"), b"[]");
    write(&root.join("rewe/p2.png"), b"definitely not an image");
    let samples = discover_image_samples(&root, None).expect("discovery");

    let good = CannedExtractor {
        label: "good".to_string(),
        reply: Ok(r#"[{"product_name": "Butter", "price": "1.79"}]"#.to_string()),
    };
    let broken = CannedExtractor {
        label: "broken".to_string(),
        reply: Err(401),
    };
    let mut good_session = session_at(temp.path(), "good", 5);
    let mut broken_session = session_at(temp.path(), "broken", 5);

    let policy = RetryPolicy {
        max_retries: 2,
        delay: Duration::ZERO,
        backoff: Backoff::Fixed,
    };
    let cancel = CancelToken::default();
    let call = CallContext {
        instruction: PAGE_INSTRUCTION,
        context: None,
        policy: &policy,
        cancel: &cancel,
    };
    let mut lanes = vec![
        Lane {
            extractor: &good,
            session: &mut good_session,
        },
        Lane {
            extractor: &broken,
            session: &mut broken_session,
        },
    ];
    run_samples(&samples, &mut lanes, &call).expect("run should complete");
    drop(lanes);

    let good_report = good_session.finish(false).expect("finish good");
    assert_eq!(good_report.summary.total_samples, 1);
    assert_eq!(good_report.summary.skipped_bad_images, 1);
    assert_eq!(good_report.summary.safe_deal_rate, 1.0);
    assert_eq!(good_report.summary.extractor_failures, 0);

    let broken_report = broken_session.finish(false).expect("finish broken");
    assert_eq!(broken_report.summary.extractor_failures, 1);
    assert_eq!(broken_report.summary.recall, 0.0);

    let log = read_log(&temp.path().join("broken.jsonl"));
    assert!(
        log[0]["error"]
            .as_str()
            .is_some_and(|error| error.contains("401"))
    );
    assert_eq!(log[0]["prediction"], "");
    assert!(log[0]["image_sha256"].is_string());
}

#[test]
fn cancellation_before_first_sample_yields_empty_report() {
    let temp = TempDir::new().expect("tempdir");
    let root = temp.path().join("data");
    write(&root.join("edeka_annotated/p1.json"), b"[]");
    write(&root.join("edeka/p1.png"), PNG_BYTES);
    let samples = discover_image_samples(&root, None).expect("discovery");

    let extractor = CannedExtractor {
        label: "any".to_string(),
        reply: Ok("[]".to_string()),
    };
    let mut session = session_at(temp.path(), "any", 5);
    let policy = RetryPolicy {
        max_retries: 0,
        delay: Duration::ZERO,
        backoff: Backoff::Fixed,
    };
    let cancel = CancelToken::default();
    cancel.cancel();
    let call = CallContext {
        instruction: PAGE_INSTRUCTION,
        context: None,
        policy: &policy,
        cancel: &cancel,
    };
    let mut lanes = [Lane {
        extractor: &extractor,
        session: &mut session,
    }];
    run_samples(&samples, &mut lanes, &call).expect("run should stop cleanly");

    let report = session.finish(true).expect("finish");
    assert!(report.summary.cancelled);
    assert_eq!(report.summary.total_samples, 0);
    assert_eq!(report.summary.recall, 0.0);
}

struct CancellingExtractor {
    cancel: CancelToken,
    reply: String,
}

impl Extractor for CancellingExtractor {
    fn label(&self) -> &str {
        "cancelling"
    }

    fn extract(&self, _request: &ExtractionRequest<'_>) -> Result<String, ExtractorError> {
        self.cancel.cancel();
        Ok(self.reply.clone())
    }
}

#[test]
fn cancelled_run_reports_samples_completed_before_the_interrupt() {
    let temp = TempDir::new().expect("tempdir");
    let root = temp.path().join("data");
    write(
        &root.join("edeka_annotated/p1.json"),
        br#"[{"product_name": "Butter", "price": "1.79"}]"#,
    );
    write(&root.join("edeka/p1.png"), PNG_BYTES);
    write(
        &root.join("edeka_annotated/p2.json"),
        br#"[{"product_name": "Milch", "price": "0.99"}]"#,
    );
    write(&root.join("edeka/p2.png"), PNG_BYTES);
    let samples = discover_image_samples(&root, None).expect("discovery");
    assert_eq!(samples.len(), 2);

    let cancel = CancelToken::default();
    let extractor = CancellingExtractor {
        cancel: cancel.clone(),
        reply: r#"[{"product_name": "Butter", "price": "1.79"}]"#.to_string(),
    };
    let mut session = session_at(temp.path(), "cancelling", 5);
    let policy = RetryPolicy {
        max_retries: 0,
        delay: Duration::ZERO,
        backoff: Backoff::Fixed,
    };
    let call = CallContext {
        instruction: PAGE_INSTRUCTION,
        context: None,
        policy: &policy,
        cancel: &cancel,
    };
    let mut lanes = [Lane {
        extractor: &extractor,
        session: &mut session,
    }];
    run_samples(&samples, &mut lanes, &call).expect("run should stop cleanly");
    assert!(cancel.is_cancelled());

    let report = session.finish(true).expect("finish");
    assert!(report.summary.cancelled);
    assert_eq!(report.summary.total_samples, 1);
    assert_eq!(report.summary.recall, 1.0);
    assert_eq!(report.summary.precision, 1.0);
    assert_eq!(report.summary.safe_deal_rate, 1.0);

    let log = read_log(&temp.path().join("cancelling.jsonl"));
    assert_eq!(log.len(), 1);
    assert_eq!(log[0]["index"], 0);
}

#[test]
fn run_layouts_created_back_to_back_get_distinct_directories() {
    let temp = TempDir::new().expect("tempdir");
    let first = RunLayout::create(temp.path()).expect("first layout");
    let second = RunLayout::create(temp.path()).expect("second layout");

    assert_ne!(first.run_dir, second.run_dir);
    assert_ne!(first.run_id, second.run_id);
    assert!(first.run_id.starts_with("run-"));
    assert!(first.run_dir.is_dir());
    assert!(second.run_dir.is_dir());

    let mut session = session_at(&first.run_dir, "solo", 5);
    session
        .evaluate_sample(&SampleInput {
            index: 0,
            prompt: "",
            ground_truth: &butter(),
            ground_truth_text: "[]",
            prediction: "[]",
            image: None,
            image_sha256: None,
            elapsed_ms: None,
            error: None,
        })
        .expect("score");
    session.finish(false).expect("finish");

    let third = RunLayout::create(temp.path()).expect("third layout");
    let _reopened = session_at(&third.run_dir, "solo", 5);
    assert_eq!(read_log(&first.run_dir.join("solo.jsonl")).len(), 1);
}

#[test]
fn publish_writes_single_summary() {
    let temp = TempDir::new().expect("tempdir");
    let mut session = session_at(temp.path(), "solo", 5);
    session
        .evaluate_sample(&SampleInput {
            index: 0,
            prompt: "",
            ground_truth: &butter(),
            ground_truth_text: "[]",
            prediction: "",
            image: None,
            image_sha256: None,
            elapsed_ms: None,
            error: None,
        })
        .expect("score");
    let report = session.finish(false).expect("finish");
    let rendered = render_report(&report.summary);
    assert!(rendered.contains("safe deal rate"));

    publish(temp.path(), vec![report]).expect("publish");
    let summary: Value = serde_json::from_str(
        &fs::read_to_string(temp.path().join(SUMMARY_FILE)).expect("read summary"),
    )
    .expect("summary is json");
    assert_eq!(summary["summary"]["label"], "solo");
    assert_eq!(summary["diagnostics"][0]["pred_total"], 0);
    assert!(!temp.path().join(SUMMARY_CSV_FILE).exists());
}

#[test]
fn publish_writes_comparison_json_and_csv() {
    let temp = TempDir::new().expect("tempdir");
    let reports = ["alpha", "beta"]
        .into_iter()
        .map(|label| {
            session_at(temp.path(), label, 5)
                .finish(false)
                .expect("finish")
        })
        .collect::<Vec<_>>();

    publish(temp.path(), reports).expect("publish");

    let summary: Value = serde_json::from_str(
        &fs::read_to_string(temp.path().join(SUMMARY_FILE)).expect("read summary"),
    )
    .expect("summary is json");
    assert_eq!(summary["summaries"].as_array().map(Vec::len), Some(2));
    assert!(summary["diagnostics"]["alpha"].is_array());

    let mut reader =
        csv::Reader::from_path(temp.path().join(SUMMARY_CSV_FILE)).expect("open csv");
    let headers = reader
        .headers()
        .expect("csv headers")
        .iter()
        .map(str::to_string)
        .collect::<Vec<String>>();
    let mut sorted = headers.clone();
    sorted.sort();
    assert_eq!(headers, sorted);
    assert!(headers.iter().any(|header| header == "safe_deal_rate"));
    assert!(!headers.iter().any(|header| header == "source_sha256"));
    assert_eq!(reader.records().count(), 2);
}

#[test]
fn unique_labels_suffix_repeats() {
    let labels = unique_labels(vec![
        "ollama:llava".to_string(),
        "ollama:llava".to_string(),
        "gemini:flash".to_string(),
    ]);
    assert_eq!(labels, vec!["ollama:llava", "ollama:llava#2", "gemini:flash"]);
}
