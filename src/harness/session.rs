use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{debug, info};

use crate::eval::ScoringConfig;
use crate::eval::metrics::{MetricsAccumulator, score_sample};
use crate::eval::recovery::parse_prediction;
use crate::model::{
    BadImageLogRecord, DealRecord, LoggedMetrics, SampleDiagnostic, SampleLogRecord,
    SampleMetrics, SummaryReport,
};
use crate::util::{ensure_directory, head_chars, now_utc_string};

pub const DIAG_HEAD_CHARS: usize = 400;
pub const PROMPT_HEAD_CHARS: usize = 200;
const EMPTY_PARSE_MIN_CHARS: usize = 50;

#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub label: String,
    pub run_id: String,
    pub log_path: PathBuf,
    pub scoring: ScoringConfig,
    pub diag_max_samples: usize,
    pub source_sha256: Option<String>,
}

/// Everything known about one scored sample before its prediction is parsed.
#[derive(Debug, Clone, Copy)]
pub struct SampleInput<'a> {
    pub index: usize,
    pub prompt: &'a str,
    pub ground_truth: &'a [DealRecord],
    pub ground_truth_text: &'a str,
    pub prediction: &'a str,
    pub image: Option<&'a Path>,
    pub image_sha256: Option<&'a str>,
    pub elapsed_ms: Option<u64>,
    pub error: Option<&'a str>,
}

/// Per-configuration run state: the JSON-lines log, the running aggregate
/// and the capped diagnostics list.
pub struct EvaluationSession {
    label: String,
    run_id: String,
    scoring: ScoringConfig,
    diag_max_samples: usize,
    source_sha256: Option<String>,
    started_at: String,
    started: Instant,
    log_path: PathBuf,
    log: BufWriter<File>,
    accumulator: MetricsAccumulator,
    diagnostics: Vec<SampleDiagnostic>,
}

impl EvaluationSession {
    pub fn create(options: SessionOptions) -> Result<Self> {
        if let Some(parent) = options.log_path.parent() {
            ensure_directory(parent)?;
        }
        let file = File::create(&options.log_path).with_context(|| {
            format!("failed to create sample log {}", options.log_path.display())
        })?;

        info!(
            label = %options.label,
            run_id = %options.run_id,
            log = %options.log_path.display(),
            "evaluation session started"
        );

        Ok(Self {
            label: options.label,
            run_id: options.run_id,
            scoring: options.scoring,
            diag_max_samples: options.diag_max_samples,
            source_sha256: options.source_sha256,
            started_at: now_utc_string(),
            started: Instant::now(),
            log_path: options.log_path,
            log: BufWriter::new(file),
            accumulator: MetricsAccumulator::default(),
            diagnostics: Vec::new(),
        })
    }

    pub fn evaluate_sample(&mut self, input: &SampleInput<'_>) -> Result<SampleMetrics> {
        let parsed = parse_prediction(input.prediction);
        let json_parse_ok = parsed.json_parse_ok();
        let metrics = score_sample(input.ground_truth, &parsed.deals, &self.scoring);

        let visible_chars = input
            .prediction
            .chars()
            .filter(|character| !character.is_whitespace())
            .count();
        if parsed.deals.is_empty() && visible_chars > EMPTY_PARSE_MIN_CHARS {
            debug!(
                label = %self.label,
                index = input.index,
                preview = %head_chars(input.prediction, PROMPT_HEAD_CHARS),
                "substantial prediction produced no deals"
            );
        }

        let record = SampleLogRecord {
            index: input.index,
            prompt: input.prompt.to_string(),
            ground_truth: input.ground_truth_text.to_string(),
            prediction: input.prediction.to_string(),
            metrics: LoggedMetrics {
                metrics: metrics.clone(),
                json_parse_ok,
            },
            json_recovery: parsed.strategy.map(|strategy| strategy.as_str()),
            error: input.error.map(str::to_string),
            image: input.image.map(|path| path.display().to_string()),
            image_sha256: input.image_sha256.map(str::to_string),
            elapsed_ms: input.elapsed_ms,
        };
        self.append_log(&record)?;

        self.accumulator
            .add_sample(&metrics, json_parse_ok, input.prediction.chars().count());
        if input.error.is_some() {
            self.accumulator.record_extractor_failure();
        }
        if (!json_parse_ok || metrics.pred_total == 0) && self.has_diagnostic_room() {
            self.diagnostics.push(SampleDiagnostic::Scored {
                index: input.index,
                json_parse_ok,
                gt_total: metrics.gt_total,
                pred_total: metrics.pred_total,
                prediction_head: head_chars(input.prediction, DIAG_HEAD_CHARS),
                ground_truth_head: head_chars(input.ground_truth_text, DIAG_HEAD_CHARS),
            });
        }

        let running = self.accumulator.running_rates();
        info!(
            label = %self.label,
            index = input.index,
            gt = metrics.gt_total,
            pred = metrics.pred_total,
            matched = metrics.matched_count,
            json_ok = json_parse_ok,
            recall = running.recall,
            precision = running.precision,
            safe_deal_rate = running.safe_deal_rate,
            "sample scored"
        );

        Ok(metrics)
    }

    pub fn record_bad_image(&mut self, index: usize, prompt: &str, image: &Path) -> Result<()> {
        let prompt_head = head_chars(prompt, PROMPT_HEAD_CHARS);
        let record = BadImageLogRecord {
            index,
            error: "bad_image",
            prompt_head: prompt_head.clone(),
            image: Some(image.display().to_string()),
        };
        self.append_log(&record)?;
        self.accumulator.record_bad_image();

        if self.has_diagnostic_room() {
            self.diagnostics.push(SampleDiagnostic::BadImage {
                index,
                reason: "bad_image",
                prompt_head,
            });
        }
        Ok(())
    }

    pub fn finish(mut self, cancelled: bool) -> Result<SummaryReport> {
        self.log
            .flush()
            .with_context(|| format!("failed to flush sample log {}", self.log_path.display()))?;

        let mut summary = self.accumulator.finalize();
        summary.label = self.label;
        summary.run_id = self.run_id;
        summary.started_at = self.started_at;
        summary.finished_at = now_utc_string();
        summary.elapsed_sec = self.started.elapsed().as_secs_f64();
        summary.cancelled = cancelled;
        summary.source_sha256 = self.source_sha256;

        info!(
            label = %summary.label,
            samples = summary.total_samples,
            bad_images = summary.skipped_bad_images,
            cancelled,
            "evaluation session finished"
        );

        Ok(SummaryReport {
            summary,
            diagnostics: self.diagnostics,
        })
    }

    fn has_diagnostic_room(&self) -> bool {
        self.diagnostics.len() < self.diag_max_samples
    }

    // One line per record, flushed before returning.
    fn append_log<T: Serialize>(&mut self, record: &T) -> Result<()> {
        serde_json::to_writer(&mut self.log, record)
            .with_context(|| format!("failed to serialize log record {}", self.log_path.display()))?;
        self.log
            .write_all(b"\n")
            .and_then(|()| self.log.flush())
            .with_context(|| format!("failed to write sample log {}", self.log_path.display()))
    }
}
