use anyhow::{Result, bail};
use tracing::{info, warn};

use crate::cancel::CancelToken;
use crate::cli::ScoreArgs;
use crate::harness::dataset::{ground_truth_or_empty, load_prediction_file};
use crate::harness::session::{EvaluationSession, SampleInput, SessionOptions};
use crate::harness::{RunLayout, report, unique_labels};
use crate::util::sha256_file;

pub fn run(args: ScoreArgs, cancel: &CancelToken) -> Result<()> {
    let scoring = args.scoring.to_config()?;
    for path in &args.predictions {
        if !path.is_file() {
            bail!("prediction file not found: {}", path.display());
        }
    }

    let layout = RunLayout::create(&args.report.output_dir)?;
    let labels = unique_labels(
        args.predictions
            .iter()
            .map(|path| {
                path.file_stem()
                    .map(|stem| stem.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "predictions".to_string())
            })
            .collect(),
    );

    info!(files = args.predictions.len(), run_id = %layout.run_id, "scoring recorded predictions");

    let mut reports = Vec::new();
    for (path, label) in args.predictions.iter().zip(labels) {
        let samples = load_prediction_file(path, args.report.max_samples)?;
        let mut session = EvaluationSession::create(SessionOptions {
            log_path: layout.log_path(&label),
            label,
            run_id: layout.run_id.clone(),
            scoring,
            diag_max_samples: args.report.diag_max_samples,
            source_sha256: Some(sha256_file(path)?),
        })?;

        for sample in &samples {
            if cancel.is_cancelled() {
                warn!(index = sample.index, "cancellation requested, stopping early");
                break;
            }
            let origin = format!("{}#{}", path.display(), sample.index);
            let ground_truth = ground_truth_or_empty(&sample.ground_truth_text, &origin);
            session.evaluate_sample(&SampleInput {
                index: sample.index,
                prompt: &sample.prompt,
                ground_truth: &ground_truth,
                ground_truth_text: &sample.ground_truth_text,
                prediction: &sample.prediction,
                image: None,
                image_sha256: None,
                elapsed_ms: None,
                error: None,
            })?;
        }

        reports.push(session.finish(cancel.is_cancelled())?);
        if cancel.is_cancelled() {
            break;
        }
    }

    report::publish(&layout.run_dir, reports)
}
