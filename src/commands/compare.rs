use anyhow::{Result, bail};
use tracing::info;

use crate::cancel::CancelToken;
use crate::cli::{CompareArgs, parse_target};
use crate::extractor::{Extractor, build_extractor};
use crate::harness::dataset::{discover_image_samples, load_instruction};
use crate::harness::runner::{CallContext, Lane, run_samples};
use crate::harness::session::{EvaluationSession, SessionOptions};
use crate::harness::{RunLayout, report, unique_labels};

pub fn run(args: CompareArgs, cancel: &CancelToken) -> Result<()> {
    let scoring = args.scoring.to_config()?;
    let policy = args.call.retry_policy();

    let extractors = args
        .targets
        .iter()
        .map(|raw| {
            let (provider, model) = parse_target(raw)?;
            build_extractor(&args.call.settings(provider, &model, None, None))
        })
        .collect::<Result<Vec<Box<dyn Extractor>>>>()?;
    let labels = unique_labels(
        extractors
            .iter()
            .map(|extractor| extractor.label().to_string())
            .collect(),
    );

    let instruction = load_instruction(args.dataset.instruction_file.as_deref())?;
    let samples = discover_image_samples(&args.dataset.data_root, args.report.max_samples)?;
    if samples.is_empty() {
        bail!(
            "no annotated samples found under {}",
            args.dataset.data_root.display()
        );
    }

    let layout = RunLayout::create(&args.report.output_dir)?;
    let mut sessions = labels
        .into_iter()
        .map(|label| {
            EvaluationSession::create(SessionOptions {
                log_path: layout.log_path(&label),
                label,
                run_id: layout.run_id.clone(),
                scoring,
                diag_max_samples: args.report.diag_max_samples,
                source_sha256: None,
            })
        })
        .collect::<Result<Vec<EvaluationSession>>>()?;

    info!(
        configurations = sessions.len(),
        samples = samples.len(),
        "starting comparison run"
    );

    let call = CallContext {
        instruction: &instruction,
        context: args.dataset.context.as_deref(),
        policy: &policy,
        cancel,
    };
    let mut lanes = extractors
        .iter()
        .zip(sessions.iter_mut())
        .map(|(extractor, session)| Lane {
            extractor: extractor.as_ref(),
            session,
        })
        .collect::<Vec<Lane<'_>>>();
    run_samples(&samples, &mut lanes, &call)?;
    drop(lanes);

    let cancelled = cancel.is_cancelled();
    let reports = sessions
        .into_iter()
        .map(|session| session.finish(cancelled))
        .collect::<Result<Vec<_>>>()?;
    report::publish(&layout.run_dir, reports)
}
