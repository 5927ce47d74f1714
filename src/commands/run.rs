use anyhow::{Result, bail};
use tracing::info;

use crate::cancel::CancelToken;
use crate::cli::RunArgs;
use crate::extractor::build_extractor;
use crate::harness::dataset::{discover_image_samples, load_instruction};
use crate::harness::runner::{CallContext, Lane, run_samples};
use crate::harness::session::{EvaluationSession, SessionOptions};
use crate::harness::{RunLayout, report};

pub fn run(args: RunArgs, cancel: &CancelToken) -> Result<()> {
    let scoring = args.scoring.to_config()?;
    let settings = args.call.settings(
        args.provider,
        &args.model,
        args.base_url.clone(),
        args.api_key.clone(),
    );
    let extractor = build_extractor(&settings)?;
    let policy = args.call.retry_policy();
    let instruction = load_instruction(args.dataset.instruction_file.as_deref())?;

    let samples = discover_image_samples(&args.dataset.data_root, args.report.max_samples)?;
    if samples.is_empty() {
        bail!(
            "no annotated samples found under {}",
            args.dataset.data_root.display()
        );
    }

    let layout = RunLayout::create(&args.report.output_dir)?;
    let label = settings.label();
    let mut session = EvaluationSession::create(SessionOptions {
        log_path: layout.log_path(&label),
        label,
        run_id: layout.run_id.clone(),
        scoring,
        diag_max_samples: args.report.diag_max_samples,
        source_sha256: None,
    })?;

    info!(
        extractor = %extractor.label(),
        samples = samples.len(),
        timeout_sec = settings.timeout.as_secs(),
        max_retries = policy.max_retries,
        "starting extraction run"
    );

    let call = CallContext {
        instruction: &instruction,
        context: args.dataset.context.as_deref(),
        policy: &policy,
        cancel,
    };
    let mut lanes = [Lane {
        extractor: extractor.as_ref(),
        session: &mut session,
    }];
    run_samples(&samples, &mut lanes, &call)?;

    let report = session.finish(cancel.is_cancelled())?;
    report::publish(&layout.run_dir, vec![report])
}
