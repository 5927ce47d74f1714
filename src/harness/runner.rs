use std::thread;
use std::time::Instant;

use anyhow::{Result, anyhow};
use tracing::warn;

use super::dataset::{ImageSample, LoadedImage, load_image};
use super::session::{EvaluationSession, SampleInput};
use crate::cancel::CancelToken;
use crate::extractor::retry::{RetryPolicy, call_with_retry};
use crate::extractor::{ExtractionRequest, Extractor, ExtractorError};

/// Settings shared by every extractor call of one run.
#[derive(Clone, Copy)]
pub struct CallContext<'a> {
    pub instruction: &'a str,
    pub context: Option<&'a str>,
    pub policy: &'a RetryPolicy,
    pub cancel: &'a CancelToken,
}

/// One branch of a run: an extractor paired with the session that scores it.
pub struct Lane<'a> {
    pub extractor: &'a dyn Extractor,
    pub session: &'a mut EvaluationSession,
}

/// Sends every sample to every lane. Lanes of the same sample run
/// concurrently; samples are processed one after another.
pub fn run_samples(
    samples: &[ImageSample],
    lanes: &mut [Lane<'_>],
    call: &CallContext<'_>,
) -> Result<()> {
    for sample in samples {
        if call.cancel.is_cancelled() {
            warn!(index = sample.index, "cancellation requested, stopping before sample");
            break;
        }

        let Some(image) = load_image(&sample.image_path) else {
            let prompt = request_prompt(call);
            for lane in lanes.iter_mut() {
                lane.session
                    .record_bad_image(sample.index, &prompt, &sample.image_path)?;
            }
            continue;
        };

        if lanes.len() == 1 {
            let lane = &mut lanes[0];
            evaluate_lane(lane.extractor, lane.session, sample, &image, call)?;
            continue;
        }

        thread::scope(|scope| {
            let handles = lanes
                .iter_mut()
                .map(|lane| {
                    let extractor = lane.extractor;
                    let session = &mut *lane.session;
                    let image = &image;
                    scope.spawn(move || evaluate_lane(extractor, session, sample, image, call))
                })
                .collect::<Vec<_>>();

            handles.into_iter().try_for_each(|handle| {
                handle
                    .join()
                    .map_err(|_| anyhow!("evaluation thread panicked on sample {}", sample.index))?
            })
        })?;
    }

    Ok(())
}

fn request_prompt(call: &CallContext<'_>) -> String {
    ExtractionRequest {
        image: &[],
        mime_type: "",
        instruction: call.instruction,
        context: call.context,
    }
    .prompt()
}

fn evaluate_lane(
    extractor: &dyn Extractor,
    session: &mut EvaluationSession,
    sample: &ImageSample,
    image: &LoadedImage,
    call: &CallContext<'_>,
) -> Result<()> {
    let request = ExtractionRequest {
        image: &image.bytes,
        mime_type: image.mime_type,
        instruction: call.instruction,
        context: call.context,
    };
    let prompt = request.prompt();

    let started = Instant::now();
    let outcome = call_with_retry(call.policy, call.cancel, extractor.label(), || {
        extractor.extract(&request)
    });
    let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

    let (prediction, error) = match outcome {
        Ok(text) => (text, None),
        Err(ExtractorError::Cancelled) => {
            warn!(label = %extractor.label(), index = sample.index, "sample abandoned after cancellation");
            return Ok(());
        }
        Err(err) => {
            warn!(
                label = %extractor.label(),
                index = sample.index,
                annotation = %sample.annotation_path.display(),
                error = %err,
                "extraction failed, scoring as empty prediction"
            );
            (String::new(), Some(err.to_string()))
        }
    };

    let ground_truth_text = sample.ground_truth_text();
    session.evaluate_sample(&SampleInput {
        index: sample.index,
        prompt: &prompt,
        ground_truth: &sample.ground_truth,
        ground_truth_text: &ground_truth_text,
        prediction: &prediction,
        image: Some(&sample.image_path),
        image_sha256: Some(&image.sha256),
        elapsed_ms: Some(elapsed_ms),
        error: error.as_deref(),
    })?;
    Ok(())
}
