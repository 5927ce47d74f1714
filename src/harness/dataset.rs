use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::eval::recovery::parse_ground_truth;
use crate::model::DealRecord;
use crate::util::sha256_bytes;

const ANNOTATED_SUFFIX: &str = "_annotated";
const IMAGE_EXTENSIONS: [&str; 4] = ["png", "jpg", "jpeg", "webp"];

pub const PAGE_INSTRUCTION: &str = "Task: Extract all supermarket deals from this flyer page.
Return ONLY valid JSON (no extra text).
Schema (JSON array of objects):
[
  {
    \"product_name\": string | null,
    \"price\": string | number | null,
    \"discount\": string | null,
    \"unit\": string | null,
    \"original_price\": string | number | null,
    \"bbox\": [x_min, y_min, x_max, y_max] | null
  }
]
Rules:
- Use null if a field is missing.
- Keep prices as numbers or numeric strings (e.g., \"1.99\").
- Product name should focus on the item, not marketing text.
- Unit should be the package/unit only (e.g., \"1-kg-Packung\", \"je Stück\").
- Do NOT output legal price-per-unit info (e.g., \"kg-Preis\", \"€/kg\", \"€/l\") as unit.
- bbox coordinates are fractions of the page width and height (0 to 1).
- If multiple deals exist, include all of them.";

/// One flyer page with its cleaned labels.
#[derive(Debug, Clone)]
pub struct ImageSample {
    pub index: usize,
    pub image_path: PathBuf,
    pub annotation_path: PathBuf,
    pub ground_truth: Vec<DealRecord>,
}

impl ImageSample {
    pub fn ground_truth_text(&self) -> String {
        serde_json::to_string(&self.ground_truth).unwrap_or_else(|_| "[]".to_string())
    }
}

/// Image bytes as forwarded to an extractor; never decoded.
#[derive(Debug, Clone)]
pub struct LoadedImage {
    pub bytes: Vec<u8>,
    pub mime_type: &'static str,
    pub sha256: String,
}

/// A pre-recorded prediction, typically a line of an earlier run's log.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedSample {
    pub index: usize,
    pub prompt: String,
    pub ground_truth_text: String,
    pub prediction: String,
}

pub fn load_instruction(path: Option<&Path>) -> Result<String> {
    let Some(path) = path else {
        return Ok(PAGE_INSTRUCTION.to_string());
    };
    let text = fs::read_to_string(path)
        .with_context(|| format!("failed to read instruction file {}", path.display()))?;
    if text.trim().is_empty() {
        bail!("instruction file {} is empty", path.display());
    }
    Ok(text)
}

/// Walks `<root>/<name>_annotated/<stem>.json` in sorted order and pairs each
/// label file with `<root>/<name>/<stem>.{png,jpg,jpeg,webp}`.
pub fn discover_image_samples(
    data_root: &Path,
    max_samples: Option<usize>,
) -> Result<Vec<ImageSample>> {
    let annotated_dirs = sorted_entries(data_root)?
        .into_iter()
        .filter(|path| path.is_dir())
        .filter(|path| {
            path.file_name()
                .and_then(|name| name.to_str())
                .is_some_and(|name| {
                    name.ends_with(ANNOTATED_SUFFIX) && name.len() > ANNOTATED_SUFFIX.len()
                })
        })
        .collect::<Vec<PathBuf>>();

    let limit = max_samples.unwrap_or(usize::MAX);
    let mut samples = Vec::<ImageSample>::new();

    'dirs: for annotated_dir in annotated_dirs {
        let Some(image_dir) = image_dir_for(&annotated_dir) else {
            continue;
        };
        if !image_dir.is_dir() {
            warn!(path = %annotated_dir.display(), "no image directory next to annotations");
            continue;
        }

        for annotation_path in sorted_entries(&annotated_dir)? {
            if samples.len() >= limit {
                break 'dirs;
            }
            if annotation_path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            let Some(stem) = annotation_path.file_stem().and_then(|stem| stem.to_str()) else {
                continue;
            };
            let Some(image_path) = resolve_image_path(&image_dir, stem) else {
                debug!(path = %annotation_path.display(), "annotation has no matching image");
                continue;
            };

            let ground_truth = load_annotation(&annotation_path);
            samples.push(ImageSample {
                index: samples.len(),
                image_path,
                annotation_path,
                ground_truth,
            });
        }
    }

    info!(data_root = %data_root.display(), samples = samples.len(), "discovered image samples");
    Ok(samples)
}

fn sorted_entries(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut entries = fs::read_dir(dir)
        .with_context(|| format!("failed to list directory {}", dir.display()))?
        .map(|entry| entry.map(|entry| entry.path()))
        .collect::<std::io::Result<Vec<PathBuf>>>()
        .with_context(|| format!("failed to read directory entry in {}", dir.display()))?;
    entries.sort();
    Ok(entries)
}

fn image_dir_for(annotated_dir: &Path) -> Option<PathBuf> {
    let name = annotated_dir.file_name()?.to_str()?;
    let base = name.strip_suffix(ANNOTATED_SUFFIX)?;
    Some(annotated_dir.with_file_name(base))
}

fn resolve_image_path(image_dir: &Path, stem: &str) -> Option<PathBuf> {
    IMAGE_EXTENSIONS
        .iter()
        .map(|ext| image_dir.join(format!("{stem}.{ext}")))
        .find(|candidate| candidate.is_file())
}

/// Unreadable or malformed labels count as a page without deals.
fn load_annotation(path: &Path) -> Vec<DealRecord> {
    match fs::read_to_string(path) {
        Ok(text) => ground_truth_or_empty(&text, &path.display().to_string()),
        Err(err) => {
            warn!(path = %path.display(), error = %err, "failed to read annotation, using empty ground truth");
            Vec::new()
        }
    }
}

pub fn ground_truth_or_empty(text: &str, origin: &str) -> Vec<DealRecord> {
    match parse_ground_truth(text) {
        Ok(records) => records,
        Err(err) => {
            warn!(origin = %origin, error = %err, "invalid ground truth, using empty list");
            Vec::new()
        }
    }
}

/// `None` when the file cannot be read or is not a PNG, JPEG or WebP image.
pub fn load_image(path: &Path) -> Option<LoadedImage> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) => {
            warn!(path = %path.display(), error = %err, "failed to read image");
            return None;
        }
    };
    let Some(mime_type) = sniff_image_mime(&bytes) else {
        warn!(path = %path.display(), bytes = bytes.len(), "unrecognized image format");
        return None;
    };

    Some(LoadedImage {
        sha256: sha256_bytes(&bytes),
        mime_type,
        bytes,
    })
}

pub fn sniff_image_mime(bytes: &[u8]) -> Option<&'static str> {
    if bytes.starts_with(b"\x89PNG\r\n\x1a\n") {
        Some("image/png")
    } else if bytes.starts_with(&[0xFF, 0xD8, 0xFF]) {
        Some("image/jpeg")
    } else if bytes.len() >= 12 && bytes.starts_with(b"RIFF") && &bytes[8..12] == b"WEBP" {
        Some("image/webp")
    } else {
        None
    }
}

/// Reads JSON lines carrying `ground_truth` and `prediction`. Lines without a
/// prediction (for example bad-image records) are skipped.
pub fn load_prediction_file(
    path: &Path,
    max_samples: Option<usize>,
) -> Result<Vec<RecordedSample>> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read prediction file {}", path.display()))?;

    let limit = max_samples.unwrap_or(usize::MAX);
    let mut samples = Vec::<RecordedSample>::new();
    let mut skipped = 0_usize;

    for (line_number, line) in raw.lines().enumerate() {
        if samples.len() >= limit {
            break;
        }
        if line.trim().is_empty() {
            continue;
        }

        let record = match serde_json::from_str::<Value>(line) {
            Ok(Value::Object(record)) => record,
            Ok(_) | Err(_) => {
                warn!(path = %path.display(), line = line_number + 1, "skipping malformed prediction line");
                skipped += 1;
                continue;
            }
        };

        let Some(prediction) = record.get("prediction").and_then(text_of) else {
            debug!(path = %path.display(), line = line_number + 1, "line has no prediction");
            skipped += 1;
            continue;
        };
        let ground_truth_text = record
            .get("ground_truth")
            .and_then(text_of)
            .unwrap_or_else(|| "[]".to_string());
        let prompt = record
            .get("prompt")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let index = record
            .get("index")
            .and_then(Value::as_u64)
            .and_then(|index| usize::try_from(index).ok())
            .unwrap_or(samples.len());

        samples.push(RecordedSample {
            index,
            prompt,
            ground_truth_text,
            prediction,
        });
    }

    info!(
        path = %path.display(),
        samples = samples.len(),
        skipped,
        "loaded recorded predictions"
    );
    Ok(samples)
}

// Inline JSON values are re-serialized so they flow through the same text path.
fn text_of(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(text) => Some(text.clone()),
        other => Some(other.to_string()),
    }
}
