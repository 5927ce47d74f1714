use std::collections::BTreeMap;

use serde::{Serialize, Serializer};
use serde_json::{Map, Value};

use crate::eval::normalize::{
    normalize_discount, normalize_price, normalize_text, normalize_unit, value_text,
};

static NULL: Value = Value::Null;

/// Axis-aligned box in normalized page coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    pub x_min: f64,
    pub y_min: f64,
    pub x_max: f64,
    pub y_max: f64,
}

impl BoundingBox {
    pub fn new(x_min: f64, y_min: f64, x_max: f64, y_max: f64) -> Option<Self> {
        let coordinates = [x_min, y_min, x_max, y_max];
        if coordinates
            .iter()
            .any(|value| !value.is_finite() || *value < 0.0 || *value > 1.0)
        {
            return None;
        }
        if x_min >= x_max || y_min >= y_max {
            return None;
        }

        Some(Self {
            x_min,
            y_min,
            x_max,
            y_max,
        })
    }

    pub fn from_untyped(value: &Value) -> Option<Self> {
        let items = value.as_array()?;
        if items.len() != 4 {
            return None;
        }

        let mut coordinates = [0.0_f64; 4];
        for (slot, item) in coordinates.iter_mut().zip(items) {
            *slot = match item {
                Value::Number(number) => number.as_f64()?,
                Value::String(text) => text.trim().parse::<f64>().ok()?,
                _ => return None,
            };
        }

        Self::new(
            coordinates[0],
            coordinates[1],
            coordinates[2],
            coordinates[3],
        )
    }

    pub fn area(&self) -> f64 {
        (self.x_max - self.x_min) * (self.y_max - self.y_min)
    }
}

impl Serialize for BoundingBox {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        [self.x_min, self.y_min, self.x_max, self.y_max].serialize(serializer)
    }
}

/// One promotional product line, coerced once from untyped JSON.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct DealRecord {
    pub product_name: Option<String>,
    pub price: Option<String>,
    pub discount: Option<String>,
    pub unit: Option<String>,
    pub original_price: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bbox: Option<BoundingBox>,
}

impl DealRecord {
    pub fn from_untyped(value: &Value) -> Option<Self> {
        let object = value.as_object()?;

        let product_name = value_text(field(object, "product_name", Some("name")))
            .map(|text| normalize_text(&text))
            .filter(|text| !text.is_empty());
        let unit = value_text(field(object, "unit", None)).and_then(|text| normalize_unit(&text));

        Some(Self {
            product_name,
            price: normalize_price(field(object, "price", None)),
            discount: normalize_discount(field(object, "discount", None)),
            unit,
            original_price: normalize_price(field(object, "original_price", None)),
            bbox: BoundingBox::from_untyped(field(object, "bbox", Some("box"))),
        })
    }

    pub fn name(&self) -> &str {
        self.product_name.as_deref().unwrap_or_default()
    }
}

fn field<'a>(object: &'a Map<String, Value>, primary: &str, alias: Option<&str>) -> &'a Value {
    object
        .get(primary)
        .filter(|candidate| !candidate.is_null())
        .or_else(|| alias.and_then(|name| object.get(name)))
        .unwrap_or(&NULL)
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Match {
    pub ground_truth_index: usize,
    pub predicted_index: usize,
    pub similarity: f64,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct SampleMetrics {
    pub gt_total: usize,
    pub pred_total: usize,
    pub matched_count: usize,
    pub price_correct_count: usize,
    pub unit_correct_count: usize,
    pub e2e_correct_count: usize,
    pub bbox_correct_count: usize,
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
    pub overprediction_rate: f64,
    pub price_reliability: f64,
    pub safe_deal_rate: f64,
    pub price_accuracy: f64,
    pub unit_accuracy: f64,
    pub mean_iou: f64,
    pub bbox_accuracy: f64,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct AggregateMetrics {
    pub label: String,
    pub run_id: String,
    pub started_at: String,
    pub finished_at: String,
    pub elapsed_sec: f64,
    pub cancelled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_sha256: Option<String>,
    pub input_samples: usize,
    pub total_samples: usize,
    pub json_parse_rate: f64,
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
    pub overprediction_rate: f64,
    pub price_reliability: f64,
    pub safe_deal_rate: f64,
    pub price_accuracy: f64,
    pub unit_accuracy: f64,
    pub mean_iou: f64,
    pub bbox_accuracy: f64,
    pub avg_gt_deals: f64,
    pub avg_pred_deals: f64,
    pub avg_pred_chars: f64,
    pub empty_pred_rate: f64,
    pub empty_gt_rate: f64,
    pub skipped_bad_images: usize,
    pub bad_image_rate: f64,
    pub extractor_failures: usize,
    pub extractor_failure_rate: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct LoggedMetrics {
    #[serde(flatten)]
    pub metrics: SampleMetrics,
    pub json_parse_ok: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct SampleLogRecord {
    pub index: usize,
    pub prompt: String,
    pub ground_truth: String,
    pub prediction: String,
    pub metrics: LoggedMetrics,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub json_recovery: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_sha256: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub elapsed_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BadImageLogRecord {
    pub index: usize,
    pub error: &'static str,
    pub prompt_head: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum SampleDiagnostic {
    Scored {
        index: usize,
        json_parse_ok: bool,
        gt_total: usize,
        pred_total: usize,
        prediction_head: String,
        ground_truth_head: String,
    },
    BadImage {
        index: usize,
        reason: &'static str,
        prompt_head: String,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct SummaryReport {
    pub summary: AggregateMetrics,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub diagnostics: Vec<SampleDiagnostic>,
}

/// Side-by-side output of several configurations scored in one invocation.
#[derive(Debug, Clone, Serialize)]
pub struct MultiSummaryReport {
    pub summaries: Vec<AggregateMetrics>,
    pub diagnostics: BTreeMap<String, Vec<SampleDiagnostic>>,
}
