use crate::model::{AggregateMetrics, DealRecord, Match, SampleMetrics};

use super::ScoringConfig;
use super::iou::calculate_iou;
use super::matcher::match_deals;
use super::normalize::normalize_unit;
use super::similarity::{prices_agree, unit_similarity};

pub fn score_sample(
    ground_truth: &[DealRecord],
    predicted: &[DealRecord],
    config: &ScoringConfig,
) -> SampleMetrics {
    let matches = match_deals(
        ground_truth,
        predicted,
        config.name_sim_threshold,
        config.min_name_len,
    );
    score_matches(ground_truth, predicted, &matches, config)
}

pub fn score_matches(
    ground_truth: &[DealRecord],
    predicted: &[DealRecord],
    matches: &[Match],
    config: &ScoringConfig,
) -> SampleMetrics {
    let gt_total = ground_truth.len();
    let pred_total = predicted.len();
    let matched_count = matches.len();

    let mut price_correct_count = 0_usize;
    let mut unit_correct_count = 0_usize;
    let mut e2e_correct_count = 0_usize;
    let mut bbox_correct_count = 0_usize;
    let mut iou_sum = 0.0_f64;

    for pair in matches {
        let (Some(expected), Some(candidate)) = (
            ground_truth.get(pair.ground_truth_index),
            predicted.get(pair.predicted_index),
        ) else {
            continue;
        };

        let price_ok = prices_agree(
            expected.price.as_deref(),
            candidate.price.as_deref(),
            config.numeric_tolerance,
        );
        let unit_ok = units_agree(
            expected.unit.as_deref(),
            candidate.unit.as_deref(),
            config.unit_sim_threshold,
        );

        if price_ok {
            price_correct_count += 1;
        }
        if unit_ok {
            unit_correct_count += 1;
        }
        if price_ok && unit_ok {
            e2e_correct_count += 1;
        }

        let iou = calculate_iou(expected.bbox.as_ref(), candidate.bbox.as_ref());
        iou_sum += iou;
        if iou > config.iou_threshold {
            bbox_correct_count += 1;
        }
    }

    let precision = ratio(matched_count, pred_total);
    let recall = ratio(matched_count, gt_total);
    let f1 = if precision + recall > 0.0 {
        2.0 * precision * recall / (precision + recall)
    } else {
        0.0
    };

    SampleMetrics {
        gt_total,
        pred_total,
        matched_count,
        price_correct_count,
        unit_correct_count,
        e2e_correct_count,
        bbox_correct_count,
        precision,
        recall,
        f1,
        overprediction_rate: ratio(pred_total.saturating_sub(matched_count), pred_total),
        price_reliability: ratio(price_correct_count, matched_count),
        safe_deal_rate: ratio(e2e_correct_count, gt_total),
        price_accuracy: ratio(price_correct_count, gt_total),
        unit_accuracy: ratio(unit_correct_count, gt_total),
        mean_iou: if matched_count == 0 {
            0.0
        } else {
            iou_sum / matched_count as f64
        },
        bbox_accuracy: ratio(bbox_correct_count, matched_count),
    }
}

// A side without a usable unit gets the benefit of the doubt.
fn units_agree(expected: Option<&str>, candidate: Option<&str>, threshold: f64) -> bool {
    let expected = expected.and_then(normalize_unit);
    let candidate = candidate.and_then(normalize_unit);
    match (expected, candidate) {
        (Some(expected), Some(candidate)) => unit_similarity(&expected, &candidate) >= threshold,
        _ => true,
    }
}

pub fn ratio(numerator: usize, denominator: usize) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        numerator as f64 / denominator as f64
    }
}

/// Running sums for the macro-average; every scored sample weighs the same.
#[derive(Debug, Clone, Default)]
pub struct MetricsAccumulator {
    scored_samples: usize,
    json_parse_ok_count: usize,
    empty_pred_count: usize,
    empty_gt_count: usize,
    bad_image_count: usize,
    extractor_failure_count: usize,
    pred_chars_sum: usize,
    gt_deals_sum: usize,
    pred_deals_sum: usize,
    rate_sums: SampleMetrics,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RunningRates {
    pub recall: f64,
    pub precision: f64,
    pub safe_deal_rate: f64,
}

impl MetricsAccumulator {
    pub fn add_sample(&mut self, metrics: &SampleMetrics, json_parse_ok: bool, pred_chars: usize) {
        self.scored_samples += 1;
        if json_parse_ok {
            self.json_parse_ok_count += 1;
        }
        if metrics.pred_total == 0 {
            self.empty_pred_count += 1;
        }
        if metrics.gt_total == 0 {
            self.empty_gt_count += 1;
        }
        self.pred_chars_sum += pred_chars;
        self.gt_deals_sum += metrics.gt_total;
        self.pred_deals_sum += metrics.pred_total;

        let sums = &mut self.rate_sums;
        sums.precision += metrics.precision;
        sums.recall += metrics.recall;
        sums.f1 += metrics.f1;
        sums.overprediction_rate += metrics.overprediction_rate;
        sums.price_reliability += metrics.price_reliability;
        sums.safe_deal_rate += metrics.safe_deal_rate;
        sums.price_accuracy += metrics.price_accuracy;
        sums.unit_accuracy += metrics.unit_accuracy;
        sums.mean_iou += metrics.mean_iou;
        sums.bbox_accuracy += metrics.bbox_accuracy;
    }

    pub fn record_bad_image(&mut self) {
        self.bad_image_count += 1;
    }

    pub fn record_extractor_failure(&mut self) {
        self.extractor_failure_count += 1;
    }

    pub fn running_rates(&self) -> RunningRates {
        RunningRates {
            recall: self.mean(self.rate_sums.recall),
            precision: self.mean(self.rate_sums.precision),
            safe_deal_rate: self.mean(self.rate_sums.safe_deal_rate),
        }
    }

    /// Metric fields only; run metadata is filled in by the owning session.
    pub fn finalize(&self) -> AggregateMetrics {
        let sums = &self.rate_sums;
        let input_samples = self.scored_samples + self.bad_image_count;

        AggregateMetrics {
            input_samples,
            total_samples: self.scored_samples,
            json_parse_rate: ratio(self.json_parse_ok_count, self.scored_samples),
            precision: self.mean(sums.precision),
            recall: self.mean(sums.recall),
            f1: self.mean(sums.f1),
            overprediction_rate: self.mean(sums.overprediction_rate),
            price_reliability: self.mean(sums.price_reliability),
            safe_deal_rate: self.mean(sums.safe_deal_rate),
            price_accuracy: self.mean(sums.price_accuracy),
            unit_accuracy: self.mean(sums.unit_accuracy),
            mean_iou: self.mean(sums.mean_iou),
            bbox_accuracy: self.mean(sums.bbox_accuracy),
            avg_gt_deals: ratio(self.gt_deals_sum, self.scored_samples),
            avg_pred_deals: ratio(self.pred_deals_sum, self.scored_samples),
            avg_pred_chars: ratio(self.pred_chars_sum, self.scored_samples),
            empty_pred_rate: ratio(self.empty_pred_count, self.scored_samples),
            empty_gt_rate: ratio(self.empty_gt_count, self.scored_samples),
            skipped_bad_images: self.bad_image_count,
            bad_image_rate: ratio(self.bad_image_count, input_samples),
            extractor_failures: self.extractor_failure_count,
            extractor_failure_rate: ratio(self.extractor_failure_count, self.scored_samples),
            ..AggregateMetrics::default()
        }
    }

    fn mean(&self, sum: f64) -> f64 {
        if self.scored_samples == 0 {
            0.0
        } else {
            sum / self.scored_samples as f64
        }
    }
}
