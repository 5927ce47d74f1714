use crate::model::{DealRecord, Match};

use super::similarity::name_similarity;

/// Greedy one-to-one assignment in ground-truth order.
///
/// Each ground-truth deal claims the most similar predicted deal that no
/// earlier ground-truth deal has claimed, provided the similarity reaches
/// `name_threshold`. Claims are never revisited, so the result depends on
/// ground-truth ordering and is not a globally optimal assignment.
pub fn match_deals(
    ground_truth: &[DealRecord],
    predicted: &[DealRecord],
    name_threshold: f64,
    min_name_len: usize,
) -> Vec<Match> {
    let mut claimed = vec![false; predicted.len()];
    let mut matches = Vec::<Match>::with_capacity(ground_truth.len().min(predicted.len()));

    for (ground_truth_index, expected) in ground_truth.iter().enumerate() {
        let mut best: Option<(usize, f64)> = None;
        for (predicted_index, candidate) in predicted.iter().enumerate() {
            if claimed[predicted_index] {
                continue;
            }

            let similarity = name_similarity(expected.name(), candidate.name(), min_name_len);
            let best_similarity = best.map_or(0.0, |(_, score)| score);
            if similarity > best_similarity {
                best = Some((predicted_index, similarity));
            }
        }

        let Some((predicted_index, similarity)) = best else {
            continue;
        };
        if similarity < name_threshold {
            continue;
        }

        claimed[predicted_index] = true;
        matches.push(Match {
            ground_truth_index,
            predicted_index,
            similarity,
        });
    }

    matches
}
