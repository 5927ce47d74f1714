use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;

use super::normalize::{normalize_text, normalize_unit, parse_number_str};

pub const SUBSTRING_BONUS: f64 = 0.9;

// Absorbs binary rounding when two canonical prices differ by exactly the tolerance.
const FLOAT_SLACK: f64 = 1e-9;

static ALNUM_TOKEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[a-z0-9]+").expect("valid alphanumeric token regex"));

pub fn token_set_similarity(left: &str, right: &str) -> f64 {
    let left_lower = left.to_lowercase();
    let right_lower = right.to_lowercase();
    let left_tokens = ALNUM_TOKEN
        .find_iter(&left_lower)
        .map(|token| token.as_str())
        .collect::<HashSet<&str>>();
    let right_tokens = ALNUM_TOKEN
        .find_iter(&right_lower)
        .map(|token| token.as_str())
        .collect::<HashSet<&str>>();

    if left_tokens.is_empty() && right_tokens.is_empty() {
        return 1.0;
    }
    if left_tokens.is_empty() || right_tokens.is_empty() {
        return 0.0;
    }

    let intersection = left_tokens.intersection(&right_tokens).count();
    let union = left_tokens.union(&right_tokens).count();
    intersection as f64 / union as f64
}

/// Gestalt (Ratcliff/Obershelp) ratio `2*M / T`, taken in both argument
/// orders so the score does not depend on which side is "ground truth".
pub fn sequence_ratio(left: &str, right: &str) -> f64 {
    let left_chars = left.chars().collect::<Vec<char>>();
    let right_chars = right.chars().collect::<Vec<char>>();
    let total = left_chars.len() + right_chars.len();
    if total == 0 {
        return 1.0;
    }

    let forward = matching_char_count(&left_chars, &right_chars);
    let backward = matching_char_count(&right_chars, &left_chars);
    2.0 * forward.max(backward) as f64 / total as f64
}

fn matching_char_count(left: &[char], right: &[char]) -> usize {
    let mut pending = vec![(0, left.len(), 0, right.len())];
    let mut matched = 0_usize;

    while let Some((left_lo, left_hi, right_lo, right_hi)) = pending.pop() {
        let (left_start, right_start, size) =
            longest_common_block(left, right, left_lo, left_hi, right_lo, right_hi);
        if size == 0 {
            continue;
        }

        matched += size;
        if left_lo < left_start && right_lo < right_start {
            pending.push((left_lo, left_start, right_lo, right_start));
        }
        if left_start + size < left_hi && right_start + size < right_hi {
            pending.push((left_start + size, left_hi, right_start + size, right_hi));
        }
    }

    matched
}

// Earliest block in `left` wins ties, then earliest in `right`.
fn longest_common_block(
    left: &[char],
    right: &[char],
    left_lo: usize,
    left_hi: usize,
    right_lo: usize,
    right_hi: usize,
) -> (usize, usize, usize) {
    let width = right_hi - right_lo;
    let mut previous = vec![0_usize; width + 1];
    let mut current = vec![0_usize; width + 1];
    let mut best = (left_lo, right_lo, 0_usize);

    for left_index in left_lo..left_hi {
        for offset in 0..width {
            let right_index = right_lo + offset;
            if left[left_index] == right[right_index] {
                let run = previous[offset] + 1;
                current[offset + 1] = run;
                if run > best.2 {
                    best = (left_index + 1 - run, right_index + 1 - run, run);
                }
            } else {
                current[offset + 1] = 0;
            }
        }
        std::mem::swap(&mut previous, &mut current);
    }

    best
}

pub fn name_similarity(left: &str, right: &str, min_name_len: usize) -> f64 {
    let left_norm = normalize_text(left).to_lowercase();
    let right_norm = normalize_text(right).to_lowercase();

    let sequence = sequence_ratio(&left_norm, &right_norm);
    let tokens = token_set_similarity(&left_norm, &right_norm);
    let long_enough = left_norm.chars().count() >= min_name_len
        && right_norm.chars().count() >= min_name_len;
    let substring = if long_enough
        && (left_norm.contains(right_norm.as_str()) || right_norm.contains(left_norm.as_str()))
    {
        SUBSTRING_BONUS
    } else {
        0.0
    };

    sequence.max(tokens).max(substring)
}

pub fn unit_similarity(left: &str, right: &str) -> f64 {
    let left_unit = normalize_unit(left).unwrap_or_default();
    let right_unit = normalize_unit(right).unwrap_or_default();
    token_set_similarity(&left_unit, &right_unit)
}

pub fn prices_agree(left: Option<&str>, right: Option<&str>, tolerance: f64) -> bool {
    match (
        left.and_then(parse_number_str),
        right.and_then(parse_number_str),
    ) {
        (Some(left_price), Some(right_price)) => {
            (left_price - right_price).abs() <= tolerance + FLOAT_SLACK
        }
        _ => false,
    }
}
