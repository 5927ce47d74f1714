use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

use crate::model::DealRecord;

static LEADING_FENCE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*```[A-Za-z0-9_-]*[ \t]*\r?\n?").expect("valid fence regex"));
static TRAILING_FENCE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\r?\n?[ \t]*```\s*$").expect("valid fence regex"));

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryStrategy {
    Verbatim,
    StripFences,
    EmbeddedSpan,
}

pub const RECOVERY_CHAIN: [RecoveryStrategy; 3] = [
    RecoveryStrategy::Verbatim,
    RecoveryStrategy::StripFences,
    RecoveryStrategy::EmbeddedSpan,
];

impl RecoveryStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Verbatim => "verbatim",
            Self::StripFences => "strip_fences",
            Self::EmbeddedSpan => "embedded_span",
        }
    }

    fn attempt(self, text: &str) -> Option<Value> {
        match self {
            Self::Verbatim => parse_structured(text),
            Self::StripFences => {
                let without_leading = LEADING_FENCE.replace(text, "");
                let stripped = TRAILING_FENCE.replace(&without_leading, "");
                if stripped.len() == text.len() {
                    return None;
                }
                parse_structured(&stripped)
            }
            Self::EmbeddedSpan => {
                let candidates = balanced_spans(text)
                    .into_iter()
                    .rev()
                    .filter_map(|(start, end)| parse_structured(&text[start..end]))
                    .collect::<Vec<Value>>();
                // A trailing span with deal objects beats a stray nested array.
                let preferred = candidates.iter().position(holds_objects).unwrap_or(0);
                candidates.into_iter().nth(preferred)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecoveredJson {
    pub value: Value,
    pub strategy: RecoveryStrategy,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ParsedPrediction {
    pub deals: Vec<DealRecord>,
    pub strategy: Option<RecoveryStrategy>,
}

impl ParsedPrediction {
    pub fn json_parse_ok(&self) -> bool {
        self.strategy.is_some()
    }
}

pub fn recover_json(text: &str) -> Option<RecoveredJson> {
    if text.trim().is_empty() {
        return None;
    }

    RECOVERY_CHAIN.iter().find_map(|strategy| {
        strategy.attempt(text).map(|value| RecoveredJson {
            value,
            strategy: *strategy,
        })
    })
}

pub fn parse_prediction(text: &str) -> ParsedPrediction {
    match recover_json(text) {
        Some(recovered) => ParsedPrediction {
            deals: deal_list_from_value(&recovered.value),
            strategy: Some(recovered.strategy),
        },
        None => ParsedPrediction::default(),
    }
}

pub fn parse_ground_truth(text: &str) -> Result<Vec<DealRecord>, serde_json::Error> {
    let value = serde_json::from_str::<Value>(text.trim())?;
    Ok(deal_list_from_value(&value))
}

pub fn deal_list_from_value(value: &Value) -> Vec<DealRecord> {
    match value {
        Value::Array(items) => items.iter().filter_map(DealRecord::from_untyped).collect(),
        Value::Object(_) => DealRecord::from_untyped(value).into_iter().collect(),
        _ => Vec::new(),
    }
}

fn parse_structured(text: &str) -> Option<Value> {
    serde_json::from_str::<Value>(text.trim())
        .ok()
        .filter(|value| value.is_array() || value.is_object())
}

fn holds_objects(value: &Value) -> bool {
    match value {
        Value::Object(_) => true,
        Value::Array(items) => items.iter().any(Value::is_object),
        _ => false,
    }
}

/// Top-level bracket spans, left to right. An opener that never closes is
/// skipped so complete spans nested inside a truncated response still count.
/// Runs in one pass over the text.
pub fn balanced_spans(text: &str) -> Vec<(usize, usize)> {
    let mut spans = Vec::<(usize, usize)>::new();
    let mut open = Vec::<OpenBracket>::new();
    let mut in_string = false;
    let mut escaped = false;

    for (index, byte) in text.bytes().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if byte == b'\\' {
                escaped = true;
            } else if byte == b'"' {
                in_string = false;
            }
            continue;
        }

        match byte {
            b'"' if !open.is_empty() => in_string = true,
            b'[' | b'{' => open.push(OpenBracket {
                start: index,
                closer: if byte == b'[' { b']' } else { b'}' },
                children: Vec::new(),
            }),
            b']' | b'}' if !open.is_empty() => {
                let matches = open.last().is_some_and(|top| top.closer == byte);
                if !matches {
                    release_children(&mut open, &mut spans);
                    continue;
                }
                if let Some(closed) = open.pop() {
                    let span = (closed.start, index + 1);
                    match open.last_mut() {
                        Some(parent) => parent.children.push(span),
                        None => spans.push(span),
                    }
                }
            }
            _ => {}
        }
    }

    release_children(&mut open, &mut spans);
    spans
}

struct OpenBracket {
    start: usize,
    closer: u8,
    children: Vec<(usize, usize)>,
}

// Openers that cannot close are dropped; their completed children surface
// as top-level spans in text order.
fn release_children(open: &mut Vec<OpenBracket>, spans: &mut Vec<(usize, usize)>) {
    for bracket in open.drain(..) {
        spans.extend(bracket.children);
    }
}
