use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

static NUMBER_TOKEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"-?\d+(?:\.\d+)?").expect("valid number token regex"));
static PURE_NUMBER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[0-9]+([.,][0-9]+)?$").expect("valid pure number regex"));
static KG_PRICE_PHRASE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(kg[- ]?preis|price per kg|preis/kg|€/kg|eur/kg|/kg)\s*[-:]?\s*[0-9]+([.,][0-9]+)?",
    )
    .expect("valid kg price phrase regex")
});
static LITRE_PRICE_PHRASE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(l[- ]?preis|price per l|preis/l|€/l|eur/l|/l)\s*[-:]?\s*[0-9]+([.,][0-9]+)?")
        .expect("valid litre price phrase regex")
});

// Longer words first: "milliliter" must not be caught by "liter".
const UNIT_ABBREVIATIONS: [(&str, &str); 10] = [
    ("stück", "stk"),
    ("stueck", "stk"),
    ("stuck", "stk"),
    ("piece", "stk"),
    ("packung", "pack"),
    ("pk", "pack"),
    ("milliliter", "ml"),
    ("kilogramm", "kg"),
    ("liter", "l"),
    ("gramm", "g"),
];

pub fn normalize_text(input: &str) -> String {
    input.split_whitespace().collect::<Vec<&str>>().join(" ")
}

/// Renders a scalar JSON field as text; containers are not text.
pub fn value_text(value: &Value) -> Option<String> {
    match value {
        Value::String(text) => Some(text.clone()),
        Value::Number(number) => Some(number.to_string()),
        Value::Bool(flag) => Some(flag.to_string()),
        Value::Null | Value::Array(_) | Value::Object(_) => None,
    }
}

pub fn parse_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => parse_number_str(text),
        _ => None,
    }
}

pub fn parse_number_str(text: &str) -> Option<f64> {
    let cleaned = text.replace(',', ".");
    NUMBER_TOKEN
        .find(&cleaned)
        .and_then(|token| token.as_str().parse::<f64>().ok())
        .filter(|number| number.is_finite())
}

pub fn normalize_price(value: &Value) -> Option<String> {
    let number = parse_number(value)?;
    if number < 0.0 {
        return None;
    }
    // `+ 0.0` folds a negative zero into "0.00".
    Some(format!("{:.2}", number + 0.0))
}

pub fn normalize_discount(value: &Value) -> Option<String> {
    let text = normalize_text(&value_text(value)?);
    if text.is_empty() {
        return None;
    }
    if !text.chars().any(|character| character.is_ascii_digit()) {
        return Some(text);
    }

    match parse_number_str(&text) {
        Some(number) if text.contains('%') => Some(format!("{number:.0}%")),
        _ => Some(text),
    }
}

pub fn normalize_unit(input: &str) -> Option<String> {
    let lowered = normalize_text(input).to_lowercase();
    if lowered.is_empty() || PURE_NUMBER.is_match(&lowered) {
        return None;
    }
    if lowered.contains('€') || lowered.contains("eur") {
        return None;
    }

    let stripped = KG_PRICE_PHRASE.replace_all(&lowered, "");
    let mut unit = LITRE_PRICE_PHRASE.replace_all(&stripped, "").into_owned();
    for (long_form, short_form) in UNIT_ABBREVIATIONS {
        if unit.contains(long_form) {
            unit = unit.replace(long_form, short_form);
        }
    }

    let unit = normalize_text(&unit);
    if unit.is_empty() { None } else { Some(unit) }
}
