use serde_json::Value;

pub const MIN_SCORE: i64 = 0;
pub const MAX_SCORE: i64 = 10;

/// Parses a critique score. Accepts integers, floats (floored) and strings
/// such as `"7"`, `"7/10"` or `"7.5"`. The result is clamped to 0..=10.
pub fn parse_score(value: &Value) -> Option<i64> {
    let raw = match value {
        Value::Number(number) => number
            .as_i64()
            .or_else(|| number.as_f64().filter(|f| f.is_finite()).map(|f| f.floor() as i64)),
        Value::String(text) => parse_score_text(text),
        _ => None,
    }?;
    Some(raw.clamp(MIN_SCORE, MAX_SCORE))
}

fn parse_score_text(text: &str) -> Option<i64> {
    let trimmed = text.trim();
    let numerator = match trimmed.split_once('/') {
        Some((head, _)) => head.trim(),
        None => trimmed,
    };
    if let Ok(whole) = numerator.parse::<i64>() {
        return Some(whole);
    }
    numerator
        .parse::<f64>()
        .ok()
        .filter(|f| f.is_finite())
        .map(|f| f.floor() as i64)
}

/// Normalizes free-form critique text. Placeholder answers such as "None" or
/// "N/A" mean there is nothing to act on.
pub fn normalize_critique(text: Option<&str>) -> Option<String> {
    let trimmed = text?.trim();
    if trimmed.is_empty() {
        return None;
    }
    let bare: String = trimmed
        .trim_matches(|c: char| c.is_ascii_punctuation() || c.is_whitespace())
        .to_ascii_lowercase();
    if matches!(bare.as_str(), "" | "none" | "n/a" | "na") {
        return None;
    }
    Some(trimmed.to_string())
}

/// Lead quality projected from the latest critique.
pub fn quality_from_critique(critique: Option<&str>) -> &'static str {
    match normalize_critique(critique) {
        Some(_) => "medium",
        None => "high",
    }
}

#[cfg(test)]
mod tests {
    use super::{normalize_critique, parse_score, quality_from_critique};
    use serde_json::json;

    #[test]
    fn parses_supported_score_shapes() {
        assert_eq!(parse_score(&json!(7)), Some(7));
        assert_eq!(parse_score(&json!(7.9)), Some(7));
        assert_eq!(parse_score(&json!("7")), Some(7));
        assert_eq!(parse_score(&json!(" 7/10 ")), Some(7));
        assert_eq!(parse_score(&json!("7.5")), Some(7));
    }

    #[test]
    fn clamps_out_of_range_scores() {
        assert_eq!(parse_score(&json!(14)), Some(10));
        assert_eq!(parse_score(&json!(-3)), Some(0));
        assert_eq!(parse_score(&json!("12/10")), Some(10));
    }

    #[test]
    fn rejects_unparseable_scores() {
        assert_eq!(parse_score(&json!(null)), None);
        assert_eq!(parse_score(&json!("great")), None);
        assert_eq!(parse_score(&json!({"score": 7})), None);
        assert_eq!(parse_score(&json!("")), None);
    }

    #[test]
    fn placeholder_critiques_normalize_to_none() {
        assert_eq!(normalize_critique(Some("None.")), None);
        assert_eq!(normalize_critique(Some(" n/a ")), None);
        assert_eq!(normalize_critique(Some("")), None);
        assert_eq!(normalize_critique(None), None);
        assert_eq!(
            normalize_critique(Some("Opening line is generic.")),
            Some("Opening line is generic.".to_string())
        );
        assert_eq!(quality_from_critique(Some("NA")), "high");
        assert_eq!(quality_from_critique(Some("Too long")), "medium");
    }
}
