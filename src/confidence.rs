//! Confidence normalization shared by the query stage and CLI output.

/// Clamp to [0, 1] and round to 4 decimals. Anything non-finite is 0.
pub fn normalize_confidence(value: f64) -> f64 {
    if !value.is_finite() || value < 0.0 {
        return 0.0;
    }
    let clamped = value.min(1.0);
    (clamped * 10_000.0).round() / 10_000.0
}

pub fn confidence_level(value: f64) -> &'static str {
    let score = normalize_confidence(value);
    if score >= 0.75 {
        "high"
    } else if score >= 0.45 {
        "medium"
    } else {
        "low"
    }
}

pub fn confidence_label(value: f64) -> String {
    let score = normalize_confidence(value);
    let level = match confidence_level(score) {
        "high" => "High",
        "medium" => "Medium",
        _ => "Low",
    };
    format!("{} confidence ({:.0}%)", level, score * 100.0)
}

/// Warning line appended to low-confidence answers; empty otherwise.
pub fn low_confidence_warning(value: f64) -> &'static str {
    if confidence_level(value) != "low" {
        return "";
    }
    "Low-confidence inference. Verify with cited filing text before using this in a decision."
}
