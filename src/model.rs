//! Model adapter seam and the Gemini implementation.
//!
//! The pipeline treats the model as an opaque, possibly-unreliable
//! function: [`ModelAdapter::generate_json`] returns an empty object on any
//! failure and [`ModelAdapter::generate_text`] an empty string, so stages
//! never see a transport error escape this boundary.

use async_trait::async_trait;
use regex::Regex;
use serde_json::{json, Value};
use std::sync::OnceLock;
use std::time::Duration;
use tracing::warn;

use crate::config::ModelConfig;

#[async_trait]
pub trait ModelAdapter: Send + Sync {
    /// Generate a JSON object; `{}` signals failure.
    async fn generate_json(&self, prompt: &str) -> Value;

    /// Generate free text; empty string signals failure.
    async fn generate_text(&self, prompt: &str) -> String;
}

const GENERATE_BASE: &str = "https://generativelanguage.googleapis.com/v1beta/models";
const DEFAULT_CANDIDATES: &[&str] = &["gemini-2.5-flash", "gemini-2.0-flash", "gemini-1.5-flash"];

pub struct GeminiAdapter {
    model_candidates: Vec<String>,
    api_key: Option<String>,
    timeout: Duration,
}

impl GeminiAdapter {
    pub fn new(config: &ModelConfig) -> Self {
        let mut candidates = Vec::new();
        if let Some(model) = &config.model {
            candidates.push(model.clone());
        }
        candidates.extend(DEFAULT_CANDIDATES.iter().map(|m| m.to_string()));
        let mut seen = std::collections::HashSet::new();
        candidates.retain(|model| seen.insert(model.clone()));

        Self {
            model_candidates: candidates,
            api_key: std::env::var(&config.api_key_env).ok().filter(|k| !k.is_empty()),
            timeout: Duration::from_secs(config.timeout_secs),
        }
    }

    async fn generate(&self, model: &str, prompt: &str, json_mode: bool) -> Option<String> {
        let api_key = self.api_key.as_ref()?;
        let client = reqwest::Client::builder().timeout(self.timeout).build().ok()?;

        let mut body = json!({
            "contents": [{"parts": [{"text": prompt}]}],
        });
        if json_mode {
            body["generationConfig"] = json!({"response_mime_type": "application/json"});
        }

        let url = format!("{GENERATE_BASE}/{model}:generateContent?key={api_key}");
        let response = match client.post(&url).json(&body).send().await {
            Ok(response) if response.status().is_success() => response,
            Ok(response) => {
                warn!(model, status = %response.status(), "Gemini request failed");
                return None;
            }
            Err(err) => {
                warn!(model, error = %err, "Gemini request failed");
                return None;
            }
        };

        let parsed: Value = response.json().await.ok()?;
        let parts = parsed["candidates"][0]["content"]["parts"].as_array()?;
        let text: String = parts
            .iter()
            .filter_map(|part| part["text"].as_str())
            .collect::<Vec<_>>()
            .join("");
        if text.trim().is_empty() {
            None
        } else {
            Some(text)
        }
    }
}

#[async_trait]
impl ModelAdapter for GeminiAdapter {
    async fn generate_json(&self, prompt: &str) -> Value {
        if self.api_key.is_none() {
            return json!({});
        }
        for model in &self.model_candidates {
            if let Some(text) = self.generate(model, prompt, true).await {
                let parsed = safe_json_extract(&text);
                if parsed.as_object().is_some_and(|obj| !obj.is_empty()) {
                    return parsed;
                }
            }
        }
        json!({})
    }

    async fn generate_text(&self, prompt: &str) -> String {
        if self.api_key.is_none() {
            return String::new();
        }
        for model in &self.model_candidates {
            if let Some(text) = self.generate(model, prompt, false).await {
                return text;
            }
        }
        String::new()
    }
}

fn fenced_json_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"(?si)```json\s*(.*?)\s*```").unwrap())
}

fn brace_snippet_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"(?s)\{.*?\}").unwrap())
}

/// Best-effort extraction of a JSON object from model output.
///
/// Tries, in order: the text as-is, fenced ```json blocks, short
/// brace-delimited snippets, and finally a prefix-tolerant decode from each
/// of the first 20 `{` positions. Returns `{}` when nothing parses.
pub fn safe_json_extract(text: &str) -> Value {
    let text = text.trim();

    let mut candidates: Vec<&str> = vec![text];
    for captures in fenced_json_pattern().captures_iter(text) {
        if let Some(inner) = captures.get(1) {
            candidates.push(inner.as_str());
        }
    }
    for matched in brace_snippet_pattern().find_iter(text) {
        if matched.as_str().contains(':') {
            candidates.push(matched.as_str());
        }
    }

    for candidate in candidates {
        if let Ok(parsed) = serde_json::from_str::<Value>(candidate) {
            if parsed.is_object() {
                return parsed;
            }
        }
    }

    // Tolerate trailing prose after a valid object.
    let starts: Vec<usize> = text
        .char_indices()
        .filter(|(_, ch)| *ch == '{')
        .map(|(idx, _)| idx)
        .take(20)
        .collect();
    for start in starts {
        let mut stream = serde_json::Deserializer::from_str(&text[start..]).into_iter::<Value>();
        if let Some(Ok(parsed)) = stream.next() {
            if parsed.is_object() {
                return parsed;
            }
        }
    }

    warn!("failed to parse JSON from model output");
    json!({})
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_safe_json_extract_plain_object() {
        let parsed = safe_json_extract(r#"{"kpis": [{"metric": "Revenue", "value": "120"}]}"#);
        assert!(parsed["kpis"].is_array());
    }

    #[test]
    fn test_safe_json_extract_fenced_block() {
        let text = "Here is the extraction:\n```json\n{\"kpis\": []}\n```\nDone.";
        let parsed = safe_json_extract(text);
        assert!(parsed["kpis"].is_array());
    }

    #[test]
    fn test_safe_json_extract_embedded_object() {
        let text = "The result {\"summary\": {\"highlights\": [\"strong quarter\"]}} as requested.";
        let parsed = safe_json_extract(text);
        assert_eq!(parsed["summary"]["highlights"][0], "strong quarter");
    }

    #[test]
    fn test_safe_json_extract_object_with_trailing_prose() {
        let text = r#"{"kpis": [{"metric": "Revenue", "value": "1"}], "summary": {}} trailing words"#;
        let parsed = safe_json_extract(text);
        assert!(parsed["kpis"].is_array());
    }

    #[test]
    fn test_safe_json_extract_garbage_is_empty_object() {
        let parsed = safe_json_extract("no json here at all");
        assert_eq!(parsed, json!({}));
        let parsed = safe_json_extract("[1, 2, 3]");
        assert_eq!(parsed, json!({}));
    }

    #[tokio::test]
    async fn test_adapter_without_key_fails_closed() {
        let config = ModelConfig {
            model: None,
            api_key_env: "GRAVITY_TEST_NO_SUCH_KEY".to_string(),
            timeout_secs: 1,
        };
        let adapter = GeminiAdapter::new(&config);
        assert_eq!(adapter.generate_json("prompt").await, json!({}));
        assert_eq!(adapter.generate_text("prompt").await, "");
    }

    #[test]
    fn test_candidate_list_dedupes_preferred_model() {
        let config = ModelConfig {
            model: Some("gemini-2.0-flash".to_string()),
            api_key_env: "GRAVITY_TEST_NO_SUCH_KEY".to_string(),
            timeout_secs: 1,
        };
        let adapter = GeminiAdapter::new(&config);
        assert_eq!(adapter.model_candidates[0], "gemini-2.0-flash");
        assert_eq!(
            adapter
                .model_candidates
                .iter()
                .filter(|m| m.as_str() == "gemini-2.0-flash")
                .count(),
            1
        );
    }
}
