//! Fact extraction, validation, and answer synthesis around the model
//! adapter.
//!
//! Model output is treated as an untrusted payload at a parse boundary:
//! [`normalize_analysis`] applies explicit coercion rules per field
//! (list-or-dict-or-string into canonical shapes, scalars to strings)
//! rather than trusting the adapter.

use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;

use crate::confidence::normalize_confidence;
use crate::model::ModelAdapter;
use crate::models::Kpi;

pub const REVENUE_ALIASES: &[&str] = &[
    "revenue",
    "net sales",
    "sales",
    "turnover",
    "top line",
    "total revenue",
    "product revenue",
    "services revenue",
];

/// Phrases that mark a derivation as a non-answer; such results are
/// discarded and their confidence forced to 0.
pub const NON_ANSWER_PATTERNS: &[&str] = &[
    "insufficient context",
    "cannot determine",
    "unable to determine",
    "not enough information",
    "unknown",
];

pub struct ExtractionEngine {
    adapter: Arc<dyn ModelAdapter>,
}

impl ExtractionEngine {
    pub fn new(adapter: Arc<dyn ModelAdapter>) -> Self {
        Self { adapter }
    }

    /// One extraction pass. Transport failures surface as `{}`, which the
    /// analysis stage treats as invalid output.
    pub async fn extract(&self, raw_text: &str, reflection: bool, market: &str) -> Value {
        let prompt = build_prompt(raw_text, reflection, market);
        let data = self.adapter.generate_json(&prompt).await;
        if !data.is_object() {
            return json!({});
        }
        normalize_metric_aliases(data)
    }

    /// Valid iff there is a non-empty kpis list, every item carries both
    /// `metric` and `value`, and at least one KPI is revenue-equivalent.
    /// When no alias matches textually, the adapter is asked to adjudicate
    /// as a last resort.
    pub async fn is_valid(&self, data: &Value) -> bool {
        let Some(kpis) = data["kpis"].as_array() else {
            return false;
        };
        if kpis.is_empty() {
            return false;
        }
        for item in kpis {
            let Some(obj) = item.as_object() else {
                return false;
            };
            if !obj.contains_key("metric") || !obj.contains_key("value") {
                return false;
            }
        }
        if contains_revenue_metric(kpis) {
            return true;
        }
        self.llm_deduces_revenue(data).await
    }

    async fn llm_deduces_revenue(&self, data: &Value) -> bool {
        let probe = json!({
            "kpis": data["kpis"],
            "summary": data["summary"],
            "guidance": data["guidance"],
        });
        let prompt = format!(
            "Determine if any KPI is revenue-equivalent (revenue, net sales, turnover, top line). \
             Answer with YES or NO only.\n\nData:\n{}",
            probe
        );
        let decision = self.adapter.generate_text(&prompt).await;
        let verdict = decision.trim().to_uppercase().starts_with("YES");
        if !verdict && decision.trim().is_empty() {
            warn!("revenue-equivalent KPI adjudication unavailable");
        }
        verdict
    }
}

fn contains_revenue_metric(kpis: &[Value]) -> bool {
    kpis.iter().any(|item| {
        let metric = item["metric"].as_str().unwrap_or_default().to_lowercase();
        REVENUE_ALIASES.iter().any(|alias| metric.contains(alias))
    })
}

/// Rewrite revenue-equivalent metric names to the canonical `Revenue`
/// label, preserving the original under `raw_metric`.
pub fn normalize_metric_aliases(mut data: Value) -> Value {
    let Some(kpis) = data.get_mut("kpis").and_then(Value::as_array_mut) else {
        return data;
    };
    for item in kpis {
        let Some(obj) = item.as_object_mut() else {
            continue;
        };
        let metric = obj
            .get("metric")
            .and_then(|m| m.as_str())
            .unwrap_or_default()
            .to_string();
        let lower = metric.to_lowercase();
        if REVENUE_ALIASES.iter().any(|alias| lower.contains(alias)) && metric != "Revenue" {
            obj.entry("raw_metric".to_string())
                .or_insert_with(|| Value::String(metric.clone()));
            obj.insert("metric".to_string(), Value::String("Revenue".to_string()));
        }
    }
    data
}

fn build_prompt(raw_text: &str, reflection: bool, market: &str) -> String {
    if market == "SEA_LOCAL" {
        if reflection {
            return format!(
                "Extract financial data as JSON with keys: kpis, summary, guidance. \
                 Previous extraction failed. Identify the source language and currency, \
                 translate to English, and normalize monetary values to USD.\n\nText:\n{raw_text}"
            );
        }
        return format!(
            "You are an expert financial analyst. Your task is to process a Southeast Asian financial filing.\n\
             1. Identify original language and currency.\n\
             2. Translate narrative management guidance into English.\n\
             3. Normalize all monetary KPI values to USD.\n\
             Return valid JSON only with keys: kpis, summary, guidance. Each KPI requires metric and value.\n\nText:\n{raw_text}"
        );
    }

    if reflection {
        return format!(
            "Extract financial data as JSON with keys: kpis, summary, guidance. \
             Previous extraction failed. Ensure Revenue (or equivalent such as net sales/turnover) \
             is present when available.\n\nText:\n{raw_text}"
        );
    }
    format!(
        "You are a CFA-level financial analyst. Return valid JSON only with keys: kpis, summary, guidance. \
         Each KPI requires metric and value. Normalize revenue-equivalent metrics (e.g., net sales) to \
         metric='Revenue'.\n\nText:\n{raw_text}"
    )
}

fn scalar_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Canonical shapes for one analysis payload.
pub struct NormalizedAnalysis {
    pub kpis: Vec<Kpi>,
    pub summary: HashMap<String, Vec<String>>,
    pub guidance: Vec<HashMap<String, String>>,
}

/// Coerce heterogeneous model output into the canonical shapes: kpis may
/// arrive as a dict, list, or anything else; summary as dict/list/string;
/// guidance as dict/list/string. All scalar values become strings.
pub fn normalize_analysis(data: &Value) -> NormalizedAnalysis {
    if !data.is_object() {
        return NormalizedAnalysis {
            kpis: Vec::new(),
            summary: HashMap::new(),
            guidance: Vec::new(),
        };
    }

    let kpi_values: Vec<Value> = match &data["kpis"] {
        Value::Array(items) => items.clone(),
        Value::Object(_) => vec![data["kpis"].clone()],
        _ => Vec::new(),
    };
    let kpis = kpi_values
        .into_iter()
        .filter_map(|item| {
            let obj = item.as_object()?;
            let mut metric = String::new();
            let mut value = String::new();
            let mut extra = HashMap::new();
            for (key, entry) in obj {
                match key.as_str() {
                    "metric" => metric = scalar_to_string(entry),
                    "value" => value = scalar_to_string(entry),
                    other => {
                        extra.insert(other.to_string(), scalar_to_string(entry));
                    }
                }
            }
            Some(Kpi { metric, value, extra })
        })
        .collect();

    let summary = match &data["summary"] {
        Value::String(s) => HashMap::from([("highlights".to_string(), vec![s.clone()])]),
        Value::Array(items) => HashMap::from([(
            "highlights".to_string(),
            items.iter().map(scalar_to_string).collect(),
        )]),
        Value::Object(map) => map
            .iter()
            .map(|(key, entry)| {
                let values = match entry {
                    Value::Array(items) => items.iter().map(scalar_to_string).collect(),
                    other => vec![scalar_to_string(other)],
                };
                (key.clone(), values)
            })
            .collect(),
        _ => HashMap::new(),
    };

    let guidance_values: Vec<Value> = match &data["guidance"] {
        Value::Array(items) => items.clone(),
        Value::Object(_) => vec![data["guidance"].clone()],
        Value::String(s) => vec![json!({"note": s})],
        _ => Vec::new(),
    };
    let guidance = guidance_values
        .into_iter()
        .filter_map(|item| {
            let obj = item.as_object()?;
            Some(
                obj.iter()
                    .map(|(key, entry)| (key.clone(), scalar_to_string(entry)))
                    .collect(),
            )
        })
        .collect();

    NormalizedAnalysis {
        kpis,
        summary,
        guidance,
    }
}

/// Outcome of a metric derivation attempt.
#[derive(Debug, Clone, Default)]
pub struct Derivation {
    pub derived_answer: Option<String>,
    pub confidence: f64,
    pub trace: Vec<String>,
}

pub struct SynthesisEngine {
    adapter: Arc<dyn ModelAdapter>,
}

impl SynthesisEngine {
    pub fn new(adapter: Arc<dyn ModelAdapter>) -> Self {
        Self { adapter }
    }

    /// Grounded markdown answer over the fused contexts.
    pub async fn synthesize(&self, question: &str, contexts: &[String]) -> String {
        let joined = contexts.join("\n\n");
        let prompt = format!(
            "Answer in markdown, grounded only in provided context. Include a short citations section.\n\
             Question: {question}\n\nContext:\n{joined}"
        );
        let text = self.adapter.generate_text(&prompt).await;
        if text.trim().is_empty() {
            return "### Answer\nInsufficient context to provide a grounded response.".to_string();
        }
        text
    }

    /// Ask the adapter to compute a numeric/derived answer strictly from
    /// evidence. Absent evidence, a declined answer, or a non-answer phrase
    /// all yield a discarded result with confidence 0 — this never
    /// fabricates a confident-looking fallback.
    pub async fn derive_metric(&self, question: &str, contexts: &[String]) -> Derivation {
        if contexts.is_empty() {
            return Derivation::default();
        }

        let joined = contexts.join("\n\n");
        let prompt = format!(
            "Compute the requested figure strictly from the evidence below. Do not estimate beyond it. \
             Return JSON with keys: derived_answer (string), confidence (0..1), \
             derivation_trace (at most 5 short steps). If the evidence is insufficient, set \
             derived_answer to \"insufficient context\".\n\nQuestion: {question}\n\nEvidence:\n{joined}"
        );
        let data = self.adapter.generate_json(&prompt).await;

        let derived = data["derived_answer"].as_str().unwrap_or_default().trim().to_string();
        if derived.is_empty() || is_non_answer(&derived) {
            return Derivation::default();
        }

        let confidence = normalize_confidence(data["confidence"].as_f64().unwrap_or(0.0));
        let mut trace: Vec<String> = match data["derivation_trace"].as_array() {
            Some(steps) => steps.iter().map(scalar_to_string).collect(),
            None => Vec::new(),
        };
        trace.truncate(5);

        Derivation {
            derived_answer: Some(derived),
            confidence,
            trace,
        }
    }
}

pub fn is_non_answer(text: &str) -> bool {
    let lower = text.to_lowercase();
    NON_ANSWER_PATTERNS.iter().any(|pattern| lower.contains(pattern))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct ScriptedAdapter {
        json_response: Value,
        text_response: String,
        json_calls: AtomicUsize,
        text_calls: AtomicUsize,
    }

    impl ScriptedAdapter {
        fn new(json_response: Value, text_response: &str) -> Self {
            Self {
                json_response,
                text_response: text_response.to_string(),
                json_calls: AtomicUsize::new(0),
                text_calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl ModelAdapter for ScriptedAdapter {
        async fn generate_json(&self, _prompt: &str) -> Value {
            self.json_calls.fetch_add(1, Ordering::SeqCst);
            self.json_response.clone()
        }

        async fn generate_text(&self, _prompt: &str) -> String {
            self.text_calls.fetch_add(1, Ordering::SeqCst);
            self.text_response.clone()
        }
    }

    #[test]
    fn test_alias_normalization_preserves_original() {
        let data = json!({"kpis": [{"metric": "Net Sales", "value": "120"}]});
        let normalized = normalize_metric_aliases(data);
        assert_eq!(normalized["kpis"][0]["metric"], "Revenue");
        assert_eq!(normalized["kpis"][0]["raw_metric"], "Net Sales");
    }

    #[test]
    fn test_alias_normalization_leaves_canonical_alone() {
        let data = json!({"kpis": [{"metric": "Revenue", "value": "120"}]});
        let normalized = normalize_metric_aliases(data);
        assert_eq!(normalized["kpis"][0]["metric"], "Revenue");
        assert!(normalized["kpis"][0].get("raw_metric").is_none());
    }

    #[tokio::test]
    async fn test_is_valid_requires_metric_and_value() {
        let adapter = Arc::new(ScriptedAdapter::new(json!({}), "NO"));
        let engine = ExtractionEngine::new(adapter);

        assert!(!engine.is_valid(&json!({})).await);
        assert!(!engine.is_valid(&json!({"kpis": []})).await);
        assert!(
            !engine
                .is_valid(&json!({"kpis": [{"metric": "Revenue"}]}))
                .await
        );
        assert!(
            engine
                .is_valid(&json!({"kpis": [{"metric": "Net Sales", "value": "1"}]}))
                .await
        );
    }

    #[tokio::test]
    async fn test_is_valid_llm_adjudication_fallback() {
        let yes = Arc::new(ScriptedAdapter::new(json!({}), "YES, the first KPI is revenue."));
        let engine = ExtractionEngine::new(yes.clone());
        let data = json!({"kpis": [{"metric": "Pendapatan", "value": "15.5T"}]});
        assert!(engine.is_valid(&data).await);
        assert_eq!(yes.text_calls.load(Ordering::SeqCst), 1);

        let no = Arc::new(ScriptedAdapter::new(json!({}), "NO"));
        let engine = ExtractionEngine::new(no);
        assert!(!engine.is_valid(&data).await);
    }

    #[test]
    fn test_normalize_analysis_coerces_shapes() {
        let data = json!({
            "kpis": {"metric": "Revenue", "value": 120, "period": "Q3"},
            "summary": "Strong quarter overall",
            "guidance": "High single digit growth",
        });
        let normalized = normalize_analysis(&data);
        assert_eq!(normalized.kpis.len(), 1);
        assert_eq!(normalized.kpis[0].value, "120");
        assert_eq!(normalized.kpis[0].extra.get("period").unwrap(), "Q3");
        assert_eq!(
            normalized.summary.get("highlights").unwrap(),
            &vec!["Strong quarter overall".to_string()]
        );
        assert_eq!(
            normalized.guidance[0].get("note").unwrap(),
            "High single digit growth"
        );
    }

    #[test]
    fn test_normalize_analysis_drops_malformed_items() {
        let data = json!({
            "kpis": [{"metric": "Revenue", "value": "1"}, "not a dict", 42],
            "summary": ["h1", 2],
            "guidance": [{"note": "n"}, "loose string"],
        });
        let normalized = normalize_analysis(&data);
        assert_eq!(normalized.kpis.len(), 1);
        assert_eq!(
            normalized.summary.get("highlights").unwrap(),
            &vec!["h1".to_string(), "2".to_string()]
        );
        assert_eq!(normalized.guidance.len(), 1);
    }

    #[test]
    fn test_normalize_analysis_non_object() {
        let normalized = normalize_analysis(&json!("oops"));
        assert!(normalized.kpis.is_empty());
        assert!(normalized.summary.is_empty());
        assert!(normalized.guidance.is_empty());
    }

    #[tokio::test]
    async fn test_synthesize_falls_back_on_empty_output() {
        let adapter = Arc::new(ScriptedAdapter::new(json!({}), ""));
        let engine = SynthesisEngine::new(adapter);
        let answer = engine.synthesize("What is revenue?", &["ctx".to_string()]).await;
        assert!(answer.contains("Insufficient context"));
    }

    #[tokio::test]
    async fn test_derive_metric_happy_path() {
        let adapter = Arc::new(ScriptedAdapter::new(
            json!({
                "derived_answer": "Revenue growth is 20.0% quarter-over-quarter.",
                "confidence": 0.84,
                "derivation_trace": ["found 120", "found 100", "computed (120-100)/100"],
            }),
            "",
        ));
        let engine = SynthesisEngine::new(adapter);
        let derivation = engine
            .derive_metric("What is revenue growth?", &["Revenue 120 vs 100".to_string()])
            .await;
        assert_eq!(
            derivation.derived_answer.as_deref(),
            Some("Revenue growth is 20.0% quarter-over-quarter.")
        );
        assert_eq!(derivation.confidence, 0.84);
        assert_eq!(derivation.trace.len(), 3);
    }

    #[tokio::test]
    async fn test_derive_metric_discards_non_answers() {
        let adapter = Arc::new(ScriptedAdapter::new(
            json!({"derived_answer": "Insufficient context to compute this.", "confidence": 0.9}),
            "",
        ));
        let engine = SynthesisEngine::new(adapter);
        let derivation = engine.derive_metric("q", &["ctx".to_string()]).await;
        assert!(derivation.derived_answer.is_none());
        assert_eq!(derivation.confidence, 0.0);
    }

    #[tokio::test]
    async fn test_derive_metric_clamps_confidence_and_trace() {
        let adapter = Arc::new(ScriptedAdapter::new(
            json!({
                "derived_answer": "42",
                "confidence": 7.5,
                "derivation_trace": ["1", "2", "3", "4", "5", "6", "7"],
            }),
            "",
        ));
        let engine = SynthesisEngine::new(adapter);
        let derivation = engine.derive_metric("q", &["ctx".to_string()]).await;
        assert_eq!(derivation.confidence, 1.0);
        assert_eq!(derivation.trace.len(), 5);
    }

    #[tokio::test]
    async fn test_derive_metric_skips_without_evidence() {
        let adapter = Arc::new(ScriptedAdapter::new(json!({"derived_answer": "42"}), ""));
        let engine = SynthesisEngine::new(adapter.clone());
        let derivation = engine.derive_metric("q", &[]).await;
        assert!(derivation.derived_answer.is_none());
        assert_eq!(adapter.json_calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_non_answer_patterns() {
        assert!(is_non_answer("Insufficient context."));
        assert!(is_non_answer("I cannot determine the value"));
        assert!(is_non_answer("UNKNOWN"));
        assert!(!is_non_answer("Revenue grew 20%"));
    }

    #[tokio::test]
    async fn test_extract_normalizes_aliases_inline() {
        let adapter = Arc::new(ScriptedAdapter::new(
            json!({"kpis": [{"metric": "Turnover", "value": "9"}]}),
            "",
        ));
        let engine = ExtractionEngine::new(adapter);
        let extracted = engine.extract("text", false, "US_SEC").await;
        assert_eq!(extracted["kpis"][0]["metric"], "Revenue");
        assert_eq!(extracted["kpis"][0]["raw_metric"], "Turnover");
    }
}
