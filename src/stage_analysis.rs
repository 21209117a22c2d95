//! Analysis stage state machine.
//!
//! `BuildPrompt → CallModel → Validate → {ReflectOnce → Validate} →
//! {DeadLetter | EmitAnalysis}`. The retry budget is a single reflection
//! pass: the model adapter is invoked at most twice per filing, and a
//! transport failure surfaces as invalid output rather than an error
//! escaping the stage.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::extraction::{normalize_analysis, ExtractionEngine};
use crate::models::{AnalysisPayload, FilingPayload};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeadLetterNote {
    pub ticker: String,
    pub accession_number: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AnalysisState {
    pub filing_payload: Option<FilingPayload>,
    #[serde(default)]
    pub analysis_dict: Value,
    pub analysis: Option<AnalysisPayload>,
    pub dead_letter: Option<DeadLetterNote>,
    pub reflection_attempted: bool,
    pub is_valid: bool,
    pub trace: Vec<String>,
    pub errors: Vec<String>,
}

enum ValidationRoute {
    Emit,
    Reflect,
    DeadLetter,
}

pub struct AnalysisStage<'a> {
    extraction: &'a ExtractionEngine,
}

impl<'a> AnalysisStage<'a> {
    pub fn new(extraction: &'a ExtractionEngine) -> Self {
        Self { extraction }
    }

    pub async fn run(&self, payload: FilingPayload) -> Result<AnalysisState> {
        let mut state = AnalysisState {
            filing_payload: Some(payload),
            ..AnalysisState::default()
        };

        self.build_prompt(&mut state);
        self.call_model(&mut state).await;
        self.validate(&mut state).await;

        loop {
            match self.route_after_validation(&state) {
                ValidationRoute::Emit => {
                    self.emit_analysis(&mut state);
                    break;
                }
                ValidationRoute::Reflect => {
                    self.reflect_once(&mut state).await;
                    self.validate(&mut state).await;
                }
                ValidationRoute::DeadLetter => {
                    self.dead_letter(&mut state);
                    break;
                }
            }
        }

        Ok(state)
    }

    fn build_prompt(&self, state: &mut AnalysisState) {
        state.trace.push("build_prompt".to_string());
    }

    async fn call_model(&self, state: &mut AnalysisState) {
        let Some(payload) = state.filing_payload.clone() else {
            state.errors.push("missing_filing_payload".to_string());
            state.analysis_dict = Value::Object(Default::default());
            return;
        };
        state.analysis_dict = self
            .extraction
            .extract(&payload.raw_text, false, &payload.market)
            .await;
        state.reflection_attempted = false;
        state.trace.push("call_model_extract".to_string());
    }

    async fn validate(&self, state: &mut AnalysisState) {
        state.is_valid = self.extraction.is_valid(&state.analysis_dict).await;
        state.trace.push("validate_json".to_string());
    }

    fn route_after_validation(&self, state: &AnalysisState) -> ValidationRoute {
        if state.is_valid {
            ValidationRoute::Emit
        } else if state.reflection_attempted {
            ValidationRoute::DeadLetter
        } else {
            ValidationRoute::Reflect
        }
    }

    async fn reflect_once(&self, state: &mut AnalysisState) {
        let Some(payload) = state.filing_payload.clone() else {
            state.reflection_attempted = true;
            return;
        };
        state.analysis_dict = self
            .extraction
            .extract(&payload.raw_text, true, &payload.market)
            .await;
        state.reflection_attempted = true;
        state.trace.push("reflection_retry_once".to_string());
    }

    fn dead_letter(&self, state: &mut AnalysisState) {
        let (ticker, accession) = match &state.filing_payload {
            Some(payload) => (payload.ticker.clone(), payload.accession_number.clone()),
            None => (String::new(), String::new()),
        };
        state.errors.push("analysis_validation_failed".to_string());
        state.dead_letter = Some(DeadLetterNote {
            ticker,
            accession_number: accession,
            reason: "validation_failed_after_reflection".to_string(),
        });
        state.trace.push("dead_letter".to_string());
    }

    fn emit_analysis(&self, state: &mut AnalysisState) {
        let Some(payload) = &state.filing_payload else {
            return;
        };
        let normalized = normalize_analysis(&state.analysis_dict);
        state.analysis = Some(AnalysisPayload {
            ticker: payload.ticker.clone(),
            accession_number: payload.accession_number.clone(),
            kpis: normalized.kpis,
            summary: normalized.summary,
            guidance: normalized.guidance,
        });
        state.trace.push("emit_analysis_payload".to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ModelAdapter;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Adapter returning a scripted sequence of extraction results.
    struct SequenceAdapter {
        responses: Vec<Value>,
        calls: AtomicUsize,
    }

    impl SequenceAdapter {
        fn new(responses: Vec<Value>) -> Arc<Self> {
            Arc::new(Self {
                responses,
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl ModelAdapter for SequenceAdapter {
        async fn generate_json(&self, _prompt: &str) -> Value {
            let idx = self.calls.fetch_add(1, Ordering::SeqCst);
            self.responses
                .get(idx)
                .cloned()
                .unwrap_or_else(|| json!({}))
        }

        async fn generate_text(&self, _prompt: &str) -> String {
            "NO".to_string()
        }
    }

    fn payload(accession: &str) -> FilingPayload {
        FilingPayload {
            ticker: "AAPL".to_string(),
            accession_number: accession.to_string(),
            filing_url: format!("https://x/{accession}.htm"),
            market: "US_SEC".to_string(),
            exchange: "SEC".to_string(),
            issuer_id: String::new(),
            source: "sec".to_string(),
            source_event_id: accession.to_string(),
            raw_text: "Revenue was $120M, up 20%.".to_string(),
            metadata: Default::default(),
        }
    }

    fn valid_extraction() -> Value {
        json!({"kpis": [{"metric": "Revenue", "value": "120"}], "summary": {"highlights": ["up 20%"]}})
    }

    #[tokio::test]
    async fn test_valid_first_pass_emits_without_reflection() {
        let adapter = SequenceAdapter::new(vec![valid_extraction()]);
        let engine = ExtractionEngine::new(adapter.clone());
        let stage = AnalysisStage::new(&engine);

        let state = stage.run(payload("A1")).await.unwrap();
        assert!(state.analysis.is_some());
        assert!(state.dead_letter.is_none());
        assert_eq!(adapter.calls.load(Ordering::SeqCst), 1);
        assert!(!state.trace.contains(&"reflection_retry_once".to_string()));
    }

    #[tokio::test]
    async fn test_invalid_then_valid_reflects_once() {
        let adapter = SequenceAdapter::new(vec![json!({}), valid_extraction()]);
        let engine = ExtractionEngine::new(adapter.clone());
        let stage = AnalysisStage::new(&engine);

        let state = stage.run(payload("A2")).await.unwrap();
        assert!(state.analysis.is_some());
        assert_eq!(adapter.calls.load(Ordering::SeqCst), 2);
        assert!(state.trace.contains(&"reflection_retry_once".to_string()));
    }

    #[tokio::test]
    async fn test_retry_bound_is_exactly_two_invocations() {
        // Both passes fail; a third invocation would be a bug.
        let adapter = SequenceAdapter::new(vec![json!({}), json!({}), valid_extraction()]);
        let engine = ExtractionEngine::new(adapter.clone());
        let stage = AnalysisStage::new(&engine);

        let state = stage.run(payload("A3")).await.unwrap();
        assert!(state.analysis.is_none());
        assert_eq!(adapter.calls.load(Ordering::SeqCst), 2);

        let note = state.dead_letter.unwrap();
        assert_eq!(note.reason, "validation_failed_after_reflection");
        assert_eq!(note.accession_number, "A3");
        assert!(state.errors.contains(&"analysis_validation_failed".to_string()));
    }

    #[tokio::test]
    async fn test_missing_revenue_dead_letters() {
        let no_revenue = json!({"kpis": [{"metric": "EPS", "value": "1.25"}]});
        let adapter = SequenceAdapter::new(vec![no_revenue.clone(), no_revenue]);
        let engine = ExtractionEngine::new(adapter);
        let stage = AnalysisStage::new(&engine);

        let state = stage.run(payload("A4")).await.unwrap();
        assert!(state.analysis.is_none());
        assert!(state.dead_letter.is_some());
    }

    #[tokio::test]
    async fn test_emitted_payload_is_normalized() {
        let messy = json!({
            "kpis": [{"metric": "Net Sales", "value": 120}],
            "summary": "strong quarter",
            "guidance": "cautious on margins",
        });
        let adapter = SequenceAdapter::new(vec![messy]);
        let engine = ExtractionEngine::new(adapter);
        let stage = AnalysisStage::new(&engine);

        let state = stage.run(payload("A5")).await.unwrap();
        let analysis = state.analysis.unwrap();
        assert_eq!(analysis.kpis.len(), 1);
        assert_eq!(analysis.kpis[0].metric, "Revenue");
        assert_eq!(analysis.kpis[0].value, "120");
        assert_eq!(analysis.kpis[0].extra.get("raw_metric").unwrap(), "Net Sales");
        assert_eq!(
            analysis.summary.get("highlights").unwrap(),
            &vec!["strong quarter".to_string()]
        );
        assert_eq!(analysis.guidance[0].get("note").unwrap(), "cautious on margins");
    }
}
