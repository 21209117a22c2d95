//! Query stage: retrieve evidence over both channels, fuse, optionally
//! derive a computed metric, and synthesize a cited markdown answer.
//!
//! `ParseQuestion → RetrieveSemantic → RetrieveKeyword → FuseRRF →
//! DeriveMetric → SynthesizeAnswer`. Final confidence is the derivation
//! confidence when positive, otherwise a citation-count heuristic, always
//! clamped to [0, 1] and rounded to 4 decimals.

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::confidence::normalize_confidence;
use crate::extraction::SynthesisEngine;
use crate::models::SearchResult;
use crate::rag::{reciprocal_rank_fusion, RetrievalEngine};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryState {
    pub question: String,
    pub ticker: Option<String>,
    pub semantic_results: Vec<SearchResult>,
    pub keyword_results: Vec<SearchResult>,
    pub retrieval_results: Vec<SearchResult>,
    pub derived_answer: Option<String>,
    pub derivation_trace: Vec<String>,
    pub answer: String,
    pub answer_citations: Vec<String>,
    pub answer_confidence: f64,
    pub trace: Vec<String>,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Copy)]
pub struct QueryParams {
    pub top_k: usize,
    pub rrf_k: usize,
    pub derive_context_k: usize,
}

pub struct QueryStage<'a> {
    rag: &'a RetrievalEngine,
    synthesis: &'a SynthesisEngine,
    params: QueryParams,
}

impl<'a> QueryStage<'a> {
    pub fn new(rag: &'a RetrievalEngine, synthesis: &'a SynthesisEngine, params: QueryParams) -> Self {
        Self {
            rag,
            synthesis,
            params,
        }
    }

    pub async fn run(&self, question: &str, ticker: Option<&str>) -> Result<QueryState> {
        let mut state = QueryState {
            question: question.trim().to_string(),
            ticker: ticker.map(|t| t.trim().to_uppercase()),
            ..QueryState::default()
        };
        state.trace.push("parse_question".to_string());

        self.retrieve_semantic(&mut state).await?;
        self.retrieve_keyword(&mut state).await?;
        self.fuse_rrf(&mut state);
        self.derive_metric(&mut state).await;
        self.synthesize_answer(&mut state).await;

        Ok(state)
    }

    async fn retrieve_semantic(&self, state: &mut QueryState) -> Result<()> {
        state.semantic_results = self
            .rag
            .semantic_search(&state.question, self.params.top_k, state.ticker.as_deref())
            .await?;
        state.trace.push("retrieve_semantic".to_string());
        Ok(())
    }

    async fn retrieve_keyword(&self, state: &mut QueryState) -> Result<()> {
        state.keyword_results = self
            .rag
            .keyword_search(&state.question, self.params.top_k, state.ticker.as_deref())
            .await?;
        state.trace.push("retrieve_keyword".to_string());
        Ok(())
    }

    fn fuse_rrf(&self, state: &mut QueryState) {
        state.retrieval_results = reciprocal_rank_fusion(
            &state.semantic_results,
            &state.keyword_results,
            self.params.top_k,
            self.params.rrf_k,
        );
        state.trace.push("fuse_rrf".to_string());
    }

    async fn derive_metric(&self, state: &mut QueryState) {
        let contexts: Vec<String> = state
            .retrieval_results
            .iter()
            .take(self.params.derive_context_k)
            .map(|result| result.text.clone())
            .collect();

        let derivation = self.synthesis.derive_metric(&state.question, &contexts).await;
        state.derived_answer = derivation.derived_answer;
        state.derivation_trace = derivation.trace;
        state.answer_confidence = derivation.confidence;
        state.trace.push("derive_metric".to_string());
    }

    async fn synthesize_answer(&self, state: &mut QueryState) {
        let contexts: Vec<String> = state
            .retrieval_results
            .iter()
            .map(|result| result.text.clone())
            .collect();
        state.answer_citations = state
            .retrieval_results
            .iter()
            .filter_map(|result| {
                let accession = result
                    .metadata
                    .get("accession_number")
                    .cloned()
                    .unwrap_or_default();
                if accession.is_empty() {
                    return None;
                }
                let kind = result.metadata.get("kind").cloned().unwrap_or_default();
                Some(format!("{accession}:{kind}"))
            })
            .collect();

        let mut answer = self.synthesis.synthesize(&state.question, &contexts).await;

        if let Some(derived) = &state.derived_answer {
            answer.push_str("\n\n### Derived Metric\n");
            answer.push_str(derived);
            if !state.derivation_trace.is_empty() {
                answer.push_str("\n\n#### Derivation\n");
                for (idx, step) in state.derivation_trace.iter().enumerate() {
                    answer.push_str(&format!("{}. {}\n", idx + 1, step));
                }
            }
        }

        state.answer_confidence = if state.answer_confidence > 0.0 {
            normalize_confidence(state.answer_confidence)
        } else {
            citation_confidence(state.answer_citations.len(), contexts.len())
        };
        state.answer = answer;
        state.trace.push("synthesize_answer".to_string());
    }
}

/// Heuristic fallback used when no derivation confidence is available.
pub fn citation_confidence(citations: usize, contexts: usize) -> f64 {
    let score = if citations >= 2 {
        0.8
    } else if citations == 1 {
        0.65
    } else if contexts > 0 {
        0.35
    } else {
        0.0
    };
    normalize_confidence(score)
}
