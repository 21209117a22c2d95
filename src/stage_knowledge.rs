//! Knowledge stage: chunk an analysis into retrievable units, upsert them,
//! and rebuild the lexical index.
//!
//! `ChunkFacts → IndexChunks → RebuildLexicalIndex → PersistReceipt`.
//! Chunk ids are deterministic per accession so reprocessing upserts
//! instead of appending. An absent analysis makes the stage a no-op.

use anyhow::Result;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::models::{AnalysisPayload, Chunk, IndexReceipt};
use crate::rag::RetrievalEngine;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KnowledgeState {
    pub analysis: Option<AnalysisPayload>,
    pub chunks: Vec<Chunk>,
    pub index_receipt: Option<IndexReceipt>,
    pub trace: Vec<String>,
    pub errors: Vec<String>,
}

pub struct KnowledgeStage<'a> {
    rag: &'a RetrievalEngine,
}

impl<'a> KnowledgeStage<'a> {
    pub fn new(rag: &'a RetrievalEngine) -> Self {
        Self { rag }
    }

    pub async fn run(&self, analysis: Option<AnalysisPayload>) -> Result<KnowledgeState> {
        let mut state = KnowledgeState {
            analysis,
            ..KnowledgeState::default()
        };

        self.chunk_facts(&mut state);
        self.index_chunks(&mut state).await?;
        self.rebuild_lexical_index(&mut state).await?;
        self.persist_receipt(&mut state);

        Ok(state)
    }

    fn chunk_facts(&self, state: &mut KnowledgeState) {
        let Some(analysis) = &state.analysis else {
            state.trace.push("chunk_empty".to_string());
            return;
        };

        state.chunks = chunk_analysis(analysis);
        state.trace.push("chunk_facts".to_string());
    }

    async fn index_chunks(&self, state: &mut KnowledgeState) -> Result<()> {
        if !state.chunks.is_empty() {
            self.rag.add_documents(&state.chunks).await?;
        }
        state.trace.push("index_chunks".to_string());
        Ok(())
    }

    async fn rebuild_lexical_index(&self, state: &mut KnowledgeState) -> Result<()> {
        self.rag.rebuild_lexical_index().await?;
        state.trace.push("rebuild_lexical_index".to_string());
        Ok(())
    }

    fn persist_receipt(&self, state: &mut KnowledgeState) {
        let Some(analysis) = &state.analysis else {
            return;
        };
        state.index_receipt = Some(IndexReceipt {
            accession_number: analysis.accession_number.clone(),
            chunk_count: state.chunks.len(),
            indexed_at: Utc::now(),
        });
        state.trace.push("persist_receipt".to_string());
    }
}

/// One chunk per KPI plus one for the concatenated summary highlights
/// (only when highlights exist).
pub fn chunk_analysis(analysis: &AnalysisPayload) -> Vec<Chunk> {
    let mut chunks = Vec::new();

    for (idx, kpi) in analysis.kpis.iter().enumerate() {
        chunks.push(Chunk {
            id: format!("{}-kpi-{}", analysis.accession_number, idx),
            text: format!("KPI {}: {} = {}", idx + 1, kpi.metric, kpi.value),
            metadata: chunk_metadata(analysis, "kpi"),
        });
    }

    let highlights = analysis
        .summary
        .get("highlights")
        .cloned()
        .unwrap_or_default();
    if !highlights.is_empty() {
        chunks.push(Chunk {
            id: format!("{}-summary", analysis.accession_number),
            text: format!("Summary: {}", highlights.join(" ")),
            metadata: chunk_metadata(analysis, "summary"),
        });
    }

    chunks
}

fn chunk_metadata(analysis: &AnalysisPayload, kind: &str) -> HashMap<String, String> {
    HashMap::from([
        ("ticker".to_string(), analysis.ticker.clone()),
        (
            "accession_number".to_string(),
            analysis.accession_number.clone(),
        ),
        ("kind".to_string(), kind.to_string()),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EmbeddingConfig;
    use crate::migrate;
    use crate::models::Kpi;

    fn analysis(accession: &str) -> AnalysisPayload {
        AnalysisPayload {
            ticker: "AAPL".to_string(),
            accession_number: accession.to_string(),
            kpis: vec![
                Kpi {
                    metric: "Revenue".to_string(),
                    value: "120".to_string(),
                    extra: HashMap::new(),
                },
                Kpi {
                    metric: "EPS".to_string(),
                    value: "1.25".to_string(),
                    extra: HashMap::new(),
                },
            ],
            summary: HashMap::from([(
                "highlights".to_string(),
                vec!["Revenue up 20%".to_string(), "Margins stable".to_string()],
            )]),
            guidance: Vec::new(),
        }
    }

    async fn memory_engine() -> RetrievalEngine {
        let pool = crate::db::connect_memory().await.unwrap();
        migrate::migrate_rag(&pool).await.unwrap();
        RetrievalEngine::new(pool, EmbeddingConfig::default())
    }

    #[test]
    fn test_chunk_ids_are_deterministic() {
        let first = chunk_analysis(&analysis("ACC-1"));
        let second = chunk_analysis(&analysis("ACC-1"));
        assert_eq!(first.len(), 3);
        assert_eq!(first[0].id, "ACC-1-kpi-0");
        assert_eq!(first[1].id, "ACC-1-kpi-1");
        assert_eq!(first[2].id, "ACC-1-summary");
        for (a, b) in first.iter().zip(second.iter()) {
            assert_eq!(a.id, b.id);
            assert_eq!(a.text, b.text);
        }
    }

    #[test]
    fn test_chunk_text_format() {
        let chunks = chunk_analysis(&analysis("ACC-1"));
        assert_eq!(chunks[0].text, "KPI 1: Revenue = 120");
        assert_eq!(chunks[1].text, "KPI 2: EPS = 1.25");
        assert_eq!(chunks[2].text, "Summary: Revenue up 20% Margins stable");
        assert_eq!(chunks[0].metadata.get("kind").unwrap(), "kpi");
        assert_eq!(chunks[2].metadata.get("kind").unwrap(), "summary");
    }

    #[test]
    fn test_no_summary_chunk_without_highlights() {
        let mut payload = analysis("ACC-2");
        payload.summary.clear();
        let chunks = chunk_analysis(&payload);
        assert_eq!(chunks.len(), 2);
        assert!(chunks.iter().all(|chunk| chunk.metadata["kind"] == "kpi"));
    }

    #[tokio::test]
    async fn test_reindexing_same_analysis_is_idempotent() {
        let engine = memory_engine().await;
        let stage = KnowledgeStage::new(&engine);

        let first = stage.run(Some(analysis("ACC-3"))).await.unwrap();
        let second = stage.run(Some(analysis("ACC-3"))).await.unwrap();

        assert_eq!(first.index_receipt.as_ref().unwrap().chunk_count, 3);
        assert_eq!(second.index_receipt.as_ref().unwrap().chunk_count, 3);
        assert_eq!(engine.count_chunks().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_absent_analysis_is_noop() {
        let engine = memory_engine().await;
        let stage = KnowledgeStage::new(&engine);

        let state = stage.run(None).await.unwrap();
        assert!(state.chunks.is_empty());
        assert!(state.index_receipt.is_none());
        assert!(state.trace.contains(&"chunk_empty".to_string()));
        assert_eq!(engine.count_chunks().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_indexed_chunks_are_searchable() {
        let engine = memory_engine().await;
        let stage = KnowledgeStage::new(&engine);
        stage.run(Some(analysis("ACC-4"))).await.unwrap();

        let hits = engine.keyword_search("revenue", 8, None).await.unwrap();
        assert!(!hits.is_empty());
        assert!(hits.iter().any(|hit| hit.chunk_id == "ACC-4-kpi-0"));
    }
}
