//! Pipeline orchestrator: owns the four stage machines, sequences their
//! execution, persists checkpoints, and translates stage outcomes into
//! durable status transitions (including dead-letter and replay).
//!
//! Checkpoint thread keys: `("ingestion", "default")`,
//! `("analysis", accession)`, `("knowledge", accession)`,
//! `("query", question)`.

use anyhow::{bail, Context, Result};
use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::checkpoint::CheckpointStore;
use crate::config::{Config, RetrievalConfig};
use crate::db;
use crate::extraction::{ExtractionEngine, SynthesisEngine};
use crate::migrate;
use crate::model::{GeminiAdapter, ModelAdapter};
use crate::models::{AnalysisPayload, FilingPayload, FilingRecord, FilingStatus, IndexReceipt, MarkdownAnswer};
use crate::provider::{create_market_provider, MarketProvider};
use crate::rag::RetrievalEngine;
use crate::stage_analysis::AnalysisStage;
use crate::stage_ingestion::IngestionStage;
use crate::stage_knowledge::KnowledgeStage;
use crate::stage_query::{QueryParams, QueryStage};
use crate::state_store::StateStore;

/// Result of a replay attempt. Repeated analysis failure is reported as
/// `dead_letter` status, not an error.
#[derive(Debug, Clone, Serialize)]
pub struct ReplayOutcome {
    pub status: String,
    pub mode: String,
    pub analyzed: bool,
    pub indexed: bool,
}

pub struct Orchestrator {
    provider: Arc<dyn MarketProvider>,
    state_store: StateStore,
    checkpoints: CheckpointStore,
    rag: RetrievalEngine,
    extraction: ExtractionEngine,
    synthesis: SynthesisEngine,
    retrieval: RetrievalConfig,
}

impl Orchestrator {
    pub fn new(
        provider: Arc<dyn MarketProvider>,
        state_store: StateStore,
        checkpoints: CheckpointStore,
        rag: RetrievalEngine,
        adapter: Arc<dyn ModelAdapter>,
        retrieval: RetrievalConfig,
    ) -> Self {
        Self {
            provider,
            state_store,
            checkpoints,
            rag,
            extraction: ExtractionEngine::new(adapter.clone()),
            synthesis: SynthesisEngine::new(adapter),
            retrieval,
        }
    }

    /// Wire up all stores and engines from the config. Migrations are
    /// idempotent and applied on connect; the lexical index is loaded
    /// eagerly so the first query sees the full corpus.
    pub async fn connect(config: &Config) -> Result<Self> {
        migrate::run_migrations(config).await?;

        let state_pool = db::connect(&config.db.state_path).await?;
        let checkpoint_pool = db::connect(&config.db.checkpoint_path).await?;
        let rag_pool = db::connect(&config.db.rag_path).await?;

        let provider = create_market_provider(&config.pipeline.market, &config.provider)?;
        let adapter: Arc<dyn ModelAdapter> = Arc::new(GeminiAdapter::new(&config.model));

        let rag = RetrievalEngine::new(rag_pool, config.embedding.clone());
        rag.rebuild_lexical_index().await?;

        Ok(Self::new(
            provider,
            StateStore::new(state_pool),
            CheckpointStore::new(checkpoint_pool),
            rag,
            adapter,
            config.retrieval.clone(),
        ))
    }

    pub fn state_store(&self) -> &StateStore {
        &self.state_store
    }

    pub fn checkpoints(&self) -> &CheckpointStore {
        &self.checkpoints
    }

    pub fn rag(&self) -> &RetrievalEngine {
        &self.rag
    }

    pub fn provider(&self) -> &Arc<dyn MarketProvider> {
        &self.provider
    }

    fn query_params(&self) -> QueryParams {
        QueryParams {
            top_k: self.retrieval.top_k,
            rrf_k: self.retrieval.rrf_k,
            derive_context_k: self.retrieval.derive_context_k,
        }
    }

    /// Run one ingestion pass over the instrument set. Callers schedule
    /// repetition; this never loops.
    pub async fn run_ingestion_cycle(
        &self,
        instruments: &[String],
        market: &str,
        exchange: &str,
    ) -> Result<Vec<FilingPayload>> {
        let market = normalized_market(market);
        if self.provider.market_code() != market {
            bail!(
                "Configured provider {} does not support market {}",
                self.provider.market_code(),
                market
            );
        }

        let stage = IngestionStage::new(self.provider.clone(), self.state_store.clone());
        let mut state = stage.run(instruments).await?;

        for payload in &mut state.filing_payloads {
            if payload.market.is_empty() {
                payload.market = market.clone();
            }
            if payload.exchange.is_empty() {
                payload.exchange = exchange.trim().to_uppercase();
            }
        }

        self.checkpoints
            .save_state("ingestion", "default", &serde_json::to_value(&state)?)
            .await?;

        info!(
            market,
            filings_found = state.filing_payloads.len(),
            errors = state.errors.len(),
            "ingestion cycle complete"
        );
        self.state_store
            .log_event(
                "INGESTION_CYCLE",
                "orchestrator",
                &json!({
                    "market": market,
                    "instruments": instruments,
                    "filings_found": state.filing_payloads.len(),
                    "errors": state.errors,
                })
                .to_string(),
            )
            .await?;

        Ok(state.filing_payloads)
    }

    /// Analyze one filing. Success marks `ANALYZED`; failure marks
    /// `DEAD_LETTER` with a machine-readable reason and the last error.
    pub async fn analyze_filing(&self, payload: FilingPayload) -> Result<Option<AnalysisPayload>> {
        let accession = payload.accession_number.clone();
        let ticker = payload.ticker.clone();
        let filing_url = payload.filing_url.clone();

        let stage = AnalysisStage::new(&self.extraction);
        let state = stage.run(payload).await?;

        self.checkpoints
            .save_state("analysis", &accession, &serde_json::to_value(&state)?)
            .await?;

        match &state.analysis {
            Some(_) => {
                self.state_store
                    .mark_analyzed(&accession, &ticker, &filing_url)
                    .await?;
            }
            None => {
                let reason = state
                    .dead_letter
                    .as_ref()
                    .map(|note| note.reason.clone())
                    .unwrap_or_else(|| "analysis_failed".to_string());
                let last_error = state.errors.last().cloned().unwrap_or_default();
                warn!(accession = %accession, reason = %reason, "analysis dead-lettered");
                self.state_store
                    .mark_dead_letter(&accession, &ticker, &filing_url, &reason, &last_error)
                    .await?;
            }
        }

        Ok(state.analysis)
    }

    /// Index one analysis. Any failure is recorded as
    /// `ANALYZED_NOT_INDEXED` before the error is re-raised, so the filing
    /// is never silently lost from search.
    pub async fn index_analysis(&self, analysis: &AnalysisPayload) -> Result<IndexReceipt> {
        let stage = KnowledgeStage::new(&self.rag);
        let state = match stage.run(Some(analysis.clone())).await {
            Ok(state) => state,
            Err(err) => {
                error!(
                    accession = %analysis.accession_number,
                    error = %err,
                    "knowledge indexing failed"
                );
                self.state_store
                    .mark_analyzed_not_indexed(
                        &analysis.accession_number,
                        &analysis.ticker,
                        "",
                        &err.to_string(),
                    )
                    .await?;
                return Err(err);
            }
        };

        self.checkpoints
            .save_state(
                "knowledge",
                &analysis.accession_number,
                &serde_json::to_value(&state)?,
            )
            .await?;

        state
            .index_receipt
            .context("knowledge stage produced no receipt")
    }

    /// Answer a question over the indexed corpus. Empty questions are a
    /// contract error, rejected before the graph runs.
    pub async fn answer_question(
        &self,
        question: &str,
        ticker: Option<&str>,
    ) -> Result<MarkdownAnswer> {
        if question.trim().is_empty() {
            bail!("Empty question");
        }

        let stage = QueryStage::new(&self.rag, &self.synthesis, self.query_params());
        let state = stage.run(question, ticker).await?;

        self.checkpoints
            .save_state("query", question.trim(), &serde_json::to_value(&state)?)
            .await?;

        Ok(MarkdownAnswer {
            question: state.question,
            answer_markdown: state.answer,
            citations: state.answer_citations,
            confidence: state.answer_confidence,
            derivation_trace: state.derivation_trace,
            generated_at: Utc::now(),
        })
    }

    /// Replay a filing. `auto` resolves to `index` when the filing is
    /// `ANALYZED_NOT_INDEXED` and a prior analysis checkpoint exists,
    /// otherwise to `analysis`. The replay counter is bumped once per
    /// attempt, before the attempt runs.
    pub async fn replay_filing(&self, accession: &str, mode: &str) -> Result<ReplayOutcome> {
        if !matches!(mode, "auto" | "analysis" | "index") {
            bail!("Unknown replay mode: {mode}");
        }
        let filing = self
            .state_store
            .get_filing(accession)
            .await?
            .with_context(|| format!("Filing not found: {accession}"))?;

        let resolved = if mode == "auto" {
            let has_checkpoint = self
                .checkpoints
                .load_state("analysis", accession)
                .await?
                .is_some();
            if filing.status == FilingStatus::AnalyzedNotIndexed.as_str() && has_checkpoint {
                "index"
            } else {
                "analysis"
            }
        } else {
            mode
        };

        self.state_store.mark_replay_attempt(accession).await?;
        info!(accession, mode = resolved, "replaying filing");

        match resolved {
            "index" => self.replay_index(&filing, resolved).await,
            _ => self.replay_analysis(&filing.ticker, accession, resolved).await,
        }
    }

    async fn replay_index(
        &self,
        filing: &crate::models::StoredFiling,
        mode: &str,
    ) -> Result<ReplayOutcome> {
        let accession = filing.accession_number.as_str();
        let state = self
            .checkpoints
            .load_state("analysis", accession)
            .await?
            .with_context(|| format!("No analysis checkpoint for {accession}"))?;
        let analysis: AnalysisPayload = serde_json::from_value(
            state
                .get("analysis")
                .cloned()
                .filter(|value| !value.is_null())
                .with_context(|| format!("Checkpoint for {accession} has no analysis payload"))?,
        )?;

        match self.index_analysis(&analysis).await {
            Ok(_) => {
                self.state_store
                    .mark_analyzed(accession, &filing.ticker, &filing.filing_url)
                    .await?;
                Ok(ReplayOutcome {
                    status: "analyzed".to_string(),
                    mode: mode.to_string(),
                    analyzed: true,
                    indexed: true,
                })
            }
            Err(err) => {
                warn!(accession, error = %err, "replay indexing failed");
                Ok(ReplayOutcome {
                    status: "analyzed_not_indexed".to_string(),
                    mode: mode.to_string(),
                    analyzed: true,
                    indexed: false,
                })
            }
        }
    }

    async fn replay_analysis(
        &self,
        ticker: &str,
        accession: &str,
        mode: &str,
    ) -> Result<ReplayOutcome> {
        let filing = self
            .state_store
            .get_filing(accession)
            .await?
            .with_context(|| format!("Filing not found: {accession}"))?;

        let record = record_from_stored(&filing);
        let mut raw_text = self
            .provider
            .get_document_text(&record)
            .await
            .unwrap_or_default();
        if raw_text.chars().count() <= 1000 {
            let attachments = self
                .provider
                .get_document_attachments(&record)
                .await
                .unwrap_or_default();
            if let Some(exhibit) = self.provider.find_primary_attachment_text(&attachments) {
                if !exhibit.is_empty() && !raw_text.contains(&exhibit) {
                    raw_text = format!("{raw_text}\n\n{exhibit}");
                }
            }
        }

        let payload = FilingPayload {
            ticker: ticker.to_string(),
            accession_number: accession.to_string(),
            filing_url: filing.filing_url.clone(),
            market: filing.market.clone(),
            exchange: filing.exchange.clone(),
            issuer_id: filing.issuer_id.clone(),
            source: filing.source.clone(),
            source_event_id: accession.to_string(),
            raw_text,
            metadata: record.metadata.clone(),
        };

        let Some(analysis) = self.analyze_filing(payload).await? else {
            return Ok(ReplayOutcome {
                status: "dead_letter".to_string(),
                mode: mode.to_string(),
                analyzed: false,
                indexed: false,
            });
        };

        match self.index_analysis(&analysis).await {
            Ok(_) => Ok(ReplayOutcome {
                status: "analyzed".to_string(),
                mode: mode.to_string(),
                analyzed: true,
                indexed: true,
            }),
            Err(err) => {
                warn!(accession, error = %err, "replay indexing failed");
                Ok(ReplayOutcome {
                    status: "analyzed_not_indexed".to_string(),
                    mode: mode.to_string(),
                    analyzed: true,
                    indexed: false,
                })
            }
        }
    }
}

fn normalized_market(market: &str) -> String {
    let trimmed = market.trim().to_uppercase();
    if trimmed.is_empty() {
        "US_SEC".to_string()
    } else {
        trimmed
    }
}

/// Rebuild a provider-facing record from the durable filing row, used when
/// replay must re-fetch text without the original provider record.
fn record_from_stored(filing: &crate::models::StoredFiling) -> FilingRecord {
    let mut record = FilingRecord::new(&filing.ticker, &filing.accession_number, &filing.filing_url);
    record.filing_type = filing.filing_type.clone();
    record.market = filing.market.clone();
    record.exchange = filing.exchange.clone();
    record.issuer_id = filing.issuer_id.clone();
    record.source = filing.source.clone();
    record.document_type = filing.document_type.clone();
    record.currency = filing.currency.clone();
    for (key, value) in [
        ("filing_type", filing.filing_type.clone()),
        ("item_code", filing.item_code.clone()),
        ("filing_date", filing.filing_date.clone()),
        ("market", filing.market.clone()),
        ("exchange", filing.exchange.clone()),
        ("issuer_id", filing.issuer_id.clone()),
        ("source", filing.source.clone()),
        ("document_type", filing.document_type.clone()),
        ("currency", filing.currency.clone()),
    ] {
        if !value.is_empty() {
            record.metadata.insert(key.to_string(), Value::String(value));
        }
    }
    record
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EmbeddingConfig;
    use crate::models::Attachment;
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct StubProvider {
        records: Mutex<Vec<FilingRecord>>,
        document_text: String,
    }

    #[async_trait]
    impl MarketProvider for StubProvider {
        fn market_code(&self) -> &str {
            "US_SEC"
        }

        async fn get_latest_filings(&self, _instruments: &[String]) -> Result<Vec<FilingRecord>> {
            Ok(self.records.lock().unwrap().clone())
        }

        async fn get_recent_filings(
            &self,
            instruments: &[String],
            _per_instrument_limit: usize,
        ) -> Result<Vec<FilingRecord>> {
            self.get_latest_filings(instruments).await
        }

        async fn get_document_text(&self, _record: &FilingRecord) -> Result<String> {
            Ok(self.document_text.clone())
        }

        async fn get_document_attachments(&self, _record: &FilingRecord) -> Result<Vec<Attachment>> {
            Ok(Vec::new())
        }
    }

    /// Adapter whose JSON responses are consumed in order, then `{}`.
    struct SequenceAdapter {
        responses: Mutex<Vec<Value>>,
        calls: AtomicUsize,
    }

    impl SequenceAdapter {
        fn new(responses: Vec<Value>) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses),
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl ModelAdapter for SequenceAdapter {
        async fn generate_json(&self, _prompt: &str) -> Value {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut responses = self.responses.lock().unwrap();
            if responses.is_empty() {
                json!({})
            } else {
                responses.remove(0)
            }
        }

        async fn generate_text(&self, _prompt: &str) -> String {
            "NO".to_string()
        }
    }

    async fn build_orchestrator(
        provider: Arc<dyn MarketProvider>,
        adapter: Arc<dyn ModelAdapter>,
    ) -> Orchestrator {
        let state_pool = crate::db::connect_memory().await.unwrap();
        migrate::migrate_state(&state_pool).await.unwrap();
        let checkpoint_pool = crate::db::connect_memory().await.unwrap();
        migrate::migrate_checkpoints(&checkpoint_pool).await.unwrap();
        let rag_pool = crate::db::connect_memory().await.unwrap();
        migrate::migrate_rag(&rag_pool).await.unwrap();

        Orchestrator::new(
            provider,
            StateStore::new(state_pool),
            CheckpointStore::new(checkpoint_pool),
            RetrievalEngine::new(rag_pool, EmbeddingConfig::default()),
            adapter,
            RetrievalConfig::default(),
        )
    }

    fn stub_provider(records: Vec<FilingRecord>, text: &str) -> Arc<StubProvider> {
        Arc::new(StubProvider {
            records: Mutex::new(records),
            document_text: text.to_string(),
        })
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
            raw_text: "Revenue was $120M.".to_string(),
            metadata: HashMap::new(),
        }
    }

    fn valid_extraction() -> Value {
        json!({"kpis": [{"metric": "Revenue", "value": "120"}], "summary": {"highlights": ["up 20%"]}})
    }

    #[tokio::test]
    async fn test_market_mismatch_is_rejected() {
        let provider = stub_provider(Vec::new(), "");
        let orchestrator = build_orchestrator(provider, SequenceAdapter::new(Vec::new())).await;
        let result = orchestrator
            .run_ingestion_cycle(&["TCS".to_string()], "IN_NSE", "NSE")
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_ingestion_checkpoints_final_state() {
        let mut record = FilingRecord::new("AAPL", "A1", "https://x/A1.htm");
        record.filing_type = "8-K".to_string();
        let provider = stub_provider(vec![record], &"x".repeat(1500));
        let orchestrator = build_orchestrator(provider, SequenceAdapter::new(Vec::new())).await;

        let payloads = orchestrator
            .run_ingestion_cycle(&["AAPL".to_string()], "US_SEC", "SEC")
            .await
            .unwrap();
        assert_eq!(payloads.len(), 1);

        let checkpoint = orchestrator
            .checkpoints()
            .load_state("ingestion", "default")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(checkpoint["filing_payloads"].as_array().unwrap().len(), 1);
        assert!(checkpoint["trace"]
            .as_array()
            .unwrap()
            .iter()
            .any(|step| step == "poll_providers"));
    }

    #[tokio::test]
    async fn test_analyze_success_marks_analyzed() {
        let provider = stub_provider(Vec::new(), "");
        let adapter = SequenceAdapter::new(vec![valid_extraction()]);
        let orchestrator = build_orchestrator(provider, adapter).await;

        let analysis = orchestrator.analyze_filing(payload("A1")).await.unwrap();
        assert!(analysis.is_some());

        let filing = orchestrator
            .state_store()
            .get_filing("A1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(filing.status, "ANALYZED");

        let checkpoint = orchestrator
            .checkpoints()
            .load_state("analysis", "A1")
            .await
            .unwrap();
        assert!(checkpoint.is_some());
    }

    #[tokio::test]
    async fn test_analyze_failure_dead_letters_with_reason() {
        let provider = stub_provider(Vec::new(), "");
        let adapter = SequenceAdapter::new(vec![json!({}), json!({})]);
        let orchestrator = build_orchestrator(provider, adapter).await;

        let analysis = orchestrator.analyze_filing(payload("A2")).await.unwrap();
        assert!(analysis.is_none());

        let filing = orchestrator
            .state_store()
            .get_filing("A2")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(filing.status, "DEAD_LETTER");
        assert_eq!(filing.dead_letter_reason, "validation_failed_after_reflection");
        assert_eq!(filing.last_error, "analysis_validation_failed");
    }

    #[tokio::test]
    async fn test_index_failure_marks_analyzed_not_indexed_and_reraises() {
        let provider = stub_provider(Vec::new(), "");
        let adapter = SequenceAdapter::new(vec![valid_extraction()]);
        let orchestrator = build_orchestrator(provider, adapter).await;

        let analysis = orchestrator
            .analyze_filing(payload("A3"))
            .await
            .unwrap()
            .unwrap();

        // Break the chunk store so indexing fails.
        sqlx::query("DROP TABLE chunks")
            .execute(orchestrator.rag().pool())
            .await
            .unwrap();

        let result = orchestrator.index_analysis(&analysis).await;
        assert!(result.is_err());

        let filing = orchestrator
            .state_store()
            .get_filing("A3")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(filing.status, "ANALYZED_NOT_INDEXED");
        assert!(!filing.last_error.is_empty());
    }

    #[tokio::test]
    async fn test_answer_question_rejects_blank() {
        let provider = stub_provider(Vec::new(), "");
        let orchestrator = build_orchestrator(provider, SequenceAdapter::new(Vec::new())).await;
        assert!(orchestrator.answer_question("   ", None).await.is_err());
    }

    #[tokio::test]
    async fn test_full_chain_then_answer() {
        let provider = stub_provider(Vec::new(), "");
        let adapter = SequenceAdapter::new(vec![valid_extraction(), json!({})]);
        let orchestrator = build_orchestrator(provider, adapter).await;

        let analysis = orchestrator
            .analyze_filing(payload("A4"))
            .await
            .unwrap()
            .unwrap();
        let receipt = orchestrator.index_analysis(&analysis).await.unwrap();
        assert_eq!(receipt.chunk_count, 2);

        let answer = orchestrator
            .answer_question("What is revenue?", None)
            .await
            .unwrap();
        assert!(answer.citations.iter().any(|c| c == "A4:kpi"));
        assert!(answer.confidence > 0.0);
    }

    #[tokio::test]
    async fn test_replay_rejects_unknown_mode_and_missing_filing() {
        let provider = stub_provider(Vec::new(), "");
        let orchestrator = build_orchestrator(provider, SequenceAdapter::new(Vec::new())).await;
        assert!(orchestrator.replay_filing("A1", "bogus").await.is_err());
        assert!(orchestrator.replay_filing("missing", "auto").await.is_err());
    }

    #[tokio::test]
    async fn test_dead_letter_replay_auto_recovers() {
        let provider = stub_provider(Vec::new(), "Revenue was $120M.");
        // First two extractions fail (initial + reflection), the replay
        // extraction succeeds.
        let adapter = SequenceAdapter::new(vec![json!({}), json!({}), valid_extraction()]);
        let orchestrator = build_orchestrator(provider, adapter).await;

        assert!(orchestrator.analyze_filing(payload("A5")).await.unwrap().is_none());
        let before = orchestrator
            .state_store()
            .get_filing("A5")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(before.status, "DEAD_LETTER");
        assert_eq!(before.replay_count, 0);

        let outcome = orchestrator.replay_filing("A5", "auto").await.unwrap();
        assert_eq!(outcome.mode, "analysis");
        assert_eq!(outcome.status, "analyzed");
        assert!(outcome.analyzed);
        assert!(outcome.indexed);

        let after = orchestrator
            .state_store()
            .get_filing("A5")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(after.status, "ANALYZED");
        assert_eq!(after.replay_count, 1);
    }

    #[tokio::test]
    async fn test_replay_that_fails_again_reports_dead_letter_status() {
        let provider = stub_provider(Vec::new(), "Revenue was $120M.");
        let adapter = SequenceAdapter::new(Vec::new());
        let orchestrator = build_orchestrator(provider, adapter).await;

        orchestrator.analyze_filing(payload("A6")).await.unwrap();
        let outcome = orchestrator.replay_filing("A6", "analysis").await.unwrap();
        assert_eq!(outcome.status, "dead_letter");
        assert!(!outcome.analyzed);

        let filing = orchestrator
            .state_store()
            .get_filing("A6")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(filing.replay_count, 1);
    }

    #[tokio::test]
    async fn test_auto_resolves_to_index_with_checkpoint() {
        let provider = stub_provider(Vec::new(), "");
        let adapter = SequenceAdapter::new(vec![valid_extraction()]);
        let orchestrator = build_orchestrator(provider, adapter).await;

        let analysis = orchestrator
            .analyze_filing(payload("A7"))
            .await
            .unwrap()
            .unwrap();

        // Simulate an indexing failure after analysis succeeded.
        orchestrator
            .state_store()
            .mark_analyzed_not_indexed("A7", "AAPL", "https://x/A7.htm", "disk full")
            .await
            .unwrap();
        drop(analysis);

        let outcome = orchestrator.replay_filing("A7", "auto").await.unwrap();
        assert_eq!(outcome.mode, "index");
        assert_eq!(outcome.status, "analyzed");
        assert!(outcome.indexed);

        let filing = orchestrator
            .state_store()
            .get_filing("A7")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(filing.status, "ANALYZED");
        assert_eq!(filing.replay_count, 1);

        // The replayed chunks are searchable.
        let hits = orchestrator
            .rag()
            .keyword_search("revenue", 8, None)
            .await
            .unwrap();
        assert!(hits.iter().any(|hit| hit.chunk_id == "A7-kpi-0"));
    }
}
