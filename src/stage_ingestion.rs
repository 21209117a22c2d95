//! Ingestion stage state machine.
//!
//! `PollProviders → DedupeCheck → FetchPrimaryText → {FetchExhibits →
//! MergeText} → EmitPayload → (loop | End)`. Short primary documents
//! (≤ 1000 characters, cover-page only) trigger the exhibit fallback; a
//! missing current filing at any node is a no-op, not an error. The final
//! state is checkpointed by the orchestrator.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::warn;

use crate::models::{FilingPayload, FilingRecord};
use crate::provider::MarketProvider;
use crate::state_store::{IngestedMeta, StateStore};

/// Primary text at or below this length is treated as cover-page only.
const COVER_PAGE_MAX_CHARS: usize = 1000;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedFiling {
    pub record: FilingRecord,
    #[serde(default)]
    pub raw_text: String,
    #[serde(default)]
    pub exhibit_text: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IngestionState {
    pub filings_queue: Vec<QueuedFiling>,
    pub current_filing: Option<QueuedFiling>,
    pub filing_payloads: Vec<FilingPayload>,
    pub trace: Vec<String>,
    pub errors: Vec<String>,
}

enum ExhibitRoute {
    FetchExhibits,
    EmitPayload,
    NoPayload,
}

enum LoopRoute {
    Continue,
    End,
}

pub struct IngestionStage {
    provider: Arc<dyn MarketProvider>,
    state_store: StateStore,
}

impl IngestionStage {
    pub fn new(provider: Arc<dyn MarketProvider>, state_store: StateStore) -> Self {
        Self {
            provider,
            state_store,
        }
    }

    pub async fn run(&self, instruments: &[String]) -> Result<IngestionState> {
        let mut state = IngestionState::default();

        self.poll_providers(&mut state, instruments).await?;
        self.dedupe_check(&mut state);

        loop {
            self.fetch_primary_text(&mut state).await;
            match self.route_exhibit_logic(&state) {
                ExhibitRoute::NoPayload => break,
                ExhibitRoute::FetchExhibits => {
                    self.fetch_exhibits(&mut state).await;
                    self.merge_text(&mut state);
                    self.emit_payload(&mut state).await?;
                }
                ExhibitRoute::EmitPayload => {
                    self.emit_payload(&mut state).await?;
                }
            }
            match self.route_continue_or_end(&state) {
                LoopRoute::Continue => continue,
                LoopRoute::End => break,
            }
        }

        Ok(state)
    }

    async fn poll_providers(&self, state: &mut IngestionState, instruments: &[String]) -> Result<()> {
        match self.provider.get_latest_filings(instruments).await {
            Ok(records) => {
                let mut queued_ids = std::collections::HashSet::new();
                for record in records {
                    if !queued_ids.insert(record.accession_number.clone()) {
                        continue;
                    }
                    if self.state_store.has_accession(&record.accession_number).await? {
                        continue;
                    }
                    state.filings_queue.push(QueuedFiling {
                        record,
                        raw_text: String::new(),
                        exhibit_text: String::new(),
                    });
                }
            }
            Err(err) => {
                warn!(error = %err, "provider poll failed");
                state.errors.push(format!("poll_failed: {err}"));
            }
        }
        state.trace.push("poll_providers".to_string());
        Ok(())
    }

    fn dedupe_check(&self, state: &mut IngestionState) {
        // Dedupe is applied while polling; this step records the transition.
        state.trace.push("dedupe_check".to_string());
    }

    async fn fetch_primary_text(&self, state: &mut IngestionState) {
        let Some(queued) = state.filings_queue.first().cloned() else {
            state.current_filing = None;
            state.trace.push("fetch_primary_text_empty".to_string());
            return;
        };

        let mut current = queued;
        match self.provider.get_document_text(&current.record).await {
            Ok(text) => current.raw_text = text,
            Err(err) => {
                warn!(
                    accession = %current.record.accession_number,
                    error = %err,
                    "primary document fetch failed"
                );
                state
                    .errors
                    .push(format!("fetch_failed:{}: {err}", current.record.accession_number));
                current.raw_text = String::new();
            }
        }
        state.current_filing = Some(current);
        state.trace.push("fetch_primary_text".to_string());
    }

    fn route_exhibit_logic(&self, state: &IngestionState) -> ExhibitRoute {
        let Some(current) = &state.current_filing else {
            return ExhibitRoute::NoPayload;
        };
        if current.raw_text.chars().count() <= COVER_PAGE_MAX_CHARS {
            ExhibitRoute::FetchExhibits
        } else {
            ExhibitRoute::EmitPayload
        }
    }

    async fn fetch_exhibits(&self, state: &mut IngestionState) {
        let Some(current) = state.current_filing.as_mut() else {
            state.trace.push("fetch_exhibits_empty".to_string());
            return;
        };

        let attachments = match self.provider.get_document_attachments(&current.record).await {
            Ok(attachments) => attachments,
            Err(err) => {
                warn!(
                    accession = %current.record.accession_number,
                    error = %err,
                    "attachment fetch failed"
                );
                Vec::new()
            }
        };
        current.exhibit_text = self
            .provider
            .find_primary_attachment_text(&attachments)
            .unwrap_or_default();
        state.trace.push("fetch_exhibits".to_string());
    }

    fn merge_text(&self, state: &mut IngestionState) {
        if let Some(current) = state.current_filing.as_mut() {
            let exhibit = current.exhibit_text.clone();
            if !exhibit.is_empty() && !current.raw_text.contains(&exhibit) {
                current.raw_text = format!("{}\n\n{}", current.raw_text, exhibit);
            }
        }
        state.trace.push("merge_text".to_string());
    }

    async fn emit_payload(&self, state: &mut IngestionState) -> Result<()> {
        let Some(current) = state.current_filing.take() else {
            state.trace.push("emit_payload_skipped".to_string());
            return Ok(());
        };

        let record = &current.record;
        let payload = FilingPayload {
            ticker: record.ticker.clone(),
            accession_number: record.accession_number.clone(),
            filing_url: record.filing_url.clone(),
            market: record.market.clone(),
            exchange: record.exchange.clone(),
            issuer_id: record.issuer_id.clone(),
            source: record.source.clone(),
            source_event_id: record.source_event_id.clone(),
            raw_text: current.raw_text.clone(),
            metadata: record.metadata.clone(),
        };

        let meta = IngestedMeta {
            filing_type: first_non_empty(&[
                record.filing_type.clone(),
                record.meta_str("filing_type"),
                record.meta_str("form"),
            ]),
            item_code: item_code_from_metadata(record),
            filing_date: record.meta_str("filing_date"),
            market: record.market.clone(),
            exchange: record.exchange.clone(),
            issuer_id: record.issuer_id.clone(),
            source: record.source.clone(),
            document_type: first_non_empty(&[
                record.document_type.clone(),
                record.meta_str("filing_type"),
                record.meta_str("form"),
            ]),
            currency: record.currency.clone(),
        };
        self.state_store
            .mark_ingested(&payload.accession_number, &payload.ticker, &payload.filing_url, &meta)
            .await?;

        state.filing_payloads.push(payload);
        if !state.filings_queue.is_empty() {
            state.filings_queue.remove(0);
        }
        state.trace.push("emit_payload".to_string());
        Ok(())
    }

    fn route_continue_or_end(&self, state: &IngestionState) -> LoopRoute {
        if state.filings_queue.is_empty() {
            LoopRoute::End
        } else {
            LoopRoute::Continue
        }
    }
}

fn first_non_empty(values: &[String]) -> String {
    values
        .iter()
        .find(|value| !value.is_empty())
        .cloned()
        .unwrap_or_default()
}

/// `item_code` may arrive as a string or a list under `item_code`/`items`.
fn item_code_from_metadata(record: &FilingRecord) -> String {
    for key in ["item_code", "items"] {
        match record.metadata.get(key) {
            Some(Value::Array(items)) => {
                let joined = items
                    .iter()
                    .map(|item| match item {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    })
                    .collect::<Vec<_>>()
                    .join(",");
                if !joined.is_empty() {
                    return joined;
                }
            }
            Some(Value::String(s)) if !s.is_empty() => return s.clone(),
            _ => {}
        }
    }
    String::new()
}
