//! Historical backfill: pull recent filings per instrument and push each
//! through the Analyze→Index chain.
//!
//! Shares the orchestrator's status mapping — a filing that fails analysis
//! dead-letters without aborting the batch, and an indexing failure is
//! recorded but does not stop the remaining filings.

use anyhow::{bail, Result};
use serde::Serialize;
use serde_json::json;
use tracing::{info, warn};

use crate::models::FilingPayload;
use crate::notify::create_filing_notifications;
use crate::orchestrator::Orchestrator;
use crate::state_store::IngestedMeta;

#[derive(Debug, Clone)]
pub struct BackfillRequest {
    pub tickers: Vec<String>,
    pub market: String,
    pub exchange: String,
    pub per_instrument_limit: usize,
    pub include_existing: bool,
    pub notify: bool,
    pub org_id: String,
}

impl Default for BackfillRequest {
    fn default() -> Self {
        Self {
            tickers: Vec::new(),
            market: "US_SEC".to_string(),
            exchange: String::new(),
            per_instrument_limit: 8,
            include_existing: false,
            notify: false,
            org_id: "default".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BackfillReport {
    pub tickers: Vec<String>,
    pub market: String,
    pub exchange: String,
    pub records_found: usize,
    pub filings_processed: usize,
    pub analyzed: usize,
    pub indexed: usize,
}

pub async fn run_backfill(
    orchestrator: &Orchestrator,
    request: &BackfillRequest,
) -> Result<BackfillReport> {
    let tickers: Vec<String> = request
        .tickers
        .iter()
        .map(|t| t.trim().to_uppercase())
        .filter(|t| !t.is_empty())
        .collect();
    let market = request.market.trim().to_uppercase();
    let exchange = request.exchange.trim().to_uppercase();

    let provider = orchestrator.provider();
    if provider.market_code() != market {
        bail!(
            "Configured provider {} does not support market {}",
            provider.market_code(),
            market
        );
    }

    let state_store = orchestrator.state_store();
    state_store
        .log_event(
            "BACKFILL_STARTED",
            "backfill",
            &json!({
                "org_id": request.org_id,
                "tickers": tickers,
                "per_instrument_limit": request.per_instrument_limit,
            })
            .to_string(),
        )
        .await?;

    let records = provider
        .get_recent_filings(&tickers, request.per_instrument_limit)
        .await?;
    let records_found = records.len();

    let mut payloads: Vec<FilingPayload> = Vec::new();
    for record in records {
        if !request.include_existing
            && state_store.has_accession(&record.accession_number).await?
        {
            continue;
        }

        let mut raw_text = provider.get_document_text(&record).await.unwrap_or_default();
        if raw_text.chars().count() <= 1000 {
            let attachments = provider
                .get_document_attachments(&record)
                .await
                .unwrap_or_default();
            if let Some(exhibit) = provider.find_primary_attachment_text(&attachments) {
                if !exhibit.is_empty() && !raw_text.contains(&exhibit) {
                    raw_text = format!("{raw_text}\n\n{exhibit}");
                }
            }
        }

        let payload = FilingPayload {
            ticker: record.ticker.clone(),
            accession_number: record.accession_number.clone(),
            filing_url: record.filing_url.clone(),
            market: if record.market.is_empty() {
                market.clone()
            } else {
                record.market.clone()
            },
            exchange: if record.exchange.is_empty() {
                exchange.clone()
            } else {
                record.exchange.clone()
            },
            issuer_id: record.issuer_id.clone(),
            source: record.source.clone(),
            source_event_id: if record.source_event_id.is_empty() {
                record.accession_number.clone()
            } else {
                record.source_event_id.clone()
            },
            raw_text,
            metadata: record.metadata.clone(),
        };

        let meta = IngestedMeta {
            filing_type: if record.filing_type.is_empty() {
                record.meta_str("filing_type")
            } else {
                record.filing_type.clone()
            },
            item_code: record.meta_str("item_code"),
            filing_date: record.meta_str("filing_date"),
            market: payload.market.clone(),
            exchange: payload.exchange.clone(),
            issuer_id: payload.issuer_id.clone(),
            source: payload.source.clone(),
            document_type: record.document_type.clone(),
            currency: record.currency.clone(),
        };
        state_store
            .mark_ingested(&payload.accession_number, &payload.ticker, &payload.filing_url, &meta)
            .await?;
        payloads.push(payload);
    }

    if request.notify && !payloads.is_empty() {
        create_filing_notifications(state_store, &payloads, &request.org_id).await?;
    }

    let mut analyzed = 0usize;
    let mut indexed = 0usize;
    for payload in &payloads {
        let accession = payload.accession_number.clone();
        match orchestrator.analyze_filing(payload.clone()).await? {
            Some(analysis) => {
                analyzed += 1;
                match orchestrator.index_analysis(&analysis).await {
                    Ok(_) => indexed += 1,
                    Err(err) => {
                        warn!(accession = %accession, error = %err, "backfill indexing failed");
                    }
                }
            }
            None => {
                warn!(accession = %accession, "backfill analysis dead-lettered");
            }
        }
    }

    let report = BackfillReport {
        tickers,
        market,
        exchange,
        records_found,
        filings_processed: payloads.len(),
        analyzed,
        indexed,
    };
    info!(
        filings = report.filings_processed,
        analyzed = report.analyzed,
        indexed = report.indexed,
        "backfill complete"
    );
    state_store
        .log_event(
            "BACKFILL_COMPLETED",
            "backfill",
            &serde_json::to_string(&report)?,
        )
        .await?;

    Ok(report)
}
