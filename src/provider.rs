//! Market provider contracts and the per-market factory.
//!
//! Every market (US SEC, NSE, BSE, the simulated SEA feed) implements
//! [`MarketProvider`]; the rest of the pipeline only ever sees normalized
//! [`FilingRecord`]s with UTC ISO-8601 timestamps in their metadata.
//! Identifier quirks and timestamp zoo are handled here, never downstream.

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

use crate::config::ProviderConfig;
use crate::models::{Attachment, FilingRecord};
use crate::provider_edgar::EdgarProvider;
use crate::provider_india::IndiaProvider;
use crate::provider_sea::SeaProvider;

pub const SUPPORTED_MARKETS: &[&str] = &["US_SEC", "IN_NSE", "IN_BSE", "SEA_LOCAL"];

/// Resolved instrument identity for a ticker within one market.
#[derive(Debug, Clone, Default)]
pub struct Instrument {
    pub ticker: String,
    pub issuer_id: String,
    pub exchange: String,
}

/// Canonical provider interface across markets.
///
/// A provider failure for one instrument must not abort polling for the
/// others: implementations log per-instrument errors and return the
/// records they could fetch.
#[async_trait]
pub trait MarketProvider: Send + Sync {
    fn market_code(&self) -> &str;

    /// The single most recent qualifying filing per instrument.
    async fn get_latest_filings(&self, instruments: &[String]) -> Result<Vec<FilingRecord>>;

    /// Up to `per_instrument_limit` recent qualifying filings per instrument.
    async fn get_recent_filings(
        &self,
        instruments: &[String],
        per_instrument_limit: usize,
    ) -> Result<Vec<FilingRecord>>;

    /// Cleaned text of the primary document.
    async fn get_document_text(&self, record: &FilingRecord) -> Result<String>;

    /// Attachments listed alongside the filing, cleaned to text.
    async fn get_document_attachments(&self, _record: &FilingRecord) -> Result<Vec<Attachment>> {
        Ok(Vec::new())
    }

    /// Best-matching primary attachment (press release / Exhibit 99.1).
    fn find_primary_attachment_text(&self, attachments: &[Attachment]) -> Option<String> {
        find_exhibit_text(attachments)
    }

    async fn resolve_instrument(&self, ticker: &str) -> Result<Instrument> {
        Ok(Instrument {
            ticker: ticker.trim().to_uppercase(),
            issuer_id: String::new(),
            exchange: String::new(),
        })
    }
}

/// Build the provider for a market code.
pub fn create_market_provider(
    market: &str,
    config: &ProviderConfig,
) -> Result<Arc<dyn MarketProvider>> {
    let normalized = market.trim().to_uppercase();
    let normalized = if normalized.is_empty() {
        "US_SEC".to_string()
    } else {
        normalized
    };
    match normalized.as_str() {
        "US_SEC" => Ok(Arc::new(EdgarProvider::new(config))),
        "IN_NSE" => Ok(Arc::new(IndiaProvider::nse(config))),
        "IN_BSE" => Ok(Arc::new(IndiaProvider::bse(config))),
        "SEA_LOCAL" => Ok(Arc::new(SeaProvider::new())),
        other => bail!("Unsupported market: {}", other),
    }
}

/// Pick the exhibit most likely to carry the press-release body.
///
/// Prioritizes attachments whose name/description mention `99.1`, `ex-99`,
/// or `press release`; among those, the first with non-empty text wins.
pub fn find_exhibit_text(attachments: &[Attachment]) -> Option<String> {
    let prioritized = attachments.iter().filter(|attachment| {
        let signature = format!(
            "{} {}",
            attachment.name.to_lowercase(),
            attachment.description.to_lowercase()
        );
        signature.contains("99.1") || signature.contains("ex-99") || signature.contains("press release")
    });

    for attachment in prioritized {
        if !attachment.text.trim().is_empty() {
            return Some(attachment.text.clone());
        }
    }
    None
}

/// Stamp provider-level identity fields into the record and its metadata,
/// filling gaps with the given defaults.
pub fn normalize_record(record: &mut FilingRecord, market: &str, exchange: &str, source: &str) {
    if record.market.is_empty() {
        record.market = non_empty(record.meta_str("market"), market);
    }
    if record.exchange.is_empty() {
        record.exchange = non_empty(record.meta_str("exchange"), exchange);
    }
    if record.source.is_empty() {
        record.source = non_empty(record.meta_str("source"), source);
    }
    if record.source_event_id.is_empty() {
        let fallback = record.accession_number.clone();
        record.source_event_id = non_empty(record.meta_str("source_event_id"), &fallback);
    }
    if record.issuer_id.is_empty() {
        record.issuer_id = non_empty(record.meta_str("issuer_id"), &record.meta_str("cik"));
    }
    if record.document_type.is_empty() {
        let fallback = record.filing_type.clone();
        record.document_type = non_empty(record.meta_str("document_type"), &fallback);
    }

    for (key, value) in [
        ("market", record.market.clone()),
        ("exchange", record.exchange.clone()),
        ("source", record.source.clone()),
        ("source_event_id", record.source_event_id.clone()),
        ("issuer_id", record.issuer_id.clone()),
        ("document_type", record.document_type.clone()),
        ("currency", record.currency.clone()),
    ] {
        record.metadata.insert(key.to_string(), Value::String(value));
    }
}

fn non_empty(primary: String, fallback: &str) -> String {
    if primary.is_empty() {
        fallback.to_string()
    } else {
        primary
    }
}

/// Strip markup from a fetched document, leaving readable text.
///
/// Plain text passes through untouched. For HTML: tags are dropped,
/// `script`/`style` bodies are skipped, common entities decoded, and runs
/// of three or more newlines collapsed.
pub fn html_to_text(raw: &str) -> String {
    // ASCII-only lowering keeps byte offsets aligned with `raw`.
    let lower: String = raw.chars().map(|c| c.to_ascii_lowercase()).collect();
    if !lower.contains("<html") && !lower.contains("<body") {
        return raw.to_string();
    }

    let mut text = String::with_capacity(raw.len() / 2);
    let mut pos = 0usize;

    while pos < raw.len() {
        let Some(offset) = lower[pos..].find('<') else {
            text.push_str(&raw[pos..]);
            break;
        };
        text.push_str(&raw[pos..pos + offset]);
        let tag_start = pos + offset;
        let rest = &lower[tag_start..];

        if rest.starts_with("<script") || rest.starts_with("<style") {
            let closing = if rest.starts_with("<script") {
                "</script"
            } else {
                "</style"
            };
            let Some(close_offset) = rest.find(closing) else {
                break;
            };
            let after_close = tag_start + close_offset;
            let Some(gt) = lower[after_close..].find('>') else {
                break;
            };
            pos = after_close + gt + 1;
            continue;
        }

        let Some(gt) = rest.find('>') else {
            break;
        };
        let tag_body = &lower[tag_start + 1..tag_start + gt];
        let tag_name: String = tag_body
            .trim_start_matches('/')
            .chars()
            .take_while(|c| c.is_ascii_alphanumeric())
            .collect();
        // Block-level boundaries become newlines.
        if matches!(
            tag_name.as_str(),
            "p" | "div" | "br" | "tr" | "table" | "li" | "h1" | "h2" | "h3" | "h4"
        ) {
            text.push('\n');
        }
        pos = tag_start + gt + 1;
    }

    let decoded = text
        .replace("&nbsp;", " ")
        .replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'");

    collapse_blank_lines(&decoded)
}

fn collapse_blank_lines(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut blank_run = 0usize;
    for line in text.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            blank_run += 1;
            if blank_run > 1 {
                continue;
            }
            out.push('\n');
        } else {
            blank_run = 0;
            out.push_str(trimmed);
            out.push('\n');
        }
    }
    out.trim().to_string()
}
