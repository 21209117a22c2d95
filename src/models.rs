//! Core data models shared by the pipeline stages and stores.
//!
//! These types represent filings as they move through the system: a
//! provider-reported [`FilingRecord`], a fetched [`FilingPayload`], the
//! extracted [`AnalysisPayload`], the retrievable [`Chunk`]s derived from
//! it, and the final [`MarkdownAnswer`]. All of them are plain serializable
//! data so stage snapshots can be checkpointed as JSON.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A provider-reported filing or disclosure event, before any fetch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilingRecord {
    pub ticker: String,
    pub accession_number: String,
    pub filing_url: String,
    #[serde(default)]
    pub filing_type: String,
    #[serde(default)]
    pub market: String,
    #[serde(default)]
    pub exchange: String,
    #[serde(default)]
    pub issuer_id: String,
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub source_event_id: String,
    #[serde(default)]
    pub document_type: String,
    #[serde(default)]
    pub currency: String,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

impl FilingRecord {
    pub fn new(ticker: &str, accession_number: &str, filing_url: &str) -> Self {
        Self {
            ticker: ticker.to_string(),
            accession_number: accession_number.to_string(),
            filing_url: filing_url.to_string(),
            filing_type: String::new(),
            market: String::new(),
            exchange: String::new(),
            issuer_id: String::new(),
            source: String::new(),
            source_event_id: String::new(),
            document_type: String::new(),
            currency: String::new(),
            metadata: HashMap::new(),
        }
    }

    /// Pull a metadata value out as a string, empty when absent.
    pub fn meta_str(&self, key: &str) -> String {
        match self.metadata.get(key) {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Null) | None => String::new(),
            Some(other) => other.to_string().trim_matches('"').to_string(),
        }
    }
}

/// A document attachment listed alongside a filing (exhibits, press releases).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attachment {
    pub name: String,
    pub description: String,
    pub text: String,
}

/// A fetched, dedupe-checked filing ready for analysis.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilingPayload {
    pub ticker: String,
    pub accession_number: String,
    pub filing_url: String,
    #[serde(default)]
    pub market: String,
    #[serde(default)]
    pub exchange: String,
    #[serde(default)]
    pub issuer_id: String,
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub source_event_id: String,
    pub raw_text: String,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

/// One extracted KPI. `extra` keeps any additional fields the extractor
/// produced (period, unit, `raw_metric` after alias normalization).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Kpi {
    pub metric: String,
    pub value: String,
    #[serde(flatten, default)]
    pub extra: HashMap<String, String>,
}

/// Structured facts extracted from one filing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisPayload {
    pub ticker: String,
    pub accession_number: String,
    #[serde(default)]
    pub kpis: Vec<Kpi>,
    #[serde(default)]
    pub summary: HashMap<String, Vec<String>>,
    #[serde(default)]
    pub guidance: Vec<HashMap<String, String>>,
}

/// A retrievable text unit derived from an [`AnalysisPayload`].
///
/// Chunk ids are deterministic (`{accession}-kpi-{index}`,
/// `{accession}-summary`) so re-indexing the same analysis upserts
/// instead of appending.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    pub id: String,
    pub text: String,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

/// A scored retrieval hit. The score scale depends on the channel that
/// produced it (cosine, BM25, RRF); callers must not compare scores across
/// channels without fusing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResult {
    pub chunk_id: String,
    pub text: String,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    pub score: f64,
}

/// Receipt returned by the knowledge stage after indexing one analysis.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexReceipt {
    pub accession_number: String,
    pub chunk_count: usize,
    pub indexed_at: DateTime<Utc>,
}

/// Final synthesized answer with citations and a confidence estimate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarkdownAnswer {
    pub question: String,
    pub answer_markdown: String,
    #[serde(default)]
    pub citations: Vec<String>,
    #[serde(default)]
    pub confidence: f64,
    #[serde(default)]
    pub derivation_trace: Vec<String>,
    pub generated_at: DateTime<Utc>,
}

/// Durable processing status of one filing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FilingStatus {
    Ingested,
    Analyzed,
    AnalyzedNotIndexed,
    DeadLetter,
}

impl FilingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FilingStatus::Ingested => "INGESTED",
            FilingStatus::Analyzed => "ANALYZED",
            FilingStatus::AnalyzedNotIndexed => "ANALYZED_NOT_INDEXED",
            FilingStatus::DeadLetter => "DEAD_LETTER",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "INGESTED" => Some(FilingStatus::Ingested),
            "ANALYZED" => Some(FilingStatus::Analyzed),
            "ANALYZED_NOT_INDEXED" => Some(FilingStatus::AnalyzedNotIndexed),
            "DEAD_LETTER" => Some(FilingStatus::DeadLetter),
            _ => None,
        }
    }
}

impl std::fmt::Display for FilingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A filing row as persisted in the state store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredFiling {
    pub accession_number: String,
    pub ticker: String,
    pub filing_url: String,
    pub status: String,
    pub filing_type: String,
    pub item_code: String,
    pub filing_date: String,
    pub market: String,
    pub exchange: String,
    pub issuer_id: String,
    pub source: String,
    pub document_type: String,
    pub currency: String,
    pub dead_letter_reason: String,
    pub last_error: String,
    pub replay_count: i64,
    pub last_replay_at: String,
    pub updated_at: String,
}

/// A watchlist notification row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub id: i64,
    pub org_id: String,
    pub user_id: String,
    pub ticker: String,
    pub accession_number: String,
    pub notification_type: String,
    pub title: String,
    pub body: String,
    pub is_read: bool,
    pub created_at: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip() {
        for status in [
            FilingStatus::Ingested,
            FilingStatus::Analyzed,
            FilingStatus::AnalyzedNotIndexed,
            FilingStatus::DeadLetter,
        ] {
            assert_eq!(FilingStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(FilingStatus::parse("UNKNOWN"), None);
    }

    #[test]
    fn test_meta_str_handles_non_strings() {
        let mut record = FilingRecord::new("AAPL", "0001-23-000001", "https://example.com/f.htm");
        record
            .metadata
            .insert("filing_date".to_string(), Value::String("2023-08-01".into()));
        record.metadata.insert("items".to_string(), Value::from(2.02));
        assert_eq!(record.meta_str("filing_date"), "2023-08-01");
        assert_eq!(record.meta_str("items"), "2.02");
        assert_eq!(record.meta_str("missing"), "");
    }

    #[test]
    fn test_kpi_extra_round_trips_through_json() {
        let kpi = Kpi {
            metric: "Revenue".to_string(),
            value: "120".to_string(),
            extra: HashMap::from([("raw_metric".to_string(), "Net Sales".to_string())]),
        };
        let encoded = serde_json::to_value(&kpi).unwrap();
        assert_eq!(encoded["raw_metric"], "Net Sales");
        let decoded: Kpi = serde_json::from_value(encoded).unwrap();
        assert_eq!(decoded.extra.get("raw_metric").unwrap(), "Net Sales");
    }
}
