//! NSE and BSE announcement providers.
//!
//! Both exchanges publish corporate announcements as JSON feeds with
//! loosely structured rows; identifiers and timestamps vary per feed, so
//! everything is normalized here: event ids become stable
//! `{source}:{symbol}:{id-or-timestamp}` strings and all timestamps are
//! converted from IST to UTC ISO-8601 before a record leaves the provider.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde_json::Value;
use std::time::Duration;
use tracing::warn;

use crate::config::ProviderConfig;
use crate::models::FilingRecord;
use crate::provider::{html_to_text, Instrument, MarketProvider};

/// India Standard Time, UTC+05:30.
fn ist() -> FixedOffset {
    FixedOffset::east_opt(5 * 3600 + 30 * 60).expect("fixed IST offset is valid")
}

/// Normalize a feed timestamp to UTC ISO-8601 (`...Z`), empty on failure.
/// Naive timestamps are interpreted as IST.
pub fn to_utc_iso(value: &str) -> String {
    let text = value.trim();
    if text.is_empty() {
        return String::new();
    }

    // ISO first, including a trailing Z.
    let candidate = text.replace('Z', "+00:00");
    if let Ok(parsed) = DateTime::parse_from_rfc3339(&candidate) {
        return parsed
            .with_timezone(&Utc)
            .to_rfc3339_opts(chrono::SecondsFormat::Secs, true);
    }

    const DATETIME_FORMATS: &[&str] = &[
        "%d-%b-%Y %H:%M:%S",
        "%d-%b-%Y %H:%M",
        "%d-%m-%Y %H:%M:%S",
        "%d-%m-%Y %H:%M",
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%d %H:%M",
    ];
    for format in DATETIME_FORMATS {
        if let Ok(parsed) = NaiveDateTime::parse_from_str(text, format) {
            if let Some(localized) = ist().from_local_datetime(&parsed).single() {
                return localized
                    .with_timezone(&Utc)
                    .to_rfc3339_opts(chrono::SecondsFormat::Secs, true);
            }
        }
    }

    const DATE_FORMATS: &[&str] = &["%d-%b-%Y", "%d-%m-%Y", "%Y-%m-%d"];
    for format in DATE_FORMATS {
        if let Ok(parsed) = NaiveDate::parse_from_str(text, format) {
            let midnight = parsed.and_hms_opt(0, 0, 0).expect("midnight is valid");
            if let Some(localized) = ist().from_local_datetime(&midnight).single() {
                return localized
                    .with_timezone(&Utc)
                    .to_rfc3339_opts(chrono::SecondsFormat::Secs, true);
            }
        }
    }

    String::new()
}

/// Reduce a timestamp-ish value to a plain `YYYY-MM-DD` date.
pub fn as_date(value: &str) -> String {
    let text = value.trim();
    if text.is_empty() {
        return String::new();
    }
    const FORMATS: &[&str] = &["%Y-%m-%d", "%d-%b-%Y", "%d-%m-%Y", "%d/%m/%Y"];
    for format in FORMATS {
        if let Ok(parsed) = NaiveDate::parse_from_str(text, format) {
            return parsed.format("%Y-%m-%d").to_string();
        }
    }
    let utc = to_utc_iso(text);
    if utc.len() >= 10 {
        return utc[..10].to_string();
    }
    String::new()
}

/// Map an announcement subject line to a coarse document type.
pub fn map_document_type(subject: &str) -> &'static str {
    let s = subject.trim().to_lowercase();
    if s.is_empty() {
        return "other";
    }
    if s.contains("result") || s.contains("financial") {
        return "results";
    }
    if s.contains("shareholding") {
        return "shareholding_pattern";
    }
    if s.contains("board meeting") || s.contains("outcome") {
        return "board_meeting_outcome";
    }
    if s.contains("dividend") || s.contains("split") || s.contains("bonus") || s.contains("buyback")
    {
        return "corporate_action";
    }
    if s.contains("annual report") {
        return "annual_report";
    }
    if s.contains("presentation") || s.contains("investor") {
        return "investor_presentation";
    }
    if s.contains("disclosure") || s.contains("regulation") || s.contains("intimation") {
        return "price_sensitive_disclosure";
    }
    "other"
}

/// Static identity of one Indian exchange feed.
struct FeedSpec {
    market_code: &'static str,
    exchange_code: &'static str,
    source_code: &'static str,
    api_url: &'static str,
    files_base_url: &'static str,
}

pub struct IndiaProvider {
    spec: FeedSpec,
    timeout: Duration,
}

impl IndiaProvider {
    pub fn nse(config: &ProviderConfig) -> Self {
        Self {
            spec: FeedSpec {
                market_code: "IN_NSE",
                exchange_code: "NSE",
                source_code: "nse",
                api_url: "https://www.nseindia.com/api/corporate-announcements?symbol={symbol}",
                files_base_url: "https://nsearchives.nseindia.com/",
            },
            timeout: Duration::from_secs(config.timeout_secs),
        }
    }

    pub fn bse(config: &ProviderConfig) -> Self {
        Self {
            spec: FeedSpec {
                market_code: "IN_BSE",
                exchange_code: "BSE",
                source_code: "bse",
                api_url: "https://api.bseindia.com/BseIndiaAPI/api/AnnSubCategoryGetData/w?strType=C&strPrevDate=&strScrip={symbol}",
                files_base_url: "https://www.bseindia.com/",
            },
            timeout: Duration::from_secs(config.timeout_secs),
        }
    }
}

impl IndiaProvider {
    fn client(&self) -> Result<reqwest::Client> {
        Ok(reqwest::Client::builder()
            .timeout(self.timeout)
            .user_agent("GravityAgent/1.0 (research@gravity.local)")
            .build()?)
    }

    async fn request_json(&self, url: &str) -> Option<Value> {
        let client = self.client().ok()?;
        match client.get(url).send().await {
            Ok(response) if response.status().is_success() => response.json().await.ok(),
            Ok(response) => {
                warn!(status = %response.status(), url, "India provider JSON request failed");
                None
            }
            Err(err) => {
                warn!(error = %err, url, "India provider JSON request failed");
                None
            }
        }
    }

    async fn request_text(&self, url: &str) -> String {
        let Ok(client) = self.client() else {
            return String::new();
        };
        match client.get(url).send().await {
            Ok(response) if response.status().is_success() => {
                response.text().await.unwrap_or_default()
            }
            Ok(response) => {
                warn!(status = %response.status(), url, "India provider text request failed");
                String::new()
            }
            Err(err) => {
                warn!(error = %err, url, "India provider text request failed");
                String::new()
            }
        }
    }

    async fn fetch_events_for_ticker(&self, ticker: &str) -> Vec<Value> {
        let url = self.spec.api_url.replace("{symbol}", ticker);
        let Some(payload) = self.request_json(&url).await else {
            return Vec::new();
        };
        if let Some(rows) = payload.as_array() {
            return rows.clone();
        }
        for key in ["data", "announcements", "Table"] {
            if let Some(rows) = payload[key].as_array() {
                return rows.clone();
            }
        }
        Vec::new()
    }

    fn event_id(&self, ticker: &str, raw: &Value) -> String {
        for key in ["source_event_id", "event_id", "newsid", "id", "sr_no", "SCRIP_CD"] {
            let explicit = value_str(raw, key);
            if !explicit.is_empty() {
                return format!("{}:{}:{}", self.spec.source_code, ticker, explicit);
            }
        }
        let timestamp = to_utc_iso(&first_value_str(
            raw,
            &["event_time", "an_dt", "announcement_time", "submittedDate", "DissemDT", "date"],
        ));
        if !timestamp.is_empty() {
            return format!("{}:{}:{}", self.spec.source_code, ticker, timestamp);
        }
        format!("{}:{}:unknown", self.spec.source_code, ticker)
    }

    fn normalize(&self, ticker: &str, raw: &Value) -> FilingRecord {
        let symbol = first_value_str(raw, &["symbol", "sm_symbol", "SecurityId", "SCRIP_CD"]);
        let symbol = if symbol.is_empty() {
            ticker.to_string()
        } else {
            symbol
        }
        .trim()
        .to_uppercase();

        let subject = first_value_str(raw, &["subject", "desc", "announcement", "Headline"]);
        let filing_type = {
            let explicit = first_value_str(raw, &["filing_type", "type"]);
            if explicit.is_empty() {
                map_document_type(&subject).to_string()
            } else {
                explicit
            }
        };
        let event_time_utc = to_utc_iso(&first_value_str(
            raw,
            &["event_time", "an_dt", "DissemDT", "submittedDate", "date"],
        ));
        let filing_date = {
            let explicit = first_value_str(raw, &["filing_date", "dt", "date"]);
            let candidate = if explicit.is_empty() {
                event_time_utc.clone()
            } else {
                explicit
            };
            as_date(&candidate)
        };

        let path = first_value_str(raw, &["attachment", "attchmntFile", "fileName", "pdf", "url"]);
        let filing_url = if !path.is_empty() && !path.starts_with("http") {
            format!("{}{}", self.spec.files_base_url, path.trim_start_matches('/'))
        } else {
            path
        };

        let issuer_id = first_value_str(raw, &["isin", "ISIN", "issuer_id"])
            .trim()
            .to_uppercase();
        let source_event_id = self.event_id(&symbol, raw);
        let document_type = {
            let explicit = value_str(raw, "document_type");
            if explicit.is_empty() {
                map_document_type(&subject).to_string()
            } else {
                explicit
            }
        };

        let mut record = FilingRecord::new(&symbol, &source_event_id, &filing_url);
        record.filing_type = filing_type.clone();
        record.market = self.spec.market_code.to_string();
        record.exchange = self.spec.exchange_code.to_string();
        record.issuer_id = issuer_id.clone();
        record.source = self.spec.source_code.to_string();
        record.source_event_id = source_event_id.clone();
        record.document_type = document_type.clone();
        record.currency = "INR".to_string();
        for (key, value) in [
            ("market", self.spec.market_code.to_string()),
            ("exchange", self.spec.exchange_code.to_string()),
            ("source", self.spec.source_code.to_string()),
            ("source_event_id", source_event_id),
            ("issuer_id", issuer_id),
            ("document_type", document_type),
            ("filing_type", filing_type),
            ("filing_date", filing_date),
            ("event_time_utc", event_time_utc),
            ("currency", "INR".to_string()),
            ("subject", subject),
        ] {
            record.metadata.insert(key.to_string(), Value::String(value));
        }
        record
    }

    async fn collect(&self, instruments: &[String], per_instrument_limit: usize) -> Vec<FilingRecord> {
        let mut results = Vec::new();
        for instrument in instruments {
            let ticker = instrument.trim().to_uppercase();
            if ticker.is_empty() {
                continue;
            }
            let rows = self.fetch_events_for_ticker(&ticker).await;
            let mut normalized: Vec<FilingRecord> = rows
                .iter()
                .filter(|row| row.is_object())
                .map(|row| self.normalize(&ticker, row))
                .collect();
            normalized.sort_by(|a, b| {
                b.meta_str("event_time_utc").cmp(&a.meta_str("event_time_utc"))
            });
            normalized.truncate(per_instrument_limit);
            results.extend(normalized);
        }
        results
    }
}

fn value_str(raw: &Value, key: &str) -> String {
    match &raw[key] {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        _ => String::new(),
    }
}

fn first_value_str(raw: &Value, keys: &[&str]) -> String {
    for key in keys {
        let value = value_str(raw, key);
        if !value.is_empty() {
            return value;
        }
    }
    String::new()
}

#[async_trait]
impl MarketProvider for IndiaProvider {
    fn market_code(&self) -> &str {
        self.spec.market_code
    }

    async fn get_latest_filings(&self, instruments: &[String]) -> Result<Vec<FilingRecord>> {
        Ok(self.collect(instruments, 1).await)
    }

    async fn get_recent_filings(
        &self,
        instruments: &[String],
        per_instrument_limit: usize,
    ) -> Result<Vec<FilingRecord>> {
        Ok(self.collect(instruments, per_instrument_limit.max(1)).await)
    }

    async fn get_document_text(&self, record: &FilingRecord) -> Result<String> {
        if record.filing_url.is_empty() {
            return Ok(String::new());
        }
        let raw = self.request_text(&record.filing_url).await;
        Ok(html_to_text(&raw))
    }

    async fn resolve_instrument(&self, ticker: &str) -> Result<Instrument> {
        Ok(Instrument {
            ticker: ticker.trim().to_uppercase(),
            issuer_id: String::new(),
            exchange: self.spec.exchange_code.to_string(),
        })
    }
}
