//! Live SEC EDGAR provider.
//!
//! Resolves tickers to CIKs through the public company-tickers mapping
//! (cached on disk), walks the per-company submissions feed, and fetches
//! primary documents and attachments from the archives. Only 8-K, 10-Q,
//! and 10-K filings qualify.

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::warn;

use crate::config::ProviderConfig;
use crate::models::{Attachment, FilingRecord};
use crate::provider::{html_to_text, normalize_record, Instrument, MarketProvider};

const COMPANY_TICKERS_URL: &str = "https://www.sec.gov/files/company_tickers.json";
const SUBMISSIONS_URL: &str = "https://data.sec.gov/submissions/CIK";
const ARCHIVES_BASE: &str = "https://www.sec.gov/Archives/edgar/data";

const QUALIFYING_FORMS: &[&str] = &["8-K", "10-Q", "10-K"];

pub struct EdgarProvider {
    sec_identity: String,
    timeout: Duration,
    ticker_cache_path: PathBuf,
    cik_cache: Mutex<HashMap<String, String>>,
}

impl EdgarProvider {
    pub fn new(config: &ProviderConfig) -> Self {
        Self {
            sec_identity: config.sec_identity.clone(),
            timeout: Duration::from_secs(config.timeout_secs),
            ticker_cache_path: config.ticker_cache_path.clone(),
            cik_cache: Mutex::new(HashMap::new()),
        }
    }

    fn client(&self) -> Result<reqwest::Client> {
        Ok(reqwest::Client::builder()
            .timeout(self.timeout)
            .user_agent(self.sec_identity.clone())
            .build()?)
    }

    async fn get_json(&self, url: &str) -> Option<Value> {
        let client = match self.client() {
            Ok(client) => client,
            Err(err) => {
                warn!(error = %err, "failed to build EDGAR http client");
                return None;
            }
        };
        match client.get(url).send().await {
            Ok(response) if response.status().is_success() => response.json().await.ok(),
            Ok(response) => {
                warn!(status = %response.status(), url, "SEC JSON request failed");
                None
            }
            Err(err) => {
                warn!(error = %err, url, "SEC JSON request failed");
                None
            }
        }
    }

    async fn get_text(&self, url: &str) -> String {
        let client = match self.client() {
            Ok(client) => client,
            Err(err) => {
                warn!(error = %err, "failed to build EDGAR http client");
                return String::new();
            }
        };
        match client.get(url).send().await {
            Ok(response) if response.status().is_success() => {
                response.text().await.unwrap_or_default()
            }
            Ok(response) => {
                warn!(status = %response.status(), url, "SEC text request failed");
                String::new()
            }
            Err(err) => {
                warn!(error = %err, url, "SEC text request failed");
                String::new()
            }
        }
    }

    async fn resolve_cik(&self, ticker: &str) -> Option<String> {
        let ticker = ticker.to_uppercase();
        {
            let cache = self.cik_cache.lock().await;
            if let Some(cik) = cache.get(&ticker) {
                return Some(cik.clone());
            }
        }
        let mapping = self.load_ticker_mapping().await;
        mapping.get(&ticker).cloned()
    }

    async fn load_ticker_mapping(&self) -> HashMap<String, String> {
        {
            let cache = self.cik_cache.lock().await;
            if !cache.is_empty() {
                return cache.clone();
            }
        }

        // Disk cache first; the mapping file is large and rarely changes.
        if let Ok(raw) = std::fs::read_to_string(&self.ticker_cache_path) {
            if let Ok(cached) = serde_json::from_str::<HashMap<String, String>>(&raw) {
                if !cached.is_empty() {
                    let mut cache = self.cik_cache.lock().await;
                    *cache = cached.clone();
                    return cached;
                }
            }
        }

        let Some(payload) = self.get_json(COMPANY_TICKERS_URL).await else {
            return HashMap::new();
        };
        let Some(entries) = payload.as_object() else {
            return HashMap::new();
        };

        let mut mapping = HashMap::new();
        for entry in entries.values() {
            let symbol = entry["ticker"].as_str().unwrap_or_default().to_uppercase();
            let cik = match &entry["cik_str"] {
                Value::Number(n) => n.to_string(),
                Value::String(s) => s.clone(),
                _ => continue,
            };
            if !symbol.is_empty() {
                mapping.insert(symbol, format!("{:0>10}", cik));
            }
        }

        if let Some(parent) = self.ticker_cache_path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        if let Ok(serialized) = serde_json::to_string(&mapping) {
            if let Err(err) = std::fs::write(&self.ticker_cache_path, serialized) {
                warn!(error = %err, "failed writing ticker cache");
            }
        }

        let mut cache = self.cik_cache.lock().await;
        *cache = mapping.clone();
        mapping
    }

    async fn collect_filings(
        &self,
        instruments: &[String],
        per_instrument_limit: usize,
    ) -> Vec<FilingRecord> {
        let mut filings = Vec::new();
        for ticker in instruments {
            let Some(cik) = self.resolve_cik(ticker).await else {
                warn!(ticker, "no CIK found for ticker");
                continue;
            };
            let Some(data) = self
                .get_json(&format!("{SUBMISSIONS_URL}{cik}.json"))
                .await
            else {
                continue;
            };

            let recent = &data["filings"]["recent"];
            let mut collected = 0usize;
            for row in extract_recent_records(recent) {
                if !QUALIFYING_FORMS.contains(&row.form.as_str()) {
                    continue;
                }
                if row.primary_document.is_empty() {
                    continue;
                }

                let cik_int = cik.trim_start_matches('0');
                let cik_int = if cik_int.is_empty() { "0" } else { cik_int };
                let accession_no_dashes = row.accession.replace('-', "");
                let filing_url = format!(
                    "{ARCHIVES_BASE}/{cik_int}/{accession_no_dashes}/{}",
                    row.primary_document
                );
                let directory_url = format!("{ARCHIVES_BASE}/{cik_int}/{accession_no_dashes}/");

                let mut record = FilingRecord::new(ticker, &row.accession, &filing_url);
                record.filing_type = row.form.clone();
                record.currency = "USD".to_string();
                record.metadata.insert("cik".to_string(), Value::String(cik.clone()));
                record
                    .metadata
                    .insert("filing_date".to_string(), Value::String(row.filing_date.clone()));
                record.metadata.insert(
                    "primary_document".to_string(),
                    Value::String(row.primary_document.clone()),
                );
                record
                    .metadata
                    .insert("directory_url".to_string(), Value::String(directory_url));
                normalize_record(&mut record, "US_SEC", "SEC", "sec");
                filings.push(record);

                collected += 1;
                if collected >= per_instrument_limit {
                    break;
                }
            }
        }
        filings
    }
}

struct RecentRow {
    accession: String,
    form: String,
    primary_document: String,
    filing_date: String,
}

/// The submissions feed stores parallel arrays; zip them into rows,
/// truncating to the shortest.
fn extract_recent_records(recent: &Value) -> Vec<RecentRow> {
    let as_strings = |key: &str| -> Vec<String> {
        recent[key]
            .as_array()
            .map(|values| {
                values
                    .iter()
                    .map(|v| v.as_str().unwrap_or_default().to_string())
                    .collect()
            })
            .unwrap_or_default()
    };

    let accessions = as_strings("accessionNumber");
    let forms = as_strings("form");
    let primary_docs = as_strings("primaryDocument");
    let filing_dates = as_strings("filingDate");

    let count = accessions
        .len()
        .min(forms.len())
        .min(primary_docs.len())
        .min(filing_dates.len());

    (0..count)
        .map(|idx| RecentRow {
            accession: accessions[idx].clone(),
            form: forms[idx].clone(),
            primary_document: primary_docs[idx].clone(),
            filing_date: filing_dates[idx].clone(),
        })
        .collect()
}

#[async_trait]
impl MarketProvider for EdgarProvider {
    fn market_code(&self) -> &str {
        "US_SEC"
    }

    async fn get_latest_filings(&self, instruments: &[String]) -> Result<Vec<FilingRecord>> {
        Ok(self.collect_filings(instruments, 1).await)
    }

    async fn get_recent_filings(
        &self,
        instruments: &[String],
        per_instrument_limit: usize,
    ) -> Result<Vec<FilingRecord>> {
        Ok(self
            .collect_filings(instruments, per_instrument_limit.max(1))
            .await)
    }

    async fn get_document_text(&self, record: &FilingRecord) -> Result<String> {
        let raw = self.get_text(&record.filing_url).await;
        Ok(html_to_text(&raw))
    }

    async fn get_document_attachments(&self, record: &FilingRecord) -> Result<Vec<Attachment>> {
        let directory_url = record.meta_str("directory_url");
        if directory_url.is_empty() {
            return Ok(Vec::new());
        }

        let index_url = format!("{}index.json", directory_url);
        let Some(index_data) = self.get_json(&index_url).await else {
            return Ok(Vec::new());
        };

        let items = index_data["directory"]["item"]
            .as_array()
            .cloned()
            .unwrap_or_default();

        let mut attachments = Vec::new();
        for item in items {
            let name = item["name"].as_str().unwrap_or_default().to_string();
            let lower = name.to_lowercase();
            let is_candidate = lower.contains("99")
                || lower.contains("ex")
                || lower.contains("press")
                || lower.ends_with(".htm")
                || lower.ends_with(".html")
                || lower.ends_with(".txt");
            if !is_candidate {
                continue;
            }

            let attachment_url = format!("{}{}", directory_url, name);
            let raw = self.get_text(&attachment_url).await;
            if raw.is_empty() {
                continue;
            }

            attachments.push(Attachment {
                name,
                description: item["type"].as_str().unwrap_or_default().to_string(),
                text: html_to_text(&raw),
            });
        }
        Ok(attachments)
    }

    async fn resolve_instrument(&self, ticker: &str) -> Result<Instrument> {
        let symbol = ticker.trim().to_uppercase();
        let issuer_id = if symbol.is_empty() {
            None
        } else {
            self.resolve_cik(&symbol).await
        };
        Ok(Instrument {
            ticker: symbol,
            issuer_id: issuer_id.unwrap_or_default(),
            exchange: "SEC".to_string(),
        })
    }
}
