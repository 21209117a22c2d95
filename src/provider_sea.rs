//! Simulated Southeast Asian exchange feed.
//!
//! Stands in for an IDX aggregator: polling "finds" one Indonesian-language
//! quarterly report per instrument and document fetch returns predetermined
//! text mimicking OCR output. Downstream behavior (translation, currency
//! normalization) is exercised through the SEA extraction prompt.

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tracing::info;
use uuid::Uuid;

use crate::models::FilingRecord;
use crate::provider::{Instrument, MarketProvider};

const SIMULATED_REPORT: &str = r#"
Laporan Kinerja Keuangan Kuartal III 2023 - PT Bank Rakyat Bahagia Tbk.

Pendapatan operasional perusahaan tumbuh secara solid, mencatatkan peningkatan sebesar 12.5% dibandingkan tahun lalu (Year-over-Year).
Laba bersih pada kuartal ini tercatat sebesar Rp 15.5 triliun. Laba per saham (EPS) mencapai Rp 250.

Prospek Manajemen:
Manajemen memproyeksikan pertumbuhan kredit yang kuat di sektor UMKM akan terus menjadi pendorong utama pada kuartal keempat.
Namun, kami tetap mewaspadai risiko pengetatan likuiditas global dan fluktuasi nilai tukar Rupiah terhadap Dolar AS yang dapat menekan margin bunga bersih (NIM).
Kami menargetkan pertumbuhan pendapatan single-digit tinggi untuk sisa tahun ini.
"#;

pub struct SeaProvider;

impl SeaProvider {
    pub fn new() -> Self {
        Self
    }

    fn simulate_record(&self, ticker: &str) -> FilingRecord {
        let ticker = ticker.trim().to_uppercase();
        let today = Utc::now().format("%Y%m%d");
        let event_uuid = Uuid::new_v4().simple().to_string();
        let accession = format!("SEA-{ticker}-{today}-{}", &event_uuid[..6]);

        let mut record = FilingRecord::new(
            &ticker,
            &accession,
            &format!("https://sea-exchange.local/{ticker}_Q3_2023.pdf"),
        );
        record.filing_type = "Q3".to_string();
        record.market = "SEA_LOCAL".to_string();
        record.exchange = "IDX".to_string();
        record.issuer_id = ticker.clone();
        record.source = "idx_aggregator".to_string();
        record.source_event_id = Uuid::new_v4().to_string();
        record.document_type = "Q3_Report".to_string();
        record.currency = "IDR".to_string();
        record
            .metadata
            .insert("language".to_string(), Value::String("id".to_string()));
        record.metadata.insert(
            "filing_date".to_string(),
            Value::String(Utc::now().format("%Y-%m-%d").to_string()),
        );
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
        record
    }
}

impl Default for SeaProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MarketProvider for SeaProvider {
    fn market_code(&self) -> &str {
        "SEA_LOCAL"
    }

    async fn get_latest_filings(&self, instruments: &[String]) -> Result<Vec<FilingRecord>> {
        let mut results = Vec::new();
        for ticker in instruments {
            if ticker.trim().is_empty() {
                continue;
            }
            info!(ticker, "SeaProvider polling");
            results.push(self.simulate_record(ticker));
        }
        Ok(results)
    }

    async fn get_recent_filings(
        &self,
        instruments: &[String],
        _per_instrument_limit: usize,
    ) -> Result<Vec<FilingRecord>> {
        // The simulated aggregator only ever exposes the latest report.
        self.get_latest_filings(instruments).await
    }

    async fn get_document_text(&self, record: &FilingRecord) -> Result<String> {
        info!(url = %record.filing_url, "SeaProvider simulating OCR text extraction");
        Ok(SIMULATED_REPORT.trim().to_string())
    }

    async fn resolve_instrument(&self, ticker: &str) -> Result<Instrument> {
        let symbol = ticker.trim().to_uppercase();
        Ok(Instrument {
            issuer_id: symbol.clone(),
            ticker: symbol,
            exchange: "IDX".to_string(),
        })
    }
}
