//! Durable ingestion and processing state.
//!
//! One row per filing keyed by accession number, carrying the processing
//! status, dead-letter diagnostics, and replay counters, plus the event log,
//! watchlists, and notifications that hang off the pipeline.
//!
//! Status strings are the durable contract (`INGESTED`, `ANALYZED`,
//! `ANALYZED_NOT_INDEXED`, `DEAD_LETTER`); transitions are driven by the
//! orchestrator, never by this module.

use anyhow::Result;
use chrono::{Duration, SecondsFormat, Utc};
use regex::Regex;
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use std::sync::OnceLock;

use crate::models::{FilingStatus, Notification, StoredFiling};

/// Optional descriptive columns recorded at ingestion time.
#[derive(Debug, Clone, Default)]
pub struct IngestedMeta {
    pub filing_type: String,
    pub item_code: String,
    pub filing_date: String,
    pub market: String,
    pub exchange: String,
    pub issuer_id: String,
    pub source: String,
    pub document_type: String,
    pub currency: String,
}

/// Result summary of a filing-type backfill pass.
#[derive(Debug, Clone)]
pub struct BackfillMetadataReport {
    pub updated_count: usize,
    pub skipped_count: usize,
    pub total_scanned: usize,
    pub samples: Vec<String>,
}

#[derive(Clone)]
pub struct StateStore {
    pool: SqlitePool,
}

fn now_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

impl StateStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn has_accession(&self, accession_number: &str) -> Result<bool> {
        let row: Option<i64> =
            sqlx::query_scalar("SELECT 1 FROM filings WHERE accession_number = ?")
                .bind(accession_number)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.is_some())
    }

    /// Upsert the filing row. Empty descriptive fields never overwrite
    /// previously recorded values; status always does.
    async fn upsert_filing(
        &self,
        accession_number: &str,
        ticker: &str,
        filing_url: &str,
        status: FilingStatus,
        meta: &IngestedMeta,
        dead_letter_reason: &str,
        last_error: &str,
    ) -> Result<()> {
        let now = now_iso();
        sqlx::query(
            r#"
            INSERT INTO filings (
                accession_number, ticker, filing_url, status,
                filing_type, item_code, filing_date,
                market, exchange, issuer_id, source, document_type, currency,
                dead_letter_reason, last_error, created_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(accession_number)
            DO UPDATE SET
                status = excluded.status,
                filing_type = COALESCE(NULLIF(excluded.filing_type, ''), filings.filing_type),
                item_code = COALESCE(NULLIF(excluded.item_code, ''), filings.item_code),
                filing_date = COALESCE(NULLIF(excluded.filing_date, ''), filings.filing_date),
                market = COALESCE(NULLIF(excluded.market, ''), filings.market),
                exchange = COALESCE(NULLIF(excluded.exchange, ''), filings.exchange),
                issuer_id = COALESCE(NULLIF(excluded.issuer_id, ''), filings.issuer_id),
                source = COALESCE(NULLIF(excluded.source, ''), filings.source),
                document_type = COALESCE(NULLIF(excluded.document_type, ''), filings.document_type),
                currency = COALESCE(NULLIF(excluded.currency, ''), filings.currency),
                dead_letter_reason = excluded.dead_letter_reason,
                last_error = excluded.last_error,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(accession_number)
        .bind(ticker)
        .bind(filing_url)
        .bind(status.as_str())
        .bind(&meta.filing_type)
        .bind(&meta.item_code)
        .bind(&meta.filing_date)
        .bind(&meta.market)
        .bind(&meta.exchange)
        .bind(&meta.issuer_id)
        .bind(&meta.source)
        .bind(&meta.document_type)
        .bind(&meta.currency)
        .bind(dead_letter_reason)
        .bind(last_error)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn mark_ingested(
        &self,
        accession_number: &str,
        ticker: &str,
        filing_url: &str,
        meta: &IngestedMeta,
    ) -> Result<()> {
        self.upsert_filing(
            accession_number,
            ticker,
            filing_url,
            FilingStatus::Ingested,
            meta,
            "",
            "",
        )
        .await
    }

    pub async fn mark_analyzed(
        &self,
        accession_number: &str,
        ticker: &str,
        filing_url: &str,
    ) -> Result<()> {
        self.upsert_filing(
            accession_number,
            ticker,
            filing_url,
            FilingStatus::Analyzed,
            &IngestedMeta::default(),
            "",
            "",
        )
        .await
    }

    pub async fn mark_analyzed_not_indexed(
        &self,
        accession_number: &str,
        ticker: &str,
        filing_url: &str,
        error: &str,
    ) -> Result<()> {
        self.upsert_filing(
            accession_number,
            ticker,
            filing_url,
            FilingStatus::AnalyzedNotIndexed,
            &IngestedMeta::default(),
            "",
            error,
        )
        .await
    }

    pub async fn mark_dead_letter(
        &self,
        accession_number: &str,
        ticker: &str,
        filing_url: &str,
        reason: &str,
        error: &str,
    ) -> Result<()> {
        self.upsert_filing(
            accession_number,
            ticker,
            filing_url,
            FilingStatus::DeadLetter,
            &IngestedMeta::default(),
            reason,
            error,
        )
        .await
    }

    pub async fn get_filing(&self, accession_number: &str) -> Result<Option<StoredFiling>> {
        let row = sqlx::query(
            r#"
            SELECT accession_number, ticker, filing_url, status, filing_type, item_code,
                   filing_date, market, exchange, issuer_id, source, document_type, currency,
                   dead_letter_reason, last_error, replay_count, last_replay_at, updated_at
            FROM filings WHERE accession_number = ?
            "#,
        )
        .bind(accession_number)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(row_to_filing))
    }

    /// Bump the replay counter before a replay attempt. Returns false when
    /// the accession is unknown.
    pub async fn mark_replay_attempt(&self, accession_number: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE filings
            SET replay_count = replay_count + 1, last_replay_at = ?, updated_at = ?
            WHERE accession_number = ?
            "#,
        )
        .bind(now_iso())
        .bind(now_iso())
        .bind(accession_number)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn log_event(&self, topic: &str, source: &str, payload: &str) -> Result<()> {
        sqlx::query("INSERT INTO events(topic, source, payload, created_at) VALUES (?, ?, ?, ?)")
            .bind(topic)
            .bind(source)
            .bind(payload)
            .bind(now_iso())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn list_recent_filings(&self, limit: i64) -> Result<Vec<StoredFiling>> {
        let rows = sqlx::query(
            r#"
            SELECT accession_number, ticker, filing_url, status, filing_type, item_code,
                   filing_date, market, exchange, issuer_id, source, document_type, currency,
                   dead_letter_reason, last_error, replay_count, last_replay_at, updated_at
            FROM filings
            ORDER BY updated_at DESC
            LIMIT ?
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(row_to_filing).collect())
    }

    pub async fn list_recent_failures(&self, limit: i64) -> Result<Vec<StoredFiling>> {
        let rows = sqlx::query(
            r#"
            SELECT accession_number, ticker, filing_url, status, filing_type, item_code,
                   filing_date, market, exchange, issuer_id, source, document_type, currency,
                   dead_letter_reason, last_error, replay_count, last_replay_at, updated_at
            FROM filings
            WHERE status IN ('DEAD_LETTER', 'ANALYZED_NOT_INDEXED')
            ORDER BY updated_at DESC
            LIMIT ?
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(row_to_filing).collect())
    }

    pub async fn count_filings_by_status(&self) -> Result<HashMap<String, i64>> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM filings GROUP BY status")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .into_iter()
            .map(|row| (row.get::<String, _>("status"), row.get::<i64, _>("n")))
            .collect())
    }

    pub async fn count_recent_events(&self, minutes: i64) -> Result<HashMap<String, i64>> {
        let cutoff = (Utc::now() - Duration::minutes(minutes))
            .to_rfc3339_opts(SecondsFormat::Secs, true);
        let rows =
            sqlx::query("SELECT topic, COUNT(*) AS n FROM events WHERE created_at >= ? GROUP BY topic")
                .bind(cutoff)
                .fetch_all(&self.pool)
                .await?;
        Ok(rows
            .into_iter()
            .map(|row| (row.get::<String, _>("topic"), row.get::<i64, _>("n")))
            .collect())
    }

    // ============ Watchlists ============

    pub async fn add_watchlist_ticker(&self, org_id: &str, user_id: &str, ticker: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO watchlists(org_id, user_id, ticker, created_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(org_id, user_id, ticker) DO NOTHING
            "#,
        )
        .bind(org_id)
        .bind(user_id)
        .bind(ticker.to_uppercase())
        .bind(now_iso())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn remove_watchlist_ticker(
        &self,
        org_id: &str,
        user_id: &str,
        ticker: &str,
    ) -> Result<()> {
        sqlx::query("DELETE FROM watchlists WHERE org_id = ? AND user_id = ? AND ticker = ?")
            .bind(org_id)
            .bind(user_id)
            .bind(ticker.to_uppercase())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn list_watchlist(&self, org_id: &str, user_id: &str) -> Result<Vec<String>> {
        let rows = sqlx::query_scalar(
            "SELECT ticker FROM watchlists WHERE org_id = ? AND user_id = ? ORDER BY ticker ASC",
        )
        .bind(org_id)
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn list_watchlist_subscribers(&self, org_id: &str, ticker: &str) -> Result<Vec<String>> {
        let rows = sqlx::query_scalar("SELECT user_id FROM watchlists WHERE org_id = ? AND ticker = ?")
            .bind(org_id)
            .bind(ticker.to_uppercase())
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    // ============ Notifications ============

    #[allow(clippy::too_many_arguments)]
    pub async fn create_notification(
        &self,
        org_id: &str,
        user_id: &str,
        ticker: &str,
        accession_number: &str,
        notification_type: &str,
        title: &str,
        body: &str,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO notifications(
                org_id, user_id, ticker, accession_number, notification_type,
                title, body, is_read, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, 0, ?)
            "#,
        )
        .bind(org_id)
        .bind(user_id)
        .bind(ticker.to_uppercase())
        .bind(accession_number)
        .bind(notification_type)
        .bind(title)
        .bind(body)
        .bind(now_iso())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn list_notifications(
        &self,
        org_id: &str,
        user_id: &str,
        limit: i64,
        unread_only: bool,
    ) -> Result<Vec<Notification>> {
        let mut query = String::from(
            "SELECT id, org_id, user_id, ticker, accession_number, notification_type, \
             title, body, is_read, created_at FROM notifications WHERE org_id = ? AND user_id = ?",
        );
        if unread_only {
            query.push_str(" AND is_read = 0");
        }
        query.push_str(" ORDER BY created_at DESC LIMIT ?");

        let rows = sqlx::query(&query)
            .bind(org_id)
            .bind(user_id)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows
            .into_iter()
            .map(|row| Notification {
                id: row.get("id"),
                org_id: row.get("org_id"),
                user_id: row.get("user_id"),
                ticker: row.get("ticker"),
                accession_number: row.get("accession_number"),
                notification_type: row.get("notification_type"),
                title: row.get("title"),
                body: row.get("body"),
                is_read: row.get::<i64, _>("is_read") != 0,
                created_at: row.get("created_at"),
            })
            .collect())
    }

    pub async fn mark_notification_read(
        &self,
        org_id: &str,
        user_id: &str,
        notification_id: i64,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE notifications SET is_read = 1 WHERE id = ? AND org_id = ? AND user_id = ?",
        )
        .bind(notification_id)
        .bind(org_id)
        .bind(user_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn count_unread_notifications(&self, org_id: &str, user_id: &str) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM notifications WHERE org_id = ? AND user_id = ? AND is_read = 0",
        )
        .bind(org_id)
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    // ============ Filing-type backfill ============

    /// Populate `filing_type` for rows where it is missing, inferring the
    /// form type from the filing URL. Two passes: canonical path segments
    /// (`/10-Q/`, `/8-K/`, ...) then compact tokens found in filenames
    /// (`def14a`, `sc13d`, `20f`, ...).
    pub async fn backfill_filing_metadata(&self) -> Result<BackfillMetadataReport> {
        let rows = sqlx::query(
            "SELECT accession_number, filing_url FROM filings \
             WHERE filing_type IS NULL OR filing_type = ''",
        )
        .fetch_all(&self.pool)
        .await?;

        let total = rows.len();
        let mut updated = 0usize;
        let mut skipped = 0usize;
        let mut samples = Vec::new();

        for row in rows {
            let accession: String = row.get("accession_number");
            let url: String = row.get("filing_url");
            let Some(filing_type) = infer_filing_type(&url) else {
                skipped += 1;
                continue;
            };

            let result = sqlx::query(
                "UPDATE filings SET filing_type = ? \
                 WHERE accession_number = ? AND (filing_type IS NULL OR filing_type = '')",
            )
            .bind(&filing_type)
            .bind(&accession)
            .execute(&self.pool)
            .await?;

            if result.rows_affected() > 0 {
                updated += 1;
                if samples.len() < 5 {
                    samples.push(accession);
                }
            } else {
                skipped += 1;
            }
        }

        Ok(BackfillMetadataReport {
            updated_count: updated,
            skipped_count: skipped,
            total_scanned: total,
            samples,
        })
    }
}

fn row_to_filing(row: sqlx::sqlite::SqliteRow) -> StoredFiling {
    StoredFiling {
        accession_number: row.get("accession_number"),
        ticker: row.get("ticker"),
        filing_url: row.get("filing_url"),
        status: row.get("status"),
        filing_type: row.get::<Option<String>, _>("filing_type").unwrap_or_default(),
        item_code: row.get::<Option<String>, _>("item_code").unwrap_or_default(),
        filing_date: row.get::<Option<String>, _>("filing_date").unwrap_or_default(),
        market: row.get("market"),
        exchange: row.get("exchange"),
        issuer_id: row.get("issuer_id"),
        source: row.get("source"),
        document_type: row.get("document_type"),
        currency: row.get("currency"),
        dead_letter_reason: row.get("dead_letter_reason"),
        last_error: row.get("last_error"),
        replay_count: row.get("replay_count"),
        last_replay_at: row.get("last_replay_at"),
        updated_at: row.get("updated_at"),
    }
}

/// Compact EDGAR tokens found in filenames and URL slugs.
const COMPACT_TOKENS: &[(&str, &str)] = &[
    ("10q", "10-Q"),
    ("10k", "10-K"),
    ("10ka", "10-K/A"),
    ("10qa", "10-Q/A"),
    ("8k", "8-K"),
    ("8ka", "8-K/A"),
    ("6k", "6-K"),
    ("20f", "20-F"),
    ("s1", "S-1"),
    ("def14a", "DEF 14A"),
    ("defa14a", "DEFA14A"),
    ("sc13d", "SC 13D"),
    ("sc13g", "SC 13G"),
    ("sd", "SD"),
];

fn canonical_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?i)/(10-[QK](?:/A)?|8-K(?:/A)?|6-K|20-F|S-1|SD)/").unwrap()
    })
}

fn compact_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        let alternation = COMPACT_TOKENS
            .iter()
            .map(|(token, _)| regex::escape(token))
            .collect::<Vec<_>>()
            .join("|");
        Regex::new(&format!(r"(?i)(?:^|[/\-_.])({alternation})(?:[/\-_.]|$)")).unwrap()
    })
}

/// Infer the form type from a filing URL, or `None` when neither heuristic
/// matches.
pub fn infer_filing_type(url: &str) -> Option<String> {
    if url.is_empty() {
        return None;
    }
    if let Some(captures) = canonical_pattern().captures(url) {
        return Some(captures[1].to_uppercase());
    }
    if let Some(captures) = compact_pattern().captures(url) {
        let token = captures[1].to_lowercase();
        return COMPACT_TOKENS
            .iter()
            .find(|(key, _)| *key == token)
            .map(|(_, form)| form.to_string());
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrate;

    async fn memory_store() -> StateStore {
        let pool = crate::db::connect_memory().await.unwrap();
        migrate::migrate_state(&pool).await.unwrap();
        StateStore::new(pool)
    }

    #[tokio::test]
    async fn test_has_accession_after_mark_ingested() {
        let store = memory_store().await;
        assert!(!store.has_accession("A1").await.unwrap());
        store
            .mark_ingested("A1", "AAPL", "https://example.com/a1.htm", &IngestedMeta::default())
            .await
            .unwrap();
        assert!(store.has_accession("A1").await.unwrap());
    }

    #[tokio::test]
    async fn test_dead_letter_reason_and_replay_tracking() {
        let store = memory_store().await;
        store
            .mark_ingested("A2", "MSFT", "https://example.com/a2.htm", &IngestedMeta::default())
            .await
            .unwrap();
        store
            .mark_dead_letter(
                "A2",
                "MSFT",
                "https://example.com/a2.htm",
                "validation_failed_after_reflection",
                "missing revenue kpi",
            )
            .await
            .unwrap();

        let filing = store.get_filing("A2").await.unwrap().unwrap();
        assert_eq!(filing.status, "DEAD_LETTER");
        assert_eq!(filing.dead_letter_reason, "validation_failed_after_reflection");
        assert_eq!(filing.last_error, "missing revenue kpi");
        assert_eq!(filing.replay_count, 0);

        assert!(store.mark_replay_attempt("A2").await.unwrap());
        let filing = store.get_filing("A2").await.unwrap().unwrap();
        assert_eq!(filing.replay_count, 1);
        assert!(!filing.last_replay_at.is_empty());

        assert!(!store.mark_replay_attempt("missing").await.unwrap());
    }

    #[tokio::test]
    async fn test_analyzed_clears_dead_letter_diagnostics() {
        let store = memory_store().await;
        store
            .mark_dead_letter("A3", "NVDA", "https://example.com/a3.htm", "transport", "timeout")
            .await
            .unwrap();
        store
            .mark_analyzed("A3", "NVDA", "https://example.com/a3.htm")
            .await
            .unwrap();

        let filing = store.get_filing("A3").await.unwrap().unwrap();
        assert_eq!(filing.status, "ANALYZED");
        assert_eq!(filing.dead_letter_reason, "");
        assert_eq!(filing.last_error, "");
    }

    #[tokio::test]
    async fn test_ingested_meta_survives_status_transitions() {
        let store = memory_store().await;
        let meta = IngestedMeta {
            filing_type: "8-K".to_string(),
            item_code: "2.02".to_string(),
            filing_date: "2023-08-01".to_string(),
            market: "US_SEC".to_string(),
            ..IngestedMeta::default()
        };
        store
            .mark_ingested("A4", "AAPL", "https://example.com/a4.htm", &meta)
            .await
            .unwrap();
        store
            .mark_analyzed("A4", "AAPL", "https://example.com/a4.htm")
            .await
            .unwrap();

        let filing = store.get_filing("A4").await.unwrap().unwrap();
        assert_eq!(filing.filing_type, "8-K");
        assert_eq!(filing.item_code, "2.02");
        assert_eq!(filing.market, "US_SEC");
    }

    #[tokio::test]
    async fn test_failures_and_status_counts() {
        let store = memory_store().await;
        store
            .mark_ingested("B1", "AAPL", "u1", &IngestedMeta::default())
            .await
            .unwrap();
        store
            .mark_dead_letter("B2", "MSFT", "u2", "validation_failed_after_reflection", "")
            .await
            .unwrap();
        store
            .mark_analyzed_not_indexed("B3", "NVDA", "u3", "bm25 rebuild failed")
            .await
            .unwrap();

        let counts = store.count_filings_by_status().await.unwrap();
        assert_eq!(counts.get("INGESTED"), Some(&1));
        assert_eq!(counts.get("DEAD_LETTER"), Some(&1));
        assert_eq!(counts.get("ANALYZED_NOT_INDEXED"), Some(&1));

        let failures = store.list_recent_failures(10).await.unwrap();
        assert_eq!(failures.len(), 2);
    }

    #[tokio::test]
    async fn test_watchlist_subscribers() {
        let store = memory_store().await;
        store.add_watchlist_ticker("default", "u1", "aapl").await.unwrap();
        store.add_watchlist_ticker("default", "u2", "AAPL").await.unwrap();
        store.add_watchlist_ticker("default", "u1", "AAPL").await.unwrap();

        let subscribers = store.list_watchlist_subscribers("default", "AAPL").await.unwrap();
        assert_eq!(subscribers.len(), 2);

        store.remove_watchlist_ticker("default", "u2", "AAPL").await.unwrap();
        let subscribers = store.list_watchlist_subscribers("default", "AAPL").await.unwrap();
        assert_eq!(subscribers, vec!["u1".to_string()]);
    }

    #[tokio::test]
    async fn test_notifications_read_flow() {
        let store = memory_store().await;
        store
            .create_notification("default", "u1", "AAPL", "A1", "filing_found", "New 8-K", "body")
            .await
            .unwrap();
        assert_eq!(store.count_unread_notifications("default", "u1").await.unwrap(), 1);

        let list = store.list_notifications("default", "u1", 10, true).await.unwrap();
        assert_eq!(list.len(), 1);
        assert!(store
            .mark_notification_read("default", "u1", list[0].id)
            .await
            .unwrap());
        assert_eq!(store.count_unread_notifications("default", "u1").await.unwrap(), 0);
    }

    #[test]
    fn test_infer_filing_type_canonical_segment() {
        assert_eq!(
            infer_filing_type("https://www.sec.gov/Archives/edgar/data/320193/10-Q/doc.htm"),
            Some("10-Q".to_string())
        );
        assert_eq!(
            infer_filing_type("https://host/filings/8-K/0001.htm"),
            Some("8-K".to_string())
        );
    }

    #[test]
    fn test_infer_filing_type_compact_token() {
        assert_eq!(
            infer_filing_type("https://host/archives/aapl-10q_20230701.htm"),
            Some("10-Q".to_string())
        );
        assert_eq!(
            infer_filing_type("https://host/archives/def14a-2023.htm"),
            Some("DEF 14A".to_string())
        );
        assert_eq!(infer_filing_type("https://host/archives/plain.htm"), None);
        assert_eq!(infer_filing_type(""), None);
    }

    #[tokio::test]
    async fn test_backfill_filing_metadata() {
        let store = memory_store().await;
        store
            .mark_ingested(
                "C1",
                "AAPL",
                "https://host/aapl-10q_2023.htm",
                &IngestedMeta::default(),
            )
            .await
            .unwrap();
        store
            .mark_ingested("C2", "MSFT", "https://host/opaque.bin", &IngestedMeta::default())
            .await
            .unwrap();

        let report = store.backfill_filing_metadata().await.unwrap();
        assert_eq!(report.total_scanned, 2);
        assert_eq!(report.updated_count, 1);
        assert_eq!(report.skipped_count, 1);
        assert_eq!(report.samples, vec!["C1".to_string()]);

        let filing = store.get_filing("C1").await.unwrap().unwrap();
        assert_eq!(filing.filing_type, "10-Q");
    }
}
