//! Schema creation for the three backing stores.
//!
//! All statements are idempotent; `gravity init` can be run repeatedly.

use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let state = db::connect(&config.db.state_path).await?;
    migrate_state(&state).await?;
    state.close().await;

    let checkpoints = db::connect(&config.db.checkpoint_path).await?;
    migrate_checkpoints(&checkpoints).await?;
    checkpoints.close().await;

    let rag = db::connect(&config.db.rag_path).await?;
    migrate_rag(&rag).await?;
    rag.close().await;

    Ok(())
}

pub async fn migrate_state(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS filings (
            accession_number TEXT PRIMARY KEY,
            ticker TEXT NOT NULL,
            filing_url TEXT NOT NULL,
            status TEXT NOT NULL,
            filing_type TEXT,
            item_code TEXT,
            filing_date TEXT,
            market TEXT NOT NULL DEFAULT '',
            exchange TEXT NOT NULL DEFAULT '',
            issuer_id TEXT NOT NULL DEFAULT '',
            source TEXT NOT NULL DEFAULT '',
            document_type TEXT NOT NULL DEFAULT '',
            currency TEXT NOT NULL DEFAULT '',
            dead_letter_reason TEXT NOT NULL DEFAULT '',
            last_error TEXT NOT NULL DEFAULT '',
            replay_count INTEGER NOT NULL DEFAULT 0,
            last_replay_at TEXT NOT NULL DEFAULT '',
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            topic TEXT NOT NULL,
            source TEXT NOT NULL,
            payload TEXT,
            created_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS watchlists (
            org_id TEXT NOT NULL DEFAULT 'default',
            user_id TEXT NOT NULL,
            ticker TEXT NOT NULL,
            created_at TEXT NOT NULL,
            PRIMARY KEY(org_id, user_id, ticker)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS notifications (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            org_id TEXT NOT NULL DEFAULT 'default',
            user_id TEXT NOT NULL,
            ticker TEXT NOT NULL,
            accession_number TEXT NOT NULL,
            notification_type TEXT NOT NULL,
            title TEXT NOT NULL,
            body TEXT NOT NULL,
            is_read INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_filings_status ON filings(status)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_filings_updated_at ON filings(updated_at DESC)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_events_created_at ON events(created_at DESC)")
        .execute(pool)
        .await?;

    Ok(())
}

pub async fn migrate_checkpoints(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS graph_checkpoints (
            graph_name TEXT NOT NULL,
            thread_id TEXT NOT NULL,
            state_json TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            PRIMARY KEY(graph_name, thread_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn migrate_rag(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS chunks (
            id TEXT PRIMARY KEY,
            text TEXT NOT NULL,
            metadata_json TEXT NOT NULL,
            created_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS chunk_vectors (
            chunk_id TEXT PRIMARY KEY,
            embedding BLOB NOT NULL,
            model TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            FOREIGN KEY (chunk_id) REFERENCES chunks(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}
