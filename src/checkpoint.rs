//! Durable per-(graph, thread) checkpoints of pipeline stage state.
//!
//! Checkpoints exist for observability and replay, not for resuming a stage
//! mid-flight: each run overwrites the previous snapshot for its thread id
//! (last write wins).

use anyhow::Result;
use chrono::Utc;
use serde_json::Value;
use sqlx::SqlitePool;

#[derive(Clone)]
pub struct CheckpointStore {
    pool: SqlitePool,
}

impl CheckpointStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn save_state(&self, graph_name: &str, thread_id: &str, state: &Value) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            r#"
            INSERT INTO graph_checkpoints(graph_name, thread_id, state_json, updated_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(graph_name, thread_id)
            DO UPDATE SET state_json = excluded.state_json, updated_at = excluded.updated_at
            "#,
        )
        .bind(graph_name)
        .bind(thread_id)
        .bind(serde_json::to_string(state)?)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn load_state(&self, graph_name: &str, thread_id: &str) -> Result<Option<Value>> {
        let row: Option<String> = sqlx::query_scalar(
            "SELECT state_json FROM graph_checkpoints WHERE graph_name = ? AND thread_id = ?",
        )
        .bind(graph_name)
        .bind(thread_id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }
}
