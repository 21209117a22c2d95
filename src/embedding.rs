//! Embedding provider seam for the semantic retrieval channel.
//!
//! Two backends:
//! - **disabled** (default) — no vectors are stored; the retrieval engine
//!   falls back to its degraded token-overlap scorer.
//! - **openai** — calls the OpenAI embeddings API with batching and
//!   exponential backoff (429/5xx and network errors retry, other 4xx fail
//!   immediately).
//!
//! Vectors are stored as little-endian f32 blobs in SQLite; similarity is
//! computed in-process with [`cosine_similarity`].

use anyhow::{bail, Result};
use std::time::Duration;

use crate::config::EmbeddingConfig;

/// Embed a batch of texts using the configured provider.
pub async fn embed_texts(config: &EmbeddingConfig, texts: &[String]) -> Result<Vec<Vec<f32>>> {
    match config.provider.as_str() {
        "openai" => embed_openai(config, texts).await,
        "disabled" => bail!("Embedding provider is disabled"),
        other => bail!("Unknown embedding provider: {}", other),
    }
}

/// Embed a single query text.
pub async fn embed_query(config: &EmbeddingConfig, text: &str) -> Result<Vec<f32>> {
    let results = embed_texts(config, &[text.to_string()]).await?;
    results
        .into_iter()
        .next()
        .ok_or_else(|| anyhow::anyhow!("Empty embedding response"))
}

async fn embed_openai(config: &EmbeddingConfig, texts: &[String]) -> Result<Vec<Vec<f32>>> {
    let api_key =
        std::env::var("OPENAI_API_KEY").map_err(|_| anyhow::anyhow!("OPENAI_API_KEY not set"))?;
    let model = config
        .model
        .as_ref()
        .ok_or_else(|| anyhow::anyhow!("embedding.model required for OpenAI provider"))?;

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(config.timeout_secs))
        .build()?;

    let mut all_embeddings: Vec<Vec<f32>> = Vec::with_capacity(texts.len());

    for batch in texts.chunks(config.batch_size.max(1)) {
        let body = serde_json::json!({
            "model": model,
            "input": batch,
        });

        let mut attempt = 0u32;
        loop {
            let response = client
                .post("https://api.openai.com/v1/embeddings")
                .bearer_auth(&api_key)
                .json(&body)
                .send()
                .await;

            match response {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        let parsed: serde_json::Value = response.json().await?;
                        let data = parsed["data"]
                            .as_array()
                            .ok_or_else(|| anyhow::anyhow!("Malformed embeddings response"))?;
                        for item in data {
                            let vec: Vec<f32> = item["embedding"]
                                .as_array()
                                .ok_or_else(|| anyhow::anyhow!("Malformed embedding vector"))?
                                .iter()
                                .filter_map(|v| v.as_f64())
                                .map(|v| v as f32)
                                .collect();
                            all_embeddings.push(vec);
                        }
                        break;
                    }

                    let retryable = status.as_u16() == 429 || status.is_server_error();
                    if !retryable {
                        bail!("Embeddings API error: HTTP {}", status);
                    }
                    if attempt >= config.max_retries {
                        bail!("Embeddings API error after {} retries: HTTP {}", attempt, status);
                    }
                }
                Err(err) => {
                    if attempt >= config.max_retries {
                        return Err(err.into());
                    }
                }
            }

            let backoff = Duration::from_secs(1u64 << attempt.min(5));
            tokio::time::sleep(backoff).await;
            attempt += 1;
        }
    }

    Ok(all_embeddings)
}

/// Cosine similarity between two vectors; 0.0 when either is degenerate.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

/// Encode a vector as little-endian bytes for SQLite BLOB storage.
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut blob = Vec::with_capacity(vec.len() * 4);
    for value in vec {
        blob.extend_from_slice(&value.to_le_bytes());
    }
    blob
}

/// Decode a SQLite BLOB back into a vector.
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|bytes| f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cosine_identical_vectors() {
        let v = vec![0.5, 0.25, 0.1];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_orthogonal_vectors() {
        let a = vec![1.0, 0.0];
        let b = vec![0.0, 1.0];
        assert!(cosine_similarity(&a, &b).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_degenerate_inputs() {
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 2.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 1.0]), 0.0);
    }

    #[test]
    fn test_blob_round_trip() {
        let v = vec![1.5f32, -2.25, 0.0, 3.75];
        let blob = vec_to_blob(&v);
        assert_eq!(blob.len(), 16);
        assert_eq!(blob_to_vec(&blob), v);
    }
}
