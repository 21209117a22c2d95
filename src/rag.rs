//! Hybrid retrieval engine: BM25 lexical search + semantic search fused
//! with Reciprocal Rank Fusion.
//!
//! The chunk corpus lives in SQLite (upsert semantics keyed on the
//! deterministic chunk id). The BM25 index is an in-memory structure
//! rebuilt wholesale from the corpus; rebuilds construct a fresh index and
//! swap it in behind an `RwLock` so concurrent queries never observe a
//! torn index, only a briefly stale one.
//!
//! Semantic search uses cosine similarity against stored vectors when an
//! embedding provider is configured. Without one it degrades to a
//! token-overlap scorer (|intersection| / |union|) — a fallback, not a
//! production backend.

use anyhow::Result;
use chrono::{SecondsFormat, Utc};
use sqlx::{Row, SqlitePool};
use std::collections::{HashMap, HashSet};
use tokio::sync::RwLock;

use crate::config::EmbeddingConfig;
use crate::embedding;
use crate::models::{Chunk, SearchResult};

/// BM25 parameters, standard Okapi tuning.
const BM25_K1: f64 = 1.2;
const BM25_B: f64 = 0.75;

/// RRF smoothing constant.
pub const RRF_K: usize = 60;

pub fn tokenize(text: &str) -> Vec<String> {
    text.split_whitespace()
        .map(|token| {
            token
                .trim_matches(|c: char| !c.is_alphanumeric())
                .to_lowercase()
        })
        .filter(|token| !token.is_empty())
        .collect()
}

/// Immutable BM25 index over the whole chunk corpus.
struct Bm25Index {
    ids: Vec<String>,
    term_freqs: Vec<HashMap<String, usize>>,
    doc_lens: Vec<usize>,
    doc_freq: HashMap<String, usize>,
    avg_doc_len: f64,
}

impl Bm25Index {
    fn build(docs: Vec<(String, String)>) -> Self {
        let mut ids = Vec::with_capacity(docs.len());
        let mut term_freqs = Vec::with_capacity(docs.len());
        let mut doc_lens = Vec::with_capacity(docs.len());
        let mut doc_freq: HashMap<String, usize> = HashMap::new();

        for (id, text) in docs {
            let tokens = tokenize(&text);
            let mut freqs: HashMap<String, usize> = HashMap::new();
            for token in &tokens {
                *freqs.entry(token.clone()).or_insert(0) += 1;
            }
            for term in freqs.keys() {
                *doc_freq.entry(term.clone()).or_insert(0) += 1;
            }
            ids.push(id);
            doc_lens.push(tokens.len());
            term_freqs.push(freqs);
        }

        let total_len: usize = doc_lens.iter().sum();
        let avg_doc_len = if ids.is_empty() {
            0.0
        } else {
            total_len as f64 / ids.len() as f64
        };

        Self {
            ids,
            term_freqs,
            doc_lens,
            doc_freq,
            avg_doc_len,
        }
    }

    fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Okapi BM25 score of each document against the query tokens.
    fn scores(&self, query_tokens: &[String]) -> Vec<f64> {
        let n = self.ids.len() as f64;
        let mut scores = vec![0.0f64; self.ids.len()];

        for term in query_tokens {
            let Some(&df) = self.doc_freq.get(term) else {
                continue;
            };
            let idf = (((n - df as f64 + 0.5) / (df as f64 + 0.5)) + 1.0).ln();

            for (idx, freqs) in self.term_freqs.iter().enumerate() {
                let Some(&tf) = freqs.get(term) else {
                    continue;
                };
                let tf = tf as f64;
                let doc_len = self.doc_lens[idx] as f64;
                let norm = if self.avg_doc_len > 0.0 {
                    1.0 - BM25_B + BM25_B * doc_len / self.avg_doc_len
                } else {
                    1.0
                };
                scores[idx] += idf * (tf * (BM25_K1 + 1.0)) / (tf + BM25_K1 * norm);
            }
        }

        scores
    }
}

pub struct RetrievalEngine {
    pool: SqlitePool,
    embedding: EmbeddingConfig,
    bm25: RwLock<Option<Bm25Index>>,
}

impl RetrievalEngine {
    pub fn new(pool: SqlitePool, embedding: EmbeddingConfig) -> Self {
        Self {
            pool,
            embedding,
            bm25: RwLock::new(None),
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Upsert chunks into the store (and their embeddings when a provider
    /// is enabled), then rebuild the lexical index over the full corpus.
    pub async fn add_documents(&self, chunks: &[Chunk]) -> Result<()> {
        if chunks.is_empty() {
            return Ok(());
        }
        let now = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);

        let mut tx = self.pool.begin().await?;
        for chunk in chunks {
            sqlx::query(
                "INSERT OR REPLACE INTO chunks(id, text, metadata_json, created_at) VALUES (?, ?, ?, ?)",
            )
            .bind(&chunk.id)
            .bind(&chunk.text)
            .bind(serde_json::to_string(&chunk.metadata)?)
            .bind(&now)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        if self.embedding.is_enabled() {
            let texts: Vec<String> = chunks.iter().map(|chunk| chunk.text.clone()).collect();
            let vectors = embedding::embed_texts(&self.embedding, &texts).await?;
            let model = self.embedding.model.clone().unwrap_or_default();
            let mut tx = self.pool.begin().await?;
            for (chunk, vector) in chunks.iter().zip(vectors.iter()) {
                sqlx::query(
                    "INSERT OR REPLACE INTO chunk_vectors(chunk_id, embedding, model, updated_at) VALUES (?, ?, ?, ?)",
                )
                .bind(&chunk.id)
                .bind(embedding::vec_to_blob(vector))
                .bind(&model)
                .bind(&now)
                .execute(&mut *tx)
                .await?;
            }
            tx.commit().await?;
        }

        self.rebuild_lexical_index().await
    }

    /// Reload the BM25 index from the chunk store. O(corpus); safe to call
    /// after every batch. The new index is built off to the side and
    /// swapped in atomically.
    pub async fn rebuild_lexical_index(&self) -> Result<()> {
        let rows = sqlx::query("SELECT id, text FROM chunks")
            .fetch_all(&self.pool)
            .await?;
        let docs: Vec<(String, String)> = rows
            .into_iter()
            .map(|row| (row.get::<String, _>("id"), row.get::<String, _>("text")))
            .collect();

        let index = Bm25Index::build(docs);
        let mut guard = self.bm25.write().await;
        *guard = Some(index);
        Ok(())
    }

    pub async fn get_chunk(&self, chunk_id: &str) -> Result<Option<SearchResult>> {
        let row = sqlx::query("SELECT id, text, metadata_json FROM chunks WHERE id = ?")
            .bind(chunk_id)
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        Ok(Some(SearchResult {
            chunk_id: row.get("id"),
            text: row.get("text"),
            metadata: serde_json::from_str(&row.get::<String, _>("metadata_json"))
                .unwrap_or_default(),
            score: 0.0,
        }))
    }

    pub async fn count_chunks(&self) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    async fn fetch_corpus(&self, ticker: Option<&str>) -> Result<Vec<SearchResult>> {
        let rows = match ticker {
            Some(ticker) => {
                sqlx::query(
                    "SELECT id, text, metadata_json FROM chunks \
                     WHERE json_extract(metadata_json, '$.ticker') = ?",
                )
                .bind(ticker.to_uppercase())
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query("SELECT id, text, metadata_json FROM chunks")
                    .fetch_all(&self.pool)
                    .await?
            }
        };

        Ok(rows
            .into_iter()
            .map(|row| SearchResult {
                chunk_id: row.get("id"),
                text: row.get("text"),
                metadata: serde_json::from_str(&row.get::<String, _>("metadata_json"))
                    .unwrap_or_default(),
                score: 0.0,
            })
            .collect())
    }

    /// Semantic channel: cosine similarity against stored vectors, or the
    /// degraded token-overlap scorer when embeddings are disabled.
    pub async fn semantic_search(
        &self,
        query: &str,
        top_k: usize,
        ticker: Option<&str>,
    ) -> Result<Vec<SearchResult>> {
        if self.embedding.is_enabled() {
            return self.semantic_search_vectors(query, top_k, ticker).await;
        }

        let query_tokens: HashSet<String> = tokenize(query).into_iter().collect();
        if query_tokens.is_empty() {
            return Ok(Vec::new());
        }

        let mut results: Vec<SearchResult> = self
            .fetch_corpus(ticker)
            .await?
            .into_iter()
            .filter_map(|mut result| {
                let chunk_tokens: HashSet<String> = tokenize(&result.text).into_iter().collect();
                if chunk_tokens.is_empty() {
                    return None;
                }
                let intersection = query_tokens.intersection(&chunk_tokens).count();
                let union = query_tokens.union(&chunk_tokens).count().max(1);
                let score = intersection as f64 / union as f64;
                if score > 0.0 {
                    result.score = score;
                    Some(result)
                } else {
                    None
                }
            })
            .collect();

        sort_ranked(&mut results);
        results.truncate(top_k);
        Ok(results)
    }

    async fn semantic_search_vectors(
        &self,
        query: &str,
        top_k: usize,
        ticker: Option<&str>,
    ) -> Result<Vec<SearchResult>> {
        let query_vec = embedding::embed_query(&self.embedding, query).await?;

        let sql = match ticker {
            Some(_) => {
                "SELECT cv.chunk_id, cv.embedding, c.text, c.metadata_json \
                 FROM chunk_vectors cv JOIN chunks c ON c.id = cv.chunk_id \
                 WHERE json_extract(c.metadata_json, '$.ticker') = ?"
            }
            None => {
                "SELECT cv.chunk_id, cv.embedding, c.text, c.metadata_json \
                 FROM chunk_vectors cv JOIN chunks c ON c.id = cv.chunk_id"
            }
        };
        let mut query_builder = sqlx::query(sql);
        if let Some(ticker) = ticker {
            query_builder = query_builder.bind(ticker.to_uppercase());
        }
        let rows = query_builder.fetch_all(&self.pool).await?;

        let mut results: Vec<SearchResult> = rows
            .into_iter()
            .map(|row| {
                let blob: Vec<u8> = row.get("embedding");
                let vector = embedding::blob_to_vec(&blob);
                SearchResult {
                    chunk_id: row.get("chunk_id"),
                    text: row.get("text"),
                    metadata: serde_json::from_str(&row.get::<String, _>("metadata_json"))
                        .unwrap_or_default(),
                    score: embedding::cosine_similarity(&query_vec, &vector) as f64,
                }
            })
            .collect();

        sort_ranked(&mut results);
        results.truncate(top_k);
        Ok(results)
    }

    /// Lexical channel: BM25 over the swapped-in index, or raw
    /// intersection-count scoring when the index is unavailable or a
    /// ticker filter applies.
    pub async fn keyword_search(
        &self,
        query: &str,
        top_k: usize,
        ticker: Option<&str>,
    ) -> Result<Vec<SearchResult>> {
        let query_tokens = tokenize(query);
        if query_tokens.is_empty() {
            return Ok(Vec::new());
        }

        if ticker.is_none() {
            let guard = self.bm25.read().await;
            if let Some(index) = guard.as_ref() {
                if !index.is_empty() {
                    let scores = index.scores(&query_tokens);
                    let mut ranked: Vec<(String, f64)> = index
                        .ids
                        .iter()
                        .cloned()
                        .zip(scores)
                        .filter(|(_, score)| *score > 0.0)
                        .collect();
                    ranked.sort_by(|a, b| {
                        b.1.partial_cmp(&a.1)
                            .unwrap_or(std::cmp::Ordering::Equal)
                            .then_with(|| a.0.cmp(&b.0))
                    });
                    ranked.truncate(top_k);
                    drop(guard);

                    let mut results = Vec::with_capacity(ranked.len());
                    for (chunk_id, score) in ranked {
                        if let Some(mut result) = self.get_chunk(&chunk_id).await? {
                            result.score = score;
                            results.push(result);
                        }
                    }
                    return Ok(results);
                }
            }
        }

        // Fallback lexical scoring, also the ticker-filtered path.
        let query_set: HashSet<String> = query_tokens.into_iter().collect();
        let mut results: Vec<SearchResult> = self
            .fetch_corpus(ticker)
            .await?
            .into_iter()
            .filter_map(|mut result| {
                let chunk_tokens: HashSet<String> = tokenize(&result.text).into_iter().collect();
                let overlap = query_set.intersection(&chunk_tokens).count();
                if overlap > 0 {
                    result.score = overlap as f64;
                    Some(result)
                } else {
                    None
                }
            })
            .collect();

        sort_ranked(&mut results);
        results.truncate(top_k);
        Ok(results)
    }

    /// Fused query over both channels.
    pub async fn query(
        &self,
        query_text: &str,
        top_k: usize,
        ticker: Option<&str>,
    ) -> Result<Vec<SearchResult>> {
        let semantic = self.semantic_search(query_text, top_k, ticker).await?;
        let keyword = self.keyword_search(query_text, top_k, ticker).await?;
        Ok(reciprocal_rank_fusion(&semantic, &keyword, top_k, RRF_K))
    }
}

/// Sort scored results descending, chunk id ascending on ties, so identical
/// inputs always produce identical output order.
fn sort_ranked(results: &mut [SearchResult]) {
    results.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.chunk_id.cmp(&b.chunk_id))
    });
}

/// Reciprocal Rank Fusion of two independently ranked lists.
///
/// Each list contributes `1/(k + rank)` (rank starting at 1) to the fused
/// score of a chunk id; ids absent from a list contribute nothing from it.
/// Ties break deterministically by first appearance (semantic list first),
/// matching a stable sort over insertion order. The first result object
/// seen for an id supplies text/metadata — chunk content is immutable per
/// id, so either source is equivalent.
pub fn reciprocal_rank_fusion(
    semantic_results: &[SearchResult],
    keyword_results: &[SearchResult],
    top_k: usize,
    k: usize,
) -> Vec<SearchResult> {
    let mut scores: HashMap<&str, f64> = HashMap::new();
    let mut lookup: HashMap<&str, &SearchResult> = HashMap::new();
    let mut order: Vec<&str> = Vec::new();

    for list in [semantic_results, keyword_results] {
        for (rank, result) in list.iter().enumerate() {
            let id = result.chunk_id.as_str();
            let contribution = 1.0 / (k as f64 + (rank + 1) as f64);
            match scores.get_mut(id) {
                Some(score) => *score += contribution,
                None => {
                    scores.insert(id, contribution);
                    lookup.insert(id, result);
                    order.push(id);
                }
            }
        }
    }

    let mut ranked: Vec<&str> = order;
    ranked.sort_by(|a, b| {
        scores[b]
            .partial_cmp(&scores[a])
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    ranked.truncate(top_k);

    ranked
        .into_iter()
        .map(|id| {
            let base = lookup[id];
            SearchResult {
                chunk_id: base.chunk_id.clone(),
                text: base.text.clone(),
                metadata: base.metadata.clone(),
                score: scores[id],
            }
        })
        .collect()
}
