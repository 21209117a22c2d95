use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub provider: ProviderConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub state_path: PathBuf,
    pub checkpoint_path: PathBuf,
    pub rag_path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PipelineConfig {
    #[serde(default)]
    pub tickers: Vec<String>,
    #[serde(default = "default_market")]
    pub market: String,
    #[serde(default)]
    pub exchange: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            tickers: Vec::new(),
            market: default_market(),
            exchange: String::new(),
        }
    }
}

fn default_market() -> String {
    "US_SEC".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    /// Results returned by each retrieval channel and by the fused list.
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    /// RRF smoothing constant.
    #[serde(default = "default_rrf_k")]
    pub rrf_k: usize,
    /// Fused contexts handed to metric derivation.
    #[serde(default = "default_derive_context_k")]
    pub derive_context_k: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            rrf_k: default_rrf_k(),
            derive_context_k: default_derive_context_k(),
        }
    }
}

fn default_top_k() -> usize {
    8
}
fn default_rrf_k() -> usize {
    60
}
fn default_derive_context_k() -> usize {
    4
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_embedding_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_embedding_provider(),
            model: None,
            dims: None,
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_embedding_provider() -> String {
    "disabled".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct ModelConfig {
    /// Preferred model, tried before the built-in candidate list.
    #[serde(default)]
    pub model: Option<String>,
    /// Environment variable holding the API key.
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            model: None,
            api_key_env: default_api_key_env(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_api_key_env() -> String {
    "GEMINI_API_KEY".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProviderConfig {
    /// Identity string sent as the SEC User-Agent, e.g. "Jane Doe jane@example.com".
    #[serde(default = "default_sec_identity")]
    pub sec_identity: String,
    #[serde(default = "default_provider_timeout")]
    pub timeout_secs: u64,
    /// On-disk cache for the EDGAR ticker→CIK mapping.
    #[serde(default = "default_ticker_cache")]
    pub ticker_cache_path: PathBuf,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            sec_identity: default_sec_identity(),
            timeout_secs: default_provider_timeout(),
            ticker_cache_path: default_ticker_cache(),
        }
    }
}

fn default_sec_identity() -> String {
    "Unknown unknown@example.com".to_string()
}
fn default_provider_timeout() -> u64 {
    20
}
fn default_ticker_cache() -> PathBuf {
    PathBuf::from("data/company_tickers_cache.json")
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    let config: Config = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_config_gets_defaults() {
        let raw = r#"
[db]
state_path = "data/state.db"
checkpoint_path = "data/checkpoints.db"
rag_path = "data/rag.db"
"#;
        let config: Config = toml::from_str(raw).unwrap();
        assert_eq!(config.pipeline.market, "US_SEC");
        assert_eq!(config.retrieval.top_k, 8);
        assert_eq!(config.retrieval.rrf_k, 60);
        assert_eq!(config.retrieval.derive_context_k, 4);
        assert_eq!(config.embedding.provider, "disabled");
        assert!(!config.embedding.is_enabled());
        assert_eq!(config.model.api_key_env, "GEMINI_API_KEY");
    }

    #[test]
    fn test_full_config_overrides() {
        let raw = r#"
[db]
state_path = "s.db"
checkpoint_path = "c.db"
rag_path = "r.db"

[pipeline]
tickers = ["AAPL", "MSFT"]
market = "IN_NSE"
exchange = "NSE"

[retrieval]
top_k = 12
rrf_k = 20

[embedding]
provider = "openai"
model = "text-embedding-3-small"
dims = 1536
"#;
        let config: Config = toml::from_str(raw).unwrap();
        assert_eq!(config.pipeline.tickers.len(), 2);
        assert_eq!(config.retrieval.rrf_k, 20);
        assert!(config.embedding.is_enabled());
        assert_eq!(config.embedding.dims, Some(1536));
    }
}
