use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub ingestion: IngestionConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub services: ServicesConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct IngestionConfig {
    /// Generate LLM situating prefixes before embedding.
    #[serde(default = "default_contextual")]
    pub contextual_prefixes: bool,
    /// Bounded worker pool size for chunk contextualization.
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Per-chunk deadline for the prefix-generation call, in milliseconds.
    #[serde(default = "default_context_timeout_ms")]
    pub context_timeout_ms: u64,
    #[serde(default = "default_chunk_method")]
    pub chunk_method: String,
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self {
            contextual_prefixes: true,
            workers: default_workers(),
            context_timeout_ms: default_context_timeout_ms(),
            chunk_method: default_chunk_method(),
        }
    }
}

fn default_contextual() -> bool {
    true
}
fn default_workers() -> usize {
    4
}
fn default_context_timeout_ms() -> u64 {
    10_000
}
fn default_chunk_method() -> String {
    "extractor".to_string()
}

/// Retrieval policy. The fusion weights and `rrf_k` are policy choices, not
/// derived values — keep them tunable here rather than fixed in code.
#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_vector_weight")]
    pub vector_weight: f64,
    #[serde(default = "default_keyword_weight")]
    pub keyword_weight: f64,
    #[serde(default = "default_rrf_k")]
    pub rrf_k: i64,
    /// Final result count per search call.
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    /// Fused candidates handed to the reranker.
    #[serde(default = "default_rerank_top_m")]
    pub rerank_top_m: usize,
    #[serde(default = "default_rerank")]
    pub rerank: bool,
    /// Shared deadline for the concurrent sub-searches, in milliseconds.
    #[serde(default = "default_deadline_ms")]
    pub deadline_ms: u64,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            vector_weight: default_vector_weight(),
            keyword_weight: default_keyword_weight(),
            rrf_k: default_rrf_k(),
            top_k: default_top_k(),
            rerank_top_m: default_rerank_top_m(),
            rerank: default_rerank(),
            deadline_ms: default_deadline_ms(),
        }
    }
}

fn default_vector_weight() -> f64 {
    0.6
}
fn default_keyword_weight() -> f64 {
    0.4
}
fn default_rrf_k() -> i64 {
    60
}
fn default_top_k() -> usize {
    10
}
fn default_rerank_top_m() -> usize {
    50
}
fn default_rerank() -> bool {
    true
}
fn default_deadline_ms() -> u64 {
    3_000
}

impl RetrievalConfig {
    /// Each sub-search fetches `2 × top_k` candidates before fusion.
    pub fn candidate_k(&self, top_k: usize) -> i64 {
        (top_k * 2) as i64
    }
}

/// External collaborator endpoints. All calls are fallible and the engine
/// must degrade rather than depend on any of them succeeding.
#[derive(Debug, Deserialize, Clone)]
pub struct ServicesConfig {
    #[serde(default = "default_embedding_model")]
    pub embedding_model: String,
    #[serde(default = "default_embedding_dims")]
    pub embedding_dims: usize,
    #[serde(default = "default_context_model")]
    pub context_model: String,
    #[serde(default)]
    pub rerank_url: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl Default for ServicesConfig {
    fn default() -> Self {
        Self {
            embedding_model: default_embedding_model(),
            embedding_dims: default_embedding_dims(),
            context_model: default_context_model(),
            rerank_url: None,
            timeout_secs: default_timeout_secs(),
            max_retries: default_max_retries(),
        }
    }
}

fn default_embedding_model() -> String {
    "text-embedding-3-small".to_string()
}
fn default_embedding_dims() -> usize {
    1536
}
fn default_context_model() -> String {
    "gpt-4o-mini".to_string()
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_max_retries() -> u32 {
    5
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    let r = &config.retrieval;

    if !(0.0..=1.0).contains(&r.vector_weight) || !(0.0..=1.0).contains(&r.keyword_weight) {
        anyhow::bail!("retrieval weights must be in [0.0, 1.0]");
    }
    let total = r.vector_weight + r.keyword_weight;
    if !(0.99..=1.01).contains(&total) {
        anyhow::bail!("retrieval weights must sum to 1.0, got {}", total);
    }
    if r.rrf_k < 1 {
        anyhow::bail!("retrieval.rrf_k must be >= 1");
    }
    if r.top_k == 0 {
        anyhow::bail!("retrieval.top_k must be >= 1");
    }
    if r.rerank_top_m < r.top_k {
        anyhow::bail!("retrieval.rerank_top_m must be >= retrieval.top_k");
    }
    if config.ingestion.workers == 0 {
        anyhow::bail!("ingestion.workers must be >= 1");
    }
    if config.services.embedding_dims == 0 {
        anyhow::bail!("services.embedding_dims must be > 0");
    }
    Ok(())
}

impl Config {
    /// Minimal config for contexts where no file is available (tests, setup).
    pub fn minimal(db_path: PathBuf) -> Config {
        Config {
            db: DbConfig { path: db_path },
            ingestion: IngestionConfig::default(),
            retrieval: RetrievalConfig::default(),
            services: ServicesConfig::default(),
        }
    }

    /// JSON snapshot stored on runs and documents for reproducibility.
    pub fn snapshot_json(&self) -> String {
        serde_json::json!({
            "ingestion": {
                "contextual_prefixes": self.ingestion.contextual_prefixes,
                "workers": self.ingestion.workers,
                "chunk_method": self.ingestion.chunk_method,
            },
            "retrieval": {
                "vector_weight": self.retrieval.vector_weight,
                "keyword_weight": self.retrieval.keyword_weight,
                "rrf_k": self.retrieval.rrf_k,
                "top_k": self.retrieval.top_k,
                "rerank": self.retrieval.rerank,
            },
            "services": {
                "embedding_model": self.services.embedding_model,
                "embedding_dims": self.services.embedding_dims,
                "context_model": self.services.context_model,
            },
        })
        .to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> Config {
        Config::minimal(PathBuf::from("/tmp/brief.sqlite"))
    }

    #[test]
    fn test_defaults() {
        let c = base_config();
        assert_eq!(c.retrieval.vector_weight, 0.6);
        assert_eq!(c.retrieval.keyword_weight, 0.4);
        assert_eq!(c.retrieval.rrf_k, 60);
        assert_eq!(c.retrieval.top_k, 10);
        assert_eq!(c.retrieval.rerank_top_m, 50);
        assert_eq!(c.ingestion.workers, 4);
        assert!(validate(&c).is_ok());
    }

    #[test]
    fn test_rejects_bad_weights() {
        let mut c = base_config();
        c.retrieval.vector_weight = 0.9;
        // 0.9 + 0.4 != 1.0
        assert!(validate(&c).is_err());
        c.retrieval.vector_weight = 1.5;
        assert!(validate(&c).is_err());
    }

    #[test]
    fn test_rejects_zero_top_k() {
        let mut c = base_config();
        c.retrieval.top_k = 0;
        assert!(validate(&c).is_err());
    }

    #[test]
    fn test_candidate_k_doubles() {
        let c = base_config();
        assert_eq!(c.retrieval.candidate_k(10), 20);
    }
}
