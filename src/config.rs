//! Environment-driven configuration and validation.
//!
//! Unlike the connector-oriented predecessor this crate descends from (which
//! read a TOML file), this service reads its settings from the environment,
//! per the variable list the HTTP surface documents. Validation happens once
//! at startup; a bad value fails fast rather than surfacing later as a
//! confusing retrieval bug.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context as _, Result};

use crate::embedding::EmbeddingBackendKind;

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub secret_key: String,
    pub encryption_key: Option<String>,
    pub jwt_algorithm: String,
    pub jwt_expire_minutes: i64,
    pub storage_root: PathBuf,
    pub kb_sync_root: PathBuf,
    pub embedding: EmbeddingConfig,
    pub cors_origins: Vec<String>,
    pub request_timeout: Duration,
    pub bind_addr: String,
}

#[derive(Debug, Clone)]
pub struct EmbeddingConfig {
    pub backend: EmbeddingBackendKind,
    pub dims: usize,
    pub endpoint_url: Option<String>,
    pub model_name: String,
    pub api_key: Option<String>,
    pub local_device: String,
    pub batch_size: usize,
    pub fallback_hash: bool,
}

/// Baseline retrieval thresholds used when no retrieval profile is resolvable
/// at all (`C6::resolve` with no built-in default present). Mirrors the
/// `settings.rag_min_*` fields the profile service falls back to.
#[derive(Debug, Clone, Copy)]
pub struct RetrievalDefaults {
    pub rag_min_top1_score: f64,
    pub rag_min_support_score: f64,
    pub rag_min_support_count: i64,
    pub rag_min_item_score: f64,
    pub rag_graph_max_terms: i64,
}

impl Default for RetrievalDefaults {
    fn default() -> Self {
        RetrievalDefaults {
            rag_min_top1_score: 0.30,
            rag_min_support_score: 0.18,
            rag_min_support_count: 2,
            rag_min_item_score: 0.10,
            rag_graph_max_terms: 12,
        }
    }
}

impl Config {
    /// The key material passed to `secrets::encrypt_secret`/`decrypt_secret`:
    /// `ENCRYPTION_KEY` when set, else `SECRET_KEY` (which `secrets` then
    /// runs through SHA-256 itself, per SPEC_FULL.md §6).
    pub fn effective_encryption_key(&self) -> String {
        self.encryption_key.clone().unwrap_or_else(|| self.secret_key.clone())
    }
}

pub fn load_config() -> Result<Config> {
    let database_url = env_or("DATABASE_URL", "sqlite://ragforge.db");
    let secret_key = env::var("SECRET_KEY").context("SECRET_KEY must be set")?;
    if secret_key.trim().is_empty() {
        bail!("SECRET_KEY must not be empty");
    }
    let encryption_key = env::var("ENCRYPTION_KEY").ok().filter(|s| !s.is_empty());
    let jwt_algorithm = env_or("JWT_ALGORITHM", "HS256");
    let jwt_expire_minutes: i64 = env_or("JWT_EXPIRE_MINUTES", "60")
        .parse()
        .context("JWT_EXPIRE_MINUTES must be an integer")?;
    if jwt_expire_minutes <= 0 {
        bail!("JWT_EXPIRE_MINUTES must be positive");
    }

    let storage_root = PathBuf::from(env_or("STORAGE_ROOT", "./storage"));
    let kb_sync_root = PathBuf::from(env_or("KB_SYNC_ROOT", "./kb-sync"));

    let dims: usize = env_or("DEFAULT_EMBEDDING_DIM", "1536")
        .parse()
        .context("DEFAULT_EMBEDDING_DIM must be an integer")?;
    if dims == 0 {
        bail!("DEFAULT_EMBEDDING_DIM must be > 0");
    }
    let backend = match env_or("EMBEDDING_BACKEND", "hash").as_str() {
        "hash" => EmbeddingBackendKind::Hash,
        "local" => EmbeddingBackendKind::Local,
        "remote" => EmbeddingBackendKind::Remote,
        other => bail!("EMBEDDING_BACKEND must be one of hash, local, remote (got '{other}')"),
    };
    let batch_size: usize = env_or("EMBEDDING_BATCH_SIZE", "32")
        .parse()
        .context("EMBEDDING_BATCH_SIZE must be an integer")?;
    if batch_size == 0 {
        bail!("EMBEDDING_BATCH_SIZE must be > 0");
    }

    let embedding = EmbeddingConfig {
        backend,
        dims,
        endpoint_url: env::var("EMBEDDING_ENDPOINT_URL").ok(),
        model_name: env_or("EMBEDDING_MODEL_NAME", "all-minilm-l6-v2"),
        api_key: env::var("EMBEDDING_API_KEY").ok(),
        local_device: env_or("EMBEDDING_LOCAL_DEVICE", "cpu"),
        batch_size,
        fallback_hash: env_or("EMBEDDING_FALLBACK_HASH", "true")
            .parse()
            .unwrap_or(true),
    };

    let cors_origins: Vec<String> = env::var("CORS_ORIGINS")
        .unwrap_or_default()
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();

    let request_timeout_secs: u64 = env_or("REQUEST_TIMEOUT_SECONDS", "30")
        .parse()
        .context("REQUEST_TIMEOUT_SECONDS must be an integer")?;
    if request_timeout_secs == 0 {
        bail!("REQUEST_TIMEOUT_SECONDS must be > 0");
    }

    let bind_addr = env_or("BIND_ADDR", "0.0.0.0:8080");

    Ok(Config {
        database_url,
        secret_key,
        encryption_key,
        jwt_algorithm,
        jwt_expire_minutes,
        storage_root,
        kb_sync_root,
        embedding,
        cors_origins,
        request_timeout: Duration::from_secs(request_timeout_secs),
        bind_addr,
    })
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retrieval_defaults_match_documented_values() {
        let d = RetrievalDefaults::default();
        assert_eq!(d.rag_min_top1_score, 0.30);
        assert_eq!(d.rag_min_support_count, 2);
        assert_eq!(d.rag_graph_max_terms, 12);
    }
}
