//! Embedding provider abstraction and implementations (C2).
//!
//! Three backends, selected by `EMBEDDING_BACKEND`:
//! - **[`hash`]** — deterministic SHA-256-derived pseudo-embedding. No
//!   network, no model weights; used for tests and as the `fallback_hash`
//!   path when a real backend is unavailable.
//! - **local** — runs a sentence-embedding model in-process via `fastembed`
//!   (primary) or `tract-onnx` (musl / Intel Mac fallback). Models are
//!   downloaded once and cached process-wide behind [`LOCAL_MODEL_CACHE`].
//! - **remote** — calls an OpenAI-compatible `POST {endpoint}/embeddings`
//!   API with exponential backoff retry.
//!
//! [`normalize_vector_dim`] pads or truncates any embedding to the
//! library's configured dimensionality, since a library's vectors must all
//! compare at the same length regardless of which backend produced them.

#[cfg(feature = "local-embeddings-tract")]
mod local_tract;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Result};
use once_cell::sync::OnceLock;
use sha2::{Digest, Sha256};

use crate::config::EmbeddingConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmbeddingBackendKind {
    Hash,
    Local,
    Remote,
}

pub async fn embed_texts(config: &EmbeddingConfig, texts: &[String]) -> Result<Vec<Vec<f32>>> {
    if texts.is_empty() {
        return Ok(Vec::new());
    }
    match config.backend {
        EmbeddingBackendKind::Hash => Ok(texts.iter().map(|t| hash_embed(t, config.dims)).collect()),
        EmbeddingBackendKind::Remote => match embed_remote(config, texts).await {
            Ok(v) => Ok(v),
            Err(e) if config.fallback_hash => {
                tracing::warn!(error = %e, "remote embedding failed, falling back to hash backend");
                Ok(texts.iter().map(|t| hash_embed(t, config.dims)).collect())
            }
            Err(e) => Err(e),
        },
        EmbeddingBackendKind::Local => match embed_local(config, texts).await {
            Ok(v) => Ok(v),
            Err(e) if config.fallback_hash => {
                tracing::warn!(error = %e, "local embedding failed, falling back to hash backend");
                Ok(texts.iter().map(|t| hash_embed(t, config.dims)).collect())
            }
            Err(e) => Err(e),
        },
    }
}

pub async fn embed_query(config: &EmbeddingConfig, text: &str) -> Result<Vec<f32>> {
    let results = embed_texts(config, &[text.to_string()]).await?;
    results
        .into_iter()
        .next()
        .ok_or_else(|| anyhow::anyhow!("empty embedding response"))
}

// ============ Hash backend ============

/// Deterministic pseudo-embedding: repeatedly hash `text || counter` and
/// turn the digest bytes into signed floats in `[-1.0, 1.0]`, then L2
/// normalize. Same text always yields the same vector.
fn hash_embed(text: &str, dims: usize) -> Vec<f32> {
    let mut out = Vec::with_capacity(dims);
    let mut counter: u32 = 0;
    while out.len() < dims {
        let mut hasher = Sha256::new();
        hasher.update(text.as_bytes());
        hasher.update(counter.to_le_bytes());
        let digest = hasher.finalize();
        for byte in digest.iter() {
            if out.len() >= dims {
                break;
            }
            out.push((*byte as f32 / 127.5) - 1.0);
        }
        counter += 1;
    }
    normalize_l2(out)
}

// ============ Local backend ============

struct LocalModelHandle {
    model_name: String,
    dims: usize,
}

type LocalModelCache = Mutex<HashMap<(String, String), Arc<LocalModelHandle>>>;
static LOCAL_MODEL_CACHE: OnceLock<LocalModelCache> = OnceLock::new();

fn local_model_cache() -> &'static LocalModelCache {
    LOCAL_MODEL_CACHE.get_or_init(|| Mutex::new(HashMap::new()))
}

fn resolve_local_dims(model_name: &str) -> usize {
    match model_name {
        "all-minilm-l6-v2" => 384,
        "bge-small-en-v1.5" => 384,
        "bge-base-en-v1.5" => 768,
        "bge-large-en-v1.5" => 1024,
        "nomic-embed-text-v1" | "nomic-embed-text-v1.5" => 768,
        "multilingual-e5-small" => 384,
        "multilingual-e5-base" => 768,
        "multilingual-e5-large" => 1024,
        _ => 384,
    }
}

/// Ensures at most one model load for a given `(model_name, device)` pair
/// across the process, then dispatches to whichever local feature is
/// compiled in.
async fn embed_local(config: &EmbeddingConfig, texts: &[String]) -> Result<Vec<Vec<f32>>> {
    let key = (config.model_name.clone(), config.local_device.clone());
    {
        let mut cache = local_model_cache().lock().unwrap();
        cache.entry(key.clone()).or_insert_with(|| {
            Arc::new(LocalModelHandle {
                model_name: config.model_name.clone(),
                dims: resolve_local_dims(&config.model_name),
            })
        });
    }

    #[cfg(feature = "local-embeddings-fastembed")]
    {
        return embed_local_fastembed(config, texts).await;
    }
    #[cfg(all(feature = "local-embeddings-tract", not(feature = "local-embeddings-fastembed")))]
    {
        return local_tract::embed_local_tract(config, texts).await;
    }
    #[cfg(not(any(feature = "local-embeddings-fastembed", feature = "local-embeddings-tract")))]
    {
        bail!(
            "local embedding backend requires one of: --features local-embeddings-fastembed, --features local-embeddings-tract"
        )
    }
}

#[cfg(feature = "local-embeddings-fastembed")]
fn config_to_fastembed_model(name: &str) -> Result<fastembed::EmbeddingModel> {
    match name {
        "all-minilm-l6-v2" => Ok(fastembed::EmbeddingModel::AllMiniLML6V2),
        "bge-small-en-v1.5" => Ok(fastembed::EmbeddingModel::BGESmallENV15),
        "bge-base-en-v1.5" => Ok(fastembed::EmbeddingModel::BGEBaseENV15),
        "bge-large-en-v1.5" => Ok(fastembed::EmbeddingModel::BGELargeENV15),
        "nomic-embed-text-v1" => Ok(fastembed::EmbeddingModel::NomicEmbedTextV1),
        "nomic-embed-text-v1.5" => Ok(fastembed::EmbeddingModel::NomicEmbedTextV15),
        "multilingual-e5-small" => Ok(fastembed::EmbeddingModel::MultilingualE5Small),
        "multilingual-e5-base" => Ok(fastembed::EmbeddingModel::MultilingualE5Base),
        "multilingual-e5-large" => Ok(fastembed::EmbeddingModel::MultilingualE5Large),
        other => bail!("unknown local embedding model '{other}'"),
    }
}

#[cfg(feature = "local-embeddings-fastembed")]
async fn embed_local_fastembed(config: &EmbeddingConfig, texts: &[String]) -> Result<Vec<Vec<f32>>> {
    let model_name = config.model_name.clone();
    let fastembed_model = config_to_fastembed_model(&model_name)?;
    let batch_size = config.batch_size;
    let texts = texts.to_vec();

    tokio::task::spawn_blocking(move || {
        let mut model = fastembed::TextEmbedding::try_new(
            fastembed::InitOptions::new(fastembed_model).with_show_download_progress(true),
        )
        .map_err(|e| anyhow::anyhow!("failed to initialize local embedding model: {e}"))?;

        model
            .embed(texts, Some(batch_size))
            .map_err(|e| anyhow::anyhow!("local embedding failed: {e}"))
    })
    .await?
}

// ============ Remote backend ============

async fn embed_remote(config: &EmbeddingConfig, texts: &[String]) -> Result<Vec<Vec<f32>>> {
    let endpoint = config
        .endpoint_url
        .as_deref()
        .ok_or_else(|| anyhow::anyhow!("EMBEDDING_ENDPOINT_URL is required for the remote backend"))?;

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(30))
        .build()?;

    let body = serde_json::json!({
        "model": config.model_name,
        "input": texts,
    });

    let url = format!("{}/embeddings", endpoint.trim_end_matches('/'));
    let mut last_err = None;

    for attempt in 0..=5 {
        if attempt > 0 {
            let delay = Duration::from_secs(1 << (attempt - 1).min(5));
            tokio::time::sleep(delay).await;
        }

        let mut req = client.post(&url).json(&body);
        if let Some(api_key) = &config.api_key {
            req = req.header("Authorization", format!("Bearer {api_key}"));
        }

        match req.send().await {
            Ok(response) => {
                let status = response.status();
                if status.is_success() {
                    let json: serde_json::Value = response.json().await?;
                    return parse_remote_response(&json);
                }
                if status.as_u16() == 429 || status.is_server_error() {
                    let body_text = response.text().await.unwrap_or_default();
                    last_err = Some(anyhow::anyhow!("embedding endpoint error {status}: {body_text}"));
                    continue;
                }
                let body_text = response.text().await.unwrap_or_default();
                bail!("embedding endpoint error {status}: {body_text}");
            }
            Err(e) => {
                last_err = Some(e.into());
                continue;
            }
        }
    }

    Err(last_err.unwrap_or_else(|| anyhow::anyhow!("embedding request failed after retries")))
}

fn parse_remote_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| anyhow::anyhow!("invalid embedding response: missing data array"))?;

    let mut embeddings = Vec::with_capacity(data.len());
    for item in data {
        let embedding = item
            .get("embedding")
            .and_then(|e| e.as_array())
            .ok_or_else(|| anyhow::anyhow!("invalid embedding response: missing embedding"))?;
        let vec: Vec<f32> = embedding.iter().map(|v| v.as_f64().unwrap_or(0.0) as f32).collect();
        embeddings.push(vec);
    }
    Ok(embeddings)
}

// ============ Vector utilities ============

pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

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

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }

    dot / denom
}

fn normalize_l2(mut v: Vec<f32>) -> Vec<f32> {
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 1e-9 {
        for x in &mut v {
            *x /= norm;
        }
    }
    v
}

/// Pads with zeros or truncates so every vector compares at exactly `dims`
/// length, regardless of which backend produced it (SPEC_FULL.md §8).
pub fn normalize_vector_dim(v: &[f32], dims: usize) -> Vec<f32> {
    if v.len() == dims {
        return v.to_vec();
    }
    if v.len() > dims {
        return v[..dims].to_vec();
    }
    let mut out = v.to_vec();
    out.resize(dims, 0.0);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vec_blob_roundtrip() {
        let vec = vec![1.0f32, -2.5, 3.125, 0.0, -0.001];
        let blob = vec_to_blob(&vec);
        assert_eq!(blob_to_vec(&blob), vec);
    }

    #[test]
    fn cosine_identical_is_one() {
        let v = vec![1.0, 2.0, 3.0];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn cosine_orthogonal_is_zero() {
        let a = vec![1.0, 0.0, 0.0];
        let b = vec![0.0, 1.0, 0.0];
        assert!(cosine_similarity(&a, &b).abs() < 1e-6);
    }

    #[test]
    fn cosine_different_lengths_is_zero() {
        assert_eq!(cosine_similarity(&[1.0, 2.0], &[1.0]), 0.0);
    }

    #[test]
    fn normalize_pads_short_vectors() {
        assert_eq!(normalize_vector_dim(&[1.0, 2.0], 4), vec![1.0, 2.0, 0.0, 0.0]);
    }

    #[test]
    fn normalize_truncates_long_vectors() {
        assert_eq!(normalize_vector_dim(&[1.0, 2.0, 3.0], 2), vec![1.0, 2.0]);
    }

    #[test]
    fn normalize_is_idempotent() {
        let once = normalize_vector_dim(&[1.0, 2.0, 3.0], 5);
        let twice = normalize_vector_dim(&once, 5);
        assert_eq!(once, twice);
    }

    #[test]
    fn hash_embed_is_deterministic() {
        let a = hash_embed("hello world", 16);
        let b = hash_embed("hello world", 16);
        assert_eq!(a, b);
        assert_eq!(a.len(), 16);
    }

    #[test]
    fn hash_embed_differs_by_text() {
        let a = hash_embed("hello", 16);
        let b = hash_embed("goodbye", 16);
        assert_ne!(a, b);
    }
}
