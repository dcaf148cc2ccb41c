//! External chat/rerank adapters (C10).
//!
//! Mirrors the embedding provider's shape from `embedding/mod.rs`: an
//! HTTP-backed implementation per provider, plus a deterministic local
//! fallback used when no provider is configured or the remote call fails.
//! The local fallback never invents content — it echoes retrieved
//! snippets, so tests and examples have something deterministic to assert
//! against without a live network call.

use anyhow::{bail, Result};
use async_trait::async_trait;
use futures::StreamExt;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;

use crate::models::ProviderConfig;
use crate::secrets::decrypt_secret;
use crate::tokenize::tokenize_for_search;

#[derive(Debug, Clone)]
pub struct ChatTurn {
    pub role: &'static str,
    pub content: String,
}

#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatTurn>,
    pub temperature: f64,
    pub top_p: f64,
    pub max_tokens: i64,
}

#[derive(Debug, Clone)]
pub struct ChatResponse {
    pub content: String,
}

#[derive(Debug, Clone)]
pub struct RerankRequest {
    pub query: String,
    pub documents: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct RerankItem {
    pub index: usize,
    pub score: f64,
}

#[derive(Debug, Clone)]
pub struct RerankResponse {
    pub items: Vec<RerankItem>,
}

#[async_trait]
pub trait ChatAdapter: Send + Sync {
    async fn chat(&self, config: &ProviderConfig, request: &ChatRequest) -> Result<ChatResponse>;

    /// Streams the reply as a lazy sequence of delta fragments pushed onto
    /// `tx`, for as long as the adapter and the receiver both stay alive.
    /// Returns once the reply is complete (or the call fails); the caller
    /// accumulates `full_content` from the received deltas.
    async fn chat_stream(&self, config: &ProviderConfig, request: &ChatRequest, tx: mpsc::Sender<String>) -> Result<()>;
}

#[async_trait]
pub trait RerankAdapter: Send + Sync {
    async fn rerank(&self, config: &ProviderConfig, request: &RerankRequest) -> Result<RerankResponse>;
}

/// Generic OpenAI-compatible chat/completions adapter, used for both the
/// `openai` provider type and any self-hosted endpoint that mimics it.
pub struct HttpChatAdapter {
    client: reqwest::Client,
    encryption_key: String,
}

impl HttpChatAdapter {
    pub fn new(encryption_key: String) -> Self {
        Self { client: reqwest::Client::new(), encryption_key }
    }
}

#[derive(Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatCompletionChoice>,
}

#[derive(Deserialize)]
struct ChatCompletionChoice {
    message: ChatCompletionMessage,
}

#[derive(Deserialize)]
struct ChatCompletionMessage {
    content: String,
}

#[derive(Deserialize)]
struct ChatCompletionChunk {
    choices: Vec<ChatCompletionChunkChoice>,
}

#[derive(Deserialize)]
struct ChatCompletionChunkChoice {
    delta: ChatCompletionDelta,
}

#[derive(Deserialize)]
struct ChatCompletionDelta {
    content: Option<String>,
}

fn chat_completion_body(request: &ChatRequest, stream: bool) -> serde_json::Value {
    json!({
        "model": request.model,
        "messages": request.messages.iter().map(|m| json!({"role": m.role, "content": m.content})).collect::<Vec<_>>(),
        "temperature": request.temperature,
        "top_p": request.top_p,
        "max_tokens": request.max_tokens,
        "stream": stream,
    })
}

#[async_trait]
impl ChatAdapter for HttpChatAdapter {
    async fn chat(&self, config: &ProviderConfig, request: &ChatRequest) -> Result<ChatResponse> {
        let base_url = config.base_url.clone().unwrap_or_else(|| "https://api.openai.com/v1".to_string());
        let api_key = decrypt_secret(&config.api_key_encrypted, &self.encryption_key)?;

        let response = self
            .client
            .post(format!("{base_url}/chat/completions"))
            .bearer_auth(api_key)
            .json(&chat_completion_body(request, false))
            .send()
            .await?;

        if !response.status().is_success() {
            bail!("chat provider returned status {}", response.status());
        }

        let parsed: ChatCompletionResponse = response.json().await?;
        let content = parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .unwrap_or_default();
        Ok(ChatResponse { content })
    }

    async fn chat_stream(&self, config: &ProviderConfig, request: &ChatRequest, tx: mpsc::Sender<String>) -> Result<()> {
        let base_url = config.base_url.clone().unwrap_or_else(|| "https://api.openai.com/v1".to_string());
        let api_key = decrypt_secret(&config.api_key_encrypted, &self.encryption_key)?;

        let response = self
            .client
            .post(format!("{base_url}/chat/completions"))
            .bearer_auth(api_key)
            .json(&chat_completion_body(request, true))
            .send()
            .await?;

        if !response.status().is_success() {
            bail!("chat provider returned status {}", response.status());
        }

        let mut byte_stream = response.bytes_stream();
        let mut buffer = String::new();
        while let Some(chunk) = byte_stream.next().await {
            buffer.push_str(&String::from_utf8_lossy(&chunk?));
            while let Some(pos) = buffer.find("\n\n") {
                let frame: String = buffer.drain(..pos + 2).collect();
                for line in frame.lines() {
                    let Some(data) = line.strip_prefix("data: ") else { continue };
                    if data.trim() == "[DONE]" {
                        continue;
                    }
                    let Ok(parsed) = serde_json::from_str::<ChatCompletionChunk>(data) else { continue };
                    let Some(content) = parsed.choices.into_iter().next().and_then(|c| c.delta.content) else { continue };
                    if !content.is_empty() && tx.send(content).await.is_err() {
                        return Ok(());
                    }
                }
            }
        }
        Ok(())
    }
}

/// Deterministic local fallback: no LLM call, just a templated echo of the
/// retrieved snippets. Used when no provider is configured or the remote
/// adapter fails after retry.
pub struct LocalChatAdapter;

#[async_trait]
impl ChatAdapter for LocalChatAdapter {
    async fn chat(&self, _config: &ProviderConfig, request: &ChatRequest) -> Result<ChatResponse> {
        let system_content = request
            .messages
            .iter()
            .find(|m| m.role == "system")
            .map(|m| m.content.as_str())
            .unwrap_or("");

        let content = if let Some(start) = system_content.find("RAG_CONTEXT=") {
            let json_part = &system_content[start + "RAG_CONTEXT=".len()..];
            format!("根据检索到的资料：{json_part}")
        } else {
            "未配置外部对话模型，暂无法生成回答。".to_string()
        };
        Ok(ChatResponse { content })
    }

    async fn chat_stream(&self, config: &ProviderConfig, request: &ChatRequest, tx: mpsc::Sender<String>) -> Result<()> {
        let response = self.chat(config, request).await?;
        for piece in chunk_chars(&response.content, 24) {
            if tx.send(piece).await.is_err() {
                break;
            }
        }
        Ok(())
    }
}

/// Splits `text` into chunks of at most `size` characters, preserving
/// multi-byte boundaries. Used to give the local fallback's single echoed
/// reply the same incremental delta shape a real provider stream has.
fn chunk_chars(text: &str, size: usize) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    if chars.is_empty() {
        return Vec::new();
    }
    chars.chunks(size.max(1)).map(|c| c.iter().collect()).collect()
}

/// Lexical-overlap rerank: scores each document by token overlap with the
/// query and returns the same order with those scores when no remote
/// reranker is configured.
pub struct LocalRerankAdapter;

#[async_trait]
impl RerankAdapter for LocalRerankAdapter {
    async fn rerank(&self, _config: &ProviderConfig, request: &RerankRequest) -> Result<RerankResponse> {
        let query_terms: std::collections::HashSet<String> = tokenize_for_search(&request.query).into_iter().collect();
        let items = request
            .documents
            .iter()
            .enumerate()
            .map(|(index, doc)| {
                let doc_terms: std::collections::HashSet<String> = tokenize_for_search(doc).into_iter().collect();
                let overlap = query_terms.intersection(&doc_terms).count();
                let score = if query_terms.is_empty() { 0.0 } else { overlap as f64 / query_terms.len() as f64 };
                RerankItem { index, score }
            })
            .collect();
        Ok(RerankResponse { items })
    }
}

/// Builds the process-wide HTTP chat adapter, used for any session whose
/// resolved provider config is a real (non-local) provider. The per-call
/// choice between this adapter and the deterministic local fallback is made
/// in `chat.rs`, based on the resolved provider's type and on whether the
/// call to this adapter actually succeeds.
pub fn resolve_chat_adapter(encryption_key: String) -> Box<dyn ChatAdapter> {
    Box::new(HttpChatAdapter::new(encryption_key))
}

pub fn local_chat_adapter() -> Box<dyn ChatAdapter> {
    Box::new(LocalChatAdapter)
}

pub fn local_rerank_adapter() -> Box<dyn RerankAdapter> {
    Box::new(LocalRerankAdapter)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn local_chat_echoes_rag_context() {
        let adapter = LocalChatAdapter;
        let config = test_provider_config();
        let request = ChatRequest {
            model: "local".to_string(),
            messages: vec![ChatTurn { role: "system", content: "prelude RAG_CONTEXT=[{\"snippet\":\"hi\"}]".to_string() }],
            temperature: 0.0,
            top_p: 1.0,
            max_tokens: 256,
        };
        let response = adapter.chat(&config, &request).await.unwrap();
        assert!(response.content.contains("根据检索到的资料"));
    }

    #[tokio::test]
    async fn local_chat_stream_chunks_the_echoed_reply() {
        let adapter = LocalChatAdapter;
        let config = test_provider_config();
        let request = ChatRequest {
            model: "local".to_string(),
            messages: vec![ChatTurn { role: "system", content: "prelude RAG_CONTEXT=[{\"snippet\":\"hi\"}]".to_string() }],
            temperature: 0.0,
            top_p: 1.0,
            max_tokens: 256,
        };
        let (tx, mut rx) = mpsc::channel(16);
        adapter.chat_stream(&config, &request, tx).await.unwrap();
        let mut joined = String::new();
        while let Some(piece) = rx.recv().await {
            joined.push_str(&piece);
        }
        assert!(joined.contains("根据检索到的资料"));
    }

    #[test]
    fn chunk_chars_splits_on_character_boundaries_not_bytes() {
        let pieces = chunk_chars("一二三四五", 2);
        assert_eq!(pieces, vec!["一二", "三四", "五"]);
    }

    #[tokio::test]
    async fn local_rerank_scores_by_overlap() {
        let adapter = LocalRerankAdapter;
        let config = test_provider_config();
        let request = RerankRequest {
            query: "rust crate".to_string(),
            documents: vec!["totally unrelated text".to_string(), "a rust crate about retrieval".to_string()],
        };
        let response = adapter.rerank(&config, &request).await.unwrap();
        let best = response.items.iter().max_by(|a, b| a.score.partial_cmp(&b.score).unwrap()).unwrap();
        assert_eq!(best.index, 1);
    }

    fn test_provider_config() -> ProviderConfig {
        ProviderConfig {
            id: uuid::Uuid::new_v4(),
            owner_id: uuid::Uuid::new_v4(),
            provider_type: "openai".to_string(),
            model_name: "gpt-test".to_string(),
            api_key_encrypted: String::new(),
            base_url: None,
            context_window_tokens: 131072,
            is_default: true,
        }
    }
}
