//! Streaming reply orchestrator (C9): the chat turn pipeline from a saved
//! user message through retrieval, context-window compression, adapter
//! dispatch, and citation persistence.

use chrono::Utc;
use once_cell::sync::Lazy;
use regex::Regex;
use sqlx::{Row, SqlitePool};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::adapters::{
    local_chat_adapter, local_rerank_adapter, ChatAdapter, ChatRequest, ChatResponse, ChatTurn, RerankAdapter, RerankRequest,
};
use crate::config::EmbeddingConfig;
use crate::context_window::{compress_retrieved, CompressionInput};
use crate::error::{AppError, AppResult};
use crate::models::{Citation, ProviderConfig, Role};
use crate::profiles::resolve_config;
use crate::retrieval::{retrieve, RetrievalHit};

static SUMMARY_QUERY_PATTERN: Lazy<Regex> = Lazy::new(|| Regex::new(r"全面|总结|概述|综述|整体介绍").unwrap());

pub fn is_global_summary_query(query: &str) -> bool {
    SUMMARY_QUERY_PATTERN.is_match(query)
}

pub struct GenerateReplyInput<'a> {
    pub user_id: Uuid,
    pub user_role: Role,
    pub session_id: Uuid,
    pub content: &'a str,
    pub library_ids_override: Option<Vec<Uuid>>,
    pub retrieval_profile_id: Option<Uuid>,
    pub provider_config_id: Option<Uuid>,
    pub top_k: usize,
    pub use_rerank: bool,
    pub show_citations: bool,
    pub temperature: f64,
    pub top_p: f64,
    pub max_tokens: i64,
}

struct SessionRow {
    user_id: Uuid,
    provider_config_id: Option<Uuid>,
    library_id: Option<Uuid>,
    retrieval_profile_id: Option<Uuid>,
}

async fn load_session(pool: &SqlitePool, session_id: Uuid) -> AppResult<SessionRow> {
    let row = sqlx::query("SELECT user_id, provider_config_id, library_id, retrieval_profile_id FROM chat_sessions WHERE id = ?")
        .bind(session_id.to_string())
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| AppError::NotFound("chat session not found".to_string()))?;

    let parse_uuid = |value: Option<String>| -> AppResult<Option<Uuid>> {
        value
            .map(|v| Uuid::parse_str(&v).map_err(|e| AppError::Internal(e.to_string())))
            .transpose()
    };

    Ok(SessionRow {
        user_id: Uuid::parse_str(&row.try_get::<String, _>("user_id")?).map_err(|e| AppError::Internal(e.to_string()))?,
        provider_config_id: parse_uuid(row.try_get("provider_config_id")?)?,
        library_id: parse_uuid(row.try_get("library_id")?)?,
        retrieval_profile_id: parse_uuid(row.try_get("retrieval_profile_id")?)?,
    })
}

async fn resolve_libraries(
    pool: &SqlitePool,
    user_id: Uuid,
    user_role: Role,
    session_library_id: Option<Uuid>,
    requested: Option<Vec<Uuid>>,
) -> AppResult<Vec<Uuid>> {
    let candidates: Vec<Uuid> = requested.unwrap_or_else(|| session_library_id.into_iter().collect());
    if candidates.is_empty() {
        return Ok(Vec::new());
    }

    let placeholders = candidates.iter().map(|_| "?").collect::<Vec<_>>().join(",");
    let sql = format!("SELECT id, owner_type, owner_id FROM libraries WHERE id IN ({placeholders})");
    let mut query = sqlx::query(&sql);
    for id in &candidates {
        query = query.bind(id.to_string());
    }
    let rows = query.fetch_all(pool).await?;

    let mut available = Vec::new();
    for row in rows {
        let id = Uuid::parse_str(&row.try_get::<String, _>("id")?).map_err(|e| AppError::Internal(e.to_string()))?;
        let owner_type: String = row.try_get("owner_type")?;
        if owner_type == "shared" {
            available.push(id);
            continue;
        }
        let owner_id: Option<String> = row.try_get("owner_id")?;
        let owner_id = owner_id.map(|v| Uuid::parse_str(&v)).transpose().map_err(|e| AppError::Internal(e.to_string()))?;
        if owner_id == Some(user_id) || user_role == Role::Admin {
            available.push(id);
        }
    }
    Ok(available)
}

async fn insert_message(
    pool: &SqlitePool,
    session_id: Uuid,
    role: &str,
    content: &str,
    citations: &[Citation],
) -> AppResult<()> {
    let citations_json = serde_json::to_string(citations).unwrap_or_else(|_| "[]".to_string());
    sqlx::query(
        "INSERT INTO chat_messages (id, session_id, role, content, citations_json, created_at) VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(Uuid::new_v4().to_string())
    .bind(session_id.to_string())
    .bind(role)
    .bind(content)
    .bind(citations_json)
    .bind(Utc::now().timestamp())
    .execute(pool)
    .await?;
    Ok(())
}

struct HistoryMessage {
    role: String,
    content: String,
}

async fn load_history(pool: &SqlitePool, session_id: Uuid) -> AppResult<Vec<HistoryMessage>> {
    let rows = sqlx::query("SELECT role, content FROM chat_messages WHERE session_id = ? ORDER BY created_at ASC")
        .bind(session_id.to_string())
        .fetch_all(pool)
        .await?;
    rows.into_iter()
        .map(|row| Ok(HistoryMessage { role: row.try_get("role")?, content: row.try_get("content")? }))
        .collect::<AppResult<Vec<_>>>()
}

fn build_system_prompt(retrieved: &[RetrievalHit], summary_mode: bool) -> String {
    if retrieved.is_empty() {
        return "你是企业知识助手。在未选择知识库时，可直接基于模型能力回答用户问题。".to_string();
    }
    let context_json = serde_json::to_string(
        &retrieved.iter().map(|r| r.to_citation()).collect::<Vec<_>>(),
    )
    .unwrap_or_else(|_| "[]".to_string());
    let pretty_json = serde_json::to_string_pretty(
        &retrieved.iter().map(|r| r.to_citation()).collect::<Vec<_>>(),
    )
    .unwrap_or_else(|_| "[]".to_string());

    if summary_mode {
        format!(
            "你是企业知识助手。当前问题属于“全盘总结/概述”类任务。\n请严格遵循：\n1. 必须综合所有检索片段归纳，不得只依据最高分片段\n2. 优先提炼主线、结构、关键事实，再给精炼总结\n3. 若证据有冲突或不足，要明确指出并说明不确定性\n\n知识库检索结果：\n{pretty_json}\nRAG_CONTEXT={context_json}"
        )
    } else {
        format!(
            "你是企业知识助手。请根据知识库检索结果回答用户问题。\n要求：\n1. 如果检索结果与问题相关，请基于检索内容直接回答，不要解释检索过程\n2. 如果检索结果与问题无关或信息不足，请明确告知用户\n3. 对于“数量/名单”问题，只有在片段中出现明确数量或完整名单时，才给出具体数字或完整列表\n4. 回答要简洁准确，避免过度引申\n\n知识库检索结果：\n{pretty_json}\nRAG_CONTEXT={context_json}"
        )
    }
}

pub fn build_no_hit_message() -> String {
    "当前问题未命中所选知识库内容，已停止使用通用大模型兜底回答。\n建议操作：\n1. 使用别名/简称重试（例如：猪八戒、八戒、悟能）\n2. 在知识库页面执行“重建索引”和“重建图谱”\n3. 确认相关文档已上传到当前会话选择的知识库".to_string()
}

async fn rerank_retrieved(
    rerank_adapter: &dyn RerankAdapter,
    query: &str,
    retrieved: Vec<RetrievalHit>,
) -> Vec<RetrievalHit> {
    if retrieved.is_empty() {
        return retrieved;
    }
    let documents: Vec<String> = retrieved.iter().map(|r| r.snippet.clone()).collect();
    let request = RerankRequest { query: query.to_string(), documents };
    match rerank_adapter.rerank(&fallback_provider_config(Uuid::nil()), &request).await {
        Ok(response) => {
            let mut items = response.items;
            items.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
            let mut reordered = Vec::new();
            for item in items {
                if let Some(mut hit) = retrieved.get(item.index).cloned() {
                    hit.score = item.score;
                    reordered.push(hit);
                }
            }
            if reordered.is_empty() { retrieved } else { reordered }
        }
        Err(_) => retrieved,
    }
}

fn fallback_provider_config(owner_id: Uuid) -> ProviderConfig {
    ProviderConfig {
        id: Uuid::nil(),
        owner_id,
        provider_type: "local".to_string(),
        model_name: "local".to_string(),
        api_key_encrypted: String::new(),
        base_url: None,
        context_window_tokens: 131_072,
        is_default: true,
    }
}

/// Picks the requested provider config, falling back to the owner's
/// default, then to any owned config, then to a deterministic local
/// placeholder when the user has none configured at all.
async fn resolve_provider(pool: &SqlitePool, owner_id: Uuid, requested: Option<Uuid>) -> AppResult<ProviderConfig> {
    if let Some(id) = requested {
        let row = sqlx::query(
            "SELECT id, owner_id, provider_type, model_name, api_key_encrypted, base_url, context_window_tokens, is_default \
             FROM provider_configs WHERE id = ? AND owner_id = ?",
        )
        .bind(id.to_string())
        .bind(owner_id.to_string())
        .fetch_optional(pool)
        .await?;
        if let Some(row) = row {
            return row_to_provider_config(&row);
        }
        return Err(AppError::NotFound("provider config not found".to_string()));
    }

    let row = sqlx::query(
        "SELECT id, owner_id, provider_type, model_name, api_key_encrypted, base_url, context_window_tokens, is_default \
         FROM provider_configs WHERE owner_id = ? ORDER BY is_default DESC LIMIT 1",
    )
    .bind(owner_id.to_string())
    .fetch_optional(pool)
    .await?;

    match row {
        Some(row) => row_to_provider_config(&row),
        None => Ok(fallback_provider_config(owner_id)),
    }
}

fn row_to_provider_config(row: &sqlx::sqlite::SqliteRow) -> AppResult<ProviderConfig> {
    Ok(ProviderConfig {
        id: Uuid::parse_str(&row.try_get::<String, _>("id")?).map_err(|e| AppError::Internal(e.to_string()))?,
        owner_id: Uuid::parse_str(&row.try_get::<String, _>("owner_id")?).map_err(|e| AppError::Internal(e.to_string()))?,
        provider_type: row.try_get("provider_type")?,
        model_name: row.try_get("model_name")?,
        api_key_encrypted: row.try_get("api_key_encrypted")?,
        base_url: row.try_get("base_url")?,
        context_window_tokens: row.try_get("context_window_tokens")?,
        is_default: row.try_get::<i64, _>("is_default")? != 0,
    })
}

/// Calls `chat_adapter` unless the resolved provider is the local
/// placeholder, and falls back to the deterministic local reply on any
/// failure, so a chat turn always completes with a 200 response instead of
/// surfacing an upstream error.
async fn dispatch_chat(chat_adapter: &dyn ChatAdapter, provider_config: &ProviderConfig, request: &ChatRequest) -> ChatResponse {
    if provider_config.provider_type != "local" {
        if let Ok(response) = chat_adapter.chat(provider_config, request).await {
            return response;
        }
    }
    local_chat_adapter()
        .chat(provider_config, request)
        .await
        .unwrap_or(ChatResponse { content: String::new() })
}

/// Drives `adapter.chat_stream`, forwarding every delta onto `tx` as it
/// arrives and accumulating the full reply. Returns the accumulated content
/// alongside the adapter's result so the caller can detect a mid-stream
/// failure and still have whatever was received before it.
async fn stream_adapter_reply(
    adapter: &dyn ChatAdapter,
    provider_config: &ProviderConfig,
    request: &ChatRequest,
    tx: &mpsc::Sender<StreamEvent>,
) -> (String, anyhow::Result<()>) {
    let (delta_tx, mut delta_rx) = mpsc::channel::<String>(16);
    let produce = adapter.chat_stream(provider_config, request, delta_tx);
    let consume = async {
        let mut acc = String::new();
        while let Some(delta) = delta_rx.recv().await {
            let _ = tx.send(StreamEvent::Delta(delta.clone())).await;
            acc.push_str(&delta);
        }
        acc
    };
    let (result, content) = tokio::join!(produce, consume);
    (content, result)
}

/// Runs the non-streaming reply pipeline: saves the user turn, retrieves,
/// reranks (optional), compresses to the provider's window, calls the
/// chat adapter, persists the assistant turn with citations, and returns
/// `(content, citations)`.
pub async fn generate_reply(
    pool: &SqlitePool,
    embedding_config: &EmbeddingConfig,
    chat_adapter: &dyn ChatAdapter,
    input: &GenerateReplyInput<'_>,
) -> AppResult<(String, Vec<Citation>)> {
    let session = load_session(pool, input.session_id).await?;
    if session.user_id != input.user_id && input.user_role != Role::Admin {
        return Err(AppError::Permission("no access to this session".to_string()));
    }

    insert_message(pool, input.session_id, "user", input.content, &[]).await?;

    let library_ids = resolve_libraries(
        pool,
        input.user_id,
        input.user_role,
        session.library_id,
        input.library_ids_override.clone(),
    )
    .await?;

    let profile_id = input.retrieval_profile_id.or(session.retrieval_profile_id);
    let (_, retrieval_config) = resolve_config(pool, profile_id).await?;
    let provider_config = resolve_provider(pool, input.user_id, input.provider_config_id.or(session.provider_config_id)).await?;

    let history = load_history(pool, input.session_id).await?;
    let history_user_turns: Vec<String> = history.iter().filter(|m| m.role == "user").map(|m| m.content.clone()).collect();

    let mut retrieved = retrieve(
        pool,
        embedding_config,
        &retrieval_config,
        &library_ids,
        input.content,
        input.top_k,
        &history_user_turns,
    )
    .await?;

    let summary_mode = !library_ids.is_empty() && is_global_summary_query(input.content);

    if !library_ids.is_empty() && retrieved.is_empty() {
        let no_hit = build_no_hit_message();
        insert_message(pool, input.session_id, "assistant", &no_hit, &[]).await?;
        return Ok((no_hit, Vec::new()));
    }

    if input.use_rerank && !retrieved.is_empty() {
        let rerank_adapter = local_rerank_adapter();
        retrieved = rerank_retrieved(rerank_adapter.as_ref(), input.content, retrieved).await;
    }

    let compression = CompressionInput {
        context_window_tokens: Some(provider_config.context_window_tokens),
        max_tokens: input.max_tokens,
        history_messages: &history.iter().map(|m| m.content.clone()).collect::<Vec<_>>(),
        query: input.content,
        summary_mode,
    };
    retrieved = compress_retrieved(retrieved, &compression);

    let system_content = build_system_prompt(&retrieved, summary_mode);
    let mut messages = vec![ChatTurn { role: "system", content: system_content }];
    for turn in &history {
        let role: &'static str = match turn.role.as_str() {
            "user" => "user",
            "assistant" => "assistant",
            _ => "system",
        };
        messages.push(ChatTurn { role, content: turn.content.clone() });
    }

    let request = ChatRequest {
        model: provider_config.model_name.clone(),
        messages,
        temperature: input.temperature,
        top_p: input.top_p,
        max_tokens: input.max_tokens,
    };
    let response = dispatch_chat(chat_adapter, &provider_config, &request).await;

    let citations: Vec<Citation> = if input.show_citations {
        retrieved.iter().map(|r| r.to_citation()).collect()
    } else {
        Vec::new()
    };

    insert_message(pool, input.session_id, "assistant", &response.content, &citations).await?;
    Ok((response.content, citations))
}

/// SSE delta frames produced by the streaming path.
pub enum StreamEvent {
    Delta(String),
    Done { citations: Vec<Citation>, error: Option<String> },
}

impl StreamEvent {
    pub fn to_sse_frame(&self) -> String {
        match self {
            StreamEvent::Delta(delta) => {
                let payload = serde_json::json!({"type": "delta", "delta": delta});
                format!("data: {payload}\n\n")
            }
            StreamEvent::Done { citations, error } => {
                let payload = serde_json::json!({"type": "done", "citations": citations, "error": error});
                format!("data: {payload}\n\n")
            }
        }
    }
}

/// Runs the streaming reply pipeline. Deltas are pushed onto `tx` as they
/// arrive from the adapter (the local fallback yields its whole reply as
/// one delta); the assistant turn is persisted once the stream ends.
pub async fn generate_reply_stream(
    pool: &SqlitePool,
    embedding_config: &EmbeddingConfig,
    chat_adapter: &dyn ChatAdapter,
    input: &GenerateReplyInput<'_>,
    tx: mpsc::Sender<StreamEvent>,
) -> AppResult<()> {
    let session = load_session(pool, input.session_id).await?;
    if session.user_id != input.user_id && input.user_role != Role::Admin {
        return Err(AppError::Permission("no access to this session".to_string()));
    }

    let history_before = load_history(pool, input.session_id).await?;
    let history_user_turns: Vec<String> =
        history_before.iter().filter(|m| m.role == "user").map(|m| m.content.clone()).collect();

    insert_message(pool, input.session_id, "user", input.content, &[]).await?;

    let library_ids = resolve_libraries(
        pool,
        input.user_id,
        input.user_role,
        session.library_id,
        input.library_ids_override.clone(),
    )
    .await?;

    let profile_id = input.retrieval_profile_id.or(session.retrieval_profile_id);
    let (_, retrieval_config) = resolve_config(pool, profile_id).await?;
    let provider_config = resolve_provider(pool, input.user_id, input.provider_config_id.or(session.provider_config_id)).await?;

    let mut retrieved = retrieve(
        pool,
        embedding_config,
        &retrieval_config,
        &library_ids,
        input.content,
        input.top_k,
        &history_user_turns,
    )
    .await?;

    let summary_mode = !library_ids.is_empty() && is_global_summary_query(input.content);

    if !library_ids.is_empty() && retrieved.is_empty() {
        let no_hit = build_no_hit_message();
        insert_message(pool, input.session_id, "assistant", &no_hit, &[]).await?;
        let _ = tx.send(StreamEvent::Delta(no_hit)).await;
        let _ = tx.send(StreamEvent::Done { citations: Vec::new(), error: None }).await;
        return Ok(());
    }

    if input.use_rerank && !retrieved.is_empty() {
        let rerank_adapter = local_rerank_adapter();
        retrieved = rerank_retrieved(rerank_adapter.as_ref(), input.content, retrieved).await;
    }

    let compression = CompressionInput {
        context_window_tokens: Some(provider_config.context_window_tokens),
        max_tokens: input.max_tokens,
        history_messages: &history_before.iter().map(|m| m.content.clone()).collect::<Vec<_>>(),
        query: input.content,
        summary_mode,
    };
    retrieved = compress_retrieved(retrieved, &compression);

    let system_content = build_system_prompt(&retrieved, summary_mode);
    let mut messages = vec![ChatTurn { role: "system", content: system_content }];
    for turn in &history_before {
        let role: &'static str = match turn.role.as_str() {
            "user" => "user",
            "assistant" => "assistant",
            _ => "system",
        };
        messages.push(ChatTurn { role, content: turn.content.clone() });
    }
    messages.push(ChatTurn { role: "user", content: input.content.to_string() });

    let request = ChatRequest {
        model: provider_config.model_name.clone(),
        messages,
        temperature: input.temperature,
        top_p: input.top_p,
        max_tokens: input.max_tokens,
    };

    let (full_content, stream_error) = if provider_config.provider_type != "local" {
        let (content, result) = stream_adapter_reply(chat_adapter, &provider_config, &request, &tx).await;
        match result {
            Ok(()) if !content.is_empty() => (content, None),
            Ok(()) => {
                let local = local_chat_adapter();
                let (local_content, _) = stream_adapter_reply(local.as_ref(), &provider_config, &request, &tx).await;
                (local_content, None)
            }
            Err(e) => {
                let local = local_chat_adapter();
                let (local_content, _) = stream_adapter_reply(local.as_ref(), &provider_config, &request, &tx).await;
                (local_content, Some(e.to_string()))
            }
        }
    } else {
        let local = local_chat_adapter();
        let (content, _) = stream_adapter_reply(local.as_ref(), &provider_config, &request, &tx).await;
        (content, None)
    };

    let citations: Vec<Citation> = if input.show_citations {
        retrieved.iter().map(|r| r.to_citation()).collect()
    } else {
        Vec::new()
    };

    insert_message(pool, input.session_id, "assistant", &full_content, &citations).await?;
    let _ = tx.send(StreamEvent::Done { citations, error: stream_error }).await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_summary_queries() {
        assert!(is_global_summary_query("请全面总结一下这本书的内容"));
        assert!(!is_global_summary_query("主角叫什么名字"));
    }

    #[test]
    fn no_hit_message_mentions_alias_retry_and_rebuild() {
        let msg = build_no_hit_message();
        assert!(msg.contains("别名"));
        assert!(msg.contains("重建索引"));
    }

    #[test]
    fn sse_frame_shapes_delta_and_done() {
        let delta = StreamEvent::Delta("hi".to_string()).to_sse_frame();
        assert!(delta.starts_with("data: "));
        assert!(delta.contains("\"type\":\"delta\""));
        let done = StreamEvent::Done { citations: Vec::new(), error: None }.to_sse_frame();
        assert!(done.contains("\"type\":\"done\""));
    }

    struct AlwaysFailsAdapter;

    #[async_trait::async_trait]
    impl ChatAdapter for AlwaysFailsAdapter {
        async fn chat(&self, _config: &ProviderConfig, _request: &ChatRequest) -> anyhow::Result<ChatResponse> {
            anyhow::bail!("provider unreachable")
        }

        async fn chat_stream(&self, _config: &ProviderConfig, _request: &ChatRequest, _tx: mpsc::Sender<String>) -> anyhow::Result<()> {
            anyhow::bail!("provider unreachable")
        }
    }

    fn blank_request() -> ChatRequest {
        ChatRequest {
            model: "gpt-test".to_string(),
            messages: vec![ChatTurn { role: "system", content: "prelude RAG_CONTEXT=[{\"snippet\":\"hi\"}]".to_string() }],
            temperature: 0.0,
            top_p: 1.0,
            max_tokens: 256,
        }
    }

    #[tokio::test]
    async fn dispatch_chat_degrades_to_local_reply_on_provider_failure() {
        let config = fallback_provider_config(Uuid::nil());
        let mut openai_config = config.clone();
        openai_config.provider_type = "openai".to_string();
        let response = dispatch_chat(&AlwaysFailsAdapter, &openai_config, &blank_request()).await;
        assert!(response.content.contains("根据检索到的资料"));
    }

    #[tokio::test]
    async fn dispatch_chat_uses_local_reply_for_unconfigured_provider() {
        let config = fallback_provider_config(Uuid::nil());
        let response = dispatch_chat(&AlwaysFailsAdapter, &config, &blank_request()).await;
        assert!(response.content.contains("根据检索到的资料"));
    }

    #[tokio::test]
    async fn stream_adapter_reply_degrades_to_local_reply_on_provider_failure() {
        let openai_config = {
            let mut c = fallback_provider_config(Uuid::nil());
            c.provider_type = "openai".to_string();
            c
        };
        let (tx, mut rx) = mpsc::channel::<StreamEvent>(16);
        let (content, result) = stream_adapter_reply(&AlwaysFailsAdapter, &openai_config, &blank_request(), &tx).await;
        assert!(result.is_err());
        assert!(content.is_empty());
        drop(tx);
        assert!(rx.recv().await.is_none());

        let (tx, mut rx) = mpsc::channel::<StreamEvent>(16);
        let local = local_chat_adapter();
        let (local_content, local_result) = stream_adapter_reply(local.as_ref(), &openai_config, &blank_request(), &tx).await;
        assert!(local_result.is_ok());
        assert!(local_content.contains("根据检索到的资料"));
        drop(tx);
        let mut streamed = String::new();
        while let Some(event) = rx.recv().await {
            if let StreamEvent::Delta(piece) = event {
                streamed.push_str(&piece);
            }
        }
        assert_eq!(streamed, local_content);
    }
}
