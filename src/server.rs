//! HTTP surface: `AppState`, the Axum router, and the request handlers
//! behind each route in the external interface.
//!
//! Authentication is a thin sketch: a single `middleware::from_fn_with_state`
//! layer resolves a bearer token into a `CurrentUser` extension, and handlers
//! that need an admin check call [`auth::require_admin`] directly rather than
//! routing through a role-aware router builder.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use axum::extract::{Multipart, Path as AxumPath, State};
use axum::http::Method;
use axum::middleware;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};
use futures::StreamExt as _;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sqlx::{Row, SqlitePool};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::adapters::{local_rerank_adapter, resolve_chat_adapter, ChatAdapter, RerankAdapter};
use crate::auth::{self, require_admin, CurrentUser};
use crate::chat::{generate_reply, generate_reply_stream, GenerateReplyInput, StreamEvent};
use crate::config::Config;
use crate::db;
use crate::error::{AppError, AppResult};
use crate::graph::rebuild_library_graph;
use crate::ingest::{delete_file, index_file_content, sync_directory};
use crate::migrate::run_migrations;
use crate::models::{ChatRole, LibraryType, OwnerType, ProviderConfig, Role, RetrievalProfileType};
use crate::profiles::{create_profile, delete_profile, list_profiles, update_profile};
use crate::secrets::{encrypt_secret, mask_secret};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub pool: SqlitePool,
    pub chat_adapter: Arc<dyn ChatAdapter>,
    pub rerank_adapter: Arc<dyn RerankAdapter>,
}

/// Connects the database, runs migrations, seeds the built-in retrieval
/// profiles, and serves the HTTP surface on `config.bind_addr`.
pub async fn run_server(config: Config) -> anyhow::Result<()> {
    let pool = db::connect(&config).await?;
    run_migrations(&pool).await?;
    crate::profiles::ensure_default_profiles(&pool).await?;

    let chat_adapter: Arc<dyn ChatAdapter> = Arc::from(resolve_chat_adapter(config.effective_encryption_key()));
    let rerank_adapter: Arc<dyn RerankAdapter> = Arc::from(local_rerank_adapter());

    let state = AppState { config: Arc::new(config), pool, chat_adapter, rerank_adapter };
    let app = build_router(state.clone());

    let listener = tokio::net::TcpListener::bind(&state.config.bind_addr).await?;
    tracing::info!(addr = %state.config.bind_addr, "listening");
    axum::serve(listener, app).await?;
    Ok(())
}

pub fn build_router(state: AppState) -> Router {
    let cors = if state.config.cors_origins.is_empty() {
        CorsLayer::new()
            .allow_origin(AllowOrigin::any())
            .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
    } else {
        let origins: Vec<_> = state.config.cors_origins.iter().filter_map(|o| o.parse().ok()).collect();
        CorsLayer::new().allow_origin(origins).allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
    };

    let protected = Router::new()
        .route("/users/me", get(handle_me))
        .route("/admin/users", get(handle_list_users).post(handle_create_user))
        .route("/admin/users/{id}", put(handle_update_user))
        .route("/providers", get(handle_list_providers).post(handle_create_provider))
        .route("/providers/{id}", put(handle_update_provider).delete(handle_delete_provider))
        .route("/models/validate", post(handle_validate_model))
        .route("/kb/libraries", get(handle_list_libraries).post(handle_create_library))
        .route("/kb/libraries/{id}", put(handle_update_library).delete(handle_delete_library))
        .route("/kb/files/upload", post(handle_upload_file))
        .route("/kb/libraries/{id}/files", get(handle_list_files))
        .route("/kb/files/{id}", delete(handle_delete_file))
        .route("/kb/libraries/{id}/graph", get(handle_get_graph))
        .route("/kb/libraries/{id}/graph/rebuild", post(handle_rebuild_graph))
        .route("/kb/files/sync-directory", post(handle_sync_directory))
        .route("/kb/index/rebuild", post(handle_rebuild_index))
        .route("/kb/tasks/{id}", get(handle_get_task))
        .route("/settings/retrieval-profiles", get(handle_list_profiles).post(handle_create_profile))
        .route("/settings/retrieval-profiles/{id}", put(handle_update_profile).delete(handle_delete_profile))
        .route("/chat/sessions", get(handle_list_sessions).post(handle_create_session))
        .route(
            "/chat/sessions/{id}",
            get(handle_get_session).put(handle_update_session).delete(handle_delete_session),
        )
        .route("/chat/sessions/{id}/messages", get(handle_list_messages).post(handle_post_message))
        .route_layer(middleware::from_fn_with_state(state.clone(), auth::require_auth));

    Router::new()
        .route("/health", get(handle_health))
        .route("/auth/login", post(handle_login))
        .merge(protected)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

// ---------------------------------------------------------------------
// health / auth
// ---------------------------------------------------------------------

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

#[derive(Deserialize)]
struct LoginRequest {
    username: String,
}

#[derive(Serialize)]
struct LoginResponse {
    token: String,
    user_id: Uuid,
    role: Role,
}

async fn handle_login(State(state): State<AppState>, Json(body): Json<LoginRequest>) -> AppResult<Json<LoginResponse>> {
    let row = sqlx::query("SELECT id, role, active FROM users WHERE username = ?")
        .bind(&body.username)
        .fetch_optional(&state.pool)
        .await?
        .ok_or_else(|| AppError::Auth("unknown username".to_string()))?;

    let active: i64 = row.try_get("active")?;
    if active == 0 {
        return Err(AppError::Auth("user is inactive".to_string()));
    }
    let user_id = Uuid::parse_str(&row.try_get::<String, _>("id")?).map_err(|e| AppError::Internal(e.to_string()))?;
    let role = parse_role(&row.try_get::<String, _>("role")?)?;

    let token = auth::issue_token(user_id, role, &state.config.secret_key, state.config.jwt_expire_minutes);
    Ok(Json(LoginResponse { token, user_id, role }))
}

fn parse_role(s: &str) -> AppResult<Role> {
    match s {
        "admin" => Ok(Role::Admin),
        "user" => Ok(Role::User),
        other => Err(AppError::Internal(format!("unknown role '{other}' in database"))),
    }
}

fn role_as_str(r: Role) -> &'static str {
    match r {
        Role::Admin => "admin",
        Role::User => "user",
    }
}

// ---------------------------------------------------------------------
// users
// ---------------------------------------------------------------------

#[derive(Serialize)]
struct UserResponse {
    id: Uuid,
    username: String,
    role: Role,
    active: bool,
}

fn row_to_user(row: &sqlx::sqlite::SqliteRow) -> AppResult<UserResponse> {
    Ok(UserResponse {
        id: Uuid::parse_str(&row.try_get::<String, _>("id")?).map_err(|e| AppError::Internal(e.to_string()))?,
        username: row.try_get("username")?,
        role: parse_role(&row.try_get::<String, _>("role")?)?,
        active: row.try_get::<i64, _>("active")? != 0,
    })
}

async fn handle_me(current: CurrentUser, State(state): State<AppState>) -> AppResult<Json<UserResponse>> {
    let row = sqlx::query("SELECT id, username, role, active FROM users WHERE id = ?")
        .bind(current.id.to_string())
        .fetch_optional(&state.pool)
        .await?
        .ok_or_else(|| AppError::NotFound("user not found".to_string()))?;
    Ok(Json(row_to_user(&row)?))
}

async fn handle_list_users(current: CurrentUser, State(state): State<AppState>) -> AppResult<Json<Vec<UserResponse>>> {
    require_admin(&current)?;
    let rows = sqlx::query("SELECT id, username, role, active FROM users ORDER BY username").fetch_all(&state.pool).await?;
    rows.iter().map(row_to_user).collect::<AppResult<Vec<_>>>().map(Json)
}

#[derive(Deserialize)]
struct CreateUserRequest {
    username: String,
    role: Role,
}

async fn handle_create_user(
    current: CurrentUser,
    State(state): State<AppState>,
    Json(body): Json<CreateUserRequest>,
) -> AppResult<Json<UserResponse>> {
    require_admin(&current)?;
    if body.username.trim().is_empty() {
        return Err(AppError::Validation("username must not be empty".to_string()));
    }
    let id = Uuid::new_v4();
    sqlx::query("INSERT INTO users (id, username, role, active) VALUES (?, ?, ?, 1)")
        .bind(id.to_string())
        .bind(&body.username)
        .bind(role_as_str(body.role))
        .execute(&state.pool)
        .await?;
    Ok(Json(UserResponse { id, username: body.username, role: body.role, active: true }))
}

#[derive(Deserialize)]
struct UpdateUserRequest {
    role: Option<Role>,
    active: Option<bool>,
}

async fn handle_update_user(
    current: CurrentUser,
    State(state): State<AppState>,
    AxumPath(id): AxumPath<Uuid>,
    Json(body): Json<UpdateUserRequest>,
) -> AppResult<Json<UserResponse>> {
    require_admin(&current)?;
    sqlx::query("UPDATE users SET role = COALESCE(?, role), active = COALESCE(?, active) WHERE id = ?")
        .bind(body.role.map(role_as_str))
        .bind(body.active.map(|a| a as i64))
        .bind(id.to_string())
        .execute(&state.pool)
        .await?;
    let row = sqlx::query("SELECT id, username, role, active FROM users WHERE id = ?")
        .bind(id.to_string())
        .fetch_optional(&state.pool)
        .await?
        .ok_or_else(|| AppError::NotFound("user not found".to_string()))?;
    Ok(Json(row_to_user(&row)?))
}

// ---------------------------------------------------------------------
// provider configs
// ---------------------------------------------------------------------

#[derive(Serialize)]
struct ProviderResponse {
    id: Uuid,
    provider_type: String,
    model_name: String,
    api_key_masked: String,
    base_url: Option<String>,
    context_window_tokens: i64,
    is_default: bool,
}

fn to_provider_response(config: ProviderConfig, state: &AppState) -> ProviderResponse {
    let plain = crate::secrets::decrypt_secret(&config.api_key_encrypted, &state.config.effective_encryption_key())
        .unwrap_or_default();
    ProviderResponse {
        id: config.id,
        provider_type: config.provider_type,
        model_name: config.model_name,
        api_key_masked: mask_secret(&plain),
        base_url: config.base_url,
        context_window_tokens: config.context_window_tokens,
        is_default: config.is_default,
    }
}

fn row_to_provider(row: &sqlx::sqlite::SqliteRow) -> AppResult<ProviderConfig> {
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

async fn handle_list_providers(current: CurrentUser, State(state): State<AppState>) -> AppResult<Json<Vec<ProviderResponse>>> {
    let rows = sqlx::query(
        "SELECT id, owner_id, provider_type, model_name, api_key_encrypted, base_url, context_window_tokens, is_default \
         FROM provider_configs WHERE owner_id = ? ORDER BY is_default DESC",
    )
    .bind(current.id.to_string())
    .fetch_all(&state.pool)
    .await?;
    let out = rows
        .iter()
        .map(row_to_provider)
        .collect::<AppResult<Vec<_>>>()?
        .into_iter()
        .map(|c| to_provider_response(c, &state))
        .collect();
    Ok(Json(out))
}

#[derive(Deserialize)]
struct CreateProviderRequest {
    provider_type: String,
    model_name: String,
    api_key: String,
    base_url: Option<String>,
    context_window_tokens: Option<i64>,
    is_default: Option<bool>,
}

async fn handle_create_provider(
    current: CurrentUser,
    State(state): State<AppState>,
    Json(body): Json<CreateProviderRequest>,
) -> AppResult<Json<ProviderResponse>> {
    let id = Uuid::new_v4();
    let encrypted = encrypt_secret(&body.api_key, &state.config.effective_encryption_key()).map_err(|e| AppError::Internal(e.to_string()))?;
    let context_window_tokens = body.context_window_tokens.unwrap_or(131_072);
    let is_default = body.is_default.unwrap_or(false);

    let mut tx = state.pool.begin().await?;
    if is_default {
        sqlx::query("UPDATE provider_configs SET is_default = 0 WHERE owner_id = ?")
            .bind(current.id.to_string())
            .execute(&mut *tx)
            .await?;
    }
    sqlx::query(
        "INSERT INTO provider_configs (id, owner_id, provider_type, model_name, api_key_encrypted, base_url, context_window_tokens, is_default) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(id.to_string())
    .bind(current.id.to_string())
    .bind(&body.provider_type)
    .bind(&body.model_name)
    .bind(&encrypted)
    .bind(&body.base_url)
    .bind(context_window_tokens)
    .bind(is_default)
    .execute(&mut *tx)
    .await?;
    tx.commit().await?;

    Ok(Json(to_provider_response(
        ProviderConfig {
            id,
            owner_id: current.id,
            provider_type: body.provider_type,
            model_name: body.model_name,
            api_key_encrypted: encrypted,
            base_url: body.base_url,
            context_window_tokens,
            is_default,
        },
        &state,
    )))
}

#[derive(Deserialize)]
struct UpdateProviderRequest {
    model_name: Option<String>,
    api_key: Option<String>,
    base_url: Option<String>,
    context_window_tokens: Option<i64>,
    is_default: Option<bool>,
}

async fn handle_update_provider(
    current: CurrentUser,
    State(state): State<AppState>,
    AxumPath(id): AxumPath<Uuid>,
    Json(body): Json<UpdateProviderRequest>,
) -> AppResult<Json<ProviderResponse>> {
    let encrypted = body
        .api_key
        .map(|k| encrypt_secret(&k, &state.config.effective_encryption_key()))
        .transpose()
        .map_err(|e| AppError::Internal(e.to_string()))?;

    let mut tx = state.pool.begin().await?;
    if body.is_default == Some(true) {
        sqlx::query("UPDATE provider_configs SET is_default = 0 WHERE owner_id = ?")
            .bind(current.id.to_string())
            .execute(&mut *tx)
            .await?;
    }
    sqlx::query(
        "UPDATE provider_configs SET \
           model_name = COALESCE(?, model_name), api_key_encrypted = COALESCE(?, api_key_encrypted), \
           base_url = COALESCE(?, base_url), context_window_tokens = COALESCE(?, context_window_tokens), \
           is_default = COALESCE(?, is_default) \
         WHERE id = ? AND owner_id = ?",
    )
    .bind(body.model_name)
    .bind(encrypted)
    .bind(body.base_url)
    .bind(body.context_window_tokens)
    .bind(body.is_default)
    .bind(id.to_string())
    .bind(current.id.to_string())
    .execute(&mut *tx)
    .await?;
    tx.commit().await?;

    let row = sqlx::query(
        "SELECT id, owner_id, provider_type, model_name, api_key_encrypted, base_url, context_window_tokens, is_default \
         FROM provider_configs WHERE id = ? AND owner_id = ?",
    )
    .bind(id.to_string())
    .bind(current.id.to_string())
    .fetch_optional(&state.pool)
    .await?
    .ok_or_else(|| AppError::NotFound("provider config not found".to_string()))?;
    Ok(Json(to_provider_response(row_to_provider(&row)?, &state)))
}

async fn handle_delete_provider(
    current: CurrentUser,
    State(state): State<AppState>,
    AxumPath(id): AxumPath<Uuid>,
) -> AppResult<Json<Value>> {
    sqlx::query("DELETE FROM provider_configs WHERE id = ? AND owner_id = ?")
        .bind(id.to_string())
        .bind(current.id.to_string())
        .execute(&state.pool)
        .await?;
    Ok(Json(serde_json::json!({"deleted": true})))
}

#[derive(Deserialize)]
struct ValidateModelRequest {
    provider_type: String,
    base_url: Option<String>,
    model_name: String,
}

#[derive(Serialize)]
struct ValidateModelResponse {
    valid: bool,
    message: String,
}

async fn handle_validate_model(Json(body): Json<ValidateModelRequest>) -> Json<ValidateModelResponse> {
    let valid = !body.provider_type.trim().is_empty() && !body.model_name.trim().is_empty();
    let message = if valid {
        "provider configuration looks well-formed".to_string()
    } else {
        "provider_type and model_name are required".to_string()
    };
    let _ = &body.base_url;
    Json(ValidateModelResponse { valid, message })
}

// ---------------------------------------------------------------------
// libraries
// ---------------------------------------------------------------------

#[derive(Serialize)]
struct LibraryResponse {
    id: Uuid,
    name: String,
    library_type: LibraryType,
    owner_type: OwnerType,
    owner_id: Option<Uuid>,
    tags: Vec<String>,
    root_path: String,
}

fn library_type_as_str(t: LibraryType) -> &'static str {
    match t {
        LibraryType::General => "general",
        LibraryType::NovelStory => "novel_story",
        LibraryType::EnterpriseDocs => "enterprise_docs",
        LibraryType::ScientificPaper => "scientific_paper",
        LibraryType::HumanitiesPaper => "humanities_paper",
    }
}

fn parse_library_type(s: &str) -> LibraryType {
    match s {
        "novel_story" => LibraryType::NovelStory,
        "enterprise_docs" => LibraryType::EnterpriseDocs,
        "scientific_paper" => LibraryType::ScientificPaper,
        "humanities_paper" => LibraryType::HumanitiesPaper,
        _ => LibraryType::General,
    }
}

fn row_to_library(row: &sqlx::sqlite::SqliteRow) -> AppResult<LibraryResponse> {
    let owner_type: String = row.try_get("owner_type")?;
    let owner_id: Option<String> = row.try_get("owner_id")?;
    let tags_json: String = row.try_get("tags_json")?;
    Ok(LibraryResponse {
        id: Uuid::parse_str(&row.try_get::<String, _>("id")?).map_err(|e| AppError::Internal(e.to_string()))?,
        name: row.try_get("name")?,
        library_type: parse_library_type(&row.try_get::<String, _>("library_type")?),
        owner_type: if owner_type == "shared" { OwnerType::Shared } else { OwnerType::Private },
        owner_id: owner_id.map(|v| Uuid::parse_str(&v)).transpose().map_err(|e| AppError::Internal(e.to_string()))?,
        tags: serde_json::from_str(&tags_json).unwrap_or_default(),
        root_path: row.try_get("root_path")?,
    })
}

async fn handle_list_libraries(current: CurrentUser, State(state): State<AppState>) -> AppResult<Json<Vec<LibraryResponse>>> {
    let rows = sqlx::query(
        "SELECT id, name, library_type, owner_type, owner_id, tags_json, root_path FROM libraries \
         WHERE owner_type = 'shared' OR owner_id = ? ORDER BY name",
    )
    .bind(current.id.to_string())
    .fetch_all(&state.pool)
    .await?;
    rows.iter().map(row_to_library).collect::<AppResult<Vec<_>>>().map(Json)
}

#[derive(Deserialize)]
struct CreateLibraryRequest {
    name: String,
    library_type: Option<LibraryType>,
    owner_type: OwnerType,
    tags: Option<Vec<String>>,
}

fn library_root_path(state: &AppState, library_id: Uuid) -> PathBuf {
    state.config.storage_root.join(library_id.to_string())
}

async fn handle_create_library(
    current: CurrentUser,
    State(state): State<AppState>,
    Json(body): Json<CreateLibraryRequest>,
) -> AppResult<Json<LibraryResponse>> {
    if body.owner_type == OwnerType::Shared {
        require_admin(&current)?;
    }
    if body.name.trim().is_empty() {
        return Err(AppError::Validation("library name must not be empty".to_string()));
    }
    let id = Uuid::new_v4();
    let root_path = library_root_path(&state, id);
    std::fs::create_dir_all(&root_path).map_err(|e| AppError::Internal(e.to_string()))?;

    let library_type = body.library_type.unwrap_or(LibraryType::General);
    let owner_id = if body.owner_type == OwnerType::Shared { None } else { Some(current.id) };
    let tags = body.tags.unwrap_or_default();
    let tags_json = serde_json::to_string(&tags).map_err(|e| AppError::Internal(e.to_string()))?;

    sqlx::query(
        "INSERT INTO libraries (id, name, library_type, owner_type, owner_id, tags_json, root_path) \
         VALUES (?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(id.to_string())
    .bind(&body.name)
    .bind(library_type_as_str(library_type))
    .bind(if body.owner_type == OwnerType::Shared { "shared" } else { "private" })
    .bind(owner_id.map(|u| u.to_string()))
    .bind(&tags_json)
    .bind(root_path.to_string_lossy().to_string())
    .execute(&state.pool)
    .await?;

    Ok(Json(LibraryResponse {
        id,
        name: body.name,
        library_type,
        owner_type: body.owner_type,
        owner_id,
        tags,
        root_path: root_path.to_string_lossy().to_string(),
    }))
}

#[derive(Deserialize)]
struct UpdateLibraryRequest {
    name: Option<String>,
    tags: Option<Vec<String>>,
}

async fn handle_update_library(
    current: CurrentUser,
    State(state): State<AppState>,
    AxumPath(id): AxumPath<Uuid>,
    Json(body): Json<UpdateLibraryRequest>,
) -> AppResult<Json<LibraryResponse>> {
    ensure_library_access(&state, &current, id).await?;
    let tags_json = body.tags.as_ref().map(|t| serde_json::to_string(t).unwrap_or_else(|_| "[]".to_string()));
    sqlx::query("UPDATE libraries SET name = COALESCE(?, name), tags_json = COALESCE(?, tags_json) WHERE id = ?")
        .bind(body.name)
        .bind(tags_json)
        .bind(id.to_string())
        .execute(&state.pool)
        .await?;
    let row = sqlx::query("SELECT id, name, library_type, owner_type, owner_id, tags_json, root_path FROM libraries WHERE id = ?")
        .bind(id.to_string())
        .fetch_optional(&state.pool)
        .await?
        .ok_or_else(|| AppError::NotFound("library not found".to_string()))?;
    Ok(Json(row_to_library(&row)?))
}

async fn handle_delete_library(
    current: CurrentUser,
    State(state): State<AppState>,
    AxumPath(id): AxumPath<Uuid>,
) -> AppResult<Json<Value>> {
    ensure_library_access(&state, &current, id).await?;
    let mut tx = state.pool.begin().await?;
    sqlx::query("DELETE FROM chunks WHERE library_id = ?").bind(id.to_string()).execute(&mut *tx).await?;
    sqlx::query("DELETE FROM knowledge_files WHERE library_id = ?").bind(id.to_string()).execute(&mut *tx).await?;
    sqlx::query("DELETE FROM knowledge_relations WHERE library_id = ?").bind(id.to_string()).execute(&mut *tx).await?;
    sqlx::query("DELETE FROM knowledge_entities WHERE library_id = ?").bind(id.to_string()).execute(&mut *tx).await?;
    sqlx::query("DELETE FROM libraries WHERE id = ?").bind(id.to_string()).execute(&mut *tx).await?;
    tx.commit().await?;
    Ok(Json(serde_json::json!({"deleted": true})))
}

/// Loads a library row and checks the caller may write to it: shared
/// libraries require admin, private libraries require ownership. Returns
/// the library's `root_path` for callers that need to walk its directory.
async fn ensure_library_access(state: &AppState, current: &CurrentUser, library_id: Uuid) -> AppResult<String> {
    let row = sqlx::query("SELECT owner_type, owner_id, root_path FROM libraries WHERE id = ?")
        .bind(library_id.to_string())
        .fetch_optional(&state.pool)
        .await?
        .ok_or_else(|| AppError::NotFound("library not found".to_string()))?;
    let owner_type: String = row.try_get("owner_type")?;
    let owner_id: Option<String> = row.try_get("owner_id")?;
    let owner_id = owner_id.map(|v| Uuid::parse_str(&v)).transpose().map_err(|e| AppError::Internal(e.to_string()))?;
    let root_path: String = row.try_get("root_path")?;

    if owner_type == "shared" {
        require_admin(current)?;
    } else if owner_id != Some(current.id) && current.role != Role::Admin {
        return Err(AppError::Permission("no access to this library".to_string()));
    }
    Ok(root_path)
}

// ---------------------------------------------------------------------
// knowledge files / ingestion
// ---------------------------------------------------------------------

#[derive(Serialize)]
struct UploadResponse {
    file_id: Uuid,
    chunk_count: usize,
    changed: bool,
}

async fn handle_upload_file(
    current: CurrentUser,
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> AppResult<Json<UploadResponse>> {
    let mut library_id: Option<Uuid> = None;
    let mut filename: Option<String> = None;
    let mut content: Option<String> = None;

    while let Some(field) = multipart.next_field().await.map_err(|e| AppError::Validation(e.to_string()))? {
        match field.name().unwrap_or_default() {
            "library_id" => {
                let text = field.text().await.map_err(|e| AppError::Validation(e.to_string()))?;
                library_id = Some(Uuid::parse_str(&text).map_err(|e| AppError::Validation(e.to_string()))?);
            }
            "file" => {
                filename = field.file_name().map(|s| s.to_string());
                let bytes = field.bytes().await.map_err(|e| AppError::Validation(e.to_string()))?;
                content = Some(String::from_utf8(bytes.to_vec()).map_err(|e| AppError::Validation(e.to_string()))?);
            }
            _ => {}
        }
    }

    let library_id = library_id.ok_or_else(|| AppError::Validation("library_id is required".to_string()))?;
    let filename = filename.ok_or_else(|| AppError::Validation("file field is required".to_string()))?;
    let content = content.ok_or_else(|| AppError::Validation("file field is required".to_string()))?;
    ensure_library_access(&state, &current, library_id).await?;

    let result = index_file_content(&state.pool, &state.config.embedding, library_id, &filename, &filename, &content).await?;
    rebuild_library_graph(&state.pool, library_id).await?;

    Ok(Json(UploadResponse { file_id: result.file_id, chunk_count: result.chunk_count, changed: result.changed }))
}

#[derive(Serialize)]
struct FileResponse {
    id: Uuid,
    filename: String,
    filepath: String,
    file_type: String,
    status: String,
}

async fn handle_list_files(
    current: CurrentUser,
    State(state): State<AppState>,
    AxumPath(library_id): AxumPath<Uuid>,
) -> AppResult<Json<Vec<FileResponse>>> {
    ensure_library_access(&state, &current, library_id).await?;
    let rows = sqlx::query("SELECT id, filename, filepath, file_type, status FROM knowledge_files WHERE library_id = ? ORDER BY filename")
        .bind(library_id.to_string())
        .fetch_all(&state.pool)
        .await?;
    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        out.push(FileResponse {
            id: Uuid::parse_str(&row.try_get::<String, _>("id")?).map_err(|e| AppError::Internal(e.to_string()))?,
            filename: row.try_get("filename")?,
            filepath: row.try_get("filepath")?,
            file_type: row.try_get("file_type")?,
            status: row.try_get("status")?,
        });
    }
    Ok(Json(out))
}

async fn handle_delete_file(
    current: CurrentUser,
    State(state): State<AppState>,
    AxumPath(file_id): AxumPath<Uuid>,
) -> AppResult<Json<Value>> {
    let row = sqlx::query("SELECT library_id FROM knowledge_files WHERE id = ?")
        .bind(file_id.to_string())
        .fetch_optional(&state.pool)
        .await?
        .ok_or_else(|| AppError::NotFound("file not found".to_string()))?;
    let library_id = Uuid::parse_str(&row.try_get::<String, _>("library_id")?).map_err(|e| AppError::Internal(e.to_string()))?;
    ensure_library_access(&state, &current, library_id).await?;

    delete_file(&state.pool, file_id).await?;
    rebuild_library_graph(&state.pool, library_id).await?;
    Ok(Json(serde_json::json!({"deleted": true})))
}

#[derive(Serialize)]
struct GraphResponse {
    entities: Vec<GraphEntity>,
    relations: Vec<GraphRelation>,
}

#[derive(Serialize)]
struct GraphEntity {
    id: Uuid,
    display_name: String,
    entity_type: String,
    frequency: i64,
}

#[derive(Serialize)]
struct GraphRelation {
    source_entity_id: Uuid,
    target_entity_id: Uuid,
    relation_type: String,
    weight: i64,
}

async fn handle_get_graph(
    current: CurrentUser,
    State(state): State<AppState>,
    AxumPath(library_id): AxumPath<Uuid>,
) -> AppResult<Json<GraphResponse>> {
    ensure_library_access(&state, &current, library_id).await?;

    let entity_rows = sqlx::query(
        "SELECT id, display_name, entity_type, frequency FROM knowledge_entities \
         WHERE library_id = ? ORDER BY frequency DESC LIMIT 200",
    )
    .bind(library_id.to_string())
    .fetch_all(&state.pool)
    .await?;
    let mut entities = Vec::with_capacity(entity_rows.len());
    for row in entity_rows {
        entities.push(GraphEntity {
            id: Uuid::parse_str(&row.try_get::<String, _>("id")?).map_err(|e| AppError::Internal(e.to_string()))?,
            display_name: row.try_get("display_name")?,
            entity_type: row.try_get("entity_type")?,
            frequency: row.try_get("frequency")?,
        });
    }

    let relation_rows = sqlx::query(
        "SELECT source_entity_id, target_entity_id, relation_type, weight FROM knowledge_relations \
         WHERE library_id = ? ORDER BY weight DESC LIMIT 400",
    )
    .bind(library_id.to_string())
    .fetch_all(&state.pool)
    .await?;
    let mut relations = Vec::with_capacity(relation_rows.len());
    for row in relation_rows {
        relations.push(GraphRelation {
            source_entity_id: Uuid::parse_str(&row.try_get::<String, _>("source_entity_id")?)
                .map_err(|e| AppError::Internal(e.to_string()))?,
            target_entity_id: Uuid::parse_str(&row.try_get::<String, _>("target_entity_id")?)
                .map_err(|e| AppError::Internal(e.to_string()))?,
            relation_type: row.try_get("relation_type")?,
            weight: row.try_get("weight")?,
        });
    }

    Ok(Json(GraphResponse { entities, relations }))
}

#[derive(Serialize)]
struct GraphRebuildResponse {
    node_count: i64,
    edge_count: i64,
    chunk_count: i64,
}

async fn handle_rebuild_graph(
    current: CurrentUser,
    State(state): State<AppState>,
    AxumPath(library_id): AxumPath<Uuid>,
) -> AppResult<Json<GraphRebuildResponse>> {
    ensure_library_access(&state, &current, library_id).await?;
    let summary = rebuild_library_graph(&state.pool, library_id).await?;
    Ok(Json(GraphRebuildResponse {
        node_count: summary.node_count,
        edge_count: summary.edge_count,
        chunk_count: summary.chunk_count,
    }))
}

#[derive(Deserialize)]
struct SyncDirectoryRequest {
    library_id: Uuid,
}

#[derive(Serialize)]
struct SyncDirectoryResponse {
    files_changed: usize,
    chunks_written: usize,
    graph: GraphRebuildResponse,
}

async fn handle_sync_directory(
    current: CurrentUser,
    State(state): State<AppState>,
    Json(body): Json<SyncDirectoryRequest>,
) -> AppResult<Json<SyncDirectoryResponse>> {
    let root_path = ensure_library_access(&state, &current, body.library_id).await?;
    let sync_root = resolve_sync_root(&state, &root_path)?;

    let (files_changed, chunks_written, summary) =
        sync_directory(&state.pool, &state.config.embedding, body.library_id, &sync_root).await?;

    Ok(Json(SyncDirectoryResponse {
        files_changed,
        chunks_written,
        graph: GraphRebuildResponse { node_count: summary.node_count, edge_count: summary.edge_count, chunk_count: summary.chunk_count },
    }))
}

/// A library's `root_path` is trusted storage-root-relative state written
/// at creation time; this just guards against it having been hand-edited to
/// escape `KB_SYNC_ROOT`/`STORAGE_ROOT` entirely.
fn resolve_sync_root(state: &AppState, root_path: &str) -> AppResult<PathBuf> {
    let candidate = Path::new(root_path);
    if candidate.starts_with(&state.config.storage_root) || candidate.starts_with(&state.config.kb_sync_root) {
        Ok(candidate.to_path_buf())
    } else {
        Err(AppError::Validation("library root_path is outside the configured storage roots".to_string()))
    }
}

#[derive(Deserialize)]
struct RebuildIndexRequest {
    library_id: Uuid,
}

async fn handle_rebuild_index(
    current: CurrentUser,
    State(state): State<AppState>,
    Json(body): Json<RebuildIndexRequest>,
) -> AppResult<Json<SyncDirectoryResponse>> {
    let root_path = ensure_library_access(&state, &current, body.library_id).await?;
    let sync_root = resolve_sync_root(&state, &root_path)?;
    let (files_changed, chunks_written, summary) =
        sync_directory(&state.pool, &state.config.embedding, body.library_id, &sync_root).await?;
    Ok(Json(SyncDirectoryResponse {
        files_changed,
        chunks_written,
        graph: GraphRebuildResponse { node_count: summary.node_count, edge_count: summary.edge_count, chunk_count: summary.chunk_count },
    }))
}

#[derive(Serialize)]
struct TaskResponse {
    id: Uuid,
    task_type: String,
    status: String,
    library_id: Uuid,
    detail: Option<String>,
    error_message: Option<String>,
}

async fn handle_get_task(
    _current: CurrentUser,
    State(state): State<AppState>,
    AxumPath(id): AxumPath<Uuid>,
) -> AppResult<Json<TaskResponse>> {
    let row = sqlx::query("SELECT id, task_type, status, library_id, detail, error_message FROM ingestion_tasks WHERE id = ?")
        .bind(id.to_string())
        .fetch_optional(&state.pool)
        .await?
        .ok_or_else(|| AppError::NotFound("ingestion task not found".to_string()))?;
    Ok(Json(TaskResponse {
        id: Uuid::parse_str(&row.try_get::<String, _>("id")?).map_err(|e| AppError::Internal(e.to_string()))?,
        task_type: row.try_get("task_type")?,
        status: row.try_get("status")?,
        library_id: Uuid::parse_str(&row.try_get::<String, _>("library_id")?).map_err(|e| AppError::Internal(e.to_string()))?,
        detail: row.try_get("detail")?,
        error_message: row.try_get("error_message")?,
    }))
}

// ---------------------------------------------------------------------
// retrieval profiles
// ---------------------------------------------------------------------

async fn handle_list_profiles(_current: CurrentUser, State(state): State<AppState>) -> AppResult<Json<Value>> {
    let profiles = list_profiles(&state.pool).await?;
    Ok(Json(serde_json::to_value(profiles).map_err(|e| AppError::Internal(e.to_string()))?))
}

#[derive(Deserialize)]
struct CreateProfileRequest {
    profile_key: String,
    name: String,
    profile_type: RetrievalProfileType,
    description: Option<String>,
    #[serde(default)]
    overrides: Map<String, Value>,
    is_default: Option<bool>,
}

async fn handle_create_profile(
    current: CurrentUser,
    State(state): State<AppState>,
    Json(body): Json<CreateProfileRequest>,
) -> AppResult<Json<Value>> {
    require_admin(&current)?;
    let profile = create_profile(
        &state.pool,
        &body.profile_key,
        &body.name,
        body.profile_type,
        body.description.as_deref(),
        &body.overrides,
        body.is_default.unwrap_or(false),
    )
    .await?;
    Ok(Json(serde_json::to_value(profile).map_err(|e| AppError::Internal(e.to_string()))?))
}

#[derive(Deserialize)]
struct UpdateProfileRequest {
    name: Option<String>,
    description: Option<String>,
    overrides: Option<Map<String, Value>>,
    is_default: Option<bool>,
}

async fn handle_update_profile(
    current: CurrentUser,
    State(state): State<AppState>,
    AxumPath(id): AxumPath<Uuid>,
    Json(body): Json<UpdateProfileRequest>,
) -> AppResult<Json<Value>> {
    require_admin(&current)?;
    let profile = update_profile(
        &state.pool,
        id,
        body.name.as_deref(),
        body.description.as_deref(),
        body.overrides.as_ref(),
        body.is_default,
    )
    .await?;
    Ok(Json(serde_json::to_value(profile).map_err(|e| AppError::Internal(e.to_string()))?))
}

async fn handle_delete_profile(
    current: CurrentUser,
    State(state): State<AppState>,
    AxumPath(id): AxumPath<Uuid>,
) -> AppResult<Json<Value>> {
    require_admin(&current)?;
    delete_profile(&state.pool, id).await?;
    Ok(Json(serde_json::json!({"deleted": true})))
}

// ---------------------------------------------------------------------
// chat sessions / messages
// ---------------------------------------------------------------------

#[derive(Serialize)]
struct SessionResponse {
    id: Uuid,
    title: String,
    provider_config_id: Option<Uuid>,
    library_id: Option<Uuid>,
    retrieval_profile_id: Option<Uuid>,
    show_citations: bool,
}

fn row_to_session(row: &sqlx::sqlite::SqliteRow) -> AppResult<SessionResponse> {
    let parse = |v: Option<String>| -> AppResult<Option<Uuid>> {
        v.map(|s| Uuid::parse_str(&s).map_err(|e| AppError::Internal(e.to_string()))).transpose()
    };
    Ok(SessionResponse {
        id: Uuid::parse_str(&row.try_get::<String, _>("id")?).map_err(|e| AppError::Internal(e.to_string()))?,
        title: row.try_get("title")?,
        provider_config_id: parse(row.try_get("provider_config_id")?)?,
        library_id: parse(row.try_get("library_id")?)?,
        retrieval_profile_id: parse(row.try_get("retrieval_profile_id")?)?,
        show_citations: row.try_get::<i64, _>("show_citations")? != 0,
    })
}

async fn handle_list_sessions(current: CurrentUser, State(state): State<AppState>) -> AppResult<Json<Vec<SessionResponse>>> {
    let rows = sqlx::query(
        "SELECT id, title, provider_config_id, library_id, retrieval_profile_id, show_citations \
         FROM chat_sessions WHERE user_id = ? ORDER BY updated_at DESC",
    )
    .bind(current.id.to_string())
    .fetch_all(&state.pool)
    .await?;
    rows.iter().map(row_to_session).collect::<AppResult<Vec<_>>>().map(Json)
}

#[derive(Deserialize)]
struct CreateSessionRequest {
    title: Option<String>,
    provider_config_id: Option<Uuid>,
    library_id: Option<Uuid>,
    retrieval_profile_id: Option<Uuid>,
    show_citations: Option<bool>,
}

async fn handle_create_session(
    current: CurrentUser,
    State(state): State<AppState>,
    Json(body): Json<CreateSessionRequest>,
) -> AppResult<Json<SessionResponse>> {
    let id = Uuid::new_v4();
    let title = body.title.unwrap_or_else(|| "新会话".to_string());
    let show_citations = body.show_citations.unwrap_or(true);
    let now = chrono::Utc::now().timestamp();

    sqlx::query(
        "INSERT INTO chat_sessions (id, user_id, title, provider_config_id, library_id, retrieval_profile_id, show_citations, created_at, updated_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(id.to_string())
    .bind(current.id.to_string())
    .bind(&title)
    .bind(body.provider_config_id.map(|u| u.to_string()))
    .bind(body.library_id.map(|u| u.to_string()))
    .bind(body.retrieval_profile_id.map(|u| u.to_string()))
    .bind(show_citations)
    .bind(now)
    .bind(now)
    .execute(&state.pool)
    .await?;

    Ok(Json(SessionResponse {
        id,
        title,
        provider_config_id: body.provider_config_id,
        library_id: body.library_id,
        retrieval_profile_id: body.retrieval_profile_id,
        show_citations,
    }))
}

async fn handle_get_session(
    current: CurrentUser,
    State(state): State<AppState>,
    AxumPath(id): AxumPath<Uuid>,
) -> AppResult<Json<SessionResponse>> {
    let row = fetch_owned_session(&state, &current, id).await?;
    Ok(Json(row_to_session(&row)?))
}

async fn fetch_owned_session(state: &AppState, current: &CurrentUser, id: Uuid) -> AppResult<sqlx::sqlite::SqliteRow> {
    let row = sqlx::query(
        "SELECT id, user_id, title, provider_config_id, library_id, retrieval_profile_id, show_citations \
         FROM chat_sessions WHERE id = ?",
    )
    .bind(id.to_string())
    .fetch_optional(&state.pool)
    .await?
    .ok_or_else(|| AppError::NotFound("chat session not found".to_string()))?;
    let owner: String = row.try_get("user_id")?;
    if owner != current.id.to_string() && current.role != Role::Admin {
        return Err(AppError::Permission("no access to this session".to_string()));
    }
    Ok(row)
}

#[derive(Deserialize)]
struct UpdateSessionRequest {
    title: Option<String>,
    provider_config_id: Option<Uuid>,
    library_id: Option<Uuid>,
    retrieval_profile_id: Option<Uuid>,
    show_citations: Option<bool>,
}

async fn handle_update_session(
    current: CurrentUser,
    State(state): State<AppState>,
    AxumPath(id): AxumPath<Uuid>,
    Json(body): Json<UpdateSessionRequest>,
) -> AppResult<Json<SessionResponse>> {
    fetch_owned_session(&state, &current, id).await?;
    sqlx::query(
        "UPDATE chat_sessions SET \
           title = COALESCE(?, title), provider_config_id = COALESCE(?, provider_config_id), \
           library_id = COALESCE(?, library_id), retrieval_profile_id = COALESCE(?, retrieval_profile_id), \
           show_citations = COALESCE(?, show_citations), updated_at = ? \
         WHERE id = ?",
    )
    .bind(body.title)
    .bind(body.provider_config_id.map(|u| u.to_string()))
    .bind(body.library_id.map(|u| u.to_string()))
    .bind(body.retrieval_profile_id.map(|u| u.to_string()))
    .bind(body.show_citations)
    .bind(chrono::Utc::now().timestamp())
    .bind(id.to_string())
    .execute(&state.pool)
    .await?;
    let row = fetch_owned_session(&state, &current, id).await?;
    Ok(Json(row_to_session(&row)?))
}

async fn handle_delete_session(
    current: CurrentUser,
    State(state): State<AppState>,
    AxumPath(id): AxumPath<Uuid>,
) -> AppResult<Json<Value>> {
    fetch_owned_session(&state, &current, id).await?;
    let mut tx = state.pool.begin().await?;
    sqlx::query("DELETE FROM chat_messages WHERE session_id = ?").bind(id.to_string()).execute(&mut *tx).await?;
    sqlx::query("DELETE FROM chat_sessions WHERE id = ?").bind(id.to_string()).execute(&mut *tx).await?;
    tx.commit().await?;
    Ok(Json(serde_json::json!({"deleted": true})))
}

#[derive(Serialize)]
struct MessageResponse {
    id: Uuid,
    role: ChatRole,
    content: String,
    citations: Vec<crate::models::Citation>,
}

async fn handle_list_messages(
    current: CurrentUser,
    State(state): State<AppState>,
    AxumPath(id): AxumPath<Uuid>,
) -> AppResult<Json<Vec<MessageResponse>>> {
    fetch_owned_session(&state, &current, id).await?;
    let rows = sqlx::query("SELECT id, role, content, citations_json FROM chat_messages WHERE session_id = ? ORDER BY created_at ASC")
        .bind(id.to_string())
        .fetch_all(&state.pool)
        .await?;
    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        let role_str: String = row.try_get("role")?;
        let role = match role_str.as_str() {
            "user" => ChatRole::User,
            "assistant" => ChatRole::Assistant,
            _ => ChatRole::System,
        };
        let citations_json: String = row.try_get("citations_json")?;
        out.push(MessageResponse {
            id: Uuid::parse_str(&row.try_get::<String, _>("id")?).map_err(|e| AppError::Internal(e.to_string()))?,
            role,
            content: row.try_get("content")?,
            citations: serde_json::from_str(&citations_json).unwrap_or_default(),
        });
    }
    Ok(Json(out))
}

#[derive(Deserialize)]
struct PostMessageRequest {
    content: String,
    library_ids: Option<Vec<Uuid>>,
    #[serde(default)]
    stream: bool,
    #[serde(default = "default_top_k")]
    top_k: usize,
    #[serde(default)]
    use_rerank: bool,
    #[serde(default = "default_temperature")]
    temperature: f64,
    #[serde(default = "default_top_p")]
    top_p: f64,
    #[serde(default = "default_max_tokens")]
    max_tokens: i64,
}

fn default_top_k() -> usize {
    8
}
fn default_temperature() -> f64 {
    0.3
}
fn default_top_p() -> f64 {
    0.9
}
fn default_max_tokens() -> i64 {
    1024
}

/// Non-streaming replies return a `MessageResponse`; `stream=true` upgrades
/// to an SSE body of [`StreamEvent::to_sse_frame`] frames, matching the
/// generation logic chosen in `chat.rs`.
async fn handle_post_message(
    current: CurrentUser,
    State(state): State<AppState>,
    AxumPath(session_id): AxumPath<Uuid>,
    Json(body): Json<PostMessageRequest>,
) -> AppResult<axum::response::Response> {
    let session_row = fetch_owned_session(&state, &current, session_id).await?;
    let show_citations: bool = session_row.try_get::<i64, _>("show_citations")? != 0;

    if !body.stream {
        let input = GenerateReplyInput {
            user_id: current.id,
            user_role: current.role,
            session_id,
            content: &body.content,
            library_ids_override: body.library_ids,
            retrieval_profile_id: None,
            provider_config_id: None,
            top_k: body.top_k,
            use_rerank: body.use_rerank,
            show_citations,
            temperature: body.temperature,
            top_p: body.top_p,
            max_tokens: body.max_tokens,
        };
        let (content, citations) = generate_reply(&state.pool, &state.config.embedding, state.chat_adapter.as_ref(), &input).await?;
        return Ok(Json(MessageResponse { id: Uuid::new_v4(), role: ChatRole::Assistant, content, citations }).into_response());
    }

    let (tx, rx) = mpsc::channel::<StreamEvent>(16);
    let pool = state.pool.clone();
    let embedding_config = state.config.embedding.clone();
    let chat_adapter = state.chat_adapter.clone();
    let content = body.content;
    let library_ids_override = body.library_ids;
    let top_k = body.top_k;
    let use_rerank = body.use_rerank;
    let temperature = body.temperature;
    let top_p = body.top_p;
    let max_tokens = body.max_tokens;
    let user_id = current.id;
    let user_role = current.role;

    tokio::spawn(async move {
        let task_input = GenerateReplyInput {
            user_id,
            user_role,
            session_id,
            content: &content,
            library_ids_override,
            retrieval_profile_id: None,
            provider_config_id: None,
            top_k,
            use_rerank,
            show_citations,
            temperature,
            top_p,
            max_tokens,
        };
        if let Err(e) = generate_reply_stream(&pool, &embedding_config, chat_adapter.as_ref(), &task_input, tx.clone()).await {
            let _ = tx.send(StreamEvent::Done { citations: Vec::new(), error: Some(e.to_string()) }).await;
        }
    });

    let stream = ReceiverStream::new(rx).map(|event| Ok::<Event, std::convert::Infallible>(Event::default().data(event.to_sse_frame())));
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()).into_response())
}
