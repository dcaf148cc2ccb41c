//! End-to-end HTTP surface tests: auth, library/file lifecycle, and chat.
//!
//! Runs the real Axum router over a real (temp-file) SQLite database, with
//! the local chat/rerank adapters swapped in so the test doesn't need a
//! network-reachable provider.

use std::sync::Arc;
use std::time::Duration;

use ragforge::adapters::{local_chat_adapter, local_rerank_adapter};
use ragforge::config::{Config, EmbeddingConfig};
use ragforge::db;
use ragforge::embedding::EmbeddingBackendKind;
use ragforge::migrate::run_migrations;
use ragforge::models::Role;
use ragforge::profiles::ensure_default_profiles;
use ragforge::server::{build_router, AppState};
use serde_json::{json, Value};
use tempfile::TempDir;
use uuid::Uuid;

struct TestServer {
    base_url: String,
    _tmp: TempDir,
}

async fn spawn_test_server() -> TestServer {
    let tmp = TempDir::new().unwrap();
    let db_path = tmp.path().join("ragforge.db");
    let storage_root = tmp.path().join("storage");
    let kb_sync_root = tmp.path().join("kb-sync");
    std::fs::create_dir_all(&storage_root).unwrap();
    std::fs::create_dir_all(&kb_sync_root).unwrap();

    let config = Config {
        database_url: format!("sqlite://{}", db_path.display()),
        secret_key: "test-secret-key".to_string(),
        encryption_key: None,
        jwt_algorithm: "HS256".to_string(),
        jwt_expire_minutes: 60,
        storage_root,
        kb_sync_root,
        embedding: EmbeddingConfig {
            backend: EmbeddingBackendKind::Hash,
            dims: 64,
            endpoint_url: None,
            model_name: "test-hash".to_string(),
            api_key: None,
            local_device: "cpu".to_string(),
            batch_size: 8,
            fallback_hash: true,
        },
        cors_origins: Vec::new(),
        request_timeout: Duration::from_secs(30),
        bind_addr: "127.0.0.1:0".to_string(),
    };

    let pool = db::connect(&config).await.unwrap();
    run_migrations(&pool).await.unwrap();
    ensure_default_profiles(&pool).await.unwrap();

    let state = AppState {
        config: Arc::new(config),
        pool,
        chat_adapter: Arc::from(local_chat_adapter()),
        rerank_adapter: Arc::from(local_rerank_adapter()),
    };
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.ok();
    });

    TestServer { base_url: format!("http://{addr}"), _tmp: tmp }
}

/// Inserts an active user directly (bootstrapping: there is no signup
/// endpoint, mirroring `ragforge-ctl create-user`).
async fn seed_user(server: &TestServer, username: &str, role: Role) -> Uuid {
    // Reaching into the database file directly keeps this helper decoupled
    // from the HTTP surface under test.
    let db_path = server._tmp.path().join("ragforge.db");
    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .connect(&format!("sqlite://{}", db_path.display()))
        .await
        .unwrap();
    let id = Uuid::new_v4();
    let role_str = match role {
        Role::Admin => "admin",
        Role::User => "user",
    };
    sqlx::query("INSERT INTO users (id, username, role, active) VALUES (?, ?, ?, 1)")
        .bind(id.to_string())
        .bind(username)
        .bind(role_str)
        .execute(&pool)
        .await
        .unwrap();
    id
}

async fn login(client: &reqwest::Client, server: &TestServer, username: &str) -> String {
    let resp = client
        .post(format!("{}/auth/login", server.base_url))
        .json(&json!({"username": username}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    body["token"].as_str().unwrap().to_string()
}

#[tokio::test]
async fn health_check_requires_no_auth() {
    let server = spawn_test_server().await;
    let resp = reqwest::get(format!("{}/health", server.base_url)).await.unwrap();
    assert_eq!(resp.status(), 200);
}

#[tokio::test]
async fn protected_route_rejects_missing_token() {
    let server = spawn_test_server().await;
    let client = reqwest::Client::new();
    let resp = client.get(format!("{}/kb/libraries", server.base_url)).send().await.unwrap();
    assert_eq!(resp.status(), 401);
}

#[tokio::test]
async fn login_issues_a_usable_bearer_token() {
    let server = spawn_test_server().await;
    seed_user(&server, "alice", Role::User).await;
    let client = reqwest::Client::new();
    let token = login(&client, &server, "alice").await;
    assert!(!token.is_empty());

    let resp = client
        .get(format!("{}/users/me", server.base_url))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["username"], "alice");
    assert_eq!(body["role"], "user");
}

#[tokio::test]
async fn login_rejects_unknown_username() {
    let server = spawn_test_server().await;
    let client = reqwest::Client::new();
    let resp = client
        .post(format!("{}/auth/login", server.base_url))
        .json(&json!({"username": "nobody"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 401);
}

#[tokio::test]
async fn non_admin_cannot_create_shared_library() {
    let server = spawn_test_server().await;
    seed_user(&server, "bob", Role::User).await;
    let client = reqwest::Client::new();
    let token = login(&client, &server, "bob").await;

    let resp = client
        .post(format!("{}/kb/libraries", server.base_url))
        .bearer_auth(&token)
        .json(&json!({"name": "Shared KB", "owner_type": "shared"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 403);
}

#[tokio::test]
async fn upload_file_then_chat_returns_a_grounded_citation() {
    let server = spawn_test_server().await;
    seed_user(&server, "carol", Role::User).await;
    let client = reqwest::Client::new();
    let token = login(&client, &server, "carol").await;

    let resp = client
        .post(format!("{}/kb/libraries", server.base_url))
        .bearer_auth(&token)
        .json(&json!({"name": "Personal KB", "owner_type": "private"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let library: Value = resp.json().await.unwrap();
    let library_id = library["id"].as_str().unwrap().to_string();

    let form = reqwest::multipart::Form::new()
        .text("library_id", library_id.clone())
        .part(
            "file",
            reqwest::multipart::Part::bytes(
                b"Rust is a systems programming language focused on safety and speed.".to_vec(),
            )
            .file_name("rust.md"),
        );
    let resp = client
        .post(format!("{}/kb/files/upload", server.base_url))
        .bearer_auth(&token)
        .multipart(form)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let upload: Value = resp.json().await.unwrap();
    assert!(upload["chunk_count"].as_u64().unwrap() >= 1);

    let resp = client
        .post(format!("{}/chat/sessions", server.base_url))
        .bearer_auth(&token)
        .json(&json!({"library_id": library_id}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let session: Value = resp.json().await.unwrap();
    let session_id = session["id"].as_str().unwrap().to_string();

    let resp = client
        .post(format!("{}/chat/sessions/{session_id}/messages", server.base_url))
        .bearer_auth(&token)
        .json(&json!({"content": "What is Rust focused on?", "top_k": 3}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let message: Value = resp.json().await.unwrap();
    assert!(!message["content"].as_str().unwrap().is_empty());
    assert!(message["citations"].as_array().unwrap().iter().any(|c| c["file_name"] == "rust.md"));
}

#[tokio::test]
async fn library_owner_can_delete_their_own_library() {
    let server = spawn_test_server().await;
    seed_user(&server, "dave", Role::User).await;
    let client = reqwest::Client::new();
    let token = login(&client, &server, "dave").await;

    let resp = client
        .post(format!("{}/kb/libraries", server.base_url))
        .bearer_auth(&token)
        .json(&json!({"name": "Scratch", "owner_type": "private"}))
        .send()
        .await
        .unwrap();
    let library: Value = resp.json().await.unwrap();
    let library_id = library["id"].as_str().unwrap();

    let resp = client
        .delete(format!("{}/kb/libraries/{library_id}", server.base_url))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let resp = client
        .get(format!("{}/kb/libraries/{library_id}/files", server.base_url))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap();
    // The library row is gone; listing its files now 404s via ensure_library_access.
    assert_eq!(resp.status(), 404);
}
