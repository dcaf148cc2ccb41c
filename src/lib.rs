//! # ragforge
//!
//! **A hybrid retrieval-augmented question-answering backend for private and
//! shared document libraries.**
//!
//! ragforge ingests plain-text documents into per-owner knowledge libraries,
//! builds a lightweight entity/relation graph alongside the usual chunk
//! index, and answers chat questions by blending vector similarity, keyword
//! overlap, and graph-derived signals into a single retrieval score before
//! handing the assembled context to a configurable chat provider.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌──────────────┐   ┌──────────┐
//! │   Ingestion  │──▶│ Chunk+Embed  │──▶│  SQLite   │
//! │ upload/sync  │   │  + graph     │   │  (WAL)    │
//! └──────────────┘   └──────────────┘   └────┬─────┘
//!                                            │
//!                       ┌────────────────────┤
//!                       ▼                    ▼
//!                 ┌──────────┐         ┌──────────┐
//!                 │ ragforge │         │   HTTP   │
//!                 │   -ctl   │         │  (Axum)  │
//!                 └──────────┘         └──────────┘
//! ```
//!
//! ## Data Flow
//!
//! 1. **Ingestion** ([`ingest`]) scans an uploaded file or a synced directory,
//!    content-hashes it, and upserts a [`models::KnowledgeFile`] row.
//! 2. The file's text is split into [`models::Chunk`]s by [`chunks`] and
//!    embedded via the configured backend ([`embedding`]).
//! 3. [`graph`] mines entities and relations out of the same chunk text into
//!    [`models::KnowledgeEntity`]/[`models::KnowledgeRelation`] rows.
//! 4. [`retrieval`] scores candidate chunks by blending vector similarity,
//!    keyword overlap, and graph overlap, tuned per [`profiles`].
//! 5. [`chat`] assembles a prompt from the top hits within the session's
//!    [`context_window`] budget and dispatches it through a [`adapters`]
//!    chat provider, returning [`models::Citation`]s alongside the reply.
//! 6. [`server`] exposes all of the above over HTTP, with [`auth`] guarding
//!    everything but `/health` and `/auth/login`.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | Environment-driven configuration and validation |
//! | [`error`] | The `AppError` type and its `IntoResponse` mapping |
//! | [`models`] | Core data types shared across the crate |
//! | [`db`] | SQLite connection pool with WAL mode |
//! | [`migrate`] | Database schema migrations (idempotent) |
//! | [`secrets`] | AES-256-GCM encryption for stored provider credentials |
//! | [`tokenize`] | Lightweight tokenization shared by chunking and retrieval |
//! | [`chunks`] | Paragraph-boundary chunker and chunk storage |
//! | [`embedding`] | Embedding backends and vector utilities |
//! | [`graph`] | Entity/relation mining and per-library graph rebuilds |
//! | [`profiles`] | Built-in and custom retrieval profile management |
//! | [`retrieval`] | Hybrid scoring across vector, keyword, and graph signals |
//! | [`context_window`] | Prompt assembly within a provider's token budget |
//! | [`adapters`] | Chat and rerank provider trait and implementations |
//! | [`chat`] | Reply generation, streaming and non-streaming |
//! | [`ingest`] | Upload/sync ingestion pipeline |
//! | [`auth`] | Bearer token issuance, verification, and request auth |
//! | [`server`] | The HTTP surface (Axum) |
//!
//! ## Configuration
//!
//! ragforge is configured entirely from the environment; see [`config`] for
//! the full variable list and [`config::load_config`] for validation rules.

pub mod adapters;
pub mod auth;
pub mod chat;
pub mod chunks;
pub mod config;
pub mod context_window;
pub mod db;
pub mod embedding;
pub mod error;
pub mod graph;
pub mod ingest;
pub mod migrate;
pub mod models;
pub mod profiles;
pub mod retrieval;
pub mod secrets;
pub mod server;
pub mod tokenize;
