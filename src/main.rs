//! # ragforge-ctl
//!
//! Operator CLI for the ragforge retrieval backend: start the HTTP server,
//! run migrations by hand, bootstrap the first admin account, and sync a
//! library's knowledge files from a directory without going through the
//! HTTP surface.

mod adapters;
mod auth;
mod chat;
mod chunks;
mod config;
mod context_window;
mod db;
mod embedding;
mod error;
mod graph;
mod ingest;
mod migrate;
mod models;
mod profiles;
mod retrieval;
mod secrets;
mod server;
mod tokenize;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use uuid::Uuid;

use models::Role;

#[derive(Parser)]
#[command(name = "ragforge-ctl", about = "ragforge — hybrid retrieval-augmented QA backend", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP server
    Serve,

    /// Apply pending database migrations and exit
    Migrate,

    /// Create a user (passwordless: tokens are issued by username alone)
    CreateUser {
        username: String,

        /// Grant the admin role
        #[arg(long)]
        admin: bool,
    },

    /// Index every txt/md/csv file under a directory into a library
    SyncDirectory {
        /// Library UUID to sync into
        library_id: Uuid,

        /// Directory to scan
        path: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config()?;

    match cli.command {
        Commands::Serve => {
            server::run_server(cfg).await?;
        }
        Commands::Migrate => {
            let pool = db::connect(&cfg).await?;
            migrate::run_migrations(&pool).await?;
            profiles::ensure_default_profiles(&pool).await?;
            println!("Migrations applied.");
        }
        Commands::CreateUser { username, admin } => {
            let pool = db::connect(&cfg).await?;
            migrate::run_migrations(&pool).await?;
            let id = Uuid::new_v4();
            let role = if admin { Role::Admin } else { Role::User };
            let role_str = match role {
                Role::Admin => "admin",
                Role::User => "user",
            };
            sqlx::query("INSERT INTO users (id, username, role, active) VALUES (?, ?, ?, 1)")
                .bind(id.to_string())
                .bind(&username)
                .bind(role_str)
                .execute(&pool)
                .await?;
            println!("Created user '{username}' ({role_str}) with id {id}.");
        }
        Commands::SyncDirectory { library_id, path } => {
            let pool = db::connect(&cfg).await?;
            migrate::run_migrations(&pool).await?;
            let (files_changed, chunks_written, summary) =
                ingest::sync_directory(&pool, &cfg.embedding, library_id, &path).await?;
            println!(
                "Synced {files_changed} changed file(s), {chunks_written} chunk(s) written; graph now has {} node(s) and {} edge(s).",
                summary.node_count, summary.edge_count
            );
        }
    }

    Ok(())
}
