//! Core data types for the retrieval backend (see SPEC_FULL.md §3).
//!
//! These are narrow `serde`-derived record types rather than ORM entities:
//! the database rows are mapped into and out of them explicitly at each
//! component boundary.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    User,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub username: String,
    pub role: Role,
    pub active: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LibraryType {
    General,
    NovelStory,
    EnterpriseDocs,
    ScientificPaper,
    HumanitiesPaper,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OwnerType {
    Private,
    Shared,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Library {
    pub id: Uuid,
    pub name: String,
    pub library_type: LibraryType,
    pub owner_type: OwnerType,
    pub owner_id: Option<Uuid>,
    pub tags: Vec<String>,
    pub root_path: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileType {
    Txt,
    Md,
    Csv,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileStatus {
    Pending,
    Indexed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeFile {
    pub id: Uuid,
    pub library_id: Uuid,
    pub filename: String,
    pub filepath: String,
    pub file_type: FileType,
    pub content_hash: String,
    pub status: FileStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    pub id: Uuid,
    pub library_id: Uuid,
    pub file_id: Uuid,
    pub chunk_index: i64,
    pub content: String,
    pub embedding: Vec<f32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EntityMetadata {
    #[serde(default)]
    pub aliases: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeEntity {
    pub id: Uuid,
    pub library_id: Uuid,
    pub name: String,
    pub display_name: String,
    pub entity_type: String,
    pub frequency: i64,
    pub metadata: EntityMetadata,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationType {
    IsA,
    Contains,
    DependsOn,
    Causes,
    CoOccurs,
}

impl RelationType {
    /// Weight used by roster mining (SPEC_FULL.md §4.5).
    pub fn roster_weight(self) -> f64 {
        match self {
            RelationType::Contains => 1.25,
            RelationType::IsA => 1.10,
            RelationType::DependsOn => 1.00,
            RelationType::Causes => 0.90,
            RelationType::CoOccurs => 0.75,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RelationType::IsA => "is_a",
            RelationType::Contains => "contains",
            RelationType::DependsOn => "depends_on",
            RelationType::Causes => "causes",
            RelationType::CoOccurs => "co_occurs",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        Some(match s {
            "is_a" => RelationType::IsA,
            "contains" => RelationType::Contains,
            "depends_on" => RelationType::DependsOn,
            "causes" => RelationType::Causes,
            "co_occurs" => RelationType::CoOccurs,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeRelation {
    pub id: Uuid,
    pub library_id: Uuid,
    pub source_entity_id: Uuid,
    pub target_entity_id: Uuid,
    pub relation_type: RelationType,
    pub weight: i64,
    pub evidence: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetrievalProfileType {
    General,
    NovelStory,
    EnterpriseDocs,
    ScientificPaper,
    HumanitiesPaper,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatSession {
    pub id: Uuid,
    pub user_id: Uuid,
    pub title: String,
    pub provider_config_id: Option<Uuid>,
    pub library_id: Option<Uuid>,
    pub retrieval_profile_id: Option<Uuid>,
    pub show_citations: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Citation {
    pub library_id: Uuid,
    pub file_id: Uuid,
    pub file_name: String,
    pub chunk_id: Uuid,
    pub score: f64,
    pub snippet: String,
    pub source: String,
    pub matched_entities: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: Uuid,
    pub session_id: Uuid,
    pub role: ChatRole,
    pub content: String,
    pub citations: Vec<Citation>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestionTaskType {
    SyncDirectory,
    Upload,
    RebuildIndex,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IngestionTaskStatus {
    Queued,
    Running,
    Completed,
    Failed,
}

impl IngestionTaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, IngestionTaskStatus::Completed | IngestionTaskStatus::Failed)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestionTask {
    pub id: Uuid,
    pub task_type: IngestionTaskType,
    pub status: IngestionTaskStatus,
    pub library_id: Uuid,
    pub created_by: Uuid,
    pub detail: Option<String>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Provider credential record, needed to resolve a session's context window
/// size (used by C8) and to dispatch chat/embedding/rerank calls (C10).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub provider_type: String,
    pub model_name: String,
    pub api_key_encrypted: String,
    pub base_url: Option<String>,
    pub context_window_tokens: i64,
    pub is_default: bool,
}
