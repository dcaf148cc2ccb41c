//! Retrieval profile resolution (C6): built-in profiles, per-library
//! overrides, and the clamped runtime config the hybrid engine (C7) reads.
//!
//! Profiles are small tuning presets (how aggressively to gate, relax, and
//! diversify retrieval results) keyed by document genre. Every numeric
//! field is clamped into a safe range on read, so a malformed override
//! stored by an older client can never push the engine into a degenerate
//! state.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::models::RetrievalProfileType;

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RetrievalConfig {
    pub rag_min_top1_score: f64,
    pub rag_min_support_score: f64,
    pub rag_min_support_count: i64,
    pub rag_min_item_score: f64,
    pub rag_graph_max_terms: i64,
    pub graph_channel_weight: f64,
    pub graph_only_penalty: f64,
    pub vector_semantic_min: f64,
    pub alias_intent_enabled: bool,
    pub alias_mining_max_terms: i64,
    pub co_reference_enabled: bool,
    pub vector_candidate_multiplier: i64,
    pub keyword_candidate_multiplier: i64,
    pub graph_candidate_multiplier: i64,
    pub fallback_relax_enabled: bool,
    pub fallback_top1_relax: f64,
    pub fallback_support_relax: f64,
    pub fallback_item_relax: f64,
    pub summary_intent_enabled: bool,
    pub summary_expand_factor: i64,
    pub summary_min_chunks: i64,
    pub summary_per_file_cap: i64,
    pub summary_min_files: i64,
    pub keyword_fallback_expand_on_weak_hits: bool,
    pub keyword_fallback_max_chunks: i64,
    pub keyword_fallback_min_score: f64,
    pub keyword_fallback_scan_limit: i64,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        build_runtime_retrieval_config(None)
    }
}

fn as_float(overrides: &Map<String, Value>, key: &str, fallback: f64, lower: f64, upper: f64) -> f64 {
    let parsed = overrides.get(key).and_then(Value::as_f64).unwrap_or(fallback);
    parsed.clamp(lower, upper)
}

fn as_int(overrides: &Map<String, Value>, key: &str, fallback: i64, lower: i64, upper: i64) -> i64 {
    let parsed = overrides.get(key).and_then(Value::as_i64).unwrap_or(fallback);
    parsed.clamp(lower, upper)
}

fn as_bool(overrides: &Map<String, Value>, key: &str, fallback: bool) -> bool {
    overrides.get(key).and_then(Value::as_bool).unwrap_or(fallback)
}

/// Merges `overrides` over the documented defaults and clamps every field
/// into its safe range, exactly as the engine this replaces always has.
pub fn build_runtime_retrieval_config(overrides: Option<&Map<String, Value>>) -> RetrievalConfig {
    let empty = Map::new();
    let o = overrides.unwrap_or(&empty);

    RetrievalConfig {
        rag_min_top1_score: as_float(o, "rag_min_top1_score", 0.30, 0.0, 1.5),
        rag_min_support_score: as_float(o, "rag_min_support_score", 0.18, 0.0, 1.5),
        rag_min_support_count: as_int(o, "rag_min_support_count", 2, 1, 8),
        rag_min_item_score: as_float(o, "rag_min_item_score", 0.10, 0.0, 1.5),
        rag_graph_max_terms: as_int(o, "rag_graph_max_terms", 12, 4, 40),
        graph_channel_weight: as_float(o, "graph_channel_weight", 0.65, 0.1, 1.2),
        graph_only_penalty: as_float(o, "graph_only_penalty", 0.55, 0.1, 1.0),
        vector_semantic_min: as_float(o, "vector_semantic_min", 0.12, 0.0, 1.0),
        alias_intent_enabled: as_bool(o, "alias_intent_enabled", true),
        alias_mining_max_terms: as_int(o, "alias_mining_max_terms", 8, 0, 24),
        co_reference_enabled: as_bool(o, "co_reference_enabled", true),
        vector_candidate_multiplier: as_int(o, "vector_candidate_multiplier", 3, 2, 20),
        keyword_candidate_multiplier: as_int(o, "keyword_candidate_multiplier", 3, 2, 20),
        graph_candidate_multiplier: as_int(o, "graph_candidate_multiplier", 4, 2, 24),
        fallback_relax_enabled: as_bool(o, "fallback_relax_enabled", true),
        fallback_top1_relax: as_float(o, "fallback_top1_relax", 0.08, 0.0, 0.30),
        fallback_support_relax: as_float(o, "fallback_support_relax", 0.06, 0.0, 0.30),
        fallback_item_relax: as_float(o, "fallback_item_relax", 0.04, 0.0, 0.20),
        summary_intent_enabled: as_bool(o, "summary_intent_enabled", true),
        summary_expand_factor: as_int(o, "summary_expand_factor", 3, 1, 8),
        summary_min_chunks: as_int(o, "summary_min_chunks", 8, 4, 24),
        summary_per_file_cap: as_int(o, "summary_per_file_cap", 2, 1, 6),
        summary_min_files: as_int(o, "summary_min_files", 3, 1, 10),
        keyword_fallback_expand_on_weak_hits: as_bool(o, "keyword_fallback_expand_on_weak_hits", true),
        keyword_fallback_max_chunks: as_int(o, "keyword_fallback_max_chunks", 240, 20, 800),
        keyword_fallback_min_score: as_float(o, "keyword_fallback_min_score", 0.08, 0.0, 1.5),
        keyword_fallback_scan_limit: as_int(o, "keyword_fallback_scan_limit", 8000, 200, 20000),
    }
}

struct BuiltinProfile {
    key: &'static str,
    name: &'static str,
    profile_type: RetrievalProfileType,
    description: &'static str,
    is_default: bool,
    overrides: &'static [(&'static str, f64)],
}

/// The five built-in profiles, numeric values reproduced verbatim from the
/// genre-tuned presets this system ships by default.
fn builtin_profiles() -> Vec<BuiltinProfile> {
    vec![
        BuiltinProfile {
            key: "general_default",
            name: "通用文档",
            profile_type: RetrievalProfileType::General,
            description: "适用于多数知识库的均衡检索策略。",
            is_default: true,
            overrides: &[
                ("rag_min_top1_score", 0.30),
                ("rag_min_support_score", 0.18),
                ("rag_min_support_count", 2.0),
                ("rag_min_item_score", 0.10),
                ("rag_graph_max_terms", 12.0),
                ("graph_channel_weight", 0.65),
                ("graph_only_penalty", 0.55),
                ("vector_semantic_min", 0.12),
                ("alias_mining_max_terms", 8.0),
                ("graph_candidate_multiplier", 4.0),
                ("fallback_top1_relax", 0.08),
                ("fallback_support_relax", 0.06),
                ("fallback_item_relax", 0.04),
                ("summary_expand_factor", 3.0),
                ("summary_min_chunks", 8.0),
                ("summary_per_file_cap", 2.0),
                ("summary_min_files", 3.0),
                ("keyword_fallback_max_chunks", 240.0),
                ("keyword_fallback_min_score", 0.08),
                ("keyword_fallback_scan_limit", 8000.0),
            ],
        },
        BuiltinProfile {
            key: "novel_story_cn",
            name: "小说/故事",
            profile_type: RetrievalProfileType::NovelStory,
            description: "强化别名和上下文指代，适合人物称呼频繁变化的文本。",
            is_default: false,
            overrides: &[
                ("rag_min_top1_score", 0.27),
                ("rag_min_support_score", 0.16),
                ("rag_min_support_count", 2.0),
                ("rag_min_item_score", 0.08),
                ("rag_graph_max_terms", 10.0),
                ("graph_channel_weight", 0.60),
                ("graph_only_penalty", 0.50),
                ("vector_semantic_min", 0.10),
                ("alias_mining_max_terms", 10.0),
                ("graph_candidate_multiplier", 4.0),
                ("fallback_top1_relax", 0.10),
                ("fallback_support_relax", 0.07),
                ("fallback_item_relax", 0.04),
                ("summary_expand_factor", 4.0),
                ("summary_min_chunks", 12.0),
                ("summary_per_file_cap", 3.0),
                ("summary_min_files", 4.0),
                ("keyword_fallback_max_chunks", 280.0),
                ("keyword_fallback_min_score", 0.06),
                ("keyword_fallback_scan_limit", 10000.0),
            ],
        },
        BuiltinProfile {
            key: "enterprise_docs",
            name: "公司资料",
            profile_type: RetrievalProfileType::EnterpriseDocs,
            description: "偏精确检索，减少噪声，强调术语与制度条款匹配。",
            is_default: false,
            overrides: &[
                ("rag_min_top1_score", 0.34),
                ("rag_min_support_score", 0.22),
                ("rag_min_support_count", 2.0),
                ("rag_min_item_score", 0.12),
                ("rag_graph_max_terms", 8.0),
                ("graph_channel_weight", 0.55),
                ("graph_only_penalty", 0.48),
                ("vector_semantic_min", 0.14),
                ("alias_intent_enabled", 0.0),
                ("alias_mining_max_terms", 2.0),
                ("co_reference_enabled", 0.0),
                ("graph_candidate_multiplier", 3.0),
                ("fallback_top1_relax", 0.06),
                ("fallback_support_relax", 0.05),
                ("fallback_item_relax", 0.03),
                ("summary_expand_factor", 2.0),
                ("summary_min_chunks", 8.0),
                ("summary_per_file_cap", 2.0),
                ("summary_min_files", 3.0),
                ("keyword_fallback_max_chunks", 180.0),
                ("keyword_fallback_min_score", 0.10),
                ("keyword_fallback_scan_limit", 6000.0),
            ],
        },
        BuiltinProfile {
            key: "scientific_paper",
            name: "科学论文",
            profile_type: RetrievalProfileType::ScientificPaper,
            description: "强调术语一致性和高置信命中，适用于方法/实验类问答。",
            is_default: false,
            overrides: &[
                ("rag_min_top1_score", 0.36),
                ("rag_min_support_score", 0.24),
                ("rag_min_support_count", 2.0),
                ("rag_min_item_score", 0.14),
                ("rag_graph_max_terms", 9.0),
                ("graph_channel_weight", 0.58),
                ("graph_only_penalty", 0.50),
                ("vector_semantic_min", 0.15),
                ("alias_intent_enabled", 0.0),
                ("alias_mining_max_terms", 1.0),
                ("co_reference_enabled", 0.0),
                ("graph_candidate_multiplier", 4.0),
                ("fallback_top1_relax", 0.06),
                ("fallback_support_relax", 0.05),
                ("fallback_item_relax", 0.03),
                ("summary_expand_factor", 3.0),
                ("summary_min_chunks", 9.0),
                ("summary_per_file_cap", 2.0),
                ("summary_min_files", 3.0),
                ("keyword_fallback_max_chunks", 180.0),
                ("keyword_fallback_min_score", 0.10),
                ("keyword_fallback_scan_limit", 6000.0),
            ],
        },
        BuiltinProfile {
            key: "humanities_research",
            name: "文科研究论文",
            profile_type: RetrievalProfileType::HumanitiesPaper,
            description: "适配人物、概念、流派关系，兼顾上下文叙述类问题。",
            is_default: false,
            overrides: &[
                ("rag_min_top1_score", 0.32),
                ("rag_min_support_score", 0.19),
                ("rag_min_support_count", 2.0),
                ("rag_min_item_score", 0.10),
                ("rag_graph_max_terms", 12.0),
                ("graph_channel_weight", 0.62),
                ("graph_only_penalty", 0.52),
                ("vector_semantic_min", 0.12),
                ("alias_mining_max_terms", 6.0),
                ("graph_candidate_multiplier", 4.0),
                ("fallback_top1_relax", 0.08),
                ("fallback_support_relax", 0.06),
                ("fallback_item_relax", 0.04),
                ("summary_expand_factor", 4.0),
                ("summary_min_chunks", 10.0),
                ("summary_per_file_cap", 3.0),
                ("summary_min_files", 4.0),
                ("keyword_fallback_max_chunks", 220.0),
                ("keyword_fallback_min_score", 0.08),
                ("keyword_fallback_scan_limit", 8000.0),
            ],
        },
    ]
}

fn overrides_to_map(pairs: &[(&str, f64)]) -> Map<String, Value> {
    let bool_keys = ["alias_intent_enabled", "co_reference_enabled", "summary_intent_enabled", "fallback_relax_enabled", "keyword_fallback_expand_on_weak_hits"];
    let mut map = Map::new();
    for (key, value) in pairs {
        if bool_keys.contains(key) {
            map.insert((*key).to_string(), Value::Bool(*value != 0.0));
        } else {
            map.insert((*key).to_string(), serde_json::json!(value));
        }
    }
    map
}

/// Normalizes a user-supplied profile key: non-alphanumeric runs become a
/// single underscore, trimmed, and clamped to `[2, 80]` characters.
pub fn normalize_profile_key(value: &str) -> AppResult<String> {
    let lowered = value.trim().to_lowercase();
    let mut cleaned = String::with_capacity(lowered.len());
    let mut last_was_underscore = false;
    for c in lowered.chars() {
        if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
            cleaned.push(c);
            last_was_underscore = c == '_';
        } else if !last_was_underscore {
            cleaned.push('_');
            last_was_underscore = true;
        }
    }
    let trimmed = cleaned.trim_matches('_');
    if trimmed.chars().count() < 2 {
        return Err(AppError::Validation("profile_key is invalid".to_string()));
    }
    Ok(trimmed.chars().take(80).collect())
}

/// Seeds the five built-in profiles if they are missing, and guarantees
/// exactly one active profile is marked default.
pub async fn ensure_default_profiles(pool: &SqlitePool) -> AppResult<()> {
    let existing: Vec<String> = sqlx::query("SELECT profile_key FROM retrieval_profiles")
        .fetch_all(pool)
        .await?
        .into_iter()
        .map(|row| row.get::<String, _>("profile_key"))
        .collect();

    for profile in builtin_profiles() {
        if existing.iter().any(|k| k == profile.key) {
            continue;
        }
        let config = build_runtime_retrieval_config(Some(&overrides_to_map(profile.overrides)));
        let config_json = serde_json::to_string(&config).map_err(|e| AppError::Internal(e.to_string()))?;
        sqlx::query(
            "INSERT INTO retrieval_profiles \
             (id, profile_key, name, profile_type, description, config_json, is_default, is_builtin, is_active, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, 1, 1, ?)",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(profile.key)
        .bind(profile.name)
        .bind(profile_type_as_str(profile.profile_type))
        .bind(profile.description)
        .bind(config_json)
        .bind(profile.is_default)
        .bind(Utc::now().timestamp())
        .execute(pool)
        .await?;
    }

    let has_default: Option<i64> = sqlx::query_scalar(
        "SELECT 1 FROM retrieval_profiles WHERE is_default = 1 AND is_active = 1 LIMIT 1",
    )
    .fetch_optional(pool)
    .await?;

    if has_default.is_none() {
        sqlx::query(
            "UPDATE retrieval_profiles SET is_default = 1 WHERE id = (\
               SELECT id FROM retrieval_profiles WHERE is_active = 1 \
               ORDER BY is_builtin DESC, created_at ASC LIMIT 1)",
        )
        .execute(pool)
        .await?;
    }

    Ok(())
}

fn profile_type_as_str(t: RetrievalProfileType) -> &'static str {
    match t {
        RetrievalProfileType::General => "general",
        RetrievalProfileType::NovelStory => "novel_story",
        RetrievalProfileType::EnterpriseDocs => "enterprise_docs",
        RetrievalProfileType::ScientificPaper => "scientific_paper",
        RetrievalProfileType::HumanitiesPaper => "humanities_paper",
    }
}

/// Resolves a profile id to its clamped runtime config, falling back to
/// the active default profile, and finally to the hardcoded defaults if no
/// profile row exists at all.
pub async fn resolve_config(pool: &SqlitePool, profile_id: Option<Uuid>) -> AppResult<(Option<Uuid>, RetrievalConfig)> {
    let row = if let Some(id) = profile_id {
        sqlx::query("SELECT id, config_json FROM retrieval_profiles WHERE id = ? AND is_active = 1")
            .bind(id.to_string())
            .fetch_optional(pool)
            .await?
    } else {
        None
    };

    let row = match row {
        Some(r) => Some(r),
        None => {
            sqlx::query(
                "SELECT id, config_json FROM retrieval_profiles WHERE is_active = 1 AND is_default = 1 \
                 ORDER BY created_at ASC LIMIT 1",
            )
            .fetch_optional(pool)
            .await?
        }
    };

    match row {
        Some(row) => {
            let id: String = row.try_get("id")?;
            let config_json: String = row.try_get("config_json")?;
            let config: RetrievalConfig =
                serde_json::from_str(&config_json).map_err(|e| AppError::Internal(e.to_string()))?;
            let uuid = Uuid::parse_str(&id).map_err(|e| AppError::Internal(e.to_string()))?;
            Ok((Some(uuid), config))
        }
        None => Ok((None, build_runtime_retrieval_config(None))),
    }
}

/// One row of `retrieval_profiles`, as returned to the profile CRUD
/// endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct ProfileRow {
    pub id: Uuid,
    pub profile_key: String,
    pub name: String,
    pub profile_type: String,
    pub description: Option<String>,
    pub config: RetrievalConfig,
    pub is_default: bool,
    pub is_builtin: bool,
    pub is_active: bool,
}

fn row_to_profile(row: &sqlx::sqlite::SqliteRow) -> AppResult<ProfileRow> {
    let id: String = row.try_get("id")?;
    let config_json: String = row.try_get("config_json")?;
    Ok(ProfileRow {
        id: Uuid::parse_str(&id).map_err(|e| AppError::Internal(e.to_string()))?,
        profile_key: row.try_get("profile_key")?,
        name: row.try_get("name")?,
        profile_type: row.try_get("profile_type")?,
        description: row.try_get("description")?,
        config: serde_json::from_str(&config_json).map_err(|e| AppError::Internal(e.to_string()))?,
        is_default: row.try_get::<i64, _>("is_default")? != 0,
        is_builtin: row.try_get::<i64, _>("is_builtin")? != 0,
        is_active: row.try_get::<i64, _>("is_active")? != 0,
    })
}

pub async fn list_profiles(pool: &SqlitePool) -> AppResult<Vec<ProfileRow>> {
    let rows = sqlx::query(
        "SELECT id, profile_key, name, profile_type, description, config_json, is_default, is_builtin, is_active \
         FROM retrieval_profiles ORDER BY is_builtin DESC, created_at ASC",
    )
    .fetch_all(pool)
    .await?;
    rows.iter().map(row_to_profile).collect()
}

/// Creates a profile from raw numeric/boolean overrides. `profile_key` is
/// normalized and must be unique; setting `is_default` unsets any existing
/// default in the same transaction.
pub async fn create_profile(
    pool: &SqlitePool,
    raw_key: &str,
    name: &str,
    profile_type: RetrievalProfileType,
    description: Option<&str>,
    overrides: &Map<String, Value>,
    is_default: bool,
) -> AppResult<ProfileRow> {
    let profile_key = normalize_profile_key(raw_key)?;
    let existing: Option<i64> = sqlx::query_scalar("SELECT 1 FROM retrieval_profiles WHERE profile_key = ?")
        .bind(&profile_key)
        .fetch_optional(pool)
        .await?;
    if existing.is_some() {
        return Err(AppError::Validation(format!("profile_key '{profile_key}' already exists")));
    }

    let config = build_runtime_retrieval_config(Some(overrides));
    let config_json = serde_json::to_string(&config).map_err(|e| AppError::Internal(e.to_string()))?;
    let id = Uuid::new_v4();

    let mut tx = pool.begin().await?;
    if is_default {
        sqlx::query("UPDATE retrieval_profiles SET is_default = 0").execute(&mut *tx).await?;
    }
    sqlx::query(
        "INSERT INTO retrieval_profiles \
         (id, profile_key, name, profile_type, description, config_json, is_default, is_builtin, is_active, created_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, 0, 1, ?)",
    )
    .bind(id.to_string())
    .bind(&profile_key)
    .bind(name)
    .bind(profile_type_as_str(profile_type))
    .bind(description)
    .bind(&config_json)
    .bind(is_default)
    .bind(Utc::now().timestamp())
    .execute(&mut *tx)
    .await?;
    tx.commit().await?;

    Ok(ProfileRow {
        id,
        profile_key,
        name: name.to_string(),
        profile_type: profile_type_as_str(profile_type).to_string(),
        description: description.map(|s| s.to_string()),
        config,
        is_default,
        is_builtin: false,
        is_active: true,
    })
}

/// Applies `overrides` over a profile's existing config and optionally
/// renames/redescribes it or flips its default flag. Built-ins may have
/// their config tuned but not their `profile_key`.
pub async fn update_profile(
    pool: &SqlitePool,
    id: Uuid,
    name: Option<&str>,
    description: Option<&str>,
    overrides: Option<&Map<String, Value>>,
    is_default: Option<bool>,
) -> AppResult<ProfileRow> {
    let row = sqlx::query("SELECT config_json FROM retrieval_profiles WHERE id = ?")
        .bind(id.to_string())
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| AppError::NotFound("retrieval profile not found".to_string()))?;
    let current_json: String = row.try_get("config_json")?;
    let current: Map<String, Value> = serde_json::from_str(&current_json).map_err(|e| AppError::Internal(e.to_string()))?;

    let merged_overrides = match overrides {
        Some(o) => {
            let mut merged = current;
            for (k, v) in o {
                merged.insert(k.clone(), v.clone());
            }
            merged
        }
        None => current,
    };
    let config = build_runtime_retrieval_config(Some(&merged_overrides));
    let config_json = serde_json::to_string(&config).map_err(|e| AppError::Internal(e.to_string()))?;

    let mut tx = pool.begin().await?;
    if is_default == Some(true) {
        sqlx::query("UPDATE retrieval_profiles SET is_default = 0").execute(&mut *tx).await?;
    }
    sqlx::query(
        "UPDATE retrieval_profiles SET \
           name = COALESCE(?, name), description = COALESCE(?, description), \
           config_json = ?, is_default = COALESCE(?, is_default) \
         WHERE id = ?",
    )
    .bind(name)
    .bind(description)
    .bind(&config_json)
    .bind(is_default)
    .bind(id.to_string())
    .execute(&mut *tx)
    .await?;
    tx.commit().await?;

    list_profiles(pool)
        .await?
        .into_iter()
        .find(|p| p.id == id)
        .ok_or_else(|| AppError::NotFound("retrieval profile not found".to_string()))
}

/// Deletes a non-builtin profile. Deleting the current default promotes the
/// oldest remaining built-in to default.
pub async fn delete_profile(pool: &SqlitePool, id: Uuid) -> AppResult<()> {
    let row = sqlx::query("SELECT is_builtin, is_default FROM retrieval_profiles WHERE id = ?")
        .bind(id.to_string())
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| AppError::NotFound("retrieval profile not found".to_string()))?;
    if row.try_get::<i64, _>("is_builtin")? != 0 {
        return Err(AppError::Validation("built-in profiles cannot be deleted".to_string()));
    }
    let was_default = row.try_get::<i64, _>("is_default")? != 0;

    let mut tx = pool.begin().await?;
    sqlx::query("DELETE FROM retrieval_profiles WHERE id = ?").bind(id.to_string()).execute(&mut *tx).await?;
    if was_default {
        sqlx::query(
            "UPDATE retrieval_profiles SET is_default = 1 WHERE id = (\
               SELECT id FROM retrieval_profiles WHERE is_active = 1 \
               ORDER BY is_builtin DESC, created_at ASC LIMIT 1)",
        )
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_matches_documented_values() {
        let config = build_runtime_retrieval_config(None);
        assert_eq!(config.rag_min_top1_score, 0.30);
        assert_eq!(config.rag_min_support_count, 2);
        assert_eq!(config.keyword_fallback_scan_limit, 8000);
    }

    #[test]
    fn overrides_are_clamped() {
        let mut overrides = Map::new();
        overrides.insert("rag_min_support_count".to_string(), serde_json::json!(999));
        let config = build_runtime_retrieval_config(Some(&overrides));
        assert_eq!(config.rag_min_support_count, 8);
    }

    #[test]
    fn invalid_override_falls_back_to_default() {
        let mut overrides = Map::new();
        overrides.insert("rag_min_top1_score".to_string(), Value::String("oops".to_string()));
        let config = build_runtime_retrieval_config(Some(&overrides));
        assert_eq!(config.rag_min_top1_score, 0.30);
    }

    #[test]
    fn normalizes_profile_key() {
        assert_eq!(normalize_profile_key("  Hello World!! ").unwrap(), "hello_world");
    }

    #[test]
    fn rejects_too_short_profile_key() {
        assert!(normalize_profile_key("!").is_err());
    }

    #[test]
    fn builtin_profiles_cover_all_five_types() {
        assert_eq!(builtin_profiles().len(), 5);
    }
}
