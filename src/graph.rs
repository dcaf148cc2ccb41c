//! Knowledge-graph builder and graph-guided query expansion (C4 + C5).
//!
//! `rebuild_library_graph` mines entities and co-occurrence relations from
//! every chunk of a library and replaces the library's graph atomically.
//! `expand_query_terms` walks that graph from a query's matched entities to
//! surface related terms for the keyword and graph retrieval channels, and
//! optionally runs alias mining or roster mining depending on query intent.

use std::collections::{HashMap, HashSet};

use chrono::Utc;
use regex::Regex;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::error::AppResult;
use crate::models::{EntityMetadata, RelationType};
use crate::tokenize::{extract_entities_from_text, extract_relations_from_text, normalize_entity};

const TITLE_SUFFIXES: &[&str] = &[
    "市长", "副市长", "省长", "副省长", "书记", "副书记", "主席", "副主席", "主任", "副主任",
    "厅长", "副厅长", "局长", "副局长", "处长", "副处长", "院长", "副院长", "校长", "副校长",
    "总裁", "副总裁", "总经理", "副总经理", "董事长", "经理", "老板", "教授", "老师",
];

const ROSTER_NOUNS: &[&str] = &["师徒", "徒弟", "成员", "团队", "同伴", "同行", "取经"];

pub struct GraphRebuildSummary {
    pub library_id: Uuid,
    pub node_count: i64,
    pub edge_count: i64,
    pub chunk_count: i64,
}

/// Deletes then repopulates every entity and relation for `library_id` in
/// one transaction, mirroring the delete-then-insert shape used for
/// profile and graph writers across this store.
pub async fn rebuild_library_graph(pool: &SqlitePool, library_id: Uuid) -> AppResult<GraphRebuildSummary> {
    let mut tx = pool.begin().await?;
    sqlx::query("DELETE FROM knowledge_relations WHERE library_id = ?")
        .bind(library_id.to_string())
        .execute(&mut *tx)
        .await?;
    sqlx::query("DELETE FROM knowledge_entities WHERE library_id = ?")
        .bind(library_id.to_string())
        .execute(&mut *tx)
        .await?;

    let chunk_rows = sqlx::query("SELECT content FROM chunks WHERE library_id = ?")
        .bind(library_id.to_string())
        .fetch_all(&mut *tx)
        .await?;
    let contents: Vec<String> = chunk_rows.iter().map(|r| r.get::<String, _>("content")).collect();

    let mut entity_counter: HashMap<String, (String, i64)> = HashMap::new();
    let mut relation_counter: HashMap<(String, String, RelationType), (i64, Vec<String>)> = HashMap::new();

    for content in &contents {
        let chunk_entities = extract_entities_from_text(content, 20);
        for display_name in &chunk_entities {
            let normalized = normalize_entity(display_name);
            entity_counter
                .entry(normalized)
                .and_modify(|(_, freq)| *freq += 1)
                .or_insert_with(|| (display_name.clone(), 1));
        }

        for relation in extract_relations_from_text(content) {
            let source_norm = normalize_entity(&relation.source);
            let target_norm = normalize_entity(&relation.target);
            if !entity_counter.contains_key(&source_norm) || !entity_counter.contains_key(&target_norm) {
                continue;
            }
            let key = (source_norm, target_norm, relation.relation_type);
            let entry = relation_counter.entry(key).or_insert_with(|| (0, Vec::new()));
            entry.0 += 1;
            if entry.1.len() < 3 && !entry.1.contains(&relation.evidence) {
                entry.1.push(relation.evidence);
            }
        }
    }

    if entity_counter.is_empty() {
        tx.commit().await?;
        return Ok(GraphRebuildSummary {
            library_id,
            node_count: 0,
            edge_count: 0,
            chunk_count: contents.len() as i64,
        });
    }

    let mut entity_id_by_name = HashMap::new();
    for (normalized, (display_name, frequency)) in &entity_counter {
        let id = Uuid::new_v4();
        entity_id_by_name.insert(normalized.clone(), id);
        let metadata = serde_json::to_string(&EntityMetadata::default()).unwrap_or_else(|_| "{}".to_string());
        sqlx::query(
            "INSERT INTO knowledge_entities (id, library_id, name, display_name, entity_type, frequency, metadata_json) \
             VALUES (?, ?, ?, ?, 'concept', ?, ?) \
             ON CONFLICT(library_id, name) DO UPDATE SET frequency = excluded.frequency",
        )
        .bind(id.to_string())
        .bind(library_id.to_string())
        .bind(normalized)
        .bind(display_name)
        .bind(*frequency)
        .bind(metadata)
        .execute(&mut *tx)
        .await?;
    }

    let mut edge_count: i64 = 0;
    for ((source_norm, target_norm, relation_type), (weight, evidence)) in relation_counter {
        let (Some(&source_id), Some(&target_id)) =
            (entity_id_by_name.get(&source_norm), entity_id_by_name.get(&target_norm))
        else {
            continue;
        };
        let evidence_json = serde_json::to_string(&evidence).unwrap_or_else(|_| "[]".to_string());
        sqlx::query(
            "INSERT INTO knowledge_relations \
             (id, library_id, source_entity_id, target_entity_id, relation_type, weight, evidence_json) \
             VALUES (?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT(library_id, source_entity_id, target_entity_id, relation_type) \
             DO UPDATE SET weight = weight + excluded.weight",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(library_id.to_string())
        .bind(source_id.to_string())
        .bind(target_id.to_string())
        .bind(relation_type.as_str())
        .bind(weight)
        .bind(evidence_json)
        .execute(&mut *tx)
        .await?;
        edge_count += 1;
    }

    tx.commit().await?;
    let _ = Utc::now();
    Ok(GraphRebuildSummary {
        library_id,
        node_count: entity_counter.len() as i64,
        edge_count,
        chunk_count: contents.len() as i64,
    })
}

struct EntityRow {
    id: Uuid,
    name: String,
    display_name: String,
    frequency: i64,
}

async fn load_entities(pool: &SqlitePool, library_ids: &[Uuid]) -> AppResult<Vec<EntityRow>> {
    if library_ids.is_empty() {
        return Ok(Vec::new());
    }
    let placeholders = library_ids.iter().map(|_| "?").collect::<Vec<_>>().join(",");
    let sql = format!(
        "SELECT id, name, display_name, frequency FROM knowledge_entities WHERE library_id IN ({placeholders})"
    );
    let mut query = sqlx::query(&sql);
    for id in library_ids {
        query = query.bind(id.to_string());
    }
    let rows = query.fetch_all(pool).await?;
    rows.into_iter()
        .map(|row| {
            Ok(EntityRow {
                id: Uuid::parse_str(&row.try_get::<String, _>("id")?)
                    .map_err(|e| crate::error::AppError::Internal(e.to_string()))?,
                name: row.try_get("name")?,
                display_name: row.try_get("display_name")?,
                frequency: row.try_get("frequency")?,
            })
        })
        .collect()
}

/// Result of mapping query text onto the library graph: the expanded term
/// list used to widen the graph retrieval channel, and the entity display
/// names the query actually matched.
pub struct ExpansionResult {
    pub expanded_terms: Vec<String>,
    pub matched_entities: Vec<String>,
}

/// Maps query entity candidates onto graph nodes (exact match, then
/// title-suffix-stripped fuzzy match) and walks weighted neighbors to
/// produce an expanded term set.
pub async fn expand_query_terms(
    pool: &SqlitePool,
    library_ids: &[Uuid],
    query: &str,
    max_terms: usize,
) -> AppResult<ExpansionResult> {
    let query_entities = extract_entities_from_text(query, max_terms);
    if query_entities.is_empty() {
        return Ok(ExpansionResult { expanded_terms: Vec::new(), matched_entities: Vec::new() });
    }

    let entities = load_entities(pool, library_ids).await?;
    let names: HashSet<&str> = entities.iter().map(|e| e.name.as_str()).collect();
    let display_names: HashSet<&str> = entities.iter().map(|e| e.display_name.as_str()).collect();

    let mut expanded_query_entities: Vec<String> = Vec::new();
    for qe in &query_entities {
        expanded_query_entities.push(qe.clone());
        if !names.contains(qe.as_str()) && !display_names.contains(qe.as_str()) {
            for suffix in TITLE_SUFFIXES {
                if let Some(name_part) = qe.strip_suffix(suffix) {
                    let prefix2: String = name_part.chars().take(2).collect();
                    for entity in &entities {
                        if entity.name.starts_with(&prefix2) || entity.name == name_part {
                            expanded_query_entities.push(entity.name.clone());
                            break;
                        }
                    }
                    for entity in &entities {
                        if (entity.display_name.starts_with(&prefix2) || entity.display_name == name_part)
                            && !expanded_query_entities.contains(&entity.display_name)
                        {
                            expanded_query_entities.push(entity.display_name.clone());
                            break;
                        }
                    }
                    break;
                }
            }
        }
    }

    let mut seen = HashSet::new();
    expanded_query_entities.retain(|e| seen.insert(e.clone()));
    let normalized: Vec<String> = expanded_query_entities.iter().map(|s| normalize_entity(s)).collect();

    let mut matched: Vec<&EntityRow> = entities.iter().filter(|e| normalized.contains(&e.name)).collect();
    if matched.is_empty() {
        let lower_terms: Vec<String> = expanded_query_entities.iter().map(|s| s.to_lowercase()).collect();
        matched = entities
            .iter()
            .filter(|e| lower_terms.iter().any(|t| e.display_name.to_lowercase().contains(t.as_str())))
            .collect();
        matched.sort_by(|a, b| b.frequency.cmp(&a.frequency));
        matched.truncate(max_terms);
    }

    if matched.is_empty() {
        return Ok(ExpansionResult { expanded_terms: Vec::new(), matched_entities: Vec::new() });
    }

    let matched_ids: Vec<Uuid> = matched.iter().map(|e| e.id).collect();
    let matched_names: Vec<String> = matched.iter().map(|e| e.display_name.clone()).collect();

    let linked = load_linked_relations(pool, library_ids, &matched_ids).await?;
    let mut expanded_ids: HashSet<Uuid> = matched_ids.iter().copied().collect();
    for (source, target) in &linked {
        expanded_ids.insert(*source);
        expanded_ids.insert(*target);
    }

    let mut expanded: Vec<&EntityRow> = entities.iter().filter(|e| expanded_ids.contains(&e.id)).collect();
    expanded.sort_by(|a, b| b.frequency.cmp(&a.frequency));
    expanded.truncate(max_terms);

    Ok(ExpansionResult {
        expanded_terms: expanded.into_iter().map(|e| e.display_name.clone()).collect(),
        matched_entities: matched_names,
    })
}

async fn load_linked_relations(
    pool: &SqlitePool,
    library_ids: &[Uuid],
    matched_ids: &[Uuid],
) -> AppResult<Vec<(Uuid, Uuid)>> {
    if matched_ids.is_empty() {
        return Ok(Vec::new());
    }
    let lib_placeholders = library_ids.iter().map(|_| "?").collect::<Vec<_>>().join(",");
    let id_placeholders = matched_ids.iter().map(|_| "?").collect::<Vec<_>>().join(",");
    let sql = format!(
        "SELECT source_entity_id, target_entity_id FROM knowledge_relations \
         WHERE library_id IN ({lib_placeholders}) \
         AND (source_entity_id IN ({id_placeholders}) OR target_entity_id IN ({id_placeholders})) \
         ORDER BY weight DESC LIMIT 80"
    );
    let mut query = sqlx::query(&sql);
    for id in library_ids {
        query = query.bind(id.to_string());
    }
    for id in matched_ids {
        query = query.bind(id.to_string());
    }
    for id in matched_ids {
        query = query.bind(id.to_string());
    }
    let rows = query.fetch_all(pool).await?;
    rows.into_iter()
        .map(|row| {
            Ok((
                Uuid::parse_str(&row.try_get::<String, _>("source_entity_id")?)
                    .map_err(|e| crate::error::AppError::Internal(e.to_string()))?,
                Uuid::parse_str(&row.try_get::<String, _>("target_entity_id")?)
                    .map_err(|e| crate::error::AppError::Internal(e.to_string()))?,
            ))
        })
        .collect()
}

/// Mines up to `max_terms` nickname/alias candidates for entities matched
/// from the query, scanning up to 120 chunks that mention an anchor name.
pub async fn mine_aliases(
    pool: &SqlitePool,
    library_ids: &[Uuid],
    anchor_names: &[String],
    max_terms: usize,
) -> AppResult<Vec<String>> {
    if anchor_names.is_empty() || library_ids.is_empty() {
        return Ok(Vec::new());
    }
    let lib_placeholders = library_ids.iter().map(|_| "?").collect::<Vec<_>>().join(",");
    let term_clause = anchor_names.iter().map(|_| "content LIKE ?").collect::<Vec<_>>().join(" OR ");
    let sql = format!(
        "SELECT content FROM chunks WHERE library_id IN ({lib_placeholders}) AND ({term_clause}) LIMIT 120"
    );
    let mut query = sqlx::query(&sql);
    for id in library_ids {
        query = query.bind(id.to_string());
    }
    for name in anchor_names {
        query = query.bind(format!("%{name}%"));
    }
    let rows = query.fetch_all(pool).await?;

    static NICKNAME_PATTERN: once_cell::sync::Lazy<Regex> =
        once_cell::sync::Lazy::new(|| Regex::new(r#"["“']([\u{4e00}-\u{9fff}]{2,5})["”']"#).unwrap());

    let mut frequency: HashMap<String, i64> = HashMap::new();
    for row in rows {
        let content: String = row.get("content");
        for cap in NICKNAME_PATTERN.captures_iter(&content) {
            let candidate = cap[1].to_string();
            if anchor_names.contains(&candidate) {
                continue;
            }
            *frequency.entry(candidate).or_insert(0) += 1;
        }
    }

    let mut ranked: Vec<(String, i64)> = frequency.into_iter().collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1));
    Ok(ranked.into_iter().take(max_terms).map(|(name, _)| name).collect())
}

/// Weights each neighbor of the entities matching `anchor_names` by
/// `max(1, weight) × relation weight` and returns the top names, excluding
/// the anchors themselves. Triggered by the retrieval engine's roster
/// intent detection.
pub async fn mine_roster(
    pool: &SqlitePool,
    library_ids: &[Uuid],
    anchor_names: &[String],
    max_terms: usize,
) -> AppResult<Vec<String>> {
    if anchor_names.is_empty() {
        return Ok(Vec::new());
    }
    let entities = load_entities(pool, library_ids).await?;
    let normalized_anchors: HashSet<String> = anchor_names.iter().map(|n| normalize_entity(n)).collect();
    let anchor_ids: Vec<Uuid> = entities
        .iter()
        .filter(|e| normalized_anchors.contains(&e.name) || anchor_names.iter().any(|n| n == &e.display_name))
        .map(|e| e.id)
        .collect();
    if anchor_ids.is_empty() {
        return Ok(Vec::new());
    }
    let name_by_id: HashMap<Uuid, &EntityRow> = entities.iter().map(|e| (e.id, e)).collect();

    let linked = load_linked_relations_with_weight(pool, library_ids, &anchor_ids).await?;
    let anchor_set: HashSet<Uuid> = anchor_ids.iter().copied().collect();

    let mut scored: HashMap<Uuid, f64> = HashMap::new();
    for (source, target, weight, relation_type) in linked {
        let neighbor = if anchor_set.contains(&source) && !anchor_set.contains(&target) {
            Some(target)
        } else if anchor_set.contains(&target) && !anchor_set.contains(&source) {
            Some(source)
        } else {
            None
        };
        let Some(neighbor) = neighbor else { continue };
        let score = (weight.max(1) as f64) * relation_type.roster_weight();
        *scored.entry(neighbor).or_insert(0.0) += score;
    }

    let mut ranked: Vec<(Uuid, f64)> = scored.into_iter().collect();
    ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

    Ok(ranked
        .into_iter()
        .filter_map(|(id, _)| name_by_id.get(&id).map(|e| e.display_name.clone()))
        .take(max_terms)
        .collect())
}

async fn load_linked_relations_with_weight(
    pool: &SqlitePool,
    library_ids: &[Uuid],
    anchor_ids: &[Uuid],
) -> AppResult<Vec<(Uuid, Uuid, i64, RelationType)>> {
    if anchor_ids.is_empty() {
        return Ok(Vec::new());
    }
    let lib_placeholders = library_ids.iter().map(|_| "?").collect::<Vec<_>>().join(",");
    let id_placeholders = anchor_ids.iter().map(|_| "?").collect::<Vec<_>>().join(",");
    let sql = format!(
        "SELECT source_entity_id, target_entity_id, weight, relation_type FROM knowledge_relations \
         WHERE library_id IN ({lib_placeholders}) \
         AND (source_entity_id IN ({id_placeholders}) OR target_entity_id IN ({id_placeholders}))"
    );
    let mut query = sqlx::query(&sql);
    for id in library_ids {
        query = query.bind(id.to_string());
    }
    for id in anchor_ids {
        query = query.bind(id.to_string());
    }
    for id in anchor_ids {
        query = query.bind(id.to_string());
    }
    let rows = query.fetch_all(pool).await?;
    rows.into_iter()
        .filter_map(|row| {
            let relation_type = RelationType::from_str(&row.get::<String, _>("relation_type"))?;
            Some(Ok((
                Uuid::parse_str(&row.get::<String, _>("source_entity_id")).ok()?,
                Uuid::parse_str(&row.get::<String, _>("target_entity_id")).ok()?,
                row.get::<i64, _>("weight"),
                relation_type,
            )))
        })
        .collect::<AppResult<Vec<_>>>()
}

pub fn is_roster_noun(term: &str) -> bool {
    ROSTER_NOUNS.iter().any(|n| term.contains(n))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roster_noun_detection() {
        assert!(is_roster_noun("师徒四人"));
        assert!(!is_roster_noun("风景"));
    }
}
