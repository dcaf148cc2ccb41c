//! Hybrid retrieval engine (C7): the core query path.
//!
//! Three channels (vector, keyword, graph) run concurrently, are fused by
//! `chunk_id`, gated for acceptance, relaxed and backed by a keyword
//! fallback when the gate fails, and finally diversified across files in
//! summary mode. Every constant and formula here is load-bearing: small
//! changes shift which chunks clear the acceptance gate.

use std::collections::{HashMap, HashSet};

use once_cell::sync::Lazy;
use regex::Regex;
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::chunks::{rank_by_cosine, search_substring, KeywordHit, VectorHit};
use crate::config::EmbeddingConfig;
use crate::embedding::embed_query;
use crate::error::{AppError, AppResult};
use crate::graph::{expand_query_terms, mine_aliases, mine_roster};
use crate::models::Citation;
use crate::profiles::RetrievalConfig;
use crate::tokenize::{extract_entities_from_text, normalize_entity, tokenize_for_search};

const NOISE_TERMS: &[&str] = &["几个", "多少", "哪些", "怎么", "请问", "一下"];
const ROSTER_NOUNS: &[&str] = &["师徒", "徒弟", "成员", "团队", "同伴", "同行", "取经"];

static SUMMARY_PATTERN: Lazy<Regex> = Lazy::new(|| Regex::new(r"全面|总结|概述|综述|整体介绍").unwrap());
static COREFERENCE_PATTERN: Lazy<Regex> = Lazy::new(|| Regex::new(r"他|她|它|其(?:中|他)?").unwrap());
static COUNT_PATTERN: Lazy<Regex> = Lazy::new(|| Regex::new(r"(几|多少)[个位条项次]?").unwrap());
static ROSTER_INTENT_PATTERN: Lazy<Regex> = Lazy::new(|| Regex::new(r"哪些|都有谁|有谁").unwrap());
static GROUP_PATTERN: Lazy<Regex> = Lazy::new(|| Regex::new(r"分组|各组|小组|阵营|团队").unwrap());
static COUNT_UNIT_IN_TEXT: Lazy<Regex> = Lazy::new(|| Regex::new(r"\d+\s*[个位条项次人]").unwrap());

/// One ranked retrieval result, carrying the per-channel evidence the
/// acceptance gate and the citation builder both need.
#[derive(Debug, Clone)]
pub struct RetrievalHit {
    pub chunk_id: Uuid,
    pub file_id: Uuid,
    pub library_id: Uuid,
    pub file_name: String,
    pub snippet: String,
    pub score: f64,
    pub source: String,
    pub vector_similarity: f64,
    pub keyword_overlap: f64,
    pub graph_overlap: f64,
    pub entity_overlap: f64,
    pub anchor_overlap: f64,
    pub query_focus_overlap: f64,
    pub matched_entities: Vec<String>,
}

impl RetrievalHit {
    pub fn to_citation(&self) -> Citation {
        Citation {
            library_id: self.library_id,
            file_id: self.file_id,
            file_name: self.file_name.clone(),
            chunk_id: self.chunk_id,
            score: self.score,
            snippet: self.snippet.clone(),
            source: self.source.clone(),
            matched_entities: self.matched_entities.clone(),
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct Intents {
    summary_mode: bool,
    alias_intent: bool,
    coreference_intent: bool,
    count_intent: bool,
    roster_intent: bool,
    group_count: bool,
}

fn detect_intents(query: &str) -> Intents {
    let count_intent = COUNT_PATTERN.is_match(query);
    let roster_intent = ROSTER_INTENT_PATTERN.is_match(query) || ROSTER_NOUNS.iter().any(|n| query.contains(n));
    Intents {
        summary_mode: SUMMARY_PATTERN.is_match(query),
        alias_intent: query.contains("别名") || query.contains("又叫") || query.contains("外号") || query.contains("绰号"),
        coreference_intent: COREFERENCE_PATTERN.is_match(query),
        count_intent,
        roster_intent,
        group_count: count_intent && GROUP_PATTERN.is_match(query),
    }
}

struct QueryPlan {
    intents: Intents,
    contextual_query: String,
    keyword_queries: Vec<String>,
    keyword_term_set: HashSet<String>,
    query_focus_terms: Vec<String>,
    anchor_term_set: HashSet<String>,
    matched_entity_names: Vec<String>,
}

async fn build_query_plan(
    pool: &SqlitePool,
    library_ids: &[Uuid],
    query: &str,
    history_context: &[String],
    config: &RetrievalConfig,
) -> AppResult<QueryPlan> {
    let mut intents = detect_intents(query);
    if !config.summary_intent_enabled {
        intents.summary_mode = false;
    }

    let mut query_entities = extract_entities_from_text(query, 16);
    let mut context_entities: Vec<String> = Vec::new();
    let coreference_hit = intents.coreference_intent && config.co_reference_enabled;
    if coreference_hit || intents.alias_intent || query_entities.is_empty() {
        for msg in history_context.iter().rev() {
            let mined = extract_entities_from_text(msg, 2);
            context_entities.extend(mined);
            if context_entities.len() >= 2 {
                break;
            }
        }
        context_entities.truncate(2);
    }

    let mut contextual_query = query.to_string();
    let mut added = 0;
    for e in &context_entities {
        if !query.contains(e.as_str()) && added < 3 {
            contextual_query.push(' ');
            contextual_query.push_str(e);
            added += 1;
        }
    }

    let expansion = expand_query_terms(
        pool,
        library_ids,
        &contextual_query,
        config.rag_graph_max_terms.max(1) as usize,
    )
    .await?;
    query_entities.extend(expansion.matched_entities.iter().cloned());

    if intents.alias_intent && config.alias_intent_enabled {
        let anchors: Vec<String> = query_entities.clone();
        let aliases = mine_aliases(pool, library_ids, &anchors, config.alias_mining_max_terms.max(1) as usize).await?;
        query_entities.extend(aliases);
    }

    if intents.roster_intent {
        let anchors: Vec<String> = query_entities.clone();
        let roster = mine_roster(pool, library_ids, &anchors, config.alias_mining_max_terms.max(1) as usize).await?;
        query_entities.extend(roster);
    }

    let mut keyword_queries: Vec<String> = vec![query.to_string(), contextual_query.clone()];
    keyword_queries.extend(query_entities.iter().cloned());
    keyword_queries.extend(tokenize_for_search(query));
    keyword_queries.extend(tokenize_for_search(&contextual_query));
    if intents.count_intent && intents.roster_intent {
        keyword_queries.extend(ROSTER_NOUNS.iter().map(|s| s.to_string()));
    }
    keyword_queries.retain(|t| !NOISE_TERMS.contains(&t.as_str()) && t.chars().count() >= 2);

    let mut seen = HashSet::new();
    keyword_queries.retain(|t| seen.insert(t.clone()));
    keyword_queries.truncate(64);

    let keyword_term_set: HashSet<String> = keyword_queries.iter().map(|t| normalize_entity(t)).collect();

    let mut query_focus_terms: Vec<String> = tokenize_for_search(query);
    query_focus_terms.retain(|t| !NOISE_TERMS.contains(&t.as_str()));
    query_focus_terms.truncate(8);

    let anchor_cap = if intents.roster_intent { 16 } else { 12 };
    let mut anchor_term_set: Vec<String> = Vec::new();
    anchor_term_set.extend(query_entities.iter().map(|e| normalize_entity(e)));
    anchor_term_set.extend(context_entities.iter().map(|e| normalize_entity(e)));
    anchor_term_set.extend(query_focus_terms.iter().cloned());
    let mut seen = HashSet::new();
    anchor_term_set.retain(|t| seen.insert(t.clone()));
    anchor_term_set.truncate(anchor_cap);

    Ok(QueryPlan {
        intents,
        contextual_query,
        keyword_queries,
        keyword_term_set,
        query_focus_terms,
        anchor_term_set: anchor_term_set.into_iter().collect(),
        matched_entity_names: expansion.expanded_terms,
    })
}

fn overlap_ratio(content: &str, terms: &HashSet<String>) -> f64 {
    if terms.is_empty() {
        return 0.0;
    }
    let lower = content.to_lowercase();
    let hits = terms.iter().filter(|t| !t.is_empty() && lower.contains(t.as_str())).count();
    hits as f64 / terms.len() as f64
}

fn count_boost(intents: &Intents, content: &str) -> f64 {
    if intents.count_intent && COUNT_UNIT_IN_TEXT.is_match(content) {
        0.10
    } else {
        0.0
    }
}

fn roster_boost(intents: &Intents, content: &str) -> f64 {
    if intents.roster_intent && ROSTER_NOUNS.iter().any(|n| content.contains(n)) {
        0.10
    } else {
        0.0
    }
}

async fn vector_channel(
    pool: &SqlitePool,
    library_ids: &[Uuid],
    query_embedding: &[f32],
    limit: usize,
) -> AppResult<Vec<(VectorHit, f64)>> {
    let hits = rank_by_cosine(pool, library_ids, query_embedding, limit).await?;
    Ok(hits
        .into_iter()
        .enumerate()
        .map(|(rank, hit)| {
            let score = 0.85 * hit.similarity + 0.15 * (1.0 / (rank as f64 + 1.0));
            (hit, score)
        })
        .collect())
}

async fn keyword_channel(
    pool: &SqlitePool,
    library_ids: &[Uuid],
    plan: &QueryPlan,
    scan_limit: usize,
    keep_limit: usize,
) -> AppResult<Vec<(KeywordHit, f64)>> {
    let hits = search_substring(pool, library_ids, &plan.keyword_queries, scan_limit).await?;
    let mut scored: Vec<(KeywordHit, f64)> = hits
        .into_iter()
        .filter_map(|hit| {
            let keyword_overlap = overlap_ratio(&hit.chunk.content, &plan.keyword_term_set);
            let anchor_overlap = overlap_ratio(&hit.chunk.content, &plan.anchor_term_set);
            let local = 0.52 * keyword_overlap
                + 0.32 * anchor_overlap
                + count_boost(&plan.intents, &hit.chunk.content)
                + roster_boost(&plan.intents, &hit.chunk.content);
            if local <= 0.0 {
                None
            } else {
                Some((hit, local))
            }
        })
        .collect();
    scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    scored.truncate(keep_limit);
    Ok(scored)
}

async fn graph_channel(
    pool: &SqlitePool,
    library_ids: &[Uuid],
    plan: &QueryPlan,
    config: &RetrievalConfig,
    scan_limit: usize,
) -> AppResult<Vec<(KeywordHit, f64)>> {
    if plan.matched_entity_names.is_empty() {
        return Ok(Vec::new());
    }
    let graph_terms: Vec<String> = plan.matched_entity_names.clone();
    let hits = search_substring(pool, library_ids, &graph_terms, scan_limit).await?;
    let total_terms = graph_terms.len().max(1) as f64;

    let mut scored: Vec<(KeywordHit, f64)> = hits
        .into_iter()
        .enumerate()
        .map(|(rank, hit)| {
            let hit_ratio = hit.matched_terms as f64 / total_terms;
            let entity_overlap = overlap_ratio(&hit.chunk.content, &plan.anchor_term_set);
            let mut score =
                config.graph_channel_weight * (0.55 * hit_ratio + 0.35 * (1.0 / (rank as f64 + 1.0)) + 0.10 * entity_overlap);
            let keyword_overlap = overlap_ratio(&hit.chunk.content, &plan.keyword_term_set);
            if keyword_overlap == 0.0 && entity_overlap == 0.0 {
                score *= config.graph_only_penalty;
            }
            (hit, score)
        })
        .collect();
    scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    Ok(scored)
}

#[derive(Clone)]
struct FusedRecord {
    chunk_id: Uuid,
    file_id: Uuid,
    library_id: Uuid,
    file_name: String,
    content: String,
    score: f64,
    sources: HashSet<String>,
    vector_similarity: f64,
    keyword_overlap: f64,
    graph_overlap: f64,
    entity_overlap: f64,
    anchor_overlap: f64,
}

fn fuse(
    vector_hits: Vec<(VectorHit, f64)>,
    keyword_hits: Vec<(KeywordHit, f64)>,
    graph_hits: Vec<(KeywordHit, f64)>,
    plan: &QueryPlan,
) -> Vec<FusedRecord> {
    let mut records: HashMap<Uuid, FusedRecord> = HashMap::new();

    for (hit, score) in vector_hits {
        let entry = records.entry(hit.chunk.id).or_insert_with(|| FusedRecord {
            chunk_id: hit.chunk.id,
            file_id: hit.chunk.file_id,
            library_id: hit.chunk.library_id,
            file_name: hit.file_name.clone(),
            content: hit.chunk.content.clone(),
            score: 0.0,
            sources: HashSet::new(),
            vector_similarity: 0.0,
            keyword_overlap: 0.0,
            graph_overlap: 0.0,
            entity_overlap: 0.0,
            anchor_overlap: 0.0,
        });
        entry.score += score;
        entry.sources.insert("vector".to_string());
        entry.vector_similarity = entry.vector_similarity.max(hit.similarity);
    }

    for (hit, score) in keyword_hits {
        let keyword_overlap = overlap_ratio(&hit.chunk.content, &plan.keyword_term_set);
        let anchor_overlap = overlap_ratio(&hit.chunk.content, &plan.anchor_term_set);
        let entry = records.entry(hit.chunk.id).or_insert_with(|| FusedRecord {
            chunk_id: hit.chunk.id,
            file_id: hit.chunk.file_id,
            library_id: hit.chunk.library_id,
            file_name: hit.file_name.clone(),
            content: hit.chunk.content.clone(),
            score: 0.0,
            sources: HashSet::new(),
            vector_similarity: 0.0,
            keyword_overlap: 0.0,
            graph_overlap: 0.0,
            entity_overlap: 0.0,
            anchor_overlap: 0.0,
        });
        entry.score += score;
        entry.sources.insert("keyword".to_string());
        entry.keyword_overlap = entry.keyword_overlap.max(keyword_overlap);
        entry.anchor_overlap = entry.anchor_overlap.max(anchor_overlap);
    }

    for (hit, score) in graph_hits {
        let entity_overlap = overlap_ratio(&hit.chunk.content, &plan.anchor_term_set);
        let entry = records.entry(hit.chunk.id).or_insert_with(|| FusedRecord {
            chunk_id: hit.chunk.id,
            file_id: hit.chunk.file_id,
            library_id: hit.chunk.library_id,
            file_name: hit.file_name.clone(),
            content: hit.chunk.content.clone(),
            score: 0.0,
            sources: HashSet::new(),
            vector_similarity: 0.0,
            keyword_overlap: 0.0,
            graph_overlap: 0.0,
            entity_overlap: 0.0,
            anchor_overlap: 0.0,
        });
        entry.score += score;
        entry.sources.insert("graph".to_string());
        entry.graph_overlap = entry.graph_overlap.max(1.0);
        entry.entity_overlap = entry.entity_overlap.max(entity_overlap);
    }

    let mut out: Vec<FusedRecord> = records.into_values().collect();
    for record in &mut out {
        let focus_overlap = overlap_ratio(&record.content, &plan.query_focus_terms.iter().cloned().collect());
        let refined = 0.20 * focus_overlap
            + 0.24 * record.anchor_overlap
            + count_boost(&plan.intents, &record.content)
            + roster_boost(&plan.intents, &record.content);
        record.score += refined;
        if !plan.anchor_term_set.is_empty() && record.anchor_overlap == 0.0 && !plan.intents.summary_mode {
            record.score *= 0.72;
        }
    }
    out.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    out
}

fn passes_gate(records: &[FusedRecord], config: &RetrievalConfig, intents: &Intents, lenient: bool) -> bool {
    if records.is_empty() {
        return false;
    }
    let top = records[0].score;
    if top < config.rag_min_top1_score {
        return false;
    }

    let support_count = records.iter().filter(|r| r.score >= config.rag_min_support_score).count() as i64;
    if support_count < config.rag_min_support_count && top < config.rag_min_top1_score + 0.15 {
        return false;
    }

    let window = (config.rag_min_support_count.max(3)) as usize;
    let window_records = &records[..records.len().min(window)];

    let lexical_or_entity = window_records
        .iter()
        .any(|r| r.keyword_overlap > 0.0 || r.entity_overlap > 0.0 || r.anchor_overlap > 0.0);
    let graph_and_semantic = window_records.iter().any(|r| r.graph_overlap > 0.0)
        && window_records.iter().any(|r| r.vector_similarity >= config.vector_semantic_min);
    let semantic_strong = window_records.iter().any(|r| {
        r.vector_similarity >= config.vector_semantic_min && top >= config.rag_min_top1_score + 0.08
    });

    let condition3 = lexical_or_entity || graph_and_semantic || semantic_strong;
    if condition3 {
        return true;
    }
    if lenient && (intents.summary_mode || intents.count_intent || intents.roster_intent) {
        let focus_overlap = window_records.iter().map(|r| r.anchor_overlap).fold(0.0, f64::max);
        focus_overlap >= 0.22 && window_records.iter().any(|r| r.keyword_overlap > 0.0 || r.graph_overlap > 0.0)
    } else {
        false
    }
}

fn relax(config: &RetrievalConfig) -> RetrievalConfig {
    let mut relaxed = *config;
    relaxed.rag_min_top1_score = (config.rag_min_top1_score - config.fallback_top1_relax).max(0.0);
    relaxed.rag_min_support_score = (config.rag_min_support_score - config.fallback_support_relax).max(0.0);
    relaxed.rag_min_item_score = (config.rag_min_item_score - config.fallback_item_relax).max(0.0);
    relaxed.rag_min_support_count = (config.rag_min_support_count - 1).max(1);
    relaxed
}

fn should_expand_to_keyword_fallback(records: &[FusedRecord], config: &RetrievalConfig) -> bool {
    if records.is_empty() {
        return true;
    }
    let weak_anchor = records.iter().take(8).all(|r| r.anchor_overlap < 0.15);
    let top8 = &records[..records.len().min(8)];
    let strong_lexical_hits = top8.iter().filter(|r| r.keyword_overlap > 0.2).count();
    let near_top1 = records[0].score < config.rag_min_top1_score + 0.05;
    weak_anchor || (strong_lexical_hits <= 1 && near_top1)
}

async fn keyword_fallback(
    pool: &SqlitePool,
    library_ids: &[Uuid],
    plan: &QueryPlan,
    config: &RetrievalConfig,
) -> AppResult<Vec<FusedRecord>> {
    let mut terms: Vec<String> = plan.anchor_term_set.iter().cloned().collect();
    terms.extend(plan.keyword_queries.iter().cloned());
    let mut seen = HashSet::new();
    terms.retain(|t| seen.insert(t.clone()));

    let hits = search_substring(pool, library_ids, &terms, config.keyword_fallback_scan_limit.max(1) as usize).await?;
    let mut records: Vec<FusedRecord> = Vec::new();
    for hit in hits {
        let keyword_overlap = overlap_ratio(&hit.chunk.content, &plan.keyword_term_set);
        let anchor_overlap = overlap_ratio(&hit.chunk.content, &plan.anchor_term_set);
        let local = 0.52 * keyword_overlap
            + 0.32 * anchor_overlap
            + count_boost(&plan.intents, &hit.chunk.content)
            + roster_boost(&plan.intents, &hit.chunk.content);
        if local < config.keyword_fallback_min_score {
            continue;
        }
        records.push(FusedRecord {
            chunk_id: hit.chunk.id,
            file_id: hit.chunk.file_id,
            library_id: hit.chunk.library_id,
            file_name: hit.file_name,
            content: hit.chunk.content,
            score: local.max(0.16),
            sources: ["keyword_fallback".to_string()].into_iter().collect(),
            vector_similarity: 0.0,
            keyword_overlap,
            graph_overlap: 0.0,
            entity_overlap: 0.0,
            anchor_overlap,
        });
    }
    records.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    records.truncate(config.keyword_fallback_max_chunks.max(1) as usize);
    Ok(records)
}

fn merge_dedup(primary: Vec<FusedRecord>, fallback: Vec<FusedRecord>, cap: usize) -> Vec<FusedRecord> {
    let mut seen: HashSet<Uuid> = primary.iter().map(|r| r.chunk_id).collect();
    let mut merged = primary;
    for record in fallback {
        if seen.insert(record.chunk_id) {
            merged.push(record);
        }
        if merged.len() >= cap {
            break;
        }
    }
    merged
}

fn diversify(records: Vec<FusedRecord>, top_k: usize, config: &RetrievalConfig, summary_mode: bool) -> Vec<FusedRecord> {
    if !summary_mode {
        return records.into_iter().take(top_k).collect();
    }

    let mut by_file: Vec<Uuid> = Vec::new();
    let mut buckets: HashMap<Uuid, Vec<FusedRecord>> = HashMap::new();
    for record in records {
        if !by_file.contains(&record.file_id) {
            by_file.push(record.file_id);
        }
        buckets.entry(record.file_id).or_default().push(record);
    }
    for bucket in buckets.values_mut() {
        bucket.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    }
    by_file.sort_by(|a, b| {
        let sa = buckets.get(a).and_then(|v| v.first()).map(|r| r.score).unwrap_or(0.0);
        let sb = buckets.get(b).and_then(|v| v.first()).map(|r| r.score).unwrap_or(0.0);
        sb.partial_cmp(&sa).unwrap_or(std::cmp::Ordering::Equal)
    });

    let min_files = by_file.len().min(config.summary_min_files.max(1) as usize).min(top_k.max(1));
    let mut selected: Vec<FusedRecord> = Vec::new();
    let mut taken_per_file: HashMap<Uuid, usize> = HashMap::new();

    for file_id in by_file.iter().take(min_files) {
        if let Some(bucket) = buckets.get_mut(file_id) {
            if !bucket.is_empty() {
                selected.push(bucket.remove(0));
                *taken_per_file.entry(*file_id).or_insert(0) += 1;
            }
        }
    }

    let per_file_cap = config.summary_per_file_cap.max(1) as usize;
    let mut progress = true;
    while selected.len() < top_k && progress {
        progress = false;
        for file_id in by_file.iter() {
            if selected.len() >= top_k {
                break;
            }
            let taken = *taken_per_file.get(file_id).unwrap_or(&0);
            if taken >= per_file_cap {
                continue;
            }
            if let Some(bucket) = buckets.get_mut(file_id) {
                if !bucket.is_empty() {
                    selected.push(bucket.remove(0));
                    *taken_per_file.entry(*file_id).or_insert(0) += 1;
                    progress = true;
                }
            }
        }
    }

    if selected.len() < top_k {
        let mut remainder: Vec<FusedRecord> = buckets.into_values().flatten().collect();
        remainder.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        selected.extend(remainder.into_iter().take(top_k - selected.len()));
    }

    selected.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    selected
}

fn to_hit(record: FusedRecord, matched_entities: &[String]) -> RetrievalHit {
    let mut sources: Vec<String> = record.sources.into_iter().collect();
    sources.sort();
    let snippet: String = record.content.chars().take(500).collect();
    RetrievalHit {
        chunk_id: record.chunk_id,
        file_id: record.file_id,
        library_id: record.library_id,
        file_name: record.file_name,
        snippet,
        score: record.score,
        source: sources.join("_"),
        vector_similarity: record.vector_similarity,
        keyword_overlap: record.keyword_overlap,
        graph_overlap: record.graph_overlap,
        entity_overlap: record.entity_overlap,
        anchor_overlap: record.anchor_overlap,
        query_focus_overlap: 0.0,
        matched_entities: matched_entities.to_vec(),
    }
}

/// Runs the full hybrid retrieval pipeline and returns an ordered hit list.
/// `library_ids` must be non-empty; callers with no selected library should
/// skip retrieval entirely (see the chat orchestrator's no-hit asymmetry).
pub async fn retrieve(
    pool: &SqlitePool,
    embedding_config: &EmbeddingConfig,
    config: &RetrievalConfig,
    library_ids: &[Uuid],
    query: &str,
    top_k: usize,
    history_context: &[String],
) -> AppResult<Vec<RetrievalHit>> {
    if library_ids.is_empty() {
        return Ok(Vec::new());
    }

    let plan = build_query_plan(pool, library_ids, query, history_context, config).await?;
    let intents = plan.intents;

    let query_embedding = embed_query(embedding_config, &plan.contextual_query)
        .await
        .map_err(|e| AppError::Internal(e.to_string()))?;

    let effective_top_k = top_k.max(config.summary_min_chunks.max(0) as usize);
    let expand_factor = if intents.summary_mode { config.summary_expand_factor.max(1) as usize } else { 1 };

    let vector_multiplier = (config.vector_candidate_multiplier.clamp(2, 20) as usize).min(if intents.summary_mode { 20 } else { 3 });
    let keyword_multiplier = (config.keyword_candidate_multiplier.clamp(2, 20) as usize).min(if intents.summary_mode { 20 } else { 3 });
    let graph_multiplier = (config.graph_candidate_multiplier.clamp(2, 20) as usize).min(if intents.summary_mode { 20 } else { 4 });

    let vector_limit = (top_k * vector_multiplier).max(effective_top_k * 2).max(16) * expand_factor;
    let keyword_keep = (top_k * keyword_multiplier).max(effective_top_k * 2).max(20) * expand_factor;
    let graph_limit = (top_k * graph_multiplier).max(effective_top_k * 3).max(20) * expand_factor;

    let keyword_scan_limit: usize = if intents.count_intent {
        360
    } else if intents.roster_intent {
        900
    } else {
        5000
    };

    let (vector_hits, keyword_hits, graph_hits) = tokio::join!(
        vector_channel(pool, library_ids, &query_embedding, vector_limit),
        keyword_channel(pool, library_ids, &plan, keyword_scan_limit, keyword_keep),
        graph_channel(pool, library_ids, &plan, config, graph_limit),
    );
    let vector_hits = vector_hits?;
    let keyword_hits = keyword_hits?;
    let graph_hits = graph_hits?;

    let mut fused = fuse(vector_hits, keyword_hits, graph_hits, &plan);
    fused.retain(|r| r.score >= config.rag_min_item_score);

    let mut accepted = passes_gate(&fused, config, &intents, false);
    if !accepted && config.fallback_relax_enabled {
        let relaxed_config = relax(config);
        accepted = passes_gate(&fused, &relaxed_config, &intents, true);
    }

    let mut final_records = if accepted { fused.clone() } else { Vec::new() };

    if final_records.is_empty() {
        let fallback_records = keyword_fallback(pool, library_ids, &plan, config).await?;
        final_records = fallback_records;
    } else if config.keyword_fallback_expand_on_weak_hits && should_expand_to_keyword_fallback(&final_records, config) {
        let fallback_records = keyword_fallback(pool, library_ids, &plan, config).await?;
        final_records = merge_dedup(final_records, fallback_records, config.keyword_fallback_max_chunks.max(1) as usize);
        final_records.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    }

    let diversified = diversify(final_records, top_k, config, intents.summary_mode);
    Ok(diversified.into_iter().map(|r| to_hit(r, &plan.matched_entity_names)).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_summary_intent() {
        let intents = detect_intents("请全面总结一下这本书");
        assert!(intents.summary_mode);
    }

    #[test]
    fn detects_count_and_roster_intent() {
        let intents = detect_intents("师徒四人都有谁，一共几个人？");
        assert!(intents.count_intent);
        assert!(intents.roster_intent);
    }

    #[test]
    fn overlap_ratio_counts_matching_terms() {
        let mut terms = HashSet::new();
        terms.insert("rust".to_string());
        terms.insert("crate".to_string());
        let ratio = overlap_ratio("this is a rust crate about retrieval", &terms);
        assert!((ratio - 1.0).abs() < 1e-9);
    }

    #[test]
    fn relax_lowers_thresholds_and_floors_support_count() {
        let base = RetrievalConfig::default();
        let relaxed = relax(&base);
        assert!(relaxed.rag_min_top1_score <= base.rag_min_top1_score);
        assert!(relaxed.rag_min_support_count >= 1);
    }
}
