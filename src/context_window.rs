//! Context-window budgeting (C8): prunes a retrieved-hit list to fit the
//! selected provider's token window before prompt assembly.

use crate::retrieval::RetrievalHit;

pub const MIN_CONTEXT_WINDOW_TOKENS: i64 = 1024;
pub const MAX_CONTEXT_WINDOW_TOKENS: i64 = 2_000_000;
pub const DEFAULT_CONTEXT_WINDOW_TOKENS: i64 = 131_072;

/// Clamps a stored/configured window size into the supported range,
/// falling back to the default when absent.
pub fn normalize_context_window_tokens(value: Option<i64>) -> i64 {
    let parsed = value.unwrap_or(DEFAULT_CONTEXT_WINDOW_TOKENS);
    parsed.clamp(MIN_CONTEXT_WINDOW_TOKENS, MAX_CONTEXT_WINDOW_TOKENS)
}

/// `ascii_chars/4 + non_ascii_chars/1.6`, floor 1 for non-empty text.
pub fn estimate_text_tokens(text: &str) -> i64 {
    if text.is_empty() {
        return 0;
    }
    let ascii_chars = text.chars().filter(|c| c.is_ascii()).count() as f64;
    let non_ascii_chars = text.chars().count() as f64 - ascii_chars;
    let estimate = (ascii_chars / 4.0 + non_ascii_chars / 1.6) as i64;
    estimate.max(1)
}

pub struct CompressionInput<'a> {
    pub context_window_tokens: Option<i64>,
    pub max_tokens: i64,
    pub history_messages: &'a [String],
    pub query: &'a str,
    pub summary_mode: bool,
}

/// Greedily keeps as many leading retrieved hits as fit the provider's
/// remaining token budget, enforcing a floor (`min_keep`) even if that
/// floor overruns the computed budget.
pub fn compress_retrieved(retrieved: Vec<RetrievalHit>, input: &CompressionInput) -> Vec<RetrievalHit> {
    if retrieved.is_empty() {
        return retrieved;
    }

    let context_window = normalize_context_window_tokens(input.context_window_tokens);
    let response_reserve = input.max_tokens.max(512).min((context_window as f64 * 0.45) as i64);
    let history_reserve: i64 = input
        .history_messages
        .iter()
        .rev()
        .take(24)
        .map(|m| estimate_text_tokens(m))
        .sum();
    let query_reserve = estimate_text_tokens(input.query);
    let prompt_overhead: i64 = if input.summary_mode { 1800 } else { 1200 };

    let available = (context_window - response_reserve - history_reserve - query_reserve - prompt_overhead).max(256);
    let min_keep: usize = if input.summary_mode { 10 } else { 5 };

    let mut selected: Vec<RetrievalHit> = Vec::new();
    let mut used_tokens: i64 = 0;
    for item in &retrieved {
        let item_tokens = (estimate_text_tokens(&item.snippet) + estimate_text_tokens(&item.file_name) + 40).max(48);
        if !selected.is_empty() && used_tokens + item_tokens > available {
            break;
        }
        selected.push(item.clone());
        used_tokens += item_tokens;
    }

    if selected.is_empty() {
        return retrieved.into_iter().take(min_keep).collect();
    }
    if selected.len() >= min_keep {
        return selected;
    }

    for item in retrieved.into_iter().skip(selected.len()) {
        selected.push(item);
        if selected.len() >= min_keep {
            break;
        }
    }
    selected
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn hit(snippet: &str, file_name: &str) -> RetrievalHit {
        RetrievalHit {
            chunk_id: Uuid::new_v4(),
            file_id: Uuid::new_v4(),
            library_id: Uuid::new_v4(),
            file_name: file_name.to_string(),
            snippet: snippet.to_string(),
            score: 1.0,
            source: "vector".to_string(),
            vector_similarity: 0.9,
            keyword_overlap: 0.0,
            graph_overlap: 0.0,
            entity_overlap: 0.0,
            anchor_overlap: 0.0,
            query_focus_overlap: 0.0,
            matched_entities: Vec::new(),
        }
    }

    #[test]
    fn estimate_counts_ascii_and_non_ascii_differently() {
        assert_eq!(estimate_text_tokens(""), 0);
        assert!(estimate_text_tokens("中文文本") > estimate_text_tokens("ascii"));
    }

    #[test]
    fn normalize_clamps_to_bounds() {
        assert_eq!(normalize_context_window_tokens(Some(10)), MIN_CONTEXT_WINDOW_TOKENS);
        assert_eq!(normalize_context_window_tokens(None), DEFAULT_CONTEXT_WINDOW_TOKENS);
    }

    #[test]
    fn enforces_min_keep_floor_even_when_budget_is_tiny() {
        let retrieved: Vec<RetrievalHit> = (0..8).map(|i| hit(&"x".repeat(5000), &format!("file-{i}.md"))).collect();
        let input = CompressionInput {
            context_window_tokens: Some(MIN_CONTEXT_WINDOW_TOKENS),
            max_tokens: 512,
            history_messages: &[],
            query: "q",
            summary_mode: false,
        };
        let selected = compress_retrieved(retrieved, &input);
        assert!(selected.len() >= 5);
    }
}
