//! Entity-candidate tokenization for the knowledge graph (C1).
//!
//! There is no real Chinese word segmenter available in this crate's
//! dependency stack, so candidate extraction falls back to the same regex
//! patterns the system this backend replaces already used underneath its
//! POS tagger: a run of 2-4 CJK characters, or a run of Latin
//! alphanumerics. This loses part-of-speech filtering but keeps the
//! stopword/suffix/surname heuristics that do the actual precision work.

use std::collections::HashSet;

use once_cell::sync::Lazy;
use regex::Regex;

static EN_STOPWORDS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "the", "and", "for", "with", "from", "this", "that", "into", "then", "than", "are",
        "is", "was", "were", "what", "when", "where", "who", "why", "how", "can", "will",
        "should", "could", "would", "use", "using", "used", "data", "model",
    ]
    .into_iter()
    .collect()
});

static ZH_STOPWORDS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "我们", "你们", "他们", "这些", "那些", "这个", "那个", "以及", "或者", "可以", "进行",
        "因为", "所以", "通过", "如果", "然后", "其中", "一种", "什么", "怎么", "如何", "为什么",
        "时候", "地方", "人们", "大家", "自己", "没有", "有的", "还有", "一些", "其他", "可能",
    ]
    .into_iter()
    .collect()
});

static ENTITY_SUFFIX_BLACKLIST: Lazy<Vec<&'static str>> = Lazy::new(|| {
    vec![
        "说", "道", "曰", "云", "称", "表示", "指出", "强调", "提出", "要求", "希望", "介绍",
        "说明", "解释", "告诉", "想起", "感到", "看来", "起来", "下来", "上去", "过来", "回去",
        "出去", "进去", "出来", "回来", "下去", "时候", "地方", "意思", "情况", "样子", "声音",
        "东西", "事情", "问题", "之后", "以前", "以后", "这样", "那样", "怎样", "大家", "自己",
        "别人", "不是", "就是", "但是", "因为", "所以", "如果", "虽然", "已经", "曾经", "正在",
        "将要", "可能", "应该", "必须", "需要", "可以", "愿意", "喜欢", "讨厌", "害怕", "担心",
        "相信", "怀疑", "理解", "明白", "了解", "认识", "熟悉", "进行", "完成", "实现", "形成",
        "包括", "有关", "对于", "关于", "由于", "根据", "通过", "非常", "特别", "十分", "相当",
        "比较",
    ]
});

static SINGLE_CHAR_BLACKLIST: Lazy<HashSet<char>> = Lazy::new(|| {
    "的是在了和与或有我你他她它们这那就也都而及着被把让给向从到至对于为以如因所当时后前上下中内外里间之其可能要会应该才已曾将且又则但却只仅比等似像属含带通过做作使令叫请派劝求望盼"
        .chars()
        .collect()
});

static TITLE_SUFFIXES: Lazy<Vec<&'static str>> = Lazy::new(|| {
    vec![
        "市长", "副市长", "省长", "副省长", "书记", "副书记", "主席", "副主席", "主任", "副主任",
        "厅长", "副厅长", "局长", "副局长", "处长", "副处长", "科长", "副科长", "镇长", "副镇长",
        "乡长", "副乡长", "行长", "副行长", "总裁", "副总裁", "总经理", "副总经理", "董事长",
        "副董事长", "总监", "副总监", "院长", "副院长", "校长", "副校长", "所长", "副所长",
        "部长", "副部长", "经理", "副经理", "老板", "组长", "副组长", "队长", "副队长", "教授",
        "副教授", "讲师", "助教", "老师", "医生", "护士", "医师",
    ]
});

static COMMON_SURNAMES: Lazy<HashSet<char>> = Lazy::new(|| {
    "王李张刘陈杨赵黄周吴徐孙胡朱高林何郭马罗梁宋郑谢韩唐冯于董萧程曹袁邓许傅沈曾彭吕苏卢蒋蔡贾丁魏薛叶阎余潘杜戴夏钟汪田石皮"
        .chars()
        .collect()
});

static CJK_ENTITY_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[\u{4e00}-\u{9fff}]{2,4}").unwrap());
static EN_ENTITY_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[A-Za-z][A-Za-z0-9_\-/]{2,40}").unwrap());
static SENTENCE_SPLIT_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[。！？!?;；\n]").unwrap());
static WHITESPACE_PATTERN: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());
static ASCII_ONLY_PATTERN: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z0-9_\-/ ]+$").unwrap());

pub fn normalize_entity(name: &str) -> String {
    let collapsed = WHITESPACE_PATTERN.replace_all(name, " ");
    let stripped = collapsed.trim();
    if stripped.is_empty() {
        return String::new();
    }
    if ASCII_ONLY_PATTERN.is_match(stripped) {
        stripped.to_lowercase()
    } else {
        stripped.to_string()
    }
}

/// Maps titled references (e.g. a surname plus an official title) back to
/// the bare name they most likely refer to, so "Surname Vice-Mayor" and
/// "Surname Given-name" fuse into one graph node.
pub fn resolve_entity_alias(entities: &[String]) -> std::collections::HashMap<String, String> {
    let char_count = |s: &str| s.chars().count();

    let person_names: HashSet<&str> = entities
        .iter()
        .filter(|e| {
            let len = char_count(e);
            (2..=4).contains(&len) && e.chars().next().is_some_and(|c| COMMON_SURNAMES.contains(&c))
        })
        .map(|s| s.as_str())
        .collect();

    let mut alias_map = std::collections::HashMap::new();
    for e in entities {
        if char_count(e) < 3 {
            continue;
        }
        for suffix in TITLE_SUFFIXES.iter() {
            if let Some(name_part) = e.strip_suffix(suffix) {
                let prefix2: String = name_part.chars().take(2).collect();
                let mut matched: Option<&str> = None;
                for person in person_names.iter() {
                    if *person == name_part {
                        matched = Some(person);
                        break;
                    }
                    if name_part.chars().count() >= 2 && person.starts_with(&prefix2) {
                        let better = match matched {
                            None => true,
                            Some(m) => person.chars().count() > m.chars().count(),
                        };
                        if better {
                            matched = Some(person);
                        }
                    }
                }
                if let Some(m) = matched {
                    alias_map.insert(e.clone(), m.to_string());
                }
                break;
            }
        }
    }
    alias_map
}

/// Extracts up to `max_entities` distinct entity-candidate strings from
/// free text, applying the stopword/suffix/alias filters.
pub fn extract_entities_from_text(text: &str, max_entities: usize) -> Vec<String> {
    if text.is_empty() {
        return Vec::new();
    }

    let mut candidates: Vec<String> = Vec::new();
    for m in CJK_ENTITY_PATTERN.find_iter(text) {
        candidates.push(m.as_str().to_string());
    }
    for m in EN_ENTITY_PATTERN.find_iter(text) {
        candidates.push(m.as_str().to_string());
    }

    let alias_map = resolve_entity_alias(&candidates);
    for (alias, canonical) in alias_map.iter() {
        if !candidates.contains(alias) {
            candidates.push(alias.clone());
        }
        if !candidates.contains(canonical) {
            candidates.push(canonical.clone());
        }
    }
    let alias_to_canonical = resolve_entity_alias(&candidates);

    let mut results: Vec<String> = Vec::new();
    let mut seen: HashSet<String> = HashSet::new();

    'outer: for raw in &candidates {
        let cleaned_ref = raw.trim_matches(|c: char| " ,.;:()[]{}\"'".contains(c));
        let mut cleaned = cleaned_ref.to_string();
        if cleaned.chars().count() < 2 {
            continue;
        }
        if let Some(canonical) = alias_to_canonical.get(&cleaned) {
            cleaned = canonical.clone();
        }
        let norm = normalize_entity(&cleaned);
        if norm.is_empty() {
            continue;
        }
        if EN_STOPWORDS.contains(norm.as_str()) || ZH_STOPWORDS.contains(norm.as_str()) {
            continue;
        }
        if norm.chars().count() == 1 {
            if let Some(c) = norm.chars().next() {
                if SINGLE_CHAR_BLACKLIST.contains(&c) {
                    continue;
                }
            }
        }
        for suffix in ENTITY_SUFFIX_BLACKLIST.iter() {
            if norm.ends_with(suffix) {
                continue 'outer;
            }
        }
        if norm.chars().all(|c| c.is_ascii_digit()) {
            continue;
        }
        if seen.contains(&norm) {
            continue;
        }
        seen.insert(norm);
        results.push(cleaned);
        if results.len() >= max_entities {
            break;
        }
    }
    results
}

pub fn infer_relation_type(sentence: &str) -> crate::models::RelationType {
    use crate::models::RelationType;
    let lowered = sentence.to_lowercase();
    if sentence.contains("属于") || sentence.contains("是一种") || lowered.contains(" is a ") {
        return RelationType::IsA;
    }
    if sentence.contains("包括")
        || sentence.contains("包含")
        || lowered.contains(" consist of ")
        || lowered.contains(" includes ")
    {
        return RelationType::Contains;
    }
    if sentence.contains("依赖") || sentence.contains("基于") || lowered.contains(" depends on ") {
        return RelationType::DependsOn;
    }
    if sentence.contains("导致") || sentence.contains("造成") || lowered.contains(" causes ") {
        return RelationType::Causes;
    }
    RelationType::CoOccurs
}

/// A candidate relation between two entity display-names, with the
/// evidence sentence it was mined from (truncated to 240 chars).
pub struct RelationCandidate {
    pub source: String,
    pub target: String,
    pub relation_type: crate::models::RelationType,
    pub evidence: String,
}

pub fn extract_relations_from_text(text: &str) -> Vec<RelationCandidate> {
    let mut relations = Vec::new();
    for sentence in SENTENCE_SPLIT_PATTERN.split(text) {
        let sentence = sentence.trim();
        if sentence.is_empty() {
            continue;
        }
        let entities = extract_entities_from_text(sentence, 8);
        if entities.len() < 2 {
            continue;
        }
        let relation_type = infer_relation_type(sentence);
        let evidence: String = sentence.chars().take(240).collect();
        for i in 0..entities.len() {
            for j in (i + 1)..entities.len() {
                let (mut source, mut target) = (entities[i].clone(), entities[j].clone());
                if normalize_entity(&source) == normalize_entity(&target) {
                    continue;
                }
                if normalize_entity(&source) > normalize_entity(&target) {
                    std::mem::swap(&mut source, &mut target);
                }
                relations.push(RelationCandidate {
                    source,
                    target,
                    relation_type,
                    evidence: evidence.clone(),
                });
            }
        }
    }
    relations
}

/// Splits free text into candidate search tokens: CJK bigrams/runs and
/// Latin words, length ≥ 2, stopwords removed. Stands in for the
/// dictionary-based cut the source's `cut_for_search` used, since no
/// segmenter crate exists in this dependency stack.
pub fn tokenize_for_search(text: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut seen = HashSet::new();
    for m in CJK_ENTITY_PATTERN.find_iter(text) {
        push_token(m.as_str(), &mut tokens, &mut seen);
    }
    for m in EN_ENTITY_PATTERN.find_iter(text) {
        push_token(m.as_str(), &mut tokens, &mut seen);
    }
    tokens
}

fn push_token(raw: &str, tokens: &mut Vec<String>, seen: &mut HashSet<String>) {
    let norm = normalize_entity(raw);
    if norm.chars().count() < 2 {
        return;
    }
    if EN_STOPWORDS.contains(norm.as_str()) || ZH_STOPWORDS.contains(norm.as_str()) {
        return;
    }
    if seen.insert(norm.clone()) {
        tokens.push(norm);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_ascii_to_lowercase() {
        assert_eq!(normalize_entity("  Rust-Lang  "), "rust-lang");
    }

    #[test]
    fn keeps_cjk_as_is() {
        assert_eq!(normalize_entity("北京市"), "北京市");
    }

    #[test]
    fn extracts_mixed_entities() {
        let entities = extract_entities_from_text("张伟在北京大学工作，使用 Rust 编写代码。", 10);
        assert!(entities.iter().any(|e| e.contains("Rust")));
    }

    #[test]
    fn filters_single_char_stopwords() {
        let entities = extract_entities_from_text("这是一个测试", 10);
        assert!(!entities.iter().any(|e| e == "的"));
    }

    #[test]
    fn infers_contains_relation() {
        assert_eq!(infer_relation_type("本系统包括三个模块"), crate::models::RelationType::Contains);
    }

    #[test]
    fn infers_co_occurs_by_default() {
        assert_eq!(infer_relation_type("张三和李四在开会"), crate::models::RelationType::CoOccurs);
    }
}
