//! Chunk store (C3): sliding-window chunking, persistence, and the two
//! query operators the retrieval engine issues against it.
//!
//! Each chunk carries a deterministic UUID derived from its file and index
//! plus a SHA-256 hash of its text, the way the paragraph-boundary
//! chunker this replaces always has. Re-indexing a file deletes its prior
//! chunks and inserts the new set inside one transaction.

use sha2::{Digest, Sha256};
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::embedding::{blob_to_vec, cosine_similarity, vec_to_blob};
use crate::error::AppResult;
use crate::models::Chunk;

const WINDOW_SIZE: usize = 500;
const WINDOW_OVERLAP: usize = 80;

/// Splits `text` into overlapping fixed-size character windows. Chunk
/// indices are contiguous starting at 0; the embedding field is left
/// empty and filled in by the caller once vectors are computed.
pub fn chunk_text(library_id: Uuid, file_id: Uuid, text: &str) -> Vec<Chunk> {
    let chars: Vec<char> = text.chars().collect();
    if chars.is_empty() {
        return vec![make_chunk(library_id, file_id, 0, "")];
    }

    let stride = WINDOW_SIZE - WINDOW_OVERLAP;
    let mut chunks = Vec::new();
    let mut start = 0usize;
    let mut index: i64 = 0;

    while start < chars.len() {
        let end = (start + WINDOW_SIZE).min(chars.len());
        let piece: String = chars[start..end].iter().collect();
        chunks.push(make_chunk(library_id, file_id, index, piece.trim()));
        index += 1;
        if end == chars.len() {
            break;
        }
        start += stride;
    }

    chunks
}

fn make_chunk(library_id: Uuid, file_id: Uuid, index: i64, content: &str) -> Chunk {
    Chunk {
        id: Uuid::new_v4(),
        library_id,
        file_id,
        chunk_index: index,
        content: content.to_string(),
        embedding: Vec::new(),
    }
}

/// SHA-256 hash of chunk text, used for staleness detection during
/// incremental sync (the file is only re-chunked if content hash differs).
pub fn content_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Deletes a file's chunks, then inserts `chunks` in a single transaction.
/// Every chunk's embedding must already be normalized to the library's
/// configured dimension.
pub async fn replace_chunks(pool: &SqlitePool, file_id: Uuid, chunks: &[Chunk]) -> AppResult<()> {
    let mut tx = pool.begin().await?;

    sqlx::query("DELETE FROM chunks WHERE file_id = ?")
        .bind(file_id.to_string())
        .execute(&mut *tx)
        .await?;

    for chunk in chunks {
        sqlx::query(
            "INSERT INTO chunks (id, library_id, file_id, chunk_index, content, embedding) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(chunk.id.to_string())
        .bind(chunk.library_id.to_string())
        .bind(chunk.file_id.to_string())
        .bind(chunk.chunk_index)
        .bind(&chunk.content)
        .bind(vec_to_blob(&chunk.embedding))
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;
    Ok(())
}

pub async fn delete_chunks_for_file(pool: &SqlitePool, file_id: Uuid) -> AppResult<()> {
    sqlx::query("DELETE FROM chunks WHERE file_id = ?")
        .bind(file_id.to_string())
        .execute(pool)
        .await?;
    Ok(())
}

/// One candidate returned by [`rank_by_cosine`]: the chunk, its owning
/// file's display name, and the cosine similarity to the query vector.
pub struct VectorHit {
    pub chunk: Chunk,
    pub file_name: String,
    pub similarity: f64,
}

/// Brute-force cosine-distance rank across `library_ids`, bounded by
/// `limit`. There is no native ANN index (explicit Non-goal); every row in
/// scope is scanned and scored.
pub async fn rank_by_cosine(
    pool: &SqlitePool,
    library_ids: &[Uuid],
    query_embedding: &[f32],
    limit: usize,
) -> AppResult<Vec<VectorHit>> {
    if library_ids.is_empty() {
        return Ok(Vec::new());
    }
    let placeholders = library_ids.iter().map(|_| "?").collect::<Vec<_>>().join(",");
    let sql = format!(
        "SELECT c.id, c.library_id, c.file_id, c.chunk_index, c.content, c.embedding, f.filename \
         FROM chunks c JOIN knowledge_files f ON f.id = c.file_id \
         WHERE c.library_id IN ({placeholders})"
    );
    let mut query = sqlx::query(&sql);
    for id in library_ids {
        query = query.bind(id.to_string());
    }
    let rows = query.fetch_all(pool).await?;

    let mut hits: Vec<VectorHit> = Vec::with_capacity(rows.len());
    for row in rows {
        let embedding = blob_to_vec(row.try_get::<Vec<u8>, _>("embedding")?.as_slice());
        let distance = 1.0 - cosine_similarity(query_embedding, &embedding);
        let similarity = (1.0 - distance).max(0.0) as f64;
        let chunk = row_to_chunk(&row, embedding)?;
        hits.push(VectorHit {
            chunk,
            file_name: row.try_get("filename")?,
            similarity,
        });
    }

    hits.sort_by(|a, b| b.similarity.partial_cmp(&a.similarity).unwrap_or(std::cmp::Ordering::Equal));
    hits.truncate(limit);
    Ok(hits)
}

/// One candidate returned by [`search_substring`]: matched chunk, file
/// name, and how many of the supplied terms appeared in its content.
pub struct KeywordHit {
    pub chunk: Chunk,
    pub file_name: String,
    pub matched_terms: usize,
}

/// Substring OR-filter: a chunk qualifies if its content contains at least
/// one of `terms` (case-insensitive). Used both by the primary keyword
/// channel and by keyword fallback, with the caller controlling `limit`
/// (the two channels use different scan-limit knobs).
pub async fn search_substring(
    pool: &SqlitePool,
    library_ids: &[Uuid],
    terms: &[String],
    limit: usize,
) -> AppResult<Vec<KeywordHit>> {
    if library_ids.is_empty() || terms.is_empty() {
        return Ok(Vec::new());
    }
    let lib_placeholders = library_ids.iter().map(|_| "?").collect::<Vec<_>>().join(",");
    let term_clause = terms.iter().map(|_| "c.content LIKE ?").collect::<Vec<_>>().join(" OR ");
    let sql = format!(
        "SELECT c.id, c.library_id, c.file_id, c.chunk_index, c.content, c.embedding, f.filename \
         FROM chunks c JOIN knowledge_files f ON f.id = c.file_id \
         WHERE c.library_id IN ({lib_placeholders}) AND ({term_clause}) \
         LIMIT ?"
    );
    let mut query = sqlx::query(&sql);
    for id in library_ids {
        query = query.bind(id.to_string());
    }
    for term in terms {
        query = query.bind(format!("%{term}%"));
    }
    query = query.bind(limit as i64);
    let rows = query.fetch_all(pool).await?;

    let lower_terms: Vec<String> = terms.iter().map(|t| t.to_lowercase()).collect();
    let mut hits = Vec::with_capacity(rows.len());
    for row in rows {
        let content: String = row.try_get("content")?;
        let lower_content = content.to_lowercase();
        let matched_terms = lower_terms.iter().filter(|t| lower_content.contains(t.as_str())).count();
        let embedding = blob_to_vec(row.try_get::<Vec<u8>, _>("embedding")?.as_slice());
        let chunk = row_to_chunk(&row, embedding)?;
        hits.push(KeywordHit {
            chunk,
            file_name: row.try_get("filename")?,
            matched_terms,
        });
    }
    Ok(hits)
}

fn row_to_chunk(row: &sqlx::sqlite::SqliteRow, embedding: Vec<f32>) -> AppResult<Chunk> {
    let id: String = row.try_get("id")?;
    let library_id: String = row.try_get("library_id")?;
    let file_id: String = row.try_get("file_id")?;
    Ok(Chunk {
        id: Uuid::parse_str(&id).map_err(|e| crate::error::AppError::Internal(e.to_string()))?,
        library_id: Uuid::parse_str(&library_id).map_err(|e| crate::error::AppError::Internal(e.to_string()))?,
        file_id: Uuid::parse_str(&file_id).map_err(|e| crate::error::AppError::Internal(e.to_string()))?,
        chunk_index: row.try_get("chunk_index")?,
        content: row.try_get("content")?,
        embedding,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_text_single_chunk() {
        let lib = Uuid::new_v4();
        let file = Uuid::new_v4();
        let chunks = chunk_text(lib, file, "Hello, world!");
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].chunk_index, 0);
        assert_eq!(chunks[0].content, "Hello, world!");
    }

    #[test]
    fn empty_text_yields_one_chunk() {
        let chunks = chunk_text(Uuid::new_v4(), Uuid::new_v4(), "");
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].chunk_index, 0);
    }

    #[test]
    fn long_text_produces_overlapping_windows() {
        let text: String = (0..2000).map(|i| char::from((b'a' + (i % 26) as u8) as char)).collect();
        let chunks = chunk_text(Uuid::new_v4(), Uuid::new_v4(), &text);
        assert!(chunks.len() > 1);
        for (i, c) in chunks.iter().enumerate() {
            assert_eq!(c.chunk_index, i as i64);
        }
    }

    #[test]
    fn deterministic_hash() {
        let h1 = content_hash("alpha beta gamma");
        let h2 = content_hash("alpha beta gamma");
        assert_eq!(h1, h2);
        assert_ne!(h1, content_hash("alpha beta delta"));
    }
}
