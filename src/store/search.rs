use anyhow::Result;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::models::MemoryType;

#[derive(Debug, Clone, Deserialize, Default)]
pub struct RecallQuery {
    pub query: String,
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(rename = "type", default)]
    pub memory_type: Option<MemoryType>,
    #[serde(default)]
    pub tags: Option<Vec<String>>,
    #[serde(default)]
    pub who: Option<String>,
    #[serde(default)]
    pub since: Option<String>,
    #[serde(default)]
    pub until: Option<String>,
}

pub const DEFAULT_RECALL_LIMIT: usize = 10;

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MatchSource {
    Semantic,
    Keyword,
    Hybrid,
}

#[derive(Serialize, Clone, Debug)]
pub struct RecallResult {
    pub id: String,
    pub content: String,
    pub score: f64,
    pub source: MatchSource,
    #[serde(rename = "type")]
    pub memory_type: MemoryType,
    pub tags: Vec<String>,
    pub pinned: bool,
    pub who: String,
    pub created_at: String,
}

/// A candidate from one arm: raw goodness, higher is better.
pub type ArmScores = Vec<(String, f64)>;

/// BM25 keyword arm over the FTS index. Raw goodness is `-bm25` (FTS5 ranks
/// ascending, more negative is better).
pub fn keyword_arm(conn: &Connection, query: &str, top_k: usize) -> Result<ArmScores> {
    let match_expr = fts_match_expression(query);
    if match_expr.is_empty() {
        return Ok(Vec::new());
    }
    let mut stmt = conn.prepare(
        "SELECT m.id, bm25(memories_fts) AS rank
         FROM memories_fts
         JOIN memories m ON m.rowid = memories_fts.rowid
         WHERE memories_fts MATCH ?1
         ORDER BY rank
         LIMIT ?2",
    )?;
    let rows = stmt.query_map(rusqlite::params![match_expr, top_k as i64], |row| {
        Ok((row.get::<_, String>(0)?, -row.get::<_, f64>(1)?))
    })?;
    Ok(rows.filter_map(|r| r.ok()).collect())
}

/// Cosine KNN arm over the vec index. Raw goodness is `1 − distance`.
pub fn semantic_arm(conn: &Connection, vector: &[f32], top_k: usize) -> Result<ArmScores> {
    let blob = super::embeddings::vec_to_blob(vector);
    let mut stmt = conn.prepare(
        "SELECT id, distance
         FROM vec_embeddings
         WHERE embedding MATCH ?1 AND k = ?2
         ORDER BY distance",
    )?;
    let rows = stmt.query_map(rusqlite::params![blob, top_k as i64], |row| {
        Ok((row.get::<_, String>(0)?, 1.0 - row.get::<_, f64>(1)?))
    })?;
    Ok(rows.filter_map(|r| r.ok()).collect())
}

/// Turn free text into an FTS5 expression: quoted tokens OR-joined, so a
/// natural-language query matches on any overlapping term.
pub fn fts_match_expression(query: &str) -> String {
    let tokens: Vec<String> = query
        .split(|c: char| !c.is_alphanumeric() && c != '_')
        .filter(|t| !t.is_empty())
        .map(|t| format!("\"{t}\""))
        .collect();
    tokens.join(" OR ")
}

/// α-blend the two arms: each arm min-max normalizes over its own candidate
/// set, a missing arm contributes 0, and candidates present in both arms are
/// labeled hybrid.
pub fn blend(keyword: &ArmScores, semantic: &ArmScores, alpha: f64) -> Vec<(String, f64, MatchSource)> {
    let kw_norm = normalize(keyword);
    let sem_norm = normalize(semantic);

    let mut merged: BTreeMap<String, (Option<f64>, Option<f64>)> = BTreeMap::new();
    for (id, score) in kw_norm {
        merged.entry(id).or_default().0 = Some(score);
    }
    for (id, score) in sem_norm {
        merged.entry(id).or_default().1 = Some(score);
    }

    let mut results: Vec<(String, f64, MatchSource)> = merged
        .into_iter()
        .map(|(id, (kw, sem))| {
            let source = match (kw, sem) {
                (Some(_), Some(_)) => MatchSource::Hybrid,
                (Some(_), None) => MatchSource::Keyword,
                _ => MatchSource::Semantic,
            };
            let score = alpha * sem.unwrap_or(0.0) + (1.0 - alpha) * kw.unwrap_or(0.0);
            (id, score, source)
        })
        .collect();
    results.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    results
}

fn normalize(arm: &ArmScores) -> Vec<(String, f64)> {
    if arm.is_empty() {
        return Vec::new();
    }
    let min = arm.iter().map(|(_, s)| *s).fold(f64::INFINITY, f64::min);
    let max = arm.iter().map(|(_, s)| *s).fold(f64::NEG_INFINITY, f64::max);
    arm.iter()
        .map(|(id, s)| {
            let norm = if (max - min).abs() < f64::EPSILON {
                1.0
            } else {
                (s - min) / (max - min)
            };
            (id.clone(), norm)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_arm_candidates_normalize_to_one() {
        let keyword = vec![("k1".to_string(), -3.2)];
        let semantic = vec![("s1".to_string(), 0.92)];
        let blended = blend(&keyword, &semantic, 0.7);

        let k = blended.iter().find(|(id, _, _)| id == "k1").unwrap();
        let s = blended.iter().find(|(id, _, _)| id == "s1").unwrap();
        assert!((k.1 - 0.3).abs() < 1e-9);
        assert!((s.1 - 0.7).abs() < 1e-9);
        assert_eq!(k.2, MatchSource::Keyword);
        assert_eq!(s.2, MatchSource::Semantic);
        // with the default alpha the semantic hit wins
        assert_eq!(blended[0].0, "s1");
    }

    #[test]
    fn candidates_in_both_arms_are_hybrid_and_sum() {
        let keyword = vec![("a".to_string(), 5.0), ("b".to_string(), 1.0)];
        let semantic = vec![("a".to_string(), 0.9), ("c".to_string(), 0.1)];
        let blended = blend(&keyword, &semantic, 0.7);
        let a = blended.iter().find(|(id, _, _)| id == "a").unwrap();
        assert_eq!(a.2, MatchSource::Hybrid);
        // a tops both arms: 0.7·1.0 + 0.3·1.0
        assert!((a.1 - 1.0).abs() < 1e-9);
        assert_eq!(blended[0].0, "a");
    }

    #[test]
    fn missing_arm_contributes_zero() {
        let keyword = vec![("a".to_string(), 2.0), ("b".to_string(), 1.0)];
        let blended = blend(&keyword, &Vec::new(), 0.7);
        let a = blended.iter().find(|(id, _, _)| id == "a").unwrap();
        let b = blended.iter().find(|(id, _, _)| id == "b").unwrap();
        assert!((a.1 - 0.3).abs() < 1e-9);
        assert!((b.1 - 0.0).abs() < 1e-9);
    }

    #[test]
    fn fts_expression_quotes_and_or_joins_tokens() {
        assert_eq!(
            fts_match_expression("how do I search code fast?"),
            "\"how\" OR \"do\" OR \"I\" OR \"search\" OR \"code\" OR \"fast\""
        );
        assert_eq!(fts_match_expression("  ?!  "), "");
    }
}
