pub mod embeddings;
pub mod export;
pub mod migrations;
pub mod search;

use anyhow::{Context, Result};
use chrono::Utc;
use rand::Rng;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Mutex, Once};
use std::time::Duration;

use crate::config::{EmbeddingConfig, SearchConfig};
use crate::logger;
use crate::models::{EntityType, ExpertiseEdge, ExpertiseNode, MemoryRecord, MemoryType};
use embeddings::{content_hash, vec_to_blob, Embedder};
use search::{RecallQuery, RecallResult, DEFAULT_RECALL_LIMIT};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_BACKFILL_BATCH: usize = 50;

static VEC_EXTENSION: Once = Once::new();

/// Register sqlite-vec as an auto extension so every connection (write and
/// per-request readers alike) sees the vec0 module.
fn register_vec_extension() {
    VEC_EXTENSION.call_once(|| unsafe {
        rusqlite::ffi::sqlite3_auto_extension(Some(std::mem::transmute(
            sqlite_vec::sqlite3_vec_init as *const (),
        )));
    });
}

pub fn open_connection(path: &Path) -> Result<Connection> {
    register_vec_extension();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    let conn = Connection::open(path).with_context(|| format!("opening {}", path.display()))?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    Ok(conn)
}

#[derive(Debug, Clone, Deserialize)]
pub struct RememberRequest {
    pub content: String,
    #[serde(rename = "type", default)]
    pub memory_type: MemoryType,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default = "default_importance")]
    pub importance: f64,
    #[serde(default = "default_confidence")]
    pub confidence: f64,
    #[serde(default)]
    pub pinned: bool,
    #[serde(default)]
    pub who: Option<String>,
    #[serde(default)]
    pub source: Option<String>,
}

fn default_importance() -> f64 {
    0.5
}

fn default_confidence() -> f64 {
    0.5
}

#[derive(Debug, Clone, Serialize)]
pub struct RememberOutcome {
    pub id: String,
    pub embedded: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct EmbeddingAudit {
    pub total: i64,
    pub unembedded: i64,
    pub coverage: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct BackfillOutcome {
    pub affected: usize,
    pub message: String,
}

/// SQLite-backed memory store: one write connection behind a mutex, the vec
/// extension loaded at open, migrations applied before first use.
pub struct MemoryStore {
    conn: Mutex<Connection>,
    embedder: Option<Embedder>,
    search_cfg: SearchConfig,
}

impl MemoryStore {
    pub fn open(
        path: &Path,
        embedding: &EmbeddingConfig,
        search_cfg: SearchConfig,
        ollama_url: &str,
    ) -> Result<Self> {
        let conn = open_connection(path)?;
        migrations::migrate(&conn, embedding.dimensions)?;
        // one-shot: pre-vec databases stored vectors in a BLOB column
        embeddings::migrate_blob_vectors(&conn, false)?;
        let embedder = Embedder::from_config(embedding, ollama_url);
        Ok(Self {
            conn: Mutex::new(conn),
            embedder,
            search_cfg,
        })
    }

    pub fn has_embedder(&self) -> bool {
        self.embedder.is_some()
    }

    fn new_memory_id() -> String {
        let millis = Utc::now().timestamp_millis();
        let suffix: String = rand::thread_rng()
            .sample_iter(&rand::distributions::Alphanumeric)
            .take(7)
            .map(char::from)
            .collect();
        format!("mem_{millis}_{suffix}")
    }

    // ── persistence ──────────────────────────────────────────────────────────

    pub async fn remember(&self, req: RememberRequest) -> Result<RememberOutcome> {
        let id = Self::new_memory_id();
        let now = Utc::now().to_rfc3339();
        let tags_json = serde_json::to_string(&req.tags).unwrap_or_else(|_| "[]".into());

        {
            let conn = self.conn.lock().unwrap_or_else(|p| p.into_inner());
            conn.execute(
                "INSERT INTO memories
                    (id, content, type, source, importance, confidence, tags, pinned, who,
                     created_at, updated_at, access_count, is_deleted)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?10, 0, 0)",
                rusqlite::params![
                    id,
                    req.content,
                    req.memory_type.as_str(),
                    req.source.as_deref().unwrap_or(""),
                    req.importance.clamp(0.0, 1.0),
                    req.confidence.clamp(0.0, 1.0),
                    tags_json,
                    req.pinned as i64,
                    req.who.as_deref().unwrap_or(""),
                    now,
                ],
            )
            .context("inserting memory")?;
        }

        let embedded = match self.embed_memory(&id, &req.content).await {
            Ok(embedded) => embedded,
            Err(e) => {
                logger::warn("store", &format!("embedding for {id} failed: {e}"));
                false
            }
        };

        Ok(RememberOutcome { id, embedded })
    }

    /// Lazy embedding keyed by content hash: identical content embeds once,
    /// each memory still gets its own vec row.
    async fn embed_memory(&self, memory_id: &str, content: &str) -> Result<bool> {
        let Some(embedder) = &self.embedder else {
            return Ok(false);
        };
        let hash = content_hash(content);

        let prior: Option<String> = {
            let conn = self.conn.lock().unwrap_or_else(|p| p.into_inner());
            conn.query_row(
                "SELECT source_id FROM embeddings WHERE content_hash = ?1",
                [&hash],
                |row| row.get(0),
            )
            .ok()
        };

        if let Some(prior_id) = prior {
            let conn = self.conn.lock().unwrap_or_else(|p| p.into_inner());
            let copied = conn.execute(
                "INSERT OR REPLACE INTO vec_embeddings (id, embedding)
                 SELECT ?1, embedding FROM vec_embeddings WHERE id = ?2",
                rusqlite::params![memory_id, prior_id],
            )?;
            if copied > 0 {
                return Ok(true);
            }
            // prior vector never landed (e.g. dimension mismatch); fall through
        }

        let vector = embedder.embed(content).await?;
        let dims = vector.len();

        let conn = self.conn.lock().unwrap_or_else(|p| p.into_inner());
        conn.execute(
            "INSERT OR IGNORE INTO embeddings
                (id, content_hash, dimensions, source_type, source_id, chunk_text, created_at)
             VALUES (?1, ?2, ?3, 'memory', ?4, ?5, ?6)",
            rusqlite::params![
                format!("emb_{}", &hash[..16]),
                hash,
                dims as i64,
                memory_id,
                content.chars().take(200).collect::<String>(),
                Utc::now().to_rfc3339(),
            ],
        )?;

        if dims != embedder.dimensions() {
            logger::warn(
                "store",
                &format!(
                    "embedding dimension mismatch for {memory_id}: got {dims}, table declares {}",
                    embedder.dimensions()
                ),
            );
            return Ok(false);
        }

        conn.execute(
            "INSERT OR REPLACE INTO vec_embeddings (id, embedding) VALUES (?1, ?2)",
            rusqlite::params![memory_id, vec_to_blob(&vector)],
        )?;
        Ok(true)
    }

    // ── recall ───────────────────────────────────────────────────────────────

    pub async fn recall(&self, query: RecallQuery) -> Result<Vec<RecallResult>> {
        let limit = query.limit.unwrap_or(DEFAULT_RECALL_LIMIT);
        let top_k = self.search_cfg.top_k;

        let query_vector = match &self.embedder {
            Some(embedder) => match embedder.embed(&query.query).await {
                Ok(v) => Some(v),
                Err(e) => {
                    logger::warn("store", &format!("query embedding failed: {e}"));
                    None
                }
            },
            None => None,
        };

        let blended = {
            let conn = self.conn.lock().unwrap_or_else(|p| p.into_inner());
            let keyword = search::keyword_arm(&conn, &query.query, top_k)?;
            let semantic = match &query_vector {
                Some(vector) => search::semantic_arm(&conn, vector, top_k).unwrap_or_default(),
                None => Vec::new(),
            };
            search::blend(&keyword, &semantic, self.search_cfg.alpha)
        };

        let mut results = Vec::new();
        for (id, score, source) in blended {
            if score < self.search_cfg.min_score {
                continue;
            }
            let Some(record) = self.get_memory(&id)? else {
                continue;
            };
            if record.is_deleted {
                continue;
            }
            if let Some(t) = query.memory_type {
                if record.memory_type != t {
                    continue;
                }
            }
            if let Some(tags) = &query.tags {
                if !tags.iter().any(|t| record.tags.contains(t)) {
                    continue;
                }
            }
            if let Some(who) = &query.who {
                if &record.who != who {
                    continue;
                }
            }
            if let Some(since) = &query.since {
                if record.created_at.as_str() < since.as_str() {
                    continue;
                }
            }
            if let Some(until) = &query.until {
                if record.created_at.as_str() > until.as_str() {
                    continue;
                }
            }
            results.push(RecallResult {
                id: record.id,
                content: record.content,
                score,
                source,
                memory_type: record.memory_type,
                tags: record.tags,
                pinned: record.pinned,
                who: record.who,
                created_at: record.created_at,
            });
        }

        // pinned rows first within tied score bands
        results.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(b.pinned.cmp(&a.pinned))
        });
        results.truncate(limit);

        self.touch(&results.iter().map(|r| r.id.clone()).collect::<Vec<_>>())?;
        Ok(results)
    }

    /// Bump access bookkeeping for memories a recall returned.
    fn touch(&self, ids: &[String]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let now = Utc::now().to_rfc3339();
        let conn = self.conn.lock().unwrap_or_else(|p| p.into_inner());
        for id in ids {
            conn.execute(
                "UPDATE memories
                 SET accessed_at = ?1, access_count = access_count + 1
                 WHERE id = ?2",
                rusqlite::params![now, id],
            )?;
        }
        Ok(())
    }

    pub fn get_memory(&self, id: &str) -> Result<Option<MemoryRecord>> {
        let conn = self.conn.lock().unwrap_or_else(|p| p.into_inner());
        let result = conn.query_row(
            "SELECT id, content, type, source, importance, confidence, tags, pinned, who,
                    created_at, updated_at, accessed_at, access_count, is_deleted
             FROM memories WHERE id = ?1",
            [id],
            row_to_memory,
        );
        match result {
            Ok(record) => Ok(Some(record)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Soft delete.
    pub fn forget(&self, id: &str) -> Result<bool> {
        let conn = self.conn.lock().unwrap_or_else(|p| p.into_inner());
        let changed = conn.execute(
            "UPDATE memories SET is_deleted = 1, updated_at = ?1 WHERE id = ?2",
            rusqlite::params![Utc::now().to_rfc3339(), id],
        )?;
        Ok(changed > 0)
    }

    pub fn update_memory_content(&self, id: &str, content: &str, tags: &[String]) -> Result<()> {
        let tags_json = serde_json::to_string(tags).unwrap_or_else(|_| "[]".into());
        let conn = self.conn.lock().unwrap_or_else(|p| p.into_inner());
        conn.execute(
            "UPDATE memories SET content = ?1, tags = ?2, updated_at = ?3 WHERE id = ?4",
            rusqlite::params![content, tags_json, Utc::now().to_rfc3339(), id],
        )?;
        Ok(())
    }

    // ── embedding audit / backfill ───────────────────────────────────────────

    pub fn audit_embeddings(&self) -> Result<EmbeddingAudit> {
        let conn = self.conn.lock().unwrap_or_else(|p| p.into_inner());
        let total: i64 = conn.query_row(
            "SELECT COUNT(*) FROM memories WHERE is_deleted = 0",
            [],
            |row| row.get(0),
        )?;
        let unembedded: i64 = conn.query_row(
            "SELECT COUNT(*) FROM memories m
             WHERE m.is_deleted = 0
               AND NOT EXISTS (SELECT 1 FROM vec_embeddings v WHERE v.id = m.id)",
            [],
            |row| row.get(0),
        )?;
        let coverage = if total == 0 {
            100.0
        } else {
            (total - unembedded) as f64 / total as f64 * 100.0
        };
        Ok(EmbeddingAudit {
            total,
            unembedded,
            coverage,
        })
    }

    pub async fn backfill_embeddings(
        &self,
        batch_size: usize,
        dry_run: bool,
    ) -> Result<BackfillOutcome> {
        if self.embedder.is_none() {
            return Ok(BackfillOutcome {
                affected: 0,
                message: "no embedding provider configured".into(),
            });
        }

        let pending: Vec<(String, String)> = {
            let conn = self.conn.lock().unwrap_or_else(|p| p.into_inner());
            let mut stmt = conn.prepare(
                "SELECT m.id, m.content FROM memories m
                 WHERE m.is_deleted = 0
                   AND NOT EXISTS (SELECT 1 FROM vec_embeddings v WHERE v.id = m.id)
                 ORDER BY m.created_at
                 LIMIT ?1",
            )?;
            let rows = stmt.query_map([batch_size as i64], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?;
            rows.filter_map(|r| r.ok()).collect()
        };

        if dry_run {
            return Ok(BackfillOutcome {
                affected: pending.len(),
                message: format!("dry run: {} memories would be embedded", pending.len()),
            });
        }

        let mut affected = 0usize;
        for (id, content) in &pending {
            match self.embed_memory(id, content).await {
                Ok(true) => affected += 1,
                Ok(false) => {}
                Err(e) => logger::warn("store", &format!("backfill embed failed for {id}: {e}")),
            }
        }
        Ok(BackfillOutcome {
            affected,
            message: format!("embedded {affected} of {} pending memories", pending.len()),
        })
    }

    // ── queries for refiners / distillation ──────────────────────────────────

    pub fn memories_by_types(
        &self,
        types: &[MemoryType],
        since: Option<&str>,
        limit: usize,
    ) -> Result<Vec<MemoryRecord>> {
        let type_list = types
            .iter()
            .map(|t| format!("'{}'", t.as_str()))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "SELECT id, content, type, source, importance, confidence, tags, pinned, who,
                    created_at, updated_at, accessed_at, access_count, is_deleted
             FROM memories
             WHERE is_deleted = 0 AND type IN ({type_list})
               AND created_at >= ?1
             ORDER BY created_at DESC
             LIMIT ?2"
        );
        let conn = self.conn.lock().unwrap_or_else(|p| p.into_inner());
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(
            rusqlite::params![since.unwrap_or(""), limit as i64],
            row_to_memory,
        )?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    pub fn count_memories(&self) -> Result<i64> {
        let conn = self.conn.lock().unwrap_or_else(|p| p.into_inner());
        Ok(conn.query_row(
            "SELECT COUNT(*) FROM memories WHERE is_deleted = 0",
            [],
            |row| row.get(0),
        )?)
    }

    pub fn count_memories_tagged(&self, tag: &str) -> Result<i64> {
        let needle = format!("%\"{tag}\"%");
        let conn = self.conn.lock().unwrap_or_else(|p| p.into_inner());
        Ok(conn.query_row(
            "SELECT COUNT(*) FROM memories WHERE is_deleted = 0 AND tags LIKE ?1",
            [needle],
            |row| row.get(0),
        )?)
    }

    /// The single `type=system` memory carrying the given tag, if present.
    pub fn find_system_memory_tagged(&self, tag: &str) -> Result<Option<MemoryRecord>> {
        let needle = format!("%\"{tag}\"%");
        let conn = self.conn.lock().unwrap_or_else(|p| p.into_inner());
        let result = conn.query_row(
            "SELECT id, content, type, source, importance, confidence, tags, pinned, who,
                    created_at, updated_at, accessed_at, access_count, is_deleted
             FROM memories
             WHERE is_deleted = 0 AND type = 'system' AND tags LIKE ?1
             ORDER BY updated_at DESC
             LIMIT 1",
            [needle],
            row_to_memory,
        );
        match result {
            Ok(record) => Ok(Some(record)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    // ── perception state ─────────────────────────────────────────────────────

    pub fn state_get(&self, key: &str) -> Option<String> {
        let conn = self.conn.lock().unwrap_or_else(|p| p.into_inner());
        conn.query_row(
            "SELECT value FROM perception_state WHERE key = ?1",
            [key],
            |row| row.get(0),
        )
        .ok()
    }

    pub fn state_set(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|p| p.into_inner());
        conn.execute(
            "INSERT INTO perception_state (key, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            rusqlite::params![key, value, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    // ── expertise graph ──────────────────────────────────────────────────────

    /// Atomic rebuild: delete both tables and reinsert in one transaction.
    pub fn replace_expertise_graph(
        &self,
        nodes: &[ExpertiseNode],
        edges: &[ExpertiseEdge],
    ) -> Result<()> {
        let mut conn = self.conn.lock().unwrap_or_else(|p| p.into_inner());
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM expertise_nodes", [])?;
        tx.execute("DELETE FROM expertise_edges", [])?;
        for node in nodes {
            tx.execute(
                "INSERT INTO expertise_nodes (id, name, entity_type, mentions, first_seen, last_seen)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                rusqlite::params![
                    node.id,
                    node.name,
                    node.entity_type.as_str(),
                    node.mentions,
                    node.first_seen,
                    node.last_seen,
                ],
            )?;
        }
        for edge in edges {
            tx.execute(
                "INSERT INTO expertise_edges (source_id, target_id, weight, co_occurrences)
                 VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![edge.source_id, edge.target_id, edge.weight, edge.co_occurrences],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn expertise_node_by_name(&self, name: &str) -> Result<Option<ExpertiseNode>> {
        let conn = self.conn.lock().unwrap_or_else(|p| p.into_inner());
        let result = conn.query_row(
            "SELECT id, name, entity_type, mentions, first_seen, last_seen
             FROM expertise_nodes WHERE LOWER(name) = LOWER(?1)",
            [name],
            row_to_node,
        );
        match result {
            Ok(node) => Ok(Some(node)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Undirected neighbors of a node, strongest edges first. Both stored
    /// directions materialize here.
    pub fn expertise_neighbors(&self, node_id: &str, limit: usize) -> Result<Vec<(ExpertiseNode, f64)>> {
        let conn = self.conn.lock().unwrap_or_else(|p| p.into_inner());
        let mut stmt = conn.prepare(
            "SELECT n.id, n.name, n.entity_type, n.mentions, n.first_seen, n.last_seen, e.weight
             FROM expertise_edges e
             JOIN expertise_nodes n
               ON n.id = CASE WHEN e.source_id = ?1 THEN e.target_id ELSE e.source_id END
             WHERE e.source_id = ?1 OR e.target_id = ?1
             ORDER BY e.weight DESC
             LIMIT ?2",
        )?;
        let rows = stmt.query_map(rusqlite::params![node_id, limit as i64], |row| {
            Ok((row_to_node(row)?, row.get::<_, f64>(6)?))
        })?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    pub fn expertise_node_count(&self) -> Result<i64> {
        let conn = self.conn.lock().unwrap_or_else(|p| p.into_inner());
        Ok(conn.query_row("SELECT COUNT(*) FROM expertise_nodes", [], |row| row.get(0))?)
    }

    // ── export support ───────────────────────────────────────────────────────

    pub fn all_memories(&self) -> Result<Vec<MemoryRecord>> {
        let conn = self.conn.lock().unwrap_or_else(|p| p.into_inner());
        let mut stmt = conn.prepare(
            "SELECT id, content, type, source, importance, confidence, tags, pinned, who,
                    created_at, updated_at, accessed_at, access_count, is_deleted
             FROM memories WHERE is_deleted = 0 ORDER BY created_at",
        )?;
        let rows = stmt.query_map([], row_to_memory)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    pub fn all_expertise_nodes(&self) -> Result<Vec<ExpertiseNode>> {
        let conn = self.conn.lock().unwrap_or_else(|p| p.into_inner());
        let mut stmt = conn.prepare(
            "SELECT id, name, entity_type, mentions, first_seen, last_seen
             FROM expertise_nodes ORDER BY id",
        )?;
        let rows = stmt.query_map([], row_to_node)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    pub fn all_expertise_edges(&self) -> Result<Vec<ExpertiseEdge>> {
        let conn = self.conn.lock().unwrap_or_else(|p| p.into_inner());
        let mut stmt = conn.prepare(
            "SELECT source_id, target_id, weight, co_occurrences
             FROM expertise_edges ORDER BY source_id, target_id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(ExpertiseEdge {
                source_id: row.get(0)?,
                target_id: row.get(1)?,
                weight: row.get(2)?,
                co_occurrences: row.get(3)?,
            })
        })?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    pub fn vector_for_memory(&self, id: &str) -> Option<Vec<f32>> {
        let conn = self.conn.lock().unwrap_or_else(|p| p.into_inner());
        conn.query_row(
            "SELECT embedding FROM vec_embeddings WHERE id = ?1",
            [id],
            |row| row.get::<_, Vec<u8>>(0),
        )
        .ok()
        .map(|blob| embeddings::blob_to_vec(&blob))
    }

    /// Insert a fully-formed record, e.g. from an import. Existing rows with
    /// the same id are left untouched.
    pub fn insert_record(&self, record: &MemoryRecord, overwrite: bool) -> Result<bool> {
        let tags_json = serde_json::to_string(&record.tags).unwrap_or_else(|_| "[]".into());
        let verb = if overwrite {
            "INSERT OR REPLACE"
        } else {
            "INSERT OR IGNORE"
        };
        let sql = format!(
            "{verb} INTO memories
                (id, content, type, source, importance, confidence, tags, pinned, who,
                 created_at, updated_at, accessed_at, access_count, is_deleted)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)"
        );
        let conn = self.conn.lock().unwrap_or_else(|p| p.into_inner());
        let changed = conn.execute(
            &sql,
            rusqlite::params![
                record.id,
                record.content,
                record.memory_type.as_str(),
                record.source,
                record.importance,
                record.confidence,
                tags_json,
                record.pinned as i64,
                record.who,
                record.created_at,
                record.updated_at,
                record.accessed_at,
                record.access_count,
                record.is_deleted as i64,
            ],
        )?;
        Ok(changed > 0)
    }

    pub fn insert_vector(&self, id: &str, vector: &[f32]) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|p| p.into_inner());
        conn.execute(
            "INSERT OR REPLACE INTO vec_embeddings (id, embedding) VALUES (?1, ?2)",
            rusqlite::params![id, vec_to_blob(vector)],
        )?;
        Ok(())
    }
}

fn row_to_memory(row: &rusqlite::Row<'_>) -> rusqlite::Result<MemoryRecord> {
    let type_str: String = row.get(2)?;
    let tags_json: String = row.get(6)?;
    Ok(MemoryRecord {
        id: row.get(0)?,
        content: row.get(1)?,
        memory_type: MemoryType::parse(&type_str).unwrap_or_default(),
        source: row.get(3)?,
        importance: row.get(4)?,
        confidence: row.get(5)?,
        tags: serde_json::from_str(&tags_json).unwrap_or_default(),
        pinned: row.get::<_, i64>(7)? != 0,
        who: row.get(8)?,
        created_at: row.get(9)?,
        updated_at: row.get(10)?,
        accessed_at: row.get(11)?,
        access_count: row.get(12)?,
        is_deleted: row.get::<_, i64>(13)? != 0,
    })
}

fn row_to_node(row: &rusqlite::Row<'_>) -> rusqlite::Result<ExpertiseNode> {
    let type_str: String = row.get(2)?;
    Ok(ExpertiseNode {
        id: row.get(0)?,
        name: row.get(1)?,
        entity_type: EntityType::parse(&type_str).unwrap_or(EntityType::Skill),
        mentions: row.get(3)?,
        first_seen: row.get(4)?,
        last_seen: row.get(5)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EmbeddingConfig, SearchConfig};
    use search::MatchSource;

    fn open_store(dir: &tempfile::TempDir) -> MemoryStore {
        open_store_with(dir, SearchConfig::default())
    }

    fn open_store_with(dir: &tempfile::TempDir, search_cfg: SearchConfig) -> MemoryStore {
        MemoryStore::open(
            &dir.path().join("memories.db"),
            &EmbeddingConfig::default(),
            search_cfg,
            "http://localhost:11434",
        )
        .expect("open store")
    }

    fn request(content: &str, memory_type: MemoryType) -> RememberRequest {
        RememberRequest {
            content: content.into(),
            memory_type,
            tags: Vec::new(),
            importance: 0.5,
            confidence: 0.5,
            pinned: false,
            who: None,
            source: None,
        }
    }

    #[tokio::test]
    async fn remember_assigns_prefixed_id_and_no_embedding_without_provider() {
        let dir = tempfile::tempdir().expect("temp dir");
        let store = open_store(&dir);
        let outcome = store
            .remember(request("I prefer ripgrep for searching code", MemoryType::Skill))
            .await
            .unwrap();
        assert!(outcome.id.starts_with("mem_"));
        assert!(!outcome.embedded);

        let record = store.get_memory(&outcome.id).unwrap().unwrap();
        assert_eq!(record.memory_type, MemoryType::Skill);
        assert_eq!(record.access_count, 0);
    }

    #[tokio::test]
    async fn keyword_recall_finds_and_touches_memories() {
        let dir = tempfile::tempdir().expect("temp dir");
        let store = open_store(&dir);
        let a = store
            .remember(request("I prefer ripgrep for searching code", MemoryType::Skill))
            .await
            .unwrap();
        store
            .remember(request("lunch was a sandwich", MemoryType::Fact))
            .await
            .unwrap();

        let results = store
            .recall(RecallQuery {
                query: "how do I search code fast".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].id, a.id);
        assert_eq!(results[0].source, MatchSource::Keyword);

        let touched = store.get_memory(&a.id).unwrap().unwrap();
        assert_eq!(touched.access_count, 1);
        assert!(touched.accessed_at.is_some());
    }

    #[tokio::test]
    async fn recall_filters_by_type_and_skips_deleted() {
        let dir = tempfile::tempdir().expect("temp dir");
        // min-max normalization sends the weaker of two keyword hits to 0;
        // disable the score floor so both stay visible to the filters
        let store = open_store_with(
            &dir,
            SearchConfig {
                min_score: 0.0,
                ..SearchConfig::default()
            },
        );
        let skill = store
            .remember(request("ripgrep skills sharpened", MemoryType::Skill))
            .await
            .unwrap();
        let fact = store
            .remember(request("ripgrep manual installed yesterday", MemoryType::Fact))
            .await
            .unwrap();

        let only_facts = store
            .recall(RecallQuery {
                query: "ripgrep".into(),
                memory_type: Some(MemoryType::Fact),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(only_facts.len(), 1);
        assert_eq!(only_facts[0].id, fact.id);

        store.forget(&skill.id).unwrap();
        let after_forget = store
            .recall(RecallQuery {
                query: "ripgrep".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(after_forget.iter().all(|r| r.id != skill.id));
    }

    #[tokio::test]
    async fn pinned_rows_win_score_ties() {
        let dir = tempfile::tempdir().expect("temp dir");
        let store = open_store(&dir);
        store
            .remember(request("deploy checklist alpha", MemoryType::Procedural))
            .await
            .unwrap();
        let pinned = store
            .remember(RememberRequest {
                pinned: true,
                ..request("deploy checklist beta", MemoryType::Procedural)
            })
            .await
            .unwrap();

        let results = store
            .recall(RecallQuery {
                query: "deploy checklist".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].id, pinned.id);
    }

    #[tokio::test]
    async fn audit_counts_unembedded_memories() {
        let dir = tempfile::tempdir().expect("temp dir");
        let store = open_store(&dir);
        store.remember(request("one", MemoryType::Fact)).await.unwrap();
        store.remember(request("two", MemoryType::Fact)).await.unwrap();

        let audit = store.audit_embeddings().unwrap();
        assert_eq!(audit.total, 2);
        assert_eq!(audit.unembedded, 2);
        assert_eq!(audit.coverage, 0.0);
    }

    #[tokio::test]
    async fn backfill_dry_run_never_writes() {
        let dir = tempfile::tempdir().expect("temp dir");
        let store = open_store(&dir);
        store.remember(request("one", MemoryType::Fact)).await.unwrap();
        let outcome = store.backfill_embeddings(50, true).await.unwrap();
        // no provider configured: nothing to do either way
        assert_eq!(outcome.affected, 0);
    }

    #[tokio::test]
    async fn identical_content_copies_vector_instead_of_re_embedding() {
        let dir = tempfile::tempdir().expect("temp dir");
        // embedder configured against a dead endpoint: only the copy path
        // can succeed, which is exactly what identical content should take
        let store = MemoryStore::open(
            &dir.path().join("memories.db"),
            &EmbeddingConfig {
                provider: crate::config::EmbeddingProvider::Ollama,
                dimensions: 4,
                ..EmbeddingConfig::default()
            },
            SearchConfig::default(),
            "http://127.0.0.1:9",
        )
        .unwrap();

        let content = "I prefer ripgrep for searching code";
        let first = store.remember(request(content, MemoryType::Skill)).await.unwrap();
        assert!(!first.embedded); // endpoint down, no vector yet

        // simulate the first memory having been embedded
        let hash = content_hash(content);
        store.insert_vector(&first.id, &[0.1, 0.2, 0.3, 0.4]).unwrap();
        {
            let conn = store.conn.lock().unwrap();
            conn.execute(
                "INSERT INTO embeddings (id, content_hash, dimensions, source_type, source_id, chunk_text, created_at)
                 VALUES ('emb_test', ?1, 4, 'memory', ?2, ?3, ?4)",
                rusqlite::params![hash, first.id, content, Utc::now().to_rfc3339()],
            )
            .unwrap();
        }

        let second = store.remember(request(content, MemoryType::Fact)).await.unwrap();
        assert!(second.embedded);

        let conn = store.conn.lock().unwrap();
        let embedding_rows: i64 = conn
            .query_row("SELECT COUNT(*) FROM embeddings", [], |r| r.get(0))
            .unwrap();
        let vec_rows: i64 = conn
            .query_row("SELECT COUNT(*) FROM vec_embeddings", [], |r| r.get(0))
            .unwrap();
        assert_eq!(embedding_rows, 1);
        assert_eq!(vec_rows, 2);
    }

    #[tokio::test]
    async fn metadata_without_vector_still_reads_as_unembedded() {
        let dir = tempfile::tempdir().expect("temp dir");
        let store = open_store(&dir);
        let outcome = store
            .remember(request("dimension mismatch survivor", MemoryType::Fact))
            .await
            .unwrap();

        // the mismatch path writes the metadata row but skips the vector
        {
            let conn = store.conn.lock().unwrap();
            conn.execute(
                "INSERT INTO embeddings (id, content_hash, dimensions, source_type, source_id, chunk_text, created_at)
                 VALUES ('emb_mismatch', 'hash_x', 1024, 'memory', ?1, '', ?2)",
                rusqlite::params![outcome.id, Utc::now().to_rfc3339()],
            )
            .unwrap();
        }

        let audit = store.audit_embeddings().unwrap();
        assert_eq!(audit.total, 1);
        assert_eq!(audit.unembedded, 1);
    }

    #[test]
    fn perception_state_upserts() {
        let dir = tempfile::tempdir().expect("temp dir");
        let store = open_store(&dir);
        assert_eq!(store.state_get("distillation.lastRun"), None);
        store.state_set("distillation.lastRun", "2026-07-01T00:00:00Z").unwrap();
        store.state_set("distillation.lastRun", "2026-07-02T00:00:00Z").unwrap();
        assert_eq!(
            store.state_get("distillation.lastRun").as_deref(),
            Some("2026-07-02T00:00:00Z")
        );
    }

    #[test]
    fn expertise_graph_replace_and_neighbors() {
        let dir = tempfile::tempdir().expect("temp dir");
        let store = open_store(&dir);
        let now = Utc::now().to_rfc3339();
        let nodes = vec![
            ExpertiseNode {
                id: "ent_rust".into(),
                name: "rust".into(),
                entity_type: EntityType::Language,
                mentions: 5,
                first_seen: now.clone(),
                last_seen: now.clone(),
            },
            ExpertiseNode {
                id: "ent_tokio".into(),
                name: "tokio".into(),
                entity_type: EntityType::Framework,
                mentions: 3,
                first_seen: now.clone(),
                last_seen: now.clone(),
            },
        ];
        let edges = vec![ExpertiseEdge {
            source_id: "ent_rust".into(),
            target_id: "ent_tokio".into(),
            weight: 2.0,
            co_occurrences: 3,
        }];
        store.replace_expertise_graph(&nodes, &edges).unwrap();

        // undirected: both endpoints see the edge
        let from_rust = store.expertise_neighbors("ent_rust", 20).unwrap();
        assert_eq!(from_rust.len(), 1);
        assert_eq!(from_rust[0].0.name, "tokio");
        let from_tokio = store.expertise_neighbors("ent_tokio", 20).unwrap();
        assert_eq!(from_tokio[0].0.name, "rust");

        // rebuild replaces everything
        store.replace_expertise_graph(&[], &[]).unwrap();
        assert_eq!(store.expertise_node_count().unwrap(), 0);
    }
}
