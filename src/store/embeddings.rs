use anyhow::{Context, Result};
use rusqlite::Connection;
use sha2::{Digest, Sha256};
use std::time::Duration;

use crate::config::{EmbeddingConfig, EmbeddingProvider};
use crate::logger;

const EMBED_TIMEOUT: Duration = Duration::from_secs(30);

/// Stable identity of a memory's content: identical text embeds once.
pub fn content_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    let digest = hasher.finalize();
    let mut out = String::with_capacity(64);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

/// f32 slice ⇄ little-endian blob, the representation both the vec table and
/// the legacy BLOB column use.
pub fn vec_to_blob(vector: &[f32]) -> Vec<u8> {
    let mut blob = Vec::with_capacity(vector.len() * 4);
    for value in vector {
        blob.extend_from_slice(&value.to_le_bytes());
    }
    blob
}

pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Process-wide embedding backend. Immutable after construction; changing
/// provider or dimensions requires a daemon restart.
pub struct Embedder {
    provider: EmbeddingProvider,
    model: String,
    dimensions: usize,
    base_url: String,
    api_key: Option<String>,
    http: reqwest::Client,
}

impl Embedder {
    /// Returns None when the manifest selects no provider.
    pub fn from_config(config: &EmbeddingConfig, ollama_url: &str) -> Option<Self> {
        if config.provider == EmbeddingProvider::None {
            return None;
        }
        let base_url = match (&config.base_url, config.provider) {
            (Some(url), _) => url.trim_end_matches('/').to_string(),
            (None, EmbeddingProvider::Ollama) => ollama_url.trim_end_matches('/').to_string(),
            (None, EmbeddingProvider::Openai) => "https://api.openai.com".to_string(),
            (None, EmbeddingProvider::None) => return None,
        };
        let http = reqwest::Client::builder()
            .timeout(EMBED_TIMEOUT)
            .build()
            .unwrap_or_default();
        Some(Self {
            provider: config.provider,
            model: config.model.clone(),
            dimensions: config.dimensions,
            base_url,
            api_key: config.api_key.clone(),
            http,
        })
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    pub async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        match self.provider {
            EmbeddingProvider::Ollama => self.embed_ollama(text).await,
            EmbeddingProvider::Openai => self.embed_openai(text).await,
            EmbeddingProvider::None => anyhow::bail!("no embedding provider configured"),
        }
    }

    async fn embed_ollama(&self, text: &str) -> Result<Vec<f32>> {
        let url = format!("{}/api/embeddings", self.base_url);
        let body = serde_json::json!({"model": self.model, "prompt": text});
        let resp = self
            .http
            .post(&url)
            .json(&body)
            .send()
            .await
            .with_context(|| format!("POST {url}"))?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            let prefix: String = text.chars().take(200).collect();
            anyhow::bail!("embeddings returned {status}: {prefix}");
        }
        let parsed: serde_json::Value = resp.json().await.context("decoding embedding")?;
        extract_floats(&parsed["embedding"])
    }

    async fn embed_openai(&self, text: &str) -> Result<Vec<f32>> {
        let url = format!("{}/v1/embeddings", self.base_url);
        let body = serde_json::json!({"model": self.model, "input": text});
        let mut req = self.http.post(&url).json(&body);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }
        let resp = req.send().await.with_context(|| format!("POST {url}"))?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            let prefix: String = text.chars().take(200).collect();
            anyhow::bail!("embeddings returned {status}: {prefix}");
        }
        let parsed: serde_json::Value = resp.json().await.context("decoding embedding")?;
        extract_floats(&parsed["data"][0]["embedding"])
    }
}

fn extract_floats(value: &serde_json::Value) -> Result<Vec<f32>> {
    let array = value
        .as_array()
        .context("embedding response carried no vector")?;
    Ok(array
        .iter()
        .filter_map(|v| v.as_f64())
        .map(|f| f as f32)
        .collect())
}

/// One-shot migration from the old `embeddings.vector BLOB` column into the
/// vec0 virtual table.
pub fn migrate_blob_vectors(conn: &Connection, keep_blobs: bool) -> Result<usize> {
    if !super::migrations::column_exists(conn, "embeddings", "vector") {
        return Ok(0);
    }

    conn.query_row("SELECT vec_version()", [], |row| row.get::<_, String>(0))
        .context("sqlite-vec extension is not loaded; cannot migrate BLOB vectors")?;

    let dims: usize = conn
        .query_row(
            "SELECT dimensions FROM embeddings WHERE vector IS NOT NULL LIMIT 1",
            [],
            |row| row.get::<_, i64>(0),
        )
        .map(|d| d as usize)
        .context("no embedded rows to size the vector table from")?;

    conn.execute_batch(&format!(
        "DROP TABLE IF EXISTS vec_embeddings;
        CREATE VIRTUAL TABLE vec_embeddings USING vec0(
            id TEXT PRIMARY KEY,
            embedding FLOAT[{dims}] distance_metric=cosine
        );"
    ))?;

    let mut migrated = 0usize;
    {
        let mut read = conn.prepare(
            "SELECT source_id, vector FROM embeddings WHERE vector IS NOT NULL",
        )?;
        let mut insert =
            conn.prepare("INSERT OR REPLACE INTO vec_embeddings (id, embedding) VALUES (?1, ?2)")?;
        let mut rows = read.query([])?;
        while let Some(row) = rows.next()? {
            let id: String = row.get(0)?;
            let blob: Vec<u8> = row.get(1)?;
            let vector = blob_to_vec(&blob);
            if vector.len() != dims {
                logger::warn(
                    "store",
                    &format!("skipping blob vector for {id}: {} dims, expected {dims}", vector.len()),
                );
                continue;
            }
            insert.execute(rusqlite::params![id, vec_to_blob(&vector)])?;
            migrated += 1;
        }
    }

    if !keep_blobs {
        conn.execute_batch(
            "BEGIN;
            CREATE TABLE embeddings_new (
                id TEXT PRIMARY KEY,
                content_hash TEXT NOT NULL UNIQUE,
                dimensions INTEGER NOT NULL,
                source_type TEXT NOT NULL DEFAULT 'memory',
                source_id TEXT NOT NULL,
                chunk_text TEXT NOT NULL DEFAULT '',
                created_at TEXT NOT NULL
            );
            INSERT INTO embeddings_new
                SELECT id, content_hash, dimensions, source_type, source_id, chunk_text, created_at
                FROM embeddings;
            DROP TABLE embeddings;
            ALTER TABLE embeddings_new RENAME TO embeddings;
            COMMIT;",
        )
        .context("dropping legacy vector column")?;
    }

    logger::info(
        "store",
        &format!("migrated {migrated} blob vectors into vec_embeddings"),
    );
    Ok(migrated)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_hash_is_stable_and_distinct() {
        let a = content_hash("I prefer ripgrep");
        let b = content_hash("I prefer ripgrep");
        let c = content_hash("something else");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn blob_round_trip_preserves_f32_values() {
        let vector = vec![0.25f32, -1.5, 3.0, f32::MIN_POSITIVE];
        let blob = vec_to_blob(&vector);
        assert_eq!(blob.len(), 16);
        assert_eq!(blob_to_vec(&blob), vector);
    }

    #[test]
    fn from_config_none_provider_yields_no_embedder() {
        let config = EmbeddingConfig::default();
        assert!(Embedder::from_config(&config, "http://localhost:11434").is_none());
    }

    #[test]
    fn from_config_ollama_uses_inference_url() {
        let config = EmbeddingConfig {
            provider: EmbeddingProvider::Ollama,
            ..EmbeddingConfig::default()
        };
        let embedder = Embedder::from_config(&config, "http://localhost:11434/").unwrap();
        assert_eq!(embedder.base_url, "http://localhost:11434");
        assert_eq!(embedder.dimensions(), 768);
    }

    #[test]
    fn extract_floats_reads_json_array() {
        let value = serde_json::json!([0.1, 0.2, 0.3]);
        let floats = extract_floats(&value).unwrap();
        assert_eq!(floats.len(), 3);
        assert!(extract_floats(&serde_json::json!("nope")).is_err());
    }
}
