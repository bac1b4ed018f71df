use anyhow::{Context, Result};
use base64::Engine;
use std::collections::BTreeMap;
use std::path::Path;

use super::embeddings::{blob_to_vec, vec_to_blob};
use super::MemoryStore;
use crate::logger;
use crate::models::{ExpertiseEdge, ExpertiseNode, MemoryRecord};

/// Relative path → file content. The portable form of an agent's state:
/// `agent.yaml`, `identity/*.md`, `memories.jsonl`, `entities.jsonl`,
/// `relations.jsonl`, `skills/**`.
pub type FileMap = BTreeMap<String, String>;

const IDENTITY_FILES: &[&str] = &["AGENTS.md", "SOUL.md", "IDENTITY.md", "USER.md", "MEMORY.md"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConflictStrategy {
    #[default]
    Skip,
    Overwrite,
    Merge,
}

impl ConflictStrategy {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "skip" => Some(ConflictStrategy::Skip),
            "overwrite" => Some(ConflictStrategy::Overwrite),
            "merge" => Some(ConflictStrategy::Merge),
            _ => None,
        }
    }
}

#[derive(Debug, Default)]
pub struct ImportSummary {
    pub memories: usize,
    pub skipped: usize,
    pub nodes: usize,
    pub edges: usize,
}

/// Serialize the store (and the state dir's markdown identity) into a file
/// map. Vectors ride along as base64 when requested.
pub fn export(store: &MemoryStore, state_dir: &Path, inline_embeddings: bool) -> Result<FileMap> {
    let mut map = FileMap::new();

    let manifest_path = state_dir.join("agent.yaml");
    if let Ok(content) = std::fs::read_to_string(&manifest_path) {
        map.insert("agent.yaml".into(), content);
    }

    for name in IDENTITY_FILES {
        if let Ok(content) = std::fs::read_to_string(state_dir.join(name)) {
            map.insert(format!("identity/{name}"), content);
        }
    }

    let mut memories_out = String::new();
    for record in store.all_memories()? {
        let mut value = serde_json::to_value(&record).context("serializing memory")?;
        if inline_embeddings {
            if let Some(vector) = store.vector_for_memory(&record.id) {
                let encoded =
                    base64::engine::general_purpose::STANDARD.encode(vec_to_blob(&vector));
                value["embedding"] = serde_json::Value::String(encoded);
            }
        }
        memories_out.push_str(&value.to_string());
        memories_out.push('\n');
    }
    map.insert("memories.jsonl".into(), memories_out);

    let mut entities_out = String::new();
    for node in store.all_expertise_nodes()? {
        entities_out.push_str(&serde_json::to_string(&node)?);
        entities_out.push('\n');
    }
    map.insert("entities.jsonl".into(), entities_out);

    let mut relations_out = String::new();
    for edge in store.all_expertise_edges()? {
        relations_out.push_str(&serde_json::to_string(&edge)?);
        relations_out.push('\n');
    }
    map.insert("relations.jsonl".into(), relations_out);

    let skills_dir = state_dir.join("skills");
    if let Ok(entries) = std::fs::read_dir(&skills_dir) {
        for entry in entries.filter_map(|e| e.ok()) {
            let skill_md = entry.path().join("SKILL.md");
            if let Ok(content) = std::fs::read_to_string(&skill_md) {
                let name = entry.file_name().to_string_lossy().into_owned();
                map.insert(format!("skills/{name}/SKILL.md"), content);
            }
        }
    }

    Ok(map)
}

/// Load a file map's database portion into the store. Identity and skill
/// files are the caller's concern.
pub fn import(store: &MemoryStore, map: &FileMap, strategy: ConflictStrategy) -> Result<ImportSummary> {
    let mut summary = ImportSummary::default();

    if let Some(jsonl) = map.get("memories.jsonl") {
        for line in jsonl.lines().filter(|l| !l.trim().is_empty()) {
            let Ok(mut value) = serde_json::from_str::<serde_json::Value>(line) else {
                logger::warn("export", "skipping malformed memory line");
                summary.skipped += 1;
                continue;
            };
            let embedding = value
                .as_object_mut()
                .and_then(|obj| obj.remove("embedding"))
                .and_then(|v| v.as_str().map(|s| s.to_string()));
            let Ok(record) = serde_json::from_value::<MemoryRecord>(value) else {
                logger::warn("export", "skipping malformed memory record");
                summary.skipped += 1;
                continue;
            };

            let inserted = match strategy {
                ConflictStrategy::Skip => store.insert_record(&record, false)?,
                ConflictStrategy::Overwrite => store.insert_record(&record, true)?,
                ConflictStrategy::Merge => {
                    let existing = store.get_memory(&record.id)?;
                    match existing {
                        Some(current) if current.updated_at >= record.updated_at => false,
                        _ => store.insert_record(&record, true)?,
                    }
                }
            };

            if inserted {
                summary.memories += 1;
                if let Some(encoded) = embedding {
                    if let Ok(blob) = base64::engine::general_purpose::STANDARD.decode(encoded) {
                        store.insert_vector(&record.id, &blob_to_vec(&blob))?;
                    }
                }
            } else {
                summary.skipped += 1;
            }
        }
    }

    let nodes: Vec<ExpertiseNode> = map
        .get("entities.jsonl")
        .map(|jsonl| {
            jsonl
                .lines()
                .filter(|l| !l.trim().is_empty())
                .filter_map(|l| serde_json::from_str(l).ok())
                .collect()
        })
        .unwrap_or_default();
    let edges: Vec<ExpertiseEdge> = map
        .get("relations.jsonl")
        .map(|jsonl| {
            jsonl
                .lines()
                .filter(|l| !l.trim().is_empty())
                .filter_map(|l| serde_json::from_str(l).ok())
                .collect()
        })
        .unwrap_or_default();
    if !nodes.is_empty() || !edges.is_empty() {
        summary.nodes = nodes.len();
        summary.edges = edges.len();
        store.replace_expertise_graph(&nodes, &edges)?;
    }

    Ok(summary)
}

pub fn write_to_dir(map: &FileMap, dir: &Path) -> Result<()> {
    for (rel, content) in map {
        let path = dir.join(rel);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, content).with_context(|| format!("writing {}", path.display()))?;
    }
    Ok(())
}

pub fn read_from_dir(dir: &Path) -> Result<FileMap> {
    let mut map = FileMap::new();
    read_dir_into(dir, dir, &mut map)?;
    Ok(map)
}

fn read_dir_into(root: &Path, dir: &Path, map: &mut FileMap) -> Result<()> {
    let entries = std::fs::read_dir(dir).with_context(|| format!("reading {}", dir.display()))?;
    for entry in entries.filter_map(|e| e.ok()) {
        let path = entry.path();
        if path.is_dir() {
            read_dir_into(root, &path, map)?;
        } else if let Ok(content) = std::fs::read_to_string(&path) {
            let rel = path
                .strip_prefix(root)
                .unwrap_or(&path)
                .to_string_lossy()
                .into_owned();
            map.insert(rel, content);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EmbeddingConfig, SearchConfig};
    use crate::models::MemoryType;
    use crate::store::{MemoryStore, RememberRequest};

    fn open_store(dir: &Path) -> MemoryStore {
        MemoryStore::open(
            &dir.join("memories.db"),
            &EmbeddingConfig::default(),
            SearchConfig::default(),
            "http://localhost:11434",
        )
        .expect("open store")
    }

    async fn seed(store: &MemoryStore) {
        for (content, memory_type, tags) in [
            ("I prefer ripgrep", MemoryType::Skill, vec!["rust".to_string()]),
            ("team uses trunk-based flow", MemoryType::Decision, vec![]),
            ("standup at ten", MemoryType::Fact, vec!["team".to_string()]),
        ] {
            store
                .remember(RememberRequest {
                    content: content.into(),
                    memory_type,
                    tags,
                    importance: 0.7,
                    confidence: 0.9,
                    pinned: false,
                    who: Some("dev".into()),
                    source: None,
                })
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn export_import_overwrite_round_trips_memories() {
        let src_dir = tempfile::tempdir().expect("temp dir");
        let dst_dir = tempfile::tempdir().expect("temp dir");
        let src = open_store(src_dir.path());
        seed(&src).await;

        let map = export(&src, src_dir.path(), false).unwrap();
        assert!(map.contains_key("memories.jsonl"));

        let dst = open_store(dst_dir.path());
        let summary = import(&dst, &map, ConflictStrategy::Overwrite).unwrap();
        assert_eq!(summary.memories, 3);

        let mut original = src.all_memories().unwrap();
        let mut imported = dst.all_memories().unwrap();
        original.sort_by(|a, b| a.id.cmp(&b.id));
        imported.sort_by(|a, b| a.id.cmp(&b.id));
        assert_eq!(original.len(), imported.len());
        for (a, b) in original.iter().zip(imported.iter()) {
            assert_eq!(a.content, b.content);
            assert_eq!(a.memory_type, b.memory_type);
            assert_eq!(a.tags, b.tags);
            assert_eq!(a.importance, b.importance);
            assert_eq!(a.confidence, b.confidence);
            assert_eq!(a.created_at, b.created_at);
        }
    }

    #[tokio::test]
    async fn import_skip_keeps_existing_rows() {
        let src_dir = tempfile::tempdir().expect("temp dir");
        let src = open_store(src_dir.path());
        seed(&src).await;
        let map = export(&src, src_dir.path(), false).unwrap();

        // importing into the same store: every id already exists
        let summary = import(&src, &map, ConflictStrategy::Skip).unwrap();
        assert_eq!(summary.memories, 0);
        assert_eq!(summary.skipped, 3);
        assert_eq!(src.count_memories().unwrap(), 3);
    }

    #[tokio::test]
    async fn import_merge_keeps_newer_updated_at() {
        let src_dir = tempfile::tempdir().expect("temp dir");
        let src = open_store(src_dir.path());
        seed(&src).await;
        let mut map = export(&src, src_dir.path(), false).unwrap();

        // age one incoming record so the local copy wins
        let jsonl = map.get("memories.jsonl").unwrap().clone();
        let aged = jsonl
            .lines()
            .map(|line| {
                let mut v: serde_json::Value = serde_json::from_str(line).unwrap();
                v["updated_at"] = serde_json::Value::String("2000-01-01T00:00:00Z".into());
                v["content"] = serde_json::Value::String("stale content".into());
                v.to_string()
            })
            .collect::<Vec<_>>()
            .join("\n");
        map.insert("memories.jsonl".into(), aged);

        let summary = import(&src, &map, ConflictStrategy::Merge).unwrap();
        assert_eq!(summary.memories, 0);
        for record in src.all_memories().unwrap() {
            assert_ne!(record.content, "stale content");
        }
    }

    #[tokio::test]
    async fn file_map_round_trips_through_directory() {
        let src_dir = tempfile::tempdir().expect("temp dir");
        std::fs::write(src_dir.path().join("SOUL.md"), "# soul\n").unwrap();
        let skills = src_dir.path().join("skills/review");
        std::fs::create_dir_all(&skills).unwrap();
        std::fs::write(skills.join("SKILL.md"), "# review\n").unwrap();

        let src = open_store(src_dir.path());
        seed(&src).await;
        let map = export(&src, src_dir.path(), false).unwrap();
        assert!(map.contains_key("identity/SOUL.md"));
        assert!(map.contains_key("skills/review/SKILL.md"));

        let out_dir = tempfile::tempdir().expect("temp dir");
        write_to_dir(&map, out_dir.path()).unwrap();
        let reread = read_from_dir(out_dir.path()).unwrap();
        assert_eq!(map, reread);
    }

    #[test]
    fn conflict_strategy_parses_known_values() {
        assert_eq!(ConflictStrategy::parse("skip"), Some(ConflictStrategy::Skip));
        assert_eq!(
            ConflictStrategy::parse("overwrite"),
            Some(ConflictStrategy::Overwrite)
        );
        assert_eq!(ConflictStrategy::parse("merge"), Some(ConflictStrategy::Merge));
        assert_eq!(ConflictStrategy::parse("upsert"), None);
    }
}
