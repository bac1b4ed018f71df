use anyhow::Result;
use chrono::Utc;
use regex::Regex;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::OnceLock;

use crate::models::{EntityType, ExpertiseEdge, ExpertiseNode, MemoryRecord, MemoryType};
use crate::store::MemoryStore;

const RELATED_LIMIT: usize = 20;

const LANGUAGES: &[&str] = &[
    "rust", "python", "typescript", "javascript", "go", "java", "kotlin", "swift", "ruby", "c",
    "cpp", "c++", "csharp", "c#", "haskell", "elixir", "scala", "sql", "bash", "zsh", "lua", "zig",
];

const FRAMEWORKS: &[&str] = &[
    "react", "vue", "svelte", "angular", "nextjs", "django", "flask", "fastapi", "rails",
    "spring", "tokio", "axum", "actix", "express", "tailwind", "electron", "tauri",
];

const TOOLS: &[&str] = &[
    "git", "docker", "kubernetes", "ripgrep", "tmux", "vim", "neovim", "emacs", "postgres",
    "sqlite", "redis", "kafka", "terraform", "ansible", "jest", "pytest", "cargo", "npm",
    "webpack", "vite", "make", "ollama", "whisper", "ffmpeg",
];

/// Tags that describe the memory, not the developer's world.
const STOP_TAGS: &[&str] = &[
    "skill", "fact", "decision", "memory", "context", "general", "misc", "todo", "note", "work",
    "important", "cognitive-profile",
];

pub fn classify_entity(term: &str) -> Option<EntityType> {
    let lower = term.to_lowercase();
    if STOP_TAGS.contains(&lower.as_str()) {
        return None;
    }
    if LANGUAGES.contains(&lower.as_str()) {
        return Some(EntityType::Language);
    }
    if FRAMEWORKS.contains(&lower.as_str()) {
        return Some(EntityType::Framework);
    }
    if TOOLS.contains(&lower.as_str()) {
        return Some(EntityType::Tool);
    }
    if lower.contains("project") || lower.contains("repo") || term.starts_with('@') {
        return Some(EntityType::Project);
    }
    static PERSON_RE: OnceLock<Regex> = OnceLock::new();
    let person = PERSON_RE.get_or_init(|| Regex::new(r"^[A-Z][a-z]+ [A-Z][a-z]+$").expect("regex"));
    if person.is_match(term) {
        return Some(EntityType::Person);
    }
    Some(EntityType::Skill)
}

fn entity_id(name: &str) -> String {
    let slug: String = name
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '_' })
        .collect();
    format!("ent_{slug}")
}

/// Entities a single memory mentions: every non-stop tag, plus content terms
/// of skill memories that hit the built-in keyword sets.
fn entities_of(memory: &MemoryRecord) -> BTreeMap<String, (String, EntityType)> {
    let mut found = BTreeMap::new();
    for tag in &memory.tags {
        if let Some(entity_type) = classify_entity(tag) {
            found.insert(entity_id(tag), (tag.to_lowercase(), entity_type));
        }
    }
    if memory.memory_type == MemoryType::Skill {
        for term in memory
            .content
            .split(|c: char| !c.is_alphanumeric() && c != '#' && c != '+')
        {
            let lower = term.to_lowercase();
            if lower.is_empty() {
                continue;
            }
            let entity_type = if LANGUAGES.contains(&lower.as_str()) {
                EntityType::Language
            } else if FRAMEWORKS.contains(&lower.as_str()) {
                EntityType::Framework
            } else if TOOLS.contains(&lower.as_str()) {
                EntityType::Tool
            } else {
                continue;
            };
            found.insert(entity_id(&lower), (lower, entity_type));
        }
    }
    found
}

/// Deterministic rebuild of the co-occurrence graph from all live memories.
/// Replaces both tables atomically; returns (nodes, edges).
pub fn rebuild_graph(store: &MemoryStore) -> Result<(usize, usize)> {
    let memories = store.all_memories()?;

    struct NodeAcc {
        name: String,
        entity_type: EntityType,
        mentions: i64,
        first_seen: String,
        last_seen: String,
    }
    let mut nodes: BTreeMap<String, NodeAcc> = BTreeMap::new();
    let mut co_occurrences: BTreeMap<(String, String), i64> = BTreeMap::new();

    for memory in &memories {
        let entities = entities_of(memory);
        for (id, (name, entity_type)) in &entities {
            let acc = nodes.entry(id.clone()).or_insert_with(|| NodeAcc {
                name: name.clone(),
                entity_type: *entity_type,
                mentions: 0,
                first_seen: memory.created_at.clone(),
                last_seen: memory.created_at.clone(),
            });
            acc.mentions += 1;
            if memory.created_at < acc.first_seen {
                acc.first_seen = memory.created_at.clone();
            }
            if memory.created_at > acc.last_seen {
                acc.last_seen = memory.created_at.clone();
            }
        }

        // unordered pairs with canonical id ordering
        let ids: Vec<&String> = entities.keys().collect();
        for i in 0..ids.len() {
            for j in (i + 1)..ids.len() {
                let (a, b) = if ids[i] < ids[j] {
                    (ids[i].clone(), ids[j].clone())
                } else {
                    (ids[j].clone(), ids[i].clone())
                };
                *co_occurrences.entry((a, b)).or_insert(0) += 1;
            }
        }
    }

    let now = Utc::now().to_rfc3339();
    let node_rows: Vec<ExpertiseNode> = nodes
        .into_iter()
        .map(|(id, acc)| ExpertiseNode {
            id,
            name: acc.name,
            entity_type: acc.entity_type,
            mentions: acc.mentions,
            first_seen: if acc.first_seen.is_empty() { now.clone() } else { acc.first_seen },
            last_seen: if acc.last_seen.is_empty() { now.clone() } else { acc.last_seen },
        })
        .collect();
    let edge_rows: Vec<ExpertiseEdge> = co_occurrences
        .into_iter()
        .map(|((source_id, target_id), count)| ExpertiseEdge {
            source_id,
            target_id,
            weight: (1.0 + count as f64).log2(),
            co_occurrences: count,
        })
        .collect();

    store.replace_expertise_graph(&node_rows, &edge_rows)?;
    Ok((node_rows.len(), edge_rows.len()))
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct RelatedEntity {
    pub name: String,
    pub entity_type: EntityType,
    pub weight: f64,
    pub mentions: i64,
}

/// Top neighbors of a skill by edge weight.
pub fn related(store: &MemoryStore, skill: &str) -> Result<Vec<RelatedEntity>> {
    let Some(node) = store.expertise_node_by_name(skill)? else {
        return Ok(Vec::new());
    };
    let neighbors = store.expertise_neighbors(&node.id, RELATED_LIMIT)?;
    Ok(neighbors
        .into_iter()
        .map(|(n, weight)| RelatedEntity {
            name: n.name,
            entity_type: n.entity_type,
            weight,
            mentions: n.mentions,
        })
        .collect())
}

#[derive(Serialize, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DepthReport {
    pub memory_count: i64,
    pub unique_skills: usize,
    pub related_entities: usize,
    pub depth: &'static str,
}

/// How deep the developer's experience in a domain runs, bucketed by how
/// much memory supports it.
pub fn depth(store: &MemoryStore, domain: &str) -> Result<DepthReport> {
    let memory_count = store.count_memories_tagged(&domain.to_lowercase())?;
    let (unique_skills, related_entities) = match store.expertise_node_by_name(domain)? {
        Some(node) => {
            let neighbors = store.expertise_neighbors(&node.id, 1000)?;
            let skills: BTreeSet<String> = neighbors
                .iter()
                .filter(|(n, _)| n.entity_type == EntityType::Skill)
                .map(|(n, _)| n.name.clone())
                .collect();
            (skills.len(), neighbors.len())
        }
        None => (0, 0),
    };

    let depth = if memory_count >= 50 && unique_skills >= 10 {
        "expert"
    } else if memory_count >= 20 {
        "deep"
    } else if memory_count >= 5 {
        "moderate"
    } else {
        "surface"
    };

    Ok(DepthReport {
        memory_count,
        unique_skills,
        related_entities,
        depth,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EmbeddingConfig, SearchConfig};
    use crate::store::RememberRequest;

    fn open_store(dir: &tempfile::TempDir) -> MemoryStore {
        MemoryStore::open(
            &dir.path().join("memories.db"),
            &EmbeddingConfig::default(),
            SearchConfig::default(),
            "http://127.0.0.1:9",
        )
        .unwrap()
    }

    #[test]
    fn classification_covers_all_heuristics() {
        assert_eq!(classify_entity("rust"), Some(EntityType::Language));
        assert_eq!(classify_entity("Tokio"), Some(EntityType::Framework));
        assert_eq!(classify_entity("docker"), Some(EntityType::Tool));
        assert_eq!(classify_entity("side-project"), Some(EntityType::Project));
        assert_eq!(classify_entity("@signet"), Some(EntityType::Project));
        assert_eq!(classify_entity("Ada Lovelace"), Some(EntityType::Person));
        assert_eq!(classify_entity("profiling"), Some(EntityType::Skill));
        assert_eq!(classify_entity("misc"), None);
        assert_eq!(classify_entity("todo"), None);
    }

    #[tokio::test]
    async fn rebuild_counts_cooccurrences_with_log_weights() {
        let dir = tempfile::tempdir().expect("temp dir");
        let store = open_store(&dir);
        for _ in 0..3 {
            store
                .remember(RememberRequest {
                    content: "async work".into(),
                    memory_type: MemoryType::Skill,
                    tags: vec!["rust".into(), "tokio".into()],
                    importance: 0.8,
                    confidence: 0.9,
                    pinned: false,
                    who: None,
                    source: None,
                })
                .await
                .unwrap();
        }

        let (nodes, edges) = rebuild_graph(&store).unwrap();
        assert_eq!(nodes, 2);
        assert_eq!(edges, 1);

        let edge_rows = store.all_expertise_edges().unwrap();
        assert_eq!(edge_rows[0].co_occurrences, 3);
        assert!((edge_rows[0].weight - 2.0).abs() < 1e-9); // log2(1+3)
        assert!(edge_rows[0].source_id < edge_rows[0].target_id);

        let related = related(&store, "rust").unwrap();
        assert_eq!(related.len(), 1);
        assert_eq!(related[0].name, "tokio");
    }

    #[tokio::test]
    async fn skill_content_terms_become_entities() {
        let dir = tempfile::tempdir().expect("temp dir");
        let store = open_store(&dir);
        store
            .remember(RememberRequest {
                content: "ripgrep mastery while refactoring".into(),
                memory_type: MemoryType::Skill,
                tags: vec![],
                importance: 0.8,
                confidence: 0.9,
                pinned: false,
                who: None,
                source: None,
            })
            .await
            .unwrap();
        rebuild_graph(&store).unwrap();
        assert!(store.expertise_node_by_name("ripgrep").unwrap().is_some());
    }

    #[tokio::test]
    async fn depth_buckets_by_memory_count() {
        let dir = tempfile::tempdir().expect("temp dir");
        let store = open_store(&dir);
        let report = depth(&store, "rust").unwrap();
        assert_eq!(report.depth, "surface");

        for i in 0..6 {
            store
                .remember(RememberRequest {
                    content: format!("rust note {i}"),
                    memory_type: MemoryType::Fact,
                    tags: vec!["rust".into()],
                    importance: 0.5,
                    confidence: 0.5,
                    pinned: false,
                    who: None,
                    source: None,
                })
                .await
                .unwrap();
        }
        let report = depth(&store, "rust").unwrap();
        assert_eq!(report.memory_count, 6);
        assert_eq!(report.depth, "moderate");
    }
}
