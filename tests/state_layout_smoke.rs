//! Smoke tests for the on-disk contracts external collaborators depend on:
//! the daily log line shape, the export JSONL record, and the agent.yaml
//! manifest keys. These mirror the documented shapes rather than importing
//! daemon internals, so a drift in the wire format fails here.

use std::fs;

mod common {
    use serde::{Deserialize, Serialize};

    #[derive(Serialize, Deserialize)]
    pub struct LogLine {
        pub timestamp: String,
        pub level: String,
        pub category: String,
        pub message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub data: Option<serde_json::Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub error: Option<String>,
    }

    #[derive(Serialize, Deserialize, Clone)]
    pub struct ExportedMemory {
        pub id: String,
        pub content: String,
        #[serde(rename = "type")]
        pub memory_type: String,
        pub source: String,
        pub importance: f64,
        pub confidence: f64,
        pub tags: Vec<String>,
        pub pinned: bool,
        pub who: String,
        pub created_at: String,
        pub updated_at: String,
        #[serde(default)]
        pub access_count: i64,
        #[serde(default)]
        pub is_deleted: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub embedding: Option<String>,
    }

    pub fn sample_memory(id: &str) -> ExportedMemory {
        ExportedMemory {
            id: id.to_string(),
            content: "prefers ripgrep for code search".to_string(),
            memory_type: "skill".to_string(),
            source: "skill-extractor".to_string(),
            importance: 0.8,
            confidence: 0.9,
            tags: vec!["ripgrep".to_string(), "rust".to_string()],
            pinned: false,
            who: "dev".to_string(),
            created_at: "2026-07-01T10:00:00Z".to_string(),
            updated_at: "2026-07-01T10:00:00Z".to_string(),
            access_count: 0,
            is_deleted: false,
            embedding: None,
        }
    }
}

use common::{sample_memory, ExportedMemory, LogLine};

#[test]
fn log_lines_are_one_json_object_each() {
    let dir = tempfile::tempdir().expect("temp dir");
    let path = dir.path().join("signet-2026-07-01.log");

    let lines: Vec<String> = (0..5)
        .map(|i| {
            serde_json::to_string(&LogLine {
                timestamp: chrono::Utc::now().to_rfc3339(),
                level: if i % 2 == 0 { "info" } else { "warn" }.to_string(),
                category: "capture".to_string(),
                message: format!("event {i}"),
                data: Some(serde_json::json!({"n": i})),
                error: None,
            })
            .expect("serialize")
        })
        .collect();
    fs::write(&path, lines.join("\n")).expect("write log");

    let content = fs::read_to_string(&path).expect("read log");
    for line in content.lines() {
        let parsed: LogLine = serde_json::from_str(line).expect("valid log line");
        assert!(matches!(parsed.level.as_str(), "info" | "warn"));
        assert_eq!(parsed.category, "capture");
    }
}

#[test]
fn memories_jsonl_round_trips() {
    let dir = tempfile::tempdir().expect("temp dir");
    let path = dir.path().join("memories.jsonl");

    let records: Vec<ExportedMemory> =
        (0..3).map(|i| sample_memory(&format!("mem_{i}"))).collect();
    let jsonl: String = records
        .iter()
        .map(|r| serde_json::to_string(r).expect("serialize"))
        .collect::<Vec<_>>()
        .join("\n");
    fs::write(&path, &jsonl).expect("write jsonl");

    let content = fs::read_to_string(&path).expect("read jsonl");
    let reread: Vec<ExportedMemory> = content
        .lines()
        .map(|l| serde_json::from_str(l).expect("valid record"))
        .collect();
    assert_eq!(reread.len(), 3);
    assert_eq!(reread[0].content, records[0].content);
    assert_eq!(reread[0].memory_type, "skill");
    assert_eq!(reread[0].tags, records[0].tags);
}

#[test]
fn exported_memory_tolerates_inlined_embedding() {
    let mut record = sample_memory("mem_x");
    record.embedding = Some("AAAAAAAAgD8AAABA".to_string()); // base64 of two f32s
    let line = serde_json::to_string(&record).expect("serialize");
    let parsed: ExportedMemory = serde_json::from_str(&line).expect("parse");
    assert!(parsed.embedding.is_some());

    // and records without one stay clean
    let bare = serde_json::to_string(&sample_memory("mem_y")).expect("serialize");
    assert!(!bare.contains("embedding"));
}

#[test]
fn agent_yaml_recognized_keys_parse() {
    let yaml = r#"
version: 1
schema: signet/v1
agent:
  name: dev-agent
  description: personal agent
harnesses:
  - claude-code
memory:
  database: memory/memories.db
  session_budget: 2000
  decay_rate: 0.01
search:
  alpha: 0.7
  top_k: 20
  min_score: 0.3
embedding:
  provider: ollama
  model: nomic-embed-text
  dimensions: 768
perception:
  refinerIntervalMinutes: 20
  ollamaUrl: http://localhost:11434
  refinerModel: llama3.2
  screen:
    enabled: true
    intervalSeconds: 30
  voice:
    enabled: false
    vadThreshold: 0.3
"#;
    let parsed: serde_yaml::Value = serde_yaml::from_str(yaml).expect("valid yaml");
    assert_eq!(parsed["version"], serde_yaml::Value::from(1));
    assert_eq!(parsed["schema"], serde_yaml::Value::from("signet/v1"));
    assert_eq!(parsed["search"]["alpha"], serde_yaml::Value::from(0.7));
    assert_eq!(
        parsed["perception"]["screen"]["intervalSeconds"],
        serde_yaml::Value::from(30)
    );
}
