use axum::extract::{Query, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::Json;
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use std::convert::Infallible;
use std::path::Path;

use super::{ApiError, AppState};
use crate::llm;
use crate::logger::{self, LogLevel};
use crate::models::MemoryType;
use crate::store::search::RecallQuery;
use crate::store::{RememberRequest, DEFAULT_BACKFILL_BATCH};

const HOOK_RECALL_LIMIT: usize = 5;
const TRANSCRIPT_TURN_CAP: usize = 50;

pub async fn health(State(state): State<AppState>) -> Json<Value> {
    // the store answering a count is the readiness signal that matters
    let store_ready = state.store.count_memories().is_ok();
    Json(json!({"ok": store_ready}))
}

pub async fn status(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "pid": std::process::id(),
        "uptime": state.started_at.elapsed().as_secs(),
        "version": env!("CARGO_PKG_VERSION"),
        "captureCounts": state
            .manager
            .counts()
            .into_iter()
            .map(|(name, count)| (name.to_string(), count))
            .collect::<std::collections::BTreeMap<String, usize>>(),
        "memoriesExtractedToday": state.scheduler.memories_extracted_today(),
        "lastRefinerRun": state.scheduler.last_refiner_run(),
        "expertiseNodes": state.store.expertise_node_count().unwrap_or(0),
        "disabledAdapters": state.manager.disabled_adapters(),
    }))
}

// ── Distillation artifacts ───────────────────────────────────────────────────

pub async fn agent_card(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let card = crate::distill::card::agent_card(&state.store, &state.agent_name)?;
    Ok(Json(serde_json::to_value(card).unwrap_or_default()))
}

#[derive(Deserialize)]
pub struct RelatedQuery {
    pub skill: String,
}

pub async fn expertise_related(
    State(state): State<AppState>,
    Query(params): Query<RelatedQuery>,
) -> Result<Json<Value>, ApiError> {
    let related = crate::distill::graph::related(&state.store, &params.skill)?;
    Ok(Json(json!({"skill": params.skill, "related": related})))
}

#[derive(Deserialize)]
pub struct DepthQuery {
    pub domain: String,
}

pub async fn expertise_depth(
    State(state): State<AppState>,
    Query(params): Query<DepthQuery>,
) -> Result<Json<Value>, ApiError> {
    let report = crate::distill::graph::depth(&state.store, &params.domain)?;
    Ok(Json(json!({"domain": params.domain, "report": report})))
}

// ── Memory ───────────────────────────────────────────────────────────────────

pub async fn remember(
    State(state): State<AppState>,
    Json(req): Json<RememberRequest>,
) -> Result<Json<Value>, ApiError> {
    if req.content.trim().is_empty() {
        return Err(ApiError::bad_request("content must not be empty"));
    }
    let memory_type = req.memory_type;
    let tags = req.tags.clone();
    let pinned = req.pinned;
    let outcome = state.store.remember(req).await?;
    Ok(Json(json!({
        "id": outcome.id,
        "embedded": outcome.embedded,
        "type": memory_type.as_str(),
        "tags": tags,
        "pinned": pinned,
    })))
}

pub async fn recall(
    State(state): State<AppState>,
    Json(query): Json<RecallQuery>,
) -> Result<Json<Value>, ApiError> {
    if query.query.trim().is_empty() {
        return Err(ApiError::bad_request("query must not be empty"));
    }
    let method = if state.store.has_embedder() {
        "hybrid"
    } else {
        "keyword"
    };
    let text = query.query.clone();
    let results = state.store.recall(query).await?;
    Ok(Json(json!({
        "query": text,
        "method": method,
        "results": results,
    })))
}

// ── Repair ───────────────────────────────────────────────────────────────────

pub async fn embedding_gaps(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let audit = state.store.audit_embeddings()?;
    Ok(Json(json!({
        "total": audit.total,
        "unembedded": audit.unembedded,
        "coverage": format!("{:.1}%", audit.coverage),
    })))
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ReEmbedRequest {
    #[serde(default)]
    pub batch_size: Option<usize>,
    #[serde(default)]
    pub dry_run: bool,
}

pub async fn re_embed(
    State(state): State<AppState>,
    Json(req): Json<ReEmbedRequest>,
) -> Result<Json<Value>, ApiError> {
    let batch = req.batch_size.unwrap_or(DEFAULT_BACKFILL_BATCH);
    let outcome = state.store.backfill_embeddings(batch, req.dry_run).await?;
    Ok(Json(json!({
        "action": if req.dry_run { "dry-run" } else { "re-embed" },
        "success": true,
        "affected": outcome.affected,
        "message": outcome.message,
    })))
}

// ── Hooks ────────────────────────────────────────────────────────────────────
//
// Hook endpoints degrade to empty, well-formed shapes. A harness must never
// block on this daemon being healthy.

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStartRequest {
    #[allow(dead_code)]
    pub harness: String,
    #[serde(default)]
    pub project: Option<String>,
}

pub async fn session_start(
    State(state): State<AppState>,
    Json(req): Json<SessionStartRequest>,
) -> Json<Value> {
    let query = req
        .project
        .clone()
        .unwrap_or_else(|| "current work context".to_string());
    let results = state
        .store
        .recall(RecallQuery {
            query,
            limit: Some(HOOK_RECALL_LIMIT),
            ..Default::default()
        })
        .await
        .unwrap_or_default();
    let memories: Vec<String> = results.iter().map(|r| r.content.clone()).collect();

    // profile-derived context first, then the memories that matched
    let mut inject = crate::distill::card::training_context(&state.store, &state.agent_name)
        .unwrap_or_default();
    let memory_block = format_inject(&memories);
    if !memory_block.is_empty() {
        inject.push('\n');
        inject.push_str(&memory_block);
    }

    Json(json!({
        "inject": inject,
        "memories": memories,
    }))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserPromptRequest {
    #[allow(dead_code)]
    pub harness: String,
    pub user_prompt: String,
}

pub async fn user_prompt_submit(
    State(state): State<AppState>,
    Json(req): Json<UserPromptRequest>,
) -> Json<Value> {
    let results = state
        .store
        .recall(RecallQuery {
            query: req.user_prompt,
            limit: Some(HOOK_RECALL_LIMIT),
            ..Default::default()
        })
        .await
        .unwrap_or_default();

    let memories: Vec<String> = results.iter().map(|r| r.content.clone()).collect();
    Json(json!({
        "inject": format_inject(&memories),
        "memoryCount": memories.len(),
    }))
}

fn format_inject(memories: &[String]) -> String {
    if memories.is_empty() {
        return String::new();
    }
    let lines: Vec<String> = memories.iter().map(|m| format!("- {m}")).collect();
    format!("# Relevant memories\n{}", lines.join("\n"))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionEndRequest {
    pub harness: String,
    #[serde(default)]
    pub transcript_path: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    #[allow(dead_code)]
    pub reason: Option<String>,
}

const SESSION_END_PROMPT: &str = "You read the tail of a coding session transcript and extract \
durable memories worth keeping: stated preferences, decisions, facts about the user's projects. \
Respond with a JSON array only. Each element: {\"content\": string, \"type\": one of \
\"explicit\"|\"fact\"|\"decision\"|\"preference\"|\"semantic\", \"tags\": [string]}. \
Return [] when nothing durable was said.";

pub async fn session_end(
    State(state): State<AppState>,
    Json(req): Json<SessionEndRequest>,
) -> Json<Value> {
    // spawned agents set SIGNET_NO_HOOKS=1 so their sessions never recurse
    // back into extraction
    if crate::config::hooks_suppressed() {
        return Json(json!({"memoriesSaved": 0}));
    }
    let Some(path) = req.transcript_path.as_deref() else {
        return Json(json!({"memoriesSaved": 0}));
    };
    let turns = read_transcript_tail(Path::new(path), TRANSCRIPT_TURN_CAP);
    if turns.is_empty() || !state.llm.check_health().await {
        return Json(json!({"memoriesSaved": 0}));
    }

    let prompt = llm::user_data_block(&llm::sanitize_with_limit(&turns.join("\n"), 8000));
    let raw = match state.llm.generate(SESSION_END_PROMPT, &prompt).await {
        Ok(raw) => raw,
        Err(e) => {
            logger::warn("hooks", &format!("session-end extraction failed: {e}"));
            return Json(json!({"memoriesSaved": 0}));
        }
    };

    let mut saved = 0usize;
    for item in llm::extract_json_array(&raw) {
        let Some(content) = item.get("content").and_then(|v| v.as_str()) else {
            continue;
        };
        let memory_type = item
            .get("type")
            .and_then(|v| v.as_str())
            .and_then(MemoryType::parse)
            .unwrap_or(MemoryType::Semantic);
        let tags = item
            .get("tags")
            .and_then(|v| v.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|t| t.as_str())
                    .map(|t| t.to_lowercase())
                    .collect()
            })
            .unwrap_or_default();
        let request = RememberRequest {
            content: content.to_string(),
            memory_type,
            tags,
            importance: 0.6,
            confidence: 0.7,
            pinned: false,
            who: None,
            source: Some(format!("session-end:{}", req.harness)),
        };
        match state.store.remember(request).await {
            Ok(_) => saved += 1,
            Err(e) => logger::warn("hooks", &format!("persisting session memory failed: {e}")),
        }
    }

    if let Some(session_id) = &req.session_id {
        let _ = state
            .store
            .state_set(&format!("session.lastEnd.{session_id}"), &Utc::now().to_rfc3339());
    }
    Json(json!({"memoriesSaved": saved}))
}

/// Last `cap` message texts from a Claude-style JSONL transcript. Unreadable
/// or foreign formats yield an empty list.
pub(super) fn read_transcript_tail(path: &Path, cap: usize) -> Vec<String> {
    let Ok(content) = std::fs::read_to_string(path) else {
        return Vec::new();
    };
    let mut turns = Vec::new();
    for line in content.lines() {
        let Ok(value) = serde_json::from_str::<Value>(line) else {
            continue;
        };
        let role = value["type"].as_str().or_else(|| value["role"].as_str());
        if !matches!(role, Some("user") | Some("assistant")) {
            continue;
        }
        let text = match &value["message"]["content"] {
            Value::String(s) => s.clone(),
            Value::Array(parts) => parts
                .iter()
                .filter_map(|p| p["text"].as_str())
                .collect::<Vec<_>>()
                .join(" "),
            _ => value["content"].as_str().unwrap_or("").to_string(),
        };
        if !text.trim().is_empty() {
            turns.push(format!("{}: {}", role.unwrap_or("user"), text.trim()));
        }
    }
    if turns.len() > cap {
        turns.drain(..turns.len() - cap);
    }
    turns
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompactionRequest {
    pub harness: String,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub summary: Option<String>,
}

pub async fn pre_compaction(
    State(state): State<AppState>,
    Json(req): Json<CompactionRequest>,
) -> Json<Value> {
    let session = req.session_id.as_deref().unwrap_or("unknown");
    let _ = state.store.state_set(
        &format!("compaction.pending.{session}"),
        &Utc::now().to_rfc3339(),
    );
    Json(json!({"ok": true, "acknowledged": session}))
}

pub async fn compaction_complete(
    State(state): State<AppState>,
    Json(req): Json<CompactionRequest>,
) -> Json<Value> {
    let mut saved = 0usize;
    if let Some(summary) = req.summary.as_deref().filter(|s| !s.trim().is_empty()) {
        let request = RememberRequest {
            content: summary.to_string(),
            memory_type: MemoryType::Semantic,
            tags: vec!["compaction-summary".into(), req.harness.to_lowercase()],
            importance: 0.5,
            confidence: 0.8,
            pinned: false,
            who: None,
            source: Some(format!("compaction:{}", req.harness)),
        };
        if state.store.remember(request).await.is_ok() {
            saved = 1;
        }
    }
    if let Some(session) = &req.session_id {
        let _ = state
            .store
            .state_set(&format!("compaction.pending.{session}"), "done");
    }
    Json(json!({"ok": true, "memoriesSaved": saved}))
}

// ── Logs ─────────────────────────────────────────────────────────────────────

#[derive(Deserialize, Default)]
pub struct LogsQuery {
    pub limit: Option<usize>,
    pub level: Option<String>,
    pub category: Option<String>,
}

pub async fn logs_tail(Query(params): Query<LogsQuery>) -> Json<Value> {
    let level = params.level.as_deref().and_then(LogLevel::parse);
    let entries = logger::tail(
        params.limit.unwrap_or(100),
        level,
        params.category.as_deref(),
    );
    Json(serde_json::to_value(entries).unwrap_or_else(|_| json!([])))
}

pub async fn logs_stream() -> Sse<impl tokio_stream::Stream<Item = Result<Event, Infallible>>> {
    let mut rx = logger::subscribe();
    let stream = async_stream::stream! {
        loop {
            match rx.recv().await {
                Ok(entry) => {
                    if let Ok(data) = serde_json::to_string(&entry) {
                        yield Ok(Event::default().data(data));
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    };
    Sse::new(stream).keep_alive(KeepAlive::default())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inject_block_is_empty_without_memories() {
        assert_eq!(format_inject(&[]), "");
        let block = format_inject(&["prefers rebase".to_string()]);
        assert!(block.starts_with("# Relevant memories"));
        assert!(block.contains("- prefers rebase"));
    }

    #[test]
    fn transcript_tail_reads_claude_jsonl() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("transcript.jsonl");
        let lines = [
            r#"{"type":"user","message":{"content":[{"type":"text","text":"please use rebase"}]}}"#,
            r#"{"type":"assistant","message":{"content":[{"type":"text","text":"done"}]}}"#,
            r#"{"type":"system","message":{"content":"ignored"}}"#,
            "not json at all",
        ]
        .join("\n");
        std::fs::write(&path, lines).unwrap();

        let turns = read_transcript_tail(&path, 50);
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[0], "user: please use rebase");
        assert_eq!(turns[1], "assistant: done");
    }

    #[test]
    fn transcript_tail_caps_turn_count() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("transcript.jsonl");
        let lines: Vec<String> = (0..10)
            .map(|i| format!(r#"{{"role":"user","content":"turn {i}"}}"#))
            .collect();
        std::fs::write(&path, lines.join("\n")).unwrap();

        let turns = read_transcript_tail(&path, 3);
        assert_eq!(turns.len(), 3);
        assert!(turns[0].contains("turn 7"));
    }

    #[test]
    fn transcript_tail_tolerates_missing_file() {
        assert!(read_transcript_tail(Path::new("/nonexistent/t.jsonl"), 10).is_empty());
    }
}
