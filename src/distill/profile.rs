use anyhow::{Context, Result};
use chrono::{DateTime, Duration as ChronoDuration, Timelike, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

use crate::capture::CaptureManager;
use crate::llm::{self, LlmClient};
use crate::logger;
use crate::models::{MemoryType, ScreenCapture, TerminalCapture};
use crate::store::{MemoryStore, RememberRequest};

pub const PROFILE_TAG: &str = "cognitive-profile";
const PROFILE_MEMORY_LIMIT: usize = 500;
const SESSION_GAP_MINUTES: i64 = 30;

const PROFILE_TYPES: &[MemoryType] = &[
    MemoryType::Skill,
    MemoryType::Decision,
    MemoryType::Procedural,
    MemoryType::Preference,
    MemoryType::Fact,
    MemoryType::Pattern,
];

// Enum domains with their fallbacks. Anything the model invents collapses to
// the fallback.
const APPROACHES: &[&str] = &["systematic", "intuitive", "experimental", "collaborative"];
const APPROACH_FALLBACK: &str = "systematic";
const DEBUG_STYLES: &[&str] = &["print-debugging", "debugger", "test-driven", "rubber-duck"];
const DEBUG_FALLBACK: &str = "print-debugging";
const PLANNING_STYLES: &[&str] = &["detailed", "outline", "exploratory"];
const PLANNING_FALLBACK: &str = "outline";
const LEARNING_STYLES: &[&str] = &["hands-on", "reading", "video", "documentation"];
const LEARNING_FALLBACK: &str = "hands-on";
const COMM_STYLES: &[&str] = &["concise", "detailed", "visual"];
const COMM_FALLBACK: &str = "concise";

const EDITOR_KEYWORDS: &[&str] = &[
    "code", "vscode", "cursor", "vim", "neovim", "emacs", "zed", "intellij", "sublime", "xcode",
];
const TERMINAL_KEYWORDS: &[&str] = &[
    "terminal", "iterm", "alacritty", "kitty", "wezterm", "warp", "ghostty",
];

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct CognitiveProfile {
    pub problem_solving: ProblemSolving,
    pub work_patterns: WorkPatterns,
    pub preferences: Preferences,
    #[serde(default)]
    pub strengths: Vec<String>,
    #[serde(default)]
    pub growth_areas: Vec<String>,
    pub confidence_score: f64,
    pub last_updated: String,
    pub memory_count: i64,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct ProblemSolving {
    pub approach: String,
    pub debugging_style: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct WorkPatterns {
    pub peak_hours: Vec<u32>,
    pub avg_session_minutes: f64,
    pub context_switch_frequency: String,
    pub break_frequency: String,
    #[serde(default)]
    pub most_used_apps: Vec<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct Preferences {
    pub editor: String,
    pub terminal: String,
    pub planning_style: String,
    pub learning_style: String,
    pub communication_style: String,
}

// ── Deterministic working style ──────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct WorkingStyle {
    pub peak_hours: Vec<u32>,
    pub avg_session_minutes: f64,
    pub context_switch_frequency: String,
    pub break_frequency: String,
    pub most_used_apps: Vec<String>,
}

/// Compute work rhythm from raw capture timestamps. No model involved; this
/// overlays whatever the LLM says about work patterns.
pub fn compute_working_style(screen: &[ScreenCapture], terminal: &[TerminalCapture]) -> WorkingStyle {
    let mut stamps: Vec<DateTime<Utc>> = screen
        .iter()
        .map(|c| c.timestamp)
        .chain(terminal.iter().map(|c| c.timestamp))
        .collect();
    stamps.sort();

    if stamps.is_empty() {
        return WorkingStyle::default();
    }

    // peak hours: above 0.7 × mean of active hours, strongest eight
    let mut by_hour: HashMap<u32, usize> = HashMap::new();
    for stamp in &stamps {
        *by_hour.entry(stamp.hour()).or_insert(0) += 1;
    }
    let mean = by_hour.values().sum::<usize>() as f64 / by_hour.len() as f64;
    let mut peaks: Vec<(u32, usize)> = by_hour
        .iter()
        .filter(|(_, count)| **count as f64 > 0.7 * mean)
        .map(|(h, c)| (*h, *c))
        .collect();
    peaks.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
    let mut peak_hours: Vec<u32> = peaks.into_iter().take(8).map(|(h, _)| h).collect();
    peak_hours.sort();

    // sessions: 30-minute gaps split the stream
    let mut sessions: Vec<(DateTime<Utc>, DateTime<Utc>)> = Vec::new();
    let mut start = stamps[0];
    let mut prev = stamps[0];
    for stamp in stamps.iter().skip(1) {
        if *stamp - prev > ChronoDuration::minutes(SESSION_GAP_MINUTES) {
            sessions.push((start, prev));
            start = *stamp;
        }
        prev = *stamp;
    }
    sessions.push((start, prev));
    let avg_session_minutes = sessions
        .iter()
        .map(|(s, e)| (*e - *s).num_minutes() as f64)
        .sum::<f64>()
        / sessions.len() as f64;

    // context switches: focused app changes per active hour
    let switches = screen
        .windows(2)
        .filter(|pair| pair[0].focused_app != pair[1].focused_app)
        .count();
    let active_hours = (sessions
        .iter()
        .map(|(s, e)| (*e - *s).num_minutes())
        .sum::<i64>() as f64
        / 60.0)
        .max(1.0 / 60.0);
    let switch_rate = switches as f64 / active_hours;
    let context_switch_frequency = if switch_rate < 5.0 {
        "low"
    } else if switch_rate < 15.0 {
        "moderate"
    } else {
        "high"
    }
    .to_string();

    // breaks: 10 to 120 minute gaps; rate plus variability decides the label
    let gaps: Vec<f64> = stamps
        .windows(2)
        .map(|pair| (pair[1] - pair[0]).num_minutes() as f64)
        .filter(|m| (10.0..=120.0).contains(m))
        .collect();
    let span_hours = ((prev - stamps[0]).num_minutes() as f64 / 60.0).max(1.0 / 60.0);
    let break_rate = gaps.len() as f64 / span_hours;
    let cv = coefficient_of_variation(&gaps);
    let break_frequency = if gaps.is_empty() || break_rate < 0.2 {
        "rare"
    } else if break_rate < 1.0 && cv < 1.0 {
        "regular"
    } else {
        "frequent"
    }
    .to_string();

    let mut app_counts: HashMap<&str, usize> = HashMap::new();
    for capture in screen {
        *app_counts.entry(capture.focused_app.as_str()).or_insert(0) += 1;
    }
    let mut apps: Vec<(&str, usize)> = app_counts.into_iter().collect();
    apps.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(b.0)));
    let most_used_apps = apps.into_iter().take(5).map(|(a, _)| a.to_string()).collect();

    WorkingStyle {
        peak_hours,
        avg_session_minutes,
        context_switch_frequency,
        break_frequency,
        most_used_apps,
    }
}

fn coefficient_of_variation(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let mean = values.iter().sum::<f64>() / values.len() as f64;
    if mean == 0.0 {
        return 0.0;
    }
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / values.len() as f64;
    variance.sqrt() / mean
}

// ── LLM synthesis ────────────────────────────────────────────────────────────

const PROFILE_SYSTEM_PROMPT: &str = "You synthesize a developer's cognitive profile from their \
accumulated memories and observed work rhythm. Respond with a single JSON object only: \
{\"problemSolving\": {\"approach\": \"systematic\"|\"intuitive\"|\"experimental\"|\"collaborative\", \
\"debuggingStyle\": \"print-debugging\"|\"debugger\"|\"test-driven\"|\"rubber-duck\"}, \
\"preferences\": {\"editor\": string, \"terminal\": string, \
\"planningStyle\": \"detailed\"|\"outline\"|\"exploratory\", \
\"learningStyle\": \"hands-on\"|\"reading\"|\"video\"|\"documentation\", \
\"communicationStyle\": \"concise\"|\"detailed\"|\"visual\"}, \
\"strengths\": [string], \"growthAreas\": [string], \"confidenceScore\": number 0-1}. \
Use \"unknown\" for editor or terminal you cannot infer. Base every field on the evidence; \
when updating an existing profile, only change fields the new evidence supports.";

fn validate_enum(value: Option<&str>, allowed: &[&str], fallback: &str) -> String {
    match value {
        Some(v) if allowed.contains(&v) => v.to_string(),
        _ => fallback.to_string(),
    }
}

fn detect_by_keywords(apps: &[String], keywords: &[&str]) -> Option<String> {
    apps.iter()
        .find(|app| {
            let lower = app.to_lowercase();
            keywords.iter().any(|k| lower.contains(k))
        })
        .cloned()
}

/// Validate a raw model response into a profile, overlaying the
/// deterministic working style and falling back per field.
pub fn parse_profile(
    raw: &Value,
    working: &WorkingStyle,
    memory_count: i64,
    prior: Option<&CognitiveProfile>,
) -> CognitiveProfile {
    let approach = validate_enum(
        raw.pointer("/problemSolving/approach").and_then(|v| v.as_str()),
        APPROACHES,
        APPROACH_FALLBACK,
    );
    let debugging_style = validate_enum(
        raw.pointer("/problemSolving/debuggingStyle").and_then(|v| v.as_str()),
        DEBUG_STYLES,
        DEBUG_FALLBACK,
    );
    let planning_style = validate_enum(
        raw.pointer("/preferences/planningStyle").and_then(|v| v.as_str()),
        PLANNING_STYLES,
        PLANNING_FALLBACK,
    );
    let learning_style = validate_enum(
        raw.pointer("/preferences/learningStyle").and_then(|v| v.as_str()),
        LEARNING_STYLES,
        LEARNING_FALLBACK,
    );
    let communication_style = validate_enum(
        raw.pointer("/preferences/communicationStyle").and_then(|v| v.as_str()),
        COMM_STYLES,
        COMM_FALLBACK,
    );

    let mut editor = raw
        .pointer("/preferences/editor")
        .and_then(|v| v.as_str())
        .unwrap_or("unknown")
        .to_string();
    if editor == "unknown" {
        if let Some(found) = detect_by_keywords(&working.most_used_apps, EDITOR_KEYWORDS) {
            editor = found;
        }
    }
    let mut terminal = raw
        .pointer("/preferences/terminal")
        .and_then(|v| v.as_str())
        .unwrap_or("unknown")
        .to_string();
    if terminal == "unknown" {
        if let Some(found) = detect_by_keywords(&working.most_used_apps, TERMINAL_KEYWORDS) {
            terminal = found;
        }
    }

    let string_list = |key: &str| -> Vec<String> {
        raw.get(key)
            .and_then(|v| v.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|s| s.as_str())
                    .map(|s| s.to_string())
                    .collect()
            })
            .unwrap_or_default()
    };

    let confidence_score = raw
        .get("confidenceScore")
        .and_then(|v| v.as_f64())
        .filter(|v| (0.0..=1.0).contains(v))
        .or(prior.map(|p| p.confidence_score))
        .unwrap_or(0.5);

    CognitiveProfile {
        problem_solving: ProblemSolving {
            approach,
            debugging_style,
        },
        work_patterns: WorkPatterns {
            peak_hours: working.peak_hours.clone(),
            avg_session_minutes: working.avg_session_minutes,
            context_switch_frequency: working.context_switch_frequency.clone(),
            break_frequency: working.break_frequency.clone(),
            most_used_apps: working.most_used_apps.clone(),
        },
        preferences: Preferences {
            editor,
            terminal,
            planning_style,
            learning_style,
            communication_style,
        },
        strengths: string_list("strengths"),
        growth_areas: string_list("growthAreas"),
        confidence_score,
        last_updated: Utc::now().to_rfc3339(),
        memory_count,
    }
}

fn format_memories_by_type(memories: &[crate::models::MemoryRecord]) -> String {
    let mut grouped: HashMap<&str, Vec<&str>> = HashMap::new();
    for memory in memories {
        grouped
            .entry(memory.memory_type.as_str())
            .or_default()
            .push(memory.content.as_str());
    }
    let mut sections = Vec::new();
    let mut kinds: Vec<&&str> = grouped.keys().collect();
    kinds.sort();
    for kind in kinds {
        let lines: Vec<String> = grouped[*kind]
            .iter()
            .map(|c| format!("- {}", llm::sanitize_with_limit(c, 300)))
            .collect();
        sections.push(format!("### {kind}\n{}", lines.join("\n")));
    }
    sections.join("\n\n")
}

fn format_working_style(working: &WorkingStyle) -> String {
    format!(
        "Observed rhythm: peak hours {:?}, average session {:.0} minutes, \
         context switching {}, breaks {}, most used apps {:?}.",
        working.peak_hours,
        working.avg_session_minutes,
        working.context_switch_frequency,
        working.break_frequency,
        working.most_used_apps
    )
}

/// Build or incrementally update the cognitive profile. Returns whether a
/// profile was written.
pub async fn update_profile(
    store: &MemoryStore,
    manager: &Arc<CaptureManager>,
    llm_client: &LlmClient,
) -> Result<bool> {
    let existing_memory = store.find_system_memory_tagged(PROFILE_TAG)?;
    let prior: Option<CognitiveProfile> = existing_memory
        .as_ref()
        .and_then(|m| serde_json::from_str(&m.content).ok());

    let since = prior.as_ref().map(|p| p.last_updated.clone());
    let memories = store.memories_by_types(PROFILE_TYPES, since.as_deref(), PROFILE_MEMORY_LIMIT)?;
    if memories.is_empty() && prior.is_some() {
        logger::debug("distill", "no new memories since last profile update");
        return Ok(false);
    }

    let bundle = manager.bundle_since(Utc::now() - ChronoDuration::days(30));
    let working = compute_working_style(&bundle.screen, &bundle.terminal);

    if !llm_client.check_health().await {
        logger::warn("distill", "profile update skipped: inference endpoint unavailable");
        return Ok(false);
    }

    let mut prompt = String::new();
    if let Some(p) = &prior {
        prompt.push_str("## Existing profile\n");
        prompt.push_str(&serde_json::to_string(p).unwrap_or_default());
        prompt.push_str("\n\n");
    }
    prompt.push_str("## Memories\n");
    prompt.push_str(&format_memories_by_type(&memories));
    prompt.push_str("\n\n");
    prompt.push_str(&format_working_style(&working));

    let raw = llm_client
        .generate(PROFILE_SYSTEM_PROMPT, &prompt)
        .await
        .context("profile synthesis call")?;
    let Some(parsed) = llm::extract_json_object(&raw) else {
        logger::warn("distill", "profile response was not a JSON object");
        return Ok(false);
    };

    let total = store.count_memories()?;
    let profile = parse_profile(&parsed, &working, total, prior.as_ref());
    let content = serde_json::to_string(&profile).context("serializing profile")?;

    match existing_memory {
        Some(memory) => {
            store.update_memory_content(&memory.id, &content, &memory.tags)?;
        }
        None => {
            store
                .remember(RememberRequest {
                    content,
                    memory_type: MemoryType::System,
                    tags: vec![PROFILE_TAG.to_string()],
                    importance: 0.9,
                    confidence: profile.confidence_score,
                    pinned: true,
                    who: None,
                    source: Some("distillation".into()),
                })
                .await?;
        }
    }
    Ok(true)
}
