pub mod context;
pub mod decision;
pub mod pattern;
pub mod project;
pub mod skill;
pub mod workflow;

use serde_json::Value;

use crate::llm::{self, LlmClient};
use crate::logger;
use crate::models::{CaptureBundle, ExtractedMemory};

/// An LLM-driven extractor over a capture bundle. Implementations declare
/// data thresholds and prompt shape; the LLM call, sanitization and JSON
/// cleanup live in shared helpers, not a base class.
pub trait Refiner: Send + Sync {
    fn name(&self) -> &'static str;
    fn cooldown_minutes(&self) -> i64;
    fn system_prompt(&self) -> &'static str;
    fn has_enough_data(&self, bundle: &CaptureBundle) -> bool;
    fn format_context(&self, bundle: &CaptureBundle) -> String;
    fn parse_response(&self, raw: &str) -> Vec<ExtractedMemory>;
}

/// The full refiner set, in scheduling order.
pub fn all() -> Vec<Box<dyn Refiner>> {
    vec![
        Box::new(skill::SkillRefiner),
        Box::new(project::ProjectRefiner),
        Box::new(decision::DecisionRefiner),
        Box::new(workflow::WorkflowRefiner),
        Box::new(context::ContextRefiner),
        Box::new(pattern::PatternRefiner),
    ]
}

/// Run one refiner over a bundle: health-check the endpoint, call the model,
/// parse. Unreachable or misbehaving LLMs yield an empty result, never an
/// error.
pub async fn refine(refiner: &dyn Refiner, bundle: &CaptureBundle, llm: &LlmClient) -> Vec<ExtractedMemory> {
    if !refiner.has_enough_data(bundle) {
        return Vec::new();
    }
    if !llm.check_health().await {
        logger::warn(
            "refiner",
            &format!("{} skipped: inference endpoint unavailable", refiner.name()),
        );
        return Vec::new();
    }

    let prompt = refiner.format_context(bundle);
    match llm.generate(refiner.system_prompt(), &prompt).await {
        Ok(raw) => refiner.parse_response(&raw),
        Err(e) => {
            logger::warn("refiner", &format!("{} call failed: {e}", refiner.name()));
            Vec::new()
        }
    }
}

// ── Shared context formatting ────────────────────────────────────────────────
//
// Every user-derived line passes through the sanitizer before it reaches a
// prompt, and each section is wrapped in explicit user-data delimiters.

const SECTION_ITEM_CAP: usize = 30;

pub(crate) fn screen_section(bundle: &CaptureBundle) -> String {
    if bundle.screen.is_empty() {
        return String::new();
    }
    let lines: Vec<String> = bundle
        .screen
        .iter()
        .rev()
        .take(SECTION_ITEM_CAP)
        .map(|c| {
            let ocr = llm::sanitize_with_limit(&c.ocr_text, 300);
            format!(
                "[{}] {} / {}: {}",
                c.timestamp.format("%H:%M"),
                llm::sanitize_with_limit(&c.focused_app, 100),
                llm::sanitize_with_limit(&c.focused_window, 200),
                ocr
            )
        })
        .collect();
    format!(
        "## Screen activity\n{}\n",
        llm::user_data_block(&lines.join("\n"))
    )
}

pub(crate) fn terminal_section(bundle: &CaptureBundle) -> String {
    if bundle.terminal.is_empty() {
        return String::new();
    }
    let lines: Vec<String> = bundle
        .terminal
        .iter()
        .rev()
        .take(SECTION_ITEM_CAP)
        .map(|c| {
            format!(
                "[{}] $ {}",
                c.timestamp.format("%H:%M"),
                llm::sanitize_with_limit(&c.command, 300)
            )
        })
        .collect();
    format!(
        "## Terminal commands\n{}\n",
        llm::user_data_block(&lines.join("\n"))
    )
}

pub(crate) fn files_section(bundle: &CaptureBundle) -> String {
    if bundle.files.is_empty() {
        return String::new();
    }
    let lines: Vec<String> = bundle
        .files
        .iter()
        .rev()
        .take(SECTION_ITEM_CAP)
        .map(|c| {
            let branch = c
                .git_branch
                .as_deref()
                .map(|b| format!(" ({b})"))
                .unwrap_or_default();
            format!(
                "[{}] {:?} {}{branch}",
                c.timestamp.format("%H:%M"),
                c.event_type,
                llm::anonymize_path(&c.file_path)
            )
        })
        .collect();
    format!(
        "## File activity\n{}\n",
        llm::user_data_block(&lines.join("\n"))
    )
}

pub(crate) fn comms_section(bundle: &CaptureBundle) -> String {
    if bundle.comms.is_empty() {
        return String::new();
    }
    let lines: Vec<String> = bundle
        .comms
        .iter()
        .rev()
        .take(SECTION_ITEM_CAP)
        .map(|c| {
            format!(
                "[{}] {} @ {}: {}",
                c.timestamp.format("%H:%M"),
                llm::sanitize_with_limit(&c.metadata.repo, 100),
                llm::sanitize_with_limit(&c.metadata.branch, 100),
                llm::sanitize_with_limit(&c.content, 300)
            )
        })
        .collect();
    format!(
        "## Recent commits\n{}\n",
        llm::user_data_block(&lines.join("\n"))
    )
}

pub(crate) fn voice_section(bundle: &CaptureBundle) -> String {
    if bundle.voice.is_empty() {
        return String::new();
    }
    let lines: Vec<String> = bundle
        .voice
        .iter()
        .rev()
        .take(SECTION_ITEM_CAP)
        .map(|c| {
            format!(
                "[{}] ({:.0}% confident) {}",
                c.timestamp.format("%H:%M"),
                c.confidence * 100.0,
                llm::sanitize_with_limit(&c.transcript, 500)
            )
        })
        .collect();
    format!(
        "## Spoken context\n{}\n",
        llm::user_data_block(&lines.join("\n"))
    )
}

// ── Shared response field readers ────────────────────────────────────────────

pub(crate) fn read_string(item: &Value, key: &str) -> Option<String> {
    item.get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

pub(crate) fn read_f64(item: &Value, key: &str, default: f64) -> f64 {
    item.get(key)
        .and_then(|v| v.as_f64())
        .unwrap_or(default)
        .clamp(0.0, 1.0)
}

pub(crate) fn read_tags(item: &Value) -> Vec<String> {
    item.get("tags")
        .and_then(|v| v.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|t| t.as_str())
                .map(|t| t.trim().to_lowercase())
                .filter(|t| !t.is_empty())
                .collect()
        })
        .unwrap_or_default()
}
