use anyhow::Result;
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::process::Command;
use tokio::task::JoinHandle;

use super::{find_tool, Adapter, CaptureStore};
use crate::config::ScreenConfig;
use crate::logger;
use crate::models::{new_event_id, CaptureEvent, ScreenCapture};

pub const MAX_OCR_CHARS: usize = 10_000;
const TOOL_TIMEOUT: Duration = Duration::from_secs(30);

/// Jaccard similarity above which a capture of the same app+window counts as
/// a duplicate.
const DEDUP_SIMILARITY: f64 = 0.8;

#[derive(Default)]
struct DedupState {
    last_app: String,
    last_window: String,
    last_ocr: String,
    consecutive_same: u32,
}

pub struct ScreenAdapter {
    config: ScreenConfig,
    store: CaptureStore,
    dedup: Mutex<DedupState>,
    focus_tool: Mutex<Option<PathBuf>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ScreenAdapter {
    pub fn new(config: ScreenConfig) -> Self {
        Self {
            config,
            store: CaptureStore::new(),
            dedup: Mutex::new(DedupState::default()),
            focus_tool: Mutex::new(None),
            task: Mutex::new(None),
        }
    }

    async fn tick(&self) {
        let tool = self
            .focus_tool
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone();
        let Some(tool) = tool else { return };

        let Some((app, window)) = resolve_focus(&tool).await else {
            return;
        };

        if matches_any(&self.config.exclude_apps, &app)
            || matches_any(&self.config.exclude_windows, &window)
        {
            return;
        }

        let mut ocr_text = capture_ocr().await.unwrap_or_default();
        if ocr_text.chars().count() > MAX_OCR_CHARS {
            ocr_text = ocr_text.chars().take(MAX_OCR_CHARS).collect();
        }

        if self.is_duplicate(&app, &window, &ocr_text) {
            return;
        }

        self.store.push(CaptureEvent::Screen(ScreenCapture {
            id: new_event_id(),
            timestamp: Utc::now(),
            focused_app: app,
            focused_window: window,
            bundle_id: None,
            ocr_text,
        }));
    }

    /// Consecutive captures of the same app+window with near-identical OCR
    /// collapse into the first one. The counter tracks how long the window
    /// has been stable.
    fn is_duplicate(&self, app: &str, window: &str, ocr: &str) -> bool {
        let mut state = self.dedup.lock().unwrap_or_else(|p| p.into_inner());
        let same_surface = state.last_app == app && state.last_window == window;

        if same_surface {
            state.consecutive_same += 1;
            let similarity = jaccard(ocr, &state.last_ocr);
            if similarity > DEDUP_SIMILARITY {
                logger::debug(
                    "screen",
                    &format!(
                        "duplicate capture suppressed ({} consecutive on {window})",
                        state.consecutive_same
                    ),
                );
                return true;
            }
        } else {
            state.consecutive_same = 1;
        }

        state.last_app = app.to_string();
        state.last_window = window.to_string();
        state.last_ocr = ocr.to_string();
        false
    }
}

impl Adapter for ScreenAdapter {
    fn name(&self) -> &'static str {
        "screen"
    }

    fn enabled(&self) -> bool {
        self.config.enabled
    }

    fn start(self: Arc<Self>) -> Result<()> {
        let tool = discover_focus_tool()
            .ok_or_else(|| anyhow::anyhow!("no focused-window tool found (osascript/xdotool)"))?;
        *self.focus_tool.lock().unwrap_or_else(|p| p.into_inner()) = Some(tool);

        let interval = Duration::from_secs(self.config.interval_seconds.max(1));
        let adapter = Arc::clone(&self);
        let handle = tokio::spawn(async move {
            let mut timer = tokio::time::interval(interval);
            timer.tick().await;
            loop {
                timer.tick().await;
                adapter.tick().await;
            }
        });
        *self.task.lock().unwrap_or_else(|p| p.into_inner()) = Some(handle);
        Ok(())
    }

    fn stop(&self) {
        if let Some(handle) = self.task.lock().unwrap_or_else(|p| p.into_inner()).take() {
            handle.abort();
        }
    }

    fn captures_since(&self, since: DateTime<Utc>) -> Vec<CaptureEvent> {
        self.store.since(since)
    }

    fn count(&self) -> usize {
        self.store.len()
    }

    fn trim(&self, cutoff: DateTime<Utc>) -> usize {
        self.store.trim(cutoff)
    }

    fn retention_days(&self) -> u32 {
        self.config.retention_days
    }
}

fn matches_any(patterns: &[String], value: &str) -> bool {
    let lower = value.to_lowercase();
    patterns.iter().any(|p| lower.contains(&p.to_lowercase()))
}

/// Token-set Jaccard similarity, whitespace tokenization, case folded.
pub fn jaccard(a: &str, b: &str) -> f64 {
    let ta: HashSet<String> = a.split_whitespace().map(|t| t.to_lowercase()).collect();
    let tb: HashSet<String> = b.split_whitespace().map(|t| t.to_lowercase()).collect();
    if ta.is_empty() && tb.is_empty() {
        return 1.0;
    }
    let intersection = ta.intersection(&tb).count();
    let union = ta.union(&tb).count();
    intersection as f64 / union as f64
}

fn discover_focus_tool() -> Option<PathBuf> {
    if cfg!(target_os = "macos") {
        find_tool("osascript")
    } else {
        find_tool("xdotool")
    }
}

const FOCUS_SCRIPT: &str = r#"tell application "System Events"
    set frontApp to first application process whose frontmost is true
    set appName to name of frontApp
    try
        set winName to name of front window of frontApp
    on error
        set winName to ""
    end try
end tell
return appName & linefeed & winName"#;

async fn resolve_focus(tool: &PathBuf) -> Option<(String, String)> {
    let output = if cfg!(target_os = "macos") {
        run_tool(Command::new(tool).args(["-e", FOCUS_SCRIPT])).await?
    } else {
        let window = run_tool(Command::new(tool).args(["getactivewindow", "getwindowname"])).await?;
        let app = linux_active_app(tool).await.unwrap_or_default();
        format!("{app}\n{window}")
    };
    let mut lines = output.lines();
    let app = lines.next()?.trim().to_string();
    let window = lines.next().unwrap_or("").trim().to_string();
    if app.is_empty() {
        return None;
    }
    Some((app, window))
}

async fn linux_active_app(tool: &PathBuf) -> Option<String> {
    let pid = run_tool(Command::new(tool).args(["getactivewindow", "getwindowpid"])).await?;
    let comm = tokio::fs::read_to_string(format!("/proc/{}/comm", pid.trim()))
        .await
        .ok()?;
    Some(comm.trim().to_string())
}

/// Best-effort OCR of the current screen. Needs a screenshot tool plus
/// tesseract; without them the capture carries window metadata only.
async fn capture_ocr() -> Option<String> {
    let tesseract = find_tool("tesseract")?;
    let shot = std::env::temp_dir().join(format!("signet-screen-{}.png", std::process::id()));

    let captured = if cfg!(target_os = "macos") {
        let tool = find_tool("screencapture")?;
        run_tool(Command::new(&tool).args(["-x", shot.to_str()?])).await.is_some()
    } else if let Some(tool) = find_tool("grim") {
        run_tool(Command::new(&tool).arg(shot.to_str()?)).await.is_some()
    } else {
        let tool = find_tool("import")?;
        run_tool(Command::new(&tool).args(["-window", "root", shot.to_str()?]))
            .await
            .is_some()
    };
    if !captured {
        return None;
    }

    let text = run_tool(Command::new(&tesseract).args([shot.to_str()?, "stdout"])).await;
    if let Err(e) = std::fs::remove_file(&shot) {
        logger::debug("screen", &format!("temp screenshot cleanup failed: {e}"));
    }
    text
}

async fn run_tool(cmd: &mut Command) -> Option<String> {
    let out = tokio::time::timeout(TOOL_TIMEOUT, cmd.output()).await.ok()?.ok()?;
    if out.status.success() {
        Some(String::from_utf8_lossy(&out.stdout).trim().to_string())
    } else {
        None
    }
}
