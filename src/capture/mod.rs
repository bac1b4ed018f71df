pub mod comms;
pub mod files;
pub mod screen;
pub mod terminal;
pub mod voice;

use anyhow::Result;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;

use crate::logger;
use crate::models::{CaptureBundle, CaptureEvent};

/// Per-adapter FIFO cap. Oldest events drop first on overflow.
pub const STORE_CAP: usize = 10_000;

const CLEANUP_INTERVAL_SECS: u64 = 3600;

/// The capability contract every capture adapter implements.
pub trait Adapter: Send + Sync {
    fn name(&self) -> &'static str;
    fn enabled(&self) -> bool;
    /// Spawn the adapter's background tasks. An error here disables the
    /// adapter; the daemon keeps running.
    fn start(self: Arc<Self>) -> Result<()>;
    fn stop(&self);
    fn captures_since(&self, since: DateTime<Utc>) -> Vec<CaptureEvent>;
    fn count(&self) -> usize;
    fn trim(&self, cutoff: DateTime<Utc>) -> usize;
    fn retention_days(&self) -> u32;
}

/// Bounded, time-ordered in-memory event store. Single writer (the owning
/// adapter), concurrent readers (scheduler, HTTP surface).
pub struct CaptureStore {
    events: Mutex<VecDeque<CaptureEvent>>,
}

impl Default for CaptureStore {
    fn default() -> Self {
        Self::new()
    }
}

impl CaptureStore {
    pub fn new() -> Self {
        Self {
            events: Mutex::new(VecDeque::new()),
        }
    }

    /// Insert an event, keeping timestamps non-decreasing. Equal timestamps
    /// keep insertion order. Head-drops when the FIFO cap is hit.
    pub fn push(&self, event: CaptureEvent) {
        let mut events = self.events.lock().unwrap_or_else(|p| p.into_inner());
        let ts = event.timestamp();
        let mut idx = events.len();
        while idx > 0 && events[idx - 1].timestamp() > ts {
            idx -= 1;
        }
        if idx == events.len() {
            events.push_back(event);
        } else {
            events.insert(idx, event);
        }
        while events.len() > STORE_CAP {
            events.pop_front();
        }
    }

    pub fn since(&self, since: DateTime<Utc>) -> Vec<CaptureEvent> {
        let events = self.events.lock().unwrap_or_else(|p| p.into_inner());
        events
            .iter()
            .filter(|e| e.timestamp() >= since)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.events.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop everything older than `cutoff`; returns how many went.
    pub fn trim(&self, cutoff: DateTime<Utc>) -> usize {
        let mut events = self.events.lock().unwrap_or_else(|p| p.into_inner());
        let before = events.len();
        while events.front().is_some_and(|e| e.timestamp() < cutoff) {
            events.pop_front();
        }
        before - events.len()
    }
}

/// Resolve an external CLI tool: `which`, then well-known absolute paths.
pub fn find_tool(name: &str) -> Option<PathBuf> {
    if let Ok(out) = std::process::Command::new("which")
        .arg(name)
        .stderr(std::process::Stdio::null())
        .output()
    {
        if out.status.success() {
            let path = String::from_utf8_lossy(&out.stdout).trim().to_string();
            if !path.is_empty() {
                return Some(PathBuf::from(path));
            }
        }
    }
    for dir in ["/usr/local/bin", "/opt/homebrew/bin", "/usr/bin", "/bin"] {
        let candidate = PathBuf::from(dir).join(name);
        if candidate.exists() {
            return Some(candidate);
        }
    }
    None
}

/// Owns the adapter set: starts the enabled ones, runs the hourly retention
/// cleanup, and assembles bundles for the scheduler.
pub struct CaptureManager {
    adapters: Vec<Arc<dyn Adapter>>,
    disabled: Mutex<Vec<&'static str>>,
    cleanup: Mutex<Option<JoinHandle<()>>>,
}

impl CaptureManager {
    pub fn new(adapters: Vec<Arc<dyn Adapter>>) -> Self {
        Self {
            adapters,
            disabled: Mutex::new(Vec::new()),
            cleanup: Mutex::new(None),
        }
    }

    pub fn start(self: &Arc<Self>) {
        for adapter in &self.adapters {
            if !adapter.enabled() {
                continue;
            }
            let name = adapter.name();
            match Arc::clone(adapter).start() {
                Ok(()) => logger::info("capture", &format!("{name} adapter started")),
                Err(e) => {
                    logger::warn_with(
                        "capture",
                        &format!("{name} adapter failed to start, disabling"),
                        serde_json::json!({"error": e.to_string()}),
                    );
                    self.disabled
                        .lock()
                        .unwrap_or_else(|p| p.into_inner())
                        .push(name);
                }
            }
        }

        let manager = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(std::time::Duration::from_secs(CLEANUP_INTERVAL_SECS));
            interval.tick().await; // immediate first tick consumed
            loop {
                interval.tick().await;
                manager.run_cleanup();
            }
        });
        *self.cleanup.lock().unwrap_or_else(|p| p.into_inner()) = Some(handle);
    }

    pub fn stop(&self) {
        if let Some(handle) = self
            .cleanup
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take()
        {
            handle.abort();
        }
        for adapter in &self.adapters {
            adapter.stop();
        }
    }

    fn run_cleanup(&self) {
        let now = Utc::now();
        for adapter in &self.adapters {
            let cutoff = now - ChronoDuration::hours(i64::from(adapter.retention_days()) * 24);
            let removed = adapter.trim(cutoff);
            if removed > 0 {
                logger::info_with(
                    "capture",
                    "retention cleanup",
                    serde_json::json!({"adapter": adapter.name(), "removed": removed}),
                );
            }
        }
    }

    /// Snapshot view across all adapters, filtered by `timestamp >= since`.
    pub fn bundle_since(&self, since: DateTime<Utc>) -> CaptureBundle {
        let mut bundle = CaptureBundle {
            since: Some(since),
            until: Some(Utc::now()),
            ..Default::default()
        };
        for adapter in &self.adapters {
            for event in adapter.captures_since(since) {
                bundle.push(event);
            }
        }
        bundle
    }

    pub fn counts(&self) -> Vec<(&'static str, usize)> {
        self.adapters.iter().map(|a| (a.name(), a.count())).collect()
    }

    pub fn disabled_adapters(&self) -> Vec<&'static str> {
        self.disabled
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Shell, TerminalCapture};
    use chrono::Duration as ChronoDuration;

    fn terminal_event(cmd: &str, ts: DateTime<Utc>) -> CaptureEvent {
        CaptureEvent::Terminal(TerminalCapture {
            id: crate::models::new_event_id(),
            timestamp: ts,
            command: cmd.into(),
            working_directory: "~".into(),
            shell: Shell::Zsh,
        })
    }

    #[test]
    fn store_enforces_fifo_cap() {
        let store = CaptureStore::new();
        let base = Utc::now();
        for i in 0..(STORE_CAP + 50) {
            store.push(terminal_event(
                &format!("cmd{i}"),
                base + ChronoDuration::seconds(i as i64),
            ));
        }
        assert_eq!(store.len(), STORE_CAP);
        // oldest events dropped from the head
        let all = store.since(base);
        assert_eq!(all.first().unwrap().timestamp(), base + ChronoDuration::seconds(50));
    }

    #[test]
    fn store_keeps_timestamps_non_decreasing() {
        let store = CaptureStore::new();
        let base = Utc::now();
        store.push(terminal_event("b", base + ChronoDuration::seconds(10)));
        store.push(terminal_event("a", base));
        store.push(terminal_event("c", base + ChronoDuration::seconds(5)));

        let all = store.since(base - ChronoDuration::seconds(1));
        let stamps: Vec<_> = all.iter().map(|e| e.timestamp()).collect();
        let mut sorted = stamps.clone();
        sorted.sort();
        assert_eq!(stamps, sorted);
    }

    #[test]
    fn trim_is_time_bounded_and_counts_removed() {
        let store = CaptureStore::new();
        let base = Utc::now();
        for i in 0..10 {
            store.push(terminal_event(
                &format!("cmd{i}"),
                base + ChronoDuration::seconds(i),
            ));
        }
        let cutoff = base + ChronoDuration::seconds(4);
        let removed = store.trim(cutoff);
        assert_eq!(removed, 4);
        assert_eq!(store.len(), 6);
        for e in store.since(base) {
            assert!(e.timestamp() >= cutoff);
        }
    }

    #[test]
    fn since_filters_inclusive() {
        let store = CaptureStore::new();
        let base = Utc::now();
        store.push(terminal_event("old", base - ChronoDuration::seconds(60)));
        store.push(terminal_event("new", base));
        let recent = store.since(base);
        assert_eq!(recent.len(), 1);
        assert!(!recent[0].id().is_empty());
    }

    #[test]
    fn find_tool_resolves_common_binaries() {
        // `sh` exists on any unix box this runs on
        assert!(find_tool("sh").is_some());
        assert!(find_tool("definitely-not-a-real-tool-xyz").is_none());
    }
}
