use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use notify::{EventKind, RecursiveMode, Watcher};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;

use super::{Adapter, CaptureStore};
use crate::config::{expand_tilde, FilesConfig};
use crate::logger;
use crate::models::{new_event_id, CaptureEvent, FileActivity, FileEventKind};

/// A path must sit unchanged this long before its event is emitted.
const STABILITY_THRESHOLD: Duration = Duration::from_millis(500);
const DEBOUNCE_POLL: Duration = Duration::from_millis(100);

/// Noise that is never worth watching, independent of user config.
const ALWAYS_EXCLUDED: &[&str] = &[
    "node_modules",
    ".git/objects",
    ".git/refs",
    ".git/logs",
    "dist",
    "*.lock",
    "__pycache__",
    ".DS_Store",
    "*.swp",
    "*.swo",
    "*~",
];

pub struct FilesAdapter {
    config: FilesConfig,
    store: CaptureStore,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    watcher: Mutex<Option<notify::RecommendedWatcher>>,
}

impl FilesAdapter {
    pub fn new(config: FilesConfig) -> Self {
        Self {
            config,
            store: CaptureStore::new(),
            tasks: Mutex::new(Vec::new()),
            watcher: Mutex::new(None),
        }
    }

    fn should_ignore(&self, path: &str) -> bool {
        ALWAYS_EXCLUDED.iter().any(|p| pattern_matches(p, path))
            || self
                .config
                .exclude_patterns
                .iter()
                .any(|p| pattern_matches(p, path))
    }

    async fn emit(&self, path: PathBuf, kind: FileEventKind) {
        let path_str = path.to_string_lossy().into_owned();
        if self.should_ignore(&path_str) {
            return;
        }

        let size_bytes = match kind {
            FileEventKind::Delete => None,
            _ => tokio::fs::metadata(&path).await.ok().map(|m| m.len()),
        };
        let file_type = path
            .extension()
            .map(|e| e.to_string_lossy().into_owned())
            .unwrap_or_default();

        let dir = path.parent().unwrap_or(Path::new(".")).to_path_buf();
        let git_branch = crate::git::branch_in(&dir).await;
        // detached HEAD is still a repo
        let is_git_repo = git_branch.is_some() || crate::git::is_repo(&dir).await;

        self.store.push(CaptureEvent::FileActivity(FileActivity {
            id: new_event_id(),
            timestamp: Utc::now(),
            event_type: kind,
            file_path: path_str,
            file_type,
            is_git_repo,
            git_branch,
            size_bytes,
        }));
    }
}

impl Adapter for FilesAdapter {
    fn name(&self) -> &'static str {
        "files"
    }

    fn enabled(&self) -> bool {
        self.config.enabled
    }

    fn start(self: Arc<Self>) -> Result<()> {
        let roots: Vec<PathBuf> = self
            .config
            .watch_directories
            .iter()
            .map(|d| PathBuf::from(expand_tilde(d)))
            .filter(|p| p.is_dir())
            .collect();
        if roots.is_empty() {
            anyhow::bail!("no watchable directories configured");
        }

        let (tx, mut rx) = tokio::sync::mpsc::channel::<(PathBuf, FileEventKind)>(256);

        let mut watcher = notify::recommended_watcher(move |res: Result<notify::Event, _>| {
            let Ok(event) = res else { return };
            let kind = match event.kind {
                EventKind::Create(_) => FileEventKind::Create,
                EventKind::Modify(_) => FileEventKind::Modify,
                EventKind::Remove(_) => FileEventKind::Delete,
                _ => return,
            };
            for path in event.paths {
                let _ = tx.blocking_send((path, kind));
            }
        })
        .context("creating file watcher")?;

        for root in &roots {
            watcher
                .watch(root, RecursiveMode::Recursive)
                .with_context(|| format!("watching {}", root.display()))?;
            logger::info("files", &format!("watching {}", root.display()));
        }
        *self.watcher.lock().unwrap_or_else(|p| p.into_inner()) = Some(watcher);

        // Debounce loop: a path must stay quiet for the stability threshold
        // before its newest event is emitted.
        let adapter = Arc::clone(&self);
        let handle = tokio::spawn(async move {
            let mut pending: HashMap<PathBuf, (FileEventKind, Instant)> = HashMap::new();
            let mut timer = tokio::time::interval(DEBOUNCE_POLL);
            loop {
                tokio::select! {
                    received = rx.recv() => {
                        match received {
                            Some((path, kind)) => {
                                let entry = pending.entry(path).or_insert((kind, Instant::now()));
                                // delete supersedes earlier create/modify
                                if kind == FileEventKind::Delete {
                                    entry.0 = FileEventKind::Delete;
                                }
                                entry.1 = Instant::now();
                            }
                            None => break,
                        }
                    }
                    _ = timer.tick() => {
                        let now = Instant::now();
                        let ready: Vec<PathBuf> = pending
                            .iter()
                            .filter(|(_, (_, seen))| now.duration_since(*seen) >= STABILITY_THRESHOLD)
                            .map(|(p, _)| p.clone())
                            .collect();
                        for path in ready {
                            if let Some((kind, _)) = pending.remove(&path) {
                                adapter.emit(path, kind).await;
                            }
                        }
                    }
                }
            }
        });
        self.tasks.lock().unwrap_or_else(|p| p.into_inner()).push(handle);
        Ok(())
    }

    fn stop(&self) {
        *self.watcher.lock().unwrap_or_else(|p| p.into_inner()) = None;
        for handle in self.tasks.lock().unwrap_or_else(|p| p.into_inner()).drain(..) {
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

/// Exclusion pattern semantics:
/// - `*.ext` — filename suffix match
/// - `prefix*` — some path segment starts with `prefix`
/// - `a/b` — path contains the `a/b` substring
/// - bare `name` — some path segment equals `name` exactly
pub fn pattern_matches(pattern: &str, path: &str) -> bool {
    if let Some(suffix) = pattern.strip_prefix('*') {
        let filename = path.rsplit('/').next().unwrap_or(path);
        return filename.ends_with(suffix);
    }
    if let Some(prefix) = pattern.strip_suffix('*') {
        return path.split('/').any(|seg| seg.starts_with(prefix));
    }
    if pattern.contains('/') {
        return path.contains(pattern);
    }
    path.split('/').any(|seg| seg == pattern)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_name_matches_segment_not_substring() {
        assert!(pattern_matches("dist", "/x/dist/y"));
        assert!(!pattern_matches("dist", "/x/distribution/y"));
        assert!(pattern_matches("node_modules", "/x/node_modules/y"));
    }

    #[test]
    fn star_ext_matches_filename_suffix() {
        assert!(pattern_matches("*.lock", "/repo/Cargo.lock"));
        assert!(pattern_matches("*~", "/repo/notes.txt~"));
        assert!(!pattern_matches("*.lock", "/repo/lockfile.rs"));
    }

    #[test]
    fn prefix_star_matches_segment_prefix() {
        assert!(pattern_matches("build*", "/repo/build-output/x"));
        assert!(!pattern_matches("build*", "/repo/src/rebuild/x"));
    }

    #[test]
    fn slash_pattern_matches_path_substring() {
        assert!(pattern_matches(".git/objects", "/repo/.git/objects/ab/cdef"));
        assert!(!pattern_matches(".git/objects", "/repo/.git/config"));
    }

    #[test]
    fn builtin_exclusions_apply() {
        let adapter = FilesAdapter::new(FilesConfig::default());
        assert!(adapter.should_ignore("/p/node_modules/left-pad/index.js"));
        assert!(adapter.should_ignore("/p/target/.DS_Store"));
        assert!(adapter.should_ignore("/p/__pycache__/mod.pyc"));
        assert!(adapter.should_ignore("/p/Cargo.lock"));
        assert!(!adapter.should_ignore("/p/src/main.rs"));
    }

    #[test]
    fn user_patterns_extend_builtins() {
        let adapter = FilesAdapter::new(FilesConfig {
            exclude_patterns: vec!["secrets".into()],
            ..FilesConfig::default()
        });
        assert!(adapter.should_ignore("/p/secrets/key.pem"));
        assert!(!adapter.should_ignore("/p/secretsauce/recipe.md"));
    }
}
