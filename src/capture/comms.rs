use anyhow::Result;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;

use super::{Adapter, CaptureStore};
use crate::config::{expand_tilde, CommsConfig};
use crate::git;
use crate::models::{new_event_id, CaptureEvent, CommCapture, CommitMeta};

const POLL_INTERVAL: Duration = Duration::from_secs(300);
const LOG_WINDOW: &str = "20 minutes ago";

pub struct CommsAdapter {
    config: CommsConfig,
    store: CaptureStore,
    /// Repo root → most recently seen commit hash.
    last_seen: Mutex<HashMap<PathBuf, String>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl CommsAdapter {
    pub fn new(config: CommsConfig) -> Self {
        Self {
            config,
            store: CaptureStore::new(),
            last_seen: Mutex::new(HashMap::new()),
            task: Mutex::new(None),
        }
    }

    /// Expand configured patterns into concrete repo roots. `dir/*` globs to
    /// subdirectories containing `.git`.
    fn resolve_repos(&self) -> Vec<PathBuf> {
        let mut repos = Vec::new();
        for pattern in &self.config.git_repos {
            let expanded = expand_tilde(pattern);
            if let Some(parent) = expanded.strip_suffix("/*") {
                let Ok(entries) = std::fs::read_dir(parent) else {
                    continue;
                };
                for entry in entries.filter_map(|e| e.ok()) {
                    let path = entry.path();
                    if path.join(".git").exists() {
                        repos.push(path);
                    }
                }
            } else {
                let path = PathBuf::from(&expanded);
                if path.join(".git").exists() {
                    repos.push(path);
                }
            }
        }
        repos
    }

    async fn poll(&self) {
        for repo in self.resolve_repos() {
            self.poll_repo(&repo).await;
        }
    }

    async fn poll_repo(&self, repo: &Path) {
        let commits = git::log_since(repo, LOG_WINDOW).await;
        if commits.is_empty() {
            return;
        }

        let previous = {
            let seen = self.last_seen.lock().unwrap_or_else(|p| p.into_inner());
            seen.get(repo).cloned()
        };

        // newest-first walk, stopping at the last hash we already emitted
        let mut fresh = Vec::new();
        for commit in &commits {
            if previous.as_deref() == Some(commit.hash.as_str()) {
                break;
            }
            fresh.push(commit.clone());
        }
        if fresh.is_empty() {
            return;
        }

        let branch = git::branch_in(repo).await.unwrap_or_default();
        let repo_name = git::repo_name(repo);
        let repo_path = repo.to_string_lossy().into_owned();

        // emit oldest first so store timestamps stay monotone
        for commit in fresh.iter().rev() {
            // %ai dates look like "2026-07-01 10:00:00 +0000"
            let timestamp = DateTime::parse_from_str(&commit.date, "%Y-%m-%d %H:%M:%S %z")
                .map(|dt| dt.with_timezone(&Utc))
                .unwrap_or_else(|_| Utc::now());

            self.store.push(CaptureEvent::GitCommit(CommCapture {
                id: new_event_id(),
                timestamp,
                content: commit.subject.clone(),
                metadata: CommitMeta {
                    repo: repo_name.clone(),
                    repo_path: repo_path.clone(),
                    branch: branch.clone(),
                    commit_hash: commit.hash.clone(),
                    author: commit.author.clone(),
                },
            }));
        }

        let newest = commits[0].hash.clone();
        self.last_seen
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(repo.to_path_buf(), newest);
    }
}

impl Adapter for CommsAdapter {
    fn name(&self) -> &'static str {
        "comms"
    }

    fn enabled(&self) -> bool {
        self.config.enabled && !self.config.git_repos.is_empty()
    }

    fn start(self: Arc<Self>) -> Result<()> {
        let adapter = Arc::clone(&self);
        let handle = tokio::spawn(async move {
            let mut timer = tokio::time::interval(POLL_INTERVAL);
            timer.tick().await;
            loop {
                timer.tick().await;
                adapter.poll().await;
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
