use anyhow::Result;
use chrono::{DateTime, TimeZone, Utc};
use regex::Regex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;
use tokio::task::JoinHandle;

use super::{Adapter, CaptureStore};
use crate::config::TerminalConfig;
use crate::models::{home_dir, new_event_id, CaptureEvent, Shell, TerminalCapture};

const POLL_INTERVAL: Duration = Duration::from_secs(5);
const MIN_COMMAND_LEN: usize = 2;

pub const REDACTION_MARKER: &str = "[REDACTED — sensitive command]";

/// Commands matching any of these never leave the adapter in clear text.
const SENSITIVE_PATTERNS: &[&str] = &[
    r"(?i)password",
    r"(?i)secret",
    r"(?i)token",
    r"(?i)api[_-]?key",
    r"(?i)ssh[_-]?key",
    r"(?i)private[_-]?key",
    r"(?i)passphrase",
    r"(?i)export\s+[A-Za-z0-9_]*(SECRET|TOKEN|KEY|PASSWORD|PASS)[A-Za-z0-9_]*=",
];

fn sensitive_regexes() -> &'static Vec<Regex> {
    static REGEXES: OnceLock<Vec<Regex>> = OnceLock::new();
    REGEXES.get_or_init(|| {
        SENSITIVE_PATTERNS
            .iter()
            .map(|p| Regex::new(p).expect("sensitive pattern"))
            .collect()
    })
}

pub fn is_sensitive(command: &str) -> bool {
    sensitive_regexes().iter().any(|re| re.is_match(command))
}

pub struct TerminalAdapter {
    config: TerminalConfig,
    store: CaptureStore,
    /// History file → number of lines already consumed.
    cursors: Mutex<HashMap<PathBuf, usize>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl TerminalAdapter {
    pub fn new(config: TerminalConfig) -> Self {
        Self {
            config,
            store: CaptureStore::new(),
            cursors: Mutex::new(HashMap::new()),
            task: Mutex::new(None),
        }
    }

    fn history_files() -> Vec<(PathBuf, Shell)> {
        let home = home_dir();
        vec![
            (home.join(".zsh_history"), Shell::Zsh),
            (home.join(".bash_history"), Shell::Bash),
        ]
    }

    async fn poll(&self) {
        for (path, shell) in Self::history_files() {
            let Ok(bytes) = tokio::fs::read(&path).await else {
                continue;
            };
            // zsh history is not always valid UTF-8
            let content = String::from_utf8_lossy(&bytes);
            let lines: Vec<&str> = content.lines().collect();

            let start = {
                let mut cursors = self.cursors.lock().unwrap_or_else(|p| p.into_inner());
                let cursor = cursors.entry(path.clone()).or_insert(lines.len());
                if *cursor > lines.len() {
                    // history file truncated or rotated
                    *cursor = 0;
                }
                let start = *cursor;
                *cursor = lines.len();
                start
            };

            for line in &lines[start..] {
                self.ingest_line(line, shell);
            }
        }
    }

    fn ingest_line(&self, line: &str, shell: Shell) {
        let (timestamp, raw_command) = parse_history_line(line, shell);
        let command = raw_command.trim();
        if command.chars().count() < MIN_COMMAND_LEN {
            return;
        }

        let command = if is_sensitive(command) {
            REDACTION_MARKER.to_string()
        } else {
            command.to_string()
        };

        // user-configured exclusions drop the command outright
        if self
            .config
            .exclude_commands
            .iter()
            .any(|pat| command.contains(pat.as_str()))
        {
            return;
        }

        self.store.push(CaptureEvent::Terminal(TerminalCapture {
            id: new_event_id(),
            timestamp,
            command,
            working_directory: "~".to_string(),
            shell,
        }));
    }
}

/// zsh extended history lines look like `: 1719848200:0;cargo test`. Anything
/// else is a plain command stamped at read time.
pub fn parse_history_line(line: &str, shell: Shell) -> (DateTime<Utc>, String) {
    static ZSH_RE: OnceLock<Regex> = OnceLock::new();
    if shell == Shell::Zsh {
        let re = ZSH_RE.get_or_init(|| Regex::new(r"^: (\d+):\d+;(.*)$").expect("zsh regex"));
        if let Some(caps) = re.captures(line) {
            let epoch: i64 = caps[1].parse().unwrap_or(0);
            let ts = Utc
                .timestamp_opt(epoch, 0)
                .single()
                .unwrap_or_else(Utc::now);
            return (ts, caps[2].to_string());
        }
    }
    (Utc::now(), line.to_string())
}

impl Adapter for TerminalAdapter {
    fn name(&self) -> &'static str {
        "terminal"
    }

    fn enabled(&self) -> bool {
        self.config.enabled
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::Adapter;

    fn adapter() -> TerminalAdapter {
        TerminalAdapter::new(TerminalConfig::default())
    }

    #[test]
    fn zsh_extended_history_yields_epoch_timestamp() {
        let (ts, cmd) = parse_history_line(": 1719848200:0;cargo test --all", Shell::Zsh);
        assert_eq!(ts.timestamp(), 1719848200);
        assert_eq!(cmd, "cargo test --all");
    }

    #[test]
    fn plain_lines_are_commands_stamped_now() {
        let before = Utc::now();
        let (ts, cmd) = parse_history_line("git status", Shell::Bash);
        assert_eq!(cmd, "git status");
        assert!(ts >= before);
    }

    #[test]
    fn sensitive_export_is_redacted() {
        let a = adapter();
        a.ingest_line("export OPENAI_API_KEY=sk-abc123", Shell::Zsh);
        let events = a.captures_since(Utc::now() - chrono::Duration::minutes(1));
        assert_eq!(events.len(), 1);
        let CaptureEvent::Terminal(t) = &events[0] else {
            panic!("expected terminal event");
        };
        assert_eq!(t.command, REDACTION_MARKER);
        assert!(!t.command.contains("sk-abc123"));
    }

    #[test]
    fn sensitive_pattern_set_matches_case_insensitively() {
        assert!(is_sensitive("echo $PASSWORD"));
        assert!(is_sensitive("cat ~/.ssh_key"));
        assert!(is_sensitive("vault read Secret/db"));
        assert!(is_sensitive("export MY_TOKEN_VALUE=x"));
        assert!(is_sensitive("curl -H 'X-Api-Key: foo'"));
        assert!(!is_sensitive("cargo build --release"));
        assert!(!is_sensitive("ls -la"));
    }

    #[test]
    fn short_commands_are_dropped() {
        let a = adapter();
        a.ingest_line("l", Shell::Bash);
        a.ingest_line("", Shell::Bash);
        assert_eq!(a.count(), 0);
    }

    #[test]
    fn user_exclusions_drop_matching_commands() {
        let a = TerminalAdapter::new(TerminalConfig {
            exclude_commands: vec!["htop".into()],
            ..TerminalConfig::default()
        });
        a.ingest_line("htop", Shell::Bash);
        a.ingest_line("cargo check", Shell::Bash);
        assert_eq!(a.count(), 1);
    }

    #[test]
    fn first_poll_initializes_cursor_at_end() {
        // the cursor map starts each file at its current length, so history
        // written before the daemon started is not replayed
        let a = adapter();
        {
            let mut cursors = a.cursors.lock().unwrap();
            cursors.insert(PathBuf::from("/tmp/h"), 5);
        }
        assert_eq!(a.count(), 0);
    }
}
