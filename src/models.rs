use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

/// Returns the user's home directory. `$HOME` wins so tests can pin it.
pub fn home_dir() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .ok()
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Returns the state root: `$SIGNET_PATH` or `~/.agents`.
pub fn signet_dir() -> PathBuf {
    match std::env::var("SIGNET_PATH") {
        Ok(p) if !p.is_empty() => PathBuf::from(p),
        _ => home_dir().join(".agents"),
    }
}

/// Returns `<state root>/<subpath>`.
pub fn signet_path(subpath: &str) -> PathBuf {
    signet_dir().join(subpath)
}

pub fn daemon_dir() -> PathBuf {
    signet_path(".daemon")
}

pub fn pid_path() -> PathBuf {
    daemon_dir().join("pid")
}

pub fn logs_dir() -> PathBuf {
    daemon_dir().join("logs")
}

pub fn db_path() -> PathBuf {
    signet_path("memory").join("memories.db")
}

pub fn shorten_home(path: &str) -> String {
    let h = home_dir();
    let h_str = h.to_string_lossy();
    if !h_str.is_empty() && h_str != "." && path.starts_with(h_str.as_ref()) {
        format!("~{}", &path[h_str.len()..])
    } else {
        path.to_string()
    }
}

pub fn new_event_id() -> String {
    Uuid::new_v4().to_string()
}

// ── Capture events ───────────────────────────────────────────────────────────

/// One observation from a capture adapter. Tagged union keyed on source so
/// JSONL lines stay self-describing.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum CaptureEvent {
    Screen(ScreenCapture),
    FileActivity(FileActivity),
    Terminal(TerminalCapture),
    GitCommit(CommCapture),
    Voice(VoiceSegment),
}

impl CaptureEvent {
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            CaptureEvent::Screen(e) => e.timestamp,
            CaptureEvent::FileActivity(e) => e.timestamp,
            CaptureEvent::Terminal(e) => e.timestamp,
            CaptureEvent::GitCommit(e) => e.timestamp,
            CaptureEvent::Voice(e) => e.timestamp,
        }
    }

    pub fn id(&self) -> &str {
        match self {
            CaptureEvent::Screen(e) => &e.id,
            CaptureEvent::FileActivity(e) => &e.id,
            CaptureEvent::Terminal(e) => &e.id,
            CaptureEvent::GitCommit(e) => &e.id,
            CaptureEvent::Voice(e) => &e.id,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct ScreenCapture {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub focused_app: String,
    pub focused_window: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bundle_id: Option<String>,
    pub ocr_text: String,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FileEventKind {
    Create,
    Modify,
    Delete,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct FileActivity {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub event_type: FileEventKind,
    pub file_path: String,
    pub file_type: String,
    pub is_git_repo: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_branch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u64>,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Shell {
    #[default]
    Zsh,
    Bash,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct TerminalCapture {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub command: String,
    pub working_directory: String,
    pub shell: Shell,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct CommCapture {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    /// Commit subject line.
    pub content: String,
    pub metadata: CommitMeta,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct CommitMeta {
    pub repo: String,
    pub repo_path: String,
    pub branch: String,
    pub commit_hash: String,
    pub author: String,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct VoiceSegment {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub duration_seconds: f64,
    pub transcript: String,
    pub confidence: f64,
    pub language: String,
    pub is_speaking: bool,
}

// ── Capture bundle ───────────────────────────────────────────────────────────

/// Point-in-time view across all adapters, filtered by `timestamp >= since`.
#[derive(Clone, Debug, Default)]
pub struct CaptureBundle {
    pub screen: Vec<ScreenCapture>,
    pub voice: Vec<VoiceSegment>,
    pub files: Vec<FileActivity>,
    pub terminal: Vec<TerminalCapture>,
    pub comms: Vec<CommCapture>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
}

impl CaptureBundle {
    pub fn total(&self) -> usize {
        self.screen.len() + self.voice.len() + self.files.len() + self.terminal.len() + self.comms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }

    pub fn push(&mut self, event: CaptureEvent) {
        match event {
            CaptureEvent::Screen(e) => self.screen.push(e),
            CaptureEvent::FileActivity(e) => self.files.push(e),
            CaptureEvent::Terminal(e) => self.terminal.push(e),
            CaptureEvent::GitCommit(e) => self.comms.push(e),
            CaptureEvent::Voice(e) => self.voice.push(e),
        }
    }
}

// ── Memories ─────────────────────────────────────────────────────────────────

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum MemoryType {
    Explicit,
    Skill,
    Fact,
    Decision,
    Procedural,
    Preference,
    Pattern,
    #[default]
    Semantic,
    System,
}

impl MemoryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryType::Explicit => "explicit",
            MemoryType::Skill => "skill",
            MemoryType::Fact => "fact",
            MemoryType::Decision => "decision",
            MemoryType::Procedural => "procedural",
            MemoryType::Preference => "preference",
            MemoryType::Pattern => "pattern",
            MemoryType::Semantic => "semantic",
            MemoryType::System => "system",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "explicit" => Some(MemoryType::Explicit),
            "skill" => Some(MemoryType::Skill),
            "fact" => Some(MemoryType::Fact),
            "decision" => Some(MemoryType::Decision),
            "procedural" => Some(MemoryType::Procedural),
            "preference" => Some(MemoryType::Preference),
            "pattern" => Some(MemoryType::Pattern),
            "semantic" => Some(MemoryType::Semantic),
            "system" => Some(MemoryType::System),
            _ => None,
        }
    }
}

/// A persisted memory row.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct MemoryRecord {
    pub id: String,
    pub content: String,
    #[serde(rename = "type")]
    pub memory_type: MemoryType,
    pub source: String,
    pub importance: f64,
    pub confidence: f64,
    pub tags: Vec<String>,
    pub pinned: bool,
    pub who: String,
    pub created_at: String,
    pub updated_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accessed_at: Option<String>,
    #[serde(default)]
    pub access_count: i64,
    #[serde(default)]
    pub is_deleted: bool,
}

// ── Expertise graph ──────────────────────────────────────────────────────────

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EntityType {
    Skill,
    Tool,
    Language,
    Framework,
    Project,
    Person,
    Domain,
}

impl EntityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Skill => "skill",
            EntityType::Tool => "tool",
            EntityType::Language => "language",
            EntityType::Framework => "framework",
            EntityType::Project => "project",
            EntityType::Person => "person",
            EntityType::Domain => "domain",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "skill" => Some(EntityType::Skill),
            "tool" => Some(EntityType::Tool),
            "language" => Some(EntityType::Language),
            "framework" => Some(EntityType::Framework),
            "project" => Some(EntityType::Project),
            "person" => Some(EntityType::Person),
            "domain" => Some(EntityType::Domain),
            _ => None,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct ExpertiseNode {
    pub id: String,
    pub name: String,
    pub entity_type: EntityType,
    pub mentions: i64,
    pub first_seen: String,
    pub last_seen: String,
}

/// Undirected edge, stored once with `source_id < target_id`.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct ExpertiseEdge {
    pub source_id: String,
    pub target_id: String,
    pub weight: f64,
    pub co_occurrences: i64,
}

/// What a refiner extracts from a bundle, before persistence assigns an id.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ExtractedMemory {
    pub content: String,
    #[serde(rename = "type")]
    pub memory_type: MemoryType,
    pub importance: f64,
    pub confidence: f64,
    #[serde(default)]
    pub tags: Vec<String>,
    pub source: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shorten_home_replaces_prefix() {
        let h = home_dir();
        let path = format!("{}/projects/signet", h.display());
        let short = shorten_home(&path);
        assert!(short.starts_with("~/"));
        assert!(short.ends_with("/projects/signet"));
    }

    #[test]
    fn shorten_home_leaves_unrelated_paths() {
        assert_eq!(shorten_home("/tmp/foo"), "/tmp/foo");
    }

    #[test]
    fn capture_event_serializes_with_source_tag() {
        let e = CaptureEvent::Terminal(TerminalCapture {
            id: new_event_id(),
            timestamp: Utc::now(),
            command: "cargo test".into(),
            working_directory: "/tmp".into(),
            shell: Shell::Zsh,
        });
        let v = serde_json::to_value(&e).unwrap();
        assert_eq!(v["source"], "terminal");
        assert_eq!(v["command"], "cargo test");
    }

    #[test]
    fn comm_capture_uses_git_commit_source() {
        let e = CaptureEvent::GitCommit(CommCapture {
            id: new_event_id(),
            timestamp: Utc::now(),
            content: "fix parser".into(),
            metadata: CommitMeta::default(),
        });
        let v = serde_json::to_value(&e).unwrap();
        assert_eq!(v["source"], "git_commit");
    }

    #[test]
    fn memory_type_round_trips_all_nine() {
        for t in [
            "explicit",
            "skill",
            "fact",
            "decision",
            "procedural",
            "preference",
            "pattern",
            "semantic",
            "system",
        ] {
            let parsed = MemoryType::parse(t).unwrap();
            assert_eq!(parsed.as_str(), t);
        }
        assert!(MemoryType::parse("bogus").is_none());
    }

    #[test]
    fn bundle_push_routes_by_variant() {
        let mut bundle = CaptureBundle::default();
        bundle.push(CaptureEvent::Screen(ScreenCapture {
            id: new_event_id(),
            timestamp: Utc::now(),
            focused_app: "Code".into(),
            focused_window: "main.rs".into(),
            bundle_id: None,
            ocr_text: String::new(),
        }));
        bundle.push(CaptureEvent::Voice(VoiceSegment {
            id: new_event_id(),
            timestamp: Utc::now(),
            duration_seconds: 10.0,
            transcript: "hello".into(),
            confidence: 0.9,
            language: "en".into(),
            is_speaking: true,
        }));
        assert_eq!(bundle.screen.len(), 1);
        assert_eq!(bundle.voice.len(), 1);
        assert_eq!(bundle.total(), 2);
    }
}
