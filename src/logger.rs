use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Mutex, OnceLock};
use tokio::sync::broadcast;

const RING_CAP: usize = 1000;

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "debug" => Some(LogLevel::Debug),
            "info" => Some(LogLevel::Info),
            "warn" => Some(LogLevel::Warn),
            "error" => Some(LogLevel::Error),
            _ => None,
        }
    }
}

/// One structured log line: `{timestamp, level, category, message, data?,
/// duration_ms?, error?}`.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct LogEntry {
    pub timestamp: String,
    pub level: LogLevel,
    pub category: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

struct Logger {
    ring: Mutex<VecDeque<LogEntry>>,
    tx: broadcast::Sender<LogEntry>,
    file_dir: Mutex<Option<PathBuf>>,
}

static LOGGER: OnceLock<Logger> = OnceLock::new();

fn logger() -> &'static Logger {
    LOGGER.get_or_init(|| {
        let (tx, _) = broadcast::channel(256);
        Logger {
            ring: Mutex::new(VecDeque::with_capacity(RING_CAP)),
            tx,
            file_dir: Mutex::new(None),
        }
    })
}

/// Point the logger at a log directory. Entries logged before init only hit
/// the ring and stderr.
pub fn init(dir: PathBuf) {
    if let Err(e) = std::fs::create_dir_all(&dir) {
        eprintln!("[signet] cannot create log dir {}: {e}", dir.display());
        return;
    }
    *logger().file_dir.lock().unwrap_or_else(|p| p.into_inner()) = Some(dir);
}

pub fn debug(category: &str, message: &str) {
    emit(LogLevel::Debug, category, message, None, None);
}

pub fn info(category: &str, message: &str) {
    emit(LogLevel::Info, category, message, None, None);
}

pub fn warn(category: &str, message: &str) {
    emit(LogLevel::Warn, category, message, None, None);
}

pub fn error(category: &str, message: &str, err: Option<&str>) {
    emit(LogLevel::Error, category, message, None, err.map(|s| s.to_string()));
}

pub fn info_with(category: &str, message: &str, data: serde_json::Value) {
    emit(LogLevel::Info, category, message, Some(data), None);
}

pub fn warn_with(category: &str, message: &str, data: serde_json::Value) {
    emit(LogLevel::Warn, category, message, Some(data), None);
}

fn emit(
    level: LogLevel,
    category: &str,
    message: &str,
    data: Option<serde_json::Value>,
    error: Option<String>,
) {
    let entry = LogEntry {
        timestamp: Utc::now().to_rfc3339(),
        level,
        category: category.to_string(),
        message: message.to_string(),
        data,
        duration_ms: None,
        error,
    };

    let lg = logger();

    {
        let mut ring = lg.ring.lock().unwrap_or_else(|p| p.into_inner());
        if ring.len() >= RING_CAP {
            ring.pop_front();
        }
        ring.push_back(entry.clone());
    }

    let _ = lg.tx.send(entry.clone());

    if level >= LogLevel::Warn {
        match &entry.error {
            Some(e) => eprintln!("[signet] {}: {} ({e})", entry.category, entry.message),
            None => eprintln!("[signet] {}: {}", entry.category, entry.message),
        }
    }

    append_to_file(lg, &entry);
}

fn append_to_file(lg: &Logger, entry: &LogEntry) {
    let dir = {
        let guard = lg.file_dir.lock().unwrap_or_else(|p| p.into_inner());
        match guard.as_ref() {
            Some(d) => d.clone(),
            None => return,
        }
    };
    let name = format!("signet-{}.log", Utc::now().format("%Y-%m-%d"));
    let path = dir.join(name);
    let Ok(line) = serde_json::to_string(entry) else {
        return;
    };
    let result = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .and_then(|mut f| writeln!(f, "{line}"));
    if let Err(e) = result {
        eprintln!("[signet] log write failed for {}: {e}", path.display());
    }
}

/// Most recent entries, newest last, filtered by minimum level and category.
pub fn tail(limit: usize, level: Option<LogLevel>, category: Option<&str>) -> Vec<LogEntry> {
    let ring = logger().ring.lock().unwrap_or_else(|p| p.into_inner());
    ring.iter()
        .rev()
        .filter(|e| level.is_none_or(|min| e.level >= min))
        .filter(|e| category.is_none_or(|c| e.category == c))
        .take(limit)
        .cloned()
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect()
}

/// Live feed for the SSE endpoint.
pub fn subscribe() -> broadcast::Receiver<LogEntry> {
    logger().tx.subscribe()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tail_filters_by_level_and_category() {
        info("test-tail", "one");
        warn("test-tail", "two");
        info("other-cat", "three");

        let all = tail(100, None, Some("test-tail"));
        assert!(all.len() >= 2);

        let warns = tail(100, Some(LogLevel::Warn), Some("test-tail"));
        assert!(warns.iter().all(|e| e.level >= LogLevel::Warn));
        assert!(warns.iter().any(|e| e.message == "two"));
        assert!(!warns.iter().any(|e| e.message == "one"));
    }

    #[test]
    fn entries_serialize_as_flat_json_objects() {
        let entry = LogEntry {
            timestamp: Utc::now().to_rfc3339(),
            level: LogLevel::Info,
            category: "capture".into(),
            message: "started".into(),
            data: Some(serde_json::json!({"adapter": "screen"})),
            duration_ms: None,
            error: None,
        };
        let v = serde_json::to_value(&entry).unwrap();
        assert_eq!(v["level"], "info");
        assert_eq!(v["category"], "capture");
        assert_eq!(v["data"]["adapter"], "screen");
        assert!(v.get("duration_ms").is_none());
    }

    #[test]
    fn level_ordering_supports_min_filter() {
        assert!(LogLevel::Error > LogLevel::Warn);
        assert!(LogLevel::Warn > LogLevel::Info);
        assert!(LogLevel::Info > LogLevel::Debug);
        assert_eq!(LogLevel::parse("warn"), Some(LogLevel::Warn));
        assert_eq!(LogLevel::parse("nope"), None);
    }
}
