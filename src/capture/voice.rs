use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::process::Command;
use tokio::task::JoinHandle;

use super::{find_tool, Adapter, CaptureStore};
use crate::config::VoiceConfig;
use crate::logger;
use crate::models::{new_event_id, CaptureEvent, VoiceSegment};

const SEGMENT_SECONDS: u64 = 10;
/// Trigger period is slightly longer than the segment so recordings never
/// overlap even when transcription is instant.
const TRIGGER_INTERVAL: Duration = Duration::from_millis(10_500);
const RECORD_TIMEOUT: Duration = Duration::from_secs(SEGMENT_SECONDS + 5);
const VAD_TIMEOUT: Duration = Duration::from_secs(10);
const TRANSCRIBE_TIMEOUT: Duration = Duration::from_secs(30);

pub const VOICE_REDACTION_MARKER: &str = "[redacted]";

#[derive(Deserialize)]
struct WhisperOutput {
    #[serde(default)]
    text: String,
    #[serde(default)]
    segments: Vec<WhisperSegment>,
    #[serde(default)]
    language: String,
}

#[derive(Deserialize)]
struct WhisperSegment {
    #[serde(default)]
    no_speech_prob: f64,
}

pub struct VoiceAdapter {
    config: VoiceConfig,
    store: CaptureStore,
    /// Single in-flight capture; overlapping triggers are dropped.
    capturing: AtomicBool,
    temp_dir: Mutex<Option<tempfile::TempDir>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl VoiceAdapter {
    pub fn new(config: VoiceConfig) -> Self {
        Self {
            config,
            store: CaptureStore::new(),
            capturing: AtomicBool::new(false),
            temp_dir: Mutex::new(None),
            task: Mutex::new(None),
        }
    }

    async fn tick(&self) {
        if self
            .capturing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            logger::debug("voice", "capture already in flight, dropping trigger");
            return;
        }
        let result = self.capture_segment().await;
        self.capturing.store(false, Ordering::SeqCst);
        if let Err(e) = result {
            logger::warn("voice", &format!("segment capture failed: {e}"));
        }
    }

    async fn capture_segment(&self) -> Result<()> {
        let dir = {
            let guard = self.temp_dir.lock().unwrap_or_else(|p| p.into_inner());
            guard
                .as_ref()
                .map(|d| d.path().to_path_buf())
                .context("voice temp dir missing")?
        };
        let stamp = Utc::now().timestamp_millis();
        let wav = dir.join(format!("segment-{stamp}.wav"));

        record_wav(&wav).await?;

        let energy = match measure_energy(&wav).await {
            Some(e) => e,
            None => {
                remove_segment_files(&dir, stamp);
                return Ok(());
            }
        };
        if energy < self.config.vad_threshold {
            remove_segment_files(&dir, stamp);
            return Ok(());
        }

        let parsed = transcribe(&wav, &dir, &self.config.model).await;
        remove_segment_files(&dir, stamp);
        let Some(parsed) = parsed else {
            return Ok(());
        };

        let transcript = redact_keywords(&parsed.text, &self.config.exclude_keywords);
        if transcript.trim().is_empty() {
            return Ok(());
        }

        let confidence = if parsed.segments.is_empty() {
            0.5
        } else {
            let mean: f64 = parsed
                .segments
                .iter()
                .map(|s| s.no_speech_prob)
                .sum::<f64>()
                / parsed.segments.len() as f64;
            (1.0 - mean).clamp(0.0, 1.0)
        };

        self.store.push(CaptureEvent::Voice(VoiceSegment {
            id: new_event_id(),
            timestamp: Utc::now(),
            duration_seconds: SEGMENT_SECONDS as f64,
            transcript,
            confidence,
            language: if parsed.language.is_empty() {
                "en".to_string()
            } else {
                parsed.language
            },
            is_speaking: true,
        }));
        Ok(())
    }
}

impl Adapter for VoiceAdapter {
    fn name(&self) -> &'static str {
        "voice"
    }

    fn enabled(&self) -> bool {
        self.config.enabled
    }

    fn start(self: Arc<Self>) -> Result<()> {
        if find_tool("ffmpeg").is_none() {
            anyhow::bail!("ffmpeg not found");
        }
        if find_tool("whisper").is_none() {
            anyhow::bail!("whisper not found");
        }

        let dir = tempfile::Builder::new()
            .prefix("signet-voice-")
            .tempdir()
            .context("creating voice temp dir")?;
        *self.temp_dir.lock().unwrap_or_else(|p| p.into_inner()) = Some(dir);

        let adapter = Arc::clone(&self);
        let handle = tokio::spawn(async move {
            let mut timer = tokio::time::interval(TRIGGER_INTERVAL);
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
        // dropping the TempDir removes it and every leftover segment file
        *self.temp_dir.lock().unwrap_or_else(|p| p.into_inner()) = None;
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

async fn record_wav(wav: &Path) -> Result<()> {
    let input: &[&str] = if cfg!(target_os = "macos") {
        &["-f", "avfoundation", "-i", ":0"]
    } else {
        &["-f", "alsa", "-i", "default"]
    };
    let duration = SEGMENT_SECONDS.to_string();
    let mut cmd = Command::new("ffmpeg");
    cmd.args(["-y", "-loglevel", "error"])
        .args(input)
        .args(["-t", &duration, "-ac", "1", "-ar", "16000"])
        .arg(wav);
    let out = tokio::time::timeout(RECORD_TIMEOUT, cmd.output())
        .await
        .context("recording timed out")?
        .context("spawning ffmpeg")?;
    if !out.status.success() {
        anyhow::bail!(
            "ffmpeg record failed: {}",
            String::from_utf8_lossy(&out.stderr).trim()
        );
    }
    Ok(())
}

/// Volume-detect pass. Returns normalized energy in [0, 1], or None when the
/// pass failed (treated as silence).
async fn measure_energy(wav: &Path) -> Option<f64> {
    let mut cmd = Command::new("ffmpeg");
    cmd.args(["-i"])
        .arg(wav)
        .args(["-af", "volumedetect", "-f", "null", "-"]);
    let out = tokio::time::timeout(VAD_TIMEOUT, cmd.output()).await.ok()?.ok()?;
    let stderr = String::from_utf8_lossy(&out.stderr);
    let db = parse_mean_volume(&stderr)?;
    Some(energy_from_db(db))
}

pub fn parse_mean_volume(stderr: &str) -> Option<f64> {
    for line in stderr.lines() {
        if let Some(idx) = line.find("mean_volume:") {
            let rest = line[idx + "mean_volume:".len()..].trim();
            let value = rest.split_whitespace().next()?;
            return value.parse().ok();
        }
    }
    None
}

/// Map dBFS to [0, 1]: silence floor at −91 dB, full scale at 0 dB.
pub fn energy_from_db(db: f64) -> f64 {
    ((db + 91.0) / 91.0).clamp(0.0, 1.0)
}

async fn transcribe(wav: &Path, out_dir: &Path, model: &str) -> Option<WhisperOutput> {
    let mut cmd = Command::new("whisper");
    cmd.arg(wav)
        .args(["--model", model])
        .args(["--output_format", "json"])
        .args(["--output_dir"])
        .arg(out_dir);
    let out = tokio::time::timeout(TRANSCRIBE_TIMEOUT, cmd.output())
        .await
        .ok()?
        .ok()?;
    if !out.status.success() {
        logger::warn(
            "voice",
            &format!(
                "whisper failed: {}",
                String::from_utf8_lossy(&out.stderr).trim()
            ),
        );
        return None;
    }
    let stem = wav.file_stem()?.to_str()?;
    let json_path = out_dir.join(format!("{stem}.json"));
    let content = std::fs::read_to_string(&json_path).ok()?;
    serde_json::from_str(&content).ok()
}

fn remove_segment_files(dir: &Path, stamp: i64) {
    let prefix = format!("segment-{stamp}");
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.filter_map(|e| e.ok()) {
        if entry
            .file_name()
            .to_string_lossy()
            .starts_with(&prefix)
        {
            let _ = std::fs::remove_file(entry.path());
        }
    }
}

/// Case-insensitive keyword redaction over the transcript.
pub fn redact_keywords(transcript: &str, keywords: &[String]) -> String {
    let mut out = transcript.to_string();
    for keyword in keywords {
        if keyword.is_empty() {
            continue;
        }
        let pattern = format!("(?i){}", regex::escape(keyword));
        if let Ok(re) = regex::Regex::new(&pattern) {
            out = re.replace_all(&out, VOICE_REDACTION_MARKER).into_owned();
        }
    }
    out
}
