use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::models;

pub const DEFAULT_PORT: u16 = 3850;
pub const DEFAULT_OLLAMA_URL: &str = "http://localhost:11434";

/// `agent.yaml` — the manifest at the root of the state directory.
/// Unknown keys are ignored; a missing file yields full defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentManifest {
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default = "default_schema")]
    pub schema: String,
    #[serde(default)]
    pub agent: AgentInfo,
    #[serde(default)]
    pub harnesses: Vec<String>,
    #[serde(default)]
    pub memory: MemoryConfig,
    #[serde(default)]
    pub search: SearchConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub perception: PerceptionConfig,
}

impl Default for AgentManifest {
    fn default() -> Self {
        Self {
            version: default_version(),
            schema: default_schema(),
            agent: AgentInfo::default(),
            harnesses: Vec::default(),
            memory: MemoryConfig::default(),
            search: SearchConfig::default(),
            embedding: EmbeddingConfig::default(),
            perception: PerceptionConfig::default(),
        }
    }
}

fn default_version() -> u32 {
    1
}

fn default_schema() -> String {
    "signet/v1".into()
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AgentInfo {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub created: String,
    #[serde(default)]
    pub updated: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    #[serde(default = "default_database")]
    pub database: String,
    #[serde(default = "default_session_budget")]
    pub session_budget: u32,
    #[serde(default = "default_decay_rate")]
    pub decay_rate: f64,
}

fn default_database() -> String {
    "memory/memories.db".into()
}

fn default_session_budget() -> u32 {
    2000
}

fn default_decay_rate() -> f64 {
    0.01
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            database: default_database(),
            session_budget: default_session_budget(),
            decay_rate: default_decay_rate(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SearchConfig {
    #[serde(default = "default_alpha")]
    pub alpha: f64,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default = "default_min_score")]
    pub min_score: f64,
}

fn default_alpha() -> f64 {
    0.7
}

fn default_top_k() -> usize {
    20
}

fn default_min_score() -> f64 {
    0.3
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            alpha: default_alpha(),
            top_k: default_top_k(),
            min_score: default_min_score(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingProvider {
    Ollama,
    Openai,
    #[default]
    None,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    #[serde(default)]
    pub provider: EmbeddingProvider,
    #[serde(default = "default_embedding_model")]
    pub model: String,
    #[serde(default = "default_dimensions")]
    pub dimensions: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
}

fn default_embedding_model() -> String {
    "nomic-embed-text".into()
}

fn default_dimensions() -> usize {
    768
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: EmbeddingProvider::None,
            model: default_embedding_model(),
            dimensions: default_dimensions(),
            api_key: None,
            base_url: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PerceptionConfig {
    #[serde(default)]
    pub screen: ScreenConfig,
    #[serde(default)]
    pub files: FilesConfig,
    #[serde(default)]
    pub terminal: TerminalConfig,
    #[serde(default)]
    pub comms: CommsConfig,
    #[serde(default)]
    pub voice: VoiceConfig,
    #[serde(default = "default_refiner_interval")]
    pub refiner_interval_minutes: u64,
    #[serde(default = "default_ollama_url")]
    pub ollama_url: String,
    #[serde(default = "default_refiner_model")]
    pub refiner_model: String,
}

fn default_refiner_interval() -> u64 {
    20
}

fn default_ollama_url() -> String {
    DEFAULT_OLLAMA_URL.into()
}

fn default_refiner_model() -> String {
    "llama3.2".into()
}

impl Default for PerceptionConfig {
    fn default() -> Self {
        Self {
            screen: ScreenConfig::default(),
            files: FilesConfig::default(),
            terminal: TerminalConfig::default(),
            comms: CommsConfig::default(),
            voice: VoiceConfig::default(),
            refiner_interval_minutes: default_refiner_interval(),
            ollama_url: default_ollama_url(),
            refiner_model: default_refiner_model(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScreenConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_screen_interval")]
    pub interval_seconds: u64,
    #[serde(default)]
    pub exclude_apps: Vec<String>,
    #[serde(default)]
    pub exclude_windows: Vec<String>,
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
}

fn default_true() -> bool {
    true
}

fn default_screen_interval() -> u64 {
    30
}

fn default_retention_days() -> u32 {
    7
}

impl Default for ScreenConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_seconds: default_screen_interval(),
            exclude_apps: Vec::new(),
            exclude_windows: Vec::new(),
            retention_days: default_retention_days(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilesConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_watch_dirs")]
    pub watch_directories: Vec<String>,
    #[serde(default)]
    pub exclude_patterns: Vec<String>,
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
}

fn default_watch_dirs() -> Vec<String> {
    vec!["~/projects".into()]
}

impl Default for FilesConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            watch_directories: default_watch_dirs(),
            exclude_patterns: Vec::new(),
            retention_days: default_retention_days(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminalConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub exclude_commands: Vec<String>,
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
}

impl Default for TerminalConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            exclude_commands: Vec::new(),
            retention_days: default_retention_days(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub git_repos: Vec<String>,
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
}

impl Default for CommsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            git_repos: Vec::new(),
            retention_days: default_retention_days(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoiceConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_voice_model")]
    pub model: String,
    #[serde(default = "default_vad_threshold")]
    pub vad_threshold: f64,
    #[serde(default)]
    pub exclude_keywords: Vec<String>,
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
}

fn default_voice_model() -> String {
    "base.en".into()
}

fn default_vad_threshold() -> f64 {
    0.3
}

impl Default for VoiceConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            model: default_voice_model(),
            vad_threshold: default_vad_threshold(),
            exclude_keywords: Vec::new(),
            retention_days: default_retention_days(),
        }
    }
}

impl AgentManifest {
    pub fn manifest_path() -> PathBuf {
        models::signet_path("agent.yaml")
    }

    /// Load `agent.yaml` from the state root. A missing file is not an
    /// error; a malformed one is.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::manifest_path())
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&content).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_yaml::to_string(self).context("serializing agent.yaml")?;
        std::fs::write(path, content).with_context(|| format!("writing {}", path.display()))?;
        Ok(())
    }

    pub fn database_path(&self) -> PathBuf {
        models::signet_dir().join(&self.memory.database)
    }
}

/// HTTP port: `$SIGNET_PORT` wins over the default.
pub fn port() -> u16 {
    std::env::var("SIGNET_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(DEFAULT_PORT)
}

/// `SIGNET_NO_HOOKS=1` — spawned agents set this to break hook recursion.
pub fn hooks_suppressed() -> bool {
    std::env::var("SIGNET_NO_HOOKS").map(|v| v == "1").unwrap_or(false)
}

/// Expand a leading `~` to the user's home directory.
pub fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix("~/") {
        return models::home_dir().join(rest).to_string_lossy().into_owned();
    }
    if path == "~" {
        return models::home_dir().to_string_lossy().into_owned();
    }
    path.to_string()
}
