//! Service configuration read from `.testforge/testforge.toml`.
//!
//! Values are layered: built-in defaults, then the file, then environment
//! variables (including `.env`, loaded by `main`), then CLI flags.
//!
//! ```toml
//! [server]
//! port = 3141
//! db_path = ".testforge/testforge.db"
//! artifacts_dir = ".testforge/artifacts"
//!
//! [pipeline]
//! max_heal_attempts_cap = 5
//! max_concurrent_runs = 2
//!
//! [ai]
//! backend = "ollama"
//! ollama_url = "http://localhost:11434"
//! ollama_model = "qwen2.5-coder:14b"
//! fallback_models = ["llama3.2:latest", "mistral:latest"]
//!
//! [progress]
//! keepalive_secs = 30
//! pong_timeout_secs = 60
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use crate::pipeline::models::{MAX_HEAL_ATTEMPTS, MIN_HEAL_ATTEMPTS};
use crate::pipeline::phase::PhaseTimeouts;
use crate::pipeline::runner::{InstanceLease, RunnerSettings};
use crate::pipeline::ws::Keepalive;

pub const CONFIG_DIR: &str = ".testforge";
pub const CONFIG_FILE: &str = "testforge.toml";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub pipeline: PipelineSection,
    #[serde(default)]
    pub timeouts: TimeoutsSection,
    #[serde(default)]
    pub browser: BrowserSection,
    #[serde(default)]
    pub ai: AiSection,
    #[serde(default)]
    pub progress: ProgressSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub port: u16,
    pub db_path: PathBuf,
    pub artifacts_dir: PathBuf,
    /// Bind on all interfaces and allow any CORS origin.
    pub dev: bool,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            port: 3141,
            db_path: PathBuf::from(".testforge/testforge.db"),
            artifacts_dir: PathBuf::from(".testforge/artifacts"),
            dev: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineSection {
    pub max_heal_attempts_cap: u32,
    /// 0 means unlimited.
    pub max_concurrent_runs: usize,
    pub shutdown_grace_secs: u64,
    /// Instance heartbeat cadence. Runs of a process silent for four
    /// heartbeats count as interrupted.
    pub heartbeat_secs: u64,
}

impl Default for PipelineSection {
    fn default() -> Self {
        Self {
            max_heal_attempts_cap: MAX_HEAL_ATTEMPTS,
            max_concurrent_runs: 0,
            shutdown_grace_secs: 10,
            heartbeat_secs: 15,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutsSection {
    pub discovery_secs: u64,
    pub recording_secs: u64,
    pub generation_secs: u64,
    /// Per fix proposal.
    pub healing_secs: u64,
    /// Per HTTP request made by the crawler.
    pub request_secs: u64,
}

impl Default for TimeoutsSection {
    fn default() -> Self {
        Self {
            discovery_secs: 300,
            recording_secs: 600,
            generation_secs: 300,
            healing_secs: 120,
            request_secs: 15,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrowserSection {
    pub python_cmd: String,
    pub playwright_cmd: String,
    /// Scratch directory for recordings and pytest invocations.
    pub workspace_dir: PathBuf,
}

impl Default for BrowserSection {
    fn default() -> Self {
        Self {
            python_cmd: "python3".to_string(),
            playwright_cmd: "playwright".to_string(),
            workspace_dir: PathBuf::from(".testforge/workspace"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AiBackendKind {
    #[default]
    Claude,
    Ollama,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AiSection {
    pub backend: AiBackendKind,
    pub claude_cmd: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub claude_model: Option<String>,
    pub ollama_url: String,
    pub ollama_model: String,
    /// HTTP timeout for Ollama requests.
    pub request_timeout_secs: u64,
    /// Models tried in order, on the same backend, when the primary model
    /// fails or returns unusable tests.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub fallback_models: Vec<String>,
}

impl Default for AiSection {
    fn default() -> Self {
        Self {
            backend: AiBackendKind::Claude,
            claude_cmd: "claude".to_string(),
            claude_model: None,
            ollama_url: "http://localhost:11434".to_string(),
            ollama_model: "qwen2.5-coder:14b".to_string(),
            request_timeout_secs: 300,
            fallback_models: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProgressSection {
    pub channel_capacity: usize,
    pub keepalive_secs: u64,
    pub pong_timeout_secs: u64,
}

impl Default for ProgressSection {
    fn default() -> Self {
        Self {
            channel_capacity: 256,
            keepalive_secs: 30,
            pong_timeout_secs: 60,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    /// Fallback filter when `RUST_LOG` is unset.
    pub level: String,
    pub json: bool,
    /// Directory for a daily rolling log file.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dir: Option<PathBuf>,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            dir: None,
        }
    }
}

/// Flags that take precedence over file and environment.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub port: Option<u16>,
    pub db_path: Option<PathBuf>,
    pub dev: bool,
    pub json_logs: bool,
}

impl Config {
    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse testforge.toml")
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    /// Load from `path`, or from `.testforge/testforge.toml` when it exists.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => {
                let default_path = default_path();
                if default_path.exists() {
                    Self::load(&default_path)
                } else {
                    Ok(Self::default())
                }
            }
        }
    }

    /// Full layering for the CLI: file, then process environment, then flags.
    pub fn resolve(path: Option<&Path>, cli: &CliOverrides) -> Result<Self> {
        let mut config = Self::load_or_default(path)?;
        config.apply_env();
        config.apply_cli(cli);
        let problems = config.validate();
        if !problems.is_empty() {
            bail!("Invalid configuration:\n  - {}", problems.join("\n  - "));
        }
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let content = toml::to_string_pretty(self).context("Failed to serialize testforge.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))
    }

    pub fn apply_env(&mut self) {
        self.apply_env_from(|key| std::env::var(key).ok());
    }

    /// Apply environment overrides read through `lookup`. Unparseable
    /// numeric values are ignored with a warning.
    pub fn apply_env_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        if let Some(port) = parse_var(&var, "TESTFORGE_PORT") {
            self.server.port = port;
        }
        if let Some(path) = var("TESTFORGE_DB_PATH") {
            self.server.db_path = PathBuf::from(path);
        }
        if let Some(dir) = var("TESTFORGE_ARTIFACTS_DIR") {
            self.server.artifacts_dir = PathBuf::from(dir);
        }
        if let Some(max) = parse_var(&var, "TESTFORGE_MAX_CONCURRENT_RUNS") {
            self.pipeline.max_concurrent_runs = max;
        }
        if let Some(json) = var("TESTFORGE_JSON_LOGS") {
            self.logging.json = matches!(json.trim().to_lowercase().as_str(), "1" | "true" | "yes");
        }
        if let Some(cmd) = var("CLAUDE_CMD") {
            self.ai.claude_cmd = cmd;
        }
        if let Some(url) = var("OLLAMA_HTTP") {
            self.ai.ollama_url = url;
        }
        if let Some(model) = var("OLLAMA_MODEL") {
            self.ai.ollama_model = model;
        }
        if let Some(models) = var("TESTFORGE_FALLBACK_MODELS") {
            self.ai.fallback_models = models
                .split(',')
                .map(str::trim)
                .filter(|m| !m.is_empty())
                .map(str::to_string)
                .collect();
        }
    }

    pub fn apply_cli(&mut self, cli: &CliOverrides) {
        if let Some(port) = cli.port {
            self.server.port = port;
        }
        if let Some(path) = &cli.db_path {
            self.server.db_path = path.clone();
        }
        if cli.dev {
            self.server.dev = true;
        }
        if cli.json_logs {
            self.logging.json = true;
        }
    }

    /// Return every problem with the configuration; empty when valid.
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();
        let cap = self.pipeline.max_heal_attempts_cap;
        if !(MIN_HEAL_ATTEMPTS..=MAX_HEAL_ATTEMPTS).contains(&cap) {
            problems.push(format!(
                "pipeline.max_heal_attempts_cap must be between {} and {}, got {}",
                MIN_HEAL_ATTEMPTS, MAX_HEAL_ATTEMPTS, cap
            ));
        }
        if self.ai.fallback_models.iter().any(|m| m.trim().is_empty()) {
            problems.push("ai.fallback_models must not contain empty model names".to_string());
        }
        if self.pipeline.heartbeat_secs == 0 {
            problems.push("pipeline.heartbeat_secs must be greater than 0".to_string());
        }
        if self.progress.keepalive_secs == 0 {
            problems.push("progress.keepalive_secs must be greater than 0".to_string());
        }
        if self.progress.pong_timeout_secs <= self.progress.keepalive_secs {
            problems.push(format!(
                "progress.pong_timeout_secs ({}) must exceed progress.keepalive_secs ({})",
                self.progress.pong_timeout_secs, self.progress.keepalive_secs
            ));
        }
        let timeouts = [
            ("discovery_secs", self.timeouts.discovery_secs),
            ("recording_secs", self.timeouts.recording_secs),
            ("generation_secs", self.timeouts.generation_secs),
            ("healing_secs", self.timeouts.healing_secs),
            ("request_secs", self.timeouts.request_secs),
        ];
        for (name, secs) in timeouts {
            if secs == 0 {
                problems.push(format!("timeouts.{} must be greater than 0", name));
            }
        }
        problems
    }

    pub fn phase_timeouts(&self) -> PhaseTimeouts {
        PhaseTimeouts {
            discovery: Duration::from_secs(self.timeouts.discovery_secs),
            recording: Duration::from_secs(self.timeouts.recording_secs),
            generation: Duration::from_secs(self.timeouts.generation_secs),
            healing: Duration::from_secs(self.timeouts.healing_secs),
        }
    }

    pub fn runner_settings(&self) -> RunnerSettings {
        RunnerSettings {
            max_heal_attempts_cap: self.pipeline.max_heal_attempts_cap,
            max_concurrent_runs: self.pipeline.max_concurrent_runs,
            shutdown_grace: Duration::from_secs(self.pipeline.shutdown_grace_secs),
            lease: InstanceLease::new(Duration::from_secs(self.pipeline.heartbeat_secs)),
        }
    }

    pub fn keepalive(&self) -> Keepalive {
        Keepalive {
            interval: Duration::from_secs(self.progress.keepalive_secs),
            pong_timeout: Duration::from_secs(self.progress.pong_timeout_secs),
        }
    }
}

pub fn default_path() -> PathBuf {
    Path::new(CONFIG_DIR).join(CONFIG_FILE)
}

fn parse_var<T: std::str::FromStr>(var: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = var(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(key, value = %raw, "Ignoring unparseable environment override");
            None
        }
    }
}
