use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::ConfigError;
use crate::pipeline::scenarios::{self, AUTO_SCENARIO};

pub type RunId = Uuid;

/// Bounds accepted for a request's `maxHealAttempts`.
pub const MIN_HEAL_ATTEMPTS: u32 = 1;
pub const MAX_HEAL_ATTEMPTS: u32 = 5;
pub const DEFAULT_HEAL_ATTEMPTS: u32 = 3;

// ── Enums ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    Ai,
    Record,
    Hybrid,
}

impl RunMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ai => "ai",
            Self::Record => "record",
            Self::Hybrid => "hybrid",
        }
    }

    /// Work phases in the order a run of this mode walks them, between
    /// `starting` and the terminal phase.
    pub fn phase_sequence(&self) -> &'static [Phase] {
        match self {
            Self::Ai => &[Phase::Discovery, Phase::Generation, Phase::Execution],
            Self::Record => &[Phase::Recording, Phase::Execution],
            Self::Hybrid => &[Phase::Recording, Phase::Generation, Phase::Execution],
        }
    }

    /// Whether a failing execution in this mode enters the healing loop.
    pub fn heals(&self) -> bool {
        !matches!(self, Self::Record)
    }

    /// The phase that follows `current` in this mode's sequence, if any.
    pub fn next_phase(&self, current: Phase) -> Option<Phase> {
        let sequence = self.phase_sequence();
        if current == Phase::Starting {
            return sequence.first().copied();
        }
        let idx = sequence.iter().position(|p| *p == current)?;
        sequence.get(idx + 1).copied()
    }
}

impl FromStr for RunMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ai" => Ok(Self::Ai),
            "record" => Ok(Self::Record),
            "hybrid" => Ok(Self::Hybrid),
            _ => Err(format!("Invalid run mode: {}", s)),
        }
    }
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Valid status transitions. A terminal status is final.
    pub fn can_transition_to(&self, to: RunStatus) -> bool {
        matches!(
            (self, to),
            (Self::Queued, Self::Running)
                | (Self::Queued, Self::Failed)
                | (Self::Queued, Self::Cancelled)
                | (Self::Running, Self::Completed)
                | (Self::Running, Self::Failed)
                | (Self::Running, Self::Cancelled)
        )
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(format!("Invalid run status: {}", s)),
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Position of a run in its pipeline. Ordering follows declaration order and
/// only drives map ordering in `phaseResults`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Starting,
    Discovery,
    Recording,
    Generation,
    Execution,
    Healing,
    Completed,
    Failed,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Discovery => "discovery",
            Self::Recording => "recording",
            Self::Generation => "generation",
            Self::Execution => "execution",
            Self::Healing => "healing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Progress milestones `(on_enter, on_complete)` for this phase.
    pub fn milestones(&self) -> (u8, u8) {
        match self {
            Self::Starting => (0, 10),
            Self::Discovery | Self::Recording => (10, 30),
            Self::Generation => (30, 60),
            Self::Execution => (60, 85),
            Self::Healing => (85, 100),
            Self::Completed => (100, 100),
            Self::Failed => (100, 100),
        }
    }

    /// Whether a run of `mode` may move from `self` to `to`.
    ///
    /// Phases only move forward along the mode's sequence, except for the
    /// `execution -> healing -> execution` loop in modes that heal.
    pub fn can_advance(&self, mode: RunMode, to: Phase) -> bool {
        if self.is_terminal() {
            return false;
        }
        match (self, to) {
            (_, Phase::Failed) => true,
            (Phase::Execution, Phase::Completed) => true,
            (_, Phase::Completed) => false,
            (Phase::Execution, Phase::Healing) => mode.heals(),
            (Phase::Healing, Phase::Execution) => mode.heals(),
            (_, Phase::Healing) => false,
            (from, to) => mode.next_phase(*from) == Some(to),
        }
    }
}

impl FromStr for Phase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "starting" => Ok(Self::Starting),
            "discovery" => Ok(Self::Discovery),
            "recording" => Ok(Self::Recording),
            "generation" => Ok(Self::Generation),
            "execution" => Ok(Self::Execution),
            "healing" => Ok(Self::Healing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid phase: {}", s)),
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Preset {
    Quick,
    Balanced,
    Deep,
}

/// Crawl and execution limits selected by a preset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PresetSettings {
    pub depth: u32,
    pub max_pages: usize,
    pub execution_timeout: Duration,
}

impl Preset {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Quick => "quick",
            Self::Balanced => "balanced",
            Self::Deep => "deep",
        }
    }

    pub fn settings(&self) -> PresetSettings {
        match self {
            Self::Quick => PresetSettings {
                depth: 1,
                max_pages: 5,
                execution_timeout: Duration::from_secs(180),
            },
            Self::Balanced => PresetSettings {
                depth: 1,
                max_pages: 15,
                execution_timeout: Duration::from_secs(300),
            },
            Self::Deep => PresetSettings {
                depth: 2,
                max_pages: 30,
                execution_timeout: Duration::from_secs(600),
            },
        }
    }
}

impl FromStr for Preset {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "quick" => Ok(Self::Quick),
            "balanced" => Ok(Self::Balanced),
            "deep" => Ok(Self::Deep),
            _ => Err(format!("Invalid preset: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BrowserVisibility {
    Headless,
    Headed,
}

impl BrowserVisibility {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Headless => "headless",
            Self::Headed => "headed",
        }
    }
}

impl FromStr for BrowserVisibility {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "headless" => Ok(Self::Headless),
            "headed" => Ok(Self::Headed),
            _ => Err(format!("Invalid browser visibility: {}", s)),
        }
    }
}

// ── Run configuration ─────────────────────────────────────────────────

/// Raw run submission as received from a client.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunRequest {
    pub url: String,
    #[serde(default)]
    pub mode: Option<String>,
    #[serde(default)]
    pub story: Option<String>,
    #[serde(default)]
    pub preset: Option<String>,
    #[serde(default)]
    pub browser_visibility: Option<String>,
    #[serde(default)]
    pub auto_heal: Option<bool>,
    #[serde(default)]
    pub max_heal_attempts: Option<i64>,
    /// Scenario template id, or `auto`.
    #[serde(default)]
    pub scenario: Option<String>,
}

impl RunRequest {
    /// Validate the request into an immutable `RunConfig`.
    ///
    /// `heal_cap` is the service-wide ceiling on healing attempts; an in-range
    /// request above it is clamped down rather than rejected.
    pub fn validate(&self, heal_cap: u32) -> Result<RunConfig, ConfigError> {
        let url = validate_url(&self.url)?;

        let mode = match self.mode.as_deref() {
            None => RunMode::Ai,
            Some(raw) => RunMode::from_str(raw.trim())
                .map_err(|_| ConfigError::UnknownMode(raw.to_string()))?,
        };
        let preset = match self.preset.as_deref() {
            None => Preset::Balanced,
            Some(raw) => Preset::from_str(raw.trim())
                .map_err(|_| ConfigError::UnknownPreset(raw.to_string()))?,
        };
        let browser_visibility = match self.browser_visibility.as_deref() {
            None => BrowserVisibility::Headless,
            Some(raw) => BrowserVisibility::from_str(raw.trim())
                .map_err(|_| ConfigError::UnknownVisibility(raw.to_string()))?,
        };

        let requested = self
            .max_heal_attempts
            .unwrap_or(i64::from(DEFAULT_HEAL_ATTEMPTS));
        if requested < i64::from(MIN_HEAL_ATTEMPTS) || requested > i64::from(MAX_HEAL_ATTEMPTS) {
            return Err(ConfigError::HealAttemptsOutOfRange {
                value: requested,
                min: MIN_HEAL_ATTEMPTS,
                max: MAX_HEAL_ATTEMPTS,
            });
        }
        let cap = heal_cap.clamp(MIN_HEAL_ATTEMPTS, MAX_HEAL_ATTEMPTS);
        let max_heal_attempts = (requested as u32).min(cap);

        let story = self
            .story
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string);

        let scenario = match self.scenario.as_deref().map(str::trim) {
            None | Some("") => None,
            Some(AUTO_SCENARIO) => Some(AUTO_SCENARIO.to_string()),
            Some(id) => match scenarios::find(id) {
                Some(template) => Some(template.id.to_string()),
                None => return Err(ConfigError::UnknownScenario(id.to_string())),
            },
        };

        Ok(RunConfig {
            url,
            mode,
            story,
            scenario,
            preset,
            browser_visibility,
            auto_heal: self.auto_heal.unwrap_or(true),
            max_heal_attempts,
        })
    }
}

fn validate_url(raw: &str) -> Result<String, ConfigError> {
    let invalid = |reason: &str| ConfigError::InvalidUrl {
        url: raw.to_string(),
        reason: reason.to_string(),
    };
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(invalid("URL is empty"));
    }
    let parsed = reqwest::Url::parse(trimmed).map_err(|e| invalid(&e.to_string()))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(invalid("scheme must be http or https"));
    }
    if parsed.host_str().is_none_or(str::is_empty) {
        return Err(invalid("URL has no host"));
    }
    Ok(parsed.to_string())
}

/// Validated, immutable configuration of a run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RunConfig {
    pub url: String,
    pub mode: RunMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub story: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scenario: Option<String>,
    pub preset: Preset,
    pub browser_visibility: BrowserVisibility,
    pub auto_heal: bool,
    pub max_heal_attempts: u32,
}

// ── Phase results ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ElementKind {
    Link,
    Button,
    Input,
    Select,
    TextArea,
    Form,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PageElement {
    pub kind: ElementKind,
    pub selector: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveredPage {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub depth: u32,
    pub elements: Vec<PageElement>,
    pub links: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveryResult {
    pub pages: Vec<DiscoveredPage>,
    pub pages_count: usize,
    pub elements_count: usize,
}

impl DiscoveryResult {
    pub fn from_pages(pages: Vec<DiscoveredPage>) -> Self {
        let elements_count = pages.iter().map(|p| p.elements.len()).sum();
        Self {
            pages_count: pages.len(),
            elements_count,
            pages,
        }
    }
}

/// Distinct selectors across all discovered pages, in discovery order.
pub fn selectors_of(pages: &[DiscoveredPage]) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    pages
        .iter()
        .flat_map(|p| p.elements.iter())
        .filter(|e| seen.insert(e.selector.clone()))
        .map(|e| e.selector.clone())
        .collect()
}

/// A test file produced by generation, recording or healing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GeneratedFile {
    pub name: String,
    pub content: String,
}

impl GeneratedFile {
    pub fn new(name: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            content: content.into(),
        }
    }

    pub fn summary(&self) -> TestFileSummary {
        TestFileSummary {
            name: self.name.clone(),
            lines: self.content.lines().count(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TestFileSummary {
    pub name: String,
    pub lines: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GenerationResult {
    pub files: Vec<TestFileSummary>,
    pub model: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Navigation,
    Click,
    Input,
    Select,
    Check,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RecordedAction {
    pub kind: ActionKind,
    pub line: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RecordingResult {
    pub file: TestFileSummary,
    pub actions: Vec<RecordedAction>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TestOutcome {
    Passed,
    Failed,
    Skipped,
    Error,
}

impl TestOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Passed => "passed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for TestOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TestOutcome {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "passed" => Ok(Self::Passed),
            "failed" => Ok(Self::Failed),
            "skipped" | "xfailed" => Ok(Self::Skipped),
            "error" | "xpassed" => Ok(Self::Error),
            _ => Err(format!("Invalid test outcome: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TestCaseResult {
    pub id: String,
    pub file: String,
    pub name: String,
    pub outcome: TestOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TestSummary {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub errors: usize,
}

impl TestSummary {
    pub fn from_tests(tests: &[TestCaseResult]) -> Self {
        let mut summary = Self {
            total: tests.len(),
            ..Self::default()
        };
        for test in tests {
            match test.outcome {
                TestOutcome::Passed => summary.passed += 1,
                TestOutcome::Failed => summary.failed += 1,
                TestOutcome::Skipped => summary.skipped += 1,
                TestOutcome::Error => summary.errors += 1,
            }
        }
        summary
    }
}

/// What a test runner reports for one invocation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecutionReport {
    pub tests: Vec<TestCaseResult>,
    pub process_exit_code: Option<i32>,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    /// 0 for the first run, `k` for the rerun after healing attempt `k`.
    pub attempt: u32,
    pub summary: TestSummary,
    pub tests: Vec<TestCaseResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub process_exit_code: Option<i32>,
    pub duration_ms: u64,
    /// Runner-level failure (crash, timeout) with no per-test data.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ExecutionResult {
    pub fn from_report(attempt: u32, report: ExecutionReport) -> Self {
        Self {
            attempt,
            summary: TestSummary::from_tests(&report.tests),
            tests: report.tests,
            process_exit_code: report.process_exit_code,
            duration_ms: report.duration_ms,
            error: None,
        }
    }

    pub fn from_runner_error(attempt: u32, message: impl Into<String>) -> Self {
        Self {
            attempt,
            summary: TestSummary::default(),
            tests: Vec::new(),
            process_exit_code: None,
            duration_ms: 0,
            error: Some(message.into()),
        }
    }

    /// Passed means at least one test ran and every test passed.
    pub fn passed(&self) -> bool {
        self.error.is_none()
            && !self.tests.is_empty()
            && self.tests.iter().all(|t| t.outcome == TestOutcome::Passed)
    }

    pub fn failing_tests(&self) -> impl Iterator<Item = &TestCaseResult> {
        self.tests
            .iter()
            .filter(|t| t.outcome != TestOutcome::Passed)
    }

    pub fn failing_count(&self) -> usize {
        self.failing_tests().count()
    }
}

/// One file's proposed fix within a healing attempt.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProposedFix {
    pub file: String,
    pub tests: Vec<String>,
    pub original_code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proposed_fix: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issue: Option<String>,
    /// Adapter failure for this file; the file is left unchanged.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub applied: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HealingAttempt {
    pub attempt: u32,
    pub fixes: Vec<ProposedFix>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<TestSummary>,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

/// Aggregate healing outcome exposed at `/api/runs/{id}/healing`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct HealingReport {
    pub attempts: Vec<HealingAttempt>,
    pub healed: bool,
    pub healing_attempts: usize,
    pub final_result: Option<ExecutionResult>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PhaseFailure {
    pub message: String,
    pub retryable: bool,
}

/// Committed output of a phase, keyed by phase name in `phaseResults`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", content = "output", rename_all = "snake_case")]
pub enum PhaseResult {
    Discovery(DiscoveryResult),
    Generation(GenerationResult),
    Recording(RecordingResult),
    Execution(ExecutionResult),
    Healing(HealingReport),
    Failed(PhaseFailure),
}

// ── Run record ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunError {
    pub phase: Phase,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RunRecord {
    pub id: RunId,
    pub mode: RunMode,
    pub config: RunConfig,
    pub status: RunStatus,
    pub phase: Phase,
    pub progress: u8,
    pub phase_results: BTreeMap<Phase, PhaseResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RunError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub healed: Option<bool>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl RunRecord {
    pub fn execution(&self) -> Option<&ExecutionResult> {
        match self.phase_results.get(&Phase::Execution) {
            Some(PhaseResult::Execution(result)) => Some(result),
            _ => None,
        }
    }

    pub fn healing_report(&self) -> HealingReport {
        match self.phase_results.get(&Phase::Healing) {
            Some(PhaseResult::Healing(report)) => report.clone(),
            _ => HealingReport::default(),
        }
    }
}

/// Row of the run listing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub id: RunId,
    pub mode: RunMode,
    pub url: String,
    pub status: RunStatus,
    pub phase: Phase,
    pub progress: u8,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RunLogLine {
    pub message: String,
    pub created_at: DateTime<Utc>,
}
