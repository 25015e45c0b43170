//! Scripted executors and fixtures shared by the pipeline's unit tests.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use super::ai::{AiAdapter, FixProposal, FixRequest, GeneratedSuite, GenerationContext};
use super::artifacts::{ArtifactStore, SUITE_KEY, healing_snapshot_key};
use super::browser::{BrowserDriver, ExecutionOptions};
use super::db::{DbHandle, RunDb};
use super::models::*;
use super::phase::{PhaseController, PhaseTimeouts};
use super::progress::ProgressHub;
use super::runner::{PipelineRunner, RunnerSettings};

pub const FIXED_SOURCE: &str = "async def test_home(page):\n    await page.goto(\"https://example.com/\")\n";

// ── Fixtures ─────────────────────────────────────────────────────────

pub fn config(mode: RunMode) -> RunConfig {
    RunConfig {
        url: "https://example.com/".to_string(),
        mode,
        story: None,
        scenario: None,
        preset: Preset::Balanced,
        browser_visibility: BrowserVisibility::Headless,
        auto_heal: true,
        max_heal_attempts: DEFAULT_HEAL_ATTEMPTS,
    }
}

pub fn record(mode: RunMode) -> RunRecord {
    RunRecord {
        id: Uuid::new_v4(),
        mode,
        config: config(mode),
        status: RunStatus::Queued,
        phase: Phase::Starting,
        progress: 0,
        phase_results: Default::default(),
        error: None,
        exit_code: None,
        healed: None,
        created_at: Utc::now(),
        started_at: None,
        completed_at: None,
    }
}

pub fn request(mode: &str, max_heal_attempts: Option<i64>) -> RunRequest {
    RunRequest {
        url: "https://example.com/".to_string(),
        mode: Some(mode.to_string()),
        max_heal_attempts,
        ..RunRequest::default()
    }
}

pub fn page(url: &str) -> DiscoveredPage {
    DiscoveredPage {
        url: url.to_string(),
        title: Some("Example".to_string()),
        depth: 0,
        elements: vec![PageElement {
            kind: ElementKind::Button,
            selector: "[data-testid=\"submit\"]".to_string(),
            text: Some("Submit".to_string()),
        }],
        links: Vec::new(),
    }
}

fn report(files: &[&str], outcome: TestOutcome) -> ExecutionReport {
    let tests = files
        .iter()
        .map(|file| {
            let name = format!("test_{}", file.trim_start_matches("test_").trim_end_matches(".py"));
            TestCaseResult {
                id: format!("tests/{}::{}", file, name),
                file: file.to_string(),
                name,
                outcome,
                duration_ms: Some(12),
                error: (outcome != TestOutcome::Passed)
                    .then(|| "AssertionError: locator not found".to_string()),
            }
        })
        .collect();
    ExecutionReport {
        tests,
        process_exit_code: Some(i32::from(outcome != TestOutcome::Passed)),
        duration_ms: 120,
    }
}

pub fn passing_report(files: &[&str]) -> ExecutionReport {
    report(files, TestOutcome::Passed)
}

pub fn failing_report(files: &[&str]) -> ExecutionReport {
    report(files, TestOutcome::Failed)
}

pub fn fix_proposal(fix: &str) -> FixProposal {
    FixProposal {
        fix: fix.to_string(),
        confidence: 0.8,
        issue: "selector changed".to_string(),
    }
}

/// Pop the next scripted item; the last one repeats.
fn next_scripted<T: Clone>(script: &Mutex<VecDeque<T>>) -> Option<T> {
    let mut script = script.lock().unwrap();
    if script.len() > 1 {
        script.pop_front()
    } else {
        script.front().cloned()
    }
}

// ── Browser ──────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct BrowserCalls {
    pub crawls: usize,
    pub recordings: usize,
    /// `(attempt, headed)` per `run_tests` call.
    pub executions: Vec<(u32, bool)>,
    /// Suite passed to each `run_tests` call.
    pub suites: Vec<Vec<GeneratedFile>>,
}

#[derive(Clone, Default)]
pub struct FakeBrowser {
    pages: Vec<DiscoveredPage>,
    crawl_error: Option<String>,
    recording: Option<String>,
    delay: Option<Duration>,
    reports: Arc<Mutex<VecDeque<Result<ExecutionReport, String>>>>,
    calls: Arc<Mutex<BrowserCalls>>,
}

impl FakeBrowser {
    pub fn with_pages(mut self, pages: Vec<DiscoveredPage>) -> Self {
        self.pages = pages;
        self
    }

    pub fn with_crawl_error(mut self, message: &str) -> Self {
        self.crawl_error = Some(message.to_string());
        self
    }

    pub fn with_recording(mut self, script: &str) -> Self {
        self.recording = Some(script.to_string());
        self
    }

    /// Delay every call by `delay`.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Scripted `run_tests` results. Without a script every file passes.
    pub fn with_reports(self, reports: Vec<Result<ExecutionReport, String>>) -> Self {
        *self.reports.lock().unwrap() = reports.into();
        self
    }

    pub fn calls(&self) -> Arc<Mutex<BrowserCalls>> {
        Arc::clone(&self.calls)
    }

    async fn pause(&self) {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl BrowserDriver for FakeBrowser {
    async fn crawl(&self, _url: &str, _depth: u32, _max_pages: usize) -> Result<Vec<DiscoveredPage>> {
        self.calls.lock().unwrap().crawls += 1;
        self.pause().await;
        match &self.crawl_error {
            Some(message) => Err(anyhow!("{}", message)),
            None => Ok(self.pages.clone()),
        }
    }

    async fn record(&self, _run_id: RunId, _url: &str) -> Result<String> {
        self.calls.lock().unwrap().recordings += 1;
        self.pause().await;
        self.recording
            .clone()
            .ok_or_else(|| anyhow!("no recording scripted"))
    }

    async fn run_tests(
        &self,
        _run_id: RunId,
        files: &[GeneratedFile],
        options: &ExecutionOptions,
    ) -> Result<ExecutionReport> {
        {
            let mut calls = self.calls.lock().unwrap();
            calls.executions.push((options.attempt, options.headed));
            calls.suites.push(files.to_vec());
        }
        self.pause().await;
        match next_scripted(&self.reports) {
            Some(Ok(report)) => Ok(report),
            Some(Err(message)) => Err(anyhow!("{}", message)),
            None => {
                let names: Vec<&str> = files.iter().map(|f| f.name.as_str()).collect();
                Ok(passing_report(&names))
            }
        }
    }
}

// ── AI ───────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct FakeAi {
    suite: Vec<GeneratedFile>,
    fixes: Arc<Mutex<VecDeque<Result<FixProposal, String>>>>,
    requests: Arc<Mutex<Vec<FixRequest>>>,
    scenarios: Arc<Mutex<Vec<Option<&'static str>>>>,
}

impl Default for FakeAi {
    fn default() -> Self {
        Self {
            suite: vec![GeneratedFile::new(
                "test_home.py",
                "async def test_home(page):\n    await page.goto(\"https://example.com/old\")\n",
            )],
            fixes: Arc::new(Mutex::new(VecDeque::from([Ok(fix_proposal(FIXED_SOURCE))]))),
            requests: Arc::default(),
            scenarios: Arc::default(),
        }
    }
}

impl FakeAi {
    pub fn with_suite(mut self, files: Vec<GeneratedFile>) -> Self {
        self.suite = files;
        self
    }

    /// Scripted fix results; the last one repeats.
    pub fn with_fixes(self, fixes: Vec<Result<FixProposal, String>>) -> Self {
        *self.fixes.lock().unwrap() = fixes.into();
        self
    }

    pub fn fix_requests(&self) -> Vec<FixRequest> {
        self.requests.lock().unwrap().clone()
    }

    /// Scenario template id seen by each generation call.
    pub fn generation_scenarios(&self) -> Vec<Option<&'static str>> {
        self.scenarios.lock().unwrap().clone()
    }
}

#[async_trait]
impl AiAdapter for FakeAi {
    async fn generate_tests(&self, ctx: &GenerationContext) -> Result<GeneratedSuite> {
        self.scenarios.lock().unwrap().push(ctx.scenario.map(|t| t.id));
        Ok(GeneratedSuite {
            files: self.suite.clone(),
            model: "fake-model".to_string(),
        })
    }

    async fn propose_fix(&self, request: &FixRequest) -> Result<FixProposal> {
        self.requests.lock().unwrap().push(request.clone());
        match next_scripted(&self.fixes) {
            Some(Ok(fix)) => Ok(fix),
            Some(Err(message)) => Err(anyhow!("{}", message)),
            None => Err(anyhow!("no fix scripted")),
        }
    }
}

// ── Artifacts ────────────────────────────────────────────────────────

#[derive(Default)]
pub struct FakeArtifacts {
    fail: bool,
    outputs: Mutex<HashMap<(RunId, Phase), serde_json::Value>>,
    files: Mutex<HashMap<(RunId, String), Vec<GeneratedFile>>>,
}

impl FakeArtifacts {
    /// A store whose every write fails.
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn has_phase_output(&self, run_id: RunId, phase: Phase) -> bool {
        self.outputs.lock().unwrap().contains_key(&(run_id, phase))
    }

    pub fn suite(&self, run_id: RunId) -> Vec<GeneratedFile> {
        self.stored(run_id, SUITE_KEY)
    }

    pub fn snapshot(&self, run_id: RunId, attempt: u32) -> Vec<GeneratedFile> {
        self.stored(run_id, &healing_snapshot_key(attempt))
    }

    fn stored(&self, run_id: RunId, key: &str) -> Vec<GeneratedFile> {
        self.files
            .lock()
            .unwrap()
            .get(&(run_id, key.to_string()))
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl ArtifactStore for FakeArtifacts {
    async fn save_phase_output(
        &self,
        run_id: RunId,
        phase: Phase,
        output: &serde_json::Value,
    ) -> Result<()> {
        if self.fail {
            return Err(anyhow!("disk full"));
        }
        self.outputs
            .lock()
            .unwrap()
            .insert((run_id, phase), output.clone());
        Ok(())
    }

    async fn save_files(&self, run_id: RunId, key: &str, files: &[GeneratedFile]) -> Result<()> {
        if self.fail {
            return Err(anyhow!("disk full"));
        }
        let mut stored = self.files.lock().unwrap();
        let entry = stored.entry((run_id, key.to_string())).or_default();
        for file in files {
            match entry.iter_mut().find(|f| f.name == file.name) {
                Some(existing) => existing.content = file.content.clone(),
                None => entry.push(file.clone()),
            }
        }
        Ok(())
    }

    async fn load_files(&self, run_id: RunId, key: &str) -> Result<Vec<GeneratedFile>> {
        let mut files = self.stored(run_id, key);
        files.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(files)
    }
}

// ── Runner stack ─────────────────────────────────────────────────────

/// A runner wired to fakes and an in-memory database.
pub struct TestStack {
    pub runner: PipelineRunner,
    pub browser: FakeBrowser,
    pub ai: FakeAi,
    pub artifacts: Arc<FakeArtifacts>,
}

impl TestStack {
    pub fn new(browser: FakeBrowser, ai: FakeAi) -> Self {
        Self::build(browser, ai, FakeArtifacts::default(), RunnerSettings::default())
    }

    pub fn with_artifacts(browser: FakeBrowser, ai: FakeAi, artifacts: FakeArtifacts) -> Self {
        Self::build(browser, ai, artifacts, RunnerSettings::default())
    }

    pub fn with_settings(browser: FakeBrowser, ai: FakeAi, settings: RunnerSettings) -> Self {
        Self::build(browser, ai, FakeArtifacts::default(), settings)
    }

    /// A stack over a caller-supplied database, e.g. a file shared with
    /// another connection.
    pub fn on_database(browser: FakeBrowser, ai: FakeAi, db: RunDb) -> Self {
        Self::assemble(browser, ai, FakeArtifacts::default(), RunnerSettings::default(), db)
    }

    fn build(
        browser: FakeBrowser,
        ai: FakeAi,
        artifacts: FakeArtifacts,
        settings: RunnerSettings,
    ) -> Self {
        let db = RunDb::new_in_memory().unwrap();
        Self::assemble(browser, ai, artifacts, settings, db)
    }

    fn assemble(
        browser: FakeBrowser,
        ai: FakeAi,
        artifacts: FakeArtifacts,
        settings: RunnerSettings,
        db: RunDb,
    ) -> Self {
        let artifacts = Arc::new(artifacts);
        let controller = PhaseController::new(
            Arc::new(browser.clone()),
            Arc::new(ai.clone()),
            artifacts.clone(),
            PhaseTimeouts::default(),
        );
        let db = DbHandle::new(db);
        let runner = PipelineRunner::new(
            db,
            Arc::new(ProgressHub::default()),
            Arc::new(controller),
            settings,
        );
        Self {
            runner,
            browser,
            ai,
            artifacts,
        }
    }
}
