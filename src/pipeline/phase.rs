//! Runs one pipeline phase against its executor and makes the output durable.
//!
//! Every executor call is bounded by a timeout and every result is written to
//! the artifact store before `run` returns `Ok`, so a committed phase always
//! has its artifacts on disk.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use super::ai::{AiAdapter, FixProposal, FixRequest, GenerationContext};
use super::artifacts::{ArtifactStore, SUITE_KEY, healing_snapshot_key};
use super::browser::{BrowserDriver, ExecutionOptions};
use super::models::*;
use super::recorder;
use super::scenarios;
use crate::errors::PhaseError;

/// Per-phase executor deadlines. Execution uses the run preset's timeout.
#[derive(Debug, Clone, Copy)]
pub struct PhaseTimeouts {
    pub discovery: Duration,
    pub recording: Duration,
    pub generation: Duration,
    /// Deadline for a single fix proposal.
    pub healing: Duration,
}

impl Default for PhaseTimeouts {
    fn default() -> Self {
        Self {
            discovery: Duration::from_secs(300),
            recording: Duration::from_secs(600),
            generation: Duration::from_secs(300),
            healing: Duration::from_secs(120),
        }
    }
}

/// Inputs accumulated by earlier phases of the same run.
#[derive(Debug, Clone, Copy)]
pub struct PhaseContext<'a> {
    pub run_id: RunId,
    pub config: &'a RunConfig,
    pub pages: &'a [DiscoveredPage],
    pub recorded: Option<&'a GeneratedFile>,
    /// Current test suite.
    pub files: &'a [GeneratedFile],
    /// Execution attempt number (0 before any healing).
    pub attempt: u32,
}

/// Output of a successfully completed phase.
#[derive(Debug, Clone)]
pub enum PhaseOutput {
    Discovery(DiscoveryResult),
    Recording {
        result: RecordingResult,
        file: GeneratedFile,
    },
    /// `files` is the whole suite, including a recorded test in hybrid mode.
    Generation {
        result: GenerationResult,
        files: Vec<GeneratedFile>,
    },
    Execution(ExecutionResult),
}

impl PhaseOutput {
    pub fn phase(&self) -> Phase {
        match self {
            Self::Discovery(_) => Phase::Discovery,
            Self::Recording { .. } => Phase::Recording,
            Self::Generation { .. } => Phase::Generation,
            Self::Execution(_) => Phase::Execution,
        }
    }

    pub fn to_result(&self) -> PhaseResult {
        match self {
            Self::Discovery(r) => PhaseResult::Discovery(r.clone()),
            Self::Recording { result, .. } => PhaseResult::Recording(result.clone()),
            Self::Generation { result, .. } => PhaseResult::Generation(result.clone()),
            Self::Execution(r) => PhaseResult::Execution(r.clone()),
        }
    }

    /// Test files this phase adds to or replaces in the suite.
    fn suite_files(&self) -> &[GeneratedFile] {
        match self {
            Self::Recording { file, .. } => std::slice::from_ref(file),
            Self::Generation { files, .. } => files,
            _ => &[],
        }
    }
}

async fn bounded<T, F>(phase: Phase, after: Duration, fut: F) -> Result<T, PhaseError>
where
    F: Future<Output = anyhow::Result<T>>,
{
    match tokio::time::timeout(after, fut).await {
        Err(_) => Err(PhaseError::Timeout { phase, after }),
        Ok(Err(e)) => Err(PhaseError::Executor {
            phase,
            message: format!("{:#}", e),
        }),
        Ok(Ok(value)) => Ok(value),
    }
}

pub struct PhaseController {
    browser: Arc<dyn BrowserDriver>,
    ai: Arc<dyn AiAdapter>,
    artifacts: Arc<dyn ArtifactStore>,
    timeouts: PhaseTimeouts,
}

impl PhaseController {
    pub fn new(
        browser: Arc<dyn BrowserDriver>,
        ai: Arc<dyn AiAdapter>,
        artifacts: Arc<dyn ArtifactStore>,
        timeouts: PhaseTimeouts,
    ) -> Self {
        Self {
            browser,
            ai,
            artifacts,
            timeouts,
        }
    }

    /// Execute `phase`, persist its output, and only then return it.
    pub async fn run(&self, phase: Phase, ctx: PhaseContext<'_>) -> Result<PhaseOutput, PhaseError> {
        debug!(run_id = %ctx.run_id, %phase, attempt = ctx.attempt, "Running phase");
        let output = match phase {
            Phase::Discovery => self.discover(ctx).await?,
            Phase::Recording => self.record(ctx).await?,
            Phase::Generation => self.generate(ctx).await?,
            Phase::Execution => self.execute(ctx).await?,
            other => {
                return Err(PhaseError::Executor {
                    phase: other,
                    message: format!("{} has no executor", other),
                });
            }
        };
        self.persist(ctx.run_id, &output).await?;
        Ok(output)
    }

    /// Write a phase output (and any suite files it carries) to the artifact store.
    pub async fn persist(&self, run_id: RunId, output: &PhaseOutput) -> Result<(), PhaseError> {
        let phase = output.phase();
        let persistence = |source| PhaseError::Persistence { phase, source };
        let files = output.suite_files();
        if !files.is_empty() {
            self.artifacts
                .save_files(run_id, SUITE_KEY, files)
                .await
                .map_err(persistence)?;
        }
        let value = serde_json::to_value(output.to_result())
            .map_err(|e| persistence(anyhow::Error::new(e)))?;
        self.artifacts
            .save_phase_output(run_id, phase, &value)
            .await
            .map_err(persistence)
    }

    /// Ask the AI adapter for a fix, bounded by the healing timeout.
    pub async fn propose_fix(&self, request: &FixRequest) -> Result<FixProposal, PhaseError> {
        bounded(
            Phase::Healing,
            self.timeouts.healing,
            self.ai.propose_fix(request),
        )
        .await
    }

    /// Persist a healed suite: the live copy and the attempt's snapshot.
    pub async fn save_healed_suite(
        &self,
        run_id: RunId,
        attempt: u32,
        files: &[GeneratedFile],
    ) -> Result<(), PhaseError> {
        let persistence = |source| PhaseError::Persistence {
            phase: Phase::Healing,
            source,
        };
        self.artifacts
            .save_files(run_id, &healing_snapshot_key(attempt), files)
            .await
            .map_err(persistence)?;
        self.artifacts
            .save_files(run_id, SUITE_KEY, files)
            .await
            .map_err(persistence)
    }

    async fn discover(&self, ctx: PhaseContext<'_>) -> Result<PhaseOutput, PhaseError> {
        let settings = ctx.config.preset.settings();
        let pages = bounded(
            Phase::Discovery,
            self.timeouts.discovery,
            self.browser
                .crawl(&ctx.config.url, settings.depth, settings.max_pages),
        )
        .await?;
        if pages.is_empty() {
            return Err(PhaseError::EmptyOutput {
                phase: Phase::Discovery,
                reason: format!("no pages discovered at {}", ctx.config.url),
            });
        }
        let result = DiscoveryResult::from_pages(pages);
        info!(run_id = %ctx.run_id, pages = result.pages_count, elements = result.elements_count, "Discovery complete");
        Ok(PhaseOutput::Discovery(result))
    }

    async fn record(&self, ctx: PhaseContext<'_>) -> Result<PhaseOutput, PhaseError> {
        let script = bounded(
            Phase::Recording,
            self.timeouts.recording,
            self.browser.record(ctx.run_id, &ctx.config.url),
        )
        .await?;
        let actions = recorder::classify_actions(&script);
        if actions.is_empty() {
            return Err(PhaseError::EmptyOutput {
                phase: Phase::Recording,
                reason: "recording contains no page interactions".to_string(),
            });
        }
        let file = GeneratedFile::new(recorder::RECORDED_TEST_FILE, recorder::to_pytest(&script));
        info!(run_id = %ctx.run_id, actions = actions.len(), "Recording complete");
        Ok(PhaseOutput::Recording {
            result: RecordingResult {
                file: file.summary(),
                actions,
            },
            file,
        })
    }

    async fn generate(&self, ctx: PhaseContext<'_>) -> Result<PhaseOutput, PhaseError> {
        let gen_ctx = GenerationContext {
            url: ctx.config.url.clone(),
            story: ctx.config.story.clone(),
            pages: ctx.pages.to_vec(),
            recorded: ctx.recorded.cloned(),
            scenario: scenarios::resolve(ctx.config.scenario.as_deref(), ctx.pages),
        };
        if let Some(template) = gen_ctx.scenario {
            debug!(run_id = %ctx.run_id, scenario = template.id, "Generating for scenario");
        }
        let suite = bounded(
            Phase::Generation,
            self.timeouts.generation,
            self.ai.generate_tests(&gen_ctx),
        )
        .await?;

        let mut files: Vec<GeneratedFile> = ctx.recorded.into_iter().cloned().collect();
        for file in suite.files {
            if !files.iter().any(|f| f.name == file.name) {
                files.push(file);
            }
        }
        if files.len() == usize::from(ctx.recorded.is_some()) {
            return Err(PhaseError::EmptyOutput {
                phase: Phase::Generation,
                reason: "model produced no test files".to_string(),
            });
        }
        info!(run_id = %ctx.run_id, files = files.len(), model = %suite.model, "Generation complete");
        Ok(PhaseOutput::Generation {
            result: GenerationResult {
                files: files.iter().map(GeneratedFile::summary).collect(),
                model: suite.model,
            },
            files,
        })
    }

    async fn execute(&self, ctx: PhaseContext<'_>) -> Result<PhaseOutput, PhaseError> {
        if ctx.files.is_empty() {
            return Err(PhaseError::EmptyOutput {
                phase: Phase::Execution,
                reason: "no test files to run".to_string(),
            });
        }
        let options = ExecutionOptions {
            headed: ctx.config.browser_visibility == BrowserVisibility::Headed,
            attempt: ctx.attempt,
        };
        let report = bounded(
            Phase::Execution,
            ctx.config.preset.settings().execution_timeout,
            self.browser.run_tests(ctx.run_id, ctx.files, &options),
        )
        .await?;
        let result = ExecutionResult::from_report(ctx.attempt, report);
        info!(
            run_id = %ctx.run_id,
            attempt = ctx.attempt,
            passed = result.summary.passed,
            failing = result.failing_count(),
            "Execution complete"
        );
        Ok(PhaseOutput::Execution(result))
    }
}
