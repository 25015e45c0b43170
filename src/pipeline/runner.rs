//! Pipeline orchestrator.
//!
//! `PipelineRunner::start` validates a request, creates the run record and
//! spawns one task per run. The task calls `RunTask::advance` until the run
//! reaches a terminal state: each call enters the next phase of the mode's
//! sequence, or, once execution is the last committed phase, decides between
//! completing, failing and another healing attempt.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Semaphore, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::db::{DbHandle, RunDb, RunFinalization};
use super::healing;
use super::models::*;
use super::phase::{PhaseContext, PhaseController, PhaseOutput};
use super::progress::ProgressHub;
use super::ws::WsMessage;
use crate::errors::{PhaseError, PipelineError};

const CANCELLED_MESSAGE: &str = "cancelled by request";

#[derive(Debug, Clone, Copy)]
pub struct RunnerSettings {
    /// Service-wide ceiling on `maxHealAttempts`.
    pub max_heal_attempts_cap: u32,
    /// Runs allowed past `queued` at once; 0 means unlimited.
    pub max_concurrent_runs: usize,
    /// How long `shutdown` waits for tasks to observe cancellation.
    pub shutdown_grace: Duration,
    pub lease: InstanceLease,
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self {
            max_heal_attempts_cap: MAX_HEAL_ATTEMPTS,
            max_concurrent_runs: 0,
            shutdown_grace: Duration::from_secs(10),
            lease: InstanceLease::default(),
        }
    }
}

struct ActiveRun {
    cancel: CancellationToken,
    done: watch::Receiver<bool>,
    handle: JoinHandle<()>,
}

pub struct PipelineRunner {
    db: DbHandle,
    hub: Arc<ProgressHub>,
    controller: Arc<PhaseController>,
    settings: RunnerSettings,
    permits: Option<Arc<Semaphore>>,
    active: Arc<tokio::sync::Mutex<HashMap<RunId, ActiveRun>>>,
}

impl PipelineRunner {
    pub fn new(
        db: DbHandle,
        hub: Arc<ProgressHub>,
        controller: Arc<PhaseController>,
        settings: RunnerSettings,
    ) -> Self {
        let permits = (settings.max_concurrent_runs > 0)
            .then(|| Arc::new(Semaphore::new(settings.max_concurrent_runs)));
        Self {
            db,
            hub,
            controller,
            settings,
            permits,
            active: Arc::new(tokio::sync::Mutex::new(HashMap::new())),
        }
    }

    pub fn hub(&self) -> &Arc<ProgressHub> {
        &self.hub
    }

    pub fn db(&self) -> &DbHandle {
        &self.db
    }

    /// Validate and launch a run. Returns as soon as the record exists; the
    /// pipeline itself runs on its own task.
    pub async fn start(&self, request: &RunRequest) -> Result<RunRecord, PipelineError> {
        let config = request.validate(self.settings.max_heal_attempts_cap)?;
        let run = self
            .db
            .call(move |db| db.create_run(&config))
            .await
            .map_err(PipelineError::Database)?;
        let run_id = run.id;
        info!(run_id = %run_id, mode = %run.mode, url = %run.config.url, "Run created");

        self.hub.open(run_id);
        let cancel = CancellationToken::new();
        let (done_tx, done_rx) = watch::channel(false);
        let task = RunTask {
            run_id,
            config: run.config.clone(),
            phase: Phase::Starting,
            progress: 0,
            db: self.db.clone(),
            hub: Arc::clone(&self.hub),
            controller: Arc::clone(&self.controller),
            cancel: cancel.clone(),
            state: RunState::default(),
        };
        let permits = self.permits.clone();
        let active = Arc::clone(&self.active);

        // Hold the registry lock across the spawn so the task's own removal
        // always happens after its insertion.
        let mut registry = self.active.lock().await;
        let handle = tokio::spawn(async move {
            task.drive(permits).await;
            active.lock().await.remove(&run_id);
            let _ = done_tx.send(true);
        });
        registry.insert(
            run_id,
            ActiveRun {
                cancel,
                done: done_rx,
                handle,
            },
        );
        Ok(run)
    }

    pub async fn snapshot(&self, run_id: RunId) -> Result<RunRecord, PipelineError> {
        self.db
            .call(move |db| db.get_run(run_id))
            .await
            .map_err(PipelineError::Database)?
            .ok_or(PipelineError::RunNotFound { id: run_id })
    }

    pub async fn list(&self, limit: usize) -> Result<Vec<RunSummary>, PipelineError> {
        self.db
            .call(move |db| db.list_runs(limit))
            .await
            .map_err(PipelineError::Database)
    }

    pub async fn logs(&self, run_id: RunId) -> Result<Vec<RunLogLine>, PipelineError> {
        self.snapshot(run_id).await?;
        self.db
            .call(move |db| db.get_logs(run_id))
            .await
            .map_err(PipelineError::Database)
    }

    /// Request cancellation. The run's task observes it at its next phase
    /// boundary; the returned record is the state at request time.
    pub async fn cancel(&self, run_id: RunId) -> Result<RunRecord, PipelineError> {
        let run = self.snapshot(run_id).await?;
        if run.status.is_terminal() {
            return Err(PipelineError::NotCancellable {
                id: run_id,
                status: run.status,
            });
        }
        let token = self
            .active
            .lock()
            .await
            .get(&run_id)
            .map(|a| a.cancel.clone());
        match token {
            Some(token) => {
                info!(run_id = %run_id, "Cancellation requested");
                token.cancel();
                Ok(run)
            }
            None => self.cancel_untracked(run).await,
        }
    }

    /// Cancel a run no task of this process drives. Runs whose owner is
    /// still heartbeating are left to that owner.
    async fn cancel_untracked(&self, run: RunRecord) -> Result<RunRecord, PipelineError> {
        let run_id = run.id;
        let stale_after = self.settings.lease.stale_after;
        let owned_elsewhere = self
            .db
            .call(move |db| db.owned_by_live_instance(run_id, stale_after))
            .await
            .map_err(PipelineError::Database)?;
        if owned_elsewhere {
            return Err(PipelineError::OwnedElsewhere { id: run_id });
        }

        let phase = run.phase;
        let fin = RunFinalization {
            status: RunStatus::Cancelled,
            phase,
            error: Some(RunError {
                phase,
                message: CANCELLED_MESSAGE.to_string(),
            }),
            exit_code: None,
            healed: None,
        };
        match self.db.call(move |db| db.finalize_run(run_id, &fin)).await {
            Ok(run) => {
                info!(run_id = %run_id, "Cancelled run without a live owner");
                Ok(run)
            }
            Err(e) => {
                // The run may have finished after `run` was read.
                let current = self.snapshot(run_id).await?;
                if current.status.is_terminal() {
                    Err(PipelineError::NotCancellable {
                        id: run_id,
                        status: current.status,
                    })
                } else {
                    Err(PipelineError::Database(e))
                }
            }
        }
    }

    /// Wait for a run's task to finish and return the final record.
    pub async fn wait(&self, run_id: RunId) -> Result<RunRecord, PipelineError> {
        let done = self
            .active
            .lock()
            .await
            .get(&run_id)
            .map(|a| a.done.clone());
        if let Some(mut done) = done {
            // Err means the task went away without signalling; the record
            // below still reflects whatever it committed.
            let _ = done.wait_for(|finished| *finished).await;
        }
        self.snapshot(run_id).await
    }

    pub async fn active_runs(&self) -> usize {
        self.active.lock().await.len()
    }

    /// Cancel every active run and wait (bounded) for the tasks to stop.
    pub async fn shutdown(&self) {
        let runs: Vec<(RunId, ActiveRun)> = self.active.lock().await.drain().collect();
        for (run_id, run) in &runs {
            info!(run_id = %run_id, "Shutting down run");
            run.cancel.cancel();
        }
        for (run_id, run) in runs {
            let abort = run.handle.abort_handle();
            if tokio::time::timeout(self.settings.shutdown_grace, run.handle)
                .await
                .is_err()
            {
                warn!(run_id = %run_id, "Run did not stop in time; aborting");
                abort.abort();
            }
        }
    }
}

/// How often a process proves its runs are still owned, and how long
/// silence lasts before another process may fail them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InstanceLease {
    pub heartbeat: Duration,
    pub stale_after: Duration,
}

impl InstanceLease {
    pub fn new(heartbeat: Duration) -> Self {
        Self {
            heartbeat,
            stale_after: heartbeat * 4,
        }
    }
}

impl Default for InstanceLease {
    fn default() -> Self {
        Self::new(Duration::from_secs(15))
    }
}

/// Fail every run left non-terminal by a process that is no longer running.
pub fn recover_interrupted_runs(db: &RunDb, lease: InstanceLease) -> anyhow::Result<usize> {
    let count = db.fail_interrupted_runs("interrupted by service restart", lease.stale_after)?;
    if count > 0 {
        warn!(count, "Marked interrupted runs as failed");
    }
    Ok(count)
}

/// Keep this process's instance row fresh. With `sweep` set, also fail runs
/// whose owners went silent while this process was up.
pub fn spawn_instance_heartbeat(db: DbHandle, lease: InstanceLease, sweep: bool) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(lease.heartbeat);
        // The first tick completes immediately; registration already happened.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let result = db
                .call(move |db| {
                    db.heartbeat()?;
                    if sweep {
                        recover_interrupted_runs(db, lease)?;
                    }
                    Ok(())
                })
                .await;
            if let Err(e) = result {
                warn!(error = %e, "Instance heartbeat failed");
            }
        }
    })
}

// ── Per-run task ─────────────────────────────────────────────────────

/// Data carried between phases of one run.
#[derive(Debug, Default)]
pub(super) struct RunState {
    pub(super) pages: Vec<DiscoveredPage>,
    pub(super) recorded: Option<GeneratedFile>,
    pub(super) files: Vec<GeneratedFile>,
    pub(super) execution: Option<ExecutionResult>,
    pub(super) attempts: u32,
}

pub(super) enum Step {
    Continue,
    Done(Outcome),
}

pub(super) enum Outcome {
    Completed { healed: Option<bool> },
    Failed { error: RunError, healed: Option<bool> },
    Cancelled,
}

/// Owns one run's record for the lifetime of its pipeline. No other code
/// path writes to the record while the task is alive.
pub(super) struct RunTask {
    pub(super) run_id: RunId,
    pub(super) config: RunConfig,
    pub(super) phase: Phase,
    pub(super) progress: u8,
    db: DbHandle,
    hub: Arc<ProgressHub>,
    pub(super) controller: Arc<PhaseController>,
    pub(super) cancel: CancellationToken,
    pub(super) state: RunState,
}

impl RunTask {
    async fn drive(mut self, permits: Option<Arc<Semaphore>>) {
        // Queued runs wait for a slot but stay cancellable.
        let _permit = match permits {
            Some(sem) => tokio::select! {
                permit = sem.acquire_owned() => permit.ok(),
                _ = self.cancel.cancelled() => {
                    self.finish(Outcome::Cancelled).await;
                    return;
                }
            },
            None => None,
        };
        if self.cancel.is_cancelled() {
            self.finish(Outcome::Cancelled).await;
            return;
        }

        let run_id = self.run_id;
        match self.db.call(move |db| db.mark_running(run_id)).await {
            Ok(run) => {
                self.log("Run started").await;
                self.hub.publish(run_id, &WsMessage::PhaseChanged { run });
            }
            Err(e) => {
                let error = self.fatal(Phase::Starting, e);
                self.finish(Outcome::Failed {
                    error,
                    healed: None,
                })
                .await;
                return;
            }
        }

        let outcome = loop {
            match self.advance().await {
                Ok(Step::Continue) => continue,
                Ok(Step::Done(outcome)) => break outcome,
                Err(error) => {
                    break Outcome::Failed {
                        error,
                        healed: None,
                    };
                }
            }
        };
        self.finish(outcome).await;
    }

    /// Take the run one step further.
    pub(super) async fn advance(&mut self) -> Result<Step, RunError> {
        if self.cancel.is_cancelled() {
            return Ok(Step::Done(Outcome::Cancelled));
        }
        if let Some(next) = self.config.mode.next_phase(self.phase) {
            return self.run_phase(next).await;
        }

        let Some(execution) = self.state.execution.clone() else {
            return Err(RunError {
                phase: self.phase,
                message: "pipeline ended without an execution result".to_string(),
            });
        };
        let attempts = self.state.attempts;
        if execution.passed() {
            let healed = (attempts > 0).then_some(true);
            return Ok(Step::Done(Outcome::Completed { healed }));
        }

        let failing = execution_failure_message(&execution);
        if !self.config.mode.heals() {
            return Ok(Step::Done(Outcome::Failed {
                error: RunError {
                    phase: Phase::Execution,
                    message: failing,
                },
                healed: None,
            }));
        }
        if !self.config.auto_heal {
            return Ok(Step::Done(Outcome::Failed {
                error: RunError {
                    phase: Phase::Execution,
                    message: format!("{} (auto-heal disabled)", failing),
                },
                healed: None,
            }));
        }
        if attempts >= self.config.max_heal_attempts {
            return Ok(Step::Done(Outcome::Failed {
                error: RunError {
                    phase: Phase::Healing,
                    message: format!(
                        "{} after {} healing attempt(s)",
                        failing, attempts
                    ),
                },
                healed: Some(false),
            }));
        }
        healing::attempt(self).await
    }

    /// Enter `phase`, run it through the controller and commit its result.
    pub(super) async fn run_phase(&mut self, phase: Phase) -> Result<Step, RunError> {
        self.enter(phase).await?;
        let attempt = self.state.attempts;
        let ctx = PhaseContext {
            run_id: self.run_id,
            config: &self.config,
            pages: &self.state.pages,
            recorded: self.state.recorded.as_ref(),
            files: &self.state.files,
            attempt,
        };
        let controller = Arc::clone(&self.controller);
        let output = match controller.run(phase, ctx).await {
            Ok(output) => output,
            Err(e) if phase == Phase::Execution && e.is_retryable() => {
                // A crashed or timed-out runner still counts as a failing execution.
                warn!(run_id = %self.run_id, error = %e, "Execution failed without a report");
                let output =
                    PhaseOutput::Execution(ExecutionResult::from_runner_error(attempt, e.to_string()));
                if let Err(persist) = controller.persist(self.run_id, &output).await {
                    return Err(self.phase_failed(phase, persist).await);
                }
                output
            }
            Err(e) => return Err(self.phase_failed(phase, e).await),
        };

        let result = output.to_result();
        match output {
            PhaseOutput::Discovery(discovery) => {
                self.log(format!(
                    "Discovery complete: {} pages, {} elements",
                    discovery.pages_count, discovery.elements_count
                ))
                .await;
                self.state.pages = discovery.pages;
            }
            PhaseOutput::Recording { result, file } => {
                self.log(format!("Recording complete: {} actions", result.actions.len()))
                    .await;
                self.state.files = vec![file.clone()];
                self.state.recorded = Some(file);
            }
            PhaseOutput::Generation { files, .. } => {
                self.log(format!("Generation complete: {} test files", files.len()))
                    .await;
                self.state.files = files;
            }
            PhaseOutput::Execution(execution) => {
                self.log(format!(
                    "Execution attempt {}: {} passed, {} failing",
                    execution.attempt,
                    execution.summary.passed,
                    execution.failing_count()
                ))
                .await;
                self.state.execution = Some(execution);
            }
        }
        self.commit(phase, result).await?;
        Ok(Step::Continue)
    }

    /// Record a phase failure under the phase's key and build the run error.
    async fn phase_failed(&mut self, phase: Phase, err: PhaseError) -> RunError {
        let message = err.to_string();
        error!(run_id = %self.run_id, %phase, error = %message, "Phase failed");
        self.log(format!("{} failed: {}", phase, message)).await;
        if phase != Phase::Healing {
            let failure = PhaseResult::Failed(PhaseFailure {
                message: message.clone(),
                retryable: err.is_retryable(),
            });
            let (run_id, progress) = (self.run_id, self.progress);
            if let Err(e) = self
                .db
                .call(move |db| db.commit_phase_result(run_id, phase, &failure, progress))
                .await
            {
                warn!(run_id = %run_id, error = %e, "Failed to record phase failure");
            }
        }
        RunError { phase, message }
    }

    pub(super) async fn enter(&mut self, phase: Phase) -> Result<(), RunError> {
        let progress = self.entry_progress(phase);
        let run_id = self.run_id;
        let run = self
            .db
            .call(move |db| db.advance_phase(run_id, phase, progress))
            .await
            .map_err(|e| self.fatal(phase, e))?;
        info!(run_id = %run_id, %phase, progress, "Entered phase");
        self.phase = phase;
        self.progress = progress;
        self.hub.publish(run_id, &WsMessage::PhaseChanged { run });
        Ok(())
    }

    async fn commit(&mut self, phase: Phase, result: PhaseResult) -> Result<(), RunError> {
        let progress = self.completion_progress(phase);
        let run_id = self.run_id;
        let run = self
            .db
            .call(move |db| db.commit_phase_result(run_id, phase, &result, progress))
            .await
            .map_err(|e| self.fatal(phase, e))?;
        self.progress = progress;
        self.hub.publish(run_id, &WsMessage::PhaseChanged { run });
        Ok(())
    }

    pub(super) async fn commit_attempt(&mut self, attempt: HealingAttempt) -> Result<(), RunError> {
        let progress = healing_progress(attempt.attempt, self.config.max_heal_attempts);
        let run_id = self.run_id;
        let record = attempt.clone();
        self.db
            .call(move |db| db.append_healing_attempt(run_id, &record, progress))
            .await
            .map_err(|e| self.fatal(Phase::Healing, e))?;
        self.progress = progress;
        self.hub.publish(
            run_id,
            &WsMessage::HealingAttempt {
                run_id,
                attempt,
                max_attempts: self.config.max_heal_attempts,
                progress,
            },
        );
        Ok(())
    }

    /// Progress on entering `phase`. Re-executions after healing stay in the
    /// healing band so progress never moves backwards.
    fn entry_progress(&self, phase: Phase) -> u8 {
        match phase {
            Phase::Healing | Phase::Execution if self.state.attempts > 0 => self.progress,
            _ => phase.milestones().0,
        }
    }

    fn completion_progress(&self, phase: Phase) -> u8 {
        if self.state.attempts > 0 {
            self.progress
        } else {
            phase.milestones().1
        }
    }

    pub(super) fn fatal(&self, phase: Phase, err: anyhow::Error) -> RunError {
        error!(run_id = %self.run_id, %phase, error = %format!("{:#}", err), "Run failed");
        RunError {
            phase,
            message: format!("{:#}", err),
        }
    }

    pub(super) async fn log(&self, message: impl Into<String>) {
        let message = message.into();
        let run_id = self.run_id;
        if let Err(e) = self
            .db
            .call(move |db| db.append_log(run_id, &message))
            .await
        {
            warn!(run_id = %run_id, error = %e, "Failed to append run log");
        }
    }

    async fn finish(&mut self, outcome: Outcome) {
        let fin = match outcome {
            Outcome::Completed { healed } => RunFinalization {
                status: RunStatus::Completed,
                phase: Phase::Completed,
                error: None,
                exit_code: Some(0),
                healed,
            },
            Outcome::Failed { error, healed } => RunFinalization {
                status: RunStatus::Failed,
                phase: Phase::Failed,
                error: Some(error),
                exit_code: Some(1),
                healed,
            },
            Outcome::Cancelled => RunFinalization {
                status: RunStatus::Cancelled,
                phase: self.phase,
                error: Some(RunError {
                    phase: self.phase,
                    message: CANCELLED_MESSAGE.to_string(),
                }),
                exit_code: None,
                healed: None,
            },
        };
        self.log(match &fin.error {
            Some(e) => format!("Run {}: {}", fin.status, e.message),
            None => format!("Run {}", fin.status),
        })
        .await;

        let run_id = self.run_id;
        let status = fin.status;
        match self.db.call(move |db| db.finalize_run(run_id, &fin)).await {
            Ok(run) => {
                info!(run_id = %run_id, %status, healed = ?run.healed, "Run finished");
                self.hub.publish(run_id, &WsMessage::RunFinished { run });
            }
            Err(e) => {
                error!(run_id = %run_id, error = %format!("{:#}", e), "Failed to finalize run");
            }
        }
        self.hub.close(run_id);
    }
}

/// Progress after healing attempt `attempt` of `max`, inside the healing band.
pub(super) fn healing_progress(attempt: u32, max: u32) -> u8 {
    let (start, end) = Phase::Healing.milestones();
    let span = u32::from(end - start - 1);
    let step = span * attempt.min(max) / max.max(1);
    start + step as u8
}

fn execution_failure_message(execution: &ExecutionResult) -> String {
    if let Some(err) = &execution.error {
        return format!("test runner failed: {}", err);
    }
    if execution.tests.is_empty() {
        return "no tests were collected".to_string();
    }
    format!(
        "{} of {} tests failed",
        execution.failing_count(),
        execution.summary.total
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::fakes::*;
    use crate::pipeline::ws::ProgressFrame;

    async fn collect_frames(mut rx: tokio::sync::broadcast::Receiver<String>) -> Vec<WsMessage> {
        let mut frames = Vec::new();
        while let Ok(frame) = rx.recv().await {
            if let ProgressFrame::Update(msg) = ProgressFrame::parse(&frame) {
                frames.push(*msg);
            }
        }
        frames
    }

    fn phase_history(frames: &[WsMessage]) -> Vec<Phase> {
        let mut phases: Vec<Phase> = Vec::new();
        for frame in frames {
            let phase = match frame {
                WsMessage::PhaseChanged { run } | WsMessage::RunFinished { run } => run.phase,
                _ => continue,
            };
            if phases.last() != Some(&phase) {
                phases.push(phase);
            }
        }
        phases
    }

    #[tokio::test]
    async fn test_ai_run_exhausts_healing_budget() {
        let stack = TestStack::new(
            FakeBrowser::default()
                .with_pages(vec![page("https://example.com/")])
                .with_reports(vec![Ok(failing_report(&["test_home.py"]))]),
            FakeAi::default(),
        );
        let run = stack
            .runner
            .start(&request("ai", Some(2)))
            .await
            .unwrap();
        let frames = tokio::spawn(collect_frames(stack.runner.hub().subscribe(run.id).unwrap()));
        let run = stack.runner.wait(run.id).await.unwrap();

        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.phase, Phase::Failed);
        assert_eq!(run.healed, Some(false));
        assert_eq!(run.exit_code, Some(1));
        let error = run.error.as_ref().unwrap();
        assert_eq!(error.phase, Phase::Healing);
        assert!(error.message.contains("after 2 healing attempt(s)"));

        let report = run.healing_report();
        assert_eq!(report.healing_attempts, 2);
        assert!(!report.healed);
        assert_eq!(report.final_result.as_ref().map(|r| r.attempt), Some(2));
        assert_eq!(stack.ai.fix_requests().len(), 2);

        let frames = frames.await.unwrap();
        let attempts = frames
            .iter()
            .filter(|f| matches!(f, WsMessage::HealingAttempt { .. }))
            .count();
        assert_eq!(attempts, 2);
        assert!(matches!(frames.last(), Some(WsMessage::RunFinished { .. })));
    }

    #[tokio::test]
    async fn test_ai_run_heals_on_first_attempt() {
        let stack = TestStack::new(
            FakeBrowser::default()
                .with_pages(vec![page("https://example.com/")])
                .with_reports(vec![
                    Ok(failing_report(&["test_home.py"])),
                    Ok(passing_report(&["test_home.py"])),
                ]),
            FakeAi::default(),
        );
        let run = stack.runner.start(&request("ai", Some(3))).await.unwrap();
        let run = stack.runner.wait(run.id).await.unwrap();

        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.phase, Phase::Completed);
        assert_eq!(run.progress, 100);
        assert_eq!(run.healed, Some(true));
        assert_eq!(run.exit_code, Some(0));
        assert!(run.error.is_none());

        let execution = run.execution().unwrap();
        assert_eq!(execution.attempt, 1);
        assert!(execution.passed());

        let report = run.healing_report();
        assert_eq!(report.healing_attempts, 1);
        assert!(report.healed);
        let fix = &report.attempts[0].fixes[0];
        assert!(fix.applied);
        assert_eq!(fix.file, "test_home.py");
        assert_eq!(fix.proposed_fix.as_deref(), Some(FIXED_SOURCE));

        // The rerun saw the fixed file and it was snapshotted.
        let suites = stack.browser.calls().lock().unwrap().suites.clone();
        assert_eq!(suites.len(), 2);
        assert_eq!(suites[1][0].content, FIXED_SOURCE);
        assert_eq!(stack.artifacts.snapshot(run.id, 1)[0].content, FIXED_SOURCE);
    }

    #[tokio::test]
    async fn test_passing_first_execution_skips_healing() {
        let stack = TestStack::new(
            FakeBrowser::default()
                .with_pages(vec![page("https://example.com/")])
                .with_reports(vec![Ok(passing_report(&["test_home.py"]))]),
            FakeAi::default(),
        );
        let run = stack.runner.start(&request("ai", None)).await.unwrap();
        let run = stack.runner.wait(run.id).await.unwrap();

        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.healed, None);
        assert_eq!(run.healing_report(), HealingReport::default());
        assert!(stack.ai.fix_requests().is_empty());
    }

    #[tokio::test]
    async fn test_record_mode_phases_and_no_healing() {
        let stack = TestStack::new(
            FakeBrowser::default()
                .with_recording("await page.goto(\"https://example.com/\")\n")
                .with_reports(vec![Ok(failing_report(&["test_recorded_workflow.py"]))]),
            FakeAi::default(),
        );
        let run = stack.runner.start(&request("record", Some(3))).await.unwrap();
        let frames = tokio::spawn(collect_frames(stack.runner.hub().subscribe(run.id).unwrap()));
        let run = stack.runner.wait(run.id).await.unwrap();

        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.healed, None);
        assert_eq!(
            run.phase_results.keys().copied().collect::<Vec<_>>(),
            vec![Phase::Recording, Phase::Execution]
        );
        assert_eq!(run.error.as_ref().map(|e| e.phase), Some(Phase::Execution));
        assert!(stack.ai.fix_requests().is_empty());
        assert_eq!(stack.browser.calls().lock().unwrap().crawls, 0);

        let history = phase_history(&frames.await.unwrap());
        assert!(!history.contains(&Phase::Discovery));
        assert!(!history.contains(&Phase::Healing));
        assert_eq!(history.last(), Some(&Phase::Failed));
    }

    #[tokio::test]
    async fn test_hybrid_phase_sequence() {
        let stack = TestStack::new(
            FakeBrowser::default()
                .with_recording("await page.goto(\"https://example.com/\")\n")
                .with_reports(vec![Ok(passing_report(&[
                    "test_recorded_workflow.py",
                    "test_home.py",
                ]))]),
            FakeAi::default(),
        );
        let run = stack.runner.start(&request("hybrid", None)).await.unwrap();
        let frames = tokio::spawn(collect_frames(stack.runner.hub().subscribe(run.id).unwrap()));
        let run = stack.runner.wait(run.id).await.unwrap();

        assert_eq!(run.status, RunStatus::Completed);
        let history = phase_history(&frames.await.unwrap());
        assert_eq!(
            history,
            vec![
                Phase::Starting,
                Phase::Recording,
                Phase::Generation,
                Phase::Execution,
                Phase::Completed
            ]
        );
        let suites = stack.browser.calls().lock().unwrap().suites.clone();
        assert_eq!(suites[0][0].name, "test_recorded_workflow.py");
        assert_eq!(suites[0].len(), 2);
    }

    #[tokio::test]
    async fn test_invalid_request_creates_no_record() {
        let stack = TestStack::new(FakeBrowser::default(), FakeAi::default());
        let err = stack.runner.start(&request("bogus", None)).await.unwrap_err();
        assert!(matches!(err, PipelineError::InvalidConfig(_)));
        let err = stack.runner.start(&request("ai", Some(0))).await.unwrap_err();
        assert!(matches!(err, PipelineError::InvalidConfig(_)));
        assert!(stack.runner.list(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_adapter_failure_consumes_attempt_and_reruns() {
        let stack = TestStack::new(
            FakeBrowser::default()
                .with_pages(vec![page("https://example.com/")])
                .with_reports(vec![
                    Ok(failing_report(&["test_home.py"])),
                    Ok(failing_report(&["test_home.py"])),
                    Ok(passing_report(&["test_home.py"])),
                ]),
            FakeAi::default().with_fixes(vec![
                Err("model overloaded".to_string()),
                Ok(fix_proposal(FIXED_SOURCE)),
            ]),
        );
        let run = stack.runner.start(&request("ai", Some(3))).await.unwrap();
        let run = stack.runner.wait(run.id).await.unwrap();

        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.healed, Some(true));
        let report = run.healing_report();
        assert_eq!(report.healing_attempts, 2);
        let first = &report.attempts[0].fixes[0];
        assert!(!first.applied);
        assert!(first.error.as_deref().unwrap().contains("model overloaded"));

        // Execution ran after the failed attempt with the suite unchanged.
        let suites = stack.browser.calls().lock().unwrap().suites.clone();
        assert_eq!(suites.len(), 3);
        assert_eq!(suites[1], suites[0]);
        assert_eq!(suites[2][0].content, FIXED_SOURCE);
    }

    #[tokio::test]
    async fn test_discovery_failure_fails_run_immediately() {
        let stack = TestStack::new(
            FakeBrowser::default().with_crawl_error("connection refused"),
            FakeAi::default(),
        );
        let run = stack.runner.start(&request("ai", None)).await.unwrap();
        let run = stack.runner.wait(run.id).await.unwrap();

        assert_eq!(run.status, RunStatus::Failed);
        let error = run.error.as_ref().unwrap();
        assert_eq!(error.phase, Phase::Discovery);
        assert!(error.message.contains("connection refused"));
        match run.phase_results.get(&Phase::Discovery) {
            Some(PhaseResult::Failed(failure)) => {
                assert!(failure.message.contains("connection refused"))
            }
            other => panic!("expected failure entry, got {:?}", other),
        }
        assert!(!run.phase_results.contains_key(&Phase::Generation));
    }

    #[tokio::test]
    async fn test_runner_crash_enters_healing() {
        let stack = TestStack::new(
            FakeBrowser::default()
                .with_pages(vec![page("https://example.com/")])
                .with_reports(vec![
                    Err("pytest exited with signal 9".to_string()),
                    Ok(passing_report(&["test_home.py"])),
                ]),
            FakeAi::default(),
        );
        let run = stack.runner.start(&request("ai", Some(1))).await.unwrap();
        let run = stack.runner.wait(run.id).await.unwrap();

        assert_eq!(run.status, RunStatus::Completed);
        let requests = stack.ai.fix_requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].file, "test_home.py");
        assert!(requests[0].error_output.contains("signal 9"));
    }

    #[tokio::test]
    async fn test_persistence_failure_is_fatal() {
        let stack = TestStack::with_artifacts(
            FakeBrowser::default().with_pages(vec![page("https://example.com/")]),
            FakeAi::default(),
            FakeArtifacts::failing(),
        );
        let run = stack.runner.start(&request("ai", None)).await.unwrap();
        let run = stack.runner.wait(run.id).await.unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.error.as_ref().map(|e| e.phase), Some(Phase::Discovery));
        assert!(run.error.unwrap().message.contains("persist"));
    }

    #[tokio::test]
    async fn test_cancel_observed_at_phase_boundary() {
        let stack = TestStack::new(
            FakeBrowser::default()
                .with_pages(vec![page("https://example.com/")])
                .with_delay(Duration::from_millis(200)),
            FakeAi::default(),
        );
        let run = stack.runner.start(&request("ai", None)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let snapshot = stack.runner.cancel(run.id).await.unwrap();
        assert!(!snapshot.status.is_terminal());

        let run = stack.runner.wait(run.id).await.unwrap();
        assert_eq!(run.status, RunStatus::Cancelled);
        assert_eq!(run.phase, Phase::Discovery);
        assert!(!run.phase_results.contains_key(&Phase::Generation));

        let err = stack.runner.cancel(run.id).await.unwrap_err();
        assert!(matches!(err, PipelineError::NotCancellable { .. }));
    }

    #[tokio::test]
    async fn test_late_subscriber_starts_from_committed_snapshot() {
        let stack = TestStack::new(
            FakeBrowser::default()
                .with_pages(vec![page("https://example.com/")])
                .with_delay(Duration::from_millis(200)),
            FakeAi::default(),
        );
        let run = stack.runner.start(&request("ai", None)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Same order as the progress socket: subscribe, then snapshot.
        let rx = stack.runner.hub().subscribe(run.id).unwrap();
        let snapshot = stack.runner.snapshot(run.id).await.unwrap();
        assert_eq!(snapshot.phase, Phase::Discovery);
        assert_eq!(snapshot.status, RunStatus::Running);

        let frames = tokio::spawn(collect_frames(rx));
        let run = stack.runner.wait(run.id).await.unwrap();
        assert_eq!(run.status, RunStatus::Completed);

        let frames = frames.await.unwrap();
        let history = phase_history(&frames);
        assert!(!history.contains(&Phase::Starting));
        assert!(history.contains(&Phase::Generation));
        assert!(matches!(frames.last(), Some(WsMessage::RunFinished { .. })));
    }

    #[tokio::test]
    async fn test_queued_run_cancellable_while_waiting_for_slot() {
        let stack = TestStack::with_settings(
            FakeBrowser::default()
                .with_pages(vec![page("https://example.com/")])
                .with_delay(Duration::from_millis(300))
                .with_reports(vec![Ok(passing_report(&["test_home.py"]))]),
            FakeAi::default(),
            RunnerSettings {
                max_concurrent_runs: 1,
                ..RunnerSettings::default()
            },
        );
        let first = stack.runner.start(&request("ai", None)).await.unwrap();
        let second = stack.runner.start(&request("ai", None)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(
            stack.runner.snapshot(second.id).await.unwrap().status,
            RunStatus::Queued
        );
        stack.runner.cancel(second.id).await.unwrap();
        let second = stack.runner.wait(second.id).await.unwrap();
        assert_eq!(second.status, RunStatus::Cancelled);
        assert_eq!(second.phase, Phase::Starting);

        let first = stack.runner.wait(first.id).await.unwrap();
        assert_eq!(first.status, RunStatus::Completed);
    }

    #[tokio::test]
    async fn test_run_log_and_channel_closed_after_finish() {
        let stack = TestStack::new(
            FakeBrowser::default()
                .with_pages(vec![page("https://example.com/")])
                .with_reports(vec![Ok(passing_report(&["test_home.py"]))]),
            FakeAi::default(),
        );
        let run = stack.runner.start(&request("ai", None)).await.unwrap();
        stack.runner.wait(run.id).await.unwrap();

        assert!(stack.runner.hub().subscribe(run.id).is_none());
        assert_eq!(stack.runner.active_runs().await, 0);
        let logs = stack.runner.logs(run.id).await.unwrap();
        assert!(logs.iter().any(|l| l.message.starts_with("Discovery complete")));
        assert_eq!(logs.last().map(|l| l.message.as_str()), Some("Run completed"));
    }

    #[test]
    fn test_healing_progress_stays_in_band() {
        assert_eq!(healing_progress(0, 3), 85);
        assert!(healing_progress(1, 3) > 85);
        assert_eq!(healing_progress(3, 3), 99);
        assert_eq!(healing_progress(5, 5), 99);
        assert_eq!(healing_progress(9, 2), 99);
    }

    #[test]
    fn test_recover_interrupted_runs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runs.db");
        let lease = InstanceLease::default();
        {
            let gone = RunDb::new(&path).unwrap();
            gone.create_run(&config(RunMode::Ai)).unwrap();
        }
        let db = RunDb::new(&path).unwrap();
        db.create_run(&config(RunMode::Ai)).unwrap();
        assert_eq!(recover_interrupted_runs(&db, lease).unwrap(), 1);
        assert_eq!(recover_interrupted_runs(&db, lease).unwrap(), 0);
    }

    #[test]
    fn test_instance_lease_stale_window() {
        let lease = InstanceLease::new(Duration::from_secs(5));
        assert_eq!(lease.stale_after, Duration::from_secs(20));
    }

    #[tokio::test]
    async fn test_cancel_after_run_finished_is_conflict() {
        let stack = TestStack::new(FakeBrowser::default(), FakeAi::default());
        let cfg = config(RunMode::Ai);
        let stale = stack
            .runner
            .db()
            .call(move |db| db.create_run(&cfg))
            .await
            .unwrap();
        let run_id = stale.id;
        stack
            .runner
            .db()
            .call(move |db| {
                db.finalize_run(
                    run_id,
                    &RunFinalization {
                        status: RunStatus::Cancelled,
                        phase: Phase::Starting,
                        error: None,
                        exit_code: None,
                        healed: None,
                    },
                )
            })
            .await
            .unwrap();

        // `stale` still says queued; the store says otherwise.
        let err = stack.runner.cancel_untracked(stale).await.unwrap_err();
        assert!(matches!(
            err,
            PipelineError::NotCancellable {
                status: RunStatus::Cancelled,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_cancel_leaves_runs_of_live_processes_alone() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runs.db");
        let other_process = RunDb::new(&path).unwrap();
        let run = other_process.create_run(&config(RunMode::Ai)).unwrap();
        let stack = TestStack::on_database(
            FakeBrowser::default(),
            FakeAi::default(),
            RunDb::new(&path).unwrap(),
        );

        let err = stack.runner.cancel(run.id).await.unwrap_err();
        assert!(matches!(err, PipelineError::OwnedElsewhere { .. }));
        assert_eq!(
            stack.runner.snapshot(run.id).await.unwrap().status,
            RunStatus::Queued
        );

        drop(other_process);
        let cancelled = stack.runner.cancel(run.id).await.unwrap();
        assert_eq!(cancelled.status, RunStatus::Cancelled);
    }
}
