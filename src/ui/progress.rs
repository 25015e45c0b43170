use console::{Emoji, style};
use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::time::Duration;

use crate::pipeline::models::{HealingAttempt, Phase, RunRecord, RunStatus};
use crate::pipeline::ws::{ProgressFrame, WsMessage};
use crate::ui::icons::{CHECK, CROSS, HEAL, RECORD, RUNNING, SEARCH, SPARKLE, STOP, WRITE};

/// Terminal rendering of one run's progress stream.
///
/// Two bars are stacked vertically:
/// - Run bar: overall progress (0-100) with the current phase
/// - Status bar: spinner with the latest phase detail or healing attempt
pub struct RunProgressUI {
    multi: MultiProgress,
    run_bar: ProgressBar,
    status_bar: ProgressBar,
    phase: Option<Phase>,
}

pub fn phase_icon(phase: Phase) -> Emoji<'static, 'static> {
    match phase {
        Phase::Discovery => SEARCH,
        Phase::Recording => RECORD,
        Phase::Generation => WRITE,
        Phase::Execution | Phase::Starting => RUNNING,
        Phase::Healing => HEAL,
        Phase::Completed => CHECK,
        Phase::Failed => CROSS,
    }
}

/// One-line description of where a run stands.
pub fn describe(run: &RunRecord) -> String {
    let mut line = format!("{} {}", run.status, run.phase);
    if let Some(execution) = run.execution() {
        line.push_str(&format!(
            " | {}/{} passed (attempt {})",
            execution.summary.passed, execution.summary.total, execution.attempt
        ));
    }
    if let Some(error) = &run.error {
        line.push_str(&format!(" | {}: {}", error.phase, error.message));
    }
    line
}

impl RunProgressUI {
    pub fn new(run: &RunRecord) -> Self {
        Self::with_target(run, ProgressDrawTarget::stderr())
    }

    pub fn with_target(run: &RunRecord, target: ProgressDrawTarget) -> Self {
        let multi = MultiProgress::with_draw_target(target);

        let run_style = ProgressStyle::default_bar()
            .template("{prefix:.bold.dim} [{bar:40.cyan/blue}] {pos:>3}% {msg}")
            .expect("progress bar template is a valid static string")
            .progress_chars("█▓▒░");
        let run_bar = multi.add(ProgressBar::new(100));
        run_bar.set_style(run_style);
        run_bar.set_prefix("   Run");

        let status_style = ProgressStyle::default_spinner()
            .template("{prefix:.bold.dim} {spinner} {msg}")
            .expect("progress bar template is a valid static string");
        let status_bar = multi.add(ProgressBar::new_spinner());
        status_bar.set_style(status_style);
        status_bar.set_prefix("Status");
        status_bar.enable_steady_tick(Duration::from_millis(100));

        let ui = Self {
            multi,
            run_bar,
            status_bar,
            phase: None,
        };
        ui.print_line(format!(
            "{} {} run {} against {}",
            SPARKLE,
            style(run.mode).cyan(),
            style(run.id).dim(),
            run.config.url
        ));
        ui
    }

    fn print_line(&self, msg: impl AsRef<str>) {
        if self.multi.println(msg.as_ref()).is_err() {
            eprintln!("{}", msg.as_ref());
        }
    }

    pub fn position(&self) -> u64 {
        self.run_bar.position()
    }

    /// Apply one incoming text frame. Returns `true` once the run is finished.
    pub fn apply(&mut self, text: &str) -> bool {
        match ProgressFrame::parse(text) {
            ProgressFrame::Keepalive => false,
            ProgressFrame::Update(msg) => self.apply_message(&msg),
        }
    }

    pub fn apply_message(&mut self, msg: &WsMessage) -> bool {
        match msg {
            WsMessage::Snapshot { run } | WsMessage::PhaseChanged { run } => {
                self.show_run(run);
                run.status.is_terminal()
            }
            WsMessage::HealingAttempt {
                attempt,
                max_attempts,
                progress,
                ..
            } => {
                self.show_attempt(attempt, *max_attempts);
                self.run_bar.set_position(u64::from(*progress));
                false
            }
            WsMessage::RunFinished { run } => {
                self.finish(run);
                true
            }
        }
    }

    fn show_run(&mut self, run: &RunRecord) {
        self.run_bar.set_position(u64::from(run.progress));
        self.run_bar.set_message(format!(
            "{}{}",
            phase_icon(run.phase),
            style(run.phase).yellow()
        ));
        if self.phase != Some(run.phase) {
            self.phase = Some(run.phase);
            self.print_line(format!(
                "  {} {}",
                phase_icon(run.phase),
                style(format!("Entered {}", run.phase)).bold()
            ));
        }
        self.status_bar.set_message(describe(run));
    }

    fn show_attempt(&self, attempt: &HealingAttempt, max_attempts: u32) {
        let applied = attempt.fixes.iter().filter(|f| f.applied).count();
        let result = match &attempt.result {
            Some(summary) => format!("{}/{} passed", summary.passed, summary.total),
            None => "no result".to_string(),
        };
        self.print_line(format!(
            "    {} Healing attempt {}/{}: {} of {} fix(es) applied, {}",
            HEAL,
            style(attempt.attempt).cyan(),
            max_attempts,
            applied,
            attempt.fixes.len(),
            result
        ));
    }

    fn finish(&mut self, run: &RunRecord) {
        self.show_run(run);
        let (icon, label) = match run.status {
            RunStatus::Completed => (CHECK, style("completed").green().bold()),
            RunStatus::Cancelled => (STOP, style("cancelled").yellow().bold()),
            _ => (CROSS, style("failed").red().bold()),
        };
        self.status_bar.finish_and_clear();
        self.run_bar.finish();
        self.print_line(format!("{}Run {}: {}", icon, label, describe(run)));
        if run.healed == Some(true) {
            let report = run.healing_report();
            self.print_line(format!(
                "  {} Healed after {} attempt(s)",
                HEAL, report.healing_attempts
            ));
        }
    }
}
