//! One healing attempt: propose per-file fixes for the failing tests, apply
//! them to the suite, and re-run execution.
//!
//! The loop around this (when to heal, when to give up) lives in
//! `RunTask::advance`.

use chrono::Utc;
use tracing::{info, warn};

use super::ai::FixRequest;
use super::models::*;
use super::runner::{RunTask, Step};

/// Failing tests of one file, with the output the model gets to see.
#[derive(Debug, Clone, PartialEq)]
pub(super) struct FailureGroup {
    pub(super) file: String,
    pub(super) tests: Vec<String>,
    pub(super) error_output: String,
}

/// Group an execution's failures by file, in suite order.
///
/// When the runner itself failed there are no per-test results, so every
/// file in the suite is treated as failing with the runner's error.
pub(super) fn group_failures(
    execution: &ExecutionResult,
    suite: &[GeneratedFile],
) -> Vec<FailureGroup> {
    if execution.error.is_some() || execution.tests.is_empty() {
        let output = execution
            .error
            .clone()
            .unwrap_or_else(|| "no tests were collected".to_string());
        return suite
            .iter()
            .map(|f| FailureGroup {
                file: f.name.clone(),
                tests: Vec::new(),
                error_output: output.clone(),
            })
            .collect();
    }

    let mut groups: Vec<FailureGroup> = Vec::new();
    for test in execution.failing_tests() {
        let entry = format!(
            "{} [{}]\n{}",
            test.name,
            test.outcome,
            test.error.as_deref().unwrap_or("(no output)")
        );
        match groups.iter_mut().find(|g| g.file == test.file) {
            Some(group) => {
                group.tests.push(test.name.clone());
                group.error_output.push_str("\n\n");
                group.error_output.push_str(&entry);
            }
            None => groups.push(FailureGroup {
                file: test.file.clone(),
                tests: vec![test.name.clone()],
                error_output: entry,
            }),
        }
    }
    let position = |name: &str| {
        suite
            .iter()
            .position(|f| f.name == name)
            .unwrap_or(usize::MAX)
    };
    groups.sort_by_key(|g| position(&g.file));
    groups
}

/// Run healing attempt `attempts + 1` and the execution that follows it.
pub(super) async fn attempt(task: &mut RunTask) -> Result<Step, RunError> {
    task.enter(Phase::Healing).await?;
    let number = task.state.attempts + 1;
    let started_at = Utc::now();
    let Some(execution) = task.state.execution.clone() else {
        return Err(RunError {
            phase: Phase::Healing,
            message: "nothing to heal: no execution result".to_string(),
        });
    };
    let groups = group_failures(&execution, &task.state.files);
    let selectors = selectors_of(&task.state.pages);
    info!(
        run_id = %task.run_id,
        attempt = number,
        files = groups.len(),
        "Starting healing attempt"
    );
    task.log(format!(
        "Healing attempt {}/{}: {} failing file(s)",
        number,
        task.config.max_heal_attempts,
        groups.len()
    ))
    .await;

    let mut fixes = Vec::with_capacity(groups.len());
    let mut suite = task.state.files.clone();
    for group in groups {
        if task.cancel.is_cancelled() {
            break;
        }
        let Some(index) = suite.iter().position(|f| f.name == group.file) else {
            warn!(run_id = %task.run_id, file = %group.file, "Failing file is not part of the suite");
            continue;
        };
        let original = suite[index].content.clone();
        let request = FixRequest {
            file: group.file.clone(),
            failing_tests: group.tests.clone(),
            source: original.clone(),
            error_output: group.error_output,
            selectors: selectors.clone(),
        };
        let mut fix = ProposedFix {
            file: group.file,
            tests: group.tests,
            original_code: original,
            proposed_fix: None,
            confidence: None,
            issue: None,
            error: None,
            applied: false,
        };
        match task.controller.propose_fix(&request).await {
            Ok(proposal) => {
                fix.applied = proposal.fix.trim() != fix.original_code.trim();
                if fix.applied {
                    suite[index].content = proposal.fix.clone();
                }
                fix.proposed_fix = Some(proposal.fix);
                fix.confidence = Some(proposal.confidence);
                fix.issue = Some(proposal.issue);
            }
            Err(e) => {
                warn!(run_id = %task.run_id, file = %fix.file, error = %e, "Fix proposal failed");
                fix.error = Some(e.to_string());
            }
        }
        fixes.push(fix);
    }

    let applied = fixes.iter().filter(|f| f.applied).count();
    if applied > 0 {
        task.controller
            .save_healed_suite(task.run_id, number, &suite)
            .await
            .map_err(|e| RunError {
                phase: Phase::Healing,
                message: e.to_string(),
            })?;
        task.state.files = suite;
    }
    task.log(format!(
        "Healing attempt {}: applied {} of {} fix(es)",
        number,
        applied,
        fixes.len()
    ))
    .await;

    // The attempt is consumed even when nothing could be applied.
    task.state.attempts = number;
    let mut record = HealingAttempt {
        attempt: number,
        fixes,
        result: None,
        started_at,
        completed_at: None,
    };
    if task.cancel.is_cancelled() {
        record.completed_at = Some(Utc::now());
        task.commit_attempt(record).await?;
        return Ok(Step::Continue);
    }

    let rerun = task.run_phase(Phase::Execution).await;
    record.completed_at = Some(Utc::now());
    if rerun.is_ok() {
        record.result = task
            .state
            .execution
            .as_ref()
            .filter(|e| e.attempt == number)
            .map(|e| e.summary.clone());
    }
    task.commit_attempt(record).await?;
    rerun
}

#[cfg(test)]
mod tests {
    use super::*;

    fn case(file: &str, name: &str, outcome: TestOutcome) -> TestCaseResult {
        TestCaseResult {
            id: format!("tests/{}::{}", file, name),
            file: file.to_string(),
            name: name.to_string(),
            outcome,
            duration_ms: Some(5),
            error: (outcome != TestOutcome::Passed).then(|| format!("{} broke", name)),
        }
    }

    fn suite() -> Vec<GeneratedFile> {
        vec![
            GeneratedFile::new("test_home.py", "a"),
            GeneratedFile::new("test_login.py", "b"),
        ]
    }

    #[test]
    fn test_groups_failures_per_file_in_suite_order() {
        let execution = ExecutionResult::from_report(
            0,
            ExecutionReport {
                tests: vec![
                    case("test_login.py", "test_submit", TestOutcome::Failed),
                    case("test_home.py", "test_title", TestOutcome::Passed),
                    case("test_home.py", "test_nav", TestOutcome::Error),
                    case("test_login.py", "test_reset", TestOutcome::Skipped),
                ],
                process_exit_code: Some(1),
                duration_ms: 40,
            },
        );
        let groups = group_failures(&execution, &suite());
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].file, "test_home.py");
        assert_eq!(groups[0].tests, vec!["test_nav"]);
        assert_eq!(groups[1].tests, vec!["test_submit", "test_reset"]);
        assert!(groups[1].error_output.contains("test_submit broke"));
        assert!(groups[1].error_output.contains("test_reset [skipped]"));
    }

    #[test]
    fn test_runner_error_marks_every_file_failing() {
        let execution = ExecutionResult::from_runner_error(1, "pytest not found");
        let groups = group_failures(&execution, &suite());
        assert_eq!(groups.len(), 2);
        assert!(groups.iter().all(|g| g.tests.is_empty()));
        assert!(groups.iter().all(|g| g.error_output == "pytest not found"));
    }

    #[test]
    fn test_passing_execution_has_no_groups() {
        let execution = ExecutionResult::from_report(
            0,
            ExecutionReport {
                tests: vec![case("test_home.py", "test_title", TestOutcome::Passed)],
                process_exit_code: Some(0),
                duration_ms: 10,
            },
        );
        assert!(group_failures(&execution, &suite()).is_empty());
    }
}
