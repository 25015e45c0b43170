//! Parser for `pytest-json-report` output.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::str::FromStr;

use super::models::{ExecutionReport, TestCaseResult, TestOutcome};

/// Longest error text kept per test.
const MAX_ERROR_CHARS: usize = 4000;

#[derive(Debug, Deserialize)]
struct RawReport {
    #[serde(default)]
    duration: f64,
    #[serde(default)]
    exitcode: Option<i32>,
    #[serde(default)]
    tests: Vec<RawTest>,
    #[serde(default)]
    collectors: Vec<RawCollector>,
}

#[derive(Debug, Deserialize)]
struct RawTest {
    nodeid: String,
    outcome: String,
    #[serde(default)]
    setup: Option<RawStage>,
    #[serde(default)]
    call: Option<RawStage>,
    #[serde(default)]
    teardown: Option<RawStage>,
}

#[derive(Debug, Deserialize)]
struct RawStage {
    #[serde(default)]
    duration: f64,
    #[serde(default)]
    outcome: Option<String>,
    #[serde(default)]
    longrepr: Option<String>,
    #[serde(default)]
    crash: Option<RawCrash>,
}

#[derive(Debug, Deserialize)]
struct RawCrash {
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawCollector {
    nodeid: String,
    outcome: String,
    #[serde(default)]
    longrepr: Option<String>,
}

/// Parse a report file's contents into per-test results.
///
/// Collection failures (for example a syntax error in a generated file)
/// become one `error` result for that file so healing can target it.
pub fn parse(json: &str) -> Result<ExecutionReport> {
    let raw: RawReport = serde_json::from_str(json).context("Invalid pytest JSON report")?;

    let mut tests = Vec::with_capacity(raw.tests.len());
    for test in raw.tests {
        let outcome = TestOutcome::from_str(&test.outcome).unwrap_or(TestOutcome::Error);
        let stages: Vec<&RawStage> = [&test.setup, &test.call, &test.teardown]
            .into_iter()
            .flatten()
            .collect();
        let duration: f64 = stages.iter().map(|s| s.duration).sum();
        let error = if outcome == TestOutcome::Passed {
            None
        } else {
            stages
                .iter()
                .filter(|s| s.outcome.as_deref() != Some("passed"))
                .find_map(|s| stage_error(s))
        };
        let (file, name) = split_nodeid(&test.nodeid);
        tests.push(TestCaseResult {
            id: test.nodeid.clone(),
            file,
            name,
            outcome,
            duration_ms: Some(secs_to_ms(duration)),
            error,
        });
    }

    for collector in raw.collectors {
        if collector.outcome != "failed" || collector.nodeid.is_empty() {
            continue;
        }
        let (file, _) = split_nodeid(&collector.nodeid);
        tests.push(TestCaseResult {
            id: collector.nodeid.clone(),
            file,
            name: "<collection>".to_string(),
            outcome: TestOutcome::Error,
            duration_ms: None,
            error: collector.longrepr.map(truncate_error),
        });
    }

    Ok(ExecutionReport {
        tests,
        process_exit_code: raw.exitcode,
        duration_ms: secs_to_ms(raw.duration),
    })
}

fn stage_error(stage: &RawStage) -> Option<String> {
    stage
        .longrepr
        .clone()
        .or_else(|| stage.crash.as_ref().and_then(|c| c.message.clone()))
        .map(truncate_error)
}

/// `tests/test_login.py::TestLogin::test_ok` -> (`test_login.py`, `TestLogin::test_ok`)
fn split_nodeid(nodeid: &str) -> (String, String) {
    let (path, name) = nodeid.split_once("::").unwrap_or((nodeid, ""));
    let file = path.rsplit('/').next().unwrap_or(path).to_string();
    (file, name.to_string())
}

fn secs_to_ms(secs: f64) -> u64 {
    (secs.max(0.0) * 1000.0).round() as u64
}

fn truncate_error(text: String) -> String {
    if text.chars().count() <= MAX_ERROR_CHARS {
        return text;
    }
    // Keep the tail: assertion details live at the end of a traceback.
    let skip = text.chars().count() - MAX_ERROR_CHARS;
    text.chars().skip(skip).collect()
}
