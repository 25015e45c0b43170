use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Instant;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info};

use super::crawler::Crawler;
use super::models::{DiscoveredPage, ExecutionReport, GeneratedFile, RunId};
use super::pytest_report;

/// Knobs for one test-suite invocation.
#[derive(Debug, Clone)]
pub struct ExecutionOptions {
    pub headed: bool,
    /// Distinguishes scratch directories of repeated executions.
    pub attempt: u32,
}

/// Browser-side executor: crawling, recording and running test suites.
///
/// Implementations must be cancel-safe: the phase controller drops the
/// future on timeout.
#[async_trait]
pub trait BrowserDriver: Send + Sync {
    async fn crawl(&self, url: &str, depth: u32, max_pages: usize) -> Result<Vec<DiscoveredPage>>;

    /// Record a user session against `url` and return the raw codegen script.
    async fn record(&self, run_id: RunId, url: &str) -> Result<String>;

    async fn run_tests(
        &self,
        run_id: RunId,
        files: &[GeneratedFile],
        options: &ExecutionOptions,
    ) -> Result<ExecutionReport>;
}

/// Drives Playwright and pytest as child processes.
pub struct PlaywrightDriver {
    workspace: PathBuf,
    python_cmd: String,
    playwright_cmd: String,
    crawler: Crawler,
}

impl PlaywrightDriver {
    pub fn new(
        workspace: impl Into<PathBuf>,
        python_cmd: impl Into<String>,
        playwright_cmd: impl Into<String>,
        crawler: Crawler,
    ) -> Self {
        Self {
            workspace: workspace.into(),
            python_cmd: python_cmd.into(),
            playwright_cmd: playwright_cmd.into(),
            crawler,
        }
    }

    fn run_dir(&self, run_id: RunId) -> PathBuf {
        self.workspace.join(run_id.to_string())
    }
}

const PYTEST_INI: &str = "[pytest]\nasyncio_mode = auto\n";

/// Last `max_lines` lines of process output, for error messages.
fn tail(bytes: &[u8], max_lines: usize) -> String {
    let text = String::from_utf8_lossy(bytes);
    let lines: Vec<&str> = text.lines().collect();
    lines[lines.len().saturating_sub(max_lines)..].join("\n")
}

async fn write_suite(dir: &Path, files: &[GeneratedFile]) -> Result<()> {
    let tests_dir = dir.join("tests");
    if tests_dir.exists() {
        tokio::fs::remove_dir_all(&tests_dir)
            .await
            .with_context(|| format!("Failed to clear {}", tests_dir.display()))?;
    }
    tokio::fs::create_dir_all(&tests_dir)
        .await
        .with_context(|| format!("Failed to create {}", tests_dir.display()))?;
    tokio::fs::write(dir.join("pytest.ini"), PYTEST_INI)
        .await
        .context("Failed to write pytest.ini")?;
    for file in files {
        let name = Path::new(&file.name)
            .file_name()
            .with_context(|| format!("Invalid test file name '{}'", file.name))?;
        tokio::fs::write(tests_dir.join(name), &file.content)
            .await
            .with_context(|| format!("Failed to write {}", file.name))?;
    }
    Ok(())
}

#[async_trait]
impl BrowserDriver for PlaywrightDriver {
    async fn crawl(&self, url: &str, depth: u32, max_pages: usize) -> Result<Vec<DiscoveredPage>> {
        self.crawler.crawl(url, depth, max_pages).await
    }

    async fn record(&self, run_id: RunId, url: &str) -> Result<String> {
        let dir = self.run_dir(run_id).join("recording");
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("Failed to create {}", dir.display()))?;
        let output_path = dir.join("codegen.py");

        info!(run_id = %run_id, url, "Launching playwright codegen");
        let output = Command::new(&self.playwright_cmd)
            .arg("codegen")
            .arg(url)
            .arg("--output")
            .arg(&output_path)
            .args(["--target", "python-async"])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .with_context(|| format!("Failed to run {} codegen", self.playwright_cmd))?;

        if !output.status.success() {
            anyhow::bail!(
                "playwright codegen exited with {}: {}",
                output.status,
                tail(&output.stderr, 20)
            );
        }
        let script = tokio::fs::read_to_string(&output_path)
            .await
            .context("Recording produced no script")?;
        if script.trim().is_empty() {
            anyhow::bail!("Recording produced an empty script");
        }
        Ok(script)
    }

    async fn run_tests(
        &self,
        run_id: RunId,
        files: &[GeneratedFile],
        options: &ExecutionOptions,
    ) -> Result<ExecutionReport> {
        let dir = self
            .run_dir(run_id)
            .join(format!("execution-{}", options.attempt));
        write_suite(&dir, files).await?;
        let report_path = dir.join("report.json");
        let _ = tokio::fs::remove_file(&report_path).await;

        debug!(run_id = %run_id, dir = %dir.display(), files = files.len(), "Running pytest");
        let started = Instant::now();
        let output = Command::new(&self.python_cmd)
            .args(["-m", "pytest", "tests", "-q", "--json-report"])
            .arg(format!("--json-report-file={}", report_path.display()))
            .current_dir(&dir)
            .env("ARTIFACTS_DIR", dir.join("artifacts"))
            .env("HEADED", if options.headed { "1" } else { "0" })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .with_context(|| format!("Failed to run {} -m pytest", self.python_cmd))?;
        let elapsed = started.elapsed();

        let raw = match tokio::fs::read_to_string(&report_path).await {
            Ok(raw) => raw,
            Err(_) => {
                let mut detail = tail(&output.stderr, 20);
                if detail.trim().is_empty() {
                    detail = tail(&output.stdout, 20);
                }
                anyhow::bail!(
                    "pytest produced no report (exit {}): {}",
                    output.status,
                    detail
                );
            }
        };
        let mut report = pytest_report::parse(&raw)?;
        report.process_exit_code = output.status.code().or(report.process_exit_code);
        if report.duration_ms == 0 {
            report.duration_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;
    use uuid::Uuid;

    #[test]
    fn test_tail_keeps_last_lines() {
        assert_eq!(tail(b"a\nb\nc\nd", 2), "c\nd");
        assert_eq!(tail(b"only", 5), "only");
        assert_eq!(tail(b"", 3), "");
    }

    #[tokio::test]
    async fn test_write_suite_replaces_previous_files() -> Result<()> {
        let tmp = TempDir::new()?;
        write_suite(
            tmp.path(),
            &[GeneratedFile::new("test_old.py", "def test_old(): pass\n")],
        )
        .await?;
        write_suite(
            tmp.path(),
            &[GeneratedFile::new("test_new.py", "def test_new(): pass\n")],
        )
        .await?;
        assert!(!tmp.path().join("tests/test_old.py").exists());
        assert!(tmp.path().join("tests/test_new.py").exists());
        assert!(tmp.path().join("pytest.ini").exists());
        Ok(())
    }

    #[tokio::test]
    async fn test_run_tests_reports_missing_runner() -> Result<()> {
        let tmp = TempDir::new()?;
        let driver = PlaywrightDriver::new(
            tmp.path(),
            "definitely-not-a-python-binary",
            "definitely-not-playwright",
            Crawler::new(Duration::from_secs(5))?,
        );
        let err = driver
            .run_tests(
                Uuid::new_v4(),
                &[GeneratedFile::new("test_a.py", "def test_a(): pass\n")],
                &ExecutionOptions {
                    headed: false,
                    attempt: 0,
                },
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("definitely-not-a-python-binary"));
        Ok(())
    }
}
