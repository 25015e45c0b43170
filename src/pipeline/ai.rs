use std::process::Stdio;
use std::sync::LazyLock;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use tokio::process::Command;
use tracing::{debug, warn};

use super::models::{DiscoveredPage, GeneratedFile};
use super::scenarios::{self, ScenarioTemplate};

/// Selectors listed per page in a generation prompt.
const MAX_SELECTORS_PER_PAGE: usize = 25;
/// Selectors listed in a fix prompt.
const MAX_FIX_SELECTORS: usize = 60;
/// Error output included in a fix prompt.
const MAX_ERROR_CHARS: usize = 2000;
/// Shortest generated file accepted as a real test.
const MIN_TEST_CODE_CHARS: usize = 100;

/// Markers every generated Playwright test file must contain.
const REQUIRED_TEST_MARKERS: &[&str] = &["playwright", "async def test_", "await page."];

/// JavaScript-style Playwright calls models emit for the Python API.
const CAMEL_CASE_CALLS: &[(&str, &str)] = &[
    (".newPage(", ".new_page("),
    (".querySelectorAll(", ".query_selector_all("),
    (".querySelector(", ".query_selector("),
    (".waitForSelector(", ".wait_for_selector("),
    (".waitForTimeout(", ".wait_for_timeout("),
    (".waitForNavigation(", ".wait_for_navigation("),
    (".waitForLoadState(", ".wait_for_load_state("),
];

static CODE_FENCE_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)```(?:python|py)?[ \t]*\n(.*?)```").unwrap());

/// Input to test generation.
#[derive(Debug, Clone)]
pub struct GenerationContext {
    pub url: String,
    pub story: Option<String>,
    pub pages: Vec<DiscoveredPage>,
    /// Recorded test already in the suite (hybrid mode).
    pub recorded: Option<GeneratedFile>,
    pub scenario: Option<&'static ScenarioTemplate>,
}

#[derive(Debug, Clone)]
pub struct GeneratedSuite {
    pub files: Vec<GeneratedFile>,
    pub model: String,
}

/// One healing request: a test file and the failures observed in it.
#[derive(Debug, Clone)]
pub struct FixRequest {
    pub file: String,
    pub failing_tests: Vec<String>,
    pub source: String,
    pub error_output: String,
    pub selectors: Vec<String>,
}

/// A replacement for the whole test file.
#[derive(Debug, Clone, PartialEq)]
pub struct FixProposal {
    pub fix: String,
    pub confidence: f32,
    pub issue: String,
}

/// Language-model seam used by generation and healing.
#[async_trait]
pub trait AiAdapter: Send + Sync {
    async fn generate_tests(&self, ctx: &GenerationContext) -> Result<GeneratedSuite>;

    async fn propose_fix(&self, request: &FixRequest) -> Result<FixProposal>;
}

/// Where completions come from.
#[derive(Debug, Clone)]
pub enum LlmBackend {
    /// The `claude` CLI in print mode.
    ClaudeCli {
        command: String,
        model: Option<String>,
    },
    /// An Ollama server's `/api/generate` endpoint.
    Ollama {
        client: reqwest::Client,
        base_url: String,
        model: String,
    },
}

#[derive(Deserialize)]
struct OllamaResponse {
    #[serde(default)]
    response: String,
}

impl LlmBackend {
    pub fn ollama(base_url: &str, model: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build Ollama HTTP client")?;
        Ok(Self::Ollama {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
        })
    }

    pub fn model_name(&self) -> String {
        match self {
            Self::ClaudeCli { model, .. } => model.clone().unwrap_or_else(|| "claude".to_string()),
            Self::Ollama { model, .. } => model.clone(),
        }
    }

    async fn complete(&self, system: &str, prompt: &str) -> Result<String> {
        match self {
            Self::ClaudeCli { command, model } => {
                let mut cmd = Command::new(command);
                cmd.args(["--print", "--output-format", "text", "-p", prompt, "--system", system]);
                if let Some(model) = model {
                    cmd.args(["--model", model.as_str()]);
                }
                let output = cmd
                    .stdout(Stdio::piped())
                    .stderr(Stdio::piped())
                    .kill_on_drop(true)
                    .output()
                    .await
                    .with_context(|| format!("Failed to run {} CLI", command))?;
                if !output.status.success() {
                    let stderr = String::from_utf8_lossy(&output.stderr);
                    anyhow::bail!("Claude CLI failed: {}", stderr.trim());
                }
                Ok(String::from_utf8_lossy(&output.stdout).to_string())
            }
            Self::Ollama {
                client,
                base_url,
                model,
            } => {
                let body = serde_json::json!({
                    "model": model,
                    "system": system,
                    "prompt": prompt,
                    "stream": false,
                    "options": {"temperature": 0.2},
                });
                let response: OllamaResponse = client
                    .post(format!("{}/api/generate", base_url))
                    .json(&body)
                    .send()
                    .await
                    .with_context(|| format!("Failed to reach Ollama at {}", base_url))?
                    .error_for_status()
                    .context("Ollama returned an error status")?
                    .json()
                    .await
                    .context("Invalid Ollama response body")?;
                Ok(response.response)
            }
        }
    }
}

/// [`AiAdapter`] backed by prompt-driven language models.
///
/// Backends are tried in order; a backend that fails or answers with
/// output that does not parse or validate hands over to the next one.
pub struct LlmAdapter {
    backends: Vec<LlmBackend>,
}

impl LlmAdapter {
    pub fn new(backend: LlmBackend) -> Self {
        Self {
            backends: vec![backend],
        }
    }

    pub fn with_fallbacks(mut self, fallbacks: impl IntoIterator<Item = LlmBackend>) -> Self {
        self.backends.extend(fallbacks);
        self
    }

    pub fn models(&self) -> Vec<String> {
        self.backends.iter().map(LlmBackend::model_name).collect()
    }

    /// First backend whose response `accept` takes, with that backend's model name.
    async fn first_usable<T>(
        &self,
        system: &str,
        prompt: &str,
        accept: impl Fn(&str) -> Result<T>,
    ) -> Result<(T, String)> {
        let mut last_error = None;
        for backend in &self.backends {
            let model = backend.model_name();
            let attempt = match backend.complete(system, prompt).await {
                Ok(raw) => accept(&raw),
                Err(e) => Err(e),
            };
            match attempt {
                Ok(value) => return Ok((value, model)),
                Err(e) => {
                    warn!(model = %model, error = %e, "Model output unusable, trying next model");
                    last_error = Some(e);
                }
            }
        }
        match last_error {
            Some(e) => Err(e.context(format!(
                "All models failed ({})",
                self.models().join(", ")
            ))),
            None => anyhow::bail!("No language model configured"),
        }
    }
}

#[async_trait]
impl AiAdapter for LlmAdapter {
    async fn generate_tests(&self, ctx: &GenerationContext) -> Result<GeneratedSuite> {
        let prompt = generation_prompt(ctx);
        debug!(models = ?self.models(), pages = ctx.pages.len(), "Requesting test generation");
        let (files, model) = self
            .first_usable(GENERATION_SYSTEM_PROMPT, &prompt, accept_generated_files)
            .await?;
        Ok(GeneratedSuite { files, model })
    }

    async fn propose_fix(&self, request: &FixRequest) -> Result<FixProposal> {
        let prompt = fix_prompt(request);
        debug!(models = ?self.models(), file = %request.file, "Requesting fix");
        let (mut proposal, _) = self
            .first_usable(HEALING_SYSTEM_PROMPT, &prompt, parse_fix)
            .await?;
        proposal.fix = fix_common_playwright_mistakes(&proposal.fix);
        Ok(proposal)
    }
}

const GENERATION_SYSTEM_PROMPT: &str = r#"You are a senior QA engineer writing end-to-end browser tests with pytest and Playwright's async Python API.

Rules:
- Every test is an `async def test_*` function using `async_playwright()`.
- Launch chromium with `headless=os.getenv("HEADED", "0") != "1"`.
- Save screenshots under `os.getenv("ARTIFACTS_DIR", "artifacts")`.
- Use only selectors that appear in the page inventory you are given.
- Close the browser in a `finally` block.

You MUST respond with valid JSON only (no markdown, no explanation) matching this schema:
{"files": [{"name": "test_<area>.py", "content": "<complete python file>"}]}"#;

const HEALING_SYSTEM_PROMPT: &str = r#"You repair failing Playwright pytest tests. You receive one test file, the failures observed in it and the selectors that exist on the site.

Return the COMPLETE corrected file, not a diff. Keep passing tests unchanged.

You MUST respond with valid JSON only (no markdown, no explanation) matching this schema:
{"issue": "<one sentence root cause>", "confidence": <0.0-1.0>, "fix": "<complete corrected python file>"}"#;

fn generation_prompt(ctx: &GenerationContext) -> String {
    let mut prompt = format!("Target site: {}\n", ctx.url);
    if let Some(story) = &ctx.story {
        prompt.push_str(&format!("\nUser story to cover:\n{}\n", story));
    }
    if let Some(template) = ctx.scenario {
        prompt.push_str(&scenarios::prompt_section(template));
    }
    if !ctx.pages.is_empty() {
        prompt.push_str("\nPage inventory:\n");
        for page in &ctx.pages {
            prompt.push_str(&format!(
                "\n- {} ({})\n",
                page.url,
                page.title.as_deref().unwrap_or("untitled")
            ));
            for element in page.elements.iter().take(MAX_SELECTORS_PER_PAGE) {
                match &element.text {
                    Some(text) => prompt.push_str(&format!("    {} \"{}\"\n", element.selector, text)),
                    None => prompt.push_str(&format!("    {}\n", element.selector)),
                }
            }
        }
    }
    if let Some(recorded) = &ctx.recorded {
        prompt.push_str(&format!(
            "\nThe suite already contains this recorded test ({}); cover different behavior:\n{}\n",
            recorded.name, recorded.content
        ));
    }
    prompt
}

fn fix_prompt(request: &FixRequest) -> String {
    let selectors = request
        .selectors
        .iter()
        .take(MAX_FIX_SELECTORS)
        .map(String::as_str)
        .collect::<Vec<_>>()
        .join("\n");
    format!(
        "Test file: {}\nFailing tests: {}\n\nError output:\n{}\n\nKnown selectors:\n{}\n\nCurrent file:\n{}\n",
        request.file,
        request.failing_tests.join(", "),
        truncate_chars(&request.error_output, MAX_ERROR_CHARS),
        if selectors.is_empty() { "(none discovered)" } else { selectors.as_str() },
        request.source,
    )
}

fn truncate_chars(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// The `{...}` span of a response, tolerating prose or fences around it.
fn json_span(raw: &str) -> Option<&str> {
    let start = raw.find('{')?;
    let end = raw.rfind('}')?;
    (end > start).then(|| &raw[start..=end])
}

/// Strip a surrounding markdown code fence, if any.
pub fn clean_code(raw: &str) -> String {
    let trimmed = raw.trim();
    match CODE_FENCE_REGEX.captures(trimmed) {
        Some(cap) if trimmed.starts_with("```") => cap[1].trim_end().to_string() + "\n",
        _ => format!("{}\n", trimmed),
    }
}

/// Force a name pytest will collect: a bare `test_*.py` file name.
fn normalize_test_name(raw: &str, index: usize) -> String {
    let base = raw.rsplit(['/', '\\']).next().unwrap_or(raw).trim();
    let stem = base.strip_suffix(".py").unwrap_or(base);
    let stem: String = stem
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect();
    match stem.as_str() {
        "" => format!("test_generated_{}.py", index + 1),
        s if s.starts_with("test_") => format!("{}.py", s),
        s => format!("test_{}.py", s),
    }
}

#[derive(Deserialize)]
struct RawSuite {
    files: Vec<RawFile>,
}

#[derive(Deserialize)]
struct RawFile {
    #[serde(default)]
    name: String,
    content: String,
}

pub fn parse_generated_files(raw: &str) -> Result<Vec<GeneratedFile>> {
    let parsed = json_span(raw).and_then(|span| serde_json::from_str::<RawSuite>(span).ok());
    let mut files: Vec<GeneratedFile> = match parsed {
        Some(suite) => suite
            .files
            .into_iter()
            .enumerate()
            .filter(|(_, f)| !f.content.trim().is_empty())
            .map(|(i, f)| GeneratedFile::new(normalize_test_name(&f.name, i), clean_code(&f.content)))
            .collect(),
        None => {
            warn!("Generation response was not JSON; falling back to code blocks");
            CODE_FENCE_REGEX
                .captures_iter(raw)
                .map(|cap| cap[1].to_string())
                .filter(|code| code.contains("def test_"))
                .enumerate()
                .map(|(i, code)| GeneratedFile::new(format!("test_generated_{}.py", i + 1), code))
                .collect()
        }
    };
    // Later duplicates would overwrite earlier files on disk.
    let mut seen = std::collections::HashSet::new();
    files.retain(|f| seen.insert(f.name.clone()));
    if files.is_empty() {
        anyhow::bail!("Model response contained no test files");
    }
    Ok(files)
}

/// Rewrite JavaScript-style Playwright calls to the Python API.
pub fn fix_common_playwright_mistakes(code: &str) -> String {
    CAMEL_CASE_CALLS
        .iter()
        .fold(code.to_string(), |code, (camel, snake)| code.replace(camel, snake))
}

/// Check that generated code looks like a runnable async Playwright test.
pub fn validate_test_code(code: &str) -> Result<()> {
    let trimmed = code.trim();
    if trimmed.chars().count() < MIN_TEST_CODE_CHARS {
        anyhow::bail!("test code is shorter than {} characters", MIN_TEST_CODE_CHARS);
    }
    let lowered = trimmed.to_lowercase();
    if let Some(missing) = REQUIRED_TEST_MARKERS.iter().find(|m| !lowered.contains(*m)) {
        anyhow::bail!("test code does not contain '{}'", missing);
    }
    Ok(())
}

/// Parse a generation response and keep only files that validate.
pub fn accept_generated_files(raw: &str) -> Result<Vec<GeneratedFile>> {
    let mut accepted = Vec::new();
    for mut file in parse_generated_files(raw)? {
        file.content = fix_common_playwright_mistakes(&file.content);
        match validate_test_code(&file.content) {
            Ok(()) => accepted.push(file),
            Err(e) => warn!(file = %file.name, error = %e, "Discarding generated file"),
        }
    }
    if accepted.is_empty() {
        anyhow::bail!("Model response contained no valid Playwright tests");
    }
    Ok(accepted)
}

#[derive(Deserialize)]
struct RawFix {
    #[serde(default)]
    issue: Option<String>,
    #[serde(default)]
    confidence: Option<f32>,
    fix: String,
}

pub fn parse_fix(raw: &str) -> Result<FixProposal> {
    if let Some(span) = json_span(raw)
        && let Ok(fix) = serde_json::from_str::<RawFix>(span)
    {
        let code = clean_code(&fix.fix);
        if code.trim().is_empty() {
            anyhow::bail!("Model proposed an empty fix");
        }
        return Ok(FixProposal {
            fix: code,
            confidence: fix.confidence.unwrap_or(0.5).clamp(0.0, 1.0),
            issue: fix
                .issue
                .filter(|i| !i.trim().is_empty())
                .unwrap_or_else(|| "unspecified".to_string()),
        });
    }
    let code = CODE_FENCE_REGEX
        .captures(raw)
        .map(|cap| cap[1].to_string())
        .context("Model response contained neither JSON nor a code block")?;
    Ok(FixProposal {
        fix: code,
        confidence: 0.5,
        issue: "unstructured model response".to_string(),
    })
}
