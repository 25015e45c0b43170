//! Turns a `playwright codegen --target python-async` script into a pytest
//! test and classifies the recorded actions.

use super::models::{ActionKind, RecordedAction};

pub const RECORDED_TEST_FILE: &str = "test_recorded_workflow.py";

const HEADER: &str = r#"import os

import pytest
from playwright.async_api import async_playwright


@pytest.mark.asyncio
async def test_recorded_workflow():
    """Replay of a recorded user workflow."""
    artifacts_dir = os.getenv("ARTIFACTS_DIR", "artifacts")
    os.makedirs(artifacts_dir, exist_ok=True)
    headed = os.getenv("HEADED", "0") == "1"

    async with async_playwright() as p:
        browser = await p.chromium.launch(headless=not headed)
        context = await browser.new_context(viewport={"width": 1920, "height": 1080})
        page = await context.new_page()
        try:
"#;

const FOOTER: &str = r#"            await page.screenshot(path=os.path.join(artifacts_dir, "recorded_success.png"))
        except Exception:
            await page.screenshot(path=os.path.join(artifacts_dir, "recorded_error.png"))
            raise
        finally:
            await context.close()
            await browser.close()
"#;

/// Page interactions in the recorded script, in order, each awaited.
fn page_statements(script: &str) -> impl Iterator<Item = String> + '_ {
    script.lines().filter_map(|line| {
        let line = line.trim();
        let stmt = line.strip_prefix("await ").unwrap_or(line);
        if !stmt.starts_with("page.") {
            return None;
        }
        let mut stmt = stmt.to_string();
        // Role locators often match several nodes; pin to the first.
        if stmt.contains("get_by_role") && !stmt.contains(".first") {
            stmt = stmt
                .replace(".click(", ".first.click(")
                .replace(".fill(", ".first.fill(");
        }
        Some(format!("await {}", stmt))
    })
}

/// Wrap the recorded interactions into a standalone async pytest test.
pub fn to_pytest(script: &str) -> String {
    let mut out = String::from(HEADER);
    let mut any = false;
    for stmt in page_statements(script) {
        out.push_str("            ");
        out.push_str(&stmt);
        out.push('\n');
        any = true;
    }
    if !any {
        out.push_str("            pass\n");
    }
    out.push_str(FOOTER);
    out
}

pub fn classify_actions(script: &str) -> Vec<RecordedAction> {
    page_statements(script)
        .filter_map(|stmt| {
            let kind = if stmt.contains(".goto(") {
                ActionKind::Navigation
            } else if stmt.contains(".fill(") || stmt.contains(".type(") || stmt.contains(".press(")
            {
                ActionKind::Input
            } else if stmt.contains(".select_option(") {
                ActionKind::Select
            } else if stmt.contains(".check(") || stmt.contains(".uncheck(") {
                ActionKind::Check
            } else if stmt.contains(".click(") || stmt.contains(".dblclick(") {
                ActionKind::Click
            } else {
                return None;
            };
            Some(RecordedAction { kind, line: stmt })
        })
        .collect()
}
