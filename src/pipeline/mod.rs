//! Run pipeline: AI-driven browser end-to-end test runs.
//!
//! ## Overview
//!
//! A run takes a target URL through a mode-specific phase sequence
//! (`ai`: discovery → generation → execution, `record`: recording →
//! execution, `hybrid`: recording → generation → execution), then heals
//! failing tests with model-proposed fixes until they pass or the run's
//! attempt budget is spent. Every transition is committed to SQLite and
//! broadcast to progress subscribers.
//!
//! ## Module Map
//!
//! ```text
//! ┌──────────┐   HTTP   ┌──────────────────────────────────────────────────┐
//! │  Client  │ ───────> │  server.rs  (router, wiring, graceful shutdown)  │
//! │          │ <─────── │    ├─ api.rs  (route handlers, AppState)         │
//! └──────────┘ WebSocket│    └─ ws.rs   (progress socket, WsMessage)       │
//!                       │         │                                        │
//!                       │         │ PipelineRunner::start()                │
//!                       │         v                                        │
//!                       │  runner.rs  (one task per run, state machine)    │
//!                       │    └─ healing.rs  (fix → apply → re-execute)     │
//!                       │         │                                        │
//!                       │         │ PhaseController::run()                 │
//!                       │         v                                        │
//!                       │  phase.rs  (timeouts, persist-before-commit)     │
//!                       │    ├─ browser.rs  (BrowserDriver: crawl,         │
//!                       │    │               record, run_tests)            │
//!                       │    ├─ ai.rs       (AiAdapter: generate, fix)     │
//!                       │    └─ artifacts.rs (ArtifactStore)               │
//!                       └──────────────────────────────────────────────────┘
//! ```
//!
//! ## Supporting Modules
//!
//! | Module          | Responsibility                                        |
//! |-----------------|-------------------------------------------------------|
//! | `models`        | Run record, phases, statuses, phase result shapes     |
//! | `db`            | SQLite access via `DbHandle` (`Arc<Mutex<_>>`)        |
//! | `progress`      | `ProgressHub`: one broadcast channel per run          |
//! | `crawler`       | Same-host HTML crawler behind discovery               |
//! | `recorder`      | Playwright codegen script → pytest file               |
//! | `pytest_report` | `pytest-json-report` output → per-test results        |
//! | `scenarios`     | Scenario templates that steer generation              |

pub mod ai;
pub mod api;
pub mod artifacts;
pub mod browser;
pub mod crawler;
pub mod db;
#[cfg(test)]
pub(crate) mod fakes;
mod healing;
pub mod models;
pub mod phase;
pub mod progress;
pub mod pytest_report;
pub mod recorder;
pub mod runner;
pub mod scenarios;
pub mod server;
pub mod ws;
