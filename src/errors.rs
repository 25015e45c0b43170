//! Typed error hierarchy for the run pipeline.
//!
//! Three top-level enums cover the three layers:
//! - `ConfigError`: a run request that fails validation (no record is created)
//! - `PhaseError`: a single phase that could not produce a committed result
//! - `PipelineError`: orchestrator and API-facing failures

use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

use crate::pipeline::models::{Phase, RunStatus};

/// A run request rejected before any Run Record exists.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("Invalid target URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("Unknown run mode '{0}' (expected ai, record or hybrid)")]
    UnknownMode(String),

    #[error("Unknown preset '{0}' (expected quick, balanced or deep)")]
    UnknownPreset(String),

    #[error("Unknown browser visibility '{0}' (expected headless or headed)")]
    UnknownVisibility(String),

    #[error("Unknown scenario '{0}' (expected auto or a template id from /api/scenarios/templates)")]
    UnknownScenario(String),

    #[error("maxHealAttempts must be between {min} and {max}, got {value}")]
    HealAttemptsOutOfRange { value: i64, min: u32, max: u32 },
}

/// Errors from a single phase execution.
#[derive(Debug, Error)]
pub enum PhaseError {
    #[error("{phase} timed out after {}s", after.as_secs())]
    Timeout { phase: Phase, after: Duration },

    #[error("{phase} executor failed: {message}")]
    Executor { phase: Phase, message: String },

    #[error("{phase} produced no usable output: {reason}")]
    EmptyOutput { phase: Phase, reason: String },

    #[error("Failed to persist {phase} result: {source}")]
    Persistence {
        phase: Phase,
        #[source]
        source: anyhow::Error,
    },
}

impl PhaseError {
    pub fn phase(&self) -> Phase {
        match self {
            Self::Timeout { phase, .. }
            | Self::Executor { phase, .. }
            | Self::EmptyOutput { phase, .. }
            | Self::Persistence { phase, .. } => *phase,
        }
    }

    /// Timeouts and executor failures may succeed on a later attempt;
    /// a result that could not be stored or was empty will not.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::Executor { .. })
    }
}

/// Errors from the orchestrator and the HTTP surface.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Run {id} not found")]
    RunNotFound { id: Uuid },

    #[error("Run {id} is already {status} and cannot be cancelled")]
    NotCancellable { id: Uuid, status: RunStatus },

    #[error("Run {id} is driven by another testforge process and cannot be cancelled here")]
    OwnedElsewhere { id: Uuid },

    #[error(transparent)]
    InvalidConfig(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[source] anyhow::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
