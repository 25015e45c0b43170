use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use uuid::Uuid;

use super::models::*;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Async-safe handle to the run database.
///
/// Wraps `RunDb` behind `Arc<Mutex>` and runs all access on tokio's blocking
/// thread pool via `spawn_blocking`, so synchronous SQLite I/O never ties up
/// async worker threads.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<RunDb>>,
}

impl DbHandle {
    pub fn new(db: RunDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&RunDb) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db
                .lock()
                .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }

    /// Acquire the database mutex synchronously. Only for startup and tests.
    pub fn lock_sync(&self) -> Result<std::sync::MutexGuard<'_, RunDb>> {
        self.inner
            .lock()
            .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))
    }
}

/// How a run ends. Applied exactly once by `RunDb::finalize_run`.
#[derive(Debug, Clone)]
pub struct RunFinalization {
    pub status: RunStatus,
    pub phase: Phase,
    pub error: Option<RunError>,
    pub exit_code: Option<i32>,
    pub healed: Option<bool>,
}

/// One connection to the run database.
///
/// Every `RunDb` registers itself as an instance and stamps the runs it
/// creates with that instance id. The interrupted-run sweep only touches runs
/// whose owning instance has stopped heartbeating.
pub struct RunDb {
    conn: Connection,
    instance: Uuid,
}

impl RunDb {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        conn.busy_timeout(BUSY_TIMEOUT)
            .context("Failed to set SQLite busy timeout")?;
        let db = Self {
            conn,
            instance: Uuid::new_v4(),
        };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self {
            conn,
            instance: Uuid::new_v4(),
        };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON;")
            .context("Failed to enable foreign keys")?;
        self.run_migrations().context("Failed to run migrations")?;
        self.heartbeat().context("Failed to register database instance")?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS runs (
                    id TEXT PRIMARY KEY,
                    mode TEXT NOT NULL,
                    config TEXT NOT NULL,
                    status TEXT NOT NULL DEFAULT 'queued',
                    phase TEXT NOT NULL DEFAULT 'starting',
                    progress INTEGER NOT NULL DEFAULT 0,
                    error_phase TEXT,
                    error_message TEXT,
                    exit_code INTEGER,
                    healed INTEGER,
                    created_at TEXT NOT NULL,
                    started_at TEXT,
                    completed_at TEXT,
                    owner TEXT
                );

                CREATE TABLE IF NOT EXISTS instances (
                    id TEXT PRIMARY KEY,
                    pid INTEGER NOT NULL,
                    started_at TEXT NOT NULL,
                    heartbeat_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS phase_results (
                    run_id TEXT NOT NULL REFERENCES runs(id) ON DELETE CASCADE,
                    phase TEXT NOT NULL,
                    result TEXT NOT NULL,
                    recorded_at TEXT NOT NULL,
                    PRIMARY KEY (run_id, phase)
                );

                CREATE TABLE IF NOT EXISTS healing_attempts (
                    run_id TEXT NOT NULL REFERENCES runs(id) ON DELETE CASCADE,
                    attempt INTEGER NOT NULL,
                    record TEXT NOT NULL,
                    PRIMARY KEY (run_id, attempt)
                );

                CREATE TABLE IF NOT EXISTS run_logs (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    run_id TEXT NOT NULL REFERENCES runs(id) ON DELETE CASCADE,
                    message TEXT NOT NULL,
                    created_at TEXT NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_runs_status ON runs(status);
                CREATE INDEX IF NOT EXISTS idx_runs_created ON runs(created_at);
                CREATE INDEX IF NOT EXISTS idx_run_logs_run ON run_logs(run_id);
                ",
            )
            .context("Failed to create tables")?;

        // Databases created before runs carried an owner.
        let has_owner: bool = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM pragma_table_info('runs') WHERE name = 'owner'",
                [],
                |row| row.get::<_, i64>(0),
            )
            .context("Failed to inspect runs table")?
            > 0;
        if !has_owner {
            self.conn
                .execute_batch("ALTER TABLE runs ADD COLUMN owner TEXT;")
                .context("Failed to add runs.owner")?;
        }
        Ok(())
    }

    // ── Instances ─────────────────────────────────────────────────────

    pub fn instance_id(&self) -> Uuid {
        self.instance
    }

    /// Whether `id` belongs to another instance that heartbeated within
    /// `stale_after`.
    pub fn owned_by_live_instance(&self, id: RunId, stale_after: Duration) -> Result<bool> {
        let stale = chrono::Duration::from_std(stale_after).context("Invalid stale window")?;
        let cutoff = timestamp(Utc::now() - stale);
        let live: i64 = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM runs r JOIN instances i ON i.id = r.owner
                 WHERE r.id = ?1 AND r.owner != ?2 AND i.heartbeat_at > ?3",
                params![id.to_string(), self.instance.to_string(), cutoff],
                |row| row.get(0),
            )
            .context("Failed to look up run owner")?;
        Ok(live > 0)
    }

    /// Register this instance, or refresh its heartbeat.
    pub fn heartbeat(&self) -> Result<()> {
        let now = timestamp(Utc::now());
        self.conn
            .execute(
                "INSERT INTO instances (id, pid, started_at, heartbeat_at) VALUES (?1, ?2, ?3, ?3)
                 ON CONFLICT(id) DO UPDATE SET heartbeat_at = excluded.heartbeat_at",
                params![self.instance.to_string(), std::process::id(), now],
            )
            .context("Failed to record instance heartbeat")?;
        Ok(())
    }

    // ── Run lifecycle ─────────────────────────────────────────────────

    pub fn create_run(&self, config: &RunConfig) -> Result<RunRecord> {
        let id = Uuid::new_v4();
        let config_json = serde_json::to_string(config).context("Failed to serialize config")?;
        self.conn
            .execute(
                "INSERT INTO runs (id, mode, config, status, phase, progress, created_at, owner)
                 VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6, ?7)",
                params![
                    id.to_string(),
                    config.mode.as_str(),
                    config_json,
                    RunStatus::Queued.as_str(),
                    Phase::Starting.as_str(),
                    timestamp(Utc::now()),
                    self.instance.to_string(),
                ],
            )
            .context("Failed to insert run")?;
        self.get_run(id)?.context("Run not found after insert")
    }

    pub fn get_run(&self, id: RunId) -> Result<Option<RunRecord>> {
        let row = self
            .conn
            .query_row(
                "SELECT id, mode, config, status, phase, progress, error_phase, error_message,
                        exit_code, healed, created_at, started_at, completed_at
                 FROM runs WHERE id = ?1",
                params![id.to_string()],
                RunRow::from_row,
            )
            .optional()
            .context("Failed to query run")?;
        let Some(row) = row else {
            return Ok(None);
        };

        let mut phase_results = self.load_phase_results(id)?;
        let attempts = self.load_healing_attempts(id)?;
        let healed = row.healed.map(|h| h != 0);
        if !attempts.is_empty() {
            let final_result = match phase_results.get(&Phase::Execution) {
                Some(PhaseResult::Execution(result)) => Some(result.clone()),
                _ => None,
            };
            phase_results.insert(
                Phase::Healing,
                PhaseResult::Healing(HealingReport {
                    healing_attempts: attempts.len(),
                    healed: healed.unwrap_or(false),
                    attempts,
                    final_result,
                }),
            );
        }
        Ok(Some(row.into_record(phase_results)?))
    }

    /// Run summaries, newest first.
    pub fn list_runs(&self, limit: usize) -> Result<Vec<RunSummary>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, mode, config, status, phase, progress, created_at, completed_at
                 FROM runs ORDER BY created_at DESC, rowid DESC LIMIT ?1",
            )
            .context("Failed to prepare list_runs")?;
        let rows = stmt
            .query_map(params![limit as i64], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, i64>(5)?,
                    row.get::<_, String>(6)?,
                    row.get::<_, Option<String>>(7)?,
                ))
            })
            .context("Failed to query runs")?;
        let mut runs = Vec::new();
        for row in rows {
            let (id, mode, config, status, phase, progress, created_at, completed_at) =
                row.context("Failed to read run row")?;
            let config: RunConfig =
                serde_json::from_str(&config).context("Invalid run config JSON")?;
            runs.push(RunSummary {
                id: Uuid::parse_str(&id).context("Invalid run id")?,
                mode: RunMode::from_str(&mode).map_err(|e| anyhow::anyhow!(e))?,
                url: config.url,
                status: RunStatus::from_str(&status).map_err(|e| anyhow::anyhow!(e))?,
                phase: Phase::from_str(&phase).map_err(|e| anyhow::anyhow!(e))?,
                progress: clamp_progress(progress),
                created_at: parse_timestamp(&created_at)?,
                completed_at: completed_at.as_deref().map(parse_timestamp).transpose()?,
            });
        }
        Ok(runs)
    }

    /// Move a queued run to `running`.
    pub fn mark_running(&self, id: RunId) -> Result<RunRecord> {
        let (status, _, _) = self.run_state(id)?;
        if !status.can_transition_to(RunStatus::Running) {
            bail!("Run {} cannot start from status {}", id, status);
        }
        self.conn
            .execute(
                "UPDATE runs SET status = ?1, started_at = ?2 WHERE id = ?3",
                params![
                    RunStatus::Running.as_str(),
                    timestamp(Utc::now()),
                    id.to_string()
                ],
            )
            .context("Failed to mark run running")?;
        self.get_run(id)?.context("Run not found after update")
    }

    /// Enter a non-terminal phase. Rejects moves the mode's sequence forbids.
    pub fn advance_phase(&self, id: RunId, phase: Phase, progress: u8) -> Result<RunRecord> {
        let (status, current, mode) = self.run_state(id)?;
        if status != RunStatus::Running {
            bail!("Run {} is {}, cannot enter {}", id, status, phase);
        }
        if phase.is_terminal() {
            bail!("Terminal phase {} is only set when finalizing", phase);
        }
        if !current.can_advance(mode, phase) {
            bail!("Invalid phase transition {} -> {} for {} run", current, phase, mode);
        }
        self.conn
            .execute(
                "UPDATE runs SET phase = ?1, progress = ?2 WHERE id = ?3",
                params![phase.as_str(), progress, id.to_string()],
            )
            .context("Failed to update run phase")?;
        self.get_run(id)?.context("Run not found after update")
    }

    /// Commit a phase's result. Entries are write-once per phase, except
    /// `execution` which is replaced by every attempt.
    pub fn commit_phase_result(
        &self,
        id: RunId,
        phase: Phase,
        result: &PhaseResult,
        progress: u8,
    ) -> Result<RunRecord> {
        if phase == Phase::Healing {
            bail!("Healing results are committed per attempt");
        }
        let (status, _, _) = self.run_state(id)?;
        if status.is_terminal() {
            bail!("Run {} is already {}", id, status);
        }
        let json = serde_json::to_string(result).context("Failed to serialize phase result")?;
        let now = timestamp(Utc::now());

        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        if phase == Phase::Execution {
            tx.execute(
                "INSERT INTO phase_results (run_id, phase, result, recorded_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(run_id, phase) DO UPDATE SET
                    result = excluded.result, recorded_at = excluded.recorded_at",
                params![id.to_string(), phase.as_str(), json, now],
            )
            .context("Failed to upsert execution result")?;
        } else {
            let exists: bool = tx
                .query_row(
                    "SELECT EXISTS(SELECT 1 FROM phase_results WHERE run_id = ?1 AND phase = ?2)",
                    params![id.to_string(), phase.as_str()],
                    |row| row.get(0),
                )
                .context("Failed to check phase result")?;
            if exists {
                bail!("Result for {} already committed on run {}", phase, id);
            }
            tx.execute(
                "INSERT INTO phase_results (run_id, phase, result, recorded_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![id.to_string(), phase.as_str(), json, now],
            )
            .context("Failed to insert phase result")?;
        }
        tx.execute(
            "UPDATE runs SET progress = ?1 WHERE id = ?2",
            params![progress, id.to_string()],
        )
        .context("Failed to update progress")?;
        tx.commit().context("Failed to commit phase result")?;

        self.get_run(id)?.context("Run not found after commit")
    }

    /// Append one healing attempt. Attempts are append-only and ordered.
    pub fn append_healing_attempt(
        &self,
        id: RunId,
        attempt: &HealingAttempt,
        progress: u8,
    ) -> Result<RunRecord> {
        let (status, _, _) = self.run_state(id)?;
        if status.is_terminal() {
            bail!("Run {} is already {}", id, status);
        }
        let json =
            serde_json::to_string(attempt).context("Failed to serialize healing attempt")?;
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        tx.execute(
            "INSERT INTO healing_attempts (run_id, attempt, record) VALUES (?1, ?2, ?3)",
            params![id.to_string(), attempt.attempt, json],
        )
        .with_context(|| format!("Failed to append healing attempt {}", attempt.attempt))?;
        tx.execute(
            "UPDATE runs SET progress = ?1 WHERE id = ?2",
            params![progress, id.to_string()],
        )
        .context("Failed to update progress")?;
        tx.commit().context("Failed to commit healing attempt")?;
        self.get_run(id)?.context("Run not found after commit")
    }

    /// Move the run to its terminal status. Fails if it is already terminal.
    pub fn finalize_run(&self, id: RunId, fin: &RunFinalization) -> Result<RunRecord> {
        let (status, current, mode) = self.run_state(id)?;
        if !status.can_transition_to(fin.status) {
            bail!("Invalid status transition {} -> {} for run {}", status, fin.status, id);
        }
        if fin.phase != current && !current.can_advance(mode, fin.phase) {
            bail!("Invalid phase transition {} -> {} for run {}", current, fin.phase, id);
        }
        let progress_sql = if fin.status == RunStatus::Completed {
            "100"
        } else {
            "progress"
        };
        let sql = format!(
            "UPDATE runs SET status = ?1, phase = ?2, error_phase = ?3, error_message = ?4,
                    exit_code = ?5, healed = ?6, completed_at = ?7, progress = {}
             WHERE id = ?8",
            progress_sql
        );
        self.conn
            .execute(
                &sql,
                params![
                    fin.status.as_str(),
                    fin.phase.as_str(),
                    fin.error.as_ref().map(|e| e.phase.as_str()),
                    fin.error.as_ref().map(|e| e.message.as_str()),
                    fin.exit_code,
                    fin.healed.map(i64::from),
                    timestamp(Utc::now()),
                    id.to_string(),
                ],
            )
            .context("Failed to finalize run")?;
        self.get_run(id)?.context("Run not found after finalize")
    }

    /// Fail every run left queued or running by an instance that is gone:
    /// no owner, an unregistered owner, or an owner whose last heartbeat is
    /// older than `stale_after`. This instance's own runs are never touched.
    pub fn fail_interrupted_runs(&self, message: &str, stale_after: Duration) -> Result<usize> {
        let now = Utc::now();
        let stale = chrono::Duration::from_std(stale_after).context("Invalid stale window")?;
        let cutoff = timestamp(now - stale);
        let own = self.instance.to_string();
        let count = self
            .conn
            .execute(
                "UPDATE runs SET status = 'failed', error_phase = phase, phase = 'failed',
                        error_message = ?1, exit_code = 1, completed_at = ?2
                 WHERE status IN ('queued', 'running')
                   AND (owner IS NULL OR owner != ?3)
                   AND NOT EXISTS (
                       SELECT 1 FROM instances i
                       WHERE i.id = runs.owner AND i.heartbeat_at > ?4
                   )",
                params![message, timestamp(now), own, cutoff],
            )
            .context("Failed to fail interrupted runs")?;
        self.conn
            .execute(
                "DELETE FROM instances WHERE id != ?1 AND heartbeat_at <= ?2",
                params![own, cutoff],
            )
            .context("Failed to prune stale instances")?;
        Ok(count)
    }

    // ── Run log ───────────────────────────────────────────────────────

    pub fn append_log(&self, id: RunId, message: &str) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO run_logs (run_id, message, created_at) VALUES (?1, ?2, ?3)",
                params![id.to_string(), message, timestamp(Utc::now())],
            )
            .context("Failed to append run log")?;
        Ok(())
    }

    pub fn get_logs(&self, id: RunId) -> Result<Vec<RunLogLine>> {
        let mut stmt = self
            .conn
            .prepare("SELECT message, created_at FROM run_logs WHERE run_id = ?1 ORDER BY id")
            .context("Failed to prepare get_logs")?;
        let rows = stmt
            .query_map(params![id.to_string()], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })
            .context("Failed to query run logs")?;
        let mut lines = Vec::new();
        for row in rows {
            let (message, created_at) = row.context("Failed to read log row")?;
            lines.push(RunLogLine {
                message,
                created_at: parse_timestamp(&created_at)?,
            });
        }
        Ok(lines)
    }

    // ── Helpers ───────────────────────────────────────────────────────

    fn run_state(&self, id: RunId) -> Result<(RunStatus, Phase, RunMode)> {
        let (status, phase, mode): (String, String, String) = self
            .conn
            .query_row(
                "SELECT status, phase, mode FROM runs WHERE id = ?1",
                params![id.to_string()],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()
            .context("Failed to query run state")?
            .with_context(|| format!("Run {} not found", id))?;
        Ok((
            RunStatus::from_str(&status).map_err(|e| anyhow::anyhow!(e))?,
            Phase::from_str(&phase).map_err(|e| anyhow::anyhow!(e))?,
            RunMode::from_str(&mode).map_err(|e| anyhow::anyhow!(e))?,
        ))
    }

    fn load_phase_results(&self, id: RunId) -> Result<BTreeMap<Phase, PhaseResult>> {
        let mut stmt = self
            .conn
            .prepare("SELECT phase, result FROM phase_results WHERE run_id = ?1")
            .context("Failed to prepare load_phase_results")?;
        let rows = stmt
            .query_map(params![id.to_string()], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })
            .context("Failed to query phase results")?;
        let mut results = BTreeMap::new();
        for row in rows {
            let (phase, json) = row.context("Failed to read phase result row")?;
            let phase = Phase::from_str(&phase).map_err(|e| anyhow::anyhow!(e))?;
            let result: PhaseResult = serde_json::from_str(&json)
                .with_context(|| format!("Invalid {} result JSON", phase))?;
            results.insert(phase, result);
        }
        Ok(results)
    }

    fn load_healing_attempts(&self, id: RunId) -> Result<Vec<HealingAttempt>> {
        let mut stmt = self
            .conn
            .prepare("SELECT record FROM healing_attempts WHERE run_id = ?1 ORDER BY attempt")
            .context("Failed to prepare load_healing_attempts")?;
        let rows = stmt
            .query_map(params![id.to_string()], |row| row.get::<_, String>(0))
            .context("Failed to query healing attempts")?;
        let mut attempts = Vec::new();
        for row in rows {
            let json = row.context("Failed to read healing attempt row")?;
            attempts.push(serde_json::from_str(&json).context("Invalid healing attempt JSON")?);
        }
        Ok(attempts)
    }
}

impl Drop for RunDb {
    fn drop(&mut self) {
        // Runs this instance still owns become sweepable right away.
        let _ = self.conn.execute(
            "DELETE FROM instances WHERE id = ?1",
            params![self.instance.to_string()],
        );
    }
}

fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(raw)
        .with_context(|| format!("Invalid timestamp '{}'", raw))?
        .with_timezone(&Utc))
}

fn clamp_progress(raw: i64) -> u8 {
    raw.clamp(0, 100) as u8
}

struct RunRow {
    id: String,
    mode: String,
    config: String,
    status: String,
    phase: String,
    progress: i64,
    error_phase: Option<String>,
    error_message: Option<String>,
    exit_code: Option<i32>,
    healed: Option<i64>,
    created_at: String,
    started_at: Option<String>,
    completed_at: Option<String>,
}

impl RunRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            mode: row.get(1)?,
            config: row.get(2)?,
            status: row.get(3)?,
            phase: row.get(4)?,
            progress: row.get(5)?,
            error_phase: row.get(6)?,
            error_message: row.get(7)?,
            exit_code: row.get(8)?,
            healed: row.get(9)?,
            created_at: row.get(10)?,
            started_at: row.get(11)?,
            completed_at: row.get(12)?,
        })
    }

    fn into_record(self, phase_results: BTreeMap<Phase, PhaseResult>) -> Result<RunRecord> {
        let error = match (self.error_phase, self.error_message) {
            (Some(phase), Some(message)) => Some(RunError {
                phase: Phase::from_str(&phase).map_err(|e| anyhow::anyhow!(e))?,
                message,
            }),
            _ => None,
        };
        Ok(RunRecord {
            id: Uuid::parse_str(&self.id).context("Invalid run id")?,
            mode: RunMode::from_str(&self.mode).map_err(|e| anyhow::anyhow!(e))?,
            config: serde_json::from_str(&self.config).context("Invalid run config JSON")?,
            status: RunStatus::from_str(&self.status).map_err(|e| anyhow::anyhow!(e))?,
            phase: Phase::from_str(&self.phase).map_err(|e| anyhow::anyhow!(e))?,
            progress: clamp_progress(self.progress),
            phase_results,
            error,
            exit_code: self.exit_code,
            healed: self.healed.map(|h| h != 0),
            created_at: parse_timestamp(&self.created_at)?,
            started_at: self.started_at.as_deref().map(parse_timestamp).transpose()?,
            completed_at: self.completed_at.as_deref().map(parse_timestamp).transpose()?,
        })
    }
}
