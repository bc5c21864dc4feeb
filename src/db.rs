use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, ErrorCode, OptionalExtension, Row, params};

use crate::errors::StoreError;
use crate::models::*;
use crate::status::Phase;

/// Async-safe handle to the flow database.
///
/// Wraps `FlowDb` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`, so synchronous SQLite I/O never
/// ties up async worker threads. Every closure runs under the same mutex,
/// which makes each `call` atomic with respect to other writers.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<FlowDb>>,
}

impl DbHandle {
    pub fn new(db: FlowDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Open the database at `path`, creating parent directories as needed.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).context("Failed to create database directory")?;
        }
        Ok(Self::new(FlowDb::new(path)?))
    }

    pub fn in_memory() -> Result<Self> {
        Ok(Self::new(FlowDb::new_in_memory()?))
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&FlowDb) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db.lock().map_err(|_| StoreError::LockPoisoned)?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }

    /// Acquire the database mutex synchronously. Only for CLI inspection
    /// commands and tests; never call from a hot async path.
    pub fn lock_sync(&self) -> Result<std::sync::MutexGuard<'_, FlowDb>> {
        self.inner
            .lock()
            .map_err(|_| anyhow::Error::from(StoreError::LockPoisoned))
    }
}

pub struct FlowDb {
    conn: Connection,
}

impl FlowDb {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing and dry runs).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON;")
            .context("Failed to enable foreign keys")?;
        self.run_migrations().context("Failed to run migrations")?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS work_items (
                    id TEXT PRIMARY KEY,
                    identifier TEXT NOT NULL,
                    status TEXT NOT NULL,
                    parent_id TEXT,
                    team_id TEXT,
                    title TEXT NOT NULL DEFAULT '',
                    description TEXT NOT NULL DEFAULT '',
                    updated_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS pipeline_runs (
                    id TEXT PRIMARY KEY,
                    item_id TEXT NOT NULL,
                    phase TEXT NOT NULL,
                    state TEXT NOT NULL DEFAULT 'running',
                    current_step INTEGER NOT NULL DEFAULT 0,
                    error TEXT,
                    started_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL,
                    finished_at TEXT
                );

                CREATE TABLE IF NOT EXISTS step_results (
                    run_id TEXT NOT NULL REFERENCES pipeline_runs(id) ON DELETE CASCADE,
                    step_index INTEGER NOT NULL,
                    name TEXT NOT NULL,
                    status TEXT NOT NULL,
                    started_at TEXT NOT NULL,
                    finished_at TEXT NOT NULL,
                    error TEXT,
                    output TEXT NOT NULL DEFAULT 'null',
                    PRIMARY KEY (run_id, step_index)
                );

                CREATE TABLE IF NOT EXISTS pending_questions (
                    id TEXT PRIMARY KEY,
                    item_id TEXT NOT NULL,
                    run_id TEXT NOT NULL REFERENCES pipeline_runs(id) ON DELETE CASCADE,
                    step_name TEXT NOT NULL,
                    kind TEXT NOT NULL,
                    prompt TEXT NOT NULL,
                    options TEXT NOT NULL DEFAULT '[]',
                    comment_id TEXT NOT NULL,
                    state TEXT NOT NULL DEFAULT 'pending',
                    answer TEXT,
                    deadline TEXT NOT NULL,
                    created_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS inbound_deliveries (
                    delivery_key TEXT PRIMARY KEY,
                    received_at TEXT NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_work_items_parent ON work_items(parent_id);
                CREATE INDEX IF NOT EXISTS idx_pipeline_runs_item ON pipeline_runs(item_id);
                CREATE UNIQUE INDEX IF NOT EXISTS idx_pipeline_runs_single_flight
                    ON pipeline_runs(item_id, phase) WHERE state IN ('running', 'blocked');
                CREATE UNIQUE INDEX IF NOT EXISTS idx_questions_comment ON pending_questions(comment_id);
                CREATE INDEX IF NOT EXISTS idx_questions_run ON pending_questions(run_id, step_name);
                CREATE INDEX IF NOT EXISTS idx_questions_state ON pending_questions(state, deadline);
                ",
            )
            .context("Failed to create tables")?;
        Ok(())
    }

    // ── Work items ────────────────────────────────────────────────────

    /// Insert or refresh a work item from an inbound event and report how its
    /// status compares to what was stored.
    pub fn upsert_item(&self, item: &ItemUpsert) -> Result<StatusObservation> {
        let now = format_ts(Utc::now());
        let existing: Option<String> = self
            .conn
            .query_row(
                "SELECT status FROM work_items WHERE id = ?1",
                params![item.id],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to read work item status")?;

        match existing {
            None => {
                self.conn
                    .execute(
                        "INSERT INTO work_items (id, identifier, status, parent_id, team_id, title, description, updated_at)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                        params![
                            item.id,
                            item.identifier,
                            item.status,
                            item.parent_id,
                            item.team_id,
                            item.title.clone().unwrap_or_default(),
                            item.description.clone().unwrap_or_default(),
                            now
                        ],
                    )
                    .context("Failed to insert work item")?;
                Ok(StatusObservation::New)
            }
            Some(previous) => {
                self.conn
                    .execute(
                        "UPDATE work_items SET
                            identifier = ?2,
                            status = ?3,
                            parent_id = COALESCE(?4, parent_id),
                            team_id = COALESCE(?5, team_id),
                            title = COALESCE(?6, title),
                            description = COALESCE(?7, description),
                            updated_at = ?8
                         WHERE id = ?1",
                        params![
                            item.id,
                            item.identifier,
                            item.status,
                            item.parent_id,
                            item.team_id,
                            item.title,
                            item.description,
                            now
                        ],
                    )
                    .context("Failed to update work item")?;
                if previous == item.status {
                    Ok(StatusObservation::Unchanged)
                } else {
                    Ok(StatusObservation::Changed { previous })
                }
            }
        }
    }

    pub fn get_item(&self, id: &str) -> Result<Option<WorkItem>> {
        self.conn
            .query_row(
                &format!("SELECT {} FROM work_items WHERE id = ?1", ITEM_COLUMNS),
                params![id],
                ItemRow::from_row,
            )
            .optional()
            .context("Failed to query work item")?
            .map(ItemRow::into_item)
            .transpose()
    }

    pub fn children(&self, parent_id: &str) -> Result<Vec<WorkItem>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {} FROM work_items WHERE parent_id = ?1 ORDER BY identifier",
                ITEM_COLUMNS
            ))
            .context("Failed to prepare children")?;
        let rows = stmt
            .query_map(params![parent_id], ItemRow::from_row)
            .context("Failed to query children")?;
        let mut items = Vec::new();
        for row in rows {
            items.push(row.context("Failed to read work item row")?.into_item()?);
        }
        Ok(items)
    }

    pub fn has_children(&self, id: &str) -> Result<bool> {
        let count: i64 = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM work_items WHERE parent_id = ?1",
                params![id],
                |row| row.get(0),
            )
            .context("Failed to count children")?;
        Ok(count > 0)
    }

    /// Write a status unconditionally. Returns whether it changed.
    pub fn set_status(&self, id: &str, status: &str) -> Result<bool> {
        let changed = self
            .conn
            .execute(
                "UPDATE work_items SET status = ?2, updated_at = ?3 WHERE id = ?1 AND status != ?2",
                params![id, status, format_ts(Utc::now())],
            )
            .context("Failed to set work item status")?;
        if changed == 0 && self.get_item(id)?.is_none() {
            return Err(StoreError::ItemNotFound { id: id.to_string() }.into());
        }
        Ok(changed == 1)
    }

    /// Compare-and-set a status. Only succeeds while the stored status still
    /// equals `expected`, so concurrent writers cannot overwrite each other.
    pub fn compare_and_set_status(&self, id: &str, expected: &str, status: &str) -> Result<bool> {
        let changed = self
            .conn
            .execute(
                "UPDATE work_items SET status = ?3, updated_at = ?4 WHERE id = ?1 AND status = ?2",
                params![id, expected, status, format_ts(Utc::now())],
            )
            .context("Failed to compare-and-set work item status")?;
        Ok(changed == 1)
    }

    /// Delete an item that is still at `status` and has no runs. Used to
    /// take back a first sighting whose handling failed.
    pub fn forget_item(&self, id: &str, status: &str) -> Result<bool> {
        let deleted = self
            .conn
            .execute(
                "DELETE FROM work_items WHERE id = ?1 AND status = ?2
                   AND NOT EXISTS (SELECT 1 FROM pipeline_runs WHERE item_id = ?1)",
                params![id, status],
            )
            .context("Failed to delete work item")?;
        Ok(deleted == 1)
    }

    // ── Pipeline runs ─────────────────────────────────────────────────

    /// Create a run in `running` state. Fails with
    /// `StoreError::RunAlreadyActive` while another run for the same
    /// (item, phase) is running or blocked.
    pub fn create_run(&self, id: &str, item_id: &str, phase: Phase, at: DateTime<Utc>) -> Result<RunRecord> {
        let ts = format_ts(at);
        let inserted = self.conn.execute(
            "INSERT INTO pipeline_runs (id, item_id, phase, state, current_step, started_at, updated_at)
             VALUES (?1, ?2, ?3, 'running', 0, ?4, ?4)",
            params![id, item_id, phase.as_str(), ts],
        );
        match inserted {
            Ok(_) => {}
            Err(rusqlite::Error::SqliteFailure(e, _)) if e.code == ErrorCode::ConstraintViolation => {
                return Err(StoreError::RunAlreadyActive {
                    item_id: item_id.to_string(),
                    phase,
                }
                .into());
            }
            Err(e) => return Err(anyhow::Error::from(e).context("Failed to insert pipeline run")),
        }
        self.get_run(id)?.context("Pipeline run not found after insert")
    }

    pub fn get_run(&self, id: &str) -> Result<Option<RunRecord>> {
        self.conn
            .query_row(
                &format!("SELECT {} FROM pipeline_runs WHERE id = ?1", RUN_COLUMNS),
                params![id],
                RunRow::from_row,
            )
            .optional()
            .context("Failed to query pipeline run")?
            .map(RunRow::into_run)
            .transpose()
    }

    pub fn runs_for_item(&self, item_id: &str) -> Result<Vec<RunRecord>> {
        self.query_runs(
            &format!(
                "SELECT {} FROM pipeline_runs WHERE item_id = ?1 ORDER BY started_at DESC",
                RUN_COLUMNS
            ),
            params![item_id],
        )
    }

    pub fn active_runs_for_item(&self, item_id: &str) -> Result<Vec<RunRecord>> {
        self.query_runs(
            &format!(
                "SELECT {} FROM pipeline_runs WHERE item_id = ?1 AND state IN ('running', 'blocked') ORDER BY started_at",
                RUN_COLUMNS
            ),
            params![item_id],
        )
    }

    pub fn active_run(&self, item_id: &str, phase: Phase) -> Result<Option<RunRecord>> {
        Ok(self
            .query_runs(
                &format!(
                    "SELECT {} FROM pipeline_runs WHERE item_id = ?1 AND phase = ?2 AND state IN ('running', 'blocked')",
                    RUN_COLUMNS
                ),
                params![item_id, phase.as_str()],
            )?
            .into_iter()
            .next())
    }

    pub fn runs_in_state(&self, state: RunState) -> Result<Vec<RunRecord>> {
        self.query_runs(
            &format!(
                "SELECT {} FROM pipeline_runs WHERE state = ?1 ORDER BY started_at",
                RUN_COLUMNS
            ),
            params![state.as_str()],
        )
    }

    pub fn recent_runs(&self, limit: i64) -> Result<Vec<RunRecord>> {
        self.query_runs(
            &format!(
                "SELECT {} FROM pipeline_runs ORDER BY started_at DESC LIMIT ?1",
                RUN_COLUMNS
            ),
            params![limit],
        )
    }

    fn query_runs(&self, sql: &str, params: impl rusqlite::Params) -> Result<Vec<RunRecord>> {
        let mut stmt = self.conn.prepare(sql).context("Failed to prepare run query")?;
        let rows = stmt
            .query_map(params, RunRow::from_row)
            .context("Failed to query pipeline runs")?;
        let mut runs = Vec::new();
        for row in rows {
            runs.push(row.context("Failed to read pipeline run row")?.into_run()?);
        }
        Ok(runs)
    }

    /// Compare-and-set a run state. Returns false when the run was not in any
    /// of the `from` states.
    pub fn transition_run(&self, id: &str, from: &[RunState], to: RunState, error: Option<&str>) -> Result<bool> {
        let now = format_ts(Utc::now());
        let finished = if to.is_active() { None } else { Some(now.clone()) };
        let from_list = from
            .iter()
            .map(|s| format!("'{}'", s.as_str()))
            .collect::<Vec<_>>()
            .join(", ");
        let changed = self
            .conn
            .execute(
                &format!(
                    "UPDATE pipeline_runs SET state = ?2, error = COALESCE(?3, error), updated_at = ?4,
                        finished_at = COALESCE(?5, finished_at)
                     WHERE id = ?1 AND state IN ({})",
                    from_list
                ),
                params![id, to.as_str(), error, now, finished],
            )
            .context("Failed to transition pipeline run")?;
        Ok(changed == 1)
    }

    pub fn set_current_step(&self, id: &str, index: usize) -> Result<()> {
        self.conn
            .execute(
                "UPDATE pipeline_runs SET current_step = ?2, updated_at = ?3 WHERE id = ?1",
                params![id, index as i64, format_ts(Utc::now())],
            )
            .context("Failed to update current step")?;
        Ok(())
    }

    // ── Step journal ──────────────────────────────────────────────────

    /// Append a step result. Re-appending the same index is a no-op, so a
    /// retried journal write cannot duplicate history.
    pub fn append_step_result(&self, result: &StepResult) -> Result<()> {
        let output = serde_json::to_string(&result.output).context("Failed to encode step output")?;
        self.conn
            .execute(
                "INSERT OR IGNORE INTO step_results (run_id, step_index, name, status, started_at, finished_at, error, output)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    result.run_id,
                    result.index as i64,
                    result.name,
                    result.status.as_str(),
                    format_ts(result.started_at),
                    format_ts(result.finished_at),
                    result.error,
                    output
                ],
            )
            .context("Failed to append step result")?;
        Ok(())
    }

    pub fn step_results(&self, run_id: &str) -> Result<Vec<StepResult>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT run_id, step_index, name, status, started_at, finished_at, error, output
                 FROM step_results WHERE run_id = ?1 ORDER BY step_index",
            )
            .context("Failed to prepare step_results")?;
        let rows = stmt
            .query_map(params![run_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, Option<String>>(6)?,
                    row.get::<_, String>(7)?,
                ))
            })
            .context("Failed to query step results")?;
        let mut results = Vec::new();
        for row in rows {
            let (run_id, index, name, status, started, finished, error, output) =
                row.context("Failed to read step result row")?;
            results.push(StepResult {
                run_id,
                index: index as usize,
                name,
                status: StepStatus::from_str(&status).map_err(anyhow::Error::msg)?,
                started_at: parse_ts(&started)?,
                finished_at: parse_ts(&finished)?,
                error,
                output: serde_json::from_str(&output).context("Failed to decode step output")?,
            });
        }
        Ok(results)
    }

    // ── Pending questions ─────────────────────────────────────────────

    pub fn insert_question(&self, q: &PendingQuestion) -> Result<()> {
        let options = serde_json::to_string(&q.options).context("Failed to encode options")?;
        let answer = q
            .answer
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .context("Failed to encode answer")?;
        self.conn
            .execute(
                "INSERT INTO pending_questions (id, item_id, run_id, step_name, kind, prompt, options, comment_id, state, answer, deadline, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                params![
                    q.id,
                    q.item_id,
                    q.run_id,
                    q.step_name,
                    q.kind.as_str(),
                    q.prompt,
                    options,
                    q.comment_id,
                    q.state.as_str(),
                    answer,
                    format_ts(q.deadline),
                    format_ts(q.created_at)
                ],
            )
            .context("Failed to insert pending question")?;
        Ok(())
    }

    pub fn get_question(&self, id: &str) -> Result<Option<PendingQuestion>> {
        self.query_questions(
            &format!("SELECT {} FROM pending_questions WHERE id = ?1", QUESTION_COLUMNS),
            params![id],
        )
        .map(|q| q.into_iter().next())
    }

    pub fn question_by_comment(&self, comment_id: &str) -> Result<Option<PendingQuestion>> {
        self.query_questions(
            &format!(
                "SELECT {} FROM pending_questions WHERE comment_id = ?1",
                QUESTION_COLUMNS
            ),
            params![comment_id],
        )
        .map(|q| q.into_iter().next())
    }

    pub fn questions_for_step(&self, run_id: &str, step_name: &str) -> Result<Vec<PendingQuestion>> {
        self.query_questions(
            &format!(
                "SELECT {} FROM pending_questions WHERE run_id = ?1 AND step_name = ?2 ORDER BY created_at, rowid",
                QUESTION_COLUMNS
            ),
            params![run_id, step_name],
        )
    }

    pub fn questions_for_run(&self, run_id: &str) -> Result<Vec<PendingQuestion>> {
        self.query_questions(
            &format!(
                "SELECT {} FROM pending_questions WHERE run_id = ?1 ORDER BY created_at, rowid",
                QUESTION_COLUMNS
            ),
            params![run_id],
        )
    }

    pub fn questions_in_state(&self, state: QuestionState) -> Result<Vec<PendingQuestion>> {
        self.query_questions(
            &format!(
                "SELECT {} FROM pending_questions WHERE state = ?1 ORDER BY created_at, rowid",
                QUESTION_COLUMNS
            ),
            params![state.as_str()],
        )
    }

    pub fn pending_count_for_run(&self, run_id: &str) -> Result<usize> {
        let count: i64 = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM pending_questions WHERE run_id = ?1 AND state = 'pending'",
                params![run_id],
                |row| row.get(0),
            )
            .context("Failed to count pending questions")?;
        Ok(count as usize)
    }

    pub fn overdue_questions(&self, now: DateTime<Utc>) -> Result<Vec<PendingQuestion>> {
        self.query_questions(
            &format!(
                "SELECT {} FROM pending_questions WHERE state = 'pending' AND deadline <= ?1 ORDER BY deadline",
                QUESTION_COLUMNS
            ),
            params![format_ts(now)],
        )
    }

    /// Move a question out of `pending` exactly once. Returns false if it was
    /// already resolved (answered, timed out or cancelled).
    pub fn resolve_question(&self, id: &str, state: QuestionState, answer: Option<&SignalPayload>) -> Result<bool> {
        let answer = answer
            .map(serde_json::to_string)
            .transpose()
            .context("Failed to encode answer")?;
        let changed = self
            .conn
            .execute(
                "UPDATE pending_questions SET state = ?2, answer = ?3 WHERE id = ?1 AND state = 'pending'",
                params![id, state.as_str(), answer],
            )
            .context("Failed to resolve pending question")?;
        Ok(changed == 1)
    }

    pub fn cancel_questions_for_run(&self, run_id: &str) -> Result<usize> {
        self.conn
            .execute(
                "UPDATE pending_questions SET state = 'cancelled' WHERE run_id = ?1 AND state = 'pending'",
                params![run_id],
            )
            .context("Failed to cancel pending questions")
    }

    fn query_questions(&self, sql: &str, params: impl rusqlite::Params) -> Result<Vec<PendingQuestion>> {
        let mut stmt = self.conn.prepare(sql).context("Failed to prepare question query")?;
        let rows = stmt
            .query_map(params, QuestionRow::from_row)
            .context("Failed to query pending questions")?;
        let mut questions = Vec::new();
        for row in rows {
            questions.push(row.context("Failed to read question row")?.into_question()?);
        }
        Ok(questions)
    }

    // ── Inbound deliveries ────────────────────────────────────────────

    /// Record an inbound delivery key. Returns false if it was seen before.
    pub fn record_delivery(&self, key: &str) -> Result<bool> {
        let inserted = self
            .conn
            .execute(
                "INSERT OR IGNORE INTO inbound_deliveries (delivery_key, received_at) VALUES (?1, ?2)",
                params![key, format_ts(Utc::now())],
            )
            .context("Failed to record inbound delivery")?;
        Ok(inserted == 1)
    }

    /// Drop a recorded delivery key so a redelivery is routed again.
    pub fn forget_delivery(&self, key: &str) -> Result<()> {
        self.conn
            .execute("DELETE FROM inbound_deliveries WHERE delivery_key = ?1", params![key])
            .context("Failed to forget inbound delivery")?;
        Ok(())
    }
}

// ── Row mapping ───────────────────────────────────────────────────────

const ITEM_COLUMNS: &str =
    "id, identifier, status, parent_id, team_id, title, description, updated_at";

struct ItemRow {
    id: String,
    identifier: String,
    status: String,
    parent_id: Option<String>,
    team_id: Option<String>,
    title: String,
    description: String,
    updated_at: String,
}

impl ItemRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            identifier: row.get(1)?,
            status: row.get(2)?,
            parent_id: row.get(3)?,
            team_id: row.get(4)?,
            title: row.get(5)?,
            description: row.get(6)?,
            updated_at: row.get(7)?,
        })
    }

    fn into_item(self) -> Result<WorkItem> {
        Ok(WorkItem {
            id: self.id,
            identifier: self.identifier,
            status: self.status,
            parent_id: self.parent_id,
            team_id: self.team_id,
            title: self.title,
            description: self.description,
            updated_at: parse_ts(&self.updated_at)?,
        })
    }
}

const RUN_COLUMNS: &str =
    "id, item_id, phase, state, current_step, error, started_at, updated_at, finished_at";

struct RunRow {
    id: String,
    item_id: String,
    phase: String,
    state: String,
    current_step: i64,
    error: Option<String>,
    started_at: String,
    updated_at: String,
    finished_at: Option<String>,
}

impl RunRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            item_id: row.get(1)?,
            phase: row.get(2)?,
            state: row.get(3)?,
            current_step: row.get(4)?,
            error: row.get(5)?,
            started_at: row.get(6)?,
            updated_at: row.get(7)?,
            finished_at: row.get(8)?,
        })
    }

    fn into_run(self) -> Result<RunRecord> {
        Ok(RunRecord {
            id: self.id,
            item_id: self.item_id,
            phase: Phase::from_str(&self.phase).map_err(anyhow::Error::msg)?,
            state: RunState::from_str(&self.state).map_err(anyhow::Error::msg)?,
            current_step: self.current_step as usize,
            error: self.error,
            started_at: parse_ts(&self.started_at)?,
            updated_at: parse_ts(&self.updated_at)?,
            finished_at: self.finished_at.as_deref().map(parse_ts).transpose()?,
        })
    }
}

const QUESTION_COLUMNS: &str = "id, item_id, run_id, step_name, kind, prompt, options, comment_id, state, answer, deadline, created_at";

struct QuestionRow {
    id: String,
    item_id: String,
    run_id: String,
    step_name: String,
    kind: String,
    prompt: String,
    options: String,
    comment_id: String,
    state: String,
    answer: Option<String>,
    deadline: String,
    created_at: String,
}

impl QuestionRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            item_id: row.get(1)?,
            run_id: row.get(2)?,
            step_name: row.get(3)?,
            kind: row.get(4)?,
            prompt: row.get(5)?,
            options: row.get(6)?,
            comment_id: row.get(7)?,
            state: row.get(8)?,
            answer: row.get(9)?,
            deadline: row.get(10)?,
            created_at: row.get(11)?,
        })
    }

    fn into_question(self) -> Result<PendingQuestion> {
        Ok(PendingQuestion {
            id: self.id,
            item_id: self.item_id,
            run_id: self.run_id,
            step_name: self.step_name,
            kind: QuestionKind::from_str(&self.kind).map_err(anyhow::Error::msg)?,
            prompt: self.prompt,
            options: serde_json::from_str(&self.options).context("Failed to decode options")?,
            comment_id: self.comment_id,
            state: QuestionState::from_str(&self.state).map_err(anyhow::Error::msg)?,
            answer: self
                .answer
                .as_deref()
                .map(serde_json::from_str)
                .transpose()
                .context("Failed to decode answer")?,
            deadline: parse_ts(&self.deadline)?,
            created_at: parse_ts(&self.created_at)?,
        })
    }
}
