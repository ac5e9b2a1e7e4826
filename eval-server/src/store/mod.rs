mod db;
mod programs;

use std::{
    collections::HashSet,
    fs,
    path::Path,
    sync::{Arc, Mutex, MutexGuard},
};

use factory_mcts_core::{now_unix_s, Program, ProgramId};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use tokio::sync::Notify;
use uuid::Uuid;

use crate::{CompleteOutcome, EvaluationTask, ProgramOutcome, QueueCounts, TaskId, TaskResult};
use db::{task_from_row, TASK_COLUMNS};

/// What a reaper pass did to stale running tasks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReapReport {
    pub requeued: usize,
    pub exhausted: usize,
}

/// SQLite-backed program tree and evaluation queue.
///
/// Several processes may open the same database file. Every state
/// transition runs inside an immediate transaction, so SQLite's single
/// writer lock serialises claims across connections and a pending row is
/// handed to exactly one claimant.
pub struct EvalStore {
    conn: Mutex<Connection>,
    wake: Arc<Notify>,
}

const SCHEMA_MIGRATIONS: [(&str, &str, &str); 6] = [
    (
        "programs",
        "response",
        "ALTER TABLE programs ADD COLUMN response TEXT;",
    ),
    (
        "programs",
        "depth",
        "ALTER TABLE programs ADD COLUMN depth INTEGER NOT NULL DEFAULT 0;",
    ),
    (
        "programs",
        "holdout_value",
        "ALTER TABLE programs ADD COLUMN holdout_value REAL;",
    ),
    (
        "evaluation_queue",
        "version",
        "ALTER TABLE evaluation_queue ADD COLUMN version INTEGER NOT NULL DEFAULT 0;",
    ),
    (
        "evaluation_queue",
        "lease",
        "ALTER TABLE evaluation_queue ADD COLUMN lease TEXT;",
    ),
    (
        "evaluation_queue",
        "attempts",
        "ALTER TABLE evaluation_queue ADD COLUMN attempts INTEGER NOT NULL DEFAULT 0;",
    ),
];

impl EvalStore {
    /// Open (or create) `{data_dir}/eval.db`.
    ///
    /// Running tasks are left alone: other worker processes may still own
    /// them. Stale claims are recovered by [`EvalStore::reap_stale`].
    pub fn open(data_dir: &Path) -> Result<Self, String> {
        fs::create_dir_all(data_dir)
            .map_err(|e| format!("failed to create data dir {}: {e}", data_dir.display()))?;

        let db_path = data_dir.join("eval.db");
        let conn = Connection::open(&db_path)
            .map_err(|e| format!("failed to open SQLite at {}: {e}", db_path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA busy_timeout=5000;
             PRAGMA synchronous=NORMAL;
             PRAGMA foreign_keys=ON;",
        )
        .map_err(|e| format!("failed to set pragmas: {e}"))?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS programs (
                id                  INTEGER PRIMARY KEY AUTOINCREMENT,
                code                TEXT NOT NULL,
                conversation_json   TEXT NOT NULL,
                value               REAL NOT NULL DEFAULT 0,
                visits              INTEGER NOT NULL DEFAULT 0,
                parent_id           INTEGER REFERENCES programs(id),
                state_json          TEXT,
                raw_reward          REAL,
                holdout_value       REAL,
                response            TEXT,
                version             INTEGER NOT NULL,
                depth               INTEGER NOT NULL DEFAULT 0,
                meta_json           TEXT NOT NULL DEFAULT '{}',
                achievements_json   TEXT NOT NULL DEFAULT '{}',
                created_at          INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_programs_version ON programs(version, id);
            CREATE INDEX IF NOT EXISTS idx_programs_parent ON programs(parent_id);

            CREATE TABLE IF NOT EXISTS evaluation_queue (
                id                  INTEGER PRIMARY KEY AUTOINCREMENT,
                program_id          INTEGER NOT NULL REFERENCES programs(id),
                version             INTEGER NOT NULL DEFAULT 0,
                status              TEXT NOT NULL,
                instance_id         TEXT,
                lease               TEXT,
                attempts            INTEGER NOT NULL DEFAULT 0,
                created_at          INTEGER NOT NULL,
                started_at          INTEGER,
                completed_at        INTEGER,
                result_json         TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_queue_status ON evaluation_queue(status, id);
            CREATE INDEX IF NOT EXISTS idx_queue_program ON evaluation_queue(program_id);",
        )
        .map_err(|e| format!("failed to create schema: {e}"))?;

        Self::ensure_schema(&conn)?;

        Ok(Self {
            conn: Mutex::new(conn),
            wake: Arc::new(Notify::new()),
        })
    }

    fn ensure_schema(conn: &Connection) -> Result<(), String> {
        let mut columns = HashSet::new();
        for table in ["programs", "evaluation_queue"] {
            for column in Self::table_columns(conn, table)? {
                columns.insert(format!("{table}.{column}"));
            }
        }
        for (table, column, migration_sql) in SCHEMA_MIGRATIONS {
            let key = format!("{table}.{column}");
            if columns.contains(&key) {
                continue;
            }

            tracing::warn!(table, column, "applying schema migration");
            conn.execute_batch(migration_sql)
                .map_err(|e| format!("failed to add {key}: {e}"))?;
            columns.insert(key);
        }
        Ok(())
    }

    fn table_columns(conn: &Connection, table: &str) -> Result<HashSet<String>, String> {
        let mut stmt = conn
            .prepare(&format!("PRAGMA table_info({table})"))
            .map_err(|e| format!("failed to read {table} table info: {e}"))?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(1))
            .map_err(|e| format!("failed to iterate {table} columns: {e}"))?;

        let mut columns = HashSet::new();
        for row in rows {
            columns.insert(row.map_err(|e| format!("failed to parse {table} column info: {e}"))?);
        }
        Ok(columns)
    }

    pub(crate) fn conn(&self) -> Result<MutexGuard<'_, Connection>, String> {
        self.conn
            .lock()
            .map_err(|_| "eval store mutex poisoned".to_string())
    }

    /// Signalled whenever a task becomes pending. Only wakes waiters in this
    /// process; other processes still rely on polling.
    pub fn wake_handle(&self) -> Arc<Notify> {
        Arc::clone(&self.wake)
    }

    /// Persist a new program and its pending evaluation task together.
    pub fn enqueue(&self, program: &Program) -> Result<(ProgramId, TaskId), String> {
        let ids = {
            let mut conn = self.conn()?;
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(|e| format!("enqueue begin failed: {e}"))?;
            let program_id = programs::insert_program_in(&tx, program)?;
            let task_id = Self::insert_task_in(&tx, program_id, program.version)?;
            tx.commit()
                .map_err(|e| format!("enqueue commit failed: {e}"))?;
            (program_id, task_id)
        };
        self.wake.notify_one();
        Ok(ids)
    }

    fn insert_task_in(conn: &Connection, program_id: ProgramId, version: i64) -> Result<TaskId, String> {
        conn.execute(
            "INSERT INTO evaluation_queue (program_id, version, status, created_at)
             VALUES (?1, ?2, 'pending', ?3)",
            params![program_id, version, now_unix_s() as i64],
        )
        .map_err(|e| format!("insert task failed: {e}"))?;
        Ok(conn.last_insert_rowid())
    }

    /// Claim the oldest pending task, optionally only within `version`.
    ///
    /// The row moves to `running` with a fresh lease in the same statement
    /// that selects it. Returns `None` when nothing is pending.
    pub fn claim(
        &self,
        instance_id: &str,
        version: Option<i64>,
    ) -> Result<Option<EvaluationTask>, String> {
        let mut conn = self.conn()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| format!("claim begin failed: {e}"))?;
        let lease = Uuid::new_v4();
        let raw = tx
            .query_row(
                &format!(
                    "UPDATE evaluation_queue
                     SET status = 'running', instance_id = ?1, lease = ?2, started_at = ?3,
                         attempts = attempts + 1
                     WHERE id = (
                         SELECT id FROM evaluation_queue
                         WHERE status = 'pending' AND (?4 IS NULL OR version = ?4)
                         ORDER BY id ASC
                         LIMIT 1
                     )
                     RETURNING {TASK_COLUMNS}"
                ),
                params![instance_id, lease.to_string(), now_unix_s() as i64, version],
                task_from_row,
            )
            .optional()
            .map_err(|e| format!("claim failed: {e}"))?;
        tx.commit()
            .map_err(|e| format!("claim commit failed: {e}"))?;
        raw.map(|raw| raw.into_task()).transpose()
    }

    /// Mark a running task completed with `result`.
    pub fn complete(
        &self,
        task_id: TaskId,
        lease: Uuid,
        result: &TaskResult,
    ) -> Result<CompleteOutcome, String> {
        let json = serde_json::to_string(result)
            .map_err(|e| format!("failed to serialize result: {e}"))?;
        let conn = self.conn()?;
        let updated = conn
            .execute(
                "UPDATE evaluation_queue SET status = 'completed', completed_at = ?1, result_json = ?2
                 WHERE id = ?3 AND status = 'running' AND lease = ?4",
                params![now_unix_s() as i64, json, task_id, lease.to_string()],
            )
            .map_err(|e| format!("complete task failed: {e}"))?;
        Ok(lease_outcome(updated))
    }

    /// Complete a task and write its program's evaluation in one transaction:
    /// the program's own fields, then `+1 visit / +value` on every ancestor.
    pub fn complete_evaluation(
        &self,
        task_id: TaskId,
        lease: Uuid,
        outcome: &ProgramOutcome,
        result: &TaskResult,
    ) -> Result<CompleteOutcome, String> {
        let json = serde_json::to_string(result)
            .map_err(|e| format!("failed to serialize result: {e}"))?;
        let mut conn = self.conn()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| format!("complete begin failed: {e}"))?;

        let program_id: Option<ProgramId> = tx
            .query_row(
                "UPDATE evaluation_queue SET status = 'completed', completed_at = ?1, result_json = ?2
                 WHERE id = ?3 AND status = 'running' AND lease = ?4
                 RETURNING program_id",
                params![now_unix_s() as i64, json, task_id, lease.to_string()],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| format!("complete task failed: {e}"))?;
        let Some(program_id) = program_id else {
            return Ok(CompleteOutcome::LeaseLost);
        };

        programs::record_evaluation_in(&tx, program_id, outcome)?;
        programs::backpropagate_in(&tx, program_id, outcome.value)?;

        tx.commit()
            .map_err(|e| format!("complete commit failed: {e}"))?;
        Ok(CompleteOutcome::Recorded)
    }

    /// Mark a running task failed. Pending and terminal tasks are untouched.
    pub fn fail(
        &self,
        task_id: TaskId,
        lease: Uuid,
        error: &str,
        error_code: &str,
    ) -> Result<CompleteOutcome, String> {
        let json = serde_json::to_string(&TaskResult::failure(error, error_code))
            .map_err(|e| format!("failed to serialize result: {e}"))?;
        let conn = self.conn()?;
        let updated = conn
            .execute(
                "UPDATE evaluation_queue SET status = 'failed', completed_at = ?1, result_json = ?2
                 WHERE id = ?3 AND status = 'running' AND lease = ?4",
                params![now_unix_s() as i64, json, task_id, lease.to_string()],
            )
            .map_err(|e| format!("fail task failed: {e}"))?;
        Ok(lease_outcome(updated))
    }

    pub fn get_task(&self, task_id: TaskId) -> Result<Option<EvaluationTask>, String> {
        let raw = {
            let conn = self.conn()?;
            conn.query_row(
                &format!("SELECT {TASK_COLUMNS} FROM evaluation_queue WHERE id = ?1"),
                params![task_id],
                task_from_row,
            )
            .optional()
            .map_err(|e| format!("get task failed: {e}"))?
        };
        raw.map(|raw| raw.into_task()).transpose()
    }

    pub fn tasks_for_program(&self, program_id: ProgramId) -> Result<Vec<EvaluationTask>, String> {
        let raws = {
            let conn = self.conn()?;
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {TASK_COLUMNS} FROM evaluation_queue WHERE program_id = ?1 ORDER BY id"
                ))
                .map_err(|e| format!("tasks_for_program prepare failed: {e}"))?;
            let rows = stmt
                .query_map(params![program_id], task_from_row)
                .map_err(|e| format!("tasks_for_program query failed: {e}"))?;
            rows.collect::<Result<Vec<_>, _>>()
                .map_err(|e| format!("tasks_for_program row decode failed: {e}"))?
        };
        raws.into_iter().map(|raw| raw.into_task()).collect()
    }

    pub fn count_by_status(&self) -> Result<QueueCounts, String> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT
                 COUNT(*) FILTER (WHERE status = 'pending'),
                 COUNT(*) FILTER (WHERE status = 'running'),
                 COUNT(*) FILTER (WHERE status = 'completed'),
                 COUNT(*) FILTER (WHERE status = 'failed'),
                 COUNT(*)
             FROM evaluation_queue",
            [],
            |row| {
                Ok(QueueCounts {
                    pending: row.get::<_, i64>(0)? as usize,
                    running: row.get::<_, i64>(1)? as usize,
                    completed: row.get::<_, i64>(2)? as usize,
                    failed: row.get::<_, i64>(3)? as usize,
                    total: row.get::<_, i64>(4)? as usize,
                })
            },
        )
        .map_err(|e| format!("count_by_status failed: {e}"))
    }

    /// Recover tasks whose worker stopped reporting.
    ///
    /// Running tasks claimed more than `running_timeout_secs` ago go back to
    /// pending, unless they already used `max_attempts` claims, in which case
    /// they fail with `retry_budget_exhausted`. Clearing the lease means the
    /// original worker can no longer complete them.
    pub fn reap_stale(&self, running_timeout_secs: u64, max_attempts: u32) -> Result<ReapReport, String> {
        let cutoff = (now_unix_s() as i64).saturating_sub(running_timeout_secs as i64);
        let exhausted_json = serde_json::to_string(&TaskResult::failure(
            format!("task was still running after {max_attempts} claims"),
            "retry_budget_exhausted",
        ))
        .map_err(|e| format!("failed to serialize result: {e}"))?;

        let report = {
            let mut conn = self.conn()?;
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(|e| format!("reap begin failed: {e}"))?;
            let exhausted = tx
                .execute(
                    "UPDATE evaluation_queue
                     SET status = 'failed', completed_at = ?1, lease = NULL, result_json = ?2
                     WHERE status = 'running' AND started_at < ?3 AND attempts >= ?4",
                    params![now_unix_s() as i64, exhausted_json, cutoff, max_attempts],
                )
                .map_err(|e| format!("reap exhausted failed: {e}"))?;
            let requeued = tx
                .execute(
                    "UPDATE evaluation_queue
                     SET status = 'pending', instance_id = NULL, lease = NULL, started_at = NULL
                     WHERE status = 'running' AND started_at < ?1",
                    params![cutoff],
                )
                .map_err(|e| format!("reap requeue failed: {e}"))?;
            tx.commit()
                .map_err(|e| format!("reap commit failed: {e}"))?;
            ReapReport {
                requeued,
                exhausted,
            }
        };

        for _ in 0..report.requeued {
            self.wake.notify_one();
        }
        Ok(report)
    }

    #[cfg(test)]
    pub(crate) fn backdate_started(&self, task_id: TaskId, secs: u64) -> Result<(), String> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE evaluation_queue SET started_at = started_at - ?1 WHERE id = ?2",
            params![secs as i64, task_id],
        )
        .map_err(|e| format!("backdate failed: {e}"))?;
        Ok(())
    }
}

fn lease_outcome(updated: usize) -> CompleteOutcome {
    if updated > 0 {
        CompleteOutcome::Recorded
    } else {
        CompleteOutcome::LeaseLost
    }
}
