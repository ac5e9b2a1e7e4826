use factory_mcts_core::{Program, ProgramId, ProgramSource};
use rusqlite::{params, Connection, OptionalExtension};

use super::db::{program_from_row, PROGRAM_COLUMNS};
use super::EvalStore;
use crate::ProgramOutcome;

/// Insert `program`, deriving its depth from the stored parent.
pub(super) fn insert_program_in(conn: &Connection, program: &Program) -> Result<ProgramId, String> {
    let depth = match program.parent_id {
        None => 0,
        Some(parent_id) => {
            let (parent_version, parent_depth): (i64, i64) = conn
                .query_row(
                    "SELECT version, depth FROM programs WHERE id = ?1",
                    params![parent_id],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()
                .map_err(|e| format!("parent lookup failed: {e}"))?
                .ok_or_else(|| format!("unknown parent program {parent_id}"))?;
            if parent_version != program.version {
                return Err(format!(
                    "program version {} does not match parent {parent_id} version {parent_version}",
                    program.version
                ));
            }
            parent_depth + 1
        }
    };

    let conversation_json = serde_json::to_string(&program.conversation)
        .map_err(|e| format!("failed to serialize conversation: {e}"))?;
    let state_json = program
        .state
        .as_ref()
        .map(|state| state.to_raw())
        .transpose()
        .map_err(|e| format!("failed to serialize state: {e}"))?;

    conn.execute(
        "INSERT INTO programs (
            code, conversation_json, value, visits, parent_id, state_json,
            raw_reward, holdout_value, response, version, depth,
            meta_json, achievements_json, created_at
        ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14)",
        params![
            program.code,
            conversation_json,
            program.value,
            program.visits as i64,
            program.parent_id,
            state_json,
            program.raw_reward,
            program.holdout_value,
            program.response,
            program.version,
            depth,
            program.meta.to_string(),
            program.achievements.to_string(),
            program.created_at_unix_s as i64,
        ],
    )
    .map_err(|e| format!("insert program failed: {e}"))?;
    Ok(conn.last_insert_rowid())
}

/// Write the evaluation onto an unevaluated program. The leaf counts as
/// visited once with its own reward.
pub(super) fn record_evaluation_in(
    conn: &Connection,
    program_id: ProgramId,
    outcome: &ProgramOutcome,
) -> Result<(), String> {
    let updated = conn
        .execute(
            "UPDATE programs
             SET value = ?1, visits = 1, raw_reward = ?2, holdout_value = ?3,
                 state_json = ?4, response = ?5
             WHERE id = ?6 AND state_json IS NULL",
            params![
                outcome.value,
                outcome.raw_reward,
                outcome.holdout_value,
                outcome.state_json,
                outcome.response,
                program_id,
            ],
        )
        .map_err(|e| format!("record evaluation failed: {e}"))?;
    if updated == 0 {
        return Err(format!(
            "program {program_id} is missing or already evaluated"
        ));
    }
    Ok(())
}

/// `+1 visit, +reward` on every strict ancestor of `program_id`.
pub(super) fn backpropagate_in(
    conn: &Connection,
    program_id: ProgramId,
    reward: f64,
) -> Result<usize, String> {
    conn.execute(
        "WITH RECURSIVE ancestors(id) AS (
             SELECT parent_id FROM programs WHERE id = ?1
             UNION
             SELECT p.parent_id FROM programs p JOIN ancestors a ON p.id = a.id
         )
         UPDATE programs SET visits = visits + 1, value = value + ?2
         WHERE id IN (SELECT id FROM ancestors WHERE id IS NOT NULL)",
        params![program_id, reward],
    )
    .map_err(|e| format!("backpropagate failed: {e}"))
}

impl EvalStore {
    /// Store a program without queueing it, e.g. an already evaluated root.
    pub fn insert_program(&self, program: &Program) -> Result<ProgramId, String> {
        let conn = self.conn()?;
        insert_program_in(&conn, program)
    }

    pub fn get_program(&self, program_id: ProgramId) -> Result<Option<Program>, String> {
        let raw = {
            let conn = self.conn()?;
            conn.query_row(
                &format!("SELECT {PROGRAM_COLUMNS} FROM programs WHERE id = ?1"),
                params![program_id],
                program_from_row,
            )
            .optional()
            .map_err(|e| format!("get program failed: {e}"))?
        };
        raw.map(|raw| raw.into_program()).transpose()
    }

    /// Apply a reward to every ancestor of `program_id` in one statement.
    /// Returns how many programs were updated.
    pub fn backpropagate(&self, program_id: ProgramId, reward: f64) -> Result<usize, String> {
        let conn = self.conn()?;
        backpropagate_in(&conn, program_id, reward)
    }

    /// Evaluated program of `version` with the highest own reward.
    pub fn best_program(&self, version: i64) -> Result<Option<Program>, String> {
        let raw = {
            let conn = self.conn()?;
            conn.query_row(
                &format!(
                    "SELECT {PROGRAM_COLUMNS} FROM programs
                     WHERE version = ?1 AND state_json IS NOT NULL
                     ORDER BY COALESCE(holdout_value, raw_reward, value) DESC, id ASC
                     LIMIT 1"
                ),
                params![version],
                program_from_row,
            )
            .optional()
            .map_err(|e| format!("best program failed: {e}"))?
        };
        raw.map(|raw| raw.into_program()).transpose()
    }

    pub fn count_programs(&self, version: i64) -> Result<usize, String> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT COUNT(*) FROM programs WHERE version = ?1",
            params![version],
            |row| row.get::<_, i64>(0),
        )
        .map(|count| count as usize)
        .map_err(|e| format!("count programs failed: {e}"))
    }

    fn query_programs(&self, sql: &str, args: impl rusqlite::Params) -> Result<Vec<Program>, String> {
        let raws = {
            let conn = self.conn()?;
            let mut stmt = conn
                .prepare(sql)
                .map_err(|e| format!("program query prepare failed: {e}"))?;
            let rows = stmt
                .query_map(args, program_from_row)
                .map_err(|e| format!("program query failed: {e}"))?;
            rows.collect::<Result<Vec<_>, _>>()
                .map_err(|e| format!("program row decode failed: {e}"))?
        };
        raws.into_iter().map(|raw| raw.into_program()).collect()
    }
}

impl ProgramSource for EvalStore {
    fn candidates(&self, version: i64) -> Result<Vec<Program>, String> {
        self.query_programs(
            &format!(
                "SELECT {PROGRAM_COLUMNS} FROM programs
                 WHERE version = ?1 AND state_json IS NOT NULL
                 ORDER BY id ASC"
            ),
            params![version],
        )
    }

    fn lineage(&self, id: ProgramId, max_depth: usize) -> Result<Vec<Program>, String> {
        self.query_programs(
            &format!(
                "WITH RECURSIVE chain(id, parent_id, hops) AS (
                     SELECT id, parent_id, 0 FROM programs WHERE id = ?1
                     UNION ALL
                     SELECT p.id, p.parent_id, c.hops + 1
                     FROM programs p JOIN chain c ON p.id = c.parent_id
                     WHERE c.hops < ?2
                 )
                 SELECT {PROGRAM_COLUMNS} FROM programs
                 WHERE id IN (SELECT id FROM chain)
                 ORDER BY depth ASC, id ASC"
            ),
            params![id, max_depth as i64],
        )
    }
}
