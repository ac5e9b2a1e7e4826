use factory_mcts_core::{Conversation, GameState, Program, ProgramId};
use rusqlite::Row;
use uuid::Uuid;

use crate::{EvaluationTask, TaskResult, TaskStatus};

pub(super) const TASK_COLUMNS: &str = "id, program_id, version, status, instance_id, lease, \
     attempts, created_at, started_at, completed_at, result_json";

pub(super) const PROGRAM_COLUMNS: &str = "id, code, conversation_json, value, visits, parent_id, \
     state_json, raw_reward, holdout_value, response, version, depth, meta_json, \
     achievements_json, created_at";

pub(super) struct RawTaskRow {
    id: i64,
    program_id: i64,
    version: i64,
    status: String,
    instance_id: Option<String>,
    lease: Option<String>,
    attempts: i64,
    created_at: i64,
    started_at: Option<i64>,
    completed_at: Option<i64>,
    result_json: Option<String>,
}

pub(super) fn task_from_row(row: &Row<'_>) -> rusqlite::Result<RawTaskRow> {
    Ok(RawTaskRow {
        id: row.get(0)?,
        program_id: row.get(1)?,
        version: row.get(2)?,
        status: row.get(3)?,
        instance_id: row.get(4)?,
        lease: row.get(5)?,
        attempts: row.get(6)?,
        created_at: row.get(7)?,
        started_at: row.get(8)?,
        completed_at: row.get(9)?,
        result_json: row.get(10)?,
    })
}

impl RawTaskRow {
    pub(super) fn into_task(self) -> Result<EvaluationTask, String> {
        let status: TaskStatus = self.status.parse()?;
        let lease = self
            .lease
            .as_deref()
            .map(Uuid::parse_str)
            .transpose()
            .map_err(|e| format!("bad lease uuid in db: {e}"))?;
        let result = self
            .result_json
            .as_deref()
            .map(serde_json::from_str::<TaskResult>)
            .transpose()
            .map_err(|e| format!("bad result_json for task {}: {e}", self.id))?;

        Ok(EvaluationTask {
            id: self.id,
            program_id: self.program_id,
            version: self.version,
            status,
            instance_id: self.instance_id,
            lease,
            attempts: self.attempts as u32,
            created_at_unix_s: self.created_at as u64,
            started_at_unix_s: self.started_at.map(|v| v as u64),
            completed_at_unix_s: self.completed_at.map(|v| v as u64),
            result,
        })
    }
}

pub(super) struct RawProgramRow {
    id: i64,
    code: String,
    conversation_json: String,
    value: f64,
    visits: i64,
    parent_id: Option<i64>,
    state_json: Option<String>,
    raw_reward: Option<f64>,
    holdout_value: Option<f64>,
    response: Option<String>,
    version: i64,
    depth: i64,
    meta_json: String,
    achievements_json: String,
    created_at: i64,
}

pub(super) fn program_from_row(row: &Row<'_>) -> rusqlite::Result<RawProgramRow> {
    Ok(RawProgramRow {
        id: row.get(0)?,
        code: row.get(1)?,
        conversation_json: row.get(2)?,
        value: row.get(3)?,
        visits: row.get(4)?,
        parent_id: row.get(5)?,
        state_json: row.get(6)?,
        raw_reward: row.get(7)?,
        holdout_value: row.get(8)?,
        response: row.get(9)?,
        version: row.get(10)?,
        depth: row.get(11)?,
        meta_json: row.get(12)?,
        achievements_json: row.get(13)?,
        created_at: row.get(14)?,
    })
}

impl RawProgramRow {
    pub(super) fn into_program(self) -> Result<Program, String> {
        let id: ProgramId = self.id;
        let conversation: Conversation = serde_json::from_str(&self.conversation_json)
            .map_err(|e| format!("bad conversation_json for program {id}: {e}"))?;
        let state = self
            .state_json
            .as_deref()
            .map(GameState::parse)
            .transpose()
            .map_err(|e| format!("bad state_json for program {id}: {e}"))?;
        let meta = serde_json::from_str(&self.meta_json)
            .map_err(|e| format!("bad meta_json for program {id}: {e}"))?;
        let achievements = serde_json::from_str(&self.achievements_json)
            .map_err(|e| format!("bad achievements_json for program {id}: {e}"))?;

        Ok(Program {
            id: Some(id),
            code: self.code,
            conversation,
            value: self.value,
            visits: self.visits as u64,
            parent_id: self.parent_id,
            state,
            raw_reward: self.raw_reward,
            holdout_value: self.holdout_value,
            response: self.response,
            version: self.version,
            depth: self.depth as u32,
            meta,
            achievements,
            created_at_unix_s: self.created_at as u64,
        })
    }
}
