use std::str::FromStr;

use factory_mcts_core::ProgramId;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type TaskId = i64;

/// Evaluation task lifecycle: pending -> running -> completed | failed.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("unknown task status in db: {s}")),
        }
    }
}

/// Payload stored in `evaluation_queue.result_json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TaskResult {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reward: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub baseline_reward: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
}

impl TaskResult {
    pub fn success(reward: f64, response: impl Into<String>) -> Self {
        Self {
            reward: Some(reward),
            response: Some(response.into()),
            ..Self::default()
        }
    }

    pub fn failure(error: impl Into<String>, error_code: &str) -> Self {
        Self {
            error: Some(error.into()),
            error_code: Some(error_code.to_string()),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EvaluationTask {
    pub id: TaskId,
    pub program_id: ProgramId,
    pub version: i64,
    pub status: TaskStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lease: Option<Uuid>,
    pub attempts: u32,
    pub created_at_unix_s: u64,
    pub started_at_unix_s: Option<u64>,
    pub completed_at_unix_s: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<TaskResult>,
}

/// Fields written onto a program when its evaluation completes.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgramOutcome {
    /// Reward credited to the tree: the raw reward, or the advantage over
    /// the holdout baseline when one was measured.
    pub value: f64,
    pub raw_reward: f64,
    pub holdout_value: Option<f64>,
    pub state_json: String,
    pub response: String,
}

/// Whether a lease-guarded write landed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompleteOutcome {
    Recorded,
    /// The task is no longer running under this lease (reaped or already terminal).
    LeaseLost,
}

#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct QueueCounts {
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub total: usize,
}

#[derive(Debug, Serialize)]
pub(crate) struct HealthResponse {
    pub(crate) status: &'static str,
    pub(crate) service: &'static str,
    pub(crate) pending_tasks: usize,
    pub(crate) running_tasks: usize,
    pub(crate) completed_tasks: usize,
    pub(crate) failed_tasks: usize,
    pub(crate) stored_tasks: usize,
    pub(crate) running_task_timeout_secs: u64,
    pub(crate) max_task_attempts: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_strings_round_trip() {
        for status in [
            TaskStatus::Pending,
            TaskStatus::Running,
            TaskStatus::Completed,
            TaskStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<TaskStatus>(), Ok(status));
        }
        assert!("queued".parse::<TaskStatus>().is_err());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(!TaskStatus::Running.is_terminal());
    }

    #[test]
    fn result_json_omits_empty_fields() {
        let json = serde_json::to_value(TaskResult::success(5.0, "ok")).unwrap();
        assert_eq!(json, serde_json::json!({ "reward": 5.0, "response": "ok" }));
    }
}
