//! Per-instance evaluation loop.
//!
//! A worker owns one game instance. It claims a task, restores the start
//! state the program was written against, runs the code, and records the
//! outcome. Failures are recorded on the task and the loop moves on; only
//! problems that make the instance itself unusable end the loop.
//!
//! Without a configured initial state, the worker snapshots its instance
//! before the first claim and restores that snapshot before every root.

#[cfg(test)]
mod tests;

use core::fmt;
use std::sync::{Arc, Mutex};

use factory_mcts_core::{GameInstance, GameState, Program};
use tokio::sync::{watch, OnceCell};
use uuid::Uuid;

use crate::{
    CompleteOutcome, EvalStore, EvaluationTask, ProgramOutcome, TaskId, TaskResult, WorkerConfig,
};
use factory_mcts_core::ProgramId;

/// A game instance that at most one evaluation can hold at a time.
pub type SharedInstance = Arc<Mutex<Box<dyn GameInstance>>>;

pub fn shared_instance<I: GameInstance + 'static>(instance: I) -> SharedInstance {
    let boxed: Box<dyn GameInstance> = Box::new(instance);
    Arc::new(Mutex::new(boxed))
}

#[derive(Debug, Clone, PartialEq)]
pub enum WorkerError {
    /// The queue could not be read. The loop retries after the poll interval.
    Store(String),
    /// The holdout instance rejected a state restore; baselines can no longer
    /// be trusted for this group.
    HoldoutRestore(String),
    /// An evaluation outlived its timeout and the grace period after it.
    InstanceWedged { instance_id: String, task_id: TaskId },
    InstancePoisoned(String),
    /// The instance's world could not be captured as the root start state.
    StateCapture(String),
}

impl WorkerError {
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::Store(_))
    }
}

impl fmt::Display for WorkerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Store(message) => write!(f, "store error: {message}"),
            Self::HoldoutRestore(message) => write!(f, "holdout instance restore failed: {message}"),
            Self::InstanceWedged {
                instance_id,
                task_id,
            } => write!(
                f,
                "instance {instance_id} did not return from task {task_id} after timeout"
            ),
            Self::InstancePoisoned(instance_id) => {
                write!(f, "instance {instance_id} mutex poisoned by a panicking evaluation")
            }
            Self::StateCapture(message) => write!(f, "failed to capture start state: {message}"),
        }
    }
}

impl std::error::Error for WorkerError {}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TaskOutcome {
    Completed { reward: f64 },
    Failed { error_code: &'static str },
    /// The lease was revoked before the result could be written.
    Discarded,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TaskReport {
    pub task_id: TaskId,
    pub program_id: ProgramId,
    pub outcome: TaskOutcome,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStats {
    pub completed: usize,
    pub failed: usize,
    pub discarded: usize,
}

impl WorkerStats {
    fn record(&mut self, report: &TaskReport) {
        match report.outcome {
            TaskOutcome::Completed { .. } => self.completed += 1,
            TaskOutcome::Failed { .. } => self.failed += 1,
            TaskOutcome::Discarded => self.discarded += 1,
        }
    }
}

enum StepError {
    /// Task-local failure, not yet recorded.
    Failed { message: String, code: &'static str },
    /// Record the failure, then stop the worker.
    Abort {
        message: String,
        code: &'static str,
        error: WorkerError,
    },
    /// The timeout was already recorded on the task with outcome `recorded`.
    /// `wedged` is set when the instance never came back.
    TimedOut {
        wedged: Option<WorkerError>,
        recorded: TaskOutcome,
    },
}

impl StepError {
    fn failed(message: impl Into<String>, code: &'static str) -> Self {
        Self::Failed {
            message: message.into(),
            code,
        }
    }
}

/// Evaluates queued programs on one game instance.
///
/// With a holdout instance attached it becomes the holdout variant: every
/// program's reward is reported relative to a do-nothing baseline measured
/// from the same start state.
pub struct EvaluatorWorker {
    store: Arc<EvalStore>,
    instance_id: String,
    instance: SharedInstance,
    version: Option<i64>,
    initial_state: OnceCell<GameState>,
    holdout: Option<SharedInstance>,
    config: WorkerConfig,
}

impl EvaluatorWorker {
    pub fn new(
        store: Arc<EvalStore>,
        instance_id: impl Into<String>,
        instance: SharedInstance,
        config: WorkerConfig,
    ) -> Self {
        Self {
            store,
            instance_id: instance_id.into(),
            instance,
            version: None,
            initial_state: OnceCell::new(),
            holdout: None,
            config,
        }
    }

    /// Only claim tasks of `version`.
    pub fn for_version(mut self, version: i64) -> Self {
        self.version = Some(version);
        self
    }

    /// State restored before evaluating a root program.
    pub fn with_initial_state(mut self, state: GameState) -> Self {
        self.initial_state = OnceCell::from(state);
        self
    }

    pub fn with_holdout(mut self, holdout: SharedInstance) -> Self {
        self.holdout = Some(holdout);
        self
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Claim and process tasks until `shutdown` flips to `true` or a fatal
    /// error occurs. An empty queue parks the worker until the store signals
    /// a new task or the poll interval elapses.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<WorkerStats, WorkerError> {
        let wake = self.store.wake_handle();
        let mut stats = WorkerStats::default();
        tracing::info!(instance_id = %self.instance_id, version = ?self.version, "worker started");

        loop {
            if *shutdown.borrow() {
                break;
            }
            match self.run_once().await {
                Ok(Some(report)) => {
                    stats.record(&report);
                    continue;
                }
                Ok(None) => {}
                Err(err) if err.is_fatal() => {
                    tracing::error!(instance_id = %self.instance_id, "worker stopping: {err}");
                    return Err(err);
                }
                Err(err) => tracing::warn!(instance_id = %self.instance_id, "{err}"),
            }

            tokio::select! {
                _ = wake.notified() => {}
                _ = tokio::time::sleep(self.config.poll_interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        tracing::info!(
            instance_id = %self.instance_id,
            completed = stats.completed,
            failed = stats.failed,
            discarded = stats.discarded,
            "worker stopped"
        );
        Ok(stats)
    }

    /// Claim at most one task and process it. `Ok(None)` when nothing is pending.
    pub async fn run_once(&self) -> Result<Option<TaskReport>, WorkerError> {
        self.root_state().await?;
        let task = self
            .store
            .claim(&self.instance_id, self.version)
            .map_err(WorkerError::Store)?;
        let Some(task) = task else {
            return Ok(None);
        };
        let Some(lease) = task.lease else {
            return Err(WorkerError::Store(format!("claimed task {} has no lease", task.id)));
        };
        tracing::info!(
            task_id = task.id,
            program_id = task.program_id,
            instance_id = %self.instance_id,
            attempt = task.attempts,
            "task claimed"
        );

        let outcome = match self.evaluate(&task, lease).await {
            Ok((outcome, result)) => self.persist(&task, lease, &outcome, &result),
            Err(StepError::Failed { message, code }) => {
                self.record_failure(&task, lease, &message, code)
            }
            Err(StepError::Abort {
                message,
                code,
                error,
            }) => {
                self.record_failure(&task, lease, &message, code);
                return Err(error);
            }
            Err(StepError::TimedOut {
                wedged: Some(error), ..
            }) => return Err(error),
            Err(StepError::TimedOut { wedged: None, recorded }) => recorded,
        };

        Ok(Some(TaskReport {
            task_id: task.id,
            program_id: task.program_id,
            outcome,
        }))
    }

    async fn evaluate(
        &self,
        task: &EvaluationTask,
        lease: Uuid,
    ) -> Result<(ProgramOutcome, TaskResult), StepError> {
        let program = match self.store.get_program(task.program_id) {
            Ok(Some(program)) => program,
            Ok(None) => {
                return Err(StepError::failed(
                    format!("program not found: {}", task.program_id),
                    "program_not_found",
                ))
            }
            Err(e) => {
                return Err(StepError::failed(
                    format!("failed to load program {}: {e}", task.program_id),
                    "program_not_found",
                ))
            }
        };
        let start = self.start_state(&program)?;

        let baseline = match &self.holdout {
            Some(holdout) => Some(
                self.measure_baseline(task, lease, holdout, start.clone())
                    .await?,
            ),
            None => None,
        };

        let code = program.code;
        let evaluation = self
            .with_instance(task, lease, &self.instance_id, &self.instance, move |instance| {
                if let Some(state) = &start {
                    state.to_instance(instance).map_err(|e| {
                        StepError::failed(format!("failed to restore start state: {e}"), "restore_failed")
                    })?;
                }
                instance
                    .evaluate(&code)
                    .map_err(|e| StepError::failed(format!("evaluation failed: {e}"), "evaluation_error"))
            })
            .await??;

        let state_json = evaluation.state.to_raw().map_err(|e| {
            StepError::failed(format!("failed to encode resulting state: {e}"), "persist_failed")
        })?;
        let raw_reward = evaluation.reward;
        let value = match baseline {
            Some(baseline_reward) => raw_reward - baseline_reward,
            None => raw_reward,
        };

        let result = TaskResult {
            reward: Some(raw_reward),
            response: Some(evaluation.response.clone()),
            baseline_reward: baseline,
            ..TaskResult::default()
        };
        let outcome = ProgramOutcome {
            value,
            raw_reward,
            holdout_value: baseline.map(|_| value),
            state_json,
            response: evaluation.response,
        };
        Ok((outcome, result))
    }

    /// Start state for roots: the configured one, or a snapshot of the
    /// instance taken before this worker evaluated anything.
    async fn root_state(&self) -> Result<&GameState, WorkerError> {
        self.initial_state
            .get_or_try_init(|| async move {
                let instance = Arc::clone(&self.instance);
                let instance_id = self.instance_id.clone();
                let state = tokio::task::spawn_blocking(move || {
                    let mut guard = instance
                        .lock()
                        .map_err(|_| WorkerError::InstancePoisoned(instance_id.clone()))?;
                    GameState::from_instance(&mut **guard)
                        .map_err(|e| WorkerError::StateCapture(format!("{instance_id}: {e}")))
                })
                .await
                .map_err(|e| WorkerError::StateCapture(format!("capture thread failed: {e}")))??;
                tracing::info!(instance_id = %self.instance_id, "captured root start state");
                Ok::<_, WorkerError>(state)
            })
            .await
    }

    /// Parent's resulting state, or the root start state.
    fn start_state(&self, program: &Program) -> Result<Option<GameState>, StepError> {
        let Some(parent_id) = program.parent_id else {
            return Ok(self.initial_state.get().cloned());
        };
        match self.store.get_program(parent_id) {
            Ok(Some(parent)) => parent.state.map(Some).ok_or_else(|| {
                StepError::failed(
                    format!("parent program {parent_id} has not been evaluated"),
                    "restore_failed",
                )
            }),
            Ok(None) => Err(StepError::failed(
                format!("parent program {parent_id} not found"),
                "restore_failed",
            )),
            Err(e) => Err(StepError::failed(
                format!("failed to load parent program {parent_id}: {e}"),
                "restore_failed",
            )),
        }
    }

    async fn measure_baseline(
        &self,
        task: &EvaluationTask,
        lease: Uuid,
        holdout: &SharedInstance,
        start: Option<GameState>,
    ) -> Result<f64, StepError> {
        let sleep_code = format!("sleep({})", self.config.holdout_sleep_secs);
        let holdout_id = format!("{}/holdout", self.instance_id);
        let baseline = self
            .with_instance(task, lease, &holdout_id, holdout, move |instance| {
                if let Some(state) = &start {
                    state.to_instance(instance).map_err(|e| {
                        let message = format!("failed to restore holdout instance: {e}");
                        StepError::Abort {
                            error: WorkerError::HoldoutRestore(message.clone()),
                            message,
                            code: "restore_failed",
                        }
                    })?;
                }
                instance.evaluate(&sleep_code).map(|e| e.reward).map_err(|e| {
                    StepError::failed(format!("baseline evaluation failed: {e}"), "baseline_error")
                })
            })
            .await??;
        tracing::debug!(task_id = task.id, baseline_reward = baseline, "baseline measured");
        Ok(baseline)
    }

    /// Run `f` against `instance` on a blocking thread, bounded by the task
    /// timeout.
    async fn with_instance<T, F>(
        &self,
        task: &EvaluationTask,
        lease: Uuid,
        instance_id: &str,
        instance: &SharedInstance,
        f: F,
    ) -> Result<T, StepError>
    where
        T: Send + 'static,
        F: FnOnce(&mut dyn GameInstance) -> T + Send + 'static,
    {
        let instance = Arc::clone(instance);
        let mut handle = tokio::task::spawn_blocking(move || {
            let mut guard = instance.lock().map_err(|_| ())?;
            Ok::<T, ()>(f(&mut **guard))
        });

        tokio::select! {
            joined = &mut handle => match joined {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(())) => Err(StepError::Abort {
                    message: format!("game instance {instance_id} is unusable"),
                    code: "evaluation_error",
                    error: WorkerError::InstancePoisoned(instance_id.to_string()),
                }),
                Err(err) => Err(StepError::failed(
                    format!("evaluation thread failed: {err}"),
                    "evaluation_error",
                )),
            },
            _ = tokio::time::sleep(self.config.task_timeout) => {
                let timeout_secs = self.config.task_timeout.as_secs_f64();
                tracing::error!(
                    task_id = task.id,
                    instance_id = %instance_id,
                    timeout_secs,
                    "evaluation timed out"
                );
                let recorded = self.record_failure(
                    task,
                    lease,
                    &format!("evaluation timed out after {timeout_secs}s"),
                    "evaluation_timeout",
                );

                match tokio::time::timeout(self.config.wedged_grace, handle).await {
                    Ok(_) => {
                        tracing::warn!(
                            task_id = task.id,
                            instance_id = %instance_id,
                            "evaluation returned after timeout and its result was discarded"
                        );
                        Err(StepError::TimedOut {
                            wedged: None,
                            recorded,
                        })
                    }
                    Err(_) => Err(StepError::TimedOut {
                        wedged: Some(WorkerError::InstanceWedged {
                            instance_id: instance_id.to_string(),
                            task_id: task.id,
                        }),
                        recorded,
                    }),
                }
            }
        }
    }

    fn persist(
        &self,
        task: &EvaluationTask,
        lease: Uuid,
        outcome: &ProgramOutcome,
        result: &TaskResult,
    ) -> TaskOutcome {
        match self.store.complete_evaluation(task.id, lease, outcome, result) {
            Ok(CompleteOutcome::Recorded) => {
                tracing::info!(
                    task_id = task.id,
                    program_id = task.program_id,
                    reward = outcome.raw_reward,
                    value = outcome.value,
                    "task completed"
                );
                TaskOutcome::Completed {
                    reward: outcome.raw_reward,
                }
            }
            Ok(CompleteOutcome::LeaseLost) => {
                tracing::warn!(
                    task_id = task.id,
                    error_code = "lease_expired",
                    "task lease was revoked; evaluation discarded"
                );
                TaskOutcome::Discarded
            }
            Err(e) => {
                tracing::error!(task_id = task.id, "failed to store evaluation: {e}");
                self.record_failure(
                    task,
                    lease,
                    &format!("failed to persist evaluation: {e}"),
                    "persist_failed",
                )
            }
        }
    }

    fn record_failure(
        &self,
        task: &EvaluationTask,
        lease: Uuid,
        message: &str,
        error_code: &'static str,
    ) -> TaskOutcome {
        tracing::warn!(task_id = task.id, error_code, "task failed: {message}");
        match self.store.fail(task.id, lease, message, error_code) {
            Ok(CompleteOutcome::Recorded) => TaskOutcome::Failed { error_code },
            Ok(CompleteOutcome::LeaseLost) => {
                tracing::warn!(
                    task_id = task.id,
                    error_code = "lease_expired",
                    "task lease was revoked before the failure was recorded"
                );
                TaskOutcome::Discarded
            }
            Err(e) => {
                tracing::error!(task_id = task.id, "failed to mark task failed: {e}");
                TaskOutcome::Failed { error_code }
            }
        }
    }
}
