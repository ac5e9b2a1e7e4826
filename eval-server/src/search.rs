//! Tree-search policies: pick parents, ask the generator for children,
//! queue them, and wait for the workers to score them.

use core::fmt;
use std::{str::FromStr, sync::Arc, time::Duration};

use anyhow::{anyhow, Context};
use factory_mcts_core::{Conversation, ParentSampler, Program, ProgramSource};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::{EvalStore, TaskId};

/// What the generator sees when asked for new programs.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub system_prompt: String,
    pub version: i64,
    /// `None` when generating root programs.
    pub parent: Option<Program>,
    /// The parent and its ancestors, root-most first.
    pub lineage: Vec<Program>,
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GeneratedProgram {
    pub code: String,
    pub conversation: Conversation,
    /// Free-form metadata such as model name and token usage.
    pub meta: serde_json::Value,
}

/// Produces candidate programs, typically by prompting an LLM.
pub trait ProgramGenerator: Send + Sync {
    fn generate(&self, request: &GenerationRequest) -> anyhow::Result<Vec<GeneratedProgram>>;
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchPolicyKind {
    /// One sampled parent per iteration.
    #[default]
    Mcts,
    /// The best `beam_width` programs by mean value are all expanded.
    Beam,
}

impl SearchPolicyKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Mcts => "mcts",
            Self::Beam => "beam",
        }
    }
}

impl fmt::Display for SearchPolicyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SearchPolicyKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mcts" | "parallel_mcts" => Ok(Self::Mcts),
            "beam" | "beam_search" => Ok(Self::Beam),
            other => Err(format!("unknown mcts_class: {other}")),
        }
    }
}

const KNOWN_SEARCH_KEYS: [&str; 5] = [
    "children_per_iteration",
    "beam_width",
    "completion_timeout_secs",
    "maximum_lookback",
    "max_iterations",
];

/// Typed view of `mcts_kwargs`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchSettings {
    pub children_per_iteration: usize,
    pub beam_width: usize,
    pub completion_timeout_secs: u64,
    /// Overrides the sampler's lookback when set.
    pub maximum_lookback: Option<u32>,
    pub max_iterations: Option<usize>,
}

impl Default for SearchSettings {
    fn default() -> Self {
        Self {
            children_per_iteration: 4,
            beam_width: 4,
            completion_timeout_secs: 30 * 60,
            maximum_lookback: None,
            max_iterations: None,
        }
    }
}

impl SearchSettings {
    /// Parse free-form kwargs. Unknown keys are logged and ignored.
    pub fn from_kwargs(kwargs: &serde_json::Value) -> Result<Self, String> {
        if kwargs.is_null() {
            return Ok(Self::default());
        }
        let Some(object) = kwargs.as_object() else {
            return Err("mcts_kwargs must be a JSON object".to_string());
        };
        let mut known = serde_json::Map::new();
        for (key, value) in object {
            if KNOWN_SEARCH_KEYS.contains(&key.as_str()) {
                known.insert(key.clone(), value.clone());
            } else {
                tracing::warn!(key = %key, "ignoring unknown mcts_kwargs entry");
            }
        }
        let settings: Self = serde_json::from_value(serde_json::Value::Object(known))
            .map_err(|e| format!("invalid mcts_kwargs: {e}"))?;
        if settings.children_per_iteration == 0 {
            return Err("children_per_iteration must be at least 1".to_string());
        }
        if settings.beam_width == 0 {
            return Err("beam_width must be at least 1".to_string());
        }
        Ok(settings)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct IterationReport {
    pub expanded: usize,
    pub completed: usize,
    pub failed: usize,
    /// Tasks still pending or running when the completion wait ran out.
    pub unfinished: usize,
    pub best_reward: Option<f64>,
}

/// One search group's expansion loop over the shared store.
pub struct SearchLoop {
    store: Arc<EvalStore>,
    generator: Arc<dyn ProgramGenerator>,
    sampler: Arc<dyn ParentSampler>,
    policy: SearchPolicyKind,
    settings: SearchSettings,
    system_prompt: String,
    version: i64,
    maximum_lookback: u32,
    poll_interval: Duration,
}

impl SearchLoop {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<EvalStore>,
        generator: Arc<dyn ProgramGenerator>,
        sampler: Arc<dyn ParentSampler>,
        policy: SearchPolicyKind,
        settings: SearchSettings,
        system_prompt: impl Into<String>,
        version: i64,
        maximum_lookback: u32,
    ) -> Self {
        Self {
            store,
            generator,
            sampler,
            policy,
            settings,
            system_prompt: system_prompt.into(),
            version,
            maximum_lookback,
            poll_interval: Duration::from_millis(250),
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn version(&self) -> i64 {
        self.version
    }

    /// Run iterations until `max_iterations`, `iterations` (whichever is
    /// smaller) or shutdown.
    pub async fn run(
        &self,
        iterations: Option<usize>,
        mut shutdown: watch::Receiver<bool>,
    ) -> anyhow::Result<Vec<IterationReport>> {
        let limit = match (iterations, self.settings.max_iterations) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        let mut reports = Vec::new();
        while limit.map_or(true, |limit| reports.len() < limit) {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                report = self.step() => {
                    let report = report?;
                    tracing::info!(
                        version = self.version,
                        iteration = reports.len(),
                        expanded = report.expanded,
                        completed = report.completed,
                        failed = report.failed,
                        best_reward = ?report.best_reward,
                        "search iteration finished"
                    );
                    reports.push(report);
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        Ok(reports)
    }

    /// One expansion: choose parents, generate and queue children, wait for
    /// their evaluations.
    pub async fn step(&self) -> anyhow::Result<IterationReport> {
        let parents = self.select_parents()?;
        let mut task_ids = Vec::new();

        for parent in parents {
            let lineage = match parent.as_ref().and_then(|p| p.id) {
                Some(id) => self
                    .store
                    .lineage(id, self.maximum_lookback as usize)
                    .map_err(|e| anyhow!(e))
                    .context("failed to load parent lineage")?,
                None => Vec::new(),
            };
            let request = GenerationRequest {
                system_prompt: self.system_prompt.clone(),
                version: self.version,
                parent: parent.clone(),
                lineage,
                count: self.settings.children_per_iteration,
            };
            let generator = Arc::clone(&self.generator);
            let generated = tokio::task::spawn_blocking(move || generator.generate(&request))
                .await
                .context("generator thread failed")?
                .context("program generation failed")?;

            for candidate in generated {
                let mut program = match &parent {
                    Some(parent) => Program::child_of(parent, candidate.code, candidate.conversation),
                    None => Program::new(candidate.code, candidate.conversation, self.version),
                };
                program.meta = candidate.meta;
                let (program_id, task_id) = self
                    .store
                    .enqueue(&program)
                    .map_err(|e| anyhow!(e))
                    .context("failed to enqueue program")?;
                tracing::debug!(
                    version = self.version,
                    program_id,
                    task_id,
                    parent_id = ?program.parent_id,
                    "program queued"
                );
                task_ids.push(task_id);
            }
        }

        let mut report = self.await_tasks(&task_ids).await?;
        report.expanded = task_ids.len();
        report.best_reward = self
            .store
            .best_program(self.version)
            .map_err(|e| anyhow!(e))?
            .and_then(|best| best.holdout_value.or(best.raw_reward));
        Ok(report)
    }

    /// `[None]` means "generate roots".
    fn select_parents(&self) -> anyhow::Result<Vec<Option<Program>>> {
        let candidates = self
            .store
            .candidates(self.version)
            .map_err(|e| anyhow!(e))
            .context("failed to load candidates")?;
        if candidates.is_empty() {
            return Ok(vec![None]);
        }

        match self.policy {
            SearchPolicyKind::Mcts => {
                let parent = self
                    .sampler
                    .sample_parent(self.store.as_ref(), self.version)
                    .context("parent sampling failed")?;
                Ok(vec![parent])
            }
            SearchPolicyKind::Beam => {
                let mut beam: Vec<Program> = candidates
                    .into_iter()
                    .filter(|p| p.depth < self.maximum_lookback)
                    .collect();
                // Stable sort keeps older programs first among equal means.
                beam.sort_by(|a, b| {
                    let a = a.mean_value().unwrap_or(f64::NEG_INFINITY);
                    let b = b.mean_value().unwrap_or(f64::NEG_INFINITY);
                    b.total_cmp(&a)
                });
                beam.truncate(self.settings.beam_width);
                if beam.is_empty() {
                    return Ok(vec![None]);
                }
                Ok(beam.into_iter().map(Some).collect())
            }
        }
    }

    async fn await_tasks(&self, task_ids: &[TaskId]) -> anyhow::Result<IterationReport> {
        let deadline =
            tokio::time::Instant::now() + Duration::from_secs(self.settings.completion_timeout_secs);
        loop {
            let mut report = IterationReport::default();
            for &task_id in task_ids {
                let task = self
                    .store
                    .get_task(task_id)
                    .map_err(|e| anyhow!(e))?
                    .ok_or_else(|| anyhow!("queued task {task_id} disappeared"))?;
                match task.status {
                    crate::TaskStatus::Completed => report.completed += 1,
                    crate::TaskStatus::Failed => report.failed += 1,
                    crate::TaskStatus::Pending | crate::TaskStatus::Running => {
                        report.unfinished += 1
                    }
                }
            }
            if report.unfinished == 0 {
                return Ok(report);
            }
            if tokio::time::Instant::now() >= deadline {
                tracing::warn!(
                    version = self.version,
                    unfinished = report.unfinished,
                    "stopped waiting for evaluations"
                );
                return Ok(report);
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}
