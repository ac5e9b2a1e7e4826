//! Parallel search groups: each group owns a version, a search loop, and a
//! slice of the game-instance pool.

use std::{fs, path::Path, sync::Arc};

use anyhow::Context;
use factory_mcts_core::{build_sampler, GameState, SamplerConfig, SamplerKind};
use serde::{Deserialize, Serialize};
use tokio::{sync::watch, task::JoinSet};

use crate::{
    search::{IterationReport, ProgramGenerator, SearchLoop, SearchPolicyKind, SearchSettings},
    worker::{EvaluatorWorker, SharedInstance, WorkerStats},
    EvalStore, WorkerConfig,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParallelMctsConfig {
    pub n_parallel: usize,
    pub system_prompt: String,
    /// World every root starts from. When absent, each worker snapshots its
    /// own instance before its first claim.
    #[serde(default)]
    pub initial_state: Option<GameState>,
    #[serde(default)]
    pub mcts_class: SearchPolicyKind,
    #[serde(default)]
    pub sampler: SamplerKind,
    #[serde(default)]
    pub sampler_config: SamplerConfig,
    #[serde(default)]
    pub mcts_kwargs: serde_json::Value,
    /// Reserve one instance per group for baseline measurements.
    #[serde(default)]
    pub holdout: bool,
}

impl ParallelMctsConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let config: Self = serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        config
            .validate()
            .map_err(|(message, code)| anyhow::anyhow!("{code}: {message}"))?;
        Ok(config)
    }

    /// Returns `(error_message, error_code)` on failure.
    pub fn validate(&self) -> Result<SearchSettings, (String, &'static str)> {
        if self.n_parallel == 0 {
            return Err((
                "n_parallel must be at least 1".to_string(),
                "invalid_n_parallel",
            ));
        }
        if self.system_prompt.trim().is_empty() {
            return Err((
                "system_prompt must not be empty".to_string(),
                "invalid_system_prompt",
            ));
        }
        if self.sampler_config.temperature.is_nan() {
            return Err((
                "sampler_config.temperature must be a number".to_string(),
                "invalid_sampler_config",
            ));
        }
        SearchSettings::from_kwargs(&self.mcts_kwargs).map_err(|e| (e, "invalid_mcts_kwargs"))
    }

    /// Instances a group needs at minimum: one active, plus the holdout.
    pub fn min_instances_per_group(&self) -> usize {
        1 + usize::from(self.holdout)
    }
}

/// A game instance and the id workers report it under.
#[derive(Clone)]
pub struct NamedInstance {
    pub id: String,
    pub instance: SharedInstance,
}

pub struct InstanceGroup {
    pub version: i64,
    pub active: Vec<NamedInstance>,
    pub holdout: Option<NamedInstance>,
}

impl InstanceGroup {
    pub fn total_instances(&self) -> usize {
        self.active.len() + usize::from(self.holdout.is_some())
    }
}

/// Split `instances` evenly across `config.n_parallel` groups. Group `i`
/// searches version `base_version + i`; with holdout enabled the first
/// instance of each slice is reserved for baselines. Leftover instances are
/// not used.
pub fn build_groups(
    config: &ParallelMctsConfig,
    instances: Vec<NamedInstance>,
    base_version: i64,
) -> Result<Vec<InstanceGroup>, (String, &'static str)> {
    config.validate()?;
    let per_group = instances.len() / config.n_parallel;
    if per_group < config.min_instances_per_group() {
        return Err((
            format!(
                "{} instances cannot fill {} groups of at least {}",
                instances.len(),
                config.n_parallel,
                config.min_instances_per_group()
            ),
            "insufficient_instances",
        ));
    }
    let unused = instances.len() - per_group * config.n_parallel;
    if unused > 0 {
        tracing::warn!(unused, per_group, "instances left over after partitioning");
    }

    let mut pool = instances.into_iter();
    let mut groups = Vec::with_capacity(config.n_parallel);
    for i in 0..config.n_parallel {
        let mut slice: Vec<NamedInstance> = pool.by_ref().take(per_group).collect();
        let holdout = config.holdout.then(|| slice.remove(0));
        groups.push(InstanceGroup {
            version: base_version + i as i64,
            active: slice,
            holdout,
        });
    }
    Ok(groups)
}

#[derive(Debug, Clone, Default)]
pub struct GroupReport {
    pub version: i64,
    pub iterations: Vec<IterationReport>,
    pub workers: Vec<WorkerStats>,
    /// Why the group stopped early, if it did.
    pub error: Option<String>,
}

/// Run every group concurrently until each finishes `iterations` or
/// `shutdown` is signalled. A failing group does not stop the others.
pub async fn run_parallel(
    config: &ParallelMctsConfig,
    groups: Vec<InstanceGroup>,
    store: Arc<EvalStore>,
    generator: Arc<dyn ProgramGenerator>,
    worker_config: WorkerConfig,
    iterations: Option<usize>,
    shutdown: watch::Receiver<bool>,
) -> anyhow::Result<Vec<GroupReport>> {
    let settings = config
        .validate()
        .map_err(|(message, code)| anyhow::anyhow!("{code}: {message}"))?;
    let mut sampler_config = config.sampler_config.clone();
    if let Some(lookback) = settings.maximum_lookback {
        sampler_config.maximum_lookback = lookback;
    }

    let mut tasks = JoinSet::new();
    for group in groups {
        let search = SearchLoop::new(
            Arc::clone(&store),
            Arc::clone(&generator),
            Arc::from(build_sampler(config.sampler, &sampler_config)),
            config.mcts_class,
            settings.clone(),
            config.system_prompt.clone(),
            group.version,
            sampler_config.maximum_lookback,
        );
        tasks.spawn(run_group(
            group,
            search,
            Arc::clone(&store),
            config.initial_state.clone(),
            worker_config,
            iterations,
            shutdown.clone(),
        ));
    }

    let mut reports = Vec::new();
    while let Some(joined) = tasks.join_next().await {
        reports.push(joined.context("search group task panicked")?);
    }
    reports.sort_by_key(|report| report.version);
    Ok(reports)
}

async fn run_group(
    group: InstanceGroup,
    search: SearchLoop,
    store: Arc<EvalStore>,
    initial_state: Option<GameState>,
    worker_config: WorkerConfig,
    iterations: Option<usize>,
    mut shutdown: watch::Receiver<bool>,
) -> GroupReport {
    let version = group.version;
    tracing::info!(
        version,
        active = group.active.len(),
        holdout = group.holdout.is_some(),
        "search group starting"
    );

    let (stop_tx, stop_rx) = watch::channel(false);
    let mut workers = JoinSet::new();
    for named in group.active {
        let mut worker =
            EvaluatorWorker::new(Arc::clone(&store), named.id, named.instance, worker_config)
                .for_version(version);
        if let Some(state) = &initial_state {
            worker = worker.with_initial_state(state.clone());
        }
        if let Some(holdout) = &group.holdout {
            worker = worker.with_holdout(Arc::clone(&holdout.instance));
        }
        workers.spawn(worker.run(stop_rx.clone()));
    }

    let mut report = GroupReport {
        version,
        ..GroupReport::default()
    };
    let search_run = search.run(iterations, stop_rx.clone());
    tokio::pin!(search_run);
    let mut outer_open = true;

    let outcome = loop {
        tokio::select! {
            result = &mut search_run => break result,
            Some(joined) = workers.join_next() => match joined {
                Ok(Ok(stats)) => report.workers.push(stats),
                Ok(Err(err)) => {
                    tracing::error!(version, "aborting search group: {err}");
                    report.error.get_or_insert_with(|| err.to_string());
                    let _ = stop_tx.send(true);
                }
                Err(err) => {
                    report.error.get_or_insert_with(|| format!("worker task failed: {err}"));
                    let _ = stop_tx.send(true);
                }
            },
            changed = shutdown.changed(), if outer_open => {
                if changed.is_err() {
                    outer_open = false;
                } else if *shutdown.borrow() {
                    let _ = stop_tx.send(true);
                }
            }
        }
    };

    match outcome {
        Ok(iterations) => report.iterations = iterations,
        Err(err) => {
            tracing::error!(version, "search loop failed: {err:#}");
            report.error.get_or_insert_with(|| format!("{err:#}"));
        }
    }

    let _ = stop_tx.send(true);
    while let Some(joined) = workers.join_next().await {
        match joined {
            Ok(Ok(stats)) => report.workers.push(stats),
            Ok(Err(err)) => {
                report.error.get_or_insert_with(|| err.to_string());
            }
            Err(err) => {
                report.error.get_or_insert_with(|| format!("worker task failed: {err}"));
            }
        }
    }
    tracing::info!(
        version,
        iterations = report.iterations.len(),
        failed = report.error.is_some(),
        "search group finished"
    );
    report
}
