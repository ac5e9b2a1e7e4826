use std::{env, path::PathBuf, time::Duration};

pub(crate) const DEFAULT_DATA_DIR: &str = "./data";
pub(crate) const DEFAULT_BIND_ADDR: &str = "0.0.0.0:8080";
pub(crate) const DEFAULT_POLL_INTERVAL_MS: u64 = 1_000;
// Programs that build a whole factory can take minutes against a live server.
pub(crate) const DEFAULT_TASK_TIMEOUT_SECS: u64 = 10 * 60;
// After a timeout the blocking evaluate call is still running; if it does not
// return within this window the instance is declared wedged.
pub(crate) const DEFAULT_WEDGED_INSTANCE_GRACE_SECS: u64 = 60;
// Must exceed the task timeout plus grace, or healthy slow tasks get reaped.
pub(crate) const DEFAULT_RUNNING_TASK_TIMEOUT_SECS: u64 = 15 * 60;
pub(crate) const DEFAULT_REAP_INTERVAL_SECS: u64 = 60;
pub(crate) const DEFAULT_MAX_TASK_ATTEMPTS: u32 = 3;
pub(crate) const DEFAULT_HOLDOUT_SLEEP_SECS: u64 = 60;
pub(crate) const DEFAULT_HTTP_KEEP_ALIVE_SECS: u64 = 75;

/// Per-worker timing knobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerConfig {
    pub poll_interval: Duration,
    pub task_timeout: Duration,
    pub wedged_grace: Duration,
    /// Length of the do-nothing baseline program a holdout worker runs.
    pub holdout_sleep_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            task_timeout: Duration::from_secs(DEFAULT_TASK_TIMEOUT_SECS),
            wedged_grace: Duration::from_secs(DEFAULT_WEDGED_INSTANCE_GRACE_SECS),
            holdout_sleep_secs: DEFAULT_HOLDOUT_SLEEP_SECS,
        }
    }
}

impl WorkerConfig {
    pub fn from_env() -> Self {
        Self {
            poll_interval: Duration::from_millis(read_env_u64(
                "POLL_INTERVAL_MS",
                DEFAULT_POLL_INTERVAL_MS,
            )),
            task_timeout: Duration::from_secs(read_env_u64(
                "TASK_TIMEOUT_SECS",
                DEFAULT_TASK_TIMEOUT_SECS,
            )),
            wedged_grace: Duration::from_secs(read_env_u64_allow_zero(
                "WEDGED_INSTANCE_GRACE_SECS",
                DEFAULT_WEDGED_INSTANCE_GRACE_SECS,
            )),
            holdout_sleep_secs: read_env_u64_allow_zero(
                "HOLDOUT_SLEEP_SECS",
                DEFAULT_HOLDOUT_SLEEP_SECS,
            ),
        }
    }
}

/// Settings for the status service and the stale-task reaper.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub data_dir: PathBuf,
    pub bind_addr: String,
    pub running_task_timeout_secs: u64,
    pub reap_interval_secs: u64,
    pub max_task_attempts: u32,
    pub http_workers: Option<usize>,
    pub http_keep_alive_secs: u64,
    pub parallel_config_path: Option<PathBuf>,
}

impl ServiceConfig {
    pub fn from_env() -> Self {
        let worker = WorkerConfig::from_env();
        let running_task_timeout_secs = reap_threshold_secs(
            read_env_u64("RUNNING_TASK_TIMEOUT_SECS", DEFAULT_RUNNING_TASK_TIMEOUT_SECS),
            &worker,
        );

        Self {
            data_dir: env::var("EVAL_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(DEFAULT_DATA_DIR)),
            bind_addr: env::var("API_BIND_ADDR").unwrap_or_else(|_| DEFAULT_BIND_ADDR.to_string()),
            running_task_timeout_secs,
            reap_interval_secs: read_env_u64("REAP_INTERVAL_SECS", DEFAULT_REAP_INTERVAL_SECS),
            max_task_attempts: read_env_u32("MAX_TASK_ATTEMPTS", DEFAULT_MAX_TASK_ATTEMPTS),
            http_workers: read_env_optional_usize("HTTP_WORKERS"),
            http_keep_alive_secs: read_env_u64("HTTP_KEEP_ALIVE_SECS", DEFAULT_HTTP_KEEP_ALIVE_SECS),
            parallel_config_path: env::var("PARALLEL_MCTS_CONFIG").ok().map(PathBuf::from),
        }
    }
}

/// Running tasks younger than this are never reaped. Kept above the longest
/// time a live worker can hold a task: timeout plus wedged grace.
fn reap_threshold_secs(requested: u64, worker: &WorkerConfig) -> u64 {
    let floor = worker.task_timeout.as_secs() + worker.wedged_grace.as_secs();
    if requested > floor {
        return requested;
    }
    tracing::warn!(
        "RUNNING_TASK_TIMEOUT_SECS ({}) <= TASK_TIMEOUT_SECS + WEDGED_INSTANCE_GRACE_SECS ({}). Raising to {}.",
        requested,
        floor,
        floor + 1
    );
    floor + 1
}

pub(crate) fn read_env_optional_usize(name: &str) -> Option<usize> {
    env::var(name)
        .ok()
        .and_then(|value| value.parse::<usize>().ok())
        .filter(|value| *value > 0)
}

pub(crate) fn read_env_u64(name: &str, default: u64) -> u64 {
    env::var(name)
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(default)
}

pub(crate) fn read_env_u64_allow_zero(name: &str, default: u64) -> u64 {
    env::var(name)
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .unwrap_or(default)
}

pub(crate) fn read_env_u32(name: &str, default: u32) -> u32 {
    env::var(name)
        .ok()
        .and_then(|value| value.parse::<u32>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unset_or_garbage_values_fall_back_to_defaults() {
        assert_eq!(read_env_u64("EVAL_TEST_UNSET_U64", 7), 7);
        env::set_var("EVAL_TEST_GARBAGE_U32", "many");
        assert_eq!(read_env_u32("EVAL_TEST_GARBAGE_U32", 3), 3);
        env::set_var("EVAL_TEST_ZERO_U64", "0");
        assert_eq!(read_env_u64("EVAL_TEST_ZERO_U64", 5), 5);
        assert_eq!(read_env_u64_allow_zero("EVAL_TEST_ZERO_U64", 5), 0);
        assert_eq!(read_env_optional_usize("EVAL_TEST_UNSET_USIZE"), None);
    }

    #[test]
    fn reap_threshold_is_longer_than_a_task_can_legitimately_run() {
        let worker = WorkerConfig {
            task_timeout: Duration::from_secs(600),
            wedged_grace: Duration::from_secs(60),
            ..WorkerConfig::default()
        };
        assert_eq!(reap_threshold_secs(900, &worker), 900);
        assert_eq!(reap_threshold_secs(660, &worker), 661);
        assert_eq!(reap_threshold_secs(30, &worker), 661);
        assert_eq!(
            reap_threshold_secs(DEFAULT_RUNNING_TASK_TIMEOUT_SECS, &WorkerConfig::default()),
            DEFAULT_RUNNING_TASK_TIMEOUT_SECS
        );
    }
}
