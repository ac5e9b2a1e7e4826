use std::sync::Arc;

use anyhow::Context;
use eval_server::{serve, spawn_reaper_task, EvalStore, ParallelMctsConfig, ServiceConfig};

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::filter::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let config = ServiceConfig::from_env();
    let store = Arc::new(
        EvalStore::open(&config.data_dir)
            .map_err(anyhow::Error::msg)
            .context("failed to open eval store")?,
    );

    if let Some(path) = &config.parallel_config_path {
        let parallel = ParallelMctsConfig::load(path)?;
        tracing::info!(
            n_parallel = parallel.n_parallel,
            mcts_class = %parallel.mcts_class,
            sampler = %parallel.sampler,
            holdout = parallel.holdout,
            "search configuration is valid"
        );
    }

    let counts = store
        .count_by_status()
        .map_err(anyhow::Error::msg)?;
    tracing::info!(
        "starting factory eval server: bind_addr={} data_dir={} pending={} running={} running_task_timeout_secs={} max_task_attempts={}",
        config.bind_addr,
        config.data_dir.display(),
        counts.pending,
        counts.running,
        config.running_task_timeout_secs,
        config.max_task_attempts
    );

    spawn_reaper_task(
        Arc::clone(&store),
        config.reap_interval_secs,
        config.running_task_timeout_secs,
        config.max_task_attempts,
    );

    serve(store, &config).await.context("http server failed")
}
