use std::{sync::Arc, time::Duration};

use actix_cors::Cors;
use actix_web::{middleware, web, App, HttpServer};

use crate::handlers::{best_program, get_program, get_task, health};
use crate::{EvalStore, ServiceConfig};

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) store: Arc<EvalStore>,
    pub(crate) running_task_timeout_secs: u64,
    pub(crate) max_task_attempts: u32,
}

pub(crate) fn routes(cfg: &mut web::ServiceConfig) {
    cfg.route("/health", web::get().to(health))
        .route("/api/tasks/{task_id}", web::get().to(get_task))
        .route("/api/programs/{program_id}", web::get().to(get_program))
        .route("/api/versions/{version}/best", web::get().to(best_program));
}

/// Periodically return stale running tasks to the queue.
pub fn spawn_reaper_task(
    store: Arc<EvalStore>,
    reap_interval_secs: u64,
    running_task_timeout_secs: u64,
    max_task_attempts: u32,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let interval = Duration::from_secs(reap_interval_secs);
        loop {
            tokio::time::sleep(interval).await;
            match store.reap_stale(running_task_timeout_secs, max_task_attempts) {
                Ok(report) if report.requeued == 0 && report.exhausted == 0 => {}
                Ok(report) => tracing::info!(
                    requeued = report.requeued,
                    exhausted = report.exhausted,
                    "reaped stale tasks"
                ),
                Err(e) => tracing::error!("reap failed: {e}"),
            }
        }
    })
}

/// Serve the read-only status API until the server stops.
pub async fn serve(store: Arc<EvalStore>, config: &ServiceConfig) -> std::io::Result<()> {
    let state = AppState {
        store,
        running_task_timeout_secs: config.running_task_timeout_secs,
        max_task_attempts: config.max_task_attempts,
    };

    let mut server = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(web::Data::new(state.clone()))
            .wrap(cors)
            .wrap(middleware::Logger::default())
            .configure(routes)
    })
    .keep_alive(Duration::from_secs(config.http_keep_alive_secs));
    if let Some(workers) = config.http_workers {
        server = server.workers(workers);
    }

    server.bind(&config.bind_addr)?.run().await
}
