use actix_web::{
    http::StatusCode,
    web::{Data, Path},
    HttpResponse, Responder,
};
use factory_mcts_core::ProgramId;

use crate::response::{json_error_with_code, store_error};
use crate::{AppState, HealthResponse, TaskId};

pub(crate) async fn health(state: Data<AppState>) -> impl Responder {
    let counts = match state.store.count_by_status() {
        Ok(counts) => counts,
        Err(e) => {
            tracing::error!("health check failed: {e}");
            return store_error();
        }
    };

    HttpResponse::Ok().json(HealthResponse {
        status: "healthy",
        service: "factory-eval-server",
        pending_tasks: counts.pending,
        running_tasks: counts.running,
        completed_tasks: counts.completed,
        failed_tasks: counts.failed,
        stored_tasks: counts.total,
        running_task_timeout_secs: state.running_task_timeout_secs,
        max_task_attempts: state.max_task_attempts,
    })
}

pub(crate) async fn get_task(state: Data<AppState>, path: Path<TaskId>) -> impl Responder {
    let task_id = path.into_inner();
    match state.store.get_task(task_id) {
        Ok(Some(task)) => HttpResponse::Ok().json(task),
        Ok(None) => json_error_with_code(
            StatusCode::NOT_FOUND,
            format!("task not found: {task_id}"),
            Some("task_not_found"),
        ),
        Err(e) => {
            tracing::error!(task_id, "get_task failed: {e}");
            store_error()
        }
    }
}

pub(crate) async fn get_program(state: Data<AppState>, path: Path<ProgramId>) -> impl Responder {
    let program_id = path.into_inner();
    match state.store.get_program(program_id) {
        Ok(Some(program)) => HttpResponse::Ok().json(program),
        Ok(None) => json_error_with_code(
            StatusCode::NOT_FOUND,
            format!("program not found: {program_id}"),
            Some("program_not_found"),
        ),
        Err(e) => {
            tracing::error!(program_id, "get_program failed: {e}");
            store_error()
        }
    }
}

pub(crate) async fn best_program(state: Data<AppState>, path: Path<i64>) -> impl Responder {
    let version = path.into_inner();
    match state.store.best_program(version) {
        Ok(Some(program)) => HttpResponse::Ok().json(program),
        Ok(None) => json_error_with_code(
            StatusCode::NOT_FOUND,
            format!("no evaluated program for version {version}"),
            Some("version_empty"),
        ),
        Err(e) => {
            tracing::error!(version, "best_program failed: {e}");
            store_error()
        }
    }
}
