use actix_web::{web, HttpRequest, HttpResponse};
use chrono::Utc;
use serde::Deserialize;
use std::str::FromStr;

use super::{error_response, scope_for_listing, tenant_from_request};
use crate::config::clamp_limit;
use crate::error::OrchestratorError;
use crate::models::{AgentTask, EnqueueTaskRequest, TaskResponse, TaskStatus};
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct ListTasksQuery {
    pub status: Option<String>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
    pub owner: Option<String>,
}

/// Configure task queue routes
pub fn config(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api/tasks")
            .route("", web::get().to(list_tasks))
            .route("", web::post().to(enqueue_task))
            .route("/{id}", web::get().to(get_task))
            .route("/{id}", web::delete().to(delete_task))
            .route("/{id}/cancel", web::post().to(cancel_task))
            .route("/{id}/children", web::get().to(list_children)),
    );
}

fn one(task: AgentTask) -> TaskResponse {
    TaskResponse {
        success: true,
        task: Some(task),
        tasks: None,
        error: None,
    }
}

fn many(tasks: Vec<AgentTask>) -> TaskResponse {
    TaskResponse {
        success: true,
        task: None,
        tasks: Some(tasks),
        error: None,
    }
}

async fn list_tasks(state: web::Data<AppState>, req: HttpRequest, query: web::Query<ListTasksQuery>) -> HttpResponse {
    let scope = match scope_for_listing(&req, query.owner.as_deref()) {
        Ok(scope) => scope,
        Err(resp) => return resp,
    };
    let status = match query.status.as_deref().map(TaskStatus::from_str).transpose() {
        Ok(status) => status,
        Err(_) => {
            return error_response(&OrchestratorError::InvalidRequest(format!(
                "Unknown task status '{}'",
                query.status.as_deref().unwrap_or_default()
            )))
        }
    };

    match state
        .db
        .list_tasks(&scope, status, clamp_limit(query.limit), query.offset.unwrap_or(0))
    {
        Ok(tasks) => HttpResponse::Ok().json(many(tasks)),
        Err(e) => error_response(&e),
    }
}

/// Enqueue a task. The queue picks it up on the next scheduler tick.
async fn enqueue_task(
    state: web::Data<AppState>,
    req: HttpRequest,
    body: web::Json<EnqueueTaskRequest>,
) -> HttpResponse {
    let scope = match tenant_from_request(&req) {
        Ok(scope) => scope,
        Err(resp) => return resp,
    };

    match state
        .db
        .enqueue_task(&scope, &body, state.config.task_default_timeout_ms, Utc::now())
    {
        Ok(task) => HttpResponse::Created().json(one(task)),
        Err(e) => error_response(&e),
    }
}

async fn get_task(state: web::Data<AppState>, req: HttpRequest, path: web::Path<i64>) -> HttpResponse {
    let scope = match tenant_from_request(&req) {
        Ok(scope) => scope,
        Err(resp) => return resp,
    };
    let id = path.into_inner();

    match state.db.get_task(&scope, id) {
        Ok(Some(task)) => HttpResponse::Ok().json(one(task)),
        Ok(None) => error_response(&OrchestratorError::NotFound(format!("Task {}", id))),
        Err(e) => error_response(&e),
    }
}

async fn delete_task(state: web::Data<AppState>, req: HttpRequest, path: web::Path<i64>) -> HttpResponse {
    let scope = match tenant_from_request(&req) {
        Ok(scope) => scope,
        Err(resp) => return resp,
    };

    match state.db.delete_task(&scope, path.into_inner()) {
        Ok(()) => HttpResponse::Ok().json(TaskResponse {
            success: true,
            task: None,
            tasks: None,
            error: None,
        }),
        Err(e) => error_response(&e),
    }
}

/// Cancel a queued or running task
async fn cancel_task(state: web::Data<AppState>, req: HttpRequest, path: web::Path<i64>) -> HttpResponse {
    let scope = match tenant_from_request(&req) {
        Ok(scope) => scope,
        Err(resp) => return resp,
    };
    let id = path.into_inner();

    // Without a scheduler nothing can be running, so storage is enough
    let result = match &state.scheduler {
        Some(scheduler) => scheduler.cancel_task(&scope, id),
        None => state.db.cancel_task(&scope, id, Utc::now()),
    };
    match result {
        Ok(task) => HttpResponse::Ok().json(one(task)),
        Err(e) => error_response(&e),
    }
}

async fn list_children(state: web::Data<AppState>, req: HttpRequest, path: web::Path<i64>) -> HttpResponse {
    let scope = match tenant_from_request(&req) {
        Ok(scope) => scope,
        Err(resp) => return resp,
    };
    let id = path.into_inner();

    match state.db.get_task(&scope, id) {
        Ok(Some(_)) => match state.db.children_of(&scope, id) {
            Ok(children) => HttpResponse::Ok().json(many(children)),
            Err(e) => error_response(&e),
        },
        Ok(None) => error_response(&OrchestratorError::NotFound(format!("Task {}", id))),
        Err(e) => error_response(&e),
    }
}
