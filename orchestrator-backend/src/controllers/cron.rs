use actix_web::{web, HttpRequest, HttpResponse};
use chrono::Utc;
use serde::Deserialize;

use super::{error_response, scheduler_disabled, scope_for_listing, tenant_from_request, PageQuery};
use crate::config::clamp_limit;
use crate::db::{Database, TenantScope};
use crate::error::Result;
use crate::models::{
    CreateCronJobRequest, CronExecutionListResponse, CronJob, CronJobResponse, CronJobWithHistory,
    UpdateCronJobRequest,
};
use crate::scheduler::cron_eval;
use crate::scheduler::SchedulerStatus;
use crate::AppState;

/// Executions attached to a single job view unless `?history=` says otherwise
const DEFAULT_JOB_HISTORY: u32 = 10;

#[derive(Debug, Deserialize)]
pub struct ListJobsQuery {
    pub limit: Option<u32>,
    pub offset: Option<u32>,
    pub owner: Option<String>,
    /// Attach the last N executions to every job
    pub history: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct JobQuery {
    pub history: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct ListExecutionsQuery {
    pub job_id: Option<i64>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
    pub owner: Option<String>,
}

/// Configure cron routes
pub fn config(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api/cron")
            .route("/jobs", web::get().to(list_jobs))
            .route("/jobs", web::post().to(create_job))
            .route("/jobs/{id}", web::get().to(get_job))
            .route("/jobs/{id}", web::put().to(update_job))
            .route("/jobs/{id}", web::delete().to(delete_job))
            .route("/jobs/{id}/run", web::post().to(run_job))
            .route("/jobs/{id}/cancel", web::post().to(cancel_job_run))
            .route("/jobs/{id}/pause", web::post().to(pause_job))
            .route("/jobs/{id}/resume", web::post().to(resume_job))
            .route("/jobs/{id}/executions", web::get().to(job_executions))
            .route("/executions", web::get().to(list_executions))
            .route("/status", web::get().to(get_status)),
    );
}

/// Decorate a job with its human-readable schedule and recent executions
fn with_history(db: &Database, scope: &TenantScope, job: CronJob, history: u32) -> Result<CronJobWithHistory> {
    let history = if history > 0 {
        Some(db.list_cron_executions(scope, Some(job.id), clamp_limit(Some(history)), 0)?)
    } else {
        None
    };
    Ok(CronJobWithHistory {
        schedule_description: Some(cron_eval::describe(&job.cron_expression)),
        history,
        job,
    })
}

fn job_response(job: CronJobWithHistory) -> CronJobResponse {
    CronJobResponse {
        success: true,
        job: Some(job),
        jobs: None,
        error: None,
    }
}

/// List cron jobs, optionally with their recent executions
async fn list_jobs(state: web::Data<AppState>, req: HttpRequest, query: web::Query<ListJobsQuery>) -> HttpResponse {
    let scope = match scope_for_listing(&req, query.owner.as_deref()) {
        Ok(scope) => scope,
        Err(resp) => return resp,
    };

    let limit = clamp_limit(query.limit);
    let history = query.history.unwrap_or(0);
    let jobs = state
        .db
        .list_cron_jobs(&scope, limit, query.offset.unwrap_or(0))
        .and_then(|jobs| {
            jobs.into_iter()
                .map(|job| with_history(&state.db, &scope, job, history))
                .collect::<Result<Vec<_>>>()
        });

    match jobs {
        Ok(jobs) => HttpResponse::Ok().json(CronJobResponse {
            success: true,
            job: None,
            jobs: Some(jobs),
            error: None,
        }),
        Err(e) => error_response(&e),
    }
}

/// Create a new cron job
async fn create_job(
    state: web::Data<AppState>,
    req: HttpRequest,
    body: web::Json<CreateCronJobRequest>,
) -> HttpResponse {
    let scope = match tenant_from_request(&req) {
        Ok(scope) => scope,
        Err(resp) => return resp,
    };

    match state
        .db
        .create_cron_job(&scope, &body, state.config.job_defaults(), Utc::now())
        .and_then(|job| with_history(&state.db, &scope, job, 0))
    {
        Ok(job) => HttpResponse::Created().json(job_response(job)),
        Err(e) => error_response(&e),
    }
}

/// Get a cron job by ID
async fn get_job(
    state: web::Data<AppState>,
    req: HttpRequest,
    path: web::Path<i64>,
    query: web::Query<JobQuery>,
) -> HttpResponse {
    let scope = match tenant_from_request(&req) {
        Ok(scope) => scope,
        Err(resp) => return resp,
    };
    let id = path.into_inner();

    match state.db.get_cron_job(&scope, id) {
        Ok(Some(job)) => {
            match with_history(&state.db, &scope, job, query.history.unwrap_or(DEFAULT_JOB_HISTORY)) {
                Ok(job) => HttpResponse::Ok().json(job_response(job)),
                Err(e) => error_response(&e),
            }
        }
        Ok(None) => HttpResponse::NotFound().json(CronJobResponse {
            success: false,
            job: None,
            jobs: None,
            error: Some("Job not found".to_string()),
        }),
        Err(e) => error_response(&e),
    }
}

/// Update a cron job
async fn update_job(
    state: web::Data<AppState>,
    req: HttpRequest,
    path: web::Path<i64>,
    body: web::Json<UpdateCronJobRequest>,
) -> HttpResponse {
    let scope = match tenant_from_request(&req) {
        Ok(scope) => scope,
        Err(resp) => return resp,
    };

    match state
        .db
        .update_cron_job(&scope, path.into_inner(), &body, Utc::now())
        .and_then(|job| with_history(&state.db, &scope, job, 0))
    {
        Ok(job) => HttpResponse::Ok().json(job_response(job)),
        Err(e) => error_response(&e),
    }
}

/// Delete a cron job and its execution history
async fn delete_job(state: web::Data<AppState>, req: HttpRequest, path: web::Path<i64>) -> HttpResponse {
    let scope = match tenant_from_request(&req) {
        Ok(scope) => scope,
        Err(resp) => return resp,
    };

    match state.db.delete_cron_job(&scope, path.into_inner()) {
        Ok(()) => HttpResponse::Ok().json(CronJobResponse {
            success: true,
            job: None,
            jobs: None,
            error: None,
        }),
        Err(e) => error_response(&e),
    }
}

/// Run a job immediately, outside its schedule
async fn run_job(state: web::Data<AppState>, req: HttpRequest, path: web::Path<i64>) -> HttpResponse {
    let scope = match tenant_from_request(&req) {
        Ok(scope) => scope,
        Err(resp) => return resp,
    };
    let Some(scheduler) = &state.scheduler else {
        return scheduler_disabled();
    };

    match scheduler.run_job_now(&scope, path.into_inner()) {
        Ok(execution) => HttpResponse::Accepted().json(serde_json::json!({
            "success": true,
            "execution": execution
        })),
        Err(e) => error_response(&e),
    }
}

/// Signal the in-flight run of a job to stop
async fn cancel_job_run(state: web::Data<AppState>, req: HttpRequest, path: web::Path<i64>) -> HttpResponse {
    let scope = match tenant_from_request(&req) {
        Ok(scope) => scope,
        Err(resp) => return resp,
    };
    let Some(scheduler) = &state.scheduler else {
        return scheduler_disabled();
    };

    match scheduler.cancel_job_run(&scope, path.into_inner()) {
        Ok(canceled) => HttpResponse::Ok().json(serde_json::json!({
            "success": true,
            "canceled": canceled
        })),
        Err(e) => error_response(&e),
    }
}

async fn set_enabled(state: web::Data<AppState>, req: HttpRequest, id: i64, enabled: bool) -> HttpResponse {
    let scope = match tenant_from_request(&req) {
        Ok(scope) => scope,
        Err(resp) => return resp,
    };

    match state
        .db
        .set_cron_job_enabled(&scope, id, enabled, Utc::now())
        .and_then(|job| with_history(&state.db, &scope, job, 0))
    {
        Ok(job) => HttpResponse::Ok().json(job_response(job)),
        Err(e) => error_response(&e),
    }
}

/// Pause a job: it stops firing until resumed
async fn pause_job(state: web::Data<AppState>, req: HttpRequest, path: web::Path<i64>) -> HttpResponse {
    set_enabled(state, req, path.into_inner(), false).await
}

/// Resume a job: the next fire time is computed from now
async fn resume_job(state: web::Data<AppState>, req: HttpRequest, path: web::Path<i64>) -> HttpResponse {
    set_enabled(state, req, path.into_inner(), true).await
}

fn executions_response(
    db: &Database,
    scope: &TenantScope,
    job_id: Option<i64>,
    limit: u32,
    offset: u32,
) -> HttpResponse {
    match db.list_cron_executions(scope, job_id, limit, offset) {
        Ok(executions) => HttpResponse::Ok().json(CronExecutionListResponse {
            success: true,
            executions,
            limit,
            offset,
            error: None,
        }),
        Err(e) => error_response(&e),
    }
}

/// Execution ledger across jobs
async fn list_executions(
    state: web::Data<AppState>,
    req: HttpRequest,
    query: web::Query<ListExecutionsQuery>,
) -> HttpResponse {
    let scope = match scope_for_listing(&req, query.owner.as_deref()) {
        Ok(scope) => scope,
        Err(resp) => return resp,
    };
    executions_response(
        &state.db,
        &scope,
        query.job_id,
        clamp_limit(query.limit),
        query.offset.unwrap_or(0),
    )
}

/// Execution ledger for one job
async fn job_executions(
    state: web::Data<AppState>,
    req: HttpRequest,
    path: web::Path<i64>,
    query: web::Query<PageQuery>,
) -> HttpResponse {
    let scope = match scope_for_listing(&req, query.owner.as_deref()) {
        Ok(scope) => scope,
        Err(resp) => return resp,
    };
    let id = path.into_inner();

    match state.db.get_cron_job(&scope, id) {
        Ok(Some(_)) => executions_response(&state.db, &scope, Some(id), query.limit(), query.offset()),
        Ok(None) => HttpResponse::NotFound().json(CronExecutionListResponse {
            success: false,
            executions: Vec::new(),
            limit: query.limit(),
            offset: query.offset(),
            error: Some("Job not found".to_string()),
        }),
        Err(e) => error_response(&e),
    }
}

/// Engine snapshot
async fn get_status(state: web::Data<AppState>, req: HttpRequest) -> HttpResponse {
    let scope = match tenant_from_request(&req) {
        Ok(scope) => scope,
        Err(resp) => return resp,
    };

    let status = match &state.scheduler {
        Some(scheduler) => scheduler.status(&scope),
        None => SchedulerStatus::offline(&state.db, &scope, &state.config.scheduler_config()),
    };
    match status {
        Ok(status) => HttpResponse::Ok().json(serde_json::json!({
            "success": true,
            "status": status
        })),
        Err(e) => error_response(&e),
    }
}
