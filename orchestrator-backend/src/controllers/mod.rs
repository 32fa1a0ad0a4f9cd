pub mod cron;
pub mod health;
pub mod sub_agents;
pub mod tasks;

use actix_web::http::StatusCode;
use actix_web::{HttpRequest, HttpResponse};
use serde::Deserialize;

use crate::db::TenantScope;
use crate::error::OrchestratorError;

/// Caller identity, set by the upstream auth layer
pub const USER_ID_HEADER: &str = "X-User-Id";
/// `true` grants the admin "all tenants" view
pub const CAN_VIEW_ALL_HEADER: &str = "X-Can-View-All";

/// Paging and owner filter shared by the listing endpoints
#[derive(Debug, Default, Deserialize)]
pub struct PageQuery {
    pub limit: Option<u32>,
    pub offset: Option<u32>,
    /// Restrict the listing to one owner (other owners need `X-Can-View-All`)
    pub owner: Option<String>,
}

impl PageQuery {
    pub fn limit(&self) -> u32 {
        crate::config::clamp_limit(self.limit)
    }

    pub fn offset(&self) -> u32 {
        self.offset.unwrap_or(0)
    }
}

/// Shared tenant resolution for controller handlers.
pub fn tenant_from_request(req: &HttpRequest) -> Result<TenantScope, HttpResponse> {
    let user_id = req
        .headers()
        .get(USER_ID_HEADER)
        .and_then(|h| h.to_str().ok())
        .map(str::trim)
        .unwrap_or("");
    if user_id.is_empty() {
        return Err(HttpResponse::Unauthorized().json(serde_json::json!({
            "success": false,
            "error": "No caller identity provided"
        })));
    }

    let can_view_all = req
        .headers()
        .get(CAN_VIEW_ALL_HEADER)
        .and_then(|h| h.to_str().ok())
        .map(|v| matches!(v.trim().to_lowercase().as_str(), "1" | "true" | "yes"))
        .unwrap_or(false);

    TenantScope::new(user_id, can_view_all).map_err(|e| error_response(&e))
}

/// Tenant scope narrowed by an optional `?owner=` filter
pub fn scope_for_listing(req: &HttpRequest, owner: Option<&str>) -> Result<TenantScope, HttpResponse> {
    let scope = tenant_from_request(req)?;
    scope.narrow(owner).map_err(|e| error_response(&e))
}

pub fn error_status(e: &OrchestratorError) -> StatusCode {
    match e {
        OrchestratorError::InvalidScheduleExpression(_) | OrchestratorError::InvalidRequest(_) => {
            StatusCode::BAD_REQUEST
        }
        OrchestratorError::TenantViolation { .. } => StatusCode::FORBIDDEN,
        OrchestratorError::NotFound(_) => StatusCode::NOT_FOUND,
        OrchestratorError::ClaimConflict(_) | OrchestratorError::Conflict(_) => StatusCode::CONFLICT,
        OrchestratorError::ExecutionTimeout(_)
        | OrchestratorError::ExternalLoop(_)
        | OrchestratorError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// `{ success: false, error }` with the status code for `e`
pub fn error_response(e: &OrchestratorError) -> HttpResponse {
    let status = error_status(e);
    if status.is_server_error() {
        log::error!("Request failed: {}", e);
    }
    HttpResponse::build(status).json(serde_json::json!({
        "success": false,
        "error": e.to_string()
    }))
}

pub fn scheduler_disabled() -> HttpResponse {
    HttpResponse::ServiceUnavailable().json(serde_json::json!({
        "success": false,
        "error": "Scheduler is disabled (no agent executor configured)"
    }))
}
