use actix_web::{web, HttpRequest, HttpResponse};
use serde::Deserialize;
use std::str::FromStr;

use super::{error_response, scope_for_listing, tenant_from_request};
use crate::config::clamp_limit;
use crate::error::OrchestratorError;
use crate::models::{AgentType, SubAgentListResponse, SubAgentStatus};
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct ListSubAgentsQuery {
    pub status: Option<String>,
    pub agent_type: Option<String>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
    pub owner: Option<String>,
}

/// Configure sub-agent registry routes (read-only)
pub fn config(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api/subagents")
            .route("", web::get().to(list_sub_agents))
            .route("/{sub_agent_id}", web::get().to(get_sub_agent)),
    );
}

fn parse_filter<T: FromStr>(field: &str, raw: Option<&str>) -> Result<Option<T>, HttpResponse> {
    match raw.map(str::trim).filter(|s| !s.is_empty()) {
        None => Ok(None),
        Some(value) => value.parse().map(Some).map_err(|_| {
            error_response(&OrchestratorError::InvalidRequest(format!(
                "Unknown {} '{}'",
                field, value
            )))
        }),
    }
}

async fn list_sub_agents(
    state: web::Data<AppState>,
    req: HttpRequest,
    query: web::Query<ListSubAgentsQuery>,
) -> HttpResponse {
    let scope = match scope_for_listing(&req, query.owner.as_deref()) {
        Ok(scope) => scope,
        Err(resp) => return resp,
    };
    let status = match parse_filter::<SubAgentStatus>("status", query.status.as_deref()) {
        Ok(status) => status,
        Err(resp) => return resp,
    };
    let agent_type = match parse_filter::<AgentType>("agent_type", query.agent_type.as_deref()) {
        Ok(agent_type) => agent_type,
        Err(resp) => return resp,
    };

    let limit = clamp_limit(query.limit);
    let offset = query.offset.unwrap_or(0);
    match state.db.list_sub_agents(&scope, status, agent_type, limit, offset) {
        Ok(sub_agents) => HttpResponse::Ok().json(SubAgentListResponse {
            success: true,
            sub_agents,
            limit,
            offset,
            error: None,
        }),
        Err(e) => error_response(&e),
    }
}

async fn get_sub_agent(state: web::Data<AppState>, req: HttpRequest, path: web::Path<String>) -> HttpResponse {
    let scope = match tenant_from_request(&req) {
        Ok(scope) => scope,
        Err(resp) => return resp,
    };
    let sub_agent_id = path.into_inner();

    match state.db.get_sub_agent(&scope, &sub_agent_id) {
        Ok(Some(agent)) => HttpResponse::Ok().json(serde_json::json!({
            "success": true,
            "sub_agent": agent
        })),
        Ok(None) => error_response(&OrchestratorError::NotFound(format!("Sub-agent {}", sub_agent_id))),
        Err(e) => error_response(&e),
    }
}
