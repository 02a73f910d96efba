use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{ConnectInfo, FromRequestParts, Path, State},
    http::{header, request::Parts, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use relay_core::api::{
    routes, CreateTaskRequest, ErrorBody, HeartbeatRequest, HeartbeatResponse, ProvisionAgentRequest,
    ProvisionAgentResponse, ReportRequest, ReportResponse, TargetView, TaskView, UpsertTargetRequest,
};
use relay_core::model::AgentIdentity;
use tower_http::trace::TraceLayer;

use crate::service::{RelayService, ServiceError};
use crate::store::{token_hash, Contact};

#[derive(Clone)]
pub struct AppState {
    svc: Arc<RelayService>,
    /// SHA-256 of the configured admin token; `None` disables the admin API.
    admin_token_hash: Option<Arc<str>>,
}

impl AppState {
    pub fn new(svc: Arc<RelayService>, admin_token: Option<String>) -> Self {
        Self {
            svc,
            admin_token_hash: admin_token.map(|t| Arc::from(token_hash(&t))),
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route(routes::HEALTHZ, get(healthz))
        .route(routes::AGENT_HEARTBEAT, post(agent_heartbeat))
        .route(routes::AGENT_POLL, post(agent_poll))
        .route(routes::AGENT_REPORT, post(agent_report))
        .route(routes::ADMIN_TASKS, post(admin_create_task))
        .route(routes::ADMIN_TASK, get(admin_get_task))
        .route(routes::ADMIN_TARGET, get(admin_get_target).put(admin_put_target))
        .route(routes::ADMIN_AGENTS, post(admin_provision_agent))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

async fn agent_heartbeat(
    State(st): State<AppState>,
    AuthenticatedAgent(agent): AuthenticatedAgent,
    Json(req): Json<HeartbeatRequest>,
) -> Result<Json<HeartbeatResponse>, ApiError> {
    Ok(Json(st.svc.heartbeat(&agent, req.version).await?))
}

async fn agent_poll(
    State(st): State<AppState>,
    AuthenticatedAgent(agent): AuthenticatedAgent,
) -> Result<Response, ApiError> {
    match st.svc.poll(&agent).await? {
        Some(assignment) => Ok(Json(assignment).into_response()),
        None => Ok(StatusCode::NO_CONTENT.into_response()),
    }
}

async fn agent_report(
    State(st): State<AppState>,
    AuthenticatedAgent(agent): AuthenticatedAgent,
    Path(task_id): Path<String>,
    Json(req): Json<ReportRequest>,
) -> Result<Json<ReportResponse>, ApiError> {
    Ok(Json(st.svc.report(&agent, &task_id, req).await?))
}

async fn admin_create_task(
    State(st): State<AppState>,
    _admin: AdminAuth,
    Json(req): Json<CreateTaskRequest>,
) -> Result<(StatusCode, Json<TaskView>), ApiError> {
    Ok((StatusCode::CREATED, Json(st.svc.create_task(req).await?)))
}

async fn admin_get_task(
    State(st): State<AppState>,
    _admin: AdminAuth,
    Path(task_id): Path<String>,
) -> Result<Json<TaskView>, ApiError> {
    Ok(Json(st.svc.task(&task_id).await?))
}

async fn admin_put_target(
    State(st): State<AppState>,
    _admin: AdminAuth,
    Path(target_id): Path<String>,
    Json(req): Json<UpsertTargetRequest>,
) -> Result<Json<TargetView>, ApiError> {
    Ok(Json(st.svc.upsert_target(&target_id, req).await?))
}

async fn admin_get_target(
    State(st): State<AppState>,
    _admin: AdminAuth,
    Path(target_id): Path<String>,
) -> Result<Json<TargetView>, ApiError> {
    Ok(Json(st.svc.target(&target_id).await?))
}

async fn admin_provision_agent(
    State(st): State<AppState>,
    _admin: AdminAuth,
    Json(req): Json<ProvisionAgentRequest>,
) -> Result<(StatusCode, Json<ProvisionAgentResponse>), ApiError> {
    Ok((StatusCode::CREATED, Json(st.svc.provision_agent(req.name).await?)))
}

/// An agent resolved from its bearer token. Every extraction counts as
/// contact and refreshes the agent's liveness fields.
pub struct AuthenticatedAgent(pub AgentIdentity);

impl FromRequestParts<AppState> for AuthenticatedAgent {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let token = bearer_token(&parts.headers).ok_or(ApiError::Unauthorized)?;
        let contact = Contact {
            ip: client_ip(parts),
            version: None,
        };
        let agent = state
            .svc
            .authenticate(token, &contact)
            .await?
            .ok_or(ApiError::Unauthorized)?;
        Ok(Self(agent))
    }
}

/// Guard for the admin routes: a static bearer token from configuration.
pub struct AdminAuth;

impl FromRequestParts<AppState> for AdminAuth {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let Some(expected) = state.admin_token_hash.as_deref() else {
            return Err(ApiError::Forbidden("admin API is disabled".into()));
        };
        let token = bearer_token(&parts.headers).ok_or(ApiError::Unauthorized)?;
        // Digests only; the raw token is never compared.
        if token_hash(token) != expected {
            return Err(ApiError::Forbidden("invalid admin token".into()));
        }
        Ok(Self)
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

/// First `X-Forwarded-For` hop, else the socket peer.
fn client_ip(parts: &Parts) -> Option<String> {
    let forwarded = parts
        .headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty());
    if let Some(ip) = forwarded {
        return Some(ip.to_string());
    }
    parts
        .extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
}

#[derive(Debug)]
pub enum ApiError {
    Unauthorized,
    Forbidden(String),
    Service(ServiceError),
}

impl From<ServiceError> for ApiError {
    fn from(value: ServiceError) -> Self {
        Self::Service(value)
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(value: anyhow::Error) -> Self {
        Self::Service(ServiceError::Internal(value))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, "missing or invalid bearer token".to_string()),
            ApiError::Forbidden(msg) => (StatusCode::FORBIDDEN, msg),
            ApiError::Service(e) => {
                let status = match &e {
                    ServiceError::NotFound(_) => StatusCode::NOT_FOUND,
                    ServiceError::NotOwner => StatusCode::FORBIDDEN,
                    ServiceError::NotClaimed(_) => StatusCode::CONFLICT,
                    ServiceError::Invalid(_) => StatusCode::BAD_REQUEST,
                    ServiceError::Internal(err) => {
                        tracing::error!(error = ?err, "request failed");
                        StatusCode::INTERNAL_SERVER_ERROR
                    }
                };
                (status, e.to_string())
            }
        };
        (status, Json(ErrorBody { error: message })).into_response()
    }
}
