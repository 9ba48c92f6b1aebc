//! API 路由

use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    middleware::from_fn_with_state,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use chrono::{DateTime, Utc};
use mcpgw_common::SessionId;
use mcpgw_domain_core::UserContext;
use mcpgw_telemetry::HealthStatus;
use serde::Serialize;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::audit::{AuditEventKind, SecurityAuditEvent, audit_routes};
use crate::context::RequestContext;
use crate::middleware::{AuthSession, audit_middleware, authenticate, ensure_fresh_token};
use crate::rate_limit::rate_limit_middleware;
use crate::state::AppState;
use crate::suspicious::suspicious_activity_middleware;

/// 组装完整的网关路由
pub fn app(state: AppState) -> Router {
    // 后添加的 layer 在外层：rate limit → authenticate → ensure_fresh_token → handler
    // 限流在认证之前，未认证的请求按 IP 计数，不会触发会话存储查询
    let protected = Router::new()
        .route("/session", get(current_session))
        .route("/auth/logout", post(logout))
        .nest("/audit", audit_routes())
        .layer(from_fn_with_state(state.clone(), ensure_fresh_token))
        .layer(from_fn_with_state(state.clone(), authenticate))
        .layer(from_fn_with_state(state.clone(), rate_limit_middleware));

    Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(render_metrics))
        .nest("/api", protected)
        .layer(from_fn_with_state(state.clone(), suspicious_activity_middleware))
        .layer(from_fn_with_state(state.clone(), audit_middleware))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    #[serde(flatten)]
    pub health: HealthStatus,
}

/// 健康检查：会话存储可达性与身份提供方断路器状态
async fn health_check(State(state): State<AppState>) -> Response {
    let mut health = HealthStatus::new();

    match state.store.session_count().await {
        Ok(count) => health.add_check("session_store", true, Some(format!("{} sessions", count))),
        Err(e) => health.add_check("session_store", false, Some(state.masker.mask(e.message()))),
    }

    if let Some(breaker) = &state.identity_breaker {
        let metrics = breaker.metrics();
        health.add_check(
            "identity_provider",
            !breaker.is_open(),
            Some(format!("circuit {}", metrics.state)),
        );
    }

    let status =
        StatusCode::from_u16(health.status_code()).unwrap_or(StatusCode::SERVICE_UNAVAILABLE);
    let body = HealthResponse {
        status: if health.healthy { "healthy" } else { "unhealthy" },
        version: env!("CARGO_PKG_VERSION"),
        health,
    };
    (status, Json(body)).into_response()
}

async fn render_metrics(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(handle) => handle.render().into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionResponse {
    pub session_id: SessionId,
    pub user: UserContext,
    pub token_expires_at: DateTime<Utc>,
    pub scopes: Vec<String>,
    pub session_expires_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
    pub access_count: u64,
}

/// 当前会话信息
async fn current_session(AuthSession(auth): AuthSession) -> Json<SessionResponse> {
    let session = auth.session;
    Json(SessionResponse {
        session_id: session.session_id,
        user: session.user_context,
        token_expires_at: session.token_metadata.expires_at,
        scopes: session.token_metadata.scopes,
        session_expires_at: session.expires_at,
        last_accessed_at: session.security.last_accessed_at,
        access_count: session.security.access_count,
    })
}

/// 注销：吊销当前会话令牌直到其自身过期，并删除会话
async fn logout(
    State(state): State<AppState>,
    ctx: RequestContext,
    AuthSession(auth): AuthSession,
) -> Response {
    let session = &auth.session;
    let expires_at = auth.claims.expires_at().unwrap_or(session.expires_at);
    state
        .validator
        .blacklist(&session.session_token, "logout", expires_at);

    if let Err(e) = state.store.delete(&session.session_id).await {
        return state.reject(e);
    }

    info!(user_id = %session.user_id(), session_id = %session.session_id, "Session logged out");
    state.audit.record(
        SecurityAuditEvent::new(AuditEventKind::TokenRevoked, &ctx)
            .with_user(Some(session.user_id().clone()))
            .with_detail("sessionId", session.session_id.to_string())
            .with_detail("reason", "logout"),
    );
    StatusCode::NO_CONTENT.into_response()
}
