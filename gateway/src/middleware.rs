//! 安全中间件
//!
//! 管道顺序（由外到内）：审计 → 可疑活动检测 → 限流 → 认证 → 令牌刷新 → 处理函数。

use axum::{
    extract::{ConnectInfo, FromRequestParts, Request, State},
    http::{HeaderMap, HeaderValue, header, request::Parts},
    middleware::Next,
    response::Response,
};
use chrono::{Duration, Utc};
use mcpgw_auth_core::SessionClaims;
use mcpgw_common::UserId;
use mcpgw_domain_core::{SessionData, SessionPatch};
use mcpgw_errors::{AppError, AppResult, ErrorCategory, SecretMasker};
use mcpgw_ports::IdentityProvider;
use std::net::SocketAddr;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::audit::{AuditEventKind, SecurityAuditEvent};
use crate::context::{AuthenticatedUser, CORRELATION_ID_HEADER, RequestContext};
use crate::error::render_error;
use crate::state::AppState;

/// 访问令牌在该时间内过期时触发刷新
pub const REFRESH_HORIZON_SECS: i64 = 5 * 60;

/// 刷新失败但请求继续时，通过该响应头告知调用方
pub const TOKEN_REFRESH_ERROR_HEADER: &str = "x-token-refresh-error";

/// 已认证的会话，由 [`authenticate`] 写入请求扩展
#[derive(Debug, Clone)]
pub struct AuthenticatedSession {
    pub session: SessionData,
    pub claims: SessionClaims,
}

/// 已认证会话提取器
///
/// 应该在 authenticate 之后使用
pub struct AuthSession(pub AuthenticatedSession);

impl<S> FromRequestParts<S> for AuthSession
where
    S: Send + Sync,
{
    type Rejection = Response;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<AuthenticatedSession>()
            .cloned()
            .map(AuthSession)
            .ok_or_else(|| {
                render_error(
                    &AppError::authentication("Missing authenticated session"),
                    &SecretMasker::new(),
                )
            })
    }
}

pub(crate) fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    value
        .strip_prefix("Bearer ")
        .or_else(|| value.strip_prefix("bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

fn reject_unauthenticated(
    state: &AppState,
    ctx: &RequestContext,
    user_id: Option<UserId>,
    reason: &str,
    err: AppError,
) -> Response {
    warn!(
        reason,
        ip = %ctx.ip_address,
        correlation_id = %ctx.correlation_id,
        "Authentication failed"
    );
    state.audit.record(
        SecurityAuditEvent::new(AuditEventKind::AuthenticationFailure, ctx)
            .with_user(user_id)
            .with_detail("reason", reason),
    );
    state.reject(err)
}

/// 审计中间件（最外层）
///
/// 生成关联 ID，并为每个完成的请求记录一条事件，无论结果如何。
pub async fn audit_middleware(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    let started = Instant::now();
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let ctx = RequestContext::from_parts(request.headers(), peer);
    request.extensions_mut().insert(ctx.clone());

    let method = request.method().to_string();
    let path = request.uri().path().to_string();

    let mut response = next.run(request).await;

    let status = response.status().as_u16();
    let latency_ms = started.elapsed().as_millis() as u64;
    let user_id = response
        .extensions()
        .get::<AuthenticatedUser>()
        .map(|u| u.0.clone());

    state.audit.record(
        SecurityAuditEvent::new(AuditEventKind::RequestCompleted, &ctx)
            .with_user(user_id)
            .with_detail("method", method)
            .with_detail("path", path)
            .with_detail("status", status)
            .with_detail("latencyMs", latency_ms),
    );
    metrics::histogram!("http_request_duration_ms").record(latency_ms as f64);

    if let Ok(value) = HeaderValue::from_str(&ctx.correlation_id.to_string()) {
        response.headers_mut().insert(CORRELATION_ID_HEADER, value);
    }
    response
}

/// 认证中间件
///
/// 校验会话令牌，加载会话并检查令牌与会话的绑定，随后记录一次访问。
pub async fn authenticate(
    State(state): State<AppState>,
    ctx: RequestContext,
    mut request: Request,
    next: Next,
) -> Response {
    let Some(token) = bearer_token(request.headers()).map(str::to_string) else {
        return reject_unauthenticated(
            &state,
            &ctx,
            None,
            "missing_credentials",
            AppError::authentication("Missing session credentials"),
        );
    };

    // 限流阶段已校验过的 claims 直接复用
    let validated = request.extensions_mut().remove::<SessionClaims>();
    let claims = match validated.map_or_else(|| state.validator.validate(&token), Ok) {
        Ok(claims) => claims,
        Err(e) => {
            let reason = e.code().unwrap_or("invalid_token").to_string();
            return reject_unauthenticated(&state, &ctx, None, &reason, e);
        }
    };

    let session_id = match claims.session_id() {
        Ok(id) => id,
        Err(e) => return reject_unauthenticated(&state, &ctx, Some(claims.user_id()), "invalid_session_id", e),
    };

    let mut session = match state.store.get(&session_id).await {
        Ok(Some(session)) => session,
        Ok(None) => {
            return reject_unauthenticated(
                &state,
                &ctx,
                Some(claims.user_id()),
                "session_not_found",
                AppError::authentication("Session is invalid or has expired"),
            );
        }
        Err(e) => {
            error!(session_id = %session_id, error = %state.masker.mask(&e.to_string()), "Failed to load session");
            return state.reject(e);
        }
    };

    if session.session_token != token
        || session.session_id != session_id
        || session.user_context.user_id.as_str() != claims.sub
    {
        state.audit.record(
            SecurityAuditEvent::new(AuditEventKind::SessionTokenMismatch, &ctx)
                .with_user(Some(session.user_id().clone()))
                .with_detail("sessionId", session_id.to_string())
                .with_detail("claimedUser", claims.sub.clone()),
        );
        return state.reject(
            AppError::authentication("Session token does not match the session")
                .with_code("session_token_mismatch"),
        );
    }

    // 计数在存储内部递增，并发请求不会丢失访问次数
    let now = Utc::now();
    match state.store.update(&session_id, SessionPatch::touch(now)).await {
        Ok(()) => {
            session.security.last_accessed_at = now;
            session.security.access_count += 1;
        }
        Err(e) if e.category() == ErrorCategory::NotFound => {
            return reject_unauthenticated(
                &state,
                &ctx,
                Some(claims.user_id()),
                "session_not_found",
                AppError::authentication("Session is invalid or has expired"),
            );
        }
        Err(e) => warn!(session_id = %session_id, error = %e, "Failed to record session access"),
    }

    let user_id = session.user_id().clone();
    debug!(user_id = %user_id, session_id = %session_id, "Session authenticated");
    request
        .extensions_mut()
        .insert(AuthenticatedSession { session, claims });

    let mut response = next.run(request).await;
    response.extensions_mut().insert(AuthenticatedUser(user_id));
    response
}

/// 刷新令牌并持久化新的令牌元数据，返回更新后的会话
async fn refresh_session_tokens(
    state: &AppState,
    session: &SessionData,
    refresh_token: &str,
    identity: &dyn IdentityProvider,
) -> AppResult<SessionData> {
    let grant = identity.refresh_token(refresh_token).await?;
    let scopes = grant.scopes();
    let patch = SessionPatch::refreshed_tokens(
        grant.access_token,
        grant.refresh_token,
        Utc::now() + Duration::seconds(grant.expires_in),
        scopes,
    );

    let mut updated = session.clone();
    patch.clone().apply(&mut updated)?;
    state.store.update(&session.session_id, patch).await?;
    Ok(updated)
}

/// 令牌刷新中间件
///
/// 访问令牌即将过期且存在刷新令牌时，经身份提供方刷新后再继续。
/// 令牌已过期且刷新失败时返回 401；令牌仍有效时刷新失败不阻断请求，
/// 失败记录审计事件并通过响应头返回给调用方。
pub async fn ensure_fresh_token(
    State(state): State<AppState>,
    ctx: RequestContext,
    mut request: Request,
    next: Next,
) -> Response {
    let Some(auth) = request.extensions().get::<AuthenticatedSession>().cloned() else {
        return state.reject(AppError::authentication("Missing authenticated session"));
    };

    let now = Utc::now();
    let tokens = &auth.session.token_metadata;
    if !tokens.expires_within(Duration::seconds(REFRESH_HORIZON_SECS), now) {
        return next.run(request).await;
    }

    let expired = tokens.is_expired_at(now);
    let user_id = auth.session.user_id().clone();
    let refresh_token = tokens.refresh_token.as_deref().filter(|_| tokens.can_refresh());

    let (Some(refresh_token), Some(identity)) = (refresh_token, state.identity.clone()) else {
        if !expired {
            return next.run(request).await;
        }
        state.audit.record(
            SecurityAuditEvent::new(AuditEventKind::TokenRefreshFailed, &ctx)
                .with_user(Some(user_id))
                .with_detail("reason", "refresh_unavailable")
                .with_detail("accessTokenExpired", true),
        );
        return state.reject(
            AppError::authentication("Access token has expired").with_code("token_expired"),
        );
    };

    match refresh_session_tokens(&state, &auth.session, refresh_token, identity.as_ref()).await {
        Ok(updated) => {
            info!(user_id = %user_id, session_id = %updated.session_id, "Access token refreshed");
            state.audit.record(
                SecurityAuditEvent::new(AuditEventKind::TokenRefreshed, &ctx)
                    .with_user(Some(user_id))
                    .with_detail("sessionId", updated.session_id.to_string())
                    .with_detail("expiresAt", updated.token_metadata.expires_at.to_rfc3339()),
            );
            if let Some(current) = request.extensions_mut().get_mut::<AuthenticatedSession>() {
                current.session = updated;
            }
            next.run(request).await
        }
        Err(err) => {
            warn!(
                user_id = %user_id,
                category = %err.category(),
                expired,
                "Access token refresh failed"
            );
            state.audit.record(
                SecurityAuditEvent::new(AuditEventKind::TokenRefreshFailed, &ctx)
                    .with_user(Some(user_id))
                    .with_detail("category", err.category().as_str())
                    .with_detail("code", err.code().unwrap_or_default().to_string())
                    .with_detail("message", state.masker.mask(err.message()))
                    .with_detail("accessTokenExpired", expired),
            );

            if expired {
                return state.reject(
                    AppError::authentication("Access token has expired and could not be refreshed")
                        .with_code("token_expired")
                        .with_metadata("refreshError", err.category().as_str()),
                );
            }

            let mut response = next.run(request).await;
            response.headers_mut().insert(
                TOKEN_REFRESH_ERROR_HEADER,
                HeaderValue::from_static(err.category().as_str()),
            );
            response
        }
    }
}
