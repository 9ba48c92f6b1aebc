//! 限流中间件

use axum::{
    extract::{Request, State},
    http::{HeaderValue, header},
    middleware::Next,
    response::Response,
};
use mcpgw_common::UserId;
use mcpgw_errors::AppError;
use tracing::{debug, warn};

use crate::audit::{AuditEventKind, SecurityAuditEvent};
use crate::context::RequestContext;
use crate::middleware::bearer_token;
use crate::rate_limit::types::RateLimitResult;
use crate::state::AppState;

/// 提取客户端标识符
///
/// - 会话令牌校验通过: `user:{user_id}`
/// - 其余请求（无令牌、无效或已吊销）: `ip:{ip}`
///
/// 校验通过的 claims 写入请求扩展，认证阶段直接复用。
fn extract_identifier(
    state: &AppState,
    req: &mut Request,
    ctx: &RequestContext,
) -> (String, Option<UserId>) {
    let claims = bearer_token(req.headers())
        .and_then(|token| state.validator.validate(token).ok());
    match claims {
        Some(claims) => {
            let user_id = claims.user_id();
            req.extensions_mut().insert(claims);
            (format!("user:{}", user_id), Some(user_id))
        }
        None => (format!("ip:{}", ctx.ip_address), None),
    }
}

/// 为响应添加限流相关头
fn add_rate_limit_headers(response: &mut Response, result: &RateLimitResult) {
    let headers = response.headers_mut();
    headers.insert("x-ratelimit-limit", HeaderValue::from(result.limit));
    headers.insert("x-ratelimit-remaining", HeaderValue::from(result.remaining));
    headers.insert("x-ratelimit-reset", HeaderValue::from(result.reset_at));
    if let Some(retry_after) = result.retry_after {
        headers.insert(header::RETRY_AFTER, HeaderValue::from(retry_after));
    }
}

/// Axum 中间件函数
pub async fn rate_limit_middleware(
    State(state): State<AppState>,
    ctx: RequestContext,
    mut request: Request,
    next: Next,
) -> Response {
    let (identifier, user_id) = extract_identifier(&state, &mut request, &ctx);
    let result = state.rate_limiter.check(&identifier);

    if !result.allowed {
        let retry_after = result.retry_after.unwrap_or(1);
        warn!(
            identifier = %identifier,
            endpoint = %request.uri().path(),
            method = %request.method(),
            violations = result.violation_count,
            "Rate limit exceeded"
        );
        metrics::counter!("rate_limit_rejections_total").increment(1);

        state.audit.record(
            SecurityAuditEvent::new(AuditEventKind::RateLimitExceeded, &ctx)
                .with_user(user_id)
                .with_detail("identifier", identifier)
                .with_detail("count", result.count)
                .with_detail("violationCount", result.violation_count)
                .with_detail("retryAfter", retry_after),
        );

        let mut response = state.reject(AppError::rate_limited(
            "Too many requests. Please try again later.",
            retry_after,
        ));
        add_rate_limit_headers(&mut response, &result);
        return response;
    }

    debug!(
        identifier = %identifier,
        count = result.count,
        remaining = result.remaining,
        "Request allowed"
    );

    let mut response = next.run(request).await;
    add_rate_limit_headers(&mut response, &result);
    response
}
