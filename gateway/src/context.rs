//! 请求上下文
//!
//! 关联 ID 在请求进入时生成一次，之后所有中间件阶段共享。

use std::net::SocketAddr;

use axum::extract::{ConnectInfo, FromRequestParts};
use axum::http::{HeaderMap, header, request::Parts};
use mcpgw_common::{CorrelationId, UserId};

pub const CORRELATION_ID_HEADER: &str = "x-correlation-id";

/// 每个请求的上下文
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub correlation_id: CorrelationId,
    pub ip_address: String,
    pub user_agent: Option<String>,
}

impl RequestContext {
    pub fn from_parts(headers: &HeaderMap, peer: Option<SocketAddr>) -> Self {
        Self {
            correlation_id: CorrelationId::new(),
            ip_address: client_ip(headers, peer),
            user_agent: headers
                .get(header::USER_AGENT)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string),
        }
    }
}

impl<S> FromRequestParts<S> for RequestContext
where
    S: Send + Sync,
{
    type Rejection = std::convert::Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        if let Some(ctx) = parts.extensions.get::<RequestContext>() {
            return Ok(ctx.clone());
        }
        let peer = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| *addr);
        Ok(Self::from_parts(&parts.headers, peer))
    }
}

/// 已认证用户，写入响应扩展供外层审计读取
#[derive(Debug, Clone)]
pub struct AuthenticatedUser(pub UserId);

/// 客户端 IP：Forwarded / X-Forwarded-For / X-Real-IP，最后是连接地址
pub fn client_ip(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    let first_hop = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .map(str::trim)
            .filter(|s| !s.is_empty())
    };

    first_hop(header::FORWARDED.as_str())
        .and_then(|v| {
            v.split(';')
                .find_map(|part| part.trim().strip_prefix("for="))
                .map(|s| s.trim_matches('"'))
        })
        .or_else(|| first_hop("x-forwarded-for"))
        .or_else(|| first_hop("x-real-ip"))
        .map(str::to_string)
        .or_else(|| peer.map(|addr| addr.ip().to_string()))
        .unwrap_or_else(|| "unknown".to_string())
}
