//! 安全审计
//!
//! 事件写入进程内环形缓冲（超过容量时丢弃最早的事件），
//! 同时以 `target: "audit"` 输出结构化日志。

use std::collections::VecDeque;

use axum::{
    Json, Router,
    extract::{Query, State},
    response::Response,
    routing::get,
};
use chrono::{DateTime, Utc};
use mcpgw_auth_core::require_role;
use mcpgw_common::{CorrelationId, UserId};
use mcpgw_domain_core::UserContext;
use mcpgw_errors::{AppError, AppResult};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{error, info, warn};

use crate::context::RequestContext;
use crate::middleware::AuthSession;
use crate::state::AppState;

/// 缓冲区默认容量
pub const DEFAULT_AUDIT_CAPACITY: usize = 10_000;

/// 查询默认返回条数
const DEFAULT_QUERY_LIMIT: usize = 100;

/// 审计事件类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventKind {
    RequestCompleted,
    AuthenticationFailure,
    SessionTokenMismatch,
    TokenRefreshed,
    TokenRefreshFailed,
    TokenRevoked,
    RateLimitExceeded,
    SuspiciousActivity,
    AuthorizationDenied,
}

impl AuditEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RequestCompleted => "request_completed",
            Self::AuthenticationFailure => "authentication_failure",
            Self::SessionTokenMismatch => "session_token_mismatch",
            Self::TokenRefreshed => "token_refreshed",
            Self::TokenRefreshFailed => "token_refresh_failed",
            Self::TokenRevoked => "token_revoked",
            Self::RateLimitExceeded => "rate_limit_exceeded",
            Self::SuspiciousActivity => "suspicious_activity",
            Self::AuthorizationDenied => "authorization_denied",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "request_completed" => Self::RequestCompleted,
            "authentication_failure" => Self::AuthenticationFailure,
            "session_token_mismatch" => Self::SessionTokenMismatch,
            "token_refreshed" => Self::TokenRefreshed,
            "token_refresh_failed" => Self::TokenRefreshFailed,
            "token_revoked" => Self::TokenRevoked,
            "rate_limit_exceeded" => Self::RateLimitExceeded,
            "suspicious_activity" => Self::SuspiciousActivity,
            "authorization_denied" => Self::AuthorizationDenied,
            _ => return None,
        })
    }

    /// 事件的严重程度，决定日志级别
    pub fn severity(&self) -> AuditSeverity {
        match self {
            Self::RequestCompleted | Self::TokenRefreshed | Self::TokenRevoked => AuditSeverity::Info,
            Self::AuthenticationFailure
            | Self::TokenRefreshFailed
            | Self::RateLimitExceeded
            | Self::AuthorizationDenied => AuditSeverity::Warning,
            Self::SessionTokenMismatch | Self::SuspiciousActivity => AuditSeverity::High,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditSeverity {
    Info,
    Warning,
    High,
}

/// 安全审计事件，记录后不再修改
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityAuditEvent {
    pub timestamp: DateTime<Utc>,
    pub kind: AuditEventKind,
    pub severity: AuditSeverity,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<UserId>,
    pub ip_address: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    pub correlation_id: CorrelationId,
    pub details: Map<String, Value>,
}

impl SecurityAuditEvent {
    pub fn new(kind: AuditEventKind, ctx: &RequestContext) -> Self {
        Self {
            timestamp: Utc::now(),
            kind,
            severity: kind.severity(),
            user_id: None,
            ip_address: ctx.ip_address.clone(),
            user_agent: ctx.user_agent.clone(),
            correlation_id: ctx.correlation_id.clone(),
            details: Map::new(),
        }
    }

    pub fn with_user(mut self, user_id: Option<UserId>) -> Self {
        self.user_id = user_id;
        self
    }

    pub fn with_detail(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.details.insert(key.to_string(), value.into());
        self
    }
}

/// 审计查询条件
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuditQuery {
    pub limit: Option<usize>,
    pub kind: Option<String>,
    pub user_id: Option<String>,
}

/// 进程内审计日志
#[derive(Debug)]
pub struct AuditLog {
    events: Mutex<VecDeque<SecurityAuditEvent>>,
    capacity: usize,
}

impl Default for AuditLog {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_AUDIT_CAPACITY)
    }
}

impl AuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            events: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity,
        }
    }

    /// 记录一条事件
    pub fn record(&self, event: SecurityAuditEvent) {
        let kind = event.kind.as_str();
        let user_id = event.user_id.as_ref().map(|u| u.to_string()).unwrap_or_default();
        let details = Value::Object(event.details.clone());
        match event.severity {
            AuditSeverity::Info => info!(
                target: "audit",
                event = kind,
                user_id = %user_id,
                ip = %event.ip_address,
                correlation_id = %event.correlation_id,
                details = %details
            ),
            AuditSeverity::Warning => warn!(
                target: "audit",
                event = kind,
                user_id = %user_id,
                ip = %event.ip_address,
                correlation_id = %event.correlation_id,
                details = %details
            ),
            AuditSeverity::High => error!(
                target: "audit",
                event = kind,
                user_id = %user_id,
                ip = %event.ip_address,
                correlation_id = %event.correlation_id,
                details = %details
            ),
        }
        metrics::counter!("audit_events_total", "kind" => kind).increment(1);

        let mut events = self.events.lock();
        if events.len() >= self.capacity {
            events.pop_front();
        }
        events.push_back(event);
    }

    /// 最近的事件，按时间倒序
    pub fn recent(&self, query: &AuditQuery) -> Vec<SecurityAuditEvent> {
        let kind = query.kind.as_deref().and_then(AuditEventKind::parse);
        let limit = query.limit.unwrap_or(DEFAULT_QUERY_LIMIT).min(self.capacity);

        self.events
            .lock()
            .iter()
            .rev()
            .filter(|e| kind.is_none_or(|k| e.kind == k))
            .filter(|e| {
                query
                    .user_id
                    .as_deref()
                    .is_none_or(|u| e.user_id.as_ref().is_some_and(|id| id.as_str() == u))
            })
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn count_of(&self, kind: AuditEventKind) -> usize {
        self.events.lock().iter().filter(|e| e.kind == kind).count()
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }
}

/// 审计路由
pub fn audit_routes() -> Router<AppState> {
    Router::new().route("/events", get(list_events))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ListEventsResponse {
    pub events: Vec<SecurityAuditEvent>,
    pub total_count: usize,
}

fn require_admin(user: &UserContext) -> AppResult<()> {
    require_role!(user, "admin");
    Ok(())
}

/// 列出审计事件，需要 admin 角色
async fn list_events(
    State(state): State<AppState>,
    ctx: RequestContext,
    AuthSession(auth): AuthSession,
    Query(query): Query<AuditQuery>,
) -> Result<Json<ListEventsResponse>, Response> {
    if let Err(e) = require_admin(&auth.session.user_context) {
        state.audit.record(
            SecurityAuditEvent::new(AuditEventKind::AuthorizationDenied, &ctx)
                .with_user(Some(auth.session.user_id().clone()))
                .with_detail("resource", "audit_events"),
        );
        return Err(state.reject(e));
    }

    if query.kind.as_deref().is_some_and(|k| AuditEventKind::parse(k).is_none()) {
        return Err(state.reject(AppError::validation("Unknown audit event kind")));
    }

    let events = state.audit.recent(&query);
    Ok(Json(ListEventsResponse {
        total_count: state.audit.len(),
        events,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> RequestContext {
        RequestContext {
            correlation_id: CorrelationId::new(),
            ip_address: "10.0.0.1".into(),
            user_agent: None,
        }
    }

    #[test]
    fn test_ring_buffer_drops_oldest() {
        let log = AuditLog::with_capacity(3);
        for i in 0..5 {
            log.record(
                SecurityAuditEvent::new(AuditEventKind::RequestCompleted, &ctx()).with_detail("seq", i),
            );
        }
        assert_eq!(log.len(), 3);

        let events = log.recent(&AuditQuery::default());
        let seqs: Vec<_> = events.iter().map(|e| e.details["seq"].clone()).collect();
        assert_eq!(seqs, vec![Value::from(4), Value::from(3), Value::from(2)]);
    }

    #[test]
    fn test_query_filters() {
        let log = AuditLog::new();
        log.record(
            SecurityAuditEvent::new(AuditEventKind::TokenRevoked, &ctx()).with_user(Some(UserId::new("u1"))),
        );
        log.record(
            SecurityAuditEvent::new(AuditEventKind::TokenRevoked, &ctx()).with_user(Some(UserId::new("u2"))),
        );
        log.record(SecurityAuditEvent::new(AuditEventKind::RequestCompleted, &ctx()));

        let by_kind = log.recent(&AuditQuery {
            kind: Some("token_revoked".into()),
            ..Default::default()
        });
        assert_eq!(by_kind.len(), 2);

        let by_user = log.recent(&AuditQuery {
            user_id: Some("u2".into()),
            ..Default::default()
        });
        assert_eq!(by_user.len(), 1);

        let limited = log.recent(&AuditQuery {
            limit: Some(1),
            ..Default::default()
        });
        assert_eq!(limited[0].kind, AuditEventKind::RequestCompleted);
    }

    #[test]
    fn test_require_admin() {
        let admin = UserContext::new("u1").with_roles(vec!["admin".into()]);
        assert!(require_admin(&admin).is_ok());

        let err = require_admin(&UserContext::new("u2")).unwrap_err();
        assert_eq!(err.category(), mcpgw_errors::ErrorCategory::Authorization);
        assert_eq!(err.message(), "Missing role: admin");
    }

    #[test]
    fn test_kind_names_round_trip() {
        for kind in [
            AuditEventKind::SuspiciousActivity,
            AuditEventKind::SessionTokenMismatch,
            AuditEventKind::TokenRefreshFailed,
        ] {
            assert_eq!(AuditEventKind::parse(kind.as_str()), Some(kind));
            assert_eq!(serde_json::to_value(kind).unwrap(), kind.as_str());
        }
        assert_eq!(AuditEventKind::SuspiciousActivity.severity(), AuditSeverity::High);
    }
}
