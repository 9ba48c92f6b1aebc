//! 网关共享状态

use std::sync::Arc;

use axum::response::Response;
use mcpgw_auth_core::TokenValidator;
use mcpgw_common::CircuitBreaker;
use mcpgw_errors::{AppError, SecretMasker};
use mcpgw_ports::{IdentityProvider, SessionStore};
use metrics_exporter_prometheus::PrometheusHandle;

use crate::audit::AuditLog;
use crate::error::render_error;
use crate::rate_limit::{RateLimitRule, RateLimiter};
use crate::suspicious::SuspiciousActivityTracker;

/// 各中间件阶段共享的组件，只通过端口 trait 访问存储与身份提供方
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn SessionStore>,
    pub validator: TokenValidator,
    pub identity: Option<Arc<dyn IdentityProvider>>,
    pub identity_breaker: Option<CircuitBreaker>,
    pub rate_limiter: Arc<RateLimiter>,
    pub suspicious: Arc<SuspiciousActivityTracker>,
    pub audit: Arc<AuditLog>,
    pub masker: Arc<SecretMasker>,
    pub metrics: Option<PrometheusHandle>,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("validator", &self.validator)
            .field("identity", &self.identity.is_some())
            .field("rate_limit", self.rate_limiter.rule())
            .finish_non_exhaustive()
    }
}

impl AppState {
    pub fn new(store: Arc<dyn SessionStore>, validator: TokenValidator) -> Self {
        Self {
            store,
            validator,
            identity: None,
            identity_breaker: None,
            rate_limiter: Arc::new(RateLimiter::new(RateLimitRule::default())),
            suspicious: Arc::new(SuspiciousActivityTracker::default()),
            audit: Arc::new(AuditLog::new()),
            masker: Arc::new(SecretMasker::new()),
            metrics: None,
        }
    }

    /// 设置身份提供方；`breaker` 是保护它的断路器，健康检查会读取其状态
    pub fn with_identity(
        mut self,
        identity: Arc<dyn IdentityProvider>,
        breaker: Option<CircuitBreaker>,
    ) -> Self {
        self.identity = Some(identity);
        self.identity_breaker = breaker;
        self
    }

    pub fn with_rate_limit(mut self, rule: RateLimitRule) -> Self {
        self.rate_limiter = Arc::new(RateLimiter::new(rule));
        self
    }

    pub fn with_suspicious_tracker(mut self, tracker: SuspiciousActivityTracker) -> Self {
        self.suspicious = Arc::new(tracker);
        self
    }

    pub fn with_masker(mut self, masker: SecretMasker) -> Self {
        self.masker = Arc::new(masker);
        self
    }

    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }

    /// 渲染错误响应
    pub fn reject(&self, err: AppError) -> Response {
        render_error(&err, &self.masker)
    }
}
