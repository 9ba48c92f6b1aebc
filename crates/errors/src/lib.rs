//! mcpgw-errors - 统一错误处理
//!
//! 所有组件共享的错误分类：类别、严重级别、是否可重试以及建议的恢复动作。
//! 低层错误（HTTP 状态码、连接错误）在进入核心时通过 [`classify_failure`] 归类，
//! 重试执行器与断路器只会看到归类后的 [`AppError`]。

mod classify;
mod mask;
mod strategy;

pub use classify::*;
pub use mask::*;
pub use strategy::*;

use std::fmt;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// 错误类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCategory {
    Authentication,
    Authorization,
    Network,
    Validation,
    RateLimit,
    Timeout,
    ServiceUnavailable,
    CircuitBreaker,
    Configuration,
    /// 会话存储中不存在的记录
    NotFound,
    /// 持久化存储的 I/O 或完整性错误
    Storage,
    Unknown,
}

/// 严重级别
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

/// 建议的恢复动作
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryAction {
    Retry,
    RetryLater,
    Reauthenticate,
    RequestAccess,
    CorrectInput,
    CheckConfiguration,
    ContactSupport,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Authentication => "AUTHENTICATION",
            Self::Authorization => "AUTHORIZATION",
            Self::Network => "NETWORK",
            Self::Validation => "VALIDATION",
            Self::RateLimit => "RATE_LIMIT",
            Self::Timeout => "TIMEOUT",
            Self::ServiceUnavailable => "SERVICE_UNAVAILABLE",
            Self::CircuitBreaker => "CIRCUIT_BREAKER",
            Self::Configuration => "CONFIGURATION",
            Self::NotFound => "NOT_FOUND",
            Self::Storage => "STORAGE",
            Self::Unknown => "UNKNOWN",
        }
    }

    /// 类别默认的严重级别
    pub fn default_severity(&self) -> Severity {
        match self {
            Self::Validation | Self::NotFound => Severity::Low,
            Self::Authorization
            | Self::Network
            | Self::RateLimit
            | Self::Timeout
            | Self::Unknown => Severity::Medium,
            Self::Authentication
            | Self::ServiceUnavailable
            | Self::CircuitBreaker
            | Self::Storage => Severity::High,
            Self::Configuration => Severity::Critical,
        }
    }

    /// 类别默认是否可重试
    ///
    /// 断路器拒绝不可重试：断路器本身就是缓解手段。
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Network | Self::Timeout | Self::ServiceUnavailable | Self::RateLimit
        )
    }

    /// 类别默认的重试策略（仅可重试类别）
    pub fn default_retry_strategy(&self) -> Option<RetryStrategy> {
        use std::time::Duration;

        match self {
            Self::Network => Some(RetryStrategy::new(
                3,
                Duration::from_secs(1),
                Duration::from_secs(10),
            )),
            Self::Timeout => Some(RetryStrategy::new(
                3,
                Duration::from_secs(2),
                Duration::from_secs(30),
            )),
            Self::RateLimit => Some(RetryStrategy::new(
                5,
                Duration::from_secs(5),
                Duration::from_secs(60),
            )),
            Self::ServiceUnavailable => Some(RetryStrategy::new(
                3,
                Duration::from_secs(5),
                Duration::from_secs(60),
            )),
            _ => None,
        }
    }

    pub fn default_recovery_action(&self) -> RecoveryAction {
        match self {
            Self::Authentication => RecoveryAction::Reauthenticate,
            Self::Authorization => RecoveryAction::RequestAccess,
            Self::Network | Self::Timeout => RecoveryAction::Retry,
            Self::RateLimit | Self::ServiceUnavailable | Self::CircuitBreaker => {
                RecoveryAction::RetryLater
            }
            Self::Validation | Self::NotFound => RecoveryAction::CorrectInput,
            Self::Configuration => RecoveryAction::CheckConfiguration,
            Self::Storage | Self::Unknown => RecoveryAction::ContactSupport,
        }
    }

    pub fn default_user_message(&self) -> &'static str {
        match self {
            Self::Authentication => "Your session is no longer valid. Please sign in again.",
            Self::Authorization => "You do not have permission to perform this action.",
            Self::Network => "A network problem occurred. Please try again.",
            Self::Validation => "The request was invalid.",
            Self::RateLimit => "Too many requests. Please slow down and try again later.",
            Self::Timeout => "The request timed out. Please try again.",
            Self::ServiceUnavailable | Self::CircuitBreaker => {
                "The service is temporarily unavailable. Please try again later."
            }
            Self::Configuration => "The service is misconfigured.",
            Self::NotFound => "The requested resource was not found.",
            Self::Storage => "An internal storage error occurred.",
            Self::Unknown => "An unexpected error occurred.",
        }
    }

    /// 转换为 HTTP 状态码
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Authentication => 401,
            Self::Authorization => 403,
            Self::Validation => 400,
            Self::NotFound => 404,
            Self::RateLimit => 429,
            Self::Network => 502,
            Self::Timeout => 504,
            Self::ServiceUnavailable | Self::CircuitBreaker => 503,
            Self::Configuration | Self::Storage | Self::Unknown => 500,
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 应用错误类型
///
/// 在失败点创建，构造后不再修改（builder 方法消耗 `self`）。
#[derive(Debug, Clone, Error, Serialize)]
#[serde(rename_all = "camelCase")]
#[error("{category}: {message}")]
pub struct AppError {
    category: ErrorCategory,
    severity: Severity,
    retryable: bool,
    retry_strategy: Option<RetryStrategy>,
    message: String,
    user_message: String,
    recovery_action: RecoveryAction,
    metadata: Map<String, Value>,
    timestamp: DateTime<Utc>,
    /// 下游返回的 HTTP 状态码（若有）
    http_status: Option<u16>,
    /// 低层错误码，例如 `ECONNRESET` 或 `invalid_grant`
    code: Option<String>,
    #[serde(skip)]
    original_error: Option<String>,
}

impl AppError {
    pub fn new(category: ErrorCategory, message: impl Into<String>) -> Self {
        Self {
            category,
            severity: category.default_severity(),
            retryable: category.is_retryable(),
            retry_strategy: category.default_retry_strategy(),
            message: message.into(),
            user_message: category.default_user_message().to_string(),
            recovery_action: category.default_recovery_action(),
            metadata: Map::new(),
            timestamp: Utc::now(),
            http_status: None,
            code: None,
            original_error: None,
        }
    }

    pub fn authentication(msg: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Authentication, msg)
    }

    pub fn authorization(msg: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Authorization, msg)
    }

    pub fn network(msg: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Network, msg)
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Validation, msg)
    }

    /// 限流错误，附带建议的重试等待秒数
    pub fn rate_limited(msg: impl Into<String>, retry_after_secs: u64) -> Self {
        Self::new(ErrorCategory::RateLimit, msg).with_metadata("retryAfter", retry_after_secs)
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Timeout, msg)
    }

    pub fn service_unavailable(msg: impl Into<String>) -> Self {
        Self::new(ErrorCategory::ServiceUnavailable, msg)
    }

    /// 断路器拒绝
    pub fn circuit_open(breaker: &str, retry_after_ms: u64) -> Self {
        Self::new(
            ErrorCategory::CircuitBreaker,
            format!("Circuit breaker '{}' is open", breaker),
        )
        .with_metadata("breaker", breaker)
        .with_metadata("retryAfterMs", retry_after_ms)
    }

    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Configuration, msg)
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::new(ErrorCategory::NotFound, msg)
    }

    pub fn storage(msg: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Storage, msg)
    }

    pub fn unknown(msg: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Unknown, msg)
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_http_status(mut self, status: u16) -> Self {
        self.http_status = Some(status);
        self
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    /// 记录原始错误文本（不会出现在边界响应中）
    pub fn with_source(mut self, source: impl fmt::Display) -> Self {
        self.original_error = Some(source.to_string());
        self
    }

    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    pub fn with_user_message(mut self, user_message: impl Into<String>) -> Self {
        self.user_message = user_message.into();
        self
    }

    pub fn with_retry_strategy(mut self, strategy: Option<RetryStrategy>) -> Self {
        self.retry_strategy = strategy;
        self
    }

    pub fn category(&self) -> ErrorCategory {
        self.category
    }

    pub fn severity(&self) -> Severity {
        self.severity
    }

    pub fn is_retryable(&self) -> bool {
        self.retryable
    }

    pub fn retry_strategy(&self) -> Option<&RetryStrategy> {
        self.retry_strategy.as_ref()
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn user_message(&self) -> &str {
        &self.user_message
    }

    pub fn recovery_action(&self) -> RecoveryAction {
        self.recovery_action
    }

    pub fn metadata(&self) -> &Map<String, Value> {
        &self.metadata
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn http_status(&self) -> Option<u16> {
        self.http_status
    }

    pub fn code(&self) -> Option<&str> {
        self.code.as_deref()
    }

    pub fn original_error(&self) -> Option<&str> {
        self.original_error.as_deref()
    }

    pub fn is(&self, category: ErrorCategory) -> bool {
        self.category == category
    }

    /// 边界响应使用的 HTTP 状态码
    pub fn status_code(&self) -> u16 {
        self.category.status_code()
    }

    /// 转换为边界错误结构，消息与元数据中的密钥会被掩码
    pub fn to_boundary(&self, masker: &SecretMasker) -> BoundaryError {
        let mut data = Map::new();
        data.insert("severity".into(), serde_json::to_value(self.severity).unwrap_or(Value::Null));
        data.insert("retryable".into(), Value::Bool(self.retryable));
        data.insert(
            "recoveryAction".into(),
            serde_json::to_value(self.recovery_action).unwrap_or(Value::Null),
        );
        data.insert(
            "timestamp".into(),
            Value::String(self.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true)),
        );
        data.insert("userMessage".into(), Value::String(self.user_message.clone()));
        if let Some(code) = &self.code {
            data.insert("errorCode".into(), Value::String(masker.mask(code)));
        }
        for (key, value) in &self.metadata {
            data.entry(key.clone()).or_insert_with(|| masker.mask_value(value));
        }

        BoundaryError {
            code: self.category.as_str().to_string(),
            message: masker.mask(&self.message),
            data,
        }
    }
}

/// 边界错误结构：`{code, message, data}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundaryError {
    pub code: String,
    pub message: String,
    pub data: Map<String, Value>,
}

/// Result 类型别名
pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_category_defaults() {
        let err = AppError::network("connection reset by peer");
        assert_eq!(err.category(), ErrorCategory::Network);
        assert!(err.is_retryable());
        assert!(err.retry_strategy().is_some());
        assert_eq!(err.recovery_action(), RecoveryAction::Retry);
        assert_eq!(err.status_code(), 502);

        let err = AppError::configuration("missing secret");
        assert!(!err.is_retryable());
        assert!(err.retry_strategy().is_none());
        assert_eq!(err.severity(), Severity::Critical);
    }

    #[test]
    fn test_never_retryable_categories() {
        for category in [
            ErrorCategory::Authentication,
            ErrorCategory::Authorization,
            ErrorCategory::Validation,
            ErrorCategory::CircuitBreaker,
            ErrorCategory::Configuration,
            ErrorCategory::Storage,
        ] {
            assert!(!AppError::new(category, "x").is_retryable(), "{category}");
        }
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(AppError::authentication("x").status_code(), 401);
        assert_eq!(AppError::authorization("x").status_code(), 403);
        assert_eq!(AppError::rate_limited("x", 30).status_code(), 429);
        assert_eq!(AppError::circuit_open("idp", 100).status_code(), 503);
        assert_eq!(AppError::service_unavailable("x").status_code(), 503);
        assert_eq!(AppError::unknown("x").status_code(), 500);
    }

    #[test]
    fn test_boundary_shape() {
        let err = AppError::rate_limited("Too many requests for user:42", 17);
        let boundary = err.to_boundary(&SecretMasker::default());

        assert_eq!(boundary.code, "RATE_LIMIT");
        assert_eq!(boundary.message, "Too many requests for user:42");
        assert_eq!(boundary.data["severity"], "MEDIUM");
        assert_eq!(boundary.data["retryable"], true);
        assert_eq!(boundary.data["recoveryAction"], "retry_later");
        assert_eq!(boundary.data["retryAfter"], 17);
        assert!(boundary.data.contains_key("timestamp"));
    }

    #[test]
    fn test_boundary_masks_secrets_and_hides_source() {
        let secret = "s3cr3t-value-that-is-long-enough-0001";
        let err = AppError::configuration(format!("bad key {}", secret))
            .with_metadata("detail", format!("key={}", secret))
            .with_source("stack trace: at main.rs:10");
        let masker = SecretMasker::new().with_secret(secret);
        let boundary = err.to_boundary(&masker);

        assert!(!boundary.message.contains(secret));
        assert!(!boundary.data["detail"].as_str().unwrap().contains(secret));
        let json = serde_json::to_string(&boundary).unwrap();
        assert!(!json.contains("stack trace"));
    }

    #[test]
    fn test_metadata_cannot_override_core_fields() {
        let err = AppError::validation("x").with_metadata("retryable", "maybe");
        let boundary = err.to_boundary(&SecretMasker::default());
        assert_eq!(boundary.data["retryable"], false);
    }
}
