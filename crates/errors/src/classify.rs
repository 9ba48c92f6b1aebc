//! 低层错误归类
//!
//! 判定顺序：HTTP 状态码 → 低层错误码 → 消息子串。
//! 子串匹配天然脆弱，规则表公开以便测试和审查。

use crate::{AppError, ErrorCategory};

/// 默认可重试的 HTTP 状态码
pub const DEFAULT_RETRYABLE_STATUSES: &[u16] = &[408, 429, 500, 502, 503, 504];

/// 视为连接类错误（可重试）的名称/消息模式
pub const CONNECTION_ERROR_PATTERNS: &[&str] = &[
    "econnreset",
    "connection reset",
    "econnrefused",
    "connection refused",
    "etimedout",
    "timed out",
    "timeout",
    "socket hang up",
    "broken pipe",
    "connection closed",
];

/// 低层错误码 → 类别
pub const CODE_RULES: &[(&str, ErrorCategory)] = &[
    ("ETIMEDOUT", ErrorCategory::Timeout),
    ("ESOCKETTIMEDOUT", ErrorCategory::Timeout),
    ("ECONNRESET", ErrorCategory::Network),
    ("ECONNREFUSED", ErrorCategory::Network),
    ("ENOTFOUND", ErrorCategory::Network),
    ("EAI_AGAIN", ErrorCategory::Network),
    ("EPIPE", ErrorCategory::Network),
    ("invalid_grant", ErrorCategory::Authentication),
    ("invalid_token", ErrorCategory::Authentication),
    ("insufficient_scope", ErrorCategory::Authorization),
];

/// 消息子串 → 类别（首个匹配生效，匹配前转为小写）
pub const MESSAGE_RULES: &[(&str, ErrorCategory)] = &[
    ("invalid_grant", ErrorCategory::Authentication),
    ("unauthorized", ErrorCategory::Authentication),
    ("invalid token", ErrorCategory::Authentication),
    ("token expired", ErrorCategory::Authentication),
    ("jwt expired", ErrorCategory::Authentication),
    ("forbidden", ErrorCategory::Authorization),
    ("permission denied", ErrorCategory::Authorization),
    ("insufficient_scope", ErrorCategory::Authorization),
    ("rate limit", ErrorCategory::RateLimit),
    ("too many requests", ErrorCategory::RateLimit),
    ("etimedout", ErrorCategory::Timeout),
    ("timed out", ErrorCategory::Timeout),
    ("timeout", ErrorCategory::Timeout),
    ("econnreset", ErrorCategory::Network),
    ("connection reset", ErrorCategory::Network),
    ("econnrefused", ErrorCategory::Network),
    ("connection refused", ErrorCategory::Network),
    ("enotfound", ErrorCategory::Network),
    ("socket hang up", ErrorCategory::Network),
    ("network", ErrorCategory::Network),
    ("service unavailable", ErrorCategory::ServiceUnavailable),
    ("temporarily unavailable", ErrorCategory::ServiceUnavailable),
    ("validation", ErrorCategory::Validation),
    ("invalid input", ErrorCategory::Validation),
];

/// 尚未归类的低层失败
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawFailure {
    pub status: Option<u16>,
    pub code: Option<String>,
    pub message: String,
}

impl RawFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            status: None,
            code: None,
            message: message.into(),
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }
}

/// 判断名称或消息是否为连接类错误
pub fn is_connection_error(text: &str) -> bool {
    let lower = text.to_lowercase();
    CONNECTION_ERROR_PATTERNS
        .iter()
        .any(|pattern| lower.contains(pattern))
}

/// HTTP 状态码 → 类别
pub fn category_for_status(status: u16) -> Option<ErrorCategory> {
    match status {
        400 | 422 => Some(ErrorCategory::Validation),
        401 => Some(ErrorCategory::Authentication),
        403 => Some(ErrorCategory::Authorization),
        404 => Some(ErrorCategory::NotFound),
        408 | 504 => Some(ErrorCategory::Timeout),
        429 => Some(ErrorCategory::RateLimit),
        502 => Some(ErrorCategory::Network),
        500 | 503 => Some(ErrorCategory::ServiceUnavailable),
        405..=499 => Some(ErrorCategory::Validation),
        _ => None,
    }
}

/// 低层错误码 → 类别
pub fn category_for_code(code: &str) -> Option<ErrorCategory> {
    CODE_RULES
        .iter()
        .find(|(rule, _)| rule.eq_ignore_ascii_case(code))
        .map(|(_, category)| *category)
}

/// 消息子串 → 类别
pub fn category_for_message(message: &str) -> Option<ErrorCategory> {
    let lower = message.to_lowercase();
    MESSAGE_RULES
        .iter()
        .find(|(pattern, _)| lower.contains(pattern))
        .map(|(_, category)| *category)
}

/// 将低层失败归类为 [`AppError`]
///
/// `invalid_grant` 类失败（刷新令牌失效）总是归为 Authentication，
/// 即便下游返回的是 400。
pub fn classify_failure(raw: RawFailure) -> AppError {
    let invalid_grant = raw.message.to_lowercase().contains("invalid_grant")
        || raw
            .code
            .as_deref()
            .is_some_and(|c| c.eq_ignore_ascii_case("invalid_grant"));

    let category = if invalid_grant {
        ErrorCategory::Authentication
    } else {
        raw.status
            .and_then(category_for_status)
            .or_else(|| raw.code.as_deref().and_then(category_for_code))
            .or_else(|| category_for_message(&raw.message))
            .unwrap_or(ErrorCategory::Unknown)
    };

    let mut err = AppError::new(category, raw.message.clone()).with_source(&raw.message);
    if let Some(status) = raw.status {
        err = err.with_http_status(status);
    }
    match raw.code {
        Some(code) => err = err.with_code(code),
        None if invalid_grant => err = err.with_code("invalid_grant"),
        None => {}
    }
    err
}
