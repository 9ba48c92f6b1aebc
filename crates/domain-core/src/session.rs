//! 会话数据

use std::fmt;

use chrono::{DateTime, Duration, Utc};
use mcpgw_common::{SessionId, UserId};
use mcpgw_errors::{AppError, AppResult};
use serde::{Deserialize, Serialize};

use crate::Expiring;

/// 用户上下文
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserContext {
    pub user_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default)]
    pub roles: Vec<String>,
}

impl UserContext {
    pub fn new(user_id: impl Into<UserId>) -> Self {
        Self {
            user_id: user_id.into(),
            email: None,
            roles: Vec::new(),
        }
    }

    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }

    pub fn with_roles(mut self, roles: Vec<String>) -> Self {
        self.roles = roles;
        self
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }
}

/// 身份提供方签发的令牌
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenMetadata {
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    pub expires_at: DateTime<Utc>,
    #[serde(default)]
    pub scopes: Vec<String>,
}

impl TokenMetadata {
    /// 访问令牌是否会在 `horizon` 内过期（已过期也算）
    pub fn expires_within(&self, horizon: Duration, now: DateTime<Utc>) -> bool {
        self.expires_at <= now + horizon
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    pub fn can_refresh(&self) -> bool {
        self.refresh_token.as_deref().is_some_and(|t| !t.is_empty())
    }
}

impl fmt::Debug for TokenMetadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenMetadata")
            .field("access_token", &"[REDACTED]")
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "[REDACTED]"))
            .field("expires_at", &self.expires_at)
            .field("scopes", &self.scopes)
            .finish()
    }
}

/// 客户端安全上下文
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityContext {
    pub ip_address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
    #[serde(default)]
    pub access_count: u64,
}

/// 会话记录
///
/// 不变式：`expires_at > created_at`；当前时间 >= `expires_at` 即视为无效，
/// 无效会话永远不会被返回。
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionData {
    pub session_id: SessionId,
    /// 绑定到本会话的签名令牌
    pub session_token: String,
    pub user_context: UserContext,
    pub token_metadata: TokenMetadata,
    pub security: SecurityContext,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl SessionData {
    /// 创建新会话（会话令牌由签名方随后填入）
    pub fn new(
        user_context: UserContext,
        token_metadata: TokenMetadata,
        ip_address: impl Into<String>,
        user_agent: Option<String>,
        ttl: Duration,
    ) -> Self {
        let now = Utc::now();
        Self {
            session_id: SessionId::new(),
            session_token: String::new(),
            user_context,
            token_metadata,
            security: SecurityContext {
                ip_address: ip_address.into(),
                user_agent,
                created_at: now,
                last_accessed_at: now,
                access_count: 0,
            },
            expires_at: now + ttl,
            created_at: now,
        }
    }

    pub fn with_session_token(mut self, token: impl Into<String>) -> Self {
        self.session_token = token.into();
        self
    }

    pub fn user_id(&self) -> &UserId {
        &self.user_context.user_id
    }

    /// 校验结构不变式
    pub fn validate(&self) -> AppResult<()> {
        if self.expires_at <= self.created_at {
            return Err(AppError::validation(format!(
                "Session {} expires at or before its creation time",
                self.session_id
            )));
        }
        if self.user_context.user_id.as_str().is_empty() {
            return Err(AppError::validation("Session user id must not be empty"));
        }
        Ok(())
    }

    /// 剩余有效期（已过期时为零）
    pub fn remaining(&self, now: DateTime<Utc>) -> Duration {
        (self.expires_at - now).max(Duration::zero())
    }
}

impl Expiring for SessionData {
    fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }
}

impl fmt::Debug for SessionData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionData")
            .field("session_id", &self.session_id)
            .field("session_token", &"[REDACTED]")
            .field("user_context", &self.user_context)
            .field("token_metadata", &self.token_metadata)
            .field("security", &self.security)
            .field("expires_at", &self.expires_at)
            .field("created_at", &self.created_at)
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    pub fn session(user: &str, ttl: Duration) -> SessionData {
        SessionData::new(
            UserContext::new(user)
                .with_email(format!("{}@example.com", user))
                .with_roles(vec!["user".into()]),
            TokenMetadata {
                access_token: "access-token-value".into(),
                refresh_token: Some("refresh-token-value".into()),
                expires_at: Utc::now() + Duration::minutes(30),
                scopes: vec!["read".into(), "write".into()],
            },
            "10.0.0.1",
            Some("test-agent/1.0".into()),
            ttl,
        )
        .with_session_token("signed-session-token")
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::session;
    use super::*;

    #[test]
    fn test_new_session_is_valid() {
        let s = session("u1", Duration::hours(1));
        assert!(s.validate().is_ok());
        assert!(!s.is_expired());
        assert_eq!(s.id(), &s.session_id);
        assert_eq!(s.security.access_count, 0);
    }

    #[test]
    fn test_expiry_boundary() {
        let s = session("u1", Duration::hours(1));
        assert!(!s.is_expired_at(s.expires_at - Duration::milliseconds(1)));
        assert!(s.is_expired_at(s.expires_at));
        assert_eq!(s.remaining(s.expires_at + Duration::hours(1)), Duration::zero());
    }

    #[test]
    fn test_invalid_expiry_rejected() {
        let mut s = session("u1", Duration::hours(1));
        s.expires_at = s.created_at;
        assert!(s.validate().is_err());
    }

    #[test]
    fn test_token_refresh_horizon() {
        let now = Utc::now();
        let mut s = session("u1", Duration::hours(1));
        s.token_metadata.expires_at = now + Duration::minutes(4);
        assert!(s.token_metadata.expires_within(Duration::minutes(5), now));
        s.token_metadata.expires_at = now + Duration::minutes(6);
        assert!(!s.token_metadata.expires_within(Duration::minutes(5), now));
        assert!(s.token_metadata.can_refresh());
    }

    #[test]
    fn test_serde_uses_camel_case() {
        let s = session("u1", Duration::hours(1));
        let json = serde_json::to_value(&s).unwrap();
        assert!(json.get("sessionId").is_some());
        assert!(json["userContext"].get("userId").is_some());
        assert!(json["tokenMetadata"].get("accessToken").is_some());
        assert!(json["security"].get("lastAccessedAt").is_some());

        let back: SessionData = serde_json::from_value(json).unwrap();
        assert_eq!(back, s);
    }

    #[test]
    fn test_debug_redacts_tokens() {
        let s = session("u1", Duration::hours(1));
        let debug = format!("{:?}", s);
        assert!(!debug.contains("access-token-value"));
        assert!(!debug.contains("refresh-token-value"));
        assert!(!debug.contains("signed-session-token"));
    }
}
