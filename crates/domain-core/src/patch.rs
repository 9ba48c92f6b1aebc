//! 会话的部分更新
//!
//! 合并规则：
//! - `user_context` / `token_metadata` / `security` 按字段深度合并，未给出的字段保持原值
//! - 列表字段（`roles`、`scopes`）给出时整体替换
//! - `session_id` 与 `created_at` 不可修改

use chrono::{DateTime, Utc};
use mcpgw_common::UserId;
use mcpgw_errors::AppResult;

use crate::{SecurityContext, SessionData, TokenMetadata, UserContext};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserContextPatch {
    pub user_id: Option<UserId>,
    pub email: Option<String>,
    pub roles: Option<Vec<String>>,
}

impl UserContextPatch {
    fn merge_into(self, target: &mut UserContext) {
        if let Some(user_id) = self.user_id {
            target.user_id = user_id;
        }
        if let Some(email) = self.email {
            target.email = Some(email);
        }
        if let Some(roles) = self.roles {
            target.roles = roles;
        }
    }
}

#[derive(Clone, Default, PartialEq, Eq)]
pub struct TokenMetadataPatch {
    pub access_token: Option<String>,
    /// `Some(None)` 清除刷新令牌
    pub refresh_token: Option<Option<String>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub scopes: Option<Vec<String>>,
}

impl TokenMetadataPatch {
    fn merge_into(self, target: &mut TokenMetadata) {
        if let Some(access_token) = self.access_token {
            target.access_token = access_token;
        }
        if let Some(refresh_token) = self.refresh_token {
            target.refresh_token = refresh_token;
        }
        if let Some(expires_at) = self.expires_at {
            target.expires_at = expires_at;
        }
        if let Some(scopes) = self.scopes {
            target.scopes = scopes;
        }
    }
}

impl std::fmt::Debug for TokenMetadataPatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenMetadataPatch")
            .field("access_token", &self.access_token.as_ref().map(|_| "[REDACTED]"))
            .field("refresh_token", &self.refresh_token.as_ref().map(|t| t.as_ref().map(|_| "[REDACTED]")))
            .field("expires_at", &self.expires_at)
            .field("scopes", &self.scopes)
            .finish()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SecurityPatch {
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub last_accessed_at: Option<DateTime<Utc>>,
    pub access_count: Option<u64>,
    /// 在存储当前值的基础上加一，与存储的其他修改一起原子生效
    pub record_access: bool,
}

impl SecurityPatch {
    fn merge_into(self, target: &mut SecurityContext) {
        if let Some(ip_address) = self.ip_address {
            target.ip_address = ip_address;
        }
        if let Some(user_agent) = self.user_agent {
            target.user_agent = Some(user_agent);
        }
        if let Some(last_accessed_at) = self.last_accessed_at {
            target.last_accessed_at = last_accessed_at;
        }
        if let Some(access_count) = self.access_count {
            target.access_count = access_count;
        }
        if self.record_access {
            target.access_count = target.access_count.saturating_add(1);
        }
    }
}

/// 会话部分更新
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionPatch {
    pub session_token: Option<String>,
    pub user_context: Option<UserContextPatch>,
    pub token_metadata: Option<TokenMetadataPatch>,
    pub security: Option<SecurityPatch>,
    pub expires_at: Option<DateTime<Utc>>,
}

/// 合并结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchOutcome {
    /// 用户变更时的旧用户 ID，用于迁移用户索引
    pub previous_user: Option<UserId>,
}

impl SessionPatch {
    /// 记录一次访问：更新访问时间，访问计数加一
    pub fn touch(now: DateTime<Utc>) -> Self {
        Self {
            security: Some(SecurityPatch {
                last_accessed_at: Some(now),
                record_access: true,
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    /// 令牌刷新后更新令牌元数据
    pub fn refreshed_tokens(
        access_token: String,
        refresh_token: Option<String>,
        expires_at: DateTime<Utc>,
        scopes: Option<Vec<String>>,
    ) -> Self {
        Self {
            token_metadata: Some(TokenMetadataPatch {
                access_token: Some(access_token),
                // 身份提供方未轮换刷新令牌时保留旧值
                refresh_token: refresh_token.map(Some),
                expires_at: Some(expires_at),
                scopes,
            }),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }

    /// 将补丁合并到会话
    ///
    /// 合并后的会话违反不变式时返回错误且不修改原会话。
    pub fn apply(self, session: &mut SessionData) -> AppResult<PatchOutcome> {
        let mut merged = session.clone();
        let previous_user = merged.user_context.user_id.clone();

        if let Some(token) = self.session_token {
            merged.session_token = token;
        }
        if let Some(patch) = self.user_context {
            patch.merge_into(&mut merged.user_context);
        }
        if let Some(patch) = self.token_metadata {
            patch.merge_into(&mut merged.token_metadata);
        }
        if let Some(patch) = self.security {
            patch.merge_into(&mut merged.security);
        }
        if let Some(expires_at) = self.expires_at {
            merged.expires_at = expires_at;
        }

        merged.validate()?;

        let user_changed = merged.user_context.user_id != previous_user;
        *session = merged;
        Ok(PatchOutcome {
            previous_user: user_changed.then_some(previous_user),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::fixtures::session;
    use chrono::Duration;

    #[test]
    fn test_nested_fields_are_merged_not_replaced() {
        let mut s = session("u1", Duration::hours(1));
        let original = s.clone();

        let patch = SessionPatch {
            user_context: Some(UserContextPatch {
                roles: Some(vec!["admin".into()]),
                ..Default::default()
            }),
            security: Some(SecurityPatch {
                access_count: Some(9),
                ..Default::default()
            }),
            ..Default::default()
        };
        let outcome = patch.apply(&mut s).unwrap();

        assert_eq!(outcome.previous_user, None);
        assert_eq!(s.user_context.roles, vec!["admin".to_string()]);
        assert_eq!(s.user_context.email, original.user_context.email);
        assert_eq!(s.user_context.user_id, original.user_context.user_id);
        assert_eq!(s.security.access_count, 9);
        assert_eq!(s.security.ip_address, original.security.ip_address);
        assert_eq!(s.token_metadata, original.token_metadata);
        assert_eq!(s.session_id, original.session_id);
    }

    #[test]
    fn test_user_change_reports_previous_user() {
        let mut s = session("u1", Duration::hours(1));
        let patch = SessionPatch {
            user_context: Some(UserContextPatch {
                user_id: Some(UserId::new("u2")),
                ..Default::default()
            }),
            ..Default::default()
        };
        let outcome = patch.apply(&mut s).unwrap();
        assert_eq!(outcome.previous_user, Some(UserId::new("u1")));
        assert_eq!(s.user_id().as_str(), "u2");
    }

    #[test]
    fn test_refresh_keeps_refresh_token_when_not_rotated() {
        let mut s = session("u1", Duration::hours(1));
        let new_expiry = Utc::now() + Duration::hours(2);
        SessionPatch::refreshed_tokens("new-access".into(), None, new_expiry, None)
            .apply(&mut s)
            .unwrap();

        assert_eq!(s.token_metadata.access_token, "new-access");
        assert_eq!(s.token_metadata.refresh_token.as_deref(), Some("refresh-token-value"));
        assert_eq!(s.token_metadata.expires_at, new_expiry);
        assert_eq!(s.token_metadata.scopes, vec!["read".to_string(), "write".to_string()]);
    }

    #[test]
    fn test_refresh_token_can_be_cleared() {
        let mut s = session("u1", Duration::hours(1));
        SessionPatch {
            token_metadata: Some(TokenMetadataPatch {
                refresh_token: Some(None),
                ..Default::default()
            }),
            ..Default::default()
        }
        .apply(&mut s)
        .unwrap();
        assert!(!s.token_metadata.can_refresh());
    }

    #[test]
    fn test_invalid_patch_leaves_session_untouched() {
        let mut s = session("u1", Duration::hours(1));
        let original = s.clone();
        let result = SessionPatch {
            expires_at: Some(s.created_at - Duration::seconds(1)),
            session_token: Some("other".into()),
            ..Default::default()
        }
        .apply(&mut s);

        assert!(result.is_err());
        assert_eq!(s, original);
    }

    #[test]
    fn test_touch() {
        let mut s = session("u1", Duration::hours(1));
        let now = Utc::now();
        let patch = SessionPatch::touch(now);
        assert!(!patch.is_empty());
        patch.clone().apply(&mut s).unwrap();
        patch.apply(&mut s).unwrap();
        assert_eq!(s.security.last_accessed_at, now);
        assert_eq!(s.security.access_count, 2);
        assert!(SessionPatch::default().is_empty());
    }
}
