//! mcpgw-auth-core - 会话令牌核心库
//!
//! 会话令牌的签发与校验（JWT HS256）、令牌黑名单以及组合两者的校验器。

mod blacklist;
mod validator;

pub use blacklist::*;
pub use validator::*;

use chrono::{DateTime, Utc};
use jsonwebtoken::{
    Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode, errors::ErrorKind,
};
use mcpgw_common::{SessionId, UserId};
use mcpgw_domain_core::SessionData;
use mcpgw_errors::{AppError, AppResult};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// 会话令牌 Claims
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionClaims {
    /// Subject (user ID)
    pub sub: String,
    /// 绑定的会话 ID
    pub sid: String,
    /// Expiration time
    pub exp: i64,
    /// Issued at
    pub iat: i64,
    /// JWT ID
    pub jti: String,
    /// Issuer
    pub iss: String,
    /// Audience
    pub aud: String,
    /// Roles
    #[serde(default)]
    pub roles: Vec<String>,
}

impl SessionClaims {
    pub fn user_id(&self) -> UserId {
        UserId::new(self.sub.clone())
    }

    pub fn session_id(&self) -> AppResult<SessionId> {
        SessionId::parse(&self.sid)
            .ok_or_else(|| AppError::authentication("Invalid session ID in token"))
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(self.exp, 0)
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }
}

/// Token 服务
#[derive(Clone)]
pub struct TokenService {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    issuer: String,
    audience: String,
}

impl std::fmt::Debug for TokenService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenService")
            .field("issuer", &self.issuer)
            .field("audience", &self.audience)
            .finish_non_exhaustive()
    }
}

impl TokenService {
    pub fn new(secret: &SecretString, issuer: impl Into<String>, audience: impl Into<String>) -> Self {
        let secret = secret.expose_secret().as_bytes();
        Self {
            encoding_key: EncodingKey::from_secret(secret),
            decoding_key: DecodingKey::from_secret(secret),
            issuer: issuer.into(),
            audience: audience.into(),
        }
    }

    /// 为会话签发令牌，过期时间与会话一致
    pub fn issue_for_session(&self, session: &SessionData) -> AppResult<String> {
        let claims = SessionClaims {
            sub: session.user_context.user_id.to_string(),
            sid: session.session_id.to_string(),
            exp: session.expires_at.timestamp(),
            iat: Utc::now().timestamp(),
            jti: Uuid::now_v7().to_string(),
            iss: self.issuer.clone(),
            aud: self.audience.clone(),
            roles: session.user_context.roles.clone(),
        };

        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .map_err(|e| AppError::unknown(format!("Failed to generate token: {}", e)))
    }

    /// 校验签名、签发者、受众和过期时间
    pub fn decode(&self, token: &str) -> AppResult<SessionClaims> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&[&self.issuer]);
        validation.set_audience(&[&self.audience]);
        validation.set_required_spec_claims(&["exp", "sub", "iss", "aud"]);
        validation.validate_exp = true;
        validation.validate_nbf = false;
        validation.leeway = 0; // 不允许时间偏差

        let token_data = decode::<SessionClaims>(token, &self.decoding_key, &validation).map_err(
            |e| match e.kind() {
                ErrorKind::ExpiredSignature => {
                    AppError::authentication("Token has expired").with_code("token_expired")
                }
                _ => AppError::authentication(format!("Invalid token: {}", e))
                    .with_code("invalid_token"),
            },
        )?;

        let claims = token_data.claims;

        // 额外验证：检查 JTI 与会话 ID 存在
        if claims.jti.is_empty() {
            return Err(AppError::authentication("Token ID (jti) missing").with_code("invalid_token"));
        }
        if claims.sid.is_empty() {
            return Err(AppError::authentication("Session ID (sid) missing").with_code("invalid_token"));
        }

        Ok(claims)
    }
}

/// 角色检查宏
#[macro_export]
macro_rules! require_role {
    ($claims:expr, $role:expr) => {
        if !$claims.has_role($role) {
            return Err(mcpgw_errors::AppError::authorization(format!(
                "Missing role: {}",
                $role
            )));
        }
    };
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use chrono::Duration;
    use mcpgw_domain_core::{TokenMetadata, UserContext};

    pub const SECRET: &str = "session-token-secret-for-tests-0123456789";

    pub fn service() -> TokenService {
        TokenService::new(&SecretString::new(SECRET.to_string()), "mcp-gateway", "mcp-clients")
    }

    pub fn session(ttl: Duration) -> SessionData {
        SessionData::new(
            UserContext::new("user-1").with_roles(vec!["admin".into()]),
            TokenMetadata {
                access_token: "at".into(),
                refresh_token: None,
                expires_at: Utc::now() + Duration::hours(1),
                scopes: vec![],
            },
            "127.0.0.1",
            None,
            ttl,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use chrono::Duration;
    use mcpgw_errors::ErrorCategory;

    #[test]
    fn test_issue_and_decode() {
        let tokens = service();
        let session = session(Duration::hours(1));
        let token = tokens.issue_for_session(&session).unwrap();

        let claims = tokens.decode(&token).unwrap();
        assert_eq!(claims.sub, "user-1");
        assert_eq!(claims.session_id().unwrap(), session.session_id);
        assert_eq!(claims.exp, session.expires_at.timestamp());
        assert!(claims.has_role("admin"));
    }

    #[test]
    fn test_expired_token_rejected() {
        let tokens = service();
        let mut session = session(Duration::hours(1));
        session.expires_at = Utc::now() - Duration::seconds(10);
        let token = tokens.issue_for_session(&session).unwrap();

        let err = tokens.decode(&token).unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Authentication);
        assert_eq!(err.code(), Some("token_expired"));
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let token = service().issue_for_session(&session(Duration::hours(1))).unwrap();
        let other = TokenService::new(
            &SecretString::new("a-different-secret-that-is-long-enough-xx".to_string()),
            "mcp-gateway",
            "mcp-clients",
        );
        assert_eq!(other.decode(&token).unwrap_err().code(), Some("invalid_token"));
    }

    #[test]
    fn test_wrong_audience_rejected() {
        let token = service().issue_for_session(&session(Duration::hours(1))).unwrap();
        let other = TokenService::new(&SecretString::new(SECRET.to_string()), "mcp-gateway", "other");
        assert!(other.decode(&token).is_err());
    }

    #[test]
    fn test_require_role_macro() {
        fn guarded(claims: &SessionClaims) -> AppResult<()> {
            require_role!(claims, "auditor");
            Ok(())
        }
        let tokens = service();
        let claims = tokens
            .decode(&tokens.issue_for_session(&session(Duration::hours(1))).unwrap())
            .unwrap();
        assert_eq!(guarded(&claims).unwrap_err().category(), ErrorCategory::Authorization);
    }
}
