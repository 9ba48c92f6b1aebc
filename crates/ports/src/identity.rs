//! IdentityProvider trait 定义

use async_trait::async_trait;
use mcpgw_errors::AppResult;
use serde::Deserialize;

/// 刷新令牌后身份提供方返回的令牌
#[derive(Clone, PartialEq, Eq, Deserialize)]
pub struct TokenGrant {
    pub access_token: String,
    /// 身份提供方轮换刷新令牌时返回新值
    #[serde(default)]
    pub refresh_token: Option<String>,
    /// 访问令牌有效期（秒）
    pub expires_in: i64,
    /// 空格分隔的授权范围
    #[serde(default)]
    pub scope: Option<String>,
}

impl TokenGrant {
    pub fn scopes(&self) -> Option<Vec<String>> {
        self.scope
            .as_ref()
            .map(|s| s.split_whitespace().map(str::to_string).collect())
    }
}

impl std::fmt::Debug for TokenGrant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenGrant")
            .field("expires_in", &self.expires_in)
            .field("scope", &self.scope)
            .finish_non_exhaustive()
    }
}

/// 身份提供方 trait
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// 使用刷新令牌换取新的访问令牌
    ///
    /// `invalid_grant` 类失败必须归类为 Authentication，调用方需要重新认证。
    async fn refresh_token(&self, refresh_token: &str) -> AppResult<TokenGrant>;

    /// 身份提供方当前是否可用（例如断路器未打开）
    fn is_available(&self) -> bool {
        true
    }
}
