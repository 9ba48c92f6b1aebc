//! 会话令牌校验器
//!
//! 先查黑名单，再校验签名与过期时间。

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use mcpgw_common::PeriodicTask;
use mcpgw_errors::{AppError, AppResult};
use tracing::{debug, info};

use crate::{SessionClaims, TokenBlacklist, TokenService};

#[derive(Debug, Clone)]
pub struct TokenValidator {
    tokens: TokenService,
    blacklist: Arc<TokenBlacklist>,
}

impl TokenValidator {
    pub fn new(tokens: TokenService, blacklist: Arc<TokenBlacklist>) -> Self {
        Self { tokens, blacklist }
    }

    pub fn tokens(&self) -> &TokenService {
        &self.tokens
    }

    pub fn blacklist_store(&self) -> &Arc<TokenBlacklist> {
        &self.blacklist
    }

    /// 校验令牌
    pub fn validate(&self, token: &str) -> AppResult<SessionClaims> {
        if let Some(entry) = self.blacklist.lookup(token) {
            debug!(reason = %entry.reason, "Rejected blacklisted token");
            return Err(AppError::authentication("Token has been revoked")
                .with_code("token_revoked")
                .with_metadata("reason", entry.reason));
        }
        self.tokens.decode(token)
    }

    /// 吊销令牌直到 `expires_at`（通常是令牌自身的过期时间）
    pub fn blacklist(&self, token: &str, reason: &str, expires_at: DateTime<Utc>) {
        self.blacklist.revoke(token, reason, expires_at);
        info!(reason, expires_at = %expires_at, "Token blacklisted");
    }

    /// 启动黑名单周期清理
    pub fn spawn_blacklist_sweeper(&self, period: Duration) -> PeriodicTask {
        let blacklist = self.blacklist.clone();
        PeriodicTask::spawn("blacklist-sweep", period, move || {
            let blacklist = blacklist.clone();
            async move {
                blacklist.purge_expired();
            }
        })
    }
}
