//! Token 黑名单
//!
//! 只保存令牌的 SHA-256 摘要。条目在自身过期后失效：
//! 查询时惰性清除，另有周期任务批量清除。

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use sha2::{Digest, Sha256};

/// 黑名单条目
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BlacklistEntry {
    pub reason: String,
    pub expires_at: DateTime<Utc>,
}

/// 进程内 Token 黑名单
#[derive(Debug, Default)]
pub struct TokenBlacklist {
    entries: Mutex<HashMap<String, BlacklistEntry>>,
}

impl TokenBlacklist {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(token: &str) -> String {
        hex::encode(Sha256::digest(token.as_bytes()))
    }

    /// 将 Token 加入黑名单直到 `expires_at`
    pub fn revoke(&self, token: &str, reason: impl Into<String>, expires_at: DateTime<Utc>) {
        let entry = BlacklistEntry {
            reason: reason.into(),
            expires_at,
        };
        let previous = self.entries.lock().insert(Self::key(token), entry);
        if previous.is_none() {
            metrics::gauge!("token_blacklist_size").increment(1.0);
        }
    }

    /// 查询 Token 是否被吊销，已过期的条目会被顺带删除
    pub fn lookup(&self, token: &str) -> Option<BlacklistEntry> {
        self.lookup_at(token, Utc::now())
    }

    pub fn lookup_at(&self, token: &str, now: DateTime<Utc>) -> Option<BlacklistEntry> {
        let key = Self::key(token);
        let mut entries = self.entries.lock();
        match entries.get(&key) {
            Some(entry) if now >= entry.expires_at => {
                entries.remove(&key);
                metrics::gauge!("token_blacklist_size").decrement(1.0);
                None
            }
            Some(entry) => Some(entry.clone()),
            None => None,
        }
    }

    pub fn is_revoked(&self, token: &str) -> bool {
        self.lookup(token).is_some()
    }

    /// 删除所有已过期条目，返回删除数量
    pub fn purge_expired(&self) -> usize {
        self.purge_expired_at(Utc::now())
    }

    pub fn purge_expired_at(&self, now: DateTime<Utc>) -> usize {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, entry| now < entry.expires_at);
        let removed = before - entries.len();
        drop(entries);

        if removed > 0 {
            metrics::gauge!("token_blacklist_size").decrement(removed as f64);
            tracing::debug!(removed, "Purged expired blacklist entries");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}
