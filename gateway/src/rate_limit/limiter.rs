//! 限流器
//!
//! 固定窗口计数：窗口到期后计数归零。计数递增与比较在同一把锁内完成。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use mcpgw_common::PeriodicTask;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::debug;

use crate::rate_limit::types::{RateLimitEntry, RateLimitResult, RateLimitRule};

/// 限流器
#[derive(Debug)]
pub struct RateLimiter {
    rule: RateLimitRule,
    entries: Mutex<HashMap<String, RateLimitEntry>>,
}

impl RateLimiter {
    pub fn new(rule: RateLimitRule) -> Self {
        Self {
            rule,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn rule(&self) -> &RateLimitRule {
        &self.rule
    }

    /// 检查是否允许请求
    ///
    /// `identifier` 为客户端标识符（`user:{user_id}` 或 `ip:{ip}`）
    pub fn check(&self, identifier: &str) -> RateLimitResult {
        self.check_at(identifier, Instant::now())
    }

    pub fn check_at(&self, identifier: &str, now: Instant) -> RateLimitResult {
        let window = self.rule.window;
        let (count, violation_count, until_reset) = {
            let mut entries = self.entries.lock();
            let entry = entries
                .entry(identifier.to_string())
                .or_insert_with(|| RateLimitEntry {
                    count: 0,
                    window_reset_at: now + window,
                    violation_count: 0,
                });

            if now >= entry.window_reset_at {
                entry.count = 0;
                entry.window_reset_at = now + window;
            }
            entry.count = entry.count.saturating_add(1);
            if entry.count > self.rule.max_requests {
                entry.violation_count += 1;
            }
            (
                entry.count,
                entry.violation_count,
                entry.window_reset_at.saturating_duration_since(now),
            )
        };

        let allowed = count <= self.rule.max_requests;
        let reset_at = Utc::now().timestamp() + ceil_secs(until_reset) as i64;

        debug!(
            identifier,
            count,
            allowed,
            max_requests = self.rule.max_requests,
            "Rate limit check result"
        );

        RateLimitResult {
            allowed,
            count,
            remaining: self.rule.max_requests.saturating_sub(count),
            limit: self.rule.max_requests,
            reset_at,
            // 拒绝时建议等到当前窗口结束
            retry_after: (!allowed).then(|| ceil_secs(until_reset).max(1)),
            violation_count,
        }
    }

    /// 删除窗口已结束的条目
    pub fn purge_expired(&self) -> usize {
        self.purge_expired_at(Instant::now())
    }

    pub fn purge_expired_at(&self, now: Instant) -> usize {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, entry| now < entry.window_reset_at);
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// 启动周期清理
    pub fn spawn_sweeper(self: &Arc<Self>, period: Duration) -> PeriodicTask {
        let limiter = self.clone();
        PeriodicTask::spawn("rate-limit-sweep", period, move || {
            let limiter = limiter.clone();
            async move {
                let removed = limiter.purge_expired();
                if removed > 0 {
                    debug!(removed, "Purged idle rate limit entries");
                }
            }
        })
    }
}

fn ceil_secs(duration: Duration) -> u64 {
    let secs = duration.as_secs();
    if duration.subsec_nanos() > 0 { secs + 1 } else { secs }
}
