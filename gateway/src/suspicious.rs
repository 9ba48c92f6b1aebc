//! 可疑活动检测
//!
//! 按 IP 统计连续的 401/403 响应。跟踪期内达到阈值时发出一条高严重度审计事件，
//! 并进入临时的高度怀疑窗口；窗口内不再重复告警，窗口结束后计数归零。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::Response,
};
use mcpgw_common::PeriodicTask;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::debug;

use crate::audit::{AuditEventKind, SecurityAuditEvent};
use crate::context::{AuthenticatedUser, RequestContext};
use crate::state::AppState;

/// 触发告警的连续失败次数
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 5;
/// 跟踪期与怀疑窗口
pub const DEFAULT_SUSPICION_WINDOW: Duration = Duration::from_secs(15 * 60);

#[derive(Debug, Clone)]
struct SuspicionEntry {
    consecutive_failures: u32,
    first_failure_at: Instant,
    flagged_until: Option<Instant>,
}

/// 一次升级告警
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Escalation {
    pub failures: u32,
    pub window: Duration,
}

/// 进程内可疑活动跟踪器
#[derive(Debug)]
pub struct SuspiciousActivityTracker {
    threshold: u32,
    window: Duration,
    entries: Mutex<HashMap<String, SuspicionEntry>>,
}

impl Default for SuspiciousActivityTracker {
    fn default() -> Self {
        Self::new(DEFAULT_FAILURE_THRESHOLD, DEFAULT_SUSPICION_WINDOW)
    }
}

impl SuspiciousActivityTracker {
    pub fn new(threshold: u32, window: Duration) -> Self {
        Self {
            threshold: threshold.max(1),
            window,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// 记录一次 401/403；刚达到阈值时返回升级告警
    pub fn record_failure(&self, ip: &str) -> Option<Escalation> {
        self.record_failure_at(ip, Instant::now())
    }

    pub fn record_failure_at(&self, ip: &str, now: Instant) -> Option<Escalation> {
        let mut entries = self.entries.lock();
        let entry = entries.entry(ip.to_string()).or_insert(SuspicionEntry {
            consecutive_failures: 0,
            first_failure_at: now,
            flagged_until: None,
        });

        let window_over = match entry.flagged_until {
            Some(until) => now >= until,
            None => now.saturating_duration_since(entry.first_failure_at) >= self.window,
        };
        if window_over {
            *entry = SuspicionEntry {
                consecutive_failures: 0,
                first_failure_at: now,
                flagged_until: None,
            };
        }

        entry.consecutive_failures += 1;
        if entry.flagged_until.is_some() || entry.consecutive_failures < self.threshold {
            return None;
        }

        entry.flagged_until = Some(now + self.window);
        Some(Escalation {
            failures: entry.consecutive_failures,
            window: self.window,
        })
    }

    /// 成功响应打断连续失败；怀疑窗口内保持标记
    pub fn record_success(&self, ip: &str) {
        let mut entries = self.entries.lock();
        if entries.get(ip).is_some_and(|e| e.flagged_until.is_none()) {
            entries.remove(ip);
        }
    }

    pub fn is_flagged(&self, ip: &str) -> bool {
        let now = Instant::now();
        self.entries
            .lock()
            .get(ip)
            .and_then(|e| e.flagged_until)
            .is_some_and(|until| now < until)
    }

    /// 删除已过期的跟踪条目
    pub fn purge_expired_at(&self, now: Instant) -> usize {
        let window = self.window;
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, e| match e.flagged_until {
            Some(until) => now < until,
            None => now.saturating_duration_since(e.first_failure_at) < window,
        });
        before - entries.len()
    }

    pub fn spawn_sweeper(self: &Arc<Self>, period: Duration) -> PeriodicTask {
        let tracker = self.clone();
        PeriodicTask::spawn("suspicious-activity-sweep", period, move || {
            let tracker = tracker.clone();
            async move {
                let removed = tracker.purge_expired_at(Instant::now());
                if removed > 0 {
                    debug!(removed, "Purged suspicious activity entries");
                }
            }
        })
    }
}

/// 可疑活动检测中间件，观察内层返回的状态码
pub async fn suspicious_activity_middleware(
    State(state): State<AppState>,
    ctx: RequestContext,
    request: Request,
    next: Next,
) -> Response {
    let response = next.run(request).await;
    let status = response.status();

    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        if let Some(escalation) = state.suspicious.record_failure(&ctx.ip_address) {
            let user_id = response
                .extensions()
                .get::<AuthenticatedUser>()
                .map(|u| u.0.clone());
            state.audit.record(
                SecurityAuditEvent::new(AuditEventKind::SuspiciousActivity, &ctx)
                    .with_user(user_id)
                    .with_detail("reason", "repeated_auth_failures")
                    .with_detail("consecutiveFailures", escalation.failures)
                    .with_detail("lockoutSecs", escalation.window.as_secs()),
            );
        }
    } else if !status.is_client_error() && !status.is_server_error() {
        state.suspicious.record_success(&ctx.ip_address);
    }

    response
}
