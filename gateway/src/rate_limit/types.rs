//! 数据结构定义

use std::time::Duration;

use tokio::time::Instant;

/// 限流规则
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitRule {
    /// 时间窗口内的最大请求数
    pub max_requests: u64,
    /// 时间窗口
    pub window: Duration,
}

impl Default for RateLimitRule {
    fn default() -> Self {
        Self {
            max_requests: 100,
            window: Duration::from_secs(60),
        }
    }
}

/// 每个键（`user:{id}` 或 `ip:{ip}`）一个条目
#[derive(Debug, Clone)]
pub struct RateLimitEntry {
    /// 当前窗口内的请求计数
    pub count: u64,
    /// 窗口重置时间
    pub window_reset_at: Instant,
    /// 累计超限次数，跨窗口保留
    pub violation_count: u64,
}

/// 限流检查结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitResult {
    /// 是否允许请求
    pub allowed: bool,
    /// 当前窗口内的请求计数
    pub count: u64,
    /// 剩余可用请求数
    pub remaining: u64,
    /// 限制的最大请求数
    pub limit: u64,
    /// 窗口重置时间（Unix 时间戳）
    pub reset_at: i64,
    /// 建议重试等待时间（秒，仅在拒绝时有效）
    pub retry_after: Option<u64>,
    /// 该键累计超限次数
    pub violation_count: u64,
}
